use clap::Parser;
use std::path::PathBuf;
use std::process;

use ptc::config::ChannelPolicy;
use ptc::graph::Graph;
use ptc::pass::PassId;
use ptc::pipeline::{run_pipeline, CompilationState};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, clap::ValueEnum)]
enum EmitStage {
    /// Validate only; print diagnostics.
    Check,
    /// Channelized graph as JSON.
    Graph,
    /// Channelized graph as Graphviz DOT.
    Dot,
    /// Per-partition plan, human readable.
    Plan,
    /// Per-partition plan as JSON.
    PlanJson,
    /// Provenance hashes.
    BuildInfo,
}

impl EmitStage {
    fn terminal(&self) -> PassId {
        match self {
            EmitStage::Check | EmitStage::BuildInfo => PassId::Validate,
            EmitStage::Graph | EmitStage::Dot => PassId::InsertChannels,
            EmitStage::Plan | EmitStage::PlanJson => PassId::Synthesize,
        }
    }
}

#[derive(Parser, Debug)]
#[command(
    name = "ptc",
    version,
    about = "Partitioned Thread Compiler — validates clock domains, inserts channels, and plans one thread per partition"
)]
struct Cli {
    /// Input graph document (JSON)
    graph: PathBuf,

    /// Output file path (stdout when omitted)
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Output stage
    #[arg(long, value_enum, default_value_t = EmitStage::Plan)]
    emit: EmitStage,

    /// Base-domain block size (overrides the document's policy)
    #[arg(long)]
    block_size: Option<u32>,

    /// Channel capacity as a multiple of block size
    #[arg(long)]
    capacity_multiplier: Option<u32>,

    /// Share one channel between fan-out arcs with identical consumers
    #[arg(long)]
    share_fanout: bool,

    /// Log pass timing and inserted channels
    #[arg(long)]
    verbose: bool,
}

fn main() {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "warn" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    // ── Load graph ──
    let text = match std::fs::read_to_string(&cli.graph) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("ptc: error: {}: {}", cli.graph.display(), e);
            process::exit(2);
        }
    };
    let (graph, doc_policy) = match Graph::from_json(&text) {
        Ok(g) => g,
        Err(e) => {
            eprintln!("ptc: error: {}: {}", cli.graph.display(), e);
            process::exit(2);
        }
    };

    let mut policy = doc_policy.unwrap_or_default();
    if let Some(n) = cli.block_size {
        policy = policy.with_block_size(n);
    }
    if let Some(n) = cli.capacity_multiplier {
        policy = policy.with_capacity_multiplier(n);
    }
    if cli.share_fanout {
        policy = policy.with_share_fanout(true);
    }

    tracing::debug!(
        nodes = graph.node_count(),
        arcs = graph.arc_count(),
        ?policy,
        emit = ?cli.emit,
        "graph loaded"
    );

    // ── Compile ──
    let mut state = CompilationState::new(graph, policy);
    let result = run_pipeline(&mut state, cli.emit.terminal(), |_, diags| {
        for d in diags {
            eprintln!("ptc: {}", d);
        }
    });
    if result.is_err() || state.has_error {
        process::exit(1);
    }

    // ── Emit ──
    let out = match cli.emit {
        EmitStage::Check => return,
        EmitStage::BuildInfo => match &state.provenance {
            Some(p) => p.to_json(),
            None => {
                eprintln!("ptc: error: provenance unavailable");
                process::exit(2);
            }
        },
        EmitStage::Graph => match state.graph.to_json(Some(state.policy)) {
            Ok(s) => s + "\n",
            Err(e) => {
                eprintln!("ptc: error: {}", e);
                process::exit(2);
            }
        },
        EmitStage::Dot => ptc::dot::emit_dot(&state.graph),
        EmitStage::Plan => state
            .plan
            .as_ref()
            .map(|p| p.to_string())
            .unwrap_or_default(),
        EmitStage::PlanJson => match serde_json::to_string_pretty(&state.plan) {
            Ok(s) => s + "\n",
            Err(e) => {
                eprintln!("ptc: error: {}", e);
                process::exit(2);
            }
        },
    };

    match &cli.output {
        Some(path) => {
            if let Err(e) = std::fs::write(path, out) {
                eprintln!("ptc: error: {}: {}", path.display(), e);
                process::exit(2);
            }
        }
        None => print!("{out}"),
    }
}
