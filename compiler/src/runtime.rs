// runtime.rs — In-process execution of a ProgramPlan
//
// Creates every Channel in the plan, hands each endpoint to exactly one
// owner (a partition unit or an I/O bundle), and spawns one named OS thread
// per partition plus one for the I/O bridge. Threads are peers; nothing
// supervises them beyond the shared cancellation token.
//
// Preconditions: `plan` passed `verify_plan` (P1-P2); every channel's element
//                type, where known, matches the runtime sample type `T`.
// Postconditions: `RuntimeHandle::join` returns one report per thread.
// Failure modes: `RuntimeError` before any thread starts work; runtime
//                faults appear in the per-thread reports.
// Side effects: spawns threads.

use std::collections::BTreeMap;
use std::io;
use std::thread::{self, JoinHandle};

use thiserror::Error;
use tracing::{debug, info};

use crate::bridge::{BridgeReport, InputBundle, IoBridge, OutputBundle};
use crate::channel::{channel, ChannelConfig, ChannelError, Consumer, Producer};
use crate::config::PollConfig;
use crate::graph::{ElemType, IoDirection};
use crate::id::{NodeId, PartitionId};
use crate::poll::CancelToken;
use crate::sample::Sample;
use crate::synth::{PartitionPlan, ProgramPlan};
use crate::transport::Transport;
use crate::worker::{Kernel, PartitionUnit, UnitReport};

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("channel {channel} carries {found}, runtime samples are {expected}")]
    ElemMismatch {
        channel: NodeId,
        expected: ElemType,
        found: ElemType,
    },
    #[error("no kernel registered for partition {0}")]
    MissingKernel(PartitionId),
    #[error("no transport registered for bundle '{0}'")]
    MissingTransport(String),
    #[error("channel {0} endpoint is missing or claimed twice")]
    Endpoint(NodeId),
    #[error("bundle '{bundle}' member {member} must read exactly one channel")]
    OutputFanIn { bundle: String, member: u32 },
    #[error(transparent)]
    Channel(#[from] ChannelError),
    #[error("failed to spawn thread '{name}': {source}")]
    Spawn {
        name: String,
        #[source]
        source: io::Error,
    },
    #[error("thread '{0}' panicked")]
    Panicked(String),
}

/// Builder for a running program.
pub struct Runtime<T> {
    plan: ProgramPlan,
    kernels: BTreeMap<PartitionId, Box<dyn Kernel<T>>>,
    transports: BTreeMap<String, Box<dyn Transport>>,
    poll: PollConfig,
}

/// Per-thread reports collected by `RuntimeHandle::join`.
#[derive(Debug)]
pub struct RunReport {
    pub units: Vec<UnitReport>,
    pub io: Option<BridgeReport>,
}

pub struct RuntimeHandle {
    cancel: CancelToken,
    units: Vec<(String, JoinHandle<UnitReport>)>,
    io: Option<(String, JoinHandle<BridgeReport>)>,
}

type Endpoints<T> = BTreeMap<NodeId, (Option<Producer<T>>, Option<Consumer<T>>)>;

impl<T: Sample> Runtime<T> {
    pub fn new(plan: ProgramPlan) -> Self {
        Runtime {
            plan,
            kernels: BTreeMap::new(),
            transports: BTreeMap::new(),
            poll: PollConfig::default(),
        }
    }

    /// Kernel for a partition's internal subgraph. It receives one block per
    /// input channel and fills one block per output channel, both in
    /// channel-ID order, with the partition's local channels after them.
    pub fn kernel(mut self, partition: PartitionId, kernel: impl Kernel<T> + 'static) -> Self {
        self.kernels.insert(partition, Box::new(kernel));
        self
    }

    pub fn transport(mut self, bundle: impl Into<String>, transport: impl Transport + 'static) -> Self {
        self.transports.insert(bundle.into(), Box::new(transport));
        self
    }

    pub fn poll_config(mut self, poll: PollConfig) -> Self {
        self.poll = poll;
        self
    }

    pub fn spawn(self) -> Result<RuntimeHandle, RuntimeError> {
        self.spawn_with(CancelToken::new())
    }

    pub fn spawn_with(mut self, cancel: CancelToken) -> Result<RuntimeHandle, RuntimeError> {
        self.check_types()?;
        let mut endpoints = self.make_channels()?;

        let mut units = Vec::new();
        for plan in &self.plan.partitions {
            let kernel = self
                .kernels
                .remove(&plan.partition)
                .ok_or(RuntimeError::MissingKernel(plan.partition))?;
            units.push(build_unit(plan, kernel, &mut endpoints)?);
        }
        let bridge = self.build_bridge(&mut endpoints)?;

        let poll = self.poll;
        let mut handle = RuntimeHandle {
            cancel: cancel.clone(),
            units: Vec::new(),
            io: None,
        };
        for unit in units {
            let name = format!("ptc-partition-{}", unit.partition().0);
            let token = cancel.clone();
            match thread::Builder::new()
                .name(name.clone())
                .spawn(move || unit.run(&token, &poll))
            {
                Ok(join) => handle.units.push((name, join)),
                Err(source) => {
                    handle.cancel();
                    return Err(RuntimeError::Spawn { name, source });
                }
            }
        }
        if let Some(bridge) = bridge {
            let name = "ptc-io".to_string();
            let token = cancel.clone();
            match thread::Builder::new()
                .name(name.clone())
                .spawn(move || bridge.run(&token, &poll))
            {
                Ok(join) => handle.io = Some((name, join)),
                Err(source) => {
                    handle.cancel();
                    return Err(RuntimeError::Spawn { name, source });
                }
            }
        }
        info!(
            partitions = handle.units.len(),
            io = handle.io.is_some(),
            "runtime started"
        );
        Ok(handle)
    }

    fn check_types(&self) -> Result<(), RuntimeError> {
        let expected = T::elem_type();
        for ch in &self.plan.channels {
            if let Some(found) = &ch.elem {
                if *found != expected {
                    return Err(RuntimeError::ElemMismatch {
                        channel: ch.node,
                        expected,
                        found: found.clone(),
                    });
                }
            }
        }
        Ok(())
    }

    fn make_channels(&self) -> Result<Endpoints<T>, RuntimeError> {
        let mut endpoints = BTreeMap::new();
        for ch in &self.plan.channels {
            let config = ChannelConfig::new(
                ch.name.clone(),
                ch.capacity as usize,
                ch.block_size as usize,
            );
            let (tx, rx) = channel(config)?;
            endpoints.insert(ch.node, (Some(tx), Some(rx)));
        }
        debug!(channels = endpoints.len(), "channels created");
        Ok(endpoints)
    }

    fn build_bridge(&mut self, endpoints: &mut Endpoints<T>) -> Result<Option<IoBridge<T>>, RuntimeError> {
        let Some(io) = &self.plan.io else {
            return Ok(None);
        };
        let mut bridge = IoBridge::new();
        for plan in &io.bundles {
            let transport = self
                .transports
                .remove(&plan.name)
                .ok_or_else(|| RuntimeError::MissingTransport(plan.name.clone()))?;
            match plan.direction {
                IoDirection::In => {
                    let mut bundle = InputBundle::new(plan.name.clone(), transport);
                    for m in &plan.members {
                        let producers = m
                            .channels
                            .iter()
                            .map(|&c| take_producer(endpoints, c))
                            .collect::<Result<Vec<_>, _>>()?;
                        bundle = bundle.member(m.block_size as usize, producers);
                    }
                    bridge = bridge.with_bundle(bundle);
                }
                IoDirection::Out => {
                    let mut bundle = OutputBundle::new(plan.name.clone(), transport);
                    for m in &plan.members {
                        let [c] = m.channels.as_slice() else {
                            return Err(RuntimeError::OutputFanIn {
                                bundle: plan.name.clone(),
                                member: m.member,
                            });
                        };
                        bundle = bundle.member(take_consumer(endpoints, *c)?);
                    }
                    bridge = bridge.with_bundle(bundle);
                }
            }
        }
        if let Some(plan) = &io.unit {
            let kernel = self
                .kernels
                .remove(&PartitionId::IO)
                .ok_or(RuntimeError::MissingKernel(PartitionId::IO))?;
            bridge = bridge.with_unit(build_unit(plan, kernel, endpoints)?);
        }
        Ok(Some(bridge))
    }
}

fn build_unit<T: Sample>(
    plan: &PartitionPlan,
    kernel: Box<dyn Kernel<T>>,
    endpoints: &mut Endpoints<T>,
) -> Result<PartitionUnit<T>, RuntimeError> {
    let inputs = plan
        .inputs
        .iter()
        .map(|&c| take_consumer(endpoints, c))
        .collect::<Result<Vec<_>, _>>()?;
    let outputs = plan
        .outputs
        .iter()
        .map(|&c| take_producer(endpoints, c))
        .collect::<Result<Vec<_>, _>>()?;
    let locals = plan
        .locals
        .iter()
        .map(|&c| Ok((take_producer(endpoints, c)?, take_consumer(endpoints, c)?)))
        .collect::<Result<Vec<_>, RuntimeError>>()?;
    Ok(PartitionUnit::new(plan.partition, inputs, outputs, kernel).with_locals(locals))
}

fn take_producer<T>(endpoints: &mut Endpoints<T>, id: NodeId) -> Result<Producer<T>, RuntimeError> {
    endpoints
        .get_mut(&id)
        .and_then(|(tx, _)| tx.take())
        .ok_or(RuntimeError::Endpoint(id))
}

fn take_consumer<T>(endpoints: &mut Endpoints<T>, id: NodeId) -> Result<Consumer<T>, RuntimeError> {
    endpoints
        .get_mut(&id)
        .and_then(|(_, rx)| rx.take())
        .ok_or(RuntimeError::Endpoint(id))
}

impl RuntimeHandle {
    /// Ask every thread to stop at its next poll.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Wait for every thread and collect their reports.
    pub fn join(self) -> Result<RunReport, RuntimeError> {
        let mut units = Vec::with_capacity(self.units.len());
        for (name, join) in self.units {
            units.push(join.join().map_err(|_| RuntimeError::Panicked(name))?);
        }
        let io = match self.io {
            Some((name, join)) => Some(join.join().map_err(|_| RuntimeError::Panicked(name))?),
            None => None,
        };
        Ok(RunReport { units, io })
    }
}
