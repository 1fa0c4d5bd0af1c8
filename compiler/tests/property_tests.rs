// Property-based tests for compiler and runtime invariants.
//
// Four categories:
// 1. Rate arithmetic: reduction, composition, and block scaling agree
// 2. Block-size validation: a decimating domain is rejected exactly when
//    the base block does not divide by its factor
// 3. Channel insertion: C1-C3 hold on generated partitioned graphs, and a
//    second insertion is a no-op
// 4. Channel FIFO: arbitrary interleavings of block writes and reads keep
//    order and the available-count bounds
//
// Uses proptest with explicit configuration to prevent CI flakiness.

use proptest::prelude::*;
use ptc::channel::{attached_pair, ChannelConfig, Transfer};
use ptc::config::ChannelPolicy;
use ptc::diag::codes;
use ptc::domain::validate;
use ptc::graph::{Graph, NodeKind, PortRef, RateChange};
use ptc::id::{NodeId, PartitionId};
use ptc::insert::{insert_channels, verify_insertion};
use ptc::pass::StageCert;
use ptc::rate::{gcd, scale_along_chain, Rate};

// ── Test helpers ────────────────────────────────────────────────────────────

fn channel_count(g: &Graph) -> usize {
    g.nodes().filter(|n| n.kind.is_channel()).count()
}

/// A straight chain of primitives with the given partition labels.
fn chain(partitions: &[u32]) -> Graph {
    let mut g = Graph::new();
    let mut prev: Option<NodeId> = None;
    let last = partitions.len() - 1;
    for (i, &p) in partitions.iter().enumerate() {
        let n_in = usize::from(i > 0);
        let n_out = usize::from(i < last);
        let id = g.add_primitive(None, &format!("n{i}"), n_in, n_out, PartitionId(p));
        if let Some(prev) = prev {
            g.connect(PortRef::new(prev, 0), PortRef::new(id, 0));
        }
        prev = Some(id);
    }
    g
}

/// One source fanning out to consumers with the given partition labels.
fn fan_out(src_partition: u32, consumers: &[u32]) -> Graph {
    let mut g = Graph::new();
    let src = g.add_primitive(None, "src", 0, 1, PartitionId(src_partition));
    for (i, &p) in consumers.iter().enumerate() {
        let c = g.add_primitive(None, &format!("c{i}"), 1, 0, PartitionId(p));
        g.connect(PortRef::new(src, 0), PortRef::new(c, 0));
    }
    g
}

fn decimator(factor: u32) -> Graph {
    let mut g = Graph::new();
    let src = g.add_primitive(None, "src", 0, 1, PartitionId(0));
    let dom = g.add_domain(None, "dec", Rate::downsample(factor));
    let rin = g.add_rate_input(dom, "rin", RateChange::downsample(factor), PartitionId(1));
    let inner = g.add_primitive(Some(dom), "inner", 1, 1, PartitionId(1));
    let rout = g.add_rate_output(dom, "rout", RateChange::upsample(factor), 1, PartitionId(1));
    let sink = g.add_primitive(None, "sink", 1, 0, PartitionId(0));
    g.connect(PortRef::new(src, 0), PortRef::new(rin, 0));
    g.connect(PortRef::new(rin, 0), PortRef::new(inner, 0));
    g.connect(PortRef::new(inner, 0), PortRef::new(rout, 0));
    g.connect(PortRef::new(rout, 0), PortRef::new(sink, 0));
    g
}

// ── 1. Rate arithmetic ──────────────────────────────────────────────────────

proptest! {
    #![proptest_config(ProptestConfig {
        cases: 256,
        max_shrink_iters: 200,
        .. ProptestConfig::default()
    })]

    #[test]
    fn reduced_is_coprime_and_equal(up in 1u32..10_000, down in 1u32..10_000) {
        let r = Rate::new(up, down).reduced();
        prop_assert!(r.is_coprime());
        prop_assert_eq!(r.up as u64 * down as u64, up as u64 * r.down as u64);
    }

    #[test]
    fn compose_multiplies_factors(
        a in (1u32..64, 1u32..64),
        b in (1u32..64, 1u32..64),
    ) {
        let outer = Rate::new(a.0, a.1).reduced();
        let inner = Rate::new(b.0, b.1).reduced();
        let c = outer.compose(inner).unwrap();
        prop_assert!(c.is_coprime());
        prop_assert_eq!(
            c.up as u64 * outer.down as u64 * inner.down as u64,
            c.down as u64 * outer.up as u64 * inner.up as u64
        );
    }

    #[test]
    fn chain_scaling_conserves_ratio(
        base in 1u64..4096,
        hops in prop::collection::vec((1u32..6, 1u32..6), 0..4),
    ) {
        let chain: Vec<Rate> = hops.iter().map(|&(u, d)| Rate::new(u, d).reduced()).collect();
        if let Ok(block) = scale_along_chain(base, &chain) {
            let ups: u128 = chain.iter().map(|r| r.up as u128).product();
            let downs: u128 = chain.iter().map(|r| r.down as u128).product();
            prop_assert_eq!(block as u128 * downs, base as u128 * ups);
        }
    }

    #[test]
    fn gcd_divides_both(a in 1u64..1_000_000, b in 1u64..1_000_000) {
        let g = gcd(a, b);
        prop_assert!(g > 0);
        prop_assert_eq!(a % g, 0);
        prop_assert_eq!(b % g, 0);
        prop_assert_eq!(gcd(a / g, b / g), 1);
    }
}

// ── 2. Block-size validation ────────────────────────────────────────────────

proptest! {
    #![proptest_config(ProptestConfig {
        cases: 128,
        max_shrink_iters: 100,
        .. ProptestConfig::default()
    })]

    #[test]
    fn decimator_block_rule(factor in 2u32..12, base in 1u32..256) {
        let g = decimator(factor);
        let r = validate(&g, &ChannelPolicy::default().with_block_size(base));
        let rejected = r.diagnostics.iter().any(|d| d.code == Some(codes::E0205));
        prop_assert_eq!(rejected, base % factor != 0, "{:?}", r.diagnostics);
        if !rejected {
            prop_assert!(r.diagnostics.is_empty(), "{:?}", r.diagnostics);
        }
    }
}

// ── 3. Channel insertion ────────────────────────────────────────────────────

proptest! {
    #![proptest_config(ProptestConfig {
        cases: 128,
        max_shrink_iters: 100,
        .. ProptestConfig::default()
    })]

    #[test]
    fn chain_insertion_meets_obligations(
        partitions in prop::collection::vec(0u32..4, 2..10),
        block in 1u32..64,
        multiplier in 2u32..5,
    ) {
        let mut g = chain(&partitions);
        let policy = ChannelPolicy::default()
            .with_block_size(block)
            .with_capacity_multiplier(multiplier);
        let v = validate(&g, &policy);
        prop_assert!(v.diagnostics.is_empty(), "{:?}", v.diagnostics);

        let crossings = partitions.windows(2).filter(|w| w[0] != w[1]).count();
        let first = insert_channels(&mut g, &v.analysis, &policy);
        prop_assert!(first.diagnostics.is_empty(), "{:?}", first.diagnostics);
        prop_assert_eq!(first.inserted.len(), crossings);
        prop_assert_eq!(channel_count(&g), crossings);

        let cert = verify_insertion(&g);
        prop_assert!(cert.all_pass(), "failed: {:?}", cert.failed());
        for node in g.nodes() {
            if let NodeKind::Channel(spec) = &node.kind {
                prop_assert_eq!(spec.block_size, block);
                prop_assert_eq!(spec.capacity, block * multiplier);
            }
        }

        let v = validate(&g, &policy);
        prop_assert!(v.diagnostics.is_empty(), "{:?}", v.diagnostics);
        let second = insert_channels(&mut g, &v.analysis, &policy);
        prop_assert!(second.inserted.is_empty());
        prop_assert_eq!(channel_count(&g), crossings);
    }

    #[test]
    fn shared_fanout_one_channel_per_partition(
        src in 0u32..3,
        consumers in prop::collection::vec(0u32..3, 1..8),
        share in any::<bool>(),
    ) {
        let mut g = fan_out(src, &consumers);
        let policy = ChannelPolicy::default().with_share_fanout(share);
        let v = validate(&g, &policy);
        prop_assert!(v.diagnostics.is_empty(), "{:?}", v.diagnostics);
        insert_channels(&mut g, &v.analysis, &policy);

        let crossing = consumers.iter().filter(|&&p| p != src);
        let expected = if share {
            let mut distinct: Vec<u32> = crossing.copied().collect();
            distinct.sort_unstable();
            distinct.dedup();
            distinct.len()
        } else {
            crossing.count()
        };
        prop_assert_eq!(channel_count(&g), expected);
        let cert = verify_insertion(&g);
        prop_assert!(cert.all_pass(), "failed: {:?}", cert.failed());
    }
}

// ── 4. Channel FIFO ─────────────────────────────────────────────────────────

proptest! {
    #![proptest_config(ProptestConfig {
        cases: 128,
        max_shrink_iters: 100,
        .. ProptestConfig::default()
    })]

    #[test]
    fn interleaved_transfers_keep_fifo(
        block in 1usize..8,
        multiplier in 1usize..5,
        ops in prop::collection::vec(any::<bool>(), 1..200),
    ) {
        let capacity = block * multiplier;
        let (mut tx, mut rx) =
            attached_pair::<u32>(ChannelConfig::new("prop", capacity, block)).unwrap();
        let mut next = 0u32;
        let mut expected = 0u32;
        let mut out = vec![0u32; block];

        for write in ops {
            let before = tx.available();
            if write {
                let data: Vec<u32> = (next..next + block as u32).collect();
                match tx.try_write(&data).unwrap() {
                    Transfer::Done => {
                        next += block as u32;
                        prop_assert_eq!(tx.available(), before + block);
                    }
                    Transfer::WouldBlock => {
                        prop_assert!(capacity - before < block);
                        prop_assert_eq!(tx.available(), before);
                    }
                }
            } else {
                match rx.try_read(&mut out).unwrap() {
                    Transfer::Done => {
                        let want: Vec<u32> = (expected..expected + block as u32).collect();
                        prop_assert_eq!(&out, &want);
                        expected += block as u32;
                        prop_assert_eq!(rx.available(), before - block);
                    }
                    Transfer::WouldBlock => {
                        prop_assert!(before < block);
                        prop_assert_eq!(rx.available(), before);
                    }
                }
            }
            prop_assert!(tx.available() <= capacity);
            prop_assert_eq!(tx.available(), (next - expected) as usize);
        }
    }
}
