// id.rs — Stable identifiers for graph artifacts
//
// Nodes and arcs are addressed by integer IDs into the graph arena; ports are
// addressed by (NodeId, index) pairs. Partitions are plain integer labels with
// one reserved value for the external I/O partition.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Stable identifier for a node in the graph arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(pub u32);

/// Stable identifier for an arc in the graph arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ArcId(pub u32);

/// Partition label. One OS thread runs each distinct label.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PartitionId(pub u32);

impl PartitionId {
    /// Reserved label of the external I/O partition.
    pub const IO: PartitionId = PartitionId(u32::MAX);

    pub fn is_io(self) -> bool {
        self == Self::IO
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

impl fmt::Display for ArcId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "a{}", self.0)
    }
}

impl fmt::Display for PartitionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_io() {
            write!(f, "io")
        } else {
            write!(f, "p{}", self.0)
        }
    }
}

/// Allocator for stable IDs. Produces monotonically increasing IDs in
/// allocation order, ensuring deterministic assignment.
#[derive(Debug, Default, Clone)]
pub struct IdAllocator {
    next_node: u32,
    next_arc: u32,
}

impl IdAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn alloc_node(&mut self) -> NodeId {
        let id = NodeId(self.next_node);
        self.next_node += 1;
        id
    }

    pub fn alloc_arc(&mut self) -> ArcId {
        let id = ArcId(self.next_arc);
        self.next_arc += 1;
        id
    }

    /// Bump the counters past IDs that already exist (after import).
    pub fn reserve(&mut self, node: Option<NodeId>, arc: Option<ArcId>) {
        if let Some(n) = node {
            self.next_node = self.next_node.max(n.0 + 1);
        }
        if let Some(a) = arc {
            self.next_arc = self.next_arc.max(a.0 + 1);
        }
    }
}
