use std::fmt;

/// Identifies a Merkle node `node` produced during snapshot `tree`.
///
/// Snapshot ids are monotonic starting at 0. The packed `(tree, node)`
/// ordering makes the lexicographically smallest id the numerically
/// smallest u64, which is what the first-occurrence map's monotonic-min
/// resolution relies on: an older snapshot always outranks a newer one,
/// and within one snapshot the lowest node index wins.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId {
    pub node: u32,
    pub tree: u32,
}

impl NodeId {
    /// Sentinel for a chunk reference that has not been resolved yet.
    pub const UNRESOLVED: NodeId = NodeId {
        node: u32::MAX,
        tree: u32::MAX,
    };

    pub fn new(node: u32, tree: u32) -> Self {
        NodeId { node, tree }
    }

    /// Pack as `tree` in the high half, `node` in the low half.
    pub fn pack(self) -> u64 {
        (u64::from(self.tree) << 32) | u64::from(self.node)
    }

    pub fn unpack(packed: u64) -> Self {
        NodeId {
            node: packed as u32,
            tree: (packed >> 32) as u32,
        }
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "({},{})", self.node, self.tree)
    }
}
