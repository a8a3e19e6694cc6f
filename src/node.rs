//! Cluster membership and the node/thread id convention.
//!
//! Every worker thread in the cluster is named by a [`ThreadId`]
//! derived from the [`NodeId`] of the process it runs in:
//!
//! ```text
//! thread_id = node_id * MAX_THREADS_PER_NODE + local_index
//! ```
//!
//! The id mapping service on the worker side uses the same
//! arithmetic, so this module is the only place it is allowed to live.

use std::fmt;

use serde::Deserialize;
use serde::Serialize;

/// Upper bound on worker threads a single node may host.
pub const MAX_THREADS_PER_NODE: u32 = 1000;

/// Identifies a process in the cluster.
#[derive(Debug, Copy, Clone, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(pub u32);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

/// Identifies a worker thread across the whole cluster.
#[derive(Debug, Copy, Clone, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ThreadId(pub u32);

impl ThreadId {
    /// The thread at `local_index` on `node`.
    ///
    /// `None` if the id does not fit in a `u32`.
    pub fn of(node: NodeId, local_index: u32) -> Option<Self> {
        debug_assert!(local_index < MAX_THREADS_PER_NODE);
        node.0
            .checked_mul(MAX_THREADS_PER_NODE)
            .and_then(|base| base.checked_add(local_index))
            .map(Self)
    }

    /// The node this thread runs on.
    pub fn node(&self) -> NodeId {
        NodeId(self.0 / MAX_THREADS_PER_NODE)
    }

    /// Position of this thread within its node.
    pub fn local_index(&self) -> u32 {
        self.0 % MAX_THREADS_PER_NODE
    }

    /// The thread with the same local index on another node.
    ///
    /// Used to hand a departed or existing thread's progress to its
    /// counterpart on a newly added node.
    pub fn on_node(&self, node: NodeId) -> Option<Self> {
        Self::of(node, self.local_index())
    }
}

impl fmt::Display for ThreadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

/// A member of the cluster as reported by node discovery.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    pub id: NodeId,
    pub hostname: String,
    pub port: u16,
    pub is_master: bool,
}

impl Node {
    pub fn new(id: u32, hostname: impl Into<String>, port: u16) -> Self {
        Self {
            id: NodeId(id),
            hostname: hostname.into(),
            port,
            is_master: false,
        }
    }
}

/// Two records describe the same node if they agree on where it
/// lives; mastership can move without changing identity.
impl PartialEq for Node {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id && self.hostname == other.hostname && self.port == other.port
    }
}

impl Eq for Node {}

impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Node: {{ id={} hostname={} port={} }}",
            self.id, self.hostname, self.port
        )
    }
}

#[test]
fn thread_id_arithmetic_round_trips() {
    let tid = ThreadId::of(NodeId(3), 7).unwrap();
    assert_eq!(tid, ThreadId(3007));
    assert_eq!(tid.node(), NodeId(3));
    assert_eq!(tid.local_index(), 7);
}

#[test]
fn on_node_keeps_local_index() {
    let tid = ThreadId(1002);
    assert_eq!(tid.on_node(NodeId(4)), Some(ThreadId(4002)));
}

#[test]
fn thread_ids_past_u32_do_not_exist() {
    assert_eq!(ThreadId::of(NodeId(4_294_967), 295), Some(ThreadId(u32::MAX)));
    assert_eq!(ThreadId::of(NodeId(4_294_967), 296), None);
    assert_eq!(ThreadId(0).on_node(NodeId(5_000_000)), None);
}

#[test]
fn node_equality_ignores_mastership() {
    let mut a = Node::new(1, "worker-1", 4000);
    let b = Node::new(1, "worker-1", 4000);
    a.is_master = true;
    assert_eq!(a, b);
    assert_ne!(a, Node::new(1, "worker-1", 4001));
}

#[test]
fn node_display() {
    let node = Node::new(2, "host", 9999);
    assert_eq!(node.to_string(), "Node: { id=2 hostname=host port=9999 }");
}
