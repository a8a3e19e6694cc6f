//! Consistency models: how a shard admits reads and writes.
//!
//! Every model in the family (asynchronous, bulk-synchronous,
//! stale-bounded) exposes the same operations through
//! [`ConsistencyModel`], so a shard can be driven without knowing
//! which one it holds. Only the asynchronous model, [`AspModel`], is
//! implemented.
//!
//! A model exclusively owns its [`ProgressTracker`] and [`Storage`];
//! it is driven by one shard task and needs no locking. Replies leave
//! through a shared [`ReplyQueue`].

pub mod asp;

pub use asp::AspModel;

use tokio::sync::mpsc;

use crate::errors::ModelError;
use crate::errors::ProgressError;
use crate::message::Message;
use crate::message::Range;
use crate::node::Node;
use crate::node::NodeId;
use crate::node::ThreadId;
use crate::progress::Clock;
use crate::progress::ProgressTracker;

/// Operations every consistency model supports.
pub trait ConsistencyModel: Send {
    fn model_id(&self) -> u32;

    /// The sender finished an iteration.
    ///
    /// Returns the new min clock if this moved it. Stale-bounded
    /// models gate fast workers from here.
    fn clock(&mut self, msg: &Message) -> Result<Option<Clock>, ModelError>;

    /// Apply the sender's update to storage. Produces no reply.
    fn add(&mut self, msg: &Message) -> Result<(), ModelError>;

    /// Read from storage and queue exactly one reply to the sender.
    fn get(&mut self, msg: &Message) -> Result<(), ModelError>;

    /// Replace the worker set with the ids packed in the payload and
    /// acknowledge to the sender.
    fn reset_worker(&mut self, msg: &Message) -> Result<(), ModelError>;

    /// Persist state the model holds beyond storage and tracker.
    fn dump(&mut self, msg: &Message) -> Result<(), ModelError>;

    /// Reload what [`Self::dump`] persisted.
    fn restore(&mut self) -> Result<(), ModelError>;

    /// Reconcile model-held state after a membership change. The
    /// tracker has already been reconciled when this is called.
    fn update(
        &mut self,
        failed_node: Option<NodeId>,
        nodes: &[Node],
        range: Range,
    ) -> Result<(), ModelError>;

    fn get_progress(&self, tid: ThreadId) -> Result<Clock, ProgressError> {
        self.tracker().progress(tid)
    }

    fn tracker(&self) -> &ProgressTracker;

    fn tracker_mut(&mut self) -> &mut ProgressTracker;
}

impl<M> ConsistencyModel for Box<M>
where
    M: ConsistencyModel + ?Sized,
{
    fn model_id(&self) -> u32 {
        (**self).model_id()
    }

    fn clock(&mut self, msg: &Message) -> Result<Option<Clock>, ModelError> {
        (**self).clock(msg)
    }

    fn add(&mut self, msg: &Message) -> Result<(), ModelError> {
        (**self).add(msg)
    }

    fn get(&mut self, msg: &Message) -> Result<(), ModelError> {
        (**self).get(msg)
    }

    fn reset_worker(&mut self, msg: &Message) -> Result<(), ModelError> {
        (**self).reset_worker(msg)
    }

    fn dump(&mut self, msg: &Message) -> Result<(), ModelError> {
        (**self).dump(msg)
    }

    fn restore(&mut self) -> Result<(), ModelError> {
        (**self).restore()
    }

    fn update(
        &mut self,
        failed_node: Option<NodeId>,
        nodes: &[Node],
        range: Range,
    ) -> Result<(), ModelError> {
        (**self).update(failed_node, nodes, range)
    }

    fn tracker(&self) -> &ProgressTracker {
        (**self).tracker()
    }

    fn tracker_mut(&mut self) -> &mut ProgressTracker {
        (**self).tracker_mut()
    }
}

/// Outbound replies from every shard.
///
/// Cheap to clone; each shard holds its own handle. Pushing never
/// blocks and replies from one shard stay in order.
#[derive(Debug, Clone)]
pub struct ReplyQueue(mpsc::UnboundedSender<Message>);

impl ReplyQueue {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Message>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self(tx), rx)
    }

    pub fn push(&self, msg: Message) {
        if let Err(err) = self.0.send(msg) {
            tracing::warn!(
                "Reply to {} dropped; reply queue is closed",
                err.0.meta.recver
            );
        }
    }
}

/// The worker a message claims to come from, if the id is one.
pub(crate) fn sender_tid(msg: &Message) -> Option<ThreadId> {
    u32::try_from(msg.meta.sender).ok().map(ThreadId)
}

#[test]
fn negative_sender_is_not_a_thread() {
    use crate::message::Flag;

    assert_eq!(sender_tid(&Message::new(-1, 0, 0, Flag::Add)), None);
    assert_eq!(
        sender_tid(&Message::new(1002, 0, 0, Flag::Add)),
        Some(ThreadId(1002))
    );
}

#[test]
fn reply_queue_is_fifo() {
    use crate::message::Flag;

    let (queue, mut rx) = ReplyQueue::new();
    let other = queue.clone();
    queue.push(Message::new(0, 1, 0, Flag::Get));
    queue.push(Message::new(0, 2, 0, Flag::Get));
    other.push(Message::new(0, 3, 0, Flag::Get));
    let order: Vec<i32> = std::iter::from_fn(|| rx.try_recv().ok())
        .map(|msg| msg.meta.recver)
        .collect();
    assert_eq!(order, vec![1, 2, 3]);
}
