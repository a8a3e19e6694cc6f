//! Asynchronous-parallel consistency.
//!
//! No barrier between workers: any tracked worker may read or write
//! at any time, however far ahead of the others it is. Clocks are
//! still counted so the min clock can be monitored and checkpointed.

use crate::errors::ModelError;
use crate::message::Flag;
use crate::message::Message;
use crate::message::Range;
use crate::node::Node;
use crate::node::NodeId;
use crate::node::ThreadId;
use crate::progress::Clock;
use crate::progress::ProgressTracker;
use crate::storage::Storage;

use super::sender_tid;
use super::ConsistencyModel;
use super::ReplyQueue;

pub struct AspModel {
    model_id: u32,
    storage: Box<dyn Storage>,
    reply_queue: ReplyQueue,
    progress_tracker: ProgressTracker,
}

impl AspModel {
    pub fn new(model_id: u32, storage: Box<dyn Storage>, reply_queue: ReplyQueue) -> Self {
        Self {
            model_id,
            storage,
            reply_queue,
            progress_tracker: ProgressTracker::new(),
        }
    }

    /// Admission check for anything touching storage.
    fn admit(&self, msg: &Message) -> Result<ThreadId, ModelError> {
        sender_tid(msg)
            .filter(|tid| self.progress_tracker.check_thread_valid(*tid))
            .ok_or_else(|| ModelError::protocol_violation(self.model_id, msg.meta.sender))
    }
}

impl ConsistencyModel for AspModel {
    fn model_id(&self) -> u32 {
        self.model_id
    }

    fn clock(&mut self, msg: &Message) -> Result<Option<Clock>, ModelError> {
        let tid = self.admit(msg)?;
        Ok(self.progress_tracker.advance(tid)?)
    }

    fn add(&mut self, msg: &Message) -> Result<(), ModelError> {
        self.admit(msg)?;
        self.storage.add(msg);
        Ok(())
    }

    fn get(&mut self, msg: &Message) -> Result<(), ModelError> {
        self.admit(msg)?;
        self.reply_queue.push(self.storage.get(msg));
        Ok(())
    }

    fn reset_worker(&mut self, msg: &Message) -> Result<(), ModelError> {
        let malformed = || ModelError::MalformedPayload {
            model_id: self.model_id,
            what: "reset worker",
        };
        let [block] = msg.data.as_slice() else {
            return Err(malformed());
        };
        let tids = block.to_u32s().ok_or_else(malformed)?;
        self.progress_tracker.init(tids.into_iter().map(ThreadId));

        self.reply_queue.push(msg.reply_to(Flag::ResetWorkerInModel));
        Ok(())
    }

    /// Nothing beyond storage and the tracker to persist.
    fn dump(&mut self, _msg: &Message) -> Result<(), ModelError> {
        Ok(())
    }

    fn restore(&mut self) -> Result<(), ModelError> {
        Ok(())
    }

    /// Admission only depends on tracker membership, which the shard
    /// reconciles before calling this; there is no partitioned state
    /// to move.
    fn update(
        &mut self,
        _failed_node: Option<NodeId>,
        _nodes: &[Node],
        _range: Range,
    ) -> Result<(), ModelError> {
        Ok(())
    }

    fn tracker(&self) -> &ProgressTracker {
        &self.progress_tracker
    }

    fn tracker_mut(&mut self) -> &mut ProgressTracker {
        &mut self.progress_tracker
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::Mutex;

    use tokio::sync::mpsc::UnboundedReceiver;

    use super::*;
    use crate::errors::ProgressError;
    use crate::message::Block;

    /// Records what reaches storage.
    #[derive(Clone, Default)]
    struct RecordingStorage(Arc<Mutex<Vec<Message>>>);

    impl Storage for RecordingStorage {
        fn add(&mut self, msg: &Message) {
            self.0.lock().unwrap().push(msg.clone());
        }

        fn get(&self, msg: &Message) -> Message {
            msg.reply_to(Flag::Get).with_block(Block::from_f32s(&[1.5]))
        }
    }

    fn model() -> (AspModel, RecordingStorage, UnboundedReceiver<Message>) {
        let storage = RecordingStorage::default();
        let (queue, rx) = ReplyQueue::new();
        let model = AspModel::new(7, Box::new(storage.clone()), queue);
        (model, storage, rx)
    }

    fn reset(model: &mut AspModel, tids: &[u32]) {
        let msg = Message::new(0, 0, 7, Flag::ResetWorkerInModel).with_block(Block::from_u32s(tids));
        model.reset_worker(&msg).unwrap();
    }

    #[test]
    fn reset_worker_replaces_workers_and_acks() {
        let (mut model, _storage, mut rx) = model();
        reset(&mut model, &[1, 2, 3]);
        rx.try_recv().unwrap();

        let msg = Message::new(5, 0, 7, Flag::ResetWorkerInModel)
            .with_block(Block::from_u32s(&[10, 11, 12]));
        model.reset_worker(&msg).unwrap();

        assert!(!model.tracker().check_thread_valid(ThreadId(1)));
        assert!(model.tracker().check_thread_valid(ThreadId(10)));
        let ack = rx.try_recv().unwrap();
        assert_eq!(ack.meta.flag, Flag::ResetWorkerInModel);
        assert_eq!(ack.meta.recver, 5);
        assert_eq!(ack.meta.model_id, 7);
        assert!(ack.data.is_empty());
    }

    #[test]
    fn reset_worker_needs_one_block() {
        let (mut model, _storage, mut rx) = model();
        let msg = Message::new(5, 0, 7, Flag::ResetWorkerInModel);
        assert!(matches!(
            model.reset_worker(&msg),
            Err(ModelError::MalformedPayload { .. })
        ));
        let msg = msg.with_block(Block(vec![1, 2, 3]));
        assert!(model.reset_worker(&msg).is_err());
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn add_from_valid_worker_reaches_storage() {
        let (mut model, storage, mut rx) = model();
        reset(&mut model, &[1, 2]);
        rx.try_recv().unwrap();

        let msg = Message::new(1, 0, 7, Flag::Add).with_block(Block::from_u32s(&[3]));
        model.add(&msg).unwrap();
        assert_eq!(*storage.0.lock().unwrap(), vec![msg]);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn add_from_unknown_worker_never_reaches_storage() {
        let (mut model, storage, _rx) = model();
        reset(&mut model, &[1, 2]);

        let err = model
            .add(&Message::new(9, 0, 7, Flag::Add))
            .unwrap_err();
        assert!(err.is_protocol_violation());
        let err = model
            .add(&Message::new(-1, 0, 7, Flag::Add))
            .unwrap_err();
        assert!(err.is_protocol_violation());
        assert!(storage.0.lock().unwrap().is_empty());
    }

    #[test]
    fn get_replies_once_to_sender() {
        let (mut model, _storage, mut rx) = model();
        reset(&mut model, &[1, 2]);
        rx.try_recv().unwrap();

        model.get(&Message::new(2, 0, 7, Flag::Get)).unwrap();
        let reply = rx.try_recv().unwrap();
        assert_eq!(reply.meta.recver, 2);
        assert_eq!(reply.data[0].to_f32s(), Some(vec![1.5]));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn get_from_unknown_worker_is_rejected() {
        let (mut model, _storage, mut rx) = model();
        reset(&mut model, &[1, 2]);
        rx.try_recv().unwrap();

        assert!(model
            .get(&Message::new(3, 0, 7, Flag::Get))
            .unwrap_err()
            .is_protocol_violation());
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn clock_advances_sender() {
        let (mut model, _storage, _rx) = model();
        reset(&mut model, &[1, 2]);

        assert_eq!(model.clock(&Message::new(1, 0, 7, Flag::Clock)).unwrap(), None);
        assert_eq!(
            model.clock(&Message::new(2, 0, 7, Flag::Clock)).unwrap(),
            Some(Clock(1))
        );
        assert_eq!(model.get_progress(ThreadId(1)), Ok(Clock(1)));
        assert_eq!(
            model.get_progress(ThreadId(4)),
            Err(ProgressError::UnknownWorker(ThreadId(4)))
        );
        assert!(model
            .clock(&Message::new(4, 0, 7, Flag::Clock))
            .unwrap_err()
            .is_protocol_violation());
    }

    #[test]
    fn extension_points_do_nothing() {
        let (mut model, _storage, mut rx) = model();
        reset(&mut model, &[1000, 2000]);
        rx.try_recv().unwrap();

        model.dump(&Message::new(0, 0, 7, Flag::Checkpoint)).unwrap();
        model.restore().unwrap();
        model
            .update(Some(NodeId(1)), &[Node::new(2, "b", 1)], Range::new(0, 10))
            .unwrap();
        assert_eq!(model.tracker().num_threads(), 2);
        assert!(rx.try_recv().is_err());
    }
}
