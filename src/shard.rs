//! Definition of a shard: the single thread that drives one
//! consistency model.
//!
//! All requests for a model, whatever their flag, arrive on one
//! channel and are handled to completion one at a time, so neither
//! the model nor its tracker need locks. Different shards run on
//! different threads and share nothing but the reply queue.

use tokio::sync::mpsc;
use tokio::sync::oneshot;

use crate::errors::prepend_tname;
use crate::errors::ModelError;
use crate::message::Flag;
use crate::message::Message;
use crate::message::Range;
use crate::metrics::ShardMetrics;
use crate::model::ConsistencyModel;
use crate::node::Node;
use crate::node::NodeId;
use crate::progress::ProgressSnapshot;
use crate::recovery::store::ProgressStore;
use crate::with_timer;

/// Work for a shard.
#[derive(Debug)]
pub(crate) enum ShardRequest {
    /// A message from a worker, routed by model id.
    Deliver(Message),
    /// Cluster membership changed.
    MembershipChange {
        failed_node: Option<NodeId>,
        nodes: Vec<Node>,
        range: Range,
    },
    /// Report the tracker's current state.
    Inspect(oneshot::Sender<ProgressSnapshot>),
}

enum Control {
    Continue,
    Exit,
}

/// Only messages refused for coming from a non-member count towards
/// `rejected_count`; failed checkpoints and bad payloads do not.
fn counts_as_rejected(err: &ModelError) -> bool {
    err.is_protocol_violation()
}

pub(crate) struct Shard {
    model: Box<dyn ConsistencyModel>,
    store: Box<dyn ProgressStore>,
    /// Whether dump and restore are enabled; restore leaves the
    /// tracker alone when they are not.
    checkpointing: bool,
    /// Node whose threads inherit restored clocks.
    scale_node: Option<NodeId>,
    metrics: ShardMetrics,
}

impl Shard {
    pub(crate) fn new(
        model: Box<dyn ConsistencyModel>,
        store: Box<dyn ProgressStore>,
        checkpointing: bool,
        scale_node: Option<NodeId>,
    ) -> Self {
        let metrics = ShardMetrics::new(model.model_id());
        Self {
            model,
            store,
            checkpointing,
            scale_node,
            metrics,
        }
    }

    /// Serve requests until told to exit or every sender is gone.
    ///
    /// With checkpointing enabled, progress is restored first.
    ///
    /// Any error stops the shard: it means this shard's view of the
    /// cluster can no longer be trusted.
    pub(crate) fn run(
        mut self,
        mut rx: mpsc::UnboundedReceiver<ShardRequest>,
    ) -> Result<(), ModelError> {
        let model_id = self.model.model_id();
        tracing::info!("Shard {model_id} start");

        let res = self.serve(&mut rx);
        match &res {
            Ok(()) => tracing::info!("Shard {model_id} stop"),
            Err(err) => {
                if counts_as_rejected(err) {
                    self.metrics.rejected_count.add(1, &self.metrics.labels);
                }
                tracing::error!("{}", prepend_tname(format!("Shard {model_id} failed: {err}")));
            }
        }
        res
    }

    fn serve(
        &mut self,
        rx: &mut mpsc::UnboundedReceiver<ShardRequest>,
    ) -> Result<(), ModelError> {
        if self.checkpointing {
            self.restore()?;
        }
        while let Some(req) = rx.blocking_recv() {
            if let Control::Exit = self.handle(req)? {
                break;
            }
        }
        Ok(())
    }

    fn handle(&mut self, req: ShardRequest) -> Result<Control, ModelError> {
        match req {
            ShardRequest::Deliver(msg) => return self.deliver(msg),
            ShardRequest::MembershipChange {
                failed_node,
                nodes,
                range,
            } => {
                self.model.tracker_mut().update(failed_node, &nodes);
                self.model.update(failed_node, &nodes, range)?;
            }
            ShardRequest::Inspect(reply) => {
                // The asker may have given up waiting.
                let _ = reply.send(self.model.tracker().snapshot());
            }
        }
        Ok(Control::Continue)
    }

    fn deliver(&mut self, msg: Message) -> Result<Control, ModelError> {
        tracing::trace!("Handling {:?} from {}", msg.meta.flag, msg.meta.sender);
        let labels = &self.metrics.labels;
        match msg.meta.flag {
            Flag::Exit => return Ok(Control::Exit),
            Flag::Clock => {
                let changed = self.model.clock(&msg)?;
                self.metrics.clock_count.add(1, labels);
                if let Some(min_clock) = changed {
                    tracing::debug!("Model {} min clock is {min_clock}", self.model.model_id());
                    self.metrics.min_clock_change_count.add(1, labels);
                }
            }
            Flag::Add => {
                self.model.add(&msg)?;
                self.metrics.add_count.add(1, labels);
            }
            Flag::Get => {
                self.model.get(&msg)?;
                self.metrics.get_count.add(1, labels);
            }
            Flag::ResetWorkerInModel => self.model.reset_worker(&msg)?,
            Flag::Checkpoint => self.checkpoint(&msg)?,
            Flag::Restore => self.restore()?,
        }
        Ok(Control::Continue)
    }

    /// Blocks on the store's I/O; only meant for checkpoint windows.
    fn checkpoint(&mut self, msg: &Message) -> Result<(), ModelError> {
        with_timer!(
            self.metrics.checkpoint_histogram,
            self.metrics.labels,
            self.model.tracker().dump(&mut self.store)
        )?;
        self.model.dump(msg)
    }

    fn restore(&mut self) -> Result<(), ModelError> {
        if !self.checkpointing {
            tracing::debug!(
                "Checkpointing is disabled; model {} keeps its progress",
                self.model.model_id()
            );
            return Ok(());
        }
        let restored = with_timer!(
            self.metrics.checkpoint_histogram,
            self.metrics.labels,
            self.model
                .tracker_mut()
                .restore(&mut self.store, self.scale_node)
        );
        tracing::info!(
            "Model {} restored {restored} workers, min clock {:?}",
            self.model.model_id(),
            self.model.tracker().min_clock()
        );
        self.model.restore()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Block;
    use crate::model::AspModel;
    use crate::model::ReplyQueue;
    use crate::node::ThreadId;
    use crate::progress::Clock;
    use crate::recovery::store::InMemStore;
    use crate::storage::MapStorage;

    fn shard_with(
        store: InMemStore,
        checkpointing: bool,
    ) -> (Shard, mpsc::UnboundedReceiver<Message>) {
        let (queue, replies) = ReplyQueue::new();
        let model = AspModel::new(1, Box::new(MapStorage::new(0, 10)), queue);
        let shard = Shard::new(Box::new(model), Box::new(store), checkpointing, None);
        (shard, replies)
    }

    fn shard(store: InMemStore) -> (Shard, mpsc::UnboundedReceiver<Message>) {
        shard_with(store, true)
    }

    fn deliver(shard: &mut Shard, msg: Message) -> Result<Control, ModelError> {
        shard.handle(ShardRequest::Deliver(msg))
    }

    #[test]
    fn checkpoint_writes_tracker() {
        let store = InMemStore::new();
        let (mut shard, _replies) = shard(store.clone());
        let reset = Message::new(0, 0, 1, Flag::ResetWorkerInModel)
            .with_block(Block::from_u32s(&[0, 1]));
        deliver(&mut shard, reset).unwrap();
        for _ in 0..120 {
            deliver(&mut shard, Message::new(0, 0, 1, Flag::Clock)).unwrap();
        }
        deliver(&mut shard, Message::new(0, 0, 1, Flag::Checkpoint)).unwrap();

        assert_eq!(
            store.contents().as_deref(),
            Some("min_clock:0 0:100 1:0 ")
        );
    }

    #[test]
    fn restore_flag_reloads_tracker() {
        let store = InMemStore::with_contents("min_clock:200 0:200 1:300");
        let (mut shard, _replies) = shard(store);
        deliver(&mut shard, Message::new(0, 0, 1, Flag::Restore)).unwrap();
        assert_eq!(shard.model.tracker().min_clock(), Some(Clock(200)));
        assert_eq!(shard.model.get_progress(ThreadId(1)), Ok(Clock(300)));
    }

    #[test]
    fn membership_change_reconciles_tracker() {
        let (mut shard, _replies) = shard(InMemStore::new());
        let reset = Message::new(0, 0, 1, Flag::ResetWorkerInModel)
            .with_block(Block::from_u32s(&[0, 1000, 2000]));
        deliver(&mut shard, reset).unwrap();

        shard
            .handle(ShardRequest::MembershipChange {
                failed_node: Some(NodeId(1)),
                nodes: vec![Node::new(0, "a", 1), Node::new(2, "c", 1)],
                range: Range::new(0, 10),
            })
            .unwrap();
        assert!(!shard.model.tracker().check_thread_valid(ThreadId(1000)));
        assert_eq!(shard.model.tracker().num_threads(), 2);
    }

    #[test]
    fn exit_stops_the_loop() {
        let (mut shard, _replies) = shard(InMemStore::new());
        assert!(matches!(
            deliver(&mut shard, Message::new(0, 0, 1, Flag::Exit)),
            Ok(Control::Exit)
        ));
    }

    #[test]
    fn run_returns_the_first_error() {
        let (shard, _replies) = shard(InMemStore::new());
        let (tx, rx) = mpsc::unbounded_channel();
        tx.send(ShardRequest::Deliver(Message::new(3, 0, 1, Flag::Add)))
            .unwrap();
        tx.send(ShardRequest::Deliver(Message::new(0, 0, 1, Flag::Exit)))
            .unwrap();
        let err = shard.run(rx).unwrap_err();
        assert!(err.is_protocol_violation());
    }

    #[test]
    fn run_ends_when_senders_are_gone() {
        let (shard, _replies) = shard(InMemStore::new());
        let (tx, rx) = mpsc::unbounded_channel();
        drop(tx);
        shard.run(rx).unwrap();
    }

    #[test]
    fn only_protocol_violations_count_as_rejected() {
        assert!(counts_as_rejected(&ModelError::protocol_violation(1, 9)));
        assert!(!counts_as_rejected(&ModelError::MalformedPayload {
            model_id: 1,
            what: "reset worker",
        }));
        let write_failure = crate::errors::CheckpointError::Write {
            path: "server_progress_0".into(),
            source: std::io::Error::new(std::io::ErrorKind::Other, "disk full"),
        };
        assert!(!counts_as_rejected(&write_failure.into()));
    }

    #[test]
    fn restore_without_checkpointing_keeps_workers() {
        let store = InMemStore::with_contents("min_clock:200 5:200");
        let (mut shard, _replies) = shard_with(store, false);
        let reset = Message::new(0, 0, 1, Flag::ResetWorkerInModel)
            .with_block(Block::from_u32s(&[0, 1]));
        deliver(&mut shard, reset).unwrap();
        deliver(&mut shard, Message::new(1, 0, 1, Flag::Clock)).unwrap();

        deliver(&mut shard, Message::new(0, 0, 1, Flag::Restore)).unwrap();
        assert_eq!(shard.model.tracker().num_threads(), 2);
        assert_eq!(shard.model.get_progress(ThreadId(1)), Ok(Clock(1)));
        assert!(!shard.model.tracker().check_thread_valid(ThreadId(5)));
    }
}
