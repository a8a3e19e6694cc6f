//! Running a node's shards.
//!
//! Each consistency model hosted on this node is served by its own
//! [`crate::shard`] thread, named `shard-<model_id>`. Messages are
//! routed to a shard by [`crate::message::Meta::model_id`] through a
//! [`ShardRouter`], and every shard pushes its replies onto the one
//! [`ReplyQueue`] whose receiving end is handed back by
//! [`Server::builder`].
//!
//! A shard that hits an error stops. Messages for it are refused from
//! then on with [`ServerError::ShardStopped`], and the error itself is
//! returned by [`Server::shutdown`].
//!
//! If [`ServerConfig::api_port`] is set, the monitoring webserver runs
//! on a small tokio runtime owned by the [`Server`].

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use tokio::runtime::Runtime;
use tokio::sync::mpsc;
use tokio::sync::oneshot;

use crate::config::ServerConfig;
use crate::errors::ModelError;
use crate::errors::ServerError;
use crate::message::Flag;
use crate::message::Message;
use crate::message::Range;
use crate::model::AspModel;
use crate::model::ConsistencyModel;
use crate::model::ReplyQueue;
use crate::node::Node;
use crate::node::NodeId;
use crate::progress::ProgressSnapshot;
use crate::recovery::store;
use crate::recovery::store::ProgressStore;
use crate::shard::Shard;
use crate::shard::ShardRequest;
use crate::storage::Storage;
use crate::webserver::run_webserver;

/// Install logging and metrics as `config` asks.
///
/// Metrics failing to initialize is only logged; the instruments then
/// stay no-ops.
pub fn setup_observability(config: &ServerConfig) -> Result<(), crate::tracing::LogLevelError> {
    crate::tracing::setup(config.log_level.as_deref())?;
    if let Err(err) = crate::metrics::initialize_metrics() {
        tracing::warn!("Unable to initialize metrics: {err}");
    }
    Ok(())
}

/// Collects the models a node hosts before their shards start.
pub struct ServerBuilder {
    config: ServerConfig,
    reply_queue: ReplyQueue,
    shards: BTreeMap<u32, (Box<dyn ConsistencyModel>, Box<dyn ProgressStore>)>,
}

impl ServerBuilder {
    /// A handle on the reply queue, for models built outside of
    /// [`Self::add_asp_model`].
    pub fn reply_queue(&self) -> ReplyQueue {
        self.reply_queue.clone()
    }

    /// Host `model`, checkpointing to the store the config asks for.
    pub fn add_model(
        &mut self,
        model: Box<dyn ConsistencyModel>,
    ) -> Result<&mut Self, ServerError> {
        let store = store::from_config(&self.config, model.model_id());
        self.add_model_with_store(model, store)
    }

    /// Host `model`, checkpointing to `store`.
    pub fn add_model_with_store(
        &mut self,
        model: Box<dyn ConsistencyModel>,
        store: Box<dyn ProgressStore>,
    ) -> Result<&mut Self, ServerError> {
        let model_id = model.model_id();
        if self.shards.contains_key(&model_id) {
            return Err(ServerError::DuplicateModel(model_id));
        }
        self.shards.insert(model_id, (model, store));
        Ok(self)
    }

    /// Host an asynchronous-parallel model over `storage`.
    pub fn add_asp_model(
        &mut self,
        model_id: u32,
        storage: Box<dyn Storage>,
    ) -> Result<&mut Self, ServerError> {
        let model = AspModel::new(model_id, storage, self.reply_queue());
        self.add_model(Box::new(model))
    }

    /// Spawn a thread per shard, and the monitoring webserver if a
    /// port is configured.
    ///
    /// With checkpointing on, every shard restores its progress before
    /// serving anything.
    pub fn start(self) -> Result<Server, ServerError> {
        let checkpointing = self.config.checkpoint_toggle;
        let scale_node = self.config.scale_node();

        let mut senders = BTreeMap::new();
        let mut threads = BTreeMap::new();
        for (model_id, (model, store)) in self.shards {
            let (tx, rx) = mpsc::unbounded_channel();
            let shard = Shard::new(model, store, checkpointing, scale_node);
            let handle = thread::Builder::new()
                .name(format!("shard-{model_id}"))
                .spawn(move || shard.run(rx))
                .map_err(|source| ServerError::Spawn {
                    what: format!("shard for model {model_id}"),
                    source,
                })?;
            senders.insert(model_id, tx);
            threads.insert(model_id, handle);
        }
        let router = ShardRouter {
            shards: Arc::new(senders),
        };

        let server_rt = self
            .config
            .api_port
            .map(|port| start_server_runtime(router.clone(), port))
            .transpose()?;

        tracing::info!(
            "Node {} serving models {:?}",
            self.config.my_id,
            threads.keys().collect::<Vec<_>>()
        );
        Ok(Server {
            router,
            threads,
            server_rt,
        })
    }
}

/// Start the tokio runtime for the webserver.
/// Keep a reference to the runtime for as long as you need it running.
fn start_server_runtime(router: ShardRouter, port: u16) -> Result<Runtime, ServerError> {
    let rt = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .thread_name("webserver-threads")
        .enable_all()
        .build()
        .map_err(|source| ServerError::Spawn {
            what: "monitoring runtime".to_string(),
            source,
        })?;
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    rt.spawn(run_webserver(router, addr));
    Ok(rt)
}

/// Sends requests to shards by model id.
///
/// Cheap to clone; safe to use from any thread or task.
#[derive(Clone)]
pub struct ShardRouter {
    shards: Arc<BTreeMap<u32, mpsc::UnboundedSender<ShardRequest>>>,
}

impl ShardRouter {
    pub fn model_ids(&self) -> impl Iterator<Item = u32> + '_ {
        self.shards.keys().copied()
    }

    fn send(&self, model_id: u32, req: ShardRequest) -> Result<(), ServerError> {
        self.shards
            .get(&model_id)
            .ok_or(ServerError::UnknownModel(model_id))?
            .send(req)
            .map_err(|_| ServerError::ShardStopped(model_id))
    }

    /// Queue a worker's message on the shard for its model.
    pub fn deliver(&self, msg: Message) -> Result<(), ServerError> {
        self.send(msg.meta.model_id, ShardRequest::Deliver(msg))
    }

    /// Tell every shard the cluster now consists of `nodes`.
    ///
    /// Returns the first shard that could not be told; the rest are
    /// told regardless.
    pub fn membership_change(
        &self,
        failed_node: Option<NodeId>,
        nodes: &[Node],
        range: Range,
    ) -> Result<(), ServerError> {
        let mut res = Ok(());
        for model_id in self.model_ids() {
            let req = ShardRequest::MembershipChange {
                failed_node,
                nodes: nodes.to_vec(),
                range,
            };
            if let Err(err) = self.send(model_id, req) {
                tracing::warn!("Membership change not delivered: {err}");
                res = res.and(Err(err));
            }
        }
        res
    }

    /// Current progress of one shard.
    pub async fn snapshot(&self, model_id: u32) -> Result<ProgressSnapshot, ServerError> {
        let (tx, rx) = oneshot::channel();
        self.send(model_id, ShardRequest::Inspect(tx))?;
        rx.await.map_err(|_| ServerError::ShardStopped(model_id))
    }

    /// Current progress of every running shard.
    pub async fn snapshots(&self) -> BTreeMap<u32, ProgressSnapshot> {
        let mut out = BTreeMap::new();
        for model_id in self.model_ids() {
            match self.snapshot(model_id).await {
                Ok(snapshot) => {
                    out.insert(model_id, snapshot);
                }
                Err(err) => tracing::debug!("Skipping model {model_id}: {err}"),
            }
        }
        out
    }
}

/// The running shards of a node.
pub struct Server {
    router: ShardRouter,
    threads: BTreeMap<u32, thread::JoinHandle<Result<(), ModelError>>>,
    server_rt: Option<Runtime>,
}

impl Server {
    /// Start describing a node. The receiver yields every reply the
    /// node's shards produce.
    pub fn builder(config: ServerConfig) -> (ServerBuilder, mpsc::UnboundedReceiver<Message>) {
        let (reply_queue, replies) = ReplyQueue::new();
        let builder = ServerBuilder {
            config,
            reply_queue,
            shards: BTreeMap::new(),
        };
        (builder, replies)
    }

    pub fn router(&self) -> ShardRouter {
        self.router.clone()
    }

    pub fn deliver(&self, msg: Message) -> Result<(), ServerError> {
        self.router.deliver(msg)
    }

    /// Whether the shard for `model_id` is still serving.
    pub fn is_running(&self, model_id: u32) -> bool {
        self.threads
            .get(&model_id)
            .map_or(false, |handle| !handle.is_finished())
    }

    /// Stop every shard once it has drained what was delivered before,
    /// and wait for them.
    ///
    /// Returns the error of the first shard, by model id, that failed.
    pub fn shutdown(mut self) -> Result<(), ServerError> {
        for model_id in self.router.model_ids() {
            // Already stopped shards can't be told, nor need to be.
            let _ = self.router.deliver(Message::new(-1, -1, model_id, Flag::Exit));
        }

        let mut res = Ok(());
        for (model_id, handle) in std::mem::take(&mut self.threads) {
            let shard_res = match handle.join() {
                Ok(Ok(())) => Ok(()),
                Ok(Err(source)) => Err(ServerError::Shard { model_id, source }),
                Err(_) => Err(ServerError::ShardPanicked(model_id)),
            };
            res = res.and(shard_res);
        }

        // If we just drop the runtime, it will wait indefinitely
        // that the server stops, so we need to stop it manually.
        if let Some(rt) = self.server_rt.take() {
            rt.shutdown_timeout(Duration::from_secs(0));
        }
        res
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Block;
    use crate::node::ThreadId;
    use crate::progress::Clock;
    use crate::recovery::store::InMemStore;
    use crate::storage::MapStorage;

    fn reset(model_id: u32, tids: &[u32]) -> Message {
        Message::new(0, 0, model_id, Flag::ResetWorkerInModel).with_block(Block::from_u32s(tids))
    }

    fn asp_server(config: ServerConfig) -> (Server, mpsc::UnboundedReceiver<Message>) {
        let (mut builder, replies) = Server::builder(config);
        builder
            .add_asp_model(0, Box::new(MapStorage::new(0, 10)))
            .unwrap()
            .add_asp_model(1, Box::new(MapStorage::new(10, 20)))
            .unwrap();
        (builder.start().unwrap(), replies)
    }

    #[test]
    fn serves_reset_add_and_get() {
        let (server, mut replies) = asp_server(ServerConfig::default());
        server.deliver(reset(1, &[0, 1])).unwrap();
        let ack = replies.blocking_recv().unwrap();
        assert_eq!(ack.meta.flag, Flag::ResetWorkerInModel);
        assert_eq!(ack.meta.model_id, 1);

        let add = Message::new(1, 0, 1, Flag::Add)
            .with_block(Block::from_u32s(&[12]))
            .with_block(Block::from_f32s(&[0.5]));
        server.deliver(add).unwrap();
        let get = Message::new(0, 0, 1, Flag::Get).with_block(Block::from_u32s(&[12]));
        server.deliver(get).unwrap();

        let reply = replies.blocking_recv().unwrap();
        assert_eq!(reply.meta.flag, Flag::Get);
        assert_eq!(reply.meta.recver, 0);
        assert_eq!(reply.data[1].to_f32s(), Some(vec![0.5]));
        server.shutdown().unwrap();
    }

    #[test]
    fn restore_is_ignored_without_checkpointing() {
        let (server, mut replies) = asp_server(ServerConfig::default());
        server.deliver(reset(0, &[0, 1])).unwrap();
        replies.blocking_recv().unwrap();

        server.deliver(Message::new(0, 0, 0, Flag::Restore)).unwrap();
        let add = Message::new(1, 0, 0, Flag::Add)
            .with_block(Block::from_u32s(&[3]))
            .with_block(Block::from_f32s(&[2.0]));
        server.deliver(add).unwrap();
        let get = Message::new(1, 0, 0, Flag::Get).with_block(Block::from_u32s(&[3]));
        server.deliver(get).unwrap();

        let reply = replies.blocking_recv().unwrap();
        assert_eq!(reply.meta.recver, 1);
        assert_eq!(reply.data[1].to_f32s(), Some(vec![2.0]));
        server.shutdown().unwrap();
    }

    #[test]
    fn unknown_model_is_refused() {
        let (server, _replies) = asp_server(ServerConfig::default());
        assert!(matches!(
            server.deliver(Message::new(0, 0, 5, Flag::Clock)),
            Err(ServerError::UnknownModel(5))
        ));
        server.shutdown().unwrap();
    }

    #[test]
    fn duplicate_model_is_refused() {
        let (mut builder, _replies) = Server::builder(ServerConfig::default());
        builder
            .add_asp_model(3, Box::new(MapStorage::new(0, 1)))
            .unwrap();
        assert!(matches!(
            builder.add_asp_model(3, Box::new(MapStorage::new(0, 1))),
            Err(ServerError::DuplicateModel(3))
        ));
    }

    #[test]
    fn protocol_violation_stops_only_its_shard() {
        let (server, mut replies) = asp_server(ServerConfig::default());
        server.deliver(reset(0, &[1, 2])).unwrap();
        server.deliver(reset(1, &[1, 2])).unwrap();
        replies.blocking_recv().unwrap();
        replies.blocking_recv().unwrap();

        let add = Message::new(3, 0, 0, Flag::Add)
            .with_block(Block::from_u32s(&[1]))
            .with_block(Block::from_f32s(&[1.0]));
        server.deliver(add).unwrap();
        while server.is_running(0) {
            thread::sleep(Duration::from_millis(1));
        }
        assert!(server.is_running(1));
        assert!(matches!(
            server.deliver(Message::new(1, 0, 0, Flag::Clock)),
            Err(ServerError::ShardStopped(0))
        ));

        match server.shutdown() {
            Err(ServerError::Shard { model_id, source }) => {
                assert_eq!(model_id, 0);
                assert!(source.is_protocol_violation());
            }
            other => panic!("expected shard failure, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn restores_on_start_with_scale_node() {
        let config = ServerConfig {
            checkpoint_toggle: true,
            has_scale_node: true,
            scale_node_id: 2,
            ..Default::default()
        };
        let store = InMemStore::with_contents("min_clock:100 1000:100 1001:200");
        let (mut builder, _replies) = Server::builder(config);
        let model = AspModel::new(0, Box::new(MapStorage::new(0, 1)), builder.reply_queue());
        builder
            .add_model_with_store(Box::new(model), Box::new(store))
            .unwrap();
        let server = builder.start().unwrap();

        let snapshot = server.router().snapshot(0).await.unwrap();
        assert_eq!(snapshot.min_clock, Some(Clock(100)));
        assert_eq!(snapshot.clocks.get(&ThreadId(2001)), Some(&Clock(200)));
        assert_eq!(snapshot.clocks.len(), 4);
        server.shutdown().unwrap();
    }

    #[tokio::test]
    async fn membership_change_reaches_every_shard() {
        let (server, mut replies) = asp_server(ServerConfig::default());
        for model_id in [0, 1] {
            server.deliver(reset(model_id, &[0, 1000])).unwrap();
            replies.recv().await.unwrap();
        }
        server
            .router()
            .membership_change(Some(NodeId(1)), &[Node::new(0, "a", 1)], Range::new(0, 10))
            .unwrap();

        let snapshots = server.router().snapshots().await;
        assert_eq!(snapshots.len(), 2);
        for snapshot in snapshots.values() {
            assert_eq!(snapshot.clocks.keys().collect::<Vec<_>>(), vec![&ThreadId(0)]);
        }
        server.shutdown().unwrap();
    }

    #[test]
    fn checkpoint_survives_restart() {
        let dir = std::env::temp_dir().join(format!("minips-server-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let config = ServerConfig {
            my_id: 4,
            checkpoint_toggle: true,
            checkpoint_file_prefix: format!("{}/", dir.display()),
            ..Default::default()
        };

        let (server, mut replies) = asp_server(config.clone());
        server.deliver(reset(0, &[4000, 4001])).unwrap();
        replies.blocking_recv().unwrap();
        for _ in 0..260 {
            server.deliver(Message::new(4000, 0, 0, Flag::Clock)).unwrap();
        }
        server
            .deliver(Message::new(0, 0, 0, Flag::Checkpoint))
            .unwrap();
        server.shutdown().unwrap();
        assert_eq!(
            std::fs::read_to_string(dir.join("server_progress_4")).unwrap(),
            "min_clock:0 4000:300 4001:0 "
        );

        let (server, _replies) = asp_server(config);
        let rt = tokio::runtime::Runtime::new().unwrap();
        let snapshot = rt.block_on(server.router().snapshot(0)).unwrap();
        assert_eq!(snapshot.clocks.get(&ThreadId(4000)), Some(&Clock(300)));
        assert_eq!(snapshot.min_clock, Some(Clock(0)));
        // Model 1 never checkpointed.
        let snapshot = rt.block_on(server.router().snapshot(1)).unwrap();
        assert!(snapshot.clocks.is_empty());
        server.shutdown().unwrap();
    }
}
