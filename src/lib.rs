//! Server side of a small parameter server.
//!
//! Worker threads on every node of a cluster read and write model
//! parameters held by server shards, and report a **clock** after
//! each local iteration. A shard serves one model: it keeps the
//! model's [`Storage`], enforces a [`ConsistencyModel`] over the
//! workers, and tracks their progress in a [`ProgressTracker`].
//!
//! The tracker's table is also the shard's membership. Only workers
//! with an entry may read or write; anything else is a protocol
//! violation and stops the shard. Progress can be checkpointed to a
//! per-node file and restored on restart, see [`recovery`].
//!
//! A node's shards are run by a [`Server`]:
//!
//! ```no_run
//! use minips::{Block, Flag, Message, MapStorage, Server, ServerConfig};
//!
//! let config = ServerConfig::from_json(r#"{"my_id": 0}"#)?.with_env_overrides()?;
//! minips::server::setup_observability(&config)?;
//! let (mut builder, mut replies) = Server::builder(config);
//! builder.add_asp_model(0, Box::new(MapStorage::new(0, 100)))?;
//! let server = builder.start()?;
//!
//! let reset = Message::new(0, 0, 0, Flag::ResetWorkerInModel)
//!     .with_block(Block::from_u32s(&[0, 1, 1000, 1001]));
//! server.deliver(reset)?;
//! let ack = replies.blocking_recv();
//! server.shutdown()?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

pub mod config;
pub mod errors;
pub mod message;
pub mod metrics;
pub mod model;
pub mod node;
pub mod progress;
pub mod recovery;
pub mod server;
pub(crate) mod shard;
pub mod storage;
pub mod tracing;
pub(crate) mod webserver;

pub use config::ServerConfig;
pub use errors::{CheckpointError, ModelError, ProgressError, ServerError};
pub use message::{Block, Flag, Message, Meta, Range};
pub use model::{AspModel, ConsistencyModel, ReplyQueue};
pub use node::{Node, NodeId, ThreadId};
pub use progress::{Clock, ProgressSnapshot, ProgressTracker};
pub use server::{Server, ServerBuilder, ShardRouter};
pub use storage::{MapStorage, Storage};
