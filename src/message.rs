//! The message envelope exchanged between workers and server shards.
//!
//! Only the fields the server core reads are modelled here; how a
//! [`Message`] travels over the wire is the transport's business.

use serde::Deserialize;
use serde::Serialize;

/// What a message asks a shard to do.
#[derive(Debug, Copy, Clone, Hash, PartialEq, Eq, Serialize, Deserialize)]
pub enum Flag {
    /// Stop the shard.
    Exit,
    /// The sender finished an iteration.
    Clock,
    /// Push a partial update into the shard's storage.
    Add,
    /// Pull values out of the shard's storage.
    Get,
    /// Replace the set of workers for this shard. Also used to flag
    /// the acknowledgement sent back.
    ResetWorkerInModel,
    /// Persist the shard's progress.
    Checkpoint,
    /// Reload the shard's progress from the last checkpoint.
    Restore,
}

/// Routing header of a [`Message`].
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Meta {
    pub sender: i32,
    pub recver: i32,
    pub model_id: u32,
    pub flag: Flag,
}

/// One opaque payload block.
///
/// Storage decides what a block means; the core only ever unpacks
/// worker id lists out of one.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Block(pub Vec<u8>);

impl Block {
    pub fn from_u32s(values: &[u32]) -> Self {
        Self(values.iter().flat_map(|v| v.to_le_bytes()).collect())
    }

    pub fn from_f32s(values: &[f32]) -> Self {
        Self(values.iter().flat_map(|v| v.to_le_bytes()).collect())
    }

    /// Unpack as little-endian `u32`s. `None` if the length is not a
    /// multiple of 4.
    pub fn to_u32s(&self) -> Option<Vec<u32>> {
        if self.0.len() % 4 != 0 {
            return None;
        }
        Some(
            self.0
                .chunks_exact(4)
                .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
                .collect(),
        )
    }

    pub fn to_f32s(&self) -> Option<Vec<f32>> {
        if self.0.len() % 4 != 0 {
            return None;
        }
        Some(
            self.0
                .chunks_exact(4)
                .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
                .collect(),
        )
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// A unit of work for a shard, or a reply to a worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub meta: Meta,
    pub data: Vec<Block>,
}

impl Message {
    pub fn new(sender: i32, recver: i32, model_id: u32, flag: Flag) -> Self {
        Self {
            meta: Meta {
                sender,
                recver,
                model_id,
                flag,
            },
            data: Vec::new(),
        }
    }

    pub fn with_block(mut self, block: Block) -> Self {
        self.data.push(block);
        self
    }

    /// An empty message addressed back to whoever sent this one, on
    /// the same model.
    pub fn reply_to(&self, flag: Flag) -> Self {
        Self::new(self.meta.recver, self.meta.sender, self.meta.model_id, flag)
    }
}

/// Half-open key range a shard is responsible for.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Range {
    pub begin: u64,
    pub end: u64,
}

impl Range {
    pub fn new(begin: u64, end: u64) -> Self {
        assert!(begin <= end, "range begin {begin} is past end {end}");
        Self { begin, end }
    }
}

#[test]
fn u32_block_round_trips() {
    let block = Block::from_u32s(&[10, 11, 12]);
    assert_eq!(block.0.len(), 12);
    assert_eq!(block.to_u32s(), Some(vec![10, 11, 12]));
}

#[test]
fn ragged_block_does_not_unpack() {
    assert_eq!(Block(vec![1, 2, 3]).to_u32s(), None);
    assert_eq!(Block(vec![1, 2, 3, 4, 5]).to_f32s(), None);
}

#[test]
fn reply_is_addressed_to_sender() {
    let msg = Message::new(1003, 0, 7, Flag::Get);
    let reply = msg.reply_to(Flag::Get);
    assert_eq!(reply.meta.recver, 1003);
    assert_eq!(reply.meta.sender, 0);
    assert_eq!(reply.meta.model_id, 7);
    assert!(reply.data.is_empty());
}

#[test]
fn flag_serializes_as_unit_variant() {
    use serde_test::{assert_tokens, Token};

    assert_tokens(
        &Flag::ResetWorkerInModel,
        &[Token::UnitVariant {
            name: "Flag",
            variant: "ResetWorkerInModel",
        }],
    );
}
