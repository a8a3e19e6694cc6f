//! Key-value storage behind a shard.
//!
//! The server core only forwards already admitted messages here;
//! what a payload means is up to the storage implementation.

use crate::message::Block;
use crate::message::Flag;
use crate::message::Message;

/// Storage contract a consistency model drives.
///
/// Neither call fails for a sender the model has admitted.
pub trait Storage: Send {
    /// Apply an update.
    fn add(&mut self, msg: &Message);

    /// Answer a read. The reply is addressed to `msg`'s sender.
    fn get(&self, msg: &Message) -> Message;
}

impl<S> Storage for Box<S>
where
    S: Storage + ?Sized,
{
    fn add(&mut self, msg: &Message) {
        (**self).add(msg)
    }

    fn get(&self, msg: &Message) -> Message {
        (**self).get(msg)
    }
}

/// Dense `f32` parameters over the key range `[begin, end)`.
///
/// Payloads are a block of `u32` keys followed (for adds) by a block
/// of `f32` deltas of the same length. Adds accumulate. Keys outside
/// the range and ragged payloads are dropped with a warning.
#[derive(Debug, Clone)]
pub struct MapStorage {
    begin: u32,
    values: Vec<f32>,
}

impl MapStorage {
    pub fn new(begin: u32, end: u32) -> Self {
        assert!(begin <= end, "range begin {begin} is past end {end}");
        Self {
            begin,
            values: vec![0.0; (end - begin) as usize],
        }
    }

    fn slot(&self, key: u32) -> Option<usize> {
        key.checked_sub(self.begin)
            .map(|offset| offset as usize)
            .filter(|offset| *offset < self.values.len())
    }

    fn keys(msg: &Message) -> Vec<u32> {
        msg.data
            .first()
            .and_then(Block::to_u32s)
            .unwrap_or_else(|| {
                tracing::warn!("Dropping storage request with bad key block from {}", msg.meta.sender);
                Vec::new()
            })
    }
}

impl Storage for MapStorage {
    fn add(&mut self, msg: &Message) {
        let keys = Self::keys(msg);
        let Some(deltas) = msg.data.get(1).and_then(Block::to_f32s) else {
            tracing::warn!("Dropping add without value block from {}", msg.meta.sender);
            return;
        };
        if keys.len() != deltas.len() {
            tracing::warn!(
                "Dropping add from {} with {} keys and {} values",
                msg.meta.sender,
                keys.len(),
                deltas.len()
            );
            return;
        }
        for (key, delta) in keys.into_iter().zip(deltas) {
            match self.slot(key) {
                Some(slot) => self.values[slot] += delta,
                None => tracing::warn!("Key {key} is outside this shard"),
            }
        }
    }

    fn get(&self, msg: &Message) -> Message {
        let keys = Self::keys(msg);
        let values: Vec<f32> = keys
            .iter()
            .map(|key| self.slot(*key).map_or(0.0, |slot| self.values[slot]))
            .collect();
        msg.reply_to(Flag::Get)
            .with_block(Block::from_u32s(&keys))
            .with_block(Block::from_f32s(&values))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn add(sender: i32, keys: &[u32], deltas: &[f32]) -> Message {
        Message::new(sender, 0, 0, Flag::Add)
            .with_block(Block::from_u32s(keys))
            .with_block(Block::from_f32s(deltas))
    }

    fn get(sender: i32, keys: &[u32]) -> Message {
        Message::new(sender, 0, 0, Flag::Get).with_block(Block::from_u32s(keys))
    }

    #[test]
    fn adds_accumulate() {
        let mut storage = MapStorage::new(10, 20);
        storage.add(&add(1, &[10, 15], &[1.0, 2.0]));
        storage.add(&add(2, &[15], &[0.5]));

        let reply = storage.get(&get(1, &[10, 15, 19]));
        assert_eq!(reply.meta.recver, 1);
        assert_eq!(reply.meta.flag, Flag::Get);
        assert_eq!(reply.data[0].to_u32s(), Some(vec![10, 15, 19]));
        assert_eq!(reply.data[1].to_f32s(), Some(vec![1.0, 2.5, 0.0]));
    }

    #[test]
    fn out_of_range_keys_are_ignored() {
        let mut storage = MapStorage::new(10, 20);
        storage.add(&add(1, &[5, 20], &[1.0, 1.0]));
        let reply = storage.get(&get(1, &[5, 20]));
        assert_eq!(reply.data[1].to_f32s(), Some(vec![0.0, 0.0]));
    }

    #[test]
    fn mismatched_add_is_dropped() {
        let mut storage = MapStorage::new(0, 4);
        storage.add(&add(1, &[0, 1], &[1.0]));
        let reply = storage.get(&get(1, &[0]));
        assert_eq!(reply.data[1].to_f32s(), Some(vec![0.0]));
    }
}
