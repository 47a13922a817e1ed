//! Fixed-block slab arena for per-device buffer objects.
//!
//! Buffer objects are created and destroyed at high rates by some legacy
//! applications (one per sound effect instance). Slots live in blocks of 64
//! with a free-bitmask per block, so allocation is a bit-scan and release is a
//! bit-clear with no per-object heap traffic.

const BLOCK_SLOTS: usize = 64;

/// Stable index of an arena slot: `block * 64 + bit`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SlotId(u32);

impl SlotId {
    fn new(block: usize, bit: usize) -> Self {
        Self((block * BLOCK_SLOTS + bit) as u32)
    }

    fn split(self) -> (usize, usize) {
        let raw = self.0 as usize;
        (raw / BLOCK_SLOTS, raw % BLOCK_SLOTS)
    }
}

struct Block<T> {
    /// Bit set means the slot is occupied.
    used: u64,
    slots: Vec<Option<T>>,
}

impl<T> Block<T> {
    fn new() -> Self {
        Self {
            used: 0,
            slots: (0..BLOCK_SLOTS).map(|_| None).collect(),
        }
    }
}

pub struct Arena<T> {
    blocks: Vec<Block<T>>,
    len: usize,
}

impl<T> Arena<T> {
    pub fn new() -> Self {
        Self {
            blocks: Vec::new(),
            len: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn insert(&mut self, value: T) -> SlotId {
        for (block_idx, block) in self.blocks.iter_mut().enumerate() {
            if block.used != u64::MAX {
                let bit = block.used.trailing_ones() as usize;
                block.used |= 1 << bit;
                block.slots[bit] = Some(value);
                self.len += 1;
                return SlotId::new(block_idx, bit);
            }
        }
        let mut block = Block::new();
        block.used = 1;
        block.slots[0] = Some(value);
        self.blocks.push(block);
        self.len += 1;
        SlotId::new(self.blocks.len() - 1, 0)
    }

    pub fn remove(&mut self, id: SlotId) -> Option<T> {
        let (block_idx, bit) = id.split();
        let block = self.blocks.get_mut(block_idx)?;
        let value = block.slots[bit].take();
        if value.is_some() {
            block.used &= !(1 << bit);
            self.len -= 1;
        }
        value
    }

    pub fn get(&self, id: SlotId) -> Option<&T> {
        let (block_idx, bit) = id.split();
        self.blocks.get(block_idx)?.slots[bit].as_ref()
    }

    pub fn get_mut(&mut self, id: SlotId) -> Option<&mut T> {
        let (block_idx, bit) = id.split();
        self.blocks.get_mut(block_idx)?.slots[bit].as_mut()
    }

    pub fn iter(&self) -> impl Iterator<Item = (SlotId, &T)> {
        self.blocks.iter().enumerate().flat_map(|(block_idx, block)| {
            block
                .slots
                .iter()
                .enumerate()
                .filter_map(move |(bit, slot)| {
                    slot.as_ref().map(|v| (SlotId::new(block_idx, bit), v))
                })
        })
    }
}

impl<T> Default for Arena<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_fills_the_lowest_free_bit() {
        let mut arena = Arena::new();
        let a = arena.insert("a");
        let b = arena.insert("b");
        arena.remove(a);
        let c = arena.insert("c");
        // Freed slot is reused before the block grows.
        assert_eq!(a, c);
        assert_eq!(arena.get(b), Some(&"b"));
        assert_eq!(arena.len(), 2);
    }

    #[test]
    fn grows_past_one_block() {
        let mut arena = Arena::new();
        let ids: Vec<_> = (0..70).map(|i| arena.insert(i)).collect();
        assert_eq!(arena.len(), 70);
        for (i, id) in ids.iter().enumerate() {
            assert_eq!(arena.get(*id), Some(&i));
        }
        // 65th insert must have landed in a second block.
        assert_ne!(ids[0], ids[64]);
    }

    #[test]
    fn remove_is_idempotent() {
        let mut arena = Arena::new();
        let id = arena.insert(7);
        assert_eq!(arena.remove(id), Some(7));
        assert_eq!(arena.remove(id), None);
        assert!(arena.is_empty());
    }

    #[test]
    fn iter_visits_live_slots_only() {
        let mut arena = Arena::new();
        let a = arena.insert(1);
        let _b = arena.insert(2);
        arena.remove(a);
        let seen: Vec<i32> = arena.iter().map(|(_, v)| *v).collect();
        assert_eq!(seen, vec![2]);
    }
}
