//! Fixed-size pool of pixel buffers.
//!
//! The pool pre-allocates `capacity` slots of `slot_len` bytes. A slot is
//! either free (its storage sits in the pool) or outstanding (its storage is
//! owned by exactly one `PooledBuffer`). Acquiring moves the storage out of
//! the pool and releasing moves it back, so pixel bytes are never copied and
//! a slot cannot be held twice.
//!
//! `PooledBuffer` returns its slot when dropped. Explicit `release` exists
//! for callers that want accounting errors as values instead of a panic.
//!
//! All bookkeeping happens under one mutex, held only for O(1) work.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Pool accounting failure. Every variant is an invariant violation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PoolError {
    /// The buffer was acquired from a different pool.
    ForeignHandle { slot: usize },
    /// The slot is already free.
    NotOutstanding { slot: usize },
    /// The slot index is out of range.
    UnknownSlot { slot: usize },
    /// Free and outstanding counts do not add up to capacity.
    Accounting {
        free: usize,
        outstanding: usize,
        capacity: usize,
    },
}

impl fmt::Display for PoolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PoolError::ForeignHandle { slot } => {
                write!(f, "slot {} released to a pool it was not acquired from", slot)
            }
            PoolError::NotOutstanding { slot } => {
                write!(f, "slot {} released while not outstanding", slot)
            }
            PoolError::UnknownSlot { slot } => write!(f, "slot {} does not exist", slot),
            PoolError::Accounting {
                free,
                outstanding,
                capacity,
            } => write!(
                f,
                "pool accounting broken: {} free + {} outstanding != {} slots",
                free, outstanding, capacity
            ),
        }
    }
}

impl std::error::Error for PoolError {}

struct SlotTable {
    storage: Vec<Option<Box<[u8]>>>,
    free: Vec<usize>,
    outstanding: usize,
}

impl SlotTable {
    fn check(&self, capacity: usize) -> Result<(), PoolError> {
        if self.free.len() + self.outstanding != capacity {
            return Err(PoolError::Accounting {
                free: self.free.len(),
                outstanding: self.outstanding,
                capacity,
            });
        }
        Ok(())
    }
}

struct PoolShared {
    slot_len: usize,
    capacity: usize,
    table: Mutex<SlotTable>,
}

impl PoolShared {
    fn lock(&self) -> MutexGuard<'_, SlotTable> {
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn return_slot(&self, slot: usize, data: Box<[u8]>) -> Result<(), PoolError> {
        let mut table = self.lock();
        let entry = table
            .storage
            .get_mut(slot)
            .ok_or(PoolError::UnknownSlot { slot })?;
        if entry.is_some() || data.len() != self.slot_len {
            return Err(PoolError::NotOutstanding { slot });
        }
        *entry = Some(data);
        table.free.push(slot);
        table.outstanding = table
            .outstanding
            .checked_sub(1)
            .ok_or(PoolError::NotOutstanding { slot })?;
        table.check(self.capacity)
    }
}

/// Shared handle to a buffer pool. Clones refer to the same slots.
#[derive(Clone)]
pub struct BufferPool {
    shared: Arc<PoolShared>,
}

impl BufferPool {
    /// Allocate `capacity` zeroed slots of `slot_len` bytes each.
    pub fn new(capacity: usize, slot_len: usize) -> Self {
        let storage = (0..capacity)
            .map(|_| Some(vec![0u8; slot_len].into_boxed_slice()))
            .collect();
        // Reverse so slot 0 is handed out first.
        let free = (0..capacity).rev().collect();
        Self {
            shared: Arc::new(PoolShared {
                slot_len,
                capacity,
                table: Mutex::new(SlotTable {
                    storage,
                    free,
                    outstanding: 0,
                }),
            }),
        }
    }

    /// Take a free slot, or `None` when every slot is outstanding. Never blocks.
    pub fn acquire(&self) -> Option<PooledBuffer> {
        let mut table = self.shared.lock();
        let slot = table.free.pop()?;
        let Some(data) = table.storage[slot].take() else {
            let err = PoolError::NotOutstanding { slot };
            log::error!("BufferPool: free list names an outstanding slot: {}", err);
            panic!("buffer pool invariant violated: {}", err);
        };
        table.outstanding += 1;
        if let Err(err) = table.check(self.shared.capacity) {
            log::error!("BufferPool: {}", err);
            panic!("buffer pool invariant violated: {}", err);
        }
        drop(table);

        Some(PooledBuffer {
            pool: Arc::clone(&self.shared),
            slot,
            data: Some(data),
            len: 0,
            selected: false,
        })
    }

    /// Return `buf` to this pool, verifying it came from here.
    pub fn release(&self, mut buf: PooledBuffer) -> Result<(), PoolError> {
        if !Arc::ptr_eq(&buf.pool, &self.shared) {
            // Dropping `buf` returns it to its own pool.
            return Err(PoolError::ForeignHandle { slot: buf.slot });
        }
        buf.return_to_pool()
    }

    pub fn capacity(&self) -> usize {
        self.shared.capacity
    }

    pub fn slot_len(&self) -> usize {
        self.shared.slot_len
    }

    pub fn free_count(&self) -> usize {
        self.shared.lock().free.len()
    }

    pub fn outstanding(&self) -> usize {
        self.shared.lock().outstanding
    }

    /// Verify `free + outstanding == capacity`.
    pub fn check_invariant(&self) -> Result<(), PoolError> {
        self.shared.lock().check(self.shared.capacity)
    }
}

impl fmt::Debug for BufferPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let table = self.shared.lock();
        f.debug_struct("BufferPool")
            .field("capacity", &self.shared.capacity)
            .field("slot_len", &self.shared.slot_len)
            .field("free", &table.free.len())
            .field("outstanding", &table.outstanding)
            .finish()
    }
}

/// One outstanding pool slot holding converted pixel data.
///
/// Not `Clone`: the slot has exactly one owner, and it goes back to the pool
/// exactly once, on `release` or drop.
pub struct PooledBuffer {
    pool: Arc<PoolShared>,
    slot: usize,
    data: Option<Box<[u8]>>,
    len: usize,
    selected: bool,
}

impl PooledBuffer {
    pub fn slot(&self) -> usize {
        self.slot
    }

    /// Slot size in bytes.
    pub fn capacity(&self) -> usize {
        self.data.as_ref().map_or(0, |d| d.len())
    }

    /// Valid byte count.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Mark the first `len` bytes as valid.
    ///
    /// # Panics
    ///
    /// Panics if `len` exceeds the slot size.
    pub fn set_len(&mut self, len: usize) {
        assert!(
            len <= self.capacity(),
            "valid length {} exceeds slot size {}",
            len,
            self.capacity()
        );
        self.len = len;
    }

    /// The valid bytes.
    pub fn as_slice(&self) -> &[u8] {
        match &self.data {
            Some(data) => &data[..self.len],
            None => &[],
        }
    }

    /// The whole slot, for writers that fill it before `set_len`.
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        match &mut self.data {
            Some(data) => data,
            None => &mut [],
        }
    }

    /// Did this frame trigger persistence.
    pub fn selected(&self) -> bool {
        self.selected
    }

    pub fn set_selected(&mut self, selected: bool) {
        self.selected = selected;
    }

    /// Return the slot, reporting accounting failures instead of panicking.
    pub fn release(mut self) -> Result<(), PoolError> {
        self.return_to_pool()
    }

    fn return_to_pool(&mut self) -> Result<(), PoolError> {
        match self.data.take() {
            Some(data) => self.pool.return_slot(self.slot, data),
            None => Err(PoolError::NotOutstanding { slot: self.slot }),
        }
    }
}

impl fmt::Debug for PooledBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledBuffer")
            .field("slot", &self.slot)
            .field("len", &self.len)
            .field("selected", &self.selected)
            .finish()
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        if self.data.is_none() {
            return;
        }
        if let Err(err) = self.return_to_pool() {
            log::error!("BufferPool: {}", err);
            if !std::thread::panicking() {
                panic!("buffer pool invariant violated: {}", err);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use std::collections::HashSet;

    #[test]
    fn acquire_until_exhausted_then_release() -> Result<(), PoolError> {
        let pool = BufferPool::new(3, 16);
        let a = pool.acquire().unwrap();
        let b = pool.acquire().unwrap();
        let c = pool.acquire().unwrap();
        assert!(pool.acquire().is_none());
        assert_eq!(pool.outstanding(), 3);
        assert_eq!(pool.free_count(), 0);

        pool.release(b)?;
        assert_eq!(pool.free_count(), 1);
        let d = pool.acquire().unwrap();
        assert_eq!(pool.outstanding(), 3);

        drop(a);
        c.release()?;
        drop(d);
        assert_eq!(pool.free_count(), 3);
        pool.check_invariant()
    }

    #[test]
    fn buffers_carry_len_and_tag() {
        let pool = BufferPool::new(1, 8);
        let mut buf = pool.acquire().unwrap();
        assert!(buf.is_empty());
        assert!(!buf.selected());
        buf.as_mut_slice()[..3].copy_from_slice(&[1, 2, 3]);
        buf.set_len(3);
        buf.set_selected(true);
        assert_eq!(buf.as_slice(), &[1, 2, 3]);
        assert!(buf.selected());
        assert_eq!(buf.capacity(), 8);
    }

    #[test]
    #[should_panic(expected = "exceeds slot size")]
    fn set_len_past_slot_panics() {
        let pool = BufferPool::new(1, 4);
        let mut buf = pool.acquire().unwrap();
        buf.set_len(5);
    }

    #[test]
    fn release_to_foreign_pool_is_rejected() {
        let home = BufferPool::new(2, 4);
        let other = BufferPool::new(2, 4);
        let buf = home.acquire().unwrap();
        let slot = buf.slot();
        assert_eq!(other.release(buf), Err(PoolError::ForeignHandle { slot }));
        // The rejected buffer went back to its own pool.
        assert_eq!(home.free_count(), 2);
        assert_eq!(other.free_count(), 2);
    }

    #[test]
    fn returning_a_free_slot_is_detected() {
        let pool = BufferPool::new(2, 4);
        let forged = vec![0u8; 4].into_boxed_slice();
        assert_eq!(
            pool.shared.return_slot(0, forged),
            Err(PoolError::NotOutstanding { slot: 0 })
        );
        let forged = vec![0u8; 4].into_boxed_slice();
        assert_eq!(
            pool.shared.return_slot(9, forged),
            Err(PoolError::UnknownSlot { slot: 9 })
        );
        assert!(pool.check_invariant().is_ok());
    }

    #[test]
    fn random_acquire_release_never_overlaps() {
        let mut rng = StdRng::seed_from_u64(0x5eed);
        for capacity in 1..=8 {
            let pool = BufferPool::new(capacity, 32);
            let mut held: Vec<PooledBuffer> = Vec::new();
            for _ in 0..500 {
                if rng.gen_bool(0.55) {
                    match pool.acquire() {
                        Some(buf) => held.push(buf),
                        None => assert_eq!(held.len(), capacity),
                    }
                } else if !held.is_empty() {
                    let idx = rng.gen_range(0..held.len());
                    pool.release(held.swap_remove(idx)).unwrap();
                }

                assert!(pool.outstanding() <= capacity);
                assert_eq!(pool.outstanding(), held.len());
                pool.check_invariant().unwrap();
                let slots: HashSet<usize> = held.iter().map(|b| b.slot()).collect();
                assert_eq!(slots.len(), held.len());
                let ptrs: HashSet<*const u8> =
                    held.iter_mut().map(|b| b.as_mut_slice().as_ptr()).collect();
                assert_eq!(ptrs.len(), held.len());
            }
        }
    }

    #[test]
    fn pool_shared_across_threads() {
        let pool = BufferPool::new(4, 64);
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let pool = pool.clone();
                std::thread::spawn(move || {
                    for _ in 0..200 {
                        if let Some(mut buf) = pool.acquire() {
                            buf.as_mut_slice()[0] = 1;
                            buf.set_len(1);
                        }
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(pool.free_count(), 4);
        assert!(pool.check_invariant().is_ok());
    }
}
