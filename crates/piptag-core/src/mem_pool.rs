//! Double-buffered packet memory pool.
//!
//! Sensing engines append their payload bytes here during an epoch and the
//! radio transmits the active arena as the packet tail. Two arenas alternate
//! roles every epoch so the tag can tell whether this epoch's payload differs
//! from the previous one without keeping a separate copy.
//!
//! ```rust,ignore
//! let mut pool = MemoryPool::new();
//! let light = pool.allocate(1)?;
//! pool.window_mut(light)[0] = 0x42;
//! radio.transmit(pool.base()).await?;
//! pool.reset_epoch();
//! ```

use thiserror_no_std::Error;

/// Capacity of each arena in bytes.
pub const POOL_CAPACITY: usize = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum PoolError {
    #[error("Memory pool capacity exceeded (requested {requested}, available {available})")]
    CapacityExceeded { requested: usize, available: usize },
}

/// Capacity-checked index token for an allocated window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolWindow {
    start: usize,
    len: usize,
}

impl PoolWindow {
    pub const fn start(&self) -> usize {
        self.start
    }

    pub const fn len(&self) -> usize {
        self.len
    }

    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Arena {
    A,
    B,
}

impl Arena {
    const fn other(self) -> Self {
        match self {
            Arena::A => Arena::B,
            Arena::B => Arena::A,
        }
    }
}

pub struct MemoryPool {
    arena_a: [u8; POOL_CAPACITY],
    arena_b: [u8; POOL_CAPACITY],
    active: Arena,
    cursor: usize,
    previous_len: usize,
}

impl Default for MemoryPool {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryPool {
    pub const fn new() -> Self {
        Self {
            arena_a: [0; POOL_CAPACITY],
            arena_b: [0; POOL_CAPACITY],
            active: Arena::A,
            cursor: 0,
            previous_len: 0,
        }
    }

    /// Reserve `len` zeroed bytes at the end of the active arena.
    pub fn allocate(&mut self, len: usize) -> Result<PoolWindow, PoolError> {
        let available = POOL_CAPACITY - self.cursor;
        if len > available {
            log::error!(
                "Memory pool overrun: requested {} bytes with {} available",
                len,
                available
            );
            return Err(PoolError::CapacityExceeded {
                requested: len,
                available,
            });
        }

        let start = self.cursor;
        self.cursor += len;
        self.active_mut()[start..start + len].fill(0);

        Ok(PoolWindow { start, len })
    }

    /// Allocate a window and copy `bytes` into it.
    pub fn push(&mut self, bytes: &[u8]) -> Result<PoolWindow, PoolError> {
        let window = self.allocate(bytes.len())?;
        self.window_mut(window).copy_from_slice(bytes);
        Ok(window)
    }

    pub fn window(&self, window: PoolWindow) -> &[u8] {
        &self.active()[window.start..window.start + window.len]
    }

    pub fn window_mut(&mut self, window: PoolWindow) -> &mut [u8] {
        &mut self.active_mut()[window.start..window.start + window.len]
    }

    /// Bytes written to the active arena so far.
    pub fn base(&self) -> &[u8] {
        &self.active()[..self.cursor]
    }

    pub fn size(&self) -> usize {
        self.cursor
    }

    pub fn is_empty(&self) -> bool {
        self.cursor == 0
    }

    /// Whether the active arena differs from the one written last epoch.
    pub fn changed(&self) -> bool {
        if self.previous_len != self.cursor {
            return true;
        }
        self.arena_a[..self.previous_len] != self.arena_b[..self.previous_len]
    }

    /// Swap arenas and rewind. Call exactly once per epoch, after transmission.
    pub fn reset_epoch(&mut self) {
        self.previous_len = self.cursor;
        self.active = self.active.other();
        self.cursor = 0;
    }

    fn active(&self) -> &[u8; POOL_CAPACITY] {
        match self.active {
            Arena::A => &self.arena_a,
            Arena::B => &self.arena_b,
        }
    }

    fn active_mut(&mut self) -> &mut [u8; POOL_CAPACITY] {
        match self.active {
            Arena::A => &mut self.arena_a,
            Arena::B => &mut self.arena_b,
        }
    }
}
