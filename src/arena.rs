//! Reference-counted pixel buffer arena (spec §3 "FrameArena", §4.1).
//!
//! Buffers are allocated in blocks of [`SLOTS_PER_BLOCK`] slots so the hot
//! capture/decode path only touches the general allocator when every
//! existing block is full. Slot claim/release is lock-free; only the
//! block list itself (grown on overflow, shrunk by [`FrameArena::gc`])
//! takes a mutex, matching spec §5's "shared-resource policy".

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};

use crate::frame::PixelFormat;

pub const SLOTS_PER_BLOCK: usize = 8;

/// `(width, height, pixel_format)` — an arena's fixed buffer geometry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArenaConfig {
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
}

struct Block {
    storage: Box<[u8]>,
    free: [AtomicBool; SLOTS_PER_BLOCK],
    slot_len: usize,
}

impl Block {
    fn new(slot_len: usize) -> Arc<Block> {
        Arc::new(Block {
            storage: vec![0u8; slot_len * SLOTS_PER_BLOCK].into_boxed_slice(),
            free: std::array::from_fn(|_| AtomicBool::new(true)),
            slot_len,
        })
    }

    fn all_free(&self) -> bool {
        self.free.iter().all(|f| f.load(Ordering::Acquire))
    }

    /// # Safety
    /// Caller guarantees exclusive access to the `slot_len`-byte region at
    /// `slot`: the slot's `free` flag was just claimed via CAS by this
    /// caller, so no other `Buffer` can observe or touch this range.
    unsafe fn slice_mut(&self, slot: usize) -> &mut [u8] {
        let ptr = self.storage.as_ptr().add(slot * self.slot_len) as *mut u8;
        std::slice::from_raw_parts_mut(ptr, self.slot_len)
    }

    fn slice(&self, slot: usize) -> &[u8] {
        let start = slot * self.slot_len;
        &self.storage[start..start + self.slot_len]
    }
}

struct ArenaInner {
    config: ArenaConfig,
    slot_len: usize,
    blocks: Mutex<Vec<Arc<Block>>>,
    live: AtomicUsize,
    superseded: AtomicBool,
    drain: Mutex<()>,
    drain_cv: Condvar,
}

impl ArenaInner {
    fn release_slot(&self, block: &Block, slot: usize) {
        let was_free = block.free[slot].swap(true, Ordering::AcqRel);
        assert!(!was_free, "double-free of arena slot {slot}: fatal arena corruption");
        let remaining = self.live.fetch_sub(1, Ordering::AcqRel) - 1;
        if remaining == 0 && self.superseded.load(Ordering::Acquire) {
            let _guard = self.drain.lock().unwrap();
            self.drain_cv.notify_all();
        }
    }
}

/// A pool of equally-sized pixel buffers. Cheap to clone: internally an
/// `Arc`, so every clone shares the same block list and live counter.
#[derive(Clone)]
pub struct FrameArena {
    inner: Arc<ArenaInner>,
}

impl FrameArena {
    /// `open(w, h, format)` — initializes a pool with a single empty block
    /// (spec §4.1). The first block is allocated lazily on the first
    /// `alloc()` so opening an arena that is never used costs nothing.
    pub fn open(width: u32, height: u32, format: PixelFormat) -> FrameArena {
        let config = ArenaConfig { width, height, format };
        let slot_len = format.plane_size_bytes(width, height);
        FrameArena {
            inner: Arc::new(ArenaInner {
                config,
                slot_len,
                blocks: Mutex::new(Vec::new()),
                live: AtomicUsize::new(0),
                superseded: AtomicBool::new(false),
                drain: Mutex::new(()),
                drain_cv: Condvar::new(),
            }),
        }
    }

    pub fn config(&self) -> ArenaConfig {
        self.inner.config
    }

    /// Claims a free slot, growing the pool by one 8-slot block if every
    /// existing block is full. Never blocks (spec §4.1 invariant).
    pub fn alloc(&self) -> Buffer {
        debug_assert!(
            !self.inner.superseded.load(Ordering::Acquire),
            "alloc from a superseded arena: caller should have switched to the reconfigured arena"
        );
        let inner = &self.inner;
        {
            let blocks = inner.blocks.lock().unwrap();
            if let Some((block, slot)) = try_claim(&blocks) {
                inner.live.fetch_add(1, Ordering::AcqRel);
                return Buffer { arena: self.inner.clone(), block, slot };
            }
        }
        // No free slot anywhere: grow by one block under the list lock.
        let mut blocks = inner.blocks.lock().unwrap();
        // Re-check: another thread may have grown the pool while we waited
        // for the lock.
        if let Some((block, slot)) = try_claim(&blocks) {
            drop(blocks);
            inner.live.fetch_add(1, Ordering::AcqRel);
            return Buffer { arena: self.inner.clone(), block, slot };
        }
        let new_block = Block::new(inner.slot_len);
        let claimed = new_block.free[0].swap(false, Ordering::AcqRel);
        debug_assert!(claimed, "fresh block slot 0 must start free");
        blocks.push(new_block.clone());
        drop(blocks);
        inner.live.fetch_add(1, Ordering::AcqRel);
        Buffer { arena: self.inner.clone(), block: new_block, slot: 0 }
    }

    /// Frees empty blocks eagerly.
    pub fn gc(&self) {
        let mut blocks = self.inner.blocks.lock().unwrap();
        blocks.retain(|b| !b.all_free());
    }

    /// Number of live (claimed) slots and the number of allocated blocks —
    /// exposed for tests and diagnostics.
    pub fn stats(&self) -> (usize, usize) {
        let blocks = self.inner.blocks.lock().unwrap();
        (self.inner.live.load(Ordering::Acquire), blocks.len())
    }

    /// Marks this arena superseded and blocks until every outstanding
    /// buffer has been dropped. Matches spec §4.1: "destroying an arena
    /// while any slot is live is a fatal error" — this is the one sanctioned
    /// path to reclaiming an arena, and it simply waits rather than erroring.
    pub fn close(self) {
        self.inner.superseded.store(true, Ordering::Release);
        let mut guard = self.inner.drain.lock().unwrap();
        while self.inner.live.load(Ordering::Acquire) > 0 {
            guard = self.inner.drain_cv.wait(guard).unwrap();
        }
    }

    /// Supersedes this arena and opens its replacement with the new
    /// geometry (spec §4.1: "the old arena is marked superseded; no new
    /// allocations occur from it... destroyed only when its last buffer is
    /// released"). Unlike [`FrameArena::close`], this does not block: the
    /// old arena's outstanding buffers keep draining in the background and
    /// its `ArenaInner` is freed the moment the last one is dropped, which
    /// is what a repeat `ConfigureStreamRequest` needs — the caller wants
    /// the replacement immediately, not after every in-flight frame lands.
    pub fn reconfigure(self, width: u32, height: u32, format: PixelFormat) -> FrameArena {
        self.inner.superseded.store(true, Ordering::Release);
        FrameArena::open(width, height, format)
    }
}

fn try_claim(blocks: &[Arc<Block>]) -> Option<(Arc<Block>, usize)> {
    for block in blocks {
        for (slot, flag) in block.free.iter().enumerate() {
            if flag.compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire).is_ok() {
                return Some((block.clone(), slot));
            }
        }
    }
    None
}

/// A single claimed slot. Returned to its block automatically on drop.
pub struct Buffer {
    arena: Arc<ArenaInner>,
    block: Arc<Block>,
    slot: usize,
}

impl Buffer {
    pub fn as_slice(&self) -> &[u8] {
        self.block.slice(self.slot)
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        // SAFETY: this slot's `free` flag is false (claimed) for exactly the
        // lifetime of this `Buffer`, and no other `Buffer` can exist for the
        // same (block, slot) pair while that holds — `alloc` only hands out
        // a slot after winning the CAS on its flag, and `Drop` flips the
        // flag back only after this reference has gone out of scope.
        unsafe { self.block.slice_mut(self.slot) }
    }

    pub fn len(&self) -> usize {
        self.block.slot_len
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Drop for Buffer {
    fn drop(&mut self) {
        self.arena.release_slot(&self.block, self.slot);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alloc_reuses_freed_slots() {
        let arena = FrameArena::open(4, 4, PixelFormat::Bgra8);
        let a = arena.alloc();
        drop(a);
        let (live, blocks) = arena.stats();
        assert_eq!(live, 0);
        assert_eq!(blocks, 1);
        let _b = arena.alloc();
        let (live, blocks) = arena.stats();
        assert_eq!(live, 1);
        assert_eq!(blocks, 1);
    }

    #[test]
    fn alloc_grows_new_block_when_full() {
        let arena = FrameArena::open(2, 2, PixelFormat::Bgra8);
        let mut held = Vec::new();
        for _ in 0..SLOTS_PER_BLOCK {
            held.push(arena.alloc());
        }
        let (_, blocks) = arena.stats();
        assert_eq!(blocks, 1);
        let extra = arena.alloc();
        let (live, blocks) = arena.stats();
        assert_eq!(blocks, 2);
        assert_eq!(live, SLOTS_PER_BLOCK + 1);
        drop(extra);
        drop(held);
    }

    #[test]
    fn gc_frees_empty_blocks() {
        let arena = FrameArena::open(2, 2, PixelFormat::Bgra8);
        let mut held = Vec::new();
        for _ in 0..(SLOTS_PER_BLOCK + 1) {
            held.push(arena.alloc());
        }
        held.clear();
        arena.gc();
        let (live, blocks) = arena.stats();
        assert_eq!(live, 0);
        assert_eq!(blocks, 0);
    }

    #[test]
    fn close_waits_for_drain() {
        let arena = FrameArena::open(2, 2, PixelFormat::Bgra8);
        let buf = arena.alloc();
        let arena2 = arena.clone();
        let handle = std::thread::spawn(move || {
            std::thread::sleep(std::time::Duration::from_millis(20));
            drop(buf);
        });
        arena2.close();
        handle.join().unwrap();
    }

    #[test]
    fn reconfigure_supersedes_old_without_blocking() {
        let old = FrameArena::open(2, 2, PixelFormat::Bgra8);
        let still_live = old.alloc();
        let old_handle = old.clone();
        let new = old.reconfigure(4, 4, PixelFormat::Bgra8);

        assert_eq!(new.config().width, 4);
        let (live, _) = new.stats();
        assert_eq!(live, 0);

        // The old arena's live buffer is unaffected; it is freed normally
        // on drop, not force-reclaimed by `reconfigure`.
        let (old_live, _) = old_handle.stats();
        assert_eq!(old_live, 1);
        drop(still_live);
        let (old_live, _) = old_handle.stats();
        assert_eq!(old_live, 0);
    }

    #[test]
    #[should_panic(expected = "superseded")]
    fn alloc_from_superseded_arena_panics() {
        let old = FrameArena::open(2, 2, PixelFormat::Bgra8);
        let old_handle = old.clone();
        let _new = old.reconfigure(4, 4, PixelFormat::Bgra8);
        old_handle.alloc();
    }

    #[test]
    #[should_panic(expected = "double-free")]
    fn double_free_is_fatal() {
        let arena = FrameArena::open(2, 2, PixelFormat::Bgra8);
        let buf = arena.alloc();
        let block = buf.block.clone();
        let slot = buf.slot;
        let inner = buf.arena.clone();
        drop(buf);
        // Simulate a second release of the same slot bypassing `Buffer`'s
        // normal single-owner discipline, to exercise the fatal-error path.
        inner.release_slot(&block, slot);
    }

    #[test]
    fn plane_size_accounts_for_chroma_subsampling() {
        assert_eq!(PixelFormat::Bgra8.plane_size_bytes(2, 2), 16);
        assert_eq!(PixelFormat::Nv12.plane_size_bytes(2, 2), 6);
    }
}
