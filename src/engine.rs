use std::io;
use std::sync::{Mutex, MutexGuard};

use log::debug;
use thiserror::Error;

use crate::bitmap::Bitmap;
use crate::next::NextLayer;
use crate::store::OverlayStore;

/// Size of one overlay block. All engine I/O is confined to whole blocks at
/// block-aligned offsets; callers split unaligned byte ranges beforehand.
pub const BLOCK_SIZE: usize = 4096;

/// Map entry encodings. Two bits per block; encoding 2 is reserved.
const ENTRY_NOT_ALLOCATED: u8 = 0;
const ENTRY_ALLOCATED: u8 = 1;
const ENTRY_TRIMMED: u8 = 3;

const MAP_BITS_PER_ENTRY: u64 = 2;

#[derive(Error, Debug)]
pub enum OverlayError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("overlay store i/o")]
    Overlay(#[source] io::Error),
    #[error("backing store i/o")]
    Backing(#[source] io::Error),
}

impl OverlayError {
    /// The OS error code behind this failure, if the OS produced one. The
    /// server layer maps this onto its client-facing error channel.
    pub fn raw_os_error(&self) -> Option<i32> {
        match self {
            OverlayError::InvalidArgument(_) => None,
            OverlayError::Overlay(e) | OverlayError::Backing(e) => e.raw_os_error(),
        }
    }
}

pub type Result<T> = std::result::Result<T, OverlayError>;

/// Where the authoritative copy of a block currently lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BlockState {
    /// Only in the backing store; reads fall through.
    NotAllocated,
    /// In the overlay file at the block's offset.
    Allocated,
    /// Logically zero; any overlay content for the block is stale.
    Trimmed,
}

impl BlockState {
    fn from_entry(entry: u8) -> Self {
        match entry {
            ENTRY_NOT_ALLOCATED => BlockState::NotAllocated,
            ENTRY_ALLOCATED => BlockState::Allocated,
            ENTRY_TRIMMED => BlockState::Trimmed,
            _ => unreachable!("map entry holds reserved encoding {}", entry),
        }
    }

    fn as_str(self) -> &'static str {
        match self {
            BlockState::NotAllocated => "not allocated",
            BlockState::Allocated => "allocated",
            BlockState::Trimmed => "trimmed",
        }
    }
}

/// What [`CowEngine::cache`] does for a block the overlay has not absorbed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheMode {
    /// Do nothing.
    Ignore,
    /// Forward the prefetch hint to the backing store without copying data.
    Passthrough,
    /// Read from the backing store and persist into the overlay, promoting
    /// the block the same way a write would.
    Cow,
    /// For blocks already in the overlay, hint the OS that the overlay
    /// region will be needed soon. Never changes block state.
    Advise,
}

/// Read-only classification of one block, consumed by extent reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockStatus {
    /// The overlay supersedes the backing store for this block.
    pub present: bool,
    /// The block reads as zeros.
    pub trimmed: bool,
}

struct Shared {
    map: Bitmap,
    /// Virtual device size in bytes. Set by `set_size` before any block
    /// operation is issued.
    size: u64,
}

/// The copy-on-write block engine. One instance per virtual device.
///
/// Every write and trim is absorbed by a sparse, already-deleted temporary
/// file; reads fall through to the backing store for blocks never touched.
/// A 2-bit map entry records where each block's authoritative data lives.
///
/// Writes commit data to the overlay file before flipping the map entry, so
/// a reader that observes the allocated state is guaranteed to read at least
/// that write's data. Dropping the engine closes the overlay file, which
/// releases its storage.
pub struct CowEngine {
    overlay: OverlayStore,
    /// Guards the allocation map and device size. Held only long enough to
    /// read or flip one entry, except in `cache` which runs its whole body
    /// under the lock.
    shared: Mutex<Shared>,
}

fn round_up(n: u64, align: u64) -> u64 {
    (n + align - 1) / align * align
}

/// Bytes of the block at `offset` that fall inside the device. Anything
/// past that is the tail of a final, unaligned block and reads as zero.
fn in_range_prefix(offset: u64, size: u64) -> usize {
    let tail = (offset + BLOCK_SIZE as u64).saturating_sub(size);
    BLOCK_SIZE.saturating_sub(tail as usize)
}

impl CowEngine {
    /// Allocates the anonymous overlay file and an empty map. [`set_size`]
    /// must be called before any block operation.
    ///
    /// [`set_size`]: CowEngine::set_size
    pub fn new() -> Result<Self> {
        let overlay = OverlayStore::create().map_err(OverlayError::Overlay)?;
        Ok(CowEngine {
            overlay,
            shared: Mutex::new(Shared {
                map: Bitmap::new(BLOCK_SIZE as u64, MAP_BITS_PER_ENTRY),
                size: 0,
            }),
        })
    }

    fn lock(&self) -> MutexGuard<'_, Shared> {
        self.shared.lock().unwrap()
    }

    fn state_of(shared: &Shared, blknum: u64) -> BlockState {
        BlockState::from_entry(shared.map.get(blknum, ENTRY_NOT_ALLOCATED))
    }

    /// Declared size of the virtual device in bytes.
    pub fn size(&self) -> u64 {
        self.lock().size
    }

    /// Number of blocks the device rounds up to.
    pub fn nr_blocks(&self) -> u64 {
        self.lock().map.nr_blocks()
    }

    /// Sets or changes the virtual device size, resizing the map and the
    /// overlay file together. Block states below the new size survive a
    /// resize; a shrink discards the rest.
    pub fn set_size(&self, new_size: u64) -> Result<()> {
        let mut shared = self.lock();
        shared.size = new_size;
        shared.map.resize(new_size);

        let rounded = round_up(new_size, BLOCK_SIZE as u64);
        debug!(
            "cow: device size {} bytes, overlay {} bytes, {} blocks",
            new_size,
            rounded,
            shared.map.nr_blocks()
        );
        self.overlay.resize(rounded).map_err(OverlayError::Overlay)
    }

    /// Reads one whole block into `buf`.
    ///
    /// The map entry is only a snapshot: a concurrent writer may promote
    /// this block while a backing-store read is in flight, in which case
    /// this read legitimately returns the pre-write data. A read issued
    /// after a write call has returned always observes the written data.
    pub fn read<N: NextLayer>(&self, next: &N, blknum: u64, buf: &mut [u8]) -> Result<()> {
        assert_eq!(buf.len(), BLOCK_SIZE);
        let offset = blknum * BLOCK_SIZE as u64;

        let (state, size) = {
            let shared = self.lock();
            (Self::state_of(&shared, blknum), shared.size)
        };
        debug!(
            "cow: read block {} (offset {}) is {}",
            blknum,
            offset,
            state.as_str()
        );

        match state {
            BlockState::NotAllocated => {
                // The final block of an unaligned device extends past the
                // declared size; never ask the backing store for those bytes.
                let n = in_range_prefix(offset, size);
                next.pread(&mut buf[..n], offset)
                    .map_err(OverlayError::Backing)?;
                buf[n..].fill(0);
                Ok(())
            }
            BlockState::Allocated => self
                .overlay
                .read_block(offset, buf)
                .map_err(OverlayError::Overlay),
            BlockState::Trimmed => {
                buf.fill(0);
                Ok(())
            }
        }
    }

    /// Writes one whole block. The data lands in the overlay file before
    /// the map entry flips to allocated.
    pub fn write(&self, blknum: u64, buf: &[u8]) -> Result<()> {
        assert_eq!(buf.len(), BLOCK_SIZE);
        let offset = blknum * BLOCK_SIZE as u64;
        debug!("cow: write block {} (offset {})", blknum, offset);

        self.overlay
            .write_block(offset, buf)
            .map_err(OverlayError::Overlay)?;
        self.lock().map.set(blknum, ENTRY_ALLOCATED);
        Ok(())
    }

    /// Marks one block logically zero. No overlay data is written or
    /// reclaimed; a later write must store real data before the block reads
    /// as anything but zeros again.
    pub fn trim(&self, blknum: u64) -> Result<()> {
        debug!("cow: trim block {}", blknum);
        self.lock().map.set(blknum, ENTRY_TRIMMED);
        Ok(())
    }

    /// Prefetch/populate hint for one block. `buf` is scratch space of one
    /// block. Trimmed blocks need no caching and are always a no-op.
    ///
    /// The whole operation holds the map lock.
    pub fn cache<N: NextLayer>(
        &self,
        next: &N,
        blknum: u64,
        buf: &mut [u8],
        mode: CacheMode,
    ) -> Result<()> {
        assert_eq!(buf.len(), BLOCK_SIZE);
        let offset = blknum * BLOCK_SIZE as u64;

        let mut shared = self.lock();
        let state = Self::state_of(&shared, blknum);
        let n = in_range_prefix(offset, shared.size);
        debug!(
            "cow: cache block {} (offset {}) is {}",
            blknum,
            offset,
            state.as_str()
        );

        match state {
            BlockState::Allocated => {
                if mode == CacheMode::Advise {
                    self.overlay.advise(offset).map_err(OverlayError::Overlay)?;
                }
                Ok(())
            }
            BlockState::Trimmed => Ok(()),
            BlockState::NotAllocated => match mode {
                CacheMode::Ignore | CacheMode::Advise => Ok(()),
                CacheMode::Passthrough => {
                    next.cache(n, offset).map_err(OverlayError::Backing)
                }
                CacheMode::Cow => {
                    next.pread(&mut buf[..n], offset)
                        .map_err(OverlayError::Backing)?;
                    buf[n..].fill(0);
                    self.overlay
                        .write_block(offset, buf)
                        .map_err(OverlayError::Overlay)?;
                    shared.map.set(blknum, ENTRY_ALLOCATED);
                    Ok(())
                }
            },
        }
    }

    /// Allocation state of one block. Never mutates.
    pub fn status(&self, blknum: u64) -> BlockStatus {
        let shared = self.lock();
        let state = Self::state_of(&shared, blknum);
        BlockStatus {
            present: state != BlockState::NotAllocated,
            trimmed: state == BlockState::Trimmed,
        }
    }

    /// Syncs overlay data to disk.
    pub fn flush(&self) -> Result<()> {
        self.overlay.sync().map_err(OverlayError::Overlay)
    }
}
