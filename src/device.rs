use crate::engine::{CacheMode, CowEngine, OverlayError, Result, BLOCK_SIZE};
use crate::next::NextLayer;

/// Classification of a run of consecutive blocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtentKind {
    /// Untouched; reads fall through to the backing store.
    Backing,
    /// Overlay data supersedes the backing store.
    Data,
    /// Reads as zeros (trimmed).
    Zero,
}

/// A maximal run of equally-classified bytes, clipped to the queried range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Extent {
    pub offset: u64,
    pub length: u64,
    pub kind: ExtentKind,
}

/// Byte-granularity facade over [`CowEngine`].
///
/// The engine only speaks whole blocks; this type splits arbitrary byte
/// ranges into block-aligned sub-operations, turning partial-block writes
/// and zeroes into read-modify-write cycles. It pairs the engine with its
/// backing store so callers hand over plain buffers and offsets.
pub struct CowDevice<N: NextLayer> {
    engine: CowEngine,
    next: N,
}

impl<N: NextLayer> CowDevice<N> {
    /// Creates the overlay for a device of `size` bytes backed by `next`.
    pub fn new(next: N, size: u64) -> Result<Self> {
        let engine = CowEngine::new()?;
        engine.set_size(size)?;
        Ok(CowDevice { engine, next })
    }

    /// Declared device size in bytes.
    pub fn size(&self) -> u64 {
        self.engine.size()
    }

    /// The block-level engine underneath, for callers that already hold
    /// block-aligned ranges.
    pub fn engine(&self) -> &CowEngine {
        &self.engine
    }

    /// Tears the facade apart, returning the engine and the backing store.
    pub fn into_parts(self) -> (CowEngine, N) {
        (self.engine, self.next)
    }

    fn check_range(&self, count: u64, offset: u64) -> Result<()> {
        let size = self.engine.size();
        match offset.checked_add(count) {
            Some(end) if end <= size => Ok(()),
            _ => Err(OverlayError::InvalidArgument(format!(
                "range {}+{} exceeds device size {}",
                offset, count, size
            ))),
        }
    }

    /// Reads `buf.len()` bytes at `offset`.
    pub fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<()> {
        self.check_range(buf.len() as u64, offset)?;

        let mut block = vec![0u8; BLOCK_SIZE];
        let mut done = 0;
        while done < buf.len() {
            let off = offset + done as u64;
            let blknum = off / BLOCK_SIZE as u64;
            let blkoffs = (off % BLOCK_SIZE as u64) as usize;
            let n = (BLOCK_SIZE - blkoffs).min(buf.len() - done);

            self.engine.read(&self.next, blknum, &mut block)?;
            buf[done..done + n].copy_from_slice(&block[blkoffs..blkoffs + n]);
            done += n;
        }
        Ok(())
    }

    /// Writes `buf.len()` bytes at `offset`. Whole aligned blocks go
    /// straight to the engine; partial blocks become a read-modify-write of
    /// the surrounding block.
    pub fn write_at(&self, buf: &[u8], offset: u64) -> Result<()> {
        self.check_range(buf.len() as u64, offset)?;

        let mut block = vec![0u8; BLOCK_SIZE];
        let mut done = 0;
        while done < buf.len() {
            let off = offset + done as u64;
            let blknum = off / BLOCK_SIZE as u64;
            let blkoffs = (off % BLOCK_SIZE as u64) as usize;
            let n = (BLOCK_SIZE - blkoffs).min(buf.len() - done);

            if n == BLOCK_SIZE {
                self.engine.write(blknum, &buf[done..done + n])?;
            } else {
                self.engine.read(&self.next, blknum, &mut block)?;
                block[blkoffs..blkoffs + n].copy_from_slice(&buf[done..done + n]);
                self.engine.write(blknum, &block)?;
            }
            done += n;
        }
        Ok(())
    }

    /// Writes zeros over `count` bytes at `offset`.
    pub fn zero_at(&self, count: u64, offset: u64) -> Result<()> {
        self.discard(count, offset)
    }

    /// Discards `count` bytes at `offset`; the range reads as zeros
    /// afterwards. No overlay space is reclaimed.
    pub fn trim_at(&self, count: u64, offset: u64) -> Result<()> {
        self.discard(count, offset)
    }

    // Whole blocks become trim markers; unaligned edges degrade to explicit
    // zero writes of the surrounding block.
    fn discard(&self, count: u64, offset: u64) -> Result<()> {
        self.check_range(count, offset)?;

        let mut block = vec![0u8; BLOCK_SIZE];
        let mut done = 0;
        while done < count {
            let off = offset + done;
            let blknum = off / BLOCK_SIZE as u64;
            let blkoffs = (off % BLOCK_SIZE as u64) as usize;
            let n = ((BLOCK_SIZE - blkoffs) as u64).min(count - done);

            if n == BLOCK_SIZE as u64 {
                self.engine.trim(blknum)?;
            } else {
                self.engine.read(&self.next, blknum, &mut block)?;
                block[blkoffs..blkoffs + n as usize].fill(0);
                self.engine.write(blknum, &block)?;
            }
            done += n;
        }
        Ok(())
    }

    /// Issues the prefetch/populate hint for every block touching the range.
    pub fn cache_at(&self, count: u64, offset: u64, mode: CacheMode) -> Result<()> {
        self.check_range(count, offset)?;
        if count == 0 {
            return Ok(());
        }

        let mut scratch = vec![0u8; BLOCK_SIZE];
        let first = offset / BLOCK_SIZE as u64;
        let last = (offset + count - 1) / BLOCK_SIZE as u64;
        for blknum in first..=last {
            self.engine.cache(&self.next, blknum, &mut scratch, mode)?;
        }
        Ok(())
    }

    /// Classifies the range into maximal runs of backing, overlay-data and
    /// zero bytes, clipped to the requested range.
    pub fn extents(&self, count: u64, offset: u64) -> Result<Vec<Extent>> {
        self.check_range(count, offset)?;

        let mut extents: Vec<Extent> = Vec::new();
        let mut done = 0;
        while done < count {
            let off = offset + done;
            let blknum = off / BLOCK_SIZE as u64;
            let blkoffs = off % BLOCK_SIZE as u64;
            let n = (BLOCK_SIZE as u64 - blkoffs).min(count - done);

            let status = self.engine.status(blknum);
            let kind = if status.trimmed {
                ExtentKind::Zero
            } else if status.present {
                ExtentKind::Data
            } else {
                ExtentKind::Backing
            };

            match extents.last_mut() {
                Some(prev) if prev.kind == kind => prev.length += n,
                _ => extents.push(Extent {
                    offset: off,
                    length: n,
                    kind,
                }),
            }
            done += n;
        }
        Ok(extents)
    }

    /// Syncs overlay data to disk.
    pub fn flush(&self) -> Result<()> {
        self.engine.flush()
    }
}
