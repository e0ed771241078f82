use std::fs::File;
use std::io;
use std::os::unix::fs::FileExt;

/// The layer below the overlay: the authoritative source for every block the
/// overlay has not absorbed. Read-only from the engine's point of view.
///
/// Implementations must return byte-identical data for repeated reads of the
/// same unmodified range. The engine promotes blocks into the overlay on that
/// assumption and never re-validates backing data once copied.
pub trait NextLayer {
    /// Reads exactly `buf.len()` bytes at `offset`. The engine never asks
    /// for bytes past the declared device size.
    fn pread(&self, buf: &mut [u8], offset: u64) -> io::Result<()>;

    /// Advises the layer that `count` bytes at `offset` will be needed soon.
    /// Purely a hint; the default does nothing.
    fn cache(&self, count: usize, offset: u64) -> io::Result<()> {
        let _ = (count, offset);
        Ok(())
    }
}

/// A plain file can serve as the backing store, e.g. a read-only disk image.
impl NextLayer for File {
    fn pread(&self, buf: &mut [u8], offset: u64) -> io::Result<()> {
        self.read_exact_at(buf, offset)
    }
}
