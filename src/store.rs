use std::env;
use std::fs::File;
use std::io;
use std::os::unix::fs::FileExt;
use std::path::PathBuf;

use log::debug;

use crate::engine::BLOCK_SIZE;

/// Where overlay files land when `TMPDIR` is not set. `/var/tmp` because the
/// overlay can grow to the full device size and `/tmp` is often tmpfs.
const FALLBACK_DIR: &str = "/var/tmp";

/// The sparse temporary file holding every block the overlay has absorbed.
///
/// The file is unlinked the moment it is created, so it never appears in the
/// filesystem namespace and its storage is released when the handle drops.
/// Only bytes belonging to blocks the engine has marked allocated are
/// meaningful; everything else is garbage that must never be read without
/// consulting the map first.
pub struct OverlayStore {
    file: File,
}

impl OverlayStore {
    /// Creates the anonymous overlay file in `TMPDIR`, or [`FALLBACK_DIR`]
    /// when unset.
    pub fn create() -> io::Result<Self> {
        let dir = env::var_os("TMPDIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(FALLBACK_DIR));
        debug!("overlay: temporary directory: {}", dir.display());

        let file = tempfile::tempfile_in(&dir)?;
        Ok(OverlayStore { file })
    }

    /// Truncates or extends the file to `byte_len`. Extension is sparse:
    /// unwritten regions consume no backing storage.
    pub fn resize(&self, byte_len: u64) -> io::Result<()> {
        self.file.set_len(byte_len)
    }

    /// Reads exactly one block at a block-aligned offset with a single
    /// positioned read.
    pub fn read_block(&self, offset: u64, buf: &mut [u8]) -> io::Result<()> {
        debug_assert_eq!(buf.len(), BLOCK_SIZE);
        self.file.read_exact_at(buf, offset)
    }

    /// Writes exactly one block at a block-aligned offset with a single
    /// positioned write.
    pub fn write_block(&self, offset: u64, buf: &[u8]) -> io::Result<()> {
        debug_assert_eq!(buf.len(), BLOCK_SIZE);
        self.file.write_all_at(buf, offset)
    }

    /// Hints to the OS that the block at `offset` will be read soon.
    #[cfg(target_os = "linux")]
    pub fn advise(&self, offset: u64) -> io::Result<()> {
        use std::os::unix::io::AsRawFd;

        let r = unsafe {
            libc::posix_fadvise(
                self.file.as_raw_fd(),
                offset as libc::off_t,
                BLOCK_SIZE as libc::off_t,
                libc::POSIX_FADV_WILLNEED,
            )
        };
        if r != 0 {
            return Err(io::Error::from_raw_os_error(r));
        }
        Ok(())
    }

    /// No readahead advisory on this platform.
    #[cfg(not(target_os = "linux"))]
    pub fn advise(&self, _offset: u64) -> io::Result<()> {
        Ok(())
    }

    /// Flushes file data to disk. The file is already deleted so nobody can
    /// observe its metadata; only the data is synced.
    pub fn sync(&self) -> io::Result<()> {
        self.file.sync_data()
    }
}
