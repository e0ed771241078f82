//! A disposable copy-on-write block overlay.
//!
//! The overlay sits between a block-device server and a read-only (or merely
//! slower) backing store. Every write, zero and trim is absorbed by a large,
//! sparse, already-deleted temporary file; reads fall through to the backing
//! store for any block never touched. Being sparse, the overlay initially
//! takes up no space, and being deleted, it vanishes with the process.
//!
//! A 2-bit-per-block map records for each block of the temporary file whether
//! it is not allocated (read through to the backing store), allocated in the
//! overlay, or trimmed (reads as zeros). [`CowEngine`] exposes these block
//! operations directly; [`CowDevice`] layers byte-granularity reads, writes,
//! zeroes and trims on top, turning partial-block operations into
//! read-modify-write cycles.
//!
//! The overlay is never persisted and never re-validated against the backing
//! store: the backing store must return identical data for repeated reads of
//! an unmodified range.

mod bitmap;
mod device;
mod engine;
mod next;
mod store;

pub use crate::device::{CowDevice, Extent, ExtentKind};
pub use crate::engine::{
    BlockStatus, CacheMode, CowEngine, OverlayError, Result, BLOCK_SIZE,
};
pub use crate::next::NextLayer;
