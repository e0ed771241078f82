/// Bits in one byte of map storage.
const BITS: u64 = 8;

/// A resizable array of fixed-width entries, one entry per device block.
///
/// Entries are packed little-end-first into a byte vector, with the packing
/// arithmetic hidden behind `get`/`set`. An entry is 1, 2, 4 or 8 bits wide;
/// the engine tracks block state with 2-bit entries, so a 4K block size costs
/// 64 MB of map for a 1 TB device.
///
/// The map does no locking of its own. Thread safety is the caller's problem.
pub struct Bitmap {
    /// Bytes per tracked block. Power of two, fixed for the lifetime of the map.
    block_size: u64,
    /// Width of one entry in bits.
    bits_per_entry: u64,
    /// Packed entry storage. Bits at positions past `nr_blocks` are always zero.
    entries: Vec<u8>,
    /// Number of blocks currently tracked.
    nr_blocks: u64,
}

impl Bitmap {
    pub fn new(block_size: u64, bits_per_entry: u64) -> Self {
        assert!(
            block_size.is_power_of_two(),
            "block size must be a power of two"
        );
        assert!(
            bits_per_entry == 1 || bits_per_entry == 2 || bits_per_entry == 4 || bits_per_entry == 8,
            "entry width must divide a byte"
        );
        Self {
            block_size,
            bits_per_entry,
            entries: Vec::new(),
            nr_blocks: 0,
        }
    }

    fn entries_per_byte(&self) -> u64 {
        BITS / self.bits_per_entry
    }

    fn entry_mask(&self) -> u8 {
        (((1u16) << self.bits_per_entry) - 1) as u8
    }

    /// Recomputes the block count for a device of `device_size` bytes and
    /// grows or shrinks the backing storage to match. Entries below the new
    /// block count keep their values; new entries read back as zero.
    pub fn resize(&mut self, device_size: u64) {
        let epb = self.entries_per_byte();
        let nr_blocks = (device_size + self.block_size - 1) / self.block_size;
        let nr_bytes = ((nr_blocks + epb - 1) / epb) as usize;

        self.entries.resize(nr_bytes, 0);
        self.nr_blocks = nr_blocks;

        // A shrink can strand stale entries in the tail of the final byte.
        // Clear them so a later grow exposes fresh zero entries.
        let slack = nr_blocks % epb;
        if slack != 0 {
            let keep = (slack * self.bits_per_entry) as u32;
            if let Some(last) = self.entries.last_mut() {
                *last &= (1u8 << keep) - 1;
            }
        }
    }

    pub fn nr_blocks(&self) -> u64 {
        self.nr_blocks
    }

    /// Returns the entry for `blknum`, or `default` if the block is out of
    /// range. The default lets callers treat reads past end-of-device
    /// rounding as "not allocated" without a separate branch.
    pub fn get(&self, blknum: u64, default: u8) -> u8 {
        if blknum >= self.nr_blocks {
            return default;
        }
        let epb = self.entries_per_byte();
        let byte = self.entries[(blknum / epb) as usize];
        let shift = ((blknum % epb) * self.bits_per_entry) as u32;
        (byte >> shift) & self.entry_mask()
    }

    /// Stores `entry` for `blknum`. The block must be in range; the engine
    /// always resizes the map before addressing a block.
    pub fn set(&mut self, blknum: u64, entry: u8) {
        assert!(
            blknum < self.nr_blocks,
            "block {} out of range ({} tracked)",
            blknum,
            self.nr_blocks
        );
        let mask = self.entry_mask();
        debug_assert_eq!(entry & !mask, 0, "entry wider than {} bits", self.bits_per_entry);

        let epb = self.entries_per_byte();
        let idx = (blknum / epb) as usize;
        let shift = ((blknum % epb) * self.bits_per_entry) as u32;
        self.entries[idx] = (self.entries[idx] & !(mask << shift)) | ((entry & mask) << shift);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_map_returns_default_for_any_block() {
        let bm = Bitmap::new(4096, 2);
        assert_eq!(bm.get(0, 0), 0);
        assert_eq!(bm.get(17, 3), 3);
    }

    #[test]
    fn can_read_and_write_entries() {
        let mut bm = Bitmap::new(4096, 2);
        bm.resize(16 * 4096);

        bm.set(2, 1);
        bm.set(3, 3);

        assert_eq!(bm.get(1, 0), 0);
        assert_eq!(bm.get(2, 0), 1);
        assert_eq!(bm.get(3, 0), 3);
    }

    #[test]
    fn neighboring_entries_are_independent() {
        let mut bm = Bitmap::new(4096, 2);
        bm.resize(8 * 4096);

        // All four entries of one storage byte.
        bm.set(0, 3);
        bm.set(1, 1);
        bm.set(2, 3);
        bm.set(3, 1);
        bm.set(1, 0);

        assert_eq!(bm.get(0, 0), 3);
        assert_eq!(bm.get(1, 3), 0);
        assert_eq!(bm.get(2, 0), 3);
        assert_eq!(bm.get(3, 0), 1);
    }

    #[test]
    fn can_set_entries_at_ends_of_map() {
        let mut bm = Bitmap::new(4096, 2);
        bm.resize(64 * 4096);

        bm.set(0, 1);
        bm.set(63, 3);

        assert_eq!(bm.get(0, 0), 1);
        assert_eq!(bm.get(63, 0), 3);
    }

    #[test]
    fn block_count_rounds_up_for_unaligned_sizes() {
        let mut bm = Bitmap::new(4096, 2);
        bm.resize(4096 * 2 + 1);
        assert_eq!(bm.nr_blocks(), 3);

        bm.resize(1);
        assert_eq!(bm.nr_blocks(), 1);
    }

    #[test]
    fn grow_preserves_existing_entries() {
        let mut bm = Bitmap::new(4096, 2);
        bm.resize(4 * 4096);
        bm.set(0, 1);
        bm.set(3, 3);

        bm.resize(128 * 4096);

        assert_eq!(bm.get(0, 0), 1);
        assert_eq!(bm.get(3, 0), 3);
        assert_eq!(bm.get(4, 0), 0);
        assert_eq!(bm.get(127, 0), 0);
    }

    #[test]
    fn shrink_then_grow_resets_reclaimed_entries() {
        let mut bm = Bitmap::new(4096, 2);
        bm.resize(8 * 4096);
        for blk in 0..8 {
            bm.set(blk, 3);
        }

        // Shrink to a partial storage byte, then grow back.
        bm.resize(3 * 4096);
        bm.resize(8 * 4096);

        assert_eq!(bm.get(0, 0), 3);
        assert_eq!(bm.get(2, 0), 3);
        for blk in 3..8 {
            assert_eq!(bm.get(blk, 0), 0, "block {} survived the shrink", blk);
        }
    }

    #[test]
    fn out_of_range_reads_after_shrink_return_default() {
        let mut bm = Bitmap::new(4096, 1);
        bm.resize(16 * 4096);
        bm.set(12, 1);

        bm.resize(4 * 4096);
        assert_eq!(bm.get(12, 0), 0);
    }

    #[test]
    #[should_panic(expected = "out of range")]
    fn setting_out_of_range_block_panics() {
        let mut bm = Bitmap::new(4096, 2);
        bm.resize(2 * 4096);
        bm.set(2, 1);
    }

    #[test]
    fn single_bit_entries_pack_eight_per_byte() {
        let mut bm = Bitmap::new(512, 1);
        bm.resize(9 * 512);

        bm.set(7, 1);
        bm.set(8, 1);

        assert_eq!(bm.get(6, 0), 0);
        assert_eq!(bm.get(7, 0), 1);
        assert_eq!(bm.get(8, 0), 1);
    }
}
