use std::io::Write;

use tempfile::NamedTempFile;

use cowblock::{CacheMode, CowDevice, ExtentKind, BLOCK_SIZE};

/// Backing image of `size` bytes with a position-dependent pattern, opened
/// read-only as the layer below the overlay.
fn image_device(size: usize) -> CowDevice<std::fs::File> {
    let mut tf = NamedTempFile::new().unwrap();
    let data: Vec<u8> = (0..size).map(|i| (i % 239) as u8).collect();
    tf.write_all(&data).unwrap();
    tf.flush().unwrap();

    CowDevice::new(tf.reopen().unwrap(), size as u64).unwrap()
}

fn pattern(offset: usize, len: usize) -> Vec<u8> {
    (offset..offset + len).map(|i| (i % 239) as u8).collect()
}

#[test]
fn overlay_over_file_image_serves_untouched_blocks_from_image() {
    // Unaligned device size: three blocks and change.
    let size = 3 * BLOCK_SIZE + 1000;
    let dev = image_device(size);

    let mut buf = vec![0u8; size];
    dev.read_at(&mut buf, 0).unwrap();
    assert_eq!(buf, pattern(0, size));
}

#[test]
fn writes_land_in_overlay_and_leave_the_image_alone() {
    let size = 2 * BLOCK_SIZE;
    let dev = image_device(size);

    dev.write_at(&vec![0xDD; 5000], 100).unwrap();
    dev.flush().unwrap();

    let mut buf = vec![0u8; size];
    dev.read_at(&mut buf, 0).unwrap();
    assert_eq!(&buf[..100], &pattern(0, 100)[..]);
    assert_eq!(&buf[100..5100], &vec![0xDD; 5000][..]);
    assert_eq!(&buf[5100..], &pattern(5100, size - 5100)[..]);

    // The image underneath is untouched.
    let (_engine, image) = dev.into_parts();
    use cowblock::NextLayer;
    let mut image_buf = vec![0u8; size];
    image.pread(&mut image_buf, 0).unwrap();
    assert_eq!(image_buf, pattern(0, size));
}

#[test]
fn promoting_final_partial_block_keeps_its_data_intact() {
    let size = BLOCK_SIZE + 100;
    let dev = image_device(size);

    // The image only covers 100 bytes of the final block; promotion must
    // not ask the image for more than that.
    dev.cache_at(100, BLOCK_SIZE as u64, CacheMode::Cow).unwrap();
    assert!(dev.engine().status(1).present);

    let mut buf = vec![0xFF; 100];
    dev.read_at(&mut buf, BLOCK_SIZE as u64).unwrap();
    assert_eq!(buf, pattern(BLOCK_SIZE, 100));
}

#[test]
fn trim_write_and_read_interleave_correctly() {
    let size = 4 * BLOCK_SIZE;
    let bs = BLOCK_SIZE as u64;
    let dev = image_device(size);

    dev.trim_at(2 * bs, bs).unwrap();
    dev.write_at(&vec![0x11; BLOCK_SIZE], 2 * bs).unwrap();

    let mut buf = vec![0u8; size];
    dev.read_at(&mut buf, 0).unwrap();
    assert_eq!(&buf[..BLOCK_SIZE], &pattern(0, BLOCK_SIZE)[..]);
    assert_eq!(&buf[BLOCK_SIZE..2 * BLOCK_SIZE], &vec![0u8; BLOCK_SIZE][..]);
    assert_eq!(&buf[2 * BLOCK_SIZE..3 * BLOCK_SIZE], &vec![0x11; BLOCK_SIZE][..]);
    assert_eq!(&buf[3 * BLOCK_SIZE..], &pattern(3 * BLOCK_SIZE, BLOCK_SIZE)[..]);

    let extents = dev.extents(size as u64, 0).unwrap();
    assert_eq!(
        extents
            .iter()
            .map(|e| (e.offset, e.length, e.kind))
            .collect::<Vec<_>>(),
        vec![
            (0, bs, ExtentKind::Backing),
            (bs, bs, ExtentKind::Zero),
            (2 * bs, bs, ExtentKind::Data),
            (3 * bs, bs, ExtentKind::Backing),
        ]
    );
}
