//! Minimal images for pipeline tests. Only the magic bytes matter to the
//! format sniffing; the rest is padding.
#![allow(dead_code)]

use vehicle_studio_pipeline::models::item::{ImageAsset, ImageMime, WorkItem};
use vehicle_studio_pipeline::services::validation;

const PNG_MAGIC: &[u8] = &[0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A];
const JPEG_MAGIC: &[u8] = &[0xFF, 0xD8, 0xFF, 0xE0];
const BMP_MAGIC: &[u8] = b"BM";

fn padded(magic: &[u8], len: usize, fill: u8) -> Vec<u8> {
    let mut bytes = magic.to_vec();
    bytes.resize(len.max(magic.len()), fill);
    bytes
}

/// A JPEG "photo"; `seed` makes the bytes distinct per item.
pub fn jpeg_photo(seed: u8) -> Vec<u8> {
    padded(JPEG_MAGIC, 2048, seed)
}

pub fn png_photo(seed: u8) -> Vec<u8> {
    padded(PNG_MAGIC, 2048, seed)
}

/// A bitmap: a real image format the pipeline does not accept.
pub fn bmp_image() -> Vec<u8> {
    padded(BMP_MAGIC, 2048, 0)
}

/// Reference background large enough to pass the 10 KiB floor.
pub fn reference_image() -> ImageAsset {
    validation::validate_reference(padded(PNG_MAGIC, 16 * 1024, 7)).expect("valid reference")
}

/// Image returned by the mock service on success.
pub fn generated_image() -> ImageAsset {
    ImageAsset::new(padded(PNG_MAGIC, 512, 0xAB), ImageMime::Png)
}

/// `count` validated Pending items.
pub fn photos(count: usize) -> Vec<WorkItem> {
    (0..count)
        .map(|i| WorkItem::from_upload(jpeg_photo(i as u8)).expect("valid photo"))
        .collect()
}
