//! Shared test utilities for the pixshift test suite.
//!
//! Builds small real images in memory so codec round trips never need
//! fixture files, plus service wiring over the [`MockCodec`].
//!
//! # Usage
//!
//! ```rust
//! use crate::test_helpers::*;
//!
//! let png = rgba_png(64, 48);
//! let jpeg = gradient_jpeg(200, 100);
//! let service = mock_service();
//! ```

use std::io::Cursor;
use std::sync::Arc;

use image::{DynamicImage, ImageFormat, Rgb, RgbImage, Rgba, RgbaImage};

use crate::clock::ManualClock;
use crate::config::ServiceConfig;
use crate::imaging::codec::tests::MockCodec;
use crate::service::ImageService;
use crate::session::SessionStore;
use crate::uploads::UploadStaging;

// =========================================================================
// Synthetic images
// =========================================================================

/// Opaque RGB gradient, deterministic per pixel.
pub fn gradient(width: u32, height: u32) -> DynamicImage {
    DynamicImage::ImageRgb8(RgbImage::from_fn(width, height, |x, y| {
        Rgb([(x % 256) as u8, (y % 256) as u8, 128])
    }))
}

/// RGBA image: left half fully transparent, right half opaque red.
pub fn half_transparent(width: u32, height: u32) -> DynamicImage {
    DynamicImage::ImageRgba8(RgbaImage::from_fn(width, height, |x, _| {
        if x < width / 2 {
            Rgba([0, 0, 0, 0])
        } else {
            Rgba([255, 0, 0, 255])
        }
    }))
}

pub fn encode(image: &DynamicImage, format: ImageFormat) -> Vec<u8> {
    let mut out = Vec::new();
    image.write_to(&mut Cursor::new(&mut out), format).unwrap();
    out
}

pub fn gradient_jpeg(width: u32, height: u32) -> Vec<u8> {
    encode(&gradient(width, height), ImageFormat::Jpeg)
}

pub fn gradient_png(width: u32, height: u32) -> Vec<u8> {
    encode(&gradient(width, height), ImageFormat::Png)
}

pub fn rgba_png(width: u32, height: u32) -> Vec<u8> {
    encode(&half_transparent(width, height), ImageFormat::Png)
}

pub fn decode(bytes: &[u8]) -> DynamicImage {
    image::load_from_memory(bytes).unwrap()
}

// =========================================================================
// Service wiring
// =========================================================================

/// Mock-backed service on a manual clock with a throwaway staging dir.
///
/// The returned `TempDir` must outlive the service.
pub fn mock_service_with(config: ServiceConfig) -> (ImageService<MockCodec>, Arc<ManualClock>, tempfile::TempDir) {
    let tmp = tempfile::TempDir::new().unwrap();
    let clock = Arc::new(ManualClock::new());
    let store = SessionStore::new(config.session_ttl, config.max_sessions, clock.clone());
    let staging = UploadStaging::new(tmp.path()).unwrap();
    let service = ImageService::new(MockCodec::new(), Arc::new(store), Arc::new(staging), config);
    (service, clock, tmp)
}

pub fn mock_service() -> (ImageService<MockCodec>, Arc<ManualClock>, tempfile::TempDir) {
    mock_service_with(ServiceConfig::default())
}
