//! Deterministic fingerprint functions used as cache keys and dedup keys.
//!
//! Both functions are pure, total (no input is rejected) and produce
//! fixed-width opaque strings. Grounded in the `CacheKey::generate`/
//! `CacheKey::from_content` hashing pattern, split into a rubric-text
//! fingerprint and an image perceptual-hash fingerprint.

use image::{imageops::FilterType, DynamicImage, GenericImageView};
use sha2::{Digest, Sha256};

/// Collapse runs of whitespace and trim, so near-identical rubric text
/// (different indentation, trailing spaces) hashes identically.
fn normalize_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Stable hash of normalised rubric text. Total and pure: any string,
/// including the empty string, produces a fixed-width hex digest.
pub fn rubric_fingerprint(rubric_text: &str) -> String {
    let normalized = normalize_whitespace(rubric_text);
    let mut hasher = Sha256::new();
    hasher.update(normalized.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// A 64-bit average-hash perceptual fingerprint, tolerant of minor
/// re-encoding (resize, recompression, light contrast shifts).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageFingerprint(pub u64);

impl ImageFingerprint {
    /// Hamming distance between two fingerprints.
    pub fn distance(&self, other: &ImageFingerprint) -> u32 {
        (self.0 ^ other.0).count_ones()
    }

    /// Default "near duplicate" tolerance: 10 bits out of 64 (~15.6%).
    pub const DEFAULT_TOLERANCE_BITS: u32 = 10;

    pub fn is_near_duplicate(&self, other: &ImageFingerprint) -> bool {
        self.distance(other) <= Self::DEFAULT_TOLERANCE_BITS
    }

    pub fn to_hex(self) -> String {
        format!("{:016x}", self.0)
    }
}

impl std::fmt::Display for ImageFingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

/// Compute a 16x16 grayscale average-hash over a decoded image. Total over
/// any non-empty decodable image; callers are responsible for rejecting
/// truly empty/corrupt bytes earlier in `preprocess`.
pub fn image_fingerprint(image: &DynamicImage) -> ImageFingerprint {
    let small = image
        .resize_exact(16, 16, FilterType::Triangle)
        .grayscale();
    let mut pixels = [0u8; 256];
    for (i, (_, _, px)) in small.pixels().enumerate().take(256) {
        pixels[i] = px.0[0];
    }
    let sum: u32 = pixels.iter().map(|&p| p as u32).sum();
    let avg = sum / 256;
    let mut bits: u64 = 0;
    for (i, &p) in pixels.iter().enumerate() {
        if p as u32 >= avg {
            bits |= 1 << i;
        }
    }
    ImageFingerprint(bits)
}

/// Combine a rubric fingerprint and a set of image fingerprints into the
/// fingerprint of a `GradingUnit`, per the data model's
/// `fingerprint = hash(rubric_fingerprint, image_fingerprint_set)`.
pub fn unit_fingerprint(rubric_fp: &str, image_fps: &[ImageFingerprint]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(rubric_fp.as_bytes());
    for fp in image_fps {
        hasher.update(fp.to_hex().as_bytes());
    }
    format!("{:x}", hasher.finalize())
}
