//! Pipeline stages: `intake -> preprocess -> rubric_parse -> rubric_review
//! -> index -> grade_batch -> cross_page_merge -> aggregate -> logic_review
//! -> confession -> export`.
//!
//! Each stage is a function over an explicit input/output pair rather than
//! a shared mutable blob, per the design note replacing dynamically-typed
//! dictionaries-of-arbitrary-shape with tagged variants per stage. Side
//! effects (gateway calls, cache reads/writes, event emission) are passed
//! in as explicit collaborators so every stage stays independently
//! testable, in the dependency-injection style of `BatchExecutor<C:
//! LLMClient>`, which takes its client rather than reaching a global.

pub mod aggregate;
pub mod confession;
pub mod cross_page_merge;
pub mod export;
pub mod grade_batch;
pub mod index;
pub mod intake;
pub mod logic_review;
pub mod preprocess;
pub mod rubric_parse;
pub mod rubric_review;

use serde::{Deserialize, Serialize};

/// A supported answer/rubric document file kind, as enumerated in
/// `intake`'s contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileKind {
    Pdf,
    Jpeg,
    Png,
    Webp,
}

/// A raw uploaded file before decoding.
#[derive(Debug, Clone)]
pub struct UploadedFile {
    pub name: String,
    pub kind: FileKind,
    pub bytes: Vec<u8>,
}

pub const MAX_FILE_BYTES: usize = 50 * 1024 * 1024;
pub const MAX_PDF_PAGES: u32 = 80;

/// One decoded, fingerprinted page, the output of `preprocess`.
#[derive(Debug, Clone)]
pub struct PageImage {
    pub page_index: u32,
    pub image: image::DynamicImage,
    pub fingerprint: crate::fingerprint::ImageFingerprint,
}
