//! Code fragment extraction and content fingerprints.

pub mod blocks;
pub mod winnow;

pub use blocks::{Block, extract_blocks};
pub use winnow::{Fingerprint, fingerprint_similarity, fingerprint_text};
