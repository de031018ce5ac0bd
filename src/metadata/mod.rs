//! Asynchronous metadata extraction for uploaded files.
//!
//! Extraction never blocks an upload: finalized canonical files are handed
//! to a bounded queue and a fixed worker pool runs one extractor per file
//! kind. Results are keyed by content hash so aliases share them.

mod archive;
mod audio;
mod image;
mod pipeline;

pub use archive::ArchiveExtractor;
pub use audio::{AudioExtractor, AudioExtractorSettings};
pub use image::ImageExtractor;
pub use pipeline::{MetadataPipeline, PipelineClosed, WorkItem};

use crate::store::{FileKind, FileRecord};
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

/// Result of running an extractor over a file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtractOutcome {
    /// A metadata record was created (or already existed and was left alone).
    Extracted,
    /// The file was deliberately not processed. Not an error.
    Skipped(&'static str),
}

#[async_trait]
pub trait MetadataExtractor: Send + Sync {
    fn kind(&self) -> FileKind;

    /// Extract metadata for a canonical file whose bytes live at `path`.
    /// Must be idempotent: reprocessing an already-extracted hash is a no-op.
    async fn extract(&self, record: &FileRecord, path: &Path) -> anyhow::Result<ExtractOutcome>;
}

/// Maps each file kind to the extractor responsible for it. Kinds without an
/// entry are a no-op by construction.
#[derive(Default)]
pub struct ExtractorRegistry {
    extractors: HashMap<FileKind, Arc<dyn MetadataExtractor>>,
}

impl ExtractorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(mut self, extractor: Arc<dyn MetadataExtractor>) -> Self {
        self.extractors.insert(extractor.kind(), extractor);
        self
    }

    pub fn get(&self, kind: FileKind) -> Option<&Arc<dyn MetadataExtractor>> {
        self.extractors.get(&kind)
    }
}
