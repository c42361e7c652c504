//! # contract: seams between the pipeline and its collaborators
//!
//! The pipeline never decodes documents or talks to Git hosts itself. It goes
//! through two traits:
//!
//! - [`Converter`]: turns the bytes of one file into text, a rendered
//!   document, or a set of page images.
//! - [`RepoFetcher`]: materializes a repository checkout into a directory.
//!
//! Both are annotated for `mockall`, so tests can script converter failures
//! and fake clones without touching real decoders or the network. The
//! built-in implementations are [`crate::convert::BuiltinConverter`] and
//! [`crate::repo_export::GitCliFetcher`].

use std::path::Path;

use async_trait::async_trait;
#[cfg(any(test, feature = "test-mocks"))]
use mockall::automock;

use crate::dispatch::{Capability, ConversionOptions, SourceKind};
use crate::error::RepoExportError;
use crate::repo_export::ResolvedExport;

/// Everything a converter needs to handle one file.
#[derive(Debug, Clone)]
pub struct ConverterRequest {
    /// Relative path of the file, used for titles and messages.
    pub file_name: String,
    pub kind: SourceKind,
    pub capability: Capability,
    pub bytes: Vec<u8>,
    pub options: ConversionOptions,
}

/// One rendered page.
#[derive(Debug, Clone, PartialEq)]
pub struct PageImage {
    /// File extension of the encoded image, e.g. `png`.
    pub extension: String,
    pub bytes: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ConverterOutput {
    /// Extracted plain text.
    Text(String),
    /// A rendered document such as a PDF.
    Document { extension: String, bytes: Vec<u8> },
    /// Per-page images, in page order.
    Pages(Vec<PageImage>),
}

#[cfg_attr(any(test, feature = "test-mocks"), automock)]
#[async_trait]
pub trait Converter: Send + Sync {
    /// Converts one file. Errors are reported per file and never abort a job.
    async fn convert(
        &self,
        request: ConverterRequest,
    ) -> Result<ConverterOutput, Box<dyn std::error::Error + Send + Sync>>;
}

#[cfg_attr(any(test, feature = "test-mocks"), automock)]
#[async_trait]
pub trait RepoFetcher: Send + Sync {
    /// Checks out `export` into the existing, empty `destination` directory.
    ///
    /// Implementations must redact the token from every error they return.
    async fn fetch(
        &self,
        export: &ResolvedExport,
        destination: &Path,
    ) -> Result<(), RepoExportError>;
}
