//! # Shared Types
//!
//! The data model exchanged between ingress adapters, the batch orchestrator
//! and the archive streamer.
//!
//! ## Overview
//!
//! - [`TargetFormat`] - the output encoding requested for a whole batch
//! - [`ImageKind`] - an encoding recognised from magic bytes
//! - [`SourceItem`] - one uploaded (or watched) file, consumed exactly once
//! - [`CompressionOutcome`] - the per-item result, success or failure
//! - [`BatchResult`] - all outcomes of a non-streaming batch plus counts
//! - [`ArchiveEntry`] - one file to be written into the output archive
//! - [`BatchReport`] - what a streamed batch archived and what it dropped

use crate::Error;
use bytes::Bytes;
use core::{fmt, str::FromStr};

/// Output image encoding for a batch.
///
/// Resolved once per batch and applied uniformly to every item. `Original`
/// keeps each input's own encoding and only reduces its size.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum TargetFormat {
    #[default]
    Original,
    Png,
    Jpeg,
    Webp,
    Avif,
}

impl TargetFormat {
    pub const ALL: [Self; 5] = [
        Self::Original,
        Self::Png,
        Self::Jpeg,
        Self::Webp,
        Self::Avif,
    ];

    /// The MIME type the remote service expects for a conversion, or `None`
    /// when the input encoding is preserved.
    pub const fn mime_type(self) -> Option<&'static str> {
        match self {
            Self::Original => None,
            Self::Png => Some("image/png"),
            Self::Jpeg => Some("image/jpeg"),
            Self::Webp => Some("image/webp"),
            Self::Avif => Some("image/avif"),
        }
    }

    /// File extension (without the dot) for outputs in this format, or `None`
    /// when the source extension is reused.
    pub const fn extension(self) -> Option<&'static str> {
        match self {
            Self::Original => None,
            Self::Png => Some("png"),
            Self::Jpeg => Some("jpg"),
            Self::Webp => Some("webp"),
            Self::Avif => Some("avif"),
        }
    }

    /// The [`ImageKind`] every output of this format must sniff as.
    pub const fn kind(self) -> Option<ImageKind> {
        match self {
            Self::Original => None,
            Self::Png => Some(ImageKind::Png),
            Self::Jpeg => Some(ImageKind::Jpeg),
            Self::Webp => Some(ImageKind::Webp),
            Self::Avif => Some(ImageKind::Avif),
        }
    }

    /// Parses a user-supplied selection, treating blank input as "not set".
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidInput`] for anything that is neither blank nor a
    /// recognised format.
    pub fn parse_optional(raw: Option<&str>) -> Result<Option<Self>, Error> {
        match raw.map(str::trim) {
            None | Some("") => Ok(None),
            Some(value) => value.parse().map(Some),
        }
    }
}

impl FromStr for TargetFormat {
    type Err = Error;

    /// Accepts short names (`png`, `jpg`, ...) and MIME types (`image/png`,
    /// ...), case-insensitively.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase();
        let name = normalized.strip_prefix("image/").unwrap_or(&normalized);
        match name {
            "original" => Ok(Self::Original),
            "png" => Ok(Self::Png),
            "jpg" | "jpeg" => Ok(Self::Jpeg),
            "webp" => Ok(Self::Webp),
            "avif" => Ok(Self::Avif),
            _ => Err(Error::invalid_input(format!(
                "Unsupported target format '{}'. Expected one of: original, png, jpeg, webp, avif.",
                s.trim()
            ))),
        }
    }
}

impl fmt::Display for TargetFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Original => write!(f, "original"),
            Self::Png => write!(f, "png"),
            Self::Jpeg => write!(f, "jpeg"),
            Self::Webp => write!(f, "webp"),
            Self::Avif => write!(f, "avif"),
        }
    }
}

/// An image encoding recognised from its leading bytes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ImageKind {
    Png,
    Jpeg,
    Webp,
    Avif,
}

const PNG_SIGNATURE: [u8; 8] = [0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A];
const JPEG_SIGNATURE: [u8; 3] = [0xFF, 0xD8, 0xFF];

impl ImageKind {
    /// Detects the encoding of `bytes` from its magic number.
    ///
    /// Returns `None` for anything that is not one of the supported kinds,
    /// including truncated headers.
    pub fn sniff(bytes: &[u8]) -> Option<Self> {
        if bytes.starts_with(&PNG_SIGNATURE) {
            return Some(Self::Png);
        }
        if bytes.starts_with(&JPEG_SIGNATURE) {
            return Some(Self::Jpeg);
        }
        if bytes.len() >= 12 && &bytes[0..4] == b"RIFF" && &bytes[8..12] == b"WEBP" {
            return Some(Self::Webp);
        }
        // ISO-BMFF: a `ftyp` box whose major brand marks an AVIF image or
        // sequence.
        if bytes.len() >= 12 && &bytes[4..8] == b"ftyp" {
            let brand = &bytes[8..12];
            if brand == b"avif" || brand == b"avis" {
                return Some(Self::Avif);
            }
        }
        None
    }

    pub const fn mime_type(self) -> &'static str {
        match self {
            Self::Png => "image/png",
            Self::Jpeg => "image/jpeg",
            Self::Webp => "image/webp",
            Self::Avif => "image/avif",
        }
    }
}

impl fmt::Display for ImageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.mime_type())
    }
}

/// One named image buffer awaiting compression.
///
/// Created by an ingress adapter per uploaded or watched file and consumed
/// exactly once by the orchestrator.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SourceItem {
    pub name: String,
    pub bytes: Bytes,
    pub declared_mime_type: Option<String>,
}

impl SourceItem {
    /// Builds an item from an external file name, discarding any directory
    /// components the client may have sent along.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidInput`] when no usable file name remains.
    pub fn new(
        name: &str,
        bytes: impl Into<Bytes>,
        declared_mime_type: Option<String>,
    ) -> Result<Self, Error> {
        let name = crate::naming::file_name(name).trim();
        if name.is_empty() {
            return Err(Error::invalid_input("Uploaded file is missing a filename."));
        }
        Ok(Self {
            name: name.to_string(),
            bytes: bytes.into(),
            declared_mime_type: declared_mime_type.filter(|mime| !mime.trim().is_empty()),
        })
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

/// Per-item result of a compression attempt.
///
/// Exactly one outcome is produced per [`SourceItem`]; both variants carry
/// the source name so outcomes can be mapped back regardless of the order in
/// which they complete.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CompressionOutcome {
    Success {
        source_name: String,
        output_name: String,
        bytes: Bytes,
    },
    Failure {
        source_name: String,
        reason: String,
    },
}

impl CompressionOutcome {
    pub fn source_name(&self) -> &str {
        match self {
            Self::Success { source_name, .. } | Self::Failure { source_name, .. } => source_name,
        }
    }

    pub const fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }
}

/// All outcomes of a batch that was collected rather than streamed.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BatchResult {
    pub outcomes: Vec<CompressionOutcome>,
}

impl BatchResult {
    pub fn push(&mut self, outcome: CompressionOutcome) {
        self.outcomes.push(outcome);
    }

    pub fn succeeded(&self) -> usize {
        self.outcomes.iter().filter(|o| o.is_success()).count()
    }

    pub fn failed(&self) -> usize {
        self.outcomes.len() - self.succeeded()
    }
}

/// One file destined for the output archive.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ArchiveEntry {
    pub name: String,
    pub content: Bytes,
}

/// An item that did not make it into the archive.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ItemFailure {
    pub source_name: String,
    pub reason: String,
}

/// Summary of a streamed batch, built progressively as outcomes arrive.
///
/// `entries` holds the names actually written to the archive, in append
/// order, after duplicate resolution.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BatchReport {
    pub entries: Vec<String>,
    pub failures: Vec<ItemFailure>,
}

impl BatchReport {
    pub fn succeeded(&self) -> usize {
        self.entries.len()
    }

    pub fn failed(&self) -> usize {
        self.failures.len()
    }

    pub fn total(&self) -> usize {
        self.succeeded() + self.failed()
    }
}

/// The result of the single-item path: a named payload plus the content type
/// to serve it with.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CompressedImage {
    pub output_name: String,
    pub mime_type: String,
    pub bytes: Bytes,
}
