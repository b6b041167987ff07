//! Bounded multipart upload reading.
//!
//! Uploads are read field by field, chunk by chunk, and every limit is
//! enforced as bytes arrive, so an oversized request is rejected without
//! being buffered.

use axum::extract::{Multipart, multipart::Field};
use bytes::{Bytes, BytesMut};
use imgpress_core::{Error, Result, SourceItem};

/// Name of the optional target-format field on both endpoints.
pub const FORMAT_FIELD: &str = "format";

const FORMAT_FIELD_MAX_BYTES: usize = 64;

/// Limits for one multipart request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldLimits {
    pub max_files: usize,
    pub max_file_bytes: usize,
    pub max_total_bytes: usize,
}

/// The decoded contents of an upload request.
#[derive(Debug, Default)]
pub struct Upload {
    pub items: Vec<SourceItem>,
    pub format: Option<String>,
}

/// Reads every field of `multipart`. Files are taken from `file_field`; the
/// `format` field is kept as raw text; any other field is read and ignored.
///
/// # Errors
///
/// Returns [`Error::InvalidInput`] for malformed bodies, files without a
/// name, and any limit violation.
pub async fn read_upload(
    multipart: &mut Multipart,
    file_field: &str,
    limits: FieldLimits,
) -> Result<Upload> {
    let mut upload = Upload::default();
    let mut total = 0_usize;

    while let Some(mut field) = multipart.next_field().await.map_err(malformed)? {
        let name = field.name().map(str::to_owned);

        match name.as_deref() {
            Some(FORMAT_FIELD) => {
                let raw = read_field(&mut field, FORMAT_FIELD_MAX_BYTES, &mut total, limits, || {
                    Error::invalid_input("The format field is too long.")
                })
                .await?;
                let text = String::from_utf8(raw.to_vec())
                    .map_err(|_| Error::invalid_input("The format field must be UTF-8 text."))?;
                upload.format = Some(text);
            }
            Some(n) if n == file_field => {
                if upload.items.len() == limits.max_files {
                    return Err(Error::invalid_input(format!(
                        "Too many files. At most {} can be uploaded per request.",
                        limits.max_files
                    )));
                }

                let file_name = field.file_name().unwrap_or_default().to_owned();
                let mime = field.content_type().map(str::to_owned);
                let max_bytes = limits.max_file_bytes;
                let bytes = read_field(&mut field, max_bytes, &mut total, limits, || {
                    Error::invalid_input(format!(
                        "{file_name} exceeds the {max_bytes} byte file limit."
                    ))
                })
                .await?;

                tracing::debug!(file = %file_name, bytes = bytes.len(), "Received upload");
                upload.items.push(SourceItem::new(&file_name, bytes, mime)?);
            }
            other => {
                let label = other.unwrap_or("Unnamed").to_owned();
                read_field(&mut field, limits.max_total_bytes, &mut total, limits, || {
                    Error::invalid_input(format!("Field {label} is too large."))
                })
                .await?;
            }
        }
    }

    Ok(upload)
}

/// Reads one field into memory. The request-wide total is checked before the
/// field's own `max_bytes`, which reports through `too_large`.
async fn read_field(
    field: &mut Field<'_>,
    max_bytes: usize,
    total: &mut usize,
    limits: FieldLimits,
    too_large: impl FnOnce() -> Error,
) -> Result<Bytes> {
    let mut buf = BytesMut::new();

    while let Some(chunk) = field.chunk().await.map_err(malformed)? {
        *total += chunk.len();
        if *total > limits.max_total_bytes {
            return Err(Error::invalid_input(format!(
                "Upload exceeds the {} byte request limit.",
                limits.max_total_bytes
            )));
        }
        if buf.len() + chunk.len() > max_bytes {
            return Err(too_large());
        }
        buf.extend_from_slice(&chunk);
    }

    Ok(buf.freeze())
}

fn malformed(err: axum::extract::multipart::MultipartError) -> Error {
    tracing::debug!(error = %err, "Form parse error");
    Error::invalid_input("Failed to parse form data.")
}
