//! [`Compressor`] backed by the Tinify HTTP API.
//!
//! A compression is two requests:
//!
//! 1. `POST /shrink` with the raw image, authenticated with HTTP basic auth
//!    (`api:<key>`). The service answers `201 Created` with a `Location`
//!    header pointing at the compressed output.
//! 2. Either `GET <location>` to download the output in its original encoding,
//!    or `POST <location>` with `{"convert": {"type": "<mime>"}}` to download
//!    it converted to another format.

use super::{Compressor, DEFAULT_TIMEOUT};
use crate::{Error, ImageKind, Result, TargetFormat};
use async_trait::async_trait;
use bytes::Bytes;
use core::time::Duration;
use reqwest::{StatusCode, header::LOCATION};
use serde::Deserialize;

const DEFAULT_API_URL: &str = "https://api.tinify.com";
const PLACEHOLDER_KEY: &str = "your_api_key_here";
const API_USER: &str = "api";

/// Connection settings for [`TinifyClient`].
#[derive(Clone)]
pub struct TinifyConfig {
    /// Service credential. Checked on first use, not at construction.
    pub api_key: Option<String>,
    /// Base URL of the API, without a trailing slash.
    pub api_url: String,
    /// Whole-request timeout for each HTTP call.
    pub timeout: Duration,
}

impl Default for TinifyConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            api_url: DEFAULT_API_URL.to_string(),
            timeout: DEFAULT_TIMEOUT,
        }
    }
}

impl core::fmt::Debug for TinifyConfig {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("TinifyConfig")
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .field("api_url", &self.api_url)
            .field("timeout", &self.timeout)
            .finish()
    }
}

/// Error payload returned by the API on non-success responses.
#[derive(Debug, Default, Deserialize)]
struct ApiErrorBody {
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

impl ApiErrorBody {
    fn describe(&self, status: StatusCode) -> String {
        match (&self.error, &self.message) {
            (Some(error), Some(message)) => format!("{error}: {message}"),
            (None, Some(message)) => message.clone(),
            (Some(error), None) => error.clone(),
            (None, None) => status
                .canonical_reason()
                .unwrap_or("unexpected response")
                .to_string(),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Stage {
    Shrink,
    Download,
    Convert,
}

/// Tinify-backed compression client.
///
/// Cheap to share behind an `Arc`; the inner [`reqwest::Client`] pools
/// connections across calls.
#[derive(Clone, Debug)]
pub struct TinifyClient {
    http: reqwest::Client,
    config: TinifyConfig,
}

impl TinifyClient {
    /// Builds a client. A missing credential is not an error here: it is
    /// reported as [`Error::Configuration`] by the first call.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Configuration`] if the HTTP client cannot be built.
    pub fn new(config: TinifyConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(config.timeout)
            .user_agent(concat!("imgpress/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| Error::Configuration {
                reason: format!("failed to build HTTP client: {e}"),
            })?;

        Ok(Self {
            http,
            config: TinifyConfig {
                api_url: config.api_url.trim_end_matches('/').to_string(),
                ..config
            },
        })
    }

    fn api_key(&self) -> Result<&str> {
        match self.config.api_key.as_deref().map(str::trim) {
            Some(key) if !key.is_empty() && key != PLACEHOLDER_KEY => Ok(key),
            _ => Err(Error::Configuration {
                reason: "TINIFY_KEY is missing or invalid".to_string(),
            }),
        }
    }

    /// Uploads the source image and returns the URL of the compressed output.
    async fn shrink(&self, key: &str, bytes: Bytes) -> Result<String> {
        let resp = self
            .http
            .post(format!("{}/shrink", self.config.api_url))
            .basic_auth(API_USER, Some(key))
            .body(bytes)
            .send()
            .await
            .map_err(|e| self.request_error(e))?;

        let resp = self.check_status(resp, Stage::Shrink, None).await?;

        if let Some(count) = resp.headers().get("compression-count") {
            tracing::debug!(compression_count = ?count, "Tinify usage");
        }

        let location = resp
            .headers()
            .get(LOCATION)
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| Error::Upstream {
                status: Some(resp.status().as_u16()),
                message: "response is missing the output location".to_string(),
            })?;

        // The API returns absolute URLs, but tolerate a path relative to the
        // configured base.
        if location.starts_with('/') {
            Ok(format!("{}{location}", self.config.api_url))
        } else {
            Ok(location.to_string())
        }
    }

    /// Downloads the compressed output, converting it when `format` asks for
    /// a specific encoding.
    async fn fetch_output(&self, key: &str, location: &str, format: TargetFormat) -> Result<Bytes> {
        let (request, stage) = match format.mime_type() {
            None => (self.http.get(location), Stage::Download),
            Some(mime) => (
                self.http
                    .post(location)
                    .json(&serde_json::json!({ "convert": { "type": mime } })),
                Stage::Convert,
            ),
        };

        let resp = request
            .basic_auth(API_USER, Some(key))
            .send()
            .await
            .map_err(|e| self.request_error(e))?;

        let resp = self.check_status(resp, stage, Some(format)).await?;
        resp.bytes().await.map_err(|e| self.request_error(e))
    }

    async fn check_status(
        &self,
        resp: reqwest::Response,
        stage: Stage,
        format: Option<TargetFormat>,
    ) -> Result<reqwest::Response> {
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }

        let body: ApiErrorBody = resp.json().await.unwrap_or_default();
        let message = body.describe(status);
        tracing::debug!(?stage, status = status.as_u16(), %message, "Tinify request failed");

        Err(match status {
            StatusCode::UNAUTHORIZED | StatusCode::TOO_MANY_REQUESTS => Error::ServiceUnavailable {
                reason: message,
            },
            s if s.is_server_error() => Error::ServiceUnavailable { reason: message },
            StatusCode::BAD_REQUEST | StatusCode::UNSUPPORTED_MEDIA_TYPE
                if stage == Stage::Convert =>
            {
                Error::UnsupportedFormat {
                    format: format.unwrap_or_default().to_string(),
                }
            }
            _ => Error::Upstream {
                status: Some(status.as_u16()),
                message,
            },
        })
    }

    fn request_error(&self, err: reqwest::Error) -> Error {
        if err.is_timeout() {
            Error::Timeout {
                after: self.config.timeout,
            }
        } else {
            Error::ServiceUnavailable {
                reason: err.to_string(),
            }
        }
    }
}

/// Confirms the service returned a usable image of the expected kind.
fn validate_output(input: &[u8], output: &[u8], format: TargetFormat) -> Result<()> {
    if output.is_empty() {
        return Err(Error::Upstream {
            status: None,
            message: "service returned an empty image".to_string(),
        });
    }

    let expected = format.kind().or_else(|| ImageKind::sniff(input));
    if let Some(expected) = expected {
        if ImageKind::sniff(output) != Some(expected) {
            return Err(Error::Upstream {
                status: None,
                message: format!("service returned data that is not a valid {expected} image"),
            });
        }
    }
    Ok(())
}

#[async_trait]
impl Compressor for TinifyClient {
    #[tracing::instrument(skip_all, fields(input_bytes = bytes.len(), %format))]
    async fn compress(&self, bytes: Bytes, format: TargetFormat) -> Result<Bytes> {
        if bytes.is_empty() {
            return Err(Error::invalid_input("Image is empty."));
        }
        let key = self.api_key()?;

        let location = self.shrink(key, bytes.clone()).await?;
        let output = self.fetch_output(key, &location, format).await?;
        validate_output(&bytes, &output, format)?;

        // Never hand back something larger than what we were given when the
        // encoding is unchanged.
        if format == TargetFormat::Original && output.len() > bytes.len() {
            tracing::debug!(
                input_bytes = bytes.len(),
                output_bytes = output.len(),
                "Service output is larger than input, keeping input"
            );
            return Ok(bytes);
        }

        tracing::debug!(output_bytes = output.len(), "Compressed");
        Ok(output)
    }

    fn default_timeout(&self) -> Duration {
        self.config.timeout
    }

    fn check_ready(&self) -> Result<()> {
        self.api_key().map(|_| ())
    }
}
