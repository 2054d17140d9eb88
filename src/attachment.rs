//! Attachment encoder: binary file to base64 with a size-proportional deadline.

use std::path::Path;
use std::time::Duration;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

const MIB: u64 = 1024 * 1024;

#[derive(Debug, Error)]
pub enum AttachmentError {
    #[error("attachment too large: {size} bytes exceeds limit of {limit} bytes")]
    TooLarge { size: u64, limit: u64 },

    #[error("attachment encoding timed out after {0:?}")]
    EncodingTimeout(Duration),

    #[error("attachment read error: {0}")]
    ReadError(String),

    #[error("attachment is not valid base64: {0}")]
    InvalidEncoding(String),
}

/// An attachment ready to transmit or store.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EncodedAttachment {
    pub name: String,
    pub content_type: String,
    /// Standard base64, no data-URL prefix.
    pub base64: String,
    /// Size of the decoded payload.
    pub size: u64,
}

impl std::fmt::Debug for EncodedAttachment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EncodedAttachment")
            .field("name", &self.name)
            .field("content_type", &self.content_type)
            .field("size", &self.size)
            .finish_non_exhaustive()
    }
}

/// Size ceiling and deadline bounds for encoding.
#[derive(Debug, Clone)]
pub struct AttachmentEncoder {
    pub max_bytes: u64,
    pub min_timeout: Duration,
    pub max_timeout: Duration,
}

impl Default for AttachmentEncoder {
    fn default() -> Self {
        Self {
            max_bytes: 10 * MIB,
            min_timeout: Duration::from_secs(5),
            max_timeout: Duration::from_secs(30),
        }
    }
}

impl AttachmentEncoder {
    pub fn with_max_bytes(max_bytes: u64) -> Self {
        Self {
            max_bytes,
            ..Self::default()
        }
    }

    /// One second per MiB, clamped to `[min_timeout, max_timeout]`.
    pub fn timeout_for(&self, size: u64) -> Duration {
        let ms = (size as f64 / MIB as f64 * 1000.0).round() as u64;
        Duration::from_millis(ms).clamp(self.min_timeout, self.max_timeout)
    }

    fn check_size(&self, size: u64) -> Result<(), AttachmentError> {
        if size > self.max_bytes {
            return Err(AttachmentError::TooLarge {
                size,
                limit: self.max_bytes,
            });
        }
        Ok(())
    }

    /// Read and encode a file. The size ceiling is enforced before reading.
    pub async fn encode_file(
        &self,
        path: &Path,
        content_type: impl Into<String>,
    ) -> Result<EncodedAttachment, AttachmentError> {
        let meta = tokio::fs::metadata(path)
            .await
            .map_err(|e| AttachmentError::ReadError(format!("{}: {e}", path.display())))?;
        let size = meta.len();
        self.check_size(size)?;

        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "attachment".to_string());
        let content_type = content_type.into();
        let deadline = self.timeout_for(size);

        let work = async {
            let bytes = tokio::fs::read(path)
                .await
                .map_err(|e| AttachmentError::ReadError(format!("{}: {e}", path.display())))?;
            let base64 = tokio::task::spawn_blocking(move || STANDARD.encode(bytes))
                .await
                .map_err(|e| AttachmentError::ReadError(format!("encoder task failed: {e}")))?;
            Ok::<_, AttachmentError>(base64)
        };

        let base64 = tokio::time::timeout(deadline, work)
            .await
            .map_err(|_| AttachmentError::EncodingTimeout(deadline))??;

        debug!(name = %name, size, timeout_ms = deadline.as_millis() as u64, "attachment encoded");
        Ok(EncodedAttachment {
            name,
            content_type,
            base64,
            size,
        })
    }

    /// Encode in-memory bytes.
    pub fn encode_bytes(
        &self,
        name: impl Into<String>,
        content_type: impl Into<String>,
        bytes: &[u8],
    ) -> Result<EncodedAttachment, AttachmentError> {
        let size = bytes.len() as u64;
        self.check_size(size)?;
        Ok(EncodedAttachment {
            name: name.into(),
            content_type: content_type.into(),
            base64: STANDARD.encode(bytes),
            size,
        })
    }

    /// Accept an already-encoded payload from the HTTP surface.
    ///
    /// Strips a `data:<type>;base64,` prefix, validates the encoding and
    /// enforces the ceiling on the decoded size.
    pub fn accept_base64(
        &self,
        name: impl Into<String>,
        content_type: impl Into<String>,
        payload: &str,
    ) -> Result<EncodedAttachment, AttachmentError> {
        let mut content_type = content_type.into();
        let payload = match payload.strip_prefix("data:") {
            Some(rest) => {
                let (header, data) = rest
                    .split_once(',')
                    .ok_or_else(|| AttachmentError::InvalidEncoding("malformed data URL".into()))?;
                if content_type.is_empty()
                    && let Some(mime) = header.strip_suffix(";base64")
                {
                    content_type = mime.to_string();
                }
                data
            }
            None => payload,
        };
        let payload = payload.trim();

        // Decoded size is at most 3/4 of the encoded length; reject early.
        let estimated = (payload.len() as u64 / 4) * 3;
        self.check_size(estimated.saturating_sub(2))?;

        let decoded = STANDARD
            .decode(payload)
            .map_err(|e| AttachmentError::InvalidEncoding(e.to_string()))?;
        let size = decoded.len() as u64;
        self.check_size(size)?;

        Ok(EncodedAttachment {
            name: name.into(),
            content_type,
            base64: payload.to_string(),
            size,
        })
    }
}
