use std::fs;
use std::path::Path;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const MAX_UPLOAD_BYTES: u64 = 5 * 1024 * 1024;

/// One validated upload slot value. Immutable once constructed; a new
/// upload replaces the whole asset rather than mutating it.
///
/// `base64` always holds the bare payload, never a `data:` URL prefix.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageAsset {
    pub id: String,
    pub base64: String,
    pub mime_type: String,
    pub name: String,
}

impl ImageAsset {
    /// Validates and encodes a file on disk. Failures are user-visible
    /// messages, not crashes: oversized files, non-image extensions and
    /// read errors all come back as `Err(text)`.
    pub fn from_file(path: &Path) -> Result<Self, String> {
        let name = path
            .file_name()
            .and_then(|value| value.to_str())
            .unwrap_or("upload")
            .to_string();

        let size = fs::metadata(path)
            .map(|meta| meta.len())
            .map_err(|_| read_failure_message())?;
        if size > MAX_UPLOAD_BYTES {
            return Err(oversize_message());
        }

        let Some(mime_type) = mime_for_name(&name) else {
            return Err(invalid_type_message());
        };

        let bytes = fs::read(path).map_err(|_| read_failure_message())?;
        Ok(Self {
            id: fresh_id(),
            base64: BASE64.encode(bytes),
            mime_type: mime_type.to_string(),
            name,
        })
    }

    /// Accepts the standard `data:<mime>;base64,<payload>` form and keeps
    /// only the payload after the first comma.
    pub fn from_data_url(name: &str, url: &str) -> Result<Self, String> {
        let Some((header, payload)) = url.split_once(',') else {
            return Err(read_failure_message());
        };
        let mime_type = header
            .strip_prefix("data:")
            .map(|rest| rest.split(';').next().unwrap_or_default())
            .unwrap_or_default()
            .trim()
            .to_string();
        if !mime_type.starts_with("image/") {
            return Err(invalid_type_message());
        }
        let decoded = BASE64
            .decode(payload.as_bytes())
            .map_err(|_| read_failure_message())?;
        if decoded.len() as u64 > MAX_UPLOAD_BYTES {
            return Err(oversize_message());
        }
        Ok(Self {
            id: fresh_id(),
            base64: payload.to_string(),
            mime_type,
            name: name.to_string(),
        })
    }

    pub fn decoded_bytes(&self) -> anyhow::Result<Vec<u8>> {
        BASE64
            .decode(self.base64.as_bytes())
            .map_err(|err| anyhow::anyhow!("asset '{}' base64 decode failed: {err}", self.name))
    }

    pub fn data_url(&self) -> String {
        format!("data:{};base64,{}", self.mime_type, self.base64)
    }

    pub fn extension(&self) -> &'static str {
        extension_for_mime(&self.mime_type)
    }
}

pub fn fresh_id() -> String {
    Uuid::new_v4().to_string()
}

pub fn mime_for_name(name: &str) -> Option<&'static str> {
    let extension = name.rsplit('.').next().unwrap_or_default().to_ascii_lowercase();
    match extension.as_str() {
        "jpg" | "jpeg" => Some("image/jpeg"),
        "png" => Some("image/png"),
        "webp" => Some("image/webp"),
        "gif" => Some("image/gif"),
        "bmp" => Some("image/bmp"),
        _ => None,
    }
}

pub fn extension_for_mime(mime_type: &str) -> &'static str {
    match mime_type.trim().to_ascii_lowercase().as_str() {
        "image/jpeg" => "jpg",
        "image/webp" => "webp",
        "image/gif" => "gif",
        "image/bmp" => "bmp",
        _ => "png",
    }
}

fn oversize_message() -> String {
    "File is too large. Maximum size is 5MB.".to_string()
}

fn invalid_type_message() -> String {
    "Invalid file type. Please upload an image (JPG, PNG, WEBP).".to_string()
}

fn read_failure_message() -> String {
    "Failed to read file. Please try again.".to_string()
}
