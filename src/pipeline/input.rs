//! Input resolution for the CLI: a local path or an HTTP(S) URL to bytes.
//!
//! The library itself only ever sees bytes ([`crate::ParseRequest`]); this
//! helper is the ingress glue that turns a command-line argument into them.
//! Size limits are enforced here as well so an oversized download is cut
//! short instead of being buffered in full and rejected afterwards.

use crate::error::PerceptionError;
use futures::StreamExt;
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info};

/// Bytes of one input plus what the source said about them.
#[derive(Debug, Clone)]
pub struct FetchedInput {
    /// Last path segment of the file or URL.
    pub filename: String,
    pub bytes: Vec<u8>,
    /// `Content-Type` of a download; `None` for local files.
    pub mime_hint: Option<String>,
}

/// Check if the input string looks like a URL.
pub fn is_url(input: &str) -> bool {
    input.starts_with("http://") || input.starts_with("https://")
}

/// Read a local file or download a URL, refusing more than `max_bytes`.
pub async fn fetch_input(
    input: &str,
    timeout_secs: u64,
    max_bytes: u64,
) -> Result<FetchedInput, PerceptionError> {
    if is_url(input) {
        download(input, timeout_secs, max_bytes).await
    } else {
        read_local(Path::new(input), max_bytes).await
    }
}

fn too_large(what: &str, size: u64, max_bytes: u64) -> PerceptionError {
    PerceptionError::TooLarge {
        detail: format!("'{what}' is {size} bytes; the limit is {max_bytes} bytes"),
    }
}

async fn read_local(path: &Path, max_bytes: u64) -> Result<FetchedInput, PerceptionError> {
    let meta = tokio::fs::metadata(path)
        .await
        .map_err(|e| PerceptionError::storage(path, e))?;
    if meta.len() > max_bytes {
        return Err(too_large(&path.display().to_string(), meta.len(), max_bytes));
    }
    let bytes = tokio::fs::read(path)
        .await
        .map_err(|e| PerceptionError::storage(path, e))?;
    debug!("Read {} bytes from {}", bytes.len(), path.display());

    let filename = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string());
    Ok(FetchedInput {
        filename,
        bytes,
        mime_hint: None,
    })
}

async fn download(url: &str, timeout_secs: u64, max_bytes: u64) -> Result<FetchedInput, PerceptionError> {
    info!("Downloading {}", url);
    let failed = |reason: String| PerceptionError::Download {
        url: url.to_string(),
        reason,
    };

    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(timeout_secs))
        .build()
        .map_err(|e| failed(e.to_string()))?;

    let response = client.get(url).send().await.map_err(|e| {
        if e.is_timeout() {
            failed(format!("timed out after {timeout_secs}s"))
        } else {
            failed(e.to_string())
        }
    })?;
    if !response.status().is_success() {
        return Err(failed(format!("HTTP {}", response.status())));
    }
    if let Some(len) = response.content_length().filter(|&l| l > max_bytes) {
        return Err(too_large(url, len, max_bytes));
    }

    let mime_hint = response
        .headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.split(';').next().unwrap_or(v).trim().to_string())
        .filter(|v| !v.is_empty());

    // Stream so a server that lies about (or omits) its length is still cut off.
    let mut bytes = Vec::new();
    let mut body = response.bytes_stream();
    while let Some(chunk) = body.next().await {
        let chunk = chunk.map_err(|e| failed(e.to_string()))?;
        bytes.extend_from_slice(&chunk);
        if bytes.len() as u64 > max_bytes {
            return Err(too_large(url, bytes.len() as u64, max_bytes));
        }
    }
    info!("Downloaded {} bytes", bytes.len());

    Ok(FetchedInput {
        filename: filename_from_url(url),
        bytes,
        mime_hint,
    })
}

/// Last non-empty path segment, or `"download"`.
fn filename_from_url(url: &str) -> String {
    reqwest::Url::parse(url)
        .ok()
        .and_then(|parsed| {
            parsed
                .path_segments()
                .and_then(|mut segments| segments.next_back().map(str::to_string))
        })
        .filter(|last| !last.is_empty())
        .unwrap_or_else(|| "download".to_string())
}
