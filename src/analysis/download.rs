//! Streaming download with a hard byte cap.

use std::io::Write;

use futures::StreamExt;
use tempfile::NamedTempFile;
use thiserror::Error;
use tracing::debug;

#[derive(Error, Debug)]
pub enum DownloadError {
    #[error("File too large to download")]
    TooLarge,
    #[error("Download failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Stream a resource into a temp file, aborting past `max_size` bytes.
/// The file is removed when the returned handle is dropped.
pub async fn download_resource(
    client: &reqwest::Client,
    url: &str,
    max_size: Option<u64>,
) -> Result<NamedTempFile, DownloadError> {
    let response = client.get(url).send().await?.error_for_status()?;

    let mut tmp_file = NamedTempFile::new()?;
    let mut written: u64 = 0;
    let mut stream = response.bytes_stream();

    while let Some(chunk) = stream.next().await {
        let chunk = chunk?;
        written += chunk.len() as u64;
        if let Some(cap) = max_size {
            if written > cap {
                debug!("Aborting download of {}: {} bytes exceeds cap {}", url, written, cap);
                return Err(DownloadError::TooLarge);
            }
        }
        tmp_file.write_all(&chunk)?;
    }
    tmp_file.flush()?;

    debug!("Downloaded {} ({} bytes)", url, written);
    Ok(tmp_file)
}
