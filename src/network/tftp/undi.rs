// file: src/network/tftp/undi.rs
// version: 1.0.0
// guid: 3b4c5d6e-7f8a-4b9c-8d0e-2f3a4b5c6d7e

//! Network boot binary download

use crate::error::K8sInitError;
use crate::Result;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs::File;
use tokio::io::AsyncWriteExt;
use tracing::info;

/// Upper bound for the whole download, body included
pub const DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(60);

/// Fetch `url` into `dir/filename` and return the written path
pub async fn download_undi(
    url: &str,
    dir: &Path,
    filename: &str,
    timeout: Duration,
) -> Result<PathBuf> {
    info!("Downloading: {}", url);

    let client = reqwest::Client::builder().timeout(timeout).build()?;
    let mut response = client.get(url).send().await?;
    if !response.status().is_success() {
        return Err(K8sInitError::network(format!(
            "Download failed with status: {}",
            response.status()
        )));
    }

    let dest = dir.join(filename);
    let mut file = File::create(&dest).await?;
    let mut written = 0usize;
    while let Some(chunk) = response.chunk().await? {
        file.write_all(&chunk).await?;
        written += chunk.len();
    }
    file.flush().await?;

    info!("Downloaded {} bytes to: {}", written, dest.display());
    Ok(dest)
}
