//! Small shared helpers.

use std::path::Path;

use tokio::io::AsyncWriteExt;
use tracing::info;

use crate::errors::RunnerError;

/// Download `url` to `path`, streaming to disk.
///
/// Callers are expected to have checked for an existing file; a partial
/// download is left behind on failure so the error is inspectable.
pub async fn download_file(url: &str, path: &Path) -> Result<(), RunnerError> {
    info!(%url, path = %path.display(), "downloading file");

    let mut response = reqwest::get(url)
        .await
        .and_then(|response| response.error_for_status())
        .map_err(|err| RunnerError::Download(format!("{url}: {err}")))?;

    let mut out = tokio::fs::File::create(path).await?;
    while let Some(chunk) = response
        .chunk()
        .await
        .map_err(|err| RunnerError::Download(format!("{url}: {err}")))?
    {
        out.write_all(&chunk).await?;
    }
    out.flush().await?;

    info!(path = %path.display(), "download complete");
    Ok(())
}
