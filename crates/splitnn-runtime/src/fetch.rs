//! Model fetch: `http://` and `https://` URIs over the network, anything else
//! from the local filesystem. All failures surface as [`SplitError::Fetch`].

use splitnn_types::{Result, SplitError};
use tracing::{debug, info};

pub async fn fetch_model(uri: &str) -> Result<Vec<u8>> {
    let bytes = if is_remote(uri) {
        fetch_http(uri).await?
    } else {
        let path = uri.strip_prefix("file://").unwrap_or(uri);
        debug!(%path, "reading model from disk");
        tokio::fs::read(path)
            .await
            .map_err(|e| SplitError::Fetch(format!("{path}: {e}")))?
    };
    info!(%uri, bytes = bytes.len(), "model fetched");
    Ok(bytes)
}

fn is_remote(uri: &str) -> bool {
    uri.starts_with("http://") || uri.starts_with("https://")
}

async fn fetch_http(url: &str) -> Result<Vec<u8>> {
    debug!(%url, "downloading model");
    let response = reqwest::Client::new()
        .get(url)
        .send()
        .await
        .map_err(|e| SplitError::Fetch(format!("{url}: {e}")))?;

    if !response.status().is_success() {
        return Err(SplitError::Fetch(format!("{url}: HTTP {}", response.status())));
    }

    let body = response
        .bytes()
        .await
        .map_err(|e| SplitError::Fetch(format!("{url}: {e}")))?;
    Ok(body.to_vec())
}
