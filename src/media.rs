// Media retrieval: downloads images and videos referenced by a post.
//
// Files land in `MEDIA_DIR/{post_id}_{index}.{ext}`. Each download is bounded
// by a timeout and a size cap; anything that fails is simply left out of the
// delivery, it never fails the post. Bytes go to a `.part` file that is
// renamed into place only once the body is complete, so an interrupted
// download never shows up under the final name.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tracing::debug;

use crate::db::models::{MediaKind, MediaReference, Post};
use crate::error::{PipelineError, PipelineResult};

#[async_trait]
pub trait MediaFetcher: Send + Sync {
    /// Download one media item and return where it was stored.
    async fn fetch(
        &self,
        post_id: &str,
        index: usize,
        media: &MediaReference,
    ) -> PipelineResult<PathBuf>;
}

pub struct HttpMediaFetcher {
    client: reqwest::Client,
    dir: PathBuf,
    max_bytes: u64,
}

impl HttpMediaFetcher {
    pub fn new(dir: impl Into<PathBuf>, timeout: Duration, max_bytes: u64) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("tweetwatch/", env!("CARGO_PKG_VERSION")))
            .timeout(timeout)
            .build()?;
        Ok(Self {
            client,
            dir: dir.into(),
            max_bytes,
        })
    }
}

#[async_trait]
impl MediaFetcher for HttpMediaFetcher {
    async fn fetch(
        &self,
        post_id: &str,
        index: usize,
        media: &MediaReference,
    ) -> PipelineResult<PathBuf> {
        let response = self.client.get(&media.url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(PipelineError::PermanentItem(format!(
                "media {} returned {status}",
                media.url
            )));
        }
        if let Some(len) = response.content_length() {
            if len > self.max_bytes {
                return Err(PipelineError::PermanentItem(format!(
                    "media {} is {len} bytes, over the {} byte cap",
                    media.url, self.max_bytes
                )));
            }
        }

        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(PipelineError::storage)?;
        let path = self.dir.join(media_file_name(post_id, index, media));
        let partial = partial_path(&path);

        let written = match download_to(response, &partial, &media.url, self.max_bytes).await {
            Ok(written) => written,
            Err(e) => {
                let _ = tokio::fs::remove_file(&partial).await;
                return Err(e);
            }
        };
        tokio::fs::rename(&partial, &path)
            .await
            .map_err(PipelineError::storage)?;

        debug!(post_id, index, bytes = written, path = %path.display(), "Media saved");
        Ok(path)
    }
}

/// Stream the body into `partial` chunk by chunk, so an unannounced
/// oversize body stops early. Returns the byte count.
async fn download_to(
    mut response: reqwest::Response,
    partial: &Path,
    url: &str,
    max_bytes: u64,
) -> PipelineResult<u64> {
    let mut file = tokio::fs::File::create(partial)
        .await
        .map_err(PipelineError::storage)?;

    let mut written: u64 = 0;
    while let Some(chunk) = response.chunk().await? {
        written += chunk.len() as u64;
        if written > max_bytes {
            return Err(PipelineError::PermanentItem(format!(
                "media {url} exceeded the {max_bytes} byte cap"
            )));
        }
        file.write_all(&chunk)
            .await
            .map_err(PipelineError::storage)?;
    }
    file.flush().await.map_err(PipelineError::storage)?;
    Ok(written)
}

/// Where a download is written until it completes: the final name plus
/// `.part`.
fn partial_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".part");
    PathBuf::from(name)
}

/// Media already on disk from an earlier run, for posts recovered after
/// enrichment.
pub fn existing_downloads(dir: &Path, post: &Post) -> Vec<MediaReference> {
    post.media
        .iter()
        .enumerate()
        .filter_map(|(i, m)| {
            let path = dir.join(media_file_name(&post.id, i, m));
            path.is_file().then(|| m.resolved(path))
        })
        .collect()
}

/// `{post_id}_{index}.{ext}`, with the extension taken from the URL path
/// when it looks like one.
pub fn media_file_name(post_id: &str, index: usize, media: &MediaReference) -> String {
    format!("{post_id}_{index}.{}", extension_for(media))
}

fn extension_for(media: &MediaReference) -> String {
    let path = media.url.split(['?', '#']).next().unwrap_or("");
    let from_url = Path::new(path)
        .extension()
        .and_then(|e| e.to_str())
        .filter(|e| e.len() <= 4 && e.chars().all(|c| c.is_ascii_alphanumeric()))
        .map(|e| e.to_ascii_lowercase());

    from_url.unwrap_or_else(|| match media.kind {
        MediaKind::Image => "jpg".to_string(),
        MediaKind::Video => "mp4".to_string(),
    })
}
