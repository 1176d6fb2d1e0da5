//! Fetches pretrained model artifacts from a Hugging Face compatible hub and
//! caches them on disk

use anyhow::{anyhow, Context, Result};
use reqwest::Url;
use std::path::{Path, PathBuf};
use tokio::{
    fs::{self, File},
    io::AsyncWriteExt,
};
use tracing::{debug, info};

/// A model hub with a local file cache
#[derive(Debug, Clone)]
pub struct Hub {
    endpoint: Url,
    cache_dir: PathBuf,
}

impl Hub {
    pub fn new(endpoint: &str, cache_dir: impl AsRef<Path>) -> Result<Self> {
        Ok(Hub {
            endpoint: Url::parse(endpoint).with_context(|| format!("invalid hub url {endpoint}"))?,
            cache_dir: cache_dir.as_ref().to_path_buf(),
        })
    }

    /// Where `file` from `repo` is cached
    pub fn cache_path(&self, repo: &str, file: &str) -> PathBuf {
        self.cache_dir.join(repo).join(file)
    }

    /// The download url of `file` in `repo` at `revision`. The revision is a
    /// single path segment, so branch names like `refs/pr/3` are escaped.
    pub fn file_url(&self, repo: &str, revision: &str, file: &str) -> Result<Url> {
        let mut url = self.endpoint.clone();
        url.path_segments_mut()
            .map_err(|_| anyhow!("hub url {} cannot be a base", self.endpoint))?
            .pop_if_empty()
            .extend(repo.split('/'))
            .push("resolve")
            .push(revision)
            .extend(file.split('/'));
        Ok(url)
    }

    /// Return the local path of `file`, downloading it first if it is not
    /// cached yet
    #[tracing::instrument(skip(self))]
    pub async fn fetch(&self, repo: &str, revision: &str, file: &str) -> Result<PathBuf> {
        let path = self.cache_path(repo, file);
        if fs::try_exists(&path).await.unwrap_or(false) {
            debug!("using cached {path:?}");
            return Ok(path);
        }

        let url = self.file_url(repo, revision, file)?;
        info!("downloading {url}");

        let mut response = reqwest::get(url.clone())
            .await
            .and_then(|r| r.error_for_status())
            .with_context(|| format!("failed to fetch {file} from {repo}@{revision}"))?;

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }

        // Stream into a temp file so a broken download never looks cached
        let temp_path = path.with_extension("temp");
        let mut out = File::create(&temp_path).await?;
        while let Some(chunk) = response.chunk().await? {
            out.write_all(&chunk).await?;
        }
        out.flush().await?;
        fs::rename(&temp_path, &path).await?;

        info!("{file} downloaded to {path:?}");
        Ok(path)
    }
}
