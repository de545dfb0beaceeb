//! File store access: downloading submission archives and uploading
//! result bundles.

use crate::config::FileManConfig;
use async_trait::async_trait;
use err_derive::Error;
use std::path::{Path, PathBuf};

#[derive(Debug, Error)]
pub enum FileManError {
    #[error(display = "file manager error: {}", _0)]
    Failed(String),

    #[error(display = "IO error: {}", _0)]
    Io(#[error(source)] std::io::Error),

    #[error(display = "web request error: {}", _0)]
    Request(#[error(source)] reqwest::Error),
}

/// The two operations the worker needs from a file store.
#[async_trait]
pub trait FileManager: Send + Sync {
    /// Download a single blob into a local path.
    async fn get(&self, src: &str, dst: &Path) -> Result<(), FileManError>;

    /// Upload a local file to `dst`.
    async fn put(&self, local: &Path, dst: &str) -> Result<(), FileManError>;
}

/// HTTP file store with optional basic authentication.
pub struct HttpFileManager {
    client: reqwest::Client,
    hostname: String,
    username: String,
    password: String,
}

impl HttpFileManager {
    pub fn new(config: &FileManConfig) -> HttpFileManager {
        HttpFileManager {
            client: reqwest::Client::new(),
            hostname: config.hostname.trim_end_matches('/').to_owned(),
            username: config.username.clone(),
            password: config.password.clone(),
        }
    }

    /// Names are either absolute URLs or paths relative to the
    /// configured host.
    fn resolve_url(&self, name: &str) -> String {
        if name.starts_with("http://") || name.starts_with("https://") {
            name.to_owned()
        } else {
            format!("{}/{}", self.hostname, name.trim_start_matches('/'))
        }
    }

    fn authorized(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        if self.username.is_empty() {
            req
        } else {
            req.basic_auth(&self.username, Some(&self.password))
        }
    }
}

#[async_trait]
impl FileManager for HttpFileManager {
    async fn get(&self, src: &str, dst: &Path) -> Result<(), FileManError> {
        let url = self.resolve_url(src);
        tracing::debug!("downloading {url} to {}", dst.display());
        let response = self.authorized(self.client.get(&url)).send().await?;
        if !response.status().is_success() {
            return Err(FileManError::Failed(format!(
                "download of {url} failed with status {}",
                response.status()
            )));
        }
        let body = response.bytes().await?;
        if let Some(parent) = dst.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(dst, &body).await?;
        Ok(())
    }

    async fn put(&self, local: &Path, dst: &str) -> Result<(), FileManError> {
        let url = self.resolve_url(dst);
        tracing::debug!("uploading {} to {url}", local.display());
        let body = tokio::fs::read(local).await?;
        let response = self
            .authorized(self.client.put(&url).body(body))
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(FileManError::Failed(format!(
                "upload to {url} failed with status {}",
                response.status()
            )));
        }
        Ok(())
    }
}

/// Directory-backed file store used by tests and local runs.
pub struct LocalFileManager {
    root: PathBuf,
}

impl LocalFileManager {
    pub fn new(root: PathBuf) -> LocalFileManager {
        LocalFileManager { root }
    }

    /// Strip any URL scheme and host; only the file name matters here.
    fn local_name(name: &str) -> &str {
        name.rsplit('/').next().unwrap_or(name)
    }
}

#[async_trait]
impl FileManager for LocalFileManager {
    async fn get(&self, src: &str, dst: &Path) -> Result<(), FileManError> {
        let source = self.root.join(Self::local_name(src));
        if let Some(parent) = dst.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::copy(&source, dst).await.map_err(|e| {
            FileManError::Failed(format!("cannot fetch {}: {e}", source.display()))
        })?;
        Ok(())
    }

    async fn put(&self, local: &Path, dst: &str) -> Result<(), FileManError> {
        let target = self.root.join(Self::local_name(dst));
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::copy(local, &target).await.map_err(|e| {
            FileManError::Failed(format!("cannot store {}: {e}", target.display()))
        })?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn url_resolution() {
        let fileman = HttpFileManager::new(&FileManConfig {
            hostname: "http://files.example/".into(),
            username: String::new(),
            password: String::new(),
        });
        assert_eq!(
            fileman.resolve_url("archives/10.tar.gz"),
            "http://files.example/archives/10.tar.gz"
        );
        assert_eq!(
            fileman.resolve_url("http://other.host/x.tar.gz"),
            "http://other.host/x.tar.gz"
        );
    }

    #[tokio::test]
    async fn local_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = dir.path().join("store");
        tokio::fs::create_dir_all(&store).await.unwrap();
        tokio::fs::write(store.join("blob.tar.gz"), b"payload").await.unwrap();

        let fileman = LocalFileManager::new(store.clone());
        let fetched = dir.path().join("fetched.tar.gz");
        fileman
            .get("http://anything/blob.tar.gz", &fetched)
            .await
            .unwrap();
        assert_eq!(tokio::fs::read(&fetched).await.unwrap(), b"payload");

        fileman.put(&fetched, "results/10").await.unwrap();
        assert_eq!(tokio::fs::read(store.join("10")).await.unwrap(), b"payload");

        let missing = fileman.get("nope", &dir.path().join("x")).await;
        assert!(matches!(missing, Err(FileManError::Failed(_))));
    }
}
