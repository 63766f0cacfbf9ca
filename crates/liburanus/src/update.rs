use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;
use tracing::info;

pub const BINARY_NAME: &str = "uranus";
const DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(600);

/// Default download location for this architecture.
pub fn default_update_url() -> String {
    format!(
        "https://fr.qfdk.me/uranus/{BINARY_NAME}-{}",
        std::env::consts::ARCH
    )
}

/// Replaces the running agent binary.
#[async_trait]
pub trait Updater: Send + Sync {
    /// Download from `url` (or the default location) and restart.
    async fn update(&self, url: Option<String>) -> Result<()>;
}

/// Downloads a new binary over HTTP, swaps it in and asks the agent to
/// restart with SIGHUP.
#[derive(Debug, Clone)]
pub struct HttpUpdater {
    install_dir: PathBuf,
    default_url: String,
}

impl HttpUpdater {
    pub fn new(install_dir: impl Into<PathBuf>, default_url: Option<String>) -> Self {
        Self {
            install_dir: install_dir.into(),
            default_url: default_url.unwrap_or_else(default_update_url),
        }
    }

    async fn download(&self, url: &str, target: &Path) -> Result<()> {
        let client = reqwest::Client::builder()
            .timeout(DOWNLOAD_TIMEOUT)
            .build()
            .context("failed to build http client")?;
        let resp = client
            .get(url)
            .send()
            .await
            .with_context(|| format!("download from {url} failed"))?;
        if !resp.status().is_success() {
            bail!("update server returned {}", resp.status());
        }
        let expected = resp.content_length();
        let body = resp.bytes().await.context("failed to read update body")?;
        if let Some(expected) = expected
            && expected != body.len() as u64
        {
            bail!(
                "downloaded size mismatch: expected {expected} bytes, got {}",
                body.len()
            );
        }
        tokio::fs::write(target, &body)
            .await
            .with_context(|| format!("failed to write {}", target.display()))?;
        Ok(())
    }
}

#[async_trait]
impl Updater for HttpUpdater {
    async fn update(&self, url: Option<String>) -> Result<()> {
        let url = url.unwrap_or_else(|| self.default_url.clone());
        let staged = self
            .install_dir
            .join(format!("{BINARY_NAME}-{}", std::env::consts::ARCH));
        let current = self.install_dir.join(BINARY_NAME);
        let backup = self.install_dir.join(format!("{BINARY_NAME}.bak"));

        info!(%url, staged = %staged.display(), "downloading update");
        if let Err(err) = self.download(&url, &staged).await {
            let _ = tokio::fs::remove_file(&staged).await;
            return Err(err);
        }
        if let Err(err) =
            tokio::fs::set_permissions(&staged, std::fs::Permissions::from_mode(0o755)).await
        {
            let _ = tokio::fs::remove_file(&staged).await;
            return Err(err).context("failed to mark update executable");
        }

        swap_binary(&staged, &current, &backup).await?;

        info!("update installed, requesting restart");
        kill(Pid::this(), Signal::SIGHUP).context("failed to signal restart")?;
        Ok(())
    }
}

/// Move `staged` over `current`, keeping the old binary at `backup`.
async fn swap_binary(staged: &Path, current: &Path, backup: &Path) -> Result<()> {
    let had_current = tokio::fs::try_exists(current).await.unwrap_or(false);
    if had_current && let Err(err) = tokio::fs::rename(current, backup).await {
        let _ = tokio::fs::remove_file(staged).await;
        return Err(err).context("failed to back up current binary");
    }
    if let Err(err) = tokio::fs::rename(staged, current).await {
        if had_current {
            let _ = tokio::fs::rename(backup, current).await;
        }
        return Err(err).context("failed to install new binary");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_url_names_the_architecture() {
        let url = default_update_url();
        assert!(url.starts_with("https://"));
        assert!(url.ends_with(std::env::consts::ARCH));
    }

    #[tokio::test]
    async fn swap_keeps_a_backup() {
        let dir = tempfile::tempdir().expect("tempdir");
        let staged = dir.path().join("uranus-new");
        let current = dir.path().join("uranus");
        let backup = dir.path().join("uranus.bak");
        std::fs::write(&current, "old").expect("current");
        std::fs::write(&staged, "new").expect("staged");

        swap_binary(&staged, &current, &backup).await.expect("swap");
        assert_eq!(std::fs::read_to_string(&current).expect("read"), "new");
        assert_eq!(std::fs::read_to_string(&backup).expect("read"), "old");
        assert!(!staged.exists());
    }

    #[tokio::test]
    async fn swap_without_existing_binary() {
        let dir = tempfile::tempdir().expect("tempdir");
        let staged = dir.path().join("uranus-new");
        let current = dir.path().join("uranus");
        std::fs::write(&staged, "new").expect("staged");
        swap_binary(&staged, &current, &dir.path().join("uranus.bak"))
            .await
            .expect("swap");
        assert_eq!(std::fs::read_to_string(&current).expect("read"), "new");
    }

    #[tokio::test]
    async fn failed_download_leaves_nothing_behind() {
        let dir = tempfile::tempdir().expect("tempdir");
        let updater = HttpUpdater::new(dir.path(), Some("http://127.0.0.1:9/uranus".to_string()));
        let err = updater.update(None).await.expect_err("no server");
        assert!(err.to_string().contains("download"));
        assert_eq!(std::fs::read_dir(dir.path()).expect("dir").count(), 0);
    }
}
