use std::path::PathBuf;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{info, warn};

/// Result string meaning the nginx operation succeeded.
pub const NGINX_OK: &str = "OK";
/// Status string meaning nginx is not running.
pub const NGINX_DOWN: &str = "KO";

/// Control surface for the local nginx.
///
/// Every call returns a result string: [`NGINX_OK`] on success, otherwise
/// a description of the failure. `status` returns nginx's pid or
/// [`NGINX_DOWN`].
#[async_trait]
pub trait NginxControl: Send + Sync {
    async fn reload(&self) -> String;
    async fn start(&self) -> String;
    async fn stop(&self) -> String;
    async fn status(&self) -> String;
}

/// Drives the system nginx through systemd, or the bare binary on macOS.
#[derive(Debug, Clone)]
pub struct SystemNginx {
    pid_file: PathBuf,
}

impl SystemNginx {
    pub fn new(pid_file: impl Into<PathBuf>) -> Self {
        Self {
            pid_file: pid_file.into(),
        }
    }

    async fn run(&self, action: &str) -> Result<(), String> {
        let mut cmd = if cfg!(target_os = "macos") {
            let mut cmd = Command::new("nginx");
            match action {
                "start" => {}
                other => {
                    cmd.args(["-s", other]);
                }
            }
            cmd
        } else {
            let mut cmd = Command::new("systemctl");
            cmd.args([action, "nginx"]);
            cmd
        };

        match cmd.output().await {
            Ok(output) if output.status.success() => Ok(()),
            Ok(output) => {
                let mut detail = String::from_utf8_lossy(&output.stderr).trim().to_string();
                if detail.is_empty() {
                    detail = format!("nginx {action} exited with {}", output.status);
                }
                Err(detail)
            }
            Err(err) => Err(format!("failed to run nginx {action}: {err}")),
        }
    }
}

impl Default for SystemNginx {
    fn default() -> Self {
        Self::new("/run/nginx.pid")
    }
}

#[async_trait]
impl NginxControl for SystemNginx {
    async fn reload(&self) -> String {
        if self.status().await == NGINX_DOWN {
            info!("nginx not running, skipping reload");
            return NGINX_OK.to_string();
        }
        match self.run("reload").await {
            Ok(()) => NGINX_OK.to_string(),
            Err(detail) => {
                warn!(%detail, "nginx reload failed");
                detail
            }
        }
    }

    async fn start(&self) -> String {
        match self.run("start").await {
            Ok(()) => {
                info!("nginx started");
                NGINX_OK.to_string()
            }
            Err(detail) => {
                warn!(%detail, "nginx start failed");
                detail
            }
        }
    }

    async fn stop(&self) -> String {
        match self.run("stop").await {
            Ok(()) => {
                info!("nginx stopped");
                NGINX_OK.to_string()
            }
            Err(detail) => {
                warn!(%detail, "nginx stop failed");
                NGINX_DOWN.to_string()
            }
        }
    }

    async fn status(&self) -> String {
        match tokio::fs::read_to_string(&self.pid_file).await {
            Ok(pid) if !pid.trim().is_empty() => pid.trim().to_string(),
            _ => NGINX_DOWN.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn status_reads_pid_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let pid_file = dir.path().join("nginx.pid");
        let nginx = SystemNginx::new(&pid_file);
        assert_eq!(nginx.status().await, NGINX_DOWN);

        std::fs::write(&pid_file, "4242\n").expect("write pid");
        assert_eq!(nginx.status().await, "4242");
    }

    #[tokio::test]
    async fn reload_is_noop_when_not_running() {
        let dir = tempfile::tempdir().expect("tempdir");
        let nginx = SystemNginx::new(dir.path().join("missing.pid"));
        assert_eq!(nginx.reload().await, NGINX_OK);
    }
}
