use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use crate::error::AgentError;

const SHELL_SEARCH_ORDER: &[&str] = &["/bin/bash", "/bin/sh", "/bin/zsh"];
const FALLBACK_SHELL: &str = "/bin/sh";

/// First executable shell from the platform search order.
pub fn default_shell() -> PathBuf {
    SHELL_SEARCH_ORDER
        .iter()
        .map(Path::new)
        .find(|p| is_executable(p))
        .unwrap_or_else(|| Path::new(FALLBACK_SHELL))
        .to_path_buf()
}

/// Resolve a requested shell, falling back to the configured default and
/// then the search order.
pub fn resolve_shell(requested: Option<&str>, configured: Option<&Path>) -> Result<PathBuf, AgentError> {
    if let Some(shell) = requested {
        let path = PathBuf::from(shell);
        if is_executable(&path) {
            return Ok(path);
        }
        return Err(AgentError::ProcessSpawn(format!(
            "shell not found or not executable: {shell}"
        )));
    }
    if let Some(path) = configured {
        if is_executable(path) {
            return Ok(path.to_path_buf());
        }
        return Err(AgentError::ProcessSpawn(format!(
            "configured shell not found or not executable: {}",
            path.display()
        )));
    }
    Ok(default_shell())
}

fn is_executable(path: &Path) -> bool {
    std::fs::metadata(path)
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_shell_exists() {
        let shell = default_shell();
        assert!(shell.exists(), "{} should exist", shell.display());
    }

    #[test]
    fn requested_shell_wins() {
        let shell = resolve_shell(Some("/bin/sh"), None).expect("resolve");
        assert_eq!(shell, PathBuf::from("/bin/sh"));
    }

    #[test]
    fn missing_shell_is_spawn_error() {
        let err = resolve_shell(Some("/definitely/not/a/shell"), None).expect_err("missing");
        assert!(matches!(err, AgentError::ProcessSpawn(_)));
    }

    #[test]
    fn non_executable_configured_shell_is_rejected() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("fake-shell");
        std::fs::write(&path, "#!/bin/sh\n").expect("write");
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o644)).expect("chmod");
        let err = resolve_shell(None, Some(&path)).expect_err("not executable");
        assert!(err.to_string().contains("not executable"));
    }
}
