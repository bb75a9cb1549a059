// Clawdbot Gateway — Sensitive-Path Monitor
//
// All file tools resolve their reads/writes/stats/removes through this
// guard. Any operation whose real path lies at-or-under a configured
// sensitive path is audited; in enforce mode it is also rejected.
// Symlinks are resolved before the prefix check — a link into ~/.ssh is
// treated as ~/.ssh.

use crate::atoms::error::{GatewayError, GatewayResult};
use crate::engine::security::audit::{AuditEvent, AuditLog};
use log::warn;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FsGuardMode {
    /// Log and allow.
    Audit,
    /// Log and reject.
    Enforce,
}

#[derive(Debug, Clone, Copy)]
pub enum FsOp {
    Read,
    Write,
    Stat,
    Remove,
}

impl FsOp {
    fn as_str(&self) -> &'static str {
        match self {
            FsOp::Read => "read",
            FsOp::Write => "write",
            FsOp::Stat => "stat",
            FsOp::Remove => "remove",
        }
    }
}

pub struct FsGuard {
    mode: FsGuardMode,
    sensitive: Vec<PathBuf>,
    audit: Arc<AuditLog>,
}

/// Default sensitive set: user credential directories, shell history,
/// the system account database, and the gateway's own state dir.
pub fn default_sensitive_paths(state_dir: &Path) -> Vec<PathBuf> {
    let mut paths = Vec::new();
    if let Some(home) = dirs::home_dir() {
        for rel in [
            ".ssh",
            ".aws",
            ".config/gcloud",
            ".kube",
            ".docker",
            ".gnupg",
            ".npmrc",
            ".netrc",
            ".bash_history",
            ".zsh_history",
        ] {
            paths.push(home.join(rel));
        }
    }
    paths.push(PathBuf::from("/etc/passwd"));
    paths.push(PathBuf::from("/etc/shadow"));
    paths.push(state_dir.to_path_buf());
    paths
}

impl FsGuard {
    pub fn new(mode: FsGuardMode, sensitive: Vec<PathBuf>, audit: Arc<AuditLog>) -> Self {
        FsGuard { mode, sensitive, audit }
    }

    pub fn mode(&self) -> FsGuardMode {
        self.mode
    }

    /// Check one operation. Audits sensitive access; rejects it in
    /// enforce mode. Non-sensitive paths pass silently.
    pub fn check(&self, path: &Path, op: FsOp) -> GatewayResult<()> {
        let Some(hit) = self.sensitive_hit(path) else {
            return Ok(());
        };

        warn!(
            "[fs-guard] {} access to sensitive path {} (under {})",
            op.as_str(),
            path.display(),
            hit.display()
        );
        self.audit
            .record(
                AuditEvent::SensitiveFileAccess,
                json!({
                    "op": op.as_str(),
                    "path": path.display().to_string(),
                    "sensitiveRoot": hit.display().to_string(),
                    "mode": if self.mode == FsGuardMode::Enforce { "enforce" } else { "audit" },
                }),
            )
            .ok();

        match self.mode {
            FsGuardMode::Audit => Ok(()),
            FsGuardMode::Enforce => Err(GatewayError::Security(format!(
                "Access to sensitive path denied: {}",
                path.display()
            ))),
        }
    }

    /// Resolve symlinks, then prefix-match against the sensitive set.
    /// Returns the matched sensitive root, if any.
    fn sensitive_hit(&self, path: &Path) -> Option<&PathBuf> {
        let real = resolve_real_path(path);
        self.sensitive.iter().find(|root| {
            let real_root = resolve_real_path(root);
            real.starts_with(&real_root)
        })
    }

    // ── Guarded primitives used by the file tools ──────────────────────

    pub fn read_to_string(&self, path: &Path) -> GatewayResult<String> {
        self.check(path, FsOp::Read)?;
        Ok(std::fs::read_to_string(path)?)
    }

    pub fn write(&self, path: &Path, contents: &[u8]) -> GatewayResult<()> {
        self.check(path, FsOp::Write)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        Ok(std::fs::write(path, contents)?)
    }

    pub fn metadata(&self, path: &Path) -> GatewayResult<std::fs::Metadata> {
        self.check(path, FsOp::Stat)?;
        Ok(std::fs::metadata(path)?)
    }

    pub fn remove_file(&self, path: &Path) -> GatewayResult<()> {
        self.check(path, FsOp::Remove)?;
        Ok(std::fs::remove_file(path)?)
    }
}

/// Canonicalize where possible. For paths that do not exist yet (a
/// write target), canonicalize the nearest existing ancestor and
/// re-append the remainder, so a symlinked parent still resolves.
fn resolve_real_path(path: &Path) -> PathBuf {
    if let Ok(real) = path.canonicalize() {
        return real;
    }
    let mut existing = path.to_path_buf();
    let mut tail: Vec<std::ffi::OsString> = Vec::new();
    while !existing.exists() {
        match (existing.parent(), existing.file_name()) {
            (Some(parent), Some(name)) => {
                tail.push(name.to_os_string());
                existing = parent.to_path_buf();
            }
            _ => return path.to_path_buf(),
        }
    }
    let mut real = existing.canonicalize().unwrap_or(existing);
    for part in tail.iter().rev() {
        real.push(part);
    }
    real
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;
    use tempfile::tempdir;

    fn guard(mode: FsGuardMode, sensitive: Vec<PathBuf>, dir: &Path) -> (FsGuard, PathBuf) {
        let audit_path = dir.join("audit.log");
        let audit = Arc::new(AuditLog::new(audit_path.clone()));
        (FsGuard::new(mode, sensitive, audit), audit_path)
    }

    fn audit_types(path: &Path) -> Vec<String> {
        std::fs::read_to_string(path)
            .unwrap_or_default()
            .lines()
            .map(|l| serde_json::from_str::<Value>(l).unwrap()["type"].as_str().unwrap().to_string())
            .collect()
    }

    #[test]
    fn non_sensitive_paths_pass_silently() {
        let dir = tempdir().unwrap();
        let secret = dir.path().join("secrets");
        let (g, audit_path) = guard(FsGuardMode::Enforce, vec![secret], dir.path());

        let benign = dir.path().join("notes.txt");
        std::fs::write(&benign, "hello").unwrap();
        assert_eq!(g.read_to_string(&benign).unwrap(), "hello");
        assert!(audit_types(&audit_path).is_empty());
    }

    #[test]
    fn audit_mode_logs_and_allows() {
        let dir = tempdir().unwrap();
        let secret_dir = dir.path().join("secrets");
        std::fs::create_dir_all(&secret_dir).unwrap();
        let file = secret_dir.join("key");
        std::fs::write(&file, "k").unwrap();

        let (g, audit_path) = guard(FsGuardMode::Audit, vec![secret_dir], dir.path());
        assert_eq!(g.read_to_string(&file).unwrap(), "k");
        assert_eq!(audit_types(&audit_path), vec!["sensitive_file_access"]);
    }

    #[test]
    fn enforce_mode_logs_and_rejects() {
        let dir = tempdir().unwrap();
        let secret_dir = dir.path().join("secrets");
        std::fs::create_dir_all(&secret_dir).unwrap();
        let file = secret_dir.join("key");
        std::fs::write(&file, "k").unwrap();

        let (g, audit_path) = guard(FsGuardMode::Enforce, vec![secret_dir], dir.path());
        assert!(g.read_to_string(&file).is_err());
        assert!(g.write(&file, b"x").is_err());
        assert!(g.metadata(&file).is_err());
        assert!(g.remove_file(&file).is_err());
        assert_eq!(audit_types(&audit_path).len(), 4);
        // Rejection means the file is untouched.
        assert_eq!(std::fs::read_to_string(&file).unwrap(), "k");
    }

    #[cfg(unix)]
    #[test]
    fn symlinks_are_resolved_before_the_check() {
        let dir = tempdir().unwrap();
        let secret_dir = dir.path().join("secrets");
        std::fs::create_dir_all(&secret_dir).unwrap();
        std::fs::write(secret_dir.join("key"), "k").unwrap();

        let link = dir.path().join("innocent");
        std::os::unix::fs::symlink(&secret_dir, &link).unwrap();

        let (g, _) = guard(FsGuardMode::Enforce, vec![secret_dir], dir.path());
        assert!(g.read_to_string(&link.join("key")).is_err());
    }

    #[test]
    fn write_target_under_sensitive_dir_is_caught_before_creation() {
        let dir = tempdir().unwrap();
        let secret_dir = dir.path().join("secrets");
        std::fs::create_dir_all(&secret_dir).unwrap();

        let (g, _) = guard(FsGuardMode::Enforce, vec![secret_dir.clone()], dir.path());
        let target = secret_dir.join("brand-new-file");
        assert!(g.write(&target, b"x").is_err());
        assert!(!target.exists());
    }
}
