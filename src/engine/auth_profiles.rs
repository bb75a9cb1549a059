// Clawdbot Gateway — Auth Profile Store
//
// Provider credentials live in a separate agent-scoped file
// (`auth-profiles.json`), written only by the auth-choice flow,
// read-mostly everywhere else. Mode 0600; contents are never logged.

use crate::atoms::error::{GatewayError, GatewayResult};
use crate::engine::paths;
use crate::engine::security::secrets;
use log::info;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use zeroize::Zeroize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthMode {
    ApiKey,
    Oauth,
    Device,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthProfile {
    pub provider: String,
    pub mode: AuthMode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh: Option<String>,
    /// Unix millis when `access` expires.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
}

impl Drop for AuthProfile {
    fn drop(&mut self) {
        if let Some(k) = &mut self.key {
            k.zeroize();
        }
        if let Some(a) = &mut self.access {
            a.zeroize();
        }
        if let Some(r) = &mut self.refresh {
            r.zeroize();
        }
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct ProfileFile {
    #[serde(default)]
    profiles: BTreeMap<String, AuthProfile>,
}

pub struct AuthProfileStore {
    path: PathBuf,
}

impl AuthProfileStore {
    pub fn new(state_dir: &Path, agent_id: &str) -> Self {
        AuthProfileStore { path: paths::auth_profiles_path(state_dir, agent_id) }
    }

    fn load(&self) -> GatewayResult<BTreeMap<String, AuthProfile>> {
        match std::fs::read_to_string(&self.path) {
            Ok(raw) => Ok(serde_json::from_str::<ProfileFile>(&raw)?.profiles),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(BTreeMap::new()),
            Err(e) => Err(e.into()),
        }
    }

    /// Look up a profile by id (`<provider>:<name>`).
    pub fn get(&self, profile_id: &str) -> GatewayResult<Option<AuthProfile>> {
        Ok(self.load()?.remove(profile_id))
    }

    pub fn list_ids(&self) -> GatewayResult<Vec<String>> {
        Ok(self.load()?.keys().cloned().collect())
    }

    /// Insert or replace a profile. Only the auth-choice flow calls this.
    pub fn put(&self, profile_id: &str, profile: AuthProfile) -> GatewayResult<()> {
        if profile_id.is_empty() || !profile_id.contains(':') {
            return Err(GatewayError::Config(format!(
                "Auth profile id must be \"<provider>:<name>\", got {:?}",
                profile_id
            )));
        }
        let mut profiles = self.load()?;
        profiles.insert(profile_id.to_string(), profile);
        self.persist(&profiles)?;
        info!("[auth] Stored auth profile {}", profile_id);
        Ok(())
    }

    pub fn remove(&self, profile_id: &str) -> GatewayResult<bool> {
        let mut profiles = self.load()?;
        let removed = profiles.remove(profile_id).is_some();
        if removed {
            self.persist(&profiles)?;
            info!("[auth] Removed auth profile {}", profile_id);
        }
        Ok(removed)
    }

    fn persist(&self, profiles: &BTreeMap<String, AuthProfile>) -> GatewayResult<()> {
        let file = ProfileFile { profiles: profiles.clone() };
        let body = serde_json::to_vec_pretty(&file)?;
        secrets::write_secret_file(&self.path, &body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn profile(key: &str) -> AuthProfile {
        AuthProfile {
            provider: "openrouter".into(),
            mode: AuthMode::ApiKey,
            key: Some(key.into()),
            access: None,
            refresh: None,
            expires: None,
            email: None,
        }
    }

    #[test]
    fn put_get_round_trip() {
        let dir = tempdir().unwrap();
        let store = AuthProfileStore::new(dir.path(), "main");
        store.put("openrouter:personal", profile("k-123")).unwrap();

        let loaded = store.get("openrouter:personal").unwrap().unwrap();
        assert_eq!(loaded.provider, "openrouter");
        assert_eq!(loaded.key.as_deref(), Some("k-123"));
        assert_eq!(loaded.mode, AuthMode::ApiKey);
        assert!(store.get("openrouter:other").unwrap().is_none());
    }

    #[test]
    fn id_shape_is_validated() {
        let dir = tempdir().unwrap();
        let store = AuthProfileStore::new(dir.path(), "main");
        assert!(store.put("no-colon", profile("k")).is_err());
        assert!(store.put("", profile("k")).is_err());
    }

    #[test]
    fn remove_reports_presence() {
        let dir = tempdir().unwrap();
        let store = AuthProfileStore::new(dir.path(), "main");
        store.put("p:a", profile("k")).unwrap();
        assert!(store.remove("p:a").unwrap());
        assert!(!store.remove("p:a").unwrap());
        assert!(store.list_ids().unwrap().is_empty());
    }

    #[cfg(unix)]
    #[test]
    fn profile_file_is_0600() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempdir().unwrap();
        let store = AuthProfileStore::new(dir.path(), "main");
        store.put("p:a", profile("k")).unwrap();
        let mode = std::fs::metadata(paths::auth_profiles_path(dir.path(), "main"))
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(mode & 0o777, 0o600);
    }
}
