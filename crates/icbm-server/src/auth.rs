//! API key lookup for ingestion.

use std::collections::HashMap;
use std::path::Path;

use serde::Deserialize;

/// Header carrying a device's API key.
pub const API_KEY_HEADER: &str = "x-icbm-api-key";

/// An API client.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct User {
    #[serde(rename = "Username")]
    pub username: String,
    /// Disabled accounts are refused with 403.
    #[serde(rename = "Valid")]
    pub valid: bool,
}

/// Resolves an API key to the client it belongs to.
pub trait CredentialCheck: Send + Sync {
    fn lookup(&self, api_key: &str) -> Option<User>;
}

/// Keys loaded from a JSON object: `{"<key>": {"Username": "...", "Valid": true}}`.
#[derive(Debug, Clone, Default)]
pub struct ApiKeyTable {
    users: HashMap<String, User>,
}

impl ApiKeyTable {
    pub fn from_json(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        Ok(Self {
            users: serde_json::from_slice(bytes)?,
        })
    }

    pub fn load(path: &Path) -> Result<Self, String> {
        let bytes = std::fs::read(path).map_err(|e| format!("couldn't read {}: {e}", path.display()))?;
        Self::from_json(&bytes).map_err(|e| format!("couldn't parse {}: {e}", path.display()))
    }

    pub fn insert(&mut self, api_key: impl Into<String>, user: User) {
        self.users.insert(api_key.into(), user);
    }

    pub fn len(&self) -> usize {
        self.users.len()
    }

    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
    }
}

impl CredentialCheck for ApiKeyTable {
    fn lookup(&self, api_key: &str) -> Option<User> {
        self.users.get(api_key).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_table_from_json() {
        let table = ApiKeyTable::from_json(
            br#"{
                "abc123": {"Username": "testbot", "Valid": true},
                "dead00": {"Username": "oldbot", "Valid": false}
            }"#,
        )
        .unwrap();
        assert_eq!(table.len(), 2);
        assert_eq!(
            table.lookup("abc123"),
            Some(User {
                username: "testbot".to_string(),
                valid: true
            })
        );
        assert!(!table.lookup("dead00").unwrap().valid);
        assert_eq!(table.lookup("nope"), None);
    }

    #[test]
    fn test_load_reports_path() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("users.json");
        std::fs::write(&path, b"[1, 2]").unwrap();
        let err = ApiKeyTable::load(&path).unwrap_err();
        assert!(err.contains("users.json"), "{err}");
        assert!(ApiKeyTable::load(&tmp.path().join("missing.json")).is_err());
    }
}
