// ABOUTME: Transport credential bundle and its directory-of-files persistence
// ABOUTME: One creds.json plus one JSON file per signal key, rewritten on every rotation

use crate::traits::CredentialStore;
use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// File holding the identity credentials (and the `registered` flag)
pub const CREDS_FILE: &str = "creds.json";

/// Signal key files are namespaced so no key name can collide with `creds.json`
const KEY_FILE_PREFIX: &str = "key-";

const REGISTERED_FIELD: &str = "registered";

/// Opaque credential bundle for the transport connection.
///
/// The relay never interprets `creds` or `keys` beyond the embedded
/// `registered` flag; they round-trip between the transport and disk.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Session {
    #[serde(default)]
    pub creds: Map<String, Value>,
    #[serde(default)]
    pub keys: BTreeMap<String, Value>,
}

impl Session {
    /// Whether pairing has completed for this session
    pub fn is_registered(&self) -> bool {
        self.creds
            .get(REGISTERED_FIELD)
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }

    pub fn set_registered(&mut self, registered: bool) {
        self.creds
            .insert(REGISTERED_FIELD.to_string(), Value::Bool(registered));
    }

    /// Merge a rotation delivered by the transport into this session
    pub fn apply(&mut self, update: &SessionUpdate) {
        for (field, value) in &update.creds {
            self.creds.insert(field.clone(), value.clone());
        }
        for (name, value) in &update.keys {
            match value {
                Some(value) => {
                    self.keys.insert(name.clone(), value.clone());
                }
                None => {
                    self.keys.remove(name);
                }
            }
        }
    }
}

/// Partial credential change. Creds fields are shallow-merged; a `None` key is deleted.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionUpdate {
    #[serde(default)]
    pub creds: Map<String, Value>,
    #[serde(default)]
    pub keys: BTreeMap<String, Option<Value>>,
}

impl SessionUpdate {
    pub fn is_empty(&self) -> bool {
        self.creds.is_empty() && self.keys.is_empty()
    }
}

// =============================================================================
// FileCredentialStore
// =============================================================================

/// Credential store over a directory of per-key JSON files
#[derive(Debug, Clone)]
pub struct FileCredentialStore {
    dir: PathBuf,
}

impl FileCredentialStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn key_path(&self, name: &str) -> PathBuf {
        self.dir
            .join(format!("{}{}.json", KEY_FILE_PREFIX, encode_key_name(name)))
    }
}

/// Key name stored in a file, or None for files that are not key files
fn key_name_of(path: &Path) -> Option<String> {
    if path.extension().and_then(|e| e.to_str()) != Some("json") {
        return None;
    }
    path.file_stem()
        .and_then(|s| s.to_str())
        .and_then(|stem| stem.strip_prefix(KEY_FILE_PREFIX))
        .map(decode_key_name)
}

/// Key names may contain characters that are not valid in file names
fn encode_key_name(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    for c in name.chars() {
        match c {
            '%' => out.push_str("%25"),
            '/' => out.push_str("%2F"),
            '\\' => out.push_str("%5C"),
            ':' => out.push_str("%3A"),
            other => out.push(other),
        }
    }
    out
}

fn decode_key_name(stem: &str) -> String {
    stem.replace("%2F", "/")
        .replace("%5C", "\\")
        .replace("%3A", ":")
        .replace("%25", "%")
}

/// Write through a temp file so a crash never leaves a half-written key
async fn write_atomic(path: &Path, value: &impl Serialize) -> Result<()> {
    let json = serde_json::to_vec(value).context("Failed to serialize credentials")?;
    let tmp = path.with_extension("json.tmp");
    tokio::fs::write(&tmp, &json)
        .await
        .with_context(|| format!("Failed to write {}", tmp.display()))?;
    tokio::fs::rename(&tmp, path)
        .await
        .with_context(|| format!("Failed to move {} into place", path.display()))?;
    Ok(())
}

#[async_trait]
impl CredentialStore for FileCredentialStore {
    async fn load(&self) -> Result<Session> {
        if !tokio::fs::try_exists(&self.dir).await.unwrap_or(false) {
            tracing::debug!(dir = %self.dir.display(), "No session directory, starting fresh");
            return Ok(Session::default());
        }

        let mut session = Session::default();
        let mut entries = tokio::fs::read_dir(&self.dir)
            .await
            .with_context(|| format!("Failed to read {}", self.dir.display()))?;

        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let is_creds = path.file_name().and_then(|n| n.to_str()) == Some(CREDS_FILE);
            let key_name = key_name_of(&path);
            if !is_creds && key_name.is_none() {
                continue;
            }

            let content = tokio::fs::read(&path)
                .await
                .with_context(|| format!("Failed to read {}", path.display()))?;
            let value: Value = serde_json::from_slice(&content)
                .with_context(|| format!("Failed to parse {}", path.display()))?;

            match key_name {
                Some(name) => {
                    session.keys.insert(name, value);
                }
                None => {
                    session.creds = match value {
                        Value::Object(map) => map,
                        _ => anyhow::bail!("{} is not a JSON object", path.display()),
                    };
                }
            }
        }

        tracing::info!(
            dir = %self.dir.display(),
            registered = session.is_registered(),
            keys = session.keys.len(),
            "Session loaded"
        );
        Ok(session)
    }

    async fn save(&self, session: &Session) -> Result<()> {
        tokio::fs::create_dir_all(&self.dir)
            .await
            .with_context(|| format!("Failed to create {}", self.dir.display()))?;

        write_atomic(&self.dir.join(CREDS_FILE), &session.creds).await?;
        for (name, value) in &session.keys {
            write_atomic(&self.key_path(name), value).await?;
        }

        // Drop key files the transport deleted
        let mut entries = tokio::fs::read_dir(&self.dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let Some(name) = key_name_of(&path) else {
                continue;
            };
            if !session.keys.contains_key(&name) {
                tokio::fs::remove_file(&path)
                    .await
                    .with_context(|| format!("Failed to remove {}", path.display()))?;
            }
        }

        tracing::debug!(dir = %self.dir.display(), keys = session.keys.len(), "Session saved");
        Ok(())
    }

    async fn clear(&self) -> Result<usize> {
        if !tokio::fs::try_exists(&self.dir).await.unwrap_or(false) {
            return Ok(0);
        }

        let mut removed = 0;
        let mut entries = tokio::fs::read_dir(&self.dir)
            .await
            .with_context(|| format!("Failed to read {}", self.dir.display()))?;
        while let Some(entry) = entries.next_entry().await? {
            if entry.file_type().await?.is_file() {
                tokio::fs::remove_file(entry.path())
                    .await
                    .with_context(|| format!("Failed to remove {}", entry.path().display()))?;
                removed += 1;
            }
        }

        tracing::warn!(dir = %self.dir.display(), removed, "Session files deleted");
        Ok(removed)
    }
}
