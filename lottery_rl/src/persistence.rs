// src/persistence.rs
//
// Blob store for trained agents.
//
// Layout: <root>/<config_id>/{tabular,approx}.json
//
// Each file is a JSON envelope carrying the format version, agent kind,
// config id and the SHA-256 of the payload. Files are written atomically
// (temp file in the same directory, fsync, rename) so a crash never leaves a
// torn blob behind, and a blob that fails any check is rejected whole.
// `save_all` stages every temp file before renaming any of them, so a failed
// write of one kind never leaves a fresh blob next to a stale one.

use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{EngineError, EngineResult};

/// Envelope format version.
pub const FORMAT_VERSION: u32 = 1;

static TEMP_COUNTER: AtomicU64 = AtomicU64::new(0);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentKind {
    Tabular,
    FunctionApprox,
}

impl AgentKind {
    pub fn file_name(&self) -> &'static str {
        match self {
            AgentKind::Tabular => "tabular.json",
            AgentKind::FunctionApprox => "approx.json",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelEnvelope {
    pub format_version: u32,
    pub kind: AgentKind,
    pub config_id: String,
    /// "sha256:<hex>" of `payload`.
    pub payload_sha256: String,
    pub payload: String,
}

/// Directory-backed store keyed by config id and agent kind.
#[derive(Debug, Clone)]
pub struct ModelStore {
    root: PathBuf,
}

impl ModelStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn path_for(&self, config_id: &str, kind: AgentKind) -> PathBuf {
        self.root.join(config_id).join(kind.file_name())
    }

    pub fn exists(&self, config_id: &str, kind: AgentKind) -> bool {
        self.path_for(config_id, kind).is_file()
    }

    pub fn save(&self, config_id: &str, kind: AgentKind, payload: String) -> EngineResult<PathBuf> {
        let mut paths = self.save_all(config_id, vec![(kind, payload)])?;
        paths
            .pop()
            .ok_or_else(|| EngineError::persistence(self.path_for(config_id, kind), "nothing written"))
    }

    /// Write several blobs for one config id. Nothing is renamed into place
    /// until every temp file has been written and synced.
    pub fn save_all(
        &self,
        config_id: &str,
        blobs: Vec<(AgentKind, String)>,
    ) -> EngineResult<Vec<PathBuf>> {
        let mut files = Vec::with_capacity(blobs.len());
        for (kind, payload) in blobs {
            let path = self.path_for(config_id, kind);
            let envelope = ModelEnvelope {
                format_version: FORMAT_VERSION,
                kind,
                config_id: config_id.to_string(),
                payload_sha256: sha256_hex(payload.as_bytes()),
                payload,
            };
            let data = serde_json::to_vec(&envelope)
                .map_err(|e| EngineError::persistence(&path, e.to_string()))?;
            files.push((path, data));
        }
        write_staged(&files)?;
        for (path, data) in &files {
            log::debug!("[persistence] wrote {} ({} bytes)", path.display(), data.len());
        }
        Ok(files.into_iter().map(|(path, _)| path).collect())
    }

    /// Payload of a stored blob; `Ok(None)` when no file exists.
    pub fn load(&self, config_id: &str, kind: AgentKind) -> EngineResult<Option<String>> {
        let path = self.path_for(config_id, kind);
        if !path.exists() {
            return Ok(None);
        }
        let bytes = fs::read(&path).map_err(|e| EngineError::persistence(&path, e.to_string()))?;
        let envelope: ModelEnvelope = serde_json::from_slice(&bytes)
            .map_err(|e| EngineError::persistence(&path, format!("malformed envelope: {}", e)))?;

        if envelope.format_version != FORMAT_VERSION {
            return Err(EngineError::persistence(
                &path,
                format!(
                    "format version {} is not supported (expected {})",
                    envelope.format_version, FORMAT_VERSION
                ),
            ));
        }
        if envelope.kind != kind {
            return Err(EngineError::persistence(
                &path,
                format!("blob holds {:?}, expected {:?}", envelope.kind, kind),
            ));
        }
        if envelope.config_id != config_id {
            return Err(EngineError::persistence(
                &path,
                format!(
                    "blob is for {}, expected {}",
                    envelope.config_id, config_id
                ),
            ));
        }
        let actual = sha256_hex(envelope.payload.as_bytes());
        if actual != envelope.payload_sha256 {
            return Err(EngineError::persistence(&path, "payload checksum mismatch"));
        }
        Ok(Some(envelope.payload))
    }
}

/// "sha256:<lowercase hex>".
pub fn sha256_hex(data: &[u8]) -> String {
    let hash = Sha256::digest(data);
    let hex: String = hash.iter().map(|b| format!("{:02x}", b)).collect();
    format!("sha256:{}", hex)
}

/// Write every file to a temp sibling, then rename them all into place.
/// Readers never see a partial file; a staging failure touches no target.
fn write_staged(files: &[(PathBuf, Vec<u8>)]) -> EngineResult<()> {
    let mut staged: Vec<(PathBuf, &Path)> = Vec::with_capacity(files.len());
    for (path, data) in files {
        match stage(path, data) {
            Ok(temp) => staged.push((temp, path.as_path())),
            Err(e) => {
                for (temp, _) in &staged {
                    let _ = fs::remove_file(temp);
                }
                return Err(e);
            }
        }
    }
    let mut pending = staged.into_iter();
    while let Some((temp, path)) = pending.next() {
        if let Err(e) = fs::rename(&temp, path) {
            let _ = fs::remove_file(&temp);
            for (rest, _) in pending {
                let _ = fs::remove_file(rest);
            }
            return Err(EngineError::persistence(path, e.to_string()));
        }
    }
    Ok(())
}

fn stage(path: &Path, data: &[u8]) -> EngineResult<PathBuf> {
    let err = |e: std::io::Error| EngineError::persistence(path, e.to_string());
    let parent = path
        .parent()
        .ok_or_else(|| EngineError::persistence(path, "path has no parent"))?;
    fs::create_dir_all(parent).map_err(err)?;

    let temp_name = format!(
        ".tmp_{}_{}_{}",
        std::process::id(),
        TEMP_COUNTER.fetch_add(1, Ordering::Relaxed),
        path.file_name()
            .map(|s| s.to_string_lossy())
            .unwrap_or_default()
    );
    let temp_path = parent.join(temp_name);

    let result = (|| {
        let mut file = File::create(&temp_path)?;
        file.write_all(data)?;
        file.sync_all()
    })();
    if let Err(e) = result {
        let _ = fs::remove_file(&temp_path);
        return Err(err(e));
    }
    Ok(temp_path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn save_then_load_returns_payload() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = ModelStore::new(dir.path());
        assert_eq!(store.load("cfg", AgentKind::Tabular).unwrap(), None);

        let path = store
            .save("cfg", AgentKind::Tabular, "{\"x\":1}".to_string())
            .unwrap();
        assert_eq!(path, dir.path().join("cfg").join("tabular.json"));
        assert!(store.exists("cfg", AgentKind::Tabular));
        assert_eq!(
            store.load("cfg", AgentKind::Tabular).unwrap().as_deref(),
            Some("{\"x\":1}")
        );
        let leftovers: Vec<_> = fs::read_dir(dir.path().join("cfg"))
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().starts_with(".tmp_"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn tampered_payload_is_rejected() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = ModelStore::new(dir.path());
        let path = store
            .save("cfg", AgentKind::FunctionApprox, "payload".to_string())
            .unwrap();
        let text = fs::read_to_string(&path).unwrap().replace("\"payload\"}", "\"tampered\"}");
        fs::write(&path, text).unwrap();
        assert!(matches!(
            store.load("cfg", AgentKind::FunctionApprox),
            Err(EngineError::Persistence { .. })
        ));
    }

    #[test]
    fn mismatched_kind_or_config_is_rejected() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = ModelStore::new(dir.path());
        store.save("a", AgentKind::Tabular, "p".to_string()).unwrap();
        fs::create_dir_all(dir.path().join("b")).unwrap();
        fs::copy(
            dir.path().join("a").join("tabular.json"),
            dir.path().join("b").join("tabular.json"),
        )
        .unwrap();
        assert!(store.load("b", AgentKind::Tabular).is_err());

        fs::copy(
            dir.path().join("a").join("tabular.json"),
            dir.path().join("a").join("approx.json"),
        )
        .unwrap();
        assert!(store.load("a", AgentKind::FunctionApprox).is_err());
    }

    #[test]
    fn failed_staging_leaves_existing_files_alone() {
        let dir = tempfile::tempdir().expect("tempdir");
        let good = dir.path().join("cfg").join("tabular.json");
        fs::create_dir_all(good.parent().unwrap()).unwrap();
        fs::write(&good, b"old").unwrap();
        // A regular file where the second blob's directory should be.
        fs::write(dir.path().join("blocker"), b"").unwrap();
        let blocked = dir.path().join("blocker").join("approx.json");

        let files = vec![(good.clone(), b"new".to_vec()), (blocked, b"new".to_vec())];
        assert!(write_staged(&files).is_err());
        assert_eq!(fs::read(&good).unwrap(), b"old");
        let leftovers = fs::read_dir(dir.path().join("cfg"))
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().starts_with(".tmp_"))
            .count();
        assert_eq!(leftovers, 0);
    }

    #[test]
    fn save_all_writes_every_kind() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = ModelStore::new(dir.path());
        let paths = store
            .save_all(
                "cfg",
                vec![
                    (AgentKind::Tabular, "t".to_string()),
                    (AgentKind::FunctionApprox, "a".to_string()),
                ],
            )
            .unwrap();
        assert_eq!(paths.len(), 2);
        assert_eq!(store.load("cfg", AgentKind::Tabular).unwrap().as_deref(), Some("t"));
        assert_eq!(
            store.load("cfg", AgentKind::FunctionApprox).unwrap().as_deref(),
            Some("a")
        );
    }

    #[test]
    fn sha256_hex_known_vector() {
        assert_eq!(
            sha256_hex(b"abc"),
            "sha256:ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }
}
