//! Session snapshots and checkpoints on disk.
//!
//! Layout under the data directory:
//! `sessions/<session_id>.json` and `checkpoints/<checkpoint_id>.json`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use crate::clients::{Message, TokenUsage};

const SESSIONS_DIR: &str = "sessions";
const CHECKPOINTS_DIR: &str = "checkpoints";

#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("Snapshot already exists: {0}")]
    AlreadyExists(String),
    #[error("Invalid snapshot id: {0:?}")]
    InvalidId(String),
}

/// Persisted projection of a session. Never modified after it is written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub session_id: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub turn_count: u64,
    pub messages: Vec<Message>,
    pub total_usage: TokenUsage,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionSummary {
    /// File id: the session id for saves, the checkpoint id for checkpoints.
    pub id: String,
    pub session_id: String,
    pub turn_count: u64,
    pub updated_at: DateTime<Utc>,
}

/// Snapshot fields read for listings; message bodies are skipped.
#[derive(Deserialize)]
struct SnapshotHeader {
    session_id: String,
    turn_count: u64,
    updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct PersistenceManager {
    data_dir: PathBuf,
}

impl PersistenceManager {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
        }
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    fn sessions_dir(&self) -> PathBuf {
        self.data_dir.join(SESSIONS_DIR)
    }

    fn checkpoints_dir(&self) -> PathBuf {
        self.data_dir.join(CHECKPOINTS_DIR)
    }

    /// Writes the snapshot under its session id, replacing an older save.
    pub async fn save_session(
        &self,
        snapshot: &SessionSnapshot,
    ) -> Result<PathBuf, PersistenceError> {
        validate_id(&snapshot.session_id)?;
        let path = self
            .sessions_dir()
            .join(format!("{}.json", snapshot.session_id));
        write_atomic(&path, snapshot, false).await?;
        info!(session_id = %snapshot.session_id, turns = snapshot.turn_count, "session saved");
        Ok(path)
    }

    /// Writes the snapshot under a fresh checkpoint id and returns the id.
    pub async fn save_checkpoint(
        &self,
        snapshot: &SessionSnapshot,
    ) -> Result<String, PersistenceError> {
        validate_id(&snapshot.session_id)?;
        let checkpoint_id = checkpoint_id(&snapshot.session_id, Utc::now());
        let path = self.checkpoints_dir().join(format!("{checkpoint_id}.json"));
        write_atomic(&path, snapshot, true).await?;
        info!(%checkpoint_id, "checkpoint saved");
        Ok(checkpoint_id)
    }

    pub async fn load_session(
        &self,
        session_id: &str,
    ) -> Result<Option<SessionSnapshot>, PersistenceError> {
        validate_id(session_id)?;
        read_snapshot(&self.sessions_dir().join(format!("{session_id}.json"))).await
    }

    pub async fn load_checkpoint(
        &self,
        checkpoint_id: &str,
    ) -> Result<Option<SessionSnapshot>, PersistenceError> {
        validate_id(checkpoint_id)?;
        read_snapshot(&self.checkpoints_dir().join(format!("{checkpoint_id}.json"))).await
    }

    /// Saved sessions, most recently updated first.
    pub async fn list_sessions(&self) -> Result<Vec<SessionSummary>, PersistenceError> {
        list_dir(&self.sessions_dir()).await
    }

    /// Checkpoints, most recently updated first.
    pub async fn list_checkpoints(&self) -> Result<Vec<SessionSummary>, PersistenceError> {
        list_dir(&self.checkpoints_dir()).await
    }
}

/// `<session_id>_<YYYYmmddTHHMMSS>_<8 hex chars>`
fn checkpoint_id(session_id: &str, now: DateTime<Utc>) -> String {
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!("{session_id}_{}_{}", now.format("%Y%m%dT%H%M%S"), &suffix[..8])
}

fn validate_id(id: &str) -> Result<(), PersistenceError> {
    let valid = !id.is_empty()
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if valid {
        Ok(())
    } else {
        Err(PersistenceError::InvalidId(id.to_string()))
    }
}

/// Writes pretty JSON to a `.tmp` sibling, syncs it, then moves it into
/// place. With `create_new` an existing target is an error and is left as is.
async fn write_atomic(
    path: &Path,
    snapshot: &SessionSnapshot,
    create_new: bool,
) -> Result<(), PersistenceError> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let tmp_path = path.with_extension("json.tmp");
    let bytes = serde_json::to_vec_pretty(snapshot)?;

    let written: Result<(), std::io::Error> = async {
        let mut file = tokio::fs::File::create(&tmp_path).await?;
        file.write_all(&bytes).await?;
        file.flush().await?;
        file.sync_all().await?;
        Ok(())
    }
    .await;
    if let Err(e) = written {
        let _ = tokio::fs::remove_file(&tmp_path).await;
        return Err(e.into());
    }

    let placed = if create_new {
        // hard_link refuses to replace an existing file
        let linked = tokio::fs::hard_link(&tmp_path, path).await;
        let _ = tokio::fs::remove_file(&tmp_path).await;
        linked
    } else {
        tokio::fs::rename(&tmp_path, path).await
    };
    match placed {
        Ok(()) => {
            debug!(path = %path.display(), bytes = bytes.len(), "snapshot written");
            Ok(())
        }
        Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
            Err(PersistenceError::AlreadyExists(path.display().to_string()))
        }
        Err(e) => {
            let _ = tokio::fs::remove_file(&tmp_path).await;
            Err(e.into())
        }
    }
}

async fn read_snapshot(path: &Path) -> Result<Option<SessionSnapshot>, PersistenceError> {
    let content = match tokio::fs::read_to_string(path).await {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    Ok(Some(serde_json::from_str(&content)?))
}

async fn list_dir(dir: &Path) -> Result<Vec<SessionSummary>, PersistenceError> {
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };

    let mut summaries = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("json") {
            continue;
        }
        let Some(id) = path.file_stem().and_then(|s| s.to_str()).map(String::from) else {
            continue;
        };
        let header = match tokio::fs::read_to_string(&path).await {
            Ok(content) => {
                serde_json::from_str::<SnapshotHeader>(&content).map_err(|e| e.to_string())
            }
            Err(e) => Err(e.to_string()),
        };
        match header {
            Ok(header) => summaries.push(SessionSummary {
                id,
                session_id: header.session_id,
                turn_count: header.turn_count,
                updated_at: header.updated_at,
            }),
            Err(error) => warn!(path = %path.display(), %error, "skipping unreadable snapshot"),
        }
    }

    summaries.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
    Ok(summaries)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::ToolResult;
    use crate::clients::ToolCall;
    use chrono::TimeZone;
    use serde_json::Map;

    fn snapshot(session_id: &str, updated_hour: u32) -> SessionSnapshot {
        let created_at = Utc.with_ymd_and_hms(2026, 3, 1, 8, 0, 0).unwrap();
        let call = ToolCall {
            call_id: "call_1".into(),
            name: "list_dir".into(),
            arguments: Map::new(),
        };
        SessionSnapshot {
            session_id: session_id.into(),
            created_at,
            updated_at: Utc.with_ymd_and_hms(2026, 3, 1, updated_hour, 0, 0).unwrap(),
            turn_count: 2,
            messages: vec![
                Message::system("You are helpful."),
                Message::user("list files"),
                Message::assistant("", vec![call]),
                Message::tool("call_1", ToolResult::success("a.txt\nb.txt")),
                Message::assistant("Found 2 files.", Vec::new()),
            ],
            total_usage: TokenUsage {
                prompt_tokens: 120,
                completion_tokens: 30,
                total_tokens: 150,
                cached_tokens: None,
            },
        }
    }

    #[tokio::test]
    async fn test_save_and_load_session() {
        let dir = tempfile::tempdir().unwrap();
        let manager = PersistenceManager::new(dir.path());
        let original = snapshot("abc", 9);

        let path = manager.save_session(&original).await.unwrap();
        assert!(path.ends_with("sessions/abc.json"));
        assert_eq!(manager.load_session("abc").await.unwrap(), Some(original.clone()));

        let mut updated = original;
        updated.turn_count = 3;
        manager.save_session(&updated).await.unwrap();
        assert_eq!(manager.load_session("abc").await.unwrap().unwrap().turn_count, 3);
        assert!(manager.load_session("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_checkpoints_get_fresh_ids() {
        let dir = tempfile::tempdir().unwrap();
        let manager = PersistenceManager::new(dir.path());
        let original = snapshot("abc", 9);

        let first = manager.save_checkpoint(&original).await.unwrap();
        let second = manager.save_checkpoint(&original).await.unwrap();
        assert_ne!(first, second);
        assert!(first.starts_with("abc_"));
        assert_eq!(
            manager.load_checkpoint(&first).await.unwrap(),
            Some(original)
        );
        assert_eq!(manager.list_checkpoints().await.unwrap().len(), 2);
        assert!(manager.list_sessions().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_checkpoint_never_overwritten() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("checkpoints").join("fixed.json");
        write_atomic(&path, &snapshot("abc", 9), true).await.unwrap();

        let err = write_atomic(&path, &snapshot("abc", 10), true)
            .await
            .unwrap_err();
        assert!(matches!(err, PersistenceError::AlreadyExists(_)));
        let stored = read_snapshot(&path).await.unwrap().unwrap();
        assert_eq!(stored.updated_at.format("%H").to_string(), "09");
        assert!(!path.with_extension("json.tmp").exists());
    }

    #[tokio::test]
    async fn test_list_sessions_sorted_and_skips_corrupt_files() {
        let dir = tempfile::tempdir().unwrap();
        let manager = PersistenceManager::new(dir.path());
        manager.save_session(&snapshot("older", 9)).await.unwrap();
        manager.save_session(&snapshot("newer", 11)).await.unwrap();
        tokio::fs::write(dir.path().join("sessions").join("broken.json"), "{not json")
            .await
            .unwrap();

        let summaries = manager.list_sessions().await.unwrap();
        let ids: Vec<&str> = summaries.iter().map(|s| s.id.as_str()).collect();
        assert_eq!(ids, vec!["newer", "older"]);
        assert_eq!(summaries[0].turn_count, 2);
    }

    #[tokio::test]
    async fn test_rejects_path_like_ids() {
        let dir = tempfile::tempdir().unwrap();
        let manager = PersistenceManager::new(dir.path());
        assert!(matches!(
            manager.load_session("../etc/passwd").await,
            Err(PersistenceError::InvalidId(_))
        ));
        assert!(matches!(
            manager.save_session(&snapshot("", 9)).await,
            Err(PersistenceError::InvalidId(_))
        ));
    }

    #[test]
    fn test_checkpoint_id_format() {
        let now = Utc.with_ymd_and_hms(2026, 3, 1, 14, 5, 9).unwrap();
        let id = checkpoint_id("s1", now);
        assert!(id.starts_with("s1_20260301T140509_"));
        assert_eq!(id.len(), "s1_20260301T140509_".len() + 8);
        assert!(validate_id(&id).is_ok());
    }
}
