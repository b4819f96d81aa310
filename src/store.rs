use std::collections::{BTreeMap, HashMap};
use std::io;
use std::path::PathBuf;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

use crate::error::{ClientError, Result};
use crate::job::Clip;

/// Client-side status of one source video's extraction. Coarser than the
/// server's job lifecycle: every non-terminal server status maps to
/// `Pending` here.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordStatus {
    Pending,
    Completed,
    Failed,
}

/// Persisted cache of a source video's extraction state, keyed by a stable
/// identifier of the source content.
///
/// Written whole on every transition, never patched in place, so two writers
/// interleaving can only produce one or the other record, not a hybrid.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VideoRecord {
    pub video_key: String,
    pub status: RecordStatus,
    pub prompt: String,
    #[serde(default)]
    pub job_id: Option<String>,
    #[serde(default)]
    pub clips: Option<Vec<Clip>>,
    #[serde(default)]
    pub output_url: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
    pub last_updated_at: DateTime<Utc>,
}

impl VideoRecord {
    pub fn pending(video_key: &str, prompt: &str, job_id: &str, now: DateTime<Utc>) -> Self {
        Self {
            video_key: video_key.to_string(),
            status: RecordStatus::Pending,
            prompt: prompt.to_string(),
            job_id: Some(job_id.to_string()),
            clips: None,
            output_url: None,
            error: None,
            last_updated_at: now,
        }
    }

    pub fn failed_submission(
        video_key: &str,
        prompt: &str,
        error: String,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            video_key: video_key.to_string(),
            status: RecordStatus::Failed,
            prompt: prompt.to_string(),
            job_id: None,
            clips: None,
            output_url: None,
            error: Some(error),
            last_updated_at: now,
        }
    }

    /// Same record with a fresh update stamp. Written on every successful
    /// poll tick; the staleness guard reads this stamp.
    pub fn refreshed(mut self, now: DateTime<Utc>) -> Self {
        self.last_updated_at = now;
        self
    }

    pub fn completed(
        mut self,
        clips: Vec<Clip>,
        output_url: Option<String>,
        error: Option<String>,
        now: DateTime<Utc>,
    ) -> Self {
        self.status = RecordStatus::Completed;
        self.clips = Some(clips);
        self.output_url = output_url;
        self.error = error;
        self.last_updated_at = now;
        self
    }

    pub fn failed(mut self, error: String, now: DateTime<Utc>) -> Self {
        self.status = RecordStatus::Failed;
        self.error = Some(error);
        self.last_updated_at = now;
        self
    }
}

/// Key holding the last-entered prompt for a video. Kept apart from the
/// record so it survives record overwrites and clears.
pub fn prompt_key(video_key: &str) -> String {
    format!("prompt_{video_key}")
}

/// Cross-reference from a job id back to the prompt that produced it.
pub fn job_key(job_id: &str) -> String {
    format!("job_{job_id}")
}

fn is_record_key(key: &str) -> bool {
    !key.starts_with("prompt_") && !key.starts_with("job_")
}

/// Minimal key-value surface shared by every execution context.
///
/// Writers replace whole values and the last write wins; readers must
/// tolerate a value changing between two reads. Callers doing
/// read-modify-write re-read immediately before writing.
pub trait StateStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<Value>>;
    fn set(&self, key: &str, value: Value) -> Result<()>;
    fn remove(&self, keys: &[&str]) -> Result<()>;
    fn get_all(&self) -> Result<BTreeMap<String, Value>>;
}

/// Typed record access over the raw key-value surface.
pub trait RecordsExt: StateStore {
    fn video_record(&self, video_key: &str) -> Result<Option<VideoRecord>> {
        let Some(value) = self.get(video_key)? else {
            return Ok(None);
        };
        match serde_json::from_value(value) {
            Ok(record) => Ok(Some(record)),
            Err(err) => {
                // a foreign or corrupt value under a record key reads as absent
                warn!(video_key, %err, "unreadable video record");
                Ok(None)
            }
        }
    }

    fn put_video_record(&self, record: &VideoRecord) -> Result<()> {
        self.set(&record.video_key, serde_json::to_value(record)?)
    }

    fn prompt(&self, video_key: &str) -> Result<Option<String>> {
        Ok(self
            .get(&prompt_key(video_key))?
            .and_then(|value| value.as_str().map(str::to_string)))
    }

    fn put_prompt(&self, video_key: &str, prompt: &str) -> Result<()> {
        self.set(&prompt_key(video_key), Value::String(prompt.to_string()))
    }

    fn put_job_ref(&self, job_id: &str, prompt: &str) -> Result<()> {
        self.set(&job_key(job_id), serde_json::json!({ "prompt": prompt }))
    }

    /// All readable pending records, for the reattach adoption fallback.
    fn pending_records(&self) -> Result<Vec<VideoRecord>> {
        Ok(self
            .get_all()?
            .into_iter()
            .filter(|(key, _)| is_record_key(key))
            .filter_map(|(_, value)| serde_json::from_value::<VideoRecord>(value).ok())
            .filter(|record| record.status == RecordStatus::Pending)
            .collect())
    }

    /// Removes the record and its job cross-reference. The prompt key
    /// survives; that survival is why the prompt is stored apart.
    fn clear_video(&self, video_key: &str) -> Result<()> {
        let job_ref = self
            .video_record(video_key)?
            .and_then(|record| record.job_id)
            .map(|job_id| job_key(&job_id));
        match &job_ref {
            Some(job_ref) => self.remove(&[video_key, job_ref]),
            None => self.remove(&[video_key]),
        }
    }

    /// Full user-initiated reset: record, job cross-reference, and prompt.
    fn start_over(&self, video_key: &str) -> Result<()> {
        self.clear_video(video_key)?;
        self.remove(&[&prompt_key(video_key)])
    }
}

impl<S: StateStore + ?Sized> RecordsExt for S {}

/// Volatile store for tests and single-context embedding.
#[derive(Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, Value>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl StateStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<Value>> {
        Ok(self.entries.lock().unwrap().get(key).cloned())
    }

    fn set(&self, key: &str, value: Value) -> Result<()> {
        self.entries.lock().unwrap().insert(key.to_string(), value);
        Ok(())
    }

    fn remove(&self, keys: &[&str]) -> Result<()> {
        let mut entries = self.entries.lock().unwrap();
        for key in keys {
            entries.remove(*key);
        }
        Ok(())
    }

    fn get_all(&self) -> Result<BTreeMap<String, Value>> {
        Ok(self
            .entries
            .lock()
            .unwrap()
            .iter()
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect())
    }
}

/// Durable store backed by a single JSON document.
///
/// Every update rewrites the whole document through a uniquely named temp
/// file and a rename, so a concurrent reader sees either the previous or the
/// next document, never a partial one.
pub struct FileStore {
    path: PathBuf,
    entries: Mutex<HashMap<String, Value>>,
}

impl FileStore {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let entries = match std::fs::read_to_string(&path) {
            Ok(text) => match serde_json::from_str(&text) {
                Ok(entries) => entries,
                Err(err) => {
                    warn!(path = %path.display(), %err, "state file unreadable, starting empty");
                    HashMap::new()
                }
            },
            Err(err) if err.kind() == io::ErrorKind::NotFound => HashMap::new(),
            Err(err) => return Err(ClientError::store("read state file", err)),
        };
        Ok(Self {
            path,
            entries: Mutex::new(entries),
        })
    }

    /// Opens the store at its default location under the platform data
    /// directory.
    pub fn open_default() -> Result<Self> {
        let dir = dirs::data_dir()
            .unwrap_or_else(std::env::temp_dir)
            .join("clipsift");
        std::fs::create_dir_all(&dir).map_err(|err| ClientError::store("create data dir", err))?;
        Self::open(dir.join("state.json"))
    }

    pub fn path(&self) -> &std::path::Path {
        &self.path
    }

    fn flush(&self, entries: &HashMap<String, Value>) -> Result<()> {
        let json = serde_json::to_string_pretty(entries)?;
        let tmp = self
            .path
            .with_extension(format!("{}.tmp", uuid::Uuid::new_v4()));
        std::fs::write(&tmp, json).map_err(|err| ClientError::store("write state file", err))?;
        std::fs::rename(&tmp, &self.path)
            .map_err(|err| ClientError::store("replace state file", err))
    }
}

impl StateStore for FileStore {
    fn get(&self, key: &str) -> Result<Option<Value>> {
        Ok(self.entries.lock().unwrap().get(key).cloned())
    }

    fn set(&self, key: &str, value: Value) -> Result<()> {
        let mut entries = self.entries.lock().unwrap();
        entries.insert(key.to_string(), value);
        self.flush(&entries)
    }

    fn remove(&self, keys: &[&str]) -> Result<()> {
        let mut entries = self.entries.lock().unwrap();
        for key in keys {
            entries.remove(*key);
        }
        self.flush(&entries)
    }

    fn get_all(&self) -> Result<BTreeMap<String, Value>> {
        Ok(self
            .entries
            .lock()
            .unwrap()
            .iter()
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect())
    }
}
