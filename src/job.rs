use serde::{Deserialize, Deserializer, Serialize};

/// Lifecycle of a server-side extraction job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Downloading,
    Processing,
    Extracting,
    Completed,
    Failed,
}

impl JobStatus {
    /// Only `completed` and `failed` end a polling session.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

/// One selected time range in the *source* media, in seconds.
///
/// `end_time > start_time` is the expected shape, but snapshots from the
/// service are not trusted; consumers clamp rather than assume.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Clip {
    pub start_time: f64,
    pub end_time: f64,
    #[serde(default)]
    pub text: String,
}

/// Snapshot of a server-owned job. The client never mutates one, it only
/// reads and caches them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub status: JobStatus,
    #[serde(default, deserialize_with = "clips_lenient")]
    pub clips: Vec<Clip>,
    #[serde(default)]
    pub error_message: Option<String>,
    #[serde(default)]
    pub output_url: Option<String>,
    // Server timestamps are carried opaquely and never interpreted; only the
    // client-stamped record time takes part in staleness checks.
    #[serde(default)]
    pub created_at: String,
    #[serde(default)]
    pub updated_at: String,
}

fn clips_lenient<'de, D>(deserializer: D) -> Result<Vec<Clip>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = serde_json::Value::deserialize(deserializer)?;
    Ok(normalize_clips(&value))
}

/// Normalizes a clip payload from the service.
///
/// Accepts a JSON array of clip objects or a string-encoded JSON array (some
/// service paths deliver the list re-serialized). Anything unparseable
/// normalizes to an empty list instead of failing the whole snapshot.
pub fn normalize_clips(value: &serde_json::Value) -> Vec<Clip> {
    match value {
        serde_json::Value::Array(_) => {
            serde_json::from_value(value.clone()).unwrap_or_default()
        }
        serde_json::Value::String(text) => serde_json::from_str(text).unwrap_or_default(),
        _ => Vec::new(),
    }
}
