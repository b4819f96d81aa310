//! Client for the clip-extraction service.
//!
//! Submits long-running extraction jobs, reconciles locally persisted state
//! with the polled remote status across process restarts, and maps clip time
//! ranges onto the concatenated output video for bounded playback.

pub mod api;
pub mod bridge;
pub mod config;
pub mod error;
pub mod job;
pub mod playback;
pub mod session;
pub mod store;
pub mod timeline;

pub use api::{ExtractRequest, HttpJobClient, JobApi};
pub use bridge::{Message, MessageBus};
pub use config::Config;
pub use error::{ClientError, Result};
pub use job::{Clip, Job, JobStatus};
pub use playback::{MediaElement, MediaSignal, PlaybackController, PlaybackMode};
pub use session::{Reattachment, Reconciler};
pub use store::{FileStore, MemoryStore, RecordStatus, RecordsExt, StateStore, VideoRecord};
pub use timeline::{map_to_output, total_duration, ClipPosition};
