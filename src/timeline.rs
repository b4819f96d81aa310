use serde::Serialize;

use crate::job::Clip;

/// Position of one clip inside the concatenated output video, in seconds.
///
/// Derived, never persisted: positions must always be recomputed from the
/// current clip list, caching them against a stale list is how playback ends
/// up inside the wrong clip.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ClipPosition {
    pub start: f64,
    pub end: f64,
    pub duration: f64,
}

/// Maps source-time clips onto their positions in the concatenated output.
///
/// The service concatenates clips in order with no gaps, so clip `i` starts
/// exactly where clip `i-1` ends: a running prefix sum over clip durations.
/// A clip whose duration is zero or negative clamps to zero width instead of
/// producing a negative range.
pub fn map_to_output(clips: &[Clip]) -> Vec<ClipPosition> {
    let mut cursor = 0.0;
    clips
        .iter()
        .map(|clip| {
            let duration = (clip.end_time - clip.start_time).max(0.0);
            let position = ClipPosition {
                start: cursor,
                end: cursor + duration,
                duration,
            };
            cursor += duration;
            position
        })
        .collect()
}

/// Total duration of the concatenated output.
pub fn total_duration(clips: &[Clip]) -> f64 {
    clips
        .iter()
        .map(|clip| (clip.end_time - clip.start_time).max(0.0))
        .sum()
}
