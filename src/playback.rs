use tracing::{debug, warn};

use crate::timeline::ClipPosition;

/// Largest acceptable distance between the requested start and the position
/// the element actually landed on before a one-shot corrective seek.
pub const SEEK_TOLERANCE_SECS: f64 = 0.5;

/// Surface of the one shared media element the controller drives.
///
/// Implemented by the hosting UI over its actual player widget. While a mode
/// is active the element belongs to the controller; nothing else may call
/// seek/play/pause on it directly.
pub trait MediaElement {
    fn pause(&mut self);
    fn play(&mut self);
    /// Reassigns the current source and reloads it. Seeking happens only
    /// after a reload; direct seeks on an already-loaded element are
    /// unreliable across players.
    fn reload(&mut self);
    fn seek(&mut self, seconds: f64);
    fn position(&self) -> f64;
}

/// Signals the host forwards from the element to the controller.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum MediaSignal {
    /// Metadata of the reloaded source is available; seeking is possible.
    MetadataReady,
    /// The element can start (or resume) playing at its current position.
    ReadyToPlay,
    /// Periodic position report during playback.
    PositionChanged(f64),
}

/// The two mutually exclusive playback modes.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PlaybackMode {
    /// Unbounded playback of the whole output video.
    Full,
    /// Playback bounded to `[start, end)` of the output video.
    Clip(ClipPosition),
}

impl PlaybackMode {
    fn start_offset(self) -> f64 {
        match self {
            Self::Full => 0.0,
            Self::Clip(position) => position.start,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Step {
    Idle,
    AwaitingMetadata,
    AwaitingReady { corrected: bool },
    Playing,
}

/// Pauses the element once the observed position reaches the end of the
/// active clip. Owned by the controller as plain state, never attached to
/// the element itself, so there is exactly one place that knows what is
/// currently attached.
#[derive(Debug, Clone, Copy)]
struct ClipEndGuard {
    end: f64,
    fired: bool,
}

/// Drives the shared media element through mode switches and guarantees
/// that clip-mode playback halts at the clip end instead of running into
/// the next clip.
pub struct PlaybackController<E: MediaElement> {
    element: E,
    mode: Option<PlaybackMode>,
    guard: Option<ClipEndGuard>,
    step: Step,
}

impl<E: MediaElement> PlaybackController<E> {
    pub fn new(element: E) -> Self {
        Self {
            element,
            mode: None,
            guard: None,
            step: Step::Idle,
        }
    }

    pub fn mode(&self) -> Option<PlaybackMode> {
        self.mode
    }

    pub fn element(&self) -> &E {
        &self.element
    }

    /// Switches to unbounded playback of the whole output video.
    pub fn play_full(&mut self) {
        self.switch(PlaybackMode::Full);
    }

    /// Switches to bounded playback of one clip position.
    ///
    /// Positions come from `timeline::map_to_output` over the *current*
    /// clip list; never replay a cached position after the list changed.
    pub fn play_clip(&mut self, position: ClipPosition) {
        self.switch(PlaybackMode::Clip(position));
    }

    fn switch(&mut self, mode: PlaybackMode) {
        debug!(?mode, "switching playback mode");
        self.detach_guard();
        self.element.pause();
        self.element.reload();
        self.mode = Some(mode);
        self.step = Step::AwaitingMetadata;
    }

    /// Feeds one element signal through the mode-switch protocol.
    pub fn handle_signal(&mut self, signal: MediaSignal) {
        match signal {
            MediaSignal::MetadataReady => {
                if self.step != Step::AwaitingMetadata {
                    return;
                }
                let Some(mode) = self.mode else {
                    return;
                };
                self.element.seek(mode.start_offset());
                if let PlaybackMode::Clip(position) = mode {
                    self.guard = Some(ClipEndGuard {
                        end: position.end,
                        fired: false,
                    });
                }
                self.step = Step::AwaitingReady { corrected: false };
            }
            MediaSignal::ReadyToPlay => {
                let Step::AwaitingReady { corrected } = self.step else {
                    return;
                };
                let Some(mode) = self.mode else {
                    return;
                };
                let start = mode.start_offset();
                let observed = self.element.position();
                if (observed - start).abs() > SEEK_TOLERANCE_SECS && !corrected {
                    // one corrective seek only, regardless of where the
                    // element lands afterwards
                    warn!(observed, start, "landed off the requested start, correcting once");
                    self.element.seek(start);
                    self.step = Step::AwaitingReady { corrected: true };
                    return;
                }
                self.element.play();
                self.step = Step::Playing;
            }
            MediaSignal::PositionChanged(position) => {
                if let Some(guard) = &mut self.guard {
                    if !guard.fired && position >= guard.end {
                        guard.fired = true;
                        self.element.pause();
                    }
                }
            }
        }
    }

    /// Removes the clip-end guard. Safe to call when none is attached.
    pub fn detach_guard(&mut self) {
        self.guard = None;
    }

    /// Releases the element on view teardown: detaches the guard and drops
    /// any pending mode switch so no leftover callback can pause an element
    /// this controller no longer owns.
    pub fn teardown(&mut self) {
        self.detach_guard();
        self.mode = None;
        self.step = Step::Idle;
    }
}
