//! Playback lifecycle shared between the controller and the player thread.

use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};

/// Lifecycle of a playback session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum PlaybackState {
    /// No session thread, idle.
    Stopped = 0,
    /// Session thread spawned, queue setup in progress.
    Starting = 1,
    Playing = 2,
    /// Queue frozen and output muted.
    Paused = 3,
}

impl PlaybackState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Starting,
            2 => Self::Playing,
            3 => Self::Paused,
            _ => Self::Stopped,
        }
    }

    /// Returns true for any state with a live session.
    pub fn is_active(self) -> bool {
        self != Self::Stopped
    }
}

impl fmt::Display for PlaybackState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Stopped => "stopped",
            Self::Starting => "starting",
            Self::Playing => "playing",
            Self::Paused => "paused",
        };
        f.write_str(name)
    }
}

/// Atomically published playback state.
///
/// Only the transitions below may change it, so the controller can read it
/// without locking while the player thread drives it forward.
#[derive(Debug)]
pub struct SharedState {
    state: AtomicU8,
}

impl Default for SharedState {
    fn default() -> Self {
        Self::new()
    }
}

impl SharedState {
    pub fn new() -> Self {
        Self {
            state: AtomicU8::new(PlaybackState::Stopped as u8),
        }
    }

    /// Current state.
    pub fn load(&self) -> PlaybackState {
        PlaybackState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn transition(&self, from: PlaybackState, to: PlaybackState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// STOPPED → STARTING, when a session is spawned.
    pub fn begin_start(&self) -> bool {
        self.transition(PlaybackState::Stopped, PlaybackState::Starting)
    }

    /// STARTING → PLAYING, once the queue runs and the sentinel is armed.
    pub fn mark_playing(&self) -> bool {
        self.transition(PlaybackState::Starting, PlaybackState::Playing)
    }

    /// PLAYING → PAUSED.
    pub fn mark_paused(&self) -> bool {
        self.transition(PlaybackState::Playing, PlaybackState::Paused)
    }

    /// PAUSED → PLAYING.
    pub fn mark_resumed(&self) -> bool {
        self.transition(PlaybackState::Paused, PlaybackState::Playing)
    }

    /// Any state → STOPPED. Returns the state that was left.
    pub fn mark_stopped(&self) -> PlaybackState {
        PlaybackState::from_u8(
            self.state
                .swap(PlaybackState::Stopped as u8, Ordering::AcqRel),
        )
    }
}
