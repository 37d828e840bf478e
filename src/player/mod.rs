//! Real-time playback engine.
//!
//! A [`Song`] owns an event list and a transport connection. Starting it
//! spawns one session thread that runs the scheduler loop: it multiplexes
//! the control channel with the transport's readiness, feeds events to the
//! timing queue, detects the end of each pass through an echo scheduled one
//! tick after the last event, and loops or stops accordingly.
//!
//! Controllers interact with the session only through [`Command`]s and the
//! atomically published [`PlaybackState`].

mod command;
mod discovery;
mod scheduler;
mod song;
mod state;
mod translate;

pub use command::{Command, CONTROL_CAPACITY};
pub use discovery::{pick_destination, Destination};
pub use scheduler::SessionReport;
pub use song::Song;
pub use state::{PlaybackState, SharedState};
pub use translate::{shutdown_events, translate, volume_sysex};

use crate::midi::LoadError;
use crate::transport::TransportError;
use std::sync::Mutex;
use thiserror::Error;

/// Name of the timing queue allocated by each session.
pub const QUEUE_NAME: &str = "midiplay Playback";

/// Errors surfaced by the player.
#[derive(Debug, Error)]
pub enum PlayerError {
    #[error("failed to load song: {0}")]
    Load(#[from] LoadError),

    #[error("{context}: {source}")]
    Transport {
        context: &'static str,
        #[source]
        source: TransportError,
    },

    /// A previous session panicked and took the transport connection with it.
    #[error("transport connection is no longer available")]
    TransportUnavailable,

    #[error("failed to spawn player thread: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("player thread panicked")]
    SessionPanicked,
}

impl PlayerError {
    pub(crate) fn transport(context: &'static str) -> impl FnOnce(TransportError) -> Self {
        move |source| Self::Transport { context, source }
    }
}

static LAST_ERROR: Mutex<Option<String>> = Mutex::new(None);

/// Stores the message of a failed load or start for [`last_error`].
pub(crate) fn record_error(err: &PlayerError) {
    tracing::error!("{}", err);
    if let Ok(mut slot) = LAST_ERROR.lock() {
        *slot = Some(err.to_string());
    }
}

/// Message of the most recent load or start failure, process-wide.
///
/// Only the latest failure is kept; query it right after the failing call.
pub fn last_error() -> Option<String> {
    LAST_ERROR.lock().ok().and_then(|slot| slot.clone())
}
