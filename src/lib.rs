//! midiplay - real-time MIDI playback on a timed-event sequencer.
//!
//! This library provides the playback engine, the sequencer transport it
//! drives, and the MIDI event model it plays from.

pub mod config;
pub mod midi;
pub mod player;
pub mod transport;

// Re-export commonly used types
pub use config::PlayerConfig;
pub use midi::{import_event_list, Event, EventList, LoadError};
pub use player::{last_error, PlaybackState, PlayerError, SessionReport, Song};
pub use transport::{LogSink, MidiSink, SoftSequencer, Transport};
