//! Destination ports backed by Rust code.
//!
//! A [`MidiSink`] receives every event routed to the port it backs, at the
//! moment the transport delivers it.

use super::{EventKind, SeqEvent};
use crate::midi::note_to_name;

/// Receiver of delivered events.
///
/// `deliver` runs on the transport's dispatch path: it should return
/// quickly and must not call back into the transport.
pub trait MidiSink: Send {
    fn deliver(&mut self, event: &SeqEvent);
}

impl<F> MidiSink for F
where
    F: FnMut(&SeqEvent) + Send,
{
    fn deliver(&mut self, event: &SeqEvent) {
        self(event)
    }
}

/// A sink that traces every event it receives, like a MIDI monitor.
#[derive(Debug, Default)]
pub struct LogSink {
    delivered: u64,
}

impl LogSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of events received so far.
    pub fn delivered(&self) -> u64 {
        self.delivered
    }
}

impl MidiSink for LogSink {
    fn deliver(&mut self, event: &SeqEvent) {
        self.delivered += 1;
        tracing::info!("{:>5} {}", event.source, describe(&event.kind));
    }
}

/// Renders an event payload as a short human-readable line.
pub fn describe(kind: &EventKind) -> String {
    match kind {
        EventKind::NoteOn {
            channel,
            note,
            velocity,
        } => format!(
            "Note on        ch {:>2} {:<4} vel {}",
            channel,
            note_to_name(*note),
            velocity
        ),
        EventKind::NoteOff {
            channel,
            note,
            velocity,
        } => format!(
            "Note off       ch {:>2} {:<4} vel {}",
            channel,
            note_to_name(*note),
            velocity
        ),
        EventKind::KeyPressure {
            channel,
            note,
            velocity,
        } => format!(
            "Key pressure   ch {:>2} {:<4} val {}",
            channel,
            note_to_name(*note),
            velocity
        ),
        EventKind::Controller {
            channel,
            param,
            value,
        } => format!("Control change ch {:>2} cc {} val {}", channel, param, value),
        EventKind::ProgramChange { channel, program } => {
            format!("Program change ch {:>2} program {}", channel, program)
        }
        EventKind::PitchBend { channel, value } => {
            format!("Pitch bend     ch {:>2} value {}", channel, value)
        }
        EventKind::SysEx(bytes) => {
            let hex: Vec<String> = bytes.iter().map(|b| format!("{:02X}", b)).collect();
            format!("System exclusive {}", hex.join(" "))
        }
        EventKind::Echo => "Echo".to_string(),
        EventKind::QueueControl { queue, control } => format!("Queue {} {:?}", queue.0, control),
    }
}
