//! Timed MIDI events and the ordered event list a song plays from.
//!
//! An [`EventList`] is immutable once built: the player walks it forward
//! from the first event to the last, and rewinds to the start when looping.

use super::{LoadError, META_EVENT, META_TEMPO};

/// A single timed MIDI or meta event.
///
/// Channel messages keep their raw status byte (kind nibble plus channel)
/// and up to two data bytes. SysEx and meta events carry their payload in
/// `extra`; for meta events `data[0]` holds the meta type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    /// Absolute time in ticks from the start of the song.
    pub time: u32,
    /// Raw status byte.
    pub status: u8,
    /// Data bytes (unused bytes are zero).
    pub data: [u8; 2],
    /// Variable-length payload for SysEx and meta events.
    pub extra: Vec<u8>,
}

impl Event {
    /// Creates a channel message event.
    ///
    /// # Arguments
    ///
    /// * `time` - Absolute tick
    /// * `status` - Status byte including the channel nibble
    /// * `data0` - First data byte
    /// * `data1` - Second data byte
    pub fn channel(time: u32, status: u8, data0: u8, data1: u8) -> Self {
        Self {
            time,
            status,
            data: [data0, data1],
            extra: Vec::new(),
        }
    }

    /// Creates a meta event of the given type with its raw payload.
    pub fn meta(time: u32, meta_type: u8, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            time,
            status: META_EVENT,
            data: [meta_type, 0],
            extra: payload.into(),
        }
    }

    /// Creates a set-tempo meta event.
    ///
    /// # Arguments
    ///
    /// * `time` - Absolute tick
    /// * `usec_per_quarter` - Tempo in microseconds per quarter note (24 bits)
    pub fn tempo(time: u32, usec_per_quarter: u32) -> Self {
        let bytes = usec_per_quarter.to_be_bytes();
        Self::meta(time, META_TEMPO, [bytes[1], bytes[2], bytes[3]])
    }

    /// Length of the variable payload.
    pub fn extra_len(&self) -> usize {
        self.extra.len()
    }

    /// Returns true for meta events (status 0xFF).
    pub fn is_meta(&self) -> bool {
        self.status == META_EVENT
    }
}

/// An ordered, finite, restartable sequence of events.
#[derive(Debug, Clone)]
pub struct EventList {
    events: Vec<Event>,
    end_tick: u32,
}

impl EventList {
    /// Builds an event list, validating that it is non-empty and ordered.
    ///
    /// # Errors
    ///
    /// Returns [`LoadError::Empty`] for an empty list and
    /// [`LoadError::Unordered`] if any event is earlier than its predecessor.
    pub fn new(events: Vec<Event>) -> Result<Self, LoadError> {
        let last = events.last().ok_or(LoadError::Empty)?;
        if let Some(index) = events.windows(2).position(|w| w[1].time < w[0].time) {
            return Err(LoadError::Unordered {
                index: index + 1,
                time: events[index + 1].time,
            });
        }
        let end_tick = last.time;
        Ok(Self { events, end_tick })
    }

    /// Tick of the final event.
    pub fn end_tick(&self) -> u32 {
        self.end_tick
    }

    /// Number of events.
    pub fn len(&self) -> usize {
        self.events.len()
    }

    /// Always false; an event list holds at least one event.
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Iterates the events from the start.
    pub fn iter(&self) -> std::slice::Iter<'_, Event> {
        self.events.iter()
    }

    /// Returns the events as a slice.
    pub fn as_slice(&self) -> &[Event] {
        &self.events
    }
}

impl<'a> IntoIterator for &'a EventList {
    type Item = &'a Event;
    type IntoIter = std::slice::Iter<'a, Event>;

    fn into_iter(self) -> Self::IntoIter {
        self.events.iter()
    }
}
