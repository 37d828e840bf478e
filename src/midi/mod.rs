//! MIDI data consumed by the player.
//!
//! This module provides the timed event model, the constants used to
//! interpret raw status bytes, and the Standard MIDI File importer that
//! produces an ordered event list.

mod event;
pub(crate) mod midi_import;

pub use event::{Event, EventList};
pub use midi_import::{import_event_list, LoadError};

/// Number of MIDI channels.
pub const MIDI_CHANNELS: u8 = 16;

/// Channel message kinds (upper nibble of the status byte).
pub const NOTE_OFF: u8 = 0x80;
pub const NOTE_ON: u8 = 0x90;
pub const KEY_PRESSURE: u8 = 0xA0;
pub const CONTROL_CHANGE: u8 = 0xB0;
pub const PROGRAM_CHANGE: u8 = 0xC0;
pub const CHANNEL_PRESSURE: u8 = 0xD0;
pub const PITCH_BEND: u8 = 0xE0;

/// System exclusive start and end (also the SMF escape status).
pub const SYSEX: u8 = 0xF0;
pub const SYSEX_END: u8 = 0xF7;

/// Status byte used for meta events in the event list.
pub const META_EVENT: u8 = 0xFF;
/// Set-tempo meta type; its payload is a 24-bit microseconds-per-quarter value.
pub const META_TEMPO: u8 = 0x51;

/// Controller numbers used by the shutdown broadcast.
pub const CTL_SUSTAIN: u8 = 64;
pub const CTL_ALL_SOUNDS_OFF: u8 = 120;
pub const CTL_RESET_CONTROLLERS: u8 = 121;
pub const CTL_ALL_NOTES_OFF: u8 = 123;

/// Default queue tempo in microseconds per quarter note (120 BPM).
pub const DEFAULT_TEMPO_USEC: u32 = 500_000;

/// Maximum 7-bit data value.
pub const MAX_DATA: u8 = 0x7F;

/// Standard MIDI note names for display purposes.
/// Maps MIDI note number (0-127) to note name within an octave.
pub const NOTE_NAMES: [&str; 12] = [
    "C", "C#", "D", "D#", "E", "F", "F#", "G", "G#", "A", "A#", "B",
];

/// Converts a MIDI note number to a human-readable note name with octave.
///
/// # Arguments
///
/// * `note` - MIDI note number (0-127)
///
/// # Returns
///
/// String representation like "C4" or "F#5"
///
/// # Examples
///
/// ```
/// use midiplay::midi::note_to_name;
///
/// let name = note_to_name(60); // Middle C
/// assert_eq!(name, "C4");
/// ```
pub fn note_to_name(note: u8) -> String {
    let octave = (note / 12) as i8 - 1; // MIDI octave convention
    let note_index = (note % 12) as usize;
    format!("{}{}", NOTE_NAMES[note_index], octave)
}

/// Converts a tick count to microseconds at a given tempo and resolution.
///
/// # Arguments
///
/// * `ticks` - Number of ticks
/// * `tempo_usec` - Tempo in microseconds per quarter note
/// * `ppq` - Pulses (ticks) per quarter note
pub fn ticks_to_micros(ticks: u64, tempo_usec: u32, ppq: u16) -> u64 {
    ticks * tempo_usec as u64 / ppq.max(1) as u64
}

/// Converts elapsed microseconds to whole ticks at a given tempo and resolution.
pub fn micros_to_ticks(micros: u64, tempo_usec: u32, ppq: u16) -> u64 {
    micros * ppq as u64 / tempo_usec.max(1) as u64
}

/// Joins two 7-bit data bytes into a zero-centered 14-bit pitch bend value.
///
/// # Arguments
///
/// * `lsb` - Least significant 7 bits
/// * `msb` - Most significant 7 bits
///
/// # Returns
///
/// Bend in the range -8192..=8191
pub fn pitch_bend_value(lsb: u8, msb: u8) -> i16 {
    (((msb as i16 & 0x7F) << 7) | (lsb as i16 & 0x7F)) - 8192
}
