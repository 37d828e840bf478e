//! Standard MIDI File (SMF) import into a playable event list.
//!
//! Reads .mid data from memory and flattens every track into a single
//! list ordered by absolute tick. Supports SMF Format 0, 1 and 2 with
//! metrical timing.
//!
//! # Conversion
//!
//! - Channel messages keep their raw status and data bytes
//! - Pitch bend is stored as its 7-bit LSB/MSB pair
//! - SysEx and escape events keep their payload in `extra`
//! - Meta events use status 0xFF with the meta type in `data[0]`
//!
//! Events that share a tick keep track order, then their order within the track.

use super::{Event, SYSEX, SYSEX_END};
use midly::{MetaMessage, MidiMessage, Smf, Timing, TrackEventKind};
use thiserror::Error;

/// Errors that can occur while building an event list.
#[derive(Debug, Error)]
pub enum LoadError {
    /// MIDI parsing failed
    #[error("MIDI parse error: {0}")]
    Parse(String),
    /// Unsupported MIDI timing
    #[error("Unsupported format: {0}")]
    UnsupportedFormat(String),
    /// The input held no events at all
    #[error("MIDI data contains no events")]
    Empty,
    /// An event is earlier than the one before it
    #[error("event {index} at tick {time} is out of order")]
    Unordered { index: usize, time: u32 },
}

/// An event tagged with the position it came from, used for stable merging.
type TaggedEvent = (u32, usize, usize, Event);

/// Parses SMF bytes into an ordered event list.
///
/// # Arguments
///
/// * `data` - Raw Standard MIDI File bytes
///
/// # Returns
///
/// The merged event list and the file's pulses per quarter note
///
/// # Errors
///
/// Returns error if the data cannot be parsed, uses SMPTE timing,
/// or contains no events
pub fn import_event_list(data: &[u8]) -> Result<(super::EventList, u16), LoadError> {
    let smf = Smf::parse(data).map_err(|e| LoadError::Parse(e.to_string()))?;

    let ppqn = match smf.header.timing {
        Timing::Metrical(tpb) => tpb.as_int(),
        Timing::Timecode(_, _) => {
            return Err(LoadError::UnsupportedFormat(
                "SMPTE timecode timing not supported".to_string(),
            ))
        }
    };
    if ppqn == 0 {
        return Err(LoadError::UnsupportedFormat(
            "zero ticks per quarter note".to_string(),
        ));
    }

    let mut tagged: Vec<TaggedEvent> = Vec::new();
    for (track_idx, track) in smf.tracks.iter().enumerate() {
        let mut current_tick: u32 = 0;
        for (event_idx, event) in track.iter().enumerate() {
            current_tick = current_tick.saturating_add(event.delta.as_int());
            tagged.push((
                current_tick,
                track_idx,
                event_idx,
                convert_event(current_tick, &event.kind),
            ));
        }
    }

    tagged.sort_by_key(|&(tick, track, index, _)| (tick, track, index));
    let events = tagged.into_iter().map(|(_, _, _, event)| event).collect();
    let list = super::EventList::new(events)?;

    tracing::debug!(
        "Imported {} events, ppqn {}, end tick {}",
        list.len(),
        ppqn,
        list.end_tick()
    );

    Ok((list, ppqn))
}

/// Converts one parsed track event into the raw event representation.
fn convert_event(time: u32, kind: &TrackEventKind<'_>) -> Event {
    match kind {
        TrackEventKind::Midi { channel, message } => {
            let ch = channel.as_int();
            let (kind, data0, data1) = match *message {
                MidiMessage::NoteOff { key, vel } => (0x80, key.as_int(), vel.as_int()),
                MidiMessage::NoteOn { key, vel } => (0x90, key.as_int(), vel.as_int()),
                MidiMessage::Aftertouch { key, vel } => (0xA0, key.as_int(), vel.as_int()),
                MidiMessage::Controller { controller, value } => {
                    (0xB0, controller.as_int(), value.as_int())
                }
                MidiMessage::ProgramChange { program } => (0xC0, program.as_int(), 0),
                MidiMessage::ChannelAftertouch { vel } => (0xD0, vel.as_int(), 0),
                MidiMessage::PitchBend { bend } => {
                    let raw = bend.0.as_int();
                    (0xE0, (raw & 0x7F) as u8, (raw >> 7) as u8)
                }
            };
            Event::channel(time, kind | ch, data0, data1)
        }
        TrackEventKind::SysEx(bytes) => Event {
            time,
            status: SYSEX,
            data: [0, 0],
            extra: bytes.to_vec(),
        },
        TrackEventKind::Escape(bytes) => Event {
            time,
            status: SYSEX_END,
            data: [0, 0],
            extra: bytes.to_vec(),
        },
        TrackEventKind::Meta(meta) => {
            let (meta_type, payload) = meta_payload(meta);
            Event::meta(time, meta_type, payload)
        }
    }
}

/// Returns the raw meta type byte and payload for a parsed meta message.
fn meta_payload(meta: &MetaMessage<'_>) -> (u8, Vec<u8>) {
    match *meta {
        MetaMessage::TrackNumber(number) => (
            0x00,
            number.map(|n| n.to_be_bytes().to_vec()).unwrap_or_default(),
        ),
        MetaMessage::Text(text) => (0x01, text.to_vec()),
        MetaMessage::Copyright(text) => (0x02, text.to_vec()),
        MetaMessage::TrackName(text) => (0x03, text.to_vec()),
        MetaMessage::InstrumentName(text) => (0x04, text.to_vec()),
        MetaMessage::Lyric(text) => (0x05, text.to_vec()),
        MetaMessage::Marker(text) => (0x06, text.to_vec()),
        MetaMessage::CuePoint(text) => (0x07, text.to_vec()),
        MetaMessage::ProgramName(text) => (0x08, text.to_vec()),
        MetaMessage::DeviceName(text) => (0x09, text.to_vec()),
        MetaMessage::MidiChannel(channel) => (0x20, vec![channel.as_int()]),
        MetaMessage::MidiPort(port) => (0x21, vec![port.as_int()]),
        MetaMessage::EndOfTrack => (0x2F, Vec::new()),
        MetaMessage::Tempo(tempo) => {
            let bytes = tempo.as_int().to_be_bytes();
            (super::META_TEMPO, vec![bytes[1], bytes[2], bytes[3]])
        }
        MetaMessage::SmpteOffset(smpte) => (
            0x54,
            vec![
                smpte.hour(),
                smpte.minute(),
                smpte.second(),
                smpte.frame(),
                smpte.subframe(),
            ],
        ),
        MetaMessage::TimeSignature(num, denom_power, clocks, notes) => {
            (0x58, vec![num, denom_power, clocks, notes])
        }
        MetaMessage::KeySignature(sharps, minor) => (0x59, vec![sharps as u8, minor as u8]),
        MetaMessage::SequencerSpecific(data) => (0x7F, data.to_vec()),
        MetaMessage::Unknown(meta_type, data) => (meta_type, data.to_vec()),
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::midi::{META_EVENT, META_TEMPO};

    /// Writes a variable-length quantity used for delta times in MIDI.
    fn write_vlq(value: u32, buffer: &mut Vec<u8>) {
        let mut bytes = vec![(value & 0x7F) as u8];
        let mut temp = value >> 7;
        while temp > 0 {
            bytes.push((temp & 0x7F) as u8 | 0x80);
            temp >>= 7;
        }
        buffer.extend(bytes.iter().rev());
    }

    /// Builds an SMF image from tracks of (delta, raw event bytes).
    pub(crate) fn build_smf(format: u16, division: u16, tracks: &[Vec<(u32, Vec<u8>)>]) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(b"MThd");
        out.extend_from_slice(&6u32.to_be_bytes());
        out.extend_from_slice(&format.to_be_bytes());
        out.extend_from_slice(&(tracks.len() as u16).to_be_bytes());
        out.extend_from_slice(&division.to_be_bytes());

        for track in tracks {
            let mut data = Vec::new();
            for (delta, bytes) in track {
                write_vlq(*delta, &mut data);
                data.extend_from_slice(bytes);
            }
            out.extend_from_slice(b"MTrk");
            out.extend_from_slice(&(data.len() as u32).to_be_bytes());
            out.extend_from_slice(&data);
        }
        out
    }

    #[test]
    fn test_vlq_encoding() {
        let mut buffer = Vec::new();
        write_vlq(0, &mut buffer);
        assert_eq!(buffer, vec![0x00]);
        buffer.clear();

        write_vlq(128, &mut buffer);
        assert_eq!(buffer, vec![0x81, 0x00]);
        buffer.clear();

        write_vlq(0x4000, &mut buffer);
        assert_eq!(buffer, vec![0x81, 0x80, 0x00]);
    }

    #[test]
    fn test_single_track_import() {
        let smf = build_smf(
            0,
            96,
            &[vec![
                (0, vec![0xFF, 0x51, 0x03, 0x07, 0xA1, 0x20]),
                (0, vec![0x90, 60, 100]),
                (10, vec![0x80, 60, 0]),
                (10, vec![0xE1, 0x00, 0x40]),
                (5, vec![0xFF, 0x2F, 0x00]),
            ]],
        );

        let (list, ppqn) = import_event_list(&smf).unwrap();
        assert_eq!(ppqn, 96);
        assert_eq!(list.len(), 5);
        assert_eq!(list.end_tick(), 25);

        let events = list.as_slice();
        assert_eq!(events[0].status, META_EVENT);
        assert_eq!(events[0].data[0], META_TEMPO);
        assert_eq!(events[0].extra, vec![0x07, 0xA1, 0x20]);
        assert_eq!(events[1], Event::channel(0, 0x90, 60, 100));
        assert_eq!(events[2], Event::channel(10, 0x80, 60, 0));
        assert_eq!(events[3], Event::channel(20, 0xE1, 0x00, 0x40));
        assert_eq!(events[4].data[0], 0x2F);
    }

    #[test]
    fn test_tracks_are_merged_by_time() {
        let smf = build_smf(
            1,
            480,
            &[
                vec![(0, vec![0x90, 60, 100]), (20, vec![0x80, 60, 0])],
                vec![(10, vec![0x91, 64, 90]), (10, vec![0x81, 64, 0])],
            ],
        );

        let (list, _) = import_event_list(&smf).unwrap();
        let times: Vec<u32> = list.iter().map(|e| e.time).collect();
        assert_eq!(times, vec![0, 10, 20, 20]);
        // Ties keep track order
        assert_eq!(list.as_slice()[2].status, 0x80);
        assert_eq!(list.as_slice()[3].status, 0x81);
    }

    #[test]
    fn test_smpte_timing_rejected() {
        // Negative frames-per-second in the division word selects timecode timing
        let smf = build_smf(0, 0xE728, &[vec![(0, vec![0x90, 60, 100])]]);
        assert!(matches!(
            import_event_list(&smf),
            Err(LoadError::UnsupportedFormat(_))
        ));
    }

    #[test]
    fn test_garbage_rejected() {
        assert!(matches!(
            import_event_list(b"not a midi file"),
            Err(LoadError::Parse(_))
        ));
    }

    #[test]
    fn test_no_events_rejected() {
        let smf = build_smf(0, 96, &[Vec::new()]);
        assert!(matches!(import_event_list(&smf), Err(LoadError::Empty)));
    }
}
