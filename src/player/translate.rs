//! Conversion of event-list entries into transport events.

use crate::midi::{
    pitch_bend_value, Event, CONTROL_CHANGE, CTL_ALL_NOTES_OFF, CTL_ALL_SOUNDS_OFF,
    CTL_RESET_CONTROLLERS, CTL_SUSTAIN, KEY_PRESSURE, MAX_DATA, META_EVENT, META_TEMPO,
    MIDI_CHANNELS, NOTE_OFF, NOTE_ON, PITCH_BEND, PROGRAM_CHANGE, SYSEX, SYSEX_END,
};
use crate::transport::{Address, EventKind, PortId, QueueControl, QueueId, SeqEvent};

/// Controllers broadcast on every channel when a session ends, in order.
pub const SHUTDOWN_CONTROLLERS: [u8; 4] = [
    CTL_SUSTAIN,
    CTL_ALL_NOTES_OFF,
    CTL_RESET_CONTROLLERS,
    CTL_ALL_SOUNDS_OFF,
];

/// Translates one event into a send scheduled on `queue` at the event's tick.
///
/// Channel messages go to `dest`. A set-tempo meta event with a 3-byte
/// payload becomes a tempo change of the queue itself. Anything else
/// (SysEx, channel pressure, other meta events) is unhandled and yields
/// `None`.
///
/// # Arguments
///
/// * `event` - Event to translate
/// * `port` - Local source port
/// * `dest` - Destination of channel messages
/// * `queue` - Session queue the event is scheduled on
pub fn translate(event: &Event, port: PortId, dest: Address, queue: QueueId) -> Option<SeqEvent> {
    let channel = event.status & 0x0F;
    let [data0, data1] = event.data;

    let kind = match event.status & 0xF0 {
        NOTE_ON => EventKind::NoteOn {
            channel,
            note: data0,
            velocity: data1,
        },
        NOTE_OFF => EventKind::NoteOff {
            channel,
            note: data0,
            velocity: data1,
        },
        CONTROL_CHANGE => EventKind::Controller {
            channel,
            param: data0,
            value: data1,
        },
        KEY_PRESSURE => EventKind::KeyPressure {
            channel,
            note: data0,
            velocity: data1,
        },
        PROGRAM_CHANGE => EventKind::ProgramChange {
            channel,
            program: data0,
        },
        PITCH_BEND => EventKind::PitchBend {
            channel,
            value: pitch_bend_value(data0, data1),
        },
        _ => {
            let tempo = tempo_of(event)?;
            return Some(
                SeqEvent::queue_control(queue, QueueControl::SetTempo(tempo))
                    .from_port(port)
                    .at_tick(queue, event.time),
            );
        }
    };

    Some(
        SeqEvent::new(kind)
            .from_port(port)
            .to(dest)
            .at_tick(queue, event.time),
    )
}

/// Microseconds per quarter note of a well-formed set-tempo meta event.
fn tempo_of(event: &Event) -> Option<u32> {
    if event.status != META_EVENT || event.data[0] != META_TEMPO {
        return None;
    }
    match event.extra.as_slice() {
        &[hi, mid, lo] => Some(u32::from_be_bytes([0, hi, mid, lo])),
        _ => None,
    }
}

/// The universal master-volume SysEx message.
pub fn volume_sysex(volume: u8) -> EventKind {
    EventKind::SysEx(vec![
        SYSEX,
        0x7F,
        0x7F,
        0x04,
        0x01,
        0x00,
        volume.min(MAX_DATA),
        SYSEX_END,
    ])
}

/// Direct sends that release every channel at the end of a session.
///
/// For each of the 16 channels: sustain off, all notes off, reset
/// controllers, all sounds off.
pub fn shutdown_events(port: PortId, dest: Address) -> impl Iterator<Item = SeqEvent> {
    (0..MIDI_CHANNELS).flat_map(move |channel| {
        SHUTDOWN_CONTROLLERS.into_iter().map(move |param| {
            SeqEvent::new(EventKind::Controller {
                channel,
                param,
                value: 0,
            })
            .from_port(port)
            .to(dest)
            .direct()
        })
    })
}
