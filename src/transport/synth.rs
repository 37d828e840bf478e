//! SoundFont synthesis for delivered events.
//!
//! Renders through rustysynth and plays through rodio. The
//! [`SynthEngine`] owns the audio output and must stay alive on the thread
//! that created it; [`SynthSink`] handles are cheap and can be registered
//! as destination ports.

use super::{EventKind, MidiSink, SeqEvent};
use crate::midi::{CONTROL_CHANGE, KEY_PRESSURE, MAX_DATA, PITCH_BEND, PROGRAM_CHANGE, SYSEX, SYSEX_END};
use anyhow::{Context, Result};
use rodio::{OutputStream, OutputStreamHandle, Source};
use rustysynth::{SoundFont, Synthesizer, SynthesizerSettings};
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Sample rate for audio synthesis (44.1 kHz standard).
pub const SAMPLE_RATE: u32 = 44100;

/// Audio buffer size for low-latency playback.
/// Smaller = lower latency but higher CPU usage.
const BUFFER_SIZE: usize = 256;

/// Audio source that generates samples from the synthesizer.
struct SynthSource {
    synth: Arc<Mutex<Synthesizer>>,
    left_buf: Vec<f32>,
    right_buf: Vec<f32>,
    buf_pos: usize,
    /// Current channel (0 = left, 1 = right).
    channel: usize,
}

impl SynthSource {
    fn new(synth: Arc<Mutex<Synthesizer>>) -> Self {
        Self {
            synth,
            left_buf: vec![0.0; BUFFER_SIZE],
            right_buf: vec![0.0; BUFFER_SIZE],
            buf_pos: BUFFER_SIZE, // Start at end to trigger first render
            channel: 0,
        }
    }
}

impl Iterator for SynthSource {
    type Item = f32;

    fn next(&mut self) -> Option<f32> {
        if self.buf_pos >= BUFFER_SIZE {
            if let Ok(mut synth) = self.synth.lock() {
                synth.render(&mut self.left_buf, &mut self.right_buf);
            } else {
                self.left_buf.fill(0.0);
                self.right_buf.fill(0.0);
            }
            self.buf_pos = 0;
        }

        // Interleave stereo samples: L, R, L, R, ...
        let sample = if self.channel == 0 {
            self.left_buf[self.buf_pos]
        } else {
            self.right_buf[self.buf_pos]
        };

        self.channel = 1 - self.channel;
        if self.channel == 0 {
            self.buf_pos += 1;
        }

        Some(sample)
    }
}

impl Source for SynthSource {
    fn current_frame_len(&self) -> Option<usize> {
        None // Continuous stream
    }

    fn channels(&self) -> u16 {
        2
    }

    fn sample_rate(&self) -> u32 {
        SAMPLE_RATE
    }

    fn total_duration(&self) -> Option<Duration> {
        None
    }
}

/// A SoundFont synthesizer playing to the default audio device.
pub struct SynthEngine {
    synth: Arc<Mutex<Synthesizer>>,
    /// Audio output stream (must be kept alive).
    _stream: OutputStream,
    _stream_handle: OutputStreamHandle,
}

impl SynthEngine {
    /// Loads a SoundFont and starts audio output.
    ///
    /// # Arguments
    ///
    /// * `soundfont_path` - Path to the SoundFont file (.sf2)
    ///
    /// # Errors
    ///
    /// Returns error if:
    /// - The SoundFont file cannot be read
    /// - The SoundFont is invalid
    /// - Audio output cannot be initialized
    pub fn new<P: AsRef<Path>>(soundfont_path: P) -> Result<Self> {
        let mut file = BufReader::new(File::open(soundfont_path.as_ref()).with_context(|| {
            format!(
                "Failed to open SoundFont: {}",
                soundfont_path.as_ref().display()
            )
        })?);
        let soundfont = Arc::new(
            SoundFont::new(&mut file)
                .map_err(|e| anyhow::anyhow!("Failed to load SoundFont: {:?}", e))?,
        );

        let settings = SynthesizerSettings::new(SAMPLE_RATE as i32);
        let synth = Synthesizer::new(&soundfont, &settings)
            .map_err(|e| anyhow::anyhow!("Failed to create synthesizer: {:?}", e))?;
        let synth = Arc::new(Mutex::new(synth));

        let (stream, stream_handle) =
            OutputStream::try_default().context("Failed to open audio output")?;
        stream_handle
            .play_raw(SynthSource::new(Arc::clone(&synth)))
            .context("Failed to start audio playback")?;

        Ok(Self {
            synth,
            _stream: stream,
            _stream_handle: stream_handle,
        })
    }

    /// Returns a destination sink feeding this synthesizer.
    pub fn sink(&self) -> SynthSink {
        SynthSink {
            synth: Arc::clone(&self.synth),
        }
    }
}

/// Destination port sink that plays events on a [`SynthEngine`].
#[derive(Clone)]
pub struct SynthSink {
    synth: Arc<Mutex<Synthesizer>>,
}

impl MidiSink for SynthSink {
    fn deliver(&mut self, event: &SeqEvent) {
        let Ok(mut synth) = self.synth.lock() else {
            return;
        };
        match &event.kind {
            EventKind::NoteOn {
                channel,
                note,
                velocity,
            } => synth.note_on(*channel as i32, *note as i32, *velocity as i32),
            EventKind::NoteOff { channel, note, .. } => {
                synth.note_off(*channel as i32, *note as i32)
            }
            EventKind::KeyPressure {
                channel,
                note,
                velocity,
            } => synth.process_midi_message(
                *channel as i32,
                KEY_PRESSURE as i32,
                *note as i32,
                *velocity as i32,
            ),
            EventKind::Controller {
                channel,
                param,
                value,
            } => synth.process_midi_message(
                *channel as i32,
                CONTROL_CHANGE as i32,
                *param as i32,
                *value as i32,
            ),
            EventKind::ProgramChange { channel, program } => synth.process_midi_message(
                *channel as i32,
                PROGRAM_CHANGE as i32,
                *program as i32,
                0,
            ),
            EventKind::PitchBend { channel, value } => {
                let raw = (*value as i32 + 8192).clamp(0, 0x3FFF);
                synth.process_midi_message(
                    *channel as i32,
                    PITCH_BEND as i32,
                    raw & 0x7F,
                    raw >> 7,
                )
            }
            EventKind::SysEx(bytes) => {
                if let Some(volume) = master_volume(bytes) {
                    synth.set_master_volume(volume as f32 / MAX_DATA as f32);
                }
            }
            EventKind::Echo | EventKind::QueueControl { .. } => {}
        }
    }
}

/// Volume of a universal master-volume SysEx message.
fn master_volume(bytes: &[u8]) -> Option<u8> {
    match bytes {
        &[SYSEX, 0x7F, _, 0x04, 0x01, _, msb, SYSEX_END] => Some(msb.min(MAX_DATA)),
        _ => None,
    }
}
