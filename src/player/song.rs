//! The song handle and its control surface.

use super::command::{control_channel, Command, ControlSender};
use super::discovery::{pick_destination, Destination};
use super::scheduler::{run_session, SessionParams, SessionReport};
use super::state::{PlaybackState, SharedState};
use super::{record_error, PlayerError};
use crate::config::PlayerConfig;
use crate::midi::{import_event_list, EventList, MAX_DATA};
use crate::transport::{Address, PortCaps, PortId, PortType, Transport};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

/// Name of the player thread.
const THREAD_NAME: &str = "midi-player";

type SessionResult<T> = (T, Result<SessionReport, PlayerError>);

/// A running session: its control channel and the thread that owns the transport.
struct Session<T> {
    control: ControlSender,
    handle: JoinHandle<SessionResult<T>>,
}

/// A loaded song bound to one transport connection.
///
/// At most one session runs per song. While it runs, the transport lives
/// on the player thread; it comes back when the session is joined.
///
/// # Example
///
/// ```no_run
/// use midiplay::config::PlayerConfig;
/// use midiplay::player::Song;
/// use midiplay::transport::SoftSequencer;
///
/// let seq = SoftSequencer::new()?;
/// let bytes = std::fs::read("song.mid")?;
/// let mut song = Song::load(&bytes, seq.open_client()?, &PlayerConfig::default())?;
/// song.start(0)?;
/// song.join()?;
/// # Ok::<(), Box<dyn std::error::Error>>(())
/// ```
pub struct Song<T: Transport + 'static> {
    events: Arc<EventList>,
    ppqn: u16,
    port: PortId,
    destination: Destination,
    allow_pause: bool,
    state: Arc<SharedState>,
    transport: Option<T>,
    session: Option<Session<T>>,
}

impl<T: Transport + 'static> Song<T> {
    /// Loads a Standard MIDI File and prepares it for playback on `transport`.
    ///
    /// # Arguments
    ///
    /// * `bytes` - Contents of the MIDI file
    /// * `transport` - Open connection; the song takes ownership of it
    /// * `config` - Client name, output selection and pause setting
    ///
    /// # Errors
    ///
    /// Returns error if the file cannot be parsed or the transport cannot
    /// be set up. The message is also available from
    /// [`last_error`](super::last_error).
    pub fn load(bytes: &[u8], transport: T, config: &PlayerConfig) -> Result<Self, PlayerError> {
        let (events, ppqn) = import_event_list(bytes).map_err(|e| {
            let err = PlayerError::Load(e);
            record_error(&err);
            err
        })?;
        Self::from_events(events, ppqn, transport, config)
    }

    /// Prepares an already built event list for playback.
    ///
    /// Names the client, creates the source port, restricts input to echo
    /// events and runs port discovery.
    ///
    /// # Errors
    ///
    /// Returns error if the transport cannot be set up; the transport is
    /// closed in that case.
    pub fn from_events(
        events: EventList,
        ppqn: u16,
        mut transport: T,
        config: &PlayerConfig,
    ) -> Result<Self, PlayerError> {
        let port = match open_port(&mut transport, config) {
            Ok(port) => port,
            Err(err) => {
                record_error(&err);
                if let Err(e) = transport.close() {
                    tracing::debug!("Closing transport after failed load: {}", e);
                }
                return Err(err);
            }
        };
        let destination = pick_destination(&mut transport, port, config);
        tracing::debug!(
            "Loaded {} events, ppqn {}, end tick {}",
            events.len(),
            ppqn,
            events.end_tick()
        );

        Ok(Self {
            events: Arc::new(events),
            ppqn,
            port,
            destination,
            allow_pause: config.allow_pause(),
            state: Arc::new(SharedState::new()),
            transport: Some(transport),
            session: None,
        })
    }

    /// Starts playback, ending any session that is still running first.
    ///
    /// # Arguments
    ///
    /// * `loops` - 0 plays once, N > 0 plays N extra times, negative loops forever
    ///
    /// # Errors
    ///
    /// Returns error if an earlier session panicked and took the transport
    /// with it, or the player thread cannot be spawned.
    pub fn start(&mut self, loops: i32) -> Result<(), PlayerError> {
        if let Err(e) = self.finish_session(true) {
            tracing::warn!("Previous session ended with an error: {}", e);
        }

        let Some(mut transport) = self.transport.take() else {
            let err = PlayerError::TransportUnavailable;
            record_error(&err);
            return Err(err);
        };

        let (control, rx) = control_channel();
        let events = Arc::clone(&self.events);
        let state = Arc::clone(&self.state);
        let params = SessionParams {
            port: self.port,
            dest: self.destination.dest,
            ppqn: self.ppqn,
            end_tick: self.events.end_tick(),
            loops,
        };

        self.state.begin_start();
        let spawned = thread::Builder::new()
            .name(THREAD_NAME.to_string())
            .spawn(move || {
                let result = run_session(&mut transport, events.as_slice(), params, &rx, &state);
                (transport, result)
            });

        match spawned {
            Ok(handle) => {
                self.session = Some(Session { control, handle });
                Ok(())
            }
            Err(e) => {
                self.state.mark_stopped();
                let err = PlayerError::Spawn(e);
                record_error(&err);
                Err(err)
            }
        }
    }

    /// Requests a pause.
    ///
    /// Only honoured if pausing is enabled and a session is active. Returns
    /// true if the request was sent.
    pub fn pause(&self) -> bool {
        self.allow_pause && self.state.load().is_active() && self.advise(Command::Pause)
    }

    /// Requests resuming a paused session. Returns true if the request was sent.
    pub fn resume(&self) -> bool {
        self.allow_pause && self.state.load() == PlaybackState::Paused && self.advise(Command::Resume)
    }

    /// Sets the output volume while playing.
    ///
    /// The value is clamped to 0-127. Ignored unless the state is PLAYING.
    /// Returns true if the request was sent.
    pub fn set_volume(&self, volume: i32) -> bool {
        if self.state.load() != PlaybackState::Playing {
            return false;
        }
        let volume = volume.clamp(0, MAX_DATA as i32) as u8;
        self.advise(Command::SetVolume(volume))
    }

    /// Stops playback and waits for the session's cleanup to finish.
    ///
    /// Does nothing if no session was started.
    ///
    /// # Errors
    ///
    /// Returns the session's own error, if it failed.
    pub fn stop(&mut self) -> Result<(), PlayerError> {
        self.finish_session(true).map(|_| ())
    }

    /// Waits for the current session to end on its own.
    ///
    /// Returns `None` if no session was started. With negative loops this
    /// only returns after another thread stops the song, so prefer
    /// [`stop`](Self::stop) there.
    pub fn join(&mut self) -> Result<Option<SessionReport>, PlayerError> {
        self.finish_session(false)
    }

    /// Returns true while a session is starting, playing or paused.
    pub fn is_active(&self) -> bool {
        self.state.load().is_active()
    }

    pub fn state(&self) -> PlaybackState {
        self.state.load()
    }

    /// Returns true once the current session has left its loop.
    pub fn is_finished(&self) -> bool {
        self.session
            .as_ref()
            .map_or(true, |session| session.handle.is_finished())
    }

    pub fn ppqn(&self) -> u16 {
        self.ppqn
    }

    /// Tick of the last event.
    pub fn end_tick(&self) -> u32 {
        self.events.end_tick()
    }

    pub fn events(&self) -> &EventList {
        &self.events
    }

    /// Address output is sent to.
    pub fn destination(&self) -> Address {
        self.destination.dest
    }

    /// Remote port connected during load, if any.
    pub fn connected_to(&self) -> Option<Address> {
        self.destination.connected
    }

    /// Stops playback, then releases the port and the transport connection.
    ///
    /// # Errors
    ///
    /// Returns error if the session failed or the transport cannot be
    /// released cleanly. Resources are released either way.
    pub fn free(mut self) -> Result<(), PlayerError> {
        let stopped = self.stop();
        let released = self.release();
        stopped.and(released)
    }

    fn advise(&self, command: Command) -> bool {
        self.session
            .as_ref()
            .is_some_and(|session| session.control.advise(command))
    }

    /// Ends the current session, if any, and takes the transport back.
    fn finish_session(&mut self, quit: bool) -> Result<Option<SessionReport>, PlayerError> {
        let Some(session) = self.session.take() else {
            return Ok(None);
        };

        if quit && self.state.load().is_active() && session.control.quit().is_err() {
            // The session dropped its receiver, so it is already unwinding
            tracing::debug!("Session already left its loop");
        }

        match session.handle.join() {
            Ok((transport, result)) => {
                self.transport = Some(transport);
                result.map(Some)
            }
            Err(_) => {
                self.state.mark_stopped();
                Err(PlayerError::SessionPanicked)
            }
        }
    }

    fn release(&mut self) -> Result<(), PlayerError> {
        let Some(mut transport) = self.transport.take() else {
            return Ok(());
        };
        let deleted = transport
            .delete_port(self.port)
            .map_err(PlayerError::transport("deleting port"));
        let closed = transport
            .close()
            .map_err(PlayerError::transport("closing transport"));
        deleted.and(closed)
    }
}

impl<T: Transport + 'static> Drop for Song<T> {
    fn drop(&mut self) {
        if let Err(e) = self.stop() {
            tracing::warn!("Error stopping song: {}", e);
        }
        if let Err(e) = self.release() {
            tracing::debug!("Error releasing transport: {}", e);
        }
    }
}

/// Names the client and creates the echo-filtered source port.
fn open_port<T: Transport + ?Sized>(
    transport: &mut T,
    config: &PlayerConfig,
) -> Result<PortId, PlayerError> {
    let name = config.resolved_client_name();
    transport
        .set_client_name(&name)
        .map_err(PlayerError::transport("setting client name"))?;
    let port = transport
        .create_port(
            &name,
            PortCaps::READ | PortCaps::WRITE | PortCaps::SUBS_READ | PortCaps::SYNC_READ,
            PortType::APPLICATION | PortType::MIDI_GENERIC,
        )
        .map_err(PlayerError::transport("creating port"))?;
    if let Err(e) = transport.set_echo_filter() {
        let _ = transport.delete_port(port);
        return Err(PlayerError::transport("setting event filter")(e));
    }
    Ok(port)
}
