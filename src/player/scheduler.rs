//! The playback scheduler: one session of the player thread.
//!
//! The loop wakes whenever a command arrives or the transport's readiness
//! changes. Per wake it takes at most one command, accepts one input event
//! (the echo that marks the end of a pass), and feeds at most one event to
//! the timing queue while the transport has room for it.

use super::command::Command;
use super::state::SharedState;
use super::translate::{shutdown_events, translate, volume_sysex};
use super::{PlayerError, QUEUE_NAME};
use crate::midi::{Event, DEFAULT_TEMPO_USEC, MAX_DATA};
use crate::transport::{
    Address, EventKind, PortId, QueueControl, QueueId, QueueTempo, SeqEvent, Transport,
    TransportError,
};
use crossbeam_channel::{select, Receiver, TryRecvError};
use std::thread;
use std::time::Duration;

/// Attempts made to enqueue a must-succeed event before giving up.
const ENQUEUE_ATTEMPTS: u32 = 2_000;

/// Attempts that only yield before backing off with short sleeps.
const ENQUEUE_SPIN_ATTEMPTS: u32 = 16;

/// What a session needs to know about its song.
#[derive(Debug, Clone, Copy)]
pub(crate) struct SessionParams {
    pub port: PortId,
    pub dest: Address,
    pub ppqn: u16,
    pub end_tick: u32,
    pub loops: i32,
}

/// Summary of a finished session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionReport {
    /// Passes over the event list whose end was confirmed by the echo.
    pub passes: u32,
    /// Events handed to the timing queue.
    pub events_sent: u64,
    /// Events skipped because they have no transport equivalent.
    pub unhandled: u64,
}

/// Runs one playback session to completion on the calling thread.
///
/// Allocates and starts the session queue, plays `events` `loops + 1`
/// times (forever for negative `loops`) or until [`Command::Quit`], and
/// always leaves the state STOPPED with the queue released and every
/// channel silenced.
///
/// # Errors
///
/// Returns error if the queue cannot be set up or a must-succeed enqueue
/// keeps failing. Cleanup still runs in the latter case.
pub(crate) fn run_session<T: Transport + ?Sized>(
    transport: &mut T,
    events: &[Event],
    params: SessionParams,
    control: &Receiver<Command>,
    state: &SharedState,
) -> Result<SessionReport, PlayerError> {
    let queue = match transport.alloc_queue(QUEUE_NAME) {
        Ok(queue) => queue,
        Err(e) => {
            state.mark_stopped();
            return Err(PlayerError::transport("allocating queue")(e));
        }
    };

    let mut player = Player::new(transport, events, params, queue, state);
    let result = player.prepare().and_then(|()| player.run(control));
    player.teardown();

    let report = player.report;
    match &result {
        Ok(()) => tracing::info!(
            "Playback finished after {} pass(es), {} events sent",
            report.passes,
            report.events_sent
        ),
        Err(e) => tracing::error!("Playback aborted: {}", e),
    }
    result.map(|()| report)
}

struct Player<'a, T: Transport + ?Sized> {
    transport: &'a mut T,
    events: &'a [Event],
    state: &'a SharedState,
    port: PortId,
    /// Our own port address; echoes from it end a pass.
    me: Address,
    dest: Address,
    queue: QueueId,
    ppqn: u16,
    end_tick: u32,
    loops: i32,
    cursor: usize,
    finished: bool,
    /// Whether output room should wake the loop.
    want_output: bool,
    volume: u8,
    report: SessionReport,
}

impl<'a, T: Transport + ?Sized> Player<'a, T> {
    fn new(
        transport: &'a mut T,
        events: &'a [Event],
        params: SessionParams,
        queue: QueueId,
        state: &'a SharedState,
    ) -> Self {
        let me = Address::new(transport.client_id(), params.port.0);
        Self {
            transport,
            events,
            state,
            port: params.port,
            me,
            dest: params.dest,
            queue,
            ppqn: params.ppqn,
            end_tick: params.end_tick,
            loops: params.loops,
            cursor: 0,
            finished: false,
            want_output: true,
            volume: MAX_DATA,
            report: SessionReport::default(),
        }
    }

    fn prepare(&mut self) -> Result<(), PlayerError> {
        self.transport
            .start_queue(self.queue)
            .map_err(PlayerError::transport("starting queue"))?;
        self.transport
            .set_queue_tempo(
                self.queue,
                QueueTempo {
                    tempo: DEFAULT_TEMPO_USEC,
                    ppq: self.ppqn,
                },
            )
            .map_err(PlayerError::transport("setting queue tempo"))?;
        self.enqueue_sentinel()?;

        self.state.mark_playing();
        self.transport
            .set_nonblocking(true)
            .map_err(PlayerError::transport("switching to non-blocking output"))?;
        tracing::info!(
            "Playing {} events on {} (end tick {}, loops {})",
            self.events.len(),
            self.queue,
            self.end_tick,
            self.loops
        );
        Ok(())
    }

    fn run(&mut self, control: &Receiver<Command>) -> Result<(), PlayerError> {
        let doorbell = self.transport.doorbell();

        loop {
            let mut command = None;
            let mut ready = self.transport.readiness();
            if !ready.input && !(self.want_output && ready.output) {
                select! {
                    recv(control) -> msg => {
                        command = Some(msg.unwrap_or(Command::Quit));
                    }
                    recv(doorbell) -> msg => {
                        if msg.is_err() {
                            tracing::warn!("Transport went away, ending playback");
                            command = Some(Command::Quit);
                        }
                    }
                }
                ready = self.transport.readiness();
            }
            if command.is_none() {
                command = match control.try_recv() {
                    Ok(command) => Some(command),
                    Err(TryRecvError::Empty) => None,
                    Err(TryRecvError::Disconnected) => Some(Command::Quit),
                };
            }
            if let Some(command) = command {
                self.handle_command(command);
            }

            if ready.input {
                self.accept_input();
            }

            if self.cursor >= self.events.len() {
                if !self.finished {
                    // The echo only arrives once everything before it is out
                    tracing::debug!("Draining output");
                    match self.transport.drain_output() {
                        Ok(()) => self.want_output = false,
                        Err(TransportError::WouldBlock) => {}
                        Err(e) => {
                            tracing::warn!("Failed to drain output: {}", e);
                            self.want_output = false;
                        }
                    }
                    continue;
                }
                if self.loops == 0 {
                    break;
                }
                self.restart()?;
            }

            if !ready.output {
                continue;
            }
            self.send_current();
        }
        Ok(())
    }

    fn handle_command(&mut self, command: Command) {
        tracing::debug!("Got control {:?}", command);
        match command {
            Command::Quit => {
                self.cursor = self.events.len();
                self.loops = 0;
                self.finished = true;
            }
            Command::SetVolume(volume) => {
                self.volume = volume.min(MAX_DATA);
                self.send_volume(self.volume);
            }
            Command::Pause => {
                self.send_volume(0);
                self.send_queue_control(QueueControl::Stop);
                self.state.mark_paused();
            }
            Command::Resume => {
                self.send_queue_control(QueueControl::Continue);
                self.send_volume(self.volume);
                self.state.mark_resumed();
            }
        }
    }

    fn accept_input(&mut self) {
        match self.transport.event_input() {
            Ok(Some(event)) if event.kind == EventKind::Echo && event.source == self.me => {
                tracing::debug!("End of pass {}", self.report.passes + 1);
                self.report.passes += 1;
                self.finished = true;
            }
            Ok(_) | Err(TransportError::WouldBlock) => {}
            Err(e) => tracing::warn!("Failed to read input: {}", e),
        }
    }

    fn restart(&mut self) -> Result<(), PlayerError> {
        tracing::debug!("Playback is looping");
        self.cursor = 0;

        // Runs at once, before the sentinel, as tick 0 is already past
        let reset = SeqEvent::queue_control(self.queue, QueueControl::SetPositionTick(0))
            .from_port(self.port)
            .at_tick(self.queue, 0);
        self.enqueue(&reset)
            .map_err(PlayerError::transport("resetting queue position"))?;
        self.enqueue_sentinel()?;

        if self.loops > 0 {
            self.loops -= 1;
        }
        self.finished = false;
        self.want_output = true;
        Ok(())
    }

    fn send_current(&mut self) {
        let events = self.events;
        let Some(event) = events.get(self.cursor) else {
            return;
        };
        let Some(out) = translate(event, self.port, self.dest, self.queue) else {
            tracing::debug!(
                "Unhandled {}: {:02x} {:02x} {:02x} (extra {})",
                event.time,
                event.status,
                event.data[0],
                event.data[1],
                event.extra_len()
            );
            self.report.unhandled += 1;
            self.cursor += 1;
            return;
        };

        match self.transport.event_output(&out) {
            Err(TransportError::WouldBlock) => return,
            Ok(()) => {
                tracing::trace!(
                    "Event {}: {:02x} {:02x} {:02x}",
                    event.time,
                    event.status,
                    event.data[0],
                    event.data[1]
                );
                self.report.events_sent += 1;
            }
            Err(e) => tracing::warn!("Failed to send event at tick {}: {}", event.time, e),
        }
        self.cursor += 1;
    }

    fn enqueue_sentinel(&mut self) -> Result<(), PlayerError> {
        let echo = SeqEvent::new(EventKind::Echo)
            .from_port(self.port)
            .to(self.me)
            .at_tick(self.queue, self.end_tick.saturating_add(1));
        self.enqueue(&echo)
            .map_err(PlayerError::transport("scheduling end-of-song echo"))
    }

    /// Sends a scheduled event that must not be skipped, retrying on back-pressure.
    fn enqueue(&mut self, event: &SeqEvent) -> Result<(), TransportError> {
        for attempt in 0..ENQUEUE_ATTEMPTS {
            match self.transport.event_output(event) {
                Err(TransportError::WouldBlock) if attempt < ENQUEUE_SPIN_ATTEMPTS => {
                    thread::yield_now()
                }
                Err(TransportError::WouldBlock) => thread::sleep(Duration::from_millis(1)),
                other => return other,
            }
        }
        Err(TransportError::WouldBlock)
    }

    fn send_volume(&mut self, volume: u8) {
        let event = SeqEvent::new(volume_sysex(volume))
            .from_port(self.port)
            .to(self.dest);
        if let Err(e) = self.transport.event_output_direct(&event) {
            tracing::warn!("Failed to send volume {}: {}", volume, e);
        }
    }

    fn send_queue_control(&mut self, control: QueueControl) {
        let event = SeqEvent::queue_control(self.queue, control).from_port(self.port);
        if let Err(e) = self.transport.event_output_direct(&event) {
            tracing::warn!("Failed to send {:?} to {}: {}", control, self.queue, e);
        }
    }

    /// Stops playback and releases the queue, then silences every channel.
    ///
    /// Each step is attempted even if an earlier one failed.
    fn teardown(&mut self) {
        self.state.mark_stopped();

        let steps: [(&str, Result<(), TransportError>); 5] = [
            ("switch to blocking output", self.transport.set_nonblocking(false)),
            ("drop pending output", self.transport.drop_output()),
            ("stop queue", self.transport.stop_queue(self.queue)),
            ("drain output", self.transport.drain_output()),
            ("free queue", self.transport.free_queue(self.queue)),
        ];
        for (step, result) in steps {
            if let Err(e) = result {
                tracing::warn!("Failed to {}: {}", step, e);
            }
        }

        let mut failed = 0;
        for event in shutdown_events(self.port, self.dest) {
            if self.transport.event_output_direct(&event).is_err() {
                failed += 1;
            }
        }
        if failed > 0 {
            tracing::warn!("{} channel reset messages could not be sent", failed);
        }
        tracing::debug!("Playback thread returns");
    }
}
