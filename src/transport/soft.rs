//! In-process sequencer implementing [`Transport`].
//!
//! A [`SoftSequencer`] plays the role of the sequencer kernel: it owns
//! every client, port, subscription and timing queue, and runs one
//! dispatcher thread that releases scheduled events when their queue
//! reaches their tick. Clients opened with [`SoftSequencer::open_client`]
//! talk to it through [`SoftClient`].
//!
//! Destination ports are registered with [`SoftSequencer::add_sink_port`]
//! and hand every delivered event to a [`MidiSink`].

use super::{
    Address, ClientId, EventKind, MidiSink, PortCaps, PortId, PortInfo, PortType, QueueControl,
    QueueId, QueueTempo, Readiness, Schedule, SeqEvent, Transport, TransportError,
};
use crate::midi::{micros_to_ticks, ticks_to_micros, DEFAULT_TEMPO_USEC};
use crossbeam_channel::{bounded, Receiver, Sender};
use std::cmp::{Ordering, Reverse};
use std::collections::{BTreeMap, BinaryHeap, VecDeque};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Default number of undelivered scheduled events a client may hold.
pub const DEFAULT_POOL_SIZE: usize = 500;

/// Client ids below this are reserved for the system.
const FIRST_USER_CLIENT: ClientId = 128;

/// Resolution of a freshly allocated queue.
const DEFAULT_QUEUE_PPQ: u16 = 96;

/// Clock of a timing queue.
///
/// The current tick is derived from an anchor (a tick and the instant it
/// was reached) plus the time elapsed since, so tempo changes and
/// repositioning only move the anchor.
#[derive(Debug, Clone)]
struct QueueClock {
    tempo: u32,
    ppq: u16,
    running: bool,
    anchor_tick: u64,
    anchor_at: Instant,
}

impl QueueClock {
    fn new(now: Instant) -> Self {
        Self {
            tempo: DEFAULT_TEMPO_USEC,
            ppq: DEFAULT_QUEUE_PPQ,
            running: false,
            anchor_tick: 0,
            anchor_at: now,
        }
    }

    fn tick_at(&self, now: Instant) -> u64 {
        if !self.running {
            return self.anchor_tick;
        }
        let elapsed = now.saturating_duration_since(self.anchor_at).as_micros() as u64;
        self.anchor_tick + micros_to_ticks(elapsed, self.tempo, self.ppq)
    }

    /// Moves the anchor to the last whole tick reached, keeping the remainder.
    fn reanchor(&mut self, now: Instant) {
        if !self.running {
            return;
        }
        let elapsed = now.saturating_duration_since(self.anchor_at).as_micros() as u64;
        let ticks = micros_to_ticks(elapsed, self.tempo, self.ppq);
        self.anchor_tick += ticks;
        self.anchor_at += Duration::from_micros(ticks_to_micros(ticks, self.tempo, self.ppq));
    }

    fn apply(&mut self, control: QueueControl, now: Instant) {
        match control {
            QueueControl::Start => {
                self.running = true;
                self.anchor_tick = 0;
                self.anchor_at = now;
            }
            QueueControl::Stop => {
                self.reanchor(now);
                self.running = false;
            }
            QueueControl::Continue => {
                if !self.running {
                    self.running = true;
                    self.anchor_at = now;
                }
            }
            QueueControl::SetPositionTick(tick) => {
                self.anchor_tick = tick as u64;
                self.anchor_at = now;
            }
            QueueControl::SetTempo(tempo) => {
                self.reanchor(now);
                self.tempo = tempo.max(1);
            }
        }
    }

    fn set_resolution(&mut self, ppq: u16, now: Instant) {
        self.reanchor(now);
        self.ppq = ppq.max(1);
    }

    /// Instant at which `tick` is reached, or None while stopped.
    fn deadline(&self, tick: u64) -> Option<Instant> {
        if !self.running {
            return None;
        }
        let ahead = tick.saturating_sub(self.anchor_tick);
        let micros = (ahead * self.tempo as u64).div_ceil(self.ppq as u64);
        Some(self.anchor_at + Duration::from_micros(micros))
    }
}

/// A scheduled event waiting for its tick.
struct Pending {
    tick: u64,
    seq: u64,
    owner: ClientId,
    event: SeqEvent,
}

impl PartialEq for Pending {
    fn eq(&self, other: &Self) -> bool {
        self.tick == other.tick && self.seq == other.seq
    }
}

impl Eq for Pending {}

impl PartialOrd for Pending {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Pending {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.tick, self.seq).cmp(&(other.tick, other.seq))
    }
}

struct QueueSlot {
    name: String,
    owner: ClientId,
    clock: QueueClock,
    pending: BinaryHeap<Reverse<Pending>>,
}

struct PortSlot {
    name: String,
    caps: PortCaps,
    kind: PortType,
    subscribers: Vec<Address>,
    sink: Option<Box<dyn MidiSink>>,
}

struct ClientSlot {
    name: String,
    ports: BTreeMap<u8, PortSlot>,
    inbox: VecDeque<SeqEvent>,
    echo_only: bool,
    pool_used: usize,
    /// None for clients that only host sink ports.
    doorbell: Option<Sender<()>>,
}

impl ClientSlot {
    fn new(name: String, doorbell: Option<Sender<()>>) -> Self {
        Self {
            name,
            ports: BTreeMap::new(),
            inbox: VecDeque::new(),
            echo_only: false,
            pool_used: 0,
            doorbell,
        }
    }

    fn ring(&self) {
        if let Some(doorbell) = &self.doorbell {
            let _ = doorbell.try_send(());
        }
    }
}

struct KernelState {
    running: bool,
    pool_size: usize,
    clients: BTreeMap<ClientId, ClientSlot>,
    queues: BTreeMap<u8, QueueSlot>,
    next_seq: u64,
}

impl KernelState {
    fn alloc_client_id(&self) -> Result<ClientId, TransportError> {
        (FIRST_USER_CLIENT..Address::SUBSCRIBERS.client)
            .find(|id| !self.clients.contains_key(id))
            .ok_or_else(|| TransportError::Backend("no free client ids".to_string()))
    }

    fn client(&self, id: ClientId) -> Result<&ClientSlot, TransportError> {
        self.clients.get(&id).ok_or(TransportError::NoSuchClient(id))
    }

    fn client_mut(&mut self, id: ClientId) -> Result<&mut ClientSlot, TransportError> {
        self.clients.get_mut(&id).ok_or(TransportError::NoSuchClient(id))
    }

    fn queue_mut(&mut self, queue: QueueId) -> Result<&mut QueueSlot, TransportError> {
        self.queues
            .get_mut(&queue.0)
            .ok_or(TransportError::NoSuchQueue(queue))
    }

    fn release_pool(&mut self, owner: ClientId) {
        if let Some(client) = self.clients.get_mut(&owner) {
            client.pool_used = client.pool_used.saturating_sub(1);
            client.ring();
        }
    }

    fn schedule(&mut self, queue: QueueId, tick: u32, owner: ClientId, event: SeqEvent) {
        let seq = self.next_seq;
        self.next_seq += 1;
        if let Some(slot) = self.queues.get_mut(&queue.0) {
            slot.pending.push(Reverse(Pending {
                tick: tick as u64,
                seq,
                owner,
                event,
            }));
            if let Some(client) = self.clients.get_mut(&owner) {
                client.pool_used += 1;
            }
        }
    }

    /// Delivers an event to its destination now.
    fn route(&mut self, event: &SeqEvent, now: Instant) -> Result<(), TransportError> {
        if let EventKind::QueueControl { queue, control } = event.kind {
            self.queue_mut(queue)?.clock.apply(control, now);
            return Ok(());
        }

        if event.dest.is_subscribers() {
            let subscribers = self
                .clients
                .get(&event.source.client)
                .and_then(|c| c.ports.get(&event.source.port))
                .map(|p| p.subscribers.clone())
                .unwrap_or_default();
            for addr in subscribers {
                if let Err(e) = self.deliver_to(addr, event) {
                    tracing::debug!("Dropping event for subscriber {}: {}", addr, e);
                }
            }
            return Ok(());
        }

        self.deliver_to(event.dest, event)
    }

    fn deliver_to(&mut self, addr: Address, event: &SeqEvent) -> Result<(), TransportError> {
        let client = self
            .clients
            .get_mut(&addr.client)
            .ok_or(TransportError::NoSuchPort(addr))?;
        let port = client
            .ports
            .get_mut(&addr.port)
            .ok_or(TransportError::NoSuchPort(addr))?;

        if let Some(sink) = port.sink.as_mut() {
            sink.deliver(event);
            return Ok(());
        }
        if client.doorbell.is_none() || (client.echo_only && event.kind != EventKind::Echo) {
            return Ok(());
        }
        client.inbox.push_back(event.clone());
        client.ring();
        Ok(())
    }

    /// Releases every event whose queue has reached its tick.
    ///
    /// Returns true if anything was dispatched.
    fn dispatch_due(&mut self, now: Instant) -> bool {
        let mut dispatched = false;
        loop {
            let due = self.queues.iter_mut().find_map(|(&id, slot)| {
                let head = slot.pending.peek()?;
                if slot.clock.running && head.0.tick <= slot.clock.tick_at(now) {
                    slot.pending.pop().map(|p| (id, p.0))
                } else {
                    None
                }
            });
            let Some((queue, pending)) = due else {
                break;
            };

            dispatched = true;
            self.release_pool(pending.owner);
            if let Err(e) = self.route(&pending.event, now) {
                tracing::debug!("Dropping event scheduled on queue {}: {}", queue, e);
            }
        }
        dispatched
    }

    fn next_deadline(&self) -> Option<Instant> {
        self.queues
            .values()
            .filter_map(|slot| {
                let head = slot.pending.peek()?;
                slot.clock.deadline(head.0.tick)
            })
            .min()
    }

    /// Removes a queue, returning its pending events to their owners' pools.
    fn remove_queue(&mut self, queue: u8) {
        if let Some(slot) = self.queues.remove(&queue) {
            for pending in slot.pending {
                self.release_pool(pending.0.owner);
            }
        }
    }

    fn remove_client(&mut self, id: ClientId) {
        let owned: Vec<u8> = self
            .queues
            .iter()
            .filter(|(_, q)| q.owner == id)
            .map(|(&q, _)| q)
            .collect();
        for queue in owned {
            self.remove_queue(queue);
        }
        for slot in self.queues.values_mut() {
            slot.pending.retain(|p| p.0.owner != id);
        }
        self.clients.remove(&id);
        for client in self.clients.values_mut() {
            for port in client.ports.values_mut() {
                port.subscribers.retain(|addr| addr.client != id);
            }
        }
    }
}

struct Kernel {
    state: Mutex<KernelState>,
    changed: Condvar,
}

impl Kernel {
    fn lock(&self) -> Result<MutexGuard<'_, KernelState>, TransportError> {
        let state = self
            .state
            .lock()
            .map_err(|_| TransportError::Backend("sequencer state poisoned".to_string()))?;
        if !state.running {
            return Err(TransportError::Closed);
        }
        Ok(state)
    }
}

/// Dispatcher thread body: sleep until the next deadline, release due events.
fn dispatch_loop(kernel: Arc<Kernel>) {
    let Ok(mut state) = kernel.state.lock() else {
        return;
    };
    while state.running {
        if state.dispatch_due(Instant::now()) {
            kernel.changed.notify_all();
        }
        state = match state.next_deadline() {
            Some(at) => {
                let wait = at.saturating_duration_since(Instant::now());
                match kernel.changed.wait_timeout(state, wait) {
                    Ok((state, _)) => state,
                    Err(_) => return,
                }
            }
            None => match kernel.changed.wait(state) {
                Ok(state) => state,
                Err(_) => return,
            },
        };
    }
    tracing::debug!("Sequencer dispatcher exits");
}

/// The in-process sequencer.
///
/// Dropping it stops the dispatcher; clients that are still open report
/// [`TransportError::Closed`] from then on.
pub struct SoftSequencer {
    kernel: Arc<Kernel>,
    dispatcher: Option<JoinHandle<()>>,
}

impl SoftSequencer {
    /// Creates a sequencer with the default output pool size.
    pub fn new() -> Result<Self, TransportError> {
        Self::with_pool_size(DEFAULT_POOL_SIZE)
    }

    /// Creates a sequencer whose clients may each hold `pool_size`
    /// undelivered scheduled events.
    pub fn with_pool_size(pool_size: usize) -> Result<Self, TransportError> {
        let kernel = Arc::new(Kernel {
            state: Mutex::new(KernelState {
                running: true,
                pool_size: pool_size.max(1),
                clients: BTreeMap::new(),
                queues: BTreeMap::new(),
                next_seq: 0,
            }),
            changed: Condvar::new(),
        });

        let thread_kernel = Arc::clone(&kernel);
        let dispatcher = thread::Builder::new()
            .name("soft-seq-dispatch".to_string())
            .spawn(move || dispatch_loop(thread_kernel))
            .map_err(|e| TransportError::Backend(format!("failed to start dispatcher: {}", e)))?;

        Ok(Self {
            kernel,
            dispatcher: Some(dispatcher),
        })
    }

    /// Opens a new client connection.
    pub fn open_client(&self) -> Result<SoftClient, TransportError> {
        let mut state = self.kernel.lock()?;
        let id = state.alloc_client_id()?;
        let (tx, rx) = bounded(1);
        state
            .clients
            .insert(id, ClientSlot::new(format!("Client-{}", id), Some(tx)));
        tracing::debug!("Opened sequencer client {}", id);

        Ok(SoftClient {
            kernel: Arc::clone(&self.kernel),
            id,
            doorbell: rx,
            nonblocking: false,
            closed: false,
        })
    }

    /// Returns true if a client can connect and create a port.
    pub fn detect(&self) -> bool {
        self.open_client().map_or(false, super::detect)
    }

    /// Registers a destination port on a new client and returns its address.
    ///
    /// # Arguments
    ///
    /// * `client_name` - Name of the hosting client, used for address lookup
    /// * `port_name` - Name of the port
    /// * `caps` - Port capabilities; include WRITE and SUBS_WRITE to accept connections
    /// * `kind` - Port type flags used by auto-discovery
    /// * `sink` - Receiver of every event delivered to the port
    pub fn add_sink_port(
        &self,
        client_name: &str,
        port_name: &str,
        caps: PortCaps,
        kind: PortType,
        sink: impl MidiSink + 'static,
    ) -> Result<Address, TransportError> {
        let mut state = self.kernel.lock()?;
        let id = state.alloc_client_id()?;
        let mut client = ClientSlot::new(client_name.to_string(), None);
        client.ports.insert(
            0,
            PortSlot {
                name: port_name.to_string(),
                caps,
                kind,
                subscribers: Vec::new(),
                sink: Some(Box::new(sink)),
            },
        );
        state.clients.insert(id, client);
        Ok(Address::new(id, 0))
    }

    /// Removes a client and everything it owns.
    pub fn remove_client(&self, id: ClientId) -> Result<(), TransportError> {
        let mut state = self.kernel.lock()?;
        state.client(id)?;
        state.remove_client(id);
        self.kernel.changed.notify_all();
        Ok(())
    }
}

impl Drop for SoftSequencer {
    fn drop(&mut self) {
        if let Ok(mut state) = self.kernel.state.lock() {
            state.running = false;
            state.queues.clear();
            state.clients.clear();
        }
        self.kernel.changed.notify_all();
        if let Some(handle) = self.dispatcher.take() {
            let _ = handle.join();
        }
    }
}

/// One client connection to a [`SoftSequencer`].
pub struct SoftClient {
    kernel: Arc<Kernel>,
    id: ClientId,
    doorbell: Receiver<()>,
    nonblocking: bool,
    closed: bool,
}

impl SoftClient {
    fn lock(&self) -> Result<MutexGuard<'_, KernelState>, TransportError> {
        if self.closed {
            return Err(TransportError::Closed);
        }
        let state = self.kernel.lock()?;
        if !state.clients.contains_key(&self.id) {
            return Err(TransportError::Closed);
        }
        Ok(state)
    }

    fn stamped(&self, event: &SeqEvent) -> SeqEvent {
        let mut event = event.clone();
        event.source.client = self.id;
        event
    }
}

impl Transport for SoftClient {
    fn client_id(&self) -> ClientId {
        self.id
    }

    fn set_client_name(&mut self, name: &str) -> Result<(), TransportError> {
        let mut state = self.lock()?;
        state.client_mut(self.id)?.name = name.to_string();
        Ok(())
    }

    fn create_port(
        &mut self,
        name: &str,
        caps: PortCaps,
        kind: PortType,
    ) -> Result<PortId, TransportError> {
        let mut state = self.lock()?;
        let client = state.client_mut(self.id)?;
        let port = (0..Address::PORT_UNKNOWN)
            .find(|p| !client.ports.contains_key(p))
            .ok_or_else(|| TransportError::Backend("no free port ids".to_string()))?;
        client.ports.insert(
            port,
            PortSlot {
                name: name.to_string(),
                caps,
                kind,
                subscribers: Vec::new(),
                sink: None,
            },
        );
        Ok(PortId(port))
    }

    fn delete_port(&mut self, port: PortId) -> Result<(), TransportError> {
        let id = self.id;
        let mut state = self.lock()?;
        state
            .client_mut(id)?
            .ports
            .remove(&port.0)
            .ok_or(TransportError::NoSuchPort(Address::new(id, port.0)))?;
        for client in state.clients.values_mut() {
            for slot in client.ports.values_mut() {
                slot.subscribers
                    .retain(|addr| *addr != Address::new(id, port.0));
            }
        }
        Ok(())
    }

    fn set_echo_filter(&mut self) -> Result<(), TransportError> {
        let mut state = self.lock()?;
        state.client_mut(self.id)?.echo_only = true;
        Ok(())
    }

    fn ports(&self) -> Result<Vec<PortInfo>, TransportError> {
        let state = self.lock()?;
        Ok(state
            .clients
            .iter()
            .flat_map(|(&id, client)| {
                client.ports.iter().map(move |(&port, slot)| PortInfo {
                    addr: Address::new(id, port),
                    client_name: client.name.clone(),
                    name: slot.name.clone(),
                    caps: slot.caps,
                    kind: slot.kind,
                })
            })
            .collect())
    }

    fn connect_to(&mut self, port: PortId, dest: Address) -> Result<(), TransportError> {
        let id = self.id;
        let mut state = self.lock()?;
        let target = state
            .clients
            .get(&dest.client)
            .and_then(|c| c.ports.get(&dest.port))
            .ok_or(TransportError::NoSuchPort(dest))?;
        if !target.caps.contains(PortCaps::WRITE | PortCaps::SUBS_WRITE) {
            return Err(TransportError::PermissionDenied(dest));
        }
        let slot = state
            .client_mut(id)?
            .ports
            .get_mut(&port.0)
            .ok_or(TransportError::NoSuchPort(Address::new(id, port.0)))?;
        if !slot.subscribers.contains(&dest) {
            slot.subscribers.push(dest);
        }
        Ok(())
    }

    fn alloc_queue(&mut self, name: &str) -> Result<QueueId, TransportError> {
        let mut state = self.lock()?;
        let queue = (0..=u8::MAX)
            .find(|q| !state.queues.contains_key(q))
            .ok_or_else(|| TransportError::Backend("no free queues".to_string()))?;
        state.queues.insert(
            queue,
            QueueSlot {
                name: name.to_string(),
                owner: self.id,
                clock: QueueClock::new(Instant::now()),
                pending: BinaryHeap::new(),
            },
        );
        tracing::debug!("Allocated queue {} '{}'", queue, name);
        Ok(QueueId(queue))
    }

    fn start_queue(&mut self, queue: QueueId) -> Result<(), TransportError> {
        let mut state = self.lock()?;
        state
            .queue_mut(queue)?
            .clock
            .apply(QueueControl::Start, Instant::now());
        self.kernel.changed.notify_all();
        Ok(())
    }

    fn stop_queue(&mut self, queue: QueueId) -> Result<(), TransportError> {
        let mut state = self.lock()?;
        state
            .queue_mut(queue)?
            .clock
            .apply(QueueControl::Stop, Instant::now());
        self.kernel.changed.notify_all();
        Ok(())
    }

    fn free_queue(&mut self, queue: QueueId) -> Result<(), TransportError> {
        let mut state = self.lock()?;
        let slot = state.queue_mut(queue)?;
        tracing::debug!("Freeing queue {} '{}'", queue.0, slot.name);
        state.remove_queue(queue.0);
        self.kernel.changed.notify_all();
        Ok(())
    }

    fn queue_tempo(&self, queue: QueueId) -> Result<QueueTempo, TransportError> {
        let mut state = self.lock()?;
        let clock = &state.queue_mut(queue)?.clock;
        Ok(QueueTempo {
            tempo: clock.tempo,
            ppq: clock.ppq,
        })
    }

    fn set_queue_tempo(
        &mut self,
        queue: QueueId,
        tempo: QueueTempo,
    ) -> Result<(), TransportError> {
        let mut state = self.lock()?;
        let now = Instant::now();
        let clock = &mut state.queue_mut(queue)?.clock;
        clock.apply(QueueControl::SetTempo(tempo.tempo), now);
        clock.set_resolution(tempo.ppq, now);
        self.kernel.changed.notify_all();
        Ok(())
    }

    fn set_nonblocking(&mut self, nonblocking: bool) -> Result<(), TransportError> {
        drop(self.lock()?);
        self.nonblocking = nonblocking;
        Ok(())
    }

    fn readiness(&self) -> Readiness {
        let Ok(state) = self.lock() else {
            return Readiness::default();
        };
        match state.clients.get(&self.id) {
            Some(client) => Readiness {
                input: !client.inbox.is_empty(),
                output: client.pool_used < state.pool_size,
            },
            None => Readiness::default(),
        }
    }

    fn doorbell(&self) -> Receiver<()> {
        self.doorbell.clone()
    }

    fn event_output(&mut self, event: &SeqEvent) -> Result<(), TransportError> {
        let event = self.stamped(event);
        let Schedule::Tick { queue, tick } = event.schedule else {
            let mut state = self.lock()?;
            return state.route(&event, Instant::now());
        };

        let mut state = self.lock()?;
        loop {
            state.queue_mut(queue)?;
            if state.client(self.id)?.pool_used < state.pool_size {
                break;
            }
            if self.nonblocking {
                return Err(TransportError::WouldBlock);
            }
            state = self
                .kernel
                .changed
                .wait(state)
                .map_err(|_| TransportError::Backend("sequencer state poisoned".to_string()))?;
            if !state.running || !state.clients.contains_key(&self.id) {
                return Err(TransportError::Closed);
            }
        }
        state.schedule(queue, tick, self.id, event);
        self.kernel.changed.notify_all();
        Ok(())
    }

    fn event_output_direct(&mut self, event: &SeqEvent) -> Result<(), TransportError> {
        let event = self.stamped(event).direct();
        let mut state = self.lock()?;
        let result = state.route(&event, Instant::now());
        self.kernel.changed.notify_all();
        result
    }

    fn drain_output(&mut self) -> Result<(), TransportError> {
        // Output goes straight to the kernel pool; nothing is buffered here.
        self.lock().map(|_| ())
    }

    fn drop_output(&mut self) -> Result<(), TransportError> {
        let id = self.id;
        let mut state = self.lock()?;
        for slot in state.queues.values_mut() {
            slot.pending.retain(|p| p.0.owner != id);
        }
        state.client_mut(id)?.pool_used = 0;
        self.kernel.changed.notify_all();
        Ok(())
    }

    fn event_input(&mut self) -> Result<Option<SeqEvent>, TransportError> {
        let mut state = self.lock()?;
        Ok(state.client_mut(self.id)?.inbox.pop_front())
    }

    fn close(&mut self) -> Result<(), TransportError> {
        let mut state = self.lock()?;
        state.remove_client(self.id);
        drop(state);
        self.closed = true;
        self.kernel.changed.notify_all();
        tracing::debug!("Closed sequencer client {}", self.id);
        Ok(())
    }
}

impl Drop for SoftClient {
    fn drop(&mut self) {
        if !self.closed {
            let _ = self.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const WAIT: Duration = Duration::from_secs(2);

    /// Fast queue tempo: 1000us per quarter at 10 ppq is 100us per tick.
    const FAST: QueueTempo = QueueTempo {
        tempo: 1_000,
        ppq: 10,
    };

    fn recorder() -> (Arc<Mutex<Vec<SeqEvent>>>, impl MidiSink + 'static) {
        let log = Arc::new(Mutex::new(Vec::new()));
        let sink_log = Arc::clone(&log);
        let sink = move |event: &SeqEvent| sink_log.lock().unwrap().push(event.clone());
        (log, sink)
    }

    fn wait_for(mut done: impl FnMut() -> bool) -> bool {
        let start = Instant::now();
        while start.elapsed() < WAIT {
            if done() {
                return true;
            }
            thread::sleep(Duration::from_millis(1));
        }
        done()
    }

    fn note_on(note: u8) -> EventKind {
        EventKind::NoteOn {
            channel: 0,
            note,
            velocity: 100,
        }
    }

    #[test]
    fn test_clock_tick_math() {
        let t0 = Instant::now();
        let mut clock = QueueClock::new(t0);
        assert_eq!(clock.tick_at(t0 + Duration::from_secs(1)), 0);

        clock.apply(QueueControl::Start, t0);
        clock.set_resolution(480, t0);
        // 500000us per quarter at 480 ppq: one quarter after half a second
        assert_eq!(clock.tick_at(t0 + Duration::from_millis(500)), 480);

        clock.apply(QueueControl::Stop, t0 + Duration::from_millis(500));
        assert_eq!(clock.tick_at(t0 + Duration::from_secs(5)), 480);
        assert_eq!(clock.deadline(960), None);

        let t1 = t0 + Duration::from_secs(5);
        clock.apply(QueueControl::Continue, t1);
        assert_eq!(clock.tick_at(t1 + Duration::from_millis(500)), 960);
        assert_eq!(clock.deadline(960), Some(t1 + Duration::from_millis(500)));

        clock.apply(QueueControl::SetPositionTick(0), t1);
        assert_eq!(clock.tick_at(t1), 0);
    }

    #[test]
    fn test_clock_tempo_change_keeps_position() {
        let t0 = Instant::now();
        let mut clock = QueueClock::new(t0);
        clock.set_resolution(100, t0);
        clock.apply(QueueControl::Start, t0);
        clock.apply(QueueControl::SetTempo(1_000_000), t0 + Duration::from_millis(500));
        // 100 ticks at 0.5s per quarter, then 100 more ticks per second
        assert_eq!(clock.tick_at(t0 + Duration::from_millis(500)), 100);
        assert_eq!(clock.tick_at(t0 + Duration::from_millis(1500)), 200);
    }

    #[test]
    fn test_scheduled_events_reach_subscribers_in_order() {
        let seq = SoftSequencer::new().unwrap();
        let (log, sink) = recorder();
        let synth = seq
            .add_sink_port(
                "Synth",
                "Synth Port",
                PortCaps::WRITE | PortCaps::SUBS_WRITE,
                PortType::MIDI_GENERIC | PortType::SYNTHESIZER,
                sink,
            )
            .unwrap();

        let mut client = seq.open_client().unwrap();
        let port = client
            .create_port("out", PortCaps::READ, PortType::APPLICATION)
            .unwrap();
        client.connect_to(port, synth).unwrap();
        let queue = client.alloc_queue("test").unwrap();
        client.set_queue_tempo(queue, FAST).unwrap();

        // Submit out of order; delivery follows the ticks
        for (note, tick) in [(64, 20), (60, 0), (62, 10)] {
            let event = SeqEvent::new(note_on(note))
                .from_port(port)
                .at_tick(queue, tick);
            client.event_output(&event).unwrap();
        }
        client.start_queue(queue).unwrap();

        assert!(wait_for(|| log.lock().unwrap().len() == 3));
        let notes: Vec<EventKind> = log.lock().unwrap().iter().map(|e| e.kind.clone()).collect();
        assert_eq!(notes, vec![note_on(60), note_on(62), note_on(64)]);
        assert_eq!(log.lock().unwrap()[0].source, Address::new(client.client_id(), port.0));
    }

    #[test]
    fn test_echo_returns_to_sender() {
        let seq = SoftSequencer::new().unwrap();
        let mut client = seq.open_client().unwrap();
        let port = client
            .create_port("out", PortCaps::READ | PortCaps::WRITE, PortType::APPLICATION)
            .unwrap();
        client.set_echo_filter().unwrap();
        let queue = client.alloc_queue("test").unwrap();
        client.set_queue_tempo(queue, FAST).unwrap();
        client.start_queue(queue).unwrap();

        let me = Address::new(client.client_id(), port.0);
        // Filtered: not an echo
        client
            .event_output(&SeqEvent::new(note_on(60)).from_port(port).to(me).at_tick(queue, 1))
            .unwrap();
        client
            .event_output(&SeqEvent::new(EventKind::Echo).from_port(port).to(me).at_tick(queue, 5))
            .unwrap();

        let doorbell = client.doorbell();
        assert!(doorbell.recv_timeout(WAIT).is_ok());
        assert!(wait_for(|| client.readiness().input));
        let echo = client.event_input().unwrap().unwrap();
        assert_eq!(echo.kind, EventKind::Echo);
        assert_eq!(echo.source, me);
        assert_eq!(client.event_input().unwrap(), None);
    }

    #[test]
    fn test_full_pool_would_block() {
        let seq = SoftSequencer::with_pool_size(2).unwrap();
        let mut client = seq.open_client().unwrap();
        let port = client
            .create_port("out", PortCaps::READ, PortType::APPLICATION)
            .unwrap();
        let queue = client.alloc_queue("test").unwrap();
        client.set_nonblocking(true).unwrap();

        // The queue is not started, so nothing drains
        let event = SeqEvent::new(note_on(60)).from_port(port).at_tick(queue, 0);
        client.event_output(&event).unwrap();
        client.event_output(&event).unwrap();
        assert!(!client.readiness().output);
        assert_eq!(client.event_output(&event), Err(TransportError::WouldBlock));

        client.drop_output().unwrap();
        assert!(client.readiness().output);
        assert!(client.event_output(&event).is_ok());
    }

    #[test]
    fn test_stopped_queue_holds_events() {
        let seq = SoftSequencer::new().unwrap();
        let (log, sink) = recorder();
        let synth = seq
            .add_sink_port(
                "Synth",
                "Synth Port",
                PortCaps::WRITE | PortCaps::SUBS_WRITE,
                PortType::MIDI_GENERIC,
                sink,
            )
            .unwrap();
        let mut client = seq.open_client().unwrap();
        let port = client
            .create_port("out", PortCaps::READ, PortType::APPLICATION)
            .unwrap();
        client.connect_to(port, synth).unwrap();
        let queue = client.alloc_queue("test").unwrap();
        client.set_queue_tempo(queue, FAST).unwrap();
        client.start_queue(queue).unwrap();
        client
            .event_output_direct(&SeqEvent::queue_control(queue, QueueControl::Stop))
            .unwrap();

        client
            .event_output(&SeqEvent::new(note_on(60)).from_port(port).at_tick(queue, 50))
            .unwrap();
        thread::sleep(Duration::from_millis(30));
        assert!(log.lock().unwrap().is_empty());

        client
            .event_output_direct(&SeqEvent::queue_control(queue, QueueControl::Continue))
            .unwrap();
        assert!(wait_for(|| log.lock().unwrap().len() == 1));
    }

    #[test]
    fn test_scheduled_tempo_change() {
        let seq = SoftSequencer::new().unwrap();
        let mut client = seq.open_client().unwrap();
        let queue = client.alloc_queue("test").unwrap();
        client.set_queue_tempo(queue, FAST).unwrap();
        client.start_queue(queue).unwrap();
        client
            .event_output(&SeqEvent::queue_control(queue, QueueControl::SetTempo(250_000)).at_tick(queue, 0))
            .unwrap();

        assert!(wait_for(|| client.queue_tempo(queue).unwrap().tempo == 250_000));
        assert_eq!(client.queue_tempo(queue).unwrap().ppq, 10);
    }

    #[test]
    fn test_connect_requires_writable_port() {
        let seq = SoftSequencer::new().unwrap();
        let readonly = seq
            .add_sink_port("Monitor", "Monitor", PortCaps::READ, PortType::MIDI_GENERIC, |_: &SeqEvent| {})
            .unwrap();
        let mut client = seq.open_client().unwrap();
        let port = client
            .create_port("out", PortCaps::READ, PortType::APPLICATION)
            .unwrap();
        assert_eq!(
            client.connect_to(port, readonly),
            Err(TransportError::PermissionDenied(readonly))
        );
        assert!(matches!(
            client.connect_to(port, Address::new(200, 0)),
            Err(TransportError::NoSuchPort(_))
        ));
    }

    #[test]
    fn test_port_enumeration_and_name_lookup() {
        let seq = SoftSequencer::new().unwrap();
        let synth = seq
            .add_sink_port(
                "FLUID Synth",
                "Synth input port",
                PortCaps::WRITE | PortCaps::SUBS_WRITE,
                PortType::MIDI_GENERIC | PortType::SYNTHESIZER,
                |_: &SeqEvent| {},
            )
            .unwrap();
        let mut client = seq.open_client().unwrap();
        client.set_client_name("Player").unwrap();
        client
            .create_port("Player", PortCaps::READ, PortType::APPLICATION)
            .unwrap();

        let ports = client.ports().unwrap();
        assert_eq!(ports.len(), 2);
        let info = ports.iter().find(|p| p.addr == synth).unwrap();
        assert_eq!(info.client_name, "FLUID Synth");
        assert!(info.kind.contains(PortType::SYNTHESIZER));
        assert_eq!(client.parse_address("FLUID").unwrap(), synth);
    }

    #[test]
    fn test_closed_client_reports_closed() {
        let seq = SoftSequencer::new().unwrap();
        let mut client = seq.open_client().unwrap();
        let doorbell = client.doorbell();
        client.close().unwrap();
        assert_eq!(client.alloc_queue("late"), Err(TransportError::Closed));
        assert!(doorbell.recv_timeout(Duration::from_millis(50)).is_err());
        assert_eq!(client.readiness(), Readiness::default());
    }

    #[test]
    fn test_detect_leaves_no_client_behind() {
        let seq = SoftSequencer::new().unwrap();
        assert!(seq.detect());
        let client = seq.open_client().unwrap();
        assert!(client.ports().unwrap().is_empty());
    }

    #[test]
    fn test_remove_client_drops_ports_and_subscriptions() {
        let seq = SoftSequencer::new().unwrap();
        let (log, sink) = recorder();
        let monitor = seq
            .add_sink_port(
                "Monitor",
                "Monitor",
                PortCaps::WRITE | PortCaps::SUBS_WRITE,
                PortType::MIDI_GENERIC,
                sink,
            )
            .unwrap();
        let mut client = seq.open_client().unwrap();
        let port = client
            .create_port("out", PortCaps::READ | PortCaps::SUBS_READ, PortType::APPLICATION)
            .unwrap();
        client.connect_to(port, monitor).unwrap();

        seq.remove_client(monitor.client).unwrap();
        assert!(client.ports().unwrap().iter().all(|p| p.addr != monitor));
        assert_eq!(
            seq.remove_client(monitor.client),
            Err(TransportError::NoSuchClient(monitor.client))
        );

        let event = SeqEvent::new(note_on(60)).from_port(port).to(Address::SUBSCRIBERS);
        client.event_output_direct(&event).unwrap();
        assert!(log.lock().unwrap().is_empty());
    }

    #[test]
    fn test_dropping_sequencer_closes_clients() {
        let seq = SoftSequencer::new().unwrap();
        let mut client = seq.open_client().unwrap();
        drop(seq);
        assert_eq!(client.alloc_queue("late"), Err(TransportError::Closed));
    }
}
