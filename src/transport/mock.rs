//! Deterministic transport for tests.
//!
//! Records every call in a shared log, never delivers anything by time,
//! and releases echo events only when output is drained.

use super::{
    Address, ClientId, EventKind, PortCaps, PortId, PortInfo, PortType, QueueId, QueueTempo,
    Readiness, Schedule, SeqEvent, Transport, TransportError,
};
use crossbeam_channel::{bounded, Receiver, Sender};
use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

pub(crate) const MOCK_CLIENT: ClientId = 128;

/// One observed call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Record {
    Scheduled(SeqEvent),
    Direct(SeqEvent),
    QueueAllocated(QueueId),
    QueueStarted(QueueId),
    QueueStopped(QueueId),
    QueueFreed(QueueId),
    TempoSet(QueueId, QueueTempo),
    Nonblocking(bool),
    Drained,
    Dropped,
    Connected(PortId, Address),
    PortDeleted(PortId),
    Closed,
}

pub(crate) type MockLog = Arc<Mutex<Vec<Record>>>;

pub(crate) struct MockTransport {
    name: String,
    local_ports: BTreeMap<u8, PortInfo>,
    remote_ports: Vec<PortInfo>,
    refused: Vec<Address>,
    log: MockLog,
    inbox: VecDeque<SeqEvent>,
    held_echoes: Vec<SeqEvent>,
    echo_hold: Arc<AtomicBool>,
    queues: BTreeMap<u8, QueueTempo>,
    nonblocking: bool,
    back_pressure_every: Option<usize>,
    outputs_seen: usize,
    fail_alloc_queue: bool,
    doorbell_tx: Sender<()>,
    doorbell_rx: Receiver<()>,
    closed: bool,
}

impl MockTransport {
    pub(crate) fn new() -> Self {
        let (doorbell_tx, doorbell_rx) = bounded(1);
        Self {
            name: String::new(),
            local_ports: BTreeMap::new(),
            remote_ports: Vec::new(),
            refused: Vec::new(),
            log: Arc::new(Mutex::new(Vec::new())),
            inbox: VecDeque::new(),
            held_echoes: Vec::new(),
            echo_hold: Arc::new(AtomicBool::new(false)),
            queues: BTreeMap::new(),
            nonblocking: false,
            back_pressure_every: None,
            outputs_seen: 0,
            fail_alloc_queue: false,
            doorbell_tx,
            doorbell_rx,
            closed: false,
        }
    }

    /// Shared handle to the call log.
    pub(crate) fn log(&self) -> MockLog {
        Arc::clone(&self.log)
    }

    /// Adds port 0 of a remote client.
    pub(crate) fn add_remote_port(
        &mut self,
        client: ClientId,
        name: &str,
        caps: PortCaps,
        kind: PortType,
    ) -> Address {
        let addr = Address::new(client, 0);
        self.remote_ports.push(PortInfo {
            addr,
            client_name: name.to_string(),
            name: format!("{} port", name),
            caps,
            kind,
        });
        addr
    }

    /// Makes connections to `addr` fail.
    pub(crate) fn refuse(&mut self, addr: Address) {
        self.refused.push(addr);
    }

    /// Every `n`-th scheduled output in non-blocking mode reports `WouldBlock`.
    pub(crate) fn back_pressure_every(&mut self, n: usize) {
        self.back_pressure_every = Some(n.max(2));
    }

    /// Keeps echoes back on drain until the returned flag is cleared.
    ///
    /// A session then parks after its last event and only wakes for
    /// control commands.
    pub(crate) fn hold_echoes(&self) -> Arc<AtomicBool> {
        self.echo_hold.store(true, Ordering::SeqCst);
        Arc::clone(&self.echo_hold)
    }

    pub(crate) fn fail_alloc_queue(&mut self) {
        self.fail_alloc_queue = true;
    }

    fn record(&self, record: Record) {
        if let Ok(mut log) = self.log.lock() {
            log.push(record);
        }
    }

    fn check_open(&self) -> Result<(), TransportError> {
        if self.closed {
            Err(TransportError::Closed)
        } else {
            Ok(())
        }
    }

    fn stamped(&self, event: &SeqEvent) -> SeqEvent {
        let mut event = event.clone();
        event.source.client = MOCK_CLIENT;
        event
    }
}

impl Transport for MockTransport {
    fn client_id(&self) -> ClientId {
        MOCK_CLIENT
    }

    fn set_client_name(&mut self, name: &str) -> Result<(), TransportError> {
        self.check_open()?;
        self.name = name.to_string();
        Ok(())
    }

    fn create_port(
        &mut self,
        name: &str,
        caps: PortCaps,
        kind: PortType,
    ) -> Result<PortId, TransportError> {
        self.check_open()?;
        let port = self.local_ports.len() as u8;
        self.local_ports.insert(
            port,
            PortInfo {
                addr: Address::new(MOCK_CLIENT, port),
                client_name: self.name.clone(),
                name: name.to_string(),
                caps,
                kind,
            },
        );
        Ok(PortId(port))
    }

    fn delete_port(&mut self, port: PortId) -> Result<(), TransportError> {
        self.check_open()?;
        self.local_ports.remove(&port.0);
        self.record(Record::PortDeleted(port));
        Ok(())
    }

    fn set_echo_filter(&mut self) -> Result<(), TransportError> {
        self.check_open()
    }

    fn ports(&self) -> Result<Vec<PortInfo>, TransportError> {
        self.check_open()?;
        Ok(self
            .local_ports
            .values()
            .chain(self.remote_ports.iter())
            .cloned()
            .collect())
    }

    fn connect_to(&mut self, port: PortId, dest: Address) -> Result<(), TransportError> {
        self.check_open()?;
        if self.refused.contains(&dest) {
            return Err(TransportError::PermissionDenied(dest));
        }
        if !self.remote_ports.iter().any(|p| p.addr == dest) {
            return Err(TransportError::NoSuchPort(dest));
        }
        self.record(Record::Connected(port, dest));
        Ok(())
    }

    fn alloc_queue(&mut self, _name: &str) -> Result<QueueId, TransportError> {
        self.check_open()?;
        if self.fail_alloc_queue {
            return Err(TransportError::Backend("no queues".to_string()));
        }
        let queue = QueueId(self.queues.len() as u8);
        self.queues.insert(
            queue.0,
            QueueTempo {
                tempo: 500_000,
                ppq: 96,
            },
        );
        self.record(Record::QueueAllocated(queue));
        Ok(queue)
    }

    fn start_queue(&mut self, queue: QueueId) -> Result<(), TransportError> {
        self.check_open()?;
        self.record(Record::QueueStarted(queue));
        Ok(())
    }

    fn stop_queue(&mut self, queue: QueueId) -> Result<(), TransportError> {
        self.check_open()?;
        self.record(Record::QueueStopped(queue));
        Ok(())
    }

    fn free_queue(&mut self, queue: QueueId) -> Result<(), TransportError> {
        self.check_open()?;
        self.queues.remove(&queue.0);
        self.record(Record::QueueFreed(queue));
        Ok(())
    }

    fn queue_tempo(&self, queue: QueueId) -> Result<QueueTempo, TransportError> {
        self.check_open()?;
        self.queues
            .get(&queue.0)
            .copied()
            .ok_or(TransportError::NoSuchQueue(queue))
    }

    fn set_queue_tempo(
        &mut self,
        queue: QueueId,
        tempo: QueueTempo,
    ) -> Result<(), TransportError> {
        self.check_open()?;
        self.queues.insert(queue.0, tempo);
        self.record(Record::TempoSet(queue, tempo));
        Ok(())
    }

    fn set_nonblocking(&mut self, nonblocking: bool) -> Result<(), TransportError> {
        self.check_open()?;
        self.nonblocking = nonblocking;
        self.record(Record::Nonblocking(nonblocking));
        Ok(())
    }

    fn readiness(&self) -> Readiness {
        if self.closed {
            return Readiness::default();
        }
        Readiness {
            input: !self.inbox.is_empty(),
            output: true,
        }
    }

    fn doorbell(&self) -> Receiver<()> {
        self.doorbell_rx.clone()
    }

    fn event_output(&mut self, event: &SeqEvent) -> Result<(), TransportError> {
        self.check_open()?;
        if event.schedule == Schedule::Direct {
            return self.event_output_direct(event);
        }
        if self.nonblocking {
            self.outputs_seen += 1;
            if let Some(n) = self.back_pressure_every {
                if self.outputs_seen % n == 0 {
                    return Err(TransportError::WouldBlock);
                }
            }
        }
        let event = self.stamped(event);
        if event.kind == EventKind::Echo && event.dest.client == MOCK_CLIENT {
            self.held_echoes.push(event.clone());
        }
        self.record(Record::Scheduled(event));
        Ok(())
    }

    fn event_output_direct(&mut self, event: &SeqEvent) -> Result<(), TransportError> {
        self.check_open()?;
        let event = self.stamped(event).direct();
        self.record(Record::Direct(event));
        Ok(())
    }

    fn drain_output(&mut self) -> Result<(), TransportError> {
        self.check_open()?;
        self.record(Record::Drained);
        if !self.held_echoes.is_empty() && !self.echo_hold.load(Ordering::SeqCst) {
            self.inbox.extend(self.held_echoes.drain(..));
            let _ = self.doorbell_tx.try_send(());
        }
        Ok(())
    }

    fn drop_output(&mut self) -> Result<(), TransportError> {
        self.check_open()?;
        self.held_echoes.clear();
        self.record(Record::Dropped);
        Ok(())
    }

    fn event_input(&mut self) -> Result<Option<SeqEvent>, TransportError> {
        self.check_open()?;
        Ok(self.inbox.pop_front())
    }

    fn close(&mut self) -> Result<(), TransportError> {
        self.check_open()?;
        self.closed = true;
        self.record(Record::Closed);
        Ok(())
    }
}
