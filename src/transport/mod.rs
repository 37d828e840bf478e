//! Timed-event sequencer transport.
//!
//! The player never talks to a MIDI device directly. It schedules events
//! on a transport that owns a tick-accurate timing queue, addressable
//! ports and asynchronous delivery. This module defines that binding:
//! - [`Transport`], the capability set the player requires
//! - Addresses, port flags and queue types shared by every implementation
//! - [`SeqEvent`], the transport-native event
//!
//! [`soft::SoftSequencer`] is the in-process implementation; destination
//! ports are backed by [`sink::MidiSink`] implementations.

pub mod sink;
pub mod soft;
#[cfg(feature = "synth")]
pub mod synth;

#[cfg(test)]
pub(crate) mod mock;

use crossbeam_channel::Receiver;
use std::fmt;
use thiserror::Error;

pub use sink::{LogSink, MidiSink};
pub use soft::{SoftClient, SoftSequencer};

/// Numeric id of a transport client (one open connection).
pub type ClientId = u8;

/// Client id of the system client that owns the timer and announce ports.
pub const SYSTEM_CLIENT: ClientId = 0;

/// A port owned by the local client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PortId(pub u8);

/// A timing queue allocated by the local client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct QueueId(pub u8);

impl fmt::Display for QueueId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "queue {}", self.0)
    }
}

/// A client:port pair addressing any port on the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Address {
    pub client: ClientId,
    pub port: u8,
}

impl Address {
    /// Port number meaning "no particular port".
    pub const PORT_UNKNOWN: u8 = 253;

    /// Broadcast to every subscriber of the source port.
    pub const SUBSCRIBERS: Address = Address {
        client: 254,
        port: Self::PORT_UNKNOWN,
    };

    /// The system timer, target of queue control events.
    pub const SYSTEM_TIMER: Address = Address { client: SYSTEM_CLIENT, port: 0 };

    pub const fn new(client: ClientId, port: u8) -> Self {
        Self { client, port }
    }

    /// Returns true for the subscriber broadcast address.
    pub fn is_subscribers(&self) -> bool {
        self.client == Self::SUBSCRIBERS.client
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.client, self.port)
    }
}

/// Defines a copyable set of bit flags with the usual set operations.
macro_rules! flag_set {
    ($(#[$meta:meta])* $name:ident { $($(#[$fmeta:meta])* $flag:ident = $value:expr,)* }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
        pub struct $name(u32);

        impl $name {
            $($(#[$fmeta])* pub const $flag: Self = Self($value);)*

            pub const fn empty() -> Self {
                Self(0)
            }

            pub const fn from_bits(bits: u32) -> Self {
                Self(bits)
            }

            pub const fn bits(self) -> u32 {
                self.0
            }

            /// Returns true if every flag in `other` is set.
            pub const fn contains(self, other: Self) -> bool {
                self.0 & other.0 == other.0
            }

            /// Returns true if any flag in `other` is set.
            pub const fn intersects(self, other: Self) -> bool {
                self.0 & other.0 != 0
            }
        }

        impl std::ops::BitOr for $name {
            type Output = Self;

            fn bitor(self, rhs: Self) -> Self {
                Self(self.0 | rhs.0)
            }
        }

        impl std::ops::BitOrAssign for $name {
            fn bitor_assign(&mut self, rhs: Self) {
                self.0 |= rhs.0;
            }
        }
    };
}

flag_set!(
    /// What other clients may do with a port.
    PortCaps {
        READ = 1 << 0,
        WRITE = 1 << 1,
        SYNC_READ = 1 << 2,
        SYNC_WRITE = 1 << 3,
        DUPLEX = 1 << 4,
        SUBS_READ = 1 << 5,
        SUBS_WRITE = 1 << 6,
        /// Hidden from automatic routing.
        NO_EXPORT = 1 << 7,
    }
);

flag_set!(
    /// What kind of endpoint a port represents.
    PortType {
        SPECIFIC = 1 << 0,
        MIDI_GENERIC = 1 << 1,
        MIDI_GM = 1 << 2,
        MIDI_GS = 1 << 3,
        MIDI_XG = 1 << 4,
        SYNTH = 1 << 10,
        HARDWARE = 1 << 16,
        SOFTWARE = 1 << 17,
        SYNTHESIZER = 1 << 18,
        PORT = 1 << 19,
        APPLICATION = 1 << 20,
    }
);

/// Description of a port as seen by enumeration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortInfo {
    pub addr: Address,
    pub client_name: String,
    pub name: String,
    pub caps: PortCaps,
    pub kind: PortType,
}

impl PortInfo {
    /// Returns true if other clients may write to and subscribe to this port.
    pub fn is_writable_export(&self) -> bool {
        self.caps.contains(PortCaps::WRITE | PortCaps::SUBS_WRITE)
            && !self.caps.contains(PortCaps::NO_EXPORT)
    }
}

/// Queue tempo and resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueTempo {
    /// Microseconds per quarter note.
    pub tempo: u32,
    /// Ticks per quarter note.
    pub ppq: u16,
}

/// When an event is delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Schedule {
    /// Immediately, bypassing every queue.
    Direct,
    /// When the queue reaches the given tick.
    Tick { queue: QueueId, tick: u32 },
}

/// Operations on a timing queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueControl {
    /// Start from tick 0.
    Start,
    /// Freeze the clock.
    Stop,
    /// Unfreeze the clock where it stopped.
    Continue,
    /// Move the clock to a tick.
    SetPositionTick(u32),
    /// Change the tempo (microseconds per quarter note).
    SetTempo(u32),
}

/// Payload of a transport event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventKind {
    NoteOn { channel: u8, note: u8, velocity: u8 },
    NoteOff { channel: u8, note: u8, velocity: u8 },
    KeyPressure { channel: u8, note: u8, velocity: u8 },
    Controller { channel: u8, param: u8, value: u8 },
    ProgramChange { channel: u8, program: u8 },
    /// Zero-centered bend, -8192..=8191.
    PitchBend { channel: u8, value: i16 },
    /// Complete system exclusive message including F0/F7 framing.
    SysEx(Vec<u8>),
    /// Marker delivered back to its sender.
    Echo,
    QueueControl { queue: QueueId, control: QueueControl },
}

/// An event as the transport sees it: who sent it, where it goes, when.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SeqEvent {
    pub source: Address,
    pub dest: Address,
    pub schedule: Schedule,
    pub kind: EventKind,
}

impl SeqEvent {
    /// Creates a direct event to the subscribers of port 0.
    pub fn new(kind: EventKind) -> Self {
        Self {
            source: Address::new(0, 0),
            dest: Address::SUBSCRIBERS,
            schedule: Schedule::Direct,
            kind,
        }
    }

    /// Sets the sending port; the transport fills in the client.
    pub fn from_port(mut self, port: PortId) -> Self {
        self.source.port = port.0;
        self
    }

    pub fn to(mut self, dest: Address) -> Self {
        self.dest = dest;
        self
    }

    /// Schedules the event on a queue at a tick.
    pub fn at_tick(mut self, queue: QueueId, tick: u32) -> Self {
        self.schedule = Schedule::Tick { queue, tick };
        self
    }

    pub fn direct(mut self) -> Self {
        self.schedule = Schedule::Direct;
        self
    }

    /// Creates a queue control event addressed to the system timer.
    pub fn queue_control(queue: QueueId, control: QueueControl) -> Self {
        Self::new(EventKind::QueueControl { queue, control }).to(Address::SYSTEM_TIMER)
    }
}

/// Level-triggered readiness of a transport connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Readiness {
    /// An input event is waiting.
    pub input: bool,
    /// Output has room for another scheduled event.
    pub output: bool,
}

/// Errors reported by a transport.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// Transient back-pressure; retry later.
    #[error("resource temporarily unavailable, try again")]
    WouldBlock,
    #[error("transport connection is closed")]
    Closed,
    #[error("no such client {0}")]
    NoSuchClient(ClientId),
    #[error("no such port {0}")]
    NoSuchPort(Address),
    #[error("no such {0}")]
    NoSuchQueue(QueueId),
    #[error("port {0} does not accept connections")]
    PermissionDenied(Address),
    #[error("invalid address '{0}'")]
    InvalidAddress(String),
    #[error("transport failure: {0}")]
    Backend(String),
}

/// The capability set the player requires from a sequencer connection.
///
/// One value is one open connection (client). It is moved into the player
/// thread for the duration of a session, so implementations must be `Send`.
pub trait Transport: Send {
    /// Id of this client.
    fn client_id(&self) -> ClientId;

    /// Sets the human-readable client name.
    fn set_client_name(&mut self, name: &str) -> Result<(), TransportError>;

    /// Creates a local port.
    fn create_port(
        &mut self,
        name: &str,
        caps: PortCaps,
        kind: PortType,
    ) -> Result<PortId, TransportError>;

    fn delete_port(&mut self, port: PortId) -> Result<(), TransportError>;

    /// Restricts input to echo events.
    fn set_echo_filter(&mut self) -> Result<(), TransportError>;

    /// Enumerates the ports of every client, this one included.
    fn ports(&self) -> Result<Vec<PortInfo>, TransportError>;

    /// Subscribes `dest` to events sent from a local port.
    fn connect_to(&mut self, port: PortId, dest: Address) -> Result<(), TransportError>;

    fn alloc_queue(&mut self, name: &str) -> Result<QueueId, TransportError>;
    fn start_queue(&mut self, queue: QueueId) -> Result<(), TransportError>;
    fn stop_queue(&mut self, queue: QueueId) -> Result<(), TransportError>;
    fn free_queue(&mut self, queue: QueueId) -> Result<(), TransportError>;
    fn queue_tempo(&self, queue: QueueId) -> Result<QueueTempo, TransportError>;
    fn set_queue_tempo(&mut self, queue: QueueId, tempo: QueueTempo)
        -> Result<(), TransportError>;

    /// Switches between blocking and non-blocking output.
    fn set_nonblocking(&mut self, nonblocking: bool) -> Result<(), TransportError>;

    /// Current readiness. Never blocks.
    fn readiness(&self) -> Readiness;

    /// Signalled whenever [`readiness`](Transport::readiness) may have changed.
    ///
    /// A disconnected doorbell means the transport went away.
    fn doorbell(&self) -> Receiver<()>;

    /// Sends an event according to its schedule.
    ///
    /// In non-blocking mode a full output reports [`TransportError::WouldBlock`].
    fn event_output(&mut self, event: &SeqEvent) -> Result<(), TransportError>;

    /// Delivers an event immediately, bypassing queues and output buffering.
    fn event_output_direct(&mut self, event: &SeqEvent) -> Result<(), TransportError>;

    /// Flushes buffered output. `WouldBlock` means some output is still pending.
    fn drain_output(&mut self) -> Result<(), TransportError>;

    /// Discards output that has not been delivered yet.
    fn drop_output(&mut self) -> Result<(), TransportError>;

    /// Takes the next input event, if any.
    fn event_input(&mut self) -> Result<Option<SeqEvent>, TransportError>;

    /// Closes the connection. Further calls report [`TransportError::Closed`].
    fn close(&mut self) -> Result<(), TransportError>;

    /// Parses `"client:port"` or `"client.port"` into an address.
    ///
    /// The client may be a number or a client name (exact match first,
    /// then prefix). The port defaults to 0.
    fn parse_address(&self, text: &str) -> Result<Address, TransportError> {
        let text = text.trim();
        let invalid = || TransportError::InvalidAddress(text.to_string());

        let (client_part, port) = match text.rfind(&[':', '.'][..]) {
            Some(idx) => match text[idx + 1..].parse::<u8>() {
                Ok(port) => (&text[..idx], port),
                Err(_) => (text, 0),
            },
            None => (text, 0),
        };
        if client_part.is_empty() {
            return Err(invalid());
        }

        if let Ok(client) = client_part.parse::<ClientId>() {
            return Ok(Address::new(client, port));
        }

        let ports = self.ports()?;
        let client = ports
            .iter()
            .find(|p| p.client_name == client_part)
            .or_else(|| ports.iter().find(|p| p.client_name.starts_with(client_part)))
            .map(|p| p.addr.client)
            .ok_or_else(invalid)?;
        Ok(Address::new(client, port))
    }
}

/// Checks that a connection can host a playback port, then closes it.
///
/// Returns false if creating the port or closing the connection fails.
pub fn detect<T: Transport>(mut transport: T) -> bool {
    let usable = transport
        .create_port("detect", PortCaps::READ | PortCaps::SUBS_READ, PortType::APPLICATION)
        .is_ok();
    let closed = transport.close();
    if let Err(e) = &closed {
        tracing::debug!("Closing detection client: {}", e);
    }
    usable && closed.is_ok()
}
