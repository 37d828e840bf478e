//! One-shot choice of where a song's output goes.

use crate::config::PlayerConfig;
use crate::transport::{Address, PortId, PortType, Transport, SYSTEM_CLIENT};

/// Outcome of port discovery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Destination {
    /// Address events are sent to. Always the subscriber broadcast: a
    /// connection makes the remote port a subscriber.
    pub dest: Address,
    /// Remote port the source port was connected to, if any.
    pub connected: Option<Address>,
}

/// Connects the song's source port somewhere, unless told not to.
///
/// Tries, in order: the configured output address, the first writable
/// exported port advertising generic MIDI and synthesizer types, then the
/// first writable exported generic MIDI port. Ports of this client and of
/// the system client are skipped, and the first connection that succeeds
/// wins. Failing to find anything is not an error.
///
/// # Arguments
///
/// * `transport` - Open transport connection
/// * `port` - Local source port
/// * `config` - Supplies the explicit address and the no-connect override
pub fn pick_destination<T: Transport + ?Sized>(
    transport: &mut T,
    port: PortId,
    config: &PlayerConfig,
) -> Destination {
    let mut destination = Destination {
        dest: Address::SUBSCRIBERS,
        connected: None,
    };
    if config.no_connect() {
        tracing::debug!("Automatic port connection disabled");
        return destination;
    }

    if let Some(wanted) = config.output_ports.as_deref() {
        match transport.parse_address(wanted) {
            Ok(addr) => match transport.connect_to(port, addr) {
                Ok(()) => {
                    tracing::info!("Connected to {} ({})", addr, wanted);
                    destination.connected = Some(addr);
                    return destination;
                }
                Err(e) => tracing::warn!("Cannot connect to {}: {}", addr, e),
            },
            Err(e) => tracing::warn!("Ignoring output address: {}", e),
        }
    }

    destination.connected = connect_first(transport, port, PortType::MIDI_GENERIC | PortType::SYNTHESIZER)
        .or_else(|| connect_first(transport, port, PortType::MIDI_GENERIC));
    if destination.connected.is_none() {
        tracing::info!("No output port found, sending to subscribers only");
    }
    destination
}

/// Connects to the first eligible remote port whose type includes `required`.
fn connect_first<T: Transport + ?Sized>(
    transport: &mut T,
    port: PortId,
    required: PortType,
) -> Option<Address> {
    let own = transport.client_id();
    let mut candidates = match transport.ports() {
        Ok(ports) => ports,
        Err(e) => {
            tracing::warn!("Cannot enumerate ports: {}", e);
            return None;
        }
    };
    candidates.sort_by_key(|info| info.addr);

    for info in candidates {
        if info.addr.client == own
            || info.addr.client == SYSTEM_CLIENT
            || !info.kind.contains(required) || !info.is_writable_export() {
            continue;
        }
        tracing::debug!(
            "Client {} caps {:#x} type {:#x}",
            info.addr.client,
            info.caps.bits(),
            info.kind.bits()
        );
        match transport.connect_to(port, info.addr) {
            Ok(()) => {
                tracing::info!("Connected to {} '{}'", info.addr, info.client_name);
                return Some(info.addr);
            }
            Err(e) => tracing::debug!("Cannot connect to {}: {}", info.addr, e),
        }
    }
    None
}
