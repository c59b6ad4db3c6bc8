//! # tether-driver
//!
//! Worker-thread driver for [`tether`] hosts.
//!
//! The protocol engine is single-threaded by design; this crate owns one
//! on a dedicated thread and exposes a thread-safe handle. Outbound
//! traffic flows through two fixed-capacity FIFOs (peer commands and
//! message payloads), inbound events through a third, so callers never
//! block on the socket.
//!
//! Callers that need the engine directly (connect, RTT queries) take the
//! `access` mutex before the `host` mutex and release `access` once the
//! host is held. The worker does the same, so a waiting caller always
//! gets the host ahead of the worker's next iteration.
//!
//! ```no_run
//! use tether_driver::{Delivery, DriverConfig, HostDriver};
//! use tether::Address;
//!
//! let server = HostDriver::bind(Some(Address::any(7777)), DriverConfig::default()).unwrap();
//! let client = HostDriver::bind(None, DriverConfig::default()).unwrap();
//!
//! let peer = client.connect(server.address(), 1, 0).unwrap();
//! client.send(peer, 0, Delivery::Reliable, b"hello".to_vec()).unwrap();
//!
//! while let Some(event) = server.poll_event() {
//!     println!("{event:?}");
//! }
//! ```

mod queue;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use parking_lot::{Mutex, MutexGuard};

use tether::{
    Address, Event, Host, HostConfig, Packet, PeerId, PeerState, Result, TetherError,
    FLAG_RELIABLE, FLAG_UNSEQUENCED,
};

pub use queue::DEFAULT_QUEUE_CAPACITY;
use queue::Queue;

/// How long the worker waits inside `service` per iteration, in ms.
pub const DEFAULT_EVENT_WAIT: u32 = 1;

/// Delivery class for driver sends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// No ordering, duplicates suppressed by the receiver.
    Unsequenced,
    /// At-most-once, never delivered out of order.
    Sequenced,
    /// Acknowledged and retransmitted until delivered, in order.
    Reliable,
}

impl Delivery {
    fn packet_flags(self) -> u32 {
        match self {
            Delivery::Unsequenced => FLAG_UNSEQUENCED,
            Delivery::Sequenced => 0,
            Delivery::Reliable => FLAG_RELIABLE,
        }
    }
}

/// Driver construction parameters.
#[derive(Debug, Clone)]
pub struct DriverConfig {
    pub host: HostConfig,
    /// Per-iteration service wait, in milliseconds.
    pub event_wait: u32,
    /// Capacity of each FIFO.
    pub queue_capacity: usize,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            host: HostConfig::default(),
            event_wait: DEFAULT_EVENT_WAIT,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
        }
    }
}

enum PeerCommand {
    Ping(PeerId),
    Reset(PeerId),
    Disconnect(PeerId, u32),
    DisconnectLater(PeerId, u32),
    DisconnectNow(PeerId, u32),
    SetTimeout(PeerId, u32, u32, u32),
    SetPingInterval(PeerId, u32),
    BandwidthLimit(u32, u32),
}

struct OutboundMessage {
    target: Option<PeerId>,
    channel_id: u8,
    delivery: Delivery,
    data: Vec<u8>,
}

struct Shared {
    access: Mutex<()>,
    host: Mutex<Host>,
    running: AtomicBool,
    event_wait: u32,
    commands: Queue<PeerCommand>,
    messages: Queue<OutboundMessage>,
    events: Queue<Event>,
}

impl Shared {
    /// Take the host with caller priority: `access` gates the line, and
    /// dropping it before returning keeps the worker from starving us.
    fn acquire_host(&self) -> MutexGuard<'_, Host> {
        let access = self.access.lock();
        let host = self.host.lock();
        drop(access);
        host
    }
}

/// A host running on its own worker thread.
pub struct HostDriver {
    shared: Arc<Shared>,
    address: Address,
    thread: Option<JoinHandle<()>>,
}

impl HostDriver {
    /// Bind a host and start its worker thread.
    pub fn bind(address: Option<Address>, config: DriverConfig) -> Result<Self> {
        let host = Host::bind(address, config.host)?;
        let local_address = host.address();

        let shared = Arc::new(Shared {
            access: Mutex::new(()),
            host: Mutex::new(host),
            running: AtomicBool::new(true),
            event_wait: config.event_wait,
            commands: Queue::new(config.queue_capacity),
            messages: Queue::new(config.queue_capacity),
            events: Queue::new(config.queue_capacity),
        });

        let worker_shared = shared.clone();
        let thread = std::thread::Builder::new()
            .name("tether-driver".into())
            .spawn(move || worker_loop(worker_shared))
            .map_err(TetherError::Io)?;

        Ok(Self {
            shared,
            address: local_address,
            thread: Some(thread),
        })
    }

    /// Local address of the wrapped host.
    pub fn address(&self) -> Address {
        self.address
    }

    /// Initiate a connection; completion arrives as a `Connect` event.
    pub fn connect(&self, address: Address, channel_count: usize, data: u32) -> Result<PeerId> {
        let mut host = self.shared.acquire_host();
        host.connect(address, channel_count, data)
    }

    /// Queue a payload for one peer.
    pub fn send(
        &self,
        peer: PeerId,
        channel_id: u8,
        delivery: Delivery,
        data: Vec<u8>,
    ) -> Result<()> {
        self.push_message(OutboundMessage {
            target: Some(peer),
            channel_id,
            delivery,
            data,
        })
    }

    /// Queue a payload for every connected peer.
    pub fn broadcast(&self, channel_id: u8, delivery: Delivery, data: Vec<u8>) -> Result<()> {
        self.push_message(OutboundMessage {
            target: None,
            channel_id,
            delivery,
            data,
        })
    }

    fn push_message(&self, message: OutboundMessage) -> Result<()> {
        self.shared
            .messages
            .push(message)
            .map_err(|_| TetherError::ResourceExhausted("driver message queue is full"))
    }

    fn push_command(&self, command: PeerCommand) -> Result<()> {
        self.shared
            .commands
            .push(command)
            .map_err(|_| TetherError::ResourceExhausted("driver command queue is full"))
    }

    pub fn ping(&self, peer: PeerId) -> Result<()> {
        self.push_command(PeerCommand::Ping(peer))
    }

    pub fn reset(&self, peer: PeerId) -> Result<()> {
        self.push_command(PeerCommand::Reset(peer))
    }

    pub fn disconnect(&self, peer: PeerId, data: u32) -> Result<()> {
        self.push_command(PeerCommand::Disconnect(peer, data))
    }

    pub fn disconnect_later(&self, peer: PeerId, data: u32) -> Result<()> {
        self.push_command(PeerCommand::DisconnectLater(peer, data))
    }

    pub fn disconnect_now(&self, peer: PeerId, data: u32) -> Result<()> {
        self.push_command(PeerCommand::DisconnectNow(peer, data))
    }

    pub fn set_timeout(&self, peer: PeerId, limit: u32, minimum: u32, maximum: u32) -> Result<()> {
        self.push_command(PeerCommand::SetTimeout(peer, limit, minimum, maximum))
    }

    pub fn set_ping_interval(&self, peer: PeerId, interval: u32) -> Result<()> {
        self.push_command(PeerCommand::SetPingInterval(peer, interval))
    }

    pub fn set_bandwidth_limit(&self, incoming: u32, outgoing: u32) -> Result<()> {
        self.push_command(PeerCommand::BandwidthLimit(incoming, outgoing))
    }

    /// Pop the next event produced by the worker, if any.
    pub fn poll_event(&self) -> Option<Event> {
        self.shared.events.pop()
    }

    pub fn event_count(&self) -> usize {
        self.shared.events.len()
    }

    pub fn peer_state(&self, peer: PeerId) -> PeerState {
        self.shared.acquire_host().peer_state(peer)
    }

    /// Smoothed RTT of a peer, in milliseconds.
    pub fn peer_round_trip_time(&self, peer: PeerId) -> u32 {
        self.shared.acquire_host().peer_round_trip_time(peer)
    }

    pub fn connected_peers(&self) -> usize {
        self.shared.acquire_host().connected_peers()
    }
}

impl Drop for HostDriver {
    fn drop(&mut self) {
        self.shared.running.store(false, Ordering::Release);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
        // Push out whatever the engine still holds, then drop the queues.
        self.shared.acquire_host().flush();
        self.shared.commands.clear();
        self.shared.messages.clear();
        self.shared.events.clear();
    }
}

fn worker_loop(shared: Arc<Shared>) {
    while shared.running.load(Ordering::Acquire) {
        let mut host = shared.acquire_host();
        run_commands(&shared, &mut host);
        send_messages(&shared, &mut host);
        poll_events(&shared, &mut host);
    }
}

fn run_commands(shared: &Shared, host: &mut Host) {
    while let Some(command) = shared.commands.pop() {
        match command {
            PeerCommand::Ping(peer) => host.ping(peer),
            PeerCommand::Reset(peer) => host.reset_peer_connection(peer),
            PeerCommand::Disconnect(peer, data) => host.disconnect(peer, data),
            PeerCommand::DisconnectLater(peer, data) => host.disconnect_later(peer, data),
            PeerCommand::DisconnectNow(peer, data) => host.disconnect_now(peer, data),
            PeerCommand::SetTimeout(peer, limit, minimum, maximum) => {
                host.set_timeout(peer, limit, minimum, maximum)
            }
            PeerCommand::SetPingInterval(peer, interval) => {
                host.set_ping_interval(peer, interval)
            }
            PeerCommand::BandwidthLimit(incoming, outgoing) => {
                host.set_bandwidth_limit(incoming, outgoing)
            }
        }
    }
}

fn send_messages(shared: &Shared, host: &mut Host) {
    while let Some(message) = shared.messages.pop() {
        let packet = Packet::from_vec(message.data, message.delivery.packet_flags());
        match message.target {
            Some(peer) => {
                // A send can legitimately race a disconnect; losing the
                // packet then matches losing it on the wire.
                let _ = host.send(peer, message.channel_id, packet);
            }
            None => host.broadcast(message.channel_id, packet),
        }
    }
}

fn poll_events(shared: &Shared, host: &mut Host) {
    let wait = shared.event_wait;
    match host.service(wait) {
        Ok(Some(event)) => {
            let _ = shared.events.push(event);
            while let Some(event) = host.check_events() {
                if shared.events.push(event).is_err() {
                    break;
                }
            }
        }
        Ok(None) => {}
        Err(_) => {
            // Socket-level errors do not tear the host down; back off so a
            // persistent failure cannot spin the worker.
            std::thread::sleep(std::time::Duration::from_millis(wait.max(1) as u64));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, Instant};

    fn wait_for_event<F>(driver: &HostDriver, timeout: Duration, mut accept: F) -> Option<Event>
    where
        F: FnMut(&Event) -> bool,
    {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if let Some(event) = driver.poll_event() {
                if accept(&event) {
                    return Some(event);
                }
                continue;
            }
            std::thread::sleep(Duration::from_millis(2));
        }
        None
    }

    #[test]
    fn connect_and_exchange_through_drivers() {
        let server = HostDriver::bind(
            Some(Address::new(0x7F00_0001, 0)),
            DriverConfig::default(),
        )
        .unwrap();
        let client = HostDriver::bind(None, DriverConfig::default()).unwrap();

        let peer = client.connect(server.address(), 1, 99).unwrap();

        let server_connect = wait_for_event(&server, Duration::from_secs(5), |event| {
            matches!(event, Event::Connect { .. })
        })
        .expect("server never saw the connection");
        let Event::Connect { data, .. } = server_connect else {
            unreachable!()
        };
        assert_eq!(data, 99);

        wait_for_event(&client, Duration::from_secs(5), |event| {
            matches!(event, Event::Connect { .. })
        })
        .expect("client never finished the handshake");

        client
            .send(peer, 0, Delivery::Reliable, b"over the wall".to_vec())
            .unwrap();

        let received = wait_for_event(&server, Duration::from_secs(5), |event| {
            matches!(event, Event::Receive { .. })
        })
        .expect("server never received the payload");
        let Event::Receive { packet, channel_id, .. } = received else {
            unreachable!()
        };
        assert_eq!(channel_id, 0);
        assert_eq!(packet.data(), b"over the wall");
    }

    #[test]
    fn graceful_disconnect_surfaces_event_data() {
        let server = HostDriver::bind(
            Some(Address::new(0x7F00_0001, 0)),
            DriverConfig::default(),
        )
        .unwrap();
        let client = HostDriver::bind(None, DriverConfig::default()).unwrap();

        let peer = client.connect(server.address(), 1, 0).unwrap();
        wait_for_event(&client, Duration::from_secs(5), |event| {
            matches!(event, Event::Connect { .. })
        })
        .expect("handshake failed");

        client.disconnect_later(peer, 1234).unwrap();

        let disconnect = wait_for_event(&server, Duration::from_secs(5), |event| {
            matches!(event, Event::Disconnect { .. })
        })
        .expect("server never saw the disconnect");
        let Event::Disconnect { data, .. } = disconnect else {
            unreachable!()
        };
        assert_eq!(data, 1234);
    }

    #[test]
    fn broadcast_reaches_every_peer() {
        let server = HostDriver::bind(
            Some(Address::new(0x7F00_0001, 0)),
            DriverConfig::default(),
        )
        .unwrap();
        let client_a = HostDriver::bind(None, DriverConfig::default()).unwrap();
        let client_b = HostDriver::bind(None, DriverConfig::default()).unwrap();

        client_a.connect(server.address(), 1, 0).unwrap();
        client_b.connect(server.address(), 1, 0).unwrap();

        // The server only broadcasts to peers it considers connected, so
        // gate on its own connect events rather than the clients'.
        for _ in 0..2 {
            wait_for_event(&server, Duration::from_secs(5), |event| {
                matches!(event, Event::Connect { .. })
            })
            .expect("handshake failed");
        }

        server
            .broadcast(0, Delivery::Reliable, b"to everyone".to_vec())
            .unwrap();

        for client in [&client_a, &client_b] {
            let received = wait_for_event(client, Duration::from_secs(5), |event| {
                matches!(event, Event::Receive { .. })
            })
            .expect("broadcast did not arrive");
            let Event::Receive { packet, .. } = received else {
                unreachable!()
            };
            assert_eq!(packet.data(), b"to everyone");
        }
    }
}
