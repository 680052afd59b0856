//! NatNet stream client.
//!
//! Owns the command and data sockets and one receive thread per socket.
//! Decoded marker sets are handed to the registered listener on the thread
//! that received them.
//!
//! ```text
//!            start()                               stop()
//!   ┌───────────────────────┐            ┌───────────────────────────┐
//!   │ open data socket      │            │ set stop flag             │
//!   │ open command socket   │            │ shutdown both sockets     │
//!   │ send CONNECT          │            │ join both threads         │
//!   │ send REQUEST_FRAME... │            └───────────────────────────┘
//!   │ spawn natnet-command  │──▶ recv ─▶ decode ─▶ listener
//!   │ spawn natnet-data     │──▶ recv ─▶ decode ─▶ listener
//!   └───────────────────────┘
//! ```

use log::{debug, error, info, trace, warn};
use mocap_core::protocol::natnet::{
    self, FrameListeners, Message, MessageId, Response, MAX_PACKET_SIZE,
};
use mocap_core::{
    KeepAliveTimer, MarkerListener, ParseError, RigidBodyListener, SessionManager, SessionState,
};
use serde::Serialize;
use std::io;
use std::net::{SocketAddr, SocketAddrV4};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::thread::{self, JoinHandle};
use std::time::Instant;
use thiserror::Error;

use crate::config::ClientConfig;
use crate::network::{self, ChannelKind, ChannelSocket};

/// Send attempts for a command before giving up
const SEND_ATTEMPTS: usize = 3;

#[derive(Error, Debug)]
pub enum ClientError {
    #[error("Cannot open {channel} socket: {source}")]
    ConnectionFailed {
        channel: ChannelKind,
        source: io::Error,
    },
    #[error("Socket error: {0}")]
    Socket(#[from] io::Error),
    #[error("Client is already streaming")]
    AlreadyRunning,
    #[error("Client is not streaming")]
    NotRunning,
    #[error("Cannot encode request: {0}")]
    Encode(#[from] ParseError),
}

/// Why a receive loop ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopExit {
    /// The stop flag was set
    Stopped,
    /// The socket failed; the other loop keeps running
    SocketError(io::ErrorKind),
    /// The thread panicked
    Panicked,
}

/// What the server told us about itself
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerDescription {
    pub application_name: String,
    pub server_version: [u8; 4],
    pub stream_version: [u8; 4],
    pub can_change_bitstream_version: bool,
}

/// Counters updated by the receive loops
#[derive(Debug, Default)]
pub struct ClientStatistics {
    datagrams: AtomicU64,
    frames: AtomicU64,
    malformed: AtomicU64,
    listener_errors: AtomicU64,
    keep_alives_sent: AtomicU64,
}

impl ClientStatistics {
    pub fn snapshot(&self) -> StatisticsSnapshot {
        StatisticsSnapshot {
            datagrams: self.datagrams.load(Ordering::Relaxed),
            frames: self.frames.load(Ordering::Relaxed),
            malformed: self.malformed.load(Ordering::Relaxed),
            listener_errors: self.listener_errors.load(Ordering::Relaxed),
            keep_alives_sent: self.keep_alives_sent.load(Ordering::Relaxed),
        }
    }

    fn reset(&self) {
        for counter in [
            &self.datagrams,
            &self.frames,
            &self.malformed,
            &self.listener_errors,
            &self.keep_alives_sent,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }
}

/// Point-in-time copy of [`ClientStatistics`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatisticsSnapshot {
    pub datagrams: u64,
    pub frames: u64,
    pub malformed: u64,
    pub listener_errors: u64,
    pub keep_alives_sent: u64,
}

/// State shared between the client handle and its receive loops
struct Shared {
    config: ClientConfig,
    session: Mutex<SessionManager>,
    description: RwLock<ServerDescription>,
    stats: ClientStatistics,
    markers: Option<Arc<dyn MarkerListener>>,
    rigid_bodies: Option<Arc<dyn RigidBodyListener>>,
    epoch: Instant,
}

impl Shared {
    fn new(config: ClientConfig) -> Self {
        Shared {
            config,
            session: Mutex::new(SessionManager::new()),
            description: RwLock::new(ServerDescription::default()),
            stats: ClientStatistics::default(),
            markers: None,
            rigid_bodies: None,
            epoch: Instant::now(),
        }
    }

    fn now_ms(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }

    fn session(&self) -> std::sync::MutexGuard<'_, SessionManager> {
        self.session.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

struct Running {
    command: Arc<ChannelSocket>,
    data: Arc<ChannelSocket>,
    threads: Vec<(ChannelKind, JoinHandle<LoopExit>)>,
}

/// NatNet client with one receive thread per channel
pub struct StreamClient {
    shared: Arc<Shared>,
    stop_flag: Arc<AtomicBool>,
    running: Option<Running>,
}

impl StreamClient {
    pub fn new(config: ClientConfig) -> Self {
        StreamClient {
            shared: Arc::new(Shared::new(config)),
            stop_flag: Arc::new(AtomicBool::new(false)),
            running: None,
        }
    }

    /// Register the marker set listener. Only possible while stopped.
    pub fn set_marker_listener(
        &mut self,
        listener: Arc<dyn MarkerListener>,
    ) -> Result<(), ClientError> {
        let shared = Arc::get_mut(&mut self.shared).ok_or(ClientError::AlreadyRunning)?;
        shared.markers = Some(listener);
        Ok(())
    }

    /// Register the rigid body listener. Only possible while stopped.
    pub fn set_rigid_body_listener(
        &mut self,
        listener: Arc<dyn RigidBodyListener>,
    ) -> Result<(), ClientError> {
        let shared = Arc::get_mut(&mut self.shared).ok_or(ClientError::AlreadyRunning)?;
        shared.rigid_bodies = Some(listener);
        Ok(())
    }

    pub fn config(&self) -> &ClientConfig {
        &self.shared.config
    }

    pub fn state(&self) -> SessionState {
        self.shared.session().state()
    }

    /// Streaming and the server has answered with SERVERINFO
    pub fn is_connected(&self) -> bool {
        self.running.is_some() && self.shared.session().is_connected()
    }

    pub fn server_description(&self) -> ServerDescription {
        self.shared
            .description
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn statistics(&self) -> StatisticsSnapshot {
        self.shared.stats.snapshot()
    }

    /// Local address of the command socket while streaming
    pub fn command_addr(&self) -> Option<SocketAddr> {
        self.running
            .as_ref()
            .and_then(|r| r.command.local_addr().ok())
    }

    /// Local address of the data socket while streaming
    pub fn data_addr(&self) -> Option<SocketAddr> {
        self.running.as_ref().and_then(|r| r.data.local_addr().ok())
    }

    /// Open both sockets, send the handshake and start the receive loops.
    pub fn start(&mut self) -> Result<(), ClientError> {
        if self.running.is_some() {
            return Err(ClientError::AlreadyRunning);
        }
        let now = self.shared.now_ms();
        self.shared
            .session()
            .start_connecting(now)
            .map_err(|_| ClientError::AlreadyRunning)?;

        let config = &self.shared.config;
        let sockets = ChannelSocket::data(config)
            .map_err(|source| ClientError::ConnectionFailed {
                channel: ChannelKind::Data,
                source,
            })
            .and_then(|data| {
                ChannelSocket::command(config)
                    .map(|command| (command, data))
                    .map_err(|source| ClientError::ConnectionFailed {
                        channel: ChannelKind::Command,
                        source,
                    })
            });
        let (command, data) = match sockets {
            Ok((command, data)) => (Arc::new(command), Arc::new(data)),
            Err(e) => {
                error!("{}", e);
                let now = self.shared.now_ms();
                let _ = self.shared.session().connect_failed(now);
                return Err(e);
            }
        };

        self.stop_flag.store(false, Ordering::SeqCst);
        self.shared.stats.reset();
        *self
            .shared
            .description
            .write()
            .unwrap_or_else(PoisonError::into_inner) = ServerDescription::default();

        let server = config.command_address();
        for request in [
            natnet::create_connect_request(),
            natnet::create_frame_of_data_request(),
        ] {
            if let Err(e) = command.send_to(&request, server) {
                warn!("Cannot send request to {}: {}", server, e);
            }
        }

        let mut threads = Vec::with_capacity(2);
        for socket in [command.clone(), data.clone()] {
            let kind = socket.kind();
            let rx = ReceiveLoop::new(socket, self.shared.clone(), self.stop_flag.clone());
            match thread::Builder::new()
                .name(format!("natnet-{}", kind))
                .spawn(move || rx.run())
            {
                Ok(handle) => threads.push((kind, handle)),
                Err(e) => {
                    error!("Cannot spawn {} receive thread: {}", kind, e);
                    self.stop_flag.store(true, Ordering::SeqCst);
                    command.shutdown();
                    data.shutdown();
                    for (_, handle) in threads {
                        let _ = handle.join();
                    }
                    let now = self.shared.now_ms();
                    let _ = self.shared.session().connect_failed(now);
                    return Err(ClientError::Socket(e));
                }
            }
        }

        let now = self.shared.now_ms();
        let _ = self.shared.session().streaming(now);
        info!(
            "Streaming from {} ({})",
            server,
            if config.use_multicast {
                "multicast"
            } else {
                "unicast"
            }
        );
        self.running = Some(Running {
            command,
            data,
            threads,
        });
        Ok(())
    }

    /// Stop both receive loops and close the sockets.
    ///
    /// Returns once both threads have exited, which takes at most one read
    /// timeout, with each loop's exit code. Does nothing and returns no
    /// exits if the client is not streaming.
    pub fn stop(&mut self) -> Vec<(ChannelKind, LoopExit)> {
        let Some(running) = self.running.take() else {
            return Vec::new();
        };
        let now = self.shared.now_ms();
        let streamed_ms = {
            let mut session = self.shared.session();
            let streamed_ms = session.time_in_state_ms(now);
            let _ = session.stopping(now);
            streamed_ms
        };

        self.stop_flag.store(true, Ordering::SeqCst);
        running.command.shutdown();
        running.data.shutdown();

        let mut exits = Vec::with_capacity(running.threads.len());
        for (kind, handle) in running.threads {
            let exit = handle.join().unwrap_or(LoopExit::Panicked);
            match exit {
                LoopExit::Panicked => error!("NatNet {} loop panicked", kind),
                _ => debug!("NatNet {} loop exited: {:?}", kind, exit),
            }
            exits.push((kind, exit));
        }

        let now = self.shared.now_ms();
        let _ = self.shared.session().stopped(now);
        info!("Stopped streaming after {} ms", streamed_ms);
        exits
    }

    /// Send a NAT_REQUEST command, retrying a failed send up to three times
    pub fn send_command(&self, command: &str) -> Result<usize, ClientError> {
        self.send_request(&natnet::create_command(command)?)
    }

    /// Ask the server which bitstream version it is sending
    pub fn request_bitstream_version(&self) -> Result<usize, ClientError> {
        self.send_command("Bitstream")
    }

    fn send_request(&self, request: &[u8]) -> Result<usize, ClientError> {
        let running = self.running.as_ref().ok_or(ClientError::NotRunning)?;
        let server = self.shared.config.command_address();

        let mut last_error = None;
        for attempt in 1..=SEND_ATTEMPTS {
            match running.command.send_to(request, server) {
                Ok(sent) => return Ok(sent),
                Err(e) => {
                    debug!("Send attempt {} to {} failed: {}", attempt, server, e);
                    last_error = Some(e);
                }
            }
        }
        Err(ClientError::Socket(last_error.unwrap_or_else(|| {
            io::Error::new(io::ErrorKind::Other, "no send attempted")
        })))
    }
}

impl Drop for StreamClient {
    fn drop(&mut self) {
        self.stop();
    }
}

// =============================================================================
// Receive Loop
// =============================================================================

/// How a receive error ends a loop, `None` to keep receiving
fn exit_on_error(e: &io::Error, stopping: bool) -> Option<LoopExit> {
    if stopping {
        Some(LoopExit::Stopped)
    } else if network::is_transient(e) {
        None
    } else {
        Some(LoopExit::SocketError(e.kind()))
    }
}

struct ReceiveLoop {
    socket: Arc<ChannelSocket>,
    shared: Arc<Shared>,
    stop: Arc<AtomicBool>,
    /// Only the command loop of a unicast session keeps the server alive
    keep_alive: Option<(KeepAliveTimer, SocketAddrV4)>,
    recv_buf: Vec<u8>,
    frames_seen: u64,
}

impl ReceiveLoop {
    fn new(socket: Arc<ChannelSocket>, shared: Arc<Shared>, stop: Arc<AtomicBool>) -> Self {
        let keep_alive = (socket.kind() == ChannelKind::Command && !shared.config.use_multicast)
            .then(|| {
                (
                    KeepAliveTimer::new(shared.config.keep_alive_interval_ms),
                    shared.config.command_address(),
                )
            });
        ReceiveLoop {
            socket,
            shared,
            stop,
            keep_alive,
            recv_buf: vec![0u8; MAX_PACKET_SIZE],
            frames_seen: 0,
        }
    }

    fn run(mut self) -> LoopExit {
        let kind = self.socket.kind();
        info!("NatNet {} loop started", kind);

        let exit = loop {
            if self.stop.load(Ordering::SeqCst) {
                break LoopExit::Stopped;
            }

            let mut buf = std::mem::take(&mut self.recv_buf);
            let received = self.socket.recv_from(&mut buf);
            match received {
                Ok((len, Some(from))) if len > 0 => self.handle(&buf[..len], from),
                // Empty datagram, or the wakeup from shutdown()
                Ok(_) => {
                    if self.stop.load(Ordering::SeqCst) {
                        break LoopExit::Stopped;
                    }
                }
                Err(e) => {
                    if let Some(exit) = exit_on_error(&e, self.stop.load(Ordering::SeqCst)) {
                        match exit {
                            LoopExit::Stopped => {
                                trace!("NatNet {} loop woke up on stop: {}", kind, e)
                            }
                            _ => warn!("NatNet {} socket failed: {}", kind, e),
                        }
                        break exit;
                    }
                }
            }
            self.recv_buf = buf;

            self.send_keep_alive();
        };

        info!("NatNet {} loop ended: {:?}", kind, exit);
        exit
    }

    fn handle(&mut self, datagram: &[u8], from: SocketAddr) {
        let shared = &self.shared;
        shared.stats.datagrams.fetch_add(1, Ordering::Relaxed);

        let listeners = FrameListeners {
            markers: shared.markers.as_deref(),
            rigid_bodies: shared.rigid_bodies.as_deref(),
        };

        match natnet::decode_message(datagram, listeners) {
            Ok(Message::FrameOfData(summary)) => {
                shared.stats.frames.fetch_add(1, Ordering::Relaxed);
                if !summary.listener_errors.is_empty() {
                    shared
                        .stats
                        .listener_errors
                        .fetch_add(summary.listener_errors.len() as u64, Ordering::Relaxed);
                    for e in &summary.listener_errors {
                        warn!("Frame {}: {}", summary.frame_number, e);
                    }
                }

                self.frames_seen += 1;
                let interval = shared.config.diagnostics.frame_log_interval;
                if interval > 0 && self.frames_seen % interval == 0 {
                    debug!(
                        "NatNet {} frame {}: {} marker sets, {} rigid bodies, {} bytes",
                        self.socket.kind(),
                        summary.frame_number,
                        summary.marker_sets,
                        summary.rigid_bodies,
                        summary.bytes_consumed
                    );
                }
            }
            Ok(Message::ServerInfo(server)) => {
                info!(
                    "Connected to {} {:?}, NatNet {:?}",
                    server.application_name, server.server_version, server.stream_version
                );
                {
                    let mut description = shared
                        .description
                        .write()
                        .unwrap_or_else(PoisonError::into_inner);
                    description.can_change_bitstream_version =
                        server.stream_version[0] >= 4 && !shared.config.use_multicast;
                    description.application_name = server.application_name;
                    description.server_version = server.server_version;
                    description.stream_version = server.stream_version;
                }
                shared.session().server_info();
            }
            Ok(Message::Response(Response::Bitstream { version })) => {
                info!("Server streams bitstream version {:?}", version);
                shared
                    .description
                    .write()
                    .unwrap_or_else(PoisonError::into_inner)
                    .stream_version = version;
            }
            Ok(Message::Response(Response::CommandResult(result))) => {
                debug!("Command result: {}", result);
            }
            Ok(Message::Response(Response::Text(text))) => {
                info!("Server response: {}", text);
            }
            Ok(Message::MessageString(text)) => {
                info!("Server message: {}", text);
            }
            Ok(Message::UnrecognizedRequest) => {
                warn!("Server did not recognize a request");
            }
            Ok(Message::Other { id, length }) => {
                trace!("Ignoring {} ({} bytes) from {}", id, length, from);
            }
            Err(e) => {
                shared.stats.malformed.fetch_add(1, Ordering::Relaxed);
                let id = natnet::peek_message_id(datagram).unwrap_or(MessageId::Unknown(0));
                warn!("Dropping malformed {} from {}: {}", id, from, e);
            }
        }
    }

    fn send_keep_alive(&mut self) {
        let now = self.shared.now_ms();
        let Some((timer, server)) = &mut self.keep_alive else {
            return;
        };
        if !timer.is_due(now) {
            return;
        }
        match self.socket.send_to(&natnet::create_keep_alive(), *server) {
            Ok(_) => {
                self.shared
                    .stats
                    .keep_alives_sent
                    .fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => debug!("Cannot send keep-alive to {}: {}", server, e),
        }
        timer.mark_sent(now);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mocap_core::protocol::natnet::ServerInfo;
    use std::net::{Ipv4Addr, UdpSocket};
    use std::time::Duration;

    /// Unicast config talking to `server` on loopback
    fn test_config(server: &UdpSocket) -> ClientConfig {
        let SocketAddr::V4(server_addr) = server.local_addr().unwrap() else {
            panic!("expected IPv4");
        };
        ClientConfig {
            server_address: *server_addr.ip(),
            command_port: server_addr.port(),
            local_address: Ipv4Addr::LOCALHOST,
            use_multicast: false,
            multicast_address: Ipv4Addr::BROADCAST,
            read_timeout_ms: 50,
            keep_alive_interval_ms: 60_000,
            ..ClientConfig::default()
        }
    }

    fn fake_server() -> UdpSocket {
        let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
        socket
            .set_read_timeout(Some(Duration::from_secs(2)))
            .unwrap();
        socket
    }

    fn wait_for(mut condition: impl FnMut() -> bool) -> bool {
        for _ in 0..200 {
            if condition() {
                return true;
            }
            thread::sleep(Duration::from_millis(10));
        }
        false
    }

    #[test]
    fn test_stop_without_start() {
        let mut client = StreamClient::new(ClientConfig::default());
        assert!(client.stop().is_empty());
        assert_eq!(client.state(), SessionState::Idle);
    }

    #[test]
    fn test_send_requires_running() {
        let client = StreamClient::new(ClientConfig::default());
        assert!(matches!(
            client.send_command("Bitstream"),
            Err(ClientError::NotRunning)
        ));
    }

    #[test]
    fn test_start_stop() {
        let server = fake_server();
        let mut client = StreamClient::new(test_config(&server));
        client.start().unwrap();
        assert_eq!(client.state(), SessionState::Streaming);
        assert!(!client.is_connected());
        assert!(matches!(client.start(), Err(ClientError::AlreadyRunning)));

        let started = Instant::now();
        let exits = client.stop();
        assert!(started.elapsed() < Duration::from_secs(2));
        assert_eq!(
            exits,
            vec![
                (ChannelKind::Command, LoopExit::Stopped),
                (ChannelKind::Data, LoopExit::Stopped)
            ]
        );
        assert_eq!(client.state(), SessionState::Idle);
        assert!(client.command_addr().is_none());
    }

    #[test]
    fn test_repeated_stop_exits_cleanly() {
        let server = fake_server();
        let mut client = StreamClient::new(test_config(&server));
        for i in 0..20 {
            client.start().unwrap();
            thread::sleep(Duration::from_millis(3 * i));
            for (kind, exit) in client.stop() {
                assert_eq!(exit, LoopExit::Stopped, "{} loop in cycle {}", kind, i);
            }
        }
    }

    #[test]
    fn test_receive_error_classification() {
        let timeout = io::Error::from(io::ErrorKind::WouldBlock);
        let refused = io::Error::from(io::ErrorKind::ConnectionRefused);
        let denied = io::Error::from(io::ErrorKind::PermissionDenied);

        assert_eq!(exit_on_error(&timeout, false), None);
        assert_eq!(exit_on_error(&refused, false), None);
        assert_eq!(
            exit_on_error(&denied, false),
            Some(LoopExit::SocketError(io::ErrorKind::PermissionDenied))
        );
        assert_eq!(exit_on_error(&denied, true), Some(LoopExit::Stopped));
        assert_eq!(exit_on_error(&timeout, true), Some(LoopExit::Stopped));
    }

    #[test]
    fn test_unicast_keep_alive() {
        let server = fake_server();
        let config = ClientConfig {
            keep_alive_interval_ms: 50,
            ..test_config(&server)
        };
        let mut client = StreamClient::new(config);
        client.start().unwrap();

        let mut buf = [0u8; 1024];
        let mut keep_alives = 0;
        let deadline = Instant::now() + Duration::from_secs(2);
        while keep_alives < 3 && Instant::now() < deadline {
            let (len, from) = server.recv_from(&mut buf).unwrap();
            if natnet::parse_header(&buf[..len]).unwrap().id == MessageId::KeepAlive {
                assert_eq!(Some(from), client.command_addr());
                keep_alives += 1;
            }
        }
        assert_eq!(keep_alives, 3);
        assert!(client.statistics().keep_alives_sent >= 3);
        client.stop();
    }

    #[test]
    fn test_multicast_sends_no_keep_alive() {
        let server = fake_server();
        server
            .set_read_timeout(Some(Duration::from_millis(100)))
            .unwrap();
        let config = ClientConfig {
            use_multicast: true,
            multicast_address: natnet::DEFAULT_MULTICAST_ADDR,
            keep_alive_interval_ms: 10,
            ..test_config(&server)
        };
        let socket = Arc::new(ChannelSocket::command(&config).unwrap());
        let shared = Arc::new(Shared::new(config));
        let stop = Arc::new(AtomicBool::new(false));

        let rx = ReceiveLoop::new(socket.clone(), shared.clone(), stop.clone());
        assert!(rx.keep_alive.is_none());
        let handle = thread::spawn(move || rx.run());
        thread::sleep(Duration::from_millis(200));
        stop.store(true, Ordering::SeqCst);
        socket.shutdown();

        assert_eq!(handle.join().unwrap(), LoopExit::Stopped);
        assert_eq!(shared.stats.snapshot().keep_alives_sent, 0);
        let mut buf = [0u8; 64];
        assert!(server.recv_from(&mut buf).is_err());
    }

    #[test]
    fn test_frames_on_data_socket_reach_listener() {
        let server = fake_server();
        let mut client = StreamClient::new(test_config(&server));
        let ring = Arc::new(mocap_core::FrameRing::new(4));
        client.set_marker_listener(ring.clone()).unwrap();
        client.start().unwrap();

        let frame = natnet::FrameOfData {
            frame_number: 9,
            marker_sets: vec![mocap_core::MarkerBatch {
                frame_number: 9,
                set_label: "hand".to_string(),
                samples: vec![mocap_core::RawMarkerSample {
                    frame_number: 9,
                    x: 1.0,
                    y: 2.0,
                    z: 3.0,
                }],
            }],
            rigid_bodies: vec![],
            bytes_consumed: 0,
        };
        let target = client.data_addr().unwrap();
        let SocketAddr::V4(target) = target else {
            panic!("expected IPv4");
        };
        // The data socket is bound to 0.0.0.0
        let target = SocketAddrV4::new(Ipv4Addr::LOCALHOST, target.port());
        server
            .send_to(&natnet::create_frame_of_data_message(&frame).unwrap(), target)
            .unwrap();

        assert!(wait_for(|| client.statistics().frames == 1));
        assert_eq!(ring.len(), 1);
        client.stop();
    }

    #[test]
    fn test_handshake_and_server_info() {
        let server = fake_server();
        let mut client = StreamClient::new(test_config(&server));
        client.start().unwrap();

        let mut buf = [0u8; 1024];
        let (len, from) = server.recv_from(&mut buf).unwrap();
        assert_eq!(
            natnet::parse_header(&buf[..len]).unwrap().id,
            MessageId::Connect
        );

        let info = ServerInfo {
            application_name: "Motive".to_string(),
            server_version: [3, 1, 0, 0],
            stream_version: [4, 1, 0, 0],
        };
        server
            .send_to(&natnet::create_server_info_message(&info), from)
            .unwrap();

        assert!(wait_for(|| client.is_connected()));
        let description = client.server_description();
        assert_eq!(description.application_name, "Motive");
        assert!(description.can_change_bitstream_version);
        client.stop();
        assert!(!client.is_connected());
    }

    #[test]
    fn test_malformed_datagram_counted() {
        let server = fake_server();
        let mut client = StreamClient::new(test_config(&server));
        client.start().unwrap();
        let target = client.command_addr().unwrap();

        // FRAMEOFDATA claiming one marker set with no label terminator
        let mut bad = vec![7, 0, 12, 0];
        bad.extend_from_slice(&1i32.to_le_bytes());
        bad.extend_from_slice(&1i32.to_le_bytes());
        bad.extend_from_slice(b"hand");
        server.send_to(&bad, target).unwrap();
        assert!(wait_for(|| client.statistics().malformed == 1));

        // The loop keeps going
        server.send_to(&bad, target).unwrap();
        assert!(wait_for(|| client.statistics().malformed == 2));
        assert_eq!(client.state(), SessionState::Streaming);
        client.stop();
    }

    #[test]
    fn test_send_command() {
        let server = fake_server();
        let mut client = StreamClient::new(test_config(&server));
        client.start().unwrap();

        let mut buf = [0u8; 1024];
        // CONNECT, REQUEST_FRAMEOFDATA, possibly a first keep-alive
        let mut saw_bitstream = false;
        client.request_bitstream_version().unwrap();
        while let Ok((len, _)) = server.recv_from(&mut buf) {
            if buf[..len] == natnet::create_command("Bitstream").unwrap()[..] {
                saw_bitstream = true;
                break;
            }
        }
        assert!(saw_bitstream);
        client.stop();
    }

    #[test]
    fn test_listener_registration_rejected_while_running() {
        let server = fake_server();
        let mut client = StreamClient::new(test_config(&server));
        client.start().unwrap();
        let ring = Arc::new(mocap_core::FrameRing::new(4));
        assert!(matches!(
            client.set_marker_listener(ring),
            Err(ClientError::AlreadyRunning)
        ));
        client.stop();
    }
}
