//! Per-peer state machine, send/receive pipeline and timer: the core of the crate
//! (`SPEC_FULL.md` §4.3, component C3).
//!
//! A `Connection` owns one UDP socket and one peer. It drives the client side of the salted
//! handshake (`ReadyToConnect` → `AwaitingChallenge` → `AwaitingConnected` → `Connected`), or
//! is adopted directly into `Connected` by [`crate::listener::Listener`] on the server side.
//! Once `Connected`, it multiplexes application packets onto per-id [`Channel`]s and retires
//! itself through a single-shot disconnect body reachable from any state.

mod error;
mod handler;
mod state;

pub use error::ConnectionError;
pub use handler::ConnectionHandler;
pub use state::{ConnectStatus, ConnectionState};

use crate::bit::{ByteReader, ByteWriter};
use crate::channel::{self, Channel};
use crate::config::Config;
use crate::frame::{self, ControlPacket, Decoded, DisconnectReason};
use crate::packet::{Packet, PacketFactory};
use crate::salt::{self, Salt};

use state::AtomicState;

use std::collections::HashMap;
use std::io;
use std::net::{Ipv4Addr, SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Instant;

#[derive(Default)]
struct Salts {
	remote: Option<Salt>,
	session: Option<Salt>,
}

/// A virtual, spoof-resistant connection to a single remote peer over UDP.
///
/// Always held as `Arc<Connection<P>>`: its receive pump and timer are background threads
/// that each hold their own clone of the `Arc`, and outlive any particular caller's borrow.
pub struct Connection<P: Packet> {
	socket: UdpSocket,
	factory: Arc<dyn PacketFactory<P>>,
	handler: Arc<dyn ConnectionHandler<P>>,
	config: Config,
	state: AtomicState,
	remote: Mutex<SocketAddr>,
	local_salt: AtomicU64,
	salts: Mutex<Salts>,
	retry_count: AtomicU32,
	last_received: Mutex<Instant>,
	channels: Mutex<HashMap<u8, Channel<P>>>,
	send_mutex: Mutex<()>,
	disconnect_latch: AtomicBool,
	shutdown: AtomicBool,
	on_disconnect: Mutex<Option<Arc<dyn Fn(Arc<Connection<P>>) + Send + Sync>>>,
	receive_thread: Mutex<Option<JoinHandle<()>>>,
	timer_thread: Mutex<Option<JoinHandle<()>>>,
}

impl<P: Packet + Send + 'static> Connection<P> {
	/// Construct a client-side connection bound to an ephemeral local port.
	///
	/// Stays `ReadyToConnect` — no threads run, no datagrams are sent — until
	/// [`Connection::connect`] is called.
	pub fn new(factory: Arc<dyn PacketFactory<P>>, handler: Arc<dyn ConnectionHandler<P>>, config: Config) -> io::Result<Arc<Self>> {
		let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))?;
		let placeholder = SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0));
		Ok(Self::from_parts(socket, placeholder, ConnectionState::ReadyToConnect, None, factory, handler, config))
	}

	/// Construct a server-side connection already `Connected`, bound to its assigned port.
	///
	/// Used only by [`crate::listener::Listener`], which has already completed the handshake
	/// on the caller's behalf by the time this is called.
	pub(crate) fn adopt(
		socket: UdpSocket,
		remote: SocketAddr,
		session_salt: Salt,
		factory: Arc<dyn PacketFactory<P>>,
		handler: Arc<dyn ConnectionHandler<P>>,
		config: Config,
	) -> Arc<Self> {
		Self::from_parts(socket, remote, ConnectionState::Connected, Some(session_salt), factory, handler, config)
	}

	fn from_parts(
		socket: UdpSocket,
		remote: SocketAddr,
		initial: ConnectionState,
		session_salt: Option<Salt>,
		factory: Arc<dyn PacketFactory<P>>,
		handler: Arc<dyn ConnectionHandler<P>>,
		config: Config,
	) -> Arc<Self> {
		Arc::new(Self {
			socket,
			factory,
			handler,
			config,
			state: AtomicState::new(initial),
			remote: Mutex::new(remote),
			local_salt: AtomicU64::new(0),
			salts: Mutex::new(Salts { remote: None, session: session_salt }),
			retry_count: AtomicU32::new(0),
			last_received: Mutex::new(Instant::now()),
			channels: Mutex::new(HashMap::new()),
			send_mutex: Mutex::new(()),
			disconnect_latch: AtomicBool::new(false),
			shutdown: AtomicBool::new(false),
			on_disconnect: Mutex::new(None),
			receive_thread: Mutex::new(None),
			timer_thread: Mutex::new(None),
		})
	}

	/// Begin the client-side handshake toward `remote`.
	///
	/// Idempotent: if the connection is not currently `ReadyToConnect` (already connecting,
	/// connected, or disconnected), this returns `Ok(())` without perturbing state or sending
	/// anything (`SPEC_FULL.md` §8 property 1).
	pub fn connect(self: &Arc<Self>, remote: SocketAddr) -> io::Result<()> {
		if !self.state.transition(ConnectionState::ReadyToConnect, ConnectionState::AwaitingChallenge) {
			return Ok(());
		}

		*self.remote.lock().unwrap() = remote;
		let local_salt = salt::generate();
		self.local_salt.store(local_salt, Ordering::SeqCst);
		// The first `Connect` counts as attempt 1 of `retry_amount`, so the timer only needs
		// to account for `retry_amount - 1` further resends to reach exactly `retry_amount`
		// outgoing packets in total (`SPEC_FULL.md` §8 property 3).
		self.retry_count.store(1, Ordering::SeqCst);
		self.disconnect_latch.store(false, Ordering::SeqCst);
		self.shutdown.store(false, Ordering::SeqCst);

		log::debug!("connecting to {} with local salt {:#x}", remote, local_salt);
		self.send_control(&ControlPacket::Connect { client_salt: local_salt }, remote)?;
		self.spawn_threads();
		Ok(())
	}

	/// Spawn the receive pump and timer threads. Called by `connect` for client connections
	/// and by the listener for adopted ones.
	pub(crate) fn start(self: &Arc<Self>) {
		self.spawn_threads();
	}

	fn spawn_threads(self: &Arc<Self>) {
		let receiver = Arc::clone(self);
		let receive_thread = thread::Builder::new()
			.name(format!("saltline-recv-{}", self.local_port()))
			.spawn(move || receiver.run_receive_loop())
			.expect("failed to spawn connection receive thread");
		*self.receive_thread.lock().unwrap() = Some(receive_thread);

		let ticker = Arc::clone(self);
		let timer_thread = thread::Builder::new()
			.name(format!("saltline-timer-{}", self.local_port()))
			.spawn(move || ticker.run_timer_loop())
			.expect("failed to spawn connection timer thread");
		*self.timer_thread.lock().unwrap() = Some(timer_thread);
	}

	/// Enqueue `packet` on the channel registered for its id (defaulting to unreliable).
	///
	/// Fails with [`ConnectionError::InvalidState`] unless the connection is `Connected`.
	pub fn send(&self, packet: &P) -> Result<(), ConnectionError> {
		if self.state.load() != ConnectionState::Connected {
			return Err(ConnectionError::InvalidState);
		}
		let remote = *self.remote.lock().unwrap();
		let session_salt = self.salts.lock().unwrap().session.unwrap_or(0);

		// The source's send pipeline (a `sending` flag plus a FIFO queue, `SPEC_FULL.md` §4.3)
		// collapses to a single mutex here: under this blocking-socket model `send_to` is a
		// synchronous syscall, so there is no deferred completion to queue behind (`SPEC_FULL.md`
		// §9, "Reactor vs. callbacks"). Holding the mutex for the call's duration still gives
		// FIFO ordering for serialized callers.
		let _guard = self.send_mutex.lock().unwrap();
		let mut channels = self.channels.lock().unwrap();
		let channel = channels.entry(packet.id()).or_insert_with(channel::unreliable);
		channel.send(session_salt, &self.socket, remote, packet)?;
		Ok(())
	}

	/// Override the reliability discipline used for `id`. Intended to be called once per id
	/// before any traffic flows on it (`SPEC_FULL.md` §4.2).
	pub fn set_packet_channel(&self, id: u8, channel: Channel<P>) {
		self.channels.lock().unwrap().insert(id, channel);
	}

	/// Register a callback invoked once, after [`ConnectionHandler::handle_disconnect`], when
	/// this connection finishes tearing down from `Connected`. Used internally by the listener
	/// to recycle the connection's port; also available to applications.
	pub fn on_disconnect(&self, hook: impl Fn(Arc<Connection<P>>) + Send + Sync + 'static) {
		*self.on_disconnect.lock().unwrap() = Some(Arc::new(hook));
	}

	/// Tear down the connection, notifying the peer with a `Disconnect` if it is currently
	/// `Connected`. A single-shot latch guarantees the teardown body runs at most once no
	/// matter how many threads call this, or race it with a peer-initiated or idle-timeout
	/// disconnect (`SPEC_FULL.md` §8 property 4).
	pub fn disconnect(self: &Arc<Self>) {
		self.do_disconnect(true);
	}

	pub fn state(&self) -> ConnectionState {
		self.state.load()
	}

	pub fn local_port(&self) -> u16 {
		self.socket.local_addr().map(|addr| addr.port()).unwrap_or(0)
	}

	pub fn remote_addr(&self) -> SocketAddr {
		*self.remote.lock().unwrap()
	}

	pub fn session_salt(&self) -> Option<Salt> {
		self.salts.lock().unwrap().session
	}

	fn send_control(&self, packet: &ControlPacket, to: SocketAddr) -> io::Result<()> {
		let mut writer = ByteWriter::with_capacity(frame::MAX_DATAGRAM_SIZE);
		packet.encode(&mut writer);
		self.socket.send_to(&writer.into_bytes(), to)?;
		Ok(())
	}

	fn run_receive_loop(self: Arc<Self>) {
		let _ = self.socket.set_read_timeout(Some(self.config.tick_period()));
		let mut buf = [0u8; frame::MAX_DATAGRAM_SIZE];
		loop {
			if self.shutdown.load(Ordering::SeqCst) {
				break;
			}
			match self.socket.recv_from(&mut buf) {
				Ok((len, from)) => self.on_datagram(&buf[..len], from),
				Err(err) if matches!(err.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => continue,
				Err(err) => {
					log::warn!("connection socket recv failed: {}", err);
					self.do_disconnect(true);
					break;
				}
			}
		}
	}

	fn on_datagram(self: &Arc<Self>, bytes: &[u8], from: SocketAddr) {
		let mut reader = ByteReader::new(bytes);
		match frame::decode(&mut reader) {
			Ok(Decoded::Control(packet)) => self.on_control(packet, from),
			Ok(Decoded::Application { session_salt, packet_id }) => {
				if self.salts.lock().unwrap().session != Some(session_salt) {
					log::trace!("dropping application datagram with mismatched session salt from {}", from);
					return;
				}
				*self.last_received.lock().unwrap() = Instant::now();
				let handler = &self.handler;
				let mut channels = self.channels.lock().unwrap();
				let channel = channels.entry(packet_id).or_insert_with(channel::unreliable);
				if let Err(err) = channel.receive(packet_id, &mut reader, self.factory.as_ref(), &mut |packet| handler.handle_packet(packet)) {
					log::debug!("dropping undecodable application datagram from {}: {}", from, err);
				}
			}
			Err(err) => log::debug!("dropping undecodable datagram from {}: {}", from, err),
		}
	}

	fn on_control(self: &Arc<Self>, packet: ControlPacket, from: SocketAddr) {
		match packet {
			ControlPacket::Challenge { client_salt, server_salt } => self.on_challenge(client_salt, server_salt, from),
			ControlPacket::Connected { session_salt, port } => self.on_connected(session_salt, port),
			ControlPacket::Disconnect { session_salt, reason } => self.on_peer_disconnect(session_salt, reason),
			ControlPacket::Connect { .. } | ControlPacket::Solution { .. } => {
				log::trace!("ignoring a server-bound control packet on a connection socket, from {}", from);
			}
		}
	}

	fn on_challenge(self: &Arc<Self>, client_salt: Salt, server_salt: Salt, from: SocketAddr) {
		if self.state.load() != ConnectionState::AwaitingChallenge {
			return;
		}
		if client_salt != self.local_salt.load(Ordering::SeqCst) {
			log::trace!("dropping a Challenge with a mismatched client salt (spoofed or stale)");
			return;
		}

		let session_salt = salt::combine(client_salt, server_salt);
		{
			let mut salts = self.salts.lock().unwrap();
			salts.remote = Some(server_salt);
			salts.session = Some(session_salt);
		}

		if self.state.transition(ConnectionState::AwaitingChallenge, ConnectionState::AwaitingConnected) {
			self.retry_count.store(1, Ordering::SeqCst);
			log::debug!("challenge accepted from {}, sending solution", from);
			let _ = self.send_control(&ControlPacket::Solution { session_salt }, from);
		}
	}

	fn on_connected(self: &Arc<Self>, session_salt: Salt, port: u16) {
		if self.salts.lock().unwrap().session != Some(session_salt) {
			return;
		}
		self.remote.lock().unwrap().set_port(port);

		if self.state.transition(ConnectionState::AwaitingConnected, ConnectionState::Connected) {
			*self.last_received.lock().unwrap() = Instant::now();
			self.retry_count.store(0, Ordering::SeqCst);
			log::info!("connection established, server migrated us to port {}", port);
			self.handler.handle_connected(ConnectStatus::Success);
		} else if self.state.load() == ConnectionState::Connected {
			// The server re-sent `Connected` after a lost first copy, or after a duplicate
			// `Solution`; both ends tolerate repeats carrying the same port (`SPEC_FULL.md` §9).
			log::trace!("ignoring a duplicate Connected for an already-established connection");
		}
	}

	fn on_peer_disconnect(self: &Arc<Self>, session_salt: Salt, reason: DisconnectReason) {
		// Before a session salt exists, a rejection (`ServerFull`/`ExistingConnection`) carries
		// our own client salt in this field instead (`SPEC_FULL.md` §4.4).
		let expected = match self.state.load() {
			ConnectionState::AwaitingChallenge => Some(self.local_salt.load(Ordering::SeqCst)),
			ConnectionState::AwaitingConnected | ConnectionState::Connected => self.salts.lock().unwrap().session,
			ConnectionState::ReadyToConnect | ConnectionState::Disconnected => None,
		};
		if expected != Some(session_salt) {
			return;
		}
		log::info!("peer disconnected us: {}", reason);
		self.do_disconnect(false);
	}

	fn do_disconnect(self: &Arc<Self>, initiate: bool) {
		if self.disconnect_latch.compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst).is_err() {
			return;
		}

		match self.state.swap(ConnectionState::Disconnected) {
			ConnectionState::ReadyToConnect => {
				// A no-op: restore the state and clear the latch so a later real disconnect
				// can still run (`SPEC_FULL.md` §4.3, "From ReadyToConnect").
				self.state.store(ConnectionState::ReadyToConnect);
				self.disconnect_latch.store(false, Ordering::SeqCst);
			}
			ConnectionState::Connected => {
				if initiate {
					let remote = *self.remote.lock().unwrap();
					let session_salt = self.salts.lock().unwrap().session.unwrap_or(0);
					let _ = self.send_control(
						&ControlPacket::Disconnect { session_salt, reason: DisconnectReason::ClientDisconnect },
						remote,
					);
				}
				self.shutdown.store(true, Ordering::SeqCst);
				self.handler.handle_disconnect();
				if let Some(hook) = self.on_disconnect.lock().unwrap().clone() {
					hook(Arc::clone(self));
				}
			}
			ConnectionState::AwaitingChallenge | ConnectionState::AwaitingConnected => {
				self.shutdown.store(true, Ordering::SeqCst);
				self.handler.handle_connected(ConnectStatus::Disconnect);
			}
			ConnectionState::Disconnected => unreachable!("the disconnect latch prevents re-entry"),
		}
	}

	fn run_timer_loop(self: Arc<Self>) {
		loop {
			thread::sleep(self.config.tick_period());
			if self.shutdown.load(Ordering::SeqCst) {
				break;
			}
			match self.state.load() {
				ConnectionState::AwaitingChallenge => {
					let remote = *self.remote.lock().unwrap();
					let local_salt = self.local_salt.load(Ordering::SeqCst);
					self.tick_handshake(ConnectionState::AwaitingChallenge, ConnectStatus::NoChallengeReceived, remote, ControlPacket::Connect {
						client_salt: local_salt,
					});
				}
				ConnectionState::AwaitingConnected => {
					let remote = *self.remote.lock().unwrap();
					let session_salt = self.salts.lock().unwrap().session.unwrap_or(0);
					self.tick_handshake(ConnectionState::AwaitingConnected, ConnectStatus::NoConnectedReceived, remote, ControlPacket::Solution {
						session_salt,
					});
				}
				ConnectionState::Connected => self.tick_connected(),
				ConnectionState::ReadyToConnect => {}
				ConnectionState::Disconnected => break,
			}
		}
	}

	fn tick_handshake(self: &Arc<Self>, expected: ConnectionState, failure: ConnectStatus, remote: SocketAddr, resend: ControlPacket) {
		let attempt = self.retry_count.fetch_add(1, Ordering::SeqCst);
		if attempt < self.config.retry_amount {
			log::debug!("resending {:?} (attempt {} of {})", resend, attempt + 1, self.config.retry_amount);
			let _ = self.send_control(&resend, remote);
		} else if self.state.transition(expected, ConnectionState::ReadyToConnect) {
			log::warn!("handshake timed out after {} attempts", self.config.retry_amount);
			self.handler.handle_connected(failure);
		}
	}

	fn tick_connected(self: &Arc<Self>) {
		let idle_for = self.last_received.lock().unwrap().elapsed();
		if idle_for >= self.config.idle_timeout {
			log::warn!("connection idle for {:?}, disconnecting", idle_for);
			self.do_disconnect(true);
			return;
		}

		let remote = *self.remote.lock().unwrap();
		let mut channels = self.channels.lock().unwrap();
		// Bypasses `send_mutex`: this is the timer thread writing straight to the socket, not
		// a call through `Connection::send`. A `send_to` is one atomic syscall, so nothing
		// corrupts on the wire, but a resend here can still interleave with an application
		// send's datagram rather than queuing strictly behind it.
		for channel in channels.values_mut() {
			if let Err(err) = channel.resend_due(self.config.resend_period, &self.socket, remote) {
				log::warn!("resend failed: {}", err);
			}
		}
	}
}

#[cfg(test)]
mod test {
	use super::*;
	use crate::config::Config;

	#[derive(Debug, Clone, Copy, PartialEq, Eq)]
	struct Ping(u32);

	impl Packet for Ping {
		fn id(&self) -> u8 {
			0
		}
		fn write_body(&self, writer: &mut dyn crate::bit::BitWrite) {
			writer.write_u16(self.0 as u16);
		}
		fn read_body(&mut self, reader: &mut dyn crate::bit::BitRead) -> Result<(), crate::bit::BitError> {
			self.0 = reader.read_u16()? as u32;
			Ok(())
		}
	}

	struct PingFactory;
	impl PacketFactory<Ping> for PingFactory {
		fn type_count(&self) -> u8 {
			1
		}
		fn create(&self, id: u8) -> Option<Ping> {
			(id == 0).then(|| Ping(0))
		}
	}

	#[derive(Default)]
	struct RecordingHandler {
		connected: Mutex<Vec<ConnectStatus>>,
		disconnects: Mutex<u32>,
		packets: Mutex<Vec<u32>>,
	}

	impl ConnectionHandler<Ping> for RecordingHandler {
		fn handle_connected(&self, status: ConnectStatus) {
			self.connected.lock().unwrap().push(status);
		}
		fn handle_disconnect(&self) {
			*self.disconnects.lock().unwrap() += 1;
		}
		fn handle_packet(&self, packet: Ping) {
			self.packets.lock().unwrap().push(packet.0);
		}
	}

	fn client(config: Config) -> (Arc<Connection<Ping>>, Arc<RecordingHandler>) {
		let handler = Arc::new(RecordingHandler::default());
		let connection = Connection::new(Arc::new(PingFactory), handler.clone(), config).unwrap();
		(connection, handler)
	}

	#[test]
	fn repeated_connect_while_connecting_is_a_no_op() {
		let (connection, _handler) = client(Config::default());
		let remote: SocketAddr = "127.0.0.1:1".parse().unwrap();
		connection.connect(remote).unwrap();
		assert_eq!(connection.state(), ConnectionState::AwaitingChallenge);

		// A second call while already connecting must not send anything or change state; we
		// assert on state only, since counting datagrams would need a bound peer socket.
		connection.connect(remote).unwrap();
		assert_eq!(connection.state(), ConnectionState::AwaitingChallenge);

		connection.disconnect();
	}

	#[test]
	fn send_before_connected_is_invalid_state() {
		let (connection, _handler) = client(Config::default());
		let err = connection.send(&Ping(1)).unwrap_err();
		assert!(matches!(err, ConnectionError::InvalidState));
	}

	#[test]
	fn disconnect_from_ready_to_connect_is_a_no_op() {
		let (connection, handler) = client(Config::default());
		connection.disconnect();
		assert_eq!(connection.state(), ConnectionState::ReadyToConnect);
		assert_eq!(*handler.disconnects.lock().unwrap(), 0);
	}

	#[test]
	fn spoofed_challenge_is_ignored() {
		let (connection, _handler) = client(Config::default());
		let remote: SocketAddr = "127.0.0.1:1".parse().unwrap();
		connection.connect(remote).unwrap();

		connection.on_challenge(0xDEAD_BEEF, 1, remote);
		assert_eq!(connection.state(), ConnectionState::AwaitingChallenge);

		connection.disconnect();
	}

	#[test]
	fn salt_mismatched_application_datagram_is_dropped() {
		let (connection, handler) = client(Config::default());
		connection.salts.lock().unwrap().session = Some(42);
		connection.state.store(ConnectionState::Connected);

		let mut writer = ByteWriter::new();
		frame::write_application_header(&mut writer, 1, 0);
		Ping(7).write_body(&mut writer);
		let bytes = writer.into_bytes();
		connection.on_datagram(&bytes, "127.0.0.1:1".parse().unwrap());

		assert!(handler.packets.lock().unwrap().is_empty());
	}
}
