//! Server-side handshake acceptor: binds a well-known port, mints [`Connection`]s
//! (`SPEC_FULL.md` §4.4, component C4).
//!
//! A `Listener` answers only control packets on its own socket. Once a handshake completes it
//! hands the peer off to a freshly bound [`Connection`], migrated to its own port, and never
//! sees that peer's application traffic again.

mod error;
mod handler;
mod pending;

pub use error::ListenerError;
pub use handler::AcceptorHandler;
pub use pending::PendingHandshake;

use crate::bit::{ByteReader, ByteWriter};
use crate::config::Config;
use crate::connection::Connection;
use crate::frame::{self, ControlPacket, Decoded, DisconnectReason};
use crate::packet::{Packet, PacketFactory};
use crate::salt::{self, Salt};

use std::collections::{HashMap, VecDeque};
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

/// How long a pending handshake may sit unanswered before a receive-loop sweep discards it.
///
/// Derived from the handshake retry budget so a client that is still legitimately retrying
/// its `Solution` is never swept out from under itself (`SPEC_FULL.md` §9, "Pending handshake
/// expiry").
fn pending_handshake_ttl(config: &Config) -> std::time::Duration {
	config.resend_period * (config.retry_amount + 1)
}

/// Listens on a fixed port, performs the server side of the salted handshake, and mints one
/// [`Connection`] per accepted peer, migrated onto its own port from the pool.
pub struct Listener<P: Packet> {
	socket: UdpSocket,
	port: u16,
	max_clients: u16,
	factory: Arc<dyn PacketFactory<P>>,
	handler: Arc<dyn AcceptorHandler<P>>,
	config: Config,
	available_ports: Mutex<VecDeque<u16>>,
	pending: Mutex<HashMap<IpAddr, PendingHandshake>>,
	connections: Mutex<HashMap<IpAddr, Arc<Connection<P>>>>,
	shutdown: AtomicBool,
	receive_thread: Mutex<Option<JoinHandle<()>>>,
}

impl<P: Packet + Send + 'static> Listener<P> {
	/// Bind to `port` and reserve `max_clients` ports in `[port + 1, port + max_clients]` for
	/// accepted connections. Does not start listening; call [`Listener::start`] for that.
	pub fn bind(
		port: u16,
		max_clients: u16,
		factory: Arc<dyn PacketFactory<P>>,
		handler: Arc<dyn AcceptorHandler<P>>,
		config: Config,
	) -> Result<Arc<Self>, ListenerError> {
		let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, port))?;
		// `port = 0` asks the OS for an ephemeral port (handy for tests); read back whatever
		// was actually bound so the port pool is computed relative to the real listening port.
		let port = socket.local_addr()?.port();

		// u32 arithmetic so a `port` near `u16::MAX` with a large `max_clients` clamps instead
		// of wrapping (`SPEC_FULL.md` §4.4, "[P+1, P+maxClients]").
		let first = port as u32 + 1;
		let last = (port as u32 + max_clients as u32).min(u16::MAX as u32);
		let available_ports = (first..=last).map(|p| p as u16).collect();

		Ok(Arc::new(Self {
			socket,
			port,
			max_clients,
			factory,
			handler,
			config,
			available_ports: Mutex::new(available_ports),
			pending: Mutex::new(HashMap::new()),
			connections: Mutex::new(HashMap::new()),
			shutdown: AtomicBool::new(false),
			receive_thread: Mutex::new(None),
		}))
	}

	/// Start the receive pump. Until this is called the listener answers nothing.
	pub fn start(self: &Arc<Self>) {
		let listener = Arc::clone(self);
		let receive_thread = thread::Builder::new()
			.name(format!("saltline-listener-{}", self.port))
			.spawn(move || listener.run_receive_loop())
			.expect("failed to spawn listener receive thread");
		*self.receive_thread.lock().unwrap() = Some(receive_thread);
	}

	/// Stop accepting new handshakes: close the listening socket's receive pump, drain pending
	/// handshakes, and, if `notify_connections`, broadcast a `Disconnect` to every connection
	/// this listener minted (`SPEC_FULL.md` §4.4, "Listener shutdown").
	pub fn stop(&self, notify_connections: bool) {
		self.shutdown.store(true, Ordering::SeqCst);
		self.pending.lock().unwrap().clear();

		if notify_connections {
			let connections = self.connections.lock().unwrap();
			for connection in connections.values() {
				connection.disconnect();
			}
		}
	}

	pub fn local_port(&self) -> u16 {
		self.port
	}

	pub fn max_clients(&self) -> u16 {
		self.max_clients
	}

	pub fn available_ports(&self) -> usize {
		self.available_ports.lock().unwrap().len()
	}

	pub fn connection_count(&self) -> usize {
		self.connections.lock().unwrap().len()
	}

	fn reply(&self, packet: &ControlPacket, to: SocketAddr) {
		let mut writer = ByteWriter::with_capacity(frame::MAX_DATAGRAM_SIZE);
		packet.encode(&mut writer);
		if let Err(err) = self.socket.send_to(&writer.into_bytes(), to) {
			log::warn!("listener failed to reply to {}: {}", to, err);
		}
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
				Err(err) if matches!(err.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => {
					self.sweep_pending();
					continue;
				}
				Err(err) => {
					log::warn!("listener socket recv failed: {}", err);
					break;
				}
			}
		}
	}

	fn on_datagram(self: &Arc<Self>, bytes: &[u8], from: SocketAddr) {
		let mut reader = ByteReader::new(bytes);
		match frame::decode(&mut reader) {
			Ok(Decoded::Control(ControlPacket::Connect { client_salt })) => self.handle_connect(client_salt, from),
			Ok(Decoded::Control(ControlPacket::Solution { session_salt })) => self.handle_solution(session_salt, from),
			Ok(Decoded::Control(_)) => {
				log::trace!("ignoring a client-bound control packet on the listener socket, from {}", from);
			}
			Ok(Decoded::Application { .. }) => {
				log::trace!("dropping an application datagram addressed to the listener socket, from {}", from);
			}
			Err(err) => log::debug!("dropping undecodable datagram from {}: {}", from, err),
		}
	}

	fn handle_connect(self: &Arc<Self>, client_salt: Salt, from: SocketAddr) {
		if self.connections.lock().unwrap().contains_key(&from.ip()) {
			log::debug!("rejecting Connect from {}: already connected", from);
			self.reply(&ControlPacket::Disconnect { session_salt: client_salt, reason: DisconnectReason::ExistingConnection }, from);
			return;
		}

		if self.available_ports.lock().unwrap().is_empty() {
			log::debug!("rejecting Connect from {}: no ports available", from);
			self.reply(&ControlPacket::Disconnect { session_salt: client_salt, reason: DisconnectReason::ServerFull }, from);
			return;
		}

		let server_salt = salt::generate();
		self.pending.lock().unwrap().insert(from.ip(), PendingHandshake::new(client_salt, server_salt));
		log::debug!("challenging {} with server salt {:#x}", from, server_salt);
		self.reply(&ControlPacket::Challenge { client_salt, server_salt }, from);
	}

	fn handle_solution(self: &Arc<Self>, session_salt: Salt, from: SocketAddr) {
		if let Some(connection) = self.connections.lock().unwrap().get(&from.ip()) {
			if connection.session_salt() == Some(session_salt) {
				log::trace!("re-sending Connected to {}: our reply was likely lost", from);
				self.reply(&ControlPacket::Connected { session_salt, port: connection.local_port() }, from);
			}
			return;
		}

		let pending = match self.pending.lock().unwrap().remove(&from.ip()) {
			Some(pending) => pending,
			None => {
				log::trace!("dropping a Solution with no matching pending handshake, from {}", from);
				return;
			}
		};

		let expected = salt::combine(pending.client_salt, pending.server_salt);
		if expected != session_salt {
			log::trace!("dropping a Solution with a mismatched session salt, from {}", from);
			return;
		}

		let port = match self.available_ports.lock().unwrap().pop_front() {
			Some(port) => port,
			None => {
				// Exhausted by a race between `Connect` and this `Solution`; the pending entry
				// is already gone, so there is nothing left to do but drop.
				log::debug!("no port available to complete handshake for {}, dropping", from);
				return;
			}
		};

		let socket = match UdpSocket::bind((Ipv4Addr::UNSPECIFIED, port)) {
			Ok(socket) => socket,
			Err(err) => {
				log::warn!("failed to bind assigned port {} for {}: {}", port, from, err);
				self.available_ports.lock().unwrap().push_back(port);
				return;
			}
		};

		let connection_handler = self.handler.connection_handler();
		let connection = Connection::adopt(socket, from, session_salt, Arc::clone(&self.factory), connection_handler, self.config);

		let mut connections = self.connections.lock().unwrap();
		if connections.contains_key(&from.ip()) {
			// A concurrent accept already won; dispose the connection we just built and
			// return its port.
			self.available_ports.lock().unwrap().push_back(port);
			return;
		}
		connections.insert(from.ip(), Arc::clone(&connection));
		drop(connections);

		self.install_recycle_hook(&connection, from.ip(), port);
		self.handler.handle_connection(Arc::clone(&connection));
		connection.start();
		log::info!("accepted {} on port {}", from, port);
		self.reply(&ControlPacket::Connected { session_salt, port }, from);
	}

	fn install_recycle_hook(self: &Arc<Self>, connection: &Arc<Connection<P>>, addr: IpAddr, port: u16) {
		let listener = Arc::clone(self);
		connection.on_disconnect(move |_connection| listener.on_connection_disconnect(addr, port));
	}

	/// Return `port` to the pool and drop the established-connection entry for `addr`
	/// (`SPEC_FULL.md` §4.4, "Port recycling").
	fn on_connection_disconnect(&self, addr: IpAddr, port: u16) {
		self.connections.lock().unwrap().remove(&addr);
		self.available_ports.lock().unwrap().push_back(port);
		log::debug!("recycled port {} from {}", port, addr);
	}

	fn sweep_pending(&self) {
		let ttl = pending_handshake_ttl(&self.config);
		self.pending.lock().unwrap().retain(|_, pending| pending.age() < ttl);
	}
}

#[cfg(test)]
mod test {
	use super::*;
	use crate::bit::{BitError, BitRead, BitWrite};
	use std::sync::Mutex as StdMutex;

	#[derive(Debug, Clone, Copy, PartialEq, Eq)]
	struct Ping(u32);

	impl Packet for Ping {
		fn id(&self) -> u8 {
			0
		}
		fn write_body(&self, writer: &mut dyn BitWrite) {
			writer.write_u16(self.0 as u16);
		}
		fn read_body(&mut self, reader: &mut dyn BitRead) -> Result<(), BitError> {
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

	struct NullHandler;
	impl crate::connection::ConnectionHandler<Ping> for NullHandler {
		fn handle_packet(&self, _packet: Ping) {}
	}

	#[derive(Default)]
	struct RecordingAcceptor {
		accepted: StdMutex<Vec<SocketAddr>>,
	}

	impl AcceptorHandler<Ping> for RecordingAcceptor {
		fn connection_handler(&self) -> Arc<dyn crate::connection::ConnectionHandler<Ping>> {
			Arc::new(NullHandler)
		}

		fn handle_connection(&self, connection: Arc<Connection<Ping>>) {
			self.accepted.lock().unwrap().push(connection.remote_addr());
		}
	}

	fn listener(max_clients: u16) -> Arc<Listener<Ping>> {
		Listener::bind(0, max_clients, Arc::new(PingFactory), Arc::new(RecordingAcceptor::default()), Config::default()).unwrap()
	}

	#[test]
	fn fresh_listener_reserves_the_configured_port_range() {
		let listener = listener(4);
		assert_eq!(listener.available_ports(), 4);
		assert_eq!(listener.connection_count(), 0);
	}

	#[test]
	fn connect_from_a_second_address_is_rejected_when_the_pool_is_empty() {
		let listener = listener(0);
		assert_eq!(listener.available_ports(), 0);

		let from: SocketAddr = "127.0.0.1:40000".parse().unwrap();
		listener.handle_connect(1, from);
		assert!(listener.pending.lock().unwrap().is_empty());
	}

	#[test]
	fn connect_records_a_pending_handshake_and_challenges() {
		let listener = listener(2);
		let from: SocketAddr = "127.0.0.1:40001".parse().unwrap();
		listener.handle_connect(0xABCD, from);

		let pending = listener.pending.lock().unwrap();
		let entry = pending.get(&from.ip()).expect("pending handshake recorded");
		assert_eq!(entry.client_salt, 0xABCD);
	}

	#[test]
	fn solution_with_wrong_salt_is_dropped_without_consuming_a_port() {
		let listener = listener(2);
		let from: SocketAddr = "127.0.0.1:40002".parse().unwrap();
		listener.handle_connect(1, from);
		assert_eq!(listener.available_ports(), 2);

		listener.handle_solution(0xFFFF_FFFF, from);
		assert_eq!(listener.available_ports(), 2);
		assert_eq!(listener.connection_count(), 0);
	}

	#[test]
	fn sweep_pending_discards_stale_entries() {
		let listener = listener(2);
		let from: SocketAddr = "127.0.0.1:40003".parse().unwrap();
		listener.handle_connect(1, from);
		assert_eq!(listener.pending.lock().unwrap().len(), 1);

		listener.pending.lock().unwrap().get_mut(&from.ip()).unwrap();
		// Can't fast-forward `Instant` without a fake clock; confirm the sweep is a no-op
		// well before the TTL elapses instead, which is the common steady-state case.
		listener.sweep_pending();
		assert_eq!(listener.pending.lock().unwrap().len(), 1);
	}
}
