//! End-to-end handshake, transfer and teardown between one client and one listener.
//!
//! Exercises real `UdpSocket`s and background threads on loopback, synchronizing on polled
//! state rather than a fixed sleep, matching scenarios S1 ("Successful handshake") and S7
//! ("Port recycling") from the design notes.

use saltline::bit::{BitError, BitRead, BitWrite};
use saltline::connection::{ConnectStatus, ConnectionHandler, ConnectionState};
use saltline::listener::AcceptorHandler;
use saltline::{Channel, Config, Connection, Listener, Packet, PacketFactory};

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Message {
	Ping(u32),
	Pong(u32),
}

impl Packet for Message {
	fn id(&self) -> u8 {
		match self {
			Message::Ping(_) => 0,
			Message::Pong(_) => 1,
		}
	}

	fn write_body(&self, writer: &mut dyn BitWrite) {
		match self {
			Message::Ping(value) | Message::Pong(value) => writer.write_u16(*value as u16),
		}
	}

	fn read_body(&mut self, reader: &mut dyn BitRead) -> Result<(), BitError> {
		let value = reader.read_u16()? as u32;
		*self = match self {
			Message::Ping(_) => Message::Ping(value),
			Message::Pong(_) => Message::Pong(value),
		};
		Ok(())
	}
}

struct MessageFactory;

impl PacketFactory<Message> for MessageFactory {
	fn type_count(&self) -> u8 {
		2
	}

	fn create(&self, id: u8) -> Option<Message> {
		match id {
			0 => Some(Message::Ping(0)),
			1 => Some(Message::Pong(0)),
			_ => None,
		}
	}
}

#[derive(Default)]
struct ClientHandler {
	status: Mutex<Option<ConnectStatus>>,
	received: Mutex<Vec<Message>>,
}

impl ConnectionHandler<Message> for ClientHandler {
	fn handle_connected(&self, status: ConnectStatus) {
		*self.status.lock().unwrap() = Some(status);
	}

	fn handle_packet(&self, packet: Message) {
		self.received.lock().unwrap().push(packet);
	}
}

#[derive(Default)]
struct ServerHandler {
	received: Mutex<Vec<Message>>,
}

impl ConnectionHandler<Message> for ServerHandler {
	fn handle_packet(&self, packet: Message) {
		if let Message::Ping(value) = packet {
			self.received.lock().unwrap().push(Message::Ping(value));
		}
	}
}

struct Acceptor {
	server_handler: Arc<ServerHandler>,
	accepted: Mutex<Vec<Arc<Connection<Message>>>>,
}

impl AcceptorHandler<Message> for Acceptor {
	fn connection_handler(&self) -> Arc<dyn ConnectionHandler<Message>> {
		self.server_handler.clone()
	}

	fn handle_connection(&self, connection: Arc<Connection<Message>>) {
		self.accepted.lock().unwrap().push(connection);
	}
}

fn test_config() -> Config {
	Config { resend_period: Duration::from_millis(20), idle_timeout: Duration::from_millis(300), retry_amount: 10 }
}

fn wait_until(mut predicate: impl FnMut() -> bool, timeout: Duration) -> bool {
	let deadline = Instant::now() + timeout;
	while Instant::now() < deadline {
		if predicate() {
			return true;
		}
		std::thread::sleep(Duration::from_millis(5));
	}
	predicate()
}

#[test]
fn client_connects_exchanges_packets_and_disconnects() {
	let server_handler = Arc::new(ServerHandler::default());
	let acceptor = Arc::new(Acceptor { server_handler: server_handler.clone(), accepted: Mutex::new(Vec::new()) });
	let listener = Listener::bind(0, 4, Arc::new(MessageFactory), acceptor.clone(), test_config()).unwrap();
	listener.start();
	let listener_addr: SocketAddr = ([127, 0, 0, 1], listener.local_port()).into();

	let client_handler = Arc::new(ClientHandler::default());
	let client = Connection::new(Arc::new(MessageFactory), client_handler.clone(), test_config()).unwrap();
	client.connect(listener_addr).unwrap();

	assert!(
		wait_until(|| client.state() == ConnectionState::Connected, Duration::from_secs(2)),
		"client never reached Connected"
	);
	assert!(
		wait_until(|| listener.connection_count() == 1, Duration::from_secs(1)),
		"listener never recorded the accepted connection"
	);
	assert_eq!(listener.available_ports(), 3);
	assert_eq!(*client_handler.status.lock().unwrap(), Some(ConnectStatus::Success));

	client.send(&Message::Ping(7)).unwrap();

	assert!(
		wait_until(|| server_handler.received.lock().unwrap().contains(&Message::Ping(7)), Duration::from_secs(1)),
		"server never received the client's ping"
	);

	let server_connection = acceptor.accepted.lock().unwrap()[0].clone();
	server_connection.set_packet_channel(0, Channel::Unreliable);
	server_connection.send(&Message::Pong(8)).unwrap();

	assert!(
		wait_until(|| client_handler.received.lock().unwrap().contains(&Message::Pong(8)), Duration::from_secs(1)),
		"client never received the server's pong"
	);

	client.disconnect();
	assert!(wait_until(|| listener.connection_count() == 0, Duration::from_secs(2)), "listener never recycled the connection");
	assert_eq!(listener.available_ports(), 4);
}

#[test]
fn second_client_is_rejected_once_the_port_pool_is_exhausted() {
	let acceptor = Arc::new(Acceptor { server_handler: Arc::new(ServerHandler::default()), accepted: Mutex::new(Vec::new()) });
	let listener = Listener::bind(0, 1, Arc::new(MessageFactory), acceptor, test_config()).unwrap();
	listener.start();
	let listener_addr: SocketAddr = ([127, 0, 0, 1], listener.local_port()).into();

	let first_handler = Arc::new(ClientHandler::default());
	let first = Connection::new(Arc::new(MessageFactory), first_handler.clone(), test_config()).unwrap();
	first.connect(listener_addr).unwrap();
	assert!(wait_until(|| first.state() == ConnectionState::Connected, Duration::from_secs(2)));
	assert_eq!(listener.available_ports(), 0);

	let second_handler = Arc::new(ClientHandler::default());
	let second = Connection::new(Arc::new(MessageFactory), second_handler.clone(), test_config()).unwrap();
	second.connect(listener_addr).unwrap();

	assert!(
		wait_until(|| second.state() == ConnectionState::Disconnected, Duration::from_secs(2)),
		"second client should have been rejected and torn down"
	);
	assert_eq!(*second_handler.status.lock().unwrap(), Some(ConnectStatus::Disconnect));

	first.disconnect();
}
