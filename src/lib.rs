//! Reliable message channels over UDP, built on a salted four-way handshake.

#![warn(clippy::all)]
#![cfg_attr(debug_assertions, allow(dead_code, unused_imports, unused_variables))]

pub mod bit;
pub mod channel;
pub mod config;
pub mod connection;
pub mod frame;
pub mod listener;
pub mod packet;
pub mod salt;

pub use channel::Channel;
pub use config::Config;
pub use connection::{Connection, ConnectionError};
pub use listener::{Listener, ListenerError};
pub use packet::{Packet, PacketFactory};
