// Copyright (c) 2024 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

//! A minimal, embeddable MQTT v5 client.
//!
//! One dedicated thread drives [`Client::event_loop`]; any number of threads
//! may call [`Client::publish`]. `QoS` 1 and 2 packets are tracked in a
//! fixed-size in-flight table and retransmitted on reconnect from a
//! [`PacketStorage`] backend.
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use codec::{Properties, QoS, SubscribeTopic};
//! use kestrel::{Client, ClientHandler, ConnectOptions, TlsOptions};
//!
//! struct Printer;
//!
//! impl ClientHandler for Printer {
//!     fn message_received(
//!         &self,
//!         topic: &str,
//!         payload: &[u8],
//!         _packet_id: u16,
//!         _properties: &Properties,
//!     ) {
//!         println!("{}: {:?}", topic, payload);
//!     }
//! }
//!
//! let client = Client::new("kestrel-demo", Arc::new(Printer), None, TlsOptions::new()).unwrap();
//! client.connect_to(&ConnectOptions::new("localhost", 1883)).unwrap();
//! let topic = SubscribeTopic::new("sensors/#", QoS::AtMostOnce).unwrap();
//! client.subscribe(topic, Properties::new()).unwrap();
//! loop {
//!     if client.event_loop().is_err() {
//!         break;
//!     }
//! }
//! ```

mod client;
mod connect_options;
mod error;
mod handler;
mod inflight;
mod status;
mod storage;
mod stream;

pub use client::Client;
pub use connect_options::{ConnectOptions, WillMessage};
pub use error::{Error, ErrorKind};
pub use handler::ClientHandler;
pub use status::ClientStatus;
pub use storage::{NullStorage, PacketStorage, RingBufferStorage};
pub use stream::{Stream, TlsOptions};
