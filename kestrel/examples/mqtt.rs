// Copyright (c) 2024 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

use std::sync::Arc;
use std::time::Duration;

use codec::{Properties, QoS, SubscribeTopic};
use kestrel::{Client, ClientHandler, ConnectOptions, TlsOptions};

struct EchoHandler;

impl ClientHandler for EchoHandler {
    fn message_received(
        &self,
        topic: &str,
        payload: &[u8],
        packet_id: u16,
        _properties: &Properties,
    ) {
        println!(
            "[{}] ({}) {}",
            topic,
            packet_id,
            String::from_utf8_lossy(payload)
        );
    }

    fn connection_lost(&self, reason: codec::ReasonCode) {
        eprintln!("connection lost: {:?}", reason);
    }
}

fn main() {
    env_logger::init();

    let client = Client::new("kestrel-example", Arc::new(EchoHandler), None, TlsOptions::new())
        .expect("invalid client id");

    let mut options = ConnectOptions::new("localhost", 1883);
    options.set_keep_alive(Duration::from_secs(30));
    client.connect_to(&options).expect("failed to connect");

    let topic = SubscribeTopic::new("hello/#", QoS::AtLeastOnce).expect("invalid topic filter");
    client
        .subscribe(topic, Properties::new())
        .expect("failed to subscribe");

    client
        .publish(
            "hello/kestrel",
            b"hello from kestrel",
            false,
            QoS::AtLeastOnce,
            0,
            Properties::new(),
        )
        .expect("failed to publish");

    loop {
        if let Err(err) = client.event_loop() {
            eprintln!("event loop stopped: {}", err);
            break;
        }
    }
}
