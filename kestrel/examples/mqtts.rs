// Copyright (c) 2024 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

use std::sync::Arc;

use codec::{Properties, QoS, SubscribeTopic};
use kestrel::{Client, ClientHandler, ConnectOptions, TlsOptions};

struct PrintHandler;

impl ClientHandler for PrintHandler {
    fn message_received(
        &self,
        topic: &str,
        payload: &[u8],
        _packet_id: u16,
        _properties: &Properties,
    ) {
        println!("[{}] {}", topic, String::from_utf8_lossy(payload));
    }
}

fn main() {
    env_logger::init();

    // Pin the broker certificate by passing its DER bytes instead:
    //
    //   let mut tls = TlsOptions::new();
    //   tls.set_broker_cert(&std::fs::read("broker.der").unwrap());
    let tls = TlsOptions::new();

    let client =
        Client::new("kestrel-tls-example", Arc::new(PrintHandler), None, tls).expect("client id");

    let mut options = ConnectOptions::new("test.mosquitto.org", 8883);
    options.set_use_tls(true);
    client.connect_to(&options).expect("failed to connect");

    let topic = SubscribeTopic::new("$SYS/broker/uptime", QoS::AtMostOnce).expect("topic");
    client
        .subscribe(topic, Properties::new())
        .expect("failed to subscribe");

    loop {
        if let Err(err) = client.event_loop() {
            eprintln!("event loop stopped: {}", err);
            break;
        }
    }
}
