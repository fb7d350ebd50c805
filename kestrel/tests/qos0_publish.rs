// Copyright (c) 2024 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

//! A QoS 0 publish produces a single PUBLISH packet on the wire, with no
//! acknowledgement exchange and nothing stored.

mod common;

use std::sync::mpsc;
use std::sync::Arc;
use std::time::Duration;

use codec::{MqttPacket, Properties, QoS, ReasonCode};
use kestrel::{Client, ClientStatus, ConnectOptions, TlsOptions};

#[test]
fn test_qos0_publish() {
    let (tx, rx) = mpsc::channel();
    let (port, broker) = common::spawn_broker(move |listener| {
        let mut stream = common::accept_connect(&listener, false);
        tx.send(common::recv_packet(&mut stream)).unwrap();
        tx.send(common::recv_packet(&mut stream)).unwrap();
    });

    let handler = Arc::new(common::TestHandler::new(1));
    let client = Client::new("kestrel-qos0", handler.clone(), None, TlsOptions::new()).unwrap();
    client.set_default_timeout(Duration::from_millis(500));

    client
        .connect_to(&ConnectOptions::new("127.0.0.1", port))
        .unwrap();
    assert_eq!(client.status(), ClientStatus::Connected);

    client
        .publish("a", b"x", false, QoS::AtMostOnce, 0, Properties::new())
        .unwrap();
    client
        .disconnect(ReasonCode::Success, Properties::new())
        .unwrap();

    let publish = match rx.recv_timeout(Duration::from_secs(5)).unwrap() {
        MqttPacket::Publish(publish) => publish,
        other => panic!("expected PUBLISH, got {:?}", other.packet_type()),
    };
    assert_eq!(publish.topic(), "a");
    assert_eq!(publish.message(), b"x");
    assert_eq!(publish.qos(), QoS::AtMostOnce);
    assert!(!publish.dup());
    assert_eq!(publish.packet_id().value(), 0);

    // The next packet is the DISCONNECT; no ack exchange happened in
    // between.
    match rx.recv_timeout(Duration::from_secs(5)).unwrap() {
        MqttPacket::Disconnect(_disconnect) => {}
        other => panic!("expected DISCONNECT, got {:?}", other.packet_type()),
    }

    assert_eq!(client.status(), ClientStatus::Disconnected);
    broker.join().unwrap();
}
