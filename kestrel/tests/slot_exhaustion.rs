// Copyright (c) 2024 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

//! With one in-flight slot, a second unacknowledged QoS 1 publish fails
//! with TransientPacket; once the PUBACK arrives a retry succeeds.

#![cfg(feature = "qos1")]

mod common;

use std::sync::mpsc;
use std::sync::Arc;
use std::time::Duration;

use codec::{MqttPacket, Properties, PublishAckPacket, QoS};
use kestrel::{Client, ConnectOptions, ErrorKind, TlsOptions};

#[test]
fn test_slot_exhaustion_and_retry() {
    let (tx, rx) = mpsc::channel();
    let (port, broker) = common::spawn_broker(move |listener| {
        let mut stream = common::accept_connect(&listener, false);

        let first = match common::recv_packet(&mut stream) {
            MqttPacket::Publish(publish) => publish,
            other => panic!("expected PUBLISH, got {:?}", other.packet_type()),
        };
        tx.send(first.packet_id()).unwrap();
        common::send_packet(&mut stream, &PublishAckPacket::new(first.packet_id()));

        let second = match common::recv_packet(&mut stream) {
            MqttPacket::Publish(publish) => publish,
            other => panic!("expected second PUBLISH, got {:?}", other.packet_type()),
        };
        tx.send(second.packet_id()).unwrap();
    });

    let handler = Arc::new(common::TestHandler::new(1));
    let client = Client::new("kestrel-slots", handler, None, TlsOptions::new()).unwrap();
    client.set_default_timeout(Duration::from_millis(500));
    client
        .connect_to(&ConnectOptions::new("127.0.0.1", port))
        .unwrap();

    client
        .publish("t", b"one", false, QoS::AtLeastOnce, 0, Properties::new())
        .unwrap();

    // The only slot is taken until the PUBACK is processed.
    let err = client
        .publish("t", b"two", false, QoS::AtLeastOnce, 0, Properties::new())
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::TransientPacket);

    let first_id = rx.recv_timeout(Duration::from_secs(5)).unwrap();
    client.event_loop().unwrap();

    client
        .publish("t", b"two", false, QoS::AtLeastOnce, 0, Properties::new())
        .unwrap();
    let second_id = rx.recv_timeout(Duration::from_secs(5)).unwrap();

    // Identifiers in use at the same time are distinct; this one was free
    // again.
    assert_ne!(first_id.value(), 0);
    assert_ne!(second_id.value(), 0);
    assert_ne!(first_id, second_id);

    broker.join().unwrap();
}
