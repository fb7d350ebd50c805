// Copyright (c) 2024 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

//! Inbound QoS 2 delivery is exactly-once: a duplicate PUBLISH arriving
//! before PUBREL must not be delivered again, and the slot frees up after
//! PUBCOMP.

#![cfg(feature = "qos2")]

mod common;

use std::sync::mpsc;
use std::sync::Arc;
use std::time::Duration;

use codec::{
    MqttPacket, PacketId, Properties, PublishPacket, PublishReleasePacket, QoS, ReasonCode,
};
use kestrel::{Client, ConnectOptions, TlsOptions};

#[test]
fn test_qos2_exactly_once_delivery() {
    let (tx, rx) = mpsc::channel();
    let (port, broker) = common::spawn_broker(move |listener| {
        let mut stream = common::accept_connect(&listener, false);

        let mut publish = PublishPacket::new("t", QoS::ExactOnce, b"m").unwrap();
        publish.set_packet_id(PacketId::new(7));
        common::send_packet(&mut stream, &publish);

        // PUBREC for the first delivery.
        tx.send(common::recv_packet(&mut stream)).unwrap();

        // Duplicate delivery before PUBREL.
        let mut duplicate = PublishPacket::new("t", QoS::ExactOnce, b"m").unwrap();
        duplicate.set_packet_id(PacketId::new(7));
        duplicate.set_dup(true).unwrap();
        common::send_packet(&mut stream, &duplicate);

        // PUBREC for the duplicate.
        tx.send(common::recv_packet(&mut stream)).unwrap();

        common::send_packet(&mut stream, &PublishReleasePacket::new(PacketId::new(7)));

        // PUBCOMP ends the exchange.
        tx.send(common::recv_packet(&mut stream)).unwrap();

        // The slot is free again: a new exchange with the same identifier
        // delivers again.
        let mut again = PublishPacket::new("t", QoS::ExactOnce, b"n").unwrap();
        again.set_packet_id(PacketId::new(7));
        common::send_packet(&mut stream, &again);
        tx.send(common::recv_packet(&mut stream)).unwrap();
    });

    let handler = Arc::new(common::TestHandler::new(1));
    let client = Client::new("kestrel-qos2", handler.clone(), None, TlsOptions::new()).unwrap();
    client.set_default_timeout(Duration::from_millis(500));
    client
        .connect_to(&ConnectOptions::new("127.0.0.1", port))
        .unwrap();

    // One iteration per inbound packet.
    for _ in 0..4 {
        client.event_loop().unwrap();
    }

    match rx.recv_timeout(Duration::from_secs(5)).unwrap() {
        MqttPacket::PublishReceived(received) => {
            assert_eq!(received.packet_id(), PacketId::new(7));
            assert_eq!(received.reason_code(), ReasonCode::Success);
        }
        other => panic!("expected PUBREC, got {:?}", other.packet_type()),
    }
    match rx.recv_timeout(Duration::from_secs(5)).unwrap() {
        MqttPacket::PublishReceived(received) => {
            assert_eq!(received.packet_id(), PacketId::new(7));
        }
        other => panic!("expected PUBREC for duplicate, got {:?}", other.packet_type()),
    }
    match rx.recv_timeout(Duration::from_secs(5)).unwrap() {
        MqttPacket::PublishComplete(complete) => {
            assert_eq!(complete.packet_id(), PacketId::new(7));
        }
        other => panic!("expected PUBCOMP, got {:?}", other.packet_type()),
    }
    match rx.recv_timeout(Duration::from_secs(5)).unwrap() {
        MqttPacket::PublishReceived(received) => {
            assert_eq!(received.packet_id(), PacketId::new(7));
        }
        other => panic!("expected PUBREC for new exchange, got {:?}", other.packet_type()),
    }

    // Delivered once for the first exchange, once for the second; the
    // duplicate was filtered.
    let messages = handler.messages.lock().unwrap();
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[0].1, b"m");
    assert_eq!(messages[1].1, b"n");

    broker.join().unwrap();
}

#[test]
fn test_unknown_pubrel_gets_pubcomp_not_found() {
    let (tx, rx) = mpsc::channel();
    let (port, broker) = common::spawn_broker(move |listener| {
        let mut stream = common::accept_connect(&listener, false);
        common::send_packet(&mut stream, &PublishReleasePacket::new(PacketId::new(9)));
        tx.send(common::recv_packet(&mut stream)).unwrap();
    });

    let handler = Arc::new(common::TestHandler::new(1));
    let client = Client::new("kestrel-rel", handler, None, TlsOptions::new()).unwrap();
    client.set_default_timeout(Duration::from_millis(500));
    client
        .connect_to(&ConnectOptions::new("127.0.0.1", port))
        .unwrap();
    client.event_loop().unwrap();

    match rx.recv_timeout(Duration::from_secs(5)).unwrap() {
        MqttPacket::PublishComplete(complete) => {
            assert_eq!(complete.packet_id(), PacketId::new(9));
            assert_eq!(
                complete.reason_code(),
                ReasonCode::PacketIdentifierNotFound
            );
        }
        other => panic!("expected PUBCOMP, got {:?}", other.packet_type()),
    }

    broker.join().unwrap();
}
