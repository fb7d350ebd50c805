// Copyright (c) 2024 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

//! An unacknowledged QoS 1 publish is retransmitted with the DUP flag as
//! the first packet after reconnecting with clean-start false.

#![cfg(feature = "qos1")]

mod common;

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use codec::{MqttPacket, PacketId, Properties, PublishAckPacket, QoS};
use kestrel::{Client, ConnectOptions, ErrorKind, TlsOptions};

#[test]
fn test_qos1_retransmission_on_reconnect() {
    let (tx, rx) = mpsc::channel();
    let (port, broker) = common::spawn_broker(move |listener| {
        // First session: swallow the publish and drop the connection
        // before acknowledging it.
        {
            let mut stream = common::accept_connect(&listener, false);
            match common::recv_packet(&mut stream) {
                MqttPacket::Publish(publish) => {
                    assert_eq!(publish.packet_id(), PacketId::new(1));
                    assert!(!publish.dup());
                }
                other => panic!("expected PUBLISH, got {:?}", other.packet_type()),
            }
        }

        // Second session: the retransmission must be the first packet
        // after CONNECT.
        let mut stream = common::accept_connect(&listener, true);
        let replayed = common::recv_packet(&mut stream);
        tx.send(replayed).unwrap();
        common::send_packet(&mut stream, &PublishAckPacket::new(PacketId::new(1)));

        // The acknowledged packet is gone; the next publish is a fresh
        // one.
        tx.send(common::recv_packet(&mut stream)).unwrap();
    });

    let handler = Arc::new(common::TestHandler::new(1));
    let client = Client::new("kestrel-qos1", handler.clone(), None, TlsOptions::new()).unwrap();
    client.set_default_timeout(Duration::from_millis(500));

    let mut options = ConnectOptions::new("127.0.0.1", port);
    options.set_clean_start(false);
    client.connect_to(&options).unwrap();

    client
        .publish("t", b"p", false, QoS::AtLeastOnce, 1, Properties::new())
        .unwrap();

    // The broker dropped the connection; the event loop notices, closes
    // the transport and invokes connection_lost.
    let mut lost = false;
    for _ in 0..20 {
        if client.event_loop().is_err() {
            lost = true;
            break;
        }
    }
    assert!(lost, "event loop never observed the connection loss");
    assert_eq!(handler.lost_reasons().len(), 1);

    // Reconnect with clean-start false replays the stored packet before
    // anything else.
    client.connect_to(&options).unwrap();

    let replayed = match rx.recv_timeout(Duration::from_secs(5)).unwrap() {
        MqttPacket::Publish(publish) => publish,
        other => panic!("expected PUBLISH, got {:?}", other.packet_type()),
    };
    assert!(replayed.dup(), "retransmission must carry the DUP flag");
    assert_eq!(replayed.packet_id(), PacketId::new(1));
    assert_eq!(replayed.message(), b"p");
    assert_eq!(replayed.qos(), QoS::AtLeastOnce);

    // Consume the PUBACK so the slot frees up, then the identifier is
    // reusable.
    client.event_loop().unwrap();
    client
        .publish("t", b"q", false, QoS::AtLeastOnce, 1, Properties::new())
        .unwrap();

    let fresh = match rx.recv_timeout(Duration::from_secs(5)).unwrap() {
        MqttPacket::Publish(publish) => publish,
        other => panic!("expected PUBLISH, got {:?}", other.packet_type()),
    };
    assert!(!fresh.dup());
    assert_eq!(fresh.message(), b"q");

    broker.join().unwrap();
}

struct ResizingHandler {
    max_unacked: AtomicU32,
    lost: Mutex<Vec<codec::ReasonCode>>,
}

impl kestrel::ClientHandler for ResizingHandler {
    fn message_received(
        &self,
        _topic: &str,
        _payload: &[u8],
        _packet_id: u16,
        _properties: &Properties,
    ) {
    }

    fn max_unacked_packets(&self) -> u32 {
        self.max_unacked.load(Ordering::Acquire)
    }

    fn connection_lost(&self, reason: codec::ReasonCode) {
        self.lost.lock().unwrap().push(reason);
    }
}

#[test]
fn test_retransmission_survives_slot_table_resize() {
    let (port, broker) = common::spawn_broker(move |listener| {
        {
            let mut stream = common::accept_connect(&listener, false);
            match common::recv_packet(&mut stream) {
                MqttPacket::Publish(publish) => {
                    assert_eq!(publish.packet_id(), PacketId::new(1));
                }
                other => panic!("expected PUBLISH, got {:?}", other.packet_type()),
            }
        }

        let mut stream = common::accept_connect(&listener, true);
        match common::recv_packet(&mut stream) {
            MqttPacket::Publish(publish) => {
                assert!(publish.dup());
                assert_eq!(publish.packet_id(), PacketId::new(1));
            }
            other => panic!("expected replayed PUBLISH, got {:?}", other.packet_type()),
        }
        common::send_packet(&mut stream, &PublishAckPacket::new(PacketId::new(1)));

        // The acknowledgement freed slot and storage even though the
        // table was resized in between; the identifier is reusable.
        match common::recv_packet(&mut stream) {
            MqttPacket::Publish(publish) => {
                assert!(!publish.dup());
                assert_eq!(publish.packet_id(), PacketId::new(1));
                assert_eq!(publish.message(), b"q");
            }
            other => panic!("expected fresh PUBLISH, got {:?}", other.packet_type()),
        }
    });

    let handler = Arc::new(ResizingHandler {
        max_unacked: AtomicU32::new(1),
        lost: Mutex::new(Vec::new()),
    });
    let client = Client::new("kestrel-resize", handler.clone(), None, TlsOptions::new()).unwrap();
    client.set_default_timeout(Duration::from_millis(500));

    let mut options = ConnectOptions::new("127.0.0.1", port);
    options.set_clean_start(false);
    client.connect_to(&options).unwrap();

    client
        .publish("t", b"p", false, QoS::AtLeastOnce, 1, Properties::new())
        .unwrap();

    let mut lost = false;
    for _ in 0..20 {
        if client.event_loop().is_err() {
            lost = true;
            break;
        }
    }
    assert!(lost, "event loop never observed the connection loss");

    // The embedder grew its in-flight budget before reconnecting.
    handler.max_unacked.store(4, Ordering::Release);
    client.connect_to(&options).unwrap();

    // Process the PUBACK; a failed match would leak the stored body and
    // make the identifier unusable.
    client.event_loop().unwrap();
    client
        .publish("t", b"q", false, QoS::AtLeastOnce, 1, Properties::new())
        .unwrap();

    broker.join().unwrap();
}

#[test]
fn test_publish_after_loss_is_not_connected() {
    let (port, broker) = common::spawn_broker(move |listener| {
        let _stream = common::accept_connect(&listener, false);
        // Connection drops immediately.
    });

    let handler = Arc::new(common::TestHandler::new(1));
    let client = Client::new("kestrel-lost", handler, None, TlsOptions::new()).unwrap();
    client.set_default_timeout(Duration::from_millis(200));
    client
        .connect_to(&ConnectOptions::new("127.0.0.1", port))
        .unwrap();

    let mut lost = false;
    for _ in 0..20 {
        if client.event_loop().is_err() {
            lost = true;
            break;
        }
    }
    assert!(lost);

    let err = client
        .publish("t", b"p", false, QoS::AtLeastOnce, 0, Properties::new())
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotConnected);

    broker.join().unwrap();
}
