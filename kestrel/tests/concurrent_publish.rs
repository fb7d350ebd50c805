// Copyright (c) 2024 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

//! The write path is serialized: concurrent publishers produce well-framed
//! packets with no interleaving, and publishing from inside the message
//! callback does not deadlock.

mod common;

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use codec::{MqttPacket, PacketId, Properties, PublishPacket, QoS};
use kestrel::{Client, ClientHandler, ConnectOptions, TlsOptions};

const WRITERS: usize = 8;
const MESSAGES_PER_WRITER: usize = 10;

#[test]
fn test_concurrent_publishers_do_not_interleave() {
    let (tx, rx) = std::sync::mpsc::channel();
    let (port, broker) = common::spawn_broker(move |listener| {
        let mut stream = common::accept_connect(&listener, false);
        for _ in 0..WRITERS * MESSAGES_PER_WRITER {
            // read_packet panics on any framing damage, so every packet
            // arriving whole is the property under test.
            match common::recv_packet(&mut stream) {
                MqttPacket::Publish(publish) => {
                    tx.send(String::from_utf8(publish.message().to_vec()).unwrap())
                        .unwrap();
                }
                other => panic!("expected PUBLISH, got {:?}", other.packet_type()),
            }
        }
    });

    let handler = Arc::new(common::TestHandler::new(1));
    let client = Client::new("kestrel-many", handler, None, TlsOptions::new()).unwrap();
    client.set_default_timeout(Duration::from_millis(500));
    client
        .connect_to(&ConnectOptions::new("127.0.0.1", port))
        .unwrap();

    let mut workers = Vec::new();
    for writer in 0..WRITERS {
        let client = client.clone();
        workers.push(thread::spawn(move || {
            for seq in 0..MESSAGES_PER_WRITER {
                let payload = format!("{}-{}", writer, seq);
                client
                    .publish(
                        "load",
                        payload.as_bytes(),
                        false,
                        QoS::AtMostOnce,
                        0,
                        Properties::new(),
                    )
                    .unwrap();
            }
        }));
    }
    for worker in workers {
        worker.join().unwrap();
    }

    let mut seen = HashSet::new();
    for _ in 0..WRITERS * MESSAGES_PER_WRITER {
        let payload = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(seen.insert(payload), "payload arrived twice");
    }
    assert_eq!(seen.len(), WRITERS * MESSAGES_PER_WRITER);

    broker.join().unwrap();
}

struct ReplyHandler {
    client: Mutex<Option<Client>>,
}

impl ClientHandler for ReplyHandler {
    fn message_received(
        &self,
        _topic: &str,
        payload: &[u8],
        _packet_id: u16,
        _properties: &Properties,
    ) {
        // Publishing from inside the callback must not deadlock.
        let client = self.client.lock().unwrap().clone().expect("client bound");
        let mut reply = b"re:".to_vec();
        reply.extend_from_slice(payload);
        client
            .publish("replies", &reply, false, QoS::AtMostOnce, 0, Properties::new())
            .expect("publish from callback");
    }
}

#[test]
fn test_publish_from_message_callback() {
    let (port, broker) = common::spawn_broker(move |listener| {
        let mut stream = common::accept_connect(&listener, false);

        let mut request = PublishPacket::new("requests", QoS::AtMostOnce, b"ping").unwrap();
        request.set_packet_id(PacketId::new(0));
        common::send_packet(&mut stream, &request);

        match common::recv_packet(&mut stream) {
            MqttPacket::Publish(publish) => {
                assert_eq!(publish.topic(), "replies");
                assert_eq!(publish.message(), b"re:ping");
            }
            other => panic!("expected reply PUBLISH, got {:?}", other.packet_type()),
        }
    });

    let handler = Arc::new(ReplyHandler {
        client: Mutex::new(None),
    });
    let client = Client::new("kestrel-reent", handler.clone(), None, TlsOptions::new()).unwrap();
    *handler.client.lock().unwrap() = Some(client.clone());
    client.set_default_timeout(Duration::from_millis(500));
    client
        .connect_to(&ConnectOptions::new("127.0.0.1", port))
        .unwrap();

    client.event_loop().unwrap();

    broker.join().unwrap();
}
