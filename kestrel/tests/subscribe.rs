// Copyright (c) 2024 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

//! Subscribe and unsubscribe exchanges, including messages interleaved
//! before the acknowledgement arrives.

mod common;

use std::sync::Arc;
use std::time::Duration;

use codec::{
    MqttPacket, PacketId, Properties, PublishPacket, QoS, ReasonCode, SubscribeAckPacket,
    SubscribeTopic, UnsubscribeAckPacket,
};
use kestrel::{Client, ConnectOptions, ErrorKind, TlsOptions};

#[test]
fn test_subscribe_granted_qos() {
    let (port, broker) = common::spawn_broker(move |listener| {
        let mut stream = common::accept_connect(&listener, false);

        let packet_id = match common::recv_packet(&mut stream) {
            MqttPacket::Subscribe(subscribe) => {
                assert_eq!(subscribe.topics()[0].topic(), "sensors/+/temp");
                assert_eq!(subscribe.topics()[0].qos(), QoS::ExactOnce);
                subscribe.packet_id()
            }
            other => panic!("expected SUBSCRIBE, got {:?}", other.packet_type()),
        };

        // A message for another subscription arrives before the SUBACK;
        // the client must process it while waiting.
        let mut publish = PublishPacket::new("sensors/attic/temp", QoS::AtMostOnce, b"4").unwrap();
        publish.set_packet_id(PacketId::new(0));
        common::send_packet(&mut stream, &publish);

        common::send_packet(
            &mut stream,
            &SubscribeAckPacket::new(packet_id, ReasonCode::GrantedQoS1),
        );
    });

    let handler = Arc::new(common::TestHandler::new(1));
    let client = Client::new("kestrel-sub", handler.clone(), None, TlsOptions::new()).unwrap();
    client.set_default_timeout(Duration::from_millis(500));
    client
        .connect_to(&ConnectOptions::new("127.0.0.1", port))
        .unwrap();

    let topic = SubscribeTopic::new("sensors/+/temp", QoS::ExactOnce).unwrap();
    let granted = client.subscribe(topic, Properties::new()).unwrap();
    assert_eq!(granted, QoS::AtLeastOnce);

    // The interleaved message was delivered, not dropped.
    assert_eq!(handler.message_count(), 1);

    broker.join().unwrap();
}

#[test]
fn test_subscribe_rejected() {
    let (port, broker) = common::spawn_broker(move |listener| {
        let mut stream = common::accept_connect(&listener, false);
        let packet_id = match common::recv_packet(&mut stream) {
            MqttPacket::Subscribe(subscribe) => subscribe.packet_id(),
            other => panic!("expected SUBSCRIBE, got {:?}", other.packet_type()),
        };
        common::send_packet(
            &mut stream,
            &SubscribeAckPacket::new(packet_id, ReasonCode::NotAuthorized),
        );
    });

    let handler = Arc::new(common::TestHandler::new(1));
    let client = Client::new("kestrel-sub2", handler, None, TlsOptions::new()).unwrap();
    client.set_default_timeout(Duration::from_millis(500));
    client
        .connect_to(&ConnectOptions::new("127.0.0.1", port))
        .unwrap();

    let topic = SubscribeTopic::new("secret/#", QoS::AtMostOnce).unwrap();
    let err = client.subscribe(topic, Properties::new()).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Reason(ReasonCode::NotAuthorized));

    broker.join().unwrap();
}

#[cfg(feature = "unsubscribe")]
#[test]
fn test_unsubscribe() {
    let (port, broker) = common::spawn_broker(move |listener| {
        let mut stream = common::accept_connect(&listener, false);
        let packet_id = match common::recv_packet(&mut stream) {
            MqttPacket::Unsubscribe(unsubscribe) => {
                assert_eq!(unsubscribe.topics()[0].as_ref(), "sensors/#");
                unsubscribe.packet_id()
            }
            other => panic!("expected UNSUBSCRIBE, got {:?}", other.packet_type()),
        };
        common::send_packet(
            &mut stream,
            &UnsubscribeAckPacket::new(packet_id, ReasonCode::Success),
        );
    });

    let handler = Arc::new(common::TestHandler::new(1));
    let client = Client::new("kestrel-unsub", handler, None, TlsOptions::new()).unwrap();
    client.set_default_timeout(Duration::from_millis(500));
    client
        .connect_to(&ConnectOptions::new("127.0.0.1", port))
        .unwrap();

    client
        .unsubscribe("sensors/#", Properties::new())
        .unwrap();

    broker.join().unwrap();
}

#[test]
fn test_connect_twice_is_already_connected() {
    let (port, broker) = common::spawn_broker(move |listener| {
        let mut stream = common::accept_connect(&listener, false);
        let _bytes = common::read_packet(&mut stream);
    });

    let handler = Arc::new(common::TestHandler::new(1));
    let client = Client::new("kestrel-twice", handler, None, TlsOptions::new()).unwrap();
    client.set_default_timeout(Duration::from_millis(500));

    let options = ConnectOptions::new("127.0.0.1", port);
    client.connect_to(&options).unwrap();
    let err = client.connect_to(&options).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::AlreadyConnected);

    client
        .disconnect(ReasonCode::Success, Properties::new())
        .unwrap();
    broker.join().unwrap();
}
