// Copyright (c) 2024 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

//! Extended authentication: the server interleaves an AUTH exchange into
//! the connect handshake, the embedder answers from the auth callback, and
//! the session ends up Connected.

#![cfg(feature = "auth")]

mod common;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use codec::{
    AuthPacket, BinaryData, MqttPacket, Properties, Property, PropertyType, ReasonCode, StringData,
};
use kestrel::{Client, ClientHandler, ClientStatus, ConnectOptions, TlsOptions};

struct AuthHandler {
    client: Mutex<Option<Client>>,
    events: Mutex<Vec<(ReasonCode, String)>>,
}

impl AuthHandler {
    fn new() -> Self {
        Self {
            client: Mutex::new(None),
            events: Mutex::new(Vec::new()),
        }
    }

    fn bind(&self, client: &Client) {
        *self.client.lock().unwrap() = Some(client.clone());
    }
}

impl ClientHandler for AuthHandler {
    fn message_received(
        &self,
        _topic: &str,
        _payload: &[u8],
        _packet_id: u16,
        _properties: &Properties,
    ) {
    }

    fn auth_received(
        &self,
        reason: ReasonCode,
        method: &str,
        _data: &[u8],
        _properties: &Properties,
    ) -> bool {
        self.events
            .lock()
            .unwrap()
            .push((reason, method.to_string()));
        if reason == ReasonCode::ContinueAuthentication {
            // Continuing from inside the callback exercises the
            // reentrancy contract.
            let client = self.client.lock().unwrap().clone().expect("client bound");
            client
                .auth(
                    ReasonCode::ContinueAuthentication,
                    "SCRAM",
                    b"client-final",
                    Properties::new(),
                )
                .expect("auth continuation");
        }
        true
    }
}

#[test]
fn test_auth_continuation_to_connected() {
    let (port, broker) = common::spawn_broker(move |listener| {
        let (mut stream, _addr) = listener.accept().expect("accept");
        stream
            .set_read_timeout(Some(Duration::from_secs(10)))
            .unwrap();

        // CONNECT must carry the authentication method.
        match common::recv_packet(&mut stream) {
            MqttPacket::Connect(connect) => {
                let method = connect.properties().find(PropertyType::AuthenticationMethod);
                assert!(
                    matches!(method, Some(Property::AuthenticationMethod(m)) if m.as_ref() == "SCRAM")
                );
            }
            other => panic!("expected CONNECT, got {:?}", other.packet_type()),
        }

        // Challenge the client.
        let mut challenge = AuthPacket::new();
        challenge.set_reason_code(ReasonCode::ContinueAuthentication);
        challenge.properties_mut().push(Property::AuthenticationMethod(
            StringData::from("SCRAM").unwrap(),
        ));
        challenge.properties_mut().push(Property::AuthenticationData(
            BinaryData::from_slice(b"server-first").unwrap(),
        ));
        common::send_packet(&mut stream, &challenge);

        // The continuation from the embedder.
        match common::recv_packet(&mut stream) {
            MqttPacket::Auth(auth) => {
                assert_eq!(auth.reason_code(), ReasonCode::ContinueAuthentication);
                let data = auth.properties().find(PropertyType::AuthenticationData);
                assert!(
                    matches!(data, Some(Property::AuthenticationData(d)) if d.as_ref() == b"client-final")
                );
            }
            other => panic!("expected AUTH, got {:?}", other.packet_type()),
        }

        // Authentication done, accept the session.
        common::send_packet(
            &mut stream,
            &codec::ConnectAckPacket::new(false, ReasonCode::Success),
        );

        // Hold the socket open until the client disconnects.
        let _bytes = common::read_packet(&mut stream);
    });

    let handler = Arc::new(AuthHandler::new());
    let client = Client::new("kestrel-auth", handler.clone(), None, TlsOptions::new()).unwrap();
    handler.bind(&client);
    client.set_default_timeout(Duration::from_millis(500));

    let mut connect_properties = Properties::new();
    connect_properties.push(Property::AuthenticationMethod(
        StringData::from("SCRAM").unwrap(),
    ));
    connect_properties.push(Property::AuthenticationData(
        BinaryData::from_slice(b"client-first").unwrap(),
    ));
    let mut options = ConnectOptions::new("127.0.0.1", port);
    options.set_properties(connect_properties);

    client.connect_to(&options).unwrap();
    assert_eq!(client.status(), ClientStatus::Connected);

    let events = handler.events.lock().unwrap().clone();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].0, ReasonCode::ContinueAuthentication);
    assert_eq!(events[0].1, "SCRAM");
    drop(events);

    client
        .disconnect(ReasonCode::Success, Properties::new())
        .unwrap();
    broker.join().unwrap();
}
