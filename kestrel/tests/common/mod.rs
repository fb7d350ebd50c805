// Copyright (c) 2024 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

//! Scripted in-process broker used by the integration tests.
//!
//! Each test binds a listener on an ephemeral port and runs a broker script
//! on its own thread, reading and writing raw control packets with the
//! codec.

#![allow(dead_code)]

use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::Mutex;
use std::thread;
use std::time::Duration;

use codec::{
    ByteArray, ConnectAckPacket, DecodePacket, EncodePacket, MqttPacket, Properties, ReasonCode,
};
use kestrel::ClientHandler;

/// Spawn a broker script on a fresh listener. Returns the port to connect
/// to and the join handle; join it at the end of the test so script panics
/// fail the test.
pub fn spawn_broker<F>(script: F) -> (u16, thread::JoinHandle<()>)
where
    F: FnOnce(TcpListener) + Send + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind test listener");
    let port = listener.local_addr().expect("local addr").port();
    let handle = thread::spawn(move || script(listener));
    (port, handle)
}

/// Read one complete control packet from the socket.
pub fn read_packet(stream: &mut TcpStream) -> Vec<u8> {
    let mut byte = [0_u8; 1];
    stream.read_exact(&mut byte).expect("read packet type");
    let mut packet = vec![byte[0]];

    let mut remaining: usize = 0;
    let mut multiplier: usize = 1;
    loop {
        stream.read_exact(&mut byte).expect("read remaining length");
        packet.push(byte[0]);
        remaining += usize::from(byte[0] & 127) * multiplier;
        if byte[0] & 128 == 0 {
            break;
        }
        multiplier *= 128;
    }

    let header_len = packet.len();
    packet.resize(header_len + remaining, 0);
    stream
        .read_exact(&mut packet[header_len..])
        .expect("read packet body");
    packet
}

/// Decode one control packet.
pub fn decode(bytes: &[u8]) -> MqttPacket {
    let mut ba = ByteArray::new(bytes);
    MqttPacket::decode(&mut ba).expect("decode packet")
}

/// Read and decode one control packet.
pub fn recv_packet(stream: &mut TcpStream) -> MqttPacket {
    let bytes = read_packet(stream);
    decode(&bytes)
}

/// Encode and write one control packet.
pub fn send_packet<P: EncodePacket>(stream: &mut TcpStream, packet: &P) {
    let mut buf = Vec::new();
    packet.encode(&mut buf).expect("encode packet");
    stream.write_all(&buf).expect("write packet");
}

/// Accept one connection, consume its CONNECT and answer with a successful
/// CONNACK.
pub fn accept_connect(listener: &TcpListener, session_present: bool) -> TcpStream {
    let (mut stream, _addr) = listener.accept().expect("accept connection");
    stream
        .set_read_timeout(Some(Duration::from_secs(10)))
        .expect("set read timeout");
    match recv_packet(&mut stream) {
        MqttPacket::Connect(_connect) => {}
        other => panic!("expected CONNECT, got {:?}", other.packet_type()),
    }
    send_packet(
        &mut stream,
        &ConnectAckPacket::new(session_present, ReasonCode::Success),
    );
    stream
}

/// Callback recorder shared by most tests.
#[derive(Default)]
pub struct TestHandler {
    pub messages: Mutex<Vec<(String, Vec<u8>, u16)>>,
    pub lost: Mutex<Vec<ReasonCode>>,
    max_unacked: u32,
}

impl TestHandler {
    pub fn new(max_unacked: u32) -> Self {
        Self {
            messages: Mutex::new(Vec::new()),
            lost: Mutex::new(Vec::new()),
            max_unacked,
        }
    }

    pub fn message_count(&self) -> usize {
        self.messages.lock().unwrap().len()
    }

    pub fn lost_reasons(&self) -> Vec<ReasonCode> {
        self.lost.lock().unwrap().clone()
    }
}

impl ClientHandler for TestHandler {
    fn message_received(
        &self,
        topic: &str,
        payload: &[u8],
        packet_id: u16,
        _properties: &Properties,
    ) {
        self.messages
            .lock()
            .unwrap()
            .push((topic.to_string(), payload.to_vec(), packet_id));
    }

    fn max_unacked_packets(&self) -> u32 {
        self.max_unacked
    }

    fn connection_lost(&self, reason: ReasonCode) {
        self.lost.lock().unwrap().push(reason);
    }
}
