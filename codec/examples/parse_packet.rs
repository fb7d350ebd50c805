// Copyright (c) 2023 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

use kestrel_codec::{ByteArray, DecodePacket, EncodePacket, MqttPacket, PacketId, PublishPacket, QoS};

fn main() {
    let mut packet = PublishPacket::new("sensors/kitchen/temp", QoS::AtLeastOnce, b"21.5").unwrap();
    packet.set_packet_id(PacketId::new(42));

    let mut buf = Vec::new();
    let len = packet.encode(&mut buf).unwrap();
    println!("encoded {} bytes: {:02x?}", len, buf);

    let mut ba = ByteArray::new(&buf);
    let decoded = MqttPacket::decode(&mut ba).unwrap();
    println!("decoded: {:?}", decoded);
}
