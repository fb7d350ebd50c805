// Copyright (c) 2023 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

use std::convert::TryFrom;

use crate::{
    AuthPacket, ByteArray, ConnectAckPacket, ConnectPacket, DecodeError, DecodePacket,
    DisconnectPacket, EncodeError, EncodePacket, Packet, PacketType, PingRequestPacket,
    PingResponsePacket, PublishAckPacket, PublishCompletePacket, PublishPacket,
    PublishReceivedPacket, PublishReleasePacket, SubscribeAckPacket, SubscribePacket,
    UnsubscribeAckPacket, UnsubscribePacket,
};

/// Any control packet, dispatched on the packet type bits in the fixed
/// header.
///
/// This is the type handed around by event loops which have to accept
/// whatever the peer sends next.
#[allow(clippy::module_name_repetitions)]
#[derive(Clone, Debug, PartialEq)]
pub enum MqttPacket {
    Connect(ConnectPacket),
    ConnectAck(ConnectAckPacket),
    Publish(PublishPacket),
    PublishAck(PublishAckPacket),
    PublishReceived(PublishReceivedPacket),
    PublishRelease(PublishReleasePacket),
    PublishComplete(PublishCompletePacket),
    Subscribe(SubscribePacket),
    SubscribeAck(SubscribeAckPacket),
    Unsubscribe(UnsubscribePacket),
    UnsubscribeAck(UnsubscribeAckPacket),
    PingRequest(PingRequestPacket),
    PingResponse(PingResponsePacket),
    Disconnect(DisconnectPacket),
    Auth(AuthPacket),
}

impl MqttPacket {
    /// Get type of inner packet.
    #[must_use]
    pub fn packet_type(&self) -> PacketType {
        match self {
            Self::Connect(packet) => packet.packet_type(),
            Self::ConnectAck(packet) => packet.packet_type(),
            Self::Publish(packet) => packet.packet_type(),
            Self::PublishAck(packet) => packet.packet_type(),
            Self::PublishReceived(packet) => packet.packet_type(),
            Self::PublishRelease(packet) => packet.packet_type(),
            Self::PublishComplete(packet) => packet.packet_type(),
            Self::Subscribe(packet) => packet.packet_type(),
            Self::SubscribeAck(packet) => packet.packet_type(),
            Self::Unsubscribe(packet) => packet.packet_type(),
            Self::UnsubscribeAck(packet) => packet.packet_type(),
            Self::PingRequest(packet) => packet.packet_type(),
            Self::PingResponse(packet) => packet.packet_type(),
            Self::Disconnect(packet) => packet.packet_type(),
            Self::Auth(packet) => packet.packet_type(),
        }
    }
}

impl DecodePacket for MqttPacket {
    fn decode(ba: &mut ByteArray) -> Result<Self, DecodeError> {
        // The packet decoders consume the fixed header themselves, so the
        // type byte is only peeked at here.
        let flag = ba.peek_byte()?;
        let packet_type = PacketType::try_from(flag)?;
        match packet_type {
            PacketType::Connect => ConnectPacket::decode(ba).map(Self::Connect),
            PacketType::ConnectAck => ConnectAckPacket::decode(ba).map(Self::ConnectAck),
            PacketType::Publish { .. } => PublishPacket::decode(ba).map(Self::Publish),
            PacketType::PublishAck => PublishAckPacket::decode(ba).map(Self::PublishAck),
            PacketType::PublishReceived => {
                PublishReceivedPacket::decode(ba).map(Self::PublishReceived)
            }
            PacketType::PublishRelease => {
                PublishReleasePacket::decode(ba).map(Self::PublishRelease)
            }
            PacketType::PublishComplete => {
                PublishCompletePacket::decode(ba).map(Self::PublishComplete)
            }
            PacketType::Subscribe => SubscribePacket::decode(ba).map(Self::Subscribe),
            PacketType::SubscribeAck => SubscribeAckPacket::decode(ba).map(Self::SubscribeAck),
            PacketType::Unsubscribe => UnsubscribePacket::decode(ba).map(Self::Unsubscribe),
            PacketType::UnsubscribeAck => {
                UnsubscribeAckPacket::decode(ba).map(Self::UnsubscribeAck)
            }
            PacketType::PingRequest => PingRequestPacket::decode(ba).map(Self::PingRequest),
            PacketType::PingResponse => PingResponsePacket::decode(ba).map(Self::PingResponse),
            PacketType::Disconnect => DisconnectPacket::decode(ba).map(Self::Disconnect),
            PacketType::Auth => AuthPacket::decode(ba).map(Self::Auth),
        }
    }
}

impl EncodePacket for MqttPacket {
    fn encode(&self, buf: &mut Vec<u8>) -> Result<usize, EncodeError> {
        match self {
            Self::Connect(packet) => packet.encode(buf),
            Self::ConnectAck(packet) => packet.encode(buf),
            Self::Publish(packet) => packet.encode(buf),
            Self::PublishAck(packet) => packet.encode(buf),
            Self::PublishReceived(packet) => packet.encode(buf),
            Self::PublishRelease(packet) => packet.encode(buf),
            Self::PublishComplete(packet) => packet.encode(buf),
            Self::Subscribe(packet) => packet.encode(buf),
            Self::SubscribeAck(packet) => packet.encode(buf),
            Self::Unsubscribe(packet) => packet.encode(buf),
            Self::UnsubscribeAck(packet) => packet.encode(buf),
            Self::PingRequest(packet) => packet.encode(buf),
            Self::PingResponse(packet) => packet.encode(buf),
            Self::Disconnect(packet) => packet.encode(buf),
            Self::Auth(packet) => packet.encode(buf),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{PacketId, QoS};

    #[test]
    fn test_generic_decode() {
        let mut buf = Vec::new();
        let mut packet = PublishPacket::new("a/b", QoS::AtLeastOnce, b"hi").unwrap();
        packet.set_packet_id(PacketId::new(2));
        packet.encode(&mut buf).unwrap();

        let mut ba = ByteArray::new(&buf);
        let decoded = MqttPacket::decode(&mut ba).unwrap();
        assert_eq!(decoded, MqttPacket::Publish(packet));

        buf.clear();
        PingResponsePacket::new().encode(&mut buf).unwrap();
        let mut ba = ByteArray::new(&buf);
        let decoded = MqttPacket::decode(&mut ba).unwrap();
        assert!(matches!(decoded, MqttPacket::PingResponse(_)));
    }
}
