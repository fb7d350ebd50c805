// Copyright (c) 2023 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

use std::convert::TryFrom;

use crate::property::{check_property_type_list, check_multiple_subscription_identifiers};
use crate::{
    ByteArray, DecodeError, DecodePacket, EncodeError, EncodePacket, FixedHeader, Packet, PacketId,
    PacketType, Properties, PropertyType, QoS, SubTopic, VarIntError,
};

/// Retain handling option of a subscription, bits 4 and 5 of the
/// Subscription Options.
///
/// This option specifies whether retained messages are sent when the
/// subscription is established. It is a Protocol Error to send a Retain
/// Handling value of 3.
#[repr(u8)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum RetainHandling {
    /// Send retained messages at the time of the subscribe.
    #[default]
    Send = 0,

    /// Send retained messages at subscribe only if the subscription does
    /// not currently exist.
    SendFirst = 1,

    /// Do not send retained messages at the time of the subscribe.
    NoSend = 2,
}

impl TryFrom<u8> for RetainHandling {
    type Error = DecodeError;

    fn try_from(v: u8) -> Result<Self, Self::Error> {
        match v {
            0 => Ok(Self::Send),
            1 => Ok(Self::SendFirst),
            2 => Ok(Self::NoSend),
            _ => Err(DecodeError::InvalidPacketFlags),
        }
    }
}

/// Topic filter together with its subscription options.
#[allow(clippy::module_name_repetitions)]
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SubscribeTopic {
    /// Subscribed `topic` may contain wildcard characters to match
    /// interested topics with patterns.
    topic: SubTopic,

    /// Bits 0 and 1 of the Subscription Options represent the Maximum QoS
    /// field. This gives the maximum QoS level at which the Server can send
    /// Application Messages to the Client.
    qos: QoS,

    /// Bit 2 of the Subscription Options represents the No Local option.
    ///
    /// If the value is 1, Application Messages MUST NOT be forwarded to a
    /// connection with a ClientID equal to the ClientID of the publishing
    /// connection [MQTT-3.8.3-3].
    no_local: bool,

    /// Bit 3 of the Subscription Options represents the Retain As Published
    /// option. If 1, Application Messages forwarded using this subscription
    /// keep the RETAIN flag they were published with.
    retain_as_published: bool,

    /// Bits 4 and 5 of the Subscription Options represent the Retain
    /// Handling option.
    retain_handling: RetainHandling,
}

impl SubscribeTopic {
    /// Create a new subscribe topic.
    ///
    /// # Errors
    ///
    /// Returns error if `topic` is invalid.
    pub fn new(topic: &str, qos: QoS) -> Result<Self, EncodeError> {
        let topic = SubTopic::new(topic)?;
        Ok(Self {
            topic,
            qos,
            ..Self::default()
        })
    }

    /// Get current topic pattern.
    #[must_use]
    pub fn topic(&self) -> &str {
        self.topic.as_ref()
    }

    /// Update `qos` value.
    pub fn set_qos(&mut self, qos: QoS) -> &mut Self {
        self.qos = qos;
        self
    }

    /// Get current `QoS`.
    #[must_use]
    pub const fn qos(&self) -> QoS {
        self.qos
    }

    /// Set `no_local` flag.
    pub fn set_no_local(&mut self, no_local: bool) -> &mut Self {
        self.no_local = no_local;
        self
    }

    /// Get `no_local` flag.
    #[must_use]
    pub const fn no_local(&self) -> bool {
        self.no_local
    }

    /// Update `retain_as_published` flag.
    pub fn set_retain_as_published(&mut self, retain_as_published: bool) -> &mut Self {
        self.retain_as_published = retain_as_published;
        self
    }

    /// Get `retain_as_published` flag.
    #[must_use]
    pub const fn retain_as_published(&self) -> bool {
        self.retain_as_published
    }

    /// Update `retain_handling` option.
    pub fn set_retain_handling(&mut self, retain_handling: RetainHandling) -> &mut Self {
        self.retain_handling = retain_handling;
        self
    }

    /// Get `retain_handling` option.
    #[must_use]
    pub const fn retain_handling(&self) -> RetainHandling {
        self.retain_handling
    }

    /// Get byte length used in packet.
    #[must_use]
    pub fn bytes(&self) -> usize {
        1 + self.topic.bytes()
    }
}

impl EncodePacket for SubscribeTopic {
    fn encode(&self, buf: &mut Vec<u8>) -> Result<usize, EncodeError> {
        self.topic.encode(buf)?;
        let mut flag: u8 = 0b0000_0011 & (self.qos as u8);
        if self.no_local {
            flag |= 0b0000_0100;
        }
        if self.retain_as_published {
            flag |= 0b0000_1000;
        }
        flag |= 0b0011_0000 & ((self.retain_handling as u8) << 4);
        buf.push(flag);

        Ok(self.bytes())
    }
}

impl DecodePacket for SubscribeTopic {
    fn decode(ba: &mut ByteArray) -> Result<Self, DecodeError> {
        let topic = SubTopic::decode(ba)?;

        let flag = ba.read_byte()?;
        // Bits 6 and 7 of the Subscription Options byte are reserved for
        // future use and MUST be set to 0 [MQTT-3.8.3-5].
        if flag & 0b1100_0000 != 0 {
            return Err(DecodeError::InvalidPacketFlags);
        }
        let qos = QoS::try_from(flag & 0b0000_0011)?;
        let no_local = (flag & 0b0000_0100) == 0b0000_0100;
        let retain_as_published = (flag & 0b0000_1000) == 0b0000_1000;
        let retain_handling = RetainHandling::try_from((flag & 0b0011_0000) >> 4)?;

        Ok(Self {
            topic,
            qos,
            no_local,
            retain_as_published,
            retain_handling,
        })
    }
}

/// `SubscribePacket` is sent from the Client to the Server to create one or
/// more subscriptions.
///
/// Each subscription registers the Client's interest in one topic filter.
/// The Server sends Publish packets to the Client to forward messages that
/// were published to topics matching these filters.
///
/// Basic structure of packet:
/// ```txt
///  7                     0
/// +-----------------------+
/// | Fixed header          |
/// |                       |
/// +-----------------------+
/// | Packet id             |
/// |                       |
/// +-----------------------+
/// | Properties ...        |
/// +-----------------------+
/// | Topic filter          |
/// |                       |
/// +-----------------------+
/// | Topic options         |
/// +-----------------------+
/// | Topic filter ...      |
/// +-----------------------+
/// ```
///
/// Each topic filter is followed by an options byte.
#[allow(clippy::module_name_repetitions)]
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SubscribePacket {
    /// Used in `SubscribeAckPacket`.
    packet_id: PacketId,

    properties: Properties,

    /// The payload MUST contain at least one Topic Filter and Subscription
    /// Options pair [MQTT-3.8.3-2].
    topics: Vec<SubscribeTopic>,
}

/// Properties available in subscribe packets.
pub const SUBSCRIBE_PROPERTIES: &[PropertyType] = &[
    PropertyType::SubscriptionIdentifier,
    PropertyType::UserProperty,
];

impl SubscribePacket {
    /// Create a new subscribe packet with one topic filter.
    ///
    /// # Errors
    ///
    /// Returns error if `topic` is invalid.
    pub fn new(topic: &str, qos: QoS, packet_id: PacketId) -> Result<Self, EncodeError> {
        let topic = SubscribeTopic::new(topic, qos)?;
        Ok(Self {
            packet_id,
            properties: Properties::new(),
            topics: vec![topic],
        })
    }

    /// Create a new subscribe packet from a list of subscriptions.
    ///
    /// # Errors
    ///
    /// Returns error if `topics` is empty.
    pub fn with_topics(
        packet_id: PacketId,
        topics: Vec<SubscribeTopic>,
    ) -> Result<Self, EncodeError> {
        if topics.is_empty() {
            return Err(EncodeError::InvalidData);
        }
        Ok(Self {
            packet_id,
            properties: Properties::new(),
            topics,
        })
    }

    /// Update packet id.
    pub fn set_packet_id(&mut self, packet_id: PacketId) -> &mut Self {
        self.packet_id = packet_id;
        self
    }

    /// Get current packet id.
    #[must_use]
    pub const fn packet_id(&self) -> PacketId {
        self.packet_id
    }

    /// Get a mutable reference to property list.
    pub fn properties_mut(&mut self) -> &mut Properties {
        &mut self.properties
    }

    /// Get a reference to property list.
    #[must_use]
    pub const fn properties(&self) -> &Properties {
        &self.properties
    }

    /// Get a reference to topic list.
    #[must_use]
    pub fn topics(&self) -> &[SubscribeTopic] {
        &self.topics
    }

    fn get_fixed_header(&self) -> Result<FixedHeader, VarIntError> {
        let remaining_length = PacketId::bytes()
            + self.properties.bytes()
            + self.topics.iter().map(SubscribeTopic::bytes).sum::<usize>();
        FixedHeader::new(PacketType::Subscribe, remaining_length)
    }
}

impl EncodePacket for SubscribePacket {
    fn encode(&self, buf: &mut Vec<u8>) -> Result<usize, EncodeError> {
        let old_len = buf.len();

        let fixed_header = self.get_fixed_header()?;
        fixed_header.encode(buf)?;

        self.packet_id.encode(buf)?;
        self.properties.encode(buf)?;

        for topic in &self.topics {
            topic.encode(buf)?;
        }

        Ok(buf.len() - old_len)
    }
}

impl DecodePacket for SubscribePacket {
    fn decode(ba: &mut ByteArray) -> Result<Self, DecodeError> {
        let fixed_header = FixedHeader::decode(ba)?;
        if fixed_header.packet_type() != PacketType::Subscribe {
            return Err(DecodeError::InvalidPacketType);
        }

        let start_offset = ba.offset();
        let packet_id = PacketId::decode(ba)?;
        if packet_id.value() == 0 {
            return Err(DecodeError::InvalidPacketId);
        }

        let properties = Properties::decode(ba)?;
        if let Err(property_type) =
            check_property_type_list(properties.props(), SUBSCRIBE_PROPERTIES)
        {
            log::error!(
                "SubscribePacket: property type {:?} cannot be used in properties!",
                property_type
            );
            return Err(DecodeError::InvalidPropertyType);
        }
        if check_multiple_subscription_identifiers(properties.props()).is_err() {
            return Err(DecodeError::InvalidPropertyType);
        }

        let mut topics = Vec::new();
        while ba.offset() - start_offset < fixed_header.remaining_length() {
            let topic = SubscribeTopic::decode(ba)?;
            topics.push(topic);
        }

        // The payload MUST contain at least one pair [MQTT-3.8.3-2].
        if topics.is_empty() {
            return Err(DecodeError::InvalidRemainingLength);
        }

        Ok(Self {
            packet_id,
            properties,
            topics,
        })
    }
}

impl Packet for SubscribePacket {
    fn packet_type(&self) -> PacketType {
        PacketType::Subscribe
    }

    fn bytes(&self) -> Result<usize, VarIntError> {
        let fixed_header = self.get_fixed_header()?;
        Ok(fixed_header.bytes() + fixed_header.remaining_length())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_subscribe_round_trip() {
        let mut packet =
            SubscribePacket::new("sensors/+/temp", QoS::AtLeastOnce, PacketId::new(4)).unwrap();
        packet.topics[0]
            .set_retain_as_published(true)
            .set_retain_handling(RetainHandling::SendFirst);

        let mut buf = Vec::new();
        packet.encode(&mut buf).unwrap();
        assert_eq!(buf[0], 0x82);

        let mut ba = ByteArray::new(&buf);
        let decoded = SubscribePacket::decode(&mut ba).unwrap();
        assert_eq!(decoded, packet);
        let topic = &decoded.topics()[0];
        assert_eq!(topic.topic(), "sensors/+/temp");
        assert_eq!(topic.qos(), QoS::AtLeastOnce);
        assert!(topic.retain_as_published());
        assert_eq!(topic.retain_handling(), RetainHandling::SendFirst);
    }

    #[test]
    fn test_subscribe_zero_packet_id() {
        let packet = SubscribePacket::new("a/b", QoS::AtMostOnce, PacketId::new(0)).unwrap();
        let mut buf = Vec::new();
        packet.encode(&mut buf).unwrap();

        let mut ba = ByteArray::new(&buf);
        assert_eq!(
            SubscribePacket::decode(&mut ba),
            Err(DecodeError::InvalidPacketId)
        );
    }
}
