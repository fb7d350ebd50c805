// Copyright (c) 2023 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

//! Topic names and topic filters.
//!
//! The topic level separator `/` is used to divide the topic into levels.
//! Topic filters may contain the single-level wildcard `+` and the
//! multi-level wildcard `#`; topic names may not.

use byteorder::{BigEndian, WriteBytesExt};
use std::fmt;
use std::io::Write;

use crate::utils::validate_utf8_string;
use crate::{ByteArray, DecodeError, DecodePacket, EncodeError, EncodePacket};

/// Single-level wildcard, matches exactly one topic level.
pub const LEVEL_WILDCARD: &str = "+";

/// Multi-level wildcard, matches any number of levels. Must be the last
/// level in the filter.
pub const MULTI_WILDCARD: &str = "#";

/// Topic level separator.
pub const SEPARATOR: char = '/';

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TopicError {
    /// Topic must contain at least one character [MQTT-4.7.3-1].
    IsEmpty,

    /// Byte length exceeds 65535.
    TooLong,

    /// Contains null character or invalid UTF-8.
    InvalidString,

    /// Wildcard characters are misplaced or appear in a topic name.
    InvalidWildcard,
}

impl From<TopicError> for EncodeError {
    fn from(_e: TopicError) -> Self {
        Self::InvalidTopic
    }
}

impl From<TopicError> for DecodeError {
    fn from(_e: TopicError) -> Self {
        Self::InvalidTopic
    }
}

fn validate_topic_common(topic: &str) -> Result<(), TopicError> {
    if topic.is_empty() {
        return Err(TopicError::IsEmpty);
    }
    validate_utf8_string(topic).map_err(|_e| TopicError::InvalidString)?;
    Ok(())
}

/// Check topic name rules.
///
/// The Topic Name in a PUBLISH packet MUST NOT contain wildcard characters
/// [MQTT-3.3.2-2].
///
/// # Errors
///
/// Returns error if `topic` is empty, too long or contains a wildcard.
pub fn validate_pub_topic(topic: &str) -> Result<(), TopicError> {
    validate_topic_common(topic)?;
    if topic.contains(&['+', '#'][..]) {
        return Err(TopicError::InvalidWildcard);
    }
    Ok(())
}

/// Check topic filter rules.
///
/// The single-level wildcard MUST occupy an entire level of the filter
/// [MQTT-4.7.1-2]. The multi-level wildcard MUST be the last character and
/// occupy an entire level [MQTT-4.7.1-1].
///
/// # Errors
///
/// Returns error if `topic` is empty, too long or misuses wildcards.
pub fn validate_sub_topic(topic: &str) -> Result<(), TopicError> {
    validate_topic_common(topic)?;

    let levels: Vec<&str> = topic.split(SEPARATOR).collect();
    let last = levels.len() - 1;
    for (index, level) in levels.iter().enumerate() {
        if level.contains('+') && *level != LEVEL_WILDCARD {
            return Err(TopicError::InvalidWildcard);
        }
        if level.contains('#') && (*level != MULTI_WILDCARD || index != last) {
            return Err(TopicError::InvalidWildcard);
        }
    }
    Ok(())
}

/// Topic name used in publish packets. No wildcards allowed.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PubTopic(String);

impl PubTopic {
    /// Create a new topic name.
    ///
    /// # Errors
    ///
    /// Returns error if `topic` violates the topic name rules.
    pub fn new(topic: &str) -> Result<Self, TopicError> {
        validate_pub_topic(topic)?;
        Ok(Self(topic.to_string()))
    }

    /// Get byte length used in packet.
    #[must_use]
    pub fn bytes(&self) -> usize {
        2 + self.0.len()
    }
}

impl AsRef<str> for PubTopic {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PubTopic {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl DecodePacket for PubTopic {
    fn decode(ba: &mut ByteArray) -> Result<Self, DecodeError> {
        let len = ba.read_u16()?;
        let s = ba.read_string(len as usize)?;
        validate_pub_topic(&s)?;
        Ok(Self(s))
    }
}

impl EncodePacket for PubTopic {
    fn encode(&self, buf: &mut Vec<u8>) -> Result<usize, EncodeError> {
        #[allow(clippy::cast_possible_truncation)]
        let len = self.0.len() as u16;
        buf.write_u16::<BigEndian>(len)?;
        buf.write_all(self.0.as_bytes())?;
        Ok(self.bytes())
    }
}

/// Topic filter used in subscribe packets. Wildcards allowed at level
/// boundaries.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SubTopic(String);

impl SubTopic {
    /// Create a new topic filter.
    ///
    /// # Errors
    ///
    /// Returns error if `topic` violates the topic filter rules.
    pub fn new(topic: &str) -> Result<Self, TopicError> {
        validate_sub_topic(topic)?;
        Ok(Self(topic.to_string()))
    }

    /// Get byte length used in packet.
    #[must_use]
    pub fn bytes(&self) -> usize {
        2 + self.0.len()
    }
}

impl AsRef<str> for SubTopic {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SubTopic {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl DecodePacket for SubTopic {
    fn decode(ba: &mut ByteArray) -> Result<Self, DecodeError> {
        let len = ba.read_u16()?;
        let s = ba.read_string(len as usize)?;
        validate_sub_topic(&s)?;
        Ok(Self(s))
    }
}

impl EncodePacket for SubTopic {
    fn encode(&self, buf: &mut Vec<u8>) -> Result<usize, EncodeError> {
        #[allow(clippy::cast_possible_truncation)]
        let len = self.0.len() as u16;
        buf.write_u16::<BigEndian>(len)?;
        buf.write_all(self.0.as_bytes())?;
        Ok(self.bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_pub_topic() {
        assert!(validate_pub_topic("a/b/c").is_ok());
        assert!(validate_pub_topic("a").is_ok());
        assert_eq!(validate_pub_topic(""), Err(TopicError::IsEmpty));
        assert_eq!(validate_pub_topic("a/+/c"), Err(TopicError::InvalidWildcard));
        assert_eq!(validate_pub_topic("a/#"), Err(TopicError::InvalidWildcard));
    }

    #[test]
    fn test_validate_sub_topic() {
        assert!(validate_sub_topic("a/b/c").is_ok());
        assert!(validate_sub_topic("a/+/c").is_ok());
        assert!(validate_sub_topic("+").is_ok());
        assert!(validate_sub_topic("#").is_ok());
        assert!(validate_sub_topic("a/b/#").is_ok());
        assert_eq!(validate_sub_topic(""), Err(TopicError::IsEmpty));
        assert_eq!(validate_sub_topic("a/b+/c"), Err(TopicError::InvalidWildcard));
        assert_eq!(validate_sub_topic("a/#/c"), Err(TopicError::InvalidWildcard));
        assert_eq!(validate_sub_topic("a/b#"), Err(TopicError::InvalidWildcard));
    }
}
