// Copyright (c) 2023 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

use rand::distributions::Alphanumeric;
use rand::{thread_rng, Rng};

use crate::error::{DecodeError, EncodeError};

/// Maximum byte length of two-byte-prefixed fields, strings and binary data.
pub const TWO_BYTES_DATA_MAX: usize = u16::MAX as usize;

/// Generate random alphanumeric string with `len` chars.
#[must_use]
pub fn random_string(len: usize) -> String {
    thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StringError {
    /// Byte sequence is not well formed UTF-8.
    InvalidString,

    /// String contains the null character U+0000.
    NullCharacterFound,

    /// Byte length exceeds 65535.
    TooLong,
}

impl From<StringError> for DecodeError {
    fn from(_e: StringError) -> Self {
        Self::InvalidString
    }
}

impl From<StringError> for EncodeError {
    fn from(_e: StringError) -> Self {
        Self::TooManyData
    }
}

/// Check whether `s` can be used as a string field in packets.
///
/// The character data in a UTF-8 Encoded String MUST be well-formed UTF-8 as
/// defined by the Unicode specification and restated in RFC 3629. In
/// particular it MUST NOT include encodings of code points between U+D800 and
/// U+DFFF [MQTT-1.5.4-1], and MUST NOT include an encoding of the null
/// character U+0000 [MQTT-1.5.4-2].
///
/// # Errors
///
/// Returns error if `s` contains a null character or is longer than 65535 bytes.
pub fn validate_utf8_string(s: &str) -> Result<(), StringError> {
    if s.len() > TWO_BYTES_DATA_MAX {
        return Err(StringError::TooLong);
    }
    if s.chars().any(|c| c == '\u{0000}') {
        return Err(StringError::NullCharacterFound);
    }
    Ok(())
}

/// Convert `bytes` into an owned String, checking the string rules.
///
/// # Errors
///
/// Returns error if `bytes` is not a valid string field.
pub fn to_utf8_string(bytes: &[u8]) -> Result<String, StringError> {
    let s = String::from_utf8(bytes.to_vec()).map_err(|_e| StringError::InvalidString)?;
    validate_utf8_string(&s)?;
    Ok(s)
}

/// Check binary data length.
///
/// # Errors
///
/// Returns error if `data` is longer than 65535 bytes.
pub fn validate_two_bytes_data(data: &[u8]) -> Result<(), EncodeError> {
    if data.len() > TWO_BYTES_DATA_MAX {
        Err(EncodeError::TooManyData)
    } else {
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientIdError {
    /// Larger than 128 bytes.
    TooLong,

    /// Contains characters outside of 0-9a-zA-Z, `-` and `_`.
    InvalidChars,
}

impl From<ClientIdError> for DecodeError {
    fn from(_e: ClientIdError) -> Self {
        Self::InvalidClientId
    }
}

/// Check whether `client_id` can be sent in a connect packet.
///
/// The server MUST accept ids between 1 and 23 alphanumeric bytes
/// [MQTT-3.1.3-5] and MAY accept more; this check allows the common broader
/// form. An empty id is valid, the server will assign one [MQTT-3.1.3-6].
///
/// # Errors
///
/// Returns error if `client_id` is too long or contains invalid characters.
pub fn validate_client_id(client_id: &str) -> Result<(), ClientIdError> {
    if client_id.len() > 128 {
        return Err(ClientIdError::TooLong);
    }
    if client_id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        Ok(())
    } else {
        Err(ClientIdError::InvalidChars)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_random_string() {
        let s = random_string(8);
        assert_eq!(s.len(), 8);
        assert!(s.chars().all(|c| c.is_ascii_alphanumeric()));
    }

    #[test]
    fn test_validate_utf8_string() {
        assert!(validate_utf8_string("kestrel/status").is_ok());
        assert_eq!(
            validate_utf8_string("a\u{0000}b"),
            Err(StringError::NullCharacterFound)
        );
    }

    #[test]
    fn test_validate_client_id() {
        assert!(validate_client_id("").is_ok());
        assert!(validate_client_id("kestrel-01").is_ok());
        assert_eq!(
            validate_client_id("kestrel/01"),
            Err(ClientIdError::InvalidChars)
        );
    }
}
