// Copyright (c) 2024 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

use std::fmt::{self, Display};
use std::io;

use codec::topic::TopicError;
use codec::ReasonCode;

/// Represent the types of errors.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    /// The operation did not finish within the configured timeout.
    TimedOut,

    /// Already connected to a server.
    AlreadyConnected,

    /// Bad parameter for this method call.
    BadParameter,

    /// The given properties are not allowed in this packet type. No packet
    /// was sent.
    BadProperties,

    /// A communication with the network failed.
    NetworkError,

    /// Not connected to the server.
    NotConnected,

    /// All in-flight slots are occupied, the pending packet has to be
    /// acknowledged first.
    TransientPacket,

    /// No packet identifier is available yet, call again later on.
    WaitingForResult,

    /// The packet storage rejected the value.
    StorageError,

    /// A protocol reason code returned by the server.
    Reason(ReasonCode),
}

#[derive(Clone, Debug)]
pub struct Error {
    /// Type of current error.
    kind: ErrorKind,

    /// Detail message about this error.
    message: String,
}

impl Error {
    pub fn new(kind: ErrorKind, message: &str) -> Self {
        Self {
            kind,
            message: message.to_owned(),
        }
    }

    pub fn from_string(kind: ErrorKind, message: String) -> Self {
        Self { kind, message }
    }

    /// Get type of current error.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// Get the server reason code, if this error carries one.
    #[must_use]
    pub const fn reason_code(&self) -> Option<ReasonCode> {
        match self.kind {
            ErrorKind::Reason(code) => Some(code),
            _ => None,
        }
    }
}

impl Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.message)
    }
}

impl std::error::Error for Error {}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        let kind = match err.kind() {
            io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut => ErrorKind::TimedOut,
            _ => ErrorKind::NetworkError,
        };
        Self::from_string(kind, format!("IoError {}", err))
    }
}

impl From<rustls::Error> for Error {
    fn from(err: rustls::Error) -> Self {
        Self::from_string(ErrorKind::NetworkError, format!("Tls error: {}", err))
    }
}

impl From<codec::EncodeError> for Error {
    fn from(err: codec::EncodeError) -> Self {
        Self::from_string(ErrorKind::BadParameter, format!("{:?}", err))
    }
}

impl From<codec::DecodeError> for Error {
    fn from(err: codec::DecodeError) -> Self {
        Self::from_string(ErrorKind::NetworkError, format!("{:?}", err))
    }
}

impl From<TopicError> for Error {
    fn from(err: TopicError) -> Self {
        Self::from_string(ErrorKind::BadParameter, format!("Invalid topic: {:?}", err))
    }
}

impl From<ReasonCode> for Error {
    fn from(code: ReasonCode) -> Self {
        Self::from_string(ErrorKind::Reason(code), format!("{:?}", code))
    }
}
