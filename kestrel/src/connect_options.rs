// Copyright (c) 2024 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

use std::time::Duration;

use codec::{Properties, QoS};

/// Will message published by the broker on the client's behalf when the
/// session ends abnormally.
#[derive(Clone, Debug, Default)]
pub struct WillMessage {
    topic: String,
    message: Vec<u8>,
    qos: QoS,
    retain: bool,
    properties: Properties,
}

impl WillMessage {
    /// Create a new will message.
    #[must_use]
    pub fn new(topic: &str, message: &[u8]) -> Self {
        Self {
            topic: topic.to_string(),
            message: message.to_vec(),
            ..Self::default()
        }
    }

    /// Update `qos` value of will message.
    pub fn set_qos(&mut self, qos: QoS) -> &mut Self {
        self.qos = qos;
        self
    }

    #[must_use]
    pub const fn qos(&self) -> QoS {
        self.qos
    }

    /// Update `retain` flag of will message.
    pub fn set_retain(&mut self, retain: bool) -> &mut Self {
        self.retain = retain;
        self
    }

    #[must_use]
    pub const fn retain(&self) -> bool {
        self.retain
    }

    #[must_use]
    pub fn topic(&self) -> &str {
        &self.topic
    }

    #[must_use]
    pub fn message(&self) -> &[u8] {
        &self.message
    }

    /// Get a mutable reference to will property list.
    pub fn properties_mut(&mut self) -> &mut Properties {
        &mut self.properties
    }

    /// Get a reference to will property list.
    #[must_use]
    pub const fn properties(&self) -> &Properties {
        &self.properties
    }
}

/// Connection options used by `connect_to`.
#[derive(Clone, Debug)]
pub struct ConnectOptions {
    host: String,
    port: u16,
    use_tls: bool,
    keep_alive: Duration,
    clean_start: bool,
    username: Option<String>,
    password: Option<Vec<u8>>,
    will: Option<WillMessage>,
    connect_timeout: Duration,
    properties: Properties,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 1883,
            use_tls: false,
            keep_alive: Duration::from_secs(60),
            clean_start: true,
            username: None,
            password: None,
            will: None,
            connect_timeout: Duration::from_secs(10),
            properties: Properties::new(),
        }
    }
}

impl ConnectOptions {
    /// Create connection options for `host:port`.
    ///
    /// `host` is a DNS name or an IP literal.
    #[must_use]
    pub fn new(host: &str, port: u16) -> Self {
        Self {
            host: host.to_string(),
            port,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn host(&self) -> &str {
        &self.host
    }

    #[must_use]
    pub const fn port(&self) -> u16 {
        self.port
    }

    /// Request a TLS wrapped connection.
    pub fn set_use_tls(&mut self, use_tls: bool) -> &mut Self {
        self.use_tls = use_tls;
        self
    }

    #[must_use]
    pub const fn use_tls(&self) -> bool {
        self.use_tls
    }

    /// Update keep-alive interval. This is a hint, the server can force
    /// its own with the ServerKeepAlive property. Zero turns keep-alive
    /// off.
    pub fn set_keep_alive(&mut self, keep_alive: Duration) -> &mut Self {
        self.keep_alive = keep_alive;
        self
    }

    #[must_use]
    pub const fn keep_alive(&self) -> Duration {
        self.keep_alive
    }

    /// If true, both the server and client discard any previous session.
    pub fn set_clean_start(&mut self, clean_start: bool) -> &mut Self {
        self.clean_start = clean_start;
        self
    }

    #[must_use]
    pub const fn clean_start(&self) -> bool {
        self.clean_start
    }

    /// Username used for authentication against the server.
    pub fn set_username(&mut self, username: Option<&str>) -> &mut Self {
        self.username = username.map(ToString::to_string);
        self
    }

    #[must_use]
    pub fn username(&self) -> Option<&str> {
        self.username.as_deref()
    }

    /// Password used for authentication against the server.
    pub fn set_password(&mut self, password: Option<&[u8]>) -> &mut Self {
        self.password = password.map(<[u8]>::to_vec);
        self
    }

    #[must_use]
    pub fn password(&self) -> Option<&[u8]> {
        self.password.as_deref()
    }

    /// Will message used when this client is disconnected abruptly.
    pub fn set_will(&mut self, will: Option<WillMessage>) -> &mut Self {
        self.will = will;
        self
    }

    #[must_use]
    pub const fn will(&self) -> Option<&WillMessage> {
        self.will.as_ref()
    }

    /// Timeout of the whole connect exchange, including CONNACK and any
    /// authentication continuation.
    pub fn set_connect_timeout(&mut self, connect_timeout: Duration) -> &mut Self {
        self.connect_timeout = connect_timeout;
        self
    }

    #[must_use]
    pub const fn connect_timeout(&self) -> Duration {
        self.connect_timeout
    }

    /// Properties sent along the connect packet.
    pub fn set_properties(&mut self, properties: Properties) -> &mut Self {
        self.properties = properties;
        self
    }

    /// Get a reference to the connect property list.
    #[must_use]
    pub const fn properties(&self) -> &Properties {
        &self.properties
    }
}
