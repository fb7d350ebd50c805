// Copyright (c) 2024 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

use codec::{Properties, ReasonCode};

/// Callback surface implemented by the embedder.
///
/// The methods are invoked from the thread driving [`Client::event_loop`],
/// never concurrently with each other. It is safe to call
/// [`Client::publish`] from inside `message_received` or `auth_received`.
///
/// [`Client::event_loop`]: crate::Client::event_loop
/// [`Client::publish`]: crate::Client::publish
pub trait ClientHandler: Send + Sync {
    /// Called once per delivered application message.
    ///
    /// For inbound `QoS` 2 messages this is invoked exactly once, even when
    /// the server re-delivers the packet before the exchange finishes.
    fn message_received(&self, topic: &str, payload: &[u8], packet_id: u16, properties: &Properties);

    /// Queried once at client creation. Caps the size of inbound control
    /// packets; anything larger is treated as a protocol error.
    fn max_packet_size(&self) -> u32 {
        2048
    }

    /// Queried at connect. Sizes the in-flight slot table.
    ///
    /// Each slot tracks up to three packet identifiers at once: one
    /// outbound `QoS` 1, one outbound `QoS` 2 and one inbound `QoS` 2
    /// exchange.
    fn max_unacked_packets(&self) -> u32 {
        1
    }

    /// Called from the event loop when the transport is torn down.
    ///
    /// A typical embedder reconnects with `connect_to` here or from its own
    /// supervision logic; pending `QoS` packets are retransmitted on the
    /// next connection when clean-start is false.
    fn connection_lost(&self, reason: ReasonCode) {
        let _ = reason;
    }

    /// Called on every inbound AUTH packet. Returning false rejects the
    /// authentication exchange and disconnects.
    ///
    /// Continue the exchange by calling [`Client::auth`] from inside this
    /// callback or right after it returns.
    ///
    /// [`Client::auth`]: crate::Client::auth
    #[cfg(feature = "auth")]
    fn auth_received(
        &self,
        reason: ReasonCode,
        method: &str,
        data: &[u8],
        properties: &Properties,
    ) -> bool {
        let _ = (reason, method, data, properties);
        false
    }
}
