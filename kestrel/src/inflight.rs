// Copyright (c) 2024 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

//! In-flight packet tracking and packet identifier allocation.
//!
//! The table has a fixed number of slots, each able to track three
//! exchanges at once: one outbound `QoS` 1 publish awaiting PUBACK, one
//! outbound `QoS` 2 publish awaiting PUBREC or PUBCOMP, and one inbound
//! `QoS` 2 publish awaiting PUBREL.

use std::collections::HashSet;

use codec::PacketId;

/// Sub-state of an outbound `QoS` 2 exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishState {
    /// PUBLISH was sent, waiting for PUBREC.
    AwaitingReceived,

    /// PUBREL was sent, waiting for PUBCOMP.
    AwaitingComplete,
}

/// Result of registering an inbound `QoS` 2 publish.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InboundQos2 {
    /// First time this identifier is seen; deliver the message.
    New,

    /// Duplicate delivery before PUBREL; do not deliver again.
    Duplicate,

    /// All inbound sub-slots are occupied.
    NoSlot,
}

#[derive(Debug, Default, Clone, Copy)]
struct Slot {
    out_qos1: Option<PacketId>,
    out_qos2: Option<(PacketId, PublishState)>,
    in_qos2: Option<(PacketId, bool)>,
}

/// Fixed-size table of in-flight exchanges.
#[derive(Debug)]
pub struct InFlightTable {
    slots: Vec<Slot>,
    /// Identifiers of subscribe/unsubscribe exchanges in progress. They
    /// share the identifier space with publishes but not the slots.
    control: Vec<PacketId>,
    last_id: u16,
}

impl InFlightTable {
    /// Create a table with `capacity` slots.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: vec![Slot::default(); capacity],
            control: Vec::new(),
            last_id: 0,
        }
    }

    /// Number of slots.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Resize the table to `capacity` slots, carrying every pending
    /// exchange over so that acknowledgements arriving after a reconnect
    /// still match their retransmitted packets.
    ///
    /// The capacity never shrinks below the number of exchanges still
    /// tracked in any one sub-state. Identifier allocation order is kept.
    pub fn resize(&mut self, capacity: usize) {
        let mut qos1 = Vec::new();
        let mut qos2 = Vec::new();
        let mut inbound = Vec::new();
        for slot in &self.slots {
            if let Some(id) = slot.out_qos1 {
                qos1.push(id);
            }
            if let Some(pending) = slot.out_qos2 {
                qos2.push(pending);
            }
            if let Some(pending) = slot.in_qos2 {
                inbound.push(pending);
            }
        }

        let needed = qos1.len().max(qos2.len()).max(inbound.len());
        let capacity = capacity.max(needed);
        let mut slots = vec![Slot::default(); capacity];
        for (slot, id) in slots.iter_mut().zip(qos1) {
            slot.out_qos1 = Some(id);
        }
        for (slot, pending) in slots.iter_mut().zip(qos2) {
            slot.out_qos2 = Some(pending);
        }
        for (slot, pending) in slots.iter_mut().zip(inbound) {
            slot.in_qos2 = Some(pending);
        }
        self.slots = slots;
        // Subscribe/unsubscribe exchanges are synchronous, none spans a
        // reconnect.
        self.control.clear();
    }

    /// Check whether `packet_id` takes part in any tracked exchange.
    #[must_use]
    pub fn is_in_use(&self, packet_id: PacketId) -> bool {
        self.control.contains(&packet_id)
            || self.slots.iter().any(|slot| {
                slot.out_qos1 == Some(packet_id)
                    || slot.out_qos2.map(|(id, _)| id) == Some(packet_id)
                    || slot.in_qos2.map(|(id, _)| id) == Some(packet_id)
            })
    }

    /// Allocate the next free packet identifier.
    ///
    /// Allocation is monotonic with wrap-around, skipping zero and any
    /// identifier currently in use. Returns `None` when every identifier
    /// is taken.
    pub fn alloc_packet_id(&mut self) -> Option<PacketId> {
        let mut used: HashSet<u16> = self.control.iter().map(|id| id.value()).collect();
        for slot in &self.slots {
            if let Some(id) = slot.out_qos1 {
                used.insert(id.value());
            }
            if let Some((id, _)) = slot.out_qos2 {
                used.insert(id.value());
            }
            if let Some((id, _)) = slot.in_qos2 {
                used.insert(id.value());
            }
        }

        for _ in 0..u16::MAX {
            self.last_id = self.last_id.wrapping_add(1);
            if self.last_id == 0 {
                self.last_id = 1;
            }
            if !used.contains(&self.last_id) {
                return Some(PacketId::new(self.last_id));
            }
        }
        None
    }

    /// Reserve an identifier for a subscribe/unsubscribe exchange.
    pub fn reserve_control(&mut self, packet_id: PacketId) {
        self.control.push(packet_id);
    }

    /// Release a subscribe/unsubscribe identifier.
    pub fn release_control(&mut self, packet_id: PacketId) {
        self.control.retain(|id| *id != packet_id);
    }

    /// Check whether an outbound `QoS` 1 exchange can start.
    #[must_use]
    pub fn has_free_qos1(&self) -> bool {
        self.slots.iter().any(|slot| slot.out_qos1.is_none())
    }

    /// Check whether an outbound `QoS` 2 exchange can start.
    #[must_use]
    pub fn has_free_qos2(&self) -> bool {
        self.slots.iter().any(|slot| slot.out_qos2.is_none())
    }

    /// Record an outbound `QoS` 1 publish. The caller checked
    /// `has_free_qos1` first.
    pub fn begin_qos1(&mut self, packet_id: PacketId) {
        if let Some(slot) = self.slots.iter_mut().find(|slot| slot.out_qos1.is_none()) {
            slot.out_qos1 = Some(packet_id);
        }
    }

    /// Record an outbound `QoS` 2 publish. The caller checked
    /// `has_free_qos2` first.
    pub fn begin_qos2(&mut self, packet_id: PacketId) {
        if let Some(slot) = self.slots.iter_mut().find(|slot| slot.out_qos2.is_none()) {
            slot.out_qos2 = Some((packet_id, PublishState::AwaitingReceived));
        }
    }

    /// PUBACK arrived. Returns true if an exchange with this identifier
    /// was open.
    pub fn acknowledge_qos1(&mut self, packet_id: PacketId) -> bool {
        for slot in &mut self.slots {
            if slot.out_qos1 == Some(packet_id) {
                slot.out_qos1 = None;
                return true;
            }
        }
        false
    }

    /// PUBREC arrived, move the exchange to awaiting PUBCOMP. Returns true
    /// if an exchange awaiting PUBREC with this identifier was open.
    pub fn receive_qos2(&mut self, packet_id: PacketId) -> bool {
        for slot in &mut self.slots {
            if slot.out_qos2 == Some((packet_id, PublishState::AwaitingReceived)) {
                slot.out_qos2 = Some((packet_id, PublishState::AwaitingComplete));
                return true;
            }
        }
        false
    }

    /// PUBCOMP arrived, or the exchange failed; free the sub-slot. Returns
    /// true if an exchange with this identifier was open.
    pub fn complete_qos2(&mut self, packet_id: PacketId) -> bool {
        for slot in &mut self.slots {
            if slot.out_qos2.map(|(id, _)| id) == Some(packet_id) {
                slot.out_qos2 = None;
                return true;
            }
        }
        false
    }

    /// Register an inbound `QoS` 2 publish.
    pub fn begin_inbound_qos2(&mut self, packet_id: PacketId) -> InboundQos2 {
        if self
            .slots
            .iter()
            .any(|slot| slot.in_qos2.map(|(id, _)| id) == Some(packet_id))
        {
            return InboundQos2::Duplicate;
        }
        match self.slots.iter_mut().find(|slot| slot.in_qos2.is_none()) {
            Some(slot) => {
                slot.in_qos2 = Some((packet_id, false));
                InboundQos2::New
            }
            None => InboundQos2::NoSlot,
        }
    }

    /// Mark the inbound `QoS` 2 message as delivered to the application.
    pub fn mark_inbound_delivered(&mut self, packet_id: PacketId) {
        for slot in &mut self.slots {
            if let Some((id, _)) = slot.in_qos2 {
                if id == packet_id {
                    slot.in_qos2 = Some((id, true));
                }
            }
        }
    }

    /// PUBREL arrived; free the inbound sub-slot. Returns the delivered
    /// flag, or `None` when the identifier is unknown.
    pub fn release_inbound_qos2(&mut self, packet_id: PacketId) -> Option<bool> {
        for slot in &mut self.slots {
            if let Some((id, delivered)) = slot.in_qos2 {
                if id == packet_id {
                    slot.in_qos2 = None;
                    return Some(delivered);
                }
            }
        }
        None
    }

    /// Identifiers of all outbound exchanges, used when dropping session
    /// state on a clean start.
    #[must_use]
    pub fn outbound_ids(&self) -> Vec<PacketId> {
        let mut ids = Vec::new();
        for slot in &self.slots {
            if let Some(id) = slot.out_qos1 {
                ids.push(id);
            }
            if let Some((id, _)) = slot.out_qos2 {
                ids.push(id);
            }
        }
        ids
    }

    /// Drop every tracked exchange.
    pub fn clear(&mut self) {
        for slot in &mut self.slots {
            *slot = Slot::default();
        }
        self.control.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alloc_skips_zero_and_in_use() {
        let mut table = InFlightTable::new(2);
        let first = table.alloc_packet_id().unwrap();
        assert_eq!(first, PacketId::new(1));
        table.begin_qos1(first);

        table.last_id = u16::MAX;
        // Wraps around, skips zero and the in-use id 1.
        let next = table.alloc_packet_id().unwrap();
        assert_eq!(next, PacketId::new(2));
    }

    #[test]
    fn test_alloc_exhausted() {
        let mut table = InFlightTable::new(1);
        table.begin_qos1(PacketId::new(1));
        // Every other id is reserved by control exchanges.
        for id in 2..=u16::MAX {
            table.reserve_control(PacketId::new(id));
        }
        assert!(table.alloc_packet_id().is_none());
    }

    #[test]
    fn test_qos1_lifecycle() {
        let mut table = InFlightTable::new(1);
        assert!(table.has_free_qos1());
        table.begin_qos1(PacketId::new(3));
        assert!(!table.has_free_qos1());
        assert!(table.is_in_use(PacketId::new(3)));

        assert!(!table.acknowledge_qos1(PacketId::new(4)));
        assert!(table.acknowledge_qos1(PacketId::new(3)));
        assert!(table.has_free_qos1());
    }

    #[test]
    fn test_qos2_lifecycle() {
        let mut table = InFlightTable::new(1);
        table.begin_qos2(PacketId::new(5));
        assert!(!table.receive_qos2(PacketId::new(9)));
        assert!(table.receive_qos2(PacketId::new(5)));
        // Second PUBREC is ignored.
        assert!(!table.receive_qos2(PacketId::new(5)));
        assert!(table.complete_qos2(PacketId::new(5)));
        assert!(table.has_free_qos2());
    }

    #[test]
    fn test_three_substates_coexist() {
        let mut table = InFlightTable::new(1);
        table.begin_qos1(PacketId::new(1));
        table.begin_qos2(PacketId::new(2));
        assert_eq!(table.begin_inbound_qos2(PacketId::new(3)), InboundQos2::New);

        assert!(table.is_in_use(PacketId::new(1)));
        assert!(table.is_in_use(PacketId::new(2)));
        assert!(table.is_in_use(PacketId::new(3)));
        assert!(!table.has_free_qos1());
        assert!(!table.has_free_qos2());
    }

    #[test]
    fn test_inbound_qos2_duplicate() {
        let mut table = InFlightTable::new(1);
        assert_eq!(table.begin_inbound_qos2(PacketId::new(7)), InboundQos2::New);
        table.mark_inbound_delivered(PacketId::new(7));
        assert_eq!(
            table.begin_inbound_qos2(PacketId::new(7)),
            InboundQos2::Duplicate
        );
        assert_eq!(table.release_inbound_qos2(PacketId::new(7)), Some(true));
        assert_eq!(table.release_inbound_qos2(PacketId::new(7)), None);
    }

    #[test]
    fn test_resize_keeps_pending_exchanges() {
        let mut table = InFlightTable::new(2);
        table.begin_qos1(PacketId::new(1));
        table.begin_qos2(PacketId::new(2));
        assert!(table.receive_qos2(PacketId::new(2)));
        assert_eq!(table.begin_inbound_qos2(PacketId::new(3)), InboundQos2::New);

        table.resize(4);
        assert_eq!(table.capacity(), 4);
        assert!(table.acknowledge_qos1(PacketId::new(1)));
        assert!(table.complete_qos2(PacketId::new(2)));
        assert_eq!(table.release_inbound_qos2(PacketId::new(3)), Some(false));
    }

    #[test]
    fn test_resize_never_drops_below_pending() {
        let mut table = InFlightTable::new(3);
        table.begin_qos1(PacketId::new(1));
        table.begin_qos1(PacketId::new(2));

        table.resize(1);
        assert_eq!(table.capacity(), 2);
        assert!(table.is_in_use(PacketId::new(1)));
        assert!(table.is_in_use(PacketId::new(2)));
        assert!(!table.has_free_qos1());
        assert!(table.has_free_qos2());
    }

    #[test]
    fn test_inbound_qos2_no_slot() {
        let mut table = InFlightTable::new(1);
        assert_eq!(table.begin_inbound_qos2(PacketId::new(1)), InboundQos2::New);
        assert_eq!(
            table.begin_inbound_qos2(PacketId::new(2)),
            InboundQos2::NoSlot
        );
    }
}
