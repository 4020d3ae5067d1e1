// SPDX-License-Identifier: MPL-2.0

use tracing::error;

#[derive(Debug)]
struct Slot<T> {
    entry: Option<T>,
    linked: bool,
    prev: Option<u16>,
    next: Option<u16>,
}

impl<T> Default for Slot<T> {
    fn default() -> Self {
        Self {
            entry: None,
            linked: false,
            prev: None,
            next: None,
        }
    }
}

/// Registry of inflight QoS 1 and QoS 2 exchanges keyed by packet identifier.
///
/// Slots are addressed by `packet_id - 1`, so lookups are O(1) and the
/// registry can be grown or shrunk in place without rebinding live entries.
///
/// Next to the entries the registry keeps the allocation order of the owned
/// identifiers (oldest first) as a doubly linked list threaded through the
/// slots. It is used to tear down every outstanding exchange in a
/// deterministic order when the session ends.
#[derive(Debug)]
pub struct InflightRegistry<T> {
    slots: Vec<Slot<T>>,
    /// Number of occupied entries
    len: usize,
    head: Option<u16>,
    tail: Option<u16>,
    /// Number of identifiers in the allocation order
    linked: usize,
}

impl<T> InflightRegistry<T> {
    pub fn new(capacity: u16) -> Self {
        let mut slots = Vec::with_capacity(usize::from(capacity));
        slots.resize_with(usize::from(capacity), Slot::default);
        Self {
            slots,
            len: 0,
            head: None,
            tail: None,
            linked: 0,
        }
    }

    pub fn capacity(&self) -> u16 {
        // at most 65535 slots, see `new`/`resize`
        self.slots.len() as u16
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Stores `entry` under `packet_id`, returning the entry it replaced.
    ///
    /// Returns `Err(entry)` if `packet_id` is outside the registry capacity.
    pub fn put(&mut self, packet_id: u16, entry: T) -> Result<Option<T>, T> {
        match self.slot_mut(packet_id) {
            Some(slot) => {
                let previous = slot.entry.replace(entry);
                if previous.is_none() {
                    self.len += 1;
                }
                Ok(previous)
            }
            None => Err(entry),
        }
    }

    pub fn get(&self, packet_id: u16) -> Option<&T> {
        self.slot(packet_id).and_then(|slot| slot.entry.as_ref())
    }

    pub fn contains(&self, packet_id: u16) -> bool {
        self.get(packet_id).is_some()
    }

    pub fn remove(&mut self, packet_id: u16) -> Option<T> {
        let removed = self.slot_mut(packet_id).and_then(|slot| slot.entry.take());
        if removed.is_some() {
            self.len -= 1;
        }
        removed
    }

    /// Appends `packet_id` to the allocation order.
    pub fn record_allocated(&mut self, packet_id: u16) {
        let tail = self.tail;
        let Some(slot) = self.slot_mut(packet_id) else {
            error!(packet_id, "recorded a packet identifier outside the inflight capacity, this is a bug");
            debug_assert!(false, "packet identifier {} outside capacity", packet_id);
            return;
        };
        if slot.linked {
            error!(packet_id, "packet identifier recorded twice in the allocation order, this is a bug");
            debug_assert!(false, "packet identifier {} recorded twice", packet_id);
            return;
        }
        slot.linked = true;
        slot.prev = tail;
        slot.next = None;

        match tail.and_then(|t| self.slot_mut(t)) {
            Some(tail_slot) => tail_slot.next = Some(packet_id),
            None => self.head = Some(packet_id),
        }
        self.tail = Some(packet_id);
        self.linked += 1;
    }

    /// Removes `packet_id` from the allocation order.
    ///
    /// This is usually the oldest identifier. QoS 1 and QoS 2 exchanges
    /// complete independently, so identifiers behind the oldest one may be
    /// forgotten first. Forgetting an identifier that was never recorded is an
    /// invariant violation and returns `false`.
    pub fn forget(&mut self, packet_id: u16) -> bool {
        let (prev, next) = match self.slot_mut(packet_id) {
            Some(slot) if slot.linked => {
                slot.linked = false;
                (slot.prev.take(), slot.next.take())
            }
            _ => {
                error!(packet_id, "forgot a packet identifier that is not in the allocation order, this is a bug");
                debug_assert!(false, "packet identifier {} not in allocation order", packet_id);
                return false;
            }
        };

        match prev.and_then(|p| self.slot_mut(p)) {
            Some(prev_slot) => prev_slot.next = next,
            None => self.head = next,
        }
        match next.and_then(|n| self.slot_mut(n)) {
            Some(next_slot) => next_slot.prev = prev,
            None => self.tail = prev,
        }
        self.linked -= 1;
        true
    }

    /// Removes and returns the oldest identifier of the allocation order.
    pub fn poll_oldest(&mut self) -> Option<u16> {
        let oldest = self.head?;
        self.forget(oldest);
        Some(oldest)
    }

    pub fn oldest(&self) -> Option<u16> {
        self.head
    }

    /// Number of identifiers in the allocation order.
    pub fn allocated(&self) -> usize {
        self.linked
    }

    /// Identifiers in allocation order, oldest first.
    pub fn allocation_order(&self) -> Vec<u16> {
        let mut order = Vec::with_capacity(self.linked);
        let mut cursor = self.head;
        while let Some(id) = cursor {
            order.push(id);
            cursor = self.slot(id).and_then(|slot| slot.next);
        }
        order
    }

    /// Changes the capacity, keeping every registered entry under its identifier.
    ///
    /// Shrinking below an occupied identifier is refused and returns `false`;
    /// callers shrink only once the packet identifier pool has reclaimed every
    /// identifier above the new capacity.
    pub fn resize(&mut self, capacity: u16) -> bool {
        let capacity = usize::from(capacity);
        if capacity < self.slots.len()
            && self.slots[capacity..]
                .iter()
                .any(|slot| slot.entry.is_some() || slot.linked)
        {
            error!(capacity, "inflight registry shrink would drop live exchanges, this is a bug");
            return false;
        }
        self.slots.resize_with(capacity, Slot::default);
        true
    }

    fn slot(&self, packet_id: u16) -> Option<&Slot<T>> {
        usize::from(packet_id)
            .checked_sub(1)
            .and_then(|idx| self.slots.get(idx))
    }

    fn slot_mut(&mut self, packet_id: u16) -> Option<&mut Slot<T>> {
        usize::from(packet_id)
            .checked_sub(1)
            .and_then(|idx| self.slots.get_mut(idx))
    }
}
