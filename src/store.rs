use core::convert::TryFrom;
use core::time::Duration;

use alloc::vec::Vec;

use crate::{Connect, Error, Pid, Publish, QoS, Subscribe, Unsubscribe};

/// Kind of an outbound packet held by the store.
///
/// Publishes are split by QoS level because each level follows a different
/// acknowledgement flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Kind {
    Connect,
    Subscribe,
    Unsubscribe,
    Publish0,
    Publish1,
    Publish2,
    PubAck,
    PubRec,
    PubRel,
    PubComp,
    PingReq,
    Disconnect,
    WsConnect,
}

impl Kind {
    /// Whether the server answers this packet. Non-answered kinds leave the
    /// store as soon as they are fully encoded.
    pub(crate) fn expects_response(self) -> bool {
        !matches!(
            self,
            Kind::Publish0 | Kind::PubAck | Kind::PubRec | Kind::PubComp | Kind::Disconnect
        )
    }

    pub(crate) fn for_publish(qos: QoS) -> Kind {
        match qos {
            QoS::Level0 => Kind::Publish0,
            QoS::Level1 => Kind::Publish1,
            QoS::Level2 => Kind::Publish2,
        }
    }

    pub(crate) fn callback_error(self) -> Option<Error> {
        match self {
            Kind::Connect => Some(Error::CallbackConnack),
            Kind::Subscribe => Some(Error::CallbackSuback),
            Kind::Unsubscribe => Some(Error::CallbackUnsuback),
            Kind::Publish0 | Kind::Publish1 | Kind::Publish2 | Kind::PubRel => {
                Some(Error::CallbackPublish)
            }
            _ => None,
        }
    }
}

/// Packet data owned by a store entry.
#[derive(Debug, Default)]
pub(crate) enum Value {
    Connect(Connect),
    Subscribe(Subscribe),
    Unsubscribe(Unsubscribe),
    Publish(Publish),
    #[default]
    None,
}

/// One queued outbound packet.
#[derive(Debug)]
pub(crate) struct Entry {
    pub kind: Kind,
    pub packet_id: Option<Pid>,
    pub value: Value,
    /// Set once the packet has been fully encoded and awaits its
    /// acknowledgement; cleared only by consuming the entry or by
    /// `unmark_all` on reconnect.
    pub marked: bool,
    pub time: Duration,
}

/// Bounded FIFO of outbound packets.
///
/// Marked entries form a stable prefix: appends go to the tail, marking
/// always hits the first unmarked entry, and acknowledged entries are
/// removed from the marked prefix. The *current* entry — the next one the
/// encoder works on — is therefore the first unmarked entry.
#[derive(Debug)]
pub(crate) struct Store {
    entries: Vec<Entry>,
    capacity: usize,
    /// Ack deadline for marked entries; zero disables the check.
    pub timeout: Duration,
    /// Keep-alive interval adopted from the CONNECT request; zero disables.
    pub keep_alive: Duration,
    last_touch: Duration,
    next_id: u16,
}

impl Store {
    pub fn new(capacity: usize, timeout: Duration) -> Self {
        Store {
            entries: Vec::with_capacity(capacity),
            capacity,
            timeout,
            keep_alive: Duration::ZERO,
            last_touch: Duration::ZERO,
            next_id: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_queueable(&self) -> bool {
        self.entries.len() < self.capacity
    }

    /// Allocate the next packet id: a monotonic counter that skips zero and
    /// any id currently occupying the store.
    pub fn next_packet_id(&mut self) -> Pid {
        loop {
            self.next_id = self.next_id.wrapping_add(1);
            let Ok(pid) = Pid::try_from(self.next_id) else {
                continue;
            };
            let occupied = self
                .entries
                .iter()
                .any(|e| e.packet_id == Some(pid));
            if !occupied {
                return pid;
            }
        }
    }

    pub fn append(&mut self, kind: Kind, packet_id: Option<Pid>, value: Value, now: Duration) -> Result<(), Error> {
        if self.entries.len() >= self.capacity {
            return Err(Error::QueueFull);
        }
        self.entries.push(Entry {
            kind,
            packet_id,
            value,
            marked: false,
            time: now,
        });
        Ok(())
    }

    fn current_index(&self) -> Option<usize> {
        self.entries.iter().position(|e| !e.marked)
    }

    pub fn has_current(&self) -> bool {
        self.current_index().is_some()
    }

    pub fn current_mut(&mut self) -> Option<&mut Entry> {
        let idx = self.current_index()?;
        Some(&mut self.entries[idx])
    }

    /// Remove and return the entry under encode.
    pub fn drop_current(&mut self) -> Option<Entry> {
        let idx = self.current_index()?;
        Some(self.entries.remove(idx))
    }

    /// Flag the entry under encode as sent and awaiting its response.
    pub fn mark_current(&mut self) {
        if let Some(entry) = self.current_mut() {
            entry.marked = true;
        }
    }

    /// Consume the marked entry matching an acknowledgement.
    pub fn pop_marked_by(&mut self, kind: Kind, packet_id: Option<Pid>) -> Option<Entry> {
        let idx = self
            .entries
            .iter()
            .position(|e| e.marked && e.kind == kind && e.packet_id == packet_id)?;
        Some(self.entries.remove(idx))
    }

    /// Remove and return the head entry regardless of its mark; used when
    /// flushing a store during teardown.
    pub fn shift(&mut self) -> Option<Entry> {
        if self.entries.is_empty() {
            None
        } else {
            Some(self.entries.remove(0))
        }
    }

    /// Drop queued entries of the given kinds without completing them.
    pub fn discard_kinds(&mut self, kinds: &[Kind]) {
        self.entries.retain(|e| !kinds.contains(&e.kind));
    }

    /// Force retransmission of every sent-but-unacknowledged entry.
    pub fn unmark_all(&mut self) {
        for entry in &mut self.entries {
            entry.marked = false;
        }
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Record transfer activity, arming the keep-alive timer from `now`.
    pub fn touch(&mut self, now: Duration) {
        self.last_touch = now;
    }

    /// Time left until the next deadline, together with the number of
    /// entries awaiting acknowledgement.
    ///
    /// With marked entries pending the deadline is the ack timeout of the
    /// oldest one; otherwise it is the keep-alive deadline. `None` means no
    /// timer is armed. Zero remaining time with a non-zero count is an ack
    /// timeout; with a zero count it means a PINGREQ is due.
    pub fn get_timeout(&self, now: Duration) -> Option<(Duration, usize)> {
        let pending = self.entries.iter().filter(|e| e.marked).count();
        let deadline = if pending > 0 {
            if self.timeout.is_zero() {
                return None;
            }
            let oldest = self
                .entries
                .iter()
                .filter(|e| e.marked)
                .map(|e| e.time)
                .min()?;
            oldest + self.timeout
        } else {
            if self.keep_alive.is_zero() {
                return None;
            }
            self.last_touch + self.keep_alive
        };
        Some((deadline.saturating_sub(now), pending))
    }
}

/// Bounded set of packet ids owned by the inbound QoS 2 flow: ids for which
/// a PUBLISH has been seen but the PUBCOMP has not yet been sent.
#[derive(Debug)]
pub(crate) struct IdSet {
    items: Vec<u16>,
    capacity: usize,
}

impl IdSet {
    pub fn new(capacity: usize) -> Self {
        IdSet {
            items: Vec::with_capacity(capacity),
            capacity,
        }
    }

    pub fn contains(&self, id: u16) -> bool {
        self.items.contains(&id)
    }

    /// Insert an id; refuses duplicates and respects capacity.
    pub fn put(&mut self, id: u16) -> bool {
        if self.items.len() >= self.capacity || self.contains(id) {
            return false;
        }
        self.items.push(id);
        true
    }

    pub fn remove(&mut self, id: u16) -> bool {
        match self.items.iter().position(|&i| i == id) {
            Some(idx) => {
                self.items.remove(idx);
                true
            }
            None => false,
        }
    }

    pub fn clear(&mut self) {
        self.items.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> Store {
        Store::new(4, Duration::from_secs(5))
    }

    fn secs(s: u64) -> Duration {
        Duration::from_secs(s)
    }

    #[test]
    fn append_respects_capacity() {
        let mut store = Store::new(1, Duration::ZERO);
        store
            .append(Kind::PingReq, None, Value::None, secs(0))
            .unwrap();
        assert_eq!(
            store.append(Kind::PingReq, None, Value::None, secs(0)),
            Err(Error::QueueFull)
        );
    }

    #[test]
    fn current_skips_marked_prefix() {
        let mut store = store();
        store
            .append(Kind::PingReq, None, Value::None, secs(0))
            .unwrap();
        store
            .append(Kind::Disconnect, None, Value::None, secs(0))
            .unwrap();
        assert_eq!(store.current_mut().unwrap().kind, Kind::PingReq);
        store.mark_current();
        assert_eq!(store.current_mut().unwrap().kind, Kind::Disconnect);
        store.unmark_all();
        assert_eq!(store.current_mut().unwrap().kind, Kind::PingReq);
    }

    #[test]
    fn pop_marked_matches_kind_and_id() {
        let mut store = store();
        let pid = store.next_packet_id();
        store
            .append(Kind::Publish1, Some(pid), Value::None, secs(0))
            .unwrap();
        store.mark_current();
        assert!(store.pop_marked_by(Kind::Publish2, Some(pid)).is_none());
        assert!(store.pop_marked_by(Kind::Publish1, None).is_none());
        assert!(store.pop_marked_by(Kind::Publish1, Some(pid)).is_some());
        assert_eq!(store.len(), 0);
    }

    #[test]
    fn unmarked_entries_are_not_popped() {
        let mut store = store();
        store
            .append(Kind::Connect, None, Value::None, secs(0))
            .unwrap();
        assert!(store.pop_marked_by(Kind::Connect, None).is_none());
        store.mark_current();
        assert!(store.pop_marked_by(Kind::Connect, None).is_some());
    }

    #[test]
    fn packet_id_skips_zero_and_occupied() {
        let mut store = store();
        let first = store.next_packet_id();
        assert_eq!(first.get(), 1);
        store
            .append(Kind::Publish1, Some(first), Value::None, secs(0))
            .unwrap();
        // exhaust the counter so it wraps past zero
        store.next_id = u16::MAX;
        let next = store.next_packet_id();
        assert_eq!(next.get(), 2, "skips zero, then the occupied id 1");
    }

    #[test]
    fn keep_alive_deadline_when_nothing_pending() {
        let mut store = store();
        store.keep_alive = secs(60);
        store.touch(secs(100));
        let (remaining, pending) = store.get_timeout(secs(130)).unwrap();
        assert_eq!(pending, 0);
        assert_eq!(remaining, secs(30));
        let (remaining, _) = store.get_timeout(secs(170)).unwrap();
        assert_eq!(remaining, Duration::ZERO);
    }

    #[test]
    fn ack_deadline_takes_priority() {
        let mut store = store();
        store.keep_alive = secs(60);
        store.touch(secs(0));
        store
            .append(Kind::Publish1, None, Value::None, secs(10))
            .unwrap();
        store.mark_current();
        let (remaining, pending) = store.get_timeout(secs(12)).unwrap();
        assert_eq!(pending, 1);
        assert_eq!(remaining, secs(3));
    }

    #[test]
    fn no_deadline_without_keep_alive_or_timeout() {
        let mut store = Store::new(4, Duration::ZERO);
        assert!(store.get_timeout(secs(5)).is_none());
        store
            .append(Kind::Publish1, None, Value::None, secs(0))
            .unwrap();
        store.mark_current();
        assert!(store.get_timeout(secs(5)).is_none());
    }

    #[test]
    fn discard_kinds_keeps_the_rest() {
        let mut store = store();
        store
            .append(Kind::Publish1, None, Value::None, secs(0))
            .unwrap();
        store
            .append(Kind::PingReq, None, Value::None, secs(0))
            .unwrap();
        store
            .append(Kind::Disconnect, None, Value::None, secs(0))
            .unwrap();
        store.discard_kinds(&[Kind::PingReq, Kind::Disconnect]);
        assert_eq!(store.len(), 1);
        assert_eq!(store.current_mut().unwrap().kind, Kind::Publish1);
    }

    #[test]
    fn clear_empties_the_queue() {
        let mut store = Store::new(2, Duration::ZERO);
        store
            .append(Kind::PingReq, None, Value::None, secs(0))
            .unwrap();
        store.mark_current();
        store
            .append(Kind::Disconnect, None, Value::None, secs(0))
            .unwrap();
        assert!(!store.is_queueable());
        store.clear();
        assert_eq!(store.len(), 0);
        assert!(store.is_queueable());
        assert!(!store.has_current());
    }

    #[test]
    fn id_set_put_remove() {
        let mut set = IdSet::new(2);
        assert!(set.put(9));
        assert!(!set.put(9), "second put of the same id fails");
        assert!(set.put(11));
        assert!(!set.put(12), "capacity enforced");
        assert!(set.remove(9));
        assert!(!set.remove(9), "remove of absent id fails");
        assert!(set.put(12));
    }
}
