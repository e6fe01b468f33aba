//! Context table keyed by CID
//!
//! A fixed array of `max_cid + 1` slots with a separate LRU ordering kept
//! as doubly-linked u16 indices, so slots never move and eviction is O(1).

use derive_more::Display;

/// Operating mode of a context (RFC 3095 section 4.4)
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// No feedback channel in use
    #[display("U")]
    Unidirectional,
    /// Feedback used sparingly, references advanced by optimism
    #[display("O")]
    Optimistic,
    /// Every reference advance is acknowledged
    #[display("R")]
    Reliable,
}

impl Mode {
    /// Two-bit wire value carried in FEEDBACK-2 and EXT-3
    #[must_use]
    pub(crate) fn to_bits(self) -> u8 {
        match self {
            Self::Unidirectional => 1,
            Self::Optimistic => 2,
            Self::Reliable => 3,
        }
    }

    pub(crate) fn from_bits(bits: u8) -> Option<Self> {
        match bits & 0b11 {
            1 => Some(Self::Unidirectional),
            2 => Some(Self::Optimistic),
            3 => Some(Self::Reliable),
            _ => None,
        }
    }
}

/// Compressor context state (RFC 3095 section 4.3.1)
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq)]
pub enum CompressorState {
    /// Initialization and Refresh: full headers on the wire
    #[display("IR")]
    Ir,
    /// First Order: dynamic fields still being established
    #[display("FO")]
    Fo,
    /// Second Order: steady state, minimal packets
    #[display("SO")]
    So,
}

/// Decompressor context state (RFC 3095 section 4.3.2)
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq)]
pub enum DecompressorState {
    /// Nothing known about the flow
    #[display("NC")]
    NoContext,
    /// Static chain known, dynamic references lost
    #[display("SC")]
    StaticContext,
    /// Full reference state, compressed packets decodable
    #[display("FC")]
    FullContext,
}

const NONE: u16 = u16::MAX;

/// Slot table plus LRU links, generic over the per-direction context type
pub(crate) struct ContextTable<C> {
    slots: Vec<Option<C>>,
    prev: Vec<u16>,
    next: Vec<u16>,
    head: u16,
    tail: u16,
    len: usize,
}

impl<C> ContextTable<C> {
    pub(crate) fn new(max_cid: u16) -> Self {
        let capacity = usize::from(max_cid) + 1;
        Self {
            slots: (0..capacity).map(|_| None).collect(),
            prev: vec![NONE; capacity],
            next: vec![NONE; capacity],
            head: NONE,
            tail: NONE,
            len: 0,
        }
    }

    pub(crate) fn max_cid(&self) -> u16 {
        (self.slots.len() - 1) as u16
    }

    pub(crate) fn len(&self) -> usize {
        self.len
    }

    pub(crate) fn contains(&self, cid: u16) -> bool {
        usize::from(cid) < self.slots.len() && self.slots[usize::from(cid)].is_some()
    }

    pub(crate) fn get(&self, cid: u16) -> Option<&C> {
        self.slots.get(usize::from(cid))?.as_ref()
    }

    /// Fetch a context and mark it most-recently-used
    pub(crate) fn get_mut(&mut self, cid: u16) -> Option<&mut C> {
        if !self.contains(cid) {
            return None;
        }
        self.unlink(cid);
        self.link_front(cid);
        self.slots[usize::from(cid)].as_mut()
    }

    /// Install (or replace) the context for `cid` and mark it used
    pub(crate) fn insert(&mut self, cid: u16, context: C) {
        let slot = usize::from(cid);
        debug_assert!(slot < self.slots.len(), "CID beyond table bound");
        if self.slots[slot].is_some() {
            self.unlink(cid);
        } else {
            self.len += 1;
        }
        self.slots[slot] = Some(context);
        self.link_front(cid);
    }

    pub(crate) fn remove(&mut self, cid: u16) -> Option<C> {
        if !self.contains(cid) {
            return None;
        }
        self.unlink(cid);
        self.len -= 1;
        self.slots[usize::from(cid)].take()
    }

    /// First CID without a context, if any
    pub(crate) fn free_cid(&self) -> Option<u16> {
        self.slots
            .iter()
            .position(Option::is_none)
            .map(|slot| slot as u16)
    }

    /// Least-recently-used CID
    pub(crate) fn lru_cid(&self) -> Option<u16> {
        if self.tail == NONE { None } else { Some(self.tail) }
    }

    fn unlink(&mut self, cid: u16) {
        let slot = usize::from(cid);
        let (prev, next) = (self.prev[slot], self.next[slot]);
        if prev == NONE {
            if self.head == cid {
                self.head = next;
            }
        } else {
            self.next[usize::from(prev)] = next;
        }
        if next == NONE {
            if self.tail == cid {
                self.tail = prev;
            }
        } else {
            self.prev[usize::from(next)] = prev;
        }
        self.prev[slot] = NONE;
        self.next[slot] = NONE;
    }

    fn link_front(&mut self, cid: u16) {
        let slot = usize::from(cid);
        self.prev[slot] = NONE;
        self.next[slot] = self.head;
        if self.head != NONE {
            self.prev[usize::from(self.head)] = cid;
        }
        self.head = cid;
        if self.tail == NONE {
            self.tail = cid;
        }
    }
}
