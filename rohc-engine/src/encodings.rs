//! Field-specific encodings: scaled RTP timestamps (RFC 3095 section
//! 4.5.3-4.5.4) and IP-ID offset behavior (section 4.5.5)

/// Outcome of feeding one observation to a detector
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TsEvent {
    None,
    /// A stable stride was just established
    Established,
    /// The established stride no longer matches; scaled mode is invalid
    Broken,
}

/// Detects a constant RTP timestamp stride on the compressor side
pub(crate) struct TsStrideDetector {
    threshold: u8,
    last_ts: Option<u32>,
    last_delta: u32,
    run: u8,
    stride: Option<u32>,
}

impl TsStrideDetector {
    pub(crate) fn new(threshold: u8) -> Self {
        Self {
            threshold,
            last_ts: None,
            last_delta: 0,
            run: 0,
            stride: None,
        }
    }

    pub(crate) fn stride(&self) -> Option<u32> {
        self.stride
    }

    /// Feed the TS of the next packet in SN order
    pub(crate) fn observe(&mut self, ts: u32) -> TsEvent {
        let Some(last) = self.last_ts else {
            self.last_ts = Some(ts);
            return TsEvent::None;
        };
        let delta = ts.wrapping_sub(last);
        self.last_ts = Some(ts);

        if let Some(stride) = self.stride {
            // Multiples of the stride keep scaled mode valid (packets
            // spanning several frames), an unchanged TS does too
            if delta == 0 || delta % stride == 0 {
                return TsEvent::None;
            }
            self.stride = None;
            self.run = 0;
            self.last_delta = delta;
            return TsEvent::Broken;
        }

        if delta != 0 && delta == self.last_delta {
            self.run += 1;
            if self.run + 1 >= self.threshold {
                self.stride = Some(delta);
                self.run = 0;
                return TsEvent::Established;
            }
        } else {
            self.run = 0;
        }
        self.last_delta = delta;

        TsEvent::None
    }

    /// Drop the established stride, e.g. after a context refresh
    pub(crate) fn reset(&mut self) {
        self.last_ts = None;
        self.last_delta = 0;
        self.run = 0;
        self.stride = None;
    }
}

/// Split a timestamp into its scaled value and offset for `stride`
pub(crate) fn scale_ts(ts: u32, stride: u32) -> (u32, u32) {
    debug_assert!(stride != 0, "Scaled mode without a stride");
    (ts / stride, ts % stride)
}

/// Byte-swap an IP-ID that is little-endian on the wire
pub(crate) fn swap16(id: u16) -> u16 {
    id.rotate_left(8)
}

/// Per-IP-header behavior flags for the Identification field
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct IpIdBehavior {
    /// The field appears random: it travels verbatim after the base header
    pub rnd: bool,
    /// Network byte order; when false the field must be swapped before
    /// offset encoding
    pub nbo: bool,
}

impl IpIdBehavior {
    pub(crate) const SEQUENTIAL: Self = Self { rnd: false, nbo: true };

    /// The value the offset encoding applies to
    pub(crate) fn ordered(self, id: u16) -> u16 {
        if self.nbo { id } else { swap16(id) }
    }

    /// Back from offset-encoded value to the wire value
    pub(crate) fn to_wire(self, ordered: u16) -> u16 {
        if self.nbo { ordered } else { swap16(ordered) }
    }
}

/// Classifies IP-ID movement across packets on the compressor side
pub(crate) struct IpIdAnalyzer {
    behavior: IpIdBehavior,
    threshold: u8,
    last_id: Option<u16>,
    nonseq_run: u8,
    seq_run: u8,
    seq_nbo: bool,
}

/// Largest forward jump still considered sequential
const MAX_SEQ_JUMP: u16 = 20;

impl IpIdAnalyzer {
    pub(crate) fn new(threshold: u8) -> Self {
        Self {
            behavior: IpIdBehavior::SEQUENTIAL,
            threshold,
            last_id: None,
            nonseq_run: 0,
            seq_run: 0,
            seq_nbo: true,
        }
    }

    pub(crate) fn behavior(&self) -> IpIdBehavior {
        self.behavior
    }

    /// Feed the IP-ID of the next packet; returns true when the RND or
    /// NBO flag flipped (the peer must be told through IR-DYN or EXT-3)
    pub(crate) fn observe(&mut self, id: u16) -> bool {
        let Some(last) = self.last_id else {
            self.last_id = Some(id);
            return false;
        };
        self.last_id = Some(id);

        let delta_nbo = id.wrapping_sub(last);
        let delta_swapped = swap16(id).wrapping_sub(swap16(last));
        let sequential = if (1..=MAX_SEQ_JUMP).contains(&delta_nbo) {
            self.note_seq(true);
            true
        } else if (1..=MAX_SEQ_JUMP).contains(&delta_swapped) {
            self.note_seq(false);
            true
        } else {
            self.seq_run = 0;
            self.nonseq_run = self.nonseq_run.saturating_add(1);
            false
        };

        let before = self.behavior;
        if !sequential && self.nonseq_run >= self.threshold && !self.behavior.rnd {
            self.behavior.rnd = true;
        }
        if sequential && self.seq_run >= self.threshold {
            self.behavior.rnd = false;
            self.behavior.nbo = self.seq_nbo;
        }
        self.behavior != before
    }

    fn note_seq(&mut self, nbo: bool) {
        if self.seq_nbo == nbo {
            self.seq_run = self.seq_run.saturating_add(1);
        } else {
            self.seq_run = 1;
            self.seq_nbo = nbo;
        }
        self.nonseq_run = 0;
    }

    pub(crate) fn reset(&mut self) {
        self.last_id = None;
        self.nonseq_run = 0;
        self.seq_run = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stride_established_after_three_equal_deltas() {
        let mut detector = TsStrideDetector::new(3);
        assert_eq!(detector.observe(1000), TsEvent::None);
        assert_eq!(detector.observe(1160), TsEvent::None);
        assert_eq!(detector.observe(1320), TsEvent::None);
        assert_eq!(detector.observe(1480), TsEvent::Established);
        assert_eq!(detector.stride(), Some(160));
    }

    #[test]
    fn test_stride_break_invalidates_scaled_mode() {
        let mut detector = TsStrideDetector::new(3);
        for ts in [0u32, 160, 320, 480] {
            detector.observe(ts);
        }
        // A jump by a multiple stays scaled
        assert_eq!(detector.observe(800), TsEvent::None);
        assert_eq!(detector.observe(833), TsEvent::Broken);
        assert_eq!(detector.stride(), None);
    }

    #[test]
    fn test_scale_ts() {
        let (scaled, offset) = scale_ts(160 * 7 + 3, 160);
        assert_eq!(scaled, 7);
        assert_eq!(offset, 3);
    }

    #[test]
    fn test_ip_id_rnd_after_four_wild_deltas() {
        let mut analyzer = IpIdAnalyzer::new(4);
        let mut flipped = false;
        for id in [0x1000u16, 0x8421, 0x13fe, 0xc0c0, 0x5a5a, 0x0102] {
            flipped |= analyzer.observe(id);
        }
        assert!(flipped);
        assert!(analyzer.behavior().rnd);
    }

    #[test]
    fn test_ip_id_little_endian_detected() {
        let mut analyzer = IpIdAnalyzer::new(4);
        // 1, 2, 3, ... as emitted by a little-endian stack
        for id in (1u16..10).map(swap16) {
            analyzer.observe(id);
        }
        assert!(!analyzer.behavior().rnd);
        assert!(!analyzer.behavior().nbo);
        assert_eq!(analyzer.behavior().ordered(swap16(9)), 9);
    }

    #[test]
    fn test_ip_id_monotonic_stays_sequential() {
        let mut analyzer = IpIdAnalyzer::new(4);
        for id in 100u16..140 {
            assert!(!analyzer.observe(id));
        }
        assert_eq!(analyzer.behavior(), IpIdBehavior::SEQUENTIAL);
    }
}
