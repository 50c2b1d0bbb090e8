use crate::sender::SeqNumber;
use std::time::Instant;

/// One outstanding sent segment: the sequence upper bound of the segment,
/// the wall time it left the sender, and the running count of bytes sent
/// since this entry was created (the entry's own segment included).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SampleEntry {
    pub seq: SeqNumber,
    pub sent_time: Instant,
    pub bytes: u32,
}

/// Ordered log of outstanding sent segments feeding the Vegas rate
/// estimator.
///
/// Entries are kept in creation order (a retransmit re-appends a lower
/// sequence after `discard`, so the log is not sorted by sequence). For
/// window-sized ledgers a linear scan over flat storage beats anything
/// clever; see `first` / `last` for the duplicate-sequence lookup rules.
#[derive(Debug, Clone, Default)]
pub struct SampleLedger {
    entries: Vec<SampleEntry>,
}

impl SampleLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an entry for a segment whose last byte is `seq`, stamped
    /// `now`, with a zero byte count.
    pub fn add(&mut self, seq: SeqNumber, now: Instant) {
        self.entries.push(SampleEntry {
            seq,
            sent_time: now,
            bytes: 0,
        });
    }

    /// Add `bytes` to every entry currently in the ledger.
    pub fn add_bytes(&mut self, bytes: u32) {
        for entry in &mut self.entries {
            entry.bytes += bytes;
        }
    }

    /// Remove every entry whose sequence is exactly `seq`.
    pub fn discard(&mut self, seq: SeqNumber) {
        self.entries.retain(|e| e.seq != seq);
    }

    /// Remove every entry whose sequence is `seq` or lower.
    pub fn discard_up_to(&mut self, seq: SeqNumber) {
        self.entries.retain(|e| e.seq > seq);
    }

    /// Earliest-created entry with sequence `seq`, or `None` when the
    /// ledger holds no sample for it.
    pub fn first(&self, seq: SeqNumber) -> Option<&SampleEntry> {
        self.entries.iter().find(|e| e.seq == seq)
    }

    /// Latest-created entry with sequence `seq`, or `None`.
    pub fn last(&self, seq: SeqNumber) -> Option<&SampleEntry> {
        self.entries.iter().rfind(|e| e.seq == seq)
    }

    /// Send time of the earliest entry with sequence `seq`.
    pub fn sent_time(&self, seq: SeqNumber) -> Option<Instant> {
        self.first(seq).map(|e| e.sent_time)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &SampleEntry> {
        self.entries.iter()
    }
}
