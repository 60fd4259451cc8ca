//! Per-source sequence checking.

use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SequenceCheck {
    /// First event seen from this source.
    First,
    InOrder,
    /// Accepted, but this many events went missing before it.
    Gap(u64),
    /// Duplicate or regressed; rejected.
    Stale { last: u64 },
}

impl SequenceCheck {
    pub fn accepted(self) -> bool {
        !matches!(self, SequenceCheck::Stale { .. })
    }
}

#[derive(Debug, Clone, Copy)]
struct SourceState {
    sequence: u64,
    /// Tracker tick of the last accepted event, for eviction.
    touched: u64,
}

/// Remembers the last accepted sequence number of up to `max_sources`
/// sources. A new source beyond that evicts the one heard from least
/// recently; if it comes back, its next event counts as its first.
#[derive(Debug)]
pub struct SequenceTracker {
    last: HashMap<String, SourceState>,
    max_sources: usize,
    tick: u64,
}

impl SequenceTracker {
    pub fn new(max_sources: usize) -> Self {
        Self {
            last: HashMap::new(),
            max_sources: max_sources.max(1),
            tick: 0,
        }
    }

    pub fn observe(&mut self, source: &str, sequence: u64) -> SequenceCheck {
        let check = match self.last.get(source).map(|s| s.sequence) {
            None => SequenceCheck::First,
            Some(last) if sequence <= last => return SequenceCheck::Stale { last },
            Some(last) if sequence == last + 1 => SequenceCheck::InOrder,
            Some(last) => SequenceCheck::Gap(sequence - last - 1),
        };
        if check == SequenceCheck::First && self.last.len() >= self.max_sources {
            self.evict_stalest();
        }
        self.tick += 1;
        self.last.insert(
            source.to_string(),
            SourceState {
                sequence,
                touched: self.tick,
            },
        );
        check
    }

    pub fn last(&self, source: &str) -> Option<u64> {
        self.last.get(source).map(|s| s.sequence)
    }

    pub fn len(&self) -> usize {
        self.last.len()
    }

    pub fn is_empty(&self) -> bool {
        self.last.is_empty()
    }

    fn evict_stalest(&mut self) {
        let stalest = self
            .last
            .iter()
            .min_by_key(|(_, s)| s.touched)
            .map(|(source, _)| source.clone());
        if let Some(source) = stalest {
            self.last.remove(&source);
            tracing::debug!(source = %source, "Sequence state evicted");
        }
    }
}
