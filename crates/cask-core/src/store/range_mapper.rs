use std::collections::VecDeque;

use crate::error::{CaskError, Result};

/// Maps provisional selector indices down into final dictionary ranges.
///
/// Two FIFO queues, one per selector band. Every high-band value is larger
/// than every low-band value, so a scan over inputs sorted within each
/// band can consume both queues front to back: `remap` drops exhausted
/// head ranges and maps inside the current one. Remapping is strictly
/// downward (`target + size <= source`).
#[derive(Default)]
pub struct RangeMapper {
    low: VecDeque<Range>,
    high: VecDeque<Range>,
}

#[derive(Clone, Copy, Debug)]
struct Range {
    source_begin: u32,
    target_begin: u32,
    size: u32,
}

impl Range {
    #[inline]
    fn contains(&self, input: u32) -> bool {
        input >= self.source_begin && input - self.source_begin < self.size
    }

    #[inline]
    fn exhausted_by(&self, input: u32) -> bool {
        input - self.source_begin >= self.size
    }

    #[inline]
    fn map(&self, input: u32) -> u32 {
        self.target_begin + (input - self.source_begin)
    }
}

impl RangeMapper {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_range(&mut self, low: bool, source_begin: u32, target_begin: u32, size: u32) {
        debug_assert!(target_begin as u64 + size as u64 <= source_begin as u64);
        let range = Range {
            source_begin,
            target_begin,
            size,
        };
        if low {
            self.low.push_back(range);
        } else {
            self.high.push_back(range);
        }
    }

    /// Values below every queued range pass through unchanged; that covers
    /// indices that were already final when they were logged.
    pub fn remap(&mut self, input: u32) -> u32 {
        while let Some(range) = self.high.front() {
            if input < range.source_begin {
                break;
            }
            if range.contains(input) {
                return range.map(input);
            }
            debug_assert!(range.exhausted_by(input));
            self.high.pop_front();
        }
        while let Some(range) = self.low.front() {
            if input < range.source_begin {
                break;
            }
            if range.contains(input) {
                return range.map(input);
            }
            self.low.pop_front();
        }
        input
    }

    /// Feeds the one-past-the-end sentinel of each band through `remap`
    /// and checks that both queues drained completely.
    pub fn validate(&mut self, final_low: u32, final_high: u32) -> Result<()> {
        if self.remap(final_low) != final_low || self.remap(final_high) != final_high {
            return Err(CaskError::corruption(
                "range mapper sentinel landed inside a live range",
            ));
        }
        if !self.low.is_empty() || !self.high.is_empty() {
            return Err(CaskError::corruption(format!(
                "range mapper not drained: {} low / {} high ranges left",
                self.low.len(),
                self.high.len()
            )));
        }
        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        self.low.is_empty() && self.high.is_empty()
    }
}
