//! Real-time clock arithmetic.
//!
//! Target time is derived from `mcycle`, never from the host clock, so a
//! machine's timing is a pure function of its execution.

/// Target clock frequency (1 GHz, arbitrary but fixed).
pub const CLOCK_FREQ: u64 = 1_000_000_000;

/// Cycles per RTC tick. This cannot change.
pub const RTC_FREQ_DIV: u64 = 100;

/// Convert a cycle count to target time.
#[inline]
pub const fn cycles_to_time(mcycle: u64) -> u64 {
    mcycle / RTC_FREQ_DIV
}

/// Convert target time to the first cycle count at which it is reached.
#[inline]
pub const fn time_to_cycles(time: u64) -> u64 {
    time.saturating_mul(RTC_FREQ_DIV)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conversions() {
        assert_eq!(cycles_to_time(0), 0);
        assert_eq!(cycles_to_time(99), 0);
        assert_eq!(cycles_to_time(100), 1);
        assert_eq!(time_to_cycles(5), 500);
        assert_eq!(time_to_cycles(u64::MAX), u64::MAX);
    }
}
