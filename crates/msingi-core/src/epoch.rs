//! epoch arithmetic
//!
//! Epochs are counted in whole seconds since the UNIX epoch divided by
//! a fixed length. This is the only place that length lives; every
//! other module goes through these helpers.

/// default epoch length: 24 hours, in seconds
pub const DEFAULT_EPOCH_LEN_S: u64 = 86_400;

/// epoch index for a timestamp in seconds
pub fn epoch_of(t_s: u64, epoch_len_s: u64) -> u64 {
    t_s / epoch_len_s
}

/// claim admission window around the current epoch
///
/// A claim for epoch `e` is admissible when
/// `current - max_lag <= e <= current + max_lead`.
pub fn in_claim_window(epoch: u64, current: u64, max_lag: u64, max_lead: u64) -> bool {
    epoch >= current.saturating_sub(max_lag) && epoch <= current.saturating_add(max_lead)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn epoch_boundaries() {
        assert_eq!(epoch_of(0, DEFAULT_EPOCH_LEN_S), 0);
        assert_eq!(epoch_of(86_399, DEFAULT_EPOCH_LEN_S), 0);
        assert_eq!(epoch_of(86_400, DEFAULT_EPOCH_LEN_S), 1);
        assert_eq!(epoch_of(8_640_000, DEFAULT_EPOCH_LEN_S), 100);
    }

    #[test]
    fn window_default_lag_one_lead_zero() {
        // default policy: previous epoch still claimable, future never
        assert!(in_claim_window(100, 100, 1, 0));
        assert!(in_claim_window(99, 100, 1, 0));
        assert!(!in_claim_window(98, 100, 1, 0));
        assert!(!in_claim_window(101, 100, 1, 0));
    }

    #[test]
    fn window_saturates_at_zero() {
        assert!(in_claim_window(0, 0, 1, 0));
        assert!(!in_claim_window(1, 0, 1, 0));
    }
}
