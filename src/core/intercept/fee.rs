use crate::proto::primitives::Msat;

const PERMYRIAD_DENOMINATOR: u128 = 10_000;
const MSAT_PER_SAT: u64 = 1_000;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("not enough fees: retained {retained_msat} msat, required {required_msat} msat")]
pub struct InsufficientFee {
    pub retained_msat: RetainedFee,
    pub required_msat: u64,
}

/// Fee left with us after forwarding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetainedFee {
    Msat(u64),
    /// The outgoing amount exceeds the incoming one.
    Negative,
}

impl std::fmt::Display for RetainedFee {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RetainedFee::Msat(v) => write!(f, "{}", v),
            RetainedFee::Negative => write!(f, "<negative>"),
        }
    }
}

/// Minimum fee we keep for opening a channel on someone's behalf.
///
/// Not consulted by the interception path itself, callers decide where the
/// guard belongs (e.g. at payment registration or before provisioning).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FeePolicy {
    /// Proportional fee in 1/10_000ths of the incoming amount
    pub fee_permyriad: u64,
    /// Absolute fee floor
    pub minimum_fee_msat: u64,
}

impl FeePolicy {
    pub fn new(fee_permyriad: u64, minimum_fee_msat: u64) -> Self {
        Self {
            fee_permyriad,
            minimum_fee_msat,
        }
    }

    /// The fee required for `incoming`, proportional part rounded down to
    /// whole satoshis.
    pub fn required_fee_msat(&self, incoming: Msat) -> u64 {
        let proportional =
            incoming.msat() as u128 * self.fee_permyriad as u128 / PERMYRIAD_DENOMINATOR;
        let proportional = u64::try_from(proportional).unwrap_or(u64::MAX);
        let proportional = proportional / MSAT_PER_SAT * MSAT_PER_SAT;
        proportional.max(self.minimum_fee_msat)
    }

    pub fn validate(&self, incoming: Msat, outgoing: Msat) -> Result<(), InsufficientFee> {
        let required_msat = self.required_fee_msat(incoming);
        match incoming.msat().checked_sub(outgoing.msat()) {
            Some(retained) if retained >= required_msat => Ok(()),
            Some(retained) => Err(InsufficientFee {
                retained_msat: RetainedFee::Msat(retained),
                required_msat,
            }),
            None => Err(InsufficientFee {
                retained_msat: RetainedFee::Negative,
                required_msat,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minimum_fee_applies_to_small_payments() {
        let policy = FeePolicy::new(10, 2_000_000);
        // 0.1% of 100_000_000 msat is 100_000 msat, below the floor
        assert_eq!(policy.required_fee_msat(Msat(100_000_000)), 2_000_000);
        assert!(policy.validate(Msat(100_000_000), Msat(98_000_000)).is_ok());
        assert!(policy.validate(Msat(100_000_000), Msat(98_000_001)).is_err());
    }

    #[test]
    fn test_proportional_fee_rounds_down_to_sat() {
        let policy = FeePolicy::new(10, 0);
        // 0.1% of 12_345_678 msat = 12_345.678 msat -> 12_000 msat
        assert_eq!(policy.required_fee_msat(Msat(12_345_678)), 12_000);
        assert!(policy.validate(Msat(12_345_678), Msat(12_333_678)).is_ok());
        assert!(policy.validate(Msat(12_345_678), Msat(12_333_679)).is_err());
    }

    #[test]
    fn test_proportional_fee_above_floor() {
        let policy = FeePolicy::new(40, 2_000_000);
        // 0.4% of 1_000_000_000 msat = 4_000_000 msat
        assert_eq!(policy.required_fee_msat(Msat(1_000_000_000)), 4_000_000);
    }

    #[test]
    fn test_outgoing_above_incoming_fails() {
        let policy = FeePolicy::new(0, 0);
        let err = policy.validate(Msat(1_000), Msat(1_001)).unwrap_err();
        assert_eq!(err.retained_msat, RetainedFee::Negative);
        assert!(policy.validate(Msat(1_000), Msat(1_000)).is_ok());
    }

    #[test]
    fn test_no_overflow_near_max() {
        let policy = FeePolicy::new(10_000, 0);
        assert_eq!(
            policy.required_fee_msat(Msat(u64::MAX)),
            u64::MAX / 1_000 * 1_000
        );
    }

    #[test]
    fn test_error_message() {
        let policy = FeePolicy::new(0, 5_000);
        let err = policy.validate(Msat(10_000), Msat(6_000)).unwrap_err();
        assert_eq!(
            err.to_string(),
            "not enough fees: retained 4000 msat, required 5000 msat"
        );
    }
}
