use crate::config::ReconciliationConfig;
use rust_decimal::{Decimal, RoundingStrategy};

/// Processing fee charged by the gateway on QRIS-class methods.
///
/// The same policy applies to deposit credits and refunds.
#[derive(Debug, Clone)]
pub struct FeePolicy {
    methods: Vec<String>,
    rate: Decimal,
}

impl FeePolicy {
    pub fn new(methods: Vec<String>, rate: Decimal) -> Self {
        Self { methods, rate }
    }

    pub fn applies_to(&self, method: &str) -> bool {
        self.methods.iter().any(|m| m.eq_ignore_ascii_case(method))
    }

    /// Fee for `amount` paid with `method`, rounded half away from zero.
    pub fn fee_for(&self, method: &str, amount: i64) -> i64 {
        if amount <= 0 || !self.applies_to(method) {
            return 0;
        }
        let fee = (Decimal::from(amount) * self.rate)
            .round_dp_with_strategy(0, RoundingStrategy::MidpointAwayFromZero);
        i64::try_from(fee).unwrap_or(0)
    }

    /// What remains of `amount` after the fee.
    pub fn net_of_fee(&self, method: &str, amount: i64) -> i64 {
        amount - self.fee_for(method, amount)
    }
}

impl From<&ReconciliationConfig> for FeePolicy {
    fn from(cfg: &ReconciliationConfig) -> Self {
        Self::new(cfg.fee_methods.clone(), cfg.fee_rate)
    }
}

impl Default for FeePolicy {
    fn default() -> Self {
        (&ReconciliationConfig::default()).into()
    }
}
