use std::fmt;

/// Money in whole rupee units, stored as an unsigned integer.
///
/// Addition is only exposed through checked and saturating variants, so a
/// total that does not fit is reported instead of wrapping. `-=` is for
/// callers that have already compared the operands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Amount(u64);

impl Amount {
    pub const ZERO: Amount = Amount(0);

    pub fn from_units(value: u64) -> Self {
        Amount(value)
    }

    pub fn units(self) -> u64 {
        self.0
    }

    pub fn is_zero(self) -> bool {
        self.0 == 0
    }

    pub fn checked_add(self, rhs: Self) -> Option<Self> {
        self.0.checked_add(rhs.0).map(Amount)
    }

    pub fn saturating_add(self, rhs: Self) -> Self {
        Amount(self.0.saturating_add(rhs.0))
    }

    /// Sum of all amounts, or `None` if the total does not fit.
    pub fn checked_sum(amounts: impl IntoIterator<Item = Amount>) -> Option<Self> {
        amounts
            .into_iter()
            .try_fold(Amount::ZERO, |acc, amount| acc.checked_add(amount))
    }

    pub fn checked_sub(self, rhs: Self) -> Option<Self> {
        self.0.checked_sub(rhs.0).map(Amount)
    }

    pub fn saturating_sub(self, rhs: Self) -> Self {
        Amount(self.0.saturating_sub(rhs.0))
    }
}

impl fmt::Display for Amount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::ops::SubAssign for Amount {
    fn sub_assign(&mut self, rhs: Self) {
        self.0 -= rhs.0;
    }
}
