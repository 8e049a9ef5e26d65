//! Reversal of mapped and unmapped transactions.

use chrono::{DateTime, Utc};
use tracing::warn;

use super::RevertError;
use super::allocate::by_capacity;
use crate::Amount;
use crate::model::{
    DonorBalance, DonorId, Mapping, ReversalPair, Transaction, TransactionStatus,
};

/// Funds returned to a donor by a reversal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credit {
    pub donor: DonorId,
    pub amount: Amount,
}

/// Result of reverting one transaction.
#[derive(Debug, Clone)]
pub struct Reversal {
    pub pair: ReversalPair,
    /// `None` for a transaction that was never mapped.
    pub credit: Option<Credit>,
}

/// Void a transaction, keeping it for audit alongside a synthetic reversal record.
///
/// For a mapped transaction the mapped amount goes back to the donor that
/// currently has the highest unallocated balance (ties by id), which is not
/// necessarily the donor that funded it.
///
/// An already reverted transaction is reported as such before the reason or
/// the mapping are looked at.
pub fn revert(
    transaction: &Transaction,
    mapping: Option<&Mapping>,
    reason: &str,
    donors: &[DonorBalance],
    date: DateTime<Utc>,
) -> Result<Reversal, RevertError> {
    if transaction.status == TransactionStatus::Reverted {
        return Err(RevertError::AlreadyReverted(transaction.id.clone()));
    }

    let reason = reason.trim();
    if reason.is_empty() {
        return Err(RevertError::EmptyReason(transaction.id.clone()));
    }

    if let Some(m) = mapping {
        if m.transaction != transaction.id {
            return Err(RevertError::MappingMismatch {
                expected: transaction.id.clone(),
                found: m.transaction.clone(),
            });
        }
    }

    let returned = match (transaction.status, mapping) {
        (TransactionStatus::Reverted, _) => {
            return Err(RevertError::AlreadyReverted(transaction.id.clone()));
        }
        (TransactionStatus::Mapped, None) => {
            return Err(RevertError::MissingMapping(transaction.id.clone()));
        }
        (TransactionStatus::Mapped, Some(m)) => Some(m.amount),
        (TransactionStatus::Pending, Some(m)) => {
            warn!(
                tx = %transaction.id,
                mapping = %m.id,
                "ignoring mapping of a pending transaction"
            );
            None
        }
        (TransactionStatus::Pending, None) => None,
    };

    let credit = match returned {
        Some(amount) => {
            let recipient = donors
                .iter()
                .min_by(|a, b| by_capacity(a, b))
                .ok_or_else(|| RevertError::NoDonorToCredit(transaction.id.clone()))?;
            if recipient.unallocated.checked_add(amount).is_none() {
                return Err(RevertError::AmountOverflow {
                    transaction: transaction.id.clone(),
                    donor: recipient.donor.clone(),
                });
            }
            Some(Credit {
                donor: recipient.donor.clone(),
                amount,
            })
        }
        None => None,
    };

    let mut original = transaction.clone();
    original.status = TransactionStatus::Reverted;
    let reverted = transaction.reversal_record();

    Ok(Reversal {
        pair: ReversalPair {
            original,
            reverted,
            reason: reason.to_string(),
            date,
        },
        credit,
    })
}
