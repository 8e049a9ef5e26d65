//! Greedy, highest-capacity-first allocation of donor funds to transactions.

use chrono::{DateTime, Utc};
use std::cmp::Ordering;
use std::collections::HashSet;
use tracing::{debug, error};

use super::AllocationError;
use crate::Amount;
use crate::model::{DonorBalance, DonorId, Mapping, Transaction, TransactionStatus, TxId};

/// Result of one allocation run.
#[derive(Debug, Clone)]
pub struct Allocation {
    /// New mappings, in the order the transactions were supplied.
    pub mappings: Vec<Mapping>,
    /// Final balances of every selected donor, highest initial capacity first.
    pub balances: Vec<DonorBalance>,
    /// Selected capacity left over once every transaction was covered.
    pub surplus: Amount,
    /// Donor the surplus was folded into, if there was any.
    pub surplus_recipient: Option<DonorId>,
    pub total_available: Amount,
    pub total_mapped: Amount,
}

impl Allocation {
    /// Every selected unit is either mapped or reported as surplus.
    pub fn is_conserved(&self) -> bool {
        self.total_mapped.checked_add(self.surplus) == Some(self.total_available)
    }

    pub fn balance_of(&self, donor: &DonorId) -> Option<Amount> {
        self.balances
            .iter()
            .find(|b| &b.donor == donor)
            .map(|b| b.unallocated)
    }

    pub fn mapping_for(&self, transaction: &TxId) -> Option<&Mapping> {
        self.mappings.iter().find(|m| &m.transaction == transaction)
    }
}

/// Highest capacity first, ties broken by ascending donor id.
pub(crate) fn by_capacity(a: &DonorBalance, b: &DonorBalance) -> Ordering {
    b.unallocated
        .cmp(&a.unallocated)
        .then_with(|| a.donor.cmp(&b.donor))
}

/// Map every transaction to exactly one donor.
///
/// Donors are scanned in descending capacity order (ties by id), using
/// balances as already reduced by earlier transactions of the same run.
/// Transactions are processed in the order given and never split across
/// donors. Any capacity left over is folded into the donor with the largest
/// remaining balance.
///
/// The call is all-or-nothing: on error no mapping is produced.
pub fn allocate(
    donors: &[DonorBalance],
    transactions: &[Transaction],
    date: DateTime<Utc>,
) -> Result<Allocation, AllocationError> {
    validate_selection(donors, transactions)?;

    let total_available = Amount::checked_sum(donors.iter().map(|d| d.unallocated))
        .ok_or(AllocationError::AmountOverflow("total available"))?;
    let total_required = Amount::checked_sum(transactions.iter().map(|t| t.amount))
        .ok_or(AllocationError::AmountOverflow("total required"))?;
    if total_available < total_required {
        return Err(AllocationError::InsufficientFunds {
            available: total_available,
            required: total_required,
        });
    }

    let mut working = donors.to_vec();
    working.sort_by(by_capacity);

    let mut mappings = Vec::with_capacity(transactions.len());
    for tx in transactions {
        let Some(idx) = working.iter().position(|d| d.unallocated >= tx.amount) else {
            let largest_balance = working
                .iter()
                .map(|d| d.unallocated)
                .max()
                .unwrap_or_default();
            // Aggregate capacity was sufficient, so this is fragmentation, not a shortfall
            error!(
                tx = %tx.id,
                amount = %tx.amount,
                largest_balance = %largest_balance,
                "no single donor can cover transaction, aborting allocation"
            );
            return Err(AllocationError::Unplaceable {
                transaction: tx.id.clone(),
                amount: tx.amount,
                largest_balance,
            });
        };

        let donor = &mut working[idx];
        donor.unallocated -= tx.amount;
        debug!(
            donor = %donor.donor,
            tx = %tx.id,
            amount = %tx.amount,
            remaining = %donor.unallocated,
            "transaction mapped"
        );
        mappings.push(Mapping::new(donor.donor.clone(), tx, date));
    }

    let surplus = total_available.saturating_sub(total_required);
    let mut surplus_recipient = None;
    if !surplus.is_zero() {
        if let Some(recipient) = working.iter_mut().min_by(|a, b| by_capacity(a, b)) {
            recipient.unallocated = recipient
                .unallocated
                .checked_add(surplus)
                .ok_or(AllocationError::AmountOverflow("surplus recipient balance"))?;
            surplus_recipient = Some(recipient.donor.clone());
        }
    }

    Ok(Allocation {
        mappings,
        balances: working,
        surplus,
        surplus_recipient,
        total_available,
        total_mapped: total_required,
    })
}

fn validate_selection(
    donors: &[DonorBalance],
    transactions: &[Transaction],
) -> Result<(), AllocationError> {
    if donors.is_empty() || transactions.is_empty() {
        return Err(AllocationError::EmptySelection {
            donors: donors.len(),
            transactions: transactions.len(),
        });
    }

    let mut seen_donors = HashSet::with_capacity(donors.len());
    for donor in donors {
        if !seen_donors.insert(&donor.donor) {
            return Err(AllocationError::DuplicateDonor(donor.donor.clone()));
        }
    }

    let mut seen_txs = HashSet::with_capacity(transactions.len());
    for tx in transactions {
        if !seen_txs.insert(&tx.id) {
            return Err(AllocationError::DuplicateTransaction(tx.id.clone()));
        }
        if tx.status != TransactionStatus::Pending {
            return Err(AllocationError::NotPending(tx.id.clone(), tx.status));
        }
    }

    Ok(())
}
