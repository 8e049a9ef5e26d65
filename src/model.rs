//! Core domain types for the allocation engine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::warn;
use uuid::Uuid;

use crate::Amount;

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(id: &str) -> Self {
                Self::new(id)
            }
        }
    };
}

string_id!(
    /// Donor identifier. Ordering is used as the allocation tie-break.
    DonorId
);
string_id!(
    /// Transaction identifier.
    TxId
);
string_id!(
    /// Student identifier.
    StudentId
);

/// Suffix appended to an original transaction id to build its reversal record id.
const REVERSAL_SUFFIX: &str = "-REV";

/// A donor's commitment of funds to one student.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StudentMapping {
    pub student: StudentId,
    pub amount: Amount,
}

/// A donor and everything it has committed so far.
#[derive(Debug, Clone)]
pub struct Donor {
    pub id: DonorId,
    pub name: String,
    /// Cumulative amount ever donated. Only donation intake grows it.
    pub total_donated: Amount,
    pub student_mappings: Vec<StudentMapping>,
    /// Blocked donors must not be selected for new allocations.
    pub is_blocked: bool,
}

impl Donor {
    pub fn new(id: DonorId, name: impl Into<String>, total_donated: Amount) -> Self {
        Self {
            id,
            name: name.into(),
            total_donated,
            student_mappings: Vec::new(),
            is_blocked: false,
        }
    }

    /// Sum of all committed student mappings, saturating at `u64::MAX`.
    pub fn allocated_amount(&self) -> Amount {
        self.student_mappings
            .iter()
            .fold(Amount::ZERO, |acc, m| acc.saturating_add(m.amount))
    }

    /// Donated funds not yet committed to any student.
    ///
    /// This only seeds the donor's balance when the donor is first stored.
    /// After that the store's `DonorBalance` is the live capacity: surplus
    /// folding and reversal credits change it without touching
    /// `student_mappings`.
    ///
    /// An over-committed donor reports zero capacity rather than a negative one.
    pub fn unallocated_amount(&self) -> Amount {
        let allocated = self.allocated_amount();
        match self.total_donated.checked_sub(allocated) {
            Some(unallocated) => unallocated,
            None => {
                warn!(
                    donor = %self.id,
                    total_donated = %self.total_donated,
                    allocated = %allocated,
                    "donor is over-committed"
                );
                Amount::ZERO
            }
        }
    }
}

/// Working capacity of one donor as seen by an allocation or reversal run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DonorBalance {
    pub donor: DonorId,
    pub unallocated: Amount,
    /// Optimistic concurrency counter, bumped by the store on every commit.
    pub version: u64,
}

impl DonorBalance {
    pub fn new(donor: DonorId, unallocated: Amount) -> Self {
        Self {
            donor,
            unallocated,
            version: 0,
        }
    }
}

/// Lifecycle of a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransactionStatus {
    #[default]
    Pending,
    Mapped,
    /// Terminal: reverted transactions are kept for audit, never deleted.
    Reverted,
}

/// Where a transaction record came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransactionSource {
    /// A student disbursement entered by the platform.
    #[default]
    Disbursement,
    /// A synthetic record created when another transaction is reverted.
    SystemRevert,
}

impl fmt::Display for TransactionSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransactionSource::Disbursement => f.write_str("Disbursement"),
            TransactionSource::SystemRevert => f.write_str("System Revert"),
        }
    }
}

/// One student's scholarship disbursement obligation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transaction {
    pub id: TxId,
    /// Fixed once created.
    pub amount: Amount,
    pub student: StudentId,
    pub student_name: String,
    pub college: String,
    pub status: TransactionStatus,
    pub source: TransactionSource,
    /// Set on synthetic reversal records: the transaction they void.
    pub reverses: Option<TxId>,
}

impl Transaction {
    /// Create a new pending disbursement.
    pub fn new(
        id: TxId,
        student: StudentId,
        student_name: impl Into<String>,
        college: impl Into<String>,
        amount: Amount,
    ) -> Self {
        Self {
            id,
            amount,
            student,
            student_name: student_name.into(),
            college: college.into(),
            status: TransactionStatus::Pending,
            source: TransactionSource::Disbursement,
            reverses: None,
        }
    }

    /// Build the synthetic record that voids this transaction.
    pub fn reversal_record(&self) -> Transaction {
        Transaction {
            id: TxId::new(format!("{}{REVERSAL_SUFFIX}", self.id)),
            amount: self.amount,
            student: self.student.clone(),
            student_name: self.student_name.clone(),
            college: self.college.clone(),
            status: TransactionStatus::Reverted,
            source: TransactionSource::SystemRevert,
            reverses: Some(self.id.clone()),
        }
    }
}

/// A committed assignment of one donor's funds to one transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mapping {
    pub id: Uuid,
    pub donor: DonorId,
    pub transaction: TxId,
    pub student: StudentId,
    /// Always the full transaction amount; transactions are never split.
    pub amount: Amount,
    pub date: DateTime<Utc>,
}

impl Mapping {
    pub fn new(donor: DonorId, transaction: &Transaction, date: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            donor,
            transaction: transaction.id.clone(),
            student: transaction.student.clone(),
            amount: transaction.amount,
            date,
        }
    }
}

/// Audit record of a reversal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReversalPair {
    /// The original transaction, with its status already flipped to `Reverted`.
    pub original: Transaction,
    pub reverted: Transaction,
    pub reason: String,
    pub date: DateTime<Utc>,
}
