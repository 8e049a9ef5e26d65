//! Storage collaborators for donors, transactions and their mappings.
//!
//! The engine only talks to these traits. [`InMemoryStore`] backs the CLI and tests.

use std::collections::HashMap;
use thiserror::Error;

use crate::model::{
    Donor, DonorBalance, DonorId, Mapping, ReversalPair, StudentMapping, Transaction,
    TransactionStatus, TxId,
};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("donor {0} not found")]
    DonorNotFound(DonorId),

    #[error("transaction {0} not found")]
    TransactionNotFound(TxId),

    #[error("duplicate donor id {0}")]
    DuplicateDonor(DonorId),

    #[error("duplicate transaction id {0}")]
    DuplicateTransaction(TxId),

    /// Another run committed this donor's balance since it was read.
    #[error("balance of donor {donor} is stale: read version {expected}, stored version {found}")]
    StaleBalance {
        donor: DonorId,
        expected: u64,
        found: u64,
    },

    #[error("transaction {0} already has a mapping")]
    AlreadyMapped(TxId),
}

pub trait DonorStore {
    /// Store a new donor, seeding its balance from [`Donor::unallocated_amount`].
    fn insert_donor(&mut self, donor: Donor) -> Result<(), StoreError>;

    fn donor(&self, id: &DonorId) -> Option<&Donor>;

    /// Donors in insertion order.
    fn donors(&self) -> impl Iterator<Item = &Donor> + '_;

    fn balance(&self, id: &DonorId) -> Option<DonorBalance>;

    /// Balances of all donors in insertion order.
    fn balances(&self) -> Vec<DonorBalance>;

    /// Persist new balances, all or none.
    ///
    /// Each balance's `version` must match the stored one; on success the
    /// stored version is bumped.
    fn commit_balances(&mut self, balances: &[DonorBalance]) -> Result<(), StoreError>;

    fn record_student_mapping(
        &mut self,
        donor: &DonorId,
        mapping: StudentMapping,
    ) -> Result<(), StoreError>;
}

pub trait TransactionStore {
    fn insert_transaction(&mut self, tx: Transaction) -> Result<(), StoreError>;

    fn transaction(&self, id: &TxId) -> Option<&Transaction>;

    /// Transactions in insertion order.
    fn transactions(&self) -> impl Iterator<Item = &Transaction> + '_;

    fn set_status(&mut self, id: &TxId, status: TransactionStatus) -> Result<(), StoreError>;

    /// Store a mapping. A transaction can be mapped at most once.
    fn insert_mapping(&mut self, mapping: Mapping) -> Result<(), StoreError>;

    /// Whether a mapping was ever stored for the transaction, whatever its status.
    fn is_mapped(&self, tx: &TxId) -> bool;

    /// The mapping of a transaction that is currently `Mapped`.
    fn active_mapping(&self, tx: &TxId) -> Option<&Mapping>;

    fn mappings(&self) -> &[Mapping];

    fn record_reversal(&mut self, pair: ReversalPair);

    fn reversals(&self) -> &[ReversalPair];
}

struct DonorEntry {
    donor: Donor,
    balance: DonorBalance,
}

/// Hash-map backed store keeping insertion order for reporting.
#[derive(Default)]
pub struct InMemoryStore {
    donors: HashMap<DonorId, DonorEntry>,
    donor_order: Vec<DonorId>,
    transactions: HashMap<TxId, Transaction>,
    tx_order: Vec<TxId>,
    mappings: Vec<Mapping>,
    /// Index into `mappings` by transaction id
    mapping_index: HashMap<TxId, usize>,
    reversals: Vec<ReversalPair>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl DonorStore for InMemoryStore {
    fn insert_donor(&mut self, donor: Donor) -> Result<(), StoreError> {
        if self.donors.contains_key(&donor.id) {
            return Err(StoreError::DuplicateDonor(donor.id));
        }
        let balance = DonorBalance::new(donor.id.clone(), donor.unallocated_amount());
        self.donor_order.push(donor.id.clone());
        self.donors
            .insert(donor.id.clone(), DonorEntry { donor, balance });
        Ok(())
    }

    fn donor(&self, id: &DonorId) -> Option<&Donor> {
        self.donors.get(id).map(|e| &e.donor)
    }

    fn donors(&self) -> impl Iterator<Item = &Donor> + '_ {
        self.donor_order
            .iter()
            .filter_map(|id| self.donors.get(id))
            .map(|e| &e.donor)
    }

    fn balance(&self, id: &DonorId) -> Option<DonorBalance> {
        self.donors.get(id).map(|e| e.balance.clone())
    }

    fn balances(&self) -> Vec<DonorBalance> {
        self.donor_order
            .iter()
            .filter_map(|id| self.donors.get(id))
            .map(|e| e.balance.clone())
            .collect()
    }

    fn commit_balances(&mut self, balances: &[DonorBalance]) -> Result<(), StoreError> {
        // Check everything first so a stale entry leaves the store untouched
        for balance in balances {
            let entry = self
                .donors
                .get(&balance.donor)
                .ok_or_else(|| StoreError::DonorNotFound(balance.donor.clone()))?;
            if entry.balance.version != balance.version {
                return Err(StoreError::StaleBalance {
                    donor: balance.donor.clone(),
                    expected: balance.version,
                    found: entry.balance.version,
                });
            }
        }

        for balance in balances {
            if let Some(entry) = self.donors.get_mut(&balance.donor) {
                entry.balance.unallocated = balance.unallocated;
                entry.balance.version = balance.version + 1;
            }
        }
        Ok(())
    }

    fn record_student_mapping(
        &mut self,
        donor: &DonorId,
        mapping: StudentMapping,
    ) -> Result<(), StoreError> {
        let entry = self
            .donors
            .get_mut(donor)
            .ok_or_else(|| StoreError::DonorNotFound(donor.clone()))?;
        entry.donor.student_mappings.push(mapping);
        Ok(())
    }
}

impl TransactionStore for InMemoryStore {
    fn insert_transaction(&mut self, tx: Transaction) -> Result<(), StoreError> {
        if self.transactions.contains_key(&tx.id) {
            return Err(StoreError::DuplicateTransaction(tx.id));
        }
        self.tx_order.push(tx.id.clone());
        self.transactions.insert(tx.id.clone(), tx);
        Ok(())
    }

    fn transaction(&self, id: &TxId) -> Option<&Transaction> {
        self.transactions.get(id)
    }

    fn transactions(&self) -> impl Iterator<Item = &Transaction> + '_ {
        self.tx_order
            .iter()
            .filter_map(|id| self.transactions.get(id))
    }

    fn set_status(&mut self, id: &TxId, status: TransactionStatus) -> Result<(), StoreError> {
        let tx = self
            .transactions
            .get_mut(id)
            .ok_or_else(|| StoreError::TransactionNotFound(id.clone()))?;
        tx.status = status;
        Ok(())
    }

    fn insert_mapping(&mut self, mapping: Mapping) -> Result<(), StoreError> {
        if !self.transactions.contains_key(&mapping.transaction) {
            return Err(StoreError::TransactionNotFound(mapping.transaction));
        }
        if self.mapping_index.contains_key(&mapping.transaction) {
            return Err(StoreError::AlreadyMapped(mapping.transaction));
        }
        self.mapping_index
            .insert(mapping.transaction.clone(), self.mappings.len());
        self.mappings.push(mapping);
        Ok(())
    }

    fn is_mapped(&self, tx: &TxId) -> bool {
        self.mapping_index.contains_key(tx)
    }

    fn active_mapping(&self, tx: &TxId) -> Option<&Mapping> {
        let status = self.transactions.get(tx)?.status;
        if status != TransactionStatus::Mapped {
            return None;
        }
        self.mapping_index.get(tx).map(|&idx| &self.mappings[idx])
    }

    fn mappings(&self) -> &[Mapping] {
        &self.mappings
    }

    fn record_reversal(&mut self, pair: ReversalPair) {
        self.reversals.push(pair);
    }

    fn reversals(&self) -> &[ReversalPair] {
        &self.reversals
    }
}
