//! Error types for allocation and reversal.

use thiserror::Error;

use crate::Amount;
use crate::model::{DonorId, TransactionStatus, TxId};
use crate::store::StoreError;

/// Top-level error returned by [`Engine::apply`](super::Engine::apply).
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("allocation failed: {0}")]
    Allocation(#[from] AllocationError),

    #[error("revert failed: {0}")]
    Revert(#[from] RevertError),

    #[error("store rejected the change: {0}")]
    Store(#[from] StoreError),
}

/// Error during an allocation run. Nothing is mapped when one is returned.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum AllocationError {
    #[error("empty selection: {donors} donors, {transactions} transactions")]
    EmptySelection { donors: usize, transactions: usize },

    #[error("insufficient funds: available {available}, required {required}")]
    InsufficientFunds { available: Amount, required: Amount },

    #[error("donor {0} selected more than once")]
    DuplicateDonor(DonorId),

    #[error("transaction {0} selected more than once")]
    DuplicateTransaction(TxId),

    #[error("transaction {0} is {1:?}, only pending transactions can be mapped")]
    NotPending(TxId, TransactionStatus),

    /// No single donor can cover the transaction even though the aggregate can.
    #[error(
        "transaction {transaction} of {amount} exceeds every donor's remaining balance \
         (largest {largest_balance})"
    )]
    Unplaceable {
        transaction: TxId,
        amount: Amount,
        largest_balance: Amount,
    },

    /// A total or a folded balance does not fit in an [`Amount`].
    #[error("amount overflow while computing {0}")]
    AmountOverflow(&'static str),
}

/// Error during a reversal. Nothing is reverted when one is returned.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RevertError {
    #[error("transaction {0}: a reason is required")]
    EmptyReason(TxId),

    #[error("transaction {0} is already reverted")]
    AlreadyReverted(TxId),

    #[error("transaction {0} is mapped but no mapping was supplied")]
    MissingMapping(TxId),

    #[error("mapping references transaction {found}, expected {expected}")]
    MappingMismatch { expected: TxId, found: TxId },

    #[error("transaction {0}: no donor available to receive the returned funds")]
    NoDonorToCredit(TxId),

    #[error("transaction {transaction}: crediting donor {donor} would overflow its balance")]
    AmountOverflow { transaction: TxId, donor: DonorId },
}
