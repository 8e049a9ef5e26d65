//! Allocation engine.
//!
//! The pure [`allocate`] and [`revert`] functions compute mappings, balances
//! and reversal records from plain values. [`Engine`] applies them as
//! commands on top of a store and commits the results. It also supports an
//! async stream of commands.

use chrono::Utc;
use tokio_stream::{Stream, StreamExt};
use tracing::{info, warn};

use crate::model::{DonorId, StudentMapping, TransactionStatus, TxId};
use crate::store::{DonorStore, InMemoryStore, StoreError, TransactionStore};

mod allocate;
pub use allocate::{Allocation, allocate};

mod revert;
pub use revert::{Credit, Reversal, revert};

mod error;
pub use error::{AllocationError, EngineError, RevertError};

/// A request against the engine.
#[derive(Debug, Clone)]
pub enum Command {
    /// Map the selected transactions, in this order, onto the selected donors.
    Allocate {
        donors: Vec<DonorId>,
        transactions: Vec<TxId>,
    },
    /// Void a transaction and return its funds, if it was mapped.
    Revert { transaction: TxId, reason: String },
}

/// What a successfully applied command produced.
#[derive(Debug, Clone)]
pub enum Outcome {
    Allocated(Allocation),
    Reverted(Reversal),
}

/// Applies commands to a donor/transaction store.
///
/// Commands take `&mut self`, so runs against one engine are serialised.
/// Balance commits are additionally version checked by the store.
pub struct Engine<S = InMemoryStore> {
    store: S,
}

impl Engine<InMemoryStore> {
    pub fn new() -> Self {
        Self::with_store(InMemoryStore::new())
    }
}

/// Public API
impl<S: DonorStore + TransactionStore> Engine<S> {
    pub fn with_store(store: S) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn store_mut(&mut self) -> &mut S {
        &mut self.store
    }

    /// Run the engine with the given command stream
    pub async fn run(&mut self, mut stream: impl Stream<Item = Command> + Unpin) {
        while let Some(command) = stream.next().await {
            // a rejected command must not stop the engine, the result is already logged
            let _ = self.apply(command);
        }
    }

    /// Apply a single command and commit its result to the store
    pub fn apply(&mut self, command: Command) -> Result<Outcome, EngineError> {
        match command {
            Command::Allocate {
                donors,
                transactions,
            } => {
                let result = self.apply_allocate(&donors, &transactions);
                match &result {
                    Ok(allocation) => info!(
                        mappings = allocation.mappings.len(),
                        mapped = %allocation.total_mapped,
                        surplus = %allocation.surplus,
                        "allocation applied"
                    ),
                    Err(e) => info!(
                        donors = donors.len(),
                        transactions = transactions.len(),
                        reason = %e,
                        "allocation skipped"
                    ),
                }
                Ok(Outcome::Allocated(result?))
            }
            Command::Revert {
                transaction,
                reason,
            } => {
                let result = self.apply_revert(&transaction, &reason);
                match &result {
                    Ok(reversal) => match &reversal.credit {
                        Some(credit) => info!(
                            tx = %transaction,
                            donor = %credit.donor,
                            amount = %credit.amount,
                            "revert applied"
                        ),
                        None => info!(tx = %transaction, "unmapped revert applied"),
                    },
                    Err(e) => info!(tx = %transaction, reason = %e, "revert skipped"),
                }
                Ok(Outcome::Reverted(result?))
            }
        }
    }
}

/// Private API
impl<S: DonorStore + TransactionStore> Engine<S> {
    /// Apply a `Command::Allocate`:
    /// - Load the selected donors' balances, skipping blocked donors
    /// - Load the selected transactions in the given order
    /// - Compute the allocation
    /// - Refuse transactions the store already holds a mapping for
    /// - Commit balances (version checked), then mappings and statuses
    ///
    /// Every check that can fail runs before the first write, so a rejected
    /// allocation leaves the store untouched.
    fn apply_allocate(
        &mut self,
        donors: &[DonorId],
        transactions: &[TxId],
    ) -> Result<Allocation, EngineError> {
        let mut balances = Vec::with_capacity(donors.len());
        for id in donors {
            let donor = self
                .store
                .donor(id)
                .ok_or_else(|| StoreError::DonorNotFound(id.clone()))?;
            if donor.is_blocked {
                warn!(donor = %id, "blocked donor excluded from allocation");
                continue;
            }
            let balance = self
                .store
                .balance(id)
                .ok_or_else(|| StoreError::DonorNotFound(id.clone()))?;
            balances.push(balance);
        }

        let selected = transactions
            .iter()
            .map(|id| {
                self.store
                    .transaction(id)
                    .cloned()
                    .ok_or_else(|| StoreError::TransactionNotFound(id.clone()))
            })
            .collect::<Result<Vec<_>, _>>()?;

        let allocation = allocate(&balances, &selected, Utc::now())?;

        if let Some(tx) = selected.iter().find(|tx| self.store.is_mapped(&tx.id)) {
            return Err(StoreError::AlreadyMapped(tx.id.clone()).into());
        }

        self.store.commit_balances(&allocation.balances)?;
        for mapping in &allocation.mappings {
            self.store.insert_mapping(mapping.clone())?;
            self.store
                .set_status(&mapping.transaction, TransactionStatus::Mapped)?;
            self.store.record_student_mapping(
                &mapping.donor,
                StudentMapping {
                    student: mapping.student.clone(),
                    amount: mapping.amount,
                },
            )?;
            info!(
                donor = %mapping.donor,
                tx = %mapping.transaction,
                amount = %mapping.amount,
                "transaction mapped"
            );
        }
        if let Some(recipient) = &allocation.surplus_recipient {
            info!(
                donor = %recipient,
                surplus = %allocation.surplus,
                "surplus folded into donor"
            );
        }

        Ok(allocation)
    }

    /// Apply a `Command::Revert`:
    /// - Load the transaction and its active mapping, if any
    /// - Compute the reversal against every stored donor balance
    /// - Work out the credited balance before writing anything
    /// - Store the synthetic record, credit the chosen donor, flip the status
    fn apply_revert(&mut self, transaction: &TxId, reason: &str) -> Result<Reversal, EngineError> {
        let tx = self
            .store
            .transaction(transaction)
            .ok_or_else(|| StoreError::TransactionNotFound(transaction.clone()))?;
        let mapping = self.store.active_mapping(transaction);

        let reversal = revert(tx, mapping, reason, &self.store.balances(), Utc::now())?;

        let credited = match &reversal.credit {
            Some(credit) => {
                let mut balance = self
                    .store
                    .balance(&credit.donor)
                    .ok_or_else(|| StoreError::DonorNotFound(credit.donor.clone()))?;
                balance.unallocated = balance
                    .unallocated
                    .checked_add(credit.amount)
                    .ok_or_else(|| RevertError::AmountOverflow {
                        transaction: transaction.clone(),
                        donor: credit.donor.clone(),
                    })?;
                Some(balance)
            }
            None => None,
        };

        self.store
            .insert_transaction(reversal.pair.reverted.clone())?;
        if let Some(balance) = credited {
            self.store.commit_balances(&[balance])?;
        }
        self.store
            .set_status(transaction, TransactionStatus::Reverted)?;
        self.store.record_reversal(reversal.pair.clone());

        Ok(reversal)
    }
}

impl Default for Engine<InMemoryStore> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Amount;
    use crate::model::{Donor, Mapping, StudentId, Transaction, TransactionSource};

    // test utils

    fn engine_with(donors: &[(&str, u64)], txs: &[(&str, u64)]) -> Engine {
        let mut engine = Engine::new();
        for (id, total) in donors {
            engine
                .store_mut()
                .insert_donor(Donor::new(DonorId::from(*id), "Donor", Amount::from_units(*total)))
                .unwrap();
        }
        for (id, amount) in txs {
            engine
                .store_mut()
                .insert_transaction(Transaction::new(
                    TxId::from(*id),
                    StudentId::new(format!("S-{id}")),
                    "Student",
                    "College",
                    Amount::from_units(*amount),
                ))
                .unwrap();
        }
        engine
    }

    fn allocate_cmd(donors: &[&str], txs: &[&str]) -> Command {
        Command::Allocate {
            donors: donors.iter().map(|d| DonorId::from(*d)).collect(),
            transactions: txs.iter().map(|t| TxId::from(*t)).collect(),
        }
    }

    fn revert_cmd(tx: &str, reason: &str) -> Command {
        Command::Revert {
            transaction: TxId::from(tx),
            reason: reason.to_string(),
        }
    }

    fn balance(engine: &Engine, donor: &str) -> u64 {
        engine
            .store()
            .balance(&DonorId::from(donor))
            .unwrap()
            .unallocated
            .units()
    }

    fn status(engine: &Engine, tx: &str) -> TransactionStatus {
        engine.store().transaction(&TxId::from(tx)).unwrap().status
    }

    fn total_balance(engine: &Engine) -> Amount {
        Amount::checked_sum(engine.store().balances().iter().map(|b| b.unallocated)).unwrap()
    }

    #[test]
    fn new_engine() {
        let engine = Engine::new();
        assert!(engine.store().balances().is_empty());
        assert!(engine.store().mappings().is_empty());
    }

    // Allocate

    #[test]
    fn allocate_commits_mappings_balances_and_statuses() {
        let mut engine = engine_with(
            &[("D1", 35_000), ("D2", 15_000)],
            &[("T1", 30_000), ("T2", 15_000)],
        );

        let outcome = engine
            .apply(allocate_cmd(&["D1", "D2"], &["T1", "T2"]))
            .unwrap();
        let Outcome::Allocated(allocation) = outcome else {
            panic!("expected allocation");
        };
        assert_eq!(allocation.surplus, Amount::from_units(5_000));

        assert_eq!(balance(&engine, "D1"), 10_000);
        assert_eq!(balance(&engine, "D2"), 0);
        assert_eq!(status(&engine, "T1"), TransactionStatus::Mapped);
        assert_eq!(status(&engine, "T2"), TransactionStatus::Mapped);
        assert_eq!(engine.store().mappings().len(), 2);
        assert_eq!(
            engine.store().active_mapping(&TxId::from("T2")).unwrap().donor,
            DonorId::from("D2")
        );

        let d1 = engine.store().donor(&DonorId::from("D1")).unwrap();
        assert_eq!(d1.student_mappings.len(), 1);
        assert_eq!(d1.student_mappings[0].student, StudentId::from("S-T1"));
        assert_eq!(d1.student_mappings[0].amount, Amount::from_units(30_000));
    }

    #[test]
    fn allocate_bumps_balance_versions() {
        let mut engine = engine_with(&[("D1", 100)], &[("T1", 10)]);
        engine.apply(allocate_cmd(&["D1"], &["T1"])).unwrap();
        assert_eq!(engine.store().balance(&DonorId::from("D1")).unwrap().version, 1);
    }

    #[test]
    fn insufficient_funds_leaves_store_untouched() {
        let mut engine = engine_with(&[("D1", 10_000)], &[("T1", 6_000), ("T2", 6_000)]);

        let result = engine.apply(allocate_cmd(&["D1"], &["T1", "T2"]));
        assert!(matches!(
            result,
            Err(EngineError::Allocation(AllocationError::InsufficientFunds { .. }))
        ));

        assert_eq!(balance(&engine, "D1"), 10_000);
        assert_eq!(status(&engine, "T1"), TransactionStatus::Pending);
        assert_eq!(status(&engine, "T2"), TransactionStatus::Pending);
        assert!(engine.store().mappings().is_empty());
    }

    #[test]
    fn blocked_donors_are_excluded() {
        let mut engine = engine_with(&[("D1", 50_000), ("D2", 20_000)], &[("T1", 10_000)]);
        engine
            .store_mut()
            .insert_donor(Donor {
                is_blocked: true,
                ..Donor::new(DonorId::from("D0"), "Blocked", Amount::from_units(90_000))
            })
            .unwrap();

        engine
            .apply(allocate_cmd(&["D0", "D1", "D2"], &["T1"]))
            .unwrap();

        assert_eq!(
            engine.store().active_mapping(&TxId::from("T1")).unwrap().donor,
            DonorId::from("D1")
        );
        assert_eq!(balance(&engine, "D0"), 90_000);
    }

    #[test]
    fn only_blocked_donors_is_an_empty_selection() {
        let mut engine = engine_with(&[], &[("T1", 10)]);
        engine
            .store_mut()
            .insert_donor(Donor {
                is_blocked: true,
                ..Donor::new(DonorId::from("D0"), "Blocked", Amount::from_units(100))
            })
            .unwrap();

        let result = engine.apply(allocate_cmd(&["D0"], &["T1"]));
        assert!(matches!(
            result,
            Err(EngineError::Allocation(AllocationError::EmptySelection {
                donors: 0,
                transactions: 1
            }))
        ));
    }

    #[test]
    fn unknown_donor_fails() {
        let mut engine = engine_with(&[("D1", 100)], &[("T1", 10)]);
        let result = engine.apply(allocate_cmd(&["D1", "D9"], &["T1"]));
        assert!(matches!(
            result,
            Err(EngineError::Store(StoreError::DonorNotFound(_)))
        ));
    }

    #[test]
    fn unknown_transaction_fails() {
        let mut engine = engine_with(&[("D1", 100)], &[]);
        let result = engine.apply(allocate_cmd(&["D1"], &["T9"]));
        assert!(matches!(
            result,
            Err(EngineError::Store(StoreError::TransactionNotFound(_)))
        ));
    }

    #[test]
    fn mapped_transaction_cannot_be_allocated_twice() {
        let mut engine = engine_with(&[("D1", 100), ("D2", 100)], &[("T1", 10)]);
        engine.apply(allocate_cmd(&["D1"], &["T1"])).unwrap();

        let result = engine.apply(allocate_cmd(&["D2"], &["T1"]));
        assert!(matches!(
            result,
            Err(EngineError::Allocation(AllocationError::NotPending(_, TransactionStatus::Mapped)))
        ));
        assert_eq!(engine.store().mappings().len(), 1);
        assert_eq!(balance(&engine, "D2"), 100);
    }

    #[test]
    fn stray_mapping_rejects_the_whole_batch() {
        let mut engine = engine_with(&[("D1", 100)], &[("T1", 10), ("T2", 20)]);
        let t2 = engine.store().transaction(&TxId::from("T2")).unwrap().clone();
        engine
            .store_mut()
            .insert_mapping(Mapping::new(DonorId::from("D1"), &t2, Utc::now()))
            .unwrap();

        let result = engine.apply(allocate_cmd(&["D1"], &["T1", "T2"]));
        assert!(matches!(
            result,
            Err(EngineError::Store(StoreError::AlreadyMapped(ref id))) if id == &TxId::from("T2")
        ));

        let d1 = engine.store().balance(&DonorId::from("D1")).unwrap();
        assert_eq!(d1.unallocated, Amount::from_units(100));
        assert_eq!(d1.version, 0);
        assert_eq!(status(&engine, "T1"), TransactionStatus::Pending);
        assert_eq!(engine.store().mappings().len(), 1);
        let donor = engine.store().donor(&DonorId::from("D1")).unwrap();
        assert!(donor.student_mappings.is_empty());
    }

    #[test]
    fn allocation_overflow_leaves_store_untouched() {
        // D1 keeps u64::MAX - 2 and the surplus of the same size cannot be folded into it
        let mut engine = engine_with(&[("D1", u64::MAX)], &[("T1", 2)]);

        let result = engine.apply(allocate_cmd(&["D1"], &["T1"]));
        assert!(matches!(
            result,
            Err(EngineError::Allocation(AllocationError::AmountOverflow(_)))
        ));
        assert_eq!(balance(&engine, "D1"), u64::MAX);
        assert_eq!(status(&engine, "T1"), TransactionStatus::Pending);
        assert!(engine.store().mappings().is_empty());
    }

    // Revert

    #[test]
    fn revert_credits_highest_capacity_donor() {
        let mut engine = engine_with(
            &[("D1", 35_000), ("D2", 15_000)],
            &[("T1", 30_000), ("T2", 15_000)],
        );
        engine
            .apply(allocate_cmd(&["D1", "D2"], &["T1", "T2"]))
            .unwrap();
        let before = total_balance(&engine);

        // T2 was funded by D2, but D1 has the most capacity now
        engine.apply(revert_cmd("T2", "scholarship cancelled")).unwrap();

        assert_eq!(balance(&engine, "D1"), 25_000);
        assert_eq!(balance(&engine, "D2"), 0);
        assert_eq!(
            before.checked_add(Amount::from_units(15_000)),
            Some(total_balance(&engine))
        );
        assert_eq!(status(&engine, "T2"), TransactionStatus::Reverted);
        assert!(engine.store().active_mapping(&TxId::from("T2")).is_none());

        let pair = &engine.store().reversals()[0];
        assert_eq!(pair.original.id, TxId::from("T2"));
        assert_eq!(pair.reason, "scholarship cancelled");

        let synthetic = engine.store().transaction(&TxId::from("T2-REV")).unwrap();
        assert_eq!(synthetic.source, TransactionSource::SystemRevert);
        assert_eq!(synthetic.amount, Amount::from_units(15_000));
    }

    #[test]
    fn revert_of_pending_transaction_moves_no_funds() {
        let mut engine = engine_with(&[("D1", 500)], &[("T1", 100)]);

        engine.apply(revert_cmd("T1", "entered by mistake")).unwrap();

        assert_eq!(balance(&engine, "D1"), 500);
        assert_eq!(status(&engine, "T1"), TransactionStatus::Reverted);
        assert_eq!(engine.store().reversals().len(), 1);
    }

    #[test]
    fn revert_twice_is_rejected() {
        let mut engine = engine_with(&[("D1", 500)], &[("T1", 100)]);
        engine.apply(allocate_cmd(&["D1"], &["T1"])).unwrap();
        engine.apply(revert_cmd("T1", "first")).unwrap();
        let after_first = balance(&engine, "D1");

        let result = engine.apply(revert_cmd("T1", "second"));
        assert!(matches!(
            result,
            Err(EngineError::Revert(RevertError::AlreadyReverted(_)))
        ));
        assert_eq!(balance(&engine, "D1"), after_first);
        assert_eq!(engine.store().reversals().len(), 1);
    }

    #[test]
    fn revert_without_reason_is_rejected() {
        let mut engine = engine_with(&[("D1", 500)], &[("T1", 100)]);
        let result = engine.apply(revert_cmd("T1", ""));
        assert!(matches!(
            result,
            Err(EngineError::Revert(RevertError::EmptyReason(_)))
        ));
        assert_eq!(status(&engine, "T1"), TransactionStatus::Pending);
    }

    #[test]
    fn revert_credit_overflow_leaves_store_untouched() {
        let mut engine = engine_with(&[("D1", u64::MAX - 1), ("D2", 2)], &[("T1", 2)]);
        engine.apply(allocate_cmd(&["D2"], &["T1"])).unwrap();

        // D1 has the most capacity and cannot take the 2 back
        let result = engine.apply(revert_cmd("T1", "cancelled"));
        assert!(matches!(
            result,
            Err(EngineError::Revert(RevertError::AmountOverflow { .. }))
        ));
        assert_eq!(balance(&engine, "D1"), u64::MAX - 1);
        assert_eq!(status(&engine, "T1"), TransactionStatus::Mapped);
        assert!(engine.store().transaction(&TxId::from("T1-REV")).is_none());
        assert!(engine.store().reversals().is_empty());
    }

    #[test]
    fn reverted_transaction_cannot_be_allocated() {
        let mut engine = engine_with(&[("D1", 500)], &[("T1", 100)]);
        engine.apply(revert_cmd("T1", "void")).unwrap();

        let result = engine.apply(allocate_cmd(&["D1"], &["T1"]));
        assert!(matches!(
            result,
            Err(EngineError::Allocation(AllocationError::NotPending(
                _,
                TransactionStatus::Reverted
            )))
        ));
    }

    //  Async run()

    #[tokio::test]
    async fn run_processes_all_commands() {
        let mut engine = engine_with(&[("D1", 1_000), ("D2", 400)], &[("T1", 300), ("T2", 500)]);
        let commands = vec![
            allocate_cmd(&["D1", "D2"], &["T1", "T2"]),
            revert_cmd("T1", "duplicate"),
        ];

        engine.run(tokio_stream::iter(commands)).await;

        assert_eq!(status(&engine, "T1"), TransactionStatus::Reverted);
        assert_eq!(status(&engine, "T2"), TransactionStatus::Mapped);
    }

    #[tokio::test]
    async fn run_skips_failed_commands_and_continues() {
        let mut engine = engine_with(&[("D1", 100)], &[("T1", 80), ("T2", 50)]);
        let commands = vec![
            allocate_cmd(&["D1"], &["T1", "T2"]), // insufficient funds
            revert_cmd("T9", "unknown"),          // not found
            allocate_cmd(&["D1"], &["T2"]),       // still processed
        ];

        engine.run(tokio_stream::iter(commands)).await;

        assert_eq!(status(&engine, "T1"), TransactionStatus::Pending);
        assert_eq!(status(&engine, "T2"), TransactionStatus::Mapped);
        // 50 remaining plus the 50 surplus folded back into the only donor
        assert_eq!(balance(&engine, "D1"), 100);
    }
}
