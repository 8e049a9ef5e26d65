use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::Amount;
use crate::engine::Command;
use crate::model::{Donor, DonorId, StudentId, Transaction, TxId};

/// Errors that can occur when reading or writing csv files
#[derive(Debug, Error)]
pub enum CsvError {
    #[error("{}: failed to open: {source}", .path.display())]
    Open { path: PathBuf, source: csv::Error },

    #[error("line {line}: failed to parse row: {source}")]
    Parse { line: usize, source: csv::Error },

    #[error("line {line}: {field} must not be empty")]
    MissingField { line: usize, field: &'static str },

    #[error("failed to write csv: {0}")]
    Write(#[from] csv::Error),

    #[error("failed to flush csv: {0}")]
    Flush(#[from] io::Error),
}

#[derive(Debug, Deserialize)]
struct DonorRow {
    donor: DonorId,
    name: String,
    total_donated: u64,
    #[serde(default)]
    blocked: bool,
}

#[derive(Debug, Deserialize)]
struct TransactionRow {
    tx: TxId,
    student: StudentId,
    student_name: String,
    college: String,
    amount: u64,
}

#[derive(Debug, Deserialize)]
struct ReversalRow {
    tx: TxId,
    reason: String,
}

#[derive(Debug, Serialize)]
struct BalanceRow<'a> {
    donor: &'a DonorId,
    name: &'a str,
    total_donated: u64,
    unallocated: u64,
    blocked: bool,
}

/// Open a csv file and deserialize its rows, tagging each with its line number
fn read_rows<T: DeserializeOwned>(
    path: &Path,
) -> Result<impl Iterator<Item = Result<(usize, T), CsvError>> + use<T>, CsvError> {
    let reader = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .from_path(path)
        .map_err(|source| CsvError::Open {
            path: path.to_path_buf(),
            source,
        })?;

    Ok(reader
        .into_deserialize::<T>()
        .enumerate()
        .map(|(idx, result)| {
            let line = idx + 2; // 1-indexed, skip header
            result
                .map(|row| (line, row))
                .map_err(|source| CsvError::Parse { line, source })
        }))
}

fn require(line: usize, field: &'static str, value: &str) -> Result<(), CsvError> {
    if value.is_empty() {
        return Err(CsvError::MissingField { line, field });
    }
    Ok(())
}

/// Read donors from a csv file with columns `donor,name,total_donated,blocked`
pub fn read_donors(
    path: impl AsRef<Path>,
) -> Result<impl Iterator<Item = Result<Donor, CsvError>>, CsvError> {
    Ok(read_rows::<DonorRow>(path.as_ref())?.map(|result| {
        let (line, row) = result?;
        require(line, "donor", row.donor.as_str())?;
        let mut donor = Donor::new(row.donor, row.name, Amount::from_units(row.total_donated));
        donor.is_blocked = row.blocked;
        Ok(donor)
    }))
}

/// Read pending transactions from a csv file with columns
/// `tx,student,student_name,college,amount`
pub fn read_transactions(
    path: impl AsRef<Path>,
) -> Result<impl Iterator<Item = Result<Transaction, CsvError>>, CsvError> {
    Ok(read_rows::<TransactionRow>(path.as_ref())?.map(|result| {
        let (line, row) = result?;
        require(line, "tx", row.tx.as_str())?;
        require(line, "student", row.student.as_str())?;
        Ok(Transaction::new(
            row.tx,
            row.student,
            row.student_name,
            row.college,
            Amount::from_units(row.amount),
        ))
    }))
}

/// Read revert commands from a csv file with columns `tx,reason`.
///
/// Blank reasons are passed through; the engine rejects them.
pub fn read_reversals(
    path: impl AsRef<Path>,
) -> Result<impl Iterator<Item = Result<Command, CsvError>>, CsvError> {
    Ok(read_rows::<ReversalRow>(path.as_ref())?.map(|result| {
        let (line, row) = result?;
        require(line, "tx", row.tx.as_str())?;
        Ok(Command::Revert {
            transaction: row.tx,
            reason: row.reason,
        })
    }))
}

/// Write donor balances in csv format with columns
/// `donor,name,total_donated,unallocated,blocked`
pub fn write_balances<'a>(
    writer: impl io::Write,
    balances: impl IntoIterator<Item = (&'a Donor, Amount)>,
) -> Result<(), CsvError> {
    let mut writer = csv::Writer::from_writer(writer);

    for (donor, unallocated) in balances {
        writer.serialize(BalanceRow {
            donor: &donor.id,
            name: &donor.name,
            total_donated: donor.total_donated.units(),
            unallocated: unallocated.units(),
            blocked: donor.is_blocked,
        })?;
    }

    writer.flush()?;
    Ok(())
}
