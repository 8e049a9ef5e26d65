use std::env;
use std::io;
use std::process::ExitCode;

use scholarship_alloc::csv::{read_donors, read_reversals, read_transactions, write_balances};
use scholarship_alloc::store::{DonorStore, TransactionStore};
use scholarship_alloc::{Command, Engine, TransactionStatus};
use tokio_stream::wrappers::ReceiverStream;
use tracing::level_filters::LevelFilter;
use tracing::{error, warn};
use tracing_subscriber::EnvFilter;

const USAGE: &str = "usage: scholarship-alloc <donors.csv> <transactions.csv> [reversals.csv]";

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(LevelFilter::WARN.into()))
        .with_writer(io::stderr)
        .init();

    let mut args = env::args().skip(1);
    let (Some(donors_path), Some(transactions_path)) = (args.next(), args.next()) else {
        eprintln!("{USAGE}");
        return ExitCode::from(2);
    };
    let reversals_path = args.next();

    for path in [Some(&donors_path), Some(&transactions_path), reversals_path.as_ref()]
        .into_iter()
        .flatten()
    {
        if !path.ends_with(".csv") {
            warn!(path = %path, "input file seems to not be a csv file");
        }
    }

    let mut engine = Engine::new();

    match read_donors(&donors_path) {
        Ok(rows) => {
            for result in rows {
                match result {
                    Ok(donor) => {
                        if let Err(e) = engine.store_mut().insert_donor(donor) {
                            warn!("{e}");
                        }
                    }
                    Err(e) => {
                        warn!("{e}");
                    }
                }
            }
        }
        Err(e) => {
            error!("{e}");
            return ExitCode::FAILURE;
        }
    }

    match read_transactions(&transactions_path) {
        Ok(rows) => {
            for result in rows {
                match result {
                    Ok(tx) => {
                        if let Err(e) = engine.store_mut().insert_transaction(tx) {
                            warn!("{e}");
                        }
                    }
                    Err(e) => {
                        warn!("{e}");
                    }
                }
            }
        }
        Err(e) => {
            error!("{e}");
            return ExitCode::FAILURE;
        }
    }

    // Selection policy: every donor that is not blocked, every pending transaction in file order
    let donors: Vec<_> = engine
        .store()
        .donors()
        .filter(|d| !d.is_blocked)
        .map(|d| d.id.clone())
        .collect();
    let transactions: Vec<_> = engine
        .store()
        .transactions()
        .filter(|t| t.status == TransactionStatus::Pending)
        .map(|t| t.id.clone())
        .collect();

    if !transactions.is_empty() {
        if let Err(e) = engine.apply(Command::Allocate {
            donors,
            transactions,
        }) {
            warn!("{e}");
        }
    }

    let (cmd_sender, cmd_receiver) = tokio::sync::mpsc::channel(16);

    if let Some(path) = reversals_path {
        let rows = match read_reversals(path) {
            Ok(rows) => rows,
            Err(e) => {
                error!("{e}");
                return ExitCode::FAILURE;
            }
        };
        tokio::spawn(async move {
            for result in rows {
                match result {
                    Ok(command) => {
                        if cmd_sender.send(command).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        warn!("{e}");
                    }
                }
            }
        });
    } else {
        drop(cmd_sender);
    }

    engine.run(ReceiverStream::new(cmd_receiver)).await;

    let store = engine.store();
    let balances = store.donors().filter_map(|donor| {
        store
            .balance(&donor.id)
            .map(|balance| (donor, balance.unallocated))
    });
    if let Err(e) = write_balances(io::stdout().lock(), balances) {
        error!("{e}");
        return ExitCode::FAILURE;
    }

    ExitCode::SUCCESS
}
