pub mod amount;
pub mod csv;
pub mod engine;
pub mod model;
pub mod store;

pub use amount::Amount;
pub use engine::{Command, Engine, Outcome};
pub use model::{Donor, DonorBalance, DonorId, Mapping, Transaction, TransactionStatus, TxId};
