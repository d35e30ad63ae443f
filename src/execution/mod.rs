pub mod transfer;

pub use transfer::{TransferConfig, TransferExecutor, TransferReceipt};
