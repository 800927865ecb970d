pub mod catalog;
pub mod transactions;
pub mod values;

pub use crate::catalog::{Catalog, ConcurrencyMode};
pub use crate::transactions::{
    DetectorStrategy, LockManager, LockType, LockableKey, Transaction,
    TransactionConfig, TransactionError, TransactionManager, TransactionResult,
};
pub use crate::values::{Properties, Value};
