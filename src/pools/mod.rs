//! Storage Pool Reconciliation

mod reconciler;

pub use reconciler::{PoolReconciler, RestoreReport};
