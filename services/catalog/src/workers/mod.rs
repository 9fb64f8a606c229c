//! Event handlers that mutate the record store.

mod deletion;
mod processing;
mod update;

pub use deletion::DeletionWorker;
pub use processing::ProcessingWorker;
pub use update::UpdateWorker;

use crate::record_store::StoreError;
use shutter_pipeline::HandlerError;

/// Store failures other than a missing record are worth retrying
fn store_failure(error: StoreError) -> HandlerError {
    match error {
        StoreError::NotFound(key) => HandlerError::discarded(format!("no record for {key}")),
        other => HandlerError::transient(other.to_string()),
    }
}
