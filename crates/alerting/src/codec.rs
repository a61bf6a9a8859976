//! Cache value encoding

use alert_model::Alert;
use storage::StorageError;

pub(crate) fn encode(alert: &Alert) -> Result<Vec<u8>, StorageError> {
    postcard::to_allocvec(alert).map_err(|e| StorageError::SerializationError(e.to_string()))
}

pub(crate) fn decode(bytes: &[u8]) -> Result<Alert, StorageError> {
    postcard::from_bytes(bytes).map_err(|e| StorageError::SerializationError(e.to_string()))
}
