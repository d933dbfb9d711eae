//! Conflict resolution between pending local changes and remote changes.
//!
//! A conflict exists when a remote change arrives for an entity that still
//! has an unconfirmed local change. The server is authoritative, so every
//! resolver here lets remote scalars win; they differ in how much of the
//! local change survives.

use serde_json::{Map, Value};

/// Field carrying the timestamp of the local optimistic change.
pub const LOCAL_TIMESTAMP_FIELD: &str = "_localTimestamp";

/// Field carrying the timestamp the server assigned to the remote change.
pub const REMOTE_TIMESTAMP_FIELD: &str = "_remoteTimestamp";

/// Merges a pending local change with the authoritative remote change.
pub trait ConflictResolver: Send + Sync {
    /// Returns the reconciled value.
    fn resolve(&self, local: &Value, remote: &Value) -> Value;
}

impl<F> ConflictResolver for F
where
    F: Fn(&Value, &Value) -> Value + Send + Sync,
{
    fn resolve(&self, local: &Value, remote: &Value) -> Value {
        self(local, remote)
    }
}

/// Remote wins, with a field-level merge for object-shaped changes.
///
/// When both sides are JSON objects the result holds every local field,
/// overwritten by every remote field. The local side's
/// [`LOCAL_TIMESTAMP_FIELD`] and the remote side's
/// [`REMOTE_TIMESTAMP_FIELD`] are always carried over from their own side.
/// Any other shape (arrays, scalars, null) resolves to the remote value.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FieldMergeResolver;

impl ConflictResolver for FieldMergeResolver {
    fn resolve(&self, local: &Value, remote: &Value) -> Value {
        match (local, remote) {
            (Value::Object(local), Value::Object(remote)) => {
                Value::Object(merge_fields(local, remote))
            }
            _ => remote.clone(),
        }
    }
}

fn merge_fields(local: &Map<String, Value>, remote: &Map<String, Value>) -> Map<String, Value> {
    let mut merged = local.clone();
    for (key, value) in remote {
        merged.insert(key.clone(), value.clone());
    }

    keep_from(&mut merged, local, LOCAL_TIMESTAMP_FIELD);
    keep_from(&mut merged, remote, REMOTE_TIMESTAMP_FIELD);
    merged
}

fn keep_from(merged: &mut Map<String, Value>, side: &Map<String, Value>, field: &str) {
    match side.get(field) {
        Some(value) => {
            merged.insert(field.to_string(), value.clone());
        }
        None => {
            merged.remove(field);
        }
    }
}

/// Remote replaces local unconditionally.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RemoteWinsResolver;

impl ConflictResolver for RemoteWinsResolver {
    fn resolve(&self, _local: &Value, remote: &Value) -> Value {
        remote.clone()
    }
}
