//! Conflict detection and resolution for optimistic updates
//!
//! An optimistic write applies the expected result to local state
//! immediately. When the backend rejects the write as stale, the caller
//! re-fetches the authoritative copy and reconciles here: `local` is the
//! optimistic copy, `remote` the server copy, and `base` (when known) the
//! pre-mutation snapshot the edit started from.
//!
//! Records are JSON objects; field-level reasoning uses their top-level
//! keys.

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use thiserror::Error;

/// Error types for conflict resolution
#[derive(Error, Debug)]
pub enum ConflictError {
    #[error("manual strategy selected but no resolver supplied")]
    MissingResolver,
}

/// How a detected conflict is resolved
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConflictStrategy {
    /// The version with the later `updated_at` wins; remote by default
    LastWriteWins,

    /// The version with the earlier `updated_at` wins; local by default
    FirstWriteWins,

    /// Three-way field merge; remote is the tie-break authority
    Merge,

    /// Delegate entirely to a caller-supplied resolver function
    Manual,
}

/// A caller-supplied resolver for [`ConflictStrategy::Manual`]
pub type ManualResolver<'a> = &'a (dyn Fn(&Value, &Value) -> Value + Send + Sync);

/// Inputs to [`resolve_conflict`]
pub struct Resolution<'a> {
    pub strategy: ConflictStrategy,
    pub local: &'a Value,
    pub remote: &'a Value,
    pub base: Option<&'a Value>,
    pub resolver: Option<ManualResolver<'a>>,
}

impl<'a> Resolution<'a> {
    pub fn new(strategy: ConflictStrategy, local: &'a Value, remote: &'a Value) -> Self {
        Self {
            strategy,
            local,
            remote,
            base: None,
            resolver: None,
        }
    }

    pub fn base(mut self, base: &'a Value) -> Self {
        self.base = Some(base);
        self
    }

    pub fn resolver(mut self, resolver: ManualResolver<'a>) -> Self {
        self.resolver = Some(resolver);
        self
    }
}

/// Outcome of [`resolve_version_conflict`]
#[derive(Clone, Debug, PartialEq)]
pub struct VersionResolution {
    /// The value to apply to local state
    pub value: Value,
    /// True when local was ahead of remote and was kept
    pub conflict: bool,
}

/// Decide whether local and remote genuinely diverged
///
/// Without a `base` any structural difference counts (conservative).
/// With a `base`, a conflict exists only if both sides changed from it;
/// a one-sided change is an ordinary update, not a conflict.
pub fn has_conflict(local: &Value, remote: &Value, base: Option<&Value>) -> bool {
    match base {
        None => local != remote,
        Some(base) => local != base && remote != base,
    }
}

/// [`has_conflict`] restricted to a stable set of fields
///
/// Comparing a caller-supplied key set keeps detection independent of
/// incidental fields (derived values, client-only annotations) that
/// differ without representing a real divergence.
pub fn has_conflict_in(
    local: &Value,
    remote: &Value,
    base: Option<&Value>,
    fields: &[&str],
) -> bool {
    let project = |value: &Value| -> Vec<Option<Value>> {
        fields
            .iter()
            .map(|f| value.get(*f).cloned())
            .collect()
    };
    let local_p = project(local);
    let remote_p = project(remote);
    match base {
        None => local_p != remote_p,
        Some(base) => {
            let base_p = project(base);
            local_p != base_p && remote_p != base_p
        }
    }
}

/// Produce a resolved value under the selected strategy
pub fn resolve_conflict(resolution: Resolution<'_>) -> Result<Value, ConflictError> {
    let Resolution {
        strategy,
        local,
        remote,
        base,
        resolver,
    } = resolution;

    match strategy {
        ConflictStrategy::LastWriteWins => {
            Ok(match (updated_at(local), updated_at(remote)) {
                (Some(l), Some(r)) if l > r => local.clone(),
                // Server authoritative when timestamps tie or are absent
                _ => remote.clone(),
            })
        }
        ConflictStrategy::FirstWriteWins => {
            Ok(match (updated_at(local), updated_at(remote)) {
                (Some(l), Some(r)) if r < l => remote.clone(),
                _ => local.clone(),
            })
        }
        ConflictStrategy::Merge => Ok(merge(local, remote, base)),
        ConflictStrategy::Manual => match resolver {
            Some(resolve) => Ok(resolve(local, remote)),
            None => Err(ConflictError::MissingResolver),
        },
    }
}

/// Reconcile entities carrying a monotonic `version` field
///
/// Equal or newer remote versions are adopted silently; a remote version
/// behind local flags a conflict and keeps local, surfacing the flag for
/// UI disclosure.
pub fn resolve_version_conflict(local: &Value, remote: &Value) -> VersionResolution {
    let local_version = version_of(local);
    let remote_version = version_of(remote);

    if remote_version >= local_version {
        VersionResolution {
            value: remote.clone(),
            conflict: false,
        }
    } else {
        VersionResolution {
            value: local.clone(),
            conflict: true,
        }
    }
}

/// Three-way field merge
///
/// With a base: a field changed on only one side keeps that side's value;
/// changed on both sides, remote wins. Without a base: start from remote
/// and fold in fields present only in local (additive merge).
fn merge(local: &Value, remote: &Value, base: Option<&Value>) -> Value {
    let (Some(local_map), Some(remote_map)) = (local.as_object(), remote.as_object()) else {
        // Non-object records have no fields to reason about
        return remote.clone();
    };

    match base.and_then(Value::as_object) {
        Some(base_map) => {
            let mut merged = Map::new();
            let mut keys: Vec<&String> = base_map
                .keys()
                .chain(local_map.keys())
                .chain(remote_map.keys())
                .collect();
            keys.sort();
            keys.dedup();

            for key in keys {
                let b = base_map.get(key);
                let l = local_map.get(key);
                let r = remote_map.get(key);

                let local_changed = l != b;
                let remote_changed = r != b;

                let winner = if remote_changed {
                    r
                } else if local_changed {
                    l
                } else {
                    b
                };
                if let Some(value) = winner {
                    merged.insert(key.clone(), value.clone());
                }
            }
            Value::Object(merged)
        }
        None => {
            let mut merged = remote_map.clone();
            for (key, value) in local_map {
                if !merged.contains_key(key) {
                    merged.insert(key.clone(), value.clone());
                }
            }
            Value::Object(merged)
        }
    }
}

/// Extract an `updated_at` timestamp (RFC 3339 string or epoch millis)
fn updated_at(value: &Value) -> Option<DateTime<Utc>> {
    match value.get("updated_at")? {
        Value::String(s) => DateTime::parse_from_rfc3339(s)
            .ok()
            .map(|dt| dt.with_timezone(&Utc)),
        Value::Number(n) => n
            .as_i64()
            .and_then(|ms| DateTime::<Utc>::from_timestamp_millis(ms)),
        _ => None,
    }
}

fn version_of(value: &Value) -> u64 {
    value
        .get("version")
        .and_then(Value::as_u64)
        .unwrap_or(0)
}
