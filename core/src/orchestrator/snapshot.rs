//! Snapshot - save/load orchestration state
//!
//! Serializes the complete engine state (payments, sagas, holds, events,
//! limit counters, queued messages) for pause/resume and crash-recovery
//! testing.
//!
//! # Critical Invariants
//!
//! - A snapshot can only be restored under the same configuration; the
//!   SHA-256 config fingerprint is validated on restore
//! - Restoring replaces the engine state wholesale; partial merges are not
//!   supported

use crate::error::CoreError;
use crate::limits::LimitsSnapshot;
use crate::models::queued_message::QueuedMessage;
use crate::orchestrator::engine::{CoreConfig, OrchestrationState, PaymentOrchestrator};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Complete engine state snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateSnapshot {
    /// SHA-256 fingerprint of the config the snapshot was taken under
    pub config_hash: String,

    pub(crate) orchestration: OrchestrationState,
    pub(crate) limits: LimitsSnapshot,
    pub(crate) queued_messages: Vec<QueuedMessage>,
}

/// Deterministic SHA-256 fingerprint of a config.
///
/// Canonicalizes the JSON representation with sorted object keys so map
/// iteration order cannot change the hash.
pub fn compute_config_hash<T: Serialize>(config: &T) -> Result<String, CoreError> {
    use serde_json::Value;
    use std::collections::BTreeMap;

    let value = serde_json::to_value(config)
        .map_err(|e| CoreError::Internal(format!("config serialization failed: {e}")))?;

    fn canonicalize(value: Value) -> Value {
        match value {
            Value::Object(map) => {
                let sorted: BTreeMap<String, Value> =
                    map.into_iter().map(|(k, v)| (k, canonicalize(v))).collect();
                Value::Object(sorted.into_iter().collect())
            }
            Value::Array(arr) => Value::Array(arr.into_iter().map(canonicalize).collect()),
            other => other,
        }
    }

    let json = serde_json::to_string(&canonicalize(value))
        .map_err(|e| CoreError::Internal(format!("config serialization failed: {e}")))?;

    let mut hasher = Sha256::new();
    hasher.update(json.as_bytes());
    Ok(format!("{:x}", hasher.finalize()))
}

impl PaymentOrchestrator {
    /// Capture the complete engine state.
    pub fn snapshot(&self) -> Result<StateSnapshot, CoreError> {
        let orchestration = self.state_handle().lock().unwrap().clone();
        Ok(StateSnapshot {
            config_hash: compute_config_hash(self.config())?,
            orchestration,
            limits: self.limits().snapshot(),
            queued_messages: self.queue().snapshot(),
        })
    }

    /// Replace the engine state with a snapshot taken under the same
    /// configuration.
    pub fn restore_snapshot(&self, snapshot: StateSnapshot) -> Result<(), CoreError> {
        let expected = compute_config_hash(self.config())?;
        if snapshot.config_hash != expected {
            return Err(CoreError::InvalidConfig(format!(
                "snapshot config hash {} does not match engine config {}",
                snapshot.config_hash, expected
            )));
        }
        *self.state_handle().lock().unwrap() = snapshot.orchestration;
        self.limits().restore(snapshot.limits);
        self.queue().restore(snapshot.queued_messages);
        Ok(())
    }
}

/// Convenience: fingerprint the engine's own config type.
pub fn config_hash(config: &CoreConfig) -> Result<String, CoreError> {
    compute_config_hash(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orchestrator::engine::CoreConfig;

    #[test]
    fn config_hash_is_deterministic() {
        let a = CoreConfig::default();
        let b = CoreConfig::default();
        assert_eq!(
            compute_config_hash(&a).unwrap(),
            compute_config_hash(&b).unwrap()
        );
    }

    #[test]
    fn config_hash_changes_with_config() {
        let a = CoreConfig::default();
        let b = CoreConfig {
            saga_deadline_secs: 42,
            ..CoreConfig::default()
        };
        assert_ne!(
            compute_config_hash(&a).unwrap(),
            compute_config_hash(&b).unwrap()
        );
    }
}
