//! Mode-tagged values and reserved sentinels.
//!
//! Every value that takes part in bidirectional replication is wrapped in an
//! [`Envelope`]. `Active` marks a change authored locally that must be
//! forwarded; `Passive` marks a change received from a peer that must not be
//! forwarded again.
//!
//! Wire/canonical shape: `{"mode": "active" | "passive", "value": …}`.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Ids starting with this prefix are never pruned by directory reconciliation.
pub const IMMORTAL_PREFIX: &str = "~";

/// Reserved per-topic id holding the array of every live id.
pub const DIRECTORY_ID: &str = "~directory";

/// Sentinel meaning "this named value no longer exists".
pub const POISON_PILL: &str = "~poison-pill";

/// Sentinel for a foreign-key field that has no referent.
pub const MISSING_FOREIGN_KEY: &str = "~missing-foreign-key";

/// Sentinel for a field that is loaded but was never written.
pub const INITIAL: &str = "~initial";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", content = "value", rename_all = "lowercase")]
pub enum Envelope<V> {
    /// Authored here; forward outward.
    Active(V),
    /// Received from a peer; never forward.
    Passive(V),
}

/// Replication mode of an [`Envelope`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Active,
    Passive,
}

impl<V> Envelope<V> {
    pub fn mode(&self) -> Mode {
        match self {
            Envelope::Active(_) => Mode::Active,
            Envelope::Passive(_) => Mode::Passive,
        }
    }

    pub fn is_active(&self) -> bool {
        matches!(self, Envelope::Active(_))
    }

    pub fn value(&self) -> &V {
        match self {
            Envelope::Active(v) | Envelope::Passive(v) => v,
        }
    }

    pub fn into_value(self) -> V {
        match self {
            Envelope::Active(v) | Envelope::Passive(v) => v,
        }
    }
}

pub fn is_immortal(id: &str) -> bool {
    id.starts_with(IMMORTAL_PREFIX)
}

pub fn poison_pill() -> Value {
    Value::String(POISON_PILL.to_string())
}

pub fn is_poison_pill(value: &Value) -> bool {
    value.as_str() == Some(POISON_PILL)
}

pub fn missing_foreign_key() -> Value {
    Value::String(MISSING_FOREIGN_KEY.to_string())
}

pub fn is_missing_foreign_key(value: &Value) -> bool {
    value.as_str() == Some(MISSING_FOREIGN_KEY)
}

pub fn initial() -> Value {
    Value::String(INITIAL.to_string())
}

pub fn is_initial(value: &Value) -> bool {
    value.as_str() == Some(INITIAL)
}

/// Read a directory record into its list of ids. Non-string members are
/// skipped.
pub fn ids_from_value(value: &Value) -> Option<Vec<String>> {
    let members = value.as_array()?;
    let ids = members
        .iter()
        .filter_map(|member| match member.as_str() {
            Some(id) => Some(id.to_string()),
            None => {
                log::warn!("Ignoring non-string directory member {member}");
                None
            }
        })
        .collect();
    Some(ids)
}

pub fn ids_to_value(ids: &[String]) -> Value {
    Value::Array(ids.iter().cloned().map(Value::String).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_envelope_wire_shape() {
        let active = Envelope::Active(json!({"x": 3}));
        assert_eq!(
            serde_json::to_value(&active).unwrap(),
            json!({"mode": "active", "value": {"x": 3}})
        );

        let passive: Envelope<Value> =
            serde_json::from_value(json!({"mode": "passive", "value": [1, 2]})).unwrap();
        assert_eq!(passive, Envelope::Passive(json!([1, 2])));
        assert_eq!(passive.mode(), Mode::Passive);
    }

    #[test]
    fn test_mode_changes_canonical_form() {
        let a = serde_json::to_value(Envelope::Active(json!(1))).unwrap();
        let p = serde_json::to_value(Envelope::Passive(json!(1))).unwrap();
        assert_ne!(a, p);
    }

    #[test]
    fn test_sentinels_are_distinct() {
        assert!(is_poison_pill(&poison_pill()));
        assert!(!is_poison_pill(&missing_foreign_key()));
        assert!(is_missing_foreign_key(&missing_foreign_key()));
        assert!(is_initial(&initial()));
        assert!(!is_initial(&Value::Null));
    }

    #[test]
    fn test_immortal_prefix() {
        assert!(is_immortal(DIRECTORY_ID));
        assert!(is_immortal("~game-state"));
        assert!(!is_immortal("piece-17"));
    }

    #[test]
    fn test_directory_ids() {
        let value = json!(["a", 3, "b"]);
        assert_eq!(ids_from_value(&value), Some(vec!["a".to_string(), "b".to_string()]));
        assert_eq!(ids_from_value(&json!("not-an-array")), None);
        assert_eq!(
            ids_to_value(&["x".to_string(), "y".to_string()]),
            json!(["x", "y"])
        );
    }
}
