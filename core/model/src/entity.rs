//! Syncable entity kinds and their field policies.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

use ledgerline_common::{Error, Result};

/// Shallow field map used as the wire payload for one entity snapshot.
pub type FieldMap = serde_json::Map<String, Value>;

/// The four record types that participate in sync.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Account,
    Transaction,
    Budget,
    Goal,
}

impl EntityKind {
    /// All syncable kinds, in a stable order.
    pub const ALL: [EntityKind; 4] = [
        EntityKind::Account,
        EntityKind::Transaction,
        EntityKind::Budget,
        EntityKind::Goal,
    ];

    /// Stable string name, matching the remote table name.
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Account => "accounts",
            EntityKind::Transaction => "transactions",
            EntityKind::Budget => "budgets",
            EntityKind::Goal => "goals",
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Fields that carry money and must never be merged automatically.
///
/// This is a declared policy table, not inferred from payload shape: a
/// divergent value on any of these fields forces manual (or explicit)
/// conflict resolution.
pub fn monetary_fields(kind: EntityKind) -> &'static [&'static str] {
    match kind {
        EntityKind::Account => &["balance"],
        EntityKind::Transaction => &["amount"],
        EntityKind::Budget => &["limit_amount", "spent"],
        EntityKind::Goal => &["target_amount", "current_amount"],
    }
}

/// Fields that are safe to merge when both sides changed them.
pub fn mergeable_fields(kind: EntityKind) -> &'static [&'static str] {
    match kind {
        EntityKind::Account => &["name", "notes", "tags"],
        EntityKind::Transaction => &["category", "notes", "tags"],
        EntityKind::Budget => &["notes"],
        EntityKind::Goal => &["name", "notes", "tags"],
    }
}

/// A financial account (checking, savings, credit card, cash).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Account {
    pub id: String,
    pub name: String,
    pub account_type: String,
    pub balance: f64,
    pub currency: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
}

/// A single transaction against an account.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
    pub id: String,
    pub account_id: String,
    pub amount: f64,
    pub category: String,
    pub date: NaiveDate,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
}

/// A spending budget for a category over a period.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Budget {
    pub id: String,
    pub category: String,
    pub limit_amount: f64,
    pub spent: f64,
    pub period: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

/// A savings goal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Goal {
    pub id: String,
    pub name: String,
    pub target_amount: f64,
    pub current_amount: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deadline: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
}

/// Flatten a typed entity into the shallow field map the engine moves around.
pub fn fields_of<T: Serialize>(entity: &T) -> Result<FieldMap> {
    match serde_json::to_value(entity).map_err(|e| Error::Serialization(e.to_string()))? {
        Value::Object(map) => Ok(map),
        other => Err(Error::Serialization(format!(
            "entity did not serialize to an object: {}",
            other
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_transaction() -> Transaction {
        Transaction {
            id: "t1".to_string(),
            account_id: "a1".to_string(),
            amount: 42.5,
            category: "groceries".to_string(),
            date: NaiveDate::from_ymd_opt(2025, 3, 14).unwrap(),
            notes: Some("weekly shop".to_string()),
            tags: vec!["food".to_string()],
        }
    }

    #[test]
    fn test_kind_names_are_table_names() {
        assert_eq!(EntityKind::Transaction.as_str(), "transactions");
        assert_eq!(EntityKind::ALL.len(), 4);
    }

    #[test]
    fn test_kind_serde_snake_case() {
        let json = serde_json::to_string(&EntityKind::Budget).unwrap();
        assert_eq!(json, "\"budget\"");
    }

    #[test]
    fn test_fields_of_transaction() {
        let fields = fields_of(&sample_transaction()).unwrap();
        assert_eq!(fields["amount"], serde_json::json!(42.5));
        assert_eq!(fields["notes"], serde_json::json!("weekly shop"));
        assert!(fields.contains_key("date"));
    }

    #[test]
    fn test_monetary_fields_never_mergeable() {
        for kind in EntityKind::ALL {
            for field in monetary_fields(kind) {
                assert!(
                    !mergeable_fields(kind).contains(field),
                    "{} is declared both monetary and mergeable for {}",
                    field,
                    kind
                );
            }
        }
    }
}
