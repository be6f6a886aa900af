//! Field-level conflict analysis.
//!
//! `ConflictAnalyzer::analyze` is pure: it compares two field snapshots of
//! the same entity plus their timestamps and produces a structured analysis.
//! No I/O happens here.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeSet;
use std::time::Duration;

use ledgerline_model::{mergeable_fields, monetary_fields, EntityKind, FieldMap};

/// Tunable analysis policy.
///
/// The penalty and tie-window magnitudes are policy, not derived constants;
/// they live here so deployments can adjust them without touching call sites.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalyzerConfig {
    /// Confidence points deducted per conflicting field.
    pub field_penalty: u8,
    /// Timestamps closer than this are treated as ambiguous ordering.
    pub tie_window: Duration,
}

impl Default for AnalyzerConfig {
    fn default() -> Self {
        Self {
            field_penalty: 15,
            tie_window: Duration::from_secs(5),
        }
    }
}

/// Which side (or combination) the analyzer suggests applying.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SuggestedResolution {
    /// Field-wise merge of both sides.
    Merge,
    /// The local operation wins (later writer).
    Local,
    /// The remote operation wins (later writer).
    Remote,
    /// Ordering is ambiguous on a monetary field; a user must decide.
    Manual,
}

/// Conflict severity, a banding of confidence.
///
/// Low confidence means a severe conflict and vice versa; both directions
/// are pinned down by tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
}

/// Structured result of comparing a local and remote entity snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConflictAnalysis {
    pub has_conflict: bool,
    /// Fields present and divergent on both sides, sorted.
    pub conflicting_fields: Vec<String>,
    /// Fields equal on both sides or present on one side only, sorted.
    pub non_conflicting_fields: Vec<String>,
    /// True when every conflicting field is in the safely-mergeable set and
    /// no monetary field conflicts.
    pub can_auto_resolve: bool,
    pub suggested: SuggestedResolution,
    /// Combined snapshot; present whenever a merge is suggested.
    pub merged_data: Option<FieldMap>,
    /// 0..=100; starts at 100 and drops per conflicting field.
    pub confidence: u8,
    pub severity: Severity,
}

/// Pure conflict analyzer.
#[derive(Debug, Clone, Default)]
pub struct ConflictAnalyzer {
    config: AnalyzerConfig,
}

impl ConflictAnalyzer {
    pub fn new(config: AnalyzerConfig) -> Self {
        Self { config }
    }

    /// Compare a local and remote snapshot of the same entity.
    ///
    /// Classification per field: absent on both sides is skipped; equal
    /// values are non-conflicting; a value present on one side only is an
    /// additive change (non-conflicting, the present value carries into the
    /// merge); divergent values on both sides conflict. Explicit JSON null
    /// counts as absent.
    pub fn analyze(
        &self,
        kind: EntityKind,
        local: &FieldMap,
        remote: &FieldMap,
        local_ts: DateTime<Utc>,
        remote_ts: DateTime<Utc>,
    ) -> ConflictAnalysis {
        let mut conflicting = Vec::new();
        let mut non_conflicting = Vec::new();

        let fields: BTreeSet<&String> = local.keys().chain(remote.keys()).collect();
        let local_is_later = local_ts > remote_ts;

        for field in fields {
            match (present(local.get(field)), present(remote.get(field))) {
                (None, None) => {}
                (Some(a), Some(b)) if a == b => non_conflicting.push(field.clone()),
                (Some(_), Some(_)) => conflicting.push(field.clone()),
                (Some(_), None) | (None, Some(_)) => non_conflicting.push(field.clone()),
            }
        }

        let has_conflict = !conflicting.is_empty();
        let monetary = monetary_fields(kind);
        let mergeable = mergeable_fields(kind);
        let monetary_conflict = conflicting.iter().any(|f| monetary.contains(&f.as_str()));
        let can_auto_resolve = !monetary_conflict
            && conflicting.iter().all(|f| mergeable.contains(&f.as_str()));

        let suggested = if !has_conflict || can_auto_resolve {
            SuggestedResolution::Merge
        } else if monetary_conflict && self.within_tie_window(local_ts, remote_ts) {
            SuggestedResolution::Manual
        } else if local_is_later {
            SuggestedResolution::Local
        } else {
            SuggestedResolution::Remote
        };

        let merged_data = (suggested == SuggestedResolution::Merge).then(|| {
            merge_fields(local, remote, &conflicting, local_is_later)
        });

        let penalty = (self.config.field_penalty as usize).saturating_mul(conflicting.len());
        let confidence = 100u8.saturating_sub(penalty.min(100) as u8);

        ConflictAnalysis {
            has_conflict,
            conflicting_fields: conflicting,
            non_conflicting_fields: non_conflicting,
            can_auto_resolve,
            suggested,
            merged_data,
            confidence,
            severity: severity_for(confidence),
        }
    }

    fn within_tie_window(&self, a: DateTime<Utc>, b: DateTime<Utc>) -> bool {
        let delta = (a - b).abs();
        delta.to_std().map_or(true, |d| d <= self.config.tie_window)
    }
}

fn present(value: Option<&Value>) -> Option<&Value> {
    value.filter(|v| !v.is_null())
}

/// Band confidence into severity. The mapping is inverse: the less confident
/// the analysis, the more severe the conflict.
fn severity_for(confidence: u8) -> Severity {
    match confidence {
        70..=100 => Severity::Low,
        40..=69 => Severity::Medium,
        _ => Severity::High,
    }
}

/// Build the merged snapshot.
///
/// Non-conflicting fields take whichever side has a value. Conflicting
/// fields take the later writer's value, except arrays (tags), which merge
/// as an order-preserving union so neither side's entries are lost.
fn merge_fields(
    local: &FieldMap,
    remote: &FieldMap,
    conflicting: &[String],
    local_is_later: bool,
) -> FieldMap {
    let mut merged = FieldMap::new();
    let fields: BTreeSet<&String> = local.keys().chain(remote.keys()).collect();

    for field in fields {
        let lv = present(local.get(field));
        let rv = present(remote.get(field));
        let value = if conflicting.contains(field) {
            match (lv, rv) {
                (Some(Value::Array(a)), Some(Value::Array(b))) => {
                    Some(Value::Array(union_arrays(a, b)))
                }
                _ if local_is_later => lv.cloned(),
                _ => rv.cloned(),
            }
        } else {
            lv.or(rv).cloned()
        };
        if let Some(value) = value {
            merged.insert(field.clone(), value);
        }
    }
    merged
}

fn union_arrays(a: &[Value], b: &[Value]) -> Vec<Value> {
    let mut out = a.to_vec();
    for v in b {
        if !out.contains(v) {
            out.push(v.clone());
        }
    }
    out
}
