//! Core domain model for SOAR: opportunities, suggestions, and lifecycle states.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

pub const CRATE_NAME: &str = "soar-core";

/// Rank sentinel for issue classes a strategy does not recognize.
pub const UNRANKED_RANK: i64 = -1;

/// Rank hint placing the domain-wide aggregate ahead of individual findings.
/// Final display ordering is a UI concern.
pub const AGGREGATE_RANK: i64 = 1_000_000;

/// Lifecycle states of an opportunity container.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OpportunityStatus {
    New,
    InProgress,
    Resolved,
    Ignored,
}

impl OpportunityStatus {
    /// Statuses still eligible as reconciliation targets.
    pub const ACTIVE: [OpportunityStatus; 2] =
        [OpportunityStatus::New, OpportunityStatus::InProgress];

    pub fn is_active(self) -> bool {
        Self::ACTIVE.contains(&self)
    }
}

/// Lifecycle states of a suggestion.
///
/// `Fixed` and `Outdated` are stable end states; everything else is still in
/// flight and counts as active when deciding whether an aggregate record may
/// be recreated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SuggestionStatus {
    New,
    Approved,
    InProgress,
    PendingValidation,
    Skipped,
    Error,
    Fixed,
    Outdated,
}

impl SuggestionStatus {
    pub const ALL: [SuggestionStatus; 8] = [
        SuggestionStatus::New,
        SuggestionStatus::Approved,
        SuggestionStatus::InProgress,
        SuggestionStatus::PendingValidation,
        SuggestionStatus::Skipped,
        SuggestionStatus::Error,
        SuggestionStatus::Fixed,
        SuggestionStatus::Outdated,
    ];

    pub fn is_resolved(self) -> bool {
        matches!(self, SuggestionStatus::Fixed | SuggestionStatus::Outdated)
    }

    pub fn is_active(self) -> bool {
        !self.is_resolved()
    }
}

/// Remediation category of a suggestion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SuggestionKind {
    CodeChange,
    ContentUpdate,
    RedirectUpdate,
    MetadataUpdate,
}

/// Human-readable summary and recommendations attached to an opportunity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Guidance {
    pub summary: Option<String>,
    #[serde(default)]
    pub recommendations: Vec<String>,
}

/// Estimated impact of applying a suggestion.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct KpiDeltas {
    pub estimated_traffic_lift: Option<f64>,
    pub estimated_clicks_lift: Option<f64>,
}

/// Identifies the audit run driving one reconciliation pass.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditContext {
    pub site_id: Uuid,
    pub audit_id: String,
    pub site_url: String,
    pub finished_at: DateTime<Utc>,
}

/// Per-site, per-audit-type container owning a family of suggestions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Opportunity {
    pub id: Uuid,
    pub site_id: Uuid,
    pub audit_type: String,
    pub status: OpportunityStatus,
    pub audit_id: Option<String>,
    pub origin: String,
    pub title: String,
    pub description: Option<String>,
    pub runbook: Option<String>,
    pub tags: Vec<String>,
    pub data: Value,
    pub guidance: Option<Guidance>,
    pub updated_by: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Creation payload for a new opportunity; the store assigns id and timestamps.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewOpportunity {
    pub site_id: Uuid,
    pub audit_type: String,
    pub audit_id: Option<String>,
    pub origin: String,
    pub title: String,
    pub description: Option<String>,
    pub runbook: Option<String>,
    pub tags: Vec<String>,
    pub data: Value,
    pub guidance: Option<Guidance>,
}

/// One actionable finding (or the domain-wide aggregate) with a lifecycle status.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Suggestion {
    pub id: Uuid,
    pub opportunity_id: Uuid,
    pub kind: SuggestionKind,
    pub rank: i64,
    pub status: SuggestionStatus,
    pub data: Value,
    pub kpi_deltas: Option<KpiDeltas>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Creation payload produced by a strategy's map step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewSuggestion {
    pub opportunity_id: Uuid,
    pub kind: SuggestionKind,
    pub rank: i64,
    pub status: SuggestionStatus,
    pub data: Value,
    pub kpi_deltas: Option<KpiDeltas>,
}

/// Constant reconciliation key of the domain-wide aggregate for an audit type.
pub fn aggregate_key(audit_type: &str) -> String {
    format!("domain-wide-aggregate|{audit_type}")
}

/// Default reconciliation-key fallback chain: explicit `key` field, the
/// aggregate literal for records flagged `aggregated`, `url|audit_type`
/// otherwise. Returns `None` when none of the three applies.
pub fn default_key(data: &Value, audit_type: &str) -> Option<String> {
    if let Some(key) = data.get("key").and_then(Value::as_str) {
        return Some(key.to_string());
    }
    if data
        .get("aggregated")
        .and_then(Value::as_bool)
        .unwrap_or(false)
    {
        return Some(aggregate_key(audit_type));
    }
    data.get("url")
        .and_then(Value::as_str)
        .map(|url| format!("{url}|{audit_type}"))
}
