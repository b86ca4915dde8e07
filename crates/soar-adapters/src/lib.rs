//! Strategy adapter contract + per-audit-type suggestion strategies.
//!
//! Each audit type supplies one [`SuggestionStrategy`]: how to derive the
//! reconciliation key of a finding, how to shape a new suggestion, how to
//! merge re-detected data into persisted data, and when to veto the outdated
//! transition. The reconciliation engine is generic over this trait.

use serde_json::{Map, Value};
use soar_core::{
    aggregate_key, default_key, KpiDeltas, NewSuggestion, Suggestion, SuggestionKind,
    SuggestionStatus, AGGREGATE_RANK, UNRANKED_RANK,
};
use thiserror::Error;
use uuid::Uuid;

pub const CRATE_NAME: &str = "soar-adapters";

#[derive(Debug, Error)]
pub enum StrategyError {
    #[error("finding has no usable reconciliation key: {0}")]
    MissingKey(String),
    #[error("{0}")]
    Message(String),
}

/// Per-audit-type reconciliation behavior. All methods are pure; no I/O.
pub trait SuggestionStrategy: Send + Sync {
    fn audit_type(&self) -> &'static str;

    /// Deterministic string identity of a finding across runs. Never empty.
    fn build_key(&self, data: &Value) -> Result<String, StrategyError> {
        default_key(data, self.audit_type())
            .ok_or_else(|| StrategyError::MissingKey(compact(data)))
    }

    /// Shapes the creation payload for a finding whose key has no persisted
    /// counterpart yet.
    fn map_new_suggestion(
        &self,
        finding: &Value,
        opportunity_id: Uuid,
    ) -> Result<NewSuggestion, StrategyError>;

    /// Merges a re-detected finding into persisted suggestion data. The
    /// default treats the incoming finding as authoritative.
    fn merge_data(&self, _existing: &Value, incoming: &Value) -> Result<Value, StrategyError> {
        Ok(incoming.clone())
    }

    /// Veto predicate consulted before a suggestion whose key disappeared is
    /// marked outdated. Default: allow the transition.
    fn should_update(&self, _existing: &Suggestion) -> bool {
        true
    }
}

/// Shallow object merge: `incoming` fields win, fields present only in
/// `existing` (human edits, AI output) survive.
pub fn overlay_object(existing: &Value, incoming: &Value) -> Value {
    let mut merged = existing
        .as_object()
        .cloned()
        .unwrap_or_else(Map::new);
    if let Some(fields) = incoming.as_object() {
        for (name, value) in fields {
            merged.insert(name.clone(), value.clone());
        }
    }
    Value::Object(merged)
}

/// [`overlay_object`], then removes transient control fields that only exist
/// to drive reconciliation and do not belong in persisted data.
pub fn overlay_stripping(existing: &Value, incoming: &Value, strip: &[&str]) -> Value {
    let mut merged = overlay_object(existing, incoming);
    if let Some(fields) = merged.as_object_mut() {
        for name in strip {
            fields.remove(*name);
        }
    }
    merged
}

fn strip_fields(data: &Value, strip: &[&str]) -> Value {
    let mut cleaned = data.clone();
    if let Some(fields) = cleaned.as_object_mut() {
        for name in strip {
            fields.remove(*name);
        }
    }
    cleaned
}

fn kpi_deltas_of(finding: &Value) -> Option<KpiDeltas> {
    finding
        .get("kpiDeltas")
        .and_then(|v| serde_json::from_value(v.clone()).ok())
}

fn compact(data: &Value) -> String {
    let text = data.to_string();
    if text.chars().count() > 120 {
        let mut short: String = text.chars().take(120).collect();
        short.push_str("...");
        return short;
    }
    text
}

fn str_field<'a>(finding: &'a Value, name: &str) -> Result<&'a str, StrategyError> {
    finding.get(name).and_then(Value::as_str).ok_or_else(|| {
        StrategyError::Message(format!("finding missing `{name}` field: {}", compact(finding)))
    })
}

/// Tag-length / tag-presence findings for titles, descriptions and H1s.
pub struct MetaTagsStrategy;

impl MetaTagsStrategy {
    fn rank_for(issue: &str) -> i64 {
        match issue {
            "title" => 1,
            "description" => 2,
            "h1" => 3,
            _ => UNRANKED_RANK,
        }
    }
}

impl SuggestionStrategy for MetaTagsStrategy {
    fn audit_type(&self) -> &'static str {
        "meta-tags"
    }

    fn build_key(&self, data: &Value) -> Result<String, StrategyError> {
        if let Some(key) = data.get("key").and_then(Value::as_str) {
            return Ok(key.to_string());
        }
        let url = str_field(data, "url")?;
        let issue = str_field(data, "issue")?;
        Ok(format!("{url}|{issue}"))
    }

    fn map_new_suggestion(
        &self,
        finding: &Value,
        opportunity_id: Uuid,
    ) -> Result<NewSuggestion, StrategyError> {
        let issue = str_field(finding, "issue")?;
        Ok(NewSuggestion {
            opportunity_id,
            kind: SuggestionKind::MetadataUpdate,
            rank: Self::rank_for(issue),
            status: SuggestionStatus::New,
            data: finding.clone(),
            kpi_deltas: kpi_deltas_of(finding),
        })
    }

    fn merge_data(&self, existing: &Value, incoming: &Value) -> Result<Value, StrategyError> {
        Ok(overlay_object(existing, incoming))
    }
}

/// Heading-structure findings (missing H1, duplicated H1, level ordering).
pub struct HeadingsStrategy;

impl HeadingsStrategy {
    fn rank_for(check: &str) -> i64 {
        match check {
            "h1-missing" => 1,
            "multiple-h1" => 2,
            "heading-order-invalid" => 3,
            _ => UNRANKED_RANK,
        }
    }
}

impl SuggestionStrategy for HeadingsStrategy {
    fn audit_type(&self) -> &'static str {
        "headings"
    }

    fn build_key(&self, data: &Value) -> Result<String, StrategyError> {
        if let Some(key) = data.get("key").and_then(Value::as_str) {
            return Ok(key.to_string());
        }
        let url = str_field(data, "url")?;
        let check = str_field(data, "check")?;
        Ok(format!("{url}|{check}"))
    }

    fn map_new_suggestion(
        &self,
        finding: &Value,
        opportunity_id: Uuid,
    ) -> Result<NewSuggestion, StrategyError> {
        let check = str_field(finding, "check")?;
        Ok(NewSuggestion {
            opportunity_id,
            kind: SuggestionKind::ContentUpdate,
            rank: Self::rank_for(check),
            status: SuggestionStatus::New,
            data: finding.clone(),
            kpi_deltas: kpi_deltas_of(finding),
        })
    }

    fn merge_data(&self, existing: &Value, incoming: &Value) -> Result<Value, StrategyError> {
        Ok(overlay_object(existing, incoming))
    }
}

/// Content-gain findings plus the domain-wide aggregate record.
///
/// The `needsRescrape` flag only drives reconciliation and is stripped before
/// data is persisted. The aggregate record keeps its constant key across runs,
/// arrives with its metrics already summed across constituent findings, and is
/// never transitioned to outdated by key absence.
pub struct PrerenderStrategy;

impl PrerenderStrategy {
    fn is_aggregate(&self, data: &Value) -> bool {
        self.build_key(data)
            .map(|key| key == aggregate_key(self.audit_type()))
            .unwrap_or(false)
    }
}

impl SuggestionStrategy for PrerenderStrategy {
    fn audit_type(&self) -> &'static str {
        "prerender"
    }

    fn map_new_suggestion(
        &self,
        finding: &Value,
        opportunity_id: Uuid,
    ) -> Result<NewSuggestion, StrategyError> {
        let rank = if self.is_aggregate(finding) {
            AGGREGATE_RANK
        } else if finding.get("contentGainRatio").is_some() {
            1
        } else {
            UNRANKED_RANK
        };
        Ok(NewSuggestion {
            opportunity_id,
            kind: SuggestionKind::CodeChange,
            rank,
            status: SuggestionStatus::New,
            data: strip_fields(finding, &["needsRescrape"]),
            kpi_deltas: kpi_deltas_of(finding),
        })
    }

    fn merge_data(&self, existing: &Value, incoming: &Value) -> Result<Value, StrategyError> {
        Ok(overlay_stripping(existing, incoming, &["needsRescrape"]))
    }

    fn should_update(&self, existing: &Suggestion) -> bool {
        if self.is_aggregate(&existing.data) {
            return false;
        }
        existing.status != SuggestionStatus::Outdated
    }
}

pub fn strategy_for_audit(audit_type: &str) -> Option<Box<dyn SuggestionStrategy>> {
    match audit_type {
        "meta-tags" => Some(Box::new(MetaTagsStrategy)),
        "headings" => Some(Box::new(HeadingsStrategy)),
        "prerender" => Some(Box::new(PrerenderStrategy)),
        _ => None,
    }
}
