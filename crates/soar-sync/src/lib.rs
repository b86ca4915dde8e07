//! Reconciliation engine: opportunity upsert + suggestion sync.
//!
//! Audit handlers compute findings and hand them here; this crate converges
//! persisted Opportunity/Suggestion state against them. Repeated runs with the
//! same findings are no-ops, human/AI-owned suggestion fields survive
//! re-detection, and suggestions whose findings disappeared are transitioned
//! to outdated unless the audit's strategy vetoes it.
//!
//! Concurrency contract: one audit execution per (site, audit type) at a time,
//! arbitrated by the caller. Nothing here locks or retries.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use soar_adapters::{overlay_object, strategy_for_audit, SuggestionStrategy};
use soar_core::{
    AuditContext, Guidance, NewOpportunity, Opportunity, OpportunityStatus, Suggestion,
    SuggestionStatus, UNRANKED_RANK,
};
use soar_storage::{FileStore, StoreError, SuggestionClient};
use thiserror::Error;
use tokio::fs;
use tracing::{info, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "soar-sync";

/// Actor recorded on opportunities this engine updates.
pub const UPDATED_BY_ACTOR: &str = "system";

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("failed to fetch opportunities for site {site_id}: {source}")]
    FetchOpportunities {
        site_id: Uuid,
        #[source]
        source: StoreError,
    },
    #[error("failed to create opportunity for site {site_id} (audit {audit_id}): {source}")]
    CreateOpportunity {
        site_id: Uuid,
        audit_id: String,
        #[source]
        source: StoreError,
    },
    #[error("failed to fetch suggestions for opportunity {opportunity_id}: {source}")]
    FetchSuggestions {
        opportunity_id: Uuid,
        #[source]
        source: StoreError,
    },
    #[error("{failed} of {total} suggestions failed to persist for site {site_id}")]
    CreateSuggestions {
        site_id: Uuid,
        failed: usize,
        total: usize,
    },
    #[error("failed to update suggestions for opportunity {opportunity_id}: {source}")]
    UpdateSuggestions {
        opportunity_id: Uuid,
        #[source]
        source: StoreError,
    },
}

/// Opportunity-level fields computed fresh by each audit run.
#[derive(Debug, Clone, PartialEq)]
pub struct OpportunityBlueprint {
    pub title: String,
    pub description: Option<String>,
    pub runbook: Option<String>,
    pub origin: String,
    pub tags: Vec<String>,
    pub data: Value,
    pub guidance: Option<Guidance>,
}

/// Resolves or creates the single active opportunity owning a (site, audit
/// type) family of suggestions. At most one store write per invocation.
///
/// Update path: the freshly computed `data` object is shallow-merged into the
/// persisted one, so fields other processes accumulated survive. A failed save
/// is logged and the merged in-memory opportunity is still returned; the
/// suggestion sync can proceed against it.
pub async fn upsert_opportunity<F>(
    client: &dyn SuggestionClient,
    audit: &AuditContext,
    audit_type: &str,
    build: F,
) -> Result<Opportunity, SyncError>
where
    F: FnOnce(&AuditContext) -> OpportunityBlueprint,
{
    let active = client
        .opportunities_by_site_and_status(audit.site_id, &OpportunityStatus::ACTIVE)
        .await
        .map_err(|source| SyncError::FetchOpportunities {
            site_id: audit.site_id,
            source,
        })?;

    let blueprint = build(audit);

    // When several active opportunities exist for the type, the most recently
    // created one is the reconciliation target.
    let target = active
        .into_iter()
        .filter(|o| o.audit_type == audit_type)
        .max_by_key(|o| o.created_at);

    match target {
        Some(mut opportunity) => {
            opportunity.data = overlay_object(&opportunity.data, &blueprint.data);
            opportunity.audit_id = Some(audit.audit_id.clone());
            opportunity.guidance = blueprint.guidance;
            opportunity.updated_by = Some(UPDATED_BY_ACTOR.to_string());
            if let Err(err) = client.save_opportunity(&opportunity).await {
                warn!(
                    site_id = %audit.site_id,
                    opportunity_id = %opportunity.id,
                    error = %err,
                    "opportunity update not persisted; continuing with in-memory state"
                );
            }
            Ok(opportunity)
        }
        None => client
            .create_opportunity(NewOpportunity {
                site_id: audit.site_id,
                audit_type: audit_type.to_string(),
                audit_id: Some(audit.audit_id.clone()),
                origin: blueprint.origin,
                title: blueprint.title,
                description: blueprint.description,
                runbook: blueprint.runbook,
                tags: blueprint.tags,
                data: blueprint.data,
                guidance: blueprint.guidance,
            })
            .await
            .map_err(|source| SyncError::CreateOpportunity {
                site_id: audit.site_id,
                audit_id: audit.audit_id.clone(),
                source,
            }),
    }
}

/// Counts and per-item error descriptions for one reconciliation pass.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SyncReport {
    pub created: usize,
    pub updated: usize,
    pub unchanged: usize,
    pub outdated: usize,
    pub skipped: Vec<String>,
}

/// Converges persisted suggestions against a batch of findings.
///
/// Matching is by reconciliation key, not id. Matched records get their data
/// merged in place with status untouched; unmatched findings become new
/// suggestions; persisted records whose key stopped appearing are transitioned
/// to outdated in one bulk call, unless the strategy's veto protects them.
///
/// A strategy error on one item skips that item and never aborts the batch; a
/// store error aborts the remainder of the call with no rollback of writes
/// already applied.
pub async fn sync_suggestions(
    client: &dyn SuggestionClient,
    opportunity: &Opportunity,
    findings: &[Value],
    strategy: &dyn SuggestionStrategy,
) -> Result<SyncReport, SyncError> {
    let existing = client
        .suggestions_for(opportunity.id)
        .await
        .map_err(|source| SyncError::FetchSuggestions {
            opportunity_id: opportunity.id,
            source,
        })?;

    let mut report = SyncReport::default();

    // Index persisted suggestions by key. A record whose key cannot be derived
    // is left out entirely: never matched, never marked outdated.
    let mut by_key: BTreeMap<String, Suggestion> = BTreeMap::new();
    for suggestion in existing {
        match strategy.build_key(&suggestion.data) {
            Ok(key) => {
                by_key.insert(key, suggestion);
            }
            Err(err) => {
                warn!(
                    suggestion_id = %suggestion.id,
                    error = %err,
                    "cannot key persisted suggestion; leaving it untouched"
                );
                report
                    .skipped
                    .push(format!("existing suggestion {}: {err}", suggestion.id));
            }
        }
    }

    let mut seen: BTreeSet<String> = BTreeSet::new();
    let mut to_create = Vec::new();

    for finding in findings {
        let key = match strategy.build_key(finding) {
            Ok(key) => key,
            Err(err) => {
                warn!(error = %err, "cannot key finding; skipping it");
                report.skipped.push(err.to_string());
                continue;
            }
        };
        if seen.contains(&key) {
            warn!(%key, "duplicate reconciliation key within one batch; skipping later occurrence");
            report.skipped.push(format!("duplicate key {key}"));
            continue;
        }

        match by_key.get(&key) {
            Some(persisted) => {
                // Status is owned by the downstream workflow; re-detection
                // only moves data.
                match strategy.merge_data(&persisted.data, finding) {
                    Ok(merged) => {
                        seen.insert(key);
                        if merged == persisted.data {
                            report.unchanged += 1;
                            continue;
                        }
                        let mut next = persisted.clone();
                        next.data = merged;
                        client.save_suggestion(&next).await.map_err(|source| {
                            SyncError::UpdateSuggestions {
                                opportunity_id: opportunity.id,
                                source,
                            }
                        })?;
                        report.updated += 1;
                    }
                    Err(err) => {
                        warn!(%key, error = %err, "merge failed; persisted data left as-is");
                        report.skipped.push(format!("merge for {key}: {err}"));
                        // Conservative: the key still counts as seen so the
                        // record is not marked outdated on top of the failure.
                        seen.insert(key);
                    }
                }
            }
            None => match strategy.map_new_suggestion(finding, opportunity.id) {
                Ok(new) => {
                    if new.rank < UNRANKED_RANK {
                        warn!(%key, rank = new.rank, "invalid rank from strategy; skipping finding");
                        report
                            .skipped
                            .push(format!("invalid rank {} for {key}", new.rank));
                        continue;
                    }
                    seen.insert(key);
                    to_create.push(new);
                }
                Err(err) => {
                    warn!(%key, error = %err, "cannot map finding to a suggestion; skipping it");
                    report.skipped.push(format!("map for {key}: {err}"));
                }
            },
        }
    }

    // Staleness: persisted keys that stopped appearing, minus vetoes.
    let mut stale_ids = Vec::new();
    for (key, suggestion) in &by_key {
        if seen.contains(key) {
            continue;
        }
        if suggestion.status == SuggestionStatus::Outdated {
            continue;
        }
        if !strategy.should_update(suggestion) {
            continue;
        }
        stale_ids.push(suggestion.id);
    }

    if !to_create.is_empty() {
        let total = to_create.len();
        let result = client.create_suggestions(to_create).await.map_err(|err| {
            warn!(site_id = %opportunity.site_id, error = %err, "bulk suggestion create failed");
            SyncError::CreateSuggestions {
                site_id: opportunity.site_id,
                failed: total,
                total,
            }
        })?;
        report.created = result.created.len();
        if !result.error_items.is_empty() {
            for item in &result.error_items {
                warn!(
                    site_id = %opportunity.site_id,
                    index = item.index,
                    message = %item.message,
                    "suggestion creation rejected"
                );
            }
            return Err(SyncError::CreateSuggestions {
                site_id: opportunity.site_id,
                failed: result.error_items.len(),
                total,
            });
        }
    }

    if !stale_ids.is_empty() {
        report.outdated = client
            .bulk_update_status(&stale_ids, SuggestionStatus::Outdated)
            .await
            .map_err(|source| SyncError::UpdateSuggestions {
                opportunity_id: opportunity.id,
                source,
            })?;
    }

    info!(
        opportunity_id = %opportunity.id,
        audit_type = %opportunity.audit_type,
        created = report.created,
        updated = report.updated,
        unchanged = report.unchanged,
        outdated = report.outdated,
        skipped = report.skipped.len(),
        "suggestion sync complete"
    );
    Ok(report)
}

/// Registry of known audit types, loaded from `audits.yaml`.
#[derive(Debug, Clone, Deserialize)]
pub struct AuditRegistry {
    pub audits: Vec<AuditConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AuditConfig {
    pub audit_type: String,
    pub display_name: String,
    pub enabled: bool,
    #[serde(default)]
    pub runbook: Option<String>,
    #[serde(default = "default_origin")]
    pub origin: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub guidance: Vec<String>,
    #[serde(default)]
    pub thresholds: Value,
}

fn default_origin() -> String {
    "AUTOMATION".to_string()
}

impl AuditRegistry {
    pub async fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
    }

    pub fn config_for(&self, audit_type: &str) -> Option<&AuditConfig> {
        self.audits.iter().find(|a| a.audit_type == audit_type)
    }
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub store_dir: PathBuf,
    pub workspace_root: PathBuf,
    pub site_id: Uuid,
    pub site_url: String,
}

impl SyncConfig {
    pub fn from_env() -> Self {
        Self {
            store_dir: std::env::var("SOAR_STORE_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./store")),
            workspace_root: PathBuf::from("."),
            site_id: std::env::var("SOAR_SITE_ID")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(Uuid::nil()),
            site_url: std::env::var("SOAR_SITE_URL")
                .unwrap_or_else(|_| "https://example.com".to_string()),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncRunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub audit_type: String,
    pub site_id: Uuid,
    pub opportunity_id: Uuid,
    pub created: usize,
    pub updated: usize,
    pub unchanged: usize,
    pub outdated: usize,
    pub skipped: usize,
    pub reports_dir: String,
}

/// One full reconciliation pass for an audit type: upsert the owning
/// opportunity, sync its suggestions, write the run report.
pub async fn run_audit_sync(
    client: &dyn SuggestionClient,
    config: &SyncConfig,
    audit: &AuditConfig,
    ctx: &AuditContext,
    findings: &[Value],
) -> Result<SyncRunSummary> {
    let started_at = Utc::now();
    let run_id = Uuid::new_v4();
    let strategy = strategy_for_audit(&audit.audit_type)
        .with_context(|| format!("no strategy registered for {}", audit.audit_type))?;

    let opportunity = upsert_opportunity(client, ctx, &audit.audit_type, |ctx| {
        OpportunityBlueprint {
            title: audit.display_name.clone(),
            description: None,
            runbook: audit.runbook.clone(),
            origin: audit.origin.clone(),
            tags: audit.tags.clone(),
            data: serde_json::json!({
                "siteUrl": ctx.site_url,
                "thresholds": audit.thresholds,
            }),
            guidance: Some(Guidance {
                summary: Some(format!(
                    "{} processed {} findings for {}",
                    audit.display_name,
                    findings.len(),
                    ctx.site_url
                )),
                recommendations: audit.guidance.clone(),
            }),
        }
    })
    .await?;

    let report = sync_suggestions(client, &opportunity, findings, strategy.as_ref()).await?;
    let finished_at = Utc::now();

    let reports_dir = config.workspace_root.join("reports").join(run_id.to_string());
    let summary = SyncRunSummary {
        run_id,
        started_at,
        finished_at,
        audit_type: audit.audit_type.clone(),
        site_id: ctx.site_id,
        opportunity_id: opportunity.id,
        created: report.created,
        updated: report.updated,
        unchanged: report.unchanged,
        outdated: report.outdated,
        skipped: report.skipped.len(),
        reports_dir: reports_dir.display().to_string(),
    };
    write_run_report(&reports_dir, &summary, &report.skipped).await?;
    Ok(summary)
}

async fn write_run_report(
    reports_dir: &Path,
    summary: &SyncRunSummary,
    skipped: &[String],
) -> Result<()> {
    fs::create_dir_all(reports_dir)
        .await
        .with_context(|| format!("creating {}", reports_dir.display()))?;

    let brief = format!(
        "# SOAR Sync Brief\n\n- Run ID: `{}`\n- Audit: {}\n- Site: {}\n- Opportunity: `{}`\n- Created: {}\n- Updated: {}\n- Unchanged: {}\n- Outdated: {}\n- Skipped: {}\n",
        summary.run_id,
        summary.audit_type,
        summary.site_id,
        summary.opportunity_id,
        summary.created,
        summary.updated,
        summary.unchanged,
        summary.outdated,
        summary.skipped,
    );
    fs::write(reports_dir.join("sync_brief.md"), brief)
        .await
        .context("writing sync_brief.md")?;

    let report_json = serde_json::to_vec_pretty(&serde_json::json!({
        "summary": summary,
        "skipped": skipped,
    }))
    .context("serializing sync report")?;
    fs::write(reports_dir.join("sync_report.json"), report_json)
        .await
        .context("writing sync_report.json")?;
    Ok(())
}

/// Reads a findings fixture: a JSON array of plain finding records.
pub async fn load_findings(path: &Path) -> Result<Vec<Value>> {
    let text = fs::read_to_string(path)
        .await
        .with_context(|| format!("reading {}", path.display()))?;
    let findings: Vec<Value> =
        serde_json::from_str(&text).with_context(|| format!("parsing {}", path.display()))?;
    Ok(findings)
}

/// Fixture-driven entry point used by the CLI: registry + findings file under
/// the workspace root, file store under the configured store directory.
pub async fn run_sync_once_from_env(audit_type: &str) -> Result<SyncRunSummary> {
    let config = SyncConfig::from_env();
    let registry = AuditRegistry::load(&config.workspace_root.join("audits.yaml")).await?;
    let audit = registry
        .config_for(audit_type)
        .with_context(|| format!("unknown audit type {audit_type}"))?;
    if !audit.enabled {
        bail!("audit type {audit_type} is disabled");
    }

    let findings = load_findings(
        &config
            .workspace_root
            .join("fixtures")
            .join(audit_type)
            .join("findings.json"),
    )
    .await?;

    let client = FileStore::new(&config.store_dir);
    let ctx = AuditContext {
        site_id: config.site_id,
        audit_id: Uuid::new_v4().to_string(),
        site_url: config.site_url.clone(),
        finished_at: Utc::now(),
    };
    run_audit_sync(&client, &config, audit, &ctx, &findings).await
}

/// Markdown digest of the most recent sync runs, for the CLI report command.
pub fn report_recent_markdown(runs: usize, workspace_root: Option<PathBuf>) -> Result<String> {
    let root = workspace_root.unwrap_or_else(|| PathBuf::from("."));
    let reports_root = root.join("reports");
    let mut dirs = std::fs::read_dir(&reports_root)
        .with_context(|| format!("reading {}", reports_root.display()))?
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().map(|ft| ft.is_dir()).unwrap_or(false))
        .collect::<Vec<_>>();
    dirs.sort_by_key(|e| e.metadata().and_then(|m| m.modified()).ok());
    dirs.reverse();
    let dirs = dirs.into_iter().take(runs.max(1)).collect::<Vec<_>>();

    let mut lines = vec!["# SOAR Recent Syncs".to_string(), String::new()];
    for dir in dirs {
        let run_id = dir.file_name().to_string_lossy().to_string();
        let report_path = dir.path().join("sync_report.json");
        let report_value: Value = serde_json::from_str(
            &std::fs::read_to_string(&report_path)
                .with_context(|| format!("reading {}", report_path.display()))?,
        )
        .with_context(|| format!("parsing {}", report_path.display()))?;
        let summary = report_value.get("summary").cloned().unwrap_or(Value::Null);

        lines.push(format!("## Run `{run_id}`"));
        for (label, field) in [
            ("audit", "audit_type"),
            ("created", "created"),
            ("updated", "updated"),
            ("outdated", "outdated"),
        ] {
            if let Some(value) = summary.get(field) {
                lines.push(format!("- {label}: {value}"));
            }
        }
        lines.push(format!("- report: `{}`", report_path.display()));
        lines.push(String::new());
    }

    Ok(lines.join("\n"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use soar_adapters::{MetaTagsStrategy, PrerenderStrategy, StrategyError};
    use soar_core::{aggregate_key, NewSuggestion, SuggestionKind};
    use soar_storage::MemoryStore;
    use tempfile::tempdir;

    fn mk_ctx(site_id: Uuid) -> AuditContext {
        AuditContext {
            site_id,
            audit_id: "audit-1".to_string(),
            site_url: "https://example.com".to_string(),
            finished_at: Utc::now(),
        }
    }

    fn mk_blueprint() -> OpportunityBlueprint {
        OpportunityBlueprint {
            title: "Prerender content gaps".to_string(),
            description: None,
            runbook: Some("https://runbooks.example.com/prerender".to_string()),
            origin: "AUTOMATION".to_string(),
            tags: vec!["Traffic acquisition".to_string()],
            data: json!({ "contentGainThreshold": 1.5 }),
            guidance: Some(Guidance {
                summary: Some("Prerender pages with low initial content".to_string()),
                recommendations: vec!["Enable server-side rendering".to_string()],
            }),
        }
    }

    async fn seed_opportunity(store: &MemoryStore, site_id: Uuid, audit_type: &str) -> Opportunity {
        upsert_opportunity(store, &mk_ctx(site_id), audit_type, |_| mk_blueprint())
            .await
            .expect("upsert")
    }

    async fn seed_suggestion(
        store: &MemoryStore,
        opportunity_id: Uuid,
        data: Value,
        status: SuggestionStatus,
    ) -> Suggestion {
        let result = store
            .create_suggestions(vec![NewSuggestion {
                opportunity_id,
                kind: SuggestionKind::CodeChange,
                rank: 1,
                status: SuggestionStatus::New,
                data,
                kpi_deltas: None,
            }])
            .await
            .expect("create");
        let mut suggestion = result.created.into_iter().next().expect("one created");
        if suggestion.status != status {
            suggestion.status = status;
            store.save_suggestion(&suggestion).await.expect("save");
        }
        suggestion
    }

    /// Strategy that vetoes every outdated transition.
    struct FrozenStrategy;

    impl SuggestionStrategy for FrozenStrategy {
        fn audit_type(&self) -> &'static str {
            "prerender"
        }

        fn map_new_suggestion(
            &self,
            finding: &Value,
            opportunity_id: Uuid,
        ) -> Result<NewSuggestion, StrategyError> {
            PrerenderStrategy.map_new_suggestion(finding, opportunity_id)
        }

        fn should_update(&self, _existing: &Suggestion) -> bool {
            false
        }
    }

    #[tokio::test]
    async fn upsert_creates_opportunity_on_first_run() {
        let store = MemoryStore::new();
        let site_id = Uuid::new_v4();
        let opportunity = seed_opportunity(&store, site_id, "prerender").await;

        assert_eq!(opportunity.site_id, site_id);
        assert_eq!(opportunity.audit_type, "prerender");
        assert_eq!(opportunity.status, OpportunityStatus::New);
        assert_eq!(opportunity.audit_id.as_deref(), Some("audit-1"));
        assert_eq!(opportunity.data["contentGainThreshold"], 1.5);
    }

    #[tokio::test]
    async fn upsert_merges_data_and_preserves_foreign_fields() {
        let store = MemoryStore::new();
        let site_id = Uuid::new_v4();
        let first = seed_opportunity(&store, site_id, "prerender").await;

        // Another process tacks extra metadata onto the opportunity.
        let mut annotated = first.clone();
        annotated.data["externalNote"] = json!("added by reporting job");
        store.save_opportunity(&annotated).await.unwrap();

        let mut ctx = mk_ctx(site_id);
        ctx.audit_id = "audit-2".to_string();
        let second = upsert_opportunity(&store, &ctx, "prerender", |_| {
            let mut blueprint = mk_blueprint();
            blueprint.data = json!({ "contentGainThreshold": 2.0 });
            blueprint
        })
        .await
        .unwrap();

        assert_eq!(second.id, first.id);
        assert_eq!(second.data["contentGainThreshold"], 2.0);
        assert_eq!(second.data["externalNote"], "added by reporting job");
        assert_eq!(second.audit_id.as_deref(), Some("audit-2"));
        assert_eq!(second.updated_by.as_deref(), Some(UPDATED_BY_ACTOR));

        let active = store
            .opportunities_by_site_and_status(site_id, &OpportunityStatus::ACTIVE)
            .await
            .unwrap();
        assert_eq!(active.len(), 1);
    }

    #[tokio::test]
    async fn upsert_targets_most_recently_created_active_opportunity() {
        let store = MemoryStore::new();
        let site_id = Uuid::new_v4();
        let older = seed_opportunity(&store, site_id, "prerender").await;
        let newer = store
            .create_opportunity(NewOpportunity {
                site_id,
                audit_type: "prerender".to_string(),
                audit_id: None,
                origin: "AUTOMATION".to_string(),
                title: "Prerender content gaps".to_string(),
                description: None,
                runbook: None,
                tags: vec![],
                data: json!({}),
                guidance: None,
            })
            .await
            .unwrap();

        let target = upsert_opportunity(&store, &mk_ctx(site_id), "prerender", |_| mk_blueprint())
            .await
            .unwrap();
        assert_eq!(target.id, newer.id);
        assert_ne!(target.id, older.id);
    }

    #[tokio::test]
    async fn sync_is_idempotent_for_identical_findings() {
        let store = MemoryStore::new();
        let opportunity = seed_opportunity(&store, Uuid::new_v4(), "prerender").await;
        let findings = vec![
            json!({ "url": "/p1", "contentGainRatio": 2.5 }),
            json!({ "key": aggregate_key("prerender"), "totalContentGain": 2.5, "urlCount": 1 }),
        ];

        let first = sync_suggestions(&store, &opportunity, &findings, &PrerenderStrategy)
            .await
            .unwrap();
        assert_eq!(first.created, 2);

        let second = sync_suggestions(&store, &opportunity, &findings, &PrerenderStrategy)
            .await
            .unwrap();
        assert_eq!(second.created, 0);
        assert_eq!(second.updated, 0);
        assert_eq!(second.unchanged, 2);
        assert_eq!(second.outdated, 0);

        let persisted = store.suggestions_for(opportunity.id).await.unwrap();
        assert_eq!(persisted.len(), 2);
        assert!(persisted
            .iter()
            .all(|s| s.status == SuggestionStatus::New));
    }

    #[tokio::test]
    async fn sync_never_creates_two_suggestions_for_one_key() {
        let store = MemoryStore::new();
        let opportunity = seed_opportunity(&store, Uuid::new_v4(), "prerender").await;
        let findings = vec![
            json!({ "url": "/p1", "contentGainRatio": 2.5 }),
            json!({ "url": "/p1", "contentGainRatio": 3.0 }),
        ];

        let report = sync_suggestions(&store, &opportunity, &findings, &PrerenderStrategy)
            .await
            .unwrap();
        assert_eq!(report.created, 1);
        assert_eq!(report.skipped.len(), 1);
        assert_eq!(store.suggestions_for(opportunity.id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn sync_updates_marks_stale_and_creates() {
        let store = MemoryStore::new();
        let opportunity = seed_opportunity(&store, Uuid::new_v4(), "prerender").await;
        let kept = seed_suggestion(
            &store,
            opportunity.id,
            json!({ "url": "/a", "contentGainRatio": 1.8 }),
            SuggestionStatus::New,
        )
        .await;
        let dropped = seed_suggestion(
            &store,
            opportunity.id,
            json!({ "url": "/b", "contentGainRatio": 1.9 }),
            SuggestionStatus::New,
        )
        .await;

        let findings = vec![
            json!({ "url": "/a", "contentGainRatio": 2.2 }),
            json!({ "url": "/c", "contentGainRatio": 4.0 }),
        ];
        let report = sync_suggestions(&store, &opportunity, &findings, &PrerenderStrategy)
            .await
            .unwrap();

        assert_eq!(report.created, 1);
        assert_eq!(report.updated, 1);
        assert_eq!(report.outdated, 1);

        let kept = store.suggestion(kept.id).await.unwrap();
        assert_eq!(kept.status, SuggestionStatus::New);
        assert_eq!(kept.data["contentGainRatio"], 2.2);
        let dropped = store.suggestion(dropped.id).await.unwrap();
        assert_eq!(dropped.status, SuggestionStatus::Outdated);
        assert_eq!(store.suggestions_for(opportunity.id).await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn veto_keeps_absent_suggestion_in_prior_status() {
        let store = MemoryStore::new();
        let opportunity = seed_opportunity(&store, Uuid::new_v4(), "prerender").await;
        let protected = seed_suggestion(
            &store,
            opportunity.id,
            json!({ "url": "/b", "contentGainRatio": 1.9 }),
            SuggestionStatus::Approved,
        )
        .await;

        let findings = vec![json!({ "url": "/a", "contentGainRatio": 2.2 })];
        let report = sync_suggestions(&store, &opportunity, &findings, &FrozenStrategy)
            .await
            .unwrap();

        assert_eq!(report.outdated, 0);
        let protected = store.suggestion(protected.id).await.unwrap();
        assert_eq!(protected.status, SuggestionStatus::Approved);
    }

    #[tokio::test]
    async fn merge_preserves_human_and_ai_owned_fields() {
        let store = MemoryStore::new();
        let opportunity = seed_opportunity(&store, Uuid::new_v4(), "prerender").await;
        let edited = seed_suggestion(
            &store,
            opportunity.id,
            json!({
                "url": "/a",
                "contentGainRatio": 1.8,
                "aiSuggestion": "Serve rendered HTML",
                "toOverride": true,
            }),
            SuggestionStatus::InProgress,
        )
        .await;

        let findings = vec![json!({ "url": "/a", "contentGainRatio": 2.6, "needsRescrape": true })];
        sync_suggestions(&store, &opportunity, &findings, &PrerenderStrategy)
            .await
            .unwrap();

        let edited = store.suggestion(edited.id).await.unwrap();
        assert_eq!(edited.status, SuggestionStatus::InProgress);
        assert_eq!(edited.data["aiSuggestion"], "Serve rendered HTML");
        assert_eq!(edited.data["toOverride"], true);
        assert_eq!(edited.data["contentGainRatio"], 2.6);
        assert!(edited.data.get("needsRescrape").is_none());
    }

    #[tokio::test]
    async fn aggregate_record_is_updated_in_place_never_duplicated() {
        let store = MemoryStore::new();
        let opportunity = seed_opportunity(&store, Uuid::new_v4(), "prerender").await;
        let aggregate = seed_suggestion(
            &store,
            opportunity.id,
            json!({ "key": aggregate_key("prerender"), "totalContentGain": 5.0, "urlCount": 2 }),
            SuggestionStatus::New,
        )
        .await;

        // New run: detail metrics dropped to zero, the aggregate still rides along.
        let findings =
            vec![json!({ "key": aggregate_key("prerender"), "totalContentGain": 0.0, "urlCount": 0 })];
        let report = sync_suggestions(&store, &opportunity, &findings, &PrerenderStrategy)
            .await
            .unwrap();

        assert_eq!(report.created, 0);
        assert_eq!(report.updated, 1);
        assert_eq!(report.outdated, 0);
        let persisted = store.suggestions_for(opportunity.id).await.unwrap();
        assert_eq!(persisted.len(), 1);
        assert_eq!(persisted[0].id, aggregate.id);
        assert_eq!(persisted[0].status, SuggestionStatus::New);
        assert_eq!(persisted[0].data["totalContentGain"], 0.0);
    }

    #[tokio::test]
    async fn unrecognized_issue_class_creates_unranked_suggestion() {
        let store = MemoryStore::new();
        let opportunity = seed_opportunity(&store, Uuid::new_v4(), "meta-tags").await;
        let findings = vec![json!({ "url": "/p1", "issue": "og-image" })];

        sync_suggestions(&store, &opportunity, &findings, &MetaTagsStrategy)
            .await
            .unwrap();
        let persisted = store.suggestions_for(opportunity.id).await.unwrap();
        assert_eq!(persisted.len(), 1);
        assert_eq!(persisted[0].rank, UNRANKED_RANK);
    }

    #[tokio::test]
    async fn malformed_finding_is_skipped_without_blocking_the_batch() {
        let store = MemoryStore::new();
        let opportunity = seed_opportunity(&store, Uuid::new_v4(), "meta-tags").await;
        let findings = vec![
            json!({ "pageviews": 42 }),
            json!({ "url": "/p1", "issue": "title" }),
        ];

        let report = sync_suggestions(&store, &opportunity, &findings, &MetaTagsStrategy)
            .await
            .unwrap();
        assert_eq!(report.created, 1);
        assert_eq!(report.skipped.len(), 1);
    }

    /// Strategy that maps findings to payloads the store rejects.
    struct BadPayloadStrategy;

    impl SuggestionStrategy for BadPayloadStrategy {
        fn audit_type(&self) -> &'static str {
            "prerender"
        }

        fn map_new_suggestion(
            &self,
            _finding: &Value,
            opportunity_id: Uuid,
        ) -> Result<NewSuggestion, StrategyError> {
            Ok(NewSuggestion {
                opportunity_id,
                kind: SuggestionKind::CodeChange,
                rank: 1,
                status: SuggestionStatus::New,
                data: json!("not an object"),
                kpi_deltas: None,
            })
        }
    }

    #[tokio::test]
    async fn rejected_creations_surface_as_a_single_error_naming_the_site() {
        let store = MemoryStore::new();
        let site_id = Uuid::new_v4();
        let opportunity = seed_opportunity(&store, site_id, "prerender").await;
        let findings = vec![json!({ "url": "/p1", "contentGainRatio": 2.0 })];

        let err = sync_suggestions(&store, &opportunity, &findings, &BadPayloadStrategy)
            .await
            .unwrap_err();
        match err {
            SyncError::CreateSuggestions {
                site_id: reported,
                failed,
                total,
            } => {
                assert_eq!(reported, site_id);
                assert_eq!(failed, 1);
                assert_eq!(total, 1);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn two_page_scenario_converges_to_expected_statuses() {
        let store = MemoryStore::new();
        let opportunity = seed_opportunity(&store, Uuid::new_v4(), "prerender").await;
        let p1 = seed_suggestion(
            &store,
            opportunity.id,
            json!({ "url": "/p1", "contentGainRatio": 2.0 }),
            SuggestionStatus::New,
        )
        .await;
        let p2 = seed_suggestion(
            &store,
            opportunity.id,
            json!({ "url": "/p2", "contentGainRatio": 2.1 }),
            SuggestionStatus::New,
        )
        .await;

        let findings = vec![json!({ "url": "/p1", "contentGainRatio": 2.4 })];
        sync_suggestions(&store, &opportunity, &findings, &PrerenderStrategy)
            .await
            .unwrap();

        assert_eq!(store.suggestion(p1.id).await.unwrap().status, SuggestionStatus::New);
        assert_eq!(
            store.suggestion(p2.id).await.unwrap().status,
            SuggestionStatus::Outdated
        );
        assert_eq!(store.suggestions_for(opportunity.id).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn run_audit_sync_writes_reports_and_summary() {
        let dir = tempdir().expect("tempdir");
        let store = MemoryStore::new();
        let config = SyncConfig {
            store_dir: dir.path().join("store"),
            workspace_root: dir.path().to_path_buf(),
            site_id: Uuid::new_v4(),
            site_url: "https://example.com".to_string(),
        };
        let audit = AuditConfig {
            audit_type: "prerender".to_string(),
            display_name: "Prerender".to_string(),
            enabled: true,
            runbook: None,
            origin: "AUTOMATION".to_string(),
            tags: vec![],
            guidance: vec![],
            thresholds: json!({ "contentGainRatio": 1.5 }),
        };
        let findings = vec![
            json!({ "url": "/p1", "contentGainRatio": 2.5 }),
            json!({ "key": aggregate_key("prerender"), "totalContentGain": 2.5, "urlCount": 1 }),
        ];

        let summary = run_audit_sync(&store, &config, &audit, &mk_ctx(config.site_id), &findings)
            .await
            .unwrap();
        assert_eq!(summary.created, 2);

        let reports_dir = PathBuf::from(&summary.reports_dir);
        assert!(reports_dir.join("sync_report.json").exists());
        assert!(reports_dir.join("sync_brief.md").exists());

        let digest = report_recent_markdown(5, Some(dir.path().to_path_buf())).unwrap();
        assert!(digest.contains(&summary.run_id.to_string()));
    }

    #[tokio::test]
    async fn registry_parses_yaml_and_resolves_types() {
        let text = r#"
audits:
  - audit_type: prerender
    display_name: Prerender
    enabled: true
    runbook: https://runbooks.example.com/prerender
    tags: [Traffic acquisition]
    thresholds:
      contentGainRatio: 1.5
  - audit_type: headings
    display_name: Heading structure
    enabled: false
"#;
        let registry: AuditRegistry = serde_yaml::from_str(text).unwrap();
        assert_eq!(registry.audits.len(), 2);
        let prerender = registry.config_for("prerender").unwrap();
        assert_eq!(prerender.origin, "AUTOMATION");
        assert_eq!(prerender.thresholds["contentGainRatio"], 1.5);
        assert!(!registry.config_for("headings").unwrap().enabled);
        assert!(registry.config_for("faq").is_none());
    }

    #[tokio::test]
    async fn load_findings_reads_a_json_array() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("findings.json");
        std::fs::write(&path, r#"[{ "url": "/p1", "contentGainRatio": 2.0 }]"#).unwrap();

        let findings = load_findings(&path).await.unwrap();
        assert_eq!(findings.len(), 1);
        assert_eq!(findings[0]["url"], "/p1");
    }
}
