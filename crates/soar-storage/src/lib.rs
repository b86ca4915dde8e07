//! Persistence-client abstraction and reference stores for SOAR.
//!
//! The reconciliation engine only sees [`SuggestionClient`]; production
//! deployments supply their own implementation over whatever transport they
//! own. The in-memory and JSON-file stores here back tests and fixture runs.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::Utc;
use serde::Serialize;
use soar_core::{
    NewOpportunity, NewSuggestion, Opportunity, OpportunityStatus, Suggestion, SuggestionStatus,
};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use uuid::Uuid;

pub const CRATE_NAME: &str = "soar-storage";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: Uuid },
    #[error("store rejected write: {reason}")]
    Rejected { reason: String },
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Serialization(#[from] serde_json::Error),
}

/// Outcome of a bulk suggestion creation. Items that fail validation are
/// reported in `error_items`; successes before and after a failure are kept.
#[derive(Debug, Clone, Default, Serialize)]
pub struct BulkCreateResult {
    pub created: Vec<Suggestion>,
    pub error_items: Vec<BulkCreateError>,
}

#[derive(Debug, Clone, Serialize)]
pub struct BulkCreateError {
    pub index: usize,
    pub message: String,
}

/// Store surface consumed by the reconciliation engine.
#[async_trait]
pub trait SuggestionClient: Send + Sync {
    async fn opportunities_by_site_and_status(
        &self,
        site_id: Uuid,
        statuses: &[OpportunityStatus],
    ) -> Result<Vec<Opportunity>, StoreError>;

    async fn create_opportunity(&self, new: NewOpportunity) -> Result<Opportunity, StoreError>;

    async fn save_opportunity(&self, opportunity: &Opportunity) -> Result<(), StoreError>;

    async fn suggestions_for(&self, opportunity_id: Uuid) -> Result<Vec<Suggestion>, StoreError>;

    async fn create_suggestions(
        &self,
        new: Vec<NewSuggestion>,
    ) -> Result<BulkCreateResult, StoreError>;

    async fn save_suggestion(&self, suggestion: &Suggestion) -> Result<(), StoreError>;

    /// Transitions every listed suggestion to `status`, returning how many
    /// records were actually touched.
    async fn bulk_update_status(
        &self,
        ids: &[Uuid],
        status: SuggestionStatus,
    ) -> Result<usize, StoreError>;
}

fn opportunity_from_new(new: NewOpportunity) -> Opportunity {
    let now = Utc::now();
    Opportunity {
        id: Uuid::new_v4(),
        site_id: new.site_id,
        audit_type: new.audit_type,
        status: OpportunityStatus::New,
        audit_id: new.audit_id,
        origin: new.origin,
        title: new.title,
        description: new.description,
        runbook: new.runbook,
        tags: new.tags,
        data: new.data,
        guidance: new.guidance,
        updated_by: None,
        created_at: now,
        updated_at: now,
    }
}

fn suggestion_from_new(new: NewSuggestion) -> Result<Suggestion, StoreError> {
    if !new.data.is_object() {
        return Err(StoreError::Rejected {
            reason: "suggestion data must be a JSON object".to_string(),
        });
    }
    let now = Utc::now();
    Ok(Suggestion {
        id: Uuid::new_v4(),
        opportunity_id: new.opportunity_id,
        kind: new.kind,
        rank: new.rank,
        status: new.status,
        data: new.data,
        kpi_deltas: new.kpi_deltas,
        created_at: now,
        updated_at: now,
    })
}

/// In-memory store backing tests and fixture-driven runs.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<MemoryInner>,
}

#[derive(Default)]
struct MemoryInner {
    opportunities: HashMap<Uuid, Opportunity>,
    suggestions: HashMap<Uuid, Suggestion>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seeds a fully-formed suggestion, bypassing creation-time validation.
    pub async fn insert_suggestion(&self, suggestion: Suggestion) {
        let mut inner = self.inner.lock().await;
        inner.suggestions.insert(suggestion.id, suggestion);
    }

    pub async fn suggestion(&self, id: Uuid) -> Option<Suggestion> {
        self.inner.lock().await.suggestions.get(&id).cloned()
    }

    pub async fn opportunity(&self, id: Uuid) -> Option<Opportunity> {
        self.inner.lock().await.opportunities.get(&id).cloned()
    }
}

#[async_trait]
impl SuggestionClient for MemoryStore {
    async fn opportunities_by_site_and_status(
        &self,
        site_id: Uuid,
        statuses: &[OpportunityStatus],
    ) -> Result<Vec<Opportunity>, StoreError> {
        let inner = self.inner.lock().await;
        let mut found: Vec<Opportunity> = inner
            .opportunities
            .values()
            .filter(|o| o.site_id == site_id && statuses.contains(&o.status))
            .cloned()
            .collect();
        found.sort_by_key(|o| o.created_at);
        Ok(found)
    }

    async fn create_opportunity(&self, new: NewOpportunity) -> Result<Opportunity, StoreError> {
        let opportunity = opportunity_from_new(new);
        let mut inner = self.inner.lock().await;
        inner
            .opportunities
            .insert(opportunity.id, opportunity.clone());
        Ok(opportunity)
    }

    async fn save_opportunity(&self, opportunity: &Opportunity) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        if !inner.opportunities.contains_key(&opportunity.id) {
            return Err(StoreError::NotFound {
                entity: "opportunity",
                id: opportunity.id,
            });
        }
        let mut updated = opportunity.clone();
        updated.updated_at = Utc::now();
        inner.opportunities.insert(updated.id, updated);
        Ok(())
    }

    async fn suggestions_for(&self, opportunity_id: Uuid) -> Result<Vec<Suggestion>, StoreError> {
        let inner = self.inner.lock().await;
        let mut found: Vec<Suggestion> = inner
            .suggestions
            .values()
            .filter(|s| s.opportunity_id == opportunity_id)
            .cloned()
            .collect();
        found.sort_by_key(|s| s.created_at);
        Ok(found)
    }

    async fn create_suggestions(
        &self,
        new: Vec<NewSuggestion>,
    ) -> Result<BulkCreateResult, StoreError> {
        let mut result = BulkCreateResult::default();
        let mut inner = self.inner.lock().await;
        for (index, item) in new.into_iter().enumerate() {
            match suggestion_from_new(item) {
                Ok(suggestion) => {
                    inner.suggestions.insert(suggestion.id, suggestion.clone());
                    result.created.push(suggestion);
                }
                Err(err) => result.error_items.push(BulkCreateError {
                    index,
                    message: err.to_string(),
                }),
            }
        }
        Ok(result)
    }

    async fn save_suggestion(&self, suggestion: &Suggestion) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        if !inner.suggestions.contains_key(&suggestion.id) {
            return Err(StoreError::NotFound {
                entity: "suggestion",
                id: suggestion.id,
            });
        }
        let mut updated = suggestion.clone();
        updated.updated_at = Utc::now();
        inner.suggestions.insert(updated.id, updated);
        Ok(())
    }

    async fn bulk_update_status(
        &self,
        ids: &[Uuid],
        status: SuggestionStatus,
    ) -> Result<usize, StoreError> {
        let mut inner = self.inner.lock().await;
        let mut touched = 0;
        for id in ids {
            if let Some(suggestion) = inner.suggestions.get_mut(id) {
                suggestion.status = status;
                suggestion.updated_at = Utc::now();
                touched += 1;
            }
        }
        Ok(touched)
    }
}

/// JSON-file store: one file per entity under `opportunities/` and
/// `suggestions/`, written with an atomic temp-file rename.
#[derive(Debug, Clone)]
pub struct FileStore {
    root: PathBuf,
}

impl FileStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn opportunities_dir(&self) -> PathBuf {
        self.root.join("opportunities")
    }

    fn suggestions_dir(&self) -> PathBuf {
        self.root.join("suggestions")
    }

    async fn write_atomic(&self, path: &Path, bytes: &[u8]) -> Result<(), StoreError> {
        let parent = match path.parent() {
            Some(parent) => parent,
            None => {
                return Err(StoreError::Rejected {
                    reason: format!("entity path {} has no parent", path.display()),
                })
            }
        };
        fs::create_dir_all(parent).await?;

        let temp_path = parent.join(format!(".{}.tmp", Uuid::new_v4()));
        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await?;
        file.write_all(bytes).await?;
        file.flush().await?;
        drop(file);

        if let Err(err) = fs::rename(&temp_path, path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(err.into());
        }
        Ok(())
    }

    async fn write_entity<T: Serialize>(
        &self,
        dir: PathBuf,
        id: Uuid,
        entity: &T,
    ) -> Result<(), StoreError> {
        let bytes = serde_json::to_vec_pretty(entity)?;
        let path = dir.join(format!("{id}.json"));
        self.write_atomic(&path, &bytes).await
    }

    async fn read_all_opportunities(&self) -> Result<Vec<Opportunity>, StoreError> {
        read_entities(self.opportunities_dir()).await
    }

    async fn read_all_suggestions(&self) -> Result<Vec<Suggestion>, StoreError> {
        read_entities(self.suggestions_dir()).await
    }

    async fn entity_exists(&self, dir: PathBuf, id: Uuid) -> Result<bool, StoreError> {
        Ok(fs::try_exists(dir.join(format!("{id}.json"))).await?)
    }
}

async fn read_entities<T: serde::de::DeserializeOwned>(
    dir: PathBuf,
) -> Result<Vec<T>, StoreError> {
    if !fs::try_exists(&dir).await? {
        return Ok(Vec::new());
    }
    let mut entities = Vec::new();
    let mut entries = fs::read_dir(&dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if path.extension().map(|ext| ext != "json").unwrap_or(true) {
            continue;
        }
        let text = fs::read_to_string(&path).await?;
        entities.push(serde_json::from_str(&text)?);
    }
    Ok(entities)
}

#[async_trait]
impl SuggestionClient for FileStore {
    async fn opportunities_by_site_and_status(
        &self,
        site_id: Uuid,
        statuses: &[OpportunityStatus],
    ) -> Result<Vec<Opportunity>, StoreError> {
        let mut found: Vec<Opportunity> = self
            .read_all_opportunities()
            .await?
            .into_iter()
            .filter(|o| o.site_id == site_id && statuses.contains(&o.status))
            .collect();
        found.sort_by_key(|o| o.created_at);
        Ok(found)
    }

    async fn create_opportunity(&self, new: NewOpportunity) -> Result<Opportunity, StoreError> {
        let opportunity = opportunity_from_new(new);
        self.write_entity(self.opportunities_dir(), opportunity.id, &opportunity)
            .await?;
        Ok(opportunity)
    }

    async fn save_opportunity(&self, opportunity: &Opportunity) -> Result<(), StoreError> {
        if !self
            .entity_exists(self.opportunities_dir(), opportunity.id)
            .await?
        {
            return Err(StoreError::NotFound {
                entity: "opportunity",
                id: opportunity.id,
            });
        }
        let mut updated = opportunity.clone();
        updated.updated_at = Utc::now();
        self.write_entity(self.opportunities_dir(), updated.id, &updated)
            .await
    }

    async fn suggestions_for(&self, opportunity_id: Uuid) -> Result<Vec<Suggestion>, StoreError> {
        let mut found: Vec<Suggestion> = self
            .read_all_suggestions()
            .await?
            .into_iter()
            .filter(|s| s.opportunity_id == opportunity_id)
            .collect();
        found.sort_by_key(|s| s.created_at);
        Ok(found)
    }

    async fn create_suggestions(
        &self,
        new: Vec<NewSuggestion>,
    ) -> Result<BulkCreateResult, StoreError> {
        let mut result = BulkCreateResult::default();
        for (index, item) in new.into_iter().enumerate() {
            let suggestion = match suggestion_from_new(item) {
                Ok(suggestion) => suggestion,
                Err(err) => {
                    result.error_items.push(BulkCreateError {
                        index,
                        message: err.to_string(),
                    });
                    continue;
                }
            };
            match self
                .write_entity(self.suggestions_dir(), suggestion.id, &suggestion)
                .await
            {
                Ok(()) => result.created.push(suggestion),
                Err(err) => result.error_items.push(BulkCreateError {
                    index,
                    message: err.to_string(),
                }),
            }
        }
        Ok(result)
    }

    async fn save_suggestion(&self, suggestion: &Suggestion) -> Result<(), StoreError> {
        if !self
            .entity_exists(self.suggestions_dir(), suggestion.id)
            .await?
        {
            return Err(StoreError::NotFound {
                entity: "suggestion",
                id: suggestion.id,
            });
        }
        let mut updated = suggestion.clone();
        updated.updated_at = Utc::now();
        self.write_entity(self.suggestions_dir(), updated.id, &updated)
            .await
    }

    async fn bulk_update_status(
        &self,
        ids: &[Uuid],
        status: SuggestionStatus,
    ) -> Result<usize, StoreError> {
        let mut touched = 0;
        for suggestion in self.read_all_suggestions().await? {
            if ids.contains(&suggestion.id) {
                let mut updated = suggestion;
                updated.status = status;
                updated.updated_at = Utc::now();
                self.write_entity(self.suggestions_dir(), updated.id, &updated)
                    .await?;
                touched += 1;
            }
        }
        Ok(touched)
    }
}
