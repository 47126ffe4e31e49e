use chrono::Utc;
use dashmap::DashMap;
use std::sync::Arc;

use crate::{
    domain::condition::FieldRegistry,
    domain::instance::TemplateId,
    domain::repository::TemplateRepository,
    domain::template::WorkflowTemplate,
    CoreError,
};

/// Versioned store of workflow templates
///
/// Every registration creates a new immutable version. Running workflows
/// read the version they pinned at start through [`TemplateRegistry::get_pinned`].
pub struct TemplateRegistry {
    /// Durable template storage
    repo: Arc<dyn TemplateRepository>,

    /// Condition field vocabulary used for validation
    fields: FieldRegistry,

    /// Immutable versions already read
    cache: DashMap<(TemplateId, u32), Arc<WorkflowTemplate>>,
}

impl TemplateRegistry {
    /// Create a registry
    pub fn new(repo: Arc<dyn TemplateRepository>, fields: FieldRegistry) -> Self {
        Self {
            repo,
            fields,
            cache: DashMap::new(),
        }
    }

    /// Field vocabulary
    pub fn fields(&self) -> &FieldRegistry {
        &self.fields
    }

    /// Validate and store a template as its next version
    pub async fn register(&self, mut template: WorkflowTemplate) -> Result<WorkflowTemplate, CoreError> {
        let latest = self.repo.versions(&template.id).await?.last().copied();
        template.version = latest.map_or(1, |v| v + 1);
        template.created_at = Utc::now();

        template.validate(&self.fields)?;

        self.repo.insert_version(&template).await.map_err(|e| match e {
            CoreError::ConcurrencyConflict(_) => CoreError::ConcurrencyConflict(format!(
                "Template {} was registered concurrently",
                template.id.0
            )),
            other => other,
        })?;

        tracing::info!(
            template_id = %template.id.0,
            version = template.version,
            steps = template.steps.len(),
            "Template version registered"
        );

        self.cache.insert(
            (template.id.clone(), template.version),
            Arc::new(template.clone()),
        );
        Ok(template)
    }

    /// Get a version, or the latest when `version` is `None`
    pub async fn get(
        &self,
        id: &TemplateId,
        version: Option<u32>,
    ) -> Result<Arc<WorkflowTemplate>, CoreError> {
        match version {
            Some(version) => self.get_pinned(id, version).await,
            None => {
                let template = self
                    .repo
                    .get(id, None)
                    .await?
                    .ok_or_else(|| CoreError::TemplateNotFound(id.0.clone()))?;
                let template = Arc::new(template);
                self.cache
                    .insert((id.clone(), template.version), template.clone());
                Ok(template)
            }
        }
    }

    /// Get the exact version a workflow pinned
    pub async fn get_pinned(
        &self,
        id: &TemplateId,
        version: u32,
    ) -> Result<Arc<WorkflowTemplate>, CoreError> {
        if let Some(cached) = self.cache.get(&(id.clone(), version)) {
            return Ok(cached.clone());
        }

        let template = self.repo.get(id, Some(version)).await?.ok_or_else(|| {
            CoreError::TemplateVersionNotFound(format!("{}@{}", id.0, version))
        })?;

        let template = Arc::new(template);
        self.cache.insert((id.clone(), version), template.clone());
        Ok(template)
    }

    /// Stored versions of a template
    pub async fn versions(&self, id: &TemplateId) -> Result<Vec<u32>, CoreError> {
        self.repo.versions(id).await
    }

    /// Latest versions that accept new workflows
    pub async fn list_active(&self) -> Result<Vec<WorkflowTemplate>, CoreError> {
        let templates = self.repo.list_latest().await?;
        Ok(templates.into_iter().filter(|t| t.is_active).collect())
    }

    /// Stop new starts by registering an inactive version
    pub async fn deactivate(&self, id: &TemplateId) -> Result<WorkflowTemplate, CoreError> {
        let current = self.get(id, None).await?;
        if !current.is_active {
            return Ok((*current).clone());
        }
        let mut next = (*current).clone();
        next.is_active = false;
        self.register(next).await
    }
}
