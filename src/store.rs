//! Project and rule storage.
//!
//! The store owns the authoritative in-memory project set. It is loaded from
//! an index file listing each project's rule file globs, and every mutation
//! is mirrored back to disk through the [`FileQueue`].
//!
//! Reads and mutations wait for the most recent load to finish, so callers
//! never observe a partially loaded store. Disk writes are fire-and-forget;
//! use [`Store::flush`] to wait for them.

use crate::model::{Conflict, IndexEntry, IndexFile, Project, ProjectRule, Rule, RuleDraft};
use crate::queue::{FileQueue, QueueError};
use crate::validate::{Validatable, ValidationError, Validator};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{watch, RwLock};
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("project '{0}' not found")]
    ProjectNotFound(String),

    #[error("rule '{rule}' not found in project '{project}'")]
    RuleNotFound { project: String, rule: String },

    #[error("project '{0}' already exists")]
    ProjectExists(String),

    #[error("project '{project}' already has a rule named '{rule}'")]
    DuplicateRuleName { project: String, rule: String },

    #[error("project '{project}' already has a rule at '{location}'")]
    DuplicateLocation { project: String, location: String },

    #[error("project '{project}' already has a rule for {method} {path}")]
    DuplicateRoute {
        project: String,
        method: String,
        path: String,
    },

    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("failed to load rule file {}: {message}", .path.display())]
    RuleFile { path: PathBuf, message: String },

    #[error("store load failed: {0}")]
    Load(String),

    #[error("serialization failed: {0}")]
    Serialization(String),

    #[error(transparent)]
    Queue(#[from] QueueError),
}

impl StoreError {
    /// Stable identifier for mapping errors at an API boundary.
    pub fn code(&self) -> &'static str {
        match self {
            StoreError::ProjectNotFound(_) => "project_not_found",
            StoreError::RuleNotFound { .. } => "rule_not_found",
            StoreError::ProjectExists(_) => "project_exists",
            StoreError::DuplicateRuleName { .. } => "duplicate_rule_name",
            StoreError::DuplicateLocation { .. } => "duplicate_rule_location",
            StoreError::DuplicateRoute { .. } => "duplicate_rule_route",
            StoreError::Validation(_) => "validation_failed",
            StoreError::RuleFile { .. } => "rule_file_invalid",
            StoreError::Load(_) => "store_load_failed",
            StoreError::Serialization(_) => "serialization_failed",
            StoreError::Queue(_) => "file_operation_failed",
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            StoreError::ProjectNotFound(_) | StoreError::RuleNotFound { .. }
        )
    }

    fn conflict(conflict: Conflict, project: &str, rule: &Rule, location: &str) -> Self {
        let project = project.to_string();
        match conflict {
            Conflict::Name => StoreError::DuplicateRuleName {
                project,
                rule: rule.name.clone(),
            },
            Conflict::Location => StoreError::DuplicateLocation {
                project,
                location: location.to_string(),
            },
            Conflict::Route => StoreError::DuplicateRoute {
                project,
                method: rule.request.method.clone(),
                path: rule.request.path.clone(),
            },
        }
    }
}

/// Mutable project fields. Only the name can change this way.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectUpdate {
    pub name: String,
}

#[derive(Debug, Clone, PartialEq)]
enum LoadStatus {
    Loading,
    Ready,
    Failed(String),
}

/// File-backed project and rule store.
pub struct Store {
    index_path: PathBuf,
    /// Directory relative rule locations resolve against
    base_dir: PathBuf,
    validator: Arc<dyn Validator>,
    queue: FileQueue,
    projects: RwLock<Vec<Project>>,
    status: watch::Sender<LoadStatus>,
}

impl Store {
    /// Create a store and start loading it in the background.
    pub fn open(index_path: impl Into<PathBuf>, validator: Arc<dyn Validator>) -> Arc<Self> {
        let store = Arc::new(Self::new(index_path, validator));
        let loader = Arc::clone(&store);
        tokio::spawn(async move {
            // Failures are published through the load status
            let _ = loader.reload().await;
        });
        store
    }

    /// Create an unloaded store. Every operation waits until [`Store::reload`]
    /// has run.
    pub fn new(index_path: impl Into<PathBuf>, validator: Arc<dyn Validator>) -> Self {
        let index_path = index_path.into();
        let base_dir = index_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_default();
        let (status, _) = watch::channel(LoadStatus::Loading);

        Self {
            index_path,
            base_dir,
            validator,
            queue: FileQueue::new(),
            projects: RwLock::new(Vec::new()),
            status,
        }
    }

    pub fn index_path(&self) -> &Path {
        &self.index_path
    }

    /// (Re)load every project from disk, replacing the in-memory set.
    pub async fn reload(&self) -> Result<(), StoreError> {
        self.status.send_replace(LoadStatus::Loading);
        let mut projects = self.projects.write().await;

        match self.load_projects().await {
            Ok(loaded) => {
                info!(
                    index = %self.index_path.display(),
                    projects = loaded.len(),
                    rules = loaded.iter().map(|p| p.rules.len()).sum::<usize>(),
                    "Project store loaded"
                );
                *projects = loaded;
                self.status.send_replace(LoadStatus::Ready);
                Ok(())
            }
            Err(e) => {
                warn!(index = %self.index_path.display(), error = %e, "Project store load failed");
                self.status.send_replace(LoadStatus::Failed(e.to_string()));
                Err(e)
            }
        }
    }

    /// Wait for the most recent load to settle.
    async fn ready(&self) -> Result<(), StoreError> {
        let mut rx = self.status.subscribe();
        let status = rx
            .wait_for(|s| *s != LoadStatus::Loading)
            .await
            .map(|s| (*s).clone())
            .map_err(|_| StoreError::Load("store closed".to_string()))?;

        match status {
            LoadStatus::Failed(message) => Err(StoreError::Load(message)),
            _ => Ok(()),
        }
    }

    /// Wait until every queued disk write has been applied.
    pub async fn flush(&self) -> Result<(), StoreError> {
        self.queue.flush().await?;
        Ok(())
    }

    // Loading

    async fn load_projects(&self) -> Result<Vec<Project>, StoreError> {
        let content = tokio::fs::read_to_string(&self.index_path)
            .await
            .map_err(|e| {
                StoreError::Load(format!(
                    "cannot read index {}: {}",
                    self.index_path.display(),
                    e
                ))
            })?;
        let index: IndexFile = serde_yaml::from_str(&content).map_err(|e| {
            StoreError::Load(format!(
                "cannot parse index {}: {}",
                self.index_path.display(),
                e
            ))
        })?;
        self.validator.validate(Validatable::Index(&index))?;

        let mut projects = Vec::with_capacity(index.projects.len());
        for entry in &index.projects {
            let project = self.load_project(entry).await;
            self.validator.validate(Validatable::Project(&project))?;
            projects.push(project);
        }
        Ok(projects)
    }

    async fn load_project(&self, entry: &IndexEntry) -> Project {
        let mut project = Project::new(entry.name.trim());
        let mut seen = HashSet::new();

        for pattern in &entry.rules {
            let relative = !Path::new(pattern).is_absolute();
            let paths: Vec<PathBuf> = self
                .expand_pattern(pattern)
                .await
                .into_iter()
                .filter(|path| seen.insert(path.clone()))
                .collect();

            // Files matched by one pattern are read concurrently
            let loaded = join_all(paths.iter().map(|path| self.load_rule_file(path))).await;

            for (path, result) in paths.iter().zip(loaded) {
                let rule = match result {
                    Ok(rule) => rule,
                    Err(e) => {
                        warn!(project = %project.name, error = %e, "Skipping rule file");
                        continue;
                    }
                };
                let location = self.location_for(path, relative);
                if let Some(conflict) = project.find_conflict(&rule, &location, None) {
                    let e = StoreError::conflict(conflict, &project.name, &rule, &location);
                    warn!(path = %path.display(), error = %e, "Skipping rule file");
                    continue;
                }
                debug!(project = %project.name, rule = %rule.name, %location, "Loaded rule");
                project.rules.push(ProjectRule { location, rule });
            }
        }

        project
    }

    async fn expand_pattern(&self, pattern: &str) -> Vec<PathBuf> {
        let full = if Path::new(pattern).is_absolute() {
            pattern.to_string()
        } else {
            let base = glob::Pattern::escape(&self.base_dir.to_string_lossy());
            if base.is_empty() {
                pattern.to_string()
            } else {
                format!("{}/{}", base.trim_end_matches('/'), pattern)
            }
        };

        let expanded = tokio::task::spawn_blocking(move || {
            glob::glob(&full).map(|paths| {
                paths
                    .filter_map(|entry| match entry {
                        Ok(path) if path.is_file() => Some(path),
                        Ok(_) => None,
                        Err(e) => {
                            warn!(error = %e, "Unreadable glob match");
                            None
                        }
                    })
                    .collect::<Vec<_>>()
            })
        })
        .await;

        match expanded {
            Ok(Ok(paths)) => {
                if paths.is_empty() {
                    debug!(pattern, "Rule pattern matched no files");
                }
                paths
            }
            Ok(Err(e)) => {
                warn!(pattern, error = %e, "Invalid rule file pattern");
                Vec::new()
            }
            Err(e) => {
                warn!(pattern, error = %e, "Rule file expansion aborted");
                Vec::new()
            }
        }
    }

    async fn load_rule_file(&self, path: &Path) -> Result<Rule, StoreError> {
        let rule_file_error = |message: String| StoreError::RuleFile {
            path: path.to_path_buf(),
            message,
        };

        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| rule_file_error(e.to_string()))?;
        let rule: Rule =
            serde_yaml::from_str(&content).map_err(|e| rule_file_error(e.to_string()))?;
        self.validator
            .validate(Validatable::Rule(&rule))
            .map_err(|e| rule_file_error(e.to_string()))?;
        Ok(rule)
    }

    /// Location recorded for a loaded file: relative to the index directory
    /// when it came from a relative pattern.
    fn location_for(&self, path: &Path, relative: bool) -> String {
        let path = if relative {
            path.strip_prefix(&self.base_dir).unwrap_or(path)
        } else {
            path
        };
        path.to_string_lossy().replace('\\', "/")
    }

    fn resolve_location(&self, location: &str) -> PathBuf {
        let path = Path::new(location);
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.base_dir.join(path)
        }
    }

    // Reads

    pub async fn list_projects(&self) -> Result<Vec<Project>, StoreError> {
        self.ready().await?;
        Ok(self.projects.read().await.clone())
    }

    pub async fn get_project(&self, name: &str) -> Result<Project, StoreError> {
        self.ready().await?;
        let projects = self.projects.read().await;
        find_project(&projects, name)
            .map(|i| projects[i].clone())
            .ok_or_else(|| StoreError::ProjectNotFound(name.to_string()))
    }

    pub async fn get_rule(&self, project: &str, rule: &str) -> Result<ProjectRule, StoreError> {
        self.ready().await?;
        let projects = self.projects.read().await;
        let index = find_project(&projects, project)
            .ok_or_else(|| StoreError::ProjectNotFound(project.to_string()))?;
        projects[index]
            .rule(rule)
            .cloned()
            .ok_or_else(|| StoreError::RuleNotFound {
                project: project.to_string(),
                rule: rule.to_string(),
            })
    }

    // Project mutations

    pub async fn create_project(&self, name: &str) -> Result<Project, StoreError> {
        self.ready().await?;
        let project = Project::new(name.trim());
        self.validator.validate(Validatable::Project(&project))?;

        let mut projects = self.projects.write().await;
        if find_project(&projects, &project.name).is_some() {
            return Err(StoreError::ProjectExists(project.name));
        }
        projects.push(project.clone());
        self.write_index(&projects)?;

        info!(project = %project.name, "Project created");
        Ok(project)
    }

    pub async fn update_project(
        &self,
        name: &str,
        update: &ProjectUpdate,
    ) -> Result<Project, StoreError> {
        self.ready().await?;
        let mut projects = self.projects.write().await;
        let index = find_project(&projects, name)
            .ok_or_else(|| StoreError::ProjectNotFound(name.to_string()))?;

        let new_name = update.name.trim().to_string();
        if let Some(other) = find_project(&projects, &new_name) {
            if other != index {
                return Err(StoreError::ProjectExists(new_name));
            }
        }

        let mut renamed = projects[index].clone();
        renamed.name = new_name;
        self.validator.validate(Validatable::Project(&renamed))?;

        projects[index] = renamed.clone();
        self.write_index(&projects)?;

        info!(from = %name, to = %renamed.name, "Project renamed");
        Ok(renamed)
    }

    pub async fn remove_project(&self, name: &str) -> Result<(), StoreError> {
        self.ready().await?;
        let mut projects = self.projects.write().await;
        let index = find_project(&projects, name)
            .ok_or_else(|| StoreError::ProjectNotFound(name.to_string()))?;

        let removed = projects.remove(index);
        for entry in &removed.rules {
            self.delete_if_unreferenced(&projects, &entry.location);
        }
        self.write_index(&projects)?;

        info!(project = %removed.name, rules = removed.rules.len(), "Project removed");
        Ok(())
    }

    // Rule mutations

    pub async fn create_rule(
        &self,
        project: &str,
        draft: &RuleDraft,
    ) -> Result<ProjectRule, StoreError> {
        self.ready().await?;
        let rule = draft.rule.clone();
        self.validator.validate(Validatable::Rule(&rule))?;

        let mut projects = self.projects.write().await;
        let index = find_project(&projects, project)
            .ok_or_else(|| StoreError::ProjectNotFound(project.to_string()))?;
        let location = match &draft.location {
            Some(location) => location.clone(),
            None => self.unused_location(&projects, project, &rule.name).await,
        };

        if let Some(conflict) = projects[index].find_conflict(&rule, &location, None) {
            return Err(StoreError::conflict(conflict, project, &rule, &location));
        }
        check_shared(&projects, index, &location, &rule)?;

        let created = ProjectRule { location, rule };
        projects[index].rules.push(created.clone());
        sync_shared(&mut projects, index, &created);

        self.write_index(&projects)?;
        self.write_rule(&created)?;

        info!(project, rule = %created.rule.name, location = %created.location, "Rule created");
        Ok(created)
    }

    /// Replace the rule currently named `original` with `draft`. The stored
    /// entry is matched by its original location, so a rename and a move can
    /// happen in one call.
    pub async fn update_rule(
        &self,
        project: &str,
        original: &str,
        draft: &RuleDraft,
    ) -> Result<ProjectRule, StoreError> {
        self.ready().await?;
        let rule = draft.rule.clone();
        self.validator.validate(Validatable::Rule(&rule))?;

        let mut projects = self.projects.write().await;
        let index = find_project(&projects, project)
            .ok_or_else(|| StoreError::ProjectNotFound(project.to_string()))?;
        let original_location = projects[index]
            .rule(original)
            .map(|r| r.location.clone())
            .ok_or_else(|| StoreError::RuleNotFound {
                project: project.to_string(),
                rule: original.to_string(),
            })?;
        let location = draft
            .location
            .clone()
            .unwrap_or_else(|| original_location.clone());

        if let Some(conflict) =
            projects[index].find_conflict(&rule, &location, Some(&original_location))
        {
            return Err(StoreError::conflict(conflict, project, &rule, &location));
        }
        check_shared(&projects, index, &location, &rule)?;

        let updated = ProjectRule { location, rule };
        if let Some(entry) = projects[index]
            .rules
            .iter_mut()
            .find(|r| r.location == original_location)
        {
            *entry = updated.clone();
        }
        sync_shared(&mut projects, index, &updated);

        self.write_rule(&updated)?;
        if updated.location != original_location {
            self.write_index(&projects)?;
            self.delete_if_unreferenced(&projects, &original_location);
        }

        info!(
            project,
            rule = %updated.rule.name,
            location = %updated.location,
            "Rule updated"
        );
        Ok(updated)
    }

    pub async fn remove_rule(&self, project: &str, rule: &str) -> Result<(), StoreError> {
        self.ready().await?;
        let mut projects = self.projects.write().await;
        let index = find_project(&projects, project)
            .ok_or_else(|| StoreError::ProjectNotFound(project.to_string()))?;
        let position = projects[index]
            .rules
            .iter()
            .position(|r| r.rule.name == rule)
            .ok_or_else(|| StoreError::RuleNotFound {
                project: project.to_string(),
                rule: rule.to_string(),
            })?;

        let removed = projects[index].rules.remove(position);
        self.delete_if_unreferenced(&projects, &removed.location);
        self.write_index(&projects)?;

        info!(project, rule, location = %removed.location, "Rule removed");
        Ok(())
    }

    /// Derived location for a new rule that no project references and no
    /// file occupies. Only a caller-supplied location can join a shared file.
    async fn unused_location(&self, projects: &[Project], project: &str, rule: &str) -> String {
        let base = derive_location(project, rule);
        let stem = base.trim_end_matches(".yaml").to_string();
        let mut candidate = base;
        for n in 2.. {
            let referenced = projects.iter().any(|p| p.has_location(&candidate));
            let occupied = tokio::fs::try_exists(self.resolve_location(&candidate))
                .await
                .unwrap_or(false);
            if !referenced && !occupied {
                break;
            }
            debug!(location = %candidate, "Derived location taken, trying another");
            // `~` is always escaped by `derive_location`, so suffixed names
            // never collide with an unsuffixed one
            candidate = format!("{}~{}.yaml", stem, n);
        }
        candidate
    }

    // Persistence

    fn write_index(&self, projects: &[Project]) -> Result<(), StoreError> {
        let yaml = serde_yaml::to_string(&IndexFile::from_projects(projects))
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        let _ = self.queue.enqueue_write(&self.index_path, yaml);
        Ok(())
    }

    fn write_rule(&self, entry: &ProjectRule) -> Result<(), StoreError> {
        let yaml = serde_yaml::to_string(&entry.rule)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        let _ = self
            .queue
            .enqueue_write(self.resolve_location(&entry.location), yaml);
        Ok(())
    }

    /// Queue deleting a rule file unless some project still uses it.
    fn delete_if_unreferenced(&self, projects: &[Project], location: &str) {
        if projects.iter().any(|p| p.has_location(location)) {
            debug!(location, "Rule file still referenced, keeping it");
            return;
        }
        let _ = self.queue.enqueue_delete(self.resolve_location(location));
    }
}

fn find_project(projects: &[Project], name: &str) -> Option<usize> {
    projects.iter().position(|p| p.name == name)
}

/// Writing a rule file changes the rule for every project referencing that
/// file, so it must also satisfy those projects' invariants.
fn check_shared(
    projects: &[Project],
    owner: usize,
    location: &str,
    rule: &Rule,
) -> Result<(), StoreError> {
    for (i, project) in projects.iter().enumerate() {
        if i == owner || !project.has_location(location) {
            continue;
        }
        if let Some(conflict) = project.find_conflict(rule, location, Some(location)) {
            return Err(StoreError::conflict(conflict, &project.name, rule, location));
        }
    }
    Ok(())
}

fn sync_shared(projects: &mut [Project], owner: usize, entry: &ProjectRule) {
    for (i, project) in projects.iter_mut().enumerate() {
        if i == owner {
            continue;
        }
        for shared in project
            .rules
            .iter_mut()
            .filter(|r| r.location == entry.location)
        {
            shared.rule = entry.rule.clone();
        }
    }
}

/// Deterministic location for a rule created without one. Distinct names
/// always give distinct locations.
pub fn derive_location(project: &str, rule: &str) -> String {
    format!("{}/{}.yaml", escape_segment(project), escape_segment(rule))
}

/// Percent-escape everything but ASCII letters, digits, `-` and `_`. Case
/// is kept and `.` is escaped, so a segment is never `.` or `..`.
fn escape_segment(name: &str) -> String {
    let mut escaped = String::with_capacity(name.len());
    for byte in name.bytes() {
        if byte.is_ascii_alphanumeric() || byte == b'-' || byte == b'_' {
            escaped.push(byte as char);
        } else {
            escaped.push_str(&format!("%{:02X}", byte));
        }
    }
    escaped
}
