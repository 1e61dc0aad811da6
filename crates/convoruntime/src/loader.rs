use async_trait::async_trait;
use convocore::services::WorkflowLoader;
use convocore::{FlowError, WorkflowDefinition, WorkflowError};
use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;

/// Loads `<dir>/<name>.json` on every request, so edits apply to the next run.
pub struct DirectoryWorkflowLoader {
    dir: PathBuf,
}

impl DirectoryWorkflowLoader {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, name: &str) -> Result<PathBuf, WorkflowError> {
        let valid = !name.is_empty()
            && !name.contains(['/', '\\'])
            && name != "."
            && name != "..";
        if !valid {
            return Err(WorkflowError::Invalid(format!(
                "'{}' is not a valid workflow name",
                name
            )));
        }
        Ok(self.dir.join(format!("{}.json", name)))
    }
}

#[async_trait]
impl WorkflowLoader for DirectoryWorkflowLoader {
    async fn load(&self, name: &str) -> Result<Arc<WorkflowDefinition>, FlowError> {
        let path = self.path_for(name)?;
        debug!("Loading workflow '{}' from {}", name, path.display());

        let json = match tokio::fs::read_to_string(&path).await {
            Ok(json) => json,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(WorkflowError::NotFound(name.to_string()).into())
            }
            Err(e) => return Err(e.into()),
        };
        Ok(Arc::new(WorkflowDefinition::from_json(name, &json)?))
    }

    async fn list(&self) -> Result<Vec<String>, FlowError> {
        let mut names = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().is_some_and(|ext| ext == "json") {
                if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                    names.push(stem.to_string());
                }
            }
        }
        names.sort();
        Ok(names)
    }
}

/// Workflows held in memory, for embedding and tests.
#[derive(Default)]
pub struct InMemoryWorkflowLoader {
    workflows: RwLock<HashMap<String, Arc<WorkflowDefinition>>>,
}

impl InMemoryWorkflowLoader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_workflow(mut self, definition: WorkflowDefinition) -> Self {
        self.workflows
            .get_mut()
            .insert(definition.name.clone(), Arc::new(definition));
        self
    }

    pub async fn register(&self, definition: WorkflowDefinition) {
        let mut workflows = self.workflows.write().await;
        workflows.insert(definition.name.clone(), Arc::new(definition));
    }
}

#[async_trait]
impl WorkflowLoader for InMemoryWorkflowLoader {
    async fn load(&self, name: &str) -> Result<Arc<WorkflowDefinition>, FlowError> {
        let workflows = self.workflows.read().await;
        workflows
            .get(name)
            .cloned()
            .ok_or_else(|| FlowError::Workflow(WorkflowError::NotFound(name.to_string())))
    }

    async fn list(&self) -> Result<Vec<String>, FlowError> {
        let mut names: Vec<String> = self.workflows.read().await.keys().cloned().collect();
        names.sort();
        Ok(names)
    }
}
