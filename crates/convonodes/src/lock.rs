use async_trait::async_trait;
use convocore::{LockAcquisition, Node, NodeContext, NodeError, NodeOutput};
use convoruntime::{FieldDefinition, NodeFactory, NodeMetadata, ResolvedNodeSpec};
use tracing::warn;

pub const WORKFLOW_LOCK: &str = "workflow.lock";

/// Stops the run when another run holds the named lock; otherwise takes it.
///
/// The lock belongs to the run and is released when the run ends.
pub struct LockNode {
    name: String,
    scope: Option<String>,
}

#[async_trait]
impl Node for LockNode {
    fn node_type(&self) -> &str {
        WORKFLOW_LOCK
    }

    async fn execute(&self, ctx: NodeContext) -> Result<NodeOutput, NodeError> {
        let key = ctx.locks.key(&self.name, self.scope.as_deref());
        let acquisition = ctx
            .locks
            .acquire(&key)
            .await
            .map_err(|e| NodeError::ExecutionFailed(format!("Lock store failed: {}", e)))?;

        match acquisition {
            LockAcquisition::Created(lock) => {
                ctx.events.info(format!(
                    "Acquired lock {} until {}",
                    key,
                    lock.expires_at().to_rfc3339()
                ));
                Ok(NodeOutput::empty())
            }
            LockAcquisition::Exists(lock) => {
                warn!(
                    "Lock {} is held by run {}; ending {} early",
                    key,
                    lock.owner,
                    ctx.address()
                );
                ctx.events.warn(format!("Lock {} is busy", key));
                let last_output = ctx.elected_output().await.unwrap_or_default();
                Ok(NodeOutput::TerminateEarly { last_output })
            }
        }
    }
}

pub struct LockNodeFactory;

impl NodeFactory for LockNodeFactory {
    fn create(&self, spec: &ResolvedNodeSpec) -> Result<Box<dyn Node>, NodeError> {
        let name = spec.require_str("workflowLockId")?.trim().to_string();
        if name.is_empty() {
            return Err(NodeError::Configuration(
                "workflowLockId resolved to an empty name".to_string(),
            ));
        }
        let scope = spec
            .str_field("scope")?
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string);
        Ok(Box::new(LockNode { name, scope }))
    }

    fn node_type(&self) -> &str {
        WORKFLOW_LOCK
    }

    fn metadata(&self) -> NodeMetadata {
        NodeMetadata {
            description: "Take a named lock or end the run early".to_string(),
            category: "workflow".to_string(),
            fields: vec![
                FieldDefinition::configuration("workflowLockId", "Lock name").required(),
                FieldDefinition::configuration("scope", "Lock scope; defaults to the runtime's"),
            ],
        }
    }
}
