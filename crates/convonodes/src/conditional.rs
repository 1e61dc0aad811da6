use crate::workflow::call_workflow;
use async_trait::async_trait;
use convocore::{Node, NodeContext, NodeError, NodeOutput, TemplateMode};
use convoruntime::{FieldDefinition, NodeFactory, NodeMetadata, ResolvedNodeSpec};

pub const WORKFLOW_BRANCH: &str = "workflow.branch";

const DEFAULT_BRANCH: &str = "default";

/// Picks a child workflow by key.
///
/// Lookup ignores case. On a miss the fallback content wins over the
/// `default` branch.
pub struct ConditionalBranchNode {
    key: String,
    branches: Vec<(String, String)>,
    fallback_content: Option<String>,
    scoped_variables: Vec<String>,
    mode: TemplateMode,
}

impl ConditionalBranchNode {
    fn branch(&self, key: &str) -> Option<&str> {
        let wanted = key.trim().to_lowercase();
        self.branches
            .iter()
            .find(|(name, _)| name.trim().to_lowercase() == wanted)
            .map(|(_, workflow)| workflow.as_str())
    }
}

#[async_trait]
impl Node for ConditionalBranchNode {
    fn node_type(&self) -> &str {
        WORKFLOW_BRANCH
    }

    async fn execute(&self, ctx: NodeContext) -> Result<NodeOutput, NodeError> {
        if let Some(workflow) = self.branch(&self.key) {
            ctx.events.info(format!("'{}' selects '{}'", self.key, workflow));
            return call_workflow(&ctx, workflow, &self.scoped_variables, self.mode).await;
        }

        if let Some(raw) = &self.fallback_content {
            ctx.events
                .info(format!("No branch for '{}'; using fallback content", self.key));
            return Ok(NodeOutput::Text(ctx.resolve(raw, self.mode)?));
        }

        match self.branch(DEFAULT_BRANCH) {
            Some(workflow) => {
                ctx.events
                    .warn(format!("No branch for '{}'; taking the default", self.key));
                call_workflow(&ctx, workflow, &self.scoped_variables, self.mode).await
            }
            None => Err(NodeError::BranchNotFound {
                key: self.key.clone(),
            }),
        }
    }
}

pub struct ConditionalBranchNodeFactory;

impl NodeFactory for ConditionalBranchNodeFactory {
    fn create(&self, spec: &ResolvedNodeSpec) -> Result<Box<dyn Node>, NodeError> {
        let branches = spec.string_map("conditionalWorkflows")?;
        if branches.is_empty() {
            return Err(NodeError::MissingField("conditionalWorkflows".to_string()));
        }
        Ok(Box::new(ConditionalBranchNode {
            key: spec.require_str("conditionalKey")?.to_string(),
            branches,
            fallback_content: spec.str_field("fallbackContent")?.map(str::to_string),
            scoped_variables: spec.string_list("scoped_variables")?,
            mode: TemplateMode::from_flag(spec.bool_field("expressiveTemplating")?.unwrap_or(false)),
        }))
    }

    fn node_type(&self) -> &str {
        WORKFLOW_BRANCH
    }

    fn metadata(&self) -> NodeMetadata {
        NodeMetadata {
            description: "Run the workflow matching a key".to_string(),
            category: "workflow".to_string(),
            fields: vec![
                FieldDefinition::configuration("conditionalKey", "Branch selector").required(),
                FieldDefinition::configuration("conditionalWorkflows", "Key to workflow table")
                    .required(),
                FieldDefinition::content("fallbackContent", "Text returned when no key matches"),
                FieldDefinition::content("scoped_variables", "Values passed as agentNInput"),
                FieldDefinition::configuration("expressiveTemplating", "Render values as templates"),
            ],
        }
    }
}
