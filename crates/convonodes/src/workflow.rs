use async_trait::async_trait;
use convocore::services::SubWorkflowCall;
use convocore::{Node, NodeContext, NodeError, NodeOutput, TemplateMode};
use convoruntime::{FieldDefinition, NodeFactory, NodeMetadata, ResolvedNodeSpec};

pub const WORKFLOW_CALL: &str = "workflow.call";

/// Resolve `scoped` in the caller's context and run `workflow` with the
/// results as its agent inputs.
pub(crate) async fn call_workflow(
    ctx: &NodeContext,
    workflow: &str,
    scoped: &[String],
    mode: TemplateMode,
) -> Result<NodeOutput, NodeError> {
    let variables = ctx.variables(None);
    let scoped_inputs = scoped
        .iter()
        .map(|raw| variables.render(raw, mode))
        .collect::<Result<Vec<_>, _>>()?;

    ctx.events.info(format!(
        "Running '{}' with {} scoped variables",
        workflow,
        scoped_inputs.len()
    ));

    let call = SubWorkflowCall {
        workflow: workflow.to_string(),
        scoped_inputs,
    };
    ctx.services
        .invoker
        .invoke(ctx, call)
        .await
        .map_err(|e| NodeError::SubWorkflow {
            workflow: workflow.to_string(),
            source: Box::new(e),
        })
}

/// Runs another workflow inline.
pub struct SubWorkflowNode {
    workflow: String,
    scoped_variables: Vec<String>,
    mode: TemplateMode,
}

#[async_trait]
impl Node for SubWorkflowNode {
    fn node_type(&self) -> &str {
        WORKFLOW_CALL
    }

    async fn execute(&self, ctx: NodeContext) -> Result<NodeOutput, NodeError> {
        call_workflow(&ctx, &self.workflow, &self.scoped_variables, self.mode).await
    }
}

pub struct SubWorkflowNodeFactory;

impl NodeFactory for SubWorkflowNodeFactory {
    fn create(&self, spec: &ResolvedNodeSpec) -> Result<Box<dyn Node>, NodeError> {
        let workflow = spec.require_str("workflowName")?.trim().to_string();
        if workflow.is_empty() {
            return Err(NodeError::Configuration(
                "workflowName resolved to an empty name".to_string(),
            ));
        }
        Ok(Box::new(SubWorkflowNode {
            workflow,
            scoped_variables: spec.string_list("scoped_variables")?,
            mode: TemplateMode::from_flag(spec.bool_field("expressiveTemplating")?.unwrap_or(false)),
        }))
    }

    fn node_type(&self) -> &str {
        WORKFLOW_CALL
    }

    fn metadata(&self) -> NodeMetadata {
        NodeMetadata {
            description: "Run another workflow with its own variables".to_string(),
            category: "workflow".to_string(),
            fields: vec![
                FieldDefinition::configuration("workflowName", "Child workflow").required(),
                FieldDefinition::content("scoped_variables", "Values passed as agentNInput"),
                FieldDefinition::configuration("expressiveTemplating", "Render values as templates"),
            ],
        }
    }
}
