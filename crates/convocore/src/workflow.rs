use crate::{FlowError, WorkflowError};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;

/// Complete workflow definition: ordered nodes plus static variables.
#[derive(Debug, Clone)]
pub struct WorkflowDefinition {
    pub name: String,
    pub nodes: Vec<NodeSpec>,
    pub static_variables: Arc<HashMap<String, String>>,
}

/// On-disk shapes accepted for a workflow file.
#[derive(Deserialize)]
#[serde(untagged)]
enum WorkflowFile {
    Nodes(Vec<NodeSpec>),
    Document {
        nodes: Vec<NodeSpec>,
        #[serde(default, rename = "staticVariables")]
        static_variables: HashMap<String, Value>,
    },
}

impl WorkflowDefinition {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            nodes: Vec::new(),
            static_variables: Arc::new(HashMap::new()),
        }
    }

    /// Parse a workflow file. Either a bare array of nodes or an object with
    /// `nodes` and `staticVariables`.
    pub fn from_json(name: impl Into<String>, json: &str) -> Result<Self, FlowError> {
        let name = name.into();
        let file: WorkflowFile = serde_json::from_str(json)?;
        let (nodes, statics) = match file {
            WorkflowFile::Nodes(nodes) => (nodes, HashMap::new()),
            WorkflowFile::Document {
                nodes,
                static_variables,
            } => (nodes, static_variables),
        };

        let static_variables = statics
            .into_iter()
            .map(|(key, value)| {
                let text = match value {
                    Value::String(s) => s,
                    Value::Null => String::new(),
                    other => other.to_string(),
                };
                (key, text)
            })
            .collect();

        Ok(Self {
            name,
            nodes,
            static_variables: Arc::new(static_variables),
        })
    }

    pub fn add_node(&mut self, node: NodeSpec) -> usize {
        self.nodes.push(node);
        self.nodes.len()
    }

    pub fn with_node(mut self, node: NodeSpec) -> Self {
        self.add_node(node);
        self
    }

    pub fn with_static(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        Arc::make_mut(&mut self.static_variables).insert(key.into(), value.into());
        self
    }

    /// Structural checks that do not need the node registry. Templated
    /// `returnToUser` flags are checked again once the run resolves them.
    pub fn validate(&self) -> Result<(), WorkflowError> {
        let marked: Vec<usize> = self
            .nodes
            .iter()
            .enumerate()
            .filter(|(_, node)| node.return_to_user == ConfigFlag::Literal(true))
            .map(|(index, _)| index + 1)
            .collect();

        if marked.len() > 1 {
            return Err(WorkflowError::Invalid(format!(
                "'{}' marks more than one node with returnToUser (nodes {:?})",
                self.name, marked
            )));
        }

        if let Some(position) = self.nodes.iter().position(|n| n.node_type.trim().is_empty()) {
            return Err(WorkflowError::Invalid(format!(
                "'{}' node {} has an empty type",
                self.name,
                position + 1
            )));
        }

        Ok(())
    }
}

/// Node specification in a workflow
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeSpec {
    #[serde(rename = "type")]
    pub node_type: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,

    #[serde(default, rename = "returnToUser")]
    pub return_to_user: ConfigFlag,

    /// Variant-specific configuration, kept raw until the run resolves it.
    #[serde(flatten)]
    pub config: Map<String, Value>,
}

impl NodeSpec {
    pub fn new(node_type: impl Into<String>) -> Self {
        Self {
            node_type: node_type.into(),
            title: None,
            return_to_user: ConfigFlag::default(),
            config: Map::new(),
        }
    }

    pub fn with_config(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.config.insert(key.into(), value.into());
        self
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }

    pub fn returning_to_user(mut self) -> Self {
        self.return_to_user = ConfigFlag::Literal(true);
        self
    }
}

/// A boolean flag that may be written literally or as a template resolved
/// before the run starts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ConfigFlag {
    Literal(bool),
    Template(String),
}

impl Default for ConfigFlag {
    fn default() -> Self {
        ConfigFlag::Literal(false)
    }
}

/// Interpret a resolved flag string.
pub fn parse_flag(text: &str) -> Option<bool> {
    match text.trim().to_ascii_lowercase().as_str() {
        "true" | "yes" | "1" => Some(true),
        "false" | "no" | "0" | "" => Some(false),
        _ => None,
    }
}
