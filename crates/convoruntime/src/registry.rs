use convocore::resolver::{resolve_configuration, resolve_configuration_value, ConfigurationScope};
use convocore::{
    parse_flag, ConfigFlag, FieldClass, Node, NodeError, NodeSpec, WorkflowDefinition,
    WorkflowError,
};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// Factory trait for creating node instances
pub trait NodeFactory: Send + Sync {
    /// Build a handler from configuration that has already been resolved
    fn create(&self, spec: &ResolvedNodeSpec) -> Result<Box<dyn Node>, NodeError>;

    /// Get node type identifier
    fn node_type(&self) -> &str;

    /// Optional: Get node metadata (description, fields and their classes)
    fn metadata(&self) -> NodeMetadata {
        NodeMetadata::default()
    }
}

/// Metadata about a node type
#[derive(Debug, Clone)]
pub struct NodeMetadata {
    pub description: String,
    pub category: String,
    pub fields: Vec<FieldDefinition>,
}

impl Default for NodeMetadata {
    fn default() -> Self {
        Self {
            description: String::new(),
            category: "general".to_string(),
            fields: Vec::new(),
        }
    }
}

impl NodeMetadata {
    pub fn field(&self, name: &str) -> Option<&FieldDefinition> {
        self.fields.iter().find(|f| f.name == name)
    }
}

#[derive(Debug, Clone)]
pub struct FieldDefinition {
    pub name: String,
    pub description: String,
    pub class: FieldClass,
    pub required: bool,
}

impl FieldDefinition {
    /// Resolved once before the run starts.
    pub fn configuration(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            class: FieldClass::Configuration,
            required: false,
        }
    }

    /// Resolved by the handler when it executes.
    pub fn content(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            class: FieldClass::Content,
            required: false,
        }
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }
}

/// A node's configuration after the configuration pre-pass.
///
/// Configuration-class fields hold their final values; content-class fields
/// are still raw templates.
#[derive(Debug, Clone)]
pub struct ResolvedNodeSpec {
    pub node_type: String,
    pub title: Option<String>,
    pub return_to_user: bool,
    pub config: Map<String, Value>,
}

impl ResolvedNodeSpec {
    pub fn new(node_type: impl Into<String>) -> Self {
        Self {
            node_type: node_type.into(),
            title: None,
            return_to_user: false,
            config: Map::new(),
        }
    }

    pub fn with_config(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.config.insert(key.into(), value.into());
        self
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.config.get(key)
    }

    pub fn str_field(&self, key: &str) -> Result<Option<&str>, NodeError> {
        match self.config.get(key) {
            None | Some(Value::Null) => Ok(None),
            Some(Value::String(s)) => Ok(Some(s.as_str())),
            Some(_) => Err(invalid(key, "a string")),
        }
    }

    pub fn require_str(&self, key: &str) -> Result<&str, NodeError> {
        self.str_field(key)?
            .ok_or_else(|| NodeError::MissingField(key.to_string()))
    }

    /// Accepts JSON booleans and the strings "true"/"false".
    pub fn bool_field(&self, key: &str) -> Result<Option<bool>, NodeError> {
        match self.config.get(key) {
            None | Some(Value::Null) => Ok(None),
            Some(Value::Bool(b)) => Ok(Some(*b)),
            Some(Value::String(s)) => parse_flag(s)
                .map(Some)
                .ok_or_else(|| invalid(key, "a boolean")),
            Some(_) => Err(invalid(key, "a boolean")),
        }
    }

    /// Accepts JSON numbers and numeric strings.
    pub fn u64_field(&self, key: &str) -> Result<Option<u64>, NodeError> {
        match self.config.get(key) {
            None | Some(Value::Null) => Ok(None),
            Some(Value::Number(n)) => n.as_u64().map(Some).ok_or_else(|| invalid(key, "a whole number")),
            Some(Value::String(s)) => s
                .trim()
                .parse()
                .map(Some)
                .map_err(|_| invalid(key, "a whole number")),
            Some(_) => Err(invalid(key, "a whole number")),
        }
    }

    pub fn f64_field(&self, key: &str) -> Result<Option<f64>, NodeError> {
        match self.config.get(key) {
            None | Some(Value::Null) => Ok(None),
            Some(Value::Number(n)) => n.as_f64().map(Some).ok_or_else(|| invalid(key, "a number")),
            Some(Value::String(s)) => s
                .trim()
                .parse()
                .map(Some)
                .map_err(|_| invalid(key, "a number")),
            Some(_) => Err(invalid(key, "a number")),
        }
    }

    /// A list of strings; non-string scalars are rendered as text.
    pub fn string_list(&self, key: &str) -> Result<Vec<String>, NodeError> {
        match self.config.get(key) {
            None | Some(Value::Null) => Ok(Vec::new()),
            Some(Value::Array(items)) => items
                .iter()
                .map(|item| match item {
                    Value::String(s) => Ok(s.clone()),
                    Value::Number(_) | Value::Bool(_) => Ok(item.to_string()),
                    _ => Err(invalid(key, "a list of strings")),
                })
                .collect(),
            Some(_) => Err(invalid(key, "a list of strings")),
        }
    }

    /// An object of string values, in document order.
    pub fn string_map(&self, key: &str) -> Result<Vec<(String, String)>, NodeError> {
        match self.config.get(key) {
            None | Some(Value::Null) => Ok(Vec::new()),
            Some(Value::Object(entries)) => entries
                .iter()
                .map(|(k, v)| match v {
                    Value::String(s) => Ok((k.clone(), s.clone())),
                    _ => Err(invalid(key, "an object of strings")),
                })
                .collect(),
            Some(_) => Err(invalid(key, "an object of strings")),
        }
    }
}

fn invalid(field: &str, expected: &str) -> NodeError {
    NodeError::InvalidField {
        field: field.to_string(),
        expected: expected.to_string(),
    }
}

/// Registry of available node types
pub struct NodeRegistry {
    factories: HashMap<String, Arc<dyn NodeFactory>>,
}

impl NodeRegistry {
    pub fn new() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    /// Register a node factory
    pub fn register(&mut self, factory: Arc<dyn NodeFactory>) {
        let node_type = factory.node_type().to_string();
        tracing::info!("Registering node type: {}", node_type);
        self.factories.insert(node_type, factory);
    }

    pub fn contains(&self, node_type: &str) -> bool {
        self.factories.contains_key(node_type)
    }

    /// Run the configuration pre-pass for one node.
    ///
    /// Resolves the type tag, the `returnToUser` flag and every field the
    /// factory declares as configuration-class. Content fields are copied
    /// through untouched.
    pub fn resolve_spec(
        &self,
        spec: &NodeSpec,
        scope: &ConfigurationScope<'_>,
    ) -> Result<ResolvedNodeSpec, WorkflowError> {
        let node_type = resolve_configuration(&spec.node_type, scope);
        let factory = self
            .factories
            .get(&node_type)
            .ok_or_else(|| WorkflowError::UnknownNodeType(node_type.clone()))?;
        let metadata = factory.metadata();

        let return_to_user = match &spec.return_to_user {
            ConfigFlag::Literal(value) => *value,
            ConfigFlag::Template(raw) => {
                let resolved = resolve_configuration(raw, scope);
                parse_flag(&resolved).ok_or_else(|| {
                    WorkflowError::Invalid(format!(
                        "returnToUser of a '{}' node resolved to '{}', not a boolean",
                        node_type, resolved
                    ))
                })?
            }
        };

        let mut config = Map::new();
        for (key, value) in &spec.config {
            let resolved = match metadata.field(key) {
                Some(field) if field.class == FieldClass::Configuration => {
                    resolve_configuration_value(value, scope)
                }
                _ => value.clone(),
            };
            config.insert(key.clone(), resolved);
        }

        debug!("Resolved configuration of '{}' node", node_type);
        Ok(ResolvedNodeSpec {
            node_type,
            title: spec.title.clone(),
            return_to_user,
            config,
        })
    }

    /// Create a node instance from a resolved spec
    pub fn create_node(&self, spec: &ResolvedNodeSpec) -> Result<Box<dyn Node>, WorkflowError> {
        let factory = self
            .factories
            .get(&spec.node_type)
            .ok_or_else(|| WorkflowError::UnknownNodeType(spec.node_type.clone()))?;

        for field in factory.metadata().fields.iter().filter(|f| f.required) {
            if !spec.config.contains_key(&field.name) {
                return Err(WorkflowError::Invalid(format!(
                    "'{}' node is missing required field '{}'",
                    spec.node_type, field.name
                )));
            }
        }

        factory
            .create(spec)
            .map_err(|e| WorkflowError::Invalid(format!("Failed to create node: {}", e)))
    }

    /// Static checks that need no run context: workflow shape, known types
    /// and required fields. Templated types are skipped.
    pub fn validate(&self, definition: &WorkflowDefinition) -> Result<(), WorkflowError> {
        definition.validate()?;
        for (index, spec) in definition.nodes.iter().enumerate() {
            if spec.node_type.contains('{') {
                continue;
            }
            let factory = self
                .factories
                .get(&spec.node_type)
                .ok_or_else(|| WorkflowError::UnknownNodeType(spec.node_type.clone()))?;
            for field in factory.metadata().fields.iter().filter(|f| f.required) {
                if !spec.config.contains_key(&field.name) {
                    return Err(WorkflowError::Invalid(format!(
                        "node {} ('{}') is missing required field '{}'",
                        index + 1,
                        spec.node_type,
                        field.name
                    )));
                }
            }
        }
        Ok(())
    }

    /// Get all registered node types
    pub fn list_node_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.factories.keys().cloned().collect();
        types.sort();
        types
    }

    /// Get metadata for a node type
    pub fn get_metadata(&self, node_type: &str) -> Option<NodeMetadata> {
        self.factories.get(node_type).map(|f| f.metadata())
    }
}

impl Default for NodeRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use convocore::{AgentInputs, NodeContext, NodeOutput};
    use serde_json::json;

    struct EchoNode;

    #[async_trait]
    impl Node for EchoNode {
        fn node_type(&self) -> &str {
            "test.echo"
        }

        async fn execute(&self, _ctx: NodeContext) -> Result<NodeOutput, NodeError> {
            Ok(NodeOutput::empty())
        }
    }

    struct EchoFactory;

    impl NodeFactory for EchoFactory {
        fn create(&self, _spec: &ResolvedNodeSpec) -> Result<Box<dyn Node>, NodeError> {
            Ok(Box::new(EchoNode))
        }

        fn node_type(&self) -> &str {
            "test.echo"
        }

        fn metadata(&self) -> NodeMetadata {
            NodeMetadata {
                description: "Echo".to_string(),
                category: "test".to_string(),
                fields: vec![
                    FieldDefinition::configuration("endpoint", "Backend").required(),
                    FieldDefinition::content("prompt", "Prompt"),
                ],
            }
        }
    }

    fn registry() -> NodeRegistry {
        let mut registry = NodeRegistry::new();
        registry.register(Arc::new(EchoFactory));
        registry
    }

    #[test]
    fn configuration_fields_resolve_and_content_fields_stay_raw() {
        let registry = registry();
        let statics: HashMap<String, String> =
            [("backend".to_string(), "local".to_string())].into_iter().collect();
        let inputs = AgentInputs::new(vec!["yes".to_string()]);
        let scope = ConfigurationScope::new(&statics, &inputs);

        let mut spec = NodeSpec::new("test.echo")
            .with_config("endpoint", "{backend}")
            .with_config("prompt", "{agent1Output} {backend}");
        spec.return_to_user = ConfigFlag::Template("{agent1Input}".to_string());

        let resolved = registry.resolve_spec(&spec, &scope).unwrap();
        assert_eq!(resolved.get("endpoint"), Some(&json!("local")));
        assert_eq!(resolved.get("prompt"), Some(&json!("{agent1Output} {backend}")));
        assert!(resolved.return_to_user);
    }

    #[test]
    fn templated_type_tag_is_resolved_first() {
        let registry = registry();
        let statics: HashMap<String, String> =
            [("kind".to_string(), "echo".to_string())].into_iter().collect();
        let inputs = AgentInputs::default();
        let scope = ConfigurationScope::new(&statics, &inputs);

        let spec = NodeSpec::new("test.{kind}").with_config("endpoint", "x");
        assert_eq!(registry.resolve_spec(&spec, &scope).unwrap().node_type, "test.echo");
    }

    #[test]
    fn unknown_type_and_missing_field_are_rejected() {
        let registry = registry();
        let statics = HashMap::new();
        let inputs = AgentInputs::default();
        let scope = ConfigurationScope::new(&statics, &inputs);

        let err = registry.resolve_spec(&NodeSpec::new("test.nope"), &scope).unwrap_err();
        assert!(matches!(err, WorkflowError::UnknownNodeType(t) if t == "test.nope"));

        let resolved = registry.resolve_spec(&NodeSpec::new("test.echo"), &scope).unwrap();
        assert!(matches!(registry.create_node(&resolved), Err(WorkflowError::Invalid(_))));

        let definition = WorkflowDefinition::new("wf").with_node(NodeSpec::new("test.echo"));
        assert!(registry.validate(&definition).is_err());
    }

    #[test]
    fn typed_accessors() {
        let spec = ResolvedNodeSpec::new("x")
            .with_config("flag", "TRUE")
            .with_config("tokens", "250")
            .with_config("temperature", 0.5)
            .with_config("vars", json!(["a", 2]))
            .with_config("table", json!({"One": "wf-one"}));

        assert_eq!(spec.bool_field("flag").unwrap(), Some(true));
        assert_eq!(spec.u64_field("tokens").unwrap(), Some(250));
        assert_eq!(spec.f64_field("temperature").unwrap(), Some(0.5));
        assert_eq!(spec.string_list("vars").unwrap(), vec!["a", "2"]);
        assert_eq!(
            spec.string_map("table").unwrap(),
            vec![("One".to_string(), "wf-one".to_string())]
        );
        assert!(matches!(spec.require_str("missing"), Err(NodeError::MissingField(_))));
        assert!(spec.str_field("temperature").is_err());
    }
}
