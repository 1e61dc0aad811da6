//! Variable resolution for node fields.
//!
//! Configuration fields are resolved once, before any node of a run executes,
//! from static variables and agent inputs only. Content fields are resolved
//! when their node executes, against the full [`ContentVariables`] snapshot.
//!
//! Plain resolution is one left-to-right pass of `{name}` replacement;
//! substituted text is never rescanned and unknown placeholders are kept
//! verbatim.

mod variables;

pub use variables::{ContentVariables, RESERVED_TURN_COUNTS};

use crate::{AgentInputs, ExecutionContext, NodeError, PromptTemplate};
use regex::{Captures, Regex};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::OnceLock;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldClass {
    Configuration,
    Content,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum TemplateMode {
    #[default]
    Plain,
    /// Jinja-style loops and conditionals over the same variables.
    Expressive,
}

impl TemplateMode {
    pub fn from_flag(expressive: bool) -> Self {
        if expressive {
            TemplateMode::Expressive
        } else {
            TemplateMode::Plain
        }
    }
}

/// Variables visible to configuration fields. Agent outputs are not part of
/// this scope.
#[derive(Debug, Clone, Copy)]
pub struct ConfigurationScope<'a> {
    pub static_variables: &'a HashMap<String, String>,
    pub agent_inputs: &'a AgentInputs,
}

impl<'a> ConfigurationScope<'a> {
    pub fn new(static_variables: &'a HashMap<String, String>, agent_inputs: &'a AgentInputs) -> Self {
        Self {
            static_variables,
            agent_inputs,
        }
    }

    pub fn from_context(ctx: &'a ExecutionContext) -> Self {
        Self::new(&ctx.static_variables, &ctx.agent_inputs)
    }

    pub fn lookup(&self, name: &str) -> Option<String> {
        if let Some(position) = agent_index(name, "Input") {
            return self.agent_inputs.get(position).map(str::to_string);
        }
        self.static_variables.get(name).cloned()
    }
}

/// Resolve a single field of the given class against a run context.
///
/// Configuration fields always use plain substitution. Content fields honour
/// `mode` and see conversation turns through `template` when one is given.
pub fn resolve(
    raw: &str,
    class: FieldClass,
    mode: TemplateMode,
    template: Option<&PromptTemplate>,
    ctx: &ExecutionContext,
) -> Result<String, NodeError> {
    match class {
        FieldClass::Configuration => Ok(resolve_configuration(raw, &ConfigurationScope::from_context(ctx))),
        FieldClass::Content => {
            ContentVariables::collect(ctx, template, chrono::Local::now().naive_local()).render(raw, mode)
        }
    }
}

pub fn resolve_configuration(raw: &str, scope: &ConfigurationScope<'_>) -> String {
    substitute(raw, |name| scope.lookup(name))
}

/// Resolve every string (object keys included) inside a configuration value.
pub fn resolve_configuration_value(value: &Value, scope: &ConfigurationScope<'_>) -> Value {
    match value {
        Value::String(s) => Value::String(resolve_configuration(s, scope)),
        Value::Array(items) => Value::Array(
            items
                .iter()
                .map(|item| resolve_configuration_value(item, scope))
                .collect(),
        ),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(key, item)| {
                    (
                        resolve_configuration(key, scope),
                        resolve_configuration_value(item, scope),
                    )
                })
                .collect(),
        ),
        other => other.clone(),
    }
}

fn placeholder_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"\{([A-Za-z0-9_]+)\}").expect("placeholder pattern is valid"))
}

/// Single-pass placeholder replacement.
pub(crate) fn substitute<F>(raw: &str, lookup: F) -> String
where
    F: Fn(&str) -> Option<String>,
{
    placeholder_pattern()
        .replace_all(raw, |caps: &Captures<'_>| {
            lookup(&caps[1]).unwrap_or_else(|| caps[0].to_string())
        })
        .into_owned()
}

/// Parse `agent<N><suffix>` into N.
pub(crate) fn agent_index(name: &str, suffix: &str) -> Option<usize> {
    name.strip_prefix("agent")?
        .strip_suffix(suffix)?
        .parse::<usize>()
        .ok()
        .filter(|n| *n > 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{AgentOutputs, RequestContext, WorkflowDefinition};
    use std::sync::Arc;

    fn context_with_output() -> ExecutionContext {
        let definition = WorkflowDefinition::new("wf").with_static("model", "big-model");
        let request = Arc::new(RequestContext::new("req", Vec::new()));
        let mut ctx = ExecutionContext::new(
            request,
            &definition,
            1,
            AgentInputs::new(vec!["from-parent".to_string()]),
        );
        ctx.agent_outputs = {
            let mut outputs = AgentOutputs::new();
            outputs.insert(1, "produced".to_string()).unwrap();
            outputs
        };
        ctx
    }

    #[test]
    fn configuration_ignores_agent_outputs() {
        let ctx = context_with_output();
        let resolved = resolve(
            "{model}/{agent1Input}/{agent1Output}",
            FieldClass::Configuration,
            TemplateMode::Expressive,
            None,
            &ctx,
        )
        .unwrap();
        assert_eq!(resolved, "big-model/from-parent/{agent1Output}");
    }

    #[test]
    fn content_sees_agent_outputs() {
        let ctx = context_with_output();
        let resolved = resolve(
            "{agent1Output} via {model}",
            FieldClass::Content,
            TemplateMode::Plain,
            None,
            &ctx,
        )
        .unwrap();
        assert_eq!(resolved, "produced via big-model");
    }

    #[test]
    fn content_honours_expressive_mode() {
        let ctx = context_with_output();
        let raw = "{% if agent1Output == 'produced' %}yes {{ model }}{% endif %}";
        let resolved = resolve(raw, FieldClass::Content, TemplateMode::Expressive, None, &ctx).unwrap();
        assert_eq!(resolved, "yes big-model");
    }

    #[test]
    fn unknown_placeholders_stay_literal() {
        let scope_statics = HashMap::new();
        let inputs = AgentInputs::default();
        let scope = ConfigurationScope::new(&scope_statics, &inputs);
        assert_eq!(resolve_configuration("keep {missing} {}", &scope), "keep {missing} {}");
    }

    #[test]
    fn substituted_text_is_not_rescanned() {
        let resolved = substitute("{a}{b}", |name| match name {
            "a" => Some("{b}".to_string()),
            "b" => Some("B".to_string()),
            _ => None,
        });
        assert_eq!(resolved, "{b}B");
    }

    #[test]
    fn configuration_values_resolve_keys_and_nested_strings() {
        let mut statics = HashMap::new();
        statics.insert("lang".to_string(), "Python".to_string());
        let inputs = AgentInputs::new(vec!["CodeFlow".to_string()]);
        let scope = ConfigurationScope::new(&statics, &inputs);

        let value = serde_json::json!({"{lang}": "{agent1Input}", "other": [1, "{lang}"]});
        let resolved = resolve_configuration_value(&value, &scope);
        assert_eq!(resolved, serde_json::json!({"Python": "CodeFlow", "other": [1, "Python"]}));
    }

    #[test]
    fn agent_index_parsing() {
        assert_eq!(agent_index("agent12Output", "Output"), Some(12));
        assert_eq!(agent_index("agent0Output", "Output"), None);
        assert_eq!(agent_index("agentXOutput", "Output"), None);
        assert_eq!(agent_index("agent3Input", "Output"), None);
    }
}
