use super::{substitute, TemplateMode};
use crate::{ChatMessage, ExecutionContext, NodeError, PromptTemplate, Role};
use chrono::NaiveDateTime;
use std::collections::{BTreeMap, HashMap};

/// Suffixes of the `chat_user_prompt_last_*` family and how many turns each
/// covers.
pub const RESERVED_TURN_COUNTS: &[(&str, usize)] = &[
    ("one", 1),
    ("two", 2),
    ("three", 3),
    ("four", 4),
    ("five", 5),
    ("ten", 10),
    ("twenty", 20),
];

/// Snapshot of every variable a content field may reference.
#[derive(Debug, Clone, Default)]
pub struct ContentVariables {
    values: HashMap<String, String>,
    messages: Vec<ChatMessage>,
}

impl ContentVariables {
    /// Build the snapshot for a node about to execute. Static variables are
    /// inserted first so generated names take precedence on collision.
    pub fn collect(
        ctx: &ExecutionContext,
        template: Option<&PromptTemplate>,
        now: NaiveDateTime,
    ) -> Self {
        let mut values: HashMap<String, String> = ctx
            .static_variables
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();

        for (position, input) in ctx.agent_inputs.iter() {
            values.insert(format!("agent{}Input", position), input.to_string());
        }
        for (position, output) in ctx.agent_outputs.iter() {
            values.insert(format!("agent{}Output", position), output.to_string());
        }

        insert_conversation(&mut values, ctx.conversation(), template);
        insert_time(&mut values, now);

        if let Some(discussion_id) = ctx.discussion_id() {
            values.insert("discussion_id".to_string(), discussion_id.to_string());
        }

        Self {
            values,
            messages: ctx.conversation().to_vec(),
        }
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.values.get(name).map(String::as_str)
    }

    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.values.insert(name.into(), value.into());
    }

    pub fn render(&self, raw: &str, mode: TemplateMode) -> Result<String, NodeError> {
        match mode {
            TemplateMode::Plain => Ok(substitute(raw, |name| self.values.get(name).cloned())),
            TemplateMode::Expressive => self.render_expressive(raw),
        }
    }

    fn render_expressive(&self, raw: &str) -> Result<String, NodeError> {
        let env = minijinja::Environment::new();
        let mut context: BTreeMap<String, minijinja::Value> = self
            .values
            .iter()
            .map(|(k, v)| (k.clone(), minijinja::Value::from(v.as_str())))
            .collect();
        context.insert(
            "messages".to_string(),
            minijinja::Value::from_serialize(&self.messages),
        );

        env.render_str(raw, context)
            .map_err(|e| NodeError::Template(e.to_string()))
    }
}

fn insert_conversation(
    values: &mut HashMap<String, String>,
    messages: &[ChatMessage],
    template: Option<&PromptTemplate>,
) {
    let turns: Vec<&ChatMessage> = messages.iter().filter(|m| m.role != Role::System).collect();
    let system: Vec<&ChatMessage> = messages.iter().filter(|m| m.role == Role::System).collect();

    for (suffix, count) in RESERVED_TURN_COUNTS {
        let start = turns.len().saturating_sub(*count);
        let window = &turns[start..];
        values.insert(format!("chat_user_prompt_last_{}", suffix), raw_text(window));
        values.insert(
            format!("templated_user_prompt_last_{}", suffix),
            templated_text(window, template),
        );
    }

    values.insert("chat_system_prompt".to_string(), raw_text(&system));
    values.insert(
        "templated_system_prompt".to_string(),
        templated_text(&system, template),
    );
}

fn raw_text(messages: &[&ChatMessage]) -> String {
    messages
        .iter()
        .map(|m| m.content.as_str())
        .collect::<Vec<_>>()
        .join("\n")
}

fn templated_text(messages: &[&ChatMessage], template: Option<&PromptTemplate>) -> String {
    match template {
        Some(template) => messages.iter().map(|m| template.wrap(m)).collect(),
        None => raw_text(messages),
    }
}

fn insert_time(values: &mut HashMap<String, String>, now: NaiveDateTime) {
    let formats = [
        ("todays_date_pretty", "%B %-d, %Y"),
        ("todays_date_iso", "%Y-%m-%d"),
        ("current_time_12h", "%-I:%M %p"),
        ("current_time_24h", "%H:%M"),
        ("current_month_full", "%B"),
        ("current_day_of_week", "%A"),
        ("current_day_of_month", "%-d"),
    ];
    for (name, format) in formats {
        values.insert(name.to_string(), now.format(format).to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{AgentInputs, RequestContext, WorkflowDefinition};
    use chrono::NaiveDate;
    use std::sync::Arc;

    fn fixed_time() -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 3, 5)
            .unwrap()
            .and_hms_opt(15, 7, 0)
            .unwrap()
    }

    fn context(messages: Vec<ChatMessage>) -> ExecutionContext {
        let definition = WorkflowDefinition::new("wf").with_static("agent1Output", "shadowed");
        let request = Arc::new(RequestContext::new("req", messages).with_discussion_id("disc-1"));
        let mut ctx = ExecutionContext::new(request, &definition, 0, AgentInputs::default());
        ctx.agent_outputs.insert(1, "real".to_string()).unwrap();
        ctx
    }

    fn conversation() -> Vec<ChatMessage> {
        vec![
            ChatMessage::system("be kind"),
            ChatMessage::user("first"),
            ChatMessage::assistant("second"),
            ChatMessage::user("third"),
        ]
    }

    #[test]
    fn last_turns_skip_system_messages() {
        let vars = ContentVariables::collect(&context(conversation()), None, fixed_time());

        assert_eq!(vars.get("chat_user_prompt_last_one"), Some("third"));
        assert_eq!(vars.get("chat_user_prompt_last_two"), Some("second\nthird"));
        assert_eq!(vars.get("chat_user_prompt_last_ten"), Some("first\nsecond\nthird"));
        assert_eq!(vars.get("chat_system_prompt"), Some("be kind"));
    }

    #[test]
    fn templated_turns_use_the_prompt_template() {
        let template = PromptTemplate {
            user_prefix: "[U]".to_string(),
            user_suffix: "\n".to_string(),
            assistant_prefix: "[A]".to_string(),
            assistant_suffix: "\n".to_string(),
            ..PromptTemplate::default()
        };
        let vars = ContentVariables::collect(&context(conversation()), Some(&template), fixed_time());

        assert_eq!(
            vars.get("templated_user_prompt_last_two"),
            Some("[A]second\n[U]third\n")
        );
    }

    #[test]
    fn time_variables_follow_the_clock() {
        let vars = ContentVariables::collect(&context(Vec::new()), None, fixed_time());

        assert_eq!(vars.get("todays_date_pretty"), Some("March 5, 2024"));
        assert_eq!(vars.get("todays_date_iso"), Some("2024-03-05"));
        assert_eq!(vars.get("current_time_12h"), Some("3:07 PM"));
        assert_eq!(vars.get("current_time_24h"), Some("15:07"));
        assert_eq!(vars.get("current_day_of_week"), Some("Tuesday"));
    }

    #[test]
    fn generated_names_win_over_static_variables() {
        let vars = ContentVariables::collect(&context(Vec::new()), None, fixed_time());
        assert_eq!(vars.get("agent1Output"), Some("real"));
        assert_eq!(vars.get("discussion_id"), Some("disc-1"));
    }

    #[test]
    fn expressive_mode_loops_over_messages() {
        let vars = ContentVariables::collect(&context(conversation()), None, fixed_time());
        let rendered = vars
            .render(
                "{% for m in messages %}{% if m.role != 'system' %}{{ m.role }}:{{ m.content }};{% endif %}{% endfor %}{{ agent1Output }}",
                TemplateMode::Expressive,
            )
            .unwrap();

        assert_eq!(rendered, "user:first;assistant:second;user:third;real");
    }

    #[test]
    fn expressive_mode_reports_syntax_errors() {
        let vars = ContentVariables::default();
        let err = vars.render("{% if %}", TemplateMode::Expressive).unwrap_err();
        assert!(matches!(err, NodeError::Template(_)));
    }
}
