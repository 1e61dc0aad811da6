use thiserror::Error;

#[derive(Error, Debug)]
pub enum FlowError {
    #[error("Node error: {0}")]
    Node(#[from] NodeError),

    #[error("Workflow error: {0}")]
    Workflow(#[from] WorkflowError),

    #[error("Lock error: {0}")]
    Lock(#[from] LockError),

    #[error("Execution error: {0}")]
    Execution(String),

    #[error("Request cancelled")]
    Cancelled,

    #[error("Request {0} is already in flight")]
    DuplicateRequest(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

#[derive(Error, Debug)]
pub enum NodeError {
    #[error("Missing required field: {0}")]
    MissingField(String),

    #[error("Invalid value for '{field}': expected {expected}")]
    InvalidField { field: String, expected: String },

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Execution failed: {0}")]
    ExecutionFailed(String),

    #[error("Backend '{endpoint}' failed: {message}")]
    Backend { endpoint: String, message: String },

    #[error("No branch matches '{key}' and no default or fallback is configured")]
    BranchNotFound { key: String },

    #[error("Node {position} produced a stream but is not the elected responder")]
    StreamingNotAllowed { position: usize },

    #[error("Template error: {0}")]
    Template(String),

    #[error("Sub-workflow '{workflow}' failed: {source}")]
    SubWorkflow {
        workflow: String,
        #[source]
        source: Box<FlowError>,
    },

    #[error("Cancelled")]
    Cancelled,
}

impl NodeError {
    pub fn backend(endpoint: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Backend {
            endpoint: endpoint.into(),
            message: message.into(),
        }
    }
}

#[derive(Error, Debug)]
pub enum WorkflowError {
    #[error("Workflow not found: {0}")]
    NotFound(String),

    #[error("Invalid workflow: {0}")]
    Invalid(String),

    #[error("Unknown node type: {0}")]
    UnknownNodeType(String),

    #[error("Workflow nesting exceeded {limit} levels at '{workflow}'")]
    RecursionLimit { workflow: String, limit: usize },

    #[error("Output for node {0} was already recorded")]
    OutputAlreadySet(usize),
}

#[derive(Error, Debug, Clone)]
pub enum LockError {
    #[error("Lock store unavailable: {0}")]
    Store(String),
}
