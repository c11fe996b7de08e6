use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("the uri {uri} is already in the routing slip [{}]", .slip.join(", "))]
    DuplicateEntry { uri: String, slip: Vec<String> },
    #[error("the uri {uri} is not in the routing slip [{}]", .slip.join(", "))]
    NotArrived { uri: String, slip: Vec<String> },
    #[error(
        "the uri {uri} is already in the routing slip [{}], cannot continue with routing slip [{}]",
        .slip.join(", "),
        .other.join(", ")
    )]
    ContinuationConflict {
        uri: String,
        slip: Vec<String>,
        other: Vec<String>,
    },
    #[error("parent cannot be changed")]
    ParentConflict,
    #[error("token of parented command cannot be changed")]
    RootTokenMismatch,
    #[error("command envelope '{0}' has no token")]
    MissingToken(String),
    #[error("invalid envelope json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("failed to decode '{event_type}' payload: {message}")]
    Payload { event_type: String, message: String },
}
