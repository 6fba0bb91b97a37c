use thiserror::Error;

/// Everything that can go wrong between an HTTP request and a completion.
///
/// Template and request-validation variants map to 400s at the route layer;
/// model and engine variants map to 500s. The mapping itself lives in
/// `web::response_helpers`.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("model is not loaded")]
    ModelNotLoaded,

    #[error("No messages provided")]
    EmptyInput,

    #[error("system prompt is only allowed as the first message")]
    MisplacedSystemPrompt,

    #[error("unknown role: {0}")]
    UnknownRole(String),

    #[error("inference failed: {0}")]
    Inference(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl GatewayError {
    /// True for errors caused by the caller's request rather than the server.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            GatewayError::EmptyInput
                | GatewayError::MisplacedSystemPrompt
                | GatewayError::UnknownRole(_)
        )
    }
}
