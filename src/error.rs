use thiserror::Error;

#[derive(Debug, Error)]
pub enum CitegraphError {
    #[error("Failed to initialize HTTP client: {0}")]
    HttpClientInit(#[source] reqwest::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("HTTP error: {0}")]
    HttpMiddleware(#[from] reqwest_middleware::Error),

    #[error("API error from {api}: {message}")]
    Api { api: String, message: String },

    #[error("Invalid JSON from {api}: {source}")]
    ApiJson {
        api: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("Malformed response from {api}: {message}")]
    MalformedResponse { api: String, message: String },

    #[error("{api} did not answer after {attempts} attempts")]
    RetriesExhausted { api: String, attempts: u32 },

    #[error("Edge row has {actual} columns, header declares {expected}: {row}")]
    RowShape {
        expected: usize,
        actual: usize,
        row: String,
    },

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Graph store error {code}: {message}")]
    Graph { code: String, message: String },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Template error: {0}")]
    Template(#[from] minijinja::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Operation cancelled")]
    Cancelled,
}

impl CitegraphError {
    /// HTTP-style status for callers that expose results over a request/response surface.
    pub fn status_code(&self) -> u16 {
        match self {
            Self::InvalidArgument(_) => 400,
            Self::RetriesExhausted { .. } => 504,
            Self::Api { .. }
            | Self::ApiJson { .. }
            | Self::MalformedResponse { .. }
            | Self::Http(_)
            | Self::HttpMiddleware(_)
            | Self::Graph { .. } => 502,
            _ => 500,
        }
    }

    pub fn is_client_error(&self) -> bool {
        self.status_code() == 400
    }
}
