use thiserror::Error;

/// Error taxonomy for the proxy engine.
///
/// Each variant maps to one of the outcomes in the error-handling design:
/// validation errors reject a proxy entry at compile time, upstream/parse/
/// decompression errors degrade gracefully on the request path, and access
/// control outcomes carry their own response instructions rather than
/// propagating as generic failures.
#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("invalid proxy config: {0}")]
    Validation(String),

    #[error("upstream request failed: {0}")]
    Upstream(String),

    #[error("failed to parse inbound request: {0}")]
    InboundParse(String),

    #[error("response decompression failed: {0}")]
    Decompression(String),

    #[error("access denied")]
    AccessDenied,

    #[error("filtered by access control list")]
    FilterDenied,

    #[error("campaign is not active")]
    CampaignInactive,

    #[error("internal error: {0}")]
    Internal(String),
}

impl From<regex::Error> for ProxyError {
    fn from(e: regex::Error) -> Self {
        ProxyError::Validation(format!("bad regex: {e}"))
    }
}

impl From<serde_yaml::Error> for ProxyError {
    fn from(e: serde_yaml::Error) -> Self {
        ProxyError::Validation(format!("bad yaml: {e}"))
    }
}

pub type ProxyResult<T> = Result<T, ProxyError>;
