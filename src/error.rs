use std::collections::BTreeMap;

use http::StatusCode;

/// Error kinds for the request path, grouped the way the proxy reacts to them:
/// configuration kinds are fatal at load time, request kinds return 4xx without
/// fallback, transformation kinds enter the fallback engine, storage and auth
/// kinds are absorbed by the layer that produced them.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ErrorKind {
    #[error("missing KV binding: {0}")]
    MissingBinding(String),
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("configuration schema violation: {0}")]
    SchemaViolation(String),

    #[error("no configured pattern matches path: {0}")]
    NoMatchingPattern(String),
    #[error("invalid value for parameter {param}: {reason}")]
    InvalidOption { param: String, reason: String },
    #[error("unknown derivative: {0}")]
    UnknownDerivative(String),

    #[error("requested duration exceeds the upstream limit")]
    DurationLimit,
    #[error("source file exceeds the upstream size limit")]
    FileSizeLimit,
    #[error("upstream transformation rejected the request ({0})")]
    UpstreamClientError(StatusCode),
    #[error("upstream transformation failed ({0})")]
    UpstreamServerError(StatusCode),

    #[error("KV entry not found")]
    KvMiss,
    #[error("KV entry failed integrity verification")]
    KvCorrupt,
    #[error("KV write failed: {0}")]
    KvWriteFailure(String),
    #[error("edge cache miss")]
    EdgeCacheMiss,
    #[error("origin fetch failed: {0}")]
    OriginFetchFailure(String),

    #[error("missing credentials: {0}")]
    MissingCredentials(String),
    #[error("request signing failed: {0}")]
    SigningFailure(String),
    #[error("presigned URL generation failed: {0}")]
    PresignGenerationFailure(String),

    #[error("requested range cannot be satisfied")]
    UnsatisfiableRange,

    #[error("upstream fetch timed out")]
    Timeout,

    #[error("{0}")]
    Unknown(String),
}

/// An [`ErrorKind`] plus whatever context the failing operation attached.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{kind}")]
pub struct Error {
    pub kind: ErrorKind,
    context: BTreeMap<&'static str, String>,
}

impl Error {
    pub fn new(kind: ErrorKind) -> Self {
        Self {
            kind,
            context: BTreeMap::new(),
        }
    }

    pub fn unknown(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Unknown(message.into()))
    }

    pub fn invalid_option(param: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidOption {
            param: param.into(),
            reason: reason.into(),
        })
    }

    pub fn with_context(mut self, key: &'static str, value: impl Into<String>) -> Self {
        self.context.insert(key, value.into());
        self
    }

    pub fn context(&self) -> &BTreeMap<&'static str, String> {
        &self.context
    }

    pub fn context_value(&self, key: &'static str) -> Option<&str> {
        self.context.get(key).map(String::as_str)
    }

    /// Stable tag for logs and diagnostic headers.
    pub fn kind_tag(&self) -> &'static str {
        use ErrorKind::*;
        match &self.kind {
            MissingBinding(_) => "MissingBinding",
            InvalidConfig(_) => "InvalidConfig",
            SchemaViolation(_) => "SchemaViolation",
            NoMatchingPattern(_) => "NoMatchingPattern",
            InvalidOption { .. } => "InvalidOption",
            UnknownDerivative(_) => "UnknownDerivative",
            DurationLimit => "DurationLimit",
            FileSizeLimit => "FileSizeLimit",
            UpstreamClientError(_) => "UpstreamClientError",
            UpstreamServerError(_) => "UpstreamServerError",
            KvMiss => "KVMiss",
            KvCorrupt => "KVCorrupt",
            KvWriteFailure(_) => "KVWriteFailure",
            EdgeCacheMiss => "EdgeCacheMiss",
            OriginFetchFailure(_) => "OriginFetchFailure",
            MissingCredentials(_) => "MissingCredentials",
            SigningFailure(_) => "SigningFailure",
            PresignGenerationFailure(_) => "PresignGenerationFailure",
            UnsatisfiableRange => "UnsatisfiableRange",
            Timeout => "Timeout",
            Unknown(_) => "Unknown",
        }
    }

    pub fn http_status(&self) -> StatusCode {
        use ErrorKind::*;
        match &self.kind {
            NoMatchingPattern(_) => StatusCode::NOT_FOUND,
            InvalidOption { .. } | UnknownDerivative(_) => StatusCode::BAD_REQUEST,
            DurationLimit | FileSizeLimit => StatusCode::BAD_REQUEST,
            UpstreamClientError(s) | UpstreamServerError(s) => *s,
            UnsatisfiableRange => StatusCode::RANGE_NOT_SATISFIABLE,
            Timeout => StatusCode::GATEWAY_TIMEOUT,
            KvMiss | EdgeCacheMiss => StatusCode::NOT_FOUND,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Request-level errors are answered directly, without the fallback chain.
    pub fn is_request_error(&self) -> bool {
        matches!(
            self.kind,
            ErrorKind::NoMatchingPattern(_)
                | ErrorKind::InvalidOption { .. }
                | ErrorKind::UnknownDerivative(_)
        )
    }
}

impl From<ErrorKind> for Error {
    fn from(kind: ErrorKind) -> Self {
        Self::new(kind)
    }
}

impl From<hyper::Error> for Error {
    fn from(e: hyper::Error) -> Self {
        Self::new(ErrorKind::OriginFetchFailure(e.to_string()))
    }
}

impl From<http::Error> for Error {
    fn from(e: http::Error) -> Self {
        Self::unknown(e.to_string())
    }
}

impl From<http::header::InvalidHeaderValue> for Error {
    fn from(e: http::header::InvalidHeaderValue) -> Self {
        Self::unknown(e.to_string())
    }
}
