// ABOUTME: Error taxonomy for the control-plane client
// ABOUTME: Maps every failure to one of transient, domain, or fatal via a single rule table

use thiserror::Error;

pub type Result<T> = std::result::Result<T, ApiError>;

/// How a failure should be handled by retry loops.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Backend propagation lag; expected to clear within a bounded window.
    Transient,
    /// The backend reported a definitive failure. Surfaced verbatim, never retried.
    Domain,
    /// Everything else. Never retried.
    Fatal,
}

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("http {status}: {message}")]
    Http {
        status: u16,
        code: Option<String>,
        message: String,
    },

    /// A 2xx submission whose envelope carried `ok: false`.
    #[error("request rejected: {message}")]
    Rejected {
        code: Option<String>,
        message: String,
    },

    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("failed to serialize request payload: {0}")]
    Serialize(#[source] serde_json::Error),

    #[error("failed to decode {what}: {source}")]
    Decode {
        what: &'static str,
        #[source]
        source: serde_json::Error,
    },

    #[error("invalid url {url}: {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("redirect from {url} has no Location header")]
    MissingLocation { url: String },

    #[error("redirect from {url} has malformed Location {location:?}")]
    InvalidLocation { url: String, location: String },

    #[error("too many redirects (limit {limit}), last url attempted: {url}")]
    TooManyRedirects { url: String, limit: usize },

    #[error("job {job} failed: {detail}")]
    JobFailed { job: String, detail: String },

    #[error("{resource} entered {state} state")]
    ResourceFailed { resource: String, state: String },

    #[error("timeout waiting for {target} (last state: {last_state})")]
    Timeout { target: String, last_state: String },

    #[error("operation cancelled")]
    Cancelled,

    #[error("invalid resource id: {0}")]
    InvalidResourceId(String),

    #[error("job {job} finished without a resource_id")]
    MissingResourceId { job: String },

    #[error("no active {kind} with {field} {value:?}")]
    CatalogMiss {
        kind: &'static str,
        field: &'static str,
        value: String,
    },

    #[error("invalid desired state: {0}")]
    Invalid(String),

    #[error("{step} failed: {source}")]
    Step {
        step: &'static str,
        #[source]
        source: Box<ApiError>,
    },
}

impl ApiError {
    /// Wrap this error with the name of the sub-step that produced it.
    pub fn at_step(self, step: &'static str) -> ApiError {
        ApiError::Step {
            step,
            source: Box::new(self),
        }
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            ApiError::Http { status, .. } => Some(*status),
            ApiError::Step { source, .. } => source.status(),
            _ => None,
        }
    }

    /// True for a 404 or a `NOT_FOUND` error code. What that means depends on the caller's
    /// phase: "already gone" on read/delete, "not visible yet" while polling.
    pub fn is_not_found(&self) -> bool {
        match self {
            ApiError::Http { status, code, .. } => {
                *status == 404
                    || code
                        .as_deref()
                        .is_some_and(|c| c.eq_ignore_ascii_case("NOT_FOUND"))
            }
            ApiError::Step { source, .. } => source.is_not_found(),
            _ => false,
        }
    }

    pub fn class(&self) -> ErrorClass {
        match self {
            ApiError::Http {
                status,
                code,
                message,
            } => classify(Some(*status), code.as_deref(), message),
            ApiError::Rejected { code, message } => classify(None, code.as_deref(), message),
            ApiError::JobFailed { .. } | ApiError::ResourceFailed { .. } => ErrorClass::Domain,
            ApiError::Step { source, .. } => source.class(),
            _ => ErrorClass::Fatal,
        }
    }

    pub fn is_transient(&self) -> bool {
        self.class() == ErrorClass::Transient
    }
}

/// A single classification rule.
#[derive(Debug, Clone, Copy)]
pub enum Matcher {
    Status(u16),
    /// Machine-readable error code, compared case-insensitively.
    Code(&'static str),
    /// Substring of the human message, compared case-insensitively.
    MessageContains(&'static str),
}

/// Classification policy. The first matching rule wins; no match means fatal.
pub const CLASSIFICATION_RULES: &[(Matcher, ErrorClass)] = &[
    (Matcher::Status(404), ErrorClass::Transient),
    (Matcher::Code("NOT_FOUND"), ErrorClass::Transient),
    (Matcher::MessageContains("ssh key not found"), ErrorClass::Transient),
    (Matcher::MessageContains("not found"), ErrorClass::Transient),
    (Matcher::MessageContains("not yet available"), ErrorClass::Transient),
    (Matcher::Code("JOB_FAILED"), ErrorClass::Domain),
    (Matcher::Code("RESOURCE_ERROR"), ErrorClass::Domain),
];

impl Matcher {
    fn matches(&self, status: Option<u16>, code: Option<&str>, message: &str) -> bool {
        match *self {
            Matcher::Status(s) => status == Some(s),
            Matcher::Code(c) => code.is_some_and(|code| code.eq_ignore_ascii_case(c)),
            Matcher::MessageContains(needle) => message.to_lowercase().contains(needle),
        }
    }
}

/// Classify a decoded backend failure.
pub fn classify(status: Option<u16>, code: Option<&str>, message: &str) -> ErrorClass {
    CLASSIFICATION_RULES
        .iter()
        .find(|(matcher, _)| matcher.matches(status, code, message))
        .map(|(_, class)| *class)
        .unwrap_or(ErrorClass::Fatal)
}
