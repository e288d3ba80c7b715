//! Error handling for the signalling core

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("SIP error: {0}")]
    Sip(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Authentication required")]
    Unauthenticated,

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Domain not serviced: {0}")]
    DomainNotServiced(String),

    #[error("Not found")]
    NotFound,

    #[error("Overloaded: {0}")]
    Overloaded(String),

    #[error("Interval too brief, minimum is {min_expires}s")]
    IntervalTooBrief { min_expires: u32 },

    #[error("Method not allowed: {0}")]
    MethodNotAllowed(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Dialplan error: {0}")]
    Dialplan(String),

    #[error("Store error: {0}")]
    Store(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    pub fn network<S: Into<String>>(msg: S) -> Self {
        Self::Network(msg.into())
    }

    pub fn protocol<S: Into<String>>(msg: S) -> Self {
        Self::Protocol(msg.into())
    }

    pub fn sip<S: Into<String>>(msg: S) -> Self {
        Self::Sip(msg.into())
    }

    pub fn bad_request<S: Into<String>>(msg: S) -> Self {
        Self::BadRequest(msg.into())
    }

    pub fn forbidden<S: Into<String>>(msg: S) -> Self {
        Self::Forbidden(msg.into())
    }

    pub fn overloaded<S: Into<String>>(msg: S) -> Self {
        Self::Overloaded(msg.into())
    }

    pub fn timeout<S: Into<String>>(msg: S) -> Self {
        Self::Timeout(msg.into())
    }

    pub fn invalid_state<S: Into<String>>(msg: S) -> Self {
        Self::InvalidState(msg.into())
    }

    pub fn parse<S: Into<String>>(msg: S) -> Self {
        Self::Parse(msg.into())
    }

    pub fn dialplan<S: Into<String>>(msg: S) -> Self {
        Self::Dialplan(msg.into())
    }

    pub fn store<S: Into<String>>(msg: S) -> Self {
        Self::Store(msg.into())
    }

    pub fn internal<S: Into<String>>(msg: S) -> Self {
        Self::Internal(msg.into())
    }

    /// The final SIP status this error maps to.
    pub fn sip_status(&self) -> (u16, &'static str) {
        match self {
            Error::BadRequest(_) | Error::Parse(_) => (400, "Bad Request"),
            Error::Unauthenticated => (401, "Unauthorized"),
            Error::Forbidden(_) | Error::DomainNotServiced(_) => (403, "Forbidden"),
            Error::NotFound => (404, "Not Found"),
            Error::MethodNotAllowed(_) => (405, "Method Not Allowed"),
            Error::IntervalTooBrief { .. } => (423, "Interval Too Brief"),
            Error::Overloaded(_) => (480, "Temporarily Unavailable"),
            _ => (500, "Server Internal Error"),
        }
    }
}
