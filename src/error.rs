use std::path::PathBuf;

use miette::Diagnostic;
use thiserror::Error;

#[derive(Debug, Error, Diagnostic)]
pub enum EodmsError {
    #[error("invalid option `{option}`: {message} (accepted: {accepted})")]
    #[diagnostic(code(eodms::validation))]
    Validation {
        option: String,
        message: String,
        accepted: String,
    },

    #[error("unrecognized EODMS collection: {0}")]
    #[diagnostic(help(
        "use one of RCMImageProducts, Radarsat1, Radarsat2, PlanetScope, NAPL (or RCM, RS1, RS2, PLANET)"
    ))]
    InvalidCollection(String),

    #[error("invalid identifier: {0}")]
    InvalidId(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("EODMS rejected the credentials: {0}")]
    #[diagnostic(code(eodms::auth))]
    Auth(String),

    #[error("EODMS request failed after {attempts} attempt(s): {message}")]
    #[diagnostic(code(eodms::transient))]
    TransientService { attempts: usize, message: String },

    #[error("EODMS returned status {status}: {message}")]
    Status { status: u16, message: String },

    #[error("EODMS request failed: {0}")]
    Network(String),

    #[error("unexpected EODMS response: {0}")]
    Decode(String),

    #[error("invalid geometry: {0}")]
    Geometry(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("missing credentials: {0}")]
    MissingCredentials(String),

    #[error("failed to read config file at {0}")]
    ConfigRead(PathBuf),

    #[error("failed to parse JSON config: {0}")]
    ConfigParse(String),

    #[error("filesystem error: {0}")]
    Filesystem(String),
}

impl EodmsError {
    pub fn validation(option: &str, message: impl Into<String>, accepted: &[&str]) -> Self {
        EodmsError::Validation {
            option: option.to_string(),
            message: message.into(),
            accepted: if accepted.is_empty() {
                "none".to_string()
            } else {
                accepted.join(", ")
            },
        }
    }

    /// Failures worth re-issuing the same request for.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            EodmsError::Network(_) | EodmsError::TransientService { .. }
        )
    }

    pub fn is_auth(&self) -> bool {
        matches!(self, EodmsError::Auth(_))
    }
}
