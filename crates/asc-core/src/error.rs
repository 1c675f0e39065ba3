//! Core domain errors.

use thiserror::Error;

/// A configuration could not be turned into a valid snapshot.
///
/// Always recoverable at runtime: the previous snapshot stays in effect.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    /// Config or env file could not be read.
    #[error("Failed to read {path}: {message}")]
    Read { path: String, message: String },

    /// File contents are not valid for the expected format.
    #[error("Failed to parse {path}: {message}")]
    Parse { path: String, message: String },

    /// No workers declared.
    #[error("No agents configured - at least one [agent.<name>] section is required")]
    NoWorkers,

    /// Two workers share a name.
    #[error("Duplicate agent name: {0}")]
    DuplicateWorker(String),

    /// A required field is missing or empty.
    #[error("Agent '{agent}': missing required field '{field}'")]
    MissingField { agent: String, field: String },

    /// The model tag is not one of the known models.
    #[error("Agent '{agent}': invalid model '{model}' (valid: {valid})")]
    InvalidModel {
        agent: String,
        model: String,
        valid: String,
    },

    /// A phase tag is not one of the known phases.
    #[error("Agent '{agent}': invalid phase '{phase}'{}", did_you_mean(.suggestion))]
    InvalidPhase {
        agent: String,
        phase: String,
        suggestion: Option<String>,
    },

    /// Any other validation failure.
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

fn did_you_mean(suggestion: &Option<String>) -> String {
    match suggestion {
        Some(s) => format!(" (did you mean '{s}'?)"),
        None => String::new(),
    }
}
