//! Engine error taxonomy.
//!
//! Every failure the engine can surface has one tagged variant here.
//! Validation errors are collected before any side effect occurs; resource
//! errors roll back what was already acquired; runtime errors are surfaced
//! in the session result. User-callback failures travel as `String` causes.

use thiserror::Error;

/// Errors produced by session validation, resource setup, and the run itself.
#[derive(Error, Debug, Clone)]
pub enum EngineError {
    // === Domain validation (caught at session start) ===
    #[error("Scenario name cannot be empty")]
    EmptyScenarioName,

    #[error("Duplicate scenario names: {names:?}")]
    DuplicateScenarioName { names: Vec<String> },

    #[error("Scenario '{scenario}' has no steps and no init or clean hook")]
    EmptySteps { scenario: String },

    #[error("Scenario '{scenario}' contains a step with an empty name")]
    EmptyStepName { scenario: String },

    #[error("Scenario '{scenario}' declares connection pool '{pool}' more than once")]
    DuplicateConnectionPoolName { scenario: String, pool: String },

    #[error("Scenario '{scenario}' has no load simulations")]
    EmptyLoadSimulations { scenario: String },

    #[error("Scenario '{scenario}': load simulation '{simulation}' must have a positive duration")]
    InvalidDuration { scenario: String, simulation: String },

    // === Resource (caught at session init) ===
    #[error("Connection pool '{pool}' failed to open connection {index}: {cause}")]
    PoolOpenFailed {
        pool: String,
        index: usize,
        cause: String,
    },

    #[error("Scenario '{scenario}' init hook failed: {cause}")]
    InitFailed { scenario: String, cause: String },

    // === Runtime (observed during the run) ===
    #[error("Warm-up found too many failed steps: ok {ok}, failed {fail}")]
    WarmUpErrorWithManyFailedSteps { ok: u64, fail: u64 },

    #[error("Stop test requested: {reason}")]
    StopTestRequested { reason: String },

    #[error("Scenario '{scenario}' scheduler aborted unexpectedly: {cause}")]
    SchedulerAborted { scenario: String, cause: String },

    // === External configuration ===
    #[error("Failed to parse config '{path}': {cause}")]
    ConfigParseFailed { path: String, cause: String },

    #[error("Unsupported config format: '{ext}'. Only JSON configs are supported")]
    UnsupportedConfigFormat { ext: String },

    #[error("Multiple validation errors: {0}")]
    Multiple(String),
}

impl EngineError {
    /// Fold a collection of validation errors into a single error.
    ///
    /// One error is returned as-is so callers can match on the concrete
    /// variant; several are joined into [`EngineError::Multiple`].
    pub fn from_many(mut errors: Vec<EngineError>) -> Option<EngineError> {
        match errors.len() {
            0 => None,
            1 => Some(errors.remove(0)),
            _ => {
                let joined = errors
                    .iter()
                    .map(|e| e.to_string())
                    .collect::<Vec<_>>()
                    .join("; ");
                Some(EngineError::Multiple(joined))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_many_empty_is_none() {
        assert!(EngineError::from_many(Vec::new()).is_none());
    }

    #[test]
    fn test_from_many_single_keeps_variant() {
        let errs = vec![EngineError::EmptyScenarioName];
        match EngineError::from_many(errs) {
            Some(EngineError::EmptyScenarioName) => {}
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_from_many_joins_messages() {
        let errs = vec![
            EngineError::EmptyScenarioName,
            EngineError::EmptySteps {
                scenario: "checkout".into(),
            },
        ];
        match EngineError::from_many(errs) {
            Some(EngineError::Multiple(msg)) => {
                assert!(msg.contains("Scenario name cannot be empty"));
                assert!(msg.contains("checkout"));
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_duplicate_scenario_name_lists_all_names() {
        let err = EngineError::DuplicateScenarioName {
            names: vec!["a".into(), "b".into()],
        };
        let msg = err.to_string();
        assert!(msg.contains("a"));
        assert!(msg.contains("b"));
    }
}
