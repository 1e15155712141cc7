use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Failure modes surfaced by a drive run.
///
/// `SessionCreation`, `SessionNotFound` and `Capture` come out of session
/// bootstrap and are always fatal. `Protocol` and `Prediction` come out of
/// the prediction client; whether they abort the run depends on when they
/// happen. `MalformedAction` is raised by action translation and is the one
/// error the control loop swallows.
#[derive(Debug, Error, Clone, Serialize, Deserialize)]
pub enum DriveError {
    #[error("session creation failed: {0}")]
    SessionCreation(String),
    #[error("session not found: {0}")]
    SessionNotFound(String),
    #[error("screen capture failed: {0}")]
    Capture(String),
    #[error("continuation request missing {0}")]
    Protocol(String),
    #[error("prediction failed: {0}")]
    Prediction(String),
    #[error("malformed {kind} action: {detail}")]
    MalformedAction { kind: String, detail: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_context() {
        let err = DriveError::SessionNotFound("box-42".into());
        assert_eq!(err.to_string(), "session not found: box-42");

        let err = DriveError::MalformedAction {
            kind: "click".into(),
            detail: "click requires both x and y".into(),
        };
        assert_eq!(
            err.to_string(),
            "malformed click action: click requires both x and y"
        );
    }

    #[test]
    fn round_trips_through_serde() {
        let err = DriveError::Prediction("service returned 500".into());
        let json = serde_json::to_string(&err).unwrap();
        let back: DriveError = serde_json::from_str(&json).unwrap();
        assert_eq!(back.to_string(), err.to_string());
    }
}
