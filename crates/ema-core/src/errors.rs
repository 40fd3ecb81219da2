/// Missing or invalid configuration discovered at construction time.
#[derive(Clone, Debug, thiserror::Error)]
#[error("configuration error: {0}")]
pub struct ConfigurationError(pub String);

/// Rejected input at the worker boundary. This is the only error the
/// worker surfaces to callers; everything downstream reports through
/// the event stream.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum InputValidationError {
    #[error("inputs must not be empty")]
    Empty,
    #[error("unsupported input content kind: {0}")]
    UnsupportedKind(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn configuration_error_display() {
        let err = ConfigurationError("system prompt is empty".into());
        assert_eq!(err.to_string(), "configuration error: system prompt is empty");
    }

    #[test]
    fn input_validation_display() {
        assert_eq!(
            InputValidationError::Empty.to_string(),
            "inputs must not be empty"
        );
        assert_eq!(
            InputValidationError::UnsupportedKind("image".into()).to_string(),
            "unsupported input content kind: image"
        );
    }
}
