//! Result alias and logging combinators.

use crate::error::Error;

/// The standard Result type for stagehand core operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Extension trait for results whose failure is tolerable.
///
/// Best-effort paths (event delivery, telemetry, reporters) must never abort
/// a run; these combinators log the failure and move on.
pub trait ResultExt<T> {
    /// Convert a Result to an Option, logging the error at warn level.
    fn into_option_logged(self, what: &str) -> Option<T>;

    /// Get the value or a default, logging the error at warn level.
    fn or_default_logged(self, what: &str, default: T) -> T;
}

impl<T, E: std::fmt::Display> ResultExt<T> for std::result::Result<T, E> {
    fn into_option_logged(self, what: &str) -> Option<T> {
        match self {
            Ok(value) => Some(value),
            Err(e) => {
                tracing::warn!(operation = what, error = %e, "Operation failed");
                None
            }
        }
    }

    fn or_default_logged(self, what: &str, default: T) -> T {
        match self {
            Ok(value) => value,
            Err(e) => {
                tracing::warn!(operation = what, error = %e, "Operation failed, using default");
                default
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn should_keep_ok_value_when_converting_to_option() {
        let result: Result<i32> = Ok(42);
        assert_eq!(result.into_option_logged("answer"), Some(42));
    }

    #[test]
    fn should_drop_error_when_converting_to_option() {
        let result: Result<i32> = Err(Error::invalid_config("bad"));
        assert_eq!(result.into_option_logged("answer"), None);
    }

    #[test]
    fn should_fall_back_to_default_on_error() {
        let result: std::result::Result<i32, String> = Err("boom".to_string());
        assert_eq!(result.or_default_logged("answer", 7), 7);
    }
}
