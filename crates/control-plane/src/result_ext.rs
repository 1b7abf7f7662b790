//! Logging helpers for results that are handled but worth reporting.
//!
//! Background tasks (the run worker, the staleness sweep, the status
//! publisher) cannot return their errors to anyone, so they log them with
//! the caller location and carry on.

use std::fmt::Display;

/// Extension trait for logging errors with context.
pub trait ResultExt<T, E> {
    /// Log the error at `error` level and return the result unchanged.
    ///
    /// ```ignore
    /// use funnelflow_control_plane::result_ext::ResultExt;
    ///
    /// let result: Result<i32, &str> = Err("connection refused");
    /// let _ = result.log("publishing run status");
    /// ```
    fn log<S: ToString>(self, context: S) -> Result<T, E>;

    /// Log the error at `warn` level and drop it.
    fn warn_ok<S: ToString>(self, context: S) -> Option<T>;
}

impl<T, E: Display> ResultExt<T, E> for Result<T, E> {
    #[track_caller]
    fn log<S: ToString>(self, context: S) -> Result<T, E> {
        if let Err(ref e) = self {
            let caller_location = std::panic::Location::caller();
            tracing::error!(
                target: "funnelflow_control_plane",
                error = %e,
                file = %format!("{}:{}", caller_location.file(), caller_location.line()),
                context = %context.to_string(),
                "Operation failed"
            );
        }
        self
    }

    #[track_caller]
    fn warn_ok<S: ToString>(self, context: S) -> Option<T> {
        match self {
            Ok(value) => Some(value),
            Err(e) => {
                let caller_location = std::panic::Location::caller();
                tracing::warn!(
                    target: "funnelflow_control_plane",
                    error = %e,
                    file = %format!("{}:{}", caller_location.file(), caller_location.line()),
                    context = %context.to_string(),
                    "Ignoring failed operation"
                );
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_result_ext_ok() {
        let result: Result<i32, &str> = Ok(42);
        let logged = result.log("test context");
        assert_eq!(logged.unwrap(), 42);
    }

    #[test]
    fn test_result_ext_err() {
        let result: Result<i32, &str> = Err("test error");
        let logged = result.log("test context");
        assert!(logged.is_err());
    }

    #[test]
    fn test_warn_ok() {
        let ok: Result<i32, &str> = Ok(1);
        assert_eq!(ok.warn_ok("ctx"), Some(1));
        let err: Result<i32, &str> = Err("nope");
        assert_eq!(err.warn_ok("ctx"), None);
    }
}
