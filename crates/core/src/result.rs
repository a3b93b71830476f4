//! Result type definition and extension traits.
//!
//! Small combinators used where the core logs or converts failures inline.

use crate::error::Error;

/// The standard Result type for settle operations.
///
/// ```ignore
/// fn wait(machine: &StateMachine<Door>) -> Result<()> {
///     machine.block_until_goal_reached(Some(Duration::from_secs(1))).await?;
///     Ok(())
/// }
/// ```
pub type Result<T> = std::result::Result<T, Error>;

/// Extension trait for Results.
pub trait ResultExt<T> {
    /// Inspect the error without consuming the Result.
    fn inspect_error<F: FnOnce(&Error)>(self, f: F) -> Self;
}

impl<T> ResultExt<T> for Result<T> {
    fn inspect_error<F: FnOnce(&Error)>(self, f: F) -> Self {
        if let Err(ref e) = self {
            f(e);
        }
        self
    }
}

/// Extension trait for Option types.
pub trait OptionExt<T> {
    /// Convert to a Result, building the `IllegalRequest` reason lazily.
    fn ok_or_illegal<F: FnOnce() -> String>(self, reason: F) -> Result<T>;
}

impl<T> OptionExt<T> for Option<T> {
    fn ok_or_illegal<F: FnOnce() -> String>(self, reason: F) -> Result<T> {
        self.ok_or_else(|| Error::illegal_request(reason()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_result_inspect_error() {
        let result: Result<i32> = Err(Error::illegal_request("test"));
        let mut called = false;
        let _ = result.inspect_error(|e| {
            called = e.is_illegal_request();
        });
        assert!(called);
    }

    #[test]
    fn test_inspect_error_skips_ok() {
        let result: Result<i32> = Ok(1);
        let mut called = false;
        assert_eq!(result.inspect_error(|_| called = true).ok(), Some(1));
        assert!(!called);
    }

    #[test]
    fn test_ok_or_illegal() {
        let missing: Option<u32> = None;
        let err = missing.ok_or_illegal(|| "nothing running".to_string());
        assert!(matches!(err, Err(Error::IllegalRequest { .. })));

        assert_eq!(Some(3).ok_or_illegal(String::new).ok(), Some(3));
    }
}
