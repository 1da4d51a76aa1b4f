//! Limits enforced on loaded programs

/// Maximum size of executable code in memory
pub const MAX_EXECUTABLE_SIZE: u64 = 0xFFFF_F000;

/// A limit was exceeded
#[derive(Debug, thiserror::Error, PartialEq, Eq, Clone)]
#[error("limit {limit_name} exceeded - limit: {limit_value}, actual: {actual_value}")]
pub struct LimitExceededError {
    /// Name of the limit
    pub limit_name: &'static str,
    /// Value of the limit
    pub limit_value: u64,
    /// Value that exceeded it
    pub actual_value: u64,
}

impl LimitExceededError {
    /// Checks `actual_value` against `limit_value`
    pub fn check(
        limit_name: &'static str,
        limit_value: u64,
        actual_value: u64,
    ) -> Result<(), LimitExceededError> {
        if actual_value > limit_value {
            return Err(LimitExceededError {
                limit_name,
                limit_value,
                actual_value,
            });
        }
        Ok(())
    }
}
