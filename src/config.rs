/// Tuning knobs for the orchestration layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineConfig {
    /// How many times a decision is recomputed after losing a concurrent write on its request.
    pub max_conflict_retries: u32,
    /// How many times a single offer write is attempted before the call fails.
    pub max_write_attempts: u32,
}

impl EngineConfig {
    pub const DEFAULT_MAX_CONFLICT_RETRIES: u32 = 5;
    pub const DEFAULT_MAX_WRITE_ATTEMPTS: u32 = 3;

    pub fn new(max_conflict_retries: u32, max_write_attempts: u32) -> Self {
        Self {
            max_conflict_retries,
            // At least one attempt is always made.
            max_write_attempts: max_write_attempts.max(1),
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self::new(
            Self::DEFAULT_MAX_CONFLICT_RETRIES,
            Self::DEFAULT_MAX_WRITE_ATTEMPTS,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_attempts_floor() {
        let config = EngineConfig::new(0, 0);
        assert_eq!(config.max_conflict_retries, 0);
        assert_eq!(config.max_write_attempts, 1);
        assert_eq!(EngineConfig::default().max_write_attempts, 3);
    }
}
