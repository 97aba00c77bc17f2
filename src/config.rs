use serde::{Deserialize, Serialize};

/// How the linker treats a group of units that depend on each other.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CyclePolicy {
    /// Link the cycle with late-bound imports. Members run in the order they
    /// joined their link set; an import of a member that has not run yet is
    /// empty until that member finishes. A member that fails after reading
    /// such an empty import makes the whole cycle fail with
    /// [`LoaderError::CircularDependency`](crate::LoaderError::CircularDependency).
    #[default]
    LateBind,
    /// Fail every cycle with
    /// [`LoaderError::CircularDependency`](crate::LoaderError::CircularDependency).
    Reject,
}

/// Engine configuration.
///
/// Every field has a default, so a partial JSON object is enough:
///
/// ```rust
/// use tsunagi::{CyclePolicy, LoaderConfig};
///
/// let config: LoaderConfig = serde_json::from_str(r#"{ "cycles": "reject" }"#).unwrap();
/// assert_eq!(config.cycles, CyclePolicy::Reject);
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoaderConfig {
    /// Cycle handling in the linker.
    pub cycles: CyclePolicy,
}

impl LoaderConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_cycles(mut self, cycles: CyclePolicy) -> Self {
        self.cycles = cycles;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config: LoaderConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config, LoaderConfig::default());
        assert_eq!(config.cycles, CyclePolicy::LateBind);
    }

    #[test]
    fn test_config_json() {
        let config = LoaderConfig::new().with_cycles(CyclePolicy::Reject);
        let json = serde_json::to_string(&config).unwrap();
        assert_eq!(json, r#"{"cycles":"reject"}"#);

        let back: LoaderConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back, config);
    }

    #[test]
    fn test_unknown_policy() {
        let result = serde_json::from_str::<LoaderConfig>(r#"{ "cycles": "ignore" }"#);
        assert!(result.is_err());
    }
}
