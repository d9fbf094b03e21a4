//! Process run mode.

use std::fmt;

use crate::env::{vars, EnvError, EnvSource, Environment};

/// Run mode selected by `APP_ENV`.
///
/// Production is the default and the only strict mode: anything that would
/// fall back to an insecure default elsewhere must fail instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RunMode {
    Development,
    Testing,
    #[default]
    Production,
}

impl RunMode {
    /// Parse from string.
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "development" | "dev" => Some(Self::Development),
            "testing" | "test" => Some(Self::Testing),
            "production" | "prod" => Some(Self::Production),
            _ => None,
        }
    }

    /// Resolve the mode from `APP_ENV`, defaulting to production.
    pub fn from_source<S: EnvSource + ?Sized>(source: &S) -> Result<Self, EnvError> {
        let env = Environment::new(source);
        Ok(env
            .get_parsed(vars::APP_ENV, |v| {
                Self::parse(v).ok_or_else(|| format!("unknown run mode {:?}", v))
            })?
            .unwrap_or_default())
    }

    /// Whether configuration must be validated strictly.
    pub fn is_strict(&self) -> bool {
        matches!(self, Self::Production)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Development => "development",
            Self::Testing => "testing",
            Self::Production => "production",
        }
    }
}

impl fmt::Display for RunMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::env::MapEnv;

    #[test]
    fn test_mode_parse() {
        assert_eq!(RunMode::parse("development"), Some(RunMode::Development));
        assert_eq!(RunMode::parse("DEV"), Some(RunMode::Development));
        assert_eq!(RunMode::parse("testing"), Some(RunMode::Testing));
        assert_eq!(RunMode::parse(" production "), Some(RunMode::Production));
        assert_eq!(RunMode::parse("staging"), None);
    }

    #[test]
    fn test_environment_mode_detection() {
        let unset = MapEnv::new();
        assert_eq!(RunMode::from_source(&unset).unwrap(), RunMode::Production);

        let dev = MapEnv::new().with(vars::APP_ENV, "development");
        assert_eq!(RunMode::from_source(&dev).unwrap(), RunMode::Development);

        let bogus = MapEnv::new().with(vars::APP_ENV, "staging");
        assert!(RunMode::from_source(&bogus).is_err());
    }

    #[test]
    fn test_only_production_is_strict() {
        assert!(RunMode::Production.is_strict());
        assert!(!RunMode::Development.is_strict());
        assert!(!RunMode::Testing.is_strict());
        assert_eq!(RunMode::Testing.to_string(), "testing");
    }
}
