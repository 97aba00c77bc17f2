use std::any::Any;
use std::borrow::Cow;
use std::fmt::{Display, Formatter};
use std::sync::Arc;

use thiserror::Error;

/// An error raised by a caller-supplied hook or executor.
///
/// The original `anyhow::Error` is kept behind an `Arc`, so a single failure
/// can be handed to every request waiting on the failed unit and still be
/// inspected with [`anyhow::Error::downcast_ref`].
#[derive(Debug, Clone)]
pub struct HookError(pub(crate) Arc<anyhow::Error>);

impl HookError {
    pub fn new(err: impl Into<anyhow::Error>) -> Self {
        Self(Arc::new(err.into()))
    }

    /// The error as it was returned by the hook.
    pub fn inner(&self) -> &anyhow::Error {
        &self.0
    }
}

impl Display for HookError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        Display::fmt(&*self.0, f)
    }
}

impl std::error::Error for HookError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.0.source()
    }
}

impl From<anyhow::Error> for HookError {
    fn from(e: anyhow::Error) -> Self {
        HookError(Arc::new(e))
    }
}

/// The pipeline stage in which a unit failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    Normalize,
    Locate,
    Fetch,
    Translate,
    Instantiate,
    /// Running the executor during linking.
    Execute,
}

impl Display for Stage {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Stage::Normalize => "normalize",
            Stage::Locate => "locate",
            Stage::Fetch => "fetch",
            Stage::Translate => "translate",
            Stage::Instantiate => "instantiate",
            Stage::Execute => "execute",
        })
    }
}

#[derive(Debug, Error, Clone)]
pub enum LoaderError {
    #[error("Hook '{stage}' failed for unit '{unit}':\n{source}")]
    Hook {
        stage: Stage,
        unit: String,
        #[source]
        source: HookError,
    },

    #[error("Unit '{unit}' broke the {stage} contract: {reason}")]
    Contract {
        stage: Stage,
        unit: String,
        reason: Cow<'static, str>,
    },

    #[error("Unit '{0}' is already loading")]
    AlreadyLoading(String),

    #[error("Unit '{0}' already exists in the registry")]
    AlreadyLinked(String),

    #[error("{0} is not implemented")]
    NotImplemented(&'static str),

    #[error("Circular dependency between {}", .members.join(", "))]
    CircularDependency { members: Vec<String> },

    #[error("Unit '{unit}' depends on '{dependency}', which is neither linked nor loading")]
    UnresolvedDependency { unit: String, dependency: String },

    #[error("Unit '{0}' is not linked")]
    NotLinked(String),

    #[error("Unit '{unit}' panicked: {message}")]
    Panicked { unit: String, message: String },

    #[error("Request for '{0}' was abandoned before it settled")]
    Abandoned(String),
}

impl LoaderError {
    pub(crate) fn hook(stage: Stage, unit: Option<&str>, err: anyhow::Error) -> Self {
        LoaderError::Hook {
            stage,
            unit: label(unit).to_string(),
            source: HookError::from(err),
        }
    }

    pub(crate) fn contract(
        stage: Stage,
        unit: Option<&str>,
        reason: impl Into<Cow<'static, str>>,
    ) -> Self {
        LoaderError::Contract {
            stage,
            unit: label(unit).to_string(),
            reason: reason.into(),
        }
    }

    pub(crate) fn panicked(unit: Option<&str>, payload: Box<dyn Any + Send>) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            s.to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            String::from("unknown payload")
        };

        LoaderError::Panicked {
            unit: label(unit).to_string(),
            message,
        }
    }

    /// The stage a hook failure happened in, if this is one.
    pub fn stage(&self) -> Option<Stage> {
        match self {
            LoaderError::Hook { stage, .. } | LoaderError::Contract { stage, .. } => Some(*stage),
            _ => None,
        }
    }
}

/// Display name of a possibly anonymous unit.
pub(crate) fn label(name: Option<&str>) -> &str {
    name.unwrap_or("<anonymous>")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hook_error_keeps_original() {
        #[derive(Debug, Error)]
        #[error("disk on fire")]
        struct Fire;

        let err = LoaderError::hook(Stage::Fetch, Some("a"), anyhow::Error::new(Fire));
        let LoaderError::Hook { stage, unit, source } = &err else {
            panic!("expected a hook error, got {err:?}");
        };

        assert_eq!(*stage, Stage::Fetch);
        assert_eq!(unit, "a");
        assert!(source.inner().downcast_ref::<Fire>().is_some());
        assert_eq!(err.to_string(), "Hook 'fetch' failed for unit 'a':\ndisk on fire");
    }

    #[test]
    fn anonymous_units_are_labelled() {
        let err = LoaderError::contract(Stage::Instantiate, None, "no executor");
        assert_eq!(
            err.to_string(),
            "Unit '<anonymous>' broke the instantiate contract: no executor"
        );
    }

    #[test]
    fn cycle_lists_members() {
        let err = LoaderError::CircularDependency {
            members: vec!["a".into(), "b".into()],
        };
        assert_eq!(err.to_string(), "Circular dependency between a, b");
    }

    #[test]
    fn panic_payloads() {
        let err = LoaderError::panicked(Some("a"), Box::new("boom"));
        assert_eq!(err.to_string(), "Unit 'a' panicked: boom");

        let err = LoaderError::panicked(Some("a"), Box::new(String::from("bang")));
        assert_eq!(err.to_string(), "Unit 'a' panicked: bang");

        let err = LoaderError::panicked(None, Box::new(7));
        assert_eq!(err.to_string(), "Unit '<anonymous>' panicked: unknown payload");
    }
}
