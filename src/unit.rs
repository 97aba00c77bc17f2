use std::fmt::{Display, Formatter};

use crate::error::{LoaderError, label};

/// Lifecycle of a unit.
///
/// A unit only moves forward: `Loading -> Loaded -> Linked`, or to `Failed`
/// from `Loading` (pipeline failure) or `Loaded` (linking failure).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UnitStatus {
    /// Running through locate, fetch, translate and instantiate, or still
    /// resolving its dependency requests.
    Loading,
    /// Pipeline finished and every dependency request resolved; waiting for
    /// its link set to finish loading.
    Loaded,
    /// Executed; the artifact is final.
    Linked,
    Failed,
}

impl UnitStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, UnitStatus::Linked | UnitStatus::Failed)
    }
}

impl Display for UnitStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            UnitStatus::Loading => "loading",
            UnitStatus::Loaded => "loaded",
            UnitStatus::Linked => "linked",
            UnitStatus::Failed => "failed",
        })
    }
}

/// The outcome of a [`Loader::load`](crate::Loader::load) call.
#[derive(Debug, Clone)]
pub struct Unit<A> {
    name: Option<String>,
    status: UnitStatus,
    artifact: Option<A>,
}

impl<A> Unit<A> {
    pub(crate) fn linked(name: Option<String>, artifact: A) -> Self {
        Self {
            name,
            status: UnitStatus::Linked,
            artifact: Some(artifact),
        }
    }

    /// Canonical name, `None` for units created by
    /// [`Loader::module`](crate::Loader::module).
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn status(&self) -> UnitStatus {
        self.status
    }

    pub fn artifact(&self) -> Option<&A> {
        self.artifact.as_ref()
    }

    /// The artifact of a linked unit.
    pub fn into_artifact(self) -> Result<A, LoaderError> {
        match (self.status, self.artifact) {
            (UnitStatus::Linked, Some(artifact)) => Ok(artifact),
            _ => Err(LoaderError::NotLinked(label(self.name.as_deref()).to_string())),
        }
    }
}
