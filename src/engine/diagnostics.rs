use std::fmt::{Display, Formatter};

use crate::engine::{Engine, State};
use crate::unit::UnitStatus;

/// A snapshot of the loader's internal state.
///
/// Returned by [`Loader::diagnostics`](crate::Loader::diagnostics). Units
/// show up here while they are loading, waiting to be linked, or failed but
/// still referenced; linked units only show up as a registry count.
#[derive(Debug, Clone, Default)]
pub struct Diagnostics {
    /// Units still tracked by the engine, sorted by name.
    pub units: Vec<UnitReport>,
    /// Link sets that have not settled yet.
    pub link_sets: usize,
    /// Entries in the registry.
    pub registered: usize,
}

#[derive(Debug, Clone)]
pub struct UnitReport {
    pub name: Option<String>,
    pub status: UnitStatus,
    pub address: Option<String>,
    /// Length of the translated source, once known.
    pub source_bytes: Option<usize>,
    /// Number of link sets the unit belongs to.
    pub link_sets: usize,
    pub failure: Option<String>,
}

impl Diagnostics {
    /// True when no unit is in flight.
    pub fn is_idle(&self) -> bool {
        self.units.is_empty() && self.link_sets == 0
    }
}

impl Display for Diagnostics {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        writeln!(
            f,
            "{} registered, {} in flight, {} link sets",
            self.registered,
            self.units.len(),
            self.link_sets
        )?;

        for unit in &self.units {
            write!(
                f,
                "  {:<24} {:<8}",
                unit.name.as_deref().unwrap_or("<anonymous>"),
                unit.status
            )?;
            if let Some(address) = &unit.address {
                write!(f, " @ {address}")?;
            }
            if let Some(bytes) = unit.source_bytes {
                write!(f, " ({bytes} B)")?;
            }
            if let Some(failure) = &unit.failure {
                write!(f, " : {}", failure.lines().next().unwrap_or_default())?;
            }
            writeln!(f)?;
        }

        Ok(())
    }
}

impl<A> State<A> {
    fn diagnostics(&self) -> Diagnostics
    where
        A: Clone,
    {
        let mut units: Vec<UnitReport> = self
            .units
            .values()
            .map(|unit| UnitReport {
                name: unit.name.clone(),
                status: unit.status,
                address: unit.address.clone(),
                source_bytes: unit.source.as_ref().map(String::len),
                link_sets: unit.link_sets.len(),
                failure: unit.failure.as_ref().map(ToString::to_string),
            })
            .collect();

        units.sort_by(|a, b| a.name.cmp(&b.name));

        Diagnostics {
            units,
            link_sets: self.link_sets.len(),
            registered: self.registry.len(),
        }
    }
}

impl<A: Clone + 'static> Engine<A> {
    pub(crate) fn diagnostics(&self) -> Diagnostics {
        self.state.borrow().diagnostics()
    }
}
