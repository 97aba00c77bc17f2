//! The resolution and linking engine.
//!
//! Units and link sets live in two arenas inside [`State`] and refer to each
//! other only by id. All state is owned by one [`Engine`] and is mutated from
//! the single `LocalSet` the engine runs on; a `RefCell` borrow is never held
//! across an `.await` or while user code (hooks, executors) runs.
//!
//! ## Flow
//!
//! 1. [`Engine::resolve`] normalizes a request and returns the registered
//!    artifact, the unit already pending under that name, or a fresh unit
//!    whose pipeline is spawned right away.
//! 2. The pipeline (`pipeline.rs`) drives the unit through locate, fetch,
//!    translate and instantiate, then resolves every dependency request and
//!    attaches the dependency units to the link sets of their parent.
//! 3. Once the unit is loaded, each of its link sets (`linkset.rs`) counts it
//!    off; a link set with no loading members is handed to the linker.
//! 4. The linker (`linker.rs`) executes members dependencies-first and
//!    moves them into the registry.

mod diagnostics;
mod linker;
mod linkset;
mod pipeline;
mod registry;

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use tokio::sync::oneshot;

pub use crate::engine::diagnostics::{Diagnostics, UnitReport};
pub(crate) use crate::engine::pipeline::{Entry, Resolved};
pub(crate) use crate::engine::registry::Registry;

use crate::config::LoaderConfig;
use crate::error::{LoaderError, label};
use crate::hooks::{Executor, Hooks, Metadata, Request};
use crate::unit::{Unit, UnitStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub(crate) struct UnitId(u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub(crate) struct LinkSetId(u64);

/// Receiving end of a link set's outcome.
pub(crate) type Outcome<A> = oneshot::Receiver<Result<Unit<A>, LoaderError>>;

pub(crate) struct UnitRecord<A> {
    pub name: Option<String>,
    pub status: UnitStatus,
    pub metadata: Metadata,
    pub address: Option<String>,
    pub source: Option<String>,
    /// Raw request -> canonical name.
    pub dependencies: HashMap<String, String>,
    /// Raw requests in executor argument order.
    pub deps_list: Vec<String>,
    pub executor: Option<Executor<A>>,
    pub link_sets: Vec<LinkSetId>,
    pub failure: Option<LoaderError>,
}

impl<A> UnitRecord<A> {
    fn new(name: Option<String>, metadata: Metadata) -> Self {
        Self {
            name,
            status: UnitStatus::Loading,
            metadata,
            address: None,
            source: None,
            dependencies: HashMap::new(),
            deps_list: Vec::new(),
            executor: None,
            link_sets: Vec::new(),
            failure: None,
        }
    }

    pub(crate) fn label(&self) -> &str {
        label(self.name.as_deref())
    }

    /// Canonical names of the dependencies resolved so far, in argument order.
    pub(crate) fn dependency_names(&self) -> impl Iterator<Item = &str> {
        self.deps_list
            .iter()
            .filter_map(|request| self.dependencies.get(request))
            .map(String::as_str)
    }
}

pub(crate) struct LinkSet<A> {
    /// The unit this link set was created for.
    pub origin: UnitId,
    pub origin_name: Option<String>,
    /// Members in the order they joined.
    pub members: Vec<UnitId>,
    /// Number of members still loading.
    pub loading: usize,
    /// Artifact of the origin, if this link set was the one to link it.
    pub linked: Option<A>,
    pub outcome: Option<oneshot::Sender<Result<Unit<A>, LoaderError>>>,
}

pub(crate) struct State<A> {
    pub registry: Registry<A>,
    /// Pending-unit store: units that are not in the registry yet.
    pub pending: HashMap<String, UnitId>,
    pub units: HashMap<UnitId, UnitRecord<A>>,
    pub link_sets: HashMap<LinkSetId, LinkSet<A>>,
    next_id: u64,
}

impl<A> Default for State<A> {
    fn default() -> Self {
        Self {
            registry: Registry::default(),
            pending: HashMap::new(),
            units: HashMap::new(),
            link_sets: HashMap::new(),
            next_id: 0,
        }
    }
}

impl<A> State<A> {
    fn next_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    /// Creates a loading unit; named units are added to the pending store.
    pub(crate) fn create_unit(&mut self, name: Option<String>, metadata: Metadata) -> UnitId {
        let id = UnitId(self.next_id());
        if let Some(name) = &name {
            self.pending.insert(name.clone(), id);
        }
        self.units.insert(id, UnitRecord::new(name, metadata));
        id
    }

    pub(crate) fn create_link_set_id(&mut self) -> LinkSetId {
        LinkSetId(self.next_id())
    }

    pub(crate) fn is_pending(&self, id: UnitId) -> bool {
        self.units
            .get(&id)
            .and_then(|unit| unit.name.as_ref())
            .is_some_and(|name| self.pending.get(name) == Some(&id))
    }

    /// Removes `id` from the pending store, if it is registered there.
    pub(crate) fn forget(&mut self, id: UnitId) {
        if self.is_pending(id)
            && let Some(name) = self.units.get(&id).and_then(|unit| unit.name.as_ref())
        {
            self.pending.remove(name);
        }
    }

    /// A unit nobody can reach anymore: failed, or detached from every link
    /// set and from the pending store. Its pipeline skips remaining stages.
    pub(crate) fn is_abandoned(&self, id: UnitId) -> bool {
        match self.units.get(&id) {
            None => true,
            Some(unit) => {
                unit.status == UnitStatus::Failed
                    || (unit.link_sets.is_empty() && !self.is_pending(id))
            }
        }
    }

    /// Drops a unit from the arena once its pipeline is done and nothing
    /// refers to it.
    pub(crate) fn release(&mut self, id: UnitId) {
        let idle = self.units.get(&id).is_some_and(|unit| {
            unit.status != UnitStatus::Loading && unit.link_sets.is_empty()
        });

        if idle && !self.is_pending(id) {
            self.units.remove(&id);
        }
    }
}

pub(crate) struct Engine<A: 'static> {
    pub(crate) hooks: Box<dyn Hooks<A>>,
    pub(crate) config: LoaderConfig,
    pub(crate) state: RefCell<State<A>>,
}

impl<A: Clone + 'static> Engine<A> {
    pub(crate) fn new(hooks: Box<dyn Hooks<A>>, config: LoaderConfig) -> Rc<Self> {
        Rc::new(Self {
            hooks,
            config,
            state: RefCell::new(State::default()),
        })
    }

    /// Starts a unit that does not go through `normalize`, wrapped in its
    /// own link set.
    ///
    /// Must be called from within a `LocalSet`.
    pub(crate) fn start(
        self: &Rc<Self>,
        name: Option<String>,
        metadata: Metadata,
        entry: Entry,
    ) -> Outcome<A> {
        let id = self.state.borrow_mut().create_unit(name, metadata);
        let outcome = self.link_set_for(id);
        self.spawn_pipeline(id, entry);
        outcome
    }

    /// Resolves a top-level request and waits until it is linked.
    pub(crate) async fn request(
        self: &Rc<Self>,
        request: &str,
        entry: Entry,
        metadata: Metadata,
    ) -> Result<Unit<A>, LoaderError> {
        let request = Request {
            request: request.to_string(),
            referer_name: None,
            referer_address: None,
        };

        match self.resolve_with(request, entry, metadata).await? {
            Resolved::Linked(name) => {
                let artifact = self.state.borrow().registry.get(&name);
                match artifact {
                    Some(artifact) => Ok(Unit::linked(Some(name), artifact)),
                    None => Err(LoaderError::NotLinked(name)),
                }
            }
            Resolved::Pending(id) => {
                let name = self.label(id);
                let outcome = self.link_set_for(id);
                settle(outcome, name).await
            }
        }
    }

    pub(crate) fn label(&self, id: UnitId) -> String {
        let state = self.state.borrow();
        let name = state.units.get(&id).and_then(|unit| unit.name.as_deref());
        label(name).to_string()
    }
}

/// Waits for a link set's outcome.
pub(crate) async fn settle<A>(outcome: Outcome<A>, name: String) -> Result<Unit<A>, LoaderError> {
    outcome
        .await
        .unwrap_or_else(|_| Err(LoaderError::Abandoned(name)))
}
