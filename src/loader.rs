use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use crate::config::LoaderConfig;
use crate::deferred::{Deferred, Shared};
use crate::engine::{Diagnostics, Engine, Entry, settle};
use crate::error::{LoaderError, label};
use crate::hooks::{Hooks, Metadata};
use crate::unit::Unit;

/// Per-request options for [`Loader::define`], [`Loader::load`],
/// [`Loader::import`] and [`Loader::module`].
#[derive(Debug, Clone, Default)]
pub struct LoadOptions {
    /// A known address. `load` and `import` then skip `locate` for a new
    /// unit; `define` and `module` pass it on to `translate` and
    /// `instantiate`.
    pub address: Option<String>,
    /// Initial metadata of a new unit.
    pub metadata: Option<Metadata>,
}

impl LoadOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn address(mut self, address: impl Into<String>) -> Self {
        self.address = Some(address.into());
        self
    }

    pub fn metadata(mut self, metadata: impl Into<Metadata>) -> Self {
        self.metadata = Some(metadata.into());
        self
    }
}

/// A loader session: one registry, one pending-unit store and one set of
/// hooks.
///
/// Cloning a `Loader` yields another handle to the same session. A `Loader`
/// is not `Send`; every method that starts work spawns local tasks and so
/// must be called from within a [`tokio::task::LocalSet`].
pub struct Loader<A: 'static> {
    engine: Rc<Engine<A>>,
    /// In-flight top-level requests, keyed by the raw request.
    requests: Rc<RefCell<HashMap<String, Shared<Unit<A>>>>>,
}

impl<A: 'static> Clone for Loader<A> {
    fn clone(&self) -> Self {
        Self {
            engine: Rc::clone(&self.engine),
            requests: Rc::clone(&self.requests),
        }
    }
}

impl<A: Clone + 'static> Loader<A> {
    pub fn new(hooks: impl Hooks<A> + 'static) -> Self {
        Self::with_config(hooks, LoaderConfig::default())
    }

    pub fn with_config(hooks: impl Hooks<A> + 'static, config: LoaderConfig) -> Self {
        Self {
            engine: Engine::new(Box::new(hooks), config),
            requests: Rc::default(),
        }
    }

    pub fn config(&self) -> &LoaderConfig {
        &self.engine.config
    }

    /// Registers `name` with a known source, starting its pipeline at
    /// `translate`. The name is taken as canonical and is not normalized.
    ///
    /// Fails right away if `name` is already being requested or loaded, or
    /// is already in the registry.
    pub fn define(
        &self,
        name: impl Into<String>,
        source: impl Into<String>,
        options: LoadOptions,
    ) -> Deferred<()> {
        let name = name.into();

        {
            let state = self.engine.state.borrow();
            if self.requests.borrow().contains_key(&name) || state.pending.contains_key(&name) {
                return Deferred::ready(Err(LoaderError::AlreadyLoading(name)));
            }
            if state.registry.contains(&name) {
                return Deferred::ready(Err(LoaderError::AlreadyLinked(name)));
            }
        }

        let LoadOptions { address, metadata } = options;
        let entry = Entry::Translate {
            address,
            source: source.into(),
        };

        let outcome = self
            .engine
            .start(Some(name.clone()), metadata.unwrap_or_default(), entry);

        let shared = self.track(&name);
        let waiter = shared.wait();
        let requests = Rc::clone(&self.requests);

        tokio::task::spawn_local(async move {
            let result = settle(outcome, name.clone()).await;
            requests.borrow_mut().remove(&name);
            shared.settle(result);
        });

        waiter.and_then(|_| Ok(()))
    }

    /// Requests a unit and resolves once it is linked.
    ///
    /// A request that is already in the registry settles immediately. A
    /// request issued again before the first one settled shares its result,
    /// so every hook runs at most once per name.
    pub fn load(&self, request: &str, options: LoadOptions) -> Deferred<Unit<A>> {
        if let Some(artifact) = self.engine.state.borrow().registry.get(request) {
            return Deferred::ready(Ok(Unit::linked(Some(request.to_string()), artifact)));
        }

        if let Some(shared) = self.requests.borrow().get(request) {
            tracing::debug!(request, "joining in-flight request");
            return shared.wait();
        }

        let shared = self.track(request);
        let waiter = shared.wait();

        let LoadOptions { address, metadata } = options;
        let entry = match address {
            Some(address) => Entry::Fetch { address },
            None => Entry::Locate,
        };

        let engine = Rc::clone(&self.engine);
        let requests = Rc::clone(&self.requests);
        let request = request.to_string();

        tokio::task::spawn_local(async move {
            let result = engine
                .request(&request, entry, metadata.unwrap_or_default())
                .await;
            requests.borrow_mut().remove(&request);
            shared.settle(result);
        });

        waiter
    }

    /// Like [`Loader::load`], but resolves to the linked artifact.
    pub fn import(&self, name: &str, options: LoadOptions) -> Deferred<A> {
        self.load(name, options).and_then(Unit::into_artifact)
    }

    /// Links an anonymous unit from `source`. The result never enters the
    /// registry.
    pub fn module(&self, source: impl Into<String>, options: LoadOptions) -> Deferred<A> {
        let LoadOptions { address, metadata } = options;
        let entry = Entry::Translate {
            address,
            source: source.into(),
        };

        let outcome = self.engine.start(None, metadata.unwrap_or_default(), entry);

        Deferred::new(async move {
            settle(outcome, label(None).to_string())
                .await?
                .into_artifact()
        })
    }

    pub fn get(&self, name: &str) -> Option<A> {
        self.engine.state.borrow().registry.get(name)
    }

    pub fn has(&self, name: &str) -> bool {
        self.engine.state.borrow().registry.contains(name)
    }

    /// Puts an artifact into the registry, replacing any previous one.
    pub fn set(&self, name: impl Into<String>, artifact: A) {
        self.engine
            .state
            .borrow_mut()
            .registry
            .insert(name.into(), artifact);
    }

    /// Removes `name` from the registry. Returns whether it was there.
    pub fn delete(&self, name: &str) -> bool {
        self.engine
            .state
            .borrow_mut()
            .registry
            .remove(name)
            .is_some()
    }

    pub fn entries(&self) -> Result<Vec<(String, A)>, LoaderError> {
        Err(LoaderError::NotImplemented("Registry iteration"))
    }

    pub fn keys(&self) -> Result<Vec<String>, LoaderError> {
        Err(LoaderError::NotImplemented("Registry iteration"))
    }

    pub fn values(&self) -> Result<Vec<A>, LoaderError> {
        Err(LoaderError::NotImplemented("Registry iteration"))
    }

    pub fn eval(&self, _source: &str) -> Result<A, LoaderError> {
        Err(LoaderError::NotImplemented("Eval"))
    }

    /// Snapshot of the units and link sets still in flight.
    pub fn diagnostics(&self) -> Diagnostics {
        self.engine.diagnostics()
    }

    fn track(&self, request: &str) -> Shared<Unit<A>> {
        let shared = Shared::new(request);
        self.requests
            .borrow_mut()
            .insert(request.to_string(), shared.clone());
        shared
    }
}
