use std::collections::HashSet;
use std::rc::Rc;

use tokio::task::JoinSet;
use tracing::Instrument;

use crate::engine::{Engine, UnitId};
use crate::error::{LoaderError, Stage};
use crate::hooks::{LoadInfo, Metadata, Request};
use crate::unit::UnitStatus;

/// Where a new unit enters the pipeline.
#[derive(Debug, Clone)]
pub(crate) enum Entry {
    Locate,
    /// Skip `locate`, the address is known.
    Fetch { address: String },
    /// Skip `locate` and `fetch`, the source is known.
    Translate {
        address: Option<String>,
        source: String,
    },
}

/// What a request resolved to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Resolved {
    /// Already in the registry.
    Linked(String),
    /// Loading or loaded, in the pending store.
    Pending(UnitId),
}

enum Progress {
    Loaded,
    Abandoned,
}

impl<A: Clone + 'static> Engine<A> {
    /// Resolves a dependency request issued by a unit.
    pub(crate) async fn resolve(
        self: &Rc<Self>,
        request: Request,
    ) -> Result<Resolved, LoaderError> {
        self.resolve_with(request, Entry::Locate, Metadata::new()).await
    }

    /// Normalizes `request` and returns the registry entry or pending unit
    /// under the canonical name. Otherwise creates a unit, starts its
    /// pipeline at `entry` and returns it.
    pub(crate) async fn resolve_with(
        self: &Rc<Self>,
        request: Request,
        entry: Entry,
        metadata: Metadata,
    ) -> Result<Resolved, LoaderError> {
        let raw = request.request.clone();
        let name = self
            .hooks
            .normalize(request)
            .await
            .map_err(|e| LoaderError::hook(Stage::Normalize, Some(&raw), e))?;

        let id = {
            let mut state = self.state.borrow_mut();

            if state.registry.contains(&name) {
                return Ok(Resolved::Linked(name));
            }

            if let Some(&id) = state.pending.get(&name) {
                debug_assert!(
                    state.units.get(&id).is_some_and(|unit| matches!(
                        unit.status,
                        UnitStatus::Loading | UnitStatus::Loaded
                    )),
                    "pending unit '{name}' is neither loading nor loaded"
                );
                return Ok(Resolved::Pending(id));
            }

            tracing::debug!(request = %raw, name = %name, "new unit");
            state.create_unit(Some(name), metadata)
        };

        self.spawn_pipeline(id, entry);
        Ok(Resolved::Pending(id))
    }

    /// Runs the pipeline of `id` on the local task set.
    ///
    /// The stages run in a task of their own, so a panicking hook fails the
    /// unit instead of leaving it loading forever.
    pub(crate) fn spawn_pipeline(self: &Rc<Self>, id: UnitId, entry: Entry) {
        let name = self.label(id);
        let span = tracing::debug_span!("unit", name = %name);
        let engine = Rc::clone(self);

        tokio::task::spawn_local(
            async move {
                let driver = tokio::task::spawn_local({
                    let engine = Rc::clone(&engine);
                    async move { engine.drive(id, entry).await }.in_current_span()
                });

                let progress = match driver.await {
                    Ok(progress) => progress,
                    Err(e) if e.is_panic() => {
                        Err(LoaderError::panicked(Some(name.as_str()), e.into_panic()))
                    }
                    Err(_) => Err(LoaderError::Abandoned(name)),
                };

                match progress {
                    Ok(Progress::Loaded) => engine.unit_loaded(id),
                    Ok(Progress::Abandoned) => engine.unit_abandoned(id),
                    Err(error) => engine.unit_failed(id, error),
                }
            }
            .instrument(span),
        );
    }

    async fn drive(self: &Rc<Self>, id: UnitId, entry: Entry) -> Result<Progress, LoaderError> {
        let (address, source) = match entry {
            Entry::Locate => (None, None),
            Entry::Fetch { address } => (Some(address), None),
            Entry::Translate { address, source } => (address, Some(source)),
        };

        let Some(load) = self.checkpoint(id, address.as_ref()) else {
            return Ok(Progress::Abandoned);
        };

        let source = match source {
            Some(source) => source,
            None => {
                let address = match load.address.clone() {
                    Some(address) => address,
                    None => {
                        tracing::debug!("locate");
                        self.hooks
                            .locate(load)
                            .await
                            .map_err(|e| self.fail(id, Stage::Locate, e))?
                    }
                };

                let Some(load) = self.checkpoint(id, Some(&address)) else {
                    return Ok(Progress::Abandoned);
                };
                tracing::debug!(address = %address, "fetch");
                self.hooks
                    .fetch(load)
                    .await
                    .map_err(|e| self.fail(id, Stage::Fetch, e))?
            }
        };

        let Some(load) = self.checkpoint(id, None) else {
            return Ok(Progress::Abandoned);
        };
        tracing::debug!("translate");
        let source = self
            .hooks
            .translate(load, source)
            .await
            .map_err(|e| self.fail(id, Stage::Translate, e))?;

        let Some(load) = self.checkpoint(id, None) else {
            return Ok(Progress::Abandoned);
        };
        if let Some(unit) = self.state.borrow_mut().units.get_mut(&id) {
            unit.source = Some(source.clone());
        }
        tracing::debug!("instantiate");
        let instantiation = self
            .hooks
            .instantiate(load, source)
            .await
            .map_err(|e| self.fail(id, Stage::Instantiate, e))?;

        if self.state.borrow().is_abandoned(id) {
            return Ok(Progress::Abandoned);
        }

        let Some(instantiation) = instantiation else {
            let name = self.label(id);
            return Err(LoaderError::contract(
                Stage::Instantiate,
                Some(&name),
                "declarative resolution is not supported, instantiate must return an executor",
            ));
        };

        let requests = instantiation.dependencies.clone();
        if let Some(unit) = self.state.borrow_mut().units.get_mut(&id) {
            unit.deps_list = instantiation.dependencies;
            unit.executor = Some(instantiation.executor);
        }

        self.expand(id, requests).await?;
        Ok(Progress::Loaded)
    }

    /// Hook input for the next stage, or `None` if the unit was abandoned
    /// while the previous stage was running.
    fn checkpoint(&self, id: UnitId, address: Option<&String>) -> Option<LoadInfo> {
        let mut state = self.state.borrow_mut();
        if state.is_abandoned(id) {
            tracing::debug!("unit abandoned, skipping remaining stages");
            return None;
        }

        let unit = state.units.get_mut(&id)?;
        if let Some(address) = address {
            unit.address = Some(address.clone());
        }

        Some(LoadInfo {
            name: unit.name.clone(),
            metadata: unit.metadata.clone(),
            address: unit.address.clone(),
        })
    }

    fn fail(&self, id: UnitId, stage: Stage, err: anyhow::Error) -> LoaderError {
        LoaderError::hook(stage, Some(&self.label(id)), err)
    }

    /// Resolves every dependency request of `id` and attaches the resulting
    /// units to the link sets of `id`. Fails with the first failed request.
    async fn expand(self: &Rc<Self>, id: UnitId, requests: Vec<String>) -> Result<(), LoaderError> {
        let (referer_name, referer_address) = {
            let state = self.state.borrow();
            match state.units.get(&id) {
                Some(unit) => (unit.name.clone(), unit.address.clone()),
                None => return Ok(()),
            }
        };

        let mut seen = HashSet::new();
        let mut resolutions = JoinSet::new();

        for request in requests {
            if !seen.insert(request.clone()) {
                continue;
            }

            let engine = Rc::clone(self);
            let request = Request {
                request,
                referer_name: referer_name.clone(),
                referer_address: referer_address.clone(),
            };

            resolutions.spawn_local(
                async move {
                    let raw = request.request.clone();
                    let resolved = engine.resolve(request).await?;
                    engine.add_dependency(id, raw, resolved);
                    Ok::<_, LoaderError>(())
                }
                .in_current_span(),
            );
        }

        while let Some(joined) = resolutions.join_next().await {
            let result = match joined {
                Ok(result) => result,
                Err(e) if e.is_panic() => {
                    Err(LoaderError::panicked(referer_name.as_deref(), e.into_panic()))
                }
                Err(_) => Err(LoaderError::Abandoned(self.label(id))),
            };

            if let Err(error) = result {
                // The remaining resolutions only normalize and register
                // units; let them finish on their own.
                resolutions.detach_all();
                return Err(error);
            }
        }

        Ok(())
    }

    /// Records `request -> name` on `parent` and grows every link set of
    /// `parent` by the dependency.
    ///
    /// A dependency that resolves after `parent` was abandoned is dropped
    /// too, unless some link set already holds it.
    fn add_dependency(&self, parent: UnitId, request: String, resolved: Resolved) {
        let mut state = self.state.borrow_mut();

        if state.is_abandoned(parent) {
            if let Resolved::Pending(dependency) = resolved
                && state
                    .units
                    .get(&dependency)
                    .is_some_and(|unit| unit.link_sets.is_empty())
            {
                tracing::debug!(request = %request, "parent abandoned, dropping dependency");
                state.forget(dependency);
                state.release(dependency);
            }
            return;
        }

        let (name, dependency) = match resolved {
            Resolved::Linked(name) => (name, None),
            Resolved::Pending(dependency) => {
                let Some(name) = state.units.get(&dependency).and_then(|unit| unit.name.clone())
                else {
                    return;
                };
                (name, Some(dependency))
            }
        };

        let Some(unit) = state.units.get_mut(&parent) else {
            return;
        };

        unit.dependencies.insert(request, name);
        let link_sets = unit.link_sets.clone();
        if let Some(dependency) = dependency
            && state
                .units
                .get(&dependency)
                .is_some_and(|unit| unit.status != UnitStatus::Linked)
        {
            for link_set in link_sets {
                state.add_to_link_set(link_set, dependency);
            }
        }
    }

    /// Marks `id` loaded and counts it off in each of its link sets.
    fn unit_loaded(self: &Rc<Self>, id: UnitId) {
        let link_sets = {
            let mut state = self.state.borrow_mut();
            let Some(unit) = state.units.get_mut(&id) else {
                return;
            };
            debug_assert_eq!(unit.status, UnitStatus::Loading);
            unit.status = UnitStatus::Loaded;
            unit.link_sets.clone()
        };

        tracing::debug!("loaded");

        for link_set in link_sets {
            self.link_set_loaded(link_set);
        }

        self.state.borrow_mut().release(id);
    }

    /// Fails `id` and every link set containing it.
    pub(crate) fn unit_failed(self: &Rc<Self>, id: UnitId, error: LoaderError) {
        let link_sets = {
            let mut state = self.state.borrow_mut();
            state.forget(id);
            let Some(unit) = state.units.get_mut(&id) else {
                return;
            };
            unit.status = UnitStatus::Failed;
            unit.failure = Some(error.clone());
            std::mem::take(&mut unit.link_sets)
        };

        tracing::warn!(%error, "unit failed");

        for link_set in link_sets {
            self.link_set_failed(link_set, error.clone());
        }

        self.state.borrow_mut().release(id);
    }

    fn unit_abandoned(&self, id: UnitId) {
        let mut state = self.state.borrow_mut();
        if state.is_abandoned(id) {
            state.units.remove(&id);
        }
    }
}
