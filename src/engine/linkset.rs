use std::rc::Rc;

use tokio::sync::oneshot;

use crate::engine::linker::LinkFailure;
use crate::engine::{Engine, LinkSet, LinkSetId, Outcome, State, UnitId};
use crate::error::{LoaderError, label};
use crate::unit::{Unit, UnitStatus};

impl<A: Clone> State<A> {
    /// Adds `id` and every pending unit it depends on, transitively, to the
    /// link set. Units that are already members are skipped.
    pub(crate) fn add_to_link_set(&mut self, ls: LinkSetId, id: UnitId) {
        let mut queue = vec![id];

        while let Some(id) = queue.pop() {
            let Some(link_set) = self.link_sets.get_mut(&ls) else {
                return;
            };
            if link_set.members.contains(&id) {
                continue;
            }
            let Some(unit) = self.units.get_mut(&id) else {
                continue;
            };
            if unit.status.is_terminal() {
                continue;
            }

            link_set.members.push(id);
            unit.link_sets.push(ls);
            if unit.status == UnitStatus::Loading {
                link_set.loading += 1;
            }

            let dependencies: Vec<String> = unit.dependency_names().map(str::to_owned).collect();
            for name in dependencies.iter().rev() {
                if self.registry.contains(name) {
                    continue;
                }
                if let Some(&dependency) = self.pending.get(name) {
                    queue.push(dependency);
                }
            }
        }
    }
}

impl<A: Clone + 'static> Engine<A> {
    /// Creates a link set for `id` and returns the receiver of its outcome.
    ///
    /// If every member has already loaded, the link set is linked before this
    /// returns.
    pub(crate) fn link_set_for(self: &Rc<Self>, id: UnitId) -> Outcome<A> {
        let (sender, receiver) = oneshot::channel();

        let (ls, ready) = {
            let mut state = self.state.borrow_mut();
            let ls = state.create_link_set_id();
            let origin_name = state.units.get(&id).and_then(|unit| unit.name.clone());

            state.link_sets.insert(
                ls,
                LinkSet {
                    origin: id,
                    origin_name: origin_name.clone(),
                    members: Vec::new(),
                    loading: 0,
                    linked: None,
                    outcome: Some(sender),
                },
            );
            state.add_to_link_set(ls, id);
            tracing::debug!(origin = %label(origin_name.as_deref()), "link set created");

            let ready = state.link_sets.get(&ls).is_some_and(|ls| ls.loading == 0);
            (ls, ready)
        };

        if ready {
            self.link_set_ready(ls);
        }

        receiver
    }

    /// Counts off one loaded member.
    pub(crate) fn link_set_loaded(self: &Rc<Self>, ls: LinkSetId) {
        let ready = {
            let mut state = self.state.borrow_mut();
            let Some(link_set) = state.link_sets.get_mut(&ls) else {
                return;
            };
            link_set.loading = link_set.loading.saturating_sub(1);
            link_set.loading == 0
        };

        if ready {
            self.link_set_ready(ls);
        }
    }

    fn link_set_ready(self: &Rc<Self>, ls: LinkSetId) {
        match self.link(ls) {
            Ok(()) => self.link_set_settled(ls),
            Err(LinkFailure { units, error }) => {
                for id in units {
                    self.unit_failed(id, error.clone());
                }

                // The culprits were members, so this only matters if the
                // failure hit none of them.
                if self.state.borrow().link_sets.contains_key(&ls) {
                    self.link_set_failed(ls, error);
                }
            }
        }
    }

    /// Rejects the link set and detaches it from its members. Members left
    /// without a link set are dropped from the pending store.
    pub(crate) fn link_set_failed(&self, ls: LinkSetId, error: LoaderError) {
        let outcome = {
            let mut state = self.state.borrow_mut();
            let Some(mut link_set) = state.link_sets.remove(&ls) else {
                return;
            };

            for id in link_set.members.drain(..) {
                let Some(unit) = state.units.get_mut(&id) else {
                    continue;
                };
                unit.link_sets.retain(|&other| other != ls);

                if unit.link_sets.is_empty() {
                    state.forget(id);
                    state.release(id);
                }
            }

            link_set.outcome.take()
        };

        tracing::warn!(%error, "link set failed");
        if let Some(outcome) = outcome {
            let _ = outcome.send(Err(error));
        }
    }

    fn link_set_settled(&self, ls: LinkSetId) {
        let (outcome, result) = {
            let mut state = self.state.borrow_mut();
            let Some(mut link_set) = state.link_sets.remove(&ls) else {
                return;
            };
            debug_assert!(link_set.members.is_empty(), "linked link set has members left");

            let artifact = link_set.linked.take().or_else(|| {
                link_set
                    .origin_name
                    .as_deref()
                    .and_then(|name| state.registry.get(name))
            });

            let result = match artifact {
                Some(artifact) => Ok(Unit::linked(link_set.origin_name, artifact)),
                None => Err(LoaderError::NotLinked(
                    label(link_set.origin_name.as_deref()).to_string(),
                )),
            };

            (link_set.outcome.take(), result)
        };

        if let Some(outcome) = outcome {
            let _ = outcome.send(result);
        }
    }
}
