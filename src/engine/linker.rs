use std::cell::{Cell, OnceCell};
use std::collections::HashMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::rc::Rc;

use petgraph::algo::tarjan_scc;
use petgraph::graph::{DiGraph, NodeIndex};

use crate::config::CyclePolicy;
use crate::engine::{Engine, LinkSetId, State, UnitId};
use crate::error::{LoaderError, Stage, label};
use crate::hooks::{Executor, Import};
use crate::unit::UnitStatus;

/// Why a link set could not be linked, and which units are to blame.
#[derive(Debug)]
pub(crate) struct LinkFailure {
    pub units: Vec<UnitId>,
    pub error: LoaderError,
}

impl LinkFailure {
    fn new(units: Vec<UnitId>, error: LoaderError) -> Self {
        Self { units, error }
    }
}

/// A strongly connected component of the link set, members in the order
/// they joined the link set.
#[derive(Debug)]
struct Component {
    members: Vec<UnitId>,
    cyclic: bool,
}

/// An executor taken out of its unit, ready to run.
struct Prepared<A> {
    id: UnitId,
    name: Option<String>,
    executor: Executor<A>,
    imports: Vec<Import<A>>,
    /// Filled with this unit's artifact once it ran.
    slot: Rc<OnceCell<A>>,
    /// Set when the executor read an import that was still empty.
    touched: Rc<Cell<bool>>,
}

impl<A: Clone + 'static> Engine<A> {
    /// Executes every member of the link set, dependencies first, and moves
    /// them into the registry one component at a time.
    ///
    /// Components that linked before a failure stay linked.
    pub(crate) fn link(&self, ls: LinkSetId) -> Result<(), LinkFailure> {
        let components = {
            let state = self.state.borrow();
            plan(&state, ls, self.config.cycles)?
        };

        for component in components {
            self.link_component(&component)?;
        }

        Ok(())
    }

    fn link_component(&self, component: &Component) -> Result<(), LinkFailure> {
        let prepared = {
            let mut state = self.state.borrow_mut();
            prepare(&mut state, component)?
        };

        // No borrow is held while executors run.
        let mut linked = Vec::with_capacity(prepared.len());
        for unit in prepared {
            let Prepared {
                id,
                name,
                executor,
                imports,
                slot,
                touched,
            } = unit;

            let error = match catch_unwind(AssertUnwindSafe(move || executor(imports))) {
                Ok(Ok(artifact)) => {
                    let _ = slot.set(artifact.clone());
                    linked.push((id, name, artifact));
                    continue;
                }
                Ok(Err(_)) if component.cyclic && touched.get() => {
                    LoaderError::CircularDependency {
                        members: self.names(&component.members),
                    }
                }
                Ok(Err(e)) => LoaderError::hook(Stage::Execute, name.as_deref(), e),
                Err(payload) => LoaderError::panicked(name.as_deref(), payload),
            };

            let culprits = if component.cyclic {
                component.members.clone()
            } else {
                vec![id]
            };
            return Err(LinkFailure::new(culprits, error));
        }

        let mut state = self.state.borrow_mut();

        let taken = linked
            .iter()
            .filter_map(|(_, name, _)| name.as_deref())
            .find(|name| state.registry.contains(name));
        if let Some(name) = taken {
            return Err(LinkFailure::new(
                component.members.clone(),
                LoaderError::AlreadyLinked(name.to_string()),
            ));
        }

        for (id, name, artifact) in linked {
            commit(&mut state, id, name, artifact);
        }

        Ok(())
    }

    fn names(&self, ids: &[UnitId]) -> Vec<String> {
        let state = self.state.borrow();
        ids.iter()
            .filter_map(|id| state.units.get(id))
            .map(|unit| unit.label().to_string())
            .collect()
    }
}

/// Orders the members of a link set into components, dependencies first.
fn plan<A: Clone>(
    state: &State<A>,
    ls: LinkSetId,
    policy: CyclePolicy,
) -> Result<Vec<Component>, LinkFailure> {
    let Some(link_set) = state.link_sets.get(&ls) else {
        return Ok(Vec::new());
    };

    // Edges point from a unit to its dependencies, so tarjan_scc yields
    // dependencies before their dependents.
    let mut graph = DiGraph::<UnitId, ()>::with_capacity(link_set.members.len(), 0);
    let nodes: HashMap<UnitId, NodeIndex> = link_set
        .members
        .iter()
        .map(|&id| (id, graph.add_node(id)))
        .collect();

    for &id in &link_set.members {
        let Some(unit) = state.units.get(&id) else {
            continue;
        };

        for request in &unit.deps_list {
            let Some(name) = unit.dependencies.get(request) else {
                return Err(LinkFailure::new(
                    vec![id],
                    LoaderError::contract(
                        Stage::Execute,
                        unit.name.as_deref(),
                        format!("dependency '{request}' was never resolved"),
                    ),
                ));
            };
            if state.registry.contains(name) {
                continue;
            }

            match state.pending.get(name).and_then(|dep| nodes.get(dep)) {
                Some(&target) => {
                    graph.update_edge(nodes[&id], target, ());
                }
                None => {
                    return Err(LinkFailure::new(
                        vec![id],
                        LoaderError::UnresolvedDependency {
                            unit: unit.label().to_string(),
                            dependency: name.clone(),
                        },
                    ));
                }
            }
        }
    }

    let mut components = Vec::new();
    for mut scc in tarjan_scc(&graph) {
        scc.sort();
        let cyclic = scc.len() > 1 || graph.contains_edge(scc[0], scc[0]);
        let members: Vec<UnitId> = scc.into_iter().map(|index| graph[index]).collect();

        if cyclic && policy == CyclePolicy::Reject {
            let names = members
                .iter()
                .filter_map(|id| state.units.get(id))
                .map(|unit| unit.label().to_string())
                .collect();
            return Err(LinkFailure::new(
                members,
                LoaderError::CircularDependency { members: names },
            ));
        }

        components.push(Component { members, cyclic });
    }

    Ok(components)
}

/// Takes the executors of a component and wires up their imports.
///
/// Imports of registered units are filled right away. Imports of units in
/// the same component share that unit's slot, so a member that runs early
/// sees the artifact of a later member once it has run.
fn prepare<A: Clone>(
    state: &mut State<A>,
    component: &Component,
) -> Result<Vec<Prepared<A>>, LinkFailure> {
    let slots: HashMap<String, Rc<OnceCell<A>>> = component
        .members
        .iter()
        .filter_map(|id| state.units.get(id)?.name.clone())
        .map(|name| (name, Rc::default()))
        .collect();

    let State {
        units, registry, ..
    } = state;

    let mut prepared = Vec::with_capacity(component.members.len());
    for &id in &component.members {
        let Some(unit) = units.get_mut(&id) else {
            continue;
        };

        let Some(executor) = unit.executor.take() else {
            return Err(LinkFailure::new(
                component.members.clone(),
                LoaderError::contract(
                    Stage::Execute,
                    unit.name.as_deref(),
                    "unit has no executor to run",
                ),
            ));
        };

        let touched = Rc::new(Cell::new(false));
        let imports = unit
            .deps_list
            .iter()
            .filter_map(|request| unit.dependencies.get(request))
            .map(|name| {
                let slot = match registry.get(name) {
                    Some(artifact) => Rc::new(OnceCell::from(artifact)),
                    None => slots.get(name).cloned().unwrap_or_default(),
                };
                Import::new(name.clone(), slot, Rc::clone(&touched))
            })
            .collect();

        let slot = unit
            .name
            .as_ref()
            .and_then(|name| slots.get(name).cloned())
            .unwrap_or_default();

        prepared.push(Prepared {
            id,
            name: unit.name.clone(),
            executor,
            imports,
            slot,
            touched,
        });
    }

    Ok(prepared)
}

/// Moves a unit that ran successfully into the registry and out of every
/// link set.
fn commit<A: Clone>(state: &mut State<A>, id: UnitId, name: Option<String>, artifact: A) {
    if let Some(name) = &name {
        state.registry.insert(name.clone(), artifact.clone());
    }
    state.forget(id);

    let link_sets = match state.units.get_mut(&id) {
        Some(unit) => {
            unit.status = UnitStatus::Linked;
            std::mem::take(&mut unit.link_sets)
        }
        None => return,
    };

    for ls in link_sets {
        if let Some(link_set) = state.link_sets.get_mut(&ls) {
            link_set.members.retain(|&member| member != id);
            if link_set.origin == id {
                link_set.linked = Some(artifact.clone());
            }
        }
    }

    state.release(id);
    tracing::info!(unit = label(name.as_deref()), "linked");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::LinkSet;
    use crate::hooks::Metadata;

    fn unit(state: &mut State<u32>, name: &str, dependencies: &[&str]) -> UnitId {
        let id = state.create_unit(Some(name.into()), Metadata::new());
        let unit = state.units.get_mut(&id).unwrap();
        unit.status = UnitStatus::Loaded;
        for dependency in dependencies {
            unit.deps_list.push(dependency.to_string());
            unit.dependencies
                .insert(dependency.to_string(), dependency.to_string());
        }
        id
    }

    fn link_set(state: &mut State<u32>, members: Vec<UnitId>) -> LinkSetId {
        let ls = state.create_link_set_id();
        state.link_sets.insert(
            ls,
            LinkSet {
                origin: members[0],
                origin_name: None,
                members,
                loading: 0,
                linked: None,
                outcome: None,
            },
        );
        ls
    }

    #[test]
    fn test_plan_orders_dependencies_first() {
        let mut state = State::default();
        state.registry.insert("std".into(), 0);
        let a = unit(&mut state, "a", &["b", "c", "std"]);
        let b = unit(&mut state, "b", &["c"]);
        let c = unit(&mut state, "c", &[]);
        let ls = link_set(&mut state, vec![a, b, c]);

        let components = plan(&state, ls, CyclePolicy::LateBind).unwrap();
        let order: Vec<_> = components.iter().map(|c| c.members.clone()).collect();

        assert_eq!(order, vec![vec![c], vec![b], vec![a]]);
        assert!(components.iter().all(|c| !c.cyclic));
    }

    #[test]
    fn test_plan_groups_cycles() {
        let mut state = State::default();
        let a = unit(&mut state, "a", &["b"]);
        let b = unit(&mut state, "b", &["a", "c"]);
        let c = unit(&mut state, "c", &["c"]);
        let ls = link_set(&mut state, vec![a, b, c]);

        let components = plan(&state, ls, CyclePolicy::LateBind).unwrap();

        assert_eq!(components.len(), 2);
        assert_eq!(components[0].members, vec![c]);
        assert!(components[0].cyclic);
        assert_eq!(components[1].members, vec![a, b]);
        assert!(components[1].cyclic);
    }

    #[test]
    fn test_plan_rejects_cycles() {
        let mut state = State::default();
        let a = unit(&mut state, "a", &["b"]);
        let b = unit(&mut state, "b", &["a"]);
        let ls = link_set(&mut state, vec![a, b]);

        let failure = plan(&state, ls, CyclePolicy::Reject).unwrap_err();

        assert_eq!(failure.units, vec![a, b]);
        assert!(matches!(
            failure.error,
            LoaderError::CircularDependency { members } if members == ["a", "b"]
        ));
    }

    #[test]
    fn test_plan_unresolved_dependency() {
        let mut state = State::default();
        let a = unit(&mut state, "a", &["gone"]);
        let ls = link_set(&mut state, vec![a]);

        let failure = plan(&state, ls, CyclePolicy::LateBind).unwrap_err();

        assert_eq!(failure.units, vec![a]);
        assert!(matches!(
            failure.error,
            LoaderError::UnresolvedDependency { unit, dependency }
                if unit == "a" && dependency == "gone"
        ));
    }

    #[test]
    fn test_plan_missing_mapping() {
        let mut state = State::default();
        let a = unit(&mut state, "a", &[]);
        state.units.get_mut(&a).unwrap().deps_list.push("./b".into());
        let ls = link_set(&mut state, vec![a]);

        let failure = plan(&state, ls, CyclePolicy::LateBind).unwrap_err();

        assert_eq!(failure.units, vec![a]);
        assert!(matches!(
            failure.error,
            LoaderError::Contract { stage: Stage::Execute, .. }
        ));
    }

    #[test]
    fn test_commit() {
        let mut state = State::default();
        let a = unit(&mut state, "a", &[]);
        let ls = link_set(&mut state, vec![a]);
        state.units.get_mut(&a).unwrap().link_sets.push(ls);

        commit(&mut state, a, Some("a".into()), 7);

        assert_eq!(state.registry.get("a"), Some(7));
        assert!(state.pending.is_empty());
        assert!(state.units.is_empty());
        assert!(state.link_sets[&ls].members.is_empty());
        assert_eq!(state.link_sets[&ls].linked, Some(7));
    }
}
