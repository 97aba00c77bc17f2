use std::collections::HashMap;

/// Finalized canonical name -> artifact bindings.
///
/// The linker only ever inserts a name that is absent; overwriting and
/// removal are reserved for explicit caller operations.
pub(crate) struct Registry<A> {
    entries: HashMap<String, A>,
}

impl<A> Default for Registry<A> {
    fn default() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }
}

impl<A: Clone> Registry<A> {
    pub(crate) fn get(&self, name: &str) -> Option<A> {
        self.entries.get(name).cloned()
    }

    pub(crate) fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    pub(crate) fn insert(&mut self, name: String, artifact: A) -> Option<A> {
        self.entries.insert(name, artifact)
    }

    pub(crate) fn remove(&mut self, name: &str) -> Option<A> {
        self.entries.remove(name)
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }
}
