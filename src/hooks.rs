//! The pluggable side of the loader.
//!
//! A [`Loader`](crate::Loader) never decides on its own where a unit lives,
//! how its bytes are obtained or what they mean. Each of those questions is
//! answered by one method of [`Hooks`]:
//!
//! * `normalize` turns a raw request into a canonical name,
//! * `locate` maps a canonical name to an address,
//! * `fetch` reads the raw source from an address,
//! * `translate` transforms the raw source,
//! * `instantiate` reads the transformed source and returns the unit's
//!   dependency list together with its executor.
//!
//! Every hook returns a [`HookFuture`], so it can answer right away with
//! [`std::future::ready`] or suspend on real I/O.

use std::cell::{Cell, OnceCell, RefCell};
use std::fmt::Debug;
use std::future::{Future, ready};
use std::pin::Pin;
use std::rc::Rc;

use anyhow::anyhow;
use serde_json::{Map, Value};

/// Boxed local future returned by every hook.
pub type HookFuture<'a, T> = Pin<Box<dyn Future<Output = anyhow::Result<T>> + 'a>>;

/// The deferred body of a unit. It receives one [`Import`] per entry of the
/// dependency list, in the same order, and produces the unit's artifact.
pub type Executor<A> = Box<dyn FnOnce(Vec<Import<A>>) -> anyhow::Result<A>>;

/// Input of the `normalize` hook.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    /// The raw request, exactly as it appeared in a dependency list or was
    /// passed to the loader.
    pub request: String,
    /// Canonical name of the unit that issued the request.
    pub referer_name: Option<String>,
    /// Address of the unit that issued the request.
    pub referer_address: Option<String>,
}

/// What the loader knows about a unit when calling `locate`, `fetch`,
/// `translate` and `instantiate`.
#[derive(Debug, Clone)]
pub struct LoadInfo {
    /// Canonical name, absent for anonymous units.
    pub name: Option<String>,
    /// Metadata shared by all stages of this unit.
    pub metadata: Metadata,
    /// Address returned by `locate` (or given by the caller).
    pub address: Option<String>,
}

/// Opaque per-unit data, threaded through every stage of one unit.
///
/// This is a shared handle: a value inserted by `locate` is visible to
/// `fetch`, `translate` and `instantiate` of the same unit.
#[derive(Debug, Clone, Default)]
pub struct Metadata(Rc<RefCell<Map<String, Value>>>);

impl Metadata {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        self.0.borrow().get(key).cloned()
    }

    pub fn insert(&self, key: impl Into<String>, value: impl Into<Value>) -> Option<Value> {
        self.0.borrow_mut().insert(key.into(), value.into())
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.0.borrow().contains_key(key)
    }

    /// A copy of the current contents as a JSON object.
    pub fn to_json(&self) -> Value {
        Value::Object(self.0.borrow().clone())
    }
}

impl From<Map<String, Value>> for Metadata {
    fn from(map: Map<String, Value>) -> Self {
        Self(Rc::new(RefCell::new(map)))
    }
}

/// The result of the `instantiate` hook: the unit's raw dependency requests
/// and the executor that turns their artifacts into this unit's artifact.
pub struct Instantiation<A> {
    pub dependencies: Vec<String>,
    pub executor: Executor<A>,
}

impl<A> Instantiation<A> {
    pub fn new<I, S, F>(dependencies: I, executor: F) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
        F: FnOnce(Vec<Import<A>>) -> anyhow::Result<A> + 'static,
    {
        Self {
            dependencies: dependencies.into_iter().map(Into::into).collect(),
            executor: Box::new(executor),
        }
    }
}

impl<A> Debug for Instantiation<A> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Instantiation")
            .field("dependencies", &self.dependencies)
            .finish_non_exhaustive()
    }
}

/// One positional argument of an executor: the artifact of a dependency.
///
/// Outside of cycles the artifact is always present. Inside a cycle a member
/// may run before the dependency it imports; the import is then empty and is
/// filled as soon as that dependency has run. Executors that only hold on to
/// the import and read it later link fine; reading an empty import and
/// failing because of it marks the cycle as unresolvable.
pub struct Import<A> {
    name: String,
    slot: Rc<OnceCell<A>>,
    touched: Rc<Cell<bool>>,
}

impl<A> Clone for Import<A> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            slot: Rc::clone(&self.slot),
            touched: Rc::clone(&self.touched),
        }
    }
}

impl<A> Debug for Import<A> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Import")
            .field("name", &self.name)
            .field("ready", &self.is_ready())
            .finish()
    }
}

impl<A> Import<A> {
    pub(crate) fn new(name: String, slot: Rc<OnceCell<A>>, touched: Rc<Cell<bool>>) -> Self {
        Self {
            name,
            slot,
            touched,
        }
    }

    /// Canonical name of the imported unit.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_ready(&self) -> bool {
        self.slot.get().is_some()
    }
}

impl<A: Clone> Import<A> {
    /// The imported artifact, or `None` while a cyclic dependency has not
    /// run yet.
    pub fn get(&self) -> Option<A> {
        match self.slot.get() {
            Some(artifact) => Some(artifact.clone()),
            None => {
                self.touched.set(true);
                None
            }
        }
    }

    /// Like [`Import::get`], but an empty import is an error.
    pub fn require(&self) -> anyhow::Result<A> {
        self.get()
            .ok_or_else(|| anyhow!("import '{}' is not linked yet", self.name))
    }
}

/// The set of hooks driving a [`Loader`](crate::Loader).
///
/// All methods have defaults: `normalize` returns the request unchanged,
/// `locate` returns the unit name, `fetch` fails, `translate` returns the
/// source unchanged and `instantiate` returns nothing. A useful
/// implementation overrides at least `fetch` and `instantiate`.
///
/// ```rust
/// use std::future::ready;
/// use tsunagi::{HookFuture, Hooks, Instantiation, LoadInfo};
///
/// struct Numbers;
///
/// impl Hooks<u32> for Numbers {
///     fn fetch(&self, load: LoadInfo) -> HookFuture<'_, String> {
///         Box::pin(ready(Ok(load.address.unwrap_or_default())))
///     }
///
///     fn instantiate(
///         &self,
///         _: LoadInfo,
///         source: String,
///     ) -> HookFuture<'_, Option<Instantiation<u32>>> {
///         Box::pin(ready(Ok(Some(Instantiation::new(
///             Vec::<String>::new(),
///             move |_| Ok(source.len() as u32),
///         )))))
///     }
/// }
/// ```
pub trait Hooks<A: 'static> {
    fn normalize(&self, request: Request) -> HookFuture<'_, String> {
        Box::pin(ready(Ok(request.request)))
    }

    fn locate(&self, load: LoadInfo) -> HookFuture<'_, String> {
        Box::pin(ready(
            load.name
                .ok_or_else(|| anyhow!("anonymous units can't be located")),
        ))
    }

    fn fetch(&self, _load: LoadInfo) -> HookFuture<'_, String> {
        Box::pin(ready(Err(anyhow!("fetch is not implemented"))))
    }

    fn translate(&self, _load: LoadInfo, source: String) -> HookFuture<'_, String> {
        Box::pin(ready(Ok(source)))
    }

    /// Returning `None` asks for declarative resolution, which the loader
    /// does not support; the unit then fails with a contract error.
    fn instantiate(
        &self,
        _load: LoadInfo,
        _source: String,
    ) -> HookFuture<'_, Option<Instantiation<A>>> {
        Box::pin(ready(Ok(None)))
    }
}

impl<A: 'static, H: Hooks<A> + ?Sized> Hooks<A> for Rc<H> {
    fn normalize(&self, request: Request) -> HookFuture<'_, String> {
        (**self).normalize(request)
    }

    fn locate(&self, load: LoadInfo) -> HookFuture<'_, String> {
        (**self).locate(load)
    }

    fn fetch(&self, load: LoadInfo) -> HookFuture<'_, String> {
        (**self).fetch(load)
    }

    fn translate(&self, load: LoadInfo, source: String) -> HookFuture<'_, String> {
        (**self).translate(load, source)
    }

    fn instantiate(
        &self,
        load: LoadInfo,
        source: String,
    ) -> HookFuture<'_, Option<Instantiation<A>>> {
        (**self).instantiate(load, source)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn import(slot: OnceCell<u32>) -> (Import<u32>, Rc<Cell<bool>>) {
        let touched = Rc::new(Cell::new(false));
        let import = Import::new("dep".into(), Rc::new(slot), Rc::clone(&touched));
        (import, touched)
    }

    #[test]
    fn test_ready_import() {
        let (import, touched) = import(OnceCell::from(7));
        assert!(import.is_ready());
        assert_eq!(import.get(), Some(7));
        assert_eq!(import.require().unwrap(), 7);
        assert!(!touched.get());
    }

    #[test]
    fn test_empty_import_is_tracked() {
        let (import, touched) = import(OnceCell::new());
        assert!(!import.is_ready());
        assert!(!touched.get());

        let err = import.require().unwrap_err();
        assert_eq!(err.to_string(), "import 'dep' is not linked yet");
        assert!(touched.get());
    }

    #[test]
    fn test_late_binding() {
        let slot = Rc::new(OnceCell::new());
        let import = Import::new("dep".into(), Rc::clone(&slot), Rc::default());
        let held = import.clone();

        assert_eq!(held.get(), None);
        slot.set(3).unwrap();
        assert_eq!(held.get(), Some(3));
        assert_eq!(import.name(), "dep");
    }

    #[test]
    fn test_metadata_is_shared() {
        let metadata = Metadata::new();
        let other = metadata.clone();

        metadata.insert("format", "esm");
        assert_eq!(other.get("format"), Some(Value::from("esm")));
        assert!(other.contains_key("format"));
        assert_eq!(other.to_json(), serde_json::json!({ "format": "esm" }));
    }

    struct Defaults;
    impl Hooks<()> for Defaults {}

    #[tokio::test]
    async fn test_default_hooks() {
        let hooks = Defaults;
        let info = LoadInfo {
            name: Some("a".into()),
            metadata: Metadata::new(),
            address: None,
        };

        let request = Request {
            request: "./a".into(),
            referer_name: None,
            referer_address: None,
        };
        assert_eq!(hooks.normalize(request).await.unwrap(), "./a");
        assert_eq!(hooks.locate(info.clone()).await.unwrap(), "a");
        assert!(hooks.fetch(info.clone()).await.is_err());
        assert_eq!(hooks.translate(info.clone(), "src".into()).await.unwrap(), "src");
        assert!(hooks.instantiate(info.clone(), "src".into()).await.unwrap().is_none());

        let anonymous = LoadInfo { name: None, ..info };
        assert!(hooks.locate(anonymous).await.is_err());
    }
}
