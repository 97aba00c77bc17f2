//! Scripted in-memory hooks for tests.
//!
//! Sources are plain text, one directive per line:
//!
//! * `import <request>` declares a dependency,
//! * `require <request>` declares a dependency the executor reads right away,
//! * `fail <message>` makes the executor return an error,
//! * `panic <message>` makes the executor panic,
//! * `declarative` anywhere makes `instantiate` return nothing,
//! * anything else becomes the body of the resulting [`Module`].

use std::cell::RefCell;
use std::collections::HashMap;
use std::future::Future;
use std::rc::Rc;

use anyhow::{anyhow, bail};
use serde_json::Value;
use tokio::sync::Notify;

use crate::error::{Stage, label};
use crate::hooks::{HookFuture, Hooks, Import, Instantiation, LoadInfo, Request};
use crate::loader::Loader;

pub(crate) type Artifact = Rc<Module>;

#[derive(Debug)]
pub(crate) struct Module {
    pub name: Option<String>,
    pub body: String,
    pub metadata: Value,
    pub imports: Vec<Import<Artifact>>,
}

impl Module {
    /// Artifact of the import at `index`, if it is linked.
    pub fn import(&self, index: usize) -> Option<Artifact> {
        self.imports.get(index)?.get()
    }
}

const SCHEME: &str = "mem://";

#[derive(Default)]
pub(crate) struct TestHooks {
    sources: RefCell<HashMap<String, String>>,
    failures: RefCell<HashMap<(String, Stage), String>>,
    calls: RefCell<HashMap<(Stage, String), usize>>,
    gates: RefCell<HashMap<String, Rc<Notify>>>,
}

impl TestHooks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(self, name: &str, source: &str) -> Self {
        self.sources
            .borrow_mut()
            .insert(name.to_string(), source.to_string());
        self
    }

    /// Makes `stage` fail for the unit `name` (the raw request for
    /// `normalize`).
    pub fn failing(self, name: &str, stage: Stage, message: &str) -> Self {
        self.failures
            .borrow_mut()
            .insert((name.to_string(), stage), message.to_string());
        self
    }

    /// Holds `normalize` of the raw request `request` until [`Self::open`].
    pub fn gated(self, request: &str) -> Self {
        self.gates
            .borrow_mut()
            .insert(request.to_string(), Rc::new(Notify::new()));
        self
    }

    pub fn open(&self, request: &str) {
        let gate = self.gates.borrow_mut().remove(request);
        if let Some(gate) = gate {
            gate.notify_one();
        }
    }

    /// Number of times `stage` ran for `name`.
    pub fn calls(&self, stage: Stage, name: &str) -> usize {
        self.calls
            .borrow()
            .get(&(stage, name.to_string()))
            .copied()
            .unwrap_or_default()
    }

    pub fn loader(self) -> (Loader<Artifact>, Rc<Self>) {
        let hooks = Rc::new(self);
        (Loader::new(Rc::clone(&hooks)), hooks)
    }

    /// Counts the call, yields once and applies an injected failure.
    async fn enter(&self, stage: Stage, name: &str) -> anyhow::Result<()> {
        *self
            .calls
            .borrow_mut()
            .entry((stage, name.to_string()))
            .or_default() += 1;

        tokio::task::yield_now().await;

        match self.failures.borrow().get(&(name.to_string(), stage)) {
            Some(message) => Err(anyhow!("{message}")),
            None => Ok(()),
        }
    }
}

impl Hooks<Artifact> for TestHooks {
    fn normalize(&self, request: Request) -> HookFuture<'_, String> {
        Box::pin(async move {
            let gate = self.gates.borrow().get(&request.request).cloned();
            if let Some(gate) = gate {
                gate.notified().await;
            }
            self.enter(Stage::Normalize, &request.request).await?;
            anyhow::Ok(request.request.trim_start_matches("./").to_string())
        })
    }

    fn locate(&self, load: LoadInfo) -> HookFuture<'_, String> {
        Box::pin(async move {
            let name = label(load.name.as_deref());
            self.enter(Stage::Locate, name).await?;
            load.metadata.insert("located", name);
            anyhow::Ok(format!("{SCHEME}{name}"))
        })
    }

    fn fetch(&self, load: LoadInfo) -> HookFuture<'_, String> {
        Box::pin(async move {
            self.enter(Stage::Fetch, label(load.name.as_deref())).await?;

            let address = load.address.unwrap_or_default();
            let key = address.strip_prefix(SCHEME).unwrap_or(&address);
            match self.sources.borrow().get(key) {
                Some(source) => anyhow::Ok(source.clone()),
                None => bail!("nothing at '{address}'"),
            }
        })
    }

    fn translate(&self, load: LoadInfo, source: String) -> HookFuture<'_, String> {
        Box::pin(async move {
            self.enter(Stage::Translate, label(load.name.as_deref())).await?;
            anyhow::Ok(source)
        })
    }

    fn instantiate(
        &self,
        load: LoadInfo,
        source: String,
    ) -> HookFuture<'_, Option<Instantiation<Artifact>>> {
        Box::pin(async move {
            self.enter(Stage::Instantiate, label(load.name.as_deref()))
                .await?;
            anyhow::Ok(parse(load, &source))
        })
    }
}

fn parse(load: LoadInfo, source: &str) -> Option<Instantiation<Artifact>> {
    let mut dependencies = Vec::new();
    let mut required = Vec::new();
    let mut failure = None;
    let mut panic = None;
    let mut body = Vec::new();

    for line in source.lines().map(str::trim) {
        match line.split_once(' ') {
            Some(("import", request)) => {
                dependencies.push(request.to_string());
                required.push(false);
            }
            Some(("require", request)) => {
                dependencies.push(request.to_string());
                required.push(true);
            }
            Some(("fail", message)) => failure = Some(message.to_string()),
            Some(("panic", message)) => panic = Some(message.to_string()),
            _ if line == "declarative" => return None,
            _ => body.push(line),
        }
    }

    let body = body.join("\n");

    Some(Instantiation::new(dependencies, move |imports: Vec<Import<Artifact>>| {
        for (import, required) in imports.iter().zip(required) {
            if required {
                import.require()?;
            }
        }
        if let Some(message) = failure {
            bail!("{message}");
        }
        if let Some(message) = panic {
            panic!("{message}");
        }

        Ok(Rc::new(Module {
            name: load.name,
            body,
            metadata: load.metadata.to_json(),
            imports,
        }))
    }))
}

/// Lets every spawned task that can make progress run for a while.
pub(crate) async fn run_pending() {
    for _ in 0..64 {
        tokio::task::yield_now().await;
    }
}

/// Runs `future` to completion on a fresh `LocalSet`.
pub(crate) async fn local<F: Future>(future: F) -> F::Output {
    tokio::task::LocalSet::new().run_until(future).await
}
