use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll};

use tokio::sync::watch;

use crate::error::LoaderError;

/// The pending result of a loader request.
///
/// Returned by [`Loader::load`](crate::Loader::load),
/// [`Loader::import`](crate::Loader::import) and friends. The request is
/// already running when the `Deferred` is handed out, awaiting it only
/// observes the outcome, and dropping it does not cancel anything.
#[must_use = "a Deferred only reports the outcome, the request runs anyway"]
pub struct Deferred<T> {
    inner: Pin<Box<dyn Future<Output = Result<T, LoaderError>>>>,
}

impl<T: 'static> Deferred<T> {
    pub(crate) fn new(future: impl Future<Output = Result<T, LoaderError>> + 'static) -> Self {
        Self {
            inner: Box::pin(future),
        }
    }

    pub(crate) fn ready(result: Result<T, LoaderError>) -> Self {
        Self::new(std::future::ready(result))
    }

    pub(crate) fn and_then<U, F>(self, f: F) -> Deferred<U>
    where
        U: 'static,
        F: FnOnce(T) -> Result<U, LoaderError> + 'static,
    {
        Deferred::new(async move { f(self.await?) })
    }
}

impl<T> Future for Deferred<T> {
    type Output = Result<T, LoaderError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.inner.as_mut().poll(cx)
    }
}

impl<T> std::fmt::Debug for Deferred<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Deferred").finish_non_exhaustive()
    }
}

/// A result settled once and observed by any number of waiters.
pub(crate) struct Shared<T> {
    name: Rc<str>,
    sender: Rc<watch::Sender<Option<Result<T, LoaderError>>>>,
}

impl<T> Clone for Shared<T> {
    fn clone(&self) -> Self {
        Self {
            name: Rc::clone(&self.name),
            sender: Rc::clone(&self.sender),
        }
    }
}

impl<T: Clone + 'static> Shared<T> {
    pub(crate) fn new(name: &str) -> Self {
        let (sender, _) = watch::channel(None);
        Self {
            name: name.into(),
            sender: Rc::new(sender),
        }
    }

    /// Stores the outcome. Only the first call has an effect.
    pub(crate) fn settle(&self, result: Result<T, LoaderError>) {
        self.sender.send_if_modified(|slot| {
            if slot.is_some() {
                return false;
            }
            *slot = Some(result);
            true
        });
    }

    pub(crate) fn wait(&self) -> Deferred<T> {
        let mut receiver = self.sender.subscribe();
        let name = Rc::clone(&self.name);

        Deferred::new(async move {
            let settled = match receiver.wait_for(Option::is_some).await {
                Ok(settled) => (*settled).clone(),
                Err(_) => None,
            };
            settled.unwrap_or_else(|| Err(LoaderError::Abandoned(name.to_string())))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_every_waiter_sees_the_result() {
        let shared = Shared::<u32>::new("a");
        let first = shared.wait();
        let second = shared.wait();

        shared.settle(Ok(1));
        shared.settle(Ok(2));

        assert_eq!(first.await.unwrap(), 1);
        assert_eq!(second.await.unwrap(), 1);
        assert_eq!(shared.wait().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_errors_are_shared() {
        let shared = Shared::<u32>::new("a");
        let waiter = shared.wait();
        shared.settle(Err(LoaderError::NotLinked("a".into())));

        assert!(matches!(waiter.await, Err(LoaderError::NotLinked(name)) if name == "a"));
    }

    #[tokio::test]
    async fn test_dropped_without_settling() {
        let shared = Shared::<u32>::new("a");
        let waiter = shared.wait();
        drop(shared);

        assert!(matches!(waiter.await, Err(LoaderError::Abandoned(name)) if name == "a"));
    }

    #[tokio::test]
    async fn test_and_then() {
        let deferred = Deferred::ready(Ok(2)).and_then(|n| Ok(n * 21));
        assert_eq!(deferred.await.unwrap(), 42);

        let deferred = Deferred::<u32>::ready(Err(LoaderError::NotImplemented("this")))
            .and_then(|n| Ok(n + 1));
        assert!(deferred.await.is_err());
    }
}
