use crate::{ConfigKey, ConfigObject, Error, EventStream, StopSignal, Synced};
use std::sync::Arc;

/// A long-running loop managed by the orchestrator.
#[async_trait::async_trait]
pub trait Controller: Send + Sync {
    /// Drives the loop until `stop` is signaled.
    ///
    /// Implementations must observe the signal promptly and return once it
    /// fires; dropping the signal releases the orchestrator's shutdown wait.
    async fn run(&self, stop: StopSignal);

    /// Observes the loop's first full sync.
    fn synced(&self) -> Synced;
}

/// An origin of configuration objects.
pub trait ConfigSource: Controller {
    /// A stable, unique name for logs and conflict reports.
    fn name(&self) -> &str;

    /// Lists the objects of `kind` currently known to the source, ordered by
    /// namespace and name.
    ///
    /// Fails with [`Error::SourceUnavailable`] when the source cannot produce
    /// a complete listing. Partial results are never returned.
    fn list(&self, kind: &str) -> Result<Vec<Arc<ConfigObject>>, Error>;

    /// The kinds of the objects the source currently holds.
    fn kinds(&self) -> Vec<String>;

    /// Returns a stream of every change observed after this call.
    ///
    /// The stream never terminates while the source exists. When the source
    /// recovers from a broken watch, it emits the events needed to reconcile
    /// subscribers with its new state.
    fn subscribe(&self) -> EventStream;
}

/// A merged, read-mostly view of configuration.
pub trait ConfigStoreCache: Controller {
    fn get(&self, key: &ConfigKey) -> Option<Arc<ConfigObject>>;

    fn list(&self, kind: &str) -> Vec<Arc<ConfigObject>>;

    fn subscribe(&self) -> EventStream;
}

#[async_trait::async_trait]
impl<T: Controller + ?Sized> Controller for Arc<T> {
    async fn run(&self, stop: StopSignal) {
        (**self).run(stop).await
    }

    fn synced(&self) -> Synced {
        (**self).synced()
    }
}
