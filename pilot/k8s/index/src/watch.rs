use futures::prelude::*;
use kube::runtime::{watcher, WatchStreamExt};
use kubert::index::IndexNamespacedResource;
use mesh_pilot_core::StopSignal;
use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use std::{fmt, sync::Arc, time::Duration};

/// Feeds `index` from a watch on `api` until `stop` fires.
///
/// Once the watch has delivered its initial listing, it is restarted every
/// `resync`, which delivers a complete listing of the resources to the
/// index's `reset`. Watch errors are logged and retried with the watcher's
/// default backoff.
pub(crate) async fn index<R, I>(
    api: kube::Api<R>,
    config: watcher::Config,
    index: Arc<RwLock<I>>,
    resync: Duration,
    stop: StopSignal,
) where
    R: kube::Resource<DynamicType = ()> + Clone + DeserializeOwned + fmt::Debug,
    R: Send + Sync + 'static,
    I: IndexNamespacedResource<R> + Send + Sync + 'static,
{
    let watch = || {
        watcher(api.clone(), config.clone())
            .default_backoff()
            .filter_map(|res| {
                future::ready(match res {
                    Ok(event) => Some(event),
                    Err(error) => {
                        tracing::info!(%error, "Watch failed");
                        None
                    }
                })
            })
    };
    run(watch, index, resync, stop).await
}

async fn run<R, I, S>(
    watch: impl Fn() -> S,
    index: Arc<RwLock<I>>,
    resync: Duration,
    stop: StopSignal,
) where
    R: kube::Resource + fmt::Debug,
    I: IndexNamespacedResource<R>,
    S: Stream<Item = watcher::Event<R>>,
{
    let shutdown = stop.signaled();
    tokio::pin!(shutdown);

    loop {
        let (init_tx, mut init_rx) = tokio::sync::watch::channel(false);
        let events = watch().inspect(move |event| {
            if matches!(event, watcher::Event::InitDone) {
                init_tx.send_replace(true);
            }
        });

        // A slow initial listing must not be restarted before it completes.
        let resynced = async {
            if init_rx.wait_for(|done| *done).await.is_ok() {
                tokio::time::sleep(resync).await;
            } else {
                future::pending::<()>().await;
            }
        };

        tokio::select! {
            release = &mut shutdown => {
                tracing::debug!("Stopped");
                drop(release);
                return;
            }

            () = kubert::index::namespaced(index.clone(), events) => {
                tracing::warn!("Watch stream ended");
            }

            () = resynced => {
                tracing::debug!(?resync, "Resyncing");
            }
        }
    }
}
