// Copyright 2025 The Kubernetes Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Shared informer factory.
//!
//! Informers watch Kubernetes resources and cache them locally. The factory
//! hands out one cache per resource type no matter how many consumers ask
//! for it, and starts the underlying watches only when the server runtime
//! calls [`SharedInformerFactory::start`].

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures::future::BoxFuture;
use futures::{FutureExt, StreamExt};
use kube::runtime::reflector::{self, Store};
use kube::runtime::{watcher, WatchStreamExt};
use kube::{Api, Client, Resource};
use serde::de::DeserializeOwned;
use tokio_util::sync::CancellationToken;

type RunFn = Box<dyn FnOnce(CancellationToken) -> BoxFuture<'static, ()> + Send>;
type WaitFn = Box<dyn Fn() -> BoxFuture<'static, bool> + Send + Sync>;

struct Informer {
    kind: String,
    store: Box<dyn Any + Send + Sync>,
    wait: WaitFn,
    /// Taken when the informer is started.
    run: Option<RunFn>,
}

/// Factory for shared informers.
pub struct SharedInformerFactory {
    client: Client,
    default_resync: Duration,
    informers: Mutex<HashMap<TypeId, Informer>>,
}

impl SharedInformerFactory {
    /// Creates a factory whose informers resync every `default_resync`.
    ///
    /// A zero period disables resync ticks.
    pub fn new(client: Client, default_resync: Duration) -> Self {
        Self {
            client,
            default_resync,
            informers: Mutex::new(HashMap::new()),
        }
    }

    /// Returns the client the informers watch through.
    pub fn client(&self) -> &Client {
        &self.client
    }

    /// Returns the resync period.
    pub fn resync_period(&self) -> Duration {
        self.default_resync
    }

    fn informers(&self) -> MutexGuard<'_, HashMap<TypeId, Informer>> {
        self.informers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Returns the shared cache for `K`, registering its informer on first
    /// use.
    ///
    /// The cache stays empty until the factory is started.
    pub fn informer_for<K>(&self) -> Store<K>
    where
        K: Resource<DynamicType = ()>
            + Clone
            + DeserializeOwned
            + fmt::Debug
            + Send
            + Sync
            + 'static,
    {
        let mut informers = self.informers();
        if let Some(store) = informers
            .get(&TypeId::of::<K>())
            .and_then(|informer| informer.store.downcast_ref::<Store<K>>())
        {
            return store.clone();
        }

        let kind = K::kind(&()).into_owned();
        let (reader, writer) = reflector::store::<K>();
        let api: Api<K> = Api::all(self.client.clone());
        let resync = self.default_resync;

        let run_kind = kind.clone();
        let run_reader = reader.clone();
        let run: RunFn = Box::new(move |cancel| {
            async move {
                let stream = watcher(api, watcher::Config::default())
                    .default_backoff()
                    .reflect(writer)
                    .applied_objects();
                run_informer(run_kind, stream, run_reader, resync, cancel).await;
            }
            .boxed()
        });

        let wait_reader = reader.clone();
        let wait: WaitFn = Box::new(move || {
            let reader = wait_reader.clone();
            async move { reader.wait_until_ready().await.is_ok() }.boxed()
        });

        tracing::debug!(kind = %kind, "registered informer");
        informers.insert(
            TypeId::of::<K>(),
            Informer {
                kind,
                store: Box::new(reader.clone()),
                wait,
                run: Some(run),
            },
        );
        reader
    }

    /// Starts every registered informer that is not running yet and returns
    /// how many were started.
    ///
    /// Safe to call repeatedly. Must be called from within a Tokio runtime.
    pub fn start(&self, cancel: &CancellationToken) -> usize {
        let mut started = 0;
        for informer in self.informers().values_mut() {
            if let Some(run) = informer.run.take() {
                tracing::info!(kind = %informer.kind, "starting informer");
                tokio::spawn(run(cancel.child_token()));
                started += 1;
            }
        }
        started
    }

    /// Waits until every started informer has completed its initial list.
    ///
    /// Returns the sync state per kind; `false` means the informer stopped
    /// before its cache became ready.
    pub async fn wait_for_cache_sync(&self) -> HashMap<String, bool> {
        let waits: Vec<(String, BoxFuture<'static, bool>)> = self
            .informers()
            .values()
            .filter(|informer| informer.run.is_none())
            .map(|informer| (informer.kind.clone(), (informer.wait)()))
            .collect();

        let mut synced = HashMap::with_capacity(waits.len());
        for (kind, wait) in waits {
            synced.insert(kind, wait.await);
        }
        synced
    }

    /// Returns the kinds with a registered informer, sorted.
    pub fn registered_kinds(&self) -> Vec<String> {
        let mut kinds: Vec<String> = self
            .informers()
            .values()
            .map(|informer| informer.kind.clone())
            .collect();
        kinds.sort();
        kinds
    }
}

impl fmt::Debug for SharedInformerFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedInformerFactory")
            .field("default_resync", &self.default_resync)
            .field("kinds", &self.registered_kinds())
            .finish()
    }
}

async fn run_informer<K, S>(
    kind: String,
    stream: S,
    store: Store<K>,
    resync: Duration,
    cancel: CancellationToken,
) where
    K: Resource<DynamicType = ()> + Clone + 'static,
    S: futures::Stream<Item = Result<K, watcher::Error>>,
{
    tokio::pin!(stream);

    let mut ticker = (!resync.is_zero()).then(|| {
        let mut ticker = tokio::time::interval(resync);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.reset();
        ticker
    });

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                tracing::debug!(kind = %kind, "informer stopped");
                break;
            }
            Some(_) = async {
                match ticker.as_mut() {
                    Some(ticker) => Some(ticker.tick().await),
                    None => None,
                }
            } => {
                tracing::debug!(kind = %kind, objects = store.state().len(), "informer resync");
            }
            event = stream.next() => match event {
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    tracing::warn!(kind = %kind, error = %e, "informer watch error");
                }
                None => {
                    tracing::warn!(kind = %kind, "informer watch stream ended");
                    break;
                }
            }
        }
    }
}
