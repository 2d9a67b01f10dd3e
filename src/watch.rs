//! Cached views of the watched cluster resources and the mapping from resource events to
//! Ingress keys.

use std::{fmt::Debug, hash::Hash, pin::pin, sync::Arc};

use async_trait::async_trait;
use futures::StreamExt;
use k8s_openapi::api::{
    core::v1::{Endpoints, Secret, Service},
    networking::v1::Ingress,
};
use kube::{
    Api, Client, Resource, ResourceExt,
    runtime::{
        WatchStreamExt,
        reflector::{self, ObjectRef, Store, store::Writer},
        watcher,
    },
};
use log::{debug, info, warn};
use serde::de::DeserializeOwned;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::{
    Error, IngressKey, Result,
    config::ControllerConfig,
    desired::{backend_services, class_matches},
    lookup::ResourceLookup,
    queue::WorkQueue,
    secret::{SecretRef, SecretResolver},
};

pub fn ingress_key(ingress: &Ingress) -> Option<IngressKey> {
    Some(IngressKey::new(ingress.metadata.namespace.clone()?, ingress.metadata.name.clone()?))
}

/// Keys of the Ingresses of `class` in `namespace` that route to `service`.
pub fn keys_for_service(ingresses: &[Arc<Ingress>], class: &str, namespace: &str, service: &str) -> Vec<IngressKey> {
    ingresses
        .iter()
        .filter(|i| i.metadata.namespace.as_deref() == Some(namespace))
        .filter(|i| class_matches(i, class))
        .filter(|i| backend_services(i).contains(service))
        .filter_map(|i| ingress_key(i))
        .collect()
}

/// Keys of every Ingress of `class` if `secret` is one of the configured origin secrets. A
/// secret can back any host, so there is no narrower fan-out.
pub fn keys_for_secret(
    ingresses: &[Arc<Ingress>],
    class: &str,
    secret: &SecretRef,
    resolver: &SecretResolver,
) -> Vec<IngressKey> {
    if !resolver.references(secret) {
        return Vec::new();
    }
    ingresses
        .iter()
        .filter(|i| class_matches(i, class))
        .filter_map(|i| ingress_key(i))
        .collect()
}

fn object_ref<K>(namespace: &str, name: &str) -> ObjectRef<K>
where
    K: Resource,
    K::DynamicType: Default,
{
    ObjectRef::new(name).within(namespace)
}

///
/// Reflector stores of every resource kind the reconciler reads. Filled by the watches
/// [`KubeCache::start`] spawns.
///
#[derive(Clone)]
pub struct KubeCache {
    ingresses: Store<Ingress>,
    services: Store<Service>,
    endpoints: Store<Endpoints>,
    secrets: Store<Secret>,
}

impl KubeCache {
    /// Starts one watch per resource kind, restricted to the watch namespace if configured.
    /// Every observed change is mapped to the affected Ingress keys and enqueued.
    pub fn start(
        client: Client,
        config: &ControllerConfig,
        resolver: SecretResolver,
        queue: Arc<WorkQueue<IngressKey>>,
        shutdown: CancellationToken,
    ) -> (Self, JoinSet<()>) {
        let namespace = config.watch_namespace.as_deref();
        let class = config.ingress_class.clone();
        let mut tasks = JoinSet::new();

        let (ingresses, writer) = reflector::store();
        tasks.spawn(run_watch(api(&client, namespace), writer, shutdown.clone(), {
            let queue = queue.clone();
            move |ingress: &Ingress| {
                if let Some(key) = ingress_key(ingress) {
                    queue.enqueue(key);
                }
            }
        }));

        let (services, writer) = reflector::store();
        tasks.spawn(run_watch(api(&client, namespace), writer, shutdown.clone(), {
            let (queue, ingresses, class) = (queue.clone(), ingresses.clone(), class.clone());
            move |service: &Service| {
                let keys = keys_for_service(&ingresses.state(), &class, &namespace_of(service), &service.name_any());
                enqueue_all(&queue, keys);
            }
        }));

        let (endpoints, writer) = reflector::store();
        tasks.spawn(run_watch(api(&client, namespace), writer, shutdown.clone(), {
            let (queue, ingresses, class) = (queue.clone(), ingresses.clone(), class.clone());
            move |endpoints: &Endpoints| {
                let keys =
                    keys_for_service(&ingresses.state(), &class, &namespace_of(endpoints), &endpoints.name_any());
                enqueue_all(&queue, keys);
            }
        }));

        let (secrets, writer) = reflector::store();
        tasks.spawn(run_watch(api(&client, namespace), writer, shutdown, {
            let ingresses = ingresses.clone();
            move |secret: &Secret| {
                let secret = SecretRef::new(namespace_of(secret), secret.name_any());
                let keys = keys_for_secret(&ingresses.state(), &class, &secret, &resolver);
                if !keys.is_empty() {
                    debug!("Origin secret `{secret}` changed");
                }
                enqueue_all(&queue, keys);
            }
        }));

        let cache = Self {
            ingresses,
            services,
            endpoints,
            secrets,
        };
        (cache, tasks)
    }

    /// Waits until every store has completed its initial list.
    pub async fn wait_until_ready(&self) -> Result<()> {
        let dropped = |e: reflector::store::WriterDropped| Error::UnexpectedError(format!("watch stopped: {e}"));
        self.ingresses.wait_until_ready().await.map_err(dropped)?;
        self.services.wait_until_ready().await.map_err(dropped)?;
        self.endpoints.wait_until_ready().await.map_err(dropped)?;
        self.secrets.wait_until_ready().await.map_err(dropped)?;
        info!("Initial sync complete, {} Ingress(es) known", self.ingresses.state().len());
        Ok(())
    }
}

fn api<K>(client: &Client, namespace: Option<&str>) -> Api<K>
where
    K: Resource<Scope = k8s_openapi::NamespaceResourceScope>,
    K::DynamicType: Default,
{
    match namespace {
        Some(namespace) => Api::namespaced(client.clone(), namespace),
        None => Api::all(client.clone()),
    }
}

fn namespace_of<K: Resource>(object: &K) -> String {
    object.meta().namespace.clone().unwrap_or_default()
}

fn enqueue_all(queue: &WorkQueue<IngressKey>, keys: Vec<IngressKey>) {
    for key in keys {
        queue.enqueue(key);
    }
}

async fn run_watch<K, F>(api: Api<K>, writer: Writer<K>, shutdown: CancellationToken, on_change: F)
where
    K: Resource + Clone + Debug + DeserializeOwned + Send + Sync + 'static,
    K::DynamicType: Default + Eq + Hash + Clone,
    F: Fn(&K) + Send + 'static,
{
    let kind = K::kind(&K::DynamicType::default()).to_string();
    let mut stream = pin!(
        watcher(api, watcher::Config::default())
            .default_backoff()
            .reflect(writer)
            .touched_objects()
    );

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            next = stream.next() => match next {
                Some(Ok(object)) => on_change(&object),
                Some(Err(e)) => warn!("Watch of {kind} failed, retrying: {e}"),
                None => {
                    warn!("Watch of {kind} ended");
                    break;
                }
            },
        }
    }
    debug!("Stopped watching {kind}");
}

#[async_trait]
impl ResourceLookup for KubeCache {
    async fn ingress(&self, key: &IngressKey) -> Result<Option<Arc<Ingress>>> {
        Ok(self.ingresses.get(&object_ref(&key.namespace, &key.name)))
    }

    async fn service(&self, namespace: &str, name: &str) -> Result<Option<Arc<Service>>> {
        Ok(self.services.get(&object_ref(namespace, name)))
    }

    async fn endpoints(&self, namespace: &str, name: &str) -> Result<Option<Arc<Endpoints>>> {
        Ok(self.endpoints.get(&object_ref(namespace, name)))
    }

    async fn secret(&self, secret: &SecretRef) -> Result<Option<Arc<Secret>>> {
        Ok(self.secrets.get(&object_ref(&secret.namespace, &secret.name)))
    }

    async fn ingress_keys(&self) -> Result<Vec<IngressKey>> {
        let mut keys: Vec<_> = self.ingresses.state().iter().filter_map(|i| ingress_key(i)).collect();
        keys.sort();
        Ok(keys)
    }
}
