//! Runs each tunnel route as a `cloudflared` Deployment next to its origin certificate.

use std::{
    collections::{BTreeMap, HashMap, HashSet},
    pin::pin,
    sync::{Mutex, PoisonError},
};

use async_trait::async_trait;
use futures::StreamExt;
use k8s_openapi::{
    api::{
        apps::v1::{Deployment, DeploymentSpec, DeploymentStrategy},
        core::v1::{Container, KeyToPath, PodSpec, PodTemplateSpec, SecretVolumeSource, Volume, VolumeMount},
    },
    apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta},
};
use kube::{
    Client, ResourceExt,
    api::{Api, DeleteParams, ListParams, Patch, PatchParams},
    runtime::{WatchStreamExt, watcher},
};
use log::{debug, info, warn};
use rand::Rng;
use tokio_util::sync::CancellationToken;

use super::{Connection, FailureSender, HandleId, TunnelFailure, TunnelHandle, TunnelTransport};
use crate::{
    FOR_INGRESS_LABEL, FOR_NAMESPACE_LABEL, HANDLE_LABEL, IngressKey, MANAGED_BY_LABEL, MANAGER_NAME, ORIGIN_CERT_KEY,
    Result,
    desired::{DesiredTunnelSpec, HostRoute},
    tags::Tag,
};

pub const DEFAULT_CLOUDFLARED_IMAGE: &str = "cloudflare/cloudflared:latest";

const CERT_VOLUME: &str = "origin-cert";
const CERT_DIR: &str = "/etc/cloudflared";
const PROGRESS_DEADLINE_SECONDS: i32 = 120;

fn managed_selector() -> String {
    format!("{MANAGED_BY_LABEL}={MANAGER_NAME}")
}

/// Builds the Deployment that carries `route` for the tunnel labelled `handle_label`.
pub fn cloudflared_deployment(
    name: &str,
    handle_label: &str,
    key: &IngressKey,
    route: &HostRoute,
    tags: &[Tag],
    image: &str,
) -> Deployment {
    let labels = BTreeMap::from([
        (MANAGED_BY_LABEL.to_string(), MANAGER_NAME.to_string()),
        (FOR_NAMESPACE_LABEL.to_string(), key.namespace.clone()),
        (FOR_INGRESS_LABEL.to_string(), key.name.clone()),
        (HANDLE_LABEL.to_string(), handle_label.to_string()),
    ]);
    let pod_labels = BTreeMap::from([("app".to_string(), name.to_string())]);

    let mut args = vec![
        "tunnel".to_string(),
        "--no-autoupdate".to_string(),
        "--hostname".to_string(),
        route.host.clone(),
        "--url".to_string(),
        route.url.clone(),
        "--origincert".to_string(),
        format!("{CERT_DIR}/{ORIGIN_CERT_KEY}"),
    ];
    for tag in tags {
        args.push("--tag".to_string());
        args.push(tag.to_string());
    }

    Deployment {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(route.origin_secret.namespace.clone()),
            labels: Some(labels),
            ..Default::default()
        },
        spec: Some(DeploymentSpec {
            replicas: Some(1),
            progress_deadline_seconds: Some(PROGRESS_DEADLINE_SECONDS),
            strategy: Some(DeploymentStrategy {
                type_: Some("Recreate".into()),
                rolling_update: None,
            }),
            selector: LabelSelector {
                match_labels: Some(pod_labels.clone()),
                match_expressions: None,
            },
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(pod_labels),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    containers: vec![Container {
                        name: "cloudflared".to_string(),
                        image: Some(image.to_string()),
                        args: Some(args),
                        volume_mounts: Some(vec![VolumeMount {
                            name: CERT_VOLUME.to_string(),
                            mount_path: CERT_DIR.to_string(),
                            read_only: Some(true),
                            ..Default::default()
                        }]),
                        ..Default::default()
                    }],
                    volumes: Some(vec![Volume {
                        name: CERT_VOLUME.to_string(),
                        secret: Some(SecretVolumeSource {
                            secret_name: Some(route.origin_secret.name.clone()),
                            items: Some(vec![KeyToPath {
                                key: ORIGIN_CERT_KEY.to_string(),
                                path: ORIGIN_CERT_KEY.to_string(),
                                mode: None,
                            }]),
                            ..Default::default()
                        }),
                        ..Default::default()
                    }]),
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Returns why a Deployment cannot make progress, if it cannot.
pub fn progress_failure(deployment: &Deployment) -> Option<String> {
    deployment
        .status
        .as_ref()?
        .conditions
        .as_ref()?
        .iter()
        .find(|c| c.type_ == "Progressing" && c.reason.as_deref() == Some("ProgressDeadlineExceeded"))
        .map(|c| c.message.clone().unwrap_or_else(|| "progress deadline exceeded".into()))
}

fn available_replicas(deployment: &Deployment) -> i32 {
    deployment
        .status
        .as_ref()
        .and_then(|s| s.available_replicas)
        .unwrap_or(0)
}

/// `(namespace, name)` of every managed Deployment whose handle is not live.
pub fn orphans(deployments: &[Deployment], live: &HashSet<String>) -> Vec<(String, String)> {
    deployments
        .iter()
        .filter(|d| {
            let handle = d.labels().get(HANDLE_LABEL);
            handle.is_none_or(|h| !live.contains(h))
        })
        .filter_map(|d| Some((d.namespace()?, d.name_any())))
        .collect()
}

struct LiveTunnel {
    key: IngressKey,
    failures: FailureSender,
    deployments: HashSet<(String, String)>,
    /// Deployments that had at least one available replica.
    available: HashSet<String>,
    reported: bool,
}

///
/// Tunnels opened by this process, indexed for mapping Deployment events back to handles.
///
#[derive(Default)]
struct LiveSet {
    tunnels: Mutex<HashMap<HandleId, LiveTunnel>>,
}

impl LiveSet {
    fn register(
        &self,
        id: HandleId,
        key: IngressKey,
        failures: FailureSender,
        connections: &[Connection],
    ) -> Registration<'_> {
        let deployments = connections
            .iter()
            .map(|c| (c.namespace.clone(), c.name.clone()))
            .collect();
        let tunnel = LiveTunnel {
            key,
            failures,
            deployments,
            available: HashSet::new(),
            reported: false,
        };
        self.lock().insert(id, tunnel);
        Registration {
            live: self,
            id,
            kept: false,
        }
    }

    fn unregister(&self, id: HandleId) {
        self.lock().remove(&id);
    }

    fn handle_labels(&self, instance: &str) -> HashSet<String> {
        self.lock().keys().map(|id| format!("{instance}-{id}")).collect()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<HandleId, LiveTunnel>> {
        self.tunnels.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Tracks a Deployment update and returns a failure report for its tunnel, if due.
    fn applied(&self, deployment: &Deployment) -> Option<TunnelFailure> {
        let (namespace, name) = (deployment.namespace()?, deployment.name_any());
        let mut tunnels = self.lock();
        let (id, tunnel) = tunnels
            .iter_mut()
            .find(|(_, t)| t.deployments.contains(&(namespace.clone(), name.clone())))?;

        let reason = if let Some(reason) = progress_failure(deployment) {
            Some(reason)
        } else if available_replicas(deployment) > 0 {
            tunnel.available.insert(name.clone());
            None
        } else if tunnel.available.contains(&name) {
            Some(format!("deployment `{namespace}/{name}` has no available replicas"))
        } else {
            None
        };
        reason.and_then(|reason| report(*id, tunnel, reason))
    }

    fn deleted(&self, deployment: &Deployment) -> Option<TunnelFailure> {
        let (namespace, name) = (deployment.namespace()?, deployment.name_any());
        let mut tunnels = self.lock();
        let (id, tunnel) = tunnels
            .iter_mut()
            .find(|(_, t)| t.deployments.contains(&(namespace.clone(), name.clone())))?;
        report(*id, tunnel, format!("deployment `{namespace}/{name}` was deleted"))
    }
}

///
/// Unregisters its tunnel on drop unless [`Registration::keep`] was called. An open that
/// fails or is cancelled half way thus leaves its Deployments to the orphan sweep.
///
struct Registration<'a> {
    live: &'a LiveSet,
    id: HandleId,
    kept: bool,
}

impl Registration<'_> {
    fn keep(mut self) {
        self.kept = true;
    }
}

impl Drop for Registration<'_> {
    fn drop(&mut self) {
        if !self.kept {
            debug!("Tunnel `{}` was not opened, unregistering it", self.id);
            self.live.unregister(self.id);
        }
    }
}

/// Sends at most one failure per tunnel.
fn report(id: HandleId, tunnel: &mut LiveTunnel, reason: String) -> Option<TunnelFailure> {
    if tunnel.reported {
        return None;
    }
    tunnel.reported = true;
    let failure = TunnelFailure {
        key: tunnel.key.clone(),
        handle: id,
        reason,
    };
    if tunnel.failures.send(failure.clone()).is_err() {
        debug!("Failure of tunnel `{id}` dropped, nobody is listening");
    }
    Some(failure)
}

///
/// A [`TunnelTransport`] that creates one `cloudflared` Deployment per host route, in the
/// namespace of the route's origin secret.
///
pub struct DeploymentTransport {
    client: Client,
    image: String,
    /// Random per-process prefix, so Deployments of earlier runs are recognized as orphans.
    instance: String,
    live: LiveSet,
}

impl DeploymentTransport {
    pub fn new(client: Client, image: impl Into<String>) -> Self {
        let instance = format!("{:06x}", rand::thread_rng().gen_range(0..0x100_0000u32));
        info!("Tunnel Deployments of this process are prefixed `argot-{instance}`");
        Self {
            client,
            image: image.into(),
            instance,
            live: LiveSet::default(),
        }
    }

    fn handle_label(&self, id: HandleId) -> String {
        format!("{}-{id}", self.instance)
    }

    async fn apply(&self, deployment: &Deployment) -> Result<()> {
        let namespace = deployment.namespace().unwrap_or_default();
        let name = deployment.name_any();
        Api::<Deployment>::namespaced(self.client.clone(), &namespace)
            .patch(&name, &PatchParams::apply(MANAGER_NAME).force(), &Patch::Apply(deployment))
            .await?;
        info!("Applied deployment `{namespace}/{name}`");
        Ok(())
    }

    async fn delete(&self, namespace: &str, name: &str) -> Result<()> {
        let api = Api::<Deployment>::namespaced(self.client.clone(), namespace);
        match api.delete(name, &DeleteParams::background()).await {
            Ok(_) => {
                info!("Deleted deployment `{namespace}/{name}`");
                Ok(())
            }
            Err(kube::Error::Api(e)) if e.code == 404 => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn delete_all(&self, connections: &[Connection]) -> Result<()> {
        for connection in connections {
            self.delete(&connection.namespace, &connection.name).await?;
        }
        Ok(())
    }

    /// Reports failures of live tunnels from a watch on managed Deployments until `shutdown`
    /// fires.
    pub async fn watch_failures(&self, shutdown: CancellationToken) {
        let api = Api::<Deployment>::all(self.client.clone());
        let config = watcher::Config::default().labels(&managed_selector());
        let mut events = pin!(watcher(api, config).default_backoff());

        loop {
            let event = tokio::select! {
                _ = shutdown.cancelled() => break,
                event = events.next() => event,
            };
            let failure = match event {
                Some(Ok(watcher::Event::Apply(d) | watcher::Event::InitApply(d))) => self.live.applied(&d),
                Some(Ok(watcher::Event::Delete(d))) => self.live.deleted(&d),
                Some(Ok(watcher::Event::Init | watcher::Event::InitDone)) => None,
                Some(Err(e)) => {
                    warn!("Watch of tunnel deployments failed, retrying: {e}");
                    None
                }
                None => break,
            };
            if let Some(failure) = failure {
                warn!("Tunnel `{}` of `{}` failed: {}", failure.handle, failure.key, failure.reason);
            }
        }
        debug!("Stopped watching tunnel deployments");
    }
}

#[async_trait]
impl TunnelTransport for DeploymentTransport {
    async fn open(&self, spec: &DesiredTunnelSpec, failures: FailureSender) -> Result<TunnelHandle> {
        let id = HandleId::next();
        let handle_label = self.handle_label(id);
        let deployments: Vec<_> = spec
            .routes
            .iter()
            .enumerate()
            .map(|(idx, route)| {
                let name = format!("argot-{handle_label}-{idx}");
                cloudflared_deployment(&name, &handle_label, &spec.key, route, &spec.tags, &self.image)
            })
            .collect();
        let handle = TunnelHandle {
            id,
            key: spec.key.clone(),
            connections: spec
                .routes
                .iter()
                .zip(&deployments)
                .map(|(route, d)| Connection {
                    host: route.host.clone(),
                    namespace: route.origin_secret.namespace.clone(),
                    name: d.name_any(),
                })
                .collect(),
        };

        // Register first so a concurrent sweep does not treat the new Deployments as orphans.
        let registration = self.live.register(id, spec.key.clone(), failures, &handle.connections);
        for deployment in &deployments {
            if let Err(e) = self.apply(deployment).await {
                if let Err(cleanup) = self.delete_all(&handle.connections).await {
                    warn!("Failed to clean up partial tunnel `{id}`: {cleanup}");
                }
                return Err(e);
            }
        }
        registration.keep();
        Ok(handle)
    }

    async fn close(&self, handle: &TunnelHandle) -> Result<()> {
        self.delete_all(&handle.connections).await?;
        self.live.unregister(handle.id);
        Ok(())
    }

    async fn check(&self, handle: &TunnelHandle) -> Result<bool> {
        for connection in &handle.connections {
            let api = Api::<Deployment>::namespaced(self.client.clone(), &connection.namespace);
            match api.get_opt(&connection.name).await? {
                None => {
                    debug!("Deployment `{}/{}` is gone", connection.namespace, connection.name);
                    return Ok(false);
                }
                Some(deployment) => {
                    if let Some(reason) = progress_failure(&deployment) {
                        debug!("Deployment `{}/{}` is stuck: {reason}", connection.namespace, connection.name);
                        return Ok(false);
                    }
                }
            }
        }
        Ok(true)
    }

    async fn sweep(&self) -> Result<()> {
        let deployments = Api::<Deployment>::all(self.client.clone())
            .list(&ListParams::default().labels(&managed_selector()))
            .await?;
        let live = self.live.handle_labels(&self.instance);
        for (namespace, name) in orphans(&deployments.items, &live) {
            info!("Deleting orphaned deployment `{namespace}/{name}`");
            self.delete(&namespace, &name).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use k8s_openapi::api::apps::v1::{DeploymentCondition, DeploymentStatus};

    use super::*;
    use crate::{secret::SecretRef, tunnel::failure_channel};

    fn route() -> HostRoute {
        HostRoute {
            host: "shop.example.com".into(),
            service: "web".into(),
            port: 8080,
            url: "http://web.shop.svc:8080".into(),
            origin_secret: SecretRef::new("cloudflare", "origin"),
        }
    }

    fn key() -> IngressKey {
        IngressKey::new("shop", "storefront")
    }

    fn deployment(name: &str, handle_label: &str) -> Deployment {
        cloudflared_deployment(name, handle_label, &key(), &route(), &[], DEFAULT_CLOUDFLARED_IMAGE)
    }

    fn with_status(mut deployment: Deployment, available: i32, stuck: bool) -> Deployment {
        let conditions = stuck.then(|| {
            vec![DeploymentCondition {
                type_: "Progressing".into(),
                status: "False".into(),
                reason: Some("ProgressDeadlineExceeded".into()),
                message: Some("ReplicaSet has timed out progressing".into()),
                ..Default::default()
            }]
        });
        deployment.status = Some(DeploymentStatus {
            available_replicas: Some(available),
            conditions,
            ..Default::default()
        });
        deployment
    }

    #[test]
    fn builds_cloudflared_deployment() {
        let tags = [Tag::new("k8s.namespace", "shop"), Tag::new("k8s.ingress", "storefront")];
        let d = cloudflared_deployment("argot-abc123-1-0", "abc123-1", &key(), &route(), &tags, "cloudflared:test");

        assert_eq!(d.metadata.namespace.as_deref(), Some("cloudflare"));
        let labels = d.metadata.labels.as_ref().unwrap();
        assert_eq!(labels[MANAGED_BY_LABEL], MANAGER_NAME);
        assert_eq!(labels[FOR_INGRESS_LABEL], "storefront");
        assert_eq!(labels[HANDLE_LABEL], "abc123-1");

        let pod = d.spec.as_ref().unwrap().template.spec.as_ref().unwrap();
        let container = &pod.containers[0];
        assert_eq!(container.image.as_deref(), Some("cloudflared:test"));
        let args = container.args.as_ref().unwrap().join(" ");
        assert_eq!(
            args,
            "tunnel --no-autoupdate --hostname shop.example.com --url http://web.shop.svc:8080 \
             --origincert /etc/cloudflared/cert.pem --tag k8s.namespace=shop --tag k8s.ingress=storefront"
        );
        let volume = &pod.volumes.as_ref().unwrap()[0];
        assert_eq!(volume.secret.as_ref().unwrap().secret_name.as_deref(), Some("origin"));
    }

    #[test]
    fn finds_orphans_by_handle_label() {
        let deployments = [
            deployment("argot-aaaaaa-1-0", "aaaaaa-1"),
            deployment("argot-aaaaaa-2-0", "aaaaaa-2"),
            deployment("argot-bbbbbb-1-0", "bbbbbb-1"),
        ];
        let live = HashSet::from(["aaaaaa-1".to_string()]);
        assert_eq!(
            orphans(&deployments, &live),
            vec![
                ("cloudflare".to_string(), "argot-aaaaaa-2-0".to_string()),
                ("cloudflare".to_string(), "argot-bbbbbb-1-0".to_string()),
            ]
        );
    }

    #[test]
    fn reports_replicas_lost_after_becoming_available() {
        let live = LiveSet::default();
        let (failures, mut received) = failure_channel();
        let id = HandleId::next();
        let connection = Connection {
            host: "shop.example.com".into(),
            namespace: "cloudflare".into(),
            name: "argot-aaaaaa-1-0".into(),
        };
        live.register(id, key(), failures, &[connection]);

        let d = deployment("argot-aaaaaa-1-0", "aaaaaa-1");
        // Still starting up: no replicas yet is not a failure.
        assert!(live.applied(&with_status(d.clone(), 0, false)).is_none());
        assert!(live.applied(&with_status(d.clone(), 1, false)).is_none());

        let failure = live.applied(&with_status(d.clone(), 0, false)).unwrap();
        assert_eq!(failure.handle, id);
        assert_eq!(failure.key, key());
        assert_eq!(received.try_recv().unwrap(), failure);

        // One report per tunnel.
        assert!(live.deleted(&d).is_none());
        assert!(received.try_recv().is_err());
    }

    #[test]
    fn reports_stuck_and_deleted_deployments() {
        let live = LiveSet::default();
        let (failures, _received) = failure_channel();
        let stuck = HandleId::next();
        let deleted = HandleId::next();
        for (id, name) in [(stuck, "argot-a-1-0"), (deleted, "argot-a-2-0")] {
            let connection = Connection {
                host: "shop.example.com".into(),
                namespace: "cloudflare".into(),
                name: name.into(),
            };
            live.register(id, key(), failures.clone(), &[connection]);
        }

        let failure = live.applied(&with_status(deployment("argot-a-1-0", "a-1"), 0, true)).unwrap();
        assert_eq!(failure.handle, stuck);
        assert_eq!(failure.reason, "ReplicaSet has timed out progressing");

        let failure = live.deleted(&deployment("argot-a-2-0", "a-2")).unwrap();
        assert_eq!(failure.handle, deleted);

        live.unregister(stuck);
        assert!(live.applied(&with_status(deployment("argot-a-1-0", "a-1"), 0, true)).is_none());
        assert!(live.deleted(&deployment("argot-unknown-0", "x")).is_none());
    }

    #[test]
    fn handle_labels_cover_live_tunnels() {
        let live = LiveSet::default();
        let (failures, _received) = failure_channel();
        let id = HandleId::next();
        live.register(id, key(), failures, &[]).keep();
        assert_eq!(live.handle_labels("abcdef"), HashSet::from([format!("abcdef-{id}")]));
    }

    #[test]
    fn dropped_registration_is_forgotten() {
        let live = LiveSet::default();
        let (failures, _received) = failure_channel();
        let registration = live.register(HandleId::next(), key(), failures, &[]);
        assert_eq!(live.handle_labels("abcdef").len(), 1);
        drop(registration);
        assert!(live.handle_labels("abcdef").is_empty());
    }

    #[tokio::test]
    async fn cancelled_open_leaves_no_live_tunnel() {
        // An API server that accepts connections and never answers.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((stream, _)) = listener.accept().await {
                held.push(stream);
            }
        });

        let config = kube::Config::new(format!("http://{address}").parse().unwrap());
        let transport = DeploymentTransport::new(Client::try_from(config).unwrap(), DEFAULT_CLOUDFLARED_IMAGE);
        let spec = DesiredTunnelSpec {
            key: key(),
            routes: vec![route()],
            tags: Vec::new(),
            class_matches: true,
        };
        let (failures, _received) = failure_channel();

        let opened = tokio::time::timeout(Duration::from_millis(200), transport.open(&spec, failures)).await;
        assert!(opened.is_err());
        assert!(transport.live.handle_labels(&transport.instance).is_empty());
        server.abort();
    }
}
