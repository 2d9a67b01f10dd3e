//! In-memory collaborators and object builders shared by the unit tests.

use std::{
    collections::{BTreeMap, HashMap},
    sync::{
        Arc, RwLock,
        atomic::{AtomicBool, Ordering},
    },
};

use async_trait::async_trait;
use k8s_openapi::{
    ByteString,
    api::{
        core::v1::{EndpointAddress, EndpointSubset, Endpoints, Secret, Service, ServicePort, ServiceSpec},
        networking::v1::{
            HTTPIngressPath, HTTPIngressRuleValue, Ingress, IngressBackend, IngressRule, IngressServiceBackend,
            IngressSpec, ServiceBackendPort,
        },
    },
    apimachinery::pkg::apis::meta::v1::ObjectMeta,
};

use crate::{Error, INGRESS_CLASS_ANNOTATION, IngressKey, ORIGIN_CERT_KEY, Result, lookup::ResourceLookup, secret::SecretRef};

fn meta(namespace: &str, name: &str) -> ObjectMeta {
    ObjectMeta {
        namespace: Some(namespace.into()),
        name: Some(name.into()),
        ..Default::default()
    }
}

fn rule(host: &str, service: &str, port: ServiceBackendPort) -> IngressRule {
    IngressRule {
        host: Some(host.into()),
        http: Some(HTTPIngressRuleValue {
            paths: vec![HTTPIngressPath {
                path: Some("/".into()),
                path_type: "Prefix".into(),
                backend: IngressBackend {
                    service: Some(IngressServiceBackend {
                        name: service.into(),
                        port: Some(port),
                    }),
                    ..Default::default()
                },
            }],
        }),
    }
}

fn class_annotated(namespace: &str, name: &str, class: &str, rules: Vec<IngressRule>) -> Ingress {
    Ingress {
        metadata: ObjectMeta {
            annotations: Some(BTreeMap::from([(INGRESS_CLASS_ANNOTATION.to_string(), class.to_string())])),
            ..meta(namespace, name)
        },
        spec: Some(IngressSpec {
            rules: Some(rules),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// An Ingress with a single host routed to a numbered service port.
pub fn ingress(namespace: &str, name: &str, class: &str, host: &str, service: &str, port: i32) -> Ingress {
    let port = ServiceBackendPort {
        number: Some(port),
        name: None,
    };
    class_annotated(namespace, name, class, vec![rule(host, service, port)])
}

/// An Ingress with one rule per `(host, service, port name)`.
pub fn ingress_with_rules(namespace: &str, name: &str, class: &str, rules: &[(&str, &str, &str)]) -> Ingress {
    let rules = rules
        .iter()
        .map(|(host, service, port)| {
            let port = ServiceBackendPort {
                number: None,
                name: Some(port.to_string()),
            };
            rule(host, service, port)
        })
        .collect();
    class_annotated(namespace, name, class, rules)
}

pub fn service(namespace: &str, name: &str, ports: &[(&str, i32)]) -> Service {
    Service {
        metadata: meta(namespace, name),
        spec: Some(ServiceSpec {
            ports: Some(
                ports
                    .iter()
                    .map(|(port_name, port)| ServicePort {
                        name: Some(port_name.to_string()),
                        port: *port,
                        ..Default::default()
                    })
                    .collect(),
            ),
            ..Default::default()
        }),
        ..Default::default()
    }
}

pub fn endpoints(namespace: &str, name: &str, ips: &[&str]) -> Endpoints {
    Endpoints {
        metadata: meta(namespace, name),
        subsets: Some(vec![EndpointSubset {
            addresses: Some(
                ips.iter()
                    .map(|ip| EndpointAddress {
                        ip: ip.to_string(),
                        ..Default::default()
                    })
                    .collect(),
            ),
            ..Default::default()
        }]),
    }
}

pub fn origin_secret(namespace: &str, name: &str) -> Secret {
    Secret {
        metadata: meta(namespace, name),
        data: Some(BTreeMap::from([(
            ORIGIN_CERT_KEY.to_string(),
            ByteString(b"-----BEGIN CERTIFICATE-----".to_vec()),
        )])),
        ..Default::default()
    }
}

type Objects<K> = RwLock<HashMap<(String, String), Arc<K>>>;

fn object_key(meta: &ObjectMeta) -> (String, String) {
    (meta.namespace.clone().unwrap_or_default(), meta.name.clone().unwrap_or_default())
}

///
/// A [`ResourceLookup`] backed by plain maps. Setting `failing` makes every lookup error out.
///
#[derive(Default)]
pub struct FakeLookup {
    ingresses: Objects<Ingress>,
    services: Objects<Service>,
    endpoints: Objects<Endpoints>,
    secrets: Objects<Secret>,
    pub failing: AtomicBool,
}

impl FakeLookup {
    pub fn put_ingress(&self, ingress: Ingress) {
        let key = object_key(&ingress.metadata);
        self.ingresses.write().unwrap().insert(key, Arc::new(ingress));
    }

    pub fn remove_ingress(&self, key: &IngressKey) {
        self.ingresses
            .write()
            .unwrap()
            .remove(&(key.namespace.clone(), key.name.clone()));
    }

    pub fn put_service(&self, service: Service) {
        let key = object_key(&service.metadata);
        self.services.write().unwrap().insert(key, Arc::new(service));
    }

    pub fn put_endpoints(&self, endpoints: Endpoints) {
        let key = object_key(&endpoints.metadata);
        self.endpoints.write().unwrap().insert(key, Arc::new(endpoints));
    }

    pub fn put_secret(&self, secret: Secret) {
        let key = object_key(&secret.metadata);
        self.secrets.write().unwrap().insert(key, Arc::new(secret));
    }

    pub fn remove_secret(&self, secret: &SecretRef) {
        self.secrets
            .write()
            .unwrap()
            .remove(&(secret.namespace.clone(), secret.name.clone()));
    }

    fn check(&self) -> Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(Error::UnexpectedError("lookup failed".into()));
        }
        Ok(())
    }
}

fn get<K>(objects: &Objects<K>, namespace: &str, name: &str) -> Option<Arc<K>> {
    objects
        .read()
        .unwrap()
        .get(&(namespace.to_string(), name.to_string()))
        .cloned()
}

#[async_trait]
impl ResourceLookup for FakeLookup {
    async fn ingress(&self, key: &IngressKey) -> Result<Option<Arc<Ingress>>> {
        self.check()?;
        Ok(get(&self.ingresses, &key.namespace, &key.name))
    }

    async fn service(&self, namespace: &str, name: &str) -> Result<Option<Arc<Service>>> {
        self.check()?;
        Ok(get(&self.services, namespace, name))
    }

    async fn endpoints(&self, namespace: &str, name: &str) -> Result<Option<Arc<Endpoints>>> {
        self.check()?;
        Ok(get(&self.endpoints, namespace, name))
    }

    async fn secret(&self, secret: &SecretRef) -> Result<Option<Arc<Secret>>> {
        self.check()?;
        Ok(get(&self.secrets, &secret.namespace, &secret.name))
    }

    async fn ingress_keys(&self) -> Result<Vec<IngressKey>> {
        self.check()?;
        let mut keys: Vec<_> = self
            .ingresses
            .read()
            .unwrap()
            .keys()
            .map(|(namespace, name)| IngressKey::new(namespace, name))
            .collect();
        keys.sort();
        Ok(keys)
    }
}
