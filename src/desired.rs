//! Computing the desired tunnel configuration of an Ingress.

use std::collections::HashSet;

use k8s_openapi::api::{
    core::v1::{Endpoints, Service},
    networking::v1::{Ingress, IngressServiceBackend},
};
use log::debug;

use crate::{
    Error, INGRESS_CLASS_ANNOTATION, IngressKey, ORIGIN_CERT_KEY, Result,
    config::ControllerConfig,
    lookup::ResourceLookup,
    secret::{SecretRef, SecretResolver},
    tags::{Tag, build_tags},
};

///
/// Where traffic for one host goes, and which origin certificate authenticates it.
///
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HostRoute {
    pub host: String,
    pub service: String,
    pub port: u16,
    /// Origin URL handed to the tunnel, e.g. `http://web.shop.svc:8080`.
    pub url: String,
    pub origin_secret: SecretRef,
}

///
/// The tunnel configuration an Ingress asks for. Rebuilt on every reconcile; two specs
/// compare equal exactly when the live tunnel can be kept as is.
///
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DesiredTunnelSpec {
    pub key: IngressKey,
    pub routes: Vec<HostRoute>,
    pub tags: Vec<Tag>,
    pub class_matches: bool,
}

impl DesiredTunnelSpec {
    pub fn hosts(&self) -> impl Iterator<Item = &str> {
        self.routes.iter().map(|r| r.host.as_str())
    }
}

/// Returns true if the Ingress is assigned to `class`, by annotation or by
/// `spec.ingressClassName`.
pub fn class_matches(ingress: &Ingress, class: &str) -> bool {
    let annotated = ingress
        .metadata
        .annotations
        .as_ref()
        .and_then(|a| a.get(INGRESS_CLASS_ANNOTATION))
        .is_some_and(|c| c == class);
    let named = ingress
        .spec
        .as_ref()
        .and_then(|s| s.ingress_class_name.as_deref())
        .is_some_and(|c| c == class);
    annotated || named
}

/// The service backend of each host, in rule order, without duplicate hosts.
fn host_backends(ingress: &Ingress) -> Vec<(String, Option<&IngressServiceBackend>)> {
    let Some(spec) = ingress.spec.as_ref() else {
        return Vec::new();
    };
    let default_backend = spec.default_backend.as_ref().and_then(|b| b.service.as_ref());

    let mut seen = HashSet::new();
    let mut backends = Vec::new();
    for rule in spec.rules.iter().flatten() {
        let Some(host) = rule.host.as_deref().map(|h| h.trim().to_ascii_lowercase()) else {
            continue;
        };
        if host.is_empty() || !seen.insert(host.clone()) {
            continue;
        }
        let backend = rule
            .http
            .as_ref()
            .and_then(|http| http.paths.first())
            .and_then(|path| path.backend.service.as_ref())
            .or(default_backend);
        backends.push((host, backend));
    }
    backends
}

/// Names of all services an Ingress routes to.
pub fn backend_services(ingress: &Ingress) -> HashSet<String> {
    let mut services: HashSet<String> = host_backends(ingress)
        .into_iter()
        .filter_map(|(_, backend)| backend.map(|b| b.name.clone()))
        .collect();
    if let Some(default) = ingress
        .spec
        .as_ref()
        .and_then(|s| s.default_backend.as_ref())
        .and_then(|b| b.service.as_ref())
    {
        services.insert(default.name.clone());
    }
    services
}

/// Resolves the backend port against the ports the Service declares. Returns the port
/// number and whether the origin speaks TLS.
fn resolve_port(service: &Service, backend: &IngressServiceBackend) -> Result<(u16, bool)> {
    let port_ref = backend
        .port
        .as_ref()
        .ok_or_else(|| Error::InvalidSpec(format!("backend `{}` does not specify a port", backend.name)))?;
    let ports = service.spec.as_ref().and_then(|s| s.ports.as_ref());

    let declared = ports.into_iter().flatten().find(|p| match (&port_ref.number, &port_ref.name) {
        (Some(number), _) => p.port == *number,
        (None, Some(name)) => p.name.as_deref() == Some(name.as_str()),
        (None, None) => false,
    });
    let declared = declared.ok_or_else(|| {
        Error::InvalidSpec(format!(
            "service `{}` does not declare port {}",
            backend.name,
            port_ref
                .number
                .map(|n| n.to_string())
                .or_else(|| port_ref.name.clone())
                .unwrap_or_default()
        ))
    })?;

    let port = u16::try_from(declared.port)
        .map_err(|_| Error::InvalidSpec(format!("service `{}` port {} out of range", backend.name, declared.port)))?;
    let tls = port == 443 || declared.name.as_deref() == Some("https");
    Ok((port, tls))
}

///
/// Builds the desired spec for an Ingress that matches the configured class.
///
/// Validation problems (no hosts, missing service or port, no usable origin secret) come back
/// as configuration errors; failed lookups come back as they are.
///
/// Returns true if any subset lists a ready address.
pub fn has_ready_addresses(endpoints: &Endpoints) -> bool {
    endpoints
        .subsets
        .iter()
        .flatten()
        .any(|s| s.addresses.as_ref().is_some_and(|a| !a.is_empty()))
}

pub async fn build_spec(
    key: &IngressKey,
    ingress: &Ingress,
    config: &ControllerConfig,
    resolver: &SecretResolver,
    lookup: &dyn ResourceLookup,
) -> Result<DesiredTunnelSpec> {
    let backends = host_backends(ingress);
    if backends.is_empty() {
        return Err(Error::InvalidSpec("no rule declares a host".into()));
    }

    let mut routes = Vec::with_capacity(backends.len());
    for (host, backend) in backends {
        let backend =
            backend.ok_or_else(|| Error::InvalidSpec(format!("host `{host}` has no service backend")))?;

        let service = lookup
            .service(&key.namespace, &backend.name)
            .await?
            .ok_or_else(|| Error::InvalidSpec(format!("service `{}/{}` not found", key.namespace, backend.name)))?;
        let (port, tls) = resolve_port(&service, backend)?;

        let endpoints = lookup.endpoints(&key.namespace, &backend.name).await?;
        if !endpoints.as_deref().is_some_and(has_ready_addresses) {
            debug!("Service `{}/{}` for host `{host}` has no ready endpoints", key.namespace, backend.name);
        }

        let origin_secret = resolver.resolve(&host)?.clone();
        let secret = lookup
            .secret(&origin_secret)
            .await?
            .ok_or_else(|| Error::ConfigError(format!("origin secret `{origin_secret}` not found")))?;
        let has_cert = secret.data.as_ref().is_some_and(|d| d.contains_key(ORIGIN_CERT_KEY))
            || secret.string_data.as_ref().is_some_and(|d| d.contains_key(ORIGIN_CERT_KEY));
        if !has_cert {
            return Err(Error::ConfigError(format!(
                "origin secret `{origin_secret}` has no `{ORIGIN_CERT_KEY}` key"
            )));
        }

        let scheme = if tls { "https" } else { "http" };
        routes.push(HostRoute {
            url: format!("{scheme}://{}.{}.svc:{port}", backend.name, key.namespace),
            host,
            service: backend.name.clone(),
            port,
            origin_secret,
        });
    }

    Ok(DesiredTunnelSpec {
        key: key.clone(),
        routes,
        tags: build_tags(&ingress.metadata, &config.version, config.tag_limit),
        class_matches: class_matches(ingress, &config.ingress_class),
    })
}
