//! Read-only access to the watched cluster resources.

use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::{
    core::v1::{Endpoints, Secret, Service},
    networking::v1::Ingress,
};

use crate::{IngressKey, Result, secret::SecretRef};

///
/// Lookups the reconciler performs against the latest observed cluster state. The engine
/// never writes through this interface.
///
#[async_trait]
pub trait ResourceLookup: Send + Sync {
    async fn ingress(&self, key: &IngressKey) -> Result<Option<Arc<Ingress>>>;

    async fn service(&self, namespace: &str, name: &str) -> Result<Option<Arc<Service>>>;

    async fn endpoints(&self, namespace: &str, name: &str) -> Result<Option<Arc<Endpoints>>>;

    async fn secret(&self, secret: &SecretRef) -> Result<Option<Arc<Secret>>>;

    /// Keys of every Ingress currently known, regardless of class.
    async fn ingress_keys(&self) -> Result<Vec<IngressKey>>;
}
