use std::{fmt, time::Duration};

pub mod config;
pub mod controller;
pub mod desired;
pub mod lookup;
pub mod metrics;
pub mod queue;
pub mod reconciler;
pub mod repair;
pub mod secret;
pub mod simpleevent;
pub mod store;
pub mod tags;
pub mod tunnel;
pub mod watch;
pub mod worker;

#[cfg(test)]
mod fixtures;

/// Annotation that selects the controller responsible for an Ingress.
pub const INGRESS_CLASS_ANNOTATION: &str = "kubernetes.io/ingress.class";

/// Key inside an origin secret that holds the origin certificate.
pub const ORIGIN_CERT_KEY: &str = "cert.pem";

pub const MANAGED_BY_LABEL: &str = "app.kubernetes.io/managed-by";
pub const FOR_INGRESS_LABEL: &str = "argot.io/for-ingress";
pub const FOR_NAMESPACE_LABEL: &str = "argot.io/for-namespace";
pub const HANDLE_LABEL: &str = "argot.io/handle";

/// Value of [`MANAGED_BY_LABEL`] on every object the controller creates.
pub const MANAGER_NAME: &str = "argot";

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("YAML Error: {0}")]
    YamlError(#[from] serde_yaml::Error),

    #[error("Kube Error: {0}")]
    KubeError(#[from] kube::Error),

    #[error("Metrics Error: {0}")]
    MetricsError(#[from] prometheus::Error),

    #[error("IO Error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Configuration Error: {0}")]
    ConfigError(String),

    #[error("Invalid Ingress: {0}")]
    InvalidSpec(String),

    #[error("no origin secret for host `{host}`")]
    NoOriginSecret { host: String },

    #[error("invalid secret reference `{0}`, expected <namespace>/<name>")]
    InvalidSecretRef(String),

    #[error("Tunnel Error: {0}")]
    TransportError(String),

    #[error("timed out: {0}")]
    Timeout(String),

    #[error("An unexpected error occurred: {0}")]
    UnexpectedError(String),
}

impl Error {
    /// Configuration and validation errors are only fixed by a change to the watched
    /// resources, so retrying them on a timer is pointless.
    pub fn is_config(&self) -> bool {
        matches!(
            self,
            Error::ConfigError(_) | Error::InvalidSpec(_) | Error::NoOriginSecret { .. } | Error::InvalidSecretRef(_)
        )
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

///
/// Identity of a reconcilable unit: the namespace and name of the source Ingress.
///
#[derive(Clone, Debug, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub struct IngressKey {
    pub namespace: String,
    pub name: String,
}

impl IngressKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for IngressKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// What the worker should do with a key after a reconcile pass.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Action {
    /// Nothing left to do until a watched resource changes or the next resync.
    AwaitChange,
    /// Hand the key to the repair scheduler, to be reconciled again after the delay.
    Repair(Duration),
}

#[async_trait::async_trait]
pub trait Reconcile: Send + Sync {
    /// Converge the actual tunnel state of `key` toward its desired state.
    ///
    /// Failures never escape this method; they are turned into state transitions and,
    /// where a retry makes sense, into [`Action::Repair`].
    async fn reconcile(&self, key: &IngressKey) -> Action;
}
