//! Warning events about the Ingresses the controller rejects or gives up on.

use std::sync::Arc;

use k8s_openapi::api::networking::v1::Ingress;
use kube::{
    Resource,
    runtime::events::{Event, EventType, Recorder, Reporter},
};
use log::debug;

///
/// Publishes Kubernetes Events on Ingress objects. Cheap to clone.
///
#[derive(Clone)]
pub struct SimpleEventRecorder {
    recorder: Arc<Recorder>,
}

impl SimpleEventRecorder {
    /// Creates a recorder that reports as `reporter`.
    ///
    /// # Example
    /// ```no_run
    /// # async fn run() -> Result<(), kube::Error> {
    /// use argot::simpleevent::SimpleEventRecorder;
    /// let client = kube::Client::try_default().await?;
    /// let events = SimpleEventRecorder::from_client(client, "argot-controller");
    /// # Ok(())
    /// # }
    /// ```
    pub fn from_client<R: Into<Reporter>>(client: kube::Client, reporter: R) -> Self {
        Self {
            recorder: Arc::new(Recorder::new(client, reporter.into())),
        }
    }

    /// Publishes a `Warning` with `reason` on the Ingress. Publish errors are only logged.
    pub async fn warn(&self, ingress: &Ingress, reason: &str, note: String) {
        let object_ref = ingress.object_ref(&());
        let event = Event {
            type_: EventType::Warning,
            reason: reason.into(),
            note: Some(note),
            action: "Reconcile".into(),
            secondary: None,
        };
        if let Err(e) = self.recorder.publish(&event, &object_ref).await {
            debug!(
                "Failed to publish `{reason}` event for Ingress `{}/{}`: {e}",
                object_ref.namespace.unwrap_or_default(),
                object_ref.name.unwrap_or_default()
            );
        }
    }
}
