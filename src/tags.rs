//! Descriptive tags attached to every tunnel.

use std::fmt;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

pub const NAMESPACE_TAG: &str = "k8s.namespace";
pub const INGRESS_TAG: &str = "k8s.ingress";
pub const VERSION_TAG: &str = "argot.version";
pub const LABEL_TAG_PREFIX: &str = "k8s.label.";

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Tag {
    pub name: String,
    pub value: String,
}

impl Tag {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

impl fmt::Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}={}", self.name, self.value)
    }
}

///
/// Builds the tag list for an Ingress, most significant first, cut to `limit` entries.
///
/// Precedence: namespace, name, controller version, then one tag per Ingress label in
/// ascending label-key order. Truncation always keeps a prefix of that order, so the same
/// metadata always produces the same tags.
///
pub fn build_tags(metadata: &ObjectMeta, version: &str, limit: usize) -> Vec<Tag> {
    let mut tags = vec![
        Tag::new(NAMESPACE_TAG, metadata.namespace.clone().unwrap_or_default()),
        Tag::new(INGRESS_TAG, metadata.name.clone().unwrap_or_default()),
        Tag::new(VERSION_TAG, version),
    ];

    // BTreeMap iteration is already sorted by key.
    if let Some(labels) = &metadata.labels {
        tags.extend(
            labels
                .iter()
                .map(|(key, value)| Tag::new(format!("{LABEL_TAG_PREFIX}{key}"), value.clone())),
        );
    }

    tags.truncate(limit);
    tags
}
