pub mod event;
pub mod gateway;
pub mod naming;
pub mod probe;
pub mod projection;
pub mod queue;
pub mod watcher;

use std::collections::BTreeMap;

use eyre::Report;
use kube::core::ErrorResponse;
use thiserror::Error;

/// Marks a local resource as created by this controller.
pub static MIRRORED_RESOURCE_LABEL: &str = "mirror.linkerd.io/mirrored-resource";
/// Names the linked cluster a local resource was mirrored from.
pub static CLUSTER_NAME_LABEL: &str = "mirror.linkerd.io/cluster-name";
/// Ties an endpoint mirror back to its parent headless mirror.
pub static HEADLESS_MIRROR_NAME_LABEL: &str = "mirror.linkerd.io/mirrored-headless-svc-name";
/// Marks a mirror whose endpoints are resolved against the remote cluster.
pub static REMOTE_DISCOVERY_LABEL: &str = "mirror.linkerd.io/remote-discovery";
/// Remote service a remote-discovery mirror resolves to.
pub static REMOTE_SERVICE_LABEL: &str = "mirror.linkerd.io/remote-svc";

pub static REMOTE_RESOURCE_VERSION_ANNOTATION: &str = "mirror.linkerd.io/remote-resource-version";
pub static REMOTE_FQ_NAME_ANNOTATION: &str = "mirror.linkerd.io/remote-svc-fq-name";
pub static GATEWAY_IDENTITY_ANNOTATION: &str = "mirror.linkerd.io/remote-gateway-identity";

/// Federated membership: the single local contributor.
pub static LOCAL_DISCOVERY_ANNOTATION: &str = "multicluster.linkerd.io/local-discovery";
/// Federated membership: comma-separated `svc@cluster` contributors.
pub static REMOTE_DISCOVERY_ANNOTATION: &str = "multicluster.linkerd.io/remote-discovery";

/// Set by Kubernetes on the Endpoints of headless services.
pub static HEADLESS_SERVICE_LABEL: &str = "service.kubernetes.io/headless";

/// Everything under these prefixes is controller-owned and never copied from
/// the remote cluster.
pub static RESERVED_PREFIXES: &[&str] = &["mirror.linkerd.io/", "multicluster.linkerd.io/"];

/// Topology hints only make sense within the cluster that computed them.
pub static SKIPPED_ANNOTATIONS: &[&str] = &[
    "service.kubernetes.io/topology-aware-hints",
    "service.kubernetes.io/topology-mode",
    "kubectl.kubernetes.io/last-applied-configuration",
];

pub static EVENT_SKIPPED_REASON: &str = "ServiceMirroringSkipped";
pub static EVENT_COMPONENT: &str = "service-mirror";

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ObjectKey {
    pub namespace: String,
    pub name: String,
}

impl std::fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

impl ObjectKey {
    pub fn of(resource: &impl kube::ResourceExt) -> Self {
        Self {
            namespace: resource.namespace().unwrap_or_default(),
            name: resource.name_any(),
        }
    }
}

/// Outcome of a single reconciliation pass.
#[derive(Debug, Error)]
pub enum ReconcileError {
    /// Transient failures. The work queue requeues these with a per-item
    /// rate limit until the requeue limit runs out.
    #[error("retryable: {}", .0.iter().map(ToString::to_string).collect::<Vec<_>>().join("; "))]
    Retryable(Vec<Report>),

    /// Logged and dropped without a requeue.
    #[error("{0}")]
    Terminal(Report),
}

impl ReconcileError {
    pub fn retryable(err: impl Into<Report>) -> Self {
        Self::Retryable(vec![err.into()])
    }

    pub fn terminal(err: impl Into<Report>) -> Self {
        Self::Terminal(err.into())
    }

    /// Collapses the partial failures of a sweep into a single error, or
    /// nothing if the sweep was clean.
    pub fn from_sweep(errors: Vec<Report>) -> Result<(), Self> {
        if errors.is_empty() {
            return Ok(());
        }

        Err(Self::Retryable(errors))
    }
}

impl From<kube::Error> for ReconcileError {
    fn from(err: kube::Error) -> Self {
        Self::retryable(err)
    }
}

pub(crate) trait Tolerate<T> {
    /// Swallows an API error response with the given code, yielding `None`.
    /// Deletes tolerate 404 and creates tolerate 409 so that replayed events
    /// stay idempotent.
    fn tolerate(self, code: u16) -> Result<Option<T>, kube::Error>;
}

impl<T> Tolerate<T> for Result<T, kube::Error> {
    fn tolerate(self, code: u16) -> Result<Option<T>, kube::Error> {
        match self {
            Ok(value) => Ok(Some(value)),
            Err(kube::Error::Api(ErrorResponse { code: got, .. })) if got == code => Ok(None),
            Err(err) => Err(err),
        }
    }
}

/// True iff the labels carry this controller's ownership pair for `target`.
pub(crate) fn owned_by(labels: &BTreeMap<String, String>, target: &str) -> bool {
    labels.get(MIRRORED_RESOURCE_LABEL).map(String::as_str) == Some("true")
        && labels.get(CLUSTER_NAME_LABEL).map(String::as_str) == Some(target)
}

/// Label selector matching every mirrored resource for `target`.
pub(crate) fn mirror_selector(target: &str) -> String {
    format!("{MIRRORED_RESOURCE_LABEL}=true,{CLUSTER_NAME_LABEL}={target}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ownership_requires_both_labels() {
        let mut labels = BTreeMap::from([(MIRRORED_RESOURCE_LABEL.to_string(), "true".to_string())]);
        assert!(!owned_by(&labels, "remote"));

        labels.insert(CLUSTER_NAME_LABEL.to_string(), "remote".to_string());
        assert!(owned_by(&labels, "remote"));
        assert!(!owned_by(&labels, "other"));
    }

    #[test]
    fn sweep_errors_collapse() {
        assert!(ReconcileError::from_sweep(vec![]).is_ok());

        let err = ReconcileError::from_sweep(vec![
            eyre::eyre!("first"),
            eyre::eyre!("second"),
        ])
        .unwrap_err();

        assert!(matches!(&err, ReconcileError::Retryable(inner) if inner.len() == 2));
        assert_eq!(err.to_string(), "retryable: first; second");
    }
}
