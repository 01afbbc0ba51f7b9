pub mod status;

use std::{collections::BTreeMap, time::Duration};

use chrono::{DateTime, Utc};
use eyre::{Result, WrapErr};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// One linked remote cluster: where its gateway lives, how to probe it, and
/// which of its services are eligible for mirroring or federation.
///
/// An empty `targetClusterName` denotes the local cluster and is only
/// meaningful for local federated membership.
#[derive(CustomResource, Clone, Debug, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "multicluster.linkerd.io",
    version = "v1alpha3",
    kind = "Link",
    namespaced,
    status = "LinkStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct LinkSpec {
    pub target_cluster_name: String,
    #[serde(default)]
    pub target_cluster_domain: String,
    /// Secret in the controller namespace holding a kubeconfig for the
    /// remote cluster.
    #[serde(default)]
    pub cluster_credentials_secret: String,
    /// Comma-separated list of gateway hostnames or IPs.
    #[serde(default)]
    pub gateway_address: String,
    #[serde(default)]
    pub gateway_port: u16,
    #[serde(default)]
    pub gateway_identity: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub probe_spec: Option<ProbeSpec>,
    /// Gateway-mode exports.
    #[serde(default)]
    pub selector: Selector,
    /// Remote-discovery exports.
    #[serde(default)]
    pub remote_discovery_selector: Selector,
    /// Federation membership.
    #[serde(default)]
    pub federated_service_selector: Selector,
}

#[derive(Clone, Debug, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ProbeSpec {
    pub path: String,
    pub port: u16,
    #[serde(default = "default_period")]
    pub period: String,
    #[serde(default = "default_timeout")]
    pub timeout: String,
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
}

fn default_period() -> String {
    "3s".to_string()
}

fn default_timeout() -> String {
    "30s".to_string()
}

fn default_failure_threshold() -> u32 {
    3
}

impl ProbeSpec {
    pub fn period(&self) -> Result<Duration> {
        humantime::parse_duration(&self.period).wrap_err("invalid probe period")
    }

    pub fn timeout(&self) -> Result<Duration> {
        humantime::parse_duration(&self.timeout).wrap_err("invalid probe timeout")
    }
}

/// Label selector with the matching rules inverted from the Kubernetes
/// default: an empty or absent selector matches *nothing*, never everything.
/// Eligibility is strictly opt-in.
#[derive(Clone, Debug, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Selector {
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub match_labels: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub match_expressions: Vec<MatchExpression>,
}

#[derive(Clone, Debug, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct MatchExpression {
    pub key: String,
    pub operator: Operator,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub values: Vec<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub enum Operator {
    In,
    NotIn,
    Exists,
    DoesNotExist,
}

impl Selector {
    pub fn is_empty(&self) -> bool {
        self.match_labels.is_empty() && self.match_expressions.is_empty()
    }

    pub fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        if self.is_empty() {
            return false;
        }

        if self
            .match_labels
            .iter()
            .any(|(key, value)| labels.get(key) != Some(value))
        {
            return false;
        }

        self.match_expressions.iter().all(|expr| {
            let value = labels.get(&expr.key);

            match expr.operator {
                Operator::In => value.is_some_and(|value| expr.values.contains(value)),
                Operator::NotIn => value.map_or(true, |value| !expr.values.contains(value)),
                Operator::Exists => value.is_some(),
                Operator::DoesNotExist => value.is_none(),
            }
        })
    }
}

impl From<BTreeMap<String, String>> for Selector {
    fn from(match_labels: BTreeMap<String, String>) -> Self {
        Self {
            match_labels,
            match_expressions: Vec::new(),
        }
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct LinkStatus {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub mirror_services: Vec<ServiceStatus>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub federated_services: Vec<ServiceStatus>,
}

/// Per-service slot in the Link status, keyed by the remote reference.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ServiceStatus {
    pub remote_ref: ResourceRef,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<MirrorCondition>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ResourceRef {
    pub name: String,
    pub namespace: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct MirrorCondition {
    #[serde(rename = "type")]
    pub type_: String,
    pub status: String,
    pub reason: ConditionReason,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
    pub last_transition_time: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_ref: Option<ResourceRef>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, JsonSchema, strum::Display)]
pub enum ConditionReason {
    Mirrored,
    InvalidService,
    Error,
    MissingNamespace,
}

static MIRRORED_CONDITION: &str = "Mirrored";

impl MirrorCondition {
    pub fn mirrored(local_ref: ResourceRef) -> Self {
        Self {
            type_: MIRRORED_CONDITION.to_string(),
            status: "True".to_string(),
            reason: ConditionReason::Mirrored,
            message: String::new(),
            last_transition_time: Utc::now(),
            local_ref: Some(local_ref),
        }
    }

    pub fn failed(reason: ConditionReason, message: impl Into<String>) -> Self {
        Self {
            type_: MIRRORED_CONDITION.to_string(),
            status: "False".to_string(),
            reason,
            message: message.into(),
            last_transition_time: Utc::now(),
            local_ref: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    fn labels(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(key, value)| ((*key).to_string(), (*value).to_string()))
            .collect()
    }

    #[test]
    fn empty_selectors_match_nothing() {
        let selector = Selector::default();

        assert!(!selector.matches(&BTreeMap::new()));
        assert!(!selector.matches(&labels(&[("mirror.linkerd.io/exported", "true")])));
    }

    #[test]
    fn match_labels_require_every_pair() {
        let selector = Selector::from(labels(&[("exported", "true"), ("tier", "web")]));

        assert!(selector.matches(&labels(&[("exported", "true"), ("tier", "web"), ("extra", "x")])));
        assert!(!selector.matches(&labels(&[("exported", "true")])));
        assert!(!selector.matches(&labels(&[("exported", "false"), ("tier", "web")])));
    }

    #[rstest]
    #[case(Operator::In, &["a", "b"], Some("a"), true)]
    #[case(Operator::In, &["a", "b"], Some("c"), false)]
    #[case(Operator::In, &["a", "b"], None, false)]
    #[case(Operator::NotIn, &["a"], Some("b"), true)]
    #[case(Operator::NotIn, &["a"], Some("a"), false)]
    #[case(Operator::NotIn, &["a"], None, true)]
    #[case(Operator::Exists, &[], Some("anything"), true)]
    #[case(Operator::Exists, &[], None, false)]
    #[case(Operator::DoesNotExist, &[], None, true)]
    #[case(Operator::DoesNotExist, &[], Some("anything"), false)]
    fn expressions(
        #[case] operator: Operator,
        #[case] values: &[&str],
        #[case] value: Option<&str>,
        #[case] expected: bool,
    ) {
        let selector = Selector {
            match_labels: BTreeMap::new(),
            match_expressions: vec![MatchExpression {
                key: "key".to_string(),
                operator,
                values: values.iter().map(ToString::to_string).collect(),
            }],
        };

        let labels = value.map_or_else(BTreeMap::new, |value| {
            BTreeMap::from([("key".to_string(), value.to_string())])
        });

        assert_eq!(selector.matches(&labels), expected);
    }

    #[test]
    fn probe_durations_parse() {
        let spec = ProbeSpec {
            path: "/ready".to_string(),
            port: 4191,
            period: "3s".to_string(),
            timeout: "30s".to_string(),
            failure_threshold: 3,
        };

        assert_eq!(spec.period().unwrap(), Duration::from_secs(3));
        assert_eq!(spec.timeout().unwrap(), Duration::from_secs(30));
    }
}
