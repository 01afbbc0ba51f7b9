//! Computes the local shadow of a remote service: which labels and
//! annotations carry over, which are controller-owned, and how ports map
//! onto the gateway.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{EndpointPort, Service, ServicePort, ServiceSpec};
use kube::{api::ObjectMeta, ResourceExt};

use super::{
    naming, CLUSTER_NAME_LABEL, GATEWAY_IDENTITY_ANNOTATION, HEADLESS_MIRROR_NAME_LABEL,
    LOCAL_DISCOVERY_ANNOTATION, MIRRORED_RESOURCE_LABEL, REMOTE_DISCOVERY_ANNOTATION,
    REMOTE_DISCOVERY_LABEL, REMOTE_FQ_NAME_ANNOTATION, REMOTE_RESOURCE_VERSION_ANNOTATION,
    REMOTE_SERVICE_LABEL, RESERVED_PREFIXES, SKIPPED_ANNOTATIONS,
};
use crate::link::LinkSpec;

pub(crate) static CLUSTER_IP_NONE: &str = "None";

pub(crate) fn is_headless(service: &Service) -> bool {
    service
        .spec
        .as_ref()
        .and_then(|spec| spec.cluster_ip.as_deref())
        == Some(CLUSTER_IP_NONE)
}

fn reserved(key: &str) -> bool {
    RESERVED_PREFIXES.iter().any(|prefix| key.starts_with(prefix))
}

fn copied_labels(remote: &Service) -> BTreeMap<String, String> {
    remote
        .labels()
        .iter()
        .filter(|(key, _)| !reserved(key))
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect()
}

fn copied_annotations(remote: &Service) -> BTreeMap<String, String> {
    remote
        .annotations()
        .iter()
        .filter(|(key, _)| !reserved(key) && !SKIPPED_ANNOTATIONS.contains(&key.as_str()))
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect()
}

pub fn mirror_labels(remote: &Service, link: &LinkSpec, remote_discovery: bool) -> BTreeMap<String, String> {
    let mut labels = copied_labels(remote);
    labels.insert(MIRRORED_RESOURCE_LABEL.to_string(), "true".to_string());
    labels.insert(
        CLUSTER_NAME_LABEL.to_string(),
        link.target_cluster_name.clone(),
    );

    if remote_discovery {
        labels.insert(
            REMOTE_DISCOVERY_LABEL.to_string(),
            link.target_cluster_name.clone(),
        );
        labels.insert(REMOTE_SERVICE_LABEL.to_string(), remote.name_any());
    }

    labels
}

pub fn mirror_annotations(remote: &Service, link: &LinkSpec) -> BTreeMap<String, String> {
    let mut annotations = copied_annotations(remote);
    annotations.insert(
        REMOTE_RESOURCE_VERSION_ANNOTATION.to_string(),
        remote.resource_version().unwrap_or_default(),
    );
    annotations.insert(
        REMOTE_FQ_NAME_ANNOTATION.to_string(),
        naming::remote_fq_name(
            &remote.name_any(),
            &remote.namespace().unwrap_or_default(),
            &link.target_cluster_domain,
        ),
    );

    annotations
}

/// Remote service ports carried onto a local shadow. NodePorts are an
/// allocation in the remote cluster and never carry over.
pub fn service_ports(remote: &Service) -> Vec<ServicePort> {
    remote
        .spec
        .as_ref()
        .and_then(|spec| spec.ports.clone())
        .unwrap_or_default()
        .into_iter()
        .map(|port| ServicePort {
            node_port: None,
            ..port
        })
        .collect()
}

/// Endpoint ports for a gateway-backed mirror: one per remote service port,
/// name and protocol preserved, every `port` rewritten to the gateway port.
pub fn endpoint_ports(ports: &[ServicePort], gateway_port: u16) -> Vec<EndpointPort> {
    ports
        .iter()
        .map(|port| EndpointPort {
            name: port.name.clone(),
            port: i32::from(gateway_port),
            protocol: port.protocol.clone(),
            app_protocol: port.app_protocol.clone(),
        })
        .collect()
}

pub fn mirror_service(
    remote: &Service,
    link: &LinkSpec,
    remote_discovery: bool,
    headless: bool,
) -> Service {
    Service {
        metadata: ObjectMeta {
            name: Some(naming::mirror(&remote.name_any(), &link.target_cluster_name)),
            namespace: remote.namespace(),
            labels: Some(mirror_labels(remote, link, remote_discovery)),
            annotations: Some(mirror_annotations(remote, link)),
            ..Default::default()
        },
        spec: Some(ServiceSpec {
            ports: Some(service_ports(remote)),
            cluster_ip: headless.then(|| CLUSTER_IP_NONE.to_string()),
            ..Default::default()
        }),
        status: None,
    }
}

/// ClusterIP service standing in for one named address of a headless export.
pub fn endpoint_mirror_service(
    remote: &Service,
    hostname: &str,
    parent_mirror: &str,
    link: &LinkSpec,
) -> Service {
    let labels = BTreeMap::from([
        (MIRRORED_RESOURCE_LABEL.to_string(), "true".to_string()),
        (
            CLUSTER_NAME_LABEL.to_string(),
            link.target_cluster_name.clone(),
        ),
        (
            HEADLESS_MIRROR_NAME_LABEL.to_string(),
            parent_mirror.to_string(),
        ),
    ]);

    let annotations = BTreeMap::from([
        (
            REMOTE_RESOURCE_VERSION_ANNOTATION.to_string(),
            remote.resource_version().unwrap_or_default(),
        ),
        (
            REMOTE_FQ_NAME_ANNOTATION.to_string(),
            naming::remote_endpoint_fq_name(
                hostname,
                &remote.name_any(),
                &remote.namespace().unwrap_or_default(),
                &link.target_cluster_domain,
            ),
        ),
    ]);

    Service {
        metadata: ObjectMeta {
            name: Some(naming::endpoint_mirror(
                hostname,
                &link.target_cluster_name,
            )),
            namespace: remote.namespace(),
            labels: Some(labels),
            annotations: Some(annotations),
            ..Default::default()
        },
        spec: Some(ServiceSpec {
            ports: Some(service_ports(remote)),
            ..Default::default()
        }),
        status: None,
    }
}

/// The aggregate a remote service joins. Membership lives entirely in the
/// two discovery annotations; the service itself never has endpoints.
pub fn federated_service(remote: &Service, link: &LinkSpec) -> Service {
    let mut labels = copied_labels(remote);
    labels.insert(MIRRORED_RESOURCE_LABEL.to_string(), "true".to_string());

    let mut annotations = copied_annotations(remote);
    let (key, value) = initial_membership(&remote.name_any(), &link.target_cluster_name);
    annotations.insert(key.to_string(), value);

    Service {
        metadata: ObjectMeta {
            name: Some(naming::federated(&remote.name_any())),
            namespace: remote.namespace(),
            labels: Some(labels),
            annotations: Some(annotations),
            ..Default::default()
        },
        spec: Some(ServiceSpec {
            ports: Some(service_ports(remote)),
            ..Default::default()
        }),
        status: None,
    }
}

pub(crate) fn initial_membership(remote: &str, target: &str) -> (&'static str, String) {
    if target.is_empty() {
        (LOCAL_DISCOVERY_ANNOTATION, remote.to_string())
    } else {
        (
            REMOTE_DISCOVERY_ANNOTATION,
            naming::member(remote, target),
        )
    }
}

/// Ownership labels stamped onto every local object written for this link.
pub fn endpoints_labels(link: &LinkSpec) -> BTreeMap<String, String> {
    BTreeMap::from([
        (MIRRORED_RESOURCE_LABEL.to_string(), "true".to_string()),
        (
            CLUSTER_NAME_LABEL.to_string(),
            link.target_cluster_name.clone(),
        ),
    ])
}

/// Annotations carried by gateway-backed mirror endpoints.
pub fn endpoints_annotations(link: &LinkSpec) -> BTreeMap<String, String> {
    let mut annotations = BTreeMap::new();

    if !link.gateway_identity.is_empty() {
        annotations.insert(
            GATEWAY_IDENTITY_ANNOTATION.to_string(),
            link.gateway_identity.clone(),
        );
    }

    annotations
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::Selector;

    fn link(target: &str) -> LinkSpec {
        LinkSpec {
            target_cluster_name: target.to_string(),
            target_cluster_domain: String::new(),
            cluster_credentials_secret: String::new(),
            gateway_address: "192.0.2.127".to_string(),
            gateway_port: 888,
            gateway_identity: "gateway.identity".to_string(),
            probe_spec: None,
            selector: Selector::default(),
            remote_discovery_selector: Selector::default(),
            federated_service_selector: Selector::default(),
        }
    }

    fn remote_service(name: &str, namespace: &str) -> Service {
        Service {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some(namespace.to_string()),
                resource_version: Some("222".to_string()),
                labels: Some(BTreeMap::from([
                    ("mirror.linkerd.io/exported".to_string(), "true".to_string()),
                    ("app".to_string(), "web".to_string()),
                ])),
                annotations: Some(BTreeMap::from([
                    (
                        "config.linkerd.io/opaque-ports".to_string(),
                        "555".to_string(),
                    ),
                    (
                        "service.kubernetes.io/topology-aware-hints".to_string(),
                        "Auto".to_string(),
                    ),
                    (
                        "multicluster.linkerd.io/remote-discovery".to_string(),
                        "stale".to_string(),
                    ),
                ])),
                ..Default::default()
            },
            spec: Some(ServiceSpec {
                ports: Some(vec![
                    ServicePort {
                        name: Some("port1".to_string()),
                        port: 555,
                        protocol: Some("TCP".to_string()),
                        node_port: Some(32111),
                        ..Default::default()
                    },
                    ServicePort {
                        name: Some("port2".to_string()),
                        port: 666,
                        protocol: Some("TCP".to_string()),
                        ..Default::default()
                    },
                ]),
                ..Default::default()
            }),
            status: None,
        }
    }

    #[test]
    fn mirrors_carry_ownership_and_drop_reserved_keys() {
        let mirror = mirror_service(&remote_service("service-one", "ns1"), &link("remote"), false, false);

        assert_eq!(mirror.metadata.name.as_deref(), Some("service-one-remote"));

        let labels = mirror.metadata.labels.unwrap();
        assert_eq!(labels.get(MIRRORED_RESOURCE_LABEL).map(String::as_str), Some("true"));
        assert_eq!(labels.get(CLUSTER_NAME_LABEL).map(String::as_str), Some("remote"));
        assert_eq!(labels.get("app").map(String::as_str), Some("web"));
        assert!(!labels.contains_key("mirror.linkerd.io/exported"));

        let annotations = mirror.metadata.annotations.unwrap();
        assert_eq!(
            annotations.get(REMOTE_RESOURCE_VERSION_ANNOTATION).map(String::as_str),
            Some("222")
        );
        assert_eq!(
            annotations.get(REMOTE_FQ_NAME_ANNOTATION).map(String::as_str),
            Some("service-one.ns1.svc.cluster.local")
        );
        assert_eq!(
            annotations.get("config.linkerd.io/opaque-ports").map(String::as_str),
            Some("555")
        );
        assert!(!annotations.contains_key("service.kubernetes.io/topology-aware-hints"));
        assert!(!annotations.contains_key("multicluster.linkerd.io/remote-discovery"));
    }

    #[test]
    fn mirror_ports_drop_node_ports() {
        let mirror = mirror_service(&remote_service("service-one", "ns1"), &link("remote"), false, false);

        let ports = mirror.spec.unwrap().ports.unwrap();
        assert_eq!(ports.len(), 2);
        assert_eq!(ports[0].port, 555);
        assert_eq!(ports[0].node_port, None);
        assert_eq!(ports[1].port, 666);
    }

    #[test]
    fn remote_discovery_mirrors_are_labeled_for_resolution() {
        let mirror = mirror_service(&remote_service("service-one", "ns1"), &link("remote"), true, false);

        let labels = mirror.metadata.labels.unwrap();
        assert_eq!(labels.get(REMOTE_DISCOVERY_LABEL).map(String::as_str), Some("remote"));
        assert_eq!(labels.get(REMOTE_SERVICE_LABEL).map(String::as_str), Some("service-one"));
    }

    #[test]
    fn endpoint_ports_rewrite_onto_the_gateway() {
        let remote = remote_service("service-one", "ns1");
        let ports = endpoint_ports(&service_ports(&remote), 888);

        assert_eq!(ports.len(), 2);
        assert_eq!(ports[0].name.as_deref(), Some("port1"));
        assert_eq!(ports[0].port, 888);
        assert_eq!(ports[0].protocol.as_deref(), Some("TCP"));
        assert_eq!(ports[1].name.as_deref(), Some("port2"));
        assert_eq!(ports[1].port, 888);
    }

    #[test]
    fn endpoint_mirrors_link_back_to_their_parent() {
        let service = endpoint_mirror_service(
            &remote_service("service-one", "ns2"),
            "pod-0",
            "service-one-remote",
            &link("remote"),
        );

        assert_eq!(service.metadata.name.as_deref(), Some("pod-0-remote"));

        let labels = service.metadata.labels.unwrap();
        assert_eq!(
            labels.get(HEADLESS_MIRROR_NAME_LABEL).map(String::as_str),
            Some("service-one-remote")
        );

        let annotations = service.metadata.annotations.unwrap();
        assert_eq!(
            annotations.get(REMOTE_FQ_NAME_ANNOTATION).map(String::as_str),
            Some("pod-0.service-one.ns2.svc.cluster.local")
        );

        // Unremapped: traffic addressed to one backend keeps the original port.
        let ports = service.spec.unwrap().ports.unwrap();
        assert_eq!(ports[0].port, 555);
        assert_eq!(ports[1].port, 666);
    }

    #[test]
    fn federated_services_start_with_their_creator_as_the_only_member() {
        let service = federated_service(&remote_service("service-one", "ns1"), &link("remote"));

        assert_eq!(service.metadata.name.as_deref(), Some("service-one-federated"));

        let labels = service.metadata.labels.clone().unwrap();
        assert_eq!(labels.get(MIRRORED_RESOURCE_LABEL).map(String::as_str), Some("true"));
        assert!(!labels.contains_key(CLUSTER_NAME_LABEL));

        let annotations = service.metadata.annotations.unwrap();
        assert_eq!(
            annotations.get(REMOTE_DISCOVERY_ANNOTATION).map(String::as_str),
            Some("service-one@remote")
        );

        let (key, value) = initial_membership("service-one", "");
        assert_eq!(key, LOCAL_DISCOVERY_ANNOTATION);
        assert_eq!(value, "service-one");
    }

    #[test]
    fn headless_mirrors_pin_the_cluster_ip_sentinel() {
        let mirror = mirror_service(&remote_service("service-one", "ns2"), &link("remote"), false, true);

        assert_eq!(
            mirror.spec.unwrap().cluster_ip.as_deref(),
            Some(CLUSTER_IP_NONE)
        );
    }
}
