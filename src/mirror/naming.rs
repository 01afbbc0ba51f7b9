//! Deterministic mapping between remote names and their local shadows.

static DEFAULT_CLUSTER_DOMAIN: &str = "cluster.local";

/// Local name of the mirror for a remote service.
pub fn mirror(remote: &str, target: &str) -> String {
    format!("{remote}-{target}")
}

/// Local name of the endpoint mirror for one named address of a headless
/// service.
pub fn endpoint_mirror(hostname: &str, target: &str) -> String {
    format!("{hostname}-{target}")
}

/// Local name of the federated aggregate for a remote service.
pub fn federated(remote: &str) -> String {
    format!("{remote}-federated")
}

/// Remote origin of a local mirror name, `None` when the name was not minted
/// by [`mirror`] for this target.
pub fn origin(local: &str, target: &str) -> Option<String> {
    local
        .strip_suffix(target)
        .and_then(|prefix| prefix.strip_suffix('-'))
        .map(ToString::to_string)
}

/// Endpoints object fed to the gateway probe worker.
pub fn probe_gateway(target: &str) -> String {
    format!("probe-gateway-{target}")
}

/// Canonical DNS name of a service in the remote cluster.
pub fn remote_fq_name(name: &str, namespace: &str, domain: &str) -> String {
    let domain = if domain.is_empty() {
        DEFAULT_CLUSTER_DOMAIN
    } else {
        domain
    };

    format!("{name}.{namespace}.svc.{domain}")
}

/// Canonical DNS name of one named address of a headless service in the
/// remote cluster.
pub fn remote_endpoint_fq_name(hostname: &str, name: &str, namespace: &str, domain: &str) -> String {
    format!("{hostname}.{}", remote_fq_name(name, namespace, domain))
}

/// Federated membership entry, `svc@cluster`.
pub fn member(remote: &str, target: &str) -> String {
    format!("{remote}@{target}")
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[test]
    fn round_trips_through_origin() {
        assert_eq!(origin(&mirror("service-one", "remote"), "remote").as_deref(), Some("service-one"));
    }

    #[rstest]
    #[case("service-one-remote", "remote", Some("service-one"))]
    #[case("service-one-remote", "other", None)]
    #[case("remote", "remote", None)]
    #[case("pod-0-remote", "remote", Some("pod-0"))]
    fn origin_strips_the_target_suffix(
        #[case] local: &str,
        #[case] target: &str,
        #[case] expected: Option<&str>,
    ) {
        assert_eq!(origin(local, target).as_deref(), expected);
    }

    #[test]
    fn fq_names_fall_back_to_the_default_domain() {
        assert_eq!(
            remote_fq_name("service-one", "ns1", ""),
            "service-one.ns1.svc.cluster.local"
        );
        assert_eq!(
            remote_fq_name("service-one", "ns1", "east.example.com"),
            "service-one.ns1.svc.east.example.com"
        );
        assert_eq!(
            remote_endpoint_fq_name("pod-0", "service-one", "ns2", ""),
            "pod-0.service-one.ns2.svc.cluster.local"
        );
    }
}
