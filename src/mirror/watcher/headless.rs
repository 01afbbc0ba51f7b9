//! Headless fan-out.
//!
//! A headless export becomes a headless mirror plus one ClusterIP "endpoint
//! mirror" service per named remote address. The headless mirror's subsets
//! point each hostname at its endpoint mirror's ClusterIP; the endpoint
//! mirrors point at the gateway, which carries the hostname along.

use std::collections::BTreeMap;

use eyre::{eyre, Report};
use k8s_openapi::api::core::v1::{EndpointAddress, EndpointSubset, Endpoints, Service};
use kube::{
    api::{DeleteParams, ListParams, ObjectMeta, PostParams},
    runtime::reflector::ObjectRef,
    ResourceExt,
};

use super::Reconciler;
use crate::{
    link::{ConditionReason, MirrorCondition, ResourceRef},
    mirror::{
        naming, projection, ObjectKey, ReconcileError, Tolerate, HEADLESS_MIRROR_NAME_LABEL,
        HEADLESS_SERVICE_LABEL,
    },
};

/// Any address with a hostname is enough to warrant per-endpoint mirrors.
pub(crate) fn has_named_address(subsets: &[EndpointSubset]) -> bool {
    subsets.iter().any(|subset| {
        subset
            .addresses
            .iter()
            .flatten()
            .any(|address| address.hostname.as_deref().is_some_and(|h| !h.is_empty()))
    })
}

/// Rewrites remote subsets into the headless mirror's: one address per named
/// hostname, resolving to the matching endpoint mirror's ClusterIP, with the
/// remote's original (unremapped) ports.
pub(crate) fn headless_subsets(
    remote_subsets: &[EndpointSubset],
    cluster_ips: &BTreeMap<String, String>,
) -> Vec<EndpointSubset> {
    remote_subsets
        .iter()
        .filter_map(|subset| {
            let addresses: Vec<EndpointAddress> = subset
                .addresses
                .iter()
                .flatten()
                .filter_map(|address| {
                    let hostname = address.hostname.as_deref().filter(|h| !h.is_empty())?;
                    let ip = cluster_ips.get(hostname)?;

                    Some(EndpointAddress {
                        hostname: Some(hostname.to_string()),
                        ip: ip.clone(),
                        ..Default::default()
                    })
                })
                .collect();

            if addresses.is_empty() {
                return None;
            }

            Some(EndpointSubset {
                addresses: Some(addresses),
                not_ready_addresses: None,
                ports: subset.ports.clone(),
            })
        })
        .collect()
}

impl Reconciler {
    /// Remote endpoints changed for an exported service; drive the headless
    /// fan-out. Non-headless endpoints are of no interest here: their
    /// mirrors are repaired from gateway state alone.
    pub(crate) async fn remote_endpoints_changed(
        &self,
        endpoints: &Endpoints,
    ) -> Result<(), ReconcileError> {
        if !endpoints.labels().contains_key(HEADLESS_SERVICE_LABEL)
            || !self.settings.headless_enabled
        {
            return Ok(());
        }

        let namespace = endpoints.namespace().unwrap_or_default();
        let name = endpoints.name_any();

        let Some(remote) = self
            .remote_services
            .get(&ObjectRef::new(&name).within(&namespace))
        else {
            return Ok(());
        };
        let remote = remote.as_ref();

        if projection::service_ports(remote).is_empty() {
            self.skip_event(remote, "exported headless service has no ports")
                .await;
            return Ok(());
        }

        let key = ObjectKey::of(remote);
        let mirror_name = naming::mirror(&name, self.target());
        let services = self.services(&namespace);
        let subsets = endpoints.subsets.clone().unwrap_or_default();

        match services.get_opt(&mirror_name).await? {
            None => {
                // Nothing to mirror yet; wait for addresses to show up.
                if subsets.is_empty() {
                    return Ok(());
                }

                if !self.ensure_namespace(remote).await? {
                    self.status
                        .record_mirror(
                            &key,
                            MirrorCondition::failed(
                                ConditionReason::MissingNamespace,
                                format!("namespace {namespace} does not exist"),
                            ),
                        )
                        .await?;
                    return Ok(());
                }

                if !has_named_address(&subsets) {
                    // No hostnames to fan out over; a plain ClusterIP mirror
                    // through the gateway is all we can offer.
                    let mirror =
                        projection::mirror_service(remote, &self.settings.link, false, false);
                    services
                        .create(&PostParams::default(), &mirror)
                        .await
                        .tolerate(409)?;
                    self.create_gateway_endpoints(remote).await?;
                    self.record_headless_mirrored(&key, &mirror_name).await?;
                    return Ok(());
                }

                let mirror = projection::mirror_service(remote, &self.settings.link, false, true);
                services
                    .create(&PostParams::default(), &mirror)
                    .await
                    .tolerate(409)?;
            }
            Some(local) if !projection::is_headless(&local) => {
                // The ClusterIP fallback above; only headless mirrors fan out.
                return Ok(());
            }
            Some(_) => {}
        }

        let gateway = self
            .resolver
            .resolve(&self.settings.link.gateway_address)
            .await?;

        let mut cluster_ips: BTreeMap<String, String> = BTreeMap::new();
        let mut errors: Vec<Report> = Vec::new();

        for address in subsets.iter().flat_map(|subset| subset.addresses.iter().flatten()) {
            let Some(hostname) = address.hostname.as_deref().filter(|h| !h.is_empty()) else {
                continue;
            };

            if cluster_ips.contains_key(hostname) {
                continue;
            }

            match self
                .ensure_endpoint_mirror(remote, hostname, &mirror_name, &gateway)
                .await
            {
                Ok(cluster_ip) => {
                    cluster_ips.insert(hostname.to_string(), cluster_ip);
                }
                Err(err) => errors.push(Report::new(err).wrap_err(format!(
                    "creating endpoint mirror for {namespace}/{hostname}"
                ))),
            }
        }

        self.write_headless_endpoints(
            &namespace,
            &mirror_name,
            headless_subsets(&subsets, &cluster_ips),
        )
        .await?;

        if let Err(err) = self.delete_stale_endpoint_mirrors(&namespace, &mirror_name, &cluster_ips).await {
            errors.push(Report::new(err));
        }

        self.record_headless_mirrored(&key, &mirror_name).await?;

        ReconcileError::from_sweep(errors)
    }

    /// Makes sure `<hostname>-<target>` exists with gateway-pointing
    /// endpoints and returns its ClusterIP. Creation is
    /// transactional-by-compensation: a service whose endpoints cannot be
    /// written is deleted rather than left to blackhole traffic.
    async fn ensure_endpoint_mirror(
        &self,
        remote: &Service,
        hostname: &str,
        parent: &str,
        gateway: &[std::net::IpAddr],
    ) -> Result<String, ReconcileError> {
        let namespace = remote.namespace().unwrap_or_default();
        let name = naming::endpoint_mirror(hostname, self.target());
        let services = self.services(&namespace);

        if let Some(existing) = services.get_opt(&name).await? {
            return cluster_ip(&existing, &namespace, &name);
        }

        let service = projection::endpoint_mirror_service(remote, hostname, parent, &self.settings.link);
        let created = match services
            .create(&PostParams::default(), &service)
            .await
            .tolerate(409)?
        {
            Some(created) => created,
            // Lost a race with an earlier attempt; the service is there.
            None => services.get(&name).await?,
        };

        let mut labels = projection::endpoints_labels(&self.settings.link);
        labels.insert(HEADLESS_MIRROR_NAME_LABEL.to_string(), parent.to_string());

        let ports = projection::endpoint_ports(
            &projection::service_ports(remote),
            self.settings.link.gateway_port,
        );

        if let Err(err) = self
            .write_gateway_endpoints(&namespace, &name, labels, gateway, ports, false)
            .await
        {
            services
                .delete(&name, &DeleteParams::default())
                .await
                .tolerate(404)?;
            return Err(err);
        }

        cluster_ip(&created, &namespace, &name)
    }

    async fn write_headless_endpoints(
        &self,
        namespace: &str,
        name: &str,
        subsets: Vec<EndpointSubset>,
    ) -> Result<(), ReconcileError> {
        let api = self.endpoints(namespace);

        match api.get_opt(name).await? {
            None => {
                let object = Endpoints {
                    metadata: ObjectMeta {
                        name: Some(name.to_string()),
                        namespace: Some(namespace.to_string()),
                        labels: Some(projection::endpoints_labels(&self.settings.link)),
                        ..Default::default()
                    },
                    subsets: Some(subsets),
                };

                api.create(&PostParams::default(), &object)
                    .await
                    .tolerate(409)?;
            }
            Some(mut existing) => {
                existing.subsets = Some(subsets);
                api.replace(name, &PostParams::default(), &existing).await?;
            }
        }

        Ok(())
    }

    /// Endpoint mirrors whose hostname left the remote endpoints are
    /// deleted. The list is keyed on the parent label alone, so a race with
    /// a sibling watcher collapses to at-most-one successful delete.
    async fn delete_stale_endpoint_mirrors(
        &self,
        namespace: &str,
        parent: &str,
        cluster_ips: &BTreeMap<String, String>,
    ) -> Result<(), kube::Error> {
        let services = self.services(namespace);
        let selector = format!("{HEADLESS_MIRROR_NAME_LABEL}={parent}");
        let existing = services
            .list(&ListParams::default().labels(&selector))
            .await?;

        for service in existing {
            let name = service.name_any();
            let keep = naming::origin(&name, self.target())
                .is_some_and(|hostname| cluster_ips.contains_key(&hostname));

            if !keep {
                tracing::info!(service = %ObjectKey { namespace: namespace.to_string(), name: name.clone() }, "deleting stale endpoint mirror");
                services
                    .delete(&name, &DeleteParams::default())
                    .await
                    .tolerate(404)?;
            }
        }

        Ok(())
    }

    async fn record_headless_mirrored(
        &self,
        key: &ObjectKey,
        mirror_name: &str,
    ) -> Result<(), ReconcileError> {
        self.status
            .record_mirror(
                key,
                MirrorCondition::mirrored(ResourceRef {
                    name: mirror_name.to_string(),
                    namespace: key.namespace.clone(),
                }),
            )
            .await?;

        Ok(())
    }
}

fn cluster_ip(service: &Service, namespace: &str, name: &str) -> Result<String, ReconcileError> {
    service
        .spec
        .as_ref()
        .and_then(|spec| spec.cluster_ip.clone())
        .filter(|ip| !ip.is_empty())
        .ok_or_else(|| {
            ReconcileError::retryable(eyre!("cluster ip for {namespace}/{name} not yet allocated"))
        })
}
