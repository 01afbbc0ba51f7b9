//! Gateway-backed mirror endpoints.
//!
//! Every write path funnels through [`Reconciler::write_gateway_endpoints`],
//! which consults gateway liveness at write time. Skipping that on any path
//! would briefly advertise a fresh mirror as ready while the gateway is down.

use std::{collections::BTreeMap, net::IpAddr};

use eyre::Report;
use k8s_openapi::api::core::v1::{
    EndpointAddress, EndpointPort, EndpointSubset, Endpoints, Service,
};
use kube::{
    api::{Api, ListParams, ObjectMeta, PostParams},
    runtime::reflector::ObjectRef,
    ResourceExt,
};

use super::Reconciler;
use crate::mirror::{
    mirror_selector, naming, projection, ReconcileError, Tolerate, HEADLESS_MIRROR_NAME_LABEL,
    REMOTE_DISCOVERY_LABEL,
};

static PROBE_PORT_NAME: &str = "mc-probe";

/// Builds the single subset of a gateway-backed mirror. A dead gateway moves
/// every address into `notReadyAddresses` so downstream proxies stop routing
/// without losing sight of the backends.
pub(crate) fn gateway_subset(
    addresses: &[IpAddr],
    ports: Vec<EndpointPort>,
    alive: bool,
) -> EndpointSubset {
    let addresses: Vec<EndpointAddress> = addresses
        .iter()
        .map(|ip| EndpointAddress {
            ip: ip.to_string(),
            ..Default::default()
        })
        .collect();

    let (ready, not_ready) = if alive {
        (Some(addresses), None)
    } else {
        (None, Some(addresses))
    };

    EndpointSubset {
        addresses: ready,
        not_ready_addresses: not_ready,
        ports: Some(ports),
    }
}

/// True when the remote side has nothing behind the service: either no
/// Endpoints object at all, or one with no ready addresses.
pub(crate) fn remote_is_empty(endpoints: Option<&Endpoints>) -> bool {
    endpoints.map_or(true, |endpoints| {
        endpoints.subsets.as_ref().map_or(true, |subsets| {
            subsets
                .iter()
                .all(|subset| subset.addresses.as_ref().map_or(true, Vec::is_empty))
        })
    })
}

impl Reconciler {
    /// Initial gateway endpoints for a freshly exported service.
    pub(crate) async fn create_gateway_endpoints(
        &self,
        remote: &Service,
    ) -> Result<(), ReconcileError> {
        let link = &self.settings.link;

        // No amount of retrying conjures up a gateway; only a Link change
        // (which restarts the watcher) can fix this.
        if link.gateway_address.is_empty() {
            return Err(ReconcileError::terminal(eyre::eyre!(
                "link {} has no gateway address",
                self.settings.link_name
            )));
        }

        let namespace = remote.namespace().unwrap_or_default();
        let mirror_name = naming::mirror(&remote.name_any(), self.target());

        let addresses = self.resolver.resolve(&link.gateway_address).await?;
        let ports =
            projection::endpoint_ports(&projection::service_ports(remote), link.gateway_port);

        self.write_gateway_endpoints(
            &namespace,
            &mirror_name,
            projection::endpoints_labels(link),
            &addresses,
            ports,
            false,
        )
        .await
    }

    /// The readiness-aware writer: creates or rewrites mirror endpoints with
    /// the given gateway addresses, preserving foreign annotations and
    /// stamping the gateway identity.
    pub(crate) async fn write_gateway_endpoints(
        &self,
        namespace: &str,
        name: &str,
        labels: BTreeMap<String, String>,
        addresses: &[IpAddr],
        ports: Vec<EndpointPort>,
        clear: bool,
    ) -> Result<(), ReconcileError> {
        let alive = *self.liveness.borrow();
        let subsets = if clear || addresses.is_empty() {
            Vec::new()
        } else {
            vec![gateway_subset(addresses, ports, alive)]
        };

        let annotations = projection::endpoints_annotations(&self.settings.link);
        let api = self.endpoints(namespace);

        match api.get_opt(name).await? {
            None => {
                let object = Endpoints {
                    metadata: ObjectMeta {
                        name: Some(name.to_string()),
                        namespace: Some(namespace.to_string()),
                        labels: Some(labels),
                        annotations: Some(annotations),
                        ..Default::default()
                    },
                    subsets: Some(subsets),
                };

                api.create(&PostParams::default(), &object)
                    .await
                    .tolerate(409)?;
            }
            Some(mut existing) => {
                let mut merged = existing.annotations().clone();
                merged.extend(annotations);

                existing.metadata.labels = Some(labels);
                existing.metadata.annotations = Some(merged);
                existing.subsets = Some(subsets);

                api.replace(name, &PostParams::default(), &existing).await?;
            }
        }

        Ok(())
    }

    /// Periodic repair: refresh the probe endpoints, then rewrite every
    /// gateway-backed mirror against the current gateway addresses and
    /// liveness. Partial failures are collected so one bad mirror does not
    /// shadow the rest of the sweep.
    pub(crate) async fn repair_endpoints(&self) -> Result<(), ReconcileError> {
        // Federation-only links have no gateway and nothing to repair.
        if self.settings.link.gateway_address.is_empty() {
            return Ok(());
        }

        let addresses = self
            .resolver
            .resolve(&self.settings.link.gateway_address)
            .await?;

        let mut errors: Vec<Report> = Vec::new();

        if let Err(err) = self.update_probe_endpoints(&addresses).await {
            errors.push(Report::new(err).wrap_err("updating probe endpoints"));
        }

        let selector = mirror_selector(self.target());
        let mirrors = Api::<Service>::all(self.local.clone())
            .list(&ListParams::default().labels(&selector))
            .await?;

        for mirror in mirrors {
            if projection::is_headless(&mirror)
                || mirror.labels().contains_key(REMOTE_DISCOVERY_LABEL)
            {
                continue;
            }

            if let Err(err) = self.repair_mirror(&mirror, &addresses).await {
                errors.push(Report::new(err));
            }
        }

        ReconcileError::from_sweep(errors)
    }

    async fn repair_mirror(
        &self,
        mirror: &Service,
        addresses: &[IpAddr],
    ) -> Result<(), ReconcileError> {
        let namespace = mirror.namespace().unwrap_or_default();
        let name = mirror.name_any();

        // Endpoint mirrors are named for a hostname; their remote origin is
        // the parent headless service.
        let parent = mirror.labels().get(HEADLESS_MIRROR_NAME_LABEL);
        let origin = match parent {
            Some(parent) => naming::origin(parent, self.target()),
            None => naming::origin(&name, self.target()),
        };

        let Some(origin) = origin else {
            return Ok(());
        };

        let remote = self
            .remote_endpoints
            .get(&ObjectRef::new(&origin).within(&namespace));

        let mut labels = projection::endpoints_labels(&self.settings.link);
        if let Some(parent) = parent {
            labels.insert(HEADLESS_MIRROR_NAME_LABEL.to_string(), parent.clone());
        }

        let ports = projection::endpoint_ports(
            &projection::service_ports(mirror),
            self.settings.link.gateway_port,
        );

        self.write_gateway_endpoints(
            &namespace,
            &name,
            labels,
            addresses,
            ports,
            remote_is_empty(remote.as_deref()),
        )
        .await
    }

    /// The probe worker's endpoints are always advertised ready: the probe
    /// itself is what drives the readiness of everything else.
    async fn update_probe_endpoints(&self, addresses: &[IpAddr]) -> Result<(), kube::Error> {
        let Some(probe) = &self.settings.link.probe_spec else {
            return Ok(());
        };

        let name = naming::probe_gateway(self.target());
        let ports = vec![EndpointPort {
            name: Some(PROBE_PORT_NAME.to_string()),
            port: i32::from(probe.port),
            protocol: Some("TCP".to_string()),
            app_protocol: None,
        }];

        let subsets = if addresses.is_empty() {
            Vec::new()
        } else {
            vec![gateway_subset(addresses, ports, true)]
        };

        let api = self.endpoints(&self.settings.namespace);

        match api.get_opt(&name).await? {
            None => {
                let object = Endpoints {
                    metadata: ObjectMeta {
                        name: Some(name.clone()),
                        namespace: Some(self.settings.namespace.clone()),
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
                api.replace(&name, &PostParams::default(), &existing).await?;
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ports() -> Vec<EndpointPort> {
        vec![
            EndpointPort {
                name: Some("port1".to_string()),
                port: 888,
                protocol: Some("TCP".to_string()),
                app_protocol: None,
            },
            EndpointPort {
                name: Some("port2".to_string()),
                port: 888,
                protocol: Some("TCP".to_string()),
                app_protocol: None,
            },
        ]
    }

    #[test]
    fn live_gateways_are_advertised_ready() {
        let subset = gateway_subset(&["192.0.2.127".parse().unwrap()], ports(), true);

        let addresses = subset.addresses.unwrap();
        assert_eq!(addresses.len(), 1);
        assert_eq!(addresses[0].ip, "192.0.2.127");
        assert!(subset.not_ready_addresses.is_none());

        let ports = subset.ports.unwrap();
        assert!(ports.iter().all(|port| port.port == 888));
    }

    #[test]
    fn dead_gateways_move_every_address_to_not_ready() {
        let subset = gateway_subset(&["192.0.2.127".parse().unwrap()], ports(), false);

        assert!(subset.addresses.is_none());
        let not_ready = subset.not_ready_addresses.unwrap();
        assert_eq!(not_ready.len(), 1);
        assert_eq!(not_ready[0].ip, "192.0.2.127");
    }

    #[test]
    fn remote_emptiness() {
        assert!(remote_is_empty(None));

        let no_subsets = Endpoints {
            metadata: ObjectMeta::default(),
            subsets: None,
        };
        assert!(remote_is_empty(Some(&no_subsets)));

        let not_ready_only = Endpoints {
            metadata: ObjectMeta::default(),
            subsets: Some(vec![EndpointSubset {
                addresses: None,
                not_ready_addresses: Some(vec![EndpointAddress {
                    ip: "192.0.0.1".to_string(),
                    ..Default::default()
                }]),
                ports: None,
            }]),
        };
        assert!(remote_is_empty(Some(&not_ready_only)));

        let ready = Endpoints {
            metadata: ObjectMeta::default(),
            subsets: Some(vec![EndpointSubset {
                addresses: Some(vec![EndpointAddress {
                    ip: "192.0.0.1".to_string(),
                    ..Default::default()
                }]),
                not_ready_addresses: None,
                ports: None,
            }]),
        };
        assert!(!remote_is_empty(Some(&ready)));
    }
}
