//! The typed domain-event stream fed to the worker.
//!
//! One arm per event kind, dispatched by a single match in the worker loop.
//! The first six arms come from the informer streams; the rest are
//! self-enqueued by handlers and tickers so that periodic work shares the
//! queue's ordering and retry discipline.

use k8s_openapi::api::core::v1::{Endpoints, Service};

use super::ObjectKey;

#[derive(Clone, Debug, strum_macros::Display)]
pub enum Event {
    RemoteServiceCreated(Box<Service>),
    RemoteServiceUpdated(Box<Service>),
    RemoteServiceDeleted(Box<Service>),
    RemoteEndpointsCreated(Box<Endpoints>),
    RemoteEndpointsUpdated(Box<Endpoints>),
    LocalNamespaceAdded(String),

    RemoteServiceExported(Box<Service>),
    RemoteExportedServiceUpdated(ExportedServiceUpdate),
    RemoteServiceUnexported(ObjectKey),
    CreateFederatedService(Box<Service>),
    RemoteServiceJoinsFederatedService(Box<Service>),
    RemoteServiceLeavesFederatedService(ObjectKey),
    OrphanedServicesGcTriggered,
    RepairEndpoints,
    ClusterUnregistered,

    /// Queue sentinel; ends the worker loop after a drain.
    Stop,
}

/// Snapshot handed from export evaluation to the update handler: the cached
/// local pair plus the remote service that changed.
#[derive(Clone, Debug)]
pub struct ExportedServiceUpdate {
    pub local: Box<Service>,
    pub local_endpoints: Option<Box<Endpoints>>,
    pub remote: Box<Service>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_names_the_kind() {
        // Log lines key off the variant name.
        assert_eq!(Event::RepairEndpoints.to_string(), "RepairEndpoints");
        assert_eq!(
            Event::OrphanedServicesGcTriggered.to_string(),
            "OrphanedServicesGcTriggered"
        );
        assert_eq!(
            Event::LocalNamespaceAdded("ns1".to_string()).to_string(),
            "LocalNamespaceAdded"
        );
    }
}
