//! Per-service status conditions on the Link object.
//!
//! Sibling controllers patch the same lists concurrently, so writes go out as
//! JSON merge-patches of one whole list, recomputed from a fresh read. Two
//! controllers touching distinct `(name, namespace)` entries do not conflict.

use kube::{
    api::{Api, Patch, PatchParams},
    Client,
};
use serde_json::json;

use super::{Link, MirrorCondition, ResourceRef, ServiceStatus};
use crate::mirror::{ObjectKey, Tolerate};

#[derive(Clone)]
pub struct StatusReporter {
    links: Api<Link>,
    link_name: String,
    target: String,
}

enum List {
    Mirror,
    Federated,
}

impl List {
    fn field(&self) -> &'static str {
        match self {
            List::Mirror => "mirrorServices",
            List::Federated => "federatedServices",
        }
    }
}

impl StatusReporter {
    pub fn new(client: Client, namespace: &str, link_name: &str, target: &str) -> Self {
        Self {
            links: Api::namespaced(client, namespace),
            link_name: link_name.to_string(),
            target: target.to_string(),
        }
    }

    pub async fn record_mirror(
        &self,
        remote: &ObjectKey,
        condition: MirrorCondition,
    ) -> Result<(), kube::Error> {
        self.patch(&List::Mirror, |list| upsert(list, remote, condition))
            .await
    }

    pub async fn forget_mirror(&self, remote: &ObjectKey) -> Result<(), kube::Error> {
        self.patch(&List::Mirror, |list| remove(list, remote)).await
    }

    pub async fn record_federated(
        &self,
        remote: &ObjectKey,
        condition: MirrorCondition,
    ) -> Result<(), kube::Error> {
        self.patch(&List::Federated, |list| upsert(list, remote, condition))
            .await
    }

    pub async fn forget_federated(&self, remote: &ObjectKey) -> Result<(), kube::Error> {
        self.patch(&List::Federated, |list| remove(list, remote))
            .await
    }

    async fn patch(
        &self,
        list: &List,
        update: impl FnOnce(&mut Vec<ServiceStatus>),
    ) -> Result<(), kube::Error> {
        // Local discovery has no Link of its own to report against.
        if self.target.is_empty() {
            return Ok(());
        }

        let Some(link) = self.links.get(&self.link_name).await.tolerate(404)? else {
            return Ok(());
        };

        let mut status = link.status.unwrap_or_default();
        let entries = match list {
            List::Mirror => &mut status.mirror_services,
            List::Federated => &mut status.federated_services,
        };

        update(entries);

        self.links
            .patch_status(
                &self.link_name,
                &PatchParams::default(),
                &Patch::Merge(json!({"status": {list.field(): entries}})),
            )
            .await?;

        Ok(())
    }
}

fn upsert(list: &mut Vec<ServiceStatus>, remote: &ObjectKey, condition: MirrorCondition) {
    let remote_ref = ResourceRef {
        name: remote.name.clone(),
        namespace: remote.namespace.clone(),
    };

    match list.iter_mut().find(|entry| entry.remote_ref == remote_ref) {
        Some(entry) => entry.conditions = vec![condition],
        None => list.push(ServiceStatus {
            remote_ref,
            conditions: vec![condition],
        }),
    }
}

fn remove(list: &mut Vec<ServiceStatus>, remote: &ObjectKey) {
    list.retain(|entry| {
        entry.remote_ref.name != remote.name || entry.remote_ref.namespace != remote.namespace
    });
}
