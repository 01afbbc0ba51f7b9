//! Federated service membership.
//!
//! The aggregate is a single local service whose two discovery annotations
//! enumerate the contributors. No watcher owns it exclusively: joins and
//! leaves are read-modify-write with idempotent set semantics, and an API
//! conflict just means a sibling got there first — retry and converge.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::Service;
use kube::{
    api::{DeleteParams, PostParams},
    ResourceExt,
};

use super::Reconciler;
use crate::{
    link::{ConditionReason, MirrorCondition, ResourceRef},
    mirror::{
        event::Event, naming, projection, ObjectKey, ReconcileError, Tolerate,
        LOCAL_DISCOVERY_ANNOTATION, MIRRORED_RESOURCE_LABEL, REMOTE_DISCOVERY_ANNOTATION,
    },
};

/// Adds a member, returning whether the annotations changed. Local members
/// (empty target) take the single local-discovery slot; remote members join
/// the sorted `svc@cluster` list.
pub(crate) fn join(
    annotations: &mut BTreeMap<String, String>,
    remote: &str,
    target: &str,
) -> bool {
    if target.is_empty() {
        return annotations
            .insert(LOCAL_DISCOVERY_ANNOTATION.to_string(), remote.to_string())
            .as_deref()
            != Some(remote);
    }

    let member = naming::member(remote, target);
    let mut members = parse_members(annotations.get(REMOTE_DISCOVERY_ANNOTATION));

    if members.contains(&member) {
        return false;
    }

    members.push(member);
    members.sort();
    annotations.insert(REMOTE_DISCOVERY_ANNOTATION.to_string(), members.join(","));

    true
}

/// Removes a member, returning whether the annotations changed.
pub(crate) fn leave(
    annotations: &mut BTreeMap<String, String>,
    remote: &str,
    target: &str,
) -> bool {
    if target.is_empty() {
        return annotations.remove(LOCAL_DISCOVERY_ANNOTATION).is_some();
    }

    let member = naming::member(remote, target);
    let mut members = parse_members(annotations.get(REMOTE_DISCOVERY_ANNOTATION));
    let before = members.len();

    members.retain(|existing| existing != &member);

    if members.len() == before {
        return false;
    }

    if members.is_empty() {
        annotations.remove(REMOTE_DISCOVERY_ANNOTATION);
    } else {
        annotations.insert(REMOTE_DISCOVERY_ANNOTATION.to_string(), members.join(","));
    }

    true
}

/// True when no contributor is left and the aggregate should be deleted.
pub(crate) fn members_empty(annotations: &BTreeMap<String, String>) -> bool {
    annotations
        .get(LOCAL_DISCOVERY_ANNOTATION)
        .map_or(true, String::is_empty)
        && annotations
            .get(REMOTE_DISCOVERY_ANNOTATION)
            .map_or(true, String::is_empty)
}

fn parse_members(list: Option<&String>) -> Vec<String> {
    list.map(String::as_str)
        .unwrap_or_default()
        .split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(ToString::to_string)
        .collect()
}

impl Reconciler {
    pub(crate) async fn create_federated_service(
        &self,
        remote: &Service,
    ) -> Result<(), ReconcileError> {
        let key = ObjectKey::of(remote);

        if projection::is_headless(remote) {
            self.skip_event(remote, "headless services cannot join federated services")
                .await;
            self.status
                .record_federated(
                    &key,
                    MirrorCondition::failed(
                        ConditionReason::InvalidService,
                        "headless services cannot join federated services",
                    ),
                )
                .await?;
            return Ok(());
        }

        if !self.ensure_namespace(remote).await? {
            self.status
                .record_federated(
                    &key,
                    MirrorCondition::failed(
                        ConditionReason::MissingNamespace,
                        format!("namespace {} does not exist", key.namespace),
                    ),
                )
                .await?;
            return Ok(());
        }

        let service = projection::federated_service(remote, &self.settings.link);
        self.services(&key.namespace)
            .create(&PostParams::default(), &service)
            .await
            .tolerate(409)?;

        self.record_federated_joined(&key).await
    }

    pub(crate) async fn join_federated_service(
        &self,
        remote: &Service,
    ) -> Result<(), ReconcileError> {
        let key = ObjectKey::of(remote);
        let federated_name = naming::federated(&key.name);
        let services = self.services(&key.namespace);

        let Some(mut service) = services.get_opt(&federated_name).await? else {
            // A sibling deleted the aggregate between evaluation and now;
            // start over with a create.
            self.queue
                .add(Event::CreateFederatedService(Box::new(remote.clone())));
            return Ok(());
        };

        let mut annotations = service.annotations().clone();

        if join(&mut annotations, &key.name, self.target()) {
            service.metadata.annotations = Some(annotations);
            services
                .replace(&federated_name, &PostParams::default(), &service)
                .await?;
        }

        self.record_federated_joined(&key).await
    }

    pub(crate) async fn leave_federated_service(
        &self,
        remote: &ObjectKey,
    ) -> Result<(), ReconcileError> {
        self.status.forget_federated(remote).await?;

        let federated_name = naming::federated(&remote.name);
        let services = self.services(&remote.namespace);

        let Some(mut service) = services.get_opt(&federated_name).await? else {
            return Ok(());
        };

        if service.labels().get(MIRRORED_RESOURCE_LABEL).map(String::as_str) != Some("true") {
            return Ok(());
        }

        let mut annotations = service.annotations().clone();
        let changed = leave(&mut annotations, &remote.name, self.target());

        if members_empty(&annotations) {
            services
                .delete(&federated_name, &DeleteParams::default())
                .await
                .tolerate(404)?;
            return Ok(());
        }

        if changed {
            service.metadata.annotations = Some(annotations);
            services
                .replace(&federated_name, &PostParams::default(), &service)
                .await?;
        }

        Ok(())
    }

    async fn record_federated_joined(&self, key: &ObjectKey) -> Result<(), ReconcileError> {
        self.status
            .record_federated(
                key,
                MirrorCondition::mirrored(ResourceRef {
                    name: naming::federated(&key.name),
                    namespace: key.namespace.clone(),
                }),
            )
            .await?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn members_join_sorted_and_idempotently() {
        let mut annotations = BTreeMap::new();

        assert!(join(&mut annotations, "service-one", "remote"));
        assert_eq!(
            annotations.get(REMOTE_DISCOVERY_ANNOTATION).map(String::as_str),
            Some("service-one@remote")
        );

        assert!(join(&mut annotations, "service-one", "other"));
        assert_eq!(
            annotations.get(REMOTE_DISCOVERY_ANNOTATION).map(String::as_str),
            Some("service-one@other,service-one@remote")
        );

        // Replays change nothing.
        assert!(!join(&mut annotations, "service-one", "remote"));
        assert_eq!(
            annotations.get(REMOTE_DISCOVERY_ANNOTATION).map(String::as_str),
            Some("service-one@other,service-one@remote")
        );
    }

    #[test]
    fn members_leave_until_the_aggregate_is_empty() {
        let mut annotations = BTreeMap::from([(
            REMOTE_DISCOVERY_ANNOTATION.to_string(),
            "service-one@other,service-one@remote".to_string(),
        )]);

        assert!(leave(&mut annotations, "service-one", "remote"));
        assert_eq!(
            annotations.get(REMOTE_DISCOVERY_ANNOTATION).map(String::as_str),
            Some("service-one@other")
        );
        assert!(!members_empty(&annotations));

        // Leaving a member that is not present is a no-op.
        assert!(!leave(&mut annotations, "service-one", "remote"));

        assert!(leave(&mut annotations, "service-one", "other"));
        assert!(!annotations.contains_key(REMOTE_DISCOVERY_ANNOTATION));
        assert!(members_empty(&annotations));
    }

    #[test]
    fn local_discovery_takes_the_single_slot() {
        let mut annotations = BTreeMap::new();

        assert!(join(&mut annotations, "service-one", ""));
        assert_eq!(
            annotations.get(LOCAL_DISCOVERY_ANNOTATION).map(String::as_str),
            Some("service-one")
        );
        assert!(!join(&mut annotations, "service-one", ""));

        assert!(leave(&mut annotations, "service-one", ""));
        assert!(members_empty(&annotations));
    }

    #[test]
    fn remote_members_do_not_mask_a_local_member() {
        let mut annotations = BTreeMap::from([(
            LOCAL_DISCOVERY_ANNOTATION.to_string(),
            "service-one".to_string(),
        )]);

        assert!(!members_empty(&annotations));
        assert!(leave(&mut annotations, "service-one", ""));
        assert!(members_empty(&annotations));
    }
}
