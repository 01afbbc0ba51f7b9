//! Single-writer reconciler for one linked cluster.
//!
//! Informer streams and tickers only enqueue typed events; every local
//! mutation happens from the one worker task draining the queue. Handlers
//! are idempotent so that replays, races with sibling watchers, and
//! rate-limited retries all converge on the same local state.

mod endpoints;
mod federated;
mod headless;

use std::{collections::HashSet, sync::Arc, time::Duration};

use chrono::Utc;
use eyre::{Report, Result};
use futures::{stream::BoxStream, StreamExt};
use k8s_openapi::{
    api::core::v1::{Endpoints, Event as K8sEvent, EventSource, Namespace, ObjectReference, Service},
    apimachinery::pkg::apis::meta::v1::Time,
};
use kube::{
    api::{Api, DeleteParams, ListParams, ObjectMeta, PostParams},
    runtime::{
        reflector::{self, ObjectRef, Store},
        watcher, WatchStreamExt,
    },
    Client, ResourceExt,
};
use tokio::{
    sync::{mpsc::UnboundedReceiver, watch},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;

use super::{
    event::{Event, ExportedServiceUpdate},
    gateway::GatewayResolver,
    naming, owned_by, projection,
    queue::{Attempt, Queue},
    ReconcileError, Tolerate,
};
use crate::{
    link::{status::StatusReporter, ConditionReason, LinkSpec, MirrorCondition, ResourceRef},
    mirror::{
        mirror_selector, ObjectKey, EVENT_COMPONENT, EVENT_SKIPPED_REASON,
        HEADLESS_MIRROR_NAME_LABEL, MIRRORED_RESOURCE_LABEL,
        REMOTE_RESOURCE_VERSION_ANNOTATION,
    },
};

type WatchStream<K> = BoxStream<'static, Result<watcher::Event<K>, watcher::Error>>;

pub struct Settings {
    pub link_name: String,
    /// Namespace this controller (and its Link objects) runs in. Remote
    /// Endpoints in this namespace are control-plane machinery and are never
    /// translated into events.
    pub namespace: String,
    pub link: LinkSpec,
    pub requeue_limit: u32,
    pub repair_period: Duration,
    pub gc_period: Duration,
    pub headless_enabled: bool,
    pub namespace_creation_enabled: bool,
}

impl Settings {
    fn target(&self) -> &str {
        &self.link.target_cluster_name
    }
}

pub struct RemoteClusterServiceWatcher {
    queue: Queue,
    shutdown: CancellationToken,
    worker: JoinHandle<()>,
    tasks: Vec<JoinHandle<()>>,
}

impl RemoteClusterServiceWatcher {
    /// Connects the informer streams, starts the tickers and the worker, and
    /// enqueues the initial orphan sweep once the remote cache has synced.
    pub fn start(
        settings: Settings,
        local: Client,
        remote: Client,
        liveness: watch::Receiver<bool>,
    ) -> Result<Self> {
        let (queue, rx) = Queue::new();
        let shutdown = CancellationToken::new();
        let mut tasks = Vec::new();

        let (services_reader, services_writer) = reflector::store::<Service>();
        let services_stream: WatchStream<Service> =
            watcher(Api::<Service>::all(remote.clone()), watcher::Config::default())
                .default_backoff()
                .modify(|service| ResourceExt::managed_fields_mut(service).clear())
                .reflect(services_writer)
                .boxed();

        let (endpoints_reader, endpoints_writer) = reflector::store::<Endpoints>();
        let endpoints_stream: WatchStream<Endpoints> =
            watcher(Api::<Endpoints>::all(remote.clone()), watcher::Config::default())
                .default_backoff()
                .modify(|endpoints| ResourceExt::managed_fields_mut(endpoints).clear())
                .reflect(endpoints_writer)
                .boxed();

        let namespaces_stream: WatchStream<Namespace> =
            watcher(Api::<Namespace>::all(local.clone()), watcher::Config::default())
                .default_backoff()
                .boxed();

        let status = StatusReporter::new(
            local.clone(),
            &settings.namespace,
            &settings.link_name,
            settings.target(),
        );

        let reconciler = Arc::new(Reconciler {
            local,
            remote_services: services_reader.clone(),
            remote_endpoints: endpoints_reader,
            resolver: GatewayResolver::from_system_conf()?,
            queue: queue.clone(),
            liveness: liveness.clone(),
            status,
            settings,
        });

        tasks.push(tokio::spawn(translate_services(
            services_stream,
            queue.clone(),
            shutdown.clone(),
        )));
        tasks.push(tokio::spawn(translate_endpoints(
            endpoints_stream,
            reconciler.settings.link.clone(),
            reconciler.settings.namespace.clone(),
            queue.clone(),
            shutdown.clone(),
        )));
        tasks.push(tokio::spawn(translate_namespaces(
            namespaces_stream,
            queue.clone(),
            shutdown.clone(),
        )));

        tasks.push(tick(
            Event::RepairEndpoints,
            reconciler.settings.repair_period,
            queue.clone(),
            shutdown.clone(),
        ));
        tasks.push(tick(
            Event::OrphanedServicesGcTriggered,
            reconciler.settings.gc_period,
            queue.clone(),
            shutdown.clone(),
        ));
        tasks.push(tokio::spawn(forward_liveness(
            liveness,
            queue.clone(),
            shutdown.clone(),
        )));

        // The first orphan sweep waits for the remote cache: sweeping against
        // an empty cache would delete every mirror.
        {
            let queue = queue.clone();
            tasks.push(tokio::spawn(async move {
                if services_reader.wait_until_ready().await.is_ok() {
                    queue.add(Event::OrphanedServicesGcTriggered);
                }
            }));
        }

        let worker = tokio::spawn(run(reconciler, rx));

        Ok(Self {
            queue,
            shutdown,
            worker,
            tasks,
        })
    }

    /// Drains the queue and tears the watcher down. With `cleanup_state` a
    /// terminal `ClusterUnregistered` pass deletes every local resource
    /// mirrored from this cluster first.
    pub async fn stop(self, cleanup_state: bool) {
        let Self {
            queue,
            shutdown,
            worker,
            tasks,
        } = self;

        if cleanup_state {
            queue.add(Event::ClusterUnregistered);
        }

        queue.shut_down();
        shutdown.cancel();

        if let Err(err) = worker.await {
            tracing::warn!(%err, "event loop did not stop cleanly");
        }

        for task in tasks {
            task.abort();
        }
    }
}

async fn run(reconciler: Arc<Reconciler>, mut rx: UnboundedReceiver<Attempt>) {
    while let Some(attempt) = rx.recv().await {
        if matches!(attempt.event, Event::Stop) {
            break;
        }

        reconciler.process(attempt).await;
    }

    tracing::debug!("event loop stopped");
}

fn tick(
    event: Event,
    period: Duration,
    queue: Queue,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        interval.tick().await;

        loop {
            tokio::select! {
                () = shutdown.cancelled() => break,
                _ = interval.tick() => queue.add(event.clone()),
            }
        }
    })
}

async fn forward_liveness(
    mut liveness: watch::Receiver<bool>,
    queue: Queue,
    shutdown: CancellationToken,
) {
    loop {
        tokio::select! {
            () = shutdown.cancelled() => break,
            changed = liveness.changed() => {
                if changed.is_err() {
                    break;
                }

                let alive = *liveness.borrow_and_update();
                tracing::info!(alive, "gateway liveness changed");
                queue.add(Event::RepairEndpoints);
            }
        }
    }
}

async fn translate_services(mut stream: WatchStream<Service>, queue: Queue, shutdown: CancellationToken) {
    loop {
        let item = tokio::select! {
            () = shutdown.cancelled() => break,
            item = stream.next() => item,
        };

        match item {
            Some(Ok(event)) => {
                if let Some(event) = service_event(event) {
                    queue.add(event);
                }
            }
            Some(Err(err)) => tracing::warn!(%err, "remote service watch failed"),
            None => break,
        }
    }
}

fn service_event(event: watcher::Event<Service>) -> Option<Event> {
    match event {
        watcher::Event::InitApply(service) => Some(Event::RemoteServiceCreated(Box::new(service))),
        watcher::Event::Apply(service) => Some(Event::RemoteServiceUpdated(Box::new(service))),
        watcher::Event::Delete(service) => Some(Event::RemoteServiceDeleted(Box::new(service))),
        watcher::Event::Init | watcher::Event::InitDone => None,
    }
}

async fn translate_endpoints(
    mut stream: WatchStream<Endpoints>,
    link: LinkSpec,
    controller_namespace: String,
    queue: Queue,
    shutdown: CancellationToken,
) {
    loop {
        let item = tokio::select! {
            () = shutdown.cancelled() => break,
            item = stream.next() => item,
        };

        match item {
            Some(Ok(event)) => {
                if let Some(event) = endpoints_event(event, &link, &controller_namespace) {
                    queue.add(event);
                }
            }
            Some(Err(err)) => tracing::warn!(%err, "remote endpoints watch failed"),
            None => break,
        }
    }
}

fn endpoints_event(
    event: watcher::Event<Endpoints>,
    link: &LinkSpec,
    controller_namespace: &str,
) -> Option<Event> {
    let (endpoints, created) = match event {
        watcher::Event::InitApply(endpoints) => (endpoints, true),
        watcher::Event::Apply(endpoints) => (endpoints, false),
        _ => return None,
    };

    if endpoints.namespace().as_deref() == Some(controller_namespace) {
        return None;
    }

    let labels = endpoints.labels();

    if !link.selector.matches(labels) {
        return None;
    }

    if created {
        if !labels.contains_key(super::HEADLESS_SERVICE_LABEL) {
            return None;
        }

        Some(Event::RemoteEndpointsCreated(Box::new(endpoints)))
    } else {
        if link.remote_discovery_selector.matches(labels) {
            return None;
        }

        Some(Event::RemoteEndpointsUpdated(Box::new(endpoints)))
    }
}

async fn translate_namespaces(
    mut stream: WatchStream<Namespace>,
    queue: Queue,
    shutdown: CancellationToken,
) {
    let mut seen = HashSet::new();

    loop {
        let item = tokio::select! {
            () = shutdown.cancelled() => break,
            item = stream.next() => item,
        };

        match item {
            Some(Ok(watcher::Event::InitApply(namespace) | watcher::Event::Apply(namespace))) => {
                let name = namespace.name_any();

                if seen.insert(name.clone()) {
                    queue.add(Event::LocalNamespaceAdded(name));
                }
            }
            Some(Ok(watcher::Event::Delete(namespace))) => {
                seen.remove(&namespace.name_any());
            }
            Some(Ok(_)) => {}
            Some(Err(err)) => tracing::warn!(%err, "local namespace watch failed"),
            None => break,
        }
    }
}

pub(crate) struct Reconciler {
    settings: Settings,
    local: Client,
    remote_services: Store<Service>,
    remote_endpoints: Store<Endpoints>,
    resolver: GatewayResolver,
    queue: Queue,
    liveness: watch::Receiver<bool>,
    status: StatusReporter,
}

impl Reconciler {
    async fn process(&self, attempt: Attempt) {
        let kind = attempt.event.to_string();

        match self.handle(&attempt.event).await {
            Ok(()) => {}
            Err(ReconcileError::Retryable(errors)) => {
                for error in &errors {
                    tracing::warn!(event = kind, %error, "reconciliation failed");
                }

                if attempt.requeues < self.settings.requeue_limit && !self.queue.is_shutting_down()
                {
                    self.queue.add_rate_limited(attempt.bump());
                } else {
                    tracing::warn!(event = kind, requeues = attempt.requeues, "giving up");
                }
            }
            Err(error) => tracing::error!(event = kind, %error, "dropping event"),
        }
    }

    async fn handle(&self, event: &Event) -> Result<(), ReconcileError> {
        match event {
            Event::RemoteServiceCreated(service) | Event::RemoteServiceUpdated(service) => {
                self.remote_service_changed(service).await
            }
            Event::RemoteServiceDeleted(service) => {
                self.remote_service_deleted(service);
                Ok(())
            }
            Event::RemoteEndpointsCreated(endpoints) | Event::RemoteEndpointsUpdated(endpoints) => {
                self.remote_endpoints_changed(endpoints).await
            }
            Event::LocalNamespaceAdded(namespace) => {
                self.local_namespace_added(namespace);
                Ok(())
            }
            Event::RemoteServiceExported(service) => self.remote_service_exported(service).await,
            Event::RemoteExportedServiceUpdated(update) => {
                self.remote_exported_service_updated(update).await
            }
            Event::RemoteServiceUnexported(remote) => self.remote_service_unexported(remote).await,
            Event::CreateFederatedService(service) => self.create_federated_service(service).await,
            Event::RemoteServiceJoinsFederatedService(service) => {
                self.join_federated_service(service).await
            }
            Event::RemoteServiceLeavesFederatedService(remote) => {
                self.leave_federated_service(remote).await
            }
            Event::OrphanedServicesGcTriggered => self.gc_orphaned_services().await,
            Event::RepairEndpoints => self.repair_endpoints().await,
            Event::ClusterUnregistered => self.cluster_unregistered().await,
            Event::Stop => Ok(()),
        }
    }

    fn target(&self) -> &str {
        self.settings.target()
    }

    fn services(&self, namespace: &str) -> Api<Service> {
        Api::namespaced(self.local.clone(), namespace)
    }

    fn endpoints(&self, namespace: &str) -> Api<Endpoints> {
        Api::namespaced(self.local.clone(), namespace)
    }

    /// Decides what a remote service change means locally and self-enqueues
    /// the matching reconciliation event.
    async fn remote_service_changed(&self, remote: &Service) -> Result<(), ReconcileError> {
        let link = &self.settings.link;
        let labels = remote.labels();

        let exported = link.selector.matches(labels);
        let remote_discovery = link.remote_discovery_selector.matches(labels);
        let federated = link.federated_service_selector.matches(labels);

        let namespace = remote.namespace().unwrap_or_default();
        let mirror_name = naming::mirror(&remote.name_any(), self.target());

        if exported || remote_discovery {
            match self.services(&namespace).get_opt(&mirror_name).await? {
                None => self
                    .queue
                    .add(Event::RemoteServiceExported(Box::new(remote.clone()))),
                Some(local) => {
                    let seen = local
                        .annotations()
                        .get(REMOTE_RESOURCE_VERSION_ANNOTATION)
                        .cloned();

                    if seen != remote.resource_version() {
                        let local_endpoints =
                            self.endpoints(&namespace).get_opt(&mirror_name).await?;

                        self.queue
                            .add(Event::RemoteExportedServiceUpdated(ExportedServiceUpdate {
                                local: Box::new(local),
                                local_endpoints: local_endpoints.map(Box::new),
                                remote: Box::new(remote.clone()),
                            }));
                    }
                }
            }
        } else if let Some(local) = self.services(&namespace).get_opt(&mirror_name).await? {
            if owned_by(local.labels(), self.target()) {
                self.queue
                    .add(Event::RemoteServiceUnexported(ObjectKey::of(remote)));
            }
        }

        let federated_name = naming::federated(&remote.name_any());

        if federated {
            match self.services(&namespace).get_opt(&federated_name).await? {
                None => self
                    .queue
                    .add(Event::CreateFederatedService(Box::new(remote.clone()))),
                Some(_) => self
                    .queue
                    .add(Event::RemoteServiceJoinsFederatedService(Box::new(
                        remote.clone(),
                    ))),
            }
        } else if let Some(existing) = self.services(&namespace).get_opt(&federated_name).await? {
            if existing.labels().get(MIRRORED_RESOURCE_LABEL).map(String::as_str) == Some("true") {
                self.queue
                    .add(Event::RemoteServiceLeavesFederatedService(ObjectKey::of(
                        remote,
                    )));
            }
        }

        Ok(())
    }

    fn remote_service_deleted(&self, remote: &Service) {
        let link = &self.settings.link;
        let labels = remote.labels();
        let key = ObjectKey::of(remote);

        if link.selector.matches(labels) || link.remote_discovery_selector.matches(labels) {
            self.queue.add(Event::RemoteServiceUnexported(key.clone()));
        }

        if link.federated_service_selector.matches(labels) {
            self.queue.add(Event::RemoteServiceLeavesFederatedService(key));
        }
    }

    /// A namespace appearing locally unblocks any exports that were skipped
    /// while it was missing; replay every remote service in it.
    fn local_namespace_added(&self, namespace: &str) {
        for service in self.remote_services.state() {
            if service.namespace().as_deref() == Some(namespace) {
                self.queue
                    .add(Event::RemoteServiceCreated(Box::new((*service).clone())));
            }
        }
    }

    async fn remote_service_exported(&self, remote: &Service) -> Result<(), ReconcileError> {
        let key = ObjectKey::of(remote);
        let remote_discovery = self
            .settings
            .link
            .remote_discovery_selector
            .matches(remote.labels());

        if projection::is_headless(remote) {
            if !self.settings.headless_enabled {
                self.skip_event(remote, "headless mirroring is disabled").await;
                self.status
                    .record_mirror(
                        &key,
                        MirrorCondition::failed(
                            ConditionReason::InvalidService,
                            "headless mirroring is disabled",
                        ),
                    )
                    .await?;
                return Ok(());
            }

            if !remote_discovery {
                // Headless mirrors materialize from the endpoints stream,
                // where the named addresses live.
                return Ok(());
            }
        }

        if !self.ensure_namespace(remote).await? {
            self.status
                .record_mirror(
                    &key,
                    MirrorCondition::failed(
                        ConditionReason::MissingNamespace,
                        format!("namespace {} does not exist", key.namespace),
                    ),
                )
                .await?;
            return Ok(());
        }

        let mirror = projection::mirror_service(remote, &self.settings.link, remote_discovery, false);
        self.services(&key.namespace)
            .create(&PostParams::default(), &mirror)
            .await
            .tolerate(409)?;

        if !remote_discovery {
            if let Err(err) = self.create_gateway_endpoints(remote).await {
                self.record_mirror_failure(&key, &err).await;
                return Err(err);
            }
        }

        self.status
            .record_mirror(
                &key,
                MirrorCondition::mirrored(ResourceRef {
                    name: naming::mirror(&key.name, self.target()),
                    namespace: key.namespace.clone(),
                }),
            )
            .await?;

        Ok(())
    }

    async fn remote_exported_service_updated(
        &self,
        update: &ExportedServiceUpdate,
    ) -> Result<(), ReconcileError> {
        let key = ObjectKey::of(update.remote.as_ref());

        tracing::debug!(
            service = %key,
            from = update
                .local
                .annotations()
                .get(REMOTE_RESOURCE_VERSION_ANNOTATION)
                .map(String::as_str)
                .unwrap_or_default(),
            to = update.remote.resource_version().unwrap_or_default(),
            "exported service changed"
        );

        if let Err(err) = self.apply_exported_update(update).await {
            self.record_mirror_failure(&key, &err).await;
            return Err(err);
        }

        self.status
            .record_mirror(
                &key,
                MirrorCondition::mirrored(ResourceRef {
                    name: naming::mirror(&key.name, self.target()),
                    namespace: key.namespace.clone(),
                }),
            )
            .await?;

        Ok(())
    }

    async fn apply_exported_update(
        &self,
        update: &ExportedServiceUpdate,
    ) -> Result<(), ReconcileError> {
        let remote = update.remote.as_ref();
        let link = &self.settings.link;
        let namespace = remote.namespace().unwrap_or_default();
        let mirror_name = naming::mirror(&remote.name_any(), self.target());
        let remote_discovery = link.remote_discovery_selector.matches(remote.labels());

        if remote_discovery {
            // The mirror no longer has gateway endpoints of its own.
            if update.local_endpoints.is_some() {
                self.endpoints(&namespace)
                    .delete(&mirror_name, &DeleteParams::default())
                    .await
                    .tolerate(404)?;
            }
        } else if update.local_endpoints.is_none() {
            self.create_gateway_endpoints(remote).await?;
        } else {
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
            .await?;
        }

        // Replace from a fresh read, not the snapshot taken at enqueue time:
        // that snapshot may be several writes old, and replaying its stale
        // resourceVersion would conflict on every retry.
        let Some(mut local) = self.services(&namespace).get_opt(&mirror_name).await? else {
            // The mirror vanished between enqueue and now; start over.
            self.queue
                .add(Event::RemoteServiceExported(Box::new(remote.clone())));
            return Ok(());
        };

        local.metadata.labels = Some(projection::mirror_labels(remote, link, remote_discovery));
        local.metadata.annotations = Some(projection::mirror_annotations(remote, link));

        match local.spec.as_mut() {
            Some(spec) => spec.ports = Some(projection::service_ports(remote)),
            None => {
                local.spec = Some(k8s_openapi::api::core::v1::ServiceSpec {
                    ports: Some(projection::service_ports(remote)),
                    ..Default::default()
                });
            }
        }

        self.services(&namespace)
            .replace(&mirror_name, &PostParams::default(), &local)
            .await?;

        Ok(())
    }

    async fn remote_service_unexported(&self, remote: &ObjectKey) -> Result<(), ReconcileError> {
        self.status.forget_mirror(remote).await?;

        let mirror_name = naming::mirror(&remote.name, self.target());
        let services = self.services(&remote.namespace);

        if let Some(local) = services.get_opt(&mirror_name).await? {
            if projection::is_headless(&local) {
                let selector = format!("{HEADLESS_MIRROR_NAME_LABEL}={mirror_name}");
                let mirrors = services
                    .list(&ListParams::default().labels(&selector))
                    .await?;

                for mirror in mirrors {
                    services
                        .delete(&mirror.name_any(), &DeleteParams::default())
                        .await
                        .tolerate(404)?;
                }
            }
        }

        services
            .delete(&mirror_name, &DeleteParams::default())
            .await
            .tolerate(404)?;

        Ok(())
    }

    /// Deletes every local mirror whose remote origin is gone. Runs on a
    /// ticker and once at startup after the remote cache syncs.
    async fn gc_orphaned_services(&self) -> Result<(), ReconcileError> {
        let selector = mirror_selector(self.target());
        let services = Api::<Service>::all(self.local.clone())
            .list(&ListParams::default().labels(&selector))
            .await?;

        let mut errors: Vec<Report> = Vec::new();

        for service in services {
            let name = service.name_any();
            let namespace = service.namespace().unwrap_or_default();

            // Endpoint mirrors are named after a hostname, not a remote
            // service; their origin is the parent headless service.
            let origin = match service.labels().get(HEADLESS_MIRROR_NAME_LABEL) {
                Some(parent) => naming::origin(parent, self.target()),
                None => naming::origin(&name, self.target()),
            };

            let Some(origin) = origin else { continue };

            if self
                .remote_services
                .get(&ObjectRef::new(&origin).within(&namespace))
                .is_some()
            {
                continue;
            }

            tracing::info!(service = %ObjectKey { namespace: namespace.clone(), name: name.clone() }, "deleting orphaned mirror");

            if let Err(err) = self
                .services(&namespace)
                .delete(&name, &DeleteParams::default())
                .await
                .tolerate(404)
            {
                errors.push(Report::new(err).wrap_err(format!("deleting {namespace}/{name}")));
            }
        }

        ReconcileError::from_sweep(errors)
    }

    /// Terminal cleanup: every service and endpoints mirrored from this
    /// cluster goes.
    async fn cluster_unregistered(&self) -> Result<(), ReconcileError> {
        let selector = mirror_selector(self.target());
        let mut errors: Vec<Report> = Vec::new();

        let services = Api::<Service>::all(self.local.clone())
            .list(&ListParams::default().labels(&selector))
            .await?;

        for service in services {
            let namespace = service.namespace().unwrap_or_default();

            if let Err(err) = self
                .services(&namespace)
                .delete(&service.name_any(), &DeleteParams::default())
                .await
                .tolerate(404)
            {
                errors.push(Report::new(err));
            }
        }

        let endpoints = Api::<Endpoints>::all(self.local.clone())
            .list(&ListParams::default().labels(&selector))
            .await?;

        for object in endpoints {
            let namespace = object.namespace().unwrap_or_default();

            if let Err(err) = self
                .endpoints(&namespace)
                .delete(&object.name_any(), &DeleteParams::default())
                .await
                .tolerate(404)
            {
                errors.push(Report::new(err));
            }
        }

        ReconcileError::from_sweep(errors)
    }

    /// Makes sure the mirror's namespace exists locally. Returns false when
    /// the namespace is missing and this controller is not allowed to create
    /// it; the caller records the status for its own list.
    async fn ensure_namespace(&self, remote: &Service) -> Result<bool, ReconcileError> {
        let namespace = remote.namespace().unwrap_or_default();
        let api = Api::<Namespace>::all(self.local.clone());

        if api.get_opt(&namespace).await?.is_some() {
            return Ok(true);
        }

        if !self.settings.namespace_creation_enabled {
            self.skip_event(remote, &format!("namespace {namespace} does not exist"))
                .await;
            return Ok(false);
        }

        let object = Namespace {
            metadata: ObjectMeta {
                name: Some(namespace),
                labels: Some(projection::endpoints_labels(&self.settings.link)),
                ..Default::default()
            },
            ..Default::default()
        };

        api.create(&PostParams::default(), &object)
            .await
            .tolerate(409)?;

        Ok(true)
    }

    async fn record_mirror_failure(&self, key: &ObjectKey, err: &ReconcileError) {
        if let Err(status_err) = self
            .status
            .record_mirror(
                key,
                MirrorCondition::failed(ConditionReason::Error, err.to_string()),
            )
            .await
        {
            tracing::warn!(%status_err, "failed to record mirror status");
        }
    }

    /// Best-effort audit trail against the remote service. A missing local
    /// namespace also means nowhere to put the event, so failures only log.
    async fn skip_event(&self, remote: &Service, message: &str) {
        let namespace = remote.namespace().unwrap_or_default();
        let now = Time(Utc::now());

        let event = K8sEvent {
            metadata: ObjectMeta {
                generate_name: Some(format!("{}.", remote.name_any())),
                namespace: Some(namespace.clone()),
                ..Default::default()
            },
            involved_object: ObjectReference {
                api_version: Some("v1".to_string()),
                kind: Some("Service".to_string()),
                name: Some(remote.name_any()),
                namespace: Some(namespace.clone()),
                uid: remote.uid(),
                ..Default::default()
            },
            reason: Some(EVENT_SKIPPED_REASON.to_string()),
            message: Some(message.to_string()),
            type_: Some("Normal".to_string()),
            source: Some(EventSource {
                component: Some(EVENT_COMPONENT.to_string()),
                ..Default::default()
            }),
            count: Some(1),
            first_timestamp: Some(now.clone()),
            last_timestamp: Some(now),
            ..Default::default()
        };

        if let Err(err) = Api::<K8sEvent>::namespaced(self.local.clone(), &namespace)
            .create(&PostParams::default(), &event)
            .await
        {
            tracing::warn!(%err, reason = EVENT_SKIPPED_REASON, "failed to post event");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;
    use crate::link::Selector;

    fn link() -> LinkSpec {
        LinkSpec {
            target_cluster_name: "remote".to_string(),
            target_cluster_domain: String::new(),
            cluster_credentials_secret: String::new(),
            gateway_address: "192.0.2.127".to_string(),
            gateway_port: 888,
            gateway_identity: String::new(),
            probe_spec: None,
            selector: Selector::from(BTreeMap::from([(
                "mirror.linkerd.io/exported".to_string(),
                "true".to_string(),
            )])),
            remote_discovery_selector: Selector::from(BTreeMap::from([(
                "mirror.linkerd.io/exported".to_string(),
                "remote-discovery".to_string(),
            )])),
            federated_service_selector: Selector::default(),
        }
    }

    fn endpoints(namespace: &str, labels: &[(&str, &str)]) -> Endpoints {
        Endpoints {
            metadata: ObjectMeta {
                name: Some("service-one".to_string()),
                namespace: Some(namespace.to_string()),
                labels: Some(
                    labels
                        .iter()
                        .map(|(key, value)| ((*key).to_string(), (*value).to_string()))
                        .collect(),
                ),
                ..Default::default()
            },
            subsets: None,
        }
    }

    #[test]
    fn endpoints_adds_require_the_headless_label() {
        let exported = &[("mirror.linkerd.io/exported", "true")];
        let headless = &[
            ("mirror.linkerd.io/exported", "true"),
            ("service.kubernetes.io/headless", ""),
        ];

        assert!(endpoints_event(
            watcher::Event::InitApply(endpoints("ns1", exported)),
            &link(),
            "multicluster",
        )
        .is_none());

        assert!(matches!(
            endpoints_event(
                watcher::Event::InitApply(endpoints("ns1", headless)),
                &link(),
                "multicluster",
            ),
            Some(Event::RemoteEndpointsCreated(_))
        ));
    }

    #[test]
    fn endpoints_updates_skip_remote_discovery() {
        let remote_discovery = &[("mirror.linkerd.io/exported", "remote-discovery")];
        let exported = &[("mirror.linkerd.io/exported", "true")];

        assert!(endpoints_event(
            watcher::Event::Apply(endpoints("ns1", remote_discovery)),
            &link(),
            "multicluster",
        )
        .is_none());

        assert!(matches!(
            endpoints_event(
                watcher::Event::Apply(endpoints("ns1", exported)),
                &link(),
                "multicluster",
            ),
            Some(Event::RemoteEndpointsUpdated(_))
        ));
    }

    #[test]
    fn endpoints_ignore_the_control_plane_namespace() {
        let exported = &[("mirror.linkerd.io/exported", "true")];

        assert!(endpoints_event(
            watcher::Event::Apply(endpoints("multicluster", exported)),
            &link(),
            "multicluster",
        )
        .is_none());
    }

    #[test]
    fn unexported_endpoints_produce_no_events() {
        // Empty selectors match nothing, so nothing is ever translated.
        let mut empty = link();
        empty.selector = Selector::default();
        empty.remote_discovery_selector = Selector::default();

        let labeled = &[
            ("mirror.linkerd.io/exported", "true"),
            ("service.kubernetes.io/headless", ""),
        ];

        assert!(endpoints_event(
            watcher::Event::Apply(endpoints("ns1", labeled)),
            &empty,
            "multicluster",
        )
        .is_none());
        assert!(endpoints_event(
            watcher::Event::InitApply(endpoints("ns1", labeled)),
            &empty,
            "multicluster",
        )
        .is_none());
    }

    #[test]
    fn watch_events_translate_to_typed_events() {
        let service = Service {
            metadata: ObjectMeta {
                name: Some("service-one".to_string()),
                namespace: Some("ns1".to_string()),
                ..Default::default()
            },
            ..Default::default()
        };

        assert!(matches!(
            service_event(watcher::Event::InitApply(service.clone())),
            Some(Event::RemoteServiceCreated(_))
        ));
        assert!(matches!(
            service_event(watcher::Event::Apply(service.clone())),
            Some(Event::RemoteServiceUpdated(_))
        ));
        assert!(matches!(
            service_event(watcher::Event::Delete(service)),
            Some(Event::RemoteServiceDeleted(_))
        ));
        assert!(service_event(watcher::Event::Init).is_none());
        assert!(service_event(watcher::Event::InitDone).is_none());
    }
}
