use std::{collections::HashMap, time::Duration};

use cata::{output::Format, Command, Container};
use clap::Parser;
use eyre::{eyre, Result};
use futures::StreamExt;
use k8s_openapi::api::core::v1::Secret;
use kube::{
    api::Api,
    config::{KubeConfigOptions, Kubeconfig},
    runtime::{watcher, WatchStreamExt},
    Client, Config, ResourceExt,
};
use tokio::{sync::watch, task::JoinHandle};
use tokio_util::sync::CancellationToken;

use crate::{
    link::Link,
    mirror::{
        probe::GatewayProbe,
        watcher::{RemoteClusterServiceWatcher, Settings},
    },
};

static KUBECONFIG_KEY: &str = "kubeconfig";

/// Runs one service-mirror watcher per Link in the controller namespace.
#[derive(Parser, Container)]
pub struct Serve {
    #[clap(from_global)]
    pub output: Format,

    /// Namespace this controller and its Link objects live in
    #[arg(long, env = "SVC_MIRROR_NAMESPACE", default_value = "multicluster")]
    namespace: String,

    /// Retries before a failing event is dropped
    #[arg(long, default_value_t = 3)]
    requeue_limit: u32,

    /// How often mirror endpoints are reconciled against the gateway
    #[arg(long, default_value = "1m", value_parser = humantime::parse_duration)]
    repair_period: Duration,

    /// How often local mirrors are swept for deleted remote originals
    #[arg(long, default_value = "10m", value_parser = humantime::parse_duration)]
    gc_period: Duration,

    /// Mirror headless services instead of skipping them
    #[arg(long)]
    enable_headless_services: bool,

    /// Create missing local namespaces for mirrored services
    #[arg(long)]
    enable_namespace_creation: bool,
}

#[async_trait::async_trait]
impl Command for Serve {
    async fn run(&self) -> Result<()> {
        let client = Client::try_default().await?;
        let links: Api<Link> = Api::namespaced(client.clone(), &self.namespace);

        let mut running: HashMap<String, Running> = HashMap::new();
        let mut stream = watcher(links, watcher::Config::default())
            .default_backoff()
            .boxed();

        while let Some(event) = stream.next().await {
            match event {
                Ok(watcher::Event::InitApply(link) | watcher::Event::Apply(link)) => {
                    self.link_changed(&client, &mut running, link).await;
                }
                Ok(watcher::Event::Delete(link)) => {
                    let name = link.name_any();

                    if let Some(previous) = running.remove(&name) {
                        tracing::info!(link = name, "unlinking cluster");
                        previous.stop(true).await;
                    }
                }
                Ok(_) => {}
                Err(err) => tracing::warn!(%err, "link watch failed"),
            }
        }

        for (name, previous) in running {
            tracing::info!(link = name, "shutting down");
            previous.stop(false).await;
        }

        Ok(())
    }
}

impl Serve {
    async fn link_changed(
        &self,
        client: &Client,
        running: &mut HashMap<String, Running>,
        link: Link,
    ) {
        let name = link.name_any();

        if let Some(existing) = running.get(&name) {
            // Status patches bump the resource version constantly; only a
            // spec change (new generation) warrants a restart.
            if existing.generation == link.metadata.generation {
                return;
            }

            if let Some(previous) = running.remove(&name) {
                tracing::info!(link = name, "link changed, restarting watcher");
                previous.stop(false).await;
            }
        }

        match self.start_link(client, &link).await {
            Ok(run) => {
                tracing::info!(
                    link = name,
                    target = link.spec.target_cluster_name,
                    "watching linked cluster"
                );
                running.insert(name, run);
            }
            Err(err) => tracing::error!(link = name, %err, "failed to start watcher"),
        }
    }

    async fn start_link(&self, client: &Client, link: &Link) -> Result<Running> {
        let spec = link.spec.clone();
        let shutdown = CancellationToken::new();

        let remote = if spec.cluster_credentials_secret.is_empty() {
            client.clone()
        } else {
            remote_client(client, &self.namespace, &spec.cluster_credentials_secret).await?
        };

        let (liveness, probe) = match &spec.probe_spec {
            Some(probe_spec) if !spec.gateway_address.is_empty() => {
                let (rx, task) = GatewayProbe::spawn(
                    probe_spec.clone(),
                    spec.gateway_address.clone(),
                    shutdown.clone(),
                )?;

                (rx, Some(task))
            }
            _ => {
                let (_, rx) = watch::channel(true);
                (rx, None)
            }
        };

        let settings = Settings {
            link_name: link.name_any(),
            namespace: self.namespace.clone(),
            link: spec,
            requeue_limit: self.requeue_limit,
            repair_period: self.repair_period,
            gc_period: self.gc_period,
            headless_enabled: self.enable_headless_services,
            namespace_creation_enabled: self.enable_namespace_creation,
        };

        let watcher = RemoteClusterServiceWatcher::start(settings, client.clone(), remote, liveness)?;

        Ok(Running {
            generation: link.metadata.generation,
            watcher,
            probe,
            shutdown,
        })
    }
}

struct Running {
    generation: Option<i64>,
    watcher: RemoteClusterServiceWatcher,
    probe: Option<JoinHandle<()>>,
    shutdown: CancellationToken,
}

impl Running {
    async fn stop(self, cleanup_state: bool) {
        self.shutdown.cancel();

        if let Some(probe) = self.probe {
            probe.abort();
        }

        self.watcher.stop(cleanup_state).await;
    }
}

async fn remote_client(client: &Client, namespace: &str, secret_name: &str) -> Result<Client> {
    let secret = Api::<Secret>::namespaced(client.clone(), namespace)
        .get(secret_name)
        .await?;

    let data = secret.data.unwrap_or_default();
    let kubeconfig = data
        .get(KUBECONFIG_KEY)
        .ok_or_else(|| eyre!("secret {namespace}/{secret_name} has no {KUBECONFIG_KEY} key"))?;

    let kubeconfig: Kubeconfig = serde_yaml::from_slice(&kubeconfig.0)?;
    let config = Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default()).await?;

    Client::try_from(config).map_err(Into::into)
}
