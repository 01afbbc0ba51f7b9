use cata::{Command, Container};
use clap::{Parser, Subcommand};
use eyre::Result;
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::{
    api::{Api, DeleteParams, PatchParams, PostParams, ResourceExt},
    Client, CustomResourceExt,
};
use serde::Serialize;
use tracing::info;

use crate::link::Link;

pub static MANAGER: &str = "svc-mirror.dev";

fn all() -> Vec<CustomResourceDefinition> {
    vec![Link::crd()]
}

#[derive(Parser, Container)]
pub struct Resources {
    #[command(subcommand)]
    command: ResourcesCmd,
}

#[derive(Subcommand, Container)]
enum ResourcesCmd {
    Apply(Apply),
    Delete(Delete),
    Manifest(Manifest),
}

impl Command for Resources {}

#[derive(Parser, Container)]
pub struct Apply {
    /// Fail instead of updating resources that already exist
    #[arg(long)]
    no_update: bool,
}

#[async_trait::async_trait]
impl Command for Apply {
    async fn run(&self) -> Result<()> {
        let client: Api<CustomResourceDefinition> = Api::all(Client::try_default().await?);

        for resource in all() {
            info!("creating/updating CRD: {}", resource.name_any());

            if self.no_update {
                client.create(&PostParams::default(), &resource).await?;
            } else {
                client
                    .patch(
                        &resource.name_any(),
                        &PatchParams::apply(MANAGER).force(),
                        &kube::api::Patch::Apply(&resource),
                    )
                    .await?;
            }
        }

        Ok(())
    }
}

#[derive(Parser, Container)]
pub struct Delete {}

#[async_trait::async_trait]
impl Command for Delete {
    #[allow(clippy::blocks_in_conditions)]
    #[tracing::instrument(err, skip(self), fields(activity = "resources.delete"))]
    async fn run(&self) -> Result<()> {
        let client: Api<CustomResourceDefinition> = Api::all(Client::try_default().await?);

        for resource in all() {
            client
                .delete(&resource.name_any(), &DeleteParams::default())
                .await?;

            info!(name = resource.name_any(), "deleted CRD");
        }

        Ok(())
    }
}

#[derive(Parser, Container)]
pub struct Manifest {}

#[async_trait::async_trait]
impl Command for Manifest {
    #[allow(clippy::blocks_in_conditions)]
    #[tracing::instrument(err, skip(self), fields(activity = "resources.manifest"))]
    async fn run(&self) -> Result<()> {
        let mut serializer = serde_yaml::Serializer::new(std::io::stdout());
        for resource in all() {
            resource.serialize(&mut serializer)?;
        }

        Ok(())
    }
}
