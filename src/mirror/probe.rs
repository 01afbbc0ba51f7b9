//! Gateway liveness probe.
//!
//! Periodic HTTP GET against the resolved gateway addresses; a run of
//! failures past the threshold flips the liveness channel to false, any
//! success flips it back. The watcher consumes the channel and reshapes
//! endpoint readiness from it.

use std::net::IpAddr;

use eyre::Result;
use tokio::{sync::watch, task::JoinHandle};
use tokio_util::sync::CancellationToken;

use super::gateway::GatewayResolver;
use crate::link::ProbeSpec;

pub struct GatewayProbe {
    spec: ProbeSpec,
    gateway_address: String,
    resolver: GatewayResolver,
    client: reqwest::Client,
    tx: watch::Sender<bool>,
}

impl GatewayProbe {
    /// Starts probing in the background. The receiver starts out alive;
    /// a genuinely dead gateway flips it within one threshold's worth of
    /// periods.
    pub fn spawn(
        spec: ProbeSpec,
        gateway_address: String,
        shutdown: CancellationToken,
    ) -> Result<(watch::Receiver<bool>, JoinHandle<()>)> {
        let client = reqwest::Client::builder().timeout(spec.timeout()?).build()?;
        let (tx, rx) = watch::channel(true);

        let probe = Self {
            spec,
            gateway_address,
            resolver: GatewayResolver::from_system_conf()?,
            client,
            tx,
        };

        Ok((rx, tokio::spawn(probe.run(shutdown))))
    }

    async fn run(self, shutdown: CancellationToken) {
        let period = match self.spec.period() {
            Ok(period) => period,
            Err(err) => {
                tracing::error!(%err, "not probing");
                return;
            }
        };

        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        let mut failures = 0_u32;

        loop {
            tokio::select! {
                () = shutdown.cancelled() => break,
                _ = interval.tick() => {}
            }

            if self.check().await {
                failures = 0;
                self.tx.send_replace(true);
            } else {
                failures = failures.saturating_add(1);

                if failures >= self.spec.failure_threshold {
                    self.tx.send_replace(false);
                }
            }
        }
    }

    /// One gateway answering is enough.
    async fn check(&self) -> bool {
        let Ok(addresses) = self.resolver.resolve(&self.gateway_address).await else {
            return false;
        };

        for address in addresses {
            let url = probe_url(address, self.spec.port, &self.spec.path);

            match self.client.get(&url).send().await {
                Ok(response) if response.status().is_success() => return true,
                Ok(response) => {
                    tracing::debug!(url, status = %response.status(), "gateway probe failed");
                }
                Err(err) => tracing::debug!(url, %err, "gateway probe failed"),
            }
        }

        false
    }
}

fn probe_url(address: IpAddr, port: u16, path: &str) -> String {
    let path = path.trim_start_matches('/');

    match address {
        IpAddr::V4(ip) => format!("http://{ip}:{port}/{path}"),
        IpAddr::V6(ip) => format!("http://[{ip}]:{port}/{path}"),
    }
}
