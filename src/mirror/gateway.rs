//! Resolves the Link's gateway host list into a stable-ordered address set.

use std::net::IpAddr;

use eyre::{eyre, Report, Result};
use hickory_resolver::TokioAsyncResolver;
use itertools::Itertools;

use super::ReconcileError;

pub struct GatewayResolver {
    resolver: TokioAsyncResolver,
}

impl GatewayResolver {
    pub fn from_system_conf() -> Result<Self> {
        Ok(Self {
            resolver: TokioAsyncResolver::tokio_from_system_conf()?,
        })
    }

    /// Resolves every entry of a comma-separated host list. Entries that fail
    /// to resolve are logged and skipped; only a wholly unresolvable list is
    /// an error, so a single dead DNS name cannot take down every mirror.
    pub async fn resolve(&self, gateway_address: &str) -> Result<Vec<IpAddr>, ReconcileError> {
        let mut addresses = Vec::new();
        let mut errors: Vec<Report> = Vec::new();

        for entry in entries(gateway_address) {
            if let Ok(ip) = entry.parse::<IpAddr>() {
                addresses.push(ip);
                continue;
            }

            match self.resolver.lookup_ip(entry).await {
                Ok(lookup) => {
                    let found: Vec<IpAddr> = lookup.iter().collect();

                    if found.is_empty() {
                        errors.push(eyre!("no addresses for gateway host {entry}"));
                    } else {
                        addresses.extend(found);
                    }
                }
                Err(err) => {
                    tracing::warn!(host = entry, %err, "failed to resolve gateway host");
                    errors.push(eyre!(err).wrap_err(format!("resolving gateway host {entry}")));
                }
            }
        }

        if addresses.is_empty() && !errors.is_empty() {
            return Err(ReconcileError::Retryable(errors));
        }

        Ok(stable(addresses))
    }
}

pub(crate) fn entries(gateway_address: &str) -> impl Iterator<Item = &str> {
    gateway_address
        .split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
}

/// Ascending by string form so that repeated resolutions of an unchanged
/// gateway produce byte-identical endpoint subsets.
pub(crate) fn stable(addresses: Vec<IpAddr>) -> Vec<IpAddr> {
    addresses
        .into_iter()
        .sorted_by_key(ToString::to_string)
        .dedup()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entries_split_and_trim() {
        let parsed: Vec<_> = entries("gateway.example.com, 192.0.2.127 ,,").collect();
        assert_eq!(parsed, vec!["gateway.example.com", "192.0.2.127"]);

        assert_eq!(entries("").count(), 0);
    }

    #[test]
    fn addresses_sort_by_string_form() {
        let stable = stable(vec![
            "192.0.2.9".parse().unwrap(),
            "192.0.2.127".parse().unwrap(),
            "192.0.2.127".parse().unwrap(),
            "10.0.0.1".parse().unwrap(),
        ]);

        let strings: Vec<_> = stable.iter().map(ToString::to_string).collect();
        assert_eq!(strings, vec!["10.0.0.1", "192.0.2.127", "192.0.2.9"]);
    }
}
