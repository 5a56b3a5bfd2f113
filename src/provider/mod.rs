//! Cloud provider contract and registry.
//!
//! Every backend implements [`Provider`]: region and size listing, the server
//! lifecycle, and provider-native DNS. The orchestrator only ever talks to a
//! `Box<dyn Provider>` obtained from a [`ProviderRegistry`], so fakes can be
//! registered in tests the same way real backends are at startup.

use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::net::IpAddr;
use std::pin::Pin;
use std::sync::Arc;

use thiserror::Error;

use crate::dns::DnsHost;

pub mod digitalocean;
pub mod scaleway;

pub use digitalocean::DigitalOceanProvider;
pub use scaleway::ScalewayProvider;

/// Future returned by provider operations.
pub type ProviderFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, ProviderError>> + Send + 'a>>;

/// Minimum hardware an application needs.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct MinSpec {
    /// Virtual CPUs.
    pub cpu: u32,
    /// Memory in megabytes.
    pub ram_mb: u64,
    /// Disk in gigabytes.
    pub disk_gb: u64,
}

/// A location servers can be created in.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Region {
    /// Provider identifier (for example `fr-par-1` or `ams3`).
    pub id: String,
    /// Display name.
    pub name: String,
}

/// A purchasable server size.
#[derive(Clone, Debug, PartialEq)]
pub struct Size {
    /// Provider identifier (for example `DEV1-S` or `s-1vcpu-1gb`).
    pub id: String,
    /// Virtual CPUs.
    pub vcpus: u32,
    /// Memory in megabytes.
    pub memory_mb: u64,
    /// Included disk in gigabytes.
    pub disk_gb: u64,
    /// Monthly price in the provider's currency.
    pub price_monthly: f64,
    /// Regions offering the size; empty means everywhere.
    pub regions: Vec<String>,
}

/// Parameters for [`Provider::create_server`].
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct ServerConfig {
    /// Server name.
    pub name: String,
    /// Region identifier.
    pub region: String,
    /// Size identifier.
    pub size: String,
    /// Image override; providers fall back to their configured default.
    pub image: Option<String>,
    /// Cloud-init user-data passed to the first boot.
    pub user_data: Option<String>,
    /// Tags attached to the server.
    pub tags: Vec<String>,
}

/// A server created by a provider. Never mutated after creation; polling
/// returns fresh values.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Server {
    /// Provider identifier.
    pub id: String,
    /// Server name.
    pub name: String,
    /// Public IPv4 address once assigned.
    pub ip: Option<IpAddr>,
    /// Provider status string (for example `running` or `active`).
    pub status: String,
}

/// Errors returned by providers.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum ProviderError {
    /// No provider is registered under the name.
    #[error("unknown provider '{0}'")]
    UnknownProvider(String),
    /// A credential or setting is missing.
    #[error("{provider} is not configured: missing {field}")]
    NotConfigured {
        /// Provider name.
        provider: String,
        /// Missing setting.
        field: String,
    },
    /// A setting passed to [`Provider::configure`] is not recognised.
    #[error("{provider} does not accept setting '{key}'")]
    UnknownSetting {
        /// Provider name.
        provider: String,
        /// Rejected key.
        key: String,
    },
    /// The provider API reported a failure.
    #[error("{provider} API error: {message}")]
    Api {
        /// Provider name.
        provider: String,
        /// Message returned by the API or transport.
        message: String,
    },
    /// No size satisfies the minimum requirements.
    #[error("no matching size for {cpu} vCPU / {ram_mb} MB")]
    NoMatchingSize {
        /// Requested vCPUs.
        cpu: u32,
        /// Requested memory in megabytes.
        ram_mb: u64,
    },
    /// A wait loop exceeded its deadline.
    #[error("timeout waiting for {action} on server {server_id}")]
    Timeout {
        /// Action being waited on.
        action: String,
        /// Server identifier.
        server_id: String,
    },
    /// The server became active without a public IPv4 address.
    #[error("server {server_id} has no public IPv4 address")]
    MissingPublicIp {
        /// Server identifier.
        server_id: String,
    },
}

impl ProviderError {
    pub(crate) fn api(provider: &str, message: impl Into<String>) -> Self {
        Self::Api {
            provider: provider.to_owned(),
            message: message.into(),
        }
    }
}

/// Capability interface every cloud backend implements.
pub trait Provider: Send + Sync {
    /// Registry name (for example `scaleway`).
    fn name(&self) -> &str;

    /// DNS host signature matching this provider's nameservers.
    fn dns_host(&self) -> DnsHost;

    /// Lists regions servers can be created in.
    fn list_regions(&self) -> ProviderFuture<'_, Vec<Region>>;

    /// Lists every size the provider sells.
    fn list_sizes(&self) -> ProviderFuture<'_, Vec<Size>>;

    /// Lists sizes available in `region`. The default filters
    /// [`Provider::list_sizes`] by each size's region list.
    fn list_sizes_for_region<'a>(&'a self, region: &'a str) -> ProviderFuture<'a, Vec<Size>> {
        Box::pin(async move {
            let sizes = self.list_sizes().await?;
            Ok(sizes
                .into_iter()
                .filter(|size| size.regions.is_empty() || size.regions.iter().any(|r| r == region))
                .collect())
        })
    }

    /// Returns the cheapest size meeting `min`.
    fn get_size_for_specs<'a>(&'a self, min: &'a MinSpec) -> ProviderFuture<'a, String> {
        Box::pin(async move {
            let sizes = self.list_sizes().await?;
            select_size_for_specs(&sizes, min)
        })
    }

    /// Creates a server.
    fn create_server<'a>(&'a self, config: &'a ServerConfig) -> ProviderFuture<'a, Server>;

    /// Polls until the server is active with a public IP.
    fn wait_for_server<'a>(&'a self, id: &'a str) -> ProviderFuture<'a, Server>;

    /// Destroys a server.
    fn destroy_server<'a>(&'a self, id: &'a str) -> ProviderFuture<'a, ()>;

    /// Points `domain` at `ip` using the provider's DNS service.
    fn setup_dns<'a>(&'a self, domain: &'a str, ip: IpAddr) -> ProviderFuture<'a, ()>;

    /// Applies caller-supplied settings such as API tokens.
    ///
    /// # Errors
    ///
    /// Returns [`ProviderError::UnknownSetting`] for keys the provider does
    /// not understand.
    fn configure(&mut self, settings: &BTreeMap<String, String>) -> Result<(), ProviderError>;

    /// Whether required credentials are still missing.
    fn needs_config(&self) -> bool;
}

/// Picks the cheapest size whose vCPUs and memory meet `min`. Ties keep the
/// first size encountered.
///
/// # Errors
///
/// Returns [`ProviderError::NoMatchingSize`] when no size qualifies.
pub fn select_size_for_specs(sizes: &[Size], min: &MinSpec) -> Result<String, ProviderError> {
    let mut best: Option<&Size> = None;
    for size in sizes
        .iter()
        .filter(|size| size.vcpus >= min.cpu && size.memory_mb >= min.ram_mb)
    {
        if best.is_none_or(|current| size.price_monthly < current.price_monthly) {
            best = Some(size);
        }
    }
    best.map(|size| size.id.clone())
        .ok_or(ProviderError::NoMatchingSize {
            cpu: min.cpu,
            ram_mb: min.ram_mb,
        })
}

/// Constructor producing a fresh provider instance per deployment.
pub type ProviderFactory = Arc<dyn Fn() -> Box<dyn Provider> + Send + Sync>;

/// Providers available to the orchestrator, keyed by name.
#[derive(Clone, Default)]
pub struct ProviderRegistry {
    factories: BTreeMap<String, ProviderFactory>,
}

impl fmt::Debug for ProviderRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProviderRegistry")
            .field("providers", &self.factories.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl ProviderRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `factory` under `name`, replacing any previous entry.
    pub fn register<F>(&mut self, name: &str, factory: F)
    where
        F: Fn() -> Box<dyn Provider> + Send + Sync + 'static,
    {
        self.factories.insert(name.to_owned(), Arc::new(factory));
    }

    /// Builds a new provider instance.
    ///
    /// # Errors
    ///
    /// Returns [`ProviderError::UnknownProvider`] when `name` is not registered.
    pub fn create(&self, name: &str) -> Result<Box<dyn Provider>, ProviderError> {
        self.factories
            .get(name)
            .map(|factory| factory())
            .ok_or_else(|| ProviderError::UnknownProvider(name.to_owned()))
    }

    /// Registered provider names in order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.factories.keys().map(String::as_str)
    }
}

#[cfg(test)]
mod tests;
