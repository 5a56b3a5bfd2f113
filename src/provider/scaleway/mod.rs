//! Scaleway adapter: Instances API for servers, Domains API for DNS.

mod api;

use std::collections::BTreeMap;
use std::net::IpAddr;
use std::str::FromStr;
use std::time::{Duration, Instant};

use reqwest::header::CONTENT_TYPE;
use scaleway_rs::{ScalewayApi, ScalewayImage, ScalewayListInstanceImagesBuilder};
use tokio::time::sleep;
use tracing::{debug, info};

use crate::config::ScalewayConfig;
use crate::dns::{DnsHost, split_domain};
use crate::http::{HTTP_CLIENT, send};
use crate::provider::{
    Provider, ProviderError, ProviderFuture, Region, Server, ServerConfig, Size,
};

use api::{
    CreateServerRequest, CreateServerResponse, DOMAIN_API_BASE, INSTANCE_API_BASE,
    ProductsResponse, RecordChanges, user_data_url,
};

/// Registry name.
pub const NAME: &str = "scaleway";

const POLL_INTERVAL: Duration = Duration::from_secs(5);
const WAIT_TIMEOUT: Duration = Duration::from_secs(300);
const DNS_TTL: u32 = 300;

const ZONES: &[(&str, &str)] = &[
    ("fr-par-1", "Paris 1"),
    ("fr-par-2", "Paris 2"),
    ("fr-par-3", "Paris 3"),
    ("nl-ams-1", "Amsterdam 1"),
    ("nl-ams-2", "Amsterdam 2"),
    ("nl-ams-3", "Amsterdam 3"),
    ("pl-waw-1", "Warsaw 1"),
    ("pl-waw-2", "Warsaw 2"),
    ("pl-waw-3", "Warsaw 3"),
];

/// Server identifier qualified by its zone, written `zone/uuid`.
#[derive(Clone, Debug, Eq, PartialEq)]
pub(crate) struct ServerRef {
    zone: String,
    id: String,
}

impl ServerRef {
    fn parse(value: &str, default_zone: &str) -> Self {
        match value.split_once('/') {
            Some((zone, id)) => Self {
                zone: zone.to_owned(),
                id: id.to_owned(),
            },
            None => Self {
                zone: default_zone.to_owned(),
                id: value.to_owned(),
            },
        }
    }

    fn qualified(&self) -> String {
        format!("{}/{}", self.zone, self.id)
    }
}

/// Provider backed by the Scaleway APIs.
#[derive(Clone)]
pub struct ScalewayProvider {
    config: ScalewayConfig,
    api: Option<ScalewayApi>,
    poll_interval: Duration,
    wait_timeout: Duration,
}

impl std::fmt::Debug for ScalewayProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScalewayProvider")
            .field("zone", &self.config.default_zone)
            .field("configured", &!self.needs_config())
            .finish_non_exhaustive()
    }
}

impl ScalewayProvider {
    /// Creates an adapter from loaded configuration; credentials may still be
    /// supplied later through [`Provider::configure`].
    #[must_use]
    pub fn new(config: ScalewayConfig) -> Self {
        let api = config
            .secret_key
            .as_deref()
            .filter(|key| !key.trim().is_empty())
            .map(ScalewayApi::new);
        Self {
            config,
            api,
            poll_interval: POLL_INTERVAL,
            wait_timeout: WAIT_TIMEOUT,
        }
    }

    fn not_configured(field: &str) -> ProviderError {
        ProviderError::NotConfigured {
            provider: NAME.to_owned(),
            field: field.to_owned(),
        }
    }

    fn api(&self) -> Result<&ScalewayApi, ProviderError> {
        self.api.as_ref().ok_or_else(|| Self::not_configured("secret_key"))
    }

    fn secret_key(&self) -> Result<&str, ProviderError> {
        self.config
            .secret_key
            .as_deref()
            .ok_or_else(|| Self::not_configured("secret_key"))
    }

    fn project_id(&self) -> Result<&str, ProviderError> {
        self.config
            .default_project_id
            .as_deref()
            .filter(|id| !id.trim().is_empty())
            .ok_or_else(|| Self::not_configured("project_id"))
    }

    fn api_error(err: impl ToString) -> ProviderError {
        ProviderError::api(NAME, err.to_string())
    }

    async fn fetch_sizes(&self, zone: &str) -> Result<Vec<Size>, ProviderError> {
        let url = format!("{INSTANCE_API_BASE}/zones/{zone}/products/servers?per_page=100");
        let response = send(HTTP_CLIENT.get(&url).header("X-Auth-Token", self.secret_key()?))
            .await
            .map_err(Self::api_error)?;
        if !response.status.is_success() {
            return Err(Self::api_error(response.text()));
        }
        let products: ProductsResponse =
            serde_json::from_slice(&response.body).map_err(Self::api_error)?;
        Ok(products.into_sizes(zone))
    }

    async fn resolve_image_id(&self, zone: &str, image: &str) -> Result<String, ProviderError> {
        if uuid::Uuid::parse_str(image).is_ok() {
            return Ok(image.to_owned());
        }
        let images = ScalewayListInstanceImagesBuilder::new(self.api()?.clone(), zone)
            .public(true)
            .name(image)
            .arch(&self.config.default_architecture)
            .run_async()
            .await
            .map_err(Self::api_error)?;
        select_image_id(images, &self.config.default_architecture).ok_or_else(|| {
            Self::api_error(format!(
                "image '{image}' ({}) not found in zone {zone}",
                self.config.default_architecture
            ))
        })
    }

    async fn create_stopped(
        &self,
        zone: &str,
        image_id: String,
        config: &ServerConfig,
    ) -> Result<scaleway_rs::ScalewayInstance, ProviderError> {
        let payload = CreateServerRequest {
            name: config.name.clone(),
            commercial_type: config.size.clone(),
            image: image_id,
            project: self.project_id()?.to_owned(),
            routed_ip_enabled: true,
            dynamic_ip_required: true,
            tags: config.tags.clone(),
            stopped: true,
            organization: self.config.default_organization_id.clone(),
        };
        let url = format!("{INSTANCE_API_BASE}/zones/{zone}/servers");
        let response = send(
            HTTP_CLIENT
                .post(&url)
                .header("X-Auth-Token", self.secret_key()?)
                .json(&payload),
        )
        .await
        .map_err(Self::api_error)?;

        if !response.status.is_success() {
            if let Ok(api_err) = serde_json::from_slice::<scaleway_rs::ScalewayApiError>(&response.body)
                && matches!(api_err.resource.as_deref(), Some("commercial_type"))
            {
                return Err(Self::api_error(format!(
                    "instance type '{}' not available in zone {zone}",
                    config.size
                )));
            }
            return Err(Self::api_error(response.text()));
        }
        let parsed: CreateServerResponse =
            serde_json::from_slice(&response.body).map_err(Self::api_error)?;
        Ok(parsed.server)
    }

    async fn put_user_data(&self, server: &ServerRef, user_data: &str) -> Result<(), ProviderError> {
        let response = send(
            HTTP_CLIENT
                .patch(user_data_url(&server.zone, &server.id))
                .header("X-Auth-Token", self.secret_key()?)
                .header(CONTENT_TYPE, "text/plain")
                .body(user_data.to_owned()),
        )
        .await
        .map_err(Self::api_error)?;
        if response.status.is_success() {
            Ok(())
        } else {
            Err(Self::api_error(response.text()))
        }
    }

    async fn fetch_server(&self, server: &ServerRef) -> Result<Option<Server>, ProviderError> {
        let mut servers = self
            .api()?
            .list_instances(&server.zone)
            .servers(&server.id)
            .per_page(1)
            .run_async()
            .await
            .map_err(Self::api_error)?;

        Ok(servers.pop().map(|instance| Server {
            id: server.qualified(),
            name: instance.name,
            ip: instance
                .public_ip
                .and_then(|ip| IpAddr::from_str(&ip.address).ok()),
            status: instance.state,
        }))
    }
}

fn select_image_id(mut images: Vec<ScalewayImage>, arch: &str) -> Option<String> {
    images.retain(|image| image.arch == arch && image.state == "available");
    images.sort_by(|lhs, rhs| rhs.creation_date.cmp(&lhs.creation_date));
    images.into_iter().next().map(|image| image.id)
}

impl Provider for ScalewayProvider {
    fn name(&self) -> &str {
        NAME
    }

    fn dns_host(&self) -> DnsHost {
        DnsHost::Scaleway
    }

    fn list_regions(&self) -> ProviderFuture<'_, Vec<Region>> {
        Box::pin(async move {
            Ok(ZONES
                .iter()
                .map(|(id, name)| Region {
                    id: (*id).to_owned(),
                    name: (*name).to_owned(),
                })
                .collect())
        })
    }

    fn list_sizes(&self) -> ProviderFuture<'_, Vec<Size>> {
        Box::pin(async move { self.fetch_sizes(&self.config.default_zone).await })
    }

    fn list_sizes_for_region<'a>(&'a self, region: &'a str) -> ProviderFuture<'a, Vec<Size>> {
        Box::pin(async move { self.fetch_sizes(region).await })
    }

    fn create_server<'a>(&'a self, config: &'a ServerConfig) -> ProviderFuture<'a, Server> {
        Box::pin(async move {
            let zone = if config.region.is_empty() {
                self.config.default_zone.clone()
            } else {
                config.region.clone()
            };
            let image = config
                .image
                .clone()
                .unwrap_or_else(|| self.config.default_image.clone());
            let image_id = self.resolve_image_id(&zone, &image).await?;

            let instance = self.create_stopped(&zone, image_id, config).await?;
            let server = ServerRef {
                zone: zone.clone(),
                id: instance.id.clone(),
            };
            debug!(server = %server.qualified(), "created stopped instance");

            if let Some(user_data) = &config.user_data {
                self.put_user_data(&server, user_data).await?;
            }
            self.api()?
                .perform_instance_action_async(&zone, &server.id, "poweron")
                .await
                .map_err(Self::api_error)?;
            info!(server = %server.qualified(), "powered on instance");

            Ok(Server {
                id: server.qualified(),
                name: config.name.clone(),
                ip: None,
                status: instance.state,
            })
        })
    }

    fn wait_for_server<'a>(&'a self, id: &'a str) -> ProviderFuture<'a, Server> {
        Box::pin(async move {
            let server = ServerRef::parse(id, &self.config.default_zone);
            let deadline = Instant::now() + self.wait_timeout;
            let mut saw_running = false;

            while Instant::now() <= deadline {
                if let Some(snapshot) = self.fetch_server(&server).await?
                    && snapshot.status == "running"
                {
                    saw_running = true;
                    if snapshot.ip.is_some() {
                        return Ok(snapshot);
                    }
                }
                sleep(self.poll_interval).await;
            }

            if saw_running {
                return Err(ProviderError::MissingPublicIp {
                    server_id: server.qualified(),
                });
            }
            Err(ProviderError::Timeout {
                action: String::from("wait_for_server"),
                server_id: server.qualified(),
            })
        })
    }

    fn destroy_server<'a>(&'a self, id: &'a str) -> ProviderFuture<'a, ()> {
        Box::pin(async move {
            let server = ServerRef::parse(id, &self.config.default_zone);
            self.api()?
                .perform_instance_action_async(&server.zone, &server.id, "terminate")
                .await
                .map_err(Self::api_error)
        })
    }

    fn setup_dns<'a>(&'a self, domain: &'a str, ip: IpAddr) -> ProviderFuture<'a, ()> {
        Box::pin(async move {
            let (root, name) = split_domain(domain);
            let url = format!("{DOMAIN_API_BASE}/dns-zones/{root}/records");
            let response = send(
                HTTP_CLIENT
                    .patch(&url)
                    .header("X-Auth-Token", self.secret_key()?)
                    .json(&RecordChanges::address(&name, ip, DNS_TTL)),
            )
            .await
            .map_err(Self::api_error)?;
            if response.status.is_success() {
                info!(domain, %ip, "updated Scaleway DNS zone");
                Ok(())
            } else {
                Err(Self::api_error(response.text()))
            }
        })
    }

    fn configure(&mut self, settings: &BTreeMap<String, String>) -> Result<(), ProviderError> {
        for (key, value) in settings {
            match key.as_str() {
                "secret_key" | "token" => {
                    self.api = Some(ScalewayApi::new(value));
                    self.config.secret_key = Some(value.clone());
                }
                "project_id" => self.config.default_project_id = Some(value.clone()),
                "organization_id" => self.config.default_organization_id = Some(value.clone()),
                "zone" => self.config.default_zone.clone_from(value),
                _ => {
                    return Err(ProviderError::UnknownSetting {
                        provider: NAME.to_owned(),
                        key: key.clone(),
                    });
                }
            }
        }
        Ok(())
    }

    fn needs_config(&self) -> bool {
        self.api.is_none() || self.project_id().is_err()
    }
}
