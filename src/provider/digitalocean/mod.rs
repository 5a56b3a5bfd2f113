//! DigitalOcean adapter over the public v2 REST API.

use std::collections::BTreeMap;
use std::net::IpAddr;
use std::str::FromStr;
use std::time::{Duration, Instant};

use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use tokio::time::sleep;
use tracing::info;

use crate::config::DigitalOceanConfig;
use crate::dns::{DnsHost, split_domain};
use crate::http::{HTTP_CLIENT, RawResponse, send};
use crate::provider::{Provider, ProviderError, ProviderFuture, Region, Server, ServerConfig, Size};

/// Registry name.
pub const NAME: &str = "digitalocean";

const API_BASE: &str = "https://api.digitalocean.com/v2";
const POLL_INTERVAL: Duration = Duration::from_secs(5);
const WAIT_TIMEOUT: Duration = Duration::from_secs(300);
const DNS_TTL: u32 = 1800;

#[derive(Debug, Deserialize)]
struct RegionsResponse {
    regions: Vec<ApiRegion>,
}

#[derive(Debug, Deserialize)]
struct ApiRegion {
    slug: String,
    name: String,
    #[serde(default)]
    available: bool,
}

#[derive(Debug, Deserialize)]
struct SizesResponse {
    sizes: Vec<ApiSize>,
}

#[derive(Debug, Deserialize)]
struct ApiSize {
    slug: String,
    memory: u64,
    vcpus: u32,
    disk: u64,
    price_monthly: f64,
    #[serde(default)]
    regions: Vec<String>,
    #[serde(default = "available_by_default")]
    available: bool,
}

const fn available_by_default() -> bool {
    true
}

#[derive(Debug, Serialize)]
struct CreateDroplet<'a> {
    name: &'a str,
    region: &'a str,
    size: &'a str,
    image: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    user_data: Option<&'a str>,
    tags: &'a [String],
}

#[derive(Debug, Deserialize)]
struct DropletResponse {
    droplet: Droplet,
}

#[derive(Debug, Deserialize)]
struct Droplet {
    id: u64,
    name: String,
    status: String,
    #[serde(default)]
    networks: Networks,
}

#[derive(Debug, Default, Deserialize)]
struct Networks {
    #[serde(default)]
    v4: Vec<NetworkV4>,
}

#[derive(Debug, Deserialize)]
struct NetworkV4 {
    ip_address: String,
    #[serde(rename = "type")]
    kind: String,
}

impl Droplet {
    fn into_server(self) -> Server {
        let ip = self
            .networks
            .v4
            .iter()
            .find(|network| network.kind == "public")
            .and_then(|network| IpAddr::from_str(&network.ip_address).ok());
        Server {
            id: self.id.to_string(),
            name: self.name,
            ip,
            status: self.status,
        }
    }
}

#[derive(Debug, Serialize)]
struct CreateRecord<'a> {
    #[serde(rename = "type")]
    record_type: &'a str,
    name: &'a str,
    data: String,
    ttl: u32,
}

#[derive(Debug, Serialize)]
struct CreateDomain<'a> {
    name: &'a str,
}

/// Provider backed by the DigitalOcean API.
#[derive(Clone)]
pub struct DigitalOceanProvider {
    config: DigitalOceanConfig,
    poll_interval: Duration,
    wait_timeout: Duration,
}

impl std::fmt::Debug for DigitalOceanProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DigitalOceanProvider")
            .field("configured", &!self.needs_config())
            .finish_non_exhaustive()
    }
}

impl DigitalOceanProvider {
    /// Creates an adapter from loaded configuration.
    #[must_use]
    pub const fn new(config: DigitalOceanConfig) -> Self {
        Self {
            config,
            poll_interval: POLL_INTERVAL,
            wait_timeout: WAIT_TIMEOUT,
        }
    }

    fn token(&self) -> Result<&str, ProviderError> {
        self.config
            .token
            .as_deref()
            .filter(|token| !token.trim().is_empty())
            .ok_or_else(|| ProviderError::NotConfigured {
                provider: NAME.to_owned(),
                field: String::from("token"),
            })
    }

    fn api_error(err: impl ToString) -> ProviderError {
        ProviderError::api(NAME, err.to_string())
    }

    async fn call(
        &self,
        request: reqwest::RequestBuilder,
    ) -> Result<RawResponse, ProviderError> {
        let response = send(request.bearer_auth(self.token()?))
            .await
            .map_err(Self::api_error)?;
        if response.status.is_success() {
            Ok(response)
        } else {
            Err(Self::api_error(format!(
                "{}: {}",
                response.status,
                response.text()
            )))
        }
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, path: &str) -> Result<T, ProviderError> {
        let response = self.call(HTTP_CLIENT.get(format!("{API_BASE}{path}"))).await?;
        serde_json::from_slice(&response.body).map_err(Self::api_error)
    }

    async fn create_record(&self, root: &str, name: &str, ip: IpAddr) -> Result<RawResponse, ProviderError> {
        let record = CreateRecord {
            record_type: if ip.is_ipv4() { "A" } else { "AAAA" },
            name,
            data: ip.to_string(),
            ttl: DNS_TTL,
        };
        let url = format!("{API_BASE}/domains/{root}/records");
        send(HTTP_CLIENT.post(url).bearer_auth(self.token()?).json(&record))
            .await
            .map_err(Self::api_error)
    }
}

fn sizes_from(response: SizesResponse) -> Vec<Size> {
    response
        .sizes
        .into_iter()
        .filter(|size| size.available)
        .map(|size| Size {
            id: size.slug,
            vcpus: size.vcpus,
            memory_mb: size.memory,
            disk_gb: size.disk,
            price_monthly: size.price_monthly,
            regions: size.regions,
        })
        .collect()
}

impl Provider for DigitalOceanProvider {
    fn name(&self) -> &str {
        NAME
    }

    fn dns_host(&self) -> DnsHost {
        DnsHost::DigitalOcean
    }

    fn list_regions(&self) -> ProviderFuture<'_, Vec<Region>> {
        Box::pin(async move {
            let response: RegionsResponse = self.get_json("/regions?per_page=200").await?;
            Ok(response
                .regions
                .into_iter()
                .filter(|region| region.available)
                .map(|region| Region {
                    id: region.slug,
                    name: region.name,
                })
                .collect())
        })
    }

    fn list_sizes(&self) -> ProviderFuture<'_, Vec<Size>> {
        Box::pin(async move {
            let response: SizesResponse = self.get_json("/sizes?per_page=200").await?;
            Ok(sizes_from(response))
        })
    }

    fn create_server<'a>(&'a self, config: &'a ServerConfig) -> ProviderFuture<'a, Server> {
        Box::pin(async move {
            let image = config
                .image
                .as_deref()
                .unwrap_or(self.config.default_image.as_str());
            let body = CreateDroplet {
                name: &config.name,
                region: &config.region,
                size: &config.size,
                image,
                user_data: config.user_data.as_deref(),
                tags: &config.tags,
            };
            let response = self
                .call(HTTP_CLIENT.post(format!("{API_BASE}/droplets")).json(&body))
                .await?;
            let created: DropletResponse =
                serde_json::from_slice(&response.body).map_err(Self::api_error)?;
            info!(droplet = created.droplet.id, "created droplet");
            Ok(created.droplet.into_server())
        })
    }

    fn wait_for_server<'a>(&'a self, id: &'a str) -> ProviderFuture<'a, Server> {
        Box::pin(async move {
            let deadline = Instant::now() + self.wait_timeout;
            let mut saw_active = false;
            while Instant::now() <= deadline {
                let response: DropletResponse = self.get_json(&format!("/droplets/{id}")).await?;
                let server = response.droplet.into_server();
                if server.status == "active" {
                    saw_active = true;
                    if server.ip.is_some() {
                        return Ok(server);
                    }
                }
                sleep(self.poll_interval).await;
            }
            if saw_active {
                return Err(ProviderError::MissingPublicIp {
                    server_id: id.to_owned(),
                });
            }
            Err(ProviderError::Timeout {
                action: String::from("wait_for_server"),
                server_id: id.to_owned(),
            })
        })
    }

    fn destroy_server<'a>(&'a self, id: &'a str) -> ProviderFuture<'a, ()> {
        Box::pin(async move {
            self.call(HTTP_CLIENT.delete(format!("{API_BASE}/droplets/{id}")))
                .await
                .map(|_| ())
        })
    }

    fn setup_dns<'a>(&'a self, domain: &'a str, ip: IpAddr) -> ProviderFuture<'a, ()> {
        Box::pin(async move {
            let (root, sub) = split_domain(domain);
            let name = if sub.is_empty() { "@" } else { sub.as_str() };

            let mut response = self.create_record(&root, name, ip).await?;
            if response.status == StatusCode::NOT_FOUND {
                // The zone does not exist yet; create it and retry once.
                self.call(
                    HTTP_CLIENT
                        .post(format!("{API_BASE}/domains"))
                        .json(&CreateDomain { name: &root }),
                )
                .await?;
                response = self.create_record(&root, name, ip).await?;
            }
            if !response.status.is_success() {
                return Err(Self::api_error(response.text()));
            }
            info!(domain, %ip, "created DigitalOcean DNS record");
            Ok(())
        })
    }

    fn configure(&mut self, settings: &BTreeMap<String, String>) -> Result<(), ProviderError> {
        for (key, value) in settings {
            match key.as_str() {
                "token" | "api_token" => self.config.token = Some(value.clone()),
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
        self.token().is_err()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::net::Ipv4Addr;

    use super::*;

    fn provider() -> DigitalOceanProvider {
        DigitalOceanProvider::new(DigitalOceanConfig {
            token: None,
            default_image: String::from("ubuntu-24-04-x64"),
        })
    }

    #[test]
    fn picks_the_public_ipv4_address() {
        let body = r#"{"droplet": {"id": 42, "name": "kuma-1", "status": "active",
            "networks": {"v4": [
                {"ip_address": "10.0.0.2", "type": "private"},
                {"ip_address": "203.0.113.9", "type": "public"}
            ]}}}"#;
        let response: DropletResponse =
            serde_json::from_str(body).unwrap_or_else(|err| panic!("parse droplet: {err}"));

        let server = response.droplet.into_server();

        assert_eq!(server.id, "42");
        assert_eq!(server.ip, Some(IpAddr::V4(Ipv4Addr::new(203, 0, 113, 9))));
    }

    #[test]
    fn new_droplets_have_no_address_yet() {
        let body = r#"{"droplet": {"id": 7, "name": "n", "status": "new"}}"#;
        let response: DropletResponse =
            serde_json::from_str(body).unwrap_or_else(|err| panic!("parse droplet: {err}"));
        assert_eq!(response.droplet.into_server().ip, None);
    }

    #[test]
    fn unavailable_sizes_are_dropped() {
        let body = r#"{"sizes": [
            {"slug": "s-1vcpu-1gb", "memory": 1024, "vcpus": 1, "disk": 25,
             "price_monthly": 6.0, "regions": ["ams3"], "available": true},
            {"slug": "s-retired", "memory": 512, "vcpus": 1, "disk": 20,
             "price_monthly": 4.0, "regions": [], "available": false}
        ]}"#;
        let response: SizesResponse =
            serde_json::from_str(body).unwrap_or_else(|err| panic!("parse sizes: {err}"));

        let sizes = sizes_from(response);

        assert_eq!(sizes.len(), 1);
        assert_eq!(sizes.first().map(|size| size.id.as_str()), Some("s-1vcpu-1gb"));
    }

    #[test]
    fn token_setting_completes_configuration() {
        let mut provider = provider();
        assert!(provider.needs_config());
        provider
            .configure(&BTreeMap::from([(String::from("token"), String::from("t"))]))
            .unwrap_or_else(|err| panic!("configure: {err}"));
        assert!(!provider.needs_config());
    }

    #[tokio::test]
    async fn unconfigured_listing_fails_fast() {
        let err = provider()
            .list_sizes()
            .await
            .expect_err("listing without token should fail");
        assert!(matches!(err, ProviderError::NotConfigured { .. }));
    }
}
