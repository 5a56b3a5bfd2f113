//! DNS host detection, record resolution, and registrar clients.
//!
//! Detection is a heuristic: the first authoritative nameserver of a domain
//! is matched against known host signatures. It decides whether the
//! orchestrator may safely manage a zone, never whether a zone exists.

use std::fmt;
use std::future::Future;
use std::net::IpAddr;
use std::pin::Pin;

use serde::Deserialize;
use thiserror::Error;
use tracing::debug;

use crate::http::{HTTP_CLIENT, send};
use crate::installer::DnsRecordTemplate;
use crate::template::TemplateContext;

pub mod cloudflare;

pub use cloudflare::{
    CloudflareClient, Registrar, RegistrarCredentials, Zone, registrar_for, zone_candidates,
};

/// Future returned by DNS operations.
pub type DnsFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, DnsError>> + Send + 'a>>;

const DOH_ENDPOINT: &str = "https://cloudflare-dns.com/dns-query";
const NS_RECORD_TYPE: u16 = 2;

/// Errors raised by detection and registrar calls. Callers treat all of them
/// as warnings.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum DnsError {
    /// Neither the domain nor its root has NS records.
    #[error("no nameservers found for {0}")]
    NoNameservers(String),
    /// The resolver could not be queried.
    #[error("nameserver lookup for {domain} failed: {message}")]
    Lookup {
        /// Queried name.
        domain: String,
        /// Transport or decoding failure.
        message: String,
    },
    /// The registrar has no zone covering the domain.
    #[error("no {registrar} zone covers {domain}")]
    ZoneNotFound {
        /// Registrar name.
        registrar: String,
        /// Domain being configured.
        domain: String,
    },
    /// The registrar API rejected a request.
    #[error("{registrar} API error: {message}")]
    Api {
        /// Registrar name.
        registrar: String,
        /// Message from the API or transport.
        message: String,
    },
    /// Credentials name a registrar without a client.
    #[error("unsupported DNS registrar '{0}'")]
    UnsupportedRegistrar(String),
}

/// Known DNS hosts, identified by nameserver hostname signatures.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum DnsHost {
    /// Cloudflare.
    Cloudflare,
    /// DigitalOcean.
    DigitalOcean,
    /// Scaleway Domains.
    Scaleway,
    /// Amazon Route 53.
    Route53,
    /// Google Cloud DNS.
    GoogleCloud,
    /// Azure DNS.
    Azure,
    /// Hetzner DNS.
    Hetzner,
    /// Linode / Akamai.
    Linode,
    /// Vultr.
    Vultr,
    /// OVHcloud.
    Ovh,
    /// Gandi.
    Gandi,
    /// Namecheap.
    Namecheap,
    /// GoDaddy.
    GoDaddy,
    /// Anything else; holds the raw nameserver host.
    Unknown(String),
}

const SIGNATURES: &[(&str, DnsHost)] = &[
    ("cloudflare.com", DnsHost::Cloudflare),
    ("digitalocean.com", DnsHost::DigitalOcean),
    ("scw.cloud", DnsHost::Scaleway),
    ("awsdns", DnsHost::Route53),
    ("googledomains.com", DnsHost::GoogleCloud),
    ("azure-dns", DnsHost::Azure),
    ("hetzner", DnsHost::Hetzner),
    ("linode.com", DnsHost::Linode),
    ("vultr.com", DnsHost::Vultr),
    ("ovh.net", DnsHost::Ovh),
    ("gandi.net", DnsHost::Gandi),
    ("registrar-servers.com", DnsHost::Namecheap),
    ("domaincontrol.com", DnsHost::GoDaddy),
];

impl DnsHost {
    /// Classifies a nameserver hostname by substring signature.
    #[must_use]
    pub fn classify(nameserver: &str) -> Self {
        let host = nameserver.trim().trim_end_matches('.').to_ascii_lowercase();
        SIGNATURES
            .iter()
            .find(|(signature, _)| host.contains(signature))
            .map_or_else(|| Self::Unknown(host.clone()), |(_, dns_host)| dns_host.clone())
    }
}

impl fmt::Display for DnsHost {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Cloudflare => "Cloudflare",
            Self::DigitalOcean => "DigitalOcean",
            Self::Scaleway => "Scaleway",
            Self::Route53 => "Route 53",
            Self::GoogleCloud => "Google Cloud DNS",
            Self::Azure => "Azure DNS",
            Self::Hetzner => "Hetzner",
            Self::Linode => "Linode",
            Self::Vultr => "Vultr",
            Self::Ovh => "OVH",
            Self::Gandi => "Gandi",
            Self::Namecheap => "Namecheap",
            Self::GoDaddy => "GoDaddy",
            Self::Unknown(host) => return write!(f, "unknown ({host})"),
        };
        f.write_str(name)
    }
}

/// Splits a domain into `(zone, subdomain)`.
///
/// `"app.example.com"` becomes `("example.com", "app")`; a domain with two or
/// fewer labels is its own zone with an empty subdomain.
#[must_use]
pub fn split_domain(fqdn: &str) -> (String, String) {
    let fqdn = fqdn.trim().trim_end_matches('.');
    let parts: Vec<&str> = fqdn.split('.').collect();
    if parts.len() <= 2 {
        return (fqdn.to_owned(), String::new());
    }
    let (sub, zone) = parts.split_at(parts.len() - 2);
    (zone.join("."), sub.join("."))
}

/// Source of NS records.
pub trait NameserverLookup: Send + Sync {
    /// Returns the NS hostnames of `domain`, possibly empty.
    fn lookup_ns<'a>(&'a self, domain: &'a str) -> DnsFuture<'a, Vec<String>>;
}

/// NS lookup over DNS-over-HTTPS using the JSON API.
#[derive(Clone, Debug)]
pub struct DohResolver {
    endpoint: String,
}

impl Default for DohResolver {
    fn default() -> Self {
        Self {
            endpoint: DOH_ENDPOINT.to_owned(),
        }
    }
}

impl DohResolver {
    /// Creates a resolver against a custom DoH JSON endpoint.
    #[must_use]
    pub fn with_endpoint(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct DohResponse {
    #[serde(rename = "Answer", default)]
    answer: Vec<DohAnswer>,
}

#[derive(Debug, Deserialize)]
struct DohAnswer {
    #[serde(rename = "type")]
    record_type: u16,
    data: String,
}

fn nameservers_from(body: &[u8]) -> Result<Vec<String>, serde_json::Error> {
    let response: DohResponse = serde_json::from_slice(body)?;
    Ok(response
        .answer
        .into_iter()
        .filter(|answer| answer.record_type == NS_RECORD_TYPE)
        .map(|answer| answer.data.trim_end_matches('.').to_ascii_lowercase())
        .collect())
}

impl NameserverLookup for DohResolver {
    fn lookup_ns<'a>(&'a self, domain: &'a str) -> DnsFuture<'a, Vec<String>> {
        Box::pin(async move {
            let lookup_error = |message: String| DnsError::Lookup {
                domain: domain.to_owned(),
                message,
            };
            let response = send(
                HTTP_CLIENT
                    .get(&self.endpoint)
                    .query(&[("name", domain), ("type", "NS")])
                    .header("accept", "application/dns-json"),
            )
            .await
            .map_err(lookup_error)?;
            if !response.status.is_success() {
                return Err(lookup_error(response.text()));
            }
            nameservers_from(&response.body).map_err(|err| lookup_error(err.to_string()))
        })
    }
}

/// Detects who hosts DNS for `domain`, retrying against the root domain when
/// the name itself has no NS records.
///
/// # Errors
///
/// Returns [`DnsError::NoNameservers`] when neither name has NS records, or
/// the lookup failure.
pub async fn detect_dns_provider(
    lookup: &dyn NameserverLookup,
    domain: &str,
) -> Result<DnsHost, DnsError> {
    let mut nameservers = lookup.lookup_ns(domain).await?;
    if nameservers.is_empty() {
        let (root, _) = split_domain(domain);
        if root != domain {
            nameservers = lookup.lookup_ns(&root).await?;
        }
    }
    let first = nameservers
        .first()
        .ok_or_else(|| DnsError::NoNameservers(domain.to_owned()))?;
    let host = DnsHost::classify(first);
    debug!(domain, nameserver = %first, %host, "detected DNS host");
    Ok(host)
}

/// A concrete DNS record ready for a registrar.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct DnsRecord {
    /// Record type.
    pub record_type: String,
    /// Fully qualified record name.
    pub name: String,
    /// Record content.
    pub content: String,
    /// Time to live in seconds; zero means the registrar default.
    pub ttl: u32,
    /// Proxy flag, when the registrar supports one.
    pub proxied: Option<bool>,
}

/// Resolves record templates for `domain` and `ip`.
///
/// Names and contents are rendered against `vars` first. An empty or `@`
/// name targets `domain`; other relative names are qualified with it. Address
/// records without content point at `ip`. With no templates, a single address
/// record for `domain` is produced.
#[must_use]
pub fn resolve_records(
    templates: &[DnsRecordTemplate],
    domain: &str,
    ip: IpAddr,
    vars: &TemplateContext,
) -> Vec<DnsRecord> {
    let address_type = if ip.is_ipv4() { "A" } else { "AAAA" };
    if templates.is_empty() {
        return vec![DnsRecord {
            record_type: address_type.to_owned(),
            name: domain.to_owned(),
            content: ip.to_string(),
            ttl: 0,
            proxied: None,
        }];
    }

    templates
        .iter()
        .map(|template| {
            let rendered = vars.render(template.name.trim());
            let name = match rendered.as_str() {
                "" | "@" => domain.to_owned(),
                qualified if qualified == domain || qualified.ends_with(&format!(".{domain}")) => {
                    qualified.to_owned()
                }
                relative => format!("{relative}.{domain}"),
            };
            let mut content = vars.render(&template.content);
            if content.is_empty() && matches!(template.record_type.as_str(), "A" | "AAAA") {
                content = ip.to_string();
            }
            DnsRecord {
                record_type: template.record_type.clone(),
                name,
                content,
                ttl: template.ttl,
                proxied: template.proxied,
            }
        })
        .collect()
}

#[cfg(test)]
mod tests;
