//! Registrar clients, currently Cloudflare.
//!
//! Requires an API token with `Zone > DNS > Edit` permission on the zone
//! covering the deployment domain.

use serde::{Deserialize, Serialize};
use tracing::info;

use super::{DnsError, DnsFuture, DnsRecord, split_domain};
use crate::http::{HTTP_CLIENT, send};

const CF_API: &str = "https://api.cloudflare.com/client/v4";
const REGISTRAR: &str = "cloudflare";
/// Cloudflare's "automatic" TTL.
const AUTO_TTL: u32 = 1;

/// Credentials for a registrar API supplied with a deployment.
#[derive(Clone, Eq, PartialEq)]
pub struct RegistrarCredentials {
    /// Registrar name, for example `cloudflare`.
    pub registrar: String,
    /// API token.
    pub token: String,
}

impl std::fmt::Debug for RegistrarCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegistrarCredentials")
            .field("registrar", &self.registrar)
            .field("token", &"<redacted>")
            .finish()
    }
}

/// A registrar that can create DNS records.
pub trait Registrar: Send + Sync {
    /// Registrar name.
    fn name(&self) -> &str;

    /// Sets `record` in the zone covering `domain`, replacing any record with
    /// the same type and name.
    fn create_record<'a>(&'a self, domain: &'a str, record: &'a DnsRecord) -> DnsFuture<'a, ()>;
}

/// Builds the registrar client named by `credentials`.
///
/// # Errors
///
/// Returns [`DnsError::UnsupportedRegistrar`] for registrars without a client.
pub fn registrar_for(credentials: &RegistrarCredentials) -> Result<Box<dyn Registrar>, DnsError> {
    match credentials.registrar.to_ascii_lowercase().as_str() {
        REGISTRAR => Ok(Box::new(CloudflareClient::new(credentials.token.clone()))),
        other => Err(DnsError::UnsupportedRegistrar(other.to_owned())),
    }
}

/// A zone as listed by the registrar.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
pub struct Zone {
    /// Zone identifier.
    pub id: String,
    /// Zone apex, for example `example.com`.
    pub name: String,
}

/// Zone names that could cover `domain`, in lookup order: the domain's root
/// first, then every longer suffix from the most specific down.
#[must_use]
pub fn zone_candidates(domain: &str) -> Vec<String> {
    let normalized = domain.trim().trim_end_matches('.').to_ascii_lowercase();
    let (root, _) = split_domain(&normalized);
    let labels: Vec<&str> = normalized.split('.').collect();
    let mut candidates = vec![root];
    for start in 0..labels.len() {
        let suffix = labels.iter().skip(start).copied().collect::<Vec<_>>().join(".");
        if suffix.contains('.') && !candidates.contains(&suffix) {
            candidates.push(suffix);
        }
    }
    candidates
}

#[derive(Debug, Deserialize)]
struct Envelope<T> {
    success: bool,
    #[serde(default)]
    errors: Vec<ApiMessage>,
    result: Option<T>,
}

#[derive(Debug, Deserialize)]
struct ApiMessage {
    message: String,
}

#[derive(Debug, Deserialize)]
struct ExistingRecord {
    id: String,
}

#[derive(Debug, Serialize)]
struct RecordBody<'a> {
    #[serde(rename = "type")]
    record_type: &'a str,
    name: &'a str,
    content: &'a str,
    ttl: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    proxied: Option<bool>,
}

impl<'a> From<&'a DnsRecord> for RecordBody<'a> {
    fn from(record: &'a DnsRecord) -> Self {
        Self {
            record_type: &record.record_type,
            name: &record.name,
            content: &record.content,
            ttl: if record.ttl == 0 { AUTO_TTL } else { record.ttl },
            proxied: record.proxied,
        }
    }
}

/// Cloudflare API client.
#[derive(Clone)]
pub struct CloudflareClient {
    token: String,
    api_base: String,
}

impl std::fmt::Debug for CloudflareClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CloudflareClient")
            .field("api_base", &self.api_base)
            .finish_non_exhaustive()
    }
}

impl CloudflareClient {
    /// Creates a client authenticating with `token`.
    #[must_use]
    pub fn new(token: String) -> Self {
        Self {
            token,
            api_base: CF_API.to_owned(),
        }
    }

    fn api_error(message: impl Into<String>) -> DnsError {
        DnsError::Api {
            registrar: REGISTRAR.to_owned(),
            message: message.into(),
        }
    }

    async fn request<T: serde::de::DeserializeOwned>(
        &self,
        request: reqwest::RequestBuilder,
    ) -> Result<T, DnsError> {
        let response = send(request.bearer_auth(&self.token))
            .await
            .map_err(Self::api_error)?;
        unwrap_envelope(&response.body).map_err(Self::api_error)
    }

    /// Creates a client against another API base, such as a local fake.
    #[must_use]
    pub fn with_api_base(token: String, api_base: impl Into<String>) -> Self {
        Self {
            token,
            api_base: api_base.into(),
        }
    }

    /// Finds the zone covering `domain`, querying each name from
    /// [`zone_candidates`] until the account has a zone by that name.
    ///
    /// # Errors
    ///
    /// Returns [`DnsError::ZoneNotFound`] when no candidate is a zone, or
    /// [`DnsError::Api`] on transport or API failures.
    pub async fn find_zone(&self, domain: &str) -> Result<Zone, DnsError> {
        for candidate in zone_candidates(domain) {
            let zones: Vec<Zone> = self
                .request(
                    HTTP_CLIENT
                        .get(format!("{}/zones", self.api_base))
                        .query(&[("name", candidate.as_str())]),
                )
                .await?;
            if let Some(zone) = zones
                .into_iter()
                .find(|zone| zone.name.eq_ignore_ascii_case(&candidate))
            {
                return Ok(zone);
            }
        }
        Err(DnsError::ZoneNotFound {
            registrar: REGISTRAR.to_owned(),
            domain: domain.to_owned(),
        })
    }

    /// Returns the id of the record in `zone` with the same type and name.
    ///
    /// # Errors
    ///
    /// Returns [`DnsError::Api`] on transport or API failures.
    pub async fn find_record(
        &self,
        zone: &Zone,
        record: &DnsRecord,
    ) -> Result<Option<String>, DnsError> {
        let existing: Vec<ExistingRecord> = self
            .request(
                HTTP_CLIENT
                    .get(format!("{}/zones/{}/dns_records", self.api_base, zone.id))
                    .query(&[
                        ("type", record.record_type.as_str()),
                        ("name", record.name.as_str()),
                    ]),
            )
            .await?;
        Ok(existing.into_iter().next().map(|found| found.id))
    }

    /// Points `record` at its content, updating the existing record of the
    /// same type and name or creating one.
    ///
    /// # Errors
    ///
    /// Returns [`DnsError`] when the zone is missing or a request fails.
    pub async fn upsert_record(&self, domain: &str, record: &DnsRecord) -> Result<(), DnsError> {
        let zone = self.find_zone(domain).await?;
        let records = format!("{}/zones/{}/dns_records", self.api_base, zone.id);
        let body = RecordBody::from(record);
        let action = match self.find_record(&zone, record).await? {
            Some(id) => {
                let _updated: serde_json::Value = self
                    .request(HTTP_CLIENT.put(format!("{records}/{id}")).json(&body))
                    .await?;
                "updated"
            }
            None => {
                let _created: serde_json::Value =
                    self.request(HTTP_CLIENT.post(records).json(&body)).await?;
                "created"
            }
        };
        info!(zone = %zone.name, name = %record.name, kind = %record.record_type, action, "Cloudflare record set");
        Ok(())
    }
}

fn unwrap_envelope<T: serde::de::DeserializeOwned>(body: &[u8]) -> Result<T, String> {
    let envelope: Envelope<T> = serde_json::from_slice(body).map_err(|err| err.to_string())?;
    if !envelope.success {
        let messages: Vec<_> = envelope.errors.into_iter().map(|e| e.message).collect();
        return Err(messages.join("; "));
    }
    envelope
        .result
        .ok_or_else(|| String::from("response carried no result"))
}

impl Registrar for CloudflareClient {
    fn name(&self) -> &str {
        REGISTRAR
    }

    fn create_record<'a>(&'a self, domain: &'a str, record: &'a DnsRecord) -> DnsFuture<'a, ()> {
        Box::pin(self.upsert_record(domain, record))
    }
}

#[cfg(test)]
mod tests;
