//! Input record for one deployment and its template variables.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crate::dns::RegistrarCredentials;
use crate::template::{TemplateContext, TemplateVars};

/// How the DNS phase decides whether to create records.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum DnsMode {
    /// Follow the app's policy, or the registrar when credentials are given.
    #[default]
    Auto,
    /// Always configure DNS.
    Force,
    /// Never configure DNS.
    Skip,
    /// Always use the Cloudflare API; credentials are mandatory.
    Cloudflare,
}

impl DnsMode {
    /// Lower-case name as accepted by [`DnsMode::from_str`].
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Auto => "auto",
            Self::Force => "force",
            Self::Skip => "skip",
            Self::Cloudflare => "cloudflare",
        }
    }
}

impl fmt::Display for DnsMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DnsMode {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "" | "auto" => Ok(Self::Auto),
            "force" => Ok(Self::Force),
            "skip" => Ok(Self::Skip),
            "cloudflare" => Ok(Self::Cloudflare),
            other => Err(format!(
                "unknown DNS mode '{other}': expected auto, force, skip, or cloudflare"
            )),
        }
    }
}

/// Everything needed for one deployment attempt.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DeployOptions {
    /// Installer registry name.
    pub app: String,
    /// Provider registry name.
    pub provider: String,
    /// Region or zone; empty uses the provider default.
    pub region: String,
    /// Size identifier; empty or `auto` picks the cheapest fitting size.
    pub size: String,
    /// Server name; empty derives one from the app name.
    pub server_name: String,
    /// Domain the app is served on; empty serves on the bare IP.
    pub domain: String,
    /// Public key installed for root, inline or as a `.pub` path.
    pub ssh_public_key: String,
    /// Contact address for certificate issuance.
    pub email: String,
    /// Existing certificate path on the server.
    pub ssl_certificate: String,
    /// Existing private key path on the server.
    pub ssl_key: String,
    /// Redirect plain HTTP to HTTPS.
    pub http_to_https_redirection: bool,
    /// DNS behaviour.
    pub dns_mode: DnsMode,
    /// Registrar API credentials.
    pub registrar: Option<RegistrarCredentials>,
    /// Settings passed to the provider's `configure`.
    pub provider_settings: BTreeMap<String, String>,
    /// Wizard answers; they take precedence over option fields.
    pub answers: BTreeMap<String, String>,
}

impl DeployOptions {
    /// Whether the SSL phase should run.
    #[must_use]
    pub fn ssl_requested(&self) -> bool {
        !self.email.trim().is_empty()
            || !self.ssl_certificate.trim().is_empty()
            || self.http_to_https_redirection
    }
}

impl TemplateVars for DeployOptions {
    fn template_vars(&self) -> TemplateContext {
        // Exhaustive so a new field cannot be left out of the mapping.
        // Credentials and provider settings never reach scripts; answers
        // are merged by the orchestrator.
        let Self {
            app,
            provider,
            region,
            size,
            server_name,
            domain,
            ssh_public_key,
            email,
            ssl_certificate,
            ssl_key,
            http_to_https_redirection,
            dns_mode,
            registrar: _,
            provider_settings: _,
            answers: _,
        } = self;

        let mut vars = TemplateContext::new();
        for (field, value) in [
            ("AppName", app.as_str()),
            ("Provider", provider.as_str()),
            ("Region", region.as_str()),
            ("Size", size.as_str()),
            ("ServerName", server_name.as_str()),
            ("Domain", domain.as_str()),
            ("SSHPublicKey", ssh_public_key.as_str()),
            ("Email", email.as_str()),
            ("SSLCertificate", ssl_certificate.as_str()),
            ("SSLKey", ssl_key.as_str()),
            ("DNSMode", dns_mode.as_str()),
        ] {
            vars.insert_string(field, value);
        }
        vars.insert_bool("EnableSSL", self.ssl_requested());
        vars.insert_bool("HttpToHttpsRedirection", *http_to_https_redirection);
        vars
    }
}
