//! Command-line interface definitions for the `selfhosted` binary.
//!
//! The clap structures live here on their own so the build script can reuse
//! them when generating the manual page.

use clap::{Args, Parser};

const LONG_ABOUT: &str = "\
Provision a cloud server and install a self-hosted application on it.

A deployment creates a server at the chosen provider, optionally points a \
domain at it, waits for SSH, then runs the application's installer steps. \
Interactive installers are answered automatically. Progress is written to \
standard output and always ends with a [SELFHOSTED::DONE] or \
[SELFHOSTED::ERROR] line.";

const AFTER_LONG_HELP: &str = "\
DNS modes:
  auto        Use the registrar when a token is given, otherwise the app's policy
  force       Always create records with the provider
  skip        Never touch DNS
  cloudflare  Always use the Cloudflare API; requires a token

Environment:
  SELFHOSTED_CONFIG_PATH  Configuration file (default: selfhosted.toml)
  SELFHOSTED_*            Orchestrator settings, for example SELFHOSTED_APPS_DIR
  SELFHOSTED_SSH_*        SSH client settings
  SCW_*, DIGITALOCEAN_*   Provider credentials
  CLOUDFLARE_API_TOKEN    Cloudflare token for registrar DNS
  RUST_LOG                Log filter for diagnostics on standard error";

/// Top-level CLI for the `selfhosted` binary.
#[derive(Debug, Parser)]
#[command(
    name = "selfhosted",
    version,
    about = "Provision a cloud server and install a self-hosted application on it",
    long_about = LONG_ABOUT,
    after_long_help = AFTER_LONG_HELP,
    arg_required_else_help = true
)]
pub(crate) enum Cli {
    /// Provision a server and install an application.
    #[command(name = "deploy", about = "Provision a server and install an application")]
    Deploy(DeployCommand),
    /// List the installable applications.
    #[command(name = "apps", about = "List the installable applications")]
    Apps,
    /// Show the recommended size for an application.
    #[command(name = "sizes", about = "Show the recommended size for an application")]
    Sizes(SizesCommand),
    /// List a provider's regions.
    #[command(name = "regions", about = "List a provider's regions")]
    Regions(RegionsCommand),
}

/// Arguments for `selfhosted deploy`.
#[derive(Debug, Args)]
pub(crate) struct DeployCommand {
    /// Application to install, as listed by `selfhosted apps`.
    pub(crate) app: String,
    /// Cloud provider to create the server with.
    #[arg(long, default_value = "scaleway")]
    pub(crate) provider: String,
    /// Region or zone; the provider default when omitted.
    #[arg(long, default_value = "")]
    pub(crate) region: String,
    /// Server size, or `auto` for the cheapest size meeting the app's needs.
    #[arg(long, default_value = "auto")]
    pub(crate) size: String,
    /// Server name; derived from the app name when omitted.
    #[arg(long, default_value = "")]
    pub(crate) name: String,
    /// Domain to serve the application on.
    #[arg(long, default_value = "")]
    pub(crate) domain: String,
    /// SSH public key to install, inline or as a path to a `.pub` file.
    #[arg(long, value_name = "KEY")]
    pub(crate) ssh_key: Option<String>,
    /// Contact address for certificate issuance; enables SSL.
    #[arg(long, default_value = "")]
    pub(crate) email: String,
    /// Existing certificate path on the server.
    #[arg(long, default_value = "")]
    pub(crate) ssl_certificate: String,
    /// Existing private key path on the server.
    #[arg(long, default_value = "")]
    pub(crate) ssl_key: String,
    /// Redirect plain HTTP to HTTPS.
    #[arg(long)]
    pub(crate) https_redirect: bool,
    /// DNS mode: auto, force, skip, or cloudflare.
    #[arg(long, default_value = "auto")]
    pub(crate) dns: String,
    /// Cloudflare API token with DNS edit permission on the zone.
    #[arg(long, env = "CLOUDFLARE_API_TOKEN", hide_env_values = true)]
    pub(crate) cloudflare_token: Option<String>,
    /// Answer to a wizard question, as `ID=VALUE`. Repeatable.
    #[arg(long = "set", value_name = "ID=VALUE")]
    pub(crate) answers: Vec<String>,
    /// Provider setting such as an API token, as `KEY=VALUE`. Repeatable.
    #[arg(long = "provider-setting", value_name = "KEY=VALUE")]
    pub(crate) provider_settings: Vec<String>,
}

/// Arguments for `selfhosted sizes`.
#[derive(Debug, Args)]
pub(crate) struct SizesCommand {
    /// Application whose minimum hardware is used.
    pub(crate) app: String,
    /// Provider whose catalogue is searched.
    #[arg(long, default_value = "scaleway")]
    pub(crate) provider: String,
    /// Restrict the search to sizes offered in this region.
    #[arg(long, default_value = "")]
    pub(crate) region: String,
}

/// Arguments for `selfhosted regions`.
#[derive(Debug, Args)]
pub(crate) struct RegionsCommand {
    /// Provider to query.
    #[arg(long, default_value = "scaleway")]
    pub(crate) provider: String,
}
