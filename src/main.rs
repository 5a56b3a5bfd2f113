//! Binary entry point for the `selfhosted` CLI.

use std::collections::BTreeMap;
use std::io::{self, Write};
use std::process;
use std::sync::Arc;

use camino::Utf8Path;
use clap::Parser;
use thiserror::Error;
use tracing_subscriber::EnvFilter;

use selfhosted::{
    AppRegistry, DeployConfig, DeployError, DeployOptions, DeployOrchestrator, DigitalOceanConfig,
    DigitalOceanProvider, DnsMode, InstallerError, Provider, ProviderError, ProviderRegistry,
    RegistrarCredentials, ScalewayConfig, ScalewayProvider, SshConfig, SshConnector, StreamWriter,
    recommend_size,
};

mod cli;

use cli::{Cli, DeployCommand, RegionsCommand, SizesCommand};

#[derive(Debug, Error)]
enum CliError {
    #[error("configuration error: {0}")]
    Config(String),
    #[error(transparent)]
    Installer(#[from] InstallerError),
    #[error(transparent)]
    Provider(#[from] ProviderError),
    #[error(transparent)]
    Deploy(#[from] DeployError),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("failed to write output: {0}")]
    Output(#[from] io::Error),
}

#[tokio::main]
async fn main() {
    init_tracing();
    let cli = Cli::parse();
    let exit_code = match dispatch(cli).await {
        Ok(()) => 0,
        Err(err) => {
            report_error(&err);
            1
        }
    };

    process::exit(exit_code);
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();
}

async fn dispatch(cli: Cli) -> Result<(), CliError> {
    match cli {
        Cli::Deploy(command) => deploy(command).await,
        Cli::Apps => list_apps(&mut io::stdout()),
        Cli::Sizes(command) => show_sizes(&command, &mut io::stdout()).await,
        Cli::Regions(command) => list_regions(&command, &mut io::stdout()).await,
    }
}

fn load_deploy_config() -> Result<DeployConfig, CliError> {
    let config =
        DeployConfig::load_without_cli_args().map_err(|err| CliError::Config(err.to_string()))?;
    config
        .validate()
        .map_err(|err| CliError::Config(err.to_string()))?;
    Ok(config)
}

fn load_apps(config: &DeployConfig) -> Result<AppRegistry, CliError> {
    let mut apps = AppRegistry::bundled()?;
    if let Some(dir) = config.apps_dir.as_deref() {
        let loaded = apps.load_dir(Utf8Path::new(dir))?;
        tracing::debug!(dir, loaded, "loaded installer documents");
    }
    Ok(apps)
}

fn load_providers() -> Result<ProviderRegistry, CliError> {
    let scaleway =
        ScalewayConfig::load_without_cli_args().map_err(|err| CliError::Config(err.to_string()))?;
    let digitalocean = DigitalOceanConfig::load_without_cli_args()
        .map_err(|err| CliError::Config(err.to_string()))?;

    let mut providers = ProviderRegistry::new();
    providers.register("scaleway", move || {
        Box::new(ScalewayProvider::new(scaleway.clone())) as Box<dyn Provider>
    });
    providers.register("digitalocean", move || {
        Box::new(DigitalOceanProvider::new(digitalocean.clone())) as Box<dyn Provider>
    });
    Ok(providers)
}

fn configured_provider(
    providers: &ProviderRegistry,
    name: &str,
    settings: &BTreeMap<String, String>,
) -> Result<Box<dyn Provider>, CliError> {
    let mut provider = providers.create(name)?;
    provider.configure(settings)?;
    if provider.needs_config() {
        return Err(CliError::Config(format!(
            "{name} needs credentials; set them in selfhosted.toml or the environment"
        )));
    }
    Ok(provider)
}

async fn deploy(command: DeployCommand) -> Result<(), CliError> {
    let config = load_deploy_config()?;
    let ssh = SshConfig::load_without_cli_args().map_err(|err| CliError::Config(err.to_string()))?;
    ssh.validate()
        .map_err(|err| CliError::Config(err.to_string()))?;
    let options = deploy_options(command, &config)?;

    let orchestrator = DeployOrchestrator::new(
        Arc::new(load_apps(&config)?),
        Arc::new(load_providers()?),
        Arc::new(SshConnector::new(ssh)),
    )
    .with_ssh_wait(config.ssh_wait());

    let stream = Arc::new(StreamWriter::new(io::stdout()));
    let keepalive = stream.spawn_keepalive(config.keepalive());
    let result = orchestrator.run(&options, stream.clone()).await;
    drop(keepalive);
    result?;
    Ok(())
}

fn deploy_options(command: DeployCommand, config: &DeployConfig) -> Result<DeployOptions, CliError> {
    let dns_mode = command
        .dns
        .parse::<DnsMode>()
        .map_err(CliError::InvalidArgument)?;
    let registrar = command
        .cloudflare_token
        .filter(|token| !token.trim().is_empty())
        .map(|token| RegistrarCredentials {
            registrar: String::from("cloudflare"),
            token,
        });
    Ok(DeployOptions {
        app: command.app,
        provider: command.provider,
        region: command.region,
        size: command.size,
        server_name: command.name,
        domain: command.domain,
        ssh_public_key: command
            .ssh_key
            .or_else(|| config.ssh_public_key.clone())
            .unwrap_or_default(),
        email: command.email,
        ssl_certificate: command.ssl_certificate,
        ssl_key: command.ssl_key,
        http_to_https_redirection: command.https_redirect,
        dns_mode,
        registrar,
        provider_settings: parse_pairs(&command.provider_settings)?,
        answers: parse_pairs(&command.answers)?,
    })
}

fn parse_pairs(raw: &[String]) -> Result<BTreeMap<String, String>, CliError> {
    raw.iter()
        .map(|pair| {
            pair.split_once('=')
                .filter(|(key, _)| !key.trim().is_empty())
                .map(|(key, value)| (key.trim().to_owned(), value.to_owned()))
                .ok_or_else(|| CliError::InvalidArgument(format!("expected KEY=VALUE, got '{pair}'")))
        })
        .collect()
}

fn list_apps(out: &mut impl Write) -> Result<(), CliError> {
    let apps = load_apps(&load_deploy_config()?)?;
    for spec in apps.iter() {
        writeln!(
            out,
            "{:<16} {}cpu/{}MB  {}",
            spec.app_name, spec.min_spec.cpu, spec.min_spec.ram_mb, spec.description
        )?;
    }
    Ok(())
}

async fn show_sizes(command: &SizesCommand, out: &mut impl Write) -> Result<(), CliError> {
    let apps = load_apps(&load_deploy_config()?)?;
    let spec = apps.get(&command.app)?;
    let provider = configured_provider(&load_providers()?, &command.provider, &BTreeMap::new())?;

    let recommended = recommend_size(provider.as_ref(), &spec, &command.region).await?;
    let sizes = if command.region.trim().is_empty() {
        provider.list_sizes().await?
    } else {
        provider.list_sizes_for_region(&command.region).await?
    };
    for size in sizes
        .iter()
        .filter(|size| size.vcpus >= spec.min_spec.cpu && size.memory_mb >= spec.min_spec.ram_mb)
    {
        let marker = if size.id == recommended { "*" } else { " " };
        writeln!(
            out,
            "{marker} {:<20} {:>2} vCPU {:>6} MB {:>8.2}/mo",
            size.id, size.vcpus, size.memory_mb, size.price_monthly
        )?;
    }
    Ok(())
}

async fn list_regions(command: &RegionsCommand, out: &mut impl Write) -> Result<(), CliError> {
    let provider = configured_provider(&load_providers()?, &command.provider, &BTreeMap::new())?;
    for region in provider.list_regions().await? {
        writeln!(out, "{:<12} {}", region.id, region.name)?;
    }
    Ok(())
}

fn report_error(err: &CliError) {
    write_error(io::stderr(), err);
}

fn write_error(mut target: impl Write, err: &CliError) {
    writeln!(target, "{err}").ok();
}
