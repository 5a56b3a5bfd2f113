//! End-to-end deployments of the bundled applications against fakes.

use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

use rstest::{fixture, rstest};
use tokio::net::TcpListener;

use selfhosted::deploy::{DnsOutcome, SshWait, SslOutcome};
use selfhosted::dns::{DnsError, Registrar};
use selfhosted::progress::{DONE_MARKER, ERROR_MARKER, PTY_END_MARKER, PTY_SESSION_MARKER};
use selfhosted::test_support::{
    FakeConnector, FakeProvider, FakeTui, RecordingRegistrar, RecordingSink, ScriptedShell,
};
use selfhosted::{
    AppRegistry, DeployOptions, DeployOrchestrator, DnsMode, ProviderRegistry,
    RegistrarCredentials, SessionRegistry,
};

struct World {
    provider: FakeProvider,
    shell: ScriptedShell,
    sessions: Arc<SessionRegistry>,
    registrar: Arc<RecordingRegistrar>,
    sink: Arc<RecordingSink>,
    orchestrator: DeployOrchestrator,
    _ssh: TcpListener,
}

#[fixture]
async fn world() -> World {
    let ssh = TcpListener::bind((Ipv4Addr::LOCALHOST, 0))
        .await
        .unwrap_or_else(|err| panic!("bind: {err}"));
    let port = ssh
        .local_addr()
        .unwrap_or_else(|err| panic!("local addr: {err}"))
        .port();

    let provider = FakeProvider::new();
    let shell = ScriptedShell::new();
    let sessions = Arc::new(SessionRegistry::new());
    let registrar = Arc::new(RecordingRegistrar::new());

    let apps = AppRegistry::bundled().unwrap_or_else(|err| panic!("bundled apps: {err}"));
    let mut providers = ProviderRegistry::new();
    let registered = provider.clone();
    providers.register(FakeProvider::NAME, move || Box::new(registered.clone()));
    let factory_registrar = Arc::clone(&registrar);

    let orchestrator = DeployOrchestrator::new(
        Arc::new(apps),
        Arc::new(providers),
        Arc::new(FakeConnector::new(shell.clone(), port)),
    )
    .with_sessions(Arc::clone(&sessions))
    .with_registrars(Arc::new(
        move |_credentials: &RegistrarCredentials| -> Result<Box<dyn Registrar>, DnsError> {
            Ok(Box::new(Arc::clone(&factory_registrar)))
        },
    ))
    .with_ssh_wait(SshWait {
        timeout: Duration::from_secs(5),
        retry_interval: Duration::from_millis(20),
        settle: Duration::ZERO,
    });

    World {
        provider,
        shell,
        sessions,
        registrar,
        sink: Arc::new(RecordingSink::new()),
        orchestrator,
        _ssh: ssh,
    }
}

fn options(app: &str) -> DeployOptions {
    DeployOptions {
        app: app.to_owned(),
        provider: String::from(FakeProvider::NAME),
        ..DeployOptions::default()
    }
}

fn outcome_lines(sink: &RecordingSink) -> Vec<String> {
    sink.lines()
        .into_iter()
        .filter(|line| line == DONE_MARKER || line.starts_with(ERROR_MARKER))
        .collect()
}

#[rstest]
#[tokio::test]
async fn uptime_kuma_installs_on_the_bare_ip(#[future] world: World) {
    let world = world.await;

    let summary = world
        .orchestrator
        .run(&options("uptime-kuma"), world.sink.clone())
        .await
        .unwrap_or_else(|err| panic!("deploy: {err}"));

    assert_eq!(summary.size, "fake-small");
    assert_eq!(summary.url, "http://127.0.0.1");
    assert_eq!(summary.ssl, SslOutcome::NotRequested);
    let commands = world.shell.commands();
    assert_eq!(commands.len(), 3, "{commands:?}");
    assert!(
        commands
            .iter()
            .any(|command| command.contains("server_name 127.0.0.1;")),
        "{commands:?}"
    );
    assert!(world.sink.lines().contains(&String::from("==> Install Docker")));
    assert_eq!(outcome_lines(&world.sink), [DONE_MARKER]);
}

#[rstest]
#[tokio::test]
async fn gitea_records_are_created_through_the_registrar(#[future] world: World) {
    let world = world.await;
    let mut request = options("gitea");
    request.domain = String::from("git.example.com");
    request.registrar = Some(RegistrarCredentials {
        registrar: String::from("cloudflare"),
        token: String::from("cf-token"),
    });
    request
        .answers
        .insert(String::from("admin_user"), String::from("octo"));

    let summary = world
        .orchestrator
        .run(&request, world.sink.clone())
        .await
        .unwrap_or_else(|err| panic!("deploy: {err}"));

    assert_eq!(
        summary.dns,
        DnsOutcome::Configured {
            via: String::from("cloudflare")
        }
    );
    let names: Vec<String> = world
        .registrar
        .records()
        .into_iter()
        .map(|(_, record)| record.name)
        .collect();
    assert_eq!(names, ["git.example.com", "www.git.example.com"]);
    assert!(
        world
            .shell
            .commands()
            .iter()
            .any(|command| command.contains("octo")),
        "wizard answers reach the steps"
    );
    assert_eq!(summary.size, "fake-medium");
    assert!(world.provider.calls().iter().all(|call| !call.starts_with("setup_dns")));
}

#[rstest]
#[tokio::test]
async fn openlitespeed_installer_is_driven_through_its_prompts(#[future] world: World) {
    let world = world.await;
    world.shell.push_tui(
        FakeTui::exiting(0)
            .print("\x1b[1mDo you still want to continue? [y/N]\x1b[0m ")
            .read_line()
            .print("Please input the email address: ")
            .read_line()
            .print("\r\nInstallation finished\r\n"),
    );
    world.shell.push_tui(
        FakeTui::exiting(0)
            .print("You must AGREE to the terms (y/n) ")
            .read_line(),
    );
    let mut request = options("openlitespeed");
    request.domain = String::from("blog.example.com");
    request.dns_mode = DnsMode::Skip;
    request.email = String::from("ops@example.com");

    let summary = world
        .orchestrator
        .run(&request, world.sink.clone())
        .await
        .unwrap_or_else(|err| panic!("deploy: {err}"));

    assert_eq!(world.shell.typed(), ["y", "ops@example.com", "y"]);
    assert_eq!(summary.ssl, SslOutcome::Configured);
    assert_eq!(summary.url, "https://blog.example.com");
    assert_eq!(world.sink.lines_starting_with(PTY_SESSION_MARKER).len(), 2);
    assert_eq!(world.sink.lines_starting_with(PTY_END_MARKER).len(), 2);
    assert!(world.sessions.is_empty());
    assert_eq!(outcome_lines(&world.sink), [DONE_MARKER]);
}

#[rstest]
#[tokio::test]
async fn failed_installs_end_the_stream_with_one_error(#[future] world: World) {
    let world = world.await;
    world
        .shell
        .push_output(Some(100), "", "E: Unable to locate package docker.io\n");

    let err = world
        .orchestrator
        .run(&options("uptime-kuma"), world.sink.clone())
        .await
        .expect_err("install should fail");

    assert!(err.to_string().contains("Install Docker"), "{err}");
    assert_eq!(world.shell.commands().len(), 1);
    let outcome = outcome_lines(&world.sink);
    assert_eq!(outcome.len(), 1);
    assert!(
        outcome
            .first()
            .is_some_and(|line| line.contains("Unable to locate package")),
        "{outcome:?}"
    );
}
