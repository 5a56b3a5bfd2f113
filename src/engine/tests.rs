//! Tests for phase partitioning, command failures, and interactive steps.

use std::sync::Arc;

use rstest::{fixture, rstest};

use super::*;
use crate::progress::{PTY_END_MARKER, PTY_OUTPUT_MARKER, PTY_SESSION_MARKER};
use crate::pty::SessionRegistry;
use crate::test_support::{FakeTui, RecordingSink, ScriptedShell};

struct Harness {
    shell: ScriptedShell,
    registry: Arc<SessionRegistry>,
    sink: Arc<RecordingSink>,
    pty: PtyAutomation,
}

impl Harness {
    async fn run(&self, document: &str, phase: Phase, vars: &TemplateContext) -> Result<usize, StepError> {
        let spec = InstallerSpec::from_yaml(document)
            .unwrap_or_else(|err| panic!("parse document: {err}"));
        StepExecutor::new(&self.shell, &self.pty, self.sink.as_ref())
            .run_phase(&spec, phase, vars)
            .await
    }
}

#[fixture]
fn harness() -> Harness {
    let registry = Arc::new(SessionRegistry::new());
    let sink = Arc::new(RecordingSink::new());
    let pty = PtyAutomation::new(Arc::clone(&registry), sink.clone());
    Harness {
        shell: ScriptedShell::new(),
        registry,
        sink,
        pty,
    }
}

const MIXED: &str = r#"
app: mixed
steps:
  - run: A
  - if: x
    run: B
  - run: C
  - name: Redirect
    if: "opts.EnableSSL && !opts.HttpToHttpsRedirection"
    run: D
"#;

#[rstest]
#[tokio::test]
async fn install_phase_skips_guarded_steps(harness: Harness) {
    let executed = harness
        .run(MIXED, Phase::Install, &TemplateContext::new())
        .await
        .unwrap_or_else(|err| panic!("install phase: {err}"));

    assert_eq!(executed, 2);
    assert_eq!(
        harness.shell.commands(),
        [build_step_command("A"), build_step_command("C")]
    );
}

#[rstest]
#[case(true, false, vec!["D"])]
#[case(true, true, vec![])]
#[case(false, false, vec![])]
#[tokio::test]
async fn ssl_phase_runs_passing_guards(
    harness: Harness,
    #[case] ssl: bool,
    #[case] redirect: bool,
    #[case] expected: Vec<&str>,
) {
    let mut vars = TemplateContext::new();
    vars.insert_bool("EnableSSL", ssl);
    vars.insert_bool("HttpToHttpsRedirection", redirect);

    harness
        .run(MIXED, Phase::Ssl, &vars)
        .await
        .unwrap_or_else(|err| panic!("ssl phase: {err}"));

    let expected: Vec<String> = expected.into_iter().map(build_step_command).collect();
    assert_eq!(harness.shell.commands(), expected);
}

#[rstest]
#[tokio::test]
async fn steps_render_logs_and_relay_output(harness: Harness) {
    let document = r#"
app: demo
steps:
  - name: Greet
    log: "Deploying to {opts.Domain}"
    run: echo {opts.Domain}
"#;
    let mut vars = TemplateContext::new();
    vars.insert_string("Domain", "demo.example.com");
    harness.shell.push_output(Some(0), "demo.example.com\n", "");

    harness
        .run(document, Phase::Install, &vars)
        .await
        .unwrap_or_else(|err| panic!("install phase: {err}"));

    assert_eq!(
        harness.shell.commands(),
        [String::from("bash -lc 'set -e\necho demo.example.com'")]
    );
    assert_eq!(
        harness.sink.lines(),
        ["==> Greet", "Deploying to demo.example.com", "demo.example.com"]
    );
}

#[rstest]
#[tokio::test]
async fn failing_command_aborts_the_phase(harness: Harness) {
    let document = r#"
app: demo
steps:
  - name: Fetch
    run: curl -f https://example.invalid
  - name: Never
    run: "true"
"#;
    harness
        .shell
        .push_output(Some(22), "", "curl: (6) Could not resolve host\n");

    let err = harness
        .run(document, Phase::Install, &TemplateContext::new())
        .await
        .expect_err("step should fail");

    assert_eq!(
        err,
        StepError::CommandFailed {
            step: String::from("Fetch"),
            status: String::from("22"),
            stderr: String::from("curl: (6) Could not resolve host"),
        }
    );
    assert_eq!(harness.shell.commands().len(), 1, "later steps must not run");
}

#[test]
fn unnamed_steps_are_labelled_by_position() {
    let step = Step::default();
    assert_eq!(label(2, &step), "#3");
}

#[test]
fn stderr_tail_keeps_the_last_lines() {
    let stderr = (1..=8).map(|n| format!("line {n}\n")).collect::<String>();
    assert_eq!(stderr_tail(&stderr), "line 4\nline 5\nline 6\nline 7\nline 8");
}

const WIZARD: &str = r#"
app: wizard
steps:
  - name: Wizard
    run: ./install.sh
    tty:
      auto_answer:
        - wait_for: "Continue?"
          value: true
        - wait_for: "Admin:"
          value: "{opts.Admin}"
"#;

#[rstest]
#[tokio::test]
async fn interactive_steps_answer_prompts(harness: Harness) {
    harness.shell.push_tui(
        FakeTui::exiting(0)
            .print("\x1b[2J\x1b[1;1HContinue? (y/n) ")
            .read_line()
            .print("\x1b[32mAdmin:\x1b[0m ")
            .read_line()
            .print("done\r\n"),
    );
    let mut vars = TemplateContext::new();
    vars.insert_string("Admin", "root");

    harness
        .run(WIZARD, Phase::Install, &vars)
        .await
        .unwrap_or_else(|err| panic!("install phase: {err}"));

    assert_eq!(harness.shell.typed(), ["y", "root"]);
    assert!(harness.registry.is_empty(), "session must be deregistered");

    let started = harness.sink.lines_starting_with(PTY_SESSION_MARKER);
    let ended = harness.sink.lines_starting_with(PTY_END_MARKER);
    assert_eq!(started.len(), 1);
    assert_eq!(ended.len(), 1);
    assert_eq!(
        started.first().map(|line| line.replace(PTY_SESSION_MARKER, "")),
        ended.first().map(|line| line.replace(PTY_END_MARKER, ""))
    );
    assert!(!harness.sink.lines_starting_with(PTY_OUTPUT_MARKER).is_empty());
}

#[rstest]
#[tokio::test]
async fn interactive_failures_abort_the_phase(harness: Harness) {
    harness.shell.push_tui(FakeTui::exiting(3).print("fatal: disk full\r\n"));

    let err = harness
        .run(WIZARD, Phase::Install, &TemplateContext::new())
        .await
        .expect_err("non-zero exit should fail");

    assert_eq!(
        err,
        StepError::TtyFailed {
            step: String::from("Wizard"),
            status: String::from("3"),
        }
    );
    assert!(harness.registry.is_empty());
    assert_eq!(harness.sink.lines_starting_with(PTY_END_MARKER).len(), 1);
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn unseen_prompts_time_out_and_answer_anyway(harness: Harness) {
    let document = r#"
app: demo
steps:
  - run: ./setup
    tty:
      auto_answer:
        - wait_for: "Never shown"
          timeout_ms: 1000
          value: fallback
"#;
    harness
        .shell
        .push_tui(FakeTui::exiting(0).print("Ready> ").read_line());

    harness
        .run(document, Phase::Install, &TemplateContext::new())
        .await
        .unwrap_or_else(|err| panic!("install phase: {err}"));

    assert_eq!(harness.shell.typed(), ["fallback"]);
}

#[rstest]
#[tokio::test]
async fn invalid_prompt_patterns_answer_immediately(harness: Harness) {
    let document = r#"
app: demo
steps:
  - run: ./setup
    tty:
      auto_answer:
        - wait_for: "(["
          wait_for_regex: true
          value: "n\n"
"#;
    harness
        .shell
        .push_tui(FakeTui::exiting(0).print("Proceed? ").read_line());

    harness
        .run(document, Phase::Install, &TemplateContext::new())
        .await
        .unwrap_or_else(|err| panic!("install phase: {err}"));

    assert_eq!(harness.shell.typed(), ["n"]);
}
