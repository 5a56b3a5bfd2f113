//! Tests for installer document parsing and wizard defaults.

use std::collections::BTreeMap;
use std::time::Duration;

use rstest::rstest;

use super::*;

const DOCUMENT: &str = r#"
app: demo
description: Demo application
domain_hint: demo.example.com
min_spec:
  cpu: 2
  ram: 2GB
  disk: 20480MB
dns:
  auto: never
  records:
    - type: a
      name: "@"
      ttl: 120
      proxied: true
    - type: CNAME
      name: www
      content: "{opts.Domain}"
wizard:
  steps:
    application:
      custom_questions:
        - id: admin
          name: Admin user
          type: text
          required: true
        - id: flavour
          name: Flavour
          type: choice
          default: plain
          choices:
            - name: plain
            - name: fancy
              default: true
        - id: telemetry
          name: Send telemetry
          type: boolean
          default: false
steps:
  - name: Install
    run: apt-get install -y demo
  - name: Configure TUI
    run: demo-setup
    sleep: 5
    tty:
      auto_answer:
        - wait_for: "Continue?"
          value: true
        - value: "{opts.admin}"
          delay_ms: 10
          timeout_ms: 2000
          wait_for: "User:\\s*$"
          wait_for_regex: true
  - name: Certificate
    if: opts.EnableSSL
    run: certbot -d {opts.Domain}
    log: Securing {opts.Domain}
    sleep: 1m
"#;

fn parsed() -> InstallerSpec {
    InstallerSpec::from_yaml(DOCUMENT).unwrap_or_else(|err| panic!("parse document: {err}"))
}

#[test]
fn parses_top_level_fields() {
    let spec = parsed();
    assert_eq!(spec.app_name, "demo");
    assert_eq!(spec.domain_hint, "demo.example.com");
    assert_eq!(
        spec.min_spec,
        MinSpec {
            cpu: 2,
            ram_mb: 2048,
            disk_gb: 20,
        }
    );
    assert_eq!(spec.dns_auto, DnsAutoPolicy::Never);
}

#[test]
fn normalises_dns_record_types() {
    let spec = parsed();
    let first = spec.dns_records.first().unwrap_or_else(|| panic!("no records"));
    assert_eq!(first.record_type, "A");
    assert_eq!(first.name, "@");
    assert_eq!(first.ttl, 120);
    assert_eq!(first.proxied, Some(true));
    assert_eq!(spec.dns_records.len(), 2);
}

#[test]
fn parses_tty_auto_answers_with_defaults() {
    let spec = parsed();
    let step = spec.steps.get(1).unwrap_or_else(|| panic!("missing TTY step"));

    assert!(step.tty.enabled);
    assert_eq!(step.sleep, Some(Duration::from_secs(5)));
    assert_eq!(
        step.tty.auto_answers,
        vec![
            TtyAutoAnswer {
                value: String::from("true"),
                wait_for: Some(String::from("Continue?")),
                is_regex: false,
                timeout: DEFAULT_ANSWER_TIMEOUT,
                delay: DEFAULT_ANSWER_DELAY,
            },
            TtyAutoAnswer {
                value: String::from("{opts.admin}"),
                wait_for: Some(String::from("User:\\s*$")),
                is_regex: true,
                timeout: Duration::from_millis(2000),
                delay: Duration::from_millis(10),
            },
        ]
    );
}

#[rstest]
#[case("tty: true", true)]
#[case("tty: false", false)]
#[case("", false)]
fn accepts_boolean_tty_flag(#[case] tty: &str, #[case] enabled: bool) {
    let text = format!("app: x\nsteps:\n  - run: top\n    {tty}\n");
    let spec = InstallerSpec::from_yaml(&text).unwrap_or_else(|err| panic!("parse: {err}"));
    let step = spec.steps.first().unwrap_or_else(|| panic!("missing step"));
    assert_eq!(step.tty.enabled, enabled);
    assert!(step.tty.auto_answers.is_empty());
}

#[test]
fn partitions_steps_by_guard() {
    let spec = parsed();
    let install: Vec<_> = spec.steps_in(Phase::Install).map(|s| s.name.as_str()).collect();
    let ssl: Vec<_> = spec.steps_in(Phase::Ssl).map(|s| s.name.as_str()).collect();
    assert_eq!(install, ["Install", "Configure TUI"]);
    assert_eq!(ssl, ["Certificate"]);
}

#[test]
fn requires_app_name() {
    assert_eq!(
        InstallerSpec::from_yaml("description: nameless\n"),
        Err(InstallerError::MissingField("app"))
    );
}

#[test]
fn rejects_invalid_sleep() {
    let err = InstallerSpec::from_yaml("app: x\nsteps:\n  - name: nap\n    sleep: soon\n")
        .expect_err("invalid sleep should fail");
    assert!(
        matches!(&err, InstallerError::InvalidStep { index: 0, name, .. } if name == "nap"),
        "unexpected error: {err}"
    );
}

#[test]
fn rejects_invalid_ram() {
    let err = InstallerSpec::from_yaml("app: x\nmin_spec:\n  ram: plenty\n")
        .expect_err("invalid ram should fail");
    assert!(matches!(err, InstallerError::InvalidSize { field: "ram", .. }));
}

#[test]
fn rejects_choice_question_without_choices() {
    let text = "app: x\nwizard:\n  steps:\n    application:\n      custom_questions:\n        - id: pick\n          type: choice\n";
    let err = InstallerSpec::from_yaml(text).expect_err("empty choice should fail");
    assert!(matches!(err, InstallerError::InvalidQuestion { .. }));
}

#[test]
fn wizard_defaults_fill_unanswered_questions() {
    let spec = parsed();
    let mut answers = BTreeMap::from([(String::from("admin"), String::from("root"))]);

    spec.apply_wizard_defaults(&mut answers)
        .unwrap_or_else(|err| panic!("defaults: {err}"));

    assert_eq!(answers.get("admin").map(String::as_str), Some("root"));
    assert_eq!(answers.get("flavour").map(String::as_str), Some("fancy"));
    assert_eq!(answers.get("telemetry").map(String::as_str), Some("false"));
}

#[test]
fn wizard_defaults_report_missing_required_answer() {
    let spec = parsed();
    let mut answers = BTreeMap::from([(String::from("admin"), String::from("  "))]);

    let err = spec
        .apply_wizard_defaults(&mut answers)
        .expect_err("blank required answer should fail");
    assert_eq!(
        err,
        InstallerError::MissingAnswer {
            id: String::from("admin"),
            name: String::from("Admin user"),
        }
    );
}
