//! Tests for DNS host detection and record resolution.

use std::net::{IpAddr, Ipv4Addr};

use rstest::rstest;

use super::*;
use crate::test_support::StaticNameservers;

const IP: IpAddr = IpAddr::V4(Ipv4Addr::new(198, 51, 100, 7));

#[rstest]
#[case("ns1.cloudflare.com", DnsHost::Cloudflare)]
#[case("NS2.DigitalOcean.com.", DnsHost::DigitalOcean)]
#[case("ns0.dom.scw.cloud", DnsHost::Scaleway)]
#[case("ns-1234.awsdns-12.org", DnsHost::Route53)]
#[case("dns1.registrar-servers.com", DnsHost::Namecheap)]
fn classifies_known_hosts(#[case] nameserver: &str, #[case] expected: DnsHost) {
    assert_eq!(DnsHost::classify(nameserver), expected);
}

#[test]
fn unknown_hosts_keep_the_raw_name() {
    let host = DnsHost::classify("ns1.example-dns.net.");
    assert_eq!(host, DnsHost::Unknown(String::from("ns1.example-dns.net")));
    assert_eq!(host.to_string(), "unknown (ns1.example-dns.net)");
}

#[rstest]
#[case("app.example.com", "example.com", "app")]
#[case("a.b.example.com", "example.com", "a.b")]
#[case("example.com", "example.com", "")]
#[case("localhost", "localhost", "")]
fn splits_domains(#[case] fqdn: &str, #[case] zone: &str, #[case] sub: &str) {
    assert_eq!(split_domain(fqdn), (zone.to_owned(), sub.to_owned()));
}

#[test]
fn parses_doh_answers() {
    let body = br#"{"Status": 0, "Answer": [
        {"name": "example.com.", "type": 2, "TTL": 300, "data": "NS1.Cloudflare.com."},
        {"name": "example.com.", "type": 46, "TTL": 300, "data": "sig"}
    ]}"#;
    let nameservers = nameservers_from(body).unwrap_or_else(|err| panic!("parse: {err}"));
    assert_eq!(nameservers, ["ns1.cloudflare.com"]);
}

#[test]
fn doh_response_without_answers_is_empty() {
    let nameservers =
        nameservers_from(br#"{"Status": 3}"#).unwrap_or_else(|err| panic!("parse: {err}"));
    assert!(nameservers.is_empty());
}

#[tokio::test]
async fn detection_retries_with_the_root_domain() {
    let lookup = StaticNameservers::new().with("example.com", &["ns1.digitalocean.com"]);

    let host = detect_dns_provider(&lookup, "app.example.com")
        .await
        .unwrap_or_else(|err| panic!("detect: {err}"));

    assert_eq!(host, DnsHost::DigitalOcean);
    assert_eq!(lookup.queries(), ["app.example.com", "example.com"]);
}

#[tokio::test]
async fn detection_without_nameservers_fails() {
    let lookup = StaticNameservers::new();
    let err = detect_dns_provider(&lookup, "example.com")
        .await
        .expect_err("no nameservers");
    assert_eq!(err, DnsError::NoNameservers(String::from("example.com")));
    assert_eq!(lookup.queries(), ["example.com"]);
}

#[test]
fn empty_templates_yield_one_address_record() {
    let records = resolve_records(&[], "app.example.com", IP, &TemplateContext::new());
    assert_eq!(
        records,
        vec![DnsRecord {
            record_type: String::from("A"),
            name: String::from("app.example.com"),
            content: String::from("198.51.100.7"),
            ttl: 0,
            proxied: None,
        }]
    );
}

#[test]
fn templates_are_rendered_and_defaulted() {
    let mut vars = TemplateContext::new();
    vars.insert_string("Domain", "app.example.com");
    let templates = vec![
        DnsRecordTemplate {
            record_type: String::from("A"),
            name: String::from("@"),
            ..DnsRecordTemplate::default()
        },
        DnsRecordTemplate {
            record_type: String::from("CNAME"),
            name: String::from("www"),
            content: String::from("{opts.Domain}"),
            ttl: 600,
            proxied: Some(true),
        },
        DnsRecordTemplate {
            record_type: String::from("AAAA"),
            name: String::from("v6.app.example.com"),
            content: String::from("2001:db8::1"),
            ..DnsRecordTemplate::default()
        },
    ];

    let records = resolve_records(&templates, "app.example.com", IP, &vars);

    let summary: Vec<_> = records
        .iter()
        .map(|r| (r.record_type.as_str(), r.name.as_str(), r.content.as_str(), r.ttl))
        .collect();
    assert_eq!(
        summary,
        [
            ("A", "app.example.com", "198.51.100.7", 0),
            ("CNAME", "www.app.example.com", "app.example.com", 600),
            ("AAAA", "v6.app.example.com", "2001:db8::1", 0),
        ]
    );
}
