//! Tests for size selection and the provider registry.

use rstest::{fixture, rstest};

use super::*;
use crate::test_support::FakeProvider;

fn size(id: &str, vcpus: u32, memory_mb: u64, price: f64) -> Size {
    Size {
        id: id.to_owned(),
        vcpus,
        memory_mb,
        disk_gb: 25,
        price_monthly: price,
        regions: Vec::new(),
    }
}

#[fixture]
fn sizes() -> Vec<Size> {
    vec![
        size("small", 1, 1024, 5.0),
        size("medium", 2, 2048, 10.0),
        size("large", 4, 4096, 20.0),
    ]
}

#[rstest]
fn picks_cheapest_qualifying_size(sizes: Vec<Size>) {
    let min = MinSpec {
        cpu: 2,
        ram_mb: 2048,
        disk_gb: 0,
    };
    assert_eq!(select_size_for_specs(&sizes, &min), Ok(String::from("medium")));
}

#[rstest]
fn fails_when_nothing_qualifies(sizes: Vec<Size>) {
    let min = MinSpec {
        cpu: 8,
        ram_mb: 0,
        disk_gb: 0,
    };
    let err = select_size_for_specs(&sizes, &min).expect_err("no size should match");
    assert!(err.to_string().contains("no matching size"), "{err}");
}

#[test]
fn ties_keep_the_first_size() {
    let sizes = vec![size("first", 2, 2048, 10.0), size("second", 2, 4096, 10.0)];
    let min = MinSpec {
        cpu: 1,
        ram_mb: 1024,
        disk_gb: 0,
    };
    assert_eq!(select_size_for_specs(&sizes, &min), Ok(String::from("first")));
}

#[tokio::test]
async fn default_region_listing_filters_by_region() {
    let mut regional = size("regional", 1, 1024, 4.0);
    regional.regions = vec![String::from("ams3")];
    let mut elsewhere = size("elsewhere", 1, 1024, 3.0);
    elsewhere.regions = vec![String::from("nyc1")];
    let everywhere = size("everywhere", 1, 1024, 5.0);
    let provider = FakeProvider::new().with_sizes(vec![regional, elsewhere, everywhere]);

    let ids: Vec<_> = provider
        .list_sizes_for_region("ams3")
        .await
        .unwrap_or_else(|err| panic!("list sizes: {err}"))
        .into_iter()
        .map(|size| size.id)
        .collect();

    assert_eq!(ids, ["regional", "everywhere"]);
}

#[tokio::test]
async fn default_size_for_specs_uses_all_sizes() {
    let provider = FakeProvider::new().with_sizes(sizes());
    let min = MinSpec {
        cpu: 3,
        ram_mb: 0,
        disk_gb: 0,
    };
    let chosen = provider
        .get_size_for_specs(&min)
        .await
        .unwrap_or_else(|err| panic!("size for specs: {err}"));
    assert_eq!(chosen, "large");
}

#[test]
fn registry_builds_fresh_instances() {
    let mut registry = ProviderRegistry::new();
    registry.register("fake", || Box::new(FakeProvider::new()));

    let provider = registry
        .create("fake")
        .unwrap_or_else(|err| panic!("create: {err}"));
    assert_eq!(provider.name(), "fake");
    assert_eq!(registry.names().collect::<Vec<_>>(), ["fake"]);
    assert!(matches!(
        registry.create("missing"),
        Err(ProviderError::UnknownProvider(name)) if name == "missing"
    ));
}
