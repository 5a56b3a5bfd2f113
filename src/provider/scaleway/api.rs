//! Wire types for the Scaleway Instances and Domains APIs that the
//! `scaleway-rs` client does not cover.

use std::collections::BTreeMap;
use std::net::IpAddr;

use serde::{Deserialize, Serialize};

use crate::provider::Size;

pub(super) const INSTANCE_API_BASE: &str = "https://api.scaleway.com/instance/v1";
pub(super) const DOMAIN_API_BASE: &str = "https://api.scaleway.com/domain/v2beta1";

/// Reserved user-data key that cloud-init reads on first boot.
pub(super) const CLOUD_INIT_USER_DATA_KEY: &str = "cloud-init";

const BYTES_PER_MB: u64 = 1024 * 1024;
const BYTES_PER_GB: u64 = 1_000_000_000;

#[derive(Serialize)]
pub(super) struct CreateServerRequest {
    pub(super) name: String,
    pub(super) commercial_type: String,
    pub(super) image: String,
    pub(super) project: String,
    pub(super) routed_ip_enabled: bool,
    pub(super) dynamic_ip_required: bool,
    pub(super) tags: Vec<String>,
    pub(super) stopped: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(super) organization: Option<String>,
}

#[derive(Deserialize)]
pub(super) struct CreateServerResponse {
    pub(super) server: scaleway_rs::ScalewayInstance,
}

#[derive(Debug, Deserialize)]
pub(super) struct ProductsResponse {
    #[serde(default)]
    servers: BTreeMap<String, ProductServer>,
}

#[derive(Debug, Deserialize)]
struct ProductServer {
    #[serde(default)]
    monthly_price: Option<f64>,
    ncpus: u32,
    ram: u64,
    #[serde(default)]
    volumes_constraint: Option<VolumesConstraint>,
}

#[derive(Debug, Deserialize)]
struct VolumesConstraint {
    #[serde(default)]
    max_size: u64,
}

impl ProductsResponse {
    /// Converts the commercial types of `zone` into sizes. Types without a
    /// monthly price are not sold per month and are skipped.
    pub(super) fn into_sizes(self, zone: &str) -> Vec<Size> {
        self.servers
            .into_iter()
            .filter_map(|(id, product)| {
                let price = product.monthly_price?;
                Some(Size {
                    id,
                    vcpus: product.ncpus,
                    memory_mb: product.ram.div_euclid(BYTES_PER_MB),
                    disk_gb: product
                        .volumes_constraint
                        .map_or(0, |constraint| constraint.max_size.div_euclid(BYTES_PER_GB)),
                    price_monthly: price,
                    regions: vec![zone.to_owned()],
                })
            })
            .collect()
    }
}

#[derive(Debug, Serialize)]
pub(super) struct RecordChanges {
    changes: Vec<RecordChange>,
}

#[derive(Debug, Serialize)]
struct RecordChange {
    set: RecordSet,
}

#[derive(Debug, Serialize)]
struct RecordSet {
    id_fields: IdFields,
    records: Vec<Record>,
}

#[derive(Debug, Serialize)]
struct IdFields {
    name: String,
    #[serde(rename = "type")]
    record_type: String,
}

#[derive(Debug, Serialize)]
struct Record {
    name: String,
    #[serde(rename = "type")]
    record_type: String,
    data: String,
    ttl: u32,
}

impl RecordChanges {
    /// Replaces the address record `name` with one pointing at `ip`.
    pub(super) fn address(name: &str, ip: IpAddr, ttl: u32) -> Self {
        let record_type = if ip.is_ipv4() { "A" } else { "AAAA" };
        Self {
            changes: vec![RecordChange {
                set: RecordSet {
                    id_fields: IdFields {
                        name: name.to_owned(),
                        record_type: record_type.to_owned(),
                    },
                    records: vec![Record {
                        name: name.to_owned(),
                        record_type: record_type.to_owned(),
                        data: ip.to_string(),
                        ttl,
                    }],
                },
            }],
        }
    }
}

pub(super) fn user_data_url(zone: &str, server_id: &str) -> String {
    format!("{INSTANCE_API_BASE}/zones/{zone}/servers/{server_id}/user_data/{CLOUD_INIT_USER_DATA_KEY}")
}
