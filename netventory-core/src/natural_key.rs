//! Natural-key extraction.
//!
//! A natural key is the per-model tuple of domain fields used to collapse
//! duplicates independently of `id`/`uuid`. Two records are duplicates iff
//! their extracted keys are equal; a record whose key fields are all empty
//! has no natural key and never collides.

use serde_json::Value;

use crate::enums::ModelKind;
use crate::record::Payload;
use crate::VIRTUAL_WAREHOUSE_SITE_ID;

/// A fully-resolved natural key. For devices the key is the first
/// non-empty of (mac), (hostname, site), (ip, site); for every other
/// model the tuple is fixed.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum NaturalKey {
    UserEmail { email: String },
    DeviceMac { mac: String },
    DeviceHostname { hostname: String, site_id: i64 },
    DeviceIp { ip: String, site_id: i64 },
    Vlan { vlan_id: i64, site_id: i64 },
    SshCredential { username: String, host: String },
    SnmpCommunity {
        community: String,
        snmp_version: String,
        scope: String,
    },
    LocationName { name: String, site_id: i64 },
    DeviceTypeName { name: String },
    SiteName { name: String },
    TagName { name: String },
}

impl NaturalKey {
    /// Model kind this key belongs to.
    pub fn model(&self) -> ModelKind {
        match self {
            NaturalKey::UserEmail { .. } => ModelKind::Users,
            NaturalKey::DeviceMac { .. }
            | NaturalKey::DeviceHostname { .. }
            | NaturalKey::DeviceIp { .. } => ModelKind::Devices,
            NaturalKey::Vlan { .. } => ModelKind::Vlans,
            NaturalKey::SshCredential { .. } => ModelKind::SshCredentials,
            NaturalKey::SnmpCommunity { .. } => ModelKind::SnmpCommunities,
            NaturalKey::LocationName { .. } => ModelKind::Locations,
            NaturalKey::DeviceTypeName { .. } => ModelKind::DeviceTypes,
            NaturalKey::SiteName { .. } => ModelKind::Sites,
            NaturalKey::TagName { .. } => ModelKind::Tags,
        }
    }
}

/// Non-empty trimmed string field, or None.
fn str_field(fields: &Payload, name: &str) -> Option<String> {
    match fields.get(name) {
        Some(Value::String(s)) => {
            let trimmed = s.trim();
            if trimmed.is_empty() {
                None
            } else {
                Some(trimmed.to_string())
            }
        }
        _ => None,
    }
}

/// Integer field, accepting JSON numbers and numeric strings.
fn i64_field(fields: &Payload, name: &str) -> Option<i64> {
    match fields.get(name) {
        Some(Value::Number(n)) => n.as_i64(),
        Some(Value::String(s)) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Extract the natural key for a record's payload, or None when the key
/// fields are absent or empty.
pub fn natural_key_of(model: ModelKind, fields: &Payload) -> Option<NaturalKey> {
    match model {
        ModelKind::Users => str_field(fields, "email").map(|email| NaturalKey::UserEmail {
            email: email.to_lowercase(),
        }),
        ModelKind::Devices => {
            // First non-empty of (mac), (hostname, site), (ip, site).
            // MACs and hostnames compare case-insensitively; devices with
            // no site fall back to the virtual warehouse.
            let site_id = i64_field(fields, "site_id").unwrap_or(VIRTUAL_WAREHOUSE_SITE_ID);
            if let Some(mac) = str_field(fields, "mac") {
                return Some(NaturalKey::DeviceMac {
                    mac: mac.to_lowercase(),
                });
            }
            if let Some(hostname) = str_field(fields, "hostname") {
                return Some(NaturalKey::DeviceHostname {
                    hostname: hostname.to_lowercase(),
                    site_id,
                });
            }
            str_field(fields, "ip").map(|ip| NaturalKey::DeviceIp { ip, site_id })
        }
        ModelKind::Vlans => {
            let vlan_id = i64_field(fields, "vlan_id")?;
            let site_id = i64_field(fields, "site_id")?;
            Some(NaturalKey::Vlan { vlan_id, site_id })
        }
        ModelKind::SshCredentials => {
            let username = str_field(fields, "username")?;
            let host = str_field(fields, "host")?;
            Some(NaturalKey::SshCredential { username, host })
        }
        ModelKind::SnmpCommunities => {
            let community = str_field(fields, "community")?;
            let snmp_version = str_field(fields, "snmp_version")?;
            let scope = match str_field(fields, "host") {
                Some(host) => host,
                None => format!("site:{}", i64_field(fields, "site_id")?),
            };
            Some(NaturalKey::SnmpCommunity {
                community,
                snmp_version,
                scope,
            })
        }
        ModelKind::Locations => {
            let name = str_field(fields, "name")?;
            let site_id = i64_field(fields, "site_id")?;
            Some(NaturalKey::LocationName { name, site_id })
        }
        ModelKind::DeviceTypes => {
            str_field(fields, "name").map(|name| NaturalKey::DeviceTypeName { name })
        }
        ModelKind::Sites => str_field(fields, "name").map(|name| NaturalKey::SiteName { name }),
        ModelKind::Tags => str_field(fields, "name").map(|name| NaturalKey::TagName { name }),
    }
}
