//! Enumerations shared across the sync core.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::ValidationError;

// ============================================================================
// MODEL KINDS
// ============================================================================

/// The set of sync-managed entity kinds. Every replicated table maps to
/// exactly one variant; the serialized form doubles as the table name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
#[serde(rename_all = "snake_case")]
pub enum ModelKind {
    Users,
    Devices,
    Vlans,
    SshCredentials,
    SnmpCommunities,
    Locations,
    DeviceTypes,
    Sites,
    Tags,
}

impl ModelKind {
    /// All model kinds, in the order the legacy multi-model endpoint
    /// processes them.
    pub const ALL: [ModelKind; 9] = [
        ModelKind::Users,
        ModelKind::Devices,
        ModelKind::Vlans,
        ModelKind::SshCredentials,
        ModelKind::SnmpCommunities,
        ModelKind::Locations,
        ModelKind::DeviceTypes,
        ModelKind::Sites,
        ModelKind::Tags,
    ];

    /// Table name for this model kind. Also the wire tag and the key used
    /// for `(model, uuid)` lexicographic tie-breaking in pulls.
    pub fn table_name(&self) -> &'static str {
        match self {
            ModelKind::Users => "users",
            ModelKind::Devices => "devices",
            ModelKind::Vlans => "vlans",
            ModelKind::SshCredentials => "ssh_credentials",
            ModelKind::SnmpCommunities => "snmp_communities",
            ModelKind::Locations => "locations",
            ModelKind::DeviceTypes => "device_types",
            ModelKind::Sites => "sites",
            ModelKind::Tags => "tags",
        }
    }
}

impl fmt::Display for ModelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.table_name())
    }
}

impl FromStr for ModelKind {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ModelKind::ALL
            .iter()
            .find(|m| m.table_name() == s)
            .copied()
            .ok_or_else(|| ValidationError::UnknownModel {
                name: s.to_string(),
            })
    }
}

// ============================================================================
// SYNC METADATA ENUMS
// ============================================================================

/// Mutation kind recorded in `sync_logs`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
#[serde(rename_all = "snake_case")]
pub enum SyncAction {
    Create,
    Update,
    Delete,
}

impl SyncAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncAction::Create => "create",
            SyncAction::Update => "update",
            SyncAction::Delete => "delete",
        }
    }
}

/// Which end of the hub-and-spoke a mutation travelled from/to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
#[serde(rename_all = "snake_case")]
pub enum SyncPeer {
    Site,
    Cloud,
}

impl SyncPeer {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncPeer::Site => "site",
            SyncPeer::Cloud => "cloud",
        }
    }
}

/// Provenance of a deletion: a human at the site, the cloud reconciler,
/// or automated cleanup. Also used for `devices.deleted_origin`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
#[serde(rename_all = "snake_case")]
pub enum SyncOrigin {
    Local,
    Cloud,
    Auto,
}

impl SyncOrigin {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncOrigin::Local => "local",
            SyncOrigin::Cloud => "cloud",
            SyncOrigin::Auto => "auto",
        }
    }
}

impl FromStr for SyncOrigin {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "local" => Ok(SyncOrigin::Local),
            "cloud" => Ok(SyncOrigin::Cloud),
            "auto" => Ok(SyncOrigin::Auto),
            other => Err(ValidationError::InvalidValue {
                field: "origin".to_string(),
                reason: format!("unknown origin '{}'", other),
            }),
        }
    }
}

// ============================================================================
// INSTANCE ROLE
// ============================================================================

/// Deployment role of a running instance. Cloud instances expose the sync
/// endpoints; local instances run the workers that originate sync traffic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum InstanceRole {
    #[default]
    Local,
    Cloud,
}

impl InstanceRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            InstanceRole::Local => "local",
            InstanceRole::Cloud => "cloud",
        }
    }
}

impl FromStr for InstanceRole {
    type Err = std::convert::Infallible;

    /// Parse role from string (case-insensitive). Anything other than
    /// "cloud" is treated as local, the safe default.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.to_lowercase().as_str() {
            "cloud" => InstanceRole::Cloud,
            _ => InstanceRole::Local,
        })
    }
}

// ============================================================================
// SCHEMA SELF-CHECK
// ============================================================================

/// Divergence kind recorded in `schema_validation_issues`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
#[serde(rename_all = "snake_case")]
pub enum SchemaIssueType {
    MissingColumn,
    ExtraColumn,
    TypeMismatch,
    NullabilityMismatch,
}

impl SchemaIssueType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SchemaIssueType::MissingColumn => "missing_column",
            SchemaIssueType::ExtraColumn => "extra_column",
            SchemaIssueType::TypeMismatch => "type_mismatch",
            SchemaIssueType::NullabilityMismatch => "nullability_mismatch",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_model_kind_roundtrip() {
        for model in ModelKind::ALL {
            let parsed: ModelKind = model.table_name().parse().unwrap();
            assert_eq!(parsed, model);
        }
    }

    #[test]
    fn test_model_kind_serde_matches_table_name() {
        for model in ModelKind::ALL {
            let json = serde_json::to_string(&model).unwrap();
            assert_eq!(json, format!("\"{}\"", model.table_name()));
        }
    }

    #[test]
    fn test_unknown_model_is_rejected() {
        let err = "interfaces".parse::<ModelKind>().unwrap_err();
        assert!(matches!(err, ValidationError::UnknownModel { .. }));
    }

    #[test]
    fn test_role_parse_defaults_to_local() {
        assert_eq!("cloud".parse::<InstanceRole>().unwrap(), InstanceRole::Cloud);
        assert_eq!("CLOUD".parse::<InstanceRole>().unwrap(), InstanceRole::Cloud);
        assert_eq!("local".parse::<InstanceRole>().unwrap(), InstanceRole::Local);
        assert_eq!("garbage".parse::<InstanceRole>().unwrap(), InstanceRole::Local);
    }

    #[test]
    fn test_sync_origin_parse() {
        assert_eq!("auto".parse::<SyncOrigin>().unwrap(), SyncOrigin::Auto);
        assert!("remote".parse::<SyncOrigin>().is_err());
    }
}
