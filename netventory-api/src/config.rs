//! API Configuration Module
//!
//! Role, module flags, worker flags, and HTTP tuning, loaded from
//! environment variables with development-friendly defaults.

use std::time::Duration;

use netventory_core::InstanceRole;

/// Runtime configuration for a Netventory instance.
#[derive(Debug, Clone)]
pub struct ApiConfig {
    /// Deployment role. Cloud instances mount the sync endpoints; local
    /// instances run the workers that originate sync traffic.
    pub role: InstanceRole,

    /// Whether the inventory module is enabled.
    pub inventory_enabled: bool,

    /// Whether the network module is enabled.
    pub network_enabled: bool,

    /// Whether the local push worker runs (local role only).
    pub push_worker_enabled: bool,

    /// Whether the local pull worker runs (local role only).
    pub pull_worker_enabled: bool,

    /// Max rows per pull reply.
    pub pull_page_size: usize,

    /// Soft per-request timeout.
    pub request_timeout: Duration,

    /// Allowed CORS origins (comma-separated in env). Empty allows all.
    pub cors_origins: Vec<String>,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            role: InstanceRole::Local,
            inventory_enabled: true,
            network_enabled: true,
            push_worker_enabled: false,
            pull_worker_enabled: false,
            pull_page_size: 1000,
            request_timeout: Duration::from_secs(30),
            cors_origins: Vec::new(),
        }
    }
}

fn env_flag(name: &str, default: bool) -> bool {
    std::env::var(name)
        .ok()
        .map(|s| matches!(s.to_lowercase().as_str(), "1" | "true" | "yes" | "on"))
        .unwrap_or(default)
}

impl ApiConfig {
    /// Create configuration from environment variables.
    ///
    /// Environment variables:
    /// - `ROLE`: "local" (default) or "cloud"
    /// - `INVENTORY_ENABLED` / `NETWORK_ENABLED`: module flags (default true)
    /// - `ENABLE_SYNC_PUSH_WORKER` / `ENABLE_SYNC_PULL_WORKER`: worker
    ///   flags (default false)
    /// - `NETVENTORY_PULL_PAGE_SIZE`: rows per pull reply (default 1000)
    /// - `NETVENTORY_REQUEST_TIMEOUT_SECS`: soft request timeout (default 30)
    /// - `NETVENTORY_CORS_ORIGINS`: comma-separated origins (empty = all)
    pub fn from_env() -> Self {
        let role: InstanceRole = std::env::var("ROLE")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or_default();

        let cors_origins = std::env::var("NETVENTORY_CORS_ORIGINS")
            .ok()
            .map(|s| {
                s.split(',')
                    .map(|o| o.trim().to_string())
                    .filter(|o| !o.is_empty())
                    .collect()
            })
            .unwrap_or_default();

        Self {
            role,
            inventory_enabled: env_flag("INVENTORY_ENABLED", true),
            network_enabled: env_flag("NETWORK_ENABLED", true),
            push_worker_enabled: env_flag("ENABLE_SYNC_PUSH_WORKER", false),
            pull_worker_enabled: env_flag("ENABLE_SYNC_PULL_WORKER", false),
            pull_page_size: std::env::var("NETVENTORY_PULL_PAGE_SIZE")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(1000),
            request_timeout: Duration::from_secs(
                std::env::var("NETVENTORY_REQUEST_TIMEOUT_SECS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(30),
            ),
            cors_origins,
        }
    }

    /// Whether this instance serves the cloud sync endpoints.
    pub fn is_cloud(&self) -> bool {
        self.role == InstanceRole::Cloud
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_local_with_no_workers() {
        let config = ApiConfig::default();
        assert_eq!(config.role, InstanceRole::Local);
        assert!(!config.is_cloud());
        assert!(!config.push_worker_enabled);
        assert!(!config.pull_worker_enabled);
        assert_eq!(config.pull_page_size, 1000);
        assert_eq!(config.request_timeout, Duration::from_secs(30));
    }

    #[test]
    fn test_cloud_role_flag() {
        let config = ApiConfig {
            role: InstanceRole::Cloud,
            ..ApiConfig::default()
        };
        assert!(config.is_cloud());
    }
}
