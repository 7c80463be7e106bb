//! Tunables for the sync layer.

use std::time::Duration;

/// [`SyncProvider`](crate::provider::SyncProvider) settings.
#[derive(Debug, Clone)]
pub struct ProviderConfig {
    /// How often the local presence is re-announced while connected.
    pub presence_renew_interval: Duration,
    /// Remote presence not renewed within this window is dropped.
    pub presence_timeout: Duration,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            presence_renew_interval: Duration::from_secs(15),
            presence_timeout: Duration::from_secs(30),
        }
    }
}

impl ProviderConfig {
    pub fn for_testing() -> Self {
        Self {
            presence_renew_interval: Duration::from_millis(200),
            presence_timeout: Duration::from_millis(500),
        }
    }
}

/// [`SeedCoordinator`](crate::seed::SeedCoordinator) settings.
#[derive(Debug, Clone)]
pub struct SeedConfig {
    /// Wait after `Connected` so peers' state can arrive first.
    pub grace: Duration,
}

impl Default for SeedConfig {
    fn default() -> Self {
        Self {
            grace: Duration::from_millis(150),
        }
    }
}

impl SeedConfig {
    pub fn for_testing() -> Self {
        Self {
            grace: Duration::from_millis(10),
        }
    }
}

/// [`SnapshotReconciler`](crate::reconciler::SnapshotReconciler) settings.
#[derive(Debug, Clone)]
pub struct ReconcilerConfig {
    /// Inactivity after the last mutation before the entity is written.
    pub debounce_window: Duration,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            debounce_window: Duration::from_secs(1),
        }
    }
}

impl ReconcilerConfig {
    pub fn for_testing() -> Self {
        Self {
            debounce_window: Duration::from_millis(50),
        }
    }
}

/// Everything a [`Workspace`](crate::session::Workspace) needs.
#[derive(Debug, Clone)]
pub struct WorkspaceConfig {
    /// Shown to peers through presence.
    pub display_name: String,
    /// Interval between document autosaves.
    pub autosave_interval: Duration,
    pub provider: ProviderConfig,
    pub seed: SeedConfig,
    pub reconciler: ReconcilerConfig,
}

impl Default for WorkspaceConfig {
    fn default() -> Self {
        Self {
            display_name: "Anonymous".to_string(),
            autosave_interval: Duration::from_secs(5),
            provider: ProviderConfig::default(),
            seed: SeedConfig::default(),
            reconciler: ReconcilerConfig::default(),
        }
    }
}

impl WorkspaceConfig {
    pub fn for_testing(display_name: impl Into<String>) -> Self {
        Self {
            display_name: display_name.into(),
            autosave_interval: Duration::from_millis(100),
            provider: ProviderConfig::for_testing(),
            seed: SeedConfig::for_testing(),
            reconciler: ReconcilerConfig::for_testing(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = WorkspaceConfig::default();
        assert_eq!(config.autosave_interval, Duration::from_secs(5));
        assert_eq!(config.seed.grace, Duration::from_millis(150));
        assert_eq!(config.reconciler.debounce_window, Duration::from_secs(1));
        assert_eq!(config.provider.presence_renew_interval, Duration::from_secs(15));
        assert!(config.provider.presence_timeout > config.provider.presence_renew_interval);
    }

    #[test]
    fn test_testing_config_keeps_timeout_above_renewal() {
        let config = WorkspaceConfig::for_testing("ana");
        assert_eq!(config.display_name, "ana");
        assert!(config.provider.presence_timeout > config.provider.presence_renew_interval);
    }
}
