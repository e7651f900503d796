//! Service settings and cluster-wide policy resolution
//!
//! `TemplateConfig` holds the per-deployment settings the controller is
//! started with. `ClusterPolicy` holds the two flags read from the cluster
//! configuration record on every render.

use tracing::debug;

use crate::error::TemplateError;
use crate::stores::ConfigStore;

/// Config key enabling software emulation instead of hardware virtualization
pub const USE_EMULATION_KEY: &str = "debug.useEmulation";

/// Config key overriding the launcher image pull policy
pub const IMAGE_PULL_POLICY_KEY: &str = "dev.imagePullPolicy";

/// Default directory shared between the launcher and the node agent
pub const DEFAULT_VIRT_SHARE_DIR: &str = "/var/run/kubevirt";

/// Default directory holding ephemeral disk overlays
pub const DEFAULT_EPHEMERAL_DISK_DIR: &str = "/var/run/kubevirt-ephemeral-disks";

/// Settings of the template service
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TemplateConfig {
    /// Image of the launcher (compute) container
    pub launcher_image: String,
    /// Host directory shared with the node agent
    pub virt_share_dir: String,
    /// Directory for ephemeral disk overlays
    pub ephemeral_disk_dir: String,
    /// Pull secret added to every launcher pod
    pub image_pull_secret: Option<String>,
}

impl TemplateConfig {
    /// Settings with default directories and no pull secret
    pub fn new(launcher_image: impl Into<String>) -> Self {
        Self {
            launcher_image: launcher_image.into(),
            virt_share_dir: DEFAULT_VIRT_SHARE_DIR.to_string(),
            ephemeral_disk_dir: DEFAULT_EPHEMERAL_DISK_DIR.to_string(),
            image_pull_secret: None,
        }
    }

    /// Set the shared directory
    pub fn with_virt_share_dir(mut self, dir: impl Into<String>) -> Self {
        self.virt_share_dir = dir.into();
        self
    }

    /// Set the ephemeral disk directory
    pub fn with_ephemeral_disk_dir(mut self, dir: impl Into<String>) -> Self {
        self.ephemeral_disk_dir = dir.into();
        self
    }

    /// Set the default pull secret; empty names are ignored
    pub fn with_image_pull_secret(mut self, secret: Option<String>) -> Self {
        self.image_pull_secret = secret.filter(|s| !s.is_empty());
        self
    }

    /// Check the settings are usable
    pub fn validate(&self) -> Result<(), TemplateError> {
        if self.launcher_image.trim().is_empty() {
            return Err(TemplateError::invalid_configuration(
                "launcherImage",
                &self.launcher_image,
                "launcher image must not be empty",
            ));
        }
        for (key, dir) in [
            ("virtShareDir", &self.virt_share_dir),
            ("ephemeralDiskDir", &self.ephemeral_disk_dir),
        ] {
            if !dir.starts_with('/') {
                return Err(TemplateError::invalid_configuration(
                    key,
                    dir,
                    "must be an absolute path",
                ));
            }
        }
        Ok(())
    }
}

/// Image pull policy for launcher containers
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum PullPolicy {
    /// Always pull
    Always,
    /// Never pull
    Never,
    /// Pull when the image is missing
    #[default]
    IfNotPresent,
}

impl PullPolicy {
    /// Wire name of the policy
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Always => "Always",
            Self::Never => "Never",
            Self::IfNotPresent => "IfNotPresent",
        }
    }

    fn parse(value: &str) -> Option<Self> {
        match value {
            "Always" => Some(Self::Always),
            "Never" => Some(Self::Never),
            "IfNotPresent" => Some(Self::IfNotPresent),
            _ => None,
        }
    }
}

/// Cluster-wide flags that shape every launcher pod
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ClusterPolicy {
    /// Use software emulation; no KVM device is requested
    pub use_emulation: bool,
    /// Pull policy of the compute container
    pub image_pull_policy: PullPolicy,
}

impl ClusterPolicy {
    /// Read both flags from the config store
    pub fn resolve(store: &dyn ConfigStore) -> Result<Self, TemplateError> {
        let policy = Self {
            use_emulation: is_emulation_allowed(store)?,
            image_pull_policy: image_pull_policy(store)?,
        };
        debug!(
            use_emulation = policy.use_emulation,
            image_pull_policy = policy.image_pull_policy.as_str(),
            "resolved cluster policy"
        );
        Ok(policy)
    }
}

fn lookup(store: &dyn ConfigStore, key: &str) -> Result<Option<String>, TemplateError> {
    store
        .lookup(key)
        .map_err(|e| TemplateError::config_lookup(key, e.to_string()))
}

/// True when the config record sets emulation to "true" (any case)
pub fn is_emulation_allowed(store: &dyn ConfigStore) -> Result<bool, TemplateError> {
    Ok(lookup(store, USE_EMULATION_KEY)?.is_some_and(|v| v.eq_ignore_ascii_case("true")))
}

/// Pull policy from the config record, `IfNotPresent` when unset
pub fn image_pull_policy(store: &dyn ConfigStore) -> Result<PullPolicy, TemplateError> {
    match lookup(store, IMAGE_PULL_POLICY_KEY)? {
        None => Ok(PullPolicy::default()),
        Some(value) if value.is_empty() => Ok(PullPolicy::default()),
        Some(value) => PullPolicy::parse(&value).ok_or_else(|| {
            TemplateError::invalid_configuration(
                IMAGE_PULL_POLICY_KEY,
                &value,
                "expected Always, Never or IfNotPresent",
            )
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stores::{InMemoryConfigStore, MockConfigStore, StoreError};

    #[test]
    fn story_emulation_is_case_insensitive() {
        for value in ["true", "TRUE", "True"] {
            let store = InMemoryConfigStore::new().with(USE_EMULATION_KEY, value);
            assert!(is_emulation_allowed(&store).unwrap(), "value {value}");
        }
        for value in ["false", "yes", "1", ""] {
            let store = InMemoryConfigStore::new().with(USE_EMULATION_KEY, value);
            assert!(!is_emulation_allowed(&store).unwrap(), "value {value}");
        }
    }

    #[test]
    fn story_emulation_defaults_off() {
        assert!(!is_emulation_allowed(&InMemoryConfigStore::new()).unwrap());
    }

    #[test]
    fn story_pull_policy_defaults_to_if_not_present() {
        let store = InMemoryConfigStore::new();
        assert_eq!(image_pull_policy(&store).unwrap(), PullPolicy::IfNotPresent);

        let store = InMemoryConfigStore::new().with(IMAGE_PULL_POLICY_KEY, "");
        assert_eq!(image_pull_policy(&store).unwrap(), PullPolicy::IfNotPresent);
    }

    #[test]
    fn story_pull_policy_accepts_known_values() {
        for (value, expected) in [
            ("Always", PullPolicy::Always),
            ("Never", PullPolicy::Never),
            ("IfNotPresent", PullPolicy::IfNotPresent),
        ] {
            let store = InMemoryConfigStore::new().with(IMAGE_PULL_POLICY_KEY, value);
            assert_eq!(image_pull_policy(&store).unwrap(), expected);
        }
    }

    #[test]
    fn story_invalid_pull_policy_is_a_configuration_error() {
        let store = InMemoryConfigStore::new().with(IMAGE_PULL_POLICY_KEY, "always");
        let err = image_pull_policy(&store).unwrap_err();
        assert!(matches!(err, TemplateError::InvalidConfiguration { .. }));
    }

    #[test]
    fn story_store_failure_surfaces_as_config_lookup() {
        let mut store = MockConfigStore::new();
        store
            .expect_lookup()
            .returning(|_| Err(StoreError::new("cache not synced")));

        let err = ClusterPolicy::resolve(&store).unwrap_err();
        match err {
            TemplateError::ConfigLookup { key, message } => {
                assert_eq!(key, USE_EMULATION_KEY);
                assert!(message.contains("cache not synced"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn story_resolve_reads_both_keys() {
        let store = InMemoryConfigStore::new()
            .with(USE_EMULATION_KEY, "true")
            .with(IMAGE_PULL_POLICY_KEY, "Never");
        let policy = ClusterPolicy::resolve(&store).unwrap();
        assert!(policy.use_emulation);
        assert_eq!(policy.image_pull_policy, PullPolicy::Never);
    }

    #[test]
    fn story_config_validation() {
        assert!(TemplateConfig::new("registry/virt-launcher:v1").validate().is_ok());
        assert!(TemplateConfig::new("  ").validate().is_err());
        assert!(TemplateConfig::new("img")
            .with_virt_share_dir("relative/dir")
            .validate()
            .is_err());
    }

    #[test]
    fn story_empty_pull_secret_is_dropped() {
        let config = TemplateConfig::new("img").with_image_pull_secret(Some(String::new()));
        assert_eq!(config.image_pull_secret, None);
        let config = TemplateConfig::new("img").with_image_pull_secret(Some("regcred".into()));
        assert_eq!(config.image_pull_secret.as_deref(), Some("regcred"));
    }
}
