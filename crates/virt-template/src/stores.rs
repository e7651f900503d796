//! Collaborator seams: cluster config, claims, disk staging, hostnames and
//! hook sidecar declarations.
//!
//! Every lookup is a synchronous read against a local cache. Production
//! implementations wrap `kube` reflector stores kept warm by the controller;
//! the in-memory implementations back the CLI and tests.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{ConfigMap, Container, PersistentVolumeClaim};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::runtime::reflector::{ObjectRef, Store};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use virt_common::crd::VirtualMachineInstance;
use virt_common::HOOK_SIDECARS_ANNOTATION;

/// Namespace of the cluster-wide configuration record
pub const CONFIG_MAP_NAMESPACE: &str = "kube-system";

/// Name of the cluster-wide configuration record
pub const CONFIG_MAP_NAME: &str = "kubevirt-config";

/// Claim volume mode that exposes a raw block device
const BLOCK_VOLUME_MODE: &str = "Block";

/// Longest valid DNS label
const MAX_HOSTNAME_LEN: usize = 63;

/// Failure reading from a backing store
#[derive(Debug, Error)]
#[error("{0}")]
pub struct StoreError(pub String);

impl StoreError {
    /// Create a store error from any message
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

// =============================================================================
// Traits
// =============================================================================

/// Read access to the cluster-wide configuration record
#[cfg_attr(test, mockall::automock)]
pub trait ConfigStore: Send + Sync {
    /// Value stored under `key`, `None` if the record or key is absent
    fn lookup(&self, key: &str) -> Result<Option<String>, StoreError>;
}

/// A claim found in the claim store
#[derive(Clone, Debug, PartialEq)]
pub struct ClaimInfo {
    /// The claim object
    pub claim: PersistentVolumeClaim,
    /// True when the claim exposes a raw block device
    pub is_block: bool,
}

impl ClaimInfo {
    /// Wrap a claim, deriving block mode from its spec
    pub fn from_claim(claim: PersistentVolumeClaim) -> Self {
        let is_block = claim
            .spec
            .as_ref()
            .and_then(|s| s.volume_mode.as_deref())
            == Some(BLOCK_VOLUME_MODE);
        Self { claim, is_block }
    }
}

/// Read access to persistent volume claims
#[cfg_attr(test, mockall::automock)]
pub trait ClaimStore: Send + Sync {
    /// Find a claim; `Ok(None)` when it doesn't exist
    fn find(&self, namespace: &str, name: &str) -> Result<Option<ClaimInfo>, StoreError>;
}

/// Produces the containers that stage registry disks into the pod
#[cfg_attr(test, mockall::automock)]
pub trait DiskStager: Send + Sync {
    /// Containers writing into volume `volume_name` mounted at `mount_dir`
    fn containers(
        &self,
        vmi: &VirtualMachineInstance,
        volume_name: &str,
        mount_dir: &str,
    ) -> Vec<Container>;
}

/// Derives a DNS-safe hostname for the pod
#[cfg_attr(test, mockall::automock)]
pub trait HostnameSanitizer: Send + Sync {
    /// Hostname for the pod, `None` to leave it unset
    fn hostname(&self, vmi: &VirtualMachineInstance) -> Option<String>;
}

/// A requested hook sidecar
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct HookSidecar {
    /// Sidecar image
    pub image: String,
    /// Pull policy for the image
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_pull_policy: Option<String>,
}

/// Reads hook sidecar declarations from VM metadata
#[cfg_attr(test, mockall::automock)]
pub trait HookSidecarSource: Send + Sync {
    /// Ordered sidecar declarations, or a parse error message
    fn sidecars(&self, metadata: &ObjectMeta) -> Result<Vec<HookSidecar>, String>;
}

// =============================================================================
// Reflector-backed stores
// =============================================================================

/// Config store reading one ConfigMap from a reflector cache
#[derive(Clone)]
pub struct ReflectorConfigStore {
    store: Store<ConfigMap>,
    record: ObjectRef<ConfigMap>,
}

impl ReflectorConfigStore {
    /// Read the default `kube-system/kubevirt-config` record
    pub fn new(store: Store<ConfigMap>) -> Self {
        Self::with_record(store, CONFIG_MAP_NAMESPACE, CONFIG_MAP_NAME)
    }

    /// Read a specific ConfigMap
    pub fn with_record(store: Store<ConfigMap>, namespace: &str, name: &str) -> Self {
        Self {
            store,
            record: ObjectRef::new(name).within(namespace),
        }
    }
}

impl ConfigStore for ReflectorConfigStore {
    fn lookup(&self, key: &str) -> Result<Option<String>, StoreError> {
        Ok(self
            .store
            .get(&self.record)
            .and_then(|cm| cm.data.as_ref().and_then(|data| data.get(key).cloned())))
    }
}

/// Claim store over a reflector cache of claims
#[derive(Clone)]
pub struct ReflectorClaimStore {
    store: Store<PersistentVolumeClaim>,
}

impl ReflectorClaimStore {
    /// Wrap a reflector store
    pub fn new(store: Store<PersistentVolumeClaim>) -> Self {
        Self { store }
    }
}

impl ClaimStore for ReflectorClaimStore {
    fn find(&self, namespace: &str, name: &str) -> Result<Option<ClaimInfo>, StoreError> {
        let key = ObjectRef::new(name).within(namespace);
        Ok(self
            .store
            .get(&key)
            .map(|claim| ClaimInfo::from_claim((*claim).clone())))
    }
}

// =============================================================================
// In-memory stores
// =============================================================================

/// Config store over a fixed key/value map
#[derive(Clone, Debug, Default)]
pub struct InMemoryConfigStore {
    data: BTreeMap<String, String>,
}

impl InMemoryConfigStore {
    /// Empty store: every key is absent
    pub fn new() -> Self {
        Self::default()
    }

    /// Store holding the data of a ConfigMap
    pub fn from_config_map(config_map: &ConfigMap) -> Self {
        Self {
            data: config_map.data.clone().unwrap_or_default(),
        }
    }

    /// Add a key
    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.data.insert(key.into(), value.into());
        self
    }
}

impl ConfigStore for InMemoryConfigStore {
    fn lookup(&self, key: &str) -> Result<Option<String>, StoreError> {
        Ok(self.data.get(key).cloned())
    }
}

/// Claim store over a fixed set of claims
#[derive(Clone, Debug, Default)]
pub struct InMemoryClaimStore {
    claims: BTreeMap<(String, String), PersistentVolumeClaim>,
}

impl InMemoryClaimStore {
    /// Empty store: every claim is missing
    pub fn new() -> Self {
        Self::default()
    }

    /// Store holding the given claims, keyed by their namespace and name
    pub fn from_claims(claims: impl IntoIterator<Item = PersistentVolumeClaim>) -> Self {
        let mut store = Self::new();
        for claim in claims {
            store.insert(claim);
        }
        store
    }

    /// Add a claim, replacing one with the same namespace and name
    pub fn insert(&mut self, claim: PersistentVolumeClaim) {
        let namespace = claim.metadata.namespace.clone().unwrap_or_default();
        let name = claim.metadata.name.clone().unwrap_or_default();
        self.claims.insert((namespace, name), claim);
    }
}

impl ClaimStore for InMemoryClaimStore {
    fn find(&self, namespace: &str, name: &str) -> Result<Option<ClaimInfo>, StoreError> {
        Ok(self
            .claims
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
            .map(ClaimInfo::from_claim))
    }
}

// =============================================================================
// Simple collaborators
// =============================================================================

/// Disk stager that stages nothing
#[derive(Clone, Copy, Debug, Default)]
pub struct NoDiskStaging;

impl DiskStager for NoDiskStaging {
    fn containers(&self, _: &VirtualMachineInstance, _: &str, _: &str) -> Vec<Container> {
        Vec::new()
    }
}

/// Hostname from `spec.hostname` or the VM name, reduced to a DNS label
#[derive(Clone, Copy, Debug, Default)]
pub struct DnsHostname;

impl HostnameSanitizer for DnsHostname {
    fn hostname(&self, vmi: &VirtualMachineInstance) -> Option<String> {
        let source = vmi
            .spec
            .hostname
            .as_deref()
            .filter(|h| !h.is_empty())
            .unwrap_or_else(|| vmi.name());

        let label: String = source
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() {
                    c.to_ascii_lowercase()
                } else {
                    '-'
                }
            })
            .collect();
        let label = label.trim_matches('-');
        let label = if label.len() > MAX_HOSTNAME_LEN {
            label[..MAX_HOSTNAME_LEN].trim_end_matches('-')
        } else {
            label
        };

        (!label.is_empty()).then(|| label.to_string())
    }
}

/// Hook sidecars declared as a JSON list in a VM annotation
#[derive(Clone, Copy, Debug, Default)]
pub struct AnnotationHookSidecars;

impl HookSidecarSource for AnnotationHookSidecars {
    fn sidecars(&self, metadata: &ObjectMeta) -> Result<Vec<HookSidecar>, String> {
        let Some(raw) = metadata
            .annotations
            .as_ref()
            .and_then(|a| a.get(HOOK_SIDECARS_ANNOTATION))
        else {
            return Ok(Vec::new());
        };
        serde_json::from_str(raw).map_err(|e| format!("{HOOK_SIDECARS_ANNOTATION}: {e}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::PersistentVolumeClaimSpec;
    use kube::runtime::reflector::store::Writer;
    use kube::runtime::watcher;
    use virt_common::crd::VirtualMachineInstanceSpec;

    fn claim(namespace: &str, name: &str, mode: Option<&str>) -> PersistentVolumeClaim {
        PersistentVolumeClaim {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some(namespace.to_string()),
                ..Default::default()
            },
            spec: Some(PersistentVolumeClaimSpec {
                volume_mode: mode.map(str::to_string),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn config_map(namespace: &str, name: &str, data: &[(&str, &str)]) -> ConfigMap {
        ConfigMap {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some(namespace.to_string()),
                ..Default::default()
            },
            data: Some(
                data.iter()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect(),
            ),
            ..Default::default()
        }
    }

    #[test]
    fn story_block_mode_follows_volume_mode() {
        assert!(ClaimInfo::from_claim(claim("ns", "a", Some("Block"))).is_block);
        assert!(!ClaimInfo::from_claim(claim("ns", "a", Some("Filesystem"))).is_block);
        assert!(!ClaimInfo::from_claim(claim("ns", "a", None)).is_block);
    }

    #[test]
    fn story_in_memory_claims_are_namespaced() {
        let store = InMemoryClaimStore::from_claims([claim("prod", "disk", Some("Block"))]);

        let found = store.find("prod", "disk").unwrap().expect("claim exists");
        assert!(found.is_block);
        assert!(store.find("dev", "disk").unwrap().is_none());
    }

    #[test]
    fn story_in_memory_config_reads_config_map_data() {
        let cm = config_map("kube-system", "kubevirt-config", &[("debug.useEmulation", "true")]);
        let store = InMemoryConfigStore::from_config_map(&cm);
        assert_eq!(
            store.lookup("debug.useEmulation").unwrap().as_deref(),
            Some("true")
        );
        assert!(store.lookup("dev.imagePullPolicy").unwrap().is_none());
    }

    #[test]
    fn story_reflector_config_store_reads_the_well_known_record() {
        let mut writer: Writer<ConfigMap> = Writer::default();
        writer.apply_watcher_event(&watcher::Event::Apply(config_map(
            CONFIG_MAP_NAMESPACE,
            CONFIG_MAP_NAME,
            &[("dev.imagePullPolicy", "Always")],
        )));
        writer.apply_watcher_event(&watcher::Event::Apply(config_map(
            "default",
            CONFIG_MAP_NAME,
            &[("dev.imagePullPolicy", "Never")],
        )));

        let store = ReflectorConfigStore::new(writer.as_reader());
        assert_eq!(
            store.lookup("dev.imagePullPolicy").unwrap().as_deref(),
            Some("Always")
        );
    }

    #[test]
    fn story_reflector_config_store_missing_record_is_absent() {
        let writer: Writer<ConfigMap> = Writer::default();
        let store = ReflectorConfigStore::new(writer.as_reader());
        assert!(store.lookup("debug.useEmulation").unwrap().is_none());
    }

    #[test]
    fn story_reflector_claim_store_finds_claims() {
        let mut writer: Writer<PersistentVolumeClaim> = Writer::default();
        writer.apply_watcher_event(&watcher::Event::Apply(claim("ns", "root", Some("Block"))));

        let store = ReflectorClaimStore::new(writer.as_reader());
        assert!(store.find("ns", "root").unwrap().unwrap().is_block);
        assert!(store.find("ns", "other").unwrap().is_none());
    }

    #[test]
    fn story_hostname_prefers_spec_hostname() {
        let mut spec = VirtualMachineInstanceSpec::default();
        spec.hostname = Some("My_Host".to_string());
        let vmi = VirtualMachineInstance::new("testvmi", "ns", spec);
        assert_eq!(DnsHostname.hostname(&vmi).as_deref(), Some("my-host"));
    }

    #[test]
    fn story_hostname_falls_back_to_name_and_truncates() {
        let long_name = format!("vm.{}", "a".repeat(80));
        let vmi = VirtualMachineInstance::new(long_name, "ns", VirtualMachineInstanceSpec::default());
        let hostname = DnsHostname.hostname(&vmi).unwrap();
        assert!(hostname.starts_with("vm-a"));
        assert_eq!(hostname.len(), MAX_HOSTNAME_LEN);

        let vmi = VirtualMachineInstance::new("...", "ns", VirtualMachineInstanceSpec::default());
        assert_eq!(DnsHostname.hostname(&vmi), None);
    }

    #[test]
    fn story_hook_sidecars_parse_from_annotation() {
        let mut metadata = ObjectMeta::default();
        assert!(AnnotationHookSidecars.sidecars(&metadata).unwrap().is_empty());

        metadata.annotations = Some(BTreeMap::from([(
            HOOK_SIDECARS_ANNOTATION.to_string(),
            r#"[{"image": "registry/hook:v1", "imagePullPolicy": "Always"}, {"image": "registry/other"}]"#
                .to_string(),
        )]));
        let sidecars = AnnotationHookSidecars.sidecars(&metadata).unwrap();
        assert_eq!(sidecars.len(), 2);
        assert_eq!(sidecars[0].image, "registry/hook:v1");
        assert_eq!(sidecars[0].image_pull_policy.as_deref(), Some("Always"));
        assert_eq!(sidecars[1].image_pull_policy, None);
    }

    #[test]
    fn story_malformed_hook_annotation_is_an_error() {
        let metadata = ObjectMeta {
            annotations: Some(BTreeMap::from([(
                HOOK_SIDECARS_ANNOTATION.to_string(),
                "{not a list".to_string(),
            )])),
            ..Default::default()
        };
        let err = AnnotationHookSidecars.sidecars(&metadata).unwrap_err();
        assert!(err.contains(HOOK_SIDECARS_ANNOTATION));
    }

    #[test]
    fn story_no_disk_staging_returns_nothing() {
        let vmi = VirtualMachineInstance::default();
        assert!(NoDiskStaging
            .containers(&vmi, "ephemeral-disks", "/var/run/kubevirt-ephemeral-disks")
            .is_empty());
    }
}
