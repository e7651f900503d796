//! The VirtualMachineInstance object and its top-level spec.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{Affinity, Toleration};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use serde::{Deserialize, Serialize};

use super::{DomainSpec, Network, Volume};
use crate::DEFAULT_GRACE_PERIOD_SECONDS;

/// A running virtual machine as declared by the user
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct VirtualMachineInstance {
    /// API version
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_version: Option<String>,

    /// Kind
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,

    /// Name, namespace, UID, labels and annotations
    #[serde(default)]
    pub metadata: ObjectMeta,

    /// Desired VM configuration
    #[serde(default)]
    pub spec: VirtualMachineInstanceSpec,
}

impl VirtualMachineInstance {
    /// Create a VM with the given name and namespace
    pub fn new(
        name: impl Into<String>,
        namespace: impl Into<String>,
        spec: VirtualMachineInstanceSpec,
    ) -> Self {
        Self {
            api_version: None,
            kind: None,
            metadata: ObjectMeta {
                name: Some(name.into()),
                namespace: Some(namespace.into()),
                ..Default::default()
            },
            spec,
        }
    }

    /// VM name, empty when unset
    pub fn name(&self) -> &str {
        self.metadata.name.as_deref().unwrap_or_default()
    }

    /// VM namespace, empty when unset
    pub fn namespace(&self) -> &str {
        self.metadata.namespace.as_deref().unwrap_or_default()
    }

    /// VM UID, empty when unset
    pub fn uid(&self) -> &str {
        self.metadata.uid.as_deref().unwrap_or_default()
    }

    /// True when guest vCPUs must be pinned to dedicated host cores
    pub fn is_cpu_dedicated(&self) -> bool {
        self.spec
            .domain
            .cpu
            .as_ref()
            .is_some_and(|cpu| cpu.dedicated_cpu_placement)
    }

    /// Declared huge page size, if the guest is backed by huge pages
    pub fn hugepage_size(&self) -> Option<&str> {
        self.spec
            .domain
            .memory
            .as_ref()
            .and_then(|m| m.hugepages.as_ref())
            .map(|h| h.page_size.as_str())
    }

    /// Declared guest core count, 0 when unspecified
    pub fn cores(&self) -> u32 {
        self.spec.domain.cpu.as_ref().map_or(0, |cpu| cpu.cores)
    }
}

/// Top-level VM configuration
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct VirtualMachineInstanceSpec {
    /// Virtual hardware
    #[serde(default)]
    pub domain: DomainSpec,

    /// Volumes backing the guest disks
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub volumes: Vec<Volume>,

    /// Networks the interfaces connect to
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub networks: Vec<Network>,

    /// Node labels the VM must be scheduled on
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub node_selector: BTreeMap<String, String>,

    /// Scheduling affinity, passed through to the pod
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub affinity: Option<Affinity>,

    /// Tolerations, passed through to the pod
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tolerations: Option<Vec<Toleration>>,

    /// Seconds the guest gets to shut down gracefully
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub termination_grace_period_seconds: Option<i64>,

    /// Requested guest hostname
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,

    /// Subdomain for the pod's DNS name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subdomain: Option<String>,
}

impl VirtualMachineInstanceSpec {
    /// Declared grace period, or the default when none is set
    pub fn grace_period_seconds(&self) -> i64 {
        self.termination_grace_period_seconds
            .unwrap_or(DEFAULT_GRACE_PERIOD_SECONDS)
    }
}
