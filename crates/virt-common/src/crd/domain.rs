//! Domain (virtual hardware) definition: resources, CPU, memory, devices.

use std::collections::BTreeMap;

use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use serde::{Deserialize, Serialize};

use super::VIRTIO_MODEL;
use crate::RESOURCE_MEMORY;

/// Virtual hardware of the guest
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DomainSpec {
    /// Resource requests and limits for the guest
    #[serde(default)]
    pub resources: DomainResources,

    /// CPU topology and placement
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu: Option<Cpu>,

    /// Memory backing
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory: Option<Memory>,

    /// Attached devices
    #[serde(default)]
    pub devices: Devices,
}

/// Requests and limits declared for the guest
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DomainResources {
    /// Resource requests keyed by resource name (`memory`, `cpu`, ...)
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub requests: BTreeMap<String, Quantity>,

    /// Resource limits; `None` when the user declared no limits at all
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limits: Option<BTreeMap<String, Quantity>>,

    /// Don't add the virtualization overhead to the memory request
    ///
    /// The limit still carries the overhead when one is declared.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub overcommit_guest_overhead: bool,
}

impl DomainResources {
    /// The declared guest memory request, if any
    pub fn memory_request(&self) -> Option<&Quantity> {
        self.requests.get(RESOURCE_MEMORY)
    }
}

/// CPU topology and placement
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Cpu {
    /// Number of guest cores (0 = unspecified)
    #[serde(default)]
    pub cores: u32,

    /// Pin guest vCPUs to dedicated host cores
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub dedicated_cpu_placement: bool,
}

/// Memory backing options
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Memory {
    /// Back guest memory with huge pages
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hugepages: Option<Hugepages>,
}

/// Huge page backing
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Hugepages {
    /// Page size, e.g. `2Mi` or `1Gi`
    pub page_size: String,
}

/// Devices attached to the guest
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Devices {
    /// Network interfaces
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub interfaces: Vec<Interface>,

    /// Attach the pod network interface (default: true)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub autoattach_pod_interface: Option<bool>,

    /// Attach a graphics device (default: true)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub autoattach_graphics_device: Option<bool>,
}

impl Devices {
    /// True unless the pod interface was explicitly disabled
    pub fn pod_interface_enabled(&self) -> bool {
        self.autoattach_pod_interface.unwrap_or(true)
    }

    /// True unless the graphics device was explicitly disabled
    pub fn graphics_enabled(&self) -> bool {
        self.autoattach_graphics_device.unwrap_or(true)
    }
}

/// A guest network interface
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Interface {
    /// Interface name, matching a network name
    pub name: String,

    /// NIC model (`virtio`, `e1000`, ...); empty means the default model
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,

    /// Ports forwarded to the guest on this interface
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ports: Vec<Port>,
}

impl Interface {
    /// True for the default model and explicit `virtio`
    pub fn is_virtio(&self) -> bool {
        match self.model.as_deref() {
            None | Some("") => true,
            Some(model) => model == VIRTIO_MODEL,
        }
    }
}

/// A port exposed on an interface
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Port {
    /// Optional port name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// Protocol (`TCP` when omitted)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub protocol: Option<String>,

    /// Port number
    pub port: i32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unset_autoattach_flags_default_to_enabled() {
        let devices = Devices::default();
        assert!(devices.pod_interface_enabled());
        assert!(devices.graphics_enabled());

        let devices = Devices {
            autoattach_pod_interface: Some(false),
            autoattach_graphics_device: Some(false),
            ..Default::default()
        };
        assert!(!devices.pod_interface_enabled());
        assert!(!devices.graphics_enabled());
    }

    #[test]
    fn default_and_virtio_models_are_virtio() {
        let mut iface = Interface::default();
        assert!(iface.is_virtio());
        iface.model = Some(String::new());
        assert!(iface.is_virtio());
        iface.model = Some("virtio".to_string());
        assert!(iface.is_virtio());
        iface.model = Some("e1000".to_string());
        assert!(!iface.is_virtio());
    }

    #[test]
    fn limits_stay_absent_when_not_declared() {
        let resources: DomainResources =
            serde_json::from_str(r#"{"requests": {"memory": "64Mi"}}"#).unwrap();
        assert!(resources.limits.is_none());
        assert_eq!(resources.memory_request().unwrap().0, "64Mi");
        assert!(!resources.overcommit_guest_overhead);
    }
}
