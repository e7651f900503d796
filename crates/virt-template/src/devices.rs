//! Capability and device-plugin resolution
//!
//! Derives the Linux capabilities the compute container needs and the
//! device-plugin resources it must request.

use std::collections::BTreeMap;

use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use virt_common::crd::VirtualMachineInstance;
use virt_common::{KVM_DEVICE, TUN_DEVICE, VHOST_NET_DEVICE};

use crate::config::ClusterPolicy;

/// Capability needed to configure the pod network inside the launcher
pub const CAP_NET_ADMIN: &str = "NET_ADMIN";

/// Capability needed to set CPU affinity of pinned vCPUs
pub const CAP_SYS_NICE: &str = "SYS_NICE";

/// Capabilities added to the compute container
///
/// `NET_ADMIN` is dropped only when the pod interface is explicitly disabled
/// and no interfaces are declared.
pub fn capabilities(vmi: &VirtualMachineInstance) -> Vec<String> {
    let devices = &vmi.spec.domain.devices;
    let mut caps = Vec::new();

    let no_network =
        devices.autoattach_pod_interface == Some(false) && devices.interfaces.is_empty();
    if !no_network {
        caps.push(CAP_NET_ADMIN.to_string());
    }
    if vmi.is_cpu_dedicated() {
        caps.push(CAP_SYS_NICE.to_string());
    }
    caps
}

/// Device-plugin resources, each with quantity 1
pub fn device_resources(
    vmi: &VirtualMachineInstance,
    policy: &ClusterPolicy,
) -> BTreeMap<String, Quantity> {
    let devices = &vmi.spec.domain.devices;
    let mut resources = BTreeMap::new();
    let one = || Quantity("1".to_string());

    if devices.pod_interface_enabled() {
        resources.insert(TUN_DEVICE.to_string(), one());
    }

    if !policy.use_emulation {
        if devices.interfaces.iter().any(|iface| iface.is_virtio()) {
            resources.insert(VHOST_NET_DEVICE.to_string(), one());
        }
        resources.insert(KVM_DEVICE.to_string(), one());
    }
    resources
}
