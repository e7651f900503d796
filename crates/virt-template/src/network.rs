//! Container ports and the multi-network annotation

use k8s_openapi::api::core::v1::ContainerPort;
use virt_common::crd::VirtualMachineInstance;

/// Protocol used when a port declares none
pub const DEFAULT_PROTOCOL: &str = "TCP";

/// Ports of every interface, or `None` when no port is declared
pub fn container_ports(vmi: &VirtualMachineInstance) -> Option<Vec<ContainerPort>> {
    let ports: Vec<ContainerPort> = vmi
        .spec
        .domain
        .devices
        .interfaces
        .iter()
        .flat_map(|iface| iface.ports.iter())
        .map(|port| ContainerPort {
            name: port.name.clone(),
            container_port: port.port,
            protocol: Some(
                port.protocol
                    .clone()
                    .filter(|p| !p.is_empty())
                    .unwrap_or_else(|| DEFAULT_PROTOCOL.to_string()),
            ),
            ..Default::default()
        })
        .collect();

    (!ports.is_empty()).then_some(ports)
}

/// Comma-joined attachment names of multus networks, `None` when there are none
pub fn multus_networks(vmi: &VirtualMachineInstance) -> Option<String> {
    let names: Vec<&str> = vmi
        .spec
        .networks
        .iter()
        .filter_map(|n| n.multus.as_ref())
        .map(|m| m.network_name.as_str())
        .collect();

    (!names.is_empty()).then(|| names.join(","))
}
