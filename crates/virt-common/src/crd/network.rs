//! Networks the guest interfaces are connected to.

use serde::{Deserialize, Serialize};

/// A network the VM is attached to
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Network {
    /// Network name, referenced by an interface
    pub name: String,

    /// The default pod network
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pod: Option<PodNetwork>,

    /// A secondary network provided by a multi-network attachment
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub multus: Option<MultusNetwork>,
}

/// Marker for the pod network
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PodNetwork {
    /// Optional CIDR for the VM network
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vm_network_cidr: Option<String>,
}

/// Reference to a network attachment definition
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MultusNetwork {
    /// Name of the network attachment definition
    pub network_name: String,
}
