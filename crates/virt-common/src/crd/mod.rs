//! VirtualMachineInstance data model
//!
//! The declarative VM model consumed by the launch-manifest
//! compiler. Field names serialize in camelCase to match the wire format.

mod domain;
mod network;
mod vmi;
mod volume;

pub use domain::{Cpu, Devices, DomainResources, DomainSpec, Hugepages, Interface, Memory, Port};
pub use network::{MultusNetwork, Network, PodNetwork};
pub use vmi::{VirtualMachineInstance, VirtualMachineInstanceSpec};
pub use volume::{
    ConfigMapSource, DataVolumeSource, EphemeralSource, HostDisk, HostDiskType, RegistryDisk,
    SecretSource, Volume, VolumeSource,
};

/// Interface model that is served by the in-kernel vhost-net backend
pub const VIRTIO_MODEL: &str = "virtio";
