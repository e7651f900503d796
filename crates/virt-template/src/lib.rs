//! Launch manifest compilation for virtual machines
//!
//! Translates a `VirtualMachineInstance` into the `Pod` that runs it: volume
//! mounts and block devices, the resource envelope with virtualization
//! overhead, capabilities, device-plugin resources, ports, annotations and
//! hook sidecars.
//!
//! Lookups against cluster state go through the traits in [`stores`], so the
//! compiler itself is synchronous and side-effect free.

#![deny(missing_docs)]

pub mod compiler;
pub mod config;
pub mod devices;
pub mod error;
pub mod network;
pub mod resources;
pub mod sidecars;
pub mod stores;
pub mod volumes;

pub use compiler::TemplateService;
pub use config::{ClusterPolicy, PullPolicy, TemplateConfig};
pub use error::TemplateError;
pub use resources::{memory_overhead, EnvelopeStep, ResourceEnvelope};
pub use stores::{
    AnnotationHookSidecars, ClaimInfo, ClaimStore, ConfigStore, DiskStager, DnsHostname,
    HookSidecar, HookSidecarSource, HostnameSanitizer, InMemoryClaimStore, InMemoryConfigStore,
    NoDiskStaging, ReflectorClaimStore, ReflectorConfigStore, StoreError,
};
pub use volumes::{ClassifiedVolumes, VolumeClassifier};
