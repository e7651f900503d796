//! Common types for virt: the VirtualMachineInstance model, resource
//! quantities, errors, and logging setup.

#![deny(missing_docs)]

pub mod crd;
pub mod error;
pub mod quantity;
pub mod telemetry;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

// =============================================================================
// Pod Labels and Annotations
// =============================================================================

/// Label key identifying the application of a launcher pod
pub const APP_LABEL: &str = "kubevirt.io";

/// Value of [`APP_LABEL`] on every launcher pod
pub const APP_LABEL_LAUNCHER: &str = "virt-launcher";

/// Label carrying the UID of the VirtualMachineInstance that owns the pod
pub const CREATED_BY_LABEL: &str = "kubevirt.io/created-by";

/// Annotation carrying the domain (VM) name
pub const DOMAIN_ANNOTATION: &str = "kubevirt.io/domain";

/// Annotation naming the component that rendered the pod
pub const OWNED_BY_ANNOTATION: &str = "kubevirt.io/owned-by";

/// Value of [`OWNED_BY_ANNOTATION`]
pub const OWNED_BY_CONTROLLER: &str = "virt-controller";

/// Annotation listing secondary networks for the multi-network CNI plugin
pub const MULTUS_NETWORKS_ANNOTATION: &str = "k8s.v1.cni.cncf.io/networks";

/// Annotation holding the JSON list of requested hook sidecars
pub const HOOK_SIDECARS_ANNOTATION: &str = "hooks.kubevirt.io/hookSidecars";

// =============================================================================
// Node Selector Keys
// =============================================================================

/// Node label set on nodes that can run virtual machines
pub const NODE_SCHEDULABLE_LABEL: &str = "kubevirt.io/schedulable";

/// Node label set on nodes running the CPU manager with a static policy
pub const CPU_MANAGER_LABEL: &str = "cpumanager";

// =============================================================================
// Resource Names
// =============================================================================

/// Generic memory resource key
pub const RESOURCE_MEMORY: &str = "memory";

/// Generic CPU resource key
pub const RESOURCE_CPU: &str = "cpu";

/// Prefix of page-size specific huge page resource keys (e.g. `hugepages-2Mi`)
pub const RESOURCE_HUGEPAGES_PREFIX: &str = "hugepages-";

/// Device plugin resource for hardware virtualization
pub const KVM_DEVICE: &str = "devices.kubevirt.io/kvm";

/// Device plugin resource for TUN/TAP network devices
pub const TUN_DEVICE: &str = "devices.kubevirt.io/tun";

/// Device plugin resource for in-kernel virtio networking
pub const VHOST_NET_DEVICE: &str = "devices.kubevirt.io/vhost-net";

// =============================================================================
// Defaults
// =============================================================================

/// Termination grace period applied when the VM does not declare one
pub const DEFAULT_GRACE_PERIOD_SECONDS: i64 = 30;

/// Shared directory where hook sidecars expose their sockets
pub const HOOK_SOCKETS_SHARED_DIR: &str = "/var/run/kubevirt-hooks";

/// Root of per-VM private mounts inside the compute container
pub const PRIVATE_DIR: &str = "/var/run/kubevirt-private";

/// Directory under which config map volumes are mounted
pub const CONFIG_MAP_SOURCE_DIR: &str = "/var/run/kubevirt-private/config-map";

/// Directory under which secret volumes are mounted
pub const SECRET_SOURCE_DIR: &str = "/var/run/kubevirt-private/secret";
