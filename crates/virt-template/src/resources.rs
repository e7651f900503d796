//! Resource envelope builder
//!
//! Starts from the domain's declared requests and limits and applies an
//! ordered list of [`EnvelopeStep`]s:
//!
//! 1. `MemoryOverhead` or `HugePages` (exactly one, depending on memory backing)
//! 2. `DedicatedCpu` when guest vCPUs are pinned
//!
//! The overhead is computed once per render from the declared request, so
//! steps never see each other's memory arithmetic.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{
    EmptyDirVolumeSource, ResourceRequirements, Volume as PodVolume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use tracing::debug;
use virt_common::crd::VirtualMachineInstance;
use virt_common::quantity::{self, KIB, MIB};
use virt_common::{RESOURCE_CPU, RESOURCE_HUGEPAGES_PREFIX, RESOURCE_MEMORY};

use crate::error::TemplateError;

/// Fixed overhead of the hypervisor process and its shared libraries
const BASE_OVERHEAD: u64 = 64 * MIB;

/// Overhead per guest core
const PER_CORE_OVERHEAD: u64 = 8 * MIB;

/// Overhead of the static I/O thread
const IO_THREAD_OVERHEAD: u64 = 8 * MIB;

/// Overhead of the emulated video device
const GRAPHICS_OVERHEAD: u64 = 16 * MIB;

/// Name of the huge page volume
pub const HUGEPAGES_VOLUME: &str = "hugepages";

/// Where huge pages are mounted in the compute container
pub const HUGEPAGES_MOUNT_PATH: &str = "/dev/hugepages";

/// Storage medium of the huge page volume
const HUGEPAGES_MEDIUM: &str = "HugePages";

/// Estimated memory the virtualization stack needs on top of guest memory
///
/// ```text
/// floor(request KiB / 512) KiB   page tables
/// + 64Mi                         hypervisor process
/// + 8Mi * max(cores, 1)          per-core tables
/// + 8Mi                          I/O thread
/// + 16Mi                         video, unless graphics is disabled
/// ```
pub fn memory_overhead(vmi: &VirtualMachineInstance) -> Result<u64, TemplateError> {
    let request = declared_memory(vmi)?;
    let domain = &vmi.spec.domain;

    let pagetables = request / KIB / 512 * KIB;
    let cores = u64::from(vmi.cores().max(1));
    let graphics = if domain.devices.graphics_enabled() {
        GRAPHICS_OVERHEAD
    } else {
        0
    };

    [BASE_OVERHEAD, PER_CORE_OVERHEAD * cores, IO_THREAD_OVERHEAD, graphics]
        .into_iter()
        .try_fold(pagetables, u64::checked_add)
        .ok_or_else(|| TemplateError::invalid_resource(RESOURCE_MEMORY, "overhead overflows"))
}

/// Declared guest memory in bytes; absent counts as zero
fn declared_memory(vmi: &VirtualMachineInstance) -> Result<u64, TemplateError> {
    vmi.spec
        .domain
        .resources
        .memory_request()
        .map(parse_memory)
        .transpose()
        .map(Option::unwrap_or_default)
}

fn parse_memory(q: &Quantity) -> Result<u64, TemplateError> {
    quantity::parse_bytes(q)
        .map_err(|e| TemplateError::invalid_resource(RESOURCE_MEMORY, e.to_string()))
}

/// `bytes + overhead` as a quantity; fails rather than wrapping past `u64::MAX`
fn with_overhead(bytes: u64, overhead: u64) -> Result<Quantity, TemplateError> {
    bytes
        .checked_add(overhead)
        .map(quantity::format_bytes)
        .ok_or_else(|| {
            TemplateError::invalid_resource(
                RESOURCE_MEMORY,
                format!("{bytes} bytes plus {overhead} bytes of overhead overflows"),
            )
        })
}

/// Requests and limits of the compute container
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ResourceEnvelope {
    /// Resource requests
    pub requests: BTreeMap<String, Quantity>,
    /// Resource limits; `None` until something needs a limit
    pub limits: Option<BTreeMap<String, Quantity>>,
}

impl ResourceEnvelope {
    /// Verbatim copy of the domain's declared resources
    pub fn from_domain(vmi: &VirtualMachineInstance) -> Self {
        let resources = &vmi.spec.domain.resources;
        Self {
            requests: resources.requests.clone(),
            limits: resources.limits.clone(),
        }
    }

    /// A request by resource name
    pub fn request(&self, resource: &str) -> Option<&Quantity> {
        self.requests.get(resource)
    }

    /// A limit by resource name
    pub fn limit(&self, resource: &str) -> Option<&Quantity> {
        self.limits.as_ref().and_then(|l| l.get(resource))
    }

    /// Set a limit, creating the limits map if needed
    pub fn set_limit(&mut self, resource: impl Into<String>, value: Quantity) {
        self.limits
            .get_or_insert_with(BTreeMap::new)
            .insert(resource.into(), value);
    }

    /// Convert into container resource requirements
    pub fn into_requirements(self) -> ResourceRequirements {
        ResourceRequirements {
            requests: Some(self.requests).filter(|r| !r.is_empty()),
            limits: self.limits.filter(|l| !l.is_empty()),
            ..Default::default()
        }
    }
}

/// One named adjustment applied to the envelope
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EnvelopeStep {
    /// Add the overhead to the memory request and any declared memory limit
    MemoryOverhead,
    /// Move guest memory to the page-size resource; generic memory becomes the overhead
    HugePages,
    /// Make CPU and memory request equal their limits
    DedicatedCpu,
}

impl EnvelopeStep {
    /// Steps that apply to this VM, in order
    pub fn plan(vmi: &VirtualMachineInstance) -> Vec<Self> {
        let mut steps = Vec::with_capacity(2);
        if vmi.hugepage_size().is_some() {
            steps.push(Self::HugePages);
        } else {
            steps.push(Self::MemoryOverhead);
        }
        if vmi.is_cpu_dedicated() {
            steps.push(Self::DedicatedCpu);
        }
        steps
    }

    /// Step name, for logging
    pub fn name(&self) -> &'static str {
        match self {
            Self::MemoryOverhead => "memory-overhead",
            Self::HugePages => "huge-pages",
            Self::DedicatedCpu => "dedicated-cpu",
        }
    }

    /// Apply this step
    pub fn apply(
        &self,
        envelope: ResourceEnvelope,
        vmi: &VirtualMachineInstance,
        overhead: u64,
    ) -> Result<ResourceEnvelope, TemplateError> {
        match self {
            Self::MemoryOverhead => add_memory_overhead(envelope, vmi, overhead),
            Self::HugePages => Ok(substitute_hugepages(envelope, vmi, overhead)),
            Self::DedicatedCpu => Ok(pin_cpu(envelope, vmi)),
        }
    }
}

fn add_memory_overhead(
    mut envelope: ResourceEnvelope,
    vmi: &VirtualMachineInstance,
    overhead: u64,
) -> Result<ResourceEnvelope, TemplateError> {
    // Overcommit only affects the request; a declared limit always grows.
    if !vmi.spec.domain.resources.overcommit_guest_overhead {
        let request = declared_memory(vmi)?;
        envelope
            .requests
            .insert(RESOURCE_MEMORY.to_string(), with_overhead(request, overhead)?);
    }

    if let Some(limit) = envelope.limit(RESOURCE_MEMORY).cloned() {
        let limit = parse_memory(&limit)?;
        envelope.set_limit(RESOURCE_MEMORY, with_overhead(limit, overhead)?);
    }
    Ok(envelope)
}

fn substitute_hugepages(
    mut envelope: ResourceEnvelope,
    vmi: &VirtualMachineInstance,
    overhead: u64,
) -> ResourceEnvelope {
    let Some(page_size) = vmi.hugepage_size() else {
        return envelope;
    };
    let key = format!("{RESOURCE_HUGEPAGES_PREFIX}{page_size}");
    let guest = vmi
        .spec
        .domain
        .resources
        .memory_request()
        .cloned()
        .unwrap_or_else(|| Quantity("0".to_string()));
    let overhead = quantity::format_bytes(overhead);

    envelope.requests.insert(key.clone(), guest.clone());
    envelope.set_limit(key, guest);
    envelope
        .requests
        .insert(RESOURCE_MEMORY.to_string(), overhead.clone());
    envelope.set_limit(RESOURCE_MEMORY, overhead);
    envelope
}

fn pin_cpu(mut envelope: ResourceEnvelope, vmi: &VirtualMachineInstance) -> ResourceEnvelope {
    let cores = vmi.cores();
    if cores != 0 {
        let cpu = Quantity(cores.to_string());
        envelope.requests.insert(RESOURCE_CPU.to_string(), cpu.clone());
        envelope.set_limit(RESOURCE_CPU, cpu);
    } else if let Some(limit) = envelope.limit(RESOURCE_CPU).cloned() {
        envelope.requests.insert(RESOURCE_CPU.to_string(), limit);
    } else if let Some(request) = envelope.request(RESOURCE_CPU).cloned() {
        envelope.set_limit(RESOURCE_CPU, request);
    }

    match envelope.request(RESOURCE_MEMORY).cloned() {
        Some(memory) => envelope.set_limit(RESOURCE_MEMORY, memory),
        None => {
            let limits = envelope.limits.get_or_insert_with(BTreeMap::new);
            limits.remove(RESOURCE_MEMORY);
        }
    }
    envelope
}

/// Build the compute container's envelope
pub fn build_envelope(vmi: &VirtualMachineInstance) -> Result<ResourceEnvelope, TemplateError> {
    let overhead = memory_overhead(vmi)?;
    debug!(overhead = %quantity::format_bytes(overhead).0, "computed memory overhead");

    EnvelopeStep::plan(vmi)
        .into_iter()
        .try_fold(ResourceEnvelope::from_domain(vmi), |envelope, step| {
            debug!(step = step.name(), "applying resource step");
            step.apply(envelope, vmi, overhead)
        })
}

/// Empty-dir volume backed by huge pages
pub fn hugepages_volume() -> PodVolume {
    PodVolume {
        name: HUGEPAGES_VOLUME.to_string(),
        empty_dir: Some(EmptyDirVolumeSource {
            medium: Some(HUGEPAGES_MEDIUM.to_string()),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Mount of [`hugepages_volume`] in the compute container
pub fn hugepages_mount() -> VolumeMount {
    VolumeMount {
        name: HUGEPAGES_VOLUME.to_string(),
        mount_path: HUGEPAGES_MOUNT_PATH.to_string(),
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use virt_common::crd::{Cpu, Hugepages, Memory, VirtualMachineInstanceSpec};

    fn q(s: &str) -> Quantity {
        Quantity(s.to_string())
    }

    fn vm_with_memory(request: &str) -> VirtualMachineInstance {
        let mut spec = VirtualMachineInstanceSpec::default();
        spec.domain
            .resources
            .requests
            .insert(RESOURCE_MEMORY.to_string(), q(request));
        VirtualMachineInstance::new("testvm", "default", spec)
    }

    fn with_cores(
        mut vmi: VirtualMachineInstance,
        cores: u32,
        dedicated: bool,
    ) -> VirtualMachineInstance {
        vmi.spec.domain.cpu = Some(Cpu {
            cores,
            dedicated_cpu_placement: dedicated,
        });
        vmi
    }

    fn with_hugepages(mut vmi: VirtualMachineInstance, size: &str) -> VirtualMachineInstance {
        vmi.spec.domain.memory = Some(Memory {
            hugepages: Some(Hugepages {
                page_size: size.to_string(),
            }),
        });
        vmi
    }

    fn with_memory_limit(mut vmi: VirtualMachineInstance, limit: &str) -> VirtualMachineInstance {
        vmi.spec
            .domain
            .resources
            .limits
            .get_or_insert_with(BTreeMap::new)
            .insert(RESOURCE_MEMORY.to_string(), q(limit));
        vmi
    }

    // =========================================================================
    // Story: Overhead Formula
    // =========================================================================

    #[test]
    fn story_overhead_for_512mi_two_cores() {
        let vmi = with_cores(vm_with_memory("512Mi"), 2, false);
        assert_eq!(memory_overhead(&vmi).unwrap(), 105 * MIB);

        let envelope = build_envelope(&vmi).unwrap();
        assert_eq!(envelope.request(RESOURCE_MEMORY), Some(&q("617Mi")));
        assert!(envelope.limits.is_none());
    }

    #[test]
    fn story_unspecified_cores_count_as_one() {
        let vmi = vm_with_memory("512Mi");
        assert_eq!(memory_overhead(&vmi).unwrap(), 97 * MIB);
    }

    #[test]
    fn story_disabled_graphics_drops_video_overhead() {
        let mut vmi = vm_with_memory("512Mi");
        vmi.spec.domain.devices.autoattach_graphics_device = Some(false);
        assert_eq!(memory_overhead(&vmi).unwrap(), 81 * MIB);
    }

    #[test]
    fn story_missing_request_still_gets_overhead() {
        let vmi = VirtualMachineInstance::new("vm", "ns", Default::default());
        assert_eq!(memory_overhead(&vmi).unwrap(), 96 * MIB);

        let envelope = build_envelope(&vmi).unwrap();
        assert_eq!(envelope.request(RESOURCE_MEMORY), Some(&q("96Mi")));
    }

    #[test]
    fn story_unparseable_memory_is_invalid_resource() {
        let vmi = vm_with_memory("lots");
        let err = build_envelope(&vmi).unwrap_err();
        assert!(matches!(err, TemplateError::InvalidResource { .. }));
    }

    #[test]
    fn story_request_near_byte_ceiling_is_invalid_resource() {
        // Parses, but the request plus overhead does not fit in u64
        let vmi = vm_with_memory("18446000000000000000");
        let err = build_envelope(&vmi).unwrap_err();
        assert!(matches!(err, TemplateError::InvalidResource { .. }));
        assert!(err.to_string().contains("overflows"));
    }

    #[test]
    fn story_limit_near_byte_ceiling_is_invalid_resource() {
        let vmi = with_memory_limit(vm_with_memory("1Gi"), "18446744073709551000");
        let err = build_envelope(&vmi).unwrap_err();
        assert!(matches!(err, TemplateError::InvalidResource { .. }));
    }

    #[test]
    fn story_overcommit_skips_request_but_still_checks_limit() {
        let mut vmi = with_memory_limit(vm_with_memory("1Gi"), "18446744073709551000");
        vmi.spec.domain.resources.overcommit_guest_overhead = true;
        assert!(build_envelope(&vmi).is_err());
    }

    // =========================================================================
    // Story: Memory Overhead Step
    // =========================================================================

    #[test]
    fn story_declared_limit_grows_by_overhead() {
        let vmi = with_memory_limit(with_cores(vm_with_memory("512Mi"), 2, false), "1Gi");
        let envelope = build_envelope(&vmi).unwrap();

        assert_eq!(envelope.request(RESOURCE_MEMORY), Some(&q("617Mi")));
        assert_eq!(envelope.limit(RESOURCE_MEMORY), Some(&q("1129Mi")));
    }

    #[test]
    fn story_overcommit_suppresses_request_but_not_limit() {
        let mut vmi = with_memory_limit(with_cores(vm_with_memory("512Mi"), 2, false), "1Gi");
        vmi.spec.domain.resources.overcommit_guest_overhead = true;
        let envelope = build_envelope(&vmi).unwrap();

        assert_eq!(envelope.request(RESOURCE_MEMORY), Some(&q("512Mi")));
        assert_eq!(envelope.limit(RESOURCE_MEMORY), Some(&q("1129Mi")));
    }

    #[test]
    fn story_limit_without_memory_is_left_alone() {
        let mut vmi = vm_with_memory("512Mi");
        vmi.spec.domain.resources.limits =
            Some(BTreeMap::from([(RESOURCE_CPU.to_string(), q("2"))]));
        let envelope = build_envelope(&vmi).unwrap();

        assert_eq!(envelope.limit(RESOURCE_MEMORY), None);
        assert_eq!(envelope.limit(RESOURCE_CPU), Some(&q("2")));
    }

    // =========================================================================
    // Story: Huge Pages Step
    // =========================================================================

    #[test]
    fn story_hugepages_move_guest_memory_to_page_resource() {
        let vmi = with_hugepages(vm_with_memory("1Gi"), "2Mi");
        let overhead = quantity::format_bytes(memory_overhead(&vmi).unwrap());
        let envelope = build_envelope(&vmi).unwrap();

        assert_eq!(envelope.request("hugepages-2Mi"), Some(&q("1Gi")));
        assert_eq!(envelope.limit("hugepages-2Mi"), Some(&q("1Gi")));
        assert_eq!(envelope.request(RESOURCE_MEMORY), Some(&overhead));
        assert_eq!(envelope.limit(RESOURCE_MEMORY), Some(&overhead));
    }

    #[test]
    fn story_hugepages_override_declared_memory_limit() {
        let vmi = with_memory_limit(with_hugepages(vm_with_memory("1Gi"), "1Gi"), "2Gi");
        let envelope = build_envelope(&vmi).unwrap();

        assert_eq!(envelope.limit("hugepages-1Gi"), Some(&q("1Gi")));
        assert_eq!(envelope.limit(RESOURCE_MEMORY), Some(&q("98Mi")));
    }

    #[test]
    fn story_hugepages_plan_skips_overhead_step() {
        let vmi = with_hugepages(vm_with_memory("1Gi"), "2Mi");
        assert_eq!(EnvelopeStep::plan(&vmi), vec![EnvelopeStep::HugePages]);
    }

    #[test]
    fn story_hugepages_volume_uses_hugepage_medium() {
        let volume = hugepages_volume();
        assert_eq!(
            volume.empty_dir.unwrap().medium.as_deref(),
            Some("HugePages")
        );
        assert_eq!(hugepages_mount().mount_path, "/dev/hugepages");
    }

    // =========================================================================
    // Story: Dedicated CPU Step
    // =========================================================================

    #[test]
    fn story_dedicated_cores_set_request_and_limit() {
        let vmi = with_cores(vm_with_memory("1Gi"), 4, true);
        let envelope = build_envelope(&vmi).unwrap();

        assert_eq!(envelope.request(RESOURCE_CPU), Some(&q("4")));
        assert_eq!(envelope.limit(RESOURCE_CPU), Some(&q("4")));
        assert_eq!(
            envelope.limit(RESOURCE_MEMORY),
            envelope.request(RESOURCE_MEMORY)
        );
    }

    #[test]
    fn story_dedicated_without_cores_copies_limit_to_request() {
        let mut vmi = with_cores(vm_with_memory("1Gi"), 0, true);
        vmi.spec.domain.resources.requests.insert(RESOURCE_CPU.to_string(), q("1"));
        vmi.spec.domain.resources.limits =
            Some(BTreeMap::from([(RESOURCE_CPU.to_string(), q("3"))]));
        let envelope = build_envelope(&vmi).unwrap();

        assert_eq!(envelope.request(RESOURCE_CPU), Some(&q("3")));
        assert_eq!(envelope.limit(RESOURCE_CPU), Some(&q("3")));
    }

    #[test]
    fn story_dedicated_without_cores_copies_request_to_limit() {
        let mut vmi = with_cores(vm_with_memory("1Gi"), 0, true);
        vmi.spec.domain.resources.requests.insert(RESOURCE_CPU.to_string(), q("2"));
        let envelope = build_envelope(&vmi).unwrap();

        assert_eq!(envelope.limit(RESOURCE_CPU), Some(&q("2")));
        assert_eq!(
            envelope.limit(RESOURCE_MEMORY),
            envelope.request(RESOURCE_MEMORY)
        );
    }

    #[test]
    fn story_dedicated_memory_limit_tracks_overcommitted_request() {
        let mut vmi = with_memory_limit(with_cores(vm_with_memory("1Gi"), 2, true), "2Gi");
        vmi.spec.domain.resources.overcommit_guest_overhead = true;
        let envelope = build_envelope(&vmi).unwrap();

        assert_eq!(envelope.request(RESOURCE_MEMORY), Some(&q("1Gi")));
        assert_eq!(envelope.limit(RESOURCE_MEMORY), Some(&q("1Gi")));
    }

    #[test]
    fn story_steps_can_be_applied_individually() {
        let vmi = with_cores(vm_with_memory("1Gi"), 2, true);
        let base = ResourceEnvelope::from_domain(&vmi);

        let pinned = EnvelopeStep::DedicatedCpu.apply(base.clone(), &vmi, 0).unwrap();
        assert_eq!(pinned.limit(RESOURCE_MEMORY), Some(&q("1Gi")));
        assert_eq!(pinned.request(RESOURCE_CPU), Some(&q("2")));

        let grown = EnvelopeStep::MemoryOverhead.apply(base, &vmi, MIB).unwrap();
        assert_eq!(grown.request(RESOURCE_MEMORY), Some(&q("1025Mi")));
    }

    #[test]
    fn story_empty_envelope_renders_no_maps() {
        let requirements = ResourceEnvelope::default().into_requirements();
        assert!(requirements.requests.is_none());
        assert!(requirements.limits.is_none());
    }
}
