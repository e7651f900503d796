//! Hook sidecar injection
//!
//! Each requested hook sidecar becomes one container sharing the
//! `hook-sidecar-sockets` directory with the compute container.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{
    Container, EmptyDirVolumeSource, ResourceRequirements, Volume as PodVolume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use virt_common::{HOOK_SOCKETS_SHARED_DIR, RESOURCE_CPU, RESOURCE_MEMORY};

use crate::stores::HookSidecar;

/// Name of the shared socket volume
pub const HOOK_SOCKETS_VOLUME: &str = "hook-sidecar-sockets";

/// CPU limit of each sidecar when the pod must stay in the guaranteed tier
const SIDECAR_CPU_LIMIT: &str = "200m";

/// Memory limit of each sidecar when the pod must stay in the guaranteed tier
const SIDECAR_MEMORY_LIMIT: &str = "64M";

/// Mount of the shared socket directory
pub fn hook_sockets_mount() -> VolumeMount {
    VolumeMount {
        name: HOOK_SOCKETS_VOLUME.to_string(),
        mount_path: HOOK_SOCKETS_SHARED_DIR.to_string(),
        ..Default::default()
    }
}

/// Empty-dir volume holding the hook sockets
pub fn hook_sockets_volume() -> PodVolume {
    PodVolume {
        name: HOOK_SOCKETS_VOLUME.to_string(),
        empty_dir: Some(EmptyDirVolumeSource::default()),
        ..Default::default()
    }
}

/// One container per requested sidecar, named `hook-sidecar-<index>`
pub fn sidecar_containers(sidecars: &[HookSidecar], cpu_dedicated: bool) -> Vec<Container> {
    sidecars
        .iter()
        .enumerate()
        .map(|(i, sidecar)| Container {
            name: format!("hook-sidecar-{i}"),
            image: Some(sidecar.image.clone()),
            image_pull_policy: sidecar.image_pull_policy.clone(),
            resources: cpu_dedicated.then(dedicated_limits),
            volume_mounts: Some(vec![hook_sockets_mount()]),
            ..Default::default()
        })
        .collect()
}

fn dedicated_limits() -> ResourceRequirements {
    ResourceRequirements {
        limits: Some(BTreeMap::from([
            (
                RESOURCE_CPU.to_string(),
                Quantity(SIDECAR_CPU_LIMIT.to_string()),
            ),
            (
                RESOURCE_MEMORY.to_string(),
                Quantity(SIDECAR_MEMORY_LIMIT.to_string()),
            ),
        ])),
        ..Default::default()
    }
}
