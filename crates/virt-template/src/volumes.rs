//! Volume classifier
//!
//! Turns each declared VM volume into the pod-side pieces it needs: a block
//! device or a filesystem mount for the compute container, a pod volume
//! source, and possibly an image pull secret. Each source kind has its own
//! pure function returning a [`VolumeDelta`]; deltas are folded into a
//! [`ClassifiedVolumes`] accumulator in declaration order.

use std::path::Path;

use k8s_openapi::api::core::v1::{
    ConfigMapVolumeSource, HostPathVolumeSource, LocalObjectReference,
    PersistentVolumeClaimVolumeSource, SecretVolumeSource, Volume as PodVolume, VolumeDevice,
    VolumeMount,
};
use tracing::{debug, error};
use virt_common::crd::{
    ConfigMapSource, DataVolumeSource, EphemeralSource, HostDisk, HostDiskType, RegistryDisk,
    SecretSource, Volume, VolumeSource,
};
use virt_common::{CONFIG_MAP_SOURCE_DIR, PRIVATE_DIR, SECRET_SOURCE_DIR};

use crate::error::TemplateError;
use crate::stores::ClaimStore;

/// Host path type for a directory that must exist
const HOST_PATH_DIRECTORY: &str = "Directory";

/// Host path type for a directory created on demand
const HOST_PATH_DIRECTORY_OR_CREATE: &str = "DirectoryOrCreate";

/// What a single volume contributes to the pod
#[derive(Clone, Debug, Default, PartialEq)]
pub struct VolumeDelta {
    /// Filesystem mount in the compute container
    pub mount: Option<VolumeMount>,
    /// Raw block device in the compute container
    pub device: Option<VolumeDevice>,
    /// Pod volume source
    pub volume: Option<PodVolume>,
    /// Image pull secret needed by the pod
    pub pull_secret: Option<String>,
}

/// Accumulated output of the volume classifier
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ClassifiedVolumes {
    /// Filesystem mounts, in declaration order
    pub mounts: Vec<VolumeMount>,
    /// Pod volume sources, in declaration order
    pub volumes: Vec<PodVolume>,
    /// Block devices, in declaration order
    pub devices: Vec<VolumeDevice>,
    /// Image pull secrets, unique by name
    pub image_pull_secrets: Vec<LocalObjectReference>,
}

impl ClassifiedVolumes {
    /// Fold one volume's delta into the accumulator
    pub fn merge(mut self, delta: VolumeDelta) -> Self {
        self.mounts.extend(delta.mount);
        self.devices.extend(delta.device);
        self.volumes.extend(delta.volume);
        if let Some(secret) = delta.pull_secret {
            self.add_pull_secret(secret);
        }
        self
    }

    /// Add an image pull secret unless one with the same name is present
    pub fn add_pull_secret(&mut self, name: impl Into<String>) {
        let name = name.into();
        if !self.image_pull_secrets.iter().any(|s| s.name == name) {
            self.image_pull_secrets.push(LocalObjectReference { name });
        }
    }
}

/// Classifies VM volumes into pod volumes, mounts and devices
pub struct VolumeClassifier<'a> {
    namespace: &'a str,
    claims: &'a dyn ClaimStore,
}

impl<'a> VolumeClassifier<'a> {
    /// Create a classifier resolving claims in `namespace`
    pub fn new(namespace: &'a str, claims: &'a dyn ClaimStore) -> Self {
        Self { namespace, claims }
    }

    /// Classify every volume, stopping at the first error
    pub fn classify_all(&self, volumes: &[Volume]) -> Result<ClassifiedVolumes, TemplateError> {
        volumes
            .iter()
            .try_fold(ClassifiedVolumes::default(), |acc, volume| {
                Ok(acc.merge(self.classify(volume)?))
            })
    }

    /// Classify a single volume
    pub fn classify(&self, volume: &Volume) -> Result<VolumeDelta, TemplateError> {
        let name = volume.name.as_str();
        debug!(volume = %name, kind = volume.source.kind(), "classifying volume");

        let delta = match &volume.source {
            VolumeSource::PersistentVolumeClaim(claim) => self.claim(name, claim)?,
            VolumeSource::Ephemeral(ephemeral) => ephemeral_volume(name, ephemeral),
            VolumeSource::RegistryDisk(disk) => registry_disk(disk),
            VolumeSource::HostDisk(disk) => host_disk(name, disk),
            VolumeSource::DataVolume(dv) => data_volume(name, dv),
            VolumeSource::ConfigMap(cm) => config_map(name, cm),
            VolumeSource::Secret(secret) => secret_volume(name, secret),
        };
        Ok(delta)
    }

    /// Existing claim: a device when block-mode, a mount otherwise
    fn claim(
        &self,
        name: &str,
        source: &PersistentVolumeClaimVolumeSource,
    ) -> Result<VolumeDelta, TemplateError> {
        let claim_name = source.claim_name.as_str();
        let info = self
            .claims
            .find(self.namespace, claim_name)
            .map_err(|e| {
                error!(claim = %claim_name, error = %e, "error getting PVC");
                TemplateError::claim_lookup(self.namespace, claim_name, e.to_string())
            })?
            .ok_or_else(|| {
                error!(claim = %claim_name, "didn't find PVC");
                TemplateError::claim_not_found(self.namespace, claim_name)
            })?;

        let (mount, device) = if info.is_block {
            let device = VolumeDevice {
                name: name.to_string(),
                device_path: device_path(name),
            };
            (None, Some(device))
        } else {
            (Some(private_mount(name)), None)
        };

        Ok(VolumeDelta {
            mount,
            device,
            volume: Some(PodVolume {
                name: name.to_string(),
                persistent_volume_claim: Some(source.clone()),
                ..Default::default()
            }),
            pull_secret: None,
        })
    }
}

fn ephemeral_volume(name: &str, source: &EphemeralSource) -> VolumeDelta {
    VolumeDelta {
        mount: Some(private_mount(name)),
        volume: Some(PodVolume {
            name: name.to_string(),
            persistent_volume_claim: Some(source.persistent_volume_claim.clone()),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Registry disks are staged by the disk stager; only the pull secret matters here.
fn registry_disk(disk: &RegistryDisk) -> VolumeDelta {
    VolumeDelta {
        pull_secret: disk.image_pull_secret.clone().filter(|s| !s.is_empty()),
        ..Default::default()
    }
}

fn host_disk(name: &str, disk: &HostDisk) -> VolumeDelta {
    let dir = parent_dir(&disk.path);
    let path_type = match disk.type_ {
        HostDiskType::Disk => HOST_PATH_DIRECTORY,
        HostDiskType::DiskOrCreate => HOST_PATH_DIRECTORY_OR_CREATE,
    };

    VolumeDelta {
        mount: Some(VolumeMount {
            name: name.to_string(),
            mount_path: dir.clone(),
            ..Default::default()
        }),
        volume: Some(PodVolume {
            name: name.to_string(),
            host_path: Some(HostPathVolumeSource {
                path: dir,
                type_: Some(path_type.to_string()),
            }),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn data_volume(name: &str, dv: &DataVolumeSource) -> VolumeDelta {
    VolumeDelta {
        mount: Some(private_mount(name)),
        volume: Some(PodVolume {
            name: name.to_string(),
            persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
                claim_name: dv.name.clone(),
                ..Default::default()
            }),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn config_map(name: &str, cm: &ConfigMapSource) -> VolumeDelta {
    VolumeDelta {
        mount: Some(read_only_mount(name, CONFIG_MAP_SOURCE_DIR)),
        volume: Some(PodVolume {
            name: name.to_string(),
            config_map: Some(ConfigMapVolumeSource {
                name: cm.name.clone(),
                optional: cm.optional,
                ..Default::default()
            }),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn secret_volume(name: &str, secret: &SecretSource) -> VolumeDelta {
    VolumeDelta {
        mount: Some(read_only_mount(name, SECRET_SOURCE_DIR)),
        volume: Some(PodVolume {
            name: name.to_string(),
            secret: Some(SecretVolumeSource {
                secret_name: Some(secret.secret_name.clone()),
                optional: secret.optional,
                ..Default::default()
            }),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Device path of a block volume: `/dev/<name>`
pub fn device_path(name: &str) -> String {
    format!("/dev/{name}")
}

/// Private per-volume mount: `/var/run/kubevirt-private/vmi-disks/<name>`
fn private_mount(name: &str) -> VolumeMount {
    VolumeMount {
        name: name.to_string(),
        mount_path: format!("{PRIVATE_DIR}/vmi-disks/{name}"),
        ..Default::default()
    }
}

fn read_only_mount(name: &str, source_dir: &str) -> VolumeMount {
    VolumeMount {
        name: name.to_string(),
        mount_path: format!("{source_dir}/{name}"),
        read_only: Some(true),
        ..Default::default()
    }
}

/// Directory containing `path`; `.` for a bare file name
fn parent_dir(path: &str) -> String {
    match Path::new(path).parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_string_lossy().into_owned(),
        Some(_) => ".".to_string(),
        None => path.to_string(),
    }
}
