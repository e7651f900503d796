//! Volumes backing guest disks.
//!
//! Each volume carries exactly one source. On the wire the source is a key
//! next to `name`:
//!
//! ```yaml
//! volumes:
//!   - name: rootdisk
//!     persistentVolumeClaim:
//!       claimName: fedora-root
//!   - name: cloudinit
//!     secret:
//!       secretName: userdata
//! ```

use k8s_openapi::api::core::v1::PersistentVolumeClaimVolumeSource;
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use serde::{Deserialize, Serialize};

/// A named volume
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Volume {
    /// Volume name, unique within the VM
    pub name: String,

    /// Where the volume's data comes from
    #[serde(flatten)]
    pub source: VolumeSource,
}

impl Volume {
    /// Create a named volume
    pub fn new(name: impl Into<String>, source: VolumeSource) -> Self {
        Self {
            name: name.into(),
            source,
        }
    }
}

/// The source of a volume
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub enum VolumeSource {
    /// An existing persistent volume claim
    PersistentVolumeClaim(PersistentVolumeClaimVolumeSource),
    /// A claim used as a read-only base with a throwaway overlay
    Ephemeral(EphemeralSource),
    /// A disk image pulled from a container registry
    RegistryDisk(RegistryDisk),
    /// A disk image file on the host
    HostDisk(HostDisk),
    /// A claim populated by a data volume of the same name
    DataVolume(DataVolumeSource),
    /// A config map exposed as a disk
    ConfigMap(ConfigMapSource),
    /// A secret exposed as a disk
    Secret(SecretSource),
}

impl VolumeSource {
    /// Short name of the source kind, for logging
    pub fn kind(&self) -> &'static str {
        match self {
            Self::PersistentVolumeClaim(_) => "persistentVolumeClaim",
            Self::Ephemeral(_) => "ephemeral",
            Self::RegistryDisk(_) => "registryDisk",
            Self::HostDisk(_) => "hostDisk",
            Self::DataVolume(_) => "dataVolume",
            Self::ConfigMap(_) => "configMap",
            Self::Secret(_) => "secret",
        }
    }
}

/// Ephemeral volume backed by a claim
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct EphemeralSource {
    /// The claim holding the base image
    pub persistent_volume_claim: PersistentVolumeClaimVolumeSource,
}

/// Disk image shipped in a container image
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RegistryDisk {
    /// Image reference
    pub image: String,

    /// Secret used to pull the image
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_pull_secret: Option<String>,
}

/// Disk image file on the host
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct HostDisk {
    /// Path of the disk image file
    pub path: String,

    /// Whether the image must already exist
    #[serde(rename = "type")]
    pub type_: HostDiskType,

    /// Size of the image when it is created
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub capacity: Option<Quantity>,
}

/// Existence policy of a host disk
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
pub enum HostDiskType {
    /// The disk image must exist
    #[default]
    Disk,
    /// The disk image is created when missing
    DiskOrCreate,
}

/// Reference to a data volume
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DataVolumeSource {
    /// Data volume name; its claim has the same name
    pub name: String,
}

/// Config map exposed as a disk
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ConfigMapSource {
    /// Config map name
    pub name: String,

    /// Don't fail when the config map is missing
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub optional: Option<bool>,
}

/// Secret exposed as a disk
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SecretSource {
    /// Secret name
    pub secret_name: String,

    /// Don't fail when the secret is missing
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub optional: Option<bool>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn source_is_a_sibling_key_of_name() {
        let yaml = r#"
name: rootdisk
persistentVolumeClaim:
  claimName: fedora-root
"#;
        let volume: Volume = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(volume.name, "rootdisk");
        match &volume.source {
            VolumeSource::PersistentVolumeClaim(pvc) => assert_eq!(pvc.claim_name, "fedora-root"),
            other => panic!("expected claim source, got {}", other.kind()),
        }
    }

    #[test]
    fn host_disk_type_uses_wire_names() {
        let yaml = r#"
name: scratch
hostDisk:
  path: /data/scratch.img
  type: DiskOrCreate
  capacity: 1Gi
"#;
        let volume: Volume = serde_yaml::from_str(yaml).unwrap();
        let VolumeSource::HostDisk(disk) = volume.source else {
            panic!("expected host disk");
        };
        assert_eq!(disk.type_, HostDiskType::DiskOrCreate);
        assert_eq!(disk.capacity, Some(Quantity("1Gi".to_string())));
    }

    #[test]
    fn volume_without_source_is_rejected() {
        let result: Result<Volume, _> = serde_yaml::from_str("name: nothing\n");
        assert!(result.is_err());
    }
}
