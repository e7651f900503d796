//! TemplateService: compiles a VirtualMachineInstance into its launcher pod
//!
//! This is the single entry point of the crate. The pipeline runs strictly
//! in order, each stage reading the VM and producing its own piece:
//!
//! 1. Cluster policy (emulation, pull policy) from the config store
//! 2. Volume classification
//! 3. Resource envelope, plus device-plugin resources
//! 4. Capabilities
//! 5. Ports and the multi-network annotation
//! 6. Hook sidecars
//! 7. Assembly into a `Pod`
//!
//! ```rust,ignore
//! let service = TemplateService::new(config, config_store, claim_store)?
//!     .with_disk_stager(stager)
//!     .with_hook_sidecars(AnnotationHookSidecars);
//! let pod = service.render_launch_manifest(&vmi)?;
//! ```

use std::collections::BTreeMap;
use std::sync::Arc;

use k8s_openapi::api::core::v1::{
    Capabilities, Container, EmptyDirVolumeSource, ExecAction, HostPathVolumeSource, Pod,
    PodSecurityContext, PodSpec, Probe, SELinuxOptions, SecurityContext, Volume as PodVolume,
    VolumeMount,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use tracing::{debug, info, instrument};
use virt_common::crd::VirtualMachineInstance;
use virt_common::{
    APP_LABEL, APP_LABEL_LAUNCHER, CPU_MANAGER_LABEL, CREATED_BY_LABEL, DOMAIN_ANNOTATION,
    MULTUS_NETWORKS_ANNOTATION, NODE_SCHEDULABLE_LABEL, OWNED_BY_ANNOTATION, OWNED_BY_CONTROLLER,
};

use crate::config::{ClusterPolicy, TemplateConfig};
use crate::devices::{capabilities, device_resources};
use crate::error::TemplateError;
use crate::network::{container_ports, multus_networks};
use crate::resources::{build_envelope, hugepages_mount, hugepages_volume};
use crate::sidecars::{hook_sockets_mount, hook_sockets_volume, sidecar_containers};
use crate::stores::{
    AnnotationHookSidecars, ClaimStore, ConfigStore, DiskStager, DnsHostname, HookSidecar,
    HookSidecarSource, HostnameSanitizer, NoDiskStaging,
};
use crate::volumes::{ClassifiedVolumes, VolumeClassifier};

/// Name of the compute container
pub const COMPUTE_CONTAINER: &str = "compute";

/// Launcher binary inside the compute image
const LAUNCHER_BINARY: &str = "/usr/bin/virt-launcher";

/// Time the launcher waits for the hypervisor to start
const QEMU_TIMEOUT: &str = "5m";

/// File the launcher touches once the domain is ready
const READINESS_FILE: &str = "/tmp/healthy";

/// Runtime directory of the libvirt daemon
const LIBVIRT_RUNTIME_DIR: &str = "/var/run/libvirt";

/// Volume holding ephemeral disk overlays, shared with disk staging containers
pub const EPHEMERAL_DISKS_VOLUME: &str = "ephemeral-disks";

/// Volume shared with the node agent
pub const VIRT_SHARE_DIR_VOLUME: &str = "virt-share-dir";

/// Volume for the libvirt runtime directory
pub const LIBVIRT_RUNTIME_VOLUME: &str = "libvirt-runtime";

/// SELinux type that lets the launcher manage devices on the host
const SELINUX_TYPE: &str = "spc_t";

/// Pad for the launcher's own teardown before the pod is killed
const LAUNCHER_GRACE_PAD_SECONDS: i64 = 15;

/// Pad on top of the launcher's grace period before the kubelet force-kills
const KILL_GRACE_PAD_SECONDS: i64 = 15;

/// Renders launcher pods for VirtualMachineInstances
///
/// Holds no mutable state; one instance can serve concurrent renders.
pub struct TemplateService {
    config: TemplateConfig,
    config_store: Arc<dyn ConfigStore>,
    claims: Arc<dyn ClaimStore>,
    disk_stager: Arc<dyn DiskStager>,
    hostname: Arc<dyn HostnameSanitizer>,
    hooks: Arc<dyn HookSidecarSource>,
}

impl TemplateService {
    /// Create a service with the required stores
    ///
    /// Disk staging defaults to none, hostnames to [`DnsHostname`], and hook
    /// sidecars to [`AnnotationHookSidecars`].
    pub fn new(
        config: TemplateConfig,
        config_store: Arc<dyn ConfigStore>,
        claims: Arc<dyn ClaimStore>,
    ) -> Result<Self, TemplateError> {
        config.validate()?;
        Ok(Self {
            config,
            config_store,
            claims,
            disk_stager: Arc::new(NoDiskStaging),
            hostname: Arc::new(DnsHostname),
            hooks: Arc::new(AnnotationHookSidecars),
        })
    }

    /// Use a disk stager for registry disks
    pub fn with_disk_stager(mut self, stager: impl DiskStager + 'static) -> Self {
        self.disk_stager = Arc::new(stager);
        self
    }

    /// Use a hostname sanitizer
    pub fn with_hostname_sanitizer(mut self, sanitizer: impl HostnameSanitizer + 'static) -> Self {
        self.hostname = Arc::new(sanitizer);
        self
    }

    /// Use a hook sidecar source
    pub fn with_hook_sidecars(mut self, source: impl HookSidecarSource + 'static) -> Self {
        self.hooks = Arc::new(source);
        self
    }

    /// Service settings
    pub fn config(&self) -> &TemplateConfig {
        &self.config
    }

    /// Compile the VM into its launcher pod
    ///
    /// Nothing is returned on error; the pod is either complete or absent.
    #[instrument(
        skip(self, vmi),
        fields(vmi = %vmi.name(), namespace = %vmi.namespace())
    )]
    pub fn render_launch_manifest(
        &self,
        vmi: &VirtualMachineInstance,
    ) -> Result<Pod, TemplateError> {
        if vmi.name().is_empty() {
            return Err(TemplateError::missing_metadata("metadata.name"));
        }
        if vmi.namespace().is_empty() {
            return Err(TemplateError::missing_metadata("metadata.namespace"));
        }

        // 1. Cluster policy
        let policy = ClusterPolicy::resolve(self.config_store.as_ref())?;

        // 2. Volumes
        let mut classified = VolumeClassifier::new(vmi.namespace(), self.claims.as_ref())
            .classify_all(&vmi.spec.volumes)?;
        if let Some(secret) = &self.config.image_pull_secret {
            classified.add_pull_secret(secret.clone());
        }

        // 3. Resources and device plugins
        let mut envelope = build_envelope(vmi)?;
        for (device, quantity) in device_resources(vmi, &policy) {
            envelope.set_limit(device, quantity);
        }

        // 4-6. Capabilities, network surface, sidecars
        let caps = capabilities(vmi);
        let sidecars = self
            .hooks
            .sidecars(&vmi.metadata)
            .map_err(TemplateError::sidecar_parse)?;
        debug!(
            volumes = vmi.spec.volumes.len(),
            sidecars = sidecars.len(),
            capabilities = ?caps,
            "resolved launcher pieces"
        );

        // 7. Assembly
        let compute = Container {
            name: COMPUTE_CONTAINER.to_string(),
            image: Some(self.config.launcher_image.clone()),
            image_pull_policy: Some(policy.image_pull_policy.as_str().to_string()),
            command: Some(self.launcher_command(vmi, &policy, sidecars.len())),
            security_context: Some(SecurityContext {
                run_as_user: Some(0),
                privileged: Some(false),
                capabilities: Some(Capabilities {
                    add: Some(caps).filter(|c| !c.is_empty()),
                    ..Default::default()
                }),
                ..Default::default()
            }),
            volume_devices: Some(std::mem::take(&mut classified.devices))
                .filter(|d| !d.is_empty()),
            volume_mounts: Some(self.compute_mounts(vmi, &classified, &sidecars)),
            readiness_probe: Some(readiness_probe()),
            resources: Some(envelope.into_requirements()),
            ports: container_ports(vmi),
            ..Default::default()
        };

        let mut containers =
            self.disk_stager
                .containers(vmi, EPHEMERAL_DISKS_VOLUME, &self.config.ephemeral_disk_dir);
        containers.push(compute);
        containers.extend(sidecar_containers(&sidecars, vmi.is_cpu_dedicated()));

        let volumes = self.pod_volumes(vmi, &mut classified, &sidecars);
        let image_pull_secrets =
            Some(classified.image_pull_secrets).filter(|s| !s.is_empty());

        let pod = Pod {
            metadata: pod_metadata(vmi),
            spec: Some(PodSpec {
                hostname: self.hostname.hostname(vmi),
                subdomain: vmi.spec.subdomain.clone(),
                security_context: Some(PodSecurityContext {
                    run_as_user: Some(0),
                    se_linux_options: Some(SELinuxOptions {
                        type_: Some(SELINUX_TYPE.to_string()),
                        ..Default::default()
                    }),
                    ..Default::default()
                }),
                termination_grace_period_seconds: Some(
                    vmi.spec
                        .grace_period_seconds()
                        .saturating_add(LAUNCHER_GRACE_PAD_SECONDS)
                        .saturating_add(KILL_GRACE_PAD_SECONDS),
                ),
                restart_policy: Some("Never".to_string()),
                containers,
                node_selector: Some(node_selector(vmi)),
                volumes: Some(volumes),
                image_pull_secrets,
                affinity: vmi.spec.affinity.clone(),
                tolerations: vmi.spec.tolerations.clone(),
                ..Default::default()
            }),
            status: None,
        };

        info!(
            containers = pod.spec.as_ref().map_or(0, |s| s.containers.len()),
            "rendered launch manifest"
        );
        Ok(pod)
    }

    fn launcher_command(
        &self,
        vmi: &VirtualMachineInstance,
        policy: &ClusterPolicy,
        sidecar_count: usize,
    ) -> Vec<String> {
        let grace = vmi
            .spec
            .grace_period_seconds()
            .saturating_add(LAUNCHER_GRACE_PAD_SECONDS);
        let mut command: Vec<String> = [
            LAUNCHER_BINARY,
            "--qemu-timeout",
            QEMU_TIMEOUT,
            "--name",
            vmi.name(),
            "--uid",
            vmi.uid(),
            "--namespace",
            vmi.namespace(),
            "--kubevirt-share-dir",
            self.config.virt_share_dir.as_str(),
            "--ephemeral-disk-dir",
            self.config.ephemeral_disk_dir.as_str(),
            "--readiness-file",
            READINESS_FILE,
        ]
        .into_iter()
        .map(str::to_string)
        .collect();

        command.extend([
            "--grace-period-seconds".to_string(),
            grace.to_string(),
            "--hook-sidecars".to_string(),
            sidecar_count.to_string(),
        ]);
        if policy.use_emulation {
            command.push("--use-emulation".to_string());
        }
        command
    }

    fn compute_mounts(
        &self,
        vmi: &VirtualMachineInstance,
        classified: &ClassifiedVolumes,
        sidecars: &[HookSidecar],
    ) -> Vec<VolumeMount> {
        let mut mounts = vec![
            mount(EPHEMERAL_DISKS_VOLUME, &self.config.ephemeral_disk_dir),
            mount(VIRT_SHARE_DIR_VOLUME, &self.config.virt_share_dir),
            mount(LIBVIRT_RUNTIME_VOLUME, LIBVIRT_RUNTIME_DIR),
        ];
        mounts.extend(classified.mounts.iter().cloned());
        if vmi.hugepage_size().is_some() {
            mounts.push(hugepages_mount());
        }
        if !sidecars.is_empty() {
            mounts.push(hook_sockets_mount());
        }
        mounts
    }

    fn pod_volumes(
        &self,
        vmi: &VirtualMachineInstance,
        classified: &mut ClassifiedVolumes,
        sidecars: &[HookSidecar],
    ) -> Vec<PodVolume> {
        let mut volumes = std::mem::take(&mut classified.volumes);
        if vmi.hugepage_size().is_some() {
            volumes.push(hugepages_volume());
        }
        if !sidecars.is_empty() {
            volumes.push(hook_sockets_volume());
        }
        volumes.extend([
            PodVolume {
                name: VIRT_SHARE_DIR_VOLUME.to_string(),
                host_path: Some(HostPathVolumeSource {
                    path: self.config.virt_share_dir.clone(),
                    type_: None,
                }),
                ..Default::default()
            },
            empty_dir(LIBVIRT_RUNTIME_VOLUME),
            empty_dir(EPHEMERAL_DISKS_VOLUME),
        ]);
        volumes
    }
}

fn pod_metadata(vmi: &VirtualMachineInstance) -> ObjectMeta {
    let mut labels = vmi.metadata.labels.clone().unwrap_or_default();
    labels.insert(APP_LABEL.to_string(), APP_LABEL_LAUNCHER.to_string());
    labels.insert(CREATED_BY_LABEL.to_string(), vmi.uid().to_string());

    let mut annotations = BTreeMap::from([
        (DOMAIN_ANNOTATION.to_string(), vmi.name().to_string()),
        (
            OWNED_BY_ANNOTATION.to_string(),
            OWNED_BY_CONTROLLER.to_string(),
        ),
    ]);
    if let Some(networks) = multus_networks(vmi) {
        annotations.insert(MULTUS_NETWORKS_ANNOTATION.to_string(), networks);
    }

    ObjectMeta {
        generate_name: Some(format!("virt-launcher-{}-", vmi.name())),
        labels: Some(labels),
        annotations: Some(annotations),
        ..Default::default()
    }
}

fn node_selector(vmi: &VirtualMachineInstance) -> BTreeMap<String, String> {
    let mut selector = vmi.spec.node_selector.clone();
    if vmi.is_cpu_dedicated() {
        selector.insert(CPU_MANAGER_LABEL.to_string(), "true".to_string());
    }
    selector.insert(NODE_SCHEDULABLE_LABEL.to_string(), "true".to_string());
    selector
}

fn readiness_probe() -> Probe {
    Probe {
        exec: Some(ExecAction {
            command: Some(vec!["cat".to_string(), READINESS_FILE.to_string()]),
        }),
        initial_delay_seconds: Some(2),
        period_seconds: Some(2),
        timeout_seconds: Some(5),
        success_threshold: Some(1),
        failure_threshold: Some(5),
        ..Default::default()
    }
}

fn mount(name: &str, path: &str) -> VolumeMount {
    VolumeMount {
        name: name.to_string(),
        mount_path: path.to_string(),
        ..Default::default()
    }
}

fn empty_dir(name: &str) -> PodVolume {
    PodVolume {
        name: name.to_string(),
        empty_dir: Some(EmptyDirVolumeSource::default()),
        ..Default::default()
    }
}
