//! virt - render virt-launcher pods from VirtualMachineInstance specs

use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use k8s_openapi::api::core::v1::{ConfigMap, PersistentVolumeClaim};
use serde::de::DeserializeOwned;

use virt_common::crd::VirtualMachineInstance;
use virt_common::telemetry::{init_logging, LogFormat};
use virt_template::config::{DEFAULT_EPHEMERAL_DISK_DIR, DEFAULT_VIRT_SHARE_DIR};
use virt_template::{
    AnnotationHookSidecars, DnsHostname, InMemoryClaimStore, InMemoryConfigStore, NoDiskStaging,
    TemplateConfig, TemplateService,
};

/// virt - compile VirtualMachineInstances into launcher pods
#[derive(Parser, Debug)]
#[command(name = "virt", version, about, long_about = None)]
struct Cli {
    /// Log output format (text or json)
    #[arg(long, global = true, env = "VIRT_LOG_FORMAT", default_value = "text")]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Render the launcher pod for a VM and print it as YAML
    Render(RenderArgs),
}

/// Render mode arguments
#[derive(Parser, Debug)]
struct RenderArgs {
    /// Path to the VirtualMachineInstance YAML
    #[arg(long)]
    vmi: PathBuf,

    /// Path to a YAML list of PersistentVolumeClaims the VM may reference
    #[arg(long)]
    claims: Option<PathBuf>,

    /// Path to the cluster configuration ConfigMap YAML
    #[arg(long)]
    config: Option<PathBuf>,

    /// Launcher container image
    #[arg(long, env = "VIRT_LAUNCHER_IMAGE")]
    launcher_image: String,

    /// Host directory shared with the node agent
    #[arg(long, env = "VIRT_SHARE_DIR", default_value = DEFAULT_VIRT_SHARE_DIR)]
    virt_share_dir: String,

    /// Directory for ephemeral disk overlays
    #[arg(long, env = "VIRT_EPHEMERAL_DISK_DIR", default_value = DEFAULT_EPHEMERAL_DISK_DIR)]
    ephemeral_disk_dir: String,

    /// Pull secret added to every launcher pod
    #[arg(long, env = "VIRT_IMAGE_PULL_SECRET")]
    image_pull_secret: Option<String>,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    init_logging(cli.log_format)
        .map_err(|e| anyhow::anyhow!("Failed to initialize logging: {}", e))?;

    match cli.command {
        Commands::Render(args) => run_render(args),
    }
}

/// Render one VM against file-backed stores
fn run_render(args: RenderArgs) -> anyhow::Result<()> {
    let vmi: VirtualMachineInstance = read_yaml(&args.vmi)?;

    let claims = match &args.claims {
        Some(path) => {
            let claims: Vec<PersistentVolumeClaim> = read_yaml(path)?;
            InMemoryClaimStore::from_claims(claims)
        }
        None => InMemoryClaimStore::new(),
    };

    let config_store = match &args.config {
        Some(path) => {
            let config_map: ConfigMap = read_yaml(path)?;
            InMemoryConfigStore::from_config_map(&config_map)
        }
        None => InMemoryConfigStore::new(),
    };

    let config = TemplateConfig::new(args.launcher_image)
        .with_virt_share_dir(args.virt_share_dir)
        .with_ephemeral_disk_dir(args.ephemeral_disk_dir)
        .with_image_pull_secret(args.image_pull_secret);

    let service = TemplateService::new(config, Arc::new(config_store), Arc::new(claims))
        .map_err(|e| anyhow::anyhow!("Invalid configuration: {}", e))?
        .with_disk_stager(NoDiskStaging)
        .with_hostname_sanitizer(DnsHostname)
        .with_hook_sidecars(AnnotationHookSidecars);

    let pod = service
        .render_launch_manifest(&vmi)
        .map_err(|e| anyhow::anyhow!("Failed to render {}: {}", vmi.name(), e))?;

    let yaml = serde_yaml::to_string(&pod)
        .map_err(|e| anyhow::anyhow!("Failed to serialize pod: {}", e))?;
    print!("{yaml}");

    tracing::info!(vmi = %vmi.name(), "launcher pod written to stdout");
    Ok(())
}

fn read_yaml<T: DeserializeOwned>(path: &Path) -> anyhow::Result<T> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| anyhow::anyhow!("Failed to read {:?}: {}", path, e))?;
    serde_yaml::from_str(&content)
        .map_err(|e| anyhow::anyhow!("Failed to parse {:?}: {}", path, e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn render_defaults() {
        let cli = Cli::try_parse_from([
            "virt",
            "render",
            "--vmi",
            "vm.yaml",
            "--launcher-image",
            "registry/virt-launcher:v1",
        ])
        .unwrap();
        let Commands::Render(args) = cli.command;
        assert_eq!(args.vmi, PathBuf::from("vm.yaml"));
        assert_eq!(args.launcher_image, "registry/virt-launcher:v1");
        assert!(args.claims.is_none());
        assert_eq!(args.virt_share_dir, DEFAULT_VIRT_SHARE_DIR);
    }

    #[test]
    fn log_format_accepts_json() {
        let cli = Cli::try_parse_from([
            "virt",
            "--log-format",
            "json",
            "render",
            "--vmi",
            "v",
            "--launcher-image",
            "img",
        ])
        .unwrap();
        assert_eq!(cli.log_format, LogFormat::Json);
    }

    #[test]
    fn launcher_image_is_required() {
        if std::env::var_os("VIRT_LAUNCHER_IMAGE").is_some() {
            return;
        }
        let err = Cli::try_parse_from(["virt", "render", "--vmi", "vm.yaml"]).unwrap_err();
        assert_eq!(err.kind(), clap::error::ErrorKind::MissingRequiredArgument);
    }
}
