use clap::{ArgAction, Parser};
use std::path::PathBuf;

use crate::config::{Catalog, Config, ConfigError, DEFAULT_SCAN_INTERVAL_SECS};

#[derive(Parser, Debug)]
#[command(name = "composable-dra")]
#[command(about = "Publish fabric-attached composable devices as DRA resource pools")]
#[command(version)]
pub struct Args {
    /// Enable verbose logging output (-v, -vv, -vvv)
    #[arg(short, long, action = ArgAction::Count)]
    pub verbose: u8,

    /// Seconds between reconciliation passes
    #[arg(long, env = "SCAN_INTERVAL", value_name = "SECS", default_value_t = DEFAULT_SCAN_INTERVAL_SECS)]
    pub scan_interval: u64,

    /// Tenant the cluster belongs to (UUID)
    #[arg(long, env = "TENANT_ID")]
    pub tenant_id: String,

    /// Cluster this process runs in (UUID)
    #[arg(long, env = "CLUSTER_ID")]
    pub cluster_id: String,

    /// Host (optionally host:port) of the composable-infrastructure API
    #[arg(long, env = "CDI_ENDPOINT", value_name = "HOST")]
    pub cdi_endpoint: String,

    /// Resolve machine UUIDs through BareMetalHost annotations
    #[arg(long, env = "USE_CAPI_BMH")]
    pub use_capi_bmh: bool,

    /// Label nodes with the min/max device counts of their node group
    #[arg(long, env = "USE_CM")]
    pub use_cluster_manager: bool,

    /// Binding timeout advertised on published devices (0-86400)
    #[arg(long, env = "BINDING_TIMEOUT_SEC", value_name = "SECS", allow_negative_numbers = true)]
    pub binding_timeout: Option<i64>,

    /// Path to a .env file loaded before the options above are read
    #[arg(long, value_name = "FILE")]
    pub env_file: Option<PathBuf>,

    /// Dry-run mode: validate configuration and device catalog, then exit
    #[arg(long)]
    pub dry_run: bool,
}

impl Args {
    /// Validate the raw options
    pub fn to_config(&self) -> Result<Config, ConfigError> {
        Config::new(
            self.scan_interval,
            &self.tenant_id,
            &self.cluster_id,
            &self.cdi_endpoint,
            self.use_capi_bmh,
            self.use_cluster_manager,
            self.binding_timeout,
        )
    }

    /// `RUST_LOG`-style filter for the verbosity count
    pub fn log_filter(&self) -> &'static str {
        match self.verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    }
}

/// Value of `--env-file` in raw arguments, looked up before full parsing
pub fn env_file_from_args<I, S>(args: I) -> Option<PathBuf>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    let mut args = args.into_iter().map(Into::into);
    while let Some(arg) = args.next() {
        if arg == "--" {
            break;
        }
        if arg == "--env-file" {
            return args.next().map(PathBuf::from);
        }
        if let Some(path) = arg.strip_prefix("--env-file=") {
            return Some(PathBuf::from(path));
        }
    }
    None
}

// ============================================================================
// SBIO: Pure display logic (no I/O - returns formatted strings)
// ============================================================================

/// Summary of the effective configuration, printed in dry-run mode
pub fn format_dry_run(config: &Config, catalog: &Catalog) -> String {
    let mut output = String::new();

    output.push_str(&format!(
        "composable-dra v{} - Dry Run Mode\n\n",
        env!("CARGO_PKG_VERSION")
    ));
    output.push_str(&format!("Endpoint:        {}\n", config.cdi_endpoint));
    output.push_str(&format!("Tenant:          {}\n", config.tenant_id));
    output.push_str(&format!("Cluster:         {}\n", config.cluster_id));
    output.push_str(&format!(
        "Scan interval:   {}s\n",
        config.scan_interval.as_secs()
    ));
    output.push_str(&format!("BareMetalHost:   {}\n", config.use_capi_bmh));
    output.push_str(&format!("Node groups:     {}\n", config.use_cluster_manager));
    match config.binding_timeout {
        Some(timeout) => output.push_str(&format!("Binding timeout: {}s\n", timeout)),
        None => output.push_str("Binding timeout: unset\n"),
    }
    output.push_str(&format!("Label prefix:    {}\n\n", catalog.label_prefix));

    output.push_str(&format!("Devices ({}):\n", catalog.devices.len()));
    for device in &catalog.devices {
        output.push_str(&format!(
            "  [{}] {} -> {} (driver {})\n",
            device.index, device.cdi_model_name, device.k8s_device_name, device.driver_name
        ));
        for (key, value) in &device.dra_attributes {
            output.push_str(&format!("      {}: {}\n", key, value));
        }
    }

    output.push_str("\nValidation: PASSED\n");
    output
}
