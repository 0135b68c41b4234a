//! CLI flags, config file layering, and test-platform-data bootstrap.
//!
//! Grounded on the teacher's `config/mod.rs`: a `clap`-derived `Args`
//! struct over a TOML file over built-in defaults, resolved once into an
//! immutable `DaemonConfig`. The three config keys spec.md §6 names
//! (`SchedulerManager.policy`, `SynchronizationManager.policy`,
//! `rloader.xml.recipe_dir`) are TOML table sections rather than dotted
//! keys — idiomatic `toml`/`serde` nesting for what the original names
//! with C++ namespace-style dotted identifiers.

use std::path::PathBuf;

use clap::Parser;
use serde::Deserialize;
use tracing::warn;

use crate::resources::ResourceAccounter;

const DEFAULT_CONFIG_PATH: &str = "/etc/bbque.conf";
const DEFAULT_PLUGINS_DIR: &str = "/usr/lib/bbque/plugins";
const DEFAULT_SCHEDULER_POLICY: &str = "random";
const DEFAULT_SYNC_POLICY: &str = "fifo";
const DEFAULT_RECIPE_DIR: &str = "/etc/bbque/recipes";

const DEFAULT_TPD_CLUSTERS: u16 = 3;
const DEFAULT_TPD_CMEM_MB: u64 = 8120;
const DEFAULT_TPD_PES: u16 = 4;

/// `bbque` daemon flags, spec.md §6.
#[derive(Debug, Parser)]
#[command(name = "bbque", about = "Run-time resource manager daemon", version)]
#[command(mut_arg("version", |a| a.short('v')))]
pub struct Args {
    /// Configuration file path.
    #[arg(short, long, default_value = DEFAULT_CONFIG_PATH)]
    pub config: PathBuf,

    /// Plugin directory.
    #[arg(short, long, default_value = DEFAULT_PLUGINS_DIR)]
    pub plugins: PathBuf,

    /// Number of clusters in the synthetic test platform, 1..=256.
    #[arg(long = "tpd.clusters", default_value_t = DEFAULT_TPD_CLUSTERS)]
    pub tpd_clusters: u16,

    /// Per-cluster memory in the synthetic test platform, MB.
    #[arg(long = "tpd.cmem", default_value_t = DEFAULT_TPD_CMEM_MB)]
    pub tpd_cmem: u64,

    /// Processing elements per cluster in the synthetic test platform, 1..=256.
    #[arg(long = "tpd.pes", default_value_t = DEFAULT_TPD_PES)]
    pub tpd_pes: u16,
}

/// `{config}` file contents. Every field is optional: a key the file omits
/// falls back to the built-in default.
#[derive(Debug, Default, Deserialize)]
struct ConfigFile {
    #[serde(rename = "SchedulerManager")]
    scheduler_manager: Option<SchedulerManagerSection>,
    #[serde(rename = "SynchronizationManager")]
    synchronization_manager: Option<SynchronizationManagerSection>,
    rloader: Option<RLoaderSection>,
}

#[derive(Debug, Deserialize)]
struct SchedulerManagerSection {
    policy: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SynchronizationManagerSection {
    policy: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RLoaderSection {
    xml: Option<XmlSection>,
}

#[derive(Debug, Deserialize)]
struct XmlSection {
    recipe_dir: Option<String>,
}

fn load_config_file(path: &std::path::Path) -> ConfigFile {
    match std::fs::read_to_string(path) {
        Ok(contents) => toml::from_str(&contents).unwrap_or_else(|e| {
            warn!(path = %path.display(), error = %e, "config file failed to parse, using defaults");
            ConfigFile::default()
        }),
        Err(_) => ConfigFile::default(),
    }
}

/// Resolved daemon configuration: CLI flags layered over the config file
/// layered over built-in defaults.
#[derive(Debug, Clone)]
pub struct DaemonConfig {
    pub config_path: PathBuf,
    pub plugins_dir: PathBuf,
    pub scheduler_policy: String,
    pub sync_policy: String,
    pub recipe_dir: PathBuf,
    pub tpd_clusters: u16,
    pub tpd_cmem_mb: u64,
    pub tpd_pes: u16,
}

impl DaemonConfig {
    pub fn from_args(args: &Args) -> Self {
        let file = load_config_file(&args.config);
        Self {
            config_path: args.config.clone(),
            plugins_dir: args.plugins.clone(),
            scheduler_policy: file
                .scheduler_manager
                .and_then(|s| s.policy)
                .unwrap_or_else(|| DEFAULT_SCHEDULER_POLICY.to_string()),
            sync_policy: file
                .synchronization_manager
                .and_then(|s| s.policy)
                .unwrap_or_else(|| DEFAULT_SYNC_POLICY.to_string()),
            recipe_dir: file
                .rloader
                .and_then(|r| r.xml)
                .and_then(|x| x.recipe_dir)
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_RECIPE_DIR)),
            tpd_clusters: args.tpd_clusters,
            tpd_cmem_mb: args.tpd_cmem,
            tpd_pes: args.tpd_pes,
        }
    }
}

/// Register the synthetic test platform's resource tree: `tpd_clusters`
/// clusters under a single tile, each with `tpd_pes` single-unit
/// processing elements and a `tpd_cmem_mb` cluster memory.
pub fn register_test_platform(
    accounter: &mut ResourceAccounter,
    config: &DaemonConfig,
) -> Result<(), crate::error::AccounterError> {
    for cluster in 0..config.tpd_clusters {
        accounter.register_resource(
            &format!("arch.tile0.cluster{cluster}.mem0"),
            config.tpd_cmem_mb,
            "mb",
        )?;
        for pe in 0..config.tpd_pes {
            accounter.register_resource(&format!("arch.tile0.cluster{cluster}.pe{pe}"), 1, "1")?;
        }
    }
    Ok(())
}
