//! On-disk configuration, adapted from the teacher's
//! env-var-override-then-TOML-then-default loading pattern.

use serde::Deserialize;
use std::fs;
use std::path::PathBuf;

const DEFAULT_CONFIG_PATH: &str = "/etc/qat/qatmgr.toml";
const ENV_CONFIG_PATH: &str = "ACCEL_BROKER_CONFIG";

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub sections: SectionConfig,
    #[serde(default)]
    pub paths: PathsConfig,
}

impl Config {
    /// Loads configuration from file. The path can be overridden with
    /// `ACCEL_BROKER_CONFIG`. A missing or unparsable file falls back
    /// to defaults rather than refusing to start.
    pub fn load() -> Self {
        let path = std::env::var(ENV_CONFIG_PATH).unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
        let path = PathBuf::from(path);
        match fs::read_to_string(&path) {
            Ok(contents) => toml::from_str(&contents).unwrap_or_else(|e| {
                log::warn!("failed to parse {path:?}, using defaults: {e}");
                Config::default()
            }),
            Err(_) => Config::default(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_socket_path")]
    pub socket_path: PathBuf,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self { socket_path: default_socket_path() }
    }
}

/// The socket path this daemon and `brokerctl` both fall back to when
/// neither a config file nor `--socket` names one. `brokerctl` imports
/// this directly rather than hand-duplicating the literal.
pub const DEFAULT_SOCKET_PATH: &str = "/run/qat/qatmgr.sock";

fn default_socket_path() -> PathBuf {
    PathBuf::from(DEFAULT_SOCKET_PATH)
}

/// Controls how VFs are partitioned into sections, mirroring the
/// daemon's `--policy`/`--static-cfg` command-line flags so both
/// sources feed the same fields.
#[derive(Debug, Deserialize, Clone)]
pub struct SectionConfig {
    #[serde(default = "default_policy")]
    pub policy: u32,
    #[serde(default)]
    pub static_cfg: bool,
    #[serde(default)]
    pub retain_group_handles: bool,
}

impl Default for SectionConfig {
    fn default() -> Self {
        Self { policy: default_policy(), static_cfg: false, retain_group_handles: false }
    }
}

fn default_policy() -> u32 {
    0
}

/// Root directories the discovery pipeline reads from. Overridable so
/// the pipeline can run unprivileged against a fixture tree in tests
/// and in CI, per SPEC_FULL.md §5.
#[derive(Debug, Deserialize, Clone)]
pub struct PathsConfig {
    #[serde(default = "default_vfio_dir")]
    pub vfio_dir: PathBuf,
    #[serde(default = "default_iommu_groups_dir")]
    pub iommu_groups_dir: PathBuf,
    #[serde(default = "default_pci_devices_dir")]
    pub pci_devices_dir: PathBuf,
    #[serde(default = "default_node_dir")]
    pub node_dir: PathBuf,
    #[serde(default = "default_online_cpus_file")]
    pub online_cpus_file: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            vfio_dir: default_vfio_dir(),
            iommu_groups_dir: default_iommu_groups_dir(),
            pci_devices_dir: default_pci_devices_dir(),
            node_dir: default_node_dir(),
            online_cpus_file: default_online_cpus_file(),
        }
    }
}

impl PathsConfig {
    /// Rewrites the sysfs-backed paths (not `vfio_dir`, which hangs off
    /// `/dev` rather than `/sys`) to hang off `root` instead of `/sys`,
    /// for `--sysfs-root` / running discovery against a relocated or
    /// containerized sysfs mount.
    pub fn rebase_sysfs(&mut self, root: &std::path::Path) {
        self.iommu_groups_dir = root.join("kernel/iommu_groups");
        self.pci_devices_dir = root.join("bus/pci/devices");
        self.node_dir = root.join("devices/system/node");
        self.online_cpus_file = root.join("devices/system/cpu/online");
    }
}

fn default_vfio_dir() -> PathBuf {
    PathBuf::from("/dev/vfio")
}
fn default_iommu_groups_dir() -> PathBuf {
    PathBuf::from("/sys/kernel/iommu_groups")
}
fn default_pci_devices_dir() -> PathBuf {
    PathBuf::from("/sys/bus/pci/devices")
}
fn default_node_dir() -> PathBuf {
    PathBuf::from("/sys/devices/system/node")
}
fn default_online_cpus_file() -> PathBuf {
    PathBuf::from("/sys/devices/system/cpu/online")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn parse_config_defaults() {
        let toml = r#"
[server]
socket_path = "/tmp/broker.sock"
[sections]
policy = 2
static_cfg = false
"#;
        let cfg: Config = toml::from_str(toml).unwrap();
        assert_eq!(cfg.server.socket_path, PathBuf::from("/tmp/broker.sock"));
        assert_eq!(cfg.sections.policy, 2);
        assert!(!cfg.sections.static_cfg);
        assert_eq!(cfg.paths.vfio_dir, PathBuf::from("/dev/vfio"));
    }

    #[test]
    fn missing_fields_fall_back_to_defaults() {
        let cfg: Config = toml::from_str("").unwrap();
        assert_eq!(cfg.sections.policy, 0);
        assert_eq!(cfg.server.socket_path, default_socket_path());
    }

    #[test]
    fn env_override_points_at_a_different_file() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "[sections]\npolicy = 4").unwrap();
        unsafe {
            std::env::set_var(ENV_CONFIG_PATH, file.path());
        }
        let cfg = Config::load();
        assert_eq!(cfg.sections.policy, 4);
        unsafe {
            std::env::remove_var(ENV_CONFIG_PATH);
        }
    }
}
