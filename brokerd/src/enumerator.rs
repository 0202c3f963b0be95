//! Device Enumerator (SPEC_FULL.md §4.1): walks the passthrough group
//! directory tree and returns the sorted list of accepted VFs.

use std::fs;
use std::os::unix::fs::MetadataExt;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use crate::model::{Bdf, VfDescriptor, ACCEL_VENDOR_ID, VF_DEVICE_IDS};

/// Root directories the enumerator walks. Defaults point at the real
/// kernel interfaces; tests substitute a `tempfile::TempDir` tree with
/// the same shape.
#[derive(Debug, Clone)]
pub struct EnumeratorRoots {
    pub vfio_dir: PathBuf,
    pub iommu_groups_dir: PathBuf,
}

impl Default for EnumeratorRoots {
    fn default() -> Self {
        Self {
            vfio_dir: PathBuf::from("/dev/vfio"),
            iommu_groups_dir: PathBuf::from("/sys/kernel/iommu_groups"),
        }
    }
}

pub struct DeviceEnumerator {
    pub roots: EnumeratorRoots,
    pub retain_group_handles: bool,
}

impl DeviceEnumerator {
    pub fn new(roots: EnumeratorRoots, retain_group_handles: bool) -> Self {
        Self { roots, retain_group_handles }
    }

    /// Runs the full walk and returns VFs sorted by (function, device,
    /// bus, domain), per spec.md §4.1's sort order rationale.
    pub fn scan(&self) -> Result<Vec<VfDescriptor>> {
        let entries = fs::read_dir(&self.roots.vfio_dir)
            .with_context(|| format!("opening passthrough group dir {:?}", self.roots.vfio_dir))?;

        let mut out = Vec::new();
        for entry in entries {
            let entry = match entry {
                Ok(e) => e,
                Err(_) => continue,
            };
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if name == "." || name == ".." || name == "vfio" {
                continue;
            }
            match self.try_accept_group(&name) {
                Ok(Some(vf)) => out.push(vf),
                Ok(None) => {}
                Err(e) => log::warn!("skipping passthrough group {name}: {e:#}"),
            }
        }

        out.sort_by_key(|vf| (vf.bdf.function, vf.bdf.device, vf.bdf.bus, vf.bdf.domain));
        Ok(out)
    }

    fn try_accept_group(&self, group: &str) -> Result<Option<VfDescriptor>> {
        let group_path = self.roots.vfio_dir.join(group);
        let group_file = open_safely(&group_path, false)
            .with_context(|| format!("opening group file {group_path:?}"))?;

        let devices_dir = self
            .roots
            .iommu_groups_dir
            .join(group)
            .join("devices");
        let devices_dir_handle = open_safely(&devices_dir, true)
            .with_context(|| format!("opening {devices_dir:?}"))?;
        drop(devices_dir_handle);
        let children: Vec<_> = fs::read_dir(&devices_dir)
            .with_context(|| format!("opening {devices_dir:?}"))?
            .filter_map(|e| e.ok())
            .collect();
        if children.len() != 1 {
            anyhow::bail!("expected exactly one device in group, found {}", children.len());
        }
        let bdf_str = children[0].file_name().to_string_lossy().into_owned();
        let dev_dir = devices_dir.join(&bdf_str);

        let vendor = read_hex_attr(&dev_dir.join("vendor"))?;
        let device = read_hex_attr(&dev_dir.join("device"))?;
        if vendor != ACCEL_VENDOR_ID || !VF_DEVICE_IDS.iter().any(|(id, _)| *id == device) {
            return Ok(None);
        }

        let bdf = Bdf::parse(&bdf_str)?;
        let numa_node = read_i64_attr(&dev_dir.join("numa_node")).unwrap_or(-1);
        let numa_node = if numa_node < 0 { 0 } else { numa_node as u32 };

        let group_fd = if self.retain_group_handles {
            use std::os::fd::IntoRawFd;
            Some(group_file.into_raw_fd())
        } else {
            drop(group_file);
            None
        };

        Ok(Some(VfDescriptor {
            bdf,
            group_path,
            group_fd,
            device_id: device,
            numa_node,
        }))
    }
}

/// Opens `path` refusing to follow symlinks and rejecting hard-linked
/// files (`st_nlink > 1`), per spec.md §6's filesystem safety policy.
fn open_safely(path: &Path, dir: bool) -> Result<fs::File> {
    let mut opts = fs::OpenOptions::new();
    opts.read(true);
    if !dir {
        opts.write(true);
    }
    opts.custom_flags(libc::O_NOFOLLOW);
    let file = opts.open(path)?;
    let meta = file.metadata()?;
    // Directory nlink counts subdirectories' ".." entries, not hard
    // links; the hard-link rejection only means something for files.
    if !dir && meta.nlink() > 1 {
        anyhow::bail!("refusing hard-linked file: {path:?}");
    }
    Ok(file)
}

fn read_hex_attr(path: &Path) -> Result<u16> {
    let raw = read_attr_file(path)?;
    let trimmed = raw.trim().trim_start_matches("0x");
    u16::from_str_radix(trimmed, 16).with_context(|| format!("parsing hex attr {path:?}: {raw:?}"))
}

fn read_i64_attr(path: &Path) -> Result<i64> {
    let raw = read_attr_file(path)?;
    raw.trim().parse().with_context(|| format!("parsing int attr {path:?}: {raw:?}"))
}

fn read_attr_file(path: &Path) -> Result<String> {
    let file = open_safely(path, false)?;
    use std::io::Read;
    let mut buf = String::new();
    (&file).read_to_string(&mut buf)?;
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    struct Fixture {
        _root: tempfile::TempDir,
        roots: EnumeratorRoots,
    }

    fn write_attr(dir: &Path, name: &str, contents: &str) {
        fs::create_dir_all(dir).unwrap();
        let mut f = fs::File::create(dir.join(name)).unwrap();
        writeln!(f, "{contents}").unwrap();
    }

    fn make_group(root: &Path, group: &str, bdf: &str, vendor: &str, device: &str, numa: &str) {
        let vfio_dir = root.join("dev/vfio");
        fs::create_dir_all(&vfio_dir).unwrap();
        fs::File::create(vfio_dir.join(group)).unwrap();

        let dev_dir = root
            .join("sys/kernel/iommu_groups")
            .join(group)
            .join("devices")
            .join(bdf);
        write_attr(&dev_dir, "vendor", vendor);
        write_attr(&dev_dir, "device", device);
        write_attr(&dev_dir, "numa_node", numa);
    }

    fn fixture() -> Fixture {
        let tmp = tempfile::tempdir().unwrap();
        let roots = EnumeratorRoots {
            vfio_dir: tmp.path().join("dev/vfio"),
            iommu_groups_dir: tmp.path().join("sys/kernel/iommu_groups"),
        };
        fs::create_dir_all(&roots.vfio_dir).unwrap();
        fs::File::create(roots.vfio_dir.join("vfio")).unwrap();
        Fixture { _root: tmp, roots }
    }

    #[test]
    fn empty_host_returns_zero_vfs() {
        let fx = fixture();
        let enumerator = DeviceEnumerator::new(fx.roots.clone(), false);
        let vfs = enumerator.scan().unwrap();
        assert!(vfs.is_empty());
    }

    #[test]
    fn accepts_matching_vendor_and_device_ids() {
        let fx = fixture();
        make_group(
            fx._root.path(),
            "10",
            "0000:3d:02.0",
            "0x8086",
            "0x4941",
            "0",
        );
        let enumerator = DeviceEnumerator::new(fx.roots.clone(), false);
        let vfs = enumerator.scan().unwrap();
        assert_eq!(vfs.len(), 1);
        assert_eq!(vfs[0].bdf, Bdf::parse("0000:3d:02.0").unwrap());
        assert_eq!(vfs[0].device_id, 0x4941);
    }

    #[test]
    fn rejects_unknown_vendor() {
        let fx = fixture();
        make_group(
            fx._root.path(),
            "10",
            "0000:3d:02.0",
            "0x1af4",
            "0x4941",
            "0",
        );
        let enumerator = DeviceEnumerator::new(fx.roots.clone(), false);
        assert!(enumerator.scan().unwrap().is_empty());
    }

    #[test]
    fn clamps_negative_numa_node_to_zero() {
        let fx = fixture();
        make_group(
            fx._root.path(),
            "10",
            "0000:3d:02.0",
            "0x8086",
            "0x4941",
            "-1",
        );
        let enumerator = DeviceEnumerator::new(fx.roots.clone(), false);
        let vfs = enumerator.scan().unwrap();
        assert_eq!(vfs[0].numa_node, 0);
    }

    #[test]
    fn sorts_by_function_then_device_then_bus() {
        let fx = fixture();
        make_group(fx._root.path(), "1", "0000:3d:02.1", "0x8086", "0x4941", "0");
        make_group(fx._root.path(), "2", "0000:3d:02.0", "0x8086", "0x4941", "0");
        make_group(fx._root.path(), "3", "0000:3e:02.0", "0x8086", "0x4941", "0");
        let enumerator = DeviceEnumerator::new(fx.roots.clone(), false);
        let vfs = enumerator.scan().unwrap();
        let funcs: Vec<u8> = vfs.iter().map(|v| v.bdf.function).collect();
        assert_eq!(funcs, vec![0, 0, 1]);
    }
}
