//! PF Topology Resolver (SPEC_FULL.md §4.2): maps a VF's BDF to its
//! parent PF's BDF via passthrough-parent metadata, and assigns each
//! distinct PF an ordinal `pkg_id` in discovery order.

use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;

use anyhow::{Context, Result};

use crate::model::{Bdf, PfDescriptor, PKG_ID_NONE};

pub const MAX_PF_DEVICES: usize = 512;

#[derive(Debug, Clone)]
pub struct PfTopologyRoots {
    pub pci_devices_dir: PathBuf,
}

impl Default for PfTopologyRoots {
    fn default() -> Self {
        Self { pci_devices_dir: PathBuf::from("/sys/bus/pci/devices") }
    }
}

/// Reads `physfn/uevent` for a VF and extracts the `PCI_SLOT_NAME=`
/// line, which carries the parent PF's BDF.
pub fn resolve_parent_pf(roots: &PfTopologyRoots, vf_bdf: &Bdf) -> Result<Option<Bdf>> {
    let uevent_path = roots
        .pci_devices_dir
        .join(vf_bdf.to_string())
        .join("physfn")
        .join("uevent");
    let contents = match fs::read_to_string(&uevent_path) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e).with_context(|| format!("reading {uevent_path:?}")),
    };
    for line in contents.lines() {
        if let Some(slot) = line.strip_prefix("PCI_SLOT_NAME=") {
            return Ok(Some(Bdf::parse(slot.trim())?));
        }
    }
    Ok(None)
}

/// Table of PFs seen so far, keyed by `(domain, bus)` as spec.md §4.2
/// specifies, assigning ordinals in discovery order.
#[derive(Debug, Default)]
pub struct PfTable {
    by_key: HashMap<(u16, u8), u16>,
    ordered: Vec<PfDescriptor>,
}

impl PfTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.ordered.is_empty()
    }

    pub fn len(&self) -> usize {
        self.ordered.len()
    }

    pub fn descriptors(&self) -> &[PfDescriptor] {
        &self.ordered
    }

    /// Records `pf_bdf` if new, and returns its `pkg_id`.
    pub fn record(&mut self, pf_bdf: Bdf) -> Result<u16> {
        let key = (pf_bdf.domain, pf_bdf.bus);
        if let Some(&pkg_id) = self.by_key.get(&key) {
            return Ok(pkg_id);
        }
        if self.ordered.len() >= MAX_PF_DEVICES {
            anyhow::bail!("PF table full");
        }
        let pkg_id = self.ordered.len() as u16;
        self.by_key.insert(key, pkg_id);
        self.ordered.push(PfDescriptor { bdf: pf_bdf, pkg_id });
        Ok(pkg_id)
    }

    /// Resolves a VF to its PF's `pkg_id`, falling back to the
    /// sentinel (and letting the caller use the VF's own accelid) when
    /// the table is empty — the guest-mode case from spec.md §4.2.
    pub fn lookup_or_sentinel(&self, vf_bdf: &Bdf) -> u16 {
        if self.is_empty() {
            return PKG_ID_NONE;
        }
        self.by_key
            .get(&(vf_bdf.domain, vf_bdf.bus))
            .copied()
            .unwrap_or(PKG_ID_NONE)
    }
}
