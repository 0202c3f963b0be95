//! Section Builder (SPEC_FULL.md §4.5): groups VFs into sections per
//! policy and derives each device's service-instance layout.

use std::collections::HashSet;

use anyhow::{bail, Result};

use crate::capability::{CapabilityCache, VfioOpener};
use crate::cpu::CpuTopology;
use crate::model::{
    friendly_name, CapBits, CfgService, CyPair, Device, Instance, ServiceKind, VfDescriptor,
    ARB_MASK, ASYM_CONCURRENCY, DC_CONCURRENCY, MAX_BANKS, MAX_RINGS_PER_BANK, SYM_CONCURRENCY,
};
use crate::pf_topology::PfTable;
use crate::model::Bdf;
use crate::model::Section;

/// Resolves a VF's parent PF BDF, or `None` in guest mode. Kept as a
/// trait object so the builder doesn't depend on sysfs paths directly
/// (tests inject a fixed mapping).
pub trait PfResolver {
    fn resolve(&self, vf_bdf: &Bdf) -> Result<Option<Bdf>>;
}

pub struct BuildInputs<'a> {
    pub vfs: &'a [VfDescriptor],
    pub policy: u32,
    pub static_cfg: bool,
    pub pf_resolver: &'a dyn PfResolver,
    pub pf_table: &'a mut PfTable,
    pub cap_cache: &'a mut CapabilityCache,
    pub opener: &'a dyn VfioOpener,
    pub cpu_topology: &'a CpuTopology,
}

pub fn build_sections(inputs: BuildInputs<'_>) -> Result<Vec<Section>> {
    let BuildInputs { vfs, policy, static_cfg, pf_resolver, pf_table, cap_cache, opener, cpu_topology } = inputs;

    if vfs.is_empty() {
        bail!("invalid argument");
    }

    let device_groups = partition_into_sections(vfs, policy, static_cfg, pf_resolver)?;

    let mut next_accelid: u16 = 0;
    let mut sections = Vec::with_capacity(device_groups.len());
    for (i, group) in device_groups.into_iter().enumerate() {
        let mut devices = Vec::with_capacity(group.len());
        let mut sym_counter = 0usize;
        let mut asym_counter = 0usize;
        let mut dc_counter = 0usize;

        for vf in group {
            let accelid = next_accelid;
            next_accelid += 1;

            let parent_pf = pf_resolver.resolve(&vf.bdf)?;
            let (pkg_id, caps) = match parent_pf {
                Some(pf_bdf) => {
                    let pkg_id = pf_table.record(pf_bdf)?;
                    let pf_key = pf_bdf.pf_key();
                    let caps = match cap_cache.get(pf_key) {
                        Some(cached) => *cached,
                        None => {
                            let mut channel = opener.open_channel(&vf.group_path)?;
                            cap_cache.fetch_or_query(pf_key, channel.as_mut())?
                        }
                    };
                    (pkg_id, caps)
                }
                // Guest mode: pkg_id equals the device's own accelid (spec.md §4.2).
                None => (accelid, crate::model::fallback_capabilities()),
            };

            let device = fill_device(
                vf,
                accelid,
                pkg_id,
                &caps,
                cpu_topology,
                &mut sym_counter,
                &mut asym_counter,
                &mut dc_counter,
            )?;
            devices.push(device);
        }

        sections.push(Section {
            name: format!("SSL_INT_{i}"),
            base_name: "SSL".to_string(),
            assigned_tid: None,
            devices,
        });
    }

    Ok(sections)
}

fn partition_into_sections(
    vfs: &[VfDescriptor],
    policy: u32,
    static_cfg: bool,
    pf_resolver: &dyn PfResolver,
) -> Result<Vec<Vec<VfDescriptor>>> {
    if static_cfg {
        let take = if policy > 1 { policy as usize } else { vfs.len() };
        if vfs.len() < take {
            bail!("not enough devices for static configuration");
        }
        return Ok(vec![vfs[..take].to_vec()]);
    }

    if policy == 0 {
        return group_by_distinct_pf(vfs, pf_resolver);
    }

    let policy = policy as usize;
    let num_sections = vfs.len() / policy;
    if num_sections == 0 {
        bail!("policy incompatible with device count");
    }
    Ok(vfs.chunks(policy).take(num_sections).map(|c| c.to_vec()).collect())
}

/// VF-group counting per spec.md §4.5: scan maintaining a set of PFs
/// seen in the current group; a repeated PF closes the group. In
/// guest mode (no PF metadata for a VF) the VF is its own group key,
/// so it never collides with another VF and ends up alone in its
/// group — the only sensible behavior when PF identity is unknown.
fn group_by_distinct_pf(
    vfs: &[VfDescriptor],
    pf_resolver: &dyn PfResolver,
) -> Result<Vec<Vec<VfDescriptor>>> {
    let mut groups: Vec<Vec<VfDescriptor>> = vec![Vec::new()];
    let mut seen: HashSet<Bdf> = HashSet::new();

    for vf in vfs {
        let key = pf_resolver.resolve(&vf.bdf)?.unwrap_or(vf.bdf);
        if seen.contains(&key) {
            groups.push(Vec::new());
            seen.clear();
        }
        seen.insert(key);
        groups.last_mut().unwrap().push(vf.clone());
    }

    Ok(groups)
}

#[allow(clippy::too_many_arguments)]
fn fill_device(
    vf: VfDescriptor,
    accelid: u16,
    pkg_id: u16,
    caps: &crate::model::Capabilities,
    cpu_topology: &CpuTopology,
    sym_counter: &mut usize,
    asym_counter: &mut usize,
    dc_counter: &mut usize,
) -> Result<Device> {
    let mut sym_slots = Vec::new();
    let mut asym_slots = Vec::new();
    let mut dc_slots = Vec::new();

    for i in 0..crate::model::RINGS_PER_VF {
        match caps.ring_to_service.slot(i)? {
            CfgService::Unused => {}
            CfgService::Sym if caps.has(CapBits::SYM) => sym_slots.push(i),
            CfgService::Asym if caps.has(CapBits::ASYM) => asym_slots.push(i),
            CfgService::Comp if caps.has(CapBits::DC) => dc_slots.push(i),
            CfgService::Sym | CfgService::Asym | CfgService::Comp => {
                // Capability bit not set for this slot's service: the
                // slot exists in the ring map but isn't usable here.
            }
            CfgService::Crypto | CfgService::Used => bail!("unknown service in ring map"),
        }
    }

    let num_sym_inst = sym_slots.len();
    let num_asym_inst = asym_slots.len();
    let num_dc_inst = dc_slots.len();
    let num_cy_inst = if num_sym_inst == 4 || num_asym_inst == 4 {
        4
    } else if num_sym_inst == 2 || num_asym_inst == 2 {
        2
    } else {
        0
    };

    let affinity = || cpu_topology.affinity(vf.numa_node);

    let asym_instances: Vec<Instance> = asym_slots
        .iter()
        .map(|&bank| {
            let inst = Instance {
                name: format!("asym{asym_counter}"),
                kind: ServiceKind::Asym,
                accelid,
                bank_number: bank as u16,
                ring_tx: 0,
                ring_rx: 1,
                is_polled: true,
                num_concurrent_requests: ASYM_CONCURRENCY,
                core_affinity: affinity(),
            };
            *asym_counter += 1;
            inst
        })
        .collect();

    let sym_instances: Vec<Instance> = sym_slots
        .iter()
        .map(|&bank| {
            let inst = Instance {
                name: format!("sym{sym_counter}"),
                kind: ServiceKind::Sym,
                accelid,
                bank_number: bank as u16,
                ring_tx: 0,
                ring_rx: 1,
                is_polled: true,
                num_concurrent_requests: SYM_CONCURRENCY,
                core_affinity: affinity(),
            };
            *sym_counter += 1;
            inst
        })
        .collect();

    let dc_instances: Vec<Instance> = dc_slots
        .iter()
        .map(|&bank| {
            let inst = Instance {
                name: format!("dc{dc_counter}"),
                kind: ServiceKind::Dc,
                accelid,
                bank_number: bank as u16,
                ring_tx: 0,
                ring_rx: 1,
                is_polled: true,
                num_concurrent_requests: DC_CONCURRENCY,
                core_affinity: affinity(),
            };
            *dc_counter += 1;
            inst
        })
        .collect();

    let mut cy_instances = Vec::with_capacity(num_cy_inst);
    for i in 0..num_cy_inst {
        cy_instances.push(CyPair {
            sym: sym_instances.get(i).cloned(),
            asym: asym_instances.get(i).cloned(),
        });
    }

    let mut services = 0u16;
    if num_sym_inst > 0 {
        services |= ServiceKind::Sym.bit();
    }
    if num_asym_inst > 0 {
        services |= ServiceKind::Asym.bit();
    }
    if num_dc_inst > 0 {
        services |= ServiceKind::Dc.bit();
    }

    let name = friendly_name(vf.device_id)
        .ok_or_else(|| anyhow::anyhow!("unsupported device id {:#x}", vf.device_id))?
        .to_string();

    Ok(Device {
        device_type: vf.device_id,
        friendly_name: name,
        max_banks: MAX_BANKS,
        max_rings_per_bank: MAX_RINGS_PER_BANK,
        arb_mask: ARB_MASK,
        accel_capabilities: caps.accel_capabilities,
        extended_capabilities: caps.extended_capabilities,
        services,
        pkg_id,
        num_sym_inst,
        num_asym_inst,
        num_dc_inst,
        num_cy_inst,
        dc_instances,
        cy_instances,
        vf,
    })
}
