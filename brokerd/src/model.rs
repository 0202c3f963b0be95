//! Core data types shared across the broker: PCI addressing, capability
//! records, service instances, devices, and sections. See `SPEC_FULL.md`
//! §3 for the data model these types implement.

use std::fmt;

/// Emits a `u32`-backed bitflag-ish struct without depending on the
/// `bitflags` crate (not in the teacher's graph).
macro_rules! bitflags_like {
    (
        $(#[$meta:meta])*
        pub struct $name:ident: $repr:ty {
            $($variant:ident = $value:expr),* $(,)?
        }
    ) => {
        $(#[$meta])*
        #[allow(non_snake_case)]
        pub struct $name;
        #[allow(non_upper_case_globals)]
        impl $name {
            $(pub const $variant: $repr = $value;)*
        }
    };
}

/// Sentinel `pkg_id` meaning "no parent PF known" (running inside a
/// guest where passthrough-parent metadata is unavailable).
pub const PKG_ID_NONE: u16 = 0xFFFF;

pub const MAX_STRLEN: usize = 256;
pub const DEVICE_NAME_SIZE: usize = 64;
pub const RINGS_PER_VF: usize = 4;

pub const ACCEL_VENDOR_ID: u16 = 0x8086;

/// VF device id -> friendly name, in the order spec.md §6 lists them.
pub const VF_DEVICE_IDS: &[(u16, &str)] = &[
    (0x4941, "4xxxvf"),
    (0x4943, "401xxvf"),
    (0x4945, "402xxvf"),
    (0x4947, "420xxvf"),
];

pub fn friendly_name(device_id: u16) -> Option<&'static str> {
    VF_DEVICE_IDS
        .iter()
        .find(|(id, _)| *id == device_id)
        .map(|(_, name)| *name)
}

/// A PCI bus:device.function address, optionally qualified by domain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Bdf {
    pub domain: u16,
    pub bus: u8,
    pub device: u8,
    pub function: u8,
}

impl Bdf {
    pub fn new(domain: u16, bus: u8, device: u8, function: u8) -> Self {
        Self { domain, bus, device, function }
    }

    /// Packs into the layout spec.md §3 names: domain:16, bus:8,
    /// device:5, function:3.
    pub fn pack(&self) -> u32 {
        (self.domain as u32) << 16
            | (self.bus as u32) << 8
            | ((self.device as u32) & 0x1F) << 3
            | (self.function as u32) & 0x7
    }

    /// Packed PF identifier used as the capability-cache key:
    /// `(domain << 8) | bus`.
    pub fn pf_key(&self) -> u32 {
        (self.domain as u32) << 8 | self.bus as u32
    }

    /// Parses the canonical `DDDD:BB:DD.F` form.
    pub fn parse(s: &str) -> anyhow::Result<Self> {
        let (domain_bus_dev, function) = s
            .split_once('.')
            .ok_or_else(|| anyhow::anyhow!("malformed BDF (no function): {s}"))?;
        let mut parts = domain_bus_dev.split(':');
        let (domain, bus, device) = match (parts.next(), parts.next(), parts.next(), parts.next()) {
            (Some(d), Some(b), Some(dev), None) => (d, b, dev),
            (Some(b), Some(dev), None, None) => ("0", b, dev),
            _ => anyhow::bail!("malformed BDF: {s}"),
        };
        Ok(Self {
            domain: u16::from_str_radix(domain, 16)?,
            bus: u8::from_str_radix(bus, 16)?,
            device: u8::from_str_radix(device, 16)?,
            function: u8::from_str_radix(function, 16)?,
        })
    }
}

impl fmt::Display for Bdf {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:04x}:{:02x}:{:02x}.{:x}",
            self.domain, self.bus, self.device, self.function
        )
    }
}

/// One entry from the passthrough group directory walk: an accelerator
/// VF the enumerator accepted. Immutable once built.
#[derive(Debug, Clone)]
pub struct VfDescriptor {
    pub bdf: Bdf,
    pub group_path: std::path::PathBuf,
    pub group_fd: Option<std::os::fd::RawFd>,
    pub device_id: u16,
    pub numa_node: u32,
}

/// Parent PF identity plus its discovery-order ordinal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PfDescriptor {
    pub bdf: Bdf,
    pub pkg_id: u16,
}

/// The four ring-to-service slot values, as reported by the kernel
/// driver through the PF<->VF control channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CfgService {
    Unused = 0,
    Crypto = 1,
    Comp = 2,
    Sym = 3,
    Asym = 4,
    Used = 5,
}

impl CfgService {
    pub fn from_u32(v: u32) -> anyhow::Result<Self> {
        Ok(match v {
            0 => Self::Unused,
            1 => Self::Crypto,
            2 => Self::Comp,
            3 => Self::Sym,
            4 => Self::Asym,
            5 => Self::Used,
            other => anyhow::bail!("unknown service in ring map: {other}"),
        })
    }
}

pub const CFG_SERV_RING_PAIR_SHIFTS: [u32; RINGS_PER_VF] = [0, 3, 6, 9];
const SVC_MASK: u32 = 0x7;

/// `ASYM | SYM<<3 | ASYM<<6 | SYM<<9` from `DEFAULT_RING_TO_SRV_MAP`.
pub const DEFAULT_RING_TO_SRV_MAP: u32 =
    (CfgService::Asym as u32)
        | (CfgService::Sym as u32) << 3
        | (CfgService::Asym as u32) << 6
        | (CfgService::Sym as u32) << 9;

/// A 32-bit ring-to-service map: four 3-bit fields at shifts 0/3/6/9.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RingToServiceMap(pub u32);

impl RingToServiceMap {
    pub fn slot(&self, ring_pair: usize) -> anyhow::Result<CfgService> {
        let shift = CFG_SERV_RING_PAIR_SHIFTS[ring_pair];
        CfgService::from_u32((self.0 >> shift) & SVC_MASK)
    }

    /// Ring-pair indices (0..4) whose slot matches `want`, in order.
    pub fn occurrences(&self, want: CfgService) -> anyhow::Result<Vec<usize>> {
        let mut out = Vec::new();
        for i in 0..RINGS_PER_VF {
            if self.slot(i)? == want {
                out.push(i);
            }
        }
        Ok(out)
    }
}

bitflags_like! {
    /// Crate-local capability bit positions. The real QAT driver's bit
    /// numbers live in a vendor header not present in this codebase;
    /// these are internally-consistent stand-ins documented in
    /// DESIGN.md, sufficient to satisfy every testable property in
    /// SPEC_FULL.md (none of which pin an exact bit number).
    pub struct CapBits: u32 {
        SYM = 1 << 0,
        ASYM = 1 << 1,
        DC = 1 << 2,
        CIPHER = 1 << 3,
        ECEDMONT = 1 << 4,
    }
}

/// Per-PF capability record, cached by `Bdf::pf_key()`.
#[derive(Debug, Clone, Copy)]
pub struct Capabilities {
    pub accel_capabilities: u64,
    pub extended_capabilities: u64,
    pub ring_to_service: RingToServiceMap,
}

impl Capabilities {
    pub fn has(&self, bit: u32) -> bool {
        self.accel_capabilities & bit as u64 != 0
    }
}

/// Hard-coded fallback used when the PF<->VF control channel is
/// unavailable (guest mode): the full crypto-and-compression feature
/// set, per spec.md §4.3.
pub fn fallback_capabilities() -> Capabilities {
    Capabilities {
        accel_capabilities: (CapBits::SYM | CapBits::ASYM | CapBits::DC | CapBits::CIPHER) as u64,
        extended_capabilities: 0,
        ring_to_service: RingToServiceMap(DEFAULT_RING_TO_SRV_MAP),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ServiceKind {
    Sym,
    Asym,
    Dc,
}

impl ServiceKind {
    pub fn prefix(&self) -> &'static str {
        match self {
            ServiceKind::Sym => "sym",
            ServiceKind::Asym => "asym",
            ServiceKind::Dc => "dc",
        }
    }

    pub fn bit(&self) -> u16 {
        match self {
            ServiceKind::Dc => 1,
            ServiceKind::Sym => 2,
            ServiceKind::Asym => 4,
        }
    }
}

/// One ring pair handed to a client: `struct ring_info` in the wire
/// appendix.
#[derive(Debug, Clone)]
pub struct Instance {
    pub name: String,
    pub kind: ServiceKind,
    pub accelid: u16,
    pub bank_number: u16,
    pub ring_tx: u16,
    pub ring_rx: u16,
    pub is_polled: bool,
    pub num_concurrent_requests: u16,
    pub core_affinity: u16,
}

/// Paired sym/asym slots exposed to clients as the "cy" (crypto) view.
#[derive(Debug, Clone, Default)]
pub struct CyPair {
    pub sym: Option<Instance>,
    pub asym: Option<Instance>,
}

/// One VF plus everything derived for it during the section build.
#[derive(Debug, Clone)]
pub struct Device {
    pub vf: VfDescriptor,
    pub device_type: u16,
    pub friendly_name: String,
    pub max_banks: u16,
    pub max_rings_per_bank: u16,
    pub arb_mask: u16,
    pub accel_capabilities: u64,
    pub extended_capabilities: u64,
    pub services: u16,
    pub pkg_id: u16,
    pub num_sym_inst: usize,
    pub num_asym_inst: usize,
    pub num_dc_inst: usize,
    pub num_cy_inst: usize,
    pub dc_instances: Vec<Instance>,
    pub cy_instances: Vec<CyPair>,
}

// (bitflags_like! is defined near the top of this file, used above.)

pub const MAX_BANKS: u16 = RINGS_PER_VF as u16;
pub const MAX_RINGS_PER_BANK: u16 = 2;
pub const ARB_MASK: u16 = 0xFF;
pub const ASYM_CONCURRENCY: u16 = 64;
pub const SYM_CONCURRENCY: u16 = 512;
pub const DC_CONCURRENCY: u16 = 512;

/// A unit of allocation handed to exactly one client thread at a time.
///
/// Instance name counters (`sym0`, `asym0`, `dc0`, ...) reset to zero
/// per section rather than being globally unique — preserved as-is per
/// SPEC_FULL.md §10, not "fixed".
#[derive(Debug, Clone)]
pub struct Section {
    pub name: String,
    pub base_name: String,
    pub assigned_tid: Option<u64>,
    pub devices: Vec<Device>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bdf_roundtrips_through_display_and_parse() {
        let bdf = Bdf::new(0, 0x3d, 0x02, 0x1);
        let s = bdf.to_string();
        assert_eq!(s, "0000:3d:02.1");
        assert_eq!(Bdf::parse(&s).unwrap(), bdf);
    }

    #[test]
    fn bdf_parse_accepts_short_form_without_domain() {
        let bdf = Bdf::parse("3d:02.1").unwrap();
        assert_eq!(bdf, Bdf::new(0, 0x3d, 0x02, 0x1));
    }

    #[test]
    fn pf_key_combines_domain_and_bus() {
        let bdf = Bdf::new(1, 0x3d, 0, 0);
        assert_eq!(bdf.pf_key(), (1u32 << 8) | 0x3d);
    }

    #[test]
    fn default_ring_map_gives_two_sym_two_asym() {
        let map = RingToServiceMap(DEFAULT_RING_TO_SRV_MAP);
        assert_eq!(map.occurrences(CfgService::Asym).unwrap(), vec![0, 2]);
        assert_eq!(map.occurrences(CfgService::Sym).unwrap(), vec![1, 3]);
        assert!(map.occurrences(CfgService::Comp).unwrap().is_empty());
    }
}
