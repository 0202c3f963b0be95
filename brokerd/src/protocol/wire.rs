//! Fixed-layout encode/decode for the request/response payloads named
//! in spec.md §4.7 / SPEC_FULL.md §4.8. Field sets and sizes are
//! grounded in `qat_mgr.h`'s `struct qatmgr_msg_req`/`qatmgr_msg_rsp`;
//! instances are represented as tagged Rust enums rather than C
//! unions, per SPEC_FULL.md §9 ("tagged variant for instances
//! replaces the union-of-structs").

use anyhow::{bail, Context, Result};

use crate::model::{Instance, ServiceKind, MAX_STRLEN};

use super::{MsgType, ServKindWire, HEADER_LEN};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub len: u16,
    pub version: u16,
    pub msg_type: u16,
    pub filler: u16,
}

impl Header {
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < HEADER_LEN {
            bail!("short header");
        }
        Ok(Self {
            len: u16::from_ne_bytes([bytes[0], bytes[1]]),
            version: u16::from_ne_bytes([bytes[2], bytes[3]]),
            msg_type: u16::from_ne_bytes([bytes[4], bytes[5]]),
            filler: u16::from_ne_bytes([bytes[6], bytes[7]]),
        })
    }

    pub fn encode(&self) -> [u8; HEADER_LEN] {
        let mut out = [0u8; HEADER_LEN];
        out[0..2].copy_from_slice(&self.len.to_ne_bytes());
        out[2..4].copy_from_slice(&self.version.to_ne_bytes());
        out[4..6].copy_from_slice(&self.msg_type.to_ne_bytes());
        out[6..8].copy_from_slice(&self.filler.to_ne_bytes());
        out
    }
}

fn write_fixed_str(out: &mut Vec<u8>, s: &str, size: usize) -> Result<()> {
    if s.len() + 1 > size {
        bail!("string truncated past {size} bytes: {s:?}");
    }
    out.extend_from_slice(s.as_bytes());
    out.resize(out.len() + (size - s.len()), 0);
    Ok(())
}

fn read_fixed_str(bytes: &[u8]) -> Result<String> {
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    Ok(String::from_utf8_lossy(&bytes[..end]).into_owned())
}

#[derive(Debug, Clone)]
pub enum Request {
    SectionGet { preferred_name: String },
    SectionPut { name: String },
    NumDevices,
    DeviceInfo { device_num: u16 },
    DeviceId { device_num: u16 },
    InstanceInfo { kind: ServKindWire, num: u16, device_num: u16 },
    InstanceName { kind: ServKindWire, num: u16, device_num: u16 },
    VfioFile { device_num: u16 },
    NumPfDevs,
    PfDevInfo { device_num: u16 },
}

impl Request {
    /// The payload length this message type must carry, used for the
    /// length check in spec.md §4.7.
    pub fn expected_payload_len(msg_type: MsgType) -> Option<usize> {
        Some(match msg_type {
            MsgType::SectionGet => MAX_STRLEN,
            MsgType::SectionPut => MAX_STRLEN,
            MsgType::NumDevices => 0,
            MsgType::DeviceInfo => 2,
            MsgType::DeviceId => 2,
            MsgType::InstanceInfo => 6,
            MsgType::InstanceName => 6,
            MsgType::VfioFile => 2,
            MsgType::NumPfDevs => 0,
            MsgType::PfDevInfo => 2,
            MsgType::Unknown | MsgType::Bad => return None,
        })
    }

    pub fn decode(msg_type: MsgType, payload: &[u8]) -> Result<Self> {
        Ok(match msg_type {
            MsgType::SectionGet => Self::SectionGet { preferred_name: read_fixed_str(payload)? },
            MsgType::SectionPut => Self::SectionPut { name: read_fixed_str(payload)? },
            MsgType::NumDevices => Self::NumDevices,
            MsgType::DeviceInfo => Self::DeviceInfo { device_num: u16::from_ne_bytes([payload[0], payload[1]]) },
            MsgType::DeviceId => Self::DeviceId { device_num: u16::from_ne_bytes([payload[0], payload[1]]) },
            MsgType::InstanceInfo | MsgType::InstanceName => {
                let kind_raw = u16::from_ne_bytes([payload[0], payload[1]]);
                let num = u16::from_ne_bytes([payload[2], payload[3]]);
                let device_num = u16::from_ne_bytes([payload[4], payload[5]]);
                let kind = ServKindWire::from_u16(kind_raw)
                    .with_context(|| format!("unknown service kind: {kind_raw}"))?;
                if msg_type == MsgType::InstanceInfo {
                    Self::InstanceInfo { kind, num, device_num }
                } else {
                    Self::InstanceName { kind, num, device_num }
                }
            }
            MsgType::VfioFile => Self::VfioFile { device_num: u16::from_ne_bytes([payload[0], payload[1]]) },
            MsgType::NumPfDevs => Self::NumPfDevs,
            MsgType::PfDevInfo => Self::PfDevInfo { device_num: u16::from_ne_bytes([payload[0], payload[1]]) },
            MsgType::Unknown | MsgType::Bad => bail!("requests never carry type {msg_type:?}"),
        })
    }

    pub fn msg_type(&self) -> MsgType {
        match self {
            Self::SectionGet { .. } => MsgType::SectionGet,
            Self::SectionPut { .. } => MsgType::SectionPut,
            Self::NumDevices => MsgType::NumDevices,
            Self::DeviceInfo { .. } => MsgType::DeviceInfo,
            Self::DeviceId { .. } => MsgType::DeviceId,
            Self::InstanceInfo { .. } => MsgType::InstanceInfo,
            Self::InstanceName { .. } => MsgType::InstanceName,
            Self::VfioFile { .. } => MsgType::VfioFile,
            Self::NumPfDevs => MsgType::NumPfDevs,
            Self::PfDevInfo { .. } => MsgType::PfDevInfo,
        }
    }

    /// Encodes a full request frame (header + payload), for clients
    /// (`brokerctl`) and tests.
    pub fn encode(&self, version: u16) -> Result<Vec<u8>> {
        let mut payload = Vec::new();
        match self {
            Self::SectionGet { preferred_name } => write_fixed_str(&mut payload, preferred_name, MAX_STRLEN)?,
            Self::SectionPut { name } => write_fixed_str(&mut payload, name, MAX_STRLEN)?,
            Self::NumDevices | Self::NumPfDevs => {}
            Self::DeviceInfo { device_num }
            | Self::DeviceId { device_num }
            | Self::VfioFile { device_num }
            | Self::PfDevInfo { device_num } => payload.extend_from_slice(&device_num.to_ne_bytes()),
            Self::InstanceInfo { kind, num, device_num } | Self::InstanceName { kind, num, device_num } => {
                payload.extend_from_slice(&kind.to_u16().to_ne_bytes());
                payload.extend_from_slice(&num.to_ne_bytes());
                payload.extend_from_slice(&device_num.to_ne_bytes());
            }
        }
        let header = Header {
            len: (HEADER_LEN + payload.len()) as u16,
            version,
            msg_type: self.msg_type() as u16,
            filler: 0,
        };
        let mut out = header.encode().to_vec();
        out.extend(payload);
        Ok(out)
    }
}

#[derive(Debug, Clone, Default)]
pub struct RingInfoWire {
    pub accelid: u16,
    pub bank_number: u16,
    pub is_polled: bool,
    pub core_affinity: u16,
    pub num_concurrent_requests: u16,
    pub ring_tx: u16,
    pub ring_rx: u16,
}

impl From<&Instance> for RingInfoWire {
    fn from(i: &Instance) -> Self {
        Self {
            accelid: i.accelid,
            bank_number: i.bank_number,
            is_polled: i.is_polled,
            core_affinity: i.core_affinity,
            num_concurrent_requests: i.num_concurrent_requests,
            ring_tx: i.ring_tx,
            ring_rx: i.ring_rx,
        }
    }
}

impl RingInfoWire {
    fn encode(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.accelid.to_ne_bytes());
        out.extend_from_slice(&self.bank_number.to_ne_bytes());
        out.extend_from_slice(&(self.is_polled as u16).to_ne_bytes());
        out.extend_from_slice(&self.core_affinity.to_ne_bytes());
        out.extend_from_slice(&self.num_concurrent_requests.to_ne_bytes());
        out.extend_from_slice(&self.ring_tx.to_ne_bytes());
        out.extend_from_slice(&self.ring_rx.to_ne_bytes());
    }
}

#[derive(Debug, Clone, Default)]
pub struct DeviceInfoPayload {
    pub device_num: u16,
    pub device_type: u16,
    pub device_pci_id: u16,
    pub capability_mask: u32,
    pub extended_capabilities: u32,
    pub max_banks: u16,
    pub max_rings_per_bank: u16,
    pub arb_mask: u16,
    pub services: u16,
    pub pkg_id: i16,
    pub node_id: u16,
    pub num_cy_instances: u16,
    pub num_dc_instances: u16,
    pub device_name: String,
}

#[derive(Debug, Clone, Default)]
pub struct PfInfoWire {
    pub pkg_id: u16,
    pub bdf: String,
    pub num_vfs: u16,
}

#[derive(Debug, Clone)]
pub enum Response {
    SectionName(String),
    Empty,
    NumDevices(u16),
    DeviceInfo(DeviceInfoPayload),
    DeviceId(String),
    /// `fd` is this server process's own raw file descriptor number,
    /// not a handle valid in the client's process — this crate does
    /// not perform an `SCM_RIGHTS` ancillary-data transfer over the
    /// Unix socket, so the numeric value is meaningless to the
    /// receiver. `path` is the VFIO group device node the client must
    /// reopen itself (e.g. `/dev/vfio/12`); spec.md §9 requires
    /// implementations that cannot transfer handles over the local
    /// socket to document that the path alone is sufficient, since the
    /// client reopens it.
    VfioFile { fd: i16, path: String },
    InstanceInfoDc(RingInfoWire),
    InstanceInfoCy { sym: RingInfoWire, asym: RingInfoWire, is_polled: bool },
    InstanceInfoSingle(RingInfoWire),
    InstanceName(String),
    NumPfDevs(u16),
    PfDevInfo(PfInfoWire),
    Unknown,
    Bad(String),
}

impl Response {
    fn msg_type(&self) -> MsgType {
        match self {
            Self::SectionName(_) => MsgType::SectionGet,
            Self::Empty => MsgType::SectionPut,
            Self::NumDevices(_) => MsgType::NumDevices,
            Self::DeviceInfo(_) => MsgType::DeviceInfo,
            Self::DeviceId(_) => MsgType::DeviceId,
            Self::VfioFile { .. } => MsgType::VfioFile,
            Self::InstanceInfoDc(_) | Self::InstanceInfoCy { .. } | Self::InstanceInfoSingle(_) => {
                MsgType::InstanceInfo
            }
            Self::InstanceName(_) => MsgType::InstanceName,
            Self::NumPfDevs(_) => MsgType::NumPfDevs,
            Self::PfDevInfo(_) => MsgType::PfDevInfo,
            Self::Unknown => MsgType::Unknown,
            Self::Bad(_) => MsgType::Bad,
        }
    }

    /// Encodes the full response frame, always stamping the server's
    /// own protocol version (spec.md §4.7: "responses copy the
    /// server's own version, not the request's").
    pub fn encode(&self, server_version: u16) -> Result<Vec<u8>> {
        let mut payload = Vec::new();
        match self {
            Self::SectionName(name) | Self::InstanceName(name) => {
                write_fixed_str(&mut payload, name, MAX_STRLEN)?
            }
            Self::Empty | Self::Unknown => {}
            Self::NumDevices(n) | Self::NumPfDevs(n) => payload.extend_from_slice(&n.to_ne_bytes()),
            Self::DeviceInfo(d) => {
                payload.extend_from_slice(&d.device_num.to_ne_bytes());
                payload.extend_from_slice(&d.device_type.to_ne_bytes());
                payload.extend_from_slice(&d.device_pci_id.to_ne_bytes());
                payload.extend_from_slice(&d.capability_mask.to_ne_bytes());
                payload.extend_from_slice(&d.extended_capabilities.to_ne_bytes());
                payload.extend_from_slice(&d.max_banks.to_ne_bytes());
                payload.extend_from_slice(&d.max_rings_per_bank.to_ne_bytes());
                payload.extend_from_slice(&d.arb_mask.to_ne_bytes());
                payload.extend_from_slice(&d.services.to_ne_bytes());
                payload.extend_from_slice(&d.pkg_id.to_ne_bytes());
                payload.extend_from_slice(&d.node_id.to_ne_bytes());
                payload.extend_from_slice(&d.num_cy_instances.to_ne_bytes());
                payload.extend_from_slice(&d.num_dc_instances.to_ne_bytes());
                write_fixed_str(&mut payload, &d.device_name, crate::model::DEVICE_NAME_SIZE)?;
            }
            Self::DeviceId(id) => write_fixed_str(&mut payload, id, MAX_STRLEN)?,
            Self::VfioFile { fd, path } => {
                payload.extend_from_slice(&fd.to_ne_bytes());
                write_fixed_str(&mut payload, path, MAX_STRLEN)?;
            }
            Self::InstanceInfoDc(ring) | Self::InstanceInfoSingle(ring) => ring.encode(&mut payload),
            Self::InstanceInfoCy { sym, asym, is_polled } => {
                sym.encode(&mut payload);
                asym.encode(&mut payload);
                payload.extend_from_slice(&(*is_polled as i32).to_ne_bytes());
            }
            Self::PfDevInfo(pf) => {
                payload.extend_from_slice(&pf.pkg_id.to_ne_bytes());
                write_fixed_str(&mut payload, &pf.bdf, MAX_STRLEN)?;
                payload.extend_from_slice(&pf.num_vfs.to_ne_bytes());
            }
            Self::Bad(msg) => write_fixed_str(&mut payload, msg, MAX_STRLEN)?,
        }
        let header = Header {
            len: (HEADER_LEN + payload.len()) as u16,
            version: server_version,
            msg_type: self.msg_type() as u16,
            filler: 0,
        };
        let mut out = header.encode().to_vec();
        out.extend(payload);
        Ok(out)
    }

    /// Decodes a response payload. `requested_kind` disambiguates
    /// `INSTANCE_INFO`'s three wire shapes (dc/single/cy), which are
    /// otherwise indistinguishable without knowing what the matching
    /// request asked for — callers (the CLI, integration tests) always
    /// have it on hand since they sent that request themselves.
    pub fn decode(msg_type: MsgType, payload: &[u8], requested_kind: Option<ServKindWire>) -> Result<Self> {
        fn read_ring(bytes: &[u8]) -> RingInfoWire {
            RingInfoWire {
                accelid: u16::from_ne_bytes([bytes[0], bytes[1]]),
                bank_number: u16::from_ne_bytes([bytes[2], bytes[3]]),
                is_polled: u16::from_ne_bytes([bytes[4], bytes[5]]) != 0,
                core_affinity: u16::from_ne_bytes([bytes[6], bytes[7]]),
                num_concurrent_requests: u16::from_ne_bytes([bytes[8], bytes[9]]),
                ring_tx: u16::from_ne_bytes([bytes[10], bytes[11]]),
                ring_rx: u16::from_ne_bytes([bytes[12], bytes[13]]),
            }
        }
        const RING_LEN: usize = 14;

        Ok(match msg_type {
            MsgType::SectionGet => Self::SectionName(read_fixed_str(payload)?),
            MsgType::SectionPut => Self::Empty,
            MsgType::NumDevices => Self::NumDevices(u16::from_ne_bytes([payload[0], payload[1]])),
            MsgType::DeviceInfo => {
                const FIXED_FIELDS_LEN: usize = 30;
                Self::DeviceInfo(DeviceInfoPayload {
                    device_num: u16::from_ne_bytes([payload[0], payload[1]]),
                    device_type: u16::from_ne_bytes([payload[2], payload[3]]),
                    device_pci_id: u16::from_ne_bytes([payload[4], payload[5]]),
                    capability_mask: u32::from_ne_bytes(payload[6..10].try_into().unwrap()),
                    extended_capabilities: u32::from_ne_bytes(payload[10..14].try_into().unwrap()),
                    max_banks: u16::from_ne_bytes([payload[14], payload[15]]),
                    max_rings_per_bank: u16::from_ne_bytes([payload[16], payload[17]]),
                    arb_mask: u16::from_ne_bytes([payload[18], payload[19]]),
                    services: u16::from_ne_bytes([payload[20], payload[21]]),
                    pkg_id: i16::from_ne_bytes([payload[22], payload[23]]),
                    node_id: u16::from_ne_bytes([payload[24], payload[25]]),
                    num_cy_instances: u16::from_ne_bytes([payload[26], payload[27]]),
                    num_dc_instances: u16::from_ne_bytes([payload[28], payload[29]]),
                    device_name: read_fixed_str(&payload[FIXED_FIELDS_LEN..])?,
                })
            }
            MsgType::DeviceId => Self::DeviceId(read_fixed_str(payload)?),
            MsgType::VfioFile => Self::VfioFile {
                fd: i16::from_ne_bytes([payload[0], payload[1]]),
                path: read_fixed_str(&payload[2..])?,
            },
            MsgType::InstanceInfo => match requested_kind.context("InstanceInfo needs a kind hint to decode")? {
                ServKindWire::Dc => Self::InstanceInfoDc(read_ring(payload)),
                ServKindWire::Sym | ServKindWire::Asym => Self::InstanceInfoSingle(read_ring(payload)),
                ServKindWire::Cy => Self::InstanceInfoCy {
                    sym: read_ring(&payload[0..RING_LEN]),
                    asym: read_ring(&payload[RING_LEN..2 * RING_LEN]),
                    is_polled: i32::from_ne_bytes(payload[2 * RING_LEN..2 * RING_LEN + 4].try_into().unwrap()) != 0,
                },
            },
            MsgType::InstanceName => Self::InstanceName(read_fixed_str(payload)?),
            MsgType::NumPfDevs => Self::NumPfDevs(u16::from_ne_bytes([payload[0], payload[1]])),
            MsgType::PfDevInfo => Self::PfDevInfo(PfInfoWire {
                pkg_id: u16::from_ne_bytes([payload[0], payload[1]]),
                bdf: read_fixed_str(&payload[2..])?,
                num_vfs: u16::from_ne_bytes(
                    payload[2 + MAX_STRLEN..2 + MAX_STRLEN + 2].try_into().unwrap(),
                ),
            }),
            MsgType::Unknown => Self::Unknown,
            MsgType::Bad => Self::Bad(read_fixed_str(payload)?),
        })
    }
}

pub fn instance_kind_for(device_services: u16) -> ServiceKind {
    // Used by INSTANCE_NAME's cy handling: asym-name when the device's
    // services == {asym} or {asym, dc}.
    if device_services & ServiceKind::Sym.bit() == 0 && device_services & ServiceKind::Asym.bit() != 0 {
        ServiceKind::Asym
    } else {
        ServiceKind::Sym
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_roundtrips() {
        let h = Header { len: 42, version: 0x0200, msg_type: 3, filler: 0 };
        let bytes = h.encode();
        assert_eq!(Header::decode(&bytes).unwrap(), h);
    }

    #[test]
    fn section_get_request_roundtrips() {
        let req = Request::SectionGet { preferred_name: "app".to_string() };
        let bytes = req.encode(0x0200).unwrap();
        let header = Header::decode(&bytes).unwrap();
        assert_eq!(header.len as usize, HEADER_LEN + MAX_STRLEN);
        let decoded = Request::decode(MsgType::SectionGet, &bytes[HEADER_LEN..]).unwrap();
        match decoded {
            Request::SectionGet { preferred_name } => assert_eq!(preferred_name, "app"),
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn fixed_str_rejects_truncation() {
        let long = "x".repeat(300);
        let mut buf = Vec::new();
        assert!(write_fixed_str(&mut buf, &long, MAX_STRLEN).is_err());
    }

    #[test]
    fn bad_response_carries_diagnostic_text() {
        let resp = Response::Bad("No section available".to_string());
        let bytes = resp.encode(0x0200).unwrap();
        let header = Header::decode(&bytes).unwrap();
        assert_eq!(header.msg_type, MsgType::Bad as u16);
        let text = read_fixed_str(&bytes[HEADER_LEN..]).unwrap();
        assert_eq!(text, "No section available");
    }

    #[test]
    fn device_info_response_roundtrips() {
        let payload = DeviceInfoPayload {
            device_num: 3,
            device_type: 0x4941,
            device_pci_id: 0x4941,
            capability_mask: 0b111,
            extended_capabilities: 0,
            max_banks: 4,
            max_rings_per_bank: 2,
            arb_mask: 0xFF,
            services: 6,
            pkg_id: -1,
            node_id: 0,
            num_cy_instances: 2,
            num_dc_instances: 0,
            device_name: "4xxxvf".to_string(),
        };
        let resp = Response::DeviceInfo(payload);
        let bytes = resp.encode(0x0200).unwrap();
        let decoded = Response::decode(MsgType::DeviceInfo, &bytes[HEADER_LEN..], None).unwrap();
        match decoded {
            Response::DeviceInfo(d) => {
                assert_eq!(d.device_num, 3);
                assert_eq!(d.pkg_id, -1);
                assert_eq!(d.device_name, "4xxxvf");
                assert_eq!(d.num_cy_instances, 2);
            }
            other => panic!("wrong variant: {other:?}"),
        }
    }

    #[test]
    fn instance_info_cy_response_roundtrips() {
        let sym = RingInfoWire { accelid: 0, bank_number: 1, is_polled: true, core_affinity: 2, num_concurrent_requests: 512, ring_tx: 0, ring_rx: 1 };
        let asym = RingInfoWire { bank_number: 0, ..sym };
        let resp = Response::InstanceInfoCy { sym, asym, is_polled: true };
        let bytes = resp.encode(0x0200).unwrap();
        let decoded = Response::decode(MsgType::InstanceInfo, &bytes[HEADER_LEN..], Some(ServKindWire::Cy)).unwrap();
        match decoded {
            Response::InstanceInfoCy { sym, asym, is_polled } => {
                assert_eq!(sym.bank_number, 1);
                assert_eq!(asym.bank_number, 0);
                assert!(is_polled);
            }
            other => panic!("wrong variant: {other:?}"),
        }
    }

    #[test]
    fn pf_dev_info_response_roundtrips() {
        let resp = Response::PfDevInfo(PfInfoWire { pkg_id: 0, bdf: "0000:3d:00.0".to_string(), num_vfs: 4 });
        let bytes = resp.encode(0x0200).unwrap();
        let decoded = Response::decode(MsgType::PfDevInfo, &bytes[HEADER_LEN..], None).unwrap();
        match decoded {
            Response::PfDevInfo(pf) => {
                assert_eq!(pf.bdf, "0000:3d:00.0");
                assert_eq!(pf.num_vfs, 4);
            }
            other => panic!("wrong variant: {other:?}"),
        }
    }
}
