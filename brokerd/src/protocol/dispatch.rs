//! Protocol Server request dispatcher: the INITIAL/HELD state machine
//! and per-message handlers from spec.md §4.7.

use crate::model::ServiceKind;
use crate::pf_topology::PfTable;
use crate::section::SectionRegistry;

use super::wire::{instance_kind_for, DeviceInfoPayload, PfInfoWire, RingInfoWire, Request, Response};
use super::{Header, MsgType, ServKindWire, HEADER_LEN};

/// Per-connection state: a client holds at most one section at a time.
#[derive(Debug, Default)]
pub struct ClientState {
    held: Option<(usize, String)>,
}

impl ClientState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_held(&self) -> bool {
        self.held.is_some()
    }

    /// The `(index, name)` of the section this client currently holds,
    /// if any. Used by the server loop to release on disconnect.
    pub fn held(&self) -> Option<(usize, String)> {
        self.held.clone()
    }
}

/// Handles one request, mutating `state` as the hold/release cycle
/// requires. `tid` identifies the calling client (its connection
/// task id stands in for the original's pthread id).
pub fn handle_message(
    header: Header,
    payload: &[u8],
    state: &mut ClientState,
    registry: &SectionRegistry,
    pf_table: &PfTable,
    tid: u64,
    server_version: u16,
) -> Response {
    if header.version != server_version {
        return Response::Bad(format!(
            "{}.{} {}.{}",
            server_version >> 8,
            server_version & 0xFF,
            header.version >> 8,
            header.version & 0xFF
        ));
    }

    let Some(msg_type) = MsgType::from_u16(header.msg_type) else {
        return Response::Unknown;
    };

    let Some(expected) = Request::expected_payload_len(msg_type) else {
        return Response::Unknown;
    };
    if header.len as usize != HEADER_LEN + expected {
        return Response::Bad("Inconsistent length".to_string());
    }

    let request = match Request::decode(msg_type, payload) {
        Ok(r) => r,
        Err(e) => return Response::Bad(e.to_string()),
    };

    match request {
        Request::SectionGet { preferred_name } => handle_section_get(&preferred_name, state, registry, tid),
        Request::SectionPut { name } => handle_section_put(&name, state, registry, tid),
        _ if !state.is_held() => Response::Bad("Invalid index".to_string()),
        Request::NumDevices => {
            let (index, _) = state.held.as_ref().unwrap();
            registry.with_section(*index, |section| Response::NumDevices(section.devices.len() as u16)).unwrap()
        }
        Request::DeviceInfo { device_num } => handle_device_info(device_num, state, registry),
        Request::DeviceId { device_num } => handle_device_id(device_num, state, registry),
        Request::VfioFile { device_num } => handle_vfio_file(device_num, state, registry),
        Request::InstanceInfo { kind, num, device_num } => {
            handle_instance_info(kind, num, device_num, state, registry)
        }
        Request::InstanceName { kind, num, device_num } => {
            handle_instance_name(kind, num, device_num, state, registry)
        }
        Request::NumPfDevs => Response::NumPfDevs(pf_table.len() as u16),
        Request::PfDevInfo { device_num } => handle_pf_dev_info(device_num, pf_table, registry),
    }
}

fn handle_section_get(preferred_name: &str, state: &mut ClientState, registry: &SectionRegistry, tid: u64) -> Response {
    if state.is_held() {
        return Response::Bad("Section already allocated".to_string());
    }
    match registry.acquire_named(tid, Some(preferred_name)) {
        Some((index, name)) => {
            state.held = Some((index, name.clone()));
            Response::SectionName(name)
        }
        None => Response::Bad("No section available".to_string()),
    }
}

fn handle_section_put(name: &str, state: &mut ClientState, registry: &SectionRegistry, tid: u64) -> Response {
    let Some((index, held_name)) = state.held.clone() else {
        return Response::Bad("not holding a section".to_string());
    };
    if held_name != name {
        return Response::Bad("section name mismatch".to_string());
    }
    match registry.release(index, tid, &held_name) {
        Ok(()) => {
            state.held = None;
            Response::Empty
        }
        Err(e) => Response::Bad(format!("{e:?}")),
    }
}

fn handle_device_info(device_num: u16, state: &ClientState, registry: &SectionRegistry) -> Response {
    let (index, _) = state.held.as_ref().unwrap();
    registry
        .with_section(*index, |section| {
            let Some(d) = section.devices.get(device_num as usize) else {
                return Response::Bad("Invalid index".to_string());
            };
            Response::DeviceInfo(DeviceInfoPayload {
                device_num,
                device_type: d.device_type,
                device_pci_id: d.vf.device_id,
                capability_mask: d.accel_capabilities as u32,
                extended_capabilities: d.extended_capabilities as u32,
                max_banks: d.max_banks,
                max_rings_per_bank: d.max_rings_per_bank,
                arb_mask: d.arb_mask,
                services: d.services,
                pkg_id: d.pkg_id as i16,
                node_id: d.vf.numa_node as u16,
                num_cy_instances: d.num_cy_inst as u16,
                num_dc_instances: d.num_dc_inst as u16,
                device_name: d.friendly_name.clone(),
            })
        })
        .unwrap()
}

fn handle_device_id(device_num: u16, state: &ClientState, registry: &SectionRegistry) -> Response {
    let (index, _) = state.held.as_ref().unwrap();
    registry
        .with_section(*index, |section| match section.devices.get(device_num as usize) {
            Some(d) => Response::DeviceId(d.vf.bdf.to_string()),
            None => Response::Bad("Invalid index".to_string()),
        })
        .unwrap()
}

fn handle_vfio_file(device_num: u16, state: &ClientState, registry: &SectionRegistry) -> Response {
    let (index, _) = state.held.as_ref().unwrap();
    registry
        .with_section(*index, |section| match section.devices.get(device_num as usize) {
            Some(d) => Response::VfioFile {
                fd: d.vf.group_fd.map(|fd| fd as i16).unwrap_or(-1),
                path: d.vf.group_path.to_string_lossy().into_owned(),
            },
            None => Response::Bad("Invalid index".to_string()),
        })
        .unwrap()
}

fn handle_instance_info(
    kind: ServKindWire,
    num: u16,
    device_num: u16,
    state: &ClientState,
    registry: &SectionRegistry,
) -> Response {
    let (index, _) = state.held.as_ref().unwrap();
    registry
        .with_section(*index, |section| {
            let Some(d) = section.devices.get(device_num as usize) else {
                return Response::Bad("Invalid index".to_string());
            };
            let num = num as usize;
            match kind {
                ServKindWire::Dc => match d.dc_instances.get(num) {
                    Some(inst) => Response::InstanceInfoDc(RingInfoWire::from(inst)),
                    None => Response::Bad("Invalid index".to_string()),
                },
                ServKindWire::Sym => match d.cy_instances.get(num).and_then(|p| p.sym.as_ref()) {
                    Some(inst) => Response::InstanceInfoSingle(RingInfoWire::from(inst)),
                    None => Response::Bad("Invalid index".to_string()),
                },
                ServKindWire::Asym => match d.cy_instances.get(num).and_then(|p| p.asym.as_ref()) {
                    Some(inst) => Response::InstanceInfoSingle(RingInfoWire::from(inst)),
                    None => Response::Bad("Invalid index".to_string()),
                },
                ServKindWire::Cy => match d.cy_instances.get(num) {
                    Some(pair) if pair.sym.is_some() && pair.asym.is_some() => Response::InstanceInfoCy {
                        sym: RingInfoWire::from(pair.sym.as_ref().unwrap()),
                        asym: RingInfoWire::from(pair.asym.as_ref().unwrap()),
                        is_polled: pair.sym.as_ref().unwrap().is_polled,
                    },
                    _ => Response::Bad("Invalid index".to_string()),
                },
            }
        })
        .unwrap()
}

fn handle_instance_name(
    kind: ServKindWire,
    num: u16,
    device_num: u16,
    state: &ClientState,
    registry: &SectionRegistry,
) -> Response {
    let (index, _) = state.held.as_ref().unwrap();
    registry
        .with_section(*index, |section| {
            let Some(d) = section.devices.get(device_num as usize) else {
                return Response::Bad("Invalid index".to_string());
            };
            let num = num as usize;
            let name = match kind {
                ServKindWire::Dc => d.dc_instances.get(num).map(|i| i.name.clone()),
                ServKindWire::Sym => d.cy_instances.get(num).and_then(|p| p.sym.as_ref()).map(|i| i.name.clone()),
                ServKindWire::Asym => d.cy_instances.get(num).and_then(|p| p.asym.as_ref()).map(|i| i.name.clone()),
                ServKindWire::Cy => d.cy_instances.get(num).and_then(|pair| {
                    let wanted = instance_kind_for(d.services);
                    let inst = if wanted == ServiceKind::Asym { pair.asym.as_ref() } else { pair.sym.as_ref() };
                    inst.map(|i| i.name.clone())
                }),
            };
            match name {
                Some(n) => Response::InstanceName(n),
                None => Response::Bad("Invalid index".to_string()),
            }
        })
        .unwrap()
}

fn handle_pf_dev_info(device_num: u16, pf_table: &PfTable, registry: &SectionRegistry) -> Response {
    match pf_table.descriptors().get(device_num as usize) {
        Some(pf) => Response::PfDevInfo(PfInfoWire {
            pkg_id: pf.pkg_id,
            bdf: pf.bdf.to_string(),
            num_vfs: registry.count_devices_with_pkg_id(pf.pkg_id),
        }),
        None => Response::Bad("Invalid index".to_string()),
    }
}
