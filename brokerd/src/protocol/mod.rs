//! Protocol Server wire contract (SPEC_FULL.md §4.7–§4.8).

pub mod dispatch;
pub mod wire;

pub use dispatch::{handle_message, ClientState};
pub use wire::{Header, Request, Response};

/// `(major << 8) | minor`, per spec.md §6. This binary implements 2.0.
pub const PROTOCOL_VERSION: u16 = (2 << 8) | 0;

pub const HEADER_LEN: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum MsgType {
    SectionGet = 1,
    SectionPut = 2,
    NumDevices = 3,
    DeviceInfo = 4,
    DeviceId = 5,
    InstanceInfo = 7,
    InstanceName = 8,
    VfioFile = 9,
    NumPfDevs = 10,
    PfDevInfo = 11,
    Unknown = 998,
    Bad = 999,
}

impl MsgType {
    pub fn from_u16(v: u16) -> Option<Self> {
        Some(match v {
            1 => Self::SectionGet,
            2 => Self::SectionPut,
            3 => Self::NumDevices,
            4 => Self::DeviceInfo,
            5 => Self::DeviceId,
            7 => Self::InstanceInfo,
            8 => Self::InstanceName,
            9 => Self::VfioFile,
            10 => Self::NumPfDevs,
            11 => Self::PfDevInfo,
            998 => Self::Unknown,
            999 => Self::Bad,
            _ => return None,
        })
    }
}

/// Wire values for `enum serv_type`: a client selects which instance
/// kind it wants via this bitmask.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServKindWire {
    Dc,
    Sym,
    Asym,
    Cy,
}

impl ServKindWire {
    pub fn from_u16(v: u16) -> Option<Self> {
        Some(match v {
            1 => Self::Dc,
            2 => Self::Sym,
            4 => Self::Asym,
            6 => Self::Cy,
            _ => return None,
        })
    }

    pub fn to_u16(self) -> u16 {
        match self {
            Self::Dc => 1,
            Self::Sym => 2,
            Self::Asym => 4,
            Self::Cy => 6,
        }
    }
}
