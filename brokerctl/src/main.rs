use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;

use brokerd::config::DEFAULT_SOCKET_PATH;
use brokerd::protocol::{self, Header, MsgType, Request, Response, ServKindWire, HEADER_LEN, PROTOCOL_VERSION};

#[derive(Parser, Debug)]
#[command(name = "brokerctl")]
#[command(about = "Query a running broker daemon over its local socket")]
struct Args {
    #[arg(long, value_name = "PATH", default_value = DEFAULT_SOCKET_PATH)]
    socket: PathBuf,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Acquire a section, optionally preferring one by name.
    SectionGet {
        #[arg(long, default_value = "")]
        name: String,
    },
    /// Release a held section.
    SectionPut { name: String },
    /// Number of devices in the held section.
    NumDevices,
    /// Static info about a device in the held section.
    DeviceInfo { device_num: u16 },
    /// The logical id string for a device.
    DeviceId { device_num: u16 },
    /// Ring placement for one of a device's instances.
    InstanceInfo {
        #[arg(value_enum)]
        kind: ServiceKindArg,
        num: u16,
        device_num: u16,
    },
    /// The logical name for one of a device's instances.
    InstanceName {
        #[arg(value_enum)]
        kind: ServiceKindArg,
        num: u16,
        device_num: u16,
    },
    /// VFIO group file descriptor path for a device.
    VfioFile { device_num: u16 },
    /// Number of physical functions backing the held section's devices.
    NumPfDevs,
    /// Info about a physical function by index.
    PfDevInfo { device_num: u16 },
}

#[derive(Clone, Copy, Debug, clap::ValueEnum)]
enum ServiceKindArg {
    Dc,
    Sym,
    Asym,
    Cy,
}

impl From<ServiceKindArg> for ServKindWire {
    fn from(v: ServiceKindArg) -> Self {
        match v {
            ServiceKindArg::Dc => Self::Dc,
            ServiceKindArg::Sym => Self::Sym,
            ServiceKindArg::Asym => Self::Asym,
            ServiceKindArg::Cy => Self::Cy,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let (request, requested_kind) = match args.command {
        Command::SectionGet { name } => (Request::SectionGet { preferred_name: name }, None),
        Command::SectionPut { name } => (Request::SectionPut { name }, None),
        Command::NumDevices => (Request::NumDevices, None),
        Command::DeviceInfo { device_num } => (Request::DeviceInfo { device_num }, None),
        Command::DeviceId { device_num } => (Request::DeviceId { device_num }, None),
        Command::InstanceInfo { kind, num, device_num } => {
            let kind: ServKindWire = kind.into();
            (Request::InstanceInfo { kind, num, device_num }, Some(kind))
        }
        Command::InstanceName { kind, num, device_num } => {
            (Request::InstanceName { kind: kind.into(), num, device_num }, None)
        }
        Command::VfioFile { device_num } => (Request::VfioFile { device_num }, None),
        Command::NumPfDevs => (Request::NumPfDevs, None),
        Command::PfDevInfo { device_num } => (Request::PfDevInfo { device_num }, None),
    };

    let response = send(&args.socket, &request, requested_kind).await?;
    print_response(&response);
    if matches!(response, Response::Bad(_)) {
        std::process::exit(1);
    }
    Ok(())
}

async fn send(socket_path: &std::path::Path, request: &Request, requested_kind: Option<ServKindWire>) -> Result<Response> {
    let mut stream = UnixStream::connect(socket_path)
        .await
        .with_context(|| format!("connecting to {socket_path:?}"))?;

    let frame = request.encode(PROTOCOL_VERSION)?;
    stream.write_all(&frame).await.context("sending request")?;

    let mut header_buf = [0u8; HEADER_LEN];
    stream.read_exact(&mut header_buf).await.context("reading response header")?;
    let header = Header::decode(&header_buf)?;
    let payload_len = (header.len as usize).saturating_sub(HEADER_LEN);
    let mut payload = vec![0u8; payload_len];
    stream.read_exact(&mut payload).await.context("reading response payload")?;

    let msg_type = MsgType::from_u16(header.msg_type)
        .with_context(|| format!("unrecognized response message type {}", header.msg_type))?;
    if !matches!(msg_type, MsgType::Bad) && msg_type != request.msg_type() {
        bail!("response type {msg_type:?} did not match request type {:?}", request.msg_type());
    }
    protocol::Response::decode(msg_type, &payload, requested_kind)
}

fn print_response(response: &Response) {
    match response {
        Response::SectionName(name) => println!("section: {name}"),
        Response::Empty => println!("ok"),
        Response::NumDevices(n) => println!("num_devices: {n}"),
        Response::DeviceInfo(d) => {
            println!("device_num: {}", d.device_num);
            println!("device_type: 0x{:04x}", d.device_type);
            println!("device_pci_id: 0x{:04x}", d.device_pci_id);
            println!("capability_mask: 0x{:08x}", d.capability_mask);
            println!("extended_capabilities: 0x{:08x}", d.extended_capabilities);
            println!("max_banks: {}", d.max_banks);
            println!("max_rings_per_bank: {}", d.max_rings_per_bank);
            println!("arb_mask: 0x{:04x}", d.arb_mask);
            println!("services: 0x{:04x}", d.services);
            println!("pkg_id: {}", d.pkg_id);
            println!("node_id: {}", d.node_id);
            println!("num_cy_instances: {}", d.num_cy_instances);
            println!("num_dc_instances: {}", d.num_dc_instances);
            println!("device_name: {}", d.device_name);
        }
        Response::DeviceId(id) => println!("device_id: {id}"),
        Response::VfioFile { fd, path } => println!("fd: {fd}\npath: {path}"),
        Response::InstanceInfoDc(r) | Response::InstanceInfoSingle(r) => print_ring(r),
        Response::InstanceInfoCy { sym, asym, is_polled } => {
            println!("is_polled: {is_polled}");
            println!("sym:");
            print_ring(sym);
            println!("asym:");
            print_ring(asym);
        }
        Response::InstanceName(name) => println!("instance_name: {name}"),
        Response::NumPfDevs(n) => println!("num_pf_devs: {n}"),
        Response::PfDevInfo(pf) => {
            println!("pkg_id: {}", pf.pkg_id);
            println!("bdf: {}", pf.bdf);
            println!("num_vfs: {}", pf.num_vfs);
        }
        Response::Unknown => println!("unknown message type"),
        Response::Bad(msg) => println!("error: {msg}"),
    }
}

fn print_ring(ring: &protocol::wire::RingInfoWire) {
    println!("  accelid: {}", ring.accelid);
    println!("  bank_number: {}", ring.bank_number);
    println!("  is_polled: {}", ring.is_polled);
    println!("  core_affinity: {}", ring.core_affinity);
    println!("  num_concurrent_requests: {}", ring.num_concurrent_requests);
    println!("  ring_tx: {}", ring.ring_tx);
    println!("  ring_rx: {}", ring.ring_rx);
}
