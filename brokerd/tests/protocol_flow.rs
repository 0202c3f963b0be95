//! End-to-end exercise of the protocol over a real Unix socket: acquire
//! a section, run info queries, release it, and confirm a disconnect
//! mid-hold releases implicitly (spec.md §8 scenario 6).

use std::sync::Arc;

use brokerd::context::Context;
use brokerd::metrics::Metrics;
use brokerd::model::{Bdf, CyPair, Device, Instance, Section, ServiceKind, VfDescriptor};
use brokerd::pf_topology::PfTable;
use brokerd::protocol::{Header, MsgType, Request, Response, ServKindWire, HEADER_LEN, PROTOCOL_VERSION};
use brokerd::section::SectionRegistry;
use brokerd::server;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;

fn fixture_context() -> Context {
    let vf = VfDescriptor {
        bdf: Bdf::parse("0000:3d:02.0").unwrap(),
        group_path: "/dev/vfio/10".into(),
        group_fd: Some(10),
        device_id: 0x4941,
        numa_node: 0,
    };
    let sym = Instance {
        name: "sym0".into(),
        kind: ServiceKind::Sym,
        accelid: 0,
        bank_number: 1,
        ring_tx: 0,
        ring_rx: 1,
        is_polled: true,
        num_concurrent_requests: 512,
        core_affinity: 1,
    };
    let device = Device {
        vf,
        device_type: 0x4941,
        friendly_name: "4xxxvf".into(),
        max_banks: 4,
        max_rings_per_bank: 2,
        arb_mask: 0xFF,
        accel_capabilities: 0b111,
        extended_capabilities: 0,
        services: ServiceKind::Sym.bit(),
        pkg_id: 3,
        num_sym_inst: 1,
        num_asym_inst: 0,
        num_dc_inst: 0,
        num_cy_inst: 1,
        dc_instances: vec![],
        cy_instances: vec![CyPair { sym: Some(sym), asym: None }],
    };
    let section = Section { name: "SSL_INT_0".into(), base_name: "SSL".into(), assigned_tid: None, devices: vec![device] };
    Context { registry: SectionRegistry::new(vec![section]), pf_table: PfTable::new() }
}

async fn spawn_server() -> std::path::PathBuf {
    let dir = tempfile::tempdir().unwrap();
    let socket_path = dir.path().join("broker.sock");
    let ctx = Arc::new(fixture_context());
    let metrics = Arc::new(Metrics::new());

    let run_path = socket_path.clone();
    tokio::spawn(async move {
        let _ = server::run(&run_path, ctx, metrics).await;
    });
    for _ in 0..50 {
        if socket_path.exists() {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    // Leak the tempdir so the socket outlives this function; the OS
    // cleans up the process's tmp files on exit.
    std::mem::forget(dir);
    socket_path
}

async fn roundtrip(stream: &mut UnixStream, request: &Request, requested_kind: Option<ServKindWire>) -> Response {
    let frame = request.encode(PROTOCOL_VERSION).unwrap();
    stream.write_all(&frame).await.unwrap();
    let mut header_buf = [0u8; HEADER_LEN];
    stream.read_exact(&mut header_buf).await.unwrap();
    let header = Header::decode(&header_buf).unwrap();
    let mut payload = vec![0u8; (header.len as usize) - HEADER_LEN];
    stream.read_exact(&mut payload).await.unwrap();
    let msg_type = MsgType::from_u16(header.msg_type).unwrap();
    Response::decode(msg_type, &payload, requested_kind).unwrap()
}

#[tokio::test]
async fn full_acquire_query_release_cycle_over_a_real_socket() {
    let socket_path = spawn_server().await;
    let mut stream = UnixStream::connect(&socket_path).await.unwrap();

    let resp = roundtrip(&mut stream, &Request::NumDevices, None).await;
    assert!(matches!(resp, Response::Bad(_)), "queries before SECTION_GET must be rejected");

    let resp = roundtrip(&mut stream, &Request::SectionGet { preferred_name: String::new() }, None).await;
    let held_name = match resp {
        Response::SectionName(n) => n,
        other => panic!("unexpected response: {other:?}"),
    };
    assert_eq!(held_name, "SSL_INT_0");

    let resp = roundtrip(&mut stream, &Request::NumDevices, None).await;
    assert!(matches!(resp, Response::NumDevices(1)));

    let resp = roundtrip(
        &mut stream,
        &Request::InstanceInfo { kind: ServKindWire::Sym, num: 0, device_num: 0 },
        Some(ServKindWire::Sym),
    )
    .await;
    match resp {
        Response::InstanceInfoSingle(ring) => assert_eq!(ring.core_affinity, 1),
        other => panic!("unexpected response: {other:?}"),
    }

    let resp = roundtrip(&mut stream, &Request::DeviceId { device_num: 0 }, None).await;
    assert!(matches!(resp, Response::DeviceId(ref s) if s == "0000:3d:02.0"));

    let resp = roundtrip(&mut stream, &Request::SectionPut { name: held_name }, None).await;
    assert!(matches!(resp, Response::Empty));
}

#[tokio::test]
async fn second_client_blocks_until_the_first_releases() {
    let socket_path = spawn_server().await;

    let mut first = UnixStream::connect(&socket_path).await.unwrap();
    let resp = roundtrip(&mut first, &Request::SectionGet { preferred_name: String::new() }, None).await;
    assert!(matches!(resp, Response::SectionName(_)));

    let mut second = UnixStream::connect(&socket_path).await.unwrap();
    let resp = roundtrip(&mut second, &Request::SectionGet { preferred_name: String::new() }, None).await;
    assert!(matches!(resp, Response::Bad(_)), "the only section is already held");

    let resp = roundtrip(&mut first, &Request::SectionPut { name: "SSL_INT_0".to_string() }, None).await;
    assert!(matches!(resp, Response::Empty));

    let resp = roundtrip(&mut second, &Request::SectionGet { preferred_name: String::new() }, None).await;
    assert!(matches!(resp, Response::SectionName(_)), "section must be available once released");
}

#[tokio::test]
async fn disconnecting_while_held_releases_the_section() {
    let socket_path = spawn_server().await;

    {
        let mut stream = UnixStream::connect(&socket_path).await.unwrap();
        let resp = roundtrip(&mut stream, &Request::SectionGet { preferred_name: String::new() }, None).await;
        assert!(matches!(resp, Response::SectionName(_)));
    }
    // Stream dropped without a SECTION_PUT; give the server task a moment to notice EOF.
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;

    let mut stream2 = UnixStream::connect(&socket_path).await.unwrap();
    let resp = roundtrip(&mut stream2, &Request::SectionGet { preferred_name: String::new() }, None).await;
    assert!(matches!(resp, Response::SectionName(_)), "section should have been released on disconnect");
}
