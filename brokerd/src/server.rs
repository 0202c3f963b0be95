//! Unix socket accept loop: one `tokio::spawn` task per connection,
//! sequential request handling within a connection, grounded in the
//! teacher's `runtime/stream_listener.rs` fan-out style (accept loop
//! spawning a task per stream, `log::debug!`/`log::warn!` at the same
//! granularity).

use std::io::ErrorKind;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::{Context as _, Result};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{UnixListener, UnixStream};

use crate::context::Context;
use crate::metrics::Metrics;
use crate::protocol::{self, ClientState, Header, HEADER_LEN};

pub async fn run(socket_path: &std::path::Path, ctx: Arc<Context>, metrics: Arc<Metrics>) -> Result<()> {
    if socket_path.exists() {
        std::fs::remove_file(socket_path)
            .with_context(|| format!("removing stale socket {socket_path:?}"))?;
    }
    if let Some(parent) = socket_path.parent() {
        std::fs::create_dir_all(parent).with_context(|| format!("creating {parent:?}"))?;
    }
    let listener = UnixListener::bind(socket_path)
        .with_context(|| format!("binding unix socket {socket_path:?}"))?;
    log::info!("listening on {socket_path:?}");

    let next_tid = Arc::new(AtomicU64::new(1));

    loop {
        let (stream, _addr) = listener.accept().await.context("accepting connection")?;
        metrics.record_connection();
        let ctx = Arc::clone(&ctx);
        let metrics = Arc::clone(&metrics);
        let tid = next_tid.fetch_add(1, Ordering::Relaxed);
        tokio::spawn(async move {
            if let Err(e) = handle_connection(stream, ctx, Arc::clone(&metrics), tid).await {
                log::debug!("connection {tid} closed: {e:#}");
            }
        });
    }
}

async fn handle_connection(mut stream: UnixStream, ctx: Arc<Context>, metrics: Arc<Metrics>, tid: u64) -> Result<()> {
    let mut state = ClientState::new();

    let result = serve_requests(&mut stream, &ctx, &metrics, tid, &mut state).await;

    // A client that disconnects while holding a section releases it
    // implicitly, per spec.md §5's cancellation policy.
    if let Some((index, name)) = state.held() {
        if ctx.registry.release(index, tid, &name).is_ok() {
            metrics.record_section_released();
        }
        log::warn!("connection {tid} dropped while holding section {index}; released");
    }

    result
}

async fn serve_requests(
    stream: &mut UnixStream,
    ctx: &Context,
    metrics: &Metrics,
    tid: u64,
    state: &mut ClientState,
) -> Result<()> {
    loop {
        let mut header_buf = [0u8; HEADER_LEN];
        match stream.read_exact(&mut header_buf).await {
            Ok(_) => {}
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => return Ok(()),
            Err(e) => return Err(e).context("reading request header"),
        }
        let header = Header::decode(&header_buf)?;
        let payload_len = (header.len as usize).saturating_sub(HEADER_LEN);
        let mut payload = vec![0u8; payload_len];
        stream.read_exact(&mut payload).await.context("reading request payload")?;

        let was_held_before = state.is_held();
        let response = protocol::handle_message(
            header,
            &payload,
            state,
            &ctx.registry,
            &ctx.pf_table,
            tid,
            protocol::PROTOCOL_VERSION,
        );
        let is_bad = matches!(response, protocol::Response::Bad(_));
        metrics.record_dispatch(is_bad);
        if !was_held_before && state.is_held() {
            metrics.record_section_held();
        } else if was_held_before && !state.is_held() {
            metrics.record_section_released();
        }

        log::debug!("connection {tid}: {:?} -> {:?}", header.msg_type, response);

        let out = response.encode(protocol::PROTOCOL_VERSION)?;
        stream.write_all(&out).await.context("writing response")?;
    }
}
