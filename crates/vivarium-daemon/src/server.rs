//! Unix-domain-socket transport.
//!
//! One accept loop, one task per connection. Each connection wraps its
//! stream in the frame codec and processes requests strictly in wire
//! order: the task awaits the dispatch of each message before decoding
//! the next, so synchronous responses are written in request order.
//! Dispatch runs on the blocking pool because handlers may take
//! service locks and perform bounded blocking work.
//!
//! The first frame on a connection fixes its agent id: a client
//! sending id 0 is assigned the next process-wide id, which every
//! response frame carries from then on. Protocol errors (bad magic,
//! oversized payload) close the connection; parse and permission
//! errors never do.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use futures::{SinkExt, StreamExt};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::watch;
use tokio_util::codec::Framed;
use tracing::{debug, error, info, warn};
use vivarium_core::protocol::{FrameCodec, SyscallOp};

use crate::kernel::Kernel;

/// Supervision tick interval.
const TICK_INTERVAL: std::time::Duration = std::time::Duration::from_millis(250);

/// Bind the socket and serve until `shutdown` flips to `true`.
///
/// Removes a stale socket file before binding and removes the socket
/// on clean shutdown.
///
/// # Errors
///
/// Returns an error if the socket cannot be bound.
pub async fn serve(kernel: Arc<Kernel>, mut shutdown: watch::Receiver<bool>) -> Result<()> {
    let socket_path = kernel.config().socket_path.clone();

    if socket_path.exists() {
        std::fs::remove_file(&socket_path).context("failed to remove stale socket")?;
    }
    if let Some(parent) = socket_path.parent() {
        std::fs::create_dir_all(parent).context("failed to create socket directory")?;
    }

    let listener = UnixListener::bind(&socket_path).context("failed to bind Unix socket")?;
    info!("kernel listening on {}", socket_path.display());

    let tick_kernel = Arc::clone(&kernel);
    let mut tick_shutdown = shutdown.clone();
    let ticker = tokio::spawn(async move {
        let mut interval = tokio::time::interval(TICK_INTERVAL);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let kernel = Arc::clone(&tick_kernel);
                    // Reaping can signal and wait on children.
                    let _ = tokio::task::spawn_blocking(move || kernel.tick()).await;
                }
                _ = tick_shutdown.changed() => break,
            }
        }
    });

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, _)) => {
                        let kernel = Arc::clone(&kernel);
                        tokio::spawn(async move {
                            if let Err(e) = handle_connection(kernel, stream).await {
                                debug!("connection ended: {e}");
                            }
                        });
                    }
                    Err(e) => error!("accept failed: {e}"),
                }
            }
            _ = shutdown.changed() => break,
        }
    }

    ticker.abort();
    cleanup_socket(&socket_path);
    Ok(())
}

/// Remove the socket file if present.
pub fn cleanup_socket(path: &Path) {
    if path.exists() {
        if let Err(e) = std::fs::remove_file(path) {
            warn!("failed to remove socket {}: {e}", path.display());
        }
    }
}

async fn handle_connection(kernel: Arc<Kernel>, stream: UnixStream) -> Result<()> {
    let mut framed = Framed::new(stream, FrameCodec::new());
    let mut agent_id = 0u32;

    while let Some(frame) = framed.next().await {
        let mut msg = match frame {
            Ok(msg) => msg,
            Err(e) => {
                // Only protocol errors land here; the connection is
                // unrecoverable.
                warn!("protocol error, closing connection: {e}");
                break;
            }
        };

        if agent_id == 0 {
            agent_id = if msg.agent_id != 0 {
                msg.agent_id
            } else {
                kernel.allocate_agent_id()
            };
            debug!(agent_id, "connection bound to agent id");
        }
        msg.agent_id = agent_id;

        let is_exit = msg.opcode == SyscallOp::Exit as u8;

        let dispatch_kernel = Arc::clone(&kernel);
        let response = tokio::task::spawn_blocking(move || dispatch_kernel.dispatch(&msg))
            .await
            .context("dispatch task panicked")?;

        framed.send(response).await?;

        if is_exit {
            debug!(agent_id, "agent disconnected gracefully");
            break;
        }
    }

    Ok(())
}
