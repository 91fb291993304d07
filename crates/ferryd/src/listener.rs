//! Transfer listener: accepts peer connections and hands each one to the
//! inbound handler on its own task.

use std::sync::Arc;

use anyhow::Result;
use tokio::net::TcpListener;
use tokio::sync::broadcast;

use ferry_services::{Accepted, InboundHandler};

pub async fn accept_loop(
    listener: TcpListener,
    handler: Arc<InboundHandler>,
    mut shutdown: broadcast::Receiver<()>,
) -> Result<()> {
    tracing::info!(addr = ?listener.local_addr().ok(), "transfer listener ready");

    loop {
        let (mut stream, remote) = tokio::select! {
            _ = shutdown.recv() => return Ok(()),
            r = listener.accept() => match r {
                Ok(r) => r,
                Err(e) => {
                    tracing::warn!(error = %e, "accept failed");
                    continue;
                }
            },
        };
        if let Err(e) = stream.set_nodelay(true) {
            tracing::debug!(error = %e, "set_nodelay failed");
        }

        let handler = handler.clone();
        tokio::spawn(async move {
            match handler.handle(&mut stream, remote).await {
                Ok(Accepted::Probe) => tracing::trace!(%remote, "answered probe"),
                Ok(Accepted::File { session_id, path }) => {
                    tracing::info!(%remote, %session_id, path = %path.display(), "file received");
                }
                Ok(Accepted::Refused(reason)) => {
                    tracing::info!(%remote, %reason, "refused transfer");
                }
                Err(e) => tracing::warn!(%remote, error = %e, "inbound transfer failed"),
            }
        });
    }
}
