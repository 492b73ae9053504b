//! TCP relay forwarder: plain byte-for-byte copy in both directions
//! (spec §4.8).

use std::time::Instant;

use tokio::io::{self, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc::UnboundedSender;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use rig_common::error::{Error, Result};

use crate::event::ProxyEvent;

const DIAL_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(5);

pub struct TcpRelay {
    pub target_host: String,
    pub target_port: u16,
}

impl TcpRelay {
    pub async fn run(
        &self,
        listener: TcpListener,
        cancel: CancellationToken,
        sink: UnboundedSender<ProxyEvent>,
    ) -> Result<()> {
        loop {
            let accepted = tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                accepted = listener.accept() => accepted,
            };
            let (client, _addr) = accepted.map_err(|e| Error::Internal(e.into()))?;

            let target_host = self.target_host.clone();
            let target_port = self.target_port;
            let child_cancel = cancel.child_token();
            let sink = sink.clone();

            tokio::spawn(async move {
                let _ = sink.send(ProxyEvent::ConnectionOpened);
                if let Err(err) =
                    relay_one(client, &target_host, target_port, child_cancel, &sink).await
                {
                    warn!(error = %err, "tcp relay connection failed");
                }
            });
        }
    }
}

async fn relay_one(
    mut client: TcpStream,
    target_host: &str,
    target_port: u16,
    cancel: CancellationToken,
    sink: &UnboundedSender<ProxyEvent>,
) -> Result<()> {
    let started = Instant::now();
    let mut target = tokio::select! {
        connected = tokio::time::timeout(DIAL_TIMEOUT, TcpStream::connect((target_host, target_port))) => {
            connected.map_err(|_| Error::Timeout(DIAL_TIMEOUT, "tcp dial".into()))?
                .map_err(|e| Error::Internal(e.into()))?
        }
        _ = cancel.cancelled() => return Ok(()),
    };

    let (mut client_rd, mut client_wr) = client.split();
    let (mut target_rd, mut target_wr) = target.split();

    let c2t = io::copy(&mut client_rd, &mut target_wr);
    let t2c = io::copy(&mut target_rd, &mut client_wr);

    let (bytes_in, bytes_out) = tokio::select! {
        _ = cancel.cancelled() => (0, 0),
        result = futures::future::join(c2t, t2c) => {
            let (c2t_result, t2c_result) = result;
            (c2t_result.unwrap_or(0), t2c_result.unwrap_or(0))
        }
    };

    let _ = client_wr.shutdown().await;
    let _ = target_wr.shutdown().await;

    let _ = sink.send(ProxyEvent::ConnectionClosed {
        bytes_in,
        bytes_out,
        duration_ms: started.elapsed().as_millis() as u64,
    });
    Ok(())
}
