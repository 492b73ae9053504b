//! The four protocol-specific traffic forwarders a proxy node runs, and the
//! internal observation event they share (spec §4.8).

pub mod event;
pub mod grpc;
pub mod http;
pub mod kafka;
pub mod tcp;
mod tee;

pub use event::ProxyEvent;
pub use grpc::GrpcProxy;
pub use http::HttpReverseProxy;
pub use kafka::KafkaRewriter;
pub use tcp::TcpRelay;

use rig_domain::Protocol;
use tokio::net::TcpListener;
use tokio::sync::mpsc::UnboundedSender;
use tokio_util::sync::CancellationToken;

use rig_common::error::Result;

/// Runs the protocol-appropriate forwarder for one proxy ingress until
/// `cancel` fires or the listener errors.
pub async fn run_forwarder(
    protocol: Protocol,
    listener: TcpListener,
    target_host: String,
    target_port: u16,
    proxy_host: String,
    proxy_port: u16,
    cancel: CancellationToken,
    sink: UnboundedSender<ProxyEvent>,
) -> Result<()> {
    match protocol {
        Protocol::Tcp => {
            TcpRelay {
                target_host,
                target_port,
            }
            .run(listener, cancel, sink)
            .await
        }
        Protocol::Http => {
            HttpReverseProxy {
                target_host,
                target_port,
            }
            .run(listener, cancel, sink)
            .await
        }
        Protocol::Grpc => {
            GrpcProxy {
                target_host,
                target_port,
            }
            .run(listener, cancel, sink)
            .await
        }
        Protocol::Kafka => {
            KafkaRewriter {
                target_host,
                target_port,
                proxy_host,
                proxy_port,
            }
            .run(listener, cancel, sink)
            .await
        }
    }
}
