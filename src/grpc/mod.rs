pub mod agent_service;
pub mod connection;
pub mod convert;
pub mod coordinator_service;
pub mod server;

use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tonic::Status;

use crate::error::Result;
use crate::registry::Connection;

pub use agent_service::AgentServiceImpl;
pub use connection::{register_agent, CoordinatorConnection, GrpcAgentConnector};
pub use coordinator_service::CoordinatorServiceImpl;
pub use server::{bind, serve_agent, serve_coordinator};

/// Buffered messages per registration stream
const STREAM_BUFFER: usize = 64;

/// Forward registry pushes for one connection onto a response stream.
/// `on_close` runs once, when the client goes away, the registry drops the
/// connection or `token` is cancelled. Pushes `map` cannot encode are logged
/// and skipped.
fn forward<M, P, F, C>(
    mut connection: Connection<M>,
    token: CancellationToken,
    map: F,
    on_close: C,
) -> ReceiverStream<std::result::Result<P, Status>>
where
    M: Send + 'static,
    P: Send + 'static,
    F: Fn(M) -> Result<P> + Send + 'static,
    C: FnOnce() + Send + 'static,
{
    let (tx, rx) = mpsc::channel(STREAM_BUFFER);

    tokio::spawn(async move {
        loop {
            tokio::select! {
                // queued pushes drain before a shutdown closes the stream
                biased;
                push = connection.receiver.recv() => {
                    let Some(push) = push else { break };
                    match map(push) {
                        Ok(message) => {
                            if tx.send(Ok(message)).await.is_err() {
                                break;
                            }
                        }
                        Err(e) => {
                            tracing::warn!(connection = connection.id, error = %e, "Dropping unencodable push");
                        }
                    }
                }
                _ = tx.closed() => break,
                _ = token.cancelled() => break,
            }
        }
        tracing::debug!(connection = connection.id, "Stream closed");
        on_close();
    });

    ReceiverStream::new(rx)
}
