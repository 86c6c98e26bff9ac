use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::error::{Direction, ProxyError};

/// Bytes moved in each direction of a finished relay.
///
/// A direction that ended with an I/O error reports `None`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RelayStats {
    pub client_to_server: Option<u64>,
    pub server_to_client: Option<u64>,
}

/// Pumps bytes between `inbound` and `outbound` until both directions end.
///
/// The directions are independent: EOF or an error on one side shuts down the
/// write half it was feeding and leaves the other direction running. Both
/// sockets are closed when this returns. Returns `None` if `cancel` fired
/// first, in which case both sockets are dropped immediately.
pub async fn relay(
    inbound: TcpStream,
    outbound: TcpStream,
    cancel: &CancellationToken,
) -> Option<RelayStats> {
    let (client_read, client_write) = inbound.into_split();
    let (server_read, server_write) = outbound.into_split();

    let both = async {
        tokio::join!(
            copy_half(client_read, server_write, Direction::ClientToServer),
            copy_half(server_read, client_write, Direction::ServerToClient),
        )
    };

    tokio::select! {
        (up, down) = both => Some(RelayStats {
            client_to_server: up,
            server_to_client: down,
        }),
        _ = cancel.cancelled() => None,
    }
}

/// Logged in the caller's span, so failures carry the connection's fields.
async fn copy_half(
    mut reader: OwnedReadHalf,
    mut writer: OwnedWriteHalf,
    direction: Direction,
) -> Option<u64> {
    let copied = tokio::io::copy(&mut reader, &mut writer).await;

    // Forward the half-close; fails harmlessly if the peer is already gone.
    let _ = writer.shutdown().await;

    match copied {
        Ok(n) => Some(n),
        Err(source) => {
            let err = ProxyError::Relay { direction, source };
            warn!(error = %err, "relay direction failed");
            None
        }
    }
}
