//! Bidirectional byte piping with half-close propagation.
//!
//! Each direction runs as its own task. When a direction reaches EOF (or
//! fails) it shuts down the write half it was feeding, so the peer sees
//! EOF while the opposite direction keeps draining. The connection is
//! fully closed only after both tasks finish.

use std::io;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, Instrument};

use crate::error::ProxyError;

/// Copy buffer size per direction.
const BUFFER_SIZE: usize = 8192;

/// Outcome of one copy direction.
#[derive(Debug)]
struct Copied {
    bytes: u64,
    error: Option<io::Error>,
}

/// Copy `reader` into `writer` until EOF, then shut down `writer`.
async fn copy_then_shutdown<R, W>(mut reader: R, mut writer: W, direction: &'static str) -> Copied
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut bytes = 0u64;
    let mut buf = vec![0u8; BUFFER_SIZE];

    let error = loop {
        match reader.read(&mut buf).await {
            Ok(0) => break None,
            Ok(n) => {
                if let Err(e) = writer.write_all(&buf[..n]).await {
                    break Some(e);
                }
                bytes += n as u64;
            }
            Err(e) => break Some(e),
        }
    };

    if let Err(e) = writer.shutdown().await {
        debug!(direction, error = %e, "Half-close failed");
    }
    debug!(direction, bytes, "Copy finished");

    Copied { bytes, error }
}

/// Pipe `client` and `backend` into each other until both directions end.
///
/// Returns (bytes_to_backend, bytes_from_backend). Copy errors end their
/// direction and are logged; they do not fail the pipe.
pub async fn pipe(client: TcpStream, backend: TcpStream) -> Result<(u64, u64), ProxyError> {
    let (client_read, client_write) = client.into_split();
    let (backend_read, backend_write) = backend.into_split();

    let upstream = tokio::spawn(
        copy_then_shutdown(client_read, backend_write, "client->backend")
            .instrument(tracing::Span::current()),
    );
    let downstream = tokio::spawn(
        copy_then_shutdown(backend_read, client_write, "backend->client")
            .instrument(tracing::Span::current()),
    );

    let (upstream, downstream) = tokio::join!(upstream, downstream);
    let (upstream, downstream) = (upstream?, downstream?);

    for (direction, copied) in [("client->backend", &upstream), ("backend->client", &downstream)] {
        if let Some(e) = &copied.error {
            debug!(direction, error = %e, "Copy ended with error");
        }
    }

    Ok((upstream.bytes, downstream.bytes))
}
