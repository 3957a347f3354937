use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use futures_util::StreamExt;
use tokio::net::{TcpListener, UdpSocket};
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, LinesCodec};
use tokio_util::sync::CancellationToken;

use vmdrive_launcher::TAIL_SENTINEL;

use crate::error::VmError;

const MAX_LINE: usize = 64 * 1024;

/// Host side of the live-tail channel: accepts one connection from the
/// in-guest launcher and reads lines until EOF, the sentinel, or cancellation.
/// Best effort; the retrieved output log remains the authoritative result.
pub struct TailListener {
    address: SocketAddr,
    cancel: CancellationToken,
    task: JoinHandle<Vec<String>>,
}

impl TailListener {
    /// Bind on `host` only. Port 0 picks an ephemeral port.
    pub async fn start(host: IpAddr, port: u16, cancel: CancellationToken) -> Result<Self, VmError> {
        let listener = TcpListener::bind(SocketAddr::new(host, port))
            .await
            .map_err(|source| VmError::Io {
                context: format!("binding tail listener on {host}:{port}"),
                source,
            })?;
        let address = listener.local_addr().map_err(|source| VmError::Io {
            context: "reading tail listener address".into(),
            source,
        })?;
        tracing::debug!(%address, "tail listener bound");

        let task = tokio::spawn(accept_and_read(listener, cancel.clone()));
        Ok(Self {
            address,
            cancel,
            task,
        })
    }

    pub fn address(&self) -> SocketAddr {
        self.address
    }

    /// Wait up to `grace` for the stream to finish on its own, then cancel.
    /// Returns the lines received.
    pub async fn join(mut self, grace: Duration) -> Vec<String> {
        if let Ok(done) = tokio::time::timeout(grace, &mut self.task).await {
            return done.unwrap_or_default();
        }
        tracing::debug!(address = %self.address, "tail still open after guest exit, cancelling");
        self.cancel.cancel();
        (&mut self.task).await.unwrap_or_default()
    }
}

async fn accept_and_read(listener: TcpListener, cancel: CancellationToken) -> Vec<String> {
    let stream = tokio::select! {
        accepted = listener.accept() => match accepted {
            Ok((stream, peer)) => {
                tracing::debug!(%peer, "tail connection accepted");
                stream
            }
            Err(e) => {
                tracing::warn!(error = %e, "tail accept failed");
                return Vec::new();
            }
        },
        _ = cancel.cancelled() => return Vec::new(),
    };

    let mut lines = Vec::new();
    let mut framed = FramedRead::new(stream, LinesCodec::new_with_max_length(MAX_LINE));
    loop {
        let next = tokio::select! {
            next = framed.next() => next,
            _ = cancel.cancelled() => break,
        };
        match next {
            Some(Ok(line)) if line == TAIL_SENTINEL => break,
            Some(Ok(line)) => {
                tracing::info!(target: "vmdrive::tail", "{line}");
                lines.push(line);
            }
            Some(Err(e)) => {
                tracing::debug!(error = %e, "tail stream error");
                break;
            }
            None => break,
        }
    }
    lines
}

/// Local address the guest at `guest_ip` should connect back to.
pub async fn host_address_toward(guest_ip: IpAddr) -> Result<IpAddr, VmError> {
    let bind: SocketAddr = match guest_ip {
        IpAddr::V4(_) => (Ipv4Addr::UNSPECIFIED, 0).into(),
        IpAddr::V6(_) => (std::net::Ipv6Addr::UNSPECIFIED, 0).into(),
    };
    let io_err = |source| VmError::Io {
        context: format!("finding host address toward {guest_ip}"),
        source,
    };
    let socket = UdpSocket::bind(bind).await.map_err(io_err)?;
    // UDP connect sends nothing; it only selects the outgoing interface.
    socket.connect((guest_ip, 9)).await.map_err(io_err)?;
    Ok(socket.local_addr().map_err(io_err)?.ip())
}

#[cfg(test)]
mod tests {
    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpStream;

    use super::*;

    const LOOPBACK: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

    #[tokio::test]
    async fn collects_lines_until_sentinel() {
        let listener = TailListener::start(LOOPBACK, 0, CancellationToken::new())
            .await
            .unwrap();
        let mut stream = TcpStream::connect(listener.address()).await.unwrap();
        stream
            .write_all(format!("first\nsecond\n{TAIL_SENTINEL}\nignored\n").as_bytes())
            .await
            .unwrap();

        let lines = listener.join(Duration::from_secs(5)).await;
        assert_eq!(lines, vec!["first", "second"]);
    }

    #[tokio::test]
    async fn eof_ends_stream() {
        let listener = TailListener::start(LOOPBACK, 0, CancellationToken::new())
            .await
            .unwrap();
        let mut stream = TcpStream::connect(listener.address()).await.unwrap();
        stream.write_all(b"only\n").await.unwrap();
        drop(stream);

        assert_eq!(listener.join(Duration::from_secs(5)).await, vec!["only"]);
    }

    #[tokio::test]
    async fn join_without_connection_cancels() {
        let listener = TailListener::start(LOOPBACK, 0, CancellationToken::new())
            .await
            .unwrap();
        let lines = listener.join(Duration::from_millis(50)).await;
        assert!(lines.is_empty());
    }

    #[tokio::test]
    async fn loopback_guest_maps_to_loopback_host() {
        let ip = host_address_toward(IpAddr::V4(Ipv4Addr::LOCALHOST))
            .await
            .unwrap();
        assert!(ip.is_loopback());
    }

    #[tokio::test]
    async fn listens_only_on_the_requested_address() {
        let listener = TailListener::start(LOOPBACK, 0, CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(listener.address().ip(), LOOPBACK);
        assert!(!listener.address().ip().is_unspecified());
        listener.join(Duration::ZERO).await;
    }
}
