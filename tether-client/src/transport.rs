//! One duplex WebSocket to the relay.
//!
//! A connected [`Transport`] owns two tasks: a writer that serializes every
//! outbound frame (plus keep-alive pings) and a reader that pushes inbound
//! frames into a channel. Both stop when the transport is closed, dropped,
//! or the shutdown token it was connected under is cancelled.

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, timeout, Instant};
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::{connect_async_tls_with_config, Connector};
use tokio_util::sync::CancellationToken;
use url::{Host, Url};

pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
pub const RECEIVE_TIMEOUT: Duration = Duration::from_secs(30);
pub const PING_INTERVAL: Duration = Duration::from_secs(30);

/// Bounded so a stalled socket applies backpressure instead of buffering
/// without limit.
const CHANNEL_BUFFER_SIZE: usize = 1024;

/// How long `close` waits for the socket tasks to finish.
const CLOSE_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("connect timed out after {0:?}")]
    Timeout(Duration),
    #[error("cancelled by shutdown")]
    Cancelled,
    #[error("invalid relay uri {0:?}: {1}")]
    InvalidUri(String, String),
    #[error("refusing to skip certificate validation for non-loopback host {0}")]
    InsecureTlsRefused(String),
    #[error("tls setup failed: {0}")]
    Tls(String),
    #[error("websocket error: {0}")]
    WebSocket(String),
    #[error("failed to encode frame: {0}")]
    Encode(String),
    #[error("not connected")]
    NotConnected,
    #[error("connection closed")]
    Closed,
}

impl TransportError {
    /// Errors that will not go away by retrying the same endpoint.
    pub fn is_permanent(&self) -> bool {
        matches!(
            self,
            TransportError::InvalidUri(..)
                | TransportError::InsecureTlsRefused(_)
                | TransportError::Tls(_)
        )
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for TransportError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        TransportError::WebSocket(err.to_string())
    }
}

/// Certificate validation policy for `wss://` endpoints.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum TlsPolicy {
    #[default]
    Strict,
    /// Accept self-signed certificates, but only when the host is
    /// `localhost` or a loopback address. Any other host is refused.
    AllowInvalidForLoopback,
}

#[derive(Debug, Clone)]
pub struct TransportConfig {
    pub connect_timeout: Duration,
    pub receive_timeout: Duration,
    pub ping_interval: Duration,
    pub tls: TlsPolicy,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            connect_timeout: CONNECT_TIMEOUT,
            receive_timeout: RECEIVE_TIMEOUT,
            ping_interval: PING_INTERVAL,
            tls: TlsPolicy::Strict,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    Binary(Vec<u8>),
}

pub fn is_loopback_host(url: &Url) -> bool {
    match url.host() {
        Some(Host::Domain(d)) => d.eq_ignore_ascii_case("localhost"),
        Some(Host::Ipv4(ip)) => ip.is_loopback(),
        Some(Host::Ipv6(ip)) => ip.is_loopback(),
        None => false,
    }
}

fn parse_uri(uri: &str) -> Result<Url, TransportError> {
    let url = Url::parse(uri).map_err(|e| TransportError::InvalidUri(uri.to_string(), e.to_string()))?;
    match url.scheme() {
        "ws" | "wss" => Ok(url),
        other => Err(TransportError::InvalidUri(
            uri.to_string(),
            format!("unsupported scheme {other}"),
        )),
    }
}

fn connector_for(url: &Url, policy: TlsPolicy) -> Result<Option<Connector>, TransportError> {
    if url.scheme() != "wss" || policy == TlsPolicy::Strict {
        return Ok(None);
    }
    if !is_loopback_host(url) {
        return Err(TransportError::InsecureTlsRefused(
            url.host_str().unwrap_or_default().to_string(),
        ));
    }
    log::warn!(
        "certificate validation disabled for loopback endpoint {}",
        url
    );
    let tls = native_tls::TlsConnector::builder()
        .danger_accept_invalid_certs(true)
        .danger_accept_invalid_hostnames(true)
        .build()
        .map_err(|e| TransportError::Tls(e.to_string()))?;
    Ok(Some(Connector::NativeTls(tls)))
}

#[derive(Debug)]
pub struct Transport {
    outbound: mpsc::Sender<Message>,
    inbound: mpsc::Receiver<Result<Frame, TransportError>>,
    cancel: CancellationToken,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

impl Transport {
    /// Open a socket to `uri`. The attempt is bounded by the configured
    /// connect timeout and aborted early if `shutdown` fires.
    ///
    /// `on_closed` runs once when the receive loop ends, with the fatal
    /// error if there was one.
    pub async fn connect<F>(
        uri: &str,
        config: &TransportConfig,
        shutdown: &CancellationToken,
        on_closed: F,
    ) -> Result<Self, TransportError>
    where
        F: FnOnce(Option<&TransportError>) + Send + 'static,
    {
        let url = parse_uri(uri)?;
        let connector = connector_for(&url, config.tls)?;
        let cancel = shutdown.child_token();

        log::info!("connecting to relay {}", url);
        let handshake = connect_async_tls_with_config(url.as_str(), None, false, connector);
        let ws = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(TransportError::Cancelled),
            res = timeout(config.connect_timeout, handshake) => match res {
                Err(_) => return Err(TransportError::Timeout(config.connect_timeout)),
                Ok(Err(e)) => return Err(e.into()),
                Ok(Ok((ws, _resp))) => ws,
            },
        };
        log::info!("connected to relay {}", url);

        let (mut sink, mut stream) = ws.split();
        let (out_tx, mut out_rx) = mpsc::channel::<Message>(CHANNEL_BUFFER_SIZE);
        let (in_tx, in_rx) = mpsc::channel(CHANNEL_BUFFER_SIZE);

        let writer_cancel = cancel.clone();
        let ping_every = config.ping_interval;
        let writer = tokio::spawn(async move {
            let mut ping = interval_at(Instant::now() + ping_every, ping_every);
            loop {
                tokio::select! {
                    _ = writer_cancel.cancelled() => {
                        let _ = sink.send(Message::Close(None)).await;
                        break;
                    }
                    msg = out_rx.recv() => {
                        let Some(msg) = msg else {
                            let _ = sink.send(Message::Close(None)).await;
                            break;
                        };
                        if let Err(e) = sink.send(msg).await {
                            log::debug!("relay write failed: {}", e);
                            break;
                        }
                    }
                    _ = ping.tick() => {
                        if sink.send(Message::Ping(Vec::new())).await.is_err() {
                            break;
                        }
                    }
                }
            }
            writer_cancel.cancel();
        });

        let reader_cancel = cancel.clone();
        let receive_timeout = config.receive_timeout;
        let writer_alive = out_tx.clone();
        let reader = tokio::spawn(async move {
            let failure = loop {
                let next = tokio::select! {
                    biased;
                    _ = reader_cancel.cancelled() => break None,
                    next = timeout(receive_timeout, stream.next()) => next,
                };
                let frame = match next {
                    // Quiet socket: poll again unless the writer side is gone.
                    Err(_) if writer_alive.is_closed() => break Some(TransportError::Closed),
                    Err(_) => continue,
                    Ok(None) => break None,
                    Ok(Some(Err(e))) => break Some(TransportError::from(e)),
                    Ok(Some(Ok(Message::Text(t)))) => Frame::Text(t),
                    Ok(Some(Ok(Message::Binary(b)))) => Frame::Binary(b),
                    Ok(Some(Ok(Message::Close(frame)))) => {
                        log::info!("relay closed the connection: {:?}", frame);
                        break None;
                    }
                    Ok(Some(Ok(_))) => continue,
                };
                if in_tx.send(Ok(frame)).await.is_err() {
                    break None;
                }
            };

            if let Some(e) = &failure {
                log::warn!("relay connection failed: {}", e);
            }
            on_closed(failure.as_ref());
            if let Some(e) = failure {
                let _ = in_tx.send(Err(e)).await;
            }
            reader_cancel.cancel();
        });

        Ok(Self {
            outbound: out_tx,
            inbound: in_rx,
            cancel,
            reader,
            writer,
        })
    }

    pub fn is_open(&self) -> bool {
        !self.cancel.is_cancelled()
    }

    /// Queue a text frame. Frames from one transport go out in call order.
    pub async fn send_text(&self, text: String) -> Result<(), TransportError> {
        if !self.is_open() {
            return Err(TransportError::NotConnected);
        }
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(TransportError::Cancelled),
            res = self.outbound.send(Message::Text(text)) => res.map_err(|_| TransportError::NotConnected),
        }
    }

    /// Next inbound frame. A fatal error is yielded once; `None` follows.
    pub async fn recv(&mut self) -> Option<Result<Frame, TransportError>> {
        self.inbound.recv().await
    }

    /// Send a close frame and wait briefly for both socket tasks to end.
    pub async fn close(&mut self) {
        self.cancel.cancel();
        let joined = timeout(CLOSE_GRACE, async {
            let _ = (&mut self.writer).await;
            let _ = (&mut self.reader).await;
        })
        .await;
        if joined.is_err() {
            self.writer.abort();
            self.reader.abort();
        }
    }
}

impl Drop for Transport {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
