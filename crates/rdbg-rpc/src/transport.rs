//! Transport client for the inspector endpoint.
//!
//! The [`RpcClient`] owns one duplex connection. Outbound frames are queued on
//! an unbounded command channel and written by a background task, so
//! [`RpcClient::send_plist`] never waits on the socket. Inbound frames are decoded
//! and forwarded, in arrival order, on the receiver returned by
//! [`RpcClient::connect`].
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐  cmd   ┌───────────────┐   bytes   ┌──────────┐
//! │  RpcClient   │──chan─▶│  writer task  │──────────▶│          │
//! │   send()     │        └───────────────┘           │  socket  │
//! │              │  frame ┌───────────────┐   bytes   │          │
//! │  inbound rx ◀┼──chan──│  reader task  │◀──────────│          │
//! └──────────────┘        └───────────────┘           └──────────┘
//! ```
//!
//! The native variant frames binary plists; the WebKit variant exchanges
//! WebSocket text frames carrying JSON documents.

use std::path::PathBuf;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use plist::Value as PlistValue;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::protocol::Message as WsMessage;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use rdbg_core::prelude::*;

use crate::codec::{read_frame, write_frame, BinaryPlistCodec, PlistCodec};
use crate::protocol::summarize_plist;

/// Capacity of the inbound frame channel.
const INBOUND_CHANNEL_CAPACITY: usize = 256;

// ---------------------------------------------------------------------------
// Public types
// ---------------------------------------------------------------------------

/// Where to connect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectTarget {
    /// Native endpoint over TCP.
    Tcp { host: String, port: u16 },
    /// Native endpoint over the simulator's Unix socket.
    Unix(PathBuf),
    /// WebKit page WebSocket URL.
    WebSocket(String),
}

impl std::fmt::Display for ConnectTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectTarget::Tcp { host, port } => write!(f, "{host}:{port}"),
            ConnectTarget::Unix(path) => write!(f, "{}", path.display()),
            ConnectTarget::WebSocket(url) => write!(f, "{url}"),
        }
    }
}

/// Connection state of an [`RpcClient`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connected,
    Disconnected,
}

/// Framing spoken on the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Framing {
    Plist,
    Text,
}

/// A decoded inbound frame.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundFrame {
    Plist(PlistValue),
    Text(String),
}

enum TransportCommand {
    SendPlist(PlistValue),
    SendText(String),
    Disconnect,
}

type WsStream = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

// ---------------------------------------------------------------------------
// RpcClient
// ---------------------------------------------------------------------------

/// Handle to one open connection. Clones share the connection.
#[derive(Clone)]
pub struct RpcClient {
    cmd_tx: mpsc::UnboundedSender<TransportCommand>,
    state: Arc<RwLock<ConnectionState>>,
    framing: Framing,
}

impl std::fmt::Debug for RpcClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcClient")
            .field("state", &self.state())
            .field("framing", &self.framing)
            .finish()
    }
}

impl RpcClient {
    /// Open a connection to `target`, failing with [`Error::Connection`] on
    /// refusal or [`Error::Timeout`] when `timeout` elapses first.
    pub async fn connect(
        target: &ConnectTarget,
        timeout: Duration,
    ) -> Result<(Self, mpsc::Receiver<InboundFrame>)> {
        info!("Connecting to inspector endpoint at {}", target);

        tokio::time::timeout(timeout, Self::open(target))
            .await
            .map_err(|_| Error::timeout(format!("connecting to {target}")))?
    }

    async fn open(target: &ConnectTarget) -> Result<(Self, mpsc::Receiver<InboundFrame>)> {
        match target {
            ConnectTarget::Tcp { host, port } => {
                let stream = tokio::net::TcpStream::connect((host.as_str(), *port))
                    .await
                    .map_err(|e| Error::connection(format!("{target}: {e}")))?;
                Ok(Self::from_stream(stream, Arc::new(BinaryPlistCodec)))
            }
            #[cfg(unix)]
            ConnectTarget::Unix(path) => {
                let stream = tokio::net::UnixStream::connect(path)
                    .await
                    .map_err(|e| Error::connection(format!("{target}: {e}")))?;
                Ok(Self::from_stream(stream, Arc::new(BinaryPlistCodec)))
            }
            #[cfg(not(unix))]
            ConnectTarget::Unix(_) => Err(Error::connection(
                "unix sockets are not supported on this platform",
            )),
            ConnectTarget::WebSocket(url) => {
                let (ws, _response) = connect_async(url.as_str())
                    .await
                    .map_err(|e| Error::connection(format!("{target}: {e}")))?;
                Ok(Self::from_websocket(ws))
            }
        }
    }

    /// Wrap an already-open byte stream speaking length-prefixed plists.
    pub fn from_stream<S>(
        stream: S,
        codec: Arc<dyn PlistCodec>,
    ) -> (Self, mpsc::Receiver<InboundFrame>)
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_CHANNEL_CAPACITY);
        let state = Arc::new(RwLock::new(ConnectionState::Connected));

        let (reader, writer) = tokio::io::split(stream);
        let reader_task = tokio::spawn(run_plist_reader(
            reader,
            Arc::clone(&codec),
            inbound_tx,
            Arc::clone(&state),
        ));
        tokio::spawn(run_plist_writer(
            writer,
            codec,
            cmd_rx,
            reader_task,
            Arc::clone(&state),
        ));

        (
            Self {
                cmd_tx,
                state,
                framing: Framing::Plist,
            },
            inbound_rx,
        )
    }

    fn from_websocket(ws: WsStream) -> (Self, mpsc::Receiver<InboundFrame>) {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_CHANNEL_CAPACITY);
        let state = Arc::new(RwLock::new(ConnectionState::Connected));

        tokio::spawn(run_websocket_task(
            ws,
            cmd_rx,
            inbound_tx,
            Arc::clone(&state),
        ));

        (
            Self {
                cmd_tx,
                state,
                framing: Framing::Text,
            },
            inbound_rx,
        )
    }

    pub fn framing(&self) -> Framing {
        self.framing
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.read().unwrap_or_else(|e| e.into_inner())
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Queue a plist for writing. Returns without waiting for the socket.
    pub fn send_plist(&self, message: PlistValue) -> Result<()> {
        if self.framing != Framing::Plist {
            return Err(Error::protocol("plist frames need a native connection"));
        }
        debug!("-> {}", summarize_plist(&message));
        self.enqueue(TransportCommand::SendPlist(message))
    }

    /// Queue a text frame for writing. Returns without waiting for the socket.
    pub fn send_text(&self, text: String) -> Result<()> {
        if self.framing != Framing::Text {
            return Err(Error::protocol("text frames need a WebSocket connection"));
        }
        debug!("-> {}", truncate(&text, 120));
        self.enqueue(TransportCommand::SendText(text))
    }

    fn enqueue(&self, cmd: TransportCommand) -> Result<()> {
        if !self.is_connected() {
            return Err(Error::Disconnected);
        }
        self.cmd_tx.send(cmd).map_err(|_| Error::Disconnected)
    }

    /// Close the connection. Calling this more than once is harmless.
    pub fn disconnect(&self) {
        // the writer task may already be gone
        let _ = self.cmd_tx.send(TransportCommand::Disconnect);
        set_state(&self.state, ConnectionState::Disconnected);
    }
}

fn set_state(state: &RwLock<ConnectionState>, new_state: ConnectionState) {
    let mut guard = state.write().unwrap_or_else(|e| e.into_inner());
    *guard = new_state;
}

fn truncate(text: &str, max: usize) -> &str {
    match text.char_indices().nth(max) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

// ---------------------------------------------------------------------------
// Background tasks
// ---------------------------------------------------------------------------

async fn run_plist_reader<R>(
    mut reader: R,
    codec: Arc<dyn PlistCodec>,
    inbound_tx: mpsc::Sender<InboundFrame>,
    state: Arc<RwLock<ConnectionState>>,
) where
    R: AsyncRead + Unpin,
{
    loop {
        let body = match read_frame(&mut reader).await {
            Ok(Some(body)) => body,
            Ok(None) => {
                debug!("Inspector socket closed by remote");
                break;
            }
            Err(e) => {
                warn!("Inspector socket read error: {}", e);
                break;
            }
        };

        match codec.decode(&body) {
            Ok(message) => {
                debug!("<- {}", summarize_plist(&message));
                if inbound_tx.send(InboundFrame::Plist(message)).await.is_err() {
                    debug!("Inbound receiver dropped, stopping reader");
                    break;
                }
            }
            Err(e) => warn!("Dropping malformed frame ({} bytes): {}", body.len(), e),
        }
    }

    set_state(&state, ConnectionState::Disconnected);
}

async fn run_plist_writer<W>(
    mut writer: W,
    codec: Arc<dyn PlistCodec>,
    mut cmd_rx: mpsc::UnboundedReceiver<TransportCommand>,
    reader_task: tokio::task::JoinHandle<()>,
    state: Arc<RwLock<ConnectionState>>,
) where
    W: AsyncWrite + Unpin,
{
    while let Some(cmd) = cmd_rx.recv().await {
        match cmd {
            TransportCommand::SendPlist(message) => {
                let written = match codec.encode(&message) {
                    Ok(bytes) => write_frame(&mut writer, &bytes).await,
                    Err(e) => {
                        warn!("Failed to encode outbound message: {}", e);
                        continue;
                    }
                };
                if let Err(e) = written {
                    warn!("Inspector socket write error: {}", e);
                    break;
                }
            }
            TransportCommand::SendText(_) => {
                warn!("Ignoring text frame on a plist connection");
            }
            TransportCommand::Disconnect => {
                debug!("Closing inspector socket");
                break;
            }
        }
    }

    let _ = writer.shutdown().await;
    reader_task.abort();
    set_state(&state, ConnectionState::Disconnected);
}

async fn run_websocket_task(
    ws: WsStream,
    mut cmd_rx: mpsc::UnboundedReceiver<TransportCommand>,
    inbound_tx: mpsc::Sender<InboundFrame>,
    state: Arc<RwLock<ConnectionState>>,
) {
    let (mut ws_sink, mut ws_stream) = ws.split();

    loop {
        tokio::select! {
            frame = ws_stream.next() => {
                match frame {
                    Some(Ok(WsMessage::Text(text))) => {
                        debug!("<- {}", truncate(text.as_str(), 120));
                        if inbound_tx.send(InboundFrame::Text(text.to_string())).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(WsMessage::Close(_))) => {
                        debug!("WebSocket: received Close frame");
                        break;
                    }
                    Some(Ok(_)) => {
                        // Ping/Pong/Binary
                    }
                    Some(Err(e)) => {
                        warn!("WebSocket read error: {}", e);
                        break;
                    }
                    None => {
                        debug!("WebSocket stream ended");
                        break;
                    }
                }
            }

            cmd = cmd_rx.recv() => {
                match cmd {
                    Some(TransportCommand::SendText(text)) => {
                        if let Err(e) = ws_sink.send(WsMessage::Text(text.into())).await {
                            warn!("WebSocket write error: {}", e);
                            break;
                        }
                    }
                    Some(TransportCommand::SendPlist(_)) => {
                        warn!("Ignoring plist frame on a WebSocket connection");
                    }
                    Some(TransportCommand::Disconnect) | None => {
                        send_close(&mut ws_sink).await;
                        break;
                    }
                }
            }
        }
    }

    set_state(&state, ConnectionState::Disconnected);
}

async fn send_close(ws_sink: &mut SplitSink<WsStream, WsMessage>) {
    let _ = ws_sink.send(WsMessage::Close(None)).await;
    let _ = ws_sink.close().await;
}
