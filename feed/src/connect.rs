use crate::transport::TransportError;

use bytes::Bytes;
use fastwebsockets::{FragmentCollectorRead, Frame, OpCode, WebSocketWrite};
use http_body_util::Empty;
use hyper::{
    Request,
    header::{CONNECTION, UPGRADE},
    upgrade::Upgraded,
};
use hyper_util::rt::{TokioExecutor, TokioIo};
use iced_futures::futures::channel::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::{io::ReadHalf, io::WriteHalf, net::TcpStream, task::JoinHandle};
use tokio_rustls::{
    TlsConnector,
    rustls::{ClientConfig, OwnedTrustAnchor},
};
use url::Url;

use std::{sync::OnceLock, time::Duration};

const TCP_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const TLS_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
const WS_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(15);

/// Maximum idle time before the connection is considered dead.
/// The transport pings every 30s by default, so a healthy server always
/// answers well inside this window.
pub const WS_READ_TIMEOUT: Duration = Duration::from_secs(45);

pub type WebSocket = fastwebsockets::WebSocket<TokioIo<Upgraded>>;
pub type WsReader = FragmentCollectorRead<ReadHalf<TokioIo<Upgraded>>>;
pub type WsWriter = WebSocketWrite<WriteHalf<TokioIo<Upgraded>>>;

static TLS_CONNECTOR: OnceLock<TlsConnector> = OnceLock::new();

fn tls_connector() -> &'static TlsConnector {
    TLS_CONNECTOR.get_or_init(|| {
        let mut root_store = tokio_rustls::rustls::RootCertStore::empty();

        root_store.add_trust_anchors(webpki_roots::TLS_SERVER_ROOTS.0.iter().map(|ta| {
            OwnedTrustAnchor::from_subject_spki_name_constraints(
                ta.subject,
                ta.spki,
                ta.name_constraints,
            )
        }));

        let config = ClientConfig::builder()
            .with_safe_defaults()
            .with_root_certificates(root_store)
            .with_no_client_auth();

        TlsConnector::from(std::sync::Arc::new(config))
    })
}

pub enum State {
    Disconnected,
    Connected(Connection),
}

/// What the read half reports to the task owning the write half.
#[derive(Debug)]
pub enum Inbound {
    Block(Vec<u8>),
    /// A control frame the protocol obliges us to answer (pong, close echo).
    Reply(OpCode, Vec<u8>),
    Other,
    Closed(String),
}

/// An open socket whose read half runs on its own task.
///
/// A partially read frame lives inside that task, so nothing the writer does
/// can interrupt it. Dropping the connection stops the reader.
pub struct Connection {
    pub writer: WsWriter,
    pub inbound: UnboundedReceiver<Inbound>,
    reader: JoinHandle<()>,
}

impl Connection {
    pub fn open(ws: WebSocket) -> Self {
        let (reader, writer) = ws.split(tokio::io::split);
        let (tx, inbound) = mpsc::unbounded();

        Self {
            writer,
            inbound,
            reader: tokio::spawn(read_loop(FragmentCollectorRead::new(reader), tx)),
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

async fn read_loop(mut reader: WsReader, tx: UnboundedSender<Inbound>) {
    let replies = tx.clone();
    let mut obligated = move |frame: Frame<'_>| {
        let sent = replies
            .unbounded_send(Inbound::Reply(frame.opcode, frame.payload.to_vec()))
            .map_err(|_| "connection dropped");
        std::future::ready(sent)
    };

    loop {
        let inbound = match reader.read_frame(&mut obligated).await {
            Ok(frame) => match frame.opcode {
                OpCode::Binary => Inbound::Block(frame.payload.to_vec()),
                OpCode::Close => Inbound::Closed("Connection closed".to_string()),
                OpCode::Text => {
                    log::debug!("Ignoring text frame ({} bytes)", frame.payload.len());
                    Inbound::Other
                }
                _ => Inbound::Other,
            },
            Err(e) => Inbound::Closed(format!("Error reading frame: {e}")),
        };

        let closed = matches!(inbound, Inbound::Closed(_));
        if tx.unbounded_send(inbound).is_err() || closed {
            return;
        }
    }
}

/// Opens a websocket to `url` (`ws://` or `wss://`).
pub async fn connect_ws(url: &str) -> Result<WebSocket, TransportError> {
    let parsed = Url::parse(url).map_err(|e| TransportError::InvalidRequest(e.to_string()))?;

    let domain = parsed
        .host_str()
        .ok_or_else(|| TransportError::InvalidRequest("Missing host in websocket URL".to_string()))?
        .to_string();

    let target_port = parsed.port_or_known_default().ok_or_else(|| {
        TransportError::InvalidRequest("Missing port for websocket URL".to_string())
    })?;

    let secure = match parsed.scheme() {
        "wss" => true,
        "ws" => false,
        scheme => {
            return Err(TransportError::InvalidRequest(format!(
                "Invalid scheme for websocket URL: {scheme}"
            )));
        }
    };

    let stream = setup_tcp(&domain, target_port).await?;

    if secure {
        let tls_stream =
            tokio::time::timeout(TLS_HANDSHAKE_TIMEOUT, upgrade_to_tls(&domain, stream))
                .await
                .map_err(|_| TransportError::Websocket("TLS handshake timed out".to_string()))??;

        tokio::time::timeout(
            WS_HANDSHAKE_TIMEOUT,
            upgrade_to_websocket(&domain, tls_stream, &parsed),
        )
        .await
        .map_err(|_| TransportError::Websocket("WebSocket handshake timed out".to_string()))?
    } else {
        tokio::time::timeout(
            WS_HANDSHAKE_TIMEOUT,
            upgrade_to_websocket(&domain, stream, &parsed),
        )
        .await
        .map_err(|_| TransportError::Websocket("WebSocket handshake timed out".to_string()))?
    }
}

async fn setup_tcp(domain: &str, target_port: u16) -> Result<TcpStream, TransportError> {
    let addr = format!("{domain}:{target_port}");

    let tcp = tokio::time::timeout(TCP_CONNECT_TIMEOUT, TcpStream::connect(&addr))
        .await
        .map_err(|_| TransportError::Websocket(format!("TCP connect timeout: {addr}")))?
        .map_err(|e| TransportError::Websocket(e.to_string()))?;

    if let Err(e) = tcp.set_nodelay(true) {
        log::debug!("Failed to set TCP_NODELAY on {addr}: {e}");
    }

    Ok(tcp)
}

async fn upgrade_to_tls<S>(
    domain: &str,
    stream: S,
) -> Result<tokio_rustls::client::TlsStream<S>, TransportError>
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    let domain: tokio_rustls::rustls::ServerName =
        tokio_rustls::rustls::ServerName::try_from(domain)
            .map_err(|_| TransportError::InvalidRequest("invalid dnsname".to_string()))?;

    tls_connector()
        .connect(domain, stream)
        .await
        .map_err(|e| TransportError::Websocket(e.to_string()))
}

async fn upgrade_to_websocket<S>(
    domain: &str,
    stream: S,
    parsed: &Url,
) -> Result<WebSocket, TransportError>
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + 'static,
{
    let mut path_and_query = parsed.path().to_string();
    if let Some(q) = parsed.query() {
        path_and_query.push('?');
        path_and_query.push_str(q);
    }
    if path_and_query.is_empty() {
        path_and_query.push('/');
    }

    let host_header = match parsed.port() {
        Some(port) => format!("{domain}:{port}"),
        None => domain.to_string(),
    };

    let req: Request<Empty<Bytes>> = Request::builder()
        .method("GET")
        .uri(path_and_query)
        .header("Host", host_header)
        .header(UPGRADE, "websocket")
        .header(CONNECTION, "upgrade")
        .header(
            "Sec-WebSocket-Key",
            fastwebsockets::handshake::generate_key(),
        )
        .header("Sec-WebSocket-Version", "13")
        .body(Empty::<Bytes>::new())
        .map_err(|e| TransportError::Websocket(e.to_string()))?;

    let exec = TokioExecutor::new();
    let (ws, _) = fastwebsockets::handshake::client(&exec, req, stream)
        .await
        .map_err(|e| TransportError::Websocket(e.to_string()))?;

    Ok(ws)
}
