//! The single duplex connection of a streaming session.
//!
//! [`connect`] returns a cloneable [`TransportHandle`] for sending commands
//! and a stream of [`Event`]s. The stream owns the socket: it connects,
//! sends `setup`, reconnects with backoff, answers `refreshToken`, keeps the
//! link alive with `ping`, and decodes every binary block into a [`Frame`].
//!
//! Send policy is buffer-and-retry. Commands issued while the link is down
//! wait in the outbound queue; data requests written but not yet answered
//! when the link drops are replayed after the next `setup`, unless they were
//! forgotten or have waited longer than [`REPLAY_WINDOW`]. `send` only
//! fails, with [`TransportError::NotConnected`], once the stream has been
//! dropped.

use crate::{
    AuthProvider, ConnectionHealth, Envelope, Frame, Header, RequestId,
    command::Command,
    connect::{self, Connection, Inbound, State, WsWriter},
    frame,
    resilience::ReconnectPolicy,
};

use fastwebsockets::{Frame as WsFrame, OpCode, Payload};
use iced_futures::{
    futures::{
        SinkExt, Stream, StreamExt,
        channel::mpsc::{self, UnboundedReceiver, UnboundedSender},
    },
    stream,
};
use rustc_hash::FxHashMap;

use std::time::{Duration, Instant};

/// Unanswered requests older than this are dropped instead of replayed.
pub const REPLAY_WINDOW: Duration = Duration::from_secs(120);

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum TransportError {
    #[error("Transport is not connected")]
    NotConnected,
    #[error("Stream: {0}")]
    Websocket(String),
    #[error("Invalid request: {0}")]
    InvalidRequest(String),
    #[error("Encode: {0}")]
    Encode(String),
}

impl TransportError {
    pub fn to_user_message(&self) -> &'static str {
        match self {
            TransportError::NotConnected => {
                log::error!("Transport used after the session ended");
                "Streaming session has ended."
            }
            TransportError::Websocket(err) => {
                log::error!("Transport websocket error: {err}");
                "Realtime connection error. Trying to reconnect..."
            }
            TransportError::InvalidRequest(err) => {
                log::error!("Transport invalid request: {err}");
                "Invalid streaming server address. Check logs for details."
            }
            TransportError::Encode(err) => {
                log::error!("Transport encode error: {err}");
                "Failed to build a request. Check logs for details."
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    Connected,
    Disconnected(String),
    /// Reconnecting keeps failing; the session should show itself offline.
    Offline(String),
    Frame(Frame),
    Notify(Header),
}

/// Where outbound commands go. Implemented by [`TransportHandle`]; tests
/// substitute a recorder.
pub trait CommandSink {
    fn send(&self, envelope: Envelope) -> Result<(), TransportError>;

    /// The caller no longer waits for `request_id`; it is not replayed after
    /// a reconnect. A response already on its way is still delivered.
    fn forget(&self, request_id: RequestId);
}

#[derive(Debug)]
enum Outbound {
    Send(Envelope),
    Forget(String),
}

#[derive(Debug, Clone)]
pub struct TransportHandle {
    outbound: UnboundedSender<Outbound>,
}

impl TransportHandle {
    pub fn is_closed(&self) -> bool {
        self.outbound.is_closed()
    }
}

impl CommandSink for TransportHandle {
    fn send(&self, envelope: Envelope) -> Result<(), TransportError> {
        self.outbound
            .unbounded_send(Outbound::Send(envelope))
            .map_err(|_| TransportError::NotConnected)
    }

    fn forget(&self, request_id: RequestId) {
        if self
            .outbound
            .unbounded_send(Outbound::Forget(request_id.to_string()))
            .is_err()
        {
            log::trace!("Transport gone, nothing to forget");
        }
    }
}

/// A data request written to the socket and not answered yet.
#[derive(Debug, Clone)]
struct InFlight {
    envelope: Envelope,
    sent_at: Instant,
}

type InFlightTable = FxHashMap<String, InFlight>;

#[derive(Debug, Clone)]
pub struct TransportConfig {
    pub url: String,
    pub reconnect: ReconnectPolicy,
    pub ping_interval: Duration,
}

pub fn connect<A: AuthProvider>(
    config: TransportConfig,
    auth: A,
) -> (TransportHandle, impl Stream<Item = Event>) {
    let (tx, rx) = mpsc::unbounded();

    let events = stream::channel(100, move |mut output| async move {
        run(config, auth, rx, &mut output).await;
        log::info!("Transport stopped");
    });

    (TransportHandle { outbound: tx }, events)
}

async fn run<A: AuthProvider>(
    config: TransportConfig,
    auth: A,
    mut outbound: UnboundedReceiver<Outbound>,
    output: &mut mpsc::Sender<Event>,
) {
    let mut state = State::Disconnected;
    let mut backoff = config.reconnect.backoff();
    let mut failures: u32 = 0;
    let mut inflight = InFlightTable::default();
    let mut last_inbound = tokio::time::Instant::now();

    let mut ping = tokio::time::interval_at(
        tokio::time::Instant::now() + config.ping_interval,
        config.ping_interval,
    );
    ping.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        match &mut state {
            State::Disconnected => {
                let attempt = match connect::connect_ws(&config.url).await {
                    Ok(ws) => {
                        let mut conn = Connection::open(ws);
                        let setup =
                            handshake(&mut conn.writer, &auth, &mut inflight, Instant::now()).await;
                        setup.map(|()| conn)
                    }
                    Err(e) => Err(e),
                };

                match attempt {
                    Ok(conn) => {
                        if failures > 0 {
                            log::info!("Reconnected after {failures} failed attempts");
                        }
                        failures = 0;
                        backoff = config.reconnect.backoff();
                        ping.reset();
                        last_inbound = tokio::time::Instant::now();
                        state = State::Connected(conn);

                        if !emit(output, Event::Connected).await {
                            return;
                        }
                    }
                    Err(TransportError::InvalidRequest(err)) => {
                        log::error!("Cannot connect to {}: {err}", config.url);
                        let _ = emit(output, Event::Offline(err)).await;
                        return;
                    }
                    Err(e) => {
                        failures += 1;
                        let health = ConnectionHealth::after_failure(
                            failures,
                            config.reconnect.offline_after,
                        );
                        log::warn!("Connect attempt {failures} failed ({health}): {e}");

                        let event = if failures == config.reconnect.offline_after {
                            Event::Offline(e.to_string())
                        } else {
                            Event::Disconnected(e.to_string())
                        };
                        if !emit(output, event).await {
                            return;
                        }

                        if let Some(delay) = backoff.next() {
                            tokio::time::sleep(delay).await;
                        }
                    }
                }
            }
            State::Connected(conn) => {
                let read_deadline = last_inbound + connect::WS_READ_TIMEOUT;

                let step = tokio::select! {
                    biased;
                    command = outbound.next() => Step::Outbound(command),
                    _ = ping.tick() => Step::Ping,
                    _ = tokio::time::sleep_until(read_deadline) => {
                        log::warn!("Nothing received for {:?}, reconnecting", connect::WS_READ_TIMEOUT);
                        Step::Closed("Read timeout (connection stale)".to_string())
                    }
                    inbound = conn.inbound.next() => {
                        last_inbound = tokio::time::Instant::now();
                        match inbound {
                            Some(Inbound::Block(block)) => Step::Block(block),
                            Some(Inbound::Reply(opcode, payload)) => Step::Reply(opcode, payload),
                            Some(Inbound::Other) => Step::Idle,
                            Some(Inbound::Closed(reason)) => Step::Closed(reason),
                            None => Step::Closed("Reader stopped".to_string()),
                        }
                    }
                };

                let writer = &mut conn.writer;
                let closed = match step {
                    Step::Outbound(None) => {
                        log::info!("All transport handles dropped, closing connection");
                        let _ = writer.write_frame(WsFrame::close(1000, b"")).await;
                        return;
                    }
                    Step::Outbound(Some(Outbound::Forget(id))) => {
                        if inflight.remove(&id).is_some() {
                            log::trace!("Request {id} forgotten");
                        }
                        None
                    }
                    Step::Outbound(Some(Outbound::Send(envelope))) => {
                        let result = write_envelope(writer, &envelope).await;
                        if envelope.command.is_data()
                            && let Some(id) = envelope.request_id()
                        {
                            // kept even when the write failed, so it is replayed
                            inflight.insert(
                                id.to_string(),
                                InFlight {
                                    envelope: envelope.clone(),
                                    sent_at: Instant::now(),
                                },
                            );
                        }
                        match result {
                            Ok(()) => None,
                            Err(TransportError::Encode(err)) => {
                                log::error!("Dropping unencodable {} command: {err}", envelope.command);
                                None
                            }
                            Err(e) => Some(e.to_string()),
                        }
                    }
                    Step::Ping => write_envelope(writer, &Envelope::ping(RequestId::new()))
                        .await
                        .err()
                        .map(|e| e.to_string()),
                    Step::Reply(opcode, payload) => {
                        let frame = WsFrame::new(true, opcode, None, Payload::Owned(payload));
                        writer
                            .write_frame(frame)
                            .await
                            .err()
                            .map(|e| e.to_string())
                    }
                    Step::Block(block) => match decode_block(block).await {
                        Some(frame) => match route(frame, &mut inflight) {
                            Routed::Forward(event) => {
                                if !emit(output, event).await {
                                    return;
                                }
                                None
                            }
                            Routed::RefreshCredential => refresh_credential(writer, &auth).await,
                            Routed::Ignore => None,
                        },
                        None => None,
                    },
                    Step::Closed(reason) => Some(reason),
                    Step::Idle => None,
                };

                if let Some(reason) = closed {
                    log::warn!(
                        "Connection lost: {reason} ({} requests in flight)",
                        inflight.len()
                    );
                    state = State::Disconnected;
                    if !emit(output, Event::Disconnected(reason)).await {
                        return;
                    }
                }
            }
        }
    }
}

enum Step {
    Outbound(Option<Outbound>),
    Ping,
    Reply(OpCode, Vec<u8>),
    Block(Vec<u8>),
    Closed(String),
    Idle,
}

#[derive(Debug, PartialEq)]
enum Routed {
    Forward(Event),
    RefreshCredential,
    Ignore,
}

/// Returns `false` once nobody listens to the event stream anymore.
async fn emit(output: &mut mpsc::Sender<Event>, event: Event) -> bool {
    output.send(event).await.is_ok()
}

/// `setup` with the current credential, then any unanswered data requests.
async fn handshake<A: AuthProvider>(
    ws: &mut WsWriter,
    auth: &A,
    inflight: &mut InFlightTable,
    now: Instant,
) -> Result<(), TransportError> {
    write_envelope(ws, &Envelope::setup(RequestId::new(), &auth.credential())).await?;

    let replay = replayable(inflight, now);
    if !replay.is_empty() {
        log::info!("Replaying {} in-flight requests", replay.len());
    }
    for envelope in &replay {
        write_envelope(ws, envelope).await?;
    }
    Ok(())
}

/// Drops requests that have waited past [`REPLAY_WINDOW`] and returns the
/// rest, oldest first.
fn replayable(inflight: &mut InFlightTable, now: Instant) -> Vec<Envelope> {
    let before = inflight.len();
    inflight.retain(|_, request| now.saturating_duration_since(request.sent_at) < REPLAY_WINDOW);

    let expired = before - inflight.len();
    if expired > 0 {
        log::warn!("Giving up on {expired} requests the server never answered");
    }

    let mut requests: Vec<&InFlight> = inflight.values().collect();
    requests.sort_by_key(|request| request.sent_at);
    requests.into_iter().map(|request| request.envelope.clone()).collect()
}

async fn refresh_credential<A: AuthProvider>(ws: &mut WsWriter, auth: &A) -> Option<String> {
    match auth.refresh().await {
        Ok(credential) => {
            log::info!("Credential rotated, resending setup");
            write_envelope(ws, &Envelope::setup(RequestId::new(), &credential))
                .await
                .err()
                .map(|e| e.to_string())
        }
        Err(e) => {
            log::error!("Server asked for a credential refresh that failed: {e}");
            None
        }
    }
}

async fn write_envelope(ws: &mut WsWriter, envelope: &Envelope) -> Result<(), TransportError> {
    let json = envelope
        .to_json()
        .map_err(|e| TransportError::Encode(e.to_string()))?;

    ws.write_frame(WsFrame::text(Payload::Borrowed(json.as_bytes())))
        .await
        .map_err(|e| TransportError::Websocket(e.to_string()))
}

/// Decompresses off the reactor. Bad blocks are logged and dropped.
async fn decode_block(block: Vec<u8>) -> Option<Frame> {
    let len = block.len();
    match tokio::task::spawn_blocking(move || frame::decode(&block)).await {
        Ok(Ok(frame)) => Some(frame),
        Ok(Err(e)) => {
            log::warn!("Dropping {len} byte block: {e}");
            None
        }
        Err(e) => {
            log::error!("Frame decoder task failed: {e}");
            None
        }
    }
}

fn route(frame: Frame, inflight: &mut InFlightTable) -> Routed {
    let answered = inflight.remove(frame.request_id()).is_some();

    match frame.header().command() {
        Some(Command::RefreshToken) => Routed::RefreshCredential,
        Some(Command::Notify) => Routed::Forward(Event::Notify(frame.header().clone())),
        Some(command) if command.is_data() => {
            if !answered {
                log::trace!("{command} frame {} was not in flight", frame.request_id());
            }
            Routed::Forward(Event::Frame(frame))
        }
        Some(command) => {
            log::trace!("{command} acknowledged");
            Routed::Ignore
        }
        None => {
            log::debug!("Ignoring frame with unknown command {:?}", frame.header().command);
            Routed::Ignore
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::StaticAuth;
    use crate::command::SeriesRequest;
    use crate::frame::SeriesFrame;
    use crate::{ChannelId, Credential, Segment};

    use serde_json::Value;
    use tokio::{
        io::{AsyncReadExt, AsyncWriteExt},
        net::{
            TcpListener,
            tcp::{OwnedReadHalf, OwnedWriteHalf},
        },
    };

    fn fetch_envelope(id: RequestId) -> Envelope {
        Envelope::series(
            Command::Fetch,
            id,
            &SeriesRequest {
                channel: ChannelId::new("IU.ANMO.00.BHZ"),
                segment: Segment::new(0, 1_000),
                force_center: false,
                resample: true,
                sample_rate: None,
            },
        )
    }

    fn inflight_fetch() -> (String, InFlightTable) {
        let id = RequestId::new();
        let mut inflight = InFlightTable::default();
        inflight.insert(
            id.to_string(),
            InFlight {
                envelope: fetch_envelope(id),
                sent_at: Instant::now(),
            },
        );
        (id.to_string(), inflight)
    }

    fn config(url: &str) -> TransportConfig {
        TransportConfig {
            url: url.to_string(),
            reconnect: ReconnectPolicy {
                min_delay: Duration::from_millis(10),
                max_delay: Duration::from_millis(50),
                offline_after: 5,
            },
            ping_interval: Duration::from_secs(30),
        }
    }

    /// Server end of a loopback websocket: frames from the client are parsed,
    /// frames to the client are written as raw bytes so a test can split them.
    struct Peer {
        reader: fastwebsockets::WebSocketRead<OwnedReadHalf>,
        writer: OwnedWriteHalf,
    }

    impl Peer {
        async fn listen() -> (TcpListener, String) {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            let url = format!("ws://{}/stream", listener.local_addr().unwrap());
            (listener, url)
        }

        async fn accept(listener: &TcpListener) -> Self {
            let (mut tcp, _) = listener.accept().await.unwrap();

            let mut request = Vec::new();
            let mut buf = [0u8; 1024];
            while !request.windows(4).any(|w| w == b"\r\n\r\n") {
                let n = tcp.read(&mut buf).await.unwrap();
                assert!(n > 0, "client hung up during the upgrade");
                request.extend_from_slice(&buf[..n]);
            }
            tcp.write_all(
                b"HTTP/1.1 101 Switching Protocols\r\nUpgrade: websocket\r\nConnection: Upgrade\r\n\r\n",
            )
            .await
            .unwrap();

            let (read, writer) = tcp.into_split();
            let (reader, _) = fastwebsockets::after_handshake_split(
                read,
                tokio::io::sink(),
                fastwebsockets::Role::Server,
            );
            Self { reader, writer }
        }

        async fn recv(&mut self) -> Value {
            let frame = self
                .reader
                .read_frame(&mut |_: WsFrame<'_>| std::future::ready(Ok::<(), &'static str>(())))
                .await
                .unwrap();
            assert_eq!(frame.opcode, OpCode::Text);
            serde_json::from_slice(&frame.payload).unwrap()
        }

        async fn send_raw(&mut self, bytes: &[u8]) {
            self.writer.write_all(bytes).await.unwrap();
        }

        async fn send_block(&mut self, block: &[u8]) {
            self.send_raw(&binary_header(block.len())).await;
            self.send_raw(block).await;
        }
    }

    /// Unmasked, final binary frame header.
    fn binary_header(len: usize) -> Vec<u8> {
        match len {
            0..=125 => vec![0x82, len as u8],
            126..=0xFFFF => {
                let mut header = vec![0x82, 126];
                header.extend_from_slice(&(len as u16).to_be_bytes());
                header
            }
            _ => {
                let mut header = vec![0x82, 127];
                header.extend_from_slice(&(len as u64).to_be_bytes());
                header
            }
        }
    }

    fn refresh_token_block() -> Vec<u8> {
        frame::encode(&Frame::Header(Header::new("rotate", "refreshToken"))).unwrap()
    }

    #[test]
    fn data_frame_is_forwarded_and_leaves_flight() {
        let (id, mut inflight) = inflight_fetch();
        let frame = Frame::Series(SeriesFrame::new(
            Header::new(id.clone(), "stream.fetch"),
            ChannelId::new("IU.ANMO.00.BHZ"),
            Segment::new(0, 1_000),
            0.0,
            10.0,
            vec![1.0, 2.0],
            None,
        ));

        assert_eq!(
            route(frame.clone(), &mut inflight),
            Routed::Forward(Event::Frame(frame))
        );
        assert!(inflight.is_empty());
    }

    #[test]
    fn data_acknowledgement_header_is_forwarded() {
        let (id, mut inflight) = inflight_fetch();
        let ack = Frame::Header(Header::new(id, "stream.fetch"));

        assert!(matches!(
            route(ack, &mut inflight),
            Routed::Forward(Event::Frame(Frame::Header(_)))
        ));
        assert!(inflight.is_empty());
    }

    #[test]
    fn control_frames_are_routed() {
        let mut inflight = InFlightTable::default();

        assert_eq!(
            route(Frame::Header(Header::new("x", "refreshToken")), &mut inflight),
            Routed::RefreshCredential
        );
        assert_eq!(
            route(Frame::Header(Header::new("x", "notify")), &mut inflight),
            Routed::Forward(Event::Notify(Header::new("x", "notify")))
        );
        assert_eq!(
            route(Frame::Header(Header::new("x", "ping")), &mut inflight),
            Routed::Ignore
        );
        assert_eq!(
            route(Frame::Header(Header::new("x", "bogus")), &mut inflight),
            Routed::Ignore
        );
    }

    #[test]
    fn replay_drops_expired_requests_and_keeps_send_order() {
        let now = Instant::now() + REPLAY_WINDOW * 2;
        let (stale, fresh, fresher) = (RequestId::new(), RequestId::new(), RequestId::new());

        let mut inflight = InFlightTable::default();
        for (id, age) in [
            (fresher, Duration::from_secs(1)),
            (stale, REPLAY_WINDOW + Duration::from_secs(1)),
            (fresh, Duration::from_secs(30)),
        ] {
            inflight.insert(
                id.to_string(),
                InFlight {
                    envelope: fetch_envelope(id),
                    sent_at: now - age,
                },
            );
        }

        let replay = replayable(&mut inflight, now);
        let ids: Vec<_> = replay.iter().filter_map(Envelope::request_id).collect();

        assert_eq!(ids, vec![fresh.to_string(), fresher.to_string()]);
        assert!(!inflight.contains_key(&stale.to_string()));
    }

    #[tokio::test]
    async fn corrupt_block_is_dropped() {
        assert!(decode_block(b"garbage".to_vec()).await.is_none());
    }

    #[tokio::test]
    async fn valid_block_decodes_off_thread() {
        let block = frame::encode(&Frame::Header(Header::new("abc", "notify"))).unwrap();
        assert_eq!(
            decode_block(block).await,
            Some(Frame::Header(Header::new("abc", "notify")))
        );
    }

    #[test]
    fn send_after_stream_dropped_is_not_connected() {
        let (handle, events) = connect(
            config("ws://127.0.0.1:9/stream"),
            StaticAuth::new(Credential::new("a", "r")),
        );
        drop(events);

        assert_eq!(
            handle.send(Envelope::ping(RequestId::new())),
            Err(TransportError::NotConnected)
        );
        assert!(handle.is_closed());
    }

    #[tokio::test]
    async fn frame_split_across_reads_survives_a_concurrent_send() {
        let (listener, url) = Peer::listen().await;

        let data: Vec<f32> = (0..4_000).map(|i| (i as f32 * 0.01).sin() * 1_000.0).collect();
        let sent = SeriesFrame::new(
            Header::new(RequestId::new().to_string(), "stream.fetch"),
            ChannelId::new("IU.ANMO.00.BHZ"),
            Segment::new(1_700_000_000_000, 1_700_000_100_000),
            1_700_000_000_000.0,
            40.0,
            data,
            None,
        );
        let block = frame::encode(&Frame::Series(sent.clone())).unwrap();
        assert!(block.len() > 1_000);

        let (mid_frame, mid_frame_rx) = tokio::sync::oneshot::channel();
        let server = tokio::spawn(async move {
            let mut peer = Peer::accept(&listener).await;
            let setup = peer.recv().await;

            peer.send_raw(&binary_header(block.len())).await;
            peer.send_raw(&block[..100]).await;
            mid_frame.send(()).unwrap();
            tokio::time::sleep(Duration::from_millis(300)).await;
            peer.send_raw(&block[100..]).await;

            let next = peer.recv().await;
            (setup, next)
        });

        let (handle, events) = connect(config(&url), StaticAuth::new(Credential::new("a", "r")));
        let mut events = std::pin::pin!(events);

        let collect = async {
            let mut seen = Vec::new();
            while let Some(event) = events.next().await {
                let done = matches!(event, Event::Frame(_) | Event::Disconnected(_));
                seen.push(event);
                if done {
                    break;
                }
            }
            seen
        };
        let send_mid_frame = async {
            mid_frame_rx.await.unwrap();
            tokio::time::sleep(Duration::from_millis(50)).await;
            handle.send(Envelope::ping(RequestId::new())).unwrap();
        };

        let (seen, ()) = tokio::time::timeout(Duration::from_secs(10), async {
            tokio::join!(collect, send_mid_frame)
        })
        .await
        .unwrap();

        assert_eq!(seen.len(), 2, "unexpected events: {seen:?}");
        assert_eq!(seen[0], Event::Connected);
        let Event::Frame(Frame::Series(got)) = &seen[1] else {
            panic!("expected the series frame, got {:?}", seen[1]);
        };
        assert_eq!(got.header.request_id, sent.header.request_id);
        assert_eq!(got.series.data, sent.series.data);

        let (setup, next) = server.await.unwrap();
        assert_eq!(setup["command"], "setup");
        assert_eq!(next["command"], "ping");
    }

    #[tokio::test]
    async fn setup_rotation_and_replay_reach_the_server_in_order() {
        let (listener, url) = Peer::listen().await;

        let server = tokio::spawn(async move {
            let mut received = Vec::new();

            let mut first = Peer::accept(&listener).await;
            for _ in 0..3 {
                received.push(first.recv().await);
            }
            first.send_block(&refresh_token_block()).await;
            received.push(first.recv().await);
            drop(first);

            let mut second = Peer::accept(&listener).await;
            for _ in 0..2 {
                received.push(second.recv().await);
            }
            // a second rotation proves nothing else was queued behind the replay
            second.send_block(&refresh_token_block()).await;
            received.push(second.recv().await);

            received
        });

        let auth = StaticAuth::new(Credential::new("a1", "r1"));
        let (handle, events) = connect(config(&url), auth.clone());
        let mut events = std::pin::pin!(events);

        let (kept, forgotten) = (RequestId::new(), RequestId::new());
        let mut server = server;
        let mut connects = 0;

        let received = tokio::time::timeout(Duration::from_secs(10), async {
            loop {
                tokio::select! {
                    done = &mut server => break done.unwrap(),
                    Some(event) = events.next() => {
                        if event == Event::Connected {
                            connects += 1;
                            if connects == 1 {
                                auth.replace(Credential::new("a2", "r2"));
                                handle.send(fetch_envelope(kept)).unwrap();
                                handle.send(fetch_envelope(forgotten)).unwrap();
                                handle.forget(forgotten);
                            }
                        }
                    }
                }
            }
        })
        .await
        .unwrap();

        let commands: Vec<_> = received
            .iter()
            .map(|msg| msg["command"].as_str().unwrap_or_default())
            .collect();
        assert_eq!(
            commands,
            vec![
                "setup",
                "stream.fetch",
                "stream.fetch",
                "setup",
                "setup",
                "stream.fetch",
                "setup",
            ]
        );

        let access = |i: usize| received[i]["data"]["token"]["access"].clone();
        assert_eq!(access(0), "a1");
        assert_eq!(access(3), "a2");
        assert_eq!(access(4), "a2");
        assert_eq!(received[5]["data"]["requestId"], kept.to_string());
    }
}
