use std::sync::{Arc, OnceLock};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, Interval};
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use url::Url;

use crate::correlation::CorrelationTable;
use crate::error::SignalingError;
use crate::protocol::{
    self, EVENT_SIG, EVENT_SIG_ACK, EVENT_SYN_ACK, Frame, FrameType, OpenMessage, Outbound, SigAck,
    Signal, SynAck, SynRequest,
};

pub type ConnectedHandler = Arc<dyn Fn(Result<(), SignalingError>) + Send + Sync>;
pub type SignaledHandler = Arc<dyn Fn(Signal) + Send + Sync>;
pub type SendCallback = Box<dyn FnOnce(Result<(), SignalingError>) + Send>;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionPhase {
    Disconnected,
    Handshaking,
    Connected,
}

// 发往写端的命令
#[derive(Debug)]
enum Command {
    Frame(String),
    Close,
}

/// Client side of the signaling server.
///
/// Both handlers must be installed before [`connect`](Self::connect). The connected handler
/// fires once the identity synchronization completes (or is rejected); the signaled handler
/// receives every server-initiated `sig` envelope.
pub struct SignalingClient {
    name: String,
    is_sender: bool,
    on_connected: Option<ConnectedHandler>,
    on_signaled: Option<SignaledHandler>,
    session: Option<Arc<Session>>,
}

impl SignalingClient {
    pub fn new(name: impl Into<String>, is_sender: bool) -> Self {
        Self {
            name: name.into(),
            is_sender,
            on_connected: None,
            on_signaled: None,
            session: None,
        }
    }

    pub fn set_on_connected<F>(&mut self, handler: F)
    where
        F: Fn(Result<(), SignalingError>) + Send + Sync + 'static,
    {
        self.on_connected = Some(Arc::new(handler));
    }

    pub fn set_on_signaled<F>(&mut self, handler: F)
    where
        F: Fn(Signal) + Send + Sync + 'static,
    {
        self.on_signaled = Some(Arc::new(handler));
    }

    /// Open the connection and start the receive loop.
    ///
    /// The returned handle resolves when the loop ends: `Ok(())` after a close, or the
    /// fatal error that stopped it.
    pub async fn connect(
        &mut self,
        url: &str,
    ) -> Result<JoinHandle<Result<(), SignalingError>>, SignalingError> {
        let on_connected = self
            .on_connected
            .clone()
            .ok_or(SignalingError::MissingHandler("connected"))?;
        let on_signaled = self
            .on_signaled
            .clone()
            .ok_or(SignalingError::MissingHandler("signaled"))?;

        let parsed = Url::parse(url).map_err(|e| SignalingError::InvalidUrl(e.to_string()))?;
        if !matches!(parsed.scheme(), "ws" | "wss") {
            return Err(SignalingError::InvalidUrl(format!(
                "unsupported scheme {:?}",
                parsed.scheme()
            )));
        }

        log::info!("Connecting to {}...", url);
        let (ws_stream, _) = connect_async(url).await?;
        log::info!("Connected!");

        let (tx_cmd, rx_cmd) = mpsc::unbounded_channel();
        let session = Arc::new(Session::new(
            self.name.clone(),
            self.is_sender,
            on_connected,
            on_signaled,
            tx_cmd,
        ));
        self.session = Some(session.clone());

        Ok(tokio::spawn(receive_loop(session, ws_stream, rx_cmd)))
    }

    /// Send a message; `callback` runs once with the outcome carried by its acknowledgment.
    pub fn send<F>(&self, message: Outbound, callback: F)
    where
        F: FnOnce(Result<(), SignalingError>) + Send + 'static,
    {
        match &self.session {
            Some(session) => session.send(message, Box::new(callback)),
            None => callback(Err(SignalingError::NotConnected)),
        }
    }

    /// Close the connection. The receive loop exits after the close frame is written.
    pub fn disconnect(&self) {
        if let Some(session) = &self.session {
            let _ = session.outbound.send(Command::Close);
        }
    }

    /// Id assigned to this client by the server's OPEN frame.
    pub fn local_id(&self) -> Option<String> {
        self.session.as_ref().and_then(|s| s.local_id.get().cloned())
    }

    /// Id of the sending peer, known after a successful handshake.
    pub fn peer_id(&self) -> Option<String> {
        self.session.as_ref().and_then(|s| s.peer_id.get().cloned())
    }

    pub fn phase(&self) -> ConnectionPhase {
        self.session
            .as_ref()
            .map(|s| s.phase())
            .unwrap_or(ConnectionPhase::Disconnected)
    }
}

/// State shared between callers of `send` and the receive loop.
struct Session {
    name: String,
    is_sender: bool,
    phase: Mutex<ConnectionPhase>,
    local_id: OnceLock<String>,
    peer_id: OnceLock<String>,
    ping_interval: Mutex<Option<Duration>>,
    pending: CorrelationTable<SendCallback>,
    outbound: mpsc::UnboundedSender<Command>,
    on_connected: ConnectedHandler,
    on_signaled: SignaledHandler,
}

impl Session {
    fn new(
        name: String,
        is_sender: bool,
        on_connected: ConnectedHandler,
        on_signaled: SignaledHandler,
        outbound: mpsc::UnboundedSender<Command>,
    ) -> Self {
        Self {
            name,
            is_sender,
            phase: Mutex::new(ConnectionPhase::Disconnected),
            local_id: OnceLock::new(),
            peer_id: OnceLock::new(),
            ping_interval: Mutex::new(None),
            pending: CorrelationTable::new(),
            outbound,
            on_connected,
            on_signaled,
        }
    }

    fn phase(&self) -> ConnectionPhase {
        *self.phase.lock()
    }

    fn set_phase(&self, phase: ConnectionPhase) {
        let mut current = self.phase.lock();
        if *current != phase {
            log::debug!("signaling phase {:?} -> {:?}", *current, phase);
            *current = phase;
        }
    }

    fn send(&self, mut message: Outbound, callback: SendCallback) {
        let id = self.pending.next_id();
        message.set_msg_id(id);

        let frame = match message.encode() {
            Ok(frame) => frame,
            Err(e) => {
                callback(Err(SignalingError::Encode(e)));
                return;
            }
        };

        log::debug!("sending {} (msgId={})", message.event(), id);
        self.pending.insert(id, callback);
        if self.outbound.send(Command::Frame(frame)).is_err() {
            if let Some(callback) = self.pending.take(id) {
                callback(Err(SignalingError::NotConnected));
            }
        }
    }

    /// Dispatch one inbound text frame. An `Err` is fatal for the session.
    fn handle_frame(&self, text: &str) -> Result<(), SignalingError> {
        let frame = Frame::parse(text)?;
        match frame.kind {
            Some(FrameType::Open) => self.handle_open(frame.body),
            Some(FrameType::CommonMessage) => self.handle_event(frame.body),
            Some(FrameType::EmptyMessage) => Ok(()),
            Some(
                kind @ (FrameType::Close
                | FrameType::Ping
                | FrameType::Pong
                | FrameType::Message
                | FrameType::Ack),
            ) => {
                log::debug!("ignoring {:?} frame: {}", kind, frame.body);
                Ok(())
            }
            None => {
                log::warn!("unhandled frame type: {}", frame.code);
                Ok(())
            }
        }
    }

    fn handle_open(&self, body: &str) -> Result<(), SignalingError> {
        let open: OpenMessage = serde_json::from_str(body)?;
        log::info!(
            "session open: sid={} pingInterval={} pingTimeout={}",
            open.sid,
            open.ping_interval,
            open.ping_timeout
        );
        if self.local_id.set(open.sid).is_err() {
            log::warn!("duplicate OPEN frame, keeping the first session id");
        }
        if open.ping_interval > 0 {
            *self.ping_interval.lock() = Some(Duration::from_millis(open.ping_interval));
        }
        self.set_phase(ConnectionPhase::Handshaking);

        let on_connected = self.on_connected.clone();
        self.send(
            Outbound::Syn(SynRequest::new(self.name.clone(), self.is_sender)),
            Box::new(move |result: Result<(), SignalingError>| on_connected(result)),
        );
        Ok(())
    }

    fn handle_event(&self, body: &str) -> Result<(), SignalingError> {
        let (event, payload) = protocol::decode_event(body)?;
        match event.as_str() {
            EVENT_SYN_ACK => {
                let ack: SynAck = serde_json::from_value(payload)?;
                let callback = self
                    .pending
                    .take(ack.msg_id)
                    .ok_or(SignalingError::UnmatchedAck(ack.msg_id))?;
                if ack.success {
                    match ack.sender_id {
                        Some(peer) if self.peer_id.set(peer.clone()).is_err() => {
                            log::warn!("peer id already set, ignoring repeated syn-ack value");
                        }
                        Some(_) => {}
                        None => log::warn!("syn-ack carries no sender id"),
                    }
                    self.set_phase(ConnectionPhase::Connected);
                    callback(Ok(()));
                } else {
                    callback(Err(SignalingError::HandshakeRejected(ack.reason)));
                }
            }
            EVENT_SIG_ACK => {
                let ack: SigAck = serde_json::from_value(payload)?;
                let callback = self
                    .pending
                    .take(ack.msg_id)
                    .ok_or(SignalingError::UnmatchedAck(ack.msg_id))?;
                if ack.success {
                    callback(Ok(()));
                } else {
                    callback(Err(SignalingError::SignalRejected(ack.reason)));
                }
            }
            EVENT_SIG => {
                let signal: Signal = serde_json::from_value(payload)?;
                log::info!("sig received: type={:?} from={}", signal.kind, signal.from);
                (self.on_signaled)(signal);
            }
            other => {
                log::warn!("Unknown event: {} {}", other, summarize(&payload));
            }
        }
        log::trace!("{} requests awaiting acknowledgment", self.pending.len());
        Ok(())
    }

    fn keepalive_period(&self) -> Option<Duration> {
        *self.ping_interval.lock()
    }
}

fn summarize(payload: &Value) -> String {
    let text = payload.to_string();
    if text.chars().count() > 120 {
        format!("{}...", text.chars().take(120).collect::<String>())
    } else {
        text
    }
}

async fn next_tick(keepalive: &mut Option<Interval>) {
    match keepalive {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}

// 主循环，处理读取、写入和保活
async fn receive_loop(
    session: Arc<Session>,
    ws_stream: WsStream,
    mut rx_cmd: mpsc::UnboundedReceiver<Command>,
) -> Result<(), SignalingError> {
    let (mut write, mut read) = ws_stream.split();
    let mut keepalive: Option<Interval> = None;

    let result = loop {
        tokio::select! {
            msg = read.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        if let Err(e) = session.handle_frame(text.as_str()) {
                            log::error!("signaling protocol violation: {}", e);
                            break Err(e);
                        }
                        if keepalive.is_none() {
                            if let Some(period) = session.keepalive_period() {
                                keepalive = Some(tokio::time::interval_at(Instant::now() + period, period));
                            }
                        }
                    }
                    Some(Ok(Message::Close(frame))) => {
                        log::info!("Server closed connection: {:?}", frame);
                        break Ok(());
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        log::warn!("read error: {}", e);
                        break Err(e.into());
                    }
                    None => break Ok(()),
                }
            }
            Some(cmd) = rx_cmd.recv() => {
                match cmd {
                    Command::Frame(text) => {
                        if let Err(e) = write.send(Message::Text(text.into())).await {
                            break Err(e.into());
                        }
                    }
                    Command::Close => {
                        log::info!("closing signaling connection");
                        if let Err(e) = write.close().await {
                            log::debug!("close error: {}", e);
                        }
                        break Ok(());
                    }
                }
            }
            _ = next_tick(&mut keepalive) => {
                if let Err(e) = write.send(Message::Text(FrameType::Ping.code().into())).await {
                    break Err(e.into());
                }
            }
        }
    };

    session.set_phase(ConnectionPhase::Disconnected);
    result
}
