use std::sync::Arc;

use anyhow::{Context, Result, anyhow, bail};
use async_trait::async_trait;
use tokio::sync::mpsc;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;

use crate::audio::{StreamError, StreamStats};
use crate::error::SignalingError;
use crate::negotiator::{MediaTransport, Negotiator};
use crate::protocol::{Outbound, Signal, SignalKind};
use crate::signaling::{ConnectionPhase, SignalingClient};

/// Everything the coordinator reacts to, from signaling callbacks, the peer connection
/// and playback threads.
#[derive(Debug)]
pub enum CallEvent {
    SignalingReady(Result<(), SignalingError>),
    Signaled(Signal),
    LocalCandidate(RTCIceCandidateInit),
    StreamEnded {
        ssrc: u32,
        result: Result<StreamStats, StreamError>,
    },
}

/// Builds the media transport once signaling is ready.
#[async_trait]
pub trait TransportFactory: Send + Sync {
    type Transport: MediaTransport + 'static;

    async fn create(&self, events: mpsc::UnboundedSender<CallEvent>) -> Result<Self::Transport>;
}

pub struct CallController<F: TransportFactory> {
    factory: F,
    signaling: SignalingClient,
    negotiator: Option<Negotiator<F::Transport>>,
    events: mpsc::UnboundedSender<CallEvent>,
}

impl<F: TransportFactory> CallController<F> {
    pub fn new(
        factory: F,
        signaling: SignalingClient,
        events: mpsc::UnboundedSender<CallEvent>,
    ) -> Self {
        Self {
            factory,
            signaling,
            negotiator: None,
            events,
        }
    }

    /// Handle one event. An `Err` is fatal for the call.
    pub async fn handle_event(&mut self, event: CallEvent) -> Result<()> {
        match event {
            CallEvent::SignalingReady(result) => {
                result.context("signaling handshake failed")?;
                self.start_negotiation().await
            }
            CallEvent::Signaled(signal) => {
                log::info!("Signal {:?} from {}", signal.kind, signal.from);
                let Some(negotiator) = &self.negotiator else {
                    log::warn!("signal from {} arrived before negotiation started", signal.from);
                    return Ok(());
                };
                negotiator
                    .handle_signal(&signal)
                    .await
                    .context("failed to apply remote signal")?;
                Ok(())
            }
            CallEvent::LocalCandidate(candidate) => {
                self.send_candidate(&candidate);
                Ok(())
            }
            CallEvent::StreamEnded { ssrc, result } => match result {
                Ok(stats) => {
                    log::info!(
                        "Stream {} ended: {} frames played, {} dropped",
                        ssrc,
                        stats.played,
                        stats.dropped
                    );
                    Ok(())
                }
                Err(e) => Err(anyhow!(e).context(format!("stream {} failed", ssrc))),
            },
        }
    }

    async fn start_negotiation(&mut self) -> Result<()> {
        let phase = self.signaling.phase();
        if phase != ConnectionPhase::Connected {
            bail!("cannot negotiate while signaling is {:?}", phase);
        }
        // 服务器在没有发送端时也会回复成功，只是不带 senderId
        let peer_id = self
            .signaling
            .peer_id()
            .ok_or_else(|| anyhow!("server reported no sender connected (syn-ack without senderId)"))?;
        log::info!(
            "Signaling ready (local id {:?}), negotiating with {}",
            self.signaling.local_id(),
            peer_id
        );

        let transport = self
            .factory
            .create(self.events.clone())
            .await
            .context("failed to create peer connection")?;
        let negotiator = Negotiator::new(Arc::new(transport));

        let offer = negotiator
            .create_offer(&peer_id)
            .await
            .context("failed to create offer")?;
        self.negotiator = Some(negotiator);
        self.send_signal(offer);
        Ok(())
    }

    fn send_candidate(&self, candidate: &RTCIceCandidateInit) {
        let (Some(negotiator), Some(peer_id)) = (&self.negotiator, self.signaling.peer_id())
        else {
            log::warn!("dropping local candidate, no peer to send it to");
            return;
        };
        match negotiator.candidate_signal(&peer_id, candidate) {
            Ok(signal) => self.send_signal(signal),
            Err(e) => log::warn!("{}", e),
        }
    }

    fn send_signal(&self, signal: Signal) {
        let kind: SignalKind = signal.kind;
        let to = signal.to.clone();
        self.signaling.send(Outbound::Signal(signal), move |result| match result {
            Ok(()) => log::info!("{:?} delivered to {}", kind, to),
            Err(e) if e.is_fatal() => log::error!("{:?} to {} lost: {}", kind, to, e),
            Err(e) => log::warn!("{:?} to {} not delivered: {}", kind, to, e),
        });
    }

    /// Close the signaling connection and the peer connection.
    pub async fn shutdown(&mut self) {
        self.signaling.disconnect();
        if let Some(negotiator) = self.negotiator.take() {
            if let Err(e) = negotiator.transport().close().await {
                log::warn!("failed to close peer connection: {:#}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{self, EVENT_SIG_ACK, EVENT_SYN_ACK, Frame};
    use futures_util::{SinkExt, StreamExt};
    use parking_lot::Mutex;
    use serde_json::{Value, json};
    use std::time::Duration;
    use tokio::net::TcpListener;
    use tokio::time::timeout;
    use tokio_tungstenite::accept_async;
    use tokio_tungstenite::tungstenite::protocol::Message;
    use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;

    type Calls = Arc<Mutex<Vec<String>>>;

    struct FakeTransport {
        calls: Calls,
    }

    #[async_trait]
    impl MediaTransport for FakeTransport {
        async fn create_offer(&self) -> Result<RTCSessionDescription> {
            self.calls.lock().push("create_offer".into());
            Ok(serde_json::from_value(json!({"type": "offer", "sdp": "v=0\r\n"}))?)
        }

        async fn set_local_description(&self, desc: RTCSessionDescription) -> Result<()> {
            self.calls.lock().push(format!("local:{}", desc.sdp_type));
            Ok(())
        }

        async fn set_remote_description(&self, desc: RTCSessionDescription) -> Result<()> {
            self.calls.lock().push(format!("remote:{}", desc.sdp_type));
            Ok(())
        }

        async fn add_remote_candidate(&self, candidate: RTCIceCandidateInit) -> Result<()> {
            self.calls.lock().push(format!("candidate:{}", candidate.candidate));
            Ok(())
        }

        async fn close(&self) -> Result<()> {
            self.calls.lock().push("close".into());
            Ok(())
        }
    }

    #[derive(Default)]
    struct FakeFactory {
        calls: Calls,
    }

    #[async_trait]
    impl TransportFactory for FakeFactory {
        type Transport = FakeTransport;

        async fn create(&self, _events: mpsc::UnboundedSender<CallEvent>) -> Result<FakeTransport> {
            self.calls.lock().push("create".into());
            Ok(FakeTransport {
                calls: self.calls.clone(),
            })
        }
    }

    fn controller() -> (CallController<FakeFactory>, Calls) {
        let (tx, _rx) = mpsc::unbounded_channel();
        let factory = FakeFactory::default();
        let calls = factory.calls.clone();
        let signaling = SignalingClient::new("Server", false);
        (CallController::new(factory, signaling, tx), calls)
    }

    // 模拟信令服务器：应答 syn/sig，并把收到的事件帧转给测试
    async fn signaling_server(
        listener: TcpListener,
        frames: mpsc::UnboundedSender<String>,
        sender_id: Option<&'static str>,
    ) {
        let (stream, _) = listener.accept().await.unwrap();
        let mut ws = accept_async(stream).await.unwrap();
        ws.send(Message::Text(
            r#"0{"sid":"S1","upgrades":[],"pingInterval":25000,"pingTimeout":60000}"#.into(),
        ))
        .await
        .unwrap();

        while let Some(Ok(msg)) = ws.next().await {
            let text = match msg {
                Message::Text(text) => text.as_str().to_owned(),
                Message::Close(_) => break,
                _ => continue,
            };
            if !text.starts_with("42") {
                continue;
            }
            let (event, payload) =
                protocol::decode_event(Frame::parse(&text).unwrap().body).unwrap();
            let ack = match event.as_str() {
                "syn" => {
                    let mut ack = json!({"msgId": payload["msgId"], "success": true});
                    if let Some(id) = sender_id {
                        ack["senderId"] = json!(id);
                    }
                    protocol::encode_event(EVENT_SYN_ACK, &ack)
                }
                "sig" => protocol::encode_event(
                    EVENT_SIG_ACK,
                    &json!({"msgId": payload["msgId"], "success": true}),
                ),
                _ => continue,
            }
            .unwrap();
            let _ = frames.send(text);
            ws.send(Message::Text(ack.into())).await.unwrap();
        }
    }

    async fn next_event_payload(frames: &mut mpsc::UnboundedReceiver<String>) -> (String, Value) {
        let text = timeout(Duration::from_secs(5), frames.recv())
            .await
            .unwrap()
            .unwrap();
        protocol::decode_event(Frame::parse(&text).unwrap().body).unwrap()
    }

    #[tokio::test]
    async fn call_flow_over_websocket() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx_frames, mut rx_frames) = mpsc::unbounded_channel();
        let server = tokio::spawn(signaling_server(listener, tx_frames, Some("P1")));

        let (tx_event, mut rx_event) = mpsc::unbounded_channel();
        let mut signaling = SignalingClient::new("Server", false);
        let tx = tx_event.clone();
        signaling.set_on_connected(move |r| {
            let _ = tx.send(CallEvent::SignalingReady(r));
        });
        let tx = tx_event.clone();
        signaling.set_on_signaled(move |s| {
            let _ = tx.send(CallEvent::Signaled(s));
        });
        let receive_loop = signaling
            .connect(&format!("ws://{}/socket.io/?EIO=3&transport=websocket", addr))
            .await
            .unwrap();

        let factory = FakeFactory::default();
        let calls = factory.calls.clone();
        let mut ctrl = CallController::new(factory, signaling, tx_event);

        let (event, _) = next_event_payload(&mut rx_frames).await;
        assert_eq!(event, "syn");

        let ready = timeout(Duration::from_secs(5), rx_event.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(ready, CallEvent::SignalingReady(Ok(()))));
        assert!(calls.lock().is_empty());

        // handshake done: the offer goes to the sender
        ctrl.handle_event(ready).await.unwrap();
        let (event, offer) = next_event_payload(&mut rx_frames).await;
        assert_eq!(event, "sig");
        assert_eq!(offer["msgId"], 2);
        assert_eq!(offer["type"], "description");
        assert_eq!(offer["to"], "P1");
        assert_eq!(offer["body"]["type"], "offer");
        assert_eq!(*calls.lock(), vec!["create", "create_offer", "local:offer"]);

        ctrl.handle_event(CallEvent::LocalCandidate(RTCIceCandidateInit {
            candidate: "candidate:1 1 udp 2130706431 10.0.0.2 6000 typ host".into(),
            sdp_mid: Some("0".into()),
            sdp_mline_index: Some(0),
            username_fragment: None,
        }))
        .await
        .unwrap();
        let (event, candidate) = next_event_payload(&mut rx_frames).await;
        assert_eq!(event, "sig");
        assert_eq!(candidate["msgId"], 3);
        assert_eq!(candidate["type"], "candidate");
        assert_eq!(candidate["to"], "P1");
        assert_eq!(candidate["body"]["sdpMLineIndex"], 0);
        assert!(candidate["body"]["candidate"].as_str().unwrap().ends_with("typ host"));

        let answer: Signal = serde_json::from_value(json!({
            "msgId": 9,
            "type": "description",
            "to": "S1",
            "from": "P1",
            "body": {"type": "answer", "sdp": "v=0\r\n"}
        }))
        .unwrap();
        ctrl.handle_event(CallEvent::Signaled(answer)).await.unwrap();
        assert_eq!(calls.lock().last().map(String::as_str), Some("remote:answer"));

        ctrl.shutdown().await;
        assert_eq!(calls.lock().last().map(String::as_str), Some("close"));
        let outcome = timeout(Duration::from_secs(5), receive_loop)
            .await
            .unwrap()
            .unwrap();
        assert!(outcome.is_ok());
        server.await.unwrap();
    }

    #[tokio::test]
    async fn handshake_without_sender_is_fatal() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx_frames, _rx_frames) = mpsc::unbounded_channel();
        let server = tokio::spawn(signaling_server(listener, tx_frames, None));

        let (tx_event, mut rx_event) = mpsc::unbounded_channel();
        let mut signaling = SignalingClient::new("Server", false);
        let tx = tx_event.clone();
        signaling.set_on_connected(move |r| {
            let _ = tx.send(CallEvent::SignalingReady(r));
        });
        signaling.set_on_signaled(|_| {});
        let receive_loop = signaling
            .connect(&format!("ws://{}/", addr))
            .await
            .unwrap();

        let factory = FakeFactory::default();
        let calls = factory.calls.clone();
        let mut ctrl = CallController::new(factory, signaling, tx_event);

        let ready = timeout(Duration::from_secs(5), rx_event.recv())
            .await
            .unwrap()
            .unwrap();
        let err = ctrl.handle_event(ready).await.unwrap_err();
        assert!(err.to_string().contains("no sender connected"));
        assert!(calls.lock().is_empty());

        ctrl.shutdown().await;
        let _ = timeout(Duration::from_secs(5), receive_loop).await;
        server.await.unwrap();
    }

    #[tokio::test]
    async fn rejected_handshake_is_fatal() {
        let (mut ctrl, calls) = controller();
        let err = ctrl
            .handle_event(CallEvent::SignalingReady(Err(SignalingError::HandshakeRejected(
                "busy".into(),
            ))))
            .await
            .unwrap_err();
        assert!(format!("{:#}", err).contains("syn failed: busy"));
        assert!(calls.lock().is_empty());
    }

    #[tokio::test]
    async fn negotiation_needs_a_completed_handshake() {
        let (mut ctrl, calls) = controller();
        let err = ctrl
            .handle_event(CallEvent::SignalingReady(Ok(())))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("Disconnected"));
        assert!(calls.lock().is_empty());
    }

    #[tokio::test]
    async fn early_signals_and_candidates_are_dropped() {
        let (mut ctrl, calls) = controller();
        let signal = Signal::new(SignalKind::Candidate, "S1", json!({}));
        ctrl.handle_event(CallEvent::Signaled(signal)).await.unwrap();
        ctrl.handle_event(CallEvent::LocalCandidate(RTCIceCandidateInit::default()))
            .await
            .unwrap();
        assert!(calls.lock().is_empty());
    }

    #[tokio::test]
    async fn stream_outcome_decides_fatality() {
        let (mut ctrl, _) = controller();
        ctrl.handle_event(CallEvent::StreamEnded {
            ssrc: 7,
            result: Ok(StreamStats {
                played: 10,
                dropped: 1,
            }),
        })
        .await
        .unwrap();

        let err = ctrl
            .handle_event(CallEvent::StreamEnded {
                ssrc: 7,
                result: Err(StreamError::Sink(anyhow!("device gone"))),
            })
            .await
            .unwrap_err();
        assert!(format!("{:#}", err).contains("device gone"));
    }
}
