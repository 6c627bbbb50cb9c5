//! Offer/answer and candidate handling between signaling and the media transport.

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;

use crate::protocol::{Signal, SignalKind};

/// The media transport as seen by the negotiator.
#[async_trait]
pub trait MediaTransport: Send + Sync {
    async fn create_offer(&self) -> anyhow::Result<RTCSessionDescription>;
    async fn set_local_description(&self, desc: RTCSessionDescription) -> anyhow::Result<()>;
    async fn set_remote_description(&self, desc: RTCSessionDescription) -> anyhow::Result<()>;
    async fn add_remote_candidate(&self, candidate: RTCIceCandidateInit) -> anyhow::Result<()>;
    async fn close(&self) -> anyhow::Result<()>;
}

#[derive(Debug, Error)]
pub enum NegotiationError {
    #[error("{kind:?} body does not match the expected shape: {source}")]
    Body {
        kind: SignalKind,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to encode local {0:?}: {1}")]
    Encode(SignalKind, #[source] serde_json::Error),

    #[error("transport rejected {0:?}: {1:#}")]
    Transport(SignalKind, anyhow::Error),
}

pub struct Negotiator<T: ?Sized> {
    transport: Arc<T>,
}

impl<T: MediaTransport + ?Sized> Negotiator<T> {
    pub fn new(transport: Arc<T>) -> Self {
        Self { transport }
    }

    pub fn transport(&self) -> &Arc<T> {
        &self.transport
    }

    /// Create a local offer, apply it, and wrap it for the peer `to`.
    pub async fn create_offer(&self, to: &str) -> Result<Signal, NegotiationError> {
        let kind = SignalKind::Description;
        let offer = self
            .transport
            .create_offer()
            .await
            .map_err(|e| NegotiationError::Transport(kind, e))?;
        log::debug!("local SDP: {}", offer.sdp);

        let body =
            serde_json::to_value(&offer).map_err(|e| NegotiationError::Encode(kind, e))?;
        self.transport
            .set_local_description(offer)
            .await
            .map_err(|e| NegotiationError::Transport(kind, e))?;

        Ok(Signal::new(kind, to, body))
    }

    /// Wrap a locally gathered candidate for the peer `to`.
    pub fn candidate_signal(
        &self,
        to: &str,
        candidate: &RTCIceCandidateInit,
    ) -> Result<Signal, NegotiationError> {
        let kind = SignalKind::Candidate;
        let body =
            serde_json::to_value(candidate).map_err(|e| NegotiationError::Encode(kind, e))?;
        Ok(Signal::new(kind, to, body))
    }

    /// Apply a signal received from the peer.
    pub async fn handle_signal(&self, signal: &Signal) -> Result<(), NegotiationError> {
        match signal.kind {
            SignalKind::Description => {
                let desc: RTCSessionDescription = self.typed_body(signal)?;
                log::info!("received remote description ({})", desc.sdp_type);
                log::debug!("remote SDP: {}", desc.sdp);
                self.transport
                    .set_remote_description(desc)
                    .await
                    .map_err(|e| NegotiationError::Transport(signal.kind, e))
            }
            SignalKind::Candidate => {
                let candidate: RTCIceCandidateInit = self.typed_body(signal)?;
                log::info!("received remote candidate: {}", candidate.candidate);
                self.transport
                    .add_remote_candidate(candidate)
                    .await
                    .map_err(|e| NegotiationError::Transport(signal.kind, e))
            }
            SignalKind::Unknown => {
                log::warn!("ignoring signal of unknown type from {}", signal.from);
                Ok(())
            }
        }
    }

    fn typed_body<B: serde::de::DeserializeOwned>(
        &self,
        signal: &Signal,
    ) -> Result<B, NegotiationError> {
        B::deserialize(&signal.body).map_err(|source| NegotiationError::Body {
            kind: signal.kind,
            source,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;
    use parking_lot::Mutex;
    use serde_json::json;
    use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;

    #[derive(Default)]
    struct FakeTransport {
        local: Mutex<Vec<RTCSessionDescription>>,
        remote: Mutex<Vec<RTCSessionDescription>>,
        candidates: Mutex<Vec<RTCIceCandidateInit>>,
        reject_remote: bool,
    }

    #[async_trait]
    impl MediaTransport for FakeTransport {
        async fn create_offer(&self) -> anyhow::Result<RTCSessionDescription> {
            Ok(serde_json::from_value(json!({"type": "offer", "sdp": "v=0\r\no=- 1 1 IN IP4 0.0.0.0\r\n"}))?)
        }

        async fn set_local_description(&self, desc: RTCSessionDescription) -> anyhow::Result<()> {
            self.local.lock().push(desc);
            Ok(())
        }

        async fn set_remote_description(&self, desc: RTCSessionDescription) -> anyhow::Result<()> {
            if self.reject_remote {
                return Err(anyhow!("bad sdp"));
            }
            self.remote.lock().push(desc);
            Ok(())
        }

        async fn add_remote_candidate(&self, candidate: RTCIceCandidateInit) -> anyhow::Result<()> {
            self.candidates.lock().push(candidate);
            Ok(())
        }

        async fn close(&self) -> anyhow::Result<()> {
            Ok(())
        }
    }

    fn inbound(kind: &str, body: serde_json::Value) -> Signal {
        serde_json::from_value(json!({
            "msgId": 4,
            "type": kind,
            "to": "S1",
            "from": "P1",
            "body": body
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn offer_is_applied_and_wrapped() {
        let transport = Arc::new(FakeTransport::default());
        let negotiator = Negotiator::new(transport.clone());

        let signal = negotiator.create_offer("P1").await.unwrap();

        assert_eq!(signal.kind, SignalKind::Description);
        assert_eq!(signal.to, "P1");
        assert_eq!(signal.body["type"], "offer");
        assert!(signal.body["sdp"].as_str().unwrap().starts_with("v=0"));
        let local = transport.local.lock();
        assert_eq!(local.len(), 1);
        assert_eq!(local[0].sdp_type, RTCSdpType::Offer);
    }

    #[tokio::test]
    async fn remote_description_is_normalized() {
        let transport = Arc::new(FakeTransport::default());
        let negotiator = Negotiator::new(transport.clone());

        negotiator
            .handle_signal(&inbound("description", json!({"type": "answer", "sdp": "v=0\r\n"})))
            .await
            .unwrap();

        let remote = transport.remote.lock();
        assert_eq!(remote.len(), 1);
        assert_eq!(remote[0].sdp_type, RTCSdpType::Answer);
        assert_eq!(remote[0].sdp, "v=0\r\n");
    }

    #[tokio::test]
    async fn remote_candidate_is_normalized() {
        let transport = Arc::new(FakeTransport::default());
        let negotiator = Negotiator::new(transport.clone());

        negotiator
            .handle_signal(&inbound(
                "candidate",
                json!({
                    "candidate": "candidate:1 1 UDP 2130706431 192.168.1.2 54321 typ host",
                    "sdpMid": "0",
                    "sdpMLineIndex": 0
                }),
            ))
            .await
            .unwrap();

        let candidates = transport.candidates.lock();
        assert_eq!(candidates.len(), 1);
        assert!(candidates[0].candidate.contains("typ host"));
        assert_eq!(candidates[0].sdp_mid.as_deref(), Some("0"));
        assert_eq!(candidates[0].sdp_mline_index, Some(0));
    }

    #[tokio::test]
    async fn mismatched_body_is_rejected() {
        let transport = Arc::new(FakeTransport::default());
        let negotiator = Negotiator::new(transport.clone());

        let err = negotiator
            .handle_signal(&inbound("candidate", json!(42)))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            NegotiationError::Body {
                kind: SignalKind::Candidate,
                ..
            }
        ));
        assert!(transport.candidates.lock().is_empty());
    }

    #[tokio::test]
    async fn transport_failure_is_reported() {
        let transport = Arc::new(FakeTransport {
            reject_remote: true,
            ..Default::default()
        });
        let negotiator = Negotiator::new(transport);

        let err = negotiator
            .handle_signal(&inbound("description", json!({"type": "answer", "sdp": "x"})))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("bad sdp"));
    }

    #[tokio::test]
    async fn unknown_signal_type_is_ignored() {
        let transport = Arc::new(FakeTransport::default());
        let negotiator = Negotiator::new(transport.clone());

        negotiator
            .handle_signal(&inbound("bye", json!(null)))
            .await
            .unwrap();
        assert!(transport.remote.lock().is_empty());
        assert!(transport.candidates.lock().is_empty());
    }

    #[test]
    fn local_candidate_uses_browser_field_names() {
        let negotiator = Negotiator::new(Arc::new(FakeTransport::default()));
        let candidate = RTCIceCandidateInit {
            candidate: "candidate:2 1 udp 1 10.0.0.2 6000 typ host".into(),
            sdp_mid: Some("0".into()),
            sdp_mline_index: Some(0),
            username_fragment: None,
        };

        let signal = negotiator.candidate_signal("P1", &candidate).unwrap();
        assert_eq!(signal.kind, SignalKind::Candidate);
        assert_eq!(signal.body["sdpMid"], "0");
        assert_eq!(signal.body["sdpMLineIndex"], 0);
    }
}
