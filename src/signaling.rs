use crate::backend::CallKind;
use crate::error::CallError;
use crate::peer::types::{IceCandidate, SdpPayload};
use async_trait::async_trait;
use base64::{engine::general_purpose, Engine as _};
use flate2::{read::GzDecoder, write::GzEncoder, Compression};
use serde::{Deserialize, Serialize};
use std::io::{Read, Write};

/// События сигнального канала. Канал доставляет их "как минимум один раз"
/// и не гарантирует порядок между разными типами событий.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(
    tag = "event",
    content = "data",
    rename_all = "snake_case",
    rename_all_fields = "camelCase"
)]
pub enum Signal {
    InitiateCall {
        call_id: String,
        kind: CallKind,
        from: String,
    },
    AcceptCall {
        call_id: String,
    },
    RejectCall {
        call_id: String,
    },
    EndCall {
        call_id: String,
    },
    WebrtcOffer {
        to: String,
        offer: String, // закодированный SdpPayload
    },
    WebrtcAnswer {
        to: String,
        answer: String,
    },
    WebrtcIceCandidate {
        to: String,
        candidate: IceCandidate,
    },
}

impl Signal {
    /// Имя события для логов
    pub fn name(&self) -> &'static str {
        match self {
            Signal::InitiateCall { .. } => "initiate_call",
            Signal::AcceptCall { .. } => "accept_call",
            Signal::RejectCall { .. } => "reject_call",
            Signal::EndCall { .. } => "end_call",
            Signal::WebrtcOffer { .. } => "webrtc_offer",
            Signal::WebrtcAnswer { .. } => "webrtc_answer",
            Signal::WebrtcIceCandidate { .. } => "webrtc_ice_candidate",
        }
    }
}

/// Исходящая половина сигнального канала: доставка события пользователю.
/// Входящие события владелец соединения передаёт в
/// `CallController::handle_signal`, глобальных подписок нет.
#[async_trait]
pub trait SignalingChannel: Send + Sync {
    async fn send(&self, to: &str, signal: Signal) -> Result<(), CallError>;
}

/// SDP упаковывается gzip-ом и кодируется base64:
/// полный offer с кандидатами легко переваливает за десятки килобайт
pub fn encode_sdp(payload: &SdpPayload) -> Result<String, CallError> {
    let json =
        serde_json::to_vec(payload).map_err(|e| CallError::MalformedPayload(e.to_string()))?;
    let mut gz = GzEncoder::new(Vec::new(), Compression::fast());
    gz.write_all(&json)
        .map_err(|e| CallError::MalformedPayload(e.to_string()))?;
    let compressed = gz
        .finish()
        .map_err(|e| CallError::MalformedPayload(e.to_string()))?;
    Ok(general_purpose::STANDARD.encode(compressed))
}

pub fn decode_sdp(encoded: &str) -> Result<SdpPayload, CallError> {
    let compressed = general_purpose::STANDARD
        .decode(encoded)
        .map_err(|e| CallError::MalformedPayload(e.to_string()))?;
    let mut gz = GzDecoder::new(&compressed[..]);
    let mut json = Vec::new();
    gz.read_to_end(&mut json)
        .map_err(|e| CallError::MalformedPayload(e.to_string()))?;
    serde_json::from_slice(&json).map_err(|e| CallError::MalformedPayload(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;

    fn dummy_payload() -> SdpPayload {
        let sdp: RTCSessionDescription = serde_json::from_str(
            r#"{"type":"offer","sdp":"v=0\r\no=- 0 0 IN IP4 127.0.0.1\r\ns=-\r\nt=0 0\r\n"}"#,
        )
        .unwrap();
        SdpPayload {
            sdp,
            id: "abc123".into(),
            ts: 1700000000,
        }
    }

    #[test]
    fn sdp_codec_roundtrip() {
        let payload = dummy_payload();
        let encoded = encode_sdp(&payload).unwrap();
        let decoded = decode_sdp(&encoded).unwrap();
        assert_eq!(decoded.id, "abc123");
        assert_eq!(decoded.ts, 1700000000);
        assert_eq!(decoded.sdp.sdp, payload.sdp.sdp);
    }

    #[test]
    fn decode_rejects_garbage() {
        assert!(matches!(
            decode_sdp("not base64!!!"),
            Err(CallError::MalformedPayload(_))
        ));
        // валидный base64, но не gzip
        let encoded = general_purpose::STANDARD.encode(b"plain");
        assert!(matches!(
            decode_sdp(&encoded),
            Err(CallError::MalformedPayload(_))
        ));
    }

    #[test]
    fn signal_wire_format() {
        let s = Signal::InitiateCall {
            call_id: "c1".into(),
            kind: CallKind::Voice,
            from: "alice".into(),
        };
        let json = serde_json::to_value(&s).unwrap();
        assert_eq!(json["event"], "initiate_call");
        assert_eq!(json["data"]["callId"], "c1");
        assert_eq!(json["data"]["kind"], "voice");
        assert_eq!(json["data"]["from"], "alice");

        let back: Signal = serde_json::from_value(json).unwrap();
        assert_eq!(back.name(), "initiate_call");
    }

    #[test]
    fn ice_candidate_wire_format() {
        let s = Signal::WebrtcIceCandidate {
            to: "bob".into(),
            candidate: crate::peer::types::IceCandidate {
                candidate: "candidate:1 1 UDP 2122260223 192.0.2.1 54321 typ host".into(),
                sdp_mid: Some("0".into()),
                sdp_mline_index: Some(0),
                call_id: "c1".into(),
            },
        };
        let json = serde_json::to_value(&s).unwrap();
        assert_eq!(json["event"], "webrtc_ice_candidate");
        assert_eq!(json["data"]["candidate"]["sdpMid"], "0");
        assert_eq!(json["data"]["candidate"]["callId"], "c1");
    }
}
