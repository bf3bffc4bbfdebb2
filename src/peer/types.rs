use crate::error::{Result, SessionError};
use crate::media::MediaRequest;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Идентификатор удалённой стороны (`partner_id` на проводе)
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(transparent)]
pub struct PeerId(pub u64);

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for PeerId {
    fn from(id: u64) -> Self {
        PeerId(id)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    Offer,
    Answer,
}

/// Session description в том виде, в каком её отдаёт браузер
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub sdp_type: SdpType,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Answer,
            sdp: sdp.into(),
        }
    }
}

/// ICE кандидат в формате RTCIceCandidate.toJSON()
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(rename = "sdpMid", default)]
    pub sdp_mid: Option<String>,
    #[serde(rename = "sdpMLineIndex", default)]
    pub sdp_mline_index: Option<u16>,
    #[serde(
        rename = "usernameFragment",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub username_fragment: Option<String>,
}

/// Конфигурация ICE сервера
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    pub id: String,
    pub r#type: String, // 'stun' or 'turn'
    pub url: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub credential: Option<String>,
}

/// Полезная нагрузка, которую мы отдаём relay
///
/// `id` связывает offer, answer и кандидаты одной попытки согласования,
/// `ts` - время создания описания на стороне отправителя.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum RelayPayload {
    Call {
        desc: SessionDescription,
        #[serde(
            rename = "mediaConfig",
            default,
            skip_serializing_if = "Option::is_none"
        )]
        media_config: Option<MediaRequest>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        ts: Option<i64>,
    },
    Candidate {
        candidate: IceCandidate,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<String>,
    },
    Disconnect {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<String>,
    },
}

impl RelayPayload {
    pub fn call(desc: SessionDescription, media: Option<MediaRequest>, id: &str) -> Self {
        RelayPayload::Call {
            desc,
            media_config: media,
            id: Some(id.to_string()),
            ts: Some(chrono::Utc::now().timestamp()),
        }
    }

    pub fn candidate(candidate: IceCandidate, id: &str) -> Self {
        RelayPayload::Candidate {
            candidate,
            id: Some(id.to_string()),
        }
    }

    pub fn disconnect(id: Option<&str>) -> Self {
        RelayPayload::Disconnect {
            id: id.map(str::to_string),
        }
    }

    pub fn kind_str(&self) -> &'static str {
        match self {
            RelayPayload::Call { desc, .. } => match desc.sdp_type {
                SdpType::Offer => "offer",
                SdpType::Answer => "answer",
            },
            RelayPayload::Candidate { .. } => "candidate",
            RelayPayload::Disconnect { .. } => "disconnect",
        }
    }
}

/// Разобранное входящее сообщение сигнализации
#[derive(Debug, Clone, PartialEq)]
pub enum MessageKind {
    Offer {
        desc: SessionDescription,
        media: MediaRequest,
        id: Option<String>,
    },
    Answer {
        desc: SessionDescription,
        id: Option<String>,
    },
    Candidate {
        candidate: IceCandidate,
        id: Option<String>,
    },
    Disconnect {
        id: Option<String>,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct SignalingMessage {
    pub peer: PeerId,
    /// позиция уведомления в шине
    pub seq: u64,
    pub kind: MessageKind,
}

impl SignalingMessage {
    pub fn from_payload(peer: PeerId, seq: u64, payload: RelayPayload) -> Self {
        let kind = match payload {
            RelayPayload::Call {
                desc,
                media_config,
                id,
                ..
            } => match desc.sdp_type {
                SdpType::Offer => MessageKind::Offer {
                    desc,
                    media: media_config.unwrap_or_default(),
                    id,
                },
                SdpType::Answer => MessageKind::Answer { desc, id },
            },
            RelayPayload::Candidate { candidate, id } => MessageKind::Candidate { candidate, id },
            RelayPayload::Disconnect { id } => MessageKind::Disconnect { id },
        };
        Self { peer, seq, kind }
    }

    /// Разбор JSON тела уведомления; отправитель лежит в `partner_id`
    pub fn parse(seq: u64, body: &str) -> Result<Self> {
        let mut value: serde_json::Value = serde_json::from_str(body)?;
        let peer = value
            .get("partner_id")
            .and_then(|v| v.as_u64())
            .map(PeerId)
            .ok_or_else(|| SessionError::InvalidMessage("missing partner_id".into()))?;
        if let Some(obj) = value.as_object_mut() {
            obj.remove("partner_id");
            obj.remove("user_id");
        }
        let payload: RelayPayload = serde_json::from_value(value)?;
        Ok(Self::from_payload(peer, seq, payload))
    }

    pub fn is_offer(&self) -> bool {
        matches!(self.kind, MessageKind::Offer { .. })
    }

    pub fn is_disconnect(&self) -> bool {
        matches!(self.kind, MessageKind::Disconnect { .. })
    }

    /// Идентификатор попытки согласования, к которой относится сообщение
    pub fn negotiation_id(&self) -> Option<&str> {
        match &self.kind {
            MessageKind::Offer { id, .. }
            | MessageKind::Answer { id, .. }
            | MessageKind::Candidate { id, .. }
            | MessageKind::Disconnect { id } => id.as_deref(),
        }
    }

    pub fn kind_str(&self) -> &'static str {
        match self.kind {
            MessageKind::Offer { .. } => "offer",
            MessageKind::Answer { .. } => "answer",
            MessageKind::Candidate { .. } => "candidate",
            MessageKind::Disconnect { .. } => "disconnect",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::VideoRequest;

    #[test]
    fn parses_offer_with_media_config() {
        let body = r#"{"type":"call","desc":{"type":"offer","sdp":"v=0"},
            "mediaConfig":{"audio":true,"video":{"width":400,"height":300},"preview":true},
            "partner_id":3,"user_id":7}"#;
        let msg = SignalingMessage::parse(11, body).unwrap();
        assert_eq!(msg.peer, PeerId(3));
        assert_eq!(msg.seq, 11);
        match msg.kind {
            MessageKind::Offer { desc, media, id } => {
                assert_eq!(desc, SessionDescription::offer("v=0"));
                assert!(media.audio);
                assert!(matches!(media.video, VideoRequest::Profile(p) if p.width == 400));
                assert!(!media.screen);
                assert_eq!(id, None);
            }
            other => panic!("expected offer, got {:?}", other),
        }
    }

    #[test]
    fn call_with_answer_desc_is_an_answer() {
        let body = r#"{"type":"call","desc":{"type":"answer","sdp":"v=0"},"id":"ab","partner_id":4}"#;
        let msg = SignalingMessage::parse(1, body).unwrap();
        assert_eq!(msg.kind_str(), "answer");
    }

    #[test]
    fn disconnect_and_candidate_parse() {
        let msg = SignalingMessage::parse(2, r#"{"type":"disconnect","partner_id":4}"#).unwrap();
        assert!(msg.is_disconnect());

        let body = r#"{"type":"candidate","candidate":{"candidate":"candidate:1 1 udp 1 10.0.0.1 5000 typ host","sdpMid":"0","sdpMLineIndex":0},"partner_id":4}"#;
        let msg = SignalingMessage::parse(3, body).unwrap();
        match msg.kind {
            MessageKind::Candidate { candidate, .. } => {
                assert_eq!(candidate.sdp_mid.as_deref(), Some("0"));
                assert_eq!(candidate.sdp_mline_index, Some(0));
            }
            other => panic!("expected candidate, got {:?}", other),
        }
    }

    #[test]
    fn rejects_missing_sender() {
        let err = SignalingMessage::parse(1, r#"{"type":"disconnect"}"#).unwrap_err();
        assert!(matches!(err, SessionError::InvalidMessage(_)));
        let err = SignalingMessage::parse(1, r#"{"type":"hangup","partner_id":1}"#).unwrap_err();
        assert!(matches!(err, SessionError::InvalidMessage(_)));
    }

    #[test]
    fn outbound_call_carries_media_config() {
        let payload = RelayPayload::call(
            SessionDescription::offer("v=0"),
            Some(MediaRequest::audio_only()),
            "abc",
        );
        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(json["type"], "call");
        assert_eq!(json["desc"]["type"], "offer");
        assert_eq!(json["mediaConfig"]["audio"], true);
        assert_eq!(json["id"], "abc");
        assert_eq!(
            serde_json::to_value(RelayPayload::disconnect(None)).unwrap(),
            serde_json::json!({"type": "disconnect"})
        );
        assert_eq!(
            serde_json::to_value(RelayPayload::disconnect(Some("abc"))).unwrap(),
            serde_json::json!({"type": "disconnect", "id": "abc"})
        );
    }
}
