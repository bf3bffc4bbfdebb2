use crate::error::Result;
use crate::logger::{dump_candidate, dump_selected_pair};
use crate::media::{CaptureTrack, MediaTrack, TrackKind, TrackSet, SCREEN_STREAM_ID};
use crate::peer::ice::{from_rtc, rtc_config, to_init};
use crate::peer::types::{IceCandidate, SdpType, ServerConfig, SessionDescription};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::{APIBuilder, API};
use webrtc::ice_transport::ice_candidate::RTCIceCandidate;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::rtp_transceiver::RTCRtpTransceiver;
use webrtc::track::track_remote::TrackRemote;

/// Состояние транспорта, интересное машине состояний
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl TransportState {
    /// Disconnected / Failed / Closed завершают сессию
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            TransportState::Disconnected | TransportState::Failed | TransportState::Closed
        )
    }
}

pub enum TransportEvent {
    LocalCandidate(IceCandidate),
    RemoteTrack(Arc<dyn MediaTrack>),
    StateChanged(TransportState),
}

pub type TransportEvents = mpsc::UnboundedSender<TransportEvent>;

/// Одно соединение с собеседником (RTCPeerConnection)
#[async_trait]
pub trait Transport: Send + Sync {
    async fn add_tracks(&self, tracks: &TrackSet) -> Result<()>;
    async fn create_offer(&self) -> Result<SessionDescription>;
    async fn create_answer(&self) -> Result<SessionDescription>;
    async fn set_local_description(&self, desc: SessionDescription) -> Result<()>;
    async fn set_remote_description(&self, desc: SessionDescription) -> Result<()>;
    async fn add_ice_candidate(&self, candidate: &IceCandidate) -> Result<()>;
    async fn close(&self) -> Result<()>;
}

#[async_trait]
pub trait TransportFactory: Send + Sync {
    /// Открывает соединение; события транспорта уходят в `events`
    async fn open(&self, events: TransportEvents) -> Result<Arc<dyn Transport>>;
}

/// Фабрика соединений webrtc-rs
pub struct RtcTransportFactory {
    api: API,
    ice_servers: Vec<ServerConfig>,
}

impl RtcTransportFactory {
    pub fn new(ice_servers: Vec<ServerConfig>) -> Result<Self> {
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs()?;
        let registry = register_default_interceptors(Registry::new(), &mut media_engine)?;
        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();
        Ok(Self { api, ice_servers })
    }
}

#[async_trait]
impl TransportFactory for RtcTransportFactory {
    async fn open(&self, events: TransportEvents) -> Result<Arc<dyn Transport>> {
        let pc = Arc::new(
            self.api
                .new_peer_connection(rtc_config(&self.ice_servers))
                .await?,
        );

        let tx = events.clone();
        pc.on_ice_candidate(Box::new(move |cand: Option<RTCIceCandidate>| {
            let tx = tx.clone();
            Box::pin(async move {
                match cand {
                    Some(c) => match from_rtc(&c) {
                        Ok(candidate) => {
                            dump_candidate("LOCAL", &candidate);
                            let _ = tx.send(TransportEvent::LocalCandidate(candidate));
                        }
                        Err(e) => warn!("Failed to serialize local candidate: {}", e),
                    },
                    // cand == None означает конец сбора
                    None => debug!("ICE candidate gathering completed (null candidate received)"),
                }
            })
        }));

        // слабая ссылка, чтобы обработчик не держал соединение живым
        let pc_stats = Arc::downgrade(&pc);
        let tx = events.clone();
        pc.on_peer_connection_state_change(Box::new(move |st: RTCPeerConnectionState| {
            debug!("Peer connection state changed to: {:?}", st);
            let state = match st {
                RTCPeerConnectionState::Connecting => Some(TransportState::Connecting),
                RTCPeerConnectionState::Connected => Some(TransportState::Connected),
                RTCPeerConnectionState::Disconnected => Some(TransportState::Disconnected),
                RTCPeerConnectionState::Failed => Some(TransportState::Failed),
                RTCPeerConnectionState::Closed => Some(TransportState::Closed),
                _ => None,
            };
            if matches!(
                st,
                RTCPeerConnectionState::Disconnected | RTCPeerConnectionState::Failed
            ) {
                if let Some(pc) = pc_stats.upgrade() {
                    tokio::spawn(async move {
                        dump_selected_pair(&pc, "BEFORE-FAIL").await;
                    });
                }
            }
            if let Some(state) = state {
                let _ = tx.send(TransportEvent::StateChanged(state));
            }
            Box::pin(async {})
        }));

        let tx = events;
        pc.on_track(Box::new(
            move |track: Arc<TrackRemote>,
                  _receiver: Arc<RTCRtpReceiver>,
                  _transceiver: Arc<RTCRtpTransceiver>| {
                let kind = if track.stream_id().starts_with(SCREEN_STREAM_ID) {
                    TrackKind::Screen
                } else if track.kind() == RTPCodecType::Audio {
                    TrackKind::Audio
                } else {
                    TrackKind::Video
                };
                debug!("Remote {} track {} arrived", kind, track.id());
                let remote: Arc<dyn MediaTrack> = Arc::new(CaptureTrack::remote(track.id(), kind));
                let _ = tx.send(TransportEvent::RemoteTrack(remote));
                Box::pin(async {})
            },
        ));

        Ok(Arc::new(RtcTransport { pc }))
    }
}

pub struct RtcTransport {
    pc: Arc<RTCPeerConnection>,
}

fn to_rtc(desc: SessionDescription) -> Result<RTCSessionDescription> {
    Ok(match desc.sdp_type {
        SdpType::Offer => RTCSessionDescription::offer(desc.sdp)?,
        SdpType::Answer => RTCSessionDescription::answer(desc.sdp)?,
    })
}

#[async_trait]
impl Transport for RtcTransport {
    async fn add_tracks(&self, tracks: &TrackSet) -> Result<()> {
        for track in tracks.iter() {
            let Some(local) = track.local() else {
                continue;
            };
            let sender = self.pc.add_track(local).await?;
            // RTCP нужно вычитывать, иначе interceptors не работают
            tokio::spawn(async move {
                let mut buf = vec![0u8; 1500];
                while sender.read(&mut buf).await.is_ok() {}
            });
        }
        Ok(())
    }

    async fn create_offer(&self) -> Result<SessionDescription> {
        let offer = self.pc.create_offer(None).await?;
        Ok(SessionDescription::offer(offer.sdp))
    }

    async fn create_answer(&self) -> Result<SessionDescription> {
        let answer = self.pc.create_answer(None).await?;
        Ok(SessionDescription::answer(answer.sdp))
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<()> {
        self.pc.set_local_description(to_rtc(desc)?).await?;
        Ok(())
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<()> {
        self.pc.set_remote_description(to_rtc(desc)?).await?;
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: &IceCandidate) -> Result<()> {
        self.pc.add_ice_candidate(to_init(candidate)).await?;
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.pc.close().await?;
        Ok(())
    }
}
