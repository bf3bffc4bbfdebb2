use crate::error::{Result, SessionError};
use crate::peer::types::{IceCandidate, ServerConfig};
use crate::utils::add_ice_url_scheme;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::policy::bundle_policy::RTCBundlePolicy;
use webrtc::peer_connection::policy::rtcp_mux_policy::RTCRtcpMuxPolicy;

/// STUN серверы по умолчанию
pub fn default_ice_servers() -> Vec<ServerConfig> {
    vec![
        ServerConfig {
            id: "default-stun-mozilla".into(),
            r#type: "stun".into(),
            url: "stun:stun.services.mozilla.com".into(),
            username: None,
            credential: None,
        },
        ServerConfig {
            id: "default-stun-google".into(),
            r#type: "stun".into(),
            url: "stun:stun.l.google.com:19302".into(),
            username: None,
            credential: None,
        },
    ]
}

/// Проверка списка серверов перед использованием
pub fn validate_ice_servers(servers: &[ServerConfig]) -> Result<()> {
    for server in servers {
        if server.url.is_empty() {
            return Err(SessionError::Config(format!(
                "ICE server {} has an empty url",
                server.id
            )));
        }

        if server.r#type == "turn" && (server.username.is_none() || server.credential.is_none()) {
            return Err(SessionError::Config(format!(
                "TURN server {} requires username and credential",
                server.id
            )));
        }
    }
    Ok(())
}

pub fn to_rtc_ice_servers(servers: &[ServerConfig]) -> Vec<RTCIceServer> {
    servers
        .iter()
        .map(|config| RTCIceServer {
            urls: vec![add_ice_url_scheme(config)],
            username: config.username.clone().unwrap_or_default(),
            credential: config.credential.clone().unwrap_or_default(),
        })
        .collect()
}

/// Создает конфигурацию для peer connection
pub fn rtc_config(servers: &[ServerConfig]) -> RTCConfiguration {
    RTCConfiguration {
        ice_servers: to_rtc_ice_servers(servers),
        bundle_policy: RTCBundlePolicy::MaxBundle,
        rtcp_mux_policy: RTCRtcpMuxPolicy::Require,
        ..Default::default()
    }
}

pub fn to_init(candidate: &IceCandidate) -> RTCIceCandidateInit {
    RTCIceCandidateInit {
        candidate: candidate.candidate.clone(),
        sdp_mid: candidate.sdp_mid.clone(),
        sdp_mline_index: candidate.sdp_mline_index,
        username_fragment: candidate.username_fragment.clone(),
    }
}

pub fn from_rtc(candidate: &RTCIceCandidate) -> Result<IceCandidate> {
    let init = candidate.to_json()?;
    Ok(IceCandidate {
        candidate: init.candidate,
        sdp_mid: init.sdp_mid,
        sdp_mline_index: init.sdp_mline_index,
        username_fragment: init.username_fragment,
    })
}

/// Тип кандидата из SDP-строки: host / srflx / prflx / relay
pub fn candidate_type(candidate: &str) -> &str {
    candidate
        .split_whitespace()
        .skip_while(|part| *part != "typ")
        .nth(1)
        .unwrap_or("unknown")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn turn_without_credentials_is_rejected() {
        let mut servers = default_ice_servers();
        assert!(validate_ice_servers(&servers).is_ok());

        servers.push(ServerConfig {
            id: "relay".into(),
            r#type: "turn".into(),
            url: "turn.example.org:3478".into(),
            username: Some("user".into()),
            credential: None,
        });
        assert!(matches!(
            validate_ice_servers(&servers),
            Err(SessionError::Config(_))
        ));
    }

    #[test]
    fn rtc_config_carries_every_server() {
        let config = rtc_config(&default_ice_servers());
        assert_eq!(config.ice_servers.len(), 2);
        assert_eq!(
            config.ice_servers[1].urls,
            vec!["stun:stun.l.google.com:19302".to_string()]
        );
    }

    #[test]
    fn parses_candidate_type() {
        assert_eq!(
            candidate_type("candidate:1 1 udp 2130706431 10.0.0.1 5000 typ host"),
            "host"
        );
        assert_eq!(
            candidate_type("candidate:2 1 udp 1 1.2.3.4 6000 typ srflx raddr 10.0.0.1 rport 5000"),
            "srflx"
        );
        assert_eq!(candidate_type("garbage"), "unknown");
    }
}
