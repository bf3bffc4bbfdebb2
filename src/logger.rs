use crate::config::DEFAULT_LOG_FILTER;
use crate::peer::ice::candidate_type;
use crate::peer::types::IceCandidate;
use tracing::debug;
use tracing_subscriber::EnvFilter;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::stats::StatsReportType;

/// Логирование с временными метками; уровень берётся из RUST_LOG
pub fn init() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    // повторная инициализация (тесты, второй registry) не ошибка
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init();
}

/// Печать ICE-candidate при появлении (Trickle-ICE)
pub fn dump_candidate(label: &str, cand: &IceCandidate) {
    debug!(
        "Trickle {label}: type={} candidate={} sdp_mid={:?} sdp_mline_index={:?}",
        candidate_type(&cand.candidate),
        cand.candidate,
        cand.sdp_mid,
        cand.sdp_mline_index
    );
}

/// Снимок getStats: номинированные пары кандидатов на момент `moment`
pub async fn dump_selected_pair(pc: &RTCPeerConnection, moment: &str) {
    let nominated = pc
        .get_stats()
        .await
        .reports
        .into_values()
        .filter_map(|report| match report {
            StatsReportType::CandidatePair(pair) if pair.nominated => Some(pair),
            _ => None,
        });

    let mut found = false;
    for pair in nominated {
        found = true;
        debug!(
            moment,
            local = %pair.local_candidate_id,
            remote = %pair.remote_candidate_id,
            state = ?pair.state,
            sent = pair.bytes_sent,
            received = pair.bytes_received,
            "Selected candidate pair"
        );
    }
    if !found {
        debug!(moment, "No nominated candidate pair");
    }
}
