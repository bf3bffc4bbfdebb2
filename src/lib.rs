pub mod bus;
pub mod config;
pub mod error;
pub mod events;
pub mod logger;
pub mod media;
pub mod peer;
pub mod registry;
pub mod signaling;
pub mod utils;

pub use bus::MemoryBus;
pub use config::BroadcastConfig;
pub use error::{Result, SessionError};
pub use events::{CallEvent, EventKind, SubscriptionId};
pub use media::{MediaPreference, MediaRequest, TrackKind, VideoRequest};
pub use peer::{PeerId, SessionState};
pub use registry::SessionRegistry;

use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

const CALLER: PeerId = PeerId(1);
const CALLEE: PeerId = PeerId(2);

/// Два registry в одном процессе: звонок по шине в памяти и завершение
pub fn run() {
    logger::init();

    let config = match std::env::args().nth(1) {
        Some(path) => BroadcastConfig::from_json_file(path),
        None => Ok(BroadcastConfig::default()),
    };
    let outcome = config.and_then(|config| {
        tokio::runtime::Runtime::new()
            .map_err(|e| SessionError::Config(e.to_string()))?
            .block_on(loopback(config))
    });
    if let Err(e) = outcome {
        error!("Loopback call failed: {}", e);
        std::process::exit(1);
    }
}

async fn loopback(config: BroadcastConfig) -> Result<()> {
    let bus = MemoryBus::new(config.topic.clone());
    let caller = SessionRegistry::with_webrtc(config.clone(), Arc::new(bus.relay_for(CALLER)))?;
    let callee = SessionRegistry::with_webrtc(config, Arc::new(bus.relay_for(CALLEE)))?;

    for (name, registry) in [("caller", &caller), ("callee", &callee)] {
        for kind in [
            EventKind::LocalAudio,
            EventKind::LocalVideo,
            EventKind::RemoteAudio,
            EventKind::RemoteVideo,
            EventKind::CallDisconnected,
            EventKind::MediaUnavailable,
        ] {
            registry.subscribe(kind, None, move |event| {
                info!("[{}] {} from peer {}", name, kind.as_str(), event.peer());
            });
        }
    }

    let caller_loop = tokio::spawn({
        let registry = caller.clone();
        let feed = bus.listen(CALLER);
        async move { registry.run(feed).await }
    });
    let callee_loop = tokio::spawn({
        let registry = callee.clone();
        let feed = bus.listen(CALLEE);
        async move { registry.run(feed).await }
    });

    caller.open_call(CALLEE, MediaRequest::audio_video()).await?;
    tokio::time::sleep(Duration::from_secs(3)).await;
    info!(
        "caller sees {:?}, callee sees {:?}",
        caller.session_state(CALLEE),
        callee.session_state(CALLER)
    );

    caller.close_call(CALLEE).await;
    tokio::time::sleep(Duration::from_millis(500)).await;

    caller.shutdown().await;
    callee.shutdown().await;
    bus.close();
    let _ = tokio::join!(caller_loop, callee_loop);
    Ok(())
}
