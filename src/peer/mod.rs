pub mod connection;
pub mod ice;
pub mod session;
pub mod state;
pub mod types;

pub use connection::{
    RtcTransportFactory, Transport, TransportEvent, TransportEvents, TransportFactory,
    TransportState,
};
pub use session::{PeerSession, SessionContext};
pub use state::{Role, SessionState, Teardown};
pub use types::{
    IceCandidate, MessageKind, PeerId, RelayPayload, SdpType, ServerConfig, SessionDescription,
    SignalingMessage,
};
