use thiserror::Error;

/// Ошибки сигнализации и жизненного цикла звонка
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    /// Нет устройства или отказано в доступе; восстановимо, уходит в UI
    #[error("media unavailable: {0}")]
    MediaUnavailable(String),

    /// Relay отклонил исходящее сообщение
    #[error("relay unavailable: {0}")]
    RelayUnavailable(String),

    /// Сбой ICE / peer connection, сессия завершается
    #[error("transport failure: {0}")]
    TransportFailure(String),

    #[error("stale signaling message: {0}")]
    StaleMessage(String),

    #[error("offer was not answered in time")]
    OfferTimeout,

    /// Захват медиа отменён до завершения
    #[error("media acquisition cancelled")]
    Cancelled,

    /// Сессию закрыли, пока шёл асинхронный шаг
    #[error("session closed")]
    Closed,

    #[error("invalid signaling message: {0}")]
    InvalidMessage(String),

    #[error("invalid configuration: {0}")]
    Config(String),
}

impl SessionError {
    /// Ошибка означает, что сессию уже закрыл кто-то другой
    pub fn is_teardown(&self) -> bool {
        matches!(self, SessionError::Closed | SessionError::Cancelled)
    }
}

impl From<webrtc::Error> for SessionError {
    fn from(e: webrtc::Error) -> Self {
        SessionError::TransportFailure(e.to_string())
    }
}

impl From<serde_json::Error> for SessionError {
    fn from(e: serde_json::Error) -> Self {
        SessionError::InvalidMessage(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, SessionError>;
