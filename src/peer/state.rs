use std::fmt;

/// Кто начал согласование
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Caller,
    Callee,
}

/// Состояние сессии; `Closed` конечное
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Negotiating(Role),
    Connected,
    Closed,
}

impl SessionState {
    pub fn is_live(&self) -> bool {
        !matches!(self, SessionState::Closed)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionState::Idle => f.write_str("IDLE"),
            SessionState::Negotiating(Role::Caller) => f.write_str("NEGOTIATING(caller)"),
            SessionState::Negotiating(Role::Callee) => f.write_str("NEGOTIATING(callee)"),
            SessionState::Connected => f.write_str("CONNECTED"),
            SessionState::Closed => f.write_str("CLOSED"),
        }
    }
}

/// Почему сессия закрывается
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Teardown {
    /// closeCall из UI
    Local,
    /// собеседник прислал disconnect
    Remote,
    TransportFailed,
    OfferTimeout,
    RelayFailed,
    /// неудачное согласование (ошибка транспорта или медиа)
    NegotiationFailed,
    /// заменена новой попыткой согласования с тем же собеседником
    Superseded,
    /// registry останавливается
    Shutdown,
}

impl Teardown {
    /// Нужно ли сообщить relay; собеседнику, приславшему disconnect, эхо не шлём
    pub fn notifies_relay(&self) -> bool {
        !matches!(self, Teardown::Remote | Teardown::Superseded)
    }

    /// Заменённая сессия уходит молча: звонок продолжается новой сессией
    pub fn notifies_ui(&self) -> bool {
        !matches!(self, Teardown::Superseded)
    }
}
