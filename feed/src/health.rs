/// Connection health as seen by the chart surfaces.
///
/// `Offline` is the only state surfaced to users; the others are transient.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionHealth {
    #[default]
    Disconnected,
    Connected,
    Reconnecting,
    Offline,
}

impl ConnectionHealth {
    pub fn is_online(&self) -> bool {
        matches!(self, ConnectionHealth::Connected)
    }

    /// Health after one more failed connect attempt, given how many failed in a row.
    pub fn after_failure(failures: u32, offline_after: u32) -> Self {
        if failures >= offline_after {
            ConnectionHealth::Offline
        } else {
            ConnectionHealth::Reconnecting
        }
    }
}

impl std::fmt::Display for ConnectionHealth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}",
            match self {
                ConnectionHealth::Disconnected => "disconnected",
                ConnectionHealth::Connected => "online",
                ConnectionHealth::Reconnecting => "reconnecting",
                ConnectionHealth::Offline => "offline",
            }
        )
    }
}
