//! Session states and observable events.

use std::fmt;

/// Coarse state of a sync session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SyncState {
    /// No transport.
    Disconnected,
    /// Establishing the transport.
    Connecting,
    /// Exchanging signed welcome messages.
    Handshaking,
    /// Initial full reconciliation.
    Loading,
    /// Incremental exchange in progress.
    Syncing,
    /// Idle, nothing outstanding in either direction.
    Synced,
    /// Stopped after an authentication or protocol failure. Left only by
    /// an explicit resync.
    Error,
}

impl SyncState {
    /// States that complete pending result callbacks.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SyncState::Synced | SyncState::Error | SyncState::Disconnected
        )
    }

    /// Returns true while changes are being exchanged.
    pub fn is_active(&self) -> bool {
        matches!(self, SyncState::Loading | SyncState::Syncing)
    }

    /// Returns true once the peer passed the handshake.
    pub fn is_connected(&self) -> bool {
        matches!(
            self,
            SyncState::Loading | SyncState::Syncing | SyncState::Synced
        )
    }
}

impl fmt::Display for SyncState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SyncState::Disconnected => "disconnected",
            SyncState::Connecting => "connecting",
            SyncState::Handshaking => "handshaking",
            SyncState::Loading => "loading",
            SyncState::Syncing => "syncing",
            SyncState::Synced => "synced",
            SyncState::Error => "error",
        };
        f.write_str(name)
    }
}

/// Notifications published by the engine task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncEvent {
    /// The session state changed.
    StateChanged(SyncState),
    /// Number of local writes not yet acknowledged by a peer.
    OperationsChanged(usize),
    /// The authentication error was set or cleared.
    AuthenticationErrorChanged(Option<String>),
}
