//! Connection lifecycle state.

/// Lifecycle state of a pooled connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Transport open, handshake in progress.
    Establishing,
    /// Parked in the pool.
    Idle,
    /// Lent to one caller.
    Active,
    /// Transport or protocol failure; must be discarded.
    Broken,
    /// QUIT sent or transport shut down.
    Closed,
}

/// Something that happened to a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// Handshake finished.
    Ready,
    /// Taken out of the idle set.
    Acquired,
    /// Returned to the idle set.
    Released,
    /// I/O error, malformed reply, or unexpected close.
    Failed,
    /// Shut down on purpose.
    Closed,
}

impl ConnectionState {
    /// Applies `event`. Defined for every pair; events that make no sense
    /// in the current state leave it unchanged.
    #[must_use]
    pub const fn on(self, event: ConnectionEvent) -> Self {
        match (self, event) {
            (Self::Closed, _) | (_, ConnectionEvent::Closed) => Self::Closed,
            (Self::Broken, _) | (_, ConnectionEvent::Failed) => Self::Broken,
            (Self::Establishing, ConnectionEvent::Ready)
            | (Self::Idle, ConnectionEvent::Acquired) => Self::Active,
            (Self::Active, ConnectionEvent::Released) => Self::Idle,
            (state, _) => state,
        }
    }

    /// Returns true if the connection may be handed out again.
    #[must_use]
    pub const fn is_reusable(self) -> bool {
        matches!(self, Self::Idle | Self::Active)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const STATES: [ConnectionState; 5] = [
        ConnectionState::Establishing,
        ConnectionState::Idle,
        ConnectionState::Active,
        ConnectionState::Broken,
        ConnectionState::Closed,
    ];

    #[test]
    fn test_happy_path() {
        let state = ConnectionState::Establishing
            .on(ConnectionEvent::Ready)
            .on(ConnectionEvent::Released)
            .on(ConnectionEvent::Acquired);
        assert_eq!(state, ConnectionState::Active);
    }

    #[test]
    fn test_failure_is_absorbing() {
        for state in STATES {
            let broken = state.on(ConnectionEvent::Failed);
            if state == ConnectionState::Closed {
                assert_eq!(broken, ConnectionState::Closed);
            } else {
                assert_eq!(broken, ConnectionState::Broken);
                assert_eq!(broken.on(ConnectionEvent::Released), ConnectionState::Broken);
                assert_eq!(broken.on(ConnectionEvent::Acquired), ConnectionState::Broken);
            }
        }
    }

    #[test]
    fn test_close_from_anywhere() {
        for state in STATES {
            assert_eq!(state.on(ConnectionEvent::Closed), ConnectionState::Closed);
        }
    }

    #[test]
    fn test_reusable() {
        assert!(ConnectionState::Idle.is_reusable());
        assert!(ConnectionState::Active.is_reusable());
        assert!(!ConnectionState::Establishing.is_reusable());
        assert!(!ConnectionState::Broken.is_reusable());
        assert!(!ConnectionState::Closed.is_reusable());
    }

    #[test]
    fn test_irrelevant_event_keeps_state() {
        assert_eq!(
            ConnectionState::Idle.on(ConnectionEvent::Released),
            ConnectionState::Idle
        );
        assert_eq!(
            ConnectionState::Establishing.on(ConnectionEvent::Acquired),
            ConnectionState::Establishing
        );
    }
}
