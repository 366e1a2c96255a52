//! Pairing state machine for one relay host.
//!
//! Pure and side-effect free: the machine takes events and produces a new
//! state plus a list of actions. The coordinator in relay-client performs
//! the storage and network work and feeds the outcome back as events.
//!
//! ```text
//! Uninitialized -> LoadingStorage -> Paired
//!                                 \-> Handshaking -> Paired
//!                                                 \-> Failed -> Handshaking
//! Paired -> Handshaking (re-pair)
//! ```
//!
//! Every pool installed by the machine carries a generation number. A
//! re-pair always moves to a higher generation, which lets callers tell
//! whether a pool they used has already been replaced.

/// Pairing lifecycle of one host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PairingState {
    /// Constructed, storage not consulted yet.
    Uninitialized,
    /// Reading the persisted snapshot.
    LoadingStorage,
    /// Running the probe and pairing calls.
    Handshaking {
        /// Generation the new pool will carry.
        generation: u64,
    },
    /// A pool is installed and requests may be dispatched.
    Paired {
        /// Generation of the installed pool.
        generation: u64,
    },
    /// The last handshake failed; waiters were told why.
    Failed {
        /// Generation the failed handshake would have produced.
        generation: u64,
        /// Human-readable failure reason.
        reason: String,
    },
}

impl PairingState {
    /// Create a machine in the Uninitialized state.
    pub fn new() -> Self {
        Self::Uninitialized
    }

    /// Process an event and return the new state plus actions to execute.
    pub fn on_event(self, event: PairingEvent) -> (Self, Vec<PairingAction>) {
        match (self, event) {
            (Self::Uninitialized, PairingEvent::Started) => {
                (Self::LoadingStorage, vec![PairingAction::LoadSnapshot])
            }

            // From LoadingStorage
            (Self::LoadingStorage, PairingEvent::SnapshotLoaded { pair_count }) if pair_count > 0 => (
                Self::Paired { generation: 1 },
                vec![
                    PairingAction::InstallPool { generation: 1 },
                    PairingAction::ReleaseWaiters,
                ],
            ),
            (Self::LoadingStorage, PairingEvent::SnapshotLoaded { .. })
            | (Self::LoadingStorage, PairingEvent::SnapshotMissing) => (
                Self::Handshaking { generation: 1 },
                vec![PairingAction::StartHandshake { generation: 1 }],
            ),

            // From Handshaking
            (Self::Handshaking { generation }, PairingEvent::HandshakeSucceeded) => (
                Self::Paired { generation },
                vec![
                    PairingAction::InstallPool { generation },
                    PairingAction::PersistSnapshot,
                    PairingAction::ReleaseWaiters,
                ],
            ),
            (Self::Handshaking { generation }, PairingEvent::HandshakeFailed { reason }) => (
                Self::Failed {
                    generation,
                    reason: reason.clone(),
                },
                vec![PairingAction::FailWaiters { reason }],
            ),

            // From Paired
            (Self::Paired { generation }, PairingEvent::RepairRequested) => {
                let next = generation.saturating_add(1);
                (
                    Self::Handshaking { generation: next },
                    vec![
                        PairingAction::DiscardPool,
                        PairingAction::ClearSnapshot,
                        PairingAction::StartHandshake { generation: next },
                    ],
                )
            }

            // From Failed
            (Self::Failed { generation, .. }, PairingEvent::RetryRequested) => (
                Self::Handshaking { generation },
                vec![PairingAction::StartHandshake { generation }],
            ),

            // Invalid transitions - stay in current state
            (state, _) => (state, vec![]),
        }
    }

    /// Check if a pool is installed.
    pub fn is_paired(&self) -> bool {
        matches!(self, Self::Paired { .. })
    }

    /// Generation of the installed pool, if any.
    pub fn generation(&self) -> Option<u64> {
        match self {
            Self::Paired { generation } => Some(*generation),
            _ => None,
        }
    }
}

impl Default for PairingState {
    fn default() -> Self {
        Self::new()
    }
}

/// Events fed into the pairing machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PairingEvent {
    /// The coordinator was constructed.
    Started,
    /// A snapshot was read from storage.
    SnapshotLoaded {
        /// Number of pairs it holds (zero means client id only).
        pair_count: usize,
    },
    /// No usable snapshot exists.
    SnapshotMissing,
    /// Every candidate pair was instantiated.
    HandshakeSucceeded,
    /// The probe or pairing call failed.
    HandshakeFailed {
        /// Error message describing the failure.
        reason: String,
    },
    /// The server reported the pairing as invalid.
    RepairRequested,
    /// A caller needs a pool after a failed handshake.
    RetryRequested,
}

/// Side effects the coordinator must perform, in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PairingAction {
    /// Read the persisted snapshot.
    LoadSnapshot,
    /// Run probe + pairing calls for a new pool.
    StartHandshake {
        /// Generation the new pool will carry.
        generation: u64,
    },
    /// Make the prepared pool current.
    InstallPool {
        /// Generation of the pool being installed.
        generation: u64,
    },
    /// Write the current snapshot to storage.
    PersistSnapshot,
    /// Drop the in-memory pool.
    DiscardPool,
    /// Remove the persisted snapshot.
    ClearSnapshot,
    /// Wake every caller waiting for a pool.
    ReleaseWaiters,
    /// Wake every waiting caller with an error.
    FailWaiters {
        /// Error message handed to the waiters.
        reason: String,
    },
}
