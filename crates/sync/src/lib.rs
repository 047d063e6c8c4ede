//! Keeping remote peers' appearance in sync with their snapshots.
//!
//! The [`PeerRegistry`] is what a host talks to: it tracks pairings and
//! presence and hands received snapshots, stripped of disallowed content, to
//! each peer's [`ApplicationCoordinator`]. The coordinator diffs, downloads
//! through the shared [`TransferOrchestrator`](mirage_transfer::TransferOrchestrator)
//! and applies changes through [`CapabilityAdapter`]s, subject to the peer's
//! [`HoldRegistry`].
//!
//! ```text
//! receive ─► diff ─► holds ─► target ready ─► download ─► thresholds ─► apply
//!                                                                        │
//!                       revert (visibility lost, paused, disposed) ◄─────┘
//! ```

pub mod adapter;
mod context;
mod coordinator;
pub mod error;
mod event;
mod executor;
mod hold;
#[cfg(any(test, feature = "mock"))]
pub mod mock;
mod permission;
mod registry;
mod session;
mod settings;
mod target;

pub use crate::adapter::{AdapterHandle, AdapterSet, Affinity, ApplyRequest, CapabilityAdapter, Payload, RevertRequest};
pub use crate::context::SyncContext;
pub use crate::coordinator::ApplicationCoordinator;
pub use crate::event::{EventBus, SyncEvent};
pub use crate::executor::TargetExecutor;
pub use crate::hold::{HoldGuard, HoldKind, HoldRegistry};
pub use crate::permission::{GroupId, Pairing, PairingSource, PermissionSet};
pub use crate::registry::{Peer, PeerRegistry};
pub use crate::session::{Phase, RestrictedState, RevertReason, SessionId, SessionOutcome};
pub use crate::settings::{ApplicationSettings, ApplyOrdering, Thresholds};
pub use crate::target::{TargetHandle, TargetProvider};
