use mirage_model::{ObjectKind, PeerId};

/// Opaque handle to a live in-game object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TargetHandle(pub u64);

/// Knows where peers are rendered locally.
///
/// Implementations are read-only views of game state and must be cheap:
/// they're called from every session, on every poll.
pub trait TargetProvider: Send + Sync {
    /// Live handle for a peer's object of `kind`, if it is currently drawn.
    fn resolve(&self, peer: &PeerId, kind: ObjectKind) -> Option<TargetHandle>;

    /// `true` while the local player is between zones.
    fn is_transitioning(&self) -> bool;

    /// Whether a handle obtained earlier still refers to the same object.
    fn is_valid(&self, handle: TargetHandle) -> bool;
}
