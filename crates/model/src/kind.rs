use derive_more::Display;
use serde::{Deserialize, Serialize};

/// The game object a slice of appearance state belongs to.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ObjectKind {
    #[display("player")]
    Player,
    #[display("minion or mount")]
    MinionOrMount,
    #[display("pet")]
    Pet,
    #[display("companion")]
    Companion,
}

impl ObjectKind {
    pub const ALL: [ObjectKind; 4] = [Self::Player, Self::MinionOrMount, Self::Pet, Self::Companion];
}

/// One independently toggleable appearance feature.
///
/// Ordering matters: applying iterates capabilities in declaration order, so
/// files and manipulations land before the redraw that makes them visible.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    #[display("mod files")]
    ModFiles,
    #[display("mod manipulations")]
    ModManipulation,
    #[display("pose overlay")]
    PoseOverlay,
    #[display("height offset")]
    HeightOffset,
    #[display("title")]
    Title,
    #[display("pet nickname")]
    PetNickname,
    #[display("status icons")]
    StatusIcons,
    #[display("forced redraw")]
    ForcedRedraw,
}

impl Capability {
    pub const ALL: [Capability; 8] = [
        Self::ModFiles,
        Self::ModManipulation,
        Self::PoseOverlay,
        Self::HeightOffset,
        Self::Title,
        Self::PetNickname,
        Self::StatusIcons,
        Self::ForcedRedraw,
    ];

    /// Whether snapshots carry an opaque string blob for this capability.
    ///
    /// Mod files come from the snapshot's file replacements and a redraw is
    /// derived from other changes; everything else is a blob.
    pub fn carries_blob(self) -> bool {
        !matches!(self, Self::ModFiles | Self::ForcedRedraw)
    }

    /// Changing this capability requires the target to be redrawn.
    pub fn requires_redraw(self) -> bool {
        matches!(self, Self::ModFiles | Self::ModManipulation)
    }
}
