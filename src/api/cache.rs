//! Entity kinds, tag scheme and `Syncable` implementations.

use chrono::{DateTime, Utc};
use std::fmt;

use crate::cache::Syncable;
use crate::sync::PendingOp;

use super::types::{LocationPoint, Note, Profile};

// ============================================================================
// Entity kinds
// ============================================================================

/// How pending writes for a kind relate to each other.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotPolicy {
  /// One logical value; a new write supersedes any undelivered draft.
  SingleSlot,
  /// A list; every write is a separate pending item.
  AppendOnly,
}

/// Closed set of entity categories the client synchronizes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntityKind {
  Profile,
  Notes,
  Locations,
}

impl EntityKind {
  pub const ALL: [EntityKind; 3] = [EntityKind::Profile, EntityKind::Notes, EntityKind::Locations];

  /// Cache tag for this kind.
  pub fn tag(&self) -> &'static str {
    match self {
      Self::Profile => "profile",
      Self::Notes => "notes",
      Self::Locations => "locations",
    }
  }

  /// Tag holding pending operations of the given type, e.g. `notes-Post`.
  pub fn pending_tag(&self, op: PendingOp) -> String {
    format!("{}-{}", self.tag(), op.suffix())
  }

  pub fn slot_policy(&self) -> SlotPolicy {
    match self {
      Self::Profile => SlotPolicy::SingleSlot,
      Self::Notes | Self::Locations => SlotPolicy::AppendOnly,
    }
  }

  /// Path segment of the remote resource.
  pub fn endpoint(&self) -> &'static str {
    self.tag()
  }
}

impl fmt::Display for EntityKind {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.pad(self.tag())
  }
}

/// Cache tag for a location range, `locations-<from>-<to>` in unix seconds.
pub fn locations_range_tag(from: DateTime<Utc>, to: DateTime<Utc>) -> String {
  format!(
    "{}-{}-{}",
    EntityKind::Locations.tag(),
    from.timestamp(),
    to.timestamp()
  )
}

// ============================================================================
// Syncable implementations
// ============================================================================

impl Syncable for Profile {
  fn kind() -> EntityKind {
    EntityKind::Profile
  }

  fn remote_id(&self) -> Option<String> {
    self.id.clone()
  }
}

impl Syncable for Note {
  fn kind() -> EntityKind {
    EntityKind::Notes
  }

  fn remote_id(&self) -> Option<String> {
    self.id.clone()
  }
}

impl Syncable for LocationPoint {
  fn kind() -> EntityKind {
    EntityKind::Locations
  }

  fn remote_id(&self) -> Option<String> {
    // Traces are append-only and never deleted individually
    None
  }
}
