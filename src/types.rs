use serde::{Deserialize, Serialize};
use std::fmt;

/// Per-replay-session entity identifier for game objects (ships, buildings, smoke
/// screens, squadrons). The wire format is u32 but some packets carry it as i32/i64.
#[derive(
    Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct EntityId(pub u32);

impl EntityId {
    pub fn raw(self) -> u32 {
        self.0
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u32> for EntityId {
    fn from(v: u32) -> Self {
        EntityId(v)
    }
}

impl From<i32> for EntityId {
    fn from(v: i32) -> Self {
        EntityId(v as u32)
    }
}

impl From<i64> for EntityId {
    fn from(v: i64) -> Self {
        EntityId(v as u32)
    }
}

/// A persistent player account identifier.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AccountId(pub i64);

impl AccountId {
    pub fn raw(self) -> i64 {
        self.0
    }
}

impl fmt::Display for AccountId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i64> for AccountId {
    fn from(v: i64) -> Self {
        AccountId(v)
    }
}

impl From<u32> for AccountId {
    fn from(v: u32) -> Self {
        AccountId(v as i64)
    }
}

/// A GameParams.data identifier (ship, consumable, upgrade, ...).
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GameParamId(pub i64);

impl From<i64> for GameParamId {
    fn from(v: i64) -> Self {
        GameParamId(v)
    }
}

/// The replay owner's perspective of a participant, derived per invariant I-8: SELF iff
/// `avatar_id == owner_avatar_id` (or the player's own id equals it), ALLY if same
/// `team_id` as the owner, ENEMY otherwise.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Relation {
    #[serde(rename = "self")]
    SelfPlayer,
    Ally,
    Enemy,
}

/// Packed minimap squadron identifier: `avatar_id:32 | index:3 | purpose:3 |
/// departures:1` from the low 39 bits, LSB-first.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PlaneId(pub u64);

/// Decoded fields of a [`PlaneId`]. See [`crate::bitpack::unpack_plane_id`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PlaneInfo {
    pub avatar_id: EntityId,
    pub index: u8,
    pub purpose: u8,
    pub departures: u8,
}

impl PlaneId {
    pub fn raw(self) -> u64 {
        self.0
    }
}

impl fmt::Display for PlaneId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for PlaneId {
    fn from(v: u64) -> Self {
        PlaneId(v)
    }
}

impl From<i64> for PlaneId {
    fn from(v: i64) -> Self {
        PlaneId(v as u64)
    }
}

/// World-space position in BigWorld coordinates (map-center origin).
#[derive(Debug, Default, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct WorldPos {
    pub x: f32,
    pub y: f32,
    pub z: f32,
}

/// Normalized minimap position, roughly in `[-2500, 2500]` before the pack step, in
/// `[0, 1]` after `POSITION_AND_YAW_PATTERN` unpacking is re-centered by the caller.
#[derive(Debug, Default, Clone, Copy, PartialEq, Serialize)]
pub struct NormalizedPos {
    pub x: f32,
    pub y: f32,
}

/// A game clock value in seconds since the replay started recording.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Serialize, Deserialize)]
pub struct GameClock(pub f32);

impl GameClock {
    pub fn seconds(self) -> f32 {
        self.0
    }
}

impl fmt::Display for GameClock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.1}s", self.0)
    }
}

impl std::ops::Sub for GameClock {
    type Output = f32;
    fn sub(self, rhs: GameClock) -> f32 {
        self.0 - rhs.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entity_id_conversions() {
        assert_eq!(EntityId::from(5i32).raw(), 5);
        assert_eq!(EntityId::from(-1i32).raw(), u32::MAX);
    }

    #[test]
    fn game_clock_ordering() {
        assert!(GameClock(0.4) < GameClock(1.2));
    }
}
