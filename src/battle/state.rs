//! Runtime-only battle state: values the controller needs while reducing the packet
//! stream but that don't themselves appear in the final `ReplayData` (they get folded
//! into `Player`/`Building`/`Events` at the point of use).

use std::collections::HashMap;

use crate::battle::events::{ConsumableState, VehicleState};
use crate::bitpack::value_as_i64;
use pickled::value::Value as PickleValue;
use strum_macros::{Display, EnumString};

/// Which of `onArenaStateReceived`'s four restricted-decoded blobs a record came from.
/// `Display`/`EnumString` round-trip through the same uppercase spelling the schema's
/// `{PLAYER,BOT,OBSERVER}_NUM_MEMBER_MAP`/`CLIENT_BUILDING_DATA` table names use, so a
/// `PlayerType` can be interpolated straight into a constants lookup key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString)]
#[strum(serialize_all = "UPPERCASE")]
pub enum PlayerType {
    Player,
    Bot,
    Observer,
    Building,
}

/// One participant's flattened property dict, as reconstructed from a restricted-decoded
/// `(key_index, value)` tuple list against a numeric-index-to-name constants map.
#[derive(Debug, Clone)]
pub struct RawPlayerInfo {
    pub fields: HashMap<String, PickleValue>,
    pub player_type: PlayerType,
}

impl Default for RawPlayerInfo {
    fn default() -> Self {
        RawPlayerInfo { fields: HashMap::new(), player_type: PlayerType::Player }
    }
}

impl RawPlayerInfo {
    pub fn get(&self, key: &str) -> Option<&PickleValue> {
        self.fields.get(key)
    }

    pub fn get_i64(&self, key: &str) -> Option<i64> {
        self.fields.get(key).and_then(value_as_i64)
    }

    pub fn get_str(&self, key: &str) -> Option<String> {
        match self.fields.get(key) {
            Some(PickleValue::String(s)) => Some(s .clone()),
            Some(PickleValue::Bytes(b)) => Some(String::from_utf8_lossy(b ).into_owned()),
            _ => None,
        }
    }

    pub fn get_bool(&self, key: &str) -> Option<bool> {
        self.get_i64(key).map(|v| v != 0)
    }
}

/// Accumulates raw player/bot/observer/building records across however many
/// `onArenaStateReceived`/`onGameRoomStateChanged`/`onNewPlayerSpawnedInBattle` calls
/// arrive, keyed by participant id. Later arrivals for the same id merge fields in,
/// matching the original's `setdefault(...).update(...)`.
#[derive(Debug, Clone, Default)]
pub struct PlayersInfo {
    pub players: HashMap<i64, RawPlayerInfo>,
}

impl PlayersInfo {
    /// `data` is the restricted-decoded top-level list: each element is a list of
    /// `(numeric_key, value)` pairs. `property_map` translates numeric key to field name.
    pub fn update(
        &mut self,
        data: &PickleValue,
        property_map: &HashMap<String, String>,
        player_type: PlayerType,
    ) {
        let PickleValue::List(records) = data else {
            return;
        };
        for record in records .iter() {
            let PickleValue::List(pairs) = record else {
                continue;
            };
            let mut fields = HashMap::new();
            for pair in pairs .iter() {
                if let PickleValue::Tuple(kv) = pair {
                    let kv = kv ;
                    if kv.len() != 2 {
                        continue;
                    }
                    if let Some(key_idx) = value_as_i64(&kv[0]) {
                        if let Some(name) = property_map.get(&key_idx.to_string()) {
                            fields.insert(name.clone(), kv[1].clone());
                        }
                    }
                }
            }
            let Some(id) = fields.get("id").and_then(value_as_i64) else {
                continue;
            };
            let entry = self.players.entry(id).or_insert_with(|| RawPlayerInfo {
                fields: HashMap::new(),
                player_type,
            });
            entry.player_type = player_type;
            entry.fields.extend(fields);
        }
    }
}

/// Running per-target damage-stat accumulation, one map per [`DAMAGE_STATS_TYPES`]
/// category.
pub const DAMAGE_STATS_TYPES: [&str; 4] = ["ENEMY", "ALLY", "SPOT", "AGRO"];

#[derive(Debug, Clone, Default)]
pub struct StatsTables {
    pub tables: HashMap<&'static str, HashMap<i64, f64>>,
}

impl StatsTables {
    pub fn new() -> Self {
        let mut tables = HashMap::new();
        for name in DAMAGE_STATS_TYPES {
            tables.insert(name, HashMap::new());
        }
        StatsTables { tables }
    }
}

pub fn default_vehicle_state(max_health: f32) -> VehicleState {
    VehicleState {
        health: max_health,
        max_health,
        consumables: HashMap::<i64, ConsumableState>::new(),
        ..Default::default()
    }
}
