//! Battle-state value types (C6 data model). One-to-one with the original pydantic
//! model set, translated to plain Rust structs with primitive growable buffers for the
//! per-tick timeline hot paths (no per-sample record wrapping).

use serde::Serialize;
use serde_json::Value as JsonValue;
use std::collections::HashMap;

use crate::types::{AccountId, EntityId, GameClock, GameParamId, Relation};

#[derive(Debug, Clone, Copy, Serialize)]
pub struct Counts {
    pub achievements: usize,
    pub chat_messages: usize,
    pub deaths: usize,
    pub ribbons: usize,
    pub stats: usize,
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct Snapshot {
    pub current_time: f32,
    pub time_left: i64,
    pub battle_stage: i32,
    pub counts: Counts,
}

#[derive(Debug, Clone, Serialize)]
pub struct BattleResultSummary {
    pub winner_team_id: i32,
    pub finish_reason: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct BattleType {
    pub players_per_team: u32,
    pub name: String,
    pub scenario: String,
    pub teams_count: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct BattleLogic {
    pub battle_result: Option<BattleResultSummary>,
    pub battle_type: Option<BattleType>,
    pub duration: i64,
    pub lose_score: i32,
    pub win_score: i32,
}

impl Default for BattleLogic {
    fn default() -> Self {
        BattleLogic {
            battle_result: None,
            battle_type: None,
            duration: 0,
            lose_score: 0,
            win_score: 0,
        }
    }
}

/// The `BattleResults` packet's payload, zipped through the `*_RESULTS`/
/// `CLIENT_*_INTERACTION_DETAILS` constant tables. Kept as loosely-typed JSON maps
/// rather than a fixed struct since the field set is entirely schema-driven and varies
/// by client version.
#[derive(Debug, Clone, Default, Serialize)]
pub struct BattleResultsData {
    pub common: HashMap<String, JsonValue>,
    pub private_data: HashMap<String, JsonValue>,
    pub players: HashMap<i64, HashMap<String, JsonValue>>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct CrewSkills {
    pub params_id: GameParamId,
    pub is_in_adaptation: bool,
    pub learned_skills: Vec<Vec<u32>>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ShipConfiguration {
    pub ship_id: u32,
    pub units: HashMap<String, u32>,
    pub modernization: Vec<u32>,
    pub exterior: Vec<u32>,
    pub auto_supply_state: u32,
    pub color_scheme: Vec<u32>,
    pub abilities: Vec<u32>,
    pub ensigns: Vec<u32>,
    pub boosters: Vec<u32>,
    pub nation_flag: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct Player {
    pub account_id: AccountId,
    pub avatar_id: Option<EntityId>,
    pub clan_color: i32,
    pub clan_id: i64,
    pub clan_tag: String,
    pub id: EntityId,
    pub is_bot: bool,
    pub max_health: f32,
    pub name: String,
    pub prebattle_id: i64,
    pub realm: Option<String>,
    pub relation: Relation,
    pub ship_components: HashMap<String, String>,
    pub ship_config: ShipConfiguration,
    pub ship_id: EntityId,
    pub ship_params_id: GameParamId,
    pub team_id: i32,
}

#[derive(Debug, Clone, Serialize)]
pub struct Building {
    pub id: EntityId,
    pub name: String,
    pub params_id: GameParamId,
    pub relation: Relation,
    pub team_id: i32,
    pub unique_id: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct Achievement {
    pub current_time: f32,
    pub player_id: EntityId,
    pub achievement_id: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ChatMessage {
    pub current_time: f32,
    pub sender_id: i64,
    pub channel_id: String,
    pub message: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct Death {
    pub current_time: f32,
    pub killed_vehicle_id: EntityId,
    pub fragger_vehicle_id: EntityId,
    pub type_death: i64,
    pub death_icon: String,
    pub death_name: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct BuildingState {
    pub suppressed: bool,
    pub visible: bool,
}

/// Not updated after death (`Events::dead_buildings`) — buildings are immobile so
/// `position` is captured once.
#[derive(Debug, Clone, Serialize)]
pub struct BuildingStates {
    pub spawn_time: f32,
    pub position: Option<(f32, f32, f32)>,
    pub suppressed: Vec<u8>,
    pub visible: Vec<u8>,
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct ConsumableState {
    pub count: i32,
    pub expiry: f32,
}

impl ConsumableState {
    pub fn is_active_at(&self, current_time: f32) -> bool {
        self.expiry >= 0.0 && current_time < self.expiry
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ConsumableStates {
    pub added_at: f32,
    pub active: Vec<u8>,
    pub count: Vec<i8>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct VehicleState {
    pub health: f32,
    pub max_health: f32,
    pub regeneration_health: f32,
    pub regen_crew_hp_limit: f32,
    pub burning_flags: u32,
    pub visibility_flags: u32,
    pub appeared: bool,
    pub consumables: HashMap<i64, ConsumableState>,
}

/// Not updated after death (`Events::dead_vehicles`).
#[derive(Debug, Clone, Serialize)]
pub struct VehicleStates {
    pub spawn_time: f32,
    pub position_diff: Vec<f32>,
    pub position_counter: Vec<u32>,
    pub health: Vec<f32>,
    pub max_health: Vec<f32>,
    pub regeneration_health: Vec<f32>,
    pub regen_crew_hp_limit: Vec<f32>,
    pub burning_flags: Vec<u32>,
    pub visibility_flags: Vec<u32>,
    pub appeared: Vec<u8>,
    pub consumables: HashMap<i64, ConsumableStates>,
}

impl VehicleStates {
    pub fn new(spawn_time: f32) -> Self {
        VehicleStates {
            spawn_time,
            position_diff: Vec::new(),
            position_counter: Vec::new(),
            health: Vec::new(),
            max_health: Vec::new(),
            regeneration_health: Vec::new(),
            regen_crew_hp_limit: Vec::new(),
            burning_flags: Vec::new(),
            visibility_flags: Vec::new(),
            appeared: Vec::new(),
            consumables: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct DropData {
    pub appear_time: u32,
    pub params_id: GameParamId,
    pub start_time: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct InteractiveZone {
    pub spawn_time: f32,
    pub type_: i32,
    pub position: (f32, f32),
    pub index: Option<i32>,
    pub team_id: Vec<i32>,
    pub invader_team: Vec<i32>,
    pub radius: Vec<f32>,
    pub progress: Vec<f32>,
    pub has_invaders: Vec<u8>,
    pub is_visible: Vec<u8>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SmokeScreen {
    pub spawn_time: f32,
    pub radius: f32,
    pub points: Vec<(f32, f32)>,
    pub bound_left: usize,
    pub bound_right: usize,
    pub bounds: Vec<u32>,
    pub despawn_time: Option<f32>,
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct Squadron {
    pub plane_id: u64,
    pub owner_id: EntityId,
    pub index: u8,
    pub purpose: u8,
    pub departures: u8,
    pub team_id: i32,
    pub params_id: GameParamId,
}

#[derive(Debug, Clone, Serialize)]
pub struct Ward {
    pub spawn_time: f32,
    pub squadron_id: u64,
    pub position: (f32, f32),
    pub duration: f32,
    pub radius: f32,
    pub team_id: i32,
    pub owner_id: EntityId,
    pub despawn_time: Option<f32>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct Events {
    pub achievements: Vec<Achievement>,
    pub building_states: HashMap<i64, BuildingStates>,
    pub chat_messages: Vec<ChatMessage>,
    pub dead_buildings: HashMap<i64, f32>,
    pub dead_vehicles: HashMap<i64, f32>,
    pub deaths: Vec<Death>,
    pub focused_by: Vec<i64>,
    pub ribbons: Vec<HashMap<String, i32>>,
    pub stats: Vec<HashMap<String, f32>>,
    pub score: HashMap<i32, Vec<i16>>,
    pub smokes: HashMap<i64, SmokeScreen>,
    pub squadron_counter: Vec<u32>,
    pub squadron_plane_id: Vec<u64>,
    pub squadron_position: Vec<f32>,
    pub vehicle_states: HashMap<i64, VehicleStates>,
    pub wards: Vec<Ward>,
    pub zones: HashMap<i64, InteractiveZone>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReplayData {
    pub version: String,
    pub arena_id: u64,
    pub map: String,
    pub battle_logic: BattleLogic,
    pub battle_results: BattleResultsData,
    pub game_mode: String,
    pub owner_account_id: AccountId,
    pub owner_avatar_id: EntityId,
    pub owner_id: EntityId,
    pub owner_vehicle_id: EntityId,
    pub crew_skills: HashMap<i64, CrewSkills>,
    pub drops: HashMap<i64, DropData>,
    pub players: HashMap<i64, Player>,
    pub buildings: HashMap<i64, Building>,
    pub squadrons: HashMap<u64, Squadron>,
    pub snapshots: Vec<Snapshot>,
    pub events: Events,
}

/// Used only to thread a monotone clock value through controller hooks that need to
/// record "when did this happen" without re-deriving it from the raw `f32`.
pub fn clock(current_time: f32) -> GameClock {
    GameClock(current_time)
}
