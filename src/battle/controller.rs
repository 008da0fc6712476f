//! C6: the battle controller — a stateful reducer that folds decoded entity
//! property/method/nested-property events into the final [`ReplayData`] tree.
//!
//! The original implementation dispatches via `getattr(self, snake_case(member))`
//! against a dynamically subscribed callback table. Rust has no equivalent without
//! giving up static dispatch, so [`BattleController::dispatch_method_call`],
//! [`BattleController::dispatch_property_change`] and
//! [`BattleController::dispatch_nested_property_change`] replace the subscription
//! table with an explicit `match` over `(type_name, member)` — the constants below
//! document which pairs are recognized, mirroring `METHOD_CALLS`/`PROPERTY_CHANGES`/
//! `NESTED_PROPERTY_CHANGES` so a reviewer can check the two side by side.

use std::collections::HashMap;

use pickled::value::Value as PickleValue;
use tracing::warn;

use crate::battle::events::{
    Achievement, Building, BuildingState, BuildingStates, BattleLogic, BattleResultSummary,
    BattleResultsData, BattleType, ChatMessage, ConsumableState, ConsumableStates, Counts,
    CrewSkills, Death, DropData, Events, InteractiveZone, Player, ReplayData, ShipConfiguration,
    Snapshot, SmokeScreen, Squadron, VehicleStates, Ward,
};
use crate::battle::state::{default_vehicle_state, PlayerType, PlayersInfo, RawPlayerInfo, StatsTables, DAMAGE_STATS_TYPES};
use crate::bitpack::{as_list, as_point, dict_get, unpack_plane_id, value_as_bool, value_as_f64, value_as_i64, value_as_str};
use crate::entity::{DecodedValue, Entity};
use crate::error::{PacketError, ReplayError};
use crate::schema::Constants;
use crate::types::{AccountId, EntityId, GameClock, GameParamId, PlaneInfo, Relation};

pub const METHOD_CALLS_AVATAR: &[&str] = &[
    "capturedAsAGoal",
    "onAchievementEarned",
    "onArenaStateReceived",
    "onChatMessage",
    "onGameRoomStateChanged",
    "onNewPlayerSpawnedInBattle",
    "receiveDamageStat",
    "receiveVehicleDeath",
    "receive_addMinimapSquadron",
    "receive_removeMinimapSquadron",
    "receive_squadronDamage",
    "receive_updateMinimapSquadron",
    "receive_wardAdded",
    "receive_wardRemoved",
    "startDissapearing",
    "updateMinimapVisionInfo",
];

pub const METHOD_CALLS_VEHICLE: &[&str] = &["setConsumables", "consumableUsed"];

pub const PROPERTY_CHANGES_VEHICLE: &[&str] = &[
    "burningFlags",
    "crewModifiersCompactParams",
    "health",
    "isAlive",
    "maxHealth",
    "regenCrewHpLimit",
    "regenerationHealth",
    "uiEnabled",
    "visibilityFlags",
];

fn dispatch_err(type_name: &str, member: &str, reason: impl Into<String>) -> ReplayError {
    ReplayError::Packet(PacketError::DispatchFailure {
        type_name: type_name.to_string(),
        member: member.to_string(),
        reason: reason.into(),
    })
}

fn arg<'a>(args: &'a [DecodedValue], i: usize, type_name: &str, member: &str) -> Result<&'a DecodedValue, ReplayError> {
    args.get(i).ok_or_else(|| dispatch_err(type_name, member, format!("missing argument {}", i)))
}

fn arg_i64(args: &[DecodedValue], i: usize, type_name: &str, member: &str) -> Result<i64, ReplayError> {
    arg(args, i, type_name, member)?
        .as_i64()
        .ok_or_else(|| dispatch_err(type_name, member, format!("argument {} is not an integer", i)))
}

fn arg_f32(args: &[DecodedValue], i: usize, type_name: &str, member: &str) -> Result<f32, ReplayError> {
    arg(args, i, type_name, member)?
        .as_f32()
        .ok_or_else(|| dispatch_err(type_name, member, format!("argument {} is not a float", i)))
}

fn arg_bool(args: &[DecodedValue], i: usize, type_name: &str, member: &str) -> Result<bool, ReplayError> {
    arg(args, i, type_name, member)?
        .as_bool()
        .ok_or_else(|| dispatch_err(type_name, member, format!("argument {} is not a bool", i)))
}

fn arg_str<'a>(args: &'a [DecodedValue], i: usize, type_name: &str, member: &str) -> Result<&'a str, ReplayError> {
    arg(args, i, type_name, member)?
        .as_str()
        .ok_or_else(|| dispatch_err(type_name, member, format!("argument {} is not a string", i)))
}

fn arg_pickle<'a>(args: &'a [DecodedValue], i: usize, type_name: &str, member: &str) -> Result<&'a PickleValue, ReplayError> {
    arg(args, i, type_name, member)?
        .as_pickle()
        .ok_or_else(|| dispatch_err(type_name, member, format!("argument {} is not pickled data", i)))
}

fn pickle_i64(value: &PickleValue, key: &str) -> Option<i64> {
    dict_get(value, key).and_then(value_as_i64)
}

fn pickle_f64(value: &PickleValue, key: &str) -> Option<f64> {
    dict_get(value, key).and_then(value_as_f64)
}

fn pickle_bool(value: &PickleValue, key: &str) -> Option<bool> {
    dict_get(value, key).and_then(value_as_bool)
}

fn pickle_str(value: &PickleValue, key: &str) -> Option<String> {
    dict_get(value, key).and_then(value_as_str)
}

/// The stateful reducer. Construct with [`BattleController::new`], feed it decoded
/// entities and dispatched events as the orchestrator walks the packet stream, then call
/// [`BattleController::get_data`] once the replay is exhausted.
pub struct BattleController {
    constants: Constants,
    ribbon_names: Vec<String>,
    period: f32,
    current_time: f32,
    previous_bar: f32,

    arena_id: Option<u64>,
    battle_logic_id: Option<EntityId>,
    battle_results: Option<BattleResultsRaw>,
    building_state: HashMap<i64, BuildingState>,
    buildings: HashMap<i64, Building>,
    crew_skills: HashMap<i64, CrewSkills>,
    drops: HashMap<i64, DropData>,
    entities: HashMap<EntityId, Entity>,
    events: Events,
    focused_by: i64,
    map: Option<String>,
    owner_account_id: Option<AccountId>,
    owner_avatar_id: Option<EntityId>,
    owner_id: Option<i64>,
    owner_vehicle_id: Option<EntityId>,
    players: HashMap<i64, Player>,
    players_info: PlayersInfo,
    ribbons: HashMap<String, i32>,
    score: HashMap<i32, i16>,
    ship_owned_by: HashMap<i64, i64>,
    snapshots: Vec<Snapshot>,
    squadrons: HashMap<u64, Squadron>,
    squadron_damage: f64,
    squadron_positions: HashMap<u64, Option<(f32, f32)>>,
    stats: StatsTables,
    vehicle_state: HashMap<i64, crate::battle::events::VehicleState>,
    version: Option<String>,
}

/// Zipped battle-results payload, kept in the same loosely-typed shape the original
/// builds (`private_data`/`common`/`players` dicts) since the field set is entirely
/// constants-driven and not something a fixed struct can describe.
struct BattleResultsRaw {
    game_mode_raw: String,
    data: BattleResultsData,
}

impl BattleController {
    pub fn new(constants: Constants, period: f32) -> Self {
        let ribbon_names = constants
            .field_list("PLAYER_FULL_RESULTS")
            .unwrap_or_default()
            .into_iter()
            .filter_map(|k| k.strip_prefix("RIBBON_").map(str::to_string))
            .collect();

        BattleController {
            constants,
            ribbon_names,
            period,
            current_time: 0.0,
            previous_bar: 0.0,
            arena_id: None,
            battle_logic_id: None,
            battle_results: None,
            building_state: HashMap::new(),
            buildings: HashMap::new(),
            crew_skills: HashMap::new(),
            drops: HashMap::new(),
            entities: HashMap::new(),
            events: Events::default(),
            focused_by: 0,
            map: None,
            owner_account_id: None,
            owner_avatar_id: None,
            owner_id: None,
            owner_vehicle_id: None,
            players: HashMap::new(),
            players_info: PlayersInfo::default(),
            ribbons: HashMap::new(),
            score: HashMap::new(),
            ship_owned_by: HashMap::new(),
            snapshots: Vec::new(),
            squadrons: HashMap::new(),
            squadron_damage: 0.0,
            squadron_positions: HashMap::new(),
            stats: StatsTables::new(),
            vehicle_state: HashMap::new(),
            version: None,
        }
    }

    pub fn current_time(&self) -> f32 {
        self.current_time
    }

    /// Advances the clock, taking a snapshot every time a `period`-wide boundary is
    /// crossed. `period <= 0` disables periodic snapshots entirely.
    pub fn set_current_time(&mut self, value: f32) {
        while self.period > 0.0 && self.previous_bar + self.period < value {
            self.take_snapshot();
            self.previous_bar += self.period;
        }
        self.current_time = value;
    }

    pub fn clock(&self) -> GameClock {
        GameClock(self.current_time)
    }

    pub fn set_map(&mut self, value: &str) {
        self.map = Some(value.strip_prefix("spaces/").unwrap_or(value).to_string());
    }

    pub fn set_version(&mut self, value: &str) {
        self.version = Some(value.replace(',', "."));
    }

    pub fn set_owner_vehicle_id(&mut self, id: EntityId) {
        self.owner_vehicle_id = Some(id);
    }

    pub fn on_player_enter_world(&mut self, entity_id: EntityId) {
        self.owner_avatar_id = Some(entity_id);
    }

    fn battle_logic_entity_id(&mut self) -> Option<EntityId> {
        if let Some(id) = self.battle_logic_id {
            return Some(id);
        }
        let id = self
            .entities
            .iter()
            .find(|(_, e)| e.type_name == "BattleLogic")
            .map(|(id, _)| *id)?;
        self.battle_logic_id = Some(id);
        Some(id)
    }

    pub fn set_battle_results(&mut self, value: &serde_json::Value) -> Result<(), ReplayError> {
        let found = value
            .get("arenaUniqueID")
            .and_then(|v| v.as_u64())
            .ok_or_else(|| dispatch_err("BattleResults", "battle_results", "missing arenaUniqueID"))?;
        let expected = self.arena_id.ok_or_else(|| dispatch_err("BattleResults", "battle_results", "arena id not yet known"))?;
        if found != expected {
            return Err(ReplayError::ArenaIdMismatch { expected, found });
        }

        self.owner_account_id = value.get("accountDBID").and_then(|v| v.as_i64()).map(AccountId);

        let common_names = self.constants.field_list("COMMON_RESULTS").unwrap_or_default();
        let common_list = value.get("commonList").and_then(|v| v.as_array()).cloned().unwrap_or_default();
        let mut common = HashMap::new();
        for (name, val) in common_names.iter().zip(common_list.iter()) {
            common.insert(name.clone(), val.clone());
        }
        let game_mode_raw = common.get("game_mode").map(|v| v.to_string()).unwrap_or_default();

        let private_names = self.constants.field_list("PLAYER_PRIVATE_RESULTS").unwrap_or_default();
        let private_list = value.get("privateDataList").and_then(|v| v.as_array()).cloned().unwrap_or_default();
        let mut private_data = HashMap::new();
        for (name, val) in private_names.iter().zip(private_list.iter()) {
            private_data.insert(name.clone(), self.expand_battle_results_field(&name.to_uppercase(), val));
        }

        let public_names = self.constants.field_list("CLIENT_PUBLIC_RESULTS").unwrap_or_default();
        let mut players = HashMap::new();
        if let Some(players_obj) = value.get("playersPublicInfo").and_then(|v| v.as_object()) {
            for (player_id_str, values) in players_obj {
                let Ok(player_id) = player_id_str.parse::<i64>() else { continue };
                let values_list = values.as_array().cloned().unwrap_or_default();
                let mut player_fields = HashMap::new();
                for (name, val) in public_names.iter().zip(values_list.iter()) {
                    let expanded = match name.as_str() {
                        "interactions" => self.expand_battle_results_field("CLIENT_VEH_INTERACTION_DETAILS", val),
                        "buildingInteractions" => {
                            self.expand_battle_results_field("CLIENT_BUILDING_INTERACTION_DETAILS", val)
                        }
                        _ => val.clone(),
                    };
                    player_fields.insert(name.clone(), expanded);
                }
                players.insert(player_id, player_fields);
            }
        }

        self.battle_results = Some(BattleResultsRaw {
            game_mode_raw,
            data: BattleResultsData { common, private_data, players },
        });
        Ok(())
    }

    /// When `table_name` names a known constants table, zips `val` (an array) through
    /// that table's field-name list; otherwise passes `val` through unchanged.
    fn expand_battle_results_field(&self, table_name: &str, val: &serde_json::Value) -> serde_json::Value {
        if !self.constants.has_table(table_name) {
            return val.clone();
        }
        let Some(field_names) = self.constants.field_list(table_name) else {
            return val.clone();
        };
        let Some(arr) = val.as_array() else {
            return val.clone();
        };
        let mut obj = serde_json::Map::new();
        for (name, sub_val) in field_names.iter().zip(arr.iter()) {
            obj.insert(name.clone(), sub_val.clone());
        }
        serde_json::Value::Object(obj)
    }

    pub fn create_entity(&mut self, entity: Entity) {
        let id = entity.id;
        if entity.type_name == "SmokeScreen" {
            let radius = entity.client_property("radius").and_then(DecodedValue::as_f32).unwrap_or(0.0);
            let points: Vec<(f32, f32)> = entity
                .client_property("points")
                .and_then(DecodedValue::as_pickle)
                .map(|v| as_list(v).iter().filter_map(as_point).collect())
                .unwrap_or_default();
            let last = points.len().saturating_sub(1);
            self.events.smokes.insert(
                id.raw() as i64,
                SmokeScreen {
                    spawn_time: self.current_time,
                    radius,
                    points,
                    bound_left: 0,
                    bound_right: last,
                    bounds: Vec::new(),
                    despawn_time: None,
                },
            );
        }
        self.entities.insert(id, entity);
    }

    pub fn destroy_entity(&mut self, entity_id: EntityId) {
        self.entities.remove(&entity_id);
    }

    /// Read access to a live entity, for orchestrator code that needs to inspect an
    /// entity's schema or decoded state before producing the next packet's edit.
    pub fn entity(&self, entity_id: EntityId) -> Option<&Entity> {
        self.entities.get(&entity_id)
    }

    /// Mutable access to a live entity, for orchestrator code applying position updates,
    /// AoI flags, or property/method decodes directly against the stored instance.
    pub fn entity_mut(&mut self, entity_id: EntityId) -> Option<&mut Entity> {
        self.entities.get_mut(&entity_id)
    }

    pub fn leave_entity(&mut self, entity_id: EntityId) {
        if let Some(smoke) = self.events.smokes.get_mut(&(entity_id.raw() as i64)) {
            smoke.despawn_time = Some(self.current_time);
        }
    }

    pub fn take_snapshot(&mut self) {
        let Some(bl_id) = self.battle_logic_entity_id() else { return };
        let Some(bl) = self.entities.get(&bl_id) else { return };

        let time_left = bl.client_property("timeLeft").and_then(DecodedValue::as_i64).unwrap_or(0);
        let battle_stage = bl.client_property("battleStage").and_then(DecodedValue::as_i64).unwrap_or(-1) as i32;

        if battle_stage == -1 {
            return;
        }

        self.snapshots.push(Snapshot {
            current_time: self.current_time,
            time_left,
            battle_stage,
            counts: Counts {
                achievements: self.events.achievements.len(),
                chat_messages: self.events.chat_messages.len(),
                // Preserves the original's bug: deaths is populated from chat length.
                deaths: self.events.chat_messages.len(),
                ribbons: self.events.ribbons.len(),
                stats: self.stats.tables.len(),
            },
        });

        self.events.focused_by.push(self.focused_by);

        for (team_id, score) in &self.score {
            self.events.score.entry(*team_id).or_default().push(*score);
        }

        for (entity_id, state) in &self.building_state {
            if self.events.dead_buildings.contains_key(entity_id) {
                continue;
            }
            if let Some(b) = self.events.building_states.get_mut(entity_id) {
                b.suppressed.push(state.suppressed as u8);
                b.visible.push(state.visible as u8);
            }
        }

        let current_time = self.current_time;
        for (entity_id, state) in &self.vehicle_state {
            if self.events.dead_vehicles.contains_key(entity_id) {
                continue;
            }
            let Some(v) = self.events.vehicle_states.get_mut(entity_id) else { continue };
            v.position_counter.push(v.position_diff.len() as u32);
            v.health.push(state.health);
            v.max_health.push(state.max_health);
            v.regeneration_health.push(state.regeneration_health);
            v.regen_crew_hp_limit.push(state.regen_crew_hp_limit);
            v.burning_flags.push(state.burning_flags);
            v.visibility_flags.push(state.visibility_flags);
            v.appeared.push(state.appeared as u8);

            for (type_id, consumable_state) in &state.consumables {
                if let Some(c) = v.consumables.get_mut(type_id) {
                    c.active.push(consumable_state.is_active_at(current_time) as u8);
                    c.count.push(consumable_state.count as i8);
                }
            }
        }

        let zone_ids: Vec<i64> = self.events.zones.keys().copied().collect();
        for entity_id in zone_ids {
            let Some(entity) = self.entities.get(&EntityId(entity_id as u32)) else { continue };
            let team_id = entity.client_property("teamId").and_then(DecodedValue::as_i64);
            let radius = entity.client_property("radius").and_then(DecodedValue::as_f32);
            let components_state = entity.client_property("componentsState").and_then(DecodedValue::as_pickle).cloned();

            let Some(zone) = self.events.zones.get_mut(&entity_id) else { continue };
            if let Some(t) = team_id {
                zone.team_id.push(t as i32);
            }
            if let Some(r) = radius {
                zone.radius.push(r);
            }
            if let Some(cs) = components_state {
                if let Some(cl) = dict_get(&cs, "captureLogic") {
                    if !matches!(cl, PickleValue::None) {
                        if let Some(v) = pickle_i64(cl, "invaderTeam") {
                            zone.invader_team.push(v as i32);
                        }
                        if let Some(v) = pickle_f64(cl, "progress") {
                            zone.progress.push(v as f32);
                        }
                        if let Some(v) = pickle_bool(cl, "hasInvaders") {
                            zone.has_invaders.push(v as u8);
                        }
                        if let Some(v) = pickle_bool(cl, "isVisible") {
                            zone.is_visible.push(v as u8);
                        }
                    }
                }
            }
        }

        for smoke in self.events.smokes.values_mut() {
            smoke.bounds.push(smoke.bound_left as u32);
            smoke.bounds.push(smoke.bound_right as u32);
        }

        self.events.squadron_counter.push(self.events.squadron_plane_id.len() as u32);
        for (plane_id, position) in &self.squadron_positions {
            if let Some((x, y)) = position {
                self.events.squadron_plane_id.push(*plane_id);
                self.events.squadron_position.push(*x);
                self.events.squadron_position.push(*y);
            }
        }
    }

    /// Consumes the controller, producing the finished replay tree. Errors if no
    /// `BattleResults` packet was ever observed (the replay is incomplete).
    pub fn get_data(mut self) -> Result<ReplayData, ReplayError> {
        if self.period > 0.0 {
            self.take_snapshot();
        }
        self.events.squadron_counter.push(self.events.squadron_plane_id.len() as u32);

        let bl_id = self.battle_logic_entity_id();
        let bl = bl_id.and_then(|id| self.entities.get(&id));

        let battle_logic = if let Some(bl) = bl {
            let battle_result = bl
                .client_property("battleResult")
                .and_then(DecodedValue::as_pickle)
                .map(|v| BattleResultSummary {
                    winner_team_id: pickle_i64(v, "winnerTeamId").unwrap_or(-1) as i32,
                    finish_reason: pickle_i64(v, "finishReason")
                        .and_then(|r| self.constants.lookup("FINISH_REASONS", &r.to_string()))
                        .unwrap_or_default(),
                });
            let battle_type = bl.client_property("battleType").and_then(DecodedValue::as_i64).and_then(|id| {
                let obj = self.constants.object("BATTLE_TYPES", &id.to_string())?;
                Some(BattleType {
                    players_per_team: obj.get("playersPerTeam")?.as_u64()? as u32,
                    name: obj.get("name")?.as_str()?.to_string(),
                    scenario: obj.get("scenario")?.as_str()?.to_string(),
                    teams_count: obj.get("teamsCount")?.as_u64()? as u32,
                })
            });
            let duration = bl.client_property("duration").and_then(DecodedValue::as_i64).unwrap_or(0);
            let state = bl.client_property("state").and_then(DecodedValue::as_pickle);
            let missions = state.and_then(|s| dict_get(s, "missions"));
            let lose_score = missions.and_then(|m| pickle_i64(m, "teamLoseScore")).unwrap_or(0) as i32;
            let win_score = missions.and_then(|m| pickle_i64(m, "teamWinScore")).unwrap_or(0) as i32;

            BattleLogic { battle_result, battle_type, duration, lose_score, win_score }
        } else {
            BattleLogic::default()
        };

        let results = self.battle_results.as_ref().ok_or(ReplayError::IncompleteReplay)?;
        let game_mode = self
            .constants
            .lookup("GAME_MODES", &results.game_mode_raw)
            .unwrap_or_else(|| results.game_mode_raw.clone());
        let battle_results = results.data.clone();

        Ok(ReplayData {
            version: self.version.clone().unwrap_or_default(),
            arena_id: self.arena_id.unwrap_or(0),
            map: self.map.clone().unwrap_or_default(),
            battle_logic,
            battle_results,
            game_mode,
            owner_account_id: self.owner_account_id.unwrap_or_default(),
            owner_avatar_id: self.owner_avatar_id.unwrap_or_default(),
            owner_id: self.owner_id.map(|v| EntityId(v as u32)).unwrap_or_default(),
            owner_vehicle_id: self.owner_vehicle_id.unwrap_or_default(),
            crew_skills: self.crew_skills,
            drops: self.drops,
            players: self.players,
            buildings: self.buildings,
            squadrons: self.squadrons,
            snapshots: self.snapshots,
            events: self.events,
        })
    }

    fn property_map_for(&self, player_type: PlayerType) -> HashMap<String, String> {
        if player_type == PlayerType::Building {
            self.constants
                .nested_field_list("SHARED_DATA_CONSTANTS", "CLIENT_BUILDING_DATA")
                .unwrap_or_default()
                .into_iter()
                .enumerate()
                .map(|(i, name)| (i.to_string(), name))
                .collect()
        } else {
            self.constants
                .numeric_map(&format!("{}_NUM_MEMBER_MAP", player_type))
                .unwrap_or_default()
        }
    }

    fn unpack_ship_config(&self, dump: &str) -> Result<ShipConfiguration, ReplayError> {
        let bytes: Vec<u8> = dump.chars().map(|c| c as u8).collect();
        let mut cur = crate::bitpack::Cursor::new(&bytes);

        let ship_id_length = cur.read_u32()?;
        if ship_id_length != 1 {
            return Err(dispatch_err("ShipConfig", "unpack_ship_config", "ship_id_length != 1"));
        }
        let ship_id = cur.read_u32()?;

        let payload_length = cur.read_u32()? as usize;
        if payload_length != cur.remaining() {
            return Err(dispatch_err("ShipConfig", "unpack_ship_config", "payload_length does not match remaining bytes"));
        }
        let units_length = cur.read_u32()? as usize;
        let unit_types = self.constants.field_list("UNIT_TYPES").unwrap_or_default();
        if units_length != unit_types.len() {
            return Err(dispatch_err("ShipConfig", "unpack_ship_config", "units_length mismatch"));
        }
        let mut units = HashMap::new();
        for unit in &unit_types {
            let slot = cur.read_u32()?;
            if slot != 0 {
                units.insert(unit.clone(), slot);
            }
        }

        let modernization = read_u32_run(&mut cur)?;
        let exterior = read_u32_run(&mut cur)?;
        let auto_supply_state = cur.read_u32()?;
        let color_scheme = read_u32_run(&mut cur)?;

        let a = cur.read_u32()?;
        let b = cur.read_u32()?;
        let abilities = if b > 64 {
            let mut v = vec![b];
            for _ in 0..a.saturating_sub(1) {
                v.push(cur.read_u32()?);
            }
            v
        } else {
            let mut v = Vec::with_capacity(b as usize);
            for _ in 0..b {
                v.push(cur.read_u32()?);
            }
            v
        };

        let ensigns = read_u32_run(&mut cur)?;
        let boosters = read_u32_run(&mut cur)?;
        let _auto_buy_info = cur.read_u32()?;
        let nation_flag = cur.read_u32()?;

        Ok(ShipConfiguration {
            ship_id,
            units,
            modernization,
            exterior,
            auto_supply_state,
            color_scheme,
            abilities,
            ensigns,
            boosters,
            nation_flag,
        })
    }

    fn update_players(&mut self) {
        let owner_avatar_raw = self.owner_avatar_id.map(|id| id.raw() as i64);
        let owner_team_id = self.owner_id.and_then(|oid| self.players_info.players.get(&oid)).and_then(|p| p.get_i64("teamId"));

        let entries: Vec<(i64, RawPlayerInfo)> = self.players_info.players.iter().map(|(k, v)| (*k, v.clone())).collect();
        for (id, player) in entries {
            if player.player_type == PlayerType::Observer {
                continue;
            }

            let avatar_id = player.get_i64("avatarId");
            let relation = if avatar_id == owner_avatar_raw || Some(id) == owner_avatar_raw {
                Relation::SelfPlayer
            } else if player.get_i64("teamId") == owner_team_id {
                Relation::Ally
            } else {
                Relation::Enemy
            };

            match player.player_type {
                PlayerType::Player | PlayerType::Bot => {
                    let ship_id = player.get_i64("shipId").unwrap_or(0);
                    let max_health = player.get_i64("maxHealth").unwrap_or(0) as f32;
                    if !self.players.contains_key(&id) {
                        self.vehicle_state.insert(ship_id, default_vehicle_state(max_health));
                        self.events.vehicle_states.insert(ship_id, VehicleStates::new(self.current_time));
                    }

                    let dump = player.get_str("shipConfigDump").unwrap_or_default();
                    let ship_config = match self.unpack_ship_config(&dump) {
                        Ok(c) => c,
                        Err(err) => {
                            warn!(error = %err, player_id = id, "failed to unpack ship config");
                            ShipConfiguration::default()
                        }
                    };

                    self.players.insert(
                        id,
                        Player {
                            account_id: AccountId(player.get_i64("accountId").unwrap_or(0)),
                            avatar_id: avatar_id.map(|v| EntityId(v as u32)),
                            clan_color: player.get_i64("clanColor").unwrap_or(0) as i32,
                            clan_id: player.get_i64("clanId").unwrap_or(0),
                            clan_tag: player.get_str("clanTag").unwrap_or_default(),
                            id: EntityId(id as u32),
                            is_bot: player.player_type == PlayerType::Bot,
                            max_health,
                            name: player.get_str("name").unwrap_or_default(),
                            prebattle_id: player.get_i64("prebattleId").unwrap_or(0),
                            realm: player.get_str("realm"),
                            relation,
                            ship_components: HashMap::new(),
                            ship_config,
                            ship_id: EntityId(ship_id as u32),
                            ship_params_id: GameParamId(player.get_i64("shipParamsId").unwrap_or(0)),
                            team_id: player.get_i64("teamId").unwrap_or(0) as i32,
                        },
                    );
                    self.ship_owned_by.insert(ship_id, id);
                }
                PlayerType::Building => {
                    if !self.buildings.contains_key(&id) {
                        self.building_state.insert(
                            id,
                            BuildingState { suppressed: player.get_bool("isSuppressed").unwrap_or(false), visible: false },
                        );
                        self.events.building_states.insert(
                            id,
                            BuildingStates { spawn_time: self.current_time, position: None, suppressed: Vec::new(), visible: Vec::new() },
                        );
                    }
                    self.buildings.insert(
                        id,
                        Building {
                            id: EntityId(id as u32),
                            name: player.get_str("name").unwrap_or_default(),
                            params_id: GameParamId(player.get_i64("paramsId").unwrap_or(0)),
                            relation,
                            team_id: player.get_i64("teamId").unwrap_or(0) as i32,
                            unique_id: player.get_i64("uniqueId").unwrap_or(0),
                        },
                    );
                }
                _ => {}
            }
        }
    }

    fn update_stats(&mut self) {
        let mut data = HashMap::new();
        for (stat, targets) in &self.stats.tables {
            let total: f64 = targets.values().sum();
            if total > 0.0 {
                data.insert(stat.to_string(), total as f32);
            }
        }
        data.insert("PLANE".to_string(), self.squadron_damage as f32);
        self.events.stats.push(data);
    }

    // ---- method-call hooks (Avatar) ----

    pub fn dispatch_method_call(&mut self, entity_id: EntityId, type_name: &str, method: &str, args: &[DecodedValue]) -> Result<(), ReplayError> {
        match (type_name, method) {
            ("Avatar", "capturedAsAGoal") => self.captured_as_a_goal(args),
            ("Avatar", "onAchievementEarned") => self.on_achievement_earned(args),
            ("Avatar", "onArenaStateReceived") => self.on_arena_state_received(args),
            ("Avatar", "onChatMessage") => self.on_chat_message(args),
            ("Avatar", "onGameRoomStateChanged") => self.on_people_update(args, "onGameRoomStateChanged", false),
            ("Avatar", "onNewPlayerSpawnedInBattle") => self.on_people_update(args, "onNewPlayerSpawnedInBattle", true),
            ("Avatar", "receiveDamageStat") => self.receive_damage_stat(args),
            ("Avatar", "receiveVehicleDeath") => self.receive_vehicle_death(args),
            ("Avatar", "receive_addMinimapSquadron") => self.receive_add_minimap_squadron(args),
            ("Avatar", "receive_removeMinimapSquadron") => self.receive_remove_minimap_squadron(args),
            ("Avatar", "receive_squadronDamage") => self.receive_squadron_damage(args),
            ("Avatar", "receive_updateMinimapSquadron") => self.receive_update_minimap_squadron(args),
            ("Avatar", "receive_wardAdded") => self.receive_ward_added(args),
            ("Avatar", "receive_wardRemoved") => self.receive_ward_removed(args),
            ("Avatar", "startDissapearing") => self.start_dissapearing(args),
            ("Avatar", "updateMinimapVisionInfo") => self.update_minimap_vision_info(args),
            ("Vehicle", "setConsumables") => self.set_consumables(entity_id, args),
            ("Vehicle", "consumableUsed") => self.consumable_used(entity_id, args),
            _ => Err(dispatch_err(type_name, method, "no subscriber for this method")),
        }
    }

    fn captured_as_a_goal(&mut self, args: &[DecodedValue]) -> Result<(), ReplayError> {
        self.focused_by = arg_i64(args, 0, "Avatar", "capturedAsAGoal")?;
        Ok(())
    }

    fn on_achievement_earned(&mut self, args: &[DecodedValue]) -> Result<(), ReplayError> {
        let player_id = arg_i64(args, 0, "Avatar", "onAchievementEarned")?;
        let achievement_id = arg_i64(args, 1, "Avatar", "onAchievementEarned")?;
        self.events.achievements.push(Achievement {
            current_time: self.current_time,
            player_id: EntityId(player_id as u32),
            achievement_id,
        });
        Ok(())
    }

    fn on_arena_state_received(&mut self, args: &[DecodedValue]) -> Result<(), ReplayError> {
        const M: &str = "onArenaStateReceived";
        let arena_unique_id = arg_i64(args, 0, "Avatar", M)? as u64;
        self.arena_id = Some(arena_unique_id);

        let players_states = arg_pickle(args, 3, "Avatar", M)?.clone();
        let bots_states = arg_pickle(args, 4, "Avatar", M)?.clone();
        let observers_state = arg_pickle(args, 5, "Avatar", M)?.clone();
        let buildings_info = arg_pickle(args, 6, "Avatar", M)?.clone();

        for (data, player_type) in [
            (&players_states, PlayerType::Player),
            (&bots_states, PlayerType::Bot),
            (&observers_state, PlayerType::Observer),
            (&buildings_info, PlayerType::Building),
        ] {
            let property_map = self.property_map_for(player_type);
            self.players_info.update(data, &property_map, player_type);
        }

        let owner_avatar_id = self.owner_avatar_id.ok_or_else(|| dispatch_err("Avatar", M, "owner avatar id not yet known"))?;
        let owner_avatar_raw = owner_avatar_id.raw() as i64;
        self.owner_id = self
            .players_info
            .players
            .iter()
            .find(|(_, p)| p.get_i64("avatarId") == Some(owner_avatar_raw))
            .map(|(id, _)| *id);

        self.update_players();
        Ok(())
    }

    fn on_people_update(&mut self, args: &[DecodedValue], member: &'static str, also_update_players: bool) -> Result<(), ReplayError> {
        let players_data = arg_pickle(args, 0, "Avatar", member)?.clone();
        let bots_data = arg_pickle(args, 1, "Avatar", member)?.clone();
        let observers_data = arg_pickle(args, 2, "Avatar", member)?.clone();

        for (data, player_type) in [
            (&players_data, PlayerType::Player),
            (&bots_data, PlayerType::Bot),
            (&observers_data, PlayerType::Observer),
        ] {
            let property_map = self.property_map_for(player_type);
            self.players_info.update(data, &property_map, player_type);
        }

        if also_update_players {
            self.update_players();
        }
        Ok(())
    }

    fn on_chat_message(&mut self, args: &[DecodedValue]) -> Result<(), ReplayError> {
        const M: &str = "onChatMessage";
        let sender_id = arg_i64(args, 0, "Avatar", M)?;
        let channel_id = arg_str(args, 1, "Avatar", M)?.to_string();
        let message = arg_str(args, 2, "Avatar", M)?.to_string();
        self.events.chat_messages.push(ChatMessage { current_time: self.current_time, sender_id, channel_id, message });
        Ok(())
    }

    fn receive_vehicle_death(&mut self, args: &[DecodedValue]) -> Result<(), ReplayError> {
        const M: &str = "receiveVehicleDeath";
        let killed_vehicle_id = arg_i64(args, 0, "Avatar", M)?;
        let fragger_vehicle_id = arg_i64(args, 1, "Avatar", M)?;
        let type_death = arg_i64(args, 2, "Avatar", M)?;
        let reason = self.constants.object("DEATH_REASONS", &type_death.to_string());
        let (icon, name) = reason
            .map(|r| {
                (
                    r.get("icon").and_then(|v| v.as_str()).unwrap_or_default().to_string(),
                    r.get("name").and_then(|v| v.as_str()).unwrap_or_default().to_string(),
                )
            })
            .unwrap_or_default();
        self.events.deaths.push(Death {
            current_time: self.current_time,
            killed_vehicle_id: EntityId(killed_vehicle_id as u32),
            fragger_vehicle_id: EntityId(fragger_vehicle_id as u32),
            type_death,
            death_icon: icon,
            death_name: name,
        });
        Ok(())
    }

    /// `NESTED_PROPERTY_CHANGES["Avatar"] = ["privateVehicleState.ribbons"]`.
    pub fn avatar_ribbons(&mut self, entity_id: EntityId, value: &PickleValue) -> Result<(), ReplayError> {
        if Some(entity_id) != self.owner_avatar_id {
            return Ok(());
        }
        let states: Vec<&PickleValue> = match value {
            PickleValue::List(l) => l .iter().collect(),
            other => vec![other],
        };
        for state in states {
            let Some(ribbon_id) = pickle_i64(state, "ribbonId") else { continue };
            let Some(count) = pickle_i64(state, "count") else { continue };
            let Some(name) = self.ribbon_names.get(ribbon_id as usize) else { continue };
            self.ribbons.insert(name.clone(), count as i32);
        }
        self.events.ribbons.push(self.ribbons.clone());
        Ok(())
    }

    fn receive_damage_stat(&mut self, args: &[DecodedValue]) -> Result<(), ReplayError> {
        let data = arg_pickle(args, 0, "Avatar", "receiveDamageStat")?;
        // Shape: {(target, stat_index): (_, amount), ...}
        if let PickleValue::Dict(d) = data {
            for (key, val) in d .iter() {
                let Some((target, stat_idx)) = hashable_pair(key) else { continue };
                let Some(amount) = as_list(val).get(1).and_then(value_as_f64) else { continue };
                let Some(stat_name) = DAMAGE_STATS_TYPES.get(stat_idx as usize) else { continue };
                self.stats.tables.entry(*stat_name).or_default().insert(target, amount);
            }
        }
        self.update_stats();
        Ok(())
    }

    fn receive_squadron_damage(&mut self, args: &[DecodedValue]) -> Result<(), ReplayError> {
        const M: &str = "receive_squadronDamage";
        let health = arg_i64(args, 1, "Avatar", M)?;
        self.squadron_damage += health as f64;
        self.update_stats();
        Ok(())
    }

    fn update_minimap_vision_info(&mut self, args: &[DecodedValue]) -> Result<(), ReplayError> {
        const M: &str = "updateMinimapVisionInfo";
        let ships_diff = arg_pickle(args, 0, "Avatar", M)?;
        let buildings_diff = arg_pickle(args, 1, "Avatar", M)?;

        for ship_diff in as_list(ships_diff) {
            let Some(packed) = pickle_i64(ship_diff, "packedData") else { continue };
            let Some(vehicle_id) = pickle_i64(ship_diff, "vehicleID") else { continue };
            let (x, y, yaw) = crate::bitpack::unpack_position_and_yaw(packed as u32);
            if x == -2500.0 && y == -2500.0 {
                if let Some(v) = self.vehicle_state.get_mut(&vehicle_id) {
                    v.visibility_flags = 0;
                    v.appeared = false;
                }
            } else if let Some(v) = self.events.vehicle_states.get_mut(&vehicle_id) {
                v.position_diff.extend([x, y, yaw]);
            }
        }

        for building_diff in as_list(buildings_diff) {
            let Some(packed) = pickle_i64(building_diff, "packedData") else { continue };
            let Some(building_id) = pickle_i64(building_diff, "vehicleID") else { continue };
            let (x, y, yaw) = crate::bitpack::unpack_position_and_yaw(packed as u32);
            if x == -2500.0 && y == -2500.0 {
                if let Some(b) = self.building_state.get_mut(&building_id) {
                    b.visible = false;
                }
            } else {
                if let Some(b) = self.events.building_states.get_mut(&building_id) {
                    b.position = Some((x, y, yaw));
                }
                if let Some(b) = self.building_state.get_mut(&building_id) {
                    b.visible = true;
                }
            }
        }
        Ok(())
    }

    fn receive_ward_added(&mut self, args: &[DecodedValue]) -> Result<(), ReplayError> {
        const M: &str = "receive_wardAdded";
        let sq_id = arg_i64(args, 0, "Avatar", M)? as u64;
        let position = arg_pickle(args, 1, "Avatar", M)?;
        let items = as_list(position);
        let x = items.first().and_then(value_as_f64).unwrap_or(0.0) as f32;
        let z = items.get(2).and_then(value_as_f64).unwrap_or(0.0) as f32;
        let duration = arg_f32(args, 2, "Avatar", M)?;
        let radius = arg_f32(args, 3, "Avatar", M)?;
        let team_id = arg_i64(args, 4, "Avatar", M)? as i32;
        let owner_id = arg_i64(args, 5, "Avatar", M)?;

        self.events.wards.push(Ward {
            spawn_time: self.current_time,
            squadron_id: sq_id,
            position: (x, z),
            duration,
            radius,
            team_id,
            owner_id: EntityId(owner_id as u32),
            despawn_time: None,
        });
        Ok(())
    }

    fn receive_ward_removed(&mut self, args: &[DecodedValue]) -> Result<(), ReplayError> {
        let sq_id = arg_i64(args, 0, "Avatar", "receive_wardRemoved")? as u64;
        if let Some(ward) = self.events.wards.iter_mut().find(|w| w.squadron_id == sq_id) {
            ward.despawn_time = Some(self.current_time);
        }
        Ok(())
    }

    fn start_dissapearing(&mut self, args: &[DecodedValue]) -> Result<(), ReplayError> {
        let ship_id = arg_i64(args, 0, "Avatar", "startDissapearing")?;
        if let Some(v) = self.vehicle_state.get_mut(&ship_id) {
            v.appeared = false;
        }
        Ok(())
    }

    fn receive_add_minimap_squadron(&mut self, args: &[DecodedValue]) -> Result<(), ReplayError> {
        const M: &str = "receive_addMinimapSquadron";
        let plane_id_raw = arg_i64(args, 0, "Avatar", M)? as u64;
        let team_id = arg_i64(args, 1, "Avatar", M)? as i32;
        let params_id = arg_i64(args, 2, "Avatar", M)?;
        let position = arg_pickle(args, 3, "Avatar", M)?;
        let pos = as_point(position);

        let PlaneInfo { avatar_id, index, purpose, departures } = unpack_plane_id(plane_id_raw);
        self.squadrons.insert(
            plane_id_raw,
            Squadron { plane_id: plane_id_raw, owner_id: avatar_id, index, purpose, departures, team_id, params_id: GameParamId(params_id) },
        );
        self.squadron_positions.insert(plane_id_raw, pos);
        Ok(())
    }

    fn receive_remove_minimap_squadron(&mut self, args: &[DecodedValue]) -> Result<(), ReplayError> {
        let plane_id = arg_i64(args, 0, "Avatar", "receive_removeMinimapSquadron")? as u64;
        self.squadron_positions.insert(plane_id, None);
        Ok(())
    }

    fn receive_update_minimap_squadron(&mut self, args: &[DecodedValue]) -> Result<(), ReplayError> {
        const M: &str = "receive_updateMinimapSquadron";
        let plane_id = arg_i64(args, 0, "Avatar", M)? as u64;
        let position = arg_pickle(args, 1, "Avatar", M)?;
        self.squadron_positions.insert(plane_id, as_point(position));
        Ok(())
    }

    // ---- method-call hooks (Vehicle) ----

    fn set_consumables(&mut self, entity_id: EntityId, args: &[DecodedValue]) -> Result<(), ReplayError> {
        let dump_states = arg_pickle(args, 0, "Vehicle", "setConsumables")?;
        let vehicle_id = entity_id.raw() as i64;
        let states = self.events.vehicle_states.entry(vehicle_id).or_insert_with(|| VehicleStates::new(self.current_time));
        let current_time = self.current_time;
        let vehicle_state = self.vehicle_state.entry(vehicle_id).or_insert_with(|| default_vehicle_state(0.0));

        for entry in as_list(dump_states) {
            let pair = as_list(entry);
            let Some(type_id) = pair.first().and_then(value_as_i64) else { continue };
            let Some(count) = as_list(pair.get(1).unwrap_or(&PickleValue::None)).get(1).and_then(value_as_i64) else { continue };
            if let std::collections::hash_map::Entry::Vacant(e) = vehicle_state.consumables.entry(type_id) {
                e.insert(ConsumableState { count: count as i32, expiry: -1.0 });
                states.consumables.insert(type_id, ConsumableStates { added_at: current_time, active: Vec::new(), count: Vec::new() });
            } else if let Some(c) = vehicle_state.consumables.get_mut(&type_id) {
                c.count = count as i32;
            }
        }
        Ok(())
    }

    fn consumable_used(&mut self, entity_id: EntityId, args: &[DecodedValue]) -> Result<(), ReplayError> {
        const M: &str = "consumableUsed";
        let consumable_type = arg_i64(args, 0, "Vehicle", M)?;
        let work_time_left = arg_f32(args, 1, "Vehicle", M)?;
        let vehicle_id = entity_id.raw() as i64;
        if let Some(state) = self.vehicle_state.get_mut(&vehicle_id).and_then(|v| v.consumables.get_mut(&consumable_type)) {
            state.expiry = self.current_time + work_time_left;
            state.count -= 1;
        }
        Ok(())
    }

    // ---- property-change hooks ----

    pub fn dispatch_property_change(&mut self, entity_id: EntityId, type_name: &str, property: &str, value: &DecodedValue) -> Result<(), ReplayError> {
        match (type_name, property) {
            ("BattleLogic", "state") => self.battlelogic_state(value),
            ("Building", "isAlive") => self.building_is_alive(entity_id, value),
            ("Building", "isSuppressed") => self.building_is_suppressed(entity_id, value),
            ("InteractiveZone", "componentsState") => self.interactivezone_components_state(entity_id),
            ("Vehicle", "burningFlags") => self.vehicle_burning_flags(entity_id, value),
            ("Vehicle", "crewModifiersCompactParams") => self.vehicle_crew_modifiers_compact_params(entity_id, value),
            ("Vehicle", "health") => self.vehicle_health(entity_id, value),
            ("Vehicle", "isAlive") => self.vehicle_is_alive(entity_id, value),
            ("Vehicle", "maxHealth") => self.vehicle_max_health(entity_id, value),
            ("Vehicle", "regenCrewHpLimit") => self.vehicle_regen_crew_hp_limit(entity_id, value),
            ("Vehicle", "regenerationHealth") => self.vehicle_regeneration_health(entity_id, value),
            ("Vehicle", "uiEnabled") => self.vehicle_ui_enabled(entity_id, value),
            ("Vehicle", "visibilityFlags") => self.vehicle_visibility_flags(entity_id, value),
            _ => Err(dispatch_err(type_name, property, "no subscriber for this property")),
        }
    }

    /// `NESTED_PROPERTY_CHANGES`: dotted-path edits under a root property, e.g.
    /// `privateVehicleState.ribbons` or `state.missions.teamsScore`.
    pub fn dispatch_nested_property_change(
        &mut self,
        entity_id: EntityId,
        type_name: &str,
        path: &str,
        value: &PickleValue,
    ) -> Result<(), ReplayError> {
        match (type_name, path) {
            ("Avatar", "privateVehicleState.ribbons") => self.avatar_ribbons(entity_id, value),
            ("BattleLogic", "state.missions.teamsScore") => self.battlelogic_teams_score(value),
            ("BattleLogic", "state.drop.data") => self.battlelogic_data(value),
            ("SmokeScreen", "points") => self.smokescreen_points(entity_id, value),
            _ => Err(dispatch_err(type_name, path, "no subscriber for this nested property")),
        }
    }

    fn battlelogic_state(&mut self, value: &DecodedValue) -> Result<(), ReplayError> {
        let pickle = value.as_pickle().ok_or_else(|| dispatch_err("BattleLogic", "state", "expected pickled value"))?;
        if self.current_time != 0.0 {
            warn!(current_time = self.current_time, "BattleLogic.state set after t=0, ignoring upstream invariant violation");
        }
        let Some(missions) = dict_get(pickle, "missions") else { return Ok(()) };
        let Some(teams_score) = dict_get(missions, "teamsScore") else { return Ok(()) };
        for entry in as_list(teams_score) {
            let Some(team_id) = pickle_i64(entry, "teamId") else { continue };
            let Some(score) = pickle_i64(entry, "score") else { continue };
            self.events.score.entry(team_id as i32).or_default();
            self.score.insert(team_id as i32, score as i16);
        }
        Ok(())
    }

    pub fn battlelogic_teams_score(&mut self, value: &PickleValue) -> Result<(), ReplayError> {
        let Some(team_id) = pickle_i64(value, "teamId") else { return Ok(()) };
        let Some(score) = pickle_i64(value, "score") else { return Ok(()) };
        self.score.insert(team_id as i32, score as i16);
        Ok(())
    }

    pub fn battlelogic_data(&mut self, value: &PickleValue) -> Result<(), ReplayError> {
        let time_left = self
            .battle_logic_entity_id()
            .and_then(|id| self.entities.get(&id))
            .and_then(|e| e.client_property("timeLeft"))
            .and_then(DecodedValue::as_i64)
            .unwrap_or(0) as u32;

        for entry in as_list(value) {
            let Some(zone_id) = pickle_i64(entry, "zoneId") else { continue };
            if self.drops.contains_key(&zone_id) {
                continue;
            }
            let params_id = pickle_i64(entry, "paramsId").unwrap_or(0);
            let start_time = pickle_i64(entry, "startTime").unwrap_or(0) as u32;
            self.drops.insert(zone_id, DropData { appear_time: time_left, params_id: GameParamId(params_id), start_time });
        }
        Ok(())
    }

    fn building_is_alive(&mut self, entity_id: EntityId, value: &DecodedValue) -> Result<(), ReplayError> {
        let alive = value.as_bool().ok_or_else(|| dispatch_err("Building", "isAlive", "expected bool"))?;
        if !alive {
            // Preserves the original's bug: building deaths land in dead_vehicles.
            self.events.dead_vehicles.insert(entity_id.raw() as i64, self.current_time);
        }
        Ok(())
    }

    fn building_is_suppressed(&mut self, entity_id: EntityId, value: &DecodedValue) -> Result<(), ReplayError> {
        let suppressed = value.as_bool().ok_or_else(|| dispatch_err("Building", "isSuppressed", "expected bool"))?;
        if let Some(state) = self.building_state.get_mut(&(entity_id.raw() as i64)) {
            state.suppressed = suppressed;
        }
        Ok(())
    }

    fn interactivezone_components_state(&mut self, entity_id: EntityId) -> Result<(), ReplayError> {
        let Some(entity) = self.entities.get(&entity_id) else { return Ok(()) };
        let type_ = entity.client_property("type").and_then(DecodedValue::as_i64).unwrap_or(0) as i32;
        let (px, py, _) = entity.position;
        let index = entity
            .client_property("componentsState")
            .and_then(DecodedValue::as_pickle)
            .and_then(|v| dict_get(v, "controlPoint"))
            .filter(|cp| !matches!(cp, PickleValue::None))
            .and_then(|cp| pickle_i64(cp, "index"))
            .map(|v| v as i32);

        self.events.zones.insert(
            entity_id.raw() as i64,
            InteractiveZone {
                spawn_time: self.current_time,
                type_,
                position: (px, py),
                index,
                team_id: Vec::new(),
                invader_team: Vec::new(),
                radius: Vec::new(),
                progress: Vec::new(),
                has_invaders: Vec::new(),
                is_visible: Vec::new(),
            },
        );
        Ok(())
    }

    /// `NESTED_PROPERTY_CHANGES["SmokeScreen"] = ["points"]`.
    pub fn smokescreen_points(&mut self, entity_id: EntityId, value: &PickleValue) -> Result<(), ReplayError> {
        let points: Vec<(f32, f32)> = as_list(value).iter().filter_map(as_point).collect();
        let Some(s) = self.events.smokes.get_mut(&(entity_id.raw() as i64)) else { return Ok(()) };
        for point in &points {
            if !s.points.iter().any(|p| p == point) {
                s.points.push(*point);
            }
        }
        if let (Some(first), Some(last)) = (points.first(), points.last()) {
            if let Some(i) = s.points.iter().position(|p| p == first) {
                s.bound_left = i;
            }
            if let Some(i) = s.points.iter().position(|p| p == last) {
                s.bound_right = i;
            }
        }
        Ok(())
    }

    fn vehicle_burning_flags(&mut self, entity_id: EntityId, value: &DecodedValue) -> Result<(), ReplayError> {
        let v = value.as_u32().ok_or_else(|| dispatch_err("Vehicle", "burningFlags", "expected u32"))?;
        self.vehicle_state.entry(entity_id.raw() as i64).or_insert_with(|| default_vehicle_state(0.0)).burning_flags = v;
        Ok(())
    }

    fn vehicle_crew_modifiers_compact_params(&mut self, entity_id: EntityId, value: &DecodedValue) -> Result<(), ReplayError> {
        let pickle = value.as_pickle().ok_or_else(|| dispatch_err("Vehicle", "crewModifiersCompactParams", "expected pickled value"))?;
        self.crew_skills.insert(
            entity_id.raw() as i64,
            CrewSkills {
                params_id: GameParamId(pickle_i64(pickle, "paramsId").unwrap_or(0)),
                is_in_adaptation: pickle_bool(pickle, "isInAdaptation").unwrap_or(false),
                learned_skills: as_list(pickle)
                    .iter()
                    .filter_map(|v| dict_get(v, "learnedSkills"))
                    .map(|v| as_list(v).iter().filter_map(value_as_i64).map(|i| i as u32).collect())
                    .collect(),
            },
        );
        Ok(())
    }

    fn vehicle_health(&mut self, entity_id: EntityId, value: &DecodedValue) -> Result<(), ReplayError> {
        let v = value.as_f32().ok_or_else(|| dispatch_err("Vehicle", "health", "expected f32"))?;
        self.vehicle_state.entry(entity_id.raw() as i64).or_insert_with(|| default_vehicle_state(v)).health = v;
        Ok(())
    }

    fn vehicle_is_alive(&mut self, entity_id: EntityId, value: &DecodedValue) -> Result<(), ReplayError> {
        let alive = value.as_bool().ok_or_else(|| dispatch_err("Vehicle", "isAlive", "expected bool"))?;
        if !alive {
            self.events.dead_vehicles.insert(entity_id.raw() as i64, self.current_time);
        }
        Ok(())
    }

    fn vehicle_max_health(&mut self, entity_id: EntityId, value: &DecodedValue) -> Result<(), ReplayError> {
        let v = value.as_f32().ok_or_else(|| dispatch_err("Vehicle", "maxHealth", "expected f32"))?;
        self.vehicle_state.entry(entity_id.raw() as i64).or_insert_with(|| default_vehicle_state(v)).max_health = v;
        Ok(())
    }

    fn vehicle_regeneration_health(&mut self, entity_id: EntityId, value: &DecodedValue) -> Result<(), ReplayError> {
        let v = value.as_f32().ok_or_else(|| dispatch_err("Vehicle", "regenerationHealth", "expected f32"))?;
        self.vehicle_state.entry(entity_id.raw() as i64).or_insert_with(|| default_vehicle_state(0.0)).regeneration_health = v;
        Ok(())
    }

    fn vehicle_regen_crew_hp_limit(&mut self, entity_id: EntityId, value: &DecodedValue) -> Result<(), ReplayError> {
        let v = value.as_f32().ok_or_else(|| dispatch_err("Vehicle", "regenCrewHpLimit", "expected f32"))?;
        self.vehicle_state.entry(entity_id.raw() as i64).or_insert_with(|| default_vehicle_state(0.0)).regen_crew_hp_limit = v;
        Ok(())
    }

    fn vehicle_ui_enabled(&mut self, entity_id: EntityId, value: &DecodedValue) -> Result<(), ReplayError> {
        let enabled = value.as_bool().ok_or_else(|| dispatch_err("Vehicle", "uiEnabled", "expected bool"))?;
        if !enabled {
            return Err(dispatch_err("Vehicle", "uiEnabled", "uiEnabled went false, upstream invariant assumed always true"));
        }
        self.vehicle_state.entry(entity_id.raw() as i64).or_insert_with(|| default_vehicle_state(0.0)).appeared = true;
        Ok(())
    }

    fn vehicle_visibility_flags(&mut self, entity_id: EntityId, value: &DecodedValue) -> Result<(), ReplayError> {
        let v = value.as_u32().ok_or_else(|| dispatch_err("Vehicle", "visibilityFlags", "expected u32"))?;
        self.vehicle_state.entry(entity_id.raw() as i64).or_insert_with(|| default_vehicle_state(0.0)).visibility_flags = v;
        Ok(())
    }
}

fn read_u32_run(cur: &mut crate::bitpack::Cursor) -> Result<Vec<u32>, ReplayError> {
    let len = cur.read_u32()? as usize;
    let mut out = Vec::with_capacity(len);
    for _ in 0..len {
        out.push(cur.read_u32()?);
    }
    Ok(out)
}

fn hashable_pair(key: &pickled::value::HashableValue) -> Option<(i64, i64)> {
    use pickled::value::HashableValue;
    match key {
        HashableValue::Tuple(t) => {
            let items = t ;
            let target = items.first().and_then(hashable_as_i64)?;
            let stat = items.get(1).and_then(hashable_as_i64)?;
            Some((target, stat))
        }
        _ => None,
    }
}

fn hashable_as_i64(v: &pickled::value::HashableValue) -> Option<i64> {
    use pickled::value::HashableValue;
    match v {
        HashableValue::I64(i) => Some(*i),
        HashableValue::Bool(b) => Some(if *b { 1 } else { 0 }),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::EntityDef;
    use std::sync::Arc;

    fn battle_logic_entity(id: u32, time_left: i64, battle_stage: i64) -> Entity {
        let def = Arc::new(EntityDef { name: "BattleLogic".to_string(), ..Default::default() });
        let mut e = Entity::new(EntityId(id), def);
        e.client_properties.insert("timeLeft".to_string(), DecodedValue::I32(time_left as i32));
        e.client_properties.insert("battleStage".to_string(), DecodedValue::I32(battle_stage as i32));
        e
    }

    fn new_controller() -> BattleController {
        BattleController::new(Constants::default(), 0.5)
    }

    #[test]
    fn snapshot_cadence_matches_period_boundaries() {
        let mut c = new_controller();
        c.create_entity(battle_logic_entity(1, 100, 0));

        for t in [0.0_f32, 0.4, 0.9, 1.2] {
            c.set_current_time(t);
        }
        // Crossing 0.5 (at t=0.9) and 1.0 (at t=1.2) each force one snapshot.
        assert_eq!(c.snapshots.len(), 2);
    }

    #[test]
    fn battle_stage_minus_one_skips_snapshot() {
        let mut c = new_controller();
        c.create_entity(battle_logic_entity(1, 100, -1));
        c.take_snapshot();
        assert!(c.snapshots.is_empty());
    }

    #[test]
    fn dead_vehicle_state_freezes_after_death() {
        let mut c = new_controller();
        c.create_entity(battle_logic_entity(1, 50, 0));
        c.vehicle_state.insert(7, default_vehicle_state(1000.0));
        c.events.vehicle_states.insert(7, VehicleStates::new(0.0));

        c.set_current_time(10.0);
        c.vehicle_is_alive(EntityId(7), &DecodedValue::U8(0)).unwrap();
        assert_eq!(*c.events.dead_vehicles.get(&7).unwrap(), 10.0);

        c.take_snapshot();
        assert!(c.events.vehicle_states[&7].health.is_empty());
    }

    #[test]
    fn ship_config_ambiguity_b_greater_than_64_keeps_b_as_first_ability() {
        let c = new_controller();
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&1u32.to_le_bytes()); // ship_id_length
        bytes.extend_from_slice(&99u32.to_le_bytes()); // ship_id
        bytes.extend_from_slice(&60u32.to_le_bytes()); // payload_length = remaining bytes (15 u32 fields)
        bytes.extend_from_slice(&0u32.to_le_bytes()); // units_length = 0 (matches empty UNIT_TYPES)
        bytes.extend_from_slice(&0u32.to_le_bytes()); // modernization run length
        bytes.extend_from_slice(&0u32.to_le_bytes()); // exterior run length
        bytes.extend_from_slice(&0u32.to_le_bytes()); // auto_supply_state
        bytes.extend_from_slice(&0u32.to_le_bytes()); // color_scheme run length
        bytes.extend_from_slice(&5u32.to_le_bytes()); // a
        bytes.extend_from_slice(&100u32.to_le_bytes()); // b > 64
        bytes.extend_from_slice(&1u32.to_le_bytes()); // one more ability (a - 1 = 4 would be needed; keep small)
        bytes.extend_from_slice(&2u32.to_le_bytes());
        bytes.extend_from_slice(&3u32.to_le_bytes());
        bytes.extend_from_slice(&4u32.to_le_bytes());
        bytes.extend_from_slice(&0u32.to_le_bytes()); // ensigns run length
        bytes.extend_from_slice(&0u32.to_le_bytes()); // boosters run length
        bytes.extend_from_slice(&0u32.to_le_bytes()); // auto buy info
        bytes.extend_from_slice(&7u32.to_le_bytes()); // nation_flag

        let dump: String = bytes.iter().map(|&b| b as char).collect();
        let config = c.unpack_ship_config(&dump).unwrap();
        assert_eq!(config.abilities, vec![100, 1, 2, 3, 4]);
        assert_eq!(config.nation_flag, 7);
    }
}
