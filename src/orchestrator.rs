//! C7: the orchestrator.
//!
//! The only component that knows the full pipeline: container decode, version
//! resolution, schema lookup, packet demultiplexing, and dispatch into the entity
//! runtime and battle controller. Everything upstream (`container`, `packet`, `schema`,
//! `entity`, `battle`) is usable standalone; this module is what wires them into the
//! public `parse` entry point.

use std::sync::Arc;

use derive_builder::Builder;
use serde::Serialize;
use serde_json::Value as JsonValue;
use tracing::{debug, span, warn, Level};

use crate::battle::events::ReplayData;
use crate::battle::BattleController;
use crate::bitpack::Cursor;
use crate::container;
use crate::entity::{apply_entity_create_state, Entity};
use crate::error::{PacketError, ReplayError};
use crate::packet::{self, PacketPayload, PacketsMapping, TimedPacket};
use crate::schema::{Definitions, SchemaProvider};
use crate::types::EntityId;

/// Knobs threaded through a single [`parse`] call.
#[derive(Debug, Clone, Builder)]
#[builder(setter(into))]
pub struct ParseOptions {
    /// Snapshot cadence in seconds; `0.0` disables periodic snapshots entirely.
    #[builder(default = "5.0")]
    pub period: f32,
    /// Abort on the first recoverable packet-decode or dispatch failure instead of
    /// logging it and leaving prior controller state untouched.
    #[builder(default = "false")]
    pub strict: bool,
    /// Traces every dispatched packet at debug level. Off by default; the per-packet
    /// span already carries the version, so this is only needed when chasing a
    /// specific entity's history through a replay.
    #[builder(default = "false")]
    pub audit: bool,
}

impl Default for ParseOptions {
    fn default() -> Self {
        ParseOptions { period: 5.0, strict: false, audit: false }
    }
}

/// The top-level parse result: the container's raw header fields alongside the
/// reconstructed battle state.
#[derive(Debug, Clone, Serialize)]
pub struct Replay {
    pub arena_info: JsonValue,
    pub extras: Vec<Vec<u8>>,
    pub data: ReplayData,
}

fn normalize_version(raw: &str) -> String {
    raw.replace(',', ".")
}

/// Maps a normalized client version to the tag table that decodes its packet stream.
/// Only one client version's table is known; replays from any other version fail
/// fast with [`ReplayError::UnsupportedVersion`] rather than guessing at a shift in
/// tag numbering.
fn packets_mapping_for(version: &str) -> Result<PacketsMapping, ReplayError> {
    match version {
        "12.6.0" => Ok(PacketsMapping::wows_12_6_0()),
        other => Err(ReplayError::UnsupportedVersion(other.to_string())),
    }
}

fn ignorable_dispatch_failure(err: &ReplayError) -> bool {
    matches!(err, ReplayError::Packet(PacketError::DispatchFailure { reason, .. }) if reason.starts_with("no subscriber"))
}

/// Parses a full `.wowsreplay` file's bytes into a [`Replay`].
///
/// `schema` resolves the client version embedded in the replay's arena info to its
/// constant tables and entity definitions; callers that only care about the bundled
/// 12.6.0 assets can pass [`crate::schema::JsonSchemaProvider::default()`].
pub fn parse(data: &[u8], schema: &dyn SchemaProvider, options: &ParseOptions) -> Result<Replay, ReplayError> {
    let container = container::decode(data)?;

    let version_raw = container
        .arena_info
        .get("clientVersionFromXml")
        .and_then(JsonValue::as_str)
        .ok_or_else(|| ReplayError::SchemaError("arena info missing clientVersionFromXml".to_string()))?;
    let version = normalize_version(version_raw);

    let definitions = schema.definitions_for(&version)?;
    let mapping = packets_mapping_for(&version)?;

    let mut controller = BattleController::new(definitions.constants.clone(), options.period);

    let span = span!(Level::DEBUG, "dispatch_packets", version = %version);
    let _enter = span.enter();

    let mut first_error: Option<ReplayError> = None;
    packet::demux(&container.packet_stream, &mapping, options.strict, |timed| {
        if first_error.is_some() {
            return;
        }
        if options.audit {
            debug!(time = timed.time, kind = ?timed.payload.kind(), "dispatching packet");
        }
        if let Err(err) = dispatch_packet(&mut controller, &definitions, timed) {
            if options.strict {
                first_error = Some(err);
            } else {
                warn!(error = %err, "packet dispatch failed, skipping");
            }
        }
    })?;

    if let Some(err) = first_error {
        return Err(err);
    }

    let replay_data = controller.get_data()?;
    Ok(Replay { arena_info: container.arena_info, extras: container.extras, data: replay_data })
}

/// One packet's worth of state transition. Mirrors the original player's
/// `_process_packet` switch: every packet advances the clock first, then most
/// variants either mutate an entity directly or hand a decoded value to the
/// controller's dispatch tables.
fn dispatch_packet(controller: &mut BattleController, definitions: &Definitions, packet: TimedPacket) -> Result<(), ReplayError> {
    controller.set_current_time(packet.time);

    match packet.payload {
        PacketPayload::Version { version } => controller.set_version(&version),
        PacketPayload::Map { name } => controller.set_map(&name),
        PacketPayload::PlayerEntity { vehicle_id } => controller.set_owner_vehicle_id(vehicle_id),
        PacketPayload::BattleResults { data } => controller.set_battle_results(&data)?,

        PacketPayload::BasePlayerCreate { entity_id, state } => {
            apply_player_create(controller, definitions, entity_id, &state, true)?;
            controller.on_player_enter_world(entity_id);
        }
        PacketPayload::CellPlayerCreate { entity_id, state } => {
            apply_player_create(controller, definitions, entity_id, &state, false)?;
        }

        PacketPayload::EntityEnter { entity_id } => {
            if let Some(entity) = controller.entity_mut(entity_id) {
                entity.is_in_aoi = true;
            }
        }
        PacketPayload::EntityLeave { entity_id } => {
            if let Some(entity) = controller.entity_mut(entity_id) {
                entity.is_in_aoi = false;
            }
            controller.leave_entity(entity_id);
        }
        PacketPayload::EntityControl { .. } => {}

        PacketPayload::EntityCreate { entity_id, type_index, x, y, z, state } => {
            let def = definitions.get_entity_def_by_index(type_index)?;
            let mut entity = Entity::new(entity_id, Arc::new(def.clone()));
            entity.position = (x, y, z);
            apply_entity_create_state(&mut entity, &state)?;
            controller.create_entity(entity);
        }

        PacketPayload::EntityProperty { entity_id, message_id, data } => {
            apply_entity_property(controller, entity_id, message_id, &data)?;
        }
        PacketPayload::EntityMethod { entity_id, message_id, data } => {
            apply_entity_method(controller, entity_id, message_id, &data)?;
        }
        PacketPayload::NestedProperty { entity_id, data } => {
            apply_nested_property(controller, entity_id, &data)?;
        }

        PacketPayload::Position { entity_id, x, y, z, yaw, pitch, roll } => {
            if let Some(entity) = controller.entity_mut(entity_id) {
                entity.position = (x, y, z);
                entity.yaw = yaw;
                entity.pitch = pitch;
                entity.roll = roll;
            }
        }
        PacketPayload::PlayerPosition { entity_id_1, entity_id_2, x, y, z, yaw, pitch, roll } => {
            apply_player_position(controller, entity_id_1, entity_id_2, x, y, z, yaw, pitch, roll);
        }

        PacketPayload::Camera { .. }
        | PacketPayload::CameraMode { .. }
        | PacketPayload::CameraFreeLook { .. }
        | PacketPayload::CruiseState { .. } => {}
    }
    Ok(())
}

/// `BasePlayerCreate`/`CellPlayerCreate` both describe the owner's own `Avatar`
/// entity, get-or-created by id, decoded by walking every index of the relevant
/// property list in order (unlike `EntityCreate`'s count-prefixed blob).
fn apply_player_create(
    controller: &mut BattleController,
    definitions: &Definitions,
    entity_id: EntityId,
    state: &[u8],
    is_base: bool,
) -> Result<(), ReplayError> {
    if controller.entity(entity_id).is_none() {
        let def = definitions.get_entity_def_by_name("Avatar")?;
        controller.create_entity(Entity::new(entity_id, Arc::new(def.clone())));
    }
    let entity = controller.entity_mut(entity_id).expect("just created or already present");

    let count = if is_base {
        entity.def().base_properties.len()
    } else {
        entity.def().client_properties_internal.len()
    };

    let mut cur = Cursor::new(state);
    for index in 0..count {
        if is_base {
            entity.set_base_property(index, &mut cur)?;
        } else {
            entity.set_client_property_internal(index, &mut cur)?;
        }
    }
    Ok(())
}

fn unknown_entity(kind: &str, entity_id: EntityId) -> ReplayError {
    ReplayError::Parse(format!("{} for unknown entity {}", kind, entity_id))
}

fn apply_entity_property(controller: &mut BattleController, entity_id: EntityId, message_id: u8, data: &[u8]) -> Result<(), ReplayError> {
    let mut cur = Cursor::new(data);
    let entity = controller.entity_mut(entity_id).ok_or_else(|| unknown_entity("EntityProperty", entity_id))?;
    let index = message_id as usize;
    let type_name = entity.type_name.clone();
    entity.set_client_property(index, &mut cur)?;
    if !cur.is_empty() {
        return Err(ReplayError::Packet(PacketError::TrailingPropertyBytes {
            entity_id: entity_id.0,
            type_name,
            index,
            remaining: cur.remaining(),
        }));
    }
    // `set_client_property` above already validated `index`, so this lookup can't miss.
    let property_name = entity.def().client_properties[index].name.clone();
    let value = entity.client_property(&property_name).cloned().expect("just set above");

    match controller.dispatch_property_change(entity_id, &type_name, &property_name, &value) {
        Ok(()) => Ok(()),
        Err(err) if ignorable_dispatch_failure(&err) => {
            debug!(type_name = %type_name, property = %property_name, "no subscriber for property change");
            Ok(())
        }
        Err(err) => Err(err),
    }
}

fn apply_entity_method(controller: &mut BattleController, entity_id: EntityId, message_id: u8, data: &[u8]) -> Result<(), ReplayError> {
    let mut cur = Cursor::new(data);
    let entity = controller.entity_mut(entity_id).ok_or_else(|| unknown_entity("EntityMethod", entity_id))?;
    let type_name = entity.type_name.clone();
    let index = message_id as usize;
    let (method, args) = entity.decode_method_call(index, &mut cur)?;
    if !cur.is_empty() {
        return Err(ReplayError::Packet(PacketError::TrailingPropertyBytes {
            entity_id: entity_id.0,
            type_name,
            index,
            remaining: cur.remaining(),
        }));
    }

    match controller.dispatch_method_call(entity_id, &type_name, &method, &args) {
        Ok(()) => Ok(()),
        Err(err) if ignorable_dispatch_failure(&err) => {
            debug!(type_name = %type_name, method = %method, "no subscriber for method call");
            Ok(())
        }
        Err(err) => Err(err),
    }
}

fn apply_nested_property(controller: &mut BattleController, entity_id: EntityId, data: &[u8]) -> Result<(), ReplayError> {
    let entity = controller.entity(entity_id).ok_or_else(|| unknown_entity("NestedProperty", entity_id))?;
    let type_name = entity.type_name.clone();
    let edit = entity.decode_nested_property(data)?;

    match controller.dispatch_nested_property_change(entity_id, &type_name, &edit.path, &edit.value) {
        Ok(()) => Ok(()),
        Err(err) if ignorable_dispatch_failure(&err) => {
            debug!(type_name = %type_name, path = %edit.path, "no subscriber for nested property change");
            Ok(())
        }
        Err(err) => Err(err),
    }
}

/// `PlayerPosition` carries two entity ids. Before death an avatar has no position of
/// its own and mirrors its vehicle's (`entity_id_2` set, the "master"); after death the
/// vehicle is gone and the avatar's own position in the packet is authoritative
/// (`entity_id_2` zero). Either entity may not exist yet (still outside the AoI),
/// which is silently a no-op rather than an error.
#[allow(clippy::too_many_arguments)]
fn apply_player_position(
    controller: &mut BattleController,
    entity_id_1: EntityId,
    entity_id_2: EntityId,
    x: f32,
    y: f32,
    z: f32,
    yaw: f32,
    pitch: f32,
    roll: f32,
) {
    if entity_id_2.raw() != 0 {
        let master = controller.entity(entity_id_2).map(|e| (e.position, e.yaw, e.pitch, e.roll));
        if let Some((position, m_yaw, m_pitch, m_roll)) = master {
            if let Some(slave) = controller.entity_mut(entity_id_1) {
                slave.position = position;
                slave.yaw = m_yaw;
                slave.pitch = m_pitch;
                slave.roll = m_roll;
            }
        }
    } else if entity_id_1.raw() != 0 {
        if let Some(entity) = controller.entity_mut(entity_id_1) {
            entity.position = (x, y, z);
            entity.yaw = yaw;
            entity.pitch = pitch;
            entity.roll = roll;
        }
    }
}
