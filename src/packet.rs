//! C4: the packet demultiplexer.
//!
//! Walks the inflated packet stream frame by frame (`size:u32, type:u32, time:f32,
//! payload`), looks the type tag up in a version-keyed mapping, and hands the decoded
//! record to the orchestrator for dispatch into C5/C6.

use kinded::Kinded;
use serde::Serialize;
use serde_json::Value as JsonValue;
use tracing::{debug, warn};

use crate::bitpack::Cursor;
use crate::error::{PacketError, ReplayError};
use crate::types::EntityId;

/// A single frame's header, as read directly off the wire.
#[derive(Debug, Clone, Copy)]
pub struct FrameHeader {
    pub size: u32,
    pub packet_type: u32,
    pub time: f32,
}

/// One fully decoded packet plus its timestamp, the unit the orchestrator dispatches.
#[derive(Debug, Clone)]
pub struct TimedPacket {
    pub time: f32,
    pub payload: PacketPayload,
}

/// Every packet tag this decoder understands (12.6.0 `PACKETS_MAPPING`). Packets noted as
/// "emitted but unparsed" in the upstream reverse-engineering notes are intentionally
/// absent from this enum; their tags fall through to `UnknownPacketType`.
#[derive(Debug, Clone, Kinded, Serialize)]
pub enum PacketPayload {
    BasePlayerCreate { entity_id: EntityId, state: Vec<u8> },
    CellPlayerCreate { entity_id: EntityId, state: Vec<u8> },
    EntityControl { entity_id: EntityId, is_controlled: bool },
    EntityEnter { entity_id: EntityId },
    EntityLeave { entity_id: EntityId },
    EntityCreate { entity_id: EntityId, type_index: u32, x: f32, y: f32, z: f32, state: Vec<u8> },
    EntityProperty { entity_id: EntityId, message_id: u8, data: Vec<u8> },
    EntityMethod { entity_id: EntityId, message_id: u8, data: Vec<u8> },
    Position { entity_id: EntityId, x: f32, y: f32, z: f32, yaw: f32, pitch: f32, roll: f32 },
    Version { version: String },
    NestedProperty { entity_id: EntityId, data: Vec<u8> },
    Camera { data: Vec<u8> },
    PlayerEntity { vehicle_id: EntityId },
    BattleResults { data: JsonValue },
    CameraMode { data: Vec<u8> },
    Map { name: String },
    PlayerPosition {
        entity_id_1: EntityId,
        entity_id_2: EntityId,
        x: f32,
        y: f32,
        z: f32,
        yaw: f32,
        pitch: f32,
        roll: f32,
    },
    CameraFreeLook { data: Vec<u8> },
    CruiseState { key: i32, value: i32 },
}

/// Version-keyed tag table. 12.6.0 inserted `BattleResults` at `0x22`, shifting
/// everything after it relative to older clients; callers must build the table for the
/// replay's own version rather than assume a single global mapping.
pub struct PacketsMapping {
    tags: Vec<(u32, fn(&[u8]) -> Result<PacketPayload, ReplayError>)>,
}

impl PacketsMapping {
    pub fn wows_12_6_0() -> Self {
        PacketsMapping {
            tags: vec![
                (0x00, decode_base_player_create),
                (0x01, decode_cell_player_create),
                (0x02, decode_entity_control),
                (0x03, decode_entity_enter),
                (0x04, decode_entity_leave),
                (0x05, decode_entity_create),
                (0x07, decode_entity_property),
                (0x08, decode_entity_method),
                (0x0A, decode_position),
                (0x16, decode_version),
                (0x20, decode_player_entity),
                (0x22, decode_battle_results),
                (0x23, decode_nested_property),
                (0x25, decode_camera),
                (0x27, decode_camera_mode),
                (0x28, decode_map),
                (0x2C, decode_player_position),
                (0x2F, decode_camera_free_look),
                (0x32, decode_cruise_state),
            ],
        }
    }

    pub fn decode(&self, packet_type: u32, payload: &[u8]) -> Option<Result<PacketPayload, ReplayError>> {
        self.tags
            .iter()
            .find(|(tag, _)| *tag == packet_type)
            .map(|(_, f)| f(payload))
    }
}

/// Reads one `(size, type, time, payload)` frame from `cur`, returning `None` once the
/// stream is exhausted.
pub fn read_frame<'a>(cur: &mut Cursor<'a>) -> Result<Option<(FrameHeader, &'a [u8])>, ReplayError> {
    if cur.is_empty() {
        return Ok(None);
    }
    let size = cur.read_u32()?;
    let packet_type = cur.read_u32()?;
    let time = cur.read_f32()?;
    let payload = cur.read_blob_of(size as usize)?;
    Ok(Some((FrameHeader { size, packet_type, time }, payload)))
}

/// Demultiplexes the full packet stream, calling `on_packet` for each successfully
/// decoded frame. Unknown tags are logged and skipped (never an error). A decode failure
/// is propagated in strict mode; otherwise logged with a hex dump and skipped.
pub fn demux(
    stream: &[u8],
    mapping: &PacketsMapping,
    strict: bool,
    mut on_packet: impl FnMut(TimedPacket),
) -> Result<(), ReplayError> {
    let mut cur = Cursor::new(stream);
    while let Some((header, payload)) = read_frame(&mut cur)? {
        match mapping.decode(header.packet_type, payload) {
            None => {
                debug!(packet_type = format!("0x{:x}", header.packet_type), "unknown packet type, skipping");
            }
            Some(Ok(decoded)) => {
                on_packet(TimedPacket { time: header.time, payload: decoded });
            }
            Some(Err(err)) => {
                if strict {
                    return Err(err);
                }
                warn!(
                    time = header.time,
                    packet_type = format!("0x{:x}", header.packet_type),
                    dump = %hexdump_string(payload),
                    error = %err,
                    "failed to decode packet, skipping"
                );
            }
        }
    }
    Ok(())
}

fn hexdump_string(data: &[u8]) -> String {
    let mut out = Vec::new();
    hexdump::hexdump_iter(data).for_each(|line| out.push(line.to_string()));
    out.join("\n")
}

fn truncated(packet_type: u32, needed: usize) -> ReplayError {
    ReplayError::Packet(PacketError::TruncatedPayload { packet_type, needed })
}

/// Fixed-shape decoders must consume their whole payload; any leftover bytes mean the
/// frame carries fields this decoder doesn't know about, which is an error rather than
/// silently ignored (mirrors `entity::apply_entity_create_state`'s trailing-bytes check).
fn check_exhausted(cur: &Cursor, packet_type: u32) -> Result<(), ReplayError> {
    if cur.is_empty() {
        Ok(())
    } else {
        Err(ReplayError::Packet(PacketError::TrailingBytes { packet_type, remaining: cur.remaining() }))
    }
}

fn decode_base_player_create(payload: &[u8]) -> Result<PacketPayload, ReplayError> {
    let mut cur = Cursor::new(payload);
    let entity_id = EntityId(cur.read_u32().map_err(|_| truncated(0x00, 4))?);
    let len = cur.read_u32().map_err(|_| truncated(0x00, 4))? as usize;
    let state = cur.take_vec(len)?;
    Ok(PacketPayload::BasePlayerCreate { entity_id, state })
}

fn decode_cell_player_create(payload: &[u8]) -> Result<PacketPayload, ReplayError> {
    let mut cur = Cursor::new(payload);
    let entity_id = EntityId(cur.read_u32()?);
    let state = cur.take_vec(cur.remaining())?;
    Ok(PacketPayload::CellPlayerCreate { entity_id, state })
}

fn decode_entity_control(payload: &[u8]) -> Result<PacketPayload, ReplayError> {
    let mut cur = Cursor::new(payload);
    let entity_id = EntityId(cur.read_u32()?);
    let is_controlled = cur.read_u8()? != 0;
    check_exhausted(&cur, 0x02)?;
    Ok(PacketPayload::EntityControl { entity_id, is_controlled })
}

fn decode_entity_enter(payload: &[u8]) -> Result<PacketPayload, ReplayError> {
    let mut cur = Cursor::new(payload);
    let entity_id = EntityId(cur.read_u32()?);
    check_exhausted(&cur, 0x03)?;
    Ok(PacketPayload::EntityEnter { entity_id })
}

fn decode_entity_leave(payload: &[u8]) -> Result<PacketPayload, ReplayError> {
    let mut cur = Cursor::new(payload);
    let entity_id = EntityId(cur.read_u32()?);
    check_exhausted(&cur, 0x04)?;
    Ok(PacketPayload::EntityLeave { entity_id })
}

fn decode_entity_create(payload: &[u8]) -> Result<PacketPayload, ReplayError> {
    let mut cur = Cursor::new(payload);
    let entity_id = EntityId(cur.read_u32()?);
    let type_index = cur.read_u32()?;
    let x = cur.read_f32()?;
    let y = cur.read_f32()?;
    let z = cur.read_f32()?;
    let state = cur.take_vec(cur.remaining())?;
    Ok(PacketPayload::EntityCreate { entity_id, type_index, x, y, z, state })
}

fn decode_entity_property(payload: &[u8]) -> Result<PacketPayload, ReplayError> {
    let mut cur = Cursor::new(payload);
    let entity_id = EntityId(cur.read_u32()?);
    let message_id = cur.read_u8()?;
    let data = cur.take_vec(cur.remaining())?;
    Ok(PacketPayload::EntityProperty { entity_id, message_id, data })
}

fn decode_entity_method(payload: &[u8]) -> Result<PacketPayload, ReplayError> {
    let mut cur = Cursor::new(payload);
    let entity_id = EntityId(cur.read_u32()?);
    let message_id = cur.read_u8()?;
    let data = cur.take_vec(cur.remaining())?;
    Ok(PacketPayload::EntityMethod { entity_id, message_id, data })
}

fn decode_position(payload: &[u8]) -> Result<PacketPayload, ReplayError> {
    let mut cur = Cursor::new(payload);
    let entity_id = EntityId(cur.read_u32()?);
    let x = cur.read_f32()?;
    let y = cur.read_f32()?;
    let z = cur.read_f32()?;
    let yaw = cur.read_f32()?;
    let pitch = cur.read_f32()?;
    let roll = cur.read_f32()?;
    check_exhausted(&cur, 0x0A)?;
    Ok(PacketPayload::Position { entity_id, x, y, z, yaw, pitch, roll })
}

fn decode_version(payload: &[u8]) -> Result<PacketPayload, ReplayError> {
    Ok(PacketPayload::Version { version: String::from_utf8_lossy(payload).into_owned() })
}

fn decode_player_entity(payload: &[u8]) -> Result<PacketPayload, ReplayError> {
    let mut cur = Cursor::new(payload);
    let vehicle_id = EntityId(cur.read_u32()?);
    check_exhausted(&cur, 0x20)?;
    Ok(PacketPayload::PlayerEntity { vehicle_id })
}

fn decode_battle_results(payload: &[u8]) -> Result<PacketPayload, ReplayError> {
    let mut cur = Cursor::new(payload);
    let len = cur.read_u32()? as usize;
    let json_bytes = cur.take_vec(len)?;
    let data: JsonValue = serde_json::from_slice(&json_bytes)?;
    check_exhausted(&cur, 0x22)?;
    Ok(PacketPayload::BattleResults { data })
}

fn decode_nested_property(payload: &[u8]) -> Result<PacketPayload, ReplayError> {
    let mut cur = Cursor::new(payload);
    let entity_id = EntityId(cur.read_u32()?);
    let data = cur.take_vec(cur.remaining())?;
    Ok(PacketPayload::NestedProperty { entity_id, data })
}

fn decode_camera(payload: &[u8]) -> Result<PacketPayload, ReplayError> {
    Ok(PacketPayload::Camera { data: payload.to_vec() })
}

fn decode_camera_mode(payload: &[u8]) -> Result<PacketPayload, ReplayError> {
    Ok(PacketPayload::CameraMode { data: payload.to_vec() })
}

fn decode_map(payload: &[u8]) -> Result<PacketPayload, ReplayError> {
    Ok(PacketPayload::Map { name: String::from_utf8_lossy(payload).into_owned() })
}

fn decode_player_position(payload: &[u8]) -> Result<PacketPayload, ReplayError> {
    let mut cur = Cursor::new(payload);
    let entity_id_1 = EntityId(cur.read_u32()?);
    let entity_id_2 = EntityId(cur.read_u32()?);
    let x = cur.read_f32()?;
    let y = cur.read_f32()?;
    let z = cur.read_f32()?;
    let yaw = cur.read_f32()?;
    let pitch = cur.read_f32()?;
    let roll = cur.read_f32()?;
    check_exhausted(&cur, 0x2C)?;
    Ok(PacketPayload::PlayerPosition { entity_id_1, entity_id_2, x, y, z, yaw, pitch, roll })
}

fn decode_camera_free_look(payload: &[u8]) -> Result<PacketPayload, ReplayError> {
    Ok(PacketPayload::CameraFreeLook { data: payload.to_vec() })
}

fn decode_cruise_state(payload: &[u8]) -> Result<PacketPayload, ReplayError> {
    let mut cur = Cursor::new(payload);
    let key = cur.read_i32()?;
    let value = cur.read_i32()?;
    check_exhausted(&cur, 0x32)?;
    Ok(PacketPayload::CruiseState { key, value })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(packet_type: u32, time: f32, payload: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        out.extend_from_slice(&packet_type.to_le_bytes());
        out.extend_from_slice(&time.to_le_bytes());
        out.extend_from_slice(payload);
        out
    }

    #[test]
    fn demuxes_version_and_map_frames() {
        let mut stream = Vec::new();
        stream.extend(frame(0x16, 0.0, b"12,6,0"));
        stream.extend(frame(0x28, 0.0, b"spaces/42_Neighbors"));

        let mapping = PacketsMapping::wows_12_6_0();
        let mut seen = Vec::new();
        demux(&stream, &mapping, true, |p| seen.push(p)).unwrap();

        assert_eq!(seen.len(), 2);
        match &seen[0].payload {
            PacketPayload::Version { version } => assert_eq!(version, "12,6,0"),
            other => panic!("unexpected payload {:?}", other),
        }
    }

    #[test]
    fn unknown_packet_type_is_skipped_not_erred() {
        let stream = frame(0xDEAD, 1.0, b"whatever");
        let mapping = PacketsMapping::wows_12_6_0();
        let mut seen = 0;
        demux(&stream, &mapping, true, |_| seen += 1).unwrap();
        assert_eq!(seen, 0);
    }

    #[test]
    fn non_strict_skips_decode_failures() {
        // BattleResults with a length prefix larger than the remaining bytes.
        let mut payload = Vec::new();
        payload.extend_from_slice(&100u32.to_le_bytes());
        let stream = frame(0x22, 0.0, &payload);
        let mapping = PacketsMapping::wows_12_6_0();
        let mut seen = 0;
        demux(&stream, &mapping, false, |_| seen += 1).unwrap();
        assert_eq!(seen, 0);
    }
}
