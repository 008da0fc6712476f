//! Black-box scenario tests driving the full pipeline: container decode through
//! orchestrated dispatch into a finished [`wows_battle_replay::ReplayData`]. These hand-
//! build the container's Blowfish+zlib framing and the packet stream's frame headers
//! directly, mirroring `container.rs`'s own round-trip test helper, rather than shipping
//! a real captured `.wowsreplay` fixture.

use crypto::blowfish::Blowfish;
use crypto::symmetriccipher::BlockEncryptor;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use std::io::Write;

use wows_battle_replay::error::ReplayError;
use wows_battle_replay::orchestrator::{parse, ParseOptionsBuilder};
use wows_battle_replay::schema::JsonSchemaProvider;

const FILE_SIGNATURE: [u8; 4] = [0x12, 0x32, 0x34, 0x11];
const BLOWFISH_KEY: [u8; 16] = [
    0x29, 0xB7, 0xC9, 0x09, 0x38, 0x3F, 0x84, 0x88, 0xFA, 0x98, 0xEC, 0x4E, 0x13, 0x19, 0x79, 0xFB,
];
const BLOCK_SIZE: usize = 8;

fn build_container(packet_stream: &[u8], arena_info: &str) -> Vec<u8> {
    let mut compressed = Vec::new();
    {
        let mut encoder = ZlibEncoder::new(&mut compressed, Compression::default());
        encoder.write_all(packet_stream).unwrap();
    }

    let cipher = Blowfish::new(&BLOWFISH_KEY);
    let mut padded = compressed.clone();
    while padded.len() % BLOCK_SIZE != 0 {
        padded.push(0);
    }

    let mut encrypted = Vec::with_capacity(padded.len());
    let mut previous: Option<u64> = None;
    for chunk in padded.chunks(BLOCK_SIZE) {
        let mut plain = u64::from_le_bytes(chunk.try_into().unwrap());
        if let Some(prev) = previous {
            plain ^= prev;
        }
        previous = Some(plain);
        let mut block = [0u8; BLOCK_SIZE];
        cipher.encrypt_block(&plain.to_le_bytes(), &mut block);
        encrypted.extend_from_slice(&block);
    }

    let mut out = Vec::new();
    out.extend_from_slice(&FILE_SIGNATURE);
    out.extend_from_slice(&1i32.to_le_bytes()); // block count: arena info only, no extras
    out.extend_from_slice(&(arena_info.len() as i32).to_le_bytes());
    out.extend_from_slice(arena_info.as_bytes());
    out.extend_from_slice(&(packet_stream.len() as i32).to_le_bytes());
    out.extend_from_slice(&(compressed.len() as i32).to_le_bytes());
    out.extend_from_slice(&encrypted);
    out
}

fn frame(packet_type: u32, time: f32, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    out.extend_from_slice(&packet_type.to_le_bytes());
    out.extend_from_slice(&time.to_le_bytes());
    out.extend_from_slice(payload);
    out
}

/// `[PROTO 2, EMPTY_LIST, STOP]`: the smallest valid restricted-pickle payload, used
/// everywhere a method argument only needs to exist, not carry real data.
fn empty_list_pickle() -> Vec<u8> {
    vec![0x80, 0x02, b']', b'.']
}

fn pickle_blob(pickle_bytes: &[u8]) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(&(pickle_bytes.len() as u32).to_le_bytes());
    out.extend_from_slice(pickle_bytes);
    out
}

const AVATAR_ID: u32 = 100;
const ARENA_ID: u64 = 123_456_789;

fn base_player_create_frame(time: f32) -> Vec<u8> {
    let mut payload = Vec::new();
    payload.extend_from_slice(&AVATAR_ID.to_le_bytes());
    let mut state = Vec::new();
    state.extend_from_slice(&555i32.to_le_bytes()); // accountDBID
    state.push(1); // invitationsEnabled
    payload.extend_from_slice(&(state.len() as u32).to_le_bytes());
    payload.extend_from_slice(&state);
    frame(0x00, time, &payload)
}

/// `onArenaStateReceived` is method index 2 on `Avatar` in `assets/12.6.0/entities.xml`.
fn arena_state_received_frame(time: f32) -> Vec<u8> {
    let mut args = Vec::new();
    args.extend_from_slice(&ARENA_ID.to_le_bytes()); // arenaUniqueId
    args.extend_from_slice(&0i32.to_le_bytes()); // teamBuildTypeId
    let empty = empty_list_pickle();
    for _ in 0..5 {
        // preBattlesInfo, playersStates, botsStates, observersState, buildingsInfo
        args.extend_from_slice(&pickle_blob(&empty));
    }

    let mut payload = Vec::new();
    payload.extend_from_slice(&AVATAR_ID.to_le_bytes());
    payload.push(2); // message_id: onArenaStateReceived
    payload.extend_from_slice(&args);
    frame(0x08, time, &payload)
}

/// `BattleLogic` is entity type index 3; state sets `timeLeft` (index 1) and
/// `battleStage` (index 2) on its `<client>` property list.
fn battle_logic_create_frame(entity_id: u32, time: f32, time_left: i32, battle_stage: i32) -> Vec<u8> {
    let mut state = Vec::new();
    state.push(2); // values_count
    state.push(1); // timeLeft index
    state.extend_from_slice(&time_left.to_le_bytes());
    state.push(2); // battleStage index
    state.extend_from_slice(&battle_stage.to_le_bytes());

    let mut payload = Vec::new();
    payload.extend_from_slice(&entity_id.to_le_bytes());
    payload.extend_from_slice(&3u32.to_le_bytes()); // type_index: BattleLogic
    payload.extend_from_slice(&0.0f32.to_le_bytes());
    payload.extend_from_slice(&0.0f32.to_le_bytes());
    payload.extend_from_slice(&0.0f32.to_le_bytes());
    payload.extend_from_slice(&state);
    frame(0x05, time, &payload)
}

fn battle_results_frame(time: f32, arena_id: u64) -> Vec<u8> {
    let json = format!(
        r#"{{"arenaUniqueID":{},"accountDBID":555,"commonList":[7,1,2,1200]}}"#,
        arena_id
    );
    let mut payload = Vec::new();
    payload.extend_from_slice(&(json.len() as u32).to_le_bytes());
    payload.extend_from_slice(json.as_bytes());
    frame(0x22, time, &payload)
}

fn happy_path_stream() -> Vec<u8> {
    let mut stream = Vec::new();
    stream.extend(frame(0x16, 0.0, b"12,6,0"));
    stream.extend(frame(0x28, 0.0, b"spaces/42_Neighbors"));
    stream.extend(base_player_create_frame(0.0));
    stream.extend(arena_state_received_frame(1.0));
    stream.extend(battle_logic_create_frame(7, 2.0, 1200, 0));
    stream.extend(battle_results_frame(3.0, ARENA_ID));
    stream
}

#[test]
fn parses_full_replay_end_to_end() {
    let data = build_container(&happy_path_stream(), r#"{"clientVersionFromXml":"12,6,0"}"#);
    let schema = JsonSchemaProvider::default();
    let options = ParseOptionsBuilder::default().build().unwrap();

    let replay = parse(&data, &schema, &options).unwrap();

    assert_eq!(replay.data.version, "12.6.0");
    assert_eq!(replay.data.map, "42_Neighbors");
    assert_eq!(replay.data.arena_id, ARENA_ID);
    assert_eq!(replay.data.game_mode, "STANDARD");
    assert_eq!(replay.data.owner_avatar_id.raw(), AVATAR_ID);
    assert_eq!(replay.data.battle_logic.duration, 0);
    assert_eq!(
        replay.data.battle_logic.battle_result.is_none(),
        true,
        "no battleResult property was ever set on the BattleLogic entity"
    );
}

#[test]
fn missing_battle_results_is_incomplete_replay() {
    let mut stream = Vec::new();
    stream.extend(frame(0x16, 0.0, b"12,6,0"));
    stream.extend(frame(0x28, 0.0, b"spaces/42_Neighbors"));
    stream.extend(base_player_create_frame(0.0));

    let data = build_container(&stream, r#"{"clientVersionFromXml":"12,6,0"}"#);
    let schema = JsonSchemaProvider::default();
    let options = ParseOptionsBuilder::default().build().unwrap();

    let err = parse(&data, &schema, &options).unwrap_err();
    assert!(matches!(err, ReplayError::IncompleteReplay));
}

#[test]
fn mismatched_arena_id_in_battle_results_is_rejected() {
    let mut stream = Vec::new();
    stream.extend(frame(0x16, 0.0, b"12,6,0"));
    stream.extend(base_player_create_frame(0.0));
    stream.extend(arena_state_received_frame(1.0));
    stream.extend(battle_results_frame(2.0, ARENA_ID + 1));

    let data = build_container(&stream, r#"{"clientVersionFromXml":"12,6,0"}"#);
    let schema = JsonSchemaProvider::default();
    // Strict mode so the per-packet dispatch failure surfaces instead of being skipped.
    let options = ParseOptionsBuilder::default().strict(true).build().unwrap();

    let err = parse(&data, &schema, &options).unwrap_err();
    assert!(matches!(err, ReplayError::ArenaIdMismatch { .. }));
}

#[test]
fn unknown_client_version_fails_fast() {
    let data = build_container(b"", r#"{"clientVersionFromXml":"1,0,0"}"#);
    let schema = JsonSchemaProvider::default();
    let options = ParseOptionsBuilder::default().build().unwrap();

    let err = parse(&data, &schema, &options).unwrap_err();
    assert!(matches!(err, ReplayError::UnsupportedVersion(v) if v == "1.0.0"));
}

#[test]
fn non_strict_mode_skips_a_bad_entity_method_dispatch_and_still_finishes() {
    // A well-formed onArenaStateReceived call but on an entity that was never created
    // (no BasePlayerCreate) — the dispatch fails with an unknown-entity error. Non-strict
    // mode must skip it and continue to a valid BattleResults that doesn't depend on it.
    let mut stream = Vec::new();
    stream.extend(frame(0x16, 0.0, b"12,6,0"));
    stream.extend(arena_state_received_frame(0.5)); // entity 100 does not exist yet

    let data = build_container(&stream, r#"{"clientVersionFromXml":"12,6,0"}"#);
    let schema = JsonSchemaProvider::default();
    let options = ParseOptionsBuilder::default().build().unwrap();

    // Still incomplete (no BattleResults), but the point is it doesn't abort on the
    // dangling EntityMethod packet the way strict mode would.
    let err = parse(&data, &schema, &options).unwrap_err();
    assert!(matches!(err, ReplayError::IncompleteReplay));
}
