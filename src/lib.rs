//! Decoder and battle-state reconstruction engine for World of Warships `.wowsreplay`
//! files.
//!
//! The pipeline is a chain of independently testable components:
//!
//! - [`bitpack`] (C1/restricted-pickle support) — primitive byte-cursor reads and the
//!   tagged-opcode pickle interpreter used for nested structures.
//! - [`container`] (C2) — unwraps the outer `.wowsreplay` container: signature check,
//!   arena-info JSON, extras, Blowfish+zlib packet stream.
//! - [`schema`] (C3) — resolves a client version to its constant tables and entity
//!   definitions via the [`schema::SchemaProvider`] trait.
//! - [`packet`] (C4) — demultiplexes the inflated packet stream into typed
//!   [`packet::PacketPayload`] values.
//! - [`entity`] (C5) — the passive, schema-driven property-bag runtime each live game
//!   object is decoded into.
//! - [`battle`] (C6) — [`battle::BattleController`], the stateful reducer that turns a
//!   dispatched packet stream into [`battle::ReplayData`].
//! - [`orchestrator`] (C7) — wires the above into the public [`parse`] entry point.

pub mod battle;
pub mod bitpack;
pub mod container;
pub mod entity;
pub mod error;
pub mod orchestrator;
pub mod packet;
pub mod schema;
pub mod types;

pub use battle::{BattleController, ReplayData};
pub use error::{PacketError, ReplayError};
pub use orchestrator::{parse, ParseOptions, ParseOptionsBuilder, Replay};
pub use schema::{JsonSchemaProvider, SchemaProvider};
