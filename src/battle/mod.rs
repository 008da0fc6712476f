//! C6: battle-state reconstruction. `events` holds the output value types, `state` holds
//! runtime-only accumulators the controller needs while reducing but that don't survive
//! into `ReplayData`, and `controller` is the stateful reducer itself.

pub mod controller;
pub mod events;
pub mod state;

pub use controller::BattleController;
pub use events::ReplayData;
