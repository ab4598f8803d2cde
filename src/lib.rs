// questline - a gamification evaluation engine.
//
// **Architecture Overview:**
// - `core/`  = Business logic (storage-agnostic): expressions, progress,
//              goal/achievement evaluation, leaderboards, caches
// - `infra/` = Implementations of core traits (SQLite, in-memory)
//
// The surrounding HTTP/RPC layer, authentication and catalog administration
// live outside this crate; they talk to `core::engine::GamificationService`
// through plain async calls.

// These attrs point each module declaration at a more descriptive root file
// so we don't end up with half a dozen mod.rs files that all look the same.
#[path = "core/core_layer.rs"]
pub mod core;
#[path = "infra/infra_layer.rs"]
pub mod infra;

pub use crate::core::engine::{
    EngineError, EngineSettings, GamificationService, PermissionContext,
    PERM_GLOBAL_INCREASE_VALUE,
};
pub use crate::core::engine::store::{GameStore, StoreError};
pub use crate::infra::store::{InMemoryGameStore, SqliteGameStore};
