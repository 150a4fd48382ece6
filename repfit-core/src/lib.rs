//! Repfit Core Library
//!
//! Offline-first persistence and sync for repfit: the local SQLite store,
//! the durable mutation queue, temporary id mapping and the sync engine that
//! drains the queue against the remote API.

pub mod engine;
pub mod error;
pub mod id;
pub mod id_map;
pub mod models;
pub mod network;
pub mod queue;
pub mod remote;
pub mod store;

pub use engine::{DrainReport, EngineError, SyncEngine, SyncFailure, SyncSettings, SyncStatus};
pub use error::{RemoteError, StorageError};
pub use id::{is_temporary, new_temp_id, TEMP_ID_PREFIX};
pub use id_map::{IdMapper, IdMapping};
pub use models::{
    CustomMeal, CustomProduct, Entity, EntityKind, FoodEntry, MealType, Routine, RoutineExercise,
    Session, WorkoutSet,
};
pub use network::{
    ManualNetworkMonitor, NetworkMonitor, NetworkSnapshot, ProbeNetworkMonitor, Subscription,
};
pub use queue::{Batch, DeadLetter, Operation, OperationKind, OperationQueue, QueuedOperation};
pub use remote::{HttpRemoteClient, Method, RemoteClient};
pub use store::{EntityFilter, LocalStore, SqlParam, StoredEntity};

pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
