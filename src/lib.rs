pub mod config;    // Typed configuration from the environment
pub mod engine;    // Simulation driver: tick loop and command arbitration
pub mod hub;       // Broadcast hub fanning snapshots out to sessions
pub mod life;      // Sparse colored life engine on a torus
pub mod protocol;  // Binary wire codec
pub mod server;    // HTTP + websocket surface
pub mod storage;   // Seed persistence

// Re-export the types a consumer of the crate wires together.
pub mod prelude {
    pub use crate::config::{Config, ConfigError};
    pub use crate::engine::{Engine, EngineError};
    pub use crate::hub::Hub;
    pub use crate::protocol::{Cell, ClientMessage, Command, ProtocolError, Snapshot};
    pub use crate::server::{router, AppState};
    pub use crate::storage::{FileSeedStore, SeedStore, StorageError};
}
