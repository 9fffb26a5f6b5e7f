//! Error types for the game simulation.

use thiserror::Error;

/// Result type alias using [`GameError`].
pub type Result<T> = std::result::Result<T, GameError>;

/// Top-level error type for all game simulation errors.
#[derive(Debug, Error)]
pub enum GameError {
    /// Invalid flag reference.
    #[error("Flag not found: {0}")]
    FlagNotFound(u32),

    /// Invalid building reference.
    #[error("Building not found: {0}")]
    BuildingNotFound(u32),

    /// Invalid inventory reference.
    #[error("Inventory not found: {0}")]
    InventoryNotFound(u32),

    /// Invalid serf reference.
    #[error("Serf not found: {0}")]
    SerfNotFound(u32),

    /// Invalid player slot.
    #[error("Invalid player: {0}")]
    InvalidPlayer(u32),

    /// An entity pool has no free slots left.
    #[error("No free {kind} slots (limit {limit})")]
    PoolExhausted {
        /// Entity kind that ran out of slots.
        kind: String,
        /// Configured pool limit.
        limit: usize,
    },

    /// Save data could not be written.
    #[error("Failed to serialize game: {0}")]
    SaveFailed(String),

    /// Save data could not be read back.
    #[error("Failed to deserialize game: {0}")]
    LoadFailed(String),

    /// Invalid game state.
    #[error("Invalid game state: {0}")]
    InvalidState(String),
}
