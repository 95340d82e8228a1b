//! Checkpoint storage trait
//!
//! This module defines the CheckpointStore trait for persisting the resume
//! token of a changes feed between runs.

use anyhow::Result;
use async_trait::async_trait;

/// Trait for checkpoint storage operations.
///
/// One store instance tracks exactly one checkpoint entry for its whole
/// lifetime. Methods report failure through their return value and keep a
/// description in [`CheckpointStore::last_error`].
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Id of the entry holding the sequence value.
    fn entry_id(&self) -> &str;

    /// Work needed at startup. Must be called once before any other operation.
    async fn initialize(&mut self) -> bool;

    /// Read the stored sequence value.
    ///
    /// Returns `None` if the operation failed, including when the entry does
    /// not exist: the caller asked for a stored value, so there is nothing
    /// to fall back to.
    async fn read(&mut self) -> Option<String>;

    /// Read the stored value, or create the entry seeded with `initial` and
    /// return `initial` when it does not exist yet.
    async fn read_or_create(&mut self, initial: &str) -> Option<String>;

    /// Set the stored value, creating the entry if needed.
    async fn update_or_create(&mut self, value: &str) -> bool;

    /// Description of the most recent failure; empty after a success.
    fn last_error(&self) -> &str;

    /// [`CheckpointStore::read`], turning a failure into an error.
    async fn read_required(&mut self) -> Result<String> {
        match self.read().await {
            Some(value) => Ok(value),
            None => Err(anyhow::anyhow!(
                "Cannot read sequence value from '{}': {}",
                self.entry_id(),
                self.last_error()
            )),
        }
    }

    /// [`CheckpointStore::read_or_create`], turning a failure into an error.
    async fn read_or_create_required(&mut self, initial: &str) -> Result<String> {
        match self.read_or_create(initial).await {
            Some(value) => Ok(value),
            None => Err(anyhow::anyhow!(
                "Cannot read or create sequence value in '{}': {}",
                self.entry_id(),
                self.last_error()
            )),
        }
    }
}
