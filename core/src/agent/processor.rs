//! Block processor
//!
//! Holds the latest parse of the streaming turn and the cursor of the next
//! block to execute. Execution is single-flight: one block at a time, and a
//! parse that lands while a block runs is recorded instead of queued.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use super::parser::{self, Block};

/// Sequences parsed blocks for execution
#[derive(Debug, Default)]
pub struct BlockProcessor {
    blocks: Vec<Block>,
    previous_len: usize,
    current_index: usize,
    locked: Arc<AtomicBool>,
    pending_update: bool,
    /// Block index -> id of the message rendered for it
    message_ids: Vec<Option<String>>,
}

/// Held while one block executes; releases the lock when dropped
#[derive(Debug)]
pub struct ExecutionLock {
    locked: Arc<AtomicBool>,
}

impl Drop for ExecutionLock {
    fn drop(&mut self) {
        self.locked.store(false, Ordering::SeqCst);
    }
}

impl BlockProcessor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Forget everything from the previous turn
    pub fn reset(&mut self) {
        self.blocks.clear();
        self.previous_len = 0;
        self.current_index = 0;
        self.pending_update = false;
        self.message_ids.clear();
    }

    /// Re-parse the accumulated stream text
    pub fn set_blocks(&mut self, text: &str) {
        self.previous_len = self.blocks.len();
        self.blocks = parser::parse(text);
        self.message_ids.resize(self.blocks.len(), None);
    }

    /// True iff the last parse produced more blocks than the one before it
    pub fn has_new_block(&self) -> bool {
        self.blocks.len() > self.previous_len
    }

    pub fn blocks(&self) -> &[Block] {
        &self.blocks
    }

    pub fn current_index(&self) -> usize {
        self.current_index
    }

    pub fn current_block(&self) -> Option<&Block> {
        self.blocks.get(self.current_index)
    }

    /// Returns true, and remembers the update, if a block is executing
    pub fn check_lock(&mut self) -> bool {
        if self.is_locked() {
            self.pending_update = true;
            return true;
        }
        false
    }

    pub fn is_locked(&self) -> bool {
        self.locked.load(Ordering::SeqCst)
    }

    /// Acquire the execution lock; `None` when a block is already running
    pub fn lock(&self) -> Option<ExecutionLock> {
        self.locked
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .ok()
            .map(|_| ExecutionLock {
                locked: self.locked.clone(),
            })
    }

    pub fn advance(&mut self) {
        self.current_index += 1;
    }

    pub fn remaining(&self) -> usize {
        self.blocks.len().saturating_sub(self.current_index)
    }

    pub fn is_last(&self) -> bool {
        self.current_index + 1 == self.blocks.len()
    }

    pub fn over_limit(&self) -> bool {
        self.current_index >= self.blocks.len()
    }

    /// Loop condition after a block ran and the cursor advanced.
    ///
    /// Consumes the pending-update flag.
    pub fn should_continue(&mut self, block_finished: bool) -> bool {
        let pending = std::mem::take(&mut self.pending_update);
        pending || (block_finished && !self.over_limit())
    }

    /// End of turn: nothing can grow anymore
    pub fn finalize_partials(&mut self) {
        for block in &mut self.blocks {
            block.set_partial(false);
        }
    }

    pub fn message_id(&self, index: usize) -> Option<&str> {
        self.message_ids.get(index).and_then(|id| id.as_deref())
    }

    pub fn set_message_id(&mut self, index: usize, id: impl Into<String>) {
        if let Some(slot) = self.message_ids.get_mut(index) {
            *slot = Some(id.into());
        }
    }
}
