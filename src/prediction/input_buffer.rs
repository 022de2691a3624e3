use std::collections::VecDeque;

use tracing::debug;

use super::sequence::{is_more_recent, SequenceId};
use crate::net::protocol::InputCommand;

/// Default capacity, about 17 seconds of input at 60 Hz
pub const DEFAULT_INPUT_CAPACITY: usize = 1024;

/// Inputs awaiting acknowledgment, in generation order
///
/// Ids are strictly increasing (modulo wraparound) from front to back.
#[derive(Debug, Clone)]
pub struct InputBuffer {
    inputs: VecDeque<InputCommand>,
    capacity: usize,
}

impl InputBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            inputs: VecDeque::new(),
            capacity: capacity.max(1),
        }
    }

    /// Appends an input, evicting the oldest one when full.
    ///
    /// Returns the evicted input, if any.
    pub fn push(&mut self, input: InputCommand) -> Option<InputCommand> {
        debug_assert!(
            self.inputs
                .back()
                .map_or(true, |last| input.sequence_id.is_newer_than(last.sequence_id)),
            "input {} is not newer than the buffered ones",
            input.sequence_id
        );

        self.inputs.push_back(input);
        if self.inputs.len() > self.capacity {
            let evicted = self.inputs.pop_front();
            if let Some(old) = &evicted {
                debug!(id = %old.sequence_id, "Input buffer full, dropping oldest input");
            }
            return evicted;
        }
        None
    }

    /// Keeps only inputs in `(acknowledged, current]`. Returns how many were dropped.
    pub fn prune(&mut self, acknowledged: SequenceId, current: SequenceId) -> usize {
        let before = self.inputs.len();
        self.inputs
            .retain(|input| is_more_recent(input.sequence_id, acknowledged, current));
        before - self.inputs.len()
    }

    /// Buffered inputs in generation order
    pub fn iter(&self) -> impl Iterator<Item = &InputCommand> {
        self.inputs.iter()
    }

    pub fn ids(&self) -> Vec<SequenceId> {
        self.inputs.iter().map(|i| i.sequence_id).collect()
    }

    pub fn latest(&self) -> Option<&InputCommand> {
        self.inputs.back()
    }

    pub fn len(&self) -> usize {
        self.inputs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inputs.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn clear(&mut self) {
        self.inputs.clear();
    }
}

impl Default for InputBuffer {
    fn default() -> Self {
        Self::new(DEFAULT_INPUT_CAPACITY)
    }
}
