use crate::core::types::RegisteredInput;
use crate::error::{CoordinatorError, CoordinatorResult};
use bitcoin::OutPoint;
use rand::seq::IteratorRandom;
use std::collections::HashMap;

/// A set of registered inputs waiting for a round, drawn at random.
///
/// Each pool owns two of these (must-mix and liquidity), and every round uses
/// one more for its invited-but-unconfirmed inputs.
///
/// Entries live in a `Vec` so a random draw is an index pick plus a
/// `swap_remove`; `by_outpoint` maps outpoint keys to their slot for O(1)
/// duplicate detection.
///
/// # Examples
/// ```
/// use whirlpool_server::queue::InputQueue;
/// let queue = InputQueue::new();
/// assert_eq!(queue.len(), 0);
/// assert!(!queue.has_inputs());
/// ```
#[derive(Debug, Default)]
pub struct InputQueue {
    inputs: Vec<RegisteredInput>,
    by_outpoint: HashMap<String, usize>,
}

impl InputQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an input. A second input spending the same outpoint is rejected.
    pub fn register(&mut self, input: RegisteredInput) -> CoordinatorResult<()> {
        let key = input.outpoint.key();
        if self.by_outpoint.contains_key(&key) {
            return Err(CoordinatorError::already_registered("Input already registered"));
        }
        self.by_outpoint.insert(key, self.inputs.len());
        self.inputs.push(input);
        Ok(())
    }

    pub fn has_input(&self, outpoint: &OutPoint) -> bool {
        self.by_outpoint.contains_key(&crate::core::types::outpoint_key(outpoint))
    }

    pub fn find_by_username(&self, username: &str) -> Option<&RegisteredInput> {
        self.inputs.iter().find(|i| i.username == username)
    }

    pub fn remove_by_username(&mut self, username: &str) -> Option<RegisteredInput> {
        let index = self.inputs.iter().position(|i| i.username == username)?;
        Some(self.remove_at(index))
    }

    /// Draw one input uniformly among those accepted by `eligible`.
    ///
    /// Reservoir sampling over the eligible subset: a single pass, no shuffle
    /// of the whole queue.
    pub fn remove_random<F>(&mut self, mut eligible: F) -> Option<RegisteredInput>
    where
        F: FnMut(&RegisteredInput) -> bool,
    {
        let index = self
            .inputs
            .iter()
            .enumerate()
            .filter(|&(_, input)| eligible(input))
            .map(|(index, _)| index)
            .choose(&mut rand::thread_rng())?;
        Some(self.remove_at(index))
    }

    /// Empty the queue, handing back everything it held.
    pub fn clear(&mut self) -> Vec<RegisteredInput> {
        self.by_outpoint.clear();
        std::mem::take(&mut self.inputs)
    }

    /// Forget anti-Sybil hashes; they are only meaningful within one round.
    pub fn reset_last_user_hash(&mut self) {
        for input in &mut self.inputs {
            input.last_user_hash = None;
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &RegisteredInput> {
        self.inputs.iter()
    }

    pub fn len(&self) -> usize {
        self.inputs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inputs.is_empty()
    }

    pub fn has_inputs(&self) -> bool {
        !self.inputs.is_empty()
    }

    pub fn len_tor(&self) -> usize {
        self.inputs.iter().filter(|i| i.is_tor()).count()
    }

    pub fn len_clearnet(&self) -> usize {
        self.len() - self.len_tor()
    }

    fn remove_at(&mut self, index: usize) -> RegisteredInput {
        let removed = self.inputs.swap_remove(index);
        self.by_outpoint.remove(&removed.outpoint.key());
        // The former last element now sits at `index`.
        if let Some(moved) = self.inputs.get(index) {
            self.by_outpoint.insert(moved.outpoint.key(), index);
        }
        removed
    }
}
