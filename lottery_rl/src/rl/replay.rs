// src/rl/replay.rs
//
// Fixed-capacity experience replay (ring buffer, oldest overwritten).
//
// Sampling draws without replacement using the caller's RNG so learning
// stays reproducible for a given agent seed.

use rand::seq::index::sample;
use rand::Rng;
use serde::{Deserialize, Serialize};

use super::action_encoding::Action;
use super::observation::State;

/// One transition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Experience {
    pub state: State,
    pub action: Action,
    pub reward: f64,
    pub next_state: Option<State>,
    pub done: bool,
}

#[derive(Debug, Clone)]
pub struct ReplayBuffer {
    items: Vec<Experience>,
    capacity: usize,
    /// Next write position once full.
    index: usize,
}

impl ReplayBuffer {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            items: Vec::with_capacity(capacity.min(4096)),
            capacity,
            index: 0,
        }
    }

    pub fn push(&mut self, exp: Experience) {
        if self.items.len() < self.capacity {
            self.items.push(exp);
        } else {
            self.items[self.index] = exp;
        }
        self.index = (self.index + 1) % self.capacity;
    }

    /// Up to `batch_size` distinct experiences.
    pub fn sample<R: Rng + ?Sized>(&self, batch_size: usize, rng: &mut R) -> Vec<&Experience> {
        let n = batch_size.min(self.items.len());
        sample(rng, self.items.len(), n)
            .into_iter()
            .map(|i| &self.items[i])
            .collect()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    fn exp(reward: f64) -> Experience {
        Experience {
            state: State::neutral(),
            action: Action {
                field1: vec![1, 2],
                field2: vec![1],
            },
            reward,
            next_state: None,
            done: true,
        }
    }

    #[test]
    fn oldest_entries_are_overwritten() {
        let mut buf = ReplayBuffer::new(3);
        for r in 0..5 {
            buf.push(exp(r as f64));
        }
        assert_eq!(buf.len(), 3);
        let mut rewards: Vec<f64> = buf.items.iter().map(|e| e.reward).collect();
        rewards.sort_by(f64::total_cmp);
        assert_eq!(rewards, vec![2.0, 3.0, 4.0]);
    }

    #[test]
    fn sample_is_bounded_and_distinct() {
        let mut buf = ReplayBuffer::new(10);
        for r in 0..4 {
            buf.push(exp(r as f64));
        }
        let mut rng = ChaCha8Rng::seed_from_u64(9);
        let batch = buf.sample(8, &mut rng);
        assert_eq!(batch.len(), 4);
        let mut rewards: Vec<f64> = batch.iter().map(|e| e.reward).collect();
        rewards.sort_by(f64::total_cmp);
        rewards.dedup();
        assert_eq!(rewards.len(), 4);
    }
}
