use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ViewPoolError {
    #[error("View pool is empty, refill it before sampling")]
    EmptyPool,
}

/// A working set of views drawn without replacement.
///
/// Views and their dataset indices are stored side by side and always move together.
#[derive(Debug, Clone)]
pub struct ViewSampler<V> {
    views: Vec<V>,
    indices: Vec<usize>,
    rng: StdRng,
}

impl<V: Clone> ViewSampler<V> {
    pub fn new(all_views: &[V], seed: u64) -> Self {
        let mut sampler = Self {
            views: vec![],
            indices: vec![],
            rng: StdRng::seed_from_u64(seed),
        };
        sampler.refill(all_views);
        sampler
    }

    /// Removes a uniformly chosen view from the pool, returning it with its index.
    pub fn pop_random(&mut self) -> Result<(V, usize), ViewPoolError> {
        if self.views.is_empty() {
            return Err(ViewPoolError::EmptyPool);
        }
        let slot = self.rng.random_range(0..self.views.len());
        let view = self.views.swap_remove(slot);
        let index = self.indices.swap_remove(slot);
        Ok((view, index))
    }

    /// Puts a popped view back at the end of the pool.
    pub fn requeue(&mut self, view: V, index: usize) {
        self.views.push(view);
        self.indices.push(index);
    }

    pub fn is_empty(&self) -> bool {
        self.views.is_empty()
    }

    pub fn len(&self) -> usize {
        debug_assert_eq!(
            self.views.len(),
            self.indices.len(),
            "Views and indices out of sync"
        );
        self.views.len()
    }

    /// Replaces the pool with every view in `all_views`.
    pub fn refill(&mut self, all_views: &[V]) {
        self.views = all_views.to_vec();
        self.indices = (0..all_views.len()).collect();
    }
}
