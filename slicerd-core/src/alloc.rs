use std::collections::BTreeSet;

/// Dense low-water id pool.
///
/// The free set holds every explicitly released id plus one sentinel that
/// stands for "this id and everything above it". [`claim`](Self::claim)
/// always returns the smallest free id, so released ids are recycled before
/// the pool grows.
#[derive(Debug, Clone)]
pub struct IdAllocator {
    free: BTreeSet<u32>,
}

impl Default for IdAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl IdAllocator {
    pub fn new() -> Self {
        IdAllocator {
            free: BTreeSet::from([0]),
        }
    }

    /// Take the smallest free id.
    pub fn claim(&mut self) -> u32 {
        let id = *self.free.first().expect("free set is never empty");
        self.free.remove(&id);
        // The taken id was the sentinel; everything above it is still free.
        if self.free.is_empty() {
            self.free.insert(id + 1);
        }
        id
    }

    /// Return a previously claimed id to the pool.
    pub fn release(&mut self, id: u32) {
        let inserted = self.free.insert(id);
        assert!(inserted, "id {id} released twice");
    }
}
