//! The manager's index from properties to composition chains.
//!
//! Layout invariant: chains for immediate properties occupy a contiguous
//! prefix (order inside the prefix is insignificant); ordinary chains occupy
//! the suffix, sorted ascending by the property's stable hash. The prefix is
//! what lets the frame loop resolve every weight-controlling chain before
//! any ordinary chain looks at a weight; the sorted suffix makes per-
//! property lookup a binary search plus a short neighbor scan on hash ties.

use tracing::error;

use crate::chain::ErasedChain;
use crate::property::ErasedHandle;

#[derive(Default)]
pub(crate) struct ChainCollection {
    chains: Vec<Box<dyn ErasedChain>>,
    /// Property hashes, in lock step with `chains`.
    hashes: Vec<u64>,
    /// Length of the immediate prefix.
    immediates: usize,
}

impl ChainCollection {
    pub(crate) fn len(&self) -> usize {
        self.chains.len()
    }

    pub(crate) fn immediate_count(&self) -> usize {
        self.immediates
    }

    /// Finds the chain for a property, or the suffix index at which an
    /// ordinary chain for it should be inserted.
    pub(crate) fn find(&self, identity: ErasedHandle, hash: u64) -> Result<usize, usize> {
        for (i, chain) in self.chains[..self.immediates].iter().enumerate() {
            if chain.identity() == identity {
                return Ok(i);
            }
        }
        let suffix = &self.hashes[self.immediates..];
        let mut pos = self.immediates + suffix.partition_point(|h| *h < hash);
        while pos < self.chains.len() && self.hashes[pos] == hash {
            if self.chains[pos].identity() == identity {
                return Ok(pos);
            }
            pos += 1;
        }
        Err(pos)
    }

    /// Inserts a chain at the index [`find`](Self::find) produced.
    /// Immediate chains ignore the hint and join the prefix instead.
    pub(crate) fn insert(&mut self, index: usize, chain: Box<dyn ErasedChain>) -> usize {
        let hash = chain.property_hash();
        if chain.is_immediate() {
            self.chains.insert(0, chain);
            self.hashes.insert(0, hash);
            self.immediates += 1;
            0
        } else {
            debug_assert!(index >= self.immediates);
            self.chains.insert(index, chain);
            self.hashes.insert(index, hash);
            index
        }
    }

    pub(crate) fn remove_at(&mut self, index: usize) -> Box<dyn ErasedChain> {
        self.hashes.remove(index);
        if index < self.immediates {
            self.immediates -= 1;
        }
        self.chains.remove(index)
    }

    pub(crate) fn get(&self, index: usize) -> &dyn ErasedChain {
        self.chains[index].as_ref()
    }

    pub(crate) fn get_mut(&mut self, index: usize) -> &mut Box<dyn ErasedChain> {
        &mut self.chains[index]
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = &Box<dyn ErasedChain>> {
        self.chains.iter()
    }

    pub(crate) fn iter_mut(&mut self) -> impl Iterator<Item = &mut Box<dyn ErasedChain>> {
        self.chains.iter_mut()
    }

    /// The immediate prefix and ordinary suffix as disjoint mutable slices,
    /// for the two parallel phases of the chain update.
    pub(crate) fn split_mut(
        &mut self,
    ) -> (&mut [Box<dyn ErasedChain>], &mut [Box<dyn ErasedChain>]) {
        let immediates = self.immediate_count();
        self.chains.split_at_mut(immediates)
    }

    /// Integrity check: fatal in debug builds, logged in release.
    pub(crate) fn validate(&self) {
        let mut ok = self.immediates <= self.chains.len() && self.hashes.len() == self.chains.len();
        if ok {
            for (i, chain) in self.chains.iter().enumerate() {
                ok &= chain.property_hash() == self.hashes[i];
                ok &= chain.is_immediate() == (i < self.immediates);
            }
            ok &= self.hashes[self.immediates..].is_sorted();
        }
        if !ok {
            debug_assert!(ok, "chain collection integrity violated");
            error!("chain collection integrity violated; continuing");
        }
    }
}
