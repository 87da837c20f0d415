//! Paged KV cache with prefix sharing and LRU reuse of freed blocks.
//!
//! Models the memory manager of a vLLM-style paged KV cache:
//! - fixed-size blocks handed out from a free list
//! - reference-counted sharing of full prefix blocks between requests
//! - freed blocks keep their prefix hash until the block is reused, so a
//!   later request (or the same one after preemption) can still hit them
//! - all-or-nothing allocation: a failed call leaves the cache untouched

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};

use crate::request::Request;

/// A single block in the KV cache.
#[derive(Debug, Clone)]
pub struct KvBlock {
    pub id: usize,
    /// Requests currently holding this block. Zero means it is on the free list.
    pub ref_count: u32,
    /// Prefix hash of the full block's contents, if it is indexed.
    pub hash: Option<u64>,
}

/// Blocks held by one request and how many token slots of them are filled.
#[derive(Debug, Clone, Default)]
struct Allocation {
    blocks: Vec<usize>,
    tokens: u32,
}

/// Statistics snapshot for reporting.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KvCacheStats {
    pub total_blocks: usize,
    pub used_blocks: usize,
    pub free_blocks: usize,
    pub utilization: f64,
    pub indexed_prefixes: usize,
    pub hits: u64,
    pub misses: u64,
    pub hit_rate: f64,
}

/// Block manager for one instance.
#[derive(Debug, Clone)]
pub struct KvBlockManager {
    block_size: u32,
    blocks: Vec<KvBlock>,
    /// LRU order of free blocks (front = reused first).
    free_list: VecDeque<usize>,
    /// Prefix hash -> block holding that prefix.
    hash_index: HashMap<u64, usize>,
    /// Request ID -> blocks allocated to that request.
    allocations: HashMap<u64, Allocation>,
    /// Prefix blocks reused on first admission.
    pub hits: u64,
    /// Full input blocks that had to be computed fresh on first admission.
    pub misses: u64,
}

impl KvBlockManager {
    /// Create a cache of `total_blocks` blocks of `block_size` tokens each.
    pub fn new(total_blocks: usize, block_size: u32) -> Self {
        Self {
            block_size: block_size.max(1),
            blocks: (0..total_blocks)
                .map(|id| KvBlock {
                    id,
                    ref_count: 0,
                    hash: None,
                })
                .collect(),
            free_list: (0..total_blocks).collect(),
            hash_index: HashMap::new(),
            allocations: HashMap::new(),
            hits: 0,
            misses: 0,
        }
    }

    pub fn block_size(&self) -> u32 {
        self.block_size
    }

    pub fn total_blocks(&self) -> usize {
        self.blocks.len()
    }

    pub fn free_blocks(&self) -> usize {
        self.free_list.len()
    }

    pub fn used_blocks(&self) -> usize {
        self.blocks.len() - self.free_list.len()
    }

    /// Fraction of blocks in use (0.0 - 1.0).
    pub fn used_ratio(&self) -> f64 {
        if self.blocks.is_empty() {
            return 0.0;
        }
        self.used_blocks() as f64 / self.blocks.len() as f64
    }

    /// Blocks needed to hold `tokens` tokens.
    pub fn blocks_for(&self, tokens: u32) -> usize {
        tokens.div_ceil(self.block_size) as usize
    }

    /// Whether `tokens` tokens could ever fit, with every block free.
    pub fn can_ever_hold(&self, tokens: u64) -> bool {
        tokens.div_ceil(u64::from(self.block_size)) <= self.blocks.len() as u64
    }

    /// Fraction of first-admission prefix blocks served from cache.
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            return 0.0;
        }
        self.hits as f64 / total as f64
    }

    /// Number of leading `hashes` whose blocks are cached. Pure query.
    pub fn cached_prefix_len(&self, hashes: &[u64]) -> usize {
        hashes
            .iter()
            .take_while(|h| self.hash_index.contains_key(h))
            .count()
    }

    /// Token slots currently held by `request_id`.
    pub fn allocated_tokens(&self, request_id: u64) -> u32 {
        self.allocations
            .get(&request_id)
            .map_or(0, |a| a.tokens)
    }

    /// Blocks currently held by `request_id`.
    pub fn blocks_of(&self, request_id: u64) -> &[usize] {
        self.allocations
            .get(&request_id)
            .map_or(&[], |a| a.blocks.as_slice())
    }

    pub fn block(&self, id: usize) -> Option<&KvBlock> {
        self.blocks.get(id)
    }

    /// Grow `request`'s allocation to cover token positions `[from, to)`.
    ///
    /// On a request's first allocation, the leading `shared_hashes` that are
    /// cached are pinned instead of computed; `from` is expected to start
    /// right after them. Returns `false` without changing anything when the
    /// free pool cannot cover the growth.
    pub fn allocate(
        &mut self,
        request: &Request,
        from: u32,
        to: u32,
        shared_hashes: &[u64],
    ) -> bool {
        let held = self.allocations.get(&request.id);
        let first_allocation = held.map_or(true, |a| a.blocks.is_empty());
        let held_blocks = held.map_or(0, |a| a.blocks.len());

        let shared: Vec<usize> = if first_allocation {
            shared_hashes
                .iter()
                .map_while(|h| self.hash_index.get(h).copied())
                .collect()
        } else {
            Vec::new()
        };
        let shared_tokens = shared.len() as u32 * self.block_size;
        let covered_tokens = held.map_or(0, |a| a.tokens).max(shared_tokens);
        let target = to.max(covered_tokens);
        debug_assert!(from <= target, "allocation range inverted: {}..{}", from, to);

        let blocks_after_shared = held_blocks + shared.len();
        let fresh = self.blocks_for(target).saturating_sub(blocks_after_shared);
        let revived = shared
            .iter()
            .filter(|&&b| self.blocks[b].ref_count == 0)
            .count();
        if fresh + revived > self.free_list.len() {
            return false;
        }

        if first_allocation {
            self.hits += shared.len() as u64;
            self.misses += (request.prefix_hashes.len().saturating_sub(shared.len())) as u64;
        }

        for &id in &shared {
            if self.blocks[id].ref_count == 0 {
                self.take_from_free_list(id);
            }
            self.blocks[id].ref_count += 1;
        }

        let mut fresh_ids = Vec::with_capacity(fresh);
        for _ in 0..fresh {
            if let Some(id) = self.pop_free_block() {
                self.blocks[id].ref_count = 1;
                fresh_ids.push(id);
            }
        }

        let alloc = self.allocations.entry(request.id).or_default();
        let full_before = (alloc.tokens / self.block_size) as usize;
        alloc.blocks.extend(shared);
        alloc.blocks.extend(fresh_ids);
        alloc.tokens = target;
        let full_after = (alloc.tokens / self.block_size) as usize;
        let newly_full: Vec<(usize, u64)> = (full_before..full_after)
            .filter_map(|i| {
                let hash = *request.prefix_hashes.get(i)?;
                Some((alloc.blocks[i], hash))
            })
            .collect();

        for (block_id, hash) in newly_full {
            if self.blocks[block_id].hash.is_none() && !self.hash_index.contains_key(&hash) {
                self.blocks[block_id].hash = Some(hash);
                self.hash_index.insert(hash, block_id);
            }
        }
        true
    }

    /// Return all of `request_id`'s blocks to the pool.
    ///
    /// Blocks are released last-first, so the tail of a request (the least
    /// shareable part) is reused before its prefix.
    pub fn release(&mut self, request_id: u64) {
        let Some(alloc) = self.allocations.remove(&request_id) else {
            return;
        };
        for &id in alloc.blocks.iter().rev() {
            let block = &mut self.blocks[id];
            block.ref_count = block.ref_count.saturating_sub(1);
            if block.ref_count == 0 {
                self.free_list.push_back(id);
            }
        }
    }

    pub fn stats(&self) -> KvCacheStats {
        KvCacheStats {
            total_blocks: self.total_blocks(),
            used_blocks: self.used_blocks(),
            free_blocks: self.free_blocks(),
            utilization: self.used_ratio(),
            indexed_prefixes: self.hash_index.len(),
            hits: self.hits,
            misses: self.misses,
            hit_rate: self.hit_rate(),
        }
    }

    /// Pop the least recently freed block, dropping its stale prefix entry.
    fn pop_free_block(&mut self) -> Option<usize> {
        let id = self.free_list.pop_front()?;
        if let Some(hash) = self.blocks[id].hash.take() {
            if self.hash_index.get(&hash) == Some(&id) {
                self.hash_index.remove(&hash);
            }
        }
        Some(id)
    }

    fn take_from_free_list(&mut self, id: usize) {
        if let Some(pos) = self.free_list.iter().position(|&b| b == id) {
            self.free_list.remove(pos);
        }
    }
}
