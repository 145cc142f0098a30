//! Cross-rank tile reduction.
//!
//! In multi-rank runs each rank renders a partial tile for a shared region;
//! the reducer merges the partials into one tile before the image-space
//! compositor sees it. Both policies are associative and commutative, so the
//! merged tile is independent of arrival order:
//!
//! - **Sum-composite**: ranks render disjoint sample subsets of the same
//!   pixels; output is the elementwise sum of sums with summed counts.
//!   Floating-point summation order is fixed by sorting parts by rank, so a
//!   given part set always reduces identically.
//! - **Z-composite**: ranks own disjoint geometric partitions; the rank with
//!   the nearest-to-camera depth wins each pixel, ties broken by the lowest
//!   rank id.

use std::sync::Mutex;

use log::debug;

use ember_fb::{Tile, TILE_PIXELS};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReductionPolicy {
    SumComposite,
    ZComposite,
}

/// Collects per-rank partial tiles until each region's contributing rank set
/// is complete, then reduces.
pub struct TileReducer {
    policy: ReductionPolicy,
    /// Ranks expected to contribute to each cell, fixed before reduction
    /// begins.
    ranks_for_cell: Vec<Vec<u32>>,
    pending: Vec<Mutex<Vec<Box<Tile>>>>,
}

impl TileReducer {
    pub fn new(policy: ReductionPolicy, ranks_for_cell: Vec<Vec<u32>>) -> Self {
        let pending = (0..ranks_for_cell.len()).map(|_| Mutex::new(Vec::new())).collect();
        Self {
            policy,
            ranks_for_cell,
            pending,
        }
    }

    /// Every rank contributes to every cell.
    pub fn uniform(policy: ReductionPolicy, num_cells: usize, num_ranks: u32) -> Self {
        let all: Vec<u32> = (0..num_ranks).collect();
        Self::new(policy, vec![all; num_cells])
    }

    pub fn policy(&self) -> ReductionPolicy {
        self.policy
    }

    /// Ranks a cell is still waiting on in the current round.
    pub fn missing_ranks(&self, cell: usize) -> Vec<u32> {
        let pending = self.pending[cell].lock().unwrap();
        self.ranks_for_cell[cell]
            .iter()
            .copied()
            .filter(|r| !pending.iter().any(|t| t.owner_rank == *r))
            .collect()
    }

    /// True if any cell has a partially gathered round outstanding.
    pub fn has_pending(&self) -> bool {
        self.pending.iter().any(|p| !p.lock().unwrap().is_empty())
    }

    /// Offer one rank's partial tile. Returns the reduced tile once the
    /// cell's full rank set for the current round is present, `None` while
    /// contributions are still outstanding.
    ///
    /// A rank may submit again before a round closes (progressive passes);
    /// extra tiles are held for the next round.
    pub fn submit_partial(&self, tile: Box<Tile>) -> Option<Box<Tile>> {
        let cell = tile.desc.cell;
        let expected = &self.ranks_for_cell[cell];
        if !expected.contains(&tile.owner_rank) {
            debug!(
                "rank {} is not a contributor for cell {cell}, dropping partial",
                tile.owner_rank
            );
            return None;
        }

        let mut pending = self.pending[cell].lock().unwrap();
        pending.push(tile);

        let complete = expected
            .iter()
            .all(|r| pending.iter().any(|t| t.owner_rank == *r));
        if !complete {
            return None;
        }

        let mut parts = Vec::with_capacity(expected.len());
        for r in expected {
            let idx = pending.iter().position(|t| t.owner_rank == *r).unwrap();
            parts.push(pending.remove(idx));
        }
        drop(pending);
        Some(self.reduce(parts))
    }

    fn reduce(&self, mut parts: Vec<Box<Tile>>) -> Box<Tile> {
        debug_assert!(!parts.is_empty());
        // Rank order fixes the fold order, making the result independent of
        // arrival order.
        parts.sort_by_key(|t| t.owner_rank);

        match self.policy {
            ReductionPolicy::SumComposite => sum_composite(parts),
            ReductionPolicy::ZComposite => z_composite(parts),
        }
    }
}

fn sum_composite(mut parts: Vec<Box<Tile>>) -> Box<Tile> {
    let mut out = parts.remove(0);
    for part in parts {
        debug_assert_eq!(part.epoch, out.epoch);
        for i in 0..TILE_PIXELS {
            out.color[i] += part.color[i];
            out.normal[i] += part.normal[i];
            out.albedo[i] += part.albedo[i];
            if part.depth[i] < out.depth[i] {
                out.depth[i] = part.depth[i];
            }
        }
        out.accum_id += part.accum_id;
    }
    out
}

// Z-composite requires every rank to contribute the same pass count per
// round: the winning pixel carries its own rank's color sum, so normalizing
// by anything but that rank's count would skew it. Geometric partitioning
// renders one pass per rank per round, which satisfies this by construction.
fn z_composite(mut parts: Vec<Box<Tile>>) -> Box<Tile> {
    // Parts arrive rank-ascending; strict less-than keeps the lowest rank on
    // depth ties.
    let mut out = parts.remove(0);
    for part in parts {
        debug_assert_eq!(part.epoch, out.epoch);
        debug_assert_eq!(
            part.accum_id, out.accum_id,
            "z-composite parts must carry equal pass counts"
        );
        for i in 0..TILE_PIXELS {
            if part.depth[i] < out.depth[i] {
                out.color[i] = part.color[i];
                out.normal[i] = part.normal[i];
                out.albedo[i] = part.albedo[i];
                out.depth[i] = part.depth[i];
            }
        }
        out.accum_id = out.accum_id.max(part.accum_id);
    }
    out
}
