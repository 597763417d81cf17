//! XOR stage schedule
//!
//! In stage `s` rank `r` pairs with `r ^ s`. Because XOR is an involution the
//! pairing is symmetric: if `r` pairs with `p` in stage `s`, then `p` pairs
//! with `r` in the same stage. Stage 0 pairs every rank with itself and is
//! always skipped, as is any stage whose partner falls outside the world.

/// Smallest power of two that is `>= n` (1 for `n == 0`)
pub fn ceil_pow2(n: usize) -> usize {
    n.max(1).next_power_of_two()
}

/// Partner of `my_rank` in `stage`, or `None` when the stage is skipped
pub fn partner(my_rank: usize, num_ranks: usize, stage: usize) -> Option<usize> {
    let candidate = my_rank ^ stage;
    (candidate < num_ranks && candidate != my_rank).then_some(candidate)
}

/// One step of the schedule in execution order
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StageStep {
    pub cycle: usize,
    pub stage: usize,
    pub partner: Option<usize>,
}

/// Per-rank view of the pairing schedule
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageScheduler {
    my_rank: usize,
    num_ranks: usize,
    num_stages: usize,
    num_cycles: usize,
}

impl StageScheduler {
    pub fn new(my_rank: usize, num_ranks: usize, num_stages: usize, num_cycles: usize) -> Self {
        Self {
            my_rank,
            num_ranks,
            num_stages,
            num_cycles,
        }
    }

    pub fn my_rank(&self) -> usize {
        self.my_rank
    }

    pub fn num_stages(&self) -> usize {
        self.num_stages
    }

    pub fn num_cycles(&self) -> usize {
        self.num_cycles
    }

    /// Partner for `stage`, `None` if this rank sits the stage out
    pub fn partner(&self, stage: usize) -> Option<usize> {
        partner(self.my_rank, self.num_ranks, stage)
    }

    /// Every (cycle, stage) step, cycles outermost
    pub fn pairings(&self) -> impl Iterator<Item = StageStep> + '_ {
        (0..self.num_cycles).flat_map(move |cycle| {
            (0..self.num_stages).map(move |stage| StageStep {
                cycle,
                stage,
                partner: self.partner(stage),
            })
        })
    }

    /// Number of stages within one cycle that have a partner
    pub fn valid_pairings_per_cycle(&self) -> usize {
        (0..self.num_stages).filter(|&stage| self.partner(stage).is_some()).count()
    }
}
