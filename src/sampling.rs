//! Adaptive Monte Carlo estimation of empirical p-values.
//!
//! For each element a [`SamplingPlan`] fixes the background pools and the
//! observed statistic. Replicates are drawn in partitions, each a pure function
//! of `(plan, size, seed)` returning a [`PartialCounts`], so partitions can run
//! on any worker in any order and be merged afterwards. A [`SamplingState`]
//! accumulates the partial counts and decides between rounds whether to
//! escalate the sampling size.

use std::collections::BTreeMap;
use std::time::Instant;

use anyhow::{bail, Result};
use log::warn;
use rand::distributions::{Distribution, WeightedIndex};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};

use crate::config::StatisticConfig;
use crate::observed::ObservedStatistics;
use crate::scores::ScoreIndex;
use crate::signature::SignatureTable;
use crate::site_weights::SiteWeights;
use crate::statistic::Statistic;

// ============================================================================
// Schedule
// ============================================================================

/// Split `total` into chunks of `chunk` plus the remainder.
pub fn partitions_list(total: u64, chunk: u64) -> Vec<u64> {
    if total == 0 {
        return Vec::new();
    }
    let chunk = chunk.max(1);
    let mut parts = vec![chunk; (total / chunk) as usize];
    if total % chunk != 0 {
        parts.push(total % chunk);
    }
    parts
}

/// Replicates per partition so that each carries about `chunk_cells`
/// replicate x mutation cells.
pub fn chunk_size(pending: u64, muts: u64, chunk_cells: u64) -> u64 {
    let chunk_count = pending.saturating_mul(muts) / chunk_cells.max(1);
    if chunk_count == 0 {
        pending
    } else {
        (pending / chunk_count).max(1)
    }
}

pub fn schedule(pending: u64, muts: u64, chunk_cells: u64) -> Vec<u64> {
    partitions_list(pending, chunk_size(pending, muts, chunk_cells))
}

#[derive(Debug, Clone, Copy)]
pub struct SamplingParams {
    pub initial: u64,
    pub max: u64,
    pub min_obs: u64,
    pub growth: u64,
    pub chunk_cells: u64,
}

impl From<&StatisticConfig> for SamplingParams {
    fn from(cfg: &StatisticConfig) -> Self {
        Self {
            initial: cfg.sampling,
            max: cfg.sampling_max,
            min_obs: cfg.sampling_min_obs,
            growth: cfg.sampling_growth,
            chunk_cells: cfg.sampling_chunk,
        }
    }
}

// ============================================================================
// Background pools
// ============================================================================

/// Candidate scores with their (unnormalized) selection weights.
#[derive(Debug, Clone)]
pub struct BackgroundPool {
    values: Vec<f64>,
    dist: Option<WeightedIndex<f64>>,
}

impl BackgroundPool {
    /// Weighted pool; falls back to uniform when every weight is zero.
    pub fn new(values: Vec<f64>, weights: Option<Vec<f64>>, label: &str) -> Result<Self> {
        if values.is_empty() {
            bail!("{}: empty background", label);
        }
        let dist = match weights {
            Some(w) if w.iter().any(|x| *x > 0.0) => Some(WeightedIndex::new(&w)?),
            Some(_) => {
                warn!("{}: background probabilities sum to zero, sampling uniformly", label);
                None
            }
            None => None,
        };
        Ok(Self { values, dist })
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn draw<R: Rng + ?Sized>(&self, rng: &mut R) -> f64 {
        match &self.dist {
            Some(d) => self.values[d.sample(rng)],
            None => self.values[rng.gen_range(0..self.values.len())],
        }
    }
}

/// Relative odds of drawing an indel rather than a substitution.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EventOdds {
    pub p_subs: f64,
    pub p_indels: f64,
}

impl EventOdds {
    pub fn substitutions_only() -> Self {
        Self { p_subs: 1.0, p_indels: 0.0 }
    }

    /// Share of frameshift indels among events, when defined.
    pub fn from_counts(indels: usize, subs: usize) -> Option<Self> {
        let total = indels + subs;
        if total == 0 {
            return None;
        }
        let p_indels = indels as f64 / total as f64;
        Some(Self { p_subs: 1.0 - p_indels, p_indels })
    }
}

/// Everything the background of one element is built from.
pub struct BackgroundInputs<'a> {
    pub index: &'a ScoreIndex,
    pub signature: Option<&'a SignatureTable>,
    pub site_weights: &'a SiteWeights,
    pub indel_scores: &'a [f64],
    pub odds: EventOdds,
}

impl<'a> BackgroundInputs<'a> {
    fn bucket_for(&self, key: &str, element_id: &str) -> Option<usize> {
        let sig = self.signature?;
        match sig.bucket_index(key) {
            Some(b) => Some(b),
            None if sig.bucket_names().len() == 1 => Some(0),
            None => {
                warn!("{}: no signature bucket '{}', sampling that bucket uniformly", element_id, key);
                None
            }
        }
    }

    /// Substitution pool of one randomization segment under one signature bucket.
    fn segment_pool(&self, segment: &str, bucket: Option<usize>) -> (Vec<f64>, Option<Vec<f64>>) {
        let weighted = bucket.is_some() || self.site_weights.is_active();
        let mut values = Vec::new();
        let mut weights = Vec::new();
        for (pos, entry) in self.index.segment_entries(segment) {
            values.push(entry.value);
            if weighted {
                let sig_prob = bucket.map(|b| entry.probs.get(b).copied().unwrap_or(0.0));
                weights.push(self.site_weights.adjust(pos, entry.alt_base, sig_prob).unwrap_or(1.0));
            }
        }
        (values, weighted.then_some(weights))
    }

    /// Substitution pool merged with the indel pool according to the odds.
    fn combined_pool(&self, segment: &str, bucket: Option<usize>, label: &str) -> Result<BackgroundPool> {
        let (mut values, sub_weights) = self.segment_pool(segment, bucket);
        let use_indels = self.odds.p_indels > 0.0 && !self.indel_scores.is_empty();
        if !use_indels {
            return BackgroundPool::new(values, sub_weights, label);
        }
        if values.is_empty() {
            return BackgroundPool::new(self.indel_scores.to_vec(), None, label);
        }

        let n_subs = values.len();
        let sub_weights = sub_weights.unwrap_or_else(|| vec![1.0; n_subs]);
        let sub_total: f64 = sub_weights.iter().sum();
        let mut weights: Vec<f64> = if sub_total > 0.0 {
            sub_weights.iter().map(|w| w / sub_total * self.odds.p_subs).collect()
        } else {
            warn!("{}: substitution probabilities sum to zero, sampling them uniformly", label);
            vec![self.odds.p_subs / n_subs as f64; n_subs]
        };
        let per_indel = self.odds.p_indels / self.indel_scores.len() as f64;
        values.extend_from_slice(self.indel_scores);
        weights.extend(std::iter::repeat(per_indel).take(self.indel_scores.len()));
        BackgroundPool::new(values, Some(weights), label)
    }
}

// ============================================================================
// Plan and partitions
// ============================================================================

/// Fixed per-element inputs of the replicate draws.
#[derive(Debug, Clone)]
pub struct SamplingPlan {
    pub element_id: String,
    pub pools: Vec<BackgroundPool>,
    /// Pool drawn from for each observed cell
    pub cell_pools: Vec<usize>,
    pub groups: Option<Vec<Vec<usize>>>,
    pub observed: f64,
    pub statistic: Statistic,
}

impl SamplingPlan {
    pub fn build(
        element_id: &str,
        observed: &ObservedStatistics,
        inputs: &BackgroundInputs,
        statistic: Statistic,
        per_sample: bool,
    ) -> Result<Self> {
        if !observed.is_scored() {
            bail!("{}: no scored mutations to sample", element_id);
        }
        let mut pool_ids: BTreeMap<(String, Option<usize>), usize> = BTreeMap::new();
        let mut pools = Vec::new();
        let mut buckets: BTreeMap<&str, Option<usize>> = BTreeMap::new();
        let mut cell_pools = Vec::with_capacity(observed.cells.len());
        for &m_idx in &observed.cells {
            let m = &observed.mutations[m_idx].inner;
            let bucket = *buckets
                .entry(m.signature.as_str())
                .or_insert_with(|| inputs.bucket_for(&m.signature, element_id));
            let key = (m.segment.clone(), bucket);
            let id = match pool_ids.get(&key) {
                Some(id) => *id,
                None => {
                    let label = format!("{} [{}]", element_id, m.segment);
                    pools.push(inputs.combined_pool(&m.segment, bucket, &label)?);
                    pool_ids.insert(key, pools.len() - 1);
                    pools.len() - 1
                }
            };
            cell_pools.push(id);
        }
        Ok(Self {
            element_id: element_id.to_string(),
            pools,
            cell_pools,
            groups: per_sample.then(|| observed.sample_groups.clone()),
            observed: observed.value(statistic, per_sample),
            statistic,
        })
    }

    pub fn width(&self) -> usize {
        self.cell_pools.len()
    }

    /// Draw `replicates` rows and compare each against the observed statistic.
    /// Stops early, keeping what was drawn, once `deadline` passes.
    pub fn run_partition(&self, replicates: u64, seed: u64, deadline: Option<Instant>) -> PartialCounts {
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        let width = self.width();
        let mut row = vec![0.0; width];
        let mut back_means = Vec::with_capacity(replicates as usize);
        for r in 0..replicates {
            if r % 1024 == 0 && deadline.is_some_and(|d| Instant::now() >= d) {
                break;
            }
            for (cell, pool) in row.iter_mut().zip(&self.cell_pools) {
                *cell = self.pools[*pool].draw(&mut rng);
            }
            let value = match &self.groups {
                Some(g) => self.statistic.reduce_grouped(&row, g),
                None => self.statistic.reduce(&row),
            };
            back_means.push(value);
        }
        let (obs, neg_obs) = self.statistic.compare(&back_means, self.observed);
        PartialCounts { replicates: back_means.len() as u64, obs, neg_obs, back_means }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct PartialCounts {
    pub replicates: u64,
    pub obs: u64,
    pub neg_obs: u64,
    pub back_means: Vec<f64>,
}

impl PartialCounts {
    pub fn merge(mut self, other: PartialCounts) -> Self {
        self.replicates += other.replicates;
        self.obs += other.obs;
        self.neg_obs += other.neg_obs;
        self.back_means.extend(other.back_means);
        self
    }
}

// ============================================================================
// Per-element state machine
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SamplingStatus {
    Pending,
    Sampling(u64),
    Converged,
    BudgetExhausted,
}

impl SamplingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SamplingStatus::Pending => "pending",
            SamplingStatus::Sampling(_) => "sampling",
            SamplingStatus::Converged => "converged",
            SamplingStatus::BudgetExhausted => "budget_exhausted",
        }
    }
}

#[derive(Debug, Clone)]
pub struct SamplingState {
    pub status: SamplingStatus,
    pub counts: PartialCounts,
}

impl Default for SamplingState {
    fn default() -> Self {
        Self { status: SamplingStatus::Pending, counts: PartialCounts::default() }
    }
}

impl SamplingState {
    /// Enter the first round. Returns the number of replicates to draw.
    pub fn start(&mut self, params: &SamplingParams) -> u64 {
        self.status = SamplingStatus::Sampling(params.initial);
        params.initial
    }

    pub fn absorb(&mut self, partial: PartialCounts) {
        let counts = std::mem::take(&mut self.counts);
        self.counts = counts.merge(partial);
    }

    /// Decide after a round: escalate (returning the additional replicates
    /// to draw) or settle in a terminal state.
    pub fn next_round(&mut self, params: &SamplingParams, timed_out: bool) -> Option<u64> {
        let SamplingStatus::Sampling(size) = self.status else { return None };
        if self.counts.obs >= params.min_obs {
            self.status = SamplingStatus::Converged;
            return None;
        }
        // A partition cut short by its deadline leaves the round incomplete
        if timed_out || self.counts.replicates < size || size >= params.max {
            self.status = SamplingStatus::BudgetExhausted;
            return None;
        }
        let next = size.saturating_mul(params.growth).min(params.max);
        self.status = SamplingStatus::Sampling(next);
        Some(next - size)
    }

    pub fn sampling_size(&self) -> u64 {
        self.counts.replicates
    }

    /// `max(1, obs) / size` and `max(1, neg_obs) / size`.
    pub fn pvalues(&self) -> (f64, f64) {
        let size = self.counts.replicates;
        if size == 0 {
            return (f64::NAN, f64::NAN);
        }
        let n = size as f64;
        (self.counts.obs.max(1) as f64 / n, self.counts.neg_obs.max(1) as f64 / n)
    }
}

/// Run every round of one element sequentially. Partition seeds come from
/// `master` in schedule order.
pub fn sample_element(plan: &SamplingPlan, params: &SamplingParams, master: &mut ChaCha8Rng) -> SamplingState {
    let mut state = SamplingState::default();
    let mut pending = Some(state.start(params));
    while let Some(size) = pending {
        for part in schedule(size, plan.width() as u64, params.chunk_cells) {
            let seed = master.gen::<u64>();
            state.absorb(plan.run_partition(part, seed, None));
        }
        pending = state.next_round(params, false);
    }
    state
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mutations::{Mutation, Scored, Variant};
    use crate::scores::ScoreEntry;

    fn scenario_a() -> (ScoreIndex, ObservedStatistics) {
        let mut index = ScoreIndex { chrom: "1".into(), ..ScoreIndex::default() };
        index.positions.insert(105, vec![ScoreEntry { ref_base: b'A', alt_base: b'T', value: 2.0, probs: vec![] }]);
        index.positions.insert(150, vec![ScoreEntry { ref_base: b'A', alt_base: b'G', value: 5.0, probs: vec![] }]);
        index.segments.insert("GENE1".into(), vec![105, 150]);

        let m = Mutation {
            chrom: "1".into(),
            pos: 150,
            sample: "S1".into(),
            signature: "S".into(),
            variant: Variant::Substitution { ref_base: b'A', alt_base: b'G' },
            segment: "GENE1".into(),
        };
        let observed = ObservedStatistics {
            muts: 1,
            muts_recurrence: 1,
            samples_mut: 1,
            scores: vec![5.0],
            positions: vec![150],
            cells: vec![0],
            sample_groups: vec![vec![0]],
            mutations: vec![Scored { inner: m, score: 5.0, pos: 150 }],
            ..ObservedStatistics::default()
        };
        (index, observed)
    }

    fn plan(observed_score: f64) -> SamplingPlan {
        let (index, mut observed) = scenario_a();
        observed.scores = vec![observed_score];
        let weights = SiteWeights::default();
        let inputs = BackgroundInputs {
            index: &index,
            signature: None,
            site_weights: &weights,
            indel_scores: &[],
            odds: EventOdds::substitutions_only(),
        };
        SamplingPlan::build("GENE1", &observed, &inputs, Statistic::ArithmeticMean, false).unwrap()
    }

    fn params(initial: u64, max: u64, min_obs: u64) -> SamplingParams {
        SamplingParams { initial, max, min_obs, growth: 10, chunk_cells: 1_000_000 }
    }

    #[test]
    fn test_partitions_list() {
        assert_eq!(partitions_list(10, 3), vec![3, 3, 3, 1]);
        assert_eq!(partitions_list(9, 3), vec![3, 3, 3]);
        assert_eq!(partitions_list(2, 5), vec![2]);
        assert!(partitions_list(0, 5).is_empty());
    }

    #[test]
    fn test_chunk_size() {
        // 10_000 replicates x 500 mutations over 1e6 cells per chunk -> 5 chunks
        assert_eq!(chunk_size(10_000, 500, 1_000_000), 2_000);
        assert_eq!(chunk_size(10_000, 3, 1_000_000), 10_000);
        assert_eq!(schedule(10_000, 500, 1_000_000).iter().sum::<u64>(), 10_000);
    }

    #[test]
    fn test_scenario_a_pvalue_near_half() {
        let plan = plan(5.0);
        let mut master = ChaCha8Rng::seed_from_u64(42);
        let state = sample_element(&plan, &params(1000, 1000, 5), &mut master);
        assert_eq!(state.sampling_size(), 1000);
        assert_eq!(state.status, SamplingStatus::Converged);
        let (p, p_neg) = state.pvalues();
        assert!((p - 0.5).abs() < 0.06, "pvalue {} should be near 0.5", p);
        // Every replicate is <= 5.0
        assert_eq!(p_neg, 1.0);
    }

    #[test]
    fn test_pvalue_floor_and_budget_exhaustion() {
        let plan = plan(100.0);
        let mut master = ChaCha8Rng::seed_from_u64(1);
        let state = sample_element(&plan, &params(100, 10_000, 5), &mut master);
        assert_eq!(state.counts.obs, 0);
        assert_eq!(state.sampling_size(), 10_000, "escalated 100 -> 1000 -> 10000");
        assert_eq!(state.status, SamplingStatus::BudgetExhausted);
        let (p, _) = state.pvalues();
        assert!(p > 0.0 && p <= 1.0);
        assert_eq!(p, 1.0 / 10_000.0);
    }

    #[test]
    fn test_escalation_is_monotonic_and_incremental() {
        let plan = plan(4.0);
        let p = params(10, 1000, 1_000);
        let mut master = ChaCha8Rng::seed_from_u64(9);
        let mut state = SamplingState::default();
        let first = state.start(&p);
        state.absorb(plan.run_partition(first, master.gen(), None));
        let obs_round1 = state.counts.obs;
        let means_round1 = state.counts.back_means.clone();

        let extra = state.next_round(&p, false).unwrap();
        assert_eq!(extra, 90, "only the difference is drawn");
        state.absorb(plan.run_partition(extra, master.gen(), None));
        assert!(state.counts.obs >= obs_round1);
        assert_eq!(&state.counts.back_means[..10], means_round1.as_slice(), "round 1 draws are kept");
        assert_eq!(state.counts.replicates, 100);
    }

    #[test]
    fn test_partitioning_preserves_counts() {
        let plan = plan(5.0);
        let whole = plan.run_partition(500, 3, None);
        let split = plan.run_partition(200, 4, None).merge(plan.run_partition(300, 5, None));
        assert_eq!(whole.replicates, split.replicates);
        assert!(whole.obs + whole.neg_obs >= whole.replicates);
        assert!(split.obs + split.neg_obs >= split.replicates);
    }

    #[test]
    fn test_timeout_marks_budget_exhausted() {
        let plan = plan(100.0);
        let p = params(100, 10_000, 5);
        let mut state = SamplingState::default();
        let n = state.start(&p);
        state.absorb(plan.run_partition(n, 1, None));
        assert_eq!(state.next_round(&p, true), None);
        assert_eq!(state.status, SamplingStatus::BudgetExhausted);
        assert_eq!(state.pvalues().0, 1.0 / 100.0);
    }

    #[test]
    fn test_short_round_that_already_converged_is_converged() {
        let plan = plan(5.0);
        let p = params(1000, 10_000, 5);
        let mut state = SamplingState::default();
        let n = state.start(&p);
        // Only part of the round was drawn before the deadline
        state.absorb(plan.run_partition(n / 2, 2, None));
        assert!(state.counts.obs >= 5);
        assert_eq!(state.next_round(&p, true), None);
        assert_eq!(state.status, SamplingStatus::Converged);

        let plan = self::plan(100.0);
        let mut state = SamplingState::default();
        let n = state.start(&p);
        state.absorb(plan.run_partition(n / 2, 2, None));
        assert_eq!(state.next_round(&p, false), None);
        assert_eq!(state.status, SamplingStatus::BudgetExhausted);
        assert_eq!(state.sampling_size(), 500);
    }

    #[test]
    fn test_schedule_depends_only_on_round_and_width() {
        // Partition layout and seeds are fixed before any worker runs
        let plan = plan(4.0);
        let p = SamplingParams { chunk_cells: 7, ..params(600, 600, 5) };
        let run = || {
            let mut master = ChaCha8Rng::seed_from_u64(77);
            let mut state = SamplingState::default();
            let n = state.start(&p);
            let parts = schedule(n, plan.width() as u64, p.chunk_cells);
            let seeded: Vec<(u64, u64)> = parts.iter().map(|&part| (part, master.gen())).collect();
            // Run partitions in reverse to stand in for an arbitrary completion order
            let mut partials: Vec<(usize, PartialCounts)> =
                seeded.iter().enumerate().rev().map(|(i, &(part, seed))| (i, plan.run_partition(part, seed, None))).collect();
            partials.sort_by_key(|(i, _)| *i);
            for (_, partial) in partials {
                state.absorb(partial);
            }
            state.next_round(&p, false);
            (parts.len(), state)
        };
        let (parts_a, a) = run();
        let (parts_b, b) = run();
        assert_eq!(parts_a, 86);
        assert_eq!(parts_a, parts_b);
        assert_eq!(a.counts, b.counts);
        assert_eq!(a.pvalues(), b.pvalues());
        assert_eq!(a.sampling_size(), 600);
    }

    #[test]
    fn test_combined_pool_weights_indels() {
        let (index, observed) = scenario_a();
        let weights = SiteWeights::default();
        let indel_scores = [50.0];
        let inputs = BackgroundInputs {
            index: &index,
            signature: None,
            site_weights: &weights,
            indel_scores: &indel_scores,
            odds: EventOdds { p_subs: 0.5, p_indels: 0.5 },
        };
        let plan = SamplingPlan::build("GENE1", &observed, &inputs, Statistic::ArithmeticMean, false).unwrap();
        assert_eq!(plan.pools[0].len(), 3);
        let counts = plan.run_partition(4000, 11, None);
        let indel_draws = counts.back_means.iter().filter(|v| **v == 50.0).count();
        assert!((1700..2300).contains(&indel_draws), "about half the draws are indels, got {}", indel_draws);
    }

    #[test]
    fn test_zero_weights_fall_back_to_uniform() {
        let pool = BackgroundPool::new(vec![1.0, 2.0], Some(vec![0.0, 0.0]), "test").unwrap();
        let mut rng = ChaCha8Rng::seed_from_u64(0);
        let v = pool.draw(&mut rng);
        assert!(v == 1.0 || v == 2.0);
        assert!(BackgroundPool::new(vec![], None, "empty").is_err());
    }

    #[test]
    fn test_event_odds() {
        assert_eq!(EventOdds::from_counts(1, 3), Some(EventOdds { p_subs: 0.75, p_indels: 0.25 }));
        assert_eq!(EventOdds::from_counts(0, 0), None);
    }
}
