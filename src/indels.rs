//! Functional impact of insertions and deletions.
//!
//! Three strategies are available, chosen once per run:
//!
//! - **pattern**: look at a window of substitutions the indel produces along
//!   the element's reading direction and take the highest (position-weighted
//!   for frameshifts) score. The background replays the indel's change pattern
//!   at every background position.
//! - **stop**: frameshifts take a summary of the element's stop-gain scores;
//!   in-frame indels score like an unweighted indel-sized window.
//! - **max**: the highest substitution score over a window exactly as long as
//!   the indel. The background is every substitution score, unweighted.
//!
//! Indels whose own sequence is tandem-repeated around the call are scored NaN.

use rand::{Rng, RngCore};

use crate::config::{IndelConfig, IndelMethod, StopSummary, WeightFunction};
use crate::mutations::Mutation;
use crate::reference::GenomeSequence;
use crate::scores::ScoreIndex;
use crate::signature::complement;

/// An indel is in-frame when frames are enabled and its size is a multiple of
/// the frame length.
pub fn is_frameshift(size: usize, frame_length: usize) -> bool {
    !(frame_length != 1 && size % frame_length == 0)
}

/// Window examined for an indel of `indel_size` bases.
pub fn compute_window_size(indel_size: usize, window_size: usize, frame_length: usize) -> usize {
    let size = if is_frameshift(indel_size, frame_length) {
        window_size
    } else {
        (indel_size + frame_length - 1).min(window_size)
    };
    size.max(indel_size)
}

/// Positional decay applied past the indel itself.
#[derive(Debug, Clone, Copy)]
pub struct Weight {
    function: WeightFunction,
    length: f64,
}

impl Weight {
    pub fn new(function: WeightFunction, length: usize) -> Self {
        Self { function, length: length as f64 }
    }

    /// Close to 1 at `x = 0` and close to 0 at `x = length`.
    pub fn at(&self, x: f64) -> f64 {
        match self.function {
            WeightFunction::Constant => 1.0,
            WeightFunction::Linear => 1.0 - x / self.length,
            WeightFunction::Logistic => 1.0 / (1.0 + (0.5 * (x - self.length / 2.0)).exp()),
        }
    }
}

// ============================================================================
// Change patterns
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangePattern {
    Same,
    Complementary,
    Transition,
    Transversion,
}

fn transition(base: u8) -> u8 {
    match base {
        b'A' => b'G',
        b'G' => b'A',
        b'C' => b'T',
        b'T' => b'C',
        _ => b'N',
    }
}

fn transversion(base: u8) -> u8 {
    match base {
        b'A' => b'C',
        b'C' => b'A',
        b'G' => b'T',
        b'T' => b'G',
        _ => b'N',
    }
}

impl ChangePattern {
    fn classify(reference: u8, altered: u8) -> Self {
        if reference == altered {
            ChangePattern::Same
        } else if reference == complement(altered) {
            ChangePattern::Complementary
        } else if reference == transition(altered) {
            ChangePattern::Transition
        } else {
            ChangePattern::Transversion
        }
    }

    fn apply(&self, base: u8) -> u8 {
        match self {
            ChangePattern::Same => base,
            ChangePattern::Complementary => complement(base),
            ChangePattern::Transition => transition(base),
            ChangePattern::Transversion => transversion(base),
        }
    }
}

pub fn compute_pattern(reference: &[u8], altered: &[u8]) -> Vec<ChangePattern> {
    reference.iter().zip(altered).map(|(r, a)| ChangePattern::classify(*r, *a)).collect()
}

pub fn apply_pattern(sequence: &[u8], pattern: &[ChangePattern]) -> Vec<u8> {
    sequence.iter().zip(pattern).map(|(b, p)| p.apply(*b)).collect()
}

// ============================================================================
// Shared window machinery
// ============================================================================

/// Everything a strategy needs about the element being analysed.
pub struct IndelContext<'a> {
    pub index: &'a ScoreIndex,
    pub genome: &'a dyn GenomeSequence,
    pub reverse: bool,
    pub stop_scores: &'a [f64],
}

#[derive(Debug, Clone)]
pub struct IndelParams {
    pub window_size: usize,
    pub frame_length: usize,
    pub max_repeats: usize,
    pub weight: Weight,
}

impl IndelParams {
    pub fn from_config(cfg: &IndelConfig) -> Self {
        Self {
            window_size: cfg.window_size,
            frame_length: cfg.frame_length(),
            max_repeats: cfg.max_repeats,
            weight: Weight::new(cfg.weight_function, cfg.window_size),
        }
    }

    pub fn is_frameshift(&self, size: usize) -> bool {
        is_frameshift(size, self.frame_length)
    }

    pub fn window_for(&self, indel_size: usize) -> usize {
        compute_window_size(indel_size, self.window_size, self.frame_length)
    }

    /// Whether the indel's own sequence appears at least `max_repeats` times
    /// in a window of `2 * max_repeats * len` bases centred on the call.
    pub fn is_repetitive(&self, genome: &dyn GenomeSequence, m: &Mutation) -> bool {
        if self.max_repeats == 0 {
            return false;
        }
        let Some(seq) = m.indel_sequence() else { return false };
        let size = self.max_repeats * 2 * seq.len();
        let half = (size / 2) as u64 + 1;
        if m.pos <= half {
            return false;
        }
        match genome.get_ref(&m.chrom, m.pos - half, size + 1) {
            Some(context) => context.matches(seq).count() >= self.max_repeats,
            None => false,
        }
    }

    /// Reference and altered sequences of `size` bases in the reading
    /// direction, and the genomic position of their first base.
    pub fn mutation_sequences(&self, ctx: &IndelContext, m: &Mutation, size: usize) -> Option<(Vec<u8>, Vec<u8>, u64)> {
        let seq = m.indel_sequence()?.as_bytes();
        let k = seq.len();
        if !ctx.reverse {
            let reference = ctx.genome.get_ref(&m.chrom, m.pos, k + size)?.into_bytes();
            let altered: Vec<u8> = if m.is_insertion() {
                seq.iter().chain(reference.iter()).copied().collect()
            } else {
                reference[k..].to_vec()
            };
            Some((reference[..size].to_vec(), altered[..size].to_vec(), m.pos))
        } else {
            let start = m.pos.checked_sub((k + size) as u64).filter(|s| *s > 0)?;
            let reference = ctx.genome.get_ref(&m.chrom, start, k + size)?.into_bytes();
            let altered: Vec<u8> = if m.is_insertion() {
                reference.iter().chain(seq.iter()).copied().collect()
            } else {
                reference[..reference.len() - k].to_vec()
            };
            Some((
                reference[reference.len() - size..].to_vec(),
                altered[altered.len() - size..].to_vec(),
                m.pos - size as u64,
            ))
        }
    }

    /// Score of each window position whose (ref, alt) pair is in the index; NaN otherwise.
    pub fn compute_scores(&self, index: &ScoreIndex, reference: &[u8], altered: &[u8], init_pos: u64) -> Vec<f64> {
        reference
            .iter()
            .zip(altered)
            .enumerate()
            .map(|(i, (r, a))| index.lookup(init_pos + i as u64, *r, *a).map(|e| e.value).unwrap_or(f64::NAN))
            .collect()
    }

    /// Down-weight the part of a frameshift window beyond the indel.
    pub fn apply_weight(&self, scores: &mut [f64], indel_size: usize, reverse: bool) {
        if !self.is_frameshift(indel_size) {
            return;
        }
        let total = scores.len();
        if total <= indel_size {
            return;
        }
        if !reverse {
            for i in indel_size..total {
                scores[i] *= self.weight.at((i - indel_size + 1) as f64);
            }
        } else {
            for i in 0..total - indel_size {
                scores[i] *= self.weight.at(((total - indel_size) - i) as f64);
            }
        }
    }

    fn window_score(&self, ctx: &IndelContext, m: &Mutation, size: usize, weighted: bool) -> f64 {
        let Some((reference, altered, init_pos)) = self.mutation_sequences(ctx, m, size) else {
            return f64::NAN;
        };
        let mut scores = self.compute_scores(ctx.index, &reference, &altered, init_pos);
        if weighted {
            self.apply_weight(&mut scores, m.indel_size(), ctx.reverse);
        }
        max_defined(&scores)
    }
}

/// Largest non-NaN value, NaN when there is none.
pub fn max_defined(values: &[f64]) -> f64 {
    values.iter().copied().filter(|v| !v.is_nan()).fold(f64::NAN, f64::max)
}

fn substitution_background(index: &ScoreIndex) -> Vec<f64> {
    index.values().collect()
}

// ============================================================================
// Strategies
// ============================================================================

pub trait IndelStrategy: Send + Sync {
    fn method(&self) -> IndelMethod;

    fn params(&self) -> &IndelParams;

    /// Score of an observed indel; NaN when undefined.
    fn score(&self, ctx: &IndelContext, m: &Mutation, rng: &mut dyn RngCore) -> f64;

    /// Scores forming the indel part of the background population.
    fn background(&self, ctx: &IndelContext, observed: &[&Mutation]) -> Vec<f64>;
}

pub fn strategy_from_config(cfg: &IndelConfig) -> Box<dyn IndelStrategy> {
    let params = IndelParams::from_config(cfg);
    match cfg.method {
        IndelMethod::Pattern => Box::new(PatternStrategy { params }),
        IndelMethod::Stop => Box::new(StopStrategy { params, summary: cfg.stop_function }),
        IndelMethod::Max => Box::new(MaxStrategy { params }),
    }
}

pub struct PatternStrategy {
    params: IndelParams,
}

impl IndelStrategy for PatternStrategy {
    fn method(&self) -> IndelMethod {
        IndelMethod::Pattern
    }

    fn params(&self) -> &IndelParams {
        &self.params
    }

    fn score(&self, ctx: &IndelContext, m: &Mutation, _rng: &mut dyn RngCore) -> f64 {
        if self.params.is_repetitive(ctx.genome, m) {
            return f64::NAN;
        }
        let size = self.params.window_for(m.indel_size());
        self.params.window_score(ctx, m, size, true)
    }

    fn background(&self, ctx: &IndelContext, observed: &[&Mutation]) -> Vec<f64> {
        let mut scores = Vec::new();
        for m in observed {
            let indel_size = m.indel_size();
            let length = self.params.window_for(indel_size);
            let Some((reference, altered, _)) = self.params.mutation_sequences(ctx, m, length) else {
                continue;
            };
            let pattern = compute_pattern(&reference, &altered);

            for &pos in ctx.index.positions.keys() {
                let Some(window) = ctx.genome.get_ref(&ctx.index.chrom, pos, length) else { continue };
                let window = window.into_bytes();
                let shifted = apply_pattern(&window, &pattern);
                let mut values = self.params.compute_scores(ctx.index, &window, &shifted, pos);
                self.params.apply_weight(&mut values, indel_size, ctx.reverse);
                let best = max_defined(&values);
                if !best.is_nan() {
                    scores.push(best);
                }
            }
        }
        if scores.is_empty() {
            return substitution_background(ctx.index);
        }
        scores
    }
}

pub struct StopStrategy {
    params: IndelParams,
    summary: StopSummary,
}

impl StopStrategy {
    fn summarize(&self, population: &[f64], rng: &mut dyn RngCore) -> f64 {
        if population.is_empty() {
            return f64::NAN;
        }
        match self.summary {
            StopSummary::Mean => population.iter().sum::<f64>() / population.len() as f64,
            StopSummary::Median => {
                let mut sorted = population.to_vec();
                sorted.sort_by(|a, b| a.total_cmp(b));
                let mid = sorted.len() / 2;
                if sorted.len() % 2 == 0 {
                    (sorted[mid - 1] + sorted[mid]) / 2.0
                } else {
                    sorted[mid]
                }
            }
            StopSummary::Random => {
                let lo = population.iter().copied().fold(f64::INFINITY, f64::min);
                let hi = population.iter().copied().fold(f64::NEG_INFINITY, f64::max);
                if lo < hi {
                    rng.gen_range(lo..=hi)
                } else {
                    lo
                }
            }
            StopSummary::RandomChoice => population[rng.gen_range(0..population.len())],
        }
    }
}

impl IndelStrategy for StopStrategy {
    fn method(&self) -> IndelMethod {
        IndelMethod::Stop
    }

    fn params(&self) -> &IndelParams {
        &self.params
    }

    fn score(&self, ctx: &IndelContext, m: &Mutation, rng: &mut dyn RngCore) -> f64 {
        if self.params.is_repetitive(ctx.genome, m) {
            return f64::NAN;
        }
        let size = m.indel_size();
        if self.params.is_frameshift(size) {
            self.summarize(ctx.stop_scores, rng)
        } else {
            self.params.window_score(ctx, m, size, false)
        }
    }

    fn background(&self, ctx: &IndelContext, _observed: &[&Mutation]) -> Vec<f64> {
        ctx.stop_scores.to_vec()
    }
}

pub struct MaxStrategy {
    params: IndelParams,
}

impl IndelStrategy for MaxStrategy {
    fn method(&self) -> IndelMethod {
        IndelMethod::Max
    }

    fn params(&self) -> &IndelParams {
        &self.params
    }

    fn score(&self, ctx: &IndelContext, m: &Mutation, _rng: &mut dyn RngCore) -> f64 {
        if self.params.is_repetitive(ctx.genome, m) {
            return f64::NAN;
        }
        self.params.window_score(ctx, m, m.indel_size(), false)
    }

    fn background(&self, ctx: &IndelContext, _observed: &[&Mutation]) -> Vec<f64> {
        substitution_background(ctx.index)
    }
}
