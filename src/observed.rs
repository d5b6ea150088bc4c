//! Scoring of the observed mutations of one element.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use log::debug;
use rand::RngCore;
use serde::{Deserialize, Serialize};

use crate::config::StatisticConfig;
use crate::indels::{IndelContext, IndelStrategy};
use crate::mutations::{Mutation, MutationType, Scored, Variant};
use crate::regions::normalize_chrom;
use crate::scores::ScoreIndex;
use crate::statistic::Statistic;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ObservedStatistics {
    /// Scored mutations
    pub muts: usize,
    /// Distinct scored positions
    pub muts_recurrence: usize,
    /// Largest number of scored mutations at one position
    pub max_recurrence: usize,
    pub samples_mut: usize,
    /// Raw subtype tally over every input mutation, scored or not
    pub snps: usize,
    pub mnps: usize,
    pub indels: usize,
    /// Scored counts by subtype
    pub scored_subs: usize,
    pub scored_mnps: usize,
    pub scored_indels: usize,
    /// In-frame scored indels, sampled as substitutions
    pub scored_inframe: usize,
    pub scores: Vec<f64>,
    pub positions: Vec<u64>,
    /// Index into `mutations` of each cell of `scores`
    pub cells: Vec<usize>,
    /// Indices into `scores` grouped by sample
    pub sample_groups: Vec<Vec<usize>>,
    pub mutations: Vec<Scored<Mutation>>,
}

impl ObservedStatistics {
    pub fn is_scored(&self) -> bool {
        !self.scores.is_empty()
    }

    /// Observed statistic under the configured reduction.
    pub fn value(&self, statistic: Statistic, per_sample: bool) -> f64 {
        if per_sample {
            statistic.reduce_grouped(&self.scores, &self.sample_groups)
        } else {
            statistic.reduce(&self.scores)
        }
    }
}

/// Highest per-base score of an MNP and the offset it came from.
fn score_mnp(index: &ScoreIndex, pos: u64, ref_allele: &str, alt_allele: &str) -> Option<(f64, u64)> {
    let mut best: Option<(f64, u64)> = None;
    for (i, (r, a)) in ref_allele.bytes().zip(alt_allele.bytes()).enumerate() {
        if r == a {
            continue;
        }
        let at = pos + i as u64;
        if let Some(entry) = index.lookup(at, r, a).filter(|e| !e.value.is_nan()) {
            if best.map_or(true, |(v, _)| entry.value > v) {
                best = Some((entry.value, at));
            }
        }
    }
    best
}

pub struct MutationStatisticsBuilder<'a> {
    pub config: &'a StatisticConfig,
    pub indels: Option<&'a dyn IndelStrategy>,
}

impl<'a> MutationStatisticsBuilder<'a> {
    /// Score every mutation and aggregate. `None` when there are no mutations.
    pub fn build(
        &self,
        mutations: &[Mutation],
        index: &ScoreIndex,
        indel_ctx: Option<&IndelContext>,
        rng: &mut dyn RngCore,
    ) -> Option<ObservedStatistics> {
        if mutations.is_empty() {
            return None;
        }
        let frame_length = self.config.indels.frame_length();
        let mut stats = ObservedStatistics::default();
        let mut skipped = 0usize;
        let mut off_chrom = 0usize;

        for m in mutations {
            match m.kind() {
                MutationType::Substitution => stats.snps += 1,
                MutationType::Mnp => stats.mnps += 1,
                MutationType::Indel => stats.indels += 1,
            }
            // The index only covers the chromosome of the first segment
            if normalize_chrom(&m.chrom) != normalize_chrom(&index.chrom) {
                off_chrom += 1;
                continue;
            }

            let scored = match &m.variant {
                Variant::Substitution { ref_base, alt_base } => {
                    index.lookup(m.pos, *ref_base, *alt_base).filter(|e| !e.value.is_nan()).map(|e| (e.value, m.pos))
                }
                Variant::Mnp { ref_allele, alt_allele } => {
                    if self.config.discard_mnp {
                        None
                    } else {
                        score_mnp(index, m.pos, ref_allele, alt_allele)
                    }
                }
                Variant::Indel { .. } => match (self.indels, indel_ctx) {
                    (Some(strategy), Some(ctx)) if m.indel_size() <= self.config.indels.max_size => {
                        let v = strategy.score(ctx, m, rng);
                        (!v.is_nan()).then_some((v, m.pos))
                    }
                    _ => None,
                },
            };

            let Some((score, pos)) = scored else {
                skipped += 1;
                continue;
            };
            match m.kind() {
                MutationType::Substitution => stats.scored_subs += 1,
                MutationType::Mnp => stats.scored_mnps += 1,
                MutationType::Indel => {
                    stats.scored_indels += 1;
                    if !crate::indels::is_frameshift(m.indel_size(), frame_length) {
                        stats.scored_inframe += 1;
                    }
                }
            }
            stats.mutations.push(Scored { inner: m.clone(), score, pos });
        }

        if skipped > 0 {
            debug!("{} of {} mutations have no score", skipped, mutations.len());
        }
        if off_chrom > 0 {
            debug!("{} mutations are off chromosome {} and were not scored", off_chrom, index.chrom);
        }

        let mut per_position: HashMap<u64, usize> = HashMap::new();
        let mut seen_positions = BTreeSet::new();
        let mut group_of: BTreeMap<&str, usize> = BTreeMap::new();
        for (mut_idx, scored) in stats.mutations.iter().enumerate() {
            *per_position.entry(scored.pos).or_default() += 1;
            if !self.config.recurrence && !seen_positions.insert(scored.pos) {
                continue;
            }
            let cell = stats.scores.len();
            stats.scores.push(scored.score);
            stats.positions.push(scored.pos);
            stats.cells.push(mut_idx);
            let next_group = group_of.len();
            let g = *group_of.entry(scored.inner.sample.as_str()).or_insert(next_group);
            if g == stats.sample_groups.len() {
                stats.sample_groups.push(Vec::new());
            }
            stats.sample_groups[g].push(cell);
        }

        stats.muts = stats.scores.len();
        stats.muts_recurrence = per_position.len();
        stats.max_recurrence = per_position.values().copied().max().unwrap_or(0);
        stats.samples_mut = stats.mutations.iter().map(|m| m.inner.sample.as_str()).collect::<BTreeSet<_>>().len();
        Some(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::IndelConfig;
    use crate::indels::strategy_from_config;
    use crate::reference::MemoryGenome;
    use crate::scores::ScoreEntry;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    fn mutation(pos: u64, sample: &str, variant: Variant) -> Mutation {
        Mutation { chrom: "1".into(), pos, sample: sample.into(), signature: "S".into(), variant, segment: "G".into() }
    }

    fn subs(pos: u64, sample: &str, r: u8, a: u8) -> Mutation {
        mutation(pos, sample, Variant::Substitution { ref_base: r, alt_base: a })
    }

    fn index() -> ScoreIndex {
        let mut index = ScoreIndex { chrom: "1".into(), ..ScoreIndex::default() };
        for (pos, r, a, v) in [(105u64, b'A', b'T', 2.0), (150, b'A', b'G', 5.0), (151, b'C', b'T', 7.0), (152, b'G', b'A', 1.0)] {
            index.positions.entry(pos).or_default().push(ScoreEntry { ref_base: r, alt_base: a, value: v, probs: vec![] });
        }
        index
    }

    #[test]
    fn test_empty_input_is_none() {
        let config = StatisticConfig::default();
        let builder = MutationStatisticsBuilder { config: &config, indels: None };
        let mut rng = ChaCha8Rng::seed_from_u64(0);
        assert!(builder.build(&[], &index(), None, &mut rng).is_none());
    }

    #[test]
    fn test_substitution_scores_and_counts() {
        let config = StatisticConfig::default();
        let builder = MutationStatisticsBuilder { config: &config, indels: None };
        let muts = vec![subs(150, "S1", b'A', b'G'), subs(150, "S2", b'A', b'G'), subs(105, "S1", b'A', b'C')];
        let mut rng = ChaCha8Rng::seed_from_u64(0);
        let stats = builder.build(&muts, &index(), None, &mut rng).unwrap();
        assert_eq!(stats.scores, vec![5.0, 5.0]);
        assert_eq!(stats.muts, 2);
        assert_eq!(stats.snps, 3, "raw tally keeps the unscored one");
        assert_eq!(stats.muts_recurrence, 1);
        assert_eq!(stats.max_recurrence, 2);
        assert_eq!(stats.samples_mut, 2);
        assert_eq!(stats.sample_groups, vec![vec![0], vec![1]]);
    }

    #[test]
    fn test_mutations_off_the_index_chromosome_are_not_scored() {
        let config = StatisticConfig::default();
        let builder = MutationStatisticsBuilder { config: &config, indels: None };
        let mut other = subs(150, "S2", b'A', b'G');
        other.chrom = "2".into();
        let muts = vec![subs(150, "S1", b'A', b'G'), other];
        let mut rng = ChaCha8Rng::seed_from_u64(0);
        let stats = builder.build(&muts, &index(), None, &mut rng).unwrap();
        assert_eq!(stats.scores, vec![5.0]);
        assert_eq!(stats.samples_mut, 1);
        assert_eq!(stats.snps, 2, "raw tally keeps the chromosome 2 mutation");
    }

    #[test]
    fn test_nan_scores_are_not_scored() {
        let config = StatisticConfig::default();
        let builder = MutationStatisticsBuilder { config: &config, indels: None };
        let mut idx = index();
        idx.positions.entry(160).or_default().push(ScoreEntry { ref_base: b'T', alt_base: b'C', value: f64::NAN, probs: vec![] });
        let mnp = mutation(160, "S2", Variant::Mnp { ref_allele: "TA".into(), alt_allele: "CG".into() });
        let muts = vec![subs(160, "S1", b'T', b'C'), mnp];
        let mut rng = ChaCha8Rng::seed_from_u64(0);
        let stats = builder.build(&muts, &idx, None, &mut rng).unwrap();
        assert!(!stats.is_scored());
        assert_eq!((stats.snps, stats.mnps), (1, 1));
    }

    #[test]
    fn test_recurrence_disabled_counts_position_once() {
        let config = StatisticConfig { recurrence: false, ..StatisticConfig::default() };
        let builder = MutationStatisticsBuilder { config: &config, indels: None };
        let muts = vec![subs(150, "S1", b'A', b'G'), subs(150, "S2", b'A', b'G'), subs(105, "S3", b'A', b'T')];
        let mut rng = ChaCha8Rng::seed_from_u64(0);
        let stats = builder.build(&muts, &index(), None, &mut rng).unwrap();
        assert_eq!(stats.scores, vec![5.0, 2.0]);
        assert_eq!(stats.samples_mut, 3);
    }

    #[test]
    fn test_mnp_takes_max_and_drifts_position() {
        let config = StatisticConfig::default();
        let builder = MutationStatisticsBuilder { config: &config, indels: None };
        let mnp = mutation(150, "S1", Variant::Mnp { ref_allele: "ACG".into(), alt_allele: "GTA".into() });
        let mut rng = ChaCha8Rng::seed_from_u64(0);
        let stats = builder.build(&[mnp.clone()], &index(), None, &mut rng).unwrap();
        assert_eq!(stats.scores, vec![7.0]);
        assert_eq!(stats.mutations[0].pos, 151);
        assert_eq!(stats.positions, vec![151]);

        let discard = StatisticConfig { discard_mnp: true, ..StatisticConfig::default() };
        let builder = MutationStatisticsBuilder { config: &discard, indels: None };
        let stats = builder.build(&[mnp], &index(), None, &mut rng).unwrap();
        assert!(!stats.is_scored());
        assert_eq!(stats.mnps, 1);
    }

    #[test]
    fn test_repeat_indel_is_dropped_from_scores() {
        let genome = MemoryGenome::new([("1", "GGGGGCACACACAGGGGG")]);
        let config = StatisticConfig::default();
        let strategy = strategy_from_config(&IndelConfig::default());
        let builder = MutationStatisticsBuilder { config: &config, indels: Some(strategy.as_ref()) };
        let mut idx = ScoreIndex { chrom: "1".into(), ..ScoreIndex::default() };
        idx.positions.entry(3).or_default().push(ScoreEntry { ref_base: b'G', alt_base: b'T', value: 1.0, probs: vec![] });
        let ctx = IndelContext { index: &idx, genome: &genome, reverse: false, stop_scores: &[] };
        let muts = vec![
            mutation(10, "S1", Variant::Indel { ref_allele: "-".into(), alt_allele: "CA".into() }),
            subs(3, "S2", b'G', b'T'),
        ];
        let mut rng = ChaCha8Rng::seed_from_u64(0);
        let stats = builder.build(&muts, &idx, Some(&ctx), &mut rng).unwrap();
        assert_eq!(stats.indels, 1);
        assert_eq!(stats.scored_indels, 0);
        assert_eq!(stats.muts, 1);
        assert!(stats.muts < stats.indels + stats.snps);
    }

    #[test]
    fn test_oversized_indel_is_skipped() {
        let genome = MemoryGenome::new([("1", "A".repeat(200))]);
        let config = StatisticConfig::default();
        let strategy = strategy_from_config(&IndelConfig::default());
        let builder = MutationStatisticsBuilder { config: &config, indels: Some(strategy.as_ref()) };
        let idx = index();
        let ctx = IndelContext { index: &idx, genome: &genome, reverse: false, stop_scores: &[] };
        let long = mutation(120, "S1", Variant::Indel { ref_allele: "A".repeat(21), alt_allele: "-".into() });
        let mut rng = ChaCha8Rng::seed_from_u64(0);
        let stats = builder.build(&[long], &idx, Some(&ctx), &mut rng).unwrap();
        assert_eq!(stats.indels, 1);
        assert!(!stats.is_scored());
    }
}
