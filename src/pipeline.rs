//! Run orchestration.
//!
//! Elements go through two kinds of parallel waves on one rayon pool:
//!
//! 1. Preparation: one unit per element. Score index, observed statistics
//!    and the sampling plan are built on the worker, with readers opened
//!    locally through the source factories.
//! 2. Sampling: one wave per round. Every pending element contributes its
//!    partitions; partial counts come back as plain values and are merged
//!    here, on the coordinating thread, before each element decides whether
//!    to escalate.
//!
//! An element whose unit fails is logged and dropped without affecting the
//! others. An element that cannot be sampled, or runs out of time while being
//! prepared, is reported without a p-value.
//!
//! Entry point: `run_analysis()`, also exposed to Python.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use indicatif::{ProgressBar, ProgressStyle};
use log::{debug, info, warn};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rayon::prelude::*;

use crate::cache::ScoreCache;
use crate::config::{Config, IndelMethod, SignatureMethod, SiteWeightConfig};
use crate::correction::{correct, ElementResult};
use crate::groups::{group_results, load_groups, GeneGroups};
use crate::indels::{is_frameshift, strategy_from_config, IndelContext, IndelStrategy};
use crate::io::require_file;
use crate::mutations::{map_mutations, read_blacklist, read_mutations, CohortCounts, Mutation, MutationType};
use crate::observed::{MutationStatisticsBuilder, ObservedStatistics};
use crate::reference::{FastaGenome, GenomeSequence, GenomeSource};
use crate::regions::{read_regions, Element, RegionTree, Regions};
use crate::sampling::{
    schedule, BackgroundInputs, EventOdds, PartialCounts, SamplingParams, SamplingPlan, SamplingState, SamplingStatus,
};
use crate::scores::{load_stop_scores, RangeQuery, RangeSource, ScoreIndex, ScoreLoader, TabixSource};
use crate::signature::SignatureTable;
use crate::site_weights::{SiteTrack, SiteWeights};
use crate::statistic::Statistic;
use crate::store::{check_row_count, load_symbols, write_background, write_results, OutputPaths};

// ============================================================================
// Collaborators
// ============================================================================

/// Factories of every external data source. Workers open their own handles.
#[derive(Clone)]
pub struct Sources {
    pub scores: Arc<dyn RangeSource>,
    pub genome: Option<Arc<dyn GenomeSource>>,
    pub stops: Option<Arc<dyn RangeSource>>,
    pub depth: Option<Arc<dyn RangeSource>>,
    pub mutability: Option<Arc<dyn RangeSource>>,
}

impl Sources {
    pub fn new(scores: Arc<dyn RangeSource>) -> Self {
        Self { scores, genome: None, stops: None, depth: None, mutability: None }
    }

    /// Tabix and FASTA sources named by the configuration.
    pub fn from_config(config: &Config) -> Self {
        let tabix = |path: &Path| -> Arc<dyn RangeSource> { Arc::new(TabixSource::new(path)) };
        let track = |cfg: &SiteWeightConfig| if cfg.adjusting { cfg.file.as_deref().map(tabix) } else { None };
        Self {
            scores: tabix(&config.score.file),
            genome: config.genome.fasta.as_deref().map(|p| Arc::new(FastaGenome::new(p)) as Arc<dyn GenomeSource>),
            stops: config.statistic.indels.stops_file.as_deref().map(tabix),
            depth: track(&config.depth),
            mutability: track(&config.mutability),
        }
    }
}

fn progress_bar(len: u64, silent: bool) -> ProgressBar {
    if silent {
        return ProgressBar::hidden();
    }
    let pb = ProgressBar::new(len);
    let style = ProgressStyle::default_bar()
        .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta})")
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("#>-");
    pb.set_style(style);
    pb.enable_steady_tick(Duration::from_millis(100));
    pb
}

/// Cohort-wide indel odds, or `None` when they must be derived per element.
fn cohort_odds(config: &Config, counts: &CohortCounts) -> Option<EventOdds> {
    let indels = &config.statistic.indels;
    if !indels.include {
        return Some(EventOdds::substitutions_only());
    }
    if indels.gene_exomic_frameshift_ratio {
        return None;
    }
    let mnps = if config.statistic.discard_mnp { 0 } else { counts.mnps };
    EventOdds::from_counts(counts.frameshift_indels, counts.subs + mnps + counts.inframe_indels)
}

// ============================================================================
// Element preparation
// ============================================================================

struct PreparedElement {
    element_id: String,
    stats: ObservedStatistics,
    plan: Option<SamplingPlan>,
    /// Time spent preparing, charged against the element's time budget
    elapsed: Duration,
}

fn expired(deadline: Option<Instant>) -> bool {
    deadline.is_some_and(|d| Instant::now() >= d)
}

/// Read-only state shared by every preparation unit.
struct ElementJob<'a> {
    config: &'a Config,
    sources: &'a Sources,
    signature: Option<&'a SignatureTable>,
    strategy: Option<&'a dyn IndelStrategy>,
    cohort_odds: Option<EventOdds>,
    cache: Option<&'a ScoreCache>,
}

impl<'a> ElementJob<'a> {
    fn load_index(&self, element: &Element, genome: Option<&dyn GenomeSequence>) -> Result<ScoreIndex> {
        if let Some(index) = self.cache.and_then(|c| c.load(element, self.config)) {
            return Ok(index);
        }
        let query = self.sources.scores.open()?;
        let index = ScoreLoader::new(&self.config.score, query, genome, self.signature).load(element);
        if let Some(cache) = self.cache {
            if let Err(e) = cache.store(element, self.config, &index) {
                warn!("{}: score index not cached: {:#}", element.id, e);
            }
        }
        Ok(index)
    }

    fn site_track(&self, element: &Element, cfg: &SiteWeightConfig, source: Option<&Arc<dyn RangeSource>>) -> Result<Option<SiteTrack>> {
        match (cfg.adjusting, source) {
            (true, Some(source)) => {
                let mut query = source.open()?;
                Ok(Some(SiteTrack::load(element, &mut *query, cfg)))
            }
            _ => Ok(None),
        }
    }

    fn event_odds(&self, stats: &ObservedStatistics) -> EventOdds {
        if self.strategy.is_none() {
            return EventOdds::substitutions_only();
        }
        if let Some(odds) = self.cohort_odds {
            return odds;
        }
        let frameshift = stats.scored_indels - stats.scored_inframe;
        let subs = stats.scored_subs + stats.scored_mnps + stats.scored_inframe;
        EventOdds::from_counts(frameshift, subs).unwrap_or_else(EventOdds::substitutions_only)
    }

    fn prepare(
        &self,
        element: &Element,
        mutations: &[Mutation],
        seed: u64,
        deadline: Option<Instant>,
    ) -> Result<Option<PreparedElement>> {
        let config = self.config;
        let started = Instant::now();
        let prepared = |stats: ObservedStatistics, plan: Option<SamplingPlan>| PreparedElement {
            element_id: element.id.clone(),
            stats,
            plan,
            elapsed: started.elapsed(),
        };
        let genome = self.sources.genome.as_ref().map(|g| g.open()).transpose()?;
        let index = self.load_index(element, genome.as_deref())?;
        if index.is_empty() {
            warn!("{}: no scores found for the element", element.id);
        }

        let stop_scores = match self.strategy {
            Some(s) if s.method() == IndelMethod::Stop => {
                let mut stops = self.sources.stops.as_ref().map(|s| s.open()).transpose()?;
                let stops = stops.as_mut().map(|q| &mut **q as &mut dyn RangeQuery);
                load_stop_scores(element, &index, stops, &config.statistic.indels, &config.score.chr_prefix)
            }
            _ => Vec::new(),
        };

        let indel_ctx = match (self.strategy, genome.as_deref()) {
            (Some(_), Some(genome)) => Some(IndelContext {
                index: &index,
                genome,
                reverse: element.strand.is_reverse(),
                stop_scores: &stop_scores,
            }),
            _ => None,
        };

        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        let builder = MutationStatisticsBuilder { config: &config.statistic, indels: self.strategy };
        let Some(stats) = builder.build(mutations, &index, indel_ctx.as_ref(), &mut rng) else {
            return Ok(None);
        };
        if !stats.is_scored() {
            debug!("{}: none of {} mutations could be scored", element.id, mutations.len());
            return Ok(Some(prepared(stats, None)));
        }
        if expired(deadline) {
            warn!("{}: timed out while loading scores, not sampled", element.id);
            return Ok(Some(prepared(stats, None)));
        }

        let frame_length = config.statistic.indels.frame_length();
        let indel_scores = match (self.strategy, indel_ctx.as_ref()) {
            (Some(strategy), Some(ctx)) => {
                let observed: Vec<&Mutation> = stats
                    .mutations
                    .iter()
                    .map(|s| &s.inner)
                    .filter(|m| m.kind() == MutationType::Indel && is_frameshift(m.indel_size(), frame_length))
                    .collect();
                strategy.background(ctx, &observed)
            }
            _ => Vec::new(),
        };

        let site_weights = SiteWeights {
            depth: self.site_track(element, &config.depth, self.sources.depth.as_ref())?,
            mutability: self.site_track(element, &config.mutability, self.sources.mutability.as_ref())?,
        };
        let inputs = BackgroundInputs {
            index: &index,
            signature: self.signature,
            site_weights: &site_weights,
            indel_scores: &indel_scores,
            odds: self.event_odds(&stats),
        };
        if expired(deadline) {
            warn!("{}: timed out while building the background, not sampled", element.id);
            return Ok(Some(prepared(stats, None)));
        }
        let plan = SamplingPlan::build(
            &element.id,
            &stats,
            &inputs,
            Statistic::from(config.statistic.method),
            config.statistic.per_sample_analysis,
        );
        match plan {
            Ok(plan) => Ok(Some(prepared(stats, Some(plan)))),
            Err(e) => {
                warn!("{}: not sampled: {:#}", element.id, e);
                Ok(Some(prepared(stats, None)))
            }
        }
    }
}

// ============================================================================
// Sampling waves
// ============================================================================

struct Tracker {
    element_id: String,
    stats: ObservedStatistics,
    plan: SamplingPlan,
    state: SamplingState,
    deadline: Option<Instant>,
    pending: Option<u64>,
}

fn run_waves(trackers: &mut [Tracker], params: &SamplingParams, master: &mut ChaCha8Rng, silent: bool) {
    let mut iteration = 0;
    loop {
        let mut tasks: Vec<(usize, u64, u64)> = Vec::new();
        for (i, t) in trackers.iter().enumerate() {
            if let Some(size) = t.pending {
                for part in schedule(size, t.plan.width() as u64, params.chunk_cells) {
                    tasks.push((i, part, master.gen::<u64>()));
                }
            }
        }
        if tasks.is_empty() {
            break;
        }
        iteration += 1;
        let active = trackers.iter().filter(|t| t.pending.is_some()).count();
        info!("Parallel sampling. Iteration {}, elements {}, partitions {}", iteration, active, tasks.len());

        let pb = progress_bar(tasks.len() as u64, silent);
        let shared: &[Tracker] = trackers;
        let partials: Vec<(usize, PartialCounts)> = tasks
            .par_iter()
            .map(|&(i, size, seed)| {
                let t = &shared[i];
                let partial = t.plan.run_partition(size, seed, t.deadline);
                pb.inc(1);
                (i, partial)
            })
            .collect();
        pb.finish_and_clear();

        for (i, partial) in partials {
            trackers[i].state.absorb(partial);
        }
        let now = Instant::now();
        for t in trackers.iter_mut().filter(|t| t.pending.is_some()) {
            let timed_out = t.deadline.is_some_and(|d| now >= d);
            t.pending = t.state.next_round(params, timed_out);
            if timed_out && t.state.status == SamplingStatus::BudgetExhausted {
                warn!("{}: sampling timed out after {} replicates", t.element_id, t.state.sampling_size());
            }
        }
    }
}

/// Observed statistics and empirical p-values of every mutated element.
/// Results are not corrected for multiple testing.
pub fn analyze(
    config: &Config,
    sources: &Sources,
    signature: Option<&SignatureTable>,
    regions: &Regions,
    mutations: &BTreeMap<String, Vec<Mutation>>,
) -> Result<Vec<ElementResult>> {
    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(config.settings.cores.unwrap_or(0))
        .build()
        .context("Failed to build worker pool")?;
    pool.install(|| analyze_in_pool(config, sources, signature, regions, mutations))
}

fn analyze_in_pool(
    config: &Config,
    sources: &Sources,
    signature: Option<&SignatureTable>,
    regions: &Regions,
    mutations: &BTreeMap<String, Vec<Mutation>>,
) -> Result<Vec<ElementResult>> {
    let settings = &config.settings;
    let indel_cfg = &config.statistic.indels;
    let strategy = indel_cfg.include.then(|| strategy_from_config(indel_cfg));
    if strategy.is_some() && sources.genome.is_none() {
        warn!("Indels are included but no reference genome is available; indels will not be scored");
    }

    let counts = CohortCounts::count(mutations, indel_cfg.frame_length());
    let odds = cohort_odds(config, &counts);
    info!(
        "Cohort: {} substitutions, {} MNPs, {} frameshift and {} in-frame indels",
        counts.subs, counts.mnps, counts.frameshift_indels, counts.inframe_indels
    );
    match odds {
        Some(o) => info!("Indel odds: p_subs={:.4}, p_indels={:.4}", o.p_subs, o.p_indels),
        None => info!("Indel odds derived per element"),
    }

    let cache = settings.cache_dir.as_deref().map(ScoreCache::new).transpose()?;
    let job = ElementJob {
        config,
        sources,
        signature,
        strategy: strategy.as_deref(),
        cohort_odds: odds,
        cache: cache.as_ref(),
    };

    let mut master = match settings.seed {
        Some(seed) => ChaCha8Rng::seed_from_u64(seed),
        None => ChaCha8Rng::from_entropy(),
    };
    let work: Vec<(&Element, &[Mutation], u64)> = mutations
        .iter()
        .filter_map(|(id, muts)| match regions.get(id) {
            Some(element) => Some((element, muts.as_slice(), master.gen::<u64>())),
            None => {
                warn!("{}: mutations mapped to an unknown element", id);
                None
            }
        })
        .collect();

    // 1. Observed statistics and sampling plans
    info!("Computing observed statistics of {} elements", work.len());
    let timeout = settings.element_timeout_secs.map(Duration::from_secs);
    let pb = progress_bar(work.len() as u64, settings.silent);
    let prepared: Vec<PreparedElement> = work
        .par_iter()
        .filter_map(|(element, muts, seed)| {
            let deadline = timeout.map(|d| Instant::now() + d);
            let out = match job.prepare(element, muts, *seed, deadline) {
                Ok(p) => p,
                Err(e) => {
                    warn!("{}: element skipped: {:#}", element.id, e);
                    None
                }
            };
            pb.inc(1);
            out
        })
        .collect();
    pb.finish_and_clear();

    // 2. Sampling rounds
    let params = SamplingParams::from(&config.statistic);
    let mut results = Vec::new();
    let mut trackers = Vec::new();
    for p in prepared {
        match p.plan {
            Some(plan) => {
                let mut state = SamplingState::default();
                let pending = Some(state.start(&params));
                trackers.push(Tracker {
                    element_id: p.element_id,
                    stats: p.stats,
                    plan,
                    state,
                    // The time budget covers preparation and sampling
                    deadline: timeout.map(|d| Instant::now() + d.saturating_sub(p.elapsed)),
                    pending,
                });
            }
            None => results.push(ElementResult::unsampled(&p.element_id, &p.stats)),
        }
    }
    run_waves(&mut trackers, &params, &mut master, settings.silent);

    let exhausted = trackers.iter().filter(|t| t.state.status == SamplingStatus::BudgetExhausted).count();
    info!("Sampled {} elements, {} reached the sampling budget", trackers.len(), exhausted);
    for t in trackers {
        let observed = t.plan.observed;
        results.push(ElementResult::sampled(&t.element_id, &t.stats, observed, t.state));
    }
    Ok(results)
}

/// Corrected element rows and, when groups are given, corrected group rows.
/// Groups are corrected together with the elements but only group rows are
/// returned in the second table.
pub fn finalize(
    results: Vec<ElementResult>,
    groups: Option<&GeneGroups>,
    min_samples_for_significance: usize,
) -> (Vec<ElementResult>, Vec<ElementResult>) {
    let group_rows = match groups {
        Some(groups) => {
            let mut combined = group_results(groups, &results);
            info!("Computed {} gene groups", combined.len());
            combined.extend(results.iter().cloned());
            correct(combined, min_samples_for_significance).into_iter().filter(|r| r.is_group()).collect()
        }
        None => Vec::new(),
    };
    (correct(results, min_samples_for_significance), group_rows)
}

fn attach_symbols(results: &mut [ElementResult], symbols: &HashMap<String, String>) {
    for r in results {
        r.symbol = symbols.get(&r.element_id).cloned();
    }
}

// ============================================================================
// Entry point
// ============================================================================

/// Full run from input files to result tables. Returns the path of the
/// result table, or `None` when no element produced a result.
pub fn run_analysis(
    config: &Config,
    mutations_file: &Path,
    regions_file: &Path,
    output_dir: &Path,
    blacklist_file: Option<&Path>,
) -> Result<Option<PathBuf>> {
    let start = Instant::now();
    config.validate()?;
    require_file(mutations_file, "Mutations file")?;
    require_file(regions_file, "Regions file")?;
    config.check_inputs()?;

    let regions = read_regions(regions_file)?;
    let blacklist = match blacklist_file {
        Some(p) => read_blacklist(p)?,
        None => HashSet::new(),
    };
    let signature = match (config.signature.method, &config.signature.path) {
        (SignatureMethod::File, Some(p)) => Some(SignatureTable::load(p)?),
        _ => None,
    };
    let groups = match (&config.grouping.json_file, config.grouping.group_genes) {
        (Some(p), true) => Some(load_groups(p)?),
        _ => None,
    };
    let symbols = config.symbols_file.as_deref().map(load_symbols).transpose()?;

    let mutations = read_mutations(mutations_file, &config.signature.classifier, &blacklist)?;
    let tree = RegionTree::build(&regions);
    let by_element = map_mutations(&mutations, &regions, &tree);
    info!("{} of {} elements carry mutations", by_element.len(), regions.len());

    let sources = Sources::from_config(config);
    let mut results = analyze(config, &sources, signature.as_ref(), &regions, &by_element)?;
    if results.is_empty() {
        warn!("Empty result set: no element could be analysed");
        return Ok(None);
    }
    if let Some(symbols) = &symbols {
        attach_symbols(&mut results, symbols);
    }

    let (elements, group_rows) = finalize(results, groups.as_ref(), config.settings.min_samples_for_significance);
    let paths = OutputPaths::new(output_dir, mutations_file);
    write_results(&paths.results, &elements, false)?;
    check_row_count(&paths.results, elements.len())?;
    if config.settings.store_background {
        write_background(&paths.background, &elements)?;
    }
    if groups.is_some() {
        write_results(&paths.groups, &group_rows, true)?;
        info!("Group results written to {:?}", paths.groups);
    }

    info!("Analysis of {} elements done in {:.1}s: {:?}", elements.len(), start.elapsed().as_secs_f64(), paths.results);
    Ok(Some(paths.results))
}
