//! Trial loop, per-run buffers and the chunk/merge contract.
//!
//! A chunk covers any sub-range of run indices. Because every trial seeds itself from
//! `(seed, combo_index, run_index)` alone, merging the chunks of any partition yields the
//! same buffers as one pass over the whole range.

use std::cmp::Ordering;
use std::ops::Range;
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::thread;

use log::{debug, info, warn};
use serde::Serialize;

use super::care::{
    CareAdjustment, PersonState, advance_care_year, household_adjustment, roll_survival,
};
use super::data::MarketHistory;
use super::guardrail::GuardrailEngine;
use super::rng::{Rng, Stream, run_seed};
use super::sampler::MarketSampler;
use super::types::SimConfig;
use super::year::{SimulationState, YearLog, simulate_year};

pub const HEATMAP_YEARS: usize = 10;
pub const HEATMAP_BINS: usize = 11;
/// Upper bounds of withdrawal-rate bins 0..=9; the last bin is open-ended.
const HEATMAP_UPPER_EDGES: [f64; HEATMAP_BINS - 1] =
    [3.0, 3.5, 4.0, 4.5, 5.0, 5.5, 6.0, 7.0, 8.0, 10.0];

pub const QUOTE_THRESHOLD_PCT: f64 = 4.5;
/// Withdrawal rate below which a run counts as recovered after a stress window.
const RECOVERY_QUOTE_PCT: f64 = 3.5;
const CUT_YEAR_THRESHOLD_PCT: f64 = 10.0;
const DEPLETION_THRESHOLD: f64 = 100.0;
const SAMPLE_EVERY: u32 = 100;
pub const AGE_NOT_DEPLETED: u8 = 255;
/// Earliest start year that still leaves four prior years for the price window.
pub const MIN_START_INDEX: usize = 4;

pub type Heatmap = [[u32; HEATMAP_BINS]; HEATMAP_YEARS];

/// Bin for a withdrawal rate. An infinite rate (wealth exhausted) lands in the open-ended
/// last bin; NaN and negative rates have no bin.
pub fn heatmap_bin(rate_pct: f64) -> Option<usize> {
    if rate_pct.is_nan() || rate_pct < 0.0 {
        return None;
    }
    let bin = HEATMAP_UPPER_EDGES
        .iter()
        .position(|edge| rate_pct < *edge)
        .unwrap_or(HEATMAP_BINS - 1);
    Some(bin)
}

/// Per-run figures for the stress window at the start of the trial.
#[derive(Copy, Clone, Debug, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StressKpis {
    pub window_years: u32,
    pub max_drawdown_pct: f64,
    /// Share of the window's years with a withdrawal rate above 4.5%, in percent.
    pub quote_above_threshold_pct: f64,
    pub cut_years: u32,
    /// 10th percentile of real withdrawals inside the window.
    pub p10_real_withdrawal: f64,
    /// Years after the window until the withdrawal rate first drops below 3.5%.
    pub recovery_years: u32,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunOutcome {
    pub final_wealth: f64,
    pub tax_paid: f64,
    pub failed: bool,
    /// Simulated years until death, ruin or the horizon.
    pub lifespan: u32,
    pub years_unfailed: u32,
    pub cut_years: u32,
    pub max_cut_pct: f64,
    /// Standard deviation of year-over-year real withdrawal changes, in percent.
    pub volatility_pct: f64,
    pub max_drawdown_pct: f64,
    pub min_runway_months: f64,
    pub depleted: bool,
    pub age_at_depletion: u8,
    pub care_triggered: [bool; 2],
    pub years_without_flex: u32,
    pub nan_clamps: u32,
    /// `None` when the trial ran unstressed.
    pub stress: Option<StressKpis>,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct McTotals {
    pub fail_count: u32,
    pub care_triggered_count: u32,
    pub partner_care_triggered_count: u32,
    pub total_simulated_years: u64,
    pub years_quote_above_threshold: u64,
    pub ruin_with_care: u32,
    pub ruin_without_care: u32,
    pub nan_clamps: u64,
}

impl McTotals {
    pub fn add(&mut self, other: &McTotals) {
        self.fail_count += other.fail_count;
        self.care_triggered_count += other.care_triggered_count;
        self.partner_care_triggered_count += other.partner_care_triggered_count;
        self.total_simulated_years += other.total_simulated_years;
        self.years_quote_above_threshold += other.years_quote_above_threshold;
        self.ruin_with_care += other.ruin_with_care;
        self.ruin_without_care += other.ruin_without_care;
        self.nan_clamps += other.nan_clamps;
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WorstRun {
    pub final_wealth: f64,
    pub combo_index: u32,
    pub run_index: u32,
}

impl WorstRun {
    fn cmp_key(&self, other: &WorstRun) -> Ordering {
        self.final_wealth
            .total_cmp(&other.final_wealth)
            .then(self.combo_index.cmp(&other.combo_index))
            .then(self.run_index.cmp(&other.run_index))
    }

    fn min(a: Option<WorstRun>, b: Option<WorstRun>) -> Option<WorstRun> {
        match (a, b) {
            (Some(a), Some(b)) => Some(if b.cmp_key(&a) == Ordering::Less { b } else { a }),
            (a, b) => a.or(b),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WithdrawalSample {
    pub run_index: u32,
    pub real_withdrawals: Vec<f64>,
}

/// Aggregates for the run range `[offset, offset + runs.len())`.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct McBuffers {
    pub offset: u32,
    /// One slot per run; `None` for runs not executed (cancelled).
    pub runs: Vec<Option<RunOutcome>>,
    pub heatmap: Heatmap,
    pub totals: McTotals,
    pub real_withdrawal_samples: Vec<WithdrawalSample>,
    pub care_entry_ages: Vec<u32>,
    pub worst: Option<WorstRun>,
    pub completed: u32,
}

impl McBuffers {
    pub fn new(range: Range<u32>) -> Self {
        Self {
            offset: range.start,
            runs: vec![None; range.len()],
            heatmap: [[0; HEATMAP_BINS]; HEATMAP_YEARS],
            totals: McTotals::default(),
            real_withdrawal_samples: Vec::new(),
            care_entry_ages: Vec::new(),
            worst: None,
            completed: 0,
        }
    }

    pub fn outcomes(&self) -> impl Iterator<Item = &RunOutcome> {
        self.runs.iter().flatten()
    }

    fn record(&mut self, run_index: u32, combo_index: u32, trial: TrialRecord) {
        let outcome = trial.outcome;
        for (year, log) in trial
            .logs
            .iter()
            .take(outcome.years_unfailed as usize)
            .take(HEATMAP_YEARS)
            .enumerate()
        {
            if let Some(bin) = heatmap_bin(log.withdrawal_rate_pct) {
                self.heatmap[year][bin] += 1;
            }
        }

        let any_care = outcome.care_triggered.iter().any(|t| *t);
        let totals = &mut self.totals;
        totals.fail_count += u32::from(outcome.failed);
        totals.care_triggered_count += u32::from(any_care);
        totals.partner_care_triggered_count += u32::from(outcome.care_triggered[1]);
        totals.total_simulated_years += u64::from(outcome.lifespan);
        totals.years_quote_above_threshold += trial
            .logs
            .iter()
            .take(outcome.years_unfailed as usize)
            .filter(|log| log.withdrawal_rate_pct > QUOTE_THRESHOLD_PCT)
            .count() as u64;
        totals.ruin_with_care += u32::from(outcome.failed && any_care);
        totals.ruin_without_care += u32::from(outcome.failed && !any_care);
        totals.nan_clamps += u64::from(outcome.nan_clamps);

        if run_index % SAMPLE_EVERY == 0 {
            self.real_withdrawal_samples.push(WithdrawalSample {
                run_index,
                real_withdrawals: trial.logs.iter().map(|log| log.real_withdrawal).collect(),
            });
        }
        self.care_entry_ages.extend(trial.care_entry_ages);
        self.worst = WorstRun::min(
            self.worst,
            Some(WorstRun {
                final_wealth: outcome.final_wealth,
                combo_index,
                run_index,
            }),
        );

        let slot = (run_index - self.offset) as usize;
        self.runs[slot] = Some(outcome);
        self.completed += 1;
    }
}

struct TrialRecord {
    outcome: RunOutcome,
    logs: Vec<YearLog>,
    care_entry_ages: Vec<u32>,
}

/// One deterministic trial with its full year log.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TrialTrace {
    pub combo_index: u32,
    pub run_index: u32,
    pub start_year: u32,
    pub outcome: RunOutcome,
    pub years: Vec<YearLog>,
    pub care_entry_ages: Vec<u32>,
}

fn start_index(history: &MarketHistory, rng: &mut Rng) -> usize {
    MIN_START_INDEX + rng.next_index(history.len().saturating_sub(MIN_START_INDEX))
}

fn run_trial(
    cfg: &SimConfig,
    sampler: &MarketSampler<'_>,
    guardrail: &dyn GuardrailEngine,
    combo_index: u32,
    run_index: u32,
) -> (usize, TrialRecord) {
    let seed = run_seed(cfg.seed, combo_index, run_index);
    let mut market_rng = Rng::for_stream(seed, Stream::Market);
    let mut person_rngs = [
        Rng::for_stream(seed, Stream::Person1),
        Rng::for_stream(seed, Stream::Person2),
    ];

    let history = sampler.history();
    let start = start_index(history, &mut market_rng);
    let mut sampler_state = sampler.start_state(start);
    let mut state = SimulationState::new(cfg, history, start);
    let mut persons = [
        Some(PersonState::new(cfg.person1)),
        cfg.person2.map(PersonState::new),
    ];

    let mut logs = Vec::with_capacity(cfg.max_years as usize);
    let mut care_entry_ages = Vec::new();
    let mut failed = false;
    let mut years_unfailed = 0_u32;
    let mut depletion_year = None;
    let mut peak_real_wealth = state.portfolio.total_wealth();
    let mut max_drawdown_pct = 0.0_f64;

    for year_index in 0..cfg.max_years {
        for (person, rng) in persons.iter_mut().zip(person_rngs.iter_mut()) {
            if let Some(p) = person {
                let was_triggered = p.care.triggered;
                advance_care_year(p, &cfg.care, state.floor, state.cumulative_inflation, rng);
                if !was_triggered && p.care.triggered {
                    care_entry_ages.push(p.care.entry_age);
                }
            }
        }
        let adjustment = match &persons {
            [Some(first), second] => household_adjustment(first, second.as_ref(), &cfg.care),
            _ => CareAdjustment::default(),
        };

        let market = sampler.sample(&mut sampler_state, &mut market_rng);
        let outcome = simulate_year(state, cfg, &market, year_index, &adjustment, guardrail);
        let ruin = outcome.is_ruin();
        let step = outcome.into_step();
        state = step.state;
        logs.push(step.log);

        if ruin {
            failed = true;
        } else if !failed {
            years_unfailed += 1;
        }
        if depletion_year.is_none() && step.log.depot_value < DEPLETION_THRESHOLD {
            depletion_year = Some(year_index);
        }
        let real_wealth = state.portfolio.total_wealth() / state.cumulative_inflation;
        peak_real_wealth = peak_real_wealth.max(real_wealth);
        if peak_real_wealth > 0.0 {
            max_drawdown_pct = max_drawdown_pct.max((1.0 - real_wealth / peak_real_wealth) * 100.0);
        }

        if ruin && cfg.break_on_ruin {
            break;
        }
        let mut anyone_alive = false;
        for (person, rng) in persons.iter_mut().zip(person_rngs.iter_mut()) {
            if let Some(p) = person {
                anyone_alive |= roll_survival(p, &cfg.care, rng);
            }
        }
        if !anyone_alive {
            break;
        }
    }

    if state.nan_clamps > 0 {
        warn!(
            "run {run_index} (combo {combo_index}): clamped {} non-finite values to zero",
            state.nan_clamps
        );
    }

    let outcome = RunOutcome {
        final_wealth: state.portfolio.total_wealth(),
        tax_paid: logs.iter().map(|log| log.tax_paid).sum(),
        failed,
        lifespan: logs.len() as u32,
        years_unfailed,
        cut_years: logs
            .iter()
            .filter(|log| log.cut_pct > CUT_YEAR_THRESHOLD_PCT)
            .count() as u32,
        max_cut_pct: logs.iter().map(|log| log.cut_pct).fold(0.0, f64::max),
        volatility_pct: withdrawal_volatility_pct(&logs),
        max_drawdown_pct,
        min_runway_months: logs
            .iter()
            .map(|log| log.runway_months)
            .reduce(f64::min)
            .unwrap_or(0.0),
        depleted: depletion_year.is_some(),
        age_at_depletion: depletion_year.map_or(AGE_NOT_DEPLETED, |year| {
            (cfg.person1.start_age + year).min(u32::from(AGE_NOT_DEPLETED) - 1) as u8
        }),
        care_triggered: persons.map(|p| p.is_some_and(|p| p.care.triggered)),
        years_without_flex: logs
            .iter()
            .filter(|log| log.flex_need > 0.0 && log.flex_rate_pct <= 0.0)
            .count() as u32,
        nan_clamps: state.nan_clamps,
        stress: stress_kpis(&logs[..years_unfailed as usize], sampler.stress_years()),
    };

    (
        start,
        TrialRecord {
            outcome,
            logs,
            care_entry_ages,
        },
    )
}

/// Stress figures over the unfailed years of a trial. Mirrors the run-level KPIs but is
/// limited to the first `window` years.
fn stress_kpis(unfailed: &[YearLog], window: u32) -> Option<StressKpis> {
    if window == 0 {
        return None;
    }
    let in_window = &unfailed[..unfailed.len().min(window as usize)];
    let wealth: Vec<f64> = in_window.iter().map(|log| log.total_wealth).collect();
    let mut real_withdrawals: Vec<f64> = in_window.iter().map(|log| log.real_withdrawal).collect();
    let above = in_window
        .iter()
        .filter(|log| log.withdrawal_rate_pct > QUOTE_THRESHOLD_PCT)
        .count();
    let recovery_years = unfailed
        .iter()
        .skip(window as usize)
        .position(|log| log.withdrawal_rate_pct < RECOVERY_QUOTE_PCT)
        .map_or(window, |offset| offset as u32 + 1);

    Some(StressKpis {
        window_years: window,
        max_drawdown_pct: series_max_drawdown_pct(&wealth),
        quote_above_threshold_pct: above as f64 / window as f64 * 100.0,
        cut_years: in_window
            .iter()
            .filter(|log| log.cut_pct > CUT_YEAR_THRESHOLD_PCT)
            .count() as u32,
        p10_real_withdrawal: percentile(&mut real_withdrawals, 10.0),
        recovery_years,
    })
}

fn series_max_drawdown_pct(values: &[f64]) -> f64 {
    let mut peak = f64::MIN;
    let mut max_drawdown = 0.0_f64;
    for value in values {
        peak = peak.max(*value);
        if peak > 0.0 {
            max_drawdown = max_drawdown.max((1.0 - value / peak) * 100.0);
        }
    }
    max_drawdown
}

fn withdrawal_volatility_pct(logs: &[YearLog]) -> f64 {
    let changes: Vec<f64> = logs
        .windows(2)
        .filter(|pair| pair[0].real_withdrawal > 0.0)
        .map(|pair| (pair[1].real_withdrawal / pair[0].real_withdrawal - 1.0) * 100.0)
        .collect();
    if changes.len() < 2 {
        return 0.0;
    }
    let n = changes.len() as f64;
    let mean = changes.iter().sum::<f64>() / n;
    let variance = changes.iter().map(|c| (c - mean).powi(2)).sum::<f64>() / n;
    variance.sqrt()
}

/// Runs the trials in `runs` for one parameter combination. Cancellation is checked before
/// each trial; everything completed so far stays valid and mergeable.
pub fn run_chunk(
    cfg: &SimConfig,
    history: &MarketHistory,
    guardrail: &dyn GuardrailEngine,
    combo_index: u32,
    runs: Range<u32>,
    cancel: Option<&AtomicBool>,
) -> McBuffers {
    let sampler = MarketSampler::new(history, cfg.sampler, cfg.block_size, cfg.stress);
    let mut buffers = McBuffers::new(runs.clone());
    for run_index in runs.clone() {
        if cancel.is_some_and(|flag| flag.load(AtomicOrdering::Relaxed)) {
            debug!("chunk {runs:?} cancelled after {} trials", buffers.completed);
            break;
        }
        let (_, trial) = run_trial(cfg, &sampler, guardrail, combo_index, run_index);
        buffers.record(run_index, combo_index, trial);
    }
    debug!(
        "chunk {runs:?} (combo {combo_index}): {} trials, {} failed",
        buffers.completed, buffers.totals.fail_count
    );
    buffers
}

pub fn run_monte_carlo(
    cfg: &SimConfig,
    history: &MarketHistory,
    guardrail: &dyn GuardrailEngine,
) -> McBuffers {
    run_chunk(cfg, history, guardrail, 0, 0..cfg.runs, None)
}

/// Splits the run range over scoped worker threads and merges the chunks.
pub fn run_parallel(
    cfg: &SimConfig,
    history: &MarketHistory,
    guardrail: &dyn GuardrailEngine,
    combo_index: u32,
    workers: usize,
    cancel: Option<&AtomicBool>,
) -> McBuffers {
    let workers = workers.clamp(1, cfg.runs.max(1) as usize) as u32;
    let per_worker = cfg.runs.div_ceil(workers);
    let ranges: Vec<Range<u32>> = (0..workers)
        .map(|w| (w * per_worker).min(cfg.runs)..((w + 1) * per_worker).min(cfg.runs))
        .filter(|r| !r.is_empty())
        .collect();

    let parts: Vec<McBuffers> = thread::scope(|scope| {
        let handles: Vec<_> = ranges
            .into_iter()
            .map(|range| {
                scope.spawn(move || run_chunk(cfg, history, guardrail, combo_index, range, cancel))
            })
            .collect();
        handles
            .into_iter()
            .map(|h| h.join().unwrap_or_else(|panic| std::panic::resume_unwind(panic)))
            .collect()
    });

    let merged = merge_buffers(cfg.runs, parts);
    info!(
        "monte carlo: {} of {} trials on {workers} workers, {} failed",
        merged.completed, cfg.runs, merged.totals.fail_count
    );
    merged
}

/// Places per-run slots at their offsets, sums heatmaps and totals, concatenates lists in
/// run order and keeps the overall worst run.
pub fn merge_buffers(total_runs: u32, mut parts: Vec<McBuffers>) -> McBuffers {
    parts.sort_by_key(|p| p.offset);
    let mut merged = McBuffers::new(0..total_runs);
    for part in parts {
        for (i, slot) in part.runs.into_iter().enumerate() {
            if let Some(target) = merged.runs.get_mut(part.offset as usize + i) {
                *target = slot;
            }
        }
        for (row, part_row) in merged.heatmap.iter_mut().zip(part.heatmap.iter()) {
            for (cell, count) in row.iter_mut().zip(part_row.iter()) {
                *cell += count;
            }
        }
        merged.totals.add(&part.totals);
        merged
            .real_withdrawal_samples
            .extend(part.real_withdrawal_samples);
        merged.care_entry_ages.extend(part.care_entry_ages);
        merged.worst = WorstRun::min(merged.worst, part.worst);
        merged.completed += part.completed;
    }
    merged
}

/// Replays one trial and keeps its year log.
pub fn trace_run(
    cfg: &SimConfig,
    history: &MarketHistory,
    guardrail: &dyn GuardrailEngine,
    combo_index: u32,
    run_index: u32,
) -> TrialTrace {
    let sampler = MarketSampler::new(history, cfg.sampler, cfg.block_size, cfg.stress);
    let (start, trial) = run_trial(cfg, &sampler, guardrail, combo_index, run_index);
    TrialTrace {
        combo_index,
        run_index,
        start_year: history.record(start).year,
        outcome: trial.outcome,
        years: trial.logs,
        care_entry_ages: trial.care_entry_ages,
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct McSummary {
    pub runs: u32,
    pub success_rate: f64,
    pub p10_final_wealth: f64,
    pub p50_final_wealth: f64,
    pub p90_final_wealth: f64,
    pub depletion_pct: f64,
    pub time_above_threshold_pct: f64,
    pub median_tax_paid: f64,
    pub median_lifespan: f64,
    pub median_cut_years: f64,
    pub p50_max_drawdown_pct: f64,
    pub worst5_max_drawdown_pct: f64,
    pub care_trigger_pct: f64,
    pub nan_clamps: u64,
    pub stress: Option<StressSummary>,
    pub totals: McTotals,
    pub worst: Option<WorstRun>,
    pub heatmap: Heatmap,
}

pub fn summarize(buffers: &McBuffers) -> McSummary {
    let outcomes: Vec<&RunOutcome> = buffers.outcomes().collect();
    let n = outcomes.len();
    let share = |count: usize| {
        if n == 0 {
            0.0
        } else {
            count as f64 / n as f64 * 100.0
        }
    };
    let column =
        |f: fn(&RunOutcome) -> f64| -> Vec<f64> { outcomes.iter().map(|o| f(o)).collect() };

    let mut final_wealth = column(|o| o.final_wealth);
    let mut tax = column(|o| o.tax_paid);
    let mut lifespan = column(|o| o.lifespan as f64);
    let mut cut_years = column(|o| o.cut_years as f64);
    let mut drawdown = column(|o| o.max_drawdown_pct);

    let totals = buffers.totals;
    McSummary {
        runs: n as u32,
        success_rate: share(n - totals.fail_count as usize),
        p10_final_wealth: percentile(&mut final_wealth, 10.0),
        p50_final_wealth: percentile(&mut final_wealth, 50.0),
        p90_final_wealth: percentile(&mut final_wealth, 90.0),
        depletion_pct: share(outcomes.iter().filter(|o| o.depleted).count()),
        time_above_threshold_pct: if totals.total_simulated_years > 0 {
            totals.years_quote_above_threshold as f64 / totals.total_simulated_years as f64
                * 100.0
        } else {
            0.0
        },
        median_tax_paid: percentile(&mut tax, 50.0),
        median_lifespan: percentile(&mut lifespan, 50.0),
        median_cut_years: percentile(&mut cut_years, 50.0),
        p50_max_drawdown_pct: percentile(&mut drawdown, 50.0),
        worst5_max_drawdown_pct: percentile(&mut drawdown, 95.0),
        care_trigger_pct: share(totals.care_triggered_count as usize),
        nan_clamps: totals.nan_clamps,
        stress: summarize_stress(&outcomes),
        totals,
        worst: buffers.worst,
        heatmap: buffers.heatmap,
    }
}

/// Medians of the per-run stress figures, plus the 90th percentile of the window drawdown.
#[derive(Copy, Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StressSummary {
    pub window_years: u32,
    pub p50_max_drawdown_pct: f64,
    pub p90_max_drawdown_pct: f64,
    pub p50_quote_above_threshold_pct: f64,
    pub p50_cut_years: f64,
    pub p50_p10_real_withdrawal: f64,
    pub p50_recovery_years: f64,
}

fn summarize_stress(outcomes: &[&RunOutcome]) -> Option<StressSummary> {
    let kpis: Vec<StressKpis> = outcomes.iter().filter_map(|o| o.stress).collect();
    let window_years = kpis.first()?.window_years;
    let column = |f: fn(&StressKpis) -> f64| -> Vec<f64> { kpis.iter().map(f).collect() };

    let mut drawdown = column(|k| k.max_drawdown_pct);
    Some(StressSummary {
        window_years,
        p50_max_drawdown_pct: percentile(&mut drawdown, 50.0),
        p90_max_drawdown_pct: percentile(&mut drawdown, 90.0),
        p50_quote_above_threshold_pct: percentile(
            &mut column(|k| k.quote_above_threshold_pct),
            50.0,
        ),
        p50_cut_years: percentile(&mut column(|k| k.cut_years as f64), 50.0),
        p50_p10_real_withdrawal: percentile(&mut column(|k| k.p10_real_withdrawal), 50.0),
        p50_recovery_years: percentile(&mut column(|k| k.recovery_years as f64), 50.0),
    })
}

pub fn percentile(values: &mut [f64], p: f64) -> f64 {
    if values.is_empty() {
        return 0.0;
    }

    values.sort_by(|a, b| a.total_cmp(b));

    let n = values.len();
    if n == 1 {
        return values[0];
    }

    let rank = (p / 100.0) * (n as f64 - 1.0);
    let lower = rank.floor() as usize;
    let upper = rank.ceil() as usize;

    if lower == upper {
        values[lower]
    } else {
        let w = rank - lower as f64;
        values[lower] * (1.0 - w) + values[upper] * w
    }
}
