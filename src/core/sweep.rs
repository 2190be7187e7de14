//! Cartesian parameter sweep over strategy settings.
//!
//! Each combination runs with `combo_index` equal to its position in the full grid, so a
//! sweep split into slices concatenates to exactly the unsplit result.

use log::{debug, warn};
use serde::Serialize;
use thiserror::Error;

use super::data::MarketHistory;
use super::guardrail::GuardrailEngine;
use super::monte_carlo::{percentile, run_chunk};
use super::types::{ConfigError, SimConfig, StrategyConfig};

pub const MAX_SWEEP_COMBINATIONS: usize = 300;

#[derive(Debug, Error, PartialEq)]
pub enum SweepError {
    #[error("invalid range '{input}': {reason}")]
    InvalidRange { input: String, reason: &'static str },
    #[error("range for {0} is empty")]
    EmptyRange(&'static str),
    #[error("sweep has {size} combinations; the limit is {limit}")]
    TooManyCombinations { size: usize, limit: usize },
    #[error(transparent)]
    Config(#[from] ConfigError),
}

fn invalid(input: &str, reason: &'static str) -> SweepError {
    SweepError::InvalidRange {
        input: input.to_string(),
        reason,
    }
}

fn parse_number(input: &str, piece: &str) -> Result<f64, SweepError> {
    piece
        .trim()
        .parse::<f64>()
        .ok()
        .filter(|v| v.is_finite())
        .ok_or_else(|| invalid(input, "not a number"))
}

/// Accepts `start:step:end`, `a,b,c` or a single value.
pub fn parse_range(input: &str) -> Result<Vec<f64>, SweepError> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return Err(invalid(input, "empty"));
    }

    if trimmed.contains(':') {
        let parts: Vec<&str> = trimmed.split(':').collect();
        let [start, step, end] = parts.as_slice() else {
            return Err(invalid(input, "expected start:step:end"));
        };
        let (start, step, end) = (
            parse_number(input, start)?,
            parse_number(input, step)?,
            parse_number(input, end)?,
        );
        if step <= 0.0 {
            return Err(invalid(input, "step must be positive"));
        }
        if start > end {
            return Err(invalid(input, "start exceeds end"));
        }
        let count = ((end - start) / step + 1e-9).floor() as usize + 1;
        if count > MAX_SWEEP_COMBINATIONS {
            return Err(SweepError::TooManyCombinations {
                size: count,
                limit: MAX_SWEEP_COMBINATIONS,
            });
        }
        return Ok((0..count).map(|i| start + i as f64 * step).collect());
    }

    trimmed
        .split(',')
        .map(|piece| parse_number(input, piece))
        .collect()
}

#[derive(Clone, Debug, PartialEq)]
pub struct SweepRanges {
    pub runway_min_months: Vec<f64>,
    pub runway_target_months: Vec<f64>,
    pub target_equity_pct: Vec<f64>,
    pub rebalance_band_pct: Vec<f64>,
    pub max_skim_pct: Vec<f64>,
    pub max_bear_refill_pct: Vec<f64>,
    pub gold_target_pct: Vec<f64>,
}

impl SweepRanges {
    /// Every dimension pinned to the base strategy's value.
    pub fn pinned(strategy: &StrategyConfig) -> Self {
        Self {
            runway_min_months: vec![strategy.runway_min_months],
            runway_target_months: vec![strategy.runway_target_months],
            target_equity_pct: vec![strategy.target_equity_pct],
            rebalance_band_pct: vec![strategy.rebalance_band_pct],
            max_skim_pct: vec![strategy.max_skim_pct],
            max_bear_refill_pct: vec![strategy.max_bear_refill_pct],
            gold_target_pct: vec![strategy.gold_target_pct],
        }
    }

    fn dimensions(&self) -> [(&'static str, &[f64]); 7] {
        [
            ("runwayMinMonths", self.runway_min_months.as_slice()),
            ("runwayTargetMonths", self.runway_target_months.as_slice()),
            ("targetEquityPct", self.target_equity_pct.as_slice()),
            ("rebalanceBandPct", self.rebalance_band_pct.as_slice()),
            ("maxSkimPct", self.max_skim_pct.as_slice()),
            ("maxBearRefillPct", self.max_bear_refill_pct.as_slice()),
            ("goldTargetPct", self.gold_target_pct.as_slice()),
        ]
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SweepParams {
    pub runway_min_months: f64,
    pub runway_target_months: f64,
    pub target_equity_pct: f64,
    pub rebalance_band_pct: f64,
    pub max_skim_pct: f64,
    pub max_bear_refill_pct: f64,
    pub gold_target_pct: f64,
}

impl SweepParams {
    pub fn apply(&self, base: &SimConfig) -> SimConfig {
        let mut cfg = *base;
        cfg.strategy.runway_min_months = self.runway_min_months;
        cfg.strategy.runway_target_months = self.runway_target_months;
        cfg.strategy.target_equity_pct = self.target_equity_pct;
        cfg.strategy.rebalance_band_pct = self.rebalance_band_pct;
        cfg.strategy.max_skim_pct = self.max_skim_pct;
        cfg.strategy.max_bear_refill_pct = self.max_bear_refill_pct;
        cfg.strategy.gold_target_pct = self.gold_target_pct;
        cfg
    }
}

/// Bounded cartesian product; the size is checked before anything is allocated.
pub fn build_grid(ranges: &SweepRanges, limit: usize) -> Result<Vec<SweepParams>, SweepError> {
    let mut size = 1_usize;
    for (name, values) in ranges.dimensions() {
        if values.is_empty() {
            return Err(SweepError::EmptyRange(name));
        }
        size = size.saturating_mul(values.len());
    }
    if size > limit {
        return Err(SweepError::TooManyCombinations { size, limit });
    }

    let mut grid = Vec::with_capacity(size);
    for &runway_min_months in &ranges.runway_min_months {
        for &runway_target_months in &ranges.runway_target_months {
            for &target_equity_pct in &ranges.target_equity_pct {
                for &rebalance_band_pct in &ranges.rebalance_band_pct {
                    for &max_skim_pct in &ranges.max_skim_pct {
                        for &max_bear_refill_pct in &ranges.max_bear_refill_pct {
                            for &gold_target_pct in &ranges.gold_target_pct {
                                grid.push(SweepParams {
                                    runway_min_months,
                                    runway_target_months,
                                    target_equity_pct,
                                    rebalance_band_pct,
                                    max_skim_pct,
                                    max_bear_refill_pct,
                                    gold_target_pct,
                                });
                            }
                        }
                    }
                }
            }
        }
    }
    Ok(grid)
}

#[derive(Copy, Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SweepMetrics {
    pub success_probability_pct: f64,
    pub p10_final_wealth: f64,
    pub median_final_wealth: f64,
    pub worst5_drawdown_pct: f64,
    pub median_lifespan: f64,
    pub fail_count: u32,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SweepCaseResult {
    pub combo_index: u32,
    pub params: SweepParams,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metrics: Option<SweepMetrics>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Value at `floor(n * q)` of the ascending-sorted values.
fn quantile_floor(sorted: &[f64], q: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let idx = ((sorted.len() as f64 * q).floor() as usize).min(sorted.len() - 1);
    sorted[idx]
}

fn sorted(mut values: Vec<f64>) -> Vec<f64> {
    values.sort_by(|a, b| a.total_cmp(b));
    values
}

/// Runs `grid` as the slice of a larger grid starting at `combo_offset`.
pub fn run_sweep_cases(
    base: &SimConfig,
    history: &MarketHistory,
    guardrail: &dyn GuardrailEngine,
    grid: &[SweepParams],
    combo_offset: u32,
) -> Vec<SweepCaseResult> {
    grid.iter()
        .enumerate()
        .map(|(i, params)| {
            let combo_index = combo_offset + i as u32;
            let cfg = params.apply(base);
            if let Err(err) = cfg.strategy.validate() {
                warn!("sweep combo {combo_index} rejected: {err}");
                return SweepCaseResult {
                    combo_index,
                    params: *params,
                    metrics: None,
                    error: Some(err.to_string()),
                };
            }

            let buffers = run_chunk(&cfg, history, guardrail, combo_index, 0..cfg.runs, None);
            let outcomes: Vec<_> = buffers.outcomes().copied().collect();
            let n = outcomes.len();
            let wealth = sorted(outcomes.iter().map(|o| o.final_wealth).collect());
            let drawdowns = sorted(outcomes.iter().map(|o| o.max_drawdown_pct).collect());
            let mut lifespans: Vec<f64> = outcomes.iter().map(|o| o.lifespan as f64).collect();
            let fail_count = buffers.totals.fail_count;
            debug!("sweep combo {combo_index}: {fail_count} of {n} trials failed");

            SweepCaseResult {
                combo_index,
                params: *params,
                metrics: Some(SweepMetrics {
                    success_probability_pct: if n == 0 {
                        0.0
                    } else {
                        (n - fail_count as usize) as f64 / n as f64 * 100.0
                    },
                    p10_final_wealth: quantile_floor(&wealth, 0.10),
                    median_final_wealth: quantile_floor(&wealth, 0.50),
                    worst5_drawdown_pct: quantile_floor(&drawdowns, 0.95),
                    median_lifespan: percentile(&mut lifespans, 50.0),
                    fail_count,
                }),
                error: None,
            }
        })
        .collect()
}

pub fn run_sweep(
    base: &SimConfig,
    history: &MarketHistory,
    guardrail: &dyn GuardrailEngine,
    ranges: &SweepRanges,
) -> Result<Vec<SweepCaseResult>, SweepError> {
    base.validate()?;
    let grid = build_grid(ranges, MAX_SWEEP_COMBINATIONS)?;
    Ok(run_sweep_cases(base, history, guardrail, &grid, 0))
}
