//! The spending/transaction policy seam. The year engine only talks to [`GuardrailEngine`];
//! [`ReferenceGuardrails`] is the bundled rule set.

use serde::{Deserialize, Serialize};

use super::data::MarketHistory;
use super::portfolio::{self, Portfolio, SaleBudgets, SalePlan, SaleRequest};
use super::types::StrategyConfig;

#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MarketRegime {
    PeakHot,
    PeakStable,
    BearDeep,
    Recovery,
    RecoveryInBear,
    CorrectionYoung,
    SidewaysLong,
}

impl MarketRegime {
    pub fn is_defensive(self) -> bool {
        matches!(self, MarketRegime::BearDeep | MarketRegime::RecoveryInBear)
    }

    pub fn is_peak(self) -> bool {
        matches!(self, MarketRegime::PeakHot | MarketRegime::PeakStable)
    }
}

/// Year-end index levels of the last four years plus the all-time-high tracker.
#[derive(Copy, Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PriceWindow {
    pub levels: [f64; 4],
    pub ath: f64,
    pub years_since_ath: u32,
}

impl PriceWindow {
    /// Seeds the window from the four historical years preceding `start_index`.
    pub fn from_history(history: &MarketHistory, start_index: usize) -> Self {
        let level = |back: usize| {
            start_index
                .checked_sub(back)
                .map_or(0.0, |idx| history.record(idx).index_level)
        };
        let levels = [level(1), level(2), level(3), level(4)];

        let mut ath = 0.0;
        let mut ath_idx = 0;
        for (idx, record) in history.records().iter().enumerate().take(start_index) {
            if record.index_level >= ath {
                ath = record.index_level;
                ath_idx = idx;
            }
        }
        let years_since_ath = start_index.saturating_sub(1).saturating_sub(ath_idx) as u32;
        Self {
            levels,
            ath: ath.max(levels[0]),
            years_since_ath,
        }
    }

    pub fn roll(&mut self, equity_return: f64) {
        let next = self.levels[0] * (1.0 + equity_return);
        let next = if next.is_finite() { next.max(0.0) } else { self.levels[0] };
        self.levels = [next, self.levels[0], self.levels[1], self.levels[2]];
        if next >= self.ath {
            self.ath = next;
            self.years_since_ath = 0;
        } else {
            self.years_since_ath += 1;
        }
    }

    pub fn drawdown_pct(&self) -> f64 {
        if self.ath > 0.0 && self.levels[0] > 0.0 {
            (self.ath - self.levels[0]) / self.ath * 100.0
        } else {
            0.0
        }
    }

    pub fn ath_ratio(&self) -> f64 {
        if self.ath > 0.0 {
            self.levels[0] / self.ath
        } else {
            1.0
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MarketContext {
    pub regime: MarketRegime,
    pub stagflation: bool,
    pub drawdown_pct: f64,
    pub perf_1y_pct: f64,
    pub ath_ratio: f64,
}

#[derive(Copy, Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GuardrailState {
    pub flex_rate_pct: f64,
    pub alarm_active: bool,
    pub peak_real_wealth: f64,
}

impl Default for GuardrailState {
    fn default() -> Self {
        Self {
            flex_rate_pct: 100.0,
            alarm_active: false,
            peak_real_wealth: 0.0,
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq)]
pub struct LiquidityInput {
    pub market: MarketContext,
    pub floor_need: f64,
    pub flex_need: f64,
    pub strategy: StrategyConfig,
}

#[derive(Copy, Clone, Debug, PartialEq)]
pub struct SpendingInput {
    pub market: MarketContext,
    pub floor_need: f64,
    pub flex_need: f64,
    pub total_wealth: f64,
    pub real_wealth: f64,
    pub runway_months: f64,
    pub previous: GuardrailState,
}

#[derive(Copy, Clone, Debug, PartialEq)]
pub struct SpendingDecision {
    pub withdrawal: f64,
    pub flex_paid: f64,
    pub flex_rate_pct: f64,
    pub cut_pct: f64,
    pub state: GuardrailState,
}

#[derive(Copy, Clone, Debug, PartialEq)]
pub struct ActionInput {
    pub market: MarketContext,
    pub liquidity: f64,
    pub target_liquidity: f64,
    pub withdrawal: f64,
    /// Total equity, both tax regimes.
    pub equity_value: f64,
    /// Old-regime share of `equity_value`.
    pub equity_old_value: f64,
    pub gold_value: f64,
    pub total_wealth: f64,
    pub strategy: StrategyConfig,
}

#[derive(Copy, Clone, Debug, PartialEq)]
pub struct ActionDecision {
    /// Net proceeds the year's ordinary sale should raise.
    pub sell_net: f64,
    pub min_gold: f64,
    pub gold_first: bool,
    pub allow_reinvest: bool,
    /// Per-category gross caps for the ordinary sale.
    pub budgets: SaleBudgets,
}

/// Pure decision functions consulted once per simulated year. Implementations must not
/// keep hidden mutable state; everything carried between years lives in [`GuardrailState`].
pub trait GuardrailEngine: Sync {
    fn classify_market(&self, window: &PriceWindow, inflation_pct: f64) -> MarketContext;

    fn target_liquidity(&self, input: &LiquidityInput) -> f64;

    fn decide_spending(&self, input: &SpendingInput) -> SpendingDecision;

    fn decide_action(&self, input: &ActionInput) -> ActionDecision;

    fn plan_sale(&self, portfolio: &Portfolio, request: &SaleRequest) -> SalePlan {
        portfolio::plan_sale(portfolio, request)
    }
}

#[derive(Copy, Clone, Debug, PartialEq)]
pub struct ReferenceGuardrails {
    pub alarm_withdrawal_rate: f64,
    pub caution_withdrawal_rate: f64,
    pub alarm_real_drawdown: f64,
    pub stagflation_inflation_pct: f64,
    pub smoothing_alpha: f64,
    pub max_up_pp: f64,
    pub agile_up_pp: f64,
    pub max_down_pp: f64,
    pub max_down_bear_pp: f64,
    pub bear_max_flex_rate: f64,
    pub alarm_max_flex_rate: f64,
    pub min_refill: f64,
}

impl Default for ReferenceGuardrails {
    fn default() -> Self {
        Self {
            alarm_withdrawal_rate: 0.055,
            caution_withdrawal_rate: 0.045,
            alarm_real_drawdown: 0.25,
            stagflation_inflation_pct: 4.0,
            smoothing_alpha: 0.35,
            max_up_pp: 2.5,
            agile_up_pp: 4.5,
            max_down_pp: 3.5,
            max_down_bear_pp: 6.0,
            bear_max_flex_rate: 70.0,
            alarm_max_flex_rate: 50.0,
            min_refill: 10_000.0,
        }
    }
}

impl GuardrailEngine for ReferenceGuardrails {
    fn classify_market(&self, window: &PriceWindow, inflation_pct: f64) -> MarketContext {
        let [end, prev, ..] = window.levels;
        let drawdown = window.drawdown_pct();
        let perf_1y = if prev > 0.0 {
            (end - prev) / prev * 100.0
        } else {
            0.0
        };
        let months_since_ath = if drawdown > 0.0 && window.years_since_ath == 0 {
            12
        } else {
            window.years_since_ath * 12
        };

        let mut regime = if drawdown <= 0.0 {
            if perf_1y >= 10.0 {
                MarketRegime::PeakHot
            } else {
                MarketRegime::PeakStable
            }
        } else if drawdown > 20.0 {
            MarketRegime::BearDeep
        } else if drawdown > 10.0 && perf_1y > 10.0 && months_since_ath > 6 {
            MarketRegime::Recovery
        } else if drawdown <= 15.0 && months_since_ath <= 6 {
            MarketRegime::CorrectionYoung
        } else {
            MarketRegime::SidewaysLong
        };

        if matches!(regime, MarketRegime::BearDeep | MarketRegime::Recovery) {
            let low = window
                .levels
                .iter()
                .copied()
                .filter(|v| *v > 0.0)
                .fold(f64::INFINITY, f64::min);
            let rally_from_low = if low.is_finite() && low > 0.0 {
                (end - low) / low * 100.0
            } else {
                0.0
            };
            if (perf_1y >= 15.0 || rally_from_low >= 30.0) && drawdown > 15.0 {
                regime = MarketRegime::RecoveryInBear;
            }
        }

        MarketContext {
            regime,
            stagflation: inflation_pct >= self.stagflation_inflation_pct
                && perf_1y - inflation_pct < 0.0,
            drawdown_pct: drawdown,
            perf_1y_pct: perf_1y,
            ath_ratio: window.ath_ratio(),
        }
    }

    fn target_liquidity(&self, input: &LiquidityInput) -> f64 {
        let strategy = &input.strategy;
        let min_months = strategy.runway_min_months;
        let target_months = strategy.runway_target_months.max(min_months);
        let below_ath = ((1.0 - input.market.ath_ratio) * 2.5).clamp(0.0, 1.0);
        let months = target_months - below_ath * (target_months - min_months);

        let full_flex = input.market.regime.is_peak()
            || matches!(
                input.market.regime,
                MarketRegime::CorrectionYoung | MarketRegime::SidewaysLong
            );
        let need = if full_flex {
            input.floor_need + input.flex_need
        } else {
            input.floor_need + 0.5 * input.flex_need
        };
        need.max(1.0) / 12.0 * months
    }

    fn decide_spending(&self, input: &SpendingInput) -> SpendingDecision {
        let prev = input.previous;
        let regime = input.market.regime;
        let base = input.floor_need + input.flex_need;
        let withdrawal_rate = if input.total_wealth > 0.0 {
            base / input.total_wealth
        } else {
            f64::INFINITY
        };
        let peak_real_wealth = prev.peak_real_wealth.max(input.real_wealth);
        let real_drawdown = if peak_real_wealth > 0.0 {
            1.0 - input.real_wealth / peak_real_wealth
        } else {
            0.0
        };

        let alarm = withdrawal_rate > self.alarm_withdrawal_rate
            || (real_drawdown > self.alarm_real_drawdown && regime.is_defensive());

        let mut target = match regime {
            MarketRegime::BearDeep => self.bear_max_flex_rate,
            MarketRegime::RecoveryInBear => 85.0,
            _ => 100.0,
        };
        if withdrawal_rate > self.caution_withdrawal_rate {
            target -= 10.0;
        }
        if alarm {
            target = target.min(self.alarm_max_flex_rate);
        }

        let max_up = if regime.is_peak() || regime == MarketRegime::Recovery {
            self.agile_up_pp
        } else {
            self.max_up_pp
        };
        let max_down = if alarm {
            100.0
        } else if regime.is_defensive() {
            self.max_down_bear_pp
        } else {
            self.max_down_pp
        };
        let smoothed = prev.flex_rate_pct + self.smoothing_alpha * (target - prev.flex_rate_pct);
        let flex_rate_pct = smoothed
            .clamp(prev.flex_rate_pct - max_down, prev.flex_rate_pct + max_up)
            .clamp(0.0, 100.0);
        let flex_rate_pct = if alarm {
            flex_rate_pct.min(target)
        } else {
            flex_rate_pct
        };

        let flex_paid = input.flex_need * flex_rate_pct / 100.0;
        SpendingDecision {
            withdrawal: input.floor_need + flex_paid,
            flex_paid,
            flex_rate_pct,
            cut_pct: 100.0 - flex_rate_pct,
            state: GuardrailState {
                flex_rate_pct,
                alarm_active: alarm,
                peak_real_wealth,
            },
        }
    }

    fn decide_action(&self, input: &ActionInput) -> ActionDecision {
        let strategy = &input.strategy;
        let regime = input.market.regime;
        let must_cover = (input.withdrawal - input.liquidity).max(0.0);
        let gap = (input.target_liquidity + input.withdrawal - input.liquidity).max(0.0);

        let mut sell_net = if regime.is_defensive() {
            must_cover.max(gap * strategy.max_bear_refill_pct / 100.0)
        } else if regime.is_peak() {
            gap.min(must_cover.max(input.equity_value * strategy.max_skim_pct / 100.0))
        } else {
            gap
        };
        if must_cover <= 0.0 && sell_net < self.min_refill {
            sell_net = 0.0;
        }

        let gold_target = input.total_wealth * strategy.gold_target_pct / 100.0;
        let gold_ceiling = gold_target * (1.0 + strategy.rebalance_band_pct / 100.0);
        // Bear refills may dig into the gold floor.
        let min_gold = if regime.is_defensive() {
            0.0
        } else {
            gold_target * strategy.gold_floor_pct / 100.0
        };

        // Equity is sold from both regimes in proportion to their value.
        let equity_value = input.equity_value.max(0.0);
        let equity_sale = sell_net.min(equity_value);
        let old_share = if equity_value > 0.0 {
            (input.equity_old_value / equity_value).clamp(0.0, 1.0)
        } else {
            0.0
        };
        let budgets = SaleBudgets {
            equity_old: Some(equity_sale * old_share),
            equity_new: Some(equity_sale * (1.0 - old_share)),
            gold: Some((input.gold_value - min_gold).max(0.0)),
        };

        ActionDecision {
            sell_net,
            min_gold,
            gold_first: regime.is_defensive() || input.gold_value > gold_ceiling,
            allow_reinvest: !regime.is_defensive(),
            budgets,
        }
    }
}
