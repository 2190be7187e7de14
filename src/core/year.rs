use serde::Serialize;

use super::care::CareAdjustment;
use super::data::{MarketHistory, Regime};
use super::guardrail::{
    ActionInput, GuardrailEngine, GuardrailState, LiquidityInput, MarketRegime, PriceWindow,
    SpendingInput,
};
use super::portfolio::{AssetKind, Portfolio, SaleBudgets, SaleRequest, finite_or_zero};
use super::sampler::YearMarketData;
use super::types::{PensionIndexing, PersonConfig, SimConfig};

/// Liquidity shortfall tolerated before a year counts as ruin.
pub const RUIN_TOLERANCE: f64 = 0.01;
/// Floor months the engine keeps liquid regardless of the guardrail's target.
const MIN_LIQUIDITY_MONTHS: f64 = 6.0;
/// Surplus cash below this stays in cash.
const REINVEST_THRESHOLD: f64 = 500.0;
const RUNWAY_CAP_MONTHS: f64 = 999.0;

/// Trial-local state threaded through every year transition.
#[derive(Clone, Debug, PartialEq)]
pub struct SimulationState {
    pub portfolio: Portfolio,
    pub floor: f64,
    pub flex: f64,
    pub cumulative_inflation: f64,
    pub guardrail: GuardrailState,
    pub prices: PriceWindow,
    /// Gross annual pension per person, carried for indexing.
    pub pensions: [f64; 2],
    pub nan_clamps: u32,
}

impl SimulationState {
    pub fn new(cfg: &SimConfig, history: &MarketHistory, start_index: usize) -> Self {
        let portfolio = Portfolio::from_config(&cfg.portfolio);
        let peak_real_wealth = portfolio.total_wealth();
        Self {
            portfolio,
            floor: cfg.floor_annual,
            flex: cfg.flex_annual,
            cumulative_inflation: 1.0,
            guardrail: GuardrailState {
                peak_real_wealth,
                ..GuardrailState::default()
            },
            prices: PriceWindow::from_history(history, start_index),
            pensions: [0.0; 2],
            nan_clamps: 0,
        }
    }

    pub fn liquidity(&self) -> f64 {
        self.portfolio.cash
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct YearLog {
    pub year_index: u32,
    pub source_year: u32,
    pub regime: Regime,
    pub market_regime: MarketRegime,
    pub equity_return: f64,
    pub inflation_pct: f64,
    pub pension: f64,
    pub care_cost: f64,
    pub alive: [bool; 2],
    pub person_care_costs: [f64; 2],
    pub in_care: [bool; 2],
    /// Share of the flex budget the household keeps given care and deaths.
    pub care_flex_factor: f64,
    pub floor_need: f64,
    pub flex_need: f64,
    pub withdrawal: f64,
    /// Withdrawal over start-of-year wealth; infinite once wealth is gone.
    pub withdrawal_rate_pct: f64,
    pub flex_rate_pct: f64,
    pub cut_pct: f64,
    pub runway_months: f64,
    pub target_liquidity: f64,
    pub gross_sold: f64,
    pub tax_paid: f64,
    pub emergency_sale: bool,
    pub liquidity: f64,
    pub depot_value: f64,
    pub total_wealth: f64,
    pub fail_safe: bool,
    /// Withdrawal in start-year money.
    pub real_withdrawal: f64,
}

#[derive(Clone, Debug, PartialEq)]
pub struct YearStep {
    pub state: SimulationState,
    pub log: YearLog,
}

/// Result of one year. Ruin is a terminal outcome, not an error.
#[derive(Clone, Debug, PartialEq)]
pub enum YearOutcome {
    Continue(YearStep),
    Ruin(YearStep),
}

impl YearOutcome {
    pub fn is_ruin(&self) -> bool {
        matches!(self, YearOutcome::Ruin(_))
    }

    pub fn step(&self) -> &YearStep {
        match self {
            YearOutcome::Continue(step) | YearOutcome::Ruin(step) => step,
        }
    }

    pub fn into_step(self) -> YearStep {
        match self {
            YearOutcome::Continue(step) | YearOutcome::Ruin(step) => step,
        }
    }
}

fn next_pension(previous: f64, person: &PersonConfig, year_index: u32, adjustment_pct: f64) -> f64 {
    if year_index < person.pension_start_offset {
        0.0
    } else if year_index == person.pension_start_offset {
        person.pension_monthly * 12.0
    } else {
        previous * (1.0 + adjustment_pct / 100.0)
    }
}

fn pension_adjustment_pct(cfg: &SimConfig, market: &YearMarketData) -> f64 {
    match cfg.pension_indexing {
        PensionIndexing::Inflation => market.inflation_pct,
        PensionIndexing::Wage => market.wage_growth_pct,
        PensionIndexing::Fixed => cfg.fixed_pension_adjustment_pct,
    }
}

/// Advances the household by one year. Everything random has already been drawn: the
/// market year by the sampler and the care/mortality adjustment by the overlay.
pub fn simulate_year(
    mut state: SimulationState,
    cfg: &SimConfig,
    market: &YearMarketData,
    year_index: u32,
    care: &CareAdjustment,
    guardrail: &dyn GuardrailEngine,
) -> YearOutcome {
    let mut clamps = state.nan_clamps;
    let strategy = cfg.strategy;

    state
        .portfolio
        .apply_returns(market.equity_return, market.gold_return_pct, &mut clamps);

    let adjustment_pct = pension_adjustment_pct(cfg, market);
    let persons = [Some(&cfg.person1), cfg.person2.as_ref()];
    let mut pension = 0.0;
    for idx in 0..persons.len() {
        let survivor = persons[1 - idx].filter(|_| care.alive[1 - idx]);
        // (entitled person, paid share, recipient's tax rate)
        let payout = match persons[idx] {
            Some(p) if care.alive[idx] => Some((p, 1.0, p.pension_tax_rate)),
            Some(p) if p.survivor_pension_pct > 0.0 => survivor
                .map(|s| (p, p.survivor_pension_pct / 100.0, s.pension_tax_rate)),
            _ => None,
        };
        let gross = payout.map_or(0.0, |(p, _, _)| {
            next_pension(state.pensions[idx], p, year_index, adjustment_pct)
        });
        let gross = finite_or_zero(gross, &mut clamps);
        state.pensions[idx] = gross;
        if let Some((_, share, tax_rate)) = payout {
            pension += gross * share * (1.0 - tax_rate);
        }
    }

    let care_cost = finite_or_zero(care.additional_floor, &mut clamps);
    let floor_total = state.floor + care_cost;
    let floor_need = (floor_total - pension).max(0.0);
    let pension_surplus = (pension - floor_total).max(0.0);
    let flex_need = (state.flex * care.flex_factor - pension_surplus).max(0.0);

    let market_ctx = guardrail.classify_market(&state.prices, market.inflation_pct);
    let target_liquidity = guardrail
        .target_liquidity(&LiquidityInput {
            market: market_ctx,
            floor_need,
            flex_need,
            strategy,
        })
        .max(floor_need / 12.0 * MIN_LIQUIDITY_MONTHS);
    let target_liquidity = finite_or_zero(target_liquidity, &mut clamps);

    let total_wealth = state.portfolio.total_wealth();
    let monthly_need = (floor_need + flex_need) / 12.0;
    let runway_months = if monthly_need > 0.0 {
        (state.liquidity() / monthly_need).min(RUNWAY_CAP_MONTHS)
    } else {
        RUNWAY_CAP_MONTHS
    };
    let spending = guardrail.decide_spending(&SpendingInput {
        market: market_ctx,
        floor_need,
        flex_need,
        total_wealth,
        real_wealth: total_wealth / state.cumulative_inflation,
        runway_months,
        previous: state.guardrail,
    });
    let withdrawal = finite_or_zero(spending.withdrawal, &mut clamps).max(0.0);
    state.guardrail = spending.state;

    let action = guardrail.decide_action(&ActionInput {
        market: market_ctx,
        liquidity: state.liquidity(),
        target_liquidity,
        withdrawal,
        equity_value: state.portfolio.equity_value(),
        equity_old_value: state.portfolio.value_of(AssetKind::EquityOld),
        gold_value: state.portfolio.gold_value(),
        total_wealth,
        strategy,
    });

    let mut log = YearLog {
        year_index,
        source_year: market.year,
        regime: market.regime,
        market_regime: market_ctx.regime,
        equity_return: market.equity_return,
        inflation_pct: market.inflation_pct,
        pension,
        care_cost,
        alive: care.alive,
        person_care_costs: care.person_costs,
        in_care: care.in_care,
        care_flex_factor: care.flex_factor,
        floor_need,
        flex_need,
        withdrawal,
        withdrawal_rate_pct: if total_wealth > 0.0 {
            withdrawal / total_wealth * 100.0
        } else if withdrawal > 0.0 {
            f64::INFINITY
        } else {
            0.0
        },
        flex_rate_pct: spending.flex_rate_pct,
        cut_pct: spending.cut_pct,
        runway_months,
        target_liquidity,
        gross_sold: 0.0,
        tax_paid: 0.0,
        emergency_sale: false,
        liquidity: 0.0,
        depot_value: 0.0,
        total_wealth: 0.0,
        fail_safe: false,
        real_withdrawal: withdrawal / state.cumulative_inflation,
    };

    let mut allowance_left = cfg.portfolio.tax_allowance;
    let sell = |state: &mut SimulationState, request: SaleRequest, log: &mut YearLog| {
        let plan = guardrail.plan_sale(&state.portfolio, &request);
        state.portfolio.apply_sale(&plan);
        log.gross_sold += plan.gross;
        log.tax_paid += plan.tax;
        plan.allowance_used
    };

    if action.sell_net > 0.0 {
        allowance_left -= sell(
            &mut state,
            SaleRequest {
                net_target: action.sell_net,
                min_gold: action.min_gold,
                gold_first: action.gold_first,
                allowance_left,
                church_tax_pct: cfg.portfolio.church_tax_pct,
                budgets: action.budgets,
            },
            &mut log,
        );
    }

    if state.liquidity() + RUIN_TOLERANCE < withdrawal {
        log.emergency_sale = true;
        let net_target = withdrawal + target_liquidity - state.liquidity();
        sell(
            &mut state,
            SaleRequest {
                net_target,
                min_gold: 0.0,
                gold_first: true,
                allowance_left,
                church_tax_pct: cfg.portfolio.church_tax_pct,
                budgets: SaleBudgets::unlimited(),
            },
            &mut log,
        );
    }

    if state.liquidity() + RUIN_TOLERANCE < withdrawal {
        state.nan_clamps = clamps;
        record_balances(&state, &mut log);
        return YearOutcome::Ruin(YearStep { state, log });
    }

    state.portfolio.cash = (state.portfolio.cash - withdrawal).max(0.0);

    if action.allow_reinvest {
        reinvest_surplus(&mut state, cfg, target_liquidity, year_index);
    }

    let cash = state.portfolio.cash;
    if cash > 0.0 {
        let interest = finite_or_zero(cash * market.cash_rate_pct / 100.0, &mut clamps);
        state.portfolio.cash = (cash + interest).max(0.0);
    }

    log.fail_safe = state.liquidity() < floor_need / 12.0 * strategy.runway_min_months;

    let inflation = finite_or_zero(1.0 + market.inflation_pct / 100.0, &mut clamps);
    state.floor *= inflation;
    state.flex *= inflation;
    state.cumulative_inflation *= inflation;
    state.prices.roll(market.equity_return);

    state.nan_clamps = clamps;
    record_balances(&state, &mut log);
    YearOutcome::Continue(YearStep { state, log })
}

fn record_balances(state: &SimulationState, log: &mut YearLog) {
    log.liquidity = state.liquidity();
    log.depot_value = state.portfolio.depot_value();
    log.total_wealth = state.portfolio.total_wealth();
}

/// Moves cash above the liquidity target into gold up to its target weight, then into
/// equities up to the equity target plus the rebalancing band.
fn reinvest_surplus(
    state: &mut SimulationState,
    cfg: &SimConfig,
    target_liquidity: f64,
    year_index: u32,
) {
    let surplus = state.liquidity() - target_liquidity;
    if surplus <= REINVEST_THRESHOLD {
        return;
    }
    let strategy = &cfg.strategy;
    let wealth = state.portfolio.total_wealth();

    let gold_room =
        (wealth * strategy.gold_target_pct / 100.0 - state.portfolio.gold_value()).max(0.0);
    let to_gold = surplus.min(gold_room);
    let equity_cap =
        wealth * strategy.target_equity_pct / 100.0 * (1.0 + strategy.rebalance_band_pct / 100.0);
    let equity_room = (equity_cap - state.portfolio.equity_value()).max(0.0);
    let to_equity = (surplus - to_gold).min(equity_room);

    let year = year_index as i32;
    let gold_exemption = if cfg.portfolio.gold_tax_free { 1.0 } else { 0.0 };
    state
        .portfolio
        .buy(AssetKind::Gold, to_gold, year, gold_exemption);
    state.portfolio.buy(
        AssetKind::EquityNew,
        to_equity,
        year,
        cfg.portfolio.equity_partial_exemption,
    );
    state.portfolio.cash -= to_gold.max(0.0) + to_equity.max(0.0);
}
