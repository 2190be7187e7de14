mod care;
mod data;
mod guardrail;
mod household;
mod monte_carlo;
mod portfolio;
mod rng;
mod sampler;
mod sweep;
mod types;
mod year;

pub use care::{
    CareAdjustment, CareMeta, PersonState, advance_care_year, death_probability, enter_care,
    household_adjustment, household_flex_factor, person_flex_share, roll_survival,
};
pub use data::{AnnualRecord, MarketHistory, Regime, care_incidence, mortality_probability};
pub use guardrail::{
    ActionDecision, ActionInput, GuardrailEngine, GuardrailState, LiquidityInput, MarketContext,
    MarketRegime, PriceWindow, ReferenceGuardrails, SpendingDecision, SpendingInput,
};
pub use household::{
    AccountShare, AccountSnapshot, AccountWithdrawal, Allocation, AllocationMode, HouseholdPlan,
    TrancheSale, aggregate_household_need, allocate_household, plan_account_withdrawal,
    plan_household,
};
pub use monte_carlo::{
    HEATMAP_BINS, HEATMAP_YEARS, McBuffers, McSummary, McTotals, RunOutcome, StressKpis,
    StressSummary, TrialTrace, WorstRun, heatmap_bin, merge_buffers, run_chunk, run_monte_carlo,
    run_parallel, summarize, trace_run,
};
pub use portfolio::{
    AssetKind, Portfolio, SaleBudgets, SaleLine, SalePlan, SaleRequest, Tranche,
    effective_tax_rate, plan_sale,
};
pub use rng::{Rng, Stream, run_seed, stream_seed};
pub use sampler::{MarketSampler, SamplerState, YearMarketData};
pub use sweep::{
    MAX_SWEEP_COMBINATIONS, SweepCaseResult, SweepError, SweepMetrics, SweepParams, SweepRanges,
    build_grid, parse_range, run_sweep, run_sweep_cases,
};
pub use types::{
    CareConfig, CareGradeConfig, CareModel, ConfigError, Gender, PensionIndexing, PersonConfig,
    PortfolioConfig, SamplerMode, SimConfig, StrategyConfig, StressPreset,
};
pub use year::{SimulationState, YearLog, YearOutcome, YearStep, simulate_year};
