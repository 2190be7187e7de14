use axum::{
    Router,
    extract::{Json, Query},
    http::{StatusCode, header},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use clap::{ArgAction, Parser, ValueEnum};
use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use tokio::net::TcpListener;

use crate::core::{
    AccountSnapshot, AllocationMode, CareConfig, CareModel, Gender, HouseholdPlan, MarketHistory,
    McSummary, PensionIndexing, PersonConfig, PortfolioConfig, ReferenceGuardrails, SamplerMode,
    SimConfig, StrategyConfig, StressPreset, SweepCaseResult, SweepRanges, TrialTrace,
    aggregate_household_need, parse_range, plan_household, run_parallel, run_sweep, summarize,
    trace_run,
};

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum CliSamplerMode {
    Block,
    RegimeMarkov,
    RegimeIid,
}

impl From<CliSamplerMode> for SamplerMode {
    fn from(value: CliSamplerMode) -> Self {
        match value {
            CliSamplerMode::Block => SamplerMode::Block,
            CliSamplerMode::RegimeMarkov => SamplerMode::RegimeMarkov,
            CliSamplerMode::RegimeIid => SamplerMode::RegimeIid,
        }
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum CliStressPreset {
    None,
    #[value(name = "stagflation-70s")]
    Stagflation70s,
    #[value(name = "double-bear-00s")]
    DoubleBear00s,
    #[value(name = "inflation-spike-3y")]
    InflationSpike3y,
    #[value(name = "forced-drawdown-3y")]
    ForcedDrawdown3y,
}

impl From<CliStressPreset> for StressPreset {
    fn from(value: CliStressPreset) -> Self {
        match value {
            CliStressPreset::None => StressPreset::None,
            CliStressPreset::Stagflation70s => StressPreset::Stagflation70s,
            CliStressPreset::DoubleBear00s => StressPreset::DoubleBear00s,
            CliStressPreset::InflationSpike3y => StressPreset::InflationSpike3y,
            CliStressPreset::ForcedDrawdown3y => StressPreset::ForcedDrawdown3y,
        }
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum CliCareModel {
    Acute,
    Chronic,
}

impl From<CliCareModel> for CareModel {
    fn from(value: CliCareModel) -> Self {
        match value {
            CliCareModel::Acute => CareModel::Acute,
            CliCareModel::Chronic => CareModel::Chronic,
        }
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum CliPensionIndexing {
    Inflation,
    Wage,
    Fixed,
}

impl From<CliPensionIndexing> for PensionIndexing {
    fn from(value: CliPensionIndexing) -> Self {
        match value {
            CliPensionIndexing::Inflation => PensionIndexing::Inflation,
            CliPensionIndexing::Wage => PensionIndexing::Wage,
            CliPensionIndexing::Fixed => PensionIndexing::Fixed,
        }
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum CliGender {
    Male,
    Female,
}

impl From<CliGender> for Gender {
    fn from(value: CliGender) -> Self {
        match value {
            CliGender::Male => Gender::Male,
            CliGender::Female => Gender::Female,
        }
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Deserialize)]
#[serde(rename_all = "kebab-case")]
enum ApiSamplerMode {
    Block,
    #[serde(alias = "regimeMarkov", alias = "regime_markov", alias = "markov")]
    RegimeMarkov,
    #[serde(alias = "regimeIid", alias = "regime_iid", alias = "iid")]
    RegimeIid,
}

impl From<ApiSamplerMode> for CliSamplerMode {
    fn from(value: ApiSamplerMode) -> Self {
        match value {
            ApiSamplerMode::Block => CliSamplerMode::Block,
            ApiSamplerMode::RegimeMarkov => CliSamplerMode::RegimeMarkov,
            ApiSamplerMode::RegimeIid => CliSamplerMode::RegimeIid,
        }
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Deserialize)]
#[serde(rename_all = "kebab-case")]
enum ApiStressPreset {
    None,
    #[serde(
        rename = "stagflation-70s",
        alias = "stagflation70s",
        alias = "stagflation_70s"
    )]
    Stagflation70s,
    #[serde(
        rename = "double-bear-00s",
        alias = "doubleBear00s",
        alias = "double_bear_00s"
    )]
    DoubleBear00s,
    #[serde(
        rename = "inflation-spike-3y",
        alias = "inflationSpike3y",
        alias = "INFLATION_SPIKE_3Y"
    )]
    InflationSpike3y,
    #[serde(
        rename = "forced-drawdown-3y",
        alias = "forcedDrawdown3y",
        alias = "FORCED_DRAWDOWN_3Y"
    )]
    ForcedDrawdown3y,
}

impl From<ApiStressPreset> for CliStressPreset {
    fn from(value: ApiStressPreset) -> Self {
        match value {
            ApiStressPreset::None => CliStressPreset::None,
            ApiStressPreset::Stagflation70s => CliStressPreset::Stagflation70s,
            ApiStressPreset::DoubleBear00s => CliStressPreset::DoubleBear00s,
            ApiStressPreset::InflationSpike3y => CliStressPreset::InflationSpike3y,
            ApiStressPreset::ForcedDrawdown3y => CliStressPreset::ForcedDrawdown3y,
        }
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Deserialize)]
#[serde(rename_all = "kebab-case")]
enum ApiCareModel {
    Acute,
    Chronic,
}

impl From<ApiCareModel> for CliCareModel {
    fn from(value: ApiCareModel) -> Self {
        match value {
            ApiCareModel::Acute => CliCareModel::Acute,
            ApiCareModel::Chronic => CliCareModel::Chronic,
        }
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Deserialize)]
#[serde(rename_all = "kebab-case")]
enum ApiPensionIndexing {
    #[serde(alias = "cpi")]
    Inflation,
    #[serde(alias = "wages")]
    Wage,
    Fixed,
}

impl From<ApiPensionIndexing> for CliPensionIndexing {
    fn from(value: ApiPensionIndexing) -> Self {
        match value {
            ApiPensionIndexing::Inflation => CliPensionIndexing::Inflation,
            ApiPensionIndexing::Wage => CliPensionIndexing::Wage,
            ApiPensionIndexing::Fixed => CliPensionIndexing::Fixed,
        }
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Deserialize)]
#[serde(rename_all = "kebab-case")]
enum ApiGender {
    #[serde(alias = "m")]
    Male,
    #[serde(alias = "f")]
    Female,
}

impl From<ApiGender> for CliGender {
    fn from(value: ApiGender) -> Self {
        match value {
            ApiGender::Male => CliGender::Male,
            ApiGender::Female => CliGender::Female,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct SimulatePayload {
    runs: Option<u32>,
    seed: Option<u64>,
    max_years: Option<u32>,
    workers: Option<usize>,
    sampler: Option<ApiSamplerMode>,
    block_size: Option<u32>,
    stress: Option<ApiStressPreset>,
    break_on_ruin: Option<bool>,

    equity_old: Option<f64>,
    equity_old_cost_basis: Option<f64>,
    equity_new: Option<f64>,
    equity_new_cost_basis: Option<f64>,
    gold: Option<f64>,
    gold_cost_basis: Option<f64>,
    gold_tax_free: Option<bool>,
    cash: Option<f64>,
    money_market: Option<f64>,
    church_tax_pct: Option<f64>,
    tax_allowance: Option<f64>,
    partial_exemption_pct: Option<f64>,

    runway_min_months: Option<f64>,
    runway_target_months: Option<f64>,
    target_equity_pct: Option<f64>,
    rebalance_band_pct: Option<f64>,
    max_skim_pct: Option<f64>,
    max_bear_refill_pct: Option<f64>,
    gold_target_pct: Option<f64>,
    gold_floor_pct: Option<f64>,

    floor_annual: Option<f64>,
    flex_annual: Option<f64>,

    gender: Option<ApiGender>,
    age: Option<u32>,
    pension_monthly: Option<f64>,
    pension_start_offset: Option<u32>,
    pension_tax_pct: Option<f64>,

    partner_age: Option<u32>,
    partner_gender: Option<ApiGender>,
    partner_pension_monthly: Option<f64>,
    partner_pension_start_offset: Option<u32>,
    partner_pension_tax_pct: Option<f64>,
    survivor_pension_pct: Option<f64>,

    pension_indexing: Option<ApiPensionIndexing>,
    fixed_pension_adjustment_pct: Option<f64>,

    care_enabled: Option<bool>,
    care_model: Option<ApiCareModel>,
    care_ramp_years: Option<u32>,
    care_max_floor: Option<f64>,
    care_cost_drift_pct: Option<f64>,
    acute_min_years: Option<u32>,
    acute_max_years: Option<u32>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct SweepRangePayload {
    runway_min_months: Option<String>,
    runway_target_months: Option<String>,
    target_equity_pct: Option<String>,
    rebalance_band_pct: Option<String>,
    max_skim_pct: Option<String>,
    max_bear_refill_pct: Option<String>,
    gold_target_pct: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct SweepPayload {
    config: SimulatePayload,
    ranges: SweepRangePayload,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct TraceSelection {
    run_index: Option<u32>,
    combo_index: Option<u32>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct TracePayload {
    config: SimulatePayload,
    run_index: Option<u32>,
    combo_index: Option<u32>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct HouseholdPayload {
    accounts: Vec<AccountSnapshot>,
    mode: Option<AllocationMode>,
    need: Option<f64>,
}

#[derive(Parser, Debug)]
#[command(
    name = "drawdown",
    about = "Monte Carlo retirement drawdown simulator with guardrails, tax lots and care costs"
)]
struct Cli {
    #[arg(long, default_value_t = 1_000, help = "Number of Monte Carlo trials")]
    runs: u32,
    #[arg(long, default_value_t = 42)]
    seed: u64,
    #[arg(long, default_value_t = 35, help = "Simulated years per trial")]
    max_years: u32,
    #[arg(long, default_value_t = 4, help = "Worker threads for the trial range")]
    workers: usize,
    #[arg(long, value_enum, default_value_t = CliSamplerMode::Block)]
    sampler: CliSamplerMode,
    #[arg(
        long,
        default_value_t = 5,
        help = "Consecutive historical years drawn per block"
    )]
    block_size: u32,
    #[arg(long, value_enum, default_value_t = CliStressPreset::None)]
    stress: CliStressPreset,
    #[arg(
        long,
        default_value_t = true,
        action = ArgAction::Set,
        help = "Stop a trial at the first ruined year"
    )]
    break_on_ruin: bool,

    #[arg(long, help = "Equity bought under the old tax regime")]
    equity_old: f64,
    #[arg(long, default_value_t = 0.0)]
    equity_old_cost_basis: f64,
    #[arg(long)]
    equity_new: f64,
    #[arg(long, default_value_t = 0.0)]
    equity_new_cost_basis: f64,
    #[arg(long, default_value_t = 0.0)]
    gold: f64,
    #[arg(long, default_value_t = 0.0)]
    gold_cost_basis: f64,
    #[arg(
        long,
        default_value_t = true,
        action = ArgAction::Set,
        help = "Gold gains are tax free after the holding period"
    )]
    gold_tax_free: bool,
    #[arg(long, default_value_t = 0.0)]
    cash: f64,
    #[arg(long, default_value_t = 0.0)]
    money_market: f64,
    #[arg(long, default_value_t = 0.0, help = "Church tax surcharge in percent")]
    church_tax_pct: f64,
    #[arg(
        long,
        default_value_t = 1_000.0,
        help = "Annual tax-free allowance on realised gains"
    )]
    tax_allowance: f64,
    #[arg(
        long,
        default_value_t = 30.0,
        help = "Equity fund partial exemption in percent"
    )]
    partial_exemption_pct: f64,

    #[arg(long, default_value_t = 24.0)]
    runway_min_months: f64,
    #[arg(long, default_value_t = 36.0)]
    runway_target_months: f64,
    #[arg(long, default_value_t = 75.0)]
    target_equity_pct: f64,
    #[arg(long, default_value_t = 20.0)]
    rebalance_band_pct: f64,
    #[arg(long, default_value_t = 25.0)]
    max_skim_pct: f64,
    #[arg(long, default_value_t = 50.0)]
    max_bear_refill_pct: f64,
    #[arg(long, default_value_t = 7.5)]
    gold_target_pct: f64,
    #[arg(
        long,
        default_value_t = 50.0,
        help = "Share of the gold target ordinary sales must leave in place, in percent"
    )]
    gold_floor_pct: f64,

    #[arg(long, help = "Essential annual spending in start-year money")]
    floor_annual: f64,
    #[arg(long, default_value_t = 0.0)]
    flex_annual: f64,

    #[arg(long, value_enum, default_value_t = CliGender::Male)]
    gender: CliGender,
    #[arg(long)]
    age: u32,
    #[arg(long, default_value_t = 0.0)]
    pension_monthly: f64,
    #[arg(long, default_value_t = 0)]
    pension_start_offset: u32,
    #[arg(long, default_value_t = 0.0, help = "Pension income tax in percent")]
    pension_tax_pct: f64,

    #[arg(long, help = "Partner age; enables the second person")]
    partner_age: Option<u32>,
    #[arg(long, value_enum, default_value_t = CliGender::Female)]
    partner_gender: CliGender,
    #[arg(long, default_value_t = 0.0)]
    partner_pension_monthly: f64,
    #[arg(long, default_value_t = 0)]
    partner_pension_start_offset: u32,
    #[arg(long, default_value_t = 0.0)]
    partner_pension_tax_pct: f64,
    #[arg(
        long,
        default_value_t = 0.0,
        help = "Share of a deceased partner's pension paid to the survivor, in percent"
    )]
    survivor_pension_pct: f64,

    #[arg(long, value_enum, default_value_t = CliPensionIndexing::Inflation)]
    pension_indexing: CliPensionIndexing,
    #[arg(
        long,
        default_value_t = 2.0,
        help = "Annual pension adjustment in percent, used when --pension-indexing=fixed"
    )]
    fixed_pension_adjustment_pct: f64,

    #[arg(long, default_value_t = true, action = ArgAction::Set)]
    care_enabled: bool,
    #[arg(long, value_enum, default_value_t = CliCareModel::Chronic)]
    care_model: CliCareModel,
    #[arg(long, default_value_t = 3)]
    care_ramp_years: u32,
    #[arg(
        long,
        default_value_t = 80_000.0,
        help = "Household floor ceiling while in care, in start-year money"
    )]
    care_max_floor: f64,
    #[arg(
        long,
        default_value_t = 1.0,
        help = "Care cost growth above inflation in percent"
    )]
    care_cost_drift_pct: f64,
    #[arg(long, default_value_t = 1)]
    acute_min_years: u32,
    #[arg(long, default_value_t = 5)]
    acute_max_years: u32,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SimulateResponse {
    seed: u64,
    runs: u32,
    max_years: u32,
    completed: u32,
    summary: McSummary,
    care_entry_ages: Vec<u32>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SweepResponse {
    combinations: usize,
    failed_combinations: usize,
    cases: Vec<SweepCaseResult>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct HouseholdResponse {
    need: f64,
    plan: HouseholdPlan,
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
}

#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: String,
}

struct ApiRequest {
    config: SimConfig,
    workers: usize,
}

fn build_config(cli: &Cli) -> Result<SimConfig, String> {
    if cli.runs == 0 {
        return Err("--runs must be > 0".to_string());
    }
    if cli.max_years == 0 {
        return Err("--max-years must be > 0".to_string());
    }
    if cli.acute_min_years > cli.acute_max_years {
        return Err("--acute-min-years must be <= --acute-max-years".to_string());
    }

    let person = |gender: CliGender, start_age, pension_monthly, offset, tax_pct: f64| {
        PersonConfig {
            gender: gender.into(),
            start_age,
            pension_monthly,
            pension_start_offset: offset,
            pension_tax_rate: tax_pct / 100.0,
            survivor_pension_pct: cli.survivor_pension_pct,
        }
    };

    let config = SimConfig {
        portfolio: PortfolioConfig {
            equity_old: cli.equity_old,
            equity_old_cost_basis: cli.equity_old_cost_basis,
            equity_new: cli.equity_new,
            equity_new_cost_basis: cli.equity_new_cost_basis,
            gold: cli.gold,
            gold_cost_basis: cli.gold_cost_basis,
            gold_tax_free: cli.gold_tax_free,
            cash: cli.cash,
            money_market: cli.money_market,
            church_tax_pct: cli.church_tax_pct,
            tax_allowance: cli.tax_allowance,
            equity_partial_exemption: cli.partial_exemption_pct / 100.0,
        },
        strategy: StrategyConfig {
            runway_min_months: cli.runway_min_months,
            runway_target_months: cli.runway_target_months,
            target_equity_pct: cli.target_equity_pct,
            rebalance_band_pct: cli.rebalance_band_pct,
            max_skim_pct: cli.max_skim_pct,
            max_bear_refill_pct: cli.max_bear_refill_pct,
            gold_target_pct: cli.gold_target_pct,
            gold_floor_pct: cli.gold_floor_pct,
        },
        floor_annual: cli.floor_annual,
        flex_annual: cli.flex_annual,
        person1: person(
            cli.gender,
            cli.age,
            cli.pension_monthly,
            cli.pension_start_offset,
            cli.pension_tax_pct,
        ),
        person2: cli.partner_age.map(|age| {
            person(
                cli.partner_gender,
                age,
                cli.partner_pension_monthly,
                cli.partner_pension_start_offset,
                cli.partner_pension_tax_pct,
            )
        }),
        pension_indexing: cli.pension_indexing.into(),
        fixed_pension_adjustment_pct: cli.fixed_pension_adjustment_pct,
        care: CareConfig {
            enabled: cli.care_enabled,
            model: cli.care_model.into(),
            ramp_years: cli.care_ramp_years,
            max_floor: cli.care_max_floor,
            cost_drift: cli.care_cost_drift_pct / 100.0,
            acute_min_years: cli.acute_min_years,
            acute_max_years: cli.acute_max_years,
            ..CareConfig::default()
        },
        sampler: cli.sampler.into(),
        block_size: cli.block_size,
        stress: cli.stress.into(),
        max_years: cli.max_years,
        runs: cli.runs,
        seed: cli.seed,
        break_on_ruin: cli.break_on_ruin,
    };

    config.validate().map_err(|e| e.to_string())?;
    Ok(config)
}

fn build_request(cli: &Cli) -> Result<ApiRequest, String> {
    if cli.workers == 0 {
        return Err("--workers must be > 0".to_string());
    }
    Ok(ApiRequest {
        config: build_config(cli)?,
        workers: cli.workers,
    })
}

fn simulate(request: &ApiRequest) -> SimulateResponse {
    let guardrail = ReferenceGuardrails::default();
    let buffers = run_parallel(
        &request.config,
        MarketHistory::bundled(),
        &guardrail,
        0,
        request.workers,
        None,
    );
    let summary = summarize(&buffers);
    SimulateResponse {
        seed: request.config.seed,
        runs: request.config.runs,
        max_years: request.config.max_years,
        completed: buffers.completed,
        summary,
        care_entry_ages: buffers.care_entry_ages,
    }
}

/// Parses `simulate` flags (the first item is the command name) and returns the summary as
/// pretty-printed JSON.
pub fn run_cli<I, T>(args: I) -> Result<String, String>
where
    I: IntoIterator<Item = T>,
    T: Into<std::ffi::OsString> + Clone,
{
    let cli = Cli::try_parse_from(args).map_err(|e| e.to_string())?;
    let request = build_request(&cli)?;
    let response = simulate(&request);
    info!(
        "cli simulation: {} trials, success rate {:.1}%",
        response.runs, response.summary.success_rate
    );
    serde_json::to_string_pretty(&response).map_err(|e| format!("Failed to encode result: {e}"))
}

pub async fn run_http_server(port: u16) -> std::io::Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let app = Router::new()
        .route("/api/health", get(health_handler))
        .route(
            "/api/simulate",
            get(simulate_get_handler).post(simulate_post_handler),
        )
        .route("/api/sweep", post(sweep_handler))
        .route("/api/household", post(household_handler))
        .route(
            "/api/trace",
            get(trace_get_handler).post(trace_post_handler),
        )
        .fallback(not_found_handler);

    let listener = TcpListener::bind(addr).await?;
    info!("drawdown HTTP API bound to {addr}");
    println!("drawdown HTTP API listening on http://{addr}");
    println!("Local access: http://127.0.0.1:{port}/api/health");

    axum::serve(listener, app).await
}

async fn health_handler() -> Response {
    json_response(StatusCode::OK, HealthResponse { status: "ok" })
}

async fn not_found_handler() -> Response {
    error_response(StatusCode::NOT_FOUND, "Not found")
}

async fn simulate_get_handler(Query(payload): Query<SimulatePayload>) -> Response {
    simulate_handler_impl(payload).await
}

async fn simulate_post_handler(Json(payload): Json<SimulatePayload>) -> Response {
    simulate_handler_impl(payload).await
}

async fn simulate_handler_impl(payload: SimulatePayload) -> Response {
    let request = match api_request_from_payload(payload) {
        Ok(request) => request,
        Err(msg) => return error_response(StatusCode::BAD_REQUEST, &msg),
    };

    match tokio::task::spawn_blocking(move || simulate(&request)).await {
        Ok(response) => json_response(StatusCode::OK, response),
        Err(e) => internal_error(&e),
    }
}

async fn sweep_handler(Json(payload): Json<SweepPayload>) -> Response {
    let request = match api_request_from_payload(payload.config) {
        Ok(request) => request,
        Err(msg) => return error_response(StatusCode::BAD_REQUEST, &msg),
    };
    let ranges = match sweep_ranges_from_payload(&payload.ranges, &request.config.strategy) {
        Ok(ranges) => ranges,
        Err(msg) => return error_response(StatusCode::BAD_REQUEST, &msg),
    };

    let result = tokio::task::spawn_blocking(move || {
        let guardrail = ReferenceGuardrails::default();
        run_sweep(
            &request.config,
            MarketHistory::bundled(),
            &guardrail,
            &ranges,
        )
    })
    .await;

    match result {
        Ok(Ok(cases)) => {
            let failed_combinations = cases.iter().filter(|c| c.error.is_some()).count();
            json_response(
                StatusCode::OK,
                SweepResponse {
                    combinations: cases.len(),
                    failed_combinations,
                    cases,
                },
            )
        }
        Ok(Err(e)) => error_response(StatusCode::BAD_REQUEST, &e.to_string()),
        Err(e) => internal_error(&e),
    }
}

async fn household_handler(Json(payload): Json<HouseholdPayload>) -> Response {
    match household_response_from_payload(payload) {
        Ok(response) => json_response(StatusCode::OK, response),
        Err(msg) => error_response(StatusCode::BAD_REQUEST, &msg),
    }
}

async fn trace_get_handler(
    Query(selection): Query<TraceSelection>,
    Query(payload): Query<SimulatePayload>,
) -> Response {
    trace_handler_impl(payload, selection).await
}

async fn trace_post_handler(Json(payload): Json<TracePayload>) -> Response {
    let selection = TraceSelection {
        run_index: payload.run_index,
        combo_index: payload.combo_index,
    };
    trace_handler_impl(payload.config, selection).await
}

async fn trace_handler_impl(payload: SimulatePayload, selection: TraceSelection) -> Response {
    let request = match api_request_from_payload(payload) {
        Ok(request) => request,
        Err(msg) => return error_response(StatusCode::BAD_REQUEST, &msg),
    };
    let run_index = selection.run_index.unwrap_or(0);
    if run_index >= request.config.runs {
        return error_response(StatusCode::BAD_REQUEST, "runIndex must be < runs");
    }
    let combo_index = selection.combo_index.unwrap_or(0);

    let result = tokio::task::spawn_blocking(move || -> TrialTrace {
        let guardrail = ReferenceGuardrails::default();
        trace_run(
            &request.config,
            MarketHistory::bundled(),
            &guardrail,
            combo_index,
            run_index,
        )
    })
    .await;

    match result {
        Ok(trace) => json_response(StatusCode::OK, trace),
        Err(e) => internal_error(&e),
    }
}

fn json_response<T: Serialize>(status: StatusCode, body: T) -> Response {
    let mut response = (status, Json(body)).into_response();
    response.headers_mut().insert(
        header::CACHE_CONTROL,
        "no-store".parse().expect("valid header"),
    );
    response
}

fn error_response(status: StatusCode, msg: &str) -> Response {
    json_response(
        status,
        ErrorResponse {
            error: msg.to_string(),
        },
    )
}

fn internal_error(err: &tokio::task::JoinError) -> Response {
    warn!("simulation task failed: {err}");
    error_response(StatusCode::INTERNAL_SERVER_ERROR, "Simulation task failed")
}

#[cfg(test)]
fn api_request_from_json(json: &str) -> Result<ApiRequest, String> {
    let payload = serde_json::from_str::<SimulatePayload>(json)
        .map_err(|e| format!("Invalid API JSON payload: {e}"))?;
    api_request_from_payload(payload)
}

fn api_request_from_payload(payload: SimulatePayload) -> Result<ApiRequest, String> {
    let mut cli = default_cli_for_api();

    if let Some(v) = payload.runs {
        cli.runs = v;
    }
    if let Some(v) = payload.seed {
        cli.seed = v;
    }
    if let Some(v) = payload.max_years {
        cli.max_years = v;
    }
    if let Some(v) = payload.workers {
        cli.workers = v;
    }
    if let Some(v) = payload.sampler {
        cli.sampler = v.into();
    }
    if let Some(v) = payload.block_size {
        cli.block_size = v;
    }
    if let Some(v) = payload.stress {
        cli.stress = v.into();
    }
    if let Some(v) = payload.break_on_ruin {
        cli.break_on_ruin = v;
    }

    if let Some(v) = payload.equity_old {
        cli.equity_old = v;
    }
    if let Some(v) = payload.equity_old_cost_basis {
        cli.equity_old_cost_basis = v;
    }
    if let Some(v) = payload.equity_new {
        cli.equity_new = v;
    }
    if let Some(v) = payload.equity_new_cost_basis {
        cli.equity_new_cost_basis = v;
    }
    if let Some(v) = payload.gold {
        cli.gold = v;
    }
    if let Some(v) = payload.gold_cost_basis {
        cli.gold_cost_basis = v;
    }
    if let Some(v) = payload.gold_tax_free {
        cli.gold_tax_free = v;
    }
    if let Some(v) = payload.cash {
        cli.cash = v;
    }
    if let Some(v) = payload.money_market {
        cli.money_market = v;
    }
    if let Some(v) = payload.church_tax_pct {
        cli.church_tax_pct = v;
    }
    if let Some(v) = payload.tax_allowance {
        cli.tax_allowance = v;
    }
    if let Some(v) = payload.partial_exemption_pct {
        cli.partial_exemption_pct = v;
    }

    if let Some(v) = payload.runway_min_months {
        cli.runway_min_months = v;
    }
    if let Some(v) = payload.runway_target_months {
        cli.runway_target_months = v;
    }
    if let Some(v) = payload.target_equity_pct {
        cli.target_equity_pct = v;
    }
    if let Some(v) = payload.rebalance_band_pct {
        cli.rebalance_band_pct = v;
    }
    if let Some(v) = payload.max_skim_pct {
        cli.max_skim_pct = v;
    }
    if let Some(v) = payload.max_bear_refill_pct {
        cli.max_bear_refill_pct = v;
    }
    if let Some(v) = payload.gold_target_pct {
        cli.gold_target_pct = v;
    }
    if let Some(v) = payload.gold_floor_pct {
        cli.gold_floor_pct = v;
    }

    if let Some(v) = payload.floor_annual {
        cli.floor_annual = v;
    }
    if let Some(v) = payload.flex_annual {
        cli.flex_annual = v;
    }

    if let Some(v) = payload.gender {
        cli.gender = v.into();
    }
    if let Some(v) = payload.age {
        cli.age = v;
    }
    if let Some(v) = payload.pension_monthly {
        cli.pension_monthly = v;
    }
    if let Some(v) = payload.pension_start_offset {
        cli.pension_start_offset = v;
    }
    if let Some(v) = payload.pension_tax_pct {
        cli.pension_tax_pct = v;
    }

    if payload.partner_age.is_some() {
        cli.partner_age = payload.partner_age;
    }
    if let Some(v) = payload.partner_gender {
        cli.partner_gender = v.into();
    }
    if let Some(v) = payload.partner_pension_monthly {
        cli.partner_pension_monthly = v;
    }
    if let Some(v) = payload.partner_pension_start_offset {
        cli.partner_pension_start_offset = v;
    }
    if let Some(v) = payload.partner_pension_tax_pct {
        cli.partner_pension_tax_pct = v;
    }
    if let Some(v) = payload.survivor_pension_pct {
        cli.survivor_pension_pct = v;
    }

    if let Some(v) = payload.pension_indexing {
        cli.pension_indexing = v.into();
    }
    if let Some(v) = payload.fixed_pension_adjustment_pct {
        cli.fixed_pension_adjustment_pct = v;
    }

    if let Some(v) = payload.care_enabled {
        cli.care_enabled = v;
    }
    if let Some(v) = payload.care_model {
        cli.care_model = v.into();
    }
    if let Some(v) = payload.care_ramp_years {
        cli.care_ramp_years = v;
    }
    if let Some(v) = payload.care_max_floor {
        cli.care_max_floor = v;
    }
    if let Some(v) = payload.care_cost_drift_pct {
        cli.care_cost_drift_pct = v;
    }
    if let Some(v) = payload.acute_min_years {
        cli.acute_min_years = v;
    }
    if let Some(v) = payload.acute_max_years {
        cli.acute_max_years = v;
    }

    build_request(&cli)
}

fn sweep_ranges_from_payload(
    payload: &SweepRangePayload,
    strategy: &StrategyConfig,
) -> Result<SweepRanges, String> {
    let mut ranges = SweepRanges::pinned(strategy);
    let overrides = [
        (&payload.runway_min_months, &mut ranges.runway_min_months),
        (&payload.runway_target_months, &mut ranges.runway_target_months),
        (&payload.target_equity_pct, &mut ranges.target_equity_pct),
        (&payload.rebalance_band_pct, &mut ranges.rebalance_band_pct),
        (&payload.max_skim_pct, &mut ranges.max_skim_pct),
        (&payload.max_bear_refill_pct, &mut ranges.max_bear_refill_pct),
        (&payload.gold_target_pct, &mut ranges.gold_target_pct),
    ];
    for (input, values) in overrides {
        if let Some(input) = input {
            *values = parse_range(input).map_err(|e| e.to_string())?;
        }
    }
    Ok(ranges)
}

fn household_response_from_payload(payload: HouseholdPayload) -> Result<HouseholdResponse, String> {
    if payload.accounts.is_empty() {
        return Err("accounts must not be empty".to_string());
    }
    let need = match payload.need {
        Some(v) if !v.is_finite() || v < 0.0 => {
            return Err("need must be finite and >= 0".to_string());
        }
        Some(v) => v,
        None => aggregate_household_need(&payload.accounts),
    };
    let mode = payload.mode.unwrap_or_default();
    Ok(HouseholdResponse {
        need,
        plan: plan_household(need, &payload.accounts, mode),
    })
}

fn default_cli_for_api() -> Cli {
    Cli {
        runs: 1_000,
        seed: 42,
        max_years: 35,
        workers: 4,
        sampler: CliSamplerMode::Block,
        block_size: 5,
        stress: CliStressPreset::None,
        break_on_ruin: true,
        equity_old: 250_000.0,
        equity_old_cost_basis: 120_000.0,
        equity_new: 400_000.0,
        equity_new_cost_basis: 380_000.0,
        gold: 60_000.0,
        gold_cost_basis: 50_000.0,
        gold_tax_free: true,
        cash: 60_000.0,
        money_market: 30_000.0,
        church_tax_pct: 0.0,
        tax_allowance: 1_000.0,
        partial_exemption_pct: 30.0,
        runway_min_months: 24.0,
        runway_target_months: 36.0,
        target_equity_pct: 75.0,
        rebalance_band_pct: 20.0,
        max_skim_pct: 25.0,
        max_bear_refill_pct: 50.0,
        gold_target_pct: 7.5,
        gold_floor_pct: 50.0,
        floor_annual: 24_000.0,
        flex_annual: 12_000.0,
        gender: CliGender::Male,
        age: 63,
        pension_monthly: 1_200.0,
        pension_start_offset: 4,
        pension_tax_pct: 15.0,
        partner_age: None,
        partner_gender: CliGender::Female,
        partner_pension_monthly: 0.0,
        partner_pension_start_offset: 0,
        partner_pension_tax_pct: 0.0,
        survivor_pension_pct: 0.0,
        pension_indexing: CliPensionIndexing::Inflation,
        fixed_pension_adjustment_pct: 2.0,
        care_enabled: true,
        care_model: CliCareModel::Chronic,
        care_ramp_years: 3,
        care_max_floor: 80_000.0,
        care_cost_drift_pct: 1.0,
        acute_min_years: 1,
        acute_max_years: 5,
    }
}
