use axum::{
    Router,
    extract::{Json, Query, State},
    http::{StatusCode, header},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use clap::{Args, Parser, Subcommand, ValueEnum};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::{error, info};

use crate::core::{
    AdjustmentMode, AllocationSweepParams, AssetAllocation, CashFlowItem, DEFAULT_TARGETS,
    ExpenseRatios, GuardrailParams, HistoricalReturns, PortfolioSolveConfig, RateSweepParams,
    SimError, SimResult, SimulationConfig, WithdrawalStrategy, compare_guardrail,
    guardrail_backtest, simulate, solve_portfolio, sweep_allocation, sweep_rate,
};

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
pub enum CliStrategy {
    Fixed,
    Dynamic,
    Guardrail,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
pub enum CliAdjustmentMode {
    Amount,
    SuccessRate,
}

impl From<CliAdjustmentMode> for AdjustmentMode {
    fn from(value: CliAdjustmentMode) -> Self {
        match value {
            CliAdjustmentMode::Amount => AdjustmentMode::Amount,
            CliAdjustmentMode::SuccessRate => AdjustmentMode::SuccessRate,
        }
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Deserialize)]
#[serde(rename_all = "kebab-case")]
enum ApiStrategy {
    #[serde(alias = "constant")]
    Fixed,
    Dynamic,
    #[serde(alias = "guardrails")]
    Guardrail,
}

impl From<ApiStrategy> for CliStrategy {
    fn from(value: ApiStrategy) -> Self {
        match value {
            ApiStrategy::Fixed => CliStrategy::Fixed,
            ApiStrategy::Dynamic => CliStrategy::Dynamic,
            ApiStrategy::Guardrail => CliStrategy::Guardrail,
        }
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Deserialize)]
#[serde(rename_all = "kebab-case")]
enum ApiAdjustmentMode {
    Amount,
    #[serde(alias = "successRate", alias = "success_rate")]
    SuccessRate,
}

impl From<ApiAdjustmentMode> for CliAdjustmentMode {
    fn from(value: ApiAdjustmentMode) -> Self {
        match value {
            ApiAdjustmentMode::Amount => CliAdjustmentMode::Amount,
            ApiAdjustmentMode::SuccessRate => CliAdjustmentMode::SuccessRate,
        }
    }
}

#[derive(Debug, Parser)]
#[command(
    name = "fire-bootstrap",
    about = "Retirement Monte Carlo simulator over block-bootstrapped historical returns"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Serve the JSON API.
    Serve {
        #[arg(long, default_value_t = 8080)]
        port: u16,
        #[arg(long, env = "FIRE_DATA_PATH", help = "CSV of annual historical returns")]
        data: PathBuf,
    },
    /// Run one simulation and print the aggregate result as JSON.
    Simulate {
        #[arg(long, env = "FIRE_DATA_PATH", help = "CSV of annual historical returns")]
        data: PathBuf,
        #[command(flatten)]
        args: SimulationArgs,
    },
}

#[derive(Debug, Clone, PartialEq, Args)]
pub struct SimulationArgs {
    #[arg(long, default_value_t = 1_000_000.0)]
    pub initial_portfolio: f64,
    #[arg(
        long,
        default_value_t = 40_000.0,
        help = "First-year withdrawal in today's dollars"
    )]
    pub annual_withdrawal: f64,
    #[arg(long, default_value_t = 40.0, help = "US stock weight in percent")]
    pub us_stock: f64,
    #[arg(long, default_value_t = 40.0, help = "International stock weight in percent")]
    pub intl_stock: f64,
    #[arg(long, default_value_t = 20.0, help = "US bond weight in percent")]
    pub us_bond: f64,
    #[arg(long, default_value_t = 0.5, help = "US stock expense ratio in percent")]
    pub us_stock_expense: f64,
    #[arg(
        long,
        default_value_t = 0.5,
        help = "International stock expense ratio in percent"
    )]
    pub intl_stock_expense: f64,
    #[arg(long, default_value_t = 0.5, help = "US bond expense ratio in percent")]
    pub us_bond_expense: f64,
    #[arg(long, default_value_t = 30)]
    pub retirement_years: u32,
    #[arg(long, default_value_t = 5, help = "Shortest bootstrap block in years")]
    pub min_block: u32,
    #[arg(long, default_value_t = 15, help = "Longest bootstrap block in years")]
    pub max_block: u32,
    #[arg(long, default_value_t = 2_000)]
    pub simulations: u32,
    #[arg(
        long,
        default_value_t = 1926,
        help = "First historical year the sampler may draw from"
    )]
    pub data_start_year: i32,
    #[arg(long, value_enum, default_value_t = CliStrategy::Fixed)]
    pub strategy: CliStrategy,
    #[arg(
        long,
        default_value_t = 5.0,
        help = "Largest year-over-year real raise in percent (dynamic)"
    )]
    pub dynamic_ceiling: f64,
    #[arg(
        long,
        default_value_t = 2.5,
        help = "Largest year-over-year real cut in percent (dynamic)"
    )]
    pub dynamic_floor: f64,
    #[arg(
        long,
        default_value_t = 80.0,
        help = "Success rate the guardrail steers back to, in percent"
    )]
    pub target_success: f64,
    #[arg(long, default_value_t = 99.0, help = "Upper guardrail in percent")]
    pub upper_guardrail: f64,
    #[arg(long, default_value_t = 50.0, help = "Lower guardrail in percent")]
    pub lower_guardrail: f64,
    #[arg(
        long,
        default_value_t = 50.0,
        help = "Share of the gap to the target closed per adjustment, in percent"
    )]
    pub adjustment_pct: f64,
    #[arg(long, value_enum, default_value_t = CliAdjustmentMode::Amount)]
    pub adjustment_mode: CliAdjustmentMode,
    #[arg(
        long,
        default_value_t = 10,
        help = "No guardrail adjustments once fewer years than this remain"
    )]
    pub min_remaining_years: u32,
    #[arg(
        long,
        default_value_t = 3.3,
        help = "Fixed withdrawal rate of the comparison baseline, in percent"
    )]
    pub baseline_rate: f64,
    #[arg(
        long,
        default_value_t = 200,
        help = "Paths per guardrail success estimate"
    )]
    pub inner_simulations: u32,
    #[arg(long, default_value_t = 1, help = "Years between guardrail reviews")]
    pub guardrail_cadence: u32,
    #[arg(
        long = "cash-flow",
        value_parser = parse_cash_flow,
        help = "Extra income (+) or expense (-) as name:amount:start:duration[:nominal]"
    )]
    pub cash_flows: Vec<CashFlowItem>,
    #[arg(long, default_value_t = 42)]
    pub seed: u64,
}

/// Parses `name:amount:start:duration[:nominal]`. Amounts are in today's
/// dollars unless the `nominal` suffix is given.
pub fn parse_cash_flow(raw: &str) -> Result<CashFlowItem, String> {
    let parts: Vec<&str> = raw.split(':').map(str::trim).collect();
    if !(4..=5).contains(&parts.len()) {
        return Err(format!(
            "--cash-flow expects name:amount:start:duration[:nominal], got '{raw}'"
        ));
    }
    if parts[0].is_empty() {
        return Err("--cash-flow name must not be empty".to_string());
    }
    let amount = parts[1]
        .parse::<f64>()
        .map_err(|e| format!("--cash-flow amount '{}': {e}", parts[1]))?;
    let start_year = parts[2]
        .parse::<u32>()
        .map_err(|e| format!("--cash-flow start '{}': {e}", parts[2]))?;
    let duration = parts[3]
        .parse::<u32>()
        .map_err(|e| format!("--cash-flow duration '{}': {e}", parts[3]))?;
    let inflation_adjusted = match parts.get(4) {
        None => true,
        Some(&"nominal") => false,
        Some(&"real") => true,
        Some(other) => {
            return Err(format!(
                "--cash-flow suffix must be 'nominal' or 'real', got '{other}'"
            ));
        }
    };
    Ok(CashFlowItem {
        name: parts[0].to_string(),
        amount,
        start_year,
        duration,
        inflation_adjusted,
    })
}

#[derive(Debug, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct CashFlowPayload {
    name: String,
    amount: f64,
    start_year: u32,
    duration: u32,
    inflation_adjusted: bool,
}

impl Default for CashFlowPayload {
    fn default() -> Self {
        Self {
            name: "cash flow".to_string(),
            amount: 0.0,
            start_year: 1,
            duration: 10,
            inflation_adjusted: true,
        }
    }
}

impl From<CashFlowPayload> for CashFlowItem {
    fn from(value: CashFlowPayload) -> Self {
        CashFlowItem {
            name: value.name,
            amount: value.amount,
            start_year: value.start_year,
            duration: value.duration,
            inflation_adjusted: value.inflation_adjusted,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct SimulatePayload {
    initial_portfolio: Option<f64>,
    annual_withdrawal: Option<f64>,
    simulations: Option<u32>,
    seed: Option<u64>,

    us_stock: Option<f64>,
    intl_stock: Option<f64>,
    us_bond: Option<f64>,
    us_stock_expense: Option<f64>,
    intl_stock_expense: Option<f64>,
    us_bond_expense: Option<f64>,

    retirement_years: Option<u32>,
    min_block: Option<u32>,
    max_block: Option<u32>,
    data_start_year: Option<i32>,

    #[serde(alias = "withdrawalStrategy")]
    strategy: Option<ApiStrategy>,
    dynamic_ceiling: Option<f64>,
    dynamic_floor: Option<f64>,

    target_success: Option<f64>,
    upper_guardrail: Option<f64>,
    lower_guardrail: Option<f64>,
    adjustment_pct: Option<f64>,
    adjustment_mode: Option<ApiAdjustmentMode>,
    min_remaining_years: Option<u32>,
    baseline_rate: Option<f64>,
    inner_simulations: Option<u32>,
    guardrail_cadence: Option<u32>,

    cash_flows: Option<Vec<CashFlowPayload>>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct RateSweepPayload {
    #[serde(flatten)]
    simulation: SimulatePayload,
    rate_min: Option<f64>,
    rate_max: Option<f64>,
    rate_step: Option<f64>,
    targets: Option<Vec<f64>>,
    time_limit_secs: Option<f64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct AllocationSweepPayload {
    #[serde(flatten)]
    simulation: SimulatePayload,
    allocation_step: Option<f64>,
    time_limit_secs: Option<f64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct BacktestPayload {
    #[serde(flatten)]
    simulation: SimulatePayload,
    hist_start_year: Option<i32>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct SolvePayload {
    #[serde(flatten)]
    simulation: SimulatePayload,
    solve_target: Option<f64>,
    search_min: Option<f64>,
    search_max: Option<f64>,
    tolerance: Option<f64>,
    max_iterations: Option<u32>,
    simulations_per_iteration: Option<u32>,
    final_simulations: Option<u32>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct ReturnsQuery {
    data_start_year: Option<i32>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ReturnsResponse {
    years: Vec<i32>,
    us_stock: Vec<f64>,
    intl_stock: Vec<f64>,
    us_bond: Vec<f64>,
    us_inflation: Vec<f64>,
}

#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: String,
}

#[derive(Clone)]
struct AppState {
    history: Arc<HistoricalReturns>,
}

fn build_config(args: &SimulationArgs) -> Result<SimulationConfig, String> {
    if !args.initial_portfolio.is_finite() || args.initial_portfolio <= 0.0 {
        return Err("--initial-portfolio must be > 0".to_string());
    }

    if !args.annual_withdrawal.is_finite() || args.annual_withdrawal < 0.0 {
        return Err("--annual-withdrawal must be >= 0".to_string());
    }

    for (flag, weight) in [
        ("--us-stock", args.us_stock),
        ("--intl-stock", args.intl_stock),
        ("--us-bond", args.us_bond),
    ] {
        if !(0.0..=100.0).contains(&weight) {
            return Err(format!("{flag} must be between 0 and 100"));
        }
    }

    let weight_sum = args.us_stock + args.intl_stock + args.us_bond;
    if (weight_sum - 100.0).abs() > 1.0 {
        return Err(format!(
            "--us-stock, --intl-stock and --us-bond must sum to 100, got {weight_sum}"
        ));
    }

    for (flag, ratio) in [
        ("--us-stock-expense", args.us_stock_expense),
        ("--intl-stock-expense", args.intl_stock_expense),
        ("--us-bond-expense", args.us_bond_expense),
    ] {
        if !(0.0..=10.0).contains(&ratio) {
            return Err(format!("{flag} must be between 0 and 10"));
        }
    }

    if args.retirement_years == 0 {
        return Err("--retirement-years must be > 0".to_string());
    }

    if args.min_block == 0 {
        return Err("--min-block must be >= 1".to_string());
    }

    if args.min_block > args.max_block {
        return Err("--min-block must be <= --max-block".to_string());
    }

    if args.simulations == 0 {
        return Err("--simulations must be > 0".to_string());
    }

    for cf in &args.cash_flows {
        if cf.start_year == 0 {
            return Err(format!(
                "--cash-flow '{}' start year is 1-indexed and must be >= 1",
                cf.name
            ));
        }
        if !cf.amount.is_finite() {
            return Err(format!("--cash-flow '{}' amount must be finite", cf.name));
        }
    }

    let strategy = match args.strategy {
        CliStrategy::Fixed => WithdrawalStrategy::Fixed,
        CliStrategy::Dynamic => {
            if !args.dynamic_ceiling.is_finite() || args.dynamic_ceiling < 0.0 {
                return Err("--dynamic-ceiling must be >= 0".to_string());
            }
            if !(0.0..=100.0).contains(&args.dynamic_floor) {
                return Err("--dynamic-floor must be between 0 and 100".to_string());
            }
            WithdrawalStrategy::Dynamic {
                ceiling: args.dynamic_ceiling / 100.0,
                floor: args.dynamic_floor / 100.0,
            }
        }
        CliStrategy::Guardrail => WithdrawalStrategy::Guardrail(guardrail_params(args)?),
    };

    Ok(SimulationConfig {
        initial_portfolio: args.initial_portfolio,
        annual_withdrawal: args.annual_withdrawal,
        allocation: AssetAllocation::new(
            args.us_stock / 100.0,
            args.intl_stock / 100.0,
            args.us_bond / 100.0,
        ),
        expense_ratios: ExpenseRatios {
            us_stock: args.us_stock_expense / 100.0,
            intl_stock: args.intl_stock_expense / 100.0,
            us_bond: args.us_bond_expense / 100.0,
        },
        retirement_years: args.retirement_years,
        min_block: args.min_block,
        max_block: args.max_block,
        num_simulations: args.simulations,
        data_start_year: args.data_start_year,
        strategy,
        cash_flows: args.cash_flows.clone(),
        seed: args.seed,
    })
}

fn guardrail_params(args: &SimulationArgs) -> Result<GuardrailParams, String> {
    for (flag, value) in [
        ("--target-success", args.target_success),
        ("--upper-guardrail", args.upper_guardrail),
        ("--lower-guardrail", args.lower_guardrail),
    ] {
        if !(0.0..=100.0).contains(&value) {
            return Err(format!("{flag} must be between 0 and 100"));
        }
    }

    if args.lower_guardrail >= args.target_success {
        return Err("--lower-guardrail must be < --target-success".to_string());
    }

    if args.target_success >= args.upper_guardrail {
        return Err("--target-success must be < --upper-guardrail".to_string());
    }

    if !(args.adjustment_pct > 0.0 && args.adjustment_pct <= 100.0) {
        return Err("--adjustment-pct must be > 0 and <= 100".to_string());
    }

    if !args.baseline_rate.is_finite() || args.baseline_rate < 0.0 {
        return Err("--baseline-rate must be >= 0".to_string());
    }

    if args.inner_simulations == 0 {
        return Err("--inner-simulations must be > 0".to_string());
    }

    if args.guardrail_cadence == 0 {
        return Err("--guardrail-cadence must be > 0".to_string());
    }

    Ok(GuardrailParams {
        target_success: args.target_success / 100.0,
        upper_guardrail: args.upper_guardrail / 100.0,
        lower_guardrail: args.lower_guardrail / 100.0,
        adjustment_pct: args.adjustment_pct / 100.0,
        adjustment_mode: args.adjustment_mode.into(),
        min_remaining_years: args.min_remaining_years,
        baseline_rate: args.baseline_rate / 100.0,
        inner_simulations: args.inner_simulations,
        cadence_years: args.guardrail_cadence,
        ..GuardrailParams::default()
    })
}

fn config_for(history: &HistoricalReturns, args: &SimulationArgs) -> Result<SimulationConfig, String> {
    if history.index_of(args.data_start_year).is_none() {
        return Err(format!(
            "--data-start-year must be between {} and {}",
            history.first_year(),
            history.last_year()
        ));
    }
    build_config(args)
}

fn time_limit(secs: Option<f64>) -> Result<Option<Duration>, String> {
    match secs {
        None => Ok(None),
        Some(s) if s.is_finite() && s > 0.0 => Ok(Some(Duration::from_secs_f64(s))),
        Some(_) => Err("--time-limit-secs must be > 0".to_string()),
    }
}

fn rate_sweep_params(payload: &RateSweepPayload) -> Result<RateSweepParams, String> {
    let mut params = RateSweepParams {
        time_limit: time_limit(payload.time_limit_secs)?,
        ..RateSweepParams::default()
    };
    if let Some(v) = payload.rate_min {
        params.rate_min = v / 100.0;
    }
    if let Some(v) = payload.rate_max {
        params.rate_max = v / 100.0;
    }
    if let Some(v) = payload.rate_step {
        params.rate_step = v / 100.0;
    }
    if let Some(targets) = &payload.targets {
        params.targets = targets.iter().map(|t| t / 100.0).collect();
    }
    if params.targets.is_empty() {
        params.targets = DEFAULT_TARGETS.to_vec();
    }
    Ok(params)
}

fn solve_config(payload: &SolvePayload) -> PortfolioSolveConfig {
    let mut solve = PortfolioSolveConfig::default();
    if let Some(v) = payload.solve_target {
        solve.target_success = v / 100.0;
    }
    if let Some(v) = payload.search_min {
        solve.search_min = v;
    }
    if let Some(v) = payload.search_max {
        solve.search_max = v;
    }
    if let Some(v) = payload.tolerance {
        solve.tolerance = v;
    }
    if let Some(v) = payload.max_iterations {
        solve.max_iterations = v;
    }
    if let Some(v) = payload.simulations_per_iteration {
        solve.simulations_per_iteration = v;
    }
    if let Some(v) = payload.final_simulations {
        solve.final_simulations = v;
    }
    solve
}

pub fn router(history: Arc<HistoricalReturns>) -> Router {
    Router::new()
        .route(
            "/api/simulate",
            get(simulate_get_handler).post(simulate_post_handler),
        )
        .route("/api/sweep/rate", post(rate_sweep_handler))
        .route("/api/sweep/allocation", post(allocation_sweep_handler))
        .route("/api/guardrail", post(guardrail_handler))
        .route("/api/guardrail/backtest", post(backtest_handler))
        .route("/api/solve/portfolio", post(solve_handler))
        .route("/api/returns", get(returns_handler))
        .fallback(not_found_handler)
        .with_state(AppState { history })
}

pub async fn run_http_server(port: u16, history: HistoricalReturns) -> std::io::Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let app = router(Arc::new(history));

    let listener = TcpListener::bind(addr).await?;
    info!(%addr, "FIRE bootstrap HTTP API listening");
    info!("local access: http://127.0.0.1:{port}/api/simulate");

    axum::serve(listener, app).await
}

pub fn simulate_command(history: &HistoricalReturns, args: SimulationArgs) -> Result<String, String> {
    let config = config_for(history, &args)?;
    let result = simulate(history, &config).map_err(|e| e.to_string())?;
    serde_json::to_string_pretty(&result).map_err(|e| format!("failed to render result: {e}"))
}

async fn not_found_handler() -> Response {
    error_response(StatusCode::NOT_FOUND, "Not found")
}

async fn simulate_get_handler(
    State(state): State<AppState>,
    Query(payload): Query<SimulatePayload>,
) -> Response {
    simulate_handler_impl(state, payload).await
}

async fn simulate_post_handler(
    State(state): State<AppState>,
    Json(payload): Json<SimulatePayload>,
) -> Response {
    simulate_handler_impl(state, payload).await
}

async fn simulate_handler_impl(state: AppState, payload: SimulatePayload) -> Response {
    let config = match config_for(&state.history, &args_from_payload(payload)) {
        Ok(config) => config,
        Err(msg) => return error_response(StatusCode::BAD_REQUEST, &msg),
    };
    info!(
        strategy = config.strategy.label(),
        simulations = config.num_simulations,
        "simulate request"
    );
    run_blocking(state.history, move |history| simulate(history, &config)).await
}

async fn rate_sweep_handler(
    State(state): State<AppState>,
    Json(mut payload): Json<RateSweepPayload>,
) -> Response {
    let params = match rate_sweep_params(&payload) {
        Ok(params) => params,
        Err(msg) => return error_response(StatusCode::BAD_REQUEST, &msg),
    };
    let args = args_from_payload(std::mem::take(&mut payload.simulation));
    let config = match config_for(&state.history, &args) {
        Ok(config) => config,
        Err(msg) => return error_response(StatusCode::BAD_REQUEST, &msg),
    };
    info!(
        rate_max = params.rate_max,
        rate_step = params.rate_step,
        "rate sweep request"
    );
    run_blocking(state.history, move |history| {
        sweep_rate(history, &config, &params)
    })
    .await
}

async fn allocation_sweep_handler(
    State(state): State<AppState>,
    Json(payload): Json<AllocationSweepPayload>,
) -> Response {
    let time_limit = match time_limit(payload.time_limit_secs) {
        Ok(limit) => limit,
        Err(msg) => return error_response(StatusCode::BAD_REQUEST, &msg),
    };
    let mut params = AllocationSweepParams {
        time_limit,
        ..AllocationSweepParams::default()
    };
    if let Some(v) = payload.allocation_step {
        params.allocation_step = v / 100.0;
    }
    let config = match config_for(&state.history, &args_from_payload(payload.simulation)) {
        Ok(config) => config,
        Err(msg) => return error_response(StatusCode::BAD_REQUEST, &msg),
    };
    info!(step = params.allocation_step, "allocation sweep request");
    run_blocking(state.history, move |history| {
        sweep_allocation(history, &config, &params)
    })
    .await
}

async fn guardrail_handler(
    State(state): State<AppState>,
    Json(payload): Json<SimulatePayload>,
) -> Response {
    let args = args_from_payload(payload);
    let (config, params) = match config_for(&state.history, &args)
        .and_then(|config| Ok((config, guardrail_params(&args)?)))
    {
        Ok(parts) => parts,
        Err(msg) => return error_response(StatusCode::BAD_REQUEST, &msg),
    };
    info!(
        simulations = config.num_simulations,
        inner = params.inner_simulations,
        "guardrail comparison request"
    );
    run_blocking(state.history, move |history| {
        compare_guardrail(history, &config, &params)
    })
    .await
}

async fn backtest_handler(
    State(state): State<AppState>,
    Json(payload): Json<BacktestPayload>,
) -> Response {
    let hist_start_year = payload.hist_start_year.unwrap_or(1990);
    let args = args_from_payload(payload.simulation);
    let (config, params) = match config_for(&state.history, &args)
        .and_then(|config| Ok((config, guardrail_params(&args)?)))
    {
        Ok(parts) => parts,
        Err(msg) => return error_response(StatusCode::BAD_REQUEST, &msg),
    };
    info!(hist_start_year, "guardrail backtest request");
    run_blocking(state.history, move |history| {
        guardrail_backtest(history, &config, &params, hist_start_year)
    })
    .await
}

async fn solve_handler(
    State(state): State<AppState>,
    Json(mut payload): Json<SolvePayload>,
) -> Response {
    let solve = solve_config(&payload);
    let args = args_from_payload(std::mem::take(&mut payload.simulation));
    let config = match config_for(&state.history, &args) {
        Ok(config) => config,
        Err(msg) => return error_response(StatusCode::BAD_REQUEST, &msg),
    };
    info!(target = solve.target_success, "portfolio solve request");
    run_blocking(state.history, move |history| {
        solve_portfolio(history, &config, solve)
    })
    .await
}

async fn returns_handler(
    State(state): State<AppState>,
    Query(query): Query<ReturnsQuery>,
) -> Response {
    let history = &state.history;
    let start = query.data_start_year.unwrap_or_else(|| history.first_year());
    let records = history.slice_from(start);
    if records.is_empty() {
        return error_response(
            StatusCode::BAD_REQUEST,
            &format!(
                "dataStartYear must be between {} and {}",
                history.first_year(),
                history.last_year()
            ),
        );
    }
    json_response(
        StatusCode::OK,
        ReturnsResponse {
            years: records.iter().map(|r| r.year).collect(),
            us_stock: records.iter().map(|r| r.us_stock_return).collect(),
            intl_stock: records.iter().map(|r| r.intl_stock_return).collect(),
            us_bond: records.iter().map(|r| r.us_bond_return).collect(),
            us_inflation: records.iter().map(|r| r.inflation_rate).collect(),
        },
    )
}

/// Runs CPU-bound core work off the async workers.
async fn run_blocking<T, F>(history: Arc<HistoricalReturns>, job: F) -> Response
where
    T: Serialize + Send + 'static,
    F: FnOnce(&HistoricalReturns) -> SimResult<T> + Send + 'static,
{
    match tokio::task::spawn_blocking(move || job(&history)).await {
        Ok(Ok(body)) => json_response(StatusCode::OK, body),
        Ok(Err(err)) => sim_error_response(err),
        Err(err) => {
            error!(error = %err, "simulation task failed");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "simulation task failed")
        }
    }
}

fn sim_error_response(err: SimError) -> Response {
    if err.is_config() {
        return error_response(StatusCode::BAD_REQUEST, &err.to_string());
    }
    error!(error = %err, "simulation failed");
    error_response(StatusCode::INTERNAL_SERVER_ERROR, &err.to_string())
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

#[cfg(test)]
fn args_from_json(json: &str) -> Result<SimulationArgs, String> {
    let payload = serde_json::from_str::<SimulatePayload>(json)
        .map_err(|e| format!("Invalid API JSON payload: {e}"))?;
    Ok(args_from_payload(payload))
}

fn args_from_payload(payload: SimulatePayload) -> SimulationArgs {
    let mut args = default_args_for_api();

    if let Some(v) = payload.initial_portfolio {
        args.initial_portfolio = v;
    }
    if let Some(v) = payload.annual_withdrawal {
        args.annual_withdrawal = v;
    }
    if let Some(v) = payload.simulations {
        args.simulations = v;
    }
    if let Some(v) = payload.seed {
        args.seed = v;
    }
    if let Some(v) = payload.us_stock {
        args.us_stock = v;
    }
    if let Some(v) = payload.intl_stock {
        args.intl_stock = v;
    }
    if let Some(v) = payload.us_bond {
        args.us_bond = v;
    }
    if let Some(v) = payload.us_stock_expense {
        args.us_stock_expense = v;
    }
    if let Some(v) = payload.intl_stock_expense {
        args.intl_stock_expense = v;
    }
    if let Some(v) = payload.us_bond_expense {
        args.us_bond_expense = v;
    }
    if let Some(v) = payload.retirement_years {
        args.retirement_years = v;
    }
    if let Some(v) = payload.min_block {
        args.min_block = v;
    }
    if let Some(v) = payload.max_block {
        args.max_block = v;
    }
    if let Some(v) = payload.data_start_year {
        args.data_start_year = v;
    }
    if let Some(v) = payload.strategy {
        args.strategy = v.into();
    }
    if let Some(v) = payload.dynamic_ceiling {
        args.dynamic_ceiling = v;
    }
    if let Some(v) = payload.dynamic_floor {
        args.dynamic_floor = v;
    }
    if let Some(v) = payload.target_success {
        args.target_success = v;
    }
    if let Some(v) = payload.upper_guardrail {
        args.upper_guardrail = v;
    }
    if let Some(v) = payload.lower_guardrail {
        args.lower_guardrail = v;
    }
    if let Some(v) = payload.adjustment_pct {
        args.adjustment_pct = v;
    }
    if let Some(v) = payload.adjustment_mode {
        args.adjustment_mode = v.into();
    }
    if let Some(v) = payload.min_remaining_years {
        args.min_remaining_years = v;
    }
    if let Some(v) = payload.baseline_rate {
        args.baseline_rate = v;
    }
    if let Some(v) = payload.inner_simulations {
        args.inner_simulations = v;
    }
    if let Some(v) = payload.guardrail_cadence {
        args.guardrail_cadence = v;
    }
    if let Some(flows) = payload.cash_flows {
        args.cash_flows = flows.into_iter().map(CashFlowItem::from).collect();
    }

    args
}

fn default_args_for_api() -> SimulationArgs {
    SimulationArgs {
        initial_portfolio: 1_000_000.0,
        annual_withdrawal: 40_000.0,
        us_stock: 40.0,
        intl_stock: 40.0,
        us_bond: 20.0,
        us_stock_expense: 0.5,
        intl_stock_expense: 0.5,
        us_bond_expense: 0.5,
        retirement_years: 30,
        min_block: 5,
        max_block: 15,
        simulations: 2_000,
        data_start_year: 1926,
        strategy: CliStrategy::Fixed,
        dynamic_ceiling: 5.0,
        dynamic_floor: 2.5,
        target_success: 80.0,
        upper_guardrail: 99.0,
        lower_guardrail: 50.0,
        adjustment_pct: 50.0,
        adjustment_mode: CliAdjustmentMode::Amount,
        min_remaining_years: 10,
        baseline_rate: 3.3,
        inner_simulations: 200,
        guardrail_cadence: 1,
        cash_flows: Vec::new(),
        seed: 42,
    }
}
