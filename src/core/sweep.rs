use std::time::{Duration, Instant};

use rayon::prelude::*;
use serde::Serialize;
use tracing::{debug, warn};

use super::error::{SimError, SimResult};
use super::history::HistoricalReturns;
use super::inversion::invert_success_curve;
use super::orchestrator::{run_trial, sampler_for};
use super::stats::{mean, percentile, sorted, trajectory_bands};
use super::types::{
    AssetAllocation, MAX_GRID_POINTS, SimulationConfig, SimulationTrial, rate_grid,
};

pub const DEFAULT_TARGETS: [f64; 6] = [1.0, 0.95, 0.90, 0.85, 0.80, 0.75];

/// Result of a sweep that may have hit its time limit. An incomplete sweep
/// still carries every grid point that finished.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "camelCase")]
pub enum SweepOutcome<T> {
    #[serde(rename_all = "camelCase")]
    Complete { result: T },
    #[serde(rename_all = "camelCase")]
    Incomplete {
        result: T,
        completed_points: usize,
        total_points: usize,
    },
}

impl<T> SweepOutcome<T> {
    pub fn is_complete(&self) -> bool {
        matches!(self, SweepOutcome::Complete { .. })
    }

    pub fn result(&self) -> &T {
        match self {
            SweepOutcome::Complete { result } | SweepOutcome::Incomplete { result, .. } => result,
        }
    }

    pub fn into_result(self) -> T {
        match self {
            SweepOutcome::Complete { result } | SweepOutcome::Incomplete { result, .. } => result,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RateSweepParams {
    pub rate_min: f64,
    pub rate_max: f64,
    pub rate_step: f64,
    pub targets: Vec<f64>,
    pub time_limit: Option<Duration>,
}

impl Default for RateSweepParams {
    fn default() -> Self {
        Self {
            rate_min: 0.0,
            rate_max: 0.10,
            rate_step: 0.0025,
            targets: DEFAULT_TARGETS.to_vec(),
            time_limit: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RatePoint {
    pub rate: f64,
    pub annual_withdrawal: f64,
    pub success_rate: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TargetRateResult {
    pub target_success: f64,
    pub withdrawal_rate: Option<f64>,
    pub annual_withdrawal: Option<f64>,
    pub required_portfolio: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RateSweepResult {
    pub curve: Vec<RatePoint>,
    pub target_results: Vec<TargetRateResult>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AllocationSweepParams {
    pub allocation_step: f64,
    pub time_limit: Option<Duration>,
}

impl Default for AllocationSweepParams {
    fn default() -> Self {
        Self {
            allocation_step: 0.1,
            time_limit: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AllocationResult {
    pub allocation: AssetAllocation,
    pub success_rate: f64,
    pub median_final_balance: f64,
    pub mean_final_balance: f64,
    /// First year the 10th-percentile real balance reaches zero.
    pub p10_depletion_year: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AllocationSweepResult {
    pub results: Vec<AllocationResult>,
    pub best_by_success: Option<AllocationResult>,
}

struct Deadline(Option<Instant>);

impl Deadline {
    fn after(limit: Option<Duration>) -> Self {
        Deadline(limit.map(|d| Instant::now() + d))
    }

    fn expired(&self) -> bool {
        self.0.is_some_and(|at| Instant::now() >= at)
    }
}

/// `None` if the deadline cut any trial off.
fn run_point<T, F>(
    history: &HistoricalReturns,
    config: &SimulationConfig,
    deadline: &Deadline,
    summarize: F,
) -> SimResult<Option<Vec<T>>>
where
    T: Send,
    F: Fn(SimulationTrial) -> T + Sync,
{
    let sampler = sampler_for(history, config)?;
    let trials: SimResult<Vec<Option<T>>> = (0..config.num_simulations as u64)
        .into_par_iter()
        .map(|trial| {
            if deadline.expired() {
                return Ok(None);
            }
            run_trial(history, &sampler, config, trial).map(|t| Some(summarize(t)))
        })
        .collect();
    Ok(trials?.into_iter().collect())
}

fn validate_targets(targets: &[f64]) -> SimResult<()> {
    match targets.iter().find(|t| !(0.0..=1.0).contains(*t)) {
        Some(t) => Err(SimError::config(format!(
            "target success {t} must be between 0 and 1"
        ))),
        None => Ok(()),
    }
}

pub fn sweep_rate(
    history: &HistoricalReturns,
    config: &SimulationConfig,
    params: &RateSweepParams,
) -> SimResult<SweepOutcome<RateSweepResult>> {
    config.validate(history)?;
    if !(params.rate_step > 0.0) || !(params.rate_min >= 0.0) || params.rate_max < params.rate_min
    {
        return Err(SimError::config(
            "rate sweep needs rate_step > 0 and 0 <= rate_min <= rate_max",
        ));
    }
    validate_targets(&params.targets)?;

    let rates = rate_grid(params.rate_min, params.rate_max, params.rate_step)?;
    let deadline = Deadline::after(params.time_limit);
    let portfolio = config.initial_portfolio;

    let points: Vec<Option<RatePoint>> = rates
        .par_iter()
        .map(|&rate| -> SimResult<Option<RatePoint>> {
            let point_config = SimulationConfig {
                annual_withdrawal: rate * portfolio,
                ..config.clone()
            };
            let survived = run_point(history, &point_config, &deadline, |t| !t.depleted())?;
            Ok(survived.map(|flags| RatePoint {
                rate,
                annual_withdrawal: rate * portfolio,
                success_rate: flags.iter().filter(|&&ok| ok).count() as f64
                    / flags.len().max(1) as f64,
            }))
        })
        .collect::<SimResult<_>>()?;

    let total_points = points.len();
    let prefix: Vec<RatePoint> = points.iter().map_while(|p| *p).collect();
    let complete = prefix.len() == total_points;
    let curve_rates: Vec<f64> = prefix.iter().map(|p| p.rate).collect();
    let successes: Vec<f64> = prefix.iter().map(|p| p.success_rate).collect();

    let target_results = params
        .targets
        .iter()
        .map(|&target| {
            let mut rate = invert_success_curve(&curve_rates, &successes, target);
            // A truncated curve that never drops below the target says nothing
            // about where it would cross.
            if !complete && successes.last().is_some_and(|&s| s >= target) {
                rate = None;
            }
            let rate = rate.filter(|r| *r > 0.0);
            TargetRateResult {
                target_success: target,
                withdrawal_rate: rate,
                annual_withdrawal: rate.map(|r| r * portfolio),
                required_portfolio: rate.map(|r| config.annual_withdrawal / r),
            }
        })
        .collect();

    let curve: Vec<RatePoint> = points.into_iter().flatten().collect();
    let completed_points = curve.len();
    debug!(points = completed_points, total_points, "rate sweep finished");
    let result = RateSweepResult {
        curve,
        target_results,
    };
    Ok(finish(result, completed_points, total_points))
}

fn finish<T>(result: T, completed_points: usize, total_points: usize) -> SweepOutcome<T> {
    if completed_points == total_points {
        SweepOutcome::Complete { result }
    } else {
        warn!(completed_points, total_points, "sweep hit its time limit");
        SweepOutcome::Incomplete {
            result,
            completed_points,
            total_points,
        }
    }
}

/// Every `(us_stock, intl_stock, us_bond)` on the `step` grid summing to 1.
/// The bond weight is derived from the other two so the sum is exact.
pub fn allocation_grid(step: f64) -> SimResult<Vec<AssetAllocation>> {
    if !(step > 0.0 && step <= 1.0) {
        return Err(SimError::config("allocation_step must be in (0, 1]"));
    }
    let per_axis = (1.0 / step + 1e-9).floor();
    if (per_axis + 1.0) * (per_axis + 2.0) / 2.0 > MAX_GRID_POINTS as f64 {
        return Err(SimError::config(format!(
            "allocation_step {step} exceeds {MAX_GRID_POINTS} allocations"
        )));
    }
    let n = per_axis as usize;
    let mut grid = Vec::new();
    for i in 0..=n {
        for j in 0..=(n - i) {
            let us_stock = i as f64 * step;
            let intl_stock = j as f64 * step;
            let us_bond = 1.0 - us_stock - intl_stock;
            let k = (us_bond / step).round();
            if us_bond < -1e-9 || (k * step - us_bond).abs() > 1e-6 {
                continue;
            }
            grid.push(AssetAllocation::new(us_stock, intl_stock, us_bond.max(0.0)));
        }
    }
    Ok(grid)
}

struct FinalSummary {
    survived: bool,
    final_balance: f64,
    real_balances: Vec<f64>,
}

pub fn sweep_allocation(
    history: &HistoricalReturns,
    config: &SimulationConfig,
    params: &AllocationSweepParams,
) -> SimResult<SweepOutcome<AllocationSweepResult>> {
    config.validate(history)?;
    let grid = allocation_grid(params.allocation_step)?;
    if grid.is_empty() {
        return Err(SimError::config(format!(
            "allocation_step {} yields no allocation summing to 1",
            params.allocation_step
        )));
    }

    let deadline = Deadline::after(params.time_limit);
    let years = config.retirement_years as usize;

    let points: Vec<Option<AllocationResult>> = grid
        .par_iter()
        .map(|&allocation| -> SimResult<Option<AllocationResult>> {
            let point_config = SimulationConfig {
                allocation,
                ..config.clone()
            };
            let summaries = run_point(history, &point_config, &deadline, |t| FinalSummary {
                survived: !t.depleted(),
                final_balance: t.final_real_balance(),
                real_balances: t.real_balances,
            })?;
            Ok(summaries.map(|s| summarize_allocation(allocation, &s, years)))
        })
        .collect::<SimResult<_>>()?;

    let total_points = points.len();
    let results: Vec<AllocationResult> = points.into_iter().flatten().collect();
    let best_by_success = results.iter().copied().max_by(|a, b| {
        a.success_rate
            .total_cmp(&b.success_rate)
            .then(a.median_final_balance.total_cmp(&b.median_final_balance))
    });
    let completed_points = results.len();
    debug!(points = completed_points, total_points, "allocation sweep finished");

    Ok(finish(
        AllocationSweepResult {
            results,
            best_by_success,
        },
        completed_points,
        total_points,
    ))
}

fn summarize_allocation(
    allocation: AssetAllocation,
    summaries: &[FinalSummary],
    years: usize,
) -> AllocationResult {
    let n = summaries.len().max(1) as f64;
    let finals = sorted(summaries.iter().map(|s| s.final_balance).collect());
    let p10 = trajectory_bands(summaries.iter().map(|s| s.real_balances.as_slice()), years + 1).p10;
    AllocationResult {
        allocation,
        success_rate: summaries.iter().filter(|s| s.survived).count() as f64 / n,
        mean_final_balance: mean(&finals),
        median_final_balance: percentile(&finals, 50.0),
        p10_depletion_year: p10
            .iter()
            .skip(1)
            .position(|&b| b <= 0.0)
            .map(|idx| idx as u32 + 1),
    }
}
