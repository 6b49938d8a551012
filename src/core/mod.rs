mod backtest;
mod bootstrap;
mod comparison;
mod error;
mod evolution;
#[cfg(test)]
pub(crate) mod fixtures;
mod guardrail;
mod history;
mod inversion;
mod orchestrator;
mod policy;
mod rng;
mod solver;
mod stats;
mod sweep;
mod types;

pub use backtest::{BacktestResult, BacktestSeries, guardrail_backtest};
pub use bootstrap::{BlockBootstrap, SampledPath};
pub use comparison::{GuardrailComparison, PolicyMetrics, compare_guardrail};
pub use error::{SimError, SimResult};
pub use evolution::{PortfolioPlan, YearContext, evolve};
pub use guardrail::{GuardrailPolicy, ScenarioSet};
pub use history::{HistoricalReturns, INTL_PROXY_BEFORE};
pub use inversion::invert_success_curve;
pub use orchestrator::{run_trials, simulate};
pub use policy::WithdrawalPolicy;
pub use solver::{
    PortfolioSolveConfig, PortfolioSolveIteration, PortfolioSolveResult, solve_portfolio,
};
pub use sweep::{
    AllocationResult, AllocationSweepParams, AllocationSweepResult, DEFAULT_TARGETS, RatePoint,
    RateSweepParams, RateSweepResult, SweepOutcome, TargetRateResult, allocation_grid,
    sweep_allocation, sweep_rate,
};
pub use types::{
    AdjustmentEvent, AdjustmentMode, AggregateResult, AssetAllocation, CashFlowItem,
    ExpenseRatios, FinalDistribution, GuardrailParams, GuardrailState, MAX_GRID_POINTS,
    PercentileTrajectories, PercentileValue, ReturnRecord, SimulationConfig, SimulationTrial, WithdrawalStrategy,
};
