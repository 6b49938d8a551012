use serde::Serialize;
use tracing::debug;

use super::error::{SimError, SimResult};
use super::history::HistoricalReturns;
use super::orchestrator::simulate;
use super::stats::binomial_ci_half_width;
use super::types::{SimulationConfig, WithdrawalStrategy};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PortfolioSolveConfig {
    pub target_success: f64,
    pub search_min: f64,
    pub search_max: f64,
    pub tolerance: f64,
    pub max_iterations: u32,
    pub simulations_per_iteration: u32,
    pub final_simulations: u32,
}

impl Default for PortfolioSolveConfig {
    fn default() -> Self {
        Self {
            target_success: 0.90,
            search_min: 100_000.0,
            search_max: 10_000_000.0,
            tolerance: 1_000.0,
            max_iterations: 40,
            simulations_per_iteration: 1_000,
            final_simulations: 5_000,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PortfolioSolveIteration {
    pub iteration: u32,
    pub lower_bound: f64,
    pub upper_bound: f64,
    pub candidate_portfolio: f64,
    pub success_rate: f64,
    pub success_ci_half_width: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PortfolioSolveResult {
    pub target_success: f64,
    pub annual_withdrawal: f64,
    pub search_min: f64,
    pub search_max: f64,
    pub tolerance: f64,
    pub solved_portfolio: Option<f64>,
    pub implied_withdrawal_rate: Option<f64>,
    pub achieved_success_rate: Option<f64>,
    pub achieved_success_ci_half_width: Option<f64>,
    pub iterations: Vec<PortfolioSolveIteration>,
    pub converged: bool,
    pub feasible: bool,
    pub message: String,
}

#[derive(Debug, Clone, Copy)]
struct CandidateEval {
    success_rate: f64,
    success_ci_half_width: f64,
}

/// Bisects for the smallest initial portfolio that reaches the target.
/// Every candidate runs on the same seed.
pub fn solve_portfolio(
    history: &HistoricalReturns,
    config: &SimulationConfig,
    solve: PortfolioSolveConfig,
) -> SimResult<PortfolioSolveResult> {
    validate_solve_config(config, solve)?;
    config.validate(history)?;

    let mut iterations = Vec::with_capacity(solve.max_iterations as usize);
    let low_eval = evaluate_candidate(
        history,
        config,
        solve.search_min,
        solve.simulations_per_iteration,
    )?;
    let high_eval = evaluate_candidate(
        history,
        config,
        solve.search_max,
        solve.simulations_per_iteration,
    )?;

    let mut solved_portfolio = None;
    let mut converged = false;
    let feasible;
    let message;

    if low_eval.success_rate + 1e-12 >= solve.target_success {
        solved_portfolio = Some(solve.search_min);
        converged = true;
        feasible = true;
        message = "Already meets target at the lower portfolio bound.".to_string();
    } else if high_eval.success_rate + 1e-12 < solve.target_success {
        feasible = false;
        message = "No feasible portfolio found within the search bounds.".to_string();
    } else {
        let mut lo = solve.search_min;
        let mut hi = solve.search_max;
        let mut it = 0;
        while it < solve.max_iterations {
            it += 1;
            let mid = (lo + hi) * 0.5;
            let eval = evaluate_candidate(history, config, mid, solve.simulations_per_iteration)?;
            iterations.push(PortfolioSolveIteration {
                iteration: it,
                lower_bound: lo,
                upper_bound: hi,
                candidate_portfolio: mid,
                success_rate: eval.success_rate,
                success_ci_half_width: eval.success_ci_half_width,
            });

            if eval.success_rate + 1e-12 >= solve.target_success {
                hi = mid;
            } else {
                lo = mid;
            }

            if (hi - lo).abs() <= solve.tolerance {
                converged = true;
                break;
            }
        }
        solved_portfolio = Some(hi);
        feasible = true;
        message = if converged {
            "Solved required portfolio.".to_string()
        } else {
            "Reached max iterations before tolerance was met; returning best estimate."
                .to_string()
        };
    }

    let mut achieved_success_rate = None;
    let mut achieved_success_ci_half_width = None;
    if let Some(portfolio) = solved_portfolio {
        let final_eval = evaluate_candidate(history, config, portfolio, solve.final_simulations)?;
        achieved_success_rate = Some(final_eval.success_rate);
        achieved_success_ci_half_width = Some(final_eval.success_ci_half_width);
    }
    debug!(
        feasible,
        converged,
        iterations = iterations.len(),
        solved = ?solved_portfolio,
        "portfolio solve finished"
    );

    Ok(PortfolioSolveResult {
        target_success: solve.target_success,
        annual_withdrawal: config.annual_withdrawal,
        search_min: solve.search_min,
        search_max: solve.search_max,
        tolerance: solve.tolerance,
        solved_portfolio,
        implied_withdrawal_rate: solved_portfolio
            .filter(|p| *p > 0.0)
            .map(|p| config.annual_withdrawal / p),
        achieved_success_rate,
        achieved_success_ci_half_width,
        iterations,
        converged,
        feasible,
        message,
    })
}

fn evaluate_candidate(
    history: &HistoricalReturns,
    base: &SimulationConfig,
    portfolio: f64,
    simulations: u32,
) -> SimResult<CandidateEval> {
    let config = SimulationConfig {
        initial_portfolio: portfolio,
        num_simulations: simulations.max(1),
        ..base.clone()
    };
    let result = simulate(history, &config)?;
    Ok(CandidateEval {
        success_rate: result.success_rate,
        success_ci_half_width: binomial_ci_half_width(result.success_rate, config.num_simulations),
    })
}

fn validate_solve_config(config: &SimulationConfig, solve: PortfolioSolveConfig) -> SimResult<()> {
    if matches!(config.strategy, WithdrawalStrategy::Guardrail(_)) {
        return Err(SimError::config(
            "portfolio solve supports the fixed and dynamic strategies",
        ));
    }
    if !(0.0..=1.0).contains(&solve.target_success) {
        return Err(SimError::config("target_success must be between 0 and 1"));
    }
    if !solve.search_min.is_finite() || !solve.search_max.is_finite() {
        return Err(SimError::config("search bounds must be finite"));
    }
    if solve.search_min <= 0.0 {
        return Err(SimError::config("search_min must be > 0"));
    }
    if solve.search_max <= solve.search_min {
        return Err(SimError::config("search_max must be greater than search_min"));
    }
    if !solve.tolerance.is_finite() || solve.tolerance <= 0.0 {
        return Err(SimError::config("tolerance must be > 0"));
    }
    if solve.max_iterations == 0 {
        return Err(SimError::config("max_iterations must be > 0"));
    }
    if solve.simulations_per_iteration == 0 {
        return Err(SimError::config("simulations_per_iteration must be > 0"));
    }
    if solve.final_simulations == 0 {
        return Err(SimError::config("final_simulations must be > 0"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::fixtures::{sample_config, synthetic_history};
    use crate::core::types::ReturnRecord;

    fn assert_close(actual: f64, expected: f64, tol: f64) {
        assert!(
            (actual - expected).abs() <= tol,
            "expected {expected}, got {actual}, tolerance {tol}"
        );
    }

    // Zero returns and inflation: survival means covering every withdrawal.
    fn flat_history() -> HistoricalReturns {
        HistoricalReturns::from_records(
            (1950..1990)
                .map(|year| ReturnRecord {
                    year,
                    us_stock_return: 0.0,
                    intl_stock_return: 0.0,
                    us_bond_return: 0.0,
                    inflation_rate: 0.0,
                })
                .collect(),
        )
        .expect("flat history")
    }

    fn flat_config() -> SimulationConfig {
        SimulationConfig {
            data_start_year: 1950,
            retirement_years: 10,
            annual_withdrawal: 10_000.0,
            expense_ratios: Default::default(),
            num_simulations: 1,
            ..sample_config()
        }
    }

    fn solve(target: f64, max: f64) -> PortfolioSolveConfig {
        PortfolioSolveConfig {
            target_success: target,
            search_min: 1_000.0,
            search_max: max,
            tolerance: 50.0,
            max_iterations: 40,
            simulations_per_iteration: 1,
            final_simulations: 1,
        }
    }

    #[test]
    fn finds_deterministic_required_portfolio() {
        let history = flat_history();
        let config = flat_config();
        let result = solve_portfolio(&history, &config, solve(1.0, 500_000.0)).expect("solve");
        assert!(result.feasible);
        assert!(result.converged);
        // Balance must stay strictly positive after ten $10k withdrawals.
        assert_close(result.solved_portfolio.expect("value"), 100_000.0, 100.0);
        assert_close(result.achieved_success_rate.expect("rate"), 1.0, 1e-9);
        assert!(!result.iterations.is_empty());
    }

    #[test]
    fn reports_infeasible_when_bounds_too_low() {
        let history = flat_history();
        let result =
            solve_portfolio(&history, &flat_config(), solve(1.0, 50_000.0)).expect("result");
        assert!(!result.feasible);
        assert!(result.solved_portfolio.is_none());
        assert!(result.iterations.is_empty());
    }

    #[test]
    fn short_circuits_when_lower_bound_meets_target() {
        let history = flat_history();
        let mut config = flat_config();
        config.annual_withdrawal = 0.0;
        let result = solve_portfolio(&history, &config, solve(1.0, 50_000.0)).expect("result");
        assert!(result.feasible);
        assert_eq!(result.solved_portfolio, Some(1_000.0));
    }

    #[test]
    fn solves_on_bootstrapped_history() {
        let history = synthetic_history();
        let config = SimulationConfig {
            num_simulations: 200,
            ..sample_config()
        };
        let result = solve_portfolio(
            &history,
            &config,
            PortfolioSolveConfig {
                target_success: 0.85,
                simulations_per_iteration: 200,
                final_simulations: 200,
                tolerance: 5_000.0,
                ..PortfolioSolveConfig::default()
            },
        )
        .expect("solve");
        assert!(result.feasible);
        let achieved = result.achieved_success_rate.expect("rate");
        assert!(achieved >= 0.85);
        let rate = result.implied_withdrawal_rate.expect("rate");
        assert!(rate > 0.0 && rate < 0.10);
    }

    #[test]
    fn rejects_guardrail_strategy_and_bad_bounds() {
        let history = flat_history();
        let mut config = flat_config();
        config.strategy = WithdrawalStrategy::Guardrail(Default::default());
        assert!(solve_portfolio(&history, &config, solve(0.9, 10_000.0)).is_err());

        let bad = PortfolioSolveConfig {
            search_max: 500.0,
            ..solve(0.9, 10_000.0)
        };
        assert!(solve_portfolio(&history, &flat_config(), bad)
            .expect_err("bounds")
            .is_config());
    }
}
