use crate::emission::{Gaussian, MIN_RESPONSIBILITY, MIN_VARIANCE};
use crate::error::{validate_observations, Error, Result};
use crate::forward_backward::ForwardBackward;
use crate::logspace::*;
use crate::params::ParameterSet;
use log::{debug, info, warn};
use ndarray::prelude::*;
use ndarray::s;
#[cfg(feature = "serde-1")]
use serde::{Deserialize, Serialize};

/// Recoverable conditions found while fitting. The fit still produces usable parameters.
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde-1", derive(Serialize, Deserialize))]
pub enum Diagnostic {
    /// EM stopped at the iteration cap before the improvement in log likelihood dropped below
    /// the tolerance.
    NonConvergence {
        iterations: usize,
        last_improvement: Option<f64>,
    },

    /// No observations were assigned to `state` during the M-step of `iteration`, so its emission
    /// and transition row kept their previous values. Only the first occurrence is reported.
    DegenerateState { state: usize, iteration: usize },
}

/// The Baum-Welch estimator: expectation-maximization for HMMs (Baum et. al. 1970).
///
/// Each iteration runs [`ForwardBackward`] on the current parameters (E-step) and then
/// re-estimates them from the posteriors (M-step):
///
/// $$
/// π_i^* = γ_i(0) \qquad
/// a_{ij}^*=\frac{\sum^{T-2}\_{t=0}ξ\_{ij}(t)}{\sum^{T-2}\_{t=0}γ_i(t)}
/// $$
///
/// The emissions are re-estimated by [`Gaussian::reestimate`] with $γ_i$ as the weights.
///
/// Caveats:
/// - This only finds a local maximum of the likelihood, which depends on the initial parameters.
/// - Due to a lack of identifiability, an HMM with $K$ states has $K!$ equivalent solutions.
///
/// The estimator is deterministic: the same observations and initial parameters always give the
/// same result.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct BaumWelch {
    tolerance: f64,
    max_iterations: usize,
    variance_floor: f64,
}

/// The output of [`BaumWelch::run`]
#[derive(Clone, Debug)]
pub struct Estimate {
    /// The final parameters
    pub params: ParameterSet,
    /// The log likelihood of every evaluated parameter set, starting with the initial one
    pub log_likelihoods: Vec<f64>,
    pub converged: bool,
    /// The number of M-steps performed
    pub iterations: usize,
    pub diagnostics: Vec<Diagnostic>,
    /// The forward-backward pass at the final parameters
    pub posterior: ForwardBackward,
}

impl BaumWelch {
    /// EM stops once an iteration improves the log likelihood by less than `tolerance`, or after
    /// `max_iterations` M-steps.
    pub fn new(tolerance: f64, max_iterations: usize) -> Result<Self> {
        if !(tolerance >= 0.0 && tolerance.is_finite()) {
            return Err(Error::InvalidParameter(format!(
                "tolerance must be finite and non-negative, got {}",
                tolerance
            )));
        }
        if max_iterations == 0 {
            return Err(Error::InvalidParameter(
                "max_iterations must be at least 1".to_string(),
            ));
        }
        Ok(Self {
            tolerance,
            max_iterations,
            variance_floor: MIN_VARIANCE,
        })
    }

    /// Re-estimated variances never go below `variance_floor`.
    pub fn with_variance_floor(mut self, variance_floor: f64) -> Result<Self> {
        if !(variance_floor > 0.0 && variance_floor.is_finite()) {
            return Err(Error::InvalidParameter(format!(
                "variance floor must be positive and finite, got {}",
                variance_floor
            )));
        }
        self.variance_floor = variance_floor;
        Ok(self)
    }

    pub fn tolerance(&self) -> f64 {
        self.tolerance
    }

    pub fn max_iterations(&self) -> usize {
        self.max_iterations
    }

    pub fn variance_floor(&self) -> f64 {
        self.variance_floor
    }

    /// Fit starting from `initial`. Variances in `initial` below the variance floor are raised to
    /// it before the first iteration.
    ///
    /// Reaching the iteration cap is not an error: the result is
    /// flagged as not converged and carries a `NonConvergence` diagnostic.
    pub fn run(&self, ys: &[f64], initial: ParameterSet) -> Result<Estimate> {
        validate_observations(ys, 2)?;

        // Degenerate states keep their emission, so the floor has to hold from the start
        let mut params = initial.with_variance_floor(self.variance_floor);
        let mut log_likelihoods: Vec<f64> = Vec::new();
        let mut diagnostics = Vec::new();
        let mut iterations = 0;

        loop {
            let posterior = ForwardBackward::new(ys, &params)?;
            let ll = posterior.log_likelihood();
            let improvement = log_likelihoods.last().map(|prev| ll - prev);
            log_likelihoods.push(ll);
            debug!(
                "iteration {}: log likelihood {}, improvement {:?}",
                iterations, ll, improvement
            );

            if let Some(improvement) = improvement {
                if improvement < -self.tolerance {
                    warn!(
                        "log likelihood decreased by {} at iteration {}",
                        -improvement, iterations
                    );
                }
                if improvement < self.tolerance {
                    info!(
                        "converged after {} iterations with log likelihood {}",
                        iterations, ll
                    );
                    return Ok(Estimate {
                        params,
                        log_likelihoods,
                        converged: true,
                        iterations,
                        diagnostics,
                        posterior,
                    });
                }
            }

            if iterations == self.max_iterations {
                warn!(
                    "did not converge after {} iterations, last improvement {:?}",
                    iterations, improvement
                );
                diagnostics.push(Diagnostic::NonConvergence {
                    iterations,
                    last_improvement: improvement,
                });
                return Ok(Estimate {
                    params,
                    log_likelihoods,
                    converged: false,
                    iterations,
                    diagnostics,
                    posterior,
                });
            }

            let (next, degenerate) = maximize(ys, &params, &posterior, self.variance_floor)?;
            iterations += 1;
            for state in degenerate {
                let seen = diagnostics.iter().any(|d| match d {
                    Diagnostic::DegenerateState { state: s, .. } => *s == state,
                    _ => false,
                });
                if !seen {
                    warn!(
                        "state {} has no responsibility at iteration {}, keeping its parameters",
                        state, iterations
                    );
                    diagnostics.push(Diagnostic::DegenerateState {
                        state,
                        iteration: iterations,
                    });
                }
            }
            params = next;
        }
    }
}

/// The M-step. Returns the re-estimated parameters and the states that kept their previous
/// emission because no observations were assigned to them.
pub(crate) fn maximize(
    ys: &[f64],
    params: &ParameterSet,
    posterior: &ForwardBackward,
    variance_floor: f64,
) -> Result<(ParameterSet, Vec<usize>)> {
    let n = params.n_states();
    let gamma = posterior.gamma();

    let pi = gamma.row(0).to_owned().normalize("π")?;

    let xi_sums = posterior.xi().sum_axis(Axis(0));
    let mut a = params.a().clone();
    for i in 0..n {
        let gammas_sum = gamma.slice(s![..-1, i]).sum();
        if gammas_sum < MIN_RESPONSIBILITY {
            // If we have never seen a transition away from state i, keep the old row
            debug!("keeping transition row {}: no mass leaves it", i);
            continue;
        }
        let mut row = a.row_mut(i);
        row.assign(&(&xi_sums.row(i) / gammas_sum));
        row.nip("each row of A")?;
    }

    let ys = ArrayView1::from(ys);
    let mut degenerate = Vec::new();
    let emissions = params
        .emissions()
        .iter()
        .enumerate()
        .map(
            |(k, &old)| match Gaussian::reestimate(ys, gamma.column(k), variance_floor) {
                Some(new) => new,
                None => {
                    degenerate.push(k);
                    old
                }
            },
        )
        .collect();

    Ok((ParameterSet::new(pi, a, emissions)?, degenerate))
}
