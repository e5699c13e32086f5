use crate::error::{validate_observations, Error, Result};
use crate::logspace::*;
use crate::params::ParameterSet;
use crate::State;
use ndarray::prelude::*;

/// The most likely sequence of hidden states and its joint log probability
/// $\log P(X=x^*, Y=y|θ)$.
#[derive(Clone, Debug, PartialEq)]
pub struct Viterbi {
    pub path: Array1<State>,
    pub log_probability: f64,
}

impl Viterbi {
    /// This is the Viterbi algorithm, in log space. Given a sequence of observations, return the
    /// most likely sequence of states.
    ///
    /// Ties are broken in favor of the lowest state index, so the result is reproducible. An
    /// empty sequence of observations gives an empty path. Fails with `ImpossibleSequence` if no
    /// sequence of states can explain the observations.
    pub fn run(ys: &[f64], params: &ParameterSet) -> Result<Self> {
        validate_observations(ys, 0)?;
        // Special-case when the sequence of observations is empty
        if ys.is_empty() {
            return Ok(Self {
                path: array![],
                log_probability: 0.0,
            });
        }

        let n = params.n_states();
        let log_a = params.log_a();
        let log_b = params.log_emissions(ys);

        // delta is a T × K matrix where delta[t, j] is the log probability of the most likely
        // sequence of hidden states that ends in state j at time t.
        let mut delta = Array2::from_elem((ys.len(), n), f64::NEG_INFINITY);

        // x_to_prev_x is a (T - 1) × K matrix where each entry x_to_prev_x[t, j] is the most likely
        // state at time t given that we're in state j at time t + 1.
        let mut x_to_prev_x = Array2::zeros((ys.len() - 1, n));

        delta.row_mut(0).assign(&(params.log_pi() + &log_b.row(0)));

        for t in 1..ys.len() {
            for j in 0..n {
                let mut best: Option<(usize, f64)> = None;
                for i in 0..n {
                    let score = delta[(t - 1, i)] + log_a[(i, j)];
                    if best.map_or(true, |(_, best_score)| score > best_score) {
                        best = Some((i, score));
                    }
                }
                if let Some((i, score)) = best {
                    delta[(t, j)] = score + log_b[(t, j)];
                    x_to_prev_x[(t - 1, j)] = i;
                }
            }
        }

        let (mut i, log_probability) = delta
            .row(ys.len() - 1)
            .maxf()
            .unwrap_or((0, f64::NEG_INFINITY));
        if !log_probability.is_finite() {
            return Err(Error::ImpossibleSequence);
        }
        let mut path = Array1::zeros(ys.len());
        path[ys.len() - 1] = i;
        for t in (0..ys.len() - 1).rev() {
            i = x_to_prev_x[(t, i)];
            path[t] = i;
        }
        Ok(Self {
            path,
            log_probability,
        })
    }
}

/// Decode the single most likely sequence of hidden states. See [`Viterbi::run`].
///
/// This is not the same as taking the most likely state at each time step from the posteriors,
/// which doesn't necessarily give the most likely sequence, or even a possible one.
pub fn decode(ys: &[f64], params: &ParameterSet) -> Result<Array1<State>> {
    Viterbi::run(ys, params).map(|viterbi| viterbi.path)
}
