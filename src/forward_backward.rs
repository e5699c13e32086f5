use crate::error::{validate_observations, Error, Result};
use crate::logspace::*;
use crate::params::ParameterSet;
use ndarray::prelude::*;
use ndarray::{s, Zip};

/// The output of one forward-backward pass over an observation sequence.
///
/// All lattices are computed in log space, so long sequences don't underflow.
///
/// Let $α_i(t) = P(Y_0=y_0, \ldots, Y_t=y_t, X_t=i | θ)$
///
/// Let $β_i(t) = P(Y_{t+1}=y_{t+1}, \ldots, Y_{T-1}=y_{T-1} | X_t=i, θ)$
///
/// $$
/// γ_i(t) = P(X_t=i|Y,θ) = \frac{α_i(t)β_i(t)}{P(Y|θ)}
/// $$
///
/// $ξ_{ij}(t)$ is the probability of being in state $i$ at time $t$ and in state $j$ at time
/// $t + 1$:
///
/// $$
/// ξ_{ij}(t) = P(X_t=i,X_{t+1}=j|Y,θ) = \frac{α_i(t) a_{ij} b_j(y_{t+1}) β_j(t+1)}{P(Y|θ)}
/// $$
#[derive(Clone, Debug)]
pub struct ForwardBackward {
    log_alpha: Array2<f64>,
    log_beta: Array2<f64>,
    gamma: Array2<f64>,
    xi: Array3<f64>,
    log_likelihood: f64,
}

impl ForwardBackward {
    /// Run the forward-backward algorithm.
    ///
    /// Fails with `InsufficientData` if there are fewer than two observations, since there are no
    /// transitions to reason about.
    pub fn new(ys: &[f64], params: &ParameterSet) -> Result<Self> {
        validate_observations(ys, 2)?;
        let t_len = ys.len();
        let n = params.n_states();

        let log_b = params.log_emissions(ys);
        let log_a = params.log_a();
        let log_alpha = forward(log_b.view(), params.log_pi().view(), log_a.view());

        let log_likelihood = log_alpha.row(t_len - 1).log_sum_exp();
        if !log_likelihood.is_finite() {
            return Err(Error::ImpossibleSequence);
        }

        let log_beta = backward(log_b.view(), log_a.view());

        let mut gamma = &log_alpha + &log_beta;
        gamma.mapv_inplace(|x| (x - log_likelihood).exp());

        let xi = Array3::from_shape_fn((t_len - 1, n, n), |(t, i, j)| {
            (log_alpha[(t, i)] + log_a[(i, j)] + log_b[(t + 1, j)] + log_beta[(t + 1, j)]
                - log_likelihood)
                .exp()
        });

        Ok(Self {
            log_alpha,
            log_beta,
            gamma,
            xi,
            log_likelihood,
        })
    }

    /// The $T × K$ matrix of $\log α_i(t)$
    pub fn log_alpha(&self) -> &Array2<f64> {
        &self.log_alpha
    }

    /// The $T × K$ matrix of $\log β_i(t)$
    pub fn log_beta(&self) -> &Array2<f64> {
        &self.log_beta
    }

    /// The $T × K$ matrix of posterior state probabilities $γ_i(t)$. Each row sums to 1.
    pub fn gamma(&self) -> &Array2<f64> {
        &self.gamma
    }

    /// The $(T - 1) × K × K$ array of pairwise transition posteriors $ξ_{ij}(t)$
    pub fn xi(&self) -> &Array3<f64> {
        &self.xi
    }

    /// $\log P(Y|θ)$
    pub fn log_likelihood(&self) -> f64 {
        self.log_likelihood
    }

    pub fn into_gamma(self) -> Array2<f64> {
        self.gamma
    }
}

/// Forwards: $\log α_k(t)$ for every time step, given the $T × K$ log emission matrix.
///
/// An empty sequence gives an empty lattice.
pub(crate) fn forward(
    log_b: ArrayView2<f64>,
    log_pi: ArrayView1<f64>,
    log_a: ArrayView2<f64>,
) -> Array2<f64> {
    let mut log_alpha = Array2::zeros(log_b.dim());
    if log_b.nrows() == 0 {
        return log_alpha;
    }

    log_alpha.row_mut(0).assign(&(&log_pi + &log_b.row(0)));
    for t in 1..log_b.nrows() {
        let (prev, mut next) = log_alpha.multi_slice_mut((s![t - 1, ..], s![t, ..]));
        Zip::indexed(&mut next).for_each(|k, alpha_tk| {
            *alpha_tk = log_b[(t, k)]
                + log_sum_exp(prev.iter().zip(log_a.column(k)).map(|(&alpha, &a)| alpha + a));
        });
    }
    log_alpha
}

/// Backwards: $\log β_k(t)$ for every time step. $β_k(T-1) = 1$.
fn backward(log_b: ArrayView2<f64>, log_a: ArrayView2<f64>) -> Array2<f64> {
    let t_len = log_b.nrows();
    let mut log_beta = Array2::zeros(log_b.dim());
    for t in (0..t_len.saturating_sub(1)).rev() {
        let (mut this, next) = log_beta.multi_slice_mut((s![t, ..], s![t + 1, ..]));
        Zip::indexed(&mut this).for_each(|k, beta_tk| {
            *beta_tk = log_sum_exp(
                log_a
                    .row(k)
                    .iter()
                    .zip(log_b.row(t + 1))
                    .zip(next.iter())
                    .map(|((&a, &b), &beta)| a + b + beta),
            );
        });
    }
    log_beta
}
