use crate::emission::{Gaussian, MIN_VARIANCE};
use crate::error::{validate_observations, Error, Result};
use crate::forward_backward::forward;
use crate::logspace::*;
use crate::State;
use itertools::Itertools;
use ndarray::prelude::*;
use rand::Rng;
#[cfg(feature = "serde-1")]
use serde::{Deserialize, Serialize};

/// How far a probability distribution may be from summing to exactly 1.
pub const TOLERANCE: f64 = 1e-6;

/// The parameters of a Gaussian HMM with $K$ hidden states.
///
/// # Math
///
/// The HMM explains a sequence of real-valued observations
///
/// $$Y=(Y_0=y_0, Y_1=y_1, \ldots, Y_{T-1}=y_{T-1})$$
///
/// with latent variables for hidden state $X=(X_0, \ldots, X_{T-1})$ where each $x_t \in [0, K)$.
///
/// There are three parameters:
/// * $π$, the $K$-length initial state distribution: $π_i=P(X_0=i)$
/// * $A$, the $K × K$ state transition matrix: $a_{ij}=P(X_{t+1}=j|X_t=i)$
/// * $B$, one emission distribution per state: $P(Y_t=y|X_t=i)=N(y|μ_i,σ_i^2)$
///
/// A `ParameterSet` can only be constructed in a valid state: $π$ and every row of $A$ are
/// probability distributions and every variance is positive.
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde-1", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde-1", serde(try_from = "RawParameterSet"))]
pub struct ParameterSet {
    pi: Array1<f64>,
    a: Array2<f64>,
    emissions: Vec<Gaussian>,
}

impl ParameterSet {
    /// Create a new parameter set, e.g. to load a saved model or to supply an initial guess.
    ///
    /// Fails with `InvalidParameter` if any of:
    /// - Dimensions are inconsistent
    /// - $π$ or a row of $A$ is not a probability distribution (within `TOLERANCE`)
    pub fn new(pi: Array1<f64>, a: Array2<f64>, emissions: Vec<Gaussian>) -> Result<Self> {
        let n = emissions.len();
        if n == 0 {
            return Err(Error::InvalidParameter(
                "there must be at least one state".to_string(),
            ));
        }
        if pi.len() != n {
            return Err(Error::InvalidParameter(format!(
                "π must be of length {}, got {}",
                n,
                pi.len()
            )));
        }
        if a.dim() != (n, n) {
            return Err(Error::InvalidParameter(format!(
                "A must be {} × {}, got {:?}",
                n,
                n,
                a.dim()
            )));
        }

        check_distribution(pi.view(), "π")?;
        for row in a.rows() {
            check_distribution(row, "each row of A")?;
        }

        Ok(Self { pi, a, emissions })
    }

    /// A deterministic starting point for fitting: uniform $π$ and $A$, with the means spread
    /// evenly over the global mean ± one standard deviation and every variance set to the global
    /// variance.
    pub fn initial_guess(ys: &[f64], n_states: usize) -> Result<Self> {
        validate_observations(ys, 1)?;
        let (mean, variance) = moments(ys);
        let spread = variance.sqrt();
        let emissions = (0..n_states)
            .map(|i| {
                let offset = if n_states == 1 {
                    0.0
                } else {
                    2.0 * i as f64 / (n_states - 1) as f64 - 1.0
                };
                Gaussian::new(mean + offset * spread, variance)
            })
            .collect::<Result<Vec<_>>>()?;
        Self::new(
            uniform(n_states),
            Array2::from_elem((n_states, n_states), 1.0 / n_states as f64),
            emissions,
        )
    }

    /// A random starting point for fitting. The means are observations picked at random and every
    /// variance is the global variance.
    pub fn random<R: Rng + ?Sized>(ys: &[f64], n_states: usize, rng: &mut R) -> Result<Self> {
        validate_observations(ys, 1)?;
        let (_mean, variance) = moments(ys);
        let a = Array2::from_shape_fn((n_states, n_states), |_| rng.gen::<f64>())
            .normalize_rows("A")?;
        let pi = Array1::from_shape_fn(n_states, |_| rng.gen::<f64>()).normalize("π")?;
        let emissions = (0..n_states)
            .map(|_| Gaussian::new(ys[rng.gen_range(0..ys.len())], variance))
            .collect::<Result<Vec<_>>>()?;
        Self::new(pi, a, emissions)
    }

    /// $K$, the number of hidden states
    pub fn n_states(&self) -> usize {
        self.emissions.len()
    }

    pub fn pi(&self) -> &Array1<f64> {
        &self.pi
    }

    pub fn a(&self) -> &Array2<f64> {
        &self.a
    }

    pub fn emissions(&self) -> &[Gaussian] {
        &self.emissions
    }

    pub fn means(&self) -> Array1<f64> {
        self.emissions.iter().map(Gaussian::mean).collect()
    }

    pub fn variances(&self) -> Array1<f64> {
        self.emissions.iter().map(Gaussian::variance).collect()
    }

    /// Raise every emission variance to at least `variance_floor`.
    pub(crate) fn with_variance_floor(mut self, variance_floor: f64) -> Self {
        for g in self.emissions.iter_mut() {
            *g = g.floored(variance_floor);
        }
        self
    }

    pub(crate) fn log_pi(&self) -> Array1<f64> {
        self.pi.mapv(f64::ln)
    }

    pub(crate) fn log_a(&self) -> Array2<f64> {
        self.a.mapv(f64::ln)
    }

    /// The $T × K$ matrix of $\log N(y_t | μ_k, σ_k^2)$
    pub(crate) fn log_emissions(&self, ys: &[f64]) -> Array2<f64> {
        Array2::from_shape_fn((ys.len(), self.n_states()), |(t, k)| {
            self.emissions[k].log_pdf(ys[t])
        })
    }

    /// $\log P(Y|θ)$, the log likelihood of a sequence of observations.
    pub fn log_likelihood(&self, ys: &[f64]) -> Result<f64> {
        validate_observations(ys, 1)?;
        let log_alpha = forward(
            self.log_emissions(ys).view(),
            self.log_pi().view(),
            self.log_a().view(),
        );
        let ll = log_alpha.row(ys.len() - 1).log_sum_exp();
        if ll.is_finite() {
            Ok(ll)
        } else {
            Err(Error::ImpossibleSequence)
        }
    }

    /// Given a sequence of observations, return the probability of being in each hidden state at
    /// each time step, using only the observations up to and including that time step.
    ///
    /// Return a $T × K$ matrix where element (t, k) is $P(X_t=k|y_0, \ldots, y_t)$. If you can wait
    /// for the whole sequence, the posteriors from
    /// [`ForwardBackward`](crate::ForwardBackward) are more accurate.
    pub fn filter(&self, ys: &[f64]) -> Result<Array2<f64>> {
        validate_observations(ys, 0)?;
        let mut log_alpha = forward(
            self.log_emissions(ys).view(),
            self.log_pi().view(),
            self.log_a().view(),
        );
        for mut row in log_alpha.rows_mut() {
            let norm = row.log_sum_exp();
            if !norm.is_finite() {
                return Err(Error::ImpossibleSequence);
            }
            row.mapv_inplace(|x| (x - norm).exp());
        }
        Ok(log_alpha)
    }

    /// Given a distribution over states, calculate the distribution of states `n_time_steps` in
    /// the future.
    ///
    /// This is only efficient for small values of `n_time_steps`.
    pub fn predict(&self, mut p_states: Array1<f64>, n_time_steps: usize) -> Result<Array1<f64>> {
        if p_states.len() != self.n_states() {
            return Err(Error::InvalidParameter(format!(
                "p_states must be of length {}, got {}",
                self.n_states(),
                p_states.len()
            )));
        }
        check_distribution(p_states.view(), "p_states")?;
        for _ in 0..n_time_steps {
            p_states = p_states.dot(&self.a)
        }
        Ok(p_states)
    }

    /// Return the log likelihood of a sequence of states and observations,
    /// $\log P(X=x, Y=y|θ)$. This is not a typical use case, because often the hidden states are not
    /// available, but it can score a path from [`decode`](crate::decode).
    ///
    /// The result is $-∞$ if the path is impossible.
    pub fn path_log_likelihood(&self, xs: &[State], ys: &[f64]) -> Result<f64> {
        if xs.len() != ys.len() {
            return Err(Error::InvalidParameter(format!(
                "got {} states but {} observations",
                xs.len(),
                ys.len()
            )));
        }
        if let Some(&x) = xs.iter().find(|&&x| x >= self.n_states()) {
            return Err(Error::InvalidParameter(format!(
                "state {} is out of bounds for {} states",
                x,
                self.n_states()
            )));
        }
        validate_observations(ys, 0)?;

        // This special case is required b/c we treat the first time step specially
        if xs.is_empty() {
            return Ok(0.0);
        }

        let initial = self.pi[xs[0]].ln() + self.emissions[xs[0]].log_pdf(ys[0]);
        let the_rest: f64 = xs
            .iter()
            .zip(ys)
            .tuple_windows()
            .map(|((&x0, _y0), (&x1, &y1))| self.a[(x0, x1)].ln() + self.emissions[x1].log_pdf(y1))
            .sum();

        Ok(initial + the_rest)
    }
}

fn check_distribution(p: ArrayView1<f64>, label: &str) -> Result<()> {
    if let Some(p_i) = p.iter().find(|p_i| !(p_i.is_finite() && **p_i >= 0.0)) {
        return Err(Error::InvalidParameter(format!(
            "{} must only contain finite, non-negative probabilities, got {}",
            label, p_i
        )));
    }
    let sum = p.sum();
    if (sum - 1.0).abs() > TOLERANCE {
        return Err(Error::InvalidParameter(format!(
            "{} must sum to 1, got {}",
            label, sum
        )));
    }
    Ok(())
}

/// The mean and (population) variance, with the variance floored at `MIN_VARIANCE`.
fn moments(ys: &[f64]) -> (f64, f64) {
    let n = ys.len() as f64;
    let mean = ys.iter().sum::<f64>() / n;
    let variance = ys.iter().map(|y| (y - mean).powi(2)).sum::<f64>() / n;
    (mean, variance.max(MIN_VARIANCE))
}

pub(crate) fn uniform(n: usize) -> Array1<f64> {
    Array1::from_elem(n, 1.0 / (n as f64))
}

#[cfg(feature = "serde-1")]
#[derive(Deserialize)]
struct RawParameterSet {
    pi: Array1<f64>,
    a: Array2<f64>,
    emissions: Vec<Gaussian>,
}

#[cfg(feature = "serde-1")]
impl std::convert::TryFrom<RawParameterSet> for ParameterSet {
    type Error = Error;

    fn try_from(raw: RawParameterSet) -> Result<Self> {
        ParameterSet::new(raw.pi, raw.a, raw.emissions)
    }
}
