#![cfg_attr(feature = "benchmark", feature(test))]
//! This library contains a Rust implementation of a time-invariant Hidden Markov model with
//! univariate Gaussian emissions, aimed at detecting regimes in time series such as asset returns.
//! It includes maximum likelihood estimation via the Baum-Welch expectation-maximization
//! algorithm, posterior state probabilities via the forward-backward algorithm, and hidden state
//! inference via the Viterbi algorithm. All of the recursions run in log space.
//!
//! See [`fit`](fn.fit.html) and [`decode`](fn.decode.html) for the main entry points, and
//! [`ParameterSet`](struct.ParameterSet.html) for the model itself.
//!
//! Below, a two-state model is fitted to a sequence that switches from one regime to another.
//!
//! ```
//! use gausshmm::{decode, fit};
//!
//! let ys: Vec<f64> = (0..100)
//!     .map(|t| (if t < 50 { 1.0 } else { -1.0 }) + 0.1 * ((t % 7) as f64 - 3.0))
//!     .collect();
//! let result = fit(&ys, 2, None, 1e-6, 200).unwrap();
//! assert!(result.converged());
//!
//! let path = decode(&ys, result.params()).unwrap();
//! assert_ne!(path[0], path[99]);
//! ```
//!
//! ## Logging
//!
//! Progress is reported through the `log` crate: per-iteration log likelihoods at `debug`,
//! convergence at `info`, and non-convergence or degenerate states at `warn`. Install any `log`
//! implementation to see them.
//!
//! ## Features
//!
//! `serde-1` enables serialization of parameters and fit results. There is a small amount of
//! benchmarking functionality gated by the `benchmark` feature, which requires nightly.
//!
//! ## Notes
//!
//! Sections 17.3, 17.4 and 17.5 of *Machine Learning a Probabilistic Perspective* by Kevin Murphy,
//! 2012 were invaluable as a reference, as was section 13.2 of *Pattern Recognition and Machine
//! Learning* by Christopher Bishop, 2016.
//!
//! I have attempted to make the math notation readable both as rendered HTML and from the source
//! code. The notation is strongly inspired by the Wikipedia page on the Baum-Welch algorithm.
#[cfg(all(test, feature = "benchmark"))]
extern crate test;

mod baum_welch;
mod emission;
mod error;
mod fit;
mod forward_backward;
pub mod logspace;
mod params;
mod viterbi;

pub use self::baum_welch::{BaumWelch, Diagnostic, Estimate};
pub use self::emission::{Gaussian, MIN_RESPONSIBILITY, MIN_VARIANCE};
pub use self::error::{Error, Result};
pub use self::fit::{fit, FitConfig, FitResult};
pub use self::forward_backward::ForwardBackward;
pub use self::params::{ParameterSet, TOLERANCE};
pub use self::viterbi::{decode, Viterbi};

/// A hidden state, in $[0, K)$
pub type State = usize;

/// Create a fast RNG with reproducible outputs that isn't necessarily cryptographically strong.
#[cfg(test)]
fn new_rng() -> rand::rngs::StdRng {
    use rand::SeedableRng;
    rand::rngs::StdRng::seed_from_u64(1337)
}

/// Draw `len` values from a normal distribution, then shift and scale them so that their mean and
/// (population) standard deviation are exactly `mean` and `std_dev`.
#[cfg(test)]
fn segment<R: rand::Rng>(rng: &mut R, mean: f64, std_dev: f64, len: usize) -> Vec<f64> {
    use rand_distr::{Distribution, StandardNormal};
    let mut draws = Vec::with_capacity(len);
    for _ in 0..len {
        let z: f64 = StandardNormal.sample(rng);
        draws.push(z);
    }
    let n = len as f64;
    let draws_mean = draws.iter().sum::<f64>() / n;
    let draws_std_dev = (draws.iter().map(|z| (z - draws_mean).powi(2)).sum::<f64>() / n).sqrt();
    draws
        .into_iter()
        .map(|z| mean + std_dev * (z - draws_mean) / draws_std_dev)
        .collect()
}
