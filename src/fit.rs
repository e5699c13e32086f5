use crate::baum_welch::{BaumWelch, Diagnostic};
use crate::emission::MIN_VARIANCE;
use crate::error::{validate_observations, Error, Result};
use crate::logspace::*;
use crate::params::ParameterSet;
use crate::viterbi::decode;
use crate::State;
use log::{trace, warn};
use ndarray::prelude::*;
use rand::Rng;
#[cfg(feature = "serde-1")]
use serde::{Deserialize, Serialize};

/// Settings for fitting a Gaussian HMM.
///
/// The number of states, the tolerance and the iteration cap have no defaults: good values depend
/// on the data, so they must be chosen by the caller.
#[derive(Clone, Copy, Debug, PartialEq)]
#[cfg_attr(feature = "serde-1", derive(Serialize, Deserialize))]
pub struct FitConfig {
    /// $K$, the number of hidden states. Must be at least 2.
    pub num_states: usize,
    /// EM stops once an iteration improves the log likelihood by less than this
    pub tolerance: f64,
    /// EM stops after this many iterations even if it hasn't converged
    pub max_iterations: usize,
    /// The smallest variance re-estimation may produce
    pub variance_floor: f64,
    /// Whether to run the Viterbi algorithm on the fitted parameters
    pub decode: bool,
}

impl FitConfig {
    pub fn new(num_states: usize, tolerance: f64, max_iterations: usize) -> Self {
        Self {
            num_states,
            tolerance,
            max_iterations,
            variance_floor: MIN_VARIANCE,
            decode: true,
        }
    }

    /// Re-estimated variances never go below `variance_floor`, and a smaller variance in the
    /// initial guess is raised to it. The floor must be small relative to the variance of the
    /// data, or every state collapses onto it and the regimes can't be told apart.
    pub fn with_variance_floor(mut self, variance_floor: f64) -> Self {
        self.variance_floor = variance_floor;
        self
    }

    pub fn with_decode(mut self, decode: bool) -> Self {
        self.decode = decode;
        self
    }

    /// Check the settings and build the estimator they describe.
    pub fn validate(&self) -> Result<BaumWelch> {
        if self.num_states < 2 {
            return Err(Error::InvalidParameter(format!(
                "num_states must be at least 2, got {}",
                self.num_states
            )));
        }
        BaumWelch::new(self.tolerance, self.max_iterations)?.with_variance_floor(self.variance_floor)
    }

    /// Fit a model with Baum-Welch, starting from `initial_guess` if there is one and from
    /// [`ParameterSet::initial_guess`] otherwise.
    ///
    /// The settings and the observations are checked before any computation starts.
    pub fn fit(&self, ys: &[f64], initial_guess: Option<ParameterSet>) -> Result<FitResult> {
        let estimator = self.validate()?;
        validate_observations(ys, 2)?;
        if ys.len() < self.num_states {
            return Err(Error::InsufficientData(format!(
                "can't estimate {} states from {} observations",
                self.num_states,
                ys.len()
            )));
        }

        let initial = match initial_guess {
            Some(params) if params.n_states() != self.num_states => {
                return Err(Error::InvalidParameter(format!(
                    "initial guess has {} states, expected {}",
                    params.n_states(),
                    self.num_states
                )))
            }
            Some(params) => params,
            None => ParameterSet::initial_guess(ys, self.num_states)?,
        };

        let estimate = estimator.run(ys, initial)?;
        let path = if self.decode {
            Some(decode(ys, &estimate.params)?)
        } else {
            None
        };

        Ok(FitResult {
            params: estimate.params,
            posteriors: estimate.posterior.into_gamma(),
            log_likelihoods: estimate.log_likelihoods,
            converged: estimate.converged,
            iterations: estimate.iterations,
            diagnostics: estimate.diagnostics,
            path,
        })
    }

    /// EM only finds a local optimum, so fit from the default initial guess and from `restarts`
    /// random initial guesses, then keep the fit with the highest log likelihood.
    pub fn fit_restarts<R: Rng + ?Sized>(
        &self,
        ys: &[f64],
        restarts: usize,
        rng: &mut R,
    ) -> Result<FitResult> {
        let guesses = (0..restarts).map(|_| ParameterSet::random(ys, self.num_states, &mut *rng));
        self.fit_best(ys, guesses)
    }

    /// Fit from the default initial guess and then from each of `guesses`, keeping the fit with
    /// the highest log likelihood. A guess that fails is logged and skipped.
    fn fit_best<I>(&self, ys: &[f64], guesses: I) -> Result<FitResult>
    where
        I: IntoIterator<Item = Result<ParameterSet>>,
    {
        let mut best = self.fit(ys, None)?;
        trace!("default initial guess: log likelihood {}", best.log_likelihood());
        for (restart, guess) in guesses.into_iter().enumerate() {
            let result = match guess.and_then(|guess| self.fit(ys, Some(guess))) {
                Ok(result) => result,
                Err(e) => {
                    warn!("restart {} failed: {}", restart, e);
                    continue;
                }
            };
            trace!(
                "restart {}: log likelihood {}",
                restart,
                result.log_likelihood()
            );
            if result.log_likelihood() > best.log_likelihood() {
                best = result;
            }
        }
        Ok(best)
    }
}

/// Fit a Gaussian HMM with `num_states` states to a sequence of observations.
///
/// This is shorthand for [`FitConfig::fit`] with the default variance floor and Viterbi decoding
/// enabled.
pub fn fit(
    ys: &[f64],
    num_states: usize,
    initial_guess: Option<ParameterSet>,
    tolerance: f64,
    max_iterations: usize,
) -> Result<FitResult> {
    FitConfig::new(num_states, tolerance, max_iterations).fit(ys, initial_guess)
}

/// A fitted model: the final parameters, the posterior probability of each state at each time
/// step, and diagnostics about how the fit went.
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde-1", derive(Serialize, Deserialize))]
pub struct FitResult {
    params: ParameterSet,
    posteriors: Array2<f64>,
    log_likelihoods: Vec<f64>,
    converged: bool,
    iterations: usize,
    diagnostics: Vec<Diagnostic>,
    path: Option<Array1<State>>,
}

impl FitResult {
    pub fn params(&self) -> &ParameterSet {
        &self.params
    }

    /// The $T × K$ matrix of $P(X_t=k|Y,θ)$ at the fitted parameters. Each row sums to 1.
    pub fn posteriors(&self) -> &Array2<f64> {
        &self.posteriors
    }

    /// The log likelihood of the initial guess and of the parameters after each iteration
    pub fn log_likelihoods(&self) -> &[f64] {
        &self.log_likelihoods
    }

    /// The log likelihood of the fitted parameters
    pub fn log_likelihood(&self) -> f64 {
        self.log_likelihoods
            .last()
            .copied()
            .unwrap_or(f64::NEG_INFINITY)
    }

    pub fn converged(&self) -> bool {
        self.converged
    }

    pub fn iterations(&self) -> usize {
        self.iterations
    }

    pub fn diagnostics(&self) -> &[Diagnostic] {
        &self.diagnostics
    }

    /// The Viterbi path, if decoding was enabled
    pub fn path(&self) -> Option<&Array1<State>> {
        self.path.as_ref()
    }

    /// The most likely state at each time step on its own. Ties go to the lowest state.
    pub fn most_likely_states(&self) -> Array1<State> {
        self.posteriors
            .rows()
            .into_iter()
            .map(|row| row.maxf().map_or(0, |(k, _p)| k))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params::tests::gaussians;
    use crate::{new_rng, segment};
    use counter::Counter;
    use itertools::Itertools;
    use lazy_static::lazy_static;
    use spectral::prelude::*;

    lazy_static! {
        /// 200 draws from N(0.1, 0.1²) followed by 200 draws from N(-0.05, 0.2²)
        static ref BULL_THEN_BEAR: Vec<f64> = {
            let mut rng = new_rng();
            let mut ys = segment(&mut rng, 0.1, 0.1, 200);
            ys.extend(segment(&mut rng, -0.05, 0.2, 200));
            ys
        };
    }

    fn index_of_max(xs: &Array1<f64>) -> usize {
        xs.maxf().unwrap().0
    }

    #[test]
    fn recovers_two_regimes() {
        let ys = &*BULL_THEN_BEAR;
        let result = fit(ys, 2, None, 1e-6, 500).unwrap();
        assert!(result.converged());

        let means = result.params().means();
        let bull = index_of_max(&means);
        let bear = 1 - bull;
        assert_that(&means[bull]).is_close_to(0.1, 0.03);
        assert_that(&means[bear]).is_close_to(-0.05, 0.03);

        // Skip the time steps close to the regime change
        let interior = (20..180).chain(220..380);
        let mut correct = 0;
        let mut total = 0;
        for t in interior {
            let expected = if t < 200 { bull } else { bear };
            if result.posteriors()[(t, expected)] > 0.5 {
                correct += 1;
            }
            total += 1;
        }
        assert_that(&(correct as f64 / total as f64)).is_greater_than_or_equal_to(0.9);
    }

    #[test]
    fn posterior_rows_are_distributions() {
        let result = fit(&BULL_THEN_BEAR, 3, None, 1e-6, 200).unwrap();
        assert_eq!(result.posteriors().dim(), (400, 3));
        for row in result.posteriors().rows() {
            assert_that(&row.sum()).is_close_to(1.0, 1e-6);
        }
        assert_that(&result.params().pi().sum()).is_close_to(1.0, 1e-6);
        for row in result.params().a().rows() {
            assert_that(&row.sum()).is_close_to(1.0, 1e-6);
        }
    }

    #[test]
    fn log_likelihoods_never_decrease() {
        let result = fit(&BULL_THEN_BEAR, 2, None, 1e-8, 500).unwrap();
        for (before, after) in result.log_likelihoods().iter().tuple_windows() {
            assert!(after - before > -1e-8, "{} -> {}", before, after);
        }
        assert_eq!(result.log_likelihoods().len(), result.iterations() + 1);
    }

    #[test]
    fn viterbi_path_agrees_with_posteriors() {
        let result = fit(&BULL_THEN_BEAR, 2, None, 1e-6, 500).unwrap();
        let path = result.path().unwrap();
        assert_eq!(path.len(), 400);
        let counts = path.iter().collect::<Counter<_>>();
        assert_eq!(counts.len(), 2);
        for (state, count) in counts.most_common() {
            assert_that(&count).is_greater_than(150);
            assert!(*state < 2);
        }
        let agreement = path
            .iter()
            .zip(result.most_likely_states().iter())
            .filter(|(a, b)| a == b)
            .count();
        assert_that(&agreement).is_greater_than(360);
    }

    #[test]
    fn decode_disabled() {
        let result = FitConfig::new(2, 1e-6, 100)
            .with_decode(false)
            .fit(&BULL_THEN_BEAR, None)
            .unwrap();
        assert_eq!(result.path(), None);
    }

    #[test]
    fn single_observation() {
        assert!(matches!(
            fit(&[0.1], 2, None, 1e-6, 100),
            Err(Error::InsufficientData(_))
        ));
    }

    #[test]
    fn fewer_observations_than_states() {
        assert!(matches!(
            fit(&[0.1, 0.2], 3, None, 1e-6, 100),
            Err(Error::InsufficientData(_))
        ));
    }

    #[test]
    fn zero_states() {
        assert!(matches!(
            fit(&BULL_THEN_BEAR, 0, None, 1e-6, 100),
            Err(Error::InvalidParameter(_))
        ));
    }

    #[test]
    fn one_state() {
        assert!(matches!(
            fit(&BULL_THEN_BEAR, 1, None, 1e-6, 100),
            Err(Error::InvalidParameter(_))
        ));
    }

    #[test]
    fn invalid_settings_are_reported_before_data_problems() {
        assert!(matches!(
            fit(&[f64::NAN], 2, None, -1.0, 100),
            Err(Error::InvalidParameter(_))
        ));
        assert!(matches!(
            FitConfig::new(2, 1e-6, 100)
                .with_variance_floor(-1.0)
                .fit(&BULL_THEN_BEAR, None),
            Err(Error::InvalidParameter(_))
        ));
    }

    #[test]
    fn nan_observation() {
        assert!(matches!(
            fit(&[0.1, f64::NAN, 0.3], 2, None, 1e-6, 100),
            Err(Error::InvalidObservation { t: 1, .. })
        ));
    }

    #[test]
    fn initial_guess_with_wrong_state_count() {
        let guess = ParameterSet::initial_guess(&BULL_THEN_BEAR, 3).unwrap();
        assert!(matches!(
            fit(&BULL_THEN_BEAR, 2, Some(guess), 1e-6, 100),
            Err(Error::InvalidParameter(_))
        ));
    }

    #[test]
    fn initial_guess_below_the_variance_floor() {
        let ys = (0..100)
            .map(|t| 0.3 * ((t % 7) as f64 - 3.0) / 3.0)
            .collect_vec();
        let guess = ParameterSet::new(
            array![1.0, 0.0],
            array![[0.5, 0.5], [0.5, 0.5]],
            gaussians(&[(0.0, 1.0), (1e6, 1e-12)]),
        )
        .unwrap();
        let config = FitConfig::new(2, 1e-6, 100);
        let result = config.fit(&ys, Some(guess)).unwrap();
        assert!(result
            .diagnostics()
            .contains(&Diagnostic::DegenerateState {
                state: 1,
                iteration: 1
            }));
        for g in result.params().emissions() {
            assert!(g.variance() >= config.variance_floor, "{:?}", g);
        }
    }

    #[test]
    fn small_scale_data_needs_a_smaller_floor() {
        let ys = BULL_THEN_BEAR.iter().map(|y| y * 0.01).collect_vec();
        let result = FitConfig::new(2, 1e-6, 500)
            .with_variance_floor(1e-10)
            .fit(&ys, None)
            .unwrap();
        let means = result.params().means();
        let bull = index_of_max(&means);
        assert_that(&means[bull]).is_close_to(0.001, 0.0003);
        assert_that(&means[1 - bull]).is_close_to(-0.0005, 0.0003);
        for g in result.params().emissions() {
            assert!(g.variance() > 1e-7);
        }
    }

    #[test]
    fn explicit_initial_guess() {
        let guess = ParameterSet::new(
            array![0.5, 0.5],
            array![[0.95, 0.05], [0.05, 0.95]],
            gaussians(&[(0.2, 0.01), (-0.2, 0.04)]),
        )
        .unwrap();
        let result = fit(&BULL_THEN_BEAR, 2, Some(guess), 1e-6, 500).unwrap();
        let means = result.params().means();
        assert_that(&means[0]).is_close_to(0.1, 0.03);
        assert_that(&means[1]).is_close_to(-0.05, 0.03);
    }

    #[test]
    fn non_convergence_still_returns_parameters() {
        let result = fit(&BULL_THEN_BEAR, 2, None, 0.0, 3).unwrap();
        assert!(!result.converged());
        assert_eq!(result.iterations(), 3);
        assert!(result
            .diagnostics()
            .iter()
            .any(|d| matches!(d, Diagnostic::NonConvergence { iterations: 3, .. })));
        assert!(result.path().is_some());
        assert_eq!(result.posteriors().nrows(), 400);
    }

    #[test]
    fn restarts_never_do_worse_than_the_default_guess() {
        let config = FitConfig::new(2, 1e-6, 200);
        let default = config.fit(&BULL_THEN_BEAR, None).unwrap();
        let best = config
            .fit_restarts(&BULL_THEN_BEAR, 4, &mut new_rng())
            .unwrap();
        assert!(best.log_likelihood() >= default.log_likelihood());
    }

    #[test]
    fn failed_restart_keeps_the_best_fit() {
        let config = FitConfig::new(2, 1e-6, 200);
        let default = config.fit(&BULL_THEN_BEAR, None).unwrap();
        let guesses = vec![
            Ok(ParameterSet::initial_guess(&BULL_THEN_BEAR, 3).unwrap()),
            Err(Error::InvalidParameter("bad guess".to_string())),
            ParameterSet::random(&BULL_THEN_BEAR, 2, &mut new_rng()),
        ];
        let best = config.fit_best(&BULL_THEN_BEAR, guesses).unwrap();
        assert!(best.log_likelihood() >= default.log_likelihood());
    }

    #[test]
    fn independent_fits_run_in_parallel() {
        let ys: &[f64] = &BULL_THEN_BEAR;
        let (two, three) = std::thread::scope(|scope| {
            let two = scope.spawn(|| fit(ys, 2, None, 1e-6, 200));
            let three = scope.spawn(|| fit(ys, 3, None, 1e-6, 200));
            (two.join().unwrap(), three.join().unwrap())
        });
        assert_eq!(two.unwrap(), fit(ys, 2, None, 1e-6, 200).unwrap());
        assert_eq!(three.unwrap().params().n_states(), 3);
    }

    #[test]
    fn most_likely_states_ties() {
        let result = FitResult {
            params: ParameterSet::initial_guess(&[0.0, 1.0], 2).unwrap(),
            posteriors: array![[0.5, 0.5], [0.2, 0.8]],
            log_likelihoods: vec![-1.0],
            converged: true,
            iterations: 0,
            diagnostics: vec![],
            path: None,
        };
        assert_eq!(result.most_likely_states(), array![0, 1]);
        assert_eq!(result.log_likelihood(), -1.0);
    }

    #[cfg(feature = "serde-1")]
    #[test]
    fn serde_keeps_the_fitted_model() {
        let result = fit(&BULL_THEN_BEAR, 2, None, 1e-6, 100).unwrap();
        let json = serde_json::to_string(&result).unwrap();
        let loaded: FitResult = serde_json::from_str(&json).unwrap();
        assert_eq!(loaded.params().n_states(), 2);
        let means_distance = loaded
            .params()
            .means()
            .l2_distance(&result.params().means())
            .unwrap();
        assert_that(&means_distance).is_less_than(1e-12);
        let a_distance = loaded.params().a().l2_distance(result.params().a()).unwrap();
        assert_that(&a_distance).is_less_than(1e-12);
        assert_eq!(loaded.path(), result.path());
    }

    #[cfg(feature = "serde-1")]
    #[test]
    fn serde_rejects_invalid_parameters() {
        let json = r#"{
            "pi": {"v": 1, "dim": [2], "data": [0.5, 0.6]},
            "a": {"v": 1, "dim": [2, 2], "data": [0.5, 0.5, 0.5, 0.5]},
            "emissions": [{"mean": 0.0, "variance": 1.0}, {"mean": 1.0, "variance": 1.0}]
        }"#;
        assert!(serde_json::from_str::<ParameterSet>(json).is_err());
        let json = r#"{"mean": 0.0, "variance": -1.0}"#;
        assert!(serde_json::from_str::<crate::Gaussian>(json).is_err());
    }
}
