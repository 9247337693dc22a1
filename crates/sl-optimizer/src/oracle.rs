//! Ask/tell oracles proposing candidate points.

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use sl_types::{validation_error, SlResult};

use crate::config::{AcquisitionStrategy, SearchConfig};
use crate::search::{Point, SearchSpace};

/// Black-box optimizer driven by the sweep loop.
pub trait AskTellOracle: Send {
    /// Create an oracle with an empty history.
    fn from_config(config: &SearchConfig) -> SlResult<Self>
    where
        Self: Sized;

    /// Rebuild an oracle from a [`AskTellOracle::snapshot`].
    fn restore(snapshot: serde_json::Value) -> SlResult<Self>
    where
        Self: Sized;

    /// Propose `n` points.
    fn ask(&mut self, n: usize) -> SlResult<Vec<Point>>;

    /// Record losses for previously asked points, in ask order.
    fn tell(&mut self, points: &[Point], losses: &[f64]) -> SlResult<()>;

    fn dimensions(&self) -> usize;

    /// Number of (point, loss) pairs told so far.
    fn history_len(&self) -> usize;

    fn snapshot(&self) -> SlResult<serde_json::Value>;
}

/// Probability of a random draw once the initial design is exhausted.
const EXPLORATION_RATE: f64 = 0.2;

/// Fraction of each dimension's range used when perturbing the incumbent.
const PERTURBATION_SCALE: f64 = 0.1;

/// Surrogate-guided search: a random initial design, then perturbation
/// around the best observed point mixed with random exploration.
///
/// All randomness comes from a ChaCha stream selected by the number of
/// points asked so far, so the oracle is a pure function of its snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SurrogateOracle {
    space: SearchSpace,
    strategy: AcquisitionStrategy,
    n_initial_points: usize,
    seed: u64,
    asked: u64,
    points: Vec<Point>,
    losses: Vec<f64>,
}

impl SurrogateOracle {
    pub fn new(space: SearchSpace, strategy: AcquisitionStrategy, seed: u64) -> Self {
        Self {
            space,
            strategy,
            n_initial_points: 5,
            seed,
            asked: 0,
            points: Vec::new(),
            losses: Vec::new(),
        }
    }

    pub fn with_initial_points(mut self, n: usize) -> Self {
        self.n_initial_points = n;
        self
    }

    pub fn space(&self) -> &SearchSpace {
        &self.space
    }

    pub fn asked(&self) -> u64 {
        self.asked
    }

    /// Best told point and its loss.
    pub fn best(&self) -> Option<(&Point, f64)> {
        best_index(&self.losses).map(|i| (&self.points[i], self.losses[i]))
    }

    fn lie(&self, losses: &[f64]) -> f64 {
        match self.strategy {
            AcquisitionStrategy::ClMin => losses.iter().copied().fold(f64::INFINITY, f64::min),
            AcquisitionStrategy::ClMax => losses.iter().copied().fold(f64::NEG_INFINITY, f64::max),
            AcquisitionStrategy::ClMean => losses.iter().sum::<f64>() / losses.len() as f64,
        }
    }
}

/// Index of the lowest loss; ties go to the latest entry.
fn best_index(losses: &[f64]) -> Option<usize> {
    losses
        .iter()
        .enumerate()
        .filter(|(_, loss)| !loss.is_nan())
        .fold(None, |best: Option<(usize, f64)>, (i, &loss)| match best {
            Some((_, b)) if b < loss => best,
            _ => Some((i, loss)),
        })
        .map(|(i, _)| i)
}

impl AskTellOracle for SurrogateOracle {
    fn from_config(config: &SearchConfig) -> SlResult<Self> {
        config.space.validate()?;
        Ok(Self::new(config.space.clone(), config.strategy, config.seed)
            .with_initial_points(config.n_initial_points))
    }

    fn restore(snapshot: serde_json::Value) -> SlResult<Self> {
        let oracle: Self = serde_json::from_value(snapshot)?;
        if oracle.points.len() != oracle.losses.len() {
            return Err(validation_error!(
                "oracle snapshot has {} points but {} losses",
                oracle.points.len(),
                oracle.losses.len()
            ));
        }
        Ok(oracle)
    }

    fn ask(&mut self, n: usize) -> SlResult<Vec<Point>> {
        let mut rng = ChaCha8Rng::seed_from_u64(self.seed);
        rng.set_stream(self.asked);

        // Points proposed earlier in this batch are treated as observed at
        // the lie value, steering later proposals.
        let mut points = self.points.clone();
        let mut losses = self.losses.clone();
        let mut batch = Vec::with_capacity(n);

        for i in 0..n {
            let initial = (self.asked as usize + i) < self.n_initial_points;
            let point = match best_index(&losses) {
                Some(best) if !initial && rng.gen::<f64>() >= EXPLORATION_RATE => {
                    self.space.perturb(&points[best], PERTURBATION_SCALE, &mut rng)
                }
                _ => self.space.sample(&mut rng),
            };
            if !self.losses.is_empty() {
                let lie = self.lie(&self.losses);
                points.push(point.clone());
                losses.push(lie);
            }
            batch.push(point);
        }

        self.asked += n as u64;
        Ok(batch)
    }

    fn tell(&mut self, points: &[Point], losses: &[f64]) -> SlResult<()> {
        if points.len() != losses.len() {
            return Err(validation_error!(
                "told {} points with {} losses",
                points.len(),
                losses.len()
            ));
        }
        if let Some(point) = points.iter().find(|p| p.len() != self.dimensions()) {
            return Err(validation_error!(
                "point has {} values, the space has {} dimensions",
                point.len(),
                self.dimensions()
            ));
        }
        self.points.extend_from_slice(points);
        self.losses.extend_from_slice(losses);
        Ok(())
    }

    fn dimensions(&self) -> usize {
        self.space.dimensions()
    }

    fn history_len(&self) -> usize {
        self.losses.len()
    }

    fn snapshot(&self) -> SlResult<serde_json::Value> {
        Ok(serde_json::to_value(self)?)
    }
}
