use rand::Rng;
use rand_distr::{Distribution, Normal, Uniform};

use crate::Result;

/// The recommended gain for weights followed by a ReLU like nonlinearity.
pub const RELU_GAIN: f32 = std::f32::consts::SQRT_2;

/// A weight generator that follows a certain probabilistic distribution.
#[derive(Debug, Clone, Copy)]
pub struct RandWeightGen<D: Distribution<f32>> {
    distribution: D,
}

impl<D: Distribution<f32>> RandWeightGen<D> {
    /// Creates a new `RandWeightGen` weight generator.
    ///
    /// # Arguments
    /// * `distribution` - The distribution to sample the random numbers from.
    pub fn new(distribution: D) -> Self {
        Self { distribution }
    }

    /// Draws `n` weights.
    pub fn sample<R: Rng + ?Sized>(&self, rng: &mut R, n: usize) -> Vec<f32> {
        (0..n).map(|_| self.distribution.sample(rng)).collect()
    }
}

impl RandWeightGen<Uniform<f32>> {
    /// Creates a new `RandWeightGen` weight generator with a uniform distribution.
    ///
    /// # Arguments
    /// * `low` - The inclusive lower limit.
    /// * `high` - The exclusive upper limit.
    ///
    /// # Returns
    /// An error if the range is invalid (low >= high).
    pub fn uniform(low: f32, high: f32) -> Result<Self> {
        Ok(Self::new(Uniform::new(low, high)?))
    }

    /// Creates a new `RandWeightGen` weight generator drawing from `U(-1/sqrt(fan_in), 1/sqrt(fan_in))`,
    /// the usual initialization of fully connected layers.
    ///
    /// # Arguments
    /// * `fan_in` - The number of input units in the weight tensor.
    ///
    /// # Returns
    /// An error if the calculated range is invalid.
    pub fn fan_in_uniform(fan_in: usize) -> Result<Self> {
        let bound = 1. / (fan_in as f32).sqrt();
        Self::uniform(-bound, bound)
    }
}

impl RandWeightGen<Normal<f32>> {
    /// Creates a new `RandWeightGen` weight generator with a normal distribution.
    ///
    /// # Arguments
    /// * `mean` - The mean of the distribution.
    /// * `std_dev` - The standard deviation of the distribution.
    ///
    /// # Returns
    /// An error if `std_dev` is not finite (Nan or infinite).
    pub fn normal(mean: f32, std_dev: f32) -> Result<Self> {
        Ok(Self::new(Normal::new(mean, std_dev)?))
    }

    /// Creates a new `RandWeightGen` weight generator using Xavier normal initialization.
    ///
    /// # Arguments
    /// * `fan_in` - The number of input units in the weight tensor.
    /// * `fan_out` - The number of output units in the weight tensor.
    /// * `gain` - The scaling factor applied to the standard deviation.
    ///
    /// # Returns
    /// An error if the calculated standard deviation is not finite (Nan or infinite).
    pub fn xavier(fan_in: usize, fan_out: usize, gain: f32) -> Result<Self> {
        let std_dev = gain * (2. / (fan_in + fan_out) as f32).sqrt();
        Self::normal(0., std_dev)
    }
}
