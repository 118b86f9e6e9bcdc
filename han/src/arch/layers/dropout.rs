use ndarray::Array2;
use rand::Rng;

use crate::arch::Mode;

/// Draws an inverted dropout mask: every entry is either 0 or `1 / (1 - p)`.
///
/// # Returns
/// `None` when dropout is a no-op, that is outside of training or with `p == 0`.
pub(crate) fn dropout_mask<R: Rng + ?Sized>(
    shape: (usize, usize),
    p: f32,
    mode: Mode,
    rng: &mut R,
) -> Option<Array2<f32>> {
    if mode == Mode::Eval || p <= 0. {
        return None;
    }

    let scale = 1. / (1. - p);
    let mask = Array2::from_shape_simple_fn(shape, || {
        if rng.random::<f32>() < p { 0. } else { scale }
    });

    Some(mask)
}
