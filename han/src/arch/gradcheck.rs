#![cfg(test)]

const EPS: f32 = 5e-3;
const TOL: f32 = 1e-2;

/// Checks an analytic gradient against central finite differences of `f` around `at`.
pub(crate) fn assert_grad_close<F>(at: &[f32], analytic: &[f32], f: F)
where
    F: Fn(&[f32]) -> f32,
{
    assert_eq!(at.len(), analytic.len(), "gradient length");

    let mut shifted = at.to_vec();
    for i in 0..at.len() {
        shifted[i] = at[i] + EPS;
        let plus = f(&shifted);
        shifted[i] = at[i] - EPS;
        let minus = f(&shifted);
        shifted[i] = at[i];

        let numeric = (plus - minus) / (2. * EPS);
        let err = (numeric - analytic[i]).abs();

        assert!(
            err <= TOL * analytic[i].abs().max(1.),
            "gradient mismatch at {i}: analytic {} numeric {numeric}",
            analytic[i]
        );
    }
}
