#[derive(Clone, Copy, Debug, Default)]
pub struct LeakyRelu {
    negative_slope: f32,
}

impl LeakyRelu {
    pub fn new(negative_slope: f32) -> Self {
        Self { negative_slope }
    }

    pub fn f(&self, z: f32) -> f32 {
        if z > 0. { z } else { self.negative_slope * z }
    }

    pub fn df(&self, z: f32) -> f32 {
        if z > 0. { 1. } else { self.negative_slope }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slope_applies_to_negatives_only() {
        let act = LeakyRelu::new(0.2);

        assert_eq!(act.f(3.), 3.);
        assert_eq!(act.f(-5.), -1.);
        assert_eq!(act.df(1.), 1.);
        assert_eq!(act.df(-1.), 0.2);
    }
}
