use super::{LeakyRelu, Tanh};

#[derive(Clone, Debug)]
pub enum ActFn {
    Tanh(Tanh),
    LeakyRelu(LeakyRelu),
}

impl ActFn {
    pub fn tanh() -> Self {
        Self::Tanh(Tanh)
    }

    pub fn leaky_relu(negative_slope: f32) -> Self {
        Self::LeakyRelu(LeakyRelu::new(negative_slope))
    }

    pub fn f(&self, x: f32) -> f32 {
        match self {
            Self::Tanh(a) => a.f(x),
            Self::LeakyRelu(a) => a.f(x),
        }
    }

    /// The derivative evaluated at the pre activation value `x`.
    pub fn df(&self, x: f32) -> f32 {
        match self {
            Self::Tanh(a) => a.df(x),
            Self::LeakyRelu(a) => a.df(x),
        }
    }
}
