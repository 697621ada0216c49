//! Optimizer(s)

use std::collections::HashMap;

use crate::{graph::DataId, tensor::Tensor};

/// Common interface for optimizers
/// Analogous to the torch.optim.Optimizer interface
/// <https://pytorch.org/docs/stable/optim.html#base-class>
pub trait Optim {
    /// Updates one parameter in place from its accumulated gradient.
    /// Any per-parameter state is keyed by `param`.
    fn step(&mut self, param: DataId, value: &mut Tensor, grad: &Tensor, learning_rate: f32);
    /// Forgets all per-parameter state
    fn reset(&mut self);
}

/// Which optimizer a [`Net`](crate::net::Net) builds, with its hyperparameters
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum OptimizerConfig {
    Adam { beta1: f32, beta2: f32, epsilon: f32 },
    Sgd { momentum: f32 },
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        OptimizerConfig::Adam {
            beta1: 0.9,
            beta2: 0.999,
            epsilon: 1e-8,
        }
    }
}

impl OptimizerConfig {
    pub fn build(&self) -> Box<dyn Optim> {
        match *self {
            OptimizerConfig::Adam {
                beta1,
                beta2,
                epsilon,
            } => Box::new(Adam::new(beta1, beta2, epsilon)),
            OptimizerConfig::Sgd { momentum } => Box::new(SGD::new(momentum)),
        }
    }
}

/// SGD with momentum
pub struct SGD {
    momentum: f32,
    // velocity per parameter
    velocity: HashMap<DataId, Vec<f32>>,
}

impl SGD {
    pub fn new(momentum: f32) -> Self {
        Self {
            momentum,
            velocity: HashMap::new(),
        }
    }

    #[cfg(test)]
    fn velocity(&self, param: DataId) -> Option<&[f32]> {
        self.velocity.get(&param).map(Vec::as_slice)
    }
}

impl Optim for SGD {
    fn step(&mut self, param: DataId, value: &mut Tensor, grad: &Tensor, learning_rate: f32) {
        let velocity = self
            .velocity
            .entry(param)
            .or_insert_with(|| vec![0.0; value.len()]);
        for ((p, g), v) in value
            .data_mut()
            .iter_mut()
            .zip(grad.data())
            .zip(velocity.iter_mut())
        {
            *v = self.momentum * *v - learning_rate * g;
            *p += *v;
        }
    }

    fn reset(&mut self) {
        self.velocity.clear();
    }
}

#[derive(Debug)]
struct Moments {
    m: Vec<f32>,
    v: Vec<f32>,
    t: i32,
}

/// Adam: per-parameter first and second moment estimates with bias correction
/// <https://arxiv.org/abs/1412.6980>
pub struct Adam {
    beta1: f32,
    beta2: f32,
    epsilon: f32,
    state: HashMap<DataId, Moments>,
}

impl Default for Adam {
    fn default() -> Self {
        Self::new(0.9, 0.999, 1e-8)
    }
}

impl Adam {
    pub fn new(beta1: f32, beta2: f32, epsilon: f32) -> Self {
        Self {
            beta1,
            beta2,
            epsilon,
            state: HashMap::new(),
        }
    }

    /// Number of steps taken for a parameter
    pub fn steps(&self, param: DataId) -> i32 {
        self.state.get(&param).map_or(0, |s| s.t)
    }
}

impl Optim for Adam {
    fn step(&mut self, param: DataId, value: &mut Tensor, grad: &Tensor, learning_rate: f32) {
        let state = self.state.entry(param).or_insert_with(|| Moments {
            m: vec![0.0; value.len()],
            v: vec![0.0; value.len()],
            t: 0,
        });
        state.t += 1;
        let bias1 = 1.0 - self.beta1.powi(state.t);
        let bias2 = 1.0 - self.beta2.powi(state.t);
        for (((p, &g), m), v) in value
            .data_mut()
            .iter_mut()
            .zip(grad.data())
            .zip(state.m.iter_mut())
            .zip(state.v.iter_mut())
        {
            *m = self.beta1 * *m + (1.0 - self.beta1) * g;
            *v = self.beta2 * *v + (1.0 - self.beta2) * g * g;
            let m_hat = *m / bias1;
            let v_hat = *v / bias2;
            *p -= learning_rate * m_hat / (v_hat.sqrt() + self.epsilon);
        }
    }

    fn reset(&mut self) {
        self.state.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assert_eq_float;

    fn tensor(data: &[f32]) -> Tensor {
        Tensor::new(&[1, data.len()], data.to_vec()).unwrap()
    }

    #[test]
    fn test_sgd_no_momentum() {
        let mut value = tensor(&[1.0, 2.0]);
        let grad = tensor(&[1.0, 1.0]);
        let mut optim = SGD::new(0.0);
        optim.step(DataId(0), &mut value, &grad, 0.1);
        assert_eq_float!(value.data()[0], 0.9);
        assert_eq_float!(value.data()[1], 1.9);
    }

    #[test]
    fn test_sgd_with_momentum() {
        let mut value = tensor(&[1.0, 2.0]);
        let grad = tensor(&[1.0, 1.0]);
        let mut optim = SGD::new(0.9);
        optim.step(DataId(0), &mut value, &grad, 0.1);
        assert_eq_float!(value.data()[0], 0.9);
        assert_eq_float!(value.data()[1], 1.9);
        optim.step(DataId(0), &mut value, &grad, 0.1);
        assert_eq_float!(value.data()[0], 0.71);
        assert_eq_float!(value.data()[1], 1.71);
        let velocity = optim.velocity(DataId(0)).unwrap();
        assert_eq_float!(velocity[0], -0.19);

        optim.reset();
        assert!(optim.velocity(DataId(0)).is_none());
    }

    #[test]
    fn test_adam_first_step_moves_by_learning_rate() {
        // with bias correction, the first step is lr * sign(g) whatever the gradient scale
        let mut value = tensor(&[1.0, 1.0, 1.0]);
        let grad = tensor(&[1000.0, -0.001, 0.0]);
        let mut optim = Adam::default();
        optim.step(DataId(3), &mut value, &grad, 0.01);
        assert_eq_float!(value.data()[0], 0.99);
        assert_eq_float!(value.data()[1], 1.01, 1e-4);
        assert_eq_float!(value.data()[2], 1.0);
        assert_eq!(optim.steps(DataId(3)), 1);
        assert_eq!(optim.steps(DataId(4)), 0);
    }

    #[test]
    fn test_adam_state_is_per_parameter() {
        let grad = tensor(&[1.0]);
        let mut a = tensor(&[0.0]);
        let mut b = tensor(&[0.0]);
        let mut optim = Adam::default();
        optim.step(DataId(0), &mut a, &grad, 0.1);
        optim.step(DataId(0), &mut a, &grad, 0.1);
        optim.step(DataId(1), &mut b, &grad, 0.1);
        assert_eq!(optim.steps(DataId(0)), 2);
        assert_eq!(optim.steps(DataId(1)), 1);
        // constant gradient: every step moves by lr
        assert_eq_float!(a.data()[0], -0.2);
        assert_eq_float!(b.data()[0], -0.1);
    }

    #[test]
    fn test_adam_minimizes_quadratic() {
        // f(p) = (p - 3)^2, gradient 2(p - 3)
        let mut value = tensor(&[-5.0]);
        let mut optim = OptimizerConfig::default().build();
        for _ in 0..2000 {
            let grad = value.map(|p| 2.0 * (p - 3.0));
            optim.step(DataId(0), &mut value, &grad, 0.05);
        }
        assert_eq_float!(value.data()[0], 3.0, 5e-2);
    }
}
