//! Adam optimizer for Candle Var tensors.
//!
//! Implements Adam with:
//! - Per-parameter moment estimates (m, v)
//! - Constant step size
//!
//! L2 regularization of the towers is part of the loss, not the optimizer.

use candle_core::{Tensor, Var};

use crate::error::{ClassifierError, ClassifierResult};

/// Adam optimizer configuration.
#[derive(Debug, Clone)]
pub struct AdamConfig {
    /// Step size.
    pub learning_rate: f64,
    /// First moment exponential decay rate.
    pub beta1: f64,
    /// Second moment exponential decay rate.
    pub beta2: f64,
    /// Numerical stability constant.
    pub epsilon: f64,
}

impl Default for AdamConfig {
    fn default() -> Self {
        Self {
            learning_rate: 1e-3,
            beta1: 0.9,
            beta2: 0.999,
            epsilon: 1e-8,
        }
    }
}

impl AdamConfig {
    /// Defaults with the given step size.
    pub fn with_learning_rate(learning_rate: f64) -> Self {
        Self {
            learning_rate,
            ..Default::default()
        }
    }
}

/// A tracked parameter with its moment estimates.
struct TrackedParam {
    var: Var,
    m: Tensor,
    v: Tensor,
}

/// Adam optimizer over both towers' variables.
pub struct Adam {
    config: AdamConfig,
    params: Vec<TrackedParam>,
    /// Global step counter for bias correction.
    step: usize,
}

impl Adam {
    /// Create an optimizer with no registered parameters.
    pub fn new(config: AdamConfig) -> Self {
        Self {
            config,
            params: Vec::new(),
            step: 0,
        }
    }

    /// Register a trainable parameter.
    pub fn add_param(&mut self, var: Var) -> ClassifierResult<()> {
        let tensor = var.as_tensor();
        let m = tensor.zeros_like().map_err(map_candle)?;
        let v = tensor.zeros_like().map_err(map_candle)?;

        self.params.push(TrackedParam { var, m, v });
        Ok(())
    }

    /// Register every variable in `vars`.
    pub fn add_params(&mut self, vars: impl IntoIterator<Item = Var>) -> ClassifierResult<()> {
        for var in vars {
            self.add_param(var)?;
        }
        Ok(())
    }

    /// Backpropagate `loss` and apply one update to every registered parameter.
    pub fn step(&mut self, loss: &Tensor) -> ClassifierResult<()> {
        self.step += 1;
        let t = self.step as i32;

        let grads = loss.backward().map_err(map_candle)?;

        let lr = self.config.learning_rate;
        let beta1 = self.config.beta1;
        let beta2 = self.config.beta2;
        let bc1 = 1.0 - beta1.powi(t);
        let bc2 = 1.0 - beta2.powi(t);

        for param in &mut self.params {
            let grad = match grads.get(param.var.as_tensor()) {
                Some(g) => g,
                None => continue,
            };

            // m = β1 * m + (1 - β1) * g
            param.m = param
                .m
                .affine(beta1, 0.0)
                .map_err(map_candle)?
                .add(&grad.affine(1.0 - beta1, 0.0).map_err(map_candle)?)
                .map_err(map_candle)?
                .detach();

            // v = β2 * v + (1 - β2) * g²
            param.v = param
                .v
                .affine(beta2, 0.0)
                .map_err(map_candle)?
                .add(
                    &grad
                        .sqr()
                        .map_err(map_candle)?
                        .affine(1.0 - beta2, 0.0)
                        .map_err(map_candle)?,
                )
                .map_err(map_candle)?
                .detach();

            let m_hat = param.m.affine(1.0 / bc1, 0.0).map_err(map_candle)?;
            let denom = param
                .v
                .affine(1.0 / bc2, 0.0)
                .map_err(map_candle)?
                .sqrt()
                .map_err(map_candle)?
                .affine(1.0, self.config.epsilon)
                .map_err(map_candle)?;
            let update = m_hat
                .div(&denom)
                .map_err(map_candle)?
                .affine(-lr, 0.0)
                .map_err(map_candle)?;

            let new_val = param
                .var
                .as_tensor()
                .add(&update)
                .map_err(map_candle)?
                .detach();
            param.var.set(&new_val).map_err(map_candle)?;
        }

        Ok(())
    }
}

fn map_candle(e: candle_core::Error) -> ClassifierError {
    ClassifierError::TensorError {
        message: format!("Optimizer error: {}", e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};

    #[test]
    fn test_unused_param_is_left_alone() {
        let used = Var::from_tensor(&Tensor::new(&[1.0f32], &Device::Cpu).unwrap()).unwrap();
        let unused = Var::from_tensor(&Tensor::new(&[5.0f32], &Device::Cpu).unwrap()).unwrap();
        let mut opt = Adam::new(AdamConfig::with_learning_rate(0.1));
        opt.add_params([used.clone(), unused.clone()]).unwrap();

        let loss = used.as_tensor().sum_all().unwrap();
        opt.step(&loss).unwrap();

        assert_eq!(unused.as_tensor().to_vec1::<f32>().unwrap(), vec![5.0]);
        assert!(used.as_tensor().to_vec1::<f32>().unwrap()[0] < 1.0);
    }

    #[test]
    fn test_step_descends_quadratic() {
        // loss = sum((w - 3)^2), minimum at w = 3
        let var = Var::from_tensor(&Tensor::zeros(4, DType::F32, &Device::Cpu).unwrap()).unwrap();
        let mut opt = Adam::new(AdamConfig::with_learning_rate(0.1));
        opt.add_param(var.clone()).unwrap();

        let loss_at = |v: &Var| -> Tensor {
            v.as_tensor()
                .affine(1.0, -3.0)
                .unwrap()
                .sqr()
                .unwrap()
                .sum_all()
                .unwrap()
        };

        let initial: f32 = loss_at(&var).to_scalar().unwrap();
        for _ in 0..50 {
            let loss = loss_at(&var);
            opt.step(&loss).unwrap();
        }
        let last: f32 = loss_at(&var).to_scalar().unwrap();

        assert!(last < initial, "loss should decrease: {} -> {}", initial, last);
    }

    #[test]
    fn test_first_step_moves_by_learning_rate() {
        // Adam's first bias-corrected update has magnitude ~lr regardless of gradient scale.
        let var = Var::from_tensor(&Tensor::new(&[1.0f32], &Device::Cpu).unwrap()).unwrap();
        let mut opt = Adam::new(AdamConfig::with_learning_rate(0.01));
        opt.add_param(var.clone()).unwrap();

        let loss = var.as_tensor().affine(100.0, 0.0).unwrap().sum_all().unwrap();
        opt.step(&loss).unwrap();

        let value = var.as_tensor().to_vec1::<f32>().unwrap()[0];
        assert!((value - 0.99).abs() < 1e-4, "got {}", value);
    }
}
