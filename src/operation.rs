//! Forward and backward rules for each module kind
//!
//! A module sees its operands as one list: its inputs, in wiring order, followed by the
//! parameters it owns. Backward produces one optional gradient per operand.

use std::fmt::{self, Display};

use crate::tensor::{Tensor, TensorError};

/// Represents the function a module applies in the computation graph
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpKind {
    /// `out = input . weight + bias`
    MatMul,
    /// `out = max(0, input)`
    Relu,
    /// `out = mean((prediction - target)^2)`
    MseLoss,
}

/// How a parameter owned by a module is initialized
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Init {
    /// He initialization for `fan_in` inputs
    HeNormal { fan_in: usize },
    Zeros,
}

/// A parameter a module needs, derived from the shapes it is wired to
#[derive(Debug, Clone, PartialEq)]
pub struct ParamSpec {
    pub suffix: &'static str,
    pub shape: Vec<usize>,
    pub init: Init,
}

impl OpKind {
    pub fn n_inputs(&self) -> usize {
        match self {
            OpKind::MatMul => 1,
            OpKind::Relu => 1,
            OpKind::MseLoss => 2,
        }
    }

    /// Validates the wiring of a module and returns the parameters it owns.
    /// The error is a human readable reason.
    pub fn check_wiring(
        &self,
        inputs: &[&[usize]],
        output: &[usize],
    ) -> Result<Vec<ParamSpec>, String> {
        if inputs.len() != self.n_inputs() {
            return Err(format!(
                "{} takes {} input(s), got {}",
                self,
                self.n_inputs(),
                inputs.len()
            ));
        }
        match self {
            OpKind::MatMul => {
                let (&[batch, fan_in], &[out_batch, fan_out]) = (inputs[0], output) else {
                    return Err(format!(
                        "MatMul needs 2-D input and output, got {:?} -> {:?}",
                        inputs[0], output
                    ));
                };
                if batch != out_batch {
                    return Err(format!(
                        "MatMul keeps the batch dimension, got {:?} -> {:?}",
                        inputs[0], output
                    ));
                }
                Ok(vec![
                    ParamSpec {
                        suffix: "weight",
                        shape: vec![fan_in, fan_out],
                        init: Init::HeNormal { fan_in },
                    },
                    ParamSpec {
                        suffix: "bias",
                        shape: vec![1, fan_out],
                        init: Init::Zeros,
                    },
                ])
            }
            OpKind::Relu => {
                if inputs[0] != output {
                    return Err(format!(
                        "Relu preserves shape, got {:?} -> {:?}",
                        inputs[0], output
                    ));
                }
                Ok(vec![])
            }
            OpKind::MseLoss => {
                if inputs[0] != inputs[1] {
                    return Err(format!(
                        "prediction {:?} and target {:?} must have the same shape",
                        inputs[0], inputs[1]
                    ));
                }
                if output.iter().product::<usize>() != 1 {
                    return Err(format!(
                        "MSELoss produces a single value, output declared as {:?}",
                        output
                    ));
                }
                Ok(vec![])
            }
        }
    }
}

impl Display for OpKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OpKind::MatMul => write!(f, "MatMul"),
            OpKind::Relu => write!(f, "Relu"),
            OpKind::MseLoss => write!(f, "MSELoss"),
        }
    }
}

/// `input . weight + bias`
pub fn matmul(input: &Tensor, weight: &Tensor, bias: &Tensor) -> Result<Tensor, TensorError> {
    input.matmul(weight)?.add_row(bias)
}

/// Represents backprop for `input . weight + bias = out`
pub fn matmul_backward(
    input: &Tensor,
    weight: &Tensor,
    grad: &Tensor,
) -> Result<Vec<Option<Tensor>>, TensorError> {
    let d_input = grad.matmul(&weight.transpose()?)?;
    let d_weight = input.transpose()?.matmul(grad)?;
    let d_bias = grad.sum_rows()?;
    Ok(vec![Some(d_input), Some(d_weight), Some(d_bias)])
}

pub fn relu(input: &Tensor) -> Tensor {
    input.map(|v| v.max(0.0))
}

/// Represents backprop for `relu(input) = out`
pub fn relu_backward(input: &Tensor, grad: &Tensor) -> Result<Vec<Option<Tensor>>, TensorError> {
    let d_input = input.zip_map(grad, |x, g| if x > 0.0 { g } else { 0.0 })?;
    Ok(vec![Some(d_input)])
}

/// Mean squared error over every element, as a one-element tensor
pub fn mse(prediction: &Tensor, target: &Tensor) -> Result<Tensor, TensorError> {
    let sq = prediction.zip_map(target, |p, t| (p - t) * (p - t))?;
    let n = sq.len() as f32;
    Ok(Tensor::scalar(sq.data().iter().sum::<f32>() / n))
}

/// Represents backprop for `mse(prediction, target) = out`.
/// The target is treated as a constant and receives no gradient.
pub fn mse_backward(
    prediction: &Tensor,
    target: &Tensor,
    grad: &Tensor,
) -> Result<Vec<Option<Tensor>>, TensorError> {
    let g = grad.data().iter().sum::<f32>();
    let scale = 2.0 * g / prediction.len() as f32;
    let d_prediction = prediction.zip_map(target, |p, t| scale * (p - t))?;
    Ok(vec![Some(d_prediction), None])
}

/// Applies the forward rule of `kind` to its operands
pub fn forward(kind: OpKind, operands: &[&Tensor]) -> Result<Tensor, TensorError> {
    match (kind, operands) {
        (OpKind::MatMul, [input, weight, bias]) => matmul(input, weight, bias),
        (OpKind::Relu, [input]) => Ok(relu(input)),
        (OpKind::MseLoss, [prediction, target]) => mse(prediction, target),
        _ => Err(operand_mismatch(kind, operands)),
    }
}

/// Applies the backward rule of `kind`, given the gradient flowing into its output
pub fn backward(
    kind: OpKind,
    operands: &[&Tensor],
    grad: &Tensor,
) -> Result<Vec<Option<Tensor>>, TensorError> {
    match (kind, operands) {
        (OpKind::MatMul, [input, weight, _]) => matmul_backward(input, weight, grad),
        (OpKind::Relu, [input]) => relu_backward(input, grad),
        (OpKind::MseLoss, [prediction, target]) => mse_backward(prediction, target, grad),
        _ => Err(operand_mismatch(kind, operands)),
    }
}

fn operand_mismatch(kind: OpKind, operands: &[&Tensor]) -> TensorError {
    TensorError::ShapeMismatch {
        op: match kind {
            OpKind::MatMul => "MatMul",
            OpKind::Relu => "Relu",
            OpKind::MseLoss => "MSELoss",
        },
        lhs: vec![operands.len()],
        rhs: vec![],
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assert_eq_float;

    fn t(rows: &[&[f32]]) -> Tensor {
        Tensor::from_rows(rows).unwrap()
    }

    #[test]
    fn test_check_wiring_matmul() {
        let params = OpKind::MatMul.check_wiring(&[&[4, 3]], &[4, 5]).unwrap();
        assert_eq!(params.len(), 2);
        assert_eq!(params[0].shape, vec![3, 5]);
        assert_eq!(params[0].init, Init::HeNormal { fan_in: 3 });
        assert_eq!(params[1].shape, vec![1, 5]);

        assert!(OpKind::MatMul.check_wiring(&[&[4, 3]], &[2, 5]).is_err());
        assert!(OpKind::MatMul.check_wiring(&[&[3]], &[1, 5]).is_err());
        assert!(OpKind::MatMul.check_wiring(&[&[1, 3], &[1, 3]], &[1, 5]).is_err());
    }

    #[test]
    fn test_check_wiring_relu_and_mse() {
        assert!(OpKind::Relu.check_wiring(&[&[1, 5]], &[1, 5]).unwrap().is_empty());
        assert!(OpKind::Relu.check_wiring(&[&[1, 5]], &[5, 1]).is_err());
        assert!(OpKind::MseLoss.check_wiring(&[&[2, 1], &[2, 1]], &[1]).is_ok());
        assert!(OpKind::MseLoss.check_wiring(&[&[2, 1], &[2, 1]], &[1, 1]).is_ok());
        assert!(OpKind::MseLoss.check_wiring(&[&[2, 1], &[1, 2]], &[1]).is_err());
        assert!(OpKind::MseLoss.check_wiring(&[&[2, 1], &[2, 1]], &[2]).is_err());
        assert!(OpKind::MseLoss.check_wiring(&[&[2, 1]], &[1]).is_err());
    }

    #[test]
    fn test_matmul_forward_backward() {
        let x = t(&[&[1.0, 2.0]]);
        let w = t(&[&[1.0, 0.0, -1.0], &[2.0, 1.0, 0.5]]);
        let b = t(&[&[0.5, 0.5, 0.5]]);
        let out = forward(OpKind::MatMul, &[&x, &w, &b]).unwrap();
        assert_eq!(out.data(), &[5.5, 2.5, 0.5]);

        let g = t(&[&[1.0, 1.0, 1.0]]);
        let grads = backward(OpKind::MatMul, &[&x, &w, &b], &g).unwrap();
        // dx = g . W^T
        assert_eq!(grads[0].as_ref().unwrap().data(), &[0.0, 3.5]);
        // dW = x^T . g
        assert_eq!(
            grads[1].as_ref().unwrap().data(),
            &[1.0, 1.0, 1.0, 2.0, 2.0, 2.0]
        );
        assert_eq!(grads[2].as_ref().unwrap().data(), &[1.0, 1.0, 1.0]);
    }

    #[test]
    fn test_relu_forward_backward() {
        let x = t(&[&[-1.0, 0.0, 2.0]]);
        let out = forward(OpKind::Relu, &[&x]).unwrap();
        assert_eq!(out.data(), &[0.0, 0.0, 2.0]);

        let g = t(&[&[3.0, 3.0, 3.0]]);
        let grads = backward(OpKind::Relu, &[&x], &g).unwrap();
        assert_eq!(grads[0].as_ref().unwrap().data(), &[0.0, 0.0, 3.0]);
    }

    #[test]
    fn test_mse_forward_backward() {
        let p = t(&[&[2.0], &[3.0]]);
        let y = t(&[&[1.0], &[5.0]]);
        let out = forward(OpKind::MseLoss, &[&p, &y]).unwrap();
        assert_eq_float!(out.item().unwrap(), 2.5);

        // dloss / dp = 2/N * (p - y)
        let grads = backward(OpKind::MseLoss, &[&p, &y], &Tensor::scalar(1.0)).unwrap();
        assert_eq!(grads[0].as_ref().unwrap().data(), &[1.0, -2.0]);
        assert!(grads[1].is_none());
    }

    #[test]
    fn test_wrong_operand_count() {
        let x = t(&[&[1.0]]);
        assert!(forward(OpKind::MatMul, &[&x]).is_err());
        assert!(backward(OpKind::MseLoss, &[&x], &x).is_err());
    }
}
