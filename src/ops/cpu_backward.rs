//! Backward rules, one arm per [`OpKind`].
//!
//! Each rule is a pure function of the recorded inputs, outputs, attributes
//! and the incoming output gradients. It returns one entry per input, `None`
//! for inputs that receive no gradient (labels, for instance).

use crate::array::Array;
use crate::error::Error;
use crate::graph::{Op, OpKind};
use crate::ops::cpu_ops;
use ndarray::{Axis, Zip};

/// Computes the gradients flowing into `op`'s inputs.
pub(crate) fn gradients(op: &Op, output_grads: &[Array]) -> Result<Vec<Option<Array>>, Error> {
    let grad_out = output_grads.first().ok_or_else(|| {
        Error::InternalLogicError(format!("{} replayed without an output gradient", op.kind))
    })?;
    match &op.kind {
        OpKind::Fill(_) | OpKind::Read { .. } => Ok(Vec::new()),
        OpKind::MatMul => matmul_backward(op, grad_out),
        OpKind::ElementwiseAdd { axis } => elementwise_add_backward(op, grad_out, *axis),
        OpKind::Relu => relu_backward(op, grad_out),
        OpKind::Sigmoid => {
            let y = op.output(0)?.value()?;
            let grad = Zip::from(grad_out.get_data())
                .and(y.get_data())
                .map_collect(|&g, &out| g * out * (1.0 - out));
            Ok(vec![Some(Array::new(grad))])
        }
        OpKind::Tanh => {
            let y = op.output(0)?.value()?;
            let grad = Zip::from(grad_out.get_data())
                .and(y.get_data())
                .map_collect(|&g, &out| g * (1.0 - out * out));
            Ok(vec![Some(Array::new(grad))])
        }
        OpKind::Softmax => softmax_backward(op, grad_out),
        OpKind::CrossEntropy { soft_label } => {
            let x = op.input(0)?.value()?;
            let label = op.input(1)?.value()?;
            let grad_x = cpu_ops::cross_entropy_backward(&x, &label, grad_out, *soft_label)?;
            Ok(vec![Some(grad_x), None])
        }
        OpKind::Mean => {
            let x = op.input(0)?.value()?;
            if grad_out.size() != 1 {
                return Err(Error::ShapeMismatch {
                    expected: vec![1],
                    actual: grad_out.shape().to_vec(),
                });
            }
            let scale = grad_out.to_vec()[0] / x.size() as f32;
            Ok(vec![Some(Array::full(x.shape(), scale))])
        }
        OpKind::Conv2d { stride, padding } => {
            let input = op.input(0)?.value()?;
            let filter = op.input(1)?.value()?;
            let (grad_input, grad_filter) =
                cpu_ops::conv2d_backward(&input, &filter, grad_out, *stride, *padding)?;
            Ok(vec![Some(grad_input), Some(grad_filter)])
        }
    }
}

/// `dX = dY · Wᵀ` reshaped to X, `dW = X₂ᵀ · dY`.
fn matmul_backward(op: &Op, grad_out: &Array) -> Result<Vec<Option<Array>>, Error> {
    let x = op.input(0)?.value()?;
    let w = op.input(1)?.value()?;
    let x_2d = cpu_ops::flatten_to_2d(&x)?;

    let grad_x = cpu_ops::matmul(grad_out, &cpu_ops::transpose(&w)?)?.reshaped(x.shape())?;
    let grad_w = cpu_ops::matmul(&cpu_ops::transpose(&x_2d)?, grad_out)?;
    Ok(vec![Some(grad_x), Some(grad_w)])
}

fn elementwise_add_backward(
    op: &Op,
    grad_out: &Array,
    axis: usize,
) -> Result<Vec<Option<Array>>, Error> {
    let y_shape = op.input(1)?.shape()?;
    let grad_y = cpu_ops::reduce_to_axis(grad_out, &y_shape, axis)?;
    Ok(vec![Some(grad_out.clone()), Some(grad_y)])
}

/// `dx = dy * (1 if x > 0 else 0)`
fn relu_backward(op: &Op, grad_out: &Array) -> Result<Vec<Option<Array>>, Error> {
    let x = op.input(0)?.value()?;
    let grad = Zip::from(grad_out.get_data())
        .and(x.get_data())
        .map_collect(|&g, &x| if x > 0.0 { g } else { 0.0 });
    Ok(vec![Some(Array::new(grad))])
}

/// `dx = y * (dy - sum(dy * y))` along the last axis, using the recorded
/// forward output `y`.
fn softmax_backward(op: &Op, grad_out: &Array) -> Result<Vec<Option<Array>>, Error> {
    let y = op.output(0)?.value()?;
    let y_data = y.get_data();
    let axis = Axis(y_data.ndim() - 1);

    let dot = (grad_out.get_data() * y_data).sum_axis(axis).insert_axis(axis);
    let grad = y_data * &(grad_out.get_data() - &dot);
    Ok(vec![Some(Array::new(grad))])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::variable::Variable;
    use approx::assert_abs_diff_eq;

    fn op(kind: OpKind, inputs: Vec<Variable>, outputs: Vec<Variable>) -> Op {
        Op::new(kind, inputs, outputs)
    }

    #[test]
    fn test_relu_masks_non_positive() -> Result<(), Error> {
        let x = Variable::from_vec("x", vec![-1.0, 0.0, 2.0], &[3])?;
        let y = Variable::from_array("y", cpu_ops::relu(&*x.value()?));
        let grads = gradients(
            &op(OpKind::Relu, vec![x], vec![y]),
            &[Array::from_vec(vec![5.0, 5.0, 5.0], &[3])?],
        )?;
        assert_eq!(grads[0].as_ref().map(|g| g.to_vec()), Some(vec![0.0, 0.0, 5.0]));
        Ok(())
    }

    #[test]
    fn test_softmax_gradient_sums_to_zero() -> Result<(), Error> {
        let x = Variable::from_vec("x", vec![0.1, 0.7, -0.3], &[1, 3])?;
        let y = Variable::from_array("y", cpu_ops::softmax(&*x.value()?)?);
        let grads = gradients(
            &op(OpKind::Softmax, vec![x], vec![y]),
            &[Array::from_vec(vec![1.0, -2.0, 0.5], &[1, 3])?],
        )?;
        let grad = grads[0].as_ref().ok_or(Error::InvalidOperation("no grad".into()))?;
        assert_abs_diff_eq!(grad.to_vec().iter().sum::<f32>(), 0.0, epsilon = 1e-6);
        Ok(())
    }

    #[test]
    fn test_cross_entropy_label_gets_no_gradient() -> Result<(), Error> {
        let x = Variable::from_vec("x", vec![0.2, 0.8], &[1, 2])?;
        let label = Variable::from_vec("label", vec![1.0], &[1, 1])?;
        let y = Variable::from_array(
            "y",
            cpu_ops::cross_entropy(&*x.value()?, &*label.value()?, false)?,
        );
        let grads = gradients(
            &op(OpKind::CrossEntropy { soft_label: false }, vec![x, label], vec![y]),
            &[Array::ones(&[1, 1])],
        )?;
        assert!(grads[1].is_none());
        let grad_x = grads[0].as_ref().map(|g| g.to_vec()).unwrap_or_default();
        assert_abs_diff_eq!(grad_x[0], 0.0, epsilon = 1e-6);
        assert_abs_diff_eq!(grad_x[1], -1.0 / 0.8, epsilon = 1e-5);
        Ok(())
    }

    #[test]
    fn test_matmul_backward_restores_input_shape() -> Result<(), Error> {
        let x = Variable::from_array("x", Array::ones(&[2, 1, 2, 2]));
        let w = Variable::from_array("w", Array::ones(&[4, 3]));
        let y = Variable::from_array("y", Array::zeros(&[2, 3]));
        let grads = gradients(
            &op(OpKind::MatMul, vec![x, w], vec![y]),
            &[Array::ones(&[2, 3])],
        )?;
        assert_eq!(grads[0].as_ref().map(|g| g.shape().to_vec()), Some(vec![2, 1, 2, 2]));
        assert_eq!(grads[1].as_ref().map(|g| g.to_vec()), Some(vec![2.0; 12]));
        Ok(())
    }

    #[test]
    fn test_source_ops_have_no_rule() -> Result<(), Error> {
        let out = Variable::from_array("data", Array::zeros(&[1]));
        let grads = gradients(
            &op(OpKind::Read { fields: 1 }, vec![], vec![out]),
            &[Array::ones(&[1])],
        )?;
        assert!(grads.is_empty());
        Ok(())
    }
}
