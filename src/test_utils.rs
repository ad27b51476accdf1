//! Finite-difference gradient checking.

use crate::array::Array;
use crate::error::Error;
use crate::tape::Tape;
use crate::variable::Variable;

/// Checks the analytical gradient of `target` against central differences.
///
/// `func` must build a scalar loss on the tape it is given, reading
/// `target` (and any other variables it captures). It is called once for
/// the analytical pass and twice per element of `target` with a fresh tape
/// each time. `target`'s value is restored afterwards and its gradient is
/// left holding the analytical result.
///
/// Each element's error is `|a - n| / max(1, |a|, |n|)`. Returns
/// `Error::GradientCheckError` when the largest one exceeds `tolerance`.
pub fn check_gradient<F>(func: F, target: &Variable, epsilon: f32, tolerance: f32) -> Result<(), Error>
where
    F: Fn(&mut Tape) -> Result<Variable, Error>,
{
    let analytical = compute_analytical_gradient(&func, target)?;
    let numerical = compute_numerical_gradient(&func, target, epsilon)?;
    compare_gradients(&analytical, &numerical, tolerance)
}

fn compute_analytical_gradient<F>(func: &F, target: &Variable) -> Result<Vec<f32>, Error>
where
    F: Fn(&mut Tape) -> Result<Variable, Error>,
{
    target.clear_grad();
    let mut tape = Tape::new();
    let loss = func(&mut tape)?;
    tape.backward(&loss)?;
    Ok(target.grad_or_zeros()?.to_vec())
}

fn evaluate<F>(func: &F) -> Result<f32, Error>
where
    F: Fn(&mut Tape) -> Result<Variable, Error>,
{
    let mut tape = Tape::new();
    tape.set_recording(false);
    let loss = func(&mut tape)?;
    let values = loss.to_vec()?;
    match values.as_slice() {
        [v] => Ok(*v),
        _ => Err(Error::NonScalarLoss {
            name: loss.name(),
            shape: loss.shape()?,
        }),
    }
}

fn compute_numerical_gradient<F>(func: &F, target: &Variable, epsilon: f32) -> Result<Vec<f32>, Error>
where
    F: Fn(&mut Tape) -> Result<Variable, Error>,
{
    let original = target.value()?.clone();
    let shape = original.shape().to_vec();
    let data = original.to_vec();

    let perturbed_loss = |i: usize, delta: f32| -> Result<f32, Error> {
        let mut perturbed = data.clone();
        perturbed[i] += delta;
        target.set_value(Array::from_vec(perturbed, &shape)?);
        evaluate(func)
    };

    let numerical = (0..data.len())
        .map(|i| Ok((perturbed_loss(i, epsilon)? - perturbed_loss(i, -epsilon)?) / (2.0 * epsilon)))
        .collect::<Result<Vec<f32>, Error>>();
    target.set_value(original);
    numerical
}

fn compare_gradients(analytical: &[f32], numerical: &[f32], tolerance: f32) -> Result<(), Error> {
    if analytical.len() != numerical.len() {
        return Err(Error::InternalLogicError(format!(
            "Gradient size mismatch: analytical size={}, numerical size={}",
            analytical.len(),
            numerical.len()
        )));
    }

    let mut max_rel_err = 0.0;
    let mut max_abs_err = 0.0;
    let mut max_err_idx = 0;

    for (i, (a, n)) in analytical.iter().zip(numerical.iter()).enumerate() {
        let abs_err = (a - n).abs();
        // relative for large entries, absolute below magnitude 1
        let rel_err = abs_err / a.abs().max(n.abs()).max(1.0);
        if rel_err > max_rel_err {
            max_rel_err = rel_err;
            max_abs_err = abs_err;
            max_err_idx = i;
        }
    }

    if max_rel_err <= tolerance {
        Ok(())
    } else {
        Err(Error::GradientCheckError {
            analytical: analytical.to_vec(),
            numerical: numerical.to_vec(),
            max_rel_error: max_rel_err,
            max_abs_error: max_abs_err,
            at_index: max_err_idx,
        })
    }
}
