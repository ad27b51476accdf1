//! Forward operations on an explicit [`Tape`].
//!
//! Each function computes its output eagerly, wraps it in a fresh
//! [`Variable`] and records exactly one primitive op. The global-tape
//! versions live in [`crate::function`].

use crate::array::Array;
use crate::error::Error;
use crate::graph::OpKind;
use crate::tape::Tape;
use crate::variable::Variable;

pub mod cpu_backward;
pub mod cpu_ops;

fn unary(
    tape: &mut Tape,
    x: &Variable,
    kind: OpKind,
    prefix: &str,
    forward: impl FnOnce(&Array) -> Result<Array, Error>,
) -> Result<Variable, Error> {
    let output = Variable::from_array(prefix, forward(&*x.value()?)?);
    tape.record(kind, vec![x.clone()], vec![output.clone()])?;
    Ok(output)
}

/// `x · w`, flattening `x` to `[x.shape[0], rest]` first.
pub fn matmul(tape: &mut Tape, x: &Variable, w: &Variable) -> Result<Variable, Error> {
    let out = {
        let x_2d = cpu_ops::flatten_to_2d(&*x.value()?)?;
        cpu_ops::matmul(&x_2d, &*w.value()?)?
    };
    let output = Variable::from_array("mul", out);
    tape.record(OpKind::MatMul, vec![x.clone(), w.clone()], vec![output.clone()])?;
    Ok(output)
}

/// `x + y` with `y`'s dims aligned to `x`'s dims starting at `axis`
/// (bias over features is `axis = 1`).
pub fn elementwise_add(
    tape: &mut Tape,
    x: &Variable,
    y: &Variable,
    axis: usize,
) -> Result<Variable, Error> {
    let out = cpu_ops::add_axis(&*x.value()?, &*y.value()?, axis)?;
    let output = Variable::from_array("add", out);
    tape.record(
        OpKind::ElementwiseAdd { axis },
        vec![x.clone(), y.clone()],
        vec![output.clone()],
    )?;
    Ok(output)
}

pub fn relu(tape: &mut Tape, x: &Variable) -> Result<Variable, Error> {
    unary(tape, x, OpKind::Relu, "relu", |a| Ok(cpu_ops::relu(a)))
}

pub fn sigmoid(tape: &mut Tape, x: &Variable) -> Result<Variable, Error> {
    unary(tape, x, OpKind::Sigmoid, "sigmoid", |a| Ok(cpu_ops::sigmoid(a)))
}

pub fn tanh(tape: &mut Tape, x: &Variable) -> Result<Variable, Error> {
    unary(tape, x, OpKind::Tanh, "tanh", |a| Ok(cpu_ops::tanh(a)))
}

/// Softmax over the last axis.
pub fn softmax(tape: &mut Tape, x: &Variable) -> Result<Variable, Error> {
    unary(tape, x, OpKind::Softmax, "softmax", cpu_ops::softmax)
}

/// Global mean; the output has shape `[1]` and can seed `backward`.
pub fn mean(tape: &mut Tape, x: &Variable) -> Result<Variable, Error> {
    unary(tape, x, OpKind::Mean, "mean", cpu_ops::mean)
}

/// Per-row cross-entropy of probabilities against hard class-index labels
/// (`[N, 1]`). Output is `[N, 1]`.
pub fn cross_entropy(tape: &mut Tape, x: &Variable, label: &Variable) -> Result<Variable, Error> {
    cross_entropy_with(tape, x, label, false)
}

/// Cross-entropy against soft labels shaped like `x`.
pub fn soft_cross_entropy(
    tape: &mut Tape,
    x: &Variable,
    label: &Variable,
) -> Result<Variable, Error> {
    cross_entropy_with(tape, x, label, true)
}

fn cross_entropy_with(
    tape: &mut Tape,
    x: &Variable,
    label: &Variable,
    soft_label: bool,
) -> Result<Variable, Error> {
    let out = cpu_ops::cross_entropy(&*x.value()?, &*label.value()?, soft_label)?;
    let output = Variable::from_array("cross_entropy", out);
    tape.record(
        OpKind::CrossEntropy { soft_label },
        vec![x.clone(), label.clone()],
        vec![output.clone()],
    )?;
    Ok(output)
}

/// 2D convolution (NCHW) of `input` with `filter` `[C_out, C_in, K_h, K_w]`.
pub fn conv2d(
    tape: &mut Tape,
    input: &Variable,
    filter: &Variable,
    stride: (usize, usize),
    padding: (usize, usize),
) -> Result<Variable, Error> {
    let out = cpu_ops::conv2d(&*input.value()?, &*filter.value()?, stride, padding)?;
    let output = Variable::from_array("conv", out);
    tape.record(
        OpKind::Conv2d { stride, padding },
        vec![input.clone(), filter.clone()],
        vec![output.clone()],
    )?;
    Ok(output)
}
