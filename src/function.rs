//! The same operations as [`crate::ops`], recorded on the thread's global
//! tape.

use crate::error::Error;
use crate::ops;
use crate::tape::with_global_tape;
use crate::variable::Variable;

#[cfg(feature = "reader")]
use crate::data::{self, RecordReader};

pub fn matmul(x: &Variable, w: &Variable) -> Result<Variable, Error> {
    with_global_tape(|tape| ops::matmul(tape, x, w))
}

pub fn elementwise_add(x: &Variable, y: &Variable, axis: usize) -> Result<Variable, Error> {
    with_global_tape(|tape| ops::elementwise_add(tape, x, y, axis))
}

pub fn relu(x: &Variable) -> Result<Variable, Error> {
    with_global_tape(|tape| ops::relu(tape, x))
}

pub fn sigmoid(x: &Variable) -> Result<Variable, Error> {
    with_global_tape(|tape| ops::sigmoid(tape, x))
}

pub fn tanh(x: &Variable) -> Result<Variable, Error> {
    with_global_tape(|tape| ops::tanh(tape, x))
}

pub fn softmax(x: &Variable) -> Result<Variable, Error> {
    with_global_tape(|tape| ops::softmax(tape, x))
}

pub fn cross_entropy(x: &Variable, label: &Variable) -> Result<Variable, Error> {
    with_global_tape(|tape| ops::cross_entropy(tape, x, label))
}

pub fn soft_cross_entropy(x: &Variable, label: &Variable) -> Result<Variable, Error> {
    with_global_tape(|tape| ops::soft_cross_entropy(tape, x, label))
}

pub fn mean(x: &Variable) -> Result<Variable, Error> {
    with_global_tape(|tape| ops::mean(tape, x))
}

pub fn conv2d(
    input: &Variable,
    filter: &Variable,
    stride: (usize, usize),
    padding: (usize, usize),
) -> Result<Variable, Error> {
    with_global_tape(|tape| ops::conv2d(tape, input, filter, stride, padding))
}

/// Replays the global tape from `loss`.
pub fn backward(loss: &Variable) -> Result<(), Error> {
    with_global_tape(|tape| tape.backward(loss))
}

/// Reads the next batch and records it on the global tape.
#[cfg(feature = "reader")]
pub fn read_next(reader: &mut RecordReader) -> Result<Vec<Variable>, Error> {
    with_global_tape(|tape| data::read_next(tape, reader))
}
