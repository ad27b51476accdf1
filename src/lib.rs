//! Tape-based reverse-mode automatic differentiation.
//!
//! Forward operations run eagerly and append one entry each to a [`Tape`].
//! [`Tape::backward`] replays the log in reverse from a scalar loss and
//! accumulates gradients into every [`Variable`] the loss depends on.
//!
//! Every operation exists in two forms: [`ops`] takes an explicit tape, and
//! [`function`] records on the thread's global tape, which
//! [`reset_global_tape`] swaps for a fresh one at the start of each
//! iteration.
//!
//! # Features
//! - `reader` (default) - CSV-backed [`RecordReader`]
//! - `serialization` - JSON save/load for variables
//!
//! # Example
//! ```rust
//! use tapegrad::{function, get_global_tape, reset_global_tape, Activation, Linear, Sgd, Variable};
//!
//! fn main() -> Result<(), tapegrad::Error> {
//!     let layer = Linear::new(3, 2, Activation::Identity)?;
//!     let sgd = Sgd::new(0.1);
//!
//!     for _ in 0..2 {
//!         reset_global_tape();
//!         let x = Variable::from_vec("input", vec![1.0, 2.0, 3.0], &[1, 3])?;
//!         let loss = function::mean(&layer.call(&x)?)?;
//!         get_global_tape().borrow_mut().backward(&loss)?;
//!         sgd.step(&layer.params())?;
//!     }
//!     assert!(layer.weight().grad().is_none());
//!     Ok(())
//! }
//! ```

pub mod array;
#[cfg(feature = "reader")]
pub mod data;
pub mod error;
pub mod function;
pub mod graph;
pub mod init;
pub mod nn;
pub mod ops;
pub mod optim;
pub mod tape;
pub mod test_utils;
pub mod variable;
mod variable_debug_impl;

pub use array::Array;
#[cfg(feature = "reader")]
pub use data::{create_reader, RecordReader};
pub use error::Error;
pub use graph::{Op, OpKind};
pub use init::{Attribute, AttributeMap, DType, Fill, Initializer};
pub use nn::{Activation, Convolution2D, Linear};
pub use optim::Sgd;
pub use tape::{get_global_tape, no_grad, reset_global_tape, with_global_tape, Tape};
pub use variable::Variable;
