//! Layers that own parameter variables.

use crate::error::Error;
use crate::init::{xavier_uniform, Fill, Initializer};
use crate::ops;
use crate::tape::{with_global_tape, Tape};
use crate::variable::Variable;

use std::fmt;
use std::str::FromStr;
use tracing::debug;

/// Seed used by layer constructors that don't take one.
pub const DEFAULT_SEED: u64 = 123;

/// Activation applied at the end of a layer's forward pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Activation {
    Relu,
    Sigmoid,
    Tanh,
    #[default]
    Identity,
}

impl Activation {
    fn apply(self, tape: &mut Tape, x: &Variable) -> Result<Variable, Error> {
        match self {
            Activation::Relu => ops::relu(tape, x),
            Activation::Sigmoid => ops::sigmoid(tape, x),
            Activation::Tanh => ops::tanh(tape, x),
            Activation::Identity => Ok(x.clone()),
        }
    }
}

impl FromStr for Activation {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "relu" => Ok(Activation::Relu),
            "sigmoid" => Ok(Activation::Sigmoid),
            "tanh" => Ok(Activation::Tanh),
            "" | "identity" => Ok(Activation::Identity),
            other => Err(Error::attribute(
                "activation",
                format!("unknown activation '{}'", other),
            )),
        }
    }
}

impl TryFrom<&str> for Activation {
    type Error = Error;

    fn try_from(s: &str) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl fmt::Display for Activation {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            Activation::Relu => "relu",
            Activation::Sigmoid => "sigmoid",
            Activation::Tanh => "tanh",
            Activation::Identity => "identity",
        };
        write!(f, "{}", name)
    }
}

fn zero_bias(prefix: &str, len: usize) -> Result<Variable, Error> {
    let bias = Variable::new(prefix);
    Fill::from_initializer(Initializer::FillConstant {
        value: 0.0,
        shape: vec![len],
    })
    .initialize(&bias)?;
    Ok(bias)
}

/// Fully connected layer: `act(x · W + b)`.
///
/// `W` is `[in, out]`; inputs with more than two dims are flattened to
/// `[batch, in]` first.
///
/// # Example
/// ```rust
/// use tapegrad::{Linear, Tape, Variable, ops};
///
/// fn main() -> Result<(), tapegrad::Error> {
///     let layer = Linear::new(4, 2, "relu".parse()?)?;
///     let mut tape = Tape::new();
///     let x = Variable::from_vec("x", vec![0.5; 8], &[2, 4])?;
///     let y = layer.forward(&mut tape, &x)?;
///     assert_eq!(y.shape()?, vec![2, 2]);
///
///     let loss = ops::mean(&mut tape, &y)?;
///     tape.backward(&loss)?;
///     assert!(layer.params()[1].grad().is_some());
///     Ok(())
/// }
/// ```
#[derive(Debug, Clone)]
pub struct Linear {
    weight: Variable,
    bias: Variable,
    activation: Activation,
}

impl Linear {
    pub fn new(in_dim: usize, out_dim: usize, activation: Activation) -> Result<Self, Error> {
        Self::with_seed(in_dim, out_dim, activation, DEFAULT_SEED)
    }

    pub fn with_seed(
        in_dim: usize,
        out_dim: usize,
        activation: Activation,
        seed: u64,
    ) -> Result<Self, Error> {
        let weight = Variable::new("LinearWeight");
        Fill::from_initializer(xavier_uniform(in_dim, out_dim, &[in_dim, out_dim], seed)?)
            .initialize(&weight)?;
        let bias = zero_bias("LinearBias", out_dim)?;
        debug!(in_dim, out_dim, %activation, weight = %weight.name(), "created linear layer");
        Ok(Self {
            weight,
            bias,
            activation,
        })
    }

    /// Builds a layer around existing parameters, `weight` `[in, out]` and
    /// `bias` `[out]`.
    pub fn from_params(
        weight: Variable,
        bias: Variable,
        activation: Activation,
    ) -> Result<Self, Error> {
        let w_shape = weight.shape()?;
        let b_shape = bias.shape()?;
        if w_shape.len() != 2 || b_shape != [w_shape[1]] {
            return Err(Error::IncompatibleShapes {
                op: "linear".to_string(),
                shape_a: w_shape,
                shape_b: b_shape,
            });
        }
        Ok(Self {
            weight,
            bias,
            activation,
        })
    }

    pub fn weight(&self) -> &Variable {
        &self.weight
    }

    pub fn bias(&self) -> &Variable {
        &self.bias
    }

    pub fn activation(&self) -> Activation {
        self.activation
    }

    pub fn forward(&self, tape: &mut Tape, input: &Variable) -> Result<Variable, Error> {
        let product = ops::matmul(tape, input, &self.weight)?;
        let biased = ops::elementwise_add(tape, &product, &self.bias, 1)?;
        self.activation.apply(tape, &biased)
    }

    /// Forward on the global tape.
    pub fn call(&self, input: &Variable) -> Result<Variable, Error> {
        with_global_tape(|tape| self.forward(tape, input))
    }

    /// Weight then bias.
    pub fn params(&self) -> Vec<Variable> {
        vec![self.weight.clone(), self.bias.clone()]
    }
}

/// 2D convolution layer over NCHW inputs with a square kernel, stride 1 and
/// no padding.
#[derive(Debug, Clone)]
pub struct Convolution2D {
    filter: Variable,
    bias: Variable,
    activation: Activation,
}

impl Convolution2D {
    pub fn new(
        in_channels: usize,
        out_channels: usize,
        kernel_size: usize,
        activation: Activation,
    ) -> Result<Self, Error> {
        Self::with_seed(in_channels, out_channels, kernel_size, activation, DEFAULT_SEED)
    }

    pub fn with_seed(
        in_channels: usize,
        out_channels: usize,
        kernel_size: usize,
        activation: Activation,
        seed: u64,
    ) -> Result<Self, Error> {
        if kernel_size == 0 {
            return Err(Error::attribute("kernel_size", "must be positive"));
        }
        let receptive = kernel_size * kernel_size;
        let filter = Variable::new("ConvolutionWeight");
        Fill::from_initializer(xavier_uniform(
            in_channels * receptive,
            out_channels * receptive,
            &[out_channels, in_channels, kernel_size, kernel_size],
            seed,
        )?)
        .initialize(&filter)?;
        let bias = zero_bias("ConvolutionBias", out_channels)?;
        debug!(
            in_channels,
            out_channels,
            kernel_size,
            %activation,
            "created convolution layer"
        );
        Ok(Self {
            filter,
            bias,
            activation,
        })
    }

    pub fn filter(&self) -> &Variable {
        &self.filter
    }

    pub fn bias(&self) -> &Variable {
        &self.bias
    }

    pub fn activation(&self) -> Activation {
        self.activation
    }

    pub fn forward(&self, tape: &mut Tape, input: &Variable) -> Result<Variable, Error> {
        let conv = ops::conv2d(tape, input, &self.filter, (1, 1), (0, 0))?;
        let biased = ops::elementwise_add(tape, &conv, &self.bias, 1)?;
        self.activation.apply(tape, &biased)
    }

    pub fn call(&self, input: &Variable) -> Result<Variable, Error> {
        with_global_tape(|tape| self.forward(tape, input))
    }

    /// Filter then bias.
    pub fn params(&self) -> Vec<Variable> {
        vec![self.filter.clone(), self.bias.clone()]
    }
}
