//! Named initializers configured through an attribute map.
//!
//! Recognized initializers and keys:
//! - `uniform_random`: `min`, `max` (floats), `seed` (int, `0` means
//!   non-deterministic), `shape` (ints), `dtype`
//! - `fill_constant`: `value` (float), `shape` (ints), `dtype`
//!
//! Unknown keys are rejected. Only [`DType::Fp32`] storage exists, so any
//! other `dtype` is rejected as well.

use crate::array::Array;
use crate::error::Error;
use crate::graph::OpKind;
use crate::tape::{with_global_tape, Tape};
use crate::variable::Variable;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, Uniform};
use std::collections::HashMap;
use std::fmt;

#[cfg(feature = "serialization")]
use serde::{Deserialize, Serialize};

/// Numeric element type tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serialization", derive(Serialize, Deserialize))]
pub enum DType {
    Fp16,
    Fp32,
    Fp64,
    Int32,
    Int64,
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            DType::Fp16 => "FP16",
            DType::Fp32 => "FP32",
            DType::Fp64 => "FP64",
            DType::Int32 => "INT32",
            DType::Int64 => "INT64",
        };
        write!(f, "{}", name)
    }
}

#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serialization", derive(Serialize, Deserialize))]
pub enum Attribute {
    Float(f32),
    Int(i64),
    Ints(Vec<usize>),
    DType(DType),
    Str(String),
}

impl From<f32> for Attribute {
    fn from(v: f32) -> Self {
        Attribute::Float(v)
    }
}

impl From<i64> for Attribute {
    fn from(v: i64) -> Self {
        Attribute::Int(v)
    }
}

impl From<i32> for Attribute {
    fn from(v: i32) -> Self {
        Attribute::Int(v as i64)
    }
}

impl From<Vec<usize>> for Attribute {
    fn from(v: Vec<usize>) -> Self {
        Attribute::Ints(v)
    }
}

impl From<DType> for Attribute {
    fn from(v: DType) -> Self {
        Attribute::DType(v)
    }
}

impl From<&str> for Attribute {
    fn from(v: &str) -> Self {
        Attribute::Str(v.to_string())
    }
}

pub type AttributeMap = HashMap<String, Attribute>;

fn float_attr(key: &str, attr: &Attribute) -> Result<f32, Error> {
    match attr {
        Attribute::Float(v) => Ok(*v),
        Attribute::Int(v) => Ok(*v as f32),
        other => Err(Error::attribute(key, format!("expected a float, got {:?}", other))),
    }
}

fn seed_attr(key: &str, attr: &Attribute) -> Result<u64, Error> {
    match attr {
        Attribute::Int(v) if *v >= 0 => Ok(*v as u64),
        Attribute::Int(v) => Err(Error::attribute(key, format!("seed must be non-negative, got {}", v))),
        other => Err(Error::attribute(key, format!("expected an integer, got {:?}", other))),
    }
}

/// Element count of `shape`; it must fit in `isize` for ndarray to allocate.
fn checked_len(key: &str, shape: &[usize]) -> Result<usize, Error> {
    shape
        .iter()
        .try_fold(1usize, |acc, &dim| acc.checked_mul(dim))
        .filter(|&len| len <= isize::MAX as usize)
        .ok_or_else(|| Error::attribute(key, format!("shape {:?} has too many elements", shape)))
}

fn shape_attr(key: &str, attr: &Attribute) -> Result<Vec<usize>, Error> {
    match attr {
        Attribute::Ints(v) if !v.is_empty() => {
            checked_len(key, v)?;
            Ok(v.clone())
        }
        Attribute::Ints(_) => Err(Error::attribute(key, "shape must not be empty")),
        other => Err(Error::attribute(key, format!("expected a list of ints, got {:?}", other))),
    }
}

fn dtype_attr(key: &str, attr: &Attribute) -> Result<DType, Error> {
    match attr {
        Attribute::DType(DType::Fp32) => Ok(DType::Fp32),
        Attribute::DType(other) => Err(Error::attribute(
            key,
            format!("only FP32 storage is supported, got {}", other),
        )),
        other => Err(Error::attribute(key, format!("expected a dtype, got {:?}", other))),
    }
}

/// A fully validated initializer.
#[derive(Debug, Clone, PartialEq)]
pub enum Initializer {
    UniformRandom {
        min: f32,
        max: f32,
        seed: u64,
        shape: Vec<usize>,
    },
    FillConstant {
        value: f32,
        shape: Vec<usize>,
    },
}

impl Initializer {
    /// Parses `name` and `attrs` into an initializer.
    pub fn from_attrs(name: &str, attrs: &AttributeMap) -> Result<Self, Error> {
        match name {
            "uniform_random" => {
                let mut min = -1.0;
                let mut max = 1.0;
                let mut seed = 0;
                let mut shape = None;
                for (key, attr) in attrs {
                    match key.as_str() {
                        "min" => min = float_attr(key, attr)?,
                        "max" => max = float_attr(key, attr)?,
                        "seed" => seed = seed_attr(key, attr)?,
                        "shape" => shape = Some(shape_attr(key, attr)?),
                        "dtype" => {
                            dtype_attr(key, attr)?;
                        }
                        _ => return Err(Error::attribute(key, "unknown key for uniform_random")),
                    }
                }
                if min >= max {
                    return Err(Error::attribute(
                        "max",
                        format!("max ({}) must be greater than min ({})", max, min),
                    ));
                }
                let shape = shape.ok_or_else(|| Error::attribute("shape", "missing"))?;
                Ok(Initializer::UniformRandom {
                    min,
                    max,
                    seed,
                    shape,
                })
            }
            "fill_constant" => {
                let mut value = 0.0;
                let mut shape = None;
                for (key, attr) in attrs {
                    match key.as_str() {
                        "value" => value = float_attr(key, attr)?,
                        "shape" => shape = Some(shape_attr(key, attr)?),
                        "dtype" => {
                            dtype_attr(key, attr)?;
                        }
                        _ => return Err(Error::attribute(key, "unknown key for fill_constant")),
                    }
                }
                let shape = shape.ok_or_else(|| Error::attribute("shape", "missing"))?;
                Ok(Initializer::FillConstant { value, shape })
            }
            other => Err(Error::attribute(
                "initializer",
                format!("unknown initializer '{}'", other),
            )),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Initializer::UniformRandom { .. } => "uniform_random",
            Initializer::FillConstant { .. } => "fill_constant",
        }
    }

    pub fn shape(&self) -> &[usize] {
        match self {
            Initializer::UniformRandom { shape, .. } => shape,
            Initializer::FillConstant { shape, .. } => shape,
        }
    }

    /// Produces a freshly initialized array.
    pub fn generate(&self) -> Result<Array, Error> {
        checked_len("shape", self.shape())?;
        match self {
            Initializer::UniformRandom {
                min,
                max,
                seed,
                shape,
            } => {
                if *seed == 0 {
                    uniform_random(&mut rand::rng(), shape, *min, *max)
                } else {
                    uniform_random(&mut StdRng::seed_from_u64(*seed), shape, *min, *max)
                }
            }
            Initializer::FillConstant { value, shape } => Ok(Array::full(shape, *value)),
        }
    }
}

fn uniform_random<R: Rng + ?Sized>(
    rng: &mut R,
    shape: &[usize],
    low: f32,
    high: f32,
) -> Result<Array, Error> {
    if shape.iter().any(|&dim| dim == 0) {
        return Ok(Array::zeros(shape));
    }
    let dist = Uniform::new(low, high).map_err(|e| Error::attribute("min", e.to_string()))?;
    let size = checked_len("shape", shape)?;

    let mut data = Vec::with_capacity(size);
    for _ in 0..size {
        data.push(dist.sample(&mut *rng));
    }
    Array::from_vec(data, shape)
}

/// Glorot/Xavier uniform bounds: `±sqrt(6 / (fan_in + fan_out))`.
pub fn xavier_uniform(
    fan_in: usize,
    fan_out: usize,
    shape: &[usize],
    seed: u64,
) -> Result<Initializer, Error> {
    if fan_in + fan_out == 0 {
        return Err(Error::InvalidOperation(
            "Fan-in plus fan-out cannot be zero for Xavier initialization".to_string(),
        ));
    }
    let limit = (6.0 / (fan_in + fan_out) as f32).sqrt();
    let mut attrs = AttributeMap::new();
    attrs.insert("min".to_string(), (-limit).into());
    attrs.insert("max".to_string(), limit.into());
    attrs.insert("seed".to_string(), (seed as i64).into());
    attrs.insert("shape".to_string(), shape.to_vec().into());
    attrs.insert("dtype".to_string(), DType::Fp32.into());
    Initializer::from_attrs("uniform_random", &attrs)
}

/// Applies a named initializer to variables.
///
/// # Example
/// ```rust
/// use tapegrad::{reset_global_tape, AttributeMap, DType, Fill, Variable};
///
/// reset_global_tape();
/// let mut attrs = AttributeMap::new();
/// attrs.insert("min".to_string(), (-1.0f32).into());
/// attrs.insert("max".to_string(), 1.0f32.into());
/// attrs.insert("dtype".to_string(), DType::Fp32.into());
/// attrs.insert("seed".to_string(), 123.into());
/// attrs.insert("shape".to_string(), vec![3, 3].into());
/// let filler = Fill::new("uniform_random", &attrs).unwrap();
///
/// let input = Variable::new("input");
/// filler.call(&input).unwrap();
/// assert_eq!(input.shape().unwrap(), vec![3, 3]);
/// ```
#[derive(Debug, Clone)]
pub struct Fill {
    initializer: Initializer,
}

impl Fill {
    pub fn new(name: &str, attrs: &AttributeMap) -> Result<Self, Error> {
        Ok(Self {
            initializer: Initializer::from_attrs(name, attrs)?,
        })
    }

    pub fn from_initializer(initializer: Initializer) -> Self {
        Self { initializer }
    }

    pub fn initializer(&self) -> &Initializer {
        &self.initializer
    }

    /// Writes a fresh value into `var` without recording anything.
    pub fn initialize(&self, var: &Variable) -> Result<(), Error> {
        var.set_value(self.initializer.generate()?);
        Ok(())
    }

    /// Writes a fresh value into `var` and records the fill on `tape`.
    pub fn apply(&self, tape: &mut Tape, var: &Variable) -> Result<(), Error> {
        self.initialize(var)?;
        tape.record(
            OpKind::Fill(self.initializer.clone()),
            Vec::new(),
            vec![var.clone()],
        )
    }

    /// [`Fill::apply`] on the global tape.
    pub fn call(&self, var: &Variable) -> Result<(), Error> {
        with_global_tape(|tape| self.apply(tape, var))
    }
}
