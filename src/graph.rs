use crate::init::Initializer;
use crate::variable::Variable;

use std::fmt;

/// Every primitive the tape knows how to record, with the attributes its
/// backward rule needs.
#[derive(Debug, Clone, PartialEq)]
pub enum OpKind {
    /// Initializer writing a parameter or input; a source op.
    Fill(Initializer),
    /// Batch read from a record stream; a source op.
    Read { fields: usize },
    /// `X · W` with `X` flattened to `[X.shape[0], rest]`.
    MatMul,
    /// `X + Y` with `Y` broadcast onto `X` starting at `axis`.
    ElementwiseAdd { axis: usize },
    Relu,
    Sigmoid,
    Tanh,
    Softmax,
    CrossEntropy { soft_label: bool },
    Mean,
    Conv2d {
        stride: (usize, usize),
        padding: (usize, usize),
    },
}

impl fmt::Display for OpKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            OpKind::Fill(init) => write!(f, "Fill({})", init.name()),
            OpKind::Read { fields } => write!(f, "Read(fields={})", fields),
            OpKind::MatMul => write!(f, "MatMul"),
            OpKind::ElementwiseAdd { axis } => write!(f, "ElementwiseAdd(axis={})", axis),
            OpKind::Relu => write!(f, "ReLU"),
            OpKind::Sigmoid => write!(f, "Sigmoid"),
            OpKind::Tanh => write!(f, "Tanh"),
            OpKind::Softmax => write!(f, "Softmax"),
            OpKind::CrossEntropy { soft_label } => {
                write!(f, "CrossEntropy(soft_label={})", soft_label)
            }
            OpKind::Mean => write!(f, "Mean"),
            OpKind::Conv2d { stride, padding } => {
                write!(f, "Conv2d(stride={:?}, padding={:?})", stride, padding)
            }
        }
    }
}

impl OpKind {
    /// Source ops take no inputs and have no backward rule.
    pub fn is_source(&self) -> bool {
        matches!(self, OpKind::Fill(_) | OpKind::Read { .. })
    }
}

/// One recorded forward computation.
#[derive(Clone)]
pub struct Op {
    pub kind: OpKind,
    pub inputs: Vec<Variable>,
    pub outputs: Vec<Variable>,
}

impl Op {
    pub fn new(kind: OpKind, inputs: Vec<Variable>, outputs: Vec<Variable>) -> Self {
        Self {
            kind,
            inputs,
            outputs,
        }
    }

    pub(crate) fn input(&self, idx: usize) -> Result<&Variable, crate::Error> {
        self.inputs.get(idx).ok_or_else(|| {
            crate::Error::InternalLogicError(format!(
                "{} expects at least {} inputs, got {}",
                self.kind,
                idx + 1,
                self.inputs.len()
            ))
        })
    }

    pub(crate) fn output(&self, idx: usize) -> Result<&Variable, crate::Error> {
        self.outputs.get(idx).ok_or_else(|| {
            crate::Error::InternalLogicError(format!(
                "{} expects at least {} outputs, got {}",
                self.kind,
                idx + 1,
                self.outputs.len()
            ))
        })
    }
}

impl fmt::Debug for Op {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Op")
            .field("kind", &self.kind)
            .field(
                "inputs",
                &self.inputs.iter().map(|v| v.name()).collect::<Vec<_>>(),
            )
            .field(
                "outputs",
                &self.outputs.iter().map(|v| v.name()).collect::<Vec<_>>(),
            )
            .finish()
    }
}
