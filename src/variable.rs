use crate::{array::Array, error::Error};
use std::{
    cell::{Ref, RefCell},
    hash::{Hash, Hasher},
    rc::Rc,
    sync::atomic::{AtomicUsize, Ordering},
};

#[cfg(feature = "serialization")]
use serde::{Deserialize, Serialize};
#[cfg(feature = "serialization")]
use std::fs::File;
#[cfg(feature = "serialization")]
use std::io::{BufReader, BufWriter};
#[cfg(feature = "serialization")]
use std::path::Path;

static VARIABLE_ID_COUNTER: AtomicUsize = AtomicUsize::new(0);

fn next_id() -> usize {
    VARIABLE_ID_COUNTER.fetch_add(1, Ordering::Relaxed)
}

#[cfg(feature = "serialization")]
#[derive(Serialize, Deserialize)]
struct SerializableVariable {
    name: String,
    value: Option<Array>,
    grad: Option<Array>,
}

pub struct VariableData {
    pub id: usize,
    pub name: String,
    pub value: Option<Array>,
    pub grad: Option<Array>,
    /// Id of the tape whose differentiable op wrote this variable, if any.
    pub(crate) producer: Option<usize>,
}

/// A named, shared handle to a value and its gradient accumulator.
///
/// Cloning a `Variable` clones the handle, not the storage: the tape, the
/// layers that own parameters, and the caller all see the same value and the
/// same gradient. The gradient starts absent and is treated as zero until a
/// backward pass accumulates into it.
///
/// # Example
/// ```rust
/// use tapegrad::{ops, Tape, Variable};
///
/// fn main() -> Result<(), tapegrad::Error> {
///     let mut tape = Tape::new();
///     let x = Variable::from_vec("x", vec![1.0, 2.0, 3.0], &[3])?;
///     let loss = ops::mean(&mut tape, &x)?;
///     tape.backward(&loss)?;
///
///     let grad = x.grad().expect("x contributes to the loss");
///     assert_eq!(grad.to_vec(), vec![1.0 / 3.0; 3]);
///     Ok(())
/// }
/// ```
pub struct Variable {
    pub(crate) inner: Rc<RefCell<VariableData>>,
}

impl Clone for Variable {
    fn clone(&self) -> Self {
        Self {
            inner: Rc::clone(&self.inner),
        }
    }
}

impl PartialEq for Variable {
    fn eq(&self, other: &Self) -> bool {
        self.id() == other.id()
    }
}

impl Eq for Variable {}

impl Hash for Variable {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id().hash(state);
    }
}

impl Variable {
    /// Creates an empty variable named `prefix` followed by its unique id.
    pub fn new(prefix: &str) -> Self {
        let id = next_id();
        Self {
            inner: Rc::new(RefCell::new(VariableData {
                id,
                name: format!("{}{}", prefix, id),
                value: None,
                grad: None,
                producer: None,
            })),
        }
    }

    pub fn from_array(prefix: &str, value: Array) -> Self {
        let var = Self::new(prefix);
        var.inner.borrow_mut().value = Some(value);
        var
    }

    pub fn from_vec(prefix: &str, data: Vec<f32>, shape: &[usize]) -> Result<Self, Error> {
        Ok(Self::from_array(prefix, Array::from_vec(data, shape)?))
    }

    pub fn id(&self) -> usize {
        self.inner.borrow().id
    }

    pub fn name(&self) -> String {
        self.inner.borrow().name.clone()
    }

    pub fn grad_name(&self) -> String {
        format!("{}@GRAD", self.inner.borrow().name)
    }

    pub fn has_value(&self) -> bool {
        self.inner.borrow().value.is_some()
    }

    /// Borrows the current value.
    ///
    /// Callers must not overwrite the value of a variable that is still an
    /// input to unreplayed tape operations; softmax and cross-entropy read
    /// forward values during backward.
    pub fn value(&self) -> Result<Ref<'_, Array>, Error> {
        Ref::filter_map(self.inner.borrow(), |data| data.value.as_ref())
            .map_err(|inner| Error::Uninitialized(inner.name.clone()))
    }

    pub fn set_value(&self, value: Array) {
        self.inner.borrow_mut().value = Some(value);
    }

    pub fn shape(&self) -> Result<Vec<usize>, Error> {
        Ok(self.value()?.shape().to_vec())
    }

    pub fn to_vec(&self) -> Result<Vec<f32>, Error> {
        Ok(self.value()?.to_vec())
    }

    pub fn grad(&self) -> Option<Ref<'_, Array>> {
        Ref::filter_map(self.inner.borrow(), |data| data.grad.as_ref()).ok()
    }

    /// Returns the gradient, or zeros shaped like the value when none has
    /// been accumulated yet.
    pub fn grad_or_zeros(&self) -> Result<Array, Error> {
        if let Some(grad) = self.grad() {
            return Ok(grad.clone());
        }
        Ok(Array::zeros(&self.shape()?))
    }

    pub fn set_grad(&self, grad: Option<Array>) {
        self.inner.borrow_mut().grad = grad;
    }

    /// Adds `contribution` into the gradient accumulator.
    pub fn accumulate_grad(&self, contribution: &Array) -> Result<(), Error> {
        let mut inner = self.inner.borrow_mut();
        let data = &mut *inner;
        if let Some(value) = data.value.as_ref() {
            if value.shape() != contribution.shape() {
                return Err(Error::ShapeMismatch {
                    expected: value.shape().to_vec(),
                    actual: contribution.shape().to_vec(),
                });
            }
        }
        match data.grad.as_mut() {
            Some(grad) => grad.add_assign(contribution)?,
            None => data.grad = Some(contribution.clone()),
        }
        Ok(())
    }

    pub fn clear_grad(&self) {
        self.inner.borrow_mut().grad = None;
    }

    pub(crate) fn producer(&self) -> Option<usize> {
        self.inner.borrow().producer
    }

    pub(crate) fn set_producer(&self, tape_id: usize) {
        self.inner.borrow_mut().producer = Some(tape_id);
    }
}

#[cfg(feature = "serialization")]
impl Variable {
    /// Saves the name, value and gradient as JSON. The producing tape is not
    /// saved; a loaded variable is always a leaf.
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<(), Error> {
        let file = File::create(path)?;
        let writer = BufWriter::new(file);
        let inner = self.inner.borrow();
        let serializable = SerializableVariable {
            name: inner.name.clone(),
            value: inner.value.clone(),
            grad: inner.grad.clone(),
        };
        serde_json::to_writer(writer, &serializable).map_err(|e| {
            Error::SerializationError(format!("Failed to serialize variable: {}", e))
        })?;
        Ok(())
    }

    /// Loads a variable saved with `save_to_file` under a fresh id. The
    /// stored name is reused as the prefix.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, Error> {
        let file = File::open(path)?;
        let reader = BufReader::new(file);
        let serializable: SerializableVariable = serde_json::from_reader(reader).map_err(|e| {
            Error::DeserializationError(format!("Failed to deserialize variable: {}", e))
        })?;
        let var = Variable::new(&serializable.name);
        {
            let mut inner = var.inner.borrow_mut();
            inner.value = serializable.value;
            inner.grad = serializable.grad;
        }
        Ok(var)
    }
}
