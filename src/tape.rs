//! The recording tape and the per-thread global recording context.
//!
//! Every primitive forward op appends one [`Op`] to a [`Tape`]. Because ops
//! are appended as straight-line code executes, insertion order is already a
//! valid topological order, and [`Tape::backward`] only has to walk the log in
//! reverse.

use crate::array::Array;
use crate::error::Error;
use crate::graph::{Op, OpKind};
use crate::ops::cpu_backward;
use crate::variable::Variable;

use std::cell::RefCell;
use std::rc::Rc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::{debug, trace};

static TAPE_ID_COUNTER: AtomicUsize = AtomicUsize::new(0);

fn next_tape_id() -> usize {
    TAPE_ID_COUNTER.fetch_add(1, Ordering::Relaxed)
}

/// Ordered log of recorded forward operations.
#[derive(Debug)]
pub struct Tape {
    id: usize,
    ops: Vec<Op>,
    recording: bool,
    replayed: bool,
}

impl Default for Tape {
    fn default() -> Self {
        Self::new()
    }
}

impl Tape {
    pub fn new() -> Self {
        Self {
            id: next_tape_id(),
            ops: Vec::new(),
            recording: true,
            replayed: false,
        }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn ops(&self) -> &[Op] {
        &self.ops
    }

    pub fn is_recording(&self) -> bool {
        self.recording
    }

    /// While recording is off, ops still compute their outputs but nothing
    /// is appended.
    pub fn set_recording(&mut self, recording: bool) {
        self.recording = recording;
    }

    pub fn is_replayed(&self) -> bool {
        self.replayed
    }

    /// Appends one primitive op.
    pub fn record(
        &mut self,
        kind: OpKind,
        inputs: Vec<Variable>,
        outputs: Vec<Variable>,
    ) -> Result<(), Error> {
        if self.replayed {
            return Err(Error::TapeReplayed(self.id));
        }
        for input in &inputs {
            if let Some(producer) = input.producer() {
                if producer != self.id {
                    return Err(Error::StaleVariable {
                        name: input.name(),
                        producer,
                        tape_id: self.id,
                    });
                }
            }
        }
        if !self.recording {
            return Ok(());
        }
        if !inputs.is_empty() {
            for output in &outputs {
                output.set_producer(self.id);
            }
        }
        trace!(tape = self.id, op = %kind, "recording op");
        self.ops.push(Op::new(kind, inputs, outputs));
        Ok(())
    }

    /// Whether `var` is an output of any op on this tape.
    pub fn contains_output(&self, var: &Variable) -> bool {
        self.ops
            .iter()
            .any(|op| op.outputs.iter().any(|out| out == var))
    }

    /// Replays the tape in reverse, accumulating gradients of `loss` into
    /// every variable it depends on.
    ///
    /// `loss` must hold a single element and must be an output of an op on
    /// this tape. A tape can be replayed once. Gradients are added to whatever
    /// the accumulators already hold; clearing them is the optimizer's job.
    pub fn backward(&mut self, loss: &Variable) -> Result<(), Error> {
        if self.replayed {
            return Err(Error::TapeReplayed(self.id));
        }
        if !self.contains_output(loss) {
            return Err(Error::NotRecorded {
                name: loss.name(),
                tape_id: self.id,
            });
        }
        let loss_shape = loss.shape()?;
        if !loss.value()?.is_scalar() {
            return Err(Error::NonScalarLoss {
                name: loss.name(),
                shape: loss_shape,
            });
        }

        debug!(
            tape = self.id,
            ops = self.ops.len(),
            loss = %loss.name(),
            "replaying tape"
        );
        self.replayed = true;
        loss.set_grad(Some(Array::ones(&loss_shape)));

        for op in self.ops.iter().rev() {
            if op.kind.is_source() {
                continue;
            }
            let grads = op
                .outputs
                .iter()
                .map(|out| out.grad().map(|g| g.clone()))
                .collect::<Vec<_>>();
            if grads.iter().all(Option::is_none) {
                continue;
            }
            let output_grads = op
                .outputs
                .iter()
                .zip(grads)
                .map(|(out, grad)| match grad {
                    Some(grad) => Ok(grad),
                    None => Ok(Array::zeros(&out.shape()?)),
                })
                .collect::<Result<Vec<_>, Error>>()?;

            trace!(tape = self.id, op = %op.kind, "backward");
            let input_grads = cpu_backward::gradients(op, &output_grads)?;
            if input_grads.len() != op.inputs.len() {
                return Err(Error::InternalLogicError(format!(
                    "Backward rule for {} returned {} gradients, expected {}",
                    op.kind,
                    input_grads.len(),
                    op.inputs.len()
                )));
            }
            for (input, grad) in op.inputs.iter().zip(input_grads) {
                if let Some(grad) = grad {
                    input.accumulate_grad(&grad)?;
                }
            }
        }
        Ok(())
    }
}

thread_local! {
    /// The tape global-context functions record onto for this thread.
    static GLOBAL_TAPE: RefCell<Rc<RefCell<Tape>>> = RefCell::new(Rc::new(RefCell::new(Tape::new())));
}

/// Discards the current global tape and installs a fresh, empty one.
///
/// Variables recorded on the old tape stay alive as long as someone holds
/// them; parameter gradients are not touched.
pub fn reset_global_tape() {
    GLOBAL_TAPE.with(|slot| {
        let fresh = Tape::new();
        debug!(tape = fresh.id(), "reset global tape");
        *slot.borrow_mut() = Rc::new(RefCell::new(fresh));
    });
}

/// Returns a handle to the active global tape.
pub fn get_global_tape() -> Rc<RefCell<Tape>> {
    GLOBAL_TAPE.with(|slot| Rc::clone(&slot.borrow()))
}

/// Runs `f` with the active global tape borrowed mutably.
pub fn with_global_tape<F, R>(f: F) -> R
where
    F: FnOnce(&mut Tape) -> R,
{
    let tape = get_global_tape();
    let mut guard = tape.borrow_mut();
    f(&mut guard)
}

/// Runs `f` with recording disabled on the global tape.
///
/// # Example
/// ```rust
/// use tapegrad::{function, get_global_tape, no_grad, reset_global_tape, Variable};
///
/// reset_global_tape();
/// let x = Variable::from_vec("x", vec![1.0, -1.0], &[1, 2]).unwrap();
/// let y = no_grad(|| function::relu(&x)).unwrap();
/// assert_eq!(y.to_vec().unwrap(), vec![1.0, 0.0]);
/// assert!(get_global_tape().borrow().is_empty());
/// ```
pub fn no_grad<F, R>(f: F) -> R
where
    F: FnOnce() -> R,
{
    let _guard = RecordingGuard {
        prev: with_global_tape(|tape| {
            let prev = tape.is_recording();
            tape.set_recording(false);
            prev
        }),
    };
    f()
}

/// Puts the global tape's recording flag back when dropped, unwinding included.
struct RecordingGuard {
    prev: bool,
}

impl Drop for RecordingGuard {
    fn drop(&mut self) {
        let prev = self.prev;
        with_global_tape(|tape| tape.set_recording(prev));
    }
}
