use crate::error::Error;
use crate::variable::Variable;

use tracing::{debug, trace};

/// Stochastic gradient descent.
///
/// `update` applies `value = value - lr * grad` in place and then clears the
/// gradient, so the next iteration starts from an empty accumulator.
/// Resetting the tape never touches parameter gradients.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Sgd {
    learning_rate: f32,
}

impl Sgd {
    pub fn new(learning_rate: f32) -> Self {
        Self { learning_rate }
    }

    pub fn learning_rate(&self) -> f32 {
        self.learning_rate
    }

    pub fn set_learning_rate(&mut self, learning_rate: f32) {
        self.learning_rate = learning_rate;
    }

    /// Updates one parameter. A parameter with no gradient is left alone.
    pub fn update(&self, param: &Variable) -> Result<(), Error> {
        let mut inner = param.inner.borrow_mut();
        let data = &mut *inner;
        let Some(grad) = data.grad.as_ref() else {
            debug!(param = %data.name, "no gradient, skipping update");
            return Ok(());
        };
        let value = data
            .value
            .as_mut()
            .ok_or_else(|| Error::Uninitialized(data.name.clone()))?;
        value.scaled_sub_assign(self.learning_rate, grad)?;
        data.grad = None;
        trace!(param = %data.name, lr = self.learning_rate, "sgd update");
        Ok(())
    }

    /// Updates every parameter in `params`.
    pub fn step<'a, I>(&self, params: I) -> Result<(), Error>
    where
        I: IntoIterator<Item = &'a Variable>,
    {
        for param in params {
            self.update(param)?;
        }
        Ok(())
    }
}
