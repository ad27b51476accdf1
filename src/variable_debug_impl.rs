use crate::variable::{Variable, VariableData};
use std::fmt;

impl fmt::Debug for VariableData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VariableData")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("shape", &self.value.as_ref().map(|v| v.shape().to_vec()))
            .field("grad", &self.grad.as_ref().map(|_| "Some(<array>)"))
            .field("producer", &self.producer)
            .finish()
    }
}

impl fmt::Debug for Variable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.inner.try_borrow() {
            Ok(inner) => write!(f, "Variable({})", inner.name),
            Err(_) => write!(f, "Variable(<borrowed>)"),
        }
    }
}
