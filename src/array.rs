use crate::error::Error;

#[cfg(feature = "serialization")]
use serde::{Deserialize, Serialize};

use ndarray::{ArrayD, IxDyn, ShapeError, Zip};

/// Dense `f32` storage backing every variable value and gradient.
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serialization", derive(Serialize, Deserialize))]
pub struct Array {
    pub(crate) data: ArrayD<f32>,
}

impl Array {
    pub fn new(data: ArrayD<f32>) -> Self {
        Self { data }
    }

    pub fn from_vec(data: Vec<f32>, shape: &[usize]) -> Result<Self, Error> {
        let actual_len = data.len();
        let map_err = |_e: ShapeError| Error::ShapeMismatch {
            expected: shape.to_vec(),
            actual: vec![actual_len],
        };
        let array = ArrayD::from_shape_vec(IxDyn(shape), data).map_err(map_err)?;
        Ok(Self { data: array })
    }

    pub fn zeros(shape: &[usize]) -> Self {
        Self {
            data: ArrayD::zeros(IxDyn(shape)),
        }
    }

    pub fn ones(shape: &[usize]) -> Self {
        Self {
            data: ArrayD::ones(IxDyn(shape)),
        }
    }

    pub fn full(shape: &[usize], value: f32) -> Self {
        Self {
            data: ArrayD::from_elem(IxDyn(shape), value),
        }
    }

    pub fn shape(&self) -> &[usize] {
        self.data.shape()
    }

    pub fn size(&self) -> usize {
        self.data.len()
    }

    /// Returns true if the array contains no elements
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// A scalar is anything holding exactly one element, whatever its rank.
    pub fn is_scalar(&self) -> bool {
        self.data.len() == 1
    }

    pub fn get_data(&self) -> &ArrayD<f32> {
        &self.data
    }

    pub fn to_vec(&self) -> Vec<f32> {
        self.data.iter().copied().collect()
    }

    /// Element-wise in-place addition; both arrays must have the same shape.
    pub fn add_assign(&mut self, other: &Array) -> Result<(), Error> {
        if self.shape() != other.shape() {
            return Err(Error::ShapeMismatch {
                expected: self.shape().to_vec(),
                actual: other.shape().to_vec(),
            });
        }
        Zip::from(&mut self.data)
            .and(&other.data)
            .for_each(|a, &b| *a += b);
        Ok(())
    }

    /// `self -= alpha * other`, the SGD step.
    pub fn scaled_sub_assign(&mut self, alpha: f32, other: &Array) -> Result<(), Error> {
        if self.shape() != other.shape() {
            return Err(Error::ShapeMismatch {
                expected: self.shape().to_vec(),
                actual: other.shape().to_vec(),
            });
        }
        self.data.scaled_add(-alpha, &other.data);
        Ok(())
    }

    pub(crate) fn broadcast_to(&self, shape: &[usize]) -> Result<Array, Error> {
        match self.data.broadcast(IxDyn(shape)) {
            Some(broadcasted_view) => Ok(Array::new(broadcasted_view.to_owned())),
            None => Err(Error::IncompatibleShapes {
                op: "broadcast".to_string(),
                shape_a: self.shape().to_vec(),
                shape_b: shape.to_vec(),
            }),
        }
    }

    /// Returns a copy with a new shape holding the same number of elements.
    pub fn reshaped(&self, shape: &[usize]) -> Result<Array, Error> {
        let new_size = shape.iter().product::<usize>();
        if self.size() != new_size {
            return Err(Error::ShapeMismatch {
                expected: shape.to_vec(),
                actual: self.shape().to_vec(),
            });
        }
        let data: Vec<f32> = self.data.iter().copied().collect();
        let reshaped = ArrayD::from_shape_vec(IxDyn(shape), data)
            .map_err(|e| Error::ShapeError(e.to_string()))?;
        Ok(Array::new(reshaped))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_vec_shape_mismatch() {
        let result = Array::from_vec(vec![1.0, 2.0, 3.0], &[2, 2]);
        assert!(matches!(result, Err(Error::ShapeMismatch { .. })));
    }

    #[test]
    fn test_add_assign_accumulates() -> Result<(), Error> {
        let mut a = Array::from_vec(vec![1.0, 2.0], &[2])?;
        let b = Array::from_vec(vec![0.5, -1.0], &[2])?;
        a.add_assign(&b)?;
        a.add_assign(&b)?;
        assert_eq!(a.to_vec(), vec![2.0, 0.0]);
        Ok(())
    }

    #[test]
    fn test_add_assign_rejects_other_shape() {
        let mut a = Array::zeros(&[2, 2]);
        let b = Array::zeros(&[4]);
        assert!(a.add_assign(&b).is_err());
    }

    #[test]
    fn test_scaled_sub_assign() -> Result<(), Error> {
        let mut a = Array::from_vec(vec![1.0, 1.0], &[2])?;
        let g = Array::from_vec(vec![10.0, -10.0], &[2])?;
        a.scaled_sub_assign(0.1, &g)?;
        assert_eq!(a.to_vec(), vec![0.0, 2.0]);
        Ok(())
    }

    #[test]
    fn test_is_scalar_ignores_rank() {
        assert!(Array::zeros(&[1, 1]).is_scalar());
        assert!(Array::zeros(&[1]).is_scalar());
        assert!(!Array::zeros(&[2, 1]).is_scalar());
    }

    #[test]
    fn test_reshaped_keeps_order() -> Result<(), Error> {
        let a = Array::from_vec(vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0], &[2, 1, 3])?;
        let b = a.reshaped(&[2, 3])?;
        assert_eq!(b.shape(), &[2, 3]);
        assert_eq!(b.to_vec(), a.to_vec());
        assert!(a.reshaped(&[4]).is_err());
        Ok(())
    }
}
