use crate::array::Array;
use crate::error::Error;
use ndarray::{s, Array2, Array3, Array4, ArrayD, ArrayView2, Axis, Ix2};

fn as_2d<'a>(a: &'a Array, name: &str) -> Result<ArrayView2<'a, f32>, Error> {
    a.get_data()
        .view()
        .into_dimensionality::<Ix2>()
        .map_err(|e| Error::ShapeError(format!("Input '{}' is not 2D: {}", name, e)))
}

/// Flattens `a` to `[shape[0], rest]`.
pub fn flatten_to_2d(a: &Array) -> Result<Array, Error> {
    let shape = a.shape();
    if shape.is_empty() {
        return Err(Error::DimensionMismatch(2, 0));
    }
    let rows = shape[0];
    let cols = shape[1..].iter().product::<usize>();
    a.reshaped(&[rows, cols])
}

/// Matrix multiplication of two 2D arrays.
pub fn matmul(a: &Array, b: &Array) -> Result<Array, Error> {
    let a_2d = as_2d(a, "a")?;
    let b_2d = as_2d(b, "b")?;

    // (m, k) x (k, n)
    if a_2d.shape()[1] != b_2d.shape()[0] {
        return Err(Error::IncompatibleShapes {
            op: "matmul".to_string(),
            shape_a: a_2d.shape().to_vec(),
            shape_b: b_2d.shape().to_vec(),
        });
    }
    Ok(Array::new(a_2d.dot(&b_2d).into_dyn()))
}

/// Transpose of a 2D array.
pub fn transpose(a: &Array) -> Result<Array, Error> {
    let a_2d = as_2d(a, "a")?;
    Ok(Array::new(a_2d.t().to_owned().into_dyn()))
}

/// Shape `y` takes when aligned to `x` starting at `axis`: ones outside the
/// aligned window.
fn aligned_shape(x_shape: &[usize], y_shape: &[usize], axis: usize) -> Result<Vec<usize>, Error> {
    if axis + y_shape.len() > x_shape.len() || x_shape[axis..axis + y_shape.len()] != *y_shape {
        return Err(Error::IncompatibleShapes {
            op: format!("elementwise_add(axis={})", axis),
            shape_a: x_shape.to_vec(),
            shape_b: y_shape.to_vec(),
        });
    }
    let mut shape = vec![1; x_shape.len()];
    shape[axis..axis + y_shape.len()].copy_from_slice(y_shape);
    Ok(shape)
}

/// `x + y` with `y`'s dims matched against `x`'s dims starting at `axis`.
pub fn add_axis(x: &Array, y: &Array, axis: usize) -> Result<Array, Error> {
    let shape = aligned_shape(x.shape(), y.shape(), axis)?;
    let y_aligned = y.reshaped(&shape)?;
    let y_broadcast = y_aligned.broadcast_to(x.shape())?;
    Ok(Array::new(x.get_data() + y_broadcast.get_data()))
}

/// Sums `grad` (shaped like `x`) back down to `y_shape` aligned at `axis`.
pub fn reduce_to_axis(grad: &Array, y_shape: &[usize], axis: usize) -> Result<Array, Error> {
    let aligned = aligned_shape(grad.shape(), y_shape, axis)?;
    let mut reduced = grad.get_data().clone();
    for (dim, &size) in aligned.iter().enumerate().rev() {
        if size == 1 && grad.shape()[dim] != 1 {
            reduced = reduced.sum_axis(Axis(dim)).insert_axis(Axis(dim));
        }
    }
    Array::new(reduced).reshaped(y_shape)
}

/// ReLU activation function
pub fn relu(a: &Array) -> Array {
    Array::new(a.get_data().mapv(|x| x.max(0.0)))
}

/// Sigmoid activation function
pub fn sigmoid(a: &Array) -> Array {
    Array::new(a.get_data().mapv(|x| 1.0 / (1.0 + (-x).exp())))
}

pub fn tanh(a: &Array) -> Array {
    Array::new(a.get_data().mapv(f32::tanh))
}

/// Softmax over the last axis, shifted by the row max for stability.
pub fn softmax(a: &Array) -> Result<Array, Error> {
    let a_data = a.get_data();
    if a_data.ndim() == 0 {
        return Err(Error::DimensionMismatch(1, 0));
    }
    let axis = Axis(a_data.ndim() - 1);

    let max = a_data.fold_axis(axis, f32::NEG_INFINITY, |acc, &x| acc.max(x));
    let shifted = a_data - &max.insert_axis(axis);
    let exp = shifted.mapv(f32::exp);
    let sum = exp.sum_axis(axis);
    Ok(Array::new(exp / &sum.insert_axis(axis)))
}

fn label_index(label: f32, row: usize, classes: usize) -> Result<usize, Error> {
    if label < 0.0 || label.fract() != 0.0 || label as usize >= classes {
        return Err(Error::InvalidOperation(format!(
            "Invalid label {} at row {}, expected an integer in 0..{}",
            label, row, classes
        )));
    }
    Ok(label as usize)
}

/// Cross-entropy of probabilities `x` `[N, D]` against `label`.
///
/// Hard labels are `[N, 1]` class indices, soft labels are `[N, D]`
/// distributions. The result is `[N, 1]`. No clamping is applied, so a zero
/// probability on the target class yields `inf`.
pub fn cross_entropy(x: &Array, label: &Array, soft_label: bool) -> Result<Array, Error> {
    let x_2d = as_2d(x, "x")?;
    let label_2d = as_2d(label, "label")?;
    let (n, d) = x_2d.dim();
    let expected = if soft_label { vec![n, d] } else { vec![n, 1] };
    if label_2d.shape() != expected.as_slice() {
        return Err(Error::ShapeMismatch {
            expected,
            actual: label_2d.shape().to_vec(),
        });
    }
    let mut out = Array2::<f32>::zeros((n, 1));
    for i in 0..n {
        out[(i, 0)] = if soft_label {
            -(0..d).map(|j| label_2d[(i, j)] * x_2d[(i, j)].ln()).sum::<f32>()
        } else {
            let j = label_index(label_2d[(i, 0)], i, d)?;
            -x_2d[(i, j)].ln()
        };
    }
    Ok(Array::new(out.into_dyn()))
}

/// Gradient of [`cross_entropy`] with respect to `x`.
pub fn cross_entropy_backward(
    x: &Array,
    label: &Array,
    grad_output: &Array,
    soft_label: bool,
) -> Result<Array, Error> {
    let x_2d = as_2d(x, "x")?;
    let label_2d = as_2d(label, "label")?;
    let grad_2d = as_2d(grad_output, "grad_output")?;
    let (n, d) = x_2d.dim();
    let mut grad_x = Array2::<f32>::zeros((n, d));
    for i in 0..n {
        let g = grad_2d[(i, 0)];
        if soft_label {
            for j in 0..d {
                grad_x[(i, j)] = -g * label_2d[(i, j)] / x_2d[(i, j)];
            }
        } else {
            let j = label_index(label_2d[(i, 0)], i, d)?;
            grad_x[(i, j)] = -g / x_2d[(i, j)];
        }
    }
    Ok(Array::new(grad_x.into_dyn()))
}

/// Global mean, returned with shape `[1]`.
pub fn mean(a: &Array) -> Result<Array, Error> {
    let value = a.get_data().mean().ok_or_else(|| {
        Error::InvalidOperation("Cannot take the mean of an empty array".to_string())
    })?;
    Array::from_vec(vec![value], &[1])
}

fn conv_output_size(
    input: usize,
    kernel: usize,
    stride: usize,
    padding: usize,
) -> Result<usize, Error> {
    if stride == 0 || input + 2 * padding < kernel {
        return Err(Error::InvalidOperation(format!(
            "conv2d: kernel {} does not fit input {} with padding {} and stride {}",
            kernel, input, padding, stride
        )));
    }
    Ok((input + 2 * padding - kernel) / stride + 1)
}

struct ConvGeometry {
    n: usize,
    c_in: usize,
    h_in: usize,
    w_in: usize,
    c_out: usize,
    k_h: usize,
    k_w: usize,
    h_out: usize,
    w_out: usize,
    stride: (usize, usize),
    padding: (usize, usize),
}

impl ConvGeometry {
    fn new(
        input: &Array,
        weights: &Array,
        stride: (usize, usize),
        padding: (usize, usize),
    ) -> Result<Self, Error> {
        let input_shape = input.shape(); // [N, C_in, H_in, W_in]
        let weight_shape = weights.shape(); // [C_out, C_in, K_h, K_w]
        if input_shape.len() != 4 || weight_shape.len() != 4 {
            return Err(Error::InvalidOperation(
                "conv2d expects 4D input and weights".to_string(),
            ));
        }
        if input_shape[1] != weight_shape[1] {
            return Err(Error::IncompatibleShapes {
                op: "conv2d".to_string(),
                shape_a: input_shape.to_vec(),
                shape_b: weight_shape.to_vec(),
            });
        }
        let (k_h, k_w) = (weight_shape[2], weight_shape[3]);
        Ok(Self {
            n: input_shape[0],
            c_in: input_shape[1],
            h_in: input_shape[2],
            w_in: input_shape[3],
            c_out: weight_shape[0],
            k_h,
            k_w,
            h_out: conv_output_size(input_shape[2], k_h, stride.0, padding.0)?,
            w_out: conv_output_size(input_shape[3], k_w, stride.1, padding.1)?,
            stride,
            padding,
        })
    }

    fn patch_len(&self) -> usize {
        self.c_in * self.k_h * self.k_w
    }

    /// Input coordinate read by output `(y, x)` at kernel offset `(ky, kx)`,
    /// or `None` when it falls into the zero padding.
    fn source(&self, y: usize, x: usize, ky: usize, kx: usize) -> Option<(usize, usize)> {
        let in_y = (y * self.stride.0 + ky) as isize - self.padding.0 as isize;
        let in_x = (x * self.stride.1 + kx) as isize - self.padding.1 as isize;
        if in_y >= 0 && (in_y as usize) < self.h_in && in_x >= 0 && (in_x as usize) < self.w_in {
            Some((in_y as usize, in_x as usize))
        } else {
            None
        }
    }

    /// im2col: `[N, C_in * K_h * K_w, H_out * W_out]`.
    fn im2col(&self, input: &ArrayD<f32>) -> Array3<f32> {
        let mut cols = Array3::<f32>::zeros((self.n, self.patch_len(), self.h_out * self.w_out));
        for b in 0..self.n {
            for y in 0..self.h_out {
                for x in 0..self.w_out {
                    let col_idx = y * self.w_out + x;
                    let mut row = 0;
                    for c in 0..self.c_in {
                        for ky in 0..self.k_h {
                            for kx in 0..self.k_w {
                                if let Some((in_y, in_x)) = self.source(y, x, ky, kx) {
                                    cols[(b, row, col_idx)] = input[[b, c, in_y, in_x]];
                                }
                                row += 1;
                            }
                        }
                    }
                }
            }
        }
        cols
    }

    fn weights_2d(&self, weights: &Array) -> Result<Array2<f32>, Error> {
        Array2::from_shape_vec((self.c_out, self.patch_len()), weights.to_vec())
            .map_err(|e| Error::ShapeError(e.to_string()))
    }
}

/// 2D convolution (NCHW, im2col+matmul implementation), without bias.
pub fn conv2d(
    input: &Array,
    weights: &Array,
    stride: (usize, usize),
    padding: (usize, usize),
) -> Result<Array, Error> {
    let geo = ConvGeometry::new(input, weights, stride, padding)?;
    let cols = geo.im2col(input.get_data());
    let weights_2d = geo.weights_2d(weights)?;

    let mut out = Array4::<f32>::zeros((geo.n, geo.c_out, geo.h_out, geo.w_out));
    for b in 0..geo.n {
        let result = weights_2d.dot(&cols.slice(s![b, .., ..]));
        for co in 0..geo.c_out {
            for idx in 0..(geo.h_out * geo.w_out) {
                out[(b, co, idx / geo.w_out, idx % geo.w_out)] = result[(co, idx)];
            }
        }
    }
    Ok(Array::new(out.into_dyn()))
}

/// Backward for conv2d: returns `(grad_input, grad_weights)`.
pub fn conv2d_backward(
    input: &Array,
    weights: &Array,
    grad_output: &Array,
    stride: (usize, usize),
    padding: (usize, usize),
) -> Result<(Array, Array), Error> {
    let geo = ConvGeometry::new(input, weights, stride, padding)?;
    let expected = [geo.n, geo.c_out, geo.h_out, geo.w_out];
    if grad_output.shape() != &expected[..] {
        return Err(Error::ShapeMismatch {
            expected: expected.to_vec(),
            actual: grad_output.shape().to_vec(),
        });
    }
    let cols = geo.im2col(input.get_data());
    let weights_2d = geo.weights_2d(weights)?;
    let grad_out_3d = Array3::from_shape_vec(
        (geo.n, geo.c_out, geo.h_out * geo.w_out),
        grad_output.to_vec(),
    )
    .map_err(|e| Error::ShapeError(e.to_string()))?;

    // dW: [C_out, C_in * K_h * K_w]
    let mut grad_w = Array2::<f32>::zeros((geo.c_out, geo.patch_len()));
    // dInput via col2im
    let mut grad_input = Array4::<f32>::zeros((geo.n, geo.c_in, geo.h_in, geo.w_in));
    for b in 0..geo.n {
        let grad_out = grad_out_3d.slice(s![b, .., ..]);
        grad_w = grad_w + grad_out.dot(&cols.slice(s![b, .., ..]).t());

        let grad_cols = weights_2d.t().dot(&grad_out);
        for y in 0..geo.h_out {
            for x in 0..geo.w_out {
                let col_idx = y * geo.w_out + x;
                let mut row = 0;
                for c in 0..geo.c_in {
                    for ky in 0..geo.k_h {
                        for kx in 0..geo.k_w {
                            if let Some((in_y, in_x)) = geo.source(y, x, ky, kx) {
                                grad_input[(b, c, in_y, in_x)] += grad_cols[(row, col_idx)];
                            }
                            row += 1;
                        }
                    }
                }
            }
        }
    }
    let grad_w = Array::new(grad_w.into_dyn()).reshaped(weights.shape())?;
    Ok((Array::new(grad_input.into_dyn()), grad_w))
}
