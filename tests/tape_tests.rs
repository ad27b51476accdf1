use approx::assert_abs_diff_eq;
use tapegrad::{
    function, get_global_tape, no_grad, ops, reset_global_tape, Activation, Array, Error, Linear,
    OpKind, Tape, Variable,
};

fn grad_vec(var: &Variable) -> Vec<f32> {
    var.grad().map(|g| g.to_vec()).unwrap_or_default()
}

#[test]
fn test_linear_mean_closed_form() -> Result<(), Error> {
    // y = x·W + b, loss = mean(y): dW[i, j] = x[i] / out, db[j] = 1 / out
    let weight = Variable::from_vec("w", vec![0.1, 0.2, 0.3, 0.4, 0.5, 0.6], &[3, 2])?;
    let bias = Variable::from_vec("b", vec![1.0, -1.0], &[2])?;
    let layer = Linear::from_params(weight.clone(), bias.clone(), Activation::Identity)?;

    let mut tape = Tape::new();
    let x = Variable::from_vec("x", vec![1.0, 2.0, 3.0], &[1, 3])?;
    let y = layer.forward(&mut tape, &x)?;
    let loss = ops::mean(&mut tape, &y)?;

    // y = [2.2 + 1, 2.8 - 1]
    assert_abs_diff_eq!(loss.to_vec()?[0], 2.5, epsilon = 1e-5);
    tape.backward(&loss)?;

    let grad_w = grad_vec(&weight);
    let expected_w = [0.5, 0.5, 1.0, 1.0, 1.5, 1.5];
    for (got, want) in grad_w.iter().zip(expected_w) {
        assert_abs_diff_eq!(*got, want, epsilon = 1e-6);
    }
    assert_eq!(grad_vec(&bias), vec![0.5, 0.5]);

    // dx[i] = sum_j W[i, j] / out
    let grad_x = grad_vec(&x);
    assert_abs_diff_eq!(grad_x[0], 0.15, epsilon = 1e-6);
    assert_abs_diff_eq!(grad_x[1], 0.35, epsilon = 1e-6);
    assert_abs_diff_eq!(grad_x[2], 0.55, epsilon = 1e-6);
    Ok(())
}

#[test]
fn test_backward_after_reset_fails() -> Result<(), Error> {
    reset_global_tape();
    let layer = Linear::new(2, 2, Activation::Relu)?;
    let x = Variable::from_vec("input", vec![1.0, -1.0], &[1, 2])?;
    let stale_loss = function::mean(&layer.call(&x)?)?;

    reset_global_tape();
    let result = get_global_tape().borrow_mut().backward(&stale_loss);
    assert!(matches!(result, Err(Error::NotRecorded { .. })));
    assert!(layer.weight().grad().is_none());

    // feeding it into the new tape is rejected too
    let result = function::relu(&stale_loss);
    assert!(matches!(result, Err(Error::StaleVariable { .. })));
    assert!(get_global_tape().borrow().is_empty());
    Ok(())
}

#[test]
fn test_backward_on_non_scalar_fails() -> Result<(), Error> {
    let mut tape = Tape::new();
    let x = Variable::from_vec("x", vec![1.0, 2.0, 3.0], &[3])?;
    let y = ops::relu(&mut tape, &x)?;
    let result = tape.backward(&y);
    assert!(matches!(result, Err(Error::NonScalarLoss { shape, .. }) if shape == vec![3]));
    assert!(x.grad().is_none());
    Ok(())
}

#[test]
fn test_backward_on_unrecorded_variable_fails() -> Result<(), Error> {
    let mut tape = Tape::new();
    let x = Variable::from_vec("x", vec![1.0], &[1])?;
    assert!(matches!(
        tape.backward(&x),
        Err(Error::NotRecorded { .. })
    ));
    Ok(())
}

#[test]
fn test_fan_out_gradients_sum() -> Result<(), Error> {
    let mut tape = Tape::new();
    let x = Variable::from_vec("x", vec![1.0, 2.0, 3.0, 4.0], &[4])?;
    let doubled = ops::elementwise_add(&mut tape, &x, &x, 0)?;
    let loss = ops::mean(&mut tape, &doubled)?;
    tape.backward(&loss)?;
    assert_eq!(grad_vec(&x), vec![0.5; 4]);
    Ok(())
}

#[test]
fn test_fan_out_through_two_consumers() -> Result<(), Error> {
    let mut tape = Tape::new();
    let x = Variable::from_vec("x", vec![0.5, -0.5], &[2])?;
    let a = ops::relu(&mut tape, &x)?;
    let b = ops::tanh(&mut tape, &x)?;
    let sum = ops::elementwise_add(&mut tape, &a, &b, 0)?;
    let loss = ops::mean(&mut tape, &sum)?;
    tape.backward(&loss)?;

    let grad = grad_vec(&x);
    let dtanh = |v: f32| 1.0 - v.tanh() * v.tanh();
    assert_abs_diff_eq!(grad[0], 0.5 * (1.0 + dtanh(0.5)), epsilon = 1e-6);
    assert_abs_diff_eq!(grad[1], 0.5 * dtanh(-0.5), epsilon = 1e-6);
    Ok(())
}

#[test]
fn test_accumulation_order_does_not_matter() -> Result<(), Error> {
    // consumers of x recorded in the given order, so replay hands x its
    // contributions in the reverse of that order
    let run = |order: [usize; 3]| -> Result<Vec<f32>, Error> {
        let mut tape = Tape::new();
        let x = Variable::from_vec("x", vec![0.3, -1.2, 2.0], &[3])?;
        let mut branches = vec![None, None, None];
        for i in order {
            let branch = match i {
                0 => ops::sigmoid(&mut tape, &x)?,
                1 => ops::tanh(&mut tape, &x)?,
                _ => ops::relu(&mut tape, &x)?,
            };
            branches[i] = Some(branch);
        }
        let branches: Vec<Variable> = branches.into_iter().flatten().collect();
        let partial = ops::elementwise_add(&mut tape, &branches[0], &branches[1], 0)?;
        let sum = ops::elementwise_add(&mut tape, &partial, &branches[2], 0)?;
        let loss = ops::mean(&mut tape, &sum)?;
        tape.backward(&loss)?;
        Ok(grad_vec(&x))
    };
    let forward = run([0, 1, 2])?;
    let reversed = run([2, 1, 0])?;
    let rotated = run([1, 2, 0])?;
    for (a, b) in forward.iter().zip(&reversed) {
        assert_abs_diff_eq!(*a, *b, epsilon = 1e-6);
    }
    for (a, b) in forward.iter().zip(&rotated) {
        assert_abs_diff_eq!(*a, *b, epsilon = 1e-6);
    }

    let sig = |v: f32| 1.0 / (1.0 + (-v).exp());
    let expected: Vec<f32> = [0.3f32, -1.2, 2.0]
        .iter()
        .map(|&v| {
            let relu = if v > 0.0 { 1.0 } else { 0.0 };
            (sig(v) * (1.0 - sig(v)) + 1.0 - v.tanh() * v.tanh() + relu) / 3.0
        })
        .collect();
    for (a, e) in forward.iter().zip(&expected) {
        assert_abs_diff_eq!(*a, *e, epsilon = 1e-5);
    }
    Ok(())
}

#[test]
fn test_rerun_after_reset_is_deterministic() -> Result<(), Error> {
    let first = Linear::with_seed(4, 3, Activation::Relu, 11)?;
    let second = Linear::with_seed(3, 2, Activation::Identity, 12)?;

    let iteration = || -> Result<(Vec<OpKind>, Vec<Vec<f32>>), Error> {
        reset_global_tape();
        let x = Variable::from_vec("input", vec![0.5, -0.25, 1.0, 2.0], &[1, 4])?;
        let label = Variable::from_vec("label", vec![1.0], &[1, 1])?;
        let probs = function::softmax(&second.call(&first.call(&x)?)?)?;
        let loss = function::mean(&function::cross_entropy(&probs, &label)?)?;
        function::backward(&loss)?;

        let kinds = get_global_tape()
            .borrow()
            .ops()
            .iter()
            .map(|op| op.kind.clone())
            .collect();
        let params = first.params().into_iter().chain(second.params());
        let grads = params
            .map(|p| {
                let grad = grad_vec(&p);
                p.clear_grad();
                grad
            })
            .collect();
        Ok((kinds, grads))
    };

    let (kinds_a, grads_a) = iteration()?;
    let (kinds_b, grads_b) = iteration()?;
    assert_eq!(kinds_a, kinds_b);
    assert_eq!(grads_a, grads_b);
    assert_eq!(kinds_a.len(), 8);
    Ok(())
}

#[test]
fn test_no_grad_computes_without_recording() -> Result<(), Error> {
    reset_global_tape();
    let x = Variable::from_vec("x", vec![-1.0, 1.0], &[2])?;
    let y = no_grad(|| function::sigmoid(&x))?;
    assert_abs_diff_eq!(y.to_vec()?[0], 1.0 / (1.0 + 1f32.exp()), epsilon = 1e-6);
    assert!(get_global_tape().borrow().is_empty());

    let z = function::mean(&x)?;
    assert_eq!(get_global_tape().borrow().len(), 1);
    assert_eq!(z.to_vec()?, vec![0.0]);
    Ok(())
}

#[test]
fn test_independent_tapes_coexist() -> Result<(), Error> {
    let mut first = Tape::new();
    let mut second = Tape::new();
    let w = Variable::from_vec("w", vec![1.0, 2.0], &[2])?;

    let loss_a = ops::mean(&mut first, &w)?;
    let scaled = ops::elementwise_add(&mut second, &w, &w, 0)?;
    let loss_b = ops::mean(&mut second, &scaled)?;

    first.backward(&loss_a)?;
    second.backward(&loss_b)?;
    // 0.5 from the first tape plus 1.0 from the second
    assert_eq!(grad_vec(&w), vec![1.5, 1.5]);
    Ok(())
}

#[test]
fn test_non_finite_values_propagate() -> Result<(), Error> {
    let mut tape = Tape::new();
    let probs = Variable::from_array("p", Array::from_vec(vec![0.0, 1.0], &[1, 2])?);
    let label = Variable::from_vec("label", vec![0.0], &[1, 1])?;
    let ce = ops::cross_entropy(&mut tape, &probs, &label)?;
    let loss = ops::mean(&mut tape, &ce)?;
    assert!(loss.to_vec()?[0].is_infinite());
    tape.backward(&loss)?;
    assert!(grad_vec(&probs)[0].is_infinite());
    Ok(())
}
