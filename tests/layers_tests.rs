use approx::assert_abs_diff_eq;
use tapegrad::{
    function, get_global_tape, ops, reset_global_tape, test_utils::check_gradient, Activation,
    Array, Convolution2D, Error, Linear, OpKind, Tape, Variable,
};

/// Two layers whose relu pre-activations stay at least 0.1 away from zero
/// for `mlp_input`, so finite differences never straddle the kink.
fn mlp() -> Result<(Linear, Linear), Error> {
    let w1 = Variable::from_vec(
        "w1",
        vec![
            0.1, -0.2, 0.3, 0.05, //
            0.2, 0.1, -0.3, 0.4, //
            -0.1, 0.3, 0.2, 0.1,
        ],
        &[3, 4],
    )?;
    let b1 = Variable::from_vec("b1", vec![0.1, 0.0, -0.1, 0.0], &[4])?;
    let first = Linear::from_params(w1, b1, Activation::Relu)?;
    let second = Linear::with_seed(4, 3, Activation::Identity, 5)?;
    Ok((first, second))
}

fn mlp_input() -> Result<(Variable, Variable), Error> {
    let x = Variable::from_vec("input", vec![1.0, 2.0, 3.0, -1.0, 0.5, 2.0], &[2, 3])?;
    let label = Variable::from_vec("label", vec![2.0, 0.0], &[2, 1])?;
    Ok((x, label))
}

fn mlp_loss(
    tape: &mut Tape,
    first: &Linear,
    second: &Linear,
    x: &Variable,
    label: &Variable,
) -> Result<Variable, Error> {
    let hidden = first.forward(tape, x)?;
    let logits = second.forward(tape, &hidden)?;
    let probs = ops::softmax(tape, &logits)?;
    let per_sample = ops::cross_entropy(tape, &probs, label)?;
    ops::mean(tape, &per_sample)
}

#[test]
fn test_mlp_gradient_matches_finite_differences() -> Result<(), Error> {
    let (first, second) = mlp()?;
    let (x, label) = mlp_input()?;
    let loss_fn = |tape: &mut Tape| mlp_loss(tape, &first, &second, &x, &label);

    check_gradient(loss_fn, first.weight(), 1e-2, 1e-2)?;
    check_gradient(loss_fn, first.bias(), 1e-2, 1e-2)?;
    check_gradient(loss_fn, second.weight(), 1e-2, 1e-2)?;
    check_gradient(loss_fn, second.bias(), 1e-2, 1e-2)?;
    Ok(())
}

#[test]
fn test_single_weight_perturbation() -> Result<(), Error> {
    let (first, second) = mlp()?;
    let (x, label) = mlp_input()?;

    let mut tape = Tape::new();
    let loss = mlp_loss(&mut tape, &first, &second, &x, &label)?;
    tape.backward(&loss)?;
    let base = loss.to_vec()?[0];
    let analytic = first.weight().grad().map(|g| g.to_vec()[5]).unwrap_or(0.0);

    let eps = 1e-2;
    let original = first.weight().value()?.clone();
    let mut data = original.to_vec();
    data[5] += eps;
    first.weight().set_value(Array::from_vec(data, &[3, 4])?);
    let mut probe = Tape::new();
    let perturbed = mlp_loss(&mut probe, &first, &second, &x, &label)?.to_vec()?[0];
    first.weight().set_value(original);

    assert_abs_diff_eq!(perturbed - base, eps * analytic, epsilon = 5.0 * eps * eps);
    Ok(())
}

#[test]
fn test_mlp_on_global_tape_matches_explicit_tape() -> Result<(), Error> {
    let (first, second) = mlp()?;
    let (x, label) = mlp_input()?;

    let mut tape = Tape::new();
    let explicit = mlp_loss(&mut tape, &first, &second, &x, &label)?;
    tape.backward(&explicit)?;
    let explicit_grad = first.weight().grad().map(|g| g.to_vec()).unwrap_or_default();
    first.weight().clear_grad();

    reset_global_tape();
    let hidden = first.call(&x)?;
    let probs = function::softmax(&second.call(&hidden)?)?;
    let global = function::mean(&function::cross_entropy(&probs, &label)?)?;
    function::backward(&global)?;
    let global_grad = first.weight().grad().map(|g| g.to_vec()).unwrap_or_default();

    assert_eq!(explicit.to_vec()?, global.to_vec()?);
    assert_eq!(explicit_grad, global_grad);
    Ok(())
}

#[test]
fn test_linear_flattens_image_input() -> Result<(), Error> {
    let layer = Linear::new(4, 2, Activation::Tanh)?;
    let mut tape = Tape::new();
    let image = Variable::from_array("image", Array::ones(&[3, 1, 2, 2]));
    let y = layer.forward(&mut tape, &image)?;
    assert_eq!(y.shape()?, vec![3, 2]);

    let loss = ops::mean(&mut tape, &y)?;
    tape.backward(&loss)?;
    assert_eq!(
        image.grad().map(|g| g.shape().to_vec()),
        Some(vec![3, 1, 2, 2])
    );
    Ok(())
}

#[test]
fn test_linear_rejects_wrong_input_width() -> Result<(), Error> {
    let layer = Linear::new(3, 2, Activation::Identity)?;
    let mut tape = Tape::new();
    let x = Variable::from_array("x", Array::ones(&[1, 4]));
    assert!(matches!(
        layer.forward(&mut tape, &x),
        Err(Error::IncompatibleShapes { .. })
    ));
    Ok(())
}

#[test]
fn test_convolution_records_conv_add_activation() -> Result<(), Error> {
    reset_global_tape();
    let layer = Convolution2D::new(2, 3, 2, Activation::Sigmoid)?;
    let x = Variable::from_array("image", Array::ones(&[1, 2, 4, 4]));
    let y = layer.call(&x)?;
    assert_eq!(y.shape()?, vec![1, 3, 3, 3]);

    let kinds: Vec<OpKind> = get_global_tape()
        .borrow()
        .ops()
        .iter()
        .map(|op| op.kind.clone())
        .collect();
    assert_eq!(
        kinds,
        vec![
            OpKind::Conv2d {
                stride: (1, 1),
                padding: (0, 0)
            },
            OpKind::ElementwiseAdd { axis: 1 },
            OpKind::Sigmoid,
        ]
    );
    Ok(())
}

#[test]
fn test_convolution_gradients_match_finite_differences() -> Result<(), Error> {
    let layer = Convolution2D::with_seed(2, 2, 2, Activation::Tanh, 3)?;
    let pixels: Vec<f32> = (0..2 * 2 * 3 * 3).map(|i| (i as f32 * 0.37).sin()).collect();
    let x = Variable::from_vec("image", pixels, &[2, 2, 3, 3])?;
    let loss_fn = |tape: &mut Tape| -> Result<Variable, Error> {
        let y = layer.forward(tape, &x)?;
        ops::mean(tape, &y)
    };

    check_gradient(loss_fn, layer.filter(), 1e-2, 1e-2)?;
    check_gradient(loss_fn, layer.bias(), 1e-2, 1e-2)?;
    check_gradient(loss_fn, &x, 1e-2, 1e-2)?;
    Ok(())
}

#[test]
fn test_convolution_bias_gradient_closed_form() -> Result<(), Error> {
    let layer = Convolution2D::new(1, 2, 3, Activation::Identity)?;
    let mut tape = Tape::new();
    let x = Variable::from_array("image", Array::ones(&[2, 1, 5, 5]));
    let y = layer.forward(&mut tape, &x)?;
    let loss = ops::mean(&mut tape, &y)?;
    tape.backward(&loss)?;
    // every output position contributes 1 / numel(y) = 1 / 36
    let grad = layer.bias().grad().map(|g| g.to_vec()).unwrap_or_default();
    assert_abs_diff_eq!(grad[0], 0.5, epsilon = 1e-5);
    assert_abs_diff_eq!(grad[1], 0.5, epsilon = 1e-5);
    Ok(())
}
