// demos/train_conv.rs
//
// One convolution layer followed by a linear classifier, trained on random
// NCHW batches with an explicit tape per iteration.
use rand::{rngs::StdRng, Rng, SeedableRng};
use tapegrad::{ops, Activation, Convolution2D, Error, Linear, Sgd, Tape, Variable};
use tracing_subscriber::EnvFilter;

const BATCH_SIZE: usize = 8;
const CHANNELS: usize = 1;
const SIDE: usize = 8;
const FILTERS: usize = 4;
const KERNEL: usize = 3;
const NUM_CLASSES: usize = 3;
const ITERATIONS: usize = 20;

fn main() -> Result<(), Error> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let conv = Convolution2D::new(CHANNELS, FILTERS, KERNEL, Activation::Relu)?;
    let out_side = SIDE - KERNEL + 1;
    let classifier = Linear::new(FILTERS * out_side * out_side, NUM_CLASSES, Activation::Identity)?;
    let sgd = Sgd::new(0.05);
    let mut rng = StdRng::seed_from_u64(42);

    for iter in 0..ITERATIONS {
        let mut tape = Tape::new();
        let pixels: Vec<f32> = (0..BATCH_SIZE * CHANNELS * SIDE * SIDE)
            .map(|_| rng.random_range(0.0..1.0))
            .collect();
        let labels: Vec<f32> = (0..BATCH_SIZE)
            .map(|_| rng.random_range(0..NUM_CLASSES) as f32)
            .collect();
        let image = Variable::from_vec("image", pixels, &[BATCH_SIZE, CHANNELS, SIDE, SIDE])?;
        let label = Variable::from_vec("label", labels, &[BATCH_SIZE, 1])?;

        let features = conv.forward(&mut tape, &image)?;
        let logits = classifier.forward(&mut tape, &features)?;
        let probs = ops::softmax(&mut tape, &logits)?;
        let per_sample = ops::cross_entropy(&mut tape, &probs, &label)?;
        let loss = ops::mean(&mut tape, &per_sample)?;
        tape.backward(&loss)?;

        sgd.step(conv.params().iter().chain(classifier.params().iter()))?;
        println!("iter {:>3}  loss {:.4}", iter, loss.to_vec()?[0]);
    }
    Ok(())
}
