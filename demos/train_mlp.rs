// demos/train_mlp.rs
//
// Trains a 784-200-200-10 MLP on a CSV record stream. Each row holds 784
// pixel values in [0, 1] followed by the class index. Without an argument a
// small synthetic dataset is generated.
use rand::{rngs::StdRng, Rng, SeedableRng};
use std::io::Write;
use std::time::Instant;
use tapegrad::{
    create_reader, function, get_global_tape, reset_global_tape, Activation, Error, Linear, Sgd,
};
use tracing::info;
use tracing_subscriber::EnvFilter;

const BATCH_SIZE: usize = 32;
const NUM_EPOCHS: usize = 2;
const LEARNING_RATE: f32 = 0.01;
const INPUT_SIZE: usize = 784;
const HIDDEN_SIZE: usize = 200;
const NUM_CLASSES: usize = 10;

fn synthetic_dataset(rows: usize) -> Result<tempfile::NamedTempFile, Error> {
    let mut rng = StdRng::seed_from_u64(7);
    let mut file = tempfile::NamedTempFile::new()?;
    for _ in 0..rows {
        let label = rng.random_range(0..NUM_CLASSES);
        let pixels: Vec<String> = (0..INPUT_SIZE)
            .map(|i| {
                // brighten one band of pixels per class so the task is learnable
                let base: f32 = rng.random_range(0.0..0.2);
                if i % NUM_CLASSES == label {
                    format!("{:.3}", base + 0.8)
                } else {
                    format!("{:.3}", base)
                }
            })
            .collect();
        writeln!(file, "{},{}", pixels.join(","), label)?;
    }
    file.flush()?;
    Ok(file)
}

fn main() -> Result<(), Error> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let generated;
    let path = match std::env::args().nth(1) {
        Some(path) => std::path::PathBuf::from(path),
        None => {
            generated = synthetic_dataset(512)?;
            generated.path().to_path_buf()
        }
    };

    let layers = [
        Linear::new(INPUT_SIZE, HIDDEN_SIZE, Activation::Relu)?,
        Linear::new(HIDDEN_SIZE, HIDDEN_SIZE, Activation::Relu)?,
        Linear::new(HIDDEN_SIZE, NUM_CLASSES, Activation::Identity)?,
    ];
    let sgd = Sgd::new(LEARNING_RATE);
    let start = Instant::now();

    for epoch in 0..NUM_EPOCHS {
        let mut reader = create_reader(
            &path,
            &[BATCH_SIZE, INPUT_SIZE, BATCH_SIZE, 1],
            &[2, 2],
            &[0, 0],
        )?;
        let mut epoch_loss = 0.0;
        let mut batches = 0;
        loop {
            reset_global_tape();
            let batch = match function::read_next(&mut reader) {
                Ok(batch) => batch,
                Err(Error::EndOfStream) => break,
                Err(e) => return Err(e),
            };
            let (image, label) = (&batch[0], &batch[1]);

            let mut hidden = image.clone();
            for layer in &layers {
                hidden = layer.call(&hidden)?;
            }
            let probs = function::softmax(&hidden)?;
            let loss = function::mean(&function::cross_entropy(&probs, label)?)?;

            get_global_tape().borrow_mut().backward(&loss)?;
            for layer in &layers {
                sgd.step(&layer.params())?;
            }

            epoch_loss += loss.to_vec()?[0];
            batches += 1;
            if batches % 100 == 0 {
                info!(epoch, batches, loss = epoch_loss / batches as f32, "progress");
            }
        }
        println!(
            "Epoch {} done: {} batches, average loss {:.4}",
            epoch + 1,
            batches,
            epoch_loss / batches.max(1) as f32
        );
    }
    println!("Training finished in {:.2?}", start.elapsed());
    Ok(())
}
