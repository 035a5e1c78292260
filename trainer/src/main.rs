use std::{env, io, path::PathBuf};

use log::info;
use tokio::signal;
use trainer::{TrainErr, TrainingConfig};

#[tokio::main]
async fn main() -> io::Result<()> {
    env_logger::init();

    let path = env::args_os()
        .nth(1)
        .or_else(|| env::var_os("CONFIG"))
        .map(PathBuf::from)
        .ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidInput,
                "usage: trainer <config.json>, or set CONFIG",
            )
        })?;

    let config = TrainingConfig::from_file(&path).map_err(TrainErr::from)?;
    info!("training with {}", path.display());

    tokio::select! {
        summary = trainer::train(&config) => {
            let summary = summary?;
            info!(
                steps = summary.steps,
                batches = summary.batches;
                "training finished in {:.1}s",
                summary.elapsed.as_secs_f64()
            );
        }
        _ = signal::ctrl_c() => {
            info!("received SIGINT, stopping");
        }
    }

    Ok(())
}
