//! Several producers feeding one queue
//!
//! Run with: cargo run --example fan_in

use std::sync::Arc;
use std::time::Duration;

use asyncpipe::prelude::*;
use tracing::info;
use tracing_subscriber::EnvFilter;

fn sensor(name: &'static str, readings: u32, every: Duration) -> impl Producer<Item = String> {
    let mut taken = 0;
    producer_from_fn(move || {
        taken += 1;
        let reading = (taken <= readings).then(|| format!("{name}: reading {taken}"));
        async move {
            tokio::time::sleep(every).await;
            Ok(reading)
        }
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let executor = TaskExecutor::default();
    let queue = Arc::new(AsyncQueue::with_config(QueueConfig::default().capacity(8)));

    let mut pipeline = Pipeline::new();
    for (name, readings, millis) in [("north", 5, 10), ("south", 3, 25), ("east", 4, 15)] {
        let stage = ProducerStage::with_output(
            sensor(name, readings, Duration::from_millis(millis)),
            Arc::clone(&queue),
        );
        pipeline.add(stage.spawn_named(name, &executor));
    }
    // closes once every sensor is done
    queue.close_automatically();

    let collector = CollectConsumer::new();
    let readings = collector.items();
    pipeline.add(ConsumerStage::new(collector, Arc::clone(&queue)).spawn_named("collector", &executor));

    pipeline.join().await?;

    info!(queue = %queue, stats = ?queue.stats(), "Queue drained");
    for reading in readings.lock().await.iter() {
        println!("{}", reading);
    }
    Ok(())
}
