//! Basic usage examples for asyncpipe
//!
//! Run with: cargo run --example basic
//! Set RUST_LOG=asyncpipe=debug to see queue and task events.

use std::sync::Arc;
use std::time::Duration;

use asyncpipe::prelude::*;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Example 1: Produce, transform and print
async fn transform_example(executor: &TaskExecutor) -> Result<()> {
    println!("=== Transform ===");

    let numbers = ProducerStage::new(from_iter(1..=10));
    let squares = ProcessorStage::new(MapProcessor::new(|x: i64| x * x), Arc::clone(numbers.output()));
    let evens = ProcessorStage::new(
        FilterProcessor::new(|x: &i64| x % 2 == 0),
        Arc::clone(squares.output()),
    );
    let printer = ConsumerStage::new(PrintConsumer::with_prefix("Square"), Arc::clone(evens.output()));

    let pipeline = Pipeline::new()
        .with(numbers.spawn_named("numbers", executor))
        .with(squares.spawn_named("squares", executor))
        .with(evens.spawn_named("evens", executor))
        .with(printer.spawn_named("printer", executor));
    pipeline.join().await?;

    for report in pipeline.stats() {
        info!(stage = %report.name, items = report.stats.items, "Stage done");
    }
    println!();
    Ok(())
}

/// Example 2: Failing items are reported and skipped
async fn error_example(executor: &TaskExecutor) -> Result<()> {
    println!("=== Error Handling ===");

    let words = ProducerStage::new(from_iter(vec!["1", "2", "three", "4"]));
    let parse = processor_from_fn(|s: &'static str| async move {
        s.parse::<u32>().map(Some).into_processor_error()
    });
    let parsed = ProcessorStage::new(parse, Arc::clone(words.output()));
    let printer = ConsumerStage::new(PrintConsumer::with_prefix("Parsed"), Arc::clone(parsed.output()));

    let parse_handle = parsed.spawn_named("parse", executor);
    let pipeline = Pipeline::new()
        .with(words.spawn_named("words", executor))
        .with(printer.spawn_named("printer", executor));
    pipeline.join().await?;
    parse_handle.join().await?;

    println!(
        "parsed {} items, {} failed",
        parse_handle.stats().item_count(),
        parse_handle.stats().error_count()
    );
    println!();
    Ok(())
}

/// Example 3: Stopping a stage that waits on an open queue
async fn stop_example(executor: &TaskExecutor) -> Result<()> {
    println!("=== Stop ===");

    let queue = Arc::new(AsyncQueue::with_capacity(4));
    let consumer = consumer_from_fn(|tick: u64| async move {
        println!("Tick {}", tick);
        Ok(())
    });
    let handle = ConsumerStage::new(consumer, Arc::clone(&queue)).spawn_named("ticks", executor);

    for tick in 0..3u64 {
        queue.add(tick).await?;
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    handle.stop();
    handle.join().await?;
    println!("queue closed: {}, task progress: {}", queue.is_closed(), handle.task().progress());
    println!();
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let executor = TaskExecutor::default();
    transform_example(&executor).await?;
    error_example(&executor).await?;
    stop_example(&executor).await?;
    Ok(())
}
