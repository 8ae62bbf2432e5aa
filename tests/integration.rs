//! Integration tests for queues and the stages running around them

use async_trait::async_trait;
use futures::StreamExt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::timeout;
use tokio_test::{assert_err, assert_ok};

use asyncpipe::prelude::*;

const DEADLINE: Duration = Duration::from_secs(5);

#[tokio::test]
async fn test_pipeline_with_processing() {
    let executor = TaskExecutor::default();

    let numbers = ProducerStage::new(from_iter(1..=5));
    let doubled = ProcessorStage::new(
        MapProcessor::new(|x: i32| x * 2),
        Arc::clone(numbers.output()),
    );
    let collector = CollectConsumer::new();
    let items = collector.items();
    let sink = ConsumerStage::new(collector, Arc::clone(doubled.output()));

    let first = Arc::clone(numbers.output());
    let second = Arc::clone(doubled.output());

    let pipeline = Pipeline::new()
        .with(numbers.spawn(&executor))
        .with(doubled.spawn(&executor))
        .with(sink.spawn(&executor));
    assert_ok!(timeout(DEADLINE, pipeline.join()).await.unwrap());

    assert_eq!(*items.lock().await, vec![2, 4, 6, 8, 10]);
    assert!(first.is_closed());
    assert!(second.is_closed());
    assert_eq!(first.producer_count(), 0);

    for report in pipeline.stats() {
        assert_eq!(report.stats.items, 5, "stage {}", report.name);
        assert_eq!(report.stats.errors, 0);
    }
}

#[tokio::test]
async fn test_fan_in_closes_after_last_producer() {
    let executor = TaskExecutor::default();
    let queue = Arc::new(AsyncQueue::with_capacity(2));

    // holds the second producer back until the first one is done
    let gate = Arc::new(Notify::new());
    let mut calls = 0;
    let gated = producer_from_fn({
        let gate = Arc::clone(&gate);
        move || {
            calls += 1;
            let gate = Arc::clone(&gate);
            async move {
                if calls == 1 {
                    gate.notified().await;
                }
                Ok((calls <= 2).then_some(calls * 10))
            }
        }
    });

    let left = ProducerStage::with_output(from_iter(vec![1, 2, 3]), Arc::clone(&queue));
    let right = ProducerStage::with_output(gated, Arc::clone(&queue));
    assert_eq!(queue.producer_count(), 2);
    queue.close_automatically();
    assert!(!queue.is_closed());

    let collector = CollectConsumer::new();
    let items = collector.items();

    let pipeline = Pipeline::new()
        .with(left.spawn_named("left", &executor))
        .with(right.spawn_named("right", &executor))
        .with(ConsumerStage::new(collector, Arc::clone(&queue)).spawn_named("sink", &executor));

    assert_ok!(timeout(DEADLINE, pipeline.stages()[0].join()).await.unwrap());
    assert!(!queue.is_closed());
    assert_eq!(queue.producer_count(), 1);
    assert!(pipeline.stages()[1].is_running());

    gate.notify_one();
    assert_ok!(timeout(DEADLINE, pipeline.join()).await.unwrap());

    let mut collected = items.lock().await.clone();
    collected.sort_unstable();
    assert_eq!(collected, vec![1, 2, 3, 10, 20]);
    assert!(queue.is_closed());
    assert_eq!(queue.producer_count(), 0);
    assert_eq!(queue.add_success_count(), 5);
    assert_eq!(queue.remove_count(), 5);
}

#[tokio::test]
async fn test_producer_stops_on_none() {
    let mut calls = 0;
    let producer = producer_from_fn(move || {
        calls += 1;
        async move { Ok((calls < 4).then_some(calls)) }
    });

    let stage = ProducerStage::new(producer);
    let output = Arc::clone(stage.output());
    let handle = stage.spawn(&TaskExecutor::default());
    assert_ok!(timeout(DEADLINE, handle.join()).await.unwrap());

    assert_eq!(handle.stats().item_count(), 3);
    assert_eq!(output.producer_count(), 0);
    assert!(output.is_closed());
    assert_eq!(output.into_stream().collect::<Vec<_>>().await, vec![1, 2, 3]);
}

#[tokio::test]
async fn test_consumer_errors_do_not_stop_the_stage() {
    let queue = Arc::new(AsyncQueue::<i32>::new());
    for i in 0..4 {
        queue.add(i).await.unwrap();
    }
    queue.close();

    let consumer =
        consumer_from_fn(|item: i32| async move { Err(Error::custom(format!("rejected {item}"))) });
    let handle = ConsumerStage::new(consumer, Arc::clone(&queue)).spawn(&TaskExecutor::default());
    assert_ok!(timeout(DEADLINE, handle.join()).await.unwrap());

    assert_eq!(handle.stats().error_count(), 4);
    assert_eq!(handle.stats().item_count(), 0);
    assert_eq!(handle.progress(), 4);
    assert!(queue.is_empty());
}

struct StrictConsumer {
    reported: Arc<std::sync::Mutex<Vec<String>>>,
}

#[async_trait]
impl Consumer for StrictConsumer {
    type Item = i32;

    async fn consume(&mut self, item: i32) -> Result<()> {
        if item % 2 == 0 {
            Ok(())
        } else {
            Err(Error::custom(format!("odd item {item}")))
        }
    }

    fn handle_error(&mut self, error: Error) {
        self.reported.lock().unwrap().push(error.to_string());
    }
}

#[tokio::test]
async fn test_consumer_error_names_failing_item() {
    let queue = Arc::new(AsyncQueue::<i32>::new());
    for i in 1..=4 {
        queue.add(i).await.unwrap();
    }
    queue.close();

    let reported = Arc::new(std::sync::Mutex::new(Vec::new()));
    let consumer = StrictConsumer {
        reported: Arc::clone(&reported),
    };
    let handle = ConsumerStage::new(consumer, queue).spawn(&TaskExecutor::default());
    assert_ok!(timeout(DEADLINE, handle.join()).await.unwrap());

    assert_eq!(*reported.lock().unwrap(), vec!["odd item 1", "odd item 3"]);
    assert_eq!(handle.stats().item_count(), 2);
    assert_eq!(handle.stats().error_count(), 2);
}

#[tokio::test]
async fn test_stopping_blocked_consumer_closes_queue() {
    let queue = Arc::new(AsyncQueue::<i32>::new());
    let handle = ConsumerStage::new(CountConsumer::new(), Arc::clone(&queue))
        .spawn(&TaskExecutor::default());

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(handle.is_running());

    handle.stop();
    assert_ok!(timeout(DEADLINE, handle.join()).await.unwrap());
    assert!(queue.is_closed());
    assert!(!handle.is_running());
}

#[tokio::test]
async fn test_stopping_blocked_producer_closes_queue() {
    let queue = Arc::new(AsyncQueue::with_capacity(1));
    let handle = ProducerStage::with_output(RepeatProducer::new("tick"), Arc::clone(&queue))
        .spawn(&TaskExecutor::default());

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(queue.len(), 1);

    handle.stop();
    assert_ok!(timeout(DEADLINE, handle.join()).await.unwrap());
    assert!(queue.is_closed());
    assert_eq!(queue.producer_count(), 0);
    // the pending add failed on the closed queue
    assert_eq!(handle.stats().error_count(), 1);
    assert_eq!(queue.remove().await, Some("tick"));
}

#[tokio::test]
async fn test_filter_processor_drops_items() {
    let input = Arc::new(AsyncQueue::<i32>::new());
    for i in 1..=10 {
        input.add(i).await.unwrap();
    }
    input.close();

    let stage = ProcessorStage::new(FilterProcessor::new(|x: &i32| x % 2 == 0), Arc::clone(&input));
    let output = Arc::clone(stage.output());
    let handle = stage.spawn(&TaskExecutor::default());
    assert_ok!(timeout(DEADLINE, handle.join()).await.unwrap());

    assert_eq!(handle.stats().item_count(), 10);
    assert_eq!(output.add_success_count(), 5);
    assert_eq!(output.add_failure_count(), 5);
    assert_eq!(output.into_stream().collect::<Vec<_>>().await, vec![2, 4, 6, 8, 10]);
}

#[tokio::test]
async fn test_processor_errors_are_counted() {
    let input = Arc::new(AsyncQueue::<&'static str>::new());
    for s in ["1", "two", "3"] {
        input.add(s).await.unwrap();
    }
    input.close();

    let parse = processor_from_fn(|s: &'static str| async move {
        s.parse::<i32>().map(Some).map_err(Error::processor)
    });
    let stage = ProcessorStage::new(parse, Arc::clone(&input));
    let output = Arc::clone(stage.output());
    let handle = stage.spawn(&TaskExecutor::default());
    assert_ok!(timeout(DEADLINE, handle.join()).await.unwrap());

    assert_eq!(handle.stats().item_count(), 2);
    assert_eq!(handle.stats().error_count(), 1);
    assert_eq!(handle.progress(), 3);
    assert_eq!(output.into_stream().collect::<Vec<_>>().await, vec![1, 3]);
}

#[tokio::test]
async fn test_processor_keeps_draining_after_output_closes() {
    let executor = TaskExecutor::default();
    let input = Arc::new(AsyncQueue::with_capacity(2));
    let upstream = ProducerStage::with_output(from_iter(1..=20), Arc::clone(&input));
    input.close_automatically();

    let output = Arc::new(AsyncQueue::<i32>::new());
    output.close();

    let processor = ProcessorStage::with_output(
        MapProcessor::new(|x: i32| x + 1),
        Arc::clone(&input),
        Arc::clone(&output),
    );

    let upstream = upstream.spawn_named("upstream", &executor);
    let processor = processor.spawn_named("plus-one", &executor);

    // the producer only finishes if the processor keeps taking its items
    assert_ok!(timeout(DEADLINE, upstream.join()).await.unwrap());
    assert_ok!(timeout(DEADLINE, processor.join()).await.unwrap());

    assert_eq!(upstream.stats().item_count(), 20);
    assert_eq!(processor.stats().item_count(), 0);
    assert_eq!(processor.stats().error_count(), 20);
    assert_eq!(processor.progress(), 20);
    assert!(input.is_closed());
    assert!(input.is_empty());
    assert_eq!(output.add_success_count(), 0);
}

struct FailingStart {
    finished: Arc<AtomicBool>,
}

#[async_trait]
impl Producer for FailingStart {
    type Item = u32;

    async fn before_start(&mut self) -> Result<()> {
        Err(Error::custom("no connection"))
    }

    async fn produce(&mut self) -> Result<Option<u32>> {
        Ok(Some(1))
    }

    async fn finished(&mut self) {
        self.finished.store(true, Ordering::SeqCst);
    }
}

#[tokio::test]
async fn test_failed_start_releases_output() {
    let finished = Arc::new(AtomicBool::new(false));
    let stage = ProducerStage::new(FailingStart {
        finished: Arc::clone(&finished),
    });
    let output = Arc::clone(stage.output());
    let handle = stage.spawn(&TaskExecutor::default());

    let error = assert_err!(timeout(DEADLINE, handle.join()).await.unwrap());
    assert!(matches!(error, Error::Custom(_)));
    assert!(handle.task().last_error().is_some());
    assert!(!finished.load(Ordering::SeqCst));
    assert!(output.is_closed());
    assert_eq!(output.producer_count(), 0);
}

#[tokio::test]
async fn test_stage_on_registered_executor() {
    let executor = TaskExecutor::register("io-workers", tokio::runtime::Handle::current());
    let queue = Arc::new(AsyncQueue::<&str>::new());
    queue.add("x").await.unwrap();
    queue.close();

    let counter = CountConsumer::new();
    let handle = ConsumerStage::new(counter.clone(), queue)
        .spawn_named("count", &TaskExecutor::named("io-workers"));
    assert_ok!(timeout(DEADLINE, handle.join()).await.unwrap());

    assert_eq!(counter.count(), 1);

    assert_eq!(executor.name(), "io-workers");
    assert_eq!(handle.task().executor_name(), "io-workers");
    assert!(handle.name().starts_with("count #"));
}
