//! 有界输出队列
//!
//! 每个队列一个生产者、一个专属 drain 线程。drain 线程阻塞等待条目，
//! 依次交给 [`Sink`] 发送（TCP 写或 CAN 写），失败时按 [`RetryPolicy`] 重试。
//!
//! 队列满时的行为由 [`OverflowPolicy`] 显式决定，生产者永远不会覆盖未消费的条目。
//! 生产者全部 drop 后，drain 线程发送完剩余条目再退出。

use crate::error::DriverError;
use crate::metrics::QueueMetrics;
use canbridge_can::CanError;
use crossbeam_channel::{Receiver, Sender, TryRecvError, TrySendError, bounded};
use parking_lot::Mutex;
use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use thiserror::Error;
use tracing::{error, trace, warn};

/// 队列满时的处理策略
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum OverflowPolicy {
    /// 阻塞生产者直到有空位（背压）
    #[default]
    Block,
    /// 立即返回 [`QueueError::Full`]
    Reject,
    /// 挤掉最旧的未消费条目
    DropOldest,
}

/// sink 发送失败后的重试策略
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// 两次尝试之间的等待
    pub backoff: Duration,
    /// 每个条目的最大尝试次数，0 表示不限（直到停止运行）
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            backoff: Duration::from_millis(1),
            max_attempts: 100,
        }
    }
}

/// 队列配置
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueConfig {
    pub capacity: usize,
    pub overflow: OverflowPolicy,
    pub retry: RetryPolicy,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            capacity: 256,
            overflow: OverflowPolicy::Block,
            retry: RetryPolicy::default(),
        }
    }
}

/// 入队错误
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueError {
    /// 队列已满（Reject 策略）
    #[error("Output queue full")]
    Full,
    /// drain 线程已退出
    #[error("Output queue closed")]
    Closed,
}

/// sink 发送错误
#[derive(Error, Debug)]
pub enum SinkError {
    #[error("CAN send failed: {0}")]
    Can(#[from] CanError),
    #[error("Socket write failed: {0}")]
    Io(#[from] io::Error),
}

impl SinkError {
    /// 致命错误不再重试，drain 线程随之退出
    pub fn is_fatal(&self) -> bool {
        match self {
            SinkError::Can(e) => e.is_fatal(),
            SinkError::Io(e) => matches!(
                e.kind(),
                io::ErrorKind::BrokenPipe
                    | io::ErrorKind::ConnectionReset
                    | io::ErrorKind::ConnectionAborted
                    | io::ErrorKind::NotConnected
                    | io::ErrorKind::WriteZero
                    | io::ErrorKind::UnexpectedEof
            ),
        }
    }
}

/// 输出目标
///
/// `deliver` 失败后会用同一个条目重试，sink 需自行记住已发送的部分。
pub trait Sink<T>: Send {
    fn deliver(&mut self, item: &T) -> Result<(), SinkError>;

    /// 放弃当前条目（重试耗尽或致命错误），下一次 `deliver` 从新条目开始
    fn abandon(&mut self) {}
}

/// 创建一个有界队列
///
/// `capacity` 为 0 时按 1 处理。
pub fn output_queue<T>(
    config: &QueueConfig,
    metrics: Arc<QueueMetrics>,
) -> (QueueProducer<T>, QueueConsumer<T>) {
    let (tx, rx) = bounded(config.capacity.max(1));
    let closed = Arc::new(AtomicBool::new(false));
    let evict = match config.overflow {
        OverflowPolicy::DropOldest => Some(rx.clone()),
        _ => None,
    };
    let producer = QueueProducer {
        tx,
        evict,
        policy: config.overflow,
        closed: closed.clone(),
        metrics: metrics.clone(),
    };
    let consumer = QueueConsumer {
        rx,
        closed,
        metrics,
    };
    (producer, consumer)
}

/// 队列生产端
///
/// 不实现 `Clone`：单生产者约束体现在类型上。需要多个生产者时用
/// [`QueueProducer::into_shared`]。
#[derive(Debug)]
pub struct QueueProducer<T> {
    tx: Sender<T>,
    /// DropOldest 策略用于挤掉最旧条目
    evict: Option<Receiver<T>>,
    policy: OverflowPolicy,
    closed: Arc<AtomicBool>,
    metrics: Arc<QueueMetrics>,
}

impl<T> QueueProducer<T> {
    /// 入队
    ///
    /// 成功返回后条目已对 drain 线程可见。
    pub fn push(&mut self, item: T) -> Result<(), QueueError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(QueueError::Closed);
        }

        match self.policy {
            OverflowPolicy::Block => {
                self.tx.send(item).map_err(|_| QueueError::Closed)?;
            },
            OverflowPolicy::Reject => match self.tx.try_send(item) {
                Ok(()) => {},
                Err(TrySendError::Full(_)) => {
                    self.metrics.rejected.fetch_add(1, Ordering::Relaxed);
                    return Err(QueueError::Full);
                },
                Err(TrySendError::Disconnected(_)) => return Err(QueueError::Closed),
            },
            OverflowPolicy::DropOldest => {
                let mut item = item;
                loop {
                    match self.tx.try_send(item) {
                        Ok(()) => break,
                        Err(TrySendError::Full(returned)) => {
                            item = returned;
                            if let Some(evict) = &self.evict
                                && evict.try_recv().is_ok()
                            {
                                self.metrics.dropped_oldest.fetch_add(1, Ordering::Relaxed);
                            }
                            if self.closed.load(Ordering::Acquire) {
                                return Err(QueueError::Closed);
                            }
                        },
                        Err(TrySendError::Disconnected(_)) => return Err(QueueError::Closed),
                    }
                }
            },
        }

        self.metrics.pushed.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// 当前排队条目数
    pub fn len(&self) -> usize {
        self.tx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tx.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.tx.capacity().unwrap_or(0)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// 转为可克隆的多生产者句柄（内部加锁）
    pub fn into_shared(self) -> SharedProducer<T> {
        SharedProducer {
            inner: Arc::new(Mutex::new(self)),
        }
    }
}

/// 多生产者句柄
///
/// 入队时持有互斥锁，保证同一时刻只有一个生产者在写。
#[derive(Debug)]
pub struct SharedProducer<T> {
    inner: Arc<Mutex<QueueProducer<T>>>,
}

impl<T> Clone for SharedProducer<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T> SharedProducer<T> {
    pub fn push(&self, item: T) -> Result<(), QueueError> {
        self.inner.lock().push(item)
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().is_closed()
    }
}

/// 队列消费端，交给 [`spawn_drain`]
#[derive(Debug)]
pub struct QueueConsumer<T> {
    rx: Receiver<T>,
    closed: Arc<AtomicBool>,
    metrics: Arc<QueueMetrics>,
}

impl<T> QueueConsumer<T> {
    /// 阻塞等待下一个条目，所有生产者 drop 且队列为空时返回 `None`
    pub fn recv(&self) -> Option<T> {
        self.rx.recv().ok()
    }

    /// 非阻塞取条目
    pub fn try_recv(&self) -> Result<T, TryRecvError> {
        self.rx.try_recv()
    }

    pub fn metrics(&self) -> &Arc<QueueMetrics> {
        &self.metrics
    }
}

impl<T> Drop for QueueConsumer<T> {
    fn drop(&mut self) {
        self.closed.store(true, Ordering::Release);
    }
}

/// drain 线程句柄
///
/// `join()` 返回 sink，便于下一次会话复用底层设备。
#[derive(Debug)]
pub struct DrainHandle<S> {
    name: String,
    handle: JoinHandle<S>,
}

impl<S> DrainHandle<S> {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    pub fn join(self) -> Result<S, DriverError> {
        self.handle
            .join()
            .map_err(|_| DriverError::ThreadPanicked(self.name))
    }
}

/// 启动 drain 线程
///
/// 线程在所有生产者 drop 且队列清空后退出。sink 返回致命错误时，
/// 把 `is_running` 置为 false 并提前退出（剩余条目随消费端一起丢弃）。
pub fn spawn_drain<T, S>(
    name: impl Into<String>,
    consumer: QueueConsumer<T>,
    sink: S,
    retry: RetryPolicy,
    is_running: Arc<AtomicBool>,
) -> Result<DrainHandle<S>, DriverError>
where
    T: Send + 'static,
    S: Sink<T> + 'static,
{
    let name = name.into();
    let thread_name = name.clone();
    let handle = thread::Builder::new()
        .name(name.clone())
        .spawn(move || drain_loop(&thread_name, consumer, sink, retry, is_running))
        .map_err(|e| DriverError::ThreadSpawn(format!("{}: {}", name, e)))?;
    Ok(DrainHandle { name, handle })
}

fn drain_loop<T, S: Sink<T>>(
    name: &str,
    consumer: QueueConsumer<T>,
    mut sink: S,
    retry: RetryPolicy,
    is_running: Arc<AtomicBool>,
) -> S {
    let metrics = consumer.metrics.clone();

    while let Some(item) = consumer.recv() {
        match deliver_with_retry(&mut sink, &item, &retry, &metrics, &is_running) {
            Delivery::Sent => {
                metrics.delivered.fetch_add(1, Ordering::Relaxed);
            },
            Delivery::GaveUp => {
                sink.abandon();
                metrics.abandoned.fetch_add(1, Ordering::Relaxed);
            },
            Delivery::Fatal(e) => {
                sink.abandon();
                metrics.abandoned.fetch_add(1, Ordering::Relaxed);
                error!("{}: fatal sink error: {}, setting is_running = false", name, e);
                is_running.store(false, Ordering::Release);
                break;
            },
        }
    }

    trace!("{}: drain loop exited", name);
    sink
}

enum Delivery {
    Sent,
    GaveUp,
    Fatal(SinkError),
}

fn deliver_with_retry<T, S: Sink<T>>(
    sink: &mut S,
    item: &T,
    retry: &RetryPolicy,
    metrics: &QueueMetrics,
    is_running: &AtomicBool,
) -> Delivery {
    let mut attempts: u32 = 0;
    loop {
        attempts += 1;
        let err = match sink.deliver(item) {
            Ok(()) => return Delivery::Sent,
            Err(e) => e,
        };
        metrics.send_failures.fetch_add(1, Ordering::Relaxed);

        if err.is_fatal() {
            return Delivery::Fatal(err);
        }
        let exhausted = retry.max_attempts != 0 && attempts >= retry.max_attempts;
        // 不限次数时，停止运行即放弃
        let stopping = retry.max_attempts == 0 && !is_running.load(Ordering::Acquire);
        if exhausted || stopping {
            warn!("Giving up after {} attempts: {}", attempts, err);
            return Delivery::GaveUp;
        }

        metrics.send_retries.fetch_add(1, Ordering::Relaxed);
        if !retry.backoff.is_zero() {
            thread::sleep(retry.backoff);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel::unbounded;

    /// 把条目转发到 channel 的 sink
    struct ChannelSink {
        tx: Sender<u32>,
    }

    impl Sink<u32> for ChannelSink {
        fn deliver(&mut self, item: &u32) -> Result<(), SinkError> {
            self.tx
                .send(*item)
                .map_err(|_| SinkError::Io(io::Error::from(io::ErrorKind::BrokenPipe)))
        }
    }

    /// 前 `fail_first` 次发送失败的 sink
    struct FlakySink {
        fail_first: u32,
        calls: u32,
        delivered: Vec<u32>,
        kind: io::ErrorKind,
    }

    impl Sink<u32> for FlakySink {
        fn deliver(&mut self, item: &u32) -> Result<(), SinkError> {
            self.calls += 1;
            if self.calls <= self.fail_first {
                return Err(io::Error::from(self.kind).into());
            }
            self.delivered.push(*item);
            Ok(())
        }
    }

    fn config(capacity: usize, overflow: OverflowPolicy) -> QueueConfig {
        QueueConfig {
            capacity,
            overflow,
            retry: RetryPolicy {
                backoff: Duration::ZERO,
                max_attempts: 5,
            },
        }
    }

    #[test]
    fn test_fifo_through_drain_thread() {
        let metrics = Arc::new(QueueMetrics::new());
        let (mut producer, consumer) = output_queue(&config(4, OverflowPolicy::Block), metrics.clone());
        let (tx, rx) = unbounded();
        let is_running = Arc::new(AtomicBool::new(true));
        let handle = spawn_drain(
            "test-drain",
            consumer,
            ChannelSink { tx },
            RetryPolicy::default(),
            is_running,
        )
        .unwrap();

        for item in [1u32, 2, 3] {
            producer.push(item).unwrap();
        }
        drop(producer);
        handle.join().unwrap();

        assert_eq!(rx.try_iter().collect::<Vec<_>>(), vec![1, 2, 3]);
        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.pushed, 3);
        assert_eq!(snapshot.delivered, 3);
    }

    #[test]
    fn test_block_policy_never_loses_items() {
        let metrics = Arc::new(QueueMetrics::new());
        let (mut producer, consumer) = output_queue(&config(2, OverflowPolicy::Block), metrics);
        let (tx, rx) = unbounded();
        let handle = spawn_drain(
            "test-block",
            consumer,
            ChannelSink { tx },
            RetryPolicy::default(),
            Arc::new(AtomicBool::new(true)),
        )
        .unwrap();

        for item in 0..1000u32 {
            producer.push(item).unwrap();
        }
        drop(producer);
        handle.join().unwrap();

        assert_eq!(rx.try_iter().collect::<Vec<_>>(), (0..1000).collect::<Vec<_>>());
    }

    #[test]
    fn test_reject_policy() {
        let metrics = Arc::new(QueueMetrics::new());
        let (mut producer, consumer) = output_queue(&config(2, OverflowPolicy::Reject), metrics.clone());
        producer.push(1u32).unwrap();
        producer.push(2).unwrap();
        assert_eq!(producer.push(3), Err(QueueError::Full));
        assert_eq!(metrics.snapshot().rejected, 1);

        assert_eq!(consumer.try_recv(), Ok(1));
        assert_eq!(consumer.try_recv(), Ok(2));
    }

    #[test]
    fn test_drop_oldest_policy() {
        let metrics = Arc::new(QueueMetrics::new());
        let (mut producer, consumer) =
            output_queue(&config(2, OverflowPolicy::DropOldest), metrics.clone());
        for item in [1u32, 2, 3, 4] {
            producer.push(item).unwrap();
        }
        assert_eq!(metrics.snapshot().dropped_oldest, 2);
        assert_eq!(consumer.try_recv(), Ok(3));
        assert_eq!(consumer.try_recv(), Ok(4));
    }

    #[test]
    fn test_push_after_consumer_dropped() {
        for policy in [
            OverflowPolicy::Block,
            OverflowPolicy::Reject,
            OverflowPolicy::DropOldest,
        ] {
            let (mut producer, consumer) =
                output_queue::<u32>(&config(2, policy), Arc::new(QueueMetrics::new()));
            drop(consumer);
            assert!(producer.is_closed());
            assert_eq!(producer.push(1), Err(QueueError::Closed), "{:?}", policy);
        }
    }

    #[test]
    fn test_transient_failures_retried() {
        let metrics = Arc::new(QueueMetrics::new());
        let (mut producer, consumer) = output_queue(&config(4, OverflowPolicy::Block), metrics.clone());
        let sink = FlakySink {
            fail_first: 2,
            calls: 0,
            delivered: Vec::new(),
            kind: io::ErrorKind::WouldBlock,
        };
        let handle = spawn_drain(
            "test-retry",
            consumer,
            sink,
            RetryPolicy {
                backoff: Duration::ZERO,
                max_attempts: 5,
            },
            Arc::new(AtomicBool::new(true)),
        )
        .unwrap();

        producer.push(7u32).unwrap();
        drop(producer);
        let sink = handle.join().unwrap();

        assert_eq!(sink.delivered, vec![7]);
        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.send_failures, 2);
        assert_eq!(snapshot.send_retries, 2);
        assert_eq!(snapshot.delivered, 1);
    }

    #[test]
    fn test_retry_exhausted_abandons_item() {
        let metrics = Arc::new(QueueMetrics::new());
        let (mut producer, consumer) = output_queue(&config(4, OverflowPolicy::Block), metrics.clone());
        let sink = FlakySink {
            fail_first: 3,
            calls: 0,
            delivered: Vec::new(),
            kind: io::ErrorKind::WouldBlock,
        };
        let handle = spawn_drain(
            "test-give-up",
            consumer,
            sink,
            RetryPolicy {
                backoff: Duration::ZERO,
                max_attempts: 3,
            },
            Arc::new(AtomicBool::new(true)),
        )
        .unwrap();

        producer.push(1u32).unwrap();
        producer.push(2).unwrap();
        drop(producer);
        let sink = handle.join().unwrap();

        assert_eq!(sink.delivered, vec![2]);
        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.abandoned, 1);
        assert_eq!(snapshot.delivered, 1);
    }

    #[test]
    fn test_fatal_sink_error_stops_running() {
        let metrics = Arc::new(QueueMetrics::new());
        let (mut producer, consumer) = output_queue(&config(4, OverflowPolicy::Block), metrics.clone());
        let sink = FlakySink {
            fail_first: u32::MAX,
            calls: 0,
            delivered: Vec::new(),
            kind: io::ErrorKind::BrokenPipe,
        };
        let is_running = Arc::new(AtomicBool::new(true));
        let handle = spawn_drain(
            "test-fatal",
            consumer,
            sink,
            RetryPolicy::default(),
            is_running.clone(),
        )
        .unwrap();

        producer.push(1u32).unwrap();
        let sink = handle.join().unwrap();

        assert_eq!(sink.calls, 1);
        assert!(!is_running.load(Ordering::Acquire));
        assert_eq!(producer.push(2), Err(QueueError::Closed));
        assert_eq!(metrics.snapshot().abandoned, 1);
    }

    #[test]
    fn test_shared_producer_from_many_threads() {
        let metrics = Arc::new(QueueMetrics::new());
        let (producer, consumer) = output_queue(&config(8, OverflowPolicy::Block), metrics.clone());
        let (tx, rx) = unbounded();
        let handle = spawn_drain(
            "test-shared",
            consumer,
            ChannelSink { tx },
            RetryPolicy::default(),
            Arc::new(AtomicBool::new(true)),
        )
        .unwrap();

        let shared = producer.into_shared();
        let writers: Vec<_> = (0..4u32)
            .map(|t| {
                let shared = shared.clone();
                thread::spawn(move || {
                    for i in 0..100u32 {
                        shared.push(t * 1000 + i).unwrap();
                    }
                })
            })
            .collect();
        for writer in writers {
            writer.join().unwrap();
        }
        drop(shared);
        handle.join().unwrap();

        let received: Vec<u32> = rx.try_iter().collect();
        assert_eq!(received.len(), 400);
        // 同一生产者内保持顺序
        for t in 0..4u32 {
            let own: Vec<u32> = received.iter().copied().filter(|v| v / 1000 == t).collect();
            assert_eq!(own, (0..100).map(|i| t * 1000 + i).collect::<Vec<_>>());
        }
    }

    #[test]
    fn test_sink_error_classification() {
        assert!(SinkError::from(CanError::BusOff).is_fatal());
        assert!(!SinkError::from(CanError::Timeout).is_fatal());
        assert!(SinkError::from(io::Error::from(io::ErrorKind::ConnectionReset)).is_fatal());
        assert!(!SinkError::from(io::Error::from(io::ErrorKind::WouldBlock)).is_fatal());
    }
}
