//! 多总线桥接
//!
//! 每条总线一个读线程和一个写线程（drain）。读到的帧对其他每条总线按
//! `decide(id, in, out)` 判定，放行的帧（可能替换 ID）进入目标总线的帧队列。
//! 多个读线程共享同一个目标队列，因此目标队列使用 [`SharedProducer`]。

use crate::error::DriverError;
use crate::metrics::{LinkMetrics, QueueMetrics};
use crate::pipeline::{BusSink, RunFlags, bridge_rx_loop};
use crate::queue::{DrainHandle, QueueConfig, SharedProducer, output_queue, spawn_drain};
use canbridge_can::{RxAdapter, TxAdapter};
use canbridge_filter::FilterMatrix;
use canbridge_protocol::CanFrame;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::thread::{self, JoinHandle};
use tracing::{info, trace};

/// 桥接配置
#[derive(Debug, Clone, Default)]
pub struct BridgeConfig {
    /// 每条总线的输出帧队列
    pub queue: QueueConfig,
}

/// 一条总线的两个方向
#[derive(Debug)]
pub struct BusPort<R, T> {
    pub name: String,
    pub rx: R,
    pub tx: T,
}

impl<R, T> BusPort<R, T> {
    pub fn new(name: impl Into<String>, rx: R, tx: T) -> Self {
        Self {
            name: name.into(),
            rx,
            tx,
        }
    }
}

/// 单条总线的指标
#[derive(Debug)]
pub struct PortMetrics {
    pub name: String,
    /// 接收计数和本总线作为入口时的过滤计数；发送计数
    pub link: Arc<LinkMetrics>,
    /// 本总线的输出队列
    pub queue: Arc<QueueMetrics>,
}

/// 运行中的桥接
#[derive(Debug)]
pub struct Bridge<R, T> {
    readers: Vec<(String, JoinHandle<R>)>,
    writers: Vec<DrainHandle<BusSink<T>>>,
    metrics: Vec<Arc<PortMetrics>>,
}

impl<R, T> Bridge<R, T>
where
    R: RxAdapter + Send + 'static,
    T: TxAdapter + Send + 'static,
{
    /// 启动桥接
    ///
    /// `ports` 的顺序即规则文件中的连接号（第一条为 1，内部为 0）。
    pub fn spawn(
        ports: Vec<BusPort<R, T>>,
        matrix: Arc<FilterMatrix>,
        config: &BridgeConfig,
        is_running: Arc<AtomicBool>,
    ) -> Result<Self, DriverError> {
        if ports.len() != matrix.n() {
            return Err(DriverError::InvalidConfig(format!(
                "{} buses given, rule matrix expects {}",
                ports.len(),
                matrix.n()
            )));
        }

        let flags = RunFlags::new(is_running.clone());
        let mut metrics = Vec::with_capacity(ports.len());
        let mut producers: Vec<SharedProducer<CanFrame>> = Vec::with_capacity(ports.len());
        let mut writers = Vec::with_capacity(ports.len());
        let mut receivers = Vec::with_capacity(ports.len());

        for port in ports {
            let port_metrics = Arc::new(PortMetrics {
                name: port.name.clone(),
                link: Arc::new(LinkMetrics::new()),
                queue: Arc::new(QueueMetrics::new()),
            });
            let (producer, consumer) = output_queue(&config.queue, port_metrics.queue.clone());
            let writer = spawn_drain(
                format!("bridge-tx-{}", port.name),
                consumer,
                BusSink::new(port.tx, port_metrics.link.clone()),
                config.queue.retry,
                is_running.clone(),
            );
            let writer = match writer {
                Ok(writer) => writer,
                Err(e) => {
                    flags.stop_process();
                    return Err(e);
                },
            };
            producers.push(producer.into_shared());
            writers.push(writer);
            receivers.push((port.name, port.rx));
            metrics.push(port_metrics);
        }

        let mut readers = Vec::with_capacity(receivers.len());
        for (conn, (name, rx)) in receivers.into_iter().enumerate() {
            let outputs: Vec<(usize, SharedProducer<CanFrame>)> = producers
                .iter()
                .enumerate()
                .filter(|(out_conn, _)| *out_conn != conn)
                .map(|(out_conn, producer)| (out_conn, producer.clone()))
                .collect();
            let matrix = matrix.clone();
            let link = metrics[conn].link.clone();
            let thread_flags = flags.clone();
            let handle = thread::Builder::new()
                .name(format!("bridge-rx-{}", name))
                .spawn(move || bridge_rx_loop(conn, rx, matrix, outputs, link, thread_flags))
                .map_err(|e| {
                    flags.stop_process();
                    DriverError::ThreadSpawn(format!("bridge-rx-{}: {}", name, e))
                })?;
            readers.push((name, handle));
        }
        // 只保留读线程手里的生产者，读线程全部退出后写线程才能结束
        drop(producers);

        info!(
            "Bridge started: {}",
            metrics
                .iter()
                .map(|m| m.name.as_str())
                .collect::<Vec<_>>()
                .join(" <-> ")
        );
        Ok(Self {
            readers,
            writers,
            metrics,
        })
    }

    /// 每条总线的指标，顺序与连接号一致
    pub fn metrics(&self) -> &[Arc<PortMetrics>] {
        &self.metrics
    }

    /// 是否所有线程都已退出
    pub fn is_finished(&self) -> bool {
        self.readers.iter().all(|(_, h)| h.is_finished())
            && self.writers.iter().all(|w| w.is_finished())
    }

    /// 等待所有线程退出（先读后写），返回各总线的适配器
    pub fn join(self) -> Result<Vec<BusPort<R, T>>, DriverError> {
        let mut rx_adapters = Vec::with_capacity(self.readers.len());
        let mut panicked = None;
        for (name, handle) in self.readers {
            match handle.join() {
                Ok(rx) => rx_adapters.push((name, rx)),
                Err(_) => panicked = Some(format!("bridge-rx-{}", name)),
            }
        }

        let mut tx_adapters = Vec::with_capacity(self.writers.len());
        for writer in self.writers {
            let name = writer.name().to_string();
            match writer.join() {
                Ok(sink) => tx_adapters.push(sink.into_inner()),
                Err(_) => {
                    panicked.get_or_insert(name);
                },
            }
        }

        if let Some(name) = panicked {
            return Err(DriverError::ThreadPanicked(name));
        }
        trace!("Bridge threads joined");
        Ok(rx_adapters
            .into_iter()
            .zip(tx_adapters)
            .map(|((name, rx), tx)| BusPort::new(name, rx, tx))
            .collect())
    }
}
