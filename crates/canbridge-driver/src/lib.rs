//! 运行时层
//!
//! 把协议编解码、规则矩阵和 CAN 适配器串成可运行的线程组：
//! - [`LineExtractor`]: TCP 字节流分行
//! - 有界输出队列 + drain 线程（[`output_queue`]、[`spawn_drain`]）
//! - [`Gateway`]: 一条总线 ↔ 一条 TCP 连接
//! - [`Bridge`]: 2..=5 条总线之间按规则矩阵转发
//!
//! 所有线程共享一个 `Arc<AtomicBool>` 运行标志，置 false 后读线程停止、
//! 输出队列清空后退出。

mod bridge;
mod builder;
mod error;
mod gateway;
pub mod line;
pub mod metrics;
pub mod pipeline;
pub mod queue;

pub use bridge::{Bridge, BridgeConfig, BusPort, PortMetrics};
pub use builder::{BridgeBuilder, DEFAULT_RECEIVE_TIMEOUT, GatewayBuilder};
pub use error::DriverError;
pub use gateway::{Gateway, GatewayConfig, GatewayMetrics};
pub use line::{LineExtractor, LineExtractorConfig, LineStats};
pub use metrics::{LinkMetrics, LinkMetricsSnapshot, QueueMetrics, QueueMetricsSnapshot};
pub use pipeline::{BusSink, FilterRoute, LineWriter, RunFlags};
pub use queue::{
    DrainHandle, OverflowPolicy, QueueConfig, QueueConsumer, QueueError, QueueProducer,
    RetryPolicy, SharedProducer, Sink, SinkError, output_queue, spawn_drain,
};
