//! 网关：一条 CAN 总线 ↔ 一条 TCP 连接
//!
//! 每次会话四个线程：
//! - `gw-bus-rx`: 总线 → 编码 → 行队列
//! - `gw-tcp-tx`: 行队列 → TCP（drain）
//! - `gw-tcp-rx`: TCP → 分行 → 解码 → 过滤 → 帧队列
//! - `gw-bus-tx`: 帧队列 → 总线（drain）
//!
//! TCP 断开只结束当前会话，总线适配器在会话结束后收回，可用于下一个连接。

use crate::error::DriverError;
use crate::line::{LineExtractor, LineExtractorConfig};
use crate::metrics::{LinkMetrics, QueueMetrics};
use crate::pipeline::{
    BusSink, FilterRoute, LineWriter, RunFlags, bus_to_line_loop, line_to_bus_loop,
};
use crate::queue::{QueueConfig, output_queue, spawn_drain};
use canbridge_can::{RxAdapter, TxAdapter};
use canbridge_protocol::HexEncoder;
use std::io::{Read, Write};
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::thread;
use tracing::{debug, info};

/// 网关配置
#[derive(Debug, Clone, Default)]
pub struct GatewayConfig {
    /// 总线 → TCP 行队列
    pub line_queue: QueueConfig,
    /// TCP → 总线帧队列
    pub frame_queue: QueueConfig,
    pub extractor: LineExtractorConfig,
}

/// 网关指标
#[derive(Debug, Default)]
pub struct GatewayMetrics {
    pub link: Arc<LinkMetrics>,
    pub line_queue: Arc<QueueMetrics>,
    pub frame_queue: Arc<QueueMetrics>,
}

/// 网关
///
/// ```no_run
/// use canbridge_driver::{Gateway, GatewayConfig};
/// use canbridge_can::SocketCanAdapter;
/// use canbridge_can::SplittableAdapter;
/// use std::net::TcpStream;
/// use std::sync::Arc;
/// use std::sync::atomic::AtomicBool;
/// use std::time::Duration;
///
/// let (rx, tx) = SocketCanAdapter::new("can0").unwrap().split().unwrap();
/// let mut gateway = Gateway::new(rx, tx, GatewayConfig::default());
/// let stream = TcpStream::connect("127.0.0.1:32123").unwrap();
/// stream.set_read_timeout(Some(Duration::from_millis(100))).unwrap();
/// let writer = stream.try_clone().unwrap();
/// gateway.run_session(stream, writer, &Arc::new(AtomicBool::new(true))).unwrap();
/// ```
#[derive(Debug)]
pub struct Gateway<R, T> {
    rx: Option<R>,
    tx: Option<T>,
    config: GatewayConfig,
    /// TCP → 总线方向的路由，总线 → TCP 使用反向
    route: Option<FilterRoute>,
    metrics: Arc<GatewayMetrics>,
    sessions: u64,
}

impl<R, T> Gateway<R, T>
where
    R: RxAdapter + Send + 'static,
    T: TxAdapter + Send + 'static,
{
    pub fn new(rx: R, tx: T, config: GatewayConfig) -> Self {
        Self {
            rx: Some(rx),
            tx: Some(tx),
            config,
            route: None,
            metrics: Arc::new(GatewayMetrics::default()),
            sessions: 0,
        }
    }

    /// 启用过滤：TCP 侧为 `route.in_conn()`，总线侧为 `route.out_conn()`
    pub fn with_route(mut self, route: FilterRoute) -> Self {
        self.route = Some(route);
        self
    }

    pub fn metrics(&self) -> &Arc<GatewayMetrics> {
        &self.metrics
    }

    /// 已完成的会话数
    pub fn sessions(&self) -> u64 {
        self.sessions
    }

    /// 运行一次会话，直到对端断开、TCP 写失败或 `is_running` 变为 false
    ///
    /// 返回前等待帧队列中剩余的帧全部写到总线。
    pub fn run_session<SR, SW>(
        &mut self,
        reader: SR,
        writer: SW,
        is_running: &Arc<AtomicBool>,
    ) -> Result<(), DriverError>
    where
        SR: Read + Send + 'static,
        SW: Write + Send + 'static,
    {
        let (Some(rx), Some(tx)) = (self.rx.take(), self.tx.take()) else {
            return Err(DriverError::InvalidConfig(
                "bus adapter lost by a previous session".to_string(),
            ));
        };

        let flags = RunFlags::new(is_running.clone());
        let metrics = self.metrics.clone();

        let (line_producer, line_consumer) =
            output_queue(&self.config.line_queue, metrics.line_queue.clone());
        let (frame_producer, frame_consumer) =
            output_queue(&self.config.frame_queue, metrics.frame_queue.clone());

        // TCP 写失败只结束会话；总线写致命错误结束进程
        let tcp_tx = spawn_drain(
            "gw-tcp-tx",
            line_consumer,
            LineWriter::new(writer),
            self.config.line_queue.retry,
            flags.session.clone(),
        )?;
        let bus_tx = spawn_drain(
            "gw-bus-tx",
            frame_consumer,
            BusSink::new(tx, metrics.link.clone()),
            self.config.frame_queue.retry,
            flags.process.clone(),
        )?;

        let bus_rx = {
            let thread_flags = flags.clone();
            let link = metrics.link.clone();
            let route = self.route.as_ref().map(FilterRoute::reversed);
            thread::Builder::new()
                .name("gw-bus-rx".into())
                .spawn(move || {
                    bus_to_line_loop(rx, HexEncoder::new(), line_producer, route, link, thread_flags)
                })
                .map_err(|e| {
                    flags.stop_session();
                    DriverError::ThreadSpawn(format!("gw-bus-rx: {}", e))
                })?
        };

        let tcp_rx = {
            let thread_flags = flags.clone();
            let link = metrics.link.clone();
            let route = self.route.clone();
            let extractor = LineExtractor::new(self.config.extractor);
            thread::Builder::new()
                .name("gw-tcp-rx".into())
                .spawn(move || {
                    line_to_bus_loop(reader, extractor, frame_producer, route, link, thread_flags)
                })
                .map_err(|e| {
                    flags.stop_session();
                    DriverError::ThreadSpawn(format!("gw-tcp-rx: {}", e))
                })?
        };

        info!("Gateway session {} started", self.sessions + 1);

        // 读线程先退出并释放生产者，drain 线程清空队列后退出
        let tcp_rx_result = tcp_rx.join();
        let bus_rx_result = bus_rx.join();
        // TCP 写端属于本次会话，在此关闭
        drop(tcp_tx.join()?);
        let bus_sink = bus_tx.join()?;

        tcp_rx_result.map_err(|_| DriverError::ThreadPanicked("gw-tcp-rx".into()))?;
        let rx = bus_rx_result.map_err(|_| DriverError::ThreadPanicked("gw-bus-rx".into()))?;

        self.rx = Some(rx);
        self.tx = Some(bus_sink.into_inner());
        self.sessions += 1;

        let link = metrics.link.snapshot();
        debug!(
            "Gateway session {} ended: rx_frames={}, tx_frames={}, decode_errors={}",
            self.sessions,
            link.rx_frames,
            link.tx_frames,
            link.decode_errors()
        );
        Ok(())
    }

    /// 取回总线适配器
    pub fn into_adapters(self) -> Option<(R, T)> {
        self.rx.zip(self.tx)
    }
}
