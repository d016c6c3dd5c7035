//! 守护进程运行循环
//!
//! 桥接模式：打开所有总线，直到 Ctrl+C 或某条总线出现致命错误。
//! 网关模式：一条总线对一个 TCP 对端，对端断开后重连（客户端）或等待下一个连接（服务端）。

use crate::config::DaemonConfig;
use anyhow::{Context, Result, bail};
use canbridge_can::{RxAdapter, TxAdapter};
use canbridge_driver::{
    BridgeBuilder, BridgeConfig, Gateway, GatewayBuilder, GatewayConfig, GatewayMetrics,
    LinkMetricsSnapshot, PortMetrics,
};
use canbridge_filter::FilterMatrix;
use std::io::ErrorKind;
use std::net::{TcpListener, TcpStream};
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// 主循环检查停止标志的间隔
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// TCP 读超时（决定会话响应停止的速度）
const TCP_READ_TIMEOUT: Duration = Duration::from_millis(100);

/// TCP 写超时，超时后由队列重试策略决定是否放弃
const TCP_WRITE_TIMEOUT: Duration = Duration::from_secs(1);

/// 网关的 TCP 端点
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    Connect(String),
    Listen(String),
}

impl Endpoint {
    pub fn from_config(config: &DaemonConfig) -> Result<Self> {
        match (&config.gateway.connect, &config.gateway.listen) {
            (Some(addr), None) => Ok(Self::Connect(addr.clone())),
            (None, Some(addr)) => Ok(Self::Listen(addr.clone())),
            (Some(_), Some(_)) => bail!("gateway needs either connect or listen, not both"),
            (None, None) => bail!("gateway needs a connect or listen address"),
        }
    }
}

fn load_matrix(path: &Path) -> Result<Arc<FilterMatrix>> {
    let matrix = FilterMatrix::load(path)
        .with_context(|| format!("Failed to load rule file {}", path.display()))?;
    info!("Loaded {}: {}", path.display(), matrix.summary().trim_end());
    Ok(Arc::new(matrix))
}

/// 可中断的 sleep，`is_running` 变为 false 时提前返回
fn sleep_while_running(total: Duration, is_running: &AtomicBool) {
    let deadline = Instant::now() + total;
    while is_running.load(Ordering::Acquire) {
        let now = Instant::now();
        if now >= deadline {
            break;
        }
        thread::sleep(POLL_INTERVAL.min(deadline - now));
    }
}

/// 状态打印线程
///
/// 每个间隔调用一次 `report`，参数为距上次调用的实际时长。
fn spawn_status_loop<F>(
    interval: Duration,
    is_running: Arc<AtomicBool>,
    mut report: F,
) -> Result<JoinHandle<()>>
where
    F: FnMut(Duration) + Send + 'static,
{
    thread::Builder::new()
        .name("status".into())
        .spawn(move || {
            let mut last = Instant::now();
            loop {
                sleep_while_running(interval, &is_running);
                if !is_running.load(Ordering::Acquire) {
                    break;
                }
                let now = Instant::now();
                report(now - last);
                last = now;
            }
        })
        .context("Failed to spawn status thread")
}

fn rate(now: u64, before: u64, elapsed: Duration) -> f64 {
    let secs = elapsed.as_secs_f64();
    if secs <= 0.0 {
        return 0.0;
    }
    now.saturating_sub(before) as f64 / secs
}

fn log_port_status(port: &PortMetrics, before: &LinkMetricsSnapshot, elapsed: Duration) -> LinkMetricsSnapshot {
    let link = port.link.snapshot();
    let queue = port.queue.snapshot();
    info!(
        "[{}] RX: {:.1} fps, TX: {:.1} fps, passed: {}, translated: {}, blocked: {}, queue pending: {}, rejected: {}, dropped: {}, abandoned: {}",
        port.name,
        rate(link.rx_frames, before.rx_frames, elapsed),
        rate(link.tx_frames, before.tx_frames, elapsed),
        link.passed,
        link.translated,
        link.blocked,
        queue.pending(),
        queue.rejected,
        queue.dropped_oldest,
        queue.abandoned,
    );
    link
}

fn log_gateway_status(
    metrics: &GatewayMetrics,
    before: &LinkMetricsSnapshot,
    elapsed: Duration,
) -> LinkMetricsSnapshot {
    let link = metrics.link.snapshot();
    let lines = metrics.line_queue.snapshot();
    let frames = metrics.frame_queue.snapshot();
    info!(
        "[gateway] bus RX: {:.1} fps, bus TX: {:.1} fps, lines: {}, decode errors: {}, overruns: {}, blocked: {}, line queue pending: {}, frame queue pending: {}, dropped: {}",
        rate(link.rx_frames, before.rx_frames, elapsed),
        rate(link.tx_frames, before.tx_frames, elapsed),
        link.lines,
        link.decode_errors(),
        link.ring_overruns,
        link.blocked,
        lines.pending(),
        frames.pending(),
        lines.rejected + lines.dropped_oldest + frames.rejected + frames.dropped_oldest,
    );
    if link.decode_errors() > before.decode_errors() {
        warn!(
            "[gateway] decode errors: too_long={}, too_short={}, illegal_hex={}, illegal_id={}, illegal_dlc={}, checksum={}",
            link.decode_too_long,
            link.decode_too_short,
            link.decode_illegal_hex,
            link.decode_illegal_id,
            link.decode_illegal_dlc,
            link.decode_checksum,
        );
    }
    link
}

/// 运行 N 路桥接，直到 `is_running` 变为 false
pub fn run_bridge(config: &DaemonConfig, is_running: Arc<AtomicBool>) -> Result<()> {
    let rules = config
        .bridge
        .rules
        .as_deref()
        .context("bridge needs a rule file (--rules or [bridge].rules)")?;
    let matrix = load_matrix(rules)?;

    let bridge = BridgeBuilder::new()
        .interfaces(config.bridge.buses.iter().cloned())
        .matrix(matrix)
        .config(BridgeConfig {
            queue: config.queue.to_queue_config(),
        })
        .receive_timeout(config.receive_timeout())
        .build(is_running.clone())
        .context("Failed to start bridge")?;

    info!("Bridge running on {}", config.bridge.buses.join(", "));

    let status = match config.stats_interval() {
        Some(interval) => {
            let ports = bridge.metrics().to_vec();
            let mut before = vec![LinkMetricsSnapshot::default(); ports.len()];
            Some(spawn_status_loop(interval, is_running.clone(), move |elapsed| {
                for (port, prev) in ports.iter().zip(before.iter_mut()) {
                    *prev = log_port_status(port, prev, elapsed);
                }
            })?)
        },
        None => None,
    };

    while is_running.load(Ordering::Acquire) && !bridge.is_finished() {
        thread::sleep(POLL_INTERVAL);
    }
    is_running.store(false, Ordering::Release);

    let metrics = bridge.metrics().to_vec();
    bridge.join().context("Bridge thread failed")?;
    if let Some(handle) = status {
        let _ = handle.join();
    }

    for port in &metrics {
        let link = port.link.snapshot();
        info!(
            "[{}] total rx_frames={}, tx_frames={}, blocked={}",
            port.name, link.rx_frames, link.tx_frames, link.blocked
        );
    }
    Ok(())
}

/// 运行网关，直到 `is_running` 变为 false
pub fn run_gateway(config: &DaemonConfig, is_running: Arc<AtomicBool>) -> Result<()> {
    let bus = config
        .gateway
        .bus
        .as_deref()
        .context("gateway needs a bus interface (--bus or [gateway].bus)")?;
    let endpoint = Endpoint::from_config(config)?;

    let queue = config.queue.to_queue_config();
    let mut builder = GatewayBuilder::new(bus)
        .config(GatewayConfig {
            line_queue: queue,
            frame_queue: queue,
            ..GatewayConfig::default()
        })
        .receive_timeout(config.receive_timeout());
    if let Some(rules) = config.gateway.rules.as_deref() {
        let matrix = load_matrix(rules)?;
        builder = builder.route(matrix, config.gateway.tcp_conn - 1, config.gateway.bus_conn - 1);
    }
    let mut gateway = builder.build().with_context(|| format!("Failed to open {}", bus))?;

    let status = match config.stats_interval() {
        Some(interval) => {
            let metrics = gateway.metrics().clone();
            let mut before = LinkMetricsSnapshot::default();
            Some(spawn_status_loop(interval, is_running.clone(), move |elapsed| {
                before = log_gateway_status(&metrics, &before, elapsed);
            })?)
        },
        None => None,
    };

    let reconnect = Duration::from_secs(config.gateway.reconnect_secs);
    let result = match &endpoint {
        Endpoint::Connect(addr) => {
            info!("Gateway {} <-> {} (client)", bus, addr);
            client_loop(addr, reconnect, &is_running, |stream| {
                serve(&mut gateway, stream, &is_running)
            })
        },
        Endpoint::Listen(addr) => {
            info!("Gateway {} <-> {} (server)", bus, addr);
            server_loop(addr, &is_running, |stream| serve(&mut gateway, stream, &is_running))
        },
    };

    is_running.store(false, Ordering::Release);
    if let Some(handle) = status {
        let _ = handle.join();
    }

    let link = gateway.metrics().link.snapshot();
    info!(
        "Gateway stopped after {} session(s): rx_frames={}, tx_frames={}, lines={}, decode_errors={}",
        gateway.sessions(),
        link.rx_frames,
        link.tx_frames,
        link.lines,
        link.decode_errors()
    );
    result
}

/// 客户端模式：连接、服务、断开后按间隔重连
fn client_loop<F>(addr: &str, reconnect: Duration, is_running: &AtomicBool, mut serve: F) -> Result<()>
where
    F: FnMut(TcpStream) -> Result<()>,
{
    while is_running.load(Ordering::Acquire) {
        match TcpStream::connect(addr) {
            Ok(stream) => {
                info!("Connected to {}", addr);
                serve(stream)?;
                info!("Disconnected from {}", addr);
            },
            Err(e) => warn!("Failed to connect to {}: {}", addr, e),
        }
        sleep_while_running(reconnect, is_running);
    }
    Ok(())
}

/// 服务端模式：依次接受连接，同一时刻只服务一个对端
fn server_loop<F>(addr: &str, is_running: &AtomicBool, mut serve: F) -> Result<()>
where
    F: FnMut(TcpStream) -> Result<()>,
{
    let listener = TcpListener::bind(addr).with_context(|| format!("Failed to listen on {}", addr))?;
    listener
        .set_nonblocking(true)
        .context("Failed to set listener non-blocking")?;
    info!("Listening on {}", listener.local_addr()?);

    while is_running.load(Ordering::Acquire) {
        match listener.accept() {
            Ok((stream, peer)) => {
                info!("Accepted {}", peer);
                stream
                    .set_nonblocking(false)
                    .context("Failed to set stream blocking")?;
                serve(stream)?;
                info!("Client {} disconnected", peer);
            },
            Err(e) if e.kind() == ErrorKind::WouldBlock => thread::sleep(POLL_INTERVAL),
            Err(e) => {
                error!("Accept failed: {}", e);
                thread::sleep(POLL_INTERVAL);
            },
        }
    }
    Ok(())
}

fn serve<R, T>(
    gateway: &mut Gateway<R, T>,
    stream: TcpStream,
    is_running: &Arc<AtomicBool>,
) -> Result<()>
where
    R: RxAdapter + Send + 'static,
    T: TxAdapter + Send + 'static,
{
    stream.set_nodelay(true)?;
    stream.set_read_timeout(Some(TCP_READ_TIMEOUT))?;
    stream.set_write_timeout(Some(TCP_WRITE_TIMEOUT))?;
    let writer = stream.try_clone().context("Failed to clone TCP stream")?;
    debug!("Starting session {}", gateway.sessions() + 1);
    gateway
        .run_session(stream, writer, is_running)
        .context("Gateway session failed")
}
