//! IO 循环
//!
//! 读线程的主循环和两个 sink：
//! - 总线 → 线路：接收 CAN 帧，编码为十六进制行，入行队列
//! - 线路 → 总线：TCP 字节分行、解码、过滤，入帧队列
//! - 总线 → 总线：对每个目标总线查规则矩阵，转发（可能改写 ID）
//!
//! 所有读循环都依赖接收超时周期性检查运行标志。

use crate::line::{LineExtractor, LineStats};
use crate::metrics::LinkMetrics;
use crate::queue::{QueueError, QueueProducer, SharedProducer, Sink, SinkError};
use canbridge_can::{CanError, RxAdapter, TxAdapter};
use canbridge_filter::{FilterError, FilterMatrix, LookupResult};
use canbridge_protocol::{CanFrame, HexEncoder, WireLine, decode};
use std::io::{self, Read, Write};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;
use tracing::{debug, error, trace, warn};

/// TCP 单次读取的缓冲区大小
pub const READ_CHUNK: usize = 1024;

/// 运行标志
///
/// `process` 为进程级标志（Ctrl+C、总线致命错误）；`session` 只管一次 TCP 会话，
/// 对端断开时置 false，不影响进程。
#[derive(Debug, Clone)]
pub struct RunFlags {
    pub process: Arc<AtomicBool>,
    pub session: Arc<AtomicBool>,
}

impl RunFlags {
    pub fn new(process: Arc<AtomicBool>) -> Self {
        Self {
            process,
            session: Arc::new(AtomicBool::new(true)),
        }
    }

    pub fn is_running(&self) -> bool {
        // Acquire: 看到 false 时也能看到停止前的所有写入
        self.process.load(Ordering::Acquire) && self.session.load(Ordering::Acquire)
    }

    pub fn stop_session(&self) {
        self.session.store(false, Ordering::Release);
    }

    pub fn stop_process(&self) {
        self.process.store(false, Ordering::Release);
    }
}

/// 单向过滤路由：帧从 `in_conn` 进，往 `out_conn` 出
#[derive(Debug, Clone)]
pub struct FilterRoute {
    matrix: Arc<FilterMatrix>,
    in_conn: usize,
    out_conn: usize,
}

impl FilterRoute {
    /// 连接号从 0 开始
    pub fn new(matrix: Arc<FilterMatrix>, in_conn: usize, out_conn: usize) -> Result<Self, FilterError> {
        if matrix.rule(in_conn, out_conn).is_none() {
            return Err(FilterError::ConnectionOutOfRange {
                in_conn,
                out_conn,
                n: matrix.n(),
            });
        }
        Ok(Self {
            matrix,
            in_conn,
            out_conn,
        })
    }

    /// 反方向路由
    pub fn reversed(&self) -> Self {
        Self {
            matrix: self.matrix.clone(),
            in_conn: self.out_conn,
            out_conn: self.in_conn,
        }
    }

    pub fn in_conn(&self) -> usize {
        self.in_conn
    }

    pub fn out_conn(&self) -> usize {
        self.out_conn
    }

    /// 查表并计数，返回应转发的帧（可能已替换 ID），阻止时返回 `None`
    pub fn apply(&self, frame: &CanFrame, metrics: &LinkMetrics) -> Result<Option<CanFrame>, FilterError> {
        let result = self
            .matrix
            .decide(frame.packed_id(), self.in_conn, self.out_conn)?;
        metrics.record_lookup(&result);
        Ok(forward(frame, result))
    }
}

fn forward(frame: &CanFrame, result: LookupResult) -> Option<CanFrame> {
    match result {
        LookupResult::Block => None,
        LookupResult::Pass => Some(*frame),
        LookupResult::PassTranslated(packed_id) => Some(frame.with_packed_id(packed_id)),
    }
}

/// 连续非致命接收错误之间的退避
const RX_ERROR_BACKOFF: Duration = Duration::from_millis(10);

/// 连续错误时每隔多少次记一条日志
const RX_ERROR_LOG_EVERY: u32 = 100;

/// 总线接收错误处理
///
/// 非致命错误（如接口掉线时的 ENETDOWN）可能每次读都会返回，
/// 这里退避并限制日志量，避免空转刷屏。
#[derive(Debug, Default)]
struct RxErrorThrottle {
    consecutive: u32,
}

impl RxErrorThrottle {
    /// 返回 false 表示应退出循环
    fn on_error(&mut self, name: &str, e: CanError, flags: &RunFlags) -> bool {
        if e.is_fatal() {
            error!("{}: fatal CAN error: {}, setting is_running = false", name, e);
            flags.stop_process();
            return false;
        }
        self.consecutive = self.consecutive.saturating_add(1);
        if self.consecutive == 1 || self.consecutive % RX_ERROR_LOG_EVERY == 0 {
            warn!(
                "{}: CAN receive error ({} in a row): {}",
                name, self.consecutive, e
            );
        }
        thread::sleep(RX_ERROR_BACKOFF);
        true
    }

    fn on_frame(&mut self, name: &str) {
        if self.consecutive > 0 {
            debug!("{}: receive recovered after {} errors", name, self.consecutive);
            self.consecutive = 0;
        }
    }
}

/// 总线 → 线路
///
/// 返回 RX 适配器，供下一次会话复用。
pub fn bus_to_line_loop<R: RxAdapter>(
    mut rx: R,
    mut encoder: HexEncoder,
    mut producer: QueueProducer<WireLine>,
    route: Option<FilterRoute>,
    metrics: Arc<LinkMetrics>,
    flags: RunFlags,
) -> R {
    let mut errors = RxErrorThrottle::default();
    while flags.is_running() {
        let frame = match rx.receive() {
            Ok(frame) => {
                errors.on_frame("bus-rx");
                metrics.rx_frames.fetch_add(1, Ordering::Relaxed);
                frame
            },
            Err(CanError::Timeout) => continue,
            Err(e) => {
                if errors.on_error("bus-rx", e, &flags) {
                    continue;
                }
                break;
            },
        };

        let frame = match &route {
            Some(route) => match route.apply(&frame, &metrics) {
                Ok(Some(frame)) => frame,
                Ok(None) => continue,
                Err(e) => {
                    error!("bus-rx: filter lookup failed: {}", e);
                    continue;
                },
            },
            None => frame,
        };

        let line = match encoder.encode(&frame) {
            Ok(line) => line,
            Err(e) => {
                metrics.encode_errors.fetch_add(1, Ordering::Relaxed);
                warn!("bus-rx: dropping frame 0x{:X}: {}", frame.id, e);
                continue;
            },
        };

        match producer.push(line) {
            Ok(()) => {},
            Err(QueueError::Full) => debug!("bus-rx: line queue full, dropping line"),
            Err(QueueError::Closed) => {
                debug!("bus-rx: line queue closed, ending session");
                flags.stop_session();
                break;
            },
        }
    }

    trace!("bus-rx: loop exited");
    rx
}

/// 线路 → 总线
///
/// `reader` 应设置读超时（TCP `set_read_timeout`），超时返回 `WouldBlock`/`TimedOut`。
/// 对端关闭或读失败时结束会话。
pub fn line_to_bus_loop<S: Read>(
    mut reader: S,
    mut extractor: LineExtractor,
    mut producer: QueueProducer<CanFrame>,
    route: Option<FilterRoute>,
    metrics: Arc<LinkMetrics>,
    flags: RunFlags,
) {
    let mut buf = [0u8; READ_CHUNK];
    let mut reported = LineStats::default();

    'session: while flags.is_running() {
        let n = match reader.read(&mut buf) {
            Ok(0) => {
                debug!("tcp-rx: peer closed connection");
                break;
            },
            Ok(n) => n,
            Err(e)
                if matches!(
                    e.kind(),
                    io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut | io::ErrorKind::Interrupted
                ) =>
            {
                continue;
            },
            Err(e) => {
                warn!("tcp-rx: read failed: {}", e);
                break;
            },
        };

        extractor.feed(&buf[..n]);
        while let Some(line) = extractor.try_extract_line() {
            let decoded = match decode(line) {
                Ok(decoded) => decoded,
                Err(e) => {
                    metrics.record_decode_error(&e);
                    debug!("tcp-rx: dropping line (code {}): {}", e.code(), e);
                    continue;
                },
            };

            let frame = match &route {
                Some(route) => match route.apply(&decoded.frame, &metrics) {
                    Ok(Some(frame)) => frame,
                    Ok(None) => continue,
                    Err(e) => {
                        error!("tcp-rx: filter lookup failed: {}", e);
                        continue;
                    },
                },
                None => decoded.frame,
            };

            match producer.push(frame) {
                Ok(()) => {},
                Err(QueueError::Full) => debug!("tcp-rx: frame queue full, dropping frame"),
                Err(QueueError::Closed) => {
                    debug!("tcp-rx: frame queue closed");
                    break 'session;
                },
            }
        }

        let stats = extractor.stats();
        metrics.add_line_stats(&stats.since(&reported));
        reported = stats;
    }

    let stats = extractor.stats();
    metrics.add_line_stats(&stats.since(&reported));
    flags.stop_session();
    trace!("tcp-rx: loop exited");
}

/// 总线 → 其他总线
///
/// `outputs` 为 (目标连接号, 目标总线帧队列)，按连接号顺序逐个判定。
pub fn bridge_rx_loop<R: RxAdapter>(
    conn: usize,
    mut rx: R,
    matrix: Arc<FilterMatrix>,
    outputs: Vec<(usize, SharedProducer<CanFrame>)>,
    metrics: Arc<LinkMetrics>,
    flags: RunFlags,
) -> R {
    let name = format!("bridge-rx-{}", conn);

    let mut errors = RxErrorThrottle::default();
    while flags.is_running() {
        let frame = match rx.receive() {
            Ok(frame) => {
                errors.on_frame(&name);
                metrics.rx_frames.fetch_add(1, Ordering::Relaxed);
                frame
            },
            Err(CanError::Timeout) => continue,
            Err(e) => {
                if errors.on_error(&name, e, &flags) {
                    continue;
                }
                break;
            },
        };

        let packed_id = frame.packed_id();
        for (out_conn, producer) in &outputs {
            let result = match matrix.decide(packed_id, conn, *out_conn) {
                Ok(result) => result,
                Err(e) => {
                    error!("{}: filter lookup failed: {}", name, e);
                    continue;
                },
            };
            metrics.record_lookup(&result);
            let Some(out_frame) = forward(&frame, result) else {
                trace!(
                    "{}: blocked 0x{:08X} -> conn {}",
                    name, packed_id, out_conn
                );
                continue;
            };
            match producer.push(out_frame) {
                Ok(()) => {},
                Err(QueueError::Full) => {
                    debug!("{}: queue for conn {} full, dropping frame", name, out_conn)
                },
                Err(QueueError::Closed) => {
                    debug!("{}: queue for conn {} closed", name, out_conn)
                },
            }
        }
    }

    trace!("{}: loop exited", name);
    rx
}

/// 写 CAN 总线的 sink
#[derive(Debug)]
pub struct BusSink<T> {
    tx: T,
    metrics: Arc<LinkMetrics>,
}

impl<T: TxAdapter> BusSink<T> {
    pub fn new(tx: T, metrics: Arc<LinkMetrics>) -> Self {
        Self { tx, metrics }
    }

    pub fn into_inner(self) -> T {
        self.tx
    }
}

impl<T: TxAdapter + Send> Sink<CanFrame> for BusSink<T> {
    fn deliver(&mut self, frame: &CanFrame) -> Result<(), SinkError> {
        self.tx.send(*frame)?;
        self.metrics.tx_frames.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

/// 写 TCP 的 sink
///
/// 记录当前行已写出的字节数：部分写入后超时重试时只发送剩余部分，
/// 保证对端收到的字节流与行完全一致。
#[derive(Debug)]
pub struct LineWriter<W> {
    writer: W,
    written: usize,
}

impl<W: Write> LineWriter<W> {
    pub fn new(writer: W) -> Self {
        Self { writer, written: 0 }
    }

    pub fn into_inner(self) -> W {
        self.writer
    }
}

impl<W: Write + Send> Sink<WireLine> for LineWriter<W> {
    fn deliver(&mut self, line: &WireLine) -> Result<(), SinkError> {
        let bytes = line.as_bytes();
        while self.written < bytes.len() {
            match self.writer.write(&bytes[self.written..]) {
                Ok(0) => return Err(io::Error::from(io::ErrorKind::WriteZero).into()),
                Ok(n) => self.written += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {},
                Err(e) => return Err(e.into()),
            }
        }
        // flush 失败重试时不再重写已写出的字节
        self.writer.flush()?;
        self.written = 0;
        Ok(())
    }

    fn abandon(&mut self) {
        if self.written > 0 {
            warn!("tcp-tx: abandoning line after {} bytes written", self.written);
        }
        self.written = 0;
    }
}
