//! canbridged 主入口
//!
//! 两种模式：
//! - `bridge`：N 条 CAN 总线之间按规则矩阵转发
//! - `gateway`：一条 CAN 总线与一个 TCP 对端之间以十六进制文本行互通

mod config;
mod daemon;

use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand};
use config::{DaemonConfig, OverflowSetting};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// CAN 总线桥接 / TCP 网关守护进程
#[derive(Parser, Debug)]
#[command(name = "canbridged", version)]
#[command(about = "CAN bus bridge and TCP gateway daemon", long_about = None)]
struct Cli {
    /// 配置文件（TOML），命令行参数优先
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// 输出调试日志（RUST_LOG 优先）
    #[arg(short, long, global = true)]
    verbose: bool,

    /// 统计日志间隔（秒），0 关闭
    #[arg(long, global = true)]
    stats_interval: Option<u64>,

    /// 每个输出队列的容量
    #[arg(long, global = true)]
    queue_capacity: Option<usize>,

    /// 队列满时的策略
    #[arg(long, global = true, value_enum)]
    overflow: Option<OverflowSetting>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// 在多条 CAN 总线之间转发
    Bridge(BridgeArgs),
    /// 在一条 CAN 总线和 TCP 之间转发
    Gateway(GatewayArgs),
}

#[derive(Args, Debug)]
struct BridgeArgs {
    /// 规则文件
    #[arg(short, long)]
    rules: Option<PathBuf>,

    /// CAN 接口，按连接号顺序重复给出
    ///
    /// 例如: --bus can0 --bus can1 --bus can2
    #[arg(short, long = "bus")]
    buses: Vec<String>,
}

#[derive(Args, Debug)]
struct GatewayArgs {
    /// CAN 接口
    #[arg(short, long)]
    bus: Option<String>,

    /// 客户端模式：连接到 HOST:PORT
    #[arg(long, conflicts_with = "listen")]
    connect: Option<String>,

    /// 服务端模式：监听 ADDR:PORT
    #[arg(long)]
    listen: Option<String>,

    /// 规则文件（可选，不给则不过滤）
    #[arg(short, long)]
    rules: Option<PathBuf>,

    /// TCP 侧连接号（从 1 开始）
    #[arg(long)]
    tcp_conn: Option<usize>,

    /// 总线侧连接号（从 1 开始）
    #[arg(long)]
    bus_conn: Option<usize>,

    /// 客户端模式断线重连间隔（秒）
    #[arg(long)]
    reconnect: Option<u64>,
}

impl Cli {
    /// 加载配置文件并应用命令行覆盖
    fn resolve_config(&self) -> Result<DaemonConfig> {
        let mut config = match &self.config {
            Some(path) => DaemonConfig::load(path)?,
            None => DaemonConfig::default(),
        };

        if let Some(secs) = self.stats_interval {
            config.stats_interval_secs = secs;
        }
        if let Some(capacity) = self.queue_capacity {
            config.queue.capacity = capacity;
        }
        if let Some(overflow) = self.overflow {
            config.queue.overflow = overflow;
        }

        match &self.command {
            Command::Bridge(args) => {
                if args.rules.is_some() {
                    config.bridge.rules = args.rules.clone();
                }
                if !args.buses.is_empty() {
                    config.bridge.buses = args.buses.clone();
                }
                if config.bridge.buses.is_empty() {
                    bail!("bridge needs at least one --bus");
                }
            },
            Command::Gateway(args) => {
                let gateway = &mut config.gateway;
                if args.bus.is_some() {
                    gateway.bus = args.bus.clone();
                }
                if args.rules.is_some() {
                    gateway.rules = args.rules.clone();
                }
                // 命令行指定一种模式时覆盖配置文件中的另一种
                if args.connect.is_some() {
                    gateway.connect = args.connect.clone();
                    gateway.listen = None;
                } else if args.listen.is_some() {
                    gateway.listen = args.listen.clone();
                    gateway.connect = None;
                }
                if let Some(conn) = args.tcp_conn {
                    gateway.tcp_conn = conn;
                }
                if let Some(conn) = args.bus_conn {
                    gateway.bus_conn = conn;
                }
                if let Some(secs) = args.reconnect {
                    gateway.reconnect_secs = secs;
                }
            },
        }

        config.validate()?;
        Ok(config)
    }
}

fn init_logging(verbose: bool) {
    let level = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!(
            "canbridged={0},canbridge_driver={0},canbridge_can={0},canbridge_filter={0}",
            level
        ))
    });
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_thread_names(true)
        .init();
}

fn run(cli: Cli) -> Result<()> {
    let config = cli.resolve_config()?;

    let is_running = Arc::new(AtomicBool::new(true));
    let interrupted = Arc::new(AtomicBool::new(false));
    {
        let is_running = is_running.clone();
        let interrupted = interrupted.clone();
        ctrlc::set_handler(move || {
            info!("Received interrupt signal. Shutting down...");
            interrupted.store(true, Ordering::Release);
            is_running.store(false, Ordering::Release);
        })
        .context("Failed to set signal handler")?;
    }

    match cli.command {
        Command::Bridge(_) => daemon::run_bridge(&config, is_running)?,
        Command::Gateway(_) => daemon::run_gateway(&config, is_running)?,
    }

    // 停止标志由工作线程清除说明总线出现了致命错误
    if !interrupted.load(Ordering::Acquire) {
        bail!("stopped after a fatal bus error");
    }
    Ok(())
}

fn main() {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    if let Err(e) = run(cli) {
        error!("{:#}", e);
        std::process::exit(1);
    }
}
