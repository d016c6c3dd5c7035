//! Builder 模式实现
//!
//! 通过接口名链式构造 SocketCAN 上的桥接和网关。

use crate::bridge::{Bridge, BridgeConfig, BusPort};
use crate::error::DriverError;
use crate::gateway::{Gateway, GatewayConfig};
use crate::pipeline::FilterRoute;
use canbridge_filter::FilterMatrix;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::time::Duration;

#[cfg(target_os = "linux")]
use canbridge_can::{SocketCanAdapter, SocketCanRxAdapter, SocketCanTxAdapter, SplittableAdapter};

/// 读线程检查运行标志的默认间隔
pub const DEFAULT_RECEIVE_TIMEOUT: Duration = Duration::from_millis(50);

/// 桥接 Builder
///
/// ```no_run
/// use canbridge_driver::BridgeBuilder;
/// use canbridge_filter::FilterMatrix;
/// use std::sync::Arc;
/// use std::sync::atomic::AtomicBool;
///
/// let matrix = Arc::new(FilterMatrix::load("bridge.rules").unwrap());
/// let bridge = BridgeBuilder::new()
///     .interface("can0")
///     .interface("can1")
///     .matrix(matrix)
///     .build(Arc::new(AtomicBool::new(true)))
///     .unwrap();
/// ```
#[derive(Debug, Default)]
pub struct BridgeBuilder {
    interfaces: Vec<String>,
    matrix: Option<Arc<FilterMatrix>>,
    config: BridgeConfig,
    receive_timeout: Option<Duration>,
}

impl BridgeBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// 追加一条总线，顺序即连接号
    pub fn interface(mut self, interface: impl Into<String>) -> Self {
        self.interfaces.push(interface.into());
        self
    }

    pub fn interfaces<I, S>(mut self, interfaces: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.interfaces.extend(interfaces.into_iter().map(Into::into));
        self
    }

    pub fn matrix(mut self, matrix: Arc<FilterMatrix>) -> Self {
        self.matrix = Some(matrix);
        self
    }

    pub fn config(mut self, config: BridgeConfig) -> Self {
        self.config = config;
        self
    }

    /// 设置接收超时（可选，默认 50ms）
    pub fn receive_timeout(mut self, timeout: Duration) -> Self {
        self.receive_timeout = Some(timeout);
        self
    }

    /// 检查总线数量与矩阵是否一致，不打开设备
    pub fn validate(&self) -> Result<&Arc<FilterMatrix>, DriverError> {
        let matrix = self
            .matrix
            .as_ref()
            .ok_or_else(|| DriverError::InvalidConfig("bridge needs a rule matrix".into()))?;
        if self.interfaces.len() != matrix.n() {
            return Err(DriverError::InvalidConfig(format!(
                "{} interfaces given, rule matrix expects {}",
                self.interfaces.len(),
                matrix.n()
            )));
        }
        if let Some((i, name)) = self
            .interfaces
            .iter()
            .enumerate()
            .find(|(i, name)| self.interfaces[..*i].contains(*name))
        {
            return Err(DriverError::InvalidConfig(format!(
                "interface '{}' listed twice (connection {})",
                name,
                i + 1
            )));
        }
        Ok(matrix)
    }

    /// 打开所有接口并启动桥接
    #[cfg(target_os = "linux")]
    pub fn build(
        self,
        is_running: Arc<AtomicBool>,
    ) -> Result<Bridge<SocketCanRxAdapter, SocketCanTxAdapter>, DriverError> {
        let matrix = self.validate()?.clone();
        let timeout = self.receive_timeout.unwrap_or(DEFAULT_RECEIVE_TIMEOUT);

        let ports = self
            .interfaces
            .iter()
            .map(|name| {
                let (rx, tx) = open_split(name, timeout)?;
                Ok(BusPort::new(name.clone(), rx, tx))
            })
            .collect::<Result<Vec<_>, DriverError>>()?;

        Bridge::spawn(ports, matrix, &self.config, is_running)
    }
}

/// 网关 Builder
#[derive(Debug)]
pub struct GatewayBuilder {
    interface: String,
    config: GatewayConfig,
    route: Option<(Arc<FilterMatrix>, usize, usize)>,
    receive_timeout: Option<Duration>,
}

impl GatewayBuilder {
    pub fn new(interface: impl Into<String>) -> Self {
        Self {
            interface: interface.into(),
            config: GatewayConfig::default(),
            route: None,
            receive_timeout: None,
        }
    }

    pub fn config(mut self, config: GatewayConfig) -> Self {
        self.config = config;
        self
    }

    /// 启用过滤，连接号从 0 开始
    pub fn route(mut self, matrix: Arc<FilterMatrix>, tcp_conn: usize, bus_conn: usize) -> Self {
        self.route = Some((matrix, tcp_conn, bus_conn));
        self
    }

    pub fn receive_timeout(mut self, timeout: Duration) -> Self {
        self.receive_timeout = Some(timeout);
        self
    }

    /// 检查路由，不打开设备
    pub fn validate(&self) -> Result<Option<FilterRoute>, DriverError> {
        match &self.route {
            None => Ok(None),
            Some((matrix, tcp_conn, bus_conn)) => {
                if tcp_conn == bus_conn {
                    return Err(DriverError::InvalidConfig(format!(
                        "TCP and bus share connection {}",
                        tcp_conn + 1
                    )));
                }
                Ok(Some(FilterRoute::new(matrix.clone(), *tcp_conn, *bus_conn)?))
            },
        }
    }

    #[cfg(target_os = "linux")]
    pub fn build(self) -> Result<Gateway<SocketCanRxAdapter, SocketCanTxAdapter>, DriverError> {
        let route = self.validate()?;
        let timeout = self.receive_timeout.unwrap_or(DEFAULT_RECEIVE_TIMEOUT);
        let (rx, tx) = open_split(&self.interface, timeout)?;
        let gateway = Gateway::new(rx, tx, self.config);
        Ok(match route {
            Some(route) => gateway.with_route(route),
            None => gateway,
        })
    }
}

#[cfg(target_os = "linux")]
fn open_split(
    interface: &str,
    timeout: Duration,
) -> Result<(SocketCanRxAdapter, SocketCanTxAdapter), DriverError> {
    let mut adapter = SocketCanAdapter::new(interface)?;
    adapter.set_read_timeout(timeout)?;
    Ok(adapter.split()?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use canbridge_filter::{PairRule, RuleKind};

    fn matrix(n: usize) -> Arc<FilterMatrix> {
        let rules = (0..n * n)
            .map(|_| PairRule::empty(RuleKind::BlockOnMatch))
            .collect();
        Arc::new(FilterMatrix::new(n, rules).unwrap())
    }

    #[test]
    fn test_bridge_builder_requires_matrix() {
        let builder = BridgeBuilder::new().interfaces(["can0", "can1"]);
        assert!(matches!(builder.validate(), Err(DriverError::InvalidConfig(_))));
    }

    #[test]
    fn test_bridge_builder_bus_count_mismatch() {
        let builder = BridgeBuilder::new()
            .interface("can0")
            .interface("can1")
            .matrix(matrix(3));
        let err = builder.validate().unwrap_err();
        assert!(err.to_string().contains("expects 3"), "{}", err);
    }

    #[test]
    fn test_bridge_builder_duplicate_interface() {
        let builder = BridgeBuilder::new()
            .interfaces(["can0", "can0"])
            .matrix(matrix(2));
        assert!(matches!(builder.validate(), Err(DriverError::InvalidConfig(_))));
    }

    #[test]
    fn test_bridge_builder_valid() {
        let builder = BridgeBuilder::new()
            .interfaces(vec!["can0".to_string(), "can1".to_string()])
            .matrix(matrix(2));
        assert_eq!(builder.validate().unwrap().n(), 2);
    }

    #[test]
    fn test_gateway_builder_route_validation() {
        assert!(GatewayBuilder::new("can0").validate().unwrap().is_none());

        let same = GatewayBuilder::new("can0").route(matrix(2), 1, 1);
        assert!(matches!(same.validate(), Err(DriverError::InvalidConfig(_))));

        let out_of_range = GatewayBuilder::new("can0").route(matrix(2), 0, 2);
        assert!(matches!(out_of_range.validate(), Err(DriverError::Filter(_))));

        let ok = GatewayBuilder::new("can0").route(matrix(3), 0, 2);
        let route = ok.validate().unwrap().unwrap();
        assert_eq!((route.in_conn(), route.out_conn()), (0, 2));
    }
}
