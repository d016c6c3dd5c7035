//! # CAN Bridge Adapter Layer
//!
//! CAN 硬件抽象层：桥接/网关循环只依赖这里的 trait，
//! 真实总线由 Linux SocketCAN 后端提供，测试中使用 mock 适配器。

use std::time::Duration;
use thiserror::Error;

// 重新导出协议层的帧类型
pub use canbridge_protocol::CanFrame;

#[cfg(target_os = "linux")]
pub mod socketcan;

#[cfg(target_os = "linux")]
pub use socketcan::{SocketCanAdapter, SocketCanRxAdapter, SocketCanTxAdapter};

/// CAN 适配层统一错误类型
#[derive(Error, Debug)]
pub enum CanError {
    #[error("IO Error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Device Error: {0}")]
    Device(#[from] CanDeviceError),
    #[error("Read timeout")]
    Timeout,
    #[error("Buffer overflow")]
    BufferOverflow,
    #[error("Bus off")]
    BusOff,
    #[error("Device not started")]
    NotStarted,
}

impl CanError {
    /// 致命错误：读写线程应停止整个会话
    pub fn is_fatal(&self) -> bool {
        match self {
            CanError::Device(e) => e.is_fatal(),
            CanError::BufferOverflow | CanError::BusOff | CanError::NotStarted => true,
            CanError::Io(_) | CanError::Timeout => false,
        }
    }
}

/// 设备/后端错误的结构化分类
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CanDeviceErrorKind {
    Unknown,
    NotFound,
    NotUp,
    AccessDenied,
    InvalidFrame,
    Backend,
}

/// 结构化设备错误
#[derive(Error, Debug, Clone)]
#[error("{kind:?}: {message}")]
pub struct CanDeviceError {
    pub kind: CanDeviceErrorKind,
    pub message: String,
}

impl CanDeviceError {
    pub fn new(kind: CanDeviceErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn is_fatal(&self) -> bool {
        matches!(
            self.kind,
            CanDeviceErrorKind::NotFound
                | CanDeviceErrorKind::NotUp
                | CanDeviceErrorKind::AccessDenied
        )
    }
}

impl From<String> for CanDeviceError {
    fn from(message: String) -> Self {
        Self::new(CanDeviceErrorKind::Unknown, message)
    }
}

impl From<&str> for CanDeviceError {
    fn from(message: &str) -> Self {
        Self::new(CanDeviceErrorKind::Unknown, message)
    }
}

pub trait CanAdapter {
    fn send(&mut self, frame: CanFrame) -> Result<(), CanError>;
    /// 阻塞直到收到帧或读超时（`CanError::Timeout`）
    fn receive(&mut self) -> Result<CanFrame, CanError>;
    fn set_receive_timeout(&mut self, _timeout: Duration) {}
}

/// 只读半边（RX 线程）
pub trait RxAdapter {
    fn receive(&mut self) -> Result<CanFrame, CanError>;
}

/// 只写半边（TX / drain 线程）
pub trait TxAdapter {
    fn send(&mut self, frame: CanFrame) -> Result<(), CanError>;
}

pub trait SplittableAdapter: CanAdapter {
    type RxAdapter: RxAdapter;
    type TxAdapter: TxAdapter;
    fn split(self) -> Result<(Self::RxAdapter, Self::TxAdapter), CanError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_classification() {
        assert!(!CanError::Timeout.is_fatal());
        assert!(!CanError::Io(std::io::Error::other("x")).is_fatal());
        assert!(CanError::BusOff.is_fatal());
        assert!(CanError::BufferOverflow.is_fatal());
        assert!(
            CanError::Device(CanDeviceError::new(CanDeviceErrorKind::NotFound, "can9")).is_fatal()
        );
        assert!(!CanError::Device("odd frame".into()).is_fatal());
    }

    #[test]
    fn test_device_error_display() {
        let e = CanDeviceError::new(CanDeviceErrorKind::NotUp, "can0 is down");
        assert_eq!(e.to_string(), "NotUp: can0 is down");
        let e = CanError::from(e);
        assert!(e.to_string().starts_with("Device Error"));
    }
}
