//! 驱动层错误类型定义

use crate::queue::QueueError;
use canbridge_can::CanError;
use canbridge_filter::FilterError;
use canbridge_protocol::{DecodeError, EncodeError};
use thiserror::Error;

/// 驱动层错误类型
#[derive(Error, Debug)]
pub enum DriverError {
    /// CAN 驱动错误
    #[error("CAN driver error: {0}")]
    Can(#[from] CanError),

    /// 线路解码错误
    #[error("Decode error: {0}")]
    Decode(#[from] DecodeError),

    /// 帧编码错误
    #[error("Encode error: {0}")]
    Encode(#[from] EncodeError),

    /// 规则表错误
    #[error("Filter error: {0}")]
    Filter(#[from] FilterError),

    /// 输出队列错误
    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    /// TCP / 文件 IO 错误
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// 线程创建失败
    #[error("Failed to spawn thread: {0}")]
    ThreadSpawn(String),

    /// 线程 panic（join 时发现）
    #[error("Thread panicked: {0}")]
    ThreadPanicked(String),

    /// 无效配置（如总线数量与规则矩阵不一致）
    #[error("Invalid config: {0}")]
    InvalidConfig(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_driver_error_display() {
        let msg = DriverError::Can(CanError::Timeout).to_string();
        assert!(msg.contains("CAN driver error"), "{}", msg);

        let msg = DriverError::Decode(DecodeError::TooShort { len: 3 }).to_string();
        assert!(msg.starts_with("Decode error"), "{}", msg);

        let msg = DriverError::Queue(QueueError::Closed).to_string();
        assert!(msg.contains("closed"), "{}", msg);

        let msg = DriverError::InvalidConfig("2 buses, matrix expects 3".into()).to_string();
        assert!(msg.contains("matrix expects 3"));
    }

    #[test]
    fn test_driver_error_from_conversions() {
        let err: DriverError = FilterError::MissingMatrixSize.into();
        assert!(matches!(err, DriverError::Filter(_)));

        let err: DriverError = EncodeError::IllegalDlc { dlc: 9 }.into();
        assert!(matches!(err, DriverError::Encode(_)));

        let err: DriverError = std::io::Error::other("boom").into();
        assert!(matches!(err, DriverError::Io(_)));
    }
}
