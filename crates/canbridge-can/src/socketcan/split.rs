//! SocketCAN 适配器分离实现
//!
//! RX 半边持有 `try_clone()` 得到的 socket，TX 半边持有原 socket。
//! 两者共享打开文件描述，因此只能用 `SO_RCVTIMEO` 控制超时。

use super::{read_data_frame, write_frame};
use crate::{CanError, CanFrame, RxAdapter, TxAdapter};
use socketcan::{CanSocket, Socket};
use std::os::fd::AsFd;
use std::time::Duration;

/// 只读适配器（RX 线程）
#[derive(Debug)]
pub struct SocketCanRxAdapter {
    socket: CanSocket,
    interface: String,
    read_timeout: Duration,
}

impl SocketCanRxAdapter {
    pub(crate) fn new(
        socket: &CanSocket,
        interface: &str,
        read_timeout: Duration,
    ) -> Result<Self, CanError> {
        let rx_socket = socket.as_fd().try_clone_to_owned().map(CanSocket::from).map_err(|e| {
            CanError::Io(std::io::Error::other(format!(
                "Failed to clone SocketCAN socket for RX: {}",
                e
            )))
        })?;
        rx_socket.set_read_timeout(read_timeout).map_err(CanError::Io)?;

        Ok(Self {
            socket: rx_socket,
            interface: interface.to_string(),
            read_timeout,
        })
    }

    pub fn interface(&self) -> &str {
        &self.interface
    }

    pub fn read_timeout(&self) -> Duration {
        self.read_timeout
    }
}

impl RxAdapter for SocketCanRxAdapter {
    fn receive(&mut self) -> Result<CanFrame, CanError> {
        read_data_frame(&self.socket)
    }
}

/// 只写适配器（drain 线程）
#[derive(Debug)]
pub struct SocketCanTxAdapter {
    socket: CanSocket,
    interface: String,
}

impl SocketCanTxAdapter {
    pub(crate) fn new(socket: CanSocket, interface: String) -> Self {
        Self { socket, interface }
    }

    pub fn interface(&self) -> &str {
        &self.interface
    }
}

impl TxAdapter for SocketCanTxAdapter {
    fn send(&mut self, frame: CanFrame) -> Result<(), CanError> {
        write_frame(&self.socket, &frame)
    }
}
