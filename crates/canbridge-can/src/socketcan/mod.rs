//! SocketCAN 适配器
//!
//! Linux 内核 CAN 接口的阻塞读写。波特率等由 `ip link` 配置，不在应用层设置。
//!
//! - 支持标准帧、扩展帧和远程帧
//! - 读超时通过 `SO_RCVTIMEO` 实现，读线程借此周期性检查运行标志
//! - 默认关闭 `CAN_RAW_LOOPBACK`：桥接写出的帧不会被本进程再次读到

use crate::{CanAdapter, CanDeviceError, CanDeviceErrorKind, CanError, CanFrame, SplittableAdapter};
use socketcan::{
    CanError as SocketCanError, CanErrorFrame, CanFrame as RawFrame, CanSocket, EmbeddedFrame,
    ExtendedId, Frame, Socket, StandardId,
};
use std::io;
use std::os::unix::io::AsRawFd;
use std::time::Duration;
use tracing::{error, trace, warn};

mod interface_check;
pub mod split;

use interface_check::ensure_interface_up;
pub use split::{SocketCanRxAdapter, SocketCanTxAdapter};

/// 默认读超时
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_millis(50);

/// SocketCAN 适配器
///
/// ```no_run
/// use canbridge_can::{CanAdapter, CanFrame, SocketCanAdapter};
///
/// let mut adapter = SocketCanAdapter::new("vcan0").unwrap();
/// adapter.send(CanFrame::new_standard(0x123, &[1, 2, 3])).unwrap();
/// ```
#[derive(Debug)]
pub struct SocketCanAdapter {
    socket: CanSocket,
    /// 接口名称（如 "can0"）
    interface: String,
    read_timeout: Duration,
}

impl SocketCanAdapter {
    /// 打开接口
    ///
    /// # 错误
    /// - `CanError::Device`: 接口不存在、未 UP 或无法打开
    /// - `CanError::Io`: 设置 socket 选项失败
    pub fn new(interface: impl Into<String>) -> Result<Self, CanError> {
        let interface = interface.into();
        ensure_interface_up(&interface)?;

        let socket = CanSocket::open(&interface).map_err(|e| {
            let kind = if e.kind() == io::ErrorKind::PermissionDenied {
                CanDeviceErrorKind::AccessDenied
            } else {
                CanDeviceErrorKind::Backend
            };
            CanDeviceError::new(
                kind,
                format!("Failed to open CAN interface '{}': {}", interface, e),
            )
        })?;

        disable_loopback(&socket, &interface);

        socket
            .set_read_timeout(DEFAULT_READ_TIMEOUT)
            .map_err(CanError::Io)?;

        trace!("SocketCAN interface '{}' opened", interface);
        Ok(Self {
            socket,
            interface,
            read_timeout: DEFAULT_READ_TIMEOUT,
        })
    }

    pub fn interface(&self) -> &str {
        &self.interface
    }

    pub fn read_timeout(&self) -> Duration {
        self.read_timeout
    }

    pub fn set_read_timeout(&mut self, timeout: Duration) -> Result<(), CanError> {
        self.socket.set_read_timeout(timeout).map_err(CanError::Io)?;
        self.read_timeout = timeout;
        Ok(())
    }
}

/// 禁用回环，失败只告警
fn disable_loopback(socket: &CanSocket, interface: &str) {
    let loopback_enabled: libc::c_int = 0;
    let result = unsafe {
        libc::setsockopt(
            socket.as_raw_fd(),
            libc::SOL_CAN_RAW,
            libc::CAN_RAW_LOOPBACK,
            &loopback_enabled as *const _ as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if result < 0 {
        warn!(
            "Failed to disable CAN_RAW_LOOPBACK on '{}': {}",
            interface,
            io::Error::last_os_error()
        );
    } else {
        trace!("SocketCAN interface '{}' loopback disabled", interface);
    }
}

/// `CanFrame` → socketcan 帧
pub(crate) fn to_raw_frame(frame: &CanFrame) -> Result<RawFrame, CanError> {
    let dlc = frame.len as usize;
    let raw = if frame.is_extended {
        ExtendedId::new(frame.id).and_then(|id| {
            if frame.is_remote {
                RawFrame::new_remote(id, dlc)
            } else {
                RawFrame::new(id, frame.data_slice())
            }
        })
    } else {
        u16::try_from(frame.id)
            .ok()
            .and_then(StandardId::new)
            .and_then(|id| {
                if frame.is_remote {
                    RawFrame::new_remote(id, dlc)
                } else {
                    RawFrame::new(id, frame.data_slice())
                }
            })
    };
    raw.ok_or_else(|| {
        CanDeviceError::new(
            CanDeviceErrorKind::InvalidFrame,
            format!(
                "Cannot build frame: ID=0x{:X}, len={}, extended={}",
                frame.id, frame.len, frame.is_extended
            ),
        )
        .into()
    })
}

/// socketcan 数据/远程帧 → `CanFrame`
pub(crate) fn from_raw_frame(raw: &RawFrame) -> CanFrame {
    let mut data = [0u8; 8];
    let payload = raw.data();
    let copied = payload.len().min(8);
    data[..copied].copy_from_slice(&payload[..copied]);
    let id = if raw.is_extended() {
        raw.raw_id() & 0x1FFF_FFFF
    } else {
        raw.raw_id() & 0x7FF
    };
    CanFrame {
        id,
        data,
        len: raw.dlc().min(8) as u8,
        is_extended: raw.is_extended(),
        is_remote: raw.is_remote_frame(),
    }
}

/// 从 socket 读一帧，跳过可恢复的错误帧
pub(crate) fn read_data_frame(socket: &CanSocket) -> Result<CanFrame, CanError> {
    loop {
        let raw = match socket.read_frame() {
            Ok(raw) => raw,
            Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => {
                return Err(CanError::Timeout);
            },
            Err(e) => return Err(CanError::Io(e)),
        };

        if !raw.is_error_frame() {
            return Ok(from_raw_frame(&raw));
        }

        let Ok(error_frame) = CanErrorFrame::try_from(raw) else {
            warn!("Received CAN error frame but failed to parse, ignoring");
            continue;
        };
        match SocketCanError::from(error_frame) {
            SocketCanError::BusOff => {
                error!("CAN Bus Off error detected");
                return Err(CanError::BusOff);
            },
            SocketCanError::ControllerProblem(problem) => {
                let text = problem.to_string();
                if text.to_lowercase().contains("overflow") {
                    error!("CAN Buffer Overflow detected: {}", problem);
                    return Err(CanError::BufferOverflow);
                }
                warn!("CAN Controller Problem: {}, ignoring", problem);
            },
            other => warn!("CAN Error Frame received: {}, ignoring", other),
        }
    }
}

pub(crate) fn write_frame(socket: &CanSocket, frame: &CanFrame) -> Result<(), CanError> {
    let raw = to_raw_frame(frame)?;
    socket.write_frame(&raw).map_err(CanError::Io)?;
    trace!("Sent CAN frame: ID=0x{:X}, len={}", frame.id, frame.len);
    Ok(())
}

impl CanAdapter for SocketCanAdapter {
    fn send(&mut self, frame: CanFrame) -> Result<(), CanError> {
        write_frame(&self.socket, &frame)
    }

    fn receive(&mut self) -> Result<CanFrame, CanError> {
        read_data_frame(&self.socket)
    }

    fn set_receive_timeout(&mut self, timeout: Duration) {
        if let Err(e) = self.set_read_timeout(timeout) {
            warn!("Failed to set receive timeout: {}", e);
        }
    }
}

impl SplittableAdapter for SocketCanAdapter {
    type RxAdapter = SocketCanRxAdapter;
    type TxAdapter = SocketCanTxAdapter;

    /// 分离为独立的 RX 和 TX 适配器
    ///
    /// 两半通过 `dup()` 共享同一个打开文件描述：严禁对任一半调用 `set_nonblocking()`，
    /// 超时只依赖 `SO_RCVTIMEO`。
    fn split(self) -> Result<(Self::RxAdapter, Self::TxAdapter), CanError> {
        let rx = SocketCanRxAdapter::new(&self.socket, &self.interface, self.read_timeout)?;
        let tx = SocketCanTxAdapter::new(self.socket, self.interface.clone());
        trace!(
            "SocketCanAdapter split into RX and TX adapters (interface: {})",
            self.interface
        );
        Ok((rx, tx))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::process::Command;

    fn can_interface_exists(interface: &str) -> bool {
        Command::new("ip")
            .args(["link", "show", interface])
            .output()
            .map(|o| o.status.success())
            .unwrap_or(false)
    }

    /// 需要 vcan0，不存在则跳过
    macro_rules! require_vcan0 {
        () => {{
            if !can_interface_exists("vcan0") {
                eprintln!("Skipping test: vcan0 interface not available");
                return;
            }
            "vcan0"
        }};
    }

    #[test]
    fn test_frame_conversion_roundtrip() {
        let frames = [
            CanFrame::new_standard(0x123, &[1, 2, 3]),
            CanFrame::new_extended(0x1234_5678, &[0xFF; 8]),
            CanFrame::new_standard(0x7FF, &[]),
        ];
        for frame in frames {
            let raw = to_raw_frame(&frame).unwrap();
            assert_eq!(from_raw_frame(&raw), frame);
        }
    }

    #[test]
    fn test_remote_frame_conversion() {
        let mut frame = CanFrame::new_extended(0x100, &[]).with_remote(true);
        frame.len = 4;
        let raw = to_raw_frame(&frame).unwrap();
        let back = from_raw_frame(&raw);
        assert!(back.is_remote);
        assert!(back.is_extended);
        assert_eq!(back.id, 0x100);
        assert_eq!(back.len, 4);
    }

    #[test]
    fn test_invalid_standard_id_rejected() {
        let mut frame = CanFrame::new_standard(0x1, &[]);
        frame.id = 0x800;
        assert!(matches!(to_raw_frame(&frame), Err(CanError::Device(_))));
    }

    #[test]
    fn test_open_missing_interface() {
        let err = SocketCanAdapter::new("nosuchcan42").unwrap_err();
        assert!(err.is_fatal());
    }

    #[test]
    fn test_vcan_send_receive() {
        let interface = require_vcan0!();
        let mut tx = SocketCanAdapter::new(interface).unwrap();
        let mut rx = SocketCanAdapter::new(interface).unwrap();
        rx.set_read_timeout(Duration::from_millis(200)).unwrap();

        let frame = CanFrame::new_extended(0x1AB_CDEF, &[9, 8, 7]);
        tx.send(frame).unwrap();
        loop {
            match rx.receive() {
                Ok(received) if received == frame => break,
                Ok(_) => continue,
                Err(e) => panic!("receive failed: {}", e),
            }
        }
    }

    #[test]
    fn test_vcan_receive_timeout() {
        let interface = require_vcan0!();
        let mut adapter = SocketCanAdapter::new(interface).unwrap();
        adapter.set_read_timeout(Duration::from_millis(5)).unwrap();
        // 总线上可能有其他流量，只检查不会永久阻塞
        for _ in 0..1000 {
            if let Err(CanError::Timeout) = adapter.receive() {
                return;
            }
        }
    }
}
