//! # CAN Bridge Protocol
//!
//! CAN 帧模型与 ASCII-hex 行协议编解码（无硬件依赖）
//!
//! ## 模块
//!
//! - `id`: socket 形式 ID 与 packed（左对齐）形式 ID 的相互转换
//! - `codec`: 带校验和的 ASCII-hex 行编解码
//!
//! ## ID 的两种表示
//!
//! - **socket 形式**：Linux `can_frame.can_id`，低位对齐，`0x8000_0000` 为扩展帧标志，
//!   `0x4000_0000` 为远程帧标志
//! - **packed 形式**：线上格式和规则文件使用的左对齐 32 位值，bit 2 为 IDE，bit 1 为 RTR

pub mod codec;
pub mod id;

pub use codec::{
    CHECKSUM_SEED, DecodeError, DecodedLine, EncodeError, HexEncoder, MAX_LINE_LEN, MIN_LINE_LEN,
    WireLine, decode, fold_checksum,
};
pub use id::{
    CAN_EFF_FLAG, CAN_EFF_MASK, CAN_RTR_FLAG, CAN_SFF_MASK, PACKED_IDE_BIT, PACKED_RTR_BIT,
    packed_id_from_hex, packed_id_is_legal, packed_id_to_hex, packed_to_socket, socket_to_packed,
};

/// 经典 CAN 帧的最大数据长度
pub const CAN_MAX_DLC: u8 = 8;

/// 经典 CAN 2.0 帧
///
/// 协议层与硬件层之间的中间抽象：SocketCAN 适配器、行编解码器和过滤引擎
/// 都只认这个类型。
///
/// # 设计特性
///
/// - **Copy**：按值传递，无共享可变别名
/// - **固定 8 字节**：无堆分配，只有前 `len` 字节有意义
/// - **ID 不含标志位**：`id` 只保存 11/29 位标识符，标志位拆成 `is_extended`/`is_remote`
///
/// ```rust
/// use canbridge_protocol::CanFrame;
///
/// let frame = CanFrame::new_standard(0x123, &[1, 2, 3, 4]);
/// assert_eq!(frame.data_slice(), &[1, 2, 3, 4]);
/// assert_eq!(frame.socket_id(), 0x123);
///
/// let ext = CanFrame::new_extended(0x1234_5678, &[]);
/// assert_eq!(ext.socket_id(), 0x9234_5678);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct CanFrame {
    /// CAN ID（11 位或 29 位，不含标志位）
    pub id: u32,

    /// 帧数据（固定 8 字节，未使用部分为 0）
    pub data: [u8; 8],

    /// 有效数据长度 (0-8)
    pub len: u8,

    /// 是否为扩展帧（29-bit ID）
    pub is_extended: bool,

    /// 是否为远程帧（RTR）
    pub is_remote: bool,
}

impl CanFrame {
    /// 创建标准帧
    pub fn new_standard(id: u16, data: &[u8]) -> Self {
        Self::new(u32::from(id) & CAN_SFF_MASK, data, false)
    }

    /// 创建扩展帧
    pub fn new_extended(id: u32, data: &[u8]) -> Self {
        Self::new(id & CAN_EFF_MASK, data, true)
    }

    fn new(id: u32, data: &[u8], is_extended: bool) -> Self {
        let mut fixed_data = [0u8; 8];
        let len = data.len().min(CAN_MAX_DLC as usize);
        fixed_data[..len].copy_from_slice(&data[..len]);

        Self {
            id,
            data: fixed_data,
            len: len as u8,
            is_extended,
            is_remote: false,
        }
    }

    /// 标记为远程帧
    pub fn with_remote(mut self, is_remote: bool) -> Self {
        self.is_remote = is_remote;
        self
    }

    /// 从 socket 形式 ID（含 EFF/RTR 标志位）构造
    pub fn from_socket_id(socket_id: u32, data: &[u8]) -> Self {
        let frame = if socket_id & CAN_EFF_FLAG != 0 {
            Self::new(socket_id & CAN_EFF_MASK, data, true)
        } else {
            Self::new(socket_id & CAN_SFF_MASK, data, false)
        };
        frame.with_remote(socket_id & CAN_RTR_FLAG != 0)
    }

    /// 从 packed（线上/规则文件）形式 ID 构造
    pub fn from_packed_id(packed_id: u32, data: &[u8]) -> Self {
        Self::from_socket_id(packed_to_socket(packed_id), data)
    }

    /// socket 形式 ID（含标志位）
    pub fn socket_id(&self) -> u32 {
        let mut id = self.id;
        if self.is_extended {
            id = (id & CAN_EFF_MASK) | CAN_EFF_FLAG;
        } else {
            id &= CAN_SFF_MASK;
        }
        if self.is_remote {
            id |= CAN_RTR_FLAG;
        }
        id
    }

    /// packed 形式 ID（左对齐，过滤表查找使用的 key）
    pub fn packed_id(&self) -> u32 {
        socket_to_packed(self.socket_id())
    }

    /// 替换 ID，保留数据和 DLC
    ///
    /// `packed_id` 的 IDE/RTR 位决定新帧的类型。
    pub fn with_packed_id(&self, packed_id: u32) -> Self {
        let mut frame = Self::from_packed_id(packed_id, &[]);
        frame.data = self.data;
        frame.len = self.len;
        frame
    }

    /// 获取数据切片（只包含有效数据）
    pub fn data_slice(&self) -> &[u8] {
        &self.data[..(self.len as usize).min(CAN_MAX_DLC as usize)]
    }
}
