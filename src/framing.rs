//! 消息分帧模块 - 长度前缀分帧实现
//!
//! 在QUIC流上承载Protobuf消息，保证消息边界清晰。
//!
//! 格式: [4字节长度前缀][Protobuf消息数据]
//! 长度前缀: 大端序32位无符号整数，表示后续Protobuf数据的长度

use prost::Message;

/// 单条消息最大长度（10MB）
pub const MAX_MESSAGE_SIZE: usize = 10 * 1024 * 1024;

/// 长度前缀字节数
const PREFIX_LEN: usize = 4;

/// 分帧错误类型
#[derive(Debug, thiserror::Error)]
pub enum FramingError {
    #[error("数据不完整，需要更多数据: 当前{current}字节，需要{needed}字节")]
    IncompleteData { current: usize, needed: usize },

    #[error("消息长度超出限制: {length}字节 (最大{max}字节)")]
    MessageTooLarge { length: usize, max: usize },

    #[error("Protobuf解析失败: {0}")]
    ProtobufError(#[from] prost::DecodeError),

    #[error("Protobuf编码失败: {0}")]
    EncodeError(#[from] prost::EncodeError),
}

/// 为消息添加分帧
///
/// # 返回
/// * `Ok(Vec<u8>)` - 长度前缀 + Protobuf编码数据
/// * `Err(FramingError::MessageTooLarge)` - 编码后超过 [`MAX_MESSAGE_SIZE`]
pub fn frame_message<M: Message>(message: &M) -> Result<Vec<u8>, FramingError> {
    let message_len = message.encoded_len();
    if message_len > MAX_MESSAGE_SIZE {
        return Err(FramingError::MessageTooLarge {
            length: message_len,
            max: MAX_MESSAGE_SIZE,
        });
    }

    let mut framed_data = Vec::with_capacity(PREFIX_LEN + message_len);
    framed_data.extend_from_slice(&(message_len as u32).to_be_bytes());
    message.encode(&mut framed_data)?;

    Ok(framed_data)
}

/// 从分帧数据中解析第一条消息
///
/// # 返回
/// * `Ok((消息, 消耗的字节数))`
/// * `Err(FramingError::IncompleteData)` - 需要更多数据
///
/// # 注意
/// 此函数只解析第一个完整消息，调用方需要处理剩余数据
pub fn parse_framed_message<M: Message + Default>(data: &[u8]) -> Result<(M, usize), FramingError> {
    if data.len() < PREFIX_LEN {
        return Err(FramingError::IncompleteData {
            current: data.len(),
            needed: PREFIX_LEN,
        });
    }

    let length_bytes: [u8; 4] = [data[0], data[1], data[2], data[3]];
    let message_length = u32::from_be_bytes(length_bytes) as usize;

    if message_length > MAX_MESSAGE_SIZE {
        return Err(FramingError::MessageTooLarge {
            length: message_length,
            max: MAX_MESSAGE_SIZE,
        });
    }

    let total = PREFIX_LEN + message_length;
    if data.len() < total {
        return Err(FramingError::IncompleteData {
            current: data.len(),
            needed: total,
        });
    }

    let message = M::decode(&data[PREFIX_LEN..total])?;
    Ok((message, total))
}

/// 流数据解析器 - 累积单个QUIC流的数据并逐条取出消息
pub struct StreamParser {
    buffer: Vec<u8>,
    max_buffer_size: usize,
}

impl Default for StreamParser {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamParser {
    /// 创建新的流解析器
    pub fn new() -> Self {
        Self {
            buffer: Vec::new(),
            max_buffer_size: 1024 * 1024, // 1MB缓冲区限制
        }
    }

    /// 添加接收到的数据
    pub fn append_data(&mut self, data: &[u8]) -> Result<(), FramingError> {
        let length = self.buffer.len() + data.len();
        if length > self.max_buffer_size {
            // 缓冲区过大，清空并返回错误
            self.buffer.clear();
            return Err(FramingError::MessageTooLarge {
                length,
                max: self.max_buffer_size,
            });
        }

        self.buffer.extend_from_slice(data);
        Ok(())
    }

    /// 尝试解析下一个完整消息
    ///
    /// * `Ok(Some(M))` - 解析出一个消息，已从缓冲区移除该消息数据
    /// * `Ok(None)` - 数据不完整，需要更多数据
    /// * `Err(FramingError)` - 解析失败，缓冲区已清空
    pub fn try_parse_next<M: Message + Default>(&mut self) -> Result<Option<M>, FramingError> {
        match parse_framed_message::<M>(&self.buffer) {
            Ok((message, bytes_consumed)) => {
                self.buffer.drain(0..bytes_consumed);
                Ok(Some(message))
            }
            Err(FramingError::IncompleteData { .. }) => Ok(None),
            Err(e) => {
                self.buffer.clear();
                Err(e)
            }
        }
    }

    /// 获取缓冲区当前大小
    pub fn buffer_size(&self) -> usize {
        self.buffer.len()
    }
}
