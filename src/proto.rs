//! Protobuf 消息定义
//!
//! 与服务端共享的线上格式。字段编号固定，修改前需与服务端同步。

/// 编码格式
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum Format {
    Aac = 0,
    H264 = 1,
    Opus = 2,
    Mpegts = 3,
}

/// 分辨率
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum Resolution {
    X240p = 0,
    X360p = 1,
    X480p = 2,
    X576p = 3,
    X720p = 4,
    X1080p = 5,
}

/// 帧率
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum Fps {
    X5 = 0,
    X15 = 1,
    X30 = 2,
    X60 = 3,
}

/// 协商结果码，`ErrorUndefined` 表示接受
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum ValidationError {
    ErrorUndefined = 0,
    InvalidQuality = 1,
    StreamAlreadyExists = 2,
    ServerFull = 3,
    Unauthorized = 4,
}

/// 单条轨道的质量定义
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct QualityDefinition {
    #[prost(enumeration = "Format", tag = "1")]
    pub format: i32,
    #[prost(enumeration = "Resolution", tag = "2")]
    pub resolution: i32,
    #[prost(enumeration = "Fps", tag = "3")]
    pub fps: i32,
    #[prost(uint32, tag = "4")]
    pub bitrate: u32,
}

/// 协商请求（NewStream）
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct StreamInfo {
    #[prost(uint32, tag = "1")]
    pub stream_id: u32,
    #[prost(message, optional, tag = "2")]
    pub videoquality: ::core::option::Option<QualityDefinition>,
    #[prost(message, optional, tag = "3")]
    pub audioquality: ::core::option::Option<QualityDefinition>,
}

/// 协商响应
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct StreamValidation {
    #[prost(uint32, tag = "1")]
    pub stream_id: u32,
    #[prost(enumeration = "ValidationError", tag = "2")]
    pub error: i32,
}

/// 上行数据帧（SendStream）
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct StreamData {
    /// 采集时间戳（毫秒）
    #[prost(uint64, tag = "1")]
    pub ts: u64,
    #[prost(uint32, tag = "2")]
    pub stream_id: u32,
    #[prost(bytes = "vec", tag = "3")]
    pub video: ::prost::alloc::vec::Vec<u8>,
    #[prost(bytes = "vec", tag = "4")]
    pub audio: ::prost::alloc::vec::Vec<u8>,
}

/// 服务端对每个数据帧的确认
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Ack {
    #[prost(uint32, tag = "1")]
    pub size: u32,
    #[prost(enumeration = "ValidationError", tag = "2")]
    pub error: i32,
}

#[cfg(test)]
mod tests {
    use super::*;
    use prost::Message;

    #[test]
    fn test_enum_getters_fall_back_to_default() {
        let validation = StreamValidation { stream_id: 9, error: 42 };
        // 未知枚举值回退到默认（0）
        assert_eq!(validation.error(), ValidationError::ErrorUndefined);
        assert!(ValidationError::try_from(42).is_err());
    }

    #[test]
    fn test_stream_info_quality_fields() {
        let info = StreamInfo {
            stream_id: 0,
            videoquality: Some(QualityDefinition {
                format: Format::H264 as i32,
                resolution: Resolution::X720p as i32,
                fps: Fps::X30 as i32,
                bitrate: 500_000,
            }),
            audioquality: None,
        };

        let decoded = StreamInfo::decode(&info.encode_to_vec()[..]).unwrap();
        let video = decoded.videoquality.unwrap();
        assert_eq!(video.format(), Format::H264);
        assert_eq!(video.resolution(), Resolution::X720p);
        assert_eq!(video.fps(), Fps::X30);
        assert!(decoded.audioquality.is_none());
    }
}
