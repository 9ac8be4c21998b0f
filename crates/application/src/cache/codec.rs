//! 缓存值编解码

use std::marker::PhantomData;

use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("编码失败: {0}")]
    Encode(String),

    #[error("解码失败: {0}")]
    Decode(String),

    #[error("数据帧不完整: 期望 {expected} 字节, 实际 {actual} 字节")]
    Truncated { expected: usize, actual: usize },

    #[error("数据帧过大: {0} 字节")]
    Oversized(usize),
}

pub trait Codec<T>: Send + Sync {
    fn encode(&self, value: &T) -> Result<Vec<u8>, CodecError>;
    fn decode(&self, bytes: &[u8]) -> Result<T, CodecError>;
}

/// JSON 编解码
#[derive(Debug)]
pub struct JsonCodec<T>(PhantomData<fn() -> T>);

impl<T> JsonCodec<T> {
    pub fn new() -> Self {
        Self(PhantomData)
    }
}

impl<T> Default for JsonCodec<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Clone for JsonCodec<T> {
    fn clone(&self) -> Self {
        Self::new()
    }
}

impl<T> Codec<T> for JsonCodec<T>
where
    T: Serialize + DeserializeOwned,
{
    fn encode(&self, value: &T) -> Result<Vec<u8>, CodecError> {
        serde_json::to_vec(value).map_err(|err| CodecError::Encode(err.to_string()))
    }

    fn decode(&self, bytes: &[u8]) -> Result<T, CodecError> {
        serde_json::from_slice(bytes).map_err(|err| CodecError::Decode(err.to_string()))
    }
}

/// 二进制编解码：4 字节大端长度前缀 + bitcode 负载
#[derive(Debug)]
pub struct BinaryCodec<T> {
    max_frame_len: usize,
    _marker: PhantomData<fn() -> T>,
}

const LEN_PREFIX: usize = 4;
const DEFAULT_MAX_FRAME_LEN: usize = 8 * 1024 * 1024;

impl<T> BinaryCodec<T> {
    pub fn new() -> Self {
        Self::with_max_frame_len(DEFAULT_MAX_FRAME_LEN)
    }

    pub fn with_max_frame_len(max_frame_len: usize) -> Self {
        Self {
            max_frame_len,
            _marker: PhantomData,
        }
    }
}

impl<T> Default for BinaryCodec<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Clone for BinaryCodec<T> {
    fn clone(&self) -> Self {
        Self::with_max_frame_len(self.max_frame_len)
    }
}

impl<T> Codec<T> for BinaryCodec<T>
where
    T: Serialize + DeserializeOwned,
{
    fn encode(&self, value: &T) -> Result<Vec<u8>, CodecError> {
        let body = bitcode::serialize(value).map_err(|err| CodecError::Encode(err.to_string()))?;
        if body.len() > self.max_frame_len || body.len() > u32::MAX as usize {
            return Err(CodecError::Oversized(body.len()));
        }

        let mut frame = Vec::with_capacity(LEN_PREFIX + body.len());
        frame.extend_from_slice(&(body.len() as u32).to_be_bytes());
        frame.extend_from_slice(&body);
        Ok(frame)
    }

    fn decode(&self, bytes: &[u8]) -> Result<T, CodecError> {
        let Some((prefix, body)) = bytes.split_first_chunk::<LEN_PREFIX>() else {
            return Err(CodecError::Truncated {
                expected: LEN_PREFIX,
                actual: bytes.len(),
            });
        };

        let len = u32::from_be_bytes(*prefix) as usize;
        if len > self.max_frame_len {
            return Err(CodecError::Oversized(len));
        }
        if body.len() != len {
            return Err(CodecError::Truncated {
                expected: len,
                actual: body.len(),
            });
        }

        bitcode::deserialize(body).map_err(|err| CodecError::Decode(err.to_string()))
    }
}
