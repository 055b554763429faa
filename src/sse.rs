//! Server-Sent Events 帧编码

use crate::stats::Sample;
use hyper::body::Bytes;

/// 一帧 SSE 输出
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// 注释帧，用于保持连接
    Comment(String),
    /// 数据帧，内容为 JSON 文本
    Data(String),
    /// 无负载的错误事件
    Error,
}

impl Frame {
    /// 把采样结果序列化为数据帧
    pub fn sample(sample: &Sample) -> serde_json::Result<Self> {
        serde_json::to_string(sample).map(Frame::Data)
    }

    /// 编码为线上格式
    pub fn encode(&self) -> Bytes {
        match self {
            Frame::Comment(text) => Bytes::from(format!(": {}\n\n", single_line(text))),
            Frame::Data(json) => Bytes::from(format!("data: {}\n\n", single_line(json))),
            Frame::Error => Bytes::from_static(b"event: error\n\n"),
        }
    }
}

// 帧内容里的换行会提前结束事件
#[inline]
fn single_line(text: &str) -> String {
    text.replace(['\r', '\n'], " ")
}
