//! 主机资源采样服务库
//!
//! 从 /proc 与 df 读取 CPU、内存、磁盘占用，既可以通过轮询接口一次取一份快照，
//! 也可以通过 Server-Sent Events 每秒推送一次。

pub mod server;
pub mod sse;
pub mod stats;
pub mod stream;

// 重新导出主要的公共类型
pub use server::{Config, StatusServer};
pub use sse::Frame;
pub use stats::{
    CpuBaseline, Sample, Sampler, SamplerConfig, SamplerRef, StatsError, create_sampler,
};
pub use stream::{PublisherRef, StreamPublisher, Subscription, create_publisher};
