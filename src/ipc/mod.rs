//! 跨进程通道：操作员进程与记忆进程之间的信封协议
//!
//! 每个方向都有未完成请求上限；每个请求恰好一个终止信封。

pub mod client;
pub mod envelope;
pub mod server;
pub mod transport;

pub use client::{IpcClient, IpcClientConfig, ResponseStream};
pub use envelope::{EnvelopeKind, ErrorBody, IpcEnvelope};
pub use server::{serve, ServerConfig};
pub use transport::{spawn_memd, EnvelopeReader, EnvelopeWriter, Transport};
