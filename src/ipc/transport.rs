//! 传输层：按行分帧的双向字节流
//!
//! 生产环境下是子进程的 stdin/stdout；测试中用 `tokio::io::duplex` 在同一进程内对接。

use std::path::Path;
use std::process::Stdio;

use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::process::{Child, Command};
use tokio_util::codec::{FramedRead, FramedWrite, LinesCodec, LinesCodecError};

use super::envelope::IpcEnvelope;
use crate::core::HiveError;

pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// 一端的读写半边
pub struct Transport {
    pub reader: BoxedReader,
    pub writer: BoxedWriter,
}

impl Transport {
    pub fn new<R, W>(reader: R, writer: W) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self {
            reader: Box::new(reader),
            writer: Box::new(writer),
        }
    }

    /// 当前进程的 stdin/stdout（记忆进程一侧）
    pub fn stdio() -> Self {
        Self::new(tokio::io::stdin(), tokio::io::stdout())
    }

    /// 进程内一对相连的传输（测试用）
    pub fn pair(buffer: usize) -> (Transport, Transport) {
        let (a, b) = tokio::io::duplex(buffer);
        let (ar, aw) = tokio::io::split(a);
        let (br, bw) = tokio::io::split(b);
        (Transport::new(ar, aw), Transport::new(br, bw))
    }

    pub fn split(self, max_frame_bytes: usize) -> (EnvelopeReader, EnvelopeWriter) {
        (
            EnvelopeReader {
                inner: FramedRead::new(self.reader, LinesCodec::new_with_max_length(max_frame_bytes)),
            },
            EnvelopeWriter {
                inner: FramedWrite::new(self.writer, LinesCodec::new_with_max_length(max_frame_bytes)),
            },
        )
    }
}

/// 读取信封流
pub struct EnvelopeReader {
    inner: FramedRead<BoxedReader, LinesCodec>,
}

impl EnvelopeReader {
    /// 下一个信封；`None` 表示对端关闭
    ///
    /// 单行解析失败或超长返回 `Some(Err(Protocol))`，流本身仍可继续读取；
    /// 底层 IO 错误视为关闭。
    pub async fn next(&mut self) -> Option<Result<IpcEnvelope, HiveError>> {
        loop {
            match self.inner.next().await? {
                Ok(line) if line.trim().is_empty() => continue,
                Ok(line) => return Some(IpcEnvelope::from_line(&line)),
                Err(LinesCodecError::MaxLineLengthExceeded) => {
                    return Some(Err(HiveError::Protocol("frame exceeds max length".into())))
                }
                Err(LinesCodecError::Io(e)) => {
                    tracing::warn!("IPC read error: {}", e);
                    return None;
                }
            }
        }
    }
}

/// 写出信封流
pub struct EnvelopeWriter {
    inner: FramedWrite<BoxedWriter, LinesCodec>,
}

impl EnvelopeWriter {
    pub async fn send(&mut self, envelope: &IpcEnvelope) -> Result<(), HiveError> {
        let line = envelope.to_line()?;
        self.inner.send(line).await.map_err(|e| match e {
            LinesCodecError::MaxLineLengthExceeded => {
                HiveError::Protocol("frame exceeds max length".into())
            }
            LinesCodecError::Io(_) => HiveError::ChannelClosed,
        })
    }
}

/// 启动记忆进程，stdin/stdout 作为传输；stderr 继承（日志）
pub fn spawn_memd(path: &Path, args: &[String]) -> std::io::Result<(Child, Transport)> {
    let mut child = Command::new(path)
        .args(args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::inherit())
        .kill_on_drop(true)
        .spawn()?;

    let stdin = child
        .stdin
        .take()
        .ok_or_else(|| std::io::Error::other("child stdin not piped"))?;
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| std::io::Error::other("child stdout not piped"))?;
    Ok((child, Transport::new(stdout, stdin)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ipc::EnvelopeKind;
    use tokio::io::AsyncWriteExt;

    #[tokio::test]
    async fn test_pair_carries_envelopes() {
        let (a, b) = Transport::pair(1024);
        let (_ra, mut wa) = a.split(1024);
        let (mut rb, _wb) = b.split(1024);

        let env = IpcEnvelope::cancel("c1");
        wa.send(&env).await.unwrap();
        let got = rb.next().await.unwrap().unwrap();
        assert_eq!(got, env);
        assert_eq!(got.kind, EnvelopeKind::Cancel);
    }

    #[tokio::test]
    async fn test_bad_line_does_not_end_stream() {
        let (mut raw_w, raw_r) = {
            let (a, b) = tokio::io::duplex(4096);
            (a, b)
        };
        let (mut reader, _w) = Transport::new(raw_r, tokio::io::sink()).split(4096);

        raw_w.write_all(b"garbage\n").await.unwrap();
        let good = IpcEnvelope::timeout("c2").to_line().unwrap();
        raw_w.write_all(format!("{good}\n").as_bytes()).await.unwrap();

        assert!(matches!(reader.next().await, Some(Err(HiveError::Protocol(_)))));
        let env = reader.next().await.unwrap().unwrap();
        assert_eq!(env.kind, EnvelopeKind::Timeout);

        drop(raw_w);
        assert!(reader.next().await.is_none());
    }
}
