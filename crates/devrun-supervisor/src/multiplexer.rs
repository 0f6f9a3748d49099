//! Line-buffered fan-in from child output streams into the supervisor channel.

use crate::events::SupervisorEvent;
use chrono::Local;
use regex::Regex;
use std::io;
use std::sync::OnceLock;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;

const READ_CHUNK: usize = 8192;

fn ansi_regex() -> &'static Regex {
    static ANSI_RE: OnceLock<Regex> = OnceLock::new();
    ANSI_RE.get_or_init(|| {
        Regex::new(r"\x1b\[[0-9;?]*[ -/]*[@-~]|\x1b\][^\x07]*\x07").expect("valid regex")
    })
}

fn format_line(raw: &[u8]) -> String {
    let text = String::from_utf8_lossy(raw);
    let text = text.trim_end_matches('\r');
    let clean = ansi_regex().replace_all(text, "");
    format!("[{}] {}", Local::now().format("%H:%M:%S"), clean)
}

/// Splits a byte stream on `\n` for one tracked project, keeping the partial
/// trailing fragment between writes.
#[derive(Debug)]
pub struct LineWriter {
    index: usize,
    tx: mpsc::Sender<SupervisorEvent>,
    partial: Vec<u8>,
}

impl LineWriter {
    pub fn new(index: usize, tx: mpsc::Sender<SupervisorEvent>) -> Self {
        Self {
            index,
            tx,
            partial: Vec::new(),
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    async fn send(&self, line: String) -> io::Result<()> {
        self.tx
            .send(SupervisorEvent::Log {
                index: self.index,
                line,
            })
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "supervisor channel closed"))
    }

    pub async fn write(&mut self, bytes: &[u8]) -> io::Result<usize> {
        let mut rest = bytes;
        while let Some(pos) = rest.iter().position(|byte| *byte == b'\n') {
            self.partial.extend_from_slice(&rest[..pos]);
            let line = format_line(&self.partial);
            self.partial.clear();
            self.send(line).await?;
            rest = &rest[pos + 1..];
        }
        self.partial.extend_from_slice(rest);
        Ok(bytes.len())
    }

    /// Emits the trailing fragment, if any, as a final line.
    pub async fn flush(&mut self) -> io::Result<()> {
        if self.partial.is_empty() {
            return Ok(());
        }
        let line = format_line(&self.partial);
        self.partial.clear();
        self.send(line).await
    }
}

/// Sends the same bytes to a [`LineWriter`] and to a passthrough stream.
pub struct TeeWriter<W> {
    lines: LineWriter,
    passthrough: W,
}

impl<W: AsyncWrite + Unpin> TeeWriter<W> {
    pub fn new(lines: LineWriter, passthrough: W) -> Self {
        Self { lines, passthrough }
    }

    pub async fn write(&mut self, bytes: &[u8]) -> io::Result<usize> {
        self.passthrough.write_all(bytes).await?;
        self.passthrough.flush().await?;
        self.lines.write(bytes).await
    }

    pub async fn flush(&mut self) -> io::Result<()> {
        self.passthrough.flush().await?;
        self.lines.flush().await
    }
}

pub enum StreamSink {
    Lines(LineWriter),
    Tee(TeeWriter<Box<dyn AsyncWrite + Send + Unpin>>),
}

impl StreamSink {
    pub fn tee(lines: LineWriter, passthrough: impl AsyncWrite + Send + Unpin + 'static) -> Self {
        StreamSink::Tee(TeeWriter::new(lines, Box::new(passthrough)))
    }

    async fn write(&mut self, bytes: &[u8]) -> io::Result<usize> {
        match self {
            StreamSink::Lines(writer) => writer.write(bytes).await,
            StreamSink::Tee(writer) => writer.write(bytes).await,
        }
    }

    async fn flush(&mut self) -> io::Result<()> {
        match self {
            StreamSink::Lines(writer) => writer.flush().await,
            StreamSink::Tee(writer) => writer.flush().await,
        }
    }
}

/// Reader-task body: copies `reader` into `sink` until EOF.
pub async fn pump<R>(mut reader: R, mut sink: StreamSink) -> io::Result<u64>
where
    R: AsyncRead + Unpin,
{
    let mut buffer = vec![0u8; READ_CHUNK];
    let mut total = 0u64;
    loop {
        let read = reader.read(&mut buffer).await?;
        if read == 0 {
            break;
        }
        total += read as u64;
        sink.write(&buffer[..read]).await?;
    }
    sink.flush().await?;
    Ok(total)
}
