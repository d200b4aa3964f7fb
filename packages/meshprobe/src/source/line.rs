// Line-oriented halves of a byte stream
//
// The read half is owned by a reader task, the write half by the experiment
// runner. Reads are bounded by a poll interval so a silent or unplugged device
// never blocks the task past its next cancellation check.

use crate::error::{ProbeError, Result};
use crate::types::SourceId;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};

pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

pub struct LineReader {
    source: SourceId,
    inner: BufReader<BoxedReader>,
    // bytes of a line whose terminator has not arrived yet
    pending: Vec<u8>,
}

impl LineReader {
    pub fn new(source: SourceId, reader: BoxedReader) -> Self {
        Self {
            source,
            inner: BufReader::new(reader),
            pending: Vec::with_capacity(128),
        }
    }

    pub fn source_id(&self) -> &SourceId {
        &self.source
    }

    /// True when part of a line is already buffered and a read would not start from scratch
    pub fn has_data_available(&self) -> bool {
        !self.pending.is_empty() || !self.inner.buffer().is_empty()
    }

    /// Reads one line (terminated by `LF`), trimmed of surrounding whitespace
    ///
    /// Returns `ReadTimeout` if no complete line arrives within `poll`, and
    /// `SourceClosed` once the stream has ended and nothing is left buffered.
    ///
    /// # Cancel Safety
    /// A timed out read keeps whatever bytes arrived in `pending`; the next call
    /// continues the same line.
    pub async fn read_line(&mut self, poll: Duration) -> Result<String> {
        let read = tokio::time::timeout(poll, self.inner.read_until(b'\n', &mut self.pending)).await;

        match read {
            Err(_) => Err(ProbeError::ReadTimeout(self.source.to_string())),
            Ok(Err(e)) => Err(ProbeError::Io(e)),
            Ok(Ok(0)) if self.pending.is_empty() => {
                Err(ProbeError::SourceClosed(self.source.to_string()))
            }
            Ok(Ok(_)) => {
                let raw = std::mem::take(&mut self.pending);
                Ok(String::from_utf8_lossy(&raw).trim().to_string())
            }
        }
    }
}

pub struct LineWriter {
    source: SourceId,
    inner: BoxedWriter,
    line_ending: &'static str,
}

impl LineWriter {
    pub fn new(source: SourceId, writer: BoxedWriter) -> Self {
        Self {
            source,
            inner: writer,
            line_ending: "\n",
        }
    }

    pub fn source_id(&self) -> &SourceId {
        &self.source
    }

    /// Writes `line` followed by the line ending and flushes
    pub async fn write_line(&mut self, line: &str) -> Result<()> {
        let serialized = format!("{}{}", line, self.line_ending);
        self.inner
            .write_all(serialized.as_bytes())
            .await
            .map_err(|e| self.write_error(e))?;
        self.inner.flush().await.map_err(|e| self.write_error(e))
    }

    pub async fn close(&mut self) -> Result<()> {
        self.inner.shutdown().await.map_err(|e| self.write_error(e))
    }

    fn write_error(&self, e: std::io::Error) -> ProbeError {
        ProbeError::Write {
            source_id: self.source.to_string(),
            message: e.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    fn reader_for(stream: tokio::io::DuplexStream) -> LineReader {
        let (read_half, _write_half) = tokio::io::split(stream);
        LineReader::new(SourceId::from("node"), Box::new(read_half))
    }

    #[tokio::test]
    async fn test_reads_complete_lines() {
        let (device, host) = tokio::io::duplex(256);
        let mut reader = reader_for(host);
        let (_, mut device_tx) = tokio::io::split(device);

        device_tx.write_all(b"OUTBOUND\r\nINBOUND\n").await.unwrap();

        let poll = Duration::from_millis(200);
        assert_eq!(reader.read_line(poll).await.unwrap(), "OUTBOUND");
        assert_eq!(reader.read_line(poll).await.unwrap(), "INBOUND");
    }

    #[tokio::test]
    async fn test_partial_line_survives_timeout() {
        let (device, host) = tokio::io::duplex(256);
        let mut reader = reader_for(host);
        let (_, mut device_tx) = tokio::io::split(device);

        device_tx.write_all(b"Encryption time").await.unwrap();
        let poll = Duration::from_millis(20);
        assert!(matches!(
            reader.read_line(poll).await,
            Err(ProbeError::ReadTimeout(_))
        ));
        assert!(reader.has_data_available());

        device_tx.write_all(b" /us:1234\n").await.unwrap();
        assert_eq!(
            reader.read_line(poll).await.unwrap(),
            "Encryption time /us:1234"
        );
        assert!(!reader.has_data_available());
    }

    #[tokio::test]
    async fn test_closed_stream_reports_closed() {
        let (device, host) = tokio::io::duplex(64);
        let mut reader = reader_for(host);
        drop(device);

        let result = reader.read_line(Duration::from_millis(50)).await;
        assert!(matches!(result, Err(ProbeError::SourceClosed(_))));
    }

    #[tokio::test]
    async fn test_trailing_partial_line_flushed_on_close() {
        let (device, host) = tokio::io::duplex(64);
        let mut reader = reader_for(host);
        let (_, mut device_tx) = tokio::io::split(device);

        device_tx.write_all(b"INBOUND").await.unwrap();
        device_tx.shutdown().await.unwrap();
        drop(device_tx);

        let poll = Duration::from_millis(50);
        assert_eq!(reader.read_line(poll).await.unwrap(), "INBOUND");
        assert!(matches!(
            reader.read_line(poll).await,
            Err(ProbeError::SourceClosed(_))
        ));
    }

    #[tokio::test]
    async fn test_writer_appends_line_ending() {
        let (device, host) = tokio::io::duplex(64);
        let (_, host_tx) = tokio::io::split(host);
        let mut writer = LineWriter::new(SourceId::from("node"), Box::new(host_tx));

        writer.write_line("hirg -r 42 -l 10").await.unwrap();

        let (device_rx, _) = tokio::io::split(device);
        let mut device_reader = LineReader::new(SourceId::from("device"), Box::new(device_rx));
        let line = device_reader
            .read_line(Duration::from_millis(50))
            .await
            .unwrap();
        assert_eq!(line, "hirg -r 42 -l 10");
    }
}
