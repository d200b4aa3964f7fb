// Line sources: the connections to mesh nodes
//
// A node is reached through exactly one byte stream. New transports are added by:
// 1. Writing an `open_*` function that yields an `AsyncRead + AsyncWrite` stream
// 2. Adding a variant to LineSourceConfig
// 3. Registering it in `LineSourceConfig::open`
//
// Current transports:
// - Serial: USB/UART console of the node (e.g. /dev/ttyUSB0, COM13)
// - TCP: connect to a node or bridge exposing its console on a socket
// - TCP listen: wait for a node to connect to us and use that connection

mod line;
mod serial;
mod tcp;

pub use line::{BoxedReader, BoxedWriter, LineReader, LineWriter};

use crate::error::Result;
use crate::types::SourceId;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite};

pub const DEFAULT_BAUD_RATE: u32 = 115_200;

fn default_baud_rate() -> u32 {
    DEFAULT_BAUD_RATE
}

/// Configuration for the transports a node can be reached through
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum LineSourceConfig {
    /// Serial port connection (e.g., /dev/ttyUSB0 on Linux, COM13 on Windows)
    #[serde(rename = "serial")]
    SerialPort {
        port: String,
        #[serde(default = "default_baud_rate")]
        baud_rate: u32,
        #[serde(default)]
        data_bits: Option<u8>,
        #[serde(default)]
        stop_bits: Option<u8>,
    },

    /// Outbound TCP connection
    #[serde(rename = "tcp")]
    TcpSocket { host: String, port: u16 },

    /// Accept a single inbound TCP connection
    #[serde(rename = "tcp_listen")]
    TcpListen {
        bind_addr: String,
        /// Give up waiting for the node after this long
        #[serde(default)]
        accept_timeout_ms: Option<u64>,
    },
}

impl LineSourceConfig {
    /// Open the underlying stream and wrap it as a line source named `id`
    pub async fn open(&self, id: &SourceId) -> Result<LineSource> {
        log::info!("Opening line source '{}' ({})", id, self.describe());

        let source = match self {
            LineSourceConfig::SerialPort {
                port,
                baud_rate,
                data_bits,
                stop_bits,
            } => {
                let stream = serial::open_serial(id, port, *baud_rate, *data_bits, *stop_bits)?;
                LineSource::from_stream(id.clone(), stream)
            }
            LineSourceConfig::TcpSocket { host, port } => {
                let stream = tcp::connect(id, host, *port).await?;
                LineSource::from_stream(id.clone(), stream)
            }
            LineSourceConfig::TcpListen {
                bind_addr,
                accept_timeout_ms,
            } => {
                let stream = tcp::accept_one(id, bind_addr, *accept_timeout_ms).await?;
                LineSource::from_stream(id.clone(), stream)
            }
        };

        log::info!("Line source '{}' opened", id);
        Ok(source)
    }

    pub fn describe(&self) -> String {
        match self {
            LineSourceConfig::SerialPort {
                port, baud_rate, ..
            } => format!("serial {} @ {} baud", port, baud_rate),
            LineSourceConfig::TcpSocket { host, port } => format!("tcp {}:{}", host, port),
            LineSourceConfig::TcpListen { bind_addr, .. } => format!("tcp listen {}", bind_addr),
        }
    }
}

/// An open connection to one node, split into independently owned halves
pub struct LineSource {
    id: SourceId,
    reader: LineReader,
    writer: LineWriter,
}

impl LineSource {
    /// Wrap any bidirectional byte stream (serial port, socket, in-memory duplex)
    pub fn from_stream<S>(id: SourceId, stream: S) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (read_half, write_half) = tokio::io::split(stream);
        Self {
            reader: LineReader::new(id.clone(), Box::new(read_half)),
            writer: LineWriter::new(id.clone(), Box::new(write_half)),
            id,
        }
    }

    pub fn id(&self) -> &SourceId {
        &self.id
    }

    pub fn split(self) -> (LineReader, LineWriter) {
        (self.reader, self.writer)
    }
}
