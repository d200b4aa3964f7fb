// Serial port transport
//
// Nodes expose a text console on their USB UART; commands go in as lines and
// debug output comes back as lines.

use crate::error::{ProbeError, Result};
use crate::types::SourceId;
use tokio_serial::{DataBits, SerialPortBuilderExt, SerialStream, StopBits};

pub(super) fn open_serial(
    id: &SourceId,
    port: &str,
    baud_rate: u32,
    data_bits: Option<u8>,
    stop_bits: Option<u8>,
) -> Result<SerialStream> {
    let data_bits = match data_bits.unwrap_or(8) {
        5 => DataBits::Five,
        6 => DataBits::Six,
        7 => DataBits::Seven,
        8 => DataBits::Eight,
        other => {
            return Err(ProbeError::InvalidConfig(format!(
                "'{}': unsupported data bits {}",
                id, other
            )))
        }
    };
    let stop_bits = match stop_bits.unwrap_or(1) {
        1 => StopBits::One,
        2 => StopBits::Two,
        other => {
            return Err(ProbeError::InvalidConfig(format!(
                "'{}': unsupported stop bits {}",
                id, other
            )))
        }
    };

    log::debug!(
        "Opening serial port {} at {} baud ({:?}, {:?})",
        port,
        baud_rate,
        data_bits,
        stop_bits
    );

    tokio_serial::new(port, baud_rate)
        .data_bits(data_bits)
        .stop_bits(stop_bits)
        .open_native_async()
        .map_err(|e| ProbeError::Connection {
            source_id: id.to_string(),
            message: format!("Failed to open serial port {}: {}", port, e),
        })
}
