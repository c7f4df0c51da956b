//! Serial pressure gauge driver.
//!
//! Protocol (Pfeiffer TPG single gauge style):
//! - 8N1, no flow control, commands terminated by CR
//! - `PR1` requests a measurement of gauge 1, answered by an ACK line
//! - ENQ (0x05) then returns `<status>,<value>` followed by CR LF
//! - `x` (sent on connect) stops any continuous output left running
//! - `ERR` uses the same ACK/ENQ exchange and returns the controller's error word;
//!   it is queried whenever a `PR1` reply carries a non-zero status
//!
//! The raw reply is kept alongside the parsed value; status and value handling
//! lives in [`parse_gauge_reply`](super::parse_gauge_reply).

use super::{AuxiliaryReading, AuxiliarySensor};
use crate::config::AuxiliarySpec;
use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use chrono::Local;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::sync::Mutex;
use tokio::time::timeout;
use tokio_serial::{SerialPortBuilderExt, SerialStream};

const ACK: u8 = 0x06;
const NAK: u8 = 0x15;
const ENQ: u8 = 0x05;

/// Driver for a serial pressure gauge controller.
pub struct SerialPressureGauge {
    port: Mutex<Option<BufReader<SerialStream>>>,
    timeout: Duration,
}

impl Default for SerialPressureGauge {
    fn default() -> Self {
        Self::new()
    }
}

impl SerialPressureGauge {
    /// Create an unconnected driver with a 1 s reply timeout.
    pub fn new() -> Self {
        Self {
            port: Mutex::new(None),
            timeout: Duration::from_secs(1),
        }
    }

    async fn read_reply_line(port: &mut BufReader<SerialStream>, wait: Duration) -> Result<Vec<u8>> {
        let mut line = Vec::new();
        match timeout(wait, port.read_until(b'\n', &mut line)).await {
            Ok(Ok(0)) => bail!("Serial port closed"),
            Ok(Ok(_)) => Ok(line),
            Ok(Err(e)) => Err(e).context("Failed to read from pressure gauge"),
            Err(_) => bail!("Timeout waiting for pressure gauge reply"),
        }
    }

    /// Send `command`, wait for the ACK, then request the data with ENQ.
    async fn exchange(
        port: &mut BufReader<SerialStream>,
        command: &str,
        wait: Duration,
    ) -> Result<String> {
        port.get_mut()
            .write_all(format!("{command}\r").as_bytes())
            .await
            .with_context(|| format!("Failed to send {command}"))?;
        let ack = Self::read_reply_line(port, wait).await?;
        match ack.first() {
            Some(&ACK) => {}
            Some(&NAK) => bail!("Pressure gauge rejected {command} (NAK)"),
            _ => bail!(
                "Unexpected reply to {command}: {:?}",
                String::from_utf8_lossy(&ack)
            ),
        }

        port.get_mut()
            .write_all(&[ENQ])
            .await
            .context("Failed to send ENQ")?;
        let reply = Self::read_reply_line(port, wait).await?;
        let text = String::from_utf8_lossy(&reply).trim().to_string();
        if text.is_empty() {
            bail!("No data received for {command}");
        }
        Ok(text)
    }

    /// Query the controller's error status word (`ERR`).
    pub async fn error_status(&self) -> Result<String> {
        let mut guard = self.port.lock().await;
        let port = guard
            .as_mut()
            .ok_or_else(|| anyhow!("Pressure gauge is not connected"))?;
        Self::exchange(port, "ERR", self.timeout).await
    }

    /// Discard anything the controller has already sent.
    async fn drain(port: &mut BufReader<SerialStream>) -> Result<usize> {
        let buffered = port.buffer().len();
        port.consume(buffered);

        let mut discarded = buffered;
        let mut scratch = [0u8; 256];
        loop {
            match timeout(Duration::from_millis(50), port.get_mut().read(&mut scratch)).await {
                Ok(Ok(0)) | Err(_) => break,
                Ok(Ok(n)) => discarded += n,
                Ok(Err(e)) => return Err(e).context("Failed to drain pressure gauge buffer"),
            }
        }
        Ok(discarded)
    }
}

#[async_trait]
impl AuxiliarySensor for SerialPressureGauge {
    async fn connect(&self, params: &AuxiliarySpec) -> Result<()> {
        let stream = tokio_serial::new(&params.port, params.baud_rate)
            .data_bits(tokio_serial::DataBits::Eight)
            .parity(tokio_serial::Parity::None)
            .stop_bits(tokio_serial::StopBits::One)
            .flow_control(tokio_serial::FlowControl::None)
            .open_native_async()
            .with_context(|| format!("Failed to open pressure gauge port {}", params.port))?;
        let mut port = BufReader::new(stream);

        port.get_mut()
            .write_all(b"x\r")
            .await
            .context("Failed to stop continuous output")?;
        tokio::time::sleep(Duration::from_millis(500)).await;
        let discarded = Self::drain(&mut port).await?;
        tracing::debug!(discarded, "Pressure gauge buffer drained");

        tracing::info!(port = %params.port, baud = params.baud_rate, "Pressure gauge connected");
        *self.port.lock().await = Some(port);
        Ok(())
    }

    async fn read(&self) -> Result<AuxiliaryReading> {
        let mut guard = self.port.lock().await;
        let port = guard
            .as_mut()
            .ok_or_else(|| anyhow!("Pressure gauge is not connected"))?;

        let reply = Self::exchange(port, "PR1", self.timeout).await?;
        let mut reading = AuxiliaryReading::from_raw(Local::now(), &reply);

        if let Some(status) = reading.fault_status().map(str::to_string) {
            match Self::exchange(port, "ERR", self.timeout).await {
                Ok(code) => {
                    let code = code.trim().to_string();
                    tracing::warn!(
                        device = "auxiliary",
                        status = %status,
                        error_code = %code,
                        "Pressure gauge reports a fault"
                    );
                    reading = reading.with_error_status(code);
                }
                Err(e) => tracing::warn!(
                    device = "auxiliary",
                    status = %status,
                    error = %format!("{e:#}"),
                    "Pressure gauge fault, error status query failed"
                ),
            }
        }

        tracing::debug!(reading = %reading.reading, value = ?reading.value, "Pressure read");
        Ok(reading)
    }

    async fn disconnect(&self) -> Result<()> {
        if self.port.lock().await.take().is_some() {
            tracing::info!("Pressure gauge disconnected");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn read_requires_connection() {
        let gauge = SerialPressureGauge::new();
        let err = gauge.read().await.unwrap_err();
        assert!(err.to_string().contains("not connected"));
        let err = gauge.error_status().await.unwrap_err();
        assert!(err.to_string().contains("not connected"));
        assert!(gauge.disconnect().await.is_ok());
    }

    #[tokio::test]
    async fn connect_reports_missing_port() {
        let gauge = SerialPressureGauge::new();
        let params = AuxiliarySpec {
            port: "/dev/does-not-exist-scope-daq".to_string(),
            baud_rate: 9600,
        };
        let err = gauge.connect(&params).await.unwrap_err();
        assert!(format!("{err:#}").contains("/dev/does-not-exist-scope-daq"));
    }
}
