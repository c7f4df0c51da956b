//! SCPI over TCP oscilloscope driver.
//!
//! [`ScpiClient`] handles line-oriented command/query traffic on a raw socket
//! (port 5555 on Rigol DS1000Z class instruments). [`ScpiOscilloscope`] maps the
//! [`InstrumentService`] operations onto the instrument's command set.

use super::{ChannelData, InstrumentService, TriggerStatus};
use crate::config::{
    AcquisitionSpec, ChannelSpec, InstrumentSpec, TimebaseSpec, TriggerMode, TriggerSpec,
    WaveformPoints,
};
use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::time::timeout;

/// Default SCPI raw socket port
pub const DEFAULT_PORT: u16 = 5555;

/// Default response timeout in milliseconds
pub const DEFAULT_TIMEOUT_MS: u64 = 5000;

/// Line-oriented SCPI connection.
pub struct ScpiClient {
    stream: BufReader<TcpStream>,
    timeout: Duration,
}

impl ScpiClient {
    /// Connect to `host:port`.
    pub async fn connect(host: &str, port: u16, io_timeout: Duration) -> Result<Self> {
        let stream = timeout(io_timeout, TcpStream::connect((host, port)))
            .await
            .with_context(|| format!("Connection timeout to {}:{}", host, port))?
            .with_context(|| format!("Failed to connect to {}:{}", host, port))?;

        stream.set_nodelay(true)?;

        tracing::info!("Connected to oscilloscope at {}:{}", host, port);

        Ok(Self {
            stream: BufReader::new(stream),
            timeout: io_timeout,
        })
    }

    /// Send a command without expecting a response.
    pub async fn write(&mut self, command: &str) -> Result<()> {
        tracing::debug!("SCPI write: {:?}", command);

        let stream = self.stream.get_mut();
        stream
            .write_all(format!("{}\n", command).as_bytes())
            .await
            .with_context(|| format!("Failed to write command: {}", command))?;
        stream.flush().await.context("Failed to flush stream")?;

        Ok(())
    }

    /// Send a query and return the trimmed response line.
    pub async fn query(&mut self, query: &str) -> Result<String> {
        self.write(query).await?;

        let mut response = String::new();
        match timeout(self.timeout, self.stream.read_line(&mut response)).await {
            Ok(Ok(0)) => bail!("Connection closed by device"),
            Ok(Ok(_)) => {
                let trimmed = response.trim().to_string();
                tracing::trace!(bytes = trimmed.len(), "SCPI response to {:?}", query);
                Ok(trimmed)
            }
            Ok(Err(e)) => Err(e).context("Failed to read response"),
            Err(_) => bail!("Timeout waiting for response to: {}", query),
        }
    }

    /// Query a floating-point value.
    pub async fn query_f64(&mut self, query: &str) -> Result<f64> {
        let response = self.query(query).await?;
        response.parse::<f64>().with_context(|| {
            format!(
                "Failed to parse '{}' as f64 from query: {}",
                response, query
            )
        })
    }
}

/// Split `host[:port]` and apply the port override.
pub fn resolve_endpoint(instrument: &InstrumentSpec) -> Result<(String, u16)> {
    let address = instrument.address.trim();
    let (host, embedded_port) = match address.rsplit_once(':') {
        Some((host, port)) if !host.contains(':') => {
            let port = port
                .parse::<u16>()
                .with_context(|| format!("Invalid port in address '{}'", address))?;
            (host, Some(port))
        }
        _ => (address, None),
    };

    if host.is_empty() {
        bail!("Instrument address is empty");
    }

    let port = instrument.port.or(embedded_port).unwrap_or(DEFAULT_PORT);
    Ok((host.to_string(), port))
}

/// Parse an ASCII waveform block (`:WAV:FORM ASC`).
///
/// The block may start with a `#N<N digits>` length header, which is skipped.
pub fn parse_waveform_ascii(response: &str) -> Result<Vec<f64>> {
    let body = strip_block_header(response.trim())?;
    body.split(',')
        .map(str::trim)
        .filter(|field| !field.is_empty())
        .map(|field| {
            field
                .parse::<f64>()
                .with_context(|| format!("Invalid sample '{}' in waveform data", field))
        })
        .collect()
}

fn strip_block_header(data: &str) -> Result<&str> {
    let Some(rest) = data.strip_prefix('#') else {
        return Ok(data);
    };
    let digits = rest
        .chars()
        .next()
        .and_then(|c| c.to_digit(10))
        .ok_or_else(|| anyhow!("Malformed block header in waveform data"))? as usize;
    rest.get(1 + digits..)
        .ok_or_else(|| anyhow!("Truncated block header in waveform data"))
}

/// Oscilloscope reached over a raw SCPI socket.
pub struct ScpiOscilloscope {
    client: Mutex<Option<ScpiClient>>,
    io_timeout: Duration,
}

impl Default for ScpiOscilloscope {
    fn default() -> Self {
        Self::new()
    }
}

impl ScpiOscilloscope {
    /// Create an unconnected driver with the default response timeout.
    pub fn new() -> Self {
        Self::with_timeout(Duration::from_millis(DEFAULT_TIMEOUT_MS))
    }

    /// Create an unconnected driver with a custom response timeout.
    pub fn with_timeout(io_timeout: Duration) -> Self {
        Self {
            client: Mutex::new(None),
            io_timeout,
        }
    }

    async fn write_all(&self, commands: &[String]) -> Result<()> {
        let mut guard = self.client.lock().await;
        let client = guard.as_mut().ok_or_else(not_connected)?;
        for command in commands {
            client.write(command).await?;
        }
        Ok(())
    }
}

fn not_connected() -> anyhow::Error {
    anyhow!("Oscilloscope is not connected")
}

#[async_trait]
impl InstrumentService for ScpiOscilloscope {
    async fn connect(&self, instrument: &InstrumentSpec) -> Result<String> {
        let (host, port) = resolve_endpoint(instrument)?;
        let mut client = ScpiClient::connect(&host, port, self.io_timeout).await?;
        let identity = client.query("*IDN?").await?;
        *self.client.lock().await = Some(client);
        Ok(identity)
    }

    async fn configure_channel(&self, channel: &ChannelSpec) -> Result<()> {
        let n = channel.number;
        self.write_all(&[
            format!(":CHAN{}:DISP {}", n, if channel.display { "ON" } else { "OFF" }),
            format!(":CHAN{}:SCAL {}", n, channel.scale),
            format!(":CHAN{}:COUP {}", n, channel.coupling.as_scpi()),
        ])
        .await
        .with_context(|| format!("Failed to configure channel {}", n))
    }

    async fn configure_acquisition(&self, acquisition: &AcquisitionSpec) -> Result<()> {
        let depth = match acquisition.points {
            WaveformPoints::Max => "AUTO".to_string(),
            WaveformPoints::Count(n) => n.to_string(),
        };
        self.write_all(&[format!(":ACQ:MDEP {}", depth)])
            .await
            .context("Failed to configure acquisition")
    }

    async fn configure_timebase(&self, timebase: &TimebaseSpec) -> Result<()> {
        self.write_all(&[
            format!(":TIM:MAIN:SCAL {}", timebase.scale),
            format!(":TIM:MAIN:OFFS {}", timebase.offset),
        ])
        .await
        .context("Failed to configure timebase")
    }

    async fn configure_trigger(&self, trigger: &TriggerSpec) -> Result<()> {
        let mut commands = vec![
            ":TRIG:MODE EDGE".to_string(),
            format!(":TRIG:EDGE:SOUR CHAN{}", trigger.source),
            format!(":TRIG:EDGE:LEV {}", trigger.level),
            format!(":TRIG:SWE {}", trigger.mode.as_scpi()),
        ];
        if trigger.mode == TriggerMode::Single {
            commands.push(":SING".to_string());
        }
        self.write_all(&commands)
            .await
            .context("Failed to configure trigger")
    }

    async fn trigger_status(&self) -> Result<TriggerStatus> {
        let mut guard = self.client.lock().await;
        let client = guard.as_mut().ok_or_else(not_connected)?;
        let status = client.query(":TRIG:STAT?").await?;
        Ok(TriggerStatus::parse(&status))
    }

    async fn channel_data(&self, channel: u8, points: WaveformPoints) -> Result<ChannelData> {
        let mut guard = self.client.lock().await;
        let client = guard.as_mut().ok_or_else(not_connected)?;

        for command in [
            format!(":WAV:SOUR CHAN{}", channel),
            ":WAV:MODE RAW".to_string(),
            ":WAV:FORM ASC".to_string(),
            format!(":WAV:POIN {}", points.as_scpi()),
        ] {
            client.write(&command).await?;
        }

        let time_step = client.query_f64(":WAV:XINC?").await?;
        let raw = client
            .query(":WAV:DATA?")
            .await
            .with_context(|| format!("Failed to read waveform for channel {}", channel))?;
        let values = parse_waveform_ascii(&raw)?;

        Ok(ChannelData { time_step, values })
    }

    async fn disconnect(&self) -> Result<()> {
        if let Some(mut client) = self.client.lock().await.take() {
            client
                .stream
                .get_mut()
                .shutdown()
                .await
                .context("Failed to close oscilloscope connection")?;
            tracing::info!("Oscilloscope connection closed");
        }
        Ok(())
    }
}
