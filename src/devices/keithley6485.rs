use std::io;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{error, info, warn};

use super::transport::{SerialTransport, Transport};

/// Size of the 6485 trace buffer.
pub const MAX_TRACE_POINTS: usize = 2500;
pub const MIN_NPLC: f64 = 0.01;
pub const MAX_NPLC: f64 = 60.0;
/// Upper limit of the 20 mA range, including overrange.
pub const MAX_RANGE_AMPS: f64 = 0.021;

const SETTLE_AFTER_OPEN: Duration = Duration::from_millis(200);

#[derive(Error, Debug)]
pub enum Keithley6485Error {
    #[error("Connection error on {port}: {reason}")]
    Connection { port: String, reason: String },

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Device not connected")]
    NotConnected,

    #[error("Invalid acquisition request: {0}")]
    InvalidRequest(String),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

pub type Result<T> = std::result::Result<T, Keithley6485Error>;

/// Current range used during a burst
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CurrentRange {
    Auto,
    /// Expected maximum current in amps; the instrument picks the range covering it.
    Fixed(f64),
}

/// Data elements the instrument stores per trace point
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FormatElements {
    Reading,
    ReadingTimeStatus,
}

impl FormatElements {
    fn command(self) -> &'static str {
        match self {
            FormatElements::Reading => "FORM:ELEM READ",
            FormatElements::ReadingTimeStatus => "FORM:ELEM READ,TIME,STAT",
        }
    }

    fn fields_per_point(self) -> usize {
        match self {
            FormatElements::Reading => 1,
            FormatElements::ReadingTimeStatus => 3,
        }
    }
}

/// Parameters of one buffered burst.
///
/// Built with [`AcquisitionRequest::new`] and the chained setters, then handed
/// to [`Keithley6485::acquire`] by reference.
#[derive(Debug, Clone, PartialEq)]
pub struct AcquisitionRequest {
    count: usize,
    nplc: f64,
    range: CurrentRange,
    elements: FormatElements,
    read_timeout: Option<Duration>,
}

impl AcquisitionRequest {
    pub fn new(count: usize, nplc: f64) -> Self {
        AcquisitionRequest {
            count,
            nplc,
            range: CurrentRange::Auto,
            elements: FormatElements::Reading,
            read_timeout: None,
        }
    }

    pub fn range(mut self, range: CurrentRange) -> Self {
        self.range = range;
        self
    }

    pub fn elements(mut self, elements: FormatElements) -> Self {
        self.elements = elements;
        self
    }

    /// Timeout for the trace read only. The session timeout is restored afterwards.
    ///
    /// Must cover `count × nplc` line cycles plus transfer time; nothing here
    /// sizes it automatically.
    pub fn read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = Some(timeout);
        self
    }

    pub fn count(&self) -> usize {
        self.count
    }

    pub fn nplc(&self) -> f64 {
        self.nplc
    }

    pub fn current_range(&self) -> CurrentRange {
        self.range
    }

    pub fn format_elements(&self) -> FormatElements {
        self.elements
    }

    pub fn validate(&self) -> Result<()> {
        if self.count == 0 || self.count > MAX_TRACE_POINTS {
            return Err(Keithley6485Error::InvalidRequest(format!(
                "sample count {} outside 1..={}",
                self.count, MAX_TRACE_POINTS
            )));
        }
        if !(MIN_NPLC..=MAX_NPLC).contains(&self.nplc) {
            return Err(Keithley6485Error::InvalidRequest(format!(
                "integration time {} PLC outside {}..={}",
                self.nplc, MIN_NPLC, MAX_NPLC
            )));
        }
        if let CurrentRange::Fixed(amps) = self.range {
            if !(amps > 0.0 && amps <= MAX_RANGE_AMPS) {
                return Err(Keithley6485Error::InvalidRequest(format!(
                    "range {} A outside (0, {}]",
                    amps, MAX_RANGE_AMPS
                )));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct AcquisitionResult {
    /// Currents in amps, in trace order
    pub readings: Vec<f64>,
    /// Seconds since the burst started, only with `ReadingTimeStatus`
    pub timestamps: Option<Vec<f64>>,
    /// Measurement status words, only with `ReadingTimeStatus`
    pub status: Option<Vec<u32>>,
}

impl AcquisitionResult {
    pub fn len(&self) -> usize {
        self.readings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.readings.is_empty()
    }

    /// Drop the first trace point, which carries the trigger latency of the burst.
    pub fn discard_first(&mut self) {
        if self.readings.is_empty() {
            return;
        }
        self.readings.remove(0);
        if let Some(t) = self.timestamps.as_mut() {
            t.remove(0);
        }
        if let Some(s) = self.status.as_mut() {
            s.remove(0);
        }
    }
}

/// Split a `TRAC:DATA?` response into exactly `count` trace points.
pub fn parse_trace(
    response: &str,
    count: usize,
    elements: FormatElements,
) -> Result<AcquisitionResult> {
    let response = response.trim();
    let fields: Vec<&str> = if response.is_empty() {
        Vec::new()
    } else {
        response.split(',').collect()
    };

    let per_point = elements.fields_per_point();
    let expected = count * per_point;
    if fields.len() != expected {
        return Err(Keithley6485Error::Parse(format!(
            "expected {} fields for {} points, got {}",
            expected,
            count,
            fields.len()
        )));
    }

    match elements {
        FormatElements::Reading => Ok(AcquisitionResult {
            readings: fields
                .into_iter()
                .map(parse_field)
                .collect::<Result<_>>()?,
            timestamps: None,
            status: None,
        }),
        FormatElements::ReadingTimeStatus => {
            let mut readings = Vec::with_capacity(count);
            let mut timestamps = Vec::with_capacity(count);
            let mut status = Vec::with_capacity(count);
            for point in fields.chunks_exact(per_point) {
                readings.push(parse_field(point[0])?);
                timestamps.push(parse_field(point[1])?);
                status.push(parse_status(point[2])?);
            }
            Ok(AcquisitionResult {
                readings,
                timestamps: Some(timestamps),
                status: Some(status),
            })
        }
    }
}

fn parse_field(field: &str) -> Result<f64> {
    // Readings carry the unit suffix, e.g. "+1.234567E-09A"
    let field = field.trim();
    match field.trim_end_matches('A').parse::<f64>() {
        Ok(value) if value.is_finite() => Ok(value),
        _ => Err(Keithley6485Error::Parse(format!("not a number: {:?}", field))),
    }
}

/// Status words come back in reading notation, e.g. "+8.000000E+00".
fn parse_status(field: &str) -> Result<u32> {
    let value = parse_field(field)?;
    if value < 0.0 || value.fract() != 0.0 || value > f64::from(u32::MAX) {
        return Err(Keithley6485Error::Parse(format!(
            "not a status word: {:?}",
            field.trim()
        )));
    }
    Ok(value as u32)
}

/// Session with a Keithley 6485 picoammeter.
pub struct Keithley6485<T: Transport = SerialTransport> {
    transport: Option<T>,
    port: String,
    baud_rate: Option<u32>,
}

impl Keithley6485<SerialTransport> {
    pub fn connect(port: &str, baud_rate: u32, timeout: Duration) -> Result<Self> {
        info!("Attempting to connect to Keithley 6485 at {}", port);
        let transport = SerialTransport::open(port, baud_rate, timeout).map_err(|e| {
            error!("Failed to open {}: {}", port, e);
            Keithley6485Error::Connection {
                port: port.to_string(),
                reason: e.to_string(),
            }
        })?;
        std::thread::sleep(SETTLE_AFTER_OPEN);

        info!("Keithley 6485 serial line open on {}", port);
        Ok(Keithley6485 {
            transport: Some(transport),
            port: port.to_string(),
            baud_rate: Some(baud_rate),
        })
    }
}

impl<T: Transport> Keithley6485<T> {
    pub fn with_transport(port: &str, transport: T) -> Self {
        info!("Using supplied transport for Keithley 6485 at {}", port);
        Keithley6485 {
            transport: Some(transport),
            port: port.to_string(),
            baud_rate: None,
        }
    }

    pub fn port(&self) -> &str {
        &self.port
    }

    pub fn baud_rate(&self) -> Option<u32> {
        self.baud_rate
    }

    pub fn is_connected(&self) -> bool {
        self.transport.is_some()
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.transport.as_ref().map(|t| t.timeout())
    }

    fn transport_mut(&mut self) -> Result<&mut T> {
        if self.transport.is_none() {
            error!("Keithley 6485 at {} is not connected", self.port);
        }
        self.transport.as_mut().ok_or(Keithley6485Error::NotConnected)
    }

    /// Send a command without waiting for a reply.
    pub fn write(&mut self, command: &str) -> Result<()> {
        let transport = self.transport_mut()?;
        info!("Sending command to Keithley 6485: {}", command);
        transport.write_line(command)?;
        Ok(())
    }

    pub fn read(&mut self) -> Result<String> {
        let transport = self.transport_mut()?;
        match transport.read_line() {
            Ok(line) => {
                info!("Received response from Keithley 6485: {}", line);
                Ok(line)
            }
            Err(e) if e.kind() == io::ErrorKind::TimedOut => {
                Err(Keithley6485Error::Timeout(e.to_string()))
            }
            Err(e) => Err(Keithley6485Error::Io(e)),
        }
    }

    /// Clear stale input, send `command` and read one response line.
    pub fn query(&mut self, command: &str) -> Result<String> {
        self.transport_mut()?.clear_input()?;
        self.write(command)?;
        self.read()
    }

    pub fn identify(&mut self) -> Result<String> {
        let id = match self.query("*IDN?") {
            Ok(id) => id,
            Err(Keithley6485Error::Timeout(e)) => {
                return Err(Keithley6485Error::Protocol(format!(
                    "no response to *IDN?: {}",
                    e
                )));
            }
            Err(e) => return Err(e),
        };
        if id.is_empty() {
            return Err(Keithley6485Error::Protocol(
                "empty response to *IDN?".to_string(),
            ));
        }
        info!("Keithley 6485 identified as {}", id);
        Ok(id)
    }

    /// Return the instrument to its power-on defaults.
    pub fn reset(&mut self) -> Result<()> {
        info!("Resetting Keithley 6485 to default state");
        self.write("*RST")
    }

    /// Run one buffered burst and read the trace back.
    pub fn acquire(&mut self, request: &AcquisitionRequest) -> Result<AcquisitionResult> {
        request.validate()?;
        // Fail before touching the line if the session is closed
        self.transport_mut()?;

        info!(
            "Arming trace buffer for {} points at {} PLC",
            request.count, request.nplc
        );
        self.configure_burst(request)?;

        match self.query("*OPC?") {
            Ok(_) => {}
            Err(Keithley6485Error::Timeout(e)) => {
                return Err(Keithley6485Error::Protocol(format!(
                    "configuration not acknowledged: {}",
                    e
                )));
            }
            Err(e) => return Err(e),
        }
        self.write(request.elements.command())?;

        // Burst runs on the instrument's own timing, nothing comes back for INIT
        self.write("INIT")?;
        self.write("DISP:ENAB ON")?;

        let data = self.read_trace(request.read_timeout)?;
        let result = parse_trace(&data, request.count, request.elements).map_err(|e| {
            error!("Failed to parse trace data: {}", e);
            e
        })?;
        info!("Acquired {} points", result.len());
        Ok(result)
    }

    fn configure_burst(&mut self, request: &AcquisitionRequest) -> Result<()> {
        self.write("*RST")?;
        self.write("TRIG:DEL 0")?;
        self.write(&format!("TRIG:COUN {}", request.count))?;
        self.write(&format!("NPLC {}", request.nplc))?;
        match request.range {
            CurrentRange::Auto => self.write("SENS:CURR:RANG:AUTO ON")?,
            CurrentRange::Fixed(amps) => self.write(&format!("SENS:CURR:RANG {}", amps))?,
        }
        self.write("SYST:ZCH OFF")?;
        self.write("SYST:AZER:STAT OFF")?;
        self.write("DISP:ENAB OFF")?;
        self.write("*CLS")?;
        self.write(&format!("TRAC:POIN {}", request.count))?;
        self.write("TRAC:CLE")?;
        self.write("TRAC:FEED:CONT NEXT")?;
        self.write("STAT:MEAS:ENAB 512")?;
        self.write("*SRE 1")
    }

    fn read_trace(&mut self, read_timeout: Option<Duration>) -> Result<String> {
        let previous = match read_timeout {
            Some(timeout) => {
                let transport = self.transport_mut()?;
                let previous = transport.timeout();
                transport.set_timeout(timeout)?;
                Some(previous)
            }
            None => None,
        };

        let data = self.query("TRAC:DATA?");

        if let Some(previous) = previous {
            if let Err(e) = self.transport_mut()?.set_timeout(previous) {
                warn!("Failed to restore read timeout to {:?}: {}", previous, e);
            }
        }

        data.map_err(|e| {
            error!("Trace read failed: {}", e);
            e
        })
    }

    /// Release the transport. Calling this on a closed session does nothing.
    pub fn disconnect(&mut self) {
        if self.transport.take().is_some() {
            info!("Disconnected from Keithley 6485 at {}", self.port);
        }
    }
}
