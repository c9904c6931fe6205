use std::fmt;

use clap::ValueEnum;
use tracing::{debug, info, warn};

use crate::error::{PswError, Result};
use crate::transport::{SerialSettings, SerialTransport, Transport};

const IDN: &str = "*IDN?";
const MEASURE_ALL: &str = "MEASure:SCALar:ALL?";
const QUESTIONABLE_CONDITION: &str = "STATus:QUEStionable:CONDition?";
/// Protection level token that saturates the threshold, effectively disabling it.
const LEVEL_MAX: &str = "MAX";

const OVP_BIT: u32 = 1 << 0;
const OCP_BIT: u32 = 1 << 1;

#[derive(Debug, Clone, Copy, ValueEnum, PartialEq, Eq, Default)]
pub enum OutputState {
    On,
    #[default]
    Off,
}

impl OutputState {
    fn as_str(self) -> &'static str {
        match self {
            OutputState::On => "ON",
            OutputState::Off => "OFF",
        }
    }
}

/// Whether the front panel or the remote interface is in control.
#[derive(Debug, Clone, Copy, ValueEnum, PartialEq, Eq, Default)]
pub enum ControlMode {
    Remote,
    #[default]
    Local,
}

impl ControlMode {
    fn as_scpi(self) -> &'static str {
        match self {
            ControlMode::Remote => "SYSTem:REMote",
            ControlMode::Local => "SYSTem:LOCal",
        }
    }

    pub fn is_remote(self) -> bool {
        matches!(self, ControlMode::Remote)
    }
}

impl From<bool> for ControlMode {
    fn from(remote: bool) -> Self {
        if remote {
            ControlMode::Remote
        } else {
            ControlMode::Local
        }
    }
}

/// Which of the two protection circuits a command addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Protection {
    OverVoltage,
    OverCurrent,
}

impl Protection {
    fn level_header(self) -> &'static str {
        match self {
            Protection::OverVoltage => "SOURce:VOLTage:PROTection:LEVel",
            Protection::OverCurrent => "SOURce:CURRent:PROTection:LEVel",
        }
    }

    fn label(self) -> &'static str {
        match self {
            Protection::OverVoltage => "OVP level",
            Protection::OverCurrent => "OCP level",
        }
    }
}

/// Last commanded configuration of one protection circuit.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct ProtectionSetting {
    pub enabled: bool,
    /// Last numeric threshold sent, in volts or amps.
    pub level: Option<f64>,
}

/// Snapshot of what the controller last commanded.
///
/// The protocol has no acknowledgements, so output, mode and protection flags
/// record what was sent, not what the instrument confirmed.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DeviceState {
    pub connected: bool,
    pub output: OutputState,
    pub mode: ControlMode,
    pub target_voltage_v: f64,
    pub target_current_a: f64,
    pub ovp: ProtectionSetting,
    pub ocp: ProtectionSetting,
}

/// One `MEASure:SCALar:ALL?` reading.
///
/// Both values are `None` when the reply is not `"<float>,<float>"`; `raw`
/// always holds the reply as received.
#[derive(Debug, Clone, PartialEq)]
pub struct Measurement {
    pub voltage_v: Option<f64>,
    pub current_a: Option<f64>,
    pub raw: String,
}

impl Measurement {
    pub fn parse(raw: &str) -> Self {
        let (voltage_v, current_a) = match parse_voltage_current(raw) {
            Some((v, i)) => (Some(v), Some(i)),
            None => (None, None),
        };
        Measurement {
            voltage_v,
            current_a,
            raw: raw.to_string(),
        }
    }

    pub fn is_known(&self) -> bool {
        self.voltage_v.is_some() && self.current_a.is_some()
    }
}

impl fmt::Display for Measurement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.voltage_v, self.current_a) {
            (Some(v), Some(i)) => write!(f, "{v:.4} V, {i:.4} A"),
            _ => write!(f, "unparsed reply {:?}", self.raw),
        }
    }
}

/// Decoded questionable condition register.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProtectionStatus {
    /// Register value as returned, including bits this type does not decode.
    pub raw: u32,
    pub over_voltage: bool,
    pub over_current: bool,
}

impl ProtectionStatus {
    pub fn from_word(word: u32) -> Self {
        ProtectionStatus {
            raw: word,
            over_voltage: word & OVP_BIT != 0,
            over_current: word & OCP_BIT != 0,
        }
    }

    pub fn tripped(&self) -> bool {
        self.over_voltage || self.over_current
    }
}

impl fmt::Display for ProtectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.over_voltage, self.over_current) {
            (true, true) => f.write_str("OVP TRIPPED, OCP TRIPPED"),
            (true, false) => f.write_str("OVP TRIPPED"),
            (false, true) => f.write_str("OCP TRIPPED"),
            (false, false) => f.write_str("no protection trip"),
        }
    }
}

/// Controller for a GW Instek PSW style single-channel supply.
///
/// Every operation writes at most one line and reads at most one reply before
/// returning. Operations take `&mut self`; callers driving one controller from
/// several tasks must serialize access, e.g. with a `tokio::sync::Mutex`.
pub struct Psw<T: Transport = SerialTransport> {
    transport: T,
    settings: SerialSettings,
    target_voltage_v: f64,
    target_current_a: f64,
    output: OutputState,
    mode: ControlMode,
    ovp: ProtectionSetting,
    ocp: ProtectionSetting,
}

impl Psw<SerialTransport> {
    /// Open `port` over a native serial link.
    pub fn open_serial(port: &str, settings: SerialSettings) -> Result<Self> {
        let mut psw = Psw::new(SerialTransport::new(), settings);
        psw.connect(port)?;
        Ok(psw)
    }
}

impl<T: Transport> Psw<T> {
    pub fn new(transport: T, settings: SerialSettings) -> Self {
        Self {
            transport,
            settings,
            target_voltage_v: 0.0,
            target_current_a: 0.0,
            output: OutputState::Off,
            mode: ControlMode::Local,
            ovp: ProtectionSetting::default(),
            ocp: ProtectionSetting::default(),
        }
    }

    /// Open the connection, replacing any connection already open.
    pub fn connect(&mut self, port: &str) -> Result<()> {
        if self.transport.is_open() {
            self.disconnect();
        }
        self.transport.open(port, &self.settings)?;
        info!(
            "connected to {port} ({} baud, timeout {:?})",
            self.settings.baud_rate, self.settings.timeout
        );
        Ok(())
    }

    /// Close the connection. The instrument's real state is unknown once the
    /// link is gone, so the mirror falls back to output off, local mode.
    pub fn disconnect(&mut self) {
        if self.transport.is_open() {
            info!("disconnected");
        }
        self.transport.close();
        self.output = OutputState::Off;
        self.mode = ControlMode::Local;
    }

    pub fn is_connected(&self) -> bool {
        self.transport.is_open()
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    pub fn state(&self) -> DeviceState {
        DeviceState {
            connected: self.transport.is_open(),
            output: self.output,
            mode: self.mode,
            target_voltage_v: self.target_voltage_v,
            target_current_a: self.target_current_a,
            ovp: self.ovp,
            ocp: self.ocp,
        }
    }

    pub fn target_voltage(&self) -> f64 {
        self.target_voltage_v
    }

    pub fn target_current(&self) -> f64 {
        self.target_current_a
    }

    /// Last commanded output state.
    pub fn output(&self) -> OutputState {
        self.output
    }

    /// Last commanded control mode.
    pub fn mode(&self) -> ControlMode {
        self.mode
    }

    /// Query `*IDN?` and return the identification string unparsed.
    pub async fn identify(&mut self) -> Result<String> {
        self.query_required(IDN).await
    }

    /// Send both setpoints in one `APPLy` command.
    ///
    /// The mirrored setpoints change only once the command has been written.
    pub async fn apply(&mut self, volts: f64, amps: f64) -> Result<()> {
        self.ensure_connected()?;
        ensure_non_negative("voltage", volts)?;
        ensure_non_negative("current", amps)?;
        self.write(&format!("APPLy {},{}", format_level(volts), format_level(amps)))
            .await?;
        self.target_voltage_v = volts;
        self.target_current_a = amps;
        Ok(())
    }

    /// Change the voltage setpoint, resending the current setpoint with it.
    pub async fn set_voltage(&mut self, volts: f64) -> Result<()> {
        let amps = self.target_current_a;
        self.apply(volts, amps).await
    }

    /// Change the current setpoint, resending the voltage setpoint with it.
    pub async fn set_current(&mut self, amps: f64) -> Result<()> {
        let volts = self.target_voltage_v;
        self.apply(volts, amps).await
    }

    pub async fn set_output(&mut self, state: OutputState) -> Result<()> {
        self.write(&format!("OUTPut:STATe {}", state.as_str())).await?;
        self.output = state;
        Ok(())
    }

    pub async fn output_on(&mut self) -> Result<()> {
        self.set_output(OutputState::On).await
    }

    pub async fn output_off(&mut self) -> Result<()> {
        self.set_output(OutputState::Off).await
    }

    /// Hand control to the remote interface (`true`) or back to the front panel.
    pub async fn set_remote(&mut self, remote: bool) -> Result<()> {
        let mode = ControlMode::from(remote);
        self.write(mode.as_scpi()).await?;
        self.mode = mode;
        Ok(())
    }

    /// Read measured output voltage and current.
    ///
    /// A malformed or empty reply is not an error: it yields a [`Measurement`]
    /// with unknown values and the raw reply.
    pub async fn measure(&mut self) -> Result<Measurement> {
        let reply = self.query(MEASURE_ALL).await?;
        let measurement = Measurement::parse(&reply);
        if !measurement.is_known() {
            warn!("could not parse measurement reply {reply:?}");
        }
        Ok(measurement)
    }

    /// Send a new over-voltage threshold without touching the enable flag.
    pub async fn set_ovp(&mut self, volts: f64) -> Result<()> {
        self.set_protection_level(Protection::OverVoltage, volts).await
    }

    /// Send a new over-current threshold without touching the enable flag.
    pub async fn set_ocp(&mut self, amps: f64) -> Result<()> {
        self.set_protection_level(Protection::OverCurrent, amps).await
    }

    pub async fn enable_ovp(&mut self, threshold_v: f64) -> Result<()> {
        self.set_protection_level(Protection::OverVoltage, threshold_v)
            .await?;
        self.ovp.enabled = true;
        Ok(())
    }

    pub async fn enable_ocp(&mut self, threshold_a: f64) -> Result<()> {
        self.set_protection_level(Protection::OverCurrent, threshold_a)
            .await?;
        self.ocp.enabled = true;
        Ok(())
    }

    /// Disable over-voltage protection by saturating its level to `MAX`.
    pub async fn disable_ovp(&mut self) -> Result<()> {
        self.saturate_protection(Protection::OverVoltage).await?;
        self.ovp.enabled = false;
        Ok(())
    }

    /// Disable over-current protection by saturating its level to `MAX`.
    pub async fn disable_ocp(&mut self) -> Result<()> {
        self.saturate_protection(Protection::OverCurrent).await?;
        self.ocp.enabled = false;
        Ok(())
    }

    /// Read back the over-voltage threshold from the instrument.
    pub async fn get_ovp(&mut self) -> Result<f64> {
        self.query_protection_level(Protection::OverVoltage).await
    }

    /// Read back the over-current threshold from the instrument.
    pub async fn get_ocp(&mut self) -> Result<f64> {
        self.query_protection_level(Protection::OverCurrent).await
    }

    /// Read the questionable condition register and decode OVP/OCP trips.
    pub async fn protection_status(&mut self) -> Result<ProtectionStatus> {
        let reply = self.query_required(QUESTIONABLE_CONDITION).await?;
        let word = parse_condition(QUESTIONABLE_CONDITION, &reply)?;
        Ok(ProtectionStatus::from_word(word))
    }

    /// Bring the supply into a known, safe state: output off, setpoints at
    /// 0 V / 0 A, control returned to the front panel.
    pub async fn soft_reset(&mut self) -> Result<()> {
        debug!("soft_reset: turning output OFF");
        self.output_off().await?;

        debug!("soft_reset: resetting setpoints to 0 V / 0 A");
        self.apply(0.0, 0.0).await?;

        debug!("soft_reset: returning to LOCAL");
        self.set_remote(false).await?;

        debug!("soft_reset: complete");
        Ok(())
    }

    async fn set_protection_level(&mut self, protection: Protection, level: f64) -> Result<()> {
        self.ensure_connected()?;
        ensure_non_negative(protection.label(), level)?;
        self.write(&format!(
            "{} {}",
            protection.level_header(),
            format_level(level)
        ))
        .await?;
        self.protection_mut(protection).level = Some(level);
        Ok(())
    }

    async fn saturate_protection(&mut self, protection: Protection) -> Result<()> {
        self.write(&format!("{} {}", protection.level_header(), LEVEL_MAX))
            .await
    }

    async fn query_protection_level(&mut self, protection: Protection) -> Result<f64> {
        let command = format!("{}?", protection.level_header());
        let reply = self.query_required(&command).await?;
        parse_f64(&command, &reply)
    }

    fn protection_mut(&mut self, protection: Protection) -> &mut ProtectionSetting {
        match protection {
            Protection::OverVoltage => &mut self.ovp,
            Protection::OverCurrent => &mut self.ocp,
        }
    }

    fn ensure_connected(&self) -> Result<()> {
        if self.transport.is_open() {
            Ok(())
        } else {
            Err(PswError::NotConnected)
        }
    }

    async fn write(&mut self, command: &str) -> Result<()> {
        self.ensure_connected()?;
        debug!("SCPI write  -> {command}");
        self.transport.send_line(command).await
    }

    async fn query(&mut self, command: &str) -> Result<String> {
        self.write(command).await?;
        let reply = self.transport.receive_line().await?;
        debug!("SCPI result <- {reply}");
        Ok(reply)
    }

    async fn query_required(&mut self, command: &str) -> Result<String> {
        let reply = self.query(command).await?;
        if reply.trim().is_empty() {
            return Err(PswError::NoResponse {
                command: command.to_string(),
            });
        }
        Ok(reply)
    }
}

fn format_level(value: f64) -> String {
    format!("{value:.4}")
}

fn ensure_non_negative(what: &'static str, value: f64) -> Result<()> {
    if value.is_finite() && value >= 0.0 {
        Ok(())
    } else {
        Err(PswError::InvalidValue { what, value })
    }
}

/// Split a `"<voltage>,<current>"` reply into its two values.
fn parse_voltage_current(reply: &str) -> Option<(f64, f64)> {
    let (voltage, current) = reply.trim().split_once(',')?;
    let voltage = voltage.trim().parse::<f64>().ok()?;
    let current = current.trim().parse::<f64>().ok()?;
    Some((voltage, current))
}

fn parse_f64(command: &str, reply: &str) -> Result<f64> {
    reply
        .trim()
        .parse::<f64>()
        .map_err(|e| PswError::protocol(command, reply, e))
}

fn parse_condition(command: &str, reply: &str) -> Result<u32> {
    reply
        .trim()
        .parse::<u32>()
        .map_err(|e| PswError::protocol(command, reply, e))
}
