use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use psw_control::transport::{DEFAULT_BAUD_RATE, DEFAULT_TIMEOUT};
use psw_control::{ControlMode, OutputState, Psw, SerialSettings};

/// Drive a PSW bench power supply over its USB-CDC serial port.
#[derive(Debug, Parser)]
#[command(name = "psw", version)]
struct Cli {
    /// Serial port the supply is attached to, e.g. /dev/ttyACM0 or COM3.
    #[arg(long, env = "PSW_PORT")]
    port: String,

    #[arg(long, default_value_t = DEFAULT_BAUD_RATE)]
    baud: u32,

    /// Read timeout for each query, in milliseconds.
    #[arg(long, default_value_t = DEFAULT_TIMEOUT.as_millis() as u64)]
    timeout_ms: u64,

    /// Log every SCPI line written and read.
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Print the *IDN? identification string.
    Idn,
    /// Set voltage and current setpoints in one APPLy command.
    Apply { volts: f64, amps: f64 },
    /// Switch the output on or off.
    Output {
        #[arg(value_enum)]
        state: OutputState,
    },
    /// Hand control to the remote interface or back to the front panel.
    Mode {
        #[arg(value_enum)]
        mode: ControlMode,
    },
    /// Read measured voltage and current.
    Measure,
    /// Over-voltage protection.
    Ovp {
        #[command(subcommand)]
        action: ProtectionAction,
    },
    /// Over-current protection.
    Ocp {
        #[command(subcommand)]
        action: ProtectionAction,
    },
    /// Read and decode the questionable condition register.
    Status,
    /// Output off, setpoints to zero, back to local control.
    Reset,
}

#[derive(Debug, Subcommand)]
enum ProtectionAction {
    /// Send a threshold without changing the enable state.
    Set { level: f64 },
    /// Send a threshold and mark protection enabled.
    Enable { level: f64 },
    /// Saturate the threshold to MAX.
    Disable,
    /// Read the threshold back from the instrument.
    Get,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_max_level(if cli.verbose {
            tracing::Level::DEBUG
        } else {
            tracing::Level::INFO
        })
        .init();

    let settings = SerialSettings::default()
        .with_baud_rate(cli.baud)
        .with_timeout(Duration::from_millis(cli.timeout_ms));
    let mut psw = Psw::open_serial(&cli.port, settings)
        .with_context(|| format!("could not connect to {}", cli.port))?;

    let outcome = run(&mut psw, cli.command).await;
    psw.disconnect();
    outcome
}

async fn run(psw: &mut Psw, command: Command) -> Result<()> {
    match command {
        Command::Idn => {
            let idn = psw.identify().await?;
            println!("*IDN? -> {idn}");
        }
        Command::Apply { volts, amps } => {
            psw.apply(volts, amps).await?;
            println!("APPLy {volts:.4},{amps:.4}");
        }
        Command::Output { state } => {
            psw.set_output(state).await?;
            println!("output {state:?}");
        }
        Command::Mode { mode } => {
            psw.set_remote(mode.is_remote()).await?;
            println!("{mode:?} mode");
        }
        Command::Measure => {
            let measurement = psw.measure().await?;
            println!("MEASure:SCALar:ALL? -> {measurement}");
        }
        Command::Ovp { action } => match action {
            ProtectionAction::Set { level } => {
                psw.set_ovp(level).await?;
                println!("OVP level = {level:.4} V");
            }
            ProtectionAction::Enable { level } => {
                psw.enable_ovp(level).await?;
                println!("OVP enabled, level = {level:.4} V");
            }
            ProtectionAction::Disable => {
                psw.disable_ovp().await?;
                println!("OVP disabled (level = MAX)");
            }
            ProtectionAction::Get => {
                let level = psw.get_ovp().await.context("reading OVP level")?;
                println!("OVP level = {level:.4} V");
            }
        },
        Command::Ocp { action } => match action {
            ProtectionAction::Set { level } => {
                psw.set_ocp(level).await?;
                println!("OCP level = {level:.4} A");
            }
            ProtectionAction::Enable { level } => {
                psw.enable_ocp(level).await?;
                println!("OCP enabled, level = {level:.4} A");
            }
            ProtectionAction::Disable => {
                psw.disable_ocp().await?;
                println!("OCP disabled (level = MAX)");
            }
            ProtectionAction::Get => {
                let level = psw.get_ocp().await.context("reading OCP level")?;
                println!("OCP level = {level:.4} A");
            }
        },
        Command::Status => {
            let status = psw.protection_status().await?;
            println!("STAT:QUES:COND? -> {} -> {status}", status.raw);
        }
        Command::Reset => {
            psw.soft_reset().await?;
            println!("soft reset complete");
        }
    }
    Ok(())
}
