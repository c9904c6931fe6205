use std::time::Duration;

use anyhow::{Context, Result};
use psw_control::{Psw, SerialSettings};
use tokio::time::sleep;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .init();

    let args: Vec<String> = std::env::args().collect();
    let port = args.get(1).map(String::as_str).unwrap_or("/dev/ttyACM0");

    let mut psw = Psw::open_serial(port, SerialSettings::default())
        .with_context(|| format!("opening {port}"))?;

    // Start from a known state so earlier sessions don't leak into this one.
    psw.set_remote(true).await?;
    psw.soft_reset().await?;
    psw.set_remote(true).await?;

    psw.enable_ovp(15.0).await?;
    psw.enable_ocp(2.0).await?;
    psw.set_voltage(5.0).await?;
    psw.set_current(1.0).await?;
    psw.output_on().await?;

    sleep(Duration::from_secs(1)).await;

    println!("Measured : {}", psw.measure().await?);
    let status = psw.protection_status().await?;
    println!("Protection: {status}");

    psw.output_off().await?;
    psw.soft_reset().await?;
    println!("Last commanded state: {:?}", psw.state());
    psw.disconnect();
    Ok(())
}
