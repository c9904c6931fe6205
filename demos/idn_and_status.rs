use anyhow::{Context, Result};
use psw_control::{Psw, SerialSettings};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .init();

    let args: Vec<String> = std::env::args().collect();
    let port = args.get(1).map(String::as_str).unwrap_or("/dev/ttyACM0");

    let mut psw = Psw::open_serial(port, SerialSettings::default())
        .with_context(|| format!("opening {port}"))?;

    let idn = psw.identify().await?;
    println!("IDN: {idn}");

    let measurement = psw.measure().await?;
    println!("Measured : {measurement}");

    let ovp = psw.get_ovp().await?;
    let ocp = psw.get_ocp().await?;
    println!("OVP level: {ovp:.4} V");
    println!("OCP level: {ocp:.4} A");

    let status = psw.protection_status().await?;
    println!("Condition: {} ({status})", status.raw);

    // Read-only demo: hand the front panel back before leaving.
    psw.set_remote(false).await?;
    psw.disconnect();
    Ok(())
}
