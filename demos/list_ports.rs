// Device discovery example
//
// Lists the USB serial ports that could be an acquisition board and shows
// which one a connection without an explicit port would pick.

use bioamp_recorder::{DeviceConnector, PortIdentity};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    println!("BioAmp Device Discovery");
    println!("=======================\n");

    let ports = DeviceConnector::available_ports()?;
    if ports.is_empty() {
        println!("No USB serial ports found. Please connect a board and try again.");
        return Ok(());
    }

    println!("Found {} port(s):", ports.len());
    for (i, port) in ports.iter().enumerate() {
        let kind = match port.identity() {
            PortIdentity::Board(_, bits) => format!("known board, {} bit", bits.as_str()),
            PortIdentity::Vendor(_) => "known vendor".to_string(),
            PortIdentity::Unknown => "unknown".to_string(),
        };
        println!(
            "  {}. {} - {} ({})",
            i + 1,
            port.port_name,
            port.describe(),
            kind
        );
    }

    if let Some(port) = DeviceConnector::select_port(&ports) {
        println!("\nDefault choice: {}", port.port_name);
    }

    Ok(())
}
