use crate::transport::SerialIo;
use async_trait::async_trait;
use serialport::SerialPortType;
use tokio_serial::SerialPortBuilderExt;

pub const DEFAULT_BAUD_RATE: u32 = 115_200;
pub const DEFAULT_CHUNK_SIZE: usize = 1024;

/// ADC resolution used to scale the live view. Never affects parsing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BitSelection {
    Ten,
    Twelve,
    Fourteen,
    #[default]
    Auto,
}

impl BitSelection {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ten => "ten",
            Self::Twelve => "twelve",
            Self::Fourteen => "fourteen",
            Self::Auto => "auto",
        }
    }

    pub fn bits(&self) -> Option<u32> {
        match self {
            Self::Ten => Some(10),
            Self::Twelve => Some(12),
            Self::Fourteen => Some(14),
            Self::Auto => None,
        }
    }

    /// Largest raw reading at this resolution.
    pub fn full_scale(&self) -> Option<u32> {
        self.bits().map(|b| (1 << b) - 1)
    }
}

impl std::str::FromStr for BitSelection {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ten" | "10" => Ok(Self::Ten),
            "twelve" | "12" => Ok(Self::Twelve),
            "fourteen" | "14" => Ok(Self::Fourteen),
            "auto" => Ok(Self::Auto),
            other => Err(format!("unknown bit selection '{other}'")),
        }
    }
}

#[derive(Debug)]
pub struct BoardInfo {
    pub name: &'static str,
    pub product_id: u16,
    pub bits: BitSelection,
}

const BOARDS: &[BoardInfo] = &[
    BoardInfo {
        name: "Arduino Uno",
        product_id: 0x0043,
        bits: BitSelection::Ten,
    },
    BoardInfo {
        name: "Arduino Mega 2560",
        product_id: 0x0042,
        bits: BitSelection::Ten,
    },
    BoardInfo {
        name: "Arduino Nano Every",
        product_id: 0x0058,
        bits: BitSelection::Ten,
    },
    BoardInfo {
        name: "Arduino UNO R4 Minima",
        product_id: 0x0069,
        bits: BitSelection::Fourteen,
    },
    BoardInfo {
        name: "Arduino UNO R4 WiFi",
        product_id: 0x1002,
        bits: BitSelection::Fourteen,
    },
    BoardInfo {
        name: "Raspberry Pi Pico",
        product_id: 0x000A,
        bits: BitSelection::Twelve,
    },
    BoardInfo {
        name: "ESP32-S3",
        product_id: 0x1001,
        bits: BitSelection::Twelve,
    },
];

const VENDORS: &[(u16, &str)] = &[
    (0x2341, "Arduino"),
    (0x2E8A, "Raspberry Pi"),
    (0x303A, "Espressif"),
    (0x0403, "FTDI"),
    (0x1A86, "WCH"),
    (0x10C4, "Silicon Labs"),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortIdentity {
    Board(&'static str, BitSelection),
    Vendor(&'static str),
    Unknown,
}

/// Known board by product ID first, then known vendor, else unknown.
pub fn identify_port(vendor_id: u16, product_id: u16) -> PortIdentity {
    if let Some(board) = BOARDS.iter().find(|b| b.product_id == product_id) {
        return PortIdentity::Board(board.name, board.bits);
    }
    VENDORS
        .iter()
        .find(|(vid, _)| *vid == vendor_id)
        .map_or(PortIdentity::Unknown, |&(_, name)| PortIdentity::Vendor(name))
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PortDescription {
    pub port_name: String,
    pub vendor_id: Option<u16>,
    pub product_id: Option<u16>,
    pub product: Option<String>,
}

impl PortDescription {
    pub fn new(port_name: impl Into<String>) -> Self {
        Self {
            port_name: port_name.into(),
            ..Self::default()
        }
    }

    pub fn with_usb_ids(mut self, vendor_id: u16, product_id: u16) -> Self {
        self.vendor_id = Some(vendor_id);
        self.product_id = Some(product_id);
        self
    }

    pub fn identity(&self) -> PortIdentity {
        match (self.vendor_id, self.product_id) {
            (Some(vid), Some(pid)) => identify_port(vid, pid),
            _ => PortIdentity::Unknown,
        }
    }

    /// Board or vendor name with the product ID, for connection messages.
    pub fn describe(&self) -> String {
        let (Some(vid), Some(pid)) = (self.vendor_id, self.product_id) else {
            return "Port with no info".to_string();
        };
        match identify_port(vid, pid) {
            PortIdentity::Board(name, _) | PortIdentity::Vendor(name) => {
                format!("{name} | Product ID: {pid}")
            }
            PortIdentity::Unknown => format!("Unknown Vendor | Product ID: {pid}"),
        }
    }

    /// Default bit width when the board is recognised.
    pub fn detected_bits(&self) -> Option<BitSelection> {
        match self.identity() {
            PortIdentity::Board(_, bits) => Some(bits),
            _ => None,
        }
    }
}

/// How to reach the device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionConfig {
    pub port: Option<String>,
    pub baud_rate: u32,
    pub chunk_size: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            port: None,
            baud_rate: DEFAULT_BAUD_RATE,
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }
}

impl ConnectionConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn port(mut self, port: impl Into<String>) -> Self {
        self.port = Some(port.into());
        self
    }

    pub fn baud_rate(mut self, baud_rate: u32) -> Self {
        self.baud_rate = baud_rate;
        self
    }

    pub fn chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size;
        self
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error("Serial port error: {0}")]
    SerialPort(#[from] serialport::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("No serial device found. Please connect a board or specify the port manually")]
    NoDevice,

    #[error("Port {port} is not an available serial device")]
    PortNotFound { port: String },

    #[error("A device is already connected")]
    AlreadyConnected,

    #[error("Port lookup task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

pub struct OpenedPort {
    pub io: Box<dyn SerialIo>,
    pub info: PortDescription,
}

/// Opens the physical connection.
#[async_trait]
pub trait PortOpener: Send + Sync {
    async fn open(&self, config: &ConnectionConfig) -> Result<OpenedPort, ConnectionError>;
}

pub struct DeviceConnector;

impl DeviceConnector {
    /// USB serial ports currently attached.
    pub fn available_ports() -> Result<Vec<PortDescription>, ConnectionError> {
        let ports = serialport::available_ports()?
            .into_iter()
            .filter_map(|port| match port.port_type {
                SerialPortType::UsbPort(usb) => Some(PortDescription {
                    port_name: port.port_name,
                    vendor_id: Some(usb.vid),
                    product_id: Some(usb.pid),
                    product: usb.product,
                }),
                _ => None,
            })
            .collect();
        Ok(ports)
    }

    /// Pick a port: a recognised board first, then any USB serial port.
    pub fn select_port(ports: &[PortDescription]) -> Option<&PortDescription> {
        ports
            .iter()
            .find(|p| p.detected_bits().is_some())
            .or_else(|| ports.first())
    }

    fn resolve(config: &ConnectionConfig) -> Result<PortDescription, ConnectionError> {
        if let Some(port) = &config.port {
            log::debug!("Connecting to device on port {}", port);
            // USB ids are only used for display, so enumeration may fail here
            let known = Self::available_ports().unwrap_or_else(|e| {
                log::debug!("Could not enumerate serial ports: {}", e);
                Vec::new()
            });
            return Ok(known
                .into_iter()
                .find(|p| &p.port_name == port)
                .unwrap_or_else(|| PortDescription::new(port.clone())));
        }

        let ports = Self::available_ports()?;
        log::debug!("Searching {} USB serial port(s) for a device", ports.len());
        Self::select_port(&ports)
            .cloned()
            .ok_or(ConnectionError::NoDevice)
    }
}

/// Opens real serial ports through `tokio-serial`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SerialOpener;

#[async_trait]
impl PortOpener for SerialOpener {
    async fn open(&self, config: &ConnectionConfig) -> Result<OpenedPort, ConnectionError> {
        let lookup = config.clone();
        let resolve = move || DeviceConnector::resolve(&lookup);
        let info = tokio::task::spawn_blocking(resolve).await??;
        let stream = tokio_serial::new(&info.port_name, config.baud_rate)
            .open_native_async()
            .map_err(|e| match e.kind {
                serialport::ErrorKind::NoDevice => ConnectionError::PortNotFound {
                    port: info.port_name.clone(),
                },
                _ => ConnectionError::SerialPort(e),
            })?;

        log::info!(
            "Opened {} at {} baud ({})",
            info.port_name,
            config.baud_rate,
            info.describe()
        );
        Ok(OpenedPort {
            io: Box::new(stream),
            info,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_board_matched_by_product_id() {
        // product id wins even with an unrelated vendor
        assert_eq!(
            identify_port(0xFFFF, 0x0069),
            PortIdentity::Board("Arduino UNO R4 Minima", BitSelection::Fourteen)
        );
    }

    #[test]
    fn test_vendor_fallback() {
        assert_eq!(identify_port(0x1A86, 0x7523), PortIdentity::Vendor("WCH"));
        assert_eq!(identify_port(0x1234, 0x5678), PortIdentity::Unknown);
    }

    #[test]
    fn test_describe_port() {
        let board = PortDescription::new("/dev/ttyACM0").with_usb_ids(0x2341, 0x0043);
        assert_eq!(board.describe(), "Arduino Uno | Product ID: 67");
        assert_eq!(board.detected_bits(), Some(BitSelection::Ten));

        let vendor = PortDescription::new("/dev/ttyUSB0").with_usb_ids(0x0403, 0x6001);
        assert_eq!(vendor.describe(), "FTDI | Product ID: 24577");
        assert_eq!(vendor.detected_bits(), None);

        let unknown = PortDescription::new("/dev/ttyUSB1").with_usb_ids(0x1234, 0x0001);
        assert_eq!(unknown.describe(), "Unknown Vendor | Product ID: 1");

        assert_eq!(PortDescription::new("/dev/ttyS0").describe(), "Port with no info");
    }

    #[test]
    fn test_select_port_prefers_known_board() {
        let ports = vec![
            PortDescription::new("/dev/ttyUSB0").with_usb_ids(0x1A86, 0x7523),
            PortDescription::new("/dev/ttyACM0").with_usb_ids(0x2E8A, 0x000A),
        ];
        assert_eq!(
            DeviceConnector::select_port(&ports).map(|p| p.port_name.as_str()),
            Some("/dev/ttyACM0")
        );
        assert_eq!(
            DeviceConnector::select_port(&ports[..1]).map(|p| p.port_name.as_str()),
            Some("/dev/ttyUSB0")
        );
        assert!(DeviceConnector::select_port(&[]).is_none());
    }

    #[test]
    fn test_bit_selection() {
        assert_eq!(BitSelection::Twelve.full_scale(), Some(4095));
        assert_eq!(BitSelection::Auto.bits(), None);
        assert_eq!("fourteen".parse::<BitSelection>(), Ok(BitSelection::Fourteen));
        assert!("eight".parse::<BitSelection>().is_err());
    }

    #[test]
    fn test_connection_config_defaults() {
        let config = ConnectionConfig::new().port("/dev/ttyACM0");
        assert_eq!(config.baud_rate, 115_200);
        assert_eq!(config.port.as_deref(), Some("/dev/ttyACM0"));
    }

    #[test]
    fn test_available_ports() {
        // Depends on the host; only checks the shape of what comes back
        match DeviceConnector::available_ports() {
            Ok(ports) => {
                for port in ports {
                    assert!(!port.port_name.is_empty());
                    assert!(port.vendor_id.is_some());
                }
            }
            Err(ConnectionError::SerialPort(_)) => {}
            Err(e) => panic!("Unexpected error: {:?}", e),
        }
    }

    #[tokio::test]
    async fn test_serial_opener_missing_port() {
        let config = ConnectionConfig::new().port("/dev/bioamp-missing-port");
        match SerialOpener.open(&config).await {
            Err(ConnectionError::PortNotFound { port }) => {
                assert_eq!(port, "/dev/bioamp-missing-port");
            }
            Err(ConnectionError::SerialPort(_)) => {}
            Err(e) => panic!("Unexpected error: {:?}", e),
            Ok(_) => panic!("Opened a port that does not exist"),
        }
    }
}
