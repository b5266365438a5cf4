/*!
 * Connection strings.
 *
 * Endpoints are written as `scheme://key=value;key=value`, for example
 * `tcp://host=10.0.0.5;port=23` or `serial://path=/dev/ttyUSB0;baud=9600`.
 */
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::str::FromStr;

use crate::error::{LinkError, Result};

/// Default serial line speed
pub const DEFAULT_BAUD_RATE: u32 = 9600;

/// Parity setting for serial lines
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Parity {
    /// No parity bit
    #[default]
    None,
    /// Odd parity
    Odd,
    /// Even parity
    Even,
}

/// Serial line settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SerialSettings {
    /// Device path, e.g. `/dev/ttyUSB0` or `COM3`
    pub path: String,
    /// Line speed
    pub baud_rate: u32,
    /// Data bits (5 to 8)
    pub data_bits: u8,
    /// Parity
    pub parity: Parity,
    /// Stop bits (1 or 2)
    pub stop_bits: u8,
}

impl SerialSettings {
    /// 8N1 settings at the given speed
    pub fn new(path: impl Into<String>, baud_rate: u32) -> Self {
        Self {
            path: path.into(),
            baud_rate,
            data_bits: 8,
            parity: Parity::None,
            stop_bits: 1,
        }
    }
}

/// Where a link connects to
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    /// TCP stream
    Tcp {
        /// Host name or address
        host: String,
        /// Port
        port: u16,
    },
    /// Connected UDP socket
    Udp {
        /// Host name or address
        host: String,
        /// Remote port
        port: u16,
        /// Local port to bind; 0 picks an ephemeral port
        local_port: u16,
    },
    /// Serial line
    Serial(SerialSettings),
    /// In-process scripted transport
    Memory {
        /// Name used as the peer address
        name: String,
    },
}

impl Endpoint {
    /// Scheme used to pick a transport factory
    pub fn scheme(&self) -> &'static str {
        match self {
            Endpoint::Tcp { .. } => "tcp",
            Endpoint::Udp { .. } => "udp",
            Endpoint::Serial(_) => "serial",
            Endpoint::Memory { .. } => "memory",
        }
    }

    /// Parse a connection string
    pub fn parse(conn_str: &str) -> Result<Self> {
        let (scheme, params) = parse_connection_string(conn_str)?;

        match scheme.as_str() {
            "tcp" => Ok(Endpoint::Tcp {
                host: required(&params, "host", conn_str)?,
                port: parse_param(&params, "port", conn_str)?
                    .ok_or_else(|| missing("port", conn_str))?,
            }),
            "udp" => Ok(Endpoint::Udp {
                host: required(&params, "host", conn_str)?,
                port: parse_param(&params, "port", conn_str)?
                    .ok_or_else(|| missing("port", conn_str))?,
                local_port: parse_param(&params, "local_port", conn_str)?.unwrap_or(0),
            }),
            "serial" => {
                let mut settings = SerialSettings::new(
                    required(&params, "path", conn_str)?,
                    parse_param(&params, "baud", conn_str)?.unwrap_or(DEFAULT_BAUD_RATE),
                );
                if let Some(bits) = parse_param::<u8>(&params, "data_bits", conn_str)? {
                    if !(5..=8).contains(&bits) {
                        return Err(invalid("data_bits", conn_str));
                    }
                    settings.data_bits = bits;
                }
                if let Some(bits) = parse_param::<u8>(&params, "stop_bits", conn_str)? {
                    if bits != 1 && bits != 2 {
                        return Err(invalid("stop_bits", conn_str));
                    }
                    settings.stop_bits = bits;
                }
                if let Some(parity) = params.get("parity") {
                    settings.parity = match parity.to_ascii_lowercase().as_str() {
                        "none" | "n" => Parity::None,
                        "odd" | "o" => Parity::Odd,
                        "even" | "e" => Parity::Even,
                        _ => return Err(invalid("parity", conn_str)),
                    };
                }
                Ok(Endpoint::Serial(settings))
            }
            "memory" => Ok(Endpoint::Memory {
                name: params.get("name").cloned().unwrap_or_else(|| "memory".to_string()),
            }),
            other => Err(LinkError::UnsupportedTransport(other.to_string())),
        }
    }

    fn params(&self) -> BTreeMap<&'static str, String> {
        let mut params = BTreeMap::new();
        match self {
            Endpoint::Tcp { host, port } => {
                params.insert("host", host.clone());
                params.insert("port", port.to_string());
            }
            Endpoint::Udp { host, port, local_port } => {
                params.insert("host", host.clone());
                params.insert("port", port.to_string());
                if *local_port != 0 {
                    params.insert("local_port", local_port.to_string());
                }
            }
            Endpoint::Serial(settings) => {
                params.insert("path", settings.path.clone());
                params.insert("baud", settings.baud_rate.to_string());
                params.insert("data_bits", settings.data_bits.to_string());
                params.insert("stop_bits", settings.stop_bits.to_string());
                let parity = match settings.parity {
                    Parity::None => "none",
                    Parity::Odd => "odd",
                    Parity::Even => "even",
                };
                params.insert("parity", parity.to_string());
            }
            Endpoint::Memory { name } => {
                params.insert("name", name.clone());
            }
        }
        params
    }
}

impl FromStr for Endpoint {
    type Err = LinkError;

    fn from_str(s: &str) -> Result<Self> {
        Endpoint::parse(s)
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let params = self
            .params()
            .into_iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect::<Vec<String>>()
            .join(";");
        write!(f, "{}://{}", self.scheme(), params)
    }
}

/// Split a connection string into its scheme and parameters
///
/// Connection string format: "scheme://param1=value1;param2=value2"
pub fn parse_connection_string(conn_str: &str) -> Result<(String, HashMap<String, String>)> {
    let (scheme, params_str) = conn_str
        .split_once("://")
        .ok_or_else(|| LinkError::InvalidEndpoint(conn_str.to_string()))?;

    if scheme.is_empty() {
        return Err(LinkError::InvalidEndpoint(conn_str.to_string()));
    }

    let mut params = HashMap::new();
    for param in params_str.split(';') {
        let param = param.trim();
        if param.is_empty() {
            continue;
        }

        let (key, value) = param.split_once('=').ok_or_else(|| {
            LinkError::InvalidEndpoint(format!("bad parameter '{}' in {}", param, conn_str))
        })?;
        params.insert(key.trim().to_string(), value.trim().to_string());
    }

    Ok((scheme.to_ascii_lowercase(), params))
}

/// Build a connection string from a scheme and parameters
pub fn build_connection_string(scheme: &str, params: &HashMap<String, String>) -> String {
    let mut pairs: Vec<String> = params.iter().map(|(k, v)| format!("{}={}", k, v)).collect();
    pairs.sort();
    format!("{}://{}", scheme, pairs.join(";"))
}

fn required(params: &HashMap<String, String>, key: &str, conn_str: &str) -> Result<String> {
    params
        .get(key)
        .filter(|v| !v.is_empty())
        .cloned()
        .ok_or_else(|| missing(key, conn_str))
}

fn parse_param<T: FromStr>(
    params: &HashMap<String, String>,
    key: &str,
    conn_str: &str,
) -> Result<Option<T>> {
    params
        .get(key)
        .map(|v| v.parse::<T>().map_err(|_| invalid(key, conn_str)))
        .transpose()
}

fn missing(key: &str, conn_str: &str) -> LinkError {
    LinkError::InvalidEndpoint(format!("missing '{}' in {}", key, conn_str))
}

fn invalid(key: &str, conn_str: &str) -> LinkError {
    LinkError::InvalidEndpoint(format!("invalid '{}' in {}", key, conn_str))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_tcp() {
        let endpoint: Endpoint = "tcp://host=10.0.0.5;port=23".parse().unwrap();
        assert_eq!(
            endpoint,
            Endpoint::Tcp {
                host: "10.0.0.5".to_string(),
                port: 23
            }
        );
        assert_eq!(endpoint.scheme(), "tcp");
        assert_eq!(endpoint.to_string(), "tcp://host=10.0.0.5;port=23");
    }

    #[test]
    fn test_parse_udp_and_serial() {
        let udp = Endpoint::parse("udp://host=mixer.local; port=1702; local_port=1703").unwrap();
        assert_eq!(
            udp,
            Endpoint::Udp {
                host: "mixer.local".to_string(),
                port: 1702,
                local_port: 1703
            }
        );

        let serial = Endpoint::parse("serial://path=/dev/ttyUSB0;baud=19200;parity=E").unwrap();
        match serial {
            Endpoint::Serial(settings) => {
                assert_eq!(settings.path, "/dev/ttyUSB0");
                assert_eq!(settings.baud_rate, 19200);
                assert_eq!(settings.parity, Parity::Even);
                assert_eq!(settings.data_bits, 8);
            }
            other => panic!("unexpected endpoint {:?}", other),
        }

        let defaults = Endpoint::parse("serial://path=COM3").unwrap();
        assert_eq!(defaults, Endpoint::Serial(SerialSettings::new("COM3", DEFAULT_BAUD_RATE)));
    }

    #[test]
    fn test_display_round_trips() {
        let serial = Endpoint::Serial(SerialSettings::new("/dev/ttyS1", 115200));
        assert_eq!(Endpoint::parse(&serial.to_string()).unwrap(), serial);
    }

    #[test]
    fn test_invalid_endpoints() {
        assert!(matches!(Endpoint::parse("10.0.0.5:23"), Err(LinkError::InvalidEndpoint(_))));
        assert!(matches!(Endpoint::parse("tcp://host=a"), Err(LinkError::InvalidEndpoint(_))));
        assert!(matches!(
            Endpoint::parse("tcp://host=a;port=http"),
            Err(LinkError::InvalidEndpoint(_))
        ));
        assert!(matches!(
            Endpoint::parse("serial://path=COM1;stop_bits=3"),
            Err(LinkError::InvalidEndpoint(_))
        ));
        assert!(matches!(
            Endpoint::parse("tcp://host"),
            Err(LinkError::InvalidEndpoint(_))
        ));
        assert!(matches!(
            Endpoint::parse("ssh://host=a;port=22"),
            Err(LinkError::UnsupportedTransport(s)) if s == "ssh"
        ));
    }

    #[test]
    fn test_build_connection_string() {
        let mut params = HashMap::new();
        params.insert("port".to_string(), "23".to_string());
        params.insert("host".to_string(), "display".to_string());
        assert_eq!(build_connection_string("tcp", &params), "tcp://host=display;port=23");

        let (scheme, parsed) = parse_connection_string("TCP://host=display;port=23;").unwrap();
        assert_eq!(scheme, "tcp");
        assert_eq!(parsed, params);
    }
}
