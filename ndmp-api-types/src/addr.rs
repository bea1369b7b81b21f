use serde::{Deserialize, Serialize};

use crate::Pval;

/// Data connection address type discriminant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AddrType {
    /// In-process linkage between DATA and MOVER
    Local,
    /// TCP image stream
    Tcp,
    /// Leave the existing connection in place (v3/v4 DATA_CONNECT
    /// preceded the start request)
    AsConnected,
}

/// TCP endpoint of an image stream, as advertised in listen replies.
///
/// The environment list is an NDMPv4 addition; it is dropped when the
/// address is bridged to older versions.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TcpAddr {
    pub ip_addr: u32,
    pub port: u16,
    pub addr_env: Vec<Pval>,
}

impl TcpAddr {
    pub fn new(ip_addr: u32, port: u16) -> Self {
        TcpAddr {
            ip_addr,
            port,
            addr_env: Vec::new(),
        }
    }

    pub fn to_socket_addr(&self) -> std::net::SocketAddr {
        let ip = std::net::Ipv4Addr::from(self.ip_addr);
        std::net::SocketAddr::new(std::net::IpAddr::V4(ip), self.port)
    }
}

/// A data connection address.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataAddr {
    Local,
    Tcp(TcpAddr),
    AsConnected,
}

impl Default for DataAddr {
    fn default() -> Self {
        DataAddr::Local
    }
}

impl DataAddr {
    pub fn addr_type(&self) -> AddrType {
        match self {
            DataAddr::Local => AddrType::Local,
            DataAddr::Tcp(_) => AddrType::Tcp,
            DataAddr::AsConnected => AddrType::AsConnected,
        }
    }
}
