//! Best-effort UPnP port mapping.
//!
//! Nothing here is allowed to fail a caller: every error path ends in a log
//! line and `false`.

use async_trait::async_trait;
use igd_next::aio::Gateway;
use igd_next::aio::tokio::Tokio;
use igd_next::{PortMappingProtocol, SearchError, SearchOptions};
use std::net::{IpAddr, SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Description the router shows next to our mapping
pub const DEFAULT_MAPPING_DESCRIPTION: &str = "DecentralizedSocial";

/// Public address used only to let the OS pick the outbound interface.
/// No packet is sent to it.
const ROUTE_PROBE_ADDR: &str = "8.8.8.8:80";

#[derive(Debug, Error)]
pub enum NatError {
    #[error("No UPnP gateway found")]
    NoGateway,

    #[error("Gateway discovery failed: {0}")]
    SearchError(String),

    #[error("Port mapping request failed: {0}")]
    AddPortError(String),

    #[error("Could not determine local address: {0}")]
    LocalAddressError(#[from] std::io::Error),
}

/// A TCP mapping from the gateway's external port to this machine
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortMappingRequest {
    pub external_port: u16,
    pub internal_addr: SocketAddr,
    /// Lease in seconds; zero asks for a permanent mapping
    pub lease_duration: u32,
    pub description: String,
}

/// A router able to accept port-mapping requests
#[async_trait]
pub trait InternetGateway: Send + Sync {
    /// Human-readable name for logs
    fn name(&self) -> String;

    async fn add_port_mapping(&self, request: &PortMappingRequest) -> Result<(), NatError>;
}

/// Discovery of routers on the local network
#[async_trait]
pub trait GatewaySearch: Send + Sync {
    /// All gateways that answered, in discovery order
    async fn discover(&self) -> Result<Vec<Box<dyn InternetGateway>>, NatError>;
}

/// SSDP discovery through `igd-next`
#[derive(Debug, Clone)]
pub struct IgdSearch {
    timeout: Duration,
}

impl IgdSearch {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl Default for IgdSearch {
    fn default() -> Self {
        Self::new(Duration::from_secs(5))
    }
}

#[async_trait]
impl GatewaySearch for IgdSearch {
    async fn discover(&self) -> Result<Vec<Box<dyn InternetGateway>>, NatError> {
        let options = SearchOptions {
            timeout: Some(self.timeout),
            ..Default::default()
        };

        match igd_next::aio::tokio::search_gateway(options).await {
            Ok(gateway) => {
                debug!("Found UPnP gateway at {}", gateway.addr);
                Ok(vec![Box::new(IgdGateway { gateway }) as Box<dyn InternetGateway>])
            }
            Err(SearchError::NoResponseWithinTimeout) => Ok(Vec::new()),
            Err(e) => Err(NatError::SearchError(e.to_string())),
        }
    }
}

struct IgdGateway {
    gateway: Gateway<Tokio>,
}

#[async_trait]
impl InternetGateway for IgdGateway {
    fn name(&self) -> String {
        self.gateway.addr.to_string()
    }

    async fn add_port_mapping(&self, request: &PortMappingRequest) -> Result<(), NatError> {
        self.gateway
            .add_port(
                PortMappingProtocol::TCP,
                request.external_port,
                request.internal_addr,
                request.lease_duration,
                &request.description,
            )
            .await
            .map_err(|e| NatError::AddPortError(e.to_string()))
    }
}

/// Requests router port mappings for the node's listen port
pub struct NatTraversal {
    search: Box<dyn GatewaySearch>,
    description: String,
    /// Pins the internal client address instead of probing the route table
    internal_ip: Option<IpAddr>,
    upnp_enabled: AtomicBool,
}

impl NatTraversal {
    pub fn new(search: impl GatewaySearch + 'static) -> Self {
        Self {
            search: Box::new(search),
            description: DEFAULT_MAPPING_DESCRIPTION.to_string(),
            internal_ip: None,
            upnp_enabled: AtomicBool::new(false),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_internal_ip(mut self, ip: IpAddr) -> Self {
        self.internal_ip = Some(ip);
        self
    }

    /// Whether a mapping has been established since startup
    pub fn is_enabled(&self) -> bool {
        self.upnp_enabled.load(Ordering::Acquire)
    }

    /// Map external TCP `port` to `port` on this machine via the first
    /// gateway discovered. Returns true only if the gateway accepted it.
    pub async fn request_port_mapping(&self, port: u16) -> bool {
        match self.try_port_mapping(port).await {
            Ok(gateway) => {
                self.upnp_enabled.store(true, Ordering::Release);
                info!("UPnP port forwarding enabled on {} for port {}", gateway, port);
                true
            }
            Err(e) => {
                warn!("UPnP port forwarding failed: {}", e);
                false
            }
        }
    }

    async fn try_port_mapping(&self, port: u16) -> Result<String, NatError> {
        let gateway = self
            .search
            .discover()
            .await?
            .into_iter()
            .next()
            .ok_or(NatError::NoGateway)?;

        let internal_ip = match self.internal_ip {
            Some(ip) => ip,
            None => local_ip()?,
        };

        let request = PortMappingRequest {
            external_port: port,
            internal_addr: SocketAddr::new(internal_ip, port),
            lease_duration: 0,
            description: self.description.clone(),
        };
        gateway.add_port_mapping(&request).await?;

        Ok(gateway.name())
    }
}

impl Default for NatTraversal {
    fn default() -> Self {
        Self::new(IgdSearch::default())
    }
}

impl std::fmt::Debug for NatTraversal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NatTraversal")
            .field("description", &self.description)
            .field("internal_ip", &self.internal_ip)
            .field("upnp_enabled", &self.is_enabled())
            .finish()
    }
}

/// Address of the interface the OS would use to reach the internet.
///
/// Connecting a UDP socket sends nothing; it only fixes the local endpoint.
pub fn local_ip() -> std::io::Result<IpAddr> {
    let socket = UdpSocket::bind("0.0.0.0:0")?;
    socket.connect(ROUTE_PROBE_ADDR)?;
    Ok(socket.local_addr()?.ip())
}
