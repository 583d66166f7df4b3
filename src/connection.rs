use crate::parameters::Parameter;
use crate::protocol::{self, DataEntry, FunctionCode, Packet, VentoCodec};
use futures::Stream;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::time::Instant;
use tokio_util::bytes::BytesMut;
use tokio_util::codec::{Decoder as _, Encoder as _};
use tracing::{debug, info, trace, warn};

/// Controllers listen for requests on this port, for both broadcast and unicast.
pub const CONTROLLER_PORT: u16 = 4000;
/// Device ID used in the discovery request. Controllers answer it with their real ID.
pub const DISCOVERY_DEVICE_ID: &str = "DEFAULT_DEVICEID";
const MAX_DATAGRAM_SIZE: usize = 1024;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("could not bind an UDP socket to {1}")]
    Bind(#[source] std::io::Error, SocketAddr),
    #[error("could not enable broadcast on the UDP socket")]
    EnableBroadcast(#[source] std::io::Error),
    #[error("could not encode the request")]
    Encode(#[source] protocol::Error),
    #[error("could not send the request to {1}")]
    Send(#[source] std::io::Error, SocketAddr),
    #[error("could not receive a datagram")]
    Receive(#[source] std::io::Error),
}

#[derive(clap::Parser, Clone, Debug)]
#[group(id = "connection::Args")]
pub struct Args {
    /// The UDP port controllers listen on.
    #[arg(long, default_value_t = CONTROLLER_PORT)]
    port: u16,

    /// Where to send the discovery request to.
    #[arg(long, default_value_t = IpAddr::V4(Ipv4Addr::BROADCAST))]
    broadcast_address: IpAddr,

    /// Local address to bind the UDP sockets to.
    #[arg(long, default_value = "0.0.0.0:0")]
    bind: SocketAddr,

    /// Consider a request unanswered if no reply arrives within this amount of time.
    #[arg(long, default_value = "1s")]
    timeout: humantime::Duration,

    /// Stop discovery if no further controller replies within this amount of time.
    #[arg(long, default_value = "1s")]
    discovery_receive_timeout: humantime::Duration,

    /// Stop discovery after this amount of time regardless of any further replies.
    #[arg(long, default_value = "1s")]
    discovery_window: humantime::Duration,
}

#[derive(Clone, Debug)]
pub struct TransportConfig {
    pub port: u16,
    pub broadcast_address: IpAddr,
    pub bind_address: SocketAddr,
    pub exchange_timeout: Duration,
    pub discovery_receive_timeout: Duration,
    pub discovery_window: Duration,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            port: CONTROLLER_PORT,
            broadcast_address: IpAddr::V4(Ipv4Addr::BROADCAST),
            bind_address: SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)),
            exchange_timeout: Duration::from_secs(1),
            discovery_receive_timeout: Duration::from_secs(1),
            discovery_window: Duration::from_secs(1),
        }
    }
}

impl From<&Args> for TransportConfig {
    fn from(args: &Args) -> Self {
        Self {
            port: args.port,
            broadcast_address: args.broadcast_address,
            bind_address: args.bind,
            exchange_timeout: *args.timeout,
            discovery_receive_timeout: *args.discovery_receive_timeout,
            discovery_window: *args.discovery_window,
        }
    }
}

/// A controller which answered the discovery broadcast.
#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize)]
pub struct DeviceAddress {
    pub id: String,
    pub ip: IpAddr,
}

#[derive(Clone, Debug)]
pub struct Response {
    pub packet: Packet,
    pub ip: IpAddr,
}

/// Everything that can come out of a single exchange, short of socket failures.
#[derive(Debug)]
pub enum Reply {
    Response(Response),
    /// A well-formed frame arrived, but it is not marked as a response.
    NotAResponse(Packet, IpAddr),
    Malformed(protocol::Error, IpAddr),
    Timeout,
}

impl Reply {
    pub fn into_response(self) -> Option<Response> {
        match self {
            Reply::Response(response) => Some(response),
            Reply::NotAResponse(..) | Reply::Malformed(..) | Reply::Timeout => None,
        }
    }
}

/// Sends requests to controllers.
///
/// Every operation opens its own socket and closes it when it returns or when its future is
/// dropped, so a `Transport` can be shared between concurrent operations freely.
#[derive(Clone, Debug, Default)]
pub struct Transport {
    config: TransportConfig,
}

impl Transport {
    pub fn new(config: TransportConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &TransportConfig {
        &self.config
    }

    pub fn search_packet() -> Packet {
        let entries = vec![DataEntry::of(Parameter::SEARCH)];
        Packet::new(DISCOVERY_DEVICE_ID, "", FunctionCode::Read, entries)
    }

    async fn bind(&self) -> Result<UdpSocket, Error> {
        let address = self.config.bind_address;
        let socket = UdpSocket::bind(address).await.map_err(|e| Error::Bind(e, address))?;
        trace!(message = "bound", local = ?socket.local_addr().ok());
        Ok(socket)
    }

    async fn send(&self, socket: &UdpSocket, packet: &Packet, ip: IpAddr) -> Result<(), Error> {
        let mut buffer = BytesMut::new();
        VentoCodec::default().encode(packet, &mut buffer).map_err(Error::Encode)?;
        let target = SocketAddr::new(ip, self.config.port);
        socket.send_to(&buffer, target).await.map_err(|e| Error::Send(e, target))?;
        debug!(message = "sent", %target, %packet);
        Ok(())
    }

    /// Broadcast the search request and yield the controllers as they answer.
    ///
    /// The stream ends once no reply arrives within the receive timeout, or once the discovery
    /// window since the broadcast has elapsed. Malformed replies are skipped.
    pub fn discover_stream(&self) -> impl Stream<Item = Result<DeviceAddress, Error>> + '_ {
        async_stream::try_stream! {
            let socket = self.bind().await?;
            socket.set_broadcast(true).map_err(Error::EnableBroadcast)?;
            self.send(&socket, &Self::search_packet(), self.config.broadcast_address).await?;
            let window_end = Instant::now() + self.config.discovery_window;
            let mut codec = VentoCodec::default();
            let mut buffer = [0; MAX_DATAGRAM_SIZE];
            loop {
                let now = Instant::now();
                if now >= window_end {
                    debug!("discovery window elapsed");
                    break;
                }
                let deadline = window_end.min(now + self.config.discovery_receive_timeout);
                let received = tokio::time::timeout_at(deadline, socket.recv_from(&mut buffer));
                let Ok(received) = received.await else {
                    debug!("no more discovery replies");
                    break;
                };
                let (len, sender) = received.map_err(Error::Receive)?;
                let mut datagram = BytesMut::from(&buffer[..len]);
                match codec.decode(&mut datagram) {
                    Ok(Some(packet)) => {
                        info!(message = "discovered", id = %packet.device_id, %sender);
                        yield DeviceAddress { id: packet.device_id, ip: sender.ip() };
                    }
                    Ok(None) => debug!(message = "empty datagram", %sender),
                    Err(e) => warn!(
                        message = "skipping malformed discovery reply",
                        %sender,
                        error = (&e as &dyn std::error::Error)
                    ),
                }
            }
        }
    }

    /// Find all controllers on the network.
    pub async fn discover(&self) -> Result<Vec<DeviceAddress>, Error> {
        use futures::TryStreamExt as _;
        self.discover_stream().try_collect().await
    }

    /// Send `packet` to the controller at `ip` and wait for a single reply datagram.
    pub async fn exchange_detailed(&self, packet: &Packet, ip: IpAddr) -> Result<Reply, Error> {
        let socket = self.bind().await?;
        self.send(&socket, packet, ip).await?;
        let mut buffer = [0; MAX_DATAGRAM_SIZE];
        let received = tokio::time::timeout(
            self.config.exchange_timeout,
            socket.recv_from(&mut buffer),
        );
        let Ok(received) = received.await else {
            debug!(message = "no reply", %ip, timeout = ?self.config.exchange_timeout);
            return Ok(Reply::Timeout);
        };
        let (len, sender) = received.map_err(Error::Receive)?;
        let mut datagram = BytesMut::from(&buffer[..len]);
        Ok(match VentoCodec::default().decode(&mut datagram) {
            Ok(Some(packet)) if packet.function == FunctionCode::Response => {
                debug!(message = "received", %sender, %packet);
                Reply::Response(Response { packet, ip: sender.ip() })
            }
            Ok(Some(packet)) => {
                debug!(message = "reply is not a response", %sender, %packet);
                Reply::NotAResponse(packet, sender.ip())
            }
            Ok(None) => Reply::Malformed(protocol::Error::Truncated("header"), sender.ip()),
            Err(e) => {
                warn!(
                    message = "malformed reply",
                    %sender,
                    error = (&e as &dyn std::error::Error)
                );
                Reply::Malformed(e, sender.ip())
            }
        })
    }

    /// Send `packet` to the controller at `ip` without waiting for any reply.
    pub async fn send_only(&self, packet: &Packet, ip: IpAddr) -> Result<(), Error> {
        let socket = self.bind().await?;
        self.send(&socket, packet, ip).await
    }

    /// [`Self::exchange_detailed`], but only the RESPONSE frames are of interest.
    pub async fn exchange(&self, packet: &Packet, ip: IpAddr) -> Result<Option<Response>, Error> {
        Ok(self.exchange_detailed(packet, ip).await?.into_response())
    }
}
