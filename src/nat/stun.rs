//! STUN binding requests (RFC 5389)

use super::NatError;
use async_trait::async_trait;
use bytecodec::{DecodeExt, EncodeExt};
use std::net::SocketAddr;
use std::time::Duration;
use stun_codec::rfc5389::attributes::Software;
use stun_codec::rfc5389::methods::BINDING;
use stun_codec::rfc5389::Attribute;
use stun_codec::{Message, MessageClass, MessageDecoder, MessageEncoder, TransactionId};
use tokio::net::{lookup_host, UdpSocket};
use tracing::{debug, trace};

const SOFTWARE: &str = "natmapper";

/// Source of publicly mapped addresses
#[async_trait]
pub trait StunProbe: Send + Sync {
    /// Ask `server` which address our requests arrive from
    async fn mapped_address(&self, server: &str) -> Result<SocketAddr, NatError>;
}

/// STUN client bound to one local socket
///
/// All queries leave from the same local port, so differing mapped ports
/// across servers reflect the NAT, not the client.
pub struct StunClient {
    socket: UdpSocket,
    timeout: Duration,
}

impl StunClient {
    /// Bind a client on an ephemeral port
    pub async fn bind(timeout: Duration) -> Result<Self, NatError> {
        let socket = UdpSocket::bind("0.0.0.0:0").await?;
        Ok(Self { socket, timeout })
    }

    /// Local address of the client socket
    pub fn local_addr(&self) -> Result<SocketAddr, NatError> {
        Ok(self.socket.local_addr()?)
    }

    async fn resolve(server: &str) -> Result<SocketAddr, NatError> {
        let addrs: Vec<SocketAddr> = lookup_host(server)
            .await
            .map_err(|e| NatError::Stun(format!("Failed to resolve {}: {}", server, e)))?
            .collect();

        addrs
            .iter()
            .find(|a| a.is_ipv4())
            .or(addrs.first())
            .copied()
            .ok_or_else(|| NatError::Stun(format!("No addresses found for {}", server)))
    }

    async fn binding_request(&self, server: &str) -> Result<SocketAddr, NatError> {
        let server_addr = Self::resolve(server).await?;

        let transaction_id = TransactionId::new(rand::random());
        let request = encode_binding_request(transaction_id)?;
        self.socket.send_to(&request, server_addr).await?;

        let mut buf = [0u8; 1024];
        let deadline = tokio::time::Instant::now() + self.timeout;
        loop {
            let (len, from) = tokio::time::timeout_at(deadline, self.socket.recv_from(&mut buf))
                .await
                .map_err(|_| NatError::Timeout)??;

            if from != server_addr {
                trace!("Ignoring datagram from {} while waiting for {}", from, server_addr);
                continue;
            }

            match decode_binding_response(&buf[..len], transaction_id) {
                Ok(Some(mapped)) => return Ok(mapped),
                Ok(None) => continue,
                Err(e) => return Err(e),
            }
        }
    }
}

#[async_trait]
impl StunProbe for StunClient {
    async fn mapped_address(&self, server: &str) -> Result<SocketAddr, NatError> {
        let mapped = self.binding_request(server).await?;
        debug!("STUN {} reports mapped address {}", server, mapped);
        Ok(mapped)
    }
}

/// Encode a binding request carrying a SOFTWARE attribute
pub fn encode_binding_request(transaction_id: TransactionId) -> Result<Vec<u8>, NatError> {
    let mut message = Message::<Attribute>::new(MessageClass::Request, BINDING, transaction_id);
    let software = Software::new(SOFTWARE.to_string())
        .map_err(|e| NatError::Stun(format!("Failed to create software attribute: {}", e)))?;
    message.add_attribute(Attribute::Software(software));

    MessageEncoder::new()
        .encode_into_bytes(message)
        .map_err(|e| NatError::Stun(format!("Failed to encode STUN request: {}", e)))
}

/// Decode a binding response
///
/// Returns `Ok(None)` for a well-formed message that belongs to another
/// transaction.
pub fn decode_binding_response(
    bytes: &[u8],
    transaction_id: TransactionId,
) -> Result<Option<SocketAddr>, NatError> {
    let response = MessageDecoder::<Attribute>::new()
        .decode_from_bytes(bytes)
        .map_err(|e| NatError::Stun(format!("Failed to decode STUN response: {}", e)))?
        .map_err(|e| NatError::Stun(format!("Incomplete STUN response: {:?}", e)))?;

    if response.transaction_id() != transaction_id {
        return Ok(None);
    }
    if response.class() != MessageClass::SuccessResponse {
        return Err(NatError::Stun(format!(
            "Unexpected STUN response class {:?}",
            response.class()
        )));
    }

    // XOR-MAPPED-ADDRESS is preferred, MAPPED-ADDRESS is the RFC 3489 fallback
    for attr in response.attributes() {
        if let Attribute::XorMappedAddress(xma) = attr {
            return Ok(Some(xma.address()));
        }
    }
    for attr in response.attributes() {
        if let Attribute::MappedAddress(ma) = attr {
            return Ok(Some(ma.address()));
        }
    }

    Err(NatError::Stun("No mapped address in STUN response".to_string()))
}
