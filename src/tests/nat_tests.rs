use super::support::ScriptedStun;
use crate::config::StunConfig;
use crate::nat::stun::{decode_binding_response, encode_binding_request};
use crate::nat::*;
use bytecodec::{DecodeExt, EncodeExt};
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;
use stun_codec::rfc5389::attributes::XorMappedAddress;
use stun_codec::rfc5389::methods::BINDING;
use stun_codec::rfc5389::Attribute;
use stun_codec::{Message, MessageClass, MessageDecoder, MessageEncoder, TransactionId};

const S1: &str = "stun1.test:3478";
const S2: &str = "stun2.test:3478";
const S3: &str = "stun3.test:3478";

fn classifier() -> NatClassifier {
    NatClassifier::new(&StunConfig {
        servers: vec![S1.to_string(), S2.to_string(), S3.to_string()],
        timeout_ms: 200,
    })
}

fn ip(s: &str) -> IpAddr {
    s.parse().unwrap()
}

fn addr(s: &str) -> SocketAddr {
    s.parse().unwrap()
}

#[test]
fn test_classify_samples() {
    assert_eq!(classify_samples(&[addr("203.0.113.7:40000")]), NatType::FullCone);
    assert_eq!(
        classify_samples(&[addr("203.0.113.7:40000"), addr("203.0.113.7:40000")]),
        NatType::FullCone
    );
    assert_eq!(
        classify_samples(&[addr("203.0.113.7:40000"), addr("203.0.113.7:40001")]),
        NatType::RestrictedCone
    );
    assert_eq!(
        classify_samples(&[addr("203.0.113.7:40000"), addr("198.51.100.9:40000")]),
        NatType::Symmetric
    );
    assert_eq!(classify_samples(&[]), NatType::PortRestricted);
}

#[tokio::test]
async fn test_public_host_without_nat() {
    let stun = ScriptedStun::new(&[(S1, "203.0.113.7:5000")]);
    let info = classifier()
        .detect_with(ip("203.0.113.7"), &stun)
        .await
        .expect("detect");
    assert_eq!(info.nat_type, NatType::FullCone);
    assert_eq!(info.public_ip, Some(ip("203.0.113.7")));
    assert_eq!(info.public_port, Some(5000));
}

#[tokio::test]
async fn test_public_local_address_with_different_mapping_is_unknown() {
    let stun = ScriptedStun::new(&[(S1, "198.51.100.9:5000")]);
    let info = classifier()
        .detect_with(ip("203.0.113.7"), &stun)
        .await
        .expect("detect");
    assert_eq!(info.nat_type, NatType::Unknown);
    assert_eq!(AdmissionPolicy::for_nat_type(info.nat_type), AdmissionPolicy::AdmitAll);
}

#[tokio::test]
async fn test_consistent_mapping_is_full_cone() {
    let stun = ScriptedStun::new(&[
        (S1, "203.0.113.7:40000"),
        (S2, "203.0.113.7:40000"),
        (S3, "203.0.113.7:40000"),
    ]);
    let info = classifier()
        .detect_with(ip("192.168.1.20"), &stun)
        .await
        .expect("detect");
    assert_eq!(info.nat_type, NatType::FullCone);
    assert_eq!(info.local_ip, Some(ip("192.168.1.20")));
}

#[tokio::test]
async fn test_port_varies_is_restricted_cone() {
    let stun = ScriptedStun::new(&[
        (S1, "203.0.113.7:40000"),
        (S2, "203.0.113.7:40001"),
        (S3, "203.0.113.7:40002"),
    ]);
    let info = classifier()
        .detect_with(ip("10.0.0.5"), &stun)
        .await
        .expect("detect");
    assert_eq!(info.nat_type, NatType::RestrictedCone);
}

#[tokio::test]
async fn test_address_varies_is_symmetric() {
    let stun = ScriptedStun::new(&[(S1, "203.0.113.7:40000"), (S2, "198.51.100.9:40000")]);
    let info = classifier()
        .detect_with(ip("10.0.0.5"), &stun)
        .await
        .expect("detect");
    assert_eq!(info.nat_type, NatType::Symmetric);
    assert_eq!(AdmissionPolicy::for_nat_type(info.nat_type), AdmissionPolicy::Reject);
}

#[tokio::test]
async fn test_first_server_down_uses_next() {
    let stun = ScriptedStun::new(&[(S2, "203.0.113.7:40000")]);
    let info = classifier()
        .detect_with(ip("192.168.1.20"), &stun)
        .await
        .expect("detect");
    assert_eq!(info.public_port, Some(40000));
    assert_eq!(info.nat_type, NatType::FullCone, "Single sample");
}

#[tokio::test]
async fn test_private_mapping_is_double_nat() {
    let stun = ScriptedStun::new(&[(S1, "192.168.0.2:40000")]);
    let info = classifier()
        .detect_with(ip("192.168.1.20"), &stun)
        .await
        .expect("detect");
    assert_eq!(info.nat_type, NatType::Symmetric);
    assert!(info.description.contains("double NAT"));
}

#[tokio::test]
async fn test_cgnat_mapping_flagged() {
    let stun = ScriptedStun::new(&[(S1, "100.72.1.2:40000")]);
    let info = classifier()
        .detect_with(ip("192.168.1.20"), &stun)
        .await
        .expect("detect");
    assert_eq!(info.nat_type, NatType::Symmetric);
    assert!(info.description.contains("carrier-grade"));
}

#[tokio::test]
async fn test_no_stun_response() {
    let stun = ScriptedStun::default();
    let result = classifier().detect_with(ip("192.168.1.20"), &stun).await;
    assert!(matches!(result, Err(NatError::NoStunResponse)));
}

#[tokio::test]
async fn test_system_info_remembers_last_result() {
    let system = SystemInfo::new(classifier());
    assert!(system.nat_info().await.is_none());

    let stun = ScriptedStun::new(&[(S1, "203.0.113.7:40000"), (S2, "203.0.113.7:40009")]);
    let info = system
        .sniff_with(ip("192.168.1.20"), &stun)
        .await
        .expect("sniff");
    assert_eq!(system.nat_info().await, Some(info));
}

#[test]
fn test_nat_type_classes() {
    assert_eq!(NatType::FullCone.class(), Some(1));
    assert_eq!(NatType::RestrictedCone.class(), Some(2));
    assert_eq!(NatType::PortRestricted.class(), Some(3));
    assert_eq!(NatType::Symmetric.class(), Some(4));
    assert_eq!(NatType::Unknown.class(), None);
    assert!(NatType::Symmetric.to_string().starts_with("NAT4"));
    assert_eq!(NatType::Symmetric.recommendations()[0], "TURN relay");
}

#[test]
fn test_admission_policies() {
    let known = addr("192.0.2.10:40000");
    let same_host = addr("192.0.2.10:40001");
    let stranger = addr("192.0.2.99:40000");
    let mut contacted = ContactedPeers::new();
    contacted.record(known);

    assert!(AdmissionPolicy::AdmitAll.admits(stranger, &contacted));

    assert!(AdmissionPolicy::KnownHosts.admits(known, &contacted));
    assert!(AdmissionPolicy::KnownHosts.admits(same_host, &contacted));
    assert!(!AdmissionPolicy::KnownHosts.admits(stranger, &contacted));

    assert!(AdmissionPolicy::KnownHostPorts.admits(known, &contacted));
    assert!(!AdmissionPolicy::KnownHostPorts.admits(same_host, &contacted));

    assert!(!AdmissionPolicy::Reject.admits(known, &contacted));

    assert_eq!(
        AdmissionPolicy::for_nat_type(NatType::RestrictedCone),
        AdmissionPolicy::KnownHosts
    );
    assert_eq!(
        AdmissionPolicy::for_nat_type(NatType::PortRestricted),
        AdmissionPolicy::KnownHostPorts
    );
}

fn binding_response(transaction_id: TransactionId, mapped: SocketAddr) -> Vec<u8> {
    let mut message =
        Message::<Attribute>::new(MessageClass::SuccessResponse, BINDING, transaction_id);
    message.add_attribute(Attribute::XorMappedAddress(XorMappedAddress::new(mapped)));
    MessageEncoder::new()
        .encode_into_bytes(message)
        .expect("encode response")
}

#[test]
fn test_contacted_peers_forget_oldest() {
    let first: SocketAddr = "198.51.100.1:4000".parse().expect("addr");
    let second: SocketAddr = "198.51.100.2:4000".parse().expect("addr");
    let third: SocketAddr = "198.51.100.2:4001".parse().expect("addr");

    let mut contacted = ContactedPeers::with_capacity(2);
    assert!(contacted.is_empty());
    contacted.record(first);
    contacted.record(first);
    contacted.record(second);
    assert_eq!(contacted.len(), 2);

    contacted.record(third);
    assert_eq!(contacted.len(), 2);
    assert!(!contacted.knows_endpoint(first));
    assert!(!contacted.knows_host(first.ip()));
    assert!(contacted.knows_endpoint(second));
    assert!(contacted.knows_endpoint(third));
    assert!(contacted.knows_host(second.ip()));

    let policy = AdmissionPolicy::KnownHosts;
    assert!(!policy.admits(first, &contacted));
    assert!(ContactedPeers::with_capacity(0).is_empty());
}

#[test]
fn test_decode_binding_response() {
    let tid = TransactionId::new([7; 12]);
    let mapped = addr("203.0.113.7:40000");
    let response = binding_response(tid, mapped);

    assert_eq!(
        decode_binding_response(&response, tid).expect("decode"),
        Some(mapped)
    );
    assert_eq!(
        decode_binding_response(&response, TransactionId::new([8; 12])).expect("decode"),
        None,
        "Foreign transaction is skipped"
    );

    let request = encode_binding_request(tid).expect("encode");
    assert!(decode_binding_response(&request, tid).is_err(), "Not a response");
    assert!(decode_binding_response(&[0u8; 4], tid).is_err());
}

#[tokio::test]
async fn test_stun_client_against_local_server() {
    let server = tokio::net::UdpSocket::bind("127.0.0.1:0").await.expect("bind");
    let server_addr = server.local_addr().expect("addr");
    tokio::spawn(async move {
        let mut buf = [0u8; 1024];
        if let Ok((len, from)) = server.recv_from(&mut buf).await {
            let request = MessageDecoder::<Attribute>::new()
                .decode_from_bytes(&buf[..len])
                .expect("decode")
                .expect("complete");
            let response = binding_response(request.transaction_id(), from);
            let _ = server.send_to(&response, from).await;
        }
    });

    let client = StunClient::bind(Duration::from_secs(2)).await.expect("bind");
    let local_port = client.local_addr().expect("addr").port();
    let mapped = client
        .mapped_address(&server_addr.to_string())
        .await
        .expect("mapped");
    assert_eq!(mapped.port(), local_port);
}

#[tokio::test]
async fn test_stun_client_times_out() {
    let silent = tokio::net::UdpSocket::bind("127.0.0.1:0").await.expect("bind");
    let client = StunClient::bind(Duration::from_millis(200)).await.expect("bind");
    let result = client
        .mapped_address(&silent.local_addr().expect("addr").to_string())
        .await;
    assert!(matches!(result, Err(NatError::Timeout)));
}
