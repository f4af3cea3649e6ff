//! ICMP 에러 처리
//!
//! - ICMPv6 (type, code) → 정규화된 에러 종류
//! - ICMP 에러에 포함된 원본 UDP 헤더로 세션 재구성 (송신 방향 반전)
//! - 수신자가 없는 데이터그램에 대한 port unreachable 메시지 생성

use std::fmt;
use std::net::Ipv6Addr;

use bytes::{BufMut, BytesMut};

use crate::checksum;
use crate::header::UdpHeader;
use crate::ip::Ip6Session;
use crate::packet::Packet;
use crate::token::SessionData;
use crate::{Error, IPV6_HEADER_SIZE, IPV6_MIN_MTU, IP_PROTO_ICMPV6, IP_PROTO_UDP};

/// ICMPv6 destination unreachable
pub const ICMPV6_DEST_UNREACHABLE: u8 = 1;
/// ICMPv6 packet too big
pub const ICMPV6_PACKET_TOO_BIG: u8 = 2;
/// ICMPv6 time exceeded
pub const ICMPV6_TIME_EXCEEDED: u8 = 3;
/// ICMPv6 parameter problem
pub const ICMPV6_PARAMETER_PROBLEM: u8 = 4;
/// destination unreachable: port unreachable
pub const ICMPV6_PORT_UNREACHABLE: u8 = 4;

/// ICMPv6 에러 헤더 (type, code, checksum, unused)
const ICMPV6_ERROR_HEADER_SIZE: usize = 8;

/// 정규화된 ICMP 에러 종류
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IcmpError {
    NetUnreachable,
    HostUnreachable,
    ProtocolUnreachable,
    PortUnreachable,
    PacketTooBig,
    TimeExceeded,
    ReassemblyTimeExceeded,
    ParameterProblem,
}

impl IcmpError {
    /// ICMPv6 (type, code)에서 변환 (에러 메시지가 아니면 None)
    pub fn from_icmpv6(icmp_type: u8, code: u8) -> Option<Self> {
        let kind = match (icmp_type, code) {
            (ICMPV6_DEST_UNREACHABLE, 0 | 2 | 6) => Self::NetUnreachable,
            (ICMPV6_DEST_UNREACHABLE, 1 | 3 | 5) => Self::HostUnreachable,
            (ICMPV6_DEST_UNREACHABLE, ICMPV6_PORT_UNREACHABLE) => Self::PortUnreachable,
            (ICMPV6_PACKET_TOO_BIG, _) => Self::PacketTooBig,
            (ICMPV6_TIME_EXCEEDED, 0) => Self::TimeExceeded,
            (ICMPV6_TIME_EXCEEDED, 1) => Self::ReassemblyTimeExceeded,
            (ICMPV6_PARAMETER_PROBLEM, 1) => Self::ProtocolUnreachable,
            (ICMPV6_PARAMETER_PROBLEM, _) => Self::ParameterProblem,
            _ => return None,
        };
        Some(kind)
    }

    /// 도달 불가 계열 (네트워크/호스트/프로토콜/포트)
    pub fn is_unreachable(&self) -> bool {
        matches!(
            self,
            Self::NetUnreachable
                | Self::HostUnreachable
                | Self::ProtocolUnreachable
                | Self::PortUnreachable
        )
    }
}

impl fmt::Display for IcmpError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Self::NetUnreachable => "network unreachable",
            Self::HostUnreachable => "host unreachable",
            Self::ProtocolUnreachable => "protocol unreachable",
            Self::PortUnreachable => "port unreachable",
            Self::PacketTooBig => "packet too big",
            Self::TimeExceeded => "hop limit exceeded",
            Self::ReassemblyTimeExceeded => "reassembly time exceeded",
            Self::ParameterProblem => "parameter problem",
        };
        f.write_str(text)
    }
}

impl From<IcmpError> for Error {
    fn from(kind: IcmpError) -> Self {
        Error::Icmp(kind)
    }
}

/// 원본 송신 세션 + 포함된 UDP 헤더 → 수신 방향 세션
///
/// 에러는 이 엔진이 보낸 패킷에 대한 것이므로 source/destination을 뒤집는다.
pub fn correlate_session(original: &Ip6Session, embedded: &UdpHeader) -> SessionData {
    SessionData {
        source_address: original.destination,
        source_port: embedded.destination_port,
        destination_address: original.source,
        destination_port: embedded.source_port,
    }
}

/// port unreachable 메시지 (발신 주소, 목적지 주소, ICMPv6 패킷)
pub struct PortUnreachable {
    pub source: Ipv6Addr,
    pub destination: Ipv6Addr,
    pub packet: Packet,
}

/// 수신자 없는 데이터그램에 대한 ICMPv6 port unreachable 생성
///
/// 멀티캐스트로 받은 패킷이나 발신지가 유효하지 않은 패킷에는 보내지 않는다.
/// 전체 IPv6 패킷이 최소 MTU를 넘지 않도록 원본을 자른다.
pub fn port_unreachable(session: &Ip6Session, invoking: &Packet) -> Option<PortUnreachable> {
    if session.destination.is_multicast()
        || session.source.is_multicast()
        || session.source.is_unspecified()
    {
        return None;
    }

    let budget = IPV6_MIN_MTU - IPV6_HEADER_SIZE - ICMPV6_ERROR_HEADER_SIZE;
    let udp_part = invoking.copy_head(budget - IPV6_HEADER_SIZE);

    let mut msg = BytesMut::with_capacity(ICMPV6_ERROR_HEADER_SIZE + IPV6_HEADER_SIZE + udp_part.len());
    msg.put_u8(ICMPV6_DEST_UNREACHABLE);
    msg.put_u8(ICMPV6_PORT_UNREACHABLE);
    msg.put_u16(0);
    msg.put_u32(0);

    // 원본 IPv6 헤더 재구성
    msg.put_u8(0x60 | (session.traffic_class >> 4));
    msg.put_u8(session.traffic_class << 4);
    msg.put_u16(0);
    msg.put_u16(invoking.len() as u16);
    msg.put_u8(IP_PROTO_UDP);
    msg.put_u8(session.hop_limit);
    msg.put_slice(&session.source.octets());
    msg.put_slice(&session.destination.octets());
    msg.put_slice(&udp_part);

    let value = checksum::compute(&session.destination, &session.source, IP_PROTO_ICMPV6, &msg);
    msg[2..4].copy_from_slice(&value.to_be_bytes());

    Some(PortUnreachable {
        source: session.destination,
        destination: session.source,
        packet: Packet::from_bytes(msg.freeze()),
    })
}
