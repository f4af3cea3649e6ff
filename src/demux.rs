//! 수신 데이터그램 검증 및 인스턴스 매칭
//!
//! 매칭 우선순위:
//! 1. promiscuous면 무조건 일치
//! 2. 포트: 목적지 포트 = station 포트 (any-port 제외), 원격 포트 지정 시 발신 포트 일치
//! 3. 원격 주소 지정 시 발신 주소 일치
//! 4. 목적지 주소: station이 `::`이거나 같거나, 가입한 멀티캐스트 그룹

use std::collections::BTreeSet;
use std::net::Ipv6Addr;

use crate::checksum;
use crate::config::InstanceConfig;
use crate::header::UdpHeader;
use crate::ip::Ip6Session;
use crate::packet::Packet;
use crate::token::SessionData;
use crate::{IP_PROTO_UDP, UDP6_HEADER_SIZE};

/// 수신 거부 사유
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    /// 헤더보다 짧거나 길이 필드 불일치
    Malformed,

    /// 체크섬 검증 실패
    Checksum,
}

/// 헤더 검증 (길이 필드보다 긴 꼬리는 잘라냄)
///
/// 체크섬 필드가 0이면 검증을 생략한다.
pub fn validate(session: &Ip6Session, packet: &mut Packet) -> Result<UdpHeader, DropReason> {
    let header = UdpHeader::parse(packet).ok_or(DropReason::Malformed)?;

    let length = header.length as usize;
    if length < UDP6_HEADER_SIZE || length > packet.len() {
        return Err(DropReason::Malformed);
    }
    packet.truncate(length);

    if header.checksum != 0 {
        let seed = checksum::pseudo_header_sum(&session.source, &session.destination, IP_PROTO_UDP);
        if !checksum::verify(seed, packet) {
            return Err(DropReason::Checksum);
        }
    }

    Ok(header)
}

/// 수신 세션 정보
pub fn session_of(ip: &Ip6Session, header: &UdpHeader) -> SessionData {
    SessionData {
        source_address: ip.source,
        source_port: header.source_port,
        destination_address: ip.destination,
        destination_port: header.destination_port,
    }
}

/// 인스턴스 필터 매칭
pub fn matches(
    config: &InstanceConfig,
    groups: &BTreeSet<Ipv6Addr>,
    session: &SessionData,
) -> bool {
    if config.accept_promiscuous {
        return true;
    }

    if !config.accept_any_port && session.destination_port != config.station_port {
        return false;
    }

    if config.remote_port != 0 && session.source_port != config.remote_port {
        return false;
    }

    if !config.remote_address.is_unspecified() && config.remote_address != session.source_address {
        return false;
    }

    let destination = &session.destination_address;
    config.station_address.is_unspecified()
        || config.station_address == *destination
        || (destination.is_multicast() && groups.contains(destination))
}
