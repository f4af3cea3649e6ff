//! 서비스/인스턴스 설정

use std::net::Ipv6Addr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{DEFAULT_HOP_LIMIT, DEFAULT_TICK_INTERVAL_MS, UDP6_PORT_KNOWN};

/// 서비스(컨트롤러 단위) 설정
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// 수신 타임아웃 tick 간격 (밀리초)
    pub tick_interval_ms: u64,

    /// 인스턴스당 최대 미완료 송신 토큰 수
    pub max_transmit_tokens: usize,

    /// 인스턴스당 최대 대기 수신 토큰 수
    pub max_receive_tokens: usize,

    /// 자동 포트 할당 하한 (이 값부터 65535까지 순환, 0 불가)
    pub port_floor: u16,

    /// ICMP 에러 메시지 송신 시 hop limit
    pub icmp_hop_limit: u8,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: DEFAULT_TICK_INTERVAL_MS, // 50ms
            max_transmit_tokens: 1024,
            max_receive_tokens: 1024,
            port_floor: UDP6_PORT_KNOWN,
            icmp_hop_limit: DEFAULT_HOP_LIMIT,
        }
    }
}

impl ServiceConfig {
    /// 새 설정 생성
    pub fn new() -> Self {
        Self::default()
    }

    /// tick 간격
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms.max(1))
    }

    /// 저사양 기기용 설정
    pub fn low_spec() -> Self {
        Self {
            tick_interval_ms: 100,
            max_transmit_tokens: 64,
            max_receive_tokens: 64,
            ..Self::default()
        }
    }

    /// 고성능 기기용 설정
    pub fn high_performance() -> Self {
        Self {
            tick_interval_ms: 20,
            max_transmit_tokens: 16 * 1024,
            max_receive_tokens: 16 * 1024,
            ..Self::default()
        }
    }
}

/// 인스턴스 바인딩 설정
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceConfig {
    /// 필터 없이 모든 데이터그램 수신
    pub accept_promiscuous: bool,

    /// 목적지 포트 무시 (포트 예약 없음)
    pub accept_any_port: bool,

    /// 동일 (주소, 포트) 중복 바인딩 허용
    pub allow_duplicate_port: bool,

    /// IPv6 traffic class
    pub traffic_class: u8,

    /// IPv6 hop limit
    pub hop_limit: u8,

    /// 수신 큐 대기 타임아웃 (0이면 만료 없음)
    pub receive_timeout: Duration,

    /// 송신 타임아웃 (현재 보관만 함)
    pub transmit_timeout: Duration,

    /// 로컬 주소 (`::`이면 하위 계층이 선택)
    pub station_address: Ipv6Addr,

    /// 로컬 포트 (0이면 자동 할당)
    pub station_port: u16,

    /// 원격 주소 (`::`이면 모든 원격지)
    pub remote_address: Ipv6Addr,

    /// 원격 포트 (0이면 모든 포트)
    pub remote_port: u16,
}

impl Default for InstanceConfig {
    fn default() -> Self {
        Self {
            accept_promiscuous: false,
            accept_any_port: false,
            allow_duplicate_port: false,
            traffic_class: 0,
            hop_limit: DEFAULT_HOP_LIMIT,
            receive_timeout: Duration::ZERO,
            transmit_timeout: Duration::ZERO,
            station_address: Ipv6Addr::UNSPECIFIED,
            station_port: 0,
            remote_address: Ipv6Addr::UNSPECIFIED,
            remote_port: 0,
        }
    }
}

impl InstanceConfig {
    /// 로컬 (주소, 포트)에 바인딩하는 설정
    pub fn bound(station_address: Ipv6Addr, station_port: u16) -> Self {
        Self {
            station_address,
            station_port,
            ..Self::default()
        }
    }

    /// 원격지 지정
    pub fn with_remote(mut self, remote_address: Ipv6Addr, remote_port: u16) -> Self {
        self.remote_address = remote_address;
        self.remote_port = remote_port;
        self
    }

    /// 수신 타임아웃 지정
    pub fn with_receive_timeout(mut self, timeout: Duration) -> Self {
        self.receive_timeout = timeout;
        self
    }

    /// 구성 중에도 바꿀 수 있는 필드 외에는 동일한지 확인
    ///
    /// 새 설정의 station_port가 0이면 할당된 포트를 유지하는 것으로 본다.
    pub fn is_reconfigurable_to(&self, new: &InstanceConfig) -> bool {
        if self.accept_promiscuous != new.accept_promiscuous
            || self.accept_any_port != new.accept_any_port
            || self.allow_duplicate_port != new.allow_duplicate_port
        {
            return false;
        }

        if new.station_port != 0 && new.station_port != self.station_port {
            return false;
        }

        self.station_address == new.station_address
            && self.remote_address == new.remote_address
            && self.remote_port == new.remote_port
    }

    /// 바꿀 수 있는 필드만 반영
    pub fn apply_reconfigurable(&mut self, new: &InstanceConfig) {
        self.traffic_class = new.traffic_class;
        self.hop_limit = new.hop_limit;
        self.receive_timeout = new.receive_timeout;
        self.transmit_timeout = new.transmit_timeout;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reconfigure_mutable_fields_only() {
        let old = InstanceConfig::bound(Ipv6Addr::LOCALHOST, 5000);

        let mut new = old.clone();
        new.hop_limit = 8;
        new.traffic_class = 0x20;
        new.receive_timeout = Duration::from_secs(1);
        assert!(old.is_reconfigurable_to(&new));

        let mut port_kept = new.clone();
        port_kept.station_port = 0;
        assert!(old.is_reconfigurable_to(&port_kept));

        let mut moved = old.clone();
        moved.station_port = 5001;
        assert!(!old.is_reconfigurable_to(&moved));

        let retargeted = old.clone().with_remote("fe80::2".parse().unwrap(), 9);
        assert!(!old.is_reconfigurable_to(&retargeted));
    }

    #[test]
    fn test_presets() {
        assert!(ServiceConfig::low_spec().max_receive_tokens < ServiceConfig::default().max_receive_tokens);
        assert_eq!(ServiceConfig::high_performance().tick_interval(), Duration::from_millis(20));
    }
}
