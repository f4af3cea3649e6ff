//! # UDP6
//!
//! IPv6 위의 UDP 전송 엔진
//!
//! ## 핵심 특징
//! - **인스턴스 다중화**: 하나의 IPv6 데이터그램 스트림을 여러 클라이언트 인스턴스로 분배
//! - **비동기 토큰**: 송신/수신 요청은 완료 이벤트로 결과 통지
//! - **공유 버퍼**: 멀티캐스트 팬아웃 시 참조 카운트 버퍼 공유
//! - **ICMP 상관**: 수신된 ICMP 에러를 소유 인스턴스로 역추적
//! - **수신 타임아웃**: 주기적 tick으로 미전달 데이터그램 정리
//! - **하위 IP 계층 분리**: 라우팅/단편화는 `IpMultiplexer` 구현체에 위임

pub mod bind;
pub mod checksum;
pub mod config;
pub mod demux;
pub mod error;
pub mod header;
pub mod icmp;
pub mod instance;
pub mod ip;
pub mod loopback;
pub mod packet;
pub mod service;
pub mod stats;
pub mod token;
mod token_map;

pub use config::{InstanceConfig, ServiceConfig};
pub use error::{Error, Result};
pub use header::UdpHeader;
pub use icmp::IcmpError;
pub use instance::{Instance, InstanceId, ModeData, Udp6Protocol};
pub use ip::{Ip6ModeData, Ip6Session, IpHandler, IpMultiplexer, ReceiveStatus, SendId, SendRequest};
pub use loopback::LoopbackIp;
pub use packet::Packet;
pub use service::Service;
pub use stats::UdpStats;
pub use token::{Event, EventId, ReceiveToken, RxData, SessionData, TransmitToken, TxData};

/// UDP 헤더 크기 (바이트)
pub const UDP6_HEADER_SIZE: usize = 8;

/// 최대 UDP 페이로드 (길이 필드 16비트 - 헤더)
pub const UDP6_MAX_PAYLOAD: usize = u16::MAX as usize - UDP6_HEADER_SIZE;

/// 예약되지 않은 첫 포트
pub const UDP6_PORT_KNOWN: u16 = 1024;

/// IPv6 next-header: UDP
pub const IP_PROTO_UDP: u8 = 17;

/// IPv6 next-header: ICMPv6
pub const IP_PROTO_ICMPV6: u8 = 58;

/// IPv6 고정 헤더 크기 (바이트)
pub const IPV6_HEADER_SIZE: usize = 40;

/// IPv6 최소 MTU (바이트)
pub const IPV6_MIN_MTU: usize = 1280;

/// 기본 hop limit
pub const DEFAULT_HOP_LIMIT: u8 = 64;

/// 기본 타임아웃 tick 간격 (밀리초)
pub const DEFAULT_TICK_INTERVAL_MS: u64 = 50;
