//! 하위 IP 계층 인터페이스
//!
//! 엔진은 라우팅/단편화/이웃 탐색/물리 전송을 하지 않는다.
//! 주소가 정해진 데이터그램을 `IpMultiplexer`에 넘기고,
//! 수신/송신 완료는 `IpHandler` 콜백으로 돌려받는다.
//!
//! ## 호출 규약
//! - `send`/`cancel`/`configure`/`groups` 안에서 콜백을 동기 호출하지 않는다
//!   (엔진이 상태 락을 잡은 채로 호출할 수 있음). 콜백은 `poll` 또는 자체 컨텍스트에서 전달.
//! - 콜백을 호출하는 동안 하위 계층 내부 락을 잡고 있지 않는다.
//! - `Packet`의 release hook은 엔진을 다시 호출하지 않는다.

use std::net::Ipv6Addr;
use std::sync::Arc;

use crate::icmp::IcmpError;
use crate::instance::InstanceId;
use crate::packet::Packet;
use crate::Result;

/// 수신된 IPv6 패킷의 헤더 정보
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ip6Session {
    pub source: Ipv6Addr,
    pub destination: Ipv6Addr,
    pub hop_limit: u8,
    pub traffic_class: u8,
}

impl Ip6Session {
    pub fn new(source: Ipv6Addr, destination: Ipv6Addr) -> Self {
        Self {
            source,
            destination,
            hop_limit: crate::DEFAULT_HOP_LIMIT,
            traffic_class: 0,
        }
    }
}

/// 수신 콜백 상태
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiveStatus {
    /// 일반 데이터그램 (패킷은 UDP 헤더부터)
    Ok,

    /// ICMP 에러 보고. 패킷은 에러에 포함된 원본 UDP 헤더부터,
    /// 세션은 원본 패킷의 헤더 (source = 이 호스트)
    IcmpError(IcmpError),
}

/// 송신 식별자
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SendId(pub u64);

/// 송신 헤더 오버라이드
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OverrideData {
    pub protocol: u8,
    pub hop_limit: u8,
    pub traffic_class: u8,
    pub flow_label: u32,
}

/// 송신 요청
#[derive(Debug)]
pub struct SendRequest {
    pub id: SendId,

    /// 송신 인스턴스 (없으면 서비스 기본 송신자)
    pub child: Option<InstanceId>,

    /// 발신 주소 (`::`이면 하위 계층이 선택)
    pub source: Ipv6Addr,

    pub destination: Ipv6Addr,

    pub override_data: OverrideData,

    /// 상위 계층 세그먼트. UDP 체크섬 필드가 0이면 하위 계층이
    /// 발신 주소를 정한 뒤 채워야 한다.
    pub packet: Packet,
}

/// 인스턴스별 IP 자식 설정
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IpChildConfig {
    pub default_protocol: u8,
    pub station_address: Ipv6Addr,
    pub accept_promiscuous: bool,
    pub hop_limit: u8,
    pub traffic_class: u8,
}

/// 하위 계층 모드 정보
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ip6ModeData {
    pub is_configured: bool,
    pub station_address: Ipv6Addr,
    pub max_packet_size: u32,
    pub hop_limit: u8,
    pub group_table: Vec<Ipv6Addr>,
}

/// 엔진이 구현하는 하위 계층 콜백
pub trait IpHandler: Send + Sync {
    /// 데이터그램 또는 ICMP 에러 수신
    fn datagram_received(&self, status: ReceiveStatus, session: Ip6Session, packet: Packet);

    /// 송신 완료 (취소 시 `Err(Error::Aborted)`)
    fn send_completed(&self, id: SendId, result: Result<()>);
}

/// 하위 IP 데이터그램 다중화기
pub trait IpMultiplexer: Send + Sync {
    /// 콜백 등록 및 기본 송신자 개방
    fn open(&self, handler: Arc<dyn IpHandler>) -> Result<()>;

    /// 인스턴스용 IP 자식 구성 (`None`이면 해제)
    fn configure(&self, child: InstanceId, config: Option<&IpChildConfig>) -> Result<()>;

    fn send(&self, request: SendRequest) -> Result<()>;

    /// 진행 중 송신 중단 (완료는 `send_completed`로 비동기 통지)
    fn cancel(&self, id: SendId) -> Result<()>;

    /// 대기 중 I/O 처리
    fn poll(&self) -> Result<()>;

    /// 멀티캐스트 가입/탈퇴 (`None` 탈퇴는 전체)
    fn groups(&self, child: InstanceId, join: bool, group: Option<Ipv6Addr>) -> Result<()>;

    fn mode_data(&self, child: Option<InstanceId>) -> Result<Ip6ModeData>;
}
