//! 인스턴스 (바인딩된 프로토콜 클라이언트 컨텍스트)
//!
//! - `InstanceState`: 서비스 락 안에서만 접근하는 인스턴스별 상태
//! - `Instance`: 클라이언트가 쓰는 핸들, drop 시 인스턴스 해제

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::fmt;
use std::net::Ipv6Addr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::debug;

use crate::checksum;
use crate::config::InstanceConfig;
use crate::demux;
use crate::header::UdpHeader;
use crate::icmp::IcmpError;
use crate::ip::{Ip6ModeData, IpChildConfig, SendId};
use crate::packet::Packet;
use crate::service::ServiceInner;
use crate::stats::UdpStats;
use crate::token::{Event, EventId, ReceiveToken, RecycleFn, RxData, SessionData, TransmitToken, TxData};
use crate::token_map::TokenMap;
use crate::{Error, Result, IP_PROTO_UDP, UDP6_MAX_PAYLOAD};

/// 인스턴스 식별자 (서비스 내 생성 순서)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InstanceId(pub(crate) u32);

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// 수신 래퍼 식별자
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct WrapId(pub u64);

/// 큐에 들어간 수신 데이터그램 (UDP 헤더 제거됨)
pub(crate) struct RxWrap {
    pub id: WrapId,
    pub packet: Arc<Packet>,
    pub session: SessionData,
    /// 남은 수명
    pub countdown: Duration,
    pub received_at: Instant,
}

/// 하위 계층에 넘긴 송신
pub(crate) struct InFlight {
    pub token: TransmitToken,
    pub send_id: SendId,
    /// 중단 요청됨 (두 번째 취소는 NotFound)
    pub aborting: bool,
}

/// 검증된 송신 경로
#[derive(Debug, Clone, Copy)]
pub(crate) struct TxRoute {
    pub destination: Ipv6Addr,
    pub source_port: u16,
    pub destination_port: u16,
    /// pseudo-header 부분합 (None이면 체크섬을 하위 계층이 채움)
    pub seed: Option<u16>,
}

/// 인스턴스 상태
pub(crate) struct InstanceState {
    pub id: InstanceId,
    pub config: InstanceConfig,
    pub configured: bool,

    /// (station, remote) pseudo-header 부분합
    pub head_sum: u16,

    pub transmit_tokens: TokenMap<InFlight>,
    pub receive_tokens: TokenMap<ReceiveToken>,
    pub multicast: BTreeSet<Ipv6Addr>,

    /// 전달 대기
    pub received: VecDeque<RxWrap>,

    /// 전달됐지만 아직 회수되지 않음
    pub delivered: HashMap<WrapId, RxWrap>,

    /// 다음 수신 토큰에 전달할 ICMP 에러
    pub icmp_error: Option<IcmpError>,
}

impl InstanceState {
    pub fn new(id: InstanceId) -> Self {
        Self {
            id,
            config: InstanceConfig::default(),
            configured: false,
            head_sum: 0,
            transmit_tokens: TokenMap::new(),
            receive_tokens: TokenMap::new(),
            multicast: BTreeSet::new(),
            received: VecDeque::new(),
            delivered: HashMap::new(),
            icmp_error: None,
        }
    }

    /// 바인딩 완료된 설정 적용
    pub fn apply_config(&mut self, config: InstanceConfig) {
        self.head_sum =
            checksum::pseudo_header_sum(&config.station_address, &config.remote_address, IP_PROTO_UDP);
        self.config = config;
        self.configured = true;
    }

    /// 토큰이 어느 맵에든 있는지
    pub fn holds_token(&self, event: EventId) -> bool {
        self.transmit_tokens.contains(event) || self.receive_tokens.contains(event)
    }

    /// 수신 세션이 이 인스턴스로 향하는지
    pub fn accepts(&self, session: &SessionData) -> bool {
        self.configured && demux::matches(&self.config, &self.multicast, session)
    }

    pub fn enqueue(&mut self, id: WrapId, packet: Arc<Packet>, session: SessionData, received_at: Instant) {
        self.received.push_back(RxWrap {
            id,
            packet,
            session,
            countdown: self.config.receive_timeout,
            received_at,
        });
    }

    pub fn report_icmp_error(&mut self, kind: IcmpError) {
        self.icmp_error = Some(kind);
    }

    /// 대기 중인 ICMP 에러와 데이터그램을 수신 토큰에 전달
    ///
    /// `recycle(wrap)`은 클라이언트가 RxData를 반환할 때 실행할 콜백을 만든다.
    pub fn deliver<F>(&mut self, stats: &mut UdpStats, recycle: F)
    where
        F: Fn(WrapId) -> RecycleFn,
    {
        if let Some(kind) = self.icmp_error {
            if let Some((_, token)) = self.receive_tokens.pop_head() {
                self.icmp_error = None;
                debug!("인스턴스 {} ICMP 에러 전달: {}", self.id, kind);
                token.completion().complete(Err(Error::Icmp(kind)));
            }
        }

        while !self.received.is_empty() && !self.receive_tokens.is_empty() {
            let (Some(mut wrap), Some((_, token))) =
                (self.received.pop_front(), self.receive_tokens.pop_head())
            else {
                break;
            };

            // 다른 인스턴스가 아직 참조 중이면 사본으로 분리
            if Arc::strong_count(&wrap.packet) > 1 {
                wrap.packet = Arc::new(wrap.packet.duplicate());
            }

            let rx = RxData::new(
                wrap.received_at,
                wrap.session,
                wrap.packet.blocks().to_vec(),
                recycle(wrap.id),
            );
            stats.delivered += 1;
            stats.delivered_bytes += rx.data_length as u64;

            self.delivered.insert(wrap.id, wrap);
            token.completion().complete(Ok(rx));
        }
    }

    /// 수신 타임아웃 처리, 제거된 수 반환
    pub fn sweep(&mut self, tick: Duration) -> u64 {
        if self.config.receive_timeout.is_zero() {
            return 0;
        }

        let before = self.received.len();
        self.received.retain_mut(|wrap| {
            if wrap.countdown <= tick {
                false
            } else {
                wrap.countdown -= tick;
                true
            }
        });
        (before - self.received.len()) as u64
    }

    /// 대기 중 수신 토큰 전부 Aborted로 완료
    pub fn abort_receives(&mut self) -> usize {
        let mut count = 0;
        for (_, token) in self.receive_tokens.drain() {
            token.completion().complete(Err(Error::Aborted));
            count += 1;
        }
        count
    }

    /// 송신 요청 검증 및 경로 결정
    pub fn route(&self, tx: &TxData) -> Result<TxRoute> {
        if tx.fragments.is_empty() {
            return Err(Error::InvalidParameter("프래그먼트 없음"));
        }
        if tx.fragments.iter().any(|f| f.is_empty()) {
            return Err(Error::InvalidParameter("빈 프래그먼트"));
        }

        let total: usize = tx.fragments.iter().map(|f| f.len()).sum();
        if total != tx.data_length as usize {
            return Err(Error::InvalidParameter("data_length와 프래그먼트 합계 불일치"));
        }
        if total > UDP6_MAX_PAYLOAD {
            return Err(Error::BadBufferSize {
                max_size: UDP6_MAX_PAYLOAD,
            });
        }

        let config = &self.config;
        let session = tx.session.unwrap_or_default();

        if !session.source_address.is_unspecified()
            && session.source_address != config.station_address
        {
            return Err(Error::InvalidParameter("발신 주소가 station 주소와 다름"));
        }

        let destination = if session.destination_address.is_unspecified() {
            config.remote_address
        } else {
            session.destination_address
        };
        if destination.is_unspecified() {
            return Err(Error::InvalidParameter("목적지 주소 없음"));
        }

        let destination_port = match session.destination_port {
            0 => config.remote_port,
            port => port,
        };
        if destination_port == 0 {
            return Err(Error::InvalidParameter("목적지 포트 없음"));
        }

        let source_port = match session.source_port {
            0 => config.station_port,
            port => port,
        };

        let seed = if config.station_address.is_unspecified() {
            None
        } else if destination == config.remote_address {
            Some(self.head_sum)
        } else {
            Some(checksum::pseudo_header_sum(
                &config.station_address,
                &destination,
                IP_PROTO_UDP,
            ))
        };

        Ok(TxRoute {
            destination,
            source_port,
            destination_port,
            seed,
        })
    }

    /// 헤더 + 프래그먼트로 송신 패킷 구성
    pub fn build_datagram(&self, route: &TxRoute, tx: &TxData) -> Packet {
        let mut header = UdpHeader::new(route.source_port, route.destination_port, tx.data_length as usize);

        let mut blocks = Vec::with_capacity(tx.fragments.len() + 1);
        blocks.push(header.to_block());
        blocks.extend(tx.fragments.iter().cloned());

        if let Some(seed) = route.seed {
            header.checksum = checksum::transport_checksum(seed, header.length as u32, &blocks);
            blocks[0] = header.to_block();
        }

        Packet::from_blocks(blocks)
    }
}

/// 하위 계층 IP 자식 설정
pub(crate) fn ip_child_config(config: &InstanceConfig) -> IpChildConfig {
    IpChildConfig {
        default_protocol: IP_PROTO_UDP,
        station_address: config.station_address,
        accept_promiscuous: config.accept_promiscuous,
        hop_limit: config.hop_limit,
        traffic_class: config.traffic_class,
    }
}

/// 인스턴스 설정 + 하위 계층 상태
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModeData {
    pub config: InstanceConfig,
    pub ip: Ip6ModeData,
}

/// UDP6 프로토콜 연산
pub trait Udp6Protocol {
    /// 현재 설정과 하위 계층 모드 정보
    fn mode_data(&self) -> Result<ModeData>;

    /// 바인딩(`Some`) 또는 리셋(`None`)
    ///
    /// 구성된 상태에서는 traffic class, hop limit, 타임아웃만 바꿀 수 있다.
    fn configure(&self, config: Option<&InstanceConfig>) -> Result<()>;

    /// 멀티캐스트 가입/탈퇴 (`join == false`, `None`이면 전체 탈퇴)
    fn groups(&self, join: bool, address: Option<Ipv6Addr>) -> Result<()>;

    /// 송신 요청 (완료는 토큰으로 통지)
    fn transmit(&self, token: &TransmitToken) -> Result<()>;

    /// 수신 요청 (완료는 토큰으로 통지)
    fn receive(&self, token: &ReceiveToken) -> Result<()>;

    /// 토큰 취소 (`None`이면 전체)
    fn cancel(&self, event: Option<&Event>) -> Result<()>;

    /// 하위 계층 I/O 처리
    fn poll(&self) -> Result<()>;
}

/// 인스턴스 핸들
pub struct Instance {
    id: InstanceId,
    inner: Arc<ServiceInner>,
}

impl Instance {
    pub(crate) fn new(id: InstanceId, inner: Arc<ServiceInner>) -> Self {
        Self { id, inner }
    }

    pub fn id(&self) -> InstanceId {
        self.id
    }

    /// 하위 계층 모드 정보 (구성 여부와 무관)
    pub fn ip_mode_data(&self) -> Result<Ip6ModeData> {
        self.inner.ip_mode_data(self.id)
    }

    /// 모든 토큰 취소, 그룹 탈퇴 후 해제
    pub fn close(self) {}
}

impl Udp6Protocol for Instance {
    fn mode_data(&self) -> Result<ModeData> {
        self.inner.mode_data(self.id)
    }

    fn configure(&self, config: Option<&InstanceConfig>) -> Result<()> {
        self.inner.configure(self.id, config)
    }

    fn groups(&self, join: bool, address: Option<Ipv6Addr>) -> Result<()> {
        self.inner.groups(self.id, join, address)
    }

    fn transmit(&self, token: &TransmitToken) -> Result<()> {
        self.inner.transmit(self.id, token)
    }

    fn receive(&self, token: &ReceiveToken) -> Result<()> {
        self.inner.receive(self.id, token)
    }

    fn cancel(&self, event: Option<&Event>) -> Result<()> {
        self.inner.cancel(self.id, event)
    }

    fn poll(&self) -> Result<()> {
        self.inner.poll()
    }
}

impl Drop for Instance {
    fn drop(&mut self) {
        self.inner.destroy(self.id);
    }
}

impl fmt::Debug for Instance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Instance").field("id", &self.id).finish()
    }
}
