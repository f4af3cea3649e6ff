//! 프로세스 내 루프백 IP 다중화기
//!
//! 실제 장치 없이 엔진을 구동하기 위한 `IpMultiplexer` 구현.
//! 송신은 기록되고, echo 모드에서는 같은 엔진으로 되돌아온다.
//! 모든 콜백은 `poll()`에서 락 없이 전달된다.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::net::Ipv6Addr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::Mutex;
use tracing::debug;

use crate::checksum;
use crate::header::UdpHeader;
use crate::icmp::IcmpError;
use crate::instance::InstanceId;
use crate::ip::{Ip6ModeData, Ip6Session, IpChildConfig, IpHandler, IpMultiplexer, ReceiveStatus, SendId, SendRequest};
use crate::packet::Packet;
use crate::{Error, Result, IPV6_HEADER_SIZE, IP_PROTO_ICMPV6, IP_PROTO_UDP, UDP6_HEADER_SIZE};

/// 루프백 MTU
const LOOPBACK_MTU: usize = 1500;

/// ICMPv6 에러 헤더 크기
const ICMPV6_ERROR_HEADER_SIZE: usize = 8;

/// 기록된 송신
#[derive(Debug, Clone)]
pub struct SentDatagram {
    pub id: SendId,
    pub child: Option<InstanceId>,
    pub source: Ipv6Addr,
    pub destination: Ipv6Addr,
    pub protocol: u8,
    pub hop_limit: u8,
    pub traffic_class: u8,
    /// 상위 계층 세그먼트 (체크섬 채워짐)
    pub payload: Bytes,
}

impl SentDatagram {
    /// UDP 세그먼트면 헤더
    pub fn udp_header(&self) -> Option<UdpHeader> {
        if self.protocol != IP_PROTO_UDP {
            return None;
        }
        UdpHeader::parse(&Packet::from_bytes(self.payload.clone()))
    }

    /// ICMPv6 (type, code)
    pub fn icmp_type_code(&self) -> Option<(u8, u8)> {
        if self.protocol != IP_PROTO_ICMPV6 || self.payload.len() < 2 {
            return None;
        }
        Some((self.payload[0], self.payload[1]))
    }
}

enum LoopEvent {
    Received {
        status: ReceiveStatus,
        session: Ip6Session,
        packet: Packet,
    },
    Completed {
        id: SendId,
    },
    Aborted {
        id: SendId,
    },
}

struct Child {
    config: IpChildConfig,
    groups: BTreeSet<Ipv6Addr>,
}

struct LoopbackState {
    handler: Option<Arc<dyn IpHandler>>,
    children: HashMap<InstanceId, Child>,
    in_flight: HashSet<SendId>,
    sent: Vec<SentDatagram>,
}

/// 루프백 IP 다중화기
pub struct LoopbackIp {
    local_address: Ipv6Addr,
    state: Mutex<LoopbackState>,
    events_tx: Sender<LoopEvent>,
    events_rx: Receiver<LoopEvent>,
    released: Arc<AtomicUsize>,
    echo: bool,
    no_mapping: bool,
    fail_sends: bool,
}

impl LoopbackIp {
    /// `::1` 루프백 (echo 꺼짐)
    pub fn new() -> Self {
        let (events_tx, events_rx) = unbounded();
        Self {
            local_address: Ipv6Addr::LOCALHOST,
            state: Mutex::new(LoopbackState {
                handler: None,
                children: HashMap::new(),
                in_flight: HashSet::new(),
                sent: Vec::new(),
            }),
            events_tx,
            events_rx,
            released: Arc::new(AtomicUsize::new(0)),
            echo: false,
            no_mapping: false,
            fail_sends: false,
        }
    }

    /// 송신을 같은 엔진의 수신으로 되돌림
    pub fn with_echo(mut self) -> Self {
        self.echo = true;
        self
    }

    /// 로컬 주소 지정
    pub fn with_local_address(mut self, address: Ipv6Addr) -> Self {
        self.local_address = address;
        self
    }

    /// station 주소가 `::`인 자식 구성에 NoMapping 반환
    pub fn with_no_mapping(mut self) -> Self {
        self.no_mapping = true;
        self
    }

    /// 모든 송신 거부 (장치 에러)
    pub fn with_failing_sends(mut self) -> Self {
        self.fail_sends = true;
        self
    }

    pub fn local_address(&self) -> Ipv6Addr {
        self.local_address
    }

    /// 외부에서 도착한 데이터그램 (UDP 헤더부터)
    pub fn inject(&self, session: Ip6Session, datagram: Bytes) {
        self.push_received(ReceiveStatus::Ok, session, datagram);
    }

    /// 외부에서 도착한 UDP 데이터그램 (체크섬 계산)
    pub fn inject_udp(&self, session: Ip6Session, source_port: u16, destination_port: u16, payload: &[u8]) {
        self.inject(session, build_udp(&session, source_port, destination_port, payload));
    }

    /// ICMP 에러 도착 (session은 원본 송신 헤더, embedded는 원본 UDP 헤더부터)
    pub fn inject_icmp(&self, kind: IcmpError, original: Ip6Session, embedded: Bytes) {
        self.push_received(ReceiveStatus::IcmpError(kind), original, embedded);
    }

    /// 주입한 버퍼 중 엔진이 해제한 수
    pub fn released(&self) -> usize {
        self.released.load(Ordering::SeqCst)
    }

    pub fn sent(&self) -> Vec<SentDatagram> {
        self.state.lock().sent.clone()
    }

    pub fn take_sent(&self) -> Vec<SentDatagram> {
        std::mem::take(&mut self.state.lock().sent)
    }

    /// 자식의 멀티캐스트 그룹
    pub fn groups_of(&self, child: InstanceId) -> Vec<Ipv6Addr> {
        self.state
            .lock()
            .children
            .get(&child)
            .map(|c| c.groups.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn is_child_configured(&self, child: InstanceId) -> bool {
        self.state.lock().children.contains_key(&child)
    }

    pub fn pending_events(&self) -> usize {
        self.events_rx.len()
    }

    fn push_received(&self, status: ReceiveStatus, session: Ip6Session, data: Bytes) {
        let released = self.released.clone();
        let packet = Packet::from_bytes(data).with_release(move || {
            released.fetch_add(1, Ordering::SeqCst);
        });
        let _ = self.events_tx.send(LoopEvent::Received {
            status,
            session,
            packet,
        });
    }

    /// 되돌아온 ICMPv6 에러를 (종류, 원본 세션, 원본 UDP)로 해석
    fn reflect_icmp(&self, bytes: &[u8]) -> Option<(IcmpError, Ip6Session, Bytes)> {
        let embedded_at = ICMPV6_ERROR_HEADER_SIZE + IPV6_HEADER_SIZE;
        if bytes.len() < embedded_at + UDP6_HEADER_SIZE {
            return None;
        }

        let kind = IcmpError::from_icmpv6(bytes[0], bytes[1])?;
        let ip = &bytes[ICMPV6_ERROR_HEADER_SIZE..embedded_at];
        if ip[6] != IP_PROTO_UDP {
            return None;
        }

        let mut source = [0u8; 16];
        let mut destination = [0u8; 16];
        source.copy_from_slice(&ip[8..24]);
        destination.copy_from_slice(&ip[24..40]);

        let mut original = Ip6Session::new(Ipv6Addr::from(source), Ipv6Addr::from(destination));
        original.hop_limit = ip[7];
        Some((kind, original, Bytes::copy_from_slice(&bytes[embedded_at..])))
    }
}

impl Default for LoopbackIp {
    fn default() -> Self {
        Self::new()
    }
}

impl IpMultiplexer for LoopbackIp {
    fn open(&self, handler: Arc<dyn IpHandler>) -> Result<()> {
        self.state.lock().handler = Some(handler);
        Ok(())
    }

    fn configure(&self, child: InstanceId, config: Option<&IpChildConfig>) -> Result<()> {
        let mut state = self.state.lock();
        let Some(config) = config else {
            state.children.remove(&child);
            return Ok(());
        };

        let groups = state
            .children
            .remove(&child)
            .map(|c| c.groups)
            .unwrap_or_default();
        state.children.insert(
            child,
            Child {
                config: config.clone(),
                groups,
            },
        );

        if self.no_mapping && config.station_address.is_unspecified() {
            return Err(Error::NoMapping);
        }
        Ok(())
    }

    fn send(&self, request: SendRequest) -> Result<()> {
        if self.fail_sends {
            return Err(Error::DeviceError("loopback send disabled".into()));
        }

        let source = if request.source.is_unspecified() {
            self.local_address
        } else {
            request.source
        };

        let mut payload = request.packet.to_vec();
        let protocol = request.override_data.protocol;
        if protocol == IP_PROTO_UDP && payload.len() >= UDP6_HEADER_SIZE && payload[6..8] == [0, 0] {
            let value = checksum::compute(&source, &request.destination, IP_PROTO_UDP, &payload);
            payload[6..8].copy_from_slice(&value.to_be_bytes());
        }
        let payload = Bytes::from(payload);

        let mut state = self.state.lock();
        state.sent.push(SentDatagram {
            id: request.id,
            child: request.child,
            source,
            destination: request.destination,
            protocol,
            hop_limit: request.override_data.hop_limit,
            traffic_class: request.override_data.traffic_class,
            payload: payload.clone(),
        });
        state.in_flight.insert(request.id);
        drop(state);

        let _ = self.events_tx.send(LoopEvent::Completed { id: request.id });

        if self.echo {
            let mut session = Ip6Session::new(source, request.destination);
            session.hop_limit = request.override_data.hop_limit;
            session.traffic_class = request.override_data.traffic_class;

            match protocol {
                IP_PROTO_UDP => self.push_received(ReceiveStatus::Ok, session, payload),
                IP_PROTO_ICMPV6 => {
                    if let Some((kind, original, embedded)) = self.reflect_icmp(&payload) {
                        self.push_received(ReceiveStatus::IcmpError(kind), original, embedded);
                    }
                }
                _ => {}
            }
        }
        Ok(())
    }

    fn cancel(&self, id: SendId) -> Result<()> {
        if !self.state.lock().in_flight.remove(&id) {
            return Err(Error::NotFound);
        }
        let _ = self.events_tx.send(LoopEvent::Aborted { id });
        Ok(())
    }

    fn poll(&self) -> Result<()> {
        let Some(handler) = self.state.lock().handler.clone() else {
            return Err(Error::DeviceError("loopback not opened".into()));
        };

        while let Ok(event) = self.events_rx.try_recv() {
            match event {
                LoopEvent::Received {
                    status,
                    session,
                    packet,
                } => handler.datagram_received(status, session, packet),
                LoopEvent::Completed { id } => {
                    // 취소된 송신은 Aborted 이벤트로 이미 완료됨
                    let pending = self.state.lock().in_flight.remove(&id);
                    if pending {
                        handler.send_completed(id, Ok(()));
                    }
                }
                LoopEvent::Aborted { id } => {
                    debug!("loopback send {:?} aborted", id);
                    handler.send_completed(id, Err(Error::Aborted));
                }
            }
        }
        Ok(())
    }

    fn groups(&self, child: InstanceId, join: bool, group: Option<Ipv6Addr>) -> Result<()> {
        let mut state = self.state.lock();
        let entry = state.children.get_mut(&child).ok_or(Error::NotStarted)?;

        match (join, group) {
            (true, Some(group)) => {
                entry.groups.insert(group);
            }
            (false, Some(group)) => {
                if !entry.groups.remove(&group) {
                    return Err(Error::NotFound);
                }
            }
            (false, None) => entry.groups.clear(),
            (true, None) => return Err(Error::InvalidParameter("가입할 그룹 주소 없음")),
        }
        Ok(())
    }

    fn mode_data(&self, child: Option<InstanceId>) -> Result<Ip6ModeData> {
        let state = self.state.lock();
        let max_packet_size = (LOOPBACK_MTU - IPV6_HEADER_SIZE) as u32;

        let Some(child) = child else {
            return Ok(Ip6ModeData {
                is_configured: true,
                station_address: self.local_address,
                max_packet_size,
                hop_limit: crate::DEFAULT_HOP_LIMIT,
                group_table: Vec::new(),
            });
        };

        Ok(match state.children.get(&child) {
            Some(entry) => Ip6ModeData {
                is_configured: true,
                station_address: if entry.config.station_address.is_unspecified() {
                    self.local_address
                } else {
                    entry.config.station_address
                },
                max_packet_size,
                hop_limit: entry.config.hop_limit,
                group_table: entry.groups.iter().copied().collect(),
            },
            None => Ip6ModeData {
                is_configured: false,
                station_address: Ipv6Addr::UNSPECIFIED,
                max_packet_size,
                hop_limit: crate::DEFAULT_HOP_LIMIT,
                group_table: Vec::new(),
            },
        })
    }
}

/// 체크섬을 채운 UDP 데이터그램
pub fn build_udp(session: &Ip6Session, source_port: u16, destination_port: u16, payload: &[u8]) -> Bytes {
    let mut header = UdpHeader::new(source_port, destination_port, payload.len());
    let mut segment = Vec::with_capacity(UDP6_HEADER_SIZE + payload.len());
    segment.extend_from_slice(&header.to_bytes());
    segment.extend_from_slice(payload);

    header.checksum = checksum::compute(&session.source, &session.destination, IP_PROTO_UDP, &segment);
    segment[..UDP6_HEADER_SIZE].copy_from_slice(&header.to_bytes());
    Bytes::from(segment)
}
