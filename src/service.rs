//! 서비스 (컨트롤러 단위 UDP6 컨텍스트)
//!
//! - 인스턴스 집합, 포트 커서, 통계를 하나의 락으로 보호
//! - API 호출과 하위 계층 콜백이 같은 락을 사용
//! - 락을 잡은 채로 클라이언트 코드를 호출하지 않음 (토큰 신호는 플래그 + wake)
//! - 클라이언트가 반환한 수신 버퍼는 채널로 모아 다음 락 획득 때 정리

use std::collections::{BTreeMap, HashMap};
use std::net::Ipv6Addr;
use std::sync::{Arc, Weak};
use std::time::Instant;

use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::{Mutex, MutexGuard};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::bind::{self, PortCursor};
use crate::config::{InstanceConfig, ServiceConfig};
use crate::demux::{self, DropReason};
use crate::header::UdpHeader;
use crate::icmp::{self, IcmpError};
use crate::instance::{ip_child_config, InFlight, Instance, InstanceId, InstanceState, ModeData, RxWrap, WrapId};
use crate::ip::{Ip6ModeData, Ip6Session, IpHandler, IpMultiplexer, OverrideData, ReceiveStatus, SendId, SendRequest};
use crate::packet::Packet;
use crate::stats::UdpStats;
use crate::token::{Event, ReceiveToken, RecycleFn, TransmitToken};
use crate::{Error, Result, IP_PROTO_ICMPV6, IP_PROTO_UDP, UDP6_HEADER_SIZE};

/// 락으로 보호되는 서비스 상태
pub(crate) struct ServiceState {
    /// 생성 순서 = 역다중화 순서
    instances: BTreeMap<InstanceId, InstanceState>,
    cursor: PortCursor,
    stats: UdpStats,
    next_instance: u32,
    next_send: u64,
    next_wrap: u64,
    /// 송신 식별자 → 소유 인스턴스
    in_flight: HashMap<SendId, InstanceId>,
    /// 해제된 인스턴스가 전달했지만 아직 반환되지 않은 수신 버퍼
    orphans: HashMap<(InstanceId, WrapId), RxWrap>,
}

impl ServiceState {
    fn new(config: &ServiceConfig) -> Self {
        Self {
            instances: BTreeMap::new(),
            cursor: PortCursor::random(config.port_floor),
            stats: UdpStats::new(),
            next_instance: 0,
            next_send: 0,
            next_wrap: 0,
            in_flight: HashMap::new(),
            orphans: HashMap::new(),
        }
    }

    fn next_send_id(&mut self) -> SendId {
        self.next_send += 1;
        SendId(self.next_send)
    }

    fn next_wrap_id(&mut self) -> WrapId {
        self.next_wrap += 1;
        WrapId(self.next_wrap)
    }
}

/// 서비스 내부 (인스턴스 핸들과 콜백이 공유)
pub(crate) struct ServiceInner {
    config: ServiceConfig,
    ip: Arc<dyn IpMultiplexer>,
    state: Mutex<ServiceState>,
    this: Weak<ServiceInner>,
    recycle_tx: Sender<(InstanceId, WrapId)>,
    recycle_rx: Receiver<(InstanceId, WrapId)>,
}

impl ServiceInner {
    /// 상태 락 (반환된 수신 버퍼 먼저 정리)
    fn lock(&self) -> MutexGuard<'_, ServiceState> {
        let mut state = self.state.lock();
        self.drain_recycled(&mut state);
        state
    }

    fn drain_recycled(&self, state: &mut ServiceState) {
        while let Ok((instance, wrap)) = self.recycle_rx.try_recv() {
            let returned = match state.instances.get_mut(&instance) {
                Some(owner) => owner.delivered.remove(&wrap),
                None => state.orphans.remove(&(instance, wrap)),
            };
            if returned.is_some() {
                state.stats.recycled += 1;
            }
        }
    }

    /// 다른 곳에서 락을 잡고 있으면 다음 획득 때 정리된다
    fn try_drain(&self) {
        if let Some(mut state) = self.state.try_lock() {
            self.drain_recycled(&mut state);
        }
    }

    /// 인스턴스의 RxData 회수 콜백 생성기
    fn recycler(&self, instance: InstanceId) -> impl Fn(WrapId) -> RecycleFn {
        let this = self.this.clone();
        let tx = self.recycle_tx.clone();
        move |wrap| -> RecycleFn {
            let this = this.clone();
            let tx = tx.clone();
            Box::new(move || {
                let _ = tx.send((instance, wrap));
                if let Some(inner) = this.upgrade() {
                    inner.try_drain();
                }
            })
        }
    }

    fn request_abort(&self, id: SendId) {
        if let Err(e) = self.ip.cancel(id) {
            debug!("송신 {:?} 중단 요청 실패: {}", id, e);
        }
    }

    pub(crate) fn configure(&self, id: InstanceId, config: Option<&InstanceConfig>) -> Result<()> {
        let Some(config) = config else {
            return self.reset(id);
        };

        if config.station_address.is_multicast() {
            return Err(Error::InvalidParameter("station 주소가 멀티캐스트"));
        }
        if config.remote_address.is_multicast() {
            return Err(Error::InvalidParameter("원격 주소가 멀티캐스트"));
        }

        let mut state = self.lock();
        let ServiceState {
            instances, cursor, ..
        } = &mut *state;

        let current = instances.get(&id).ok_or(Error::NotFound)?;
        if current.configured {
            if !current.config.is_reconfigurable_to(config) {
                return Err(Error::AlreadyStarted);
            }
            let mut updated = current.config.clone();
            updated.apply_reconfigurable(config);
            self.ip.configure(id, Some(&ip_child_config(&updated)))?;

            if let Some(instance) = instances.get_mut(&id) {
                instance.config = updated;
            }
            debug!("인스턴스 {} 재구성", id);
            return Ok(());
        }

        let mut bound = config.clone();
        bind::bind(cursor, &mut bound, |address, port| {
            instances.values().any(|other| {
                other.id != id
                    && other.configured
                    && !other.config.accept_any_port
                    && other.config.station_address == *address
                    && other.config.station_port == port
            })
        })?;

        // 주소 매핑 대기는 구성된 것으로 보고 NoMapping을 알린다
        let mapped = match self.ip.configure(id, Some(&ip_child_config(&bound))) {
            Ok(()) => true,
            Err(Error::NoMapping) => false,
            Err(e) => {
                warn!("인스턴스 {} IP 구성 실패: {}", id, e);
                return Err(e);
            }
        };

        info!(
            "인스턴스 {} 구성: [{}]:{} → [{}]:{}",
            id, bound.station_address, bound.station_port, bound.remote_address, bound.remote_port
        );
        if let Some(instance) = instances.get_mut(&id) {
            instance.apply_config(bound);
        }

        if mapped {
            Ok(())
        } else {
            Err(Error::NoMapping)
        }
    }

    fn reset(&self, id: InstanceId) -> Result<()> {
        let mut state = self.lock();
        let ServiceState {
            instances,
            in_flight,
            stats,
            ..
        } = &mut *state;

        let instance = instances.get_mut(&id).ok_or(Error::NotFound)?;
        if instance.configured {
            self.clean(instance, in_flight, stats);
            info!("인스턴스 {} 리셋", id);
        }
        Ok(())
    }

    /// 토큰 전부 완료, 큐 비우기, 그룹 탈퇴, IP 자식 해제
    fn clean(
        &self,
        instance: &mut InstanceState,
        in_flight: &mut HashMap<SendId, InstanceId>,
        stats: &mut UdpStats,
    ) {
        let id = instance.id;

        for (_, flight) in instance.transmit_tokens.drain() {
            in_flight.remove(&flight.send_id);
            if !flight.aborting {
                self.request_abort(flight.send_id);
            }
            flight.token.completion().complete(Err(Error::Aborted));
            stats.transmit_aborted += 1;
        }
        instance.abort_receives();

        instance.received.clear();
        instance.icmp_error = None;

        if !instance.multicast.is_empty() {
            if let Err(e) = self.ip.groups(id, false, None) {
                warn!("인스턴스 {} 그룹 탈퇴 실패: {}", id, e);
            }
            instance.multicast.clear();
        }

        if let Err(e) = self.ip.configure(id, None) {
            warn!("인스턴스 {} IP 해제 실패: {}", id, e);
        }
        instance.configured = false;
    }

    pub(crate) fn destroy(&self, id: InstanceId) {
        let mut state = self.lock();
        let ServiceState {
            instances,
            in_flight,
            stats,
            orphans,
            ..
        } = &mut *state;

        let Some(mut instance) = instances.remove(&id) else {
            return;
        };
        if instance.configured {
            self.clean(&mut instance, in_flight, stats);
        }
        // 클라이언트가 쥔 버퍼는 반환될 때까지 유지
        orphans.extend(instance.delivered.drain().map(|(wrap, rx)| ((id, wrap), rx)));
        drop(state);

        info!("인스턴스 {} 해제", id);
        drop(instance);
    }

    pub(crate) fn mode_data(&self, id: InstanceId) -> Result<ModeData> {
        let config = {
            let state = self.lock();
            let instance = state.instances.get(&id).ok_or(Error::NotFound)?;
            if !instance.configured {
                return Err(Error::NotStarted);
            }
            instance.config.clone()
        };

        let ip = self.ip.mode_data(Some(id))?;
        Ok(ModeData { config, ip })
    }

    pub(crate) fn ip_mode_data(&self, id: InstanceId) -> Result<Ip6ModeData> {
        self.ip.mode_data(Some(id))
    }

    pub(crate) fn groups(&self, id: InstanceId, join: bool, address: Option<Ipv6Addr>) -> Result<()> {
        let mut state = self.lock();
        let instance = state.instances.get_mut(&id).ok_or(Error::NotFound)?;
        if !instance.configured {
            return Err(Error::NotStarted);
        }
        if matches!(address, Some(group) if !group.is_multicast()) {
            return Err(Error::InvalidParameter("멀티캐스트 주소가 아님"));
        }

        match (join, address) {
            (true, None) => Err(Error::InvalidParameter("가입할 그룹 주소 없음")),
            (true, Some(group)) => {
                if instance.multicast.contains(&group) {
                    return Err(Error::AlreadyStarted);
                }
                self.ip.groups(id, true, Some(group))?;
                instance.multicast.insert(group);
                debug!("인스턴스 {} 그룹 가입: {}", id, group);
                Ok(())
            }
            (false, Some(group)) => {
                if !instance.multicast.contains(&group) {
                    return Err(Error::NotFound);
                }
                self.ip.groups(id, false, Some(group))?;
                instance.multicast.remove(&group);
                debug!("인스턴스 {} 그룹 탈퇴: {}", id, group);
                Ok(())
            }
            (false, None) => {
                self.ip.groups(id, false, None)?;
                instance.multicast.clear();
                debug!("인스턴스 {} 전체 그룹 탈퇴", id);
                Ok(())
            }
        }
    }

    pub(crate) fn transmit(&self, id: InstanceId, token: &TransmitToken) -> Result<()> {
        let mut state = self.lock();
        let send_id = state.next_send_id();
        let ServiceState {
            instances,
            in_flight,
            stats,
            ..
        } = &mut *state;

        let instance = instances.get_mut(&id).ok_or(Error::NotFound)?;
        if !instance.configured {
            return Err(Error::NotStarted);
        }

        let route = instance.route(&token.tx_data)?;

        let event = token.event().id();
        if instance.holds_token(event) {
            return Err(Error::AccessDenied);
        }
        if instance.transmit_tokens.len() >= self.config.max_transmit_tokens {
            return Err(Error::NotReady);
        }

        let packet = instance.build_datagram(&route, &token.tx_data);
        let bytes = packet.len() as u64;
        let request = SendRequest {
            id: send_id,
            child: Some(id),
            source: instance.config.station_address,
            destination: route.destination,
            override_data: OverrideData {
                protocol: IP_PROTO_UDP,
                hop_limit: instance.config.hop_limit,
                traffic_class: instance.config.traffic_class,
                flow_label: 0,
            },
            packet,
        };

        token.completion().arm();
        instance.transmit_tokens.insert_tail(
            event,
            InFlight {
                token: token.clone(),
                send_id,
                aborting: false,
            },
        );
        in_flight.insert(send_id, id);

        if let Err(e) = self.ip.send(request) {
            instance.transmit_tokens.remove(event);
            in_flight.remove(&send_id);
            stats.transmit_failed += 1;
            warn!("인스턴스 {} 송신 실패: {}", id, e);
            return Err(e);
        }

        stats.transmitted += 1;
        stats.transmitted_bytes += bytes;
        Ok(())
    }

    pub(crate) fn receive(&self, id: InstanceId, token: &ReceiveToken) -> Result<()> {
        let recycle = self.recycler(id);
        let mut state = self.lock();
        let ServiceState {
            instances, stats, ..
        } = &mut *state;

        let instance = instances.get_mut(&id).ok_or(Error::NotFound)?;
        if !instance.configured {
            return Err(Error::NotStarted);
        }

        let event = token.event().id();
        if instance.holds_token(event) {
            return Err(Error::AccessDenied);
        }
        if instance.receive_tokens.len() >= self.config.max_receive_tokens {
            return Err(Error::NotReady);
        }

        // 회수되지 않은 이전 결과는 락 밖에서 drop
        let stale = token.completion().arm();
        instance.receive_tokens.insert_tail(event, token.clone());
        instance.deliver(stats, recycle);

        drop(state);
        drop(stale);
        Ok(())
    }

    pub(crate) fn cancel(&self, id: InstanceId, event: Option<&Event>) -> Result<()> {
        let mut state = self.lock();
        let instance = state.instances.get_mut(&id).ok_or(Error::NotFound)?;
        if !instance.configured {
            return Err(Error::NotStarted);
        }

        let Some(event) = event else {
            for flight in instance.transmit_tokens.values_mut() {
                if !flight.aborting {
                    flight.aborting = true;
                    self.request_abort(flight.send_id);
                }
            }
            let aborted = instance.abort_receives();
            debug!("인스턴스 {} 전체 취소 (수신 {}개)", id, aborted);
            return Ok(());
        };

        let key = event.id();
        if let Some(flight) = instance.transmit_tokens.get_mut(key) {
            if flight.aborting {
                return Err(Error::NotFound);
            }
            flight.aborting = true;
            self.request_abort(flight.send_id);
            return Ok(());
        }

        match instance.receive_tokens.remove(key) {
            Some(token) => {
                token.completion().complete(Err(Error::Aborted));
                Ok(())
            }
            None => Err(Error::NotFound),
        }
    }

    pub(crate) fn poll(&self) -> Result<()> {
        self.ip.poll()
    }

    /// 수신 타임아웃 tick
    pub(crate) fn tick(&self) {
        let interval = self.config.tick_interval();
        let mut state = self.lock();
        let ServiceState {
            instances, stats, ..
        } = &mut *state;

        for instance in instances.values_mut().filter(|i| i.configured) {
            let evicted = instance.sweep(interval);
            if evicted > 0 {
                stats.evicted += evicted;
                debug!("인스턴스 {} 수신 타임아웃: {}개 제거", instance.id, evicted);
            }
        }
    }

    /// 수신 데이터그램을 일치하는 모든 인스턴스로 분배
    fn demultiplex(&self, session: Ip6Session, mut packet: Packet) {
        let mut state = self.lock();
        state.stats.received += 1;
        state.stats.received_bytes += packet.len() as u64;

        let header = match demux::validate(&session, &mut packet) {
            Ok(header) => header,
            Err(DropReason::Malformed) => {
                state.stats.dropped_malformed += 1;
                debug!("잘못된 데이터그램 폐기: {} → {}", session.source, session.destination);
                return;
            }
            Err(DropReason::Checksum) => {
                state.stats.dropped_checksum += 1;
                debug!("체크섬 불일치 폐기: {} → {}", session.source, session.destination);
                return;
            }
        };

        let rx_session = demux::session_of(&session, &header);
        let matched: Vec<InstanceId> = state
            .instances
            .values()
            .filter(|instance| instance.accepts(&rx_session))
            .map(|instance| instance.id)
            .collect();

        if matched.is_empty() {
            state.stats.no_listener += 1;
            debug!(
                "수신자 없음: [{}]:{} → [{}]:{}",
                rx_session.source_address,
                rx_session.source_port,
                rx_session.destination_address,
                rx_session.destination_port
            );

            let request = icmp::port_unreachable(&session, &packet).map(|reply| {
                state.stats.icmp_sent += 1;
                SendRequest {
                    id: state.next_send_id(),
                    child: None,
                    source: reply.source,
                    destination: reply.destination,
                    override_data: OverrideData {
                        protocol: IP_PROTO_ICMPV6,
                        hop_limit: self.config.icmp_hop_limit,
                        traffic_class: 0,
                        flow_label: 0,
                    },
                    packet: reply.packet,
                }
            });
            drop(state);
            drop(packet);

            if let Some(request) = request {
                if let Err(e) = self.ip.send(request) {
                    warn!("port unreachable 송신 실패: {}", e);
                }
            }
            return;
        }

        packet.trim_head(UDP6_HEADER_SIZE);
        let received_at = Instant::now();
        let shared = Arc::new(packet);

        for id in &matched {
            let wrap = state.next_wrap_id();
            if let Some(instance) = state.instances.get_mut(id) {
                instance.enqueue(wrap, shared.clone(), rx_session, received_at);
            }
        }
        state.stats.enqueued += matched.len() as u64;
        drop(shared);

        for id in matched {
            let recycle = self.recycler(id);
            let ServiceState {
                instances, stats, ..
            } = &mut *state;
            if let Some(instance) = instances.get_mut(&id) {
                instance.deliver(stats, recycle);
            }
        }
    }

    /// ICMP 에러를 원 송신 인스턴스 하나에 보고
    fn correlate_icmp(&self, kind: IcmpError, session: Ip6Session, packet: Packet) {
        let mut state = self.lock();
        state.stats.icmp_received += 1;

        let Some(header) = UdpHeader::parse(&packet) else {
            debug!("ICMP 에러에 UDP 헤더 없음: {}", kind);
            return;
        };
        let reversed = icmp::correlate_session(&session, &header);

        let owner = state
            .instances
            .values()
            .find(|instance| instance.accepts(&reversed))
            .map(|instance| instance.id);

        let Some(id) = owner else {
            state.stats.icmp_unmatched += 1;
            debug!(
                "ICMP 에러 소유자 없음: {} ([{}]:{})",
                kind, reversed.destination_address, reversed.destination_port
            );
            return;
        };

        let recycle = self.recycler(id);
        let ServiceState {
            instances, stats, ..
        } = &mut *state;
        if let Some(instance) = instances.get_mut(&id) {
            instance.report_icmp_error(kind);
            instance.deliver(stats, recycle);
            debug!("인스턴스 {} ICMP 에러 수신: {}", id, kind);
        }
    }

    fn complete_send(&self, id: SendId, result: Result<()>) {
        let mut state = self.lock();
        let ServiceState {
            instances,
            in_flight,
            stats,
            ..
        } = &mut *state;

        // 리셋으로 이미 완료된 송신이나 ICMP 송신
        let Some(owner) = in_flight.remove(&id) else {
            return;
        };
        let Some(flight) = instances
            .get_mut(&owner)
            .and_then(|instance| instance.transmit_tokens.remove_where(|f| f.send_id == id))
            .map(|(_, flight)| flight)
        else {
            return;
        };

        match &result {
            Ok(()) => stats.transmit_completed += 1,
            Err(Error::Aborted) => stats.transmit_aborted += 1,
            Err(e) => {
                stats.transmit_failed += 1;
                debug!("인스턴스 {} 송신 {:?} 실패: {}", owner, id, e);
            }
        }
        flight.token.completion().complete(result);
    }
}

/// 하위 계층 콜백 어댑터
struct ServiceHandler(Weak<ServiceInner>);

impl IpHandler for ServiceHandler {
    fn datagram_received(&self, status: ReceiveStatus, session: Ip6Session, packet: Packet) {
        let Some(inner) = self.0.upgrade() else {
            return;
        };
        match status {
            ReceiveStatus::Ok => inner.demultiplex(session, packet),
            ReceiveStatus::IcmpError(kind) => inner.correlate_icmp(kind, session, packet),
        }
    }

    fn send_completed(&self, id: SendId, result: Result<()>) {
        if let Some(inner) = self.0.upgrade() {
            inner.complete_send(id, result);
        }
    }
}

/// UDP6 서비스
///
/// 하위 IP 다중화기 하나 위에서 여러 인스턴스를 관리한다.
pub struct Service {
    inner: Arc<ServiceInner>,
    timer: Mutex<Option<JoinHandle<()>>>,
}

impl Service {
    /// 서비스 생성 및 하위 계층에 콜백 등록
    pub fn new(config: ServiceConfig, ip: Arc<dyn IpMultiplexer>) -> Result<Self> {
        if config.port_floor == 0 {
            return Err(Error::InvalidParameter("port_floor는 0일 수 없음"));
        }

        let (recycle_tx, recycle_rx) = unbounded();
        let state = ServiceState::new(&config);

        let inner = Arc::new_cyclic(|this| ServiceInner {
            config,
            ip: ip.clone(),
            state: Mutex::new(state),
            this: this.clone(),
            recycle_tx,
            recycle_rx,
        });

        ip.open(Arc::new(ServiceHandler(Arc::downgrade(&inner))))?;
        info!(
            "UDP6 service started (tick {}ms, port cursor {})",
            inner.config.tick_interval_ms,
            inner.state.lock().cursor.current()
        );

        Ok(Self {
            inner,
            timer: Mutex::new(None),
        })
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.inner.config
    }

    /// 구성되지 않은 새 인스턴스
    pub fn create_instance(&self) -> Instance {
        let mut state = self.inner.lock();
        let id = InstanceId(state.next_instance);
        state.next_instance += 1;
        state.instances.insert(id, InstanceState::new(id));
        drop(state);

        debug!("인스턴스 {} 생성", id);
        Instance::new(id, self.inner.clone())
    }

    pub fn instance_count(&self) -> usize {
        self.inner.lock().instances.len()
    }

    /// 통계 스냅샷
    pub fn stats(&self) -> UdpStats {
        self.inner.lock().stats.clone()
    }

    /// 수신 타임아웃 tick 한 번
    pub fn tick(&self) {
        self.inner.tick();
    }

    /// 하위 계층 I/O 처리
    pub fn poll(&self) -> Result<()> {
        self.inner.poll()
    }

    /// tick 주기 태스크 시작 (tokio 런타임 안에서 호출)
    ///
    /// 태스크는 서비스를 약한 참조로만 잡는다.
    pub fn spawn_timer(&self) {
        let mut timer = self.timer.lock();
        if timer.is_some() {
            return;
        }

        let weak = Arc::downgrade(&self.inner);
        let period = self.inner.config.tick_interval();
        *timer = Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.tick().await;
            loop {
                interval.tick().await;
                match weak.upgrade() {
                    Some(inner) => inner.tick(),
                    None => break,
                }
            }
        }));
    }

    /// 타이머 정지, 모든 인스턴스 리셋
    pub fn shutdown(&self) {
        if let Some(handle) = self.timer.lock().take() {
            handle.abort();
        }

        let ids: Vec<InstanceId> = self.inner.lock().instances.keys().copied().collect();
        for id in ids {
            if let Err(e) = self.inner.reset(id) {
                debug!("인스턴스 {} 리셋 실패: {}", id, e);
            }
        }
        info!("UDP6 service stopped: {}", self.inner.lock().stats.summary());
    }
}

impl Drop for Service {
    fn drop(&mut self) {
        if let Some(handle) = self.timer.lock().take() {
            handle.abort();
        }
    }
}
