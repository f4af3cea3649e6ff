//! 완료 토큰
//!
//! - Event: 완료 신호 (동일성 = 토큰 식별자)
//! - TransmitToken / ReceiveToken: 클라이언트가 제출하는 비동기 요청
//! - RxData: 수신 결과, 회수(recycle) 전까지 엔진이 버퍼를 유지

use std::fmt;
use std::net::Ipv6Addr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::Result;

/// 이벤트 식별자 (Arc 포인터 기반)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EventId(usize);

struct EventInner {
    signaled: AtomicBool,
    notify: Notify,
}

/// 완료 신호
///
/// 복제본은 같은 이벤트를 가리킨다. 두 토큰이 같은 이벤트를 쓰면 같은 토큰으로 취급된다.
#[derive(Clone)]
pub struct Event(Arc<EventInner>);

impl Event {
    pub fn new() -> Self {
        Self(Arc::new(EventInner {
            signaled: AtomicBool::new(false),
            notify: Notify::new(),
        }))
    }

    pub fn id(&self) -> EventId {
        EventId(Arc::as_ptr(&self.0) as usize)
    }

    /// 신호 (대기자 깨움, 블로킹 없음)
    pub fn signal(&self) {
        self.0.signaled.store(true, Ordering::SeqCst);
        self.0.notify.notify_waiters();
    }

    pub fn is_signaled(&self) -> bool {
        self.0.signaled.load(Ordering::SeqCst)
    }

    pub fn reset(&self) {
        self.0.signaled.store(false, Ordering::SeqCst);
    }

    /// 신호될 때까지 대기
    pub async fn wait(&self) {
        loop {
            let notified = self.0.notify.notified();
            if self.is_signaled() {
                return;
            }
            notified.await;
        }
    }
}

impl Default for Event {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Event")
            .field("id", &self.id())
            .field("signaled", &self.is_signaled())
            .finish()
    }
}

/// 이벤트 + 결과 슬롯
pub struct Completion<T> {
    event: Event,
    outcome: Arc<Mutex<Option<Result<T>>>>,
}

impl<T> Completion<T> {
    pub fn new() -> Self {
        Self::with_event(Event::new())
    }

    pub fn with_event(event: Event) -> Self {
        Self {
            event,
            outcome: Arc::new(Mutex::new(None)),
        }
    }

    pub fn event(&self) -> &Event {
        &self.event
    }

    pub fn id(&self) -> EventId {
        self.event.id()
    }

    pub fn is_complete(&self) -> bool {
        self.event.is_signaled()
    }

    /// 결과 꺼내기 (한 번만)
    pub fn take_outcome(&self) -> Option<Result<T>> {
        self.outcome.lock().take()
    }

    /// 완료될 때까지 대기 후 결과 꺼내기
    pub async fn wait(&self) -> Option<Result<T>> {
        self.event.wait().await;
        self.take_outcome()
    }

    /// 결과 기록 후 신호
    pub(crate) fn complete(&self, outcome: Result<T>) {
        *self.outcome.lock() = Some(outcome);
        self.event.signal();
    }

    /// 제출 시 초기화, 이전 결과는 반환 (호출자가 락 밖에서 drop)
    pub(crate) fn arm(&self) -> Option<Result<T>> {
        self.event.reset();
        self.outcome.lock().take()
    }
}

impl<T> Clone for Completion<T> {
    fn clone(&self) -> Self {
        Self {
            event: self.event.clone(),
            outcome: self.outcome.clone(),
        }
    }
}

impl<T> Default for Completion<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for Completion<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Completion")
            .field("event", &self.event)
            .finish()
    }
}

/// 세션 주소 정보
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionData {
    pub source_address: Ipv6Addr,
    pub source_port: u16,
    pub destination_address: Ipv6Addr,
    pub destination_port: u16,
}

impl Default for SessionData {
    fn default() -> Self {
        Self {
            source_address: Ipv6Addr::UNSPECIFIED,
            source_port: 0,
            destination_address: Ipv6Addr::UNSPECIFIED,
            destination_port: 0,
        }
    }
}

impl SessionData {
    /// 목적지만 지정하는 송신 오버라이드
    pub fn to(destination_address: Ipv6Addr, destination_port: u16) -> Self {
        Self {
            destination_address,
            destination_port,
            ..Self::default()
        }
    }
}

/// 송신 데이터
#[derive(Debug, Clone)]
pub struct TxData {
    /// 세션 오버라이드 (없으면 인스턴스 원격 설정 사용)
    pub session: Option<SessionData>,

    /// 선언된 총 길이
    pub data_length: u32,

    /// 프래그먼트 테이블
    pub fragments: Vec<Bytes>,
}

impl TxData {
    /// 단일 페이로드
    pub fn new(payload: Bytes) -> Self {
        Self::from_fragments(vec![payload])
    }

    /// 여러 프래그먼트 (길이는 합계로 설정)
    pub fn from_fragments(fragments: Vec<Bytes>) -> Self {
        let data_length = fragments.iter().map(|f| f.len() as u32).sum();
        Self {
            session: None,
            data_length,
            fragments,
        }
    }

    pub fn with_session(mut self, session: SessionData) -> Self {
        self.session = Some(session);
        self
    }
}

/// 송신 토큰
#[derive(Debug, Clone)]
pub struct TransmitToken {
    completion: Completion<()>,
    pub tx_data: TxData,
}

impl TransmitToken {
    pub fn new(tx_data: TxData) -> Self {
        Self {
            completion: Completion::new(),
            tx_data,
        }
    }

    /// 기존 이벤트로 토큰 생성
    pub fn with_event(event: Event, tx_data: TxData) -> Self {
        Self {
            completion: Completion::with_event(event),
            tx_data,
        }
    }

    pub fn event(&self) -> &Event {
        self.completion.event()
    }

    pub fn is_complete(&self) -> bool {
        self.completion.is_complete()
    }

    /// 완료 상태 꺼내기
    pub fn status(&self) -> Option<Result<()>> {
        self.completion.take_outcome()
    }

    pub async fn wait(&self) -> Option<Result<()>> {
        self.completion.wait().await
    }

    pub(crate) fn completion(&self) -> &Completion<()> {
        &self.completion
    }
}

/// 수신 버퍼 회수 콜백
pub type RecycleFn = Box<dyn FnOnce() + Send + Sync>;

/// 수신 결과
///
/// 명시적으로 `recycle()`하거나 drop되면 엔진이 버퍼를 회수한다.
pub struct RxData {
    pub received_at: Instant,
    pub session: SessionData,
    pub data_length: u32,
    pub fragments: Vec<Bytes>,
    recycle: Option<RecycleFn>,
}

impl RxData {
    pub(crate) fn new(
        received_at: Instant,
        session: SessionData,
        fragments: Vec<Bytes>,
        recycle: RecycleFn,
    ) -> Self {
        let data_length = fragments.iter().map(|f| f.len() as u32).sum();
        Self {
            received_at,
            session,
            data_length,
            fragments,
            recycle: Some(recycle),
        }
    }

    /// 페이로드를 연속 버퍼로
    pub fn payload(&self) -> Bytes {
        match self.fragments.as_slice() {
            [single] => single.clone(),
            fragments => {
                let mut buf = BytesMut::with_capacity(self.data_length as usize);
                for fragment in fragments {
                    buf.extend_from_slice(fragment);
                }
                buf.freeze()
            }
        }
    }

    /// 버퍼 회수
    pub fn recycle(mut self) {
        if let Some(recycle) = self.recycle.take() {
            recycle();
        }
    }
}

impl Drop for RxData {
    fn drop(&mut self) {
        if let Some(recycle) = self.recycle.take() {
            recycle();
        }
    }
}

impl fmt::Debug for RxData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RxData")
            .field("session", &self.session)
            .field("data_length", &self.data_length)
            .field("fragments", &self.fragments.len())
            .finish()
    }
}

/// 수신 토큰
#[derive(Debug, Clone, Default)]
pub struct ReceiveToken {
    completion: Completion<RxData>,
}

impl ReceiveToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_event(event: Event) -> Self {
        Self {
            completion: Completion::with_event(event),
        }
    }

    pub fn event(&self) -> &Event {
        self.completion.event()
    }

    pub fn is_complete(&self) -> bool {
        self.completion.is_complete()
    }

    /// 완료 결과 꺼내기
    pub fn take(&self) -> Option<Result<RxData>> {
        self.completion.take_outcome()
    }

    pub async fn wait(&self) -> Option<Result<RxData>> {
        self.completion.wait().await
    }

    pub(crate) fn completion(&self) -> &Completion<RxData> {
        &self.completion
    }
}
