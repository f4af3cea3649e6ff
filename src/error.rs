//! 에러 타입 정의

use thiserror::Error;

use crate::icmp::IcmpError;

/// UDP6 엔진 에러 타입
///
/// 토큰 완료 상태로도 쓰이므로 `Clone`/`PartialEq`를 구현한다.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("인스턴스가 구성되지 않음")]
    NotStarted,

    #[error("유효하지 않은 파라미터: {0}")]
    InvalidParameter(&'static str),

    #[error("이미 시작됨 (구성 중에는 변경 불가)")]
    AlreadyStarted,

    #[error("접근 거부 (포트 또는 토큰 충돌)")]
    AccessDenied,

    #[error("리소스 부족")]
    OutOfResources,

    #[error("큐 포화")]
    NotReady,

    #[error("대상 없음")]
    NotFound,

    #[error("버퍼 크기 초과: 최대 {max_size} 바이트")]
    BadBufferSize { max_size: usize },

    #[error("주소 매핑 대기 중")]
    NoMapping,

    #[error("하위 계층 장치 에러: {0}")]
    DeviceError(String),

    #[error("ICMP 에러 보고: {0}")]
    Icmp(IcmpError),

    #[error("요청 취소됨")]
    Aborted,
}

/// Result 타입 별칭
pub type Result<T> = std::result::Result<T, Error>;
