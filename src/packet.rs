//! 블록 구조 패킷 버퍼
//!
//! - 여러 `Bytes` 블록의 연결 (프래그먼트 테이블)
//! - 마지막 참조가 사라질 때 release hook 호출 (하위 계층 버퍼 회수용)

use std::fmt;

use bytes::{Bytes, BytesMut};

/// 버퍼 해제 시 호출되는 콜백
pub type ReleaseHook = Box<dyn FnOnce() + Send + Sync>;

/// 패킷 버퍼
pub struct Packet {
    /// 데이터 블록 (빈 블록은 보관하지 않음)
    blocks: Vec<Bytes>,

    /// 전체 길이
    len: usize,

    /// 해제 콜백
    release: Option<ReleaseHook>,
}

impl Packet {
    /// 빈 패킷
    pub fn new() -> Self {
        Self {
            blocks: Vec::new(),
            len: 0,
            release: None,
        }
    }

    /// 단일 블록 패킷
    pub fn from_bytes(data: Bytes) -> Self {
        Self::from_blocks(vec![data])
    }

    /// 여러 블록으로 구성
    pub fn from_blocks(blocks: Vec<Bytes>) -> Self {
        let blocks: Vec<Bytes> = blocks.into_iter().filter(|b| !b.is_empty()).collect();
        let len = blocks.iter().map(|b| b.len()).sum();
        Self {
            blocks,
            len,
            release: None,
        }
    }

    /// 해제 콜백 지정
    pub fn with_release<F>(mut self, release: F) -> Self
    where
        F: FnOnce() + Send + Sync + 'static,
    {
        self.release = Some(Box::new(release));
        self
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn blocks(&self) -> &[Bytes] {
        &self.blocks
    }

    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }

    /// 앞에 블록 추가
    pub fn prepend(&mut self, block: Bytes) {
        if block.is_empty() {
            return;
        }
        self.len += block.len();
        self.blocks.insert(0, block);
    }

    /// 앞쪽 N 바이트 복사 (블록 경계를 넘어도 됨)
    pub fn copy_prefix<const N: usize>(&self) -> Option<[u8; N]> {
        if self.len < N {
            return None;
        }

        let mut out = [0u8; N];
        let mut filled = 0;
        for block in &self.blocks {
            let take = (N - filled).min(block.len());
            out[filled..filled + take].copy_from_slice(&block[..take]);
            filled += take;
            if filled == N {
                break;
            }
        }
        Some(out)
    }

    /// 앞에서 n 바이트 제거
    pub fn trim_head(&mut self, mut n: usize) {
        n = n.min(self.len);
        self.len -= n;

        while n > 0 {
            let first_len = self.blocks[0].len();
            if first_len <= n {
                self.blocks.remove(0);
                n -= first_len;
            } else {
                let _ = self.blocks[0].split_to(n);
                n = 0;
            }
        }
    }

    /// 길이를 len으로 자름
    pub fn truncate(&mut self, len: usize) {
        if len >= self.len {
            return;
        }

        let mut remaining = len;
        let mut keep = 0;
        for block in self.blocks.iter_mut() {
            if remaining == 0 {
                break;
            }
            if block.len() > remaining {
                block.truncate(remaining);
            }
            remaining -= block.len();
            keep += 1;
        }
        self.blocks.truncate(keep);
        self.len = len;
    }

    /// 연속 메모리로 복사
    pub fn to_vec(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.len);
        for block in &self.blocks {
            buf.extend_from_slice(block);
        }
        buf
    }

    /// 앞쪽 최대 limit 바이트를 연속 메모리로 복사
    pub fn copy_head(&self, limit: usize) -> Bytes {
        let mut buf = BytesMut::with_capacity(limit.min(self.len));
        for block in &self.blocks {
            let take = (limit - buf.len()).min(block.len());
            buf.extend_from_slice(&block[..take]);
            if buf.len() == limit {
                break;
            }
        }
        buf.freeze()
    }

    /// 독립 사본 (단일 블록, release hook 없음)
    pub fn duplicate(&self) -> Packet {
        Packet::from_bytes(Bytes::from(self.to_vec()))
    }
}

impl Default for Packet {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Packet {
    fn drop(&mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

impl fmt::Debug for Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Packet")
            .field("len", &self.len)
            .field("blocks", &self.blocks.len())
            .field("has_release", &self.release.is_some())
            .finish()
    }
}
