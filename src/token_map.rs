//! 이벤트 식별자로 찾는 순서 보존 맵 (토큰 큐용)

use std::collections::VecDeque;

use crate::token::EventId;

pub(crate) struct TokenMap<V> {
    entries: VecDeque<(EventId, V)>,
}

impl<V> TokenMap<V> {
    pub fn new() -> Self {
        Self {
            entries: VecDeque::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, key: EventId) -> bool {
        self.entries.iter().any(|(k, _)| *k == key)
    }

    /// 꼬리에 추가 (이미 있으면 false)
    pub fn insert_tail(&mut self, key: EventId, value: V) -> bool {
        if self.contains(key) {
            return false;
        }
        self.entries.push_back((key, value));
        true
    }

    pub fn get_mut(&mut self, key: EventId) -> Option<&mut V> {
        self.entries
            .iter_mut()
            .find(|(k, _)| *k == key)
            .map(|(_, v)| v)
    }

    pub fn remove(&mut self, key: EventId) -> Option<V> {
        let pos = self.entries.iter().position(|(k, _)| *k == key)?;
        self.entries.remove(pos).map(|(_, v)| v)
    }

    /// 값 조건으로 제거 (첫 번째 일치)
    pub fn remove_where<F>(&mut self, mut pred: F) -> Option<(EventId, V)>
    where
        F: FnMut(&V) -> bool,
    {
        let pos = self.entries.iter().position(|(_, v)| pred(v))?;
        self.entries.remove(pos)
    }

    pub fn pop_head(&mut self) -> Option<(EventId, V)> {
        self.entries.pop_front()
    }

    pub fn values_mut(&mut self) -> impl Iterator<Item = &mut V> {
        self.entries.iter_mut().map(|(_, v)| v)
    }

    pub fn drain(&mut self) -> impl Iterator<Item = (EventId, V)> + '_ {
        self.entries.drain(..)
    }
}

impl<V> Default for TokenMap<V> {
    fn default() -> Self {
        Self::new()
    }
}
