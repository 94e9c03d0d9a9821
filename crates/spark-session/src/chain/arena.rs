//! 链节点的竞技场存储。
//!
//! # 设计背景（Why）
//! - 双向链表在没有 GC 的语言里会形成所有权环；以 `Vec` 下标充当稳定标识，
//!   `prev/next` 存储为下标，链结构与名称索引由同一个结构体独占修改。
//! - 运行期移除的节点可能仍有事件“在途”（过滤器正在执行、稍后调用自己的 `NextFilter`），
//!   因此节点移除后先保留为墓碑：丢弃过滤器、保留移除时刻的邻接关系。
//! - 墓碑在链上没有任何派发进行时才被回收，回收时递增槽位代数，旧标识随之失效。
//!
//! # 契约（What）
//! - 槽位 0/1 固定为 Head/Tail 哨兵，永不移除、永不回收；
//! - 活动节点与名称索引一一对应，哨兵不进入索引；
//! - 沿墓碑的 `next/prev` 前进必然终止于活动节点或哨兵；
//! - 代数不匹配的标识视为已失效：入站解析到 Tail，出站解析到 Head。

use std::{collections::HashMap, sync::Arc};

use crate::filter::Filter;

/// 链节点的稳定标识：槽位下标加代数。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntryId {
    index: usize,
    generation: u32,
}

impl EntryId {
    /// Head 哨兵。
    pub const HEAD: EntryId = EntryId::sentinel(0);
    /// Tail 哨兵。
    pub const TAIL: EntryId = EntryId::sentinel(1);

    const fn sentinel(index: usize) -> Self {
        Self { index, generation: 0 }
    }

    /// 是否为哨兵。
    pub fn is_sentinel(self) -> bool {
        self == Self::HEAD || self == Self::TAIL
    }
}

/// 插入位置。
#[derive(Clone, Copy, Debug)]
pub(crate) enum Position<'a> {
    First,
    Last,
    Before(&'a str),
    After(&'a str),
}

pub(crate) struct Slot {
    pub(crate) name: Arc<str>,
    /// `None` 表示预留槽、墓碑或空闲槽。
    pub(crate) filter: Option<Arc<dyn Filter>>,
    pub(crate) prev: EntryId,
    pub(crate) next: EntryId,
    generation: u32,
}

pub(crate) struct ChainArena {
    slots: Vec<Slot>,
    index: HashMap<Arc<str>, EntryId>,
    /// 已摘除、等待回收的墓碑。
    retired: Vec<usize>,
    /// 可直接复用的空闲槽位。
    free: Vec<usize>,
}

impl ChainArena {
    pub(crate) fn new(head: Arc<dyn Filter>, tail: Arc<dyn Filter>) -> Self {
        let slots = vec![
            Slot {
                name: Arc::from("head"),
                filter: Some(head),
                prev: EntryId::HEAD,
                next: EntryId::TAIL,
                generation: 0,
            },
            Slot {
                name: Arc::from("tail"),
                filter: Some(tail),
                prev: EntryId::HEAD,
                next: EntryId::TAIL,
                generation: 0,
            },
        ];
        Self {
            slots,
            index: HashMap::new(),
            retired: Vec::new(),
            free: Vec::new(),
        }
    }

    /// 按标识取槽位；代数不匹配（槽位已被回收）时返回 `None`。
    pub(crate) fn slot(&self, id: EntryId) -> Option<&Slot> {
        self.slots
            .get(id.index)
            .filter(|slot| slot.generation == id.generation)
    }

    fn slot_mut(&mut self, id: EntryId) -> Option<&mut Slot> {
        self.slots
            .get_mut(id.index)
            .filter(|slot| slot.generation == id.generation)
    }

    fn sentinel(&self, id: EntryId) -> Option<(EntryId, Arc<dyn Filter>)> {
        let filter = self.slots.get(id.index)?.filter.as_ref()?;
        Some((id, Arc::clone(filter)))
    }

    pub(crate) fn lookup(&self, name: &str) -> Option<EntryId> {
        self.index.get(name).copied()
    }

    /// 解析插入位置对应的 `(prev, next)`；锚点不存在时返回 `None`。
    pub(crate) fn resolve(&self, position: Position<'_>) -> Option<(EntryId, EntryId)> {
        match position {
            Position::First => Some((EntryId::HEAD, self.slots[EntryId::HEAD.index].next)),
            Position::Last => Some((self.slots[EntryId::TAIL.index].prev, EntryId::TAIL)),
            Position::Before(anchor) => {
                let id = self.lookup(anchor)?;
                Some((self.slot(id)?.prev, id))
            }
            Position::After(anchor) => {
                let id = self.lookup(anchor)?;
                Some((id, self.slot(id)?.next))
            }
        }
    }

    /// 预留一个尚未接入链路的槽位，用于在 `on_pre_add` 之前确定节点标识。
    ///
    /// 优先复用空闲槽位；预留槽不被任何节点链接，失败时交还 [`ChainArena::release`]。
    pub(crate) fn reserve(&mut self, name: Arc<str>, prev: EntryId, next: EntryId) -> EntryId {
        if let Some(index) = self.free.pop() {
            let slot = &mut self.slots[index];
            slot.name = name;
            slot.prev = prev;
            slot.next = next;
            return EntryId {
                index,
                generation: slot.generation,
            };
        }
        let id = EntryId {
            index: self.slots.len(),
            generation: 0,
        };
        self.slots.push(Slot {
            name,
            filter: None,
            prev,
            next,
            generation: 0,
        });
        id
    }

    /// 交还从未接入链路的预留槽。
    pub(crate) fn release(&mut self, id: EntryId) {
        if id.is_sentinel() || self.slot(id).is_none_or(|slot| slot.filter.is_some()) {
            return;
        }
        self.vacate(id.index);
    }

    /// 回收全部墓碑；调用方保证此刻链上没有派发在途。
    pub(crate) fn reclaim(&mut self) -> usize {
        let retired = std::mem::take(&mut self.retired);
        let count = retired.len();
        for index in retired {
            self.vacate(index);
        }
        count
    }

    fn vacate(&mut self, index: usize) {
        let slot = &mut self.slots[index];
        slot.generation = slot.generation.wrapping_add(1);
        slot.name = Arc::from("");
        slot.prev = EntryId::HEAD;
        slot.next = EntryId::TAIL;
        self.free.push(index);
    }

    /// 把预留槽接入 `prev` 与 `next` 之间并登记名称。
    pub(crate) fn splice(&mut self, id: EntryId, filter: Arc<dyn Filter>, prev: EntryId, next: EntryId) {
        let name = {
            let Some(slot) = self.slot_mut(id) else {
                return;
            };
            slot.filter = Some(filter);
            slot.prev = prev;
            slot.next = next;
            Arc::clone(&slot.name)
        };
        if let Some(slot) = self.slot_mut(prev) {
            slot.next = id;
        }
        if let Some(slot) = self.slot_mut(next) {
            slot.prev = id;
        }
        self.index.insert(name, id);
    }

    /// 摘除活动节点，使其成为墓碑并返回原过滤器。
    pub(crate) fn unsplice(&mut self, id: EntryId) -> Option<Arc<dyn Filter>> {
        if id.is_sentinel() {
            return None;
        }
        let (name, filter, prev, next) = {
            let slot = self.slot_mut(id)?;
            let filter = slot.filter.take()?;
            (Arc::clone(&slot.name), filter, slot.prev, slot.next)
        };
        if let Some(slot) = self.slot_mut(prev) {
            slot.next = next;
        }
        if let Some(slot) = self.slot_mut(next) {
            slot.prev = prev;
        }
        self.index.remove(&name);
        self.retired.push(id.index);
        Some(filter)
    }

    /// 原地替换节点中的过滤器。
    pub(crate) fn swap(&mut self, id: EntryId, filter: Arc<dyn Filter>) -> Option<Arc<dyn Filter>> {
        let slot = self.slot_mut(id)?;
        let old = slot.filter.as_ref()?;
        let old = Arc::clone(old);
        slot.filter = Some(filter);
        Some(old)
    }

    /// 自 `from` 起向 Tail 方向寻找第一个活动节点（含 Tail）。
    pub(crate) fn successor(&self, from: EntryId) -> Option<(EntryId, Arc<dyn Filter>)> {
        if from == EntryId::TAIL {
            return None;
        }
        let Some(start) = self.slot(from) else {
            return self.sentinel(EntryId::TAIL);
        };
        let mut cursor = start.next;
        loop {
            let slot = self.slot(cursor)?;
            match &slot.filter {
                Some(filter) => return Some((cursor, Arc::clone(filter))),
                None => cursor = slot.next,
            }
        }
    }

    /// 自 `from` 起向 Head 方向寻找第一个活动节点（含 Head）。
    pub(crate) fn predecessor(&self, from: EntryId) -> Option<(EntryId, Arc<dyn Filter>)> {
        if from == EntryId::HEAD {
            return None;
        }
        let Some(start) = self.slot(from) else {
            return self.sentinel(EntryId::HEAD);
        };
        let mut cursor = start.prev;
        loop {
            let slot = self.slot(cursor)?;
            match &slot.filter {
                Some(filter) => return Some((cursor, Arc::clone(filter))),
                None => cursor = slot.prev,
            }
        }
    }

    /// 按链序（Head→Tail）列出用户节点。
    pub(crate) fn ordered(&self) -> Vec<(EntryId, Arc<str>, Arc<dyn Filter>)> {
        let mut entries = Vec::with_capacity(self.index.len());
        let mut cursor = self.slots[EntryId::HEAD.index].next;
        while cursor != EntryId::TAIL {
            let Some(slot) = self.slot(cursor) else {
                break;
            };
            if let Some(filter) = &slot.filter {
                entries.push((cursor, Arc::clone(&slot.name), Arc::clone(filter)));
            }
            cursor = slot.next;
        }
        entries
    }

    /// 按谓词查找第一个匹配的用户节点（链序）。
    pub(crate) fn find(&self, mut predicate: impl FnMut(&Arc<dyn Filter>) -> bool) -> Option<EntryId> {
        self.ordered()
            .into_iter()
            .find(|(_, _, filter)| predicate(filter))
            .map(|(id, _, _)| id)
    }

    pub(crate) fn len(&self) -> usize {
        self.index.len()
    }

    /// 已分配的槽位总数（含哨兵、墓碑与空闲槽）。
    #[cfg(test)]
    pub(crate) fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// 名称索引与链结构是否一致。
    #[cfg(test)]
    pub(crate) fn is_consistent(&self) -> bool {
        let ordered = self.ordered();
        ordered.len() == self.index.len()
            && ordered
                .iter()
                .all(|(id, name, _)| self.index.get(name.as_ref()) == Some(id))
    }
}
