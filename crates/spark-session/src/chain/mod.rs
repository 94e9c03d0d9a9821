//! 会话级过滤器链。
//!
//! # 设计背景（Why）
//! - 每个会话独占一条链，链上节点在 Head/Tail 两个哨兵之间有序排列；入站事件自 Head 向 Tail
//!   传播，出站请求自 Tail 向 Head 传播，使“离线路最近”的过滤器最后看到出站数据。
//! - 过滤器（典型如 TLS）需要在运行期安全地插入与移除，因此结构性修改与事件派发必须互不破坏。
//!
//! # 逻辑（How）
//! - 节点存放在 [`arena::ChainArena`] 中，以 [`EntryId`] 寻址；结构修改持写锁，邻居解析持读锁；
//! - 生命周期钩子与过滤器回调一律在锁外执行，过滤器可在回调中重入链（增删节点、发起写入）；
//! - 每一跳的 `Err` 在调用点被捕获并转入 `exception_caught`，`exception_caught` 自身的失败只记录日志；
//! - 派发与生命周期钩子执行期间计入在途计数，计数归零后的下一次插入回收墓碑槽位。
//!
//! # 契约（What）
//! - 名称在链内唯一，哨兵不可移除、不可查找；
//! - 新增失败完整回滚；移除期钩子失败不阻止移除；
//! - `replace` 不触发任何钩子。

mod arena;
mod sentinel;

use std::{
    fmt,
    sync::{
        Arc, Weak,
        atomic::{AtomicUsize, Ordering},
    },
};

use spin::RwLock;
use tracing::{debug, trace, warn};

pub use arena::EntryId;
use arena::{ChainArena, Position};
use sentinel::{HeadFilter, TailFilter};

use crate::{
    ChainError, CoreError, IoSession, PipelineMessage, WriteRequest,
    error::LifecyclePhase,
    filter::{Filter, IdleStatus, NextFilter},
    future::ConnectStatus,
    session::CONNECT_FUTURE,
};

/// 链上流动的九类事件。
pub(crate) enum ChainEvent {
    SessionCreated,
    SessionOpened,
    SessionClosed,
    SessionIdle(IdleStatus),
    ExceptionCaught(CoreError),
    MessageReceived(PipelineMessage),
    MessageSent(WriteRequest),
    FilterWrite(WriteRequest),
    FilterClose,
}

impl ChainEvent {
    fn is_outbound(&self) -> bool {
        matches!(self, ChainEvent::FilterWrite(_) | ChainEvent::FilterClose)
    }

    fn kind(&self) -> &'static str {
        match self {
            ChainEvent::SessionCreated => "session_created",
            ChainEvent::SessionOpened => "session_opened",
            ChainEvent::SessionClosed => "session_closed",
            ChainEvent::SessionIdle(_) => "session_idle",
            ChainEvent::ExceptionCaught(_) => "exception_caught",
            ChainEvent::MessageReceived(_) => "message_received",
            ChainEvent::MessageSent(_) => "message_sent",
            ChainEvent::FilterWrite(_) => "filter_write",
            ChainEvent::FilterClose => "filter_close",
        }
    }
}

/// 链上一个用户节点的只读视图。
#[derive(Clone)]
pub struct FilterEntry {
    id: EntryId,
    name: Arc<str>,
    filter: Arc<dyn Filter>,
}

impl FilterEntry {
    /// 节点名称。
    pub fn name(&self) -> &str {
        &self.name
    }

    /// 节点当前持有的过滤器。
    pub fn filter(&self) -> &Arc<dyn Filter> {
        &self.filter
    }

    /// 与该节点永久绑定的转发句柄。
    pub fn next_filter(&self) -> NextFilter {
        NextFilter::new(self.id)
    }
}

impl fmt::Debug for FilterEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FilterEntry")
            .field("id", &self.id)
            .field("name", &self.name)
            .finish()
    }
}

/// 会话独占的过滤器链。
///
/// # 教案式说明
/// - **意图（Why）**：把“按层拦截 I/O 事件”的能力集中在一个拥有者里：只有链能修改节点链接与
///   名称索引，外部只拿到只读视图与 [`NextFilter`] 句柄。
/// - **逻辑（How）**：
///   - `add_*` 依次执行 `on_pre_add` → 接入 → `on_post_add`，后者失败即撤出节点；
///   - `remove*` 依次执行 `on_pre_remove` → 摘除 → `on_post_remove`，钩子错误在摘除完成后返回；
///   - `fire_*` 从 Head（入站）或 Tail（出站）开始派发。
/// - **契约（What）**：
///   - 链不会在派发期间持有锁；同一会话的链不会被反应器并发派发，但允许同线程重入；
///   - 会话释放后 `fire_*` 静默返回。
/// - **风险（Trade-offs）**：墓碑只在链上没有在途派发时回收；长期被保存的 [`NextFilter`]
///   若指向已回收的节点，入站转发直达 Tail、出站转发直达 Head。
pub struct FilterChain {
    session: Weak<IoSession>,
    session_id: u64,
    arena: RwLock<ChainArena>,
    in_flight: AtomicUsize,
}

/// 在途派发计数的作用域守卫。
struct InFlight<'a>(&'a AtomicUsize);

impl<'a> InFlight<'a> {
    fn enter(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl FilterChain {
    pub(crate) fn new(session: Weak<IoSession>, session_id: u64) -> Self {
        Self {
            session,
            session_id,
            arena: RwLock::new(ChainArena::new(Arc::new(HeadFilter), Arc::new(TailFilter))),
            in_flight: AtomicUsize::new(0),
        }
    }

    /// 拥有该链的会话。
    pub fn session(&self) -> Option<Arc<IoSession>> {
        self.session.upgrade()
    }

    /// 在 Head 之后插入。
    pub fn add_first(&self, name: &str, filter: Arc<dyn Filter>) -> Result<(), ChainError> {
        self.insert(name, filter, Position::First)
    }

    /// 在 Tail 之前插入。
    pub fn add_last(&self, name: &str, filter: Arc<dyn Filter>) -> Result<(), ChainError> {
        self.insert(name, filter, Position::Last)
    }

    /// 在 `base` 之前插入。
    pub fn add_before(&self, base: &str, name: &str, filter: Arc<dyn Filter>) -> Result<(), ChainError> {
        self.insert(name, filter, Position::Before(base))
    }

    /// 在 `base` 之后插入。
    pub fn add_after(&self, base: &str, name: &str, filter: Arc<dyn Filter>) -> Result<(), ChainError> {
        self.insert(name, filter, Position::After(base))
    }

    fn insert(&self, name: &str, filter: Arc<dyn Filter>, position: Position<'_>) -> Result<(), ChainError> {
        let (id, name) = {
            let mut arena = self.arena.write();
            let (prev, next) = Self::check_insert(&arena, name, position)?;
            if self.in_flight.load(Ordering::SeqCst) == 0 {
                let reclaimed = arena.reclaim();
                if reclaimed > 0 {
                    trace!(session = self.session_id, reclaimed, "tombstone slots reclaimed");
                }
            }
            let name: Arc<str> = Arc::from(name);
            (arena.reserve(Arc::clone(&name), prev, next), name)
        };
        let next = NextFilter::new(id);
        let _hooks = InFlight::enter(&self.in_flight);

        if let Err(source) = filter.on_pre_add(self, &name, &next) {
            self.arena.write().release(id);
            return Err(lifecycle(LifecyclePhase::PreAdd, &name, source));
        }

        {
            // 钩子执行期间链可能已被修改，接入前重新校验。
            let mut arena = self.arena.write();
            let (prev, next) = match Self::check_insert(&arena, &name, position) {
                Ok(neighbours) => neighbours,
                Err(error) => {
                    arena.release(id);
                    return Err(error);
                }
            };
            arena.splice(id, Arc::clone(&filter), prev, next);
        }
        debug!(session = self.session_id, filter = %name, "filter added");

        if let Err(source) = filter.on_post_add(self, &name, &next) {
            self.arena.write().unsplice(id);
            debug!(session = self.session_id, filter = %name, "filter add rolled back");
            return Err(lifecycle(LifecyclePhase::PostAdd, &name, source));
        }
        Ok(())
    }

    fn check_insert(
        arena: &ChainArena,
        name: &str,
        position: Position<'_>,
    ) -> Result<(EntryId, EntryId), ChainError> {
        if arena.lookup(name).is_some() {
            return Err(ChainError::DuplicateName {
                name: name.to_owned(),
            });
        }
        arena.resolve(position).ok_or_else(|| {
            let anchor = match position {
                Position::Before(anchor) | Position::After(anchor) => anchor,
                Position::First | Position::Last => name,
            };
            ChainError::not_found(anchor)
        })
    }

    /// 按名称移除，返回被移除的过滤器。
    pub fn remove(&self, name: &str) -> Result<Arc<dyn Filter>, ChainError> {
        let id = self.arena.read().lookup(name).ok_or_else(|| ChainError::not_found(name))?;
        self.remove_entry(id)
    }

    /// 按实例移除。
    pub fn remove_filter(&self, filter: &Arc<dyn Filter>) -> Result<Arc<dyn Filter>, ChainError> {
        let id = self
            .arena
            .read()
            .find(|candidate| same_filter(candidate, filter))
            .ok_or_else(|| ChainError::not_found("<filter instance>"))?;
        self.remove_entry(id)
    }

    /// 按类型移除链序上第一个匹配的过滤器。
    pub fn remove_type<F: Filter>(&self) -> Result<Arc<dyn Filter>, ChainError> {
        let id = self
            .arena
            .read()
            .find(is_type::<F>)
            .ok_or_else(|| ChainError::not_found(std::any::type_name::<F>()))?;
        self.remove_entry(id)
    }

    fn remove_entry(&self, id: EntryId) -> Result<Arc<dyn Filter>, ChainError> {
        let (name, filter) = {
            let arena = self.arena.read();
            let slot = arena.slot(id).ok_or_else(|| ChainError::not_found("<entry>"))?;
            let filter = slot
                .filter
                .clone()
                .ok_or_else(|| ChainError::not_found(slot.name.as_ref()))?;
            (Arc::clone(&slot.name), filter)
        };
        let next = NextFilter::new(id);
        let _hooks = InFlight::enter(&self.in_flight);

        let pre = filter.on_pre_remove(self, &name, &next);
        if self.arena.write().unsplice(id).is_none() {
            return Err(ChainError::not_found(name.as_ref()));
        }
        debug!(session = self.session_id, filter = %name, "filter removed");
        let post = filter.on_post_remove(self, &name, &next);

        match (pre, post) {
            (Ok(()), Ok(())) => Ok(filter),
            (Err(source), Ok(())) => Err(lifecycle(LifecyclePhase::PreRemove, &name, source)),
            (Ok(()), Err(source)) => Err(lifecycle(LifecyclePhase::PostRemove, &name, source)),
            (Err(pre), Err(post)) => Err(ChainError::Aggregate(vec![
                lifecycle(LifecyclePhase::PreRemove, &name, pre),
                lifecycle(LifecyclePhase::PostRemove, &name, post),
            ])),
        }
    }

    /// 按名称替换过滤器，返回旧实例；不触发生命周期钩子。
    pub fn replace(&self, name: &str, filter: Arc<dyn Filter>) -> Result<Arc<dyn Filter>, ChainError> {
        let mut arena = self.arena.write();
        let id = arena.lookup(name).ok_or_else(|| ChainError::not_found(name))?;
        arena.swap(id, filter).ok_or_else(|| ChainError::not_found(name))
    }

    /// 按实例替换。
    pub fn replace_filter(
        &self,
        old: &Arc<dyn Filter>,
        filter: Arc<dyn Filter>,
    ) -> Result<Arc<dyn Filter>, ChainError> {
        let mut arena = self.arena.write();
        let id = arena
            .find(|candidate| same_filter(candidate, old))
            .ok_or_else(|| ChainError::not_found("<filter instance>"))?;
        arena
            .swap(id, filter)
            .ok_or_else(|| ChainError::not_found("<filter instance>"))
    }

    /// 按类型替换链序上第一个匹配的过滤器。
    pub fn replace_type<F: Filter>(&self, filter: Arc<dyn Filter>) -> Result<Arc<dyn Filter>, ChainError> {
        let mut arena = self.arena.write();
        let id = arena
            .find(is_type::<F>)
            .ok_or_else(|| ChainError::not_found(std::any::type_name::<F>()))?;
        arena
            .swap(id, filter)
            .ok_or_else(|| ChainError::not_found(std::any::type_name::<F>()))
    }

    /// 按链序移除全部用户节点。
    ///
    /// 单个节点的钩子失败不会中止后续移除，全部失败在最后以 [`ChainError::Aggregate`] 返回。
    pub fn clear(&self) -> Result<(), ChainError> {
        let ids: Vec<EntryId> = self.arena.read().ordered().into_iter().map(|(id, _, _)| id).collect();
        let mut failures = Vec::new();
        for id in ids {
            match self.remove_entry(id) {
                Ok(_) | Err(ChainError::FilterNotFound { .. }) => {}
                Err(ChainError::Aggregate(errors)) => failures.extend(errors),
                Err(error) => failures.push(error),
            }
        }
        if failures.is_empty() {
            Ok(())
        } else {
            Err(ChainError::Aggregate(failures))
        }
    }

    /// 按名称查找过滤器。
    pub fn get(&self, name: &str) -> Option<Arc<dyn Filter>> {
        self.get_entry(name).map(|entry| entry.filter)
    }

    /// 按名称查找节点视图。
    pub fn get_entry(&self, name: &str) -> Option<FilterEntry> {
        let arena = self.arena.read();
        let id = arena.lookup(name)?;
        let slot = arena.slot(id)?;
        Some(FilterEntry {
            id,
            name: Arc::clone(&slot.name),
            filter: Arc::clone(slot.filter.as_ref()?),
        })
    }

    /// 按名称获取转发句柄。
    pub fn get_next_filter(&self, name: &str) -> Option<NextFilter> {
        self.arena.read().lookup(name).map(NextFilter::new)
    }

    /// 是否存在该名称。
    pub fn contains(&self, name: &str) -> bool {
        self.arena.read().lookup(name).is_some()
    }

    /// 是否包含该实例。
    pub fn contains_filter(&self, filter: &Arc<dyn Filter>) -> bool {
        self.arena
            .read()
            .find(|candidate| same_filter(candidate, filter))
            .is_some()
    }

    /// 是否包含该类型的过滤器。
    pub fn contains_type<F: Filter>(&self) -> bool {
        self.arena.read().find(is_type::<F>).is_some()
    }

    /// 链序（Head→Tail）的全部用户节点。
    pub fn get_all(&self) -> Vec<FilterEntry> {
        self.arena
            .read()
            .ordered()
            .into_iter()
            .map(|(id, name, filter)| FilterEntry { id, name, filter })
            .collect()
    }

    /// 逆链序（Tail→Head）的全部用户节点。
    pub fn get_all_reversed(&self) -> Vec<FilterEntry> {
        let mut entries = self.get_all();
        entries.reverse();
        entries
    }

    /// 用户节点数量。
    pub fn len(&self) -> usize {
        self.arena.read().len()
    }

    /// 是否没有用户节点。
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 自 Head 派发 `session_created`。
    pub fn fire_session_created(&self) {
        self.fire(EntryId::HEAD, ChainEvent::SessionCreated);
    }

    /// 自 Head 派发 `session_opened`。
    pub fn fire_session_opened(&self) {
        self.fire(EntryId::HEAD, ChainEvent::SessionOpened);
    }

    /// 先完成会话的关闭句柄，再自 Head 派发 `session_closed`。
    pub fn fire_session_closed(&self) {
        let Some(session) = self.session() else {
            return;
        };
        session.close_future().complete(());
        self.invoke_at(EntryId::HEAD, &session, ChainEvent::SessionClosed);
    }

    /// 自 Head 派发 `session_idle`。
    pub fn fire_session_idle(&self, status: IdleStatus) {
        self.fire(EntryId::HEAD, ChainEvent::SessionIdle(status));
    }

    /// 自 Head 派发 `message_received`。
    pub fn fire_message_received(&self, message: PipelineMessage) {
        self.fire(EntryId::HEAD, ChainEvent::MessageReceived(message));
    }

    /// 标记写请求已写出，再自 Head 派发 `message_sent`。
    pub fn fire_message_sent(&self, request: WriteRequest) {
        request.future().set_written();
        self.fire(EntryId::HEAD, ChainEvent::MessageSent(request));
    }

    /// 派发 `exception_caught`。
    ///
    /// 若会话仍有未完成的连接句柄，说明异常发生在会话创建之前：此时关闭会话并让连接句柄失败，
    /// 而不进入过滤器链。
    pub fn fire_exception_caught(&self, cause: CoreError) {
        let Some(session) = self.session() else {
            return;
        };
        self.exception_on(&session, cause);
    }

    /// 自 Tail 派发 `filter_write`。
    pub fn fire_filter_write(&self, request: WriteRequest) {
        self.fire(EntryId::TAIL, ChainEvent::FilterWrite(request));
    }

    /// 自 Tail 派发 `filter_close`。
    pub fn fire_filter_close(&self) {
        self.fire(EntryId::TAIL, ChainEvent::FilterClose);
    }

    fn fire(&self, start: EntryId, event: ChainEvent) {
        match self.session() {
            Some(session) => self.invoke_at(start, &session, event),
            None => trace!(
                session = self.session_id,
                event = event.kind(),
                "session released; event dropped"
            ),
        }
    }

    fn exception_on(&self, session: &Arc<IoSession>, cause: CoreError) {
        if let Some(connect) = session.attributes().remove(CONNECT_FUTURE) {
            session.close_now();
            connect.complete(ConnectStatus::Failed(cause));
            return;
        }
        self.invoke_at(EntryId::HEAD, session, ChainEvent::ExceptionCaught(cause));
    }

    fn invoke_at(&self, id: EntryId, session: &Arc<IoSession>, event: ChainEvent) {
        let _dispatch = InFlight::enter(&self.in_flight);
        let filter = self
            .arena
            .read()
            .slot(id)
            .and_then(|slot| slot.filter.clone());
        match filter {
            Some(filter) => self.invoke(id, &filter, session, event),
            // 入口节点在解析后被移除：按墓碑链接继续。
            None => self.forward(id, session, event),
        }
    }

    /// 自 `from` 把事件交给当前邻居：入站找后继，出站找前驱。
    pub(crate) fn forward(&self, from: EntryId, session: &Arc<IoSession>, event: ChainEvent) {
        let _dispatch = InFlight::enter(&self.in_flight);
        let target = {
            let arena = self.arena.read();
            if event.is_outbound() {
                arena.predecessor(from)
            } else {
                arena.successor(from)
            }
        };
        match target {
            Some((id, filter)) => self.invoke(id, &filter, session, event),
            None => trace!(
                session = self.session_id,
                event = event.kind(),
                "no neighbour past sentinel; event ends"
            ),
        }
    }

    fn invoke(&self, id: EntryId, filter: &Arc<dyn Filter>, session: &Arc<IoSession>, event: ChainEvent) {
        let next = NextFilter::new(id);
        let result = match event {
            ChainEvent::SessionCreated => filter.session_created(&next, session),
            ChainEvent::SessionOpened => filter.session_opened(&next, session),
            ChainEvent::SessionClosed => filter.session_closed(&next, session),
            ChainEvent::SessionIdle(status) => filter.session_idle(&next, session, status),
            ChainEvent::MessageReceived(message) => filter.message_received(&next, session, message),
            ChainEvent::MessageSent(request) => filter.message_sent(&next, session, request),
            ChainEvent::FilterClose => filter.filter_close(&next, session),
            ChainEvent::FilterWrite(request) => {
                let future = request.future().clone();
                let result = filter.filter_write(&next, session, request);
                if let Err(error) = &result {
                    future.set_failed(error.clone());
                }
                result
            }
            ChainEvent::ExceptionCaught(cause) => {
                if let Err(error) = filter.exception_caught(&next, session, cause) {
                    warn!(
                        session = self.session_id,
                        filter = %self.name_of(id),
                        error = %error,
                        "exception_caught handler failed; error dropped"
                    );
                }
                return;
            }
        };
        if let Err(error) = result {
            self.exception_on(session, error);
        }
    }

    fn name_of(&self, id: EntryId) -> Arc<str> {
        self.arena
            .read()
            .slot(id)
            .map(|slot| Arc::clone(&slot.name))
            .unwrap_or_else(|| Arc::from("<unknown>"))
    }
}

impl fmt::Debug for FilterChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<Arc<str>> = self
            .arena
            .read()
            .ordered()
            .into_iter()
            .map(|(_, name, _)| name)
            .collect();
        f.debug_struct("FilterChain")
            .field("session", &self.session_id)
            .field("filters", &names)
            .finish()
    }
}

fn lifecycle(phase: LifecyclePhase, name: &str, source: CoreError) -> ChainError {
    ChainError::Lifecycle {
        phase,
        name: name.to_owned(),
        source,
    }
}

fn same_filter(a: &Arc<dyn Filter>, b: &Arc<dyn Filter>) -> bool {
    std::ptr::addr_eq(Arc::as_ptr(a), Arc::as_ptr(b))
}

fn is_type<F: Filter>(filter: &Arc<dyn Filter>) -> bool {
    let filter: &dyn Filter = &**filter;
    filter.as_any().is::<F>()
}
