use std::{
    any::Any,
    collections::HashMap,
    fmt,
    marker::PhantomData,
    sync::Arc,
};

use spin::Mutex;

/// 强类型的会话属性键。
///
/// # 教案式说明
/// - **意图（Why）**：会话属性被多个过滤器共享（一次性标记、通知开关、TLS 会话状态），
///   以字符串为键、以类型为值的约定容易在不同模块之间漂移；键携带值类型后，
///   读取方无需手写向下转型。
/// - **契约（What）**：同名键必须始终绑定同一值类型；若类型不符，`get` 返回 `None`。
pub struct AttributeKey<T> {
    name: &'static str,
    _marker: PhantomData<fn() -> T>,
}

impl<T> AttributeKey<T> {
    /// 以稳定名称声明键，通常作为 `const` 使用。
    pub const fn new(name: &'static str) -> Self {
        Self {
            name,
            _marker: PhantomData,
        }
    }

    /// 键名。
    pub const fn name(&self) -> &'static str {
        self.name
    }
}

impl<T> Clone for AttributeKey<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for AttributeKey<T> {}

impl<T> fmt::Debug for AttributeKey<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("AttributeKey").field(&self.name).finish()
    }
}

type AttributeValue = Arc<dyn Any + Send + Sync>;

/// 会话级属性存储。
///
/// 值以 `Arc` 保存，读取得到共享引用；写入与读取在短暂的自旋锁内完成，不在锁内执行回调。
#[derive(Default)]
pub struct AttributeMap {
    entries: Mutex<HashMap<&'static str, AttributeValue>>,
}

impl AttributeMap {
    /// 创建空存储。
    pub fn new() -> Self {
        Self::default()
    }

    /// 写入属性，返回被替换的旧值。
    pub fn insert<T: Any + Send + Sync>(&self, key: AttributeKey<T>, value: T) -> Option<Arc<T>> {
        self.insert_shared(key, Arc::new(value))
    }

    /// 写入已共享的值。
    pub fn insert_shared<T: Any + Send + Sync>(
        &self,
        key: AttributeKey<T>,
        value: Arc<T>,
    ) -> Option<Arc<T>> {
        let previous = self.entries.lock().insert(key.name, value);
        previous.and_then(|old| old.downcast::<T>().ok())
    }

    /// 读取属性。
    pub fn get<T: Any + Send + Sync>(&self, key: AttributeKey<T>) -> Option<Arc<T>> {
        let value = self.entries.lock().get(key.name).cloned()?;
        value.downcast::<T>().ok()
    }

    /// 是否存在该键。
    pub fn contains<T>(&self, key: AttributeKey<T>) -> bool {
        self.entries.lock().contains_key(key.name)
    }

    /// 移除属性并返回旧值。
    pub fn remove<T: Any + Send + Sync>(&self, key: AttributeKey<T>) -> Option<Arc<T>> {
        let value = self.entries.lock().remove(key.name)?;
        value.downcast::<T>().ok()
    }

    /// 原子地“读取并移除”，用于一次性标记。
    pub fn take_marker<T>(&self, key: AttributeKey<T>) -> bool {
        self.entries.lock().remove(key.name).is_some()
    }

    /// 属性数量。
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// 是否为空。
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// 会话关闭时释放全部属性。
    pub fn clear(&self) {
        let drained: Vec<AttributeValue> = self.entries.lock().drain().map(|(_, v)| v).collect();
        drop(drained);
    }
}

impl fmt::Debug for AttributeMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let entries = self.entries.lock();
        f.debug_set().entries(entries.keys()).finish()
    }
}
