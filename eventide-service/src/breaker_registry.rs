//! 熔断器注册表（BreakerRegistry）
//!
//! 按依赖名维护熔断器实例：进程启动时构造一次，按引用注入到各消费方，
//! 避免隐式的模块级全局状态。实例按名惰性创建，互不影响。
//!
use dashmap::DashMap;
use eventide_core::breaker::{BreakerConfig, BreakerSnapshot, CircuitBreaker};
use std::collections::BTreeMap;
use std::sync::Arc;

#[derive(Clone)]
pub struct BreakerRegistry {
    default_config: BreakerConfig,
    breakers: Arc<DashMap<String, Arc<CircuitBreaker>>>,
}

impl Default for BreakerRegistry {
    fn default() -> Self {
        Self::new(BreakerConfig::default())
    }
}

impl BreakerRegistry {
    pub fn new(default_config: BreakerConfig) -> Self {
        Self {
            default_config,
            breakers: Arc::new(DashMap::new()),
        }
    }

    /// 取出或以默认配置创建命名熔断器
    pub fn get_or_create(&self, name: &str) -> Arc<CircuitBreaker> {
        self.breakers
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(CircuitBreaker::new(name, self.default_config)))
            .clone()
    }

    /// 注册带自定义配置/谓词的熔断器（覆盖同名实例）
    pub fn insert(&self, breaker: CircuitBreaker) {
        self.breakers
            .insert(breaker.name().to_string(), Arc::new(breaker));
    }

    /// 指定依赖名集合的快照（用于服务健康）
    pub fn snapshot_of(&self, names: &[String]) -> BTreeMap<String, BreakerSnapshot> {
        names
            .iter()
            .filter_map(|name| self.breakers.get(name.as_str()))
            .map(|entry| (entry.key().clone(), entry.value().snapshot()))
            .collect()
    }

    /// 全部已知熔断器的快照
    pub fn snapshots(&self) -> BTreeMap<String, BreakerSnapshot> {
        self.breakers
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().snapshot()))
            .collect()
    }
}
