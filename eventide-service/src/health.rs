//! 服务健康模型（health）
//!
//! 单服务健康由自身状态与其依赖的熔断器快照组成；
//! 系统健康对全部服务取最差聚合。熔断器打开即视为降级，
//! 健康信号可查询而非仅日志。
//!
use chrono::{DateTime, Utc};
use eventide_core::breaker::{BreakerSnapshot, CircuitState};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

impl HealthStatus {
    fn severity(self) -> u8 {
        match self {
            HealthStatus::Healthy => 0,
            HealthStatus::Degraded => 1,
            HealthStatus::Unhealthy => 2,
        }
    }

    pub fn worst(self, other: HealthStatus) -> HealthStatus {
        if other.severity() > self.severity() {
            other
        } else {
            self
        }
    }
}

/// 单个服务的健康信号
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceHealth {
    name: String,
    status: HealthStatus,
    last_check: DateTime<Utc>,
    dependencies: BTreeMap<String, BreakerSnapshot>,
}

impl ServiceHealth {
    pub fn new(name: impl Into<String>, status: HealthStatus) -> Self {
        Self {
            name: name.into(),
            status,
            last_check: Utc::now(),
            dependencies: BTreeMap::new(),
        }
    }

    /// 由依赖的熔断器快照推导健康：任一非闭合即降级
    pub fn from_breakers(
        name: impl Into<String>,
        snapshots: impl IntoIterator<Item = BreakerSnapshot>,
    ) -> Self {
        let dependencies: BTreeMap<String, BreakerSnapshot> = snapshots
            .into_iter()
            .map(|s| (s.name().to_string(), s))
            .collect();
        let status = if dependencies
            .values()
            .any(|s| s.state() != CircuitState::Closed)
        {
            HealthStatus::Degraded
        } else {
            HealthStatus::Healthy
        };

        Self {
            name: name.into(),
            status,
            last_check: Utc::now(),
            dependencies,
        }
    }

    /// 覆盖推导出的状态（服务自身可判定为不可用）
    pub fn with_status(mut self, status: HealthStatus) -> Self {
        self.status = status;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn status(&self) -> HealthStatus {
        self.status
    }

    pub fn last_check(&self) -> DateTime<Utc> {
        self.last_check
    }

    pub fn dependencies(&self) -> &BTreeMap<String, BreakerSnapshot> {
        &self.dependencies
    }
}

/// 全部已注册服务的聚合健康
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemHealth {
    status: HealthStatus,
    services: Vec<ServiceHealth>,
}

impl SystemHealth {
    /// 取最差聚合；无服务时视为健康
    pub fn aggregate(services: Vec<ServiceHealth>) -> Self {
        let status = services
            .iter()
            .fold(HealthStatus::Healthy, |acc, s| acc.worst(s.status()));
        Self { status, services }
    }

    pub fn status(&self) -> HealthStatus {
        self.status
    }

    pub fn services(&self) -> &[ServiceHealth] {
        &self.services
    }
}
