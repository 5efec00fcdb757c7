//! 服务注册表（ServiceRegistry）
//!
//! 进程级的服务集合：按依赖序启动、逆序停止、聚合健康。
//! 注册表在进程启动时构造一次并注入，不依赖模块级全局状态。
//!
use crate::context::ServiceContext;
use crate::error::{ServiceError, ServiceResult};
use crate::health::SystemHealth;
use crate::service::Service;
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use tracing::{info, warn};

pub struct ServiceRegistry {
    ctx: Arc<ServiceContext>,
    services: Mutex<Vec<Arc<dyn Service>>>,
    started: Mutex<Vec<Arc<dyn Service>>>,
}

impl ServiceRegistry {
    pub fn new(ctx: Arc<ServiceContext>) -> Self {
        Self {
            ctx,
            services: Mutex::new(Vec::new()),
            started: Mutex::new(Vec::new()),
        }
    }

    pub fn context(&self) -> &Arc<ServiceContext> {
        &self.ctx
    }

    pub fn register(&self, service: Arc<dyn Service>) {
        self.services
            .lock()
            .expect("registry lock poisoned")
            .push(service);
    }

    /// 按依赖序启动全部服务；任一失败立即返回，已启动的保持运行
    pub async fn start_all(&self) -> ServiceResult<()> {
        let services = self.services.lock().expect("registry lock poisoned").clone();
        let ordered = Self::dependency_order(&services)?;

        for service in ordered {
            info!(service = service.name(), "starting");
            service.start(&self.ctx).await?;
            self.started
                .lock()
                .expect("registry lock poisoned")
                .push(service);
        }
        Ok(())
    }

    /// 逆启动序停止；先触发进程级取消信号，令重试循环与后台任务协作退出
    pub async fn stop_all(&self) {
        self.ctx.shutdown_token().cancel();

        let started =
            std::mem::take(&mut *self.started.lock().expect("registry lock poisoned"));
        for service in started.into_iter().rev() {
            info!(service = service.name(), "stopping");
            if let Err(err) = service.stop().await {
                warn!(service = service.name(), %err, "stop failed");
            }
        }
    }

    /// 聚合全部服务的健康信号（整体取最差）
    pub async fn health(&self) -> SystemHealth {
        let services = self.services.lock().expect("registry lock poisoned").clone();
        let mut healths = Vec::with_capacity(services.len());
        for service in services {
            healths.push(service.health_check().await);
        }
        SystemHealth::aggregate(healths)
    }

    /// 拓扑排序：未知依赖与依赖环都是注册错误
    fn dependency_order(
        services: &[Arc<dyn Service>],
    ) -> ServiceResult<Vec<Arc<dyn Service>>> {
        let known: HashSet<&str> = services.iter().map(|s| s.name()).collect();
        for service in services {
            for dependency in service.dependencies() {
                if !known.contains(dependency.as_str()) {
                    return Err(ServiceError::MissingDependency {
                        service: service.name().to_string(),
                        dependency,
                    });
                }
            }
        }

        let mut ordered: Vec<Arc<dyn Service>> = Vec::with_capacity(services.len());
        let mut placed: HashSet<String> = HashSet::new();

        // 反复扫描，按注册顺序挑出依赖已满足的服务，保证顺序确定
        while ordered.len() < services.len() {
            let mut progressed = false;
            for service in services {
                if placed.contains(service.name()) {
                    continue;
                }
                let ready = service
                    .dependencies()
                    .iter()
                    .all(|dep| placed.contains(dep.as_str()));
                if ready {
                    placed.insert(service.name().to_string());
                    ordered.push(service.clone());
                    progressed = true;
                }
            }
            if !progressed {
                let remaining: Vec<&str> = services
                    .iter()
                    .map(|s| s.name())
                    .filter(|name| !placed.contains(*name))
                    .collect();
                return Err(ServiceError::DependencyCycle {
                    services: remaining.join(", "),
                });
            }
        }
        Ok(ordered)
    }
}
