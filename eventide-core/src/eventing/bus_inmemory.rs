//! 内存版事件总线（InMemoryEventBus）
//!
//! 满足 `EventBus` 协议的日志结构化实现：
//! - 四条优先级通道，存在积压时恒按 Critical → High → Normal → Low 排空；
//! - 消费组：同组成员竞争消费，每组对匹配事件恰好入队一次；
//! - 可见性超时：成员确认前条目在途，超时后重投给其他成员；
//! - 重投超限的条目进入死信通道，带失败原因保留供查询；
//! - 超过阈值的大负载在发布时 gzip 压缩、读取时透明解压；
//! - 发布边界由 `SchemaRegistry` 校验，未知组合直接拒绝。
//!
//! 注意：该实现具备"至少一次"投递语义；事件仅入队到发布时已存在的
//! 消费组，无订阅者时发送将被忽略（持久性由发件箱负责）。
//!
use super::bus::{DeadLetter, EventBus, SubscribeOptions, SubscriptionId};
use super::handler::{EventHandler, HandledEventType};
use crate::error::{CoreError, CoreResult as Result};
use crate::event::{Event, Priority, SchemaRegistry};
use async_trait::async_trait;
use bon::Builder;
use futures_core::stream::BoxStream;
use futures_util::StreamExt;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::{Notify, broadcast};
use tokio_stream::wrappers::BroadcastStream;
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// 总线配置
#[derive(Builder, Clone, Copy, Debug)]
pub struct BusConfig {
    /// 序列化负载超过该字节数时启用 gzip 压缩
    #[builder(default = 16 * 1024)]
    compress_over_bytes: usize,
    /// 调度循环的兜底唤醒间隔（同时驱动可见性超时检查）
    #[builder(default = Duration::from_millis(25))]
    dispatch_tick: Duration,
    /// 旁路观测流的广播缓冲容量
    #[builder(default = 256)]
    tap_capacity: usize,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

struct EntryBytes {
    compressed: bool,
    data: Vec<u8>,
}

fn encode(event: &Event, compress_over: usize) -> Result<EntryBytes> {
    let data = serde_json::to_vec(event)?;
    if data.len() <= compress_over {
        return Ok(EntryBytes {
            compressed: false,
            data,
        });
    }

    use flate2::Compression;
    use flate2::write::GzEncoder;
    use std::io::Write;

    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder
        .write_all(&data)
        .map_err(|e| CoreError::codec(e.to_string()))?;
    let compressed = encoder
        .finish()
        .map_err(|e| CoreError::codec(e.to_string()))?;
    Ok(EntryBytes {
        compressed: true,
        data: compressed,
    })
}

fn decode(bytes: &EntryBytes) -> Result<Event> {
    let raw = if bytes.compressed {
        use flate2::read::GzDecoder;
        use std::io::Read;

        let mut decoder = GzDecoder::new(&bytes.data[..]);
        let mut out = Vec::new();
        decoder
            .read_to_end(&mut out)
            .map_err(|e| CoreError::codec(e.to_string()))?;
        out
    } else {
        bytes.data.clone()
    };
    Ok(serde_json::from_slice(&raw)?)
}

struct QueuedEntry {
    bytes: Arc<EntryBytes>,
    event_type: String,
    priority: Priority,
    redeliveries: u32,
}

struct InFlight {
    member: u64,
    attempt: u64,
    deadline: Instant,
    max_redeliveries: u32,
}

struct Member {
    id: u64,
    selector: HandledEventType,
    handler: Arc<dyn EventHandler>,
    options: SubscribeOptions,
    in_flight: usize,
}

struct Group {
    name: String,
    lanes: [VecDeque<u64>; 4],
    entries: HashMap<u64, QueuedEntry>,
    in_flight: HashMap<u64, InFlight>,
    members: Vec<Member>,
    rr: usize,
    next_attempt: u64,
    token: CancellationToken,
}

impl Group {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            lanes: [
                VecDeque::new(),
                VecDeque::new(),
                VecDeque::new(),
                VecDeque::new(),
            ],
            entries: HashMap::new(),
            in_flight: HashMap::new(),
            members: Vec::new(),
            rr: 0,
            next_attempt: 0,
            token: CancellationToken::new(),
        }
    }

    /// 按通道顺序找出下一个可派发的条目及其成员下标
    fn next_dispatch(&mut self) -> Option<(u64, usize)> {
        for lane in 0..self.lanes.len() {
            for i in 0..self.lanes[lane].len() {
                let id = self.lanes[lane][i];
                let Some(event_type) = self.entries.get(&id).map(|e| e.event_type.clone()) else {
                    continue;
                };
                if let Some(member_idx) = self.pick_member(&event_type) {
                    let _ = self.lanes[lane].remove(i);
                    return Some((id, member_idx));
                }
            }
        }
        None
    }

    /// 轮询选择匹配且有在途余量的成员（组内竞争消费）
    fn pick_member(&mut self, event_type: &str) -> Option<usize> {
        let n = self.members.len();
        for k in 0..n {
            let idx = (self.rr + k) % n;
            let member = &self.members[idx];
            if member.selector.matches(event_type)
                && member.in_flight < member.options.max_in_flight()
            {
                self.rr = (idx + 1) % n;
                return Some(idx);
            }
        }
        None
    }

    fn release_member(&mut self, member_id: u64) {
        if let Some(member) = self.members.iter_mut().find(|m| m.id == member_id) {
            member.in_flight = member.in_flight.saturating_sub(1);
        }
    }
}

#[derive(Default)]
struct BrokerState {
    groups: HashMap<String, Group>,
    dead: Vec<DeadLetter>,
    next_member_id: u64,
    next_entry_id: u64,
}

struct Shared {
    state: Mutex<BrokerState>,
    notify: Notify,
    tap: broadcast::Sender<Event>,
}

/// 基于进程内队列的事件总线实现
#[derive(Clone)]
pub struct InMemoryEventBus {
    schemas: Arc<SchemaRegistry>,
    config: BusConfig,
    shared: Arc<Shared>,
}

impl InMemoryEventBus {
    pub fn new(schemas: Arc<SchemaRegistry>) -> Self {
        Self::with_config(schemas, BusConfig::default())
    }

    pub fn with_config(schemas: Arc<SchemaRegistry>, config: BusConfig) -> Self {
        let (tap, _rx) = broadcast::channel(config.tap_capacity);
        Self {
            schemas,
            config,
            shared: Arc::new(Shared {
                state: Mutex::new(BrokerState::default()),
                notify: Notify::new(),
                tap,
            }),
        }
    }

    /// 旁路观测流：所有成功发布的事件的 `'static` 生命周期流，
    /// 便于在 `tokio::spawn` 中做监控与测试观察
    pub fn tap(&self) -> BoxStream<'static, Result<Event>> {
        let rx = self.shared.tap.subscribe();
        let stream =
            BroadcastStream::new(rx).map(|r| r.map_err(|e| CoreError::event_bus(e.to_string())));
        Box::pin(stream)
    }

    async fn dispatch_loop(
        shared: Arc<Shared>,
        group: String,
        token: CancellationToken,
        tick: Duration,
    ) {
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = shared.notify.notified() => {}
                _ = tokio::time::sleep(tick) => {}
            }
            Self::pump(&shared, &group);
        }
    }

    /// 单轮调度：先重投超时在途条目，再按通道顺序派发
    fn pump(shared: &Arc<Shared>, group_name: &str) {
        let now = Instant::now();
        let mut guard = shared.state.lock().expect("bus lock poisoned");
        let state = &mut *guard;
        let Some(group) = state.groups.get_mut(group_name) else {
            return;
        };

        let expired: Vec<u64> = group
            .in_flight
            .iter()
            .filter(|(_, f)| f.deadline <= now)
            .map(|(id, _)| *id)
            .collect();
        for id in expired {
            let Some(flight) = group.in_flight.remove(&id) else {
                continue;
            };
            group.release_member(flight.member);
            Self::retire_or_requeue(
                group,
                &mut state.dead,
                id,
                flight.max_redeliveries,
                "visibility timeout elapsed",
                false,
            );
        }

        while let Some((entry_id, member_idx)) = group.next_dispatch() {
            let member = &mut group.members[member_idx];
            member.in_flight += 1;
            let member_id = member.id;
            let options = member.options;
            let handler = member.handler.clone();

            let attempt = group.next_attempt;
            group.next_attempt += 1;
            group.in_flight.insert(
                entry_id,
                InFlight {
                    member: member_id,
                    attempt,
                    deadline: now + options.visibility_timeout(),
                    max_redeliveries: options.max_redeliveries(),
                },
            );

            let Some(bytes) = group.entries.get(&entry_id).map(|e| e.bytes.clone()) else {
                group.in_flight.remove(&entry_id);
                group.release_member(member_id);
                continue;
            };

            let shared = shared.clone();
            let group_name = group_name.to_string();
            tokio::spawn(async move {
                let handler_name = handler.handler_name().to_string();
                let outcome = match decode(&bytes) {
                    Ok(event) => {
                        handler
                            .handle(&event)
                            .await
                            .map_err(|e| CoreError::EventHandler {
                                handler: handler_name,
                                reason: e.to_string(),
                            })
                    }
                    Err(err) => Err(err),
                };
                Self::complete(&shared, &group_name, entry_id, attempt, outcome);
                shared.notify.notify_waiters();
            });
        }
    }

    /// 处理结果回执：确认移除或重投/入死信；迟到的回执按尝试序号丢弃
    fn complete(
        shared: &Arc<Shared>,
        group_name: &str,
        entry_id: u64,
        attempt: u64,
        outcome: Result<()>,
    ) {
        let mut guard = shared.state.lock().expect("bus lock poisoned");
        let state = &mut *guard;
        let Some(group) = state.groups.get_mut(group_name) else {
            return;
        };
        match group.in_flight.get(&entry_id) {
            Some(flight) if flight.attempt == attempt => {}
            _ => return, // 条目已因超时被重投，忽略旧尝试的回执
        }
        let flight = group
            .in_flight
            .remove(&entry_id)
            .expect("in-flight entry vanished");
        group.release_member(flight.member);

        match outcome {
            Ok(()) => {
                group.entries.remove(&entry_id);
            }
            Err(err) => {
                // 永久错误（解码/负载）不重投，直接入死信
                let force_dead = !err.is_transient();
                Self::retire_or_requeue(
                    group,
                    &mut state.dead,
                    entry_id,
                    flight.max_redeliveries,
                    &err.to_string(),
                    force_dead,
                );
            }
        }
    }

    fn retire_or_requeue(
        group: &mut Group,
        dead: &mut Vec<DeadLetter>,
        entry_id: u64,
        max_redeliveries: u32,
        reason: &str,
        force_dead: bool,
    ) {
        let Some(entry) = group.entries.get_mut(&entry_id) else {
            return;
        };
        entry.redeliveries += 1;

        if force_dead || entry.redeliveries > max_redeliveries {
            let entry = group
                .entries
                .remove(&entry_id)
                .expect("dead entry vanished");
            match decode(&entry.bytes) {
                Ok(event) => dead.push(DeadLetter::new(
                    event,
                    group.name.clone(),
                    reason.to_string(),
                    entry.redeliveries,
                )),
                Err(err) => warn!(group = %group.name, %err, "dropping undecodable dead entry"),
            }
        } else {
            group.lanes[entry.priority.lane()].push_back(entry_id);
        }
    }
}

#[async_trait]
impl EventBus for InMemoryEventBus {
    async fn publish(&self, event: &Event) -> Result<()> {
        self.schemas.validate(event)?;
        let bytes = Arc::new(encode(event, self.config.compress_over_bytes)?);

        {
            let mut state = self.shared.state.lock().expect("bus lock poisoned");
            let mut next_entry_id = state.next_entry_id;
            for group in state.groups.values_mut() {
                let matches = group
                    .members
                    .iter()
                    .any(|m| m.selector.matches(event.event_type()));
                if !matches {
                    continue;
                }
                let id = next_entry_id;
                next_entry_id += 1;
                group.entries.insert(
                    id,
                    QueuedEntry {
                        bytes: bytes.clone(),
                        event_type: event.event_type().to_string(),
                        priority: event.priority(),
                        redeliveries: 0,
                    },
                );
                group.lanes[event.priority().lane()].push_back(id);
            }
            state.next_entry_id = next_entry_id;
        }

        let _ = self.shared.tap.send(event.clone());
        self.shared.notify.notify_waiters();
        Ok(())
    }

    async fn subscribe(
        &self,
        selector: HandledEventType,
        group: &str,
        handler: Arc<dyn EventHandler>,
        options: SubscribeOptions,
    ) -> Result<SubscriptionId> {
        let (member_id, is_new_group, token) = {
            let mut state = self.shared.state.lock().expect("bus lock poisoned");
            let member_id = state.next_member_id;
            state.next_member_id += 1;

            let is_new_group = !state.groups.contains_key(group);
            let entry = state
                .groups
                .entry(group.to_string())
                .or_insert_with(|| Group::new(group));
            entry.members.push(Member {
                id: member_id,
                selector,
                handler,
                options,
                in_flight: 0,
            });
            (member_id, is_new_group, entry.token.clone())
        };

        if is_new_group {
            tokio::spawn(Self::dispatch_loop(
                self.shared.clone(),
                group.to_string(),
                token,
                self.config.dispatch_tick,
            ));
        }

        self.shared.notify.notify_waiters();
        Ok(SubscriptionId::new(group.to_string(), member_id))
    }

    async fn unsubscribe(&self, subscription: &SubscriptionId) -> Result<()> {
        let mut state = self.shared.state.lock().expect("bus lock poisoned");
        let Some(group) = state.groups.get_mut(subscription.group()) else {
            return Ok(());
        };
        group.members.retain(|m| m.id != subscription.member());
        if group.members.is_empty() {
            group.token.cancel();
            state.groups.remove(subscription.group());
        }
        Ok(())
    }

    async fn dead_letters(&self) -> Result<Vec<DeadLetter>> {
        let state = self.shared.state.lock().expect("bus lock poisoned");
        Ok(state.dead.clone())
    }
}
