//! 受监督任务集（TaskSet）
//!
//! 服务生命周期内产生的后台任务统一归入任务集：`start()` 时派生、
//! `stop()` 时取消并在宽限期内等待，超期强制中止。禁止游离的
//! fire-and-forget 任务。
//!
use std::future::Future;
use std::sync::Mutex;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub struct TaskSet {
    token: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Default for TaskSet {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskSet {
    pub fn new() -> Self {
        Self {
            token: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// 以父令牌的子令牌构造：父级取消时任务集随之取消
    pub fn child_of(parent: &CancellationToken) -> Self {
        Self {
            token: parent.child_token(),
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// 任务应监听该令牌实现协作式退出
    pub fn cancellation_token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub fn spawn<F>(&self, fut: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.tasks
            .lock()
            .expect("task set lock poisoned")
            .push(tokio::spawn(fut));
    }

    pub fn len(&self) -> usize {
        self.tasks.lock().expect("task set lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 取消全部任务并在宽限期内等待；超期任务被强制中止
    ///
    /// 返回是否全部任务在宽限期内自行结束
    pub async fn cancel_and_join(&self, grace: Duration) -> bool {
        self.token.cancel();
        let tasks = std::mem::take(&mut *self.tasks.lock().expect("task set lock poisoned"));
        let deadline = tokio::time::Instant::now() + grace;

        let mut clean = true;
        for task in tasks {
            let abort = task.abort_handle();
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if tokio::time::timeout(remaining, task).await.is_err() {
                abort.abort();
                clean = false;
            }
        }
        clean
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[tokio::test(flavor = "multi_thread")]
    async fn cooperative_tasks_exit_within_the_grace_period() {
        let set = TaskSet::new();
        let finished = Arc::new(AtomicBool::new(false));
        let token = set.cancellation_token();
        let finished_in = finished.clone();

        set.spawn(async move {
            token.cancelled().await;
            finished_in.store(true, Ordering::SeqCst);
        });

        let clean = set.cancel_and_join(Duration::from_secs(1)).await;
        assert!(clean);
        assert!(finished.load(Ordering::SeqCst));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn hung_tasks_are_aborted_after_the_grace_period() {
        let set = TaskSet::new();
        set.spawn(async {
            std::future::pending::<()>().await;
        });

        let clean = set.cancel_and_join(Duration::from_millis(50)).await;
        assert!(!clean);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn child_sets_follow_the_parent_token() {
        let parent = CancellationToken::new();
        let set = TaskSet::child_of(&parent);
        let token = set.cancellation_token();

        parent.cancel();
        assert!(token.is_cancelled());
    }
}
