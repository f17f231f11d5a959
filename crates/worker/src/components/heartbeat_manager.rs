use std::sync::Arc;
use std::time::Duration;

use metrics::counter;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info};

use scheduler_domain::WorkerActivity;

use super::WorkerLifecycle;

/// 固定频率上报 HEARTBEAT，失败只记录日志
pub struct HeartbeatManager {
    lifecycle: Arc<WorkerLifecycle>,
    heartbeat_interval: Duration,
}

impl HeartbeatManager {
    pub fn new(lifecycle: Arc<WorkerLifecycle>, heartbeat_interval: Duration) -> Self {
        Self {
            lifecycle,
            heartbeat_interval,
        }
    }

    pub fn start_heartbeat_task(&self, mut shutdown_rx: broadcast::Receiver<()>) -> JoinHandle<()> {
        let lifecycle = Arc::clone(&self.lifecycle);
        let period = self.heartbeat_interval;

        tokio::spawn(async move {
            let mut heartbeat_interval = interval(period);
            heartbeat_interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // 注册本身已经代表一次活动，跳过立即触发的第一个 tick
            heartbeat_interval.tick().await;
            loop {
                tokio::select! {
                    _ = heartbeat_interval.tick() => {
                        match lifecycle.heartbeat(WorkerActivity::Heartbeat).await {
                            Ok(_) => debug!("Worker {} 心跳发送成功", lifecycle.name()),
                            Err(e) => {
                                counter!("scheduler_heartbeat_failures_total").increment(1);
                                error!("Worker {} 心跳发送失败: {}", lifecycle.name(), e);
                            }
                        }
                    }
                    _ = shutdown_rx.recv() => {
                        info!("心跳任务退出");
                        break;
                    }
                }
            }
        })
    }
}
