//! 触发器引擎
//!
//! 把作业定义中的触发器规格转换成具体的调度条目。单个触发器无效时只记录告警并跳过，
//! 不影响同一作业的其它触发器。

use std::collections::HashSet;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Utc};
use tracing::{debug, warn};

use scheduler_domain::{JobDefinition, Payload, TriggerDefinition, TriggerType};

use crate::cron_utils::{parse_timezone, CronScheduler};

#[derive(Debug, Clone)]
enum TriggerSchedule {
    Cron(CronScheduler),
    /// 周期按整秒计，从 anchor 开始
    Periodic {
        interval: Duration,
        anchor: DateTime<Utc>,
    },
    OneTime {
        at: DateTime<Utc>,
    },
}

/// 一个具体的调度条目
#[derive(Debug, Clone)]
pub struct ScheduleEntry {
    key: String,
    trigger_type: TriggerType,
    schedule: TriggerSchedule,
    start_at: Option<DateTime<Utc>>,
    end_at: Option<DateTime<Utc>>,
    registered_at: DateTime<Utc>,
    payload: Payload,
}

impl ScheduleEntry {
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn trigger_type(&self) -> TriggerType {
        self.trigger_type
    }

    pub fn start_at(&self) -> Option<DateTime<Utc>> {
        self.start_at
    }

    pub fn end_at(&self) -> Option<DateTime<Utc>> {
        self.end_at
    }

    pub fn registered_at(&self) -> DateTime<Utc> {
        self.registered_at
    }

    /// 作业参数与触发器参数合并后的结果，触发器参数优先
    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    pub fn is_repeating(&self) -> bool {
        !matches!(self.schedule, TriggerSchedule::OneTime { .. })
    }

    /// 周期触发器的重复间隔
    pub fn repeat_interval(&self) -> Option<StdDuration> {
        match &self.schedule {
            TriggerSchedule::Periodic { interval, .. } => interval.to_std().ok(),
            _ => None,
        }
    }

    pub fn cron_expression(&self) -> Option<&str> {
        match &self.schedule {
            TriggerSchedule::Cron(cron) => Some(cron.expression()),
            _ => None,
        }
    }

    /// 注册后的第一次触发时间
    ///
    /// 一次性触发器的开始时间早于注册时间时仍返回该时间，由触发循环立即补触发；
    /// 结束时间在注册前已过的除外。
    pub fn first_fire_time(&self) -> Option<DateTime<Utc>> {
        match &self.schedule {
            TriggerSchedule::OneTime { at } => match self.end_at {
                Some(end) if *at > end || end < self.registered_at => None,
                _ => Some(*at),
            },
            _ => self.next_fire_after(self.registered_at - Duration::milliseconds(1)),
        }
    }

    /// 严格晚于 `after` 且落在 [start_at, end_at] 内的下一次触发时间
    pub fn next_fire_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let next = match &self.schedule {
            TriggerSchedule::Cron(cron) => {
                let from = match self.start_at {
                    Some(start) if start > after => start - Duration::milliseconds(1),
                    _ => after,
                };
                cron.next_execution_time(from)?
            }
            TriggerSchedule::Periodic { interval, anchor } => {
                if after < *anchor {
                    *anchor
                } else {
                    let step = interval.num_milliseconds();
                    let elapsed = (after - *anchor).num_milliseconds();
                    *anchor + Duration::milliseconds((elapsed / step + 1) * step)
                }
            }
            TriggerSchedule::OneTime { at } => {
                if *at > after {
                    *at
                } else {
                    return None;
                }
            }
        };

        match self.end_at {
            Some(end) if next > end => None,
            _ => Some(next),
        }
    }
}

/// 触发器引擎
#[derive(Debug, Clone, Default)]
pub struct TriggerEngine;

impl TriggerEngine {
    pub fn new() -> Self {
        Self
    }

    pub fn create_triggers(&self, definition: &JobDefinition) -> Vec<ScheduleEntry> {
        self.create_triggers_at(definition, None, Utc::now())
    }

    /// 为作业定义构建调度条目
    ///
    /// `overlay` 是执行实例的参数，合并顺序为 作业 < 执行实例 < 触发器。
    /// 条目按触发器键去重，重复的键保留第一个。
    pub fn create_triggers_at(
        &self,
        definition: &JobDefinition,
        overlay: Option<&Payload>,
        now: DateTime<Utc>,
    ) -> Vec<ScheduleEntry> {
        let mut entries = Vec::with_capacity(definition.triggers.len());
        let mut seen = HashSet::new();

        for (ordinal, trigger) in definition.triggers.iter().enumerate() {
            let Some(schedule) = self.build_schedule(definition, ordinal, trigger, now) else {
                continue;
            };

            let key = trigger_key(trigger);
            if !seen.insert(key.clone()) {
                warn!(
                    "作业 {} 存在重复的触发器键 '{}'，忽略后出现的触发器",
                    definition.key(),
                    key
                );
                continue;
            }

            entries.push(ScheduleEntry {
                key,
                trigger_type: trigger.trigger_type,
                schedule,
                start_at: trigger.start_at,
                end_at: trigger.end_at,
                registered_at: now,
                payload: merge_payload(&definition.payload, overlay, &trigger.payload),
            });
        }

        debug!(
            "作业 {} 构建了 {}/{} 个调度条目",
            definition.key(),
            entries.len(),
            definition.triggers.len()
        );
        entries
    }

    /// 立即触发一次的条目，用于没有可用触发器的执行实例
    pub fn immediate(
        &self,
        definition: &JobDefinition,
        overlay: Option<&Payload>,
        now: DateTime<Utc>,
    ) -> ScheduleEntry {
        ScheduleEntry {
            key: generated_key(),
            trigger_type: TriggerType::OneTime,
            schedule: TriggerSchedule::OneTime { at: now },
            start_at: None,
            end_at: None,
            registered_at: now,
            payload: merge_payload(&definition.payload, overlay, &Payload::new()),
        }
    }

    fn build_schedule(
        &self,
        definition: &JobDefinition,
        ordinal: usize,
        trigger: &TriggerDefinition,
        now: DateTime<Utc>,
    ) -> Option<TriggerSchedule> {
        if let (Some(start), Some(end)) = (trigger.start_at, trigger.end_at) {
            if end < start {
                warn!(
                    "作业 {} 的第 {} 个触发器结束时间早于开始时间，已跳过",
                    definition.key(),
                    ordinal
                );
                return None;
            }
        }

        match trigger.trigger_type {
            TriggerType::Cron => {
                let expression = trigger.cron.as_deref().unwrap_or_default();
                let zone = parse_timezone(trigger.timezone.as_deref());
                match CronScheduler::with_zone(expression, zone) {
                    Ok(cron) => Some(TriggerSchedule::Cron(cron)),
                    Err(e) => {
                        warn!(
                            "作业 {} 的第 {} 个触发器CRON表达式无效，已跳过: {}",
                            definition.key(),
                            ordinal,
                            e
                        );
                        None
                    }
                }
            }
            TriggerType::Periodic => {
                let period_ms = trigger.period_ms.unwrap_or(0);
                let seconds = if period_ms > 0 { period_ms / 1000 } else { 0 };
                if seconds <= 0 {
                    warn!(
                        "作业 {} 的第 {} 个触发器周期无效 ({}ms)，已跳过",
                        definition.key(),
                        ordinal,
                        period_ms
                    );
                    return None;
                }
                Some(TriggerSchedule::Periodic {
                    interval: Duration::seconds(seconds),
                    anchor: trigger.start_at.unwrap_or(now),
                })
            }
            TriggerType::OneTime => Some(TriggerSchedule::OneTime {
                at: trigger.start_at.unwrap_or(now),
            }),
        }
    }
}

fn merge_payload(job: &Payload, overlay: Option<&Payload>, trigger: &Payload) -> Payload {
    let mut merged = job.clone();
    if let Some(overlay) = overlay {
        merged.extend(overlay.iter().map(|(k, v)| (k.clone(), v.clone())));
    }
    merged.extend(trigger.iter().map(|(k, v)| (k.clone(), v.clone())));
    merged
}

/// 触发器名称非空时作为键，否则生成随机令牌
fn trigger_key(trigger: &TriggerDefinition) -> String {
    match trigger.name.as_deref().map(str::trim) {
        Some(name) if !name.is_empty() => name.to_string(),
        _ => generated_key(),
    }
}

fn generated_key() -> String {
    format!("trigger-{}", uuid::Uuid::new_v4().simple())
}
