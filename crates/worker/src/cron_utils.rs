use std::str::FromStr;

use chrono::{DateTime, FixedOffset, Offset, Utc};
use chrono_tz::Tz;
use cron::Schedule;
use tracing::warn;

use scheduler_core::{SchedulerError, SchedulerResult};

/// 触发器时区：IANA 命名时区（随夏令时变化）或固定偏移
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerZone {
    Named(Tz),
    Fixed(FixedOffset),
}

impl TriggerZone {
    pub fn utc() -> Self {
        TriggerZone::Fixed(Utc.fix())
    }

    /// 指定时刻该时区相对 UTC 的偏移秒数
    pub fn offset_seconds_at(&self, at: DateTime<Utc>) -> i32 {
        match self {
            TriggerZone::Named(tz) => at.with_timezone(tz).offset().fix().local_minus_utc(),
            TriggerZone::Fixed(offset) => offset.local_minus_utc(),
        }
    }
}

/// CRON表达式解析和调度工具
///
/// 表达式为六段或七段（秒 分 时 日 月 周 [年]），`?` 视为 `*`。
#[derive(Debug, Clone)]
pub struct CronScheduler {
    expression: String,
    schedule: Schedule,
    zone: TriggerZone,
}

impl CronScheduler {
    /// 创建新的CRON调度器，按 UTC 计算
    pub fn new(cron_expr: &str) -> SchedulerResult<Self> {
        Self::with_zone(cron_expr, TriggerZone::utc())
    }

    /// 在指定时区下解析表达式，各字段按该时区的本地时间匹配
    pub fn with_zone(cron_expr: &str, zone: TriggerZone) -> SchedulerResult<Self> {
        let schedule = parse(cron_expr)?;
        Ok(Self {
            expression: cron_expr.trim().to_string(),
            schedule,
            zone,
        })
    }

    pub fn expression(&self) -> &str {
        &self.expression
    }

    pub fn zone(&self) -> TriggerZone {
        self.zone
    }

    /// 严格晚于 `from` 的下一次执行时间
    pub fn next_execution_time(&self, from: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.times_after(from).next()
    }

    /// 获取从指定时间开始的多个执行时间
    pub fn upcoming_times(&self, from: DateTime<Utc>, count: usize) -> Vec<DateTime<Utc>> {
        self.times_after(from).take(count).collect()
    }

    /// 验证CRON表达式是否有效
    pub fn validate_cron_expression(cron_expr: &str) -> SchedulerResult<()> {
        parse(cron_expr).map(|_| ())
    }

    fn times_after(&self, from: DateTime<Utc>) -> Box<dyn Iterator<Item = DateTime<Utc>> + '_> {
        match &self.zone {
            TriggerZone::Named(tz) => Box::new(
                self.schedule
                    .after(&from.with_timezone(tz))
                    .map(|t| t.with_timezone(&Utc)),
            ),
            TriggerZone::Fixed(offset) => Box::new(
                self.schedule
                    .after(&from.with_timezone(offset))
                    .map(|t| t.with_timezone(&Utc)),
            ),
        }
    }
}

fn parse(cron_expr: &str) -> SchedulerResult<Schedule> {
    let normalized = cron_expr.trim().replace('?', "*");
    if normalized.is_empty() {
        return Err(SchedulerError::InvalidCron {
            expr: cron_expr.to_string(),
            message: "表达式为空".to_string(),
        });
    }
    Schedule::from_str(&normalized).map_err(|e| SchedulerError::InvalidCron {
        expr: cron_expr.to_string(),
        message: e.to_string(),
    })
}

/// 解析触发器时区
///
/// 先按 IANA 名称解析（如 `Europe/Berlin`），再尝试 `GMT`、`Z` 以及 `+08:00`、`-0530`、
/// `UTC+8` 形式的固定偏移；空值按 UTC，无法识别的时区记录告警并按 UTC 处理。
pub fn parse_timezone(timezone: Option<&str>) -> TriggerZone {
    let raw = match timezone.map(str::trim) {
        None | Some("") => return TriggerZone::utc(),
        Some(tz) => tz,
    };

    if let Ok(tz) = raw.parse::<Tz>() {
        return TriggerZone::Named(tz);
    }

    let upper = raw.to_ascii_uppercase();
    let offset_part = upper
        .strip_prefix("UTC")
        .or_else(|| upper.strip_prefix("GMT"))
        .unwrap_or(&upper);

    if offset_part.is_empty() || offset_part == "Z" {
        return TriggerZone::utc();
    }

    match parse_offset(offset_part) {
        Some(offset) => TriggerZone::Fixed(offset),
        None => {
            warn!("无法识别的时区 '{}'，按 UTC 计算", raw);
            TriggerZone::utc()
        }
    }
}

fn parse_offset(value: &str) -> Option<FixedOffset> {
    let (sign, rest) = match value.as_bytes().first()? {
        b'+' => (1, &value[1..]),
        b'-' => (-1, &value[1..]),
        _ => return None,
    };

    let digits: String = rest.chars().filter(|c| *c != ':').collect();
    if digits.is_empty() || !digits.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    let (hours, minutes) = match digits.len() {
        1 | 2 => (digits.parse::<i32>().ok()?, 0),
        3 | 4 => {
            let split = digits.len() - 2;
            (
                digits[..split].parse::<i32>().ok()?,
                digits[split..].parse::<i32>().ok()?,
            )
        }
        _ => return None,
    };
    if hours > 18 || minutes > 59 {
        return None;
    }
    FixedOffset::east_opt(sign * (hours * 3600 + minutes * 60))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Timelike};

    #[test]
    fn test_cron_scheduler_creation() {
        assert!(CronScheduler::new("0 0 0 * * *").is_ok());
        assert!(CronScheduler::new("0 0 12 ? * MON").is_ok());
        assert!(CronScheduler::new("invalid").is_err());
        assert!(CronScheduler::new("   ").is_err());
    }

    #[test]
    fn test_upcoming_times() {
        let scheduler = CronScheduler::new("0 0 * * * *").unwrap();
        let now = Utc.with_ymd_and_hms(2024, 1, 1, 12, 30, 0).unwrap();
        let upcoming = scheduler.upcoming_times(now, 3);

        assert_eq!(upcoming.len(), 3);
        assert_eq!(upcoming[0].hour(), 13);
        assert_eq!(upcoming[1].hour(), 14);
        assert_eq!(upcoming[2].hour(), 15);
    }

    #[test]
    fn test_next_execution_is_strictly_after() {
        let scheduler = CronScheduler::new("0 * * * * *").unwrap();
        let on_the_minute = Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap();
        let next = scheduler.next_execution_time(on_the_minute).unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2024, 1, 1, 12, 1, 0).unwrap());
    }

    #[test]
    fn test_offset_applies_to_cron_fields() {
        let zone = parse_timezone(Some("+08:00"));
        let scheduler = CronScheduler::with_zone("0 0 9 * * *", zone).unwrap();
        let from = Utc.with_ymd_and_hms(2024, 1, 1, 0, 30, 0).unwrap();
        // 09:00 +08:00 == 01:00 UTC
        assert_eq!(
            scheduler.next_execution_time(from).unwrap(),
            Utc.with_ymd_and_hms(2024, 1, 1, 1, 0, 0).unwrap()
        );
    }

    #[test]
    fn test_named_zone_follows_daylight_saving() {
        let zone = parse_timezone(Some("Europe/Berlin"));
        assert_eq!(zone, TriggerZone::Named(chrono_tz::Europe::Berlin));
        let scheduler = CronScheduler::with_zone("0 0 9 * * *", zone).unwrap();

        // 2024-03-31 凌晨柏林从 CET(+01:00) 切换到 CEST(+02:00)
        let from = Utc.with_ymd_and_hms(2024, 3, 29, 12, 0, 0).unwrap();
        assert_eq!(
            scheduler.upcoming_times(from, 3),
            vec![
                Utc.with_ymd_and_hms(2024, 3, 30, 8, 0, 0).unwrap(),
                Utc.with_ymd_and_hms(2024, 3, 31, 7, 0, 0).unwrap(),
                Utc.with_ymd_and_hms(2024, 4, 1, 7, 0, 0).unwrap(),
            ]
        );
    }

    #[test]
    fn test_named_zone_autumn_change() {
        let zone = parse_timezone(Some("America/New_York"));
        let scheduler = CronScheduler::with_zone("0 0 9 * * *", zone).unwrap();

        // 2024-11-03 纽约从 EDT(-04:00) 回到 EST(-05:00)
        let from = Utc.with_ymd_and_hms(2024, 11, 2, 0, 0, 0).unwrap();
        assert_eq!(
            scheduler.upcoming_times(from, 2),
            vec![
                Utc.with_ymd_and_hms(2024, 11, 2, 13, 0, 0).unwrap(),
                Utc.with_ymd_and_hms(2024, 11, 3, 14, 0, 0).unwrap(),
            ]
        );
    }

    #[test]
    fn test_parse_timezone() {
        let at = Utc.with_ymd_and_hms(2024, 7, 1, 0, 0, 0).unwrap();
        let offset = |tz: Option<&str>| parse_timezone(tz).offset_seconds_at(at);

        assert_eq!(offset(None), 0);
        assert_eq!(offset(Some("UTC")), 0);
        assert_eq!(offset(Some("utc")), 0);
        assert_eq!(offset(Some("+08:00")), 8 * 3600);
        assert_eq!(offset(Some("-0530")), -(5 * 3600 + 1800));
        assert_eq!(offset(Some("UTC+8")), 8 * 3600);
        assert_eq!(offset(Some("Asia/Shanghai")), 8 * 3600);
        assert_eq!(offset(Some("Europe/Berlin")), 2 * 3600);
        assert_eq!(offset(Some("Mars/Olympus")), 0);
        assert_eq!(parse_timezone(Some("Mars/Olympus")), TriggerZone::utc());
    }
}
