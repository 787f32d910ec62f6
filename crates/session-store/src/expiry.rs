//! Expiry Policy (C2): decides whether an existing session must reset
//! (spec §4.2). Pure function, with hooks for time/timezone injection so
//! tests never depend on the wall clock.

use chrono::{DateTime, Datelike, LocalResult, TimeZone, Utc};
use chrono_tz::Tz;

use session_domain::config::{ResetConfig, ResetMode, ScopeConfig};

use crate::types::ConvType;

/// Resolve the effective `ResetConfig` for a channel/conv-type pair, per
/// the precedence: per-channel > per-conv-type > default (spec §4.2
/// "Precedence").
pub fn effective_reset_config<'a>(
    scope: &'a ScopeConfig,
    channel: &str,
    conv_type: ConvType,
) -> &'a ResetConfig {
    if let Some(cfg) = scope.reset_by_channel.get(channel) {
        return cfg;
    }
    if let Some(cfg) = scope.reset_by_type.get(conv_type.as_str()) {
        return cfg;
    }
    &scope.reset
}

/// `last_activity` per spec §4.2: `updated_at` if non-zero, else
/// `created_at`, else `None` (never resets).
pub fn last_activity(
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
) -> Option<DateTime<Utc>> {
    let epoch = DateTime::<Utc>::UNIX_EPOCH;
    if updated_at != epoch {
        Some(updated_at)
    } else if created_at != epoch {
        Some(created_at)
    } else {
        None
    }
}

fn resolve_tz(name: &str) -> Tz {
    name.parse().unwrap_or(chrono_tz::UTC)
}

fn clamp_at_hour(at_hour: i32) -> u32 {
    if (0..=23).contains(&at_hour) {
        at_hour as u32
    } else {
        0
    }
}

/// Resolve `at_hour:00:00` on the given local calendar date in `tz`. A
/// DST spring-forward gap makes that wall-clock hour not exist in `tz` on
/// some dates (e.g. `America/New_York`'s "02:00" on its spring-forward
/// day); `.single()` returns `None` there even though the input (config +
/// date) is entirely valid, so this falls back to the earliest valid
/// instant at or after that wall-clock time rather than panicking. An
/// ambiguous local time (fall-back overlap) picks its earlier instant, so
/// the boundary stays monotonic with calendar date.
fn local_boundary(tz: Tz, year: i32, month: u32, day: u32, at_hour: u32) -> DateTime<Utc> {
    let result: LocalResult<DateTime<Tz>> = tz.with_ymd_and_hms(year, month, day, at_hour, 0, 0);
    result
        .earliest()
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|| {
            Utc.with_ymd_and_hms(year, month, day, at_hour, 0, 0)
                .single()
                .expect("valid calendar date")
        })
}

/// Most recent occurrence of `at_hour:00:00` in `tz`, at or before `now`.
fn most_recent_boundary(now: DateTime<Utc>, tz: Tz, at_hour: u32) -> DateTime<Utc> {
    let local_now = now.with_timezone(&tz);
    let today_boundary = local_boundary(tz, local_now.year(), local_now.month(), local_now.day(), at_hour);
    if today_boundary <= now {
        today_boundary
    } else {
        let yesterday = local_now - chrono::Duration::days(1);
        local_boundary(tz, yesterday.year(), yesterday.month(), yesterday.day(), at_hour)
    }
}

/// Next upcoming occurrence of `at_hour:00:00` in `tz`, strictly after `now`
/// when `now` sits exactly on a boundary is still "today" per spec §4.2
/// ("today if we have not yet reached it, else tomorrow").
fn next_boundary(now: DateTime<Utc>, tz: Tz, at_hour: u32) -> DateTime<Utc> {
    let local_now = now.with_timezone(&tz);
    let today_boundary = local_boundary(tz, local_now.year(), local_now.month(), local_now.day(), at_hour);
    if today_boundary > now {
        today_boundary
    } else {
        let tomorrow = local_now + chrono::Duration::days(1);
        local_boundary(tz, tomorrow.year(), tomorrow.month(), tomorrow.day(), at_hour)
    }
}

/// Decide whether a session should reset given its timestamps, conv type,
/// and scope config (spec §4.2 "Reset modes").
pub fn should_reset(
    scope: &ScopeConfig,
    channel: &str,
    conv_type: ConvType,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    now: DateTime<Utc>,
) -> bool {
    let cfg = effective_reset_config(scope, channel, conv_type);
    let last = match last_activity(created_at, updated_at) {
        Some(t) => t,
        None => return false,
    };
    let tz = resolve_tz(&scope.timezone);

    match cfg.mode {
        ResetMode::Never => false,
        ResetMode::Idle => is_idle_expired(last, now, cfg.idle_minutes),
        ResetMode::Daily => is_daily_expired(last, now, tz, cfg.at_hour),
        ResetMode::DailyIdle => {
            is_daily_expired(last, now, tz, cfg.at_hour)
                || is_idle_expired(last, now, cfg.idle_minutes)
        }
    }
}

fn is_idle_expired(last: DateTime<Utc>, now: DateTime<Utc>, idle_minutes: i64) -> bool {
    if idle_minutes <= 0 {
        return false;
    }
    now.signed_duration_since(last) >= chrono::Duration::minutes(idle_minutes)
}

fn is_daily_expired(last: DateTime<Utc>, now: DateTime<Utc>, tz: Tz, at_hour: i32) -> bool {
    let at_hour = clamp_at_hour(at_hour);
    let boundary = most_recent_boundary(now, tz, at_hour);
    last < boundary
}

/// The next time this session would reset, if the mode is time-based
/// (spec §4.2 "Next-reset time"). `None` for `never`/`idle` modes.
pub fn next_reset_time(
    scope: &ScopeConfig,
    channel: &str,
    conv_type: ConvType,
    now: DateTime<Utc>,
) -> Option<DateTime<Utc>> {
    let cfg = effective_reset_config(scope, channel, conv_type);
    let tz = resolve_tz(&scope.timezone);
    match cfg.mode {
        ResetMode::Daily | ResetMode::DailyIdle => {
            Some(next_boundary(now, tz, clamp_at_hour(cfg.at_hour)))
        }
        ResetMode::Never | ResetMode::Idle => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn utc(y: i32, m: u32, d: u32, h: u32, mi: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, h, mi, 0).single().unwrap()
    }

    #[test]
    fn scenario_2_expiry() {
        let scope = ScopeConfig {
            reset: ResetConfig {
                mode: ResetMode::Daily,
                at_hour: 9,
                idle_minutes: 0,
            },
            ..Default::default()
        };
        let now = utc(2024, 1, 15, 14, 0);

        let updated_early = utc(2024, 1, 15, 8, 0);
        assert!(should_reset(
            &scope,
            "slack",
            ConvType::Dm,
            updated_early,
            updated_early,
            now
        ));

        let updated_late = utc(2024, 1, 15, 10, 0);
        assert!(!should_reset(
            &scope,
            "slack",
            ConvType::Dm,
            updated_late,
            updated_late,
            now
        ));
    }

    #[test]
    fn boundary_exact_hour_does_not_reset() {
        let scope = ScopeConfig {
            reset: ResetConfig {
                mode: ResetMode::Daily,
                at_hour: 9,
                idle_minutes: 0,
            },
            ..Default::default()
        };
        let boundary = utc(2024, 1, 15, 9, 0);
        assert!(!should_reset(
            &scope, "slack", ConvType::Dm, boundary, boundary, boundary
        ));
    }

    #[test]
    fn never_mode_never_resets() {
        let scope = ScopeConfig::default();
        let t = utc(2020, 1, 1, 0, 0);
        assert!(!should_reset(&scope, "x", ConvType::Dm, t, t, utc(2030, 1, 1, 0, 0)));
    }

    #[test]
    fn idle_minutes_zero_or_negative_never_resets() {
        let scope = ScopeConfig {
            reset: ResetConfig {
                mode: ResetMode::Idle,
                at_hour: 0,
                idle_minutes: 0,
            },
            ..Default::default()
        };
        let t = utc(2024, 1, 1, 0, 0);
        assert!(!should_reset(&scope, "x", ConvType::Dm, t, t, utc(2024, 5, 1, 0, 0)));
    }

    #[test]
    fn daily_boundary_survives_dst_spring_forward_gap() {
        // America/New_York jumps from 02:00 to 03:00 on 2024-03-10; "02:00"
        // that day doesn't exist as a local time. This must not panic.
        let scope = ScopeConfig {
            reset: ResetConfig { mode: ResetMode::Daily, at_hour: 2, idle_minutes: 0 },
            timezone: "America/New_York".to_string(),
            ..Default::default()
        };
        let last = utc(2024, 3, 9, 12, 0);
        let now = utc(2024, 3, 10, 12, 0);
        let _ = should_reset(&scope, "slack", ConvType::Dm, last, last, now);

        let next = next_reset_time(&scope, "slack", ConvType::Dm, now);
        assert!(next.is_some());
    }

    #[test]
    fn precedence_channel_over_type_over_default() {
        let mut scope = ScopeConfig::default();
        scope.reset_by_type.insert(
            "dm".to_string(),
            ResetConfig {
                mode: ResetMode::Idle,
                at_hour: 0,
                idle_minutes: 5,
            },
        );
        scope.reset_by_channel.insert(
            "slack".to_string(),
            ResetConfig {
                mode: ResetMode::Never,
                at_hour: 0,
                idle_minutes: 0,
            },
        );
        let cfg = effective_reset_config(&scope, "slack", ConvType::Dm);
        assert_eq!(cfg.mode, ResetMode::Never);
        let cfg2 = effective_reset_config(&scope, "telegram", ConvType::Dm);
        assert_eq!(cfg2.mode, ResetMode::Idle);
    }
}
