//! Pure time arithmetic: elapsed-time labels, prompt time context, and the
//! Poisson approximation used to backfill proactive contacts after an
//! offline gap.

use chrono::{DateTime, Datelike, Local, Timelike, Utc, Weekday};
use rand::Rng;

use crate::persona::{Message, ProactivePolicy, Role};

const MINUTE_MS: i64 = 60 * 1000;
const HOUR_MS: i64 = 60 * MINUTE_MS;
const DAY_MS: i64 = 24 * HOUR_MS;

/// Coarse human label for an elapsed duration, rounding down.
pub fn elapsed_label(ms: i64) -> String {
    if ms < MINUTE_MS {
        return "just now".to_string();
    }
    let minutes = ms / MINUTE_MS;
    let hours = ms / HOUR_MS;
    let days = ms / DAY_MS;

    if days > 0 {
        let rem_hours = hours % 24;
        if rem_hours > 0 {
            format!("{}d {}h", days, rem_hours)
        } else {
            format!("{}d", days)
        }
    } else if hours > 0 {
        let rem_minutes = minutes % 60;
        if rem_minutes > 0 {
            format!("{}h {}m", hours, rem_minutes)
        } else {
            format!("{}h", hours)
        }
    } else {
        format!("{}m", minutes)
    }
}

/// Display label for a message timestamp relative to `now`: bare HH:MM today,
/// "yesterday HH:MM", weekday within a week, MM/DD beyond that.
pub fn message_time_label(ts: DateTime<Utc>, now: DateTime<Utc>) -> String {
    let local = ts.with_timezone(&Local);
    let hhmm = format!("{:02}:{:02}", local.hour(), local.minute());
    let diff_days = (now - ts).num_days();

    if diff_days <= 0 {
        hhmm
    } else if diff_days == 1 {
        format!("yesterday {}", hhmm)
    } else if diff_days < 7 {
        format!("{} {}", weekday_label(local.weekday()), hhmm)
    } else {
        format!("{:02}/{:02} {}", local.month(), local.day(), hhmm)
    }
}

fn weekday_label(day: Weekday) -> &'static str {
    match day {
        Weekday::Mon => "Monday",
        Weekday::Tue => "Tuesday",
        Weekday::Wed => "Wednesday",
        Weekday::Thu => "Thursday",
        Weekday::Fri => "Friday",
        Weekday::Sat => "Saturday",
        Weekday::Sun => "Sunday",
    }
}

/// Day-period bucket for prompt context.
pub fn day_period(hour: u32) -> &'static str {
    match hour {
        5..=11 => "morning",
        12..=13 => "midday",
        14..=17 => "afternoon",
        18..=21 => "evening",
        _ => "late night",
    }
}

/// Elapsed-time framing handed to the generation prompt.
#[derive(Debug, Clone)]
pub struct TimeContext {
    pub first_contact: bool,
    pub context: String,
}

/// Scan the log backward for the latest assistant and user messages and
/// describe the gaps: how long since the persona last spoke, and how long the
/// user made it wait (only when the user replied after the assistant).
pub fn build_time_context(log: &[Message], as_of: DateTime<Utc>) -> TimeContext {
    if log.is_empty() {
        return TimeContext {
            first_contact: true,
            context: "This is the first time the other side has reached you.".to_string(),
        };
    }

    let mut last_assistant: Option<&Message> = None;
    let mut last_user: Option<&Message> = None;
    for msg in log.iter().rev() {
        match msg.role {
            Role::Assistant if last_assistant.is_none() => last_assistant = Some(msg),
            Role::User if last_user.is_none() => last_user = Some(msg),
            _ => {}
        }
        if last_assistant.is_some() && last_user.is_some() {
            break;
        }
    }

    let mut context = String::new();
    if let Some(assistant) = last_assistant {
        let elapsed = (as_of - assistant.timestamp).num_milliseconds();
        context.push_str(&format!(
            "You last sent a message at {} ({} ago)\n",
            message_time_label(assistant.timestamp, as_of),
            elapsed_label(elapsed),
        ));

        if let Some(user) = last_user {
            if user.timestamp > assistant.timestamp {
                let waited = (user.timestamp - assistant.timestamp).num_milliseconds();
                context.push_str(&format!(
                    "They replied at {}\nThey made you wait: {}\n",
                    message_time_label(user.timestamp, as_of),
                    elapsed_label(waited),
                ));
            }
        }
    }

    let local = as_of.with_timezone(&Local);
    context.push_str(&format!(
        "Your local time is now: {} {:02}/{:02}, {} ({:02}:{:02})",
        weekday_label(local.weekday()),
        local.month(),
        local.day(),
        day_period(local.hour()),
        local.hour(),
        local.minute(),
    ));

    TimeContext {
        first_contact: false,
        context,
    }
}

/// Estimate the proactive contacts that would have fired during an offline
/// gap.
///
/// The live process is one Bernoulli draw per heartbeat tick. Replaying that
/// per tick is O(gap / interval), which is unusable for multi-day gaps at
/// sub-minute intervals, so the count of successes is modeled as a single
/// Poisson variable with mean `missed_ticks * base_chance` and each success
/// gets a uniform position in the gap plus a uniform reply delay. Events that
/// land in the future are discarded; the rest come back sorted ascending.
///
/// This is an approximation of the tick-by-tick process, not an exact replay;
/// no timestamp it produces is ever fed back into it.
pub fn compute_offline_contacts(
    last_heartbeat: DateTime<Utc>,
    now: DateTime<Utc>,
    policy: &ProactivePolicy,
) -> Vec<DateTime<Utc>> {
    if !policy.enabled || policy.heartbeat_secs == 0 || policy.base_chance <= 0.0 {
        return Vec::new();
    }
    let gap_ms = (now - last_heartbeat).num_milliseconds();
    let interval_ms = policy.heartbeat_secs as i64 * 1000;
    let missed_ticks = gap_ms / interval_ms;
    if missed_ticks <= 0 {
        return Vec::new();
    }

    let mean = missed_ticks as f64 * policy.base_chance;
    let mut rng = rand::thread_rng();
    let count = sample_poisson(&mut rng, mean);

    let delay = policy.reply_delay_secs;
    // Imported documents may carry an inverted range; clamp instead of
    // letting gen_range panic.
    let delay_max = delay.max.max(delay.min);
    let mut contacts = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let offset_ms = rng.gen_range(0..gap_ms);
        let delay_secs = rng.gen_range(delay.min..=delay_max);
        let ts = last_heartbeat
            + chrono::Duration::milliseconds(offset_ms)
            + chrono::Duration::seconds(delay_secs as i64);
        if ts < now {
            contacts.push(ts);
        }
    }
    contacts.sort();
    contacts
}

/// Poisson sample: Knuth's product method for small means, a clamped normal
/// approximation (Box-Muller) once the mean is large enough that the product
/// method underflows or crawls.
fn sample_poisson<R: Rng>(rng: &mut R, mean: f64) -> u64 {
    if mean <= 0.0 {
        return 0;
    }
    if mean < 30.0 {
        let limit = (-mean).exp();
        let mut k: u64 = 0;
        let mut product: f64 = 1.0;
        loop {
            product *= rng.gen::<f64>();
            if product <= limit {
                return k;
            }
            k += 1;
        }
    }

    let u1: f64 = rng.gen::<f64>().max(f64::MIN_POSITIVE);
    let u2: f64 = rng.gen();
    let z = (-2.0 * u1.ln()).sqrt() * (std::f64::consts::TAU * u2).cos();
    let sample = mean + mean.sqrt() * z;
    if sample < 0.0 {
        0
    } else {
        sample.round() as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persona::DelayRange;

    #[test]
    fn elapsed_labels_round_down() {
        assert_eq!(elapsed_label(30 * 1000), "just now");
        assert_eq!(elapsed_label(5 * MINUTE_MS), "5m");
        assert_eq!(elapsed_label(2 * HOUR_MS + 15 * MINUTE_MS), "2h 15m");
        assert_eq!(elapsed_label(3 * HOUR_MS), "3h");
        assert_eq!(elapsed_label(2 * DAY_MS + 5 * HOUR_MS), "2d 5h");
        assert_eq!(elapsed_label(DAY_MS), "1d");
    }

    #[test]
    fn empty_log_is_first_contact() {
        let ctx = build_time_context(&[], Utc::now());
        assert!(ctx.first_contact);
    }

    #[test]
    fn context_reports_how_long_the_user_made_the_persona_wait() {
        let now = Utc::now();
        let log = vec![
            Message::assistant("hey", now - chrono::Duration::hours(3), false),
            Message::user("sorry, was out", now - chrono::Duration::minutes(10)),
        ];
        let ctx = build_time_context(&log, now);
        assert!(!ctx.first_contact);
        assert!(ctx.context.contains("You last sent a message"));
        assert!(ctx.context.contains("made you wait: 2h 50m"));
    }

    #[test]
    fn no_wait_line_when_user_has_not_replied() {
        let now = Utc::now();
        let log = vec![
            Message::user("hi", now - chrono::Duration::hours(2)),
            Message::assistant("hello", now - chrono::Duration::hours(1), false),
        ];
        let ctx = build_time_context(&log, now);
        assert!(!ctx.context.contains("made you wait"));
    }

    fn test_policy() -> ProactivePolicy {
        ProactivePolicy {
            enabled: true,
            base_chance: 0.1,
            heartbeat_secs: 60,
            reply_delay_secs: DelayRange { min: 0, max: 10 },
        }
    }

    #[test]
    fn backfill_mean_matches_missed_ticks_times_chance() {
        // 3600s gap at 60s heartbeat = 60 missed ticks, mean 6.0.
        let policy = test_policy();
        let now = Utc::now();
        let last = now - chrono::Duration::seconds(3600);

        let trials = 1000;
        let total: usize = (0..trials)
            .map(|_| compute_offline_contacts(last, now, &policy).len())
            .sum();
        let avg = total as f64 / trials as f64;
        // Std dev per trial is sqrt(6) ~ 2.45, so the mean of 1000 trials
        // lands within +-0.5 of 6.0 with overwhelming probability.
        assert!((5.3..6.7).contains(&avg), "average was {}", avg);
    }

    #[test]
    fn backfill_cost_is_independent_of_gap_size() {
        // 10_000 missed ticks: the normal-approximation branch. The call must
        // not iterate per tick; the sample count stays near the mean.
        let policy = test_policy();
        let now = Utc::now();
        let last = now - chrono::Duration::seconds(10_000 * 60);
        let contacts = compute_offline_contacts(last, now, &policy);
        let count = contacts.len() as f64;
        // mean 1000, sigma ~31.6; 200 is > 6 sigma.
        assert!((800.0..1200.0).contains(&count), "count was {}", count);
    }

    #[test]
    fn backfill_output_is_sorted_and_in_the_past() {
        let policy = test_policy();
        let now = Utc::now();
        let last = now - chrono::Duration::hours(6);
        let contacts = compute_offline_contacts(last, now, &policy);
        for pair in contacts.windows(2) {
            assert!(pair[0] <= pair[1]);
        }
        for ts in &contacts {
            assert!(*ts < now);
            assert!(*ts >= last);
        }
    }

    #[test]
    fn backfill_is_empty_for_disabled_policy_or_tiny_gap() {
        let mut policy = test_policy();
        let now = Utc::now();
        assert!(
            compute_offline_contacts(now - chrono::Duration::seconds(30), now, &policy).is_empty()
        );
        policy.enabled = false;
        assert!(
            compute_offline_contacts(now - chrono::Duration::hours(10), now, &policy).is_empty()
        );
    }

    #[test]
    fn backfill_tolerates_inverted_delay_range() {
        // An imported document can carry min > max; the range clamps rather
        // than panicking.
        let mut policy = test_policy();
        policy.base_chance = 1.0;
        policy.reply_delay_secs = DelayRange { min: 10, max: 0 };
        let now = Utc::now();
        let last = now - chrono::Duration::hours(2);
        let contacts = compute_offline_contacts(last, now, &policy);
        for ts in &contacts {
            assert!(*ts < now);
        }
    }

    #[test]
    fn poisson_sampler_tracks_mean_in_both_regimes() {
        let mut rng = rand::thread_rng();
        for &mean in &[2.0_f64, 12.0, 80.0] {
            let trials = 2000;
            let total: u64 = (0..trials).map(|_| sample_poisson(&mut rng, mean)).sum();
            let avg = total as f64 / trials as f64;
            let tolerance = 4.0 * (mean / trials as f64).sqrt();
            assert!(
                (avg - mean).abs() < tolerance.max(0.5),
                "mean {} sampled {}",
                mean,
                avg
            );
        }
    }
}
