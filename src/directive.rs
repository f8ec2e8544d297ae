//! Parsing of scheduling directives out of model output.
//!
//! Three encodings, in strict precedence order:
//!  1. Structured tool calls returned alongside the text. If the reply carries
//!     any tool calls at all, inline tags in the text are ignored.
//!  2. Compact inline tags: `<nc:30m:reason>`, `<st:busy:2h|noreply>`,
//!     `<sch:add:gym:18:00-19:30|chance:0.3>`.
//!  3. A legacy fenced ```json block with `nextContact` / `status` keys.
//!
//! Whatever the encoding, the directive syntax is stripped from the text
//! before it is shown or persisted.

use regex_lite::Regex;
use serde_json::Value;
use std::sync::OnceLock;
use std::time::Duration;

use crate::generate::ToolInvocation;

/// Fallback delay for a next-contact directive that carries no intelligible
/// time.
pub const DEFAULT_NEXT_CONTACT: Duration = Duration::from_secs(30 * 60);

#[derive(Debug, Clone, PartialEq)]
pub enum Directive {
    /// Schedule the next proactive contact `after` from now.
    NextContact {
        after: Duration,
        reason: Option<String>,
        persistent: bool,
    },
    /// Explicitly cancel any committed contact (legacy `nextContact: null`).
    CancelContact,
    SetStatus(StatusDirective),
    ClearStatus,
    Schedule(ScheduleDirective),
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct StatusDirective {
    pub label: String,
    pub reason: Option<String>,
    pub duration: Option<Duration>,
    pub noreply: bool,
    /// Reply delay override range in seconds.
    pub delay_secs: Option<(u64, u64)>,
    pub chance: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScheduleAction {
    Add,
    Set,
    Remove,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ScheduleDirective {
    pub action: ScheduleAction,
    pub label: String,
    pub start: Option<String>,
    pub end: Option<String>,
    pub noreply: bool,
    pub chance: Option<f64>,
}

/// Parsed model reply: the visible text with directive syntax removed, plus
/// every directive found.
#[derive(Debug, Clone)]
pub struct ParsedReply {
    pub text: String,
    pub directives: Vec<Directive>,
}

pub fn parse_reply(text: &str, tool_calls: &[ToolInvocation]) -> ParsedReply {
    let mut directives = Vec::new();

    if !tool_calls.is_empty() {
        for call in tool_calls {
            match parse_tool_call(call) {
                Some(d) => directives.push(d),
                None => tracing::warn!("Ignoring unrecognized tool call '{}'", call.name),
            }
        }
    } else {
        directives = parse_inline_tags(text);
        if directives.is_empty() {
            directives = parse_legacy_json(text);
        }
    }

    ParsedReply {
        text: strip_directives(text),
        directives,
    }
}

fn unit_duration(amount: f64, unit: &str) -> Option<Duration> {
    let secs = match unit {
        "s" | "seconds" => amount,
        "m" | "minutes" => amount * 60.0,
        "h" | "hours" => amount * 3600.0,
        _ => return None,
    };
    if secs.is_finite() && secs >= 0.0 {
        Some(Duration::from_secs_f64(secs))
    } else {
        None
    }
}

// ---- encoding B: tool calls ----

fn parse_tool_call(call: &ToolInvocation) -> Option<Directive> {
    let args = &call.arguments;
    match call.name.as_str() {
        "set_next_contact" => {
            let amount = args.get("time")?.as_f64()?;
            let unit = args.get("unit")?.as_str()?;
            Some(Directive::NextContact {
                after: unit_duration(amount, unit)?,
                reason: args
                    .get("reason")
                    .and_then(Value::as_str)
                    .map(str::to_string),
                persistent: args
                    .get("persistent")
                    .and_then(Value::as_bool)
                    .unwrap_or(false),
            })
        }
        "set_status" => match args.get("action").and_then(Value::as_str) {
            Some("clear") => Some(Directive::ClearStatus),
            Some("set") => {
                let duration = args.get("duration").and_then(|d| {
                    unit_duration(d.get("time")?.as_f64()?, d.get("unit")?.as_str()?)
                });
                let delay_secs = args.get("delay").and_then(|d| {
                    Some((d.get("min")?.as_u64()?, d.get("max")?.as_u64()?))
                });
                Some(Directive::SetStatus(StatusDirective {
                    label: args.get("label")?.as_str()?.to_string(),
                    reason: args
                        .get("reason")
                        .and_then(Value::as_str)
                        .map(str::to_string),
                    duration,
                    noreply: args
                        .get("noreply")
                        .and_then(Value::as_bool)
                        .unwrap_or(false),
                    delay_secs,
                    chance: args.get("chance").and_then(Value::as_f64),
                }))
            }
            _ => None,
        },
        "modify_schedule" => {
            let action = match args.get("action").and_then(Value::as_str)? {
                "add" => ScheduleAction::Add,
                "set" => ScheduleAction::Set,
                "remove" => ScheduleAction::Remove,
                _ => return None,
            };
            Some(Directive::Schedule(ScheduleDirective {
                action,
                label: args.get("label")?.as_str()?.to_string(),
                start: args
                    .get("start")
                    .and_then(Value::as_str)
                    .map(str::to_string),
                end: args.get("end").and_then(Value::as_str).map(str::to_string),
                noreply: args
                    .get("noreply")
                    .and_then(Value::as_bool)
                    .unwrap_or(false),
                chance: args.get("chance").and_then(Value::as_f64),
            }))
        }
        _ => None,
    }
}

// ---- encoding A: inline tags ----

fn nc_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"<nc(!?):(\d+(?:\.\d+)?)([smh])(?::([^>]*))?>").unwrap()
    })
}

fn st_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"<st:([^>:|]+)(?::(\d+(?:\.\d+)?)([smh]))?((?:\|[^>|]+)*)>").unwrap())
}

fn sch_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"<sch:(add|set|remove):([^>:|]+)(?::(\d{1,2}:\d{2})-(\d{1,2}:\d{2}))?((?:\|[^>|]+)*)>",
        )
        .unwrap()
    })
}

fn json_fence_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?s)```json\s*(\{.*?\})\s*```").unwrap())
}

fn parse_inline_tags(text: &str) -> Vec<Directive> {
    let mut directives = Vec::new();

    for caps in nc_regex().captures_iter(text) {
        let persistent = &caps[1] == "!";
        let amount: f64 = match caps[2].parse() {
            Ok(v) => v,
            Err(_) => continue,
        };
        let Some(after) = unit_duration(amount, &caps[3]) else {
            continue;
        };
        let reason = caps
            .get(4)
            .map(|m| m.as_str().trim().to_string())
            .filter(|s| !s.is_empty());
        directives.push(Directive::NextContact {
            after,
            reason,
            persistent,
        });
    }

    for caps in st_regex().captures_iter(text) {
        let label = caps[1].trim().to_string();
        if label.eq_ignore_ascii_case("clear") {
            directives.push(Directive::ClearStatus);
            continue;
        }
        let duration = match (caps.get(2), caps.get(3)) {
            (Some(amount), Some(unit)) => amount
                .as_str()
                .parse::<f64>()
                .ok()
                .and_then(|v| unit_duration(v, unit.as_str())),
            _ => None,
        };
        let mut directive = StatusDirective {
            label,
            duration,
            ..StatusDirective::default()
        };
        if let Some(options) = caps.get(4) {
            apply_tag_options(options.as_str(), &mut directive);
        }
        directives.push(Directive::SetStatus(directive));
    }

    for caps in sch_regex().captures_iter(text) {
        let action = match &caps[1] {
            "add" => ScheduleAction::Add,
            "set" => ScheduleAction::Set,
            _ => ScheduleAction::Remove,
        };
        let mut noreply = false;
        let mut chance = None;
        if let Some(options) = caps.get(5) {
            for opt in options.as_str().split('|').filter(|s| !s.is_empty()) {
                match opt.trim() {
                    "noreply" => noreply = true,
                    other => {
                        if let Some(value) = other.strip_prefix("chance:") {
                            chance = value.trim().parse().ok();
                        }
                    }
                }
            }
        }
        directives.push(Directive::Schedule(ScheduleDirective {
            action,
            label: caps[2].trim().to_string(),
            start: caps.get(3).map(|m| m.as_str().to_string()),
            end: caps.get(4).map(|m| m.as_str().to_string()),
            noreply,
            chance,
        }));
    }

    directives
}

/// Status tag option list: `|noreply`, `|delay:2-10`, `|chance:0.5`.
fn apply_tag_options(options: &str, directive: &mut StatusDirective) {
    for opt in options.split('|').filter(|s| !s.is_empty()) {
        let opt = opt.trim();
        if opt == "noreply" {
            directive.noreply = true;
        } else if let Some(value) = opt.strip_prefix("delay:") {
            if let Some((min, max)) = value.split_once('-') {
                if let (Ok(min), Ok(max)) = (min.trim().parse(), max.trim().parse()) {
                    directive.delay_secs = Some((min, max));
                }
            }
        } else if let Some(value) = opt.strip_prefix("chance:") {
            directive.chance = value.trim().parse().ok();
        } else if let Some(value) = opt.strip_prefix("reason:") {
            directive.reason = Some(value.trim().to_string());
        }
    }
}

// ---- encoding C: legacy fenced json ----

fn parse_legacy_json(text: &str) -> Vec<Directive> {
    let Some(caps) = json_fence_regex().captures(text) else {
        return Vec::new();
    };
    let Ok(value) = serde_json::from_str::<Value>(&caps[1]) else {
        tracing::debug!("Fenced json block did not parse, ignoring");
        return Vec::new();
    };

    let mut directives = Vec::new();

    if let Some(next) = value.get("nextContact") {
        match legacy_next_contact(next) {
            Some(Some(after)) => directives.push(Directive::NextContact {
                after,
                reason: next
                    .get("reason")
                    .and_then(Value::as_str)
                    .map(str::to_string),
                persistent: next
                    .get("persistent")
                    .and_then(Value::as_bool)
                    .unwrap_or(false),
            }),
            Some(None) => directives.push(Directive::CancelContact),
            None => {}
        }
    }

    if let Some(status) = value.get("status") {
        if status
            .get("clear")
            .and_then(Value::as_bool)
            .unwrap_or(false)
        {
            directives.push(Directive::ClearStatus);
        } else if let Some(set) = status.get("set") {
            if let Some(label) = set.get("label").and_then(Value::as_str) {
                let duration = set
                    .get("durationMinutes")
                    .and_then(Value::as_f64)
                    .and_then(|m| unit_duration(m, "minutes"));
                let delay_secs = set.get("delaySeconds").and_then(|d| {
                    Some((d.get("min")?.as_u64()?, d.get("max")?.as_u64()?))
                });
                directives.push(Directive::SetStatus(StatusDirective {
                    label: label.to_string(),
                    reason: set
                        .get("reason")
                        .and_then(Value::as_str)
                        .map(str::to_string),
                    duration,
                    noreply: set
                        .get("noreply")
                        .and_then(Value::as_bool)
                        .unwrap_or(false),
                    delay_secs,
                    chance: set.get("chance").and_then(Value::as_f64),
                }));
            }
        }
    }

    directives
}

/// Legacy `nextContact` shapes:
///   null                     -> cancel (Some(None))
///   42                       -> 42 minutes
///   {"time": 5, "unit": "h"} -> five hours
///   {"minutes": 90}          -> ninety minutes
///   {"hours": 2}             -> two hours
/// A present but unintelligible value falls back to the documented default
/// rather than silently zero.
fn legacy_next_contact(value: &Value) -> Option<Option<Duration>> {
    if value.is_null() {
        return Some(None);
    }
    if let Some(minutes) = value.as_f64() {
        return unit_duration(minutes, "minutes").map(Some);
    }
    if let (Some(time), Some(unit)) = (
        value.get("time").and_then(Value::as_f64),
        value.get("unit").and_then(Value::as_str),
    ) {
        return unit_duration(time, unit).map(Some);
    }
    if let Some(minutes) = value.get("minutes").and_then(Value::as_f64) {
        return unit_duration(minutes, "minutes").map(Some);
    }
    if let Some(hours) = value.get("hours").and_then(Value::as_f64) {
        return unit_duration(hours, "hours").map(Some);
    }
    Some(Some(DEFAULT_NEXT_CONTACT))
}

/// Remove all directive syntax from the text. Idempotent; collapses the
/// whitespace the removal leaves behind.
pub fn strip_directives(text: &str) -> String {
    let mut out = nc_regex().replace_all(text, "").into_owned();
    out = st_regex().replace_all(&out, "").into_owned();
    out = sch_regex().replace_all(&out, "").into_owned();
    out = json_fence_regex().replace_all(&out, "").into_owned();

    let mut cleaned = String::with_capacity(out.len());
    let mut blank_run = 0;
    for line in out.lines() {
        if line.trim().is_empty() {
            blank_run += 1;
            if blank_run > 1 {
                continue;
            }
        } else {
            blank_run = 0;
        }
        cleaned.push_str(line.trim_end());
        cleaned.push('\n');
    }
    cleaned.trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn parse(text: &str) -> ParsedReply {
        parse_reply(text, &[])
    }

    #[test]
    fn compact_next_contact_tag() {
        let reply = parse("see you soon! <nc:5m:test>");
        assert_eq!(reply.text, "see you soon!");
        assert_eq!(
            reply.directives,
            vec![Directive::NextContact {
                after: Duration::from_secs(300),
                reason: Some("test".to_string()),
                persistent: false,
            }]
        );
    }

    #[test]
    fn persistent_tag_and_unit_variants() {
        let reply = parse("<nc!:2h:wake you up>");
        assert_eq!(
            reply.directives,
            vec![Directive::NextContact {
                after: Duration::from_secs(7200),
                reason: Some("wake you up".to_string()),
                persistent: true,
            }]
        );

        let reply = parse("<nc:45s>");
        assert_eq!(
            reply.directives,
            vec![Directive::NextContact {
                after: Duration::from_secs(45),
                reason: None,
                persistent: false,
            }]
        );
    }

    #[test]
    fn status_tag_with_options() {
        let reply = parse("heading out <st:busy:1h|noreply>");
        assert_eq!(reply.text, "heading out");
        assert_eq!(
            reply.directives,
            vec![Directive::SetStatus(StatusDirective {
                label: "busy".to_string(),
                duration: Some(Duration::from_secs(3600)),
                noreply: true,
                ..StatusDirective::default()
            })]
        );

        let reply = parse("<st:gaming:30m|delay:5-120|chance:0.2>");
        match &reply.directives[0] {
            Directive::SetStatus(d) => {
                assert_eq!(d.delay_secs, Some((5, 120)));
                assert_eq!(d.chance, Some(0.2));
                assert!(!d.noreply);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn status_tag_without_duration_keeps_its_options() {
        let reply = parse("ugh, meetings <st:busy|noreply>");
        assert_eq!(reply.text, "ugh, meetings");
        match &reply.directives[0] {
            Directive::SetStatus(d) => {
                assert_eq!(d.label, "busy");
                assert!(d.noreply);
                assert!(d.duration.is_none());
            }
            other => panic!("unexpected directive {:?}", other),
        }
    }

    #[test]
    fn status_clear_tag() {
        let reply = parse("I'm back! <st:clear>");
        assert_eq!(reply.directives, vec![Directive::ClearStatus]);
    }

    #[test]
    fn schedule_tags() {
        let reply = parse("<sch:add:gym:18:00-19:30|chance:0.3>");
        assert_eq!(
            reply.directives,
            vec![Directive::Schedule(ScheduleDirective {
                action: ScheduleAction::Add,
                label: "gym".to_string(),
                start: Some("18:00".to_string()),
                end: Some("19:30".to_string()),
                noreply: false,
                chance: Some(0.3),
            })]
        );

        let reply = parse("<sch:remove:gym>");
        assert_eq!(
            reply.directives,
            vec![Directive::Schedule(ScheduleDirective {
                action: ScheduleAction::Remove,
                label: "gym".to_string(),
                start: None,
                end: None,
                noreply: false,
                chance: None,
            })]
        );
    }

    #[test]
    fn multiple_tags_in_one_reply() {
        let reply = parse("gotta sleep <st:sleeping:8h|noreply> <nc:9h:morning>");
        assert_eq!(reply.directives.len(), 2);
        assert_eq!(reply.text, "gotta sleep");
    }

    #[test]
    fn tool_calls_take_precedence_over_tags() {
        let calls = vec![ToolInvocation {
            name: "set_next_contact".to_string(),
            arguments: json!({"time": 10, "unit": "m", "reason": "checking in"}),
        }];
        // The inline tag must be ignored entirely, but still stripped.
        let reply = parse_reply("ok <nc:99h>", &calls);
        assert_eq!(reply.text, "ok");
        assert_eq!(
            reply.directives,
            vec![Directive::NextContact {
                after: Duration::from_secs(600),
                reason: Some("checking in".to_string()),
                persistent: false,
            }]
        );
    }

    #[test]
    fn tool_call_status_and_schedule() {
        let calls = vec![
            ToolInvocation {
                name: "set_status".to_string(),
                arguments: json!({
                    "action": "set",
                    "label": "working",
                    "duration": {"time": 4, "unit": "h"},
                    "delay": {"min": 60, "max": 600},
                    "chance": 0.1
                }),
            },
            ToolInvocation {
                name: "modify_schedule".to_string(),
                arguments: json!({"action": "remove", "label": "gym"}),
            },
        ];
        let reply = parse_reply("on it", &calls);
        assert_eq!(reply.directives.len(), 2);
        match &reply.directives[0] {
            Directive::SetStatus(d) => {
                assert_eq!(d.label, "working");
                assert_eq!(d.duration, Some(Duration::from_secs(4 * 3600)));
                assert_eq!(d.delay_secs, Some((60, 600)));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn tool_call_clear_status() {
        let calls = vec![ToolInvocation {
            name: "set_status".to_string(),
            arguments: json!({"action": "clear"}),
        }];
        assert_eq!(
            parse_reply("done", &calls).directives,
            vec![Directive::ClearStatus]
        );
    }

    #[test]
    fn legacy_json_block() {
        let text = "talk later!\n```json\n{\"nextContact\": {\"time\": 2, \"unit\": \"hours\"}}\n```";
        let reply = parse(text);
        assert_eq!(reply.text, "talk later!");
        assert_eq!(
            reply.directives,
            vec![Directive::NextContact {
                after: Duration::from_secs(7200),
                reason: None,
                persistent: false,
            }]
        );
    }

    #[test]
    fn legacy_bare_number_means_minutes() {
        let reply = parse("```json\n{\"nextContact\": 42}\n```");
        assert_eq!(
            reply.directives,
            vec![Directive::NextContact {
                after: Duration::from_secs(42 * 60),
                reason: None,
                persistent: false,
            }]
        );
    }

    #[test]
    fn legacy_unintelligible_value_falls_back_to_default() {
        let reply = parse("```json\n{\"nextContact\": {\"soon\": true}}\n```");
        assert_eq!(
            reply.directives,
            vec![Directive::NextContact {
                after: DEFAULT_NEXT_CONTACT,
                reason: None,
                persistent: false,
            }]
        );
    }

    #[test]
    fn legacy_null_cancels() {
        let reply = parse("```json\n{\"nextContact\": null}\n```");
        assert_eq!(reply.directives, vec![Directive::CancelContact]);
    }

    #[test]
    fn legacy_minutes_hours_shapes_and_status() {
        let reply = parse("```json\n{\"nextContact\": {\"minutes\": 90}}\n```");
        assert_eq!(
            reply.directives,
            vec![Directive::NextContact {
                after: Duration::from_secs(90 * 60),
                reason: None,
                persistent: false,
            }]
        );

        let text = "```json\n{\"status\": {\"set\": {\"label\": \"afk\", \"durationMinutes\": 15}}}\n```";
        match &parse(text).directives[0] {
            Directive::SetStatus(d) => {
                assert_eq!(d.label, "afk");
                assert_eq!(d.duration, Some(Duration::from_secs(900)));
            }
            other => panic!("unexpected {:?}", other),
        }

        let reply = parse("```json\n{\"status\": {\"clear\": true}}\n```");
        assert_eq!(reply.directives, vec![Directive::ClearStatus]);
    }

    #[test]
    fn tags_beat_legacy_json_when_both_present() {
        let text = "<nc:5m>\n```json\n{\"nextContact\": 120}\n```";
        let reply = parse(text);
        assert_eq!(
            reply.directives,
            vec![Directive::NextContact {
                after: Duration::from_secs(300),
                reason: None,
                persistent: false,
            }]
        );
        assert_eq!(reply.text, "");
    }

    #[test]
    fn stripping_is_idempotent_and_collapses_blank_runs() {
        let text = "line one\n\n<st:busy:1h>\n\nline two <nc:5m>";
        let stripped = strip_directives(text);
        assert_eq!(stripped, "line one\n\nline two");
        assert_eq!(strip_directives(&stripped), stripped);
    }

    #[test]
    fn malformed_tags_are_left_alone() {
        let reply = parse("I'll be there <nc:soonish> around five");
        assert!(reply.directives.is_empty());
        assert_eq!(reply.text, "I'll be there <nc:soonish> around five");
    }

    #[test]
    fn no_directives_yields_empty_list() {
        let reply = parse("just a normal message");
        assert!(reply.directives.is_empty());
        assert_eq!(reply.text, "just a normal message");
    }
}
