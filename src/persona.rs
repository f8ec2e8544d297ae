use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Version tag embedded in exported documents. Imports with a different
/// version are rejected before anything is written.
pub const SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

/// A single entry in a persona's message log. Append-only; `failed` is the
/// only field that may change after creation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub role: Role,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "is_false")]
    pub is_proactive: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    pub failed: bool,
}

fn is_false(value: &bool) -> bool {
    !*value
}

impl Message {
    pub fn user(content: impl Into<String>, at: DateTime<Utc>) -> Self {
        Self {
            id: format!("msg_{}", Uuid::new_v4()),
            role: Role::User,
            content: content.into(),
            timestamp: at,
            is_proactive: false,
            failed: false,
        }
    }

    pub fn assistant(content: impl Into<String>, at: DateTime<Utc>, proactive: bool) -> Self {
        Self {
            id: format!("msg_{}", Uuid::new_v4()),
            role: Role::Assistant,
            content: content.into(),
            timestamp: at,
            is_proactive: proactive,
            failed: false,
        }
    }
}

/// Reply-delay range in seconds, sampled uniformly per delayed send.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct DelayRange {
    pub min: u64,
    pub max: u64,
}

/// Per-persona proactive contact policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProactivePolicy {
    pub enabled: bool,
    /// Probability of initiating contact on each heartbeat tick (0.0-1.0).
    pub base_chance: f64,
    pub heartbeat_secs: u64,
    pub reply_delay_secs: DelayRange,
}

impl Default for ProactivePolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            base_chance: 0.1,
            heartbeat_secs: 600,
            reply_delay_secs: DelayRange { min: 0, max: 600 },
        }
    }
}

/// An ad-hoc, model-declared condition ("sleeping", "out scavenging"). At most
/// one per persona; expires lazily when `ends_at` passes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Status {
    pub label: String,
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(default)]
    pub ends_at: Option<DateTime<Utc>>,
    /// Multiplier on the heartbeat's base proactive chance. 0 disables,
    /// 1 is neutral, absent means unchanged.
    #[serde(default)]
    pub chance_multiplier: Option<f64>,
    /// Reply-delay override in minutes.
    #[serde(default)]
    pub reply_delay_mins: Option<(f64, f64)>,
    #[serde(default)]
    pub noreply: bool,
}

impl Status {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.ends_at.map(|ends| ends <= now).unwrap_or(false)
    }
}

/// One recurring time-of-day window in a persona's daily routine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleSlot {
    pub label: String,
    /// "HH:MM"; the window may wrap past midnight.
    pub start: String,
    pub end: String,
    #[serde(default)]
    pub noreply: bool,
    #[serde(default)]
    pub chance: Option<f64>,
}

impl ScheduleSlot {
    /// Wrap-around aware containment. Start is inclusive, end exclusive, so a
    /// 23:00-07:00 slot covers 23:30 and 06:59 but not 07:00.
    pub fn contains(&self, minute_of_day: u32) -> bool {
        let (Some(start), Some(end)) = (parse_hhmm(&self.start), parse_hhmm(&self.end)) else {
            return false;
        };
        if start <= end {
            minute_of_day >= start && minute_of_day < end
        } else {
            minute_of_day >= start || minute_of_day < end
        }
    }
}

/// Parse "HH:MM" into minutes since midnight.
pub fn parse_hhmm(value: &str) -> Option<u32> {
    let (hours, minutes) = value.trim().split_once(':')?;
    let hours: u32 = hours.parse().ok()?;
    let minutes: u32 = minutes.parse().ok()?;
    if hours > 23 || minutes > 59 {
        return None;
    }
    Some(hours * 60 + minutes)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Schedule {
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub routine: Vec<ScheduleSlot>,
}

fn default_true() -> bool {
    true
}

impl Schedule {
    /// Default routine seeded into every new persona.
    pub fn default_seed() -> Self {
        Self {
            enabled: true,
            routine: vec![ScheduleSlot {
                label: "sleeping".to_string(),
                start: "23:00".to_string(),
                end: "07:00".to_string(),
                noreply: true,
                chance: Some(0.05),
            }],
        }
    }

    /// First slot containing the given minute of day. Overlap resolution is
    /// first-match-wins; overlapping slots are a caller error.
    pub fn slot_at(&self, minute_of_day: u32) -> Option<&ScheduleSlot> {
        if !self.enabled {
            return None;
        }
        self.routine
            .iter()
            .find(|slot| slot.contains(minute_of_day))
    }
}

impl Default for Schedule {
    fn default() -> Self {
        Self::default_seed()
    }
}

/// A committed future proactive message. Non-persistent contacts are cancelled
/// the moment the user sends anything; persistent ones (reminders, wake-up
/// calls) survive user messages and only clear by firing or replacement.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingContact {
    pub send_at: DateTime<Utc>,
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(default)]
    pub persistent: bool,
}

/// A user message buffered while the persona's schedule says noreply.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingMessage {
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorldInfo {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CharacterInfo {
    #[serde(default)]
    pub background: String,
    #[serde(default)]
    pub personality: String,
    #[serde(default)]
    pub speech_style: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConnectionInfo {
    #[serde(default)]
    pub medium: String,
    #[serde(default)]
    pub medium_description: String,
    /// Shown as the persona's opening message the first time a session starts
    /// with an empty log.
    #[serde(default)]
    pub first_message: String,
}

/// The full persisted document for one conversational entity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Persona {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub avatar: String,
    #[serde(default)]
    pub tagline: String,
    #[serde(default)]
    pub world: WorldInfo,
    #[serde(default)]
    pub character: CharacterInfo,
    #[serde(default)]
    pub connection: ConnectionInfo,
    #[serde(default)]
    pub proactive: ProactivePolicy,
    #[serde(default)]
    pub schedule: Schedule,
    #[serde(default)]
    pub status: Option<Status>,
    #[serde(default)]
    pub pending_contact: Option<PendingContact>,
    #[serde(default)]
    pub messages: Vec<Message>,
    #[serde(default)]
    pub pending_queue: Vec<PendingMessage>,
    /// Last time a UI session was opened for this persona.
    #[serde(default)]
    pub last_visit: Option<DateTime<Utc>>,
    /// Last time the live heartbeat actually fired. Backfill math uses this
    /// rather than `last_visit` so a tab losing focus is distinguished from
    /// the app being fully closed.
    #[serde(default)]
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl Persona {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: format!("char_{}", Uuid::new_v4()),
            name: name.into(),
            avatar: String::new(),
            tagline: String::new(),
            world: WorldInfo::default(),
            character: CharacterInfo::default(),
            connection: ConnectionInfo::default(),
            proactive: ProactivePolicy::default(),
            schedule: Schedule::default_seed(),
            status: None,
            pending_contact: None,
            messages: Vec::new(),
            pending_queue: Vec::new(),
            last_visit: None,
            last_heartbeat: None,
            created_at: Utc::now(),
        }
    }

    /// Whether the user has ever spoken to this persona. Proactive behavior
    /// is gated on this: a persona nobody has messaged stays quiet.
    pub fn has_user_message(&self) -> bool {
        self.messages.iter().any(|m| m.role == Role::User)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sleep_slot() -> ScheduleSlot {
        ScheduleSlot {
            label: "sleeping".to_string(),
            start: "23:00".to_string(),
            end: "07:00".to_string(),
            noreply: true,
            chance: Some(0.05),
        }
    }

    #[test]
    fn wrap_around_slot_containment() {
        let slot = sleep_slot();
        assert!(slot.contains(23 * 60 + 30));
        assert!(slot.contains(2 * 60));
        assert!(slot.contains(6 * 60 + 59));
        assert!(!slot.contains(7 * 60 + 1));
        assert!(!slot.contains(22 * 60 + 59));
    }

    #[test]
    fn non_wrapping_slot_containment() {
        let slot = ScheduleSlot {
            label: "work".to_string(),
            start: "09:00".to_string(),
            end: "18:00".to_string(),
            noreply: false,
            chance: None,
        };
        assert!(slot.contains(9 * 60));
        assert!(slot.contains(12 * 60));
        assert!(!slot.contains(18 * 60));
        assert!(!slot.contains(8 * 60 + 59));
    }

    #[test]
    fn parses_hhmm_and_rejects_garbage() {
        assert_eq!(parse_hhmm("23:00"), Some(1380));
        assert_eq!(parse_hhmm("00:00"), Some(0));
        assert_eq!(parse_hhmm("7:05"), Some(425));
        assert_eq!(parse_hhmm("24:00"), None);
        assert_eq!(parse_hhmm("12:60"), None);
        assert_eq!(parse_hhmm("noon"), None);
    }

    #[test]
    fn first_matching_slot_wins() {
        let schedule = Schedule {
            enabled: true,
            routine: vec![
                ScheduleSlot {
                    label: "early".to_string(),
                    start: "08:00".to_string(),
                    end: "12:00".to_string(),
                    noreply: false,
                    chance: None,
                },
                ScheduleSlot {
                    label: "late".to_string(),
                    start: "10:00".to_string(),
                    end: "14:00".to_string(),
                    noreply: true,
                    chance: None,
                },
            ],
        };
        assert_eq!(schedule.slot_at(11 * 60).map(|s| s.label.as_str()), Some("early"));
        assert_eq!(schedule.slot_at(13 * 60).map(|s| s.label.as_str()), Some("late"));
        assert!(schedule.slot_at(15 * 60).is_none());
    }

    #[test]
    fn status_expiry_is_based_on_ends_at() {
        let now = Utc::now();
        let status = Status {
            label: "busy".to_string(),
            reason: None,
            ends_at: Some(now - chrono::Duration::seconds(1)),
            chance_multiplier: None,
            reply_delay_mins: None,
            noreply: false,
        };
        assert!(status.is_expired(now));

        let open_ended = Status {
            ends_at: None,
            ..status.clone()
        };
        assert!(!open_ended.is_expired(now));
    }

    #[test]
    fn new_persona_gets_default_sleep_seed() {
        let persona = Persona::new("Aki");
        assert_eq!(persona.schedule.routine.len(), 1);
        let slot = &persona.schedule.routine[0];
        assert_eq!(slot.label, "sleeping");
        assert_eq!(slot.start, "23:00");
        assert_eq!(slot.end, "07:00");
        assert!(slot.noreply);
        assert_eq!(slot.chance, Some(0.05));
        assert!(!persona.has_user_message());
    }
}
