//! Offline catch-up planning. When a session opens after a gap, this decides
//! which proactive contacts "happened" while nobody was watching; the session
//! then generates a message for each planned timestamp, stamped into the past.

use chrono::{DateTime, Utc};

use crate::persona::Persona;
use crate::store::slot_for_schedule;
use crate::timemath::compute_offline_contacts;

/// Timestamps at which the persona would have reached out during the gap
/// since its last live heartbeat, oldest first.
///
/// Gated the same way the live heartbeat is: personas the user has never
/// messaged stay silent. Timestamps that land inside a noreply routine slot
/// (evaluated at the historical time-of-day) are dropped, so a persona that
/// sleeps 23:00-07:00 does not message from inside that window.
pub fn plan_offline_contacts(persona: &Persona, now: DateTime<Utc>) -> Vec<DateTime<Utc>> {
    if !persona.has_user_message() {
        return Vec::new();
    }
    let Some(last_heartbeat) = persona.last_heartbeat else {
        return Vec::new();
    };

    let contacts = compute_offline_contacts(last_heartbeat, now, &persona.proactive);
    let planned: Vec<DateTime<Utc>> = contacts
        .into_iter()
        .filter(|ts| {
            !slot_for_schedule(&persona.schedule, *ts)
                .map(|slot| slot.noreply)
                .unwrap_or(false)
        })
        .collect();

    if !planned.is_empty() {
        tracing::info!(
            "Planned {} offline contact(s) for {} across {}h gap",
            planned.len(),
            persona.name,
            (now - last_heartbeat).num_hours(),
        );
    }
    planned
}
