//! Keyed document store for personas. One SQLite row per persona holding the
//! full serialized document; every mutation is load, modify, save. The engine
//! is single-threaded per session, so whole-document read-modify-write is safe
//! as long as no await point sits between the read and the write — all methods
//! here are synchronous for that reason.

use anyhow::{Context, Result};
use chrono::{DateTime, Local, Timelike, Utc};
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Mutex;
use uuid::Uuid;

use crate::persona::{
    Message, PendingContact, PendingMessage, Persona, Schedule, ScheduleSlot, Status,
    SCHEMA_VERSION,
};

pub struct PersonaStore {
    conn: Mutex<Connection>,
}

/// Full-database export bundle.
#[derive(Debug, Serialize, Deserialize)]
pub struct ExportBundle {
    pub version: u32,
    pub exported_at: DateTime<Utc>,
    pub personas: Vec<Persona>,
}

/// Single-persona export (a shareable character card).
#[derive(Debug, Serialize, Deserialize)]
pub struct PersonaCard {
    pub version: u32,
    pub kind: String,
    pub exported_at: DateTime<Utc>,
    pub persona: Persona,
}

pub const PERSONA_CARD_KIND: &str = "persona";

impl PersonaStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path.as_ref())
            .with_context(|| format!("Failed to open persona store at {:?}", path.as_ref()))?;
        Self::init(conn)
    }

    /// In-memory store, used by tests and the local echo host.
    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute(
            "CREATE TABLE IF NOT EXISTS personas (
                id TEXT PRIMARY KEY,
                doc TEXT NOT NULL
            )",
            [],
        )
        .context("Failed to create personas table")?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Connection> {
        // A poisoned lock means another thread panicked mid-write; the
        // document itself is still the last fully-written one.
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn load(&self, id: &str) -> Result<Option<Persona>> {
        let conn = self.lock();
        let mut stmt = conn.prepare("SELECT doc FROM personas WHERE id = ?1")?;
        let mut rows = stmt.query(params![id])?;
        match rows.next()? {
            Some(row) => {
                let doc: String = row.get(0)?;
                let persona = serde_json::from_str(&doc)
                    .with_context(|| format!("Corrupt persona document {}", id))?;
                Ok(Some(persona))
            }
            None => Ok(None),
        }
    }

    fn store(&self, persona: &Persona) -> Result<()> {
        let doc = serde_json::to_string(persona).context("Failed to serialize persona")?;
        self.lock().execute(
            "INSERT INTO personas (id, doc) VALUES (?1, ?2)
             ON CONFLICT(id) DO UPDATE SET doc = excluded.doc",
            params![persona.id, doc],
        )?;
        Ok(())
    }

    /// Read-modify-write on one document. Unknown ids are a silent no-op:
    /// callers in the scheduling engine check existence first, and a stale
    /// reference must not cascade into an error.
    fn update<F>(&self, id: &str, mutate: F) -> Result<()>
    where
        F: FnOnce(&mut Persona),
    {
        let Some(mut persona) = self.load(id)? else {
            return Ok(());
        };
        mutate(&mut persona);
        self.store(&persona)
    }

    // ---- persona lifecycle ----

    pub fn create(&self, persona: &Persona) -> Result<()> {
        self.store(persona)
    }

    pub fn get(&self, id: &str) -> Result<Option<Persona>> {
        self.load(id)
    }

    pub fn save(&self, persona: &Persona) -> Result<()> {
        self.store(persona)
    }

    pub fn delete(&self, id: &str) -> Result<()> {
        self.lock()
            .execute("DELETE FROM personas WHERE id = ?1", params![id])?;
        Ok(())
    }

    pub fn list(&self) -> Result<Vec<Persona>> {
        let conn = self.lock();
        let mut stmt = conn.prepare("SELECT doc FROM personas")?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        let mut personas = Vec::new();
        for doc in rows {
            match serde_json::from_str::<Persona>(&doc?) {
                Ok(p) => personas.push(p),
                Err(e) => tracing::warn!("Skipping corrupt persona document: {}", e),
            }
        }
        personas.sort_by_key(|p| std::cmp::Reverse(p.created_at));
        Ok(personas)
    }

    // ---- message log ----

    pub fn append_message(&self, id: &str, message: Message) -> Result<()> {
        self.update(id, |p| p.messages.push(message))
    }

    pub fn messages(&self, id: &str) -> Result<Vec<Message>> {
        Ok(self.load(id)?.map(|p| p.messages).unwrap_or_default())
    }

    pub fn set_message_failed(&self, id: &str, message_id: &str, failed: bool) -> Result<()> {
        self.update(id, |p| {
            if let Some(msg) = p.messages.iter_mut().find(|m| m.id == message_id) {
                msg.failed = failed;
            }
        })
    }

    pub fn delete_message(&self, id: &str, message_id: &str) -> Result<()> {
        self.update(id, |p| p.messages.retain(|m| m.id != message_id))
    }

    // ---- status ----

    /// Active status, applying lazy expiry: an expired status is cleared on
    /// read and reported as absent rather than returned stale.
    pub fn status(&self, id: &str) -> Result<Option<Status>> {
        let Some(mut persona) = self.load(id)? else {
            return Ok(None);
        };
        match &persona.status {
            Some(status) if status.is_expired(Utc::now()) => {
                tracing::debug!("Status '{}' expired for {}, clearing", status.label, id);
                persona.status = None;
                self.store(&persona)?;
                Ok(None)
            }
            other => Ok(other.clone()),
        }
    }

    pub fn set_status(&self, id: &str, status: Status) -> Result<()> {
        self.update(id, |p| p.status = Some(status))
    }

    pub fn clear_status(&self, id: &str) -> Result<()> {
        self.update(id, |p| p.status = None)
    }

    // ---- schedule ----

    pub fn schedule(&self, id: &str) -> Result<Option<Schedule>> {
        Ok(self.load(id)?.map(|p| p.schedule))
    }

    pub fn set_schedule(&self, id: &str, schedule: Schedule) -> Result<()> {
        self.update(id, |p| p.schedule = schedule)
    }

    /// The slot covering the local time-of-day of `at`, if any.
    pub fn slot_at(&self, id: &str, at: DateTime<Utc>) -> Result<Option<ScheduleSlot>> {
        let Some(persona) = self.load(id)? else {
            return Ok(None);
        };
        Ok(slot_for_schedule(&persona.schedule, at).cloned())
    }

    // ---- pending contact ----

    pub fn pending_contact(&self, id: &str) -> Result<Option<PendingContact>> {
        Ok(self.load(id)?.and_then(|p| p.pending_contact))
    }

    pub fn set_pending_contact(&self, id: &str, contact: PendingContact) -> Result<()> {
        self.update(id, |p| p.pending_contact = Some(contact))
    }

    pub fn clear_pending_contact(&self, id: &str) -> Result<()> {
        self.update(id, |p| p.pending_contact = None)
    }

    // ---- pending message queue ----

    pub fn push_pending_message(&self, id: &str, message: PendingMessage) -> Result<()> {
        self.update(id, |p| p.pending_queue.push(message))
    }

    /// Remove and return all queued messages in arrival order.
    pub fn drain_pending_messages(&self, id: &str) -> Result<Vec<PendingMessage>> {
        let Some(mut persona) = self.load(id)? else {
            return Ok(Vec::new());
        };
        let drained = std::mem::take(&mut persona.pending_queue);
        if !drained.is_empty() {
            self.store(&persona)?;
        }
        Ok(drained)
    }

    /// Queue contents without draining, for "are we still silenced" checks.
    pub fn peek_pending_messages(&self, id: &str) -> Result<Vec<PendingMessage>> {
        Ok(self.load(id)?.map(|p| p.pending_queue).unwrap_or_default())
    }

    // ---- timestamps ----

    pub fn stamp_last_visit(&self, id: &str, at: DateTime<Utc>) -> Result<()> {
        self.update(id, |p| p.last_visit = Some(at))
    }

    pub fn stamp_last_heartbeat(&self, id: &str, at: DateTime<Utc>) -> Result<()> {
        self.update(id, |p| p.last_heartbeat = Some(at))
    }

    // ---- export / import ----

    pub fn export_all(&self) -> Result<ExportBundle> {
        Ok(ExportBundle {
            version: SCHEMA_VERSION,
            exported_at: Utc::now(),
            personas: self.list()?,
        })
    }

    /// Restore a full bundle. Version mismatch aborts before any write; the
    /// writes themselves run in one transaction so a failure leaves the store
    /// untouched.
    pub fn import_all(&self, bundle: &ExportBundle) -> Result<()> {
        if bundle.version != SCHEMA_VERSION {
            anyhow::bail!(
                "Unsupported backup version {} (expected {})",
                bundle.version,
                SCHEMA_VERSION
            );
        }
        let mut conn = self.lock();
        let tx = conn.transaction()?;
        for persona in &bundle.personas {
            let doc = serde_json::to_string(persona).context("Failed to serialize persona")?;
            tx.execute(
                "INSERT INTO personas (id, doc) VALUES (?1, ?2)
                 ON CONFLICT(id) DO UPDATE SET doc = excluded.doc",
                params![persona.id, doc],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    pub fn export_persona(&self, id: &str) -> Result<Option<PersonaCard>> {
        Ok(self.load(id)?.map(|persona| PersonaCard {
            version: SCHEMA_VERSION,
            kind: PERSONA_CARD_KIND.to_string(),
            exported_at: Utc::now(),
            persona,
        }))
    }

    /// Import a shared persona card under a fresh id so it never collides
    /// with an existing persona.
    pub fn import_persona(&self, card: &PersonaCard) -> Result<Persona> {
        if card.version != SCHEMA_VERSION || card.kind != PERSONA_CARD_KIND {
            anyhow::bail!("Not a valid persona card (version {})", card.version);
        }
        let mut persona = card.persona.clone();
        persona.id = format!("char_{}", Uuid::new_v4());
        self.store(&persona)?;
        Ok(persona)
    }
}

/// Slot lookup against a schedule at the local time-of-day of `at`. The
/// schedule is a time-of-day pattern, not a calendar, so this is well-defined
/// for historical timestamps too (backfill filtering relies on that).
pub fn slot_for_schedule(schedule: &Schedule, at: DateTime<Utc>) -> Option<&ScheduleSlot> {
    let local = at.with_timezone(&Local);
    let minute_of_day = local.hour() * 60 + local.minute();
    schedule.slot_at(minute_of_day)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persona::Role;

    fn store_with_persona() -> (PersonaStore, String) {
        let store = PersonaStore::open_in_memory().expect("store");
        let persona = Persona::new("Aki");
        let id = persona.id.clone();
        store.create(&persona).expect("create");
        (store, id)
    }

    #[test]
    fn opens_on_disk_and_round_trips_a_document() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("riftlink.db");
        let store = PersonaStore::open(&path).expect("open");
        let persona = Persona::new("Aki");
        store.create(&persona).expect("create");
        drop(store);

        let reopened = PersonaStore::open(&path).expect("reopen");
        let loaded = reopened.get(&persona.id).expect("get").expect("present");
        assert_eq!(loaded.name, "Aki");
        assert_eq!(loaded.schedule.routine.len(), 1);
    }

    #[test]
    fn message_append_preserves_order_and_flags() {
        let (store, id) = store_with_persona();
        let now = Utc::now();
        let user = Message::user("hi", now);
        let user_id = user.id.clone();
        store.append_message(&id, user).unwrap();
        store
            .append_message(&id, Message::assistant("hey", now, false))
            .unwrap();

        let log = store.messages(&id).unwrap();
        assert_eq!(log.len(), 2);
        assert_eq!(log[0].role, Role::User);
        assert!(!log[0].failed);

        store.set_message_failed(&id, &user_id, true).unwrap();
        assert!(store.messages(&id).unwrap()[0].failed);

        store.delete_message(&id, &user_id).unwrap();
        assert_eq!(store.messages(&id).unwrap().len(), 1);
    }

    #[test]
    fn expired_status_is_cleared_lazily_on_read() {
        let (store, id) = store_with_persona();
        store
            .set_status(
                &id,
                Status {
                    label: "sleeping".to_string(),
                    reason: None,
                    ends_at: Some(Utc::now() - chrono::Duration::minutes(1)),
                    chance_multiplier: Some(0.0),
                    reply_delay_mins: None,
                    noreply: false,
                },
            )
            .unwrap();

        assert!(store.status(&id).unwrap().is_none());
        // And the stale document is actually gone, not just filtered.
        assert!(store.get(&id).unwrap().unwrap().status.is_none());
    }

    #[test]
    fn live_status_survives_reads() {
        let (store, id) = store_with_persona();
        store
            .set_status(
                &id,
                Status {
                    label: "busy".to_string(),
                    reason: Some("raid".to_string()),
                    ends_at: Some(Utc::now() + chrono::Duration::hours(1)),
                    chance_multiplier: None,
                    reply_delay_mins: Some((5.0, 20.0)),
                    noreply: false,
                },
            )
            .unwrap();
        let status = store.status(&id).unwrap().expect("still active");
        assert_eq!(status.label, "busy");
    }

    #[test]
    fn pending_queue_append_drain_peek() {
        let (store, id) = store_with_persona();
        let now = Utc::now();
        for text in ["one", "two", "three"] {
            store
                .push_pending_message(
                    &id,
                    PendingMessage {
                        content: text.to_string(),
                        timestamp: now,
                    },
                )
                .unwrap();
        }

        let peeked = store.peek_pending_messages(&id).unwrap();
        assert_eq!(peeked.len(), 3);
        assert_eq!(store.peek_pending_messages(&id).unwrap().len(), 3);

        let drained = store.drain_pending_messages(&id).unwrap();
        assert_eq!(
            drained.iter().map(|m| m.content.as_str()).collect::<Vec<_>>(),
            vec!["one", "two", "three"]
        );
        assert!(store.peek_pending_messages(&id).unwrap().is_empty());
    }

    #[test]
    fn missing_persona_operations_are_noops() {
        let store = PersonaStore::open_in_memory().unwrap();
        assert!(store.get("char_missing").unwrap().is_none());
        store
            .append_message("char_missing", Message::user("hi", Utc::now()))
            .unwrap();
        assert!(store.status("char_missing").unwrap().is_none());
        assert!(store.drain_pending_messages("char_missing").unwrap().is_empty());
        store.clear_pending_contact("char_missing").unwrap();
    }

    #[test]
    fn import_rejects_version_mismatch_without_writing() {
        let store = PersonaStore::open_in_memory().unwrap();
        let bundle = ExportBundle {
            version: 99,
            exported_at: Utc::now(),
            personas: vec![Persona::new("Ghost")],
        };
        assert!(store.import_all(&bundle).is_err());
        assert!(store.list().unwrap().is_empty());
    }

    #[test]
    fn persona_card_import_assigns_fresh_id() {
        let (store, id) = store_with_persona();
        let card = store.export_persona(&id).unwrap().expect("card");
        let imported = store.import_persona(&card).unwrap();
        assert_ne!(imported.id, id);
        assert_eq!(store.list().unwrap().len(), 2);

        let bad = PersonaCard {
            version: SCHEMA_VERSION,
            kind: "something_else".to_string(),
            exported_at: Utc::now(),
            persona: Persona::new("Nope"),
        };
        assert!(store.import_persona(&bad).is_err());
    }
}
