//! The live session engine: one active persona at a time, driving reply
//! generation, the proactive heartbeat, committed future contacts, reply
//! delays, and the pending-message queue.
//!
//! Timer tasks are guarded by an epoch counter rather than by locks: every
//! `start`/`stop` bumps the epoch, and a task captured under an older epoch
//! returns without acting when it finally fires. The inner mutex is only ever
//! held for handle bookkeeping, never across an await.

use anyhow::{Context, Result};
use chrono::{DateTime, Local, Timelike, Utc};
use rand::Rng;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::config::EngineConfig;
use crate::backfill::plan_offline_contacts;
use crate::directive::{parse_reply, Directive, ScheduleAction, StatusDirective};
use crate::generate::{tool_schemas, ChatTurn, Generate, GenerationRequest};
use crate::persona::{Message, PendingContact, PendingMessage, Persona, ScheduleSlot, Status};
use crate::prompt::{proactive_trigger, system_prompt, DirectiveStyle};
use crate::store::{slot_for_schedule, PersonaStore};
use crate::timemath::build_time_context;

/// Notifications pushed out to whatever hosts the session (UI, REPL).
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// A new assistant message was appended outside the send/reply cycle the
    /// host initiated: proactive contact, delayed reply, queue flush.
    MessageArrived { persona_id: String },
    StatusChanged { persona_id: String },
}

/// What happened to a user message handed to `send_message`.
#[derive(Debug, Clone)]
pub enum SendOutcome {
    Replied(Message),
    /// Reply will arrive later; a `MessageArrived` event follows.
    Delayed { eta_minutes: u64 },
    /// Persona is unavailable; the message is held until the silence ends.
    Queued,
}

enum ReplyContext {
    User,
    Proactive {
        reason: Option<String>,
        as_of: DateTime<Utc>,
        backfill: bool,
    },
}

#[derive(Default)]
struct SessionInner {
    persona_id: Option<String>,
    heartbeat: Option<JoinHandle<()>>,
    scheduled_contact: Option<JoinHandle<()>>,
    recheck: Option<JoinHandle<()>>,
}

pub struct ChatSession {
    store: Arc<PersonaStore>,
    generator: Arc<dyn Generate>,
    config: EngineConfig,
    event_tx: flume::Sender<SessionEvent>,
    epoch: AtomicU64,
    inner: Mutex<SessionInner>,
}

impl ChatSession {
    pub fn new(
        store: Arc<PersonaStore>,
        generator: Arc<dyn Generate>,
        config: EngineConfig,
        event_tx: flume::Sender<SessionEvent>,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            generator,
            config,
            event_tx,
            epoch: AtomicU64::new(0),
            inner: Mutex::new(SessionInner::default()),
        })
    }

    fn lock_inner(&self) -> std::sync::MutexGuard<'_, SessionInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn active_persona(&self) -> Result<String> {
        self.lock_inner()
            .persona_id
            .clone()
            .context("No active session")
    }

    fn emit(&self, event: SessionEvent) {
        // Host may have dropped the receiver; that only means nobody is
        // listening.
        let _ = self.event_tx.send(event);
    }

    /// Open a session on a persona. Runs the full catch-up sequence: seed the
    /// opening message, backfill offline contacts, flush the held queue if the
    /// silence has ended, then arm the live timers.
    pub async fn start(self: &Arc<Self>, persona_id: &str) -> Result<()> {
        self.stop();

        let now = Utc::now();
        let mut persona = self
            .store
            .get(persona_id)?
            .with_context(|| format!("Unknown persona {}", persona_id))?;

        self.lock_inner().persona_id = Some(persona_id.to_string());

        // A fresh persona opens the conversation itself.
        if persona.messages.is_empty() && !persona.connection.first_message.is_empty() {
            let opener = Message::assistant(persona.connection.first_message.clone(), now, false);
            self.store.append_message(persona_id, opener)?;
            self.emit(SessionEvent::MessageArrived {
                persona_id: persona_id.to_string(),
            });
            persona = self
                .store
                .get(persona_id)?
                .with_context(|| format!("Unknown persona {}", persona_id))?;
        }

        // Replay what the persona "did" while the app was closed. Best
        // effort: one generation failure abandons the rest of the plan.
        for ts in plan_offline_contacts(&persona, now) {
            let result = self
                .generate_reply(
                    persona_id,
                    ReplyContext::Proactive {
                        reason: None,
                        as_of: ts,
                        backfill: true,
                    },
                )
                .await;
            if let Err(e) = result {
                tracing::warn!("Offline backfill aborted for {}: {}", persona_id, e);
                break;
            }
        }
        if persona.has_user_message() {
            self.store.stamp_last_heartbeat(persona_id, now)?;
        }

        // Messages held during a silence window that has since ended.
        if let Err(e) = self.flush_pending_queue(persona_id).await {
            tracing::warn!("Pending queue flush failed for {}: {}", persona_id, e);
        }

        let persona = self
            .store
            .get(persona_id)?
            .with_context(|| format!("Unknown persona {}", persona_id))?;
        if persona.has_user_message() {
            self.arm_heartbeat(persona_id);
        }

        match persona.pending_contact {
            Some(contact) if contact.send_at > now => {
                self.arm_contact_timer(persona_id, contact.send_at);
            }
            Some(_) => {
                // Stale commitment from a previous run; the moment passed.
                self.store.clear_pending_contact(persona_id)?;
            }
            None => {}
        }

        self.arm_recheck(persona_id);
        self.store.stamp_last_visit(persona_id, now)?;
        Ok(())
    }

    /// Tear down timers. Delayed-reply tasks are not tracked here; the epoch
    /// bump neutralizes them when they fire.
    pub fn stop(&self) {
        self.epoch.fetch_add(1, Ordering::SeqCst);
        let mut inner = self.lock_inner();
        for handle in [
            inner.heartbeat.take(),
            inner.scheduled_contact.take(),
            inner.recheck.take(),
        ]
        .into_iter()
        .flatten()
        {
            handle.abort();
        }
        inner.persona_id = None;
    }

    pub async fn send_message(self: &Arc<Self>, text: &str) -> Result<SendOutcome> {
        let persona_id = self.active_persona()?;
        let now = Utc::now();
        let persona = self
            .store
            .get(&persona_id)?
            .with_context(|| format!("Unknown persona {}", persona_id))?;
        let first_user_message = !persona.has_user_message();

        // Any user message cancels a non-persistent commitment; the persona
        // no longer needs to break the silence.
        if let Some(contact) = &persona.pending_contact {
            if !contact.persistent {
                self.store.clear_pending_contact(&persona_id)?;
                if let Some(handle) = self.lock_inner().scheduled_contact.take() {
                    handle.abort();
                }
            }
        }

        let status = self.store.status(&persona_id)?;
        if self.is_silenced(&persona, status.as_ref(), now) {
            self.store.push_pending_message(
                &persona_id,
                PendingMessage {
                    content: text.to_string(),
                    timestamp: now,
                },
            )?;
            // A held message still counts as the user speaking first: the
            // heartbeat arms now, and its ticks stay inert until the flush
            // lands the message in the log.
            if first_user_message {
                self.arm_heartbeat(&persona_id);
            }
            tracing::debug!("Message queued for {} (silenced)", persona_id);
            return Ok(SendOutcome::Queued);
        }

        // Older held messages plus this one become a single batched turn.
        let held = self.store.drain_pending_messages(&persona_id)?;
        let content = if held.is_empty() {
            text.to_string()
        } else {
            let mut batch: Vec<String> = held.iter().map(stamp_line).collect();
            batch.push(stamp_line(&PendingMessage {
                content: text.to_string(),
                timestamp: now,
            }));
            batch.join("\n")
        };

        let user_message = Message::user(content, now);
        let user_message_id = user_message.id.clone();
        self.store.append_message(&persona_id, user_message)?;

        if first_user_message {
            self.arm_heartbeat(&persona_id);
        }

        if let Some((min, max)) = status.as_ref().and_then(|s| s.reply_delay_mins) {
            let minutes = if max > min {
                rand::thread_rng().gen_range(min..=max)
            } else {
                min
            };
            self.spawn_delayed_reply(&persona_id, &user_message_id, minutes);
            return Ok(SendOutcome::Delayed {
                eta_minutes: minutes.round().max(1.0) as u64,
            });
        }

        match self.generate_reply(&persona_id, ReplyContext::User).await {
            Ok(message) => Ok(SendOutcome::Replied(message)),
            Err(e) => {
                self.store
                    .set_message_failed(&persona_id, &user_message_id, true)?;
                Err(e)
            }
        }
    }

    /// Regenerate the reply to the most recent failed user message without
    /// appending anything new.
    pub async fn retry_reply(self: &Arc<Self>) -> Result<Message> {
        let persona_id = self.active_persona()?;
        let persona = self
            .store
            .get(&persona_id)?
            .with_context(|| format!("Unknown persona {}", persona_id))?;
        let failed_id = persona
            .messages
            .iter()
            .rev()
            .find(|m| m.failed)
            .map(|m| m.id.clone())
            .context("Nothing to retry")?;

        let message = self
            .generate_reply(&persona_id, ReplyContext::User)
            .await?;
        self.store
            .set_message_failed(&persona_id, &failed_id, false)?;
        Ok(message)
    }

    /// Flush the held queue if the silence window has ended. Called on a
    /// timer and exposed for hosts that want to force a check (e.g. after a
    /// visible status change).
    pub async fn recheck_pending(self: &Arc<Self>) -> Result<()> {
        let persona_id = self.active_persona()?;
        self.flush_pending_queue(&persona_id).await
    }

    async fn flush_pending_queue(self: &Arc<Self>, persona_id: &str) -> Result<()> {
        let Some(persona) = self.store.get(persona_id)? else {
            return Ok(());
        };
        if persona.pending_queue.is_empty() {
            return Ok(());
        }
        let status = self.store.status(persona_id)?;
        if self.is_silenced(&persona, status.as_ref(), Utc::now()) {
            return Ok(());
        }

        let held = self.store.drain_pending_messages(persona_id)?;
        if held.is_empty() {
            return Ok(());
        }
        tracing::info!("Flushing {} held message(s) for {}", held.len(), persona_id);
        let first_user_message = !persona.has_user_message();
        let content: Vec<String> = held.iter().map(stamp_line).collect();
        let latest = held.last().map(|m| m.timestamp).unwrap_or_else(Utc::now);
        self.store
            .append_message(persona_id, Message::user(content.join("\n"), latest))?;

        // The flush may be the moment the first user message reaches the
        // log, e.g. after a restart while still silenced.
        if first_user_message {
            self.arm_heartbeat(persona_id);
        }

        self.generate_reply(persona_id, ReplyContext::User).await?;
        self.emit(SessionEvent::MessageArrived {
            persona_id: persona_id.to_string(),
        });
        Ok(())
    }

    /// Silence check: an unexpired noreply status, or a noreply slot in the
    /// routine at the local time-of-day.
    fn is_silenced(&self, persona: &Persona, status: Option<&Status>, now: DateTime<Utc>) -> bool {
        if status.map(|s| s.noreply).unwrap_or(false) {
            return true;
        }
        slot_for_schedule(&persona.schedule, now)
            .map(|slot| slot.noreply)
            .unwrap_or(false)
    }

    // ---- generation ----

    async fn generate_reply(
        self: &Arc<Self>,
        persona_id: &str,
        ctx: ReplyContext,
    ) -> Result<Message> {
        let persona = self
            .store
            .get(persona_id)?
            .with_context(|| format!("Unknown persona {}", persona_id))?;
        let status = self.store.status(persona_id)?;

        let (proactive, backfill, as_of, reason) = match &ctx {
            ReplyContext::User => (false, false, Utc::now(), None),
            ReplyContext::Proactive {
                reason,
                as_of,
                backfill,
            } => (true, *backfill, *as_of, reason.clone()),
        };

        let style = if self.config.use_tool_calls {
            DirectiveStyle::Tools
        } else {
            DirectiveStyle::InlineTags
        };
        let time = build_time_context(&persona.messages, as_of);
        let system = system_prompt(&persona, &time, status.as_ref(), style);

        let mut history: Vec<ChatTurn> = persona
            .messages
            .iter()
            .map(|m| {
                ChatTurn::new(
                    match m.role {
                        crate::persona::Role::User => "user",
                        crate::persona::Role::Assistant => "assistant",
                    },
                    m.content.clone(),
                )
            })
            .collect();
        if self.config.history_limit > 0 && history.len() > self.config.history_limit {
            history.drain(..history.len() - self.config.history_limit);
        }
        if proactive {
            history.push(ChatTurn::new("user", proactive_trigger(reason.as_deref())));
        }

        let reply = self
            .generator
            .generate(GenerationRequest {
                system_prompt: system,
                history,
                tools: if self.config.use_tool_calls {
                    Some(tool_schemas())
                } else {
                    None
                },
            })
            .await?;

        let parsed = parse_reply(&reply.text, &reply.tool_calls);

        // Backfilled messages are historical record only; acting on their
        // directives would schedule things relative to the past.
        if !backfill {
            self.apply_directives(persona_id, &parsed.directives, Utc::now())?;

            // Getting in touch means whatever the status described is over,
            // unless this reply just declared a new one.
            let declared_status = parsed
                .directives
                .iter()
                .any(|d| matches!(d, Directive::SetStatus(_)));
            if proactive && status.is_some() && !declared_status {
                self.store.clear_status(persona_id)?;
                self.emit(SessionEvent::StatusChanged {
                    persona_id: persona_id.to_string(),
                });
            }
        }

        let message = Message::assistant(parsed.text, as_of, proactive);
        self.store.append_message(persona_id, message.clone())?;
        if proactive {
            self.emit(SessionEvent::MessageArrived {
                persona_id: persona_id.to_string(),
            });
        }
        Ok(message)
    }

    fn apply_directives(
        self: &Arc<Self>,
        persona_id: &str,
        directives: &[Directive],
        now: DateTime<Utc>,
    ) -> Result<()> {
        for directive in directives {
            match directive {
                Directive::NextContact {
                    after,
                    reason,
                    persistent,
                } => {
                    let send_at = now + chrono::Duration::from_std(*after)?;
                    tracing::debug!(
                        "Next contact for {} in {:?} (persistent: {})",
                        persona_id,
                        after,
                        persistent
                    );
                    self.store.set_pending_contact(
                        persona_id,
                        PendingContact {
                            send_at,
                            reason: reason.clone(),
                            persistent: *persistent,
                        },
                    )?;
                    self.arm_contact_timer(persona_id, send_at);
                }
                Directive::CancelContact => {
                    self.store.clear_pending_contact(persona_id)?;
                    if let Some(handle) = self.lock_inner().scheduled_contact.take() {
                        handle.abort();
                    }
                }
                Directive::SetStatus(d) => {
                    self.store.set_status(persona_id, status_from_directive(d, now))?;
                    self.emit(SessionEvent::StatusChanged {
                        persona_id: persona_id.to_string(),
                    });
                }
                Directive::ClearStatus => {
                    self.store.clear_status(persona_id)?;
                    self.emit(SessionEvent::StatusChanged {
                        persona_id: persona_id.to_string(),
                    });
                }
                Directive::Schedule(d) => {
                    let Some(mut schedule) = self.store.schedule(persona_id)? else {
                        continue;
                    };
                    match d.action {
                        ScheduleAction::Remove => {
                            schedule.routine.retain(|slot| slot.label != d.label);
                        }
                        ScheduleAction::Add | ScheduleAction::Set => {
                            let (Some(start), Some(end)) = (d.start.clone(), d.end.clone())
                            else {
                                tracing::warn!(
                                    "Schedule directive for '{}' missing time range",
                                    d.label
                                );
                                continue;
                            };
                            let slot = ScheduleSlot {
                                label: d.label.clone(),
                                start,
                                end,
                                noreply: d.noreply,
                                chance: d.chance,
                            };
                            if let Some(existing) = schedule
                                .routine
                                .iter_mut()
                                .find(|s| s.label == d.label)
                            {
                                *existing = slot;
                            } else {
                                schedule.routine.push(slot);
                            }
                        }
                    }
                    self.store.set_schedule(persona_id, schedule)?;
                }
            }
        }
        Ok(())
    }

    // ---- timers ----

    fn arm_heartbeat(self: &Arc<Self>, persona_id: &str) {
        let epoch = self.epoch.load(Ordering::SeqCst);
        let session = Arc::clone(self);
        let id = persona_id.to_string();
        let handle = tokio::spawn(async move {
            let interval_secs = match session.store.get(&id) {
                Ok(Some(p)) => p.proactive.heartbeat_secs.max(1),
                _ => return,
            };
            let mut ticker = tokio::time::interval(Duration::from_secs(interval_secs));
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if session.epoch.load(Ordering::SeqCst) != epoch {
                    return;
                }
                if let Err(e) = session.heartbeat_tick(&id).await {
                    tracing::warn!("Heartbeat tick failed for {}: {}", id, e);
                }
            }
        });
        let mut inner = self.lock_inner();
        if let Some(old) = inner.heartbeat.replace(handle) {
            old.abort();
        }
    }

    async fn heartbeat_tick(self: &Arc<Self>, persona_id: &str) -> Result<()> {
        let now = Utc::now();
        self.store.stamp_last_heartbeat(persona_id, now)?;

        let Some(persona) = self.store.get(persona_id)? else {
            return Ok(());
        };
        if !persona.proactive.enabled || !persona.has_user_message() {
            return Ok(());
        }

        let status = self.store.status(persona_id)?;
        let chance = {
            let mut chance = persona.proactive.base_chance;
            if let Some(mult) = status.as_ref().and_then(|s| s.chance_multiplier) {
                chance *= mult;
            }
            if let Some(slot_chance) =
                slot_for_schedule(&persona.schedule, now).and_then(|s| s.chance)
            {
                chance *= slot_chance;
            }
            chance
        };

        let roll: f64 = rand::thread_rng().gen();
        if roll >= chance {
            return Ok(());
        }

        // The contact lands after a humanizing delay, status override first.
        let delay_secs = {
            let mut rng = rand::thread_rng();
            match status.as_ref().and_then(|s| s.reply_delay_mins) {
                Some((min, max)) if max > min => rng.gen_range(min..=max) * 60.0,
                Some((min, _)) => min * 60.0,
                None => {
                    let range = persona.proactive.reply_delay_secs;
                    if range.max > range.min {
                        rng.gen_range(range.min..=range.max) as f64
                    } else {
                        range.min as f64
                    }
                }
            }
        };
        if delay_secs > 0.0 {
            let epoch = self.epoch.load(Ordering::SeqCst);
            tokio::time::sleep(Duration::from_secs_f64(delay_secs)).await;
            if self.epoch.load(Ordering::SeqCst) != epoch {
                return Ok(());
            }
        }

        tracing::info!("Heartbeat contact fired for {}", persona_id);
        self.generate_reply(
            persona_id,
            ReplyContext::Proactive {
                reason: None,
                as_of: Utc::now(),
                backfill: false,
            },
        )
        .await?;
        Ok(())
    }

    fn arm_contact_timer(self: &Arc<Self>, persona_id: &str, send_at: DateTime<Utc>) {
        let epoch = self.epoch.load(Ordering::SeqCst);
        let session = Arc::clone(self);
        let id = persona_id.to_string();
        let handle = tokio::spawn(async move {
            let wait = (send_at - Utc::now()).to_std().unwrap_or(Duration::ZERO);
            tokio::time::sleep(wait).await;
            if session.epoch.load(Ordering::SeqCst) != epoch {
                return;
            }
            let contact = match session.store.pending_contact(&id) {
                Ok(Some(contact)) => contact,
                Ok(None) => return,
                Err(e) => {
                    tracing::warn!("Contact lookup failed for {}: {}", id, e);
                    return;
                }
            };
            if let Err(e) = session.store.clear_pending_contact(&id) {
                tracing::warn!("Failed to clear contact for {}: {}", id, e);
                return;
            }
            let result = session
                .generate_reply(
                    &id,
                    ReplyContext::Proactive {
                        reason: contact.reason,
                        as_of: Utc::now(),
                        backfill: false,
                    },
                )
                .await;
            match result {
                // Fresh interval so the heartbeat does not fire right on the
                // heels of the contact it just watched happen.
                Ok(_) => session.arm_heartbeat(&id),
                Err(e) => tracing::warn!("Scheduled contact failed for {}: {}", id, e),
            }
        });
        let mut inner = self.lock_inner();
        if let Some(old) = inner.scheduled_contact.replace(handle) {
            old.abort();
        }
    }

    fn arm_recheck(self: &Arc<Self>, persona_id: &str) {
        let epoch = self.epoch.load(Ordering::SeqCst);
        let session = Arc::clone(self);
        let id = persona_id.to_string();
        let secs = self.config.pending_recheck_secs.max(1);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(secs));
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if session.epoch.load(Ordering::SeqCst) != epoch {
                    return;
                }
                if let Err(e) = session.flush_pending_queue(&id).await {
                    tracing::warn!("Pending recheck failed for {}: {}", id, e);
                }
            }
        });
        let mut inner = self.lock_inner();
        if let Some(old) = inner.recheck.replace(handle) {
            old.abort();
        }
    }

    fn spawn_delayed_reply(self: &Arc<Self>, persona_id: &str, user_message_id: &str, minutes: f64) {
        let epoch = self.epoch.load(Ordering::SeqCst);
        let session = Arc::clone(self);
        let id = persona_id.to_string();
        let msg_id = user_message_id.to_string();
        tracing::debug!("Reply for {} delayed {:.1}m", id, minutes);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs_f64(minutes * 60.0)).await;
            if session.epoch.load(Ordering::SeqCst) != epoch {
                return;
            }
            match session.generate_reply(&id, ReplyContext::User).await {
                Ok(_) => session.emit(SessionEvent::MessageArrived { persona_id: id }),
                Err(e) => {
                    tracing::warn!("Delayed reply failed for {}: {}", id, e);
                    if let Err(e) = session.store.set_message_failed(&id, &msg_id, true) {
                        tracing::warn!("Failed to flag message for {}: {}", id, e);
                    }
                }
            }
        });
    }
}

fn stamp_line(message: &PendingMessage) -> String {
    let local = message.timestamp.with_timezone(&Local);
    format!(
        "[{:02}:{:02}] {}",
        local.hour(),
        local.minute(),
        message.content
    )
}

fn status_from_directive(d: &StatusDirective, now: DateTime<Utc>) -> Status {
    Status {
        label: d.label.clone(),
        reason: d.reason.clone(),
        ends_at: d
            .duration
            .and_then(|dur| chrono::Duration::from_std(dur).ok())
            .map(|dur| now + dur),
        chance_multiplier: d.chance,
        reply_delay_mins: d
            .delay_secs
            .map(|(min, max)| (min as f64 / 60.0, max as f64 / 60.0)),
        noreply: d.noreply,
    }
}
