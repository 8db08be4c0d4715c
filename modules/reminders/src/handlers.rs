//! Event handlers for the reminder service.
//!
//! Both handlers write through the transaction that already holds the
//! event's idempotency marker, so a reminder row exists iff the event is
//! recorded as processed.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use event_bus::UserId;
use event_consumer::{
    lock_key, AdvisoryLock, ConsumerRuntime, EventContext, EventHandler, HandlerError,
    PgIdempotencyStore,
};
use serde::Deserialize;
use serde_json::json;
use sqlx::{PgConnection, Postgres, Transaction};
use uuid::Uuid;

pub const USER_REGISTERED: &str = "user.registered";
pub const PLAN_PERSISTED: &str = "program.plan.persisted";
pub const REMINDER_SCHEDULED: &str = "reminder.scheduled";

/// Welcome reminders fire a day after registration
const WELCOME_DELAY_HOURS: i64 = 24;
const DEFAULT_LEAD_MINUTES: i64 = 60;

type PgTx = Transaction<'static, Postgres>;

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum ReminderError {
    #[error("{0} must carry a user subject, not the system user")]
    MissingUser(&'static str),

    #[error("session `{0}` appears more than once in the plan")]
    DuplicateSession(String),

    #[error("reminder lead time must be non-negative, got {0} minutes")]
    NegativeLead(i64),
}

/// Register every handler this service consumes
pub fn register(runtime: &mut ConsumerRuntime<PgIdempotencyStore>) {
    runtime
        .register(USER_REGISTERED, WelcomeReminderHandler)
        .register(PLAN_PERSISTED, SessionReminderHandler);
}

#[derive(Debug, Deserialize)]
pub struct UserRegistered {
    pub email: String,
    #[serde(default)]
    pub display_name: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct PlannedSession {
    pub session_id: String,
    pub scheduled_at: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
pub struct ProgramPlanPersisted {
    pub program_id: Uuid,
    #[serde(default)]
    pub sessions: Vec<PlannedSession>,
    #[serde(default)]
    pub reminder_lead_minutes: Option<i64>,
}

/// One reminder to upsert for a planned session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionReminder {
    pub session_id: String,
    pub due_at: DateTime<Utc>,
}

/// Reminders for the sessions still ahead of `now`, ordered by due time
pub fn plan_session_reminders(
    plan: &ProgramPlanPersisted,
    now: DateTime<Utc>,
) -> Result<Vec<SessionReminder>, ReminderError> {
    let lead_minutes = plan.reminder_lead_minutes.unwrap_or(DEFAULT_LEAD_MINUTES);
    if lead_minutes < 0 {
        return Err(ReminderError::NegativeLead(lead_minutes));
    }
    let lead = Duration::minutes(lead_minutes);

    let mut seen = std::collections::HashSet::new();
    let mut reminders = Vec::with_capacity(plan.sessions.len());
    for session in &plan.sessions {
        if !seen.insert(session.session_id.as_str()) {
            return Err(ReminderError::DuplicateSession(session.session_id.clone()));
        }
        if session.scheduled_at <= now {
            continue;
        }
        reminders.push(SessionReminder {
            session_id: session.session_id.clone(),
            // A session closer than the lead time is reminded right away
            due_at: std::cmp::max(session.scheduled_at - lead, now),
        });
    }
    reminders.sort_by(|a, b| a.due_at.cmp(&b.due_at));
    Ok(reminders)
}

fn subject(ctx: &EventContext, event_type: &'static str) -> Result<Uuid, ReminderError> {
    match ctx.envelope().user_id {
        UserId::User(id) => Ok(id),
        UserId::System => Err(ReminderError::MissingUser(event_type)),
    }
}

/// `user.registered` → one welcome reminder per user
pub struct WelcomeReminderHandler;

#[async_trait]
impl EventHandler<PgTx> for WelcomeReminderHandler {
    async fn handle(&self, ctx: &EventContext, tx: &mut PgTx) -> Result<(), HandlerError> {
        let user_id = subject(ctx, USER_REGISTERED)?;
        let payload: UserRegistered = ctx.data_as()?;
        let due_at = ctx.envelope().timestamp + Duration::hours(WELCOME_DELAY_HOURS);

        let inserted = sqlx::query(
            r#"
            INSERT INTO reminders (id, user_id, kind, due_at, source_event_id)
            VALUES ($1, $2, 'welcome', $3, $4)
            ON CONFLICT (user_id) WHERE kind = 'welcome' DO NOTHING
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(user_id)
        .bind(due_at)
        .bind(ctx.envelope().client_generated_id)
        .execute(&mut **tx)
        .await?
        .rows_affected();

        tracing::info!(
            user_id = %user_id,
            email_domain = payload.email.rsplit('@').next().unwrap_or_default(),
            has_display_name = payload.display_name.is_some(),
            due_at = %due_at,
            inserted,
            "Welcome reminder scheduled"
        );
        Ok(())
    }
}

/// `program.plan.persisted` → one reminder per upcoming session.
///
/// Plans for the same program are serialised with a transaction-scoped
/// advisory lock, so concurrent re-plans never interleave their upserts.
pub struct SessionReminderHandler;

#[async_trait]
impl EventHandler<PgTx> for SessionReminderHandler {
    async fn handle(&self, ctx: &EventContext, tx: &mut PgTx) -> Result<(), HandlerError> {
        let user_id = subject(ctx, PLAN_PERSISTED)?;
        let plan: ProgramPlanPersisted = ctx.data_as()?;
        let reminders = plan_session_reminders(&plan, Utc::now())?;

        let conn: &mut PgConnection = &mut **tx;
        AdvisoryLock::new(lock_key("program", plan.program_id))
            .acquire_xact(conn)
            .await?;

        for reminder in &reminders {
            sqlx::query(
                r#"
                INSERT INTO reminders (id, user_id, kind, program_id, session_id, due_at, source_event_id)
                VALUES ($1, $2, 'session', $3, $4, $5, $6)
                ON CONFLICT (program_id, session_id) WHERE program_id IS NOT NULL
                DO UPDATE SET due_at = EXCLUDED.due_at,
                              source_event_id = EXCLUDED.source_event_id,
                              updated_at = now()
                "#,
            )
            .bind(Uuid::new_v4())
            .bind(user_id)
            .bind(plan.program_id)
            .bind(&reminder.session_id)
            .bind(reminder.due_at)
            .bind(ctx.envelope().client_generated_id)
            .execute(&mut *conn)
            .await?;
        }

        if !reminders.is_empty() {
            ctx.emit_event(
                REMINDER_SCHEDULED,
                user_id,
                json!({
                    "program_id": plan.program_id,
                    "reminder_count": reminders.len(),
                    "first_due_at": reminders.first().map(|r| r.due_at),
                }),
            );
        }

        tracing::info!(
            program_id = %plan.program_id,
            planned_sessions = plan.sessions.len(),
            reminders = reminders.len(),
            "Session reminders scheduled"
        );
        Ok(())
    }
}
