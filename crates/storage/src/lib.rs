use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow},
    Pool, Row, Sqlite,
};
use std::{
    fs,
    path::{Path, PathBuf},
    str::FromStr,
};

use shared::domain::{ConversationId, MessageId, Role, UserId};

#[derive(Clone)]
pub struct Storage {
    pool: Pool<Sqlite>,
}

#[derive(Debug, Clone)]
pub struct StoredUser {
    pub user_id: UserId,
    pub email: String,
    pub full_name: String,
    pub role: Role,
    pub phone: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredConversation {
    pub conversation_id: ConversationId,
    pub patient_id: UserId,
    pub doctor_id: UserId,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct StoredParticipant {
    pub user_id: UserId,
    pub full_name: String,
    pub email: String,
}

#[derive(Debug, Clone)]
pub struct StoredConversationSummary {
    pub conversation: StoredConversation,
    pub patient: StoredParticipant,
    pub doctor: StoredParticipant,
}

/// A persisted message joined with its sender's display fields.
#[derive(Debug, Clone)]
pub struct StoredMessage {
    pub message_id: MessageId,
    pub conversation_id: ConversationId,
    pub sender_id: UserId,
    pub sender_full_name: String,
    pub sender_role: Role,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

const CONVERSATION_COLUMNS: &str = "id, patient_id, doctor_id, created_at, updated_at";

const MESSAGE_SELECT: &str = "SELECT m.id, m.conversation_id, m.sender_id, m.content, m.created_at, u.full_name, u.role
     FROM messages m
     INNER JOIN users u ON u.id = m.sender_id";

impl Storage {
    pub async fn new(database_url: &str) -> Result<Self> {
        ensure_sqlite_parent_dir_exists(database_url)?;

        let connect_options = SqliteConnectOptions::from_str(database_url)?
            .create_if_missing(true)
            .foreign_keys(true);

        // Every connection to an in-memory database is its own database, so
        // keep exactly one alive for the lifetime of the pool.
        let pool_options = if is_memory_url(database_url) {
            SqlitePoolOptions::new()
                .max_connections(1)
                .min_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            SqlitePoolOptions::new().max_connections(5)
        };

        let pool = pool_options.connect_with(connect_options).await?;
        sqlx::migrate!("./migrations").run(&pool).await?;
        Ok(Self { pool })
    }

    pub async fn health_check(&self) -> Result<()> {
        let _: i64 = sqlx::query_scalar("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .context("sqlite ping failed")?;
        Ok(())
    }

    pub async fn create_user(
        &self,
        email: &str,
        full_name: &str,
        role: Role,
        phone: Option<&str>,
    ) -> Result<UserId> {
        let email = email.trim();
        let full_name = full_name.trim();
        if email.is_empty() || full_name.is_empty() {
            bail!("email and full name are required");
        }

        // A repeat email refreshes display fields but never moves a user to
        // another role: existing conversations are keyed on it.
        let rec = sqlx::query(
            "INSERT INTO users (email, full_name, role, phone, created_at) VALUES (?, ?, ?, ?, ?)
             ON CONFLICT(email) DO UPDATE SET full_name=excluded.full_name, phone=excluded.phone
             WHERE users.role = excluded.role
             RETURNING id",
        )
        .bind(email)
        .bind(full_name)
        .bind(role.as_str())
        .bind(phone)
        .bind(Utc::now().timestamp_millis())
        .fetch_optional(&self.pool)
        .await
        .with_context(|| format!("failed to upsert user '{email}'"))?;
        let Some(rec) = rec else {
            bail!("email '{email}' is already registered with a different role");
        };
        Ok(UserId(rec.get::<i64, _>(0)))
    }

    pub async fn user_profile(&self, user_id: UserId) -> Result<Option<StoredUser>> {
        let row = sqlx::query(
            "SELECT id, email, full_name, role, phone, created_at FROM users WHERE id = ?",
        )
        .bind(user_id.0)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|r| {
            Ok::<_, anyhow::Error>(StoredUser {
                user_id: UserId(r.get::<i64, _>(0)),
                email: r.get::<String, _>(1),
                full_name: r.get::<String, _>(2),
                role: parse_role(&r.get::<String, _>(3))?,
                phone: r.get::<Option<String>, _>(4),
                created_at: from_millis(r.get::<i64, _>(5))?,
            })
        })
        .transpose()
    }

    pub async fn get_conversation(
        &self,
        conversation_id: ConversationId,
    ) -> Result<Option<StoredConversation>> {
        let row = sqlx::query(&format!(
            "SELECT {CONVERSATION_COLUMNS} FROM conversations WHERE id = ?"
        ))
        .bind(conversation_id.0)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(conversation_from_row).transpose()
    }

    pub async fn find_conversation(
        &self,
        patient_id: UserId,
        doctor_id: UserId,
    ) -> Result<Option<StoredConversation>> {
        let row = sqlx::query(&format!(
            "SELECT {CONVERSATION_COLUMNS} FROM conversations WHERE patient_id = ? AND doctor_id = ?"
        ))
        .bind(patient_id.0)
        .bind(doctor_id.0)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(conversation_from_row).transpose()
    }

    /// Returns the conversation for the pair, creating it if needed. The
    /// flag is `true` only for the caller whose insert actually landed.
    pub async fn find_or_create_conversation(
        &self,
        patient_id: UserId,
        doctor_id: UserId,
    ) -> Result<(StoredConversation, bool)> {
        if let Some(existing) = self.find_conversation(patient_id, doctor_id).await? {
            return Ok((existing, false));
        }

        let now = Utc::now().timestamp_millis();
        let inserted = sqlx::query(&format!(
            "INSERT INTO conversations (patient_id, doctor_id, created_at, updated_at)
             VALUES (?, ?, ?, ?)
             RETURNING {CONVERSATION_COLUMNS}"
        ))
        .bind(patient_id.0)
        .bind(doctor_id.0)
        .bind(now)
        .bind(now)
        .fetch_one(&self.pool)
        .await;

        match inserted {
            Ok(row) => Ok((conversation_from_row(&row)?, true)),
            Err(sqlx::Error::Database(db_error)) if db_error.is_unique_violation() => {
                // Lost the race against a concurrent creator for the same pair.
                let existing = self
                    .find_conversation(patient_id, doctor_id)
                    .await?
                    .context("conversation missing after unique violation")?;
                Ok((existing, false))
            }
            Err(error) => Err(error).context("failed to insert conversation"),
        }
    }

    pub async fn touch_conversation(&self, conversation_id: ConversationId) -> Result<()> {
        let result = sqlx::query(
            "UPDATE conversations SET updated_at = MAX(updated_at, ?) WHERE id = ?",
        )
        .bind(Utc::now().timestamp_millis())
        .bind(conversation_id.0)
        .execute(&self.pool)
        .await
        .context("failed to update conversation activity")?;
        if result.rows_affected() == 0 {
            bail!("conversation {conversation_id} not found");
        }
        Ok(())
    }

    /// Conversations the user takes part in under the given role, most
    /// recently active first. Roles outside the patient/doctor pairing have
    /// no conversations.
    pub async fn list_conversations_for_user(
        &self,
        user_id: UserId,
        role: Role,
    ) -> Result<Vec<StoredConversationSummary>> {
        let participant_column = match role {
            Role::Patient => "c.patient_id",
            Role::Doctor => "c.doctor_id",
            Role::MedicineCompany => return Ok(Vec::new()),
        };

        let rows = sqlx::query(&format!(
            "SELECT c.id, c.patient_id, c.doctor_id, c.created_at, c.updated_at,
                    p.full_name, p.email, d.full_name, d.email
             FROM conversations c
             INNER JOIN users p ON p.id = c.patient_id
             INNER JOIN users d ON d.id = c.doctor_id
             WHERE {participant_column} = ?
             ORDER BY c.updated_at DESC, c.id DESC"
        ))
        .bind(user_id.0)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|r| {
                let conversation = conversation_from_row(&r)?;
                Ok(StoredConversationSummary {
                    patient: StoredParticipant {
                        user_id: conversation.patient_id,
                        full_name: r.get::<String, _>(5),
                        email: r.get::<String, _>(6),
                    },
                    doctor: StoredParticipant {
                        user_id: conversation.doctor_id,
                        full_name: r.get::<String, _>(7),
                        email: r.get::<String, _>(8),
                    },
                    conversation,
                })
            })
            .collect()
    }

    pub async fn insert_message(
        &self,
        conversation_id: ConversationId,
        sender_id: UserId,
        content: &str,
    ) -> Result<StoredMessage> {
        if content.trim().is_empty() {
            bail!("message content must not be empty");
        }

        let rec = sqlx::query(
            "INSERT INTO messages (conversation_id, sender_id, content, created_at) VALUES (?, ?, ?, ?) RETURNING id",
        )
        .bind(conversation_id.0)
        .bind(sender_id.0)
        .bind(content)
        .bind(Utc::now().timestamp_millis())
        .fetch_one(&self.pool)
        .await
        .context("failed to insert message")?;
        let message_id = MessageId(rec.get::<i64, _>(0));

        self.load_message(message_id)
            .await?
            .with_context(|| format!("message {message_id} missing after insert"))
    }

    pub async fn load_message(&self, message_id: MessageId) -> Result<Option<StoredMessage>> {
        let row = sqlx::query(&format!("{MESSAGE_SELECT} WHERE m.id = ?"))
            .bind(message_id.0)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(message_from_row).transpose()
    }

    pub async fn list_conversation_messages(
        &self,
        conversation_id: ConversationId,
    ) -> Result<Vec<StoredMessage>> {
        let rows = sqlx::query(&format!(
            "{MESSAGE_SELECT}
             WHERE m.conversation_id = ?
             ORDER BY m.created_at ASC, m.id ASC"
        ))
        .bind(conversation_id.0)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(message_from_row).collect()
    }
}

fn conversation_from_row(r: &SqliteRow) -> Result<StoredConversation> {
    Ok(StoredConversation {
        conversation_id: ConversationId(r.get::<i64, _>(0)),
        patient_id: UserId(r.get::<i64, _>(1)),
        doctor_id: UserId(r.get::<i64, _>(2)),
        created_at: from_millis(r.get::<i64, _>(3))?,
        updated_at: from_millis(r.get::<i64, _>(4))?,
    })
}

fn message_from_row(r: &SqliteRow) -> Result<StoredMessage> {
    Ok(StoredMessage {
        message_id: MessageId(r.get::<i64, _>(0)),
        conversation_id: ConversationId(r.get::<i64, _>(1)),
        sender_id: UserId(r.get::<i64, _>(2)),
        content: r.get::<String, _>(3),
        created_at: from_millis(r.get::<i64, _>(4))?,
        sender_full_name: r.get::<String, _>(5),
        sender_role: parse_role(&r.get::<String, _>(6))?,
    })
}

fn parse_role(raw: &str) -> Result<Role> {
    Role::parse(raw).with_context(|| format!("unknown role '{raw}' in users table"))
}

fn from_millis(millis: i64) -> Result<DateTime<Utc>> {
    DateTime::<Utc>::from_timestamp_millis(millis)
        .with_context(|| format!("timestamp {millis} out of range"))
}

fn is_memory_url(database_url: &str) -> bool {
    database_url.contains(":memory:") || database_url.contains("mode=memory")
}

fn ensure_sqlite_parent_dir_exists(database_url: &str) -> Result<()> {
    let Some(path) = sqlite_path(database_url) else {
        return Ok(());
    };
    let Some(parent) = path.parent() else {
        return Ok(());
    };
    if parent.as_os_str().is_empty() {
        return Ok(());
    }

    fs::create_dir_all(parent).with_context(|| {
        format!(
            "failed to create parent directory '{}' for database url '{database_url}'",
            parent.display()
        )
    })?;
    Ok(())
}

fn sqlite_path(database_url: &str) -> Option<PathBuf> {
    if is_memory_url(database_url) || !database_url.starts_with("sqlite:") {
        return None;
    }

    let path = database_url
        .trim_start_matches("sqlite://")
        .trim_start_matches("sqlite:")
        .split('?')
        .next()
        .unwrap_or_default();

    if path.is_empty() {
        return None;
    }

    Some(Path::new(path).to_path_buf())
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
