use anyhow::{anyhow, bail, Result};
use clap::{Parser, Subcommand};
use server_api::auth::{mint_token, AuthConfig, DEFAULT_TOKEN_TTL_SECONDS, DEV_JWT_SECRET};
use shared::domain::{ConversationId, Identity, Role, UserId};
use storage::Storage;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Operator commands for seeding and inspecting a chat database.
#[derive(Parser, Debug)]
struct Cli {
    #[arg(long, default_value = "sqlite://./data/chat.db")]
    database_url: String,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Adds a user, or refreshes name and phone for an existing email with
    /// the same role.
    CreateUser {
        #[arg(long)]
        email: String,
        #[arg(long)]
        full_name: String,
        /// patient, doctor or medicine_company
        #[arg(long)]
        role: String,
        #[arg(long)]
        phone: Option<String>,
    },
    /// Prints a bearer token for an existing user.
    IssueToken {
        #[arg(long)]
        user_id: i64,
        /// Falls back to JWT_SECRET, then the development secret.
        #[arg(long)]
        jwt_secret: Option<String>,
        #[arg(long, default_value_t = DEFAULT_TOKEN_TTL_SECONDS)]
        ttl_seconds: i64,
    },
    ListConversations {
        #[arg(long)]
        user_id: i64,
    },
    ListMessages {
        #[arg(long)]
        conversation_id: i64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let storage = Storage::new(&cli.database_url).await?;
    info!(database_url = %cli.database_url, "opened database");

    match cli.command {
        Command::CreateUser {
            email,
            full_name,
            role,
            phone,
        } => {
            let role = Role::parse(&role).ok_or_else(|| anyhow!("unknown role '{role}'"))?;
            let user_id = storage
                .create_user(&email, &full_name, role, phone.as_deref())
                .await?;
            println!("user_id={user_id} role={role}");
        }
        Command::IssueToken {
            user_id,
            jwt_secret,
            ttl_seconds,
        } => {
            let user = storage
                .user_profile(UserId(user_id))
                .await?
                .ok_or_else(|| anyhow!("user {user_id} not found"))?;
            let jwt_secret = jwt_secret
                .or_else(|| std::env::var("JWT_SECRET").ok())
                .unwrap_or_else(|| DEV_JWT_SECRET.to_string());
            let token = mint_token(
                &AuthConfig {
                    jwt_secret,
                    ttl_seconds,
                },
                Identity {
                    user_id: user.user_id,
                    role: user.role,
                },
            )?;
            println!("{token}");
        }
        Command::ListConversations { user_id } => {
            let Some(user) = storage.user_profile(UserId(user_id)).await? else {
                bail!("user {user_id} not found");
            };
            for summary in storage
                .list_conversations_for_user(user.user_id, user.role)
                .await?
            {
                println!(
                    "{}\tpatient={} ({})\tdoctor={} ({})\tupdated_at={}",
                    summary.conversation.conversation_id,
                    summary.patient.user_id,
                    summary.patient.full_name,
                    summary.doctor.user_id,
                    summary.doctor.full_name,
                    summary.conversation.updated_at.to_rfc3339(),
                );
            }
        }
        Command::ListMessages { conversation_id } => {
            let conversation_id = ConversationId(conversation_id);
            if storage.get_conversation(conversation_id).await?.is_none() {
                bail!("conversation {conversation_id} not found");
            }
            for message in storage.list_conversation_messages(conversation_id).await? {
                println!(
                    "{}\t{}\t{} ({}): {}",
                    message.created_at.to_rfc3339(),
                    message.message_id,
                    message.sender_full_name,
                    message.sender_role,
                    message.content,
                );
            }
        }
    }

    Ok(())
}
