use poise::serenity_prelude::{self as serenity, GetMessages, Mentionable};
use sqlx::SqlitePool;
use tracing::{info, warn};

use crate::{Context, Data, Error, db};

pub const OPEN_BUTTON: &str = "ticket:open";
pub const CLOSE_BUTTON: &str = "ticket:close";

/// Upper bound on history pages read into a transcript.
const MAX_PAGES: usize = 50;

#[derive(sqlx::FromRow, Debug, Clone, Copy, PartialEq, Eq)]
pub struct TicketConfig {
    pub category_id: i64,
    pub support_role_id: i64,
    pub log_channel_id: Option<i64>,
}

#[derive(sqlx::FromRow, Debug, Clone, PartialEq, Eq)]
pub struct Ticket {
    pub channel_id: i64,
    pub guild_id: i64,
    pub opener_id: i64,
    pub opened_at: i64,
}

pub async fn config(pool: &SqlitePool, guild_id: u64) -> Result<Option<TicketConfig>, sqlx::Error> {
    sqlx::query_as(
        "SELECT category_id, support_role_id, log_channel_id FROM ticket_config WHERE guild_id = ?",
    )
    .bind(guild_id as i64)
    .fetch_optional(pool)
    .await
}

pub async fn save_config(
    pool: &SqlitePool,
    guild_id: u64,
    config: TicketConfig,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        "INSERT INTO ticket_config (guild_id, category_id, support_role_id, log_channel_id) VALUES (?, ?, ?, ?)
         ON CONFLICT (guild_id) DO UPDATE SET category_id = excluded.category_id,
             support_role_id = excluded.support_role_id, log_channel_id = excluded.log_channel_id",
    )
    .bind(guild_id as i64)
    .bind(config.category_id)
    .bind(config.support_role_id)
    .bind(config.log_channel_id)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn open_ticket_of(
    pool: &SqlitePool,
    guild_id: u64,
    opener_id: u64,
) -> Result<Option<u64>, sqlx::Error> {
    let channel: Option<i64> =
        sqlx::query_scalar("SELECT channel_id FROM tickets WHERE guild_id = ? AND opener_id = ?")
            .bind(guild_id as i64)
            .bind(opener_id as i64)
            .fetch_optional(pool)
            .await?;
    Ok(channel.map(|id| id as u64))
}

pub async fn insert_ticket(pool: &SqlitePool, ticket: &Ticket) -> Result<(), sqlx::Error> {
    sqlx::query("INSERT INTO tickets (channel_id, guild_id, opener_id, opened_at) VALUES (?, ?, ?, ?)")
        .bind(ticket.channel_id)
        .bind(ticket.guild_id)
        .bind(ticket.opener_id)
        .bind(ticket.opened_at)
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn ticket(pool: &SqlitePool, channel_id: u64) -> Result<Option<Ticket>, sqlx::Error> {
    sqlx::query_as("SELECT channel_id, guild_id, opener_id, opened_at FROM tickets WHERE channel_id = ?")
        .bind(channel_id as i64)
        .fetch_optional(pool)
        .await
}

pub async fn delete_ticket(pool: &SqlitePool, channel_id: u64) -> Result<bool, sqlx::Error> {
    let result = sqlx::query("DELETE FROM tickets WHERE channel_id = ?")
        .bind(channel_id as i64)
        .execute(pool)
        .await?;
    Ok(result.rows_affected() > 0)
}

/// Lowercase, dash separated, at most 100 characters.
pub fn ticket_channel_name(username: &str) -> String {
    let slug: String = username
        .to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { '-' })
        .collect();
    let slug = slug.trim_matches('-');
    let slug = if slug.is_empty() { "member" } else { slug };
    format!("ticket-{}", slug).chars().take(100).collect()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TranscriptMeta {
    pub channel_name: String,
    pub guild_name: String,
    pub opener: String,
    pub opened_at: i64,
    pub closed_by: String,
    pub closed_at: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TranscriptLine {
    pub timestamp: i64,
    pub author: String,
    pub content: String,
    pub attachments: Vec<String>,
}

fn format_time(ts: i64) -> String {
    chrono::DateTime::from_timestamp(ts, 0)
        .map(|t| t.format("%Y-%m-%d %H:%M:%S UTC").to_string())
        .unwrap_or_else(|| ts.to_string())
}

/// Plain-text transcript; `lines` must be oldest first.
pub fn render_transcript(meta: &TranscriptMeta, lines: &[TranscriptLine]) -> String {
    let mut out = format!(
        "Transcript of #{}\nServer: {}\nOpened by: {} at {}\nClosed by: {} at {}\nMessages: {}\n\n",
        meta.channel_name,
        meta.guild_name,
        meta.opener,
        format_time(meta.opened_at),
        meta.closed_by,
        format_time(meta.closed_at),
        lines.len()
    );
    for line in lines {
        out.push_str(&format!(
            "[{}] {}: {}\n",
            format_time(line.timestamp),
            line.author,
            line.content
        ));
        for attachment in &line.attachments {
            out.push_str(&format!("    attachment: {}\n", attachment));
        }
    }
    out
}

async fn collect_history(
    ctx: &serenity::Context,
    channel_id: serenity::ChannelId,
) -> Result<Vec<TranscriptLine>, serenity::Error> {
    let mut messages = Vec::new();
    let mut before: Option<serenity::MessageId> = None;
    for _ in 0..MAX_PAGES {
        let mut request = GetMessages::new().limit(100);
        if let Some(id) = before {
            request = request.before(id);
        }
        let page = channel_id.messages(&ctx.http, request).await?;
        let full = page.len() == 100;
        before = page.last().map(|m| m.id);
        messages.extend(page);
        if !full {
            break;
        }
    }
    messages.reverse();
    Ok(messages
        .into_iter()
        .map(|m| TranscriptLine {
            timestamp: m.timestamp.unix_timestamp(),
            author: m.author.name.clone(),
            content: m.content.clone(),
            attachments: m.attachments.iter().map(|a| a.url.clone()).collect(),
        })
        .collect())
}

async fn respond(
    ctx: &serenity::Context,
    interaction: &serenity::ComponentInteraction,
    content: impl Into<String>,
) -> Result<(), serenity::Error> {
    interaction
        .create_response(
            &ctx.http,
            serenity::CreateInteractionResponse::Message(
                serenity::CreateInteractionResponseMessage::new()
                    .content(content)
                    .ephemeral(true),
            ),
        )
        .await
}

pub async fn on_interaction(
    ctx: &serenity::Context,
    data: &Data,
    interaction: &serenity::Interaction,
) -> Result<(), Error> {
    let serenity::Interaction::Component(component) = interaction else {
        return Ok(());
    };
    match component.data.custom_id.as_str() {
        OPEN_BUTTON => open(ctx, data, component).await,
        CLOSE_BUTTON => close(ctx, data, component).await,
        _ => Ok(()),
    }
}

async fn open(
    ctx: &serenity::Context,
    data: &Data,
    component: &serenity::ComponentInteraction,
) -> Result<(), Error> {
    let Some(guild_id) = component.guild_id else {
        return Ok(());
    };
    let pool = &data.db_pool;
    let Some(config) = config(pool, guild_id.get()).await? else {
        respond(ctx, component, "Tickets are not set up here.").await?;
        return Ok(());
    };
    let opener = &component.user;
    if let Some(existing) = open_ticket_of(pool, guild_id.get(), opener.id.get()).await? {
        respond(ctx, component, format!("You already have a ticket: <#{}>", existing)).await?;
        return Ok(());
    }

    let access = serenity::Permissions::VIEW_CHANNEL
        | serenity::Permissions::SEND_MESSAGES
        | serenity::Permissions::READ_MESSAGE_HISTORY
        | serenity::Permissions::ATTACH_FILES;
    let support_role = serenity::RoleId::new(config.support_role_id as u64);
    let overwrites = vec![
        serenity::PermissionOverwrite {
            allow: serenity::Permissions::empty(),
            deny: serenity::Permissions::VIEW_CHANNEL,
            kind: serenity::PermissionOverwriteType::Role(guild_id.everyone_role()),
        },
        serenity::PermissionOverwrite {
            allow: access,
            deny: serenity::Permissions::empty(),
            kind: serenity::PermissionOverwriteType::Member(opener.id),
        },
        serenity::PermissionOverwrite {
            allow: access,
            deny: serenity::Permissions::empty(),
            kind: serenity::PermissionOverwriteType::Role(support_role),
        },
        serenity::PermissionOverwrite {
            allow: access | serenity::Permissions::MANAGE_CHANNELS,
            deny: serenity::Permissions::empty(),
            kind: serenity::PermissionOverwriteType::Member(ctx.cache.current_user().id),
        },
    ];
    let channel = guild_id
        .create_channel(
            &ctx.http,
            serenity::CreateChannel::new(ticket_channel_name(&opener.name))
                .kind(serenity::ChannelType::Text)
                .category(serenity::ChannelId::new(config.category_id as u64))
                .permissions(overwrites),
        )
        .await?;
    insert_ticket(
        pool,
        &Ticket {
            channel_id: channel.id.get() as i64,
            guild_id: guild_id.get() as i64,
            opener_id: opener.id.get() as i64,
            opened_at: db::now(),
        },
    )
    .await?;
    info!(guild_id = %guild_id, channel_id = %channel.id, opener_id = %opener.id, "ticket opened");

    let close = serenity::CreateActionRow::Buttons(vec![
        serenity::CreateButton::new(CLOSE_BUTTON)
            .label("Close")
            .emoji('🔒')
            .style(serenity::ButtonStyle::Danger),
    ]);
    channel
        .id
        .send_message(
            &ctx.http,
            serenity::CreateMessage::new()
                .content(format!(
                    "{} a member of {} will be with you shortly.",
                    opener.mention(),
                    support_role.mention()
                ))
                .components(vec![close]),
        )
        .await?;
    respond(ctx, component, format!("Ticket opened: {}", channel.id.mention())).await?;
    Ok(())
}

async fn close(
    ctx: &serenity::Context,
    data: &Data,
    component: &serenity::ComponentInteraction,
) -> Result<(), Error> {
    let Some(guild_id) = component.guild_id else {
        return Ok(());
    };
    let pool = &data.db_pool;
    let channel_id = component.channel_id;
    let Some(ticket) = ticket(pool, channel_id.get()).await? else {
        respond(ctx, component, "This channel is not an open ticket.").await?;
        return Ok(());
    };
    let config = config(pool, guild_id.get()).await?;
    let is_support = match (&component.member, config) {
        (Some(member), Some(config)) => member
            .roles
            .contains(&serenity::RoleId::new(config.support_role_id as u64)),
        _ => false,
    };
    if component.user.id.get() != ticket.opener_id as u64 && !is_support {
        respond(ctx, component, "Only the opener or support staff can close this ticket.").await?;
        return Ok(());
    }
    respond(ctx, component, "Closing ticket...").await?;

    let lines = collect_history(ctx, channel_id).await?;
    let channel_name = channel_id
        .name(ctx)
        .await
        .unwrap_or_else(|_| channel_id.to_string());
    let guild_name = guild_id
        .name(&ctx.cache)
        .unwrap_or_else(|| guild_id.to_string());
    let opener = match serenity::UserId::new(ticket.opener_id as u64).to_user(ctx).await {
        Ok(user) => format!("{} ({})", user.name, user.id),
        Err(_) => ticket.opener_id.to_string(),
    };
    let meta = TranscriptMeta {
        channel_name,
        guild_name,
        opener,
        opened_at: ticket.opened_at,
        closed_by: format!("{} ({})", component.user.name, component.user.id),
        closed_at: db::now(),
    };
    let transcript = render_transcript(&meta, &lines);

    if let Some(log_channel) = config.and_then(|c| c.log_channel_id) {
        let file = serenity::CreateAttachment::bytes(
            transcript.into_bytes(),
            format!("transcript-{}.txt", channel_id),
        );
        let sent = serenity::ChannelId::new(log_channel as u64)
            .send_message(
                &ctx.http,
                serenity::CreateMessage::new()
                    .content(format!(
                        "Ticket `#{}` of <@{}> closed by {}.",
                        meta.channel_name,
                        ticket.opener_id,
                        component.user.mention()
                    ))
                    .add_file(file),
            )
            .await;
        if let Err(e) = sent {
            warn!(guild_id = %guild_id, "failed to post ticket transcript: {e}");
        }
    }

    delete_ticket(pool, channel_id.get()).await?;
    channel_id.delete(&ctx.http).await?;
    info!(guild_id = %guild_id, channel_id = %channel_id, messages = lines.len(), "ticket closed");
    Ok(())
}

/// Support tickets opened from a button.
#[poise::command(
    slash_command,
    prefix_command,
    guild_only,
    required_permissions = "MANAGE_GUILD",
    subcommands("setup"),
    subcommand_required,
    rename = "ticket"
)]
pub async fn ticket_cmd(_ctx: Context<'_>) -> Result<(), Error> {
    Ok(())
}

/// Post the ticket panel in this channel.
#[poise::command(slash_command, prefix_command, guild_only, required_permissions = "MANAGE_GUILD")]
pub async fn setup(
    ctx: Context<'_>,
    #[description = "Category for ticket channels"]
    #[channel_types("Category")]
    category: serenity::GuildChannel,
    #[description = "Role that handles tickets"] support: serenity::Role,
    #[description = "Channel for transcripts"] logs: Option<serenity::GuildChannel>,
) -> Result<(), Error> {
    let guild_id = ctx.guild_id().ok_or_else(|| anyhow::anyhow!("guild only"))?;
    if category.kind != serenity::ChannelType::Category {
        anyhow::bail!("{} is not a category.", category.name);
    }
    save_config(
        &ctx.data().db_pool,
        guild_id.get(),
        TicketConfig {
            category_id: category.id.get() as i64,
            support_role_id: support.id.get() as i64,
            log_channel_id: logs.as_ref().map(|c| c.id.get() as i64),
        },
    )
    .await?;

    let embed = serenity::CreateEmbed::new()
        .title("Support")
        .description("Press the button below to open a private ticket with the staff.")
        .color(serenity::Color::DARK_RED);
    let open = serenity::CreateActionRow::Buttons(vec![
        serenity::CreateButton::new(OPEN_BUTTON)
            .label("Open ticket")
            .emoji('🎫')
            .style(serenity::ButtonStyle::Primary),
    ]);
    ctx.channel_id()
        .send_message(
            ctx.http(),
            serenity::CreateMessage::new().embed(embed).components(vec![open]),
        )
        .await?;
    ctx.send(
        poise::CreateReply::default()
            .content("Ticket panel posted.")
            .ephemeral(true),
    )
    .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_names() {
        assert_eq!(ticket_channel_name("Some.User"), "ticket-some-user");
        assert_eq!(ticket_channel_name("__"), "ticket-member");
    }

    #[test]
    fn transcript() {
        let meta = TranscriptMeta {
            channel_name: "ticket-ann".into(),
            guild_name: "Rustaceans".into(),
            opener: "ann (1)".into(),
            opened_at: 0,
            closed_by: "mod (2)".into(),
            closed_at: 3600,
        };
        let lines = vec![
            TranscriptLine {
                timestamp: 60,
                author: "ann".into(),
                content: "help".into(),
                attachments: vec!["https://cdn.example/a.png".into()],
            },
            TranscriptLine {
                timestamp: 120,
                author: "mod".into(),
                content: "on it".into(),
                attachments: vec![],
            },
        ];
        let text = render_transcript(&meta, &lines);
        assert!(text.starts_with("Transcript of #ticket-ann\nServer: Rustaceans\n"));
        assert!(text.contains("Opened by: ann (1) at 1970-01-01 00:00:00 UTC"));
        assert!(text.contains("Closed by: mod (2) at 1970-01-01 01:00:00 UTC"));
        assert!(text.contains("Messages: 2"));
        assert!(text.contains(
            "[1970-01-01 00:01:00 UTC] ann: help\n    attachment: https://cdn.example/a.png\n[1970-01-01 00:02:00 UTC] mod: on it\n"
        ));
    }

    #[tokio::test]
    async fn one_ticket_per_member() {
        let pool = db::test_pool().await;
        assert_eq!(config(&pool, 1).await.unwrap(), None);
        save_config(
            &pool,
            1,
            TicketConfig {
                category_id: 2,
                support_role_id: 3,
                log_channel_id: None,
            },
        )
        .await
        .unwrap();
        assert_eq!(config(&pool, 1).await.unwrap().unwrap().support_role_id, 3);

        let t = Ticket {
            channel_id: 10,
            guild_id: 1,
            opener_id: 7,
            opened_at: 100,
        };
        insert_ticket(&pool, &t).await.unwrap();
        assert_eq!(open_ticket_of(&pool, 1, 7).await.unwrap(), Some(10));
        assert_eq!(ticket(&pool, 10).await.unwrap(), Some(t));
        assert!(delete_ticket(&pool, 10).await.unwrap());
        assert_eq!(open_ticket_of(&pool, 1, 7).await.unwrap(), None);
    }
}
