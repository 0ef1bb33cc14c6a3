use poise::serenity_prelude::{self as serenity, Mentionable};
use sqlx::SqlitePool;
use tracing::{debug, warn};

use crate::{Context, Data, Error, util};

/// Custom emojis are keyed by id so renames keep working.
pub fn emoji_key(reaction: &serenity::ReactionType) -> String {
    match reaction {
        serenity::ReactionType::Custom { id, .. } => id.get().to_string(),
        serenity::ReactionType::Unicode(s) => s.clone(),
        other => other.to_string(),
    }
}

#[derive(sqlx::FromRow, Debug, Clone, PartialEq, Eq)]
pub struct ReactionRole {
    pub channel_id: i64,
    pub message_id: i64,
    pub emoji: String,
    pub role_id: i64,
}

pub async fn bind(
    pool: &SqlitePool,
    guild_id: u64,
    role: &ReactionRole,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        "INSERT INTO reaction_roles (guild_id, channel_id, message_id, emoji, role_id) VALUES (?, ?, ?, ?, ?)
         ON CONFLICT (message_id, emoji) DO UPDATE SET role_id = excluded.role_id",
    )
    .bind(guild_id as i64)
    .bind(role.channel_id)
    .bind(role.message_id)
    .bind(&role.emoji)
    .bind(role.role_id)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn unbind(
    pool: &SqlitePool,
    guild_id: u64,
    message_id: u64,
    emoji: &str,
) -> Result<bool, sqlx::Error> {
    let result =
        sqlx::query("DELETE FROM reaction_roles WHERE guild_id = ? AND message_id = ? AND emoji = ?")
            .bind(guild_id as i64)
            .bind(message_id as i64)
            .bind(emoji)
            .execute(pool)
            .await?;
    Ok(result.rows_affected() > 0)
}

pub async fn unbind_message(
    pool: &SqlitePool,
    guild_id: u64,
    message_id: u64,
) -> Result<u64, sqlx::Error> {
    let result = sqlx::query("DELETE FROM reaction_roles WHERE guild_id = ? AND message_id = ?")
        .bind(guild_id as i64)
        .bind(message_id as i64)
        .execute(pool)
        .await?;
    Ok(result.rows_affected())
}

pub async fn role_for(
    pool: &SqlitePool,
    guild_id: u64,
    message_id: u64,
    emoji: &str,
) -> Result<Option<u64>, sqlx::Error> {
    let role: Option<i64> = sqlx::query_scalar(
        "SELECT role_id FROM reaction_roles WHERE guild_id = ? AND message_id = ? AND emoji = ?",
    )
    .bind(guild_id as i64)
    .bind(message_id as i64)
    .bind(emoji)
    .fetch_optional(pool)
    .await?;
    Ok(role.map(|id| id as u64))
}

pub async fn list(pool: &SqlitePool, guild_id: u64) -> Result<Vec<ReactionRole>, sqlx::Error> {
    sqlx::query_as(
        "SELECT channel_id, message_id, emoji, role_id FROM reaction_roles
         WHERE guild_id = ? ORDER BY message_id, emoji",
    )
    .bind(guild_id as i64)
    .fetch_all(pool)
    .await
}

/// Grants or revokes the role bound to a reaction.
pub async fn on_reaction(
    ctx: &serenity::Context,
    data: &Data,
    reaction: &serenity::Reaction,
    added: bool,
) -> Result<(), Error> {
    let (Some(guild_id), Some(user_id)) = (reaction.guild_id, reaction.user_id) else {
        return Ok(());
    };
    let key = emoji_key(&reaction.emoji);
    let Some(role_id) = role_for(&data.db_pool, guild_id.get(), reaction.message_id.get(), &key).await?
    else {
        return Ok(());
    };
    let bot_id = ctx.cache.current_user().id;
    if user_id == bot_id || user_id.to_user(ctx).await?.bot {
        return Ok(());
    }

    let role_id = serenity::RoleId::new(role_id);
    let result = if added {
        ctx.http
            .add_member_role(guild_id, user_id, role_id, Some("Reaction role"))
            .await
    } else {
        ctx.http
            .remove_member_role(guild_id, user_id, role_id, Some("Reaction role"))
            .await
    };
    match result {
        Ok(()) => debug!(guild_id = %guild_id, user_id = %user_id, role_id = %role_id, added, "reaction role"),
        Err(e) => warn!(guild_id = %guild_id, role_id = %role_id, "failed to update reaction role: {e}"),
    }
    Ok(())
}

fn parse_emoji(input: &str) -> Result<serenity::ReactionType, Error> {
    input
        .trim()
        .parse::<serenity::ReactionType>()
        .map_err(|_| anyhow::anyhow!("`{}` is not an emoji.", input))
}

/// Roles members pick by reacting to a message.
#[poise::command(
    slash_command,
    prefix_command,
    guild_only,
    required_permissions = "MANAGE_ROLES",
    subcommands("add", "remove", "list_cmd", "clear"),
    subcommand_required,
    aliases("rr")
)]
pub async fn reactionrole(_ctx: Context<'_>) -> Result<(), Error> {
    Ok(())
}

/// Bind an emoji on a message to a role.
#[poise::command(slash_command, prefix_command, guild_only, required_permissions = "MANAGE_ROLES")]
pub async fn add(
    ctx: Context<'_>,
    #[description = "Channel of the message"] channel: serenity::GuildChannel,
    #[description = "Message id"] message_id: serenity::MessageId,
    #[description = "Emoji"] emoji: String,
    #[description = "Role to give"] role: serenity::Role,
) -> Result<(), Error> {
    let guild_id = ctx.guild_id().ok_or_else(|| anyhow::anyhow!("guild only"))?;
    if role.managed || role.id.get() == guild_id.get() {
        anyhow::bail!("That role can't be given out.");
    }
    let roles = util::guild_roles(ctx.serenity_context(), guild_id).await?;
    let bot_id = ctx.cache().current_user().id;
    let bot_top = util::member_top_position(ctx.serenity_context(), guild_id, &roles, bot_id)
        .await
        .unwrap_or(0);
    if !util::outranks(bot_top, role.position) {
        anyhow::bail!("{} is above my highest role.", role.mention());
    }

    let reaction = parse_emoji(&emoji)?;
    channel
        .id
        .create_reaction(ctx.http(), message_id, reaction.clone())
        .await?;
    bind(
        &ctx.data().db_pool,
        guild_id.get(),
        &ReactionRole {
            channel_id: channel.id.get() as i64,
            message_id: message_id.get() as i64,
            emoji: emoji_key(&reaction),
            role_id: role.id.get() as i64,
        },
    )
    .await?;
    ctx.say(format!(
        "Reacting with {} on that message now gives {}.",
        reaction,
        role.mention()
    ))
    .await?;
    Ok(())
}

/// Unbind one emoji from a message.
#[poise::command(slash_command, prefix_command, guild_only, required_permissions = "MANAGE_ROLES")]
pub async fn remove(
    ctx: Context<'_>,
    #[description = "Message id"] message_id: serenity::MessageId,
    #[description = "Emoji"] emoji: String,
) -> Result<(), Error> {
    let guild_id = ctx.guild_id().ok_or_else(|| anyhow::anyhow!("guild only"))?;
    let key = emoji_key(&parse_emoji(&emoji)?);
    let reply = if unbind(&ctx.data().db_pool, guild_id.get(), message_id.get(), &key).await? {
        "Reaction role removed."
    } else {
        "No reaction role uses that emoji on that message."
    };
    ctx.say(reply).await?;
    Ok(())
}

/// Show every reaction role in this server.
#[poise::command(
    slash_command,
    prefix_command,
    guild_only,
    required_permissions = "MANAGE_ROLES",
    rename = "list"
)]
pub async fn list_cmd(ctx: Context<'_>) -> Result<(), Error> {
    let guild_id = ctx.guild_id().ok_or_else(|| anyhow::anyhow!("guild only"))?;
    let bindings = list(&ctx.data().db_pool, guild_id.get()).await?;
    let description = if bindings.is_empty() {
        "No reaction roles set up.".to_string()
    } else {
        bindings
            .iter()
            .map(|b| {
                let emoji = match b.emoji.parse::<u64>() {
                    Ok(id) => format!("<:_:{}>", id),
                    Err(_) => b.emoji.clone(),
                };
                format!(
                    "{} -> <@&{}> on https://discord.com/channels/{}/{}/{}",
                    emoji, b.role_id, guild_id, b.channel_id, b.message_id
                )
            })
            .collect::<Vec<_>>()
            .join("\n")
    };
    let embed = serenity::CreateEmbed::new()
        .title("Reaction roles")
        .description(description)
        .color(serenity::Color::DARK_RED);
    ctx.send(poise::CreateReply::default().embed(embed)).await?;
    Ok(())
}

/// Remove every reaction role from a message.
#[poise::command(slash_command, prefix_command, guild_only, required_permissions = "MANAGE_ROLES")]
pub async fn clear(
    ctx: Context<'_>,
    #[description = "Message id"] message_id: serenity::MessageId,
) -> Result<(), Error> {
    let guild_id = ctx.guild_id().ok_or_else(|| anyhow::anyhow!("guild only"))?;
    let removed = unbind_message(&ctx.data().db_pool, guild_id.get(), message_id.get()).await?;
    ctx.say(format!("Removed {} reaction roles.", removed)).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;

    #[test]
    fn keys() {
        assert_eq!(emoji_key(&serenity::ReactionType::Unicode("👍".into())), "👍");
        let custom = parse_emoji("<:pepe:123456789012345678>").unwrap();
        assert_eq!(emoji_key(&custom), "123456789012345678");
    }

    #[tokio::test]
    async fn bindings() {
        let pool = db::test_pool().await;
        let binding = |emoji: &str, role_id| ReactionRole {
            channel_id: 5,
            message_id: 50,
            emoji: emoji.to_string(),
            role_id,
        };
        bind(&pool, 1, &binding("👍", 7)).await.unwrap();
        bind(&pool, 1, &binding("👍", 8)).await.unwrap();
        bind(&pool, 1, &binding("123", 9)).await.unwrap();

        assert_eq!(role_for(&pool, 1, 50, "👍").await.unwrap(), Some(8));
        assert_eq!(role_for(&pool, 2, 50, "👍").await.unwrap(), None);
        assert_eq!(list(&pool, 1).await.unwrap().len(), 2);

        assert!(unbind(&pool, 1, 50, "👍").await.unwrap());
        assert!(!unbind(&pool, 1, 50, "👍").await.unwrap());
        assert_eq!(unbind_message(&pool, 1, 50).await.unwrap(), 1);
        assert!(list(&pool, 1).await.unwrap().is_empty());
    }
}
