use poise::serenity_prelude::{self as serenity, Mentionable};
use sqlx::SqlitePool;
use tracing::{debug, info, warn};

use crate::{Context, Data, Error};

#[derive(sqlx::FromRow, Debug, Clone, Copy, PartialEq, Eq)]
pub struct Hub {
    pub category_id: i64,
    pub hub_channel_id: i64,
}

pub async fn hub(pool: &SqlitePool, guild_id: u64) -> Result<Option<Hub>, sqlx::Error> {
    sqlx::query_as("SELECT category_id, hub_channel_id FROM voicemaster_config WHERE guild_id = ?")
        .bind(guild_id as i64)
        .fetch_optional(pool)
        .await
}

pub async fn save_hub(pool: &SqlitePool, guild_id: u64, hub: Hub) -> Result<(), sqlx::Error> {
    sqlx::query(
        "INSERT INTO voicemaster_config (guild_id, category_id, hub_channel_id) VALUES (?, ?, ?)
         ON CONFLICT (guild_id) DO UPDATE SET category_id = excluded.category_id, hub_channel_id = excluded.hub_channel_id",
    )
    .bind(guild_id as i64)
    .bind(hub.category_id)
    .bind(hub.hub_channel_id)
    .execute(pool)
    .await?;
    Ok(())
}

/// Forgets the hub and every temporary channel; returns the channels that were tracked.
pub async fn clear(pool: &SqlitePool, guild_id: u64) -> Result<Vec<u64>, sqlx::Error> {
    let mut tx = pool.begin().await?;
    let channels: Vec<i64> =
        sqlx::query_scalar("SELECT channel_id FROM voicemaster_channels WHERE guild_id = ?")
            .bind(guild_id as i64)
            .fetch_all(&mut *tx)
            .await?;
    sqlx::query("DELETE FROM voicemaster_channels WHERE guild_id = ?")
        .bind(guild_id as i64)
        .execute(&mut *tx)
        .await?;
    sqlx::query("DELETE FROM voicemaster_config WHERE guild_id = ?")
        .bind(guild_id as i64)
        .execute(&mut *tx)
        .await?;
    tx.commit().await?;
    Ok(channels.into_iter().map(|id| id as u64).collect())
}

pub async fn track(
    pool: &SqlitePool,
    guild_id: u64,
    channel_id: u64,
    owner_id: u64,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        "INSERT INTO voicemaster_channels (channel_id, guild_id, owner_id) VALUES (?, ?, ?)
         ON CONFLICT (channel_id) DO UPDATE SET owner_id = excluded.owner_id",
    )
    .bind(channel_id as i64)
    .bind(guild_id as i64)
    .bind(owner_id as i64)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn owner_of(pool: &SqlitePool, channel_id: u64) -> Result<Option<u64>, sqlx::Error> {
    let owner: Option<i64> =
        sqlx::query_scalar("SELECT owner_id FROM voicemaster_channels WHERE channel_id = ?")
            .bind(channel_id as i64)
            .fetch_optional(pool)
            .await?;
    Ok(owner.map(|id| id as u64))
}

pub async fn untrack(pool: &SqlitePool, channel_id: u64) -> Result<bool, sqlx::Error> {
    let result = sqlx::query("DELETE FROM voicemaster_channels WHERE channel_id = ?")
        .bind(channel_id as i64)
        .execute(pool)
        .await?;
    Ok(result.rows_affected() > 0)
}

/// Channel left and channel joined, ignoring mute/deafen updates that keep the channel.
pub fn transition(
    old: Option<serenity::ChannelId>,
    new: Option<serenity::ChannelId>,
) -> (Option<serenity::ChannelId>, Option<serenity::ChannelId>) {
    if old == new {
        return (None, None);
    }
    (old, new)
}

pub fn channel_name(display_name: &str) -> String {
    let name = format!("{}'s channel", display_name);
    name.chars().take(100).collect()
}

fn occupants(ctx: &serenity::Context, guild_id: serenity::GuildId, channel_id: serenity::ChannelId) -> Vec<serenity::UserId> {
    guild_id
        .to_guild_cached(&ctx.cache)
        .map(|guild| {
            guild
                .voice_states
                .values()
                .filter(|vs| vs.channel_id == Some(channel_id))
                .map(|vs| vs.user_id)
                .collect()
        })
        .unwrap_or_default()
}

pub async fn on_voice_state_update(
    ctx: &serenity::Context,
    data: &Data,
    old: Option<&serenity::VoiceState>,
    new: &serenity::VoiceState,
) -> Result<(), Error> {
    let Some(guild_id) = new.guild_id else {
        return Ok(());
    };
    let (left, joined) = transition(old.and_then(|o| o.channel_id), new.channel_id);
    if left.is_none() && joined.is_none() {
        return Ok(());
    }
    let pool = &data.db_pool;

    if let Some(left) = left {
        if owner_of(pool, left.get()).await?.is_some() && occupants(ctx, guild_id, left).is_empty() {
            debug!(guild_id = %guild_id, channel_id = %left, "deleting empty voice channel");
            untrack(pool, left.get()).await?;
            if let Err(e) = left.delete(&ctx.http).await {
                warn!(guild_id = %guild_id, channel_id = %left, "failed to delete voice channel: {e}");
            }
        }
    }

    let Some(joined) = joined else {
        return Ok(());
    };
    let Some(hub) = hub(pool, guild_id.get()).await? else {
        return Ok(());
    };
    if joined.get() != hub.hub_channel_id as u64 {
        return Ok(());
    }

    let display_name = match &new.member {
        Some(member) => member.display_name().to_string(),
        None => new.user_id.to_user(ctx).await?.name,
    };
    let channel = guild_id
        .create_channel(
            &ctx.http,
            serenity::CreateChannel::new(channel_name(&display_name))
                .kind(serenity::ChannelType::Voice)
                .category(serenity::ChannelId::new(hub.category_id as u64))
                .permissions(vec![serenity::PermissionOverwrite {
                    allow: serenity::Permissions::CONNECT | serenity::Permissions::MOVE_MEMBERS,
                    deny: serenity::Permissions::empty(),
                    kind: serenity::PermissionOverwriteType::Member(new.user_id),
                }]),
        )
        .await?;
    track(pool, guild_id.get(), channel.id.get(), new.user_id.get()).await?;
    info!(guild_id = %guild_id, channel_id = %channel.id, owner_id = %new.user_id, "created voice channel");

    if let Err(e) = guild_id.move_member(&ctx.http, new.user_id, channel.id).await {
        warn!(guild_id = %guild_id, "failed to move member, removing channel: {e}");
        untrack(pool, channel.id.get()).await?;
        channel.id.delete(&ctx.http).await?;
    }
    Ok(())
}

/// Temporary voice channels created on demand.
#[poise::command(
    slash_command,
    prefix_command,
    guild_only,
    required_permissions = "MANAGE_GUILD",
    subcommands("setup", "reset"),
    subcommand_required,
    aliases("vm")
)]
pub async fn voicemaster(_ctx: Context<'_>) -> Result<(), Error> {
    Ok(())
}

/// Create the category and the hub channel.
#[poise::command(slash_command, prefix_command, guild_only, required_permissions = "MANAGE_GUILD")]
pub async fn setup(ctx: Context<'_>) -> Result<(), Error> {
    let guild_id = ctx.guild_id().ok_or_else(|| anyhow::anyhow!("guild only"))?;
    let pool = &ctx.data().db_pool;
    if hub(pool, guild_id.get()).await?.is_some() {
        anyhow::bail!("Voicemaster is already set up. Use `voicemaster reset` first.");
    }
    let category = guild_id
        .create_channel(
            ctx.http(),
            serenity::CreateChannel::new("Voice Channels").kind(serenity::ChannelType::Category),
        )
        .await?;
    let hub_channel = guild_id
        .create_channel(
            ctx.http(),
            serenity::CreateChannel::new("Join to Create")
                .kind(serenity::ChannelType::Voice)
                .category(category.id),
        )
        .await?;
    save_hub(
        pool,
        guild_id.get(),
        Hub {
            category_id: category.id.get() as i64,
            hub_channel_id: hub_channel.id.get() as i64,
        },
    )
    .await?;
    ctx.say(format!(
        "Join {} to get your own voice channel.",
        hub_channel.mention()
    ))
    .await?;
    Ok(())
}

/// Delete the hub, the category and every temporary channel.
#[poise::command(slash_command, prefix_command, guild_only, required_permissions = "MANAGE_GUILD")]
pub async fn reset(ctx: Context<'_>) -> Result<(), Error> {
    let guild_id = ctx.guild_id().ok_or_else(|| anyhow::anyhow!("guild only"))?;
    let pool = &ctx.data().db_pool;
    let Some(config) = hub(pool, guild_id.get()).await? else {
        anyhow::bail!("Voicemaster is not set up.");
    };
    let mut channels = clear(pool, guild_id.get()).await?;
    channels.push(config.hub_channel_id as u64);
    channels.push(config.category_id as u64);
    for channel in channels {
        if let Err(e) = serenity::ChannelId::new(channel).delete(ctx.http()).await {
            warn!(guild_id = %guild_id, channel_id = channel, "failed to delete voicemaster channel: {e}");
        }
    }
    ctx.say("Voicemaster has been reset.").await?;
    Ok(())
}

/// The temporary channel the author is in, and its owner.
async fn current_channel(ctx: Context<'_>) -> Result<(serenity::ChannelId, u64), Error> {
    let guild_id = ctx.guild_id().ok_or_else(|| anyhow::anyhow!("guild only"))?;
    let channel = ctx
        .guild()
        .and_then(|guild| guild.voice_states.get(&ctx.author().id).and_then(|vs| vs.channel_id));
    let Some(channel) = channel else {
        anyhow::bail!("Join your voice channel first.");
    };
    let Some(owner) = owner_of(&ctx.data().db_pool, channel.get()).await? else {
        anyhow::bail!("{} is not a temporary channel.", channel.mention());
    };
    debug!(guild_id = %guild_id, channel_id = %channel, owner, "voice command");
    Ok((channel, owner))
}

async fn owned_channel(ctx: Context<'_>) -> Result<serenity::ChannelId, Error> {
    let (channel, owner) = current_channel(ctx).await?;
    if owner != ctx.author().id.get() {
        anyhow::bail!("Only <@{}> can manage this channel.", owner);
    }
    Ok(channel)
}

/// Manage your temporary voice channel.
#[poise::command(
    slash_command,
    prefix_command,
    guild_only,
    subcommands("lock", "unlock", "limit", "rename", "claim"),
    subcommand_required,
    aliases("vc")
)]
pub async fn voice(_ctx: Context<'_>) -> Result<(), Error> {
    Ok(())
}

/// Stop others from joining.
#[poise::command(slash_command, prefix_command, guild_only)]
pub async fn lock(ctx: Context<'_>) -> Result<(), Error> {
    let guild_id = ctx.guild_id().ok_or_else(|| anyhow::anyhow!("guild only"))?;
    let channel = owned_channel(ctx).await?;
    channel
        .create_permission(
            ctx.http(),
            serenity::PermissionOverwrite {
                allow: serenity::Permissions::empty(),
                deny: serenity::Permissions::CONNECT,
                kind: serenity::PermissionOverwriteType::Role(guild_id.everyone_role()),
            },
        )
        .await?;
    ctx.say("🔒 Your channel is locked.").await?;
    Ok(())
}

/// Let anyone join again.
#[poise::command(slash_command, prefix_command, guild_only)]
pub async fn unlock(ctx: Context<'_>) -> Result<(), Error> {
    let guild_id = ctx.guild_id().ok_or_else(|| anyhow::anyhow!("guild only"))?;
    let channel = owned_channel(ctx).await?;
    channel
        .delete_permission(
            ctx.http(),
            serenity::PermissionOverwriteType::Role(guild_id.everyone_role()),
        )
        .await?;
    ctx.say("🔓 Your channel is unlocked.").await?;
    Ok(())
}

/// Cap how many people can join; 0 removes the cap.
#[poise::command(slash_command, prefix_command, guild_only)]
pub async fn limit(
    ctx: Context<'_>,
    #[description = "Member limit"]
    #[max = 99]
    limit: u32,
) -> Result<(), Error> {
    let channel = owned_channel(ctx).await?;
    channel
        .edit(ctx.http(), serenity::EditChannel::new().user_limit(limit.min(99)))
        .await?;
    let reply = if limit == 0 {
        "Member limit removed.".to_string()
    } else {
        format!("Member limit set to {}.", limit.min(99))
    };
    ctx.say(reply).await?;
    Ok(())
}

/// Rename your channel.
#[poise::command(slash_command, prefix_command, guild_only)]
pub async fn rename(
    ctx: Context<'_>,
    #[description = "New name"]
    #[rest]
    name: String,
) -> Result<(), Error> {
    let name = name.trim();
    if name.is_empty() || name.chars().count() > 100 {
        anyhow::bail!("Channel names must be 1 to 100 characters.");
    }
    let channel = owned_channel(ctx).await?;
    channel
        .edit(ctx.http(), serenity::EditChannel::new().name(name))
        .await?;
    ctx.say(format!("Renamed to **{}**.", name)).await?;
    Ok(())
}

/// Take over a channel whose owner left.
#[poise::command(slash_command, prefix_command, guild_only)]
pub async fn claim(ctx: Context<'_>) -> Result<(), Error> {
    let guild_id = ctx.guild_id().ok_or_else(|| anyhow::anyhow!("guild only"))?;
    let (channel, owner) = current_channel(ctx).await?;
    if owner == ctx.author().id.get() {
        anyhow::bail!("You already own this channel.");
    }
    let inside = occupants(ctx.serenity_context(), guild_id, channel);
    if inside.iter().any(|id| id.get() == owner) {
        anyhow::bail!("<@{}> is still in the channel.", owner);
    }
    track(&ctx.data().db_pool, guild_id.get(), channel.get(), ctx.author().id.get()).await?;
    ctx.say(format!("{} now owns {}.", ctx.author().mention(), channel.mention()))
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;

    #[test]
    fn transitions() {
        let a = Some(serenity::ChannelId::new(1));
        let b = Some(serenity::ChannelId::new(2));
        assert_eq!(transition(a, a), (None, None));
        assert_eq!(transition(None, a), (None, a));
        assert_eq!(transition(a, None), (a, None));
        assert_eq!(transition(a, b), (a, b));
    }

    #[test]
    fn names() {
        assert_eq!(channel_name("Ann"), "Ann's channel");
        assert_eq!(channel_name(&"x".repeat(200)).chars().count(), 100);
    }

    #[tokio::test]
    async fn tracking() {
        let pool = db::test_pool().await;
        save_hub(&pool, 1, Hub { category_id: 10, hub_channel_id: 11 }).await.unwrap();
        assert_eq!(
            hub(&pool, 1).await.unwrap(),
            Some(Hub { category_id: 10, hub_channel_id: 11 })
        );

        track(&pool, 1, 100, 5).await.unwrap();
        track(&pool, 1, 101, 6).await.unwrap();
        assert_eq!(owner_of(&pool, 100).await.unwrap(), Some(5));
        track(&pool, 1, 100, 7).await.unwrap();
        assert_eq!(owner_of(&pool, 100).await.unwrap(), Some(7));

        assert!(untrack(&pool, 101).await.unwrap());
        assert_eq!(owner_of(&pool, 101).await.unwrap(), None);

        assert_eq!(clear(&pool, 1).await.unwrap(), vec![100]);
        assert_eq!(hub(&pool, 1).await.unwrap(), None);
    }
}
