use std::time::Duration;

use poise::serenity_prelude::{self as serenity, GetMessages, Mentionable};
use sqlx::SqlitePool;
use tracing::info;

use crate::{Context, Error, db, util};

/// Discord rejects timeouts longer than 28 days.
pub const MAX_TIMEOUT: Duration = Duration::from_secs(28 * 86_400);

/// Bulk deletes reject messages older than two weeks. Kept an hour short.
pub const BULK_DELETE_MAX_AGE: i64 = 14 * 86_400 - 3600;

const PURGE_MAX_PAGES: usize = 10;

/// Picks up to `limit` messages by `target` that can still be bulk deleted.
/// `page` holds `(message, author, created_at)` newest first.
pub fn purge_targets(
    page: &[(serenity::MessageId, serenity::UserId, i64)],
    target: serenity::UserId,
    limit: usize,
    now: i64,
) -> Vec<serenity::MessageId> {
    page.iter()
        .filter(|(_, author, created_at)| *author == target && now - created_at <= BULK_DELETE_MAX_AGE)
        .map(|(id, _, _)| *id)
        .take(limit)
        .collect()
}

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum HierarchyError {
    #[error("You can't moderate yourself.")]
    SelfTarget,
    #[error("The server owner can't be moderated.")]
    TargetIsOwner,
    #[error("Your highest role must be above theirs.")]
    ModeratorTooLow,
    #[error("My highest role must be above theirs.")]
    BotTooLow,
}

/// Positions of the moderator, the bot and the target. The owner bypasses
/// the moderator comparison; nobody can act on the owner.
#[derive(Debug, Clone, Copy)]
pub struct Ranks {
    pub moderator: u16,
    pub bot: u16,
    pub target: u16,
    pub moderator_is_owner: bool,
    pub target_is_owner: bool,
    pub self_target: bool,
}

pub fn check_hierarchy(ranks: Ranks) -> Result<(), HierarchyError> {
    if ranks.self_target {
        return Err(HierarchyError::SelfTarget);
    }
    if ranks.target_is_owner {
        return Err(HierarchyError::TargetIsOwner);
    }
    if !ranks.moderator_is_owner && !util::outranks(ranks.moderator, ranks.target) {
        return Err(HierarchyError::ModeratorTooLow);
    }
    if !util::outranks(ranks.bot, ranks.target) {
        return Err(HierarchyError::BotTooLow);
    }
    Ok(())
}

/// Rejects the action unless both the invoker and the bot outrank `target`.
/// Users who are not members have no roles and only fail on self or owner.
async fn ensure_can_moderate(ctx: Context<'_>, target: serenity::UserId) -> Result<(), Error> {
    let guild_id = ctx.guild_id().ok_or_else(|| anyhow::anyhow!("guild only"))?;
    let sctx = ctx.serenity_context();
    let owner = util::guild_owner(sctx, guild_id).await?;
    let roles = util::guild_roles(sctx, guild_id).await?;
    let bot_id = ctx.cache().current_user().id;
    let ranks = Ranks {
        moderator: util::member_top_position(sctx, guild_id, &roles, ctx.author().id)
            .await
            .unwrap_or(0),
        bot: util::member_top_position(sctx, guild_id, &roles, bot_id)
            .await
            .unwrap_or(0),
        target: util::member_top_position(sctx, guild_id, &roles, target)
            .await
            .unwrap_or(0),
        moderator_is_owner: ctx.author().id == owner,
        target_is_owner: target == owner,
        self_target: target == ctx.author().id,
    };
    check_hierarchy(ranks)?;
    Ok(())
}

#[derive(sqlx::FromRow, Debug, Clone, PartialEq, Eq)]
pub struct ModCase {
    pub id: i64,
    pub user_id: i64,
    pub moderator_id: i64,
    pub action: String,
    pub reason: Option<String>,
    pub created_at: i64,
}

pub async fn record_case(
    pool: &SqlitePool,
    guild_id: u64,
    user_id: u64,
    moderator_id: u64,
    action: &str,
    reason: Option<&str>,
) -> Result<i64, sqlx::Error> {
    sqlx::query_scalar(
        "INSERT INTO mod_cases (guild_id, user_id, moderator_id, action, reason, created_at)
         VALUES (?, ?, ?, ?, ?, ?) RETURNING id",
    )
    .bind(guild_id as i64)
    .bind(user_id as i64)
    .bind(moderator_id as i64)
    .bind(action)
    .bind(reason)
    .bind(db::now())
    .fetch_one(pool)
    .await
}

/// Cases for a member, newest first, optionally filtered by action.
pub async fn cases_for(
    pool: &SqlitePool,
    guild_id: u64,
    user_id: u64,
    action: Option<&str>,
) -> Result<Vec<ModCase>, sqlx::Error> {
    sqlx::query_as(
        "SELECT id, user_id, moderator_id, action, reason, created_at FROM mod_cases
         WHERE guild_id = ? AND user_id = ? AND (? IS NULL OR action = ?)
         ORDER BY id DESC",
    )
    .bind(guild_id as i64)
    .bind(user_id as i64)
    .bind(action)
    .bind(action)
    .fetch_all(pool)
    .await
}

pub async fn clear_warnings(pool: &SqlitePool, guild_id: u64, user_id: u64) -> Result<u64, sqlx::Error> {
    let result =
        sqlx::query("DELETE FROM mod_cases WHERE guild_id = ? AND user_id = ? AND action = 'warn'")
            .bind(guild_id as i64)
            .bind(user_id as i64)
            .execute(pool)
            .await?;
    Ok(result.rows_affected())
}

pub fn clamp_timeout(requested: Duration) -> Duration {
    requested.min(MAX_TIMEOUT)
}

async fn log_case(
    ctx: Context<'_>,
    user: &serenity::User,
    action: &str,
    reason: Option<&str>,
) -> Result<i64, Error> {
    let guild_id = ctx.guild_id().ok_or_else(|| anyhow::anyhow!("guild only"))?;
    let case = record_case(
        &ctx.data().db_pool,
        guild_id.get(),
        user.id.get(),
        ctx.author().id.get(),
        action,
        reason,
    )
    .await?;
    info!(guild_id = %guild_id, user_id = %user.id, moderator_id = %ctx.author().id, action, case, "moderation action");
    Ok(case)
}

fn format_case(case: &ModCase) -> String {
    format!(
        "`#{}` **{}** by <@{}> <t:{}:R>: {}",
        case.id,
        case.action,
        case.moderator_id,
        case.created_at,
        case.reason.as_deref().unwrap_or("no reason")
    )
}

/// Ban a user from the server
#[poise::command(slash_command, prefix_command, guild_only, required_permissions = "BAN_MEMBERS")]
pub async fn ban(
    ctx: Context<'_>,
    #[description = "User to ban"] user: serenity::User,
    #[description = "Reason for ban"]
    #[rest]
    reason: Option<String>,
) -> Result<(), Error> {
    let guild_id = ctx.guild_id().ok_or_else(|| anyhow::anyhow!("guild only"))?;
    ensure_can_moderate(ctx, user.id).await?;
    let reason = reason.unwrap_or_else(|| "No reason provided".to_string());

    guild_id
        .ban_with_reason(ctx.http(), user.id, 0, &reason)
        .await?;
    let case = log_case(ctx, &user, "ban", Some(&reason)).await?;
    ctx.say(format!("Banned {} | Reason: {} (case #{})", user.tag(), reason, case))
        .await?;
    Ok(())
}

/// Unban a previously banned user
#[poise::command(slash_command, prefix_command, guild_only, required_permissions = "BAN_MEMBERS")]
pub async fn unban(
    ctx: Context<'_>,
    #[description = "User to unban"] user: serenity::User,
) -> Result<(), Error> {
    let guild_id = ctx.guild_id().ok_or_else(|| anyhow::anyhow!("guild only"))?;
    guild_id.unban(ctx.http(), user.id).await?;
    log_case(ctx, &user, "unban", None).await?;
    ctx.say(format!("Unbanned {}", user.tag())).await?;
    Ok(())
}

/// Kick a user from the server
#[poise::command(slash_command, prefix_command, guild_only, required_permissions = "KICK_MEMBERS")]
pub async fn kick(
    ctx: Context<'_>,
    #[description = "User to kick"] user: serenity::User,
    #[description = "Reason for kick"]
    #[rest]
    reason: Option<String>,
) -> Result<(), Error> {
    let guild_id = ctx.guild_id().ok_or_else(|| anyhow::anyhow!("guild only"))?;
    ensure_can_moderate(ctx, user.id).await?;
    let reason = reason.unwrap_or_else(|| "No reason provided".to_string());

    guild_id
        .kick_with_reason(ctx.http(), user.id, &reason)
        .await?;
    let case = log_case(ctx, &user, "kick", Some(&reason)).await?;
    ctx.say(format!("Kicked {} | Reason: {} (case #{})", user.tag(), reason, case))
        .await?;
    Ok(())
}

/// Deletes a user's recent messages in this channel.
#[poise::command(
    slash_command,
    prefix_command,
    guild_only,
    required_permissions = "MANAGE_MESSAGES",
    aliases("clean", "clear", "bulkdel")
)]
pub async fn purge(
    ctx: Context<'_>,
    #[description = "Target user"] user: serenity::User,
    #[description = "Number of messages to delete"]
    #[min = 1]
    #[max = 100]
    mut amount: u8,
) -> Result<(), Error> {
    let channel_id = ctx.channel_id();
    let now = db::now();
    let mut total_deleted = 0usize;
    let mut last_message_id = serenity::MessageId::new(ctx.id());

    for _ in 0..PURGE_MAX_PAGES {
        if amount == 0 {
            break;
        }
        let page = channel_id
            .messages(ctx.http(), GetMessages::new().limit(100).before(last_message_id))
            .await?;
        let Some(oldest) = page.last() else {
            break;
        };
        last_message_id = oldest.id;
        let exhausted =
            page.len() < 100 || now - oldest.id.created_at().unix_timestamp() > BULK_DELETE_MAX_AGE;

        let page: Vec<_> = page
            .iter()
            .map(|msg| (msg.id, msg.author.id, msg.id.created_at().unix_timestamp()))
            .collect();
        let matching = purge_targets(&page, user.id, amount as usize, now);
        match matching.len() {
            0 => break,
            1 => channel_id.delete_message(ctx.http(), matching[0]).await?,
            _ => channel_id.delete_messages(ctx.http(), &matching).await?,
        }
        total_deleted += matching.len();
        amount = amount.saturating_sub(matching.len() as u8);

        if exhausted {
            break;
        }
    }

    log_case(ctx, &user, "purge", Some(&format!("{} messages", total_deleted))).await?;
    ctx.send(
        poise::CreateReply::default()
            .content(format!("Deleted {} messages from {}", total_deleted, user.name))
            .ephemeral(true),
    )
    .await?;
    Ok(())
}

/// Mute a member for a while, e.g. `10m`, `2h`, `1d`.
#[poise::command(
    slash_command,
    prefix_command,
    guild_only,
    required_permissions = "MODERATE_MEMBERS",
    aliases("mute")
)]
pub async fn timeout(
    ctx: Context<'_>,
    #[description = "Member to mute"] user: serenity::User,
    #[description = "Duration, e.g. 10m"] duration: String,
    #[description = "Reason"]
    #[rest]
    reason: Option<String>,
) -> Result<(), Error> {
    let guild_id = ctx.guild_id().ok_or_else(|| anyhow::anyhow!("guild only"))?;
    ensure_can_moderate(ctx, user.id).await?;
    let duration = clamp_timeout(util::parse_duration(&duration)?);
    if duration.is_zero() {
        anyhow::bail!("The duration must be longer than zero.");
    }
    let reason = reason.unwrap_or_else(|| "No reason provided".to_string());
    let until = serenity::Timestamp::from_unix_timestamp(db::now() + duration.as_secs() as i64)?;

    guild_id
        .edit_member(
            ctx.http(),
            user.id,
            serenity::EditMember::new()
                .disable_communication_until_datetime(until)
                .audit_log_reason(&reason),
        )
        .await?;
    let case = log_case(ctx, &user, "timeout", Some(&reason)).await?;
    ctx.say(format!(
        "Timed out {} for {} | Reason: {} (case #{})",
        user.mention(),
        util::humanize(duration),
        reason,
        case
    ))
    .await?;
    Ok(())
}

/// Lift a member's timeout.
#[poise::command(
    slash_command,
    prefix_command,
    guild_only,
    required_permissions = "MODERATE_MEMBERS",
    aliases("unmute")
)]
pub async fn untimeout(
    ctx: Context<'_>,
    #[description = "Member"] user: serenity::User,
) -> Result<(), Error> {
    let guild_id = ctx.guild_id().ok_or_else(|| anyhow::anyhow!("guild only"))?;
    guild_id
        .edit_member(
            ctx.http(),
            user.id,
            serenity::EditMember::new().enable_communication(),
        )
        .await?;
    log_case(ctx, &user, "untimeout", None).await?;
    ctx.say(format!("{} can talk again.", user.mention())).await?;
    Ok(())
}

/// Record a warning against a member.
#[poise::command(slash_command, prefix_command, guild_only, required_permissions = "MODERATE_MEMBERS")]
pub async fn warn(
    ctx: Context<'_>,
    #[description = "Member"] user: serenity::User,
    #[description = "Reason"]
    #[rest]
    reason: String,
) -> Result<(), Error> {
    ensure_can_moderate(ctx, user.id).await?;
    let case = log_case(ctx, &user, "warn", Some(&reason)).await?;
    ctx.say(format!("Warned {} | Reason: {} (case #{})", user.mention(), reason, case))
        .await?;
    Ok(())
}

/// List a member's warnings.
#[poise::command(slash_command, prefix_command, guild_only, required_permissions = "MODERATE_MEMBERS")]
pub async fn warnings(
    ctx: Context<'_>,
    #[description = "Member"] user: serenity::User,
) -> Result<(), Error> {
    let guild_id = ctx.guild_id().ok_or_else(|| anyhow::anyhow!("guild only"))?;
    let cases = cases_for(&ctx.data().db_pool, guild_id.get(), user.id.get(), Some("warn")).await?;
    send_cases(ctx, &user, "Warnings", &cases).await
}

/// Delete every warning of a member.
#[poise::command(slash_command, prefix_command, guild_only, required_permissions = "MODERATE_MEMBERS")]
pub async fn clearwarnings(
    ctx: Context<'_>,
    #[description = "Member"] user: serenity::User,
) -> Result<(), Error> {
    let guild_id = ctx.guild_id().ok_or_else(|| anyhow::anyhow!("guild only"))?;
    let removed = clear_warnings(&ctx.data().db_pool, guild_id.get(), user.id.get()).await?;
    log_case(ctx, &user, "clearwarnings", Some(&format!("{} removed", removed))).await?;
    ctx.say(format!("Removed {} warnings from {}.", removed, user.mention()))
        .await?;
    Ok(())
}

/// Every moderation case of a member.
#[poise::command(slash_command, prefix_command, guild_only, required_permissions = "MODERATE_MEMBERS")]
pub async fn modlogs(
    ctx: Context<'_>,
    #[description = "Member"] user: serenity::User,
) -> Result<(), Error> {
    let guild_id = ctx.guild_id().ok_or_else(|| anyhow::anyhow!("guild only"))?;
    let cases = cases_for(&ctx.data().db_pool, guild_id.get(), user.id.get(), None).await?;
    send_cases(ctx, &user, "Moderation history", &cases).await
}

async fn send_cases(
    ctx: Context<'_>,
    user: &serenity::User,
    title: &str,
    cases: &[ModCase],
) -> Result<(), Error> {
    let description = if cases.is_empty() {
        "Nothing on record.".to_string()
    } else {
        cases
            .iter()
            .take(15)
            .map(format_case)
            .collect::<Vec<_>>()
            .join("\n")
    };
    let embed = serenity::CreateEmbed::new()
        .author(serenity::CreateEmbedAuthor::new(&user.name).icon_url(user.face()))
        .title(title)
        .description(description)
        .footer(serenity::CreateEmbedFooter::new(format!("{} total", cases.len())))
        .color(serenity::Color::DARK_RED);
    ctx.send(poise::CreateReply::default().embed(embed)).await?;
    Ok(())
}

/// Set this channel's slowmode in seconds; 0 turns it off.
#[poise::command(slash_command, prefix_command, guild_only, required_permissions = "MANAGE_CHANNELS")]
pub async fn slowmode(
    ctx: Context<'_>,
    #[description = "Seconds between messages"]
    #[max = 21600]
    seconds: u16,
) -> Result<(), Error> {
    ctx.channel_id()
        .edit(
            ctx.http(),
            serenity::EditChannel::new().rate_limit_per_user(seconds.min(21_600)),
        )
        .await?;
    let reply = if seconds == 0 {
        "Slowmode disabled.".to_string()
    } else {
        format!("Slowmode set to {} seconds.", seconds)
    };
    ctx.say(reply).await?;
    Ok(())
}

/// Stop @everyone from talking in this channel.
#[poise::command(slash_command, prefix_command, guild_only, required_permissions = "MANAGE_CHANNELS")]
pub async fn lock(ctx: Context<'_>) -> Result<(), Error> {
    let guild_id = ctx.guild_id().ok_or_else(|| anyhow::anyhow!("guild only"))?;
    ctx.channel_id()
        .create_permission(
            ctx.http(),
            serenity::PermissionOverwrite {
                allow: serenity::Permissions::empty(),
                deny: serenity::Permissions::SEND_MESSAGES,
                kind: serenity::PermissionOverwriteType::Role(guild_id.everyone_role()),
            },
        )
        .await?;
    info!(guild_id = %guild_id, channel_id = %ctx.channel_id(), "channel locked");
    ctx.say("🔒 Channel locked.").await?;
    Ok(())
}

/// Let @everyone talk in this channel again.
#[poise::command(slash_command, prefix_command, guild_only, required_permissions = "MANAGE_CHANNELS")]
pub async fn unlock(ctx: Context<'_>) -> Result<(), Error> {
    let guild_id = ctx.guild_id().ok_or_else(|| anyhow::anyhow!("guild only"))?;
    ctx.channel_id()
        .delete_permission(
            ctx.http(),
            serenity::PermissionOverwriteType::Role(guild_id.everyone_role()),
        )
        .await?;
    info!(guild_id = %guild_id, channel_id = %ctx.channel_id(), "channel unlocked");
    ctx.say("🔓 Channel unlocked.").await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn purge_skips_other_authors_and_old_messages() {
        let target = serenity::UserId::new(7);
        let other = serenity::UserId::new(8);
        let now = 2_000_000;
        let msg = |id: u64, author, age: i64| (serenity::MessageId::new(id), author, now - age);
        let page = [
            msg(5, target, 10),
            msg(4, other, 20),
            msg(3, target, 30),
            msg(2, target, BULK_DELETE_MAX_AGE + 1),
            msg(1, target, 40),
        ];
        let ids = |ids: &[u64]| ids.iter().map(|&id| serenity::MessageId::new(id)).collect::<Vec<_>>();
        assert_eq!(purge_targets(&page, target, 100, now), ids(&[5, 3, 1]));
        assert_eq!(purge_targets(&page, target, 2, now), ids(&[5, 3]));
        assert!(purge_targets(&page, serenity::UserId::new(9), 100, now).is_empty());
    }

    fn ranks(moderator: u16, bot: u16, target: u16) -> Ranks {
        Ranks {
            moderator,
            bot,
            target,
            moderator_is_owner: false,
            target_is_owner: false,
            self_target: false,
        }
    }

    #[test]
    fn hierarchy() {
        assert_eq!(check_hierarchy(ranks(5, 9, 3)), Ok(()));
        assert_eq!(
            check_hierarchy(ranks(3, 9, 3)),
            Err(HierarchyError::ModeratorTooLow)
        );
        assert_eq!(check_hierarchy(ranks(5, 2, 3)), Err(HierarchyError::BotTooLow));
        assert_eq!(
            check_hierarchy(Ranks {
                moderator_is_owner: true,
                ..ranks(0, 9, 3)
            }),
            Ok(())
        );
        assert_eq!(
            check_hierarchy(Ranks {
                target_is_owner: true,
                ..ranks(10, 10, 0)
            }),
            Err(HierarchyError::TargetIsOwner)
        );
        assert_eq!(
            check_hierarchy(Ranks {
                self_target: true,
                ..ranks(5, 9, 5)
            }),
            Err(HierarchyError::SelfTarget)
        );
    }

    #[test]
    fn timeouts_are_capped() {
        assert_eq!(clamp_timeout(Duration::from_secs(60)), Duration::from_secs(60));
        assert_eq!(clamp_timeout(Duration::from_secs(40 * 86_400)), MAX_TIMEOUT);
    }

    #[tokio::test]
    async fn cases_are_recorded_and_filtered() {
        let pool = db::test_pool().await;
        let first = record_case(&pool, 1, 7, 2, "warn", Some("spam")).await.unwrap();
        let second = record_case(&pool, 1, 7, 2, "kick", None).await.unwrap();
        record_case(&pool, 1, 7, 2, "warn", Some("again")).await.unwrap();
        record_case(&pool, 2, 7, 2, "warn", None).await.unwrap();
        assert!(second > first);

        let all = cases_for(&pool, 1, 7, None).await.unwrap();
        assert_eq!(all.len(), 3);
        assert_eq!(all[0].reason.as_deref(), Some("again"));

        let warns = cases_for(&pool, 1, 7, Some("warn")).await.unwrap();
        assert_eq!(warns.len(), 2);

        assert_eq!(clear_warnings(&pool, 1, 7).await.unwrap(), 2);
        let left = cases_for(&pool, 1, 7, None).await.unwrap();
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].action, "kick");
        assert_eq!(cases_for(&pool, 2, 7, Some("warn")).await.unwrap().len(), 1);
    }
}
