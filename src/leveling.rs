use std::{
    collections::HashMap,
    sync::Mutex,
    time::{Duration, Instant},
};

use poem_openapi::Object;
use poise::serenity_prelude::{self as serenity, Mentionable};
use rand::Rng;
use sqlx::SqlitePool;
use tracing::{debug, warn};

use crate::{
    Context, Data, Error, db,
    embed::{self, Variables},
};

pub const DEFAULT_MESSAGE: &str = "GG {user.mention}, you reached level {level}!";

/// Largest XP total that fits the `levels.xp` column.
pub const MAX_XP: u64 = i64::MAX as u64;

/// Total XP needed to reach `level`. Each step from `n - 1` to `n` costs `100 * n`.
/// Saturates at `u64::MAX`.
pub fn xp_for_level(level: u32) -> u64 {
    let level = level as u64;
    (50 * level).saturating_mul(level + 1)
}

pub fn level_for(xp: u64) -> u32 {
    let xp = xp.min(MAX_XP);
    // Start from the closed-form estimate and correct for rounding.
    let mut level = ((xp as f64 / 50.0).sqrt()) as u32;
    while xp_for_level(level + 1) <= xp {
        level += 1;
    }
    while level > 0 && xp_for_level(level) > xp {
        level -= 1;
    }
    level
}

#[derive(Object, Debug, Clone, PartialEq, Eq)]
pub struct Progress {
    pub total_xp: u64,
    pub level: u32,
    /// XP earned since reaching `level`.
    pub current: u64,
    /// XP between `level` and `level + 1`.
    pub needed: u64,
}

pub fn progress(xp: u64) -> Progress {
    let xp = xp.min(MAX_XP);
    let level = level_for(xp);
    let floor = xp_for_level(level);
    Progress {
        total_xp: xp,
        level,
        current: xp - floor,
        needed: xp_for_level(level + 1) - floor,
    }
}

fn progress_bar(progress: &Progress, width: usize) -> String {
    let filled = if progress.needed == 0 {
        0
    } else {
        ((progress.current as usize) * width / progress.needed as usize).min(width)
    };
    format!("{}{}", "█".repeat(filled), "░".repeat(width - filled))
}

/// Tracks when each member last earned XP.
#[derive(Debug)]
pub struct Cooldowns {
    span: Duration,
    last: Mutex<HashMap<(u64, u64), Instant>>,
}

impl Cooldowns {
    pub fn new(span: Duration) -> Self {
        Self {
            span,
            last: Mutex::new(HashMap::new()),
        }
    }

    /// Returns true and starts a new cooldown when the previous one expired.
    pub fn try_acquire(&self, guild_id: u64, user_id: u64, now: Instant) -> bool {
        let mut last = self.last.lock().unwrap_or_else(|e| e.into_inner());
        match last.get(&(guild_id, user_id)) {
            Some(&at) if now.saturating_duration_since(at) < self.span => false,
            _ => {
                last.insert((guild_id, user_id), now);
                true
            }
        }
    }

    /// Forgets cooldowns that already expired.
    pub fn prune(&self, now: Instant) {
        let mut last = self.last.lock().unwrap_or_else(|e| e.into_inner());
        last.retain(|_, at| now.saturating_duration_since(*at) < self.span);
    }
}

#[derive(sqlx::FromRow, Debug, Default)]
pub struct LevelSettings {
    pub enabled: bool,
    pub channel_id: Option<i64>,
    pub message: Option<String>,
}

pub async fn settings(pool: &SqlitePool, guild_id: u64) -> Result<LevelSettings, sqlx::Error> {
    let row = sqlx::query_as::<_, LevelSettings>(
        "SELECT enabled, channel_id, message FROM leveling_config WHERE guild_id = ?",
    )
    .bind(guild_id as i64)
    .fetch_optional(pool)
    .await?;
    Ok(row.unwrap_or_default())
}

async fn ensure_settings(pool: &SqlitePool, guild_id: u64) -> Result<(), sqlx::Error> {
    sqlx::query("INSERT OR IGNORE INTO leveling_config (guild_id) VALUES (?)")
        .bind(guild_id as i64)
        .execute(pool)
        .await?;
    Ok(())
}

/// Adds `amount` XP and returns `(old, new)` totals.
pub async fn add_xp(
    pool: &SqlitePool,
    guild_id: u64,
    user_id: u64,
    amount: u64,
) -> Result<(u64, u64), sqlx::Error> {
    let new: i64 = sqlx::query_scalar(
        "INSERT INTO levels (guild_id, user_id, xp) VALUES (?, ?, ?)
         ON CONFLICT (guild_id, user_id)
         DO UPDATE SET xp = MIN(xp, 9223372036854775807 - excluded.xp) + excluded.xp
         RETURNING xp",
    )
    .bind(guild_id as i64)
    .bind(user_id as i64)
    .bind(amount.min(MAX_XP) as i64)
    .fetch_one(pool)
    .await?;
    let new = new.max(0) as u64;
    Ok((new.saturating_sub(amount), new))
}

pub async fn set_xp(
    pool: &SqlitePool,
    guild_id: u64,
    user_id: u64,
    xp: u64,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        "INSERT INTO levels (guild_id, user_id, xp) VALUES (?, ?, ?)
         ON CONFLICT (guild_id, user_id) DO UPDATE SET xp = excluded.xp",
    )
    .bind(guild_id as i64)
    .bind(user_id as i64)
    .bind(xp.min(MAX_XP) as i64)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn xp_of(pool: &SqlitePool, guild_id: u64, user_id: u64) -> Result<u64, sqlx::Error> {
    let xp: Option<i64> =
        sqlx::query_scalar("SELECT xp FROM levels WHERE guild_id = ? AND user_id = ?")
            .bind(guild_id as i64)
            .bind(user_id as i64)
            .fetch_optional(pool)
            .await?;
    Ok(xp.unwrap_or(0).max(0) as u64)
}

/// 1-based position on the guild leaderboard.
pub async fn rank_of(pool: &SqlitePool, guild_id: u64, xp: u64) -> Result<u64, sqlx::Error> {
    let above: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM levels WHERE guild_id = ? AND xp > ?")
        .bind(guild_id as i64)
        .bind(xp as i64)
        .fetch_one(pool)
        .await?;
    Ok(above as u64 + 1)
}

#[derive(sqlx::FromRow, Object, Debug, Clone, PartialEq, Eq)]
pub struct LeaderboardEntry {
    pub user_id: i64,
    pub xp: i64,
}

pub async fn leaderboard(
    pool: &SqlitePool,
    guild_id: u64,
    limit: u32,
) -> Result<Vec<LeaderboardEntry>, sqlx::Error> {
    sqlx::query_as(
        "SELECT user_id, xp FROM levels WHERE guild_id = ? ORDER BY xp DESC, user_id LIMIT ?",
    )
    .bind(guild_id as i64)
    .bind(limit as i64)
    .fetch_all(pool)
    .await
}

/// Reward roles unlocked at or below `level`.
pub async fn rewards_up_to(
    pool: &SqlitePool,
    guild_id: u64,
    level: u32,
) -> Result<Vec<u64>, sqlx::Error> {
    let roles: Vec<i64> = sqlx::query_scalar(
        "SELECT role_id FROM level_rewards WHERE guild_id = ? AND level <= ? ORDER BY level",
    )
    .bind(guild_id as i64)
    .bind(level as i64)
    .fetch_all(pool)
    .await?;
    Ok(roles.into_iter().map(|r| r as u64).collect())
}

/// Awards message XP and handles level-ups.
pub async fn on_message(
    ctx: &serenity::Context,
    data: &Data,
    msg: &serenity::Message,
) -> Result<(), Error> {
    let Some(guild_id) = msg.guild_id else {
        return Ok(());
    };
    if msg.author.bot {
        return Ok(());
    }
    let settings = settings(&data.db_pool, guild_id.get()).await?;
    if !settings.enabled {
        return Ok(());
    }
    if !data
        .leveling
        .try_acquire(guild_id.get(), msg.author.id.get(), Instant::now())
    {
        return Ok(());
    }

    let range = &data.config.leveling;
    let amount = rand::rng().random_range(range.xp_min..=range.xp_max.max(range.xp_min));
    let (old, new) = add_xp(&data.db_pool, guild_id.get(), msg.author.id.get(), amount as u64).await?;
    let (old_level, new_level) = (level_for(old), level_for(new));
    if new_level <= old_level {
        return Ok(());
    }
    debug!(guild_id = %guild_id, user_id = %msg.author.id, new_level, "level up");

    for role_id in rewards_up_to(&data.db_pool, guild_id.get(), new_level).await? {
        let role_id = serenity::RoleId::new(role_id);
        if msg.member.as_ref().is_some_and(|m| m.roles.contains(&role_id)) {
            continue;
        }
        if let Err(e) = ctx
            .http
            .add_member_role(guild_id, msg.author.id, role_id, Some("Level reward"))
            .await
        {
            warn!(guild_id = %guild_id, role_id = %role_id, "failed to grant level reward: {e}");
        }
    }

    let mut vars = Variables::new().user(&msg.author).set("level", new_level);
    if let Some(guild) = msg.guild(&ctx.cache) {
        vars = vars.guild(&guild);
    }
    let script = settings.message.as_deref().unwrap_or(DEFAULT_MESSAGE);
    let channel = settings
        .channel_id
        .map(|id| serenity::ChannelId::new(id as u64))
        .unwrap_or(msg.channel_id);
    match embed::render(script, &vars) {
        Ok(message) => {
            channel.send_message(&ctx.http, message.to_message()).await?;
        }
        Err(e) => warn!(guild_id = %guild_id, "invalid level-up script: {e}"),
    }
    Ok(())
}

/// Shows a member's level and XP.
#[poise::command(slash_command, prefix_command, guild_only, aliases("level"))]
pub async fn rank(
    ctx: Context<'_>,
    #[description = "Member to look up"] user: Option<serenity::User>,
) -> Result<(), Error> {
    let guild_id = ctx.guild_id().ok_or_else(|| anyhow::anyhow!("guild only"))?;
    let user = user.as_ref().unwrap_or_else(|| ctx.author());
    let pool = &ctx.data().db_pool;
    let xp = xp_of(pool, guild_id.get(), user.id.get()).await?;
    let position = rank_of(pool, guild_id.get(), xp).await?;
    let progress = progress(xp);

    let embed = serenity::CreateEmbed::new()
        .author(serenity::CreateEmbedAuthor::new(&user.name).icon_url(user.face()))
        .field("Level", progress.level.to_string(), true)
        .field("Rank", format!("#{}", position), true)
        .field("Total XP", progress.total_xp.to_string(), true)
        .field(
            "Progress",
            format!(
                "{} {}/{}",
                progress_bar(&progress, 12),
                progress.current,
                progress.needed
            ),
            false,
        )
        .color(serenity::Color::DARK_RED);
    ctx.send(poise::CreateReply::default().embed(embed)).await?;
    Ok(())
}

/// Top members by XP.
#[poise::command(
    slash_command,
    prefix_command,
    guild_only,
    rename = "leaderboard",
    aliases("lb")
)]
pub async fn leaderboard_cmd(ctx: Context<'_>) -> Result<(), Error> {
    let guild_id = ctx.guild_id().ok_or_else(|| anyhow::anyhow!("guild only"))?;
    let entries = leaderboard(&ctx.data().db_pool, guild_id.get(), 10).await?;
    if entries.is_empty() {
        ctx.say("Nobody has earned any XP yet.").await?;
        return Ok(());
    }
    let lines = entries
        .iter()
        .enumerate()
        .map(|(i, e)| {
            format!(
                "`{}.` <@{}> level {} ({} XP)",
                i + 1,
                e.user_id,
                level_for(e.xp.max(0) as u64),
                e.xp
            )
        })
        .collect::<Vec<_>>()
        .join("\n");
    let embed = serenity::CreateEmbed::new()
        .title("Leaderboard")
        .description(lines)
        .color(serenity::Color::DARK_RED);
    ctx.send(poise::CreateReply::default().embed(embed)).await?;
    Ok(())
}

/// Configure leveling for this server.
#[poise::command(
    slash_command,
    prefix_command,
    guild_only,
    required_permissions = "MANAGE_GUILD",
    subcommands(
        "enable",
        "disable",
        "channel",
        "message",
        "addreward",
        "removereward",
        "rewards",
        "setxp"
    ),
    subcommand_required
)]
pub async fn levels(_ctx: Context<'_>) -> Result<(), Error> {
    Ok(())
}

async fn set_enabled(ctx: Context<'_>, enabled: bool) -> Result<(), Error> {
    let guild_id = ctx.guild_id().ok_or_else(|| anyhow::anyhow!("guild only"))?;
    let pool = &ctx.data().db_pool;
    ensure_settings(pool, guild_id.get()).await?;
    sqlx::query("UPDATE leveling_config SET enabled = ? WHERE guild_id = ?")
        .bind(enabled)
        .bind(db::id(guild_id))
        .execute(pool)
        .await?;
    ctx.say(format!(
        "Leveling is now **{}**.",
        if enabled { "enabled" } else { "disabled" }
    ))
    .await?;
    Ok(())
}

/// Start awarding XP for messages.
#[poise::command(slash_command, prefix_command, guild_only, required_permissions = "MANAGE_GUILD")]
pub async fn enable(ctx: Context<'_>) -> Result<(), Error> {
    set_enabled(ctx, true).await
}

/// Stop awarding XP for messages.
#[poise::command(slash_command, prefix_command, guild_only, required_permissions = "MANAGE_GUILD")]
pub async fn disable(ctx: Context<'_>) -> Result<(), Error> {
    set_enabled(ctx, false).await
}

/// Channel for level-up announcements; omit to announce where the member talked.
#[poise::command(slash_command, prefix_command, guild_only, required_permissions = "MANAGE_GUILD")]
pub async fn channel(
    ctx: Context<'_>,
    #[description = "Announcement channel"] channel: Option<serenity::GuildChannel>,
) -> Result<(), Error> {
    let guild_id = ctx.guild_id().ok_or_else(|| anyhow::anyhow!("guild only"))?;
    let pool = &ctx.data().db_pool;
    ensure_settings(pool, guild_id.get()).await?;
    sqlx::query("UPDATE leveling_config SET channel_id = ? WHERE guild_id = ?")
        .bind(channel.as_ref().map(|c| db::id(c.id)))
        .bind(db::id(guild_id))
        .execute(pool)
        .await?;
    let reply = match channel {
        Some(channel) => format!("Level-ups will be announced in {}.", channel.mention()),
        None => "Level-ups will be announced in the channel they happen in.".to_string(),
    };
    ctx.say(reply).await?;
    Ok(())
}

/// Embed script for level-up announcements. Supports {level}.
#[poise::command(slash_command, prefix_command, guild_only, required_permissions = "MANAGE_GUILD")]
pub async fn message(
    ctx: Context<'_>,
    #[description = "Embed script, or `default`"]
    #[rest]
    script: String,
) -> Result<(), Error> {
    let guild_id = ctx.guild_id().ok_or_else(|| anyhow::anyhow!("guild only"))?;
    let script = (!script.trim().eq_ignore_ascii_case("default")).then_some(script);
    if let Some(script) = &script {
        embed::render(script, &embed::context_variables(ctx).set("level", 1))?;
    }
    let pool = &ctx.data().db_pool;
    ensure_settings(pool, guild_id.get()).await?;
    sqlx::query("UPDATE leveling_config SET message = ? WHERE guild_id = ?")
        .bind(script.as_deref())
        .bind(db::id(guild_id))
        .execute(pool)
        .await?;
    ctx.say("Level-up message updated.").await?;
    Ok(())
}

/// Grant a role when members reach a level.
#[poise::command(slash_command, prefix_command, guild_only, required_permissions = "MANAGE_GUILD")]
pub async fn addreward(
    ctx: Context<'_>,
    #[description = "Level"] level: u32,
    #[description = "Role to grant"] role: serenity::Role,
) -> Result<(), Error> {
    let guild_id = ctx.guild_id().ok_or_else(|| anyhow::anyhow!("guild only"))?;
    sqlx::query("INSERT OR IGNORE INTO level_rewards (guild_id, level, role_id) VALUES (?, ?, ?)")
        .bind(db::id(guild_id))
        .bind(level as i64)
        .bind(db::id(role.id))
        .execute(&ctx.data().db_pool)
        .await?;
    ctx.say(format!("{} will be granted at level {}.", role.name, level))
        .await?;
    Ok(())
}

/// Stop granting a role at a level.
#[poise::command(slash_command, prefix_command, guild_only, required_permissions = "MANAGE_GUILD")]
pub async fn removereward(
    ctx: Context<'_>,
    #[description = "Level"] level: u32,
    #[description = "Role"] role: serenity::Role,
) -> Result<(), Error> {
    let guild_id = ctx.guild_id().ok_or_else(|| anyhow::anyhow!("guild only"))?;
    let result =
        sqlx::query("DELETE FROM level_rewards WHERE guild_id = ? AND level = ? AND role_id = ?")
            .bind(db::id(guild_id))
            .bind(level as i64)
            .bind(db::id(role.id))
            .execute(&ctx.data().db_pool)
            .await?;
    if result.rows_affected() == 0 {
        ctx.say("That reward does not exist.").await?;
    } else {
        ctx.say("Reward removed.").await?;
    }
    Ok(())
}

/// List level rewards.
#[poise::command(slash_command, prefix_command, guild_only)]
pub async fn rewards(ctx: Context<'_>) -> Result<(), Error> {
    let guild_id = ctx.guild_id().ok_or_else(|| anyhow::anyhow!("guild only"))?;
    let rows: Vec<(i64, i64)> = sqlx::query_as(
        "SELECT level, role_id FROM level_rewards WHERE guild_id = ? ORDER BY level",
    )
    .bind(db::id(guild_id))
    .fetch_all(&ctx.data().db_pool)
    .await?;
    if rows.is_empty() {
        ctx.say("No level rewards are configured.").await?;
        return Ok(());
    }
    let lines = rows
        .iter()
        .map(|(level, role)| format!("Level {}: <@&{}>", level, role))
        .collect::<Vec<_>>()
        .join("\n");
    ctx.send(
        poise::CreateReply::default().embed(
            serenity::CreateEmbed::new()
                .title("Level rewards")
                .description(lines)
                .color(serenity::Color::DARK_RED),
        ),
    )
    .await?;
    Ok(())
}

/// Overwrite a member's XP.
#[poise::command(slash_command, prefix_command, guild_only, required_permissions = "MANAGE_GUILD")]
pub async fn setxp(
    ctx: Context<'_>,
    #[description = "Member"] user: serenity::User,
    #[description = "New XP total"] xp: u64,
) -> Result<(), Error> {
    let guild_id = ctx.guild_id().ok_or_else(|| anyhow::anyhow!("guild only"))?;
    let xp = xp.min(MAX_XP);
    set_xp(&ctx.data().db_pool, guild_id.get(), user.id.get(), xp).await?;
    ctx.say(format!(
        "{} now has {} XP (level {}).",
        user.name,
        xp,
        level_for(xp)
    ))
    .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn level_math() {
        assert_eq!(xp_for_level(0), 0);
        assert_eq!(xp_for_level(1), 100);
        assert_eq!(xp_for_level(2), 300);
        assert_eq!(xp_for_level(10), 5500);
        assert_eq!(level_for(0), 0);
        assert_eq!(level_for(99), 0);
        assert_eq!(level_for(100), 1);
        assert_eq!(level_for(299), 1);
        assert_eq!(level_for(300), 2);
        assert_eq!(level_for(5500), 10);
        for level in 0..200 {
            assert_eq!(level_for(xp_for_level(level)), level);
        }
    }

    #[test]
    fn progress_within_level() {
        let p = progress(350);
        assert_eq!(p.level, 2);
        assert_eq!(p.current, 50);
        assert_eq!(p.needed, 300);
        assert_eq!(progress_bar(&p, 6), "█░░░░░");
    }

    #[test]
    fn huge_xp_saturates() {
        assert_eq!(xp_for_level(u32::MAX), u64::MAX);

        let top = level_for(MAX_XP);
        assert!(xp_for_level(top) <= MAX_XP);
        assert!(xp_for_level(top + 1) > MAX_XP);
        assert_eq!(level_for(u64::MAX), top);

        let p = progress(u64::MAX);
        assert_eq!(p.total_xp, MAX_XP);
        assert_eq!(p.level, top);
        assert!(p.current < p.needed);
    }

    #[test]
    fn cooldown() {
        let cooldowns = Cooldowns::new(Duration::from_secs(60));
        let now = Instant::now();
        assert!(cooldowns.try_acquire(1, 1, now));
        assert!(!cooldowns.try_acquire(1, 1, now + Duration::from_secs(30)));
        assert!(cooldowns.try_acquire(1, 2, now));
        assert!(cooldowns.try_acquire(1, 1, now + Duration::from_secs(60)));
    }

    #[tokio::test]
    async fn xp_storage_and_ranking() {
        let pool = db::test_pool().await;
        assert_eq!(add_xp(&pool, 1, 10, 40).await.unwrap(), (0, 40));
        assert_eq!(add_xp(&pool, 1, 10, 70).await.unwrap(), (40, 110));
        add_xp(&pool, 1, 11, 500).await.unwrap();
        add_xp(&pool, 2, 12, 900).await.unwrap();

        assert_eq!(xp_of(&pool, 1, 10).await.unwrap(), 110);
        assert_eq!(rank_of(&pool, 1, 110).await.unwrap(), 2);
        let top = leaderboard(&pool, 1, 10).await.unwrap();
        assert_eq!(top.len(), 2);
        assert_eq!(top[0].user_id, 11);

        set_xp(&pool, 1, 10, 5).await.unwrap();
        assert_eq!(xp_of(&pool, 1, 10).await.unwrap(), 5);

        set_xp(&pool, 1, 10, u64::MAX).await.unwrap();
        assert_eq!(xp_of(&pool, 1, 10).await.unwrap(), MAX_XP);
        assert_eq!(add_xp(&pool, 1, 10, 25).await.unwrap().1, MAX_XP);
    }

    #[tokio::test]
    async fn rewards_are_filtered_by_level() {
        let pool = db::test_pool().await;
        for (level, role) in [(5, 100), (10, 101), (20, 102)] {
            sqlx::query("INSERT INTO level_rewards (guild_id, level, role_id) VALUES (1, ?, ?)")
                .bind(level)
                .bind(role)
                .execute(&pool)
                .await
                .unwrap();
        }
        assert_eq!(rewards_up_to(&pool, 1, 10).await.unwrap(), vec![100, 101]);
        assert!(rewards_up_to(&pool, 1, 4).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn settings_default_to_disabled() {
        let pool = db::test_pool().await;
        assert!(!settings(&pool, 1).await.unwrap().enabled);
        ensure_settings(&pool, 1).await.unwrap();
        sqlx::query("UPDATE leveling_config SET enabled = 1 WHERE guild_id = 1")
            .execute(&pool)
            .await
            .unwrap();
        assert!(settings(&pool, 1).await.unwrap().enabled);
    }
}
