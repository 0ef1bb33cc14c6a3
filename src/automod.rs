use std::time::{Duration, Instant};

use once_cell::sync::Lazy;
use poise::ChoiceParameter;
use poise::serenity_prelude::{self as serenity, Mentionable};
use regex::Regex;
use sqlx::SqlitePool;
use tracing::{info, warn};

use crate::{Context, Data, Error, config::AutomodConfig, db, util, window::SlidingWindow};

static INVITE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(?:discord\.gg|discord(?:app)?\.com/invite)/[a-z0-9-]+").unwrap()
});

/// Message and join rate state shared by every guild.
#[derive(Debug)]
pub struct Limiter {
    pub messages: SlidingWindow<(u64, u64)>,
    pub joins: SlidingWindow<u64>,
    pub spam_count: usize,
}

impl Limiter {
    pub fn new(config: &AutomodConfig) -> Self {
        Self {
            messages: SlidingWindow::new(Duration::from_secs(config.spam_window_secs)),
            joins: SlidingWindow::new(Duration::from_secs(config.raid_window_secs)),
            spam_count: config.spam_count.max(2),
        }
    }
}

#[derive(sqlx::FromRow, Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    pub spam: bool,
    pub invites: bool,
    pub mass_mention: bool,
    pub mention_threshold: i64,
    pub raid: bool,
    pub raid_threshold: i64,
    pub raid_action: String,
    pub min_account_age_days: i64,
    pub timeout_secs: i64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            spam: false,
            invites: false,
            mass_mention: false,
            mention_threshold: 5,
            raid: false,
            raid_threshold: 10,
            raid_action: "kick".to_string(),
            min_account_age_days: 0,
            timeout_secs: 300,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct Filters {
    pub settings: Settings,
    pub words: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Violation {
    BlockedWord(String),
    Invite,
    MassMention(usize),
    Spam(usize),
}

impl Violation {
    pub fn describe(&self) -> String {
        match self {
            Violation::BlockedWord(_) => "using a blocked word".to_string(),
            Violation::Invite => "posting an invite link".to_string(),
            Violation::MassMention(n) => format!("mentioning {} users", n),
            Violation::Spam(n) => format!("sending {} messages too quickly", n),
        }
    }
}

fn contains_word(content: &str, word: &str) -> bool {
    let word = word.to_lowercase();
    if word.contains(char::is_whitespace) {
        return content.contains(&word);
    }
    content
        .split(|c: char| !c.is_alphanumeric())
        .any(|token| token == word)
}

/// Stateless checks, in order: blocked words, invites, mass mentions.
pub fn check_message(filters: &Filters, content: &str, mention_count: usize) -> Option<Violation> {
    let lowered = content.to_lowercase();
    if let Some(word) = filters.words.iter().find(|w| contains_word(&lowered, w)) {
        return Some(Violation::BlockedWord(word.clone()));
    }
    let settings = &filters.settings;
    if settings.invites && INVITE.is_match(content) {
        return Some(Violation::Invite);
    }
    if settings.mass_mention && mention_count as i64 >= settings.mention_threshold.max(1) {
        return Some(Violation::MassMention(mention_count));
    }
    None
}

pub fn account_too_new(created_at: i64, now: i64, min_age_days: i64) -> bool {
    min_age_days > 0 && now - created_at < min_age_days * 86_400
}

pub async fn load(pool: &SqlitePool, guild_id: u64) -> Result<Filters, sqlx::Error> {
    let settings = sqlx::query_as::<_, Settings>(
        "SELECT spam, invites, mass_mention, mention_threshold, raid, raid_threshold, raid_action,
                min_account_age_days, timeout_secs
         FROM automod_settings WHERE guild_id = ?",
    )
    .bind(guild_id as i64)
    .fetch_optional(pool)
    .await?
    .unwrap_or_default();
    let words = sqlx::query_scalar("SELECT word FROM automod_words WHERE guild_id = ? ORDER BY word")
        .bind(guild_id as i64)
        .fetch_all(pool)
        .await?;
    Ok(Filters { settings, words })
}

async fn ensure(pool: &SqlitePool, guild_id: u64) -> Result<(), sqlx::Error> {
    sqlx::query("INSERT OR IGNORE INTO automod_settings (guild_id) VALUES (?)")
        .bind(guild_id as i64)
        .execute(pool)
        .await?;
    Ok(())
}

/// Columns writable through `set_column`.
#[derive(Debug, Clone, Copy)]
enum Column {
    Spam,
    Invites,
    MassMention,
    MentionThreshold,
    Raid,
    RaidThreshold,
    MinAccountAge,
    Timeout,
}

impl Column {
    fn name(self) -> &'static str {
        match self {
            Column::Spam => "spam",
            Column::Invites => "invites",
            Column::MassMention => "mass_mention",
            Column::MentionThreshold => "mention_threshold",
            Column::Raid => "raid",
            Column::RaidThreshold => "raid_threshold",
            Column::MinAccountAge => "min_account_age_days",
            Column::Timeout => "timeout_secs",
        }
    }
}

async fn set_column(
    pool: &SqlitePool,
    guild_id: u64,
    column: Column,
    value: i64,
) -> Result<(), sqlx::Error> {
    ensure(pool, guild_id).await?;
    let sql = format!(
        "UPDATE automod_settings SET {} = ? WHERE guild_id = ?",
        column.name()
    );
    sqlx::query(&sql)
        .bind(value)
        .bind(guild_id as i64)
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn add_word(pool: &SqlitePool, guild_id: u64, word: &str) -> Result<bool, sqlx::Error> {
    let result = sqlx::query("INSERT OR IGNORE INTO automod_words (guild_id, word) VALUES (?, ?)")
        .bind(guild_id as i64)
        .bind(word.trim().to_lowercase())
        .execute(pool)
        .await?;
    Ok(result.rows_affected() > 0)
}

pub async fn remove_word(pool: &SqlitePool, guild_id: u64, word: &str) -> Result<bool, sqlx::Error> {
    let result = sqlx::query("DELETE FROM automod_words WHERE guild_id = ? AND word = ?")
        .bind(guild_id as i64)
        .bind(word.trim().to_lowercase())
        .execute(pool)
        .await?;
    Ok(result.rows_affected() > 0)
}

async fn is_exempt(ctx: &serenity::Context, msg: &serenity::Message) -> bool {
    let Ok(member) = msg.member(ctx).await else {
        return false;
    };
    let Some(guild) = msg.guild(&ctx.cache) else {
        return false;
    };
    let permissions = guild.member_permissions(&member);
    permissions.manage_messages() || permissions.administrator()
}

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
    let filters = load(&data.db_pool, guild_id.get()).await?;

    let mut violation = check_message(&filters, &msg.content, msg.mentions.len());
    let spam_key = (guild_id.get(), msg.author.id.get());
    if violation.is_none() && filters.settings.spam {
        let count = data.automod.messages.hit(spam_key, Instant::now());
        if count >= data.automod.spam_count {
            violation = Some(Violation::Spam(count));
        }
    }
    let Some(violation) = violation else {
        return Ok(());
    };
    if is_exempt(ctx, msg).await {
        return Ok(());
    }
    data.automod.messages.reset(&spam_key);

    info!(guild_id = %guild_id, user_id = %msg.author.id, ?violation, "automod violation");
    if let Err(e) = msg.delete(&ctx.http).await {
        warn!(guild_id = %guild_id, "failed to delete flagged message: {e}");
    }

    let until = serenity::Timestamp::from_unix_timestamp(
        db::now() + filters.settings.timeout_secs.max(0),
    )?;
    let reason = format!("Automod: {}", violation.describe());
    if filters.settings.timeout_secs > 0 {
        guild_id
            .edit_member(
                &ctx.http,
                msg.author.id,
                serenity::EditMember::new()
                    .disable_communication_until_datetime(until)
                    .audit_log_reason(&reason),
            )
            .await?;
    }
    msg.channel_id
        .say(
            &ctx.http,
            format!(
                "{} was muted for {}.",
                msg.author.mention(),
                violation.describe()
            ),
        )
        .await?;
    Ok(())
}

pub async fn on_member_join(
    ctx: &serenity::Context,
    data: &Data,
    member: &serenity::Member,
) -> Result<(), Error> {
    if member.user.bot {
        return Ok(());
    }
    let guild_id = member.guild_id;
    let settings = load(&data.db_pool, guild_id.get()).await?.settings;

    let created = member.user.created_at().unix_timestamp();
    if account_too_new(created, db::now(), settings.min_account_age_days) {
        info!(guild_id = %guild_id, user_id = %member.user.id, "kicking new account");
        member
            .kick_with_reason(
                &ctx.http,
                &format!(
                    "Automod: account younger than {} days",
                    settings.min_account_age_days
                ),
            )
            .await?;
        return Ok(());
    }

    if !settings.raid {
        return Ok(());
    }
    let joins = data.automod.joins.hit(guild_id.get(), Instant::now());
    if (joins as i64) < settings.raid_threshold.max(1) {
        return Ok(());
    }
    warn!(guild_id = %guild_id, joins, "raid detected");
    let reason = format!("Automod: raid ({} joins)", joins);
    if settings.raid_action == "ban" {
        member.ban_with_reason(&ctx.http, 0, &reason).await?;
    } else {
        member.kick_with_reason(&ctx.http, &reason).await?;
    }
    Ok(())
}

#[derive(poise::ChoiceParameter, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Filter {
    #[name = "spam"]
    Spam,
    #[name = "invites"]
    Invites,
    #[name = "mentions"]
    Mentions,
    #[name = "raid"]
    Raid,
}

impl Filter {
    fn column(self) -> Column {
        match self {
            Filter::Spam => Column::Spam,
            Filter::Invites => Column::Invites,
            Filter::Mentions => Column::MassMention,
            Filter::Raid => Column::Raid,
        }
    }

    fn is_on(self, settings: &Settings) -> bool {
        match self {
            Filter::Spam => settings.spam,
            Filter::Invites => settings.invites,
            Filter::Mentions => settings.mass_mention,
            Filter::Raid => settings.raid,
        }
    }
}

#[derive(poise::ChoiceParameter, Debug, Clone, Copy, PartialEq, Eq)]
pub enum RaidAction {
    #[name = "kick"]
    Kick,
    #[name = "ban"]
    Ban,
}

/// Automatic message and join moderation.
#[poise::command(
    slash_command,
    prefix_command,
    guild_only,
    required_permissions = "MANAGE_GUILD",
    subcommands(
        "status",
        "toggle",
        "mentions",
        "addword",
        "removeword",
        "words",
        "raid",
        "accountage",
        "timeout"
    ),
    subcommand_required
)]
pub async fn automod(_ctx: Context<'_>) -> Result<(), Error> {
    Ok(())
}

fn guild(ctx: Context<'_>) -> Result<u64, Error> {
    Ok(ctx
        .guild_id()
        .ok_or_else(|| anyhow::anyhow!("guild only"))?
        .get())
}

/// Show the automod configuration.
#[poise::command(slash_command, prefix_command, guild_only, required_permissions = "MANAGE_GUILD")]
pub async fn status(ctx: Context<'_>) -> Result<(), Error> {
    let filters = load(&ctx.data().db_pool, guild(ctx)?).await?;
    let s = &filters.settings;
    let flag = |on: bool| if on { "🟢" } else { "🔴" };
    let description = format!(
        "{} spam ({} messages per {}s)\n{} invites\n{} mass mentions ({}+)\n\
         {} raid ({} joins per {}s, {})\nMinimum account age: {} days\nTimeout: {}s\nBlocked words: {}",
        flag(s.spam),
        ctx.data().automod.spam_count,
        ctx.data().automod.messages.span().as_secs(),
        flag(s.invites),
        flag(s.mass_mention),
        s.mention_threshold,
        flag(s.raid),
        s.raid_threshold,
        ctx.data().automod.joins.span().as_secs(),
        s.raid_action,
        s.min_account_age_days,
        s.timeout_secs,
        filters.words.len()
    );
    let embed = serenity::CreateEmbed::new()
        .title("Automod")
        .description(description)
        .color(serenity::Color::DARK_RED);
    ctx.send(poise::CreateReply::default().embed(embed)).await?;
    Ok(())
}

/// Turn a filter on or off.
#[poise::command(slash_command, prefix_command, guild_only, required_permissions = "MANAGE_GUILD")]
pub async fn toggle(
    ctx: Context<'_>,
    #[description = "Filter"] filter: Filter,
) -> Result<(), Error> {
    let guild_id = guild(ctx)?;
    let pool = &ctx.data().db_pool;
    let on = !filter.is_on(&load(pool, guild_id).await?.settings);
    set_column(pool, guild_id, filter.column(), on as i64).await?;
    ctx.say(format!(
        "The {} filter is now {}.",
        filter.name(),
        if on { "on" } else { "off" }
    ))
    .await?;
    Ok(())
}

/// Mentions in one message that count as a mass mention.
#[poise::command(slash_command, prefix_command, guild_only, required_permissions = "MANAGE_GUILD")]
pub async fn mentions(
    ctx: Context<'_>,
    #[description = "Threshold"]
    #[min = 2]
    #[max = 50]
    threshold: u32,
) -> Result<(), Error> {
    set_column(
        &ctx.data().db_pool,
        guild(ctx)?,
        Column::MentionThreshold,
        threshold.max(2) as i64,
    )
    .await?;
    ctx.say(format!("Mass mention threshold set to {}.", threshold.max(2)))
        .await?;
    Ok(())
}

/// Block a word or phrase.
#[poise::command(slash_command, prefix_command, guild_only, required_permissions = "MANAGE_GUILD")]
pub async fn addword(
    ctx: Context<'_>,
    #[description = "Word or phrase"]
    #[rest]
    word: String,
) -> Result<(), Error> {
    if word.trim().is_empty() {
        anyhow::bail!("Give me a word to block.");
    }
    let added = add_word(&ctx.data().db_pool, guild(ctx)?, &word).await?;
    let reply = if added { "Word blocked." } else { "That word is already blocked." };
    ctx.send(poise::CreateReply::default().content(reply).ephemeral(true))
        .await?;
    Ok(())
}

/// Unblock a word or phrase.
#[poise::command(slash_command, prefix_command, guild_only, required_permissions = "MANAGE_GUILD")]
pub async fn removeword(
    ctx: Context<'_>,
    #[description = "Word or phrase"]
    #[rest]
    word: String,
) -> Result<(), Error> {
    let removed = remove_word(&ctx.data().db_pool, guild(ctx)?, &word).await?;
    let reply = if removed { "Word unblocked." } else { "That word was not blocked." };
    ctx.send(poise::CreateReply::default().content(reply).ephemeral(true))
        .await?;
    Ok(())
}

/// List blocked words.
#[poise::command(slash_command, prefix_command, guild_only, required_permissions = "MANAGE_GUILD")]
pub async fn words(ctx: Context<'_>) -> Result<(), Error> {
    let filters = load(&ctx.data().db_pool, guild(ctx)?).await?;
    let reply = if filters.words.is_empty() {
        "No words are blocked.".to_string()
    } else {
        filters
            .words
            .iter()
            .map(|w| format!("||{}||", w))
            .collect::<Vec<_>>()
            .join(", ")
    };
    ctx.send(poise::CreateReply::default().content(reply).ephemeral(true))
        .await?;
    Ok(())
}

/// Joins inside the raid window that trigger raid mode, and what to do with raiders.
#[poise::command(slash_command, prefix_command, guild_only, required_permissions = "MANAGE_GUILD")]
pub async fn raid(
    ctx: Context<'_>,
    #[description = "Joins before acting"]
    #[min = 2]
    #[max = 100]
    threshold: u32,
    #[description = "Kick or ban raiders"] action: RaidAction,
) -> Result<(), Error> {
    let guild_id = guild(ctx)?;
    let pool = &ctx.data().db_pool;
    set_column(pool, guild_id, Column::RaidThreshold, threshold.max(2) as i64).await?;
    let action = match action {
        RaidAction::Kick => "kick",
        RaidAction::Ban => "ban",
    };
    sqlx::query("UPDATE automod_settings SET raid_action = ? WHERE guild_id = ?")
        .bind(action)
        .bind(guild_id as i64)
        .execute(pool)
        .await?;
    ctx.say(format!(
        "Raid mode triggers at {} joins and will {} raiders.",
        threshold.max(2),
        action
    ))
    .await?;
    Ok(())
}

/// Kick accounts younger than this many days; 0 disables the check.
#[poise::command(slash_command, prefix_command, guild_only, required_permissions = "MANAGE_GUILD")]
pub async fn accountage(
    ctx: Context<'_>,
    #[description = "Minimum age in days"]
    #[max = 365]
    days: u32,
) -> Result<(), Error> {
    set_column(&ctx.data().db_pool, guild(ctx)?, Column::MinAccountAge, days as i64).await?;
    ctx.say(format!("Minimum account age set to {} days.", days))
        .await?;
    Ok(())
}

/// How long offenders are muted, e.g. `5m`; `0` only deletes the message.
#[poise::command(slash_command, prefix_command, guild_only, required_permissions = "MANAGE_GUILD")]
pub async fn timeout(
    ctx: Context<'_>,
    #[description = "Duration, e.g. 10m"] duration: String,
) -> Result<(), Error> {
    let duration = util::parse_duration(&duration)?.min(crate::moderation::MAX_TIMEOUT);
    set_column(
        &ctx.data().db_pool,
        guild(ctx)?,
        Column::Timeout,
        duration.as_secs() as i64,
    )
    .await?;
    ctx.say(format!("Automod timeout set to {}.", util::humanize(duration)))
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn filters(settings: Settings, words: &[&str]) -> Filters {
        Filters {
            settings,
            words: words.iter().map(|w| w.to_string()).collect(),
        }
    }

    #[test]
    fn blocked_words_match_whole_tokens() {
        let f = filters(Settings::default(), &["darn", "bad phrase"]);
        assert_eq!(
            check_message(&f, "well DARN it", 0),
            Some(Violation::BlockedWord("darn".into()))
        );
        assert_eq!(check_message(&f, "darned", 0), None);
        assert_eq!(
            check_message(&f, "such a Bad Phrase here", 0),
            Some(Violation::BlockedWord("bad phrase".into()))
        );
    }

    #[test]
    fn invites_only_when_enabled() {
        let off = filters(Settings::default(), &[]);
        assert_eq!(check_message(&off, "join discord.gg/rust", 0), None);
        let on = filters(
            Settings {
                invites: true,
                ..Settings::default()
            },
            &[],
        );
        assert_eq!(
            check_message(&on, "join discord.gg/rust", 0),
            Some(Violation::Invite)
        );
        assert_eq!(
            check_message(&on, "https://discord.com/invite/abc-1", 0),
            Some(Violation::Invite)
        );
        assert_eq!(check_message(&on, "discord is nice", 0), None);
    }

    #[test]
    fn mass_mentions() {
        let f = filters(
            Settings {
                mass_mention: true,
                mention_threshold: 4,
                ..Settings::default()
            },
            &[],
        );
        assert_eq!(check_message(&f, "hi", 3), None);
        assert_eq!(check_message(&f, "hi", 4), Some(Violation::MassMention(4)));
    }

    #[test]
    fn first_violation_wins() {
        let all_on = Settings {
            invites: true,
            mass_mention: true,
            mention_threshold: 2,
            ..Settings::default()
        };
        let content = "darn, join discord.gg/rust";
        let f = filters(all_on.clone(), &["darn"]);
        assert_eq!(
            check_message(&f, content, 5),
            Some(Violation::BlockedWord("darn".into()))
        );
        let f = filters(all_on.clone(), &[]);
        assert_eq!(check_message(&f, content, 5), Some(Violation::Invite));
        let f = filters(all_on, &[]);
        assert_eq!(check_message(&f, "hey all", 5), Some(Violation::MassMention(5)));
    }

    #[test]
    fn account_age() {
        let day = 86_400;
        assert!(!account_too_new(0, 10 * day, 0));
        assert!(account_too_new(9 * day, 10 * day, 2));
        assert!(!account_too_new(7 * day, 10 * day, 2));
    }

    #[test]
    fn spam_window_counts_per_member() {
        let limiter = Limiter::new(&AutomodConfig::default());
        let now = Instant::now();
        for _ in 0..4 {
            limiter.messages.hit((1, 1), now);
        }
        assert_eq!(limiter.messages.hit((1, 1), now), limiter.spam_count);
        assert_eq!(limiter.messages.hit((1, 2), now), 1);
    }

    #[tokio::test]
    async fn settings_persist() {
        let pool = db::test_pool().await;
        assert_eq!(load(&pool, 1).await.unwrap().settings, Settings::default());

        set_column(&pool, 1, Column::Invites, 1).await.unwrap();
        set_column(&pool, 1, Column::MentionThreshold, 8).await.unwrap();
        assert!(add_word(&pool, 1, " Heck ").await.unwrap());
        assert!(!add_word(&pool, 1, "heck").await.unwrap());

        let filters = load(&pool, 1).await.unwrap();
        assert!(filters.settings.invites);
        assert_eq!(filters.settings.mention_threshold, 8);
        assert_eq!(filters.words, vec!["heck".to_string()]);

        assert!(remove_word(&pool, 1, "HECK").await.unwrap());
        assert!(load(&pool, 1).await.unwrap().words.is_empty());
    }
}
