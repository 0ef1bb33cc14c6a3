use poise::ChoiceParameter;
use poise::serenity_prelude::{self as serenity, Mentionable};
use sqlx::SqlitePool;
use tracing::{debug, warn};

use crate::{
    Context, Data, Error,
    embed::{self, Variables},
};

#[derive(poise::ChoiceParameter, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kind {
    #[name = "welcome"]
    Welcome,
    #[name = "goodbye"]
    Goodbye,
    #[name = "boost"]
    Boost,
}

impl Kind {
    pub fn key(self) -> &'static str {
        match self {
            Kind::Welcome => "welcome",
            Kind::Goodbye => "goodbye",
            Kind::Boost => "boost",
        }
    }
}

#[derive(sqlx::FromRow, Debug, Clone, PartialEq, Eq)]
pub struct Greeting {
    pub channel_id: i64,
    pub script: String,
}

pub async fn load_greeting(
    pool: &SqlitePool,
    guild_id: u64,
    kind: Kind,
) -> Result<Option<Greeting>, sqlx::Error> {
    sqlx::query_as("SELECT channel_id, script FROM greet_messages WHERE guild_id = ? AND kind = ?")
        .bind(guild_id as i64)
        .bind(kind.key())
        .fetch_optional(pool)
        .await
}

pub async fn save_greeting(
    pool: &SqlitePool,
    guild_id: u64,
    kind: Kind,
    channel_id: u64,
    script: &str,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        "INSERT INTO greet_messages (guild_id, kind, channel_id, script) VALUES (?, ?, ?, ?)
         ON CONFLICT (guild_id, kind) DO UPDATE SET channel_id = excluded.channel_id, script = excluded.script",
    )
    .bind(guild_id as i64)
    .bind(kind.key())
    .bind(channel_id as i64)
    .bind(script)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn delete_greeting(pool: &SqlitePool, guild_id: u64, kind: Kind) -> Result<bool, sqlx::Error> {
    let result = sqlx::query("DELETE FROM greet_messages WHERE guild_id = ? AND kind = ?")
        .bind(guild_id as i64)
        .bind(kind.key())
        .execute(pool)
        .await?;
    Ok(result.rows_affected() > 0)
}

/// A boost starts when `premium_since` goes from unset to set. Without a
/// cached old member there is nothing to compare against.
pub fn started_boosting(old: Option<&serenity::Member>, new: &serenity::Member) -> bool {
    match old {
        Some(old) => old.premium_since.is_none() && new.premium_since.is_some(),
        None => false,
    }
}

fn variables(ctx: &serenity::Context, guild_id: serenity::GuildId, user: &serenity::User) -> Variables {
    let vars = Variables::new().user(user);
    match guild_id.to_guild_cached(&ctx.cache) {
        Some(guild) => vars.guild(&guild),
        None => vars,
    }
}

async fn send(
    ctx: &serenity::Context,
    data: &Data,
    guild_id: serenity::GuildId,
    user: &serenity::User,
    kind: Kind,
) -> Result<(), Error> {
    let Some(greeting) = load_greeting(&data.db_pool, guild_id.get(), kind).await? else {
        return Ok(());
    };
    let vars = variables(ctx, guild_id, user);
    let message = match embed::render(&greeting.script, &vars) {
        Ok(message) => message,
        Err(e) => {
            warn!(guild_id = %guild_id, kind = kind.key(), "invalid greet script: {e}");
            return Ok(());
        }
    };
    debug!(guild_id = %guild_id, user_id = %user.id, kind = kind.key(), "sending greeting");
    serenity::ChannelId::new(greeting.channel_id as u64)
        .send_message(&ctx.http, message.to_message())
        .await?;
    Ok(())
}

pub async fn on_member_join(
    ctx: &serenity::Context,
    data: &Data,
    member: &serenity::Member,
) -> Result<(), Error> {
    send(ctx, data, member.guild_id, &member.user, Kind::Welcome).await
}

pub async fn on_member_leave(
    ctx: &serenity::Context,
    data: &Data,
    guild_id: serenity::GuildId,
    user: &serenity::User,
) -> Result<(), Error> {
    send(ctx, data, guild_id, user, Kind::Goodbye).await
}

pub async fn on_member_update(
    ctx: &serenity::Context,
    data: &Data,
    old: Option<&serenity::Member>,
    new: &serenity::Member,
) -> Result<(), Error> {
    if !started_boosting(old, new) {
        return Ok(());
    }
    send(ctx, data, new.guild_id, &new.user, Kind::Boost).await
}

/// Welcome, goodbye and boost messages.
#[poise::command(
    slash_command,
    prefix_command,
    guild_only,
    required_permissions = "MANAGE_GUILD",
    subcommands("set", "remove", "test"),
    subcommand_required
)]
pub async fn greet(_ctx: Context<'_>) -> Result<(), Error> {
    Ok(())
}

/// Post a script in a channel whenever the event happens.
#[poise::command(slash_command, prefix_command, guild_only, required_permissions = "MANAGE_GUILD")]
pub async fn set(
    ctx: Context<'_>,
    #[description = "Event"] kind: Kind,
    #[description = "Channel to post in"] channel: serenity::GuildChannel,
    #[description = "Message or embed script"]
    #[rest]
    script: String,
) -> Result<(), Error> {
    let guild_id = ctx.guild_id().ok_or_else(|| anyhow::anyhow!("guild only"))?;
    embed::render(&script, &embed::context_variables(ctx))?;
    save_greeting(&ctx.data().db_pool, guild_id.get(), kind, channel.id.get(), &script).await?;
    ctx.say(format!(
        "The {} message will be posted in {}.",
        kind.name(),
        channel.mention()
    ))
    .await?;
    Ok(())
}

/// Stop posting a message.
#[poise::command(slash_command, prefix_command, guild_only, required_permissions = "MANAGE_GUILD")]
pub async fn remove(ctx: Context<'_>, #[description = "Event"] kind: Kind) -> Result<(), Error> {
    let guild_id = ctx.guild_id().ok_or_else(|| anyhow::anyhow!("guild only"))?;
    let reply = if delete_greeting(&ctx.data().db_pool, guild_id.get(), kind).await? {
        format!("The {} message was removed.", kind.name())
    } else {
        format!("There is no {} message.", kind.name())
    };
    ctx.say(reply).await?;
    Ok(())
}

/// Preview a message as if you triggered it.
#[poise::command(slash_command, prefix_command, guild_only, required_permissions = "MANAGE_GUILD")]
pub async fn test(ctx: Context<'_>, #[description = "Event"] kind: Kind) -> Result<(), Error> {
    let guild_id = ctx.guild_id().ok_or_else(|| anyhow::anyhow!("guild only"))?;
    let Some(greeting) = load_greeting(&ctx.data().db_pool, guild_id.get(), kind).await? else {
        ctx.say(format!("There is no {} message.", kind.name())).await?;
        return Ok(());
    };
    let message = embed::render(&greeting.script, &embed::context_variables(ctx))?;
    ctx.send(message.to_reply()).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;

    #[tokio::test]
    async fn greeting_store() {
        let pool = db::test_pool().await;
        assert_eq!(load_greeting(&pool, 1, Kind::Welcome).await.unwrap(), None);

        save_greeting(&pool, 1, Kind::Welcome, 10, "hi {user}").await.unwrap();
        save_greeting(&pool, 1, Kind::Welcome, 11, "hello {user}").await.unwrap();
        assert_eq!(
            load_greeting(&pool, 1, Kind::Welcome).await.unwrap(),
            Some(Greeting {
                channel_id: 11,
                script: "hello {user}".to_string()
            })
        );
        assert_eq!(load_greeting(&pool, 1, Kind::Goodbye).await.unwrap(), None);

        assert!(delete_greeting(&pool, 1, Kind::Welcome).await.unwrap());
        assert!(!delete_greeting(&pool, 1, Kind::Welcome).await.unwrap());
    }
}
