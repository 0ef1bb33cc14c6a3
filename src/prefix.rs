use sqlx::SqlitePool;
use tracing::error;

use crate::{Context, Data, Error};

pub const MAX_LEN: usize = 10;

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum PrefixError {
    #[error("The prefix can't be empty or contain spaces.")]
    Invalid,
    #[error("The prefix cannot be longer than 10 characters.")]
    TooLong,
}

pub fn validate(prefix: &str) -> Result<&str, PrefixError> {
    let prefix = prefix.trim();
    if prefix.is_empty() || prefix.contains(char::is_whitespace) {
        return Err(PrefixError::Invalid);
    }
    if prefix.chars().count() > MAX_LEN {
        return Err(PrefixError::TooLong);
    }
    Ok(prefix)
}

pub async fn get(pool: &SqlitePool, guild_id: u64) -> Result<Option<String>, sqlx::Error> {
    sqlx::query_scalar("SELECT prefix FROM guild_prefixes WHERE guild_id = ?")
        .bind(guild_id as i64)
        .fetch_optional(pool)
        .await
}

pub async fn store(pool: &SqlitePool, guild_id: u64, prefix: &str) -> Result<(), sqlx::Error> {
    sqlx::query(
        "INSERT INTO guild_prefixes (guild_id, prefix) VALUES (?, ?)
         ON CONFLICT (guild_id) DO UPDATE SET prefix = excluded.prefix",
    )
    .bind(guild_id as i64)
    .bind(prefix)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn clear(pool: &SqlitePool, guild_id: u64) -> Result<bool, sqlx::Error> {
    let result = sqlx::query("DELETE FROM guild_prefixes WHERE guild_id = ?")
        .bind(guild_id as i64)
        .execute(pool)
        .await?;
    Ok(result.rows_affected() > 0)
}

/// Prefix for the guild a message came from, or the configured default.
pub async fn resolve(ctx: poise::PartialContext<'_, Data, Error>) -> Result<Option<String>, Error> {
    let default = ctx.data.config.discord.default_prefix.clone();
    let Some(guild_id) = ctx.guild_id else {
        return Ok(Some(default));
    };
    match get(&ctx.data.db_pool, guild_id.get()).await {
        Ok(prefix) => Ok(Some(prefix.unwrap_or(default))),
        Err(e) => {
            error!(guild_id = %guild_id, "database error fetching prefix: {e}");
            Ok(Some(default))
        }
    }
}

/// Show or change the command prefix.
#[poise::command(
    slash_command,
    prefix_command,
    guild_only,
    subcommands("set", "reset")
)]
pub async fn prefix(ctx: Context<'_>) -> Result<(), Error> {
    let guild_id = ctx.guild_id().ok_or_else(|| anyhow::anyhow!("guild only"))?;
    let current = get(&ctx.data().db_pool, guild_id.get())
        .await?
        .unwrap_or_else(|| ctx.data().config.discord.default_prefix.clone());
    ctx.say(format!("The prefix here is `{}`.", current)).await?;
    Ok(())
}

/// Sets the command prefix for this guild.
#[poise::command(slash_command, prefix_command, guild_only, required_permissions = "ADMINISTRATOR")]
pub async fn set(
    ctx: Context<'_>,
    #[description = "The new prefix to use (max 10 characters)"] new_prefix: String,
) -> Result<(), Error> {
    let guild_id = ctx.guild_id().ok_or_else(|| anyhow::anyhow!("guild only"))?;
    let new_prefix = validate(&new_prefix)?;
    store(&ctx.data().db_pool, guild_id.get(), new_prefix).await?;
    ctx.say(format!(
        "Command prefix for this guild has been set to `{}`.",
        new_prefix
    ))
    .await?;
    Ok(())
}

/// Goes back to the default prefix.
#[poise::command(slash_command, prefix_command, guild_only, required_permissions = "ADMINISTRATOR")]
pub async fn reset(ctx: Context<'_>) -> Result<(), Error> {
    let guild_id = ctx.guild_id().ok_or_else(|| anyhow::anyhow!("guild only"))?;
    clear(&ctx.data().db_pool, guild_id.get()).await?;
    ctx.say(format!(
        "Command prefix reset to `{}`.",
        ctx.data().config.discord.default_prefix
    ))
    .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;

    #[test]
    fn validation() {
        assert_eq!(validate(" ! "), Ok("!"));
        assert_eq!(validate("abcdefghij"), Ok("abcdefghij"));
        assert_eq!(validate("abcdefghijk"), Err(PrefixError::TooLong));
        assert_eq!(validate(""), Err(PrefixError::Invalid));
        assert_eq!(validate("a b"), Err(PrefixError::Invalid));
    }

    #[tokio::test]
    async fn store_and_clear() {
        let pool = db::test_pool().await;
        assert_eq!(get(&pool, 1).await.unwrap(), None);
        store(&pool, 1, "!").await.unwrap();
        store(&pool, 1, "?").await.unwrap();
        assert_eq!(get(&pool, 1).await.unwrap().as_deref(), Some("?"));
        assert!(clear(&pool, 1).await.unwrap());
        assert_eq!(get(&pool, 1).await.unwrap(), None);
    }
}
