use std::time::Duration;

use poise::serenity_prelude::{self as serenity, Mentionable};
use rand::Rng;
use sqlx::SqlitePool;
use tracing::debug;

use crate::{Context, Error, db, util};

pub const DAILY_AMOUNT: i64 = 1000;
pub const DAILY_COOLDOWN_SECS: i64 = 86_400;

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum AmountError {
    #[error("`{0}` is not an amount, use a number, `all` or `half`")]
    Invalid(String),
    #[error("the amount must be more than zero")]
    Zero,
    #[error("you only have {available} coins")]
    Insufficient { available: i64 },
}

/// Parses a positive amount, `all` or `half`, bounded by `available`.
pub fn parse_amount(input: &str, available: i64) -> Result<i64, AmountError> {
    let input = input.trim().to_lowercase();
    let amount = match input.as_str() {
        "all" => available,
        "half" => available / 2,
        other => other
            .replace(',', "")
            .parse::<i64>()
            .map_err(|_| AmountError::Invalid(other.to_string()))?,
    };
    if amount <= 0 {
        return Err(if available <= 0 && amount == 0 {
            AmountError::Insufficient { available: 0 }
        } else {
            AmountError::Zero
        });
    }
    if amount > available {
        return Err(AmountError::Insufficient { available });
    }
    Ok(amount)
}

/// Time left before the next daily claim, or `None` when it can be claimed.
pub fn daily_remaining(last_daily: Option<i64>, now: i64) -> Option<Duration> {
    let next = last_daily? + DAILY_COOLDOWN_SECS;
    (now < next).then(|| Duration::from_secs((next - now) as u64))
}

#[derive(sqlx::FromRow, Debug, Clone, Default, PartialEq, Eq)]
pub struct Account {
    pub user_id: i64,
    pub wallet: i64,
    pub bank: i64,
    pub last_daily: Option<i64>,
}

pub async fn account(pool: &SqlitePool, user_id: u64) -> Result<Account, sqlx::Error> {
    let row = sqlx::query_as::<_, Account>(
        "SELECT user_id, wallet, bank, last_daily FROM economy WHERE user_id = ?",
    )
    .bind(user_id as i64)
    .fetch_optional(pool)
    .await?;
    Ok(row.unwrap_or(Account {
        user_id: user_id as i64,
        ..Account::default()
    }))
}

async fn ensure_account<'e, E>(executor: E, user_id: u64) -> Result<(), sqlx::Error>
where
    E: sqlx::Executor<'e, Database = sqlx::Sqlite>,
{
    sqlx::query("INSERT OR IGNORE INTO economy (user_id) VALUES (?)")
        .bind(user_id as i64)
        .execute(executor)
        .await?;
    Ok(())
}

/// Pays the daily reward if the cooldown has passed; returns the new wallet.
pub async fn claim_daily(
    pool: &SqlitePool,
    user_id: u64,
    now: i64,
) -> Result<Result<i64, Duration>, sqlx::Error> {
    ensure_account(pool, user_id).await?;
    // Cooldown check and payout in one statement.
    let wallet: Option<i64> = sqlx::query_scalar(
        "UPDATE economy SET wallet = wallet + ?1, last_daily = ?2
         WHERE user_id = ?3 AND (last_daily IS NULL OR last_daily <= ?2 - ?4)
         RETURNING wallet",
    )
    .bind(DAILY_AMOUNT)
    .bind(now)
    .bind(user_id as i64)
    .bind(DAILY_COOLDOWN_SECS)
    .fetch_optional(pool)
    .await?;
    match wallet {
        Some(wallet) => Ok(Ok(wallet)),
        None => {
            let current = account(pool, user_id).await?;
            Ok(Err(daily_remaining(current.last_daily, now).unwrap_or_default()))
        }
    }
}

/// Moves `amount` between wallet and bank. A positive amount deposits.
/// Returns false when the source side is short.
pub async fn move_to_bank(pool: &SqlitePool, user_id: u64, amount: i64) -> Result<bool, sqlx::Error> {
    let result = sqlx::query(
        "UPDATE economy SET wallet = wallet - ?1, bank = bank + ?1
         WHERE user_id = ?2 AND wallet - ?1 >= 0 AND bank + ?1 >= 0",
    )
    .bind(amount)
    .bind(user_id as i64)
    .execute(pool)
    .await?;
    Ok(result.rows_affected() > 0)
}

/// Adds `delta` to the wallet, refusing to go negative.
pub async fn adjust_wallet(pool: &SqlitePool, user_id: u64, delta: i64) -> Result<bool, sqlx::Error> {
    ensure_account(pool, user_id).await?;
    let result =
        sqlx::query("UPDATE economy SET wallet = wallet + ?1 WHERE user_id = ?2 AND wallet + ?1 >= 0")
            .bind(delta)
            .bind(user_id as i64)
            .execute(pool)
            .await?;
    Ok(result.rows_affected() > 0)
}

/// Wallet to wallet payment in one transaction.
pub async fn transfer(
    pool: &SqlitePool,
    from: u64,
    to: u64,
    amount: i64,
) -> Result<bool, sqlx::Error> {
    let mut tx = pool.begin().await?;
    let debited = sqlx::query(
        "UPDATE economy SET wallet = wallet - ?1 WHERE user_id = ?2 AND wallet >= ?1",
    )
    .bind(amount)
    .bind(from as i64)
    .execute(&mut *tx)
    .await?;
    if debited.rows_affected() == 0 {
        tx.rollback().await?;
        return Ok(false);
    }
    ensure_account(&mut *tx, to).await?;
    sqlx::query("UPDATE economy SET wallet = wallet + ? WHERE user_id = ?")
        .bind(amount)
        .bind(to as i64)
        .execute(&mut *tx)
        .await?;
    tx.commit().await?;
    Ok(true)
}

pub async fn top_accounts(pool: &SqlitePool, limit: i64) -> Result<Vec<Account>, sqlx::Error> {
    sqlx::query_as(
        "SELECT user_id, wallet, bank, last_daily FROM economy
         WHERE wallet + bank > 0 ORDER BY wallet + bank DESC LIMIT ?",
    )
    .bind(limit)
    .fetch_all(pool)
    .await
}

/// Claim your daily coins.
#[poise::command(slash_command, prefix_command)]
pub async fn daily(ctx: Context<'_>) -> Result<(), Error> {
    match claim_daily(&ctx.data().db_pool, ctx.author().id.get(), db::now()).await? {
        Ok(wallet) => {
            ctx.say(format!(
                "You claimed {} coins. Your wallet now holds {}.",
                DAILY_AMOUNT, wallet
            ))
            .await?
        }
        Err(left) => {
            ctx.say(format!(
                "You already claimed today. Come back in {}.",
                util::humanize(left)
            ))
            .await?
        }
    };
    Ok(())
}

/// Show a wallet and bank balance.
#[poise::command(slash_command, prefix_command, aliases("bal"))]
pub async fn balance(
    ctx: Context<'_>,
    #[description = "User to look up"] user: Option<serenity::User>,
) -> Result<(), Error> {
    let user = user.as_ref().unwrap_or_else(|| ctx.author());
    let account = account(&ctx.data().db_pool, user.id.get()).await?;
    let embed = serenity::CreateEmbed::new()
        .author(serenity::CreateEmbedAuthor::new(&user.name).icon_url(user.face()))
        .field("Wallet", account.wallet.to_string(), true)
        .field("Bank", account.bank.to_string(), true)
        .field("Total", (account.wallet + account.bank).to_string(), true)
        .color(serenity::Color::DARK_RED);
    ctx.send(poise::CreateReply::default().embed(embed)).await?;
    Ok(())
}

/// Move coins from your wallet to the bank.
#[poise::command(slash_command, prefix_command, aliases("dep"))]
pub async fn deposit(
    ctx: Context<'_>,
    #[description = "Amount, `all` or `half`"] amount: String,
) -> Result<(), Error> {
    let pool = &ctx.data().db_pool;
    let current = account(pool, ctx.author().id.get()).await?;
    let amount = parse_amount(&amount, current.wallet)?;
    if !move_to_bank(pool, ctx.author().id.get(), amount).await? {
        anyhow::bail!("Your wallet changed, try again.");
    }
    ctx.say(format!("Deposited {} coins.", amount)).await?;
    Ok(())
}

/// Move coins from the bank to your wallet.
#[poise::command(slash_command, prefix_command, aliases("with"))]
pub async fn withdraw(
    ctx: Context<'_>,
    #[description = "Amount, `all` or `half`"] amount: String,
) -> Result<(), Error> {
    let pool = &ctx.data().db_pool;
    let current = account(pool, ctx.author().id.get()).await?;
    let amount = parse_amount(&amount, current.bank)?;
    if !move_to_bank(pool, ctx.author().id.get(), -amount).await? {
        anyhow::bail!("Your bank balance changed, try again.");
    }
    ctx.say(format!("Withdrew {} coins.", amount)).await?;
    Ok(())
}

/// Give coins from your wallet to someone.
#[poise::command(slash_command, prefix_command, aliases("give"))]
pub async fn pay(
    ctx: Context<'_>,
    #[description = "Recipient"] user: serenity::User,
    #[description = "Amount, `all` or `half`"] amount: String,
) -> Result<(), Error> {
    if user.id == ctx.author().id || user.bot {
        anyhow::bail!("You can't pay that user.");
    }
    let pool = &ctx.data().db_pool;
    let current = account(pool, ctx.author().id.get()).await?;
    let amount = parse_amount(&amount, current.wallet)?;
    if !transfer(pool, ctx.author().id.get(), user.id.get(), amount).await? {
        anyhow::bail!("Your wallet changed, try again.");
    }
    debug!(from = %ctx.author().id, to = %user.id, amount, "payment");
    ctx.say(format!("Paid {} coins to {}.", amount, user.mention()))
        .await?;
    Ok(())
}

#[derive(poise::ChoiceParameter, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    #[name = "heads"]
    Heads,
    #[name = "tails"]
    Tails,
}

/// Bet on a coin flip.
#[poise::command(slash_command, prefix_command, aliases("cf"))]
pub async fn coinflip(
    ctx: Context<'_>,
    #[description = "Amount, `all` or `half`"] amount: String,
    #[description = "Your call"] side: Side,
) -> Result<(), Error> {
    let pool = &ctx.data().db_pool;
    let current = account(pool, ctx.author().id.get()).await?;
    let amount = parse_amount(&amount, current.wallet)?;
    let landed = if rand::rng().random_bool(0.5) {
        Side::Heads
    } else {
        Side::Tails
    };
    let won = landed == side;
    let delta = if won { amount } else { -amount };
    if !adjust_wallet(pool, ctx.author().id.get(), delta).await? {
        anyhow::bail!("Your wallet changed, try again.");
    }
    let reply = if won {
        format!("It landed on {:?}. You won {} coins!", landed, amount)
    } else {
        format!("It landed on {:?}. You lost {} coins.", landed, amount)
    };
    ctx.say(reply).await?;
    Ok(())
}

/// The wealthiest users.
#[poise::command(slash_command, prefix_command, aliases("rich"))]
pub async fn richest(ctx: Context<'_>) -> Result<(), Error> {
    let accounts = top_accounts(&ctx.data().db_pool, 10).await?;
    let description = if accounts.is_empty() {
        "Nobody has any coins yet.".to_string()
    } else {
        accounts
            .iter()
            .enumerate()
            .map(|(i, a)| format!("**{}.** <@{}> {} coins", i + 1, a.user_id, a.wallet + a.bank))
            .collect::<Vec<_>>()
            .join("\n")
    };
    let embed = serenity::CreateEmbed::new()
        .title("Richest users")
        .description(description)
        .color(serenity::Color::DARK_RED);
    ctx.send(poise::CreateReply::default().embed(embed)).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn amounts() {
        assert_eq!(parse_amount("250", 1000), Ok(250));
        assert_eq!(parse_amount("1,000", 1000), Ok(1000));
        assert_eq!(parse_amount("ALL", 1000), Ok(1000));
        assert_eq!(parse_amount("half", 999), Ok(499));
        assert_eq!(parse_amount("0", 1000), Err(AmountError::Zero));
        assert_eq!(parse_amount("-5", 1000), Err(AmountError::Zero));
        assert_eq!(
            parse_amount("1001", 1000),
            Err(AmountError::Insufficient { available: 1000 })
        );
        assert_eq!(
            parse_amount("all", 0),
            Err(AmountError::Insufficient { available: 0 })
        );
        assert!(matches!(parse_amount("lots", 10), Err(AmountError::Invalid(_))));
    }

    #[test]
    fn daily_cooldown() {
        assert_eq!(daily_remaining(None, 100), None);
        assert_eq!(
            daily_remaining(Some(100), 100 + 3600),
            Some(Duration::from_secs((DAILY_COOLDOWN_SECS - 3600) as u64))
        );
        assert_eq!(daily_remaining(Some(100), 100 + DAILY_COOLDOWN_SECS), None);
    }

    #[tokio::test]
    async fn daily_then_bank() {
        let pool = db::test_pool().await;
        assert_eq!(claim_daily(&pool, 1, 1_000).await.unwrap(), Ok(DAILY_AMOUNT));
        assert!(claim_daily(&pool, 1, 2_000).await.unwrap().is_err());
        assert_eq!(
            claim_daily(&pool, 1, 1_000 + DAILY_COOLDOWN_SECS).await.unwrap(),
            Ok(2 * DAILY_AMOUNT)
        );

        assert!(move_to_bank(&pool, 1, 1500).await.unwrap());
        assert!(!move_to_bank(&pool, 1, 600).await.unwrap());
        assert!(move_to_bank(&pool, 1, -500).await.unwrap());
        let acc = account(&pool, 1).await.unwrap();
        assert_eq!((acc.wallet, acc.bank), (1000, 1000));
    }

    #[tokio::test]
    async fn concurrent_daily_claims_pay_once() {
        let pool = db::test_pool().await;
        let (a, b) = tokio::join!(
            claim_daily(&pool, 1, 1_000),
            claim_daily(&pool, 1, 1_000)
        );
        let paid = [a.unwrap(), b.unwrap()]
            .into_iter()
            .filter(|claim| claim.is_ok())
            .count();
        assert_eq!(paid, 1);
        assert_eq!(account(&pool, 1).await.unwrap().wallet, DAILY_AMOUNT);
    }

    #[tokio::test]
    async fn transfers_are_atomic() {
        let pool = db::test_pool().await;
        assert!(adjust_wallet(&pool, 1, 300).await.unwrap());
        assert!(!adjust_wallet(&pool, 1, -301).await.unwrap());

        assert!(!transfer(&pool, 1, 2, 500).await.unwrap());
        assert_eq!(account(&pool, 1).await.unwrap().wallet, 300);
        assert_eq!(account(&pool, 2).await.unwrap().wallet, 0);

        assert!(transfer(&pool, 1, 2, 200).await.unwrap());
        assert_eq!(account(&pool, 1).await.unwrap().wallet, 100);
        assert_eq!(account(&pool, 2).await.unwrap().wallet, 200);

        let top = top_accounts(&pool, 10).await.unwrap();
        assert_eq!(top.iter().map(|a| a.user_id).collect::<Vec<_>>(), vec![2, 1]);
    }
}
