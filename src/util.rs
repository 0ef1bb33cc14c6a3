use std::{collections::HashMap, time::Duration};

use poise::serenity_prelude as serenity;

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum DurationError {
    #[error("duration is empty")]
    Empty,
    #[error("`{0}` is not a number")]
    NotANumber(String),
    #[error("unknown unit `{0}`, use s, m, h, d or w")]
    UnknownUnit(String),
    #[error("duration is too long")]
    TooLong,
}

/// Parses `30s`, `10m`, `2h`, `1d`, `1w` and compounds like `1h30m`.
/// A bare number is read as minutes.
pub fn parse_duration(input: &str) -> Result<Duration, DurationError> {
    let input = input.trim().to_lowercase();
    if input.is_empty() {
        return Err(DurationError::Empty);
    }
    if let Ok(minutes) = input.parse::<u64>() {
        let secs = minutes.checked_mul(60).ok_or(DurationError::TooLong)?;
        return Ok(Duration::from_secs(secs));
    }

    let mut total = 0u64;
    let mut digits = String::new();
    let mut chars = input.chars().peekable();
    while let Some(c) = chars.next() {
        if c.is_ascii_digit() {
            digits.push(c);
            continue;
        }
        if c.is_whitespace() {
            continue;
        }
        let mut unit = c.to_string();
        while let Some(&next) = chars.peek() {
            if next.is_ascii_alphabetic() {
                unit.push(next);
                chars.next();
            } else {
                break;
            }
        }
        let value: u64 = digits
            .parse()
            .map_err(|_| DurationError::NotANumber(digits.clone()))?;
        let multiplier = match unit.as_str() {
            "s" | "sec" | "secs" | "second" | "seconds" => 1,
            "m" | "min" | "mins" | "minute" | "minutes" => 60,
            "h" | "hr" | "hrs" | "hour" | "hours" => 3600,
            "d" | "day" | "days" => 86_400,
            "w" | "week" | "weeks" => 604_800,
            _ => return Err(DurationError::UnknownUnit(unit)),
        };
        total = value
            .checked_mul(multiplier)
            .and_then(|secs| total.checked_add(secs))
            .ok_or(DurationError::TooLong)?;
        digits.clear();
    }
    if !digits.is_empty() {
        return Err(DurationError::UnknownUnit(String::new()));
    }
    Ok(Duration::from_secs(total))
}

/// Formats a duration as H:M:S.
pub fn format_duration(d: Duration) -> String {
    let secs = d.as_secs();
    let hours = secs / 3600;
    let mins = (secs % 3600) / 60;
    let secs = secs % 60;
    format!("{:02}:{:02}:{:02}", hours, mins, secs)
}

/// Human readable span for cooldown messages, e.g. `3h 12m`.
pub fn humanize(d: Duration) -> String {
    let secs = d.as_secs();
    let (days, hours, mins) = (secs / 86_400, (secs % 86_400) / 3600, (secs % 3600) / 60);
    match (days, hours, mins) {
        (0, 0, 0) => format!("{}s", secs),
        (0, 0, m) => format!("{}m", m),
        (0, h, m) => format!("{}h {}m", h, m),
        (d, h, _) => format!("{}d {}h", d, h),
    }
}

/// Position of the highest role among `member_roles`. `@everyone` counts as 0.
pub fn top_role_position(
    roles: &HashMap<serenity::RoleId, serenity::Role>,
    member_roles: &[serenity::RoleId],
) -> u16 {
    member_roles
        .iter()
        .filter_map(|id| roles.get(id))
        .map(|role| role.position)
        .max()
        .unwrap_or(0)
}

pub fn outranks(actor: u16, target: u16) -> bool {
    actor > target
}

/// Roles of a guild, from the cache when possible.
pub async fn guild_roles(
    ctx: &serenity::Context,
    guild_id: serenity::GuildId,
) -> Result<HashMap<serenity::RoleId, serenity::Role>, serenity::Error> {
    let cached = guild_id
        .to_guild_cached(&ctx.cache)
        .map(|guild| guild.roles.clone());
    match cached {
        Some(roles) => Ok(roles),
        None => guild_id.roles(&ctx.http).await,
    }
}

pub async fn guild_owner(
    ctx: &serenity::Context,
    guild_id: serenity::GuildId,
) -> Result<serenity::UserId, serenity::Error> {
    let cached = guild_id
        .to_guild_cached(&ctx.cache)
        .map(|guild| guild.owner_id);
    match cached {
        Some(owner) => Ok(owner),
        None => Ok(guild_id.to_partial_guild(&ctx.http).await?.owner_id),
    }
}

/// Highest role position of `user_id`, or `None` when they are not a member.
pub async fn member_top_position(
    ctx: &serenity::Context,
    guild_id: serenity::GuildId,
    roles: &HashMap<serenity::RoleId, serenity::Role>,
    user_id: serenity::UserId,
) -> Option<u16> {
    let member = guild_id.member(ctx, user_id).await.ok()?;
    Some(top_role_position(roles, &member.roles))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_units() {
        assert_eq!(parse_duration("30s"), Ok(Duration::from_secs(30)));
        assert_eq!(parse_duration("10m"), Ok(Duration::from_secs(600)));
        assert_eq!(parse_duration("2h"), Ok(Duration::from_secs(7200)));
        assert_eq!(parse_duration("1d"), Ok(Duration::from_secs(86_400)));
        assert_eq!(parse_duration("1w"), Ok(Duration::from_secs(604_800)));
        assert_eq!(parse_duration("1h30m"), Ok(Duration::from_secs(5400)));
        assert_eq!(parse_duration(" 5 "), Ok(Duration::from_secs(300)));
        assert_eq!(parse_duration("3 days"), Ok(Duration::from_secs(259_200)));
    }

    #[test]
    fn rejects_garbage() {
        assert_eq!(parse_duration(""), Err(DurationError::Empty));
        assert!(matches!(parse_duration("10y"), Err(DurationError::UnknownUnit(_))));
        assert!(matches!(parse_duration("m"), Err(DurationError::NotANumber(_))));
        assert!(parse_duration("5m3").is_err());
    }

    #[test]
    fn rejects_overflowing_durations() {
        assert_eq!(parse_duration("18446744073709551615"), Err(DurationError::TooLong));
        assert_eq!(parse_duration("18446744073709551615w"), Err(DurationError::TooLong));
        assert_eq!(
            parse_duration("18446744073709551615s1s"),
            Err(DurationError::TooLong)
        );
        assert_eq!(
            parse_duration("307445734561825860"),
            Ok(Duration::from_secs(307_445_734_561_825_860 * 60))
        );
    }

    #[test]
    fn formats() {
        assert_eq!(format_duration(Duration::from_secs(3725)), "01:02:05");
        assert_eq!(humanize(Duration::from_secs(42)), "42s");
        assert_eq!(humanize(Duration::from_secs(3 * 3600 + 12 * 60)), "3h 12m");
        assert_eq!(humanize(Duration::from_secs(2 * 86_400 + 3600)), "2d 1h");
    }
}
