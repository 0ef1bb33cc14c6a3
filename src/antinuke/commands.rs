use poise::serenity_prelude::{self as serenity, Mentionable};

use super::{Action, ModuleSettings, Punishment, TrustKind};
use crate::{Context, Error, util};

/// Why the author may not run an antinuke command, if they may not.
/// The owner may do anything; antinuke admins everything but `owner_only` commands.
pub fn denial(owner_only: bool, is_owner: bool, is_admin: bool) -> Option<&'static str> {
    if is_owner || (is_admin && !owner_only) {
        None
    } else if owner_only {
        Some("Only the server owner can do that.")
    } else {
        Some("Only the server owner and antinuke admins can configure antinuke.")
    }
}

async fn gate(ctx: Context<'_>, owner_only: bool) -> Result<bool, Error> {
    let guild_id = ctx.guild_id().ok_or_else(|| anyhow::anyhow!("guild only"))?;
    let owner = util::guild_owner(ctx.serenity_context(), guild_id).await?;
    let is_owner = owner == ctx.author().id;
    let is_admin = !is_owner
        && !owner_only
        && super::load(&ctx.data().db_pool, guild_id.get())
            .await?
            .admins
            .contains(&ctx.author().id.get());
    let Some(reason) = denial(owner_only, is_owner, is_admin) else {
        return Ok(true);
    };
    ctx.send(poise::CreateReply::default().content(reason).ephemeral(true))
        .await?;
    Ok(false)
}

async fn is_owner(ctx: Context<'_>) -> Result<bool, Error> {
    gate(ctx, true).await
}

/// Passes for the guild owner and antinuke admins.
async fn is_manager(ctx: Context<'_>) -> Result<bool, Error> {
    gate(ctx, false).await
}

/// Protect the server against privilege abuse.
#[poise::command(
    slash_command,
    prefix_command,
    guild_only,
    check = "is_manager",
    subcommands(
        "status",
        "enable",
        "disable",
        "threshold",
        "punishment",
        "whitelist",
        "unwhitelist",
        "admin",
        "unadmin",
        "logs"
    ),
    subcommand_required,
    aliases("an")
)]
pub async fn antinuke(_ctx: Context<'_>) -> Result<(), Error> {
    Ok(())
}

/// Show every module and the trusted users.
#[poise::command(slash_command, prefix_command, guild_only, check = "is_manager")]
pub async fn status(ctx: Context<'_>) -> Result<(), Error> {
    let guild_id = ctx.guild_id().ok_or_else(|| anyhow::anyhow!("guild only"))?;
    let protection = super::load(&ctx.data().db_pool, guild_id.get()).await?;

    let modules = Action::ALL
        .iter()
        .map(|&action| {
            let module = protection.module(action);
            format!(
                "{} `{}` threshold {} -> {}",
                if module.enabled { "🟢" } else { "🔴" },
                action.key(),
                module.threshold,
                module.punishment.key()
            )
        })
        .collect::<Vec<_>>()
        .join("\n");
    let mention_all = |ids: &std::collections::HashSet<u64>| {
        if ids.is_empty() {
            "none".to_string()
        } else {
            ids.iter()
                .map(|id| format!("<@{}>", id))
                .collect::<Vec<_>>()
                .join(", ")
        }
    };
    let logs = protection
        .log_channel
        .map(|id| format!("<#{}>", id))
        .unwrap_or_else(|| "not set".to_string());

    let embed = serenity::CreateEmbed::new()
        .title("Antinuke")
        .description(modules)
        .field("Whitelisted", mention_all(&protection.whitelist), false)
        .field("Admins", mention_all(&protection.admins), false)
        .field("Log channel", logs, false)
        .footer(serenity::CreateEmbedFooter::new(format!(
            "Window: {}s",
            ctx.data().antinuke.span().as_secs()
        )))
        .color(serenity::Color::DARK_RED);
    ctx.send(poise::CreateReply::default().embed(embed)).await?;
    Ok(())
}

async fn update_module(
    ctx: Context<'_>,
    action: Action,
    update: impl FnOnce(&mut ModuleSettings),
) -> Result<ModuleSettings, Error> {
    let guild_id = ctx.guild_id().ok_or_else(|| anyhow::anyhow!("guild only"))?;
    let pool = &ctx.data().db_pool;
    let mut module = super::load(pool, guild_id.get()).await?.module(action);
    update(&mut module);
    super::save_module(pool, guild_id.get(), action, module).await?;
    Ok(module)
}

/// Turn a protection module on.
#[poise::command(slash_command, prefix_command, guild_only, check = "is_manager")]
pub async fn enable(
    ctx: Context<'_>,
    #[description = "Module"] action: Action,
) -> Result<(), Error> {
    let module = update_module(ctx, action, |m| m.enabled = true).await?;
    ctx.say(format!(
        "`{}` is now enabled (threshold {}, punishment {}).",
        action.key(),
        module.threshold,
        module.punishment.key()
    ))
    .await?;
    Ok(())
}

/// Turn a protection module off.
#[poise::command(slash_command, prefix_command, guild_only, check = "is_manager")]
pub async fn disable(
    ctx: Context<'_>,
    #[description = "Module"] action: Action,
) -> Result<(), Error> {
    update_module(ctx, action, |m| m.enabled = false).await?;
    ctx.say(format!("`{}` is now disabled.", action.key())).await?;
    Ok(())
}

/// How many actions inside the window trigger a punishment.
#[poise::command(slash_command, prefix_command, guild_only, check = "is_manager")]
pub async fn threshold(
    ctx: Context<'_>,
    #[description = "Module"] action: Action,
    #[description = "Actions before punishing"]
    #[min = 1]
    #[max = 100]
    count: u32,
) -> Result<(), Error> {
    if count == 0 {
        anyhow::bail!("The threshold must be at least 1.");
    }
    update_module(ctx, action, |m| m.threshold = count).await?;
    ctx.say(format!("`{}` threshold set to {}.", action.key(), count))
        .await?;
    Ok(())
}

/// What happens to members who trigger a module.
#[poise::command(slash_command, prefix_command, guild_only, check = "is_manager")]
pub async fn punishment(
    ctx: Context<'_>,
    #[description = "Module"] action: Action,
    #[description = "Punishment"] punishment: Punishment,
) -> Result<(), Error> {
    update_module(ctx, action, |m| m.punishment = punishment).await?;
    ctx.say(format!(
        "`{}` offenders will be punished with {}.",
        action.key(),
        punishment.key()
    ))
    .await?;
    Ok(())
}

async fn change_trust(
    ctx: Context<'_>,
    user: &serenity::User,
    kind: TrustKind,
    add: bool,
) -> Result<(), Error> {
    let guild_id = ctx.guild_id().ok_or_else(|| anyhow::anyhow!("guild only"))?;
    let pool = &ctx.data().db_pool;
    let changed = if add {
        super::add_trusted(pool, guild_id.get(), user.id.get(), kind).await?
    } else {
        super::remove_trusted(pool, guild_id.get(), user.id.get(), kind).await?
    };
    let what = match kind {
        TrustKind::Whitelist => "whitelisted",
        TrustKind::Admin => "an antinuke admin",
    };
    let reply = match (add, changed) {
        (true, true) => format!("{} is now {}.", user.mention(), what),
        (true, false) => format!("{} is already {}.", user.mention(), what),
        (false, true) => format!("{} is no longer {}.", user.mention(), what),
        (false, false) => format!("{} was not {}.", user.mention(), what),
    };
    ctx.say(reply).await?;
    Ok(())
}

/// Exempt a user from antinuke.
#[poise::command(slash_command, prefix_command, guild_only, check = "is_manager")]
pub async fn whitelist(
    ctx: Context<'_>,
    #[description = "User to trust"] user: serenity::User,
) -> Result<(), Error> {
    change_trust(ctx, &user, TrustKind::Whitelist, true).await
}

/// Remove a user's antinuke exemption.
#[poise::command(slash_command, prefix_command, guild_only, check = "is_manager")]
pub async fn unwhitelist(
    ctx: Context<'_>,
    #[description = "User"] user: serenity::User,
) -> Result<(), Error> {
    change_trust(ctx, &user, TrustKind::Whitelist, false).await
}

/// Let a user configure antinuke. Owner only.
#[poise::command(slash_command, prefix_command, guild_only, check = "is_owner")]
pub async fn admin(
    ctx: Context<'_>,
    #[description = "User"] user: serenity::User,
) -> Result<(), Error> {
    change_trust(ctx, &user, TrustKind::Admin, true).await
}

/// Revoke antinuke admin. Owner only.
#[poise::command(slash_command, prefix_command, guild_only, check = "is_owner")]
pub async fn unadmin(
    ctx: Context<'_>,
    #[description = "User"] user: serenity::User,
) -> Result<(), Error> {
    change_trust(ctx, &user, TrustKind::Admin, false).await
}

/// Channel for antinuke reports; omit to stop reporting.
#[poise::command(slash_command, prefix_command, guild_only, check = "is_manager")]
pub async fn logs(
    ctx: Context<'_>,
    #[description = "Log channel"] channel: Option<serenity::GuildChannel>,
) -> Result<(), Error> {
    let guild_id = ctx.guild_id().ok_or_else(|| anyhow::anyhow!("guild only"))?;
    super::set_log_channel(
        &ctx.data().db_pool,
        guild_id.get(),
        channel.as_ref().map(|c| c.id.get()),
    )
    .await?;
    let reply = match channel {
        Some(channel) => format!("Antinuke reports will go to {}.", channel.mention()),
        None => "Antinuke reporting disabled.".to_string(),
    };
    ctx.say(reply).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn owner_only_commands_tell_admins_no() {
        assert_eq!(denial(true, true, false), None);
        assert_eq!(denial(true, false, true), Some("Only the server owner can do that."));
        assert!(denial(true, false, false).is_some());
        assert_eq!(denial(false, false, true), None);
        assert_eq!(denial(false, true, false), None);
        assert!(denial(false, false, false).is_some());
    }
}
