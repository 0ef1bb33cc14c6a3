use poise::serenity_prelude::{self as serenity, Mentionable};

use crate::{Context, Error, util};

const COMMANDS_PER_PAGE: usize = 12;

/// Flattens the command tree into `(usage, description)` pairs, skipping hidden commands.
pub fn help_entries<U, E>(commands: &[poise::Command<U, E>]) -> Vec<(String, String)> {
    fn walk<U, E>(prefix: &str, commands: &[poise::Command<U, E>], out: &mut Vec<(String, String)>) {
        for command in commands.iter().filter(|c| !c.hide_in_help) {
            let name = if prefix.is_empty() {
                command.name.clone()
            } else {
                format!("{} {}", prefix, command.name)
            };
            if command.subcommands.is_empty() {
                let params = command
                    .parameters
                    .iter()
                    .map(|p| {
                        if p.required {
                            format!(" <{}>", p.name)
                        } else {
                            format!(" [{}]", p.name)
                        }
                    })
                    .collect::<String>();
                let description = command
                    .description
                    .clone()
                    .unwrap_or_else(|| "No description.".to_string());
                out.push((format!("{}{}", name, params), description));
            } else {
                walk(&name, &command.subcommands, out);
            }
        }
    }

    let mut out = Vec::new();
    walk("", commands, &mut out);
    out
}

pub fn page_count(entries: usize, per_page: usize) -> usize {
    entries.div_ceil(per_page.max(1)).max(1)
}

fn help_page(
    entries: &[(String, String)],
    page: usize,
    pages: usize,
    prefix: &str,
) -> serenity::CreateEmbed {
    let mut embed = serenity::CreateEmbed::new()
        .title("Bot Commands Help")
        .description(format!(
            "Use `{}` before commands or `/` for slash commands",
            prefix
        ))
        .footer(serenity::CreateEmbedFooter::new(format!(
            "Page {}/{}",
            page + 1,
            pages
        )))
        .color(serenity::Color::DARK_RED);
    for (usage, description) in entries
        .iter()
        .skip(page * COMMANDS_PER_PAGE)
        .take(COMMANDS_PER_PAGE)
    {
        embed = embed.field(format!("{}{}", prefix, usage), description, false);
    }
    embed
}

/// Show help menu with all available commands
#[poise::command(slash_command, prefix_command)]
pub async fn help(ctx: Context<'_>) -> Result<(), Error> {
    let prefix = match ctx.guild_id() {
        Some(guild_id) => crate::prefix::get(&ctx.data().db_pool, guild_id.get())
            .await?
            .unwrap_or_else(|| ctx.data().config.discord.default_prefix.clone()),
        None => ctx.data().config.discord.default_prefix.clone(),
    };
    let entries = help_entries(&ctx.framework().options().commands);
    let pages = page_count(entries.len(), COMMANDS_PER_PAGE);

    let ctx_id = ctx.id();
    let prev_button_id = format!("{}prev", ctx_id);
    let next_button_id = format!("{}next", ctx_id);
    let components = serenity::CreateActionRow::Buttons(vec![
        serenity::CreateButton::new(&prev_button_id).emoji('◀'),
        serenity::CreateButton::new(&next_button_id).emoji('▶'),
    ]);
    ctx.send(
        poise::CreateReply::default()
            .embed(help_page(&entries, 0, pages, &prefix))
            .ephemeral(true)
            .components(vec![components]),
    )
    .await?;

    let mut current_page = 0;
    while let Some(press) = serenity::collector::ComponentInteractionCollector::new(ctx)
        .filter(move |press| press.data.custom_id.starts_with(&ctx_id.to_string()))
        .timeout(std::time::Duration::from_secs(600))
        .await
    {
        if press.data.custom_id == next_button_id {
            current_page = (current_page + 1) % pages;
        } else if press.data.custom_id == prev_button_id {
            current_page = current_page.checked_sub(1).unwrap_or(pages - 1);
        } else {
            continue;
        }

        press
            .create_response(
                ctx.serenity_context(),
                serenity::CreateInteractionResponse::UpdateMessage(
                    serenity::CreateInteractionResponseMessage::new()
                        .embed(help_page(&entries, current_page, pages, &prefix)),
                ),
            )
            .await?;
    }

    Ok(())
}

/// Ping command: shows shard id of the current context, api latency and uptime.
#[poise::command(slash_command, prefix_command)]
pub async fn ping(ctx: Context<'_>) -> Result<(), Error> {
    let now = std::time::Instant::now();
    let reply = ctx.say("Pinging...").await?;
    let api_latency = now.elapsed();

    let shard = ctx.serenity_context().shard_id;
    let uptime = ctx.data().start_time.elapsed();

    let response = format!(
        "Pong!\n\
        • Shard ID: {}\n\
        • API latency: {} ms\n\
        • Uptime: {}",
        shard,
        api_latency.as_millis(),
        util::format_duration(uptime)
    );
    reply
        .edit(ctx, poise::CreateReply::default().content(response))
        .await?;
    Ok(())
}

/// Shows an embed about the bot.
#[poise::command(slash_command, prefix_command)]
pub async fn about(ctx: Context<'_>) -> Result<(), Error> {
    let guilds = ctx.cache().guild_count();
    let embed = serenity::CreateEmbed::new()
        .title("Aegis")
        .description(
            "A community bot for moderation, server protection, leveling and a small economy. \
             Written in Rust.",
        )
        .field("Servers", guilds.to_string(), true)
        .field(
            "Uptime",
            util::humanize(ctx.data().start_time.elapsed()),
            true,
        )
        .field("Version", env!("CARGO_PKG_VERSION"), true)
        .color(serenity::Color::DARK_RED);
    ctx.send(poise::CreateReply::default().embed(embed)).await?;
    Ok(())
}

/// Show someone's avatar.
#[poise::command(slash_command, prefix_command, aliases("av", "pfp"))]
pub async fn avatar(
    ctx: Context<'_>,
    #[description = "User"] user: Option<serenity::User>,
) -> Result<(), Error> {
    let user = user.as_ref().unwrap_or_else(|| ctx.author());
    let embed = serenity::CreateEmbed::new()
        .title(format!("{}'s avatar", user.name))
        .image(user.face())
        .color(serenity::Color::DARK_RED);
    ctx.send(poise::CreateReply::default().embed(embed)).await?;
    Ok(())
}

/// Account and membership details.
#[poise::command(slash_command, prefix_command, aliases("ui", "whois"))]
pub async fn userinfo(
    ctx: Context<'_>,
    #[description = "User"] user: Option<serenity::User>,
) -> Result<(), Error> {
    let user = user.as_ref().unwrap_or_else(|| ctx.author());
    let mut embed = serenity::CreateEmbed::new()
        .author(serenity::CreateEmbedAuthor::new(&user.name).icon_url(user.face()))
        .thumbnail(user.face())
        .field("ID", user.id.to_string(), true)
        .field("Bot", if user.bot { "yes" } else { "no" }, true)
        .field(
            "Created",
            format!("<t:{}:R>", user.created_at().unix_timestamp()),
            true,
        )
        .color(serenity::Color::DARK_RED);

    if let Some(guild_id) = ctx.guild_id() {
        if let Ok(member) = guild_id.member(ctx, user.id).await {
            if let Some(joined) = member.joined_at {
                embed = embed.field("Joined", format!("<t:{}:R>", joined.unix_timestamp()), true);
            }
            if let Some(boosting) = member.premium_since {
                embed = embed.field(
                    "Boosting since",
                    format!("<t:{}:R>", boosting.unix_timestamp()),
                    true,
                );
            }
            let roles = if member.roles.is_empty() {
                "none".to_string()
            } else {
                member
                    .roles
                    .iter()
                    .take(20)
                    .map(|r| r.mention().to_string())
                    .collect::<Vec<_>>()
                    .join(" ")
            };
            embed = embed.field(format!("Roles ({})", member.roles.len()), roles, false);
        }
    }
    ctx.send(poise::CreateReply::default().embed(embed)).await?;
    Ok(())
}

/// Details about this server.
#[poise::command(slash_command, prefix_command, guild_only, aliases("si"))]
pub async fn serverinfo(ctx: Context<'_>) -> Result<(), Error> {
    let embed = {
        let Some(guild) = ctx.guild() else {
            anyhow::bail!("This server is not cached yet, try again in a moment.");
        };
        let mut embed = serenity::CreateEmbed::new()
            .title(&guild.name)
            .field("Owner", guild.owner_id.mention().to_string(), true)
            .field("Members", guild.member_count.to_string(), true)
            .field("Channels", guild.channels.len().to_string(), true)
            .field("Roles", guild.roles.len().to_string(), true)
            .field(
                "Boosts",
                format!(
                    "{} (tier {})",
                    guild.premium_subscription_count.unwrap_or(0),
                    u8::from(guild.premium_tier)
                ),
                true,
            )
            .field(
                "Created",
                format!("<t:{}:R>", guild.id.created_at().unix_timestamp()),
                true,
            )
            .footer(serenity::CreateEmbedFooter::new(format!("ID: {}", guild.id)))
            .color(serenity::Color::DARK_RED);
        if let Some(icon) = guild.icon_url() {
            embed = embed.thumbnail(icon);
        }
        embed
    };
    ctx.send(poise::CreateReply::default().embed(embed)).await?;
    Ok(())
}

/// Registers application commands globally. (Owner Only)
#[poise::command(slash_command, prefix_command, owners_only)]
pub async fn sync(ctx: Context<'_>) -> Result<(), Error> {
    poise::samples::register_application_commands(ctx, true).await?;
    ctx.say("Properly registered the application commands globally.")
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pages() {
        assert_eq!(page_count(0, 12), 1);
        assert_eq!(page_count(12, 12), 1);
        assert_eq!(page_count(13, 12), 2);
    }

    #[test]
    fn help_lists_leaf_commands() {
        let commands = vec![
            crate::general::ping(),
            crate::prefix::prefix(),
            crate::moderation::ban(),
        ];
        let entries = help_entries(&commands);
        let usages: Vec<&str> = entries.iter().map(|(u, _)| u.as_str()).collect();
        assert_eq!(
            usages,
            vec!["ping", "prefix set <new_prefix>", "prefix reset", "ban <user> [reason]"]
        );
    }
}
