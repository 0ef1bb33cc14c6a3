use std::time::Instant;

use ::serenity::model::guild::audit_log::{
    Action as AuditAction, ChannelAction, MemberAction, RoleAction, WebhookAction,
};
use poise::serenity_prelude::{self as serenity, Mentionable};
use tracing::{debug, info, warn};

use super::{Action, Actor, Exemption, Protection, Punishment, Verdict};
use crate::{Data, Error, util};

/// A protected action observed on the gateway.
#[derive(Debug, Clone)]
pub struct Incident {
    pub guild_id: serenity::GuildId,
    pub action: Action,
    /// Audit log target the actor must have acted on, when known.
    pub target: Option<u64>,
    pub revert: Option<Revert>,
}

/// Undo steps applied once an incident is punished.
#[derive(Debug, Clone)]
pub enum Revert {
    RolePermissions {
        role_id: serenity::RoleId,
        permissions: serenity::Permissions,
    },
    BanBot(serenity::UserId),
    DeleteRole(serenity::RoleId),
    DeleteChannel(serenity::ChannelId),
}

impl Revert {
    fn summary(&self) -> &'static str {
        match self {
            Revert::RolePermissions { .. } => "restored the role's permissions",
            Revert::BanBot(_) => "banned the bot",
            Revert::DeleteRole(_) => "deleted the role",
            Revert::DeleteChannel(_) => "deleted the channel",
        }
    }
}

/// A trimmed audit log entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AuditHit {
    pub user_id: u64,
    pub target_id: Option<u64>,
    pub created_at: i64,
}

fn audit_action(action: Action) -> AuditAction {
    match action {
        Action::RoleUpdate => AuditAction::Role(RoleAction::Update),
        Action::RoleCreate => AuditAction::Role(RoleAction::Create),
        Action::RoleDelete => AuditAction::Role(RoleAction::Delete),
        Action::ChannelCreate => AuditAction::Channel(ChannelAction::Create),
        Action::ChannelDelete => AuditAction::Channel(ChannelAction::Delete),
        Action::Ban => AuditAction::Member(MemberAction::BanAdd),
        Action::Kick => AuditAction::Member(MemberAction::Kick),
        Action::BotAdd => AuditAction::Member(MemberAction::BotAdd),
        Action::WebhookCreate => AuditAction::Webhook(WebhookAction::Create),
    }
}

/// Picks the newest entry matching `target` that is at most `max_age` seconds old.
pub fn pick_actor(hits: &[AuditHit], target: Option<u64>, now: i64, max_age: i64) -> Option<u64> {
    hits.iter()
        .filter(|hit| now - hit.created_at <= max_age)
        .filter(|hit| target.is_none() || hit.target_id == target)
        .max_by_key(|hit| hit.created_at)
        .map(|hit| hit.user_id)
}

async fn find_actor(
    ctx: &serenity::Context,
    data: &Data,
    incident: &Incident,
) -> Result<Option<u64>, serenity::Error> {
    let logs = incident
        .guild_id
        .audit_logs(
            &ctx.http,
            Some(audit_action(incident.action)),
            None,
            None,
            Some(5),
        )
        .await?;
    let hits: Vec<AuditHit> = logs
        .entries
        .iter()
        .map(|entry| AuditHit {
            user_id: entry.user_id.get(),
            target_id: entry.target_id.map(|id| id.get()),
            created_at: entry.id.created_at().unix_timestamp(),
        })
        .collect();
    Ok(pick_actor(
        &hits,
        incident.target,
        chrono::Utc::now().timestamp(),
        data.config.antinuke.audit_max_age_secs,
    ))
}

/// Runs an incident through attribution, counting, evaluation and punishment.
pub async fn handle(ctx: &serenity::Context, data: &Data, incident: Incident) -> Result<(), Error> {
    let guild_id = incident.guild_id;
    let protection = super::load(&data.db_pool, guild_id.get()).await?;
    if !protection.module(incident.action).enabled {
        return Ok(());
    }

    let Some(actor_id) = find_actor(ctx, data, &incident).await? else {
        debug!(guild_id = %guild_id, action = incident.action.key(), "no audit log entry for incident");
        return Ok(());
    };
    let owner_id = util::guild_owner(ctx, guild_id).await?;
    let actor = Actor {
        id: actor_id,
        owner_id: owner_id.get(),
        bot_id: ctx.cache.current_user().id.get(),
    };

    let count = data
        .antinuke
        .hit((guild_id.get(), actor_id, incident.action), Instant::now()) as u32;
    let verdict = super::evaluate(&protection, incident.action, actor, count);
    debug!(guild_id = %guild_id, actor_id, action = incident.action.key(), ?verdict, "antinuke verdict");

    let actor_user = serenity::UserId::new(actor_id);
    let Verdict::Punish { punishment, .. } = verdict else {
        if let Some(description) = describe(actor_user, incident.action, verdict, Ok(()), None) {
            log_incident(ctx, &protection, description).await;
        }
        return Ok(());
    };

    let mut reverted = None;
    if let Some(revert) = &incident.revert {
        match apply_revert(ctx, guild_id, revert).await {
            Ok(()) => reverted = Some(revert.summary()),
            Err(e) => {
                warn!(guild_id = %guild_id, ?revert, "failed to revert antinuke incident: {e}")
            }
        }
    }

    let outcome = punish(ctx, guild_id, actor_user, owner_id, punishment, incident.action).await;
    data.antinuke
        .reset(&(guild_id.get(), actor_id, incident.action));
    match &outcome {
        Ok(()) => {
            info!(guild_id = %guild_id, actor_id, action = incident.action.key(), punishment = punishment.key(), "antinuke punished actor")
        }
        Err(reason) => warn!(guild_id = %guild_id, actor_id, "antinuke could not punish: {reason}"),
    }

    let outcome = outcome.as_ref().map(|_| ()).map_err(String::as_str);
    if let Some(description) = describe(actor_user, incident.action, verdict, outcome, reverted) {
        log_incident(ctx, &protection, description).await;
    }
    Ok(())
}

/// Log channel text for a verdict. Disabled modules and the bot's own
/// actions are not reported.
pub fn describe(
    actor: serenity::UserId,
    action: Action,
    verdict: Verdict,
    outcome: Result<(), &str>,
    reverted: Option<&str>,
) -> Option<String> {
    let actor = actor.mention();
    let action = action.key();
    let text = match verdict {
        Verdict::Exempt(Exemption::Disabled | Exemption::OwnAction) => return None,
        Verdict::Exempt(exemption) => {
            let why = match exemption {
                Exemption::Owner => "server owner",
                Exemption::Admin => "antinuke admin",
                _ => "whitelisted",
            };
            format!("{actor} triggered **{action}** and was allowed ({why}).")
        }
        Verdict::Tolerated { count, threshold } => {
            format!("{actor} triggered **{action}** ({count}/{threshold} in window).")
        }
        Verdict::Punish { punishment, count } => match outcome {
            Ok(()) => format!(
                "{actor} triggered **{action}** ({count} in window) and was punished with **{}**.",
                punishment.key()
            ),
            Err(reason) => format!(
                "{actor} triggered **{action}** ({count} in window) but could not be punished: {reason}"
            ),
        },
    };
    Some(match reverted {
        Some(summary) => format!("{text}\nReverted: {summary}."),
        None => text,
    })
}

async fn apply_revert(
    ctx: &serenity::Context,
    guild_id: serenity::GuildId,
    revert: &Revert,
) -> Result<(), serenity::Error> {
    match revert {
        Revert::RolePermissions {
            role_id,
            permissions,
        } => {
            guild_id
                .edit_role(
                    &ctx.http,
                    *role_id,
                    serenity::EditRole::new()
                        .permissions(*permissions)
                        .audit_log_reason("Antinuke: reverting permission escalation"),
                )
                .await?;
        }
        Revert::BanBot(bot_id) => {
            guild_id
                .ban_with_reason(&ctx.http, *bot_id, 0, "Antinuke: unauthorized bot")
                .await?;
        }
        Revert::DeleteRole(role_id) => {
            guild_id.delete_role(&ctx.http, *role_id).await?;
        }
        Revert::DeleteChannel(channel_id) => {
            channel_id.delete(&ctx.http).await?;
        }
    }
    Ok(())
}

async fn punish(
    ctx: &serenity::Context,
    guild_id: serenity::GuildId,
    actor: serenity::UserId,
    owner: serenity::UserId,
    punishment: Punishment,
    action: Action,
) -> Result<(), String> {
    let roles = util::guild_roles(ctx, guild_id)
        .await
        .map_err(|e| e.to_string())?;
    let bot_id = ctx.cache.current_user().id;
    let bot_top = util::member_top_position(ctx, guild_id, &roles, bot_id)
        .await
        .unwrap_or(0);
    // An actor that already left can still be banned.
    let actor_top = util::member_top_position(ctx, guild_id, &roles, actor)
        .await
        .unwrap_or(0);
    if !super::can_punish(bot_top, actor_top, actor == owner) {
        return Err("their highest role is not below mine".to_string());
    }

    let reason = format!("Antinuke: {}", action.key());
    let result = match punishment {
        Punishment::Ban => {
            guild_id
                .ban_with_reason(&ctx.http, actor, 0, &reason)
                .await
        }
        Punishment::Kick => guild_id.kick_with_reason(&ctx.http, actor, &reason).await,
        Punishment::Strip => guild_id
            .edit_member(
                &ctx.http,
                actor,
                serenity::EditMember::new()
                    .roles(Vec::<serenity::RoleId>::new())
                    .audit_log_reason(&reason),
            )
            .await
            .map(|_| ()),
    };
    result.map_err(|e| e.to_string())
}

async fn log_incident(ctx: &serenity::Context, protection: &Protection, description: String) {
    let Some(channel_id) = protection.log_channel else {
        return;
    };
    let embed = serenity::CreateEmbed::new()
        .title("Antinuke")
        .description(description)
        .timestamp(serenity::Timestamp::now())
        .color(serenity::Color::DARK_RED);
    if let Err(e) = serenity::ChannelId::new(channel_id)
        .send_message(&ctx.http, serenity::CreateMessage::new().embed(embed))
        .await
    {
        warn!(channel_id, "failed to write antinuke log: {e}");
    }
}

pub fn role_update(old: Option<&serenity::Role>, new: &serenity::Role) -> Option<Incident> {
    let old = old?;
    if super::dangerous_permissions_gained(old.permissions, new.permissions).is_empty() {
        return None;
    }
    Some(Incident {
        guild_id: new.guild_id,
        action: Action::RoleUpdate,
        target: Some(new.id.get()),
        revert: Some(Revert::RolePermissions {
            role_id: new.id,
            permissions: old.permissions,
        }),
    })
}

pub fn role_create(role: &serenity::Role) -> Incident {
    Incident {
        guild_id: role.guild_id,
        action: Action::RoleCreate,
        target: Some(role.id.get()),
        revert: Some(Revert::DeleteRole(role.id)),
    }
}

pub fn role_delete(guild_id: serenity::GuildId, role_id: serenity::RoleId) -> Incident {
    Incident {
        guild_id,
        action: Action::RoleDelete,
        target: Some(role_id.get()),
        revert: None,
    }
}

pub fn channel_create(channel: &serenity::GuildChannel) -> Incident {
    Incident {
        guild_id: channel.guild_id,
        action: Action::ChannelCreate,
        target: Some(channel.id.get()),
        revert: Some(Revert::DeleteChannel(channel.id)),
    }
}

pub fn channel_delete(channel: &serenity::GuildChannel) -> Incident {
    Incident {
        guild_id: channel.guild_id,
        action: Action::ChannelDelete,
        target: Some(channel.id.get()),
        revert: None,
    }
}

pub fn ban(guild_id: serenity::GuildId, user: &serenity::User) -> Incident {
    Incident {
        guild_id,
        action: Action::Ban,
        target: Some(user.id.get()),
        revert: None,
    }
}

/// Member removals are only kicks when the audit log says so; `handle`
/// ignores incidents without a matching entry.
pub fn kick(guild_id: serenity::GuildId, user: &serenity::User) -> Incident {
    Incident {
        guild_id,
        action: Action::Kick,
        target: Some(user.id.get()),
        revert: None,
    }
}

pub fn bot_add(member: &serenity::Member) -> Option<Incident> {
    if !member.user.bot {
        return None;
    }
    Some(Incident {
        guild_id: member.guild_id,
        action: Action::BotAdd,
        target: Some(member.user.id.get()),
        revert: Some(Revert::BanBot(member.user.id)),
    })
}

pub fn webhook_create(guild_id: serenity::GuildId) -> Incident {
    Incident {
        guild_id,
        action: Action::WebhookCreate,
        target: None,
        revert: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hit(user_id: u64, target_id: Option<u64>, created_at: i64) -> AuditHit {
        AuditHit {
            user_id,
            target_id,
            created_at,
        }
    }

    #[test]
    fn picks_newest_matching_entry() {
        let hits = [hit(1, Some(50), 95), hit(2, Some(50), 99), hit(3, Some(60), 100)];
        assert_eq!(pick_actor(&hits, Some(50), 100, 10), Some(2));
        assert_eq!(pick_actor(&hits, Some(60), 100, 10), Some(3));
        assert_eq!(pick_actor(&hits, None, 100, 10), Some(3));
    }

    #[test]
    fn ignores_stale_or_unrelated_entries() {
        let hits = [hit(1, Some(50), 80), hit(2, Some(51), 100)];
        assert_eq!(pick_actor(&hits, Some(50), 100, 10), None);
        assert_eq!(pick_actor(&[], None, 100, 10), None);
    }

    #[test]
    fn every_reported_verdict_names_the_outcome() {
        let actor = serenity::UserId::new(42);
        assert_eq!(
            describe(actor, Action::Ban, Verdict::Exempt(Exemption::Whitelisted), Ok(()), None)
                .as_deref(),
            Some("<@42> triggered **ban** and was allowed (whitelisted).")
        );
        assert_eq!(
            describe(
                actor,
                Action::Ban,
                Verdict::Tolerated { count: 1, threshold: 3 },
                Ok(()),
                None
            )
            .as_deref(),
            Some("<@42> triggered **ban** (1/3 in window).")
        );
        let punish = Verdict::Punish {
            punishment: Punishment::Ban,
            count: 3,
        };
        assert_eq!(
            describe(actor, Action::BotAdd, punish, Ok(()), Some(Revert::BanBot(actor).summary()))
                .as_deref(),
            Some(
                "<@42> triggered **bot_add** (3 in window) and was punished with **ban**.\n\
                 Reverted: banned the bot."
            )
        );
        assert!(
            describe(actor, Action::Ban, punish, Err("no permission"), None)
                .is_some_and(|text| text.ends_with("could not be punished: no permission"))
        );
        assert_eq!(
            describe(actor, Action::Ban, Verdict::Exempt(Exemption::OwnAction), Ok(()), None),
            None
        );
    }

    #[test]
    fn unauthorized_bots_are_banned() {
        assert_eq!(Revert::BanBot(serenity::UserId::new(1)).summary(), "banned the bot");
    }

    #[test]
    fn every_action_has_an_audit_filter() {
        for action in Action::ALL {
            let _ = audit_action(action);
        }
        assert!(matches!(
            audit_action(Action::Ban),
            AuditAction::Member(MemberAction::BanAdd)
        ));
    }
}
