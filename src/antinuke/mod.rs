//! Guild protection against privilege abuse.
//!
//! Protected actions are attributed to an actor through the audit log,
//! counted per guild, actor and action inside a sliding window, and once a
//! module's threshold is reached the actor is punished and the action is
//! reverted where possible.

pub mod commands;
pub mod events;

use std::collections::{HashMap, HashSet};

use poise::serenity_prelude as serenity;
use sqlx::SqlitePool;

use crate::window::SlidingWindow;

/// Counters keyed by `(guild, actor, action)`.
pub type Tracker = SlidingWindow<(u64, u64, Action)>;

#[derive(poise::ChoiceParameter, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Action {
    #[name = "role_update"]
    RoleUpdate,
    #[name = "role_create"]
    RoleCreate,
    #[name = "role_delete"]
    RoleDelete,
    #[name = "channel_create"]
    ChannelCreate,
    #[name = "channel_delete"]
    ChannelDelete,
    #[name = "ban"]
    Ban,
    #[name = "kick"]
    Kick,
    #[name = "bot_add"]
    BotAdd,
    #[name = "webhook_create"]
    WebhookCreate,
}

impl Action {
    pub const ALL: [Action; 9] = [
        Action::RoleUpdate,
        Action::RoleCreate,
        Action::RoleDelete,
        Action::ChannelCreate,
        Action::ChannelDelete,
        Action::Ban,
        Action::Kick,
        Action::BotAdd,
        Action::WebhookCreate,
    ];

    pub fn key(self) -> &'static str {
        match self {
            Action::RoleUpdate => "role_update",
            Action::RoleCreate => "role_create",
            Action::RoleDelete => "role_delete",
            Action::ChannelCreate => "channel_create",
            Action::ChannelDelete => "channel_delete",
            Action::Ban => "ban",
            Action::Kick => "kick",
            Action::BotAdd => "bot_add",
            Action::WebhookCreate => "webhook_create",
        }
    }

    pub fn from_key(key: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|a| a.key() == key)
    }

    /// Escalations and bot additions are punished on the first occurrence.
    pub fn default_threshold(self) -> u32 {
        match self {
            Action::RoleUpdate | Action::BotAdd => 1,
            _ => 3,
        }
    }
}

#[derive(poise::ChoiceParameter, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Punishment {
    #[name = "ban"]
    Ban,
    #[name = "kick"]
    Kick,
    #[name = "strip"]
    Strip,
}

impl Punishment {
    pub fn key(self) -> &'static str {
        match self {
            Punishment::Ban => "ban",
            Punishment::Kick => "kick",
            Punishment::Strip => "strip",
        }
    }

    pub fn from_key(key: &str) -> Option<Self> {
        match key {
            "ban" => Some(Punishment::Ban),
            "kick" => Some(Punishment::Kick),
            "strip" => Some(Punishment::Strip),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModuleSettings {
    pub enabled: bool,
    pub threshold: u32,
    pub punishment: Punishment,
}

impl ModuleSettings {
    pub fn default_for(action: Action) -> Self {
        Self {
            enabled: false,
            threshold: action.default_threshold(),
            punishment: Punishment::Ban,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct Protection {
    pub modules: HashMap<Action, ModuleSettings>,
    pub whitelist: HashSet<u64>,
    pub admins: HashSet<u64>,
    pub log_channel: Option<u64>,
}

impl Protection {
    pub fn module(&self, action: Action) -> ModuleSettings {
        self.modules
            .get(&action)
            .copied()
            .unwrap_or_else(|| ModuleSettings::default_for(action))
    }

    pub fn is_trusted(&self, user_id: u64) -> bool {
        self.whitelist.contains(&user_id) || self.admins.contains(&user_id)
    }
}

/// Who performed a protected action.
#[derive(Debug, Clone, Copy)]
pub struct Actor {
    pub id: u64,
    pub owner_id: u64,
    pub bot_id: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Exemption {
    Disabled,
    Owner,
    OwnAction,
    Whitelisted,
    Admin,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Exempt(Exemption),
    Tolerated { count: u32, threshold: u32 },
    Punish { punishment: Punishment, count: u32 },
}

pub fn evaluate(protection: &Protection, action: Action, actor: Actor, count: u32) -> Verdict {
    let module = protection.module(action);
    if !module.enabled {
        return Verdict::Exempt(Exemption::Disabled);
    }
    if actor.id == actor.owner_id {
        return Verdict::Exempt(Exemption::Owner);
    }
    if actor.id == actor.bot_id {
        return Verdict::Exempt(Exemption::OwnAction);
    }
    if protection.admins.contains(&actor.id) {
        return Verdict::Exempt(Exemption::Admin);
    }
    if protection.whitelist.contains(&actor.id) {
        return Verdict::Exempt(Exemption::Whitelisted);
    }
    let threshold = module.threshold.max(1);
    if count < threshold {
        Verdict::Tolerated { count, threshold }
    } else {
        Verdict::Punish {
            punishment: module.punishment,
            count,
        }
    }
}

/// The bot can only act on members strictly below its highest role, and never on the owner.
pub fn can_punish(bot_top: u16, actor_top: u16, actor_is_owner: bool) -> bool {
    !actor_is_owner && crate::util::outranks(bot_top, actor_top)
}

pub fn dangerous_permissions() -> serenity::Permissions {
    serenity::Permissions::ADMINISTRATOR
        | serenity::Permissions::BAN_MEMBERS
        | serenity::Permissions::KICK_MEMBERS
        | serenity::Permissions::MANAGE_GUILD
        | serenity::Permissions::MANAGE_ROLES
        | serenity::Permissions::MANAGE_CHANNELS
        | serenity::Permissions::MANAGE_WEBHOOKS
        | serenity::Permissions::MENTION_EVERYONE
}

/// Dangerous permissions present in `new` but not in `old`.
pub fn dangerous_permissions_gained(
    old: serenity::Permissions,
    new: serenity::Permissions,
) -> serenity::Permissions {
    new & !old & dangerous_permissions()
}

#[derive(sqlx::FromRow)]
struct ModuleRow {
    action: String,
    enabled: bool,
    threshold: i64,
    punishment: String,
}

pub async fn load(pool: &SqlitePool, guild_id: u64) -> Result<Protection, sqlx::Error> {
    let mut protection = Protection::default();

    let rows: Vec<ModuleRow> = sqlx::query_as(
        "SELECT action, enabled, threshold, punishment FROM antinuke_modules WHERE guild_id = ?",
    )
    .bind(guild_id as i64)
    .fetch_all(pool)
    .await?;
    for row in rows {
        let Some(action) = Action::from_key(&row.action) else {
            continue;
        };
        protection.modules.insert(
            action,
            ModuleSettings {
                enabled: row.enabled,
                threshold: row.threshold.clamp(1, u32::MAX as i64) as u32,
                punishment: Punishment::from_key(&row.punishment).unwrap_or(Punishment::Ban),
            },
        );
    }

    let trusted: Vec<(i64, String)> =
        sqlx::query_as("SELECT user_id, kind FROM antinuke_trusted WHERE guild_id = ?")
            .bind(guild_id as i64)
            .fetch_all(pool)
            .await?;
    for (user_id, kind) in trusted {
        match kind.as_str() {
            "admin" => protection.admins.insert(user_id as u64),
            _ => protection.whitelist.insert(user_id as u64),
        };
    }

    protection.log_channel =
        sqlx::query_scalar::<_, Option<i64>>("SELECT log_channel_id FROM antinuke_config WHERE guild_id = ?")
            .bind(guild_id as i64)
            .fetch_optional(pool)
            .await?
            .flatten()
            .map(|id| id as u64);

    Ok(protection)
}

pub async fn save_module(
    pool: &SqlitePool,
    guild_id: u64,
    action: Action,
    module: ModuleSettings,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        "INSERT INTO antinuke_modules (guild_id, action, enabled, threshold, punishment)
         VALUES (?, ?, ?, ?, ?)
         ON CONFLICT (guild_id, action) DO UPDATE SET
            enabled = excluded.enabled,
            threshold = excluded.threshold,
            punishment = excluded.punishment",
    )
    .bind(guild_id as i64)
    .bind(action.key())
    .bind(module.enabled)
    .bind(module.threshold.max(1) as i64)
    .bind(module.punishment.key())
    .execute(pool)
    .await?;
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrustKind {
    Whitelist,
    Admin,
}

impl TrustKind {
    fn key(self) -> &'static str {
        match self {
            TrustKind::Whitelist => "whitelist",
            TrustKind::Admin => "admin",
        }
    }
}

/// Returns false when the user already had that trust level.
pub async fn add_trusted(
    pool: &SqlitePool,
    guild_id: u64,
    user_id: u64,
    kind: TrustKind,
) -> Result<bool, sqlx::Error> {
    let result = sqlx::query(
        "INSERT OR IGNORE INTO antinuke_trusted (guild_id, user_id, kind) VALUES (?, ?, ?)",
    )
    .bind(guild_id as i64)
    .bind(user_id as i64)
    .bind(kind.key())
    .execute(pool)
    .await?;
    Ok(result.rows_affected() > 0)
}

pub async fn remove_trusted(
    pool: &SqlitePool,
    guild_id: u64,
    user_id: u64,
    kind: TrustKind,
) -> Result<bool, sqlx::Error> {
    let result =
        sqlx::query("DELETE FROM antinuke_trusted WHERE guild_id = ? AND user_id = ? AND kind = ?")
            .bind(guild_id as i64)
            .bind(user_id as i64)
            .bind(kind.key())
            .execute(pool)
            .await?;
    Ok(result.rows_affected() > 0)
}

pub async fn set_log_channel(
    pool: &SqlitePool,
    guild_id: u64,
    channel_id: Option<u64>,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        "INSERT INTO antinuke_config (guild_id, log_channel_id) VALUES (?, ?)
         ON CONFLICT (guild_id) DO UPDATE SET log_channel_id = excluded.log_channel_id",
    )
    .bind(guild_id as i64)
    .bind(channel_id.map(|id| id as i64))
    .execute(pool)
    .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;

    fn actor(id: u64) -> Actor {
        Actor {
            id,
            owner_id: 1,
            bot_id: 2,
        }
    }

    fn enabled(action: Action, threshold: u32, punishment: Punishment) -> Protection {
        let mut protection = Protection::default();
        protection.modules.insert(
            action,
            ModuleSettings {
                enabled: true,
                threshold,
                punishment,
            },
        );
        protection
    }

    #[test]
    fn disabled_modules_never_punish() {
        let protection = Protection::default();
        assert_eq!(
            evaluate(&protection, Action::Ban, actor(10), 100),
            Verdict::Exempt(Exemption::Disabled)
        );
    }

    #[test]
    fn threshold_counting() {
        let protection = enabled(Action::ChannelDelete, 3, Punishment::Strip);
        assert_eq!(
            evaluate(&protection, Action::ChannelDelete, actor(10), 2),
            Verdict::Tolerated {
                count: 2,
                threshold: 3
            }
        );
        assert_eq!(
            evaluate(&protection, Action::ChannelDelete, actor(10), 3),
            Verdict::Punish {
                punishment: Punishment::Strip,
                count: 3
            }
        );
    }

    #[test]
    fn exemptions() {
        let mut protection = enabled(Action::RoleDelete, 1, Punishment::Ban);
        protection.whitelist.insert(20);
        protection.admins.insert(21);
        let check = |id| evaluate(&protection, Action::RoleDelete, actor(id), 5);
        assert_eq!(check(1), Verdict::Exempt(Exemption::Owner));
        assert_eq!(check(2), Verdict::Exempt(Exemption::OwnAction));
        assert_eq!(check(20), Verdict::Exempt(Exemption::Whitelisted));
        assert_eq!(check(21), Verdict::Exempt(Exemption::Admin));
        assert!(matches!(check(22), Verdict::Punish { .. }));
    }

    #[test]
    fn zero_threshold_behaves_like_one() {
        let protection = enabled(Action::Kick, 0, Punishment::Kick);
        assert!(matches!(
            evaluate(&protection, Action::Kick, actor(10), 1),
            Verdict::Punish { .. }
        ));
    }

    #[test]
    fn hierarchy() {
        assert!(can_punish(10, 5, false));
        assert!(!can_punish(5, 5, false));
        assert!(!can_punish(5, 10, false));
        assert!(!can_punish(100, 0, true));
    }

    #[test]
    fn permission_escalation() {
        use super::serenity::Permissions as P;
        let old = P::SEND_MESSAGES | P::KICK_MEMBERS;
        let new = P::SEND_MESSAGES | P::KICK_MEMBERS | P::ADMINISTRATOR | P::ATTACH_FILES;
        assert_eq!(dangerous_permissions_gained(old, new), P::ADMINISTRATOR);
        assert!(dangerous_permissions_gained(new, old).is_empty());
    }

    #[test]
    fn keys_round_trip() {
        for action in Action::ALL {
            assert_eq!(Action::from_key(action.key()), Some(action));
        }
        assert_eq!(Action::from_key("nuke"), None);
    }

    #[tokio::test]
    async fn persistence() {
        let pool = db::test_pool().await;
        let empty = load(&pool, 5).await.unwrap();
        assert_eq!(empty.module(Action::BotAdd), ModuleSettings::default_for(Action::BotAdd));
        assert_eq!(empty.log_channel, None);

        save_module(
            &pool,
            5,
            Action::ChannelCreate,
            ModuleSettings {
                enabled: true,
                threshold: 4,
                punishment: Punishment::Kick,
            },
        )
        .await
        .unwrap();
        assert!(add_trusted(&pool, 5, 30, TrustKind::Whitelist).await.unwrap());
        assert!(!add_trusted(&pool, 5, 30, TrustKind::Whitelist).await.unwrap());
        assert!(add_trusted(&pool, 5, 31, TrustKind::Admin).await.unwrap());
        set_log_channel(&pool, 5, Some(77)).await.unwrap();

        let protection = load(&pool, 5).await.unwrap();
        let module = protection.module(Action::ChannelCreate);
        assert!(module.enabled);
        assert_eq!(module.threshold, 4);
        assert_eq!(module.punishment, Punishment::Kick);
        assert!(protection.whitelist.contains(&30));
        assert!(protection.admins.contains(&31));
        assert!(protection.is_trusted(31));
        assert_eq!(protection.log_channel, Some(77));

        assert!(remove_trusted(&pool, 5, 30, TrustKind::Whitelist).await.unwrap());
        set_log_channel(&pool, 5, None).await.unwrap();
        let protection = load(&pool, 5).await.unwrap();
        assert!(!protection.whitelist.contains(&30));
        assert_eq!(protection.log_channel, None);
    }
}
