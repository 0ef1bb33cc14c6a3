mod antinuke;
mod api;
mod automod;
mod config;
mod db;
mod economy;
mod embed;
mod general;
mod greet;
mod leveling;
mod moderation;
mod prefix;
mod reactionroles;
mod tickets;
mod util;
mod voicemaster;
mod window;

use std::{
    collections::HashSet,
    str::FromStr,
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};

use dotenv::dotenv;
use poise::serenity_prelude::{self as serenity, ClientBuilder, GatewayIntents};
use rand::seq::IndexedRandom;
use sqlx::SqlitePool;
use tracing::{Level, debug, error, info, warn};

use crate::config::Config;

/// Shared state, available in every command invocation and event handler.
#[derive(Clone)]
pub struct Data {
    pub db_pool: SqlitePool,
    pub start_time: Instant,
    pub config: Arc<Config>,
    pub antinuke: Arc<antinuke::Tracker>,
    pub automod: Arc<automod::Limiter>,
    pub leveling: Arc<leveling::Cooldowns>,
}

impl Data {
    fn new(config: Config, db_pool: SqlitePool) -> Self {
        Self {
            db_pool,
            start_time: Instant::now(),
            antinuke: Arc::new(antinuke::Tracker::new(Duration::from_secs(
                config.antinuke.window_secs,
            ))),
            automod: Arc::new(automod::Limiter::new(&config.automod)),
            leveling: Arc::new(leveling::Cooldowns::new(Duration::from_secs(
                config.leveling.cooldown_secs,
            ))),
            config: Arc::new(config),
        }
    }

    fn prune(&self) {
        let now = Instant::now();
        self.antinuke.prune(now);
        self.automod.messages.prune(now);
        self.automod.joins.prune(now);
        self.leveling.prune(now);
        debug!(
            antinuke = self.antinuke.len(),
            messages = self.automod.messages.len(),
            joins = self.automod.joins.len(),
            "pruned rate windows"
        );
    }
}

pub type Error = anyhow::Error;
pub type Context<'a> = poise::Context<'a, Data, Error>;

const PRESENCE_INTERVAL: Duration = Duration::from_secs(50);
const PRUNE_INTERVAL: Duration = Duration::from_secs(300);

async fn on_error(error: poise::FrameworkError<'_, Data, Error>) {
    match error {
        poise::FrameworkError::Setup { error, .. } => {
            error!("Failed to start bot: {error:?}");
        }
        poise::FrameworkError::Command { error, ctx, .. } => {
            warn!(command = %ctx.command().qualified_name, "Error in command: {error:?}");
            if let Err(e) = ctx.say(error.to_string()).await {
                error!("Error while reporting a command error: {e}");
            }
        }
        poise::FrameworkError::ArgumentParse { error, input, ctx, .. } => {
            let usage = match ctx.command().help_text.as_deref() {
                Some(help) => help.to_string(),
                None => format!("See `{}help` for usage.", ctx.prefix()),
            };
            let response = match input {
                Some(input) => format!("**Cannot parse `{}`: {}**\n{}", input, error, usage),
                None => format!("**{}**\n{}", error, usage),
            };
            if let Err(e) = ctx.say(response).await {
                error!("Error while reporting an argument error: {e}");
            }
        }
        error => {
            if let Err(e) = poise::builtins::on_error(error).await {
                error!("Error while handling error: {e}");
            }
        }
    }
}

async fn pre_command(ctx: Context<'_>) {
    info!(
        author = %ctx.author().name,
        guild_id = ?ctx.guild_id(),
        channel_id = %ctx.channel_id(),
        command = %ctx.command().qualified_name,
        "executing command"
    );
}

fn report(event: &str, result: Result<(), Error>) {
    if let Err(e) = result {
        error!(event, "Error handling event: {e:?}");
    }
}

async fn antinuke(ctx: &serenity::Context, data: &Data, incident: Option<antinuke::events::Incident>) {
    if let Some(incident) = incident {
        report("antinuke", antinuke::events::handle(ctx, data, incident).await);
    }
}

struct Handler {
    data: Data,
    presence_shards: Mutex<HashSet<u32>>,
}

#[serenity::async_trait]
impl serenity::EventHandler for Handler {
    async fn ready(&self, ctx: serenity::Context, ready: serenity::Ready) {
        use serenity::gateway::ActivityData;
        use serenity::model::user::OnlineStatus;

        info!(user = %ready.user.name, shard = %ctx.shard_id, guilds = ready.guilds.len(), "shard ready");

        let first_ready = self
            .presence_shards
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(ctx.shard_id.0);
        if !first_ready {
            return;
        }

        let prefix = self.data.config.discord.default_prefix.clone();
        tokio::spawn(async move {
            let statuses = [
                format!("{}help", prefix),
                "Watching over the server".to_string(),
                format!("{} servers", ctx.cache.guild_count()),
                "/help for commands".to_string(),
            ];
            loop {
                if let Some(status) = statuses.choose(&mut rand::rng()) {
                    ctx.set_presence(Some(ActivityData::custom(status.clone())), OnlineStatus::Online);
                }
                tokio::time::sleep(PRESENCE_INTERVAL).await;
            }
        });
    }

    async fn message(&self, ctx: serenity::Context, msg: serenity::Message) {
        report("automod", automod::on_message(&ctx, &self.data, &msg).await);
        report("leveling", leveling::on_message(&ctx, &self.data, &msg).await);
    }

    async fn guild_member_addition(&self, ctx: serenity::Context, member: serenity::Member) {
        antinuke(&ctx, &self.data, antinuke::events::bot_add(&member)).await;
        report("automod", automod::on_member_join(&ctx, &self.data, &member).await);
        report("greet", greet::on_member_join(&ctx, &self.data, &member).await);
    }

    async fn guild_member_removal(
        &self,
        ctx: serenity::Context,
        guild_id: serenity::GuildId,
        user: serenity::User,
        _member: Option<serenity::Member>,
    ) {
        antinuke(&ctx, &self.data, Some(antinuke::events::kick(guild_id, &user))).await;
        report("greet", greet::on_member_leave(&ctx, &self.data, guild_id, &user).await);
    }

    async fn guild_member_update(
        &self,
        ctx: serenity::Context,
        old: Option<serenity::Member>,
        new: Option<serenity::Member>,
        _event: serenity::GuildMemberUpdateEvent,
    ) {
        if let Some(new) = new {
            report(
                "greet",
                greet::on_member_update(&ctx, &self.data, old.as_ref(), &new).await,
            );
        }
    }

    async fn guild_role_create(&self, ctx: serenity::Context, role: serenity::Role) {
        antinuke(&ctx, &self.data, Some(antinuke::events::role_create(&role))).await;
    }

    async fn guild_role_update(
        &self,
        ctx: serenity::Context,
        old: Option<serenity::Role>,
        new: serenity::Role,
    ) {
        antinuke(&ctx, &self.data, antinuke::events::role_update(old.as_ref(), &new)).await;
    }

    async fn guild_role_delete(
        &self,
        ctx: serenity::Context,
        guild_id: serenity::GuildId,
        role_id: serenity::RoleId,
        _role: Option<serenity::Role>,
    ) {
        antinuke(&ctx, &self.data, Some(antinuke::events::role_delete(guild_id, role_id))).await;
    }

    async fn channel_create(&self, ctx: serenity::Context, channel: serenity::GuildChannel) {
        antinuke(&ctx, &self.data, Some(antinuke::events::channel_create(&channel))).await;
    }

    async fn channel_delete(
        &self,
        ctx: serenity::Context,
        channel: serenity::GuildChannel,
        _messages: Option<Vec<serenity::Message>>,
    ) {
        antinuke(&ctx, &self.data, Some(antinuke::events::channel_delete(&channel))).await;
    }

    async fn guild_ban_addition(
        &self,
        ctx: serenity::Context,
        guild_id: serenity::GuildId,
        user: serenity::User,
    ) {
        antinuke(&ctx, &self.data, Some(antinuke::events::ban(guild_id, &user))).await;
    }

    async fn webhook_update(
        &self,
        ctx: serenity::Context,
        guild_id: serenity::GuildId,
        _channel_id: serenity::ChannelId,
    ) {
        antinuke(&ctx, &self.data, Some(antinuke::events::webhook_create(guild_id))).await;
    }

    async fn voice_state_update(
        &self,
        ctx: serenity::Context,
        old: Option<serenity::VoiceState>,
        new: serenity::VoiceState,
    ) {
        report(
            "voicemaster",
            voicemaster::on_voice_state_update(&ctx, &self.data, old.as_ref(), &new).await,
        );
    }

    async fn reaction_add(&self, ctx: serenity::Context, reaction: serenity::Reaction) {
        report(
            "reactionroles",
            reactionroles::on_reaction(&ctx, &self.data, &reaction, true).await,
        );
    }

    async fn reaction_remove(&self, ctx: serenity::Context, reaction: serenity::Reaction) {
        report(
            "reactionroles",
            reactionroles::on_reaction(&ctx, &self.data, &reaction, false).await,
        );
    }

    async fn interaction_create(&self, ctx: serenity::Context, interaction: serenity::Interaction) {
        report("tickets", tickets::on_interaction(&ctx, &self.data, &interaction).await);
    }
}

#[tokio::main]
async fn main() -> Result<(), Error> {
    dotenv().ok();
    let config = Config::load()?;

    let level = Level::from_str(&config.logging.level).unwrap_or(Level::INFO);
    tracing_subscriber::fmt().with_max_level(level).init();

    let pool = db::connect(&config.database).await?;
    info!(url = %config.database.url, "database ready");

    if config.api.enabled {
        let api_config = config.api.clone();
        let api_pool = pool.clone();
        tokio::spawn(async move {
            if let Err(e) = api::serve(api_config, api_pool).await {
                error!("api server stopped: {e}");
            }
        });
    }

    let token = config.discord.token.clone();
    let shards = config.discord.shards;
    let owners = config
        .discord
        .owners
        .iter()
        .map(|&id| serenity::UserId::new(id))
        .collect();
    let data = Data::new(config, pool);

    let housekeeping = data.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(PRUNE_INTERVAL);
        loop {
            interval.tick().await;
            housekeeping.prune();
        }
    });

    let setup_data = data.clone();
    let framework = poise::Framework::builder()
        .options(poise::FrameworkOptions {
            commands: vec![
                prefix::prefix(),
                general::help(),
                general::ping(),
                general::about(),
                general::avatar(),
                general::userinfo(),
                general::serverinfo(),
                general::sync(),
                moderation::ban(),
                moderation::unban(),
                moderation::kick(),
                moderation::purge(),
                moderation::timeout(),
                moderation::untimeout(),
                moderation::warn(),
                moderation::warnings(),
                moderation::clearwarnings(),
                moderation::modlogs(),
                moderation::slowmode(),
                moderation::lock(),
                moderation::unlock(),
                antinuke::commands::antinuke(),
                automod::automod(),
                embed::embed(),
                greet::greet(),
                leveling::rank(),
                leveling::leaderboard_cmd(),
                leveling::levels(),
                economy::daily(),
                economy::balance(),
                economy::deposit(),
                economy::withdraw(),
                economy::pay(),
                economy::coinflip(),
                economy::richest(),
                reactionroles::reactionrole(),
                voicemaster::voicemaster(),
                voicemaster::voice(),
                tickets::ticket_cmd(),
            ],
            prefix_options: poise::PrefixFrameworkOptions {
                mention_as_prefix: true,
                dynamic_prefix: Some(|ctx| Box::pin(prefix::resolve(ctx))),
                ..Default::default()
            },
            owners,
            on_error: |error| Box::pin(on_error(error)),
            pre_command: |ctx| Box::pin(pre_command(ctx)),
            ..Default::default()
        })
        .setup(|ctx, _ready, framework| {
            Box::pin(async move {
                info!("Registering commands...");
                poise::builtins::register_globally(ctx, &framework.options().commands).await?;
                info!(count = framework.options().commands.len(), "Registered commands.");
                Ok(setup_data)
            })
        })
        .build();

    let intents = GatewayIntents::non_privileged()
        | GatewayIntents::GUILD_MEMBERS
        | GatewayIntents::MESSAGE_CONTENT
        | GatewayIntents::GUILD_VOICE_STATES
        | GatewayIntents::GUILD_MESSAGE_REACTIONS
        | GatewayIntents::GUILD_MODERATION
        | GatewayIntents::GUILD_WEBHOOKS;

    let mut client = ClientBuilder::new(token, intents)
        .event_handler(Handler {
            data,
            presence_shards: Mutex::new(HashSet::new()),
        })
        .framework(framework)
        .await?;

    info!("Starting client...");
    match shards {
        Some(count) => client.start_shards(count.max(1)).await?,
        None => client.start_autosharded().await?,
    }
    Ok(())
}
