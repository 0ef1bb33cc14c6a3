//! Embed scripts.
//!
//! A script is a list of `{key: value}` blocks separated by `$v`, for example
//! `{title: Welcome}$v{description: Hi {user.mention}}$v{color: #ff0000}`.
//! Multi-part values are separated by `&&`. A script with no blocks at all is
//! sent as plain message content.

use std::collections::BTreeMap;

use poem_openapi::Object;
use poise::serenity_prelude as serenity;

use crate::{Context, Error};

const SEPARATOR: &str = "$v";
const PART_SEPARATOR: &str = "&&";

const MAX_TITLE: usize = 256;
const MAX_DESCRIPTION: usize = 4096;
const MAX_FIELDS: usize = 25;
const MAX_FIELD_NAME: usize = 256;
const MAX_FIELD_VALUE: usize = 1024;
const MAX_FOOTER: usize = 2048;
const MAX_AUTHOR: usize = 256;
const MAX_CONTENT: usize = 2000;

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum ScriptError {
    #[error("the script is empty")]
    Empty,
    #[error("`{0}` is not a `{{key: value}}` block")]
    MalformedBlock(String),
    #[error("unknown key `{0}`")]
    UnknownKey(String),
    #[error("`{0}` needs a value")]
    MissingValue(&'static str),
    #[error("`{0}` is not a hex colour")]
    InvalidColor(String),
    #[error("{0} is longer than {1} characters")]
    TooLong(&'static str, usize),
    #[error("an embed can have at most 25 fields")]
    TooManyFields,
    #[error("the embed has nothing to display")]
    EmptyEmbed,
}

#[derive(Object, Debug, Clone, Default, PartialEq, Eq)]
pub struct ScriptMessage {
    pub content: Option<String>,
    pub embed: Option<EmbedSpec>,
}

#[derive(Object, Debug, Clone, Default, PartialEq, Eq)]
pub struct EmbedSpec {
    pub title: Option<String>,
    pub description: Option<String>,
    pub url: Option<String>,
    pub color: Option<u32>,
    pub author: Option<EmbedAuthorSpec>,
    pub footer: Option<EmbedFooterSpec>,
    pub thumbnail: Option<String>,
    pub image: Option<String>,
    pub fields: Vec<EmbedFieldSpec>,
    pub timestamp: bool,
}

#[derive(Object, Debug, Clone, PartialEq, Eq)]
pub struct EmbedAuthorSpec {
    pub name: String,
    pub icon_url: Option<String>,
    pub url: Option<String>,
}

#[derive(Object, Debug, Clone, PartialEq, Eq)]
pub struct EmbedFooterSpec {
    pub text: String,
    pub icon_url: Option<String>,
}

#[derive(Object, Debug, Clone, PartialEq, Eq)]
pub struct EmbedFieldSpec {
    pub name: String,
    pub value: String,
    pub inline: bool,
}

/// Placeholder values substituted into script values.
#[derive(Debug, Clone, Default)]
pub struct Variables(BTreeMap<&'static str, String>);

impl Variables {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(mut self, key: &'static str, value: impl ToString) -> Self {
        self.0.insert(key, value.to_string());
        self
    }

    pub fn user(self, user: &serenity::User) -> Self {
        self.set("user", user.name.clone())
            .set("user.mention", format!("<@{}>", user.id))
            .set("user.name", user.name.clone())
            .set("user.id", user.id)
            .set("user.avatar", user.face())
    }

    pub fn guild(self, guild: &serenity::Guild) -> Self {
        self.set("guild.name", guild.name.clone())
            .set("guild.id", guild.id)
            .set("guild.count", guild.member_count)
            .set("guild.icon", guild.icon_url().unwrap_or_default())
            .set(
                "guild.boost_count",
                guild.premium_subscription_count.unwrap_or(0),
            )
    }

    /// Replaces every known `{name}` placeholder; unknown ones are left alone.
    pub fn substitute(&self, script: &str) -> String {
        let mut out = script.to_string();
        // Longest keys first so `{user}` never clobbers part of `{user.name}`.
        let mut keys: Vec<_> = self.0.iter().collect();
        keys.sort_by_key(|(key, _)| std::cmp::Reverse(key.len()));
        for (key, value) in keys {
            out = out.replace(&format!("{{{}}}", key), value);
        }
        out
    }
}

fn check_len(what: &'static str, value: &str, max: usize) -> Result<(), ScriptError> {
    if value.chars().count() > max {
        return Err(ScriptError::TooLong(what, max));
    }
    Ok(())
}

fn non_empty(part: Option<&str>) -> Option<String> {
    part.map(str::trim)
        .filter(|p| !p.is_empty())
        .map(str::to_string)
}

fn parse_color(value: &str) -> Result<u32, ScriptError> {
    let hex = value.trim().trim_start_matches('#');
    if hex.len() != 6 {
        return Err(ScriptError::InvalidColor(value.to_string()));
    }
    u32::from_str_radix(hex, 16).map_err(|_| ScriptError::InvalidColor(value.to_string()))
}

const KEYS: &[&str] = &[
    "embed",
    "content",
    "message",
    "title",
    "description",
    "url",
    "color",
    "colour",
    "thumbnail",
    "image",
    "timestamp",
    "author",
    "footer",
    "field",
];

fn as_block(part: &str) -> Option<(String, &str)> {
    let inner = part.strip_prefix('{')?.strip_suffix('}')?;
    match inner.split_once(':') {
        Some((key, value)) => Some((key.trim().to_lowercase(), value.trim())),
        None => Some((inner.trim().to_lowercase(), "")),
    }
}

pub fn parse(script: &str) -> Result<ScriptMessage, ScriptError> {
    render(script, &Variables::new())
}

/// Parses `script`, substituting `vars` into each value after it was split
/// into blocks and parts.
pub fn render(script: &str, vars: &Variables) -> Result<ScriptMessage, ScriptError> {
    let script = script.trim();
    if script.is_empty() {
        return Err(ScriptError::Empty);
    }

    let parts: Vec<&str> = script
        .split(SEPARATOR)
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .collect();
    let is_block = |part: &&str| as_block(part).is_some_and(|(key, _)| KEYS.contains(&key.as_str()));
    if !parts.iter().any(is_block) {
        let content = vars.substitute(script);
        check_len("content", &content, MAX_CONTENT)?;
        return Ok(ScriptMessage {
            content: Some(content),
            embed: None,
        });
    }

    let mut message = ScriptMessage::default();
    let mut embed = EmbedSpec::default();
    for part in parts {
        let (key, raw) =
            as_block(part).ok_or_else(|| ScriptError::MalformedBlock(part.to_string()))?;
        let value = vars.substitute(raw);
        let value = value.as_str();
        let pieces: Vec<String> = raw
            .split(PART_SEPARATOR)
            .map(|piece| vars.substitute(piece.trim()))
            .collect();
        let piece = |i: usize| non_empty(pieces.get(i).map(String::as_str));
        match key.as_str() {
            "embed" => {}
            "content" | "message" => {
                check_len("content", value, MAX_CONTENT)?;
                message.content = non_empty(Some(value));
            }
            "title" => {
                check_len("title", value, MAX_TITLE)?;
                embed.title = non_empty(Some(value));
            }
            "description" => {
                check_len("description", value, MAX_DESCRIPTION)?;
                embed.description = non_empty(Some(value));
            }
            "url" => embed.url = non_empty(Some(value)),
            "color" | "colour" => embed.color = Some(parse_color(value)?),
            "thumbnail" => embed.thumbnail = non_empty(Some(value)),
            "image" => embed.image = non_empty(Some(value)),
            "timestamp" => embed.timestamp = true,
            "author" => {
                let name = piece(0).ok_or(ScriptError::MissingValue("author"))?;
                check_len("author", &name, MAX_AUTHOR)?;
                embed.author = Some(EmbedAuthorSpec {
                    name,
                    icon_url: piece(1),
                    url: piece(2),
                });
            }
            "footer" => {
                let text = piece(0).ok_or(ScriptError::MissingValue("footer"))?;
                check_len("footer", &text, MAX_FOOTER)?;
                embed.footer = Some(EmbedFooterSpec {
                    text,
                    icon_url: piece(1),
                });
            }
            "field" => {
                let name = piece(0).ok_or(ScriptError::MissingValue("field"))?;
                let value = piece(1).ok_or(ScriptError::MissingValue("field"))?;
                check_len("field name", &name, MAX_FIELD_NAME)?;
                check_len("field value", &value, MAX_FIELD_VALUE)?;
                let inline = piece(2)
                    .is_some_and(|p| matches!(p.to_lowercase().as_str(), "inline" | "true" | "yes"));
                if embed.fields.len() == MAX_FIELDS {
                    return Err(ScriptError::TooManyFields);
                }
                embed.fields.push(EmbedFieldSpec { name, value, inline });
            }
            _ => return Err(ScriptError::UnknownKey(key)),
        }
    }

    if embed != EmbedSpec::default() {
        if !embed.has_body() {
            return Err(ScriptError::EmptyEmbed);
        }
        message.embed = Some(embed);
    }
    if message.content.is_none() && message.embed.is_none() {
        return Err(ScriptError::Empty);
    }
    Ok(message)
}

impl EmbedSpec {
    fn has_body(&self) -> bool {
        self.title.is_some()
            || self.description.is_some()
            || self.author.is_some()
            || self.footer.is_some()
            || self.thumbnail.is_some()
            || self.image.is_some()
            || !self.fields.is_empty()
    }

    pub fn to_embed(&self) -> serenity::CreateEmbed {
        let mut embed = serenity::CreateEmbed::new();
        if let Some(title) = &self.title {
            embed = embed.title(title);
        }
        if let Some(description) = &self.description {
            embed = embed.description(description);
        }
        if let Some(url) = &self.url {
            embed = embed.url(url);
        }
        if let Some(color) = self.color {
            embed = embed.colour(color);
        }
        if let Some(author) = &self.author {
            let mut builder = serenity::CreateEmbedAuthor::new(&author.name);
            if let Some(icon) = &author.icon_url {
                builder = builder.icon_url(icon);
            }
            if let Some(url) = &author.url {
                builder = builder.url(url);
            }
            embed = embed.author(builder);
        }
        if let Some(footer) = &self.footer {
            let mut builder = serenity::CreateEmbedFooter::new(&footer.text);
            if let Some(icon) = &footer.icon_url {
                builder = builder.icon_url(icon);
            }
            embed = embed.footer(builder);
        }
        if let Some(thumbnail) = &self.thumbnail {
            embed = embed.thumbnail(thumbnail);
        }
        if let Some(image) = &self.image {
            embed = embed.image(image);
        }
        for field in &self.fields {
            embed = embed.field(&field.name, &field.value, field.inline);
        }
        if self.timestamp {
            embed = embed.timestamp(serenity::Timestamp::now());
        }
        embed
    }
}

impl ScriptMessage {
    pub fn to_message(&self) -> serenity::CreateMessage {
        let mut message = serenity::CreateMessage::new();
        if let Some(content) = &self.content {
            message = message.content(content);
        }
        if let Some(embed) = &self.embed {
            message = message.embed(embed.to_embed());
        }
        message
    }

    pub fn to_reply(&self) -> poise::CreateReply {
        let mut reply = poise::CreateReply::default();
        if let Some(content) = &self.content {
            reply = reply.content(content);
        }
        if let Some(embed) = &self.embed {
            reply = reply.embed(embed.to_embed());
        }
        reply
    }
}

/// Variables for the invoking member and guild.
pub fn context_variables(ctx: Context<'_>) -> Variables {
    let vars = Variables::new().user(ctx.author());
    match ctx.guild() {
        Some(guild) => vars.guild(&guild),
        None => vars,
    }
}

/// Build and send embeds from scripts.
#[poise::command(
    slash_command,
    prefix_command,
    subcommands("create", "preview"),
    subcommand_required
)]
pub async fn embed(_ctx: Context<'_>) -> Result<(), Error> {
    Ok(())
}

/// Sends the embed described by a script to this channel.
#[poise::command(slash_command, prefix_command, guild_only, required_permissions = "MANAGE_MESSAGES")]
pub async fn create(
    ctx: Context<'_>,
    #[description = "Embed script"]
    #[rest]
    script: String,
) -> Result<(), Error> {
    let message = render(&script, &context_variables(ctx))?;
    ctx.channel_id()
        .send_message(ctx.http(), message.to_message())
        .await?;
    if let poise::Context::Application(_) = ctx {
        ctx.send(poise::CreateReply::default().content("Sent!").ephemeral(true))
            .await?;
    }
    Ok(())
}

/// Shows the embed described by a script only to you.
#[poise::command(slash_command, prefix_command)]
pub async fn preview(
    ctx: Context<'_>,
    #[description = "Embed script"]
    #[rest]
    script: String,
) -> Result<(), Error> {
    let message = render(&script, &context_variables(ctx))?;
    ctx.send(message.to_reply().ephemeral(true)).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_text_is_content() {
        let message = parse("hello there").unwrap();
        assert_eq!(message.content.as_deref(), Some("hello there"));
        assert!(message.embed.is_none());
    }

    #[test]
    fn full_embed() {
        let message = parse(
            "{content: hey}$v{title: Welcome}$v{description: glad you are here}\
             $v{color: #FF0000}$v{author: Staff && https://a/icon.png}\
             $v{footer: see you && https://a/f.png}$v{field: Rules && be nice && inline}\
             $v{field: Roles && pick one}$v{thumbnail: https://a/t.png}$v{timestamp}",
        )
        .unwrap();
        assert_eq!(message.content.as_deref(), Some("hey"));
        let embed = message.embed.unwrap();
        assert_eq!(embed.title.as_deref(), Some("Welcome"));
        assert_eq!(embed.color, Some(0xFF0000));
        assert_eq!(embed.author.unwrap().icon_url.as_deref(), Some("https://a/icon.png"));
        assert_eq!(embed.footer.unwrap().text, "see you");
        assert_eq!(embed.fields.len(), 2);
        assert!(embed.fields[0].inline);
        assert!(!embed.fields[1].inline);
        assert!(embed.timestamp);
    }

    #[test]
    fn leading_embed_marker_is_ignored() {
        let message = parse("{embed}$v{title: hi}").unwrap();
        assert_eq!(message.embed.unwrap().title.as_deref(), Some("hi"));
    }

    #[test]
    fn errors() {
        assert_eq!(parse("   "), Err(ScriptError::Empty));
        assert_eq!(
            parse("{title: a}$v{nope: b}"),
            Err(ScriptError::UnknownKey("nope".into()))
        );
        assert_eq!(
            parse("{title: a}$v{color: red}"),
            Err(ScriptError::InvalidColor("red".into()))
        );
        assert_eq!(
            parse("{title: a}$v stray"),
            Err(ScriptError::MalformedBlock("stray".into()))
        );
        assert_eq!(parse("{field: only name}"), Err(ScriptError::MissingValue("field")));
        assert_eq!(parse("{color: #000000}"), Err(ScriptError::EmptyEmbed));
        let long = format!("{{title: {}}}", "a".repeat(257));
        assert_eq!(parse(&long), Err(ScriptError::TooLong("title", 256)));
    }

    #[test]
    fn length_limits() {
        let block = |key: &str, len: usize| format!("{{{key}: {}}}", "a".repeat(len));
        assert!(parse(&block("description", 4096)).is_ok());
        assert_eq!(
            parse(&block("description", 4097)),
            Err(ScriptError::TooLong("description", 4096))
        );
        assert!(parse(&block("footer", 2048)).is_ok());
        assert_eq!(
            parse(&block("footer", 2049)),
            Err(ScriptError::TooLong("footer", 2048))
        );
        assert!(parse(&block("author", 256)).is_ok());
        assert_eq!(
            parse(&block("author", 257)),
            Err(ScriptError::TooLong("author", 256))
        );
        let field = |name: usize, value: usize| {
            format!("{{field: {} && {}}}", "n".repeat(name), "v".repeat(value))
        };
        assert!(parse(&field(256, 1024)).is_ok());
        assert_eq!(
            parse(&field(257, 1)),
            Err(ScriptError::TooLong("field name", 256))
        );
        assert_eq!(
            parse(&field(1, 1025)),
            Err(ScriptError::TooLong("field value", 1024))
        );
    }

    #[test]
    fn field_limit() {
        let script = (0..26)
            .map(|i| format!("{{field: f{i} && v}}"))
            .collect::<Vec<_>>()
            .join("$v");
        assert_eq!(parse(&script), Err(ScriptError::TooManyFields));
    }

    #[test]
    fn variables_are_substituted() {
        let vars = Variables::new()
            .set("user", "ferris")
            .set("user.mention", "<@1>")
            .set("guild.name", "Rust")
            .set("level", 4);
        let message = render(
            "{description: {user.mention} ({user}) hit level {level} in {guild.name} {unknown}}",
            &vars,
        )
        .unwrap();
        assert_eq!(
            message.embed.unwrap().description.as_deref(),
            Some("<@1> (ferris) hit level 4 in Rust {unknown}")
        );
    }

    #[test]
    fn unresolved_tokens_stay_as_content() {
        let message = render("{guild.name}", &Variables::new()).unwrap();
        assert_eq!(message.content.as_deref(), Some("{guild.name}"));
        let message = render("{guild.name}", &Variables::new().set("guild.name", "Rust")).unwrap();
        assert_eq!(message.content.as_deref(), Some("Rust"));
    }

    #[test]
    fn substituted_values_cannot_add_blocks_or_parts() {
        let vars = Variables::new().set("guild.name", "evil $v{title: x} && more");
        let message = render("{footer: {guild.name} && https://a/f.png}", &vars).unwrap();
        let embed = message.embed.unwrap();
        assert!(embed.title.is_none());
        let footer = embed.footer.unwrap();
        assert_eq!(footer.text, "evil $v{title: x} && more");
        assert_eq!(footer.icon_url.as_deref(), Some("https://a/f.png"));
    }
}
