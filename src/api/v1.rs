use poem::web::Data;
use poem_openapi::{
    ApiResponse, Object, OpenApi, OpenApiService,
    param::{Path, Query},
    payload::{Json, PlainText},
};
use sqlx::SqlitePool;
use tracing::error;

use crate::{
    antinuke::{self, Action},
    embed::{self, ScriptMessage},
    leveling::{self, LeaderboardEntry, Progress},
};

pub fn service() -> OpenApiService<Endpoint, ()> {
    OpenApiService::new(Endpoint, "Aegis API", env!("CARGO_PKG_VERSION")).url_prefix("/v1")
}

pub struct Endpoint;

#[OpenApi]
impl Endpoint {
    /// /v1/health
    #[oai(path = "/health", method = "get")]
    async fn health(&self) -> Json<Health> {
        Json(Health {
            status: "ok".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        })
    }

    /// /v1/embed/parse
    ///
    /// Parses an embed script without variable substitution
    #[oai(path = "/embed/parse", method = "post")]
    async fn embed_parse(&self, script: PlainText<String>) -> EmbedResponse {
        match embed::parse(&script.0) {
            Ok(message) => EmbedResponse::Success(Json(message)),
            Err(e) => EmbedResponse::BadRequest(PlainText(e.to_string())),
        }
    }

    /// /v1/levels/progress
    ///
    /// Level and progress for a total amount of XP
    #[oai(path = "/levels/progress", method = "get")]
    async fn level_progress(&self, xp: Query<u64>) -> Json<Progress> {
        Json(leveling::progress(xp.0))
    }

    /// /v1/guilds/{guild_id}/leaderboard
    #[oai(path = "/guilds/:guild_id/leaderboard", method = "get")]
    async fn leaderboard(
        &self,
        guild_id: Path<u64>,
        /// Number of entries, at most 100
        limit: Query<Option<u32>>,
        pool: Data<&SqlitePool>,
    ) -> LeaderboardResponse {
        let limit = limit.0.unwrap_or(10).clamp(1, 100);
        match leveling::leaderboard(&pool, guild_id.0, limit).await {
            Ok(entries) => LeaderboardResponse::Success(Json(entries)),
            Err(e) => {
                error!("Error fetching leaderboard for guild `{}`: {e:?}", guild_id.0);
                LeaderboardResponse::InternalError(PlainText(e.to_string()))
            }
        }
    }

    /// /v1/guilds/{guild_id}/antinuke
    #[oai(path = "/guilds/:guild_id/antinuke", method = "get")]
    async fn antinuke(&self, guild_id: Path<u64>, pool: Data<&SqlitePool>) -> AntinukeResponse {
        match antinuke::load(&pool, guild_id.0).await {
            Ok(protection) => {
                let mut whitelisted: Vec<u64> = protection.whitelist.iter().copied().collect();
                let mut admins: Vec<u64> = protection.admins.iter().copied().collect();
                whitelisted.sort_unstable();
                admins.sort_unstable();
                AntinukeResponse::Success(Json(AntinukeStatus {
                    modules: Action::ALL
                        .iter()
                        .map(|&action| {
                            let module = protection.module(action);
                            ModuleStatus {
                                action: action.key().to_string(),
                                enabled: module.enabled,
                                threshold: module.threshold,
                                punishment: module.punishment.key().to_string(),
                            }
                        })
                        .collect(),
                    whitelisted,
                    admins,
                    log_channel: protection.log_channel,
                }))
            }
            Err(e) => {
                error!("Error fetching antinuke settings for guild `{}`: {e:?}", guild_id.0);
                AntinukeResponse::InternalError(PlainText(e.to_string()))
            }
        }
    }
}

#[derive(Object, Debug, Clone, PartialEq, Eq)]
pub struct Health {
    status: String,
    version: String,
}

#[derive(Object, Debug, Clone, PartialEq, Eq)]
pub struct ModuleStatus {
    action: String,
    enabled: bool,
    threshold: u32,
    punishment: String,
}

#[derive(Object, Debug, Clone, PartialEq, Eq)]
pub struct AntinukeStatus {
    modules: Vec<ModuleStatus>,
    whitelisted: Vec<u64>,
    admins: Vec<u64>,
    log_channel: Option<u64>,
}

#[derive(ApiResponse)]
enum EmbedResponse {
    /// Returns the parsed message
    #[oai(status = 200)]
    Success(Json<ScriptMessage>),
    /// Returns when the script is invalid
    #[oai(status = 400)]
    BadRequest(PlainText<String>),
}

#[derive(ApiResponse)]
enum LeaderboardResponse {
    #[oai(status = 200)]
    Success(Json<Vec<LeaderboardEntry>>),
    /// Returns when a database error occurred
    #[oai(status = 500)]
    InternalError(PlainText<String>),
}

#[derive(ApiResponse)]
enum AntinukeResponse {
    #[oai(status = 200)]
    Success(Json<AntinukeStatus>),
    /// Returns when a database error occurred
    #[oai(status = 500)]
    InternalError(PlainText<String>),
}

#[cfg(test)]
mod tests {
    use poem_openapi::types::ToJSON;
    use serde_json::json;

    use super::*;
    use crate::{antinuke::TrustKind, db};

    #[tokio::test]
    async fn level_progress_json() {
        let Json(progress) = Endpoint.level_progress(Query(150)).await;
        assert_eq!(
            progress.to_json(),
            Some(json!({ "total_xp": 150, "level": 1, "current": 50, "needed": 200 }))
        );
    }

    #[tokio::test]
    async fn level_progress_clamps_huge_xp() {
        let Json(progress) = Endpoint.level_progress(Query(u64::MAX)).await;
        assert_eq!(progress.total_xp, leveling::MAX_XP);
        assert_eq!(progress.level, leveling::level_for(leveling::MAX_XP));
    }

    #[tokio::test]
    async fn embed_parse_reports_errors() {
        match Endpoint.embed_parse(PlainText("{title: Hi}".to_string())).await {
            EmbedResponse::Success(Json(message)) => {
                assert_eq!(message.embed.and_then(|e| e.title).as_deref(), Some("Hi"));
            }
            EmbedResponse::BadRequest(_) => panic!("valid script rejected"),
        }
        assert!(matches!(
            Endpoint.embed_parse(PlainText("{nope: x}".to_string())).await,
            EmbedResponse::BadRequest(_)
        ));
    }

    #[tokio::test]
    async fn guild_state() {
        let pool = db::test_pool().await;
        leveling::set_xp(&pool, 1, 10, 500).await.unwrap();
        leveling::set_xp(&pool, 1, 11, 900).await.unwrap();
        antinuke::add_trusted(&pool, 1, 42, TrustKind::Whitelist).await.unwrap();

        match Endpoint.leaderboard(Path(1), Query(None), Data(&pool)).await {
            LeaderboardResponse::Success(Json(entries)) => {
                assert_eq!(
                    entries.iter().map(|e| e.user_id).collect::<Vec<_>>(),
                    vec![11, 10]
                );
            }
            LeaderboardResponse::InternalError(e) => panic!("{}", e.0),
        }

        match Endpoint.antinuke(Path(1), Data(&pool)).await {
            AntinukeResponse::Success(Json(status)) => {
                assert_eq!(status.modules.len(), Action::ALL.len());
                assert!(status.modules.iter().all(|m| !m.enabled));
                assert_eq!(status.whitelisted, vec![42]);
                assert_eq!(status.log_channel, None);
            }
            AntinukeResponse::InternalError(e) => panic!("{}", e.0),
        }
    }
}
