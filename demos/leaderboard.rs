//! Leaderboard lookups through a Redis-backed cache.
//!
//! Fetches four leaderboards twice (the second pass is served from the
//! cache), then one leaderboard whose fetch fails.
//!
//! Needs Redis on localhost:6379. Run with:
//!
//! ```text
//! RUST_LOG=refresh_cache=debug cargo run --example leaderboard
//! ```

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use refresh_cache::{Cache, CacheConfig, RedisStore};
use serde::{Deserialize, Serialize};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

/// Sort order of leaderboard entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
enum Direction {
    /// Lowest score first
    Ascending,
    /// Highest score first
    Descending,
}

/// What identifies a leaderboard member.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
enum LeaderboardType {
    /// Member id is the player id
    Player,
    /// Member id is any string provided by the caller
    Generic,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct LeaderboardRecord {
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    key: String,
    direction_method: Direction,
    name: String,
    #[serde(rename = "type")]
    kind: LeaderboardType,
    id: u64,
    game_id: u64,
    enable_game_api_writes: bool,
    overwrite_score_on_submit: bool,
    has_metadata: bool,
    ulid: Option<Uuid>,
}

#[derive(Debug, thiserror::Error)]
#[error("leaderboard not found")]
struct LeaderboardNotFound;

async fn get_leaderboard(fail: bool) -> Result<LeaderboardRecord, LeaderboardNotFound> {
    if fail {
        return Err(LeaderboardNotFound);
    }
    let now = Utc::now();
    Ok(LeaderboardRecord {
        created_at: now,
        updated_at: now,
        key: "some-key".to_owned(),
        direction_method: Direction::Descending,
        name: "some-name".to_owned(),
        kind: LeaderboardType::Generic,
        id: 1,
        game_id: 1,
        enable_game_api_writes: false,
        overwrite_score_on_submit: false,
        has_metadata: false,
        ulid: Some(Uuid::now_v7()),
    })
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let client = redis::Client::open("redis://localhost:6379/0")?;
    let ttl = Duration::from_secs(10);
    let store = RedisStore::new(client, Some(ttl)).await?;
    let cache: Cache<LeaderboardRecord> = Cache::with_distributed_store(
        "lb",
        CacheConfig::default().with_ttl(ttl),
        Arc::new(store),
    )?;

    let keys: Vec<String> = (0..4).map(|_| Uuid::now_v7().to_string()).collect();

    for _ in 0..2 {
        for key in &keys {
            match cache.get_or_fetch(key, || get_leaderboard(false)).await {
                Ok(board) => println!("lb: {board:#?}"),
                Err(e) => println!("err: {e}"),
            }
            println!("-----------------------------");
            tokio::time::sleep(Duration::from_millis(250)).await;
        }
    }

    match cache.get_or_fetch("", || get_leaderboard(true)).await {
        Ok(board) => println!("lb: {board:#?}"),
        Err(e) => println!("err: {e}"),
    }
    println!("-----------------------------");

    Ok(())
}
