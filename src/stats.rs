use log::{debug, warn};
use serde::Deserialize;
use std::fmt;
use url::Url;

use crate::config::PlaceId;
use crate::error::Error;
use crate::fetch::FetchClient;

pub const DEFAULT_GAME_NAME: &str = "Roblox Game";
pub const DEFAULT_GAME_ICON: &str =
    "https://tr.rbxcdn.com/97425ef88919c45c2fc8b1c616eec95d/150/150/Image/Png";

/// Identifier used by the games and favorites endpoints.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct UniverseId(pub u64);

impl fmt::Display for UniverseId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Name and icon shown as the webhook author.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DisplayIdentity {
    pub name: String,
    pub icon_url: String,
}

impl Default for DisplayIdentity {
    fn default() -> Self {
        Self {
            name: DEFAULT_GAME_NAME.to_string(),
            icon_url: DEFAULT_GAME_ICON.to_string(),
        }
    }
}

impl DisplayIdentity {
    /// True while the name has not been resolved yet.
    #[must_use]
    pub fn is_default(&self) -> bool {
        self.name.is_empty() || self.name == DEFAULT_GAME_NAME
    }
}

/// A single counter that may be missing because its source failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Metric {
    Count(u64),
    Unavailable,
}

impl fmt::Display for Metric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Metric::Count(n) => write!(f, "{n}"),
            Metric::Unavailable => f.write_str("N/A"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub players: Metric,
    pub visits: Metric,
    pub favorites: Metric,
}

impl MetricsSnapshot {
    /// Whether the primary games call produced usable numbers.
    #[must_use]
    pub fn primary_available(&self) -> bool {
        self.players != Metric::Unavailable && self.visits != Metric::Unavailable
    }
}

/// Base URLs of the upstream read APIs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiEndpoints {
    pub universes: Url,
    pub games: Url,
    pub thumbnails: Url,
}

#[derive(Debug, Deserialize)]
struct UniverseResponse {
    #[serde(rename = "universeId", default)]
    universe_id: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct GamesResponse {
    #[serde(default)]
    data: Vec<GameEntry>,
}

#[derive(Debug, Deserialize)]
struct GameEntry {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    playing: Option<u64>,
    #[serde(default)]
    visits: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct IconsResponse {
    #[serde(default)]
    data: Vec<IconEntry>,
}

#[derive(Debug, Deserialize)]
struct IconEntry {
    #[serde(rename = "imageUrl", default)]
    image_url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct FavoritesResponse {
    #[serde(rename = "favoritesCount", default)]
    favorites_count: Option<u64>,
}

/// Resolves a place to its universe and reads live game statistics.
#[derive(Debug, Clone)]
pub struct StatsClient {
    fetch: FetchClient,
    endpoints: ApiEndpoints,
}

impl StatsClient {
    #[must_use]
    pub fn new(fetch: FetchClient, endpoints: ApiEndpoints) -> Self {
        Self { fetch, endpoints }
    }

    /// Looks up the universe a place belongs to.
    ///
    /// # Errors
    ///
    /// Returns an error if the request fails or the response carries no
    /// universe id.
    pub async fn resolve_universe_id(&self, place: PlaceId) -> Result<UniverseId, Error> {
        let url = self
            .endpoints
            .universes
            .join(&format!("universes/v1/places/{place}/universe"))?;
        let body: UniverseResponse = self.fetch.get_json(url).await?;
        body.universe_id
            .map(UniverseId)
            .ok_or(Error::MissingField("universeId"))
    }

    /// Best-effort refresh of the name and icon.
    ///
    /// Each field is fetched independently and keeps its previous value when
    /// its own call fails.
    pub async fn refresh_identity(&self, universe: UniverseId, identity: &mut DisplayIdentity) {
        match self.fetch_game_entry(universe).await {
            Ok(Some(GameEntry {
                name: Some(name), ..
            })) if !name.is_empty() => identity.name = name,
            Ok(_) => warn!("No name returned for universe {universe}"),
            Err(e) => warn!("Failed to fetch name for universe {universe}: {e}"),
        }

        match self.fetch_icon(universe).await {
            Ok(Some(icon)) => identity.icon_url = icon,
            Ok(None) => warn!("No icon returned for universe {universe}"),
            Err(e) => warn!("Failed to fetch icon for universe {universe}: {e}"),
        }
    }

    /// Reads players, visits and favorites concurrently.
    ///
    /// Players and visits degrade to [`Metric::Unavailable`] together when the
    /// games call fails. Favorites degrade to zero on their own.
    pub async fn fetch_metrics(&self, universe: UniverseId) -> MetricsSnapshot {
        let (primary, favorites) = tokio::join!(
            self.fetch_game_entry(universe),
            self.fetch_favorites(universe)
        );

        let (players, visits) = match primary {
            Ok(Some(entry)) => (
                Metric::Count(entry.playing.unwrap_or(0)),
                Metric::Count(entry.visits.unwrap_or(0)),
            ),
            Ok(None) => {
                warn!("No data returned for universe {universe}");
                (Metric::Unavailable, Metric::Unavailable)
            }
            Err(e) => {
                warn!("Failed to fetch stats for universe {universe}: {e}");
                (Metric::Unavailable, Metric::Unavailable)
            }
        };

        let favorites = match favorites {
            Ok(count) => Metric::Count(count),
            Err(e) => {
                debug!("Favorites unavailable for universe {universe}: {e}");
                Metric::Count(0)
            }
        };

        MetricsSnapshot {
            players,
            visits,
            favorites,
        }
    }

    async fn fetch_game_entry(&self, universe: UniverseId) -> Result<Option<GameEntry>, Error> {
        let mut url = self.endpoints.games.join("v1/games")?;
        url.query_pairs_mut()
            .append_pair("universeIds", &universe.to_string());
        let body: GamesResponse = self.fetch.get_json(url).await?;
        Ok(body.data.into_iter().next())
    }

    async fn fetch_icon(&self, universe: UniverseId) -> Result<Option<String>, Error> {
        let mut url = self.endpoints.thumbnails.join("v1/games/icons")?;
        url.query_pairs_mut()
            .append_pair("universeIds", &universe.to_string())
            .append_pair("size", "256x256")
            .append_pair("format", "Png");
        let body: IconsResponse = self.fetch.get_json(url).await?;
        Ok(body
            .data
            .into_iter()
            .next()
            .and_then(|entry| entry.image_url)
            .filter(|icon| !icon.is_empty()))
    }

    async fn fetch_favorites(&self, universe: UniverseId) -> Result<u64, Error> {
        let url = self
            .endpoints
            .games
            .join(&format!("v1/games/{universe}/favorites/count"))?;
        let body: FavoritesResponse = self.fetch.get_json(url).await?;
        Ok(body.favorites_count.unwrap_or(0))
    }
}
