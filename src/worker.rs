use chrono::Utc;
use log::{error, info, warn};
use std::fmt;
use std::time::Duration;
use tokio::{select, time::sleep};
use tokio_util::sync::CancellationToken;

use crate::cadence::Cadence;
use crate::config::{PlaceId, Settings};
use crate::delivery::{Delivered, DeliveryHandle, Webhook};
use crate::error::Error;
use crate::fetch::FetchClient;
use crate::render::render;
use crate::stats::{DisplayIdentity, StatsClient, UniverseId};

/// Why a refresh cycle counted as failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleFailure {
    /// The place could not be mapped to a universe; nothing was delivered.
    Unresolved,
    /// Players and visits were unavailable; the message still went out.
    Metrics,
    /// The webhook create or update call failed.
    Delivery,
}

impl fmt::Display for CycleFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CycleFailure::Unresolved => f.write_str("universe unresolved"),
            CycleFailure::Metrics => f.write_str("stats unavailable"),
            CycleFailure::Delivery => f.write_str("delivery failed"),
        }
    }
}

/// Mutable state carried from one cycle to the next.
#[derive(Debug, Clone)]
pub struct Session {
    pub place_id: PlaceId,
    pub universe_id: Option<UniverseId>,
    pub identity: DisplayIdentity,
    pub handle: DeliveryHandle,
}

impl Session {
    #[must_use]
    pub fn new(place_id: PlaceId, handle: DeliveryHandle) -> Self {
        Self {
            place_id,
            universe_id: None,
            identity: DisplayIdentity::default(),
            handle,
        }
    }
}

/// Runs refresh cycles one at a time and tunes the delay between them.
///
/// Every cycle takes `&mut self`, so two cycles can never overlap even on a
/// multi-threaded runtime.
#[derive(Debug)]
pub struct Scheduler {
    stats: StatsClient,
    webhook: Webhook,
    session: Session,
    cadence: Cadence,
}

impl Scheduler {
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built.
    pub fn from_settings(settings: &Settings) -> Result<Self, Error> {
        let fetch = FetchClient::new(settings.timeout, settings.retry)?;
        let handle = settings
            .message_id
            .clone()
            .map(DeliveryHandle::resume)
            .unwrap_or_default();

        Ok(Self {
            stats: StatsClient::new(fetch.clone(), settings.endpoints.clone()),
            webhook: Webhook::new(fetch, settings.webhook_url.clone()),
            session: Session::new(settings.place_id, handle),
            cadence: Cadence::new(
                settings.min_interval,
                settings.max_interval,
                settings.initial_interval,
            ),
        })
    }

    #[must_use]
    pub fn session(&self) -> &Session {
        &self.session
    }

    #[must_use]
    pub fn cadence(&self) -> &Cadence {
        &self.cadence
    }

    /// One full refresh: resolve, fetch, render, deliver.
    ///
    /// Returns the first failure observed. Only an unresolved universe stops
    /// the cycle early.
    pub async fn run_cycle(&mut self) -> Result<(), CycleFailure> {
        let universe = match self.session.universe_id {
            Some(universe) => universe,
            None => match self.stats.resolve_universe_id(self.session.place_id).await {
                Ok(universe) => {
                    info!(
                        "Place {} resolved to universe {universe}",
                        self.session.place_id
                    );
                    self.session.universe_id = Some(universe);
                    universe
                }
                Err(e) => {
                    warn!(
                        "Could not resolve universe for place {}: {e}",
                        self.session.place_id
                    );
                    return Err(CycleFailure::Unresolved);
                }
            },
        };

        if self.session.identity.is_default() {
            self.stats
                .refresh_identity(universe, &mut self.session.identity)
                .await;
        }

        let snapshot = self.stats.fetch_metrics(universe).await;
        let mut failure = None;
        if !snapshot.primary_available() {
            failure = Some(CycleFailure::Metrics);
        }

        let payload = render(&snapshot, &self.session.identity, Utc::now());
        match self.webhook.deliver(&payload, &mut self.session.handle).await {
            Ok(Delivered::Created(id)) => info!("First message sent, id {id}"),
            Ok(Delivered::Updated(id)) => info!("Message {id} updated"),
            Err(e) => {
                error!("Webhook delivery failed: {e}");
                failure.get_or_insert(CycleFailure::Delivery);
            }
        }

        failure.map_or(Ok(()), Err)
    }

    /// Runs one cycle and returns the delay before the next one.
    pub async fn tick(&mut self) -> Duration {
        let outcome = self.run_cycle().await;
        if let Err(failure) = outcome {
            warn!("Refresh cycle failed: {failure}");
        }
        self.cadence.record(outcome.is_ok())
    }
}

/// Refreshes the stats message until `token` is cancelled.
///
/// Cancellation is honoured mid-cycle as well as between cycles; an
/// abandoned cycle leaves the session consistent.
///
/// # Errors
///
/// Returns an error if the HTTP client cannot be built. Once the loop is
/// running every failure is logged and absorbed.
pub async fn refresh_stats(settings: &Settings, token: CancellationToken) -> Result<(), Error> {
    let mut scheduler = Scheduler::from_settings(settings)?;

    // Initial Configuration Logging
    info!("Starting stats refresh for place {}", settings.place_id);
    info!(
        "Interval: {}s, adaptive between {}s and {}s",
        settings.initial_interval.as_secs(),
        settings.min_interval.as_secs(),
        settings.max_interval.as_secs()
    );
    info!("Timeout: {} seconds", settings.timeout.as_secs());
    match &settings.message_id {
        Some(id) => info!("Existing message {id} will be updated"),
        None => info!("A new message will be created"),
    }

    loop {
        let delay = select! {
            delay = scheduler.tick() => delay,
            () = token.cancelled() => {
                info!("Shutdown requested during refresh");
                break;
            }
        };

        info!("Next refresh in {:.1}s", delay.as_secs_f64());

        // Interruptible sleep
        select! {
            () = sleep(delay) => {},
            () = token.cancelled() => {
                info!("Shutdown requested during sleep");
                break;
            }
        }
    }

    info!("Stats refresh stopped gracefully");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fetch::RetryPolicy;
    use crate::stats::ApiEndpoints;
    use httpmock::Method::{GET, PATCH, POST};
    use httpmock::MockServer;
    use serde_json::json;
    use url::Url;

    const HOOK_PATH: &str = "/api/webhooks/1/token";

    fn settings(server: &MockServer, message_id: Option<&str>) -> Settings {
        let base = Url::parse(&server.base_url()).unwrap();
        Settings {
            place_id: PlaceId(100),
            webhook_url: Url::parse(&server.url(HOOK_PATH)).unwrap(),
            message_id: message_id.map(|id| id.parse().unwrap()),
            timeout: Duration::from_secs(5),
            retry: RetryPolicy::new(0, Duration::from_millis(1)).unwrap(),
            min_interval: Duration::from_secs(10),
            max_interval: Duration::from_secs(100),
            initial_interval: Duration::from_secs(10),
            endpoints: ApiEndpoints {
                universes: base.clone(),
                games: base.clone(),
                thumbnails: base,
            },
        }
    }

    async fn mock_upstream(server: &MockServer) {
        server
            .mock_async(|when, then| {
                when.method(GET).path("/universes/v1/places/100/universe");
                then.status(200).json_body(json!({ "universeId": 200 }));
            })
            .await;
        server
            .mock_async(|when, then| {
                when.method(GET)
                    .path("/v1/games")
                    .query_param("universeIds", "200");
                then.status(200).json_body(json!({
                    "data": [{ "name": "Obby", "playing": 42, "visits": 1000 }]
                }));
            })
            .await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/v1/games/icons");
                then.status(200)
                    .json_body(json!({ "data": [{ "imageUrl": "https://cdn.example/obby.png" }] }));
            })
            .await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/v1/games/200/favorites/count");
                then.status(200).json_body(json!({ "favoritesCount": 7 }));
            })
            .await;
    }

    #[tokio::test]
    async fn first_cycle_creates_exactly_once() {
        let server = MockServer::start_async().await;
        mock_upstream(&server).await;
        let create = server
            .mock_async(|when, then| {
                when.method(POST)
                    .path(HOOK_PATH)
                    .query_param("wait", "true");
                then.status(200).json_body(json!({ "id": "999" }));
            })
            .await;
        let update = server
            .mock_async(|when, then| {
                when.method(PATCH).path(format!("{HOOK_PATH}/messages/999"));
                then.status(200);
            })
            .await;

        let mut scheduler = Scheduler::from_settings(&settings(&server, None)).unwrap();
        assert_eq!(scheduler.run_cycle().await, Ok(()));

        create.assert_hits_async(1).await;
        update.assert_hits_async(0).await;
        let session = scheduler.session();
        assert!(session.handle.is_set());
        assert_eq!(session.universe_id, Some(UniverseId(200)));
        assert_eq!(session.identity.name, "Obby");
        assert_eq!(session.identity.icon_url, "https://cdn.example/obby.png");

        assert_eq!(scheduler.run_cycle().await, Ok(()));
        create.assert_hits_async(1).await;
        update.assert_hits_async(1).await;
    }

    #[tokio::test]
    async fn universe_and_identity_are_fetched_once() {
        let server = MockServer::start_async().await;
        let resolve = server
            .mock_async(|when, then| {
                when.method(GET).path("/universes/v1/places/100/universe");
                then.status(200).json_body(json!({ "universeId": 200 }));
            })
            .await;
        let icons = server
            .mock_async(|when, then| {
                when.method(GET).path("/v1/games/icons");
                then.status(200)
                    .json_body(json!({ "data": [{ "imageUrl": "https://cdn.example/obby.png" }] }));
            })
            .await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/v1/games");
                then.status(200).json_body(json!({
                    "data": [{ "name": "Obby", "playing": 1, "visits": 2 }]
                }));
            })
            .await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/v1/games/200/favorites/count");
                then.status(200).json_body(json!({ "favoritesCount": 3 }));
            })
            .await;
        server
            .mock_async(|when, then| {
                when.method(PATCH).path(format!("{HOOK_PATH}/messages/5"));
                then.status(200);
            })
            .await;

        let mut scheduler = Scheduler::from_settings(&settings(&server, Some("5"))).unwrap();
        for _ in 0..3 {
            assert_eq!(scheduler.run_cycle().await, Ok(()));
        }

        resolve.assert_hits_async(1).await;
        icons.assert_hits_async(1).await;
    }

    #[tokio::test]
    async fn unresolved_universe_skips_delivery_and_backs_off() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/universes/v1/places/100/universe");
                then.status(404);
            })
            .await;
        let games = server
            .mock_async(|when, then| {
                when.method(GET).path("/v1/games");
                then.status(200).json_body(json!({ "data": [] }));
            })
            .await;
        let create = server
            .mock_async(|when, then| {
                when.method(POST).path(HOOK_PATH);
                then.status(200).json_body(json!({ "id": "1" }));
            })
            .await;

        let mut scheduler = Scheduler::from_settings(&settings(&server, None)).unwrap();
        let delay = scheduler.tick().await;

        assert_eq!(delay, Duration::from_secs(15));
        assert_eq!(scheduler.cadence().successes(), 0);
        assert!(scheduler.session().universe_id.is_none());
        assert!(!scheduler.session().handle.is_set());
        games.assert_hits_async(0).await;
        create.assert_hits_async(0).await;
    }

    #[tokio::test]
    async fn unavailable_stats_still_deliver_but_count_as_failure() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/universes/v1/places/100/universe");
                then.status(200).json_body(json!({ "universeId": 200 }));
            })
            .await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/v1/games");
                then.status(500);
            })
            .await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/v1/games/icons");
                then.status(500);
            })
            .await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/v1/games/200/favorites/count");
                then.status(500);
            })
            .await;
        let update = server
            .mock_async(|when, then| {
                when.method(PATCH)
                    .path(format!("{HOOK_PATH}/messages/5"))
                    .body_contains("N/A");
                then.status(200);
            })
            .await;

        let mut scheduler = Scheduler::from_settings(&settings(&server, Some("5"))).unwrap();
        assert_eq!(scheduler.run_cycle().await, Err(CycleFailure::Metrics));
        update.assert_hits_async(1).await;
    }

    #[tokio::test]
    async fn failed_delivery_keeps_handle_and_backs_off() {
        let server = MockServer::start_async().await;
        mock_upstream(&server).await;
        server
            .mock_async(|when, then| {
                when.method(PATCH).path(format!("{HOOK_PATH}/messages/5"));
                then.status(500);
            })
            .await;

        let mut scheduler = Scheduler::from_settings(&settings(&server, Some("5"))).unwrap();
        let delay = scheduler.tick().await;

        assert_eq!(delay, Duration::from_secs(15));
        assert_eq!(
            scheduler.session().handle.get().map(|id| id.as_str()),
            Some("5")
        );
    }

    #[tokio::test]
    async fn three_good_cycles_shorten_the_interval() {
        let server = MockServer::start_async().await;
        mock_upstream(&server).await;
        server
            .mock_async(|when, then| {
                when.method(PATCH).path(format!("{HOOK_PATH}/messages/5"));
                then.status(200);
            })
            .await;

        let mut settings = settings(&server, Some("5"));
        settings.initial_interval = Duration::from_secs(50);
        let mut scheduler = Scheduler::from_settings(&settings).unwrap();

        assert_eq!(scheduler.tick().await, Duration::from_secs(50));
        assert_eq!(scheduler.tick().await, Duration::from_secs(50));
        assert_eq!(scheduler.tick().await, Duration::from_secs(45));
    }

    #[tokio::test]
    async fn cancelled_token_stops_the_loop() {
        let server = MockServer::start_async().await;
        let token = CancellationToken::new();
        token.cancel();

        let result = refresh_stats(&settings(&server, None), token).await;
        assert!(result.is_ok());
    }
}
