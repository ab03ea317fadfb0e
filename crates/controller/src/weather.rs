//! Forecast lookup with a per-location TTL cache.
//!
//! Any failure (no API key, transport error, non-200, bad JSON, empty
//! forecast) reads as "no rain predicted".  Failures are not cached, so the
//! next evaluation retries.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::config::WeatherConfig;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Forecast {
    #[serde(default)]
    pub list: Vec<ForecastEntry>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ForecastEntry {
    #[serde(default)]
    pub weather: Vec<Conditions>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Conditions {
    #[serde(default)]
    pub description: String,
}

impl ForecastEntry {
    pub fn mentions_rain(&self) -> bool {
        self.weather
            .iter()
            .any(|c| c.description.to_ascii_lowercase().contains("rain"))
    }
}

/// Rain check on the forecast entry `lookahead` steps ahead, clamped to the
/// last entry.  An empty forecast never predicts rain.
pub fn rain_predicted(forecast: &Forecast, lookahead: usize) -> bool {
    let Some(last) = forecast.list.len().checked_sub(1) else {
        return false;
    };
    forecast.list[lookahead.min(last)].mentions_rain()
}

/// Coordinates compared bit-for-bit.
type CacheKey = (u64, u64);

struct CachedForecast {
    fetched_at: Instant,
    forecast: Arc<Forecast>,
}

pub struct WeatherClient {
    http: reqwest::Client,
    url: String,
    api_key: Option<String>,
    lookahead: usize,
    ttl: Duration,
    cache: Mutex<HashMap<CacheKey, CachedForecast>>,
}

impl WeatherClient {
    pub fn new(cfg: &WeatherConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(cfg.timeout)
            .build()
            .context("failed to build weather http client")?;
        Ok(Self {
            http,
            url: cfg.url.clone(),
            api_key: cfg.api_key.clone(),
            lookahead: cfg.lookahead,
            ttl: cfg.ttl,
            cache: Mutex::new(HashMap::new()),
        })
    }

    pub fn enabled(&self) -> bool {
        self.api_key.is_some()
    }

    pub async fn is_rain_predicted(&self, lat: f64, lon: f64) -> bool {
        match self.forecast(lat, lon).await {
            Some(f) => rain_predicted(&f, self.lookahead),
            None => false,
        }
    }

    /// Cached forecast for a location, fetching on miss or expiry.
    pub async fn forecast(&self, lat: f64, lon: f64) -> Option<Arc<Forecast>> {
        let Some(api_key) = self.api_key.as_deref() else {
            debug!("weather disabled, assuming no rain");
            return None;
        };
        let key = (lat.to_bits(), lon.to_bits());

        {
            let cache = self.cache.lock().await;
            if let Some(hit) = cache.get(&key) {
                if hit.fetched_at.elapsed() < self.ttl {
                    return Some(hit.forecast.clone());
                }
            }
        }

        match self.fetch(api_key, lat, lon).await {
            Ok(forecast) => {
                let forecast = Arc::new(forecast);
                let mut cache = self.cache.lock().await;
                cache.retain(|_, c| c.fetched_at.elapsed() < self.ttl);
                cache.insert(
                    key,
                    CachedForecast {
                        fetched_at: Instant::now(),
                        forecast: forecast.clone(),
                    },
                );
                Some(forecast)
            }
            Err(e) => {
                warn!(lat, lon, "weather fetch failed, assuming no rain: {e:#}");
                None
            }
        }
    }

    async fn fetch(&self, api_key: &str, lat: f64, lon: f64) -> Result<Forecast> {
        let resp = self
            .http
            .get(&self.url)
            .query(&[
                ("lat", lat.to_string()),
                ("lon", lon.to_string()),
                ("appid", api_key.to_string()),
                ("units", "metric".to_string()),
            ])
            .send()
            .await
            .context("forecast request failed")?;
        let status = resp.status();
        if !status.is_success() {
            anyhow::bail!("forecast endpoint returned {status}");
        }
        resp.json().await.context("invalid forecast json")
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{extract::Query, extract::State, http::StatusCode, routing::get, Json, Router};
    use serde_json::{json, Value};
    use std::collections::HashMap as Map;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn entry(desc: &str) -> ForecastEntry {
        ForecastEntry {
            weather: vec![Conditions {
                description: desc.into(),
            }],
        }
    }

    fn forecast(descs: &[&str]) -> Forecast {
        Forecast {
            list: descs.iter().map(|d| entry(d)).collect(),
        }
    }

    // -- rain_predicted -------------------------------------------------------

    #[test]
    fn empty_forecast_is_no_rain() {
        assert!(!rain_predicted(&Forecast::default(), 1));
    }

    #[test]
    fn lookahead_selects_entry() {
        let f = forecast(&["clear sky", "light rain", "clouds"]);
        assert!(!rain_predicted(&f, 0));
        assert!(rain_predicted(&f, 1));
        assert!(!rain_predicted(&f, 2));
    }

    #[test]
    fn lookahead_clamps_to_last_entry() {
        let f = forecast(&["clear sky", "Heavy Rain"]);
        assert!(rain_predicted(&f, 7));
    }

    #[test]
    fn single_entry_forecast() {
        assert!(rain_predicted(&forecast(&["moderate rain"]), 1));
        assert!(!rain_predicted(&forecast(&["snow"]), 1));
    }

    #[test]
    fn parses_openweathermap_shape() {
        let raw = json!({
            "cod": "200",
            "list": [
                {"dt": 1, "weather": [{"id": 800, "main": "Clear", "description": "clear sky"}]},
                {"dt": 2, "weather": [{"id": 500, "main": "Rain", "description": "light rain"}]}
            ]
        });
        let f: Forecast = serde_json::from_value(raw).unwrap();
        assert!(rain_predicted(&f, 1));
    }

    // -- WeatherClient --------------------------------------------------------

    #[derive(Clone)]
    struct Upstream {
        hits: Arc<AtomicUsize>,
        status: StatusCode,
        body: Value,
    }

    async fn handler(
        State(up): State<Upstream>,
        Query(q): Query<Map<String, String>>,
    ) -> (StatusCode, Json<Value>) {
        up.hits.fetch_add(1, Ordering::SeqCst);
        assert_eq!(q.get("units").map(String::as_str), Some("metric"));
        assert!(q.contains_key("appid"));
        (up.status, Json(up.body.clone()))
    }

    async fn spawn_upstream(status: StatusCode, body: Value) -> (String, Arc<AtomicUsize>) {
        let hits = Arc::new(AtomicUsize::new(0));
        let app = Router::new().route("/forecast", get(handler)).with_state(Upstream {
            hits: hits.clone(),
            status,
            body,
        });
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (format!("http://{addr}/forecast"), hits)
    }

    fn client(url: &str, key: Option<&str>, ttl: Duration) -> WeatherClient {
        WeatherClient::new(&WeatherConfig {
            url: url.into(),
            api_key: key.map(String::from),
            lookahead: 1,
            ttl,
            timeout: Duration::from_secs(5),
        })
        .unwrap()
    }

    fn rainy() -> Value {
        json!({"list": [
            {"weather": [{"main": "Clouds", "description": "overcast clouds"}]},
            {"weather": [{"main": "Rain", "description": "light rain"}]}
        ]})
    }

    #[tokio::test]
    async fn disabled_without_api_key() {
        let (url, hits) = spawn_upstream(StatusCode::OK, rainy()).await;
        let weather = client(&url, None, Duration::from_secs(600));
        assert!(!weather.enabled());
        assert!(!weather.is_rain_predicted(1.0, 2.0).await);
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn second_lookup_within_ttl_is_cached() {
        let (url, hits) = spawn_upstream(StatusCode::OK, rainy()).await;
        let weather = client(&url, Some("k"), Duration::from_secs(600));
        assert!(weather.is_rain_predicted(45.0, 9.0).await);
        assert!(weather.is_rain_predicted(45.0, 9.0).await);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn different_locations_fetch_separately() {
        let (url, hits) = spawn_upstream(StatusCode::OK, rainy()).await;
        let weather = client(&url, Some("k"), Duration::from_secs(600));
        weather.is_rain_predicted(45.0, 9.0).await;
        weather.is_rain_predicted(46.0, 9.0).await;
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn expired_entry_is_refetched() {
        let (url, hits) = spawn_upstream(StatusCode::OK, rainy()).await;
        let weather = client(&url, Some("k"), Duration::ZERO);
        weather.is_rain_predicted(45.0, 9.0).await;
        weather.is_rain_predicted(45.0, 9.0).await;
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn upstream_error_means_no_rain_and_is_not_cached() {
        let (url, hits) = spawn_upstream(StatusCode::UNAUTHORIZED, json!({"cod": 401})).await;
        let weather = client(&url, Some("bad"), Duration::from_secs(600));
        assert!(!weather.is_rain_predicted(45.0, 9.0).await);
        assert!(!weather.is_rain_predicted(45.0, 9.0).await);
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn unreachable_upstream_means_no_rain() {
        let weather = client("http://127.0.0.1:9/forecast", Some("k"), Duration::from_secs(600));
        assert!(!weather.is_rain_predicted(45.0, 9.0).await);
    }
}
