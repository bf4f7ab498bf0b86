use std::env;
use std::time::Duration;

use chrono::Weekday;
use chrono_tz::Tz;

use crate::services::api::RetryPolicy;
use crate::services::availability::DayPolicy;

pub const DEFAULT_TIMEZONE: Tz = chrono_tz::America::Santiago;

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub port: u16,
    pub api_base_url: String,
    pub timezone: Tz,
    pub window_days: usize,
    pub include_weekends: bool,
    pub channel: String,
    pub default_user: String,
    pub request_timeout: Duration,
    pub fetch_retries: u32,
    pub booking_retries: u32,
    pub backoff_base: Duration,
    pub notify_webhook_url: Option<String>,
    pub agent_whatsapp: Option<String>,
    pub business_name: String,
    pub session_idle_ttl: Duration,
}

impl AppConfig {
    pub fn from_env() -> Self {
        Self {
            port: env::var("PORT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(3000),
            api_base_url: env::var("VISIT_API_URL")
                .unwrap_or_else(|_| "http://localhost:8080".to_string()),
            timezone: env::var("SCHEDULER_TIMEZONE")
                .ok()
                .map(|raw| parse_timezone(&raw))
                .unwrap_or(DEFAULT_TIMEZONE),
            window_days: parse_or("SCHEDULER_WINDOW_DAYS", 5),
            include_weekends: env::var("SCHEDULER_INCLUDE_WEEKENDS")
                .map(|v| matches!(v.to_lowercase().as_str(), "1" | "true" | "yes"))
                .unwrap_or(false),
            channel: env::var("SCHEDULER_CHANNEL").unwrap_or_else(|_| "web".to_string()),
            default_user: env::var("SCHEDULER_DEFAULT_USER")
                .unwrap_or_else(|_| "anonymous".to_string()),
            request_timeout: Duration::from_secs(parse_or("VISIT_API_TIMEOUT_SECS", 10)),
            fetch_retries: parse_or("VISIT_API_FETCH_RETRIES", 3),
            booking_retries: parse_or("VISIT_API_BOOKING_RETRIES", 1),
            backoff_base: Duration::from_millis(parse_or("VISIT_API_BACKOFF_MS", 500)),
            notify_webhook_url: env::var("NOTIFY_WEBHOOK_URL").ok().filter(|v| !v.is_empty()),
            agent_whatsapp: env::var("AGENT_WHATSAPP").ok().filter(|v| !v.is_empty()),
            business_name: env::var("BUSINESS_NAME").unwrap_or_else(|_| "Visita".to_string()),
            session_idle_ttl: Duration::from_secs(parse_or("SCHEDULER_SESSION_TTL_SECS", 1800)),
        }
    }

    pub fn day_policy(&self) -> DayPolicy {
        let excluded = if self.include_weekends {
            Vec::new()
        } else {
            vec![Weekday::Sat, Weekday::Sun]
        };
        DayPolicy::new(self.window_days, excluded)
    }

    /// How often idle sessions are swept: a quarter of the TTL, at least a second.
    pub fn sweep_interval(&self) -> Duration {
        (self.session_idle_ttl / 4).max(Duration::from_secs(1))
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            fetch_retries: self.fetch_retries,
            booking_retries: self.booking_retries,
            backoff_base: self.backoff_base,
        }
    }
}

fn parse_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

pub fn parse_timezone(raw: &str) -> Tz {
    match raw.trim().parse::<Tz>() {
        Ok(tz) => tz,
        Err(e) => {
            tracing::error!(timezone = raw, error = %e, "invalid timezone id, using default");
            DEFAULT_TIMEZONE
        }
    }
}
