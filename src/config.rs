//! Daemon settings from `COURTSIDE_*` environment variables. Unparseable
//! values fall back to their defaults.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::clock::FacilityTz;
use crate::mailer::SmtpSettings;
use crate::model::{Money, SlotTime};
use crate::pricing::RateCard;
use crate::retry::RetryPolicy;

pub const WAL_FILE_NAME: &str = "courtside.wal";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub data_dir: PathBuf,
    pub courts: u32,
    pub sweep_interval: Duration,
    pub sweep_send_emails: bool,
    pub compact_threshold: u64,
    pub metrics_port: Option<u16>,
    pub tz: FacilityTz,
    pub rates: RateCard,
    pub counter_retry: RetryPolicy,
    /// `None` disables email.
    pub smtp: Option<SmtpSettings>,
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let money = |key: &str, default: i64| {
            lookup(key)
                .and_then(|s| Money::parse(&s))
                .unwrap_or(Money::whole(default))
        };

        let defaults = RateCard::default();
        let rates = RateCard {
            badminton_off_peak: money("COURTSIDE_BADMINTON_OFF_PEAK", 15),
            badminton_peak: money("COURTSIDE_BADMINTON_PEAK", 18),
            pickleball: money("COURTSIDE_PICKLEBALL", 25),
            peak_starts: lookup("COURTSIDE_PEAK_STARTS")
                .and_then(|s| SlotTime::parse(&s).ok())
                .unwrap_or(defaults.peak_starts),
        };

        let tz = parsed(&lookup, "COURTSIDE_UTC_OFFSET_HOURS")
            .and_then(FacilityTz::from_hours)
            .unwrap_or_default();

        let smtp = lookup("COURTSIDE_SMTP_HOST")
            .filter(|h| !h.trim().is_empty())
            .map(|host| SmtpSettings {
                host,
                port: parsed(&lookup, "COURTSIDE_SMTP_PORT").unwrap_or(587),
                username: lookup("COURTSIDE_SMTP_USERNAME"),
                password: lookup("COURTSIDE_SMTP_PASSWORD"),
                from: lookup("COURTSIDE_SMTP_FROM").unwrap_or_else(|| "bookings@localhost".into()),
            });

        Self {
            data_dir: PathBuf::from(lookup("COURTSIDE_DATA_DIR").unwrap_or_else(|| "./data".into())),
            courts: parsed(&lookup, "COURTSIDE_COURTS").unwrap_or(4),
            sweep_interval: Duration::from_secs(
                parsed::<u64>(&lookup, "COURTSIDE_SWEEP_INTERVAL_SECS").unwrap_or(300).max(1),
            ),
            sweep_send_emails: lookup("COURTSIDE_SWEEP_SEND_EMAILS")
                .and_then(|s| parse_flag(&s))
                .unwrap_or(true),
            compact_threshold: parsed(&lookup, "COURTSIDE_COMPACT_THRESHOLD").unwrap_or(1000),
            metrics_port: parsed(&lookup, "COURTSIDE_METRICS_PORT"),
            tz,
            rates,
            counter_retry: RetryPolicy::new(
                parsed(&lookup, "COURTSIDE_COUNTER_RETRY_ATTEMPTS").unwrap_or(3),
                Duration::from_millis(parsed(&lookup, "COURTSIDE_COUNTER_RETRY_DELAY_MS").unwrap_or(100)),
            ),
            smtp,
        }
    }

    pub fn wal_path(&self) -> PathBuf {
        self.data_dir.join(WAL_FILE_NAME)
    }
}

fn parsed<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    lookup(key).and_then(|s| s.trim().parse().ok())
}

fn parse_flag(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        other => bool::from_str(other).ok(),
    }
}
