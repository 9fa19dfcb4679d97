use rust_decimal::Decimal;
use rust_decimal_macros::dec;

/// Configuration loaded from environment variables, with defaults matching
/// the numeric values named throughout the spec (§4, §9).
#[derive(Clone)]
pub struct Config {
    // Exchange
    pub bybit_rest_url: String,
    pub bybit_api_key: String,
    pub bybit_api_secret: String,
    pub recv_window_ms: u64,

    // Chat transport
    pub telegram_bot_token: String,
    pub telegram_channels: Vec<String>,
    pub telegram_notify_chat_id: String,
    pub long_poll_timeout_secs: u64,

    // Persistence
    pub sqlite_path: String,
    pub telemetry_path: String,

    // Entry engine
    pub max_concurrent_positions: u32,
    pub entry_poll_interval_secs: u64,
    pub fast_fallback_pct: Decimal,
    pub leverage_min: Decimal,
    pub leverage_max: Decimal,
    pub leverage_default: Decimal,
    pub leverage_dynamic_tier_low: Decimal,
    pub leverage_dynamic_tier_high: Decimal,

    // Lifecycle manager
    pub trailing_activation_pct: Decimal,
    pub trailing_amend_min_interval_secs: i64,
    pub tp2_breakeven: bool,
    pub lifecycle_poll_interval_secs: u64,

    // Pyramid manager
    pub pyramid_max_multiplier: Decimal,
    pub pyramid_poll_interval_secs: u64,

    // Hedge manager
    pub hedge_trigger_pct: Decimal,
    pub hedge_poll_interval_secs: u64,
    pub max_re_entry_attempts: u32,

    // Watchdog / maintenance
    pub unfilled_cancel_after_hours: i64,
    pub unfilled_purge_after_days: i64,
    pub reconcile_interval_secs: u64,
    pub maintenance_interval_secs: u64,

    // Mode
    pub extract_only: bool,
}

impl Config {
    pub fn from_env() -> Self {
        Self {
            bybit_rest_url: std::env::var("BYBIT_REST_URL")
                .unwrap_or_else(|_| "https://api.bybit.com".into()),
            bybit_api_key: std::env::var("BYBIT_API_KEY").expect("BYBIT_API_KEY must be set"),
            bybit_api_secret: std::env::var("BYBIT_API_SECRET")
                .expect("BYBIT_API_SECRET must be set"),
            recv_window_ms: env_num("RECV_WINDOW_MS", 5_000),

            telegram_bot_token: std::env::var("TELEGRAM_BOT_TOKEN")
                .expect("TELEGRAM_BOT_TOKEN must be set"),
            telegram_channels: std::env::var("TELEGRAM_CHANNELS")
                .unwrap_or_default()
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect(),
            telegram_notify_chat_id: std::env::var("TELEGRAM_NOTIFY_CHAT_ID")
                .expect("TELEGRAM_NOTIFY_CHAT_ID must be set"),
            long_poll_timeout_secs: env_num("LONG_POLL_TIMEOUT_SECS", 30),

            sqlite_path: std::env::var("SQLITE_PATH").unwrap_or_else(|_| "pipeline.db".into()),
            telemetry_path: std::env::var("TELEMETRY_PATH")
                .unwrap_or_else(|_| "telemetry.ndjson".into()),

            max_concurrent_positions: env_num("MAX_CONCURRENT_POSITIONS", 10),
            entry_poll_interval_secs: env_num("ENTRY_POLL_INTERVAL_SECS", 2),
            fast_fallback_pct: env_dec("FAST_FALLBACK_PCT", dec!(2.0)),
            leverage_min: env_dec("LEVERAGE_MIN", dec!(6.00)),
            leverage_max: env_dec("LEVERAGE_MAX", dec!(50.00)),
            leverage_default: env_dec("LEVERAGE_DEFAULT", dec!(10)),
            leverage_dynamic_tier_low: env_dec("LEVERAGE_DYNAMIC_TIER_LOW", dec!(5)),
            leverage_dynamic_tier_high: env_dec("LEVERAGE_DYNAMIC_TIER_HIGH", dec!(10)),

            trailing_activation_pct: env_dec("TRAILING_ACTIVATION_PCT", dec!(6.1)),
            trailing_amend_min_interval_secs: env_num("TRAILING_AMEND_MIN_INTERVAL_SECS", 10),
            tp2_breakeven: env_bool("TP2_BREAKEVEN", true),
            lifecycle_poll_interval_secs: env_num("LIFECYCLE_POLL_INTERVAL_SECS", 5),

            pyramid_max_multiplier: env_dec("PYRAMID_MAX_MULTIPLIER", dec!(2.0)),
            pyramid_poll_interval_secs: env_num("PYRAMID_POLL_INTERVAL_SECS", 30),

            hedge_trigger_pct: env_dec("HEDGE_TRIGGER_PCT", dec!(-2.0)),
            hedge_poll_interval_secs: env_num("HEDGE_POLL_INTERVAL_SECS", 30),
            max_re_entry_attempts: env_num("MAX_RE_ENTRY_ATTEMPTS", 3),

            unfilled_cancel_after_hours: env_num("UNFILLED_CANCEL_AFTER_HOURS", 24),
            unfilled_purge_after_days: env_num("UNFILLED_PURGE_AFTER_DAYS", 6),
            reconcile_interval_secs: env_num("RECONCILE_INTERVAL_SECS", 60),
            maintenance_interval_secs: env_num("MAINTENANCE_INTERVAL_SECS", 3600),

            extract_only: env_bool("EXTRACT_ONLY", false),
        }
    }

    /// Pyramid scale ladder: (threshold_pct_from_entry, add_fraction_of_planned_qty).
    pub fn pyramid_ladder(&self) -> Vec<(Decimal, Decimal)> {
        vec![(dec!(3.0), dec!(0.50)), (dec!(6.0), dec!(0.25))]
    }
}

fn env_num<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

fn env_dec(key: &str, default: Decimal) -> Decimal {
    std::env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

fn env_bool(key: &str, default: bool) -> bool {
    std::env::var(key)
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(default)
}
