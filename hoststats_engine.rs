//! # Hoststats Engine
//!
//! Monitoring engine for a remote storage host. Contract obligations and host
//! status are polled on a fixed cadence and folded into hour-bucketed records
//! that can be queried by arbitrary date range.
//!
//! ```text
//! ┌──────────────┐  obligations  ┌────────────┐   deltas   ┌───────────────┐
//! │  HostSource  │ ────────────▶ │ Aggregator │ ─────────▶ │ SnapshotStore │
//! └──────────────┘               └────────────┘            └───────────────┘
//!        │  settings, storage, bandwidth                   ┌───────────────┐
//!        └───────────────────────────────────────────────▶ │ MetadataStore │
//!                                                          └───────────────┘
//! ```
//!
//! ## Records
//!
//! - **Snapshot**: what happened during an hour. Contract counts and revenue
//!   are additive, `active_contracts` is a gauge.
//! - **Metadata**: the absolute state of the host at the end of an hour.
//!
//! Both live in one sled database, keyed by the big-endian unix seconds of
//! the hour so that range scans come back in chronological order.

// ============================================================================
// SECTION 1: IMPORTS & DEPENDENCIES
// ============================================================================

#![allow(dead_code)]
#![warn(rust_2018_idioms)]

// ----------------------------------------------------------------------------
// Standard Library Imports
// ----------------------------------------------------------------------------
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt::{self, Display, Formatter};
use std::fs;
use std::iter::Sum;
use std::ops::{Add, AddAssign};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};

// ----------------------------------------------------------------------------
// Async Runtime
// ----------------------------------------------------------------------------
use async_trait::async_trait;
use futures::stream::{self, StreamExt, TryStreamExt};
use tokio::signal;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

// ----------------------------------------------------------------------------
// Concurrency Primitives
// ----------------------------------------------------------------------------
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};

// ----------------------------------------------------------------------------
// Serialization
// ----------------------------------------------------------------------------
use serde::de::{self, DeserializeOwned, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

// ----------------------------------------------------------------------------
// Strings, Errors, Logging
// ----------------------------------------------------------------------------
use anyhow::{Context as AnyhowContext, Result as AnyhowResult};
use compact_str::CompactString;
use thiserror::Error;
use tracing::level_filters::LevelFilter;
use tracing::{debug, error, info, trace, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::{layer::SubscriberExt, EnvFilter};

// ----------------------------------------------------------------------------
// Time, Numbers, Storage, Network
// ----------------------------------------------------------------------------
use chrono::{DateTime, Datelike, Duration as ChronoDuration, TimeZone, Utc};
use num_bigint::BigInt;
use num_traits::{Signed, Zero};
use reqwest::Client as HttpClient;
use sled::transaction::{
    ConflictableTransactionError, ConflictableTransactionResult, TransactionError,
    TransactionalTree,
};
use sled::{IVec, Transactional};

// ----------------------------------------------------------------------------
// Configuration & CLI
// ----------------------------------------------------------------------------
use clap::{Parser, Subcommand};
use figment::providers::{Env, Format, Serialized, Toml};
use figment::Figment;

// ============================================================================
// SECTION 2: CONSTANTS & VERSION INFORMATION
// ============================================================================

/// Engine version - follows semantic versioning
pub const ENGINE_VERSION: &str = env!("CARGO_PKG_VERSION");
pub const ENGINE_NAME: &str = "hoststats-engine";
pub const ENGINE_FULL_NAME: &str = "Hoststats Host Monitor";

// ----------------------------------------------------------------------------
// Buckets & Chain
// ----------------------------------------------------------------------------

/// Width of one storage bucket (seconds)
pub const BUCKET_SECS: i64 = 3600;

/// Seconds in a calendar day (UTC)
pub const DAY_SECS: i64 = 86_400;

/// Expected block production rate used to estimate future block times
pub const BLOCKS_PER_HOUR: u64 = 6;

/// Upper bound on a height-derived time estimate (100 years)
pub const MAX_ESTIMATE_HOURS: u64 = 24 * 365 * 100;

/// Concurrent block timestamp lookups per contract sync
pub const BLOCK_FETCH_CONCURRENCY: usize = 16;

// ----------------------------------------------------------------------------
// Storage Layout
// ----------------------------------------------------------------------------

pub const METADATA_TREE: &str = "host_meta";
pub const SNAPSHOT_TREE: &str = "host_snapshots";
pub const CONTRACT_EVENTS_TREE: &str = "contract_events";

pub const DEFAULT_DATA_PATH: &str = "data";
pub const DEFAULT_DB_FILE: &str = "hoststats.db";
pub const DEFAULT_FLUSH_EVERY_MS: u64 = 500;

// ----------------------------------------------------------------------------
// Remote Host
// ----------------------------------------------------------------------------

pub const DEFAULT_SOURCE_URL: &str = "http://localhost:9980";
pub const DEFAULT_USER_AGENT: &str = "Sia-Agent";
pub const DEFAULT_HTTP_TIMEOUT_SECS: u64 = 30;

// ----------------------------------------------------------------------------
// Timing & Intervals
// ----------------------------------------------------------------------------

/// Contract aggregation and metadata cadence (seconds)
pub const CONTRACTS_SYNC_INTERVAL_SECS: u64 = 600;

/// Host status, alerts and bandwidth cadence (seconds)
pub const STATUS_SYNC_INTERVAL_SECS: u64 = 10;

/// External connectivity check cadence (seconds)
pub const CONNECTIVITY_SYNC_INTERVAL_SECS: u64 = 600;

/// Fixed delay before a failed cycle is retried (seconds)
pub const SYNC_RETRY_BACKOFF_SECS: u64 = 30;

/// Bounded wait for sync tasks on shutdown (seconds)
pub const SHUTDOWN_TIMEOUT_SECS: u64 = 5;

/// Rolling window for reported bandwidth usage (days)
pub const BANDWIDTH_WINDOW_DAYS: u32 = 30;

/// Default metadata window for the `metadata` query (days)
pub const DEFAULT_METADATA_QUERY_DAYS: i64 = 30;

/// Default snapshot window for the `snapshots` query (days)
pub const DEFAULT_SNAPSHOT_QUERY_DAYS: i64 = 365;

/// Cycles slower than this are logged as warnings (milliseconds)
pub const SLOW_CYCLE_THRESHOLD_MS: u64 = 5_000;

// ----------------------------------------------------------------------------
// Alert Thresholds
// ----------------------------------------------------------------------------

pub const WARNING_UTILIZATION_PCT: u128 = 85;
pub const SEVERE_UTILIZATION_PCT: u128 = 98;

// ============================================================================
// SECTION 3: CORE TYPE SYSTEM
// ============================================================================
// Money, signed accumulators and the hour-bucket keys shared by both stores.
// ============================================================================

// ----------------------------------------------------------------------------
// 3.1 Number Parsing
// ----------------------------------------------------------------------------

/// Rejected decimal string.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("invalid decimal integer: {input:?}")]
pub struct NumberParseError {
    input: String,
}

impl NumberParseError {
    fn new(input: &str) -> Self {
        Self {
            input: input.to_string(),
        }
    }
}

fn is_decimal_digits(s: &str) -> bool {
    !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit())
}

// ----------------------------------------------------------------------------
// 3.2 Currency - Unsigned Amounts
// ----------------------------------------------------------------------------

/// An unsigned amount in the smallest currency unit (hastings).
///
/// Serialized as a decimal string so amounts above 2^53 survive JSON.
/// Addition saturates; subtraction is always explicit.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Currency(u128);

impl Currency {
    pub const ZERO: Currency = Currency(0);

    pub const fn new(hastings: u128) -> Self {
        Self(hastings)
    }

    pub const fn hastings(self) -> u128 {
        self.0
    }

    pub fn checked_sub(self, other: Currency) -> Option<Currency> {
        self.0.checked_sub(other.0).map(Currency)
    }

    pub fn saturating_sub(self, other: Currency) -> Currency {
        Currency(self.0.saturating_sub(other.0))
    }

    pub fn saturating_add(self, other: Currency) -> Currency {
        Currency(self.0.saturating_add(other.0))
    }
}

impl Add for Currency {
    type Output = Currency;

    fn add(self, rhs: Currency) -> Currency {
        self.saturating_add(rhs)
    }
}

impl AddAssign for Currency {
    fn add_assign(&mut self, rhs: Currency) {
        *self = self.saturating_add(rhs);
    }
}

impl Sum for Currency {
    fn sum<I: Iterator<Item = Currency>>(iter: I) -> Currency {
        iter.fold(Currency::ZERO, Add::add)
    }
}

impl Zero for Currency {
    fn zero() -> Self {
        Currency::ZERO
    }

    fn is_zero(&self) -> bool {
        self.0 == 0
    }
}

impl From<u64> for Currency {
    fn from(value: u64) -> Self {
        Currency(u128::from(value))
    }
}

impl From<u128> for Currency {
    fn from(value: u128) -> Self {
        Currency(value)
    }
}

impl Display for Currency {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for Currency {
    type Err = NumberParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if !is_decimal_digits(s) {
            return Err(NumberParseError::new(s));
        }
        s.parse::<u128>()
            .map(Currency)
            .map_err(|_| NumberParseError::new(s))
    }
}

impl Serialize for Currency {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Currency {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct CurrencyVisitor;

        impl<'de> Visitor<'de> for CurrencyVisitor {
            type Value = Currency;

            fn expecting(&self, f: &mut Formatter<'_>) -> fmt::Result {
                f.write_str("an unsigned decimal string or integer")
            }

            fn visit_str<E: de::Error>(self, v: &str) -> Result<Currency, E> {
                v.parse().map_err(E::custom)
            }

            fn visit_u64<E: de::Error>(self, v: u64) -> Result<Currency, E> {
                Ok(Currency::from(v))
            }

            fn visit_i64<E: de::Error>(self, v: i64) -> Result<Currency, E> {
                u64::try_from(v)
                    .map(Currency::from)
                    .map_err(|_| E::custom(format!("negative currency amount: {}", v)))
            }
        }

        deserializer.deserialize_any(CurrencyVisitor)
    }
}

// ----------------------------------------------------------------------------
// 3.3 BigNumber - Signed Accumulator
// ----------------------------------------------------------------------------

/// Arbitrary-precision signed integer for revenue figures.
///
/// Unlike [`Currency`], subtraction never saturates: burnt collateral larger
/// than a payout produces a negative value. Every operation returns a new
/// value and leaves the receiver untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BigNumber(BigInt);

impl BigNumber {
    pub fn zero() -> Self {
        Self(BigInt::zero())
    }

    pub fn from_currency(c: Currency) -> Self {
        Self(BigInt::from(c.hastings()))
    }

    pub fn add_currency(&self, c: Currency) -> BigNumber {
        BigNumber(&self.0 + BigInt::from(c.hastings()))
    }

    pub fn sub_currency(&self, c: Currency) -> BigNumber {
        BigNumber(&self.0 - BigInt::from(c.hastings()))
    }

    pub fn add(&self, other: &BigNumber) -> BigNumber {
        BigNumber(&self.0 + &other.0)
    }

    pub fn sub(&self, other: &BigNumber) -> BigNumber {
        BigNumber(&self.0 - &other.0)
    }

    /// Floor division by an unsigned divisor.
    ///
    /// Rounds toward negative infinity, so `-7 / 2 == -4`.
    ///
    /// # Panics
    ///
    /// Panics if `divisor` is zero, like integer division.
    pub fn div64(&self, divisor: u64) -> BigNumber {
        let d = BigInt::from(divisor);
        let quotient = &self.0 / &d;
        let remainder = &self.0 % &d;
        if remainder.is_negative() {
            BigNumber(quotient - 1)
        } else {
            BigNumber(quotient)
        }
    }

    pub fn is_negative(&self) -> bool {
        self.0.is_negative()
    }

    pub fn is_zero(&self) -> bool {
        self.0.is_zero()
    }

    pub fn as_bigint(&self) -> &BigInt {
        &self.0
    }
}

impl From<i64> for BigNumber {
    fn from(value: i64) -> Self {
        BigNumber(BigInt::from(value))
    }
}

impl From<Currency> for BigNumber {
    fn from(value: Currency) -> Self {
        BigNumber::from_currency(value)
    }
}

impl Display for BigNumber {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        Display::fmt(&self.0, f)
    }
}

impl FromStr for BigNumber {
    type Err = NumberParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (negative, digits) = match s.strip_prefix('-') {
            Some(rest) => (true, rest),
            None => (false, s.strip_prefix('+').unwrap_or(s)),
        };
        if !is_decimal_digits(digits) {
            return Err(NumberParseError::new(s));
        }
        let magnitude =
            BigInt::parse_bytes(digits.as_bytes(), 10).ok_or_else(|| NumberParseError::new(s))?;
        Ok(BigNumber(if negative { -magnitude } else { magnitude }))
    }
}

impl Serialize for BigNumber {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for BigNumber {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct BigNumberVisitor;

        impl<'de> Visitor<'de> for BigNumberVisitor {
            type Value = BigNumber;

            fn expecting(&self, f: &mut Formatter<'_>) -> fmt::Result {
                f.write_str("a base-10 integer string")
            }

            fn visit_str<E: de::Error>(self, v: &str) -> Result<BigNumber, E> {
                v.parse().map_err(E::custom)
            }

            fn visit_i64<E: de::Error>(self, v: i64) -> Result<BigNumber, E> {
                Ok(BigNumber::from(v))
            }

            fn visit_u64<E: de::Error>(self, v: u64) -> Result<BigNumber, E> {
                Ok(BigNumber(BigInt::from(v)))
            }
        }

        deserializer.deserialize_any(BigNumberVisitor)
    }
}

// ----------------------------------------------------------------------------
// 3.4 Time Helpers
// ----------------------------------------------------------------------------

fn truncate_secs(ts: DateTime<Utc>, step: i64) -> DateTime<Utc> {
    let secs = ts.timestamp().div_euclid(step) * step;
    DateTime::from_timestamp(secs, 0).unwrap_or_default()
}

/// Start of the UTC hour containing `ts`.
pub fn truncate_to_hour(ts: DateTime<Utc>) -> DateTime<Utc> {
    truncate_secs(ts, BUCKET_SECS)
}

/// Start of the UTC calendar day containing `ts`.
pub fn truncate_to_day(ts: DateTime<Utc>) -> DateTime<Utc> {
    truncate_secs(ts, DAY_SECS)
}

fn add_hours(ts: DateTime<Utc>, hours: u64) -> DateTime<Utc> {
    let hours = hours.min(MAX_ESTIMATE_HOURS) as i64;
    ts.checked_add_signed(ChronoDuration::hours(hours))
        .unwrap_or(ts)
}

fn sub_hours(ts: DateTime<Utc>, hours: u64) -> DateTime<Utc> {
    let hours = hours.min(MAX_ESTIMATE_HOURS) as i64;
    ts.checked_sub_signed(ChronoDuration::hours(hours))
        .unwrap_or(ts)
}

fn unix_to_datetime(secs: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(secs, 0).unwrap_or_default()
}

// ----------------------------------------------------------------------------
// 3.5 Bucket Keys
// ----------------------------------------------------------------------------

/// Store key of an hour bucket: big-endian unix seconds of the hour start.
///
/// Byte order matches time order, so a cursor walking the tree visits
/// buckets chronologically. Pre-epoch timestamps clamp to key zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BucketKey([u8; 8]);

impl BucketKey {
    pub fn encode(ts: DateTime<Utc>) -> Self {
        let hour = truncate_to_hour(ts).timestamp().max(0) as u64;
        Self(hour.to_be_bytes())
    }

    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        bytes.try_into().ok().map(Self)
    }

    pub fn as_bytes(&self) -> &[u8; 8] {
        &self.0
    }

    pub fn unix(&self) -> u64 {
        u64::from_be_bytes(self.0)
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        i64::try_from(self.unix())
            .map(unix_to_datetime)
            .unwrap_or_default()
    }
}

impl AsRef<[u8]> for BucketKey {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl From<BucketKey> for IVec {
    fn from(key: BucketKey) -> IVec {
        IVec::from(&key.0[..])
    }
}

impl Display for BucketKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.timestamp().to_rfc3339())
    }
}

/// An hour bucket as an ordered map key (unix seconds of the hour start).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BucketId(i64);

impl BucketId {
    pub fn from_timestamp(ts: DateTime<Utc>) -> Self {
        Self(truncate_to_hour(ts).timestamp())
    }

    pub fn unix(self) -> i64 {
        self.0
    }

    pub fn timestamp(self) -> DateTime<Utc> {
        unix_to_datetime(self.0)
    }

    pub fn key(self) -> BucketKey {
        BucketKey::encode(self.timestamp())
    }

    pub fn next(self) -> Self {
        Self(self.0 + BUCKET_SECS)
    }
}

impl Display for BucketId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.timestamp().to_rfc3339())
    }
}

// ============================================================================
// SECTION 4: ERROR HANDLING FRAMEWORK
// ============================================================================

// ----------------------------------------------------------------------------
// 4.1 Core Engine Errors
// ----------------------------------------------------------------------------

/// The main error type for the engine.
/// All subsystem errors can be converted to this type.
#[derive(Error, Debug)]
pub enum LedgerError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Storage error: {0}")]
    Store(#[from] StoreError),

    #[error("Host source error: {0}")]
    Source(#[from] SourceError),

    #[error("Sync error: {0}")]
    Sync(#[from] SyncError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Shutdown in progress")]
    ShuttingDown,
}

impl LedgerError {
    /// Check if this error is recoverable
    pub fn is_recoverable(&self) -> bool {
        match self {
            LedgerError::Config(_) => false,
            LedgerError::Store(e) => e.is_recoverable(),
            LedgerError::Source(e) => e.is_recoverable(),
            LedgerError::Sync(e) => e.is_recoverable(),
            LedgerError::Io(_) => true,
            LedgerError::Internal(_) => false,
            LedgerError::ShuttingDown => false,
        }
    }

    /// Get the error category for logging
    pub fn category(&self) -> &'static str {
        match self {
            LedgerError::Config(_) => "config",
            LedgerError::Store(_) => "storage",
            LedgerError::Source(_) => "source",
            LedgerError::Sync(_) => "sync",
            LedgerError::Io(_) => "io",
            LedgerError::Internal(_) => "internal",
            LedgerError::ShuttingDown => "shutdown",
        }
    }
}

// ----------------------------------------------------------------------------
// 4.2 Configuration Errors
// ----------------------------------------------------------------------------

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Configuration file not found: {path}")]
    FileNotFound { path: PathBuf },

    #[error("Failed to parse configuration: {message}")]
    ParseError { message: String },

    #[error("Invalid value for {field}: {message}")]
    InvalidValue { field: String, message: String },
}

// ----------------------------------------------------------------------------
// 4.3 Storage Errors
// ----------------------------------------------------------------------------

/// Errors raised by the metadata and snapshot stores
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Invalid time range: start={start}, end={end}")]
    InvalidTimeRange {
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    },

    #[error("Corrupt record at {key}: {message}")]
    Decode { key: String, message: String },

    #[error("Failed to encode record: {message}")]
    Encode { message: String },

    #[error("Database error: {0}")]
    Backend(#[from] sled::Error),

    #[error("Transaction failed: {message}")]
    Transaction { message: String },
}

impl StoreError {
    pub fn is_recoverable(&self) -> bool {
        match self {
            StoreError::InvalidTimeRange { .. } => false,
            StoreError::Decode { .. } => false,
            StoreError::Encode { .. } => false,
            StoreError::Backend(_) => true,
            StoreError::Transaction { .. } => true,
        }
    }
}

impl From<TransactionError<StoreError>> for StoreError {
    fn from(e: TransactionError<StoreError>) -> Self {
        match e {
            TransactionError::Abort(inner) => inner,
            TransactionError::Storage(e) => StoreError::Backend(e),
        }
    }
}

// ----------------------------------------------------------------------------
// 4.4 Host Source Errors
// ----------------------------------------------------------------------------

/// Errors talking to the remote host
#[derive(Error, Debug)]
pub enum SourceError {
    #[error("Cannot reach {url}: {message}")]
    ConnectionFailed { url: String, message: String },

    #[error("{url} returned HTTP {status}")]
    HttpStatus { url: String, status: u16 },

    #[error("Invalid response from {url}: {message}")]
    InvalidResponse { url: String, message: String },

    #[error("No block found at height {height}")]
    MissingBlock { height: u64 },
}

impl SourceError {
    pub fn is_recoverable(&self) -> bool {
        match self {
            SourceError::ConnectionFailed { .. } => true,
            SourceError::HttpStatus { status, .. } => *status >= 500 || *status == 429,
            SourceError::InvalidResponse { .. } => false,
            SourceError::MissingBlock { .. } => true,
        }
    }
}

// ----------------------------------------------------------------------------
// 4.5 Sync Errors
// ----------------------------------------------------------------------------

/// Errors that end a sync cycle
#[derive(Error, Debug)]
pub enum SyncError {
    #[error(transparent)]
    Source(#[from] SourceError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("Sync tasks still running after {timeout_secs}s")]
    ShutdownTimeout { timeout_secs: u64 },
}

impl SyncError {
    pub fn is_recoverable(&self) -> bool {
        match self {
            SyncError::Source(e) => e.is_recoverable(),
            SyncError::Store(e) => e.is_recoverable(),
            SyncError::ShutdownTimeout { .. } => false,
        }
    }
}

// ----------------------------------------------------------------------------
// 4.6 Result Type Aliases
// ----------------------------------------------------------------------------

pub type LedgerResult<T> = Result<T, LedgerError>;
pub type StoreResult<T> = Result<T, StoreError>;
pub type SourceResult<T> = Result<T, SourceError>;
pub type SyncResult<T> = Result<T, SyncError>;

// ============================================================================
// SECTION 5: CONFIGURATION SYSTEM
// ============================================================================
// TOML file with environment overrides (HOSTSTATS_SECTION__FIELD), validated
// once at startup. Every field has a default so an empty file is valid.
// ============================================================================

// ----------------------------------------------------------------------------
// 5.1 Main Configuration Structure
// ----------------------------------------------------------------------------

/// Root configuration for the engine
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub engine: GeneralConfig,

    #[serde(default)]
    pub source: SourceConfig,

    #[serde(default)]
    pub sync: SyncConfig,

    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

impl EngineConfig {
    /// Load configuration from file with environment overrides
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();

        if !path.exists() {
            return Err(ConfigError::FileNotFound {
                path: path.to_path_buf(),
            });
        }

        Self::extract(Figment::new().merge(Toml::file(path)))
    }

    /// Defaults, then the file if present, then the environment
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        Self::extract(
            Figment::from(Serialized::defaults(Self::default())).merge(Toml::file(path.as_ref())),
        )
    }

    fn extract(figment: Figment) -> Result<Self, ConfigError> {
        let config: Self = figment
            .merge(Env::prefixed("HOSTSTATS_").split("__"))
            .extract()
            .map_err(|e| ConfigError::ParseError {
                message: e.to_string(),
            })?;

        config.validate()?;
        Ok(config)
    }

    /// Load from string (for testing)
    pub fn from_str(toml_str: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(toml_str).map_err(|e| ConfigError::ParseError {
            message: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        fn invalid(field: &str, message: &str) -> ConfigError {
            ConfigError::InvalidValue {
                field: field.into(),
                message: message.into(),
            }
        }

        if self.engine.data_path.as_os_str().is_empty() {
            return Err(invalid("engine.data_path", "must not be empty"));
        }
        if self.engine.shutdown_timeout_secs == 0 {
            return Err(invalid("engine.shutdown_timeout_secs", "must be positive"));
        }

        let url = self.source.url.trim();
        if !(url.starts_with("http://") || url.starts_with("https://")) {
            return Err(invalid("source.url", "must be an http:// or https:// URL"));
        }
        if let Some(connectivity) = &self.source.connectivity_url {
            if !(connectivity.starts_with("http://") || connectivity.starts_with("https://")) {
                return Err(invalid(
                    "source.connectivity_url",
                    "must be an http:// or https:// URL",
                ));
            }
        }
        if self.source.timeout_secs == 0 {
            return Err(invalid("source.timeout_secs", "must be positive"));
        }

        for (field, value) in [
            ("sync.contracts_interval_secs", self.sync.contracts_interval_secs),
            ("sync.status_interval_secs", self.sync.status_interval_secs),
            (
                "sync.connectivity_interval_secs",
                self.sync.connectivity_interval_secs,
            ),
            ("sync.retry_backoff_secs", self.sync.retry_backoff_secs),
        ] {
            if value == 0 {
                return Err(invalid(field, "interval must be positive"));
            }
        }
        if self.sync.bandwidth_window_days == 0 {
            return Err(invalid("sync.bandwidth_window_days", "must be positive"));
        }

        if self.storage.db_file.trim().is_empty() {
            return Err(invalid("storage.db_file", "must not be empty"));
        }

        if !matches!(self.logging.format.as_str(), "pretty" | "compact" | "json") {
            return Err(invalid(
                "logging.format",
                "expected one of: pretty, compact, json",
            ));
        }

        Ok(())
    }

    /// Create a default config file
    pub fn generate_default_config() -> String {
        let config = Self::default();
        toml::to_string_pretty(&config).unwrap_or_default()
    }

    /// Full path of the sled database
    pub fn db_path(&self) -> PathBuf {
        self.engine.data_path.join(&self.storage.db_file)
    }
}

// ----------------------------------------------------------------------------
// 5.2 General Engine Configuration
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    /// Name used in logs
    #[serde(default = "default_instance_name")]
    pub instance_name: String,

    /// Directory holding the database and, by default, the log file
    #[serde(default = "default_data_path")]
    pub data_path: PathBuf,

    /// Bounded wait for in-flight cycles on shutdown
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout_secs: u64,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            instance_name: default_instance_name(),
            data_path: default_data_path(),
            shutdown_timeout_secs: default_shutdown_timeout(),
        }
    }
}

fn default_instance_name() -> String {
    "hoststats".into()
}

fn default_data_path() -> PathBuf {
    PathBuf::from(DEFAULT_DATA_PATH)
}

fn default_shutdown_timeout() -> u64 {
    SHUTDOWN_TIMEOUT_SECS
}

// ----------------------------------------------------------------------------
// 5.3 Host Source Configuration
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    /// Base URL of the host API
    #[serde(default = "default_source_url")]
    pub url: String,

    /// Base URL of the external connectivity checker; checks are skipped when unset
    #[serde(default)]
    pub connectivity_url: Option<String>,

    /// API password, sent as HTTP basic auth with an empty user
    #[serde(default)]
    pub api_password: Option<String>,

    #[serde(default = "default_user_agent")]
    pub user_agent: String,

    #[serde(default = "default_http_timeout")]
    pub timeout_secs: u64,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            url: default_source_url(),
            connectivity_url: None,
            api_password: None,
            user_agent: default_user_agent(),
            timeout_secs: default_http_timeout(),
        }
    }
}

fn default_source_url() -> String {
    DEFAULT_SOURCE_URL.into()
}

fn default_user_agent() -> String {
    DEFAULT_USER_AGENT.into()
}

fn default_http_timeout() -> u64 {
    DEFAULT_HTTP_TIMEOUT_SECS
}

// ----------------------------------------------------------------------------
// 5.4 Sync Configuration
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    #[serde(default = "default_contracts_interval")]
    pub contracts_interval_secs: u64,

    #[serde(default = "default_status_interval")]
    pub status_interval_secs: u64,

    #[serde(default = "default_connectivity_interval")]
    pub connectivity_interval_secs: u64,

    #[serde(default = "default_retry_backoff")]
    pub retry_backoff_secs: u64,

    /// Apply each contract's contribution once per revision instead of
    /// merging every batch (at-least-once)
    #[serde(default = "default_true")]
    pub dedupe_contract_events: bool,

    #[serde(default = "default_bandwidth_window")]
    pub bandwidth_window_days: u32,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            contracts_interval_secs: default_contracts_interval(),
            status_interval_secs: default_status_interval(),
            connectivity_interval_secs: default_connectivity_interval(),
            retry_backoff_secs: default_retry_backoff(),
            dedupe_contract_events: true,
            bandwidth_window_days: default_bandwidth_window(),
        }
    }
}

impl SyncConfig {
    pub fn retry_backoff(&self) -> Duration {
        Duration::from_secs(self.retry_backoff_secs)
    }

    pub fn bandwidth_window(&self) -> ChronoDuration {
        ChronoDuration::days(i64::from(self.bandwidth_window_days))
    }
}

fn default_contracts_interval() -> u64 {
    CONTRACTS_SYNC_INTERVAL_SECS
}

fn default_status_interval() -> u64 {
    STATUS_SYNC_INTERVAL_SECS
}

fn default_connectivity_interval() -> u64 {
    CONNECTIVITY_SYNC_INTERVAL_SECS
}

fn default_retry_backoff() -> u64 {
    SYNC_RETRY_BACKOFF_SECS
}

fn default_bandwidth_window() -> u32 {
    BANDWIDTH_WINDOW_DAYS
}

fn default_true() -> bool {
    true
}

// ----------------------------------------------------------------------------
// 5.5 Storage Configuration
// ----------------------------------------------------------------------------

/// What a range read does with a record that no longer decodes
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CorruptRecordPolicy {
    /// Log and leave the record out of the result
    #[default]
    Skip,
    /// Fail the whole read
    Abort,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Database directory name inside `engine.data_path`
    #[serde(default = "default_db_file")]
    pub db_file: String,

    #[serde(default)]
    pub corrupt_records: CorruptRecordPolicy,

    /// Background flush interval; `None` flushes only on shutdown
    #[serde(default = "default_flush_every_ms")]
    pub flush_every_ms: Option<u64>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            db_file: default_db_file(),
            corrupt_records: CorruptRecordPolicy::Skip,
            flush_every_ms: default_flush_every_ms(),
        }
    }
}

fn default_db_file() -> String {
    DEFAULT_DB_FILE.into()
}

fn default_flush_every_ms() -> Option<u64> {
    Some(DEFAULT_FLUSH_EVERY_MS)
}

// ----------------------------------------------------------------------------
// 5.6 Logging Configuration
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Output format (json, pretty, compact)
    #[serde(default = "default_log_format")]
    pub format: String,

    /// Write logs to this file instead of stdout
    #[serde(default)]
    pub file: Option<PathBuf>,

    #[serde(default = "default_true")]
    pub colors: bool,

    #[serde(default)]
    pub source_location: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
            file: None,
            colors: true,
            source_location: false,
        }
    }
}

fn default_log_level() -> String {
    "info".into()
}

fn default_log_format() -> String {
    "pretty".into()
}

// ============================================================================
// SECTION 6: LOGGING & TRACING INFRASTRUCTURE
// ============================================================================

// ----------------------------------------------------------------------------
// 6.1 Logger Initialization
// ----------------------------------------------------------------------------

fn parse_level_filter(level: &str) -> LevelFilter {
    match level.to_lowercase().as_str() {
        "trace" => LevelFilter::TRACE,
        "debug" => LevelFilter::DEBUG,
        "warn" | "warning" => LevelFilter::WARN,
        "error" => LevelFilter::ERROR,
        "off" => LevelFilter::OFF,
        _ => LevelFilter::INFO,
    }
}

/// Initialize the logging system based on configuration.
///
/// The returned guard flushes the file writer when dropped and must be held
/// for the life of the process.
pub fn init_logging(config: &LoggingConfig) -> LedgerResult<Option<WorkerGuard>> {
    let env_filter = EnvFilter::builder()
        .with_default_directive(parse_level_filter(&config.level).into())
        .from_env_lossy();

    let (writer, guard, ansi) = match &config.file {
        Some(path) => {
            let file_name = path.file_name().ok_or_else(|| ConfigError::InvalidValue {
                field: "logging.file".into(),
                message: format!("{} has no file name", path.display()),
            })?;
            let dir = path
                .parent()
                .filter(|p| !p.as_os_str().is_empty())
                .unwrap_or_else(|| Path::new("."));
            fs::create_dir_all(dir)?;
            let appender = tracing_appender::rolling::never(dir, file_name);
            let (non_blocking, guard) = tracing_appender::non_blocking(appender);
            (BoxMakeWriter::new(non_blocking), Some(guard), false)
        }
        None => (BoxMakeWriter::new(std::io::stdout), None, config.colors),
    };

    let registry = tracing_subscriber::registry().with(env_filter);
    let installed = match config.format.as_str() {
        "json" => tracing::subscriber::set_global_default(
            registry.with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_writer(writer)
                    .with_target(true)
                    .with_file(config.source_location)
                    .with_line_number(config.source_location),
            ),
        ),
        "compact" => tracing::subscriber::set_global_default(
            registry.with(
                tracing_subscriber::fmt::layer()
                    .compact()
                    .with_writer(writer)
                    .with_ansi(ansi)
                    .with_target(true),
            ),
        ),
        _ => tracing::subscriber::set_global_default(
            registry.with(
                tracing_subscriber::fmt::layer()
                    .pretty()
                    .with_writer(writer)
                    .with_ansi(ansi)
                    .with_target(true)
                    .with_file(config.source_location)
                    .with_line_number(config.source_location),
            ),
        ),
    };
    installed.map_err(|e| LedgerError::Internal(format!("Failed to set logger: {}", e)))?;

    info!(
        target: "hoststats::init",
        level = %config.level,
        format = %config.format,
        file = ?config.file,
        "Logging initialized"
    );

    Ok(guard)
}

// ----------------------------------------------------------------------------
// 6.2 Performance Timer
// ----------------------------------------------------------------------------

/// Measures a sync cycle and warns when it runs long
#[derive(Debug)]
pub struct PerfTimer {
    name: &'static str,
    start: Instant,
    threshold_ms: u64,
}

impl PerfTimer {
    pub fn with_threshold(name: &'static str, threshold_ms: u64) -> Self {
        Self {
            name,
            start: Instant::now(),
            threshold_ms,
        }
    }

    pub fn elapsed_ms(&self) -> u64 {
        self.start.elapsed().as_millis() as u64
    }

    /// Stop the timer and log if above threshold
    pub fn stop(self) -> u64 {
        let elapsed = self.elapsed_ms();

        if elapsed > self.threshold_ms {
            warn!(
                target: "hoststats::perf",
                operation = self.name,
                elapsed_ms = elapsed,
                threshold_ms = self.threshold_ms,
                "Operation exceeded threshold"
            );
        } else {
            trace!(
                target: "hoststats::perf",
                operation = self.name,
                elapsed_ms = elapsed,
                "Operation completed"
            );
        }

        elapsed
    }
}

// ============================================================================
// SECTION 7: RECORDS
// ============================================================================
// Persisted records (Metadata, Snapshot), alert and status records, and the
// contract lifecycle model fed to the aggregator.
// ============================================================================

// ----------------------------------------------------------------------------
// 7.1 Host Settings
// ----------------------------------------------------------------------------

/// Prices and collateral the host currently advertises
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HostSettings {
    pub base_rpc_price: Currency,
    pub sector_access_price: Currency,
    pub collateral: Currency,
    pub max_collateral: Currency,
    pub contract_price: Currency,
    pub download_price: Currency,
    pub storage_price: Currency,
    pub upload_price: Currency,
}

// ----------------------------------------------------------------------------
// 7.2 Metadata - Absolute Hourly State
// ----------------------------------------------------------------------------

/// Absolute state of the host at the end of an hour. Saved wholesale.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Metadata {
    pub active_contracts: u64,
    pub successful_contracts: u64,
    pub failed_contracts: u64,
    pub payout: Currency,
    pub earned_revenue: BigNumber,
    pub potential_revenue: Currency,
    pub burnt_collateral: Currency,
    pub used_storage: u64,
    pub total_storage: u64,
    pub upload_bandwidth: u64,
    pub download_bandwidth: u64,
    #[serde(rename = "host_settings")]
    pub settings: HostSettings,
    pub first_seen: DateTime<Utc>,
    pub timestamp: DateTime<Utc>,
}

impl Metadata {
    /// Copies the contract and revenue figures of `other`, keeping storage,
    /// bandwidth and settings.
    pub fn with_contract_figures(mut self, other: &Metadata) -> Self {
        self.active_contracts = other.active_contracts;
        self.successful_contracts = other.successful_contracts;
        self.failed_contracts = other.failed_contracts;
        self.payout = other.payout;
        self.earned_revenue = other.earned_revenue.clone();
        self.potential_revenue = other.potential_revenue;
        self.burnt_collateral = other.burnt_collateral;
        self.first_seen = other.first_seen;
        self
    }
}

// ----------------------------------------------------------------------------
// 7.3 Snapshot - Hourly Deltas
// ----------------------------------------------------------------------------

/// What happened during one hour.
///
/// `active_contracts` is a gauge and merges by overwrite. Every other count
/// and amount is additive and merges by summation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Snapshot {
    pub active_contracts: u64,
    pub new_contracts: u64,
    pub expired_contracts: u64,
    pub successful_contracts: u64,
    pub failed_contracts: u64,
    pub payout: Currency,
    pub earned_revenue: BigNumber,
    pub potential_revenue: Currency,
    pub burnt_collateral: Currency,
    pub timestamp: DateTime<Utc>,
}

impl Snapshot {
    /// An empty snapshot for the hour containing `ts`
    pub fn at(ts: DateTime<Utc>) -> Self {
        Self {
            timestamp: truncate_to_hour(ts),
            ..Self::default()
        }
    }

    /// Store merge: additive fields sum, the gauge takes `other`'s value.
    pub fn merge(&mut self, other: &Snapshot) {
        self.accumulate(other);
        self.active_contracts = other.active_contracts;
    }

    /// Adds the additive fields of `other`. The gauge is untouched.
    pub fn accumulate(&mut self, other: &Snapshot) {
        self.new_contracts = self.new_contracts.saturating_add(other.new_contracts);
        self.expired_contracts = self
            .expired_contracts
            .saturating_add(other.expired_contracts);
        self.successful_contracts = self
            .successful_contracts
            .saturating_add(other.successful_contracts);
        self.failed_contracts = self.failed_contracts.saturating_add(other.failed_contracts);
        self.payout += other.payout;
        self.earned_revenue = self.earned_revenue.add(&other.earned_revenue);
        self.potential_revenue += other.potential_revenue;
        self.burnt_collateral += other.burnt_collateral;
    }

    /// Inverse of [`Snapshot::accumulate`] for a contribution applied earlier.
    pub fn retract(&mut self, other: &Snapshot) {
        self.new_contracts = self.new_contracts.saturating_sub(other.new_contracts);
        self.expired_contracts = self
            .expired_contracts
            .saturating_sub(other.expired_contracts);
        self.successful_contracts = self
            .successful_contracts
            .saturating_sub(other.successful_contracts);
        self.failed_contracts = self.failed_contracts.saturating_sub(other.failed_contracts);
        self.payout = self.payout.saturating_sub(other.payout);
        self.earned_revenue = self.earned_revenue.sub(&other.earned_revenue);
        self.potential_revenue = self.potential_revenue.saturating_sub(other.potential_revenue);
        self.burnt_collateral = self.burnt_collateral.saturating_sub(other.burnt_collateral);
    }
}

// ----------------------------------------------------------------------------
// 7.4 Alerts
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertSeverity {
    Info,
    Warning,
    Severe,
}

impl AlertSeverity {
    /// Lenient parse for severities reported by external services
    pub fn parse(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "info" => AlertSeverity::Info,
            "severe" | "error" | "critical" => AlertSeverity::Severe,
            _ => AlertSeverity::Warning,
        }
    }
}

impl Display for AlertSeverity {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            AlertSeverity::Info => write!(f, "info"),
            AlertSeverity::Warning => write!(f, "warning"),
            AlertSeverity::Severe => write!(f, "severe"),
        }
    }
}

/// Identity under which alerts are registered and cleared
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum AlertId {
    /// The named sync task failed its last cycle
    Sync(SyncTask),
    FolderError,
    StorageUtilization,
    WalletLocked,
    WalletBalance,
    CollateralBudget,
    ConnectionStatus,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostAlert {
    #[serde(rename = "type")]
    pub kind: CompactString,
    pub text: CompactString,
    pub severity: AlertSeverity,
}

impl HostAlert {
    pub fn new(kind: &str, text: impl Into<CompactString>, severity: AlertSeverity) -> Self {
        Self {
            kind: CompactString::from(kind),
            text: text.into(),
            severity,
        }
    }

    pub fn warning(kind: &str, text: impl Into<CompactString>) -> Self {
        Self::new(kind, text, AlertSeverity::Warning)
    }

    pub fn severe(kind: &str, text: impl Into<CompactString>) -> Self {
        Self::new(kind, text, AlertSeverity::Severe)
    }
}

// ----------------------------------------------------------------------------
// 7.5 Host Status
// ----------------------------------------------------------------------------

/// Live host status, refreshed by the status sync
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostStatus {
    #[serde(flatten)]
    pub meta: Metadata,
    pub online: bool,
    pub connectable: bool,
    pub accepting_contracts: bool,
    pub wallet_unlocked: bool,
    pub version: CompactString,
    pub net_address: CompactString,
    /// When the host process started, as the host reports it
    pub start_time: Option<DateTime<Utc>>,
    pub last_update: DateTime<Utc>,
}

/// Upload/download byte counts
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BandwidthReading {
    pub upload: u64,
    pub download: u64,
}

// ----------------------------------------------------------------------------
// 7.6 Host Source Records
// ----------------------------------------------------------------------------

/// Host configuration and financial state as reported by the host
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HostInfo {
    pub settings: HostSettings,
    pub accepting_contracts: bool,
    pub net_address: CompactString,
    pub version: CompactString,
    pub total_storage: u64,
    pub remaining_storage: u64,
    pub locked_collateral: Currency,
    pub collateral_budget: Currency,
    /// When an external index first saw the host, if known
    pub first_seen: Option<DateTime<Utc>>,
    pub start_time: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageFolder {
    pub path: CompactString,
    pub capacity: u64,
    pub capacity_remaining: u64,
    pub failed_reads: u64,
    pub failed_writes: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WalletInfo {
    pub unlocked: bool,
    pub confirmed_balance: Currency,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectivityIssue {
    pub severity: AlertSeverity,
    pub message: CompactString,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectivityReport {
    pub connected: bool,
    pub errors: Vec<ConnectivityIssue>,
}

impl ConnectivityReport {
    /// Report used when no external checker is configured
    pub fn unchecked() -> Self {
        Self {
            connected: true,
            errors: Vec::new(),
        }
    }
}

// ----------------------------------------------------------------------------
// 7.7 Contracts
// ----------------------------------------------------------------------------

/// A storage obligation as reported by the host, heights not yet resolved
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Obligation {
    pub id: CompactString,
    pub formation_confirmed: bool,
    pub revision_number: u64,
    pub negotiation_height: u64,
    pub expiration_height: u64,
    pub proof_deadline: u64,
    pub proof_confirmed: bool,
    pub proof_height: Option<u64>,
    pub data_size: u64,
    pub locked_collateral: Currency,
    pub valid_proof_payout: Currency,
    pub missed_proof_payout: Currency,
    pub transaction_fees_added: Currency,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContractStatus {
    /// Formation transaction not yet confirmed
    Forming,
    #[default]
    Unresolved,
    Succeeded,
    Failed,
}

/// Chain position the obligations are evaluated against
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChainContext {
    pub height: u64,
    pub now: DateTime<Utc>,
}

impl ChainContext {
    /// Time of a height relative to the current block.
    ///
    /// Heights not yet reached are projected forward from the current hour at
    /// [`BLOCKS_PER_HOUR`]. Reached heights use the recorded block time, or a
    /// backward projection when the block is unknown.
    pub fn timestamp_for<F>(&self, height: u64, block_time: &F) -> DateTime<Utc>
    where
        F: Fn(u64) -> Option<DateTime<Utc>>,
    {
        if height > self.height {
            add_hours(
                truncate_to_hour(self.now),
                (height - self.height) / BLOCKS_PER_HOUR,
            )
        } else {
            block_time(height).unwrap_or_else(|| {
                sub_hours(truncate_to_hour(self.now), (self.height - height) / BLOCKS_PER_HOUR)
            })
        }
    }
}

/// A classified contract with its money values resolved
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContractRecord {
    pub id: CompactString,
    pub status: ContractStatus,
    pub revision_number: u64,
    pub proof_confirmed: bool,
    pub negotiation_timestamp: DateTime<Utc>,
    pub expiration_timestamp: DateTime<Utc>,
    pub proof_deadline_timestamp: DateTime<Utc>,
    pub proof_timestamp: Option<DateTime<Utc>>,
    pub locked_collateral: Currency,
    pub payout: Currency,
    pub missed_payout: Currency,
    pub potential_revenue: Currency,
    pub earned_revenue: BigNumber,
    pub lost_revenue: Currency,
    pub burnt_collateral: Currency,
}

impl ContractRecord {
    /// Classifies an obligation and derives its payout and revenue.
    ///
    /// - succeeded: proof confirmed, or no proof required and expired.
    ///   Payout is the valid output when proven, else the missed output.
    /// - failed: unproven and past the proof deadline. Payout is the missed
    ///   output; collateral not returned by it is burnt.
    /// - unresolved: everything else. Payout is the valid output.
    pub fn classify<F>(ob: &Obligation, chain: &ChainContext, block_time: F) -> Self
    where
        F: Fn(u64) -> Option<DateTime<Utc>>,
    {
        let mut record = ContractRecord {
            id: ob.id.clone(),
            revision_number: ob.revision_number,
            proof_confirmed: ob.proof_confirmed,
            negotiation_timestamp: chain.timestamp_for(ob.negotiation_height, &block_time),
            expiration_timestamp: chain.timestamp_for(ob.expiration_height, &block_time),
            proof_deadline_timestamp: chain.timestamp_for(ob.proof_deadline, &block_time),
            proof_timestamp: ob
                .proof_height
                .filter(|_| ob.proof_confirmed)
                .map(|h| chain.timestamp_for(h, &block_time)),
            locked_collateral: ob.locked_collateral,
            missed_payout: ob.missed_proof_payout,
            ..ContractRecord::default()
        };

        let proof_required = ob.valid_proof_payout > ob.missed_proof_payout;

        if !ob.formation_confirmed {
            record.status = ContractStatus::Forming;
            record.payout = ob.valid_proof_payout;
        } else if ob.proof_confirmed || (!proof_required && ob.expiration_height < chain.height) {
            record.status = ContractStatus::Succeeded;
            record.payout = if ob.proof_confirmed {
                ob.valid_proof_payout
            } else {
                ob.missed_proof_payout
            };
            record.earned_revenue = BigNumber::from_currency(record.payout)
                .sub_currency(ob.locked_collateral)
                .sub_currency(ob.transaction_fees_added);
        } else if ob.proof_deadline < chain.height {
            record.status = ContractStatus::Failed;
            record.payout = ob.missed_proof_payout;
            record.lost_revenue = ob.valid_proof_payout.saturating_sub(ob.locked_collateral);
            record.earned_revenue = BigNumber::from_currency(ob.missed_proof_payout)
                .sub_currency(ob.locked_collateral)
                .sub_currency(ob.transaction_fees_added);
            record.burnt_collateral = ob.locked_collateral.saturating_sub(ob.missed_proof_payout);
        } else {
            record.status = ContractStatus::Unresolved;
            record.payout = ob.valid_proof_payout;
            record.potential_revenue = ob.valid_proof_payout.saturating_sub(ob.locked_collateral);
        }

        record
    }

    /// Bucket time of the terminal event
    pub fn resolution_timestamp(&self) -> DateTime<Utc> {
        match self.status {
            ContractStatus::Succeeded if self.proof_confirmed => self
                .proof_timestamp
                .unwrap_or(self.expiration_timestamp),
            ContractStatus::Succeeded | ContractStatus::Failed => self.proof_deadline_timestamp,
            ContractStatus::Unresolved | ContractStatus::Forming => self.expiration_timestamp,
        }
    }
}

// ============================================================================
// SECTION 8: PERSISTENCE LAYER
// ============================================================================
// One sled database, three trees:
//
//   host_meta        BucketKey -> Metadata (JSON), overwritten per hour
//   host_snapshots   BucketKey -> Snapshot (JSON), field-merged per hour
//   contract_events  contract id -> Vec<Snapshot> last applied contribution
//
// Keys are big-endian so sled's ordered iteration is chronological.
// ============================================================================

// ----------------------------------------------------------------------------
// 8.1 Record Encoding
// ----------------------------------------------------------------------------

fn encode_record<T: Serialize>(record: &T) -> StoreResult<Vec<u8>> {
    serde_json::to_vec(record).map_err(|e| StoreError::Encode {
        message: e.to_string(),
    })
}

fn describe_key(key: &[u8]) -> String {
    match BucketKey::from_bytes(key) {
        Some(bucket) => bucket.to_string(),
        None => String::from_utf8_lossy(key).into_owned(),
    }
}

fn decode_record<T: DeserializeOwned>(key: &[u8], value: &[u8]) -> StoreResult<T> {
    serde_json::from_slice(value).map_err(|e| StoreError::Decode {
        key: describe_key(key),
        message: e.to_string(),
    })
}

fn check_range(start: DateTime<Utc>, end: DateTime<Utc>) -> StoreResult<()> {
    if start > end {
        return Err(StoreError::InvalidTimeRange { start, end });
    }
    Ok(())
}

/// Decodes `value`, applying `policy` when it is corrupt. `Ok(None)` means
/// the record was skipped.
fn decode_with_policy<T: DeserializeOwned>(
    tree: &'static str,
    key: &[u8],
    value: &[u8],
    policy: CorruptRecordPolicy,
) -> StoreResult<Option<T>> {
    match decode_record(key, value) {
        Ok(record) => Ok(Some(record)),
        Err(e) => match policy {
            CorruptRecordPolicy::Abort => Err(e),
            CorruptRecordPolicy::Skip => {
                warn!(
                    target: "hoststats::store",
                    tree,
                    key = %describe_key(key),
                    error = %e,
                    "Skipping corrupt record"
                );
                Ok(None)
            }
        },
    }
}

/// Collects every decodable record of an ordered scan
fn collect_records<T, I>(tree: &'static str, iter: I, policy: CorruptRecordPolicy) -> StoreResult<Vec<T>>
where
    T: DeserializeOwned,
    I: Iterator<Item = sled::Result<(IVec, IVec)>>,
{
    let mut records = Vec::new();
    for entry in iter {
        let (key, value) = entry?;
        if let Some(record) = decode_with_policy(tree, &key, &value, policy)? {
            records.push(record);
        }
    }
    Ok(records)
}

/// First decodable record of an ordered scan
fn first_record<T, I>(tree: &'static str, iter: I, policy: CorruptRecordPolicy) -> StoreResult<Option<T>>
where
    T: DeserializeOwned,
    I: Iterator<Item = sled::Result<(IVec, IVec)>>,
{
    for entry in iter {
        let (key, value) = entry?;
        if let Some(record) = decode_with_policy(tree, &key, &value, policy)? {
            return Ok(Some(record));
        }
    }
    Ok(None)
}

fn abort<T>(result: StoreResult<T>) -> ConflictableTransactionResult<T, StoreError> {
    result.map_err(ConflictableTransactionError::Abort)
}

// ----------------------------------------------------------------------------
// 8.2 Ledger Database
// ----------------------------------------------------------------------------

/// Owner of the sled database and its trees
#[derive(Debug, Clone)]
pub struct LedgerDb {
    db: sled::Db,
    pub meta: MetadataStore,
    pub snapshots: SnapshotStore,
}

impl LedgerDb {
    /// Open (or create) the database at `path`
    pub fn open<P: AsRef<Path>>(path: P, config: &StorageConfig) -> StoreResult<Self> {
        let path = path.as_ref();
        let db = sled::Config::new()
            .path(path)
            .flush_every_ms(config.flush_every_ms)
            .open()?;
        info!(
            target: "hoststats::store",
            path = %path.display(),
            recovered = db.was_recovered(),
            "Database opened"
        );
        Self::from_db(db, config.corrupt_records)
    }

    /// In-memory database removed on drop
    pub fn temporary(policy: CorruptRecordPolicy) -> StoreResult<Self> {
        let db = sled::Config::new().temporary(true).open()?;
        Self::from_db(db, policy)
    }

    fn from_db(db: sled::Db, policy: CorruptRecordPolicy) -> StoreResult<Self> {
        let meta = MetadataStore {
            tree: db.open_tree(METADATA_TREE)?,
            policy,
        };
        let snapshots = SnapshotStore {
            tree: db.open_tree(SNAPSHOT_TREE)?,
            events: db.open_tree(CONTRACT_EVENTS_TREE)?,
            policy,
        };
        Ok(Self {
            db,
            meta,
            snapshots,
        })
    }

    /// Flush dirty pages to disk
    pub async fn flush(&self) -> StoreResult<usize> {
        Ok(self.db.flush_async().await?)
    }

    pub fn size_on_disk(&self) -> StoreResult<u64> {
        Ok(self.db.size_on_disk()?)
    }
}

// ----------------------------------------------------------------------------
// 8.3 Metadata Store
// ----------------------------------------------------------------------------

/// One absolute record per hour; a save replaces the whole bucket
#[derive(Debug, Clone)]
pub struct MetadataStore {
    tree: sled::Tree,
    policy: CorruptRecordPolicy,
}

impl MetadataStore {
    /// Stores `meta` in the bucket of its timestamp, replacing what was there
    pub fn save(&self, meta: &Metadata) -> StoreResult<()> {
        let mut record = meta.clone();
        record.timestamp = truncate_to_hour(meta.timestamp);
        self.tree
            .insert(BucketKey::encode(record.timestamp), encode_record(&record)?)?;
        Ok(())
    }

    pub fn get(&self, ts: DateTime<Utc>) -> StoreResult<Option<Metadata>> {
        let key = BucketKey::encode(ts);
        match self.tree.get(key)? {
            Some(value) => decode_record(key.as_ref(), &value).map(Some),
            None => Ok(None),
        }
    }

    /// Records with `start <= bucket <= end`, oldest first
    pub fn get_range(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> StoreResult<Vec<Metadata>> {
        check_range(start, end)?;
        collect_records(
            METADATA_TREE,
            self.tree.range(BucketKey::encode(start)..=BucketKey::encode(end)),
            self.policy,
        )
    }

    /// Most recent record, or a zero record when the store is empty
    pub fn get_last(&self) -> StoreResult<Metadata> {
        Ok(first_record(METADATA_TREE, self.tree.iter().rev(), self.policy)?.unwrap_or_default())
    }

    /// First record at or after the bucket of `ts`, or a zero record
    pub fn get_closest(&self, ts: DateTime<Utc>) -> StoreResult<Metadata> {
        Ok(
            first_record(METADATA_TREE, self.tree.range(BucketKey::encode(ts)..), self.policy)?
                .unwrap_or_default(),
        )
    }

    /// Bytes transferred over the trailing `window`: latest cumulative totals
    /// minus the totals at the start of the window.
    pub fn bandwidth_usage(&self, now: DateTime<Utc>, window: ChronoDuration) -> StoreResult<BandwidthReading> {
        let last = self.get_last()?;
        let start = now.checked_sub_signed(window).unwrap_or(now);
        let first = self.get_closest(start)?;
        Ok(BandwidthReading {
            upload: last.upload_bandwidth.saturating_sub(first.upload_bandwidth),
            download: last.download_bandwidth.saturating_sub(first.download_bandwidth),
        })
    }

    pub fn len(&self) -> usize {
        self.tree.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tree.is_empty()
    }
}

// ----------------------------------------------------------------------------
// 8.4 Snapshot Store
// ----------------------------------------------------------------------------

/// Per-contract additive contributions plus the gauge for every bucket the
/// batch touches. Built by [`ContributionBatch::from_records`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ContributionBatch {
    pub gauges: BTreeMap<BucketId, u64>,
    pub contracts: Vec<(CompactString, Vec<Snapshot>)>,
}

/// Outcome of [`SnapshotStore::apply_contributions`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ApplyStats {
    pub applied: usize,
    pub unchanged: usize,
    pub gauges: usize,
}

/// Day, month and year roll-ups around a date
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeriodTotals {
    pub day: Snapshot,
    pub month: Snapshot,
    pub year: Snapshot,
}

/// One delta record per hour; saves merge field by field
#[derive(Debug, Clone)]
pub struct SnapshotStore {
    tree: sled::Tree,
    events: sled::Tree,
    policy: CorruptRecordPolicy,
}

impl SnapshotStore {
    /// Merges every snapshot into its hour bucket in one transaction.
    ///
    /// Additive fields are summed into the stored record and the
    /// `active_contracts` gauge is replaced. Nothing is written if any
    /// merge fails.
    pub fn save(&self, snapshots: &[Snapshot]) -> StoreResult<()> {
        let policy = self.policy;
        self.tree
            .transaction(|tx| -> ConflictableTransactionResult<(), StoreError> {
                for snapshot in snapshots {
                    update_bucket(tx, snapshot.timestamp, policy, |stored| stored.merge(snapshot))?;
                }
                Ok(())
            })
            .map_err(StoreError::from)
    }

    pub fn get(&self, ts: DateTime<Utc>) -> StoreResult<Option<Snapshot>> {
        let key = BucketKey::encode(ts);
        match self.tree.get(key)? {
            Some(value) => decode_record(key.as_ref(), &value).map(Some),
            None => Ok(None),
        }
    }

    /// Hourly records with `start <= bucket <= end`, oldest first
    pub fn get_range(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> StoreResult<Vec<Snapshot>> {
        check_range(start, end)?;
        collect_records(
            SNAPSHOT_TREE,
            self.tree.range(BucketKey::encode(start)..=BucketKey::encode(end)),
            self.policy,
        )
    }

    /// One record per UTC calendar day from the day of `start` through the
    /// day of `end`.
    ///
    /// Additive fields are summed over the day's hours. `active_contracts`
    /// is the last value observed up to the end of the day, carried over
    /// days without records.
    pub fn get_daily(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> StoreResult<Vec<Snapshot>> {
        check_range(start, end)?;
        let first_day = truncate_to_day(start);
        let last_day = truncate_to_day(end);

        let mut periods = Vec::new();
        let mut day = first_day;
        while day <= last_day {
            let next = day + ChronoDuration::days(1);
            periods.push((day, next));
            day = next;
        }

        let hourly = self.get_range(first_day, last_day + ChronoDuration::hours(23))?;
        let seed = self.gauge_before(first_day)?;
        Ok(rollup_periods(&periods, &hourly, seed))
    }

    /// Roll-ups for the calendar day, month and year containing `date`
    pub fn get_totals(&self, date: DateTime<Utc>) -> StoreResult<PeriodTotals> {
        let invalid = || StoreError::InvalidTimeRange {
            start: date,
            end: date,
        };
        let year_start = Utc
            .with_ymd_and_hms(date.year(), 1, 1, 0, 0, 0)
            .single()
            .ok_or_else(invalid)?;
        let year_end = Utc
            .with_ymd_and_hms(date.year() + 1, 1, 1, 0, 0, 0)
            .single()
            .ok_or_else(invalid)?;
        let month_start = Utc
            .with_ymd_and_hms(date.year(), date.month(), 1, 0, 0, 0)
            .single()
            .ok_or_else(invalid)?;
        let (next_year, next_month) = if date.month() == 12 {
            (date.year() + 1, 1)
        } else {
            (date.year(), date.month() + 1)
        };
        let month_end = Utc
            .with_ymd_and_hms(next_year, next_month, 1, 0, 0, 0)
            .single()
            .ok_or_else(invalid)?;
        let day_start = truncate_to_day(date);
        let day_end = day_start + ChronoDuration::days(1);

        let hourly = self.get_range(year_start, year_end - ChronoDuration::hours(1))?;
        let seed = self.gauge_before(year_start)?;
        let rolled = rollup_periods(
            &[(day_start, day_end), (month_start, month_end), (year_start, year_end)],
            &hourly,
            seed,
        );

        let mut rolled = rolled.into_iter();
        Ok(PeriodTotals {
            day: rolled.next().unwrap_or_default(),
            month: rolled.next().unwrap_or_default(),
            year: rolled.next().unwrap_or_default(),
        })
    }

    /// Gauge of the latest record strictly before `ts`, zero when none
    fn gauge_before(&self, ts: DateTime<Utc>) -> StoreResult<u64> {
        let previous: Option<Snapshot> = first_record(
            SNAPSHOT_TREE,
            self.tree.range(..BucketKey::encode(ts)).rev(),
            self.policy,
        )?;
        Ok(previous.map(|s| s.active_contracts).unwrap_or(0))
    }

    /// Applies a contract batch so that re-running it is a no-op.
    ///
    /// Each contract's additive contribution is recorded in the events tree.
    /// An identical contribution is skipped; a changed one first retracts
    /// what was applied before. Gauges are overwritten for every touched
    /// bucket. Both trees commit in a single transaction.
    pub fn apply_contributions(&self, batch: &ContributionBatch) -> StoreResult<ApplyStats> {
        let policy = self.policy;
        (&self.tree, &self.events)
            .transaction(|(snapshots, events)| -> ConflictableTransactionResult<ApplyStats, StoreError> {
                let mut stats = ApplyStats::default();

                for (id, contribution) in &batch.contracts {
                    let previous: Vec<Snapshot> = match events.get(id.as_bytes())? {
                        Some(raw) => match decode_record(id.as_bytes(), &raw) {
                            Ok(previous) => previous,
                            Err(e) if policy == CorruptRecordPolicy::Skip => {
                                warn!(
                                    target: "hoststats::store",
                                    contract = %id,
                                    error = %e,
                                    "Discarding corrupt contract ledger entry"
                                );
                                Vec::new()
                            }
                            Err(e) => return Err(ConflictableTransactionError::Abort(e)),
                        },
                        None => Vec::new(),
                    };

                    if previous == *contribution {
                        stats.unchanged += 1;
                        continue;
                    }

                    for old in &previous {
                        update_bucket(snapshots, old.timestamp, policy, |stored| stored.retract(old))?;
                    }
                    for new in contribution {
                        update_bucket(snapshots, new.timestamp, policy, |stored| stored.accumulate(new))?;
                    }
                    events.insert(id.as_bytes(), abort(encode_record(contribution))?)?;
                    stats.applied += 1;
                }

                for (bucket, active) in &batch.gauges {
                    update_bucket(snapshots, bucket.timestamp(), policy, |stored| {
                        stored.active_contracts = *active
                    })?;
                    stats.gauges += 1;
                }

                Ok(stats)
            })
            .map_err(StoreError::from)
    }

    /// Contribution last applied for a contract, if any
    pub fn applied_contribution(&self, id: &str) -> StoreResult<Option<Vec<Snapshot>>> {
        match self.events.get(id.as_bytes())? {
            Some(raw) => decode_record(id.as_bytes(), &raw).map(Some),
            None => Ok(None),
        }
    }

    pub fn len(&self) -> usize {
        self.tree.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tree.is_empty()
    }
}

/// Read-modify-write of one hour bucket inside a transaction
fn update_bucket<F>(
    tx: &TransactionalTree,
    ts: DateTime<Utc>,
    policy: CorruptRecordPolicy,
    update: F,
) -> ConflictableTransactionResult<(), StoreError>
where
    F: FnOnce(&mut Snapshot),
{
    let bucket = truncate_to_hour(ts);
    let key = BucketKey::encode(bucket);

    let mut stored = match tx.get(key)? {
        Some(raw) => match decode_record::<Snapshot>(key.as_ref(), &raw) {
            Ok(stored) => stored,
            Err(e) if policy == CorruptRecordPolicy::Skip => {
                warn!(
                    target: "hoststats::store",
                    key = %key,
                    error = %e,
                    "Replacing corrupt snapshot"
                );
                Snapshot::at(bucket)
            }
            Err(e) => return Err(ConflictableTransactionError::Abort(e)),
        },
        None => Snapshot::at(bucket),
    };

    update(&mut stored);
    stored.timestamp = bucket;
    tx.insert(key, abort(encode_record(&stored))?)?;
    Ok(())
}

/// Rolls hourly snapshots (oldest first) up into `[from, to)` periods.
///
/// The gauge of a period is the last hourly value before `to`, falling back
/// to `seed` when nothing precedes it.
fn rollup_periods(
    periods: &[(DateTime<Utc>, DateTime<Utc>)],
    hourly: &[Snapshot],
    seed: u64,
) -> Vec<Snapshot> {
    periods
        .iter()
        .map(|&(from, to)| {
            let lo = hourly.partition_point(|s| s.timestamp < from);
            let hi = hourly.partition_point(|s| s.timestamp < to);

            let mut period = Snapshot::at(from);
            for hour in &hourly[lo..hi.max(lo)] {
                period.accumulate(hour);
            }
            period.active_contracts = match hi.checked_sub(1) {
                Some(last) => hourly[last].active_contracts,
                None => seed,
            };
            period
        })
        .collect()
}

// ============================================================================
// SECTION 9: EVENT AGGREGATION
// ============================================================================
// Pure functions from classified contracts to hour-bucket deltas.
//
// Per contract, in order:
//   1. presence    active_contracts += 1 for each hour in [negotiation, deadline)
//   2. terminal    exactly one of
//        succeeded   +1 successful, earned, payout at the resolution hour
//        failed      +1 failed, earned, payout, burnt at the proof deadline
//        unresolved  +1 expired, potential, active_contracts -= 1 at expiration
//   3. formation   +1 new at the negotiation hour
// Contracts still forming contribute nothing.
// ============================================================================

// ----------------------------------------------------------------------------
// 9.1 Per-Contract Contribution
// ----------------------------------------------------------------------------

/// What one contract adds to the timeline
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContractContribution {
    /// Signed gauge deltas
    pub gauge: BTreeMap<BucketId, i64>,
    /// Additive fields only; `active_contracts` is always zero here
    pub additive: BTreeMap<BucketId, Snapshot>,
}

impl ContractContribution {
    fn additive_at(&mut self, ts: DateTime<Utc>) -> &mut Snapshot {
        let bucket = BucketId::from_timestamp(ts);
        self.additive
            .entry(bucket)
            .or_insert_with(|| Snapshot::at(bucket.timestamp()))
    }

    fn gauge_at(&mut self, ts: DateTime<Utc>) -> &mut i64 {
        self.gauge.entry(BucketId::from_timestamp(ts)).or_default()
    }
}

/// Splits one contract into gauge deltas and additive deltas.
/// Returns `None` for contracts whose formation is unconfirmed.
pub fn contract_contribution(record: &ContractRecord) -> Option<ContractContribution> {
    if record.status == ContractStatus::Forming {
        return None;
    }

    let mut contribution = ContractContribution::default();

    let mut bucket = BucketId::from_timestamp(record.negotiation_timestamp);
    let deadline = BucketId::from_timestamp(record.proof_deadline_timestamp);
    while bucket < deadline {
        *contribution.gauge.entry(bucket).or_default() += 1;
        bucket = bucket.next();
    }

    match record.status {
        ContractStatus::Succeeded => {
            let delta = contribution.additive_at(record.resolution_timestamp());
            delta.successful_contracts += 1;
            delta.earned_revenue = delta.earned_revenue.add(&record.earned_revenue);
            delta.payout += record.payout;
        }
        ContractStatus::Failed => {
            let delta = contribution.additive_at(record.proof_deadline_timestamp);
            delta.failed_contracts += 1;
            delta.earned_revenue = delta.earned_revenue.add(&record.earned_revenue);
            delta.payout += record.payout;
            delta.burnt_collateral += record
                .locked_collateral
                .saturating_sub(record.missed_payout);
        }
        ContractStatus::Unresolved => {
            let delta = contribution.additive_at(record.expiration_timestamp);
            delta.expired_contracts += 1;
            delta.potential_revenue += record.potential_revenue;
            *contribution.gauge_at(record.expiration_timestamp) -= 1;
        }
        ContractStatus::Forming => {}
    }

    contribution
        .additive_at(record.negotiation_timestamp)
        .new_contracts += 1;

    Some(contribution)
}

fn clamp_gauge(value: i64) -> u64 {
    u64::try_from(value).unwrap_or(0)
}

// ----------------------------------------------------------------------------
// 9.2 Batch Aggregation
// ----------------------------------------------------------------------------

/// Folds a contract batch into one snapshot per touched hour, sorted by
/// bucket.
///
/// The gauge of each bucket is the full count over the batch, so a save
/// replaces rather than accumulates it.
pub fn aggregate(records: &[ContractRecord]) -> BTreeMap<BucketId, Snapshot> {
    let mut gauges: BTreeMap<BucketId, i64> = BTreeMap::new();
    let mut buckets: BTreeMap<BucketId, Snapshot> = BTreeMap::new();

    for contribution in records.iter().filter_map(contract_contribution) {
        for (bucket, delta) in contribution.gauge {
            *gauges.entry(bucket).or_default() += delta;
        }
        for (bucket, delta) in contribution.additive {
            buckets
                .entry(bucket)
                .or_insert_with(|| Snapshot::at(bucket.timestamp()))
                .accumulate(&delta);
        }
    }

    for (bucket, active) in gauges {
        buckets
            .entry(bucket)
            .or_insert_with(|| Snapshot::at(bucket.timestamp()))
            .active_contracts = clamp_gauge(active);
    }

    buckets
}

impl ContributionBatch {
    /// Per-contract form of [`aggregate`] for deduplicated application.
    ///
    /// Every bucket that would appear in `aggregate(records)` gets a gauge
    /// entry, zero included.
    pub fn from_records(records: &[ContractRecord]) -> Self {
        let mut gauges: BTreeMap<BucketId, i64> = BTreeMap::new();
        let mut contracts = Vec::new();

        for record in records {
            let Some(contribution) = contract_contribution(record) else {
                continue;
            };
            for (bucket, delta) in &contribution.gauge {
                *gauges.entry(*bucket).or_default() += delta;
            }
            for bucket in contribution.additive.keys() {
                gauges.entry(*bucket).or_default();
            }
            contracts.push((
                record.id.clone(),
                contribution.additive.into_values().collect(),
            ));
        }

        Self {
            gauges: gauges
                .into_iter()
                .map(|(bucket, active)| (bucket, clamp_gauge(active)))
                .collect(),
            contracts,
        }
    }
}

// ============================================================================
// SECTION 10: BANDWIDTH COUNTER
// ============================================================================

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct BandwidthState {
    primed: bool,
    last_upload: u64,
    last_download: u64,
    total_upload: u64,
    total_download: u64,
}

/// Turns the host's restart-volatile byte counters into monotonic totals.
///
/// A reading below the previous one means the host restarted; it adds
/// nothing and becomes the new baseline. The very first reading after
/// construction only establishes the baseline.
#[derive(Debug, Default)]
pub struct BandwidthCounter {
    state: Mutex<BandwidthState>,
}

impl BandwidthCounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Totals from the last persisted metadata, baseline from a fresh reading
    pub fn initialize(&self, last: &Metadata, raw: BandwidthReading) {
        *self.state.lock() = BandwidthState {
            primed: true,
            last_upload: raw.upload,
            last_download: raw.download,
            total_upload: last.upload_bandwidth,
            total_download: last.download_bandwidth,
        };
    }

    /// Totals only; the next observation sets the baseline
    pub fn seed_totals(&self, last: &Metadata) {
        let mut state = self.state.lock();
        state.total_upload = last.upload_bandwidth;
        state.total_download = last.download_bandwidth;
    }

    /// Folds in a raw reading and returns the updated totals
    pub fn observe(&self, raw: BandwidthReading) -> BandwidthReading {
        let mut state = self.state.lock();
        if state.primed {
            let up = raw.upload.saturating_sub(state.last_upload);
            let down = raw.download.saturating_sub(state.last_download);
            state.total_upload = state.total_upload.saturating_add(up);
            state.total_download = state.total_download.saturating_add(down);
        }
        state.primed = true;
        state.last_upload = raw.upload;
        state.last_download = raw.download;
        BandwidthReading {
            upload: state.total_upload,
            download: state.total_download,
        }
    }

    pub fn totals(&self) -> BandwidthReading {
        let state = self.state.lock();
        BandwidthReading {
            upload: state.total_upload,
            download: state.total_download,
        }
    }
}

// ============================================================================
// SECTION 11: ALERTS & STATUS
// ============================================================================

// ----------------------------------------------------------------------------
// 11.1 Alert Cache
// ----------------------------------------------------------------------------

/// Active alerts grouped by identity.
///
/// Checks clear their identities and then set whatever is still wrong, so a
/// resolved condition disappears on the next successful cycle.
#[derive(Debug, Default)]
pub struct AlertCache {
    alerts: RwLock<HashMap<AlertId, Vec<HostAlert>>>,
}

impl AlertCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, id: AlertId, alert: HostAlert) {
        self.alerts.write().entry(id).or_default().push(alert);
    }

    /// Removes the given identities, or every alert when `ids` is empty
    pub fn clear(&self, ids: &[AlertId]) {
        let mut alerts = self.alerts.write();
        if ids.is_empty() {
            alerts.clear();
            return;
        }
        for id in ids {
            alerts.remove(id);
        }
    }

    /// All active alerts, grouped by identity
    pub fn list(&self) -> Vec<HostAlert> {
        let alerts = self.alerts.read();
        let mut ids: Vec<&AlertId> = alerts.keys().collect();
        ids.sort();
        ids.into_iter()
            .flat_map(|id| alerts[id].iter().cloned())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.alerts.read().values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// ----------------------------------------------------------------------------
// 11.2 Status Cache
// ----------------------------------------------------------------------------

#[derive(Debug, Default)]
pub struct StatusCache {
    status: RwLock<HostStatus>,
}

impl StatusCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self) -> HostStatus {
        self.status.read().clone()
    }

    /// Runs `f` under the write lock, so a read-modify-write of the status
    /// cannot interleave with another writer.
    pub fn update<R, F: FnOnce(&mut HostStatus) -> R>(&self, f: F) -> R {
        f(&mut self.status.write())
    }
}

// ----------------------------------------------------------------------------
// 11.3 Alert Checks
// ----------------------------------------------------------------------------

/// `value` as a whole percentage of `total`, capped at 100.
/// A zero total reads as 0% when nothing is used and 100% otherwise.
pub fn calc_percentage(value: u128, total: u128) -> u128 {
    if total == 0 {
        return if value == 0 { 0 } else { 100 };
    }
    if value >= total {
        return 100;
    }
    value.saturating_mul(100) / total
}

fn utilization_severity(pct: u128) -> Option<AlertSeverity> {
    if pct >= SEVERE_UTILIZATION_PCT {
        Some(AlertSeverity::Severe)
    } else if pct >= WARNING_UTILIZATION_PCT {
        Some(AlertSeverity::Warning)
    } else {
        None
    }
}

/// Folder failures and overall storage utilization
pub fn storage_alerts(folders: &[StorageFolder]) -> Vec<(AlertId, HostAlert)> {
    let mut alerts = Vec::new();

    for folder in folders {
        let failures = match (folder.failed_reads > 0, folder.failed_writes > 0) {
            (true, true) => "read and write errors",
            (false, true) => "write errors",
            (true, false) => "read errors",
            (false, false) => continue,
        };
        alerts.push((
            AlertId::FolderError,
            HostAlert::severe(
                "storage",
                format!("storage folder {} has {}", folder.path, failures),
            ),
        ));
    }

    let capacity: u64 = folders.iter().map(|f| f.capacity).sum();
    let remaining: u64 = folders.iter().map(|f| f.capacity_remaining).sum();
    if capacity == 0 {
        alerts.push((
            AlertId::StorageUtilization,
            HostAlert::severe("storage", "host has no storage configured"),
        ));
        return alerts;
    }

    let used = capacity.saturating_sub(remaining);
    let pct = calc_percentage(u128::from(used), u128::from(capacity));
    if let Some(severity) = utilization_severity(pct) {
        alerts.push((
            AlertId::StorageUtilization,
            HostAlert::new("storage", format!("storage is {}% full", pct), severity),
        ));
    }

    alerts
}

/// Locked wallet and empty balance
pub fn wallet_alerts(wallet: &WalletInfo) -> Vec<(AlertId, HostAlert)> {
    let mut alerts = Vec::new();
    if !wallet.unlocked {
        alerts.push((
            AlertId::WalletLocked,
            HostAlert::severe("wallet", "wallet is locked, the host cannot form contracts"),
        ));
    }
    if wallet.confirmed_balance.is_zero() {
        alerts.push((
            AlertId::WalletBalance,
            HostAlert::severe("wallet", "wallet balance is zero"),
        ));
    }
    alerts
}

/// Share of the collateral budget currently locked in contracts
pub fn collateral_alerts(host: &HostInfo) -> Vec<(AlertId, HostAlert)> {
    let pct = calc_percentage(
        host.locked_collateral.hastings(),
        host.collateral_budget.hastings(),
    );
    utilization_severity(pct)
        .map(|severity| {
            vec![(
                AlertId::CollateralBudget,
                HostAlert::new(
                    "contracts",
                    format!("{}% of the collateral budget is locked", pct),
                    severity,
                ),
            )]
        })
        .unwrap_or_default()
}

// ----------------------------------------------------------------------------
// 11.4 Metadata Assembly
// ----------------------------------------------------------------------------

/// Absolute host state for the current hour.
///
/// Every classified contract counts toward payout. Resolved contracts add
/// earned revenue and burnt collateral; unresolved ones count as active and
/// toward potential revenue.
pub fn assemble_metadata(
    records: &[ContractRecord],
    host: &HostInfo,
    bandwidth: BandwidthReading,
    first_seen: DateTime<Utc>,
    now: DateTime<Utc>,
) -> Metadata {
    let mut meta = Metadata {
        used_storage: host.total_storage.saturating_sub(host.remaining_storage),
        total_storage: host.total_storage,
        upload_bandwidth: bandwidth.upload,
        download_bandwidth: bandwidth.download,
        settings: host.settings.clone(),
        first_seen,
        timestamp: truncate_to_hour(now),
        ..Metadata::default()
    };

    for record in records {
        if record.status == ContractStatus::Forming {
            continue;
        }
        meta.payout += record.payout;
        match record.status {
            ContractStatus::Unresolved => {
                meta.active_contracts += 1;
                meta.potential_revenue += record.potential_revenue;
                continue;
            }
            ContractStatus::Succeeded => meta.successful_contracts += 1,
            ContractStatus::Failed => meta.failed_contracts += 1,
            ContractStatus::Forming => {}
        }
        meta.earned_revenue = meta.earned_revenue.add(&record.earned_revenue);
        meta.burnt_collateral += record.burnt_collateral;
    }

    meta
}

/// Host first-seen time: reported, else previously stored, else the
/// earliest negotiation among `records`, else `now`.
pub fn resolve_first_seen(
    reported: Option<DateTime<Utc>>,
    previous: &Metadata,
    records: &[ContractRecord],
    now: DateTime<Utc>,
) -> DateTime<Utc> {
    reported
        .or_else(|| (previous.first_seen.timestamp() > 0).then_some(previous.first_seen))
        .or_else(|| {
            records
                .iter()
                .filter(|r| r.status != ContractStatus::Forming)
                .map(|r| r.negotiation_timestamp)
                .min()
        })
        .unwrap_or(now)
}

// ----------------------------------------------------------------------------
// 11.5 Host Ledger - Query Surface
// ----------------------------------------------------------------------------

/// Everything a reader needs: the stores plus the live caches
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TotalsReport {
    pub day: Snapshot,
    pub month: Snapshot,
    pub year: Snapshot,
    /// Latest absolute state
    pub total: Metadata,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusReport {
    #[serde(flatten)]
    pub status: HostStatus,
    /// Bytes moved inside the bandwidth window
    pub bandwidth_usage: BandwidthReading,
    pub alerts: Vec<HostAlert>,
}

/// Shared handle over the database and in-memory host state.
///
/// Cloning is cheap; every sync task and reader holds its own clone.
#[derive(Debug, Clone)]
pub struct HostLedger {
    db: Arc<LedgerDb>,
    alerts: Arc<AlertCache>,
    status: Arc<StatusCache>,
    bandwidth: Arc<BandwidthCounter>,
    bandwidth_window: ChronoDuration,
}

impl HostLedger {
    pub fn new(db: LedgerDb, bandwidth_window: ChronoDuration) -> Self {
        Self {
            db: Arc::new(db),
            alerts: Arc::new(AlertCache::new()),
            status: Arc::new(StatusCache::new()),
            bandwidth: Arc::new(BandwidthCounter::new()),
            bandwidth_window,
        }
    }

    pub fn db(&self) -> &LedgerDb {
        &self.db
    }

    pub fn alert_cache(&self) -> &AlertCache {
        &self.alerts
    }

    pub fn status_cache(&self) -> &StatusCache {
        &self.status
    }

    pub fn bandwidth_counter(&self) -> &BandwidthCounter {
        &self.bandwidth
    }

    pub fn metadata_range(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> StoreResult<Vec<Metadata>> {
        self.db.meta.get_range(start, end)
    }

    pub fn last_metadata(&self) -> StoreResult<Metadata> {
        self.db.meta.get_last()
    }

    pub fn closest_metadata(&self, ts: DateTime<Utc>) -> StoreResult<Metadata> {
        self.db.meta.get_closest(ts)
    }

    pub fn snapshot_range(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> StoreResult<Vec<Snapshot>> {
        self.db.snapshots.get_range(start, end)
    }

    pub fn daily_snapshots(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> StoreResult<Vec<Snapshot>> {
        self.db.snapshots.get_daily(start, end)
    }

    pub fn totals(&self, date: DateTime<Utc>) -> StoreResult<TotalsReport> {
        let PeriodTotals { day, month, year } = self.db.snapshots.get_totals(date)?;
        Ok(TotalsReport {
            day,
            month,
            year,
            total: self.db.meta.get_last()?,
        })
    }

    pub fn alerts(&self) -> Vec<HostAlert> {
        self.alerts.list()
    }

    /// Cached status with the contract figures of the last persisted record
    pub fn status(&self, now: DateTime<Utc>) -> StoreResult<StatusReport> {
        let mut status = self.status.get();
        let last = self.db.meta.get_last()?;
        status.meta = status.meta.with_contract_figures(&last);
        Ok(StatusReport {
            status,
            bandwidth_usage: self.db.meta.bandwidth_usage(now, self.bandwidth_window)?,
            alerts: self.alerts.list(),
        })
    }
}

// ============================================================================
// SECTION 12: HOST SOURCE
// ============================================================================
// Everything the engine knows about the host comes through this trait. The
// HTTP implementation talks to the host daemon's JSON API; tests use a
// scripted in-memory source.
// ============================================================================

// ----------------------------------------------------------------------------
// 12.1 Host Source Trait
// ----------------------------------------------------------------------------

#[async_trait]
pub trait HostSource: Send + Sync {
    /// Short name for logs
    fn name(&self) -> &str;

    /// Current block height
    async fn consensus_height(&self) -> SourceResult<u64>;

    /// Every storage obligation the host knows about
    async fn obligations(&self) -> SourceResult<Vec<Obligation>>;

    /// Timestamp of the block at `height`; `MissingBlock` when unknown
    async fn block_timestamp(&self, height: u64) -> SourceResult<DateTime<Utc>>;

    async fn host(&self) -> SourceResult<HostInfo>;

    async fn storage_folders(&self) -> SourceResult<Vec<StorageFolder>>;

    async fn wallet(&self) -> SourceResult<WalletInfo>;

    /// Raw cumulative byte counters; they reset when the host restarts
    async fn bandwidth(&self) -> SourceResult<BandwidthReading>;

    /// External reachability check of `net_address`
    async fn connectivity(&self, net_address: &str) -> SourceResult<ConnectivityReport>;
}

// ----------------------------------------------------------------------------
// 12.2 HTTP Host Source
// ----------------------------------------------------------------------------

#[derive(Deserialize)]
struct ConsensusResponse {
    height: u64,
}

#[derive(Deserialize)]
struct ObligationsResponse {
    #[serde(default)]
    contracts: Vec<Obligation>,
}

#[derive(Deserialize)]
struct BlockResponse {
    #[serde(with = "chrono::serde::ts_seconds")]
    timestamp: DateTime<Utc>,
}

#[derive(Deserialize)]
struct StorageResponse {
    #[serde(default)]
    folders: Vec<StorageFolder>,
}

/// Host daemon client
pub struct HttpHostSource {
    client: HttpClient,
    base_url: String,
    connectivity_url: Option<String>,
    api_password: Option<String>,
}

impl HttpHostSource {
    pub fn new(config: &SourceConfig) -> SourceResult<Self> {
        let base_url = config.url.trim_end_matches('/').to_string();
        let client = HttpClient::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .user_agent(config.user_agent.clone())
            .pool_max_idle_per_host(4)
            .build()
            .map_err(|e| SourceError::ConnectionFailed {
                url: base_url.clone(),
                message: e.to_string(),
            })?;

        Ok(Self {
            client,
            base_url,
            connectivity_url: config
                .connectivity_url
                .as_ref()
                .map(|u| u.trim_end_matches('/').to_string()),
            api_password: config.api_password.clone(),
        })
    }

    async fn get_json<T: DeserializeOwned>(&self, url: String) -> SourceResult<T> {
        let mut request = self.client.get(&url);
        if let Some(password) = &self.api_password {
            request = request.basic_auth("", Some(password));
        }

        let response = request
            .send()
            .await
            .map_err(|e| SourceError::ConnectionFailed {
                url: url.clone(),
                message: e.to_string(),
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(SourceError::HttpStatus {
                url,
                status: status.as_u16(),
            });
        }

        response
            .json::<T>()
            .await
            .map_err(|e| SourceError::InvalidResponse {
                url,
                message: e.to_string(),
            })
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }
}

#[async_trait]
impl HostSource for HttpHostSource {
    fn name(&self) -> &str {
        &self.base_url
    }

    async fn consensus_height(&self) -> SourceResult<u64> {
        let consensus: ConsensusResponse = self.get_json(self.endpoint("/consensus")).await?;
        Ok(consensus.height)
    }

    async fn obligations(&self) -> SourceResult<Vec<Obligation>> {
        let response: ObligationsResponse = self.get_json(self.endpoint("/host/contracts")).await?;
        Ok(response.contracts)
    }

    async fn block_timestamp(&self, height: u64) -> SourceResult<DateTime<Utc>> {
        let url = self.endpoint(&format!("/consensus/blocks/{}", height));
        match self.get_json::<BlockResponse>(url).await {
            Ok(block) => Ok(block.timestamp),
            Err(SourceError::HttpStatus { status: 404, .. }) => Err(SourceError::MissingBlock { height }),
            Err(e) => Err(e),
        }
    }

    async fn host(&self) -> SourceResult<HostInfo> {
        self.get_json(self.endpoint("/host")).await
    }

    async fn storage_folders(&self) -> SourceResult<Vec<StorageFolder>> {
        let response: StorageResponse = self.get_json(self.endpoint("/host/storage")).await?;
        Ok(response.folders)
    }

    async fn wallet(&self) -> SourceResult<WalletInfo> {
        self.get_json(self.endpoint("/wallet")).await
    }

    async fn bandwidth(&self) -> SourceResult<BandwidthReading> {
        self.get_json(self.endpoint("/host/bandwidth")).await
    }

    async fn connectivity(&self, net_address: &str) -> SourceResult<ConnectivityReport> {
        match &self.connectivity_url {
            Some(base) => self.get_json(format!("{}/{}", base, net_address)).await,
            None => Ok(ConnectivityReport::unchecked()),
        }
    }
}

// ============================================================================
// SECTION 13: SYNC ENGINE
// ============================================================================
// Three independent periodic tasks share one HostLedger:
//
//   contracts      obligations -> snapshots + contract figures   (10 min)
//   status         host, storage, wallet, bandwidth -> metadata  (10 s)
//   connectivity   external reachability check                   (10 min)
//
// A failed cycle raises a sync alert and retries after a fixed backoff. A
// successful one sleeps to the next wall-clock multiple of its interval.
// ============================================================================

// ----------------------------------------------------------------------------
// 13.1 Contract Resolution
// ----------------------------------------------------------------------------

/// Classifies obligations, resolving block heights to timestamps.
///
/// Block times never change once mined, so they are cached for the life of
/// the process.
#[derive(Debug, Default)]
pub struct ContractResolver {
    block_times: DashMap<u64, DateTime<Utc>>,
}

impl ContractResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cached_blocks(&self) -> usize {
        self.block_times.len()
    }

    pub async fn resolve(
        &self,
        source: &dyn HostSource,
        chain: ChainContext,
        obligations: &[Obligation],
    ) -> SourceResult<Vec<ContractRecord>> {
        let mut missing = BTreeSet::new();
        for ob in obligations {
            let heights = [
                Some(ob.negotiation_height),
                Some(ob.expiration_height),
                Some(ob.proof_deadline),
                ob.proof_height.filter(|_| ob.proof_confirmed),
            ];
            for height in heights.into_iter().flatten() {
                if height <= chain.height && !self.block_times.contains_key(&height) {
                    missing.insert(height);
                }
            }
        }

        if !missing.is_empty() {
            debug!(
                target: "hoststats::sync",
                blocks = missing.len(),
                "Fetching block timestamps"
            );
            let fetched: Vec<(u64, Option<DateTime<Utc>>)> = stream::iter(missing)
                .map(|height| async move {
                    match source.block_timestamp(height).await {
                        Ok(ts) => Ok((height, Some(ts))),
                        Err(SourceError::MissingBlock { .. }) => Ok((height, None)),
                        Err(e) => Err(e),
                    }
                })
                .buffer_unordered(BLOCK_FETCH_CONCURRENCY)
                .try_collect()
                .await?;

            for (height, ts) in fetched {
                if let Some(ts) = ts {
                    self.block_times.insert(height, ts);
                }
            }
        }

        let block_time = |height: u64| self.block_times.get(&height).map(|entry| *entry.value());
        Ok(obligations
            .iter()
            .map(|ob| ContractRecord::classify(ob, &chain, block_time))
            .collect())
    }
}

// ----------------------------------------------------------------------------
// 13.2 Sync Tasks
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum SyncTask {
    Contracts,
    Status,
    Connectivity,
}

impl SyncTask {
    pub const ALL: [SyncTask; 3] = [SyncTask::Contracts, SyncTask::Status, SyncTask::Connectivity];

    pub fn name(self) -> &'static str {
        match self {
            SyncTask::Contracts => "contracts",
            SyncTask::Status => "status",
            SyncTask::Connectivity => "connectivity",
        }
    }

    /// Configured interval in seconds
    pub fn interval_secs(self, config: &SyncConfig) -> u64 {
        match self {
            SyncTask::Contracts => config.contracts_interval_secs,
            SyncTask::Status => config.status_interval_secs,
            SyncTask::Connectivity => config.connectivity_interval_secs,
        }
    }
}

impl Display for SyncTask {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// First multiple of `interval_secs` (since the epoch) strictly after `now`
pub fn next_aligned(now: DateTime<Utc>, interval_secs: u64) -> DateTime<Utc> {
    let step = i64::try_from(interval_secs.max(1)).unwrap_or(i64::MAX);
    let next = now
        .timestamp()
        .div_euclid(step)
        .saturating_add(1)
        .saturating_mul(step);
    unix_to_datetime(next)
}

pub fn until_next_boundary(now: DateTime<Utc>, interval_secs: u64) -> Duration {
    (next_aligned(now, interval_secs) - now)
        .to_std()
        .unwrap_or(Duration::ZERO)
}

// ----------------------------------------------------------------------------
// 13.3 Syncer
// ----------------------------------------------------------------------------

/// Outcome of one contracts cycle
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ContractSyncReport {
    pub contracts: usize,
    pub buckets: usize,
    pub applied: usize,
    pub unchanged: usize,
}

/// Runs individual sync cycles against a host source
#[derive(Clone)]
pub struct Syncer {
    config: Arc<EngineConfig>,
    ledger: HostLedger,
    source: Arc<dyn HostSource>,
    resolver: Arc<ContractResolver>,
}

impl Syncer {
    pub fn new(config: Arc<EngineConfig>, ledger: HostLedger, source: Arc<dyn HostSource>) -> Self {
        Self {
            config,
            ledger,
            source,
            resolver: Arc::new(ContractResolver::new()),
        }
    }

    pub fn ledger(&self) -> &HostLedger {
        &self.ledger
    }

    /// Seeds the caches from the last persisted record.
    ///
    /// Bandwidth totals continue from that record; the baseline comes from
    /// a fresh reading when the host answers, else from the first observation.
    pub async fn initialize(&self) -> StoreResult<()> {
        let last = self.ledger.db.meta.get_last()?;
        self.ledger.status.update(|s| s.meta = last.clone());

        match self.source.bandwidth().await {
            Ok(raw) => self.ledger.bandwidth.initialize(&last, raw),
            Err(e) => {
                warn!(
                    target: "hoststats::sync",
                    error = %e,
                    "Bandwidth baseline unavailable, starting from first reading"
                );
                self.ledger.bandwidth.seed_totals(&last);
            }
        }

        info!(
            target: "hoststats::sync",
            source = self.source.name(),
            upload = last.upload_bandwidth,
            download = last.download_bandwidth,
            "Sync state initialized"
        );
        Ok(())
    }

    /// Classifies every obligation, folds them into hour buckets and saves
    /// the contract figures of the current hour.
    pub async fn sync_contracts(&self, now: DateTime<Utc>) -> SyncResult<ContractSyncReport> {
        let height = self.source.consensus_height().await?;
        let obligations = self.source.obligations().await?;
        let chain = ChainContext { height, now };
        let records = self
            .resolver
            .resolve(self.source.as_ref(), chain, &obligations)
            .await?;

        let snapshots = &self.ledger.db.snapshots;
        let mut report = ContractSyncReport {
            contracts: records.len(),
            ..ContractSyncReport::default()
        };
        if self.config.sync.dedupe_contract_events {
            let batch = ContributionBatch::from_records(&records);
            let stats = snapshots.apply_contributions(&batch)?;
            report.buckets = stats.gauges;
            report.applied = stats.applied;
            report.unchanged = stats.unchanged;
        } else {
            let buckets: Vec<Snapshot> = aggregate(&records).into_values().collect();
            snapshots.save(&buckets)?;
            report.buckets = buckets.len();
            report.applied = records.len();
        }

        let host = self.source.host().await?;
        let previous = self.ledger.db.meta.get_last()?;
        let first_seen = resolve_first_seen(host.first_seen, &previous, &records, now);
        let meta = assemble_metadata(
            &records,
            &host,
            self.ledger.bandwidth.totals(),
            first_seen,
            now,
        );
        self.ledger.status.update(|s| -> StoreResult<()> {
            self.ledger.db.meta.save(&meta)?;
            s.meta = meta;
            Ok(())
        })?;

        info!(
            target: "hoststats::sync",
            height,
            contracts = report.contracts,
            buckets = report.buckets,
            applied = report.applied,
            unchanged = report.unchanged,
            "Contracts synced"
        );
        Ok(report)
    }

    /// Refreshes live status, saves storage and bandwidth for the current
    /// hour and re-raises storage, wallet and collateral alerts.
    pub async fn sync_status(&self, now: DateTime<Utc>) -> SyncResult<()> {
        let host = self.source.host().await?;
        let folders = self.source.storage_folders().await?;
        let wallet = self.source.wallet().await?;
        let raw = self.source.bandwidth().await?;
        let totals = self.ledger.bandwidth.observe(raw);

        self.ledger.status.update(|s| -> StoreResult<()> {
            let meta = assemble_metadata(&[], &host, totals, s.meta.first_seen, now)
                .with_contract_figures(&s.meta);
            self.ledger.db.meta.save(&meta)?;
            s.meta = meta;
            s.online = true;
            s.accepting_contracts = host.accepting_contracts;
            s.wallet_unlocked = wallet.unlocked;
            s.version = host.version.clone();
            s.net_address = host.net_address.clone();
            s.start_time = host.start_time;
            s.last_update = now;
            Ok(())
        })?;

        let alerts = &self.ledger.alerts;
        alerts.clear(&[
            AlertId::FolderError,
            AlertId::StorageUtilization,
            AlertId::WalletLocked,
            AlertId::WalletBalance,
            AlertId::CollateralBudget,
        ]);
        for (id, alert) in storage_alerts(&folders)
            .into_iter()
            .chain(wallet_alerts(&wallet))
            .chain(collateral_alerts(&host))
        {
            alerts.set(id, alert);
        }

        trace!(
            target: "hoststats::sync",
            upload = totals.upload,
            download = totals.download,
            "Status synced"
        );
        Ok(())
    }

    pub async fn sync_connectivity(&self) -> SyncResult<()> {
        let address = self.ledger.status.get().net_address;
        let report = self.source.connectivity(&address).await?;

        let alerts = &self.ledger.alerts;
        alerts.clear(&[AlertId::ConnectionStatus]);
        for issue in &report.errors {
            alerts.set(
                AlertId::ConnectionStatus,
                HostAlert::new("connection", issue.message.clone(), issue.severity),
            );
        }
        self.ledger.status.update(|s| s.connectable = report.connected);

        debug!(
            target: "hoststats::sync",
            address = %address,
            connected = report.connected,
            issues = report.errors.len(),
            "Connectivity checked"
        );
        Ok(())
    }

    pub async fn run_cycle(&self, task: SyncTask) -> SyncResult<()> {
        self.run_cycle_at(task, Utc::now()).await
    }

    /// One cycle of `task`; a failure replaces the task's sync alert
    pub async fn run_cycle_at(&self, task: SyncTask, now: DateTime<Utc>) -> SyncResult<()> {
        let timer = PerfTimer::with_threshold(task.name(), SLOW_CYCLE_THRESHOLD_MS);
        let result = match task {
            SyncTask::Contracts => self.sync_contracts(now).await.map(|_| ()),
            SyncTask::Status => self.sync_status(now).await,
            SyncTask::Connectivity => self.sync_connectivity().await,
        };
        timer.stop();

        let alerts = &self.ledger.alerts;
        alerts.clear(&[AlertId::Sync(task)]);
        if let Err(e) = &result {
            alerts.set(
                AlertId::Sync(task),
                HostAlert::severe("sync", format!("{} sync failed: {}", task, e)),
            );
            if task == SyncTask::Status {
                self.ledger.status.update(|s| s.online = false);
            }
        }
        result
    }
}

/// Drives one task until `token` is cancelled
pub async fn run_periodic(syncer: Syncer, task: SyncTask, token: CancellationToken) {
    let interval_secs = task.interval_secs(&syncer.config.sync);
    let backoff = syncer.config.sync.retry_backoff();

    info!(
        target: "hoststats::sync",
        task = task.name(),
        interval = %humantime::format_duration(Duration::from_secs(interval_secs)),
        "Sync task started"
    );

    loop {
        let result = tokio::select! {
            _ = token.cancelled() => break,
            result = syncer.run_cycle(task) => result,
        };

        let wait = match result {
            Ok(()) => until_next_boundary(Utc::now(), interval_secs),
            Err(e) => {
                warn!(
                    target: "hoststats::sync",
                    task = task.name(),
                    error = %e,
                    recoverable = e.is_recoverable(),
                    retry_in = %humantime::format_duration(backoff),
                    "Sync cycle failed"
                );
                backoff
            }
        };

        tokio::select! {
            _ = token.cancelled() => break,
            _ = tokio::time::sleep(wait) => {}
        }
    }

    debug!(target: "hoststats::sync", task = task.name(), "Sync task stopped");
}

/// Resolves on SIGINT or SIGTERM
pub async fn shutdown_signal() {
    let interrupt = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(target: "hoststats::engine", error = %e, "Cannot listen for SIGINT");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(target: "hoststats::engine", error = %e, "Cannot listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = interrupt => info!(target: "hoststats::engine", "Received SIGINT"),
        _ = terminate => info!(target: "hoststats::engine", "Received SIGTERM"),
    }
}

// ----------------------------------------------------------------------------
// 13.4 Engine
// ----------------------------------------------------------------------------

/// Owns the sync tasks and their shutdown
pub struct Engine {
    config: Arc<EngineConfig>,
    syncer: Syncer,
    token: CancellationToken,
}

impl Engine {
    /// Opens the database and the HTTP source described by `config`
    pub fn new(config: EngineConfig) -> LedgerResult<Self> {
        fs::create_dir_all(&config.engine.data_path)?;
        let db = LedgerDb::open(config.db_path(), &config.storage)?;
        let source = HttpHostSource::new(&config.source)?;
        Ok(Self::with_parts(config, db, Arc::new(source)))
    }

    pub fn with_parts(config: EngineConfig, db: LedgerDb, source: Arc<dyn HostSource>) -> Self {
        let ledger = HostLedger::new(db, config.sync.bandwidth_window());
        let config = Arc::new(config);
        Self {
            syncer: Syncer::new(config.clone(), ledger, source),
            config,
            token: CancellationToken::new(),
        }
    }

    pub fn ledger(&self) -> &HostLedger {
        self.syncer.ledger()
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Signal shutdown
    pub fn shutdown(&self) {
        info!(target: "hoststats::engine", "Shutdown requested");
        self.token.cancel();
    }

    /// Runs until a signal or [`Engine::shutdown`], then drains the tasks
    /// within the shutdown timeout and flushes the database.
    pub async fn run(&self) -> LedgerResult<()> {
        info!(
            target: "hoststats::engine",
            version = ENGINE_VERSION,
            instance = %self.config.engine.instance_name,
            db = %self.config.db_path().display(),
            "Starting Hoststats Engine"
        );

        self.syncer.initialize().await?;

        let mut tasks = JoinSet::new();
        for task in SyncTask::ALL {
            tasks.spawn(run_periodic(
                self.syncer.clone(),
                task,
                self.token.child_token(),
            ));
        }

        let token = self.token.clone();
        let signals = tokio::spawn(async move {
            tokio::select! {
                _ = shutdown_signal() => token.cancel(),
                _ = token.cancelled() => {}
            }
        });

        self.token.cancelled().await;
        info!(target: "hoststats::engine", "Starting graceful shutdown");

        let shutdown_start = Instant::now();
        let timeout_secs = self.config.engine.shutdown_timeout_secs;
        let drained = tokio::time::timeout(Duration::from_secs(timeout_secs), async {
            while let Some(joined) = tasks.join_next().await {
                if let Err(e) = joined {
                    if e.is_panic() {
                        error!(target: "hoststats::engine", error = %e, "Sync task panicked");
                    }
                }
            }
        })
        .await;

        if drained.is_err() {
            let e = SyncError::ShutdownTimeout { timeout_secs };
            warn!(
                target: "hoststats::engine",
                error = %e,
                remaining = tasks.len(),
                "Aborting sync tasks"
            );
            tasks.abort_all();
        }
        signals.abort();

        let flushed = self.ledger().db().flush().await?;
        info!(
            target: "hoststats::engine",
            duration_ms = shutdown_start.elapsed().as_millis() as u64,
            flushed_bytes = flushed,
            db_size = self.ledger().db().size_on_disk().unwrap_or(0),
            "Engine shutdown complete"
        );

        Ok(())
    }
}

// ============================================================================
// SECTION 14: CLI & COMMAND LINE INTERFACE
// ============================================================================

// ----------------------------------------------------------------------------
// 14.1 CLI Argument Parser
// ----------------------------------------------------------------------------

/// Hoststats Engine CLI
#[derive(Parser, Debug)]
#[command(
    name = "hoststats",
    version,
    about = "Storage host monitoring engine",
    long_about = "Polls a storage host for contracts, storage, wallet and bandwidth, \
                  and keeps hour-bucketed history that can be queried by date range."
)]
pub struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = "hoststats.toml", env = "HOSTSTATS_CONFIG")]
    pub config: PathBuf,

    /// Log level override
    #[arg(short, long, env = "HOSTSTATS_LOG_LEVEL")]
    pub log_level: Option<String>,

    /// Enable debug mode
    #[arg(short, long, env = "HOSTSTATS_DEBUG")]
    pub debug: bool,

    /// Subcommand to run
    #[command(subcommand)]
    pub command: Option<Commands>,
}

/// Available subcommands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Start the engine
    Run {
        /// Override engine.data_path
        #[arg(long)]
        data_path: Option<PathBuf>,

        /// Override source.url
        #[arg(long)]
        source_url: Option<String>,
    },

    /// Validate configuration file
    Validate {
        /// Show full parsed configuration
        #[arg(short, long)]
        verbose: bool,
    },

    /// Generate default configuration file
    GenerateConfig {
        /// Output path (default: stdout)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Show engine version
    Version,

    /// Print stored snapshots as JSON
    Snapshots {
        /// Range start, unix seconds (default: one year before end)
        #[arg(long)]
        start: Option<i64>,

        /// Range end, unix seconds (default: now)
        #[arg(long)]
        end: Option<i64>,

        /// Roll hours up into calendar days
        #[arg(long)]
        daily: bool,
    },

    /// Print stored metadata as JSON
    Metadata {
        /// Range start, unix seconds (default: 30 days before end)
        #[arg(long)]
        start: Option<i64>,

        /// Range end, unix seconds (default: now)
        #[arg(long)]
        end: Option<i64>,
    },

    /// Print day, month and year totals as JSON
    Totals {
        /// Any time inside the day of interest, unix seconds (default: now)
        #[arg(long)]
        date: Option<i64>,
    },
}

// ----------------------------------------------------------------------------
// 14.2 Command Handlers
// ----------------------------------------------------------------------------

fn handle_validate(config_path: &Path, verbose: bool) -> LedgerResult<()> {
    println!("Validating configuration file: {}", config_path.display());

    match EngineConfig::load(config_path) {
        Ok(config) => {
            println!("✅ Configuration is valid!");

            if verbose {
                println!("\n📋 Parsed configuration:");
                println!("{}", "=".repeat(60));
                match toml::to_string_pretty(&config) {
                    Ok(s) => println!("{}", s),
                    Err(e) => println!("Failed to serialize: {}", e),
                }
            }

            println!("\n📊 Configuration Summary:");
            println!("  • Instance name: {}", config.engine.instance_name);
            println!("  • Database: {}", config.db_path().display());
            println!("  • Host API: {}", config.source.url);
            println!(
                "  • Connectivity checks: {}",
                config.source.connectivity_url.as_deref().unwrap_or("disabled")
            );
            println!(
                "  • Sync intervals: contracts {}s, status {}s, connectivity {}s",
                config.sync.contracts_interval_secs,
                config.sync.status_interval_secs,
                config.sync.connectivity_interval_secs
            );
            println!(
                "  • Contract event dedupe: {}",
                config.sync.dedupe_contract_events
            );

            Ok(())
        }
        Err(e) => {
            println!("❌ Configuration validation failed!");
            println!("Error: {}", e);
            Err(LedgerError::Config(e))
        }
    }
}

fn handle_generate_config(output: Option<&Path>) -> LedgerResult<()> {
    let config_str = EngineConfig::generate_default_config();

    match output {
        Some(path) => {
            fs::write(path, &config_str)?;
            println!("✅ Default configuration written to: {}", path.display());
        }
        None => {
            println!("{}", config_str);
        }
    }

    Ok(())
}

fn handle_version() {
    println!("{} v{}", ENGINE_FULL_NAME, ENGINE_VERSION);
    println!();
    println!("Build Information:");
    println!("  • Target: {}", std::env::consts::ARCH);
    println!("  • OS: {}", std::env::consts::OS);
    println!();
    println!("Storage:");
    println!("  • Trees: {}, {}, {}", METADATA_TREE, SNAPSHOT_TREE, CONTRACT_EVENTS_TREE);
    println!("  • Bucket width: {}s", BUCKET_SECS);
}

/// `[start, end]` from optional unix seconds, defaulting to `default_days`
/// before `end`
fn query_range(
    start: Option<i64>,
    end: Option<i64>,
    default_days: i64,
    now: DateTime<Utc>,
) -> (DateTime<Utc>, DateTime<Utc>) {
    let end = end.map(unix_to_datetime).unwrap_or(now);
    let start = start
        .map(unix_to_datetime)
        .unwrap_or_else(|| end - ChronoDuration::days(default_days));
    (start, end)
}

fn print_json<T: Serialize>(value: &T) -> AnyhowResult<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Opens the database read-side. Fails while a running engine holds the lock.
fn open_ledger(config: &EngineConfig) -> AnyhowResult<HostLedger> {
    let path = config.db_path();
    let db = LedgerDb::open(&path, &config.storage)
        .with_context(|| format!("Failed to open database at {}", path.display()))?;
    Ok(HostLedger::new(db, config.sync.bandwidth_window()))
}

fn handle_query(command: Commands, config: &EngineConfig) -> AnyhowResult<()> {
    let now = Utc::now();
    let ledger = open_ledger(config)?;

    match command {
        Commands::Snapshots { start, end, daily } => {
            let (start, end) = query_range(start, end, DEFAULT_SNAPSHOT_QUERY_DAYS, now);
            let snapshots = if daily {
                ledger.daily_snapshots(start, end)?
            } else {
                ledger.snapshot_range(start, end)?
            };
            print_json(&snapshots)
        }
        Commands::Metadata { start, end } => {
            let (start, end) = query_range(start, end, DEFAULT_METADATA_QUERY_DAYS, now);
            print_json(&ledger.metadata_range(start, end)?)
        }
        Commands::Totals { date } => {
            let date = date.map(unix_to_datetime).unwrap_or(now);
            print_json(&ledger.totals(date)?)
        }
        other => Err(anyhow::anyhow!("{:?} is not a query command", other)),
    }
}

// ============================================================================
// SECTION 15: MAIN ENTRY POINT
// ============================================================================

#[tokio::main]
async fn main() -> AnyhowResult<()> {
    let cli = Cli::parse();

    match &cli.command {
        Some(Commands::Version) => {
            handle_version();
            return Ok(());
        }
        Some(Commands::GenerateConfig { output }) => {
            handle_generate_config(output.as_deref())?;
            return Ok(());
        }
        Some(Commands::Validate { verbose }) => {
            handle_validate(&cli.config, *verbose)?;
            return Ok(());
        }
        _ => {}
    }

    let mut config = EngineConfig::load_or_default(&cli.config)
        .with_context(|| format!("Failed to load config from {}", cli.config.display()))?;

    let command = cli.command.unwrap_or(Commands::Run {
        data_path: None,
        source_url: None,
    });

    let (data_path, source_url) = match command {
        Commands::Run {
            data_path,
            source_url,
        } => (data_path, source_url),
        query => return handle_query(query, &config),
    };

    if let Some(path) = data_path {
        config.engine.data_path = path;
    }
    if let Some(url) = source_url {
        config.source.url = url;
    }
    config.validate()?;

    let mut logging_config = config.logging.clone();
    if let Some(level) = &cli.log_level {
        logging_config.level = level.clone();
    }
    if cli.debug {
        logging_config.level = "debug".into();
    }
    let _log_guard = init_logging(&logging_config)?;

    info!("{} v{}", ENGINE_FULL_NAME, ENGINE_VERSION);

    let engine = Engine::new(config)?;
    engine.run().await?;

    Ok(())
}

// ============================================================================
// SECTION 16: TESTS
// ============================================================================


#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;
    use proptest::prelude::*;
    use test_case::test_case;

    #[test]
    fn test_currency_parse_and_display() {
        let c: Currency = "123456789012345678901234567890".parse().unwrap();
        assert_eq!(c.to_string(), "123456789012345678901234567890");
        assert!("".parse::<Currency>().is_err());
        assert!("-1".parse::<Currency>().is_err());
        assert!("1_000".parse::<Currency>().is_err());
        assert!("12a".parse::<Currency>().is_err());
    }

    #[test]
    fn test_currency_serde() {
        let c = currency(u128::from(u64::MAX) * 4);
        let json = serde_json::to_string(&c).unwrap();
        assert_eq!(json, format!("\"{}\"", u128::from(u64::MAX) * 4));
        assert_eq!(serde_json::from_str::<Currency>(&json).unwrap(), c);
        assert_eq!(serde_json::from_str::<Currency>("42").unwrap(), currency(42));
        assert!(serde_json::from_str::<Currency>("-3").is_err());
    }

    #[test]
    fn test_currency_arithmetic_saturates() {
        assert_eq!(currency(u128::MAX) + currency(1), currency(u128::MAX));
        assert_eq!(currency(5).saturating_sub(currency(9)), Currency::ZERO);
        assert_eq!(currency(5).checked_sub(currency(9)), None);
        let total: Currency = [currency(1), currency(2), currency(3)].into_iter().sum();
        assert_eq!(total, currency(6));
    }

    #[test]
    fn test_bignumber_goes_negative() {
        let n = BigNumber::zero().sub_currency(currency(50));
        assert!(n.is_negative());
        assert_eq!(n.to_string(), "-50");
        assert_eq!(serde_json::to_string(&n).unwrap(), "\"-50\"");
        assert_eq!(serde_json::from_str::<BigNumber>("\"-50\"").unwrap(), n);
    }

    #[test]
    fn test_bignumber_operations_leave_receiver_untouched() {
        let a = BigNumber::from(10);
        let b = a.sub(&BigNumber::from(25)).add_currency(currency(5));
        assert_eq!(a, BigNumber::from(10));
        assert_eq!(b, BigNumber::from(-10));
    }

    #[test]
    fn test_bignumber_rejects_malformed() {
        for input in ["", "-", "+-1", "1_000", "0x10", " 1"] {
            assert!(input.parse::<BigNumber>().is_err(), "accepted {:?}", input);
        }
        assert_eq!("+7".parse::<BigNumber>().unwrap(), BigNumber::from(7));
    }

    #[test_case(7, 2 => "3"; "positive floors")]
    #[test_case(-7, 2 => "-4"; "negative floors toward minus infinity")]
    #[test_case(-8, 2 => "-4"; "negative exact")]
    #[test_case(0, 5 => "0"; "zero")]
    fn test_bignumber_div64(value: i64, divisor: u64) -> String {
        BigNumber::from(value).div64(divisor).to_string()
    }

    #[test]
    fn test_bucket_key_stable_within_hour() {
        let start = BucketKey::encode(hour(3));
        assert_eq!(BucketKey::encode(hour(3) + ChronoDuration::seconds(1)), start);
        assert_eq!(BucketKey::encode(hour(3) + ChronoDuration::seconds(3599)), start);
        assert_ne!(BucketKey::encode(hour(4)), start);
        assert_eq!(start.timestamp(), hour(3));
        assert_eq!(BucketKey::from_bytes(start.as_ref()), Some(start));
    }

    #[test]
    fn test_bucket_key_clamps_pre_epoch() {
        assert_eq!(BucketKey::encode(ts(-7200)).unix(), 0);
    }

    #[test]
    fn test_bucket_id_steps_by_hour() {
        let id = BucketId::from_timestamp(hour(2) + ChronoDuration::minutes(30));
        assert_eq!(id.timestamp(), hour(2));
        assert_eq!(id.next().timestamp(), hour(3));
        assert_eq!(id.key(), BucketKey::encode(hour(2)));
    }

    #[test]
    fn test_truncate_to_day() {
        assert_eq!(truncate_to_day(hour(23) + ChronoDuration::minutes(59)), hour(0));
        assert_eq!(truncate_to_day(hour(24)), hour(24));
    }

    proptest! {
        #[test]
        fn bucket_keys_follow_time_order(a in 0i64..4_000_000_000, b in 0i64..4_000_000_000) {
            let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
            prop_assert!(BucketKey::encode(ts(lo)).as_bytes() <= BucketKey::encode(ts(hi)).as_bytes());
        }

        #[test]
        fn bucket_key_matches_hour_start(secs in 0i64..4_000_000_000) {
            let start = secs - secs.rem_euclid(BUCKET_SECS);
            prop_assert_eq!(BucketKey::encode(ts(secs)), BucketKey::encode(ts(start)));
            prop_assert_eq!(BucketKey::encode(ts(secs)).timestamp(), ts(start));
        }
    }

    #[test]
    fn test_config_defaults() {
        let config = EngineConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.sync.contracts_interval_secs, 600);
        assert_eq!(config.sync.status_interval_secs, 10);
        assert_eq!(config.sync.connectivity_interval_secs, 600);
        assert_eq!(config.sync.retry_backoff(), Duration::from_secs(30));
        assert!(config.sync.dedupe_contract_events);
        assert_eq!(config.storage.corrupt_records, CorruptRecordPolicy::Skip);
        assert_eq!(config.engine.shutdown_timeout_secs, 5);
        assert_eq!(config.db_path(), PathBuf::from("data").join("hoststats.db"));
    }

    #[test]
    fn test_config_partial_toml() {
        let config = EngineConfig::from_str(
            r#"
            [sync]
            status_interval_secs = 30
            dedupe_contract_events = false

            [storage]
            corrupt_records = "abort"
            "#,
        )
        .unwrap();
        assert_eq!(config.sync.status_interval_secs, 30);
        assert_eq!(config.sync.contracts_interval_secs, 600);
        assert!(!config.sync.dedupe_contract_events);
        assert_eq!(config.storage.corrupt_records, CorruptRecordPolicy::Abort);
    }

    #[test_case("[sync]\ncontracts_interval_secs = 0" => "sync.contracts_interval_secs"; "zero interval")]
    #[test_case("[sync]\nretry_backoff_secs = 0" => "sync.retry_backoff_secs"; "zero backoff")]
    #[test_case("[logging]\nformat = \"xml\"" => "logging.format"; "unknown log format")]
    #[test_case("[source]\nurl = \"localhost:9980\"" => "source.url"; "url without scheme")]
    #[test_case("[storage]\ndb_file = \"\"" => "storage.db_file"; "empty db file")]
    fn test_config_rejects(toml_str: &str) -> String {
        match EngineConfig::from_str(toml_str) {
            Err(ConfigError::InvalidValue { field, .. }) => field,
            other => panic!("expected InvalidValue, got {:?}", other),
        }
    }

    #[test]
    fn test_generated_config_round_trips() {
        let generated = EngineConfig::generate_default_config();
        let config = EngineConfig::from_str(&generated).unwrap();
        assert_eq!(config.source.url, DEFAULT_SOURCE_URL);
        assert_eq!(config.storage.db_file, DEFAULT_DB_FILE);
    }

    #[test]
    fn test_config_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hoststats.toml");
        fs::write(&path, "[engine]\ninstance_name = \"rack-7\"\n").unwrap();

        let config = EngineConfig::load(&path).unwrap();
        assert_eq!(config.engine.instance_name, "rack-7");
        assert_eq!(config.sync.status_interval_secs, 10);

        let missing = EngineConfig::load(dir.path().join("missing.toml"));
        assert!(matches!(missing, Err(ConfigError::FileNotFound { .. })));
        assert!(EngineConfig::load_or_default(dir.path().join("missing.toml")).is_ok());
    }

    #[test]
    fn test_error_categories() {
        let err: LedgerError = StoreError::InvalidTimeRange {
            start: hour(2),
            end: hour(1),
        }
        .into();
        assert_eq!(err.category(), "storage");
        assert!(!err.is_recoverable());

        let err: LedgerError = SourceError::HttpStatus {
            url: "http://host/consensus".into(),
            status: 503,
        }
        .into();
        assert_eq!(err.category(), "source");
        assert!(err.is_recoverable());
    }
}

#[cfg(test)]
mod store_tests {
    use super::test_support::*;
    use super::*;
    use pretty_assertions::assert_eq;

    fn meta_at(ts: DateTime<Utc>, active: u64) -> Metadata {
        Metadata {
            active_contracts: active,
            payout: currency(1_000),
            earned_revenue: BigNumber::from(-20),
            used_storage: 4096,
            total_storage: 8192,
            timestamp: ts,
            ..Metadata::default()
        }
    }

    fn snapshot(ts: DateTime<Utc>, active: u64, new: u64) -> Snapshot {
        Snapshot {
            active_contracts: active,
            new_contracts: new,
            ..Snapshot::at(ts)
        }
    }

    #[test]
    fn test_metadata_round_trip_truncates_to_hour() {
        let db = temp_db();
        let meta = meta_at(hour(2) + ChronoDuration::minutes(17), 4);
        db.meta.save(&meta).unwrap();

        let stored = db.meta.get(hour(2)).unwrap().unwrap();
        assert_eq!(stored, Metadata { timestamp: hour(2), ..meta });
        assert_eq!(db.meta.get(hour(3)).unwrap(), None);
    }

    #[test]
    fn test_metadata_save_replaces_bucket() {
        let db = temp_db();
        db.meta.save(&meta_at(hour(1), 4)).unwrap();
        db.meta.save(&meta_at(hour(1) + ChronoDuration::minutes(40), 9)).unwrap();

        assert_eq!(db.meta.len(), 1);
        assert_eq!(db.meta.get(hour(1)).unwrap().unwrap().active_contracts, 9);
    }

    #[test]
    fn test_metadata_range_is_inclusive_and_ordered() {
        let db = temp_db();
        for h in [5, 1, 3, 7] {
            db.meta.save(&meta_at(hour(h), h as u64)).unwrap();
        }

        let range = db.meta.get_range(hour(1), hour(5)).unwrap();
        let active: Vec<u64> = range.iter().map(|m| m.active_contracts).collect();
        assert_eq!(active, vec![1, 3, 5]);
    }

    #[test]
    fn test_invalid_range_is_rejected() {
        let db = temp_db();
        assert!(matches!(
            db.meta.get_range(hour(5), hour(1)),
            Err(StoreError::InvalidTimeRange { .. })
        ));
        assert!(matches!(
            db.snapshots.get_range(hour(5), hour(1)),
            Err(StoreError::InvalidTimeRange { .. })
        ));
        assert!(matches!(
            db.snapshots.get_daily(hour(48), hour(1)),
            Err(StoreError::InvalidTimeRange { .. })
        ));
    }

    #[test]
    fn test_last_and_closest_metadata() {
        let db = temp_db();
        assert_eq!(db.meta.get_last().unwrap(), Metadata::default());

        db.meta.save(&meta_at(hour(2), 2)).unwrap();
        db.meta.save(&meta_at(hour(5), 5)).unwrap();

        assert_eq!(db.meta.get_last().unwrap().active_contracts, 5);
        assert_eq!(db.meta.get_closest(hour(3)).unwrap().active_contracts, 5);
        assert_eq!(db.meta.get_closest(hour(2)).unwrap().active_contracts, 2);
        assert_eq!(db.meta.get_closest(hour(6)).unwrap(), Metadata::default());
    }

    #[test]
    fn test_bandwidth_usage_over_window() {
        let db = temp_db();
        let mut first = meta_at(hour(0), 0);
        first.upload_bandwidth = 100;
        first.download_bandwidth = 50;
        let mut last = meta_at(hour(5), 0);
        last.upload_bandwidth = 400;
        last.download_bandwidth = 80;
        db.meta.save(&first).unwrap();
        db.meta.save(&last).unwrap();

        let usage = db.meta.bandwidth_usage(hour(5), ChronoDuration::hours(6)).unwrap();
        assert_eq!(usage, BandwidthReading { upload: 300, download: 30 });
    }

    #[test]
    fn test_snapshot_merge_sums_additive_and_overwrites_gauge() {
        let db = temp_db();
        db.snapshots.save(&[snapshot(hour(1), 5, 1)]).unwrap();
        db.snapshots
            .save(&[snapshot(hour(1) + ChronoDuration::minutes(10), 3, 1)])
            .unwrap();

        let stored = db.snapshots.get(hour(1)).unwrap().unwrap();
        assert_eq!(stored.new_contracts, 2);
        assert_eq!(stored.active_contracts, 3);
        assert_eq!(stored.timestamp, hour(1));
    }

    #[test]
    fn test_snapshot_batch_merges_within_one_save() {
        let db = temp_db();
        let mut a = snapshot(hour(1), 2, 1);
        a.payout = currency(10);
        let mut b = snapshot(hour(1), 4, 2);
        b.payout = currency(15);
        b.earned_revenue = BigNumber::from(-5);

        db.snapshots.save(&[a, b, snapshot(hour(2), 1, 0)]).unwrap();

        let stored = db.snapshots.get(hour(1)).unwrap().unwrap();
        assert_eq!(stored.new_contracts, 3);
        assert_eq!(stored.active_contracts, 4);
        assert_eq!(stored.payout, currency(25));
        assert_eq!(stored.earned_revenue, BigNumber::from(-5));
        assert_eq!(db.snapshots.len(), 2);
    }

    #[test]
    fn test_daily_rollup_takes_last_gauge_and_sums_additive() {
        let db = temp_db();
        let hours: Vec<Snapshot> = (0..24)
            .map(|h| snapshot(hour(h), if h < 20 { 5 } else { 7 }, u64::from(h == 3)))
            .collect();
        db.snapshots.save(&hours).unwrap();

        let daily = db.snapshots.get_daily(hour(0), hour(12)).unwrap();
        assert_eq!(daily.len(), 1);
        assert_eq!(daily[0].active_contracts, 7);
        assert_eq!(daily[0].new_contracts, 1);
        assert_eq!(daily[0].timestamp, hour(0));
    }

    #[test]
    fn test_daily_rollup_carries_gauge_over_empty_days() {
        let db = temp_db();
        db.snapshots
            .save(&[snapshot(hour(4), 3, 2), snapshot(hour(10), 7, 0)])
            .unwrap();

        let daily = db.snapshots.get_daily(hour(0), hour(50)).unwrap();
        let shape: Vec<(DateTime<Utc>, u64, u64)> = daily
            .iter()
            .map(|d| (d.timestamp, d.active_contracts, d.new_contracts))
            .collect();
        assert_eq!(
            shape,
            vec![(hour(0), 7, 2), (hour(24), 7, 0), (hour(48), 7, 0)]
        );
    }

    #[test]
    fn test_daily_rollup_seeds_gauge_from_before_range() {
        let db = temp_db();
        db.snapshots.save(&[snapshot(hour(5), 4, 1)]).unwrap();

        let daily = db.snapshots.get_daily(hour(24), hour(30)).unwrap();
        assert_eq!(daily.len(), 1);
        assert_eq!(daily[0].active_contracts, 4);
        assert_eq!(daily[0].new_contracts, 0);
    }

    #[test]
    fn test_period_totals() {
        let db = temp_db();
        let october = hour(-40 * 24);
        db.snapshots
            .save(&[snapshot(october, 2, 2), snapshot(hour(3), 6, 1)])
            .unwrap();

        let totals = db.snapshots.get_totals(hour(1)).unwrap();
        assert_eq!(totals.day.new_contracts, 1);
        assert_eq!(totals.day.timestamp, hour(0));
        assert_eq!(totals.month.new_contracts, 1);
        assert_eq!(totals.month.timestamp, ts(1_698_796_800));
        assert_eq!(totals.year.new_contracts, 3);
        assert_eq!(totals.year.active_contracts, 6);
    }

    #[test]
    fn test_corrupt_record_is_skipped() {
        let db = temp_db();
        db.snapshots
            .save(&[snapshot(hour(0), 1, 1), snapshot(hour(2), 1, 1)])
            .unwrap();
        db.snapshots
            .tree
            .insert(BucketKey::encode(hour(1)), &b"not json"[..])
            .unwrap();

        let range = db.snapshots.get_range(hour(0), hour(2)).unwrap();
        let stamps: Vec<DateTime<Utc>> = range.iter().map(|s| s.timestamp).collect();
        assert_eq!(stamps, vec![hour(0), hour(2)]);
    }

    #[test]
    fn test_corrupt_record_aborts_when_configured() {
        let db = LedgerDb::temporary(CorruptRecordPolicy::Abort).unwrap();
        db.meta.save(&meta_at(hour(0), 1)).unwrap();
        db.meta
            .tree
            .insert(BucketKey::encode(hour(1)), &b"{broken"[..])
            .unwrap();

        match db.meta.get_range(hour(0), hour(2)) {
            Err(StoreError::Decode { key, .. }) => assert_eq!(key, hour(1).to_rfc3339()),
            other => panic!("expected decode error, got {:?}", other),
        }
    }

    #[test]
    fn test_reopen_keeps_records() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ledger.db");
        let config = StorageConfig::default();

        {
            let db = LedgerDb::open(&path, &config).unwrap();
            db.meta.save(&meta_at(hour(1), 3)).unwrap();
            db.snapshots.save(&[snapshot(hour(1), 3, 1)]).unwrap();
            db.db.flush().unwrap();
        }

        let db = LedgerDb::open(&path, &config).unwrap();
        assert_eq!(db.meta.get_last().unwrap().active_contracts, 3);
        assert_eq!(db.snapshots.get(hour(1)).unwrap().unwrap().new_contracts, 1);
    }
}


#[cfg(test)]
mod sync_tests {
    use super::test_support::*;
    use super::*;
    use test_case::test_case;

    #[test]
    fn test_bandwidth_counter_ignores_regression() {
        let counter = BandwidthCounter::new();
        let last = Metadata {
            upload_bandwidth: 5_000,
            download_bandwidth: 9_000,
            ..Metadata::default()
        };
        counter.initialize(&last, BandwidthReading { upload: 1_000, download: 1_000 });

        let totals = counter.observe(BandwidthReading { upload: 200, download: 300 });
        assert_eq!(totals, BandwidthReading { upload: 5_000, download: 9_000 });

        let totals = counter.observe(BandwidthReading { upload: 450, download: 300 });
        assert_eq!(totals, BandwidthReading { upload: 5_250, download: 9_000 });
    }

    #[test]
    fn test_bandwidth_counter_first_reading_is_baseline() {
        let counter = BandwidthCounter::new();
        counter.seed_totals(&Metadata {
            upload_bandwidth: 10,
            ..Metadata::default()
        });

        assert_eq!(counter.observe(BandwidthReading { upload: 1_000, download: 1_000 }).upload, 10);
        assert_eq!(counter.observe(BandwidthReading { upload: 1_500, download: 1_000 }).upload, 510);
        assert_eq!(counter.totals().upload, 510);
    }

    #[test]
    fn test_alert_cache_clear_then_set() {
        let cache = AlertCache::new();
        cache.set(AlertId::WalletLocked, HostAlert::severe("wallet", "locked"));
        cache.set(AlertId::FolderError, HostAlert::warning("storage", "read errors"));
        cache.set(AlertId::FolderError, HostAlert::warning("storage", "write errors"));
        assert_eq!(cache.len(), 3);

        let texts: Vec<CompactString> = cache.list().into_iter().map(|a| a.text).collect();
        assert_eq!(texts, vec!["read errors", "write errors", "locked"]);

        cache.clear(&[AlertId::FolderError]);
        assert_eq!(cache.len(), 1);

        cache.clear(&[]);
        assert!(cache.is_empty());
    }

    #[test_case(0, 0 => 0; "nothing of nothing")]
    #[test_case(5, 0 => 100; "something of nothing")]
    #[test_case(50, 100 => 50; "half")]
    #[test_case(999, 1000 => 99; "rounds down")]
    #[test_case(150, 100 => 100; "capped")]
    fn test_calc_percentage(value: u128, total: u128) -> u128 {
        calc_percentage(value, total)
    }

    fn folder(capacity: u64, remaining: u64) -> StorageFolder {
        StorageFolder {
            path: "/srv/host".into(),
            capacity,
            capacity_remaining: remaining,
            ..StorageFolder::default()
        }
    }

    #[test_case(1000, 500 => None; "half full")]
    #[test_case(1000, 150 => Some(AlertSeverity::Warning); "85 percent")]
    #[test_case(1000, 20 => Some(AlertSeverity::Severe); "98 percent")]
    fn test_storage_utilization_threshold(capacity: u64, remaining: u64) -> Option<AlertSeverity> {
        storage_alerts(&[folder(capacity, remaining)])
            .into_iter()
            .find(|(id, _)| *id == AlertId::StorageUtilization)
            .map(|(_, alert)| alert.severity)
    }

    #[test]
    fn test_storage_alerts_without_folders() {
        let alerts = storage_alerts(&[]);
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].0, AlertId::StorageUtilization);
        assert_eq!(alerts[0].1.severity, AlertSeverity::Severe);
    }

    #[test_case(3, 1 => "storage folder /data has read and write errors"; "reads and writes")]
    #[test_case(0, 2 => "storage folder /data has write errors"; "writes only")]
    #[test_case(4, 0 => "storage folder /data has read errors"; "reads only")]
    fn test_folder_failures_raise_one_severe_alert(reads: u64, writes: u64) -> String {
        let mut failing = folder(1000, 900);
        failing.path = "/data".into();
        failing.failed_reads = reads;
        failing.failed_writes = writes;

        let alerts = storage_alerts(&[failing]);
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].0, AlertId::FolderError);
        assert_eq!(alerts[0].1.severity, AlertSeverity::Severe);
        alerts[0].1.text.to_string()
    }

    #[test]
    fn test_healthy_folder_raises_nothing() {
        assert!(storage_alerts(&[folder(1000, 900)]).is_empty());
    }

    #[test]
    fn test_wallet_and_collateral_alerts() {
        let wallet = WalletInfo {
            unlocked: false,
            confirmed_balance: Currency::ZERO,
        };
        let ids: Vec<AlertId> = wallet_alerts(&wallet).into_iter().map(|(id, _)| id).collect();
        assert_eq!(ids, vec![AlertId::WalletLocked, AlertId::WalletBalance]);

        let host = HostInfo {
            locked_collateral: currency(90),
            collateral_budget: currency(100),
            ..HostInfo::default()
        };
        let alerts = collateral_alerts(&host);
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].1.severity, AlertSeverity::Warning);
        assert!(collateral_alerts(&HostInfo::default()).is_empty());
    }

    #[test]
    fn test_collateral_locked_without_budget_is_severe() {
        let host = HostInfo {
            locked_collateral: currency(10),
            collateral_budget: Currency::ZERO,
            ..HostInfo::default()
        };
        let alerts = collateral_alerts(&host);
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].0, AlertId::CollateralBudget);
        assert_eq!(alerts[0].1.severity, AlertSeverity::Severe);
    }

    #[test]
    fn test_assemble_metadata() {
        let mut forming = failed_record("c");
        forming.status = ContractStatus::Forming;
        let host = HostInfo {
            total_storage: 1_000,
            remaining_storage: 250,
            ..HostInfo::default()
        };

        let meta = assemble_metadata(
            &[failed_record("a"), unresolved_record("b"), forming],
            &host,
            BandwidthReading { upload: 7, download: 9 },
            hour(-100),
            hour(4) + ChronoDuration::minutes(12),
        );

        assert_eq!(meta.failed_contracts, 1);
        assert_eq!(meta.active_contracts, 1);
        assert_eq!(meta.payout, currency(170));
        assert_eq!(meta.earned_revenue, BigNumber::from(-60));
        assert_eq!(meta.potential_revenue, currency(30));
        assert_eq!(meta.burnt_collateral, currency(60));
        assert_eq!(meta.used_storage, 750);
        assert_eq!(meta.upload_bandwidth, 7);
        assert_eq!(meta.first_seen, hour(-100));
        assert_eq!(meta.timestamp, hour(4));
    }

    #[test]
    fn test_resolve_first_seen() {
        let records = [failed_record("a")];
        let stored = Metadata {
            first_seen: hour(-50),
            ..Metadata::default()
        };
        assert_eq!(resolve_first_seen(Some(hour(-90)), &stored, &records, hour(9)), hour(-90));
        assert_eq!(resolve_first_seen(None, &stored, &records, hour(9)), hour(-50));
        assert_eq!(resolve_first_seen(None, &Metadata::default(), &records, hour(9)), hour(0));
        assert_eq!(resolve_first_seen(None, &Metadata::default(), &[], hour(9)), hour(9));
    }

    #[test_case(DAY0 + 5, 600 => DAY0 + 600; "mid interval")]
    #[test_case(DAY0 + 600, 600 => DAY0 + 1200; "on a boundary")]
    #[test_case(DAY0 + 3, 10 => DAY0 + 10; "status cadence")]
    #[test_case(DAY0 + 3, 0 => DAY0 + 4; "zero interval treated as one second")]
    fn test_next_aligned(now: i64, interval: u64) -> i64 {
        next_aligned(ts(now), interval).timestamp()
    }

    #[test]
    fn test_until_next_boundary() {
        assert_eq!(until_next_boundary(ts(DAY0 + 595), 600), Duration::from_secs(5));
    }

    fn failing_obligation() -> Obligation {
        Obligation {
            id: "ob-1".into(),
            formation_confirmed: true,
            negotiation_height: 10,
            expiration_height: 80,
            proof_deadline: 90,
            locked_collateral: currency(100),
            valid_proof_payout: currency(150),
            missed_proof_payout: currency(40),
            ..Obligation::default()
        }
    }

    fn healthy_host() -> ScriptedState {
        ScriptedState {
            height: 100,
            obligations: vec![failing_obligation()],
            host: HostInfo {
                accepting_contracts: true,
                net_address: "host.example:9982".into(),
                version: "1.6.0".into(),
                total_storage: 1_000,
                remaining_storage: 600,
                ..HostInfo::default()
            },
            folders: vec![folder(1_000, 600)],
            wallet: WalletInfo {
                unlocked: true,
                confirmed_balance: currency(1_000),
            },
            bandwidth: BandwidthReading { upload: 500, download: 500 },
            connectivity: ConnectivityReport::unchecked(),
            ..ScriptedState::default()
        }
    }

    fn failed_total(syncer: &Syncer) -> u64 {
        syncer
            .ledger()
            .snapshot_range(hour(-24), hour(24))
            .unwrap()
            .iter()
            .map(|s| s.failed_contracts)
            .sum()
    }

    #[tokio::test]
    async fn test_contract_sync_is_idempotent() {
        let source = ScriptedSource::new(healthy_host());
        let syncer = test_syncer(source, EngineConfig::default());

        syncer.run_cycle_at(SyncTask::Contracts, hour(10)).await.unwrap();
        syncer.run_cycle_at(SyncTask::Contracts, hour(10)).await.unwrap();

        assert_eq!(failed_total(&syncer), 1);
        let deadline = syncer.ledger().snapshot_range(hour(9), hour(9)).unwrap();
        assert_eq!(deadline[0].burnt_collateral, currency(60));

        let meta = syncer.ledger().last_metadata().unwrap();
        assert_eq!(meta.failed_contracts, 1);
        assert_eq!(meta.timestamp, hour(10));
        assert_eq!(meta.first_seen, hour(-5));
        assert_eq!(meta.used_storage, 400);
    }

    #[tokio::test]
    async fn test_contract_sync_without_dedupe_is_at_least_once() {
        let source = ScriptedSource::new(healthy_host());
        let mut config = EngineConfig::default();
        config.sync.dedupe_contract_events = false;
        let syncer = test_syncer(source, config);

        syncer.run_cycle_at(SyncTask::Contracts, hour(10)).await.unwrap();
        syncer.run_cycle_at(SyncTask::Contracts, hour(10)).await.unwrap();

        assert_eq!(failed_total(&syncer), 2);
    }

    #[tokio::test]
    async fn test_resolver_uses_block_times() {
        let mut state = healthy_host();
        state.blocks.insert(10, ts(DAY0 - 1234));
        let source = ScriptedSource::new(state);
        let resolver = ContractResolver::new();

        let records = resolver
            .resolve(
                &*source,
                ChainContext { height: 100, now: hour(10) },
                &[failing_obligation()],
            )
            .await
            .unwrap();

        assert_eq!(records[0].negotiation_timestamp, ts(DAY0 - 1234));
        assert_eq!(resolver.cached_blocks(), 1);
    }

    #[tokio::test]
    async fn test_status_sync_raises_and_clears_alerts() {
        let mut state = healthy_host();
        state.folders = vec![folder(1_000, 100)];
        state.folders[0].failed_reads = 2;
        state.wallet.confirmed_balance = Currency::ZERO;
        let source = ScriptedSource::new(state);
        let syncer = test_syncer(source.clone(), EngineConfig::default());

        syncer.run_cycle_at(SyncTask::Status, hour(1)).await.unwrap();
        assert_eq!(syncer.ledger().alerts().len(), 3);

        let status = syncer.ledger().status(hour(1)).unwrap();
        assert!(status.status.online);
        assert!(status.status.accepting_contracts);
        assert_eq!(status.status.version, "1.6.0");
        assert_eq!(status.alerts.len(), 3);

        source.script(|s| {
            s.folders = vec![folder(1_000, 600)];
            s.wallet.confirmed_balance = currency(5);
        });
        syncer.run_cycle_at(SyncTask::Status, hour(1)).await.unwrap();
        assert!(syncer.ledger().alerts().is_empty());
    }

    #[tokio::test]
    async fn test_status_sync_reports_host_start_time() {
        let mut state = healthy_host();
        state.host.start_time = Some(hour(-30));
        let source = ScriptedSource::new(state);
        let syncer = test_syncer(source.clone(), EngineConfig::default());

        syncer.run_cycle_at(SyncTask::Contracts, hour(10)).await.unwrap();
        syncer.run_cycle_at(SyncTask::Status, hour(10)).await.unwrap();

        let status = syncer.ledger().status_cache().get();
        assert_eq!(status.meta.failed_contracts, 1);
        assert_eq!(status.meta.upload_bandwidth, 0);
        assert_eq!(status.start_time, Some(hour(-30)));
        assert_eq!(syncer.ledger().last_metadata().unwrap().failed_contracts, 1);
    }

    #[tokio::test]
    async fn test_failed_cycle_raises_sync_alert() {
        let source = ScriptedSource::new(healthy_host());
        let syncer = test_syncer(source.clone(), EngineConfig::default());
        syncer.run_cycle_at(SyncTask::Status, hour(1)).await.unwrap();

        source.script(|s| s.offline = true);
        let result = syncer.run_cycle_at(SyncTask::Status, hour(2)).await;
        assert!(matches!(result, Err(SyncError::Source(SourceError::ConnectionFailed { .. }))));

        let alerts = syncer.ledger().alerts();
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].kind, "sync");
        assert_eq!(alerts[0].severity, AlertSeverity::Severe);
        assert!(!syncer.ledger().status_cache().get().online);

        source.script(|s| s.offline = false);
        syncer.run_cycle_at(SyncTask::Status, hour(2)).await.unwrap();
        assert!(syncer.ledger().alerts().is_empty());
        assert!(syncer.ledger().status_cache().get().online);
    }

    #[tokio::test]
    async fn test_bandwidth_survives_restart() {
        let source = ScriptedSource::new(healthy_host());
        let syncer = test_syncer(source.clone(), EngineConfig::default());
        syncer
            .ledger()
            .db()
            .meta
            .save(&Metadata {
                upload_bandwidth: 1_000,
                download_bandwidth: 2_000,
                timestamp: hour(0),
                ..Metadata::default()
            })
            .unwrap();

        syncer.initialize().await.unwrap();

        source.script(|s| s.bandwidth = BandwidthReading { upload: 700, download: 500 });
        syncer.run_cycle_at(SyncTask::Status, hour(1)).await.unwrap();
        assert_eq!(syncer.ledger().last_metadata().unwrap().upload_bandwidth, 1_200);

        source.script(|s| s.bandwidth = BandwidthReading { upload: 100, download: 100 });
        syncer.run_cycle_at(SyncTask::Status, hour(2)).await.unwrap();
        let meta = syncer.ledger().last_metadata().unwrap();
        assert_eq!(meta.upload_bandwidth, 1_200);
        assert_eq!(meta.download_bandwidth, 2_000);

        let status = syncer.ledger().status(hour(2)).unwrap();
        assert_eq!(status.bandwidth_usage.upload, 200);
    }

    #[tokio::test]
    async fn test_status_sync_keeps_contract_figures() {
        let source = ScriptedSource::new(healthy_host());
        let syncer = test_syncer(source, EngineConfig::default());

        syncer.run_cycle_at(SyncTask::Contracts, hour(10)).await.unwrap();
        syncer.run_cycle_at(SyncTask::Status, hour(10)).await.unwrap();

        let meta = syncer.ledger().last_metadata().unwrap();
        assert_eq!(meta.failed_contracts, 1);
        assert_eq!(meta.burnt_collateral, currency(60));
        assert_eq!(meta.first_seen, hour(-5));
    }

    #[tokio::test]
    async fn test_connectivity_issues_become_alerts() {
        let mut state = healthy_host();
        state.connectivity = ConnectivityReport {
            connected: false,
            errors: vec![ConnectivityIssue {
                severity: AlertSeverity::Severe,
                message: "port 9982 is closed".into(),
            }],
        };
        let source = ScriptedSource::new(state);
        let syncer = test_syncer(source.clone(), EngineConfig::default());

        syncer.run_cycle_at(SyncTask::Connectivity, hour(1)).await.unwrap();
        let alerts = syncer.ledger().alerts();
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].text, "port 9982 is closed");
        assert!(!syncer.ledger().status_cache().get().connectable);

        source.script(|s| s.connectivity = ConnectivityReport::unchecked());
        syncer.run_cycle_at(SyncTask::Connectivity, hour(2)).await.unwrap();
        assert!(syncer.ledger().alerts().is_empty());
        assert!(syncer.ledger().status_cache().get().connectable);
    }

    #[tokio::test]
    async fn test_totals_report() {
        let source = ScriptedSource::new(healthy_host());
        let syncer = test_syncer(source, EngineConfig::default());
        syncer.run_cycle_at(SyncTask::Contracts, hour(10)).await.unwrap();

        let totals = syncer.ledger().totals(hour(10)).unwrap();
        assert_eq!(totals.day.failed_contracts, 1);
        assert_eq!(totals.year.failed_contracts, 1);
        assert_eq!(totals.total.failed_contracts, 1);
    }

    #[tokio::test]
    async fn test_run_periodic_stops_on_cancel() {
        let source = ScriptedSource::new(healthy_host());
        let syncer = test_syncer(source, EngineConfig::default());
        let token = CancellationToken::new();

        let handle = tokio::spawn(run_periodic(syncer.clone(), SyncTask::Status, token.clone()));
        tokio::time::sleep(Duration::from_millis(50)).await;
        token.cancel();

        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
        assert!(syncer.ledger().status_cache().get().online);
    }

    #[tokio::test]
    async fn test_engine_shuts_down_and_flushes() {
        let source = ScriptedSource::new(healthy_host());
        let engine = Arc::new(Engine::with_parts(EngineConfig::default(), temp_db(), source));
        let token = engine.shutdown_token();

        let handle = tokio::spawn({
            let engine = engine.clone();
            async move { engine.run().await }
        });
        tokio::time::sleep(Duration::from_millis(100)).await;
        token.cancel();

        let result = tokio::time::timeout(Duration::from_secs(10), handle)
            .await
            .unwrap()
            .unwrap();
        assert!(result.is_ok());
        assert_eq!(failed_total_for(engine.ledger()), 1);
    }

    fn failed_total_for(ledger: &HostLedger) -> u64 {
        ledger
            .snapshot_range(hour(-10_000), Utc::now() + ChronoDuration::days(1))
            .unwrap()
            .iter()
            .map(|s| s.failed_contracts)
            .sum()
    }

    #[test]
    fn test_query_range_defaults() {
        let now = hour(100);
        assert_eq!(query_range(None, None, 30, now), (now - ChronoDuration::days(30), now));
        assert_eq!(
            query_range(Some(DAY0), Some(DAY0 + 60), 30, now),
            (ts(DAY0), ts(DAY0 + 60))
        );
    }
}
