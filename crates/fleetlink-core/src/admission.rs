//! Connection admission control.
//!
//! Gates socket accepts and identity binds per source address: attempt
//! rate windows, soft-bans with time decay, a per-source device cap, and
//! optional allow-lists for sources and identities. State is created
//! lazily on first observation and pruned by a periodic sweep once a
//! source has no bound devices, no live window, and no active ban.
//!
//! Time is always passed in as a parameter, so every policy is testable
//! with synthetic instants. Critical sections only touch the maps - no
//! I/O, nothing held across an await.

use std::{
    collections::{HashMap, HashSet},
    net::IpAddr,
    sync::{Mutex, PoisonError},
    time::{Duration, Instant},
};

use thiserror::Error;

/// Why admission refused a connection or a bind.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum DenyReason {
    /// Source is under an active soft-ban.
    #[error("source is banned")]
    Banned,

    /// Source allow-list is enabled and does not contain this source.
    #[error("source is not allowed")]
    NotAllowed,

    /// Too many connection attempts inside the rate window.
    #[error("too many attempts from source")]
    TooManyAttempts,

    /// Source already has the maximum number of devices bound.
    #[error("per-source device cap reached")]
    PerSourceCap,
}

impl DenyReason {
    /// Stable lowercase token for logs and events.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Banned => "banned",
            Self::NotAllowed => "not_allowed",
            Self::TooManyAttempts => "too_many_attempts",
            Self::PerSourceCap => "per_source_cap",
        }
    }
}

/// Admission policy knobs. Mutable at runtime through
/// [`AdmissionController::update`].
#[derive(Debug, Clone)]
pub struct AdmissionConfig {
    /// Length of the per-source attempt window.
    pub rate_window: Duration,
    /// Attempts allowed inside one window before a soft-ban.
    pub max_attempts_per_window: u32,
    /// Devices one source address may have bound at once.
    pub max_devices_per_source: usize,
    /// How long a soft-ban lasts.
    pub soft_ban: Duration,
    /// Whether the identity allow-list is consulted. An enabled empty
    /// list denies every identity.
    pub imei_allow_enabled: bool,
    /// Identities allowed to bind when the list is enabled.
    pub imei_allow_list: HashSet<String>,
    /// Whether the source allow-list is consulted. An enabled empty list
    /// denies every source.
    pub source_allow_enabled: bool,
    /// Source addresses (textual IPs) allowed when the list is enabled.
    pub source_allow_list: HashSet<String>,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            rate_window: Duration::from_millis(300_000),
            max_attempts_per_window: 5,
            max_devices_per_source: 10,
            soft_ban: Duration::from_millis(3_600_000),
            imei_allow_enabled: false,
            imei_allow_list: HashSet::new(),
            source_allow_enabled: false,
            source_allow_list: HashSet::new(),
        }
    }
}

/// Partial configuration change; `None` fields keep their current value.
#[derive(Debug, Clone, Default)]
pub struct AdmissionUpdate {
    /// New rate window.
    pub rate_window: Option<Duration>,
    /// New attempt limit.
    pub max_attempts_per_window: Option<u32>,
    /// New per-source device cap.
    pub max_devices_per_source: Option<usize>,
    /// New soft-ban length.
    pub soft_ban: Option<Duration>,
    /// Toggle the identity allow-list.
    pub imei_allow_enabled: Option<bool>,
    /// Replace the identity allow-list.
    pub imei_allow_list: Option<HashSet<String>>,
    /// Toggle the source allow-list.
    pub source_allow_enabled: Option<bool>,
    /// Replace the source allow-list.
    pub source_allow_list: Option<HashSet<String>>,
}

/// Book-keeping for one source address.
#[derive(Debug)]
struct SourceState {
    window_start: Instant,
    attempts: u32,
    banned_until: Option<Instant>,
    bound: HashSet<String>,
}

impl SourceState {
    fn new(now: Instant) -> Self {
        Self { window_start: now, attempts: 0, banned_until: None, bound: HashSet::new() }
    }

    fn ban_active(&self, now: Instant) -> bool {
        self.banned_until.is_some_and(|until| now < until)
    }
}

/// Admission controller shared by the listener and every session.
///
/// Readers always see a consistent configuration snapshot; updates swap
/// fields atomically under the config lock.
#[derive(Debug)]
pub struct AdmissionController {
    config: Mutex<AdmissionConfig>,
    sources: Mutex<HashMap<IpAddr, SourceState>>,
}

impl AdmissionController {
    /// Create a controller with the given policy.
    #[must_use]
    pub fn new(config: AdmissionConfig) -> Self {
        Self { config: Mutex::new(config), sources: Mutex::new(HashMap::new()) }
    }

    /// Current configuration snapshot.
    #[must_use]
    pub fn config(&self) -> AdmissionConfig {
        self.config.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Apply a partial configuration change.
    pub fn update(&self, update: AdmissionUpdate) {
        let mut cfg = self.config.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(v) = update.rate_window {
            cfg.rate_window = v;
        }
        if let Some(v) = update.max_attempts_per_window {
            cfg.max_attempts_per_window = v;
        }
        if let Some(v) = update.max_devices_per_source {
            cfg.max_devices_per_source = v;
        }
        if let Some(v) = update.soft_ban {
            cfg.soft_ban = v;
        }
        if let Some(v) = update.imei_allow_enabled {
            cfg.imei_allow_enabled = v;
        }
        if let Some(v) = update.imei_allow_list {
            cfg.imei_allow_list = v;
        }
        if let Some(v) = update.source_allow_enabled {
            cfg.source_allow_enabled = v;
        }
        if let Some(v) = update.source_allow_list {
            cfg.source_allow_list = v;
        }
    }

    /// Whether an identity passes the allow-list policy.
    #[must_use]
    pub fn imei_allowed(&self, imei: &str) -> bool {
        let cfg = self.config.lock().unwrap_or_else(PoisonError::into_inner);
        !cfg.imei_allow_enabled || cfg.imei_allow_list.contains(imei)
    }

    /// Gate a new connection from `source`.
    ///
    /// Order matters: an active ban wins, then the source allow-list, then
    /// the rolled attempt window. Allowed opens count one attempt;
    /// allow-list denials do not.
    pub fn evaluate_open(&self, source: IpAddr, now: Instant) -> Result<(), DenyReason> {
        let cfg = self.config();

        let mut sources = self.sources.lock().unwrap_or_else(PoisonError::into_inner);
        let entry = sources.entry(source).or_insert_with(|| SourceState::new(now));

        if let Some(until) = entry.banned_until {
            if now < until {
                return Err(DenyReason::Banned);
            }
            entry.banned_until = None;
        }

        if cfg.source_allow_enabled && !cfg.source_allow_list.contains(&source.to_string()) {
            return Err(DenyReason::NotAllowed);
        }

        if now.duration_since(entry.window_start) >= cfg.rate_window {
            entry.window_start = now;
            entry.attempts = 0;
        }

        if entry.attempts >= cfg.max_attempts_per_window {
            entry.banned_until = Some(now + cfg.soft_ban);
            return Err(DenyReason::TooManyAttempts);
        }

        entry.attempts += 1;
        Ok(())
    }

    /// Gate binding `imei` from `source`. Success records the identity and
    /// resets the source's attempt counter.
    pub fn evaluate_bind(
        &self,
        source: IpAddr,
        imei: &str,
        now: Instant,
    ) -> Result<(), DenyReason> {
        let cfg = self.config();

        let mut sources = self.sources.lock().unwrap_or_else(PoisonError::into_inner);
        let entry = sources.entry(source).or_insert_with(|| SourceState::new(now));

        if !entry.bound.contains(imei) && entry.bound.len() >= cfg.max_devices_per_source {
            return Err(DenyReason::PerSourceCap);
        }

        entry.bound.insert(imei.to_string());
        entry.attempts = 0;
        Ok(())
    }

    /// Release a bound identity. The source entry is discarded once it
    /// has no devices, no live window, and no active ban.
    pub fn release(&self, source: IpAddr, imei: &str, now: Instant) {
        let cfg = self.config();

        let mut sources = self.sources.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(entry) = sources.get_mut(&source) {
            entry.bound.remove(imei);

            let window_expired = now.duration_since(entry.window_start) >= cfg.rate_window;
            if entry.bound.is_empty() && window_expired && !entry.ban_active(now) {
                sources.remove(&source);
            }
        }
    }

    /// Prune sources with no devices, expired windows, and expired bans.
    /// Returns how many entries were discarded.
    pub fn sweep(&self, now: Instant) -> usize {
        let cfg = self.config();

        let mut sources = self.sources.lock().unwrap_or_else(PoisonError::into_inner);
        let before = sources.len();
        sources.retain(|_, entry| {
            if entry.banned_until.is_some_and(|until| now >= until) {
                entry.banned_until = None;
            }
            let window_live = now.duration_since(entry.window_start) < cfg.rate_window;
            !entry.bound.is_empty() || window_live || entry.banned_until.is_some()
        });
        before - sources.len()
    }

    /// Number of tracked source addresses.
    #[must_use]
    pub fn tracked_sources(&self) -> usize {
        self.sources.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}
