//! Endpoint change classifier with flap suppression
//!
//! Consumes leaf callbacks for the whole registration namespace and turns
//! raw churn into module lifecycle alarms:
//!
//! ```text
//!   raw Lost ──▶ flap pool (suppressed) ──┬── Added within window ──▶ BackOnline
//!                                         └── window elapsed (sweep) ──▶ Lost
//!   raw Added ──────────────────────────────────────────────────────▶ Added
//! ```
//!
//! The sweeper is the only path that produces a true Lost alarm. A gray
//! period after startup suppresses everything while the tree is first
//! populated.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use handlebars::Handlebars;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::alarm::{AlarmError, AlarmOptions, AlarmResult, AlarmSeverity, AlarmSink, AlarmSource};
use crate::coordination::{base_name, is_within, LeafHandler};
use crate::metrics;
use crate::models::RegistrationEntry;

/// Raw change type as seen by the tree watcher
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RawEvent {
    Added,
    Updated,
    Lost,
}

/// Effective, externally meaningful event type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Added,
    Updated,
    Lost,
    BackOnline,
}

impl EventKind {
    pub const ALL: [EventKind; 4] = [Self::Added, Self::Updated, Self::Lost, Self::BackOnline];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Added => "added",
            Self::Updated => "updated",
            Self::Lost => "lost",
            Self::BackOnline => "back_online",
        }
    }

    /// Alarm name used when this event is emitted
    pub fn alarm_name(&self) -> &'static str {
        match self {
            Self::Added => "module_added",
            Self::Updated => "module_updated",
            Self::Lost => "module_lost",
            Self::BackOnline => "module_back_online",
        }
    }

    fn severity(&self) -> AlarmSeverity {
        match self {
            Self::Lost => AlarmSeverity::Critical,
            Self::BackOnline => AlarmSeverity::Warning,
            Self::Added | Self::Updated => AlarmSeverity::Info,
        }
    }

    fn default_template(&self) -> &'static str {
        match self {
            Self::Added => {
                "[{{cluster}}] {{module}} instance {{ip}}:{{port}} registered (host {{hostname}}, version {{version}})"
            }
            Self::Updated => "[{{cluster}}] {{module}} instance {{ip}}:{{port}} registration updated (version {{version}})",
            Self::Lost => {
                "[{{cluster}}] {{module}} instance {{ip}}:{{port}} lost for more than {{window_secs}}s (host {{hostname}}, pid {{pid}})"
            }
            Self::BackOnline => {
                "[{{cluster}}] {{module}} instance {{ip}}:{{port}} dropped out and came back within {{window_secs}}s"
            }
        }
    }
}

/// Receiver routing for one logical sub-tree
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AlarmRoute {
    /// Branch prefix this route covers
    pub prefix: String,
    pub category: String,
    #[serde(default)]
    pub receivers: Vec<String>,
}

impl AlarmRoute {
    pub fn new(prefix: impl Into<String>, category: impl Into<String>, receivers: Vec<String>) -> Self {
        Self {
            prefix: prefix.into(),
            category: category.into(),
            receivers,
        }
    }
}

/// Classifier settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClassifierConfig {
    /// Lost observations younger than this collapse into BackOnline
    pub flap_window_secs: u64,
    /// Suppress every alarm this long after startup
    pub gray_period_secs: u64,
    pub sweep_interval_secs: u64,
    /// Upper bound of outstanding Lost observations
    pub max_flap_entries: usize,
    /// Emit alarms for registration updates
    pub notify_updates: bool,
    /// Most specific prefix wins
    pub routes: Vec<AlarmRoute>,
    /// Route for branches no prefix covers
    pub default_route: AlarmRoute,
    /// Message template overrides keyed by event kind (`lost`, `back_online`, ...)
    pub templates: HashMap<String, String>,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            flap_window_secs: 60,
            gray_period_secs: 300,
            sweep_interval_secs: 5,
            max_flap_entries: 10_000,
            notify_updates: false,
            routes: vec![AlarmRoute::new("/lb", "lb", Vec::new())],
            default_route: AlarmRoute::new("/", "module", Vec::new()),
            templates: HashMap::new(),
        }
    }
}

impl ClassifierConfig {
    pub fn flap_window(&self) -> Duration {
        Duration::from_secs(self.flap_window_secs)
    }

    pub fn gray_period(&self) -> Duration {
        Duration::from_secs(self.gray_period_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

/// A Lost observation waiting for its window to elapse
#[derive(Debug, Clone, PartialEq)]
pub struct FlapEntry {
    pub branch: String,
    pub leaf: String,
    pub first_seen_lost: Instant,
    pub entry: RegistrationEntry,
}

/// Outcome of [`EndpointClassifier::filter`]
#[derive(Debug, Clone, PartialEq)]
pub struct Classification {
    pub suppress: bool,
    pub kind: EventKind,
    /// A stale Lost observation found on re-add; emitted before `kind`
    pub overdue: Option<FlapEntry>,
}

impl Classification {
    fn emit(kind: EventKind) -> Self {
        Self {
            suppress: false,
            kind,
            overdue: None,
        }
    }

    fn suppress(kind: EventKind) -> Self {
        Self {
            suppress: true,
            kind,
            overdue: None,
        }
    }
}

/// Flap-suppressing endpoint classifier
pub struct EndpointClassifier {
    config: ClassifierConfig,
    flap_window: Duration,
    sink: Arc<dyn AlarmSink>,
    templates: Handlebars<'static>,
    pool: Mutex<HashMap<String, FlapEntry>>,
    started: Instant,
}

impl EndpointClassifier {
    pub fn new(config: ClassifierConfig, sink: Arc<dyn AlarmSink>) -> AlarmResult<Self> {
        let mut templates = Handlebars::new();
        templates.register_escape_fn(handlebars::no_escape);
        for kind in EventKind::ALL {
            let source = config
                .templates
                .get(kind.as_str())
                .map(String::as_str)
                .unwrap_or_else(|| kind.default_template());
            templates
                .register_template_string(kind.as_str(), source)
                .map_err(|e| AlarmError::Template(format!("{}: {e}", kind.as_str())))?;
        }

        Ok(Self {
            flap_window: config.flap_window(),
            config,
            sink,
            templates,
            pool: Mutex::new(HashMap::new()),
            started: Instant::now(),
        })
    }

    fn lock_pool(&self) -> MutexGuard<'_, HashMap<String, FlapEntry>> {
        self.pool.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Number of outstanding Lost observations
    pub fn pending(&self) -> usize {
        self.lock_pool().len()
    }

    pub fn in_gray_period(&self, now: Instant) -> bool {
        now < self.started + self.config.gray_period()
    }

    fn flap_key(branch: &str, entry: &RegistrationEntry) -> String {
        format!("{branch}/{}:{}", entry.ip, entry.port)
    }

    /// Classify one raw observation
    pub fn filter(&self, branch: &str, leaf: &str, raw: RawEvent, entry: &RegistrationEntry, now: Instant) -> Classification {
        let naive = match raw {
            RawEvent::Added => EventKind::Added,
            RawEvent::Updated => EventKind::Updated,
            RawEvent::Lost => EventKind::Lost,
        };
        if self.in_gray_period(now) {
            return Classification::suppress(naive);
        }

        let key = Self::flap_key(branch, entry);
        let mut pool = self.lock_pool();
        let classification = match raw {
            RawEvent::Lost => {
                if pool.contains_key(&key) {
                    Classification::suppress(EventKind::Lost)
                } else if pool.len() >= self.config.max_flap_entries {
                    warn!(key = %key, "Flap pool full, emitting lost immediately");
                    Classification::emit(EventKind::Lost)
                } else {
                    pool.insert(
                        key,
                        FlapEntry {
                            branch: branch.to_string(),
                            leaf: leaf.to_string(),
                            first_seen_lost: now,
                            entry: entry.clone(),
                        },
                    );
                    Classification::suppress(EventKind::Lost)
                }
            }
            RawEvent::Added => match pool.remove(&key) {
                Some(flap) if now.duration_since(flap.first_seen_lost) < self.flap_window => {
                    Classification::emit(EventKind::BackOnline)
                }
                // The sweeper has not caught up with this one yet
                Some(flap) => Classification {
                    suppress: false,
                    kind: EventKind::Added,
                    overdue: Some(flap),
                },
                None => Classification::emit(EventKind::Added),
            },
            RawEvent::Updated => Classification {
                suppress: !self.config.notify_updates,
                kind: EventKind::Updated,
                overdue: None,
            },
        };
        metrics::set_flap_pool_size(pool.len());
        classification
    }

    /// Remove and return every entry whose window elapsed by `now`
    pub fn sweep_at(&self, now: Instant) -> Vec<FlapEntry> {
        let mut pool = self.lock_pool();
        let expired: Vec<String> = pool
            .iter()
            .filter(|(_, flap)| now.duration_since(flap.first_seen_lost) >= self.flap_window)
            .map(|(key, _)| key.clone())
            .collect();
        let mut overdue: Vec<FlapEntry> = expired.iter().filter_map(|key| pool.remove(key)).collect();
        metrics::set_flap_pool_size(pool.len());
        drop(pool);

        overdue.sort_by_key(|flap| flap.first_seen_lost);
        overdue
    }

    /// Emit the deferred Lost alarms due at `now`
    pub async fn sweep(&self, now: Instant) -> usize {
        let overdue = self.sweep_at(now);
        for flap in &overdue {
            self.emit(EventKind::Lost, &flap.branch, &flap.leaf, &flap.entry).await;
        }
        overdue.len()
    }

    /// Sweeper loop; returns when `cancel` fires
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.config.sweep_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(
            window_secs = self.config.flap_window_secs,
            gray_secs = self.config.gray_period_secs,
            "Flap sweeper started"
        );

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let emitted = self.sweep(Instant::now()).await;
                    if emitted > 0 {
                        debug!(emitted, "Flap sweep emitted lost alarms");
                    }
                }
            }
        }
        info!("Flap sweeper stopped");
    }

    fn route(&self, branch: &str) -> &AlarmRoute {
        self.config
            .routes
            .iter()
            .filter(|route| is_within(branch, &route.prefix))
            .max_by_key(|route| route.prefix.len())
            .unwrap_or(&self.config.default_route)
    }

    /// Render the message for `kind`
    pub fn render(&self, kind: EventKind, branch: &str, entry: &RegistrationEntry) -> AlarmResult<String> {
        let data = json!({
            "kind": kind.as_str(),
            "branch": branch,
            "module": base_name(branch),
            "cluster": entry.cluster_tag,
            "ip": entry.ip,
            "port": entry.port,
            "hostname": entry.hostname,
            "version": entry.version,
            "pid": entry.pid,
            "window_secs": self.config.flap_window_secs,
        });
        self.templates
            .render(kind.as_str(), &data)
            .map_err(|e| AlarmError::Template(e.to_string()))
    }

    async fn emit(&self, kind: EventKind, branch: &str, leaf: &str, entry: &RegistrationEntry) {
        let message = match self.render(kind, branch, entry) {
            Ok(message) => message,
            Err(e) => {
                warn!(branch = %branch, leaf = %leaf, error = %e, "Failed to render alarm message");
                return;
            }
        };

        let route = self.route(branch);
        let options = AlarmOptions::new(kind.alarm_name(), &entry.cluster_tag, base_name(branch), leaf, message)
            .with_category(&route.category)
            .with_receivers(route.receivers.clone())
            .with_severity(kind.severity())
            .with_dedup_key(format!("{}:{branch}/{leaf}", kind.alarm_name()));

        let result = self.sink.send_alarm(&options, AlarmSource::Classifier).await;
        metrics::record_classification(kind.as_str(), "emitted");
        metrics::record_alarm(AlarmSource::Classifier.as_str(), kind.alarm_name(), result.is_ok());
        match result {
            Ok(()) => info!(branch = %branch, leaf = %leaf, kind = kind.as_str(), "Endpoint alarm emitted"),
            Err(e) => warn!(branch = %branch, leaf = %leaf, error = %e, "Failed to send endpoint alarm"),
        }
    }

    async fn observe(&self, branch: &str, leaf: &str, raw: RawEvent, value: &[u8]) {
        let entry = match RegistrationEntry::from_bytes(value) {
            Ok(entry) => entry,
            Err(e) => {
                warn!(branch = %branch, leaf = %leaf, error = %e, "Dropping malformed registration entry");
                return;
            }
        };

        let classification = self.filter(branch, leaf, raw, &entry, Instant::now());
        if let Some(flap) = &classification.overdue {
            self.emit(EventKind::Lost, &flap.branch, &flap.leaf, &flap.entry).await;
        }
        if classification.suppress {
            debug!(branch = %branch, leaf = %leaf, kind = classification.kind.as_str(), "Endpoint event suppressed");
            metrics::record_classification(classification.kind.as_str(), "suppressed");
        } else {
            self.emit(classification.kind, branch, leaf, &entry).await;
        }
    }
}

#[async_trait]
impl LeafHandler for EndpointClassifier {
    async fn on_add_leaf(&self, branch: &str, leaf: &str, value: &[u8]) {
        self.observe(branch, leaf, RawEvent::Added, value).await;
    }

    async fn on_update_leaf(&self, branch: &str, leaf: &str, _old: &[u8], new: &[u8]) {
        self.observe(branch, leaf, RawEvent::Updated, new).await;
    }

    async fn on_delete_leaf(&self, branch: &str, leaf: &str, value: &[u8]) {
        self.observe(branch, leaf, RawEvent::Lost, value).await;
    }
}
