//! TOML configuration.
//!
//! Keys are kebab-case throughout (`batch-size`, `poll-interval-ms`), so the
//! sweep settings read as `sink.note-index.minor.cron`. Every section except
//! `[db]` and `[search]` has defaults.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use chrono::{FixedOffset, Utc};
use notesync_core::cron::CronSchedule;
use notesync_core::{Cadence, IndexKind, WindowPolicy};
use serde::Deserialize;

use crate::handlers::HandlerKind;

#[derive(Debug, Deserialize, Clone)]
#[serde(rename_all = "kebab-case")]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub decoder: DecoderConfig,
    #[serde(default)]
    pub topics: TopicsConfig,
    #[serde(default)]
    pub consumer: ConsumerConfig,
    /// Explicit consumer groups. Empty means one group per handler kind.
    #[serde(default)]
    pub consumers: Vec<ConsumerBinding>,
    pub search: SearchConfig,
    #[serde(default)]
    pub sink: SinkConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(rename_all = "kebab-case")]
pub struct DecoderConfig {
    /// Fixed UTC offset all decoded instants are projected into, e.g. `+09:00`.
    #[serde(default = "default_zone")]
    pub zone: String,
}

impl Default for DecoderConfig {
    fn default() -> Self {
        Self {
            zone: default_zone(),
        }
    }
}

fn default_zone() -> String {
    "+00:00".to_string()
}

impl DecoderConfig {
    pub fn offset(&self) -> Result<FixedOffset> {
        parse_zone(&self.zone)
    }
}

/// Parse `Z`, `UTC` or a `±HH:MM` offset.
pub fn parse_zone(raw: &str) -> Result<FixedOffset> {
    let raw = raw.trim();
    if raw.eq_ignore_ascii_case("z") || raw.eq_ignore_ascii_case("utc") {
        return FixedOffset::east_opt(0).context("zero offset");
    }
    raw.parse::<FixedOffset>()
        .map_err(|e| anyhow::anyhow!("invalid decoder.zone '{}': {}", raw, e))
}

#[derive(Debug, Deserialize, Clone)]
#[serde(rename_all = "kebab-case")]
pub struct TopicsConfig {
    #[serde(default = "default_domain")]
    pub domain: String,
    #[serde(default = "default_note_cdc")]
    pub note_cdc: String,
    #[serde(default = "default_withdraw")]
    pub withdraw: String,
}

impl Default for TopicsConfig {
    fn default() -> Self {
        Self {
            domain: default_domain(),
            note_cdc: default_note_cdc(),
            withdraw: default_withdraw(),
        }
    }
}

fn default_domain() -> String {
    "notes".to_string()
}
fn default_note_cdc() -> String {
    "cdc.notes".to_string()
}
fn default_withdraw() -> String {
    "user.withdraw.requested".to_string()
}

impl TopicsConfig {
    pub fn note_created(&self) -> String {
        format!("{}.note.created", self.domain)
    }

    pub fn note_deleted(&self) -> String {
        format!("{}.note.deleted", self.domain)
    }

    /// The topic a handler kind reads when its binding names none.
    pub fn default_for(&self, kind: HandlerKind) -> String {
        match kind {
            HandlerKind::NoteSync => self.note_cdc.clone(),
            HandlerKind::NoteCreated => self.note_created(),
            HandlerKind::NoteDeleted => self.note_deleted(),
            HandlerKind::WithdrawNotes
            | HandlerKind::WithdrawNoteIndex
            | HandlerKind::WithdrawFieldIndex => self.withdraw.clone(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(rename_all = "kebab-case")]
pub struct ConsumerConfig {
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_max_poll_records")]
    pub max_poll_records: usize,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
            max_poll_records: default_max_poll_records(),
        }
    }
}

fn default_poll_interval_ms() -> u64 {
    500
}
fn default_max_poll_records() -> usize {
    100
}

#[derive(Debug, Deserialize, Clone)]
#[serde(rename_all = "kebab-case")]
pub struct ConsumerBinding {
    pub group: String,
    #[serde(default)]
    pub topic: Option<String>,
    pub handler: String,
}

/// A consumer binding with its handler kind and topic resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedConsumer {
    pub group: String,
    pub topic: String,
    pub kind: HandlerKind,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(rename_all = "kebab-case")]
pub struct SearchConfig {
    pub url: String,
    /// Name of the environment variable holding the API key.
    #[serde(default)]
    pub api_key_env: Option<String>,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_note_index")]
    pub note_index: String,
    #[serde(default = "default_field_index")]
    pub field_index: String,
    /// Interval between task status polls after a write.
    #[serde(default = "default_task_poll_ms")]
    pub task_poll_ms: u64,
    /// How long a write may wait for its task before it counts as failed.
    #[serde(default = "default_task_timeout_secs")]
    pub task_timeout_secs: u64,
}

fn default_timeout_secs() -> u64 {
    30
}
fn default_max_retries() -> u32 {
    3
}
fn default_note_index() -> String {
    "notes".to_string()
}
fn default_field_index() -> String {
    "note-fields".to_string()
}
fn default_task_poll_ms() -> u64 {
    100
}
fn default_task_timeout_secs() -> u64 {
    60
}

impl SearchConfig {
    /// Engine index uid for an index kind.
    pub fn index_uid(&self, kind: IndexKind) -> &str {
        match kind {
            IndexKind::Note => &self.note_index,
            IndexKind::Field => &self.field_index,
        }
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(rename_all = "kebab-case")]
pub struct SinkConfig {
    #[serde(default)]
    pub window: WindowConfig,
    #[serde(default)]
    pub note_index: IndexJobs,
    #[serde(default)]
    pub field_index: IndexJobs,
}

impl SinkConfig {
    pub fn job(&self, index: IndexKind, cadence: Cadence) -> &JobConfig {
        let jobs = match index {
            IndexKind::Note => &self.note_index,
            IndexKind::Field => &self.field_index,
        };
        match cadence {
            Cadence::Minor => &jobs.minor,
            Cadence::Major => &jobs.major,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(rename_all = "kebab-case")]
pub struct WindowConfig {
    #[serde(default = "default_safety_buffer")]
    pub safety_buffer_minutes: i64,
    #[serde(default = "default_minor_span")]
    pub minor_span_minutes: i64,
    #[serde(default = "default_major_lag")]
    pub major_lag_minutes: i64,
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            safety_buffer_minutes: default_safety_buffer(),
            minor_span_minutes: default_minor_span(),
            major_lag_minutes: default_major_lag(),
        }
    }
}

fn default_safety_buffer() -> i64 {
    10
}
fn default_minor_span() -> i64 {
    60
}
fn default_major_lag() -> i64 {
    130
}

impl WindowConfig {
    pub fn policy(&self) -> WindowPolicy {
        WindowPolicy::from_minutes(
            self.safety_buffer_minutes,
            self.minor_span_minutes,
            self.major_lag_minutes,
        )
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(rename_all = "kebab-case")]
pub struct IndexJobs {
    #[serde(default = "default_minor_job")]
    pub minor: JobConfig,
    #[serde(default = "default_major_job")]
    pub major: JobConfig,
}

impl Default for IndexJobs {
    fn default() -> Self {
        Self {
            minor: default_minor_job(),
            major: default_major_job(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(rename_all = "kebab-case")]
pub struct JobConfig {
    pub cron: String,
    #[serde(default = "default_job_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_minor_job() -> JobConfig {
    JobConfig {
        cron: "0 5 * * * *".to_string(),
        batch_size: 500,
        enabled: true,
    }
}
fn default_major_job() -> JobConfig {
    JobConfig {
        cron: "0 15 3 * * *".to_string(),
        batch_size: 1000,
        enabled: true,
    }
}
fn default_job_batch_size() -> usize {
    500
}
fn default_enabled() -> bool {
    true
}

impl Config {
    /// Consumer groups to run, with handler kinds resolved and topics filled in.
    pub fn resolved_consumers(&self) -> Result<Vec<ResolvedConsumer>> {
        if self.consumers.is_empty() {
            return Ok(HandlerKind::ALL
                .iter()
                .map(|kind| ResolvedConsumer {
                    group: kind.as_str().to_string(),
                    topic: self.topics.default_for(*kind),
                    kind: *kind,
                })
                .collect());
        }
        self.consumers
            .iter()
            .map(|b| {
                let kind: HandlerKind = b
                    .handler
                    .parse()
                    .with_context(|| format!("consumer group '{}'", b.group))?;
                Ok(ResolvedConsumer {
                    group: b.group.clone(),
                    topic: b
                        .topic
                        .clone()
                        .unwrap_or_else(|| self.topics.default_for(kind)),
                    kind,
                })
            })
            .collect()
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;

    validate(&config)?;
    Ok(config)
}

pub fn validate(config: &Config) -> Result<()> {
    config.decoder.offset()?;

    if config.search.url.trim().is_empty() {
        bail!("search.url must not be empty");
    }
    if config.search.note_index == config.search.field_index {
        bail!("search.note-index and search.field-index must name different indexes");
    }

    if config.consumer.max_poll_records == 0 {
        bail!("consumer.max-poll-records must be > 0");
    }
    if config.consumer.poll_interval_ms == 0 {
        bail!("consumer.poll-interval-ms must be > 0");
    }

    let consumers = config.resolved_consumers()?;
    let mut seen = HashSet::new();
    for c in &consumers {
        if !seen.insert((c.group.as_str(), c.topic.as_str())) {
            bail!(
                "consumer group '{}' is bound to topic '{}' more than once",
                c.group,
                c.topic
            );
        }
    }

    if config.search.task_poll_ms == 0 {
        bail!("search.task-poll-ms must be > 0");
    }

    config
        .sink
        .window
        .policy()
        .validate()
        .context("invalid sink.window")?;

    let now = Utc::now().with_timezone(&config.decoder.offset()?);
    for index in IndexKind::ALL {
        for cadence in [Cadence::Minor, Cadence::Major] {
            let job = config.sink.job(index, cadence);
            if job.batch_size == 0 {
                bail!("sink.{}-index.{}.batch-size must be > 0", index, cadence);
            }
            CronSchedule::parse(&job.cron)
                .and_then(|schedule| schedule.next_after(&now))
                .with_context(|| format!("invalid sink.{}-index.{}.cron", index, cadence))?;
        }
    }

    Ok(())
}
