//! Field-transfer dispatcher: a store of named field values feeding
//! configured publish jobs ("transfers") on a message bus.
//!
//! Transfers subscribe to field keys; fields keep back-references to
//! their transfers by index into the dispatcher's transfer list, so
//! there are no ownership cycles. The dispatcher is single-owner: the
//! reader context hands decoded field batches to whatever thread owns
//! it (typically over a channel), and that thread also drives
//! [`Dispatcher::tick`].

mod plugin;
mod transfer;

pub use plugin::{Plugin, PluginRegistry, SolarPower};
pub use transfer::{ContentItem, Transfer, Trigger};

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Local, SecondsFormat};
use log::{debug, warn};

use crate::config::{PluginConfig, TransferConfig};
use crate::mqtt::Publisher;
use crate::stats::{allocated_bytes, CommStats};
use crate::value::Value;

/// Set of errors that can occur while building the dispatcher.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    /// A plugin module is not in the registry, or a transfer references
    /// a plugin name that is not configured.
    #[error("unknown plugin: '{0}'")]
    UnknownPlugin(String),

    /// A transfer invokes a capability the plugin does not expose.
    #[error("plugin '{plugin}' has no function '{function}'")]
    UnknownPluginFunction { plugin: String, function: String },

    /// A heat-transfer medium specification is neither a known preset
    /// nor a usable parameter table.
    #[error("unknown medium specification: '{0}'")]
    UnknownMedium(String),

    /// A plugin rejected its configuration.
    #[error("plugin configuration error: {0}")]
    PluginConfig(String),
}

/// One stored field value with its bookkeeping flags.
#[derive(Debug)]
pub struct Field {
    value: Value,
    timestamp: Option<DateTime<Local>>,
    updated: bool,
    changed: bool,
    /// Indices into the dispatcher's transfer list.
    transfers: Vec<usize>,
}

impl Field {
    fn new() -> Field {
        Field {
            value: Value::Null,
            timestamp: None,
            updated: false,
            changed: false,
            transfers: Vec::new(),
        }
    }

    pub fn value(&self) -> &Value {
        &self.value
    }

    pub fn timestamp(&self) -> Option<DateTime<Local>> {
        self.timestamp
    }

    pub fn updated(&self) -> bool {
        self.updated
    }

    pub fn changed(&self) -> bool {
        self.changed
    }
}

pub(crate) struct PluginSlot {
    pub(crate) name: String,
    pub(crate) plugin: Box<dyn Plugin>,
}

/// The dispatcher.
pub struct Dispatcher {
    publisher: Arc<dyn Publisher>,
    topic_prefix: String,
    plugins: Vec<PluginSlot>,
    transfers: Vec<Transfer>,
    fields: HashMap<String, Field>,
    stats: Arc<CommStats>,
    started: DateTime<Local>,
}

impl Dispatcher {
    /// Builds the dispatcher: instantiates plugins through the
    /// registry, builds transfers, and installs every subscribed field
    /// key into the store. All resolution errors are construction-time
    /// errors.
    pub fn new(
        publisher: Arc<dyn Publisher>,
        topic_prefix: String,
        plugin_cfgs: &[PluginConfig],
        transfer_cfgs: &[TransferConfig],
        registry: &PluginRegistry,
        stats: Arc<CommStats>,
        now: DateTime<Local>,
    ) -> Result<Dispatcher, DispatchError> {
        let mut plugins = Vec::with_capacity(plugin_cfgs.len());
        for cfg in plugin_cfgs {
            plugins.push(PluginSlot {
                name: cfg.name.clone(),
                plugin: registry.construct(&cfg.module, &cfg.config)?,
            });
        }

        let mut transfers = Vec::with_capacity(transfer_cfgs.len());
        for cfg in transfer_cfgs {
            transfers.push(Transfer::from_config(cfg, &plugins, now)?);
        }

        let mut fields: HashMap<String, Field> = HashMap::new();
        for (idx, transfer) in transfers.iter().enumerate() {
            for key in transfer.subscriptions(&plugins) {
                let field = fields.entry(key).or_insert_with(Field::new);
                if !field.transfers.contains(&idx) {
                    field.transfers.push(idx);
                }
            }
        }

        Ok(Dispatcher {
            publisher,
            topic_prefix,
            plugins,
            transfers,
            fields,
            stats,
            started: now,
        })
    }

    /// Ingests a batch of decoded field values.
    ///
    /// Keys no transfer subscribes to are skipped. The observable order
    /// is fixed: values and flags first, then `updated` notifications
    /// over the affected transfers in transfer-list order, then the
    /// `changed` pass for transfers that saw an actual change, then all
    /// flags are cleared.
    pub fn update_fields(&mut self, values: &[(String, Value)], timestamp: DateTime<Local>) {
        let mut touched: Vec<String> = Vec::new();
        let mut updated_transfers: Vec<usize> = Vec::new();
        let mut changed_transfers: Vec<usize> = Vec::new();

        for (key, value) in values {
            let field = match self.fields.get_mut(key) {
                Some(field) => field,
                None => continue,
            };

            field.updated = true;
            field.timestamp = Some(timestamp);
            let changed = field.value != *value;
            if changed {
                field.changed = true;
                field.value = value.clone();
            }
            touched.push(key.clone());

            for &idx in &field.transfers {
                if !updated_transfers.contains(&idx) {
                    updated_transfers.push(idx);
                }
                if changed && !changed_transfers.contains(&idx) {
                    changed_transfers.push(idx);
                }
            }
        }

        updated_transfers.sort_unstable();
        changed_transfers.sort_unstable();

        for &idx in &updated_transfers {
            if self.transfers[idx].wants_update(&touched) {
                self.transmit(idx, timestamp);
            }
        }
        for &idx in &changed_transfers {
            if self.transfers[idx].wants_change(&touched) {
                self.transmit(idx, timestamp);
            }
        }

        for field in self.fields.values_mut() {
            field.updated = false;
            field.changed = false;
        }
    }

    /// Looks up a field.
    pub fn field(&self, key: &str) -> Option<&Field> {
        self.fields.get(key)
    }

    /// Current value of a field, or `Null` when the field is unknown or
    /// its value is older than `max_age` seconds.
    pub fn field_value(&self, key: &str, max_age: Option<f64>, now: DateTime<Local>) -> Value {
        let field = match self.fields.get(key) {
            Some(field) => field,
            None => return Value::Null,
        };
        match (max_age, field.timestamp) {
            (None, _) => field.value.clone(),
            (Some(limit), Some(ts)) if age_seconds(ts, now) <= limit => field.value.clone(),
            _ => Value::Null,
        }
    }

    /// Runs due interval transfers and plugin housekeeping. Returns the
    /// earliest wall-clock instant at which anything wants to run
    /// again, or `None` when nothing is scheduled.
    pub fn tick(&mut self, now: DateTime<Local>) -> Option<DateTime<Local>> {
        let mut next: Option<DateTime<Local>> = None;

        for slot in &mut self.plugins {
            merge_next(&mut next, slot.plugin.tick(now));
        }

        for idx in 0..self.transfers.len() {
            let (fire, transfer_next) = self.transfers[idx].trigger_tick(now);
            if fire {
                self.transmit(idx, now);
            }
            merge_next(&mut next, transfer_next);
        }

        next
    }

    /// Resolves a dispatcher-level metafield.
    pub fn metafield(&self, name: &str, now: DateTime<Local>) -> Value {
        match name {
            "sw:ramuse" => Value::Int(allocated_bytes() as i64),
            "sw:pid" => Value::Int(std::process::id() as i64),
            "sw:uptime" => Value::Int((now - self.started).num_seconds()),
            "time:now" => Value::Text(iso8601(now)),
            "comm:rxmsg_cnt" => Value::Int(self.stats.rxmsg_cnt() as i64),
            "comm:rxmsg_last" => stamp_or_null(self.stats.rxmsg_last()),
            "comm:rxerr_cnt" => Value::Int(self.stats.rxerr_cnt() as i64),
            "comm:rxerr_last" => stamp_or_null(self.stats.rxerr_last()),
            other => Value::Text(format!("unknown meta field '{}'", other)),
        }
    }

    pub(crate) fn plugin_call(&self, idx: usize, function: &str, now: DateTime<Local>) -> Value {
        self.plugins[idx].plugin.call(function, self, now)
    }

    /// Renders a transfer's content and hands it to the bus. Publish
    /// failures are logged and do not propagate.
    fn transmit(&self, idx: usize, now: DateTime<Local>) {
        let transfer = &self.transfers[idx];
        let content = transfer.render(self, now);
        let payload = match &content {
            serde_json::Value::Object(_) => content.to_string(),
            serde_json::Value::Null => String::new(),
            serde_json::Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        let topic = format!("{}{}", self.topic_prefix, transfer.topic);
        debug!("transmit {}: {}", topic, payload);
        if let Err(e) = self
            .publisher
            .publish(&topic, &payload, transfer.qos, transfer.retain)
        {
            warn!("publish to {} failed: {}", topic, e);
        }
    }
}

fn merge_next(next: &mut Option<DateTime<Local>>, candidate: Option<DateTime<Local>>) {
    if let Some(candidate) = candidate {
        *next = Some(match *next {
            Some(current) if current <= candidate => current,
            _ => candidate,
        });
    }
}

fn age_seconds(ts: DateTime<Local>, now: DateTime<Local>) -> f64 {
    (now - ts).num_milliseconds() as f64 / 1000.0
}

/// Local timestamp as ISO 8601 with seconds precision and UTC offset.
pub(crate) fn iso8601(ts: DateTime<Local>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Secs, false)
}

fn stamp_or_null(ts: Option<DateTime<Local>>) -> Value {
    ts.map(iso8601).map(Value::Text).unwrap_or(Value::Null)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::config::{ContentConfig, ItemConfig, TransferMqttConfig, TriggerConfig};
    use crate::mqtt::MqttError;
    use std::sync::Mutex;

    /// Publisher that records every publish for inspection.
    #[derive(Default)]
    pub(crate) struct RecordingPublisher {
        pub(crate) published: Mutex<Vec<(String, String, u8, bool)>>,
    }

    impl Publisher for RecordingPublisher {
        fn publish(
            &self,
            topic: &str,
            payload: &str,
            qos: u8,
            retain: bool,
        ) -> Result<(), MqttError> {
            self.published
                .lock()
                .unwrap()
                .push((topic.to_owned(), payload.to_owned(), qos, retain));
            Ok(())
        }
    }

    fn value_transfer(topic: &str, trigger: TriggerConfig, key: &str) -> TransferConfig {
        TransferConfig {
            mqtt: TransferMqttConfig {
                topic: topic.to_owned(),
                retain: false,
                qos: 0,
            },
            trigger,
            content: ContentConfig::Direct {
                field: ItemConfig::Value {
                    name: "value".to_owned(),
                    item: key.to_owned(),
                    max_age: None,
                },
            },
        }
    }

    fn build(
        transfers: &[TransferConfig],
        now: DateTime<Local>,
    ) -> (Dispatcher, Arc<RecordingPublisher>) {
        let publisher = Arc::new(RecordingPublisher::default());
        let dispatcher = Dispatcher::new(
            publisher.clone(),
            "test/".to_owned(),
            &[],
            transfers,
            &PluginRegistry::builtin(),
            Arc::new(CommStats::new()),
            now,
        )
        .unwrap();
        (dispatcher, publisher)
    }

    #[test]
    fn update_trigger_publishes_current_value() {
        let now = Local::now();
        let (mut dispatcher, publisher) = build(
            &[value_transfer(
                "t",
                TriggerConfig::Update { item: None },
                "k",
            )],
            now,
        );

        dispatcher.update_fields(&[("k".to_owned(), Value::Float(21.5))], now);

        let published = publisher.published.lock().unwrap();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].0, "test/t");
        assert_eq!(published[0].1, "21.5");
    }

    #[test]
    fn update_trigger_with_item_filters() {
        let now = Local::now();
        let (mut dispatcher, publisher) = build(
            &[
                value_transfer(
                    "a",
                    TriggerConfig::Update {
                        item: Some("k1".to_owned()),
                    },
                    "k1",
                ),
                value_transfer(
                    "b",
                    TriggerConfig::Update {
                        item: Some("k2".to_owned()),
                    },
                    "k2",
                ),
            ],
            now,
        );

        dispatcher.update_fields(&[("k1".to_owned(), Value::Int(1))], now);

        let published = publisher.published.lock().unwrap();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].0, "test/a");
    }

    #[test]
    fn unknown_keys_are_skipped() {
        let now = Local::now();
        let (mut dispatcher, publisher) = build(
            &[value_transfer(
                "t",
                TriggerConfig::Update { item: None },
                "known",
            )],
            now,
        );

        dispatcher.update_fields(&[("unknown".to_owned(), Value::Int(1))], now);

        assert!(publisher.published.lock().unwrap().is_empty());
        assert!(dispatcher.field("unknown").is_none());
    }

    #[test]
    fn flags_are_cleared_after_update() {
        let now = Local::now();
        let (mut dispatcher, _publisher) = build(
            &[value_transfer(
                "t",
                TriggerConfig::Update { item: None },
                "k",
            )],
            now,
        );

        dispatcher.update_fields(&[("k".to_owned(), Value::Int(1))], now);

        let field = dispatcher.field("k").unwrap();
        assert!(!field.updated());
        assert!(!field.changed());
        assert_eq!(field.value(), &Value::Int(1));
        assert_eq!(field.timestamp(), Some(now));
    }

    #[test]
    fn max_age_returns_null_for_stale_values() {
        let now = Local::now();
        let (mut dispatcher, _publisher) = build(
            &[value_transfer(
                "t",
                TriggerConfig::Update { item: None },
                "k",
            )],
            now,
        );

        dispatcher.update_fields(&[("k".to_owned(), Value::Int(7))], now);

        let later = now + chrono::Duration::seconds(10);
        assert_eq!(dispatcher.field_value("k", None, later), Value::Int(7));
        assert_eq!(dispatcher.field_value("k", Some(30.0), later), Value::Int(7));
        assert_eq!(dispatcher.field_value("k", Some(5.0), later), Value::Null);
        assert_eq!(dispatcher.field_value("missing", None, later), Value::Null);
    }

    #[test]
    fn interval_trigger_fires_on_tick() {
        let now = Local::now();
        let (mut dispatcher, publisher) = build(
            &[value_transfer(
                "t",
                TriggerConfig::Interval {
                    interval: 10.0,
                    max_age: None,
                },
                "k",
            )],
            now,
        );

        // Seeded due immediately; the next deadline is one period out.
        let next = dispatcher.tick(now).unwrap();
        assert_eq!(next, now + chrono::Duration::seconds(10));
        assert_eq!(publisher.published.lock().unwrap().len(), 1);

        // Not due again before the deadline.
        dispatcher.tick(now + chrono::Duration::seconds(5));
        assert_eq!(publisher.published.lock().unwrap().len(), 1);

        dispatcher.tick(now + chrono::Duration::seconds(10));
        assert_eq!(publisher.published.lock().unwrap().len(), 2);
    }

    #[test]
    fn unknown_metafield_is_reported_inline() {
        let now = Local::now();
        let (dispatcher, _publisher) = build(&[], now);
        assert_eq!(
            dispatcher.metafield("no:such", now),
            Value::Text("unknown meta field 'no:such'".to_owned())
        );
    }

    #[test]
    fn uptime_counts_whole_seconds() {
        let now = Local::now();
        let (dispatcher, _publisher) = build(&[], now);
        let later = now + chrono::Duration::milliseconds(2500);
        assert_eq!(dispatcher.metafield("sw:uptime", later), Value::Int(2));
    }
}
