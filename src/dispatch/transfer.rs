//! Transfers: publish jobs binding a trigger to a content template to a
//! bus topic.

use chrono::{DateTime, Duration, Local};

use super::{DispatchError, Dispatcher, PluginSlot};
use crate::config::{ContentConfig, ItemConfig, TransferConfig, TriggerConfig};
use crate::value::Value;

/// When a transfer transmits.
#[derive(Debug)]
pub enum Trigger {
    /// Fires whenever fields arrive, optionally only when `item` is
    /// among the updated keys.
    Update { item: Option<String> },

    /// Fires every `interval`. When transmits were missed the deadline
    /// is re-seeded one period from now: missed beats are lost, the
    /// cadence keeps going forward.
    Interval {
        interval: Duration,
        max_age: Option<f64>,
        next_transfer: DateTime<Local>,
    },
}

impl Trigger {
    fn from_config(cfg: &TriggerConfig, now: DateTime<Local>) -> Trigger {
        match cfg {
            TriggerConfig::Update { item } => Trigger::Update { item: item.clone() },
            TriggerConfig::Interval { interval, max_age } => Trigger::Interval {
                interval: Duration::milliseconds((interval * 1000.0).round() as i64),
                max_age: *max_age,
                next_transfer: now,
            },
        }
    }
}

/// What a transfer publishes.
#[derive(Debug)]
pub enum Content {
    Direct(ContentItem),
    Json(Vec<ContentItem>),
}

/// One element of a content template.
#[derive(Debug)]
pub enum ContentItem {
    /// A nested mapping over child items.
    Group {
        name: String,
        children: Vec<ContentItem>,
    },

    /// The current value of a field, aged out after `max_age` seconds.
    Value {
        name: String,
        key: String,
        max_age: Option<f64>,
    },

    /// A metafield, resolved against the transfer first and the
    /// dispatcher second.
    Meta { name: String, key: String },

    /// A capability of a configured plugin, resolved to its index at
    /// construction.
    Plugin {
        name: String,
        plugin: usize,
        function: String,
    },
}

impl ContentItem {
    fn from_config(cfg: &ItemConfig, plugins: &[PluginSlot]) -> Result<ContentItem, DispatchError> {
        Ok(match cfg {
            ItemConfig::Group { group, fields } => ContentItem::Group {
                name: group.clone(),
                children: fields
                    .iter()
                    .map(|f| ContentItem::from_config(f, plugins))
                    .collect::<Result<_, _>>()?,
            },
            ItemConfig::Value {
                name,
                item,
                max_age,
            } => ContentItem::Value {
                name: name.clone(),
                key: item.clone(),
                max_age: *max_age,
            },
            ItemConfig::Meta { name, meta } => ContentItem::Meta {
                name: name.clone(),
                key: meta.clone(),
            },
            ItemConfig::Plugin {
                name,
                plugin,
                function,
            } => {
                let idx = plugins
                    .iter()
                    .position(|slot| slot.name == *plugin)
                    .ok_or_else(|| DispatchError::UnknownPlugin(plugin.clone()))?;
                if !plugins[idx].plugin.supports(function) {
                    return Err(DispatchError::UnknownPluginFunction {
                        plugin: plugin.clone(),
                        function: function.clone(),
                    });
                }
                ContentItem::Plugin {
                    name: name.clone(),
                    plugin: idx,
                    function: function.clone(),
                }
            }
        })
    }

    fn name(&self) -> &str {
        match self {
            ContentItem::Group { name, .. } => name,
            ContentItem::Value { name, .. } => name,
            ContentItem::Meta { name, .. } => name,
            ContentItem::Plugin { name, .. } => name,
        }
    }

    fn render(
        &self,
        dispatcher: &Dispatcher,
        transfer: &Transfer,
        now: DateTime<Local>,
    ) -> serde_json::Value {
        match self {
            ContentItem::Group { children, .. } => {
                let mut map = serde_json::Map::new();
                for child in children {
                    map.insert(child.name().to_owned(), child.render(dispatcher, transfer, now));
                }
                serde_json::Value::Object(map)
            }
            ContentItem::Value { key, max_age, .. } => {
                dispatcher.field_value(key, *max_age, now).to_json()
            }
            ContentItem::Meta { key, .. } => transfer.metafield(key, dispatcher, now).to_json(),
            ContentItem::Plugin {
                plugin, function, ..
            } => dispatcher.plugin_call(*plugin, function, now).to_json(),
        }
    }

    fn collect_keys(&self, plugins: &[PluginSlot], out: &mut Vec<String>) {
        match self {
            ContentItem::Group { children, .. } => {
                for child in children {
                    child.collect_keys(plugins, out);
                }
            }
            ContentItem::Value { key, .. } => out.push(key.clone()),
            ContentItem::Meta { .. } => {}
            ContentItem::Plugin { plugin, .. } => {
                out.extend(plugins[*plugin].plugin.subscriptions().iter().cloned());
            }
        }
    }
}

/// A publish job.
pub struct Transfer {
    pub(crate) topic: String,
    pub(crate) retain: bool,
    pub(crate) qos: u8,
    pub(crate) trigger: Trigger,
    content: Content,
}

impl Transfer {
    pub(crate) fn from_config(
        cfg: &TransferConfig,
        plugins: &[PluginSlot],
        now: DateTime<Local>,
    ) -> Result<Transfer, DispatchError> {
        let content = match &cfg.content {
            ContentConfig::Direct { field } => {
                Content::Direct(ContentItem::from_config(field, plugins)?)
            }
            ContentConfig::Json { fields } => Content::Json(
                fields
                    .iter()
                    .map(|f| ContentItem::from_config(f, plugins))
                    .collect::<Result<_, _>>()?,
            ),
        };

        Ok(Transfer {
            topic: cfg.mqtt.topic.clone(),
            retain: cfg.mqtt.retain,
            qos: cfg.mqtt.qos,
            trigger: Trigger::from_config(&cfg.trigger, now),
            content,
        })
    }

    /// Field keys this transfer depends on: value items plus the
    /// subscriptions of every plugin it invokes.
    pub(crate) fn subscriptions(&self, plugins: &[PluginSlot]) -> Vec<String> {
        let mut keys = Vec::new();
        match &self.content {
            Content::Direct(item) => item.collect_keys(plugins, &mut keys),
            Content::Json(items) => {
                for item in items {
                    item.collect_keys(plugins, &mut keys);
                }
            }
        }
        keys
    }

    pub(crate) fn wants_update(&self, touched: &[String]) -> bool {
        match &self.trigger {
            Trigger::Update { item: None } => true,
            Trigger::Update { item: Some(key) } => touched.iter().any(|k| k == key),
            Trigger::Interval { .. } => false,
        }
    }

    // No trigger kind reacts to the changed pass; the hook keeps the
    // updated-then-changed notification order observable.
    pub(crate) fn wants_change(&self, _touched: &[String]) -> bool {
        false
    }

    /// Advances the trigger clock. Returns whether to transmit now and
    /// the next deadline, if any.
    pub(crate) fn trigger_tick(&mut self, now: DateTime<Local>) -> (bool, Option<DateTime<Local>>) {
        match &mut self.trigger {
            Trigger::Update { .. } => (false, None),
            Trigger::Interval {
                interval,
                next_transfer,
                ..
            } => {
                let mut fire = false;
                if now >= *next_transfer {
                    fire = true;
                    *next_transfer = *next_transfer + *interval;
                    if *next_transfer <= now {
                        *next_transfer = now + *interval;
                    }
                }
                (fire, Some(*next_transfer))
            }
        }
    }

    /// Renders the content template.
    pub(crate) fn render(&self, dispatcher: &Dispatcher, now: DateTime<Local>) -> serde_json::Value {
        match &self.content {
            Content::Direct(item) => item.render(dispatcher, self, now),
            Content::Json(items) => {
                let mut map = serde_json::Map::new();
                for item in items {
                    map.insert(item.name().to_owned(), item.render(dispatcher, self, now));
                }
                serde_json::Value::Object(map)
            }
        }
    }

    /// Resolves a metafield name. Transfer-scoped names would win here;
    /// none are defined, so everything falls through to the dispatcher.
    pub(crate) fn metafield(
        &self,
        name: &str,
        dispatcher: &Dispatcher,
        now: DateTime<Local>,
    ) -> Value {
        dispatcher.metafield(name, now)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TransferMqttConfig;

    fn interval_transfer(interval: f64, now: DateTime<Local>) -> Transfer {
        Transfer::from_config(
            &TransferConfig {
                mqtt: TransferMqttConfig {
                    topic: "t".to_owned(),
                    retain: false,
                    qos: 0,
                },
                trigger: TriggerConfig::Interval {
                    interval,
                    max_age: None,
                },
                content: ContentConfig::Json { fields: vec![] },
            },
            &[],
            now,
        )
        .unwrap()
    }

    #[test]
    fn interval_trigger_advances_by_period() {
        let now = Local::now();
        let mut transfer = interval_transfer(10.0, now);

        let (fire, next) = transfer.trigger_tick(now);
        assert!(fire);
        assert_eq!(next, Some(now + Duration::seconds(10)));

        let (fire, next) = transfer.trigger_tick(now + Duration::seconds(3));
        assert!(!fire);
        assert_eq!(next, Some(now + Duration::seconds(10)));

        let (fire, next) = transfer.trigger_tick(now + Duration::seconds(10));
        assert!(fire);
        assert_eq!(next, Some(now + Duration::seconds(20)));
    }

    #[test]
    fn interval_trigger_reseeds_after_missed_beats() {
        let now = Local::now();
        let mut transfer = interval_transfer(10.0, now);
        transfer.trigger_tick(now);

        // Three periods slip by; a single transmit happens and the
        // cadence restarts from the late tick.
        let late = now + Duration::seconds(35);
        let (fire, next) = transfer.trigger_tick(late);
        assert!(fire);
        assert_eq!(next, Some(late + Duration::seconds(10)));
    }

    #[test]
    fn interval_spacing_stays_within_drift_bound() {
        let now = Local::now();
        let mut transfer = interval_transfer(10.0, now);
        let period = Duration::seconds(10);

        // Tick at each returned deadline, the way the main loop does.
        let mut transmits = Vec::new();
        let mut t = now;
        for _ in 0..30 {
            let (fire, next) = transfer.trigger_tick(t);
            if fire {
                transmits.push(t);
            }
            t = next.unwrap();
        }
        assert!(transmits.len() >= 29);
        for pair in transmits.windows(2) {
            let gap = pair[1] - pair[0];
            assert!(gap >= period, "gap {} below period", gap);
            assert!(gap <= period + period, "gap {} above twice the period", gap);
        }
    }

    #[test]
    fn update_trigger_matches_touched_keys() {
        let now = Local::now();
        let any = Transfer {
            topic: "t".to_owned(),
            retain: false,
            qos: 0,
            trigger: Trigger::Update { item: None },
            content: Content::Json(vec![]),
        };
        assert!(any.wants_update(&["a".to_owned()]));
        assert!(any.wants_update(&[]));

        let one = Transfer {
            trigger: Trigger::Update {
                item: Some("a".to_owned()),
            },
            ..any
        };
        assert!(one.wants_update(&["a".to_owned(), "b".to_owned()]));
        assert!(!one.wants_update(&["b".to_owned()]));
        let (fire, next) = {
            let mut one = one;
            one.trigger_tick(now)
        };
        assert!(!fire);
        assert!(next.is_none());
    }
}
