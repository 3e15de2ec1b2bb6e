//! Plugin hosting: computation modules that supply derived values to
//! transfer content.
//!
//! The configuration selects a plugin by an opaque module string; a
//! registry populated at program start maps those strings to
//! constructors. Capabilities are addressed by name and return a scalar
//! to embed in a transfer's content.

use std::collections::HashMap;

use chrono::{DateTime, Local};
use serde::Deserialize;

use super::{DispatchError, Dispatcher};
use crate::value::Value;

/// A hosted computation module.
pub trait Plugin: Send {
    /// Housekeeping hook, called once per dispatcher tick. Returns the
    /// earliest instant the plugin wants to be polled again.
    fn tick(&mut self, now: DateTime<Local>) -> Option<DateTime<Local>> {
        let _ = now;
        None
    }

    /// Field keys this plugin reads on demand. Installed into the field
    /// store so the dispatcher retains their values.
    fn subscriptions(&self) -> &[String];

    /// Whether the named capability exists.
    fn supports(&self, function: &str) -> bool;

    /// Invokes a capability.
    fn call(&self, function: &str, dispatcher: &Dispatcher, now: DateTime<Local>) -> Value;
}

/// Builds a plugin instance from its `config` value.
pub type Constructor = fn(&serde_json::Value) -> Result<Box<dyn Plugin>, DispatchError>;

/// Maps plugin-module strings from the configuration to constructors.
pub struct PluginRegistry {
    constructors: HashMap<String, Constructor>,
}

impl PluginRegistry {
    /// Registry with all built-in plugins.
    pub fn builtin() -> PluginRegistry {
        let mut registry = PluginRegistry {
            constructors: HashMap::new(),
        };
        registry.register("plugins:solar_power", SolarPower::from_config);
        registry
    }

    pub fn register(&mut self, module: &str, constructor: Constructor) {
        self.constructors.insert(module.to_owned(), constructor);
    }

    pub fn construct(
        &self,
        module: &str,
        config: &serde_json::Value,
    ) -> Result<Box<dyn Plugin>, DispatchError> {
        let constructor = self
            .constructors
            .get(module)
            .ok_or_else(|| DispatchError::UnknownPlugin(module.to_owned()))?;
        constructor(config)
    }
}

/// Heat-transfer medium model: affine heat capacity and density over
/// temperature.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum MediumConfig {
    Preset(String),
    Custom {
        #[serde(default)]
        c_m: f64,
        c_t: f64,
        #[serde(default)]
        rho_m: f64,
        rho_t: f64,
    },
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct SolarPowerConfig {
    field_tin: String,
    field_tout: String,
    field_pump: String,
    /// Flow rate in l/min per 10 % pump level, 11 slots; `null` marks a
    /// level with no calibration.
    pump_flow: Vec<Option<f64>>,
    medium: MediumConfig,
}

/// Computes the thermal power moved by a solar circuit from collector
/// in/out temperatures and the pump level.
pub struct SolarPower {
    field_tin: String,
    field_tout: String,
    field_pump: String,
    pump_flow: Vec<Option<f64>>,
    c_m: f64,
    c_t: f64,
    rho_m: f64,
    rho_t: f64,
    subscriptions: Vec<String>,
}

impl SolarPower {
    pub fn from_config(config: &serde_json::Value) -> Result<Box<dyn Plugin>, DispatchError> {
        let cfg: SolarPowerConfig = serde_json::from_value(config.clone())
            .map_err(|e| DispatchError::PluginConfig(e.to_string()))?;
        SolarPower::new(cfg).map(|plugin| Box::new(plugin) as Box<dyn Plugin>)
    }

    fn new(cfg: SolarPowerConfig) -> Result<SolarPower, DispatchError> {
        if cfg.pump_flow.len() != 11 {
            return Err(DispatchError::PluginConfig(format!(
                "'pump_flow' must have 11 elements, got {}",
                cfg.pump_flow.len()
            )));
        }

        let (c_m, c_t, rho_m, rho_t) = match &cfg.medium {
            // Tyfocor(R) G-LS, a 1,2-propylene glycol mixture.
            MediumConfig::Preset(name) if name == "tyfoclor_g-ls" => (0.004, 3.52, -0.86, 1062.2),
            MediumConfig::Preset(name) => {
                return Err(DispatchError::UnknownMedium(name.clone()));
            }
            MediumConfig::Custom {
                c_m,
                c_t,
                rho_m,
                rho_t,
            } => (*c_m, *c_t, *rho_m, *rho_t),
        };

        let subscriptions = vec![
            cfg.field_tin.clone(),  // heat exchanger input
            cfg.field_tout.clone(), // heat exchanger output
            cfg.field_pump.clone(), // primary pump
        ];

        Ok(SolarPower {
            field_tin: cfg.field_tin,
            field_tout: cfg.field_tout,
            field_pump: cfg.field_pump,
            pump_flow: cfg.pump_flow,
            c_m,
            c_t,
            rho_m,
            rho_t,
            subscriptions,
        })
    }

    /// `P = c(t_avg) * rho(t_avg) * flow / 60 * (t_in - t_out)` with
    /// the flow rate looked up from the pump level. `None` when the
    /// level has no calibrated flow or falls outside 0..=100.
    fn solar_power(&self, t_in: f64, t_out: f64, pump_level: f64) -> Option<f64> {
        let slot = (pump_level / 10.0).floor();
        if !(0.0..=10.0).contains(&slot) {
            return None;
        }
        let flow = self.pump_flow[slot as usize]?;

        let t_diff = t_in - t_out;
        let t_avg = (t_in + t_out) / 2.0;
        let c = self.c_m * t_avg + self.c_t; // kJ/(kg*K)
        let rho = self.rho_m * t_avg + self.rho_t; // kg/m³

        Some(c * rho * flow / 60.0 * t_diff)
    }
}

impl Plugin for SolarPower {
    fn subscriptions(&self) -> &[String] {
        &self.subscriptions
    }

    fn supports(&self, function: &str) -> bool {
        function == "power"
    }

    fn call(&self, function: &str, dispatcher: &Dispatcher, now: DateTime<Local>) -> Value {
        match function {
            "power" => {
                let t_in = dispatcher.field_value(&self.field_tin, None, now).as_f64();
                let t_out = dispatcher.field_value(&self.field_tout, None, now).as_f64();
                let pump = dispatcher.field_value(&self.field_pump, None, now).as_f64();

                match (t_in, t_out, pump) {
                    (Some(t_in), Some(t_out), Some(pump)) => self
                        .solar_power(t_in, t_out, pump)
                        .map(Value::Float)
                        .unwrap_or(Value::Null),
                    _ => Value::Null,
                }
            }
            _ => Value::Null,
        }
    }
}
