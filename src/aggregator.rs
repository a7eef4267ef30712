use crate::config::MeterConfig;
use crate::error::ConfigError;
use crate::samples::{
    Batch, DerivedSample, Fields, MeterRole, RawSample, ACTIVE_POWER, EXPORT_ACTIVE_ENERGY,
    IMPORT_ACTIVE_ENERGY,
};
use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

/// Derived series that can be computed from meters with known roles.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DerivedRule {
    /// Power drawn by the unmetered loads: grid - (production + storage).
    Consumption,
    /// Locally generated power used on site. Sources read negative while
    /// generating; exported power is subtracted, an import caps it at zero.
    SelfConsumption,
    /// Production plus storage power.
    Generation,
    /// Energy counters of every role side by side.
    EnergyBalance,
}

impl DerivedRule {
    pub fn name(&self) -> &'static str {
        match self {
            DerivedRule::Consumption => "consumption",
            DerivedRule::SelfConsumption => "self_consumption",
            DerivedRule::Generation => "generation",
            DerivedRule::EnergyBalance => "energy_balance",
        }
    }

    fn contributes(&self, role: MeterRole) -> bool {
        match self {
            DerivedRule::Consumption | DerivedRule::SelfConsumption | DerivedRule::EnergyBalance => {
                true
            }
            DerivedRule::Generation => role != MeterRole::Grid,
        }
    }

    /// Combines the contributing samples, `None` if a required field is missing.
    fn combine(&self, contributors: &[&RawSample]) -> Option<Fields> {
        let mut fields = Fields::new();
        match self {
            DerivedRule::Consumption => {
                let mut power = 0.0;
                for sample in contributors {
                    let value = sample.field(ACTIVE_POWER)?;
                    match sample.role {
                        MeterRole::Grid => power += value,
                        MeterRole::Production | MeterRole::Storage => power -= value,
                    }
                }
                fields.insert(ACTIVE_POWER.to_string(), power);
            }
            DerivedRule::SelfConsumption => {
                let mut grid = 0.0;
                let mut generated = 0.0;
                for sample in contributors {
                    let value = sample.field(ACTIVE_POWER)?;
                    match sample.role {
                        MeterRole::Grid => grid += value,
                        MeterRole::Production | MeterRole::Storage => generated -= value,
                    }
                }
                let power = if grid < 0.0 {
                    generated - grid.abs()
                } else {
                    generated.max(0.0)
                };
                fields.insert(ACTIVE_POWER.to_string(), power);
            }
            DerivedRule::Generation => {
                let mut power = 0.0;
                for sample in contributors {
                    power += sample.field(ACTIVE_POWER)?;
                }
                fields.insert(ACTIVE_POWER.to_string(), power);
            }
            DerivedRule::EnergyBalance => {
                for sample in contributors {
                    let import = sample.field(IMPORT_ACTIVE_ENERGY)?;
                    let export = sample.field(EXPORT_ACTIVE_ENERGY)?;
                    let (import_key, export_key) = match sample.role {
                        MeterRole::Grid => ("grid_import", "grid_export"),
                        MeterRole::Production => ("production_import", "production"),
                        MeterRole::Storage => ("storage_in", "storage_out"),
                    };
                    *fields.entry(import_key.to_string()).or_default() += import;
                    *fields.entry(export_key.to_string()).or_default() += export;
                }
            }
        }
        Some(fields)
    }
}

/// Picks the derived series the configured roles allow.
pub fn rules_for(
    meters: &[MeterConfig],
    combined_generation: bool,
) -> Result<Vec<DerivedRule>, ConfigError> {
    let count = |role| meters.iter().filter(|m| m.enabled && m.role == role).count();
    let grid = count(MeterRole::Grid);
    let sources = count(MeterRole::Production) + count(MeterRole::Storage);

    if grid > 1 {
        return Err(ConfigError::MultipleGridMeters(grid));
    }
    if combined_generation && sources == 0 {
        return Err(ConfigError::GenerationWithoutSources);
    }

    let mut rules = Vec::new();
    if grid == 1 && sources > 0 {
        rules.push(DerivedRule::Consumption);
        rules.push(DerivedRule::SelfConsumption);
        rules.push(DerivedRule::EnergyBalance);
    }
    if combined_generation {
        rules.push(DerivedRule::Generation);
    }
    Ok(rules)
}

/// Turns one tick's raw samples into a batch. Pure, no I/O.
#[derive(Debug, Clone)]
pub struct Aggregator {
    rules: Vec<DerivedRule>,
}

impl Aggregator {
    pub fn new(rules: Vec<DerivedRule>) -> Self {
        Self { rules }
    }

    pub fn aggregate(&self, timestamp: DateTime<Utc>, samples: Vec<RawSample>) -> Batch {
        let mut derived = Vec::new();
        for rule in &self.rules {
            let contributors: Vec<&RawSample> = samples
                .iter()
                .filter(|s| rule.contributes(s.role))
                .collect();

            if let Some(failed) = contributors.iter().find(|s| !s.is_ok()) {
                info!(
                    series = rule.name(),
                    meter = %failed.meter,
                    "skipping derived series, contributing meter failed"
                );
                continue;
            }
            match rule.combine(&contributors) {
                Some(fields) => {
                    debug!(series = rule.name(), ?fields, "derived");
                    derived.push(DerivedSample {
                        name: rule.name().to_string(),
                        timestamp,
                        fields,
                    });
                }
                None => warn!(
                    series = rule.name(),
                    "skipping derived series, a contributing meter lacks a required field"
                ),
            }
        }

        let (raw, failed): (Vec<RawSample>, Vec<RawSample>) =
            samples.into_iter().partition(RawSample::is_ok);

        Batch {
            timestamp,
            raw,
            derived,
            failed_meters: failed.into_iter().map(|s| s.meter).collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::eastron_sdm::RegisterSet;

    fn sample(meter: &str, role: MeterRole, power: f64, import: f64, export: f64) -> RawSample {
        let fields = Fields::from([
            (ACTIVE_POWER.to_string(), power),
            (IMPORT_ACTIVE_ENERGY.to_string(), import),
            (EXPORT_ACTIVE_ENERGY.to_string(), export),
        ]);
        RawSample::ok(meter, role, Utc::now(), fields)
    }

    fn three_meters() -> Vec<MeterConfig> {
        vec![
            MeterConfig::new("mains", MeterRole::Grid, 1, RegisterSet::Full),
            MeterConfig::new("pv", MeterRole::Production, 2, RegisterSet::Energy),
            MeterConfig::new("battery", MeterRole::Storage, 3, RegisterSet::Energy),
        ]
    }

    #[test]
    fn test_consumption_is_grid_minus_production_and_storage() {
        let aggregator = Aggregator::new(rules_for(&three_meters(), false).unwrap());
        let batch = aggregator.aggregate(
            Utc::now(),
            vec![
                sample("mains", MeterRole::Grid, 1000.0, 10.0, 1.0),
                sample("pv", MeterRole::Production, 300.0, 0.0, 5.0),
                sample("battery", MeterRole::Storage, 50.0, 2.0, 3.0),
            ],
        );

        let consumption = batch.derived_sample("consumption").unwrap();
        assert_eq!(consumption.fields[ACTIVE_POWER], 650.0);
        assert_eq!(batch.raw.len(), 3);
        assert!(batch.failed_meters.is_empty());
    }

    #[test]
    fn test_self_consumption_while_exporting() {
        let aggregator = Aggregator::new(vec![DerivedRule::SelfConsumption]);
        let batch = aggregator.aggregate(
            Utc::now(),
            vec![
                sample("mains", MeterRole::Grid, -400.0, 0.0, 0.0),
                sample("pv", MeterRole::Production, -900.0, 0.0, 0.0),
                sample("battery", MeterRole::Storage, -100.0, 0.0, 0.0),
            ],
        );
        let own_use = batch.derived_sample("self_consumption").unwrap();
        assert_eq!(own_use.fields[ACTIVE_POWER], 600.0);
    }

    #[test]
    fn test_self_consumption_while_importing() {
        let aggregator = Aggregator::new(vec![DerivedRule::SelfConsumption]);
        let batch = aggregator.aggregate(
            Utc::now(),
            vec![
                sample("mains", MeterRole::Grid, 300.0, 0.0, 0.0),
                sample("pv", MeterRole::Production, -200.0, 0.0, 0.0),
            ],
        );
        let own_use = batch.derived_sample("self_consumption").unwrap();
        assert_eq!(own_use.fields[ACTIVE_POWER], 200.0);

        // Inverter standby draw at night never counts as negative own use.
        let batch = aggregator.aggregate(
            Utc::now(),
            vec![
                sample("mains", MeterRole::Grid, 300.0, 0.0, 0.0),
                sample("pv", MeterRole::Production, 5.0, 0.0, 0.0),
            ],
        );
        let own_use = batch.derived_sample("self_consumption").unwrap();
        assert_eq!(own_use.fields[ACTIVE_POWER], 0.0);
    }

    #[test]
    fn test_failed_contributor_omits_derived() {
        let aggregator = Aggregator::new(rules_for(&three_meters(), true).unwrap());
        let batch = aggregator.aggregate(
            Utc::now(),
            vec![
                sample("mains", MeterRole::Grid, 1000.0, 10.0, 1.0),
                RawSample::failed("pv", MeterRole::Production, Utc::now(), "timeout".into()),
                sample("battery", MeterRole::Storage, 50.0, 2.0, 3.0),
            ],
        );

        assert!(batch.derived.is_empty());
        assert!(batch.raw_sample("mains").is_some());
        assert!(batch.raw_sample("battery").is_some());
        assert!(batch.raw_sample("pv").is_none());
        assert_eq!(batch.failed_meters, vec!["pv".to_string()]);
    }

    #[test]
    fn test_grid_failure_keeps_generation() {
        let aggregator = Aggregator::new(rules_for(&three_meters(), true).unwrap());
        let batch = aggregator.aggregate(
            Utc::now(),
            vec![
                RawSample::failed("mains", MeterRole::Grid, Utc::now(), "crc".into()),
                sample("pv", MeterRole::Production, 300.0, 0.0, 5.0),
                sample("battery", MeterRole::Storage, -20.0, 2.0, 3.0),
            ],
        );

        assert!(batch.derived_sample("consumption").is_none());
        assert!(batch.derived_sample("energy_balance").is_none());
        let generation = batch.derived_sample("generation").unwrap();
        assert_eq!(generation.fields[ACTIVE_POWER], 280.0);
    }

    #[test]
    fn test_missing_field_omits_derived() {
        let aggregator = Aggregator::new(vec![DerivedRule::Consumption]);
        let mut grid = sample("mains", MeterRole::Grid, 1000.0, 0.0, 0.0);
        grid.fields.remove(ACTIVE_POWER);
        let batch = aggregator.aggregate(
            Utc::now(),
            vec![grid, sample("pv", MeterRole::Production, 300.0, 0.0, 0.0)],
        );
        assert!(batch.derived.is_empty());
        assert_eq!(batch.raw.len(), 2);
    }

    #[test]
    fn test_energy_balance_fields() {
        let aggregator = Aggregator::new(vec![DerivedRule::EnergyBalance]);
        let batch = aggregator.aggregate(
            Utc::now(),
            vec![
                sample("mains", MeterRole::Grid, 0.0, 1200.5, 300.25),
                sample("pv", MeterRole::Production, 0.0, 0.5, 4000.0),
                sample("battery", MeterRole::Storage, 0.0, 150.0, 140.0),
            ],
        );
        let balance = &batch.derived_sample("energy_balance").unwrap().fields;
        assert_eq!(balance["grid_import"], 1200.5);
        assert_eq!(balance["grid_export"], 300.25);
        assert_eq!(balance["production"], 4000.0);
        assert_eq!(balance["storage_in"], 150.0);
        assert_eq!(balance["storage_out"], 140.0);
    }

    #[test]
    fn test_sources_of_same_role_are_summed() {
        let aggregator = Aggregator::new(vec![DerivedRule::Consumption, DerivedRule::Generation]);
        let batch = aggregator.aggregate(
            Utc::now(),
            vec![
                sample("mains", MeterRole::Grid, 500.0, 0.0, 0.0),
                sample("pv_east", MeterRole::Production, 200.0, 0.0, 0.0),
                sample("pv_west", MeterRole::Production, 100.0, 0.0, 0.0),
            ],
        );
        assert_eq!(batch.derived_sample("consumption").unwrap().fields[ACTIVE_POWER], 200.0);
        assert_eq!(batch.derived_sample("generation").unwrap().fields[ACTIVE_POWER], 300.0);
    }

    #[test]
    fn test_rules_for_roles() {
        let grid_only = vec![MeterConfig::new("mains", MeterRole::Grid, 1, RegisterSet::Full)];
        assert!(rules_for(&grid_only, false).unwrap().is_empty());
        assert_eq!(
            rules_for(&grid_only, true),
            Err(ConfigError::GenerationWithoutSources)
        );

        let mut two_grids = three_meters();
        two_grids.push(MeterConfig::new("mains2", MeterRole::Grid, 4, RegisterSet::Full));
        assert_eq!(
            rules_for(&two_grids, false),
            Err(ConfigError::MultipleGridMeters(2))
        );

        assert_eq!(
            rules_for(&three_meters(), false).unwrap(),
            vec![
                DerivedRule::Consumption,
                DerivedRule::SelfConsumption,
                DerivedRule::EnergyBalance
            ]
        );

        let sources_only = vec![MeterConfig::new("pv", MeterRole::Production, 2, RegisterSet::Energy)];
        assert_eq!(
            rules_for(&sources_only, true).unwrap(),
            vec![DerivedRule::Generation]
        );
    }
}
