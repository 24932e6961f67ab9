//! MIMIC-IV chart-event presets for the positive-sequence builders.
//!
//! Item ids follow the `chartevents` dictionary:
//! - single-source vitals share one default modality
//! - blood pressure signals prefer the arterial line over the cuff

use crate::config::{ModalitySpec, SignalSpec, TableRef};

pub const DEFAULT_ONSET_TABLE: &str = "sepsis3_positive";
pub const DEFAULT_ICU_DATASET: &str = "physionet-data.mimiciv_icu";

pub const MODALITY_ARTERIAL: &str = "arterial";
pub const MODALITY_CUFF: &str = "cuff";

pub const HEART_RATE_ITEMS: [i64; 3] = [220045, 220046, 220047];
pub const MAP_ITEMS: [i64; 3] = [220052, 220181, 225312];
pub const SBP_ITEMS: [i64; 2] = [220179, 220050];
pub const DBP_ITEMS: [i64; 2] = [220180, 220051];
pub const RESP_RATE_ITEMS: [i64; 2] = [220210, 224688];
pub const SPO2_ITEMS: [i64; 2] = [220277, 220227];
pub const TEMPERATURE_ITEMS: [i64; 2] = [223762, 223761];

pub const SBP_ARTERIAL_ITEMS: [i64; 1] = [220050];
pub const SBP_CUFF_ITEMS: [i64; 1] = [220179];
pub const DBP_ARTERIAL_ITEMS: [i64; 1] = [220051];
pub const DBP_CUFF_ITEMS: [i64; 1] = [220180];
pub const MAP_ARTERIAL_ITEMS: [i64; 2] = [220052, 225312];
pub const MAP_CUFF_ITEMS: [i64; 1] = [220181];

pub fn chartevents_table(icu_dataset: &str) -> TableRef {
    TableRef::new(format!("{icu_dataset}.chartevents"))
}

/// The seven bedside vitals, one modality each, no plausibility filter.
pub fn standard_vitals() -> Vec<SignalSpec> {
    vec![
        SignalSpec::single("heart_rate", HEART_RATE_ITEMS),
        SignalSpec::single("map", MAP_ITEMS),
        SignalSpec::single("sbp", SBP_ITEMS),
        SignalSpec::single("dbp", DBP_ITEMS),
        SignalSpec::single("resp_rate", RESP_RATE_ITEMS),
        SignalSpec::single("spo2", SPO2_ITEMS),
        SignalSpec::single("temperature", TEMPERATURE_ITEMS),
    ]
}

pub fn arterial_cuff_signal(
    name: &str,
    arterial_items: &[i64],
    cuff_items: &[i64],
    value_min: f64,
    value_max: f64,
) -> SignalSpec {
    SignalSpec::multi(
        name,
        vec![
            ModalitySpec::new(MODALITY_ARTERIAL, arterial_items.iter().copied()),
            ModalitySpec::new(MODALITY_CUFF, cuff_items.iter().copied()),
        ],
    )
    .with_value_range(value_min, value_max)
}

pub fn blood_pressure_signals() -> Vec<SignalSpec> {
    vec![
        arterial_cuff_signal("sbp", &SBP_ARTERIAL_ITEMS, &SBP_CUFF_ITEMS, 0.0, 300.0),
        arterial_cuff_signal("dbp", &DBP_ARTERIAL_ITEMS, &DBP_CUFF_ITEMS, 0.0, 200.0),
        arterial_cuff_signal("map", &MAP_ARTERIAL_ITEMS, &MAP_CUFF_ITEMS, 0.0, 250.0),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FeatureWindowConfig;

    #[test]
    fn presets_validate_cleanly() {
        for signals in [standard_vitals(), blood_pressure_signals()] {
            let cfg = FeatureWindowConfig::new(
                TableRef::new(DEFAULT_ONSET_TABLE),
                chartevents_table(DEFAULT_ICU_DATASET),
                signals,
            );
            assert_eq!(cfg.validate().expect("preset must be valid"), Vec::new());
        }
    }

    #[test]
    fn arterial_outranks_cuff() {
        let sbp = &blood_pressure_signals()[0];
        assert_eq!(sbp.source_rank(MODALITY_ARTERIAL), Some(1));
        assert_eq!(sbp.source_rank(MODALITY_CUFF), Some(2));
        assert_eq!(
            chartevents_table("proj.icu").as_str(),
            "proj.icu.chartevents"
        );
    }
}
