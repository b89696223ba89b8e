/*!
 * Capability catalog.
 *
 * A static, read-only table mapping a product family code to the features the
 * hardware actually has. Differences between older and newer models are data
 * in this table, not separate device types.
 */
use std::collections::HashMap;

use once_cell::sync::Lazy;
use serde::Serialize;

use crate::state::StateUpdate;

/// Product series
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ProductSeries {
    /// First generation purifier fans
    PureCoolLink,
    /// First generation purifier heaters
    PureHotCoolLink,
    /// Second generation purifier fans
    PureCool,
    /// Second generation purifier heaters
    PureHotCool,
    /// Purifier humidifiers
    PureHumidifyCool,
}

/// Kind of air quality sensor fitted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum AirQualitySensor {
    /// No air quality sensor
    None,
    /// Dust and VOC levels only
    Basic,
    /// PM2.5, PM10 and VOC readings
    Advanced,
}

/// Which wire key drives the front airflow / jet focus feature
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum JetFocus {
    /// Not present
    None,
    /// `fdir` on fan models
    FrontAirflow,
    /// `ffoc` on heater models
    Focus,
}

/// Features a product family physically has
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct CapabilityProfile {
    /// Automatic fan speed
    pub auto_mode: bool,
    /// Night mode
    pub night_mode: bool,
    /// Continuous monitoring while off
    pub continuous_monitoring: bool,
    /// Oscillation
    pub oscillation: bool,
    /// Configurable oscillation bounds, as `(min, max)` degrees
    pub oscillation_angles: Option<(u16, u16)>,
    /// Front airflow / jet focus
    pub jet_focus: JetFocus,
    /// Heating element
    pub heating: bool,
    /// Humidifier
    pub humidifier: bool,
    /// Air quality sensor
    pub air_quality: AirQualitySensor,
    /// Temperature sensor
    pub temperature_sensor: bool,
    /// Humidity sensor
    pub humidity_sensor: bool,
    /// Nitrogen dioxide sensor
    pub no2_sensor: bool,
    /// Formaldehyde sensor
    pub formaldehyde_sensor: bool,
    /// Separate carbon filter
    pub carbon_filter: bool,
    /// Power is switched through the fan mode (`fmod=OFF`) rather than `fpwr`
    pub power_via_fan_mode: bool,
}

impl CapabilityProfile {
    /// Safe baseline for unknown products: fan, oscillation, auto, night mode
    /// and continuous monitoring, no sensors
    pub const fn baseline() -> Self {
        Self {
            auto_mode: true,
            night_mode: true,
            continuous_monitoring: true,
            oscillation: true,
            oscillation_angles: None,
            jet_focus: JetFocus::None,
            heating: false,
            humidifier: false,
            air_quality: AirQualitySensor::None,
            temperature_sensor: false,
            humidity_sensor: false,
            no2_sensor: false,
            formaldehyde_sensor: false,
            carbon_filter: false,
            power_via_fan_mode: false,
        }
    }

    /// Whether the device reports particulate matter readings
    pub fn has_particulate_sensor(&self) -> bool {
        self.air_quality == AirQualitySensor::Advanced
    }

    /// Whether the device reports a VOC index
    pub fn has_voc_sensor(&self) -> bool {
        self.air_quality != AirQualitySensor::None
    }

    /// Drop decoded fields for hardware this product does not have
    pub fn retain_supported(&self, update: &mut StateUpdate) {
        if !self.temperature_sensor {
            update.temperature = None;
        }
        if !self.humidity_sensor {
            update.humidity = None;
        }
        if !self.has_particulate_sensor() {
            update.pm25 = None;
            update.pm10 = None;
        }
        if !self.has_voc_sensor() {
            update.voc_index = None;
        }
        if !self.no2_sensor {
            update.no2_index = None;
        }
        if !self.heating {
            update.heating = None;
            update.target_temperature = None;
        }
        if !self.humidifier {
            update.humidifier = None;
            update.target_humidity = None;
        }
        if self.jet_focus == JetFocus::None {
            update.jet_focus = None;
        }
        if self.oscillation_angles.is_none() {
            update.oscillation_start = None;
            update.oscillation_end = None;
        }
        if !self.carbon_filter {
            update.carbon_filter_percent = None;
        }
    }
}

impl Default for CapabilityProfile {
    fn default() -> Self {
        Self::baseline()
    }
}

/// One row of the catalog
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CatalogEntry {
    /// Product family code
    pub product_type: &'static str,
    /// Marketing model name
    pub model: &'static str,
    /// Series
    pub series: ProductSeries,
    /// Capabilities
    pub profile: CapabilityProfile,
}

const LINK_FAN: CapabilityProfile = CapabilityProfile {
    air_quality: AirQualitySensor::Basic,
    temperature_sensor: true,
    humidity_sensor: true,
    power_via_fan_mode: true,
    ..CapabilityProfile::baseline()
};

const LINK_HEATER: CapabilityProfile = CapabilityProfile {
    jet_focus: JetFocus::Focus,
    heating: true,
    ..LINK_FAN
};

const PURE_COOL: CapabilityProfile = CapabilityProfile {
    oscillation_angles: Some((5, 355)),
    jet_focus: JetFocus::FrontAirflow,
    air_quality: AirQualitySensor::Advanced,
    temperature_sensor: true,
    humidity_sensor: true,
    no2_sensor: true,
    carbon_filter: true,
    ..CapabilityProfile::baseline()
};

const PURE_HOT_COOL: CapabilityProfile = CapabilityProfile {
    heating: true,
    ..PURE_COOL
};

const PURE_HUMIDIFY_COOL: CapabilityProfile = CapabilityProfile {
    humidifier: true,
    ..PURE_COOL
};

const fn with_formaldehyde(profile: CapabilityProfile) -> CapabilityProfile {
    CapabilityProfile {
        formaldehyde_sensor: true,
        ..profile
    }
}

const ENTRIES: &[CatalogEntry] = &[
    CatalogEntry {
        product_type: "475",
        model: "Pure Cool Link Tower (TP02)",
        series: ProductSeries::PureCoolLink,
        profile: LINK_FAN,
    },
    CatalogEntry {
        product_type: "469",
        model: "Pure Cool Link Desk (DP01)",
        series: ProductSeries::PureCoolLink,
        profile: LINK_FAN,
    },
    CatalogEntry {
        product_type: "455",
        model: "Pure Hot+Cool Link (HP02)",
        series: ProductSeries::PureHotCoolLink,
        profile: LINK_HEATER,
    },
    CatalogEntry {
        product_type: "438",
        model: "Pure Cool Tower (TP04)",
        series: ProductSeries::PureCool,
        profile: PURE_COOL,
    },
    CatalogEntry {
        product_type: "438K",
        model: "Purifier Cool (TP07)",
        series: ProductSeries::PureCool,
        profile: PURE_COOL,
    },
    CatalogEntry {
        product_type: "438E",
        model: "Purifier Cool Formaldehyde (TP09)",
        series: ProductSeries::PureCool,
        profile: with_formaldehyde(PURE_COOL),
    },
    CatalogEntry {
        product_type: "520",
        model: "Pure Cool Desk (DP04)",
        series: ProductSeries::PureCool,
        profile: PURE_COOL,
    },
    CatalogEntry {
        product_type: "527",
        model: "Pure Hot+Cool (HP04)",
        series: ProductSeries::PureHotCool,
        profile: PURE_HOT_COOL,
    },
    CatalogEntry {
        product_type: "527K",
        model: "Purifier Hot+Cool (HP07)",
        series: ProductSeries::PureHotCool,
        profile: PURE_HOT_COOL,
    },
    CatalogEntry {
        product_type: "527E",
        model: "Purifier Hot+Cool Formaldehyde (HP09)",
        series: ProductSeries::PureHotCool,
        profile: with_formaldehyde(PURE_HOT_COOL),
    },
    CatalogEntry {
        product_type: "358",
        model: "Pure Humidify+Cool (PH01)",
        series: ProductSeries::PureHumidifyCool,
        profile: PURE_HUMIDIFY_COOL,
    },
    CatalogEntry {
        product_type: "358K",
        model: "Purifier Humidify+Cool (PH03)",
        series: ProductSeries::PureHumidifyCool,
        profile: PURE_HUMIDIFY_COOL,
    },
    CatalogEntry {
        product_type: "358E",
        model: "Purifier Humidify+Cool Formaldehyde (PH04)",
        series: ProductSeries::PureHumidifyCool,
        profile: with_formaldehyde(PURE_HUMIDIFY_COOL),
    },
];

static CATALOG: Lazy<HashMap<&'static str, &'static CatalogEntry>> =
    Lazy::new(|| ENTRIES.iter().map(|entry| (entry.product_type, entry)).collect());

/// Look up a product family; unknown codes yield `None`
pub fn lookup(product_type: &str) -> Option<&'static CatalogEntry> {
    CATALOG.get(product_type).copied()
}

/// Profile for a product family, or the baseline when the code is unknown
pub fn profile_or_default(product_type: &str) -> CapabilityProfile {
    lookup(product_type)
        .map(|entry| entry.profile)
        .unwrap_or_else(CapabilityProfile::baseline)
}

/// Whether the product family is known
pub fn is_supported(product_type: &str) -> bool {
    CATALOG.contains_key(product_type)
}

/// All entries, in table order
pub fn entries() -> &'static [CatalogEntry] {
    ENTRIES
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::FanSpeed;

    #[test]
    fn test_lookup_known() {
        let entry = lookup("438").unwrap();
        assert_eq!(entry.series, ProductSeries::PureCool);
        assert!(entry.profile.has_particulate_sensor());
        assert!(entry.profile.no2_sensor);
        assert!(!entry.profile.heating);
        assert_eq!(entry.profile.jet_focus, JetFocus::FrontAirflow);

        let heater = lookup("527").unwrap();
        assert!(heater.profile.heating);

        let humidifier = lookup("358").unwrap();
        assert!(humidifier.profile.humidifier);

        assert!(lookup("438E").unwrap().profile.formaldehyde_sensor);
        assert!(!lookup("438K").unwrap().profile.formaldehyde_sensor);
    }

    #[test]
    fn test_link_series() {
        let profile = lookup("475").unwrap().profile;
        assert!(profile.power_via_fan_mode);
        assert_eq!(profile.air_quality, AirQualitySensor::Basic);
        assert!(profile.has_voc_sensor());
        assert!(!profile.has_particulate_sensor());
        assert!(profile.oscillation_angles.is_none());

        let heater = lookup("455").unwrap().profile;
        assert!(heater.heating);
        assert_eq!(heater.jet_focus, JetFocus::Focus);
    }

    #[test]
    fn test_unknown_product() {
        assert!(lookup("999").is_none());
        assert!(!is_supported("999"));

        let profile = profile_or_default("999");
        assert_eq!(profile, CapabilityProfile::baseline());
        assert!(profile.auto_mode);
        assert!(profile.oscillation);
        assert!(profile.night_mode);
        assert!(profile.continuous_monitoring);
        assert!(!profile.temperature_sensor);
        assert_eq!(profile.air_quality, AirQualitySensor::None);
    }

    #[test]
    fn test_entries_are_unique() {
        assert_eq!(CATALOG.len(), entries().len());
    }

    #[test]
    fn test_retain_supported() {
        let mut update = StateUpdate {
            power: Some(true),
            fan_speed: Some(FanSpeed::Level(3)),
            temperature: Some(21.0),
            pm25: Some(4),
            voc_index: Some(2),
            heating: Some(true),
            humidifier: Some(false),
            ..Default::default()
        };
        CapabilityProfile::baseline().retain_supported(&mut update);
        assert_eq!(
            update,
            StateUpdate {
                power: Some(true),
                fan_speed: Some(FanSpeed::Level(3)),
                ..Default::default()
            }
        );

        let mut update = StateUpdate {
            pm25: Some(4),
            voc_index: Some(2),
            heating: Some(true),
            ..Default::default()
        };
        lookup("455").unwrap().profile.retain_supported(&mut update);
        assert_eq!(update.pm25, None);
        assert_eq!(update.voc_index, Some(2));
        assert_eq!(update.heating, Some(true));
    }
}
