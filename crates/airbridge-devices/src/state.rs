/*!
 * Normalized device state.
 *
 * `StateUpdate` is what the codec produces from one inbound message: every
 * field is optional and absent means "not reported". `DeviceState` is the
 * snapshot a session holds; updates merge into it field by field.
 */
use serde::{Deserialize, Serialize};

/// Fan speed as reported by or sent to the device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FanSpeed {
    /// The device picks the speed itself
    Auto,
    /// Explicit speed level, 1 to 10 (0 only when the device sent garbage)
    Level(u8),
}

impl FanSpeed {
    /// Lowest explicit speed
    pub const MIN_LEVEL: u8 = 1;
    /// Highest explicit speed
    pub const MAX_LEVEL: u8 = 10;

    /// Explicit speed clamped into the supported range
    pub fn clamped(level: i64) -> Self {
        FanSpeed::Level(level.clamp(Self::MIN_LEVEL as i64, Self::MAX_LEVEL as i64) as u8)
    }

    /// Whether this is the automatic sentinel
    pub fn is_auto(&self) -> bool {
        matches!(self, FanSpeed::Auto)
    }

    /// The explicit level, if any
    pub fn level(&self) -> Option<u8> {
        match self {
            FanSpeed::Auto => None,
            FanSpeed::Level(level) => Some(*level),
        }
    }
}

macro_rules! state_fields {
    ($( $(#[$doc:meta])* $field:ident : $ty:ty ),+ $(,)?) => {
        /// A partial state decoded from a single device message
        #[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
        pub struct StateUpdate {
            $( $(#[$doc])* pub $field: Option<$ty>, )+
        }

        impl StateUpdate {
            /// Whether the update carries no field at all
            pub fn is_empty(&self) -> bool {
                true $( && self.$field.is_none() )+
            }
        }

        /// Last known state of a device
        ///
        /// Every field is `None` until the device first reports it.
        #[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
        pub struct DeviceState {
            /// Whether the transport holds an active session
            pub connected: bool,
            $( $(#[$doc])* pub $field: Option<$ty>, )+
        }

        impl DeviceState {
            /// Merge a partial update; fields absent from `update` keep their value
            pub fn merge(&mut self, update: &StateUpdate) {
                $(
                    if let Some(value) = &update.$field {
                        self.$field = Some(value.clone());
                    }
                )+
            }
        }
    };
}

state_fields! {
    /// Power
    power: bool,
    /// Fan speed
    fan_speed: FanSpeed,
    /// Automatic mode
    auto_mode: bool,
    /// Oscillation
    oscillation: bool,
    /// Oscillation start angle in degrees
    oscillation_start: u16,
    /// Oscillation end angle in degrees
    oscillation_end: u16,
    /// Night mode
    night_mode: bool,
    /// Continuous air quality monitoring while off
    continuous_monitoring: bool,
    /// Front airflow (jet focus)
    jet_focus: bool,
    /// Heating enabled
    heating: bool,
    /// Heating target in degrees Celsius
    target_temperature: f64,
    /// Humidifier enabled
    humidifier: bool,
    /// Humidifier target in percent
    target_humidity: u8,
    /// Ambient temperature in degrees Celsius
    temperature: f64,
    /// Ambient relative humidity in percent
    humidity: u8,
    /// PM2.5 in µg/m³
    pm25: u16,
    /// PM10 in µg/m³
    pm10: u16,
    /// Volatile organic compound index
    voc_index: u16,
    /// Nitrogen dioxide index
    no2_index: u16,
    /// Remaining HEPA filter life in hours
    filter_life_hours: u32,
    /// Remaining carbon filter life in percent
    carbon_filter_percent: u8,
}

impl DeviceState {
    /// Set the connectivity flag, returning whether it changed
    pub fn set_connected(&mut self, connected: bool) -> bool {
        let changed = self.connected != connected;
        self.connected = connected;
        changed
    }

    /// The last explicit fan speed level, if the device ever reported one
    pub fn last_explicit_speed(&self) -> Option<u8> {
        self.fan_speed
            .and_then(|speed| speed.level())
            .filter(|level| *level >= FanSpeed::MIN_LEVEL)
    }
}
