/*!
 * Wire codec for the device MQTT protocol.
 *
 * The device speaks JSON envelopes carrying a flat map of 4 character keys to
 * string values. Everything in this module is a pure function: no I/O, no
 * shared state, no logging.
 */
use std::collections::BTreeMap;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::state::{FanSpeed, StateUpdate};

/// Wire keys understood by the codec
pub mod keys {
    /// Power
    pub const POWER: &str = "fpwr";
    /// Fan speed, `0001`-`0010` or `AUTO`
    pub const FAN_SPEED: &str = "fnsp";
    /// Fan mode, `FAN`, `AUTO` or `OFF`
    pub const FAN_MODE: &str = "fmod";
    /// Automatic mode on newer firmware
    pub const AUTO_MODE: &str = "auto";
    /// Oscillation
    pub const OSCILLATION: &str = "oson";
    /// Oscillation start angle
    pub const OSCILLATION_START: &str = "osal";
    /// Oscillation end angle
    pub const OSCILLATION_END: &str = "osau";
    /// Night mode
    pub const NIGHT_MODE: &str = "nmod";
    /// Continuous monitoring
    pub const CONTINUOUS_MONITORING: &str = "rhtm";
    /// Front airflow direction
    pub const FRONT_AIRFLOW: &str = "fdir";
    /// Jet focus on heater models
    pub const JET_FOCUS: &str = "ffoc";
    /// Heat mode, `HEAT` or `OFF`
    pub const HEAT_MODE: &str = "hmod";
    /// Heat target in tenths of kelvin
    pub const HEAT_TARGET: &str = "hmax";
    /// Humidifier, `HUMD` or `OFF`
    pub const HUMIDIFY: &str = "hume";
    /// Humidity target in percent
    pub const HUMIDITY_TARGET: &str = "humt";
    /// Ambient temperature in tenths of kelvin
    pub const TEMPERATURE: &str = "tact";
    /// Ambient relative humidity
    pub const HUMIDITY: &str = "hact";
    /// PM2.5, legacy key
    pub const PM25_LEGACY: &str = "pm25";
    /// PM2.5, current key
    pub const PM25: &str = "p25r";
    /// PM10, legacy key
    pub const PM10_LEGACY: &str = "pm10";
    /// PM10, current key
    pub const PM10: &str = "p10r";
    /// VOC index, legacy key
    pub const VOC_LEGACY: &str = "vact";
    /// VOC index, current key
    pub const VOC: &str = "va10";
    /// NO2 index
    pub const NO2: &str = "noxl";
    /// HEPA filter life in hours
    pub const FILTER_LIFE_HOURS: &str = "filf";
    /// HEPA filter life in percent
    pub const FILTER_LIFE_PERCENT: &str = "hflr";
    /// Carbon filter life in percent
    pub const CARBON_FILTER_PERCENT: &str = "cflr";
}

/// Reason tag sent with every state-set request
pub const MODE_REASON: &str = "LAPP";

/// Filter life in hours that corresponds to 100%
pub const FILTER_LIFE_MAX_HOURS: u32 = 4300;

/// Filter life percentage at or below which the filter needs changing
pub const FILTER_CHANGE_THRESHOLD_PERCENT: f64 = 10.0;

/// Lowest heating target accepted by the device, in degrees Celsius
pub const MIN_TARGET_CELSIUS: i32 = 1;

/// Highest heating target accepted by the device, in degrees Celsius
pub const MAX_TARGET_CELSIUS: i32 = 37;

/// Lowest humidifier target in percent
pub const MIN_TARGET_HUMIDITY: u8 = 30;

/// Highest humidifier target in percent
pub const MAX_TARGET_HUMIDITY: u8 = 70;

const ON: &str = "ON";
const OFF: &str = "OFF";
const AUTO: &str = "AUTO";
const FAN: &str = "FAN";
const HEAT: &str = "HEAT";
const HUMIDIFY: &str = "HUMD";

/// Message type tags
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum MessageType {
    /// Full state snapshot sent in answer to a state request
    CurrentState,
    /// Incremental state broadcast
    StateChange,
    /// Environmental sensor readings
    EnvironmentalSensorData,
    /// Outbound state-set request
    StateSet,
    /// Outbound request for the current state
    RequestCurrentState,
    /// Anything else the device may send
    Other(String),
}

impl MessageType {
    /// Wire representation of the tag
    pub fn as_str(&self) -> &str {
        match self {
            MessageType::CurrentState => "CURRENT-STATE",
            MessageType::StateChange => "STATE-CHANGE",
            MessageType::EnvironmentalSensorData => "ENVIRONMENTAL-CURRENT-SENSOR-DATA",
            MessageType::StateSet => "STATE-SET",
            MessageType::RequestCurrentState => "REQUEST-CURRENT-STATE",
            MessageType::Other(tag) => tag,
        }
    }

    /// Parse a wire tag
    pub fn parse(tag: &str) -> Self {
        match tag {
            "CURRENT-STATE" => MessageType::CurrentState,
            "STATE-CHANGE" => MessageType::StateChange,
            "ENVIRONMENTAL-CURRENT-SENSOR-DATA" => MessageType::EnvironmentalSensorData,
            "STATE-SET" => MessageType::StateSet,
            "REQUEST-CURRENT-STATE" => MessageType::RequestCurrentState,
            other => MessageType::Other(other.to_string()),
        }
    }

    /// Whether the message carries device state the session should merge
    pub fn carries_state(&self) -> bool {
        matches!(
            self,
            MessageType::CurrentState
                | MessageType::StateChange
                | MessageType::EnvironmentalSensorData
        )
    }

    /// Read the tag of an inbound JSON message
    pub fn of(message: &Value) -> Option<Self> {
        message.get("msg").and_then(Value::as_str).map(MessageType::parse)
    }
}

/// Fan mode as carried by the `fmod` key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FanMode {
    /// Manual speed
    Fan,
    /// Automatic speed
    Auto,
    /// Fan off (older models use this as their power switch)
    Off,
}

impl FanMode {
    /// Wire representation
    pub fn as_str(&self) -> &'static str {
        match self {
            FanMode::Fan => FAN,
            FanMode::Auto => AUTO,
            FanMode::Off => OFF,
        }
    }
}

/// A partial intent to change device state
///
/// Only the fields that are `Some` end up on the wire.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StateCommand {
    /// Power
    pub power: Option<bool>,
    /// Fan speed
    pub fan_speed: Option<FanSpeed>,
    /// Fan mode
    pub fan_mode: Option<FanMode>,
    /// Automatic mode flag on newer firmware (`auto`)
    pub auto_mode: Option<bool>,
    /// Oscillation
    pub oscillation: Option<bool>,
    /// Oscillation start angle in degrees
    pub oscillation_start: Option<u16>,
    /// Oscillation end angle in degrees
    pub oscillation_end: Option<u16>,
    /// Night mode
    pub night_mode: Option<bool>,
    /// Continuous monitoring
    pub continuous_monitoring: Option<bool>,
    /// Front airflow direction (`fdir`)
    pub front_airflow: Option<bool>,
    /// Jet focus on heater models (`ffoc`)
    pub jet_focus: Option<bool>,
    /// Heating
    pub heating: Option<bool>,
    /// Heating target in degrees Celsius
    pub target_temperature: Option<f64>,
    /// Humidifier
    pub humidifier: Option<bool>,
    /// Humidifier target in percent
    pub target_humidity: Option<u8>,
}

impl StateCommand {
    /// An empty command
    pub fn new() -> Self {
        Self::default()
    }

    /// Set power
    pub fn with_power(mut self, on: bool) -> Self {
        self.power = Some(on);
        self
    }

    /// Set fan speed
    pub fn with_fan_speed(mut self, speed: FanSpeed) -> Self {
        self.fan_speed = Some(speed);
        self
    }

    /// Set fan mode
    pub fn with_fan_mode(mut self, mode: FanMode) -> Self {
        self.fan_mode = Some(mode);
        self
    }

    /// Set the automatic mode flag
    pub fn with_auto_mode(mut self, on: bool) -> Self {
        self.auto_mode = Some(on);
        self
    }

    /// Set oscillation
    pub fn with_oscillation(mut self, on: bool) -> Self {
        self.oscillation = Some(on);
        self
    }

    /// Set oscillation bounds
    pub fn with_oscillation_angles(mut self, start: u16, end: u16) -> Self {
        self.oscillation_start = Some(start);
        self.oscillation_end = Some(end);
        self
    }

    /// Set night mode
    pub fn with_night_mode(mut self, on: bool) -> Self {
        self.night_mode = Some(on);
        self
    }

    /// Set continuous monitoring
    pub fn with_continuous_monitoring(mut self, on: bool) -> Self {
        self.continuous_monitoring = Some(on);
        self
    }

    /// Set front airflow
    pub fn with_front_airflow(mut self, on: bool) -> Self {
        self.front_airflow = Some(on);
        self
    }

    /// Set jet focus
    pub fn with_jet_focus(mut self, on: bool) -> Self {
        self.jet_focus = Some(on);
        self
    }

    /// Set heating
    pub fn with_heating(mut self, on: bool) -> Self {
        self.heating = Some(on);
        self
    }

    /// Set heating target
    pub fn with_target_temperature(mut self, celsius: f64) -> Self {
        self.target_temperature = Some(celsius);
        self
    }

    /// Set humidifier
    pub fn with_humidifier(mut self, on: bool) -> Self {
        self.humidifier = Some(on);
        self
    }

    /// Set humidifier target
    pub fn with_target_humidity(mut self, percent: u8) -> Self {
        self.target_humidity = Some(percent);
        self
    }

    /// Whether the command would put nothing on the wire
    pub fn is_empty(&self) -> bool {
        encode_fields(self).is_empty()
    }
}

/// Outbound state-set envelope
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandEnvelope {
    /// Message type tag, always `STATE-SET`
    pub msg: String,
    /// ISO-8601 timestamp
    pub time: String,
    /// Reason tag
    #[serde(rename = "mode-reason")]
    pub mode_reason: String,
    /// Wire field map
    pub data: BTreeMap<String, String>,
}

impl CommandEnvelope {
    /// JSON form of the envelope
    pub fn to_value(&self) -> Value {
        serde_json::json!({
            "msg": self.msg,
            "time": self.time,
            "mode-reason": self.mode_reason,
            "data": self.data,
        })
    }
}

/// Outbound request for the current state
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateRequest {
    /// Message type tag, always `REQUEST-CURRENT-STATE`
    pub msg: String,
    /// ISO-8601 timestamp
    pub time: String,
}

impl StateRequest {
    /// JSON form of the request
    pub fn to_value(&self) -> Value {
        serde_json::json!({ "msg": self.msg, "time": self.time })
    }
}

fn timestamp(now: DateTime<Utc>) -> String {
    now.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Encode a command into a state-set envelope stamped with the current time
pub fn encode_command(command: &StateCommand) -> CommandEnvelope {
    encode_command_at(command, Utc::now())
}

/// Encode a command into a state-set envelope stamped with `now`
pub fn encode_command_at(command: &StateCommand, now: DateTime<Utc>) -> CommandEnvelope {
    CommandEnvelope {
        msg: MessageType::StateSet.as_str().to_string(),
        time: timestamp(now),
        mode_reason: MODE_REASON.to_string(),
        data: encode_fields(command),
    }
}

/// Build the request-current-state message stamped with the current time
pub fn request_current_state() -> StateRequest {
    request_current_state_at(Utc::now())
}

/// Build the request-current-state message stamped with `now`
pub fn request_current_state_at(now: DateTime<Utc>) -> StateRequest {
    StateRequest {
        msg: MessageType::RequestCurrentState.as_str().to_string(),
        time: timestamp(now),
    }
}

/// Encode the field map of a command
///
/// Absent fields are omitted. An automatic fan speed is sent as `AUTO`, so the
/// numeric speed never accompanies it.
pub fn encode_fields(command: &StateCommand) -> BTreeMap<String, String> {
    let mut data = BTreeMap::new();
    let mut put = |key: &str, value: String| {
        data.insert(key.to_string(), value);
    };

    if let Some(on) = command.power {
        put(keys::POWER, encode_bool(on).to_string());
    }
    if let Some(speed) = command.fan_speed {
        put(keys::FAN_SPEED, encode_fan_speed(speed));
    }
    if let Some(mode) = command.fan_mode {
        put(keys::FAN_MODE, mode.as_str().to_string());
    }
    if let Some(on) = command.auto_mode {
        put(keys::AUTO_MODE, encode_bool(on).to_string());
    }
    if let Some(on) = command.oscillation {
        put(keys::OSCILLATION, encode_bool(on).to_string());
    }
    if let Some(angle) = command.oscillation_start {
        put(keys::OSCILLATION_START, pad4(angle as u32));
    }
    if let Some(angle) = command.oscillation_end {
        put(keys::OSCILLATION_END, pad4(angle as u32));
    }
    if let Some(on) = command.night_mode {
        put(keys::NIGHT_MODE, encode_bool(on).to_string());
    }
    if let Some(on) = command.continuous_monitoring {
        put(keys::CONTINUOUS_MONITORING, encode_bool(on).to_string());
    }
    if let Some(on) = command.front_airflow {
        put(keys::FRONT_AIRFLOW, encode_bool(on).to_string());
    }
    if let Some(on) = command.jet_focus {
        put(keys::JET_FOCUS, encode_bool(on).to_string());
    }
    if let Some(on) = command.heating {
        put(keys::HEAT_MODE, if on { HEAT } else { OFF }.to_string());
    }
    if let Some(celsius) = command.target_temperature {
        put(keys::HEAT_TARGET, encode_temperature(celsius));
    }
    if let Some(on) = command.humidifier {
        put(keys::HUMIDIFY, if on { HUMIDIFY } else { OFF }.to_string());
    }
    if let Some(percent) = command.target_humidity {
        put(keys::HUMIDITY_TARGET, pad4(percent as u32));
    }

    data
}

fn pad4(value: u32) -> String {
    format!("{:04}", value)
}

/// Encode a boolean as `ON`/`OFF`
pub fn encode_bool(on: bool) -> &'static str {
    if on {
        ON
    } else {
        OFF
    }
}

/// Decode an on/off style literal
///
/// Besides `ON`/`OFF` this accepts the mode literals the device uses for
/// oscillation, heating and humidification.
pub fn decode_bool(raw: &str) -> Option<bool> {
    match raw {
        "ON" | "OION" | HEAT | HUMIDIFY => Some(true),
        "OFF" | "OIOF" => Some(false),
        _ => None,
    }
}

/// Encode a fan speed: `AUTO` or a zero-padded level
pub fn encode_fan_speed(speed: FanSpeed) -> String {
    match speed {
        FanSpeed::Auto => AUTO.to_string(),
        FanSpeed::Level(level) => pad4(level as u32),
    }
}

/// Decode a fan speed
///
/// An unparsable value decodes to level 0 rather than to nothing; unlike the
/// other numeric fields the device firmware expects this.
pub fn decode_fan_speed(raw: &str) -> FanSpeed {
    if raw == AUTO {
        return FanSpeed::Auto;
    }
    FanSpeed::Level(raw.trim().parse::<u8>().unwrap_or(0))
}

/// 0 °C in tenths of kelvin
const ZERO_CELSIUS_TENTHS_KELVIN: f64 = 2731.5;

/// 0 °C in kelvin
const ZERO_CELSIUS_KELVIN: f64 = 273.15;

/// Convert degrees Celsius into the device's tenths of kelvin, `round((c + 273.15) * 10)`
pub fn encode_temperature(celsius: f64) -> String {
    // Scaled first so whole degrees land on an exact .5 and round up
    format!("{}", (celsius * 10.0 + ZERO_CELSIUS_TENTHS_KELVIN).round() as i64)
}

/// Convert tenths of kelvin into degrees Celsius rounded to one decimal
///
/// `OFF`, `INIT` and other non-numeric values decode to `None`.
pub fn decode_temperature(raw: &str) -> Option<f64> {
    let tenths = raw.trim().parse::<f64>().ok()?;
    // Kelvin first, then Celsius, then one decimal
    let celsius = tenths / 10.0 - ZERO_CELSIUS_KELVIN;
    Some((celsius * 10.0).round() / 10.0)
}

/// Round a heating target to whole degrees within the device limits
pub fn clamp_target_celsius(celsius: f64) -> i32 {
    if celsius.is_nan() {
        return MIN_TARGET_CELSIUS;
    }
    (celsius.round() as i32).clamp(MIN_TARGET_CELSIUS, MAX_TARGET_CELSIUS)
}

/// Clamp a humidifier target into the supported range
pub fn clamp_target_humidity(percent: i64) -> u8 {
    percent.clamp(MIN_TARGET_HUMIDITY as i64, MAX_TARGET_HUMIDITY as i64) as u8
}

/// Map a 0-100 percentage onto a speed level; 0% maps to the lowest speed, not off
pub fn percent_to_speed(percent: f64) -> u8 {
    let level = (percent / 10.0).round();
    if level.is_nan() {
        return FanSpeed::MIN_LEVEL;
    }
    (level as i64).clamp(FanSpeed::MIN_LEVEL as i64, FanSpeed::MAX_LEVEL as i64) as u8
}

/// Map a fan speed onto a 0-100 percentage; automatic speed reads as 100%
pub fn speed_to_percent(speed: FanSpeed) -> u8 {
    match speed {
        FanSpeed::Auto => 100,
        FanSpeed::Level(level) => (level as u32 * 10).min(100) as u8,
    }
}

/// Filter health derived from the remaining hours
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FilterStatus {
    /// Remaining life in hours
    pub life_hours: u32,
    /// Remaining life in percent of [`FILTER_LIFE_MAX_HOURS`]
    pub life_percent: u8,
    /// Whether the filter is at or below the change threshold
    pub change_needed: bool,
}

impl FilterStatus {
    /// Derive the status from the remaining hours
    pub fn from_hours(hours: u32) -> Self {
        let percent = hours as f64 * 100.0 / FILTER_LIFE_MAX_HOURS as f64;
        Self {
            life_hours: hours,
            life_percent: percent.round().clamp(0.0, 100.0) as u8,
            change_needed: percent <= FILTER_CHANGE_THRESHOLD_PERCENT,
        }
    }
}

/// Convert a filter life percentage into hours remaining
pub fn filter_percent_to_hours(percent: u32) -> u32 {
    percent.min(100) * FILTER_LIFE_MAX_HOURS / 100
}

/// Read a wire value as a string
///
/// State-change broadcasts send `[previous, current]` pairs; the current value
/// is used. Numbers are accepted as well.
fn wire_str(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Array(pair) => pair.last().and_then(wire_str),
        _ => None,
    }
}

fn parse_number<T: std::str::FromStr>(raw: &str) -> Option<T> {
    raw.trim().parse::<T>().ok()
}

/// Decode the field map of an inbound message into a partial state
///
/// The field map is read from `data` or, failing that, `product-state`.
/// Unknown keys are ignored. When both generations of a sensor key are
/// present the current-generation key wins: `p25r` over `pm25`, `p10r`
/// over `pm10`, `va10` over `vact`. `hflr` wins over `filf`, and an
/// explicit `fpwr` wins over the power implied by `fmod`.
pub fn decode_state(message: &Value) -> StateUpdate {
    let fields = match message
        .get("data")
        .or_else(|| message.get("product-state"))
        .and_then(Value::as_object)
    {
        Some(fields) => fields,
        None => return StateUpdate::default(),
    };

    let get = |key: &str| fields.get(key).and_then(wire_str);
    let mut update = StateUpdate::default();

    if let Some(raw) = get(keys::FAN_SPEED) {
        let speed = decode_fan_speed(&raw);
        if speed.is_auto() {
            update.auto_mode = Some(true);
        }
        update.fan_speed = Some(speed);
    }
    if let Some(raw) = get(keys::FAN_MODE) {
        match raw.as_str() {
            AUTO => {
                update.auto_mode = Some(true);
                update.power = Some(true);
            }
            FAN => {
                update.auto_mode = Some(false);
                update.power = Some(true);
            }
            OFF => update.power = Some(false),
            _ => {}
        }
    }
    if let Some(on) = get(keys::AUTO_MODE).as_deref().and_then(decode_bool) {
        update.auto_mode = Some(on);
    }
    if let Some(on) = get(keys::POWER).as_deref().and_then(decode_bool) {
        update.power = Some(on);
    }

    if let Some(on) = get(keys::OSCILLATION).as_deref().and_then(decode_bool) {
        update.oscillation = Some(on);
    }
    if let Some(angle) = get(keys::OSCILLATION_START).as_deref().and_then(parse_number) {
        update.oscillation_start = Some(angle);
    }
    if let Some(angle) = get(keys::OSCILLATION_END).as_deref().and_then(parse_number) {
        update.oscillation_end = Some(angle);
    }
    if let Some(on) = get(keys::NIGHT_MODE).as_deref().and_then(decode_bool) {
        update.night_mode = Some(on);
    }
    if let Some(on) = get(keys::CONTINUOUS_MONITORING).as_deref().and_then(decode_bool) {
        update.continuous_monitoring = Some(on);
    }
    if let Some(on) = get(keys::FRONT_AIRFLOW).as_deref().and_then(decode_bool) {
        update.jet_focus = Some(on);
    }
    if let Some(on) = get(keys::JET_FOCUS).as_deref().and_then(decode_bool) {
        update.jet_focus = Some(on);
    }

    if let Some(on) = get(keys::HEAT_MODE).as_deref().and_then(decode_bool) {
        update.heating = Some(on);
    }
    if let Some(celsius) = get(keys::HEAT_TARGET).as_deref().and_then(decode_temperature) {
        update.target_temperature = Some(celsius);
    }
    if let Some(on) = get(keys::HUMIDIFY).as_deref().and_then(decode_bool) {
        update.humidifier = Some(on);
    }
    if let Some(percent) = get(keys::HUMIDITY_TARGET).as_deref().and_then(parse_number) {
        update.target_humidity = Some(percent);
    }

    if let Some(celsius) = get(keys::TEMPERATURE).as_deref().and_then(decode_temperature) {
        update.temperature = Some(celsius);
    }
    if let Some(percent) = get(keys::HUMIDITY).as_deref().and_then(parse_number) {
        update.humidity = Some(percent);
    }

    // Legacy keys first so the current-generation keys override them
    for key in [keys::PM25_LEGACY, keys::PM25] {
        if let Some(value) = get(key).as_deref().and_then(parse_number) {
            update.pm25 = Some(value);
        }
    }
    for key in [keys::PM10_LEGACY, keys::PM10] {
        if let Some(value) = get(key).as_deref().and_then(parse_number) {
            update.pm10 = Some(value);
        }
    }
    for key in [keys::VOC_LEGACY, keys::VOC] {
        if let Some(value) = get(key).as_deref().and_then(parse_number) {
            update.voc_index = Some(value);
        }
    }
    if let Some(value) = get(keys::NO2).as_deref().and_then(parse_number) {
        update.no2_index = Some(value);
    }

    if let Some(hours) = get(keys::FILTER_LIFE_HOURS).as_deref().and_then(parse_number) {
        update.filter_life_hours = Some(hours);
    }
    if let Some(percent) = get(keys::FILTER_LIFE_PERCENT)
        .as_deref()
        .and_then(parse_number::<u32>)
    {
        update.filter_life_hours = Some(filter_percent_to_hours(percent));
    }
    if let Some(percent) = get(keys::CARBON_FILTER_PERCENT).as_deref().and_then(parse_number) {
        update.carbon_filter_percent = Some(percent);
    }

    update
}
