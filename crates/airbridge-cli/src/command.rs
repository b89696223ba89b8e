//! One-shot device commands issued by `airbridge set`.

use anyhow::{anyhow, bail, Context, Result};
use clap::ValueEnum;

use airbridge_devices::DeviceSession;

/// Setting to change
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Setting {
    /// on | off
    Power,
    /// 1-10 or auto
    Speed,
    /// on | off
    Auto,
    /// on | off
    Oscillation,
    /// START-END in degrees, e.g. 45-315
    Angles,
    /// on | off
    Night,
    /// on | off
    Monitoring,
    /// on | off
    Focus,
    /// on | off
    Heating,
    /// Target temperature in degrees Celsius
    TargetTemperature,
    /// on | off
    Humidifier,
    /// Target relative humidity in percent
    TargetHumidity,
}

/// A parsed command, ready to send
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum DeviceCommand {
    Power(bool),
    FanSpeed(i64),
    AutoMode(bool),
    Oscillation(bool),
    OscillationAngles(u16, u16),
    NightMode(bool),
    ContinuousMonitoring(bool),
    JetFocus(bool),
    Heating(bool),
    TargetTemperature(f64),
    Humidifier(bool),
    TargetHumidity(i64),
}

impl DeviceCommand {
    /// Parse the value given on the command line for `setting`
    pub fn parse(setting: Setting, value: &str) -> Result<Self> {
        let value = value.trim();
        let command = match setting {
            Setting::Power => Self::Power(parse_switch(value)?),
            Setting::Speed if value.eq_ignore_ascii_case("auto") => Self::AutoMode(true),
            Setting::Speed => Self::FanSpeed(
                value
                    .parse()
                    .with_context(|| format!("Invalid fan speed '{}'", value))?,
            ),
            Setting::Auto => Self::AutoMode(parse_switch(value)?),
            Setting::Oscillation => Self::Oscillation(parse_switch(value)?),
            Setting::Angles => {
                let (start, end) = value
                    .split_once('-')
                    .ok_or_else(|| anyhow!("Angles must look like START-END, got '{}'", value))?;
                Self::OscillationAngles(
                    start.trim().parse().context("Invalid start angle")?,
                    end.trim().parse().context("Invalid end angle")?,
                )
            }
            Setting::Night => Self::NightMode(parse_switch(value)?),
            Setting::Monitoring => Self::ContinuousMonitoring(parse_switch(value)?),
            Setting::Focus => Self::JetFocus(parse_switch(value)?),
            Setting::Heating => Self::Heating(parse_switch(value)?),
            Setting::TargetTemperature => Self::TargetTemperature(
                value
                    .parse()
                    .with_context(|| format!("Invalid temperature '{}'", value))?,
            ),
            Setting::Humidifier => Self::Humidifier(parse_switch(value)?),
            Setting::TargetHumidity => Self::TargetHumidity(
                value
                    .trim_end_matches('%')
                    .parse()
                    .with_context(|| format!("Invalid humidity '{}'", value))?,
            ),
        };
        Ok(command)
    }

    /// Send the command through `session`
    pub async fn apply(self, session: &DeviceSession) -> Result<()> {
        let result = match self {
            Self::Power(on) => session.set_power(on).await,
            Self::FanSpeed(level) => session.set_fan_speed(level).await,
            Self::AutoMode(on) => session.set_auto_mode(on).await,
            Self::Oscillation(on) => session.set_oscillation(on).await,
            Self::OscillationAngles(start, end) => session.set_oscillation_angles(start, end).await,
            Self::NightMode(on) => session.set_night_mode(on).await,
            Self::ContinuousMonitoring(on) => session.set_continuous_monitoring(on).await,
            Self::JetFocus(on) => session.set_jet_focus(on).await,
            Self::Heating(on) => session.set_heating(on).await,
            Self::TargetTemperature(celsius) => session.set_target_temperature(celsius).await,
            Self::Humidifier(on) => session.set_humidifier(on).await,
            Self::TargetHumidity(percent) => session.set_target_humidity(percent).await,
        };
        result.with_context(|| format!("Failed to send {:?} to {}", self, session.serial()))
    }
}

fn parse_switch(value: &str) -> Result<bool> {
    match value.to_ascii_lowercase().as_str() {
        "on" | "true" | "1" | "yes" => Ok(true),
        "off" | "false" | "0" | "no" => Ok(false),
        _ => bail!("Expected on or off, got '{}'", value),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_switches() {
        assert_eq!(DeviceCommand::parse(Setting::Power, "ON").unwrap(), DeviceCommand::Power(true));
        assert_eq!(
            DeviceCommand::parse(Setting::Night, "off").unwrap(),
            DeviceCommand::NightMode(false)
        );
        assert!(DeviceCommand::parse(Setting::Heating, "maybe").is_err());
    }

    #[test]
    fn test_parse_speed() {
        assert_eq!(DeviceCommand::parse(Setting::Speed, "7").unwrap(), DeviceCommand::FanSpeed(7));
        assert_eq!(
            DeviceCommand::parse(Setting::Speed, "Auto").unwrap(),
            DeviceCommand::AutoMode(true)
        );
        assert!(DeviceCommand::parse(Setting::Speed, "fast").is_err());
    }

    #[test]
    fn test_parse_angles() {
        assert_eq!(
            DeviceCommand::parse(Setting::Angles, "45 - 315").unwrap(),
            DeviceCommand::OscillationAngles(45, 315)
        );
        assert!(DeviceCommand::parse(Setting::Angles, "45").is_err());
        assert!(DeviceCommand::parse(Setting::Angles, "a-b").is_err());
    }

    #[test]
    fn test_parse_targets() {
        assert_eq!(
            DeviceCommand::parse(Setting::TargetTemperature, "21.5").unwrap(),
            DeviceCommand::TargetTemperature(21.5)
        );
        assert_eq!(
            DeviceCommand::parse(Setting::TargetHumidity, "55%").unwrap(),
            DeviceCommand::TargetHumidity(55)
        );
    }
}
