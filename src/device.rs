//! Interpretation of data entries as the state of a single controller.

use std::net::Ipv4Addr;

use tracing::debug;

use crate::parameters::Parameter;
use crate::protocol::{DataEntry, FunctionCode, Packet};

/// Password the controllers ship with.
pub const DEFAULT_PASSWORD: &str = "1111";

/// Parameters requested by [`Device::status_request`].
pub const STATUS_PARAMETERS: &[Parameter] = &[
    Parameter::ON_OFF,
    Parameter::VENTILATION_MODE,
    Parameter::SPEED,
    Parameter::MANUAL_SPEED,
    Parameter::FAN1_RPM,
    Parameter::FILTER_ALARM,
    Parameter::FILTER_TIMER,
    Parameter::CURRENT_HUMIDITY,
    Parameter::READ_FIRMWARE_VERSION,
    Parameter::CURRENT_IP_ADDRESS,
];

#[derive(
    Clone,
    Copy,
    Debug,
    PartialEq,
    Eq,
    strum::FromRepr,
    strum::IntoStaticStr,
    strum::EnumString,
    strum::VariantNames,
    serde::Serialize,
)]
#[strum(serialize_all = "kebab-case")]
#[serde(rename_all = "kebab-case")]
#[repr(u8)]
pub enum Speed {
    Off = 0,
    Low = 1,
    Medium = 2,
    High = 3,
    /// Fan speed follows [`Device::manual_speed`].
    Manual = 255,
}

/// Airflow direction. The available ones depend on the DIP switches of the unit.
#[derive(
    Clone,
    Copy,
    Debug,
    PartialEq,
    Eq,
    strum::FromRepr,
    strum::IntoStaticStr,
    strum::EnumString,
    strum::VariantNames,
    serde::Serialize,
)]
#[strum(serialize_all = "kebab-case")]
#[serde(rename_all = "kebab-case")]
#[repr(u8)]
pub enum Mode {
    OneWay = 0,
    TwoWay = 1,
    In = 2,
}

#[derive(Clone, Debug, Default, PartialEq, serde::Serialize)]
pub struct Device {
    pub id: String,
    #[serde(skip)]
    pub password: String,
    pub on: bool,
    pub speed: Option<Speed>,
    pub mode: Option<Mode>,
    pub manual_speed: Option<u8>,
    pub fan1_rpm: Option<u16>,
    pub humidity: Option<u8>,
    pub filter_alarm: bool,
    /// Minutes until the filter needs replacing.
    pub filter_time: Option<u32>,
    pub firmware_version: Option<String>,
    pub firmware_date: Option<jiff::civil::Date>,
    pub unit_type: Option<u8>,
    pub ip_address: Option<Ipv4Addr>,
}

/// Stores the value of a data entry into the device. `None` if the value is not usable.
type Apply = fn(&mut Device, &[u8]) -> Option<()>;

static MAPPING: &[(Parameter, Apply)] = &[
    (Parameter::ON_OFF, |d, v| {
        d.on = *v.first()? == 1;
        Some(())
    }),
    (Parameter::SPEED, |d, v| {
        d.speed = Some(Speed::from_repr(*v.first()?)?);
        Some(())
    }),
    (Parameter::VENTILATION_MODE, |d, v| {
        d.mode = Some(Mode::from_repr(*v.first()?)?);
        Some(())
    }),
    (Parameter::MANUAL_SPEED, |d, v| {
        d.manual_speed = Some(*v.first()?);
        Some(())
    }),
    (Parameter::FAN1_RPM, |d, v| {
        d.fan1_rpm = Some(u16::from_le_bytes(*v.first_chunk()?));
        Some(())
    }),
    (Parameter::FILTER_ALARM, |d, v| {
        d.filter_alarm = *v.first()? == 1;
        Some(())
    }),
    (Parameter::FILTER_TIMER, |d, v| {
        let [minutes, hours, days] = *v.first_chunk::<3>()?;
        let hours = u32::from(days) * 24 + u32::from(hours);
        d.filter_time = Some(u32::from(minutes) + hours * 60);
        Some(())
    }),
    (Parameter::CURRENT_HUMIDITY, |d, v| {
        d.humidity = Some(*v.first()?);
        Some(())
    }),
    (Parameter::READ_FIRMWARE_VERSION, |d, v| {
        let [major, minor, day, month, year_low, year_high] = *v.first_chunk::<6>()?;
        d.firmware_version = Some(format!("{major}.{minor}"));
        let year = i16::try_from(u16::from_le_bytes([year_low, year_high])).ok()?;
        let (month, day) = (i8::try_from(month).ok()?, i8::try_from(day).ok()?);
        d.firmware_date = Some(jiff::civil::Date::new(year, month, day).ok()?);
        Some(())
    }),
    (Parameter::CURRENT_IP_ADDRESS, |d, v| {
        let [a, b, c, e] = *v.first_chunk::<4>()?;
        d.ip_address = Some(Ipv4Addr::new(a, b, c, e));
        Some(())
    }),
    (Parameter::UNIT_TYPE, |d, v| {
        d.unit_type = Some(*v.first()?);
        Some(())
    }),
];

impl Device {
    pub fn new(id: impl Into<String>, password: impl Into<String>) -> Self {
        Self { id: id.into(), password: password.into(), ..Default::default() }
    }

    /// Request for everything [`Device::from_packet`] knows how to interpret.
    pub fn status_request(id: &str, password: &str) -> Packet {
        let entries = STATUS_PARAMETERS.iter().map(|p| DataEntry::of(*p)).collect();
        Packet::new(id, password, FunctionCode::Read, entries)
    }

    pub fn from_packet(packet: &Packet) -> Device {
        let mut device = Device::new(packet.device_id.as_str(), packet.password.as_str());
        for entry in &packet.entries {
            device.apply(entry);
        }
        device
    }

    /// Update the device with the value of `entry`.
    ///
    /// Returns `false` if the parameter is not one the device keeps track of, or if its value
    /// could not be interpreted.
    pub fn apply(&mut self, entry: &DataEntry) -> bool {
        let mapping = MAPPING.iter().find(|(p, _)| p.code() == entry.parameter());
        let applied = match (mapping, entry.value()) {
            (Some((_, apply)), Some(value)) => apply(self, value).is_some(),
            _ => false,
        };
        if !applied {
            debug!(message = "ignoring entry", %entry);
        }
        applied
    }

    /// A WRITEREAD request storing the settable parts of this device state.
    pub fn to_packet(&self) -> Packet {
        let mut entries = Vec::with_capacity(4);
        if let Some(speed) = self.speed {
            entries.push(DataEntry::with_byte(Parameter::SPEED, speed as u8));
        }
        if let Some(mode) = self.mode {
            entries.push(DataEntry::with_byte(Parameter::VENTILATION_MODE, mode as u8));
        }
        if let Some(manual_speed) = self.manual_speed {
            entries.push(DataEntry::with_byte(Parameter::MANUAL_SPEED, manual_speed));
        }
        entries.push(DataEntry::with_byte(Parameter::ON_OFF, u8::from(self.on)));
        Packet::new(self.id.as_str(), self.password.as_str(), FunctionCode::WriteRead, entries)
    }

    /// Field name and display value pairs, in a stable order.
    pub fn fields(&self) -> Vec<(&'static str, String)> {
        fn opt<T: ToString>(v: &Option<T>) -> String {
            v.as_ref().map(ToString::to_string).unwrap_or_default()
        }
        let name = |v: Option<&'static str>| v.unwrap_or_default().to_string();
        vec![
            ("id", self.id.clone()),
            ("on", self.on.to_string()),
            ("speed", name(self.speed.map(Into::into))),
            ("mode", name(self.mode.map(Into::into))),
            ("manual_speed", opt(&self.manual_speed)),
            ("fan1_rpm", opt(&self.fan1_rpm)),
            ("humidity", opt(&self.humidity)),
            ("filter_alarm", self.filter_alarm.to_string()),
            ("filter_time", opt(&self.filter_time)),
            ("firmware_version", opt(&self.firmware_version)),
            ("firmware_date", opt(&self.firmware_date)),
            ("unit_type", opt(&self.unit_type)),
            ("ip_address", opt(&self.ip_address)),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn response(entries: Vec<DataEntry>) -> Packet {
        Packet::new("003A00345842570F", "1111", FunctionCode::Response, entries)
    }

    #[test]
    fn maps_status_reply() {
        let packet = response(vec![
            DataEntry::with_byte(Parameter::ON_OFF, 1),
            DataEntry::with_byte(Parameter::VENTILATION_MODE, 1),
            DataEntry::with_byte(Parameter::SPEED, 255),
            DataEntry::with_byte(Parameter::MANUAL_SPEED, 128),
            DataEntry::new(Parameter::FAN1_RPM.code(), Some(vec![0x10, 0x04])),
            DataEntry::with_byte(Parameter::FILTER_ALARM, 0),
            DataEntry::new(Parameter::FILTER_TIMER.code(), Some(vec![30, 5, 2])),
            DataEntry::with_byte(Parameter::CURRENT_HUMIDITY, 47),
            DataEntry::new(
                Parameter::READ_FIRMWARE_VERSION.code(),
                Some(vec![0, 26, 15, 3, 0xE4, 0x07]),
            ),
            DataEntry::new(Parameter::CURRENT_IP_ADDRESS.code(), Some(vec![192, 168, 1, 42])),
            DataEntry::new(Parameter::UNIT_TYPE.code(), Some(vec![4, 0])),
        ]);
        let device = Device::from_packet(&packet);
        assert_eq!(device.id, "003A00345842570F");
        assert_eq!(device.password, "1111");
        assert!(device.on);
        assert_eq!(device.mode, Some(Mode::TwoWay));
        assert_eq!(device.speed, Some(Speed::Manual));
        assert_eq!(device.manual_speed, Some(128));
        assert_eq!(device.fan1_rpm, Some(0x0410));
        assert!(!device.filter_alarm);
        assert_eq!(device.filter_time, Some(30 + (2 * 24 + 5) * 60));
        assert_eq!(device.humidity, Some(47));
        assert_eq!(device.firmware_version.as_deref(), Some("0.26"));
        assert_eq!(device.firmware_date, Some(jiff::civil::date(2020, 3, 15)));
        assert_eq!(device.ip_address, Some(Ipv4Addr::new(192, 168, 1, 42)));
        assert_eq!(device.unit_type, Some(4));
    }

    #[test]
    fn ignores_unusable_entries() {
        let mut device = Device::default();
        assert!(!device.apply(&DataEntry::new(0x50, Some(vec![1]))));
        assert!(!device.apply(&DataEntry::of(Parameter::SPEED)));
        assert!(!device.apply(&DataEntry::with_byte(Parameter::SPEED, 7)));
        assert!(!device.apply(&DataEntry::with_byte(Parameter::FAN1_RPM, 7)));
        assert!(!device.apply(&DataEntry::with_byte(Parameter::BOOST_MODE, 1)));
        assert_eq!(device, Device::default());
    }

    #[test]
    fn invalid_firmware_date_keeps_version() {
        let mut device = Device::default();
        let entry = DataEntry::new(
            Parameter::READ_FIRMWARE_VERSION.code(),
            Some(vec![1, 2, 31, 2, 0xE4, 0x07]),
        );
        assert!(!device.apply(&entry));
        assert_eq!(device.firmware_version.as_deref(), Some("1.2"));
        assert_eq!(device.firmware_date, None);

        // A month byte that does not fit `i8` must not wrap around into a valid month.
        let entry = DataEntry::new(
            Parameter::READ_FIRMWARE_VERSION.code(),
            Some(vec![1, 3, 1, 0x81, 0xE4, 0x07]),
        );
        assert!(!device.apply(&entry));
        assert_eq!(device.firmware_version.as_deref(), Some("1.3"));
        assert_eq!(device.firmware_date, None);
    }

    #[test]
    fn write_request() {
        let mut device = Device::new("DEV", DEFAULT_PASSWORD);
        device.on = true;
        device.speed = Some(Speed::High);
        let packet = device.to_packet();
        assert_eq!(packet.function, FunctionCode::WriteRead);
        assert_eq!(packet.entries, vec![
            DataEntry::with_byte(Parameter::SPEED, 3),
            DataEntry::with_byte(Parameter::ON_OFF, 1),
        ]);
        let bytes = packet.to_bytes().unwrap();
        assert_eq!(&bytes[bytes.len() - 6..bytes.len() - 2], &[0x02, 0x03, 0x01, 0x01]);
    }

    #[test]
    fn status_request_is_a_read() {
        let packet = Device::status_request("DEV", DEFAULT_PASSWORD);
        assert_eq!(packet.function, FunctionCode::Read);
        assert_eq!(packet.entries.len(), STATUS_PARAMETERS.len());
        assert!(packet.entries.iter().all(|e| e.value().is_none()));
        let round_trip = Packet::from_bytes(&packet.to_bytes().unwrap()).unwrap();
        assert_eq!(round_trip, packet);
    }

    #[test]
    fn names() {
        assert_eq!("two-way".parse::<Mode>().unwrap(), Mode::TwoWay);
        assert_eq!("manual".parse::<Speed>().unwrap(), Speed::Manual);
        let fields = Device::default().fields();
        assert_eq!(fields[0].0, "id");
        assert_eq!(fields.len(), 13);
    }
}
