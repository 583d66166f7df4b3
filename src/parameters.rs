/// Width of a parameter's value as it travels on the wire.
///
/// `None` in the [`for_each_parameter`] table means the controller firmware does not accept the
/// code in its plain form: such parameters can only be carried via the `0xFE` escape.
#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize)]
pub enum Width {
    /// A fixed number of value bytes follow the parameter code.
    Fixed(u8),
    /// The value length varies (e.g. WiFi credentials). Plain entries carry no value bytes.
    Variable,
}

impl Width {
    pub const fn bytes(&self) -> usize {
        match *self {
            Width::Fixed(n) => n as usize,
            Width::Variable => 0,
        }
    }
}

impl std::fmt::Display for Width {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match *self {
            Width::Fixed(n) => f.write_fmt(format_args!("{}", n)),
            Width::Variable => f.write_str("variable"),
        }
    }
}

macro_rules! for_each_parameter {
    ($m:ident) => {
        $m! {
            0x01: ON_OFF, size = 1, "Turn the unit on (1) or off (0)";
            0x02: SPEED, size = 1, "Speed preset: 1..3, or 255 for manual speed";
            0x06: BOOST_MODE, size = 1, "Boost mode state";
            0x07: TIMER_MODE, size = 1, "Timer mode: 0=off, 1=night, 2=party";
            0x08: TIMER_COUNT_DOWN, size = 3, "Timer count down: seconds, minutes, hours";
            0x0F: HUMIDITY_SENSOR_ACTIVATION, size = 1, "Humidity sensor enabled";
            0x14: RELAY_SENSOR_ACTIVATION, "Relay sensor enabled";
            0x16: VOLTAGE_SENSOR_ACTIVATION, size = 1, "0-10V sensor enabled";
            0x19: HUMIDITY_THRESHOLD, size = 1, "Humidity threshold in %RH";
            0x24: CURRENT_RTC_BATTERY_VOLTAGE, size = 2, "RTC battery voltage in mV (0-5000)";
            0x25: CURRENT_HUMIDITY, size = 1, "Current humidity in %RH";
            0x2D: CURRENT_VOLTAGE_SENSOR_STATE, size = 1, "0-10V sensor reading (0-100)";
            0x32: CURRENT_RELAY_SENSOR_STATE, size = 1, "Relay sensor state";
            0x44: MANUAL_SPEED, size = 1, "Manual speed setting (0-255)";
            0x4A: FAN1_RPM, size = 2, "Fan 1 speed in RPM";
            0x4B: FAN2_RPM, size = 2, "Fan 2 speed in RPM";
            0x64: FILTER_TIMER, size = 3, "Time until filter replacement: minutes, hours, days";
            0x65: RESET_FILTER_TIMER, size = 1, "Reset the filter replacement timer";
            0x66: BOOST_MODE_DEACTIVATION_DELAY, size = 1, "Boost turn-off delay in minutes (0-60)";
            0x6F: RTC_TIME, size = 3, "RTC time: seconds, minutes, hours";
            0x70: RTC_CALENDAR, size = 4, "RTC calendar: day, weekday, month, year";
            0x72: WEEKLY_SCHEDULE, size = 1, "Weekly schedule enabled";
            0x77: SCHEDULE_SETUP, size = 6, "Weekly schedule entry setup";
            0x7C: SEARCH, size = 16, "Device search; the reply carries the device ID";
            0x7D: PASSWORD, "Controller password";
            0x7E: MACHINE_HOURS, size = 4, "Machine hours: minutes, hours, days (2 bytes)";
            0x80: RESET_ALARMS, size = 1, "Reset the alarms";
            0x83: READ_ALARM, size = 1, "Alarm state: 0=none, 1=alarm, 2=warning";
            0x85: CLOUD_SERVER_OPERATION_PERMISSION, size = 1, "Cloud server control allowed";
            0x86: READ_FIRMWARE_VERSION, size = 6, "Firmware major, minor, day, month, year";
            0x87: RESTORE_FACTORY_SETTINGS, size = 1, "Restore the factory settings";
            0x88: FILTER_ALARM, size = 1, "Filter needs replacement";
            0x94: WIFI_MODE, size = 1, "WiFi mode: 1=client, 2=access point";
            0x95: WIFI_NAME, size = 0, "WiFi network name in client mode";
            0x96: WIFI_PASSWORD, size = 0, "WiFi password";
            0x99: WIFI_ENCRYPTION, size = 1, "WiFi encryption type";
            0x9A: WIFI_CHANNEL, size = 1, "WiFi channel (1-13)";
            0x9B: WIFI_DHCP, size = 1, "WiFi DHCP: 0=static, 1=DHCP, 2=invert";
            0x9C: IP_ADDRESS, size = 4, "Assigned static IP address";
            0x9D: SUBNET_MASK, size = 4, "Subnet mask";
            0x9E: GATEWAY, "Gateway address";
            0xA3: CURRENT_IP_ADDRESS, size = 4, "Current IP address of the controller";
            0xB7: VENTILATION_MODE, size = 1, "Airflow: 0=one way, 1=two way, 2=in";
            0xB9: UNIT_TYPE, size = 2, "Unit type";
        }
    };
}

macro_rules! width {
    () => {
        None
    };
    (0) => {
        Some(Width::Variable)
    };
    ($n: literal) => {
        Some(Width::Fixed($n))
    };
}

macro_rules! make_parameters {
    ($($code: literal: $name: ident $(, size = $size: tt)?, $description: literal;)+) => {
        /// A parameter known to the controller firmware.
        #[allow(non_camel_case_types)]
        #[derive(
            Clone, Copy, Debug, PartialEq, Eq, Hash,
            strum::FromRepr, strum::IntoStaticStr, strum::EnumString, strum::VariantArray,
        )]
        #[repr(u8)]
        pub enum Parameter {
            $($name = $code),*
        }

        static CODES: &[u8] = &[$($code),*];
        static WIDTHS: &[Option<Width>] = &[$(width!($($size)?)),*];
        pub static DESCRIPTIONS: &[&str] = &[$($description),*];
    };
}

for_each_parameter!(make_parameters);

const _: () = {
    let mut index = 1;
    while index < CODES.len() {
        if CODES[index] <= CODES[index - 1] {
            panic!("parameter codes are not sorted (or have duplicate values)!");
        }
        index += 1;
    }
};

/// Look up the wire width of a parameter code.
///
/// Returns `None` for codes the registry does not know about, including the named parameters
/// which the firmware only accepts via the escape form.
pub fn size_of(code: u8) -> Option<Width> {
    let index = CODES.binary_search(&code).ok()?;
    WIDTHS[index]
}

impl Parameter {
    pub fn from_code(code: u8) -> Option<Parameter> {
        Self::from_repr(code)
    }

    pub fn from_name(name: &str) -> Option<Parameter> {
        name.to_uppercase().parse().ok()
    }

    pub fn all() -> impl Iterator<Item = Parameter> {
        <Self as strum::VariantArray>::VARIANTS.iter().copied()
    }

    pub const fn code(self) -> u8 {
        self as u8
    }

    pub fn name(self) -> &'static str {
        self.into()
    }

    fn index(self) -> usize {
        // CODES is sorted and `Parameter` is generated from the same list.
        CODES.partition_point(|c| *c < self.code())
    }

    pub fn width(self) -> Option<Width> {
        WIDTHS[self.index()]
    }

    pub fn description(self) -> &'static str {
        DESCRIPTIONS[self.index()]
    }
}

impl std::fmt::Display for Parameter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

impl From<Parameter> for u8 {
    fn from(value: Parameter) -> Self {
        value.code()
    }
}
