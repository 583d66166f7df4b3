use std::net::IpAddr;

use futures::StreamExt as _;

use crate::connection::{self, Transport};
use crate::device::DEFAULT_PASSWORD;
use crate::output;
use crate::parameters::{Parameter, Width, size_of};
use crate::protocol::{DataEntry, Packet};

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("could not start the async runtime")]
    Runtime(#[source] std::io::Error),
    #[error("could not communicate with the controller")]
    Connection(#[source] connection::Error),
    #[error("could not output the results")]
    Output(#[source] output::Error),
    #[error("no controller with ID `{0}` answered the discovery request")]
    NotFound(String),
    #[error("the controller at {0} did not respond")]
    NoResponse(IpAddr),
}

impl From<output::Error> for Error {
    fn from(value: output::Error) -> Self {
        Error::Output(value)
    }
}

impl From<connection::Error> for Error {
    fn from(value: connection::Error) -> Self {
        Error::Connection(value)
    }
}

/// Which controller to talk to.
#[derive(clap::Parser, Clone, Debug)]
#[group(id = "commands::Target")]
pub struct Target {
    /// The controller ID, as reported by `discover`.
    #[arg(long, short = 'i')]
    device_id: String,

    /// The controller password.
    #[arg(long, default_value = DEFAULT_PASSWORD)]
    password: String,

    /// The IP address of the controller. Found via discovery if not specified.
    #[arg(long)]
    ip: Option<IpAddr>,
}

impl Target {
    async fn resolve(&self, transport: &Transport) -> Result<IpAddr, Error> {
        if let Some(ip) = self.ip {
            return Ok(ip);
        }
        let mut addresses = std::pin::pin!(transport.discover_stream());
        while let Some(address) = addresses.next().await {
            let address = address?;
            if address.id == self.device_id {
                return Ok(address.ip);
            }
        }
        Err(Error::NotFound(self.device_id.clone()))
    }

    async fn exchange(&self, transport: &Transport, packet: &Packet) -> Result<Packet, Error> {
        let ip = self.resolve(transport).await?;
        let response = transport.exchange(packet, ip).await?;
        Ok(response.ok_or(Error::NoResponse(ip))?.packet)
    }
}

fn runtime() -> Result<tokio::runtime::Runtime, Error> {
    tokio::runtime::Builder::new_current_thread().enable_all().build().map_err(Error::Runtime)
}

/// Parse a parameter name (case insensitive) or a numeric parameter code.
pub fn parse_parameter(s: &str) -> Result<u8, String> {
    if let Some(parameter) = Parameter::from_name(s) {
        return Ok(parameter.code());
    }
    parse_integer(s)
        .and_then(|v| u8::try_from(v).ok())
        .ok_or_else(|| format!("`{s}` is neither a parameter name nor a code between 0 and 255"))
}

fn parse_integer(s: &str) -> Option<u64> {
    match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16).ok(),
        None => s.parse().ok(),
    }
}

fn parse_hex(s: &str) -> Option<Vec<u8>> {
    if s.len() % 2 != 0 {
        return None;
    }
    (0..s.len()).step_by(2).map(|i| u8::from_str_radix(s.get(i..i + 2)?, 16).ok()).collect()
}

/// Parse `PARAMETER=VALUE` into a data entry.
///
/// `VALUE` is either `hex:` followed by the raw value bytes, an integer stored little-endian
/// for parameters of a fixed width, or text for the parameters without one.
pub fn parse_assignment(s: &str) -> Result<DataEntry, String> {
    let Some((parameter, value)) = s.split_once('=') else {
        return Err(format!("`{s}` is not in the PARAMETER=VALUE form"));
    };
    let parameter = parse_parameter(parameter)?;
    if let Some(hex) = value.strip_prefix("hex:") {
        let bytes = parse_hex(hex).ok_or_else(|| format!("`{hex}` is not a hex byte string"))?;
        return Ok(DataEntry::new(parameter, Some(bytes)));
    }
    let bytes = match size_of(parameter) {
        Some(Width::Fixed(width)) => {
            let width = usize::from(width);
            let number = parse_integer(value).ok_or_else(|| format!("`{value}` is not a number"))?;
            let bytes = number.to_le_bytes();
            let (used, rest) = bytes.split_at(width.min(bytes.len()));
            if rest.iter().any(|b| *b != 0) {
                return Err(format!("{number} does not fit into {width} bytes"));
            }
            let mut value = used.to_vec();
            value.resize(width, 0);
            value
        }
        Some(Width::Variable) | None => value.as_bytes().to_vec(),
    };
    Ok(DataEntry::new(parameter, Some(bytes)))
}

#[derive(serde::Serialize)]
struct EntryRecord {
    code: u8,
    name: Option<&'static str>,
    value: Option<String>,
    number: Option<u64>,
}

impl EntryRecord {
    fn new(entry: &DataEntry) -> Self {
        let value = entry.value();
        Self {
            code: entry.parameter(),
            name: entry.known_parameter().map(Parameter::name),
            value: value.map(|v| v.iter().map(|b| format!("{b:02x}")).collect()),
            number: value.filter(|v| v.len() <= 8).map(|v| {
                let mut bytes = [0; 8];
                bytes[..v.len()].copy_from_slice(v);
                u64::from_le_bytes(bytes)
            }),
        }
    }

    fn row(&self) -> Vec<String> {
        vec![
            format!("0x{:02X}", self.code),
            self.name.unwrap_or_default().to_string(),
            self.value.clone().unwrap_or_default(),
            self.number.map(|n| n.to_string()).unwrap_or_default(),
        ]
    }
}

fn output_entries(output: &mut output::Output, packet: &Packet) -> Result<(), Error> {
    output.table_headers(&["Code", "Parameter", "Raw", "Number"])?;
    for entry in &packet.entries {
        let record = EntryRecord::new(entry);
        output.result(|| record.row(), || &record)?;
    }
    Ok(())
}

pub mod parameters {
    use crate::output;
    use crate::parameters::Parameter;

    /// Search and output the parameters known to the controllers.
    #[derive(clap::Parser)]
    pub struct Args {
        #[clap(flatten)]
        output: output::Args,
        filter: Option<String>,
    }

    #[derive(serde::Serialize)]
    pub struct ParameterSchema {
        pub code: u8,
        pub name: &'static str,
        pub width: Option<crate::parameters::Width>,
        pub description: &'static str,
    }

    impl ParameterSchema {
        pub fn all_parameters() -> impl Iterator<Item = Self> {
            Parameter::all().map(|p| ParameterSchema {
                code: p.code(),
                name: p.name(),
                width: p.width(),
                description: p.description(),
            })
        }

        pub fn is_match(&self, pattern: &str) -> bool {
            let pattern = pattern.to_uppercase();
            self.name.contains(&pattern)
                || self.description.to_uppercase().contains(&pattern)
                || format!("0x{:02X}", self.code).contains(&pattern)
        }
    }

    pub fn run(args: Args) -> Result<(), super::Error> {
        let mut output = args.output.to_output()?;
        output.table_headers(&["Code", "Name", "Width", "Description"])?;
        for parameter in ParameterSchema::all_parameters() {
            if let Some(pattern) = &args.filter {
                if !parameter.is_match(pattern) {
                    continue;
                }
            }
            output.result(
                || {
                    vec![
                        format!("0x{:02X}", parameter.code),
                        parameter.name.to_string(),
                        parameter.width.map(|w| w.to_string()).unwrap_or_else(|| "-".into()),
                        parameter.description.to_string(),
                    ]
                },
                || &parameter,
            )?;
        }
        Ok(output.commit()?)
    }
}

pub mod discover {
    use futures::StreamExt as _;

    use crate::connection::{self, Transport};
    use crate::output;

    /// Find the controllers on the local network.
    #[derive(clap::Parser)]
    pub struct Args {
        #[clap(flatten)]
        connection: connection::Args,
        #[clap(flatten)]
        output: output::Args,
    }

    pub fn run(args: Args) -> Result<(), super::Error> {
        let mut output = args.output.to_output()?;
        let transport = Transport::new((&args.connection).into());
        super::runtime()?.block_on(async {
            output.table_headers(&["ID", "IP"])?;
            let mut addresses = std::pin::pin!(transport.discover_stream());
            while let Some(address) = addresses.next().await {
                let address = address?;
                output.result(|| vec![address.id.clone(), address.ip.to_string()], || &address)?;
            }
            Ok::<_, super::Error>(())
        })?;
        Ok(output.commit()?)
    }
}

pub mod read {
    use crate::connection::{self, Transport};
    use crate::output;
    use crate::protocol::{DataEntry, FunctionCode, Packet};

    #[derive(clap::ValueEnum, Clone, Copy, Debug)]
    pub enum Function {
        Read,
        IncRead,
        DecRead,
    }

    /// Read raw parameter values from a controller.
    #[derive(clap::Parser)]
    pub struct Args {
        #[clap(flatten)]
        connection: connection::Args,
        #[clap(flatten)]
        target: super::Target,
        #[clap(flatten)]
        output: output::Args,
        /// Increment or decrement the parameters before reading them back.
        #[arg(long, value_enum, default_value_t = Function::Read)]
        function: Function,
        /// Parameter names or codes.
        #[arg(required = true, value_parser = super::parse_parameter)]
        parameters: Vec<u8>,
    }

    pub fn run(args: Args) -> Result<(), super::Error> {
        let mut output = args.output.to_output()?;
        let transport = Transport::new((&args.connection).into());
        let function = match args.function {
            Function::Read => FunctionCode::Read,
            Function::IncRead => FunctionCode::IncRead,
            Function::DecRead => FunctionCode::DecRead,
        };
        let entries = args.parameters.iter().map(|p| DataEntry::new(*p, None)).collect();
        let request = Packet::new(
            args.target.device_id.as_str(),
            args.target.password.as_str(),
            function,
            entries,
        );
        let response = super::runtime()?.block_on(args.target.exchange(&transport, &request))?;
        super::output_entries(&mut output, &response)?;
        Ok(output.commit()?)
    }
}

pub mod status {
    use crate::connection::{self, Transport};
    use crate::device::Device;
    use crate::output;

    /// Show the state of a controller.
    #[derive(clap::Parser)]
    pub struct Args {
        #[clap(flatten)]
        connection: connection::Args,
        #[clap(flatten)]
        target: super::Target,
        #[clap(flatten)]
        output: output::Args,
    }

    pub fn run(args: Args) -> Result<(), super::Error> {
        let jsonl = args.output.is_jsonl();
        let mut output = args.output.to_output()?;
        let transport = Transport::new((&args.connection).into());
        let request = Device::status_request(&args.target.device_id, &args.target.password);
        let response = super::runtime()?.block_on(args.target.exchange(&transport, &request))?;
        let device = Device::from_packet(&response);
        if jsonl {
            output.result(Vec::new, || &device)?;
        } else {
            output.table_headers(&["Field", "Value"])?;
            for (field, value) in device.fields() {
                output.result(|| vec![field.to_string(), value], || ())?;
            }
        }
        Ok(output.commit()?)
    }
}

pub mod write {
    use crate::connection::{self, Transport};
    use crate::output;
    use crate::protocol::{DataEntry, FunctionCode, Packet};

    /// Change parameter values of a controller.
    ///
    /// Values are written as `PARAMETER=VALUE`. Numbers are stored little-endian in the width
    /// of the parameter, `hex:0a0b` specifies the raw bytes.
    #[derive(clap::Parser)]
    pub struct Args {
        #[clap(flatten)]
        connection: connection::Args,
        #[clap(flatten)]
        target: super::Target,
        #[clap(flatten)]
        output: output::Args,
        /// Use WRITE rather than WRITEREAD. Controllers do not answer such requests.
        #[arg(long)]
        no_read: bool,
        #[arg(required = true, value_parser = super::parse_assignment)]
        assignments: Vec<DataEntry>,
    }

    pub fn run(args: Args) -> Result<(), super::Error> {
        let mut output = args.output.to_output()?;
        let transport = Transport::new((&args.connection).into());
        let function = if args.no_read { FunctionCode::Write } else { FunctionCode::WriteRead };
        let request = Packet::new(
            args.target.device_id.as_str(),
            args.target.password.as_str(),
            function,
            args.assignments,
        );
        let runtime = super::runtime()?;
        if args.no_read {
            runtime.block_on(async {
                let ip = args.target.resolve(&transport).await?;
                transport.send_only(&request, ip).await?;
                Ok::<_, super::Error>(())
            })?;
            return Ok(output.commit()?);
        }
        let response = runtime.block_on(args.target.exchange(&transport, &request))?;
        super::output_entries(&mut output, &response)?;
        Ok(output.commit()?)
    }
}
