use std::{env, fmt, process, str::FromStr};

mod buffer;
mod forward;
mod ip;
mod ipip;
mod logger;
mod options;
mod pcap;
mod replay;
mod route;

enum Action {
    Replay(replay::Config),
}

pub struct Args {
    log_level: log::LevelFilter,
    action: Action,
}

const USAGE_INSTRUCTIONS: &str = "Usage: asnfwd [OPTIONS] replay\n\n\
Options:\
\n      --log-level=<LOG_LEVEL>          Log level [default: info]\
\n      --table=<ID>                     Routing table with ASN gateways [default: 100]\
\n      --format=<FORMAT>                Encoding, ipip (0) or options (1) [default: ipip]\
\n      --debug=<on|off>                 Log every processed packet [default: off]\
\n      --routes=<FILENAME>              Path to static routes file\
\n      --input=<FILENAME>               Path to input PCAP file\
\n      --output=<FILENAME>              Path to output PCAP file\
\n      --hook=<HOOK>                    Hook point, pre-routing or local-out [default: pre-routing]\
\n      --device=<NAME>                  Ingress or egress device [default: eth0]\
\n      --headroom=<BYTES>               Free space reserved before each packet [default: 64]\
\n      --help                           Print help";

impl Args {
    fn parse() -> Args {
        let fail_with_error = |name: &str, value: &str, err: fmt::Arguments| {
            eprintln!(
                "Argument {} has an unsupported value {}: {}",
                name, value, err
            );
            println!("{}", USAGE_INSTRUCTIONS);
            process::exit(2);
        };

        let mut log_level = log::LevelFilter::Info;
        let mut forward_config = forward::Config::default();
        let mut routes = None;
        let mut input = None;
        let mut output = None;
        let mut hook = route::Hook::PreRouting;
        let mut device = replay::DEFAULT_DEVICE.to_string();
        let mut headroom = replay::DEFAULT_HEADROOM;

        for arg in env::args()
            .take(env::args().len().saturating_sub(1))
            .skip(1)
        {
            if arg == "--help" || arg == "help" {
                println!("{}", USAGE_INSTRUCTIONS);
                process::exit(0);
            }
            let (name, value) = if let Some(arg) = arg.split_once('=') {
                arg
            } else {
                eprintln!("Option flag {} has no value", arg);
                println!("{}", USAGE_INSTRUCTIONS);
                process::exit(2);
            };

            if name == "--log-level" {
                log_level = match value.to_uppercase().as_str() {
                    "TRACE" => log::LevelFilter::Trace,
                    "DEBUG" => log::LevelFilter::Debug,
                    "INFO" => log::LevelFilter::Info,
                    "WARN" => log::LevelFilter::Warn,
                    "ERROR" => log::LevelFilter::Error,
                    "OFF" => log::LevelFilter::Off,
                    _ => {
                        fail_with_error(name, value, format_args!("Unsupported log level"));
                        process::exit(2);
                    }
                };
            } else if name == "--table" {
                match u32::from_str(value) {
                    Ok(table) => forward_config.table = table,
                    Err(err) => fail_with_error(
                        name,
                        value,
                        format_args!("Failed to parse table ID: {}", err),
                    ),
                };
            } else if name == "--format" {
                match forward::Format::from_str(value) {
                    Ok(format) => forward_config.format = format,
                    Err(err) => fail_with_error(name, value, format_args!("{}", err)),
                };
            } else if name == "--debug" {
                forward_config.debug = match value.to_lowercase().as_str() {
                    "on" | "1" => true,
                    "off" | "0" => false,
                    _ => {
                        fail_with_error(name, value, format_args!("Must be on or off"));
                        process::exit(2);
                    }
                };
            } else if name == "--routes" {
                routes = Some(value.to_string());
            } else if name == "--input" {
                input = Some(value.to_string());
            } else if name == "--output" {
                output = Some(value.to_string());
            } else if name == "--hook" {
                match route::Hook::from_str(value) {
                    Ok(value) => hook = value,
                    Err(err) => fail_with_error(name, value, format_args!("{}", err)),
                };
            } else if name == "--device" {
                device = value.to_string();
            } else if name == "--headroom" {
                match usize::from_str(value) {
                    Ok(value) => headroom = value,
                    Err(err) => fail_with_error(
                        name,
                        value,
                        format_args!("Failed to parse headroom: {}", err),
                    ),
                };
            } else {
                eprintln!("Unsupported argument {}", arg);
            }
        }

        if forward_config.debug {
            log_level = log_level.max(log::LevelFilter::Debug);
        }

        let action = if let Some(action) = env::args().last() {
            action
        } else {
            eprintln!("No action specified");
            println!("{}", USAGE_INSTRUCTIONS);
            process::exit(2);
        };

        match action.as_str() {
            "replay" => {
                let (routes, input, output) = match (routes, input, output) {
                    (Some(routes), Some(input), Some(output)) => (routes, input, output),
                    _ => {
                        eprintln!("Replay needs --routes, --input and --output");
                        println!("{}", USAGE_INSTRUCTIONS);
                        process::exit(2);
                    }
                };
                let action = Action::Replay(replay::Config {
                    routes,
                    input,
                    output,
                    hook,
                    device,
                    headroom,
                    forward: forward_config,
                });
                Args { log_level, action }
            }
            _ => {
                eprintln!("No action specified");
                println!("{}", USAGE_INSTRUCTIONS);
                process::exit(2);
            }
        }
    }
}

fn main() {
    println!(
        "asnfwd version {}",
        option_env!("CARGO_PKG_VERSION").unwrap_or("unknown")
    );
    let args = Args::parse();

    if let Err(err) = logger::setup_logger(args.log_level) {
        eprintln!("Failed to set up logger, error is {}", err);
    }
    match args.action {
        Action::Replay(config) => match replay::run(config) {
            Ok(stats) => println!("{}", stats),
            Err(err) => {
                println!("Failed to replay packets, error is {}", err);
                std::process::exit(1);
            }
        },
    }
}
