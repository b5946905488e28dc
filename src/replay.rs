use std::{error, fmt, io, time::Duration};

use log::{debug, info, trace};
use tokio::runtime;

use crate::buffer::{ChecksumStatus, PacketBuffer};
use crate::forward::{self, Disposition, Forwarder};
use crate::ip::MAX_IPV4_HEADER_LENGTH;
use crate::logger::fmt_slice_hex;
use crate::pcap::{PcapError, PcapReader, PcapSender, PcapWriter};
use crate::route::{Hook, Interfaces, RouteError, RouteTable, StaticRouteTable};

pub const DEFAULT_HEADROOM: usize = 64;
pub const DEFAULT_DEVICE: &str = "eth0";

#[derive(Clone)]
pub struct Config {
    pub routes: String,
    pub input: String,
    pub output: String,
    pub hook: Hook,
    pub device: String,
    pub headroom: usize,
    pub forward: forward::Config,
}

#[derive(Clone, Copy, Default, PartialEq, Eq, Debug)]
pub struct Stats {
    pub passed: usize,
    pub modified: usize,
    pub rejected: usize,
}

impl fmt::Display for Stats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "passed = {}, modified = {}, rejected = {}",
            self.passed, self.modified, self.rejected
        )
    }
}

/// Replays a PCAP file through the forwarder, writing every accepted packet into the
/// output file.
pub fn run(config: Config) -> Result<Stats, ReplayError> {
    let rt = runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    let result = rt.block_on(replay(&config));
    rt.shutdown_timeout(Duration::from_secs(60));
    result
}

async fn replay(config: &Config) -> Result<Stats, ReplayError> {
    let table = match StaticRouteTable::load(&config.routes).await {
        Ok(table) => table,
        Err(err) => {
            log::error!("Failed to load routes from {}: {err}", config.routes);
            return Err(err.into());
        }
    };
    info!("Loaded {} routes from {}", table.route_count(), config.routes);
    for (table_id, route) in table.routes() {
        debug!("Route {route} table {table_id}");
    }
    let forwarder = Forwarder::new(config.forward, &table);

    let mut reader = PcapReader::open(&config.input).await?;
    let writer = PcapWriter::new(&config.output).await?;
    let sender = writer.create_sender();
    let writer_handle = tokio::spawn(writer.run());

    let interfaces = if config.device.is_empty() {
        Interfaces::default()
    } else {
        match config.hook {
            Hook::PreRouting => Interfaces::incoming(&config.device),
            Hook::LocalOut => Interfaces::outgoing(&config.device),
        }
    };
    info!(
        "Replaying {} into {} at {} hook",
        config.input,
        config.output,
        interfaces.hook()
    );

    let result = forward_records(
        &forwarder,
        &mut reader,
        &sender,
        &interfaces,
        config.headroom,
    )
    .await;
    drop(sender);
    let write_result = writer_handle
        .await
        .map_err(|_| "PCAP writer task failed")?;

    let stats = result?;
    write_result?;
    info!("Replay completed: {stats}");
    Ok(stats)
}

async fn forward_records<R: RouteTable>(
    forwarder: &Forwarder<R>,
    reader: &mut PcapReader,
    sender: &PcapSender,
    interfaces: &Interfaces<'_>,
    headroom: usize,
) -> Result<Stats, ReplayError> {
    let mut stats = Stats::default();
    while let Some(record) = reader.next_record().await? {
        if record.data.first().map(|b| b >> 4) != Some(4) {
            trace!("Passing through non-IPv4 record");
            stats.passed += 1;
            sender.send_packet(record.timestamp, &record.data).await?;
            continue;
        }

        let mut packet = PacketBuffer::new(&record.data, headroom);
        if matches!(packet.header(), Ok(header) if header.verify_checksum()) {
            packet.set_checksum_status(ChecksumStatus::Unnecessary);
        }
        match forwarder.process(&mut packet, interfaces) {
            Disposition::Unchanged => {
                stats.passed += 1;
                sender.send_packet(record.timestamp, packet.data()).await?;
            }
            Disposition::Modified => {
                stats.modified += 1;
                sender.send_packet(record.timestamp, packet.data()).await?;
            }
            Disposition::Reject => {
                stats.rejected += 1;
                let header_length = record.data.len().min(MAX_IPV4_HEADER_LENGTH);
                trace!(
                    "Dropped packet with header {}",
                    fmt_slice_hex(&record.data[..header_length])
                );
            }
        }
    }
    Ok(stats)
}

#[derive(Debug)]
pub enum ReplayError {
    Internal(&'static str),
    Route(RouteError),
    Pcap(PcapError),
    Io(io::Error),
}

impl fmt::Display for ReplayError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Internal(msg) => f.write_str(msg),
            Self::Route(e) => write!(f, "Route error: {e}"),
            Self::Pcap(e) => write!(f, "PCAP error: {e}"),
            Self::Io(e) => write!(f, "IO error: {e}"),
        }
    }
}

impl error::Error for ReplayError {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match self {
            Self::Internal(_msg) => None,
            Self::Route(err) => Some(err),
            Self::Pcap(err) => Some(err),
            Self::Io(err) => Some(err),
        }
    }
}

impl From<&'static str> for ReplayError {
    fn from(msg: &'static str) -> ReplayError {
        Self::Internal(msg)
    }
}

impl From<RouteError> for ReplayError {
    fn from(err: RouteError) -> ReplayError {
        Self::Route(err)
    }
}

impl From<PcapError> for ReplayError {
    fn from(err: PcapError) -> ReplayError {
        Self::Pcap(err)
    }
}

impl From<io::Error> for ReplayError {
    fn from(err: io::Error) -> ReplayError {
        Self::Io(err)
    }
}
