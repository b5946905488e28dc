use std::{error, fmt, io, time::Duration};

use tokio::{
    fs::File,
    io::{AsyncReadExt as _, AsyncWriteExt as _, BufReader, BufWriter},
    sync::mpsc,
};

const SNAPSHOT_LENGTH: usize = 65535;
// Some capture tools use a larger snapshot length; anything above this is not a valid record.
const MAX_RECORD_LENGTH: usize = 262144;
const QUEUE_LIMIT: usize = 100;

const MAGIC_MICROSECONDS: u32 = 0xA1B2C3D4;
const MAGIC_NANOSECONDS: u32 = 0xA1B23C4D;
const LINKTYPE_RAW: u32 = 101;
const LINKTYPE_IPV4: u32 = 228;

pub struct PcapRecord {
    pub timestamp: Duration,
    pub data: Vec<u8>,
}

/// Reads raw IP packets from a classic PCAP file.
pub struct PcapReader {
    file: BufReader<File>,
    big_endian: bool,
    nanoseconds: bool,
}

impl PcapReader {
    pub async fn open(path: &str) -> Result<PcapReader, PcapError> {
        let mut file = BufReader::new(File::open(path).await?);
        let mut header = [0u8; 24];
        file.read_exact(&mut header).await?;

        let mut magic = [0u8; 4];
        magic.copy_from_slice(&header[0..4]);
        let (big_endian, nanoseconds) = match u32::from_be_bytes(magic) {
            MAGIC_MICROSECONDS => (true, false),
            MAGIC_NANOSECONDS => (true, true),
            value if value.swap_bytes() == MAGIC_MICROSECONDS => (false, false),
            value if value.swap_bytes() == MAGIC_NANOSECONDS => (false, true),
            _ => return Err("Unsupported PCAP file format".into()),
        };
        let reader = PcapReader {
            file,
            big_endian,
            nanoseconds,
        };
        let link_type = reader.read_u32(&header[20..24]) & 0x0fffffff;
        if link_type != LINKTYPE_RAW && link_type != LINKTYPE_IPV4 {
            return Err("Unsupported PCAP link type, only raw IP is supported".into());
        }
        Ok(reader)
    }

    fn read_u32(&self, data: &[u8]) -> u32 {
        let mut value = [0u8; 4];
        value.copy_from_slice(data);
        if self.big_endian {
            u32::from_be_bytes(value)
        } else {
            u32::from_le_bytes(value)
        }
    }

    /// Returns the next record, or `None` at the end of the file.
    pub async fn next_record(&mut self) -> Result<Option<PcapRecord>, PcapError> {
        let mut header = [0u8; 16];
        let read = self.file.read(&mut header).await?;
        if read == 0 {
            return Ok(None);
        }
        self.file.read_exact(&mut header[read..]).await?;

        let seconds = self.read_u32(&header[0..4]);
        let fraction = self.read_u32(&header[4..8]);
        let captured_length = self.read_u32(&header[8..12]) as usize;
        if captured_length > MAX_RECORD_LENGTH {
            return Err("PCAP record is too large".into());
        }
        let subsec_nanos = if self.nanoseconds {
            fraction
        } else {
            fraction.saturating_mul(1000)
        };
        let timestamp =
            Duration::from_secs(seconds as u64) + Duration::from_nanos(subsec_nanos as u64);

        let mut data = vec![0u8; captured_length];
        self.file.read_exact(&mut data).await?;
        Ok(Some(PcapRecord { timestamp, data }))
    }
}

pub struct PcapWriter {
    file: BufWriter<File>,
    tx: mpsc::Sender<Vec<u8>>,
    rx: mpsc::Receiver<Vec<u8>>,
}

impl PcapWriter {
    pub async fn new(path: &str) -> Result<PcapWriter, io::Error> {
        let mut file = BufWriter::new(File::create(path).await?);

        // PCAP file header, indicating the file contains raw IP packets.
        file.write_u32(MAGIC_NANOSECONDS).await?;
        file.write_u16(2).await?;
        file.write_u16(4).await?;
        file.write_u32(0).await?;
        file.write_u32(0).await?;
        file.write_u32(SNAPSHOT_LENGTH as u32).await?;
        file.write_u32(LINKTYPE_RAW).await?;

        let (tx, rx) = mpsc::channel(QUEUE_LIMIT);
        Ok(PcapWriter { file, tx, rx })
    }

    pub fn create_sender(&self) -> PcapSender {
        PcapSender {
            tx: self.tx.clone(),
        }
    }

    /// Writes records until every sender is dropped.
    pub async fn run(self) -> Result<(), PcapError> {
        let PcapWriter {
            mut file,
            tx,
            mut rx,
        } = self;
        drop(tx);
        while let Some(record) = rx.recv().await {
            if let Err(err) = file.write_all(&record).await {
                log::error!("Failed to write packet to PCAP file: {err}");
                return Err(err.into());
            }
        }
        if let Err(err) = file.flush().await {
            log::error!("Failed to flush PCAP file: {err}");
            return Err(err.into());
        }
        Ok(())
    }
}

#[derive(Clone)]
pub struct PcapSender {
    tx: mpsc::Sender<Vec<u8>>,
}

impl PcapSender {
    pub async fn send_packet(&self, timestamp: Duration, packet: &[u8]) -> Result<(), PcapError> {
        let captured_length = packet.len().min(SNAPSHOT_LENGTH);
        let mut data = Vec::with_capacity(16 + captured_length);
        data.extend_from_slice(&(timestamp.as_secs() as u32).to_be_bytes());
        data.extend_from_slice(&timestamp.subsec_nanos().to_be_bytes());
        data.extend_from_slice(&(captured_length as u32).to_be_bytes());
        data.extend_from_slice(&(packet.len() as u32).to_be_bytes());
        data.extend_from_slice(&packet[..captured_length]);

        self.tx
            .send(data)
            .await
            .map_err(|_| "PCAP writer is closed".into())
    }
}

#[derive(Debug)]
pub enum PcapError {
    Internal(&'static str),
    Io(io::Error),
}

impl fmt::Display for PcapError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Internal(msg) => f.write_str(msg),
            Self::Io(e) => write!(f, "IO error: {e}"),
        }
    }
}

impl error::Error for PcapError {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match self {
            Self::Internal(_msg) => None,
            Self::Io(err) => Some(err),
        }
    }
}

impl From<&'static str> for PcapError {
    fn from(msg: &'static str) -> PcapError {
        Self::Internal(msg)
    }
}

impl From<io::Error> for PcapError {
    fn from(err: io::Error) -> PcapError {
        Self::Io(err)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::env;
    use tokio::runtime;

    fn temp_path(name: &str) -> String {
        env::temp_dir()
            .join(format!("asnfwd-{}-{name}", std::process::id()))
            .to_string_lossy()
            .into_owned()
    }

    #[test]
    fn write_and_read() {
        let rt = runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        let path = temp_path("pcap-roundtrip.pcap");
        rt.block_on(async {
            let writer = PcapWriter::new(&path).await.unwrap();
            let sender = writer.create_sender();
            let handle = tokio::spawn(writer.run());
            sender
                .send_packet(Duration::new(1700000000, 123456789), &[0x45, 1, 2, 3])
                .await
                .unwrap();
            sender
                .send_packet(Duration::new(1700000001, 0), &[0x45; 40])
                .await
                .unwrap();
            drop(sender);
            handle.await.unwrap().unwrap();

            let mut reader = PcapReader::open(&path).await.unwrap();
            let record = reader.next_record().await.unwrap().unwrap();
            assert_eq!(record.timestamp, Duration::new(1700000000, 123456789));
            assert_eq!(record.data, vec![0x45, 1, 2, 3]);
            let record = reader.next_record().await.unwrap().unwrap();
            assert_eq!(record.timestamp, Duration::new(1700000001, 0));
            assert_eq!(record.data, vec![0x45; 40]);
            assert!(reader.next_record().await.unwrap().is_none());
        });
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn read_little_endian_microseconds() {
        let rt = runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        let path = temp_path("pcap-le.pcap");
        let mut data = vec![];
        data.extend_from_slice(&MAGIC_MICROSECONDS.to_le_bytes());
        data.extend_from_slice(&2u16.to_le_bytes());
        data.extend_from_slice(&4u16.to_le_bytes());
        data.extend_from_slice(&[0u8; 8]);
        data.extend_from_slice(&65535u32.to_le_bytes());
        data.extend_from_slice(&LINKTYPE_IPV4.to_le_bytes());
        data.extend_from_slice(&10u32.to_le_bytes());
        data.extend_from_slice(&500u32.to_le_bytes());
        data.extend_from_slice(&2u32.to_le_bytes());
        data.extend_from_slice(&2u32.to_le_bytes());
        data.extend_from_slice(&[0x45, 0x00]);
        std::fs::write(&path, &data).unwrap();

        rt.block_on(async {
            let mut reader = PcapReader::open(&path).await.unwrap();
            let record = reader.next_record().await.unwrap().unwrap();
            assert_eq!(record.timestamp, Duration::new(10, 500_000));
            assert_eq!(record.data, vec![0x45, 0x00]);
            assert!(reader.next_record().await.unwrap().is_none());
        });
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn reject_ethernet_link_type() {
        let rt = runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        let path = temp_path("pcap-ethernet.pcap");
        let mut data = vec![];
        data.extend_from_slice(&MAGIC_MICROSECONDS.to_be_bytes());
        data.extend_from_slice(&[0, 2, 0, 4]);
        data.extend_from_slice(&[0u8; 8]);
        data.extend_from_slice(&65535u32.to_be_bytes());
        data.extend_from_slice(&1u32.to_be_bytes());
        std::fs::write(&path, &data).unwrap();

        rt.block_on(async {
            assert!(matches!(
                PcapReader::open(&path).await,
                Err(PcapError::Internal(_))
            ));
        });
        let _ = std::fs::remove_file(&path);
    }
}
