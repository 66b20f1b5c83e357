use std::fs;
use std::io::Write;
use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::OnceLock;
use std::time::Instant;

use tokio::io::AsyncReadExt;
use tracing::info;

use crate::ota::{FirmwareSource, FirmwareStream, FlashPartitions, FlashWriter, OtaError, Partition};

/// Runtime metrics and control primitives the agent consumes from the
/// platform. The device build backs these with the SoC SDK; the host
/// build supplies development stand-ins.
pub trait SystemInfo: Send + Sync {
    fn mac(&self) -> [u8; 6];
    fn ip(&self) -> Option<IpAddr>;
    /// Wi-Fi RSSI in dBm, `None` when no association info is available.
    fn rssi(&self) -> Option<i32>;
    fn free_heap(&self) -> u64;
    fn sdk_version(&self) -> &str;
    /// Implementation marker published as the device node type.
    fn implementation(&self) -> &str;
    /// Hard restart. Does not return on real hardware.
    fn restart(&self);
}

#[derive(Debug, Clone, Default)]
pub struct HostSystem;

impl SystemInfo for HostSystem {
    fn mac(&self) -> [u8; 6] {
        std::env::var("HOMIE_AGENT_MAC")
            .ok()
            .and_then(|raw| parse_mac(&raw))
            // Locally administered placeholder when nothing is configured.
            .unwrap_or([0x02, 0x00, 0x00, 0x00, 0x00, 0x01])
    }

    fn ip(&self) -> Option<IpAddr> {
        std::env::var("HOMIE_AGENT_IP")
            .ok()
            .and_then(|raw| raw.parse().ok())
    }

    fn rssi(&self) -> Option<i32> {
        None
    }

    fn free_heap(&self) -> u64 {
        0
    }

    fn sdk_version(&self) -> &str {
        "host"
    }

    fn implementation(&self) -> &str {
        "host"
    }

    fn restart(&self) {
        info!("restart requested, exiting process");
        std::process::exit(0);
    }
}

pub fn parse_mac(raw: &str) -> Option<[u8; 6]> {
    let mut mac = [0_u8; 6];
    let mut parts = raw.split(':');
    for byte in mac.iter_mut() {
        *byte = u8::from_str_radix(parts.next()?, 16).ok()?;
    }
    if parts.next().is_some() {
        return None;
    }
    Some(mac)
}

const OTA_CHUNK_SIZE: usize = 4096;

/// Firmware source for the host build: serves the image from a local
/// file, with an optional `file://` prefix on the configured URL.
#[derive(Debug, Clone, Default)]
pub struct FileFirmwareSource;

pub struct FileFirmwareStream {
    file: tokio::fs::File,
    len: u64,
}

impl FirmwareStream for FileFirmwareStream {
    fn content_length(&self) -> Option<u64> {
        Some(self.len)
    }

    async fn next_chunk(&mut self) -> Result<Option<Vec<u8>>, OtaError> {
        let mut buf = vec![0_u8; OTA_CHUNK_SIZE];
        let read = self
            .file
            .read(&mut buf)
            .await
            .map_err(|err| OtaError::Download(err.to_string()))?;
        if read == 0 {
            return Ok(None);
        }
        buf.truncate(read);
        Ok(Some(buf))
    }
}

impl FirmwareSource for FileFirmwareSource {
    type Stream = FileFirmwareStream;

    async fn open(&self, url: &str, _cert_pem: Option<&str>) -> Result<FileFirmwareStream, OtaError> {
        let path = url.strip_prefix("file://").unwrap_or(url);
        let file = tokio::fs::File::open(path)
            .await
            .map_err(|err| OtaError::Download(format!("{path}: {err}")))?;
        let len = file
            .metadata()
            .await
            .map_err(|err| OtaError::Download(err.to_string()))?
            .len();
        Ok(FileFirmwareStream { file, len })
    }
}

/// Directory-backed stand-in for the two-slot OTA flash layout. Each
/// slot is a file, the boot marker records which slot boots next.
#[derive(Debug, Clone)]
pub struct DirFlash {
    dir: PathBuf,
}

impl DirFlash {
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }

    fn boot_label(&self) -> Option<String> {
        fs::read_to_string(self.dir.join("boot"))
            .ok()
            .map(|label| label.trim().to_string())
    }
}

pub struct DirFlashWriter {
    file: fs::File,
}

impl FlashWriter for DirFlashWriter {
    fn write(&mut self, chunk: &[u8]) -> Result<(), OtaError> {
        self.file
            .write_all(chunk)
            .map_err(|err| OtaError::FlashWrite(err.to_string()))
    }

    fn finalize(self) -> Result<(), OtaError> {
        self.file
            .sync_all()
            .map_err(|err| OtaError::FlashFinalize(err.to_string()))
    }
}

impl FlashPartitions for DirFlash {
    type Writer = DirFlashWriter;

    fn next_update_partition(&self) -> Result<Partition, OtaError> {
        // Alternate between the two slots, never the one booting now.
        let (label, offset) = match self.boot_label().as_deref() {
            Some("ota_1") => ("ota_0", 0x10000),
            _ => ("ota_1", 0x110000),
        };
        Ok(Partition {
            label: label.to_string(),
            offset,
        })
    }

    fn begin(&self, partition: &Partition, _size: u64) -> Result<DirFlashWriter, OtaError> {
        fs::create_dir_all(&self.dir).map_err(|err| OtaError::FlashBegin(err.to_string()))?;
        let file = fs::File::create(self.dir.join(format!("{}.bin", partition.label)))
            .map_err(|err| OtaError::FlashBegin(err.to_string()))?;
        Ok(DirFlashWriter { file })
    }

    fn set_boot_partition(&self, partition: &Partition) -> Result<(), OtaError> {
        fs::write(self.dir.join("boot"), &partition.label)
            .map_err(|err| OtaError::SetBoot(err.to_string()))
    }
}

/// Seconds since process start, from a monotonic clock.
pub fn uptime_secs() -> u64 {
    static START: OnceLock<Instant> = OnceLock::new();
    START.get_or_init(Instant::now).elapsed().as_secs()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_colon_separated_mac() {
        assert_eq!(
            parse_mac("a4:cf:12:00:9b:01"),
            Some([0xA4, 0xCF, 0x12, 0x00, 0x9B, 0x01])
        );
    }

    #[test]
    fn rejects_malformed_mac() {
        assert_eq!(parse_mac("a4:cf:12"), None);
        assert_eq!(parse_mac("a4:cf:12:00:9b:01:ff"), None);
        assert_eq!(parse_mac("zz:cf:12:00:9b:01"), None);
    }

    #[test]
    fn dir_flash_alternates_slots_across_boots() {
        let dir = std::env::temp_dir().join(format!("dir-flash-test-{}", std::process::id()));
        let _ = fs::remove_dir_all(&dir);
        let flash = DirFlash::new(dir.clone());

        let first = flash.next_update_partition().unwrap();
        assert_eq!(first.label, "ota_1");

        let mut writer = flash.begin(&first, 3).unwrap();
        writer.write(b"abc").unwrap();
        writer.finalize().unwrap();
        flash.set_boot_partition(&first).unwrap();

        assert_eq!(fs::read(dir.join("ota_1.bin")).unwrap(), b"abc");
        let second = flash.next_update_partition().unwrap();
        assert_eq!(second.label, "ota_0");

        let _ = fs::remove_dir_all(&dir);
    }
}
