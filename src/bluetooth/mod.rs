//! BLE plumbing: central-role adapter access, the WalkingPad client
//! session, the wire codec, and the FTMS peripheral.

pub mod client;
pub mod codec;
pub mod ftms;

use std::collections::HashMap;
use std::time::Duration;

use btleplug::api::{BDAddr, Central, Manager as _, Peripheral as _, ScanFilter};
use btleplug::platform::{Adapter, Manager, Peripheral};
use serde::Serialize;
use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{from_central, BridgeError, Result};

/// WalkingPad vendor service. The treadmill reuses FTMS-shaped UUIDs for
/// its proprietary protocol.
pub const WALKINGPAD_SERVICE_UUID: Uuid = Uuid::from_u128(0x00001826_0000_1000_8000_00805F9B34FB);
pub const WALKINGPAD_WRITE_UUID: Uuid = Uuid::from_u128(0x00002AD9_0000_1000_8000_00805F9B34FB);
pub const WALKINGPAD_NOTIFY_UUID: Uuid = Uuid::from_u128(0x00002ACD_0000_1000_8000_00805F9B34FB);

/// Advertised-name prefixes recognized as Kingsmith-family treadmills.
const KINGSMITH_NAME_PREFIXES: [&str; 4] = ["walkingpad", "kingsmith", "k-pad", "ksm"];

const SCAN_SLICE: Duration = Duration::from_millis(500);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const DISCOVERY_SCAN: Duration = Duration::from_secs(4);

/// A treadmill seen during a scan. Identity is the address.
#[derive(Debug, Clone, Serialize)]
pub struct TreadmillDescriptor {
    pub address: BDAddr,
    pub advertised_name: String,
    pub rssi: Option<i16>,
}

/// Does an advertisement look like a Kingsmith treadmill?
fn matches_kingsmith(name: Option<&str>, services: &[Uuid]) -> bool {
    if let Some(name) = name {
        let lowered = name.to_lowercase();
        if KINGSMITH_NAME_PREFIXES
            .iter()
            .any(|prefix| lowered.starts_with(prefix))
        {
            return true;
        }
    }
    services.contains(&WALKINGPAD_SERVICE_UUID)
}

/// Central-role handle on the local adapter. Owns the scan cache used to
/// resolve addresses back to connectable peripherals.
pub struct BleCentral {
    adapter: Adapter,
    known: HashMap<BDAddr, Peripheral>,
}

impl BleCentral {
    /// Open the local adapter, preferring `preferred` (e.g. "hci0") when
    /// configured.
    pub async fn new(preferred: Option<&str>) -> Result<Self> {
        let manager = Manager::new().await.map_err(from_central)?;
        let adapters = manager.adapters().await.map_err(from_central)?;
        let Some(fallback) = adapters.first().cloned() else {
            return Err(BridgeError::AdapterUnavailable(
                "no BLE adapter found".into(),
            ));
        };

        let adapter = match preferred {
            Some(name) => {
                let mut chosen = None;
                for candidate in &adapters {
                    let info = candidate.adapter_info().await.unwrap_or_default();
                    if info.contains(name) {
                        chosen = Some(candidate.clone());
                        break;
                    }
                }
                chosen.unwrap_or_else(|| {
                    warn!("Adapter '{}' not found, using the first one", name);
                    fallback
                })
            }
            None => fallback,
        };

        let info = adapter.adapter_info().await.map_err(from_central)?;
        info!("Using BLE adapter {}", info);
        Ok(Self {
            adapter,
            known: HashMap::new(),
        })
    }

    /// Scan for Kingsmith treadmills for `duration`, strongest signal
    /// first. An empty result is not an error here; the supervisor decides
    /// whether to keep looping.
    pub async fn scan(&mut self, duration: Duration) -> Result<Vec<TreadmillDescriptor>> {
        self.adapter
            .start_scan(ScanFilter::default())
            .await
            .map_err(from_central)?;

        let mut found: HashMap<BDAddr, TreadmillDescriptor> = HashMap::new();
        let mut elapsed = Duration::ZERO;
        while elapsed < duration {
            sleep(SCAN_SLICE).await;
            elapsed += SCAN_SLICE;

            for peripheral in self.adapter.peripherals().await.map_err(from_central)? {
                let Ok(Some(props)) = peripheral.properties().await else {
                    continue;
                };
                if !matches_kingsmith(props.local_name.as_deref(), &props.services) {
                    continue;
                }
                let address = peripheral.address();
                let name = props
                    .local_name
                    .clone()
                    .unwrap_or_else(|| address.to_string());
                debug!("Scan hit: {} ({}) rssi={:?}", name, address, props.rssi);
                found.insert(
                    address,
                    TreadmillDescriptor {
                        address,
                        advertised_name: name,
                        rssi: props.rssi,
                    },
                );
                self.known.insert(address, peripheral);
            }
        }

        if let Err(e) = self.adapter.stop_scan().await {
            warn!("Failed to stop scan: {}", e);
        }

        let mut devices: Vec<TreadmillDescriptor> = found.into_values().collect();
        devices.sort_by(|a, b| b.rssi.unwrap_or(i16::MIN).cmp(&a.rssi.unwrap_or(i16::MIN)));
        info!("Scan completed, {} treadmill(s) found", devices.len());
        Ok(devices)
    }

    /// Connect to a treadmill by address. Runs a short discovery scan if
    /// the address has not been seen yet (manual connects without a prior
    /// scan).
    pub async fn connect(&mut self, address: BDAddr) -> Result<Peripheral> {
        if !self.known.contains_key(&address) {
            debug!("{} not in scan cache, running discovery scan", address);
            self.scan(DISCOVERY_SCAN).await?;
        }
        let peripheral = self
            .known
            .get(&address)
            .cloned()
            .ok_or_else(|| BridgeError::ConnectFail {
                address,
                reason: "device not seen in scan".into(),
            })?;

        match timeout(CONNECT_TIMEOUT, peripheral.connect()).await {
            Ok(Ok(())) => {
                info!("Connected to treadmill at {}", address);
                Ok(peripheral)
            }
            Ok(Err(e)) => Err(BridgeError::ConnectFail {
                address,
                reason: e.to_string(),
            }),
            Err(_) => Err(BridgeError::ConnectFail {
                address,
                reason: format!("timed out after {CONNECT_TIMEOUT:?}"),
            }),
        }
    }

    /// Stop any in-flight discovery and drop the scan cache, releasing the
    /// adapter.
    pub async fn release(mut self) {
        if timeout(Duration::from_secs(2), self.adapter.stop_scan())
            .await
            .is_err()
        {
            warn!("Stopping scan timed out during adapter release");
        }
        self.known.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn name_prefixes_match_case_insensitively() {
        assert!(matches_kingsmith(Some("WalkingPad A1"), &[]));
        assert!(matches_kingsmith(Some("KINGSMITH-R2"), &[]));
        assert!(matches_kingsmith(Some("k-pad pro"), &[]));
        assert!(matches_kingsmith(Some("KSM-X21"), &[]));
        assert!(!matches_kingsmith(Some("Polar H10"), &[]));
        assert!(!matches_kingsmith(None, &[]));
    }

    #[test]
    fn prefix_means_prefix() {
        // Substring hits elsewhere in the name do not count.
        assert!(!matches_kingsmith(Some("My WalkingPad"), &[]));
    }

    #[test]
    fn vendor_service_uuid_matches_without_name() {
        assert!(matches_kingsmith(None, &[WALKINGPAD_SERVICE_UUID]));
        assert!(matches_kingsmith(
            Some("unnamed"),
            &[Uuid::from_u128(0x1800), WALKINGPAD_SERVICE_UUID]
        ));
        assert!(!matches_kingsmith(Some("unnamed"), &[Uuid::from_u128(0x1800)]));
    }
}
