//! FTMS (Fitness Machine Service) GATT server.
//!
//! Republishes treadmill telemetry in Bluetooth SIG FTMS format so that
//! Apple Fitness, Zwift, and other standard consumers can subscribe. The
//! bridge is a read-only republisher: no control point is exposed.

use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use bluer::adv::Advertisement;
use bluer::gatt::local::{
    Application, ApplicationHandle, Characteristic, CharacteristicNotifier, CharacteristicNotify,
    CharacteristicNotifyMethod, CharacteristicRead, Service,
};
use futures::future::FutureExt;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{interval, timeout};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{from_peripheral, Result};
use crate::telemetry::{Telemetry, TelemetryCell};

pub const FTMS_SERVICE_UUID: Uuid = Uuid::from_u128(0x00001826_0000_1000_8000_00805F9B34FB);
pub const TREADMILL_DATA_UUID: Uuid = Uuid::from_u128(0x00002ACD_0000_1000_8000_00805F9B34FB);
pub const FM_FEATURE_UUID: Uuid = Uuid::from_u128(0x00002ACC_0000_1000_8000_00805F9B34FB);
pub const FM_STATUS_UUID: Uuid = Uuid::from_u128(0x00002ADA_0000_1000_8000_00805F9B34FB);

/// Treadmill Data flags: Total Distance (bit 2) and Elapsed Time (bit 8)
/// present; bit 0 clear means Instantaneous Speed is present.
const TREADMILL_DATA_FLAGS: u16 = 0x0104;

/// Fitness Machine Feature bits: Average Speed (0), Total Distance (2),
/// Elapsed Time (14).
const FM_FEATURES: u32 = 0x0000_4005;

/// Fitness Machine Status: Started or Resumed by the User.
const STATUS_STARTED: [u8; 1] = [0x04];
/// Fitness Machine Status: Stopped by the User.
const STATUS_STOPPED: [u8; 2] = [0x02, 0x01];

const STOP_NOTIFY_TIMEOUT: Duration = Duration::from_secs(2);

type NotifyFun = Box<
    dyn Fn(CharacteristicNotifier) -> Pin<Box<dyn std::future::Future<Output = ()> + Send>>
        + Send
        + Sync,
>;

/// Treadmill Data packet, little-endian:
/// `[flags:u16][speed:u16 0.01 km/h][distance:u24 m][elapsed:u16 s]`.
#[must_use]
pub fn encode_treadmill_data(telemetry: &Telemetry) -> Vec<u8> {
    let speed = (telemetry.speed_kmh * 100.0).round().clamp(0.0, 65534.0) as u16;
    let distance = telemetry.distance_m.min(0x00FF_FFFF);
    let elapsed = telemetry.elapsed_s.min(u32::from(u16::MAX)) as u16;

    let mut buf = Vec::with_capacity(9);
    buf.extend_from_slice(&TREADMILL_DATA_FLAGS.to_le_bytes());
    buf.extend_from_slice(&speed.to_le_bytes());
    buf.extend_from_slice(&distance.to_le_bytes()[..3]);
    buf.extend_from_slice(&elapsed.to_le_bytes());
    buf
}

/// Fitness Machine Feature block: features u32 + target-features u32.
/// Target features stay zero since there is no control point.
#[must_use]
pub fn encode_feature() -> [u8; 8] {
    let mut buf = [0u8; 8];
    buf[..4].copy_from_slice(&FM_FEATURES.to_le_bytes());
    buf
}

/// Running FTMS peripheral: GATT application, advertisement, and the
/// per-subscriber notification pumps.
pub struct FtmsHandle {
    adv: bluer::adv::AdvertisementHandle,
    app: ApplicationHandle,
    pumps: Arc<Mutex<Vec<JoinHandle<()>>>>,
    status: Arc<Mutex<Option<CharacteristicNotifier>>>,
}

impl FtmsHandle {
    /// Register the FTMS service tree and start advertising on the local
    /// adapter. Notifications tick every `cadence` using the most recent
    /// telemetry snapshot; they are suppressed while no snapshot exists.
    pub async fn start(
        adapter_name: Option<&str>,
        device_name: &str,
        telemetry: TelemetryCell,
        cadence: Duration,
    ) -> Result<Self> {
        let session = bluer::Session::new().await.map_err(from_peripheral)?;
        let adapter = match adapter_name {
            Some(name) => session.adapter(name).map_err(from_peripheral)?,
            None => session.default_adapter().await.map_err(from_peripheral)?,
        };
        adapter.set_powered(true).await.map_err(from_peripheral)?;

        let pumps: Arc<Mutex<Vec<JoinHandle<()>>>> = Arc::new(Mutex::new(Vec::new()));
        let status: Arc<Mutex<Option<CharacteristicNotifier>>> = Arc::new(Mutex::new(None));

        // Each subscriber gets its own pump; losing one is non-fatal for
        // the rest.
        let pump_registry = Arc::clone(&pumps);
        let pump_telemetry = telemetry.clone();
        let treadmill_data_notify: NotifyFun = Box::new(move |notifier| {
            let telemetry = pump_telemetry.clone();
            let registry = Arc::clone(&pump_registry);
            async move {
                info!("Treadmill Data subscriber attached");
                let task = tokio::spawn(async move {
                    let mut notifier = notifier;
                    let mut ticker = interval(cadence);
                    let mut last_belt = None;
                    loop {
                        ticker.tick().await;
                        if notifier.is_stopped() {
                            break;
                        }
                        let Some(snapshot) = telemetry.snapshot().await else {
                            continue;
                        };
                        let belt = snapshot.effective_belt_state();
                        if last_belt != Some(belt) {
                            debug!("Republished belt state: {:?}", belt);
                            last_belt = Some(belt);
                        }
                        if let Err(e) = notifier.notify(encode_treadmill_data(&snapshot)).await {
                            debug!("Treadmill Data subscriber gone: {}", e);
                            break;
                        }
                    }
                });
                registry.lock().await.push(task);
            }
            .boxed()
        });

        let status_slot = Arc::clone(&status);
        let machine_status_notify: NotifyFun = Box::new(move |notifier| {
            let slot = Arc::clone(&status_slot);
            async move {
                info!("Machine Status subscriber attached");
                let mut notifier = notifier;
                // The server only exists while the bridge is active, so a
                // subscriber always starts from the Started state.
                if let Err(e) = notifier.notify(STATUS_STARTED.to_vec()).await {
                    warn!("Machine Status notification failed: {}", e);
                }
                *slot.lock().await = Some(notifier);
            }
            .boxed()
        });

        let app = Application {
            services: vec![Service {
                uuid: FTMS_SERVICE_UUID,
                primary: true,
                characteristics: vec![
                    Characteristic {
                        uuid: FM_FEATURE_UUID,
                        read: Some(CharacteristicRead {
                            read: true,
                            fun: Box::new(|_req| {
                                async move { Ok(encode_feature().to_vec()) }.boxed()
                            }),
                            ..Default::default()
                        }),
                        ..Default::default()
                    },
                    Characteristic {
                        uuid: TREADMILL_DATA_UUID,
                        notify: Some(CharacteristicNotify {
                            notify: true,
                            method: CharacteristicNotifyMethod::Fun(treadmill_data_notify),
                            ..Default::default()
                        }),
                        ..Default::default()
                    },
                    Characteristic {
                        uuid: FM_STATUS_UUID,
                        notify: Some(CharacteristicNotify {
                            notify: true,
                            method: CharacteristicNotifyMethod::Fun(machine_status_notify),
                            ..Default::default()
                        }),
                        ..Default::default()
                    },
                ],
                ..Default::default()
            }],
            ..Default::default()
        };
        let app = adapter
            .serve_gatt_application(app)
            .await
            .map_err(from_peripheral)?;

        let advertisement = Advertisement {
            advertisement_type: bluer::adv::Type::Peripheral,
            service_uuids: vec![FTMS_SERVICE_UUID].into_iter().collect(),
            local_name: Some(device_name.to_string()),
            discoverable: Some(true),
            ..Default::default()
        };
        let adv = adapter
            .advertise(advertisement)
            .await
            .map_err(from_peripheral)?;
        info!("FTMS active: advertising as '{}'", device_name);

        Ok(Self {
            adv,
            app,
            pumps,
            status,
        })
    }

    /// Notify subscribers the machine stopped, cancel the notification
    /// pumps, then tear down the service and advertisement.
    pub async fn stop(self) {
        if let Some(mut notifier) = self.status.lock().await.take() {
            match timeout(STOP_NOTIFY_TIMEOUT, notifier.notify(STATUS_STOPPED.to_vec())).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => debug!("Stopped-status notification failed: {}", e),
                Err(_) => warn!("Stopped-status notification timed out"),
            }
        }
        for pump in self.pumps.lock().await.drain(..) {
            pump.abort();
        }
        drop(self.app);
        drop(self.adv);
        info!("FTMS stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    use crate::telemetry::BeltState;

    fn telemetry(speed_kmh: f64, distance_m: u32, elapsed_s: u32) -> Telemetry {
        Telemetry {
            speed_kmh,
            distance_m,
            elapsed_s,
            belt_state: BeltState::Running,
            updated_at: Instant::now(),
        }
    }

    #[test]
    fn treadmill_data_reference_vector() {
        let bytes = encode_treadmill_data(&telemetry(3.4, 1234, 567));
        assert_eq!(
            bytes,
            vec![0x04, 0x01, 0x54, 0x01, 0xD2, 0x04, 0x00, 0x37, 0x02]
        );
    }

    #[test]
    fn distance_clamps_to_uint24() {
        let bytes = encode_treadmill_data(&telemetry(0.0, 1 << 24, 0));
        assert_eq!(&bytes[4..7], &[0xFF, 0xFF, 0xFF]);
    }

    #[test]
    fn speed_and_elapsed_clamp() {
        let bytes = encode_treadmill_data(&telemetry(700.0, 0, 100_000));
        assert_eq!(&bytes[2..4], &0xFFFEu16.to_le_bytes());
        assert_eq!(&bytes[7..9], &[0xFF, 0xFF]);
    }

    #[test]
    fn packet_is_always_nine_bytes() {
        assert_eq!(encode_treadmill_data(&telemetry(0.0, 0, 0)).len(), 9);
    }

    #[test]
    fn feature_block_bits() {
        let bytes = encode_feature();
        // Bits 0, 2, 14 of the features word; no target features.
        assert_eq!(bytes, [0x05, 0x40, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00]);
    }

    #[test]
    fn status_opcodes() {
        assert_eq!(STATUS_STARTED, [0x04]);
        assert_eq!(STATUS_STOPPED, [0x02, 0x01]);
    }
}
