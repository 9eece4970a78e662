//! GATT session to a connected WalkingPad: characteristic resolution,
//! stats polling, the missed-response watchdog, and belt control.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use btleplug::api::{BDAddr, CharPropFlags, Characteristic, Peripheral as _, Service, WriteType};
use btleplug::platform::Peripheral;
use futures::stream::StreamExt;
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{interval, timeout};
use tracing::{debug, info, warn};

use crate::bluetooth::{codec, WALKINGPAD_NOTIFY_UUID, WALKINGPAD_WRITE_UUID};
use crate::error::{BridgeError, Result};
use crate::telemetry::TelemetryCell;
use uuid::Uuid;

const DISCONNECT_TIMEOUT: Duration = Duration::from_secs(2);

/// Terminal session events surfaced to the supervisor. At most one is
/// emitted per session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEvent {
    /// The watchdog saw no stats reply within its window.
    Stale,
    /// The link is gone (stack callback or failed write).
    Disconnected(String),
}

/// [`ClientEvent`] tagged with its originating session, so the supervisor
/// can discard stragglers from a session it already tore down.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionEvent {
    pub session: u64,
    pub event: ClientEvent,
}

/// Active session to one treadmill. At most one exists at a time; the
/// supervisor enforces that.
pub struct WalkingPadClient {
    peripheral: Peripheral,
    address: BDAddr,
    write_char: Characteristic,
    poll_task: JoinHandle<()>,
    notify_task: JoinHandle<()>,
}

impl WalkingPadClient {
    /// Take over a freshly connected peripheral: discover the vendor
    /// service, subscribe to stats, start the poll timer and watchdog.
    pub async fn attach(
        peripheral: Peripheral,
        telemetry: TelemetryCell,
        stats_interval: Duration,
        watchdog_window: Duration,
        session: u64,
        events: mpsc::Sender<SessionEvent>,
    ) -> Result<Self> {
        let address = peripheral.address();
        peripheral.discover_services().await?;

        let services: Vec<Service> = peripheral.services().into_iter().collect();
        let Some((notify_char, write_char)) = pick_characteristics(&services) else {
            let _ = peripheral.disconnect().await;
            return Err(BridgeError::ProtocolMismatch(address));
        };
        info!(
            "Using notify char {}, write char {}",
            notify_char.uuid, write_char.uuid
        );

        if let Err(e) = peripheral.subscribe(&notify_char).await {
            let _ = peripheral.disconnect().await;
            return Err(e.into());
        }
        let mut notifications = match peripheral.notifications().await {
            Ok(stream) => stream,
            Err(e) => {
                let _ = peripheral.disconnect().await;
                return Err(e.into());
            }
        };
        debug!("Subscribed to stats notifications on {}", address);

        let last_reply = Arc::new(RwLock::new(Instant::now()));
        let terminal_sent = Arc::new(AtomicBool::new(false));

        let notify_task = {
            let telemetry = telemetry.clone();
            let last_reply = Arc::clone(&last_reply);
            let events = events.clone();
            let terminal_sent = Arc::clone(&terminal_sent);
            let notify_uuid = notify_char.uuid;
            tokio::spawn(async move {
                let mut seen_encoding = None;
                while let Some(notification) = notifications.next().await {
                    if notification.uuid != notify_uuid {
                        continue;
                    }
                    match codec::decode_frame(&notification.value) {
                        codec::Frame::Stats(reply) => {
                            if seen_encoding != Some(reply.speed_encoding) {
                                info!("Stats replies use {:?} speed encoding", reply.speed_encoding);
                                seen_encoding = Some(reply.speed_encoding);
                            }
                            *last_reply.write().await = Instant::now();
                            telemetry.apply(&reply).await;
                        }
                        codec::Frame::Control(reply) => {
                            debug!("Control reply, opcode 0x{:02X}", reply.opcode);
                        }
                        codec::Frame::Unknown => {
                            telemetry.record_codec_error();
                            debug!("Dropped undecodable frame ({} bytes)", notification.value.len());
                        }
                    }
                }
                emit_terminal(
                    &events,
                    &terminal_sent,
                    session,
                    ClientEvent::Disconnected("notification stream ended".into()),
                );
            })
        };

        let poll_task = {
            let peripheral = peripheral.clone();
            let write_char = write_char.clone();
            let last_reply = Arc::clone(&last_reply);
            let terminal_sent = Arc::clone(&terminal_sent);
            tokio::spawn(async move {
                let ask = codec::encode_ask_stats();
                let mut ticker = interval(stats_interval);
                loop {
                    ticker.tick().await;

                    if last_reply.read().await.elapsed() > watchdog_window {
                        warn!("No stats reply within {:?}, marking link stale", watchdog_window);
                        emit_terminal(&events, &terminal_sent, session, ClientEvent::Stale);
                        break;
                    }

                    // Without response: no ack wait, no head-of-line blocking.
                    if let Err(e) = peripheral
                        .write(&write_char, &ask, WriteType::WithoutResponse)
                        .await
                    {
                        warn!("Stats poll failed: {}", e);
                        if !peripheral.is_connected().await.unwrap_or(false) {
                            emit_terminal(
                                &events,
                                &terminal_sent,
                                session,
                                ClientEvent::Disconnected(e.to_string()),
                            );
                            break;
                        }
                    }
                }
            })
        };

        Ok(Self {
            peripheral,
            address,
            write_char,
            poll_task,
            notify_task,
        })
    }

    #[must_use]
    pub const fn address(&self) -> BDAddr {
        self.address
    }

    pub async fn start_belt(&self) -> Result<()> {
        self.send(codec::encode_start_belt()).await
    }

    pub async fn stop_belt(&self) -> Result<()> {
        self.send(codec::encode_stop_belt()).await
    }

    pub async fn set_speed_kmh(&self, speed_kmh: f64) -> Result<()> {
        self.send(codec::encode_set_speed(speed_kmh)).await
    }

    async fn send(&self, frame: Vec<u8>) -> Result<()> {
        self.peripheral
            .write(&self.write_char, &frame, WriteType::WithoutResponse)
            .await?;
        Ok(())
    }

    /// Cancel the poll timer. First step of the shutdown sequence; the
    /// session itself stays up until [`Self::disconnect`].
    pub fn cancel_poll(&self) {
        self.poll_task.abort();
    }

    /// Tear down the session and release the peripheral. Tolerates an
    /// already-gone link.
    pub async fn disconnect(self) {
        self.poll_task.abort();
        self.notify_task.abort();
        match timeout(DISCONNECT_TIMEOUT, self.peripheral.disconnect()).await {
            Ok(Ok(())) => info!("Disconnected from treadmill at {}", self.address),
            Ok(Err(e)) => debug!("Disconnect from {} failed: {}", self.address, e),
            Err(_) => warn!("Disconnect from {} timed out", self.address),
        }
    }
}

fn emit_terminal(
    events: &mpsc::Sender<SessionEvent>,
    terminal_sent: &AtomicBool,
    session: u64,
    event: ClientEvent,
) {
    if !terminal_sent.swap(true, Ordering::SeqCst) {
        let _ = events.try_send(SessionEvent { session, event });
    }
}

fn has_notify(c: &Characteristic) -> bool {
    c.properties.contains(CharPropFlags::NOTIFY)
}

fn has_write(c: &Characteristic) -> bool {
    c.properties.contains(CharPropFlags::WRITE)
        || c.properties.contains(CharPropFlags::WRITE_WITHOUT_RESPONSE)
}

/// Generic Access / Generic Attribute / Device Information: never the
/// vendor service.
fn is_generic_service(uuid: &Uuid) -> bool {
    matches!(short_uuid(uuid), Some(0x1800 | 0x1801 | 0x180A))
}

/// 16-bit short code for UUIDs built on the Bluetooth base UUID.
fn short_uuid(uuid: &Uuid) -> Option<u16> {
    const BASE: u128 = 0x00000000_0000_1000_8000_00805F9B34FB;
    const MASK: u128 = 0xFFFF0000_FFFF_FFFF_FFFF_FFFFFFFFFFFF;
    let value = uuid.as_u128();
    (value & MASK == BASE).then(|| (value >> 96) as u16)
}

/// Find the stats (notify) and command (write) characteristics. Exact
/// UUID match first; otherwise the first non-generic service exposing
/// both roles. `None` means the device is not a WalkingPad.
fn pick_characteristics(services: &[Service]) -> Option<(Characteristic, Characteristic)> {
    let mut notify_char = None;
    let mut write_char = None;
    for service in services {
        for c in &service.characteristics {
            if c.uuid == WALKINGPAD_NOTIFY_UUID && has_notify(c) {
                notify_char = Some(c.clone());
            }
            if c.uuid == WALKINGPAD_WRITE_UUID && has_write(c) {
                write_char = Some(c.clone());
            }
        }
    }
    if let (Some(n), Some(w)) = (notify_char, write_char) {
        return Some((n, w));
    }

    for service in services {
        if is_generic_service(&service.uuid) {
            continue;
        }
        let notify = service.characteristics.iter().find(|c| has_notify(c));
        let write = service.characteristics.iter().find(|c| has_write(c));
        if let (Some(n), Some(w)) = (notify, write) {
            warn!(
                "Exact characteristic UUIDs missing, using vendor service {}: notify={}, write={}",
                service.uuid, n.uuid, w.uuid
            );
            return Some((n.clone(), w.clone()));
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    fn characteristic(service: Uuid, uuid: Uuid, properties: CharPropFlags) -> Characteristic {
        Characteristic {
            uuid,
            service_uuid: service,
            properties,
            descriptors: BTreeSet::new(),
        }
    }

    fn service(uuid: Uuid, chars: Vec<Characteristic>) -> Service {
        Service {
            uuid,
            primary: true,
            characteristics: chars.into_iter().collect(),
        }
    }

    #[test]
    fn short_uuid_extraction() {
        assert_eq!(short_uuid(&WALKINGPAD_NOTIFY_UUID), Some(0x2ACD));
        assert_eq!(
            short_uuid(&Uuid::from_u128(0x00001800_0000_1000_8000_00805F9B34FB)),
            Some(0x1800)
        );
        assert_eq!(short_uuid(&Uuid::from_u128(0x1234)), None);
    }

    #[test]
    fn exact_uuid_pair_is_preferred() {
        let vendor = service(
            crate::bluetooth::WALKINGPAD_SERVICE_UUID,
            vec![
                characteristic(
                    crate::bluetooth::WALKINGPAD_SERVICE_UUID,
                    WALKINGPAD_NOTIFY_UUID,
                    CharPropFlags::NOTIFY,
                ),
                characteristic(
                    crate::bluetooth::WALKINGPAD_SERVICE_UUID,
                    WALKINGPAD_WRITE_UUID,
                    CharPropFlags::WRITE_WITHOUT_RESPONSE,
                ),
            ],
        );
        let (n, w) = pick_characteristics(&[vendor]).unwrap();
        assert_eq!(n.uuid, WALKINGPAD_NOTIFY_UUID);
        assert_eq!(w.uuid, WALKINGPAD_WRITE_UUID);
    }

    #[test]
    fn falls_back_to_vendor_service_pair() {
        let odd_notify = Uuid::from_u128(0x0000FE01_0000_1000_8000_00805F9B34FB);
        let odd_write = Uuid::from_u128(0x0000FE02_0000_1000_8000_00805F9B34FB);
        let vendor_uuid = Uuid::from_u128(0x0000FE00_0000_1000_8000_00805F9B34FB);
        let generic = service(
            Uuid::from_u128(0x00001800_0000_1000_8000_00805F9B34FB),
            vec![characteristic(
                Uuid::from_u128(0x00001800_0000_1000_8000_00805F9B34FB),
                Uuid::from_u128(0x00002A00_0000_1000_8000_00805F9B34FB),
                CharPropFlags::READ | CharPropFlags::NOTIFY,
            )],
        );
        let vendor = service(
            vendor_uuid,
            vec![
                characteristic(vendor_uuid, odd_notify, CharPropFlags::NOTIFY),
                characteristic(vendor_uuid, odd_write, CharPropFlags::WRITE),
            ],
        );
        // Generic services never win, even when listed first.
        let (n, w) = pick_characteristics(&[generic, vendor]).unwrap();
        assert_eq!(n.uuid, odd_notify);
        assert_eq!(w.uuid, odd_write);
    }

    #[test]
    fn missing_pair_is_a_mismatch() {
        let vendor_uuid = Uuid::from_u128(0x0000FE00_0000_1000_8000_00805F9B34FB);
        let notify_only = service(
            vendor_uuid,
            vec![characteristic(
                vendor_uuid,
                Uuid::from_u128(0x0000FE01_0000_1000_8000_00805F9B34FB),
                CharPropFlags::NOTIFY,
            )],
        );
        assert!(pick_characteristics(&[notify_only]).is_none());
        assert!(pick_characteristics(&[]).is_none());
    }
}
