// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Per-account cloud supervisor.
//!
//! Drives the full account lifecycle: authenticate, discover devices,
//! open the MQTT session over WebSocket, subscribe to every device's
//! response topics, and keep the session alive through a three-tier
//! reconnect strategy:
//!
//! - **Tier 1, warm**: tokens are still valid; reopen transport and
//!   engine and re-subscribe.
//! - **Tier 2, full re-auth**: triggered by CONNACK return code 5 or a
//!   Tier-1 failure with lapsed tokens; clears in-memory tokens,
//!   invalidates the account's token cache (not the device cache) and
//!   re-runs all three stages.
//! - **Tier 3, backoff**: failed attempts are retried after
//!   5, 10, 15, 30, 45, 60 s (capped); after ten attempts the client
//!   emits a terminal error and stops.
//!
//! Disconnects observed while a reconnect is in flight are coalesced,
//! and the reconnect itself runs as a separate task so the supervisor
//! is never re-entered from an event handler.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;

use crate::cache::{DeviceCache, now_unix};
use crate::config::mask_email;
use crate::error::{AuthError, Error, MqttError};
use crate::mqtt::{self, EngineEvent, EngineOptions, MqttEngine, QoS};
use crate::topic::device_subscriptions;
use crate::transport::{Transport, WebSocketTransport};

use super::api::{self, Device};
use super::auth::{AuthPipeline, TokenSet};

/// Cloud MQTT endpoint host.
pub const CLOUD_MQTT_HOST: &str = "mqtt.sydpower.com";
/// Cloud MQTT endpoint port (WebSocket).
pub const CLOUD_MQTT_PORT: u16 = 8083;
/// Fixed password accompanying the MQTT JWT username.
const CLOUD_MQTT_PASSWORD: &str = "helloyou";
/// Attempts before the reconnect loop gives up for good.
const MAX_RECONNECT_ATTEMPTS: u32 = 10;
/// Backoff schedule; later attempts stay at the final entry.
const BACKOFF_STEPS: [u64; 6] = [5, 10, 15, 30, 45, 60];
/// Event channel depth towards the bridge.
const EVENT_QUEUE: usize = 256;

/// Counter for generating unique client IDs.
static CLIENT_ID_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Reconnect pacing knobs, from the bridge configuration.
#[derive(Debug, Clone)]
pub struct CloudClientOptions {
    /// Floor for the backoff schedule, seconds.
    pub reconnect_delay_min: u64,
    /// Cap for the backoff schedule, seconds.
    pub reconnect_delay_max: u64,
}

impl Default for CloudClientOptions {
    fn default() -> Self {
        Self {
            reconnect_delay_min: BACKOFF_STEPS[0],
            reconnect_delay_max: BACKOFF_STEPS[BACKOFF_STEPS.len() - 1],
        }
    }
}

/// Events emitted towards the bridge.
#[derive(Debug)]
pub enum CloudEvent {
    /// The initial session is up and subscribed.
    Connected,
    /// An inbound PUBLISH, verbatim.
    Message {
        /// Cloud topic.
        topic: String,
        /// Raw payload.
        payload: Bytes,
    },
    /// The session dropped. A reconnect may follow.
    Disconnected,
    /// A reconnect attempt succeeded; subscriptions are restored.
    Reconnected,
    /// The reconnect budget is exhausted; the client has stopped.
    TerminalError {
        /// Final failure description.
        message: String,
    },
}

/// The default WebSocket transport towards the vendor cloud.
#[must_use]
pub fn cloud_transport() -> Arc<dyn Transport> {
    Arc::new(WebSocketTransport::new(CLOUD_MQTT_HOST, CLOUD_MQTT_PORT))
}

/// Handle to one account's supervisor. Cheap to clone.
#[derive(Clone)]
pub struct CloudClient {
    inner: Arc<Inner>,
}

struct Inner {
    auth: AuthPipeline,
    device_cache: DeviceCache,
    transport: Arc<dyn Transport>,
    options: CloudClientOptions,
    client_id: String,
    devices: RwLock<Vec<Device>>,
    tokens: Mutex<Option<TokenSet>>,
    engine: Mutex<Option<MqttEngine>>,
    running: AtomicBool,
    reconnecting: AtomicBool,
    events: mpsc::Sender<CloudEvent>,
}

impl CloudClient {
    /// Creates the supervisor. Nothing happens until
    /// [`CloudClient::connect`].
    #[must_use]
    pub fn new(
        auth: AuthPipeline,
        device_cache: DeviceCache,
        transport: Arc<dyn Transport>,
        options: CloudClientOptions,
    ) -> (Self, mpsc::Receiver<CloudEvent>) {
        let counter = CLIENT_ID_COUNTER.fetch_add(1, Ordering::Relaxed);
        let client_id = format!("fossibot_{}_{}", std::process::id(), counter);
        let (events, event_rx) = mpsc::channel(EVENT_QUEUE);
        let client = Self {
            inner: Arc::new(Inner {
                auth,
                device_cache,
                transport,
                options,
                client_id,
                devices: RwLock::new(Vec::new()),
                tokens: Mutex::new(None),
                engine: Mutex::new(None),
                running: AtomicBool::new(false),
                reconnecting: AtomicBool::new(false),
                events,
            }),
        };
        (client, event_rx)
    }

    /// Account email, for logs and ownership lookups.
    #[must_use]
    pub fn email(&self) -> &str {
        self.inner.auth.email()
    }

    /// Authenticates, discovers devices and opens the MQTT session.
    ///
    /// A CONNACK return code 5 on this first session triggers one
    /// immediate full re-authentication before giving up, so a revoked
    /// cached token heals without operator action.
    ///
    /// # Errors
    ///
    /// Returns the first unrecoverable failure; the caller decides
    /// whether the process survives it.
    pub async fn connect(&self) -> Result<(), Error> {
        let inner = &self.inner;
        inner.running.store(true, Ordering::SeqCst);

        let tokens = inner.auth.ensure_tokens().await?;
        *inner.tokens.lock() = Some(tokens.clone());
        let devices = Inner::discover(inner, false).await?;

        match Inner::open_session(inner, &tokens, &devices).await {
            Ok(()) => {}
            Err(Error::Auth(AuthError::NotAuthorised(code))) => {
                tracing::warn!(
                    account = %mask_email(self.email()),
                    code,
                    "Cloud session not authorised, re-authenticating once"
                );
                let tokens = Inner::reauthenticate(inner).await?;
                let devices = inner.devices.read().clone();
                Inner::open_session(inner, &tokens, &devices).await?;
            }
            Err(other) => return Err(other),
        }

        let _ = inner.events.send(CloudEvent::Connected).await;
        tracing::info!(
            account = %mask_email(self.email()),
            devices = inner.devices.read().len(),
            "Cloud client connected"
        );
        Ok(())
    }

    /// Publishes to a cloud topic.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotConnected`] while the session is down.
    pub async fn publish(&self, topic: &str, payload: &[u8], qos: QoS) -> Result<(), Error> {
        let engine = self
            .inner
            .engine
            .lock()
            .as_ref()
            .filter(|engine| engine.is_open())
            .cloned()
            .ok_or(Error::NotConnected)?;
        engine
            .publish(topic, Bytes::copy_from_slice(payload), qos, false)
            .await
    }

    /// Snapshot of the discovered devices.
    #[must_use]
    pub fn devices(&self) -> Vec<Device> {
        self.inner.devices.read().clone()
    }

    /// Whether this account owns the given MAC.
    #[must_use]
    pub fn owns_device(&self, mac: &str) -> bool {
        self.inner.devices.read().iter().any(|d| d.mac == mac)
    }

    /// Whether the MQTT session is currently up.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.inner
            .engine
            .lock()
            .as_ref()
            .is_some_and(MqttEngine::is_open)
    }

    /// Drops the cached device list, re-discovers and subscribes any
    /// new devices.
    ///
    /// # Errors
    ///
    /// Returns [`Error`] when discovery fails; the previous device list
    /// stays in effect.
    pub async fn refresh_device_list(&self) -> Result<Vec<Device>, Error> {
        let devices = Inner::discover(&self.inner, true).await?;
        let engine = self.inner.engine.lock().clone();
        if let Some(engine) = engine {
            Inner::subscribe_devices(&engine, &devices).await?;
        }
        Ok(devices)
    }

    /// Stops the supervisor: no further reconnects, graceful MQTT
    /// DISCONNECT, transport teardown. Idempotent.
    pub async fn disconnect(&self) {
        self.inner.running.store(false, Ordering::SeqCst);
        let engine = self.inner.engine.lock().take();
        if let Some(engine) = engine {
            engine.disconnect().await;
        }
        tracing::info!(account = %mask_email(self.email()), "Cloud client disconnected");
    }
}

impl Inner {
    /// Device discovery through the cache. `force` drops the cached
    /// list first (periodic refresh); authorisation failures never do.
    async fn discover(inner: &Arc<Self>, force: bool) -> Result<Vec<Device>, Error> {
        let email = inner.auth.email().to_string();
        if force {
            inner.device_cache.invalidate(&email);
        } else if let Some(devices) = inner.device_cache.get(&email) {
            *inner.devices.write() = devices.clone();
            return Ok(devices);
        }

        let tokens = inner
            .tokens
            .lock()
            .clone()
            .ok_or(Error::NotConnected)?;
        let devices = api::fetch_device_list(&inner.auth, &tokens).await?;
        if let Err(error) = inner.device_cache.put(&email, &devices) {
            tracing::warn!(%error, "Cannot persist device list");
        }
        *inner.devices.write() = devices.clone();
        Ok(devices)
    }

    /// Opens the MQTT engine and subscribes every device. The previous
    /// engine, if any, is closed first.
    async fn open_session(
        inner: &Arc<Self>,
        tokens: &TokenSet,
        devices: &[Device],
    ) -> Result<(), Error> {
        let previous = inner.engine.lock().take();
        if let Some(previous) = previous {
            previous.disconnect().await;
        }

        let mut options = EngineOptions::new(&inner.client_id);
        options.username = Some(tokens.mqtt.token.clone());
        options.password = Some(CLOUD_MQTT_PASSWORD.to_string());

        let (engine, events) = mqtt::connect(inner.transport.as_ref(), options)
            .await
            .map_err(map_connect_error)?;
        Self::subscribe_devices(&engine, devices).await?;

        *inner.engine.lock() = Some(engine);
        tokio::spawn(Self::pump(Arc::clone(inner), events));
        Ok(())
    }

    async fn subscribe_devices(engine: &MqttEngine, devices: &[Device]) -> Result<(), Error> {
        for device in devices {
            for topic in device_subscriptions(&device.mac) {
                engine.subscribe(topic, QoS::AtMostOnce).await?;
            }
        }
        Ok(())
    }

    /// Forwards engine events to the bridge and schedules reconnects.
    async fn pump(inner: Arc<Self>, mut events: mpsc::Receiver<EngineEvent>) {
        while let Some(event) = events.recv().await {
            match event {
                EngineEvent::Message { topic, payload } => {
                    // No per-topic parsing at this layer.
                    if inner
                        .events
                        .send(CloudEvent::Message { topic, payload })
                        .await
                        .is_err()
                    {
                        return;
                    }
                }
                EngineEvent::Disconnected { reason } => {
                    let _ = inner.events.send(CloudEvent::Disconnected).await;
                    if inner.running.load(Ordering::SeqCst) {
                        tracing::warn!(
                            account = %mask_email(inner.auth.email()),
                            ?reason,
                            "Cloud session lost, scheduling reconnect"
                        );
                        Self::schedule_reconnect(&inner, false);
                    }
                    return;
                }
            }
        }
    }

    /// Starts the reconnect loop unless one is already in flight.
    fn schedule_reconnect(inner: &Arc<Self>, force_reauth: bool) {
        if inner.reconnecting.swap(true, Ordering::SeqCst) {
            tracing::debug!("Reconnect already in flight, coalescing");
            return;
        }
        let inner = Arc::clone(inner);
        tokio::spawn(async move {
            Self::reconnect_loop(&inner, force_reauth).await;
            inner.reconnecting.store(false, Ordering::SeqCst);
        });
    }

    async fn reconnect_loop(inner: &Arc<Self>, mut force_reauth: bool) {
        for attempt in 1..=MAX_RECONNECT_ATTEMPTS {
            let delay = backoff_delay(
                attempt,
                inner.options.reconnect_delay_min,
                inner.options.reconnect_delay_max,
            );
            tokio::time::sleep(delay).await;
            if !inner.running.load(Ordering::SeqCst) {
                tracing::debug!("Shutdown during reconnect backoff, stopping");
                return;
            }

            let tier2 = force_reauth || !Self::tokens_valid(inner);
            let tier = if tier2 { 2 } else { 1 };
            tracing::info!(
                account = %mask_email(inner.auth.email()),
                attempt,
                tier,
                delay_s = delay.as_secs(),
                "Reconnect attempt"
            );

            let result = if tier2 {
                Self::tier2_reconnect(inner).await
            } else {
                Self::tier1_reconnect(inner).await
            };

            match result {
                Ok(()) => {
                    tracing::info!(
                        account = %mask_email(inner.auth.email()),
                        attempt,
                        "Reconnected"
                    );
                    let _ = inner.events.send(CloudEvent::Reconnected).await;
                    return;
                }
                Err(error) => {
                    if is_auth_failure(&error) {
                        force_reauth = true;
                    }
                    tracing::warn!(
                        account = %mask_email(inner.auth.email()),
                        attempt,
                        %error,
                        "Reconnect attempt failed"
                    );
                }
            }
        }

        inner.running.store(false, Ordering::SeqCst);
        let message = format!(
            "giving up after {MAX_RECONNECT_ATTEMPTS} reconnect attempts"
        );
        tracing::error!(account = %mask_email(inner.auth.email()), "{message}");
        let _ = inner.events.send(CloudEvent::TerminalError { message }).await;
    }

    /// Warm reconnect: keep tokens, reopen transport and engine,
    /// restore subscriptions.
    async fn tier1_reconnect(inner: &Arc<Self>) -> Result<(), Error> {
        let tokens = inner.tokens.lock().clone().ok_or(Error::NotConnected)?;
        let devices = inner.devices.read().clone();
        Self::open_session(inner, &tokens, &devices).await
    }

    /// Cold reconnect: fresh tokens, re-discovery, new session.
    async fn tier2_reconnect(inner: &Arc<Self>) -> Result<(), Error> {
        let tokens = Self::reauthenticate(inner).await?;
        let devices = Inner::discover(inner, false).await?;
        Self::open_session(inner, &tokens, &devices).await
    }

    /// Clears in-memory tokens, invalidates the token cache and re-runs
    /// the pipeline. The device cache is left alone: an authorisation
    /// failure is not a device-list change.
    async fn reauthenticate(inner: &Arc<Self>) -> Result<TokenSet, Error> {
        *inner.tokens.lock() = None;
        inner.auth.invalidate();
        let tokens = inner.auth.ensure_tokens().await?;
        *inner.tokens.lock() = Some(tokens.clone());
        Ok(tokens)
    }

    fn tokens_valid(inner: &Arc<Self>) -> bool {
        inner
            .tokens
            .lock()
            .as_ref()
            .is_some_and(|tokens| tokens.valid_at(now_unix()))
    }
}

/// CONNACK rc=5 is an authorisation failure; everything else passes
/// through.
fn map_connect_error(error: Error) -> Error {
    match error {
        Error::Mqtt(MqttError::ConnectionRefused(5)) => {
            Error::Auth(AuthError::NotAuthorised(5))
        }
        other => other,
    }
}

fn is_auth_failure(error: &Error) -> bool {
    matches!(
        error,
        Error::Auth(_) | Error::Mqtt(MqttError::ConnectionRefused(5))
    )
}

/// Delay before the given 1-based attempt, clamped to the configured
/// bounds.
fn backoff_delay(attempt: u32, min_secs: u64, max_secs: u64) -> Duration {
    let index = (attempt.saturating_sub(1) as usize).min(BACKOFF_STEPS.len() - 1);
    let seconds = BACKOFF_STEPS[index].clamp(min_secs, max_secs);
    Duration::from_secs(seconds)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{TokenCache, TokenStage};
    use crate::error::NetworkError;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicU32;

    #[test]
    fn backoff_schedule_matches_contract() {
        let delays: Vec<u64> = (1..=11)
            .map(|attempt| backoff_delay(attempt, 5, 60).as_secs())
            .collect();
        assert_eq!(delays[..6], [5, 10, 15, 30, 45, 60]);
        assert!(delays[6..].iter().all(|&d| d == 60));
    }

    #[test]
    fn backoff_respects_configured_bounds() {
        assert_eq!(backoff_delay(1, 10, 60).as_secs(), 10);
        assert_eq!(backoff_delay(6, 5, 30).as_secs(), 30);
    }

    #[test]
    fn rc5_maps_to_auth_failure() {
        let mapped = map_connect_error(Error::Mqtt(MqttError::ConnectionRefused(5)));
        assert!(matches!(mapped, Error::Auth(AuthError::NotAuthorised(5))));
        assert!(is_auth_failure(&mapped));

        let passthrough = map_connect_error(Error::Mqtt(MqttError::ConnectionRefused(3)));
        assert!(!is_auth_failure(&passthrough));
    }

    /// A transport whose dial always fails, counting attempts.
    struct FailingTransport {
        attempts: AtomicU32,
    }

    #[async_trait]
    impl Transport for FailingTransport {
        async fn connect(
            &self,
        ) -> Result<Box<dyn crate::transport::TransportStream>, NetworkError> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            Err(NetworkError::Timeout {
                operation: "TCP dial",
                seconds: 10,
            })
        }

        fn endpoint(&self) -> String {
            "test://failing".to_string()
        }
    }

    fn warm_client(dir: &std::path::Path, transport: Arc<dyn Transport>) -> (CloudClient, mpsc::Receiver<CloudEvent>) {
        let email = "user@example.org";
        let token_cache = TokenCache::new(dir, Duration::from_secs(300)).unwrap();
        let far = now_unix() + 100_000;
        token_cache.put(email, TokenStage::Login, "login-token", far).unwrap();
        token_cache.put(email, TokenStage::Mqtt, "mqtt-token", far).unwrap();
        let device_cache = DeviceCache::new(dir, Duration::from_secs(3600)).unwrap();
        device_cache
            .put(
                email,
                &[Device {
                    mac: "7C2C67AB5F0E".to_string(),
                    name: "Station".to_string(),
                    model: "F2400".to_string(),
                    online: true,
                    created_at: None,
                }],
            )
            .unwrap();

        let auth = AuthPipeline::new(email, "secret", token_cache).unwrap();
        let (client, events) =
            CloudClient::new(auth, device_cache, transport, CloudClientOptions::default());
        // Warm the in-memory token set too, so reconnects stay on the
        // warm tier and never touch the network.
        *client.inner.tokens.lock() = Some(TokenSet {
            login: crate::cloud::CachedTokenPair {
                token: "login-token".to_string(),
                expires_at: far,
            },
            mqtt: crate::cloud::CachedTokenPair {
                token: "mqtt-token".to_string(),
                expires_at: far,
            },
        });
        (client, events)
    }

    #[tokio::test(start_paused = true)]
    async fn reconnect_gives_up_after_ten_attempts() {
        let dir = tempfile::tempdir().unwrap();
        let transport = Arc::new(FailingTransport {
            attempts: AtomicU32::new(0),
        });
        let (client, mut events) = warm_client(dir.path(), Arc::clone(&transport) as Arc<dyn Transport>);

        client.inner.running.store(true, Ordering::SeqCst);
        let started = tokio::time::Instant::now();
        Inner::schedule_reconnect(&client.inner, false);

        loop {
            match events.recv().await.unwrap() {
                CloudEvent::TerminalError { message } => {
                    assert!(message.contains("10"));
                    break;
                }
                _ => {}
            }
        }

        assert_eq!(transport.attempts.load(Ordering::SeqCst), 10);
        // 5+10+15+30+45+60 + 4*60 seconds of backoff.
        assert!(started.elapsed() >= Duration::from_secs(405));
        assert!(!client.inner.running.load(Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_cancels_reconnect_backoff() {
        let dir = tempfile::tempdir().unwrap();
        let transport = Arc::new(FailingTransport {
            attempts: AtomicU32::new(0),
        });
        let (client, _events) = warm_client(dir.path(), Arc::clone(&transport) as Arc<dyn Transport>);

        client.inner.running.store(true, Ordering::SeqCst);
        Inner::schedule_reconnect(&client.inner, false);
        // Stop before the first 5 s delay elapses.
        client.inner.running.store(false, Ordering::SeqCst);
        tokio::time::advance(Duration::from_secs(500)).await;
        tokio::task::yield_now().await;

        assert_eq!(transport.attempts.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn publish_while_disconnected_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let transport = Arc::new(FailingTransport {
            attempts: AtomicU32::new(0),
        });
        let (client, _events) = warm_client(dir.path(), transport);
        let result = client.publish("AA/client/request/data", b"x", QoS::AtLeastOnce).await;
        assert!(matches!(result, Err(Error::NotConnected)));
    }

    #[tokio::test]
    async fn device_ownership_lookup() {
        let dir = tempfile::tempdir().unwrap();
        let transport = Arc::new(FailingTransport {
            attempts: AtomicU32::new(0),
        });
        let (client, _events) = warm_client(dir.path(), transport);
        // Device list is populated on discovery; force it from the cache.
        let devices = Inner::discover(&client.inner, false).await;
        // No tokens in memory yet: the cache hit path needs none.
        assert!(devices.is_ok());
        assert!(client.owns_device("7C2C67AB5F0E"));
        assert!(!client.owns_device("000000000000"));
    }
}
