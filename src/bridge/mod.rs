// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Bridge orchestrator.
//!
//! Owns the event loop that wires every account's cloud client to the
//! local broker: inbound register frames become state JSON on
//! `fossibot/<MAC>/state`, inbound command JSON becomes register writes
//! on `<MAC>/client/request/data`. The loop also runs the periodic
//! timers (status publish, update statistics, optional register poll,
//! device-list refresh) and supervises the local broker session with an
//! endless backoff, because device state remains valuable to late
//! consumers even after a broker outage.

mod health;
mod pidfile;

pub use health::{HealthSnapshot, HealthState};
pub use pidfile::PidFile;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, SecondsFormat, Utc};
use futures_util::future::try_join_all;
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior, interval, sleep};

use crate::cache::{DeviceCache, TokenCache};
use crate::cloud::{CloudClient, CloudClientOptions, CloudEvent, cloud_transport};
use crate::command::Command;
use crate::config::{Config, mask_email};
use crate::error::Error;
use crate::mqtt::{self, EngineEvent, EngineOptions, LastWill, MqttEngine, QoS};
use crate::payload;
use crate::state::StateStore;
use crate::topic::{
    BRIDGE_STATUS_TOPIC, COMMAND_SUBSCRIPTION, availability_topic, broker_to_cloud,
    cloud_to_broker, command_request_topic, extract_mac_from_broker_topic,
    extract_mac_from_cloud_topic, is_command_ack_topic,
};
use crate::transport::TcpTransport;

/// Window in which an inbound acknowledgement counts as
/// command-triggered.
const COMMAND_WINDOW: Duration = Duration::from_millis(3000);
/// Pause between a settings write and the verifying holding read.
const SETTINGS_REREAD_DELAY: Duration = Duration::from_secs(2);
/// Per-device floor between info-level state update log lines.
const STATE_LOG_INTERVAL: Duration = Duration::from_secs(5);
/// Period of the update statistics log line.
const STATS_LOG_INTERVAL: Duration = Duration::from_secs(60);
/// Local broker backoff schedule; stays at the last entry afterwards.
const BROKER_BACKOFF_STEPS: [u64; 5] = [5, 10, 15, 30, 60];
/// Depth of the central loop channel.
const LOOP_QUEUE: usize = 1024;

/// Everything the event loop reacts to, merged into one ordered queue.
enum LoopEvent {
    Cloud {
        account: usize,
        event: CloudEvent,
    },
    Local(EngineEvent),
    BrokerRestored {
        engine: MqttEngine,
        events: mpsc::Receiver<EngineEvent>,
    },
    PollDevice {
        mac: String,
    },
}

#[derive(Default)]
struct UpdateStats {
    spontaneous: u64,
    command_triggered: u64,
    commands_forwarded: u64,
    reported_spontaneous: u64,
    reported_command_triggered: u64,
}

struct ThrottleEntry {
    last_logged: Option<Instant>,
    suppressed: u32,
}

/// The daemon core. Constructed and driven by [`Bridge::run`].
pub struct Bridge {
    config: Config,
    store: Arc<StateStore>,
    clients: Vec<CloudClient>,
    local: Option<MqttEngine>,
    health: HealthState,
    started_at: DateTime<Utc>,
    started_instant: Instant,
    loop_tx: mpsc::Sender<LoopEvent>,
    last_command_sent: HashMap<String, Instant>,
    throttle: HashMap<String, ThrottleEntry>,
    stats: UpdateStats,
    broker_task: Option<JoinHandle<()>>,
    health_task: Option<JoinHandle<()>>,
    _pidfile: PidFile,
}

impl Bridge {
    /// Runs the daemon until SIGTERM or SIGINT.
    ///
    /// # Errors
    ///
    /// Returns [`Error`] when startup cannot complete: PID file held by
    /// a live instance, unusable cache directory, or any account's
    /// initial cloud connect failing.
    pub async fn run(config: Config) -> Result<(), Error> {
        let pidfile = PidFile::acquire(&config.pid_file_path())?;

        let token_cache = TokenCache::new(
            &config.cache.directory,
            Duration::from_secs(config.cache.token_ttl_safety_margin),
        )
        .map_err(|e| {
            Error::Fatal(format!(
                "cache directory {} is unusable: {e}",
                config.cache.directory.display()
            ))
        })?;
        let device_cache = DeviceCache::new(
            &config.cache.directory,
            Duration::from_secs(config.cache.device_list_ttl),
        )
        .map_err(|e| {
            Error::Fatal(format!(
                "cache directory {} is unusable: {e}",
                config.cache.directory.display()
            ))
        })?;

        let (loop_tx, loop_rx) = mpsc::channel(LOOP_QUEUE);

        let client_options = CloudClientOptions {
            reconnect_delay_min: config.bridge.reconnect_delay_min,
            reconnect_delay_max: config.bridge.reconnect_delay_max,
        };
        let mut clients = Vec::new();
        for (account, account_config) in config.enabled_accounts().enumerate() {
            let auth = crate::cloud::AuthPipeline::new(
                &account_config.email,
                &account_config.password,
                token_cache.clone(),
            )?;
            let (client, events) = CloudClient::new(
                auth,
                device_cache.clone(),
                cloud_transport(),
                client_options.clone(),
            );
            forward_cloud_events(account, events, loop_tx.clone());
            clients.push(client);
        }

        let health = HealthState::new(clients.len());
        let mut bridge = Self {
            store: Arc::new(StateStore::new()),
            clients,
            local: None,
            health,
            started_at: Utc::now(),
            started_instant: Instant::now(),
            loop_tx,
            last_command_sent: HashMap::new(),
            throttle: HashMap::new(),
            stats: UpdateStats::default(),
            broker_task: None,
            health_task: None,
            _pidfile: pidfile,
            config,
        };

        bridge.start().await?;
        bridge.event_loop(loop_rx).await?;
        bridge.shutdown().await;
        Ok(())
    }

    /// Startup steps after construction: cloud sessions, local broker,
    /// initial reads, availability, health server.
    async fn start(&mut self) -> Result<(), Error> {
        tracing::info!(
            accounts = self.clients.len(),
            "Starting bridge"
        );

        // All accounts must come up, or the daemon refuses to start.
        try_join_all(self.clients.iter().map(CloudClient::connect)).await?;

        // The local broker, by contrast, is waited for indefinitely.
        let mut attempt = 0u32;
        let (engine, events) = loop {
            match connect_local(&self.config).await {
                Ok(pair) => break pair,
                Err(error) => {
                    let delay = broker_backoff(
                        attempt,
                        self.config.bridge.reconnect_delay_min,
                        self.config.bridge.reconnect_delay_max,
                    );
                    tracing::warn!(
                        attempt,
                        %error,
                        delay_s = delay.as_secs(),
                        "Cannot reach local broker, retrying"
                    );
                    sleep(delay).await;
                    attempt += 1;
                }
            }
        };
        self.local = Some(engine);
        forward_local_events(events, self.loop_tx.clone());

        self.publish_all_availability().await;
        self.poll_all_devices().await;
        self.publish_bridge_status().await;
        self.refresh_health();

        if self.config.health.enabled {
            let task = health::spawn(self.health.clone(), self.config.health.port)
                .await
                .map_err(|e| Error::Fatal(format!("health endpoint cannot listen: {e}")))?;
            self.health_task = Some(task);
        }
        tracing::info!("Bridge started");
        Ok(())
    }

    async fn event_loop(&mut self, mut loop_rx: mpsc::Receiver<LoopEvent>) -> Result<(), Error> {
        use tokio::signal::unix::{SignalKind, signal};

        let mut sigterm = signal(SignalKind::terminate())
            .map_err(|e| Error::Fatal(format!("cannot install SIGTERM handler: {e}")))?;
        let mut sigint = signal(SignalKind::interrupt())
            .map_err(|e| Error::Fatal(format!("cannot install SIGINT handler: {e}")))?;

        let mut status_ticker = ticker(self.config.bridge.status_publish_interval.max(1));
        let mut stats_ticker = ticker(STATS_LOG_INTERVAL.as_secs());
        let poll_enabled = self.config.bridge.device_poll_interval > 0;
        let mut poll_ticker = ticker(self.config.bridge.device_poll_interval.max(3600));
        let refresh_enabled = self.config.cache.device_refresh_interval > 0;
        let mut refresh_ticker = ticker(self.config.cache.device_refresh_interval.max(3600));

        loop {
            tokio::select! {
                Some(event) = loop_rx.recv() => self.handle_loop_event(event).await,
                _ = status_ticker.tick() => self.publish_bridge_status().await,
                _ = stats_ticker.tick() => self.log_update_stats(),
                _ = poll_ticker.tick(), if poll_enabled => self.poll_all_devices().await,
                _ = refresh_ticker.tick(), if refresh_enabled => self.refresh_device_lists().await,
                _ = sigterm.recv() => {
                    tracing::info!("SIGTERM received");
                    break;
                }
                _ = sigint.recv() => {
                    tracing::info!("SIGINT received");
                    break;
                }
            }
        }
        Ok(())
    }

    async fn handle_loop_event(&mut self, event: LoopEvent) {
        match event {
            LoopEvent::Cloud { account, event } => self.handle_cloud_event(account, event).await,
            LoopEvent::Local(EngineEvent::Message { topic, payload }) => {
                self.handle_local_command(&topic, &payload).await;
            }
            LoopEvent::Local(EngineEvent::Disconnected { reason }) => {
                tracing::warn!(?reason, "Local broker session lost");
                self.local = None;
                self.refresh_health();
                self.spawn_broker_reconnect();
            }
            LoopEvent::BrokerRestored { engine, events } => {
                tracing::info!("Local broker session restored");
                self.local = Some(engine);
                forward_local_events(events, self.loop_tx.clone());
                self.refresh_health();
                self.publish_all_availability().await;
                self.publish_bridge_status().await;
            }
            LoopEvent::PollDevice { mac } => self.send_holding_read(&mac).await,
        }
    }

    async fn handle_cloud_event(&mut self, account: usize, event: CloudEvent) {
        let email = self
            .clients
            .get(account)
            .map(|c| mask_email(c.email()))
            .unwrap_or_default();
        match event {
            CloudEvent::Message { topic, payload } => {
                self.handle_cloud_message(&topic, &payload).await;
            }
            CloudEvent::Connected => {
                tracing::info!(account = %email, "Cloud account connected");
                self.refresh_health();
            }
            CloudEvent::Reconnected => {
                tracing::info!(account = %email, "Cloud account reconnected");
                self.refresh_health();
            }
            CloudEvent::Disconnected => {
                tracing::warn!(account = %email, "Cloud account disconnected");
                self.refresh_health();
            }
            CloudEvent::TerminalError { message } => {
                tracing::error!(account = %email, %message, "Cloud account gave up reconnecting");
                self.refresh_health();
            }
        }
    }

    /// Cloud frame → state store → local state topic.
    async fn handle_cloud_message(&mut self, topic: &str, payload: &Bytes) {
        let Some(mac) = extract_mac_from_cloud_topic(topic) else {
            tracing::trace!(topic, "Ignoring cloud topic without a MAC");
            return;
        };
        let mac = mac.to_string();
        let Some(state_topic) = cloud_to_broker(topic) else {
            tracing::trace!(topic, "Ignoring unmapped cloud topic");
            return;
        };

        let frame = match payload::parse_frame(payload) {
            Ok(frame) => frame,
            Err(error) => {
                tracing::warn!(topic, %error, len = payload.len(), "Dropping malformed frame");
                return;
            }
        };
        if self.config.debug.log_raw_registers {
            tracing::debug!(mac = %mac, registers = ?frame.registers, "Raw registers");
        }

        let command_triggered = is_command_ack_topic(topic)
            && self
                .last_command_sent
                .get(&mac)
                .is_some_and(|at| at.elapsed() <= COMMAND_WINDOW);

        let snapshot = self
            .store
            .update_from_frame(&mac, &frame, topic, command_triggered);
        self.note_update(&mac, topic, command_triggered, snapshot.soc);

        let state_json = payload::state_to_json(&snapshot);
        match &self.local {
            Some(engine) => {
                if let Err(error) = engine
                    .publish(state_topic, state_json, QoS::AtMostOnce, false)
                    .await
                {
                    tracing::warn!(mac = %mac, %error, "Cannot publish state update");
                }
            }
            None => {
                tracing::debug!(mac = %mac, "Local broker down; state kept in memory only");
            }
        }
    }

    /// Consumer command JSON → register write on the owning account.
    async fn handle_local_command(&mut self, topic: &str, payload: &Bytes) {
        let Some(mac) = extract_mac_from_broker_topic(topic) else {
            tracing::trace!(topic, "Ignoring local topic without a MAC");
            return;
        };
        let mac = mac.to_string();
        let Some(cloud_topic) = broker_to_cloud(topic) else {
            tracing::trace!(topic, "Ignoring non-command local topic");
            return;
        };

        let Ok(text) = std::str::from_utf8(payload) else {
            tracing::warn!(mac = %mac, "Rejecting non-UTF-8 command payload");
            return;
        };
        let command = match payload::json_to_command(text) {
            Ok(command) => command,
            Err(error) => {
                // No publish and no acknowledgement: MQTT has no
                // request/response semantic here.
                tracing::warn!(mac = %mac, %error, "Rejecting invalid command");
                return;
            }
        };

        let Some(client) = self
            .clients
            .iter()
            .find(|c| c.owns_device(&mac))
            .cloned()
        else {
            tracing::warn!(mac = %mac, "No account owns this device");
            return;
        };

        let bytes = payload::command_to_bytes(&command);
        match client.publish(&cloud_topic, &bytes, QoS::AtLeastOnce).await {
            Ok(()) => {
                tracing::info!(mac = %mac, command = command.description(), "Command forwarded");
                self.last_command_sent.insert(mac.clone(), Instant::now());
                self.stats.commands_forwarded += 1;
                if command.is_settings_write() {
                    self.schedule_settings_reread(mac);
                }
            }
            Err(error) => {
                tracing::warn!(mac = %mac, %error, "Cannot forward command");
            }
        }
    }

    /// Settings writes only surface on the next read; sample one
    /// shortly after the write.
    fn schedule_settings_reread(&self, mac: String) {
        let tx = self.loop_tx.clone();
        tokio::spawn(async move {
            sleep(SETTINGS_REREAD_DELAY).await;
            let _ = tx.send(LoopEvent::PollDevice { mac }).await;
        });
    }

    async fn send_holding_read(&mut self, mac: &str) {
        let Some(client) = self
            .clients
            .iter()
            .find(|c| c.owns_device(mac))
            .cloned()
        else {
            tracing::warn!(mac = %mac, "Cannot poll unowned device");
            return;
        };
        let bytes = payload::command_to_bytes(&Command::read_settings());
        match client
            .publish(&command_request_topic(mac), &bytes, QoS::AtLeastOnce)
            .await
        {
            Ok(()) => {
                tracing::debug!(mac = %mac, "Holding-register read requested");
                self.last_command_sent.insert(mac.to_string(), Instant::now());
            }
            Err(error) => {
                tracing::warn!(mac = %mac, %error, "Cannot request holding-register read");
            }
        }
    }

    async fn poll_all_devices(&mut self) {
        let macs: Vec<String> = self
            .clients
            .iter()
            .flat_map(|client| client.devices().into_iter().map(|d| d.mac))
            .collect();
        for mac in macs {
            self.send_holding_read(&mac).await;
        }
    }

    /// Retained `online`/`offline` per device, from the discovery
    /// payload's online flag.
    async fn publish_all_availability(&mut self) {
        let Some(engine) = self.local.clone() else {
            return;
        };
        for client in &self.clients {
            for device in client.devices() {
                let payload: &'static [u8] = if device.online { b"online" } else { b"offline" };
                if let Err(error) = engine
                    .publish(
                        availability_topic(&device.mac),
                        payload,
                        QoS::AtLeastOnce,
                        true,
                    )
                    .await
                {
                    tracing::warn!(mac = %device.mac, %error, "Cannot publish availability");
                }
            }
        }
    }

    async fn publish_bridge_status(&mut self) {
        self.refresh_health();
        let Some(engine) = self.local.clone() else {
            return;
        };
        let document = self.status_document();
        if let Err(error) = engine
            .publish(
                BRIDGE_STATUS_TOPIC,
                document.to_string(),
                QoS::AtLeastOnce,
                true,
            )
            .await
        {
            tracing::warn!(%error, "Cannot publish bridge status");
        }
    }

    fn status_document(&self) -> Value {
        let accounts: Vec<Value> = self
            .clients
            .iter()
            .map(|client| {
                json!({
                    "email": mask_email(client.email()),
                    "connected": client.is_connected(),
                    "device_count": client.devices().len(),
                })
            })
            .collect();
        let devices: Vec<_> = self
            .clients
            .iter()
            .flat_map(|client| client.devices())
            .collect();
        json!({
            "status": "online",
            "started_at": self.started_at.to_rfc3339_opts(SecondsFormat::Secs, true),
            "uptime_seconds": self.started_instant.elapsed().as_secs(),
            "accounts": accounts,
            "devices": {
                "total": devices.len(),
                "online": devices.iter().filter(|d| d.online).count(),
            },
            "spontaneous_updates": self.stats.spontaneous,
            "command_triggered_updates": self.stats.command_triggered,
            "commands_forwarded": self.stats.commands_forwarded,
        })
    }

    fn refresh_health(&self) {
        let accounts_connected = self
            .clients
            .iter()
            .filter(|c| c.is_connected())
            .count();
        let devices: Vec<_> = self
            .clients
            .iter()
            .flat_map(|client| client.devices())
            .collect();
        let local_up = self.local.as_ref().is_some_and(MqttEngine::is_open);
        self.health.update(|snapshot| {
            snapshot.accounts_connected = accounts_connected;
            snapshot.devices_total = devices.len();
            snapshot.devices_online = devices.iter().filter(|d| d.online).count();
            snapshot.local_broker_connected = local_up;
        });
    }

    /// Per-device info logs are rate limited so a chatty device cannot
    /// stall the loop on log I/O; the suppressed count rides along on
    /// the next emission.
    fn note_update(&mut self, mac: &str, topic: &str, command_triggered: bool, soc: Option<f64>) {
        if command_triggered {
            self.stats.command_triggered += 1;
        } else {
            self.stats.spontaneous += 1;
        }

        let entry = self.throttle.entry(mac.to_string()).or_insert(ThrottleEntry {
            last_logged: None,
            suppressed: 0,
        });
        if let Some(suppressed) = throttle_decision(entry, STATE_LOG_INTERVAL) {
            if self.config.debug.log_update_source {
                tracing::info!(mac = %mac, ?soc, command_triggered, suppressed, source = %topic, "State update");
            } else {
                tracing::info!(mac = %mac, ?soc, command_triggered, suppressed, "State update");
            }
        } else {
            tracing::debug!(mac = %mac, ?soc, command_triggered, "State update (throttled)");
        }
    }

    fn log_update_stats(&mut self) {
        let spontaneous = self.stats.spontaneous - self.stats.reported_spontaneous;
        let command_triggered =
            self.stats.command_triggered - self.stats.reported_command_triggered;
        tracing::info!(
            spontaneous,
            command_triggered,
            devices = self.store.len(),
            "State update statistics"
        );
        self.stats.reported_spontaneous = self.stats.spontaneous;
        self.stats.reported_command_triggered = self.stats.command_triggered;
    }

    async fn refresh_device_lists(&mut self) {
        tracing::info!("Refreshing device lists");
        for client in &self.clients {
            match client.refresh_device_list().await {
                Ok(devices) => {
                    tracing::info!(
                        account = %mask_email(client.email()),
                        count = devices.len(),
                        "Device list refreshed"
                    );
                }
                Err(error) => {
                    tracing::warn!(
                        account = %mask_email(client.email()),
                        %error,
                        "Device list refresh failed"
                    );
                }
            }
        }
        self.publish_all_availability().await;
        self.refresh_health();
    }

    /// Endless reconnection towards the local broker. Coalesced: a
    /// second disconnect while a reconnect runs does nothing.
    fn spawn_broker_reconnect(&mut self) {
        if self
            .broker_task
            .as_ref()
            .is_some_and(|task| !task.is_finished())
        {
            return;
        }
        let config = self.config.clone();
        let tx = self.loop_tx.clone();
        self.broker_task = Some(tokio::spawn(async move {
            let mut attempt = 0u32;
            loop {
                let delay = broker_backoff(
                    attempt,
                    config.bridge.reconnect_delay_min,
                    config.bridge.reconnect_delay_max,
                );
                sleep(delay).await;
                match connect_local(&config).await {
                    Ok((engine, events)) => {
                        let _ = tx.send(LoopEvent::BrokerRestored { engine, events }).await;
                        return;
                    }
                    Err(error) => {
                        tracing::warn!(attempt, %error, "Local broker reconnect failed");
                        attempt += 1;
                    }
                }
            }
        }));
    }

    async fn shutdown(&mut self) {
        tracing::info!("Shutting down");
        if let Some(engine) = &self.local {
            let _ = engine
                .publish(BRIDGE_STATUS_TOPIC, &b"offline"[..], QoS::AtLeastOnce, true)
                .await;
            for client in &self.clients {
                for device in client.devices() {
                    let _ = engine
                        .publish(
                            availability_topic(&device.mac),
                            &b"offline"[..],
                            QoS::AtLeastOnce,
                            true,
                        )
                        .await;
                }
            }
        }
        for client in &self.clients {
            client.disconnect().await;
        }
        if let Some(engine) = self.local.take() {
            engine.disconnect().await;
        }
        if let Some(task) = self.health_task.take() {
            task.abort();
        }
        if let Some(task) = self.broker_task.take() {
            task.abort();
        }
        tracing::info!("Bridge stopped");
    }
}

/// Emitting decision for the throttled per-device log. Returns the
/// suppressed count when the caller should emit at info level.
fn throttle_decision(entry: &mut ThrottleEntry, min_interval: Duration) -> Option<u32> {
    let emit = entry
        .last_logged
        .is_none_or(|at| at.elapsed() >= min_interval);
    if emit {
        let suppressed = entry.suppressed;
        entry.last_logged = Some(Instant::now());
        entry.suppressed = 0;
        Some(suppressed)
    } else {
        entry.suppressed += 1;
        None
    }
}

/// One dial towards the local broker, with last-will and the command
/// subscription installed.
async fn connect_local(
    config: &Config,
) -> Result<(MqttEngine, mpsc::Receiver<EngineEvent>), Error> {
    let transport = TcpTransport::new(&config.mosquitto.host, config.mosquitto.port);
    let mut options = EngineOptions::new(&config.mosquitto.client_id);
    options.username = config.mosquitto.username.clone();
    options.password = config.mosquitto.password.clone();
    options.last_will = Some(LastWill {
        topic: BRIDGE_STATUS_TOPIC.to_string(),
        payload: Bytes::from_static(b"offline"),
        qos: QoS::AtLeastOnce,
        retain: true,
    });

    let (engine, events) = mqtt::connect(&transport, options).await?;
    engine
        .subscribe(COMMAND_SUBSCRIPTION, QoS::AtLeastOnce)
        .await?;
    Ok((engine, events))
}

fn broker_backoff(attempt: u32, min_secs: u64, max_secs: u64) -> Duration {
    let index = (attempt as usize).min(BROKER_BACKOFF_STEPS.len() - 1);
    Duration::from_secs(BROKER_BACKOFF_STEPS[index].clamp(min_secs, max_secs))
}

fn ticker(period_secs: u64) -> tokio::time::Interval {
    let mut ticker = interval(Duration::from_secs(period_secs.max(1)));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // Skip the immediate first tick; startup does its own publishes.
    ticker.reset();
    ticker
}

fn forward_cloud_events(
    account: usize,
    mut events: mpsc::Receiver<CloudEvent>,
    tx: mpsc::Sender<LoopEvent>,
) {
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            if tx.send(LoopEvent::Cloud { account, event }).await.is_err() {
                return;
            }
        }
    });
}

fn forward_local_events(mut events: mpsc::Receiver<EngineEvent>, tx: mpsc::Sender<LoopEvent>) {
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            if tx.send(LoopEvent::Local(event)).await.is_err() {
                return;
            }
        }
    });
}
