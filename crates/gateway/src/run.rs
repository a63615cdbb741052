// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Process wiring: build every subsystem, start the task fleet, and stage
//! the shutdown.
//!
//! Shutdown order: sender scheduler, warm-up, resend worker, HTTP transport
//! (dropped with the sender), pubsub, device manager.

use std::path::Path;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use tracing::{info, warn};

use crate::alert::{AlertConfig, AlertEvaluator};
use crate::composite_eval::{CompositeEvaluator, FileExecutionStore};
use crate::config::Config;
use crate::control::{ConstraintConfig, ControlConfig, ControlEvaluator};
use crate::error::ConfigError;
use crate::event::{AlertEdge, Event};
use crate::executor::ControlExecutor;
use crate::health::{HealthConfig, HealthManager};
use crate::manager::{DeviceConfig, DeviceManager};
use crate::monitor::{Monitor, MonitorConfig};
use crate::outbox::OutboxStore;
use crate::pubsub::{PubSub, Topic, TopicPolicy};
use crate::registry::SubscriberRegistry;
use crate::resend::ResendWorker;
use crate::sender::{HttpTransport, Sender, SenderConfig, UplinkShared};
use crate::store::{CleanupTask, SnapshotStore};
use crate::virtual_device::{VirtualDeviceManager, VirtualDevicesConfig};
use crate::work_hours::{WorkHoursConfig, WorkHoursEvaluator};

/// Load a JSON configuration file into a typed structure.
pub fn load_json<T: DeserializeOwned>(path: &Path) -> Result<T, ConfigError> {
    let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.display().to_string(),
        source,
    })?;
    serde_json::from_str(&raw).map_err(|source| ConfigError::Parse {
        path: path.display().to_string(),
        source,
    })
}

fn init_logging(config: &Config) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(config.log_level.clone()));
    if config.log_format == "json" {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

pub async fn run(config: Config) -> anyhow::Result<()> {
    init_logging(&config);
    info!(version = env!("CARGO_PKG_VERSION"), "fieldgate starting");

    // ---- configuration ----
    let device_config: DeviceConfig = load_json(&config.device_config)?;
    let constraints: ConstraintConfig = match &config.instance_config {
        Some(path) => load_json(path)?,
        None => ConstraintConfig::new(),
    };

    // ---- core components ----
    let pubsub: Arc<PubSub<Event>> = Arc::new(PubSub::new());
    pubsub.set_topic_policy(Topic::DeviceSnapshot, TopicPolicy::default());
    pubsub.set_topic_policy(
        Topic::AlertWarning,
        TopicPolicy { queue_maxsize: 200, ..TopicPolicy::default() },
    );
    pubsub.set_topic_policy(
        Topic::AlertResolved,
        TopicPolicy { queue_maxsize: 200, ..TopicPolicy::default() },
    );
    if let Some(path) = &config.pubsub_config {
        let policies: std::collections::HashMap<String, TopicPolicy> = load_json(path)?;
        for (name, policy) in policies {
            let Some(topic) = Topic::ALL.iter().find(|t| t.as_str() == name) else {
                warn!(topic = %name, "unknown pubsub topic in config, ignoring");
                continue;
            };
            pubsub.set_topic_policy(*topic, policy);
        }
    }

    let devices = Arc::new(DeviceManager::from_config(device_config, &constraints)?);
    devices.init().await;

    let health_config = match &config.health_config {
        Some(path) => load_json::<HealthConfig>(path)?,
        None => HealthManager::calculate_health_params(config.monitor_interval),
    };
    info!(?health_config, "health parameters resolved");
    let health = Arc::new(HealthManager::new(health_config));
    let device_types: Vec<&str> =
        devices.device_list().iter().map(|d| d.device_type.as_str()).collect();
    health.configure_for_device_list(&device_types, config.monitor_interval);
    for device in devices.device_list() {
        health.register_device(&device.device_id(), Some(&device.device_type));
        if let Some(check) = device.health_check_config() {
            health.register_health_check_config(&device.device_id(), check.clone());
        }
    }
    info!(summary = ?health.get_health_check_summary(), "health checks configured");

    apply_startup_frequencies(&devices, &health, &constraints).await;

    let virtual_devices = match &config.virtual_device_config {
        Some(path) => {
            let virtual_config: VirtualDevicesConfig = load_json(path)?;
            let manager = VirtualDeviceManager::new(virtual_config, devices.max_slave_id());
            (!manager.is_empty()).then(|| Arc::new(manager))
        }
        None => None,
    };

    let monitor = Arc::new(Monitor::new(
        Arc::clone(&devices),
        Arc::clone(&health),
        Arc::clone(&pubsub),
        virtual_devices,
        MonitorConfig {
            interval_seconds: config.monitor_interval,
            device_timeout_sec: config.device_timeout,
            read_concurrency: config.read_concurrency,
            log_each_device: config.log_each_device,
        },
    ));

    let mut registry = SubscriberRegistry::new();

    // ---- pubsub drop metrics ----
    {
        let pubsub = Arc::clone(&pubsub);
        registry.spawn("pubsub-metrics", move |cancel| {
            crate::pubsub::drop_metrics_loop(pubsub, std::time::Duration::from_secs(60), cancel)
        });
    }

    // ---- alert pipeline ----
    if let Some(path) = &config.alert_config {
        let alert_config: AlertConfig = load_json(path)?;
        let work_hours = match &config.work_hours_config {
            Some(path) => {
                let work_config: WorkHoursConfig = load_json(path)?;
                Some(Arc::new(WorkHoursEvaluator::new(work_config)))
            }
            None => None,
        };
        let evaluator =
            Arc::new(AlertEvaluator::new(alert_config, &devices.device_ids(), work_hours));

        let pubsub_for_alerts = Arc::clone(&pubsub);
        registry.spawn("alert-evaluator", move |cancel| async move {
            let mut subscription = pubsub_for_alerts.subscribe(Topic::DeviceSnapshot);
            loop {
                let event = tokio::select! {
                    _ = cancel.cancelled() => break,
                    event = subscription.recv() => event,
                };
                let Some(event) = event else { break };
                let Some(snapshot) = event.as_snapshot() else { continue };
                for notice in evaluator.evaluate(snapshot) {
                    let topic = match notice.edge {
                        AlertEdge::Triggered => Topic::AlertWarning,
                        AlertEdge::Resolved => Topic::AlertResolved,
                    };
                    pubsub_for_alerts.publish(topic, Event::Alert(Arc::new(notice))).await;
                }
            }
        });

        // Log notifier: the outward notification fan-out lives elsewhere;
        // this subscriber keeps the alert stream observable on the box.
        let pubsub_for_notify = Arc::clone(&pubsub);
        registry.spawn("alert-notifier", move |cancel| async move {
            let mut warnings = pubsub_for_notify.subscribe(Topic::AlertWarning);
            let mut resolved = pubsub_for_notify.subscribe(Topic::AlertResolved);
            loop {
                let event = tokio::select! {
                    _ = cancel.cancelled() => break,
                    event = warnings.recv() => event,
                    event = resolved.recv() => event,
                };
                let Some(event) = event else { break };
                if let Some(notice) = event.as_alert() {
                    info!(
                        device = %notice.device_id,
                        code = %notice.code,
                        edge = notice.edge.as_str(),
                        severity = notice.severity.as_str(),
                        "{}",
                        notice.message
                    );
                }
            }
        });
    }

    // ---- control pipeline ----
    if let Some(path) = &config.control_config {
        let control_config: ControlConfig = load_json(path)?;
        let execution_store =
            Arc::new(FileExecutionStore::open(config.state_dir.join("rule_executions.jsonl")));
        let evaluator = Arc::new(ControlEvaluator::new(
            control_config,
            constraints.clone(),
            CompositeEvaluator::new(None, Some(execution_store)),
        ));
        let executor =
            Arc::new(ControlExecutor::new(Arc::clone(&devices), Some(Arc::clone(&health))));

        let pubsub_for_control = Arc::clone(&pubsub);
        registry.spawn("control", move |cancel| async move {
            let mut subscription = pubsub_for_control.subscribe(Topic::DeviceSnapshot);
            loop {
                let event = tokio::select! {
                    _ = cancel.cancelled() => break,
                    event = subscription.recv() => event,
                };
                let Some(event) = event else { break };
                let Some(snapshot) = event.as_snapshot() else { continue };
                if snapshot.is_virtual || !snapshot.is_online {
                    continue;
                }
                let actions =
                    evaluator.evaluate(&snapshot.model, snapshot.slave_id, &snapshot.values);
                if !actions.is_empty() {
                    executor.execute(&actions).await;
                }
            }
        });
    }

    // ---- snapshot storage ----
    let mut snapshot_store = None;
    if let Some(path) = &config.storage_config {
        let storage_config: crate::store::SnapshotStorageConfig = load_json(path)?;
        if storage_config.enabled {
            let store = Arc::new(SnapshotStore::open(&storage_config.db_path)?);
            snapshot_store = Some(Arc::clone(&store));

            let saver_store = Arc::clone(&store);
            let pubsub_for_saver = Arc::clone(&pubsub);
            registry.spawn("snapshot-saver", move |cancel| async move {
                let mut subscription = pubsub_for_saver.subscribe(Topic::DeviceSnapshot);
                loop {
                    let event = tokio::select! {
                        _ = cancel.cancelled() => break,
                        event = subscription.recv() => event,
                    };
                    let Some(event) = event else { break };
                    let Some(snapshot) = event.as_snapshot() else { continue };
                    if let Err(e) = saver_store.insert(snapshot).await {
                        warn!(device = %snapshot.device_id, "snapshot insert failed: {e}");
                    }
                }
            });

            let cleanup = CleanupTask::new(store, storage_config);
            registry.spawn("snapshot-cleanup", move |cancel| cleanup.run(cancel));
            info!("snapshot storage enabled");
        } else {
            info!("snapshot storage disabled by config");
        }
    }

    // ---- cloud sender ----
    if let Some(path) = &config.sender_config {
        let sender_config: SenderConfig = load_json(path)?;
        let outbox = Arc::new(OutboxStore::new(sender_config.outbox.clone())?);
        let transport: Arc<dyn crate::sender::ResendTransport> =
            Arc::new(HttpTransport::new(&sender_config.ima_url));
        let shared = Arc::new(UplinkShared::default());
        let sender = Arc::new(Sender::new(
            sender_config.clone(),
            Arc::clone(&outbox),
            Arc::clone(&transport),
            Arc::clone(&shared),
            &config.state_dir,
        ));
        sender.start();

        let pubsub_for_sender = Arc::clone(&pubsub);
        let sender_for_sub = Arc::clone(&sender);
        registry.spawn("sender-subscriber", move |cancel| async move {
            let mut subscription = pubsub_for_sender.subscribe(Topic::DeviceSnapshot);
            loop {
                let event = tokio::select! {
                    _ = cancel.cancelled() => break,
                    event = subscription.recv() => event,
                };
                let Some(event) = event else { break };
                if let Some(snapshot) = event.as_snapshot() {
                    sender_for_sub.handle_snapshot(Arc::clone(snapshot));
                }
            }
        });

        if sender_config.fail_resend_enabled {
            let worker = Arc::new(ResendWorker::new(
                sender_config,
                sender.gateway_id(),
                outbox,
                transport,
                shared,
            ));
            registry.spawn("sender-resend", move |cancel| worker.run(cancel));
        }

        let warmup_sender = Arc::clone(&sender);
        registry.spawn("sender-warmup", move |cancel| warmup_sender.warmup_run(cancel));
        let scheduler_sender = Arc::clone(&sender);
        registry.spawn("sender-scheduler", move |cancel| scheduler_sender.scheduler_run(cancel));
    }

    // ---- monitor last: everything downstream is subscribed by now ----
    {
        let monitor = Arc::clone(&monitor);
        registry.spawn("monitor", move |cancel| monitor.run(cancel));
    }

    info!(tasks = ?registry.task_names(), "all subsystems running");

    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received");

    // Staged shutdown: scheduler first so no new sends start, then warm-up,
    // then the resend worker; the rest stops in reverse start order.
    registry.stop("sender-scheduler").await;
    registry.stop("sender-warmup").await;
    registry.stop("sender-resend").await;
    registry.stop_all().await;

    pubsub.close();
    if let Some(store) = snapshot_store {
        drop(store);
        info!("snapshot store closed");
    }
    devices.shutdown().await;

    info!("shutdown complete");
    Ok(())
}

/// Write configured startup frequencies to devices that answer a quick
/// probe. Offline devices are skipped; they pick their setpoint up through
/// normal control once they recover.
async fn apply_startup_frequencies(
    devices: &Arc<DeviceManager>,
    health: &Arc<HealthManager>,
    constraints: &ConstraintConfig,
) {
    for device in devices.device_list() {
        let Some(model_constraints) = constraints.get(&device.model) else { continue };
        let Some(instance) = model_constraints.instances.get(&device.slave_id.to_string()) else {
            continue;
        };
        let Some(frequency) = instance.startup_frequency else { continue };

        let device_id = device.device_id();
        let probe = health.quick_health_check(device, &device_id).await;
        if !probe.is_online {
            warn!(device = %device_id, "startup frequency skipped, device offline");
            continue;
        }
        match device.write_value("RW_HZ", frequency).await {
            Ok(()) => info!(device = %device_id, frequency, "startup frequency applied"),
            Err(e) => warn!(device = %device_id, "startup frequency write failed: {e}"),
        }
    }
}
