// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Test harness for end-to-end pipeline tests.
//!
//! Builds a full in-process gateway rig — fake serial links, real monitor,
//! pub/sub, evaluators, and sender with a scripted cloud transport — so the
//! cross-subsystem flows run exactly as they do in production, minus the
//! copper.

use std::sync::Arc;

use fieldgate::bus::shared_port;
use fieldgate::device::{ConstraintPolicy, Device};
use fieldgate::event::Event;
use fieldgate::health::{HealthConfig, HealthManager};
use fieldgate::manager::DeviceManager;
use fieldgate::monitor::{Monitor, MonitorConfig};
use fieldgate::pubsub::PubSub;
use fieldgate::registers::{RegisterMap, RegisterSpec, RegisterType, WordFormat};
use fieldgate::test_support::{FakeLink, FakeLinkState, MockTransport};
use fieldgate::virtual_device::{VirtualDeviceManager, VirtualDevicesConfig};

/// A readable holding pin at the given offset.
pub fn pin(offset: u16) -> RegisterSpec {
    RegisterSpec {
        offset,
        register_type: None,
        format: WordFormat::U16,
        bit: None,
        readable: true,
        writable: false,
        scale: 1.0,
        formula: None,
        precision: None,
        scale_from: None,
        composed_of: None,
    }
}

/// A writable holding pin at the given offset.
pub fn writable_pin(offset: u16) -> RegisterSpec {
    let mut spec = pin(offset);
    spec.writable = true;
    spec
}

/// One fake device definition for the rig.
pub struct DeviceDef {
    pub model: String,
    pub slave_id: u8,
    pub device_type: String,
    pub pins: Vec<(String, RegisterSpec)>,
}

impl DeviceDef {
    pub fn new(model: &str, slave_id: u8, device_type: &str) -> Self {
        Self {
            model: model.to_owned(),
            slave_id,
            device_type: device_type.to_owned(),
            pins: Vec::new(),
        }
    }

    pub fn with_pin(mut self, name: &str, spec: RegisterSpec) -> Self {
        self.pins.push((name.to_owned(), spec));
        self
    }
}

/// A fully wired in-process gateway.
pub struct Rig {
    pub devices: Arc<DeviceManager>,
    pub health: Arc<HealthManager>,
    pub pubsub: Arc<PubSub<Event>>,
    pub monitor: Arc<Monitor>,
    /// One fake-link state per device, in definition order.
    pub links: Vec<Arc<FakeLinkState>>,
    pub transport: Arc<MockTransport>,
}

pub struct RigBuilder {
    defs: Vec<DeviceDef>,
    virtual_config: Option<VirtualDevicesConfig>,
    monitor_config: MonitorConfig,
    shared_port: bool,
}

impl Default for RigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl RigBuilder {
    pub fn new() -> Self {
        Self {
            defs: Vec::new(),
            virtual_config: None,
            monitor_config: MonitorConfig {
                interval_seconds: 1.0,
                device_timeout_sec: 2.0,
                read_concurrency: 4,
                log_each_device: false,
            },
            shared_port: false,
        }
    }

    pub fn device(mut self, def: DeviceDef) -> Self {
        self.defs.push(def);
        self
    }

    /// Put every device on one shared port mutex, as on a real RS-485 bus.
    pub fn single_port(mut self) -> Self {
        self.shared_port = true;
        self
    }

    pub fn virtual_devices(mut self, json: &str) -> Self {
        self.virtual_config = Some(serde_json::from_str(json).expect("virtual device config"));
        self
    }

    pub fn build(self) -> Rig {
        let mut devices = Vec::new();
        let mut links = Vec::new();

        let common_port = if self.shared_port {
            let (link, state) = FakeLink::new();
            links.push(state);
            Some(shared_port(Box::new(link)))
        } else {
            None
        };

        for def in &self.defs {
            let port = match &common_port {
                Some(port) => Arc::clone(port),
                None => {
                    let (link, state) = FakeLink::new();
                    links.push(state);
                    shared_port(Box::new(link))
                }
            };
            let mut map = RegisterMap::default();
            for (name, spec) in &def.pins {
                map.pins.insert(name.clone(), spec.clone());
            }
            devices.push(Arc::new(Device::new(
                &def.model,
                def.slave_id,
                &def.device_type,
                RegisterType::Holding,
                map,
                "rig-port",
                port,
                ConstraintPolicy::default(),
                None,
            )));
        }

        let manager = Arc::new(DeviceManager::from_devices(devices));
        let health = Arc::new(HealthManager::new(HealthConfig {
            base_cooldown_sec: 10.0,
            max_cooldown_sec: 60.0,
            backoff_factor: 2.0,
            jitter_sec: 0.0,
            mark_unhealthy_after_failures: 1,
            long_term_offline_threshold_sec: 3600.0,
            max_failures_cap: 5,
        }));
        let pubsub: Arc<PubSub<Event>> = Arc::new(PubSub::new());
        let virtual_devices = self
            .virtual_config
            .map(|config| Arc::new(VirtualDeviceManager::new(config, manager.max_slave_id())));

        let monitor = Arc::new(Monitor::new(
            Arc::clone(&manager),
            Arc::clone(&health),
            Arc::clone(&pubsub),
            virtual_devices,
            self.monitor_config,
        ));

        Rig {
            devices: manager,
            health,
            pubsub,
            monitor,
            links,
            transport: MockTransport::new(),
        }
    }
}
