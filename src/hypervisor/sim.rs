// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Simulated in-memory hypervisor
//!
//! Implements the [`Hypervisor`] capability entirely in memory, tracking the
//! same object lifetimes a real hypervisor would (defined vs. running
//! domains, filter replacement by name, volume content sizes).  The test
//! suite uses the inspection methods to verify that record lifetimes and
//! hypervisor object lifetimes stay in sync, and the fault injection hook to
//! exercise partial-failure paths.

use super::DomainConfig;
use super::FilterConfig;
use super::Hypervisor;
use super::HypervisorError;
use super::NetworkConfig;
use super::ObjectKind;
use super::VolumeConfig;
use super::VolumeInfo;
use async_trait::async_trait;
use slog::debug;
use slog::Logger;
use std::collections::BTreeMap;
use std::net::Ipv4Addr;
use std::sync::Mutex;

#[derive(Clone, Debug)]
struct SimNetwork {
    config: NetworkConfig,
    active: bool,
}

#[derive(Clone, Debug)]
struct SimVolume {
    config: VolumeConfig,
    bytes_written: u64,
}

#[derive(Clone, Debug)]
struct SimDomain {
    config: DomainConfig,
    running: bool,
}

#[derive(Default)]
struct SimState {
    networks: BTreeMap<String, SimNetwork>,
    filters: BTreeMap<String, FilterConfig>,
    volumes: BTreeMap<String, SimVolume>,
    domains: BTreeMap<String, SimDomain>,
    /// when set, the next domain_define fails with a fault
    fail_next_domain_define: bool,
}

pub struct SimHypervisor {
    log: Logger,
    state: Mutex<SimState>,
}

impl SimHypervisor {
    pub fn new(log: Logger) -> SimHypervisor {
        SimHypervisor { log, state: Mutex::new(SimState::default()) }
    }

    /// Makes the next `domain_define` call fail with a hypervisor fault.
    pub fn inject_domain_define_fault(&self) {
        self.state.lock().unwrap().fail_next_domain_define = true;
    }

    /*
     * Inspection interfaces for the test suite
     */

    pub fn network_names(&self) -> Vec<String> {
        self.state.lock().unwrap().networks.keys().cloned().collect()
    }

    pub fn network_config(&self, name: &str) -> Option<NetworkConfig> {
        self.state
            .lock()
            .unwrap()
            .networks
            .get(name)
            .map(|n| n.config.clone())
    }

    pub fn filter_allowed_source(&self, name: &str) -> Option<Ipv4Addr> {
        self.state
            .lock()
            .unwrap()
            .filters
            .get(name)
            .and_then(|f| f.allowed_source)
    }

    pub fn filter_exists(&self, name: &str) -> bool {
        self.state.lock().unwrap().filters.contains_key(name)
    }

    pub fn volume_names(&self) -> Vec<String> {
        self.state.lock().unwrap().volumes.keys().cloned().collect()
    }

    pub fn volume_size(&self, name: &str) -> Option<u64> {
        self.state
            .lock()
            .unwrap()
            .volumes
            .get(name)
            .map(|v| v.bytes_written)
    }

    pub fn domain_names(&self) -> Vec<String> {
        self.state.lock().unwrap().domains.keys().cloned().collect()
    }

    pub fn domain_config(&self, name: &str) -> Option<DomainConfig> {
        self.state
            .lock()
            .unwrap()
            .domains
            .get(name)
            .map(|d| d.config.clone())
    }

    pub fn domain_is_running(&self, name: &str) -> bool {
        self.state
            .lock()
            .unwrap()
            .domains
            .get(name)
            .map(|d| d.running)
            .unwrap_or(false)
    }
}

fn not_found(kind: ObjectKind, name: &str) -> HypervisorError {
    HypervisorError::NotFound { kind, name: name.to_owned() }
}

#[async_trait]
impl Hypervisor for SimHypervisor {
    async fn network_lookup(
        &self,
        name: &str,
    ) -> Result<bool, HypervisorError> {
        Ok(self.state.lock().unwrap().networks.contains_key(name))
    }

    async fn network_define(
        &self,
        config: &NetworkConfig,
    ) -> Result<(), HypervisorError> {
        let mut state = self.state.lock().unwrap();
        if state.networks.contains_key(&config.name) {
            return Err(HypervisorError::AlreadyExists {
                kind: ObjectKind::Network,
                name: config.name.clone(),
            });
        }
        debug!(self.log, "sim: defined network"; "name" => &config.name);
        state.networks.insert(
            config.name.clone(),
            SimNetwork { config: config.clone(), active: true },
        );
        Ok(())
    }

    async fn network_destroy(
        &self,
        name: &str,
    ) -> Result<(), HypervisorError> {
        let mut state = self.state.lock().unwrap();
        let network = state
            .networks
            .get_mut(name)
            .ok_or_else(|| not_found(ObjectKind::Network, name))?;
        if !network.active {
            return Err(HypervisorError::NotRunning {
                kind: ObjectKind::Network,
                name: name.to_owned(),
            });
        }
        network.active = false;
        Ok(())
    }

    async fn network_undefine(
        &self,
        name: &str,
    ) -> Result<(), HypervisorError> {
        let mut state = self.state.lock().unwrap();
        state
            .networks
            .remove(name)
            .ok_or_else(|| not_found(ObjectKind::Network, name))?;
        debug!(self.log, "sim: undefined network"; "name" => name);
        Ok(())
    }

    async fn filter_define(
        &self,
        config: &FilterConfig,
    ) -> Result<(), HypervisorError> {
        // Same-named definitions replace each other.
        debug!(self.log, "sim: defined filter";
            "name" => &config.name,
            "allowed_source" => ?config.allowed_source);
        self.state
            .lock()
            .unwrap()
            .filters
            .insert(config.name.clone(), config.clone());
        Ok(())
    }

    async fn filter_undefine(
        &self,
        name: &str,
    ) -> Result<(), HypervisorError> {
        let mut state = self.state.lock().unwrap();
        state
            .filters
            .remove(name)
            .ok_or_else(|| not_found(ObjectKind::Filter, name))?;
        Ok(())
    }

    async fn volume_lookup(
        &self,
        name: &str,
    ) -> Result<Option<VolumeInfo>, HypervisorError> {
        Ok(self.state.lock().unwrap().volumes.get(name).map(|v| {
            VolumeInfo { name: name.to_owned(), capacity: v.config.capacity }
        }))
    }

    async fn volume_create(
        &self,
        config: &VolumeConfig,
    ) -> Result<(), HypervisorError> {
        let mut state = self.state.lock().unwrap();
        if state.volumes.contains_key(&config.name) {
            return Err(HypervisorError::AlreadyExists {
                kind: ObjectKind::Volume,
                name: config.name.clone(),
            });
        }
        if let Some(backing) = &config.backing_volume {
            if !state.volumes.contains_key(backing) {
                return Err(not_found(ObjectKind::Volume, backing));
            }
        }
        debug!(self.log, "sim: created volume";
            "name" => &config.name,
            "capacity" => config.capacity,
            "backing_volume" => ?config.backing_volume);
        state.volumes.insert(
            config.name.clone(),
            SimVolume { config: config.clone(), bytes_written: 0 },
        );
        Ok(())
    }

    async fn volume_append(
        &self,
        name: &str,
        chunk: &[u8],
    ) -> Result<(), HypervisorError> {
        let mut state = self.state.lock().unwrap();
        let volume = state
            .volumes
            .get_mut(name)
            .ok_or_else(|| not_found(ObjectKind::Volume, name))?;
        let new_size = volume.bytes_written + chunk.len() as u64;
        if new_size > volume.config.capacity {
            return Err(HypervisorError::Fault {
                message: format!(
                    "volume \"{}\": write of {} bytes exceeds capacity {}",
                    name,
                    chunk.len(),
                    volume.config.capacity
                ),
            });
        }
        volume.bytes_written = new_size;
        Ok(())
    }

    async fn volume_delete(
        &self,
        name: &str,
    ) -> Result<(), HypervisorError> {
        let mut state = self.state.lock().unwrap();
        state
            .volumes
            .remove(name)
            .ok_or_else(|| not_found(ObjectKind::Volume, name))?;
        debug!(self.log, "sim: deleted volume"; "name" => name);
        Ok(())
    }

    async fn domain_define(
        &self,
        config: &DomainConfig,
    ) -> Result<(), HypervisorError> {
        let mut state = self.state.lock().unwrap();
        if state.fail_next_domain_define {
            state.fail_next_domain_define = false;
            return Err(HypervisorError::Fault {
                message: String::from("injected fault: domain_define"),
            });
        }
        if state.domains.contains_key(&config.name) {
            return Err(HypervisorError::AlreadyExists {
                kind: ObjectKind::Domain,
                name: config.name.clone(),
            });
        }
        if !state.networks.contains_key(&config.network) {
            return Err(not_found(ObjectKind::Network, &config.network));
        }
        if !state.volumes.contains_key(&config.volume) {
            return Err(not_found(ObjectKind::Volume, &config.volume));
        }
        debug!(self.log, "sim: defined domain";
            "name" => &config.name,
            "network" => &config.network,
            "mac" => %config.mac);
        state.domains.insert(
            config.name.clone(),
            SimDomain { config: config.clone(), running: false },
        );
        Ok(())
    }

    async fn domain_start(&self, name: &str) -> Result<(), HypervisorError> {
        let mut state = self.state.lock().unwrap();
        let domain = state
            .domains
            .get_mut(name)
            .ok_or_else(|| not_found(ObjectKind::Domain, name))?;
        domain.running = true;
        Ok(())
    }

    async fn domain_destroy(
        &self,
        name: &str,
    ) -> Result<(), HypervisorError> {
        let mut state = self.state.lock().unwrap();
        let domain = state
            .domains
            .get_mut(name)
            .ok_or_else(|| not_found(ObjectKind::Domain, name))?;
        if !domain.running {
            return Err(HypervisorError::NotRunning {
                kind: ObjectKind::Domain,
                name: name.to_owned(),
            });
        }
        domain.running = false;
        Ok(())
    }

    async fn domain_undefine(
        &self,
        name: &str,
    ) -> Result<(), HypervisorError> {
        let mut state = self.state.lock().unwrap();
        state
            .domains
            .remove(name)
            .ok_or_else(|| not_found(ObjectKind::Domain, name))?;
        debug!(self.log, "sim: undefined domain"; "name" => name);
        Ok(())
    }
}
