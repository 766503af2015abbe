// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Control plane for short-lived, per-user pools of networked VMs
//!
//! This crate provides a standalone server for an ephemeral-lab service: a
//! user asks for a resource bundle (a named set of VM templates), gets back
//! a set of VMs wired into an isolated network that only the user's current
//! VPN address may reach, keeps them alive with periodic pings, and the
//! system reclaims everything once the allocation expires.
//!
//! The main pieces:
//!
//! 1. [`controller::Controller`]: the lifecycle state machine (start, ping,
//!    stop/destroy, status), including subnet claiming, network
//!    materialization, VM provisioning, and access-control binding.
//! 2. [`datastore::DataStore`]: the source of truth for allocation
//!    bookkeeping, with the per-record exclusive lock the controller's
//!    concurrency discipline depends on.
//! 3. [`hypervisor::Hypervisor`]: the opaque capability used to realize
//!    networks, filters, volumes, and domains; all objects are addressed by
//!    names derived from record identities.
//! 4. [`reaper::ExpirationReaper`]: periodic sweep destroying allocations
//!    whose expiration has passed.
//! 5. A Dropshot server exposing the lifecycle operations, the VPN
//!    IP-binding notifications, and administrative setup.

pub mod addresses;
pub mod config;
pub mod controller;
pub mod datastore;
pub mod error;
pub mod http_entrypoints;
pub mod hypervisor;
pub mod model;
pub mod network;
pub mod provision;
pub mod reaper;

use anyhow::anyhow;
use anyhow::Context;
use config::Config;
use controller::Controller;
use datastore::DataStore;
use http_entrypoints::ServerContext;
use hypervisor::Hypervisor;
use reaper::ExpirationReaper;
use slog::o;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

/// A running vmnet server: the dropshot server plus its reaper task.
pub struct Server {
    pub controller: Arc<Controller>,
    pub http_server: dropshot::HttpServer<Arc<ServerContext>>,
    pub reaper_task: JoinHandle<()>,
}

/// Starts the HTTP server and the expiration reaper over the given
/// hypervisor capability.
pub async fn start_server(
    config: &Config,
    hypervisor: Arc<dyn Hypervisor>,
    log: &slog::Logger,
) -> Result<Server, anyhow::Error> {
    let datastore = Arc::new(DataStore::new());
    let controller = Arc::new(Controller::new(
        log.new(o!("component" => "Controller")),
        datastore,
        hypervisor,
        config.vmnet.range_name.clone(),
        chrono::Duration::seconds(
            i64::try_from(config.vmnet.allocation_ttl_secs)
                .context("allocation_ttl_secs out of range")?,
        ),
    ));

    let reaper = ExpirationReaper::new(
        log.new(o!("component" => "ExpirationReaper")),
        Arc::clone(&controller),
        Duration::from_secs(config.vmnet.reaper_period_secs),
    );
    let reaper_task = reaper.start();

    let context =
        Arc::new(ServerContext { controller: Arc::clone(&controller) });
    let http_server = dropshot::ServerBuilder::new(
        http_entrypoints::api(),
        context,
        log.new(o!("component" => "http")),
    )
    .config(config.dropshot.clone())
    .start()
    .map_err(|error| anyhow!("setting up HTTP server: {:#}", error))?;

    Ok(Server { controller, http_server, reaper_task })
}

/// A vmnet server on localhost, backed by the simulated hypervisor.
///
/// Intended for the test suite and local development.
pub struct TransientServer {
    pub sim: Arc<hypervisor::sim::SimHypervisor>,
    pub server: Server,
}

impl TransientServer {
    pub async fn new(log: &slog::Logger) -> Result<Self, anyhow::Error> {
        let sim = Arc::new(hypervisor::sim::SimHypervisor::new(
            log.new(o!("component" => "SimHypervisor")),
        ));
        let config = Config {
            dropshot: dropshot::ConfigDropshot {
                bind_address: "127.0.0.1:0".parse().unwrap(),
                ..Default::default()
            },
            log: dropshot::ConfigLogging::StderrTerminal {
                level: dropshot::ConfigLoggingLevel::Warn,
            },
            vmnet: config::VmnetConfig::default(),
        };
        let server = start_server(
            &config,
            Arc::clone(&sim) as Arc<dyn Hypervisor>,
            log,
        )
        .await
        .context("starting transient server")?;
        Ok(TransientServer { sim, server })
    }

    pub fn local_addr(&self) -> std::net::SocketAddr {
        self.server.http_server.local_addr()
    }
}
