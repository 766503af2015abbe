// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Executable that runs the VM network control plane
//!
//! The hypervisor capability is pluggable; this binary wires in the
//! in-memory simulator, which is suitable for development and testing.  A
//! production deployment links a real hypervisor client behind
//! [`vmnet_server::hypervisor::Hypervisor`] instead.

use anyhow::Context;
use camino::Utf8PathBuf;
use clap::Parser;
use slog::info;
use slog::o;
use std::sync::Arc;
use vmnet_server::config::Config;
use vmnet_server::hypervisor::sim::SimHypervisor;
use vmnet_server::hypervisor::Hypervisor;

#[derive(Parser, Debug)]
#[clap(name = "vmnet-server", about = "VM network control plane")]
struct Args {
    #[clap(long, action)]
    config_file: Utf8PathBuf,
}

#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
    let args = Args::parse();
    let config = Config::from_file(&args.config_file)
        .with_context(|| format!("loading {:?}", args.config_file))?;

    let log = config
        .log
        .to_logger("vmnet-server")
        .context("failed to create logger")?;
    info!(log, "config"; "config" => ?config);

    let hypervisor: Arc<dyn Hypervisor> = Arc::new(SimHypervisor::new(
        log.new(o!("component" => "SimHypervisor")),
    ));

    let server = vmnet_server::start_server(&config, hypervisor, &log)
        .await
        .context("starting server")?;

    server
        .http_server
        .await
        .map_err(|error_message| anyhow::anyhow!(
            "server exiting: {}",
            error_message
        ))
}
