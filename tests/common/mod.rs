// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Shared setup for the integration tests: a controller wired to the
//! simulated hypervisor, plus helpers for populating resources, ranges, and
//! templates.

#![allow(dead_code)]

use dropshot::test_util::LogContext;
use dropshot::ConfigLogging;
use dropshot::ConfigLoggingLevel;
use slog::o;
use std::io::Write;
use std::sync::Arc;
use vmnet_server::controller::Controller;
use vmnet_server::datastore::DataStore;
use vmnet_server::hypervisor::sim::SimHypervisor;
use vmnet_server::hypervisor::Hypervisor;
use vmnet_server::model::RangeCreateParams;
use vmnet_server::model::TemplateCreateParams;
use vmnet_server::model::TemplateView;

pub const RESOURCE: &str = "routing-lab";
pub const RANGE: &str = "default";

pub struct ControlPlaneTestContext {
    pub logctx: LogContext,
    pub sim: Arc<SimHypervisor>,
    pub controller: Arc<Controller>,
}

impl ControlPlaneTestContext {
    pub fn cleanup_successful(self) {
        self.logctx.cleanup_successful();
    }
}

pub fn test_setup(test_name: &str) -> ControlPlaneTestContext {
    let logctx = LogContext::new(
        test_name,
        &ConfigLogging::StderrTerminal { level: ConfigLoggingLevel::Warn },
    );
    let sim = Arc::new(SimHypervisor::new(
        logctx.log.new(o!("component" => "SimHypervisor")),
    ));
    let datastore = Arc::new(DataStore::new());
    let controller = Arc::new(Controller::new(
        logctx.log.new(o!("component" => "Controller")),
        datastore,
        Arc::clone(&sim) as Arc<dyn Hypervisor>,
        String::from(RANGE),
        chrono::Duration::minutes(30),
    ));
    ControlPlaneTestContext { logctx, sim, controller }
}

/// Creates the "routing-lab" resource, the default range (`10.0.0.0/24`
/// split into `/30`s), and two templates in order.
pub async fn populate(ctx: &ControlPlaneTestContext) {
    ctx.controller.resource_create(RESOURCE).await.unwrap();
    create_range(ctx, "10.0.0.0/24", 30).await;
    register_template(ctx, RESOURCE, "gateway", 512, 1, b"gateway image")
        .await;
    register_template(ctx, RESOURCE, "target", 1024, 2, b"target image")
        .await;
}

pub async fn create_range(
    ctx: &ControlPlaneTestContext,
    network: &str,
    subnet_prefix: u8,
) {
    ctx.controller
        .range_create(&RangeCreateParams {
            name: String::from(RANGE),
            network: String::from(network),
            subnet_prefix,
        })
        .await
        .unwrap();
}

/// Registers a template from an image written to a temporary file.
pub async fn register_template(
    ctx: &ControlPlaneTestContext,
    resource: &str,
    name: &str,
    memory_mib: u32,
    order_id: u32,
    content: &[u8],
) -> TemplateView {
    let mut image = tempfile::NamedTempFile::new().unwrap();
    image.write_all(content).unwrap();
    image.flush().unwrap();
    let path = camino::Utf8PathBuf::from_path_buf(
        image.path().to_path_buf(),
    )
    .unwrap();
    ctx.controller
        .template_register(&TemplateCreateParams {
            resource: String::from(resource),
            name: String::from(name),
            memory_mib,
            order_id,
            image_file: path,
        })
        .await
        .unwrap()
}

/// Returns the subnet id currently bound to the allocation.
pub async fn allocation_subnet_id(
    ctx: &ControlPlaneTestContext,
    resource: &str,
    user: &str,
) -> u32 {
    ctx.controller
        .datastore()
        .allocation_lookup(&vmnet_server::model::AllocationKey::new(
            resource, user,
        ))
        .await
        .expect("allocation exists")
        .subnet_id
        .expect("allocation has a subnet")
}
