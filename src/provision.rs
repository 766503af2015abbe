// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Creating and destroying individual VM instances
//!
//! Each VM owns one hypervisor domain and one writable copy-on-write volume
//! layered over its template's immutable base volume.  Template registration
//! is content-addressed: the image is streamed once to fingerprint it, and a
//! base volume that already exists under the fingerprint-derived name is
//! reused rather than re-uploaded.

use crate::datastore::DataStore;
use crate::error::Error;
use crate::hypervisor::names;
use crate::hypervisor::DomainConfig;
use crate::hypervisor::Hypervisor;
use crate::hypervisor::VolumeConfig;
use crate::model::Resource;
use crate::model::VmTemplate;
use camino::Utf8Path;
use macaddr::MacAddr6;
use sha2::Digest;
use sha2::Sha256;
use slog::info;
use slog::Logger;
use std::sync::Arc;
use tokio::io::AsyncReadExt;

/// Fixed chunk size for streaming image content to the hypervisor.
const UPLOAD_CHUNK_SIZE: usize = 8192;

pub struct VmProvisioner {
    log: Logger,
    hypervisor: Arc<dyn Hypervisor>,
}

impl VmProvisioner {
    pub fn new(log: Logger, hypervisor: Arc<dyn Hypervisor>) -> Self {
        VmProvisioner { log, hypervisor }
    }

    /// Creates the hypervisor objects for one VM: a copy-on-write volume
    /// backed by the template's base volume, and a domain attached to the
    /// allocation's network with the slot's derived MAC.
    ///
    /// The caller is responsible for calling this at most once per
    /// `(allocation, template)` pair.
    pub async fn vm_create(
        &self,
        vm_id: u32,
        template: &VmTemplate,
        network_name: &str,
        filter_name: &str,
        mac: MacAddr6,
    ) -> Result<(), Error> {
        let backing_name = names::backing_volume_name(&template.fingerprint);
        let backing =
            self.hypervisor.volume_lookup(&backing_name).await?.ok_or_else(
                || Error::InternalError {
                    internal_message: format!(
                        "base volume \"{}\" for template \"{}\" is missing",
                        backing_name, template.name
                    ),
                },
            )?;

        let volume_name = names::volume_name(vm_id);
        self.hypervisor
            .volume_create(&VolumeConfig {
                name: volume_name.clone(),
                capacity: backing.capacity,
                backing_volume: Some(backing_name),
            })
            .await?;

        let domain_name = names::domain_name(vm_id);
        self.hypervisor
            .domain_define(&DomainConfig {
                name: domain_name.clone(),
                memory_mib: template.memory_mib,
                volume: volume_name,
                network: network_name.to_owned(),
                mac,
                filter: filter_name.to_owned(),
                autostart: true,
            })
            .await?;
        self.hypervisor.domain_start(&domain_name).await?;

        info!(self.log, "created VM";
            "domain" => &domain_name,
            "template" => &template.name,
            "mac" => %mac);
        Ok(())
    }

    /// Destroys a VM's hypervisor objects, in order: stop the domain,
    /// undefine it, delete its writable volume.
    ///
    /// Repeatable after partial prior failures: every "already stopped" or
    /// "already gone" response counts as success, and only unexpected faults
    /// propagate.
    pub async fn vm_destroy(&self, vm_id: u32) -> Result<(), Error> {
        let domain_name = names::domain_name(vm_id);
        if let Err(error) = self.hypervisor.domain_destroy(&domain_name).await
        {
            if !error.is_already_gone() {
                return Err(error.into());
            }
        }
        if let Err(error) = self.hypervisor.domain_undefine(&domain_name).await
        {
            if !error.is_already_gone() {
                return Err(error.into());
            }
        }

        let volume_name = names::volume_name(vm_id);
        if let Err(error) = self.hypervisor.volume_delete(&volume_name).await {
            if !error.is_already_gone() {
                return Err(error.into());
            }
        }

        info!(self.log, "destroyed VM"; "domain" => &domain_name);
        Ok(())
    }

    /// Registers a VM template from an image file.
    ///
    /// The file is streamed once to compute its SHA-256 fingerprint while
    /// counting bytes.  If a base volume already exists under the
    /// fingerprint-derived name, the template reuses it; otherwise a volume
    /// sized to the exact byte count is created and the content uploaded in
    /// fixed-size chunks.
    pub async fn template_register(
        &self,
        datastore: &DataStore,
        resource: &Resource,
        name: &str,
        memory_mib: u32,
        order_id: u32,
        image_file: &Utf8Path,
    ) -> Result<VmTemplate, Error> {
        let (fingerprint, file_size) = fingerprint_file(image_file).await?;
        let volume_name = names::backing_volume_name(&fingerprint);

        // Explicit existence check: "volume already exists" is the dedup
        // path, not an error to be ignored.
        if self.hypervisor.volume_lookup(&volume_name).await?.is_none() {
            self.hypervisor
                .volume_create(&VolumeConfig {
                    name: volume_name.clone(),
                    capacity: file_size,
                    backing_volume: None,
                })
                .await?;
            upload_file(&*self.hypervisor, &volume_name, image_file).await?;
            info!(self.log, "uploaded base image";
                "volume" => &volume_name,
                "bytes" => file_size);
        } else {
            info!(self.log, "base image already present, reusing";
                "volume" => &volume_name);
        }

        let template = datastore
            .template_create(
                resource.id,
                name,
                memory_mib,
                &fingerprint,
                order_id,
            )
            .await?;
        info!(self.log, "registered template";
            "template" => name,
            "resource" => &resource.name,
            "fingerprint" => &fingerprint);
        Ok(template)
    }
}

/// Streams a file once, returning its SHA-256 fingerprint and byte count.
async fn fingerprint_file(path: &Utf8Path) -> Result<(String, u64), Error> {
    let mut file = open_image(path).await?;
    let mut hasher = Sha256::new();
    let mut file_size = 0u64;
    let mut buf = vec![0u8; UPLOAD_CHUNK_SIZE];
    loop {
        let n = file.read(&mut buf).await.map_err(|e| Error::InternalError {
            internal_message: format!("reading image {:?}: {}", path, e),
        })?;
        if n == 0 {
            break;
        }
        file_size += n as u64;
        hasher.update(&buf[..n]);
    }
    Ok((hex::encode(hasher.finalize()), file_size))
}

/// Re-reads the file and uploads its content in fixed-size chunks.
async fn upload_file(
    hypervisor: &dyn Hypervisor,
    volume_name: &str,
    path: &Utf8Path,
) -> Result<(), Error> {
    let mut file = open_image(path).await?;
    let mut buf = vec![0u8; UPLOAD_CHUNK_SIZE];
    loop {
        let n = file.read(&mut buf).await.map_err(|e| Error::InternalError {
            internal_message: format!("reading image {:?}: {}", path, e),
        })?;
        if n == 0 {
            return Ok(());
        }
        hypervisor.volume_append(volume_name, &buf[..n]).await?;
    }
}

async fn open_image(path: &Utf8Path) -> Result<tokio::fs::File, Error> {
    tokio::fs::File::open(path).await.map_err(|e| Error::InvalidValue {
        label: String::from("image_file"),
        message: format!("cannot open {:?}: {}", path, e),
    })
}
