// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Error handling facilities for the VM network control plane
//!
//! Errors here are transport-agnostic.  They get converted into a
//! [`dropshot::HttpError`] as one of the last steps of handling a request, so
//! the allocation and provisioning code doesn't need to know anything about
//! status codes.

use crate::hypervisor::HypervisorError;
use dropshot::HttpError;

/// An error that can be generated within the control plane
///
/// The taxonomy is deliberately small: callers only ever need to distinguish
/// "the thing you named doesn't exist", "the operation doesn't make sense in
/// the current state", "we're out of capacity", "the deployment is
/// misconfigured", and "the hypervisor failed".
#[derive(Clone, Debug, thiserror::Error, PartialEq)]
pub enum Error {
    /// An object needed as part of this operation was not found.
    #[error("not found: {type_name} \"{name}\"")]
    ObjectNotFound { type_name: ResourceType, name: String },

    /// An object already exists with the specified name.
    #[error("already exists: {type_name} \"{name}\"")]
    ObjectAlreadyExists { type_name: ResourceType, name: String },

    /// The caller asked to ping or tear down an allocation that isn't running.
    #[error("no such allocation is running: {message}")]
    NotRunning { message: String },

    /// The request was well-formed, but the operation cannot be completed
    /// given the current state of the system.
    #[error("invalid request: {message}")]
    InvalidRequest { message: String },

    /// The specified input field is not valid.
    #[error("invalid value for {label}: {message}")]
    InvalidValue { label: String, message: String },

    /// No free subnet remains in the address pool.  This is terminal: the
    /// caller must not retry inline.
    #[error("capacity exhausted: {message}")]
    CapacityExhausted { message: String },

    /// The deployment's address plan can't support this operation (e.g. a
    /// subnet too large for MAC derivation).  Detected before any hypervisor
    /// call is made.
    #[error("configuration error: {message}")]
    Configuration { message: String },

    /// An unexpected failure from the hypervisor capability.
    #[error("hypervisor fault: {message}")]
    Hypervisor { message: String },

    /// The system encountered an unhandled operational error.
    #[error("internal error: {internal_message}")]
    InternalError { internal_message: String },
}

/// Identifies a kind of control plane object (for error messages)
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum ResourceType {
    Resource,
    AddressRange,
    Subnet,
    VmTemplate,
    Allocation,
    VmInstance,
    AssignedIp,
}

impl std::fmt::Display for ResourceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            ResourceType::Resource => "resource",
            ResourceType::AddressRange => "address range",
            ResourceType::Subnet => "subnet",
            ResourceType::VmTemplate => "VM template",
            ResourceType::Allocation => "allocation",
            ResourceType::VmInstance => "VM instance",
            ResourceType::AssignedIp => "assigned IP",
        })
    }
}

impl Error {
    pub fn not_found(type_name: ResourceType, name: &str) -> Error {
        Error::ObjectNotFound { type_name, name: name.to_owned() }
    }

    pub fn internal_error(message: &str) -> Error {
        Error::InternalError { internal_message: message.to_owned() }
    }
}

impl From<HypervisorError> for Error {
    fn from(error: HypervisorError) -> Self {
        Error::Hypervisor { message: format!("{:#}", error) }
    }
}

impl From<Error> for HttpError {
    fn from(error: Error) -> Self {
        match error {
            Error::ObjectNotFound { .. } | Error::NotRunning { .. } => {
                // for_not_found() would discard the message from the
                // response body.
                HttpError::for_client_error(
                    None,
                    dropshot::ClientErrorStatusCode::NOT_FOUND,
                    format!("{}", error),
                )
            }
            Error::ObjectAlreadyExists { .. }
            | Error::InvalidRequest { .. }
            | Error::InvalidValue { .. }
            | Error::Configuration { .. } => {
                HttpError::for_bad_request(None, format!("{}", error))
            }
            Error::CapacityExhausted { .. } => {
                HttpError::for_unavail(None, format!("{}", error))
            }
            Error::Hypervisor { .. } | Error::InternalError { .. } => {
                HttpError::for_internal_error(format!("{}", error))
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    /// The external message must survive the conversion for 404s: clients
    /// are told what wasn't found, not just "Not Found".
    #[test]
    fn test_not_found_keeps_message() {
        let error = Error::not_found(ResourceType::Resource, "routing-lab");
        let http_error = HttpError::from(error);
        assert_eq!(http_error.status_code.as_u16(), 404);
        assert_eq!(
            http_error.external_message,
            "not found: resource \"routing-lab\""
        );

        let error = Error::NotRunning {
            message: String::from("no allocation of routing-lab for alice"),
        };
        let http_error = HttpError::from(error);
        assert_eq!(http_error.status_code.as_u16(), 404);
        assert_eq!(
            http_error.external_message,
            "no such allocation is running: no allocation of routing-lab \
             for alice"
        );
    }

    #[test]
    fn test_client_and_server_errors() {
        let error = Error::ObjectAlreadyExists {
            type_name: ResourceType::AddressRange,
            name: String::from("default"),
        };
        assert_eq!(HttpError::from(error).status_code.as_u16(), 400);

        let error = Error::CapacityExhausted {
            message: String::from("no free subnet"),
        };
        assert_eq!(HttpError::from(error).status_code.as_u16(), 503);

        let error = Error::internal_error("broken");
        assert_eq!(HttpError::from(error).status_code.as_u16(), 500);
    }
}
