//! `xms_mirid` resource-path codec
//!
//! The managed-identity resource path carried in the `xms_mirid` claim has
//! the shape
//!
//! ```text
//! /subscriptions/<id>/resourceGroups/<group>/providers/<provider>/<type>/<name>
//! ```
//!
//! Splitting on `/` yields exactly nine segments, with the fixed labels
//! `subscriptions`, `resourceGroups` and `providers` at positions 1, 3
//! and 5. The final three segments identify the resource itself; for the
//! tokens this provisioner accepts that is a virtual machine
//! (`Microsoft.Compute/virtualMachines/<name>`).

use std::fmt;
use std::str::FromStr;

use thiserror::Error;

const LABEL_SUBSCRIPTIONS: &str = "subscriptions";
const LABEL_RESOURCE_GROUPS: &str = "resourceGroups";
const LABEL_PROVIDERS: &str = "providers";

/// Error returned when an `xms_mirid` value does not have the expected shape.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("malformed managed identity resource path {path:?}")]
pub struct ParseError {
    path: String,
}

impl ParseError {
    /// The raw value that failed to parse.
    pub fn path(&self) -> &str {
        &self.path
    }
}

/// Decoded managed-identity resource path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VmResourceId {
    /// Subscription GUID.
    pub subscription_id: String,
    /// Resource group holding the VM.
    pub resource_group: String,
    /// Resource provider namespace, e.g. `Microsoft.Compute`.
    pub provider: String,
    /// Resource type under the provider, e.g. `virtualMachines`.
    pub resource_type: String,
    /// The resource (VM) name.
    pub resource_name: String,
}

impl VmResourceId {
    /// Build the resource path of a virtual machine under the standard
    /// compute provider.
    pub fn virtual_machine(
        subscription_id: impl Into<String>,
        resource_group: impl Into<String>,
        vm_name: impl Into<String>,
    ) -> Self {
        Self {
            subscription_id: subscription_id.into(),
            resource_group: resource_group.into(),
            provider: "Microsoft.Compute".to_string(),
            resource_type: "virtualMachines".to_string(),
            resource_name: vm_name.into(),
        }
    }
}

impl FromStr for VmResourceId {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let malformed = || ParseError {
            path: s.to_string(),
        };

        let parts: Vec<&str> = s.split('/').collect();
        if parts.len() != 9
            || !parts[0].is_empty()
            || parts[1] != LABEL_SUBSCRIPTIONS
            || parts[3] != LABEL_RESOURCE_GROUPS
            || parts[5] != LABEL_PROVIDERS
        {
            return Err(malformed());
        }
        if parts[2].is_empty() || parts[4].is_empty() || parts[8].is_empty() {
            return Err(malformed());
        }

        Ok(Self {
            subscription_id: parts[2].to_string(),
            resource_group: parts[4].to_string(),
            provider: parts[6].to_string(),
            resource_type: parts[7].to_string(),
            resource_name: parts[8].to_string(),
        })
    }
}

impl fmt::Display for VmResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "/{}/{}/{}/{}/{}/{}/{}/{}",
            LABEL_SUBSCRIPTIONS,
            self.subscription_id,
            LABEL_RESOURCE_GROUPS,
            self.resource_group,
            LABEL_PROVIDERS,
            self.provider,
            self.resource_type,
            self.resource_name
        )
    }
}
