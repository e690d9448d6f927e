//! Validation of user-supplied names and spec changes

use crate::controller::error::{Error, Result};
use crate::crd::{FleetWorkspaceSpec, LifecycleState};

/// Names end up in DNS labels and provisioning workspace names
pub const MAX_NAME_LEN: usize = 32;

pub const NAME_INVALID_MESSAGE: &str = "name must consist of lower case alphanumeric characters or '-', \
     start with an alphabetical character and end with an alphanumeric character";

/// Whether `name` is a valid workspace or cluster name
pub fn is_valid_name(name: &str) -> bool {
    let bytes = name.as_bytes();
    let (Some(first), Some(last)) = (bytes.first(), bytes.last()) else {
        return false;
    };
    name.len() <= MAX_NAME_LEN
        && first.is_ascii_lowercase()
        && (last.is_ascii_lowercase() || last.is_ascii_digit())
        && bytes
            .iter()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || *b == b'-')
}

pub fn validate_name(kind: &str, name: &str) -> Result<()> {
    if is_valid_name(name) {
        Ok(())
    } else if name.len() > MAX_NAME_LEN {
        Err(Error::ValidationError(format!(
            "invalid {kind} name {name}: longer than {MAX_NAME_LEN} characters"
        )))
    } else {
        Err(Error::ValidationError(format!(
            "invalid {kind} name {name}: {NAME_INVALID_MESSAGE}"
        )))
    }
}

/// Apply the updatable fields of `requested` to `current`.
///
/// Only the image tag, API token, web flag, git ref and cluster may change. An
/// empty cluster name keeps the current cluster; an empty image tag resets to
/// the default.
pub fn merge_workspace_update(
    current: &FleetWorkspaceSpec,
    requested: &FleetWorkspaceSpec,
) -> FleetWorkspaceSpec {
    let mut merged = current.clone();
    if !requested.cluster_name.is_empty() {
        merged.cluster_name = requested.cluster_name.clone();
    }
    merged.image_tag = requested.image_tag.clone();
    merged.api_token = requested.api_token.clone();
    merged.enable_web = requested.enable_web;
    merged.git_ref = requested.git_ref.clone();
    if merged.image_tag.is_empty() {
        merged.image_tag = crate::crd::DEFAULT_IMAGE_TAG.to_string();
    }
    merged
}

/// Updates are refused only while a resource is being torn down
pub fn validate_update_state(kind: &str, name: &str, state: LifecycleState) -> Result<()> {
    if state == LifecycleState::Deleting {
        return Err(Error::StateError(format!(
            "{kind} {name} is being deleted"
        )));
    }
    if state != LifecycleState::Ready {
        tracing::warn!(kind, name, %state, "Updating a resource that is not ready");
    }
    Ok(())
}
