//! Building blocks for the cluster add-ons that are installed through the API.

use crate::api::{ApiObject, ClusterApi, SYSTEM_NAMESPACE};
use crate::topology::Architecture;
use k8s_openapi::api::core::v1::{
    ConfigMapVolumeSource, HostPathVolumeSource, KeyToPath, ServiceAccount, Volume, VolumeMount,
};
use k8s_openapi::api::rbac::v1::{ClusterRoleBinding, PolicyRule, RoleRef, Subject};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use std::collections::BTreeMap;

/// Node label carrying the machine's architecture.
pub const ARCH_LABEL: &str = "beta.kubernetes.io/arch";

pub fn strings(values: &[&str]) -> Vec<String> {
    values.iter().map(|v| v.to_string()).collect()
}

pub fn string_map(entries: &[(&str, &str)]) -> BTreeMap<String, String> {
    entries
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

/// Metadata for `name`, in the system namespace if `namespaced`.
pub fn metadata(name: &str, namespaced: bool) -> ObjectMeta {
    ObjectMeta {
        name: Some(name.to_owned()),
        namespace: namespaced.then(|| SYSTEM_NAMESPACE.to_owned()),
        ..Default::default()
    }
}

/// A rule on core API `resources`.
pub fn rule(resources: &[&str], verbs: &[&str]) -> PolicyRule {
    PolicyRule {
        api_groups: Some(strings(&[""])),
        resources: Some(strings(resources)),
        verbs: strings(verbs),
        ..Default::default()
    }
}

pub fn service_account(name: &str) -> ApiObject {
    ApiObject::ServiceAccount(ServiceAccount {
        metadata: metadata(name, true),
        ..Default::default()
    })
}

/// Grants the cluster role `role` to the service account `account`.
pub fn binding(metadata: ObjectMeta, role: &str, account: &str) -> ClusterRoleBinding {
    ClusterRoleBinding {
        metadata,
        role_ref: RoleRef {
            api_group: "rbac.authorization.k8s.io".to_owned(),
            kind: "ClusterRole".to_owned(),
            name: role.to_owned(),
        },
        subjects: Some(vec![Subject {
            kind: "ServiceAccount".to_owned(),
            name: account.to_owned(),
            namespace: Some(SYSTEM_NAMESPACE.to_owned()),
            ..Default::default()
        }]),
    }
}

/// Restricts pods to machines of `architecture`.
pub fn arch_selector(architecture: Architecture) -> BTreeMap<String, String> {
    BTreeMap::from([(ARCH_LABEL.to_owned(), architecture.to_string())])
}

pub fn host_path_volume(name: &str, path: &str, kind: Option<&str>) -> Volume {
    Volume {
        name: name.to_owned(),
        host_path: Some(HostPathVolumeSource {
            path: path.to_owned(),
            type_: kind.map(str::to_owned),
        }),
        ..Default::default()
    }
}

/// Mounts the config map `config_map` as volume `name`, limited to `keys` if any are given.
pub fn config_map_volume(name: &str, config_map: &str, keys: &[&str]) -> Volume {
    let items = (!keys.is_empty()).then(|| {
        keys.iter()
            .map(|key| KeyToPath {
                key: key.to_string(),
                path: key.to_string(),
                ..Default::default()
            })
            .collect()
    });
    Volume {
        name: name.to_owned(),
        config_map: Some(ConfigMapVolumeSource {
            name: config_map.to_owned(),
            items,
            ..Default::default()
        }),
        ..Default::default()
    }
}

pub fn mount(name: &str, path: &str) -> VolumeMount {
    VolumeMount {
        name: name.to_owned(),
        mount_path: path.to_owned(),
        ..Default::default()
    }
}

/// Creates or updates `objects` in order, stopping at the first failure.
pub async fn apply(api: &dyn ClusterApi, objects: Vec<ApiObject>) -> anyhow::Result<()> {
    for object in objects {
        api.create_or_update(object).await?;
    }
    Ok(())
}
