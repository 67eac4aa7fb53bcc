// ABOUTME: Read-only lookups of VM classes, storage classes, network classes and VM templates
// ABOUTME: Only active entries are listed or matched

use serde::de::DeserializeOwned;

use crate::error::{ApiError, Result};
use crate::remote::models::{ListResponse, NetworkClass, StorageClass, VmClass, VmTemplate};
use crate::remote::{
    RemoteClient, NETWORK_CLASSES_EP, STORAGE_CLASSES_EP, VM_CLASSES_EP, VM_TEMPLATES_EP,
};

/// An entry of one of the catalog collections.
pub trait CatalogEntry: DeserializeOwned {
    const ENDPOINT: &'static str;
    const KIND: &'static str;
    /// Name of the field `lookup_key` reads, for error messages.
    const KEY_FIELD: &'static str = "name";

    fn lookup_key(&self) -> &str;
    fn is_active(&self) -> bool;
}

impl CatalogEntry for VmClass {
    const ENDPOINT: &'static str = VM_CLASSES_EP;
    const KIND: &'static str = "vm class";

    fn lookup_key(&self) -> &str {
        &self.name
    }
    fn is_active(&self) -> bool {
        self.is_active
    }
}

impl CatalogEntry for StorageClass {
    const ENDPOINT: &'static str = STORAGE_CLASSES_EP;
    const KIND: &'static str = "storage class";

    fn lookup_key(&self) -> &str {
        &self.name
    }
    fn is_active(&self) -> bool {
        self.is_active
    }
}

impl CatalogEntry for NetworkClass {
    const ENDPOINT: &'static str = NETWORK_CLASSES_EP;
    const KIND: &'static str = "network class";

    fn lookup_key(&self) -> &str {
        &self.name
    }
    fn is_active(&self) -> bool {
        self.is_active
    }
}

impl CatalogEntry for VmTemplate {
    const ENDPOINT: &'static str = VM_TEMPLATES_EP;
    const KIND: &'static str = "vm template";
    const KEY_FIELD: &'static str = "os_type";

    fn lookup_key(&self) -> &str {
        &self.os_type
    }
    fn is_active(&self) -> bool {
        self.is_active
    }
}

/// Every active entry of a catalog collection.
pub async fn list<T: CatalogEntry>(client: &RemoteClient) -> Result<Vec<T>> {
    let list: ListResponse<T> = client.get_json(T::ENDPOINT, &[], T::KIND).await?;
    Ok(active_only(list.items))
}

/// The active entry whose lookup key (name, or `os_type` for templates) equals `key`.
pub async fn find_active<T: CatalogEntry>(client: &RemoteClient, key: &str) -> Result<T> {
    select_active(list(client).await?, key)
}

fn active_only<T: CatalogEntry>(items: Vec<T>) -> Vec<T> {
    items.into_iter().filter(|item| item.is_active()).collect()
}

fn select_active<T: CatalogEntry>(items: Vec<T>, key: &str) -> Result<T> {
    items
        .into_iter()
        .find(|item| item.is_active() && item.lookup_key() == key)
        .ok_or_else(|| ApiError::CatalogMiss {
            kind: T::KIND,
            field: T::KEY_FIELD,
            value: key.to_string(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn class(id: i64, name: &str, active: bool) -> VmClass {
        VmClass {
            id,
            name: name.into(),
            is_active: active,
            ..Default::default()
        }
    }

    #[test]
    fn test_select_skips_inactive() {
        let items = vec![class(1, "small", false), class(2, "small", true)];
        assert_eq!(select_active(items, "small").unwrap().id, 2);
    }

    #[test]
    fn test_select_miss_names_kind() {
        let err = select_active(vec![class(1, "small", false)], "small").unwrap_err();
        assert_eq!(err.to_string(), "no active vm class with name \"small\"");
    }

    #[test]
    fn test_list_drops_inactive() {
        let items = active_only(vec![class(1, "a", false), class(2, "b", true)]);
        assert_eq!(items.iter().map(|c| c.id).collect::<Vec<_>>(), vec![2]);
    }

    #[test]
    fn test_template_decodes_full_shape_and_matches_on_os_type() {
        let body = br#"{"items":[
            {"id":2,"name":"Ubuntu 22.04","api_name":"ubuntu-2204","os_family":"linux","os_type":"ubuntu","version":"22.04","is_active":false},
            {"id":3,"name":"Ubuntu 24.04","api_name":"ubuntu-2404","os_family":"linux","os_type":"ubuntu","version":"24.04","is_active":true}
        ]}"#;
        let list: ListResponse<VmTemplate> = serde_json::from_slice(body).unwrap();
        let template = select_active(list.items, "ubuntu").unwrap();
        assert_eq!(template.id, 3);
        assert_eq!(template.api_name, "ubuntu-2404");
        assert_eq!(template.version, "24.04");

        let v = serde_json::to_value(&template).unwrap();
        assert_eq!(v["os_type"], "ubuntu");

        let err = select_active::<VmTemplate>(vec![], "Ubuntu 24.04").unwrap_err();
        assert_eq!(err.to_string(), "no active vm template with os_type \"Ubuntu 24.04\"");
    }

    #[test]
    fn test_class_shapes_keep_limits() {
        let net: ListResponse<NetworkClass> = serde_json::from_str(
            r#"{"items":[{"id":1,"name":"std","download_mbit_limit":1000,"upload_mbit_limit":500,
                "included_traffic_gb":2048,"traffic_price_per_gb_millicents":1.5,"is_active":true}]}"#,
        )
        .unwrap();
        let net = &net.items[0];
        assert_eq!((net.download_mbit_limit, net.upload_mbit_limit), (1000, 500));
        assert_eq!(net.included_traffic_gb, 2048);

        let storage: StorageClass = serde_json::from_str(
            r#"{"id":4,"name":"ssd","max_size_gb":2000,"replica_count":3,"is_active":true}"#,
        )
        .unwrap();
        assert_eq!((storage.max_size_gb, storage.replica_count), (2000, 3));
    }

    #[test]
    fn test_list_without_items_is_empty() {
        let list: ListResponse<VmClass> = serde_json::from_str("{}").unwrap();
        assert!(list.items.is_empty());
    }
}
