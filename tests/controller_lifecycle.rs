//! Controller service end-to-end against the in-memory array

mod common;

use assert_matches::assert_matches;
use blockarray_csi::domain::request::*;
use blockarray_csi::{
    ControllerConfig, ControllerService, Error, InMemoryArray, LunScope, RpcCode,
    VolumeCapability,
};
use common::*;
use std::collections::HashSet;
use std::sync::Arc;
use tokio_test::{assert_err, assert_ok};

fn setup(config: ControllerConfig) -> (Arc<InMemoryArray>, Arc<ControllerService>) {
    let array = Arc::new(InMemoryArray::new());
    let service = ControllerService::new(config, array.clone());
    (array, service)
}

fn create_request(name: &str, bytes: u64) -> CreateVolumeRequest {
    CreateVolumeRequest {
        name: name.into(),
        capacity_range: Some(CapacityRange {
            required_bytes: bytes,
            limit_bytes: 0,
        }),
        volume_capabilities: vec![VolumeCapability::single_node_writer()],
        parameters: parameters(),
        secrets: secrets(),
        volume_content_source: None,
    }
}

fn publish_request(volume_id: &str, node_id: &str) -> ControllerPublishVolumeRequest {
    ControllerPublishVolumeRequest {
        volume_id: volume_id.into(),
        node_id: node_id.into(),
        volume_capability: Some(VolumeCapability::single_node_writer()),
        secrets: secrets(),
        ..Default::default()
    }
}

fn unpublish_request(volume_id: &str, node_id: &str) -> ControllerUnpublishVolumeRequest {
    ControllerUnpublishVolumeRequest {
        volume_id: volume_id.into(),
        node_id: node_id.into(),
        secrets: secrets(),
    }
}

async fn publish_lun(service: &ControllerService, volume_id: &str, node_id: &str) -> u32 {
    let response = service
        .publish_volume(publish_request(volume_id, node_id))
        .await
        .unwrap();
    response.publish_context[LUN_KEY].parse().unwrap()
}

#[tokio::test]
async fn test_volume_lifecycle() {
    let (array, service) = setup(ControllerConfig::default());

    let created = service
        .create_volume(create_request("pvc-0a1b2c3d-4e5f-6789-abcd-ef0123456789", 1 << 30))
        .await
        .unwrap();
    let volume_id = created.volume.volume_id.clone();
    assert!(volume_id.len() <= 32);
    assert_eq!(created.volume.volume_context[TARGET_IQN_KEY], TARGET_IQN);

    // first publish creates the host and picks LUN 1
    assert_eq!(publish_lun(&service, &volume_id, NODE_A).await, 1);
    assert!(array.has_host(NODE_A));
    let maps_after_first = array.stats().maps;

    // republish to the same node returns the same LUN without a new mapping
    assert_eq!(publish_lun(&service, &volume_id, NODE_A).await, 1);
    assert_eq!(array.stats().maps, maps_after_first);
    assert_eq!(array.mappings().len(), 1);

    // a second node is refused
    let err = service
        .publish_volume(publish_request(&volume_id, NODE_B))
        .await
        .unwrap_err();
    assert_matches!(err, Error::VolumeAttachedElsewhere { .. });
    assert_eq!(err.code(), RpcCode::FailedPrecondition);

    // grow
    let expanded = service
        .expand_volume(ControllerExpandVolumeRequest {
            volume_id: volume_id.clone(),
            capacity_range: Some(CapacityRange {
                required_bytes: 2 << 30,
                limit_bytes: 0,
            }),
            secrets: secrets(),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(expanded.capacity_bytes, 2 << 30);
    assert!(expanded.node_expansion_required);
    assert_eq!(array.volume(&volume_id).unwrap().size_bytes, 2 << 30);

    // unpublish is idempotent
    service
        .unpublish_volume(unpublish_request(&volume_id, NODE_A))
        .await
        .unwrap();
    service
        .unpublish_volume(unpublish_request(&volume_id, NODE_A))
        .await
        .unwrap();
    assert!(array.mappings().is_empty());

    // delete is idempotent
    let delete = DeleteVolumeRequest {
        volume_id: volume_id.clone(),
        secrets: secrets(),
    };
    service.delete_volume(delete.clone()).await.unwrap();
    service.delete_volume(delete).await.unwrap();
    assert!(array.volume(&volume_id).is_none());
}

#[tokio::test]
async fn test_create_is_idempotent_by_name() {
    let (array, service) = setup(ControllerConfig::default());

    let first = service.create_volume(create_request("vol1", 1 << 30)).await.unwrap();
    let second = service.create_volume(create_request("vol1", 1 << 30)).await.unwrap();
    assert_eq!(first.volume.volume_id, second.volume.volume_id);
    assert_eq!(array.stats().volume_creates, 1);

    let err = service
        .create_volume(create_request("vol1", 2 << 30))
        .await
        .unwrap_err();
    assert_eq!(err.code(), RpcCode::AlreadyExists);
}

#[tokio::test]
async fn test_lun_gaps_are_filled_first() {
    let (_array, service) = setup(ControllerConfig::default());
    for name in ["vol1", "vol2", "vol3", "vol4"] {
        service.create_volume(create_request(name, 1 << 20)).await.unwrap();
    }

    assert_eq!(publish_lun(&service, "vol1", NODE_A).await, 1);
    assert_eq!(publish_lun(&service, "vol2", NODE_A).await, 2);
    assert_eq!(publish_lun(&service, "vol3", NODE_A).await, 3);

    service
        .unpublish_volume(unpublish_request("vol2", NODE_A))
        .await
        .unwrap();
    assert_eq!(publish_lun(&service, "vol4", NODE_A).await, 2);

    // LUNs are scoped per initiator by default
    service.create_volume(create_request("vol5", 1 << 20)).await.unwrap();
    assert_eq!(publish_lun(&service, "vol5", NODE_B).await, 1);
}

#[tokio::test]
async fn test_array_wide_lun_scope() {
    let (_array, service) = setup(ControllerConfig {
        lun_scope: LunScope::Array,
        ..Default::default()
    });
    for name in ["vol1", "vol2"] {
        service.create_volume(create_request(name, 1 << 20)).await.unwrap();
    }

    assert_eq!(publish_lun(&service, "vol1", NODE_A).await, 1);
    assert_eq!(publish_lun(&service, "vol2", NODE_B).await, 2);
}

#[tokio::test]
async fn test_concurrent_publishes_get_distinct_luns() {
    let (array, service) = setup(ControllerConfig::default());
    let names: Vec<String> = (0..16).map(|i| format!("vol{}", i)).collect();
    for name in &names {
        service.create_volume(create_request(name, 1 << 20)).await.unwrap();
    }

    let handles: Vec<_> = names
        .iter()
        .map(|name| {
            let service = service.clone();
            let request = publish_request(name, NODE_A);
            tokio::spawn(async move { service.publish_volume(request).await })
        })
        .collect();

    let mut luns = HashSet::new();
    for joined in futures::future::join_all(handles).await {
        let response = assert_ok!(joined.unwrap());
        luns.insert(response.publish_context[LUN_KEY].clone());
    }
    assert_eq!(luns.len(), names.len());
    assert_eq!(array.mappings().len(), names.len());
}

#[tokio::test]
async fn test_snapshot_lifecycle() {
    let (array, service) = setup(ControllerConfig::default());
    service.create_volume(create_request("vol1", 1 << 30)).await.unwrap();

    let create = CreateSnapshotRequest {
        name: "snapshot-8f1c2d3e-aaaa-bbbb-cccc-0123456789ab".into(),
        source_volume_id: "vol1".into(),
        secrets: secrets(),
        ..Default::default()
    };
    let snapshot = service.create_snapshot(create.clone()).await.unwrap().snapshot;
    assert_eq!(snapshot.snapshot_id, "8f1c2d3eaaaabbbbcccc0123456789ab");
    assert_eq!(snapshot.source_volume_id, "vol1");
    assert!(snapshot.ready_to_use);

    // retried create lands on the same snapshot
    let again = service.create_snapshot(create).await.unwrap().snapshot;
    assert_eq!(again.snapshot_id, snapshot.snapshot_id);
    assert_eq!(array.stats().snapshot_creates, 1);

    // the source cannot be deleted while it has snapshots
    let err = service
        .delete_volume(DeleteVolumeRequest {
            volume_id: "vol1".into(),
            secrets: secrets(),
        })
        .await
        .unwrap_err();
    assert_matches!(err, Error::VolumeHasSnapshots { .. });

    // clone a volume from the snapshot
    let mut clone = create_request("vol2", 1 << 30);
    clone.volume_content_source = Some(VolumeContentSource::Snapshot {
        snapshot_id: snapshot.snapshot_id.clone(),
    });
    service.create_volume(clone).await.unwrap();
    assert!(array.volume("vol2").is_some());

    let listed = service
        .list_snapshots(ListSnapshotsRequest {
            source_volume_id: Some("vol1".into()),
            secrets: secrets(),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(listed.entries.len(), 1);

    let delete = DeleteSnapshotRequest {
        snapshot_id: snapshot.snapshot_id.clone(),
        secrets: secrets(),
    };
    service.delete_snapshot(delete.clone()).await.unwrap();
    service.delete_snapshot(delete).await.unwrap();

    service
        .delete_volume(DeleteVolumeRequest {
            volume_id: "vol1".into(),
            secrets: secrets(),
        })
        .await
        .unwrap();
}

#[tokio::test]
async fn test_unknown_array_code_is_internal() {
    let (array, service) = setup(ControllerConfig::default());
    service.create_volume(create_request("vol1", 1 << 20)).await.unwrap();

    array.fail_next("delete_volume", -10999, "controller is busy");
    let err = service
        .delete_volume(DeleteVolumeRequest {
            volume_id: "vol1".into(),
            secrets: secrets(),
        })
        .await
        .unwrap_err();
    assert_matches!(err, Error::Array { code: -10999, .. });
    assert_eq!(err.code(), RpcCode::Internal);
}

#[tokio::test]
async fn test_requests_without_credentials() {
    let (array, service) = setup(ControllerConfig::default());
    let mut request = create_request("vol1", 1 << 20);
    request.secrets.clear();

    let err = assert_err!(service.create_volume(request).await);
    assert_matches!(err, Error::MissingCredentials);
    assert_eq!(array.stats().logins, 0);
}
