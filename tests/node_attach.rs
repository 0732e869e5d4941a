//! Node agent end-to-end with fake iSCSI and filesystem collaborators

mod common;

use assert_matches::assert_matches;
use blockarray_csi::domain::request::*;
use blockarray_csi::{
    AttachmentState, ConnectorStore, Error, NodeAgent, NodeConfig, ReadinessProbe, RpcCode,
    VolumeCapability,
};
use common::*;
use std::path::PathBuf;
use std::sync::Arc;
use tempfile::TempDir;

struct Node {
    tmp: TempDir,
    iscsi: Arc<FakeIscsi>,
    fs: Arc<FakeFs>,
    agent: NodeAgent,
}

impl Node {
    fn new() -> Self {
        let tmp = TempDir::new().unwrap();
        let iscsi = Arc::new(FakeIscsi::default());
        let fs = Arc::new(FakeFs::default());
        let config = NodeConfig {
            plugin_dir: tmp.path().join("plugin"),
            initiator_name_path: tmp.path().join("initiatorname.iscsi"),
            sys_module_dir: tmp.path().join("sys/module"),
            ..Default::default()
        };
        let agent = NodeAgent::new(config, iscsi.clone(), fs.clone());
        Self {
            tmp,
            iscsi,
            fs,
            agent,
        }
    }

    fn target(&self, name: &str) -> PathBuf {
        self.tmp.path().join("pods").join(name).join("mount")
    }

    fn publish_request(&self, volume_id: &str, lun: u32, target: &str) -> NodePublishVolumeRequest {
        NodePublishVolumeRequest {
            volume_id: volume_id.into(),
            target_path: self.target(target).display().to_string(),
            volume_capability: Some(VolumeCapability::single_node_writer()),
            publish_context: pairs(&[(LUN_KEY, lun.to_string().as_str())]),
            volume_context: parameters(),
            readonly: false,
        }
    }

    fn unpublish_request(&self, volume_id: &str, target: &str) -> NodeUnpublishVolumeRequest {
        NodeUnpublishVolumeRequest {
            volume_id: volume_id.into(),
            target_path: self.target(target).display().to_string(),
        }
    }
}

#[tokio::test]
async fn test_attach_and_detach() {
    let node = Node::new();
    node.agent
        .publish_volume(node.publish_request("vol1", 1, "pod-a"))
        .await
        .unwrap();

    let (targets, lun) = node.iscsi.connects.lock()[0].clone();
    assert_eq!(lun, 1);
    assert_eq!(targets.len(), 2);
    assert!(targets.iter().all(|t| t.iqn == TARGET_IQN));
    assert_eq!(targets[0].portal, "10.0.0.10:3260");

    let state = node.agent.store().load("vol1").await.unwrap().unwrap();
    assert!(state.multipath);
    assert_eq!(state.device_path, "/dev/dm-1");
    assert_eq!(
        node.agent.attachment_state("vol1").await.unwrap(),
        AttachmentState::Mounted
    );
    assert_eq!(node.fs.formats.lock().len(), 1);

    node.agent
        .unpublish_volume(node.unpublish_request("vol1", "pod-a"))
        .await
        .unwrap();
    assert_eq!(node.iscsi.disconnects.lock().len(), 1);
    assert!(!node.target("pod-a").exists());
    assert!(node.agent.store().load("vol1").await.unwrap().is_none());
    assert_eq!(
        node.agent.attachment_state("vol1").await.unwrap(),
        AttachmentState::Detached
    );
}

#[tokio::test]
async fn test_republish_same_target_is_idempotent() {
    let node = Node::new();
    let request = node.publish_request("vol1", 2, "pod-a");
    node.agent.publish_volume(request.clone()).await.unwrap();
    node.agent.publish_volume(request).await.unwrap();

    assert_eq!(*node.fs.mount_calls.lock(), 1);
    assert_eq!(node.fs.formats.lock().len(), 1);
    // the mounted filesystem is not checked again
    assert_eq!(node.fs.checks.lock().len(), 1);
}

#[tokio::test]
async fn test_corrupted_filesystem_blocks_attach() {
    let node = Node::new();
    let device = FakeIscsi::device_for(1, 2).device_path;
    node.fs
        .filesystems
        .lock()
        .insert(device.clone(), "ext4".into());
    node.fs.corrupted.lock().insert(device);

    let err = node
        .agent
        .publish_volume(node.publish_request("vol1", 1, "pod-a"))
        .await
        .unwrap_err();
    assert_matches!(err, Error::FilesystemCorrupted { .. });
    assert_eq!(err.code(), RpcCode::DataLoss);
    assert_eq!(*node.fs.mount_calls.lock(), 0);
    assert!(node.fs.formats.lock().is_empty());
    assert_eq!(
        node.agent.attachment_state("vol1").await.unwrap(),
        AttachmentState::Detached
    );
}

#[tokio::test]
async fn test_publish_to_second_target_fails() {
    let node = Node::new();
    node.agent
        .publish_volume(node.publish_request("vol1", 1, "pod-a"))
        .await
        .unwrap();

    let err = node
        .agent
        .publish_volume(node.publish_request("vol1", 1, "pod-b"))
        .await
        .unwrap_err();
    assert_matches!(err, Error::MountedElsewhere { .. });
    assert_eq!(err.code(), RpcCode::FailedPrecondition);
}

#[tokio::test]
async fn test_ambiguous_mounts_fail() {
    let node = Node::new();
    let device = FakeIscsi::device_for(1, 2).device_path;
    node.fs.mount_externally(&device, "/mnt/one");
    node.fs.mount_externally(&device, "/mnt/two");

    let err = node
        .agent
        .publish_volume(node.publish_request("vol1", 1, "pod-a"))
        .await
        .unwrap_err();
    assert_matches!(err, Error::AmbiguousMounts { ref mount_points, .. } if mount_points.len() == 2);
    assert!(node.agent.store().load("vol1").await.unwrap().is_none());
}

#[tokio::test]
async fn test_detach_keeps_session_while_device_is_mounted_elsewhere() {
    let node = Node::new();
    node.agent
        .publish_volume(node.publish_request("vol1", 1, "pod-a"))
        .await
        .unwrap();
    let device = node.agent.store().load("vol1").await.unwrap().unwrap().device_path;
    node.fs.mount_externally(&device, "/mnt/debug");

    node.agent
        .unpublish_volume(node.unpublish_request("vol1", "pod-a"))
        .await
        .unwrap();
    assert!(node.iscsi.disconnects.lock().is_empty());
    assert!(node.agent.store().load("vol1").await.unwrap().is_some());
    assert_eq!(
        node.agent.attachment_state("vol1").await.unwrap(),
        AttachmentState::Mounted
    );
}

#[tokio::test]
async fn test_detach_without_connector_state() {
    let node = Node::new();
    node.agent
        .unpublish_volume(node.unpublish_request("vol9", "pod-a"))
        .await
        .unwrap();
    assert!(node.iscsi.disconnects.lock().is_empty());
}

#[tokio::test]
async fn test_detach_when_device_is_gone() {
    let node = Node::new();
    node.agent
        .publish_volume(node.publish_request("vol1", 1, "pod-a"))
        .await
        .unwrap();
    let device = node.agent.store().load("vol1").await.unwrap().unwrap().device_path;
    node.fs.missing_devices.lock().insert(device);

    node.agent
        .unpublish_volume(node.unpublish_request("vol1", "pod-a"))
        .await
        .unwrap();
    assert!(node.iscsi.disconnects.lock().is_empty());
    assert!(node.agent.store().load("vol1").await.unwrap().is_none());
}

#[tokio::test]
async fn test_corrupted_filesystem_blocks_detach() {
    let node = Node::new();
    node.agent
        .publish_volume(node.publish_request("vol1", 1, "pod-a"))
        .await
        .unwrap();
    let device = node.agent.store().load("vol1").await.unwrap().unwrap().device_path;
    node.fs.corrupted.lock().insert(device);

    let err = node
        .agent
        .unpublish_volume(node.unpublish_request("vol1", "pod-a"))
        .await
        .unwrap_err();
    assert_eq!(err.code(), RpcCode::DataLoss);
    assert!(node.iscsi.disconnects.lock().is_empty());
    assert!(node.agent.store().load("vol1").await.unwrap().is_some());
}

#[tokio::test]
async fn test_legacy_connector_file_is_detached() {
    let node = Node::new();
    let store = ConnectorStore::new(node.tmp.path().join("plugin"));
    std::fs::create_dir_all(store.dir()).unwrap();
    std::fs::write(
        store.path_for("vol1"),
        r#"{
            "volume_name": "vol1",
            "targets": [
                {"iqn": "iqn.test", "portal": "10.0.0.1", "port": "3260"},
                {"iqn": "iqn.test", "portal": "10.0.0.2", "port": "3260"}
            ],
            "lun": 4,
            "device_path": "/dev/dm-4"
        }"#,
    )
    .unwrap();
    node.fs
        .filesystems
        .lock()
        .insert("/dev/dm-4".into(), "ext4".into());

    node.agent
        .unpublish_volume(node.unpublish_request("vol1", "pod-a"))
        .await
        .unwrap();
    let disconnects = node.iscsi.disconnects.lock().clone();
    assert_eq!(disconnects.len(), 1);
    assert_eq!(disconnects[0].device_path, "/dev/dm-4");
    assert!(!store.path_for("vol1").exists());
}

#[tokio::test]
async fn test_expand_resizes_multipath_and_filesystem() {
    let node = Node::new();
    node.agent
        .publish_volume(node.publish_request("vol1", 3, "pod-a"))
        .await
        .unwrap();

    let response = node
        .agent
        .expand_volume(NodeExpandVolumeRequest {
            volume_id: "vol1".into(),
            volume_path: node.target("pod-a").display().to_string(),
            capacity_range: Some(CapacityRange {
                required_bytes: 4 << 30,
                limit_bytes: 0,
            }),
        })
        .await
        .unwrap();
    assert_eq!(response.capacity_bytes, 4 << 30);

    let device = FakeIscsi::device_for(3, 2);
    assert_eq!(*node.iscsi.rescans.lock(), device.path_devices);
    assert_eq!(*node.iscsi.multipath_resizes.lock(), vec![device.device_path.clone()]);
    assert_eq!(
        *node.fs.resizes.lock(),
        vec![(device.device_path, "ext4".to_string())]
    );
}

#[tokio::test]
async fn test_expand_unknown_volume() {
    let node = Node::new();
    let err = node
        .agent
        .expand_volume(NodeExpandVolumeRequest {
            volume_id: "vol1".into(),
            ..Default::default()
        })
        .await
        .unwrap_err();
    assert_eq!(err.code(), RpcCode::NotFound);
}

#[tokio::test]
async fn test_node_identity_and_readiness() {
    let node = Node::new();

    let err = node.agent.get_info().await.unwrap_err();
    assert_eq!(err.code(), RpcCode::FailedPrecondition);

    std::fs::write(
        node.tmp.path().join("initiatorname.iscsi"),
        format!("InitiatorName={}\n", NODE_A),
    )
    .unwrap();
    let info = node.agent.get_info().await.unwrap();
    assert_eq!(info.node_id, NODE_A);
    assert_eq!(info.max_volumes_per_node, 255);

    assert_matches!(node.agent.probe().await, Err(Error::NodeNotReady(_)));

    let modules = node.tmp.path().join("sys/module");
    std::fs::create_dir_all(modules.join("iscsi_tcp")).unwrap();
    std::fs::create_dir_all(modules.join("dm_multipath")).unwrap();
    assert!(node.agent.probe().await.unwrap().ready);
}

#[tokio::test]
async fn test_custom_probe() {
    let node = Node::new();
    let agent = node.agent.with_probe(ReadinessProbe {
        sys_module_dir: node.tmp.path().to_path_buf(),
        required_modules: Vec::new(),
        required_binaries: vec!["iscsiadm".into()],
        check_binaries: true,
        search_path: vec![node.tmp.path().join("bin")],
    });
    assert_matches!(agent.probe().await, Err(Error::NodeNotReady(msg)) if msg.contains("iscsiadm"));
}
