use cairn_core::crypto::{hash, Keypair};
use cairn_services::testing::unique_temp_dir;

use crate::*;

fn archive(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 31 % 251) as u8).collect()
}

#[tokio::test]
async fn test_pushed_image_is_listed_and_runnable() {
    let (_net, nodes) = mesh(2).await;
    let (a, b) = (&nodes[0], &nodes[1]);

    let bytes = archive(300 * 1024);
    let path = unique_temp_dir("push").join("app.tar");
    std::fs::write(&path, &bytes).unwrap();

    let image_id = a.node.push_image(b.id(), &path).await.unwrap();
    assert_eq!(image_id, format!("sha256:{}", hex::encode(hash(&bytes))));
    assert_eq!(b.runtime.loaded_images(), vec![bytes.clone()]);

    let raw = a.node.list_images(b.id(), &a.node.public_key_hex()).await.unwrap();
    let listed: serde_json::Value = serde_json::from_str(&raw).unwrap();
    let listed = listed.as_array().unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0]["id"], image_id.as_str());
    assert_eq!(listed[0]["content_hash"], hex::encode(hash(&bytes)).as_str());

    let container = a.node.run_image(b.id(), &image_id).await.unwrap();
    assert!(b.runtime.running().contains(&container));
}

#[tokio::test]
async fn test_list_images_filters_by_signer() {
    let (_net, nodes) = mesh(3).await;
    let (a, b, c) = (&nodes[0], &nodes[1], &nodes[2]);
    b.runtime.add_image("sha256:preloaded", &["alpine:latest"]);

    let path = unique_temp_dir("signer").join("app.tar");
    std::fs::write(&path, archive(4096)).unwrap();
    a.node.push_image(b.id(), &path).await.unwrap();

    // C never uploaded anything, so nothing on B carries its signature.
    let raw = a.node.list_images(b.id(), &c.node.public_key_hex()).await.unwrap();
    assert_eq!(raw, "[]");

    // A second uploader of the same archive qualifies too.
    c.node.push_image(b.id(), &path).await.unwrap();
    let raw = a.node.list_images(b.id(), &c.node.public_key_hex()).await.unwrap();
    let listed: serde_json::Value = serde_json::from_str(&raw).unwrap();
    assert_eq!(listed.as_array().map(Vec::len), Some(1));

    let stranger = hex::encode(Keypair::generate().public_key());
    let raw = a.node.list_images(b.id(), &stranger).await.unwrap();
    assert_eq!(raw, "[]");
}
