use std::collections::BTreeMap;

use blockxfer_core::{
    AccessConditions, DirObjectStore, DownloadOptions, DownloadRange, ObjectAttributes,
    ObjectStore, UploadMode, UploadOptions, download_to_file, upload_file,
};
use tempfile::TempDir;

fn random_bytes(len: usize) -> Vec<u8> {
    let mut buf = vec![0u8; len];
    getrandom::getrandom(&mut buf).unwrap();
    buf
}

fn open_rw(path: &std::path::Path) -> std::fs::File {
    std::fs::OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(path)
        .unwrap()
}

#[tokio::test]
async fn staged_file_upload_then_ranged_download() {
    let temp = TempDir::new().unwrap();
    let store = DirObjectStore::new(temp.path().join("store"));

    let data = random_bytes(20_000);
    let src_path = temp.path().join("src.bin");
    std::fs::write(&src_path, &data).unwrap();
    let src = std::fs::File::open(&src_path).unwrap();

    let mut metadata = BTreeMap::new();
    metadata.insert("origin".to_string(), "dir-store-test".to_string());
    let res = upload_file(
        &store,
        "nested/obj.bin",
        &src,
        UploadOptions {
            block_size: 3000,
            parallelism: 3,
            single_shot_max_bytes: 4096,
            attributes: ObjectAttributes {
                content_type: Some("application/x-test".to_string()),
                metadata,
            },
            ..UploadOptions::default()
        },
    )
    .await
    .unwrap();

    assert_eq!(
        res.mode,
        UploadMode::Staged {
            block_size: 3000,
            block_count: 7
        }
    );
    assert_eq!(
        std::fs::read(temp.path().join("store/objects/nested/obj.bin")).unwrap(),
        data
    );
    assert!(!temp
        .path()
        .join("store/blocks")
        .join(hex::encode("nested/obj.bin"))
        .exists());

    let props = store
        .get_properties("nested/obj.bin", &AccessConditions::default())
        .await
        .unwrap();
    assert_eq!(props.content_length, 20_000);
    assert_eq!(
        props.attributes.content_type.as_deref(),
        Some("application/x-test")
    );
    assert_eq!(
        props.attributes.metadata.get("origin").map(String::as_str),
        Some("dir-store-test")
    );

    let dst_path = temp.path().join("dst.bin");
    let dst = open_rw(&dst_path);
    let res = download_to_file(
        &store,
        "nested/obj.bin",
        DownloadRange::new(5000, Some(12_000)),
        &dst,
        DownloadOptions {
            block_size: 1000,
            parallelism: 4,
            ..DownloadOptions::default()
        },
    )
    .await
    .unwrap();
    drop(dst);

    assert_eq!(res.bytes_downloaded, 12_000);
    assert_eq!(std::fs::read(&dst_path).unwrap(), data[5000..17_000]);
}

#[tokio::test]
async fn single_shot_upload_replaces_object() {
    let temp = TempDir::new().unwrap();
    let store = DirObjectStore::new(temp.path());

    for len in [3000usize, 1000] {
        let data = random_bytes(len);
        let src_path = temp.path().join(format!("src-{len}.bin"));
        std::fs::write(&src_path, &data).unwrap();
        let src = std::fs::File::open(&src_path).unwrap();

        let res = upload_file(&store, "obj", &src, UploadOptions::default())
            .await
            .unwrap();
        assert_eq!(res.mode, UploadMode::SingleShot);
        assert_eq!(res.response.unwrap().content_length, len as u64);

        let dst_path = temp.path().join("dst.bin");
        let dst = open_rw(&dst_path);
        download_to_file(
            &store,
            "obj",
            DownloadRange::full(),
            &dst,
            DownloadOptions::default(),
        )
        .await
        .unwrap();
        drop(dst);
        assert_eq!(std::fs::read(&dst_path).unwrap(), data);
    }
}
