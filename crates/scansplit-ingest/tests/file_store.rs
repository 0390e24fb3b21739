use scansplit_core::{Page, PageTextStore, ScanId, StoreError};
use scansplit_ingest::{FileScanStore, is_scan_path, read_pages};

#[test]
fn registers_unique_ids_per_stem() {
    let dir = tempfile::tempdir().unwrap();
    let a = dir.path().join("a");
    let b = dir.path().join("b");
    std::fs::create_dir_all(&a).unwrap();
    std::fs::create_dir_all(&b).unwrap();
    std::fs::write(a.join("batch.txt"), "one").unwrap();
    std::fs::write(b.join("batch.txt"), "two").unwrap();

    let store = FileScanStore::new();
    let first = store.register(a.join("batch.txt"));
    let second = store.register(b.join("batch.txt"));

    assert_eq!(first, ScanId::from("batch"));
    assert_eq!(second, ScanId::from("batch-2"));
    assert_eq!(store.get_pages(&second).unwrap(), vec![Page::new(1, "two")]);
}

#[test]
fn reads_json_sidecar_through_store() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("mail-0412.json");
    std::fs::write(&path, r#"["Invoice 77", "Page 2 of 2"]"#).unwrap();

    let store = FileScanStore::new();
    let id = store.register(&path);
    let pages = store.get_pages(&id).unwrap();
    assert_eq!(pages.len(), 2);
    assert_eq!(store.source_path(&id).unwrap(), path);
}

#[test]
fn unknown_scan_and_unreadable_file() {
    let dir = tempfile::tempdir().unwrap();
    let store = FileScanStore::new();
    assert!(matches!(
        store.get_pages(&ScanId::from("nope")),
        Err(StoreError::NotFound(_))
    ));

    let id = store.register(dir.path().join("gone.txt"));
    assert!(matches!(store.get_pages(&id), Err(StoreError::Io(_))));
}

#[test]
fn bad_sidecar_is_reported() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("broken.json");
    std::fs::write(&path, "{not json").unwrap();
    let err = read_pages(&path).unwrap_err();
    assert!(err.to_string().contains("broken.json"));
}

#[test]
fn scan_path_detection() {
    let dir = tempfile::tempdir().unwrap();
    assert!(is_scan_path(dir.path()));
    assert!(is_scan_path(std::path::Path::new("x.PDF")));
    assert!(!is_scan_path(std::path::Path::new("x.docx")));
}
