//! End-to-end wiring: configuration to resolved resources and a live
//! entity cache.

use std::fs;
use std::io::Write;
use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use strata::blob::ResourceStore;
use strata::cache::EntityCache;
use strata::codec::{Format, ValueCodec};
use strata::config::Config;
use strata::events::MemoryEventLog;

fn write_zip(path: &Path, entries: &[(&str, &[u8])]) {
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    let file = fs::File::create(path).unwrap();
    let mut writer = zip::ZipWriter::new(file);
    for (name, content) in entries {
        writer
            .start_file(*name, zip::write::SimpleFileOptions::default())
            .unwrap();
        writer.write_all(content).unwrap();
    }
    writer.finish().unwrap();
}

#[tokio::test]
async fn resources_resolve_through_configured_sources() {
    let dir = tempfile::tempdir().unwrap();
    let data_dir = dir.path().join("data");

    fs::create_dir_all(data_dir.join("base")).unwrap();
    fs::write(data_dir.join("base/logo.png"), b"base logo").unwrap();
    fs::write(data_dir.join("base/only-base.txt"), b"base only").unwrap();
    write_zip(
        &data_dir.join("pack.zip"),
        &[
            ("logo.png", b"packed logo".as_ref()),
            ("extra.css", b"packed css".as_ref()),
        ],
    );

    let config = Config::parse_str(&format!(
        r#"
        data_dir = "{}"

        [[sources]]
        type = "fs"
        content = "resources"
        src = "base"

        [[sources]]
        type = "fs"
        content = "resources"
        src = "pack.zip"
        archive = true
        "#,
        data_dir.display()
    ))
    .unwrap();

    let resources = ResourceStore::new(config.store(), config.registry().unwrap());
    resources.spawn_initialize();
    resources.ready().await;

    // The archive is declared after the directory, so it wins.
    assert_eq!(
        resources.read("logo.png").unwrap().as_deref(),
        Some(b"packed logo".as_ref())
    );
    assert_eq!(
        resources.read("only-base.txt").unwrap().as_deref(),
        Some(b"base only".as_ref())
    );
    assert_eq!(
        resources.read("extra.css").unwrap().as_deref(),
        Some(b"packed css".as_ref())
    );
    assert!(resources.read("absent").unwrap().is_none());
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
struct Setting {
    value: String,
}

#[tokio::test]
async fn entities_round_trip_with_read_your_write() {
    let log = Arc::new(MemoryEventLog::new());
    let cache = EntityCache::<Setting>::new(
        vec!["setting".to_owned()],
        ValueCodec::new(Format::Json),
        log.clone(),
    );
    cache.subscribe();

    let id: strata::ident::Identifier = "app/ui/theme".parse().unwrap();
    let written = cache
        .put(
            id.clone(),
            &Setting {
                value: "dark".to_owned(),
            },
        )
        .await
        .unwrap();
    assert_eq!(written.as_deref().map(|s| s.value.as_str()), Some("dark"));
    assert!(cache.has(&id));

    // A second cache over the same log sees the history on subscription.
    let late = EntityCache::<Setting>::new(
        vec!["setting".to_owned()],
        ValueCodec::new(Format::Json),
        log,
    );
    late.subscribe();
    assert_eq!(
        late.get(&id).as_deref().map(|s| s.value.as_str()),
        Some("dark")
    );
}
