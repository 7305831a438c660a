//! Lock file round-trips and resolution against a locked repository.

use padlock::lockfile::{Compatibility, Lockfile};
use padlock::project::{Manifest, ProjectContext};
use padlock::repository::{LockedRepository, MockRepository, Repository};
use padlock::resolver::{self, ResolveOptions, UpdateStrategy};
use padlock::types::{parse_line, EnvSpec, Requirement};
use std::collections::HashSet;
use std::sync::Arc;

const MANIFEST: &str = r#"
[project]
name = "demo-app"
version = "0.1.0"
requires-python = ">=3.6"
dependencies = ["django"]
"#;

fn django_repository() -> Arc<MockRepository> {
    let repository = MockRepository::new(EnvSpec::from_requires_python(">=3.6".parse().unwrap()));
    repository.add_candidate_with_python("django", "1.11.8", "");
    repository.add_candidate_with_python("django", "2.2.9", ">=3.5");
    repository.add_candidate_with_python("sqlparse", "0.3.0", ">=3.5");
    repository.add_dependencies("django", "2.2.9", &["sqlparse>=0.3.0"]);
    Arc::new(repository)
}

async fn resolve_django() -> resolver::Resolution {
    let options = ResolveOptions {
        fetch_hashes: true,
        ..ResolveOptions::default()
    };
    resolver::resolve(
        django_repository(),
        vec![parse_line("django").unwrap()],
        ">=3.6".parse().unwrap(),
        options,
    )
    .await
    .unwrap()
}

#[tokio::test(flavor = "multi_thread")]
async fn test_lockfile_roundtrip() {
    let resolution = resolve_django().await;
    let manifest = Manifest::from_toml(MANIFEST).unwrap();

    let dir = tempfile::tempdir().unwrap();
    let mut lock = Lockfile::load(dir.path().join("pdm.lock")).unwrap();
    let strategy: HashSet<String> = HashSet::from(["inherit_metadata".to_string()]);
    lock.format(
        &resolution,
        &["default".to_string()],
        &strategy,
        &manifest.content_hash("sha256"),
    );
    lock.save().unwrap();

    let reloaded = Lockfile::load(dir.path().join("pdm.lock")).unwrap();
    assert_eq!(reloaded.compatibility(), Compatibility::Same);
    assert!(reloaded.matches_content_hash(&manifest));
    assert_eq!(reloaded.groups(), Some(vec!["default".to_string()]));

    let packages = reloaded.packages(dir.path()).unwrap();
    assert_eq!(packages.len(), resolution.mapping.len());
    for entry in &packages {
        let identifier = entry.candidate.identify();
        let original = &resolution.mapping[&identifier];
        assert_eq!(entry.candidate.version, original.version);
        assert_eq!(entry.candidate.hashes, original.hashes);
        assert_eq!(
            entry.marker.as_ref().map(|m| m.to_string()),
            original.req.marker().map(|m| m.to_string())
        );
    }

    // a reformat of the same resolution is byte-identical
    let mut again = Lockfile::load(dir.path().join("pdm.lock")).unwrap();
    again.format(
        &resolution,
        &["default".to_string()],
        &strategy,
        &manifest.content_hash("sha256"),
    );
    assert_eq!(again.render(), reloaded.render());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_manifest_change_invalidates_lock() {
    let resolution = resolve_django().await;
    let manifest = Manifest::from_toml(MANIFEST).unwrap();

    let dir = tempfile::tempdir().unwrap();
    let mut lock = Lockfile::load(dir.path().join("pdm.lock")).unwrap();
    lock.format(
        &resolution,
        &["default".to_string()],
        &HashSet::new(),
        &manifest.content_hash("sha256"),
    );
    lock.save().unwrap();

    let changed = Manifest::from_toml(&MANIFEST.replace("django", "flask")).unwrap();
    let reloaded = Lockfile::load(dir.path().join("pdm.lock")).unwrap();
    assert!(reloaded.matches_content_hash(&manifest));
    assert!(!reloaded.matches_content_hash(&changed));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_reuse_strategy_prefers_existing_pins() {
    // the index gained foo 0.2.0 since the lock was written
    let repository = MockRepository::new(EnvSpec::from_requires_python(">=3.6".parse().unwrap()));
    repository.add_candidate("foo", "0.1.0");
    repository.add_candidate("foo", "0.2.0");
    let repository: Arc<dyn Repository> = Arc::new(repository);

    let locked_entries = {
        let old = MockRepository::new(EnvSpec::from_requires_python(">=3.6".parse().unwrap()));
        old.add_candidate("foo", "0.1.0");
        let resolution = resolver::resolve(
            Arc::new(old),
            vec![parse_line("foo").unwrap()],
            ">=3.6".parse().unwrap(),
            ResolveOptions::default(),
        )
        .await
        .unwrap();
        let manifest = Manifest::from_toml(MANIFEST).unwrap();
        let dir = tempfile::tempdir().unwrap();
        let mut lock = Lockfile::load(dir.path().join("pdm.lock")).unwrap();
        lock.format(
            &resolution,
            &["default".to_string()],
            &HashSet::from(["inherit_metadata".to_string()]),
            &manifest.content_hash("sha256"),
        );
        lock.save().unwrap();
        Lockfile::load(dir.path().join("pdm.lock"))
            .unwrap()
            .packages(dir.path())
            .unwrap()
    };

    let dir = tempfile::tempdir().unwrap();
    let context = Arc::new(
        ProjectContext::new(
            dir.path().to_path_buf(),
            dir.path().join("cache"),
            Manifest::from_toml(MANIFEST).unwrap(),
        )
        .unwrap(),
    );
    let locked = Arc::new(LockedRepository::new(
        Arc::clone(&context),
        EnvSpec::from_requires_python(">=3.6".parse().unwrap()),
        locked_entries,
    ));

    // reuse keeps the old pin even though a newer release exists
    let options = ResolveOptions {
        update_strategy: UpdateStrategy::Reuse,
        locked_repository: Some(Arc::clone(&locked)),
        ..ResolveOptions::default()
    };
    let resolution = resolver::resolve(
        Arc::clone(&repository),
        vec![parse_line("foo").unwrap()],
        ">=3.6".parse().unwrap(),
        options,
    )
    .await
    .unwrap();
    assert_eq!(
        resolution.mapping["foo"].version.as_ref().unwrap().to_string(),
        "0.1.0"
    );

    // tracking foo frees the pin so it can move forward
    let options = ResolveOptions {
        update_strategy: UpdateStrategy::Reuse,
        locked_repository: Some(locked),
        tracked_names: vec!["foo".to_string()],
        ..ResolveOptions::default()
    };
    let resolution = resolver::resolve(
        repository,
        vec![parse_line("foo").unwrap()],
        ">=3.6".parse().unwrap(),
        options,
    )
    .await
    .unwrap();
    assert_eq!(
        resolution.mapping["foo"].version.as_ref().unwrap().to_string(),
        "0.2.0"
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn test_resolution_from_locked_repository() {
    let resolution = resolve_django().await;
    let manifest = Manifest::from_toml(MANIFEST).unwrap();

    let dir = tempfile::tempdir().unwrap();
    let mut lock = Lockfile::load(dir.path().join("pdm.lock")).unwrap();
    lock.format(
        &resolution,
        &["default".to_string()],
        &HashSet::from(["inherit_metadata".to_string()]),
        &manifest.content_hash("sha256"),
    );
    lock.save().unwrap();

    let reloaded = Lockfile::load(dir.path().join("pdm.lock")).unwrap();
    let entries = reloaded.packages(dir.path()).unwrap();

    let context = Arc::new(
        ProjectContext::new(
            dir.path().to_path_buf(),
            dir.path().join("cache"),
            Manifest::from_toml(MANIFEST).unwrap(),
        )
        .unwrap(),
    );
    let locked = Arc::new(LockedRepository::new(
        context,
        EnvSpec::from_requires_python(">=3.6".parse().unwrap()),
        entries,
    ));

    // resolving against the lock reproduces the pinned set verbatim
    let requirements: Vec<Requirement> = vec![parse_line("django").unwrap()];
    let replay = resolver::resolve(
        locked,
        requirements,
        ">=3.6".parse().unwrap(),
        ResolveOptions::default(),
    )
    .await
    .unwrap();
    assert_eq!(replay.mapping.len(), resolution.mapping.len());
    for (identifier, candidate) in &resolution.mapping {
        assert_eq!(replay.mapping[identifier].version, candidate.version);
    }
}
