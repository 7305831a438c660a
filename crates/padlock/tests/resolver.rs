//! End-to-end resolver scenarios over an in-memory universe of releases.

use indexmap::IndexMap;
use padlock::repository::MockRepository;
use padlock::resolver::{self, ResolutionError, ResolveOptions};
use padlock::types::{parse_line, EnvSpec, Requirement};
use std::collections::HashMap;
use std::sync::Arc;

/// A builder-style harness so each scenario states only what it cares
/// about: the universe, the requirement lines, and the target python range.
#[derive(Default)]
struct ResolveBuilder {
    requirements: Vec<String>,
    requires_python: String,
    allow_prereleases: Option<bool>,
    overrides: IndexMap<String, String>,
    candidates: Vec<(String, String, String)>,
    dependencies: HashMap<(String, String), Vec<String>>,
}

impl ResolveBuilder {
    fn with_requirement(mut self, line: &str) -> Self {
        self.requirements.push(line.to_string());
        self
    }

    fn with_requires_python(mut self, spec: &str) -> Self {
        self.requires_python = spec.to_string();
        self
    }

    fn with_allow_prereleases(mut self, allow: bool) -> Self {
        self.allow_prereleases = Some(allow);
        self
    }

    fn with_override(mut self, name: &str, requested: &str) -> Self {
        self.overrides.insert(name.to_string(), requested.to_string());
        self
    }

    fn with_candidate(mut self, name: &str, version: &str, requires_python: &str) -> Self {
        self.candidates
            .push((name.to_string(), version.to_string(), requires_python.to_string()));
        self
    }

    fn with_dependencies(mut self, name: &str, version: &str, deps: &[&str]) -> Self {
        self.dependencies
            .entry((name.to_string(), version.to_string()))
            .or_default()
            .extend(deps.iter().map(|d| d.to_string()));
        self
    }

    fn repository(&self) -> Arc<MockRepository> {
        let env_spec = EnvSpec::from_requires_python(
            self.requires_python.parse().expect("requires-python parses"),
        );
        let repository = MockRepository::new(env_spec);
        for (name, version, requires_python) in &self.candidates {
            repository.add_candidate_with_python(name, version, requires_python);
        }
        for ((name, version), deps) in &self.dependencies {
            let lines: Vec<&str> = deps.iter().map(String::as_str).collect();
            repository.add_dependencies(name, version, &lines);
        }
        Arc::new(repository)
    }

    async fn resolve(self) -> Result<resolver::Resolution, ResolutionError> {
        let repository = self.repository();
        let requirements: Vec<Requirement> = self
            .requirements
            .iter()
            .map(|line| parse_line(line).expect("requirement line parses"))
            .collect();
        let options = ResolveOptions {
            allow_prereleases: self.allow_prereleases,
            overrides: self.overrides.clone(),
            ..ResolveOptions::default()
        };
        resolver::resolve(
            repository,
            requirements,
            self.requires_python.parse().unwrap(),
            options,
        )
        .await
    }
}

fn version_of(resolution: &resolver::Resolution, identifier: &str) -> String {
    resolution.mapping[identifier]
        .version
        .as_ref()
        .expect("pinned candidates carry a version")
        .to_string()
}

fn django_universe() -> ResolveBuilder {
    ResolveBuilder::default()
        .with_candidate("django", "1.11.8", "")
        .with_candidate("django", "2.2.9", ">=3.5")
        .with_candidate("sqlparse", "0.3.0", ">=3.5")
        .with_dependencies("django", "2.2.9", &["sqlparse>=0.3.0"])
}

#[tokio::test(flavor = "multi_thread")]
async fn test_requires_python_drives_selection() {
    // without a python floor, the py2-compatible release wins
    let resolution = django_universe()
        .with_requirement("django")
        .resolve()
        .await
        .unwrap();
    assert_eq!(version_of(&resolution, "django"), "1.11.8");
    assert!(!resolution.mapping.contains_key("sqlparse"));
    assert!(resolution.has_warnings);

    let resolution = django_universe()
        .with_requirement("django")
        .with_requires_python(">=3.6")
        .resolve()
        .await
        .unwrap();
    assert_eq!(version_of(&resolution, "django"), "2.2.9");
    assert_eq!(version_of(&resolution, "sqlparse"), "0.3.0");
}

#[tokio::test(flavor = "multi_thread")]
async fn test_python_marker_on_requirement() {
    let resolution = django_universe()
        .with_requirement("django; python_version>='3.7'")
        .resolve()
        .await
        .unwrap();
    assert_eq!(version_of(&resolution, "django"), "2.2.9");
    assert!(resolution.mapping.contains_key("sqlparse"));
}

fn prerelease_universe() -> ResolveBuilder {
    ResolveBuilder::default()
        .with_candidate("foo", "1.0.0", "")
        .with_candidate("foo", "1.1.0a1", "")
        .with_candidate("bar", "1.0.0b1", "")
}

#[tokio::test(flavor = "multi_thread")]
async fn test_prereleases_are_gated() {
    let resolution = prerelease_universe()
        .with_requirement("foo")
        .resolve()
        .await
        .unwrap();
    assert_eq!(version_of(&resolution, "foo"), "1.0.0");

    let resolution = prerelease_universe()
        .with_requirement("foo")
        .with_allow_prereleases(true)
        .resolve()
        .await
        .unwrap();
    assert_eq!(version_of(&resolution, "foo"), "1.1.0a1");

    // a pre-release pin opts in on its own
    let resolution = prerelease_universe()
        .with_requirement("foo==1.1.0a1")
        .resolve()
        .await
        .unwrap();
    assert_eq!(version_of(&resolution, "foo"), "1.1.0a1");

    // no stable release exists, so the pre-release is used
    let resolution = prerelease_universe()
        .with_requirement("bar")
        .resolve()
        .await
        .unwrap();
    assert_eq!(version_of(&resolution, "bar"), "1.0.0b1");

    // but an explicit opt-out makes it unsolvable
    let error = prerelease_universe()
        .with_requirement("bar")
        .with_allow_prereleases(false)
        .resolve()
        .await
        .unwrap_err();
    assert!(matches!(error, ResolutionError::Impossible { .. }));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_extras_pull_in_optional_dependencies() {
    let builder = ResolveBuilder::default()
        .with_candidate("foo", "0.1.0", "")
        .with_candidate("foo", "0.2.0", "")
        .with_candidate("chardet", "3.0.4", "")
        .with_candidate("bar", "0.1.0", "")
        .with_dependencies("foo", "0.1.0", &["chardet; extra == 'enc'"])
        .with_dependencies("foo", "0.2.0", &["chardet; extra == 'enc'"])
        .with_dependencies("bar", "0.1.0", &["foo[enc]>=0.1.0"]);

    let resolution = builder
        .with_requirement("foo==0.1.0")
        .with_requirement("bar")
        .resolve()
        .await
        .unwrap();

    // the extras candidate and its bare form pin to one release
    assert_eq!(version_of(&resolution, "foo"), "0.1.0");
    assert_eq!(version_of(&resolution, "foo[enc]"), "0.1.0");
    assert_eq!(version_of(&resolution, "chardet"), "3.0.4");
    assert_eq!(version_of(&resolution, "bar"), "0.1.0");
}

#[tokio::test(flavor = "multi_thread")]
async fn test_extras_without_request_are_ignored() {
    let builder = ResolveBuilder::default()
        .with_candidate("foo", "0.1.0", "")
        .with_candidate("pytz", "2019.3", "")
        .with_dependencies("foo", "0.1.0", &["pytz; extra=='tz' or extra=='all'"]);

    let resolution = builder
        .with_requirement("foo")
        .resolve()
        .await
        .unwrap();
    assert!(!resolution.mapping.contains_key("pytz"));

    let builder = ResolveBuilder::default()
        .with_candidate("foo", "0.1.0", "")
        .with_candidate("pytz", "2019.3", "")
        .with_dependencies("foo", "0.1.0", &["pytz; extra=='tz' or extra=='all'"]);
    let resolution = builder
        .with_requirement("foo[tz]")
        .resolve()
        .await
        .unwrap();
    assert!(resolution.mapping.contains_key("pytz"));
}

fn conflict_universe() -> ResolveBuilder {
    ResolveBuilder::default()
        .with_candidate("foo", "0.1.0", "")
        .with_candidate("foo", "0.2.0", "")
        .with_candidate("bar", "0.1.0", "")
        .with_candidate("hoho", "1.5", "")
        .with_candidate("hoho", "2.1", "")
        .with_dependencies("foo", "0.1.0", &["hoho<2.0"])
        .with_dependencies("foo", "0.2.0", &["hoho>=2.0"])
        .with_dependencies("bar", "0.1.0", &["hoho~=1.1"])
}

#[tokio::test(flavor = "multi_thread")]
async fn test_conflicts_resolved_by_backtracking() {
    let resolution = conflict_universe()
        .with_requirement("foo")
        .with_requirement("bar")
        .resolve()
        .await
        .unwrap();
    assert_eq!(version_of(&resolution, "foo"), "0.1.0");
    assert_eq!(version_of(&resolution, "bar"), "0.1.0");
    assert_eq!(version_of(&resolution, "hoho"), "1.5");
}

#[tokio::test(flavor = "multi_thread")]
async fn test_unsolvable_conflict() {
    let builder = ResolveBuilder::default()
        .with_candidate("foo", "0.1.0", "")
        .with_candidate("bar", "0.1.0", "")
        .with_candidate("hoho", "1.5", "")
        .with_candidate("hoho", "2.1", "")
        .with_dependencies("foo", "0.1.0", &["hoho>=2.0"])
        .with_dependencies("bar", "0.1.0", &["hoho~=1.1"]);
    let error = builder
        .with_requirement("foo")
        .with_requirement("bar")
        .resolve()
        .await
        .unwrap_err();
    let ResolutionError::Impossible { causes } = error else {
        panic!("expected an impossible resolution");
    };
    // the conflict report names the requirement chain
    assert!(causes.iter().any(|c| c.requirement.identify() == "hoho"));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_no_matching_version_is_unsolvable() {
    let builder = ResolveBuilder::default().with_candidate("foo", "0.1.0", "");
    let error = builder
        .with_requirement("foo>=0.2.0")
        .resolve()
        .await
        .unwrap_err();
    assert!(matches!(error, ResolutionError::Impossible { .. }));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_overrides_bypass_constraints() {
    for requested in ["2.1", ">=1.8", "==2.1"] {
        let builder = ResolveBuilder::default()
            .with_candidate("foo", "0.1.0", "")
            .with_candidate("bar", "0.1.0", "")
            .with_candidate("hoho", "1.5", "")
            .with_candidate("hoho", "2.1", "")
            .with_dependencies("foo", "0.1.0", &["hoho>=2.0"])
            .with_dependencies("bar", "0.1.0", &["hoho~=1.1"]);
        let resolution = builder
            .with_requirement("foo")
            .with_requirement("bar")
            .with_override("hoho", requested)
            .resolve()
            .await
            .unwrap();
        assert_eq!(version_of(&resolution, "hoho"), "2.1", "override {requested}");
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn test_incompatible_marker_excludes_dependency() {
    let builder = ResolveBuilder::default()
        .with_candidate("foo", "0.1.0", "")
        .with_candidate("bar", "0.1.0", "")
        .with_dependencies("foo", "0.1.0", &["bar; python_version < '3'"]);
    let resolution = builder
        .with_requirement("foo")
        .with_requires_python(">=3.6")
        .resolve()
        .await
        .unwrap();
    assert!(!resolution.mapping.contains_key("bar"));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_markers_union_across_parents() {
    // bar is both a top-level requirement and a python-2-only dependency;
    // the root edge wins and bar stays unconditional
    let builder = ResolveBuilder::default()
        .with_candidate("foo", "0.1.0", "")
        .with_candidate("bar", "0.1.0", "")
        .with_dependencies("foo", "0.1.0", &["bar; python_version < '3'"]);
    let resolution = builder
        .with_requirement("foo")
        .with_requirement("bar")
        .with_requires_python(">=3.6")
        .resolve()
        .await
        .unwrap();
    let bar = &resolution.mapping["bar"];
    assert!(bar.req.marker().is_none());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_marker_inheritance_annotates_candidates() {
    let builder = ResolveBuilder::default()
        .with_candidate("foo", "0.1.0", "")
        .with_candidate("pywin", "1.0", "")
        .with_dependencies("foo", "0.1.0", &["pywin; os_name == 'nt'"]);
    let resolution = builder
        .with_requirement("foo")
        .resolve()
        .await
        .unwrap();
    let pywin = &resolution.mapping["pywin"];
    assert_eq!(
        pywin.req.marker().unwrap().to_string(),
        "os_name == \"nt\""
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn test_unsatisfiable_root_marker_is_skipped() {
    let builder = ResolveBuilder::default().with_candidate("foo", "0.1.0", "");
    let resolution = builder
        .with_requirement("foo; python_version < '3'")
        .with_requires_python(">=3.6")
        .resolve()
        .await
        .unwrap();
    assert!(resolution.mapping.is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_circular_dependencies_resolve() {
    let builder = ResolveBuilder::default()
        .with_candidate("foo", "0.1.0", "")
        .with_candidate("foobar", "0.2.0", "")
        .with_dependencies("foo", "0.1.0", &["foobar"])
        .with_dependencies("foobar", "0.2.0", &["foo"]);
    let resolution = builder
        .with_requirement("foo")
        .resolve()
        .await
        .unwrap();
    assert_eq!(version_of(&resolution, "foo"), "0.1.0");
    assert_eq!(version_of(&resolution, "foobar"), "0.2.0");
}

#[tokio::test(flavor = "multi_thread")]
async fn test_requirements_from_different_groups_merge() {
    let builder = ResolveBuilder::default()
        .with_candidate("foo", "0.1.0", "")
        .with_candidate("foo", "0.2.0", "");
    let resolution = builder
        .with_requirement("foo")
        .with_requirement("foo<0.2.0")
        .resolve()
        .await
        .unwrap();
    assert_eq!(version_of(&resolution, "foo"), "0.1.0");
}

#[tokio::test(flavor = "multi_thread")]
async fn test_prerelease_requirement_wins_over_sibling() {
    let builder = ResolveBuilder::default()
        .with_candidate("urllib3", "1.22", "")
        .with_candidate("urllib3", "1.23b0", "")
        .with_candidate("requests", "2.19.1", "")
        .with_candidate("requests", "2.20.0b1", "")
        .with_dependencies("requests", "2.19.1", &["urllib3<1.23,>=1.21.1"])
        .with_dependencies("requests", "2.20.0b1", &["urllib3>=1.23b0"]);
    let resolution = builder
        .with_requirement("urllib3")
        .with_requirement("requests>=2.20.0b0")
        .resolve()
        .await
        .unwrap();
    assert_eq!(version_of(&resolution, "urllib3"), "1.23b0");
}

#[tokio::test(flavor = "multi_thread")]
async fn test_dependency_groups_are_inherited() {
    let builder = ResolveBuilder::default()
        .with_candidate("foo", "0.1.0", "")
        .with_candidate("baz", "0.1.0", "")
        .with_dependencies("foo", "0.1.0", &["baz"]);
    let mut requirement = parse_line("foo").unwrap();
    requirement.core_mut().groups = vec!["dev".to_string()];

    let repository = builder.repository();
    let resolution = resolver::resolve(
        repository,
        vec![requirement],
        "".parse().unwrap(),
        ResolveOptions::default(),
    )
    .await
    .unwrap();
    assert_eq!(resolution.mapping["foo"].req.core().groups, vec!["dev"]);
    assert_eq!(resolution.mapping["baz"].req.core().groups, vec!["dev"]);
}
