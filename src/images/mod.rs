//! Layered image builds.
//!
//! L0 is the base development image, L1 adds the agent tooling (one image
//! per agent surface), L2 bakes in the project. Build steps run strictly in
//! that order and each step is issued only once its `FROM` image exists.

pub mod freshness;

use std::collections::BTreeMap;
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use sha2::{Digest, Sha256};
use tracing::info;

use crate::engine::{BuildRequest, ContainerEngine};
use crate::error::{BuildError, ConfigError, EngineError};
use crate::project::Project;

pub const L0_DOCKERFILE: &str = "L0.Dockerfile";
pub const L1_CLI_DOCKERFILE: &str = "L1.cli.Dockerfile";
pub const L1_WEB_DOCKERFILE: &str = "L1.web.Dockerfile";
pub const L2_DOCKERFILE: &str = "L2.Dockerfile";

pub const DOCKERFILES: [&str; 4] = [
    L0_DOCKERFILE,
    L1_CLI_DOCKERFILE,
    L1_WEB_DOCKERFILE,
    L2_DOCKERFILE,
];

const DEFAULT_BASE_TAG: &str = "ubuntu-24-04";
const MAX_TAG_LEN: usize = 120;

/// Turn an arbitrary base image reference into a valid image tag.
///
/// Long inputs keep a prefix and gain a digest suffix, so two long images
/// sharing a prefix still map to different tags.
pub fn base_tag(base_image: &str) -> String {
    let raw = base_image.trim();
    let tag = slug::slugify(raw);
    if tag.is_empty() {
        return DEFAULT_BASE_TAG.to_string();
    }
    if tag.len() <= MAX_TAG_LEN {
        return tag;
    }
    let digest = hex::encode(Sha256::digest(raw.as_bytes()));
    let keep = MAX_TAG_LEN - 9;
    format!("{}-{}", tag[..keep].trim_end_matches('-'), &digest[..8])
}

/// Every tag produced for one project.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageLayerSet {
    pub base: String,
    pub agent_cli: String,
    pub agent_web: String,
    pub project_cli: String,
    pub project_web: String,
    pub project_dev: String,
}

impl ImageLayerSet {
    pub fn for_project(project: &Project) -> Self {
        let tag = base_tag(&project.base_image);
        Self {
            base: format!("gatebox-l0:{}", tag),
            agent_cli: format!("gatebox-l1-cli:{}", tag),
            agent_web: format!("gatebox-l1-web:{}", tag),
            project_cli: format!("{}:l2-cli", project.id),
            project_web: format!("{}:l2-web", project.id),
            project_dev: format!("{}:l2-dev", project.id),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum BuildScope {
    /// Only the project layer; base layers are added when missing.
    #[default]
    L2Only,
    /// All layers, with a cache bust for the agent install step.
    WithAgents,
    /// All layers, no cache, fresh pull of the base image.
    FullRebuild,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Layer {
    L0,
    L1,
    L2,
}

impl fmt::Display for Layer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Layer::L0 => f.write_str("L0"),
            Layer::L1 => f.write_str("L1"),
            Layer::L2 => f.write_str("L2"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct BuildStep {
    pub layer: Layer,
    /// Image named in the step's `BASE_IMAGE` build arg.
    pub from: String,
    /// Whether `from` is one of our own layers and must exist locally.
    pub from_is_ours: bool,
    pub request: BuildRequest,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct BuildOptions {
    pub scope: BuildScope,
    pub include_dev: bool,
}

#[derive(Debug, Clone)]
pub struct BuildReport {
    pub built: Vec<String>,
    /// Base layers were built because they were missing, not because asked.
    pub promoted: bool,
}

/// Ensure all Dockerfiles exist in the build directory.
pub fn check_dockerfiles(project: &Project) -> Result<(), ConfigError> {
    if DOCKERFILES
        .iter()
        .all(|name| project.build_dir.join(name).is_file())
    {
        Ok(())
    } else {
        Err(ConfigError::MissingDockerfiles(project.build_dir.clone()))
    }
}

/// Build the ordered step list. Pure; no engine access.
pub fn plan(
    project: &Project,
    layers: &ImageLayerSet,
    options: BuildOptions,
    build_base: bool,
    context_hash: &str,
    cache_bust: u64,
) -> Vec<BuildStep> {
    let dir = &project.build_dir;
    let no_cache = options.scope == BuildScope::FullRebuild;

    let step = |layer: Layer, dockerfile: &str, from: &str, from_is_ours: bool, tag: &str| {
        let mut build_args = BTreeMap::new();
        build_args.insert("BASE_IMAGE".to_string(), from.to_string());
        BuildStep {
            layer,
            from: from.to_string(),
            from_is_ours,
            request: BuildRequest {
                dockerfile: dir.join(dockerfile),
                context: dir.clone(),
                tag: tag.to_string(),
                build_args,
                labels: BTreeMap::new(),
                no_cache,
                pull_always: false,
            },
        }
    };

    let mut steps = Vec::new();
    if build_base {
        let mut l0 = step(Layer::L0, L0_DOCKERFILE, &project.base_image, false, &layers.base);
        l0.request.pull_always = options.scope == BuildScope::FullRebuild;
        steps.push(l0);

        let mut l1_cli = step(
            Layer::L1,
            L1_CLI_DOCKERFILE,
            &layers.base,
            true,
            &layers.agent_cli,
        );
        l1_cli
            .request
            .build_args
            .insert("AGENT_CACHE_BUST".to_string(), cache_bust.to_string());
        steps.push(l1_cli);

        steps.push(step(
            Layer::L1,
            L1_WEB_DOCKERFILE,
            &layers.base,
            true,
            &layers.agent_web,
        ));
    }

    let mut l2 = vec![
        step(Layer::L2, L2_DOCKERFILE, &layers.agent_cli, true, &layers.project_cli),
        step(Layer::L2, L2_DOCKERFILE, &layers.agent_web, true, &layers.project_web),
    ];
    if options.include_dev {
        l2.push(step(Layer::L2, L2_DOCKERFILE, &layers.base, true, &layers.project_dev));
    }
    for s in &mut l2 {
        s.request
            .labels
            .insert(freshness::CONTEXT_HASH_LABEL.to_string(), context_hash.to_string());
    }
    steps.extend(l2);
    steps
}

/// Whether any L0/L1 tag is missing locally.
pub fn base_layers_missing(
    engine: &dyn ContainerEngine,
    layers: &ImageLayerSet,
) -> Result<bool, EngineError> {
    for tag in [&layers.base, &layers.agent_cli, &layers.agent_web] {
        if !engine.image_exists(tag)? {
            return Ok(true);
        }
    }
    Ok(false)
}

/// Run steps in order, verifying each step's base image exists first.
pub fn execute(
    engine: &dyn ContainerEngine,
    steps: &[BuildStep],
    on_step: &mut dyn FnMut(&BuildStep),
) -> Result<(), EngineError> {
    for step in steps {
        if step.from_is_ours && !engine.image_exists(&step.from)? {
            return Err(EngineError::MissingBaseImage {
                image: step.from.clone(),
                target: step.request.tag.clone(),
            });
        }
        on_step(step);
        info!(layer = %step.layer, tag = %step.request.tag, from = %step.from, "build: step");
        engine.build(&step.request)?;
    }
    Ok(())
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}

/// Build the project's images for the given scope.
pub fn build(
    engine: &dyn ContainerEngine,
    project: &Project,
    options: BuildOptions,
    on_step: &mut dyn FnMut(&BuildStep),
) -> Result<BuildReport, BuildError> {
    check_dockerfiles(project)?;
    let layers = ImageLayerSet::for_project(project);
    let context_hash = freshness::build_context_hash(project)?;

    let requested = options.scope != BuildScope::L2Only;
    let promoted = !requested && base_layers_missing(engine, &layers)?;
    if promoted {
        info!(project = %project.id, "build: base layers missing, building all layers");
    }

    let steps = plan(
        project,
        &layers,
        options,
        requested || promoted,
        &context_hash,
        unix_now(),
    );
    execute(engine, &steps, on_step)?;

    Ok(BuildReport {
        built: steps.into_iter().map(|s| s.request.tag).collect(),
        promoted,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::fake::FakeEngine;
    use crate::project::SecurityMode;
    use crate::project::testing::project_in;
    use std::fs;

    fn project_with_dockerfiles(root: &std::path::Path) -> Project {
        let project = project_in(root, SecurityMode::Online);
        fs::create_dir_all(&project.build_dir).unwrap();
        for name in DOCKERFILES {
            fs::write(project.build_dir.join(name), "FROM ${BASE_IMAGE}\n").unwrap();
        }
        project
    }

    #[test]
    fn test_base_tag_sanitizes() {
        assert_eq!(base_tag("ubuntu:24.04"), "ubuntu-24-04");
        assert_eq!(
            base_tag("Registry.io/Team/Img:1.2"),
            "registry-io-team-img-1-2"
        );
        assert_eq!(base_tag(""), "ubuntu-24-04");
        assert_eq!(base_tag(":::"), "ubuntu-24-04");
    }

    #[test]
    fn test_base_tag_long_inputs_stay_distinct() {
        let prefix = "registry.example.com/".repeat(8);
        let a = base_tag(&format!("{}a:1", prefix));
        let b = base_tag(&format!("{}b:1", prefix));
        assert!(a.len() <= MAX_TAG_LEN);
        assert!(b.len() <= MAX_TAG_LEN);
        assert_ne!(a, b);
        assert_eq!(a, base_tag(&format!("{}a:1", prefix)));
    }

    #[test]
    fn test_layer_set_tags() {
        let tmp = tempfile::tempdir().unwrap();
        let project = project_in(tmp.path(), SecurityMode::Online);
        let set = ImageLayerSet::for_project(&project);
        assert_eq!(set.base, "gatebox-l0:ubuntu-24-04");
        assert_eq!(set.agent_web, "gatebox-l1-web:ubuntu-24-04");
        assert_eq!(set.project_cli, "demo:l2-cli");
        assert_eq!(set.project_dev, "demo:l2-dev");
    }

    #[test]
    fn test_plan_full_rebuild_flags() {
        let tmp = tempfile::tempdir().unwrap();
        let project = project_in(tmp.path(), SecurityMode::Online);
        let set = ImageLayerSet::for_project(&project);
        let options = BuildOptions {
            scope: BuildScope::FullRebuild,
            include_dev: true,
        };
        let steps = plan(&project, &set, options, true, "hash", 42);

        let tags: Vec<&str> = steps.iter().map(|s| s.request.tag.as_str()).collect();
        assert_eq!(
            tags,
            vec![
                "gatebox-l0:ubuntu-24-04",
                "gatebox-l1-cli:ubuntu-24-04",
                "gatebox-l1-web:ubuntu-24-04",
                "demo:l2-cli",
                "demo:l2-web",
                "demo:l2-dev",
            ]
        );
        assert!(steps.iter().all(|s| s.request.no_cache));
        assert!(steps[0].request.pull_always);
        assert!(steps[1..].iter().all(|s| !s.request.pull_always));
        assert_eq!(
            steps[1].request.build_args.get("AGENT_CACHE_BUST").map(String::as_str),
            Some("42")
        );
        assert!(!steps[2].request.build_args.contains_key("AGENT_CACHE_BUST"));
        assert_eq!(steps[5].from, "gatebox-l0:ubuntu-24-04");
        assert!(steps[3..].iter().all(|s| {
            s.request.labels.get(freshness::CONTEXT_HASH_LABEL).map(String::as_str) == Some("hash")
        }));
    }

    #[test]
    fn test_l2_only_promotes_when_base_missing() {
        let tmp = tempfile::tempdir().unwrap();
        let project = project_with_dockerfiles(tmp.path());
        let engine = FakeEngine::new();

        let report = build(&engine, &project, BuildOptions::default(), &mut |_| {}).unwrap();
        assert!(report.promoted);
        assert_eq!(report.built.len(), 5);
        assert_eq!(engine.count("build "), 5);
    }

    #[test]
    fn test_l2_only_skips_existing_base_layers() {
        let tmp = tempfile::tempdir().unwrap();
        let project = project_with_dockerfiles(tmp.path());
        let engine = FakeEngine::new();
        let set = ImageLayerSet::for_project(&project);
        for tag in [&set.base, &set.agent_cli, &set.agent_web] {
            engine.add_image(tag, "sha256:base");
        }

        let report = build(&engine, &project, BuildOptions::default(), &mut |_| {}).unwrap();
        assert!(!report.promoted);
        assert_eq!(report.built, vec!["demo:l2-cli", "demo:l2-web"]);
        let builds = engine.builds();
        assert!(builds.iter().all(|b| !b.no_cache));
        assert!(
            builds
                .iter()
                .all(|b| b.labels.contains_key(freshness::CONTEXT_HASH_LABEL))
        );
    }

    #[test]
    fn test_missing_from_image_stops_the_run() {
        let tmp = tempfile::tempdir().unwrap();
        let project = project_in(tmp.path(), SecurityMode::Online);
        let set = ImageLayerSet::for_project(&project);
        let engine = FakeEngine::new();
        let steps = plan(&project, &set, BuildOptions::default(), false, "h", 0);

        let err = execute(&engine, &steps, &mut |_| {}).unwrap_err();
        assert!(matches!(err, EngineError::MissingBaseImage { .. }));
        assert_eq!(engine.count("build "), 0);
    }

    #[test]
    fn test_missing_dockerfiles() {
        let tmp = tempfile::tempdir().unwrap();
        let project = project_in(tmp.path(), SecurityMode::Online);
        let err = build(&FakeEngine::new(), &project, BuildOptions::default(), &mut |_| {})
            .unwrap_err();
        assert!(matches!(
            err,
            BuildError::Config(ConfigError::MissingDockerfiles(_))
        ));
    }
}
