//! End-to-end builds with in-process services.

use crate::config::{BuildConfig, PackageBuilderConfig};
use crate::declaration::BuildDeclaration;
use crate::errors::{BuildError, ErrorKind};
use crate::events::{CollectingEventSink, EventSink};
use crate::fetch::ArtifactFetcher;
use crate::image::permissions::audit_group_access;
use crate::image::Launcher;
use crate::runner::BuildRunner;
use crate::package::{host_references, CommandPackageBuilder, PackageBuilder};
use crate::stages::BuildServices;
use crate::testing::{RecordingPackageManager, ScriptedPackageBuilder, StaticFetcher, UnreachableFetcher};
use flate2::read::GzDecoder;
use pretty_assertions::assert_eq;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

const MODEL_URL: &str = "https://assets.example/models/assistant-large.tar.gz";
const MODEL: &[u8] = b"opaque model weights";

struct Harness {
    tmp: tempfile::TempDir,
    manager: Arc<RecordingPackageManager>,
    fetcher: Arc<dyn ArtifactFetcher>,
    package_builder: Arc<dyn PackageBuilder>,
    sink: Arc<CollectingEventSink>,
}

impl Harness {
    fn new() -> Self {
        Self::with_fetcher(Arc::new(StaticFetcher::new().with_asset(MODEL_URL, MODEL)))
    }

    fn with_fetcher(fetcher: Arc<dyn ArtifactFetcher>) -> Self {
        let tmp = tempfile::tempdir().unwrap();
        let context = tmp.path().join("context");
        fs::create_dir_all(&context).unwrap();
        fs::write(context.join("config.yml"), b"language: en\npipeline: supervised\n").unwrap();
        Self {
            tmp,
            manager: Arc::new(RecordingPackageManager::new()),
            fetcher,
            package_builder: Arc::new(ScriptedPackageBuilder::new()),
            sink: Arc::new(CollectingEventSink::new()),
        }
    }

    fn with_manager(mut self, manager: RecordingPackageManager) -> Self {
        self.manager = Arc::new(manager);
        self
    }

    fn with_package_builder(mut self, builder: impl PackageBuilder + 'static) -> Self {
        self.package_builder = Arc::new(builder);
        self
    }

    fn config(&self) -> BuildConfig {
        BuildConfig::default()
            .with_work_dir(self.tmp.path().join("work"))
            .with_output_dir(self.tmp.path().join("images"))
    }

    fn runner(&self) -> BuildRunner {
        BuildRunner::new(self.config()).with_services(BuildServices {
            package_manager: self.manager.clone(),
            fetcher: self.fetcher.clone(),
            package_builder: self.package_builder.clone(),
            sink: self.sink.clone() as Arc<dyn EventSink>,
        })
    }

    fn declaration(&self, toml: &str) -> BuildDeclaration {
        let mut decl = BuildDeclaration::from_toml_str(toml).unwrap();
        decl.context = Some(self.tmp.path().join("context"));
        decl
    }

    fn image_dir(&self) -> PathBuf {
        self.tmp.path().join("images/assistant")
    }
}

/// The three-stage service pipeline; `builder_tools` are build-only
/// packages of the builder stage.
fn service_pipeline(builder_tools: &[&str]) -> String {
    let tools: Vec<String> = builder_tools.iter().map(|t| format!("\"{t}\"")).collect();
    format!(
        r#"
name = "assistant"
target = "runner"

[[stage]]
name = "base"
base = {{ image = "python:3.7-slim" }}

[[stage.steps]]
op = "install"
packages = ["libpq5", "curl"]
tier = "build_and_run"

[[stage.steps]]
op = "env"
key = "PATH"
value = "/opt/venv/bin:$PATH"

[[stage]]
name = "builder"
base = {{ stage = "base" }}
outputs = ["/opt/venv", "/build"]

[[stage.steps]]
op = "install"
packages = [{tools}]
tier = "build_only"

[[stage.steps]]
op = "fetch"
url = "{MODEL_URL}"
dest = "/build/model.tar.gz"

[[stage.steps]]
op = "package"
prefix = "/opt/venv"
package = "assistant"
extras = ["spacy", "transformers"]

[[stage]]
name = "runner"
base = {{ stage = "base" }}

[[stage.steps]]
op = "copy_from"
stage = "builder"
src = "/opt/venv"
dest = "/opt/venv"

[[stage.steps]]
op = "copy_from"
stage = "builder"
src = "/build/model.tar.gz"
dest = "/app/models/model.tar.gz"

[[stage.steps]]
op = "copy"
src = "config.yml"
dest = "/app/config.yml"

[[stage.steps]]
op = "workdir"
path = "/app"

[[stage.steps]]
op = "volume"
path = "/tmp"

[[stage.steps]]
op = "expose"
port = 5005

[[stage.steps]]
op = "normalize_permissions"
path = "/app"

[[stage.steps]]
op = "user"
uid = 1001
gid = 0

[[stage.steps]]
op = "entrypoint"
exec = "assistant"
default_args = ["--help"]
"#,
        tools = tools.join(", ")
    )
}

#[tokio::test]
async fn test_full_build_produces_runnable_image() {
    let h = Harness::new();
    let decl = h.declaration(&service_pipeline(&["build-essential", "gcc"]));

    let report = h.runner().build(&decl).await.unwrap();
    let image = &report.image;

    assert_eq!(report.stages, vec!["base", "builder", "runner"]);
    assert_eq!(image.dir(), h.image_dir());
    assert_eq!(image.config().target_stage, "runner");
    assert_eq!(image.config().exposed_ports[0].to_string(), "5005/tcp");
    assert_eq!(image.config().volumes, vec![PathBuf::from("/tmp")]);
    assert_eq!(image.runtime().search_path()[0], "/opt/venv/bin");
    assert_eq!(image.config().environments[0].prefix, PathBuf::from("/opt/venv"));
    assert!(report.instructions.iter().all(|r| r.status == crate::core::StageStatus::Ok));

    let types = h.sink.event_types();
    assert_eq!(types.first().map(String::as_str), Some("build.started"));
    assert_eq!(types.last().map(String::as_str), Some("image.finalized"));

    // Work directories do not outlive the build.
    assert_eq!(fs::read_dir(h.tmp.path().join("work")).unwrap().count(), 0);
}

#[tokio::test]
async fn test_cycle_fails_before_any_install() {
    let h = Harness::new();
    let decl = h.declaration(
        r#"
name = "assistant"

[[stage]]
name = "base"
base = { stage = "runner" }

[[stage.steps]]
op = "install"
packages = ["libpq5"]
tier = "build_and_run"

[[stage]]
name = "runner"
base = { stage = "base" }
"#,
    );

    let err = h.runner().build(&decl).await.unwrap_err();

    assert_eq!(err.kind(), ErrorKind::GraphValidation);
    assert!(err.to_string().contains("base"));
    assert!(h.manager.calls().is_empty());
    assert!(!h.tmp.path().join("work").exists());
    assert!(h.sink.is_empty());
}

#[tokio::test]
async fn test_cross_stage_copies_are_byte_identical_across_builds() {
    let h = Harness::new();
    let decl = h.declaration(&service_pipeline(&["build-essential"]));

    let first = h.runner().build(&decl).await.unwrap();
    let first_model = fs::read(first.image.rootfs().join("app/models/model.tar.gz")).unwrap();
    let first_entry = fs::read(first.image.rootfs().join("opt/venv/bin/assistant")).unwrap();
    let first_artifacts = first.image.config().artifacts.clone();

    let second = h.runner().build(&decl).await.unwrap();
    let second_model = fs::read(second.image.rootfs().join("app/models/model.tar.gz")).unwrap();
    let second_entry = fs::read(second.image.rootfs().join("opt/venv/bin/assistant")).unwrap();

    assert_eq!(first_model, MODEL);
    assert_eq!(first_model, second_model);
    assert_eq!(first_entry, second_entry);
    assert_eq!(first_artifacts, second.image.config().artifacts);
    assert_eq!(first.image.config().layer.digest, second.image.config().layer.digest);
}

#[tokio::test]
async fn test_build_only_dependencies_absent_from_image() {
    let h = Harness::new();
    let decl = h.declaration(&service_pipeline(&["build-essential", "gcc"]));

    let report = h.runner().build(&decl).await.unwrap();

    assert_eq!(report.image.dependencies().to_vec(), vec!["curl".to_string(), "libpq5".to_string()]);
    let marker_dir = report.image.rootfs().join("var/lib/stagebuild/installed");
    assert!(marker_dir.join("libpq5").is_file());
    assert!(!marker_dir.join("gcc").exists());
    assert!(!marker_dir.join("build-essential").exists());
}

#[tokio::test]
async fn test_build_only_changes_keep_dependency_manifest() {
    let h = Harness::new();

    let before = h
        .runner()
        .build(&h.declaration(&service_pipeline(&["build-essential"])))
        .await
        .unwrap();
    let after = h
        .runner()
        .build(&h.declaration(&service_pipeline(&["build-essential", "gfortran", "cmake"])))
        .await
        .unwrap();

    assert_eq!(before.image.dependencies(), after.image.dependencies());
}

#[tokio::test]
async fn test_application_tree_is_group_accessible() {
    let h = Harness::new();
    let report = h
        .runner()
        .build(&h.declaration(&service_pipeline(&["build-essential"])))
        .await
        .unwrap();
    let image = &report.image;

    assert_eq!(image.runtime().uid(), 1001);
    assert_eq!(image.runtime().gid(), 0);
    assert!(audit_group_access(&image.rootfs().join("app")).unwrap().is_empty());

    let layer = fs::File::open(image.dir().join(&image.config().layer.file)).unwrap();
    let mut archive = tar::Archive::new(GzDecoder::new(layer));
    let mut app_entries = 0;
    for entry in archive.entries().unwrap() {
        let entry = entry.unwrap();
        let header = entry.header();
        assert_eq!(header.gid().unwrap(), 0);
        if entry.path().unwrap().starts_with("app") {
            let mode = header.mode().unwrap();
            assert_eq!((mode >> 3) & 0o7, (mode >> 6) & 0o7);
            app_entries += 1;
        }
    }
    assert!(app_entries >= 4);
}

#[tokio::test]
async fn test_entrypoint_defaults_and_pass_through() {
    let h = Harness::new();
    let report = h
        .runner()
        .build(&h.declaration(&service_pipeline(&["build-essential"])))
        .await
        .unwrap();
    let launcher = Launcher::new(&report.image);

    let out = launcher.output(&[]).await.unwrap();
    assert_eq!(out.exit_code, 0);
    assert!(out.stdout.starts_with("usage: assistant"));

    let out = launcher.output(&["frobnicate".to_string()]).await.unwrap();
    assert_ne!(out.exit_code, 0);
    assert!(out.stderr.contains("unknown command 'frobnicate'"));
    assert_eq!(launcher.run(&["frobnicate".to_string()]).await.unwrap(), 2);

    let out = launcher
        .output(&["run".to_string(), "--enable-api".to_string()])
        .await
        .unwrap();
    assert_eq!(out.exit_code, 0);
    assert_eq!(out.stdout.trim(), "assistant:run --enable-api");
}

/// Writes a console script the way installers do: with the absolute
/// interpreter path of the environment in its shebang.
const CONSOLE_SCRIPT: &str = r##"
import os, sys
prefix = sys.argv[1]
path = os.path.join(prefix, "bin", "assistant")
with open(path, "w") as f:
    f.write("#!" + os.path.join(prefix, "bin", "python") + "\n")
    f.write("import sys\nprint('assistant:' + ' '.join(sys.argv[1:]))\n")
os.chmod(path, 0o755)
"##;

fn python_available() -> bool {
    std::process::Command::new("python3")
        .args(["-c", "import venv"])
        .output()
        .map(|out| out.status.success())
        .unwrap_or(false)
}

#[tokio::test]
async fn test_environment_is_addressed_at_image_prefix() {
    if !python_available() {
        return;
    }
    let h = Harness::new().with_package_builder(CommandPackageBuilder::new(&PackageBuilderConfig {
        create: ["python3", "-m", "venv", "--without-pip", "{prefix}"].map(String::from).to_vec(),
        install: vec!["{prefix}/bin/python".into(), "-c".into(), CONSOLE_SCRIPT.into(), "{prefix}".into()],
    }));

    let report = h
        .runner()
        .build(&h.declaration(&service_pipeline(&["build-essential"])))
        .await
        .unwrap();
    let venv = report.image.rootfs().join("opt/venv");

    assert!(host_references(&venv, &h.tmp.path().join("work")).unwrap().is_empty());
    assert!(fs::read_to_string(venv.join("bin/activate")).unwrap().contains("/opt/venv"));
    let script = fs::read_to_string(venv.join("bin/assistant")).unwrap();
    assert_eq!(script.lines().next(), Some("#!/opt/venv/bin/python"));

    let out = Launcher::new(&report.image).output(&["run".to_string()]).await.unwrap();
    assert_eq!(out.stdout.trim(), "assistant:run", "{}", out.stderr);
}

#[tokio::test]
async fn test_unreachable_fetch_fails_before_finalization() {
    let h = Harness::with_fetcher(Arc::new(UnreachableFetcher));

    let err = h
        .runner()
        .build(&h.declaration(&service_pipeline(&["build-essential"])))
        .await
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::ArtifactFetch);
    assert_eq!(err.stage(), Some("builder"));
    assert!(!h.image_dir().exists());
    assert_eq!(h.sink.events_of_type("build.failed").len(), 1);
    assert!(h.sink.events_of_type("image.finalized").is_empty());
    assert_eq!(fs::read_dir(h.tmp.path().join("work")).unwrap().count(), 0);
}

#[tokio::test]
async fn test_unresolvable_package_aborts_build() {
    let h = Harness::new().with_manager(RecordingPackageManager::new().with_available(["curl", "build-essential"]));

    let err = h
        .runner()
        .build(&h.declaration(&service_pipeline(&["build-essential"])))
        .await
        .unwrap_err();

    match err {
        BuildError::DependencyInstall { stage, step, packages, .. } => {
            assert_eq!(stage, "base");
            assert_eq!(step, 0);
            assert!(packages.contains(&"libpq5".to_string()));
        }
        other => panic!("unexpected error: {other}"),
    }
    assert!(!h.image_dir().exists());
}

#[tokio::test]
async fn test_fetch_in_runtime_lineage_is_rejected() {
    let h = Harness::new();
    let decl = h.declaration(&format!(
        r#"
name = "assistant"

[[stage]]
name = "base"
base = {{ image = "python:3.7-slim" }}

[[stage.steps]]
op = "fetch"
url = "{MODEL_URL}"
dest = "/app/model.tar.gz"

[[stage]]
name = "runner"
base = {{ stage = "base" }}
"#
    ));

    let err = h.runner().validate(&decl).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::GraphValidation);
    assert!(matches!(&err, BuildError::Validation(e) if e.code() == Some(crate::errors::codes::RUNTIME_LEAK)));
    assert!(h.manager.calls().is_empty());
}
