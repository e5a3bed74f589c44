use std::collections::HashSet;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};

use crate::config::write_default_config;

pub const STATE_DIR_NAME: &str = ".sitepress";
pub const SOURCE_DIR_NAME: &str = "pages";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueSource {
    Flag,
    Env,
    Heuristic,
    Default,
}

impl ValueSource {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Flag => "flag",
            Self::Env => "env",
            Self::Heuristic => "heuristic",
            Self::Default => "default",
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct PathOverrides {
    pub project_root: Option<PathBuf>,
    pub source_dir: Option<PathBuf>,
    pub config: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct ResolutionContext {
    pub cwd: PathBuf,
}

impl ResolutionContext {
    pub fn from_process() -> Result<Self> {
        let cwd = env::current_dir().context("failed to read current directory")?;
        Ok(Self { cwd })
    }
}

#[derive(Debug, Clone)]
pub struct ResolvedPaths {
    pub project_root: PathBuf,
    pub source_dir: PathBuf,
    pub state_dir: PathBuf,
    pub payload_dir: PathBuf,
    pub config_path: PathBuf,
    pub root_source: ValueSource,
    pub source_source: ValueSource,
    pub config_source: ValueSource,
}

#[derive(Debug, Clone)]
pub struct RuntimeStatus {
    pub project_root_exists: bool,
    pub source_dir_exists: bool,
    pub state_dir_exists: bool,
    pub config_exists: bool,
    pub page_count: usize,
    pub warnings: Vec<String>,
}

impl ResolvedPaths {
    pub fn diagnostics(&self) -> String {
        format!(
            "project_root={} ({})\nsource_dir={} ({})\nstate_dir={}\npayload_dir={}\nconfig_path={} ({})",
            normalize_for_display(&self.project_root),
            self.root_source.as_str(),
            normalize_for_display(&self.source_dir),
            self.source_source.as_str(),
            normalize_for_display(&self.state_dir),
            normalize_for_display(&self.payload_dir),
            normalize_for_display(&self.config_path),
            self.config_source.as_str(),
        )
    }
}

pub fn inspect_runtime(paths: &ResolvedPaths) -> Result<RuntimeStatus> {
    let source_dir_exists = paths.source_dir.exists();
    let state_dir_exists = paths.state_dir.exists();
    let config_exists = paths.config_path.exists();
    let page_count = if source_dir_exists {
        crate::content::scan_pages(&paths.source_dir)
            .with_context(|| format!("failed to inspect {}", paths.source_dir.display()))?
            .len()
    } else {
        0
    };

    let mut warnings = Vec::new();
    if !source_dir_exists {
        warnings.push(format!(
            "{}/ is missing; run `sitepress init` or pass --source-dir",
            SOURCE_DIR_NAME
        ));
    }
    if !state_dir_exists {
        warnings.push(format!(
            "{STATE_DIR_NAME}/ is missing; run `sitepress init` before publishing"
        ));
    }
    if !config_exists {
        warnings.push("config file is missing; built-in defaults apply".to_string());
    }

    Ok(RuntimeStatus {
        project_root_exists: paths.project_root.exists(),
        source_dir_exists,
        state_dir_exists,
        config_exists,
        page_count,
        warnings,
    })
}

pub fn ensure_runtime_ready_for_publish(
    paths: &ResolvedPaths,
    status: &RuntimeStatus,
) -> Result<()> {
    if !status.source_dir_exists {
        bail!(
            "Source directory {} does not exist.\nRun: sitepress init --project-root {}",
            normalize_for_display(&paths.source_dir),
            normalize_for_display(&paths.project_root)
        );
    }
    Ok(())
}

#[derive(Debug, Clone)]
pub struct InitOptions {
    pub materialize_config: bool,
    pub force: bool,
}

impl Default for InitOptions {
    fn default() -> Self {
        Self {
            materialize_config: true,
            force: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct InitReport {
    pub created_dirs: Vec<PathBuf>,
    pub wrote_config: bool,
}

pub fn resolve_paths(
    context: &ResolutionContext,
    overrides: &PathOverrides,
) -> Result<ResolvedPaths> {
    resolve_paths_with_lookup(context, overrides, |key| env::var(key).ok())
}

fn resolve_paths_with_lookup<F>(
    context: &ResolutionContext,
    overrides: &PathOverrides,
    lookup_env: F,
) -> Result<ResolvedPaths>
where
    F: Fn(&str) -> Option<String>,
{
    let (project_root, root_source) = resolve_project_root(context, overrides, &lookup_env);
    let state_dir = project_root.join(STATE_DIR_NAME);

    let (source_dir, source_source) = pick(
        overrides.source_dir.as_deref(),
        lookup_env("SITEPRESS_SOURCE_DIR"),
        &project_root,
        || project_root.join(SOURCE_DIR_NAME),
    );
    let (config_path, config_source) = pick(
        overrides.config.as_deref(),
        lookup_env("SITEPRESS_CONFIG"),
        &project_root,
        || state_dir.join("config.toml"),
    );

    Ok(ResolvedPaths {
        payload_dir: state_dir.join("payloads"),
        project_root,
        source_dir,
        state_dir,
        config_path,
        root_source,
        source_source,
        config_source,
    })
}

pub fn init_layout(paths: &ResolvedPaths, options: &InitOptions) -> Result<InitReport> {
    let mut created_dirs = Vec::new();
    for dir in [&paths.source_dir, &paths.state_dir, &paths.payload_dir] {
        if !dir.exists() {
            fs::create_dir_all(dir).with_context(|| format!("failed to create {}", dir.display()))?;
            created_dirs.push(dir.clone());
        }
    }

    let wrote_config = if options.materialize_config {
        write_default_config(&paths.config_path, options.force)?
    } else {
        false
    };

    Ok(InitReport {
        created_dirs,
        wrote_config,
    })
}

fn pick<D>(
    flag: Option<&Path>,
    env_value: Option<String>,
    project_root: &Path,
    default: D,
) -> (PathBuf, ValueSource)
where
    D: FnOnce() -> PathBuf,
{
    if let Some(path) = flag {
        (absolutize(path, project_root), ValueSource::Flag)
    } else if let Some(value) = env_value.filter(|value| !value.trim().is_empty()) {
        (absolutize(Path::new(value.trim()), project_root), ValueSource::Env)
    } else {
        (default(), ValueSource::Default)
    }
}

fn resolve_project_root<F>(
    context: &ResolutionContext,
    overrides: &PathOverrides,
    lookup_env: &F,
) -> (PathBuf, ValueSource)
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(path) = overrides.project_root.as_deref() {
        return (absolutize(path, &context.cwd), ValueSource::Flag);
    }
    if let Some(value) = lookup_env("SITEPRESS_PROJECT_ROOT") {
        return (
            absolutize(Path::new(value.trim()), &context.cwd),
            ValueSource::Env,
        );
    }
    (detect_project_root(&context.cwd), ValueSource::Heuristic)
}

/// Nearest ancestor that already holds a state directory, else `cwd`.
fn detect_project_root(cwd: &Path) -> PathBuf {
    let mut seen = HashSet::new();
    for candidate in cwd.ancestors() {
        if !seen.insert(normalize_for_display(candidate)) {
            continue;
        }
        if candidate.join(STATE_DIR_NAME).is_dir() {
            return candidate.to_path_buf();
        }
    }
    cwd.to_path_buf()
}

fn absolutize(path: &Path, base: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}

pub fn normalize_for_display(path: &Path) -> String {
    path.to_string_lossy().replace('\\', "/")
}
