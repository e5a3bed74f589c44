use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;

use anyhow::{Context, Result};
use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::args::quote_token;
use crate::cache::{ResourceCache, normalize_key};
use crate::config::{
    DEFAULT_PAGES_LIBRARY, DEFAULT_PAGES_LIST_TITLE, DEFAULT_PROTECTED_FOLDERS, SiteConfig,
};
use crate::exec::{ExecError, ExecOutput, ExecutionEngine, Invocation, ProcessRunner};
use crate::files::rel_url;
use crate::remote::{FileInfo, ListInfo, ListItem, PageInfo, PageTemplate, parse_output};

/// Client-side web part that renders markdown bodies.
pub const MARKDOWN_WEBPART_ID: &str = "1ef5ed11-ce7b-44be-bc5e-4abd55101d16";
pub const DEFAULT_LAYOUT: &str = "Article";
pub const DEFAULT_PAGE_SUFFIX: &str = ".aspx";

const NOT_FOUND_MARKERS: &[&str] = &["not found", "404", "does not exist", "cannot find"];

/// How a failed existence probe is read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExistencePolicy {
    /// Any probe failure means the page is absent.
    #[default]
    Lenient,
    /// Only failures that say so mean absent; anything else propagates.
    Strict,
}

#[derive(Debug, Clone)]
pub struct RunOptions {
    pub retry: bool,
    pub continue_on_error: bool,
    pub skip_existing_pages: bool,
    pub existence_policy: ExistencePolicy,
    pub protected_folders: Vec<String>,
    pub page_suffix: String,
    pub payload_dir: PathBuf,
    pub pages_library: String,
    pub pages_list_title: String,
    pub markdown_webpart_id: String,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            retry: true,
            continue_on_error: false,
            skip_existing_pages: false,
            existence_policy: ExistencePolicy::Lenient,
            protected_folders: DEFAULT_PROTECTED_FOLDERS
                .iter()
                .map(|name| (*name).to_string())
                .collect(),
            page_suffix: DEFAULT_PAGE_SUFFIX.to_string(),
            payload_dir: std::env::temp_dir().join("sitepress"),
            pages_library: DEFAULT_PAGES_LIBRARY.to_string(),
            pages_list_title: DEFAULT_PAGES_LIST_TITLE.to_string(),
            markdown_webpart_id: MARKDOWN_WEBPART_ID.to_string(),
        }
    }
}

impl RunOptions {
    pub fn from_config(config: &SiteConfig, payload_dir: PathBuf) -> Self {
        Self {
            retry: config.retry(),
            continue_on_error: config.continue_on_error(),
            skip_existing_pages: config.skip_existing_pages(),
            existence_policy: if config.strict_existence() {
                ExistencePolicy::Strict
            } else {
                ExistencePolicy::Lenient
            },
            protected_folders: config.protected_folders(),
            payload_dir,
            pages_library: config.pages_library().to_string(),
            pages_list_title: config.pages_list_title().to_string(),
            ..Self::default()
        }
    }
}

/// Requested page attributes. `None` leaves the remote value alone.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PageAttributes {
    pub title: Option<String>,
    pub layout: Option<String>,
    pub comments_disabled: Option<bool>,
    pub description: Option<String>,
    pub template: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EnsureAction {
    /// Known from this run or the initial listing; nothing was sent.
    Cached,
    Unchanged,
    Updated,
    Created,
}

impl EnsureAction {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Cached => "cached",
            Self::Unchanged => "unchanged",
            Self::Updated => "updated",
            Self::Created => "created",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EnsureOutcome {
    pub existed: bool,
    pub id: Option<i64>,
    pub action: EnsureAction,
}

impl EnsureOutcome {
    fn cached(id: Option<i64>) -> Self {
        Self {
            existed: true,
            id,
            action: EnsureAction::Cached,
        }
    }
}

enum Probe {
    Found(Box<PageInfo>),
    Missing,
}

/// One publish run against one site. Owns the engine and every cache the
/// run builds up, so independent runs never share state.
pub struct PublishRun<R: ProcessRunner> {
    engine: ExecutionEngine<R>,
    cache: ResourceCache,
    options: RunOptions,
}

impl<R: ProcessRunner> PublishRun<R> {
    pub fn new(engine: ExecutionEngine<R>, options: RunOptions) -> Self {
        Self {
            engine,
            cache: ResourceCache::new(),
            options,
        }
    }

    pub fn engine(&self) -> &ExecutionEngine<R> {
        &self.engine
    }

    pub fn cache(&self) -> &ResourceCache {
        &self.cache
    }

    pub fn options(&self) -> &RunOptions {
        &self.options
    }

    pub(crate) fn cache_mut(&mut self) -> &mut ResourceCache {
        &mut self.cache
    }

    pub(crate) fn run(&self, command: &str, retry: bool) -> Result<ExecOutput, ExecError> {
        self.engine
            .execute(&Invocation::parse(command).retryable(retry))
    }

    pub(crate) fn retry(&self) -> bool {
        self.options.retry
    }

    pub(crate) fn listing_scope(&self, web_url: &str) -> String {
        rel_url(web_url, &self.options.pages_library)
    }

    pub(crate) fn page_url(&self, web_url: &str, slug: &str) -> String {
        rel_url(web_url, &format!("{}/{slug}", self.options.pages_library))
    }

    /// Fetch the page listing once for the rest of the run.
    pub fn load_pages(&mut self, web_url: &str) -> Result<usize> {
        let list_id = self.pages_list_id(web_url)?;
        let scope = self.listing_scope(web_url);
        let engine = &self.engine;
        let retry = self.options.retry;
        let items = self.cache.cached_listing(&scope, || {
            let Some(list_id) = list_id else {
                debug!(web_url, "pages list not resolved, starting from an empty listing");
                return Ok(Vec::new());
            };
            let command = format!(
                "spo listitem list --webUrl {} --id {} --fields \"ID,Title,FileRef\" -o json",
                quote_token(web_url),
                quote_token(&list_id)
            );
            let output = engine.execute(&Invocation::parse(&command).retryable(retry))?;
            Ok(parse_output::<Vec<ListItem>>(&output, "listitem list")?.unwrap_or_default())
        })?;
        info!(web_url, pages = items.len(), "loaded existing pages");
        Ok(items.len())
    }

    pub fn pages_list_id(&mut self, web_url: &str) -> Result<Option<String>> {
        let command = format!(
            "spo list get --webUrl {} --title {} -o json",
            quote_token(web_url),
            quote_token(&self.options.pages_list_title)
        );
        let engine = &self.engine;
        let retry = self.options.retry;
        self.cache
            .cached_list_id(web_url, || {
                let output = engine.execute(&Invocation::parse(&command).retryable(retry))?;
                Ok(parse_output::<ListInfo>(&output, "list get")?.map(|list| list.id))
            })
            .context("failed to resolve the site pages list")
    }

    /// Make sure the page exists with the requested attributes.
    ///
    /// Existing pages only get the attributes that differ; missing pages are
    /// created from `template` when the site has one by that name, otherwise
    /// with defaults. Every successful path records the slug as processed.
    pub fn ensure_page(
        &mut self,
        web_url: &str,
        slug: &str,
        attributes: &PageAttributes,
    ) -> Result<EnsureOutcome> {
        if self.options.skip_existing_pages {
            if self.cache.is_processed(slug) {
                debug!(slug, "page already handled in this run");
                return Ok(EnsureOutcome::cached(self.cache.processed_id(slug)));
            }
            if let Some(id) = self.listed_page_id(web_url, slug) {
                debug!(slug, id, "page present in listing, skipping");
                self.cache.record_processed(slug, Some(id));
                return Ok(EnsureOutcome::cached(Some(id)));
            }
        }

        match self.probe_page(web_url, slug)? {
            Probe::Found(page) => {
                let id = page.item_id();
                self.cache.record_processed(slug, id);

                let changes = metadata_changes(&page, attributes);
                if changes.is_empty() {
                    debug!(slug, "page metadata up to date");
                    return Ok(EnsureOutcome {
                        existed: true,
                        id,
                        action: EnsureAction::Unchanged,
                    });
                }

                let command = format!(
                    "spo page set --webUrl {} --name {} {}",
                    quote_token(web_url),
                    quote_token(slug),
                    changes.join(" ")
                );
                self.run(&command, self.retry())
                    .with_context(|| format!("failed to update page {slug}"))?;
                info!(slug, fields = changes.len(), "updated page metadata");
                Ok(EnsureOutcome {
                    existed: true,
                    id,
                    action: EnsureAction::Updated,
                })
            }
            Probe::Missing => self.create_page(web_url, slug, attributes),
        }
    }

    fn create_page(
        &mut self,
        web_url: &str,
        slug: &str,
        attributes: &PageAttributes,
    ) -> Result<EnsureOutcome> {
        let segments: Vec<String> = slug.split('/').map(str::to_string).collect();
        if segments.len() > 1 {
            let library = self.options.pages_library.clone();
            self.ensure_folders(web_url, &library, &segments[..segments.len() - 1])
                .with_context(|| format!("failed to create folders for {slug}"))?;
        }

        if let Some(template) = attributes.template.as_deref() {
            if let Some(source) = self.find_template(web_url, template)? {
                self.copy_template(web_url, &source, slug)?;
                info!(slug, template, "created page from template");
                let without_template = PageAttributes {
                    template: None,
                    ..attributes.clone()
                };
                return self.ensure_page(web_url, slug, &without_template);
            }
            warn!(
                template,
                slug, "template not found on the site, creating a default page instead"
            );
        }

        let title = attributes.title.as_deref().unwrap_or(slug);
        let layout = attributes.layout.as_deref().unwrap_or(DEFAULT_LAYOUT);
        let mut command = format!(
            "spo page add --webUrl {} --name {} --title {} --layoutType {}",
            quote_token(web_url),
            quote_token(slug),
            quote_token(title),
            quote_token(layout)
        );
        if !attributes.comments_disabled.unwrap_or(false) {
            command.push_str(" --commentsEnabled");
        }
        if let Some(description) = attributes
            .description
            .as_deref()
            .filter(|text| !text.is_empty())
        {
            command.push_str(&format!(" --description {}", quote_token(description)));
        }
        self.run(&command, self.retry())
            .with_context(|| format!("failed to create page {slug}"))?;

        self.cache.record_processed(slug, None);
        info!(slug, "created page");
        Ok(EnsureOutcome {
            existed: false,
            id: None,
            action: EnsureAction::Created,
        })
    }

    fn probe_page(&self, web_url: &str, slug: &str) -> Result<Probe> {
        let command = format!(
            "spo page get --webUrl {} --name {} --metadataOnly --output json",
            quote_token(web_url),
            quote_token(slug)
        );
        match self.run(&command, false) {
            Ok(output) => Ok(match parse_output::<PageInfo>(&output, "page get")? {
                Some(page) => Probe::Found(Box::new(page)),
                None => Probe::Missing,
            }),
            Err(error) => match self.options.existence_policy {
                ExistencePolicy::Lenient => {
                    debug!(slug, error = %error, "page probe failed, treating as missing");
                    Ok(Probe::Missing)
                }
                ExistencePolicy::Strict if looks_like_not_found(&error) => Ok(Probe::Missing),
                ExistencePolicy::Strict => Err(anyhow::Error::new(error)
                    .context(format!("failed to check whether page {slug} exists"))),
            },
        }
    }

    fn listed_page_id(&self, web_url: &str, slug: &str) -> Option<i64> {
        let wanted = normalize_key(&self.page_url(web_url, slug));
        self.cache
            .listing(&self.listing_scope(web_url))?
            .iter()
            .find(|item| {
                item.file_ref
                    .as_deref()
                    .is_some_and(|file_ref| normalize_key(file_ref) == wanted)
            })
            .map(|item| item.id)
    }

    fn find_template(&self, web_url: &str, name: &str) -> Result<Option<String>> {
        let command = format!(
            "spo page template list --webUrl {} --output json",
            quote_token(web_url)
        );
        let output = self
            .run(&command, self.retry())
            .context("failed to list page templates")?;
        let templates =
            parse_output::<Vec<PageTemplate>>(&output, "page template list")?.unwrap_or_default();
        debug!(count = templates.len(), "page templates");

        let library_prefix = format!("{}/", normalize_key(&self.options.pages_library));
        Ok(templates
            .into_iter()
            .find(|template| template.title.as_deref() == Some(name))
            .and_then(|template| template.url)
            .map(|url| normalize_key(&url).replacen(&library_prefix, "", 1)))
    }

    fn copy_template(&self, web_url: &str, source: &str, slug: &str) -> Result<()> {
        let copy = format!(
            "spo page copy --webUrl {} --sourceName {} --targetUrl {}",
            quote_token(web_url),
            quote_token(source),
            quote_token(slug)
        );
        self.run(&copy, self.retry())
            .with_context(|| format!("failed to copy template {source} to {slug}"))?;
        let publish = format!(
            "spo page set --webUrl {} --name {} --publish",
            quote_token(web_url),
            quote_token(slug)
        );
        self.run(&publish, self.retry())
            .with_context(|| format!("failed to publish the copy at {slug}"))?;
        Ok(())
    }

    /// Raw `canvasContentJson` of the page, `[]` when it has none.
    pub fn page_controls(&self, web_url: &str, slug: &str) -> Result<String> {
        debug!(slug, "reading page controls");
        let command = format!(
            "spo page get --webUrl {} --name {} --output json",
            quote_token(web_url),
            quote_token(slug)
        );
        let output = self
            .run(&command, self.retry())
            .with_context(|| format!("failed to read page {slug}"))?;
        Ok(parse_output::<PageInfo>(&output, "page get")?
            .and_then(|page| page.canvas_content_json)
            .filter(|canvas| !canvas.trim().is_empty())
            .unwrap_or_else(|| "[]".to_string()))
    }

    pub fn ensure_default_section(&self, web_url: &str, slug: &str) -> Result<()> {
        debug!(slug, "ensuring default section");
        let command = format!(
            "spo page section add --webUrl {} --pageName {} --sectionTemplate OneColumn",
            quote_token(web_url),
            quote_token(slug)
        );
        self.run(&command, self.retry())
            .with_context(|| format!("failed to add a section to {slug}"))?;
        Ok(())
    }

    /// Push the body payload, updating `control_id` in place when given and
    /// adding a new markdown web part otherwise.
    pub fn set_page_body(
        &self,
        web_url: &str,
        slug: &str,
        control_id: Option<&str>,
        payload: &str,
    ) -> Result<()> {
        let payload_path = self.write_payload(payload)?;
        let data = format!("@{}", payload_path.display());
        let command = match control_id {
            Some(id) => format!(
                "spo page control set --webUrl {} --pageName {} --id {} --webPartData {}",
                quote_token(web_url),
                quote_token(slug),
                quote_token(id),
                quote_token(&data)
            ),
            None => format!(
                "spo page clientsidewebpart add --webUrl {} --pageName {} --webPartId {} --webPartData {}",
                quote_token(web_url),
                quote_token(slug),
                quote_token(&self.options.markdown_webpart_id),
                quote_token(&data)
            ),
        };
        self.run(&command, self.retry())
            .with_context(|| format!("failed to set the body of {slug}"))?;
        debug!(slug, control = ?control_id, "page body set");
        Ok(())
    }

    fn write_payload(&self, payload: &str) -> Result<PathBuf> {
        let dir = &self.options.payload_dir;
        fs::create_dir_all(dir).with_context(|| format!("failed to create {}", dir.display()))?;
        let digest = Sha256::digest(payload.as_bytes());
        let name: String = digest.iter().map(|byte| format!("{byte:02x}")).collect();
        let path = dir.join(format!("{name}.json"));
        if !path.exists() {
            fs::write(&path, payload)
                .with_context(|| format!("failed to write {}", path.display()))?;
        }
        Ok(path)
    }

    /// List item id of the page: from this run if known, otherwise probed.
    pub fn page_id(&mut self, web_url: &str, slug: &str) -> Result<Option<i64>> {
        if let Some(id) = self.cache.processed_id(slug) {
            return Ok(Some(id));
        }
        let command = format!(
            "spo page get --webUrl {} --name {} --metadataOnly --output json",
            quote_token(web_url),
            quote_token(slug)
        );
        let output = self
            .run(&command, self.retry())
            .with_context(|| format!("failed to read page {slug}"))?;
        let id = parse_output::<PageInfo>(&output, "page get")?.and_then(|page| page.item_id());
        if let Some(id) = id {
            self.cache.record_processed(slug, Some(id));
        }
        Ok(id)
    }

    pub fn set_page_metadata(
        &mut self,
        web_url: &str,
        slug: &str,
        fields: &BTreeMap<String, String>,
    ) -> Result<()> {
        if fields.is_empty() {
            return Ok(());
        }
        let Some(mut command) = self.list_item_command(web_url, slug)? else {
            debug!(slug, "page id unknown, skipping metadata");
            return Ok(());
        };
        for (field, value) in fields {
            command.push_str(&format!(" --{field} {}", quote_token(value)));
        }
        self.run(&command, self.retry())
            .with_context(|| format!("failed to set metadata on {slug}"))?;
        debug!(slug, fields = fields.len(), "page metadata set");
        Ok(())
    }

    pub fn set_page_description(
        &mut self,
        web_url: &str,
        slug: &str,
        description: &str,
    ) -> Result<()> {
        let Some(mut command) = self.list_item_command(web_url, slug)? else {
            debug!(slug, "page id unknown, skipping description");
            return Ok(());
        };
        command.push_str(&format!(
            " --Description {} --systemUpdate",
            quote_token(description)
        ));
        self.run(&command, self.retry())
            .with_context(|| format!("failed to set the description of {slug}"))?;
        Ok(())
    }

    fn list_item_command(&mut self, web_url: &str, slug: &str) -> Result<Option<String>> {
        let Some(page_id) = self.page_id(web_url, slug)? else {
            return Ok(None);
        };
        let Some(list_id) = self.pages_list_id(web_url)? else {
            return Ok(None);
        };
        Ok(Some(format!(
            "spo listitem set --listId {} --id {page_id} --webUrl {}",
            quote_token(&list_id),
            quote_token(web_url)
        )))
    }

    /// Check the page in if someone holds it, then publish.
    pub fn publish_page(&self, web_url: &str, slug: &str) -> Result<()> {
        let relative = self.page_url(web_url, slug);
        if self.checkout_held(web_url, &relative) {
            let command = format!(
                "spo file checkin --webUrl {} --url {}",
                quote_token(web_url),
                quote_token(&relative)
            );
            if let Err(error) = self.run(&command, false) {
                warn!(url = %relative, error = %error, "page check-in skipped");
            }
        } else {
            debug!(url = %relative, "no pending checkout, skipping check-in");
        }

        let command = format!(
            "spo page set --name {} --webUrl {} --publish",
            quote_token(slug),
            quote_token(web_url)
        );
        self.run(&command, self.retry())
            .with_context(|| format!("failed to publish {slug}"))?;
        info!(slug, "published page");
        Ok(())
    }

    fn checkout_held(&self, web_url: &str, relative: &str) -> bool {
        let command = format!(
            "spo file get --webUrl {} --url {} -o json",
            quote_token(web_url),
            quote_token(relative)
        );
        let info = self
            .run(&command, self.retry())
            .map_err(anyhow::Error::new)
            .and_then(|output| parse_output::<FileInfo>(&output, "file get"));
        match info {
            Ok(Some(info)) => info.checkout_held(),
            Ok(None) => false,
            Err(error) => {
                debug!(
                    url = relative,
                    error = %format!("{error:#}"),
                    "unable to determine checkout status"
                );
                false
            }
        }
    }
}

/// `page set` flags for the requested attributes that differ from `page`.
pub fn metadata_changes(page: &PageInfo, desired: &PageAttributes) -> Vec<String> {
    let mut changes = Vec::new();
    if let Some(title) = desired.title.as_deref()
        && page.title.as_deref() != Some(title)
    {
        changes.push(format!("--title {}", quote_token(title)));
    }
    if let Some(description) = desired.description.as_deref().filter(|text| !text.is_empty())
        && page.description.as_deref() != Some(description)
    {
        changes.push(format!("--description {}", quote_token(description)));
    }
    if let Some(layout) = desired.layout.as_deref()
        && page.layout_type.as_deref() != Some(layout)
    {
        changes.push(format!("--layoutType {}", quote_token(layout)));
    }
    if let Some(disabled) = desired.comments_disabled
        && page.comments_disabled != Some(disabled)
    {
        let enabled = if disabled { "false" } else { "true" };
        changes.push(format!("--commentsEnabled {enabled}"));
    }
    changes
}

/// Id of the first control on the canvas that hosts `webpart_id`.
pub fn markdown_control_id(canvas: &str, webpart_id: &str) -> Option<String> {
    let controls: Vec<Value> = match serde_json::from_str(canvas) {
        Ok(controls) => controls,
        Err(error) => {
            warn!(error = %error, "page canvas is not a control list");
            return None;
        }
    };
    controls.iter().find_map(|control| {
        let hosted = control
            .get("webPartId")
            .or_else(|| control.get("webPartData").and_then(|data| data.get("id")))
            .and_then(Value::as_str)?;
        if !hosted.eq_ignore_ascii_case(webpart_id) {
            return None;
        }
        control.get("id").and_then(Value::as_str).map(str::to_string)
    })
}

fn looks_like_not_found(error: &ExecError) -> bool {
    let text = format!("{} {}", error.message(), error.cause().unwrap_or_default()).to_lowercase();
    NOT_FOUND_MARKERS.iter().any(|marker| text.contains(marker))
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::time::Duration;

    use serde_json::json;
    use tempfile::tempdir;

    use super::{
        EnsureAction, ExistencePolicy, PageAttributes, PublishRun, RunOptions,
        markdown_control_id, metadata_changes,
    };
    use crate::exec::ExecutionEngine;
    use crate::remote::PageInfo;
    use crate::test_support::{Reply, ScriptedRunner};

    const WEB: &str = "https://contoso.sharepoint.com/sites/docs";

    fn run_with(runner: ScriptedRunner, options: RunOptions) -> PublishRun<ScriptedRunner> {
        let engine = ExecutionEngine::new(runner, "m365").with_retry_delay(Duration::ZERO);
        PublishRun::new(engine, options)
    }

    fn existing_page() -> serde_json::Value {
        json!({
            "title": "Intro",
            "layoutType": "Article",
            "commentsDisabled": false,
            "description": "Getting started",
            "ListItemAllFields": { "Id": 7 }
        })
    }

    fn attributes(title: &str) -> PageAttributes {
        PageAttributes {
            title: Some(title.to_string()),
            ..PageAttributes::default()
        }
    }

    #[test]
    fn missing_page_is_created_with_defaults() {
        let runner = ScriptedRunner::default();
        runner.on("page get", Reply::stderr("File Not Found."));
        let mut run = run_with(runner, RunOptions::default());

        let outcome = run
            .ensure_page(WEB, "intro.aspx", &attributes("Intro"))
            .expect("ensure");
        assert!(!outcome.existed);
        assert_eq!(outcome.action, EnsureAction::Created);
        assert!(run.cache().is_processed("INTRO.aspx"));

        let runner = run.engine().runner();
        assert_eq!(runner.count("page get"), 1);
        let calls = runner.calls();
        let add = calls
            .iter()
            .find(|call| call.starts_with("spo page add"))
            .expect("page add issued");
        assert!(add.contains("--layoutType Article"));
        assert!(add.contains("--commentsEnabled"));
        assert_eq!(run.engine().stats().retries, 0);
    }

    #[test]
    fn existing_page_with_same_metadata_is_left_alone() {
        let runner = ScriptedRunner::default();
        runner.on("page get", Reply::json(existing_page()));
        let mut run = run_with(runner, RunOptions::default());

        let outcome = run
            .ensure_page(
                WEB,
                "intro.aspx",
                &PageAttributes {
                    title: Some("Intro".to_string()),
                    layout: Some("Article".to_string()),
                    comments_disabled: Some(false),
                    ..PageAttributes::default()
                },
            )
            .expect("ensure");
        assert!(outcome.existed);
        assert_eq!(outcome.id, Some(7));
        assert_eq!(outcome.action, EnsureAction::Unchanged);
        assert_eq!(run.engine().runner().count("page set"), 0);
        assert_eq!(run.cache().processed_id("intro.aspx"), Some(7));
    }

    #[test]
    fn only_differing_fields_are_sent() {
        let runner = ScriptedRunner::default();
        runner.on("page get", Reply::json(existing_page()));
        let mut run = run_with(runner, RunOptions::default());

        let outcome = run
            .ensure_page(
                WEB,
                "intro.aspx",
                &PageAttributes {
                    title: Some("Introduction".to_string()),
                    layout: Some("Article".to_string()),
                    comments_disabled: Some(true),
                    ..PageAttributes::default()
                },
            )
            .expect("ensure");
        assert_eq!(outcome.action, EnsureAction::Updated);

        let calls = run.engine().runner().calls();
        let set: Vec<_> = calls
            .iter()
            .filter(|call| call.starts_with("spo page set"))
            .collect();
        assert_eq!(set.len(), 1);
        assert!(set[0].contains("--title Introduction"));
        assert!(set[0].contains("--commentsEnabled false"));
        assert!(!set[0].contains("--layoutType"));
        assert!(!set[0].contains("--description"));
    }

    #[test]
    fn metadata_diff_ignores_unrequested_fields() {
        let page: PageInfo = serde_json::from_value(existing_page()).expect("page");
        assert!(metadata_changes(&page, &PageAttributes::default()).is_empty());

        let changes = metadata_changes(
            &page,
            &PageAttributes {
                description: Some("New summary".to_string()),
                layout: Some("Home".to_string()),
                ..PageAttributes::default()
            },
        );
        assert_eq!(
            changes,
            vec![
                "--description \"New summary\"".to_string(),
                "--layoutType \"Home\"".to_string()
            ]
        );
    }

    #[test]
    fn second_ensure_never_creates_twice() {
        let runner = ScriptedRunner::default();
        runner.on("page get", Reply::stdout(""));
        runner.on("page get", Reply::json(existing_page()));
        let options = RunOptions {
            skip_existing_pages: true,
            ..RunOptions::default()
        };
        let mut run = run_with(runner, options);

        let first = run
            .ensure_page(WEB, "intro.aspx", &attributes("Intro"))
            .expect("first ensure");
        let second = run
            .ensure_page(WEB, "intro.aspx", &attributes("Intro"))
            .expect("second ensure");
        assert_eq!(first.action, EnsureAction::Created);
        assert_eq!(second.action, EnsureAction::Cached);
        assert!(second.existed);
        assert_eq!(run.engine().runner().count("page add"), 1);
        assert_eq!(run.engine().runner().count("page set"), 0);
    }

    #[test]
    fn repeated_ensure_without_skip_updates_instead_of_creating() {
        let runner = ScriptedRunner::default();
        runner.on("page get", Reply::stdout(""));
        runner.on("page get", Reply::json(existing_page()));
        let mut run = run_with(runner, RunOptions::default());

        run.ensure_page(WEB, "intro.aspx", &attributes("Intro"))
            .expect("first ensure");
        let second = run
            .ensure_page(WEB, "intro.aspx", &attributes("Intro"))
            .expect("second ensure");
        assert_eq!(second.action, EnsureAction::Unchanged);
        assert_eq!(run.engine().runner().count("page add"), 1);
    }

    #[test]
    fn skip_existing_uses_initial_listing() {
        let runner = ScriptedRunner::default();
        runner.on("spo list get", Reply::json(json!({ "Id": "list-1", "Title": "Site Pages" })));
        runner.on(
            "listitem list",
            Reply::json(json!([
                { "ID": 3, "Title": "Guide", "FileRef": "/sites/docs/SitePages/Guide.aspx" }
            ])),
        );
        let options = RunOptions {
            skip_existing_pages: true,
            ..RunOptions::default()
        };
        let mut run = run_with(runner, options);
        assert_eq!(run.load_pages(WEB).expect("load"), 1);

        let outcome = run
            .ensure_page(WEB, "guide.aspx", &attributes("Guide"))
            .expect("ensure");
        assert_eq!(outcome.action, EnsureAction::Cached);
        assert_eq!(outcome.id, Some(3));
        assert_eq!(run.engine().runner().count("page get"), 0);
    }

    #[test]
    fn nested_slug_creates_folders_first() {
        let runner = ScriptedRunner::default();
        runner.on("page get", Reply::stderr("not found"));
        runner.on("folder get", Reply::stderr("does not exist"));
        let mut run = run_with(runner, RunOptions::default());

        run.ensure_page(WEB, "guides/setup/intro.aspx", &attributes("Intro"))
            .expect("ensure");

        let calls = run.engine().runner().calls();
        let adds: Vec<_> = calls
            .iter()
            .filter(|call| call.starts_with("spo folder add"))
            .collect();
        assert_eq!(adds.len(), 2);
        assert!(adds[0].contains("--name guides"));
        assert!(adds[1].contains("/sites/docs/sitepages/guides"));
        let first_folder = calls
            .iter()
            .position(|call| call.starts_with("spo folder add"))
            .expect("folder add");
        let page_add = calls
            .iter()
            .position(|call| call.starts_with("spo page add"))
            .expect("page add");
        assert!(first_folder < page_add);
    }

    #[test]
    fn folder_failure_aborts_creation() {
        let runner = ScriptedRunner::default();
        runner.on("page get", Reply::stderr("not found"));
        runner.on("folder get", Reply::stderr("does not exist"));
        runner.on("folder add", Reply::stderr("Access denied"));
        let mut run = run_with(runner, RunOptions::default());

        let error = run
            .ensure_page(WEB, "guides/intro.aspx", &attributes("Intro"))
            .expect_err("must fail");
        assert!(format!("{error:#}").contains("Access denied"));
        assert_eq!(run.engine().runner().count("page add"), 0);
        assert!(!run.cache().is_processed("guides/intro.aspx"));
    }

    #[test]
    fn template_copy_reenters_and_only_reconciles() {
        let runner = ScriptedRunner::default();
        runner.on("page get", Reply::stderr("not found"));
        runner.on("page get", Reply::json(existing_page()));
        runner.on(
            "page template list",
            Reply::json(json!([
                { "Title": "News", "Url": "SitePages/Templates/News.aspx" }
            ])),
        );
        let mut run = run_with(runner, RunOptions::default());

        let outcome = run
            .ensure_page(
                WEB,
                "intro.aspx",
                &PageAttributes {
                    title: Some("Intro".to_string()),
                    template: Some("News".to_string()),
                    ..PageAttributes::default()
                },
            )
            .expect("ensure");
        assert!(outcome.existed);
        assert_eq!(outcome.action, EnsureAction::Unchanged);

        let runner = run.engine().runner();
        assert_eq!(runner.count("page add"), 0);
        assert_eq!(runner.count("page copy"), 1);
        assert!(
            runner
                .calls()
                .iter()
                .any(|call| call.contains("--sourceName templates/news.aspx"))
        );
        assert_eq!(runner.count("--publish"), 1);
    }

    #[test]
    fn unknown_template_falls_back_to_default_page() {
        let runner = ScriptedRunner::default();
        runner.on("page get", Reply::stderr("not found"));
        runner.on("page template list", Reply::json(json!([])));
        let mut run = run_with(runner, RunOptions::default());

        let outcome = run
            .ensure_page(
                WEB,
                "intro.aspx",
                &PageAttributes {
                    template: Some("Missing".to_string()),
                    ..PageAttributes::default()
                },
            )
            .expect("ensure");
        assert_eq!(outcome.action, EnsureAction::Created);
        assert_eq!(run.engine().runner().count("page copy"), 0);
        assert_eq!(run.engine().runner().count("page add"), 1);
    }

    #[test]
    fn strict_policy_surfaces_infrastructure_failures() {
        let runner = ScriptedRunner::default();
        runner.on("page get", Reply::stderr("Service unavailable"));
        let options = RunOptions {
            existence_policy: ExistencePolicy::Strict,
            ..RunOptions::default()
        };
        let mut run = run_with(runner, options);

        let error = run
            .ensure_page(WEB, "intro.aspx", &attributes("Intro"))
            .expect_err("must fail");
        assert!(format!("{error:#}").contains("Service unavailable"));
        assert_eq!(run.engine().runner().count("page add"), 0);
    }

    #[test]
    fn strict_policy_still_creates_on_not_found() {
        let runner = ScriptedRunner::default();
        runner.on("page get", Reply::stderr("The file does not exist."));
        let options = RunOptions {
            existence_policy: ExistencePolicy::Strict,
            ..RunOptions::default()
        };
        let mut run = run_with(runner, options);
        let outcome = run
            .ensure_page(WEB, "intro.aspx", &attributes("Intro"))
            .expect("ensure");
        assert_eq!(outcome.action, EnsureAction::Created);
    }

    #[test]
    fn update_failure_propagates_without_creating() {
        let runner = ScriptedRunner::default();
        runner.on("page get", Reply::json(existing_page()));
        runner.on("page set", Reply::stderr("Throttled"));
        let mut run = run_with(runner, RunOptions::default());

        let error = run
            .ensure_page(WEB, "intro.aspx", &attributes("Renamed"))
            .expect_err("must fail");
        assert!(format!("{error:#}").contains("failed to update page intro.aspx"));
        assert_eq!(run.engine().runner().count("page set"), 2);
        assert_eq!(run.engine().runner().count("page add"), 0);
    }

    #[test]
    fn body_updates_existing_control_or_adds_webpart() {
        let temp = tempdir().expect("tempdir");
        let options = RunOptions {
            payload_dir: temp.path().join("payloads"),
            ..RunOptions::default()
        };
        let run = run_with(ScriptedRunner::default(), options);

        run.set_page_body(WEB, "intro.aspx", Some("ctrl-1"), "{\"a\":1}")
            .expect("update body");
        run.set_page_body(WEB, "intro.aspx", None, "{\"a\":1}")
            .expect("add body");

        let calls = run.engine().runner().calls();
        assert!(calls[0].starts_with("spo page control set"));
        assert!(calls[0].contains("--id ctrl-1"));
        assert!(calls[1].starts_with("spo page clientsidewebpart add"));
        assert!(calls[1].contains(super::MARKDOWN_WEBPART_ID));

        let written: Vec<_> = std::fs::read_dir(temp.path().join("payloads"))
            .expect("payload dir")
            .collect();
        assert_eq!(written.len(), 1);
    }

    #[test]
    fn markdown_control_is_found_by_webpart_id() {
        let canvas = json!([
            { "controlType": 0, "position": {} },
            { "id": "other", "webPartId": "aaaa" },
            { "id": "md-1", "webPartId": "1EF5ED11-CE7B-44BE-BC5E-4ABD55101D16" }
        ])
        .to_string();
        assert_eq!(
            markdown_control_id(&canvas, super::MARKDOWN_WEBPART_ID).as_deref(),
            Some("md-1")
        );
        assert_eq!(markdown_control_id("[]", super::MARKDOWN_WEBPART_ID), None);
        assert_eq!(markdown_control_id("garbage", super::MARKDOWN_WEBPART_ID), None);
    }

    #[test]
    fn metadata_uses_list_and_page_ids() {
        let runner = ScriptedRunner::default();
        runner.on("page get", Reply::json(existing_page()));
        runner.on("spo list get", Reply::json(json!({ "Id": "list-1" })));
        let mut run = run_with(runner, RunOptions::default());

        let fields = BTreeMap::from([("Category".to_string(), "How to".to_string())]);
        run.set_page_metadata(WEB, "intro.aspx", &fields)
            .expect("metadata");
        run.set_page_description(WEB, "intro.aspx", "Short")
            .expect("description");

        let runner = run.engine().runner();
        assert_eq!(runner.count("page get"), 1);
        assert_eq!(runner.count("spo list get"), 1);
        let calls = runner.calls();
        let sets: Vec<_> = calls
            .iter()
            .filter(|call| call.starts_with("spo listitem set"))
            .collect();
        assert_eq!(sets.len(), 2);
        assert!(sets[0].contains("--listId list-1 --id 7"));
        assert!(sets[0].contains("--Category \"How to\""));
        assert!(sets[1].contains("--Description Short --systemUpdate"));
    }

    #[test]
    fn metadata_is_skipped_without_page_id() {
        let mut run = run_with(ScriptedRunner::default(), RunOptions::default());
        let fields = BTreeMap::from([("Category".to_string(), "News".to_string())]);
        run.set_page_metadata(WEB, "intro.aspx", &fields)
            .expect("metadata");
        assert_eq!(run.engine().runner().count("listitem set"), 0);
    }

    #[test]
    fn publish_checks_in_only_when_checked_out() {
        let runner = ScriptedRunner::default();
        runner.on("file get", Reply::json(json!({ "CheckOutType": 2 })));
        let run = run_with(runner, RunOptions::default());
        run.publish_page(WEB, "intro.aspx").expect("publish");
        assert_eq!(run.engine().runner().count("file checkin"), 0);
        assert_eq!(run.engine().runner().count("--publish"), 1);

        let runner = ScriptedRunner::default();
        runner.on("file get", Reply::json(json!({ "CheckOutType": 0 })));
        runner.on("file checkin", Reply::stderr("conflict"));
        let run = run_with(runner, RunOptions::default());
        run.publish_page(WEB, "intro.aspx").expect("publish despite check-in");
        assert_eq!(run.engine().runner().count("file checkin"), 1);
        assert_eq!(run.engine().runner().count("--publish"), 1);
    }

    #[test]
    fn dry_run_walks_the_create_path_without_calls() {
        let engine = ExecutionEngine::new(ScriptedRunner::default(), "m365").with_dry_run(true);
        let mut run = PublishRun::new(engine, RunOptions::default());
        let outcome = run
            .ensure_page(WEB, "intro.aspx", &attributes("Intro"))
            .expect("ensure");
        assert_eq!(outcome.action, EnsureAction::Created);
        assert!(run.engine().runner().calls().is_empty());
    }
}
