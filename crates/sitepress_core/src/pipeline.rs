use std::path::PathBuf;

use anyhow::{Context, Result};
use serde::Serialize;
use tracing::{info, warn};

use crate::auth::{AuthMethod, login};
use crate::content::{SourcePage, scan_assets, scan_pages};
use crate::exec::{ExecStats, ProcessRunner};
use crate::files::FolderCleanReport;
use crate::publish::{EnsureAction, PublishRun, markdown_control_id};

#[derive(Debug, Clone)]
pub struct PublishSettings {
    pub web_url: String,
    pub source_dir: PathBuf,
    pub auth: AuthMethod,
    pub clean_start: bool,
    pub asset_folder: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct PublishPageResult {
    pub slug: String,
    pub action: String,
    pub detail: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PublishReport {
    pub success: bool,
    pub dry_run: bool,
    pub web_url: String,
    pub created: usize,
    pub updated: usize,
    pub unchanged: usize,
    pub cached: usize,
    pub skipped: usize,
    pub assets: usize,
    pub folder_clean: Option<FolderCleanReport>,
    pub pages: Vec<PublishPageResult>,
    pub cleanup: Vec<String>,
    pub errors: Vec<String>,
    pub stats: ExecStats,
}

impl PublishReport {
    fn new(web_url: &str, dry_run: bool) -> Self {
        Self {
            success: true,
            dry_run,
            web_url: web_url.to_string(),
            created: 0,
            updated: 0,
            unchanged: 0,
            cached: 0,
            skipped: 0,
            assets: 0,
            folder_clean: None,
            pages: Vec::new(),
            cleanup: Vec::new(),
            errors: Vec::new(),
            stats: ExecStats::default(),
        }
    }

    fn record(&mut self, slug: &str, action: EnsureAction) {
        match action {
            EnsureAction::Created => self.created += 1,
            EnsureAction::Updated => self.updated += 1,
            EnsureAction::Unchanged => self.unchanged += 1,
            EnsureAction::Cached => self.cached += 1,
        }
        self.pages.push(PublishPageResult {
            slug: slug.to_string(),
            action: action.as_str().to_string(),
            detail: None,
        });
    }

    /// Note a failure; the error comes back unless the run may continue.
    fn fail(&mut self, subject: &str, error: anyhow::Error, continue_on_error: bool) -> Result<()> {
        let message = format!("{error:#}");
        warn!(subject, error = %message, "publish step failed");
        self.success = false;
        self.errors.push(format!("{subject}: {message}"));
        self.pages.push(PublishPageResult {
            slug: subject.to_string(),
            action: "error".to_string(),
            detail: Some(message),
        });
        if continue_on_error {
            Ok(())
        } else {
            Err(error.context(format!("publish stopped at {subject}")))
        }
    }
}

/// Publish every page under the source directory to the site, in order.
///
/// Clean start empties the asset folder before uploads and removes pages the
/// run did not touch once all pages are done.
pub fn publish_site<R: ProcessRunner>(
    run: &mut PublishRun<R>,
    settings: &PublishSettings,
) -> Result<PublishReport> {
    let web_url = settings.web_url.as_str();
    let continue_on_error = run.options().continue_on_error;
    let mut report = PublishReport::new(web_url, run.engine().is_dry_run());

    let pages = scan_pages(&settings.source_dir)?;
    let assets = scan_assets(&settings.source_dir)?;
    info!(
        web_url,
        pages = pages.len(),
        assets = assets.len(),
        dry_run = report.dry_run,
        "starting publish"
    );

    login(run.engine(), &settings.auth)?;

    if settings.clean_start {
        report.folder_clean = Some(
            run.clean_folder(web_url, &settings.asset_folder)
                .context("clean start failed")?,
        );
    }

    run.load_pages(web_url)?;

    for asset in &assets {
        let folder = if asset.relative_dir.is_empty() {
            settings.asset_folder.clone()
        } else {
            format!("{}/{}", settings.asset_folder, asset.relative_dir)
        };
        let outcome = run
            .ensure_folders(web_url, &settings.asset_folder, &asset.segments())
            .and_then(|()| run.ensure_file(web_url, &folder, &asset.path, true));
        match outcome {
            Ok(_) => report.assets += 1,
            Err(error) => {
                report.fail(&asset.path.display().to_string(), error, continue_on_error)?
            }
        }
    }

    for page in &pages {
        if page.front_matter.skip {
            // Keep skipped pages out of the cleanup sweep.
            run.cache_mut().record_processed(&page.slug, None);
            report.skipped += 1;
            report.pages.push(PublishPageResult {
                slug: page.slug.clone(),
                action: "skipped".to_string(),
                detail: Some("skip set in front matter".to_string()),
            });
            continue;
        }
        match publish_page_content(run, web_url, page) {
            Ok(action) => report.record(&page.slug, action),
            Err(error) => {
                // A failed page still exists in the source tree; the sweep must not remove it.
                run.cache_mut().record_processed(&page.slug, None);
                report.fail(&page.slug, error, continue_on_error)?
            }
        }
    }

    if settings.clean_start {
        for status in run.cleanup(web_url) {
            match status {
                Ok(status) => report.cleanup.push(status),
                Err(error) => report.fail("cleanup", anyhow::Error::new(error), continue_on_error)?,
            }
        }
    }

    report.stats = run.engine().stats();
    info!(
        created = report.created,
        updated = report.updated,
        unchanged = report.unchanged,
        removed = report.cleanup.len(),
        errors = report.errors.len(),
        "publish finished"
    );
    Ok(report)
}

fn publish_page_content<R: ProcessRunner>(
    run: &mut PublishRun<R>,
    web_url: &str,
    page: &SourcePage,
) -> Result<EnsureAction> {
    let slug = page.slug.as_str();
    let outcome = run.ensure_page(web_url, slug, &page.attributes())?;
    if outcome.action == EnsureAction::Cached {
        return Ok(outcome.action);
    }

    let control_id = if outcome.existed {
        let canvas = run.page_controls(web_url, slug)?;
        markdown_control_id(&canvas, &run.options().markdown_webpart_id)
    } else {
        run.ensure_default_section(web_url, slug)?;
        None
    };
    run.set_page_body(web_url, slug, control_id.as_deref(), &page.payload())?;

    run.set_page_metadata(web_url, slug, &page.front_matter.metadata_fields())?;
    if let Some(description) = page
        .front_matter
        .description
        .as_deref()
        .filter(|text| !text.is_empty())
    {
        run.set_page_description(web_url, slug, description)?;
    }

    run.publish_page(web_url, slug)?;
    Ok(outcome.action)
}
