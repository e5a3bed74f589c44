use std::collections::VecDeque;

use tracing::{debug, info, warn};

use crate::args::quote_token;
use crate::cache::normalize_key;
use crate::exec::{ExecError, ExecutionEngine, Invocation, ProcessRunner};
use crate::files::rel_url;
use crate::publish::PublishRun;

/// Lazy removal of pages that exist remotely but were not touched by the
/// run. Yields one status per removed page. Without continue-on-error the
/// sweep ends after its first failure; earlier removals stay removed.
pub struct CleanupSweep<'a, R: ProcessRunner> {
    engine: &'a ExecutionEngine<R>,
    web_url: String,
    library: String,
    retry: bool,
    continue_on_error: bool,
    pending: VecDeque<String>,
    halted: bool,
}

impl<R: ProcessRunner> CleanupSweep<'_, R> {
    pub fn remaining(&self) -> usize {
        if self.halted { 0 } else { self.pending.len() }
    }
}

impl<R: ProcessRunner> Iterator for CleanupSweep<'_, R> {
    type Item = Result<String, ExecError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.halted {
            return None;
        }
        let slug = self.pending.pop_front()?;
        let status = format!("Cleaning up page: {slug}");
        info!(slug = %slug, "cleaning up page");

        let relative = rel_url(&self.web_url, &format!("{}/{slug}", self.library));
        let command = format!(
            "spo file remove --webUrl {} --url {} --force",
            quote_token(&self.web_url),
            quote_token(&relative)
        );
        match self
            .engine
            .execute(&Invocation::parse(&command).retryable(self.retry))
        {
            Ok(_) => Some(Ok(status)),
            Err(error) => {
                warn!(slug = %slug, error = %error, "page removal failed");
                if !self.continue_on_error {
                    self.halted = true;
                }
                Some(Err(error))
            }
        }
    }
}

impl<R: ProcessRunner> PublishRun<R> {
    /// Slugs in the initial listing that this run never processed, in
    /// listing order, minus protected folders and non-page files.
    pub fn untouched_pages(&self, web_url: &str) -> Vec<String> {
        let options = self.options();
        let separator = format!("/{}/", normalize_key(&options.pages_library));
        let suffix = normalize_key(&options.page_suffix);
        let Some(listing) = self.cache().listing(&self.listing_scope(web_url)) else {
            debug!(web_url, "no page listing loaded, nothing to clean up");
            return Vec::new();
        };

        listing
            .iter()
            .filter_map(|item| {
                let file_ref = normalize_key(item.file_ref.as_deref()?);
                let slug = file_ref.split(&separator).nth(1)?.to_string();
                Some(slug)
            })
            .filter(|slug| !slug.is_empty() && !self.cache().is_processed(slug))
            .filter(|slug| {
                let top = slug.split('/').next().unwrap_or_default();
                let protected = options.protected_folders.iter().any(|folder| folder == top);
                !(slug.contains('/') && protected)
            })
            .filter(|slug| slug.ends_with(&suffix))
            .collect()
    }

    /// Start the sweep. The untouched set is fixed here; later processing
    /// does not change it.
    pub fn cleanup(&self, web_url: &str) -> CleanupSweep<'_, R> {
        let pending: VecDeque<String> = self.untouched_pages(web_url).into();
        debug!(web_url, pages = pending.len(), "untouched pages");
        CleanupSweep {
            engine: self.engine(),
            web_url: web_url.to_string(),
            library: self.options().pages_library.clone(),
            retry: self.options().retry,
            continue_on_error: self.options().continue_on_error,
            pending,
            halted: false,
        }
    }
}
