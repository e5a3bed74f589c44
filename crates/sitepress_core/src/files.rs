use std::path::Path;

use anyhow::{Context, Result, anyhow};
use serde::Serialize;
use tracing::{debug, info};

use crate::args::quote_token;
use crate::cache::normalize_key;
use crate::exec::ProcessRunner;
use crate::publish::PublishRun;
use crate::remote::{FileInfo, FolderInfo, parse_output};

/// Server-relative URL of `path` under the site at `web_url`.
pub fn rel_url(web_url: &str, path: &str) -> String {
    let without_scheme = web_url
        .split_once("://")
        .map_or(web_url, |(_, rest)| rest);
    let site_path = without_scheme
        .find('/')
        .map_or("", |index| &without_scheme[index..]);
    let site_path = site_path.trim_end_matches('/');
    let path = path.trim_start_matches('/');
    if site_path.is_empty() {
        format!("/{path}")
    } else if site_path.starts_with('/') {
        format!("{site_path}/{path}")
    } else {
        format!("/{site_path}/{path}")
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FolderCleanReport {
    pub files_removed: usize,
    pub folders_removed: usize,
}

impl<R: ProcessRunner> PublishRun<R> {
    /// Create every missing folder of `segments` below `library`, parents
    /// first. Folders confirmed once are not checked again this run.
    pub fn ensure_folders(
        &mut self,
        web_url: &str,
        library: &str,
        segments: &[String],
    ) -> Result<()> {
        let mut parent = library.to_string();
        for segment in segments.iter().filter(|segment| !segment.is_empty()) {
            let current = format!("{parent}/{segment}");
            let relative = rel_url(web_url, &current);
            let key = format!("folder:{relative}");
            if self.cache().has_checked(&key) {
                parent = current;
                continue;
            }

            let probe = format!(
                "spo folder get --webUrl {} --url {}",
                quote_token(web_url),
                quote_token(&relative)
            );
            if let Err(error) = self.run(&probe, false) {
                debug!(folder = %relative, error = %error, "folder missing");
                let add = format!(
                    "spo folder add --webUrl {} --parentFolderUrl {} --name {}",
                    quote_token(web_url),
                    quote_token(&rel_url(web_url, &parent)),
                    quote_token(segment)
                );
                self.run(&add, self.retry())
                    .with_context(|| format!("failed to create folder {relative}"))?;
                info!(folder = %relative, "created folder");
            }

            self.cache_mut().mark_checked(&key);
            parent = current;
        }
        Ok(())
    }

    /// Upload `local_path` into `folder` unless it is already there, and
    /// return its absolute URL.
    pub fn ensure_file(
        &mut self,
        web_url: &str,
        folder: &str,
        local_path: &Path,
        overwrite: bool,
    ) -> Result<String> {
        let file_name = local_path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .ok_or_else(|| anyhow!("not a file path: {}", local_path.display()))?;
        let path_text = local_path.to_string_lossy().replace('\\', "/");
        let cache_key = format!(
            "{}-{}",
            path_text.replace(' ', "%20"),
            folder.replace(' ', "%20")
        );

        if !self.cache().has_checked(&cache_key) {
            if overwrite {
                self.upload(web_url, folder, local_path)?;
            } else {
                let relative = rel_url(web_url, &format!("{folder}/{file_name}"));
                let probe = format!(
                    "spo file get --webUrl {} --url {}",
                    quote_token(web_url),
                    quote_token(&relative)
                );
                match self.run(&probe, false) {
                    Ok(_) => debug!(file = %relative, "file already present"),
                    Err(error) => {
                        debug!(file = %relative, error = %error, "file missing, uploading");
                        self.upload(web_url, folder, local_path)?;
                    }
                }
            }
            self.cache_mut().mark_checked(&cache_key);
        }

        Ok(format!(
            "{}/{folder}/{file_name}",
            web_url.trim_end_matches('/')
        )
        .replace(' ', "%20"))
    }

    fn upload(&self, web_url: &str, folder: &str, local_path: &Path) -> Result<()> {
        let command = format!(
            "spo file add --webUrl {} --folder {} --path {}",
            quote_token(web_url),
            quote_token(folder),
            quote_token(&local_path.to_string_lossy())
        );
        self.run(&command, self.retry())
            .with_context(|| format!("failed to upload {}", local_path.display()))?;
        info!(file = %local_path.display(), folder, "uploaded file");
        Ok(())
    }

    /// Remove every file in `folder`, then every sub-folder that is not
    /// protected. The first failure aborts.
    pub fn clean_folder(&self, web_url: &str, folder: &str) -> Result<FolderCleanReport> {
        let mut report = FolderCleanReport::default();
        let marker = normalize_key(folder);

        let command = format!(
            "spo file list --webUrl {} --folderUrl {} -o json",
            quote_token(web_url),
            quote_token(folder)
        );
        let output = self
            .run(&command, self.retry())
            .with_context(|| format!("failed to list files in {folder}"))?;
        let files = parse_output::<Vec<FileInfo>>(&output, "file list")?.unwrap_or_default();
        for file in files {
            let Some(path) = file
                .server_relative_url
                .as_deref()
                .and_then(|url| path_below(url, &marker, folder))
            else {
                continue;
            };
            let remove = format!(
                "spo file remove --webUrl {} --url {} --force",
                quote_token(web_url),
                quote_token(&path)
            );
            self.run(&remove, self.retry())
                .with_context(|| format!("failed to remove {path}"))?;
            debug!(file = %path, "removed file");
            report.files_removed += 1;
        }

        let command = format!(
            "spo folder list --webUrl {} --parentFolderUrl {} -o json",
            quote_token(web_url),
            quote_token(folder)
        );
        let output = self
            .run(&command, self.retry())
            .with_context(|| format!("failed to list folders in {folder}"))?;
        let folders = parse_output::<Vec<FolderInfo>>(&output, "folder list")?.unwrap_or_default();
        for sub in folders {
            let name = normalize_key(sub.name.as_deref().unwrap_or_default());
            if !sub.exists || name.is_empty() || self.options().protected_folders.contains(&name) {
                continue;
            }
            let Some(path) = sub
                .server_relative_url
                .as_deref()
                .and_then(|url| path_below(url, &marker, folder))
            else {
                continue;
            };
            let remove = format!(
                "spo folder remove --webUrl {} --url {} --force",
                quote_token(web_url),
                quote_token(&path)
            );
            self.run(&remove, self.retry())
                .with_context(|| format!("failed to remove folder {path}"))?;
            debug!(folder = %path, "removed folder");
            report.folders_removed += 1;
        }

        info!(
            folder,
            files = report.files_removed,
            folders = report.folders_removed,
            "cleaned folder"
        );
        Ok(report)
    }
}

/// `folder` followed by whatever comes after the last `marker` in `url`.
fn path_below(url: &str, marker: &str, folder: &str) -> Option<String> {
    let normalized = normalize_key(url);
    let rest = normalized.rsplit(marker).next()?;
    if rest.len() == normalized.len() || rest.is_empty() {
        return None;
    }
    Some(format!("{folder}{rest}"))
}
