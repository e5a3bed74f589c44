use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;
use serde_json::json;
use walkdir::{DirEntry, WalkDir};

use crate::publish::{DEFAULT_PAGE_SUFFIX, PageAttributes};

const PAGE_EXTENSION: &str = "md";
const FRONT_MATTER_FENCE: &str = "---";

#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
pub struct FrontMatter {
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub layout: Option<String>,
    #[serde(default, alias = "commentsDisabled")]
    pub comments_disabled: Option<bool>,
    #[serde(default)]
    pub template: Option<String>,
    #[serde(default)]
    pub skip: bool,
    #[serde(default)]
    pub metadata: BTreeMap<String, serde_yaml::Value>,
}

impl FrontMatter {
    /// List item fields as the strings the tool expects.
    pub fn metadata_fields(&self) -> BTreeMap<String, String> {
        self.metadata
            .iter()
            .filter_map(|(field, value)| {
                let text = match value {
                    serde_yaml::Value::Null => return None,
                    serde_yaml::Value::String(text) => text.clone(),
                    serde_yaml::Value::Bool(flag) => flag.to_string(),
                    serde_yaml::Value::Number(number) => number.to_string(),
                    other => serde_yaml::to_string(other).ok()?.trim().to_string(),
                };
                Some((field.clone(), text))
            })
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SourcePage {
    pub relative_path: String,
    pub slug: String,
    pub front_matter: FrontMatter,
    pub body: String,
}

impl SourcePage {
    pub fn title(&self) -> String {
        self.front_matter
            .title
            .clone()
            .filter(|title| !title.trim().is_empty())
            .unwrap_or_else(|| file_stem(&self.relative_path))
    }

    pub fn attributes(&self) -> PageAttributes {
        PageAttributes {
            title: Some(self.title()),
            layout: self.front_matter.layout.clone(),
            comments_disabled: self.front_matter.comments_disabled,
            description: self.front_matter.description.clone(),
            template: self.front_matter.template.clone(),
        }
    }

    pub fn payload(&self) -> String {
        webpart_payload(&self.title(), &self.body)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssetFile {
    pub path: PathBuf,
    /// Parent directories below the source root, `/`-separated.
    pub relative_dir: String,
}

impl AssetFile {
    pub fn segments(&self) -> Vec<String> {
        self.relative_dir
            .split('/')
            .filter(|segment| !segment.is_empty())
            .map(str::to_string)
            .collect()
    }
}

/// Every markdown page below `source_dir`, sorted by relative path.
pub fn scan_pages(source_dir: &Path) -> Result<Vec<SourcePage>> {
    let mut pages = Vec::new();
    for entry in walk(source_dir) {
        let entry = entry.with_context(|| format!("failed to walk {}", source_dir.display()))?;
        if !entry.file_type().is_file() || !is_page(entry.path()) {
            continue;
        }
        let relative = relative_to(source_dir, entry.path())?;
        pages.push(read_page(entry.path(), relative)?);
    }
    pages.sort_by(|left, right| left.relative_path.cmp(&right.relative_path));
    Ok(pages)
}

/// Non-page files below `source_dir` that pages may reference.
pub fn scan_assets(source_dir: &Path) -> Result<Vec<AssetFile>> {
    let mut assets = Vec::new();
    for entry in walk(source_dir) {
        let entry = entry.with_context(|| format!("failed to walk {}", source_dir.display()))?;
        if !entry.file_type().is_file() || is_page(entry.path()) {
            continue;
        }
        let relative = relative_to(source_dir, entry.path())?;
        let relative_dir = relative
            .rsplit_once('/')
            .map(|(dir, _)| dir.to_string())
            .unwrap_or_default();
        assets.push(AssetFile {
            path: entry.path().to_path_buf(),
            relative_dir,
        });
    }
    assets.sort_by(|left, right| left.path.cmp(&right.path));
    Ok(assets)
}

/// Remote page name for a source path: `guides/Getting Started.md` becomes
/// `guides/getting-started.aspx`.
pub fn slug_for(relative_path: &str) -> String {
    let normalized = relative_path.replace('\\', "/");
    let stem = match normalized.rsplit_once('.') {
        Some((stem, extension))
            if extension.eq_ignore_ascii_case(PAGE_EXTENSION) && !stem.ends_with('/') =>
        {
            stem
        }
        _ => normalized.as_str(),
    };
    let slug = stem
        .split('/')
        .filter(|segment| !segment.is_empty())
        .map(|segment| {
            segment
                .split_whitespace()
                .collect::<Vec<_>>()
                .join("-")
                .to_lowercase()
        })
        .collect::<Vec<_>>()
        .join("/");
    format!("{slug}{DEFAULT_PAGE_SUFFIX}")
}

/// Opaque body payload handed to the markdown web part.
pub fn webpart_payload(title: &str, markdown: &str) -> String {
    json!({
        "title": title,
        "description": title,
        "serverProcessedContent": {
            "searchablePlainTexts": { "code": markdown }
        },
        "properties": { "displayPreview": true, "lineWrapping": true }
    })
    .to_string()
}

/// Split leading `---` fenced YAML from the body.
pub fn split_front_matter(text: &str) -> (Option<&str>, &str) {
    let text = text.strip_prefix('\u{feff}').unwrap_or(text);
    let Some(rest) = text
        .strip_prefix(FRONT_MATTER_FENCE)
        .and_then(|rest| rest.strip_prefix("\r\n").or_else(|| rest.strip_prefix('\n')))
    else {
        return (None, text);
    };

    let mut offset = 0;
    for line in rest.split_inclusive('\n') {
        if line.trim_end() == FRONT_MATTER_FENCE {
            let yaml = &rest[..offset];
            let body = &rest[offset + line.len()..];
            return (Some(yaml), body);
        }
        offset += line.len();
    }
    (None, text)
}

fn read_page(path: &Path, relative_path: String) -> Result<SourcePage> {
    let text =
        fs::read_to_string(path).with_context(|| format!("failed to read {}", path.display()))?;
    let (yaml, body) = split_front_matter(&text);
    let front_matter = match yaml {
        Some(yaml) if !yaml.trim().is_empty() => serde_yaml::from_str::<FrontMatter>(yaml)
            .with_context(|| format!("failed to parse front matter in {}", path.display()))?,
        _ => FrontMatter::default(),
    };

    Ok(SourcePage {
        slug: slug_for(&relative_path),
        relative_path,
        front_matter,
        body: body.trim_start_matches(['\r', '\n']).to_string(),
    })
}

fn walk(source_dir: &Path) -> impl Iterator<Item = walkdir::Result<DirEntry>> {
    WalkDir::new(source_dir)
        .follow_links(false)
        .into_iter()
        .filter_entry(|entry| entry.depth() == 0 || !is_hidden(entry))
}

fn is_hidden(entry: &DirEntry) -> bool {
    entry
        .file_name()
        .to_str()
        .is_some_and(|name| name.starts_with('.'))
}

fn is_page(path: &Path) -> bool {
    path.extension()
        .and_then(|extension| extension.to_str())
        .is_some_and(|extension| extension.eq_ignore_ascii_case(PAGE_EXTENSION))
}

fn relative_to(root: &Path, path: &Path) -> Result<String> {
    let relative = path.strip_prefix(root).with_context(|| {
        format!(
            "failed to derive relative path from {} for {}",
            root.display(),
            path.display()
        )
    })?;
    Ok(relative.to_string_lossy().replace('\\', "/"))
}

fn file_stem(relative_path: &str) -> String {
    Path::new(relative_path)
        .file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_else(|| relative_path.to_string())
}

#[cfg(test)]
mod tests {
    use std::fs;

    use tempfile::tempdir;

    use super::*;

    #[test]
    fn slugs_are_lowercase_dashed_pages() {
        assert_eq!(slug_for("Intro.md"), "intro.aspx");
        assert_eq!(
            slug_for("guides\\Getting  Started.MD"),
            "guides/getting-started.aspx"
        );
        assert_eq!(slug_for("notes.txt"), "notes.txt.aspx");
    }

    #[test]
    fn front_matter_is_split_from_body() {
        let (yaml, body) = split_front_matter("---\r\ntitle: Intro\r\n---\r\n# Hello\n");
        assert_eq!(yaml, Some("title: Intro\r\n"));
        assert_eq!(body, "# Hello\n");

        let (yaml, body) = split_front_matter("# No fence\n---\n");
        assert!(yaml.is_none());
        assert_eq!(body, "# No fence\n---\n");

        let (yaml, _) = split_front_matter("---\ntitle: never closed\n");
        assert!(yaml.is_none());
    }

    #[test]
    fn scan_reads_pages_and_skips_hidden_dirs() {
        let temp = tempdir().expect("tempdir");
        let root = temp.path();
        fs::create_dir_all(root.join("guides")).expect("guides");
        fs::create_dir_all(root.join(".sitepress")).expect("state");
        fs::write(
            root.join("guides").join("Setup Steps.md"),
            "---\ntitle: Setup\ncommentsDisabled: true\nmetadata:\n  Category: How to\n  Order: 2\n---\n\nBody text\n",
        )
        .expect("write guide");
        fs::write(root.join("index.md"), "Just text\n").expect("write index");
        fs::write(root.join(".sitepress").join("draft.md"), "hidden").expect("write hidden");
        fs::write(root.join("guides").join("diagram.png"), [0u8, 1, 2]).expect("write asset");

        let pages = scan_pages(root).expect("scan");
        assert_eq!(pages.len(), 2);
        assert_eq!(pages[0].relative_path, "guides/Setup Steps.md");
        assert_eq!(pages[0].slug, "guides/setup-steps.aspx");
        assert_eq!(pages[0].title(), "Setup");
        assert_eq!(pages[0].body, "Body text\n");
        assert_eq!(pages[0].front_matter.comments_disabled, Some(true));
        let fields = pages[0].front_matter.metadata_fields();
        assert_eq!(fields.get("Category").map(String::as_str), Some("How to"));
        assert_eq!(fields.get("Order").map(String::as_str), Some("2"));

        assert_eq!(pages[1].slug, "index.aspx");
        assert_eq!(pages[1].title(), "index");

        let assets = scan_assets(root).expect("assets");
        assert_eq!(assets.len(), 1);
        assert_eq!(assets[0].segments(), vec!["guides".to_string()]);
    }

    #[test]
    fn invalid_front_matter_names_the_file() {
        let temp = tempdir().expect("tempdir");
        fs::write(temp.path().join("bad.md"), "---\ntitle: [unclosed\n---\n").expect("write");
        let error = scan_pages(temp.path()).expect_err("must fail");
        assert!(error.to_string().contains("bad.md"));
    }

    #[test]
    fn attributes_carry_front_matter() {
        let page = SourcePage {
            relative_path: "news.md".to_string(),
            slug: "news.aspx".to_string(),
            front_matter: FrontMatter {
                layout: Some("Home".to_string()),
                template: Some("News".to_string()),
                ..FrontMatter::default()
            },
            body: "hi".to_string(),
        };
        let attributes = page.attributes();
        assert_eq!(attributes.title.as_deref(), Some("news"));
        assert_eq!(attributes.layout.as_deref(), Some("Home"));
        assert_eq!(attributes.template.as_deref(), Some("News"));
        assert!(attributes.description.is_none());

        let payload: serde_json::Value =
            serde_json::from_str(&page.payload()).expect("payload json");
        assert_eq!(payload["title"], "news");
    }
}
