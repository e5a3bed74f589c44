//! Shapes of the JSON the external tool prints. Only the fields the publish
//! flow reads are modelled; everything else is ignored.

use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::exec::ExecOutput;

#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PageInfo {
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub layout_type: Option<String>,
    #[serde(default)]
    pub comments_disabled: Option<bool>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default, rename = "ListItemAllFields")]
    pub list_item_all_fields: Option<ListItemFields>,
    #[serde(default)]
    pub canvas_content_json: Option<String>,
}

impl PageInfo {
    pub fn item_id(&self) -> Option<i64> {
        self.list_item_all_fields.as_ref().and_then(|fields| fields.id)
    }
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
pub struct ListItemFields {
    #[serde(default, rename = "Id", alias = "ID")]
    pub id: Option<i64>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq, Eq)]
pub struct ListItem {
    #[serde(rename = "Id", alias = "ID")]
    pub id: i64,
    #[serde(default, rename = "Title")]
    pub title: Option<String>,
    #[serde(default, rename = "FileRef")]
    pub file_ref: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
pub struct ListInfo {
    #[serde(rename = "Id", alias = "ID")]
    pub id: String,
    #[serde(default, rename = "Title")]
    pub title: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
pub struct FileInfo {
    #[serde(default, rename = "Name")]
    pub name: Option<String>,
    #[serde(default, rename = "ServerRelativeUrl")]
    pub server_relative_url: Option<String>,
    #[serde(default, rename = "CheckOutType")]
    pub check_out_type: Option<Value>,
    #[serde(default, rename = "CheckedOutByUserId")]
    pub checked_out_by_user_id: Option<Value>,
    #[serde(default, rename = "CheckedOutByUser")]
    pub checked_out_by_user: Option<Value>,
    #[serde(default, rename = "LockedByUserId")]
    pub locked_by_user_id: Option<Value>,
}

impl FileInfo {
    /// Whether someone currently holds a checkout or lock on the file.
    ///
    /// `CheckOutType` 2 (or "None") means no checkout; any other explicit
    /// value counts as held. Without a usable type the owner fields decide.
    pub fn checkout_held(&self) -> bool {
        match &self.check_out_type {
            Some(Value::Number(number)) if number.as_i64() != Some(2) => return true,
            Some(Value::String(kind)) if !kind.eq_ignore_ascii_case("none") => return true,
            _ => {}
        }

        [
            &self.checked_out_by_user_id,
            &self.checked_out_by_user,
            &self.locked_by_user_id,
        ]
        .into_iter()
        .any(|field| field.as_ref().is_some_and(is_truthy))
    }
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
pub struct FolderInfo {
    #[serde(default, rename = "Name")]
    pub name: Option<String>,
    #[serde(default, rename = "ServerRelativeUrl")]
    pub server_relative_url: Option<String>,
    #[serde(default, rename = "Exists")]
    pub exists: bool,
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
pub struct PageTemplate {
    #[serde(default, rename = "Title")]
    pub title: Option<String>,
    #[serde(default, rename = "Url")]
    pub url: Option<String>,
}

/// Decode tool output, treating an empty payload as absent.
pub fn parse_output<T: DeserializeOwned>(output: &ExecOutput, what: &str) -> Result<Option<T>> {
    output
        .json::<T>()
        .with_context(|| format!("failed to decode {what} output"))
}

fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(flag) => *flag,
        Value::Number(number) => number.as_f64().is_some_and(|n| n != 0.0),
        Value::String(text) => !text.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}
