//! `list` and `delete` against the configured bucket.

use std::process::ExitCode;

use anyhow::{Context, Result, bail};
use serde::Serialize;
use tracing::info;

use crate::{
    commands::open_store,
    config::AppConfig,
    models::artifact::BackupObjectName,
    services::control::CallControl,
};

const UNKNOWN: &str = "unknown";

/// One row of `list` output.
#[derive(Debug, Serialize, PartialEq, Eq)]
pub struct ListingRow {
    pub object: String,
    pub claim: String,
    pub pool: String,
    pub image: String,
    /// Claim, pool or image may have been split at the wrong `-`.
    pub ambiguous: bool,
}

impl ListingRow {
    pub fn from_key(key: &str) -> Self {
        match BackupObjectName::decode(key) {
            Some(name) => Self {
                object: key.to_string(),
                claim: name.claim,
                pool: name.pool,
                image: name.image,
                ambiguous: name.ambiguous,
            },
            None => Self {
                object: key.to_string(),
                claim: UNKNOWN.into(),
                pool: UNKNOWN.into(),
                image: UNKNOWN.into(),
                ambiguous: false,
            },
        }
    }
}

pub async fn list(cfg: AppConfig, prefix: Option<String>, json: bool, control: CallControl) -> Result<ExitCode> {
    let store = open_store(cfg.storage).await?;
    info!("listing backups in {}", store.describe());

    let keys = store
        .list(prefix.as_deref(), &control)
        .await
        .context("listing backups")?;
    let rows: Vec<ListingRow> = keys.iter().map(|key| ListingRow::from_key(key)).collect();

    if json {
        println!("{}", serde_json::to_string_pretty(&rows)?);
    } else {
        print!("{}", render_listing(&rows));
    }
    Ok(ExitCode::SUCCESS)
}

pub async fn delete(cfg: AppConfig, object: String, control: CallControl) -> Result<ExitCode> {
    let store = open_store(cfg.storage).await?;

    if !store
        .exists(&object, &control)
        .await
        .with_context(|| format!("checking {object}"))?
    {
        bail!("backup {object} not found in {}", store.describe());
    }
    store
        .delete(&object, &control)
        .await
        .with_context(|| format!("deleting {object}"))?;

    println!("deleted {object}");
    Ok(ExitCode::SUCCESS)
}

fn render_listing(rows: &[ListingRow]) -> String {
    if rows.is_empty() {
        return "No backups found.\n".to_string();
    }

    let mut out = format!("Found {} backup(s):\n\n", rows.len());
    out.push_str(&format!(
        "{:<50} {:<20} {:<20} {:<20}\n",
        "Backup File", "PVC Name", "Pool", "Image"
    ));
    out.push_str(&"-".repeat(110));
    out.push('\n');
    for row in rows {
        let line = format!(
            "{:<50} {:<20} {:<20} {:<20}",
            row.object, row.claim, row.pool, row.image
        );
        out.push_str(line.trim_end());
        if row.ambiguous {
            out.push_str(" *");
        }
        out.push('\n');
    }
    if rows.iter().any(|row| row.ambiguous) {
        out.push_str("\n* name contains extra '-'; claim/pool/image split is a guess\n");
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn undecodable_keys_are_unknown() {
        assert_eq!(
            ListingRow::from_key("manual-upload.tar"),
            ListingRow {
                object: "manual-upload.tar".into(),
                claim: UNKNOWN.into(),
                pool: UNKNOWN.into(),
                image: UNKNOWN.into(),
                ambiguous: false,
            }
        );
    }

    #[test]
    fn listing_marks_ambiguous_rows() {
        let rows = vec![
            ListingRow::from_key("data-rbd-img1.rbd.gz.gpg"),
            ListingRow::from_key("data-pvc-rbd-img1.rbd.gz.gpg"),
        ];
        let text = render_listing(&rows);
        let lines: Vec<&str> = text.lines().collect();

        assert_eq!(lines[0], "Found 2 backup(s):");
        assert!(lines[4].starts_with("data-rbd-img1.rbd.gz.gpg"));
        assert!(!lines[4].ends_with('*'));
        assert!(lines[5].ends_with("rbd-img1 *"));
        assert!(text.ends_with("split is a guess\n"));
    }

    #[test]
    fn empty_listing_says_so() {
        assert_eq!(render_listing(&[]), "No backups found.\n");
    }
}
