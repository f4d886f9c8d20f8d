//! `ListBucketResult` XML parsing, grounded on `fromS3XML` /
//! `filesFromS3XML` in `include/types/fs/FSEntry.hpp` / `File.hpp`.

use serde::Deserialize;

use crate::error::{VaultError, VaultResult};

#[derive(Debug, Clone, Deserialize)]
pub struct ListBucketContent {
    #[serde(rename = "Key")]
    pub key: String,
    #[serde(rename = "Size")]
    pub size: u64,
    #[serde(rename = "LastModified")]
    pub last_modified: String,
    #[serde(rename = "ETag", default)]
    pub etag: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ListBucketResult {
    #[serde(rename = "Name", default)]
    pub name: Option<String>,
    #[serde(rename = "Prefix", default)]
    pub prefix: Option<String>,
    #[serde(rename = "IsTruncated", default)]
    pub is_truncated: bool,
    #[serde(rename = "NextContinuationToken", default)]
    pub next_continuation_token: Option<String>,
    #[serde(rename = "Contents", default)]
    pub contents: Vec<ListBucketContent>,
}

pub fn parse_list_bucket_result(xml: &str) -> VaultResult<ListBucketResult> {
    quick_xml::de::from_str(xml).map_err(|e| VaultError::Corrupt(format!("malformed ListBucketResult: {}", e)))
}

/// Derives the minimal set of ancestor directory paths implied by a flat
/// key listing, stripping the vault's object-key prefix first.
pub fn extract_directories(keys: &[String], strip_prefix: &str) -> Vec<String> {
    use std::collections::BTreeSet;
    let mut dirs: BTreeSet<String> = BTreeSet::new();
    for key in keys {
        let rel = key.strip_prefix(strip_prefix).unwrap_or(key);
        let mut parts: Vec<&str> = rel.split('/').collect();
        parts.pop();
        let mut acc = String::new();
        for part in parts {
            if part.is_empty() {
                continue;
            }
            if !acc.is_empty() {
                acc.push('/');
            }
            acc.push_str(part);
            dirs.insert(acc.clone());
        }
    }
    dirs.into_iter().collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_contents_and_truncation_flag() {
        let xml = r#"<?xml version="1.0" encoding="UTF-8"?>
<ListBucketResult xmlns="http://s3.amazonaws.com/doc/2006-03-01/">
    <Name>my-bucket</Name>
    <Prefix>vaults/1/</Prefix>
    <IsTruncated>false</IsTruncated>
    <Contents>
        <Key>vaults/1/docs/a.txt</Key>
        <Size>3</Size>
        <LastModified>2023-01-01T00:00:00.000Z</LastModified>
        <ETag>"abc"</ETag>
    </Contents>
</ListBucketResult>"#;
        let result = parse_list_bucket_result(xml).unwrap();
        assert_eq!(result.contents.len(), 1);
        assert_eq!(result.contents[0].key, "vaults/1/docs/a.txt");
        assert_eq!(result.contents[0].size, 3);
        assert!(!result.is_truncated);
    }

    #[test]
    fn extract_directories_derives_minimal_ancestor_set() {
        let keys = vec![
            "vaults/1/docs/a.txt".to_string(),
            "vaults/1/docs/sub/b.txt".to_string(),
        ];
        let dirs = extract_directories(&keys, "vaults/1/");
        assert_eq!(dirs, vec!["docs".to_string(), "docs/sub".to_string()]);
    }
}
