//! Listing normalization.
//!
//! Backends that page natively (marker, continuation token, `nextFileName`,
//! Dropbox cursor) hand their raw cursor to [`ListResult::from_parts`].
//! Backends that only return a full listing (GitHub tree, WebDAV PROPFIND,
//! local directories) emulate the delimiter with [`partition_by_delimiter`]
//! and page the result with [`paginate`], whose cursor is the last key
//! returned on the previous page.

use std::collections::BTreeSet;

use cloudshelf_core::types::{FolderEntry, ListOptions, ListResult, ObjectEntry};

/// Split a flat set of objects into those directly under `prefix` and the
/// first-level common prefixes below it. With an empty delimiter every object
/// under the prefix is returned and no folders are produced.
pub fn partition_by_delimiter(
    entries: impl IntoIterator<Item = ObjectEntry>,
    prefix: &str,
    delimiter: &str,
) -> (Vec<ObjectEntry>, Vec<FolderEntry>) {
    let mut files = Vec::new();
    let mut folders = BTreeSet::new();

    for entry in entries {
        let Some(rest) = entry.key.strip_prefix(prefix) else {
            continue;
        };
        if delimiter.is_empty() {
            files.push(entry);
            continue;
        }
        match rest.find(delimiter) {
            Some(pos) => {
                let end = prefix.len() + pos + delimiter.len();
                folders.insert(entry.key[..end].to_string());
            }
            None if !rest.is_empty() => files.push(entry),
            None => {}
        }
    }

    files.sort_by(|a, b| a.key.cmp(&b.key));
    let folders = folders
        .into_iter()
        .map(|key| FolderEntry {
            key,
            is_folder: true,
        })
        .collect();
    (files, folders)
}

/// Page a complete, partitioned listing.
///
/// Files and folders are merged into one key-ordered sequence; the cursor is
/// the last key emitted, so each call resumes strictly after it and every
/// entry is returned exactly once regardless of `max_keys`.
pub fn paginate(
    files: Vec<ObjectEntry>,
    folders: Vec<FolderEntry>,
    options: &ListOptions,
) -> ListResult {
    enum Item {
        File(ObjectEntry),
        Folder(FolderEntry),
    }

    impl Item {
        fn key(&self) -> &str {
            match self {
                Item::File(f) => &f.key,
                Item::Folder(f) => &f.key,
            }
        }
    }

    let mut items: Vec<Item> = files
        .into_iter()
        .map(Item::File)
        .chain(folders.into_iter().map(Item::Folder))
        .collect();
    items.sort_by(|a, b| a.key().cmp(b.key()));

    let after = options.continuation_token.as_deref();
    let page_size = options.page_size() as usize;

    let mut remaining = items
        .into_iter()
        .filter(|item| after.is_none_or(|after| item.key() > after))
        .peekable();

    let mut page_files = Vec::new();
    let mut page_folders = Vec::new();
    let mut last_key = None;
    for item in remaining.by_ref().take(page_size) {
        last_key = Some(item.key().to_string());
        match item {
            Item::File(f) => page_files.push(f),
            Item::Folder(f) => page_folders.push(f),
        }
    }

    let next = if remaining.peek().is_some() {
        last_key
    } else {
        None
    };
    ListResult::from_parts(page_files, page_folders, next)
}

/// Directory part of a listing prefix: everything before its last `/`.
pub fn directory_of(prefix: &str) -> &str {
    match prefix.rfind('/') {
        Some(pos) => &prefix[..pos],
        None => "",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entries(keys: &[&str]) -> Vec<ObjectEntry> {
        keys.iter().map(|k| ObjectEntry::new(*k, 1)).collect()
    }

    #[test]
    fn test_partition_first_level() {
        let (files, folders) = partition_by_delimiter(
            entries(&["a.txt", "img/1.png", "img/sub/2.png", "docs/x.md", "z.txt"]),
            "",
            "/",
        );
        let names: Vec<_> = files.iter().map(|f| f.key.as_str()).collect();
        assert_eq!(names, ["a.txt", "z.txt"]);
        let dirs: Vec<_> = folders.iter().map(|f| f.key.as_str()).collect();
        assert_eq!(dirs, ["docs/", "img/"]);
    }

    #[test]
    fn test_partition_under_prefix() {
        let (files, folders) = partition_by_delimiter(
            entries(&["img/1.png", "img/sub/2.png", "imgx/3.png", "a.txt"]),
            "img/",
            "/",
        );
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].key, "img/1.png");
        assert_eq!(folders, vec![FolderEntry::new("img/sub/")]);
    }

    #[test]
    fn test_partition_without_delimiter_is_recursive() {
        let (files, folders) =
            partition_by_delimiter(entries(&["img/1.png", "img/sub/2.png", "a"]), "img/", "");
        assert_eq!(files.len(), 2);
        assert!(folders.is_empty());
    }

    #[test]
    fn test_paginate_enumerates_each_key_once() {
        let keys: Vec<String> = (0..25).map(|i| format!("k{i:02}")).collect();
        let all: Vec<&str> = keys.iter().map(String::as_str).collect();
        let (files, folders) = partition_by_delimiter(entries(&all), "", "/");

        let mut options = ListOptions {
            max_keys: 10,
            ..ListOptions::default()
        };
        let mut seen = Vec::new();
        let mut pages = 0;
        loop {
            let page = paginate(files.clone(), folders.clone(), &options);
            pages += 1;
            assert_eq!(page.is_truncated, page.next_continuation_token.is_some());
            seen.extend(page.files.into_iter().map(|f| f.key));
            match page.next_continuation_token {
                Some(token) => options = options.resume(Some(token)),
                None => break,
            }
        }
        assert_eq!(pages, 3);
        assert_eq!(seen, keys);
    }

    #[test]
    fn test_paginate_exact_multiple_has_no_empty_trailing_page() {
        let (files, folders) = partition_by_delimiter(entries(&["a", "b"]), "", "/");
        let options = ListOptions {
            max_keys: 2,
            ..ListOptions::default()
        };
        let page = paginate(files, folders, &options);
        assert!(!page.is_truncated);
        assert_eq!(page.files.len(), 2);
    }

    #[test]
    fn test_directory_of() {
        assert_eq!(directory_of("img/sub/x"), "img/sub");
        assert_eq!(directory_of("img/"), "img");
        assert_eq!(directory_of("x"), "");
    }
}
