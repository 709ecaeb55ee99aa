//! Pure key-naming codec for warehouse export objects.
//!
//! A table export lands in object storage as one `_HEADER_` shard plus zero
//! or more `_BODY_` shards under `<site_folder>/tmp/`. The reassembled
//! result leaves the staging area under a key carrying `_boxfolder_` /
//! `_fileid_` tags, which is what the downstream relay watches for. All
//! functions here are pure string work; no I/O.

/// Staging area path segment.
pub const STAGING_SEGMENT: &str = "tmp/";

/// Marker embedded in the first shard of a split export.
pub const HEADER_TAG: &str = "HEADER";

/// Marker embedded in every non-first shard.
pub const BODY_TAG: &str = "BODY";

/// Tags present only on already-reassembled, relay-ready keys. Their
/// presence forbids re-ingestion.
pub const RELAY_FOLDER_TAG: &str = "_boxfolder_";
pub const RELAY_FILE_TAG: &str = "_fileid_";

const EXPORT_STEM: &str = "_deidentified_recruitment_data_";
const BOX_FOLDER_PREFIX: &str = "box_folder_";
const FILE_ID_PREFIX: &str = "_file_id_";

const BOX_FOLDER_ID_LEN: usize = 12;
const FILE_ID_LEN: usize = 13;

/// Role a key plays in the export lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// First shard: carries the CSV column row and triggers reassembly.
    Header,
    /// Non-first shard of the same export.
    Body,
    /// Reassembled output, tagged for the relay.
    Final,
    /// Anything else. Not an error; such keys are simply ignored.
    Unrecognized,
}

/// Parsed facets of an object key. Facets are `None` when the key does not
/// match the strict export structure; classification alone never fails.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NamingTags {
    pub site_folder: Option<String>,
    pub site_name: Option<String>,
    pub box_folder_id: Option<String>,
    pub file_id: Option<String>,
    pub role: Role,
}

/// Structural decomposition of a staged header key. Only obtainable via
/// [`parse_header_key`], so holders can rely on the digit-length and
/// segment invariants.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeaderKeyParts {
    pub site_folder: String,
    pub site_name: String,
    pub box_folder_id: String,
    pub file_id: String,
}

impl HeaderKeyParts {
    /// Staging prefix shared by the header and its body shards.
    pub fn staging_prefix(&self) -> String {
        format!("{}/{}", self.site_folder, STAGING_SEGMENT)
    }

    /// Key of the reassembled output, outside the staging area. The shard
    /// markers are stripped and `box_folder`/`file_id` are renamed to the
    /// relay-tag spellings.
    pub fn output_key(&self) -> String {
        format!(
            "{}/{}{}boxfolder_{}_fileid_{}.csv",
            self.site_folder, self.site_name, EXPORT_STEM, self.box_folder_id, self.file_id
        )
    }

    /// Lease key for this export. Lives outside the staging prefix so it
    /// never shows up in the compose listing.
    pub fn lock_key(&self) -> String {
        format!("{}/.locks/{}.lock", self.site_folder, self.file_id)
    }

    /// Prefix for intermediate compose parts of this export. Like the
    /// lease it lives outside the staging prefix: a retried listing of
    /// `tmp/` must only ever see the untouched sources.
    pub fn parts_prefix(&self) -> String {
        format!("{}/.parts/{}/", self.site_folder, self.file_id)
    }
}

/// Classifies a key by its lifecycle role and extracts whatever facets the
/// key structure yields. Advisory: never errors, never panics.
pub fn classify(key: &str) -> NamingTags {
    let relay_tagged = key.contains(RELAY_FOLDER_TAG) || key.contains(RELAY_FILE_TAG);
    let staged = key.contains(STAGING_SEGMENT);

    let role = if relay_tagged {
        Role::Final
    } else if staged && key.contains(HEADER_TAG) {
        Role::Header
    } else if staged && key.contains(BODY_TAG) {
        Role::Body
    } else {
        Role::Unrecognized
    };

    match role {
        Role::Header | Role::Body => match parse_staged_key(key) {
            Some((parts, _)) => NamingTags {
                site_folder: Some(parts.site_folder),
                site_name: Some(parts.site_name),
                box_folder_id: Some(parts.box_folder_id),
                file_id: Some(parts.file_id),
                role,
            },
            None => NamingTags {
                site_folder: None,
                site_name: None,
                box_folder_id: None,
                file_id: None,
                role,
            },
        },
        Role::Final => {
            let ids = extract_relay_ids(key);
            NamingTags {
                site_folder: None,
                site_name: None,
                box_folder_id: ids.as_ref().map(|(folder, _)| folder.clone()),
                file_id: ids.map(|(_, file)| file),
                role,
            }
        }
        Role::Unrecognized => NamingTags {
            site_folder: None,
            site_name: None,
            box_folder_id: None,
            file_id: None,
            role,
        },
    }
}

/// Strictly parses a staged header key, requiring the exact structure
/// `<site_folder>/tmp/<site>_deidentified_recruitment_data_box_folder_<12 digits>_file_id_<13 digits>_HEADER_<digits>.csv`.
///
/// `None` means the output key cannot be derived safely and the caller must
/// abort the invocation rather than guess.
pub fn parse_header_key(key: &str) -> Option<HeaderKeyParts> {
    match parse_staged_key(key) {
        Some((parts, marker)) if marker == HEADER_TAG => Some(parts),
        _ => None,
    }
}

/// Derives the canonical output key from a staged header key.
pub fn derive_output_key(key: &str) -> Option<String> {
    parse_header_key(key).map(|parts| parts.output_key())
}

/// Pulls the relay ids out of an already-tagged key, validating digit
/// lengths. Both tags must be present.
pub fn extract_relay_ids(key: &str) -> Option<(String, String)> {
    let box_folder_id = digits_after(key, RELAY_FOLDER_TAG, BOX_FOLDER_ID_LEN)?;
    let file_id = digits_after(key, RELAY_FILE_TAG, FILE_ID_LEN)?;
    Some((box_folder_id.to_string(), file_id.to_string()))
}

/// Trigger predicate of the downstream relay process: keys it will pick up
/// once they leave the staging area.
pub fn is_relay_tagged(key: &str) -> bool {
    extract_relay_ids(key).is_some()
}

fn parse_staged_key(key: &str) -> Option<(HeaderKeyParts, &str)> {
    let mut segments = key.split('/');
    let site_folder = segments.next()?;
    let tmp = segments.next()?;
    let file_name = segments.next()?;
    if segments.next().is_some() || tmp != "tmp" || site_folder.is_empty() {
        return None;
    }

    let stem = format!("{EXPORT_STEM}{BOX_FOLDER_PREFIX}");
    let (before_stem, rest) = file_name.split_once(&stem)?;
    // Site name is the underscore-free run immediately before the stem.
    let site_name = before_stem.rsplit('_').next().filter(|s| !s.is_empty())?;

    let (box_folder_id, rest) = split_digits(rest, BOX_FOLDER_ID_LEN)?;
    let rest = rest.strip_prefix(FILE_ID_PREFIX)?;
    let (file_id, rest) = split_digits(rest, FILE_ID_LEN)?;

    let rest = rest.strip_prefix('_')?;
    let (marker, suffix) = if let Some(suffix) = rest.strip_prefix(HEADER_TAG) {
        (HEADER_TAG, suffix)
    } else if let Some(suffix) = rest.strip_prefix(BODY_TAG) {
        (BODY_TAG, suffix)
    } else {
        return None;
    };

    // Export shard counter, e.g. "_000000000000.csv". The counter may be
    // empty but must be all digits.
    let counter = suffix.strip_prefix('_')?.strip_suffix(".csv")?;
    if !counter.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }

    Some((
        HeaderKeyParts {
            site_folder: site_folder.to_string(),
            site_name: site_name.to_string(),
            box_folder_id: box_folder_id.to_string(),
            file_id: file_id.to_string(),
        },
        marker,
    ))
}

fn split_digits(input: &str, len: usize) -> Option<(&str, &str)> {
    let (digits, rest) = input.split_at_checked(len)?;
    if digits.bytes().all(|b| b.is_ascii_digit()) {
        Some((digits, rest))
    } else {
        None
    }
}

fn digits_after<'a>(key: &'a str, tag: &str, len: usize) -> Option<&'a str> {
    let idx = key.find(tag)?;
    let rest = &key[idx + tag.len()..];
    let digits = rest.get(..len)?;
    digits.bytes().all(|b| b.is_ascii_digit()).then_some(digits)
}
