//! Lifecycle configuration document
//!
//! The S3 `LifecycleConfiguration` XML grammar, parsed with quick-xml's
//! serde support. Unknown elements are rejected. `Lifecycle::parse` both
//! parses and validates; a document that parses here is valid.

use std::collections::{BTreeMap, HashSet};
use std::fmt;

use chrono::{DateTime, FixedOffset, Local, NaiveTime, Offset, Timelike, Utc};
use quick_xml::events::Event;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::{ApiErrorCode, Error, Result};
use crate::meta::StorageClass;

/// Most rules a document may carry.
pub const MAX_RULES: usize = 100;

/// Longest accepted rule id, in bytes.
pub const MAX_RULE_ID_LEN: usize = 255;

const ROOT: &str = "LifecycleConfiguration";

// =============================================================================
// Document Types
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename = "LifecycleConfiguration", deny_unknown_fields)]
pub struct Lifecycle {
    #[serde(rename = "@xmlns", default, skip_serializing_if = "Option::is_none")]
    pub xmlns: Option<String>,
    #[serde(rename = "Rule", default)]
    pub rules: Vec<Rule>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", deny_unknown_fields)]
pub struct Rule {
    #[serde(rename = "ID", default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default)]
    pub status: RuleStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filter: Option<Filter>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expiration: Option<Expiration>,
    #[serde(rename = "Transition", default, skip_serializing_if = "Vec::is_empty")]
    pub transitions: Vec<Transition>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub noncurrent_version_expiration: Option<NoncurrentVersionExpiration>,
    #[serde(
        rename = "NoncurrentVersionTransition",
        default,
        skip_serializing_if = "Vec::is_empty"
    )]
    pub noncurrent_version_transitions: Vec<NoncurrentVersionTransition>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub abort_incomplete_multipart_upload: Option<AbortIncompleteMultipartUpload>,
}

/// Rule status. Anything but the two accepted words is kept verbatim so
/// validation can reject it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuleStatus {
    Enabled,
    Disabled,
    Invalid(String),
}

impl Default for RuleStatus {
    fn default() -> Self {
        RuleStatus::Invalid(String::new())
    }
}

impl RuleStatus {
    pub fn as_str(&self) -> &str {
        match self {
            RuleStatus::Enabled => "Enabled",
            RuleStatus::Disabled => "Disabled",
            RuleStatus::Invalid(raw) => raw,
        }
    }
}

impl fmt::Display for RuleStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for RuleStatus {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for RuleStatus {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Ok(match raw.as_str() {
            "Enabled" => RuleStatus::Enabled,
            "Disabled" => RuleStatus::Disabled,
            _ => RuleStatus::Invalid(raw),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", deny_unknown_fields)]
pub struct Filter {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prefix: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tag: Option<Tag>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub and: Option<And>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", deny_unknown_fields)]
pub struct And {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prefix: Option<String>,
    #[serde(rename = "Tag", default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<Tag>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", deny_unknown_fields)]
pub struct Tag {
    pub key: String,
    #[serde(default)]
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", deny_unknown_fields)]
pub struct Expiration {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub days: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expired_object_delete_marker: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", deny_unknown_fields)]
pub struct Transition {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub days: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage_class: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", deny_unknown_fields)]
pub struct NoncurrentVersionExpiration {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub noncurrent_days: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", deny_unknown_fields)]
pub struct NoncurrentVersionTransition {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub noncurrent_days: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage_class: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", deny_unknown_fields)]
pub struct AbortIncompleteMultipartUpload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub days_after_initiation: Option<i64>,
}

/// Rules split by the kind of record they apply to. A rule may land in
/// more than one set.
#[derive(Debug, Clone, Default)]
pub struct RuleSets {
    pub current: Vec<Rule>,
    pub noncurrent: Vec<Rule>,
    pub abort: Vec<Rule>,
}

impl RuleSets {
    pub fn is_empty(&self) -> bool {
        self.current.is_empty() && self.noncurrent.is_empty() && self.abort.is_empty()
    }
}

// =============================================================================
// Parsing
// =============================================================================

fn malformed() -> Error {
    Error::Api(ApiErrorCode::MalformedXml)
}

/// Name of the first element of `xml`.
fn root_element(xml: &str) -> Result<String> {
    let mut reader = quick_xml::Reader::from_str(xml);
    loop {
        match reader.read_event().map_err(|_| malformed())? {
            Event::Start(e) | Event::Empty(e) => {
                return Ok(String::from_utf8_lossy(e.local_name().as_ref()).into_owned());
            }
            Event::Eof => return Err(malformed()),
            _ => {}
        }
    }
}

impl Lifecycle {
    /// Parse and validate a configuration document.
    pub fn parse(xml: &str) -> Result<Lifecycle> {
        if root_element(xml)? != ROOT {
            return Err(malformed());
        }
        let lifecycle: Lifecycle = quick_xml::de::from_str(xml).map_err(|_| malformed())?;
        lifecycle.validate()?;
        Ok(lifecycle)
    }

    /// Marshal back to XML.
    pub fn to_xml(&self) -> Result<String> {
        quick_xml::se::to_string(self).map_err(|e| Error::Codec(e.to_string()))
    }

    /// Check document and rule constraints. Returns the first violation in
    /// document order.
    pub fn validate(&self) -> Result<()> {
        if self.rules.is_empty() || self.rules.len() > MAX_RULES {
            return Err(Error::Api(ApiErrorCode::InvalidLcRulesNumbers));
        }
        for rule in &self.rules {
            rule.validate()?;
        }
        Ok(())
    }

    /// Split rules by the records they govern.
    pub fn filter_rules(&self) -> RuleSets {
        let mut sets = RuleSets::default();
        for rule in &self.rules {
            if rule.expiration.is_some() || !rule.transitions.is_empty() {
                sets.current.push(rule.clone());
            }
            if rule.noncurrent_version_expiration.is_some()
                || !rule.noncurrent_version_transitions.is_empty()
            {
                sets.noncurrent.push(rule.clone());
            }
            if rule.abort_incomplete_multipart_upload.is_some() {
                sets.abort.push(rule.clone());
            }
        }
        sets
    }

    /// Longest prefix shared by every enabled rule's filter prefix.
    pub fn common_prefix(&self) -> String {
        let prefixes: Vec<&str> = self
            .rules
            .iter()
            .filter(|r| r.status == RuleStatus::Enabled)
            .map(|r| r.prefix())
            .collect();
        common_prefix(&prefixes)
    }
}

/// Longest common prefix of `items`. Empty for an empty slice.
pub fn common_prefix(items: &[&str]) -> String {
    let (Some(&min), Some(&max)) = (items.iter().min(), items.iter().max()) else {
        return String::new();
    };
    let shared = min
        .bytes()
        .zip(max.bytes())
        .take_while(|(a, b)| a == b)
        .count();
    // Back off to a char boundary.
    let mut end = shared;
    while !min.is_char_boundary(end) {
        end -= 1;
    }
    min[..end].to_string()
}

// =============================================================================
// Rules
// =============================================================================

impl Rule {
    pub fn is_enabled(&self) -> bool {
        self.status == RuleStatus::Enabled
    }

    /// Key prefix the rule applies to. Empty matches every key.
    pub fn prefix(&self) -> &str {
        let Some(filter) = &self.filter else {
            return "";
        };
        if let Some(prefix) = &filter.prefix {
            return prefix;
        }
        filter
            .and
            .as_ref()
            .and_then(|and| and.prefix.as_deref())
            .unwrap_or("")
    }

    /// Tags an object must carry for the rule to apply.
    pub fn tags(&self) -> Vec<&Tag> {
        let Some(filter) = &self.filter else {
            return Vec::new();
        };
        if let Some(tag) = &filter.tag {
            return vec![tag];
        }
        filter
            .and
            .as_ref()
            .map(|and| and.tags.iter().collect())
            .unwrap_or_default()
    }

    /// Whether the rule's filter selects an object.
    pub fn matches(&self, name: &str, tags: &BTreeMap<String, String>) -> bool {
        name.starts_with(self.prefix())
            && self
                .tags()
                .iter()
                .all(|t| tags.get(&t.key) == Some(&t.value))
    }

    fn has_tags(&self) -> bool {
        !self.tags().is_empty()
    }

    fn validate(&self) -> Result<()> {
        if self.id.as_deref().map(str::len).unwrap_or(0) > MAX_RULE_ID_LEN {
            return Err(Error::Api(ApiErrorCode::InvalidLcRuleId));
        }
        if matches!(self.status, RuleStatus::Invalid(_)) {
            return Err(Error::Api(ApiErrorCode::InvalidLcRuleStatus));
        }
        if self.expiration.is_none()
            && self.transitions.is_empty()
            && self.noncurrent_version_expiration.is_none()
            && self.noncurrent_version_transitions.is_empty()
            && self.abort_incomplete_multipart_upload.is_none()
        {
            return Err(Error::Api(ApiErrorCode::LcMissingAction));
        }

        if let Some(expiration) = &self.expiration {
            expiration.validate()?;
        }
        for transition in &self.transitions {
            transition.validate()?;
        }
        if let Some(expiration) = &self.noncurrent_version_expiration {
            positive_days(expiration.noncurrent_days, ApiErrorCode::LcMissingNoncurrentDays)?;
        }
        for transition in &self.noncurrent_version_transitions {
            positive_days(transition.noncurrent_days, ApiErrorCode::LcMissingNoncurrentDays)?;
            storage_class(transition.storage_class.as_deref())?;
        }
        if let Some(abort) = &self.abort_incomplete_multipart_upload {
            positive_days(
                abort.days_after_initiation,
                ApiErrorCode::LcMissingDaysAfterInitiation,
            )?;
        }

        if let Some(filter) = &self.filter {
            filter.validate()?;
        }
        let marker_rule = self
            .expiration
            .as_ref()
            .map(|e| e.expired_object_delete_marker == Some(true))
            .unwrap_or(false);
        if self.has_tags() && (marker_rule || self.abort_incomplete_multipart_upload.is_some()) {
            return Err(Error::Api(ApiErrorCode::LcTagsNotAllowed));
        }
        Ok(())
    }
}

fn positive_days(days: Option<i64>, missing: ApiErrorCode) -> Result<i64> {
    match days {
        None => Err(Error::Api(missing)),
        Some(d) if d <= 0 => Err(Error::Api(ApiErrorCode::InvalidLcDays)),
        Some(d) => Ok(d),
    }
}

fn storage_class(name: Option<&str>) -> Result<StorageClass> {
    let name = name.ok_or(Error::Api(ApiErrorCode::LcMissingStorageClass))?;
    StorageClass::from_name(name).ok_or(Error::Api(ApiErrorCode::InvalidStorageClass))
}

// =============================================================================
// Actions
// =============================================================================

fn parse_date(raw: &str) -> Result<DateTime<FixedOffset>> {
    DateTime::parse_from_rfc3339(raw.trim()).map_err(|_| Error::Api(ApiErrorCode::InvalidLcDate))
}

fn is_midnight(time: NaiveTime) -> bool {
    time.num_seconds_from_midnight() == 0 && time.nanosecond() == 0
}

/// Expiration dates are accepted at midnight in their stated offset, at
/// midnight in the local offset, or at the legacy `16:00:00Z`.
fn expiration_date(raw: &str) -> Result<DateTime<Utc>> {
    let date = parse_date(raw)?;
    let utc = date.with_timezone(&Utc);
    let local_offset = Local::now().offset().fix();
    let legacy = NaiveTime::from_hms_opt(16, 0, 0);
    if is_midnight(date.time())
        || is_midnight(utc.with_timezone(&local_offset).time())
        || Some(utc.time()) == legacy
    {
        Ok(utc)
    } else {
        Err(Error::Api(ApiErrorCode::LcDateNotMidnight))
    }
}

/// Transition dates must be midnight UTC.
fn transition_date(raw: &str) -> Result<DateTime<Utc>> {
    let utc = parse_date(raw)?.with_timezone(&Utc);
    if is_midnight(utc.time()) {
        Ok(utc)
    } else {
        Err(Error::Api(ApiErrorCode::LcDateNotMidnight))
    }
}

impl Expiration {
    /// Parsed `Date`, if set and valid.
    pub fn date(&self) -> Option<DateTime<Utc>> {
        self.date.as_deref().and_then(|d| expiration_date(d).ok())
    }

    pub fn delete_marker(&self) -> bool {
        self.expired_object_delete_marker == Some(true)
    }

    fn validate(&self) -> Result<()> {
        let set = [
            self.days.is_some(),
            self.date.is_some(),
            self.expired_object_delete_marker.is_some(),
        ]
        .iter()
        .filter(|s| **s)
        .count();
        if set == 0 {
            return Err(Error::Api(ApiErrorCode::LcMissingAction));
        }
        if set > 1 {
            return Err(Error::Api(ApiErrorCode::InvalidLcUsingDateAndDays));
        }
        if let Some(days) = self.days {
            if days <= 0 {
                return Err(Error::Api(ApiErrorCode::InvalidLcDays));
            }
        }
        if let Some(date) = &self.date {
            expiration_date(date)?;
        }
        Ok(())
    }
}

impl Transition {
    pub fn date(&self) -> Option<DateTime<Utc>> {
        self.date.as_deref().and_then(|d| transition_date(d).ok())
    }

    /// Target class, if recognised.
    pub fn target(&self) -> Option<StorageClass> {
        self.storage_class.as_deref().and_then(StorageClass::from_name)
    }

    fn validate(&self) -> Result<()> {
        match (self.days, &self.date) {
            (Some(_), Some(_)) => return Err(Error::Api(ApiErrorCode::InvalidLcUsingDateAndDays)),
            (None, None) => return Err(Error::Api(ApiErrorCode::LcMissingAction)),
            (Some(days), None) if days <= 0 => {
                return Err(Error::Api(ApiErrorCode::InvalidLcDays))
            }
            (None, Some(date)) => {
                transition_date(date)?;
            }
            _ => {}
        }
        storage_class(self.storage_class.as_deref())?;
        Ok(())
    }
}

impl NoncurrentVersionTransition {
    pub fn target(&self) -> Option<StorageClass> {
        self.storage_class.as_deref().and_then(StorageClass::from_name)
    }
}

// =============================================================================
// Filters
// =============================================================================

impl Filter {
    /// At most one of `Prefix`, `Tag` and `And` may be set. An empty filter
    /// selects every key.
    fn validate(&self) -> Result<()> {
        let shapes = [self.prefix.is_some(), self.tag.is_some(), self.and.is_some()]
            .iter()
            .filter(|s| **s)
            .count();
        if shapes > 1 {
            return Err(Error::Api(ApiErrorCode::InvalidLcFilter));
        }
        if let Some(tag) = &self.tag {
            tag.validate()?;
        }
        if let Some(and) = &self.and {
            let mut seen = HashSet::new();
            for tag in &and.tags {
                tag.validate()?;
                if !seen.insert(tag.key.as_str()) {
                    return Err(Error::Api(ApiErrorCode::DuplicateLcTagKey));
                }
            }
        }
        Ok(())
    }
}

impl Tag {
    fn validate(&self) -> Result<()> {
        if self.key.is_empty() || self.key.len() > 128 || self.value.len() > 256 {
            return Err(Error::Api(ApiErrorCode::InvalidLcFilter));
        }
        Ok(())
    }
}
