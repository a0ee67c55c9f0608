use std::fs::File;
use std::io::{BufReader, Read, Seek};
use std::path::{Path, PathBuf};

use xml::reader::{EventReader, XmlEvent};

use crate::error::{HostlabError, Result};

pub const RESULT_TAG: &str = "Result";
pub const BUILD_TAG: &str = "Build";
pub const SUMMARY_TAG: &str = "Summary";
pub const MODULE_TAG: &str = "Module";
pub const TESTCASE_TAG: &str = "TestCase";
pub const TEST_TAG: &str = "Test";

pub const NAME_ATTR_KEY: &str = "name";
pub const ABI_ATTR_KEY: &str = "abi";
pub const RESULT_ATTR_KEY: &str = "result";

pub const SUITE_NAME_ATTR_KEY: &str = "suite_name";
pub const SUITE_PLAN_ATTR_KEY: &str = "suite_plan";
pub const SUITE_VERSION_ATTR_KEY: &str = "suite_version";
pub const SUITE_BUILD_NUM_ATTR_KEY: &str = "suite_build_number";
pub const START_DISPLAY_TIME_ATTR_KEY: &str = "start_display";
pub const END_DISPLAY_TIME_ATTR_KEY: &str = "end_display";
pub const START_TIME_ATTR_KEY: &str = "start";
pub const END_TIME_ATTR_KEY: &str = "end";
pub const HOST_NAME_ATTR_KEY: &str = "host_name";

pub const FINGERPRINT_ATTR_KEY: &str = "build_fingerprint";
pub const SYSTEM_FINGERPRINT_ATTR_KEY: &str = "build_system_fingerprint";
pub const VENDOR_FINGERPRINT_ATTR_KEY: &str = "build_vendor_fingerprint";

pub const PASSED_ATTR_KEY: &str = "pass";
pub const FAILED_ATTR_KEY: &str = "failed";
pub const MODULES_TOTAL_ATTR_KEY: &str = "modules_total";
pub const MODULES_DONE_ATTR_KEY: &str = "modules_done";

pub const RESULT_ATTR_KEYS: &[&str] = &[
    SUITE_NAME_ATTR_KEY,
    SUITE_PLAN_ATTR_KEY,
    SUITE_VERSION_ATTR_KEY,
    SUITE_BUILD_NUM_ATTR_KEY,
    START_DISPLAY_TIME_ATTR_KEY,
    END_DISPLAY_TIME_ATTR_KEY,
    START_TIME_ATTR_KEY,
    END_TIME_ATTR_KEY,
    HOST_NAME_ATTR_KEY,
];

pub const BUILD_ATTR_KEYS: &[&str] = &[
    FINGERPRINT_ATTR_KEY,
    SYSTEM_FINGERPRINT_ATTR_KEY,
    VENDOR_FINGERPRINT_ATTR_KEY,
];

pub const SUMMARY_ATTR_KEYS: &[&str] = &[
    PASSED_ATTR_KEY,
    FAILED_ATTR_KEY,
    MODULES_TOTAL_ATTR_KEY,
    MODULES_DONE_ATTR_KEY,
];

/// Requested attributes of the first element carrying `tag`, in key order.
/// Keys absent from the element (or an absent element) read as "".
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttributeGroup {
    pub tag: &'static str,
    pub values: Vec<(&'static str, String)>,
}

impl AttributeGroup {
    fn empty(tag: &'static str, keys: &[&'static str]) -> Self {
        Self {
            tag,
            values: keys.iter().map(|k| (*k, String::new())).collect(),
        }
    }

    pub fn get(&self, key: &str) -> &str {
        self.values
            .iter()
            .find(|(k, _)| *k == key)
            .map(|(_, v)| v.as_str())
            .unwrap_or("")
    }
}

/// Reads the attribute group for `tag` from the start of `reader`.
pub fn read_attribute_group<R: Read>(
    reader: R,
    tag: &'static str,
    keys: &[&'static str],
) -> std::result::Result<AttributeGroup, xml::reader::Error> {
    let mut group = AttributeGroup::empty(tag, keys);
    for event in EventReader::new(reader) {
        if let XmlEvent::StartElement {
            name, attributes, ..
        } = event?
        {
            if name.local_name != tag {
                continue;
            }
            for attr in attributes {
                if let Some(slot) = group
                    .values
                    .iter_mut()
                    .find(|(k, _)| *k == attr.name.local_name)
                {
                    slot.1 = attr.value;
                }
            }
            break;
        }
    }
    Ok(group)
}

/// Raw string attributes of a descriptor; never fails on missing keys.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DescriptorAttributes {
    pub result: AttributeGroup,
    pub build: AttributeGroup,
    pub summary: AttributeGroup,
}

impl DescriptorAttributes {
    pub fn from_path(path: &Path) -> Result<Self> {
        let file = File::open(path)
            .map_err(|e| HostlabError::malformed(path, format!("cannot open: {}", e)))?;
        let mut reader = BufReader::new(file);
        Self::from_reader(&mut reader, path)
    }

    /// `origin` only labels errors; `reader` may be an in-memory copy.
    pub fn from_reader<R: Read + Seek>(reader: &mut R, origin: &Path) -> Result<Self> {
        let result = query_group(reader, origin, RESULT_TAG, RESULT_ATTR_KEYS)?;
        let build = query_group(reader, origin, BUILD_TAG, BUILD_ATTR_KEYS)?;
        let summary = query_group(reader, origin, SUMMARY_TAG, SUMMARY_ATTR_KEYS)?;
        Ok(Self {
            result,
            build,
            summary,
        })
    }

    pub fn groups(&self) -> [&AttributeGroup; 3] {
        [&self.result, &self.build, &self.summary]
    }

    /// `pass + failed`, or `None` when either count is missing, non-numeric
    /// or the sum does not fit.
    pub fn reported_test_count(&self) -> Option<u64> {
        let passed = self.summary.get(PASSED_ATTR_KEY).trim().parse::<u64>().ok()?;
        let failed = self.summary.get(FAILED_ATTR_KEY).trim().parse::<u64>().ok()?;
        passed.checked_add(failed)
    }
}

fn query_group<R: Read + Seek>(
    reader: &mut R,
    origin: &Path,
    tag: &'static str,
    keys: &[&'static str],
) -> Result<AttributeGroup> {
    reader
        .rewind()
        .map_err(|e| HostlabError::malformed(origin, format!("cannot rewind: {}", e)))?;
    read_attribute_group(&mut *reader, tag, keys)
        .map_err(|e| HostlabError::malformed(origin, format!("<{}>: {}", tag, e)))
}

/// Counters and identifiers a retry decision needs. Immutable once parsed;
/// parsing a changed file yields a new value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResultSummary {
    pub path: PathBuf,
    pub suite_plan: String,
    pub passed_count: Option<u64>,
    pub failed_count: u64,
    pub modules_total: u64,
    pub modules_done: u64,
    pub attributes: DescriptorAttributes,
}

impl ResultSummary {
    pub fn from_path(path: &Path) -> Result<Self> {
        let attributes = DescriptorAttributes::from_path(path)?;
        Self::from_attributes(attributes, path)
    }

    pub fn from_attributes(attributes: DescriptorAttributes, path: &Path) -> Result<Self> {
        let suite_plan = attributes.result.get(SUITE_PLAN_ATTR_KEY).trim().to_string();
        if suite_plan.is_empty() {
            return Err(HostlabError::malformed(
                path,
                format!("<{}> has no {}", RESULT_TAG, SUITE_PLAN_ATTR_KEY),
            ));
        }
        let failed_count = required_count(&attributes.summary, FAILED_ATTR_KEY, path)?;
        let modules_total = required_count(&attributes.summary, MODULES_TOTAL_ATTR_KEY, path)?;
        let modules_done = required_count(&attributes.summary, MODULES_DONE_ATTR_KEY, path)?;
        if modules_done > modules_total {
            return Err(HostlabError::malformed(
                path,
                format!(
                    "{}={} exceeds {}={}",
                    MODULES_DONE_ATTR_KEY, modules_done, MODULES_TOTAL_ATTR_KEY, modules_total
                ),
            ));
        }
        let passed_count = attributes
            .summary
            .get(PASSED_ATTR_KEY)
            .trim()
            .parse::<u64>()
            .ok();
        Ok(Self {
            path: path.to_path_buf(),
            suite_plan,
            passed_count,
            failed_count,
            modules_total,
            modules_done,
            attributes,
        })
    }

    pub fn skipped_modules(&self) -> u64 {
        self.modules_total - self.modules_done
    }

    /// Every module ran and nothing failed.
    pub fn is_complete_pass(&self) -> bool {
        self.failed_count == 0 && self.skipped_modules() == 0
    }

    pub fn suite_name(&self) -> &str {
        self.attributes.result.get(SUITE_NAME_ATTR_KEY)
    }

    pub fn host_name(&self) -> &str {
        self.attributes.result.get(HOST_NAME_ATTR_KEY)
    }
}

fn required_count(group: &AttributeGroup, key: &str, path: &Path) -> Result<u64> {
    let raw = group.get(key).trim();
    if raw.is_empty() {
        return Err(HostlabError::malformed(
            path,
            format!("<{}> has no {}", group.tag, key),
        ));
    }
    raw.parse::<u64>().map_err(|_| {
        HostlabError::malformed(
            path,
            format!("<{}> {}='{}' is not a count", group.tag, key, raw),
        )
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    const DESCRIPTOR: &str = r#"<?xml version='1.0' encoding='UTF-8' standalone='no' ?>
<Result start="1528700000000" end="1528703600000" start_display="Mon Jun 11 06:53:20 UTC 2018" end_display="Mon Jun 11 07:53:20 UTC 2018" suite_name="VTS" suite_version="9.0_R1" suite_plan="vts-hal" suite_build_number="4755383" host_name="lab-host-3">
  <Build build_fingerprint="google/walleye/walleye:P/PPR1/1:userdebug/dev-keys" build_system_fingerprint="sys-fp" build_vendor_fingerprint="vendor-fp" />
  <Summary pass="120" failed="2" modules_done="9" modules_total="10" />
  <Module name="VtsHalAudioV4_0Target" abi="arm64-v8a" done="true">
    <TestCase name="AudioHidlTest">
      <Test result="pass" name="OpenPrimaryDevice" />
    </TestCase>
  </Module>
</Result>
"#;

    #[test]
    fn parses_counts_and_derives_skipped_modules() {
        let mut reader = Cursor::new(DESCRIPTOR.as_bytes().to_vec());
        let attrs = DescriptorAttributes::from_reader(&mut reader, Path::new("mem.xml"))
            .expect("attributes should parse");
        let summary = ResultSummary::from_attributes(attrs, Path::new("mem.xml"))
            .expect("summary should parse");
        assert_eq!(summary.suite_plan, "vts-hal");
        assert_eq!(summary.failed_count, 2);
        assert_eq!(summary.skipped_modules(), 1);
        assert_eq!(summary.passed_count, Some(120));
        assert!(!summary.is_complete_pass());
        assert_eq!(summary.suite_name(), "VTS");
        assert_eq!(summary.host_name(), "lab-host-3");
        assert_eq!(summary.attributes.build.get(VENDOR_FINGERPRINT_ATTR_KEY), "vendor-fp");
    }

    #[test]
    fn groups_on_different_elements_are_all_found() {
        // Summary precedes Result's children here; each query starts over.
        let xml = r#"<Result suite_plan="cts"><Summary failed="0" modules_total="1" modules_done="1"/><Build build_fingerprint="fp"/></Result>"#;
        let mut reader = Cursor::new(xml.as_bytes().to_vec());
        let attrs = DescriptorAttributes::from_reader(&mut reader, Path::new("mem.xml"))
            .expect("attributes should parse");
        assert_eq!(attrs.build.get(FINGERPRINT_ATTR_KEY), "fp");
        assert_eq!(attrs.summary.get(MODULES_DONE_ATTR_KEY), "1");
        assert_eq!(attrs.result.get(SUITE_PLAN_ATTR_KEY), "cts");
    }

    #[test]
    fn missing_pass_count_is_optional_but_failed_is_required() {
        let ok = r#"<Result suite_plan="vts"><Summary failed="0" modules_total="3" modules_done="3"/></Result>"#;
        let mut reader = Cursor::new(ok.as_bytes().to_vec());
        let attrs = DescriptorAttributes::from_reader(&mut reader, Path::new("ok.xml"))
            .expect("attributes should parse");
        assert_eq!(attrs.reported_test_count(), None);
        let summary =
            ResultSummary::from_attributes(attrs, Path::new("ok.xml")).expect("summary");
        assert_eq!(summary.passed_count, None);
        assert!(summary.is_complete_pass());

        let bad = r#"<Result suite_plan="vts"><Summary modules_total="3" modules_done="3"/></Result>"#;
        let mut reader = Cursor::new(bad.as_bytes().to_vec());
        let attrs = DescriptorAttributes::from_reader(&mut reader, Path::new("bad.xml"))
            .expect("attributes should parse");
        let err = ResultSummary::from_attributes(attrs, Path::new("bad.xml"))
            .expect_err("missing failed count must be rejected");
        assert_eq!(err.kind(), "malformed_descriptor");
        assert!(err.to_string().contains(FAILED_ATTR_KEY));
    }

    #[test]
    fn reported_test_count_is_none_when_the_sum_overflows() {
        let xml = r#"<Result suite_plan="vts"><Summary pass="18446744073709551615" failed="1" modules_total="1" modules_done="1"/></Result>"#;
        let mut reader = Cursor::new(xml.as_bytes().to_vec());
        let attrs = DescriptorAttributes::from_reader(&mut reader, Path::new("huge.xml"))
            .expect("attributes should parse");
        assert_eq!(attrs.reported_test_count(), None);

        let xml = r#"<Result suite_plan="vts"><Summary pass="18446744073709551614" failed="1" modules_total="1" modules_done="1"/></Result>"#;
        let mut reader = Cursor::new(xml.as_bytes().to_vec());
        let attrs = DescriptorAttributes::from_reader(&mut reader, Path::new("max.xml"))
            .expect("attributes should parse");
        assert_eq!(attrs.reported_test_count(), Some(u64::MAX));
    }

    #[test]
    fn more_modules_done_than_total_is_malformed() {
        let xml = r#"<Result suite_plan="vts"><Summary failed="0" modules_total="3" modules_done="4"/></Result>"#;
        let mut reader = Cursor::new(xml.as_bytes().to_vec());
        let attrs = DescriptorAttributes::from_reader(&mut reader, Path::new("neg.xml"))
            .expect("attributes should parse");
        let err = ResultSummary::from_attributes(attrs, Path::new("neg.xml"))
            .expect_err("negative skipped count must be rejected");
        assert!(err.to_string().contains("exceeds"));
    }

    #[test]
    fn broken_xml_is_malformed() {
        let mut reader = Cursor::new(b"<Result suite_plan=\"vts\"><Summary".to_vec());
        let err = DescriptorAttributes::from_reader(&mut reader, Path::new("broken.xml"))
            .expect_err("truncated xml must fail");
        assert_eq!(err.kind(), "malformed_descriptor");
    }
}
